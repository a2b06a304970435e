pub mod bridge;
pub mod cli;
pub mod config;
pub mod engine;
pub mod error;
pub mod format;
pub mod schema;
pub mod session;
pub mod shell;

pub use error::{HcsError, Result};
