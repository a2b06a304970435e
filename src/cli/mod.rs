pub mod close;
pub mod create;
pub mod default;
pub mod grant;
pub mod lifecycle;
pub mod list;
pub mod migrate;
pub mod modify;
pub mod open;
pub mod props;
pub mod save;
pub mod svcprops;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::bridge::NotificationRegistry;
use crate::config::ToolConfig;
use crate::engine::Engine;
use crate::session::SessionTable;

/// Everything a command acts on.
pub struct Context {
    pub engine: Arc<dyn Engine>,
    pub registry: Arc<NotificationRegistry>,
    pub sessions: SessionTable,
    pub config: ToolConfig,
}

impl Context {
    pub fn new(engine: Arc<dyn Engine>, config: ToolConfig) -> Self {
        Self {
            engine,
            registry: Arc::new(NotificationRegistry::new()),
            sessions: SessionTable::new(),
            config,
        }
    }

    /// Wait budget for a callback-completed verb. Zero waits without bound.
    pub fn timeout(&self, override_ms: Option<u64>) -> Option<Duration> {
        match override_ms.unwrap_or(self.config.timeout_ms) {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn migration_timeout(&self, override_ms: Option<u64>) -> Option<Duration> {
        match override_ms {
            Some(0) => None,
            Some(ms) => Some(Duration::from_millis(ms)),
            None => self.config.migration_timeout(),
        }
    }
}

/// Selects the session a command acts on and how long it may wait.
#[derive(Debug, Clone, Default, clap::Args)]
pub struct Target {
    /// Compute system to operate on instead of the default
    #[arg(long = "cs", value_name = "ID")]
    pub cs: Option<String>,

    /// Wait budget in milliseconds (0 waits without bound)
    #[arg(long, value_name = "MS")]
    pub timeout_ms: Option<u64>,
}

impl Target {
    pub fn system(id: &str) -> Self {
        Self {
            cs: Some(id.to_string()),
            timeout_ms: None,
        }
    }
}

/// The engine wants absolute paths.
pub(crate) fn absolute(path: &Path) -> std::io::Result<PathBuf> {
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(std::env::current_dir()?.join(path))
    }
}
