//! The host compute engine, seen as a capability set.
//!
//! Command code only ever talks to [`Engine`]. The `vmcompute` backend binds
//! the platform libraries on Windows; the `sim` backend is an in-process host
//! that follows the same asynchronous protocol.

pub mod sim;
#[cfg(windows)]
pub mod vmcompute;

pub use sim::{SimEngine, SimFault};

use crate::bridge::{CallbackAdapter, CorrelationKey, NotificationData, NotificationType};
use crate::config::Backend;
use std::fmt;
use std::net::{SocketAddr, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// HRESULTs the tool gives meaning to.
pub mod hresult {
    pub const S_OK: u32 = 0;
    pub const FAIL: u32 = 0x8000_4005;
    pub const ACCESS_DENIED: u32 = 0x8007_0005;
    pub const INVALID_ARG: u32 = 0x8007_0057;
    pub const ALREADY_EXISTS: u32 = 0x8007_00B7;
    pub const TIMEOUT: u32 = 0x8007_05B4;
    pub const OPERATION_PENDING: u32 = 0xC037_0103;
    pub const INVALID_STATE: u32 = 0xC037_0105;
    pub const INVALID_JSON: u32 = 0xC037_010D;
    pub const SYSTEM_NOT_FOUND: u32 = 0xC037_010E;
    pub const ALREADY_STOPPED: u32 = 0xC037_0110;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SystemHandle(pub usize);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CallbackToken(pub usize);

/// Synchronous acknowledgement of an asynchronous call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallStatus {
    Completed,
    Pending,
}

/// A failed engine call, with whatever result document the engine returned.
#[derive(Debug, Error)]
pub struct EngineError {
    pub call: &'static str,
    pub hresult: u32,
    pub detail: Option<NotificationData>,
}

impl EngineError {
    pub fn new(call: &'static str, hresult: u32) -> Self {
        Self {
            call,
            hresult,
            detail: None,
        }
    }

    /// Attach the engine's result document. A document that does not parse is
    /// dropped; the HRESULT alone still identifies the failure.
    pub fn with_result(call: &'static str, hresult: u32, document: Option<&str>) -> Self {
        let detail = NotificationData::parse(document).ok().flatten();
        Self { call, hresult, detail }
    }

    pub fn with_message(call: &'static str, hresult: u32, message: impl Into<String>) -> Self {
        Self {
            call,
            hresult,
            detail: Some(NotificationData {
                error: hresult as i32,
                error_message: message.into(),
                error_events: Vec::new(),
            }),
        }
    }
}

impl fmt::Display for EngineError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} failed with HRESULT {:#010x}", self.call, self.hresult)?;
        if let Some(summary) = self.detail.as_ref().and_then(NotificationData::summary) {
            write!(f, ": {}", summary)?;
        }
        Ok(())
    }
}

/// Asynchronous verbs completed through the notification callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Verb {
    Create,
    Start,
    Shutdown,
    Terminate,
    Pause,
    Resume,
    Save,
    Modify,
}

impl Verb {
    /// The notification that marks this verb as finished.
    pub fn terminal_notification(self) -> NotificationType {
        match self {
            Verb::Create => NotificationType::SystemCreateCompleted,
            Verb::Start => NotificationType::SystemStartCompleted,
            Verb::Shutdown | Verb::Terminate => NotificationType::SystemExited,
            Verb::Pause => NotificationType::SystemPauseCompleted,
            Verb::Resume => NotificationType::SystemResumeCompleted,
            Verb::Save => NotificationType::SystemSaveCompleted,
            Verb::Modify => NotificationType::SystemModifyCompleted,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Verb::Create => "create",
            Verb::Start => "start",
            Verb::Shutdown => "shutdown",
            Verb::Terminate => "terminate",
            Verb::Pause => "pause",
            Verb::Resume => "resume",
            Verb::Save => "save",
            Verb::Modify => "modify",
        }
    }
}

impl fmt::Display for Verb {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Live migration steps, completed through operation handles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, clap::ValueEnum)]
pub enum MigrationPhase {
    Initialize,
    Start,
    Transfer,
    Finalize,
}

impl MigrationPhase {
    pub fn name(self) -> &'static str {
        match self {
            MigrationPhase::Initialize => "migrate initialize",
            MigrationPhase::Start => "migrate start",
            MigrationPhase::Transfer => "migrate transfer",
            MigrationPhase::Finalize => "migrate finalize",
        }
    }

    pub fn needs_transport(self) -> bool {
        matches!(self, MigrationPhase::Start)
    }
}

impl fmt::Display for MigrationPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// The byte pipe migration state travels over. The engine drives it; the tool
/// only establishes the connection and hands it over.
#[derive(Debug)]
pub struct MigrationTransport {
    stream: TcpStream,
    peer: SocketAddr,
}

impl MigrationTransport {
    /// Connect to the first reachable address `addr` resolves to. Each
    /// attempt gives up after `timeout`; `None` leaves it to the OS.
    pub fn connect(addr: impl ToSocketAddrs, timeout: Option<Duration>) -> std::io::Result<Self> {
        let mut last = None;
        for candidate in addr.to_socket_addrs()? {
            let attempt = match timeout {
                Some(timeout) if !timeout.is_zero() => TcpStream::connect_timeout(&candidate, timeout),
                _ => TcpStream::connect(candidate),
            };
            match attempt {
                Ok(stream) => {
                    tracing::info!("Migration transport connected to {}", candidate);
                    return Ok(Self { stream, peer: candidate });
                }
                Err(e) => {
                    tracing::debug!("Migration transport connect to {} failed: {}", candidate, e);
                    last = Some(e);
                }
            }
        }
        Err(last.unwrap_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "address resolved to nothing")
        }))
    }

    pub fn stream(&self) -> &TcpStream {
        &self.stream
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }
}

/// Outcome of a handle-based operation: its HRESULT and result document.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationResult {
    pub status: u32,
    pub document: Option<String>,
}

/// An in-flight handle-based engine operation.
pub trait OperationHandle: Send {
    /// Block until the operation finishes or `timeout` elapses. `None` waits
    /// without bound. An elapsed timeout is reported as [`hresult::TIMEOUT`].
    fn wait(&mut self, timeout: Option<Duration>) -> OperationResult;
}

pub trait Engine: Send + Sync {
    fn name(&self) -> &'static str;

    fn create_system(&self, id: &str, configuration: &str) -> Result<(SystemHandle, CallStatus), EngineError>;

    fn open_system(&self, id: &str) -> Result<SystemHandle, EngineError>;

    fn close_system(&self, handle: SystemHandle) -> Result<(), EngineError>;

    /// Issue `verb` against an open system. [`Verb::Create`] goes through
    /// [`Engine::create_system`] instead.
    fn invoke(&self, verb: Verb, handle: SystemHandle, options: &str) -> Result<CallStatus, EngineError>;

    fn register_callback(
        &self,
        handle: SystemHandle,
        adapter: CallbackAdapter,
        key: CorrelationKey,
    ) -> Result<CallbackToken, EngineError>;

    fn unregister_callback(&self, token: CallbackToken) -> Result<(), EngineError>;

    fn properties(&self, handle: SystemHandle, query: &str) -> Result<String, EngineError>;

    fn enumerate_systems(&self, query: &str) -> Result<String, EngineError>;

    fn service_properties(&self, query: &str) -> Result<String, EngineError>;

    fn grant_vm_access(&self, vm_id: &str, path: &Path) -> Result<(), EngineError>;

    fn begin_migration(
        &self,
        id: &str,
        phase: MigrationPhase,
        options: &str,
        transport: Option<&MigrationTransport>,
    ) -> Result<Box<dyn OperationHandle>, EngineError>;
}

/// Pick the engine backend for this host.
pub fn select(backend: Backend) -> anyhow::Result<Arc<dyn Engine>> {
    match backend {
        Backend::Sim => Ok(Arc::new(SimEngine::new())),
        #[cfg(windows)]
        Backend::Auto | Backend::Vmcompute => Ok(Arc::new(vmcompute::VmcomputeEngine::new())),
        #[cfg(not(windows))]
        Backend::Auto => {
            tracing::info!("vmcompute is not available on this platform, using the simulated engine");
            Ok(Arc::new(SimEngine::new()))
        }
        #[cfg(not(windows))]
        Backend::Vmcompute => anyhow::bail!("the vmcompute backend is only available on Windows"),
    }
}
