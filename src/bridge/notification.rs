use serde::{Deserialize, Serialize};
use std::fmt;

use super::ProtocolViolation;

/// Lifecycle phase carried by an engine notification.
///
/// Codes are defined by the engine. Anything we do not know about is kept as
/// [`NotificationType::Unknown`] so it can still be surfaced to the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum NotificationType {
    Invalid,
    SystemExited,
    SystemCreateCompleted,
    SystemStartCompleted,
    SystemPauseCompleted,
    SystemResumeCompleted,
    SystemCrashReport,
    SystemSiloJobCreated,
    SystemSaveCompleted,
    SystemRdpEnhancedModeStateChanged,
    SystemShutdownFailed,
    SystemGetPropertiesCompleted,
    SystemModifyCompleted,
    SystemCrashInitiated,
    SystemGuestConnectionClosed,
    ProcessExited,
    ServiceDisconnect,
    Unknown(u32),
}

impl NotificationType {
    pub fn from_code(code: u32) -> Self {
        match code {
            0x0000_0000 => Self::Invalid,
            0x0000_0001 => Self::SystemExited,
            0x0000_0002 => Self::SystemCreateCompleted,
            0x0000_0003 => Self::SystemStartCompleted,
            0x0000_0004 => Self::SystemPauseCompleted,
            0x0000_0005 => Self::SystemResumeCompleted,
            0x0000_0006 => Self::SystemCrashReport,
            0x0000_0007 => Self::SystemSiloJobCreated,
            0x0000_0008 => Self::SystemSaveCompleted,
            0x0000_0009 => Self::SystemRdpEnhancedModeStateChanged,
            0x0000_000A => Self::SystemShutdownFailed,
            0x0000_000B => Self::SystemGetPropertiesCompleted,
            0x0000_000C => Self::SystemModifyCompleted,
            0x0000_000D => Self::SystemCrashInitiated,
            0x0000_000E => Self::SystemGuestConnectionClosed,
            0x0001_0000 => Self::ProcessExited,
            0x0100_0000 => Self::ServiceDisconnect,
            other => Self::Unknown(other),
        }
    }

    pub fn code(self) -> u32 {
        match self {
            Self::Invalid => 0x0000_0000,
            Self::SystemExited => 0x0000_0001,
            Self::SystemCreateCompleted => 0x0000_0002,
            Self::SystemStartCompleted => 0x0000_0003,
            Self::SystemPauseCompleted => 0x0000_0004,
            Self::SystemResumeCompleted => 0x0000_0005,
            Self::SystemCrashReport => 0x0000_0006,
            Self::SystemSiloJobCreated => 0x0000_0007,
            Self::SystemSaveCompleted => 0x0000_0008,
            Self::SystemRdpEnhancedModeStateChanged => 0x0000_0009,
            Self::SystemShutdownFailed => 0x0000_000A,
            Self::SystemGetPropertiesCompleted => 0x0000_000B,
            Self::SystemModifyCompleted => 0x0000_000C,
            Self::SystemCrashInitiated => 0x0000_000D,
            Self::SystemGuestConnectionClosed => 0x0000_000E,
            Self::ProcessExited => 0x0001_0000,
            Self::ServiceDisconnect => 0x0100_0000,
            Self::Unknown(code) => code,
        }
    }
}

impl fmt::Display for NotificationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Invalid => "invalid",
            Self::SystemExited => "system exited",
            Self::SystemCreateCompleted => "system created",
            Self::SystemStartCompleted => "system started",
            Self::SystemPauseCompleted => "system paused",
            Self::SystemResumeCompleted => "system resumed",
            Self::SystemCrashReport => "crash report",
            Self::SystemSiloJobCreated => "silo job created",
            Self::SystemSaveCompleted => "save completed",
            Self::SystemRdpEnhancedModeStateChanged => "rdp enhanced mode changed",
            Self::SystemShutdownFailed => "shutdown failed",
            Self::SystemGetPropertiesCompleted => "get properties completed",
            Self::SystemModifyCompleted => "modify completed",
            Self::SystemCrashInitiated => "crash initiated",
            Self::SystemGuestConnectionClosed => "guest connection closed",
            Self::ProcessExited => "process exited",
            Self::ServiceDisconnect => "service disconnected",
            Self::Unknown(code) => return write!(f, "unknown ({:#x})", code),
        };
        f.write_str(name)
    }
}

/// Failure detail attached to a notification or an operation result.
///
/// Different phases fill in different subsets of this document, so every
/// field falls back to its zero value when absent.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct NotificationData {
    pub error: i32,
    pub error_message: String,
    pub error_events: Vec<ErrorEvent>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct ErrorEvent {
    pub event_id: u32,
    pub message: String,
    pub provider: String,
    pub data: Vec<EventData>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase", default)]
pub struct EventData {
    #[serde(rename = "Type")]
    pub kind: String,
    pub value: String,
}

impl NotificationData {
    /// Parse a detail document. Empty documents are treated as absent.
    pub fn parse(document: Option<&str>) -> Result<Option<Self>, serde_json::Error> {
        match document.map(str::trim) {
            None | Some("") => Ok(None),
            Some(text) => serde_json::from_str(text).map(Some),
        }
    }

    /// Best single-line summary: the top-level message, then the first event
    /// message that says something.
    pub fn summary(&self) -> Option<&str> {
        if !self.error_message.is_empty() {
            return Some(&self.error_message);
        }
        self.error_events
            .iter()
            .map(|event| event.message.as_str())
            .find(|message| !message.is_empty())
    }
}

impl fmt::Display for NotificationData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if !self.error_message.is_empty() {
            write!(f, "{}", self.error_message)?;
        }
        if self.error != 0 {
            let gap = if self.error_message.is_empty() { "" } else { " " };
            write!(f, "{}(error {:#010x})", gap, self.error as u32)?;
        }
        for event in &self.error_events {
            write!(f, "\n  [{}:{}] {}", event.provider, event.event_id, event.message)?;
            for item in &event.data {
                write!(f, "\n    {} = {}", item.kind, item.value)?;
            }
        }
        Ok(())
    }
}

/// A single completion event raised by the engine for an in-flight call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notification {
    pub kind: NotificationType,
    pub status: u32,
    pub data: Option<NotificationData>,
}

impl Notification {
    /// Decode the raw triple handed to the callback at the engine boundary.
    pub fn decode(code: u32, status: u32, payload: Option<&str>) -> Result<Self, ProtocolViolation> {
        let data = NotificationData::parse(payload)
            .map_err(|source| ProtocolViolation::MalformedPayload { code, source })?;

        Ok(Self {
            kind: NotificationType::from_code(code),
            status,
            data,
        })
    }

    pub fn succeeded(&self) -> bool {
        self.status == 0
    }
}

impl fmt::Display for Notification {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "notification: {} ({:#x}), status {:#010x}",
            self.kind,
            self.kind.code(),
            self.status
        )?;
        if let Some(data) = &self.data {
            write!(f, "\n  {}", data)?;
        }
        Ok(())
    }
}
