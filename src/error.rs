use crate::bridge::{NotificationData, ProtocolViolation};
use crate::engine::EngineError;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum HcsError {
    #[error("{verb} rejected by engine: {source}")]
    Rejected {
        verb: String,
        #[source]
        source: EngineError,
    },

    #[error("{verb} failed with status {status:#010x}{}", describe_failure(.detail))]
    Failed {
        verb: String,
        status: u32,
        detail: Option<NotificationData>,
    },

    #[error("{verb} timed out after {}; completion state is unknown", describe_timeout(.timeout))]
    TimedOut {
        verb: String,
        timeout: Option<Duration>,
    },

    #[error("{verb} cancelled; completion state is unknown")]
    Cancelled { verb: String },

    #[error("protocol violation: {0}")]
    ProtocolViolation(#[from] ProtocolViolation),

    #[error("operation wait aborted: {0}")]
    WaitAborted(#[from] tokio::task::JoinError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("compute system not opened: {0}")]
    SystemNotOpen(String),

    #[error("compute system already open: {0}")]
    AlreadyOpen(String),

    #[error("must specify a default compute system or use --cs")]
    NoDefaultSystem,

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl HcsError {
    pub fn is_protocol_violation(&self) -> bool {
        matches!(self, HcsError::ProtocolViolation(_))
    }

    /// Decoded failure detail, for errors that carry one.
    pub fn failure_detail(&self) -> Option<&NotificationData> {
        match self {
            HcsError::Failed { detail, .. } => detail.as_ref(),
            _ => None,
        }
    }
}

fn describe_failure(detail: &Option<NotificationData>) -> String {
    let text = match detail {
        Some(detail) => detail.to_string(),
        None => return String::new(),
    };
    // event lines start on their own line
    if text.is_empty() || text.starts_with('\n') {
        text
    } else {
        format!(": {}", text)
    }
}

fn describe_timeout(timeout: &Option<Duration>) -> String {
    match timeout {
        Some(timeout) => format!("{:?}", timeout),
        None => "an unbounded wait".to_string(),
    }
}

pub type Result<T> = std::result::Result<T, HcsError>;

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::ErrorEvent;

    fn failed(detail: NotificationData) -> String {
        HcsError::Failed {
            verb: "pause".to_string(),
            status: 0x8007_0005,
            detail: Some(detail),
        }
        .to_string()
    }

    #[test]
    fn test_failed_with_message_and_code() {
        let rendered = failed(NotificationData {
            error: 0x8007_0005_u32 as i32,
            error_message: "access denied".to_string(),
            ..Default::default()
        });
        assert_eq!(
            rendered,
            "pause failed with status 0x80070005: access denied (error 0x80070005)"
        );
    }

    #[test]
    fn test_failed_without_message() {
        let rendered = failed(NotificationData {
            error: 0x8007_0005_u32 as i32,
            ..Default::default()
        });
        assert_eq!(rendered, "pause failed with status 0x80070005: (error 0x80070005)");

        let rendered = failed(NotificationData::default());
        assert_eq!(rendered, "pause failed with status 0x80070005");

        let rendered = failed(NotificationData {
            error_events: vec![ErrorEvent {
                event_id: 12,
                message: "disk missing".to_string(),
                ..Default::default()
            }],
            ..Default::default()
        });
        assert_eq!(rendered, "pause failed with status 0x80070005\n  [:12] disk missing");
    }
}
