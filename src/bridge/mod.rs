//! Completion bridge between the engine's asynchronous calls and the
//! sequential command code.
//!
//! The engine reports progress by invoking a callback on one of its own
//! threads. The [`CallbackAdapter`] decodes each event and hands it to the
//! [`NotificationRegistry`], which routes it by correlation key into the
//! channel owned by the session that issued the call. The command thread then
//! waits on that channel through [`pump_until`], or through an operation
//! handle for the engine's handle-based calls. Both waits sit behind
//! [`PendingOperation`].

pub mod callback;
pub mod executor;
pub mod notification;
pub mod operation;
pub mod pump;
pub mod registry;

pub use callback::CallbackAdapter;
pub use executor::CommandExecutor;
pub use notification::{ErrorEvent, EventData, Notification, NotificationData, NotificationType};
pub use operation::{Completion, HandleWait, NotificationWait, PendingOperation};
pub use pump::pump_until;
pub use registry::{CorrelationKey, NotificationReceiver, NotificationRegistry, NotificationSender};

use thiserror::Error;

/// One item on a delivery channel: a decoded notification, or the reason the
/// engine's event could not be decoded.
pub type Delivery = std::result::Result<Notification, ProtocolViolation>;

/// The engine did something the bridge does not expect. Once this happens the
/// bridge's assumptions about the engine no longer hold.
#[derive(Debug, Error)]
pub enum ProtocolViolation {
    #[error("malformed payload for notification {code:#x}: {source}")]
    MalformedPayload {
        code: u32,
        #[source]
        source: serde_json::Error,
    },

    #[error("malformed operation result document: {0}")]
    MalformedResult(#[source] serde_json::Error),

    #[error("notification delivered to unregistered correlation key {0}")]
    UnregisteredKey(CorrelationKey),

    #[error("delivery channel for correlation key {0} has no receiver")]
    ReceiverClosed(CorrelationKey),

    #[error("delivery channel closed while waiting for {0}")]
    ChannelClosed(NotificationType),
}
