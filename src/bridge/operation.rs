use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::pump::{pump_until, PumpError};
use super::{NotificationData, NotificationReceiver, NotificationType, ProtocolViolation};
use crate::engine::{hresult, OperationHandle, Verb};
use crate::{HcsError, Result};

/// Terminal outcome of an asynchronous engine call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub status: u32,
    pub data: Option<NotificationData>,
    /// Result document of a handle-based operation, kept verbatim.
    pub document: Option<String>,
}

impl Completion {
    pub fn succeeded(&self) -> bool {
        self.status == 0
    }

    /// Turn a non-zero status into [`HcsError::Failed`].
    pub fn into_result(self, verb: &str) -> Result<Completion> {
        if self.succeeded() {
            Ok(self)
        } else {
            Err(HcsError::Failed {
                verb: verb.to_string(),
                status: self.status,
                detail: self.data,
            })
        }
    }
}

/// An accepted asynchronous call whose terminal event has not been seen yet.
#[async_trait]
pub trait PendingOperation: Send {
    /// What the operator asked for, used in errors.
    fn describe(&self) -> &str;

    /// Block the calling command until the operation reaches its terminal
    /// event, the timeout elapses or `cancel` fires.
    async fn await_terminal(&mut self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<Completion>;
}

/// Completion through the session's notification channel.
pub struct NotificationWait<'a> {
    channel: &'a mut NotificationReceiver,
    desired: NotificationType,
    verb: &'static str,
}

impl<'a> NotificationWait<'a> {
    pub fn new(channel: &'a mut NotificationReceiver, verb: Verb) -> Self {
        Self {
            channel,
            desired: verb.terminal_notification(),
            verb: verb.name(),
        }
    }
}

#[async_trait]
impl PendingOperation for NotificationWait<'_> {
    fn describe(&self) -> &str {
        self.verb
    }

    async fn await_terminal(&mut self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<Completion> {
        let verb = self.verb;
        let result = pump_until(&mut *self.channel, self.desired, timeout, cancel, |n| {
            tracing::info!("{} still pending, engine reported {}", verb, n.kind);
            println!("{}", n);
        })
        .await;

        match result {
            Ok(n) => Ok(Completion {
                status: n.status,
                data: n.data,
                document: None,
            }),
            Err(PumpError::TimedOut) => Err(HcsError::TimedOut {
                verb: verb.to_string(),
                timeout,
            }),
            Err(PumpError::Cancelled) => Err(HcsError::Cancelled {
                verb: verb.to_string(),
            }),
            Err(PumpError::Violation(violation)) => Err(violation.into()),
        }
    }
}

/// Completion through an engine operation handle.
///
/// The engine's wait is a blocking call, so it runs on the blocking pool. If
/// the operator cancels, the wait keeps running there until the engine
/// returns; only the command stops waiting for it.
pub struct HandleWait {
    handle: Arc<Mutex<Box<dyn OperationHandle>>>,
    verb: String,
}

impl HandleWait {
    pub fn new(handle: Box<dyn OperationHandle>, verb: impl Into<String>) -> Self {
        Self {
            handle: Arc::new(Mutex::new(handle)),
            verb: verb.into(),
        }
    }
}

#[async_trait]
impl PendingOperation for HandleWait {
    fn describe(&self) -> &str {
        &self.verb
    }

    async fn await_terminal(&mut self, timeout: Option<Duration>, cancel: &CancellationToken) -> Result<Completion> {
        let handle = Arc::clone(&self.handle);
        let wait = tokio::task::spawn_blocking(move || handle.lock().wait(timeout));

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                return Err(HcsError::Cancelled { verb: self.verb.clone() });
            }
            joined = wait => joined?,
        };

        if result.status == hresult::TIMEOUT {
            return Err(HcsError::TimedOut {
                verb: self.verb.clone(),
                timeout,
            });
        }

        let data = if result.status == 0 {
            None
        } else {
            NotificationData::parse(result.document.as_deref()).map_err(ProtocolViolation::MalformedResult)?
        };

        Ok(Completion {
            status: result.status,
            data,
            document: result.document,
        })
    }
}
