use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Completion, HandleWait, NotificationReceiver, NotificationWait, PendingOperation};
use crate::engine::{Engine, MigrationPhase, MigrationTransport, SystemHandle, Verb};
use crate::{HcsError, Result};

/// Issues one asynchronous engine call and waits for it to finish.
///
/// A synchronous refusal is returned as [`HcsError::Rejected`] without
/// waiting. Otherwise the call is followed to its terminal event, and a
/// non-zero terminal status becomes [`HcsError::Failed`]. Nothing is retried.
pub struct CommandExecutor<'a> {
    engine: &'a dyn Engine,
    timeout: Option<Duration>,
    cancel: &'a CancellationToken,
}

impl<'a> CommandExecutor<'a> {
    pub fn new(engine: &'a dyn Engine, timeout: Option<Duration>, cancel: &'a CancellationToken) -> Self {
        Self {
            engine,
            timeout,
            cancel,
        }
    }

    /// Run `verb` against an open system whose notifications arrive on
    /// `channel`.
    pub async fn run(
        &self,
        verb: Verb,
        handle: SystemHandle,
        channel: &mut NotificationReceiver,
        options: &str,
    ) -> Result<Completion> {
        let ack = self
            .engine
            .invoke(verb, handle, options)
            .map_err(|source| HcsError::Rejected {
                verb: verb.name().to_string(),
                source,
            })?;
        tracing::debug!("{} acknowledged as {:?}", verb, ack);

        self.wait(verb, channel).await
    }

    /// Wait for the terminal notification of a `verb` that was already
    /// issued, such as a create whose handle had to be attached first.
    pub async fn wait(&self, verb: Verb, channel: &mut NotificationReceiver) -> Result<Completion> {
        let mut pending = NotificationWait::new(channel, verb);
        self.finish(&mut pending).await
    }

    /// Run one live-migration phase through the engine's operation handle.
    pub async fn migrate(
        &self,
        id: &str,
        phase: MigrationPhase,
        options: &str,
        transport: Option<&MigrationTransport>,
    ) -> Result<Completion> {
        let handle = self
            .engine
            .begin_migration(id, phase, options, transport)
            .map_err(|source| HcsError::Rejected {
                verb: phase.name().to_string(),
                source,
            })?;

        let mut pending = HandleWait::new(handle, phase.name());
        self.finish(&mut pending).await
    }

    pub async fn finish(&self, pending: &mut dyn PendingOperation) -> Result<Completion> {
        let completion = pending.await_terminal(self.timeout, self.cancel).await?;
        completion.into_result(pending.describe())
    }
}
