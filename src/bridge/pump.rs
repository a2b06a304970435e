use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use super::{Delivery, Notification, NotificationReceiver, NotificationType, ProtocolViolation};

/// Why [`pump_until`] gave up before seeing the notification it wanted.
#[derive(Debug)]
pub enum PumpError {
    TimedOut,
    Cancelled,
    Violation(ProtocolViolation),
}

/// Consume notifications from `channel` until one of type `desired` arrives.
///
/// The matching notification is returned whatever its status; judging the
/// status is up to the caller. Every notification of another type is handed
/// to `observe` in arrival order and the wait continues. The deadline is
/// fixed on entry, so a stream of unrelated notifications cannot extend it.
/// `timeout` of `None` waits until a match, a cancellation or a violation.
pub async fn pump_until<F>(
    channel: &mut NotificationReceiver,
    desired: NotificationType,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
    mut observe: F,
) -> Result<Notification, PumpError>
where
    F: FnMut(&Notification),
{
    let deadline = timeout.map(|timeout| Instant::now() + timeout);

    loop {
        let received = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(PumpError::Cancelled),
            received = recv_before(channel, deadline) => received,
        };

        match received {
            None => {
                tracing::debug!("gave up waiting for {}", desired);
                return Err(PumpError::TimedOut);
            }
            Some(None) => return Err(PumpError::Violation(ProtocolViolation::ChannelClosed(desired))),
            Some(Some(Err(violation))) => return Err(PumpError::Violation(violation)),
            Some(Some(Ok(notification))) if notification.kind == desired => return Ok(notification),
            Some(Some(Ok(notification))) => {
                tracing::debug!("waiting for {}, passing over {}", desired, notification.kind);
                observe(&notification);
            }
        }
    }
}

/// `None` when the deadline passed, otherwise what the channel yielded.
async fn recv_before(channel: &mut NotificationReceiver, deadline: Option<Instant>) -> Option<Option<Delivery>> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline, channel.recv()).await.ok(),
        None => Some(channel.recv().await),
    }
}
