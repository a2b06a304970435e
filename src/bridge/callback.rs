use std::sync::Arc;

use super::{CorrelationKey, Notification, NotificationRegistry};

/// The receiving end of the engine's notification callback.
///
/// Runs on engine-owned threads, so it only decodes and hands off. It never
/// blocks and never reports failure back to the engine: a payload that does
/// not decode is delivered to the waiter as a violation, and an event with
/// nowhere to go is parked in the registry for the shell to report.
#[derive(Debug, Clone)]
pub struct CallbackAdapter {
    registry: Arc<NotificationRegistry>,
}

impl CallbackAdapter {
    pub fn new(registry: Arc<NotificationRegistry>) -> Self {
        Self { registry }
    }

    pub fn on_event(&self, key: CorrelationKey, code: u32, status: u32, payload: Option<&str>) {
        let delivery = Notification::decode(code, status, payload);

        match &delivery {
            Ok(n) => tracing::debug!(key, code, "engine notification: {} ({:#010x})", n.kind, status),
            Err(violation) => tracing::warn!(key, code, "undecodable engine notification: {}", violation),
        }

        if let Err(violation) = self.registry.deliver(key, delivery) {
            self.registry.record_violation(violation);
        }
    }
}
