use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::mpsc;

use super::{Delivery, ProtocolViolation};

/// Token passed to the engine as callback context and used to route events
/// back to the waiter that registered it.
pub type CorrelationKey = usize;

pub type NotificationSender = mpsc::UnboundedSender<Delivery>;
pub type NotificationReceiver = mpsc::UnboundedReceiver<Delivery>;

/// Table of pending registrations, keyed by correlation key.
///
/// The engine calls into this from its own threads while the foreground is
/// registering and unregistering sessions. The lock only guards map access;
/// sends happen after the sender has been cloned out.
#[derive(Debug)]
pub struct NotificationRegistry {
    channels: Mutex<HashMap<CorrelationKey, NotificationSender>>,
    violations: Mutex<Vec<ProtocolViolation>>,
    next_key: AtomicUsize,
}

impl Default for NotificationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl NotificationRegistry {
    pub fn new() -> Self {
        Self {
            channels: Mutex::new(HashMap::new()),
            violations: Mutex::new(Vec::new()),
            // 0 is left unused so a zeroed context from the engine never aliases a session
            next_key: AtomicUsize::new(1),
        }
    }

    /// Allocate a key no other live registration is using.
    pub fn next_key(&self) -> CorrelationKey {
        self.next_key.fetch_add(1, Ordering::Relaxed)
    }

    /// Install `sender` for `key`, returning the sender it replaced.
    pub fn register(&self, key: CorrelationKey, sender: NotificationSender) -> Option<NotificationSender> {
        let replaced = self.channels.lock().insert(key, sender);
        if replaced.is_some() {
            tracing::debug!(key, "replaced notification channel");
        }
        replaced
    }

    /// Remove the registration for `key`. Returns whether one existed.
    pub fn unregister(&self, key: CorrelationKey) -> bool {
        self.channels.lock().remove(&key).is_some()
    }

    pub fn is_registered(&self, key: CorrelationKey) -> bool {
        self.channels.lock().contains_key(&key)
    }

    /// Route a delivery to the channel registered under `key`.
    pub fn deliver(&self, key: CorrelationKey, delivery: Delivery) -> Result<(), ProtocolViolation> {
        let sender = self
            .channels
            .lock()
            .get(&key)
            .cloned()
            .ok_or(ProtocolViolation::UnregisteredKey(key))?;

        sender
            .send(delivery)
            .map_err(|_| ProtocolViolation::ReceiverClosed(key))
    }

    /// Park a violation that could not be reported to any waiter.
    pub fn record_violation(&self, violation: ProtocolViolation) {
        tracing::error!("protocol violation: {}", violation);
        self.violations.lock().push(violation);
    }

    /// Drain the violations recorded since the last call.
    pub fn take_violations(&self) -> Vec<ProtocolViolation> {
        std::mem::take(&mut *self.violations.lock())
    }
}

#[cfg(test)]
#[path = "registry_tests.rs"]
mod registry_tests;
