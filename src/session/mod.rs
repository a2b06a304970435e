//! Open compute systems and their notification plumbing.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::bridge::{CallbackAdapter, CorrelationKey, NotificationReceiver, NotificationRegistry};
use crate::engine::{CallbackToken, Engine, EngineError, SystemHandle};
use crate::{HcsError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionOrigin {
    Created,
    Opened,
}

impl std::fmt::Display for SessionOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SessionOrigin::Created => write!(f, "created"),
            SessionOrigin::Opened => write!(f, "opened"),
        }
    }
}

/// One compute system held open by the shell.
///
/// Owns the delivery channel for its correlation key. The channel is
/// registered before the engine callback so that no event can arrive for a
/// key nobody listens on.
pub struct Session {
    id: String,
    handle: SystemHandle,
    key: CorrelationKey,
    callback: Option<CallbackToken>,
    notifications: NotificationReceiver,
    origin: SessionOrigin,
    opened_at: DateTime<Utc>,
}

impl Session {
    pub fn attach(
        engine: &dyn Engine,
        registry: &Arc<NotificationRegistry>,
        id: &str,
        handle: SystemHandle,
        origin: SessionOrigin,
    ) -> std::result::Result<Self, EngineError> {
        let key = registry.next_key();
        let (tx, notifications) = mpsc::unbounded_channel();
        registry.register(key, tx);

        let adapter = CallbackAdapter::new(Arc::clone(registry));
        let callback = match engine.register_callback(handle, adapter, key) {
            Ok(token) => token,
            Err(e) => {
                registry.unregister(key);
                return Err(e);
            }
        };

        tracing::debug!(key, "Attached session for compute system {}", id);
        Ok(Self {
            id: id.to_string(),
            handle,
            key,
            callback: Some(callback),
            notifications,
            origin,
            opened_at: Utc::now(),
        })
    }

    /// Release the callback, then the handle, then the registration. Safe to
    /// call again after a partial failure.
    pub fn detach(&mut self, engine: &dyn Engine, registry: &NotificationRegistry) -> std::result::Result<(), EngineError> {
        if let Some(token) = self.callback {
            engine.unregister_callback(token)?;
            self.callback = None;
        }
        engine.close_system(self.handle)?;
        registry.unregister(self.key);
        Ok(())
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn handle(&self) -> SystemHandle {
        self.handle
    }

    pub fn key(&self) -> CorrelationKey {
        self.key
    }

    pub fn origin(&self) -> SessionOrigin {
        self.origin
    }

    pub fn opened_at(&self) -> DateTime<Utc> {
        self.opened_at
    }

    pub fn notifications(&mut self) -> &mut NotificationReceiver {
        &mut self.notifications
    }
}

/// Sessions by system id, plus the default used when a command names none.
#[derive(Default)]
pub struct SessionTable {
    sessions: BTreeMap<String, Session>,
    default: Option<String>,
}

impl SessionTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.sessions.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Session> {
        self.sessions.values()
    }

    pub fn insert(&mut self, session: Session) -> Result<()> {
        if self.sessions.contains_key(session.id()) {
            return Err(HcsError::AlreadyOpen(session.id.clone()));
        }
        self.sessions.insert(session.id.clone(), session);
        Ok(())
    }

    pub fn default_id(&self) -> Option<&str> {
        self.default.as_deref()
    }

    pub fn set_default(&mut self, id: &str) -> Result<()> {
        if !self.sessions.contains_key(id) {
            return Err(HcsError::SystemNotOpen(id.to_string()));
        }
        self.default = Some(id.to_string());
        Ok(())
    }

    pub fn clear_default(&mut self) -> Option<String> {
        self.default.take()
    }

    /// The session named by `explicit`, or the default one.
    pub fn resolve(&mut self, explicit: Option<&str>) -> Result<&mut Session> {
        let id = match explicit {
            Some(id) => id.to_string(),
            None => self.default.clone().ok_or(HcsError::NoDefaultSystem)?,
        };
        self.sessions.get_mut(&id).ok_or(HcsError::SystemNotOpen(id))
    }

    pub fn close(&mut self, id: &str, engine: &dyn Engine, registry: &NotificationRegistry) -> Result<()> {
        let session = self
            .sessions
            .get_mut(id)
            .ok_or_else(|| HcsError::SystemNotOpen(id.to_string()))?;
        session.detach(engine, registry)?;

        self.sessions.remove(id);
        if self.default.as_deref() == Some(id) {
            self.default = None;
        }
        Ok(())
    }

    /// Close every session. Sessions that fail to close stay in the table.
    pub fn close_all(&mut self, engine: &dyn Engine, registry: &NotificationRegistry) -> Vec<(String, HcsError)> {
        let ids: Vec<String> = self.sessions.keys().cloned().collect();
        let mut failures = Vec::new();

        for id in ids {
            if let Err(e) = self.close(&id, engine, registry) {
                tracing::warn!("Failed to close compute system {}: {}", id, e);
                failures.push((id, e));
            }
        }

        failures
    }
}
