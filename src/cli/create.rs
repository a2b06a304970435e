use anyhow::{Context as _, Result};
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::Context;
use crate::bridge::CommandExecutor;
use crate::engine::Verb;
use crate::session::{Session, SessionOrigin};
use crate::HcsError;

/// Create a compute system from the configuration document at `path`.
///
/// `id` of `-` asks for a generated one. Once the engine hands back a handle
/// the system is kept open, even when creation later fails or times out, so
/// it can still be inspected or closed. Returns the id used.
pub async fn execute(
    ctx: &mut Context,
    id: &str,
    path: &Path,
    set_default: bool,
    timeout_ms: Option<u64>,
    cancel: &CancellationToken,
) -> Result<String> {
    let id = if id == "-" {
        Uuid::new_v4().to_string()
    } else {
        id.to_string()
    };

    if ctx.sessions.contains(&id) {
        return Err(HcsError::AlreadyOpen(id).into());
    }

    let configuration = fs::read_to_string(path)
        .context(format!("Failed to read configuration document: {}", path.display()))?;

    tracing::info!("Creating compute system: {}", id);
    let (handle, ack) = ctx
        .engine
        .create_system(&id, &configuration)
        .map_err(|source| HcsError::Rejected {
            verb: Verb::Create.name().to_string(),
            source,
        })?;
    tracing::debug!("create acknowledged as {:?}", ack);

    let session = match Session::attach(ctx.engine.as_ref(), &ctx.registry, &id, handle, SessionOrigin::Created) {
        Ok(session) => session,
        Err(e) => {
            if let Err(close) = ctx.engine.close_system(handle) {
                tracing::warn!("Failed to release handle for {}: {}", id, close);
            }
            return Err(HcsError::from(e)).context(format!("Failed to watch compute system '{}'", id));
        }
    };
    ctx.sessions.insert(session)?;
    if set_default {
        ctx.sessions.set_default(&id)?;
    }

    let timeout = ctx.timeout(timeout_ms);
    let session = ctx.sessions.resolve(Some(&id))?;
    let executor = CommandExecutor::new(ctx.engine.as_ref(), timeout, cancel);
    executor
        .wait(Verb::Create, session.notifications())
        .await
        .context(format!("Compute system '{}' is open but did not finish creating", id))?;

    println!("✓ Compute system '{}' created", id);
    Ok(id)
}
