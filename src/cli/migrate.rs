use anyhow::{Context as _, Result};
use std::fs;
use std::path::Path;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use super::{Context, Target};
use crate::bridge::{CommandExecutor, Completion};
use crate::engine::{MigrationPhase, MigrationTransport};
use crate::format;
use crate::HcsError;

/// Run one live-migration phase. `start` needs the address of the peer that
/// receives the migration stream.
pub async fn execute(
    ctx: &mut Context,
    phase: MigrationPhase,
    options: Option<&Path>,
    socket: Option<&str>,
    target: &Target,
    cancel: &CancellationToken,
) -> Result<Completion> {
    let id = ctx.sessions.resolve(target.cs.as_deref())?.id().to_string();

    let options = match options {
        Some(path) => fs::read_to_string(path)
            .context(format!("Failed to read migration options: {}", path.display()))?,
        None => String::new(),
    };

    let timeout = ctx.migration_timeout(target.timeout_ms);
    let transport = if phase.needs_transport() {
        let addr = socket.context(format!("{} needs --socket ADDR", phase))?;
        let transport = connect(phase, addr, timeout, cancel)
            .await
            .context(format!("Failed to connect migration transport to {}", addr))?;
        Some(transport)
    } else {
        None
    };

    tracing::info!("{} for compute system: {}", phase, id);
    let executor = CommandExecutor::new(ctx.engine.as_ref(), timeout, cancel);
    let completion = executor
        .migrate(&id, phase, &options, transport.as_ref())
        .await
        .context(format!("Failed to {} compute system '{}'", phase, id))?;

    println!("✓ {} completed for '{}'", phase, id);
    if let Some(document) = completion.document.as_deref() {
        match serde_json::from_str::<serde_json::Value>(document) {
            Ok(value) => format::print_json(&value)?,
            Err(_) => println!("{}", document),
        }
    }
    Ok(completion)
}

/// Connect off the runtime workers, giving up early on `cancel`. An
/// abandoned attempt finishes on the blocking pool within `timeout`.
async fn connect(
    phase: MigrationPhase,
    addr: &str,
    timeout: Option<Duration>,
    cancel: &CancellationToken,
) -> Result<MigrationTransport> {
    let addr = addr.to_string();
    let attempt = tokio::task::spawn_blocking(move || MigrationTransport::connect(addr.as_str(), timeout));

    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HcsError::Cancelled {
            verb: phase.name().to_string(),
        }
        .into()),
        joined = attempt => Ok(joined.map_err(HcsError::from)??),
    }
}
