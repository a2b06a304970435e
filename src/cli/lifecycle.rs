use anyhow::{Context as _, Result};
use tokio_util::sync::CancellationToken;

use super::{Context, Target};
use crate::bridge::{CommandExecutor, Completion};
use crate::engine::Verb;

/// Run `verb` with `options` against the targeted session and wait for it.
pub(crate) async fn run(
    ctx: &mut Context,
    verb: Verb,
    target: &Target,
    options: &str,
    cancel: &CancellationToken,
) -> Result<Completion> {
    let timeout = ctx.timeout(target.timeout_ms);
    let session = ctx.sessions.resolve(target.cs.as_deref())?;
    let id = session.id().to_string();
    let handle = session.handle();

    tracing::info!("{} compute system: {}", verb, id);
    let executor = CommandExecutor::new(ctx.engine.as_ref(), timeout, cancel);
    executor
        .run(verb, handle, session.notifications(), options)
        .await
        .context(format!("Failed to {} compute system '{}'", verb, id))
}

/// start, shutdown, terminate, pause and resume take no options.
pub async fn execute(ctx: &mut Context, verb: Verb, target: &Target, cancel: &CancellationToken) -> Result<()> {
    run(ctx, verb, target, "", cancel).await?;

    let id = ctx.sessions.resolve(target.cs.as_deref())?.id().to_string();
    let done = match verb {
        Verb::Start => "started",
        Verb::Shutdown => "shut down",
        Verb::Terminate => "terminated",
        Verb::Pause => "paused",
        Verb::Resume => "resumed",
        Verb::Create | Verb::Save | Verb::Modify => "updated",
    };
    println!("✓ Compute system '{}' {}", id, done);
    Ok(())
}
