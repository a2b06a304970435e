use anyhow::Result;

use super::{Context, Target};

pub fn execute(ctx: &mut Context, target: &Target) -> Result<()> {
    let id = ctx.sessions.resolve(target.cs.as_deref())?.id().to_string();

    tracing::info!("Closing compute system: {}", id);
    ctx.sessions.close(&id, ctx.engine.as_ref(), &ctx.registry)?;

    println!("✓ Compute system '{}' closed", id);
    Ok(())
}
