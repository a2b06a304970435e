use anyhow::{Context as _, Result};

use super::Context;
use crate::session::{Session, SessionOrigin};
use crate::HcsError;

pub fn execute(ctx: &mut Context, id: &str) -> Result<()> {
    if ctx.sessions.contains(id) {
        return Err(HcsError::AlreadyOpen(id.to_string()).into());
    }

    let handle = ctx.engine.open_system(id).map_err(HcsError::from)?;
    let session = match Session::attach(ctx.engine.as_ref(), &ctx.registry, id, handle, SessionOrigin::Opened) {
        Ok(session) => session,
        Err(e) => {
            if let Err(close) = ctx.engine.close_system(handle) {
                tracing::warn!("Failed to release handle for {}: {}", id, close);
            }
            return Err(HcsError::from(e)).context(format!("Failed to watch compute system '{}'", id));
        }
    };
    ctx.sessions.insert(session)?;

    println!("✓ Compute system '{}' opened", id);
    Ok(())
}
