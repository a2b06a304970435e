use anyhow::{Context as _, Result};
use std::path::Path;

use super::{absolute, Context};
use crate::HcsError;

/// Let compute system `vm_id` open `path`. The system need not be open here.
pub fn execute(ctx: &Context, vm_id: &str, path: &Path) -> Result<()> {
    let path = absolute(path).context("Failed to resolve path")?;

    ctx.engine
        .grant_vm_access(vm_id, &path)
        .map_err(HcsError::from)
        .context(format!("Failed to grant '{}' access to {}", vm_id, path.display()))?;

    println!("✓ Granted '{}' access to {}", vm_id, path.display());
    Ok(())
}
