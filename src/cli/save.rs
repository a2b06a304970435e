use anyhow::{Context as _, Result};
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::{absolute, lifecycle, Context, Target};
use crate::engine::Verb;
use crate::schema::SaveOptions;

pub async fn execute(ctx: &mut Context, path: &Path, target: &Target, cancel: &CancellationToken) -> Result<()> {
    let path = absolute(path).context("Failed to resolve save state path")?;
    let options = serde_json::to_string(&SaveOptions::to_file(&path))?;

    lifecycle::run(ctx, Verb::Save, target, &options, cancel).await?;

    println!("✓ Saved state to {}", path.display());
    Ok(())
}
