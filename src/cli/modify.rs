use anyhow::{Context as _, Result};
use serde_json::Value;
use std::fs;
use std::path::Path;
use tokio_util::sync::CancellationToken;

use super::{lifecycle, Context, Target};
use crate::engine::Verb;
use crate::schema::ModifySettingRequest;

pub async fn execute(
    ctx: &mut Context,
    resource_path: &str,
    request_type: Option<&str>,
    settings: Option<&Path>,
    target: &Target,
    cancel: &CancellationToken,
) -> Result<()> {
    let settings = match settings {
        Some(path) => {
            let contents = fs::read_to_string(path)
                .context(format!("Failed to read settings document: {}", path.display()))?;
            let value: Value = serde_json::from_str(&contents)
                .context(format!("Failed to parse settings document: {}", path.display()))?;
            Some(value)
        }
        None => None,
    };

    let request = ModifySettingRequest {
        resource_path: resource_path.to_string(),
        request_type: request_type.map(str::to_string).unwrap_or_default(),
        settings,
        guest_request: None,
    };
    let options = serde_json::to_string(&request)?;

    lifecycle::run(ctx, Verb::Modify, target, &options, cancel).await?;

    println!("✓ Modified {}", resource_path);
    Ok(())
}
