use anyhow::{Context as _, Result};
use serde_json::Value;

use super::{Context, Target};
use crate::config::OutputFormat;
use crate::format;
use crate::schema::{PropertyQuery, SystemProperties};
use crate::HcsError;

pub fn execute(ctx: &mut Context, vm_version: bool, target: &Target) -> Result<SystemProperties> {
    let session = ctx.sessions.resolve(target.cs.as_deref())?;
    let query = serde_json::to_string(&PropertyQuery::basic(vm_version))?;

    let document = ctx
        .engine
        .properties(session.handle(), &query)
        .map_err(HcsError::from)
        .context(format!("Failed to query properties of '{}'", session.id()))?;

    let props: SystemProperties = serde_json::from_str(&document).context("Failed to parse property document")?;
    match ctx.config.format {
        OutputFormat::Json => format::print_json(&serde_json::from_str::<Value>(&document)?)?,
        OutputFormat::Table => format::print_properties(&props),
    }

    Ok(props)
}
