use anyhow::{Context as _, Result};
use serde_json::json;

use super::Context;
use crate::config::OutputFormat;
use crate::format;
use crate::schema::SystemSummary;
use crate::HcsError;

/// List the sessions this shell has open, or with `all` every system the
/// engine knows about.
pub fn execute(ctx: &Context, all: bool) -> Result<()> {
    if all {
        let document = ctx
            .engine
            .enumerate_systems("")
            .map_err(HcsError::from)
            .context("Failed to enumerate compute systems")?;
        let systems: Vec<SystemSummary> =
            serde_json::from_str(&document).context("Failed to parse compute system list")?;

        match ctx.config.format {
            OutputFormat::Json => format::print_json(&systems)?,
            OutputFormat::Table => format::print_system_list(&systems),
        }
        return Ok(());
    }

    match ctx.config.format {
        OutputFormat::Json => {
            let sessions: Vec<_> = ctx
                .sessions
                .iter()
                .map(|s| {
                    json!({
                        "id": s.id(),
                        "origin": s.origin(),
                        "opened_at": s.opened_at().to_rfc3339(),
                        "default": Some(s.id()) == ctx.sessions.default_id(),
                    })
                })
                .collect();
            format::print_json(&sessions)?;
        }
        OutputFormat::Table if ctx.sessions.is_empty() => {
            println!("No compute systems open.");
        }
        OutputFormat::Table => {
            println!("{}", format::session_table(ctx.sessions.iter(), ctx.sessions.default_id()));
        }
    }
    Ok(())
}
