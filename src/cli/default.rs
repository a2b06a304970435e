use anyhow::Result;

use super::Context;

pub fn execute(ctx: &mut Context, id: Option<&str>, unset: bool) -> Result<()> {
    if unset {
        if let Some(previous) = ctx.sessions.clear_default() {
            println!("Default compute system '{}' unset", previous);
        }
        return Ok(());
    }

    match id {
        Some(id) => {
            ctx.sessions.set_default(id)?;
            println!("✓ Default compute system is now '{}'", id);
        }
        None => match ctx.sessions.default_id() {
            Some(id) => println!("{}", id),
            None => println!("No default compute system."),
        },
    }
    Ok(())
}
