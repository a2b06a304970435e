//! Interactive and scripted command loop.

use anyhow::{Context as _, Result};
use clap::{error::ErrorKind, Parser, Subcommand};
use rustyline::error::ReadlineError;
use rustyline::DefaultEditor;
use std::fs;
use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::cli::{self, Context, Target};
use crate::config;
use crate::engine::{MigrationPhase, Verb};
use crate::HcsError;

/// How long exit waits for engine calls still running on the blocking pool.
/// A cancelled wait on an operation handle stays there until the engine
/// returns, which may be never.
pub const SHUTDOWN_GRACE: Duration = Duration::from_secs(1);

/// Drive `future` to completion on a fresh multi-threaded runtime, then shut
/// the runtime down without waiting longer than [`SHUTDOWN_GRACE`].
pub fn run_to_exit<F: Future>(future: F) -> std::io::Result<F::Output> {
    let runtime = tokio::runtime::Builder::new_multi_thread().enable_all().build()?;
    let output = runtime.block_on(future);
    runtime.shutdown_timeout(SHUTDOWN_GRACE);
    Ok(output)
}

#[derive(Parser, Debug)]
#[command(no_binary_name = true, disable_version_flag = true)]
pub struct ShellLine {
    #[command(subcommand)]
    pub command: ShellCommand,
}

#[derive(Subcommand, Debug)]
pub enum ShellCommand {
    /// Create a compute system from a configuration document
    Create {
        /// Compute system ID, or - to generate one
        id: String,

        /// Path to the JSON configuration document
        path: PathBuf,

        /// Make the new compute system the default
        #[arg(long = "def")]
        set_default: bool,

        /// Wait budget in milliseconds (0 waits without bound)
        #[arg(long, value_name = "MS")]
        timeout_ms: Option<u64>,
    },

    /// Open an existing compute system
    Open { id: String },

    /// Close a compute system
    Close {
        #[command(flatten)]
        target: Target,
    },

    /// Start a compute system
    Start {
        #[command(flatten)]
        target: Target,
    },

    /// Shut a compute system down cleanly
    Shutdown {
        #[command(flatten)]
        target: Target,
    },

    /// Terminate a compute system
    Terminate {
        #[command(flatten)]
        target: Target,
    },

    /// Pause a compute system
    Pause {
        #[command(flatten)]
        target: Target,
    },

    /// Resume a paused compute system
    Resume {
        #[command(flatten)]
        target: Target,
    },

    /// Save a paused compute system's state to a file
    Save {
        path: PathBuf,

        #[command(flatten)]
        target: Target,
    },

    /// Change a setting of a running compute system
    Modify {
        #[arg(long)]
        resource_path: String,

        #[arg(long)]
        request_type: Option<String>,

        /// JSON document with the new settings
        #[arg(long)]
        settings: Option<PathBuf>,

        #[command(flatten)]
        target: Target,
    },

    /// Run one live migration phase
    Migrate {
        #[arg(value_enum)]
        phase: MigrationPhase,

        /// JSON document with migration options
        #[arg(long)]
        options: Option<PathBuf>,

        /// Address of the migration peer (start phase)
        #[arg(long, value_name = "ADDR")]
        socket: Option<String>,

        #[command(flatten)]
        target: Target,
    },

    /// Show compute system properties
    Props {
        /// Query the VmVersion property as well
        #[arg(long)]
        vmversion: bool,

        #[command(flatten)]
        target: Target,
    },

    /// Grant a compute system access to a file
    Grant { id: String, path: PathBuf },

    /// Show or set the default compute system
    Default {
        id: Option<String>,

        /// Set the default to nothing
        #[arg(long, conflicts_with = "id")]
        unset: bool,
    },

    /// List compute systems
    List {
        /// Show every system instead of only those open here
        #[arg(long)]
        all: bool,
    },

    /// Show compute service properties
    Svcprops,

    /// Close every open compute system and leave
    #[command(alias = "quit")]
    Exit,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

pub struct Shell {
    ctx: Context,
}

impl Shell {
    pub fn new(ctx: Context) -> Self {
        Self { ctx }
    }

    pub fn context(&mut self) -> &mut Context {
        &mut self.ctx
    }

    fn prompt(&self) -> String {
        match self.ctx.sessions.default_id() {
            Some(id) => format!("hcs [{}]> ", id),
            None => "hcs> ".to_string(),
        }
    }

    /// Parse and run one command line.
    pub async fn execute_line(&mut self, line: &str) -> Result<Flow> {
        let words = shell_words::split(line).context("Failed to split command line")?;
        if words.is_empty() {
            return Ok(Flow::Continue);
        }

        let parsed = match ShellLine::try_parse_from(&words) {
            Ok(parsed) => parsed,
            Err(e) if matches!(
                e.kind(),
                ErrorKind::DisplayHelp | ErrorKind::DisplayHelpOnMissingArgumentOrSubcommand
            ) =>
            {
                print!("{}", e.render());
                return Ok(Flow::Continue);
            }
            Err(e) => return Err(e.into()),
        };

        if let ShellCommand::Exit = parsed.command {
            return Ok(Flow::Exit);
        }

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        let interrupt = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::debug!("interrupt received, cancelling the current wait");
                trigger.cancel();
            }
        });

        let result = self.dispatch(parsed.command, &cancel).await;
        interrupt.abort();
        result.map(|_| Flow::Continue)
    }

    async fn dispatch(&mut self, command: ShellCommand, cancel: &CancellationToken) -> Result<()> {
        let ctx = &mut self.ctx;
        match command {
            ShellCommand::Create {
                id,
                path,
                set_default,
                timeout_ms,
            } => {
                cli::create::execute(ctx, &id, &path, set_default, timeout_ms, cancel).await?;
            }
            ShellCommand::Open { id } => cli::open::execute(ctx, &id)?,
            ShellCommand::Close { target } => cli::close::execute(ctx, &target)?,
            ShellCommand::Start { target } => cli::lifecycle::execute(ctx, Verb::Start, &target, cancel).await?,
            ShellCommand::Shutdown { target } => {
                cli::lifecycle::execute(ctx, Verb::Shutdown, &target, cancel).await?
            }
            ShellCommand::Terminate { target } => {
                cli::lifecycle::execute(ctx, Verb::Terminate, &target, cancel).await?
            }
            ShellCommand::Pause { target } => cli::lifecycle::execute(ctx, Verb::Pause, &target, cancel).await?,
            ShellCommand::Resume { target } => cli::lifecycle::execute(ctx, Verb::Resume, &target, cancel).await?,
            ShellCommand::Save { path, target } => cli::save::execute(ctx, &path, &target, cancel).await?,
            ShellCommand::Modify {
                resource_path,
                request_type,
                settings,
                target,
            } => {
                cli::modify::execute(
                    ctx,
                    &resource_path,
                    request_type.as_deref(),
                    settings.as_deref(),
                    &target,
                    cancel,
                )
                .await?
            }
            ShellCommand::Migrate {
                phase,
                options,
                socket,
                target,
            } => {
                cli::migrate::execute(ctx, phase, options.as_deref(), socket.as_deref(), &target, cancel).await?;
            }
            ShellCommand::Props { vmversion, target } => {
                cli::props::execute(ctx, vmversion, &target)?;
            }
            ShellCommand::Grant { id, path } => cli::grant::execute(ctx, &id, &path)?,
            ShellCommand::Default { id, unset } => cli::default::execute(ctx, id.as_deref(), unset)?,
            ShellCommand::List { all } => cli::list::execute(ctx, all)?,
            ShellCommand::Svcprops => {
                cli::svcprops::execute(ctx)?;
            }
            ShellCommand::Exit => {}
        }
        Ok(())
    }

    /// Print an error and any violations the callback side parked. Returns
    /// [`Flow::Exit`] when a violation was seen and the shell is set to fail
    /// fast.
    pub fn report(&self, result: Result<Flow>) -> Flow {
        let mut violated = false;
        let flow = match result {
            Ok(flow) => flow,
            Err(e) => {
                eprint!("{}", render_error(&e));
                violated = e
                    .downcast_ref::<HcsError>()
                    .is_some_and(HcsError::is_protocol_violation);
                Flow::Continue
            }
        };

        for violation in self.ctx.registry.take_violations() {
            eprintln!("protocol violation: {}", violation);
            violated = true;
        }

        if violated && self.ctx.config.fail_fast {
            eprintln!("Exiting after protocol violation (fail_fast is set)");
            return Flow::Exit;
        }
        flow
    }

    /// Run each line of `path` in order, stopping at the first failure.
    /// Blank lines and lines starting with `#` are skipped.
    pub async fn run_script(&mut self, path: &Path) -> Result<()> {
        let script = fs::read_to_string(path).context(format!("Failed to read script: {}", path.display()))?;

        for (number, line) in script.lines().enumerate() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            tracing::debug!("{}:{}: {}", path.display(), number + 1, line);
            let result = self.execute_line(line).await;
            let failed = result.is_err();
            let flow = self.report(result);
            if failed {
                anyhow::bail!("{}:{}: command failed: {}", path.display(), number + 1, line);
            }
            if flow == Flow::Exit {
                break;
            }
        }
        Ok(())
    }

    /// Read commands from the terminal until `exit` or end of input.
    pub async fn run_interactive(&mut self) -> Result<()> {
        let mut editor = DefaultEditor::new().context("Failed to initialize line editor")?;
        let history = if self.ctx.config.history {
            config::history_path()
        } else {
            None
        };
        if let Some(path) = &history {
            // missing on first run
            let _ = editor.load_history(path);
        }

        loop {
            let prompt = self.prompt();
            let line = match tokio::task::block_in_place(|| editor.readline(&prompt)) {
                Ok(line) => line,
                Err(ReadlineError::Interrupted) => continue,
                Err(ReadlineError::Eof) => break,
                Err(e) => return Err(e).context("Failed to read command"),
            };

            if !line.trim().is_empty() {
                let _ = editor.add_history_entry(line.as_str());
            }

            let result = self.execute_line(&line).await;
            if self.report(result) == Flow::Exit {
                break;
            }
        }

        if let Some(path) = &history {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent).ok();
            }
            if let Err(e) = editor.save_history(path) {
                tracing::warn!("Failed to save history to {}: {}", path.display(), e);
            }
        }
        Ok(())
    }

    /// Close every open compute system.
    pub fn shutdown(&mut self) {
        let ctx = &mut self.ctx;
        if ctx.sessions.is_empty() {
            return;
        }

        tracing::info!("Closing {} open compute system(s)", ctx.sessions.len());
        for (id, e) in ctx.sessions.close_all(ctx.engine.as_ref(), &ctx.registry) {
            eprintln!("error: failed to close '{}': {}", id, e);
        }
    }
}

/// Text printed for a failed command. Usage errors from the line parser
/// already carry their own `error:` prefix and usage hint.
pub fn render_error(e: &anyhow::Error) -> String {
    match e.downcast_ref::<clap::Error>() {
        Some(usage) => usage.render().to_string(),
        None => format!("error: {:#}\n", e),
    }
}
