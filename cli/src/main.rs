//! `warden`: run commands under the configured sandbox backend and check
//! paths, commands, and URLs against the loaded policy configuration.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::anyhow;
use clap::Parser;
use clap::Subcommand;
use clap::ValueEnum;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use warden_core::config::Config;
use warden_core::policy::FolderPolicyEngine;
use warden_core::sandbox::SandboxSession;
use warden_core::validators::FileMode;
use warden_core::validators::validate_command;
use warden_core::validators::validate_path;
use warden_core::validators::validate_url;
use warden_protocol::EXIT_CODE_VALIDATION_REJECTED;
use warden_protocol::ValidationResult;

const DEFAULT_CONFIG_FILE: &str = "warden.toml";

#[derive(Debug, Parser)]
#[command(name = "warden", about = "Sandboxed execution substrate for agent tools.")]
struct Cli {
    /// Configuration file; `warden.toml` in the working directory is used
    /// when present and this flag is omitted.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Run a program inside the sandbox and exit with its status code.
    Exec(ExecCommand),

    /// Run a shell command line inside the sandbox.
    Shell(ShellCommand),

    /// Check a path, command, or URL against the loaded policies.
    #[command(subcommand)]
    Check(CheckCommand),

    /// Print the resolved effective policy for a path as JSON.
    Policy { path: PathBuf },
}

#[derive(Debug, Parser)]
struct ExecCommand {
    /// Working directory for the sandboxed process.
    #[arg(long)]
    cwd: Option<PathBuf>,

    /// Host directory to expose inside the sandbox; repeatable. Defaults to
    /// the current directory.
    #[arg(long = "allow-dir", value_name = "DIR")]
    allow_dirs: Vec<PathBuf>,

    /// Program and arguments.
    #[arg(trailing_var_arg = true, allow_hyphen_values = true, required = true)]
    command: Vec<String>,
}

#[derive(Debug, Parser)]
struct ShellCommand {
    #[arg(long)]
    cwd: Option<PathBuf>,

    #[arg(long = "allow-dir", value_name = "DIR")]
    allow_dirs: Vec<PathBuf>,

    /// The command line, forwarded to the sandboxed shell.
    command: String,
}

#[derive(Debug, Subcommand)]
enum CheckCommand {
    /// Check a filesystem path.
    Path {
        path: PathBuf,
        #[arg(long, value_enum, default_value_t = CheckMode::Read)]
        mode: CheckMode,
    },
    /// Check a shell command.
    Command { command: String },
    /// Check a URL.
    Url { url: String },
}

#[derive(Debug, Clone, Copy, ValueEnum)]
enum CheckMode {
    Read,
    Write,
    Delete,
}

impl From<CheckMode> for FileMode {
    fn from(mode: CheckMode) -> Self {
        match mode {
            CheckMode::Read => FileMode::Read,
            CheckMode::Write => FileMode::Write,
            CheckMode::Delete => FileMode::Delete,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref())?;
    let engine = FolderPolicyEngine::from_config(&config);

    match cli.command {
        Command::Exec(cmd) => run_exec(cmd, &config, &engine),
        Command::Shell(cmd) => run_shell(cmd, &config, &engine),
        Command::Check(check) => {
            let verdict = match check {
                CheckCommand::Path { path, mode } => {
                    validate_path(&path, mode.into(), &engine, &config)
                }
                CheckCommand::Command { command } => {
                    validate_command(&command, None, &engine, &config)
                }
                CheckCommand::Url { url } => validate_url(&url, &config),
            };
            report_verdict(&verdict);
            if !verdict.allowed {
                std::process::exit(EXIT_CODE_VALIDATION_REJECTED);
            }
            Ok(())
        }
        Command::Policy { path } => {
            let effective = engine.effective(&path);
            println!("{}", serde_json::to_string_pretty(&effective)?);
            Ok(())
        }
    }
}

fn load_config(path: Option<&Path>) -> anyhow::Result<Config> {
    match path {
        Some(path) => {
            Config::load(path).with_context(|| format!("loading {}", path.display()))
        }
        None => {
            let default = Path::new(DEFAULT_CONFIG_FILE);
            if default.is_file() {
                Config::load(default).context("loading warden.toml")
            } else {
                debug!("no config file found, using defaults");
                Ok(Config::default())
            }
        }
    }
}

fn run_exec(cmd: ExecCommand, config: &Config, engine: &FolderPolicyEngine) -> anyhow::Result<()> {
    let program = cmd
        .command
        .first()
        .ok_or_else(|| anyhow!("no command specified"))?
        .clone();

    let verdict = validate_command(&program, cmd.cwd.as_deref(), engine, config);
    if !verdict.allowed {
        report_verdict(&verdict);
        std::process::exit(EXIT_CODE_VALIDATION_REJECTED);
    }

    let args = cmd.command[1..].to_vec();
    let allow_dirs = effective_allow_dirs(cmd.allow_dirs)?;
    let cwd = cmd.cwd;

    run_sandboxed(config, allow_dirs, move |session, cancel| async move {
        session
            .execute(&program, &args, cwd.as_deref(), &cancel)
            .await
    })
}

fn run_shell(cmd: ShellCommand, config: &Config, engine: &FolderPolicyEngine) -> anyhow::Result<()> {
    let verdict = validate_command(&cmd.command, cmd.cwd.as_deref(), engine, config);
    if !verdict.allowed {
        report_verdict(&verdict);
        std::process::exit(EXIT_CODE_VALIDATION_REJECTED);
    }

    let allow_dirs = effective_allow_dirs(cmd.allow_dirs)?;
    let command = cmd.command;
    let cwd = cmd.cwd;

    run_sandboxed(config, allow_dirs, move |session, cancel| async move {
        session
            .execute_shell(&command, cwd.as_deref(), &cancel)
            .await
    })
}

fn effective_allow_dirs(dirs: Vec<PathBuf>) -> anyhow::Result<Vec<PathBuf>> {
    if dirs.is_empty() {
        Ok(vec![std::env::current_dir().context("resolving current directory")?])
    } else {
        Ok(dirs)
    }
}

/// Bring a session up, run one operation with Ctrl-C wired to cooperative
/// cancellation, tear the session down, and exit with the child's code.
fn run_sandboxed<F, Fut>(
    config: &Config,
    allow_dirs: Vec<PathBuf>,
    operation: F,
) -> anyhow::Result<()>
where
    F: FnOnce(std::sync::Arc<SandboxSession>, CancellationToken) -> Fut,
    Fut: std::future::Future<Output = warden_core::Result<warden_protocol::CommandResult>>,
{
    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("building runtime")?;

    let session = std::sync::Arc::new(SandboxSession::new(config)?);
    let cancel = CancellationToken::new();

    let result = runtime.block_on(async {
        let signal_cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                signal_cancel.cancel();
            }
        });

        session.initialize(&allow_dirs).await?;
        let result = operation(session.clone(), cancel).await;
        let disposed = session.dispose().await;
        let result = result?;
        disposed?;
        Ok::<_, warden_core::WardenErr>(result)
    })?;

    print!("{}", result.stdout);
    eprint!("{}", result.stderr);
    std::process::exit(result.exit_code);
}

fn report_verdict(verdict: &ValidationResult) {
    if verdict.allowed {
        println!("allowed");
    } else {
        eprintln!(
            "rejected: {}",
            verdict.reason.as_deref().unwrap_or("policy violation")
        );
    }
}
