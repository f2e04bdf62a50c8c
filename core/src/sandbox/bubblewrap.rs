//! Bubblewrap-backed sandbox for Linux.
//!
//! The filesystem view is built from scratch on every execution: read-only
//! binds for the system toolchain, fresh tmpfs for the scratch areas, and a
//! read-write bind of each allowed host directory at
//! `/workspace/<basename>`. Namespaces are fully unshared, so the sandboxed
//! process sees no host network and cannot outlive its parent.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::trace;
use warden_protocol::CommandResult;
use warden_protocol::SandboxKind;

use crate::config::Config;
use crate::error::Result;
use crate::error::WardenErr;
use crate::path_utils::canonicalize_best_effort;
use crate::sandbox::DirMapping;
use crate::sandbox::SandboxProvider;
use crate::sandbox::exec::run_captured;
use crate::sandbox::workspace_mappings;

/// System roots kept readable inside the sandbox so dynamically linked
/// binaries and interpreters keep working.
const SYSTEM_READ_ROOTS: &[&str] = &["/usr", "/lib", "/lib64", "/bin"];

pub(crate) struct BubblewrapProvider {
    timeout: Duration,
    bwrap_exe: Option<PathBuf>,
    mappings: Vec<DirMapping>,
}

impl BubblewrapProvider {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            timeout: config.command.timeout(),
            bwrap_exe: None,
            mappings: Vec::new(),
        }
    }

    fn require_ready(&self) -> Result<&Path> {
        self.bwrap_exe
            .as_deref()
            .ok_or_else(|| WardenErr::State("sandbox session is not initialized".to_string()))
    }

    async fn run(
        &self,
        command: Vec<String>,
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let bwrap = self.require_ready()?;
        let args = build_bwrap_args(&self.mappings, command, cwd)?;
        trace!("bwrap sandbox command = {}", render_command_line(&args));

        let mut cmd = Command::new(bwrap);
        cmd.args(&args);
        run_captured(cmd, self.timeout, cancel).await
    }
}

#[async_trait]
impl SandboxProvider for BubblewrapProvider {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Bubblewrap
    }

    fn is_initialized(&self) -> bool {
        self.bwrap_exe.is_some()
    }

    async fn initialize(&mut self, allowed_dirs: &[PathBuf]) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let bwrap = which::which("bwrap").map_err(|_| {
            WardenErr::Configuration("bwrap helper not found on PATH".to_string())
        })?;
        let mappings = workspace_mappings(allowed_dirs)?;

        self.bwrap_exe = Some(bwrap);
        self.mappings = mappings;
        Ok(())
    }

    async fn execute(
        &self,
        exe: &str,
        args: &[String],
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let mut command = Vec::with_capacity(args.len() + 1);
        command.push(exe.to_string());
        command.extend(args.iter().cloned());
        self.run(command, cwd, cancel).await
    }

    async fn execute_shell(
        &self,
        command: &str,
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        self.run(
            vec![
                "/bin/sh".to_string(),
                "-c".to_string(),
                command.to_string(),
            ],
            cwd,
            cancel,
        )
        .await
    }

    async fn dispose(&mut self) -> Result<()> {
        // Nothing is held between executions; forget the resolved helper and
        // the mount plan.
        self.bwrap_exe = None;
        self.mappings.clear();
        Ok(())
    }
}

/// Build the full `bwrap` argument vector for one execution.
fn build_bwrap_args(
    mappings: &[DirMapping],
    command: Vec<String>,
    cwd: Option<&Path>,
) -> Result<Vec<String>> {
    let mut args: Vec<String> = Vec::new();

    for root in SYSTEM_READ_ROOTS {
        if Path::new(root).exists() {
            args.push("--ro-bind".to_string());
            args.push(root.to_string());
            args.push(root.to_string());
        }
    }

    for scratch in ["/tmp", "/run"] {
        args.push("--tmpfs".to_string());
        args.push(scratch.to_string());
    }
    args.push("--proc".to_string());
    args.push("/proc".to_string());
    args.push("--dev".to_string());
    args.push("/dev".to_string());

    args.push("--unshare-all".to_string());
    args.push("--die-with-parent".to_string());
    args.push("--new-session".to_string());

    for mapping in mappings {
        args.push("--bind".to_string());
        args.push(mapping.host.to_string_lossy().into_owned());
        args.push(mapping.sandbox.to_string_lossy().into_owned());
    }

    args.push("--chdir".to_string());
    args.push(sandbox_cwd(mappings, cwd)?.to_string_lossy().into_owned());

    args.push("--".to_string());
    args.extend(command);
    Ok(args)
}

/// Rewrite the caller's working directory to its container-side path. A cwd
/// outside every allowed directory is a hard error rather than a silent
/// fallback.
fn sandbox_cwd(mappings: &[DirMapping], cwd: Option<&Path>) -> Result<PathBuf> {
    let Some(cwd) = cwd else {
        return Ok(mappings
            .first()
            .map(|m| m.sandbox.clone())
            .unwrap_or_else(|| PathBuf::from("/")));
    };

    let resolved = canonicalize_best_effort(cwd);
    for mapping in mappings {
        if let Ok(rest) = resolved.strip_prefix(&mapping.host) {
            return Ok(mapping.sandbox.join(rest));
        }
        // Already a container-side path.
        if resolved.starts_with(&mapping.sandbox) {
            return Ok(resolved);
        }
    }

    Err(WardenErr::Configuration(format!(
        "working directory '{}' is outside the allowed directories",
        resolved.display()
    )))
}

/// Render an argument vector as a single shell-safe line for trace logs.
/// Arguments containing whitespace or quote characters are double-quoted
/// with internal double quotes (and backslashes) backslash-escaped.
pub(crate) fn render_command_line(args: &[String]) -> String {
    args.iter()
        .map(|arg| quote_posix(arg))
        .collect::<Vec<_>>()
        .join(" ")
}

fn quote_posix(arg: &str) -> String {
    let needs_quotes = arg.is_empty()
        || arg
            .chars()
            .any(|c| c.is_whitespace() || c == '"' || c == '\'');
    if !needs_quotes {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');
    for c in arg.chars() {
        if c == '"' || c == '\\' {
            quoted.push('\\');
        }
        quoted.push(c);
    }
    quoted.push('"');
    quoted
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn mapping(host: &str, sandbox: &str) -> DirMapping {
        DirMapping {
            host: PathBuf::from(host),
            sandbox: PathBuf::from(sandbox),
        }
    }

    #[test]
    fn system_roots_are_bound_read_only() {
        let args =
            build_bwrap_args(&[], vec!["/bin/true".to_string()], None).expect("bwrap args");

        if Path::new("/usr").exists() {
            assert!(
                args.windows(3)
                    .any(|window| window == ["--ro-bind", "/usr", "/usr"])
            );
        }
        assert!(args.windows(2).any(|w| w == ["--tmpfs", "/tmp"]));
        assert!(args.windows(2).any(|w| w == ["--tmpfs", "/run"]));
        assert!(args.windows(2).any(|w| w == ["--proc", "/proc"]));
        assert!(args.windows(2).any(|w| w == ["--dev", "/dev"]));
        for flag in ["--unshare-all", "--die-with-parent", "--new-session"] {
            assert!(args.contains(&flag.to_string()), "missing {flag}");
        }
    }

    #[test]
    fn allowed_directories_map_under_workspace() {
        let mappings = vec![mapping("/home/agent/project", "/workspace/project")];
        let args = build_bwrap_args(&mappings, vec!["/bin/true".to_string()], None)
            .expect("bwrap args");

        assert!(args.windows(3).any(|window| {
            window == ["--bind", "/home/agent/project", "/workspace/project"]
        }));
        // Default cwd is the first mapped workspace directory.
        assert!(
            args.windows(2)
                .any(|w| w == ["--chdir", "/workspace/project"])
        );
    }

    #[test]
    fn cwd_under_an_allowed_directory_is_rewritten() {
        let mappings = vec![mapping("/home/agent/project", "/workspace/project")];
        let args = build_bwrap_args(
            &mappings,
            vec!["/bin/true".to_string()],
            Some(Path::new("/home/agent/project/src")),
        )
        .expect("bwrap args");

        assert!(
            args.windows(2)
                .any(|w| w == ["--chdir", "/workspace/project/src"])
        );
    }

    #[test]
    fn cwd_outside_allowed_directories_is_rejected() {
        let mappings = vec![mapping("/home/agent/project", "/workspace/project")];
        let err = build_bwrap_args(
            &mappings,
            vec!["/bin/true".to_string()],
            Some(Path::new("/etc")),
        )
        .unwrap_err();

        assert!(matches!(err, WardenErr::Configuration(_)));
    }

    #[test]
    fn command_follows_the_separator() {
        let args = build_bwrap_args(
            &[],
            vec!["/bin/echo".to_string(), "hi".to_string()],
            None,
        )
        .expect("bwrap args");

        let sep = args.iter().position(|a| a == "--").expect("separator");
        assert_eq!(&args[sep + 1..], ["/bin/echo", "hi"]);
    }

    #[test]
    fn quoting_round_trips_through_a_posix_tokenizer() {
        let tricky = vec![
            "/bin/echo".to_string(),
            "plain".to_string(),
            "has space".to_string(),
            r#"quote"inside"#.to_string(),
            "back\\slash and space".to_string(),
        ];
        let line = render_command_line(&tricky);
        assert_eq!(shlex::split(&line), Some(tricky));
    }

    #[test]
    fn plain_arguments_are_left_unquoted() {
        assert_eq!(quote_posix("/bin/true"), "/bin/true");
        assert_eq!(quote_posix("has space"), r#""has space""#);
        assert_eq!(quote_posix(r#"a"b"#), r#""a\"b""#);
    }
}
