//! Container-runtime-backed sandbox, available on every platform.
//!
//! `initialize` starts one long-lived container with all capabilities
//! dropped and the allowed host directories mounted under `/workspace`;
//! every execution is an `exec` against that container, and `dispose`
//! removes it.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::debug;
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

/// Budget for container create/remove, independent of the per-command
/// timeout: image pulls can dwarf any single execution.
const LIFECYCLE_TIMEOUT: Duration = Duration::from_secs(120);

pub(crate) struct ContainerProvider {
    timeout: Duration,
    image: String,
    runtime_pref: Option<String>,
    runtime: Option<PathBuf>,
    mappings: Vec<DirMapping>,
    container_id: Option<String>,
}

impl ContainerProvider {
    pub(crate) fn new(config: &Config) -> Self {
        Self {
            timeout: config.command.timeout(),
            image: config.sandbox.container_image.clone(),
            runtime_pref: config.sandbox.runtime.clone(),
            runtime: None,
            mappings: Vec::new(),
            container_id: None,
        }
    }

    fn require_ready(&self) -> Result<(&Path, &str)> {
        match (self.runtime.as_deref(), self.container_id.as_deref()) {
            (Some(runtime), Some(id)) => Ok((runtime, id)),
            _ => Err(WardenErr::State(
                "sandbox session is not initialized".to_string(),
            )),
        }
    }

    async fn run(
        &self,
        command: Vec<String>,
        cwd: Option<&Path>,
        cancel: &CancellationToken,
    ) -> Result<CommandResult> {
        let (runtime, id) = self.require_ready()?;
        let cwd = match cwd {
            Some(cwd) => Some(container_cwd(&self.mappings, cwd)?),
            None => None,
        };

        let mut cmd = Command::new(runtime);
        cmd.args(exec_args(id, cwd.as_deref(), command));
        run_captured(cmd, self.timeout, cancel).await
    }
}

#[async_trait]
impl SandboxProvider for ContainerProvider {
    fn kind(&self) -> SandboxKind {
        SandboxKind::Container
    }

    fn is_initialized(&self) -> bool {
        self.container_id.is_some()
    }

    async fn initialize(&mut self, allowed_dirs: &[PathBuf]) -> Result<()> {
        if self.is_initialized() {
            return Ok(());
        }

        let runtime = resolve_runtime(self.runtime_pref.as_deref())?;
        let mappings = workspace_mappings(allowed_dirs)?;

        let mut cmd = Command::new(&runtime);
        cmd.args(create_args(&self.image, &mappings));
        let created = run_captured(cmd, LIFECYCLE_TIMEOUT, &CancellationToken::new()).await?;
        if !created.success() {
            return Err(WardenErr::Sandbox(format!(
                "container create failed: {}",
                created.stderr.trim()
            )));
        }
        let id = created.stdout.trim().to_string();
        if id.is_empty() {
            return Err(WardenErr::Sandbox(
                "container runtime reported no container id".to_string(),
            ));
        }

        debug!("container sandbox ready, id = {id}");
        self.runtime = Some(runtime);
        self.mappings = mappings;
        self.container_id = Some(id);
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
        let Some(id) = self.container_id.take() else {
            return Ok(());
        };
        self.mappings.clear();

        let Some(runtime) = self.runtime.take() else {
            return Ok(());
        };

        let mut cmd = Command::new(&runtime);
        cmd.args(["rm", "-f", id.as_str()]);
        let removed = run_captured(cmd, LIFECYCLE_TIMEOUT, &CancellationToken::new()).await?;
        if !removed.success() {
            return Err(WardenErr::Sandbox(format!(
                "failed to remove container {id}: {}",
                removed.stderr.trim()
            )));
        }
        Ok(())
    }
}

fn resolve_runtime(preferred: Option<&str>) -> Result<PathBuf> {
    if let Some(name) = preferred {
        return which::which(name).map_err(|_| {
            WardenErr::Configuration(format!("container runtime '{name}' not found on PATH"))
        });
    }

    ["docker", "podman"]
        .iter()
        .find_map(|name| which::which(name).ok())
        .ok_or_else(|| {
            WardenErr::Configuration("no container runtime (docker, podman) on PATH".to_string())
        })
}

/// Arguments for the long-lived container: every capability dropped,
/// privilege escalation forbidden, allowed directories mounted read-write,
/// and a no-op foreground command so `exec` has a target.
fn create_args(image: &str, mappings: &[DirMapping]) -> Vec<String> {
    let mut args = vec![
        "run".to_string(),
        "-d".to_string(),
        "--cap-drop=ALL".to_string(),
        "--security-opt=no-new-privileges".to_string(),
    ];
    for mapping in mappings {
        args.push("-v".to_string());
        args.push(format!(
            "{}:{}",
            mapping.host.display(),
            mapping.sandbox.display()
        ));
    }
    args.push(image.to_string());
    args.push("sleep".to_string());
    args.push("infinity".to_string());
    args
}

fn exec_args(id: &str, cwd: Option<&Path>, command: Vec<String>) -> Vec<String> {
    let mut args = vec!["exec".to_string()];
    if let Some(cwd) = cwd {
        args.push("-w".to_string());
        args.push(cwd.to_string_lossy().into_owned());
    }
    args.push(id.to_string());
    args.extend(command);
    args
}

fn container_cwd(mappings: &[DirMapping], cwd: &Path) -> Result<PathBuf> {
    let resolved = canonicalize_best_effort(cwd);
    for mapping in mappings {
        if let Ok(rest) = resolved.strip_prefix(&mapping.host) {
            return Ok(mapping.sandbox.join(rest));
        }
        if resolved.starts_with(&mapping.sandbox) {
            return Ok(resolved);
        }
    }
    Err(WardenErr::Configuration(format!(
        "working directory '{}' is outside the allowed directories",
        resolved.display()
    )))
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
    fn create_args_harden_the_container() {
        let mappings = vec![
            mapping("/srv/data", "/workspace/data"),
            mapping("/home/agent/proj", "/workspace/proj"),
        ];
        let args = create_args("alpine:latest", &mappings);

        assert_eq!(args[..4], ["run", "-d", "--cap-drop=ALL",
            "--security-opt=no-new-privileges"]);
        assert!(args.windows(2).any(|w| w == ["-v", "/srv/data:/workspace/data"]));
        assert!(
            args.windows(2)
                .any(|w| w == ["-v", "/home/agent/proj:/workspace/proj"])
        );
        assert_eq!(args[args.len() - 3..], ["alpine:latest", "sleep", "infinity"]);
    }

    #[test]
    fn exec_args_target_the_container() {
        let args = exec_args(
            "abc123",
            Some(Path::new("/workspace/proj")),
            vec!["ls".to_string(), "-la".to_string()],
        );
        assert_eq!(args, ["exec", "-w", "/workspace/proj", "abc123", "ls", "-la"]);

        let bare = exec_args("abc123", None, vec!["true".to_string()]);
        assert_eq!(bare, ["exec", "abc123", "true"]);
    }

    #[test]
    fn cwd_is_mapped_into_the_container() {
        let mappings = vec![mapping("/home/agent/proj", "/workspace/proj")];

        assert_eq!(
            container_cwd(&mappings, Path::new("/home/agent/proj/src")).unwrap(),
            PathBuf::from("/workspace/proj/src")
        );
        assert!(container_cwd(&mappings, Path::new("/etc")).is_err());
    }
}
