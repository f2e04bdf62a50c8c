use std::process::Stdio;
use std::time::Duration;

use tokio::io::AsyncRead;
use tokio::io::AsyncReadExt;
use tokio::process::Child;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use warden_protocol::CommandResult;
use warden_protocol::EXIT_CODE_SANDBOX_REFUSED;

use crate::error::Result;
use crate::error::WardenErr;

/// Per-stream capture ceiling. Reads keep draining past this point so the
/// child never blocks on a full pipe; the excess is discarded.
pub(crate) const MAX_CAPTURED_BYTES: usize = 1024 * 1024;

/// Spawn `cmd` and capture its output, enforcing the wall-clock budget and
/// the caller's cancellation token. On expiry or cancellation the child and
/// its whole descendant tree are killed before the call returns, and the
/// outcome degrades to the uniform timed-out result.
pub(crate) async fn run_captured(
    mut cmd: Command,
    timeout: Duration,
    cancel: &CancellationToken,
) -> Result<CommandResult> {
    cmd.stdin(Stdio::null());
    cmd.stdout(Stdio::piped());
    cmd.stderr(Stdio::piped());
    cmd.kill_on_drop(true);

    // Children get their own process group so a timeout can take the whole
    // tree down with one signal.
    #[cfg(unix)]
    unsafe {
        cmd.pre_exec(|| {
            libc::setsid();
            Ok(())
        });
    }

    let mut child = cmd.spawn().map_err(|err| WardenErr::os("spawn", err))?;

    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| WardenErr::Sandbox("child stdout pipe missing".to_string()))?;
    let stderr = child
        .stderr
        .take()
        .ok_or_else(|| WardenErr::Sandbox("child stderr pipe missing".to_string()))?;

    let stdout_task = tokio::spawn(read_capped(stdout));
    let stderr_task = tokio::spawn(read_capped(stderr));

    let status = tokio::select! {
        status = child.wait() => Some(status.map_err(|err| WardenErr::os("wait", err))?),
        _ = tokio::time::sleep(timeout) => None,
        _ = cancel.cancelled() => None,
    };

    match status {
        Some(status) => {
            let stdout = stdout_task.await.unwrap_or_default();
            let stderr = stderr_task.await.unwrap_or_default();
            Ok(CommandResult {
                exit_code: exit_code_of(status),
                stdout,
                stderr,
            })
        }
        None => {
            kill_process_tree(&mut child).await;
            stdout_task.abort();
            stderr_task.abort();
            Ok(CommandResult::timed_out())
        }
    }
}

fn exit_code_of(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        status
            .code()
            .or_else(|| status.signal().map(|sig| 128 + sig))
            .unwrap_or(EXIT_CODE_SANDBOX_REFUSED)
    }
    #[cfg(not(unix))]
    {
        status.code().unwrap_or(EXIT_CODE_SANDBOX_REFUSED)
    }
}

async fn read_capped<R: AsyncRead + Unpin>(mut reader: R) -> String {
    let mut captured = Vec::new();
    let mut chunk = [0u8; 8192];
    loop {
        match reader.read(&mut chunk).await {
            Ok(0) | Err(_) => break,
            Ok(n) => {
                if captured.len() < MAX_CAPTURED_BYTES {
                    let take = n.min(MAX_CAPTURED_BYTES - captured.len());
                    captured.extend_from_slice(&chunk[..take]);
                }
            }
        }
    }
    String::from_utf8_lossy(&captured).into_owned()
}

async fn kill_process_tree(child: &mut Child) {
    #[cfg(unix)]
    if let Some(pid) = child.id() {
        // The child called setsid, so its pid is the group id of every
        // descendant that has not escaped into a new session.
        unsafe {
            libc::killpg(pid as i32, libc::SIGKILL);
        }
    }
    let _ = child.kill().await;
    let _ = child.wait().await;
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn sh(script: &str) -> Command {
        let mut cmd = Command::new("/bin/sh");
        cmd.arg("-c").arg(script);
        cmd
    }

    #[tokio::test]
    async fn captures_stdout_and_stderr() {
        let result = run_captured(
            sh("echo out; echo err >&2"),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout, "out\n");
        assert_eq!(result.stderr, "err\n");
    }

    #[tokio::test]
    async fn passes_through_nonzero_exit_codes() {
        let result = run_captured(
            sh("exit 7"),
            Duration::from_secs(5),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result.exit_code, 7);
        assert!(!result.success());
    }

    #[tokio::test]
    async fn timeout_kills_the_whole_tree() {
        let result = run_captured(
            sh("sleep 30"),
            Duration::from_millis(200),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert_eq!(result, CommandResult::timed_out());
    }

    #[tokio::test]
    async fn cancellation_behaves_like_a_timeout() {
        let cancel = CancellationToken::new();
        cancel.cancel();

        let result = run_captured(sh("sleep 30"), Duration::from_secs(30), &cancel)
            .await
            .unwrap();

        assert_eq!(result, CommandResult::timed_out());
    }

    #[tokio::test]
    async fn output_is_capped_but_the_child_still_drains() {
        // 2 MiB of output against a 1 MiB cap.
        let result = run_captured(
            sh("head -c 2097152 /dev/zero"),
            Duration::from_secs(10),
            &CancellationToken::new(),
        )
        .await
        .unwrap();

        assert!(result.success());
        assert_eq!(result.stdout.len(), MAX_CAPTURED_BYTES);
    }
}
