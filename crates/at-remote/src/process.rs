use std::process::Stdio;
use std::time::Duration;

use at_types::{RemoteError, RemoteResult};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;

use crate::transport::CommandOutput;

/// Spawn `cmd`, feed it `stdin`, and collect its output within `timeout`.
///
/// The child is killed if the timeout fires or the returned future is
/// dropped.
pub(crate) async fn run_with_timeout(
    mut cmd: Command,
    stdin: Option<&[u8]>,
    timeout: Duration,
) -> RemoteResult<CommandOutput> {
    cmd.stdin(if stdin.is_some() {
        Stdio::piped()
    } else {
        Stdio::null()
    })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .kill_on_drop(true);

    let mut child = cmd.spawn()?;

    if let Some(bytes) = stdin {
        if let Some(mut pipe) = child.stdin.take() {
            pipe.write_all(bytes).await?;
            pipe.shutdown().await?;
        }
    }

    match tokio::time::timeout(timeout, child.wait_with_output()).await {
        Ok(Ok(output)) => Ok(CommandOutput {
            // killed by a signal
            exit_code: output.status.code().unwrap_or(-1),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        }),
        Ok(Err(e)) => Err(RemoteError::Io(e)),
        Err(_) => Err(RemoteError::Timeout {
            timeout_seconds: timeout.as_secs(),
        }),
    }
}

/// Run a command that leaves a daemon behind (`ssh -M -f`) within `timeout`.
///
/// The daemon inherits the child's stdio, so pipes would stay open after
/// the child exits. Stdout is discarded and stderr goes to a temp file that
/// is read once the child itself has exited.
pub(crate) async fn run_detaching(mut cmd: Command, timeout: Duration) -> RemoteResult<CommandOutput> {
    let stderr_file = tempfile::NamedTempFile::new()?;
    cmd.stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::from(stderr_file.reopen()?))
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    let status = match tokio::time::timeout(timeout, child.wait()).await {
        Ok(status) => status?,
        Err(_) => {
            return Err(RemoteError::Timeout {
                timeout_seconds: timeout.as_secs(),
            })
        }
    };
    let stderr = tokio::fs::read(stderr_file.path()).await?;
    Ok(CommandOutput {
        exit_code: status.code().unwrap_or(-1),
        stdout: String::new(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
    })
}

/// Last `max_lines` lines of `text`, for error messages.
pub(crate) fn tail(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.trim_end().lines().collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn captures_exit_code_and_streams() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo out; echo err >&2; exit 3");
        let output = run_with_timeout(cmd, None, Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(output.exit_code, 3);
        assert_eq!(output.stdout.trim(), "out");
        assert_eq!(output.stderr.trim(), "err");
    }

    #[tokio::test]
    async fn feeds_stdin() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("cat");
        let output = run_with_timeout(cmd, Some(b"payload"), Duration::from_secs(10))
            .await
            .unwrap();
        assert_eq!(output.stdout, "payload");
    }

    #[tokio::test]
    async fn detaching_run_returns_when_child_exits() {
        let mut cmd = Command::new("sh");
        // the background sleep keeps the inherited stderr open
        cmd.arg("-c").arg("echo 'master started' >&2; sleep 5 >&2 & exit 0");
        let started = std::time::Instant::now();
        let output = run_detaching(cmd, Duration::from_secs(10)).await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(3));
        assert!(output.success());
        assert_eq!(output.stderr.trim(), "master started");
    }

    #[tokio::test]
    async fn detaching_run_reports_failure() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("echo 'Permission denied (publickey).' >&2; exit 255");
        let output = run_detaching(cmd, Duration::from_secs(10)).await.unwrap();
        assert_eq!(output.exit_code, 255);
        assert!(output.stderr.contains("Permission denied"));
    }

    #[tokio::test]
    async fn times_out() {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg("sleep 5");
        let err = run_with_timeout(cmd, None, Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout { .. }));
    }

    #[test]
    fn tail_keeps_last_lines() {
        assert_eq!(tail("a\nb\nc\n", 2), "b\nc");
        assert_eq!(tail("only", 5), "only");
    }
}
