//! Transport abstraction over a compute target.

use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use at_types::{RemoteError, RemoteResult};

/// Result of one remote command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// One entry of a remote directory listing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Default bound for the short housekeeping commands (mkdir, test, cat).
pub const HOUSEKEEPING_TIMEOUT: Duration = Duration::from_secs(60);

/// Quote `value` for a POSIX shell.
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

/// Connection to one compute target.
///
/// A transport represents a single logical connection: `connect` opens it,
/// `disconnect` releases it, and every other call requires it to be open.
/// Only `exec`, `write_file` and the two copy operations must be provided;
/// the remaining filesystem helpers are expressed through `exec`.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Open the connection and authenticate.
    async fn connect(&mut self) -> RemoteResult<()>;

    /// Release the connection. Calling it twice is harmless.
    async fn disconnect(&mut self) -> RemoteResult<()>;

    fn is_connected(&self) -> bool;

    /// Human-readable destination for logs.
    fn describe(&self) -> String;

    /// Run `command` through the remote shell, bounded by `timeout`.
    ///
    /// A non-zero exit is reported in the output, not as an error.
    async fn exec(&self, command: &str, timeout: Duration) -> RemoteResult<CommandOutput>;

    async fn write_file(&self, remote_path: &str, contents: &[u8]) -> RemoteResult<()>;

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> RemoteResult<()>;

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> RemoteResult<()>;

    async fn read_file(&self, remote_path: &str) -> RemoteResult<Vec<u8>> {
        let output = self
            .exec(&format!("cat {}", shell_quote(remote_path)), HOUSEKEEPING_TIMEOUT)
            .await?;
        if !output.success() {
            return Err(RemoteError::Transfer {
                path: remote_path.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(output.stdout.into_bytes())
    }

    async fn exists(&self, remote_path: &str) -> RemoteResult<bool> {
        let output = self
            .exec(&format!("test -e {}", shell_quote(remote_path)), HOUSEKEEPING_TIMEOUT)
            .await?;
        Ok(output.success())
    }

    async fn mkdir_p(&self, remote_path: &str) -> RemoteResult<()> {
        let output = self
            .exec(&format!("mkdir -p {}", shell_quote(remote_path)), HOUSEKEEPING_TIMEOUT)
            .await?;
        if !output.success() {
            return Err(RemoteError::CommandFailed {
                exit_code: output.exit_code,
                stderr: output.stderr,
            });
        }
        Ok(())
    }

    /// Entries of `remote_path`, without `.` and `..`.
    async fn list_dir(&self, remote_path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        let output = self
            .exec(&format!("ls -1Ap {}", shell_quote(remote_path)), HOUSEKEEPING_TIMEOUT)
            .await?;
        if !output.success() {
            return Err(RemoteError::Transfer {
                path: remote_path.to_string(),
                message: output.stderr.trim().to_string(),
            });
        }
        Ok(parse_listing(&output.stdout))
    }

    /// Absolute home directory of the remote user.
    async fn home_dir(&self) -> RemoteResult<String> {
        let output = self.exec("echo $HOME", HOUSEKEEPING_TIMEOUT).await?;
        let home = output.stdout.trim();
        if !output.success() || home.is_empty() {
            return Err(RemoteError::CommandFailed {
                exit_code: output.exit_code,
                stderr: format!("could not resolve remote home directory: {}", output.stderr),
            });
        }
        Ok(home.to_string())
    }
}

/// Parse `ls -1Ap` output: one name per line, directories end in `/`.
pub(crate) fn parse_listing(stdout: &str) -> Vec<RemoteEntry> {
    stdout
        .lines()
        .filter(|line| !line.is_empty())
        .map(|line| match line.strip_suffix('/') {
            Some(dir) => RemoteEntry {
                name: dir.to_string(),
                is_dir: true,
            },
            None => RemoteEntry {
                name: line.to_string(),
                is_dir: false,
            },
        })
        .collect()
}
