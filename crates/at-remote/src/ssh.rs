//! SSH transport built on the system `ssh` and `scp` binaries.
//!
//! `connect` starts one ControlMaster per transport; every later command and
//! copy is multiplexed over that socket, so the transport holds exactly one
//! authenticated connection. Password targets go through `sshpass -e` with
//! the password in the `SSHPASS` environment variable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use async_trait::async_trait;
use at_types::{AuthMethod, ComputeTarget, RemoteError, RemoteResult};
use tokio::process::Command;
use uuid::Uuid;

use crate::process::{run_detaching, run_with_timeout, tail};
use crate::transport::{shell_quote, CommandOutput, Transport};

const CONNECT_TIMEOUT_SECS: u64 = 15;
/// ssh reserves exit status 255 for its own errors.
const SSH_ERROR_EXIT: i32 = 255;

pub struct SshTransport {
    target: ComputeTarget,
    control_path: PathBuf,
    connected: bool,
    transfer_timeout: Duration,
}

impl std::fmt::Debug for SshTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SshTransport")
            .field("target", &self.target)
            .field("control_path", &self.control_path)
            .field("connected", &self.connected)
            .finish()
    }
}

impl SshTransport {
    pub fn new(target: ComputeTarget) -> Self {
        // unix socket paths are short; keep it in the temp dir with a short name
        let short_id = Uuid::new_v4().simple().to_string();
        let control_path = std::env::temp_dir().join(format!("at-ssh-{}", &short_id[..12]));
        Self {
            target,
            control_path,
            connected: false,
            transfer_timeout: Duration::from_secs(1800),
        }
    }

    pub fn with_transfer_timeout(mut self, timeout: Duration) -> Self {
        self.transfer_timeout = timeout;
        self
    }

    pub fn target(&self) -> &ComputeTarget {
        &self.target
    }

    fn key_path(&self) -> Option<PathBuf> {
        match &self.target.auth {
            AuthMethod::Key { key_path } => {
                let raw = key_path.as_deref().unwrap_or("~/.ssh/id_rsa");
                Some(expand_local_home(raw))
            }
            AuthMethod::Password { .. } => None,
        }
    }

    /// `ssh`/`scp` invocation, wrapped in `sshpass` for password targets.
    fn base_command(&self, program: &str) -> Command {
        let mut cmd = match &self.target.auth {
            AuthMethod::Password { password } => {
                let mut cmd = Command::new("sshpass");
                cmd.arg("-e").arg(program).env("SSHPASS", password);
                cmd
            }
            AuthMethod::Key { .. } => Command::new(program),
        };
        cmd.arg("-o")
            .arg(format!("ControlPath={}", self.control_path.display()))
            .arg("-o")
            .arg(format!("ConnectTimeout={CONNECT_TIMEOUT_SECS}"))
            .arg("-o")
            .arg("StrictHostKeyChecking=accept-new");
        match self.key_path() {
            Some(key) => {
                cmd.arg("-o").arg("BatchMode=yes").arg("-i").arg(key);
            }
            None => {
                cmd.arg("-o")
                    .arg("BatchMode=no")
                    .arg("-o")
                    .arg("PreferredAuthentications=password,keyboard-interactive");
            }
        }
        // ssh takes the port as -p, scp as -P
        let port_flag = if program == "scp" { "-P" } else { "-p" };
        cmd.arg(port_flag).arg(self.target.ssh_port.to_string());
        cmd
    }

    fn ensure_connected(&self) -> RemoteResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(RemoteError::NotConnected)
        }
    }

    fn remote_spec(&self, remote_path: &str) -> String {
        format!("{}:{}", self.target.destination(), remote_path)
    }

    async fn scp(&self, from: &str, to: &str, path_for_errors: &str) -> RemoteResult<()> {
        self.ensure_connected()?;
        let mut cmd = self.base_command("scp");
        cmd.arg("-q").arg(from).arg(to);
        let output = run_with_timeout(cmd, None, self.transfer_timeout).await?;
        if output.success() {
            Ok(())
        } else {
            Err(RemoteError::Transfer {
                path: path_for_errors.to_string(),
                message: tail(&output.stderr, 5),
            })
        }
    }
}

/// Classify a failed ssh invocation.
fn connection_failure(output: &CommandOutput) -> RemoteError {
    let stderr = output.stderr.trim();
    let lowered = stderr.to_lowercase();
    if lowered.contains("permission denied") || lowered.contains("authentication failed") {
        RemoteError::Authentication {
            message: tail(stderr, 3),
        }
    } else {
        RemoteError::Connection {
            message: if stderr.is_empty() {
                format!("ssh exited with status {}", output.exit_code)
            } else {
                tail(stderr, 3)
            },
        }
    }
}

fn expand_local_home(path: &str) -> PathBuf {
    match (path.strip_prefix("~/"), dirs::home_dir()) {
        (Some(rest), Some(home)) => home.join(rest),
        _ => PathBuf::from(path),
    }
}

#[async_trait]
impl Transport for SshTransport {
    async fn connect(&mut self) -> RemoteResult<()> {
        if self.connected {
            return Ok(());
        }
        let mut cmd = self.base_command("ssh");
        // -M master, -N no command, -f background once authenticated
        cmd.arg("-M")
            .arg("-N")
            .arg("-f")
            .arg("-o")
            .arg("ControlPersist=yes")
            .arg(self.target.destination());

        tracing::debug!(target_host = %self.describe(), "Opening SSH control connection");
        let timeout = Duration::from_secs(CONNECT_TIMEOUT_SECS * 2);
        let output = run_detaching(cmd, timeout)
            .await
            .map_err(|e| match e {
                RemoteError::Io(io) => RemoteError::Connection {
                    message: format!("failed to start ssh: {io}"),
                },
                other => other,
            })?;
        if !output.success() {
            return Err(connection_failure(&output));
        }
        self.connected = true;
        tracing::info!(target_host = %self.describe(), "SSH connection established");
        Ok(())
    }

    async fn disconnect(&mut self) -> RemoteResult<()> {
        if !self.connected {
            return Ok(());
        }
        self.connected = false;
        let mut cmd = self.base_command("ssh");
        cmd.arg("-O").arg("exit").arg(self.target.destination());
        let output = run_with_timeout(cmd, None, Duration::from_secs(CONNECT_TIMEOUT_SECS)).await?;
        if !output.success() {
            tracing::warn!(
                target_host = %self.describe(),
                stderr = %output.stderr.trim(),
                "SSH control connection did not exit cleanly"
            );
        }
        let _ = std::fs::remove_file(&self.control_path);
        tracing::debug!(target_host = %self.describe(), "SSH connection closed");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn describe(&self) -> String {
        format!("{}:{}", self.target.destination(), self.target.ssh_port)
    }

    async fn exec(&self, command: &str, timeout: Duration) -> RemoteResult<CommandOutput> {
        self.ensure_connected()?;
        let mut cmd = self.base_command("ssh");
        cmd.arg(self.target.destination()).arg("--").arg(command);
        tracing::trace!(target_host = %self.describe(), command, "ssh exec");

        let output = run_with_timeout(cmd, None, timeout).await?;
        if output.exit_code == SSH_ERROR_EXIT {
            return Err(connection_failure(&output));
        }
        Ok(output)
    }

    async fn write_file(&self, remote_path: &str, contents: &[u8]) -> RemoteResult<()> {
        self.ensure_connected()?;
        let mut cmd = self.base_command("ssh");
        cmd.arg(self.target.destination())
            .arg("--")
            .arg(format!("cat > {}", shell_quote(remote_path)));
        let output = run_with_timeout(cmd, Some(contents), self.transfer_timeout).await?;
        if output.exit_code == SSH_ERROR_EXIT {
            return Err(connection_failure(&output));
        }
        if !output.success() {
            return Err(RemoteError::Transfer {
                path: remote_path.to_string(),
                message: tail(&output.stderr, 5),
            });
        }
        Ok(())
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> RemoteResult<()> {
        if let Some(parent) = Path::new(remote_path).parent() {
            self.mkdir_p(&parent.to_string_lossy()).await?;
        }
        let from = local_path.to_string_lossy();
        self.scp(&from, &self.remote_spec(remote_path), remote_path)
            .await
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> RemoteResult<()> {
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let to = local_path.to_string_lossy();
        self.scp(&self.remote_spec(remote_path), &to, remote_path)
            .await
    }
}

impl Drop for SshTransport {
    fn drop(&mut self) {
        // Last resort when a session was dropped without `close`.
        if self.connected {
            let _ = std::process::Command::new("ssh")
                .arg("-o")
                .arg(format!("ControlPath={}", self.control_path.display()))
                .arg("-O")
                .arg("exit")
                .arg(self.target.destination())
                .stdin(std::process::Stdio::null())
                .stdout(std::process::Stdio::null())
                .stderr(std::process::Stdio::null())
                .spawn();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn target(auth: AuthMethod) -> ComputeTarget {
        let mut target = ComputeTarget::new("gpu", "10.0.0.7", "ml", auth);
        target.ssh_port = 2222;
        target
    }

    fn args(cmd: &Command) -> Vec<String> {
        cmd.as_std()
            .get_args()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn key_auth_uses_batch_mode_and_identity() {
        let transport = SshTransport::new(target(AuthMethod::Key {
            key_path: Some("/keys/id_ed25519".into()),
        }));
        let cmd = transport.base_command("ssh");
        assert_eq!(cmd.as_std().get_program(), "ssh");
        let args = args(&cmd);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(args.windows(2).any(|w| w == ["-i", "/keys/id_ed25519"]));
        assert!(args.windows(2).any(|w| w == ["-p", "2222"]));
    }

    #[test]
    fn password_auth_goes_through_sshpass() {
        let transport = SshTransport::new(target(AuthMethod::Password {
            password: "s3cret".into(),
        }));
        let cmd = transport.base_command("scp");
        assert_eq!(cmd.as_std().get_program(), "sshpass");
        let args = args(&cmd);
        assert_eq!(&args[..2], &["-e".to_string(), "scp".to_string()]);
        assert!(!args.iter().any(|a| a.contains("s3cret")));
        assert!(args.windows(2).any(|w| w == ["-P", "2222"]));
        let env: Vec<_> = cmd.as_std().get_envs().collect();
        assert!(env
            .iter()
            .any(|(k, v)| *k == "SSHPASS" && v.map(|v| v == "s3cret").unwrap_or(false)));
    }

    #[test]
    fn classifies_auth_failures() {
        let denied = CommandOutput {
            exit_code: 255,
            stdout: String::new(),
            stderr: "ml@10.0.0.7: Permission denied (publickey).".into(),
        };
        assert!(matches!(
            connection_failure(&denied),
            RemoteError::Authentication { .. }
        ));

        let refused = CommandOutput {
            exit_code: 255,
            stdout: String::new(),
            stderr: "ssh: connect to host 10.0.0.7 port 2222: Connection refused".into(),
        };
        assert!(matches!(
            connection_failure(&refused),
            RemoteError::Connection { .. }
        ));
    }

    #[tokio::test]
    async fn commands_require_connection() {
        let transport = SshTransport::new(target(AuthMethod::Key { key_path: None }));
        assert!(matches!(
            transport.exec("true", Duration::from_secs(1)).await,
            Err(RemoteError::NotConnected)
        ));
    }
}
