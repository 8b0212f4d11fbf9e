use std::path::Path;
use std::time::Duration;

use async_trait::async_trait;
use at_types::{RemoteError, RemoteResult};
use tokio::process::Command;

use crate::process::run_with_timeout;
use crate::transport::{CommandOutput, RemoteEntry, Transport};

/// Runs everything on this machine through `sh -c` and the local filesystem.
///
/// Used for delegates without a compute target.
#[derive(Debug, Default)]
pub struct LocalTransport {
    connected: bool,
}

impl LocalTransport {
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_connected(&self) -> RemoteResult<()> {
        if self.connected {
            Ok(())
        } else {
            Err(RemoteError::NotConnected)
        }
    }
}

fn transfer_error(path: &str, e: std::io::Error) -> RemoteError {
    RemoteError::Transfer {
        path: path.to_string(),
        message: e.to_string(),
    }
}

#[async_trait]
impl Transport for LocalTransport {
    async fn connect(&mut self) -> RemoteResult<()> {
        self.connected = true;
        Ok(())
    }

    async fn disconnect(&mut self) -> RemoteResult<()> {
        self.connected = false;
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.connected
    }

    fn describe(&self) -> String {
        "localhost".to_string()
    }

    async fn exec(&self, command: &str, timeout: Duration) -> RemoteResult<CommandOutput> {
        self.ensure_connected()?;
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        run_with_timeout(cmd, None, timeout).await
    }

    async fn write_file(&self, remote_path: &str, contents: &[u8]) -> RemoteResult<()> {
        self.ensure_connected()?;
        if let Some(parent) = Path::new(remote_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transfer_error(remote_path, e))?;
        }
        tokio::fs::write(remote_path, contents)
            .await
            .map_err(|e| transfer_error(remote_path, e))
    }

    async fn upload_file(&self, local_path: &Path, remote_path: &str) -> RemoteResult<()> {
        self.ensure_connected()?;
        if Path::new(remote_path) == local_path {
            return Ok(());
        }
        if let Some(parent) = Path::new(remote_path).parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transfer_error(remote_path, e))?;
        }
        tokio::fs::copy(local_path, remote_path)
            .await
            .map(|_| ())
            .map_err(|e| transfer_error(remote_path, e))
    }

    async fn download_file(&self, remote_path: &str, local_path: &Path) -> RemoteResult<()> {
        self.ensure_connected()?;
        if Path::new(remote_path) == local_path {
            return Ok(());
        }
        if let Some(parent) = local_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| transfer_error(remote_path, e))?;
        }
        tokio::fs::copy(remote_path, local_path)
            .await
            .map(|_| ())
            .map_err(|e| transfer_error(remote_path, e))
    }

    async fn read_file(&self, remote_path: &str) -> RemoteResult<Vec<u8>> {
        self.ensure_connected()?;
        tokio::fs::read(remote_path)
            .await
            .map_err(|e| transfer_error(remote_path, e))
    }

    async fn exists(&self, remote_path: &str) -> RemoteResult<bool> {
        self.ensure_connected()?;
        Ok(tokio::fs::try_exists(remote_path).await.unwrap_or(false))
    }

    async fn mkdir_p(&self, remote_path: &str) -> RemoteResult<()> {
        self.ensure_connected()?;
        tokio::fs::create_dir_all(remote_path)
            .await
            .map_err(|e| transfer_error(remote_path, e))
    }

    async fn list_dir(&self, remote_path: &str) -> RemoteResult<Vec<RemoteEntry>> {
        self.ensure_connected()?;
        let mut dir = tokio::fs::read_dir(remote_path)
            .await
            .map_err(|e| transfer_error(remote_path, e))?;
        let mut entries = Vec::new();
        while let Some(entry) = dir
            .next_entry()
            .await
            .map_err(|e| transfer_error(remote_path, e))?
        {
            let is_dir = entry
                .file_type()
                .await
                .map_err(|e| transfer_error(remote_path, e))?
                .is_dir();
            entries.push(RemoteEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                is_dir,
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn home_dir(&self) -> RemoteResult<String> {
        self.ensure_connected()?;
        dirs::home_dir()
            .map(|p| p.to_string_lossy().into_owned())
            .ok_or_else(|| RemoteError::Connection {
                message: "could not resolve local home directory".to_string(),
            })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn requires_connection() {
        let transport = LocalTransport::new();
        let err = transport
            .exec("true", Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::NotConnected));
    }

    #[tokio::test]
    async fn filesystem_round_trip() {
        let dir = TempDir::new().unwrap();
        let root = dir.path().to_string_lossy().into_owned();
        let mut transport = LocalTransport::new();
        transport.connect().await.unwrap();

        let file = format!("{root}/a/b/payload.json");
        transport.write_file(&file, b"{}").await.unwrap();
        assert!(transport.exists(&file).await.unwrap());
        assert_eq!(transport.read_file(&file).await.unwrap(), b"{}");

        transport.mkdir_p(&format!("{root}/a/c")).await.unwrap();
        let names: Vec<(String, bool)> = transport
            .list_dir(&format!("{root}/a"))
            .await
            .unwrap()
            .into_iter()
            .map(|e| (e.name, e.is_dir))
            .collect();
        assert_eq!(names, vec![("b".to_string(), true), ("c".to_string(), true)]);

        transport.disconnect().await.unwrap();
        assert!(!transport.is_connected());
    }

    #[tokio::test]
    async fn exec_reports_non_zero_exit() {
        let mut transport = LocalTransport::new();
        transport.connect().await.unwrap();
        let output = transport
            .exec("echo nope >&2; exit 2", Duration::from_secs(5))
            .await
            .unwrap();
        assert!(!output.success());
        assert_eq!(output.stderr.trim(), "nope");
    }
}
