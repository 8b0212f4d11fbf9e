//! One scoped connection to a compute target and the payload wire contract.
//!
//! A runner is started with the payload path as its only argument. It reads
//! the payload, does its work, and writes its JSON result to the path given
//! in the payload's `result_path` field (also exported as
//! `AUTOTUNE_RESULT_PATH`). Its output goes to `stdout.log` and `stderr.log`
//! next to the payload.

use std::path::{Path, PathBuf};
use std::time::Duration;

use at_types::{RemoteError, RemoteResult};
use serde::Serialize;
use serde_json::Value;
use walkdir::WalkDir;

use crate::paths::{LogicalPath, ARTIFACTS_DIR, PLUGINS_DIR, SRC_DIR, UPLOADS_DIR};
use crate::process::tail;
use crate::transport::{shell_quote, Transport, HOUSEKEEPING_TIMEOUT};

pub const PAYLOAD_FILE: &str = "payload.json";
pub const RESULT_FILE: &str = "result.json";
pub const STDOUT_LOG: &str = "stdout.log";
pub const STDERR_LOG: &str = "stderr.log";
pub const RESULT_PATH_ENV: &str = "AUTOTUNE_RESULT_PATH";

const VENV_PYTHON: &str = ".venv/bin/python3";
const STDERR_TAIL_LINES: usize = 20;

/// What to launch for a payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Entrypoint {
    /// `python -m <module>` from the remote root, venv interpreter if present.
    PythonModule(String),
    /// Any executable, invoked as `<program> <payload path>`.
    Program(String),
}

impl Entrypoint {
    /// Shell snippet that replaces the shell with the runner.
    fn launch(&self, payload_path: &str) -> String {
        match self {
            Self::PythonModule(module) => format!(
                "PY=python3; if [ -f {venv} ]; then PY={venv}; fi; exec \"$PY\" -m {module} {payload}",
                venv = VENV_PYTHON,
                module = module,
                payload = shell_quote(payload_path),
            ),
            Self::Program(program) => format!("exec {} {}", program, shell_quote(payload_path)),
        }
    }
}

pub struct RemoteSession {
    transport: Box<dyn Transport>,
    root: String,
}

impl std::fmt::Debug for RemoteSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteSession")
            .field("target", &self.transport.describe())
            .field("root", &self.root)
            .finish()
    }
}

impl RemoteSession {
    /// Connect and resolve `work_dir` (a leading `~` is expanded remotely).
    pub async fn open(mut transport: Box<dyn Transport>, work_dir: &str) -> RemoteResult<Self> {
        transport.connect().await?;
        let root = match expand_home(transport.as_ref(), work_dir).await {
            Ok(root) => root,
            Err(e) => {
                let _ = transport.disconnect().await;
                return Err(e);
            }
        };
        tracing::debug!(target_host = %transport.describe(), root = %root, "Remote session opened");
        Ok(Self { transport, root })
    }

    /// Release the connection.
    pub async fn close(mut self) -> RemoteResult<()> {
        tracing::debug!(target_host = %self.transport.describe(), "Closing remote session");
        self.transport.disconnect().await
    }

    pub fn root(&self) -> &str {
        &self.root
    }

    pub fn transport(&self) -> &dyn Transport {
        self.transport.as_ref()
    }

    pub fn path(&self, relative: &str) -> String {
        format!("{}/{}", self.root, relative.trim_start_matches('/'))
    }

    /// Create the remote layout and upload sources, dataset and plugins.
    ///
    /// Safe to call repeatedly; existing files are overwritten.
    pub async fn prepare_environment(
        &self,
        source_dir: Option<&Path>,
        dataset: Option<&Path>,
        plugins: &[PathBuf],
    ) -> RemoteResult<String> {
        for dir in [SRC_DIR, UPLOADS_DIR, PLUGINS_DIR, ARTIFACTS_DIR] {
            self.transport.mkdir_p(&self.path(dir)).await?;
        }

        if let Some(source) = source_dir {
            let count = self.upload_dir(source, &self.path(SRC_DIR)).await?;
            tracing::debug!(files = count, "Uploaded runner sources");
        }

        if let Some(dataset) = dataset {
            let remote = LogicalPath::upload(dataset)
                .map(|logical| logical.resolve(&self.root))
                .ok_or_else(|| RemoteError::Transfer {
                    path: dataset.display().to_string(),
                    message: "dataset path has no file name".to_string(),
                })?;
            self.transport.upload_file(dataset, &remote).await?;
        }

        for plugin in plugins {
            let name = plugin.file_name().ok_or_else(|| RemoteError::Transfer {
                path: plugin.display().to_string(),
                message: "plugin path has no file name".to_string(),
            })?;
            let remote = format!("{}/{}", self.path(PLUGINS_DIR), name.to_string_lossy());
            self.transport.upload_file(plugin, &remote).await?;
        }

        Ok(self.root.clone())
    }

    /// Upload a local tree, skipping dot-files and `__pycache__`.
    pub async fn upload_dir(&self, local_dir: &Path, remote_dir: &str) -> RemoteResult<usize> {
        let mut uploaded = 0;
        let walker = WalkDir::new(local_dir)
            .into_iter()
            .filter_entry(|entry| entry.depth() == 0 || !is_skipped(entry.file_name()));

        for entry in walker {
            let entry = entry.map_err(|e| RemoteError::Transfer {
                path: local_dir.display().to_string(),
                message: e.to_string(),
            })?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry
                .path()
                .strip_prefix(local_dir)
                .unwrap_or_else(|_| entry.path());
            let remote = format!(
                "{}/{}",
                remote_dir.trim_end_matches('/'),
                relative.to_string_lossy()
            );
            self.transport.upload_file(entry.path(), &remote).await?;
            uploaded += 1;
        }
        Ok(uploaded)
    }

    /// Download a remote tree. Files that fail to copy are logged and skipped.
    pub async fn download_dir(&self, remote_dir: &str, local_dir: &Path) -> RemoteResult<usize> {
        let mut downloaded = 0;
        let mut pending = vec![(remote_dir.trim_end_matches('/').to_string(), local_dir.to_path_buf())];

        while let Some((remote, local)) = pending.pop() {
            tokio::fs::create_dir_all(&local).await?;
            for entry in self.transport.list_dir(&remote).await? {
                let remote_child = format!("{}/{}", remote, entry.name);
                let local_child = local.join(&entry.name);
                if entry.is_dir {
                    pending.push((remote_child, local_child));
                    continue;
                }
                match self.transport.download_file(&remote_child, &local_child).await {
                    Ok(()) => downloaded += 1,
                    Err(e) => {
                        tracing::warn!(path = %remote_child, error = %e, "Skipping artifact")
                    }
                }
            }
        }
        Ok(downloaded)
    }

    /// Pull `remote_dir` into `local_dir`. `false` when there is nothing to pull.
    pub async fn retrieve_artifacts(&self, remote_dir: &str, local_dir: &Path) -> RemoteResult<bool> {
        if !self.transport.exists(remote_dir).await? {
            return Ok(false);
        }
        let count = self.download_dir(remote_dir, local_dir).await?;
        tracing::info!(remote = %remote_dir, local = %local_dir.display(), files = count, "Retrieved artifacts");
        Ok(true)
    }

    /// Write the payload into `run_dir`, run the entrypoint, and return its
    /// parsed result.
    pub async fn run_payload(
        &self,
        run_dir: &str,
        entrypoint: &Entrypoint,
        payload: &Value,
        timeout: Duration,
    ) -> RemoteResult<Value> {
        let run_dir = run_dir.trim_end_matches('/');
        let payload_path = format!("{run_dir}/{PAYLOAD_FILE}");
        let result_path = format!("{run_dir}/{RESULT_FILE}");

        self.transport.mkdir_p(run_dir).await?;
        // stale results from an earlier attempt must not be picked up
        self.transport
            .exec(&format!("rm -f {}", shell_quote(&result_path)), HOUSEKEEPING_TIMEOUT)
            .await?;

        let mut payload = payload.clone();
        if let Value::Object(map) = &mut payload {
            map.insert("result_path".to_string(), Value::String(result_path.clone()));
        }
        let bytes = serde_json::to_vec_pretty(&payload).map_err(|e| RemoteError::Transfer {
            path: payload_path.clone(),
            message: e.to_string(),
        })?;
        self.transport.write_file(&payload_path, &bytes).await?;

        let command = format!(
            "cd {root} && export {env}={result} && {entry} > {stdout} 2> {stderr}",
            root = shell_quote(&self.root),
            env = RESULT_PATH_ENV,
            result = shell_quote(&result_path),
            entry = entrypoint.launch(&payload_path),
            stdout = shell_quote(&format!("{run_dir}/{STDOUT_LOG}")),
            stderr = shell_quote(&format!("{run_dir}/{STDERR_LOG}")),
        );
        tracing::info!(
            target_host = %self.transport.describe(),
            run_dir,
            timeout_secs = timeout.as_secs(),
            "Running payload"
        );
        let output = self.transport.exec(&command, timeout).await?;

        if !output.success() {
            let stderr = self
                .transport
                .read_file(&format!("{run_dir}/{STDERR_LOG}"))
                .await
                .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                .unwrap_or_else(|_| output.stderr.clone());
            return Err(RemoteError::CommandFailed {
                exit_code: output.exit_code,
                stderr: tail(&stderr, STDERR_TAIL_LINES),
            });
        }

        if !self.transport.exists(&result_path).await? {
            return Err(RemoteError::MissingResult { path: result_path });
        }
        let bytes = self.transport.read_file(&result_path).await?;
        serde_json::from_slice(&bytes).map_err(|e| RemoteError::InvalidResult {
            path: result_path,
            message: e.to_string(),
        })
    }

    /// Parse a JSON file if it exists and is complete.
    ///
    /// Files caught mid-write read as `None`.
    pub async fn read_json_if_exists(&self, remote_path: &str) -> RemoteResult<Option<Value>> {
        if !self.transport.exists(remote_path).await? {
            return Ok(None);
        }
        let bytes = self.transport.read_file(remote_path).await?;
        match serde_json::from_slice(&bytes) {
            Ok(value) => Ok(Some(value)),
            Err(e) => {
                tracing::debug!(path = remote_path, error = %e, "Ignoring unreadable JSON file");
                Ok(None)
            }
        }
    }
}

fn is_skipped(name: &std::ffi::OsStr) -> bool {
    let name = name.to_string_lossy();
    name.starts_with('.') || name == "__pycache__"
}

async fn expand_home(transport: &dyn Transport, path: &str) -> RemoteResult<String> {
    if path == "~" {
        return transport.home_dir().await;
    }
    match path.strip_prefix("~/") {
        Some(rest) => Ok(format!("{}/{}", transport.home_dir().await?, rest)),
        None => Ok(path.to_string()),
    }
}

/// Result of a connectivity check against a compute target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ConnectionTest {
    pub success: bool,
    pub message: String,
    pub python_version: Option<String>,
}

impl ConnectionTest {
    fn failed(message: impl Into<String>) -> Self {
        Self {
            success: false,
            message: message.into(),
            python_version: None,
        }
    }
}

impl From<&RemoteError> for ConnectionTest {
    fn from(err: &RemoteError) -> Self {
        let (success, message) = match err {
            RemoteError::Authentication { .. } => (false, "Authentication failed".to_string()),
            other => other.outcome(),
        };
        Self {
            success,
            message,
            python_version: None,
        }
    }
}

/// Connect, check that `python3` runs, and disconnect.
pub async fn test_connection(mut transport: Box<dyn Transport>) -> ConnectionTest {
    if let Err(e) = transport.connect().await {
        return ConnectionTest::from(&e);
    }

    let result = match transport
        .exec("python3 --version", Duration::from_secs(30))
        .await
    {
        Ok(output) if output.success() => {
            // older interpreters print the version on stderr
            let version = if output.stdout.trim().is_empty() {
                output.stderr.trim()
            } else {
                output.stdout.trim()
            };
            ConnectionTest {
                success: true,
                message: "Connection successful".to_string(),
                python_version: Some(version.to_string()),
            }
        }
        Ok(output) => ConnectionTest::failed(format!("Python not found: {}", output.stderr.trim())),
        Err(e) => ConnectionTest::from(&e),
    };

    if let Err(e) = transport.disconnect().await {
        tracing::warn!(target_host = %transport.describe(), error = %e, "Disconnect after connection test failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::local::LocalTransport;
    use serde_json::json;
    use std::os::unix::fs::PermissionsExt;
    use tempfile::TempDir;

    async fn session(dir: &TempDir) -> RemoteSession {
        let root = dir.path().join("remote");
        RemoteSession::open(Box::new(LocalTransport::new()), &root.to_string_lossy())
            .await
            .unwrap()
    }

    fn script(dir: &TempDir, name: &str, body: &str) -> String {
        let path = dir.path().join(name);
        std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path.to_string_lossy().into_owned()
    }

    #[tokio::test]
    async fn prepare_environment_builds_layout() {
        let dir = TempDir::new().unwrap();
        let src = dir.path().join("runner");
        std::fs::create_dir_all(src.join("pkg/__pycache__")).unwrap();
        std::fs::create_dir_all(src.join(".git")).unwrap();
        std::fs::write(src.join("pkg/train.py"), "print('hi')").unwrap();
        std::fs::write(src.join("pkg/__pycache__/train.pyc"), "x").unwrap();
        std::fs::write(src.join(".git/HEAD"), "ref").unwrap();
        std::fs::write(src.join(".env"), "SECRET=1").unwrap();
        let dataset = dir.path().join("qa.csv");
        std::fs::write(&dataset, "question,answer\nq,a\n").unwrap();
        let plugin = dir.path().join("judge.py");
        std::fs::write(&plugin, "def score(): pass").unwrap();

        let session = session(&dir).await;
        let root = session
            .prepare_environment(Some(&src), Some(&dataset), &[plugin])
            .await
            .unwrap();
        let root = PathBuf::from(root);

        assert!(root.join("artifacts").is_dir());
        assert!(root.join("src/pkg/train.py").is_file());
        assert!(!root.join("src/pkg/__pycache__").exists());
        assert!(!root.join("src/.git").exists());
        assert!(!root.join("src/.env").exists());
        assert!(root.join("data/uploads/qa.csv").is_file());
        assert!(root.join("data/plugins/judge.py").is_file());

        // idempotent
        session.prepare_environment(Some(&src), None, &[]).await.unwrap();
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn run_payload_returns_result_and_injects_result_path() {
        let dir = TempDir::new().unwrap();
        let program = script(
            &dir,
            "runner.sh",
            r#"grep -q '"result_path"' "$1" || exit 9
echo '{"metrics": {"train_loss": 0.25}}' > "$AUTOTUNE_RESULT_PATH""#,
        );
        let session = session(&dir).await;
        let run_dir = session.path("artifacts/run_1");

        let result = session
            .run_payload(
                &run_dir,
                &Entrypoint::Program(program),
                &json!({"experiment_id": "e1"}),
                Duration::from_secs(10),
            )
            .await
            .unwrap();
        assert_eq!(result["metrics"]["train_loss"], 0.25);

        let payload: Value = serde_json::from_slice(
            &std::fs::read(format!("{run_dir}/{PAYLOAD_FILE}")).unwrap(),
        )
        .unwrap();
        assert_eq!(payload["result_path"], format!("{run_dir}/{RESULT_FILE}"));
        session.close().await.unwrap();
    }

    #[tokio::test]
    async fn non_zero_exit_reports_stderr_tail() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "crash.sh", "echo 'CUDA out of memory' >&2\nexit 3");
        let session = session(&dir).await;

        let err = session
            .run_payload(
                &session.path("artifacts/run_2"),
                &Entrypoint::Program(program),
                &json!({}),
                Duration::from_secs(10),
            )
            .await
            .unwrap_err();
        match err {
            RemoteError::CommandFailed { exit_code, stderr } => {
                assert_eq!(exit_code, 3);
                assert!(stderr.contains("CUDA out of memory"));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn clean_exit_without_result_is_missing_result() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "quiet.sh", "exit 0");
        let session = session(&dir).await;

        let err = session
            .run_payload(
                &session.path("artifacts/run_3"),
                &Entrypoint::Program(program),
                &json!({}),
                Duration::from_secs(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::MissingResult { .. }));
        assert!(err.is_infrastructure());
    }

    #[tokio::test]
    async fn garbage_result_is_invalid() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "garbage.sh", r#"echo 'not json' > "$AUTOTUNE_RESULT_PATH""#);
        let session = session(&dir).await;

        let err = session
            .run_payload(
                &session.path("artifacts/run_4"),
                &Entrypoint::Program(program),
                &json!({}),
                Duration::from_secs(10),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::InvalidResult { .. }));
    }

    #[tokio::test]
    async fn slow_runner_times_out() {
        let dir = TempDir::new().unwrap();
        let program = script(&dir, "slow.sh", "sleep 5");
        let session = session(&dir).await;

        let err = session
            .run_payload(
                &session.path("artifacts/run_5"),
                &Entrypoint::Program(program),
                &json!({}),
                Duration::from_millis(200),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RemoteError::Timeout { .. }));
    }

    #[tokio::test]
    async fn retrieve_artifacts_copies_tree() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir).await;
        let remote = session.path("artifacts/exp_1");
        std::fs::create_dir_all(format!("{remote}/checkpoints")).unwrap();
        std::fs::write(format!("{remote}/metrics.json"), "{}").unwrap();
        std::fs::write(format!("{remote}/checkpoints/last.ckpt"), "weights").unwrap();

        let local = dir.path().join("local/exp_1");
        assert!(session.retrieve_artifacts(&remote, &local).await.unwrap());
        assert!(local.join("metrics.json").is_file());
        assert_eq!(
            std::fs::read_to_string(local.join("checkpoints/last.ckpt")).unwrap(),
            "weights"
        );

        let missing = session.path("artifacts/nope");
        assert!(!session
            .retrieve_artifacts(&missing, &dir.path().join("local/nope"))
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn partial_json_reads_as_none() {
        let dir = TempDir::new().unwrap();
        let session = session(&dir).await;
        let path = session.path("progress.json");
        assert_eq!(session.read_json_if_exists(&path).await.unwrap(), None);

        std::fs::create_dir_all(session.root()).unwrap();
        std::fs::write(&path, r#"{"global_step": 4"#).unwrap();
        assert_eq!(session.read_json_if_exists(&path).await.unwrap(), None);

        std::fs::write(&path, r#"{"global_step": 4}"#).unwrap();
        assert_eq!(
            session.read_json_if_exists(&path).await.unwrap(),
            Some(json!({"global_step": 4}))
        );
    }

    #[test]
    fn python_entrypoint_prefers_venv() {
        let command = Entrypoint::PythonModule("runners.train".into()).launch("/r/payload.json");
        assert!(command.starts_with("PY=python3; if [ -f .venv/bin/python3 ]"));
        assert!(command.ends_with("exec \"$PY\" -m runners.train '/r/payload.json'"));
    }
}
