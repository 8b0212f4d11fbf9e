//! Engine settings read from `AUTOTUNE_*` environment variables.

use std::path::{Path, PathBuf};
use std::time::Duration;

use at_types::{config_error, AtResult};

pub const DEFAULT_ADDR: &str = "0.0.0.0:8090";

/// Paths, timeouts and the listen address of one engine process.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineSettings {
    pub data_dir: PathBuf,
    pub db_path: PathBuf,
    pub catalog_path: PathBuf,
    /// Local artifacts tree. Must be named `artifacts` so payload paths map
    /// onto the remote layout.
    pub artifacts_dir: PathBuf,
    pub predictor_dir: PathBuf,
    /// Runner sources uploaded to compute targets.
    pub source_dir: Option<PathBuf>,
    pub addr: String,
    pub train_timeout: Duration,
    pub eval_timeout: Duration,
    pub probe_timeout: Duration,
    pub poll_interval: Duration,
}

impl EngineSettings {
    /// Defaults rooted at `data_dir`.
    pub fn with_data_dir<P: AsRef<Path>>(data_dir: P) -> Self {
        let data_dir = data_dir.as_ref().to_path_buf();
        Self {
            db_path: data_dir.join("autotune.db"),
            catalog_path: data_dir.join("catalog.json"),
            artifacts_dir: data_dir.join("artifacts"),
            predictor_dir: data_dir.join("predictor"),
            source_dir: None,
            addr: DEFAULT_ADDR.to_string(),
            train_timeout: Duration::from_secs(3600),
            eval_timeout: Duration::from_secs(300),
            probe_timeout: Duration::from_secs(600),
            poll_interval: Duration::from_secs(5),
            data_dir,
        }
    }

    pub fn from_env() -> AtResult<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build settings from an arbitrary variable source.
    pub fn from_lookup<F>(lookup: F) -> AtResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        let data_dir = var("AUTOTUNE_DATA_DIR")
            .map(PathBuf::from)
            .unwrap_or_else(|| {
                dirs::data_dir()
                    .unwrap_or_else(|| PathBuf::from("."))
                    .join("autotune")
            });
        let mut settings = Self::with_data_dir(data_dir);

        if let Some(path) = var("AUTOTUNE_DB_PATH") {
            settings.db_path = PathBuf::from(path);
        }
        if let Some(path) = var("AUTOTUNE_CATALOG_PATH") {
            settings.catalog_path = PathBuf::from(path);
        }
        if let Some(path) = var("AUTOTUNE_ARTIFACTS_DIR") {
            settings.artifacts_dir = PathBuf::from(path);
        }
        if let Some(path) = var("AUTOTUNE_PREDICTOR_DIR") {
            settings.predictor_dir = PathBuf::from(path);
        }
        settings.source_dir = var("AUTOTUNE_SOURCE_DIR").map(PathBuf::from);
        if let Some(addr) = var("AUTOTUNE_ADDR") {
            settings.addr = addr;
        }

        let seconds = |key: &str, default: Duration| -> AtResult<Duration> {
            match var(key) {
                None => Ok(default),
                Some(raw) => match raw.trim().parse::<u64>() {
                    Ok(0) => Err(config_error!("{} must be positive", key)),
                    Ok(secs) => Ok(Duration::from_secs(secs)),
                    Err(_) => Err(config_error!("{} is not a number of seconds: {}", key, raw)),
                },
            }
        };
        settings.train_timeout = seconds("AUTOTUNE_TRAIN_TIMEOUT_SECS", settings.train_timeout)?;
        settings.eval_timeout = seconds("AUTOTUNE_EVAL_TIMEOUT_SECS", settings.eval_timeout)?;
        settings.probe_timeout = seconds("AUTOTUNE_PROBE_TIMEOUT_SECS", settings.probe_timeout)?;
        settings.poll_interval = seconds("AUTOTUNE_POLL_INTERVAL_SECS", settings.poll_interval)?;

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AtResult<()> {
        if self.artifacts_dir.file_name().and_then(|n| n.to_str()) != Some("artifacts") {
            return Err(config_error!(
                "artifacts directory must be named 'artifacts': {}",
                self.artifacts_dir.display()
            ));
        }
        Ok(())
    }

    /// Create the local directories the engine writes into.
    pub fn ensure_dirs(&self) -> AtResult<()> {
        std::fs::create_dir_all(&self.data_dir)?;
        std::fs::create_dir_all(&self.artifacts_dir)?;
        std::fs::create_dir_all(&self.predictor_dir)?;
        Ok(())
    }
}
