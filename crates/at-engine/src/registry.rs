//! Process-wide liveness state shared between the job tasks, the training
//! delegates and status readers.

use std::sync::{Arc, OnceLock};

use dashmap::{DashMap, DashSet};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

/// Stop flags keyed by job or experiment id.
#[derive(Debug, Default)]
pub struct StopRegistry {
    flags: DashMap<Uuid, bool>,
}

impl StopRegistry {
    pub fn request_stop(&self, id: Uuid) {
        self.flags.insert(id, true);
    }

    pub fn should_stop(&self, id: Uuid) -> bool {
        self.flags.get(&id).map(|flag| *flag).unwrap_or(false)
    }

    pub fn clear(&self, id: Uuid) {
        self.flags.remove(&id);
    }
}

/// Training progress as reported by the runner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct Progress {
    pub global_step: u64,
    pub epoch: f64,
    pub max_steps: u64,
}

impl Progress {
    /// Read a runner's `progress.json`. Missing or malformed fields count as 0.
    pub fn from_json(value: &Value) -> Self {
        let int = |key: &str| {
            value
                .get(key)
                .and_then(|v| v.as_u64().or_else(|| v.as_f64().map(|f| f.max(0.0) as u64)))
                .unwrap_or(0)
        };
        Self {
            global_step: int("global_step"),
            epoch: value.get("epoch").and_then(Value::as_f64).unwrap_or(0.0),
            max_steps: int("max_steps"),
        }
    }
}

/// Latest progress per experiment.
#[derive(Debug, Default)]
pub struct ProgressRegistry {
    entries: DashMap<Uuid, Progress>,
}

impl ProgressRegistry {
    pub fn report(&self, experiment_id: Uuid, progress: Progress) {
        self.entries.insert(experiment_id, progress);
    }

    pub fn get(&self, experiment_id: Uuid) -> Option<Progress> {
        self.entries.get(&experiment_id).map(|entry| *entry)
    }

    pub fn clear(&self, experiment_id: Uuid) {
        self.entries.remove(&experiment_id);
    }
}

/// Registries bundled for injection.
///
/// Production code uses [`Liveness::global`]; tests build their own so runs
/// do not see each other's flags.
#[derive(Debug, Clone, Default)]
pub struct Liveness {
    pub stop: Arc<StopRegistry>,
    pub progress: Arc<ProgressRegistry>,
    /// Jobs deleted while their task was still running.
    pub deleted: Arc<DashSet<Uuid>>,
}

impl Liveness {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn global() -> &'static Liveness {
        static GLOBAL: OnceLock<Liveness> = OnceLock::new();
        GLOBAL.get_or_init(Liveness::new)
    }

    pub fn is_deleted(&self, job_id: Uuid) -> bool {
        self.deleted.contains(&job_id)
    }
}
