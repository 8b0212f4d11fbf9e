use std::path::{Path, PathBuf};

use at_types::{
    AtResult, BenchmarkId, BenchmarkRecord, ComputeTarget, ComputeTargetId, ConfigId,
    ConfigRecord, DatasetId, DatasetRecord, EvaluationId, EvaluationRecord, ExperimentId,
    ExperimentRecord, StoreError,
};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Read/write access to the records AutoTune consumes but does not own.
pub trait Catalog: Send + Sync {
    fn dataset(&self, id: DatasetId) -> AtResult<Option<DatasetRecord>>;
    fn config(&self, id: ConfigId) -> AtResult<Option<ConfigRecord>>;
    fn benchmark(&self, id: BenchmarkId) -> AtResult<Option<BenchmarkRecord>>;
    fn experiment(&self, id: ExperimentId) -> AtResult<Option<ExperimentRecord>>;
    fn evaluation(&self, id: EvaluationId) -> AtResult<Option<EvaluationRecord>>;
    fn compute_target(&self, id: ComputeTargetId) -> AtResult<Option<ComputeTarget>>;

    fn save_dataset(&self, record: DatasetRecord) -> AtResult<()>;
    fn save_config(&self, record: ConfigRecord) -> AtResult<()>;
    fn save_benchmark(&self, record: BenchmarkRecord) -> AtResult<()>;
    fn save_experiment(&self, record: ExperimentRecord) -> AtResult<()>;
    fn save_evaluation(&self, record: EvaluationRecord) -> AtResult<()>;
    fn save_compute_target(&self, record: ComputeTarget) -> AtResult<()>;
}

/// Serialized form of a [`MemoryCatalog`].
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct CatalogSnapshot {
    #[serde(default)]
    pub datasets: Vec<DatasetRecord>,
    #[serde(default)]
    pub configs: Vec<ConfigRecord>,
    #[serde(default)]
    pub benchmarks: Vec<BenchmarkRecord>,
    #[serde(default)]
    pub experiments: Vec<ExperimentRecord>,
    #[serde(default)]
    pub evaluations: Vec<EvaluationRecord>,
    #[serde(default)]
    pub compute_targets: Vec<ComputeTarget>,
}

/// Concurrent in-memory catalog, optionally mirrored to a JSON snapshot file
/// after every write.
#[derive(Debug, Default)]
pub struct MemoryCatalog {
    datasets: DashMap<DatasetId, DatasetRecord>,
    configs: DashMap<ConfigId, ConfigRecord>,
    benchmarks: DashMap<BenchmarkId, BenchmarkRecord>,
    experiments: DashMap<ExperimentId, ExperimentRecord>,
    evaluations: DashMap<EvaluationId, EvaluationRecord>,
    compute_targets: DashMap<ComputeTargetId, ComputeTarget>,
    snapshot_path: Option<PathBuf>,
    // serializes snapshot writers
    write_lock: Mutex<()>,
}

fn snapshot_error(path: &Path, e: impl std::fmt::Display) -> StoreError {
    StoreError::Snapshot {
        message: format!("{}: {}", path.display(), e),
    }
}

fn collect<V: Clone>(map: &DashMap<Uuid, V>) -> Vec<V> {
    map.iter().map(|entry| entry.value().clone()).collect()
}

fn lookup<V: Clone>(map: &DashMap<Uuid, V>, id: Uuid) -> AtResult<Option<V>> {
    Ok(map.get(&id).map(|entry| entry.value().clone()))
}

impl MemoryCatalog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Load the snapshot at `path` (if any) and keep mirroring writes to it.
    pub fn open<P: AsRef<Path>>(path: P) -> AtResult<Self> {
        let path = path.as_ref().to_path_buf();
        let mut catalog = if path.exists() {
            Self::from_snapshot(Self::read_snapshot(&path)?)
        } else {
            Self::new()
        };
        tracing::info!(
            path = %path.display(),
            datasets = catalog.datasets.len(),
            configs = catalog.configs.len(),
            benchmarks = catalog.benchmarks.len(),
            "Opened catalog"
        );
        catalog.snapshot_path = Some(path);
        Ok(catalog)
    }

    pub fn read_snapshot(path: &Path) -> AtResult<CatalogSnapshot> {
        let bytes = std::fs::read(path).map_err(|e| snapshot_error(path, e))?;
        let snapshot = serde_json::from_slice(&bytes).map_err(|e| snapshot_error(path, e))?;
        Ok(snapshot)
    }

    pub fn from_snapshot(snapshot: CatalogSnapshot) -> Self {
        let catalog = Self::new();
        for r in snapshot.datasets {
            catalog.datasets.insert(r.id, r);
        }
        for r in snapshot.configs {
            catalog.configs.insert(r.id, r);
        }
        for r in snapshot.benchmarks {
            catalog.benchmarks.insert(r.id, r);
        }
        for r in snapshot.experiments {
            catalog.experiments.insert(r.id, r);
        }
        for r in snapshot.evaluations {
            catalog.evaluations.insert(r.id, r);
        }
        for r in snapshot.compute_targets {
            catalog.compute_targets.insert(r.id, r);
        }
        catalog
    }

    pub fn snapshot(&self) -> CatalogSnapshot {
        CatalogSnapshot {
            datasets: collect(&self.datasets),
            configs: collect(&self.configs),
            benchmarks: collect(&self.benchmarks),
            experiments: collect(&self.experiments),
            evaluations: collect(&self.evaluations),
            compute_targets: collect(&self.compute_targets),
        }
    }

    /// Write the whole catalog to `path` through a temp file and rename.
    pub fn save_to(&self, path: &Path) -> AtResult<()> {
        let _guard = self.write_lock.lock();
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| snapshot_error(path, e))?;
            }
        }
        let json =
            serde_json::to_vec_pretty(&self.snapshot()).map_err(|e| snapshot_error(path, e))?;
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, json).map_err(|e| snapshot_error(&tmp, e))?;
        std::fs::rename(&tmp, path).map_err(|e| snapshot_error(path, e))?;
        Ok(())
    }

    fn persist(&self) -> AtResult<()> {
        match &self.snapshot_path {
            Some(path) => self.save_to(path),
            None => Ok(()),
        }
    }
}

impl Catalog for MemoryCatalog {
    fn dataset(&self, id: DatasetId) -> AtResult<Option<DatasetRecord>> {
        lookup(&self.datasets, id)
    }

    fn config(&self, id: ConfigId) -> AtResult<Option<ConfigRecord>> {
        lookup(&self.configs, id)
    }

    fn benchmark(&self, id: BenchmarkId) -> AtResult<Option<BenchmarkRecord>> {
        lookup(&self.benchmarks, id)
    }

    fn experiment(&self, id: ExperimentId) -> AtResult<Option<ExperimentRecord>> {
        lookup(&self.experiments, id)
    }

    fn evaluation(&self, id: EvaluationId) -> AtResult<Option<EvaluationRecord>> {
        lookup(&self.evaluations, id)
    }

    fn compute_target(&self, id: ComputeTargetId) -> AtResult<Option<ComputeTarget>> {
        lookup(&self.compute_targets, id)
    }

    fn save_dataset(&self, record: DatasetRecord) -> AtResult<()> {
        self.datasets.insert(record.id, record);
        self.persist()
    }

    fn save_config(&self, record: ConfigRecord) -> AtResult<()> {
        self.configs.insert(record.id, record);
        self.persist()
    }

    fn save_benchmark(&self, record: BenchmarkRecord) -> AtResult<()> {
        self.benchmarks.insert(record.id, record);
        self.persist()
    }

    fn save_experiment(&self, record: ExperimentRecord) -> AtResult<()> {
        self.experiments.insert(record.id, record);
        self.persist()
    }

    fn save_evaluation(&self, record: EvaluationRecord) -> AtResult<()> {
        self.evaluations.insert(record.id, record);
        self.persist()
    }

    fn save_compute_target(&self, record: ComputeTarget) -> AtResult<()> {
        self.compute_targets.insert(record.id, record);
        self.persist()
    }
}
