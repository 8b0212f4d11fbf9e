//! Records owned by the surrounding platform (datasets, configs, benchmarks,
//! experiments, evaluations). The orchestrator reads and creates them through
//! the catalog but does not own their lifecycle.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use uuid::Uuid;

use crate::config::FineTuneConfig;

pub type DatasetId = Uuid;
pub type ConfigId = Uuid;
pub type BenchmarkId = Uuid;
pub type ExperimentId = Uuid;
pub type EvaluationId = Uuid;

/// Named scalar metrics returned by a training or evaluation run.
pub type Metrics = BTreeMap<String, f64>;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DatasetRecord {
    pub id: DatasetId,
    pub filename: String,
    pub path: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConfigRecord {
    pub id: ConfigId,
    pub name: String,
    pub config: FineTuneConfig,
    pub created_at: DateTime<Utc>,
}

impl ConfigRecord {
    pub fn new(name: impl Into<String>, config: FineTuneConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            config,
            created_at: Utc::now(),
        }
    }
}

/// A fixed question / reference-answer pair used to score a trained model.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BenchmarkRecord {
    pub id: BenchmarkId,
    pub name: String,
    pub question: String,
    pub gold_answer: String,
    pub created_at: DateTime<Utc>,
}

impl BenchmarkRecord {
    /// Benchmark synthesized for an AutoTune job, named after its id.
    pub fn synthesized(question: impl Into<String>, gold_answer: impl Into<String>) -> Self {
        let id = Uuid::new_v4();
        Self {
            id,
            name: format!("autotune_{}", &id.simple().to_string()[..8]),
            question: question.into(),
            gold_answer: gold_answer.into(),
            created_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExperimentStatus {
    Pending,
    Running,
    Completed,
    Failed,
    Stopped,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExperimentRecord {
    pub id: ExperimentId,
    pub dataset_id: DatasetId,
    pub dataset_filename: String,
    pub config_id: ConfigId,
    pub status: ExperimentStatus,
    pub metrics: Metrics,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl ExperimentRecord {
    pub fn new(dataset: &DatasetRecord, config_id: ConfigId) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_id: dataset.id,
            dataset_filename: dataset.filename.clone(),
            config_id,
            status: ExperimentStatus::Pending,
            metrics: Metrics::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn mark_running(&mut self) {
        self.status = ExperimentStatus::Running;
    }

    pub fn mark_completed(&mut self, metrics: Metrics) {
        self.status = ExperimentStatus::Completed;
        self.metrics = metrics;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = ExperimentStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_stopped(&mut self) {
        self.status = ExperimentStatus::Stopped;
        self.completed_at = Some(Utc::now());
    }

    pub fn is_completed(&self) -> bool {
        self.status == ExperimentStatus::Completed
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvaluationStatus {
    Pending,
    Running,
    Completed,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationRecord {
    pub id: EvaluationId,
    pub benchmark_id: BenchmarkId,
    pub benchmark_name: String,
    pub experiment_id: ExperimentId,
    pub status: EvaluationStatus,
    pub score: Option<f64>,
    pub metrics: Metrics,
    pub error: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl EvaluationRecord {
    pub fn new(benchmark: &BenchmarkRecord, experiment_id: ExperimentId) -> Self {
        Self {
            id: Uuid::new_v4(),
            benchmark_id: benchmark.id,
            benchmark_name: benchmark.name.clone(),
            experiment_id,
            status: EvaluationStatus::Pending,
            score: None,
            metrics: Metrics::new(),
            error: None,
            started_at: Utc::now(),
            completed_at: None,
        }
    }

    pub fn mark_completed(&mut self, score: f64, metrics: Metrics) {
        self.status = EvaluationStatus::Completed;
        self.score = Some(score);
        self.metrics = metrics;
        self.completed_at = Some(Utc::now());
    }

    pub fn mark_failed(&mut self, error: String) {
        self.status = EvaluationStatus::Failed;
        self.error = Some(error);
        self.completed_at = Some(Utc::now());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn synthesized_benchmark_name_uses_id_prefix() {
        let benchmark = BenchmarkRecord::synthesized("What is 2+2?", "4");
        assert!(benchmark.name.starts_with("autotune_"));
        assert_eq!(benchmark.name.len(), "autotune_".len() + 8);
        assert!(benchmark.id.simple().to_string().starts_with(&benchmark.name[9..]));
    }

    #[test]
    fn experiment_lifecycle() {
        let dataset = DatasetRecord {
            id: Uuid::new_v4(),
            filename: "qa.csv".into(),
            path: PathBuf::from("/data/uploads/qa.csv"),
        };
        let mut exp = ExperimentRecord::new(&dataset, Uuid::new_v4());
        assert_eq!(exp.status, ExperimentStatus::Pending);
        assert_eq!(exp.dataset_filename, "qa.csv");

        exp.mark_running();
        let mut metrics = Metrics::new();
        metrics.insert("eval_loss".into(), 1.25);
        exp.mark_completed(metrics);
        assert!(exp.is_completed());
        assert_eq!(exp.metrics["eval_loss"], 1.25);
    }
}
