//! Request and response models for the job lifecycle API.

use serde::{Deserialize, Serialize};

use crate::compute::ComputeTargetId;
use crate::errors::AtResult;
use crate::job::{JobId, JobStatus};
use crate::records::{BenchmarkId, ConfigId, DatasetId};
use crate::validation_error;

pub const TOP_K_RANGE: std::ops::RangeInclusive<usize> = 1..=10;
pub const PROBE_STEPS_RANGE: std::ops::RangeInclusive<u32> = 1..=50;

fn default_question_field() -> String {
    "question".to_string()
}

fn default_answer_field() -> String {
    "answer".to_string()
}

fn default_top_k() -> usize {
    5
}

fn default_probe_steps() -> u32 {
    5
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTuneRequest {
    pub dataset_id: DatasetId,
    #[serde(default)]
    pub benchmark_id: Option<BenchmarkId>,
    #[serde(default)]
    pub benchmark_row_idx: Option<usize>,
    #[serde(default)]
    pub benchmark_question: Option<String>,
    #[serde(default)]
    pub benchmark_answer: Option<String>,
    #[serde(default)]
    pub base_config_id: Option<ConfigId>,
    #[serde(default = "default_question_field")]
    pub question_field: String,
    #[serde(default = "default_answer_field")]
    pub answer_field: String,
    #[serde(default = "default_top_k")]
    pub top_k: usize,
    #[serde(default = "default_probe_steps")]
    pub probe_steps: u32,
    #[serde(default)]
    pub compute_target_id: Option<ComputeTargetId>,
}

/// Where the benchmark for a new job comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum BenchmarkSource {
    Existing(BenchmarkId),
    Manual { question: String, answer: String },
    DatasetRow(usize),
}

impl AutoTuneRequest {
    pub fn new(dataset_id: DatasetId) -> Self {
        Self {
            dataset_id,
            benchmark_id: None,
            benchmark_row_idx: None,
            benchmark_question: None,
            benchmark_answer: None,
            base_config_id: None,
            question_field: default_question_field(),
            answer_field: default_answer_field(),
            top_k: default_top_k(),
            probe_steps: default_probe_steps(),
            compute_target_id: None,
        }
    }

    /// Range checks that need no collaborator lookups.
    pub fn validate(&self) -> AtResult<()> {
        if !TOP_K_RANGE.contains(&self.top_k) {
            return Err(validation_error!(
                "top_k must be between {} and {}, got {}",
                TOP_K_RANGE.start(),
                TOP_K_RANGE.end(),
                self.top_k
            ));
        }
        if !PROBE_STEPS_RANGE.contains(&self.probe_steps) {
            return Err(validation_error!(
                "probe_steps must be between {} and {}, got {}",
                PROBE_STEPS_RANGE.start(),
                PROBE_STEPS_RANGE.end(),
                self.probe_steps
            ));
        }
        if self.question_field.trim().is_empty() || self.answer_field.trim().is_empty() {
            return Err(validation_error!("question_field and answer_field must be non-empty"));
        }
        self.benchmark_source().map(|_| ())
    }

    /// An existing benchmark id wins, then a manual question/answer pair,
    /// then a dataset row.
    pub fn benchmark_source(&self) -> AtResult<BenchmarkSource> {
        if let Some(id) = self.benchmark_id {
            return Ok(BenchmarkSource::Existing(id));
        }
        if let (Some(question), Some(answer)) = (&self.benchmark_question, &self.benchmark_answer) {
            return Ok(BenchmarkSource::Manual {
                question: question.clone(),
                answer: answer.clone(),
            });
        }
        if let Some(row) = self.benchmark_row_idx {
            return Ok(BenchmarkSource::DatasetRow(row));
        }
        Err(validation_error!(
            "Provide benchmark_id, benchmark_row_idx, or benchmark_question + benchmark_answer"
        ))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AutoTuneStartResponse {
    pub job_id: JobId,
    pub status: JobStatus,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    #[test]
    fn deserialize_defaults() {
        let json = serde_json::json!({
            "dataset_id": Uuid::new_v4(),
            "benchmark_row_idx": 0
        });
        let request: AutoTuneRequest = serde_json::from_value(json).unwrap();
        assert_eq!(request.question_field, "question");
        assert_eq!(request.answer_field, "answer");
        assert_eq!(request.top_k, 5);
        assert_eq!(request.probe_steps, 5);
        assert!(request.validate().is_ok());
    }

    #[test]
    fn range_checks() {
        let mut request = AutoTuneRequest::new(Uuid::new_v4());
        request.benchmark_row_idx = Some(0);

        request.top_k = 0;
        assert!(request.validate().is_err());
        request.top_k = 11;
        assert!(request.validate().is_err());
        request.top_k = 10;
        request.probe_steps = 51;
        assert!(request.validate().is_err());
        request.probe_steps = 50;
        assert!(request.validate().is_ok());
    }

    #[test]
    fn benchmark_source_precedence() {
        let mut request = AutoTuneRequest::new(Uuid::new_v4());
        assert!(request.benchmark_source().unwrap_err().is_client_error());

        request.benchmark_question = Some("q".into());
        assert!(request.benchmark_source().is_err());

        request.benchmark_row_idx = Some(3);
        assert_eq!(request.benchmark_source().unwrap(), BenchmarkSource::DatasetRow(3));

        request.benchmark_answer = Some("a".into());
        assert!(matches!(
            request.benchmark_source().unwrap(),
            BenchmarkSource::Manual { .. }
        ));

        let id = Uuid::new_v4();
        request.benchmark_id = Some(id);
        assert_eq!(request.benchmark_source().unwrap(), BenchmarkSource::Existing(id));
    }
}
