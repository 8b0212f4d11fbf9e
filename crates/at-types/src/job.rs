//! AutoTune job and candidate models.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use uuid::Uuid;

use crate::config::Hyperparameters;
use crate::errors::{AtError, AtResult};
use crate::records::{BenchmarkId, DatasetId, ConfigId, EvaluationId, ExperimentId};

/// Unique AutoTune job identifier
pub type JobId = Uuid;

/// Lifecycle state of an AutoTune job.
///
/// The forward path is `Pending → Probing → Training → Evaluating →
/// Completed`. `Failed` and `Cancelled` may be entered from any
/// non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Probing,
    Training,
    Evaluating,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 7] = [
        JobStatus::Pending,
        JobStatus::Probing,
        JobStatus::Training,
        JobStatus::Evaluating,
        JobStatus::Completed,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }

    /// Position on the forward path; terminal failure states have none.
    fn phase_index(self) -> Option<u8> {
        match self {
            Self::Pending => Some(0),
            Self::Probing => Some(1),
            Self::Training => Some(2),
            Self::Evaluating => Some(3),
            Self::Completed => Some(4),
            Self::Failed | Self::Cancelled => None,
        }
    }

    /// Whether `self → next` is an edge of the job state machine.
    pub fn can_transition_to(self, next: JobStatus) -> bool {
        if self.is_terminal() {
            return false;
        }
        match next {
            Self::Failed | Self::Cancelled => true,
            _ => match (self.phase_index(), next.phase_index()) {
                (Some(from), Some(to)) => to == from + 1,
                _ => false,
            },
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Probing => "probing",
            Self::Training => "training",
            Self::Evaluating => "evaluating",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Cancelled => "cancelled",
        }
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for JobStatus {
    type Err = AtError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        JobStatus::ALL
            .into_iter()
            .find(|status| status.as_str() == s)
            .ok_or_else(|| AtError::Validation(format!("unknown job status: {s}")))
    }
}

/// One hyperparameter combination under consideration within a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candidate {
    pub rank: usize,
    #[serde(flatten)]
    pub hyperparameters: Hyperparameters,
    pub predicted_score: f64,
    #[serde(default)]
    pub experiment_id: Option<ExperimentId>,
    #[serde(default)]
    pub eval_id: Option<EvaluationId>,
    #[serde(default)]
    pub actual_score: Option<f64>,
}

impl Candidate {
    pub fn new(rank: usize, hyperparameters: Hyperparameters, predicted_score: f64) -> Self {
        Self {
            rank,
            hyperparameters,
            predicted_score,
            experiment_id: None,
            eval_id: None,
            actual_score: None,
        }
    }

    /// Ordering used for the final re-rank: actual score descending, absent
    /// scores last, then original rank ascending. A NaN score counts as
    /// absent.
    pub fn cmp_by_actual(&self, other: &Self) -> Ordering {
        let score = |c: &Self| c.actual_score.filter(|s| !s.is_nan());
        let by_score = match (score(self), score(other)) {
            (Some(a), Some(b)) => b.total_cmp(&a),
            (Some(_), None) => Ordering::Less,
            (None, Some(_)) => Ordering::Greater,
            (None, None) => Ordering::Equal,
        };
        by_score.then(self.rank.cmp(&other.rank))
    }
}

/// One AutoTune run spanning search, training and evaluation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub dataset_id: DatasetId,
    pub benchmark_id: BenchmarkId,
    pub base_config_id: Option<ConfigId>,
    pub status: JobStatus,
    pub phase_message: String,
    pub top_k: usize,
    pub candidates: Vec<Candidate>,
    pub current_training_idx: usize,
    pub current_eval_idx: usize,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        dataset_id: DatasetId,
        benchmark_id: BenchmarkId,
        base_config_id: Option<ConfigId>,
        top_k: usize,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            dataset_id,
            benchmark_id,
            base_config_id,
            status: JobStatus::Pending,
            phase_message: "Starting AutoTune...".to_string(),
            top_k,
            candidates: Vec::new(),
            current_training_idx: 0,
            current_eval_idx: 0,
            started_at: Utc::now(),
            completed_at: None,
            error: None,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    fn ensure_mutable(&self) -> AtResult<()> {
        if self.is_terminal() {
            return Err(AtError::Internal(format!(
                "job {} is {} and can no longer change",
                self.id, self.status
            )));
        }
        Ok(())
    }

    /// Move to `next`, rejecting anything that is not a state-machine edge.
    pub fn transition(&mut self, next: JobStatus, message: impl Into<String>) -> AtResult<()> {
        self.ensure_mutable()?;
        if !self.status.can_transition_to(next) {
            return Err(AtError::Internal(format!(
                "illegal job transition {} -> {}",
                self.status, next
            )));
        }
        self.status = next;
        self.phase_message = message.into();
        if next.is_terminal() {
            self.completed_at = Some(Utc::now());
        }
        Ok(())
    }

    pub fn set_phase_message(&mut self, message: impl Into<String>) -> AtResult<()> {
        self.ensure_mutable()?;
        self.phase_message = message.into();
        Ok(())
    }

    /// Install the search results. Only allowed while probing and only once.
    pub fn set_candidates(&mut self, candidates: Vec<Candidate>) -> AtResult<()> {
        self.ensure_mutable()?;
        if self.status != JobStatus::Probing {
            return Err(AtError::Internal(format!(
                "candidates can only be set while probing (status {})",
                self.status
            )));
        }
        if !self.candidates.is_empty() {
            return Err(AtError::Internal("candidates already set".to_string()));
        }
        self.candidates = candidates;
        Ok(())
    }

    pub fn candidate_mut(&mut self, idx: usize) -> AtResult<&mut Candidate> {
        self.ensure_mutable()?;
        let id = self.id;
        self.candidates
            .get_mut(idx)
            .ok_or_else(|| AtError::Internal(format!("job {id} has no candidate {idx}")))
    }

    /// Sort by actual score and re-assign contiguous 1-based ranks.
    pub fn rerank_by_actual(&mut self) -> AtResult<()> {
        self.ensure_mutable()?;
        self.candidates.sort_by(Candidate::cmp_by_actual);
        for (i, candidate) in self.candidates.iter_mut().enumerate() {
            candidate.rank = i + 1;
        }
        Ok(())
    }

    pub fn best_actual_score(&self) -> Option<f64> {
        self.candidates.first().and_then(|c| c.actual_score)
    }

    pub fn mark_completed(&mut self) -> AtResult<()> {
        let message = match self.best_actual_score() {
            Some(score) => format!("Complete! Best score: {score:.4}"),
            None => "Complete!".to_string(),
        };
        self.transition(JobStatus::Completed, message)
    }

    pub fn mark_failed(&mut self, error: impl Into<String>) -> AtResult<()> {
        let error = error.into();
        self.transition(JobStatus::Failed, format!("Failed: {error}"))?;
        self.error = Some(error);
        Ok(())
    }

    pub fn mark_cancelled(&mut self) -> AtResult<()> {
        self.transition(JobStatus::Cancelled, "Stopped by request")
    }
}
