//! Seams to the work the orchestrator dispatches but does not perform.

use std::sync::Arc;

use async_trait::async_trait;
use at_optimizer::Prober;
use at_types::{
    BenchmarkRecord, ComputeTarget, DatasetRecord, DelegateError, EvaluationRecord,
    ExperimentRecord, FineTuneConfig, JobId, Metrics,
};
use uuid::Uuid;

use crate::registry::{Liveness, Progress};

/// Everything a trainer needs to fine-tune one candidate.
#[derive(Debug, Clone)]
pub struct TrainingRequest {
    pub job_id: JobId,
    pub experiment: ExperimentRecord,
    pub config: FineTuneConfig,
    pub dataset: DatasetRecord,
}

/// Liveness hooks handed to a running trainer.
#[derive(Debug, Clone)]
pub struct TrainingContext {
    job_id: JobId,
    experiment_id: Uuid,
    liveness: Liveness,
}

impl TrainingContext {
    pub fn new(job_id: JobId, experiment_id: Uuid, liveness: Liveness) -> Self {
        Self {
            job_id,
            experiment_id,
            liveness,
        }
    }

    /// A stop was requested for the whole job or for this experiment alone.
    pub fn should_stop(&self) -> bool {
        self.liveness.stop.should_stop(self.job_id)
            || self.liveness.stop.should_stop(self.experiment_id)
    }

    pub fn report_progress(&self, progress: Progress) {
        self.liveness.progress.report(self.experiment_id, progress);
    }

    pub fn experiment_id(&self) -> Uuid {
        self.experiment_id
    }

    pub fn job_id(&self) -> JobId {
        self.job_id
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }
}

#[async_trait]
pub trait Trainer: Send + Sync {
    /// Train to completion and return the final metrics.
    ///
    /// Implementations poll [`TrainingContext::should_stop`] and return
    /// [`DelegateError::Stopped`] when it turns true.
    async fn train(
        &self,
        request: &TrainingRequest,
        ctx: &TrainingContext,
    ) -> Result<Metrics, DelegateError>;
}

#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub job_id: JobId,
    pub evaluation: EvaluationRecord,
    pub benchmark: BenchmarkRecord,
    pub experiment: ExperimentRecord,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvaluationOutcome {
    pub score: f64,
    pub metrics: Metrics,
}

#[async_trait]
pub trait Evaluator: Send + Sync {
    async fn evaluate(&self, request: &EvaluationRequest)
        -> Result<EvaluationOutcome, DelegateError>;
}

/// The three delegates one job runs with.
#[derive(Clone)]
pub struct Delegates {
    pub trainer: Arc<dyn Trainer>,
    pub evaluator: Arc<dyn Evaluator>,
    pub prober: Arc<dyn Prober>,
}

impl std::fmt::Debug for Delegates {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Delegates").finish_non_exhaustive()
    }
}

/// Builds the delegates for a job, bound to its compute target if it has one.
pub trait DelegateFactory: Send + Sync {
    fn delegates(&self, target: Option<&ComputeTarget>) -> Delegates;
}
