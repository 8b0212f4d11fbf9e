//! Phase orchestrator: drives one job from `Pending` to a terminal state.
//!
//! Phases run strictly in order and every state change is persisted before
//! the next phase starts. Whatever happens inside a phase, the last act of
//! [`Orchestrator::run`] is a durable terminal write.

use std::sync::Arc;

use at_optimizer::{search, Predictor, SearchParams, SearchSpace};
use at_store::{Catalog, JobStore};
use at_types::{
    AtError, AtResult, BenchmarkRecord, Candidate, ConfigRecord, DatasetRecord, DelegateError,
    EvaluationRecord, ExperimentRecord, FineTuneConfig, Job, JobStatus, SearchError,
};
use parking_lot::Mutex;
use uuid::Uuid;

use crate::delegate::{Delegates, EvaluationRequest, TrainingContext, TrainingRequest};
use crate::events::{EventBus, JobEvent};
use crate::registry::Liveness;

/// Search candidates per kept candidate.
pub const OVERSAMPLE_FACTOR: usize = 3;

pub const PREDICTOR_NOT_TRAINED: &str =
    "Predictor not trained. Generate synthetic data and train first.";

/// Request parameters the job record does not carry.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub question_field: String,
    pub answer_field: String,
    pub probe_steps: u32,
}

pub struct Orchestrator {
    store: JobStore,
    catalog: Arc<dyn Catalog>,
    predictor: Arc<dyn Predictor>,
    delegates: Delegates,
    liveness: Liveness,
    events: EventBus,
    space: SearchSpace,
    // experiments started by this job, for progress cleanup
    experiments: Mutex<Vec<Uuid>>,
}

impl Orchestrator {
    pub fn new(
        store: JobStore,
        catalog: Arc<dyn Catalog>,
        predictor: Arc<dyn Predictor>,
        delegates: Delegates,
        liveness: Liveness,
        events: EventBus,
        space: SearchSpace,
    ) -> Self {
        Self {
            store,
            catalog,
            predictor,
            delegates,
            liveness,
            events,
            space,
            experiments: Mutex::new(Vec::new()),
        }
    }

    /// Run `job` to a terminal state and return the final record.
    pub async fn run(&self, mut job: Job, plan: &JobPlan) -> Job {
        let job_id = job.id;
        tracing::info!(job_id = %job_id, top_k = job.top_k, "AutoTune job started");

        let outcome = self.drive(&mut job, plan).await;
        if let Err(e) = outcome {
            self.finish_with_error(&mut job, &e);
        }

        self.liveness.stop.clear(job_id);
        for experiment_id in self.experiments.lock().drain(..) {
            self.liveness.progress.clear(experiment_id);
        }
        tracing::info!(job_id = %job_id, status = %job.status, "AutoTune job finished");
        job
    }

    async fn drive(&self, job: &mut Job, plan: &JobPlan) -> AtResult<()> {
        // 1. resolve inputs, enter probing
        self.check_stop(job)?;
        let dataset = self
            .catalog
            .dataset(job.dataset_id)?
            .ok_or_else(|| AtError::not_found("Dataset", job.dataset_id))?;
        let base_config = match job.base_config_id {
            Some(id) => {
                self.catalog
                    .config(id)?
                    .ok_or_else(|| AtError::not_found("Base config", id))?
                    .config
            }
            None => FineTuneConfig::default_for_fields(&plan.question_field, &plan.answer_field),
        };
        self.advance(job, JobStatus::Probing, "Running probes to predict best configs...")?;
        if !self.predictor.is_trained() {
            return Err(SearchError::PredictorNotTrained.into());
        }

        // 2. candidate search
        let params = SearchParams {
            base_config: &base_config,
            dataset: &dataset,
            space: &self.space,
            probe_steps: plan.probe_steps,
            max_candidates: job.top_k.saturating_mul(OVERSAMPLE_FACTOR),
        };
        let liveness = &self.liveness;
        let job_id = job.id;
        let stop = move || liveness.stop.should_stop(job_id) || liveness.is_deleted(job_id);
        let scored = search(
            params,
            self.predictor.as_ref(),
            self.delegates.prober.as_ref(),
            &stop,
        )
        .await?;
        let candidates: Vec<Candidate> = scored
            .into_iter()
            .take(job.top_k)
            .map(Candidate::from)
            .collect();
        tracing::info!(job_id = %job.id, candidates = candidates.len(), "Candidate search finished");
        job.set_candidates(candidates)?;
        self.persist(job)?;

        // 3. sequential training
        self.check_stop(job)?;
        self.advance(job, JobStatus::Training, "Training candidates...")?;
        let total = job.candidates.len();
        for idx in 0..total {
            self.check_stop(job)?;
            job.current_training_idx = idx;
            let hp = job.candidates[idx].hyperparameters;
            job.set_phase_message(format!("Training model {}/{} ({})", idx + 1, total, hp))?;
            self.persist(job)?;

            self.train_candidate(job, idx, &base_config, &dataset).await?;
            self.persist(job)?;
        }

        // 4. evaluation
        self.check_stop(job)?;
        self.advance(job, JobStatus::Evaluating, "Evaluating trained models...")?;
        let benchmark = self
            .catalog
            .benchmark(job.benchmark_id)?
            .ok_or_else(|| AtError::not_found("Benchmark", job.benchmark_id))?;
        for idx in 0..total {
            self.check_stop(job)?;
            let Some(experiment_id) = job.candidates[idx].experiment_id else {
                continue;
            };
            let experiment = match self.catalog.experiment(experiment_id)? {
                Some(experiment) if experiment.is_completed() => experiment,
                _ => continue,
            };
            job.current_eval_idx = idx;
            job.set_phase_message(format!("Evaluating model {}/{}", idx + 1, total))?;
            self.persist(job)?;

            self.evaluate_candidate(job, idx, &benchmark, experiment).await?;
            self.persist(job)?;
        }

        // 5. re-rank and complete
        job.rerank_by_actual()?;
        let from = job.status;
        job.mark_completed()?;
        self.persist_transition(job, from)?;
        Ok(())
    }

    async fn train_candidate(
        &self,
        job: &mut Job,
        idx: usize,
        base_config: &FineTuneConfig,
        dataset: &DatasetRecord,
    ) -> AtResult<()> {
        let candidate = &job.candidates[idx];
        let config = base_config.with_hyperparameters(&candidate.hyperparameters);
        let job_prefix: String = job.id.to_string().chars().take(8).collect();
        let config_record = ConfigRecord::new(
            format!("autotune_{}_rank{}", job_prefix, candidate.rank),
            config.clone(),
        );
        self.catalog.save_config(config_record.clone())?;

        let mut experiment = ExperimentRecord::new(dataset, config_record.id);
        self.catalog.save_experiment(experiment.clone())?;
        experiment.mark_running();
        self.catalog.save_experiment(experiment.clone())?;

        let request = TrainingRequest {
            job_id: job.id,
            experiment: experiment.clone(),
            config,
            dataset: dataset.clone(),
        };
        self.experiments.lock().push(experiment.id);
        let ctx = TrainingContext::new(job.id, experiment.id, self.liveness.clone());
        tracing::info!(
            job_id = %job.id,
            candidate = candidate.rank,
            experiment_id = %experiment.id,
            "Training candidate"
        );

        let result = self.delegates.trainer.train(&request, &ctx).await;
        self.liveness.stop.clear(experiment.id);

        match result {
            Ok(metrics) => {
                experiment.mark_completed(metrics);
                self.catalog.save_experiment(experiment.clone())?;
                job.candidate_mut(idx)?.experiment_id = Some(experiment.id);
                Ok(())
            }
            Err(DelegateError::Stopped) => {
                experiment.mark_stopped();
                self.catalog.save_experiment(experiment)?;
                if self.liveness.stop.should_stop(job.id) {
                    return Err(AtError::Delegate(DelegateError::Stopped));
                }
                tracing::warn!(job_id = %job.id, candidate = idx + 1, "Candidate training stopped, continuing");
                Ok(())
            }
            Err(DelegateError::Failed { message }) => {
                tracing::warn!(job_id = %job.id, candidate = idx + 1, error = %message, "Candidate training failed, continuing");
                experiment.mark_failed(message);
                self.catalog.save_experiment(experiment)?;
                Ok(())
            }
            Err(err @ DelegateError::Infrastructure { .. }) => {
                experiment.mark_failed(err.to_string());
                self.catalog.save_experiment(experiment)?;
                Err(err.into())
            }
        }
    }

    async fn evaluate_candidate(
        &self,
        job: &mut Job,
        idx: usize,
        benchmark: &BenchmarkRecord,
        experiment: ExperimentRecord,
    ) -> AtResult<()> {
        let mut evaluation = EvaluationRecord::new(benchmark, experiment.id);
        self.catalog.save_evaluation(evaluation.clone())?;

        let request = EvaluationRequest {
            job_id: job.id,
            evaluation: evaluation.clone(),
            benchmark: benchmark.clone(),
            experiment,
        };
        tracing::info!(job_id = %job.id, candidate = idx + 1, eval_id = %evaluation.id, "Evaluating candidate");
        let result = self.delegates.evaluator.evaluate(&request).await;

        let actual_score = match result {
            Ok(outcome) => {
                evaluation.mark_completed(outcome.score, outcome.metrics);
                Some(outcome.score)
            }
            Err(err @ DelegateError::Infrastructure { .. }) => {
                evaluation.mark_failed(err.to_string());
                self.catalog.save_evaluation(evaluation)?;
                return Err(err.into());
            }
            Err(err) => {
                tracing::warn!(job_id = %job.id, candidate = idx + 1, error = %err, "Candidate evaluation failed, continuing");
                evaluation.mark_failed(err.to_string());
                None
            }
        };
        let eval_id = evaluation.id;
        self.catalog.save_evaluation(evaluation)?;

        let candidate = job.candidate_mut(idx)?;
        candidate.eval_id = Some(eval_id);
        candidate.actual_score = actual_score;
        Ok(())
    }

    fn check_stop(&self, job: &Job) -> AtResult<()> {
        if self.liveness.stop.should_stop(job.id) || self.liveness.is_deleted(job.id) {
            return Err(AtError::Delegate(DelegateError::Stopped));
        }
        Ok(())
    }

    fn persist(&self, job: &Job) -> AtResult<()> {
        if self.liveness.is_deleted(job.id) {
            return Err(AtError::Delegate(DelegateError::Stopped));
        }
        self.store.update(job)
    }

    fn persist_transition(&self, job: &Job, from: JobStatus) -> AtResult<()> {
        self.persist(job)?;
        self.events.publish(JobEvent {
            job_id: job.id,
            from,
            to: job.status,
            message: job.phase_message.clone(),
        });
        Ok(())
    }

    fn advance(&self, job: &mut Job, next: JobStatus, message: &str) -> AtResult<()> {
        let from = job.status;
        job.transition(next, message)?;
        tracing::info!(job_id = %job.id, status = %next, "Job phase changed");
        self.persist_transition(job, from)
    }

    /// Record the terminal state for an error that escaped a phase.
    fn finish_with_error(&self, job: &mut Job, err: &AtError) {
        if self.liveness.is_deleted(job.id) {
            // deleted while running: make sure no write brought it back
            if let Err(e) = self.store.delete(job.id) {
                tracing::error!(job_id = %job.id, error = %e, "Failed to remove deleted job");
            }
            return;
        }
        if job.is_terminal() {
            // the terminal write itself failed; nothing left to record
            tracing::error!(job_id = %job.id, error = %err, "Terminal job write failed");
            return;
        }

        let from = job.status;
        let marked = match err {
            AtError::Delegate(DelegateError::Stopped) => {
                tracing::info!(job_id = %job.id, "AutoTune job cancelled");
                job.mark_cancelled()
            }
            other => {
                let message = failure_message(other);
                tracing::error!(job_id = %job.id, error = %message, "AutoTune job failed");
                job.mark_failed(message)
            }
        };
        if let Err(e) = marked.and_then(|()| self.persist_transition(job, from)) {
            tracing::error!(job_id = %job.id, error = %e, "Failed to record terminal job state");
        }
    }
}

/// Job-facing text for an orchestration error.
pub fn failure_message(err: &AtError) -> String {
    match err {
        AtError::NotFound { kind, .. } => format!("{kind} not found"),
        AtError::Search(SearchError::PredictorNotTrained) => PREDICTOR_NOT_TRAINED.to_string(),
        other => other.to_string(),
    }
}
