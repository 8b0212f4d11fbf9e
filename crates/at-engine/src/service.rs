//! Job lifecycle service: validates and starts jobs, answers status queries,
//! and supervises the background task of every running job.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Receiver;
use dashmap::DashSet;

use at_optimizer::{Predictor, SearchSpace};
use at_remote::{test_connection, transport_for, ConnectionTest};
use at_store::{read_qa_row, Catalog, JobStore};
use at_types::{
    validation_error, AtError, AtResult, AutoTuneRequest, AutoTuneStartResponse, BenchmarkRecord,
    BenchmarkSource, ComputeTarget, ComputeTargetId, DatasetRecord, Job, JobId, JobStatus,
};
use uuid::Uuid;

use crate::delegate::DelegateFactory;
use crate::events::{EventBus, JobEvent};
use crate::orchestrator::{JobPlan, Orchestrator, PREDICTOR_NOT_TRAINED};
use crate::registry::{Liveness, Progress};

pub const INTERRUPTED_MESSAGE: &str = "Interrupted: service restarted";

const WAIT_POLL: Duration = Duration::from_millis(20);

/// Entry point for everything that touches AutoTune jobs.
///
/// Clones share the store, registries and running-task set.
#[derive(Clone)]
pub struct AutoTuneService {
    store: JobStore,
    catalog: Arc<dyn Catalog>,
    predictor: Arc<dyn Predictor>,
    delegates: Arc<dyn DelegateFactory>,
    liveness: Liveness,
    events: EventBus,
    space: SearchSpace,
    // jobs whose supervising task has not finished yet
    running: Arc<DashSet<JobId>>,
}

impl std::fmt::Debug for AutoTuneService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AutoTuneService")
            .field("running", &self.running.len())
            .finish_non_exhaustive()
    }
}

impl AutoTuneService {
    pub fn new(
        store: JobStore,
        catalog: Arc<dyn Catalog>,
        predictor: Arc<dyn Predictor>,
        delegates: Arc<dyn DelegateFactory>,
    ) -> Self {
        Self {
            store,
            catalog,
            predictor,
            delegates,
            liveness: Liveness::global().clone(),
            events: EventBus::new(),
            space: SearchSpace::default(),
            running: Arc::new(DashSet::new()),
        }
    }

    pub fn with_liveness(mut self, liveness: Liveness) -> Self {
        self.liveness = liveness;
        self
    }

    pub fn with_search_space(mut self, space: SearchSpace) -> Self {
        self.space = space;
        self
    }

    pub fn liveness(&self) -> &Liveness {
        &self.liveness
    }

    /// Validate `request`, create the job and start it in the background.
    ///
    /// Every validation runs before anything is written, so a rejected
    /// request leaves no job behind.
    pub fn start(&self, request: AutoTuneRequest) -> AtResult<AutoTuneStartResponse> {
        request.validate()?;
        let dataset = self
            .catalog
            .dataset(request.dataset_id)?
            .ok_or_else(|| AtError::not_found("Dataset", request.dataset_id))?;
        if let Some(id) = request.base_config_id {
            self.catalog
                .config(id)?
                .ok_or_else(|| AtError::not_found("Base config", id))?;
        }
        let target = match request.compute_target_id {
            Some(id) => Some(
                self.catalog
                    .compute_target(id)?
                    .ok_or_else(|| AtError::not_found("Compute target", id))?,
            ),
            None => None,
        };
        let (benchmark_id, synthesized) = self.resolve_benchmark(&request, &dataset)?;
        if !self.predictor.is_trained() {
            return Err(validation_error!("{}", PREDICTOR_NOT_TRAINED));
        }

        if let Some(benchmark) = synthesized {
            self.catalog.save_benchmark(benchmark)?;
        }
        let job = Job::new(
            request.dataset_id,
            benchmark_id,
            request.base_config_id,
            request.top_k,
        );
        self.store.create(&job)?;
        tracing::info!(
            job_id = %job.id,
            dataset_id = %job.dataset_id,
            top_k = job.top_k,
            remote = target.is_some(),
            "AutoTune job created"
        );

        let plan = JobPlan {
            question_field: request.question_field.clone(),
            answer_field: request.answer_field.clone(),
            probe_steps: request.probe_steps,
        };
        let response = AutoTuneStartResponse {
            job_id: job.id,
            status: job.status,
            message: format!(
                "AutoTune started. Training {} configs. Poll /autotune/{} for status.",
                request.top_k, job.id
            ),
        };
        self.spawn(job, plan, target);
        Ok(response)
    }

    /// Benchmark id for the job, plus the record to save if it is new.
    fn resolve_benchmark(
        &self,
        request: &AutoTuneRequest,
        dataset: &DatasetRecord,
    ) -> AtResult<(Uuid, Option<BenchmarkRecord>)> {
        match request.benchmark_source()? {
            BenchmarkSource::Existing(id) => {
                self.catalog
                    .benchmark(id)?
                    .ok_or_else(|| AtError::not_found("Benchmark", id))?;
                Ok((id, None))
            }
            BenchmarkSource::Manual { question, answer } => {
                let benchmark = BenchmarkRecord::synthesized(question, answer);
                Ok((benchmark.id, Some(benchmark)))
            }
            BenchmarkSource::DatasetRow(row) => {
                let qa = read_qa_row(
                    &dataset.path,
                    row,
                    &request.question_field,
                    &request.answer_field,
                )?;
                let benchmark = BenchmarkRecord::synthesized(qa.question, qa.answer);
                Ok((benchmark.id, Some(benchmark)))
            }
        }
    }

    /// Run the job on its own task under a supervisor that records a panic
    /// as a failure.
    fn spawn(&self, job: Job, plan: JobPlan, target: Option<ComputeTarget>) {
        let job_id = job.id;
        let orchestrator = Orchestrator::new(
            self.store.clone(),
            self.catalog.clone(),
            self.predictor.clone(),
            self.delegates.delegates(target.as_ref()),
            self.liveness.clone(),
            self.events.clone(),
            self.space.clone(),
        );
        let worker = tokio::spawn(async move { orchestrator.run(job, &plan).await });

        self.running.insert(job_id);
        let service = self.clone();
        tokio::spawn(async move {
            if let Err(e) = worker.await {
                tracing::error!(job_id = %job_id, error = %e, "AutoTune task aborted");
                service.fail_aborted(job_id, &e.to_string());
            }
            service.liveness.stop.clear(job_id);
            service.liveness.deleted.remove(&job_id);
            service.running.remove(&job_id);
        });
    }

    fn fail_aborted(&self, job_id: JobId, reason: &str) {
        if self.liveness.is_deleted(job_id) {
            return;
        }
        let mut job = match self.store.get(job_id) {
            Ok(Some(job)) if !job.is_terminal() => job,
            Ok(_) => return,
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to load aborted job");
                return;
            }
        };
        let from = job.status;
        let result = job
            .mark_failed(format!("Internal error: {reason}"))
            .and_then(|()| self.store.update(&job));
        match result {
            Ok(()) => self.events.publish(JobEvent {
                job_id,
                from,
                to: job.status,
                message: job.phase_message.clone(),
            }),
            Err(e) => {
                tracing::error!(job_id = %job_id, error = %e, "Failed to record aborted job")
            }
        }
    }

    /// Current record of a job. Never mutates anything.
    pub fn get_status(&self, id: JobId) -> AtResult<Job> {
        self.store
            .get(id)?
            .ok_or_else(|| AtError::not_found("AutoTune job", id))
    }

    /// All jobs, most recent first.
    pub fn list(&self) -> AtResult<Vec<Job>> {
        self.store.list()
    }

    /// Remove a job record. A running job is stopped and its task is kept
    /// from writing the record back.
    pub fn delete(&self, id: JobId) -> AtResult<bool> {
        if self.running.contains(&id) {
            self.liveness.deleted.insert(id);
            self.liveness.stop.request_stop(id);
        }
        let removed = self.store.delete(id)?;
        if removed {
            tracing::info!(job_id = %id, "AutoTune job deleted");
        }
        Ok(removed)
    }

    /// Ask a job to stop. Returns false for unknown or already terminal jobs.
    pub fn cancel(&self, id: JobId) -> AtResult<bool> {
        let mut job = self.get_status(id)?;
        if job.is_terminal() {
            return Ok(false);
        }
        if self.running.contains(&id) {
            self.liveness.stop.request_stop(id);
            tracing::info!(job_id = %id, "Stop requested");
            return Ok(true);
        }
        // no task will observe the flag; record the cancellation directly
        let from = job.status;
        job.mark_cancelled()?;
        self.store.update(&job)?;
        self.events.publish(JobEvent {
            job_id: id,
            from,
            to: job.status,
            message: job.phase_message.clone(),
        });
        Ok(true)
    }

    /// Last reported training progress of an experiment.
    pub fn progress(&self, experiment_id: Uuid) -> Option<Progress> {
        self.liveness.progress.get(experiment_id)
    }

    pub fn subscribe(&self) -> Receiver<JobEvent> {
        self.events.subscribe()
    }

    pub fn is_running(&self, id: JobId) -> bool {
        self.running.contains(&id)
    }

    /// Wait until the job's task is gone and return its final record.
    pub async fn wait(&self, id: JobId) -> AtResult<Option<Job>> {
        while self.running.contains(&id) {
            tokio::time::sleep(WAIT_POLL).await;
        }
        self.store.get(id)
    }

    /// Check that a compute target is reachable and record the outcome on it.
    pub async fn test_compute_target(&self, id: ComputeTargetId) -> AtResult<ConnectionTest> {
        let mut target = self
            .catalog
            .compute_target(id)?
            .ok_or_else(|| AtError::not_found("Compute target", id))?;
        let result = test_connection(transport_for(Some(&target))).await;
        tracing::info!(
            target_name = %target.name,
            success = result.success,
            message = %result.message,
            "Compute target tested"
        );
        target.record_test(result.success, result.message.clone());
        self.catalog.save_compute_target(target)?;
        Ok(result)
    }

    /// Fail every non-terminal job that has no task in this process.
    ///
    /// Run once at startup: such jobs were left behind by a previous process.
    pub fn reconcile_stale_jobs(&self) -> AtResult<usize> {
        let live = [
            JobStatus::Pending,
            JobStatus::Probing,
            JobStatus::Training,
            JobStatus::Evaluating,
        ];
        let mut count = 0;
        for mut job in self.store.list_by_status(&live)? {
            if self.running.contains(&job.id) {
                continue;
            }
            job.mark_failed(INTERRUPTED_MESSAGE)?;
            self.store.update(&job)?;
            tracing::warn!(job_id = %job.id, "Marked interrupted job as failed");
            count += 1;
        }
        Ok(count)
    }
}
