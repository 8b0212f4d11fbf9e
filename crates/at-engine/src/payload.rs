//! Delegates that hand each unit of work to an external runner through a
//! [`RemoteSession`], on a compute target or on this machine.
//!
//! Every call opens its own session and closes it again on all exit paths.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use at_optimizer::{ProbeFeatures, ProbeRequest, Prober, StopSignal};
use at_remote::{
    adjust_payload_paths, transport_for, Entrypoint, LogicalPath, PathCategory, RemoteSession,
};
use at_types::{ComputeTarget, DelegateError, Metrics};
use serde_json::{json, Value};
use tokio::time::MissedTickBehavior;
use uuid::Uuid;

use crate::delegate::{
    DelegateFactory, Delegates, EvaluationOutcome, EvaluationRequest, Evaluator, Trainer,
    TrainingContext, TrainingRequest,
};
use crate::registry::Progress;
use crate::settings::EngineSettings;

pub const PROGRESS_FILE: &str = "progress.json";

/// Runner entrypoints for the three kinds of work.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunnerEntrypoints {
    pub train: Entrypoint,
    pub evaluate: Entrypoint,
    pub probe: Entrypoint,
}

impl Default for RunnerEntrypoints {
    fn default() -> Self {
        Self {
            train: Entrypoint::PythonModule("src.autotune_train_runner".to_string()),
            evaluate: Entrypoint::PythonModule("src.autotune_eval_runner".to_string()),
            probe: Entrypoint::PythonModule("src.autotune_probe_runner".to_string()),
        }
    }
}

/// Where and how payloads run. Shared by the three payload delegates.
#[derive(Debug, Clone)]
pub struct PayloadRunner {
    target: Option<ComputeTarget>,
    local_work_dir: PathBuf,
    artifacts_dir: PathBuf,
    source_dir: Option<PathBuf>,
    entrypoints: RunnerEntrypoints,
    train_timeout: Duration,
    eval_timeout: Duration,
    probe_timeout: Duration,
    poll_interval: Duration,
}

impl PayloadRunner {
    pub fn new(settings: &EngineSettings, target: Option<ComputeTarget>) -> Self {
        Self {
            target,
            local_work_dir: settings.data_dir.clone(),
            artifacts_dir: settings.artifacts_dir.clone(),
            source_dir: settings.source_dir.clone(),
            entrypoints: RunnerEntrypoints::default(),
            train_timeout: settings.train_timeout,
            eval_timeout: settings.eval_timeout,
            probe_timeout: settings.probe_timeout,
            poll_interval: settings.poll_interval,
        }
    }

    pub fn with_entrypoints(mut self, entrypoints: RunnerEntrypoints) -> Self {
        self.entrypoints = entrypoints;
        self
    }

    fn work_dir(&self) -> String {
        match &self.target {
            Some(target) => target.remote_work_dir.clone(),
            None => self.local_work_dir.to_string_lossy().into_owned(),
        }
    }

    fn describe_target(&self) -> &str {
        self.target.as_ref().map(|t| t.name.as_str()).unwrap_or("local")
    }

    async fn open(&self) -> Result<RemoteSession, DelegateError> {
        let session = RemoteSession::open(transport_for(self.target.as_ref()), &self.work_dir()).await?;
        Ok(session)
    }

    async fn close(&self, session: RemoteSession) {
        if let Err(e) = session.close().await {
            tracing::warn!(target_name = self.describe_target(), error = %e, "Failed to close remote session");
        }
    }

    fn artifacts_path(root: &str, relative: &str) -> String {
        LogicalPath {
            category: PathCategory::Artifacts,
            relative: PathBuf::from(relative),
        }
        .resolve(root)
    }

    /// Upload sources (and the dataset, if any) before a run.
    async fn prepare(
        &self,
        session: &RemoteSession,
        dataset: Option<&std::path::Path>,
    ) -> Result<(), DelegateError> {
        session
            .prepare_environment(self.source_dir.as_deref(), dataset, &[])
            .await?;
        Ok(())
    }
}

/// Numeric entries of `result.metrics`, or of the result itself when it has
/// no `metrics` object.
fn numeric_map(result: &Value, key: &str) -> Metrics {
    let object = result
        .get(key)
        .and_then(Value::as_object)
        .or_else(|| result.as_object());
    object
        .map(|map| {
            map.iter()
                .filter_map(|(k, v)| v.as_f64().map(|f| (k.clone(), f)))
                .collect()
        })
        .unwrap_or_default()
}

fn dataset_json(dataset: &at_types::DatasetRecord) -> Value {
    json!({
        "id": dataset.id,
        "filename": dataset.filename,
        "path": dataset.path,
    })
}

#[derive(Debug, Clone)]
pub struct PayloadTrainer {
    runner: PayloadRunner,
}

impl PayloadTrainer {
    pub fn new(runner: PayloadRunner) -> Self {
        Self { runner }
    }

    async fn run(
        &self,
        session: &RemoteSession,
        request: &TrainingRequest,
        ctx: &TrainingContext,
    ) -> Result<Metrics, DelegateError> {
        self.runner.prepare(session, Some(&request.dataset.path)).await?;

        let name = request.experiment.id.to_string();
        let local_output = self.runner.artifacts_dir.join(&name);
        let config = request
            .config
            .clone()
            .with_output_dir(local_output.to_string_lossy());
        let payload = adjust_payload_paths(
            &json!({
                "job_id": request.job_id,
                "experiment_id": request.experiment.id,
                "dataset": dataset_json(&request.dataset),
                "config": config,
                "output_dir": local_output,
            }),
            session.root(),
        );
        let run_dir = PayloadRunner::artifacts_path(session.root(), &name);
        let progress_path = format!("{run_dir}/{PROGRESS_FILE}");

        tracing::info!(
            job_id = %request.job_id,
            experiment_id = %request.experiment.id,
            target_name = self.runner.describe_target(),
            "Dispatching training run"
        );

        let outcome = {
            let run = session.run_payload(
                &run_dir,
                &self.runner.entrypoints.train,
                &payload,
                self.runner.train_timeout,
            );
            tokio::pin!(run);
            let mut ticker = tokio::time::interval(self.runner.poll_interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    result = &mut run => break result.map_err(DelegateError::from),
                    _ = ticker.tick() => {
                        if ctx.should_stop() {
                            tracing::info!(experiment_id = %request.experiment.id, "Stop requested, terminating training run");
                            break Err(DelegateError::Stopped);
                        }
                        if let Ok(Some(value)) = session.read_json_if_exists(&progress_path).await {
                            ctx.report_progress(Progress::from_json(&value));
                        }
                    }
                }
            }
        };

        if !matches!(outcome, Err(DelegateError::Stopped)) {
            if let Err(e) = session.retrieve_artifacts(&run_dir, &local_output).await {
                tracing::warn!(experiment_id = %request.experiment.id, error = %e, "Could not retrieve training artifacts");
            }
        }

        outcome.map(|result| numeric_map(&result, "metrics"))
    }
}

#[async_trait]
impl Trainer for PayloadTrainer {
    async fn train(
        &self,
        request: &TrainingRequest,
        ctx: &TrainingContext,
    ) -> Result<Metrics, DelegateError> {
        let session = self.runner.open().await?;
        let result = self.run(&session, request, ctx).await;
        self.runner.close(session).await;
        result
    }
}

#[derive(Debug, Clone)]
pub struct PayloadEvaluator {
    runner: PayloadRunner,
}

impl PayloadEvaluator {
    pub fn new(runner: PayloadRunner) -> Self {
        Self { runner }
    }

    async fn run(
        &self,
        session: &RemoteSession,
        request: &EvaluationRequest,
    ) -> Result<EvaluationOutcome, DelegateError> {
        self.runner.prepare(session, None).await?;

        let experiment = request.experiment.id.to_string();
        let run_name = format!("{experiment}/eval_{}", request.evaluation.id);
        let payload = adjust_payload_paths(
            &json!({
                "job_id": request.job_id,
                "eval_id": request.evaluation.id,
                "experiment_id": request.experiment.id,
                "benchmark": {
                    "id": request.benchmark.id,
                    "name": request.benchmark.name,
                    "question": request.benchmark.question,
                    "gold_answer": request.benchmark.gold_answer,
                },
                "checkpoint_path": self.runner.artifacts_dir.join(&experiment),
                "output_dir": self.runner.artifacts_dir.join(&run_name),
            }),
            session.root(),
        );
        let run_dir = PayloadRunner::artifacts_path(session.root(), &run_name);

        tracing::info!(
            job_id = %request.job_id,
            experiment_id = %request.experiment.id,
            eval_id = %request.evaluation.id,
            "Dispatching evaluation run"
        );
        let result = session
            .run_payload(
                &run_dir,
                &self.runner.entrypoints.evaluate,
                &payload,
                self.runner.eval_timeout,
            )
            .await?;

        let score = result
            .get("score")
            .and_then(Value::as_f64)
            .ok_or_else(|| DelegateError::failed("evaluation result has no numeric score"))?;
        Ok(EvaluationOutcome {
            score,
            metrics: numeric_map(&result, "metrics"),
        })
    }
}

#[async_trait]
impl Evaluator for PayloadEvaluator {
    async fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<EvaluationOutcome, DelegateError> {
        let session = self.runner.open().await?;
        let result = self.run(&session, request).await;
        self.runner.close(session).await;
        result
    }
}

#[derive(Debug, Clone)]
pub struct PayloadProber {
    runner: PayloadRunner,
}

impl PayloadProber {
    pub fn new(runner: PayloadRunner) -> Self {
        Self { runner }
    }

    async fn run(
        &self,
        session: &RemoteSession,
        request: &ProbeRequest,
        stop: &dyn StopSignal,
    ) -> Result<ProbeFeatures, DelegateError> {
        self.runner.prepare(session, Some(&request.dataset.path)).await?;

        // probe ids repeat across jobs
        let short = Uuid::new_v4().simple().to_string();
        let run_name = format!("probe_{}_{}", request.probe_id, &short[..8]);
        let payload = adjust_payload_paths(
            &json!({
                "probe_id": request.probe_id,
                "probe_steps": request.probe_steps,
                "dataset": dataset_json(&request.dataset),
                "config": request.config,
                "output_dir": self.runner.artifacts_dir.join(&run_name),
            }),
            session.root(),
        );
        let run_dir = PayloadRunner::artifacts_path(session.root(), &run_name);

        tracing::debug!(probe_id = %request.probe_id, "Dispatching probe run");
        let run = session.run_payload(
            &run_dir,
            &self.runner.entrypoints.probe,
            &payload,
            self.runner.probe_timeout,
        );
        tokio::pin!(run);
        let mut ticker = tokio::time::interval(self.runner.poll_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let result = loop {
            tokio::select! {
                result = &mut run => break result?,
                _ = ticker.tick() => {
                    if stop.should_stop() {
                        tracing::info!(probe_id = %request.probe_id, "Stop requested, terminating probe run");
                        return Err(DelegateError::Stopped);
                    }
                }
            }
        };
        Ok(numeric_map(&result, "features"))
    }
}

#[async_trait]
impl Prober for PayloadProber {
    async fn probe(
        &self,
        request: &ProbeRequest,
        stop: &dyn StopSignal,
    ) -> Result<ProbeFeatures, DelegateError> {
        let session = self.runner.open().await?;
        let result = self.run(&session, request, stop).await;
        self.runner.close(session).await;
        result
    }
}

/// Builds payload delegates from the engine settings.
#[derive(Debug, Clone)]
pub struct PayloadDelegateFactory {
    settings: EngineSettings,
    entrypoints: RunnerEntrypoints,
}

impl PayloadDelegateFactory {
    pub fn new(settings: EngineSettings) -> Self {
        Self {
            settings,
            entrypoints: RunnerEntrypoints::default(),
        }
    }

    pub fn with_entrypoints(mut self, entrypoints: RunnerEntrypoints) -> Self {
        self.entrypoints = entrypoints;
        self
    }
}

impl DelegateFactory for PayloadDelegateFactory {
    fn delegates(&self, target: Option<&ComputeTarget>) -> Delegates {
        let runner = PayloadRunner::new(&self.settings, target.cloned())
            .with_entrypoints(self.entrypoints.clone());
        Delegates {
            trainer: std::sync::Arc::new(PayloadTrainer::new(runner.clone())),
            evaluator: std::sync::Arc::new(PayloadEvaluator::new(runner.clone())),
            prober: std::sync::Arc::new(PayloadProber::new(runner)),
        }
    }
}
