//! Fakes and fixtures shared by the engine tests.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use at_optimizer::{
    LinearPredictor, Predictor, ProbeFeatures, ProbeRequest, Prober, SearchSpace, StopSignal,
};
use at_store::{Catalog, JobStore, MemoryCatalog};
use at_types::{BenchmarkRecord, ComputeTarget, DatasetRecord, DelegateError, Job, JobId, Metrics};
use uuid::Uuid;

use crate::delegate::{
    DelegateFactory, Delegates, EvaluationOutcome, EvaluationRequest, Evaluator, Trainer,
    TrainingContext, TrainingRequest,
};
use crate::events::EventBus;
use crate::orchestrator::{JobPlan, Orchestrator};
use crate::registry::Liveness;

/// 2 learning rates x 2 LoRA ranks.
pub fn small_space() -> SearchSpace {
    SearchSpace::new(vec![2e-5, 1e-4], vec![8, 16], vec![1], vec![1])
}

/// Prefers high learning rates, then high LoRA ranks.
pub fn predictor() -> Arc<dyn Predictor> {
    let weights = BTreeMap::from([
        ("learning_rate".to_string(), 1000.0),
        ("lora_r".to_string(), 0.001),
    ]);
    Arc::new(LinearPredictor::new(0.0, weights))
}

pub fn dataset() -> DatasetRecord {
    DatasetRecord {
        id: Uuid::new_v4(),
        filename: "qa.csv".into(),
        path: PathBuf::from("/data/uploads/qa.csv"),
    }
}

#[derive(Default)]
enum TrainerMode {
    #[default]
    Succeed,
    FailOn(Vec<usize>),
    StopJobOn(usize),
    StopExperimentOn(usize),
    Unreachable,
    /// Runs until a stop is requested.
    Block,
    Panic,
}

/// Trainer that counts its calls (1-based) and misbehaves on request.
///
/// Successful runs report the LoRA rank back as a metric so the fake
/// evaluator can score on it.
#[derive(Default)]
pub struct FakeTrainer {
    mode: TrainerMode,
    calls: Arc<AtomicUsize>,
}

impl FakeTrainer {
    fn with_mode(mode: TrainerMode) -> Self {
        Self {
            mode,
            calls: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn failing_on(calls: &[usize]) -> Self {
        Self::with_mode(TrainerMode::FailOn(calls.to_vec()))
    }

    pub fn stopping_job_on(call: usize) -> Self {
        Self::with_mode(TrainerMode::StopJobOn(call))
    }

    pub fn stopping_experiment_on(call: usize) -> Self {
        Self::with_mode(TrainerMode::StopExperimentOn(call))
    }

    pub fn unreachable() -> Self {
        Self::with_mode(TrainerMode::Unreachable)
    }

    pub fn blocking() -> Self {
        Self::with_mode(TrainerMode::Block)
    }

    pub fn panicking() -> Self {
        Self::with_mode(TrainerMode::Panic)
    }

    /// Shared call counter, readable after the trainer moves into `Delegates`.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Trainer for FakeTrainer {
    async fn train(
        &self,
        request: &TrainingRequest,
        ctx: &TrainingContext,
    ) -> Result<Metrics, DelegateError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        match &self.mode {
            TrainerMode::FailOn(calls) if calls.contains(&call) => {
                return Err(DelegateError::failed("CUDA out of memory"));
            }
            TrainerMode::StopJobOn(n) if *n == call => {
                ctx.liveness().stop.request_stop(ctx.job_id());
                return Err(DelegateError::Stopped);
            }
            TrainerMode::StopExperimentOn(n) if *n == call => {
                ctx.liveness().stop.request_stop(ctx.experiment_id());
                return Err(DelegateError::Stopped);
            }
            TrainerMode::Unreachable => {
                return Err(DelegateError::infrastructure(
                    "Connection failed: Connection refused",
                ));
            }
            TrainerMode::Block => loop {
                if ctx.should_stop() {
                    return Err(DelegateError::Stopped);
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            },
            TrainerMode::Panic => panic!("trainer blew up"),
            _ => {}
        }
        Ok(Metrics::from([
            ("train_loss".to_string(), 0.5),
            ("lora_r".to_string(), f64::from(request.config.peft.r)),
        ]))
    }
}

/// Scores `1 - lora_r / 100`, read from the training metrics.
#[derive(Default)]
pub struct FakeEvaluator {
    fail: bool,
}

impl FakeEvaluator {
    pub fn failing() -> Self {
        Self { fail: true }
    }
}

#[async_trait]
impl Evaluator for FakeEvaluator {
    async fn evaluate(
        &self,
        request: &EvaluationRequest,
    ) -> Result<EvaluationOutcome, DelegateError> {
        if self.fail {
            return Err(DelegateError::failed("judge returned garbage"));
        }
        let lora_r = request
            .experiment
            .metrics
            .get("lora_r")
            .copied()
            .ok_or_else(|| DelegateError::failed("no lora_r metric"))?;
        let score = 1.0 - lora_r / 100.0;
        Ok(EvaluationOutcome {
            score,
            metrics: Metrics::from([("judge_score".to_string(), score)]),
        })
    }
}

/// Prober with no dynamic features that counts its calls.
#[derive(Default)]
pub struct FakeProber {
    fail_on: Option<String>,
    // requests a job stop from inside this probe, which still succeeds
    cancel_on: Option<(String, Liveness, JobId)>,
    calls: Arc<AtomicUsize>,
}

impl FakeProber {
    pub fn failing_on(probe_id: &str) -> Self {
        Self {
            fail_on: Some(probe_id.to_string()),
            ..Default::default()
        }
    }

    pub fn cancelling_on(probe_id: &str, liveness: &Liveness, job_id: JobId) -> Self {
        Self {
            cancel_on: Some((probe_id.to_string(), liveness.clone(), job_id)),
            ..Default::default()
        }
    }

    /// Shared call counter, readable after the prober moves into `Delegates`.
    pub fn counter(&self) -> Arc<AtomicUsize> {
        self.calls.clone()
    }
}

#[async_trait]
impl Prober for FakeProber {
    async fn probe(
        &self,
        request: &ProbeRequest,
        _stop: &dyn StopSignal,
    ) -> Result<ProbeFeatures, DelegateError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_on.as_deref() == Some(request.probe_id.as_str()) {
            return Err(DelegateError::failed("probe crashed"));
        }
        if let Some((probe_id, liveness, job_id)) = &self.cancel_on {
            if probe_id == &request.probe_id {
                liveness.stop.request_stop(*job_id);
            }
        }
        Ok(ProbeFeatures::new())
    }
}

/// Hands out the same delegates whatever the target.
pub struct StaticFactory(pub Delegates);

impl DelegateFactory for StaticFactory {
    fn delegates(&self, _target: Option<&ComputeTarget>) -> Delegates {
        self.0.clone()
    }
}

pub fn delegates_with(
    trainer: FakeTrainer,
    evaluator: FakeEvaluator,
    prober: FakeProber,
) -> Delegates {
    Delegates {
        trainer: Arc::new(trainer),
        evaluator: Arc::new(evaluator),
        prober: Arc::new(prober),
    }
}

/// A store, a catalog with one dataset and one benchmark, and private
/// liveness registries.
pub struct Harness {
    pub store: JobStore,
    pub catalog: Arc<MemoryCatalog>,
    pub liveness: Liveness,
    pub events: EventBus,
    pub dataset: DatasetRecord,
    pub benchmark: BenchmarkRecord,
}

impl Harness {
    pub fn new() -> Self {
        let catalog = Arc::new(MemoryCatalog::new());
        let dataset = dataset();
        catalog.save_dataset(dataset.clone()).unwrap();
        let benchmark = BenchmarkRecord::synthesized("What is 2+2?", "4");
        catalog.save_benchmark(benchmark.clone()).unwrap();
        Self {
            store: JobStore::open_in_memory().unwrap(),
            catalog,
            liveness: Liveness::new(),
            events: EventBus::new(),
            dataset,
            benchmark,
        }
    }

    /// A stored `Pending` job over the harness dataset and benchmark.
    pub fn pending_job(&self, top_k: usize) -> Job {
        let job = Job::new(self.dataset.id, self.benchmark.id, None, top_k);
        self.store.create(&job).unwrap();
        job
    }

    pub fn plan(&self) -> JobPlan {
        JobPlan {
            question_field: "question".into(),
            answer_field: "answer".into(),
            probe_steps: 5,
        }
    }

    pub fn delegates(&self) -> Delegates {
        delegates_with(
            FakeTrainer::default(),
            FakeEvaluator::default(),
            FakeProber::default(),
        )
    }

    pub fn delegates_with(
        &self,
        trainer: FakeTrainer,
        evaluator: FakeEvaluator,
        prober: FakeProber,
    ) -> Delegates {
        delegates_with(trainer, evaluator, prober)
    }

    pub fn orchestrator(&self, delegates: Delegates) -> Orchestrator {
        Orchestrator::new(
            self.store.clone(),
            self.catalog.clone(),
            predictor(),
            delegates,
            self.liveness.clone(),
            self.events.clone(),
            small_space(),
        )
    }
}
