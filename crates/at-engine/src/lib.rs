// AutoTune orchestration engine
// Job service, phase orchestrator and the delegates that run payloads on
// compute targets.

pub mod api;
pub mod delegate;
pub mod events;
pub mod orchestrator;
pub mod payload;
pub mod registry;
pub mod service;
pub mod settings;

#[cfg(test)]
pub(crate) mod testing;

pub use api::{route, serve, ApiResponse};
pub use delegate::{
    DelegateFactory, Delegates, EvaluationOutcome, EvaluationRequest, Evaluator, Trainer,
    TrainingContext, TrainingRequest,
};
pub use events::{EventBus, JobEvent};
pub use orchestrator::{failure_message, JobPlan, Orchestrator, OVERSAMPLE_FACTOR, PREDICTOR_NOT_TRAINED};
pub use payload::{
    PayloadDelegateFactory, PayloadEvaluator, PayloadProber, PayloadRunner, PayloadTrainer,
    RunnerEntrypoints,
};
pub use registry::{Liveness, Progress, ProgressRegistry, StopRegistry};
pub use service::{AutoTuneService, INTERRUPTED_MESSAGE};
pub use settings::EngineSettings;
