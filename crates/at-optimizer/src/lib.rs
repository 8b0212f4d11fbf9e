//! # at-optimizer
//!
//! Candidate search for AutoTune.
//!
//! Provides the discrete hyperparameter search space with deterministic
//! stride down-sampling, the probe and predictor seams, and the search that
//! probes every surviving combination and ranks it by predicted score.

mod candidate;
mod predictor;
mod probe;
mod search;

pub use candidate::{search, ScoredCandidate, SearchParams};
pub use predictor::{load_predictor, LinearPredictor, Predictor, UntrainedPredictor, PREDICTOR_FILE};
pub use probe::{config_features, ProbeFeatures, ProbeRequest, Prober, StopSignal};
pub use search::SearchSpace;
