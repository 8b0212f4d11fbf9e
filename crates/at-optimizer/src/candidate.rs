//! Candidate search: probe every surviving combination and rank it by the
//! predictor's score.

use at_types::{
    AtError, AtResult, Candidate, DatasetRecord, DelegateError, FineTuneConfig, Hyperparameters,
    SearchError,
};

use crate::predictor::Predictor;
use crate::probe::{config_features, ProbeFeatures, ProbeRequest, Prober, StopSignal};
use crate::search::SearchSpace;

#[derive(Debug, Clone, Copy)]
pub struct SearchParams<'a> {
    pub base_config: &'a FineTuneConfig,
    pub dataset: &'a DatasetRecord,
    pub space: &'a SearchSpace,
    pub probe_steps: u32,
    pub max_candidates: usize,
}

/// One probed combination with its predicted score.
#[derive(Debug, Clone, PartialEq)]
pub struct ScoredCandidate {
    pub rank: usize,
    pub hyperparameters: Hyperparameters,
    pub predicted_score: f64,
    pub features: ProbeFeatures,
}

impl From<ScoredCandidate> for Candidate {
    fn from(scored: ScoredCandidate) -> Self {
        Candidate::new(scored.rank, scored.hyperparameters, scored.predicted_score)
    }
}

/// Returns candidates best-predicted first with ranks `1..=N`.
///
/// Any probe or prediction failure aborts the whole search. `stop` is
/// checked before every probe and handed to the prober; a stop either way
/// comes back as [`DelegateError::Stopped`] so the caller can tell
/// cancellation from failure.
pub async fn search(
    params: SearchParams<'_>,
    predictor: &dyn Predictor,
    prober: &dyn Prober,
    stop: &dyn StopSignal,
) -> AtResult<Vec<ScoredCandidate>> {
    if !predictor.is_trained() {
        return Err(SearchError::PredictorNotTrained.into());
    }
    let combinations = params.space.sample(params.max_candidates)?;
    let total = combinations.len();
    let mut scored = Vec::with_capacity(total);

    for (i, hyperparameters) in combinations.into_iter().enumerate() {
        if stop.should_stop() {
            tracing::info!(probed = i, total, "Stop requested, abandoning search");
            return Err(AtError::Delegate(DelegateError::Stopped));
        }
        tracing::info!(probe = i + 1, total, %hyperparameters, "Probing candidate");

        let config = params.base_config.with_hyperparameters(&hyperparameters);
        let probe_id = format!("optimize_{i}");
        let request = ProbeRequest {
            probe_id: probe_id.clone(),
            config,
            dataset: params.dataset.clone(),
            probe_steps: params.probe_steps,
        };

        let dynamic = match prober.probe(&request, stop).await {
            Ok(features) => features,
            Err(DelegateError::Stopped) => return Err(AtError::Delegate(DelegateError::Stopped)),
            Err(e) => {
                return Err(SearchError::ProbeFailed {
                    probe_id,
                    message: e.to_string(),
                }
                .into())
            }
        };

        let mut features = config_features(&request.config);
        features.extend(dynamic);
        let predicted_score = predictor.predict(&features)?;
        tracing::info!(probe_id = %request.probe_id, predicted_score, "Predicted score");

        scored.push(ScoredCandidate {
            rank: 0,
            hyperparameters,
            predicted_score,
            features,
        });
    }

    // stable: ties keep enumeration order
    scored.sort_by(|a, b| b.predicted_score.total_cmp(&a.predicted_score));
    for (i, candidate) in scored.iter_mut().enumerate() {
        candidate.rank = i + 1;
    }
    Ok(scored)
}
