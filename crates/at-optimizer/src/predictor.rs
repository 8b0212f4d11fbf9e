//! Predictor seam and the shipped linear model.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use at_types::{AtResult, SearchError};
use serde::{Deserialize, Serialize};

use crate::probe::ProbeFeatures;

/// File name of a saved predictor inside the predictor directory.
pub const PREDICTOR_FILE: &str = "predictor.json";

/// Maps probe features to a predicted quality score (higher is better).
pub trait Predictor: Send + Sync {
    fn is_trained(&self) -> bool;

    fn predict(&self, features: &ProbeFeatures) -> Result<f64, SearchError>;
}

/// Stand-in used when no model has been saved yet.
#[derive(Debug, Clone, Copy, Default)]
pub struct UntrainedPredictor;

impl Predictor for UntrainedPredictor {
    fn is_trained(&self) -> bool {
        false
    }

    fn predict(&self, _features: &ProbeFeatures) -> Result<f64, SearchError> {
        Err(SearchError::PredictorNotTrained)
    }
}

/// `bias + Σ weight[name] * features[name]`.
///
/// Every weighted feature must be present in the input.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinearPredictor {
    pub bias: f64,
    pub weights: BTreeMap<String, f64>,
    #[serde(default)]
    pub target_name: String,
}

impl LinearPredictor {
    pub fn new(bias: f64, weights: BTreeMap<String, f64>) -> Self {
        Self {
            bias,
            weights,
            target_name: "score".to_string(),
        }
    }

    pub fn load(dir: &Path) -> AtResult<Option<Self>> {
        let path = dir.join(PREDICTOR_FILE);
        if !path.exists() {
            return Ok(None);
        }
        let bytes = std::fs::read(&path)?;
        let model: Self = serde_json::from_slice(&bytes).map_err(|e| SearchError::Model {
            message: format!("{}: {e}", path.display()),
        })?;
        if !model.bias.is_finite() || model.weights.values().any(|w| !w.is_finite()) {
            return Err(SearchError::Model {
                message: format!("{}: non-finite coefficient", path.display()),
            }
            .into());
        }
        Ok(Some(model))
    }

    pub fn save(&self, dir: &Path) -> AtResult<()> {
        std::fs::create_dir_all(dir)?;
        let json = serde_json::to_vec_pretty(self)?;
        std::fs::write(dir.join(PREDICTOR_FILE), json)?;
        Ok(())
    }
}

impl Predictor for LinearPredictor {
    fn is_trained(&self) -> bool {
        true
    }

    fn predict(&self, features: &ProbeFeatures) -> Result<f64, SearchError> {
        let mut score = self.bias;
        for (name, weight) in &self.weights {
            let value = features
                .get(name)
                .ok_or_else(|| SearchError::PredictionFailed {
                    message: format!("missing feature '{name}'"),
                })?;
            score += weight * value;
        }
        if !score.is_finite() {
            return Err(SearchError::PredictionFailed {
                message: format!("non-finite prediction {score}"),
            });
        }
        Ok(score)
    }
}

/// Load the saved predictor from `dir`, falling back to an untrained one
/// when no model file exists.
pub fn load_predictor(dir: &Path) -> AtResult<Arc<dyn Predictor>> {
    match LinearPredictor::load(dir)? {
        Some(model) => {
            tracing::info!(
                path = %dir.join(PREDICTOR_FILE).display(),
                features = model.weights.len(),
                "Loaded predictor"
            );
            Ok(Arc::new(model))
        }
        None => {
            tracing::warn!(dir = %dir.display(), "No predictor model found; AutoTune requests will be rejected");
            Ok(Arc::new(UntrainedPredictor))
        }
    }
}
