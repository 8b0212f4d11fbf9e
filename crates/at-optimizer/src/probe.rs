//! Probe seam: a short, bounded training run that yields features.

use std::collections::BTreeMap;

use async_trait::async_trait;
use at_types::{DatasetRecord, DelegateError, FineTuneConfig};

/// Named numeric features fed to the predictor.
pub type ProbeFeatures = BTreeMap<String, f64>;

#[derive(Debug, Clone)]
pub struct ProbeRequest {
    /// `optimize_<i>` for the i-th probed combination.
    pub probe_id: String,
    pub config: FineTuneConfig,
    pub dataset: DatasetRecord,
    pub probe_steps: u32,
}

/// Tells a search or a running probe that its job should stop.
pub trait StopSignal: Send + Sync {
    fn should_stop(&self) -> bool;
}

impl<F> StopSignal for F
where
    F: Fn() -> bool + Send + Sync,
{
    fn should_stop(&self) -> bool {
        self()
    }
}

/// Runs one probe and returns its dynamic features (loss curve, gradient
/// statistics and similar). Static config features are merged in by the
/// search, the prober only reports what it measured.
#[async_trait]
pub trait Prober: Send + Sync {
    /// Implementations that run for long poll `stop` and return
    /// [`DelegateError::Stopped`] once it turns true.
    async fn probe(
        &self,
        request: &ProbeRequest,
        stop: &dyn StopSignal,
    ) -> Result<ProbeFeatures, DelegateError>;
}

/// Static features derived from the configuration alone.
///
/// LoRA rank and alpha are reported as 0 when PEFT is disabled.
pub fn config_features(config: &FineTuneConfig) -> ProbeFeatures {
    let lora_enabled = config.peft.enabled;
    let (lora_r, lora_alpha) = if lora_enabled {
        (config.peft.r, config.peft.lora_alpha)
    } else {
        (0, 0)
    };

    let mut features = ProbeFeatures::new();
    features.insert("learning_rate".into(), config.training.learning_rate);
    features.insert("num_epochs".into(), f64::from(config.training.num_train_epochs));
    features.insert(
        "batch_size".into(),
        f64::from(config.training.per_device_train_batch_size),
    );
    features.insert(
        "gradient_accumulation_steps".into(),
        f64::from(config.training.gradient_accumulation_steps),
    );
    features.insert("warmup_ratio".into(), config.training.warmup_ratio);
    features.insert("weight_decay".into(), config.training.weight_decay);
    features.insert("max_length".into(), f64::from(config.data.max_length));
    features.insert("lora_enabled".into(), if lora_enabled { 1.0 } else { 0.0 });
    features.insert("lora_r".into(), f64::from(lora_r));
    features.insert("lora_alpha".into(), f64::from(lora_alpha));
    features
}
