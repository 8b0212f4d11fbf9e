//! Fine-tuning configuration and the hyperparameters AutoTune varies.

use serde::{Deserialize, Serialize};

/// The four tunable hyperparameters of a candidate.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Hyperparameters {
    pub learning_rate: f64,
    pub lora_r: u32,
    pub batch_size: u32,
    pub num_epochs: u32,
}

impl std::fmt::Display for Hyperparameters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "LR={:.0e}, LoRA r={}, batch={}, epochs={}",
            self.learning_rate, self.lora_r, self.batch_size, self.num_epochs
        )
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DataSection {
    pub question_field: String,
    pub answer_field: String,
    pub system_prompt: Option<String>,
    pub validation_split: f64,
    pub max_length: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelSection {
    pub pretrained_model_name: String,
    pub trust_remote_code: bool,
    pub pad_token_override: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TrainingSection {
    pub num_train_epochs: u32,
    pub per_device_train_batch_size: u32,
    pub per_device_eval_batch_size: u32,
    pub learning_rate: f64,
    pub warmup_ratio: f64,
    pub weight_decay: f64,
    pub gradient_accumulation_steps: u32,
    pub gradient_checkpointing: bool,
    pub fp16: bool,
    pub logging_steps: u32,
    pub eval_steps: u32,
    pub save_steps: u32,
    pub early_stopping_patience: Option<u32>,
    /// Local output directory; filled in per experiment.
    #[serde(default)]
    pub output_dir: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PeftSection {
    pub enabled: bool,
    pub r: u32,
    pub lora_alpha: u32,
    pub lora_dropout: f64,
}

/// Full causal-LM fine-tuning configuration handed to the training delegate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FineTuneConfig {
    pub data: DataSection,
    pub model: ModelSection,
    pub training: TrainingSection,
    pub peft: PeftSection,
}

impl FineTuneConfig {
    /// Default base configuration used when a job names no base config.
    pub fn default_for_fields(question_field: &str, answer_field: &str) -> Self {
        Self {
            data: DataSection {
                question_field: question_field.to_string(),
                answer_field: answer_field.to_string(),
                system_prompt: Some("You are a helpful AI assistant.".to_string()),
                validation_split: 0.2,
                max_length: 512,
            },
            model: ModelSection {
                pretrained_model_name: "TinyLlama/TinyLlama-1.1B-Chat-v1.0".to_string(),
                trust_remote_code: false,
                pad_token_override: Some("</s>".to_string()),
            },
            training: TrainingSection {
                num_train_epochs: 2,
                per_device_train_batch_size: 2,
                per_device_eval_batch_size: 2,
                learning_rate: 1e-4,
                warmup_ratio: 0.03,
                weight_decay: 0.0,
                gradient_accumulation_steps: 4,
                gradient_checkpointing: true,
                fp16: true,
                logging_steps: 10,
                eval_steps: 50,
                save_steps: 100,
                early_stopping_patience: Some(3),
                output_dir: None,
            },
            peft: PeftSection {
                enabled: true,
                r: 8,
                lora_alpha: 16,
                lora_dropout: 0.05,
            },
        }
    }

    /// Overlay candidate hyperparameters on a copy of this configuration.
    ///
    /// LoRA settings are only touched when PEFT is enabled; alpha follows
    /// the usual `2 * r` convention.
    pub fn with_hyperparameters(&self, hp: &Hyperparameters) -> Self {
        let mut config = self.clone();
        config.training.learning_rate = hp.learning_rate;
        config.training.per_device_train_batch_size = hp.batch_size;
        config.training.num_train_epochs = hp.num_epochs;
        if config.peft.enabled {
            config.peft.r = hp.lora_r;
            config.peft.lora_alpha = hp.lora_r * 2;
        }
        config
    }

    pub fn with_output_dir(mut self, output_dir: impl Into<String>) -> Self {
        self.training.output_dir = Some(output_dir.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn hp() -> Hyperparameters {
        Hyperparameters {
            learning_rate: 5e-5,
            lora_r: 16,
            batch_size: 1,
            num_epochs: 3,
        }
    }

    #[test]
    fn overlay_sets_training_and_lora() {
        let base = FineTuneConfig::default_for_fields("q", "a");
        let config = base.with_hyperparameters(&hp());

        assert_eq!(config.training.learning_rate, 5e-5);
        assert_eq!(config.training.per_device_train_batch_size, 1);
        assert_eq!(config.training.num_train_epochs, 3);
        assert_eq!(config.peft.r, 16);
        assert_eq!(config.peft.lora_alpha, 32);
        // base untouched
        assert_eq!(base.peft.r, 8);
        assert_eq!(base.data.question_field, "q");
    }

    #[test]
    fn overlay_leaves_lora_alone_when_peft_disabled() {
        let mut base = FineTuneConfig::default_for_fields("q", "a");
        base.peft.enabled = false;
        let config = base.with_hyperparameters(&hp());
        assert_eq!(config.peft.r, 8);
        assert_eq!(config.peft.lora_alpha, 16);
        assert_eq!(config.training.learning_rate, 5e-5);
    }

    #[test]
    fn hyperparameters_display() {
        assert_eq!(hp().to_string(), "LR=5e-5, LoRA r=16, batch=1, epochs=3");
    }
}
