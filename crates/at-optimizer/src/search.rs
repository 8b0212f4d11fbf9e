//! Discrete hyperparameter search space.

use at_types::{Hyperparameters, SearchError};
use serde::{Deserialize, Serialize};

/// Closed set of values per tunable hyperparameter.
///
/// Combinations are enumerated in axis order: learning rate (outermost),
/// LoRA rank, batch size, epochs (innermost).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchSpace {
    pub learning_rates: Vec<f64>,
    pub lora_ranks: Vec<u32>,
    pub batch_sizes: Vec<u32>,
    pub num_epochs: Vec<u32>,
}

impl Default for SearchSpace {
    fn default() -> Self {
        Self {
            learning_rates: vec![2e-5, 5e-5, 1e-4],
            lora_ranks: vec![8, 16],
            batch_sizes: vec![1, 2],
            num_epochs: vec![1, 2],
        }
    }
}

impl SearchSpace {
    pub fn new(
        learning_rates: Vec<f64>,
        lora_ranks: Vec<u32>,
        batch_sizes: Vec<u32>,
        num_epochs: Vec<u32>,
    ) -> Self {
        Self {
            learning_rates,
            lora_ranks,
            batch_sizes,
            num_epochs,
        }
    }

    pub fn with_learning_rates(mut self, values: Vec<f64>) -> Self {
        self.learning_rates = values;
        self
    }

    pub fn with_lora_ranks(mut self, values: Vec<u32>) -> Self {
        self.lora_ranks = values;
        self
    }

    pub fn with_batch_sizes(mut self, values: Vec<u32>) -> Self {
        self.batch_sizes = values;
        self
    }

    pub fn with_num_epochs(mut self, values: Vec<u32>) -> Self {
        self.num_epochs = values;
        self
    }

    pub fn validate(&self) -> Result<(), SearchError> {
        if self.learning_rates.is_empty() {
            return Err(SearchError::EmptyAxis {
                axis: "learning_rates",
            });
        }
        if self.lora_ranks.is_empty() {
            return Err(SearchError::EmptyAxis { axis: "lora_ranks" });
        }
        if self.batch_sizes.is_empty() {
            return Err(SearchError::EmptyAxis { axis: "batch_sizes" });
        }
        if self.num_epochs.is_empty() {
            return Err(SearchError::EmptyAxis { axis: "num_epochs" });
        }
        if let Some(lr) = self
            .learning_rates
            .iter()
            .find(|lr| !lr.is_finite() || **lr <= 0.0)
        {
            return Err(SearchError::InvalidSpace {
                message: format!("learning rate must be positive, got {lr}"),
            });
        }
        let zero_axis = [
            ("lora_ranks", &self.lora_ranks),
            ("batch_sizes", &self.batch_sizes),
            ("num_epochs", &self.num_epochs),
        ]
        .into_iter()
        .find(|(_, values)| values.contains(&0));
        if let Some((axis, _)) = zero_axis {
            return Err(SearchError::InvalidSpace {
                message: format!("{axis} must not contain 0"),
            });
        }
        Ok(())
    }

    /// Total number of combinations, `None` on overflow.
    pub fn grid_size(&self) -> Option<usize> {
        [
            self.learning_rates.len(),
            self.lora_ranks.len(),
            self.batch_sizes.len(),
            self.num_epochs.len(),
        ]
        .into_iter()
        .try_fold(1usize, |total, dim| total.checked_mul(dim))
    }

    /// Full Cartesian product in axis order.
    pub fn combinations(&self) -> Vec<Hyperparameters> {
        let mut result = Vec::with_capacity(self.grid_size().unwrap_or(0));
        for &learning_rate in &self.learning_rates {
            for &lora_r in &self.lora_ranks {
                for &batch_size in &self.batch_sizes {
                    for &num_epochs in &self.num_epochs {
                        result.push(Hyperparameters {
                            learning_rate,
                            lora_r,
                            batch_size,
                            num_epochs,
                        });
                    }
                }
            }
        }
        result
    }

    /// Combinations limited to `max_candidates`.
    ///
    /// When the product is larger, every `len / max_candidates`-th
    /// combination is taken starting from the first, then the list is
    /// truncated to `max_candidates`. Same space and limit, same output.
    pub fn sample(&self, max_candidates: usize) -> Result<Vec<Hyperparameters>, SearchError> {
        self.validate()?;
        if max_candidates == 0 {
            return Err(SearchError::InvalidSpace {
                message: "max_candidates must be at least 1".to_string(),
            });
        }
        let all = self.combinations();
        if all.len() <= max_candidates {
            return Ok(all);
        }
        let stride = all.len() / max_candidates;
        Ok(all
            .into_iter()
            .step_by(stride)
            .take(max_candidates)
            .collect())
    }
}
