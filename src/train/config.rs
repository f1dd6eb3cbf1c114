//! Trainer configuration

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Trainer hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TrainerConfig {
    /// Adam learning rate for every agent head
    pub learning_rate: f64,

    /// Number of batches whose gradients are accumulated per optimizer step
    pub update_freq: usize,

    /// Maximum gradient norm per agent, no clipping when unset
    pub max_grad_norm: Option<f64>,

    /// Run validation every this many epochs
    pub validation_freq: usize,

    /// Adam weight decay
    pub weight_decay: f64,

    /// Anneal the learning rate along a half cosine over the run
    pub cosine_annealing: bool,
}

impl Default for TrainerConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-4,
            update_freq: 1,
            max_grad_norm: None,
            validation_freq: 1,
            weight_decay: 0.0,
            cosine_annealing: false,
        }
    }
}

impl TrainerConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.learning_rate <= 0.0 || !self.learning_rate.is_finite() {
            return Err(Error::configuration("learning_rate must be positive").into());
        }
        if self.update_freq == 0 {
            return Err(Error::configuration("update_freq must be positive").into());
        }
        if matches!(self.max_grad_norm, Some(norm) if norm <= 0.0) {
            return Err(Error::configuration("max_grad_norm must be positive").into());
        }
        if self.validation_freq == 0 {
            return Err(Error::configuration("validation_freq must be positive").into());
        }
        if self.weight_decay < 0.0 {
            return Err(Error::configuration("weight_decay must be non-negative").into());
        }
        Ok(())
    }

    /// Set learning rate
    pub fn learning_rate(mut self, lr: f64) -> Self {
        self.learning_rate = lr;
        self
    }

    /// Set gradient accumulation steps
    pub fn update_freq(mut self, freq: usize) -> Self {
        self.update_freq = freq;
        self
    }

    /// Clip gradients to `norm`
    pub fn max_grad_norm(mut self, norm: f64) -> Self {
        self.max_grad_norm = Some(norm);
        self
    }

    /// Set validation period in epochs
    pub fn validation_freq(mut self, freq: usize) -> Self {
        self.validation_freq = freq;
        self
    }

    /// Set weight decay
    pub fn weight_decay(mut self, wd: f64) -> Self {
        self.weight_decay = wd;
        self
    }

    /// Enable cosine learning-rate annealing
    pub fn cosine_annealing(mut self, enabled: bool) -> Self {
        self.cosine_annealing = enabled;
        self
    }

    /// Learning rate for `epoch` (0-based) of a run of `n_epochs`
    pub fn learning_rate_at(&self, epoch: usize, n_epochs: usize) -> f64 {
        if !self.cosine_annealing || n_epochs == 0 {
            return self.learning_rate;
        }
        let progress = epoch.min(n_epochs) as f64 / n_epochs as f64;
        0.5 * self.learning_rate * (1.0 + (std::f64::consts::PI * progress).cos())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_valid() {
        assert!(TrainerConfig::default().validate().is_ok());
    }

    #[test]
    fn test_invalid_learning_rate() {
        assert!(TrainerConfig::new().learning_rate(-1.0).validate().is_err());
    }

    #[test]
    fn test_invalid_update_freq() {
        assert!(TrainerConfig::new().update_freq(0).validate().is_err());
    }

    #[test]
    fn test_invalid_grad_norm() {
        assert!(TrainerConfig::new().max_grad_norm(0.0).validate().is_err());
    }

    #[test]
    fn test_cosine_schedule() {
        let config = TrainerConfig::new().learning_rate(1.0).cosine_annealing(true);
        assert!((config.learning_rate_at(0, 10) - 1.0).abs() < 1e-12);
        assert!((config.learning_rate_at(5, 10) - 0.5).abs() < 1e-12);
        assert!(config.learning_rate_at(10, 10).abs() < 1e-12);

        let constant = TrainerConfig::new().learning_rate(0.3);
        assert_eq!(constant.learning_rate_at(7, 10), 0.3);
    }

    #[test]
    fn test_builder_pattern() {
        let config = TrainerConfig::new().learning_rate(1e-3).update_freq(4).max_grad_norm(1.0).validation_freq(2);

        assert_eq!(config.learning_rate, 1e-3);
        assert_eq!(config.update_freq, 4);
        assert_eq!(config.max_grad_norm, Some(1.0));
        assert_eq!(config.validation_freq, 2);
    }
}
