//! Baselines for the REINFORCE surrogate loss

use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

/// Variance-reduction baseline subtracted from the policy-gradient signal
pub trait Baseline: Send {
    /// Current estimate, broadcastable against `loss`
    fn predict(&self, loss: &Tensor) -> Tensor;

    /// Fold a new batch of losses into the estimate
    fn update(&mut self, loss: &Tensor);
}

/// Always predicts zero
#[derive(Debug, Clone, Copy, Default)]
pub struct NoBaseline;

impl Baseline for NoBaseline {
    fn predict(&self, loss: &Tensor) -> Tensor {
        Tensor::from(0.0_f32).to_device(loss.device())
    }

    fn update(&mut self, _loss: &Tensor) {}
}

/// Running mean of batch-mean losses
#[derive(Debug, Clone, Default)]
pub struct MeanBaseline {
    mean: f64,
    count: u64,
}

impl MeanBaseline {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of batches seen
    pub fn count(&self) -> u64 {
        self.count
    }

    /// Current running mean
    pub fn value(&self) -> f64 {
        self.mean
    }
}

impl Baseline for MeanBaseline {
    fn predict(&self, loss: &Tensor) -> Tensor {
        Tensor::from(self.mean as f32).to_device(loss.device())
    }

    fn update(&mut self, loss: &Tensor) {
        let batch_mean = loss.detach().to_kind(Kind::Float).mean(Kind::Float);
        let batch_mean = f64::try_from(&batch_mean).unwrap_or(f64::NAN);
        self.count += 1;
        self.mean += (batch_mean - self.mean) / self.count as f64;
    }
}

/// Which baseline a game uses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BaselineKind {
    None,
    #[default]
    Mean,
}

impl BaselineKind {
    pub fn create(self) -> Box<dyn Baseline> {
        match self {
            Self::None => Box::new(NoBaseline),
            Self::Mean => Box::new(MeanBaseline::new()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_no_baseline_is_zero() {
        let mut baseline = NoBaseline;
        let loss = Tensor::from_slice(&[1.0_f32, 3.0]);
        baseline.update(&loss);
        assert_eq!(f64::try_from(&baseline.predict(&loss)).unwrap(), 0.0);
    }

    #[test]
    fn test_mean_baseline_tracks_running_mean() {
        let mut baseline = MeanBaseline::new();
        baseline.update(&Tensor::from_slice(&[1.0_f32, 3.0]));
        baseline.update(&Tensor::from_slice(&[4.0_f32, 4.0]));
        baseline.update(&Tensor::from_slice(&[6.0_f32]));

        assert_eq!(baseline.count(), 3);
        assert!((baseline.value() - 4.0).abs() < 1e-9);
        let input = Tensor::zeros([2], (Kind::Float, tch::Device::Cpu));
        let predicted = f64::try_from(&baseline.predict(&input)).unwrap();
        assert!((predicted - 4.0).abs() < 1e-6);
    }

    #[test]
    fn test_kind_creates_matching_baseline() {
        let loss = Tensor::from_slice(&[2.0_f32]);
        let mut mean = BaselineKind::Mean.create();
        mean.update(&loss);
        assert!((f64::try_from(&mean.predict(&loss)).unwrap() - 2.0).abs() < 1e-6);

        let mut none = BaselineKind::None.create();
        none.update(&loss);
        assert_eq!(f64::try_from(&none.predict(&loss)).unwrap(), 0.0);
    }
}
