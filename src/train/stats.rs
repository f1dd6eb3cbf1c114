//! Epoch statistics
//!
//! [`EpochStats`] summarises one pass over a dataset; [`AggregatedStats`]
//! follows the run across epochs.

use std::collections::BTreeMap;

/// Summary of one training or evaluation epoch
#[derive(Debug, Clone, Default)]
pub struct EpochStats {
    /// Mean of the per-batch losses
    pub mean_loss: f64,

    /// Number of batches played
    pub n_batches: usize,

    /// Number of optimizer steps taken (zero in evaluation)
    pub optimizer_steps: usize,

    /// Mean of every aux metric over all logged examples
    pub aux: BTreeMap<String, f64>,
}

/// Running sums for an epoch in progress
#[derive(Debug, Default)]
pub(crate) struct EpochAccumulator {
    loss_sum: f64,
    n_batches: usize,
    optimizer_steps: usize,
}

impl EpochAccumulator {
    pub(crate) fn push_batch(&mut self, loss: f64) {
        self.loss_sum += loss;
        self.n_batches += 1;
    }

    pub(crate) fn push_step(&mut self) {
        self.optimizer_steps += 1;
    }

    pub(crate) fn n_batches(&self) -> usize {
        self.n_batches
    }

    pub(crate) fn finish(self, aux: BTreeMap<String, f64>) -> EpochStats {
        let mean_loss = if self.n_batches == 0 { 0.0 } else { self.loss_sum / self.n_batches as f64 };
        EpochStats { mean_loss, n_batches: self.n_batches, optimizer_steps: self.optimizer_steps, aux }
    }
}

/// Statistics across a whole run
#[derive(Debug, Clone)]
pub struct AggregatedStats {
    /// Most recent training epoch
    pub current: EpochStats,

    /// Exponential moving average of the training loss
    pub running_loss: f64,

    /// Best validation loss so far
    pub best_validation_loss: f64,

    /// Epochs completed
    pub total_epochs: usize,

    /// Optimizer steps across all epochs
    pub total_steps: usize,
}

impl Default for AggregatedStats {
    fn default() -> Self {
        Self {
            current: EpochStats::default(),
            running_loss: 0.0,
            best_validation_loss: f64::INFINITY,
            total_epochs: 0,
            total_steps: 0,
        }
    }
}

impl AggregatedStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold in a finished training epoch
    pub fn update(&mut self, stats: EpochStats) {
        // Exponential moving average with alpha=0.1, seeded by the first epoch
        let alpha = 0.1;
        self.running_loss = if self.total_epochs == 0 {
            stats.mean_loss
        } else {
            alpha * stats.mean_loss + (1.0 - alpha) * self.running_loss
        };
        self.total_epochs += 1;
        self.total_steps += stats.optimizer_steps;
        self.current = stats;
    }

    /// Record a validation epoch; returns whether it is the best so far
    pub fn update_validation(&mut self, stats: &EpochStats) -> bool {
        if stats.mean_loss < self.best_validation_loss {
            self.best_validation_loss = stats.mean_loss;
            true
        } else {
            false
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn epoch(loss: f64, steps: usize) -> EpochStats {
        EpochStats { mean_loss: loss, n_batches: steps, optimizer_steps: steps, aux: BTreeMap::new() }
    }

    #[test]
    fn test_accumulator() {
        let mut acc = EpochAccumulator::default();
        acc.push_batch(1.0);
        acc.push_batch(3.0);
        acc.push_step();

        let stats = acc.finish(BTreeMap::new());
        assert_eq!(stats.mean_loss, 2.0);
        assert_eq!(stats.n_batches, 2);
        assert_eq!(stats.optimizer_steps, 1);
    }

    #[test]
    fn test_empty_accumulator() {
        let stats = EpochAccumulator::default().finish(BTreeMap::new());
        assert_eq!(stats.mean_loss, 0.0);
        assert_eq!(stats.n_batches, 0);
    }

    #[test]
    fn test_aggregated_update() {
        let mut agg = AggregatedStats::new();
        agg.update(epoch(2.0, 4));
        assert_eq!(agg.running_loss, 2.0);

        agg.update(epoch(1.0, 4));
        assert!((agg.running_loss - 1.9).abs() < 1e-9);
        assert_eq!(agg.total_epochs, 2);
        assert_eq!(agg.total_steps, 8);
    }

    #[test]
    fn test_best_validation() {
        let mut agg = AggregatedStats::new();
        assert!(agg.update_validation(&epoch(1.0, 0)));
        assert!(!agg.update_validation(&epoch(1.5, 0)));
        assert!(agg.update_validation(&epoch(0.5, 0)));
        assert_eq!(agg.best_validation_loss, 0.5);
    }
}
