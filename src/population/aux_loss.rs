//! Auxiliary cross-sender consistency loss
//!
//! Pulls the active sender's message towards the message another population
//! member produces for the same input. The target is chosen per call by an
//! [`AuxLossKind`]; best-loss variants rely on trackers fed with every
//! training call's base loss.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tch::{Kind, Reduction, Tensor};

use crate::{error::Error, game::is_symbolic};

/// How the target sender is chosen, and how messages are compared
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuxLossKind {
    /// Uniformly random sender, cosine distance
    Random,
    /// Fixed sender, cosine distance
    Chosen { sender: usize },
    /// Sender with the lowest loss seen so far, cosine distance
    Best,
    /// Sender with the lowest running-mean loss, cosine distance
    BestAveraged,
    /// Uniformly random sender, KL divergence
    RandomKl,
}

impl AuxLossKind {
    pub fn uses_kl(&self) -> bool {
        matches!(self, Self::RandomKl)
    }
}

/// Lowest single-call loss seen so far
///
/// Only a strictly lower loss replaces the holder, so the earliest holder
/// wins ties.
#[derive(Debug, Clone, Default)]
pub struct BestTracker {
    best: Option<(usize, f64)>,
}

impl BestTracker {
    pub fn update(&mut self, sender: usize, loss: f64) {
        if loss.is_nan() {
            return;
        }
        if self.best.map_or(true, |(_, best)| loss < best) {
            self.best = Some((sender, loss));
        }
    }

    pub fn best_index(&self) -> Option<usize> {
        self.best.map(|(idx, _)| idx)
    }

    pub fn best_loss(&self) -> Option<f64> {
        self.best.map(|(_, loss)| loss)
    }
}

/// Running mean loss per sender index
#[derive(Debug, Clone, Default)]
pub struct AveragedTracker {
    sums: Vec<f64>,
    counts: Vec<u64>,
}

impl AveragedTracker {
    pub fn update(&mut self, sender: usize, loss: f64) {
        if sender >= self.sums.len() {
            self.sums.resize(sender + 1, 0.0);
            self.counts.resize(sender + 1, 0);
        }
        self.sums[sender] += loss;
        self.counts[sender] += 1;
    }

    pub fn average(&self, sender: usize) -> Option<f64> {
        match self.counts.get(sender) {
            Some(&count) if count > 0 => Some(self.sums[sender] / count as f64),
            _ => None,
        }
    }

    /// Index with the lowest average; the lowest index wins ties
    pub fn best_index(&self) -> Option<usize> {
        let mut best: Option<(usize, f64)> = None;
        for idx in 0..self.sums.len() {
            if let Some(avg) = self.average(idx) {
                if best.map_or(true, |(_, b)| avg < b) {
                    best = Some((idx, avg));
                }
            }
        }
        best.map(|(idx, _)| idx)
    }
}

/// Auxiliary loss state: variant, weight and trackers
#[derive(Debug, Clone)]
pub struct AuxLoss {
    kind: AuxLossKind,
    weight: f64,
    best: BestTracker,
    averaged: AveragedTracker,
}

impl AuxLoss {
    pub fn new(kind: AuxLossKind, weight: f64) -> Result<Self> {
        if weight < 0.0 || !weight.is_finite() {
            return Err(Error::configuration("aux_loss_weight must be non-negative").into());
        }
        Ok(Self { kind, weight, best: BestTracker::default(), averaged: AveragedTracker::default() })
    }

    pub fn kind(&self) -> AuxLossKind {
        self.kind
    }

    pub fn weight(&self) -> f64 {
        self.weight
    }

    /// Whether the term contributes at all
    pub fn is_active(&self) -> bool {
        self.weight > 0.0
    }

    pub fn best_tracker(&self) -> &BestTracker {
        &self.best
    }

    pub fn averaged_tracker(&self) -> &AveragedTracker {
        &self.averaged
    }

    /// Target sender for this call, `None` while a tracker is still empty
    ///
    /// `random` is only consulted by the random variants.
    pub fn target(&self, random: impl FnOnce() -> Option<usize>) -> Option<usize> {
        match self.kind {
            AuxLossKind::Random | AuxLossKind::RandomKl => random(),
            AuxLossKind::Chosen { sender } => Some(sender),
            AuxLossKind::Best => self.best.best_index(),
            AuxLossKind::BestAveraged => self.averaged.best_index(),
        }
    }

    /// Feed the mean base loss of a training call to the trackers
    pub fn record(&mut self, sender: usize, loss: f64) {
        match self.kind {
            AuxLossKind::Best => self.best.update(sender, loss),
            AuxLossKind::BestAveraged => self.averaged.update(sender, loss),
            _ => {}
        }
    }

    /// Per-example distance between the active message and the target message
    pub fn term(&self, active: &Tensor, target: &Tensor) -> Result<Tensor> {
        if is_symbolic(active) || is_symbolic(target) {
            return Err(Error::configuration(
                "auxiliary consistency loss needs continuous messages",
            )
            .into());
        }
        let active = active.to_kind(Kind::Float).flatten(1, -1);
        let target = target.to_kind(Kind::Float).flatten(1, -1);

        if self.kind.uses_kl() {
            let log_active = active.log_softmax(-1, Kind::Float);
            let target = target.softmax(-1, Kind::Float);
            Ok(log_active.kl_div(&target, Reduction::None, false).sum_dim_intlist(-1, false, Kind::Float))
        } else {
            let cosine = Tensor::cosine_similarity(&active, &target, 1, 1e-8);
            Ok(-cosine + 1.0)
        }
    }
}
