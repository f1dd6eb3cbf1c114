//! Populations of senders and receivers
//!
//! [`AgentSampler`] picks which (sender, receiver, loss) triple plays each
//! call; [`PopulationGame`] runs that triple through a [`Game`](crate::game::Game)
//! and optionally adds an auxiliary consistency loss against another sender.

pub mod aux_loss;
pub mod game;
pub mod sampler;
pub mod stats;

use anyhow::Result;
use serde::{Deserialize, Serialize};

use crate::error::Error;

pub use aux_loss::{AuxLoss, AuxLossKind, AveragedTracker, BestTracker};
pub use game::{DevicePolicy, PopulationGame, SweepOutcome, SweepRecord};
pub use sampler::{pairing_universe, AgentSampler, Sampled, TripleIndex};
pub use stats::{AgentRecord, PopulationStats, StatsSummary};

/// Population game configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PopulationConfig {
    /// Seed of the sampler's generator
    pub seed: u64,

    /// Auxiliary consistency loss variant, if any
    pub aux_loss: Option<AuxLossKind>,

    /// Weight of the auxiliary term; zero disables it
    pub aux_loss_weight: f64,
}

impl Default for PopulationConfig {
    fn default() -> Self {
        Self { seed: 1234, aux_loss: None, aux_loss_weight: 0.0 }
    }
}

impl PopulationConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(mut self, seed: u64) -> Self {
        self.seed = seed;
        self
    }

    /// Enable an auxiliary loss with the given weight
    pub fn aux_loss(mut self, kind: AuxLossKind, weight: f64) -> Self {
        self.aux_loss = Some(kind);
        self.aux_loss_weight = weight;
        self
    }

    /// Validate against the initial number of senders
    pub fn validate(&self, n_senders: usize) -> Result<()> {
        if self.aux_loss_weight < 0.0 || !self.aux_loss_weight.is_finite() {
            return Err(Error::configuration("aux_loss_weight must be non-negative").into());
        }
        if let Some(AuxLossKind::Chosen { sender }) = self.aux_loss {
            if sender >= n_senders {
                return Err(Error::configuration(format!(
                    "chosen aux sender {sender} is out of range for {n_senders} senders"
                ))
                .into());
            }
        }
        Ok(())
    }
}
