//! Noisy channels between sender and receiver

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use super::is_symbolic;
use crate::error::Error;

/// Corrupts a message in flight; output keeps shape and kind
pub trait NoiseChannel: Send {
    fn corrupt(&self, message: &Tensor) -> Tensor;
}

/// Additive Gaussian noise on continuous messages
///
/// Symbol messages pass through unchanged.
#[derive(Debug, Clone, Copy)]
pub struct GaussianChannel {
    pub std: f64,
}

impl NoiseChannel for GaussianChannel {
    fn corrupt(&self, message: &Tensor) -> Tensor {
        if is_symbolic(message) || self.std == 0.0 {
            return message.shallow_clone();
        }
        message + message.randn_like() * self.std
    }
}

/// Erases each message with probability `prob`
///
/// Symbols are replaced by a uniformly random symbol from `vocab`;
/// continuous messages are zeroed row-wise.
#[derive(Debug, Clone, Copy)]
pub struct ErasureChannel {
    pub prob: f64,
    pub vocab: i64,
}

impl NoiseChannel for ErasureChannel {
    fn corrupt(&self, message: &Tensor) -> Tensor {
        let device = message.device();
        if is_symbolic(message) {
            let erased = Tensor::rand(message.size(), (Kind::Float, device)).lt(self.prob);
            let random = Tensor::randint(self.vocab, message.size(), (message.kind(), device));
            return random.where_self(&erased, message);
        }

        let rows = message.size()[0];
        let mut keep = Tensor::rand([rows], (Kind::Float, device)).ge(self.prob).to_kind(message.kind());
        for _ in 1..message.dim() {
            keep = keep.unsqueeze(-1);
        }
        message * keep
    }
}

/// Serialisable description of a channel
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NoiseConfig {
    Gaussian { std: f64 },
    Erasure { prob: f64, vocab: i64 },
}

impl NoiseConfig {
    pub fn validate(&self) -> Result<()> {
        match *self {
            Self::Gaussian { std } if std < 0.0 || !std.is_finite() => {
                Err(Error::configuration("gaussian noise std must be non-negative").into())
            }
            Self::Erasure { prob, .. } if !(0.0..=1.0).contains(&prob) => {
                Err(Error::configuration("erasure probability must be in [0, 1]").into())
            }
            Self::Erasure { vocab, .. } if vocab <= 0 => {
                Err(Error::configuration("erasure vocab must be positive").into())
            }
            _ => Ok(()),
        }
    }

    pub fn create_channel(self) -> Box<dyn NoiseChannel> {
        match self {
            Self::Gaussian { std } => Box::new(GaussianChannel { std }),
            Self::Erasure { prob, vocab } => Box::new(ErasureChannel { prob, vocab }),
        }
    }
}
