//! Sender and receiver agents
//!
//! Every agent wraps a frozen [`Backbone`] with a trainable communication
//! head. The head is the only trainable submodule: it owns the agent's
//! `VarStore`, and switching the agent between training and evaluation mode
//! only changes how the head runs.
//!
//! # Architecture
//!
//! ```text
//!   sender input                       candidates
//!        |                                  |
//!   [Backbone] (frozen, eval)          [Backbone] (frozen, eval)
//!        |                                  |
//!   [Linear -> BatchNorm]              [Linear -> BatchNorm -> ReLU -> Linear]
//!        |                                  |
//!     message  -------- cosine / temperature ------> logits
//! ```

pub mod backbone;
pub mod gumbel;
pub mod receiver;
pub mod sender;

use std::{
    panic::{self, AssertUnwindSafe},
    path::PathBuf,
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tch::{nn, nn::ModuleT, Device, TchError, Tensor};

use crate::{error::Error, game::AuxInput};

pub use backbone::{Backbone, BackboneKind, BackboneRegistry};
pub use gumbel::gumbel_softmax_sample;
pub use receiver::{ReceiverConfig, VisionReceiver};
pub use sender::{ReinforceSender, SenderConfig, VisionSender};

/// State shared by senders and receivers
pub trait Agent: Send {
    /// Identifier of the backbone this agent was built on
    fn name(&self) -> &str;

    /// Switch the communication head between training and evaluation
    ///
    /// The backbone is never affected.
    fn set_training(&mut self, mode: bool);

    /// Whether the head is in training mode
    fn is_training(&self) -> bool;

    /// Variable store of the trainable head (the backbone is not included)
    fn var_store(&self) -> &nn::VarStore;

    /// Move the head and the backbone to `device`
    fn to_device(&mut self, device: Device);

    /// Device currently holding the head
    fn device(&self) -> Device {
        self.var_store().device()
    }
}

/// Policy-gradient side channel emitted by stochastic discrete senders
#[derive(Debug)]
pub struct PolicyTerms {
    /// Log-probability of the emitted symbol, per example
    pub log_prob: Tensor,
    /// Entropy of the symbol distribution, per example
    pub entropy: Tensor,
}

/// Output of a sender
#[derive(Debug)]
pub struct SenderOutput {
    /// The message (continuous vector or symbol indices)
    pub message: Tensor,
    /// Present when the message was sampled and needs a REINFORCE update
    pub policy: Option<PolicyTerms>,
}

impl SenderOutput {
    /// A differentiable message with no policy-gradient terms
    pub fn continuous(message: Tensor) -> Self {
        Self { message, policy: None }
    }
}

/// Produces a message from a batch of raw inputs
pub trait Sender: Agent {
    /// Encode `input` into a message
    fn send(&self, input: &Tensor, aux: &mut AuxInput) -> Result<SenderOutput>;
}

/// Scores a message against a set of candidates
pub trait Receiver: Agent {
    /// Return one logit per (message, candidate) pair, `[batch, n_candidates]`
    fn receive(&self, message: &Tensor, candidates: &Tensor, aux: &mut AuxInput) -> Result<Tensor>;
}

impl<T: Agent + ?Sized> Agent for Box<T> {
    fn name(&self) -> &str {
        (**self).name()
    }

    fn set_training(&mut self, mode: bool) {
        (**self).set_training(mode)
    }

    fn is_training(&self) -> bool {
        (**self).is_training()
    }

    fn var_store(&self) -> &nn::VarStore {
        (**self).var_store()
    }

    fn to_device(&mut self, device: Device) {
        (**self).to_device(device)
    }
}

impl<T: Sender + ?Sized> Sender for Box<T> {
    fn send(&self, input: &Tensor, aux: &mut AuxInput) -> Result<SenderOutput> {
        (**self).send(input, aux)
    }
}

impl<T: Receiver + ?Sized> Receiver for Box<T> {
    fn receive(&self, message: &Tensor, candidates: &Tensor, aux: &mut AuxInput) -> Result<Tensor> {
        (**self).receive(message, candidates, aux)
    }
}

/// Run `module` on `xs`, reporting a libtorch failure as [`Error::Computation`]
///
/// `ModuleT::forward_t` panics on shape or device mismatches; the panic is
/// caught here so it surfaces as an ordinary error.
pub(crate) fn forward_checked(module: &dyn ModuleT, xs: &Tensor, train: bool) -> Result<Tensor> {
    panic::catch_unwind(AssertUnwindSafe(|| module.forward_t(xs, train))).map_err(|payload| {
        let message = payload
            .downcast_ref::<String>()
            .cloned()
            .or_else(|| payload.downcast_ref::<&str>().map(|s| s.to_string()))
            .unwrap_or_else(|| "module forward failed".to_string());
        Error::Computation(TchError::Torch(message)).into()
    })
}

/// Where an agent gets its feature extractor from
pub enum AgentSource {
    /// An already-built backbone
    Prebuilt(Backbone),
    /// A registry identifier, optionally with pretrained weights
    Named { name: String, weights: Option<PathBuf> },
}

impl AgentSource {
    /// Identifier without pretrained weights
    pub fn named(name: impl Into<String>) -> Self {
        Self::Named { name: name.into(), weights: None }
    }

    /// Identifier with pretrained weights loaded from `weights`
    pub fn pretrained(name: impl Into<String>, weights: impl Into<PathBuf>) -> Self {
        Self::Named { name: name.into(), weights: Some(weights.into()) }
    }

    /// Produce the backbone, building it through `registry` when needed
    pub fn resolve(self, registry: &BackboneRegistry, device: Device) -> Result<Backbone> {
        match self {
            Self::Prebuilt(mut backbone) => {
                backbone.to_device(device);
                Ok(backbone)
            }
            Self::Named { name, weights } => {
                if name.trim().is_empty() {
                    return Err(Error::configuration(
                        "an agent needs either a prebuilt backbone or a backbone identifier",
                    )
                    .into());
                }
                registry.build(&name, weights.as_deref(), device)
            }
        }
    }
}

/// Output non-linearity of a continuous sender
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NonLinearity {
    Softmax,
    Sigmoid,
}

impl NonLinearity {
    fn apply(self, xs: &Tensor) -> Tensor {
        match self {
            Self::Softmax => xs.softmax(-1, tch::Kind::Float),
            Self::Sigmoid => xs.sigmoid(),
        }
    }
}
