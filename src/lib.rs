//! # Chorus
//!
//! Population signaling games for emergent communication, on top of frozen
//! vision backbones (via tch-rs).
//!
//! A sender looks at an image and emits a message; a receiver uses that
//! message to pick the matching image among candidates. Chorus trains whole
//! populations of such agents: every call samples one (sender, receiver,
//! loss) triple, plays one game, and can add an auxiliary loss that pulls the
//! active sender's messages towards those of another sender.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use chorus::prelude::*;
//!
//! # fn main() -> anyhow::Result<()> {
//! let config = ExperimentConfig::load_json("experiment.json")?;
//! let registry = BackboneRegistry::with_defaults();
//! let mut trainer = config.build_trainer(&registry, tch::Device::cuda_if_available())?;
//!
//! let batches: Vec<Batch> = Vec::new(); // fill from your dataset
//! let stats = trainer.train(config.n_epochs, &batches, None)?;
//! println!("running loss {:.4}", stats.running_loss);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

/// Senders, receivers and the frozen vision backbones they sit on
pub mod agents;

/// Batches and proximity-based batch sampling
pub mod data;

/// Error types
pub mod error;

/// Serialisable description of a full run
pub mod experiment;

/// A single sender/receiver game, losses and interaction logs
pub mod game;

/// Agent populations, triple sampling and auxiliary losses
pub mod population;

/// Optimisation loop over a population game
pub mod train;

pub use error::Error;

/// Prelude module for convenient imports
///
/// This module re-exports commonly used types and traits for convenience.
pub mod prelude {
    pub use crate::agents::{
        Agent, AgentSource, BackboneRegistry, Receiver, ReceiverConfig, ReinforceSender, Sender,
        SenderConfig, VisionReceiver, VisionSender,
    };
    pub use crate::data::{Batch, ProximitySampler};
    pub use crate::error::Error;
    pub use crate::experiment::{ExperimentConfig, LossKind, SenderKind};
    pub use crate::game::{
        AuxInput, DiscriminationLoss, Game, GameConfig, Interaction, LoggingStrategy, Loss,
    };
    pub use crate::population::{
        AgentSampler, AuxLossKind, PopulationConfig, PopulationGame, TripleIndex,
    };
    pub use crate::train::{Trainer, TrainerConfig};
}

/// Current version of chorus-ec
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
