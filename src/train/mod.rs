//! Training loop
//!
//! [`Trainer`] runs a population game over batches and steps one optimizer
//! per agent head.

pub mod config;
pub mod stats;
pub mod trainer;

pub use config::TrainerConfig;
pub use stats::{AggregatedStats, EpochStats};
pub use trainer::{AgentKey, EpochOutcome, Trainer};
