//! One round of the signaling game
//!
//! [`Game::forward`] plays a single (sender, receiver, loss) triple on a
//! batch:
//!
//! ```text
//! sender_input -> Sender -> message -> [noise] -> Receiver -> logits -> Loss
//!                                                                     |
//!                                           REINFORCE surrogate (if sampled)
//! ```
//!
//! Training and evaluation only differ in which [`LoggingStrategy`] filters
//! the interaction and whether the baseline learns.

pub mod baseline;
pub mod interaction;
pub mod loss;
pub mod noise;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tch::{Kind, Tensor};

use crate::{
    agents::{PolicyTerms, Receiver, Sender, SenderOutput},
    data::Batch,
    error::Error,
    population::TripleIndex,
};

pub use baseline::{Baseline, BaselineKind, MeanBaseline, NoBaseline};
pub use interaction::{AuxInfo, AuxInput, Interaction, InteractionFields, LoggingStrategy};
pub use loss::{loss_fn, AccuracyReward, DiscriminationLoss, Loss, LossInputs};
pub use noise::{ErasureChannel, GaussianChannel, NoiseChannel, NoiseConfig};

/// Whether `t` holds symbol indices rather than a continuous message
pub fn is_symbolic(t: &Tensor) -> bool {
    matches!(t.kind(), Kind::Int64 | Kind::Int | Kind::Int16 | Kind::Int8 | Kind::Uint8)
}

/// Game configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GameConfig {
    /// Weight of the sender entropy bonus (REINFORCE only)
    pub entropy_coeff: f64,

    /// Baseline for the REINFORCE surrogate
    pub baseline: BaselineKind,

    /// Optional channel noise
    pub noise: Option<NoiseConfig>,

    pub train_logging: LoggingStrategy,
    pub test_logging: LoggingStrategy,
}

impl Default for GameConfig {
    fn default() -> Self {
        Self {
            entropy_coeff: 0.01,
            baseline: BaselineKind::Mean,
            noise: None,
            train_logging: LoggingStrategy::default(),
            test_logging: LoggingStrategy::default(),
        }
    }
}

impl GameConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn entropy_coeff(mut self, coeff: f64) -> Self {
        self.entropy_coeff = coeff;
        self
    }

    pub fn baseline(mut self, baseline: BaselineKind) -> Self {
        self.baseline = baseline;
        self
    }

    pub fn noise(mut self, noise: NoiseConfig) -> Self {
        self.noise = Some(noise);
        self
    }

    pub fn train_logging(mut self, strategy: LoggingStrategy) -> Self {
        self.train_logging = strategy;
        self
    }

    pub fn test_logging(mut self, strategy: LoggingStrategy) -> Self {
        self.test_logging = strategy;
        self
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.entropy_coeff < 0.0 || !self.entropy_coeff.is_finite() {
            return Err(Error::configuration("entropy_coeff must be non-negative").into());
        }
        if let Some(noise) = &self.noise {
            noise.validate()?;
        }
        Ok(())
    }
}

/// Result of one game call
#[derive(Debug)]
pub struct GameOutput {
    /// Scalar loss to optimise
    pub loss: Tensor,

    /// Filtered record of the call
    pub interaction: Interaction,

    /// Message as the receiver saw it, still attached to the graph
    pub message: Tensor,

    /// Triple that played, when sampled from a population
    pub indices: Option<TripleIndex>,

    /// Per-example loss before reduction, detached
    pub per_example_loss: Tensor,
}

/// Plays sender, channel, receiver and loss in sequence
pub struct Game {
    config: GameConfig,
    baseline: Box<dyn Baseline>,
    noise: Option<Box<dyn NoiseChannel>>,
    training: bool,
}

impl Game {
    pub fn new(config: GameConfig) -> Result<Self> {
        config.validate()?;
        let baseline = config.baseline.create();
        let noise = config.noise.map(NoiseConfig::create_channel);
        Ok(Self { config, baseline, noise, training: true })
    }

    /// Replace the baseline with a custom one
    pub fn with_baseline(mut self, baseline: Box<dyn Baseline>) -> Self {
        self.baseline = baseline;
        self
    }

    /// Replace the channel with a custom one
    pub fn with_noise(mut self, noise: Box<dyn NoiseChannel>) -> Self {
        self.noise = Some(noise);
        self
    }

    pub fn config(&self) -> &GameConfig {
        &self.config
    }

    pub fn set_training(&mut self, mode: bool) {
        self.training = mode;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    fn logging_strategy(&self) -> &LoggingStrategy {
        if self.training {
            &self.config.train_logging
        } else {
            &self.config.test_logging
        }
    }

    /// Play one round
    pub fn forward(
        &mut self,
        sender: &dyn Sender,
        receiver: &dyn Receiver,
        loss: &dyn Loss,
        batch: &Batch,
        mut aux_input: AuxInput,
    ) -> Result<GameOutput> {
        let SenderOutput { message, policy } = sender.send(&batch.sender_input, &mut aux_input)?;
        let message = if policy.is_some() { message.to_kind(Kind::Int64) } else { message };
        let message = match &self.noise {
            Some(channel) => channel.corrupt(&message),
            None => message,
        };

        let receiver_output = receiver.receive(&message, &batch.receiver_input, &mut aux_input)?;

        let (per_example, mut aux_info) = loss.compute(&LossInputs {
            sender_input: &batch.sender_input,
            message: &message,
            receiver_input: &batch.receiver_input,
            receiver_output: &receiver_output,
            labels: &batch.labels,
            aux_input: &aux_input,
        })?;

        let mut optimized = per_example.mean(Kind::Float);
        if let Some(PolicyTerms { log_prob, entropy }) = policy {
            let baseline = self.baseline.predict(&per_example);
            let policy_loss = ((per_example.detach() - baseline) * &log_prob).mean(Kind::Float);
            let entropy_term = entropy.mean(Kind::Float) * self.config.entropy_coeff;
            optimized = optimized + policy_loss - entropy_term;

            if self.training {
                self.baseline.update(&per_example);
            }
            aux_info.insert("sender_entropy".into(), entropy.detach());
        }

        let batch_size = message.size()[0];
        let message_length = Tensor::ones([batch_size], (Kind::Float, message.device()));

        let interaction = self.logging_strategy().filtered_interaction(InteractionFields {
            sender_input: &batch.sender_input,
            receiver_input: &batch.receiver_input,
            labels: &batch.labels,
            aux_input: &aux_input,
            receiver_output: &receiver_output,
            message: &message,
            message_length: &message_length,
            aux: aux_info,
        });

        Ok(GameOutput {
            loss: optimized,
            interaction,
            message,
            indices: aux_input.indices,
            per_example_loss: per_example.detach(),
        })
    }
}
