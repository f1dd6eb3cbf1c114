//! Receiver agent
//!
//! Embeds every candidate through its own frozen backbone and a trainable
//! projection, then scores each message against each candidate with a
//! temperature-scaled cosine similarity.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};

use super::{forward_checked, Agent, AgentSource, Backbone, BackboneRegistry, Receiver};
use crate::{
    error::Error,
    game::{is_symbolic, AuxInput},
};

/// Key under which the receiver logs the message it saw (evaluation only)
pub const MESSAGE_EMBEDDING_KEY: &str = "receiver_message_embedding";

/// Configuration of a receiver's projection head
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ReceiverConfig {
    /// Hidden width of the projection
    pub hidden_dim: i64,

    /// Width of the candidate embedding (must match the message width)
    pub output_dim: i64,

    /// Divisor applied to cosine similarities
    pub temperature: f64,
}

impl Default for ReceiverConfig {
    fn default() -> Self {
        Self { hidden_dim: 2048, output_dim: 2048, temperature: 1.0 }
    }
}

impl ReceiverConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set hidden width
    pub fn hidden_dim(mut self, dim: i64) -> Self {
        self.hidden_dim = dim;
        self
    }

    /// Set embedding width
    pub fn output_dim(mut self, dim: i64) -> Self {
        self.output_dim = dim;
        self
    }

    /// Set similarity temperature
    pub fn temperature(mut self, temperature: f64) -> Self {
        self.temperature = temperature;
        self
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.hidden_dim <= 0 || self.output_dim <= 0 {
            return Err(Error::configuration("receiver widths must be positive").into());
        }
        if self.temperature <= 0.0 || !self.temperature.is_finite() {
            return Err(Error::configuration("receiver temperature must be positive").into());
        }
        Ok(())
    }
}

/// Candidate-discriminating receiver on top of a frozen backbone
pub struct VisionReceiver {
    backbone: Backbone,
    vs: nn::VarStore,
    head: nn::SequentialT,
    config: ReceiverConfig,
    training: bool,
}

impl VisionReceiver {
    /// Build a receiver projecting backbone features to `output_dim`
    pub fn new(
        source: AgentSource,
        registry: &BackboneRegistry,
        config: ReceiverConfig,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let backbone = source.resolve(registry, device)?;
        let vs = nn::VarStore::new(device);
        let p = vs.root() / "receiver";

        let no_bias = nn::LinearConfig { bias: false, ..Default::default() };
        let head = nn::seq_t()
            .add(nn::linear(&p / "fc1", backbone.output_dim(), config.hidden_dim, Default::default()))
            .add(nn::batch_norm1d(&p / "bn", config.hidden_dim, Default::default()))
            .add_fn(|xs| xs.relu())
            .add(nn::linear(&p / "fc2", config.hidden_dim, config.output_dim, no_bias));

        Ok(Self { backbone, vs, head, config, training: true })
    }

    /// Head configuration
    pub fn config(&self) -> &ReceiverConfig {
        &self.config
    }

    /// Embed candidates into the message space
    pub fn embed(&self, candidates: &Tensor) -> Result<Tensor> {
        let features = self.backbone.features(candidates)?;
        forward_checked(&self.head, &features, self.training)
    }
}

impl Agent for VisionReceiver {
    fn name(&self) -> &str {
        self.backbone.name()
    }

    fn set_training(&mut self, mode: bool) {
        self.training = mode;
    }

    fn is_training(&self) -> bool {
        self.training
    }

    fn var_store(&self) -> &nn::VarStore {
        &self.vs
    }

    fn to_device(&mut self, device: Device) {
        if self.vs.device() != device {
            self.vs.set_device(device);
        }
        self.backbone.to_device(device);
    }
}

impl Receiver for VisionReceiver {
    fn receive(&self, message: &Tensor, candidates: &Tensor, aux: &mut AuxInput) -> Result<Tensor> {
        let message = if is_symbolic(message) {
            message.f_one_hot(self.config.output_dim).map_err(Error::from)?.to_kind(Kind::Float)
        } else {
            message.shallow_clone()
        };
        let embedded = self.embed(candidates)?;

        let scores = Tensor::f_cosine_similarity(&message.unsqueeze(1), &embedded.unsqueeze(0), 2, 1e-8)
            .map_err(Error::from)?
            / self.config.temperature;

        if !self.training {
            aux.insert(MESSAGE_EMBEDDING_KEY, message.detach());
        }
        Ok(scores.to_kind(Kind::Float))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::backbone::tests::tiny_registry;

    fn receiver(output_dim: i64) -> VisionReceiver {
        VisionReceiver::new(
            AgentSource::named("tiny"),
            &tiny_registry(),
            ReceiverConfig::new().hidden_dim(12).output_dim(output_dim).temperature(0.1),
            Device::Cpu,
        )
        .unwrap()
    }

    #[test]
    fn test_scores_shape() {
        let receiver = receiver(16);
        let message = Tensor::randn([3, 16], (Kind::Float, Device::Cpu));
        let candidates = Tensor::randn([5, 4], (Kind::Float, Device::Cpu));

        let scores = receiver.receive(&message, &candidates, &mut AuxInput::default()).unwrap();
        assert_eq!(scores.size(), vec![3, 5]);
    }

    #[test]
    fn test_scores_bounded_by_temperature() {
        let receiver = receiver(16);
        let message = Tensor::randn([4, 16], (Kind::Float, Device::Cpu));
        let candidates = Tensor::randn([4, 4], (Kind::Float, Device::Cpu));

        let scores = receiver.receive(&message, &candidates, &mut AuxInput::default()).unwrap();
        let max_abs = f64::try_from(&scores.abs().max()).unwrap();
        assert!(max_abs <= 10.0 + 1e-4);
    }

    #[test]
    fn test_symbol_messages_are_one_hot_encoded() {
        let receiver = receiver(6);
        let message = Tensor::from_slice(&[0_i64, 5, 2]);
        let candidates = Tensor::randn([3, 4], (Kind::Float, Device::Cpu));

        let scores = receiver.receive(&message, &candidates, &mut AuxInput::default()).unwrap();
        assert_eq!(scores.size(), vec![3, 3]);
    }

    #[test]
    fn test_eval_records_message_embedding() {
        let mut receiver = receiver(16);
        let message = Tensor::randn([2, 16], (Kind::Float, Device::Cpu));
        let candidates = Tensor::randn([2, 4], (Kind::Float, Device::Cpu));

        let mut aux = AuxInput::default();
        receiver.receive(&message, &candidates, &mut aux).unwrap();
        assert!(aux.get(MESSAGE_EMBEDDING_KEY).is_none());

        receiver.set_training(false);
        receiver.receive(&message, &candidates, &mut aux).unwrap();
        assert_eq!(aux.get(MESSAGE_EMBEDDING_KEY).unwrap().size(), vec![2, 16]);
    }

    #[test]
    fn test_invalid_temperature() {
        let err = VisionReceiver::new(
            AgentSource::named("tiny"),
            &tiny_registry(),
            ReceiverConfig::new().temperature(0.0),
            Device::Cpu,
        )
        .err()
        .unwrap();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Configuration { .. })));
    }
}
