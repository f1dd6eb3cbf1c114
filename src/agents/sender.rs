//! Sender agents
//!
//! [`VisionSender`] emits a continuous message (optionally relaxed through a
//! Gumbel-softmax); [`ReinforceSender`] emits a sampled symbol index along
//! with the log-probability and entropy needed for a REINFORCE update.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tch::{nn, Device, Kind, Tensor};

use super::{
    forward_checked, gumbel_softmax_sample, Agent, AgentSource, Backbone, BackboneRegistry, NonLinearity,
};
use super::{PolicyTerms, Sender, SenderOutput};
use crate::{error::Error, game::AuxInput};

/// Configuration of a sender's communication head
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SenderConfig {
    /// Width of the message (number of symbols for discrete senders)
    pub vocab_size: i64,

    /// Optional non-linearity applied to the head output
    pub non_linearity: Option<NonLinearity>,

    /// Relax the output through a Gumbel-softmax
    pub force_gumbel: bool,

    /// Temperature of the forced Gumbel-softmax
    pub gumbel_temperature: f64,
}

impl Default for SenderConfig {
    fn default() -> Self {
        Self { vocab_size: 2048, non_linearity: None, force_gumbel: false, gumbel_temperature: 5.0 }
    }
}

impl SenderConfig {
    /// Create a new default configuration
    pub fn new() -> Self {
        Self::default()
    }

    /// Set message width
    pub fn vocab_size(mut self, size: i64) -> Self {
        self.vocab_size = size;
        self
    }

    /// Set output non-linearity
    pub fn non_linearity(mut self, non_linearity: NonLinearity) -> Self {
        self.non_linearity = Some(non_linearity);
        self
    }

    /// Force a Gumbel-softmax relaxation at the given temperature
    pub fn force_gumbel(mut self, temperature: f64) -> Self {
        self.force_gumbel = true;
        self.gumbel_temperature = temperature;
        self
    }

    /// Validate configuration parameters
    pub fn validate(&self) -> Result<()> {
        if self.vocab_size <= 0 {
            return Err(Error::configuration("vocab_size must be positive").into());
        }
        if self.force_gumbel && self.gumbel_temperature <= 0.0 {
            return Err(Error::configuration("gumbel_temperature must be positive").into());
        }
        Ok(())
    }
}

fn communication_head(p: &nn::Path, input_dim: i64, vocab_size: i64) -> nn::SequentialT {
    nn::seq_t()
        .add(nn::linear(p / "fc", input_dim, vocab_size, Default::default()))
        .add(nn::batch_norm1d(p / "bn", vocab_size, Default::default()))
}

/// Continuous sender on top of a frozen backbone
pub struct VisionSender {
    backbone: Backbone,
    vs: nn::VarStore,
    head: nn::SequentialT,
    config: SenderConfig,
    training: bool,
}

impl VisionSender {
    /// Build a sender whose head maps backbone features to `vocab_size`
    pub fn new(
        source: AgentSource,
        registry: &BackboneRegistry,
        config: SenderConfig,
        device: Device,
    ) -> Result<Self> {
        config.validate()?;
        let backbone = source.resolve(registry, device)?;
        let vs = nn::VarStore::new(device);
        let head = communication_head(&(vs.root() / "sender"), backbone.output_dim(), config.vocab_size);

        Ok(Self { backbone, vs, head, config, training: true })
    }

    /// Head configuration
    pub fn config(&self) -> &SenderConfig {
        &self.config
    }

    /// The frozen feature extractor
    pub fn backbone(&self) -> &Backbone {
        &self.backbone
    }
}

impl Agent for VisionSender {
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

impl Sender for VisionSender {
    fn send(&self, input: &Tensor, _aux: &mut AuxInput) -> Result<SenderOutput> {
        let features = self.backbone.features(input)?;
        let mut message = forward_checked(&self.head, &features, self.training)?;
        if let Some(non_linearity) = self.config.non_linearity {
            message = non_linearity.apply(&message);
        }
        if self.config.force_gumbel {
            message = gumbel_softmax_sample(&message, self.config.gumbel_temperature, self.training);
        }
        Ok(SenderOutput::continuous(message))
    }
}

/// Discrete sender trained with REINFORCE
///
/// Samples one symbol per example in training mode and takes the most likely
/// symbol in evaluation mode.
pub struct ReinforceSender {
    backbone: Backbone,
    vs: nn::VarStore,
    head: nn::SequentialT,
    vocab_size: i64,
    training: bool,
}

impl ReinforceSender {
    /// Build a sender emitting one of `vocab_size` symbols
    pub fn new(
        source: AgentSource,
        registry: &BackboneRegistry,
        vocab_size: i64,
        device: Device,
    ) -> Result<Self> {
        SenderConfig::new().vocab_size(vocab_size).validate()?;
        let backbone = source.resolve(registry, device)?;
        let vs = nn::VarStore::new(device);
        let head = communication_head(&(vs.root() / "sender"), backbone.output_dim(), vocab_size);

        Ok(Self { backbone, vs, head, vocab_size, training: true })
    }

    /// Number of symbols
    pub fn vocab_size(&self) -> i64 {
        self.vocab_size
    }
}

impl Agent for ReinforceSender {
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

impl Sender for ReinforceSender {
    fn send(&self, input: &Tensor, _aux: &mut AuxInput) -> Result<SenderOutput> {
        let features = self.backbone.features(input)?;
        let logits = forward_checked(&self.head, &features, self.training)?;

        // Use log_softmax for numerical stability
        let log_probs_all = logits.log_softmax(-1, Kind::Float);
        let probs = log_probs_all.exp();

        let symbols = if self.training {
            probs.multinomial(1, true).squeeze_dim(-1)
        } else {
            logits.argmax(-1, false)
        };

        let log_prob = log_probs_all.gather(-1, &symbols.unsqueeze(-1), false).squeeze_dim(-1);
        let entropy = -(&probs * &log_probs_all).sum_dim_intlist(-1, false, Kind::Float);

        Ok(SenderOutput { message: symbols, policy: Some(PolicyTerms { log_prob, entropy }) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::backbone::tests::tiny_registry;

    fn input() -> Tensor {
        Tensor::randn([6, 4], (Kind::Float, Device::Cpu))
    }

    #[test]
    fn test_message_shape() {
        let sender = VisionSender::new(
            AgentSource::named("tiny"),
            &tiny_registry(),
            SenderConfig::new().vocab_size(16),
            Device::Cpu,
        )
        .unwrap();

        let out = sender.send(&input(), &mut AuxInput::default()).unwrap();
        assert_eq!(out.message.size(), vec![6, 16]);
        assert!(out.policy.is_none());
        assert!(out.message.requires_grad());
    }

    #[test]
    fn test_head_is_only_trainable_part() {
        let sender = VisionSender::new(
            AgentSource::named("tiny"),
            &tiny_registry(),
            SenderConfig::new().vocab_size(16),
            Device::Cpu,
        )
        .unwrap();

        let names: Vec<String> = sender.var_store().variables().into_keys().collect();
        assert!(!names.is_empty());
        assert!(names.iter().all(|name| name.starts_with("sender.")));
        assert!(!sender.var_store().trainable_variables().is_empty());
    }

    #[test]
    fn test_mode_toggle_keeps_backbone_in_eval() {
        let mut sender = VisionSender::new(
            AgentSource::named("tiny"),
            &tiny_registry(),
            SenderConfig::new().vocab_size(16),
            Device::Cpu,
        )
        .unwrap();
        let xs = input();
        let before = sender.backbone().features(&xs).unwrap();

        sender.set_training(false);
        assert!(!sender.is_training());
        sender.set_training(true);

        let after = sender.backbone().features(&xs).unwrap();
        assert!(before.allclose(&after, 1e-6, 1e-6, false));
    }

    #[test]
    fn test_forced_gumbel_is_one_hot_in_eval() {
        let mut sender = VisionSender::new(
            AgentSource::named("tiny"),
            &tiny_registry(),
            SenderConfig::new().vocab_size(10).force_gumbel(1.0),
            Device::Cpu,
        )
        .unwrap();
        sender.set_training(false);

        let message = sender.send(&input(), &mut AuxInput::default()).unwrap().message;
        let (row_max, _) = message.max_dim(-1, false);
        let ones = Tensor::ones([6], (Kind::Float, Device::Cpu));
        assert!(row_max.allclose(&ones, 0.0, 0.0, false));
    }

    #[test]
    fn test_invalid_config() {
        let err = VisionSender::new(
            AgentSource::named("tiny"),
            &tiny_registry(),
            SenderConfig::new().vocab_size(0),
            Device::Cpu,
        )
        .err()
        .unwrap();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Configuration { .. })));
    }

    #[test]
    fn test_unknown_backbone() {
        let err = VisionSender::new(
            AgentSource::named("vgg11"),
            &tiny_registry(),
            SenderConfig::new(),
            Device::Cpu,
        )
        .err()
        .unwrap();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::UnsupportedBackbone { .. })));
    }

    #[test]
    fn test_reinforce_outputs() {
        let sender =
            ReinforceSender::new(AgentSource::named("tiny"), &tiny_registry(), 5, Device::Cpu).unwrap();

        let out = sender.send(&input(), &mut AuxInput::default()).unwrap();
        let policy = out.policy.expect("reinforce sender emits policy terms");

        assert_eq!(out.message.size(), vec![6]);
        assert_eq!(out.message.kind(), Kind::Int64);
        assert_eq!(policy.log_prob.size(), vec![6]);
        assert_eq!(policy.entropy.size(), vec![6]);

        let max_log_prob = f64::try_from(&policy.log_prob.max()).unwrap();
        assert!(max_log_prob <= 0.0);
        let min_entropy = f64::try_from(&policy.entropy.min()).unwrap();
        assert!(min_entropy >= 0.0);
    }

    #[test]
    fn test_reinforce_eval_is_deterministic() {
        let mut sender =
            ReinforceSender::new(AgentSource::named("tiny"), &tiny_registry(), 5, Device::Cpu).unwrap();
        sender.set_training(false);
        let xs = input();

        let a = sender.send(&xs, &mut AuxInput::default()).unwrap().message;
        let b = sender.send(&xs, &mut AuxInput::default()).unwrap().message;
        assert!(a.equal(&b));
    }
}
