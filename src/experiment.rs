//! Experiment configuration
//!
//! One serialisable description of a whole run: which backbones the senders
//! and receivers sit on, how their heads, the game, the population and the
//! trainer are configured. [`ExperimentConfig::build_trainer`] turns it into
//! a ready-to-train [`Trainer`].

use std::{
    collections::BTreeMap,
    fs::File,
    io::{Read, Write},
    path::{Path, PathBuf},
};

use anyhow::Result;
use serde::{Deserialize, Serialize};
use tch::Device;

use crate::{
    agents::{
        AgentSource, BackboneRegistry, Receiver, ReceiverConfig, ReinforceSender, Sender,
        SenderConfig, VisionReceiver, VisionSender,
    },
    error::Error,
    game::{AccuracyReward, DiscriminationLoss, Game, GameConfig, Loss},
    population::{PopulationConfig, PopulationGame},
    train::{Trainer, TrainerConfig},
};

/// Kind of sender built for every sender backbone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SenderKind {
    /// Continuous message, trained end to end
    #[default]
    Continuous,
    /// One sampled symbol, trained with REINFORCE
    Reinforce,
}

/// Built-in losses
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LossKind {
    #[default]
    Discrimination,
    AccuracyReward,
}

impl LossKind {
    pub fn create(self) -> Box<dyn Loss> {
        match self {
            Self::Discrimination => Box::new(DiscriminationLoss),
            Self::AccuracyReward => Box::new(AccuracyReward),
        }
    }
}

/// Full description of a population run
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExperimentConfig {
    /// One sender per entry, built on the named backbone
    pub sender_backbones: Vec<String>,

    /// One receiver per entry, built on the named backbone
    pub receiver_backbones: Vec<String>,

    /// Pretrained weight files, keyed by backbone identifier
    pub pretrained_weights: BTreeMap<String, PathBuf>,

    pub sender_kind: SenderKind,
    pub sender: SenderConfig,
    pub receiver: ReceiverConfig,
    pub losses: Vec<LossKind>,
    pub game: GameConfig,
    pub population: PopulationConfig,
    pub trainer: TrainerConfig,

    /// Epochs for [`Trainer::train`]
    pub n_epochs: usize,
}

impl Default for ExperimentConfig {
    fn default() -> Self {
        Self {
            sender_backbones: vec!["resnet50".into()],
            receiver_backbones: vec!["resnet50".into()],
            pretrained_weights: BTreeMap::new(),
            sender_kind: SenderKind::Continuous,
            sender: SenderConfig::default(),
            receiver: ReceiverConfig::default(),
            losses: vec![LossKind::Discrimination],
            game: GameConfig::default(),
            population: PopulationConfig::default(),
            trainer: TrainerConfig::default(),
            n_epochs: 10,
        }
    }
}

impl ExperimentConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate every section and their compatibility
    pub fn validate(&self) -> Result<()> {
        if self.sender_backbones.is_empty() || self.receiver_backbones.is_empty() {
            return Err(Error::configuration("at least one sender and one receiver are required").into());
        }
        if self.losses.is_empty() {
            return Err(Error::configuration("at least one loss is required").into());
        }
        self.sender.validate()?;
        self.receiver.validate()?;
        self.game.validate()?;
        self.population.validate(self.sender_backbones.len())?;
        self.trainer.validate()?;

        let (vocab, width) = (self.sender.vocab_size, self.receiver.output_dim);
        match self.sender_kind {
            SenderKind::Continuous if vocab != width => Err(Error::configuration(format!(
                "continuous messages of width {vocab} cannot be compared to receiver embeddings of width {width}"
            ))
            .into()),
            SenderKind::Reinforce if vocab > width => Err(Error::configuration(format!(
                "{vocab} symbols do not fit a receiver embedding of width {width}"
            ))
            .into()),
            _ => Ok(()),
        }
    }

    fn source(&self, name: &str) -> AgentSource {
        match self.pretrained_weights.get(name) {
            Some(path) => AgentSource::pretrained(name, path.clone()),
            None => AgentSource::named(name),
        }
    }

    /// Build every sender
    pub fn build_senders(&self, registry: &BackboneRegistry, device: Device) -> Result<Vec<Box<dyn Sender>>> {
        self.sender_backbones
            .iter()
            .map(|name| -> Result<Box<dyn Sender>> {
                let source = self.source(name);
                Ok(match self.sender_kind {
                    SenderKind::Continuous => {
                        Box::new(VisionSender::new(source, registry, self.sender.clone(), device)?)
                    }
                    SenderKind::Reinforce => {
                        Box::new(ReinforceSender::new(source, registry, self.sender.vocab_size, device)?)
                    }
                })
            })
            .collect()
    }

    /// Build every receiver
    pub fn build_receivers(
        &self,
        registry: &BackboneRegistry,
        device: Device,
    ) -> Result<Vec<Box<dyn Receiver>>> {
        self.receiver_backbones
            .iter()
            .map(|name| -> Result<Box<dyn Receiver>> {
                Ok(Box::new(VisionReceiver::new(self.source(name), registry, self.receiver.clone(), device)?))
            })
            .collect()
    }

    /// Build the population game
    pub fn build_population(&self, registry: &BackboneRegistry, device: Device) -> Result<PopulationGame> {
        self.validate()?;
        PopulationGame::new(
            self.population.clone(),
            Game::new(self.game.clone())?,
            self.build_senders(registry, device)?,
            self.build_receivers(registry, device)?,
            self.losses.iter().map(|kind| kind.create()).collect(),
        )
    }

    /// Build the population game and its trainer
    pub fn build_trainer(&self, registry: &BackboneRegistry, device: Device) -> Result<Trainer> {
        Trainer::new(self.trainer.clone(), self.build_population(registry, device)?)
    }

    /// Save configuration to a JSON file
    pub fn save_json<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        let mut file = File::create(path)?;
        file.write_all(json.as_bytes())?;
        Ok(())
    }

    /// Load configuration from a JSON file
    pub fn load_json<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config = serde_json::from_str(&contents)?;
        Ok(config)
    }
}
