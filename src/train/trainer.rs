//! Population trainer
//!
//! Drives a [`PopulationGame`] over batches, accumulates gradients and steps
//! one Adam optimizer per agent head. Optimizers are created the first time
//! an agent needs a step, so agents added mid-run are picked up without any
//! extra bookkeeping. Agents behind the population's lock indices keep
//! playing but are never stepped.

use std::{
    borrow::Borrow,
    collections::{btree_map::Entry, BTreeMap, BTreeSet},
};

use anyhow::Result;
use tch::{nn, nn::OptimizerConfig, Device};

use super::{
    config::TrainerConfig,
    stats::{AggregatedStats, EpochAccumulator, EpochStats},
};
use crate::{
    agents::Agent,
    data::Batch,
    error::Error,
    game::Interaction,
    population::PopulationGame,
};

/// Identifies an agent head owning an optimizer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum AgentKey {
    Sender(usize),
    Receiver(usize),
}

/// Statistics and logged interactions of one epoch
#[derive(Debug)]
pub struct EpochOutcome {
    pub stats: EpochStats,
    pub interaction: Interaction,
}

fn var_store_of(population: &PopulationGame, key: AgentKey) -> Result<&nn::VarStore> {
    let sampler = population.sampler();
    let vs = match key {
        AgentKey::Sender(idx) => sampler.senders().get(idx).map(|s| s.var_store()),
        AgentKey::Receiver(idx) => sampler.receivers().get(idx).map(|r| r.var_store()),
    };
    vs.ok_or_else(|| Error::configuration(format!("no agent for {key:?}")).into())
}

/// Trains every agent of a population game
pub struct Trainer {
    config: TrainerConfig,
    population: PopulationGame,
    optimizers: BTreeMap<AgentKey, nn::Optimizer>,
    pending: BTreeSet<AgentKey>,
    learning_rate: f64,
    stats: AggregatedStats,
}

impl Trainer {
    pub fn new(config: TrainerConfig, population: PopulationGame) -> Result<Self> {
        config.validate()?;
        if population.device_policy().force_move && config.update_freq > 1 {
            return Err(Error::configuration(
                "force_move releases agents between batches and cannot accumulate gradients; use update_freq = 1",
            )
            .into());
        }

        Ok(Self {
            learning_rate: config.learning_rate,
            config,
            population,
            optimizers: BTreeMap::new(),
            pending: BTreeSet::new(),
            stats: AggregatedStats::new(),
        })
    }

    pub fn config(&self) -> &TrainerConfig {
        &self.config
    }

    pub fn population(&self) -> &PopulationGame {
        &self.population
    }

    /// Mutable access, e.g. to grow or freeze the population between epochs
    pub fn population_mut(&mut self) -> &mut PopulationGame {
        &mut self.population
    }

    pub fn into_population(self) -> PopulationGame {
        self.population
    }

    pub fn stats(&self) -> &AggregatedStats {
        &self.stats
    }

    /// Number of agent heads with an optimizer
    pub fn n_optimizers(&self) -> usize {
        self.optimizers.len()
    }

    /// Learning rate currently applied to every optimizer
    pub fn learning_rate(&self) -> f64 {
        self.learning_rate
    }

    /// Change the learning rate of existing and future optimizers
    pub fn set_learning_rate(&mut self, lr: f64) {
        self.learning_rate = lr;
        for optimizer in self.optimizers.values_mut() {
            optimizer.set_lr(lr);
        }
    }

    fn is_locked(&self, key: AgentKey) -> bool {
        let sampler = self.population.sampler();
        match key {
            AgentKey::Sender(idx) => idx < sampler.sender_lock_idx(),
            AgentKey::Receiver(idx) => idx < sampler.receiver_lock_idx(),
        }
    }

    /// Step every agent that played since the last step
    fn step(&mut self) -> Result<()> {
        let pending = std::mem::take(&mut self.pending);
        for key in pending {
            if self.is_locked(key) {
                for mut var in var_store_of(&self.population, key)?.trainable_variables() {
                    var.zero_grad();
                }
                continue;
            }

            let optimizer = match self.optimizers.entry(key) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => {
                    let vs = var_store_of(&self.population, key)?;
                    let adam = nn::Adam { wd: self.config.weight_decay, ..Default::default() };
                    let optimizer = adam.build(vs, self.learning_rate).map_err(Error::from)?;
                    tracing::debug!(agent = ?key, "created optimizer");
                    entry.insert(optimizer)
                }
            };

            if let Some(max_norm) = self.config.max_grad_norm {
                optimizer.clip_grad_norm(max_norm);
            }
            optimizer.step();
            optimizer.zero_grad();
        }
        Ok(())
    }

    /// One training pass over `batches`
    pub fn train_epoch<I, B>(&mut self, batches: I) -> Result<EpochOutcome>
    where
        I: IntoIterator<Item = B>,
        B: Borrow<Batch>,
    {
        self.population.train();
        let update_freq = self.config.update_freq;
        let mut acc = EpochAccumulator::default();
        let mut interactions = Vec::new();

        for batch in batches {
            let output = self.population.forward(batch.borrow())?;
            if let Some(indices) = output.indices {
                self.pending.insert(AgentKey::Sender(indices.sender));
                self.pending.insert(AgentKey::Receiver(indices.receiver));
            }

            let scaled = &output.loss / update_freq as f64;
            if scaled.requires_grad() {
                scaled.f_backward().map_err(Error::from)?;
            }

            acc.push_batch(f64::try_from(&output.loss).map_err(Error::from)?);
            interactions.push(output.interaction.to_device(Device::Cpu));

            if acc.n_batches() % update_freq == 0 {
                self.step()?;
                acc.push_step();
            }
        }

        if acc.n_batches() == 0 {
            return Err(Error::configuration("training epoch received no batches").into());
        }
        if !self.pending.is_empty() {
            self.step()?;
            acc.push_step();
        }

        let interaction = Interaction::from_iterable(interactions)?;
        let stats = acc.finish(interaction.aux_means());
        self.stats.update(stats.clone());

        let summary = self.population.stats().summary();
        tracing::info!(
            epoch = self.stats.total_epochs,
            loss = stats.mean_loss,
            batches = stats.n_batches,
            steps = stats.optimizer_steps,
            best_sender_loss = summary.best_loss,
            worst_sender_loss = summary.worst_loss,
            "training epoch finished"
        );
        Ok(EpochOutcome { stats, interaction })
    }

    fn run_eval<I, B>(&mut self, batches: I) -> Result<EpochOutcome>
    where
        I: IntoIterator<Item = B>,
        B: Borrow<Batch>,
    {
        let _guard = tch::no_grad_guard();
        let mut acc = EpochAccumulator::default();
        let mut interactions = Vec::new();

        for batch in batches {
            let output = self.population.forward(batch.borrow())?;
            acc.push_batch(f64::try_from(&output.loss).map_err(Error::from)?);
            interactions.push(output.interaction.to_device(Device::Cpu));
        }
        if acc.n_batches() == 0 {
            return Err(Error::configuration("evaluation received no batches").into());
        }

        let interaction = Interaction::from_iterable(interactions)?;
        Ok(EpochOutcome { stats: acc.finish(interaction.aux_means()), interaction })
    }

    /// Evaluation pass over `batches`
    ///
    /// Restarts the evaluation sweep so each batch plays the next pair in
    /// sweep order; the previous mode is restored afterwards.
    pub fn eval<I, B>(&mut self, batches: I) -> Result<EpochOutcome>
    where
        I: IntoIterator<Item = B>,
        B: Borrow<Batch>,
    {
        let was_training = self.population.is_training();
        self.population.eval();
        self.population.sampler_mut().reset_cursor();

        let outcome = self.run_eval(batches);
        self.population.set_training(was_training);

        let outcome = outcome?;
        tracing::info!(loss = outcome.stats.mean_loss, batches = outcome.stats.n_batches, "evaluation finished");
        Ok(outcome)
    }

    /// Train for `n_epochs`, validating every `validation_freq` epochs
    pub fn train(
        &mut self,
        n_epochs: usize,
        train_batches: &[Batch],
        validation_batches: Option<&[Batch]>,
    ) -> Result<&AggregatedStats> {
        for epoch in 1..=n_epochs {
            self.set_learning_rate(self.config.learning_rate_at(epoch - 1, n_epochs));
            self.train_epoch(train_batches)?;

            if let Some(validation) = validation_batches {
                if epoch % self.config.validation_freq == 0 {
                    let outcome = self.eval(validation)?;
                    if self.stats.update_validation(&outcome.stats) {
                        tracing::info!(epoch, loss = outcome.stats.mean_loss, "new best validation loss");
                    }
                }
            }
        }
        Ok(&self.stats)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::agents::{
        backbone::tests::tiny_registry, AgentSource, ReceiverConfig, Receiver, Sender, SenderConfig,
        VisionReceiver, VisionSender,
    };
    use crate::game::{DiscriminationLoss, Game, GameConfig};
    use crate::population::PopulationConfig;
    use tch::{Kind, Tensor};

    fn sender() -> Box<dyn Sender> {
        Box::new(
            VisionSender::new(
                AgentSource::named("tiny"),
                &tiny_registry(),
                SenderConfig::new().vocab_size(6),
                Device::Cpu,
            )
            .unwrap(),
        )
    }

    fn receiver() -> Box<dyn Receiver> {
        Box::new(
            VisionReceiver::new(
                AgentSource::named("tiny"),
                &tiny_registry(),
                ReceiverConfig::new().hidden_dim(8).output_dim(6),
                Device::Cpu,
            )
            .unwrap(),
        )
    }

    fn population(n_senders: usize, n_receivers: usize) -> PopulationGame {
        PopulationGame::new(
            PopulationConfig::new(),
            Game::new(GameConfig::new()).unwrap(),
            (0..n_senders).map(|_| sender()).collect(),
            (0..n_receivers).map(|_| receiver()).collect(),
            vec![Box::new(DiscriminationLoss)],
        )
        .unwrap()
    }

    fn batches(n: usize) -> Vec<Batch> {
        (0..n)
            .map(|_| {
                let x = Tensor::randn([4, 4], (Kind::Float, Device::Cpu));
                Batch::discrimination(x.shallow_clone(), x)
            })
            .collect()
    }

    fn snapshot(vs: &nn::VarStore) -> Vec<Tensor> {
        vs.trainable_variables().iter().map(|v| v.detach().copy()).collect()
    }

    fn changed(before: &[Tensor], vs: &nn::VarStore) -> bool {
        before
            .iter()
            .zip(vs.trainable_variables().iter())
            .any(|(a, b)| !a.allclose(b, 0.0, 0.0, false))
    }

    #[test]
    fn test_train_epoch_updates_heads() {
        let mut trainer = Trainer::new(TrainerConfig::new().learning_rate(1e-2), population(1, 1)).unwrap();
        let before = snapshot(trainer.population().sampler().senders()[0].var_store());

        let outcome = trainer.train_epoch(&batches(3)).unwrap();

        assert_eq!(outcome.stats.n_batches, 3);
        assert_eq!(outcome.stats.optimizer_steps, 3);
        assert!(outcome.stats.aux.contains_key("acc"));
        assert_eq!(outcome.interaction.size(), Some(12));
        assert_eq!(trainer.n_optimizers(), 2);
        assert!(changed(&before, trainer.population().sampler().senders()[0].var_store()));
    }

    #[test]
    fn test_update_freq_accumulates() {
        let config = TrainerConfig::new().update_freq(2).max_grad_norm(1.0);
        let mut trainer = Trainer::new(config, population(1, 1)).unwrap();

        let outcome = trainer.train_epoch(&batches(5)).unwrap();
        assert_eq!(outcome.stats.optimizer_steps, 3);
        assert_eq!(trainer.stats().total_steps, 3);
    }

    #[test]
    fn test_locked_agents_are_not_stepped() {
        let mut trainer = Trainer::new(TrainerConfig::new().learning_rate(1e-2), population(1, 1)).unwrap();
        trainer.population_mut().freeze_current();
        trainer.population_mut().add_senders(vec![sender()]);

        let old_receiver = snapshot(trainer.population().sampler().receivers()[0].var_store());
        let new_sender = snapshot(trainer.population().sampler().senders()[1].var_store());

        trainer.train_epoch(&batches(2)).unwrap();

        assert!(!changed(&old_receiver, trainer.population().sampler().receivers()[0].var_store()));
        assert!(changed(&new_sender, trainer.population().sampler().senders()[1].var_store()));
        assert_eq!(trainer.n_optimizers(), 1);
    }

    #[test]
    fn test_eval_does_not_touch_weights() {
        let mut trainer = Trainer::new(TrainerConfig::new(), population(2, 2)).unwrap();
        let before = snapshot(trainer.population().sampler().senders()[0].var_store());

        let outcome = trainer.eval(&batches(4)).unwrap();

        assert_eq!(outcome.stats.optimizer_steps, 0);
        assert!(!changed(&before, trainer.population().sampler().senders()[0].var_store()));
        assert!(trainer.population().is_training());
        let senders = outcome.interaction.aux_input["sender_idx"].shallow_clone();
        assert_eq!(Vec::<i64>::try_from(&senders).unwrap(), vec![0, 0, 1, 1]);
    }

    #[test]
    fn test_empty_epoch_rejected() {
        let mut trainer = Trainer::new(TrainerConfig::new(), population(1, 1)).unwrap();
        let err = trainer.train_epoch(Vec::<Batch>::new()).unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Configuration { .. })));
    }

    #[test]
    fn test_train_with_validation() {
        let config = TrainerConfig::new().validation_freq(2);
        let mut trainer = Trainer::new(config, population(1, 1)).unwrap();
        let train = batches(2);
        let valid = batches(1);

        let stats = trainer.train(4, &train, Some(&valid)).unwrap();
        assert_eq!(stats.total_epochs, 4);
        assert!(stats.best_validation_loss.is_finite());
    }

    #[test]
    fn test_cosine_annealing_reaches_all_optimizers() {
        let config = TrainerConfig::new().learning_rate(1e-2).cosine_annealing(true).weight_decay(1e-6);
        let mut trainer = Trainer::new(config, population(1, 1)).unwrap();
        let train = batches(1);

        trainer.train(2, &train, None).unwrap();
        assert!((trainer.learning_rate() - 5e-3).abs() < 1e-12);
        assert_eq!(trainer.n_optimizers(), 2);
    }

    #[test]
    fn test_force_move_requires_single_step_updates() {
        use crate::population::DevicePolicy;
        let population = population(1, 1).with_device_policy(DevicePolicy::new(Device::Cpu).force_move(true));
        assert!(Trainer::new(TrainerConfig::new().update_freq(2), population).is_err());
    }
}
