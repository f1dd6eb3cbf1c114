//! Population game: sampler plus game plus auxiliary loss

use anyhow::Result;
use tch::{Device, Kind, Tensor};

use super::{
    aux_loss::AuxLoss,
    sampler::{AgentSampler, Sampled, TripleIndex},
    stats::PopulationStats,
    PopulationConfig,
};
use crate::{
    agents::{Agent, Receiver, Sender},
    data::Batch,
    error::Error,
    game::{AuxInput, Game, GameOutput, Interaction, Loss},
};

/// Where sampled agents run
///
/// Agents are moved to `device` right before they play. With `force_move`,
/// agents left there by the previous call are sent back to the CPU at the
/// start of the next call, so at most one pair (plus an aux target) is
/// resident at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DevicePolicy {
    pub device: Device,
    pub force_move: bool,
}

impl Default for DevicePolicy {
    fn default() -> Self {
        Self { device: Device::Cpu, force_move: false }
    }
}

impl DevicePolicy {
    pub fn new(device: Device) -> Self {
        Self { device, force_move: false }
    }

    pub fn force_move(mut self, force_move: bool) -> Self {
        self.force_move = force_move;
        self
    }
}

#[derive(Debug, Default)]
struct Resident {
    senders: Vec<usize>,
    receivers: Vec<usize>,
}

/// Outcome of one pair in an evaluation sweep
#[derive(Debug)]
pub struct SweepRecord {
    pub indices: TripleIndex,
    pub loss: f64,
    pub interaction: Interaction,
}

/// Result of an evaluation sweep
///
/// A failing pair stops the sweep; records of the pairs that already ran
/// are kept alongside the error.
#[derive(Debug)]
pub struct SweepOutcome {
    pub records: Vec<SweepRecord>,
    pub error: Option<anyhow::Error>,
}

impl SweepOutcome {
    pub fn is_complete(&self) -> bool {
        self.error.is_none()
    }

    /// Mean loss over the completed pairs
    pub fn mean_loss(&self) -> Option<f64> {
        if self.records.is_empty() {
            return None;
        }
        Some(self.records.iter().map(|r| r.loss).sum::<f64>() / self.records.len() as f64)
    }

    /// Records, or the error if the sweep stopped early
    pub fn into_result(self) -> Result<Vec<SweepRecord>> {
        match self.error {
            Some(err) => Err(err),
            None => Ok(self.records),
        }
    }
}

/// Message of the auxiliary target, produced without gradients in
/// evaluation behaviour so the target's own state is left untouched
fn target_message(
    sampler: &mut PopulationSampler,
    target: usize,
    indices: TripleIndex,
    batch: &Batch,
) -> Result<Tensor> {
    let sender = sampler
        .sender_mut(target)
        .ok_or_else(|| Error::configuration(format!("aux target sender {target} does not exist")))?;
    let was_training = sender.is_training();
    sender.set_training(false);

    let mut aux_input = AuxInput::for_triple(indices);
    let sent = tch::no_grad(|| sender.send(&batch.sender_input, &mut aux_input));
    sender.set_training(was_training);
    Ok(sent?.message)
}

/// Boxed pools of a population
pub type PopulationSampler = AgentSampler<Box<dyn Sender>, Box<dyn Receiver>, Box<dyn Loss>>;

/// Plays a freshly sampled triple on every call
pub struct PopulationGame {
    sampler: PopulationSampler,
    game: Game,
    aux_loss: Option<AuxLoss>,
    device_policy: DevicePolicy,
    resident: Resident,
    stats: PopulationStats,
    training: bool,
}

impl PopulationGame {
    pub fn new(
        config: PopulationConfig,
        game: Game,
        senders: Vec<Box<dyn Sender>>,
        receivers: Vec<Box<dyn Receiver>>,
        losses: Vec<Box<dyn Loss>>,
    ) -> Result<Self> {
        config.validate(senders.len())?;
        let aux_loss = config
            .aux_loss
            .map(|kind| AuxLoss::new(kind, config.aux_loss_weight))
            .transpose()?;

        let mut population = Self {
            sampler: AgentSampler::new(senders, receivers, losses, config.seed),
            game,
            aux_loss,
            device_policy: DevicePolicy::default(),
            resident: Resident::default(),
            stats: PopulationStats::new(),
            training: true,
        };
        population.set_training(true);

        tracing::info!(
            senders = population.sampler.senders().len(),
            receivers = population.sampler.receivers().len(),
            losses = population.sampler.losses().len(),
            pairs = population.sampler.universe().len(),
            "population game created"
        );
        Ok(population)
    }

    pub fn with_device_policy(mut self, policy: DevicePolicy) -> Self {
        self.device_policy = policy;
        self
    }

    pub fn device_policy(&self) -> DevicePolicy {
        self.device_policy
    }

    pub fn sampler(&self) -> &PopulationSampler {
        &self.sampler
    }

    pub fn sampler_mut(&mut self) -> &mut PopulationSampler {
        &mut self.sampler
    }

    pub fn game(&self) -> &Game {
        &self.game
    }

    pub fn aux_loss(&self) -> Option<&AuxLoss> {
        self.aux_loss.as_ref()
    }

    /// Per-agent play statistics (training calls only)
    pub fn stats(&self) -> &PopulationStats {
        &self.stats
    }

    pub fn stats_mut(&mut self) -> &mut PopulationStats {
        &mut self.stats
    }

    /// Switch sampler, game and every agent between training and evaluation
    pub fn set_training(&mut self, mode: bool) {
        self.training = mode;
        self.sampler.set_training(mode);
        self.game.set_training(mode);
        for sender in self.sampler.senders_mut() {
            sender.set_training(mode);
        }
        for receiver in self.sampler.receivers_mut() {
            receiver.set_training(mode);
        }
    }

    pub fn train(&mut self) {
        self.set_training(true);
    }

    pub fn eval(&mut self) {
        self.set_training(false);
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn add_senders(&mut self, senders: Vec<Box<dyn Sender>>) {
        let added = senders.len();
        let mode = self.training;
        self.sampler.add_senders(senders.into_iter().map(|mut s| {
            s.set_training(mode);
            s
        }));
        tracing::info!(added, total = self.sampler.senders().len(), "added senders");
    }

    pub fn add_receivers(&mut self, receivers: Vec<Box<dyn Receiver>>) {
        let added = receivers.len();
        let mode = self.training;
        self.sampler.add_receivers(receivers.into_iter().map(|mut r| {
            r.set_training(mode);
            r
        }));
        tracing::info!(added, total = self.sampler.receivers().len(), "added receivers");
    }

    pub fn add_losses(&mut self, losses: Vec<Box<dyn Loss>>) {
        self.sampler.add_losses(losses);
    }

    /// Stop pairing the current agents with each other
    pub fn freeze_current(&mut self) {
        self.sampler.freeze_current();
        tracing::info!(
            sender_lock = self.sampler.sender_lock_idx(),
            receiver_lock = self.sampler.receiver_lock_idx(),
            "froze current population"
        );
    }

    fn place(&mut self, indices: TripleIndex, aux_target: Option<usize>) {
        let DevicePolicy { device, force_move } = self.device_policy;
        let mut senders = vec![indices.sender];
        if let Some(target) = aux_target.filter(|&t| t != indices.sender) {
            senders.push(target);
        }
        let receivers = vec![indices.receiver];

        if force_move {
            for &idx in self.resident.senders.iter().filter(|idx| !senders.contains(idx)) {
                if let Some(sender) = self.sampler.sender_mut(idx) {
                    sender.to_device(Device::Cpu);
                }
            }
            for &idx in self.resident.receivers.iter().filter(|idx| !receivers.contains(idx)) {
                if let Some(receiver) = self.sampler.receiver_mut(idx) {
                    receiver.to_device(Device::Cpu);
                }
            }
        }

        for &idx in &senders {
            if let Some(sender) = self.sampler.sender_mut(idx) {
                sender.to_device(device);
            }
        }
        for &idx in &receivers {
            if let Some(receiver) = self.sampler.receiver_mut(idx) {
                receiver.to_device(device);
            }
        }
        self.resident = Resident { senders, receivers };
    }

    /// Play one sampled triple on `batch`
    pub fn forward(&mut self, batch: &Batch) -> Result<GameOutput> {
        let indices = self.sampler.next_indices()?;

        let aux_target = match &self.aux_loss {
            Some(aux) if aux.is_active() => {
                let sampler = &mut self.sampler;
                aux.target(|| sampler.random_sender_index())
            }
            _ => None,
        };
        self.place(indices, aux_target);

        let device = self.device_policy.device;
        let moved;
        let batch = if batch.device() != device {
            moved = batch.to_device(device);
            &moved
        } else {
            batch
        };

        let mut aux_input = AuxInput::for_triple(indices);
        aux_input.aux_sender_idx = aux_target;

        let Sampled { sender, receiver, loss, .. } = self.sampler.get(indices);
        let mut output =
            self.game.forward(sender.as_ref(), receiver.as_ref(), loss.as_ref(), batch, aux_input)?;

        if let Some(aux) = &self.aux_loss {
            match aux_target {
                Some(target) if aux.is_active() => {
                    let target_message = target_message(&mut self.sampler, target, indices, batch)?;

                    let term = aux.term(&output.message, &target_message)?;
                    output.loss = &output.loss + term.mean(Kind::Float) * aux.weight();
                    output.interaction.aux.insert("aux_loss".into(), term.detach());
                    output
                        .interaction
                        .aux
                        .insert("aux_sender_idx".into(), Tensor::from_slice(&[target as i32]));
                }
                None if aux.is_active() => {
                    tracing::warn!(kind = ?aux.kind(), "no auxiliary target yet, skipping aux loss");
                }
                _ => {}
            }
        }

        if self.training {
            let base_loss = f64::try_from(&output.per_example_loss.mean(Kind::Float)).map_err(Error::from)?;
            if let Some(aux) = &mut self.aux_loss {
                aux.record(indices.sender, base_loss);
            }
            self.stats.record(indices, base_loss);
        }

        Ok(output)
    }

    /// Evaluate every eligible triple once on `batch`
    ///
    /// Runs in evaluation mode without gradients and restores the previous
    /// mode afterwards.
    pub fn evaluate_sweep(&mut self, batch: &Batch) -> SweepOutcome {
        let was_training = self.training;
        self.set_training(false);
        self.sampler.reset_cursor();

        let n_pairs = self.sampler.universe().len();
        let mut records = Vec::with_capacity(n_pairs);
        let mut error = None;

        if n_pairs == 0 {
            error = Some(Error::EmptyPool { pool: "pairing universe" }.into());
        }

        {
            let _guard = tch::no_grad_guard();
            for _ in 0..n_pairs {
                let played = self.forward(batch).and_then(|output| {
                    let loss = f64::try_from(&output.loss).map_err(Error::from)?;
                    Ok(SweepRecord {
                        indices: output.indices.unwrap_or_default(),
                        loss,
                        interaction: output.interaction,
                    })
                });
                match played {
                    Ok(record) => records.push(record),
                    Err(err) => {
                        error = Some(err);
                        break;
                    }
                }
            }
        }

        self.set_training(was_training);
        SweepOutcome { records, error }
    }
}
