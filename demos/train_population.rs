//! Train a small population on synthetic "images"
//!
//! Feature vectors stand in for images and a single linear layer stands in
//! for a vision backbone, so the whole run fits on a CPU in seconds. The
//! population starts with two senders and two receivers, is frozen, then
//! grows by one sender that is pulled towards the best old sender.
//!
//! # Usage
//!
//! ```bash
//! cargo run --example train_population --release
//! cargo run --example train_population --release -- experiment.json
//! ```

use anyhow::Result;
use chorus::prelude::*;
use tch::{nn, Device, Kind, Tensor};

const N_ITEMS: i64 = 512;
const FEATURES: i64 = 32;
const BATCH_SIZE: i64 = 16;

fn synthetic_batches(items: &Tensor, sampler: &mut ProximitySampler) -> Result<Vec<Batch>> {
    let batches = sampler
        .batches()?
        .into_iter()
        .map(|indices| {
            let idx = Tensor::from_slice(&indices);
            let view = items.index_select(0, &idx);
            let noisy = &view + view.randn_like() * 0.1;
            Batch::discrimination(view, noisy)
        })
        .collect();
    Ok(batches)
}

fn main() -> Result<()> {
    tracing_subscriber::fmt().with_env_filter("info").init();

    let mut config = match std::env::args().nth(1) {
        Some(path) => ExperimentConfig::load_json(path)?,
        None => ExperimentConfig {
            sender_backbones: vec!["synthetic".into(), "synthetic".into()],
            receiver_backbones: vec!["synthetic".into(), "synthetic".into()],
            sender: SenderConfig::new().vocab_size(16),
            receiver: ReceiverConfig::new().hidden_dim(64).output_dim(16),
            population: PopulationConfig::new().aux_loss(AuxLossKind::BestAveraged, 0.5),
            trainer: TrainerConfig::new().learning_rate(1e-3).cosine_annealing(true),
            n_epochs: 5,
            ..Default::default()
        },
    };
    config.validate()?;

    let mut registry = BackboneRegistry::with_defaults();
    registry.register("synthetic", 48, |p| Box::new(nn::linear(p / "fc", FEATURES, 48, Default::default())));

    let device = Device::cuda_if_available();
    tracing::info!("Device: {:?}", device);

    tch::manual_seed(config.population.seed as i64);
    let items = Tensor::randn([N_ITEMS, FEATURES], (Kind::Float, Device::Cpu));
    let similarity = {
        let unit = &items / items.norm_scalaropt_dim(2, [1], true);
        unit.matmul(&unit.transpose(0, 1))
    };
    let mut sampler = ProximitySampler::new(similarity, BATCH_SIZE, config.population.seed)?;
    let train = synthetic_batches(&items, &mut sampler)?;
    let valid: Vec<Batch> = synthetic_batches(&items, &mut sampler)?.into_iter().take(8).collect();

    let mut trainer = config.build_trainer(&registry, device)?;
    let stats = trainer.train(config.n_epochs, &train, Some(&valid))?;
    tracing::info!(
        "Phase 1 done: running loss {:.4}, best validation {:.4}",
        stats.running_loss,
        stats.best_validation_loss
    );

    // Grow the population: old agents keep playing but stop learning
    trainer.population_mut().freeze_current();
    config.sender_backbones = vec!["synthetic".into()];
    let newcomers = config.build_senders(&registry, device)?;
    trainer.population_mut().add_senders(newcomers);

    let stats = trainer.train(config.n_epochs, &train, Some(&valid))?;
    tracing::info!("Phase 2 done: running loss {:.4}", stats.running_loss);

    let outcome = trainer.population_mut().evaluate_sweep(&valid[0]);
    for record in &outcome.records {
        tracing::info!(
            "sender {} / receiver {}: loss {:.4}",
            record.indices.sender,
            record.indices.receiver,
            record.loss
        );
    }
    if let Some(err) = outcome.error {
        tracing::warn!("sweep stopped early: {err:#}");
    }

    Ok(())
}
