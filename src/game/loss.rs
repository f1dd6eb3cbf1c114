//! Per-example game losses
//!
//! A loss turns one game call into a per-example loss tensor `[batch]` plus
//! named metrics. Closures with the right signature are losses too.

use anyhow::Result;
use tch::{Kind, Reduction, Tensor};

use super::interaction::{AuxInfo, AuxInput};
use crate::error::Error;

/// Everything a loss may look at
pub struct LossInputs<'a> {
    pub sender_input: &'a Tensor,
    pub message: &'a Tensor,
    pub receiver_input: &'a Tensor,
    pub receiver_output: &'a Tensor,
    pub labels: &'a Tensor,
    pub aux_input: &'a AuxInput,
}

/// Maps one game call to `(per-example loss, aux metrics)`
pub trait Loss: Send {
    fn compute(&self, inputs: &LossInputs<'_>) -> Result<(Tensor, AuxInfo)>;
}

impl<F> Loss for F
where
    F: Fn(&LossInputs<'_>) -> Result<(Tensor, AuxInfo)> + Send,
{
    fn compute(&self, inputs: &LossInputs<'_>) -> Result<(Tensor, AuxInfo)> {
        self(inputs)
    }
}

/// Box a closure as a loss
pub fn loss_fn<F>(f: F) -> Box<dyn Loss>
where
    F: Fn(&LossInputs<'_>) -> Result<(Tensor, AuxInfo)> + Send + 'static,
{
    Box::new(f)
}

fn accuracy(receiver_output: &Tensor, labels: &Tensor) -> Result<Tensor> {
    let predicted = receiver_output.f_argmax(-1, false).map_err(Error::from)?;
    Ok(predicted.eq_tensor(labels).to_kind(Kind::Float))
}

/// Cross-entropy of receiver logits against target candidate indices
#[derive(Debug, Clone, Copy, Default)]
pub struct DiscriminationLoss;

impl Loss for DiscriminationLoss {
    fn compute(&self, inputs: &LossInputs<'_>) -> Result<(Tensor, AuxInfo)> {
        let loss = inputs
            .receiver_output
            .f_cross_entropy_loss::<Tensor>(inputs.labels, None, Reduction::None, -100, 0.0)
            .map_err(Error::from)?;

        let mut aux = AuxInfo::new();
        aux.insert("acc".into(), accuracy(inputs.receiver_output, inputs.labels)?);
        Ok((loss, aux))
    }
}

/// Negative accuracy, a non-differentiable reward for REINFORCE senders
#[derive(Debug, Clone, Copy, Default)]
pub struct AccuracyReward;

impl Loss for AccuracyReward {
    fn compute(&self, inputs: &LossInputs<'_>) -> Result<(Tensor, AuxInfo)> {
        let acc = accuracy(inputs.receiver_output, inputs.labels)?;
        let mut aux = AuxInfo::new();
        aux.insert("acc".into(), acc.shallow_clone());
        Ok((-acc, aux))
    }
}
