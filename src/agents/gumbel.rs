//! Gumbel-softmax relaxation for differentiable discrete messages

use tch::{Kind, Tensor};

const EPS: f64 = 1e-20;

/// Relaxed sample from the categorical distribution given by `logits`
///
/// In training mode returns `softmax((logits + g) / temperature)` with Gumbel
/// noise `g`. In evaluation mode returns the one-hot argmax, which makes the
/// sender deterministic at test time.
pub fn gumbel_softmax_sample(logits: &Tensor, temperature: f64, training: bool) -> Tensor {
    if !training {
        let size = logits.size();
        let n = size[size.len() - 1];
        return logits.argmax(-1, false).onehot(n).to_kind(logits.kind());
    }

    let u = logits.rand_like();
    let gumbel = -(-(u + EPS).log() + EPS).log();
    ((logits + gumbel) / temperature).softmax(-1, Kind::Float)
}
