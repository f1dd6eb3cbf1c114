//! Batches fed to games
//!
//! Dataset loading lives outside this crate; callers hand batches to the
//! trainer. [`ProximitySampler`] helps build hard batches from a similarity
//! matrix.

pub mod proximity;

use tch::{Device, Kind, Tensor};

pub use proximity::ProximitySampler;

/// One batch of a signaling game
#[derive(Debug)]
pub struct Batch {
    /// What the sender sees, `[batch, ...]`
    pub sender_input: Tensor,

    /// Index of the correct candidate per example
    pub labels: Tensor,

    /// Candidates the receiver discriminates between, `[n_candidates, ...]`
    pub receiver_input: Tensor,
}

impl Batch {
    pub fn new(sender_input: Tensor, labels: Tensor, receiver_input: Tensor) -> Self {
        Self { sender_input, labels, receiver_input }
    }

    /// Standard discrimination batch: example `i` must pick candidate `i`
    pub fn discrimination(sender_view: Tensor, receiver_view: Tensor) -> Self {
        let n = sender_view.size()[0];
        let labels = Tensor::arange(n, (Kind::Int64, sender_view.device()));
        Self::new(sender_view, labels, receiver_view)
    }

    pub fn batch_size(&self) -> i64 {
        self.sender_input.size()[0]
    }

    pub fn device(&self) -> Device {
        self.sender_input.device()
    }

    /// Copy of the batch on `device`
    pub fn to_device(&self, device: Device) -> Self {
        Self {
            sender_input: self.sender_input.to_device(device),
            labels: self.labels.to_device(device),
            receiver_input: self.receiver_input.to_device(device),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discrimination_labels() {
        let x = Tensor::randn([4, 3], (Kind::Float, Device::Cpu));
        let batch = Batch::discrimination(x.shallow_clone(), x);

        assert_eq!(batch.batch_size(), 4);
        assert_eq!(Vec::<i64>::try_from(&batch.labels).unwrap(), vec![0, 1, 2, 3]);
    }

    #[test]
    fn test_to_device_cpu() {
        let x = Tensor::randn([2, 3], (Kind::Float, Device::Cpu));
        let batch = Batch::discrimination(x.shallow_clone(), x).to_device(Device::Cpu);
        assert_eq!(batch.device(), Device::Cpu);
    }
}
