//! Similarity-driven batch construction
//!
//! Builds batches of items that look alike, which makes discrimination
//! harder than uniformly drawn batches.

use std::path::Path;

use anyhow::{Context, Result};
use rand::{rngs::StdRng, Rng, SeedableRng};
use tch::{Kind, Tensor};

use crate::error::Error;

/// Yields batches of nearest neighbours of random reference items
pub struct ProximitySampler {
    similarity: Tensor,
    batch_size: i64,
    rng: StdRng,
}

impl ProximitySampler {
    /// Sampler over a square `[n, n]` similarity matrix
    pub fn new(similarity: Tensor, batch_size: i64, seed: u64) -> Result<Self> {
        let size = similarity.size();
        if size.len() != 2 || size[0] != size[1] {
            return Err(Error::configuration(format!(
                "similarity matrix must be square, got shape {size:?}"
            ))
            .into());
        }
        if batch_size <= 0 || batch_size >= size[0] {
            return Err(Error::configuration(format!(
                "batch_size must be in 1..{}, got {batch_size}",
                size[0]
            ))
            .into());
        }
        Ok(Self { similarity: similarity.to_kind(Kind::Float), batch_size, rng: StdRng::seed_from_u64(seed) })
    }

    /// Load the matrix from a `.npy` file
    pub fn from_npy(path: impl AsRef<Path>, batch_size: i64, seed: u64) -> Result<Self> {
        let path = path.as_ref();
        let similarity = Tensor::read_npy(path)
            .with_context(|| format!("failed to read similarity matrix from {}", path.display()))?;
        Self::new(similarity, batch_size, seed)
    }

    /// Keep only the rows and columns listed in `indices`
    pub fn restrict(self, indices: &[i64]) -> Result<Self> {
        let index = Tensor::from_slice(indices);
        let similarity = self
            .similarity
            .f_index_select(0, &index)
            .and_then(|rows| rows.f_index_select(1, &index))
            .map_err(Error::from)?;
        Self::new(similarity, self.batch_size, self.rng.clone().gen())
    }

    /// Number of items covered by the matrix
    pub fn n_items(&self) -> i64 {
        self.similarity.size()[0]
    }

    /// Number of indices yielded per epoch
    pub fn len(&self) -> usize {
        ((self.n_items() / self.batch_size) * self.batch_size) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// One epoch of batches, each the `batch_size` most similar items
    /// to a random reference (the reference itself excluded)
    pub fn batches(&mut self) -> Result<Vec<Vec<i64>>> {
        let n = self.n_items();
        (0..n / self.batch_size)
            .map(|_| {
                let reference = self.rng.gen_range(0..n);
                let neighbours = self
                    .similarity
                    .f_select(0, reference)
                    .and_then(|row| row.f_argsort(0, true))
                    .and_then(|ranked| ranked.f_narrow(0, 1, self.batch_size))
                    .and_then(|top| Vec::<i64>::try_from(&top))
                    .map_err(Error::from)?;
                Ok(neighbours)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn similarity() -> Tensor {
        // items 0-2 are close to each other, items 3-5 likewise
        let rows: Vec<f32> = (0..6)
            .flat_map(|i| (0..6).map(move |j| if i == j { 1.0 } else if i / 3 == j / 3 { 0.9 } else { 0.1 }))
            .collect();
        Tensor::from_slice(&rows).view([6, 6])
    }

    #[test]
    fn test_batches_are_nearest_neighbours() {
        let mut sampler = ProximitySampler::new(similarity(), 2, 7).unwrap();
        let batches = sampler.batches().unwrap();

        assert_eq!(batches.len(), 3);
        assert_eq!(sampler.len(), 6);
        for batch in batches {
            assert_eq!(batch.len(), 2);
            assert_eq!(batch[0] / 3, batch[1] / 3);
        }
    }

    #[test]
    fn test_same_seed_same_batches() {
        let a = ProximitySampler::new(similarity(), 2, 3).unwrap().batches().unwrap();
        let b = ProximitySampler::new(similarity(), 2, 3).unwrap().batches().unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_every_batch_is_full() {
        let mut sampler = ProximitySampler::new(similarity(), 1, 0).unwrap().restrict(&[0, 1, 3, 4]).unwrap();
        for _ in 0..5 {
            let batches = sampler.batches().unwrap();
            assert_eq!(batches.len(), 4);
            assert!(batches.iter().all(|b| b.len() == 1 && (0..4).contains(&b[0])));
        }
    }

    #[test]
    fn test_restrict() {
        let sampler = ProximitySampler::new(similarity(), 1, 0).unwrap().restrict(&[0, 1, 3, 4]).unwrap();
        assert_eq!(sampler.n_items(), 4);
    }

    #[test]
    fn test_rejects_bad_shapes() {
        let err = ProximitySampler::new(Tensor::zeros([2, 3], (Kind::Float, tch::Device::Cpu)), 1, 0)
            .err()
            .unwrap();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::Configuration { .. })));
        assert!(ProximitySampler::new(similarity(), 6, 0).is_err());
    }
}
