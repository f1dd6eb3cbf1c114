//! Agent-loss sampler
//!
//! Owns the sender, receiver and loss pools and decides which triple plays
//! next: a uniform draw in training mode, an exhaustive cyclic sweep in
//! evaluation mode. Pools are append-only; [`AgentSampler::freeze_current`]
//! marks everything present as "old" so that only pairings involving newer
//! agents stay eligible.

use anyhow::Result;
use rand::{rngs::StdRng, Rng, SeedableRng};
use tch::Tensor;

use crate::error::Error;

/// Indices of one (sender, receiver, loss) triple
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TripleIndex {
    pub sender: usize,
    pub receiver: usize,
    pub loss: usize,
}

impl TripleIndex {
    pub fn new(sender: usize, receiver: usize, loss: usize) -> Self {
        Self { sender, receiver, loss }
    }

    /// Indices as three 1-element `Int` tensors (sender, receiver, loss)
    pub fn to_tensors(&self) -> (Tensor, Tensor, Tensor) {
        (
            Tensor::from_slice(&[self.sender as i32]),
            Tensor::from_slice(&[self.receiver as i32]),
            Tensor::from_slice(&[self.loss as i32]),
        )
    }
}

/// Eligible triples given pool sizes and lock indices
///
/// First every sender with every receiver at or past `receiver_lock`, then
/// senders at or past `sender_lock` with the locked receivers. Both blocks
/// are lexicographic in (sender, receiver, loss).
pub fn pairing_universe(
    n_senders: usize,
    n_receivers: usize,
    n_losses: usize,
    sender_lock: usize,
    receiver_lock: usize,
) -> Vec<TripleIndex> {
    let receiver_lock = receiver_lock.min(n_receivers);
    let mut universe = Vec::new();

    for sender in 0..n_senders {
        for receiver in receiver_lock..n_receivers {
            for loss in 0..n_losses {
                universe.push(TripleIndex::new(sender, receiver, loss));
            }
        }
    }
    for sender in sender_lock..n_senders {
        for receiver in 0..receiver_lock {
            for loss in 0..n_losses {
                universe.push(TripleIndex::new(sender, receiver, loss));
            }
        }
    }
    universe
}

/// A sampled triple, borrowed from the sampler pools
pub struct Sampled<'a, S, R, L> {
    pub sender: &'a S,
    pub receiver: &'a R,
    pub loss: &'a L,
    pub indices: TripleIndex,
}

/// Sampler over growable sender, receiver and loss pools
pub struct AgentSampler<S, R, L> {
    senders: Vec<S>,
    receivers: Vec<R>,
    losses: Vec<L>,
    sender_lock_idx: usize,
    receiver_lock_idx: usize,
    universe: Vec<TripleIndex>,
    cursor: usize,
    training: bool,
    rng: StdRng,
}

impl<S, R, L> AgentSampler<S, R, L> {
    /// Sampler over the given pools, in training mode
    pub fn new(senders: Vec<S>, receivers: Vec<R>, losses: Vec<L>, seed: u64) -> Self {
        let mut sampler = Self {
            senders,
            receivers,
            losses,
            sender_lock_idx: 0,
            receiver_lock_idx: 0,
            universe: Vec::new(),
            cursor: 0,
            training: true,
            rng: StdRng::seed_from_u64(seed),
        };
        sampler.rebuild();
        sampler
    }

    fn rebuild(&mut self) {
        self.universe = pairing_universe(
            self.senders.len(),
            self.receivers.len(),
            self.losses.len(),
            self.sender_lock_idx,
            self.receiver_lock_idx,
        );
        self.cursor = 0;
    }

    /// Append senders; their indices continue after the existing ones
    pub fn add_senders(&mut self, senders: impl IntoIterator<Item = S>) {
        self.senders.extend(senders);
        self.rebuild();
    }

    /// Append receivers
    pub fn add_receivers(&mut self, receivers: impl IntoIterator<Item = R>) {
        self.receivers.extend(receivers);
        self.rebuild();
    }

    /// Append losses
    pub fn add_losses(&mut self, losses: impl IntoIterator<Item = L>) {
        self.losses.extend(losses);
        self.rebuild();
    }

    /// Lock every current agent
    ///
    /// Locked agents are never paired with each other again; the universe is
    /// empty until new agents are appended.
    pub fn freeze_current(&mut self) {
        self.sender_lock_idx = self.senders.len();
        self.receiver_lock_idx = self.receivers.len();
        self.rebuild();
    }

    /// Indices of the next triple
    pub fn next_indices(&mut self) -> Result<TripleIndex> {
        if self.senders.is_empty() {
            return Err(Error::EmptyPool { pool: "senders" }.into());
        }
        if self.receivers.is_empty() {
            return Err(Error::EmptyPool { pool: "receivers" }.into());
        }
        if self.losses.is_empty() {
            return Err(Error::EmptyPool { pool: "losses" }.into());
        }
        if self.universe.is_empty() {
            return Err(Error::EmptyPool { pool: "pairing universe" }.into());
        }

        let indices = if self.training {
            self.universe[self.rng.gen_range(0..self.universe.len())]
        } else {
            let indices = self.universe[self.cursor];
            self.cursor = (self.cursor + 1) % self.universe.len();
            indices
        };
        tracing::debug!(
            sender = indices.sender,
            receiver = indices.receiver,
            loss = indices.loss,
            training = self.training,
            "sampled triple"
        );
        Ok(indices)
    }

    /// Next triple with references into the pools
    pub fn sample(&mut self) -> Result<Sampled<'_, S, R, L>> {
        let indices = self.next_indices()?;
        Ok(self.get(indices))
    }

    /// References to the triple at `indices`
    ///
    /// Panics if an index is out of range.
    pub fn get(&self, indices: TripleIndex) -> Sampled<'_, S, R, L> {
        Sampled {
            sender: &self.senders[indices.sender],
            receiver: &self.receivers[indices.receiver],
            loss: &self.losses[indices.loss],
            indices,
        }
    }

    /// Uniform sender index from the sampler's generator
    pub fn random_sender_index(&mut self) -> Option<usize> {
        if self.senders.is_empty() {
            None
        } else {
            Some(self.rng.gen_range(0..self.senders.len()))
        }
    }

    /// Restart the evaluation sweep
    pub fn reset_cursor(&mut self) {
        self.cursor = 0;
    }

    pub fn train(&mut self) {
        self.set_training(true);
    }

    pub fn eval(&mut self) {
        self.set_training(false);
    }

    pub fn set_training(&mut self, mode: bool) {
        self.training = mode;
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn senders(&self) -> &[S] {
        &self.senders
    }

    pub fn receivers(&self) -> &[R] {
        &self.receivers
    }

    pub fn losses(&self) -> &[L] {
        &self.losses
    }

    pub fn sender_mut(&mut self, idx: usize) -> Option<&mut S> {
        self.senders.get_mut(idx)
    }

    pub fn receiver_mut(&mut self, idx: usize) -> Option<&mut R> {
        self.receivers.get_mut(idx)
    }

    pub(crate) fn senders_mut(&mut self) -> &mut [S] {
        &mut self.senders
    }

    pub(crate) fn receivers_mut(&mut self) -> &mut [R] {
        &mut self.receivers
    }

    /// Eligible triples in sweep order
    pub fn universe(&self) -> &[TripleIndex] {
        &self.universe
    }

    pub fn cursor(&self) -> usize {
        self.cursor
    }

    pub fn sender_lock_idx(&self) -> usize {
        self.sender_lock_idx
    }

    pub fn receiver_lock_idx(&self) -> usize {
        self.receiver_lock_idx
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn sampler(n_s: usize, n_r: usize, n_l: usize) -> AgentSampler<usize, usize, usize> {
        AgentSampler::new((0..n_s).collect(), (0..n_r).collect(), (0..n_l).collect(), 42)
    }

    fn t(s: usize, r: usize, l: usize) -> TripleIndex {
        TripleIndex::new(s, r, l)
    }

    #[test]
    fn test_full_product_without_locks() {
        assert_eq!(pairing_universe(2, 3, 2, 0, 0).len(), 12);
        assert_eq!(pairing_universe(2, 2, 1, 0, 0), vec![t(0, 0, 0), t(0, 1, 0), t(1, 0, 0), t(1, 1, 0)]);
    }

    #[test]
    fn test_eval_sweep_order_and_wrap() {
        let mut sampler = sampler(2, 2, 1);
        sampler.eval();

        let seen: Vec<TripleIndex> = (0..5).map(|_| sampler.next_indices().unwrap()).collect();
        assert_eq!(seen, vec![t(0, 0, 0), t(0, 1, 0), t(1, 0, 0), t(1, 1, 0), t(0, 0, 0)]);
    }

    #[test]
    fn test_sweep_covers_universe_exactly_once() {
        let mut sampler = sampler(3, 2, 2);
        sampler.eval();
        let n = sampler.universe().len();

        let mut seen: Vec<TripleIndex> = (0..n).map(|_| sampler.next_indices().unwrap()).collect();
        seen.sort();
        seen.dedup();
        assert_eq!(seen.len(), n);
        assert_eq!(sampler.cursor(), 0);
    }

    #[test]
    fn test_training_draws_are_roughly_uniform() {
        let mut sampler = sampler(2, 2, 1);
        let draws = 8000;
        let mut counts: HashMap<TripleIndex, usize> = HashMap::new();
        for _ in 0..draws {
            *counts.entry(sampler.next_indices().unwrap()).or_default() += 1;
        }

        assert_eq!(counts.len(), 4);
        for count in counts.values() {
            let freq = *count as f64 / draws as f64;
            assert!((freq - 0.25).abs() < 0.03, "frequency {freq}");
        }
    }

    #[test]
    fn test_same_seed_same_draws() {
        let mut a = sampler(3, 3, 1);
        let mut b = sampler(3, 3, 1);
        for _ in 0..20 {
            assert_eq!(a.next_indices().unwrap(), b.next_indices().unwrap());
        }
    }

    #[test]
    fn test_freeze_then_grow() {
        let mut sampler = sampler(2, 2, 1);
        sampler.freeze_current();
        assert!(sampler.universe().is_empty());

        let err = sampler.next_indices().unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyPool { .. })));

        sampler.add_senders([2]);
        sampler.add_receivers([2]);
        assert_eq!(
            sampler.universe(),
            &[t(0, 2, 0), t(1, 2, 0), t(2, 2, 0), t(2, 0, 0), t(2, 1, 0)]
        );
    }

    #[test]
    fn test_no_old_old_pairs_after_freeze() {
        let mut sampler = sampler(3, 2, 2);
        sampler.freeze_current();
        sampler.add_senders([3, 4]);
        sampler.add_receivers([2]);

        for triple in sampler.universe() {
            assert!(triple.sender >= 3 || triple.receiver >= 2);
        }
    }

    #[test]
    fn test_add_empty_resets_cursor_only() {
        let mut sampler = sampler(2, 2, 1);
        sampler.eval();
        sampler.next_indices().unwrap();
        sampler.next_indices().unwrap();
        let before = sampler.universe().to_vec();

        sampler.add_senders(Vec::new());
        assert_eq!(sampler.universe(), before.as_slice());
        assert_eq!(sampler.cursor(), 0);
        assert_eq!(sampler.next_indices().unwrap(), t(0, 0, 0));
    }

    #[test]
    fn test_growth_resets_sweep() {
        let mut sampler = sampler(1, 1, 1);
        sampler.eval();
        sampler.next_indices().unwrap();
        sampler.add_losses([1]);

        assert_eq!(sampler.universe(), &[t(0, 0, 0), t(0, 0, 1)]);
        assert_eq!(sampler.next_indices().unwrap(), t(0, 0, 0));
    }

    #[test]
    fn test_empty_pools() {
        let mut sampler: AgentSampler<usize, usize, usize> = AgentSampler::new(vec![], vec![0], vec![0], 0);
        let err = sampler.next_indices().unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyPool { pool: "senders" })));

        let mut sampler: AgentSampler<usize, usize, usize> = AgentSampler::new(vec![0], vec![0], vec![], 0);
        let err = sampler.next_indices().unwrap_err();
        assert!(matches!(err.downcast_ref::<Error>(), Some(Error::EmptyPool { pool: "losses" })));
    }

    #[test]
    fn test_sample_returns_pool_members() {
        let mut sampler: AgentSampler<&str, &str, &str> =
            AgentSampler::new(vec!["s0", "s1"], vec!["r0"], vec!["l0"], 0);
        sampler.eval();
        sampler.next_indices().unwrap();

        let sampled = sampler.sample().unwrap();
        assert_eq!(*sampled.sender, "s1");
        assert_eq!(*sampled.receiver, "r0");
        assert_eq!(sampled.indices, t(1, 0, 0));

        let (s, r, l) = sampled.indices.to_tensors();
        assert_eq!(s.kind(), tch::Kind::Int);
        assert_eq!(i64::try_from(&s.get(0)).unwrap(), 1);
        assert_eq!(i64::try_from(&r.get(0)).unwrap(), 0);
        assert_eq!(i64::try_from(&l.get(0)).unwrap(), 0);
    }
}
