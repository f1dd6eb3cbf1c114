//! Per-agent play statistics
//!
//! Tracks how often each sender and receiver played and its running mean
//! loss, to spot agents the sampler starves or that lag behind.

use super::sampler::TripleIndex;

/// Play record of one agent
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AgentRecord {
    pub games_played: usize,
    pub total_loss: f64,
    pub mean_loss: f64,
}

impl AgentRecord {
    fn update(&mut self, loss: f64) {
        self.total_loss += loss;
        self.games_played += 1;
        self.mean_loss = self.total_loss / self.games_played as f64;
    }
}

/// Records of every sender and receiver, indexed like the pools
#[derive(Debug, Clone, Default)]
pub struct PopulationStats {
    senders: Vec<AgentRecord>,
    receivers: Vec<AgentRecord>,
}

impl PopulationStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record the mean loss of one call
    pub fn record(&mut self, indices: TripleIndex, loss: f64) {
        record_at(&mut self.senders, indices.sender, loss);
        record_at(&mut self.receivers, indices.receiver, loss);
    }

    pub fn sender(&self, idx: usize) -> Option<&AgentRecord> {
        self.senders.get(idx)
    }

    pub fn receiver(&self, idx: usize) -> Option<&AgentRecord> {
        self.receivers.get(idx)
    }

    pub fn clear(&mut self) {
        self.senders.clear();
        self.receivers.clear();
    }

    /// Summary over senders that played at least once
    pub fn summary(&self) -> StatsSummary {
        let played: Vec<&AgentRecord> = self.senders.iter().filter(|r| r.games_played > 0).collect();
        if played.is_empty() {
            return StatsSummary::default();
        }

        let losses: Vec<f64> = played.iter().map(|r| r.mean_loss).collect();
        StatsSummary {
            mean_loss: losses.iter().sum::<f64>() / losses.len() as f64,
            best_loss: losses.iter().cloned().fold(f64::INFINITY, f64::min),
            worst_loss: losses.iter().cloned().fold(f64::NEG_INFINITY, f64::max),
            total_games: played.iter().map(|r| r.games_played).sum(),
        }
    }
}

fn record_at(records: &mut Vec<AgentRecord>, idx: usize, loss: f64) {
    if idx >= records.len() {
        records.resize(idx + 1, AgentRecord::default());
    }
    records[idx].update(loss);
}

/// Population-wide sender statistics
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StatsSummary {
    pub mean_loss: f64,
    pub best_loss: f64,
    pub worst_loss: f64,
    pub total_games: usize,
}
