use std::collections::VecDeque;

use crate::snapshot::ConnectionStats;

/// Bounded history of connection samples for one peer.
///
/// When full, each push evicts the oldest sample. Iteration order is
/// oldest → newest.
#[derive(Debug, Clone)]
pub struct StatsHistory {
    samples: VecDeque<ConnectionStats>,
    capacity: usize,
}

impl StatsHistory {
    /// Creates an empty history. A zero capacity is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: VecDeque::with_capacity(capacity),
            capacity,
        }
    }

    /// Appends a sample, evicting the oldest entry when at capacity.
    pub fn push(&mut self, sample: ConnectionStats) {
        if self.samples.len() == self.capacity {
            self.samples.pop_front();
        }
        self.samples.push_back(sample);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ConnectionStats> {
        self.samples.iter()
    }

    /// The most recent sample, if any.
    pub fn last(&self) -> Option<&ConnectionStats> {
        self.samples.back()
    }

    pub fn len(&self) -> usize {
        self.samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.samples.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Mean round-trip time over the retained samples.
    pub fn average_rtt_ms(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|s| s.rtt_ms).sum();
        Some(total / self.samples.len() as f64)
    }

    /// Mean packet loss over the retained samples.
    pub fn average_loss_percent(&self) -> Option<f64> {
        if self.samples.is_empty() {
            return None;
        }
        let total: f64 = self.samples.iter().map(|s| s.packet_loss_percent).sum();
        Some(total / self.samples.len() as f64)
    }

    /// Snapshot of the retained samples.
    pub fn to_vec(&self) -> Vec<ConnectionStats> {
        self.samples.iter().cloned().collect()
    }
}
