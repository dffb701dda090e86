//! Vector clocks for ordering gossip versions.

use std::collections::BTreeMap;

use crate::address::UniqueAddress;

/// Causal relation between two vector clocks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClockOrdering {
    /// Both clocks are identical.
    Same,
    /// `self` happened before `other`.
    Before,
    /// `self` happened after `other`.
    After,
    /// Neither dominates.
    Concurrent,
}

/// Per-node counters. Missing entries count as zero.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VectorClock {
    versions: BTreeMap<UniqueAddress, u64>,
}

impl VectorClock {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a copy with `node`'s counter incremented.
    pub fn tick(&self, node: UniqueAddress) -> VectorClock {
        let mut versions = self.versions.clone();
        *versions.entry(node).or_insert(0) += 1;
        VectorClock { versions }
    }

    /// Pointwise maximum of both clocks.
    pub fn merge(&self, other: &VectorClock) -> VectorClock {
        let mut versions = self.versions.clone();
        for (node, &v) in &other.versions {
            let entry = versions.entry(*node).or_insert(0);
            if v > *entry {
                *entry = v;
            }
        }
        VectorClock { versions }
    }

    /// Returns a copy without `node`'s entry.
    pub fn prune(&self, node: &UniqueAddress) -> VectorClock {
        let mut versions = self.versions.clone();
        versions.remove(node);
        VectorClock { versions }
    }

    pub fn get(&self, node: &UniqueAddress) -> u64 {
        self.versions.get(node).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&UniqueAddress, &u64)> {
        self.versions.iter()
    }

    /// Builds a clock from raw entries, dropping zero counters.
    pub fn from_entries(entries: impl IntoIterator<Item = (UniqueAddress, u64)>) -> Self {
        Self {
            versions: entries.into_iter().filter(|(_, v)| *v > 0).collect(),
        }
    }

    /// Compares two clocks.
    pub fn compare(&self, other: &VectorClock) -> ClockOrdering {
        let mut self_ahead = false;
        let mut other_ahead = false;

        for (node, &v) in &self.versions {
            let o = other.get(node);
            if v > o {
                self_ahead = true;
            } else if v < o {
                other_ahead = true;
            }
        }
        for (node, &o) in &other.versions {
            if !self.versions.contains_key(node) && o > 0 {
                other_ahead = true;
            }
        }

        match (self_ahead, other_ahead) {
            (false, false) => ClockOrdering::Same,
            (true, false) => ClockOrdering::After,
            (false, true) => ClockOrdering::Before,
            (true, true) => ClockOrdering::Concurrent,
        }
    }
}
