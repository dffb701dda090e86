//! Reachability observations and their cluster-wide aggregation.
//!
//! Every node owns one row of the table: its own view of which subjects
//! it can reach. A row carries a counter that the owner bumps on every
//! change, so merging two tables simply keeps the newer row per observer.
//! The table travels in the gossip overview but is not covered by the
//! gossip vector clock.

use std::collections::{BTreeMap, BTreeSet};

use serde::{Deserialize, Serialize};

use crate::address::UniqueAddress;

/// One observer's opinion about one subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ReachabilityStatus {
    Reachable,
    Unreachable,
}

/// How observations from several observers are folded into a single
/// reachable/unreachable verdict per subject.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ReachabilityPolicy {
    /// Unreachable as soon as any live observer reports it.
    #[default]
    AnyObserver,
    /// Unreachable only when a strict majority of the live members other
    /// than the subject report it.
    Quorum,
}

impl std::str::FromStr for ReachabilityPolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "any-observer" => Ok(ReachabilityPolicy::AnyObserver),
            "quorum" => Ok(ReachabilityPolicy::Quorum),
            _ => Err(format!(
                "unknown reachability policy '{s}'. valid options: any-observer, quorum"
            )),
        }
    }
}

/// A single observer's row.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ObserverRow {
    pub version: u64,
    pub subjects: BTreeMap<UniqueAddress, ReachabilityStatus>,
}

/// Table of observer rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reachability {
    rows: BTreeMap<UniqueAddress, ObserverRow>,
}

impl Reachability {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builds a table from decoded rows.
    pub fn from_rows(rows: impl IntoIterator<Item = (UniqueAddress, ObserverRow)>) -> Self {
        Self {
            rows: rows.into_iter().collect(),
        }
    }

    pub fn rows(&self) -> impl Iterator<Item = (&UniqueAddress, &ObserverRow)> {
        self.rows.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Returns what `observer` currently thinks about `subject`.
    pub fn status(&self, observer: &UniqueAddress, subject: &UniqueAddress) -> ReachabilityStatus {
        self.rows
            .get(observer)
            .and_then(|row| row.subjects.get(subject))
            .copied()
            .unwrap_or(ReachabilityStatus::Reachable)
    }

    /// Records an observation, returning a new table.
    ///
    /// Returns `None` when the observation does not change anything, so
    /// callers can skip publishing.
    pub fn record(
        &self,
        observer: UniqueAddress,
        subject: UniqueAddress,
        status: ReachabilityStatus,
    ) -> Option<Reachability> {
        if observer == subject || self.status(&observer, &subject) == status {
            return None;
        }
        let mut rows = self.rows.clone();
        let row = rows.entry(observer).or_default();
        row.version += 1;
        match status {
            ReachabilityStatus::Unreachable => {
                row.subjects.insert(subject, status);
            }
            ReachabilityStatus::Reachable => {
                // the bumped version is enough to override older rows
                row.subjects.remove(&subject);
            }
        }
        Some(Reachability { rows })
    }

    /// Merges two tables, keeping the newer row per observer.
    ///
    /// Rows with equal versions can only differ after one side pruned a
    /// removed subject; they are combined entry-wise with `Unreachable`
    /// winning so the result does not depend on argument order.
    pub fn merge(&self, other: &Reachability) -> Reachability {
        let mut rows = self.rows.clone();
        for (observer, theirs) in &other.rows {
            match rows.get_mut(observer) {
                None => {
                    rows.insert(*observer, theirs.clone());
                }
                Some(ours) if theirs.version > ours.version => {
                    *ours = theirs.clone();
                }
                Some(ours) if theirs.version == ours.version => {
                    for (subject, status) in &theirs.subjects {
                        let entry = ours.subjects.entry(*subject).or_insert(*status);
                        if *status > *entry {
                            *entry = *status;
                        }
                    }
                }
                Some(_) => {}
            }
        }
        Reachability { rows }
    }

    /// Drops rows and entries that refer to anything not accepted by `keep`.
    pub fn restrict_to(&self, keep: impl Fn(&UniqueAddress) -> bool) -> Reachability {
        let rows = self
            .rows
            .iter()
            .filter(|(observer, _)| keep(observer))
            .map(|(observer, row)| {
                let subjects = row
                    .subjects
                    .iter()
                    .filter(|(subject, _)| keep(subject))
                    .map(|(s, st)| (*s, *st))
                    .collect();
                (
                    *observer,
                    ObserverRow {
                        version: row.version,
                        subjects,
                    },
                )
            })
            .collect();
        Reachability { rows }
    }

    /// Observers in `live` that report `subject` as unreachable.
    pub fn unreachable_observers<'a>(
        &'a self,
        subject: &'a UniqueAddress,
        live: &'a BTreeSet<UniqueAddress>,
    ) -> impl Iterator<Item = &'a UniqueAddress> + 'a {
        self.rows
            .iter()
            .filter(move |(observer, row)| {
                live.contains(*observer)
                    && row.subjects.get(subject) == Some(&ReachabilityStatus::Unreachable)
            })
            .map(|(observer, _)| observer)
    }

    /// Aggregated verdict for `subject`.
    ///
    /// `live` is the set of members whose observations still count
    /// (everything that is not `Down` or `Removed`).
    pub fn is_reachable(
        &self,
        subject: &UniqueAddress,
        live: &BTreeSet<UniqueAddress>,
        policy: ReachabilityPolicy,
    ) -> bool {
        let reporting = self.unreachable_observers(subject, live).count();
        match policy {
            ReachabilityPolicy::AnyObserver => reporting == 0,
            ReachabilityPolicy::Quorum => {
                let voters = live.iter().filter(|m| *m != subject).count();
                reporting * 2 <= voters
            }
        }
    }

    /// All subjects that are unreachable under `policy`.
    pub fn unreachable_subjects(
        &self,
        live: &BTreeSet<UniqueAddress>,
        policy: ReachabilityPolicy,
    ) -> BTreeSet<UniqueAddress> {
        let candidates: BTreeSet<UniqueAddress> = self
            .rows
            .iter()
            .filter(|(observer, _)| live.contains(*observer))
            .flat_map(|(_, row)| {
                row.subjects
                    .iter()
                    .filter(|(_, st)| **st == ReachabilityStatus::Unreachable)
                    .map(|(s, _)| *s)
            })
            .collect();
        candidates
            .into_iter()
            .filter(|s| !self.is_reachable(s, live, policy))
            .collect()
    }
}
