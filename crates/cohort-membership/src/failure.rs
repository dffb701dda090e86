//! Failure detection and auto-down.
//!
//! The membership core does not decide on its own when a node has
//! failed. A [`FailureDetector`] turns heartbeats into availability, the
//! daemon turns availability changes into reachability observations, and
//! [`AutoDown`] turns prolonged unreachability into `Down` requests.

use std::collections::{BTreeSet, HashMap};
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::address::UniqueAddress;

/// Tracks liveness of monitored nodes from heartbeat arrivals.
pub trait FailureDetector: Send {
    /// Records that something was heard from `node`.
    fn heartbeat(&mut self, node: UniqueAddress, now: Instant);

    /// Returns false once `node` has been silent for too long.
    /// Nodes that were never heard from are considered available.
    fn is_available(&self, node: &UniqueAddress, now: Instant) -> bool;

    /// Starts watching `node` as if a heartbeat had just arrived.
    fn monitor(&mut self, node: UniqueAddress, now: Instant);

    /// Stops tracking `node`.
    fn remove(&mut self, node: &UniqueAddress);

    fn monitored(&self) -> Vec<UniqueAddress>;
}

/// Declares a node unavailable when no heartbeat arrived within
/// `heartbeat_interval + acceptable_pause`.
#[derive(Debug)]
pub struct DeadlineFailureDetector {
    deadline: Duration,
    last_heard: HashMap<UniqueAddress, Instant>,
}

impl DeadlineFailureDetector {
    pub fn new(heartbeat_interval: Duration, acceptable_pause: Duration) -> Self {
        Self {
            deadline: heartbeat_interval + acceptable_pause,
            last_heard: HashMap::new(),
        }
    }
}

impl FailureDetector for DeadlineFailureDetector {
    fn heartbeat(&mut self, node: UniqueAddress, now: Instant) {
        self.last_heard.insert(node, now);
    }

    fn is_available(&self, node: &UniqueAddress, now: Instant) -> bool {
        match self.last_heard.get(node) {
            Some(last) => now.saturating_duration_since(*last) <= self.deadline,
            None => true,
        }
    }

    fn monitor(&mut self, node: UniqueAddress, now: Instant) {
        self.last_heard.entry(node).or_insert(now);
    }

    fn remove(&mut self, node: &UniqueAddress) {
        self.last_heard.remove(node);
    }

    fn monitored(&self) -> Vec<UniqueAddress> {
        self.last_heard.keys().copied().collect()
    }
}

/// Per-member one-shot timers that request a `Down` after a member has
/// been unreachable for the configured duration.
///
/// Expired timers send the member on `fired`; the receiver is polled by
/// the daemon, which re-checks reachability before downing.
pub struct AutoDown {
    after: Option<Duration>,
    timers: HashMap<UniqueAddress, JoinHandle<()>>,
    fired: mpsc::UnboundedSender<UniqueAddress>,
}

impl AutoDown {
    pub fn new(after: Option<Duration>, fired: mpsc::UnboundedSender<UniqueAddress>) -> Self {
        Self {
            after,
            timers: HashMap::new(),
            fired,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.after.is_some()
    }

    /// Reconciles the running timers with the current unreachable set:
    /// starts timers for newly unreachable members and cancels timers for
    /// members that are reachable again or gone.
    pub fn update(&mut self, unreachable: &BTreeSet<UniqueAddress>) {
        let Some(after) = self.after else {
            return;
        };

        self.timers.retain(|node, handle| {
            if unreachable.contains(node) && !handle.is_finished() {
                true
            } else {
                if !handle.is_finished() {
                    debug!(%node, "auto-down timer cancelled");
                }
                handle.abort();
                false
            }
        });

        for node in unreachable {
            if self.timers.contains_key(node) {
                continue;
            }
            info!(%node, ?after, "member unreachable, scheduling auto-down");
            let fired = self.fired.clone();
            let node = *node;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(after).await;
                let _ = fired.send(node);
            });
            self.timers.insert(node, handle);
        }
    }

    pub fn is_scheduled(&self, node: &UniqueAddress) -> bool {
        self.timers
            .get(node)
            .is_some_and(|handle| !handle.is_finished())
    }

    /// Cancels every pending timer.
    pub fn cancel_all(&mut self) {
        for (_, handle) in self.timers.drain() {
            handle.abort();
        }
    }
}

impl Drop for AutoDown {
    fn drop(&mut self) {
        self.cancel_all();
    }
}
