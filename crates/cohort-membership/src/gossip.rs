//! Versioned membership snapshots and the merge that reconciles them.
//!
//! A [`Gossip`] is an immutable value. Every change, whether a local
//! status transition or a merge with a remote snapshot, returns a new
//! value, so the owner can compare the old and new snapshot to derive
//! events.
//!
//! # Merge
//!
//! `merge` is a join: commutative, associative and idempotent for any two
//! snapshots that descend from the same cluster history.
//!
//! 1. tombstones are unioned
//! 2. if one version dominates, its members and `seen` set win outright
//! 3. for concurrent versions each member is resolved by status
//!    precedence and the clocks are merged; nobody has seen the result yet
//! 4. tombstoned nodes are dropped from members, clock and reachability
//!
//! Reachability rows ride along in the overview and are merged in every
//! case, independent of the version comparison.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;

use crate::address::UniqueAddress;
use crate::member::{Member, MemberStatus};
use crate::reachability::{Reachability, ReachabilityPolicy};
use crate::vclock::{ClockOrdering, VectorClock};

/// Parts of a snapshot that are not covered by the vector clock.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GossipOverview {
    /// Nodes that have observed exactly this version.
    pub seen: BTreeSet<UniqueAddress>,
    pub reachability: Reachability,
}

/// A versioned membership snapshot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Gossip {
    members: BTreeMap<UniqueAddress, Member>,
    version: VectorClock,
    /// Removed nodes and their removal time in unix milliseconds.
    tombstones: BTreeMap<UniqueAddress, u64>,
    overview: GossipOverview,
}

impl Gossip {
    /// A snapshot with no members, as held by a node that has not joined.
    pub fn empty() -> Self {
        Self::default()
    }

    /// Builds a snapshot from decoded or hand-made parts.
    ///
    /// Normalizes the value: tombstoned nodes are dropped from members and
    /// clock, `seen` and reachability are restricted to members.
    pub fn from_parts(
        members: impl IntoIterator<Item = Member>,
        version: VectorClock,
        tombstones: BTreeMap<UniqueAddress, u64>,
        overview: GossipOverview,
    ) -> Self {
        let members = members
            .into_iter()
            .map(|m| (m.unique_address, m))
            .collect();
        Self {
            members,
            version,
            tombstones,
            overview,
        }
        .normalized()
    }

    fn normalized(mut self) -> Self {
        let tombstones = &self.tombstones;
        self.members.retain(|node, _| !tombstones.contains_key(node));
        for node in tombstones.keys() {
            self.version = self.version.prune(node);
        }
        let members = &self.members;
        self.overview.seen.retain(|node| members.contains_key(node));
        self.overview.reachability = self
            .overview
            .reachability
            .restrict_to(|node| members.contains_key(node));
        self
    }

    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    pub fn member(&self, node: &UniqueAddress) -> Option<&Member> {
        self.members.get(node)
    }

    pub fn has_member(&self, node: &UniqueAddress) -> bool {
        self.members.contains_key(node)
    }

    pub fn member_count(&self) -> usize {
        self.members.len()
    }

    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Members living at a network address, oldest incarnation first.
    pub fn members_at(&self, address: SocketAddr) -> impl Iterator<Item = &Member> {
        self.members
            .values()
            .filter(move |m| m.unique_address.address == address)
    }

    pub fn version(&self) -> &VectorClock {
        &self.version
    }

    pub fn tombstones(&self) -> &BTreeMap<UniqueAddress, u64> {
        &self.tombstones
    }

    pub fn is_tombstoned(&self, node: &UniqueAddress) -> bool {
        self.tombstones.contains_key(node)
    }

    pub fn overview(&self) -> &GossipOverview {
        &self.overview
    }

    pub fn seen(&self) -> &BTreeSet<UniqueAddress> {
        &self.overview.seen
    }

    pub fn seen_by(&self, node: &UniqueAddress) -> bool {
        self.overview.seen.contains(node)
    }

    pub fn reachability(&self) -> &Reachability {
        &self.overview.reachability
    }

    /// Marks `node` as having observed this version.
    pub fn with_seen(&self, node: UniqueAddress) -> Gossip {
        if self.seen_by(&node) || !self.has_member(&node) {
            return self.clone();
        }
        let mut next = self.clone();
        next.overview.seen.insert(node);
        next
    }

    /// Replaces the reachability table. Does not change the version.
    pub fn with_reachability(&self, reachability: Reachability) -> Gossip {
        let mut next = self.clone();
        let members = &next.members;
        next.overview.reachability = reachability.restrict_to(|n| members.contains_key(n));
        next
    }

    /// Applies a batch of member changes made by `by` as a single new
    /// version that only `by` has seen.
    ///
    /// `removed` members are deleted and tombstoned at `now_ms`.
    pub fn apply(
        &self,
        changed: impl IntoIterator<Item = Member>,
        removed: impl IntoIterator<Item = UniqueAddress>,
        by: UniqueAddress,
        now_ms: u64,
    ) -> Gossip {
        let mut next = self.clone();
        for member in changed {
            next.members.insert(member.unique_address, member);
        }
        for node in removed {
            next.members.remove(&node);
            next.tombstones.insert(node, now_ms);
        }
        next.version = next.version.tick(by);
        next.overview.seen.clear();
        next.overview.seen.insert(by);
        next.normalized()
    }

    /// Drops tombstones recorded before `older_than_ms`.
    pub fn prune_tombstones(&self, older_than_ms: u64) -> Gossip {
        if self.tombstones.values().all(|&ts| ts >= older_than_ms) {
            return self.clone();
        }
        let mut next = self.clone();
        next.tombstones.retain(|_, ts| *ts >= older_than_ms);
        next
    }

    /// Merges two snapshots. See the module docs for the rules.
    pub fn merge(&self, other: &Gossip) -> Gossip {
        let mut tombstones = self.tombstones.clone();
        for (node, &ts) in &other.tombstones {
            let entry = tombstones.entry(*node).or_insert(ts);
            if ts > *entry {
                *entry = ts;
            }
        }

        let (members, version, seen) = match self.version.compare(&other.version) {
            ClockOrdering::Same => (
                pick_highest_priority(&self.members, &other.members),
                self.version.clone(),
                self.overview
                    .seen
                    .union(&other.overview.seen)
                    .copied()
                    .collect(),
            ),
            ClockOrdering::After => (
                self.members.clone(),
                self.version.clone(),
                self.overview.seen.clone(),
            ),
            ClockOrdering::Before => (
                other.members.clone(),
                other.version.clone(),
                other.overview.seen.clone(),
            ),
            ClockOrdering::Concurrent => (
                pick_highest_priority(&self.members, &other.members),
                self.version.merge(&other.version),
                BTreeSet::new(),
            ),
        };

        Gossip {
            members,
            version,
            tombstones,
            overview: GossipOverview {
                seen,
                reachability: self
                    .overview
                    .reachability
                    .merge(&other.overview.reachability),
            },
        }
        .normalized()
    }

    /// Members whose observations count: everything not `Down`/`Removed`.
    pub fn live_members(&self) -> BTreeSet<UniqueAddress> {
        self.members
            .values()
            .filter(|m| !m.status.is_down_or_removed())
            .map(|m| m.unique_address)
            .collect()
    }

    /// Members that are unreachable under `policy`.
    pub fn unreachable(&self, policy: ReachabilityPolicy) -> BTreeSet<UniqueAddress> {
        let live = self.live_members();
        self.overview
            .reachability
            .unreachable_subjects(&live, policy)
            .into_iter()
            .filter(|n| self.members.contains_key(n))
            .collect()
    }

    pub fn is_reachable(&self, node: &UniqueAddress, policy: ReachabilityPolicy) -> bool {
        let live = self.live_members();
        self.overview.reachability.is_reachable(node, &live, policy)
    }

    /// True when every member that is neither `Down` nor unreachable has
    /// observed this version.
    pub fn has_converged(&self, policy: ReachabilityPolicy) -> bool {
        let unreachable = self.unreachable(policy);
        self.members.values().all(|m| {
            m.status.is_down_or_removed()
                || unreachable.contains(&m.unique_address)
                || self.overview.seen.contains(&m.unique_address)
        })
    }

    /// Members that block convergence: live, reachable and not in `seen`.
    pub fn not_seen(&self, policy: ReachabilityPolicy) -> Vec<UniqueAddress> {
        let unreachable = self.unreachable(policy);
        self.members
            .values()
            .filter(|m| {
                !m.status.is_down_or_removed()
                    && !unreachable.contains(&m.unique_address)
                    && !self.overview.seen.contains(&m.unique_address)
            })
            .map(|m| m.unique_address)
            .collect()
    }

    /// The cluster leader: lowest reachable `Up`/`Leaving` member.
    ///
    /// While no such member exists the lowest reachable member leads,
    /// preferring `Joining`/`WeaklyUp` over `Exiting` over `Down`, so a
    /// founding node can promote itself and a last member can remove
    /// itself.
    pub fn leader(&self, policy: ReachabilityPolicy) -> Option<UniqueAddress> {
        self.leader_among(|_| true, policy)
    }

    /// Leader among the members carrying `role`.
    pub fn role_leader(&self, role: &str, policy: ReachabilityPolicy) -> Option<UniqueAddress> {
        self.leader_among(|m| m.has_role(role), policy)
    }

    fn leader_among(
        &self,
        filter: impl Fn(&Member) -> bool,
        policy: ReachabilityPolicy,
    ) -> Option<UniqueAddress> {
        let unreachable = self.unreachable(policy);
        let rank = |m: &Member| match m.status {
            MemberStatus::Up | MemberStatus::Leaving => 0,
            MemberStatus::Joining | MemberStatus::WeaklyUp => 1,
            MemberStatus::Exiting => 2,
            MemberStatus::Down | MemberStatus::Removed => 3,
        };
        self.members
            .values()
            .filter(|m| filter(m) && !unreachable.contains(&m.unique_address))
            .min_by_key(|m| (rank(m), m.unique_address))
            .map(|m| m.unique_address)
    }

    /// Every role carried by at least one member.
    pub fn roles(&self) -> BTreeSet<String> {
        self.members
            .values()
            .flat_map(|m| m.roles.iter().cloned())
            .collect()
    }

    /// Highest `up_number` handed out so far, if any member is up.
    pub fn max_up_number(&self) -> Option<u32> {
        self.members
            .values()
            .map(|m| m.up_number)
            .filter(|n| *n != crate::member::NOT_UP)
            .max()
    }
}

fn pick_highest_priority(
    a: &BTreeMap<UniqueAddress, Member>,
    b: &BTreeMap<UniqueAddress, Member>,
) -> BTreeMap<UniqueAddress, Member> {
    let mut merged = a.clone();
    for (node, theirs) in b {
        match merged.get(node) {
            Some(ours) => {
                let winner = Member::highest_priority_of(ours, theirs).clone();
                merged.insert(*node, winner);
            }
            None => {
                merged.insert(*node, theirs.clone());
            }
        }
    }
    merged
}
