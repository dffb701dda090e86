//! Cluster events and the snapshot diff that produces them.
//!
//! Events are never stored. They are computed by comparing the snapshot
//! before and after a change, which means a subscriber that applies every
//! event it receives ends up with the same view as the node itself.

use std::collections::{BTreeMap, BTreeSet};

use crate::address::UniqueAddress;
use crate::gossip::Gossip;
use crate::member::{Member, MemberStatus};
use crate::reachability::ReachabilityPolicy;

/// Something observable that happened to the cluster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClusterEvent {
    MemberJoined(Member),
    MemberWeaklyUp(Member),
    MemberUp(Member),
    MemberLeft(Member),
    MemberExited(Member),
    MemberDowned(Member),
    /// The member is gone. `member.status` is `Removed`; the status it had
    /// in the last snapshot that still contained it is kept alongside.
    MemberRemoved {
        member: Member,
        previous_status: MemberStatus,
    },
    UnreachableMember(Member),
    ReachableMember(Member),
    LeaderChanged(Option<UniqueAddress>),
    RoleLeaderChanged {
        role: String,
        leader: Option<UniqueAddress>,
    },
    /// The local node started its coordinated shutdown.
    ClusterShuttingDown,
    /// Full snapshot, delivered on subscribe or on request.
    CurrentClusterState(CurrentClusterState),
    CurrentInternalStats(GossipStats),
}

/// Event categories a subscriber can filter on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EventKind {
    Member,
    Reachability,
    Leader,
    RoleLeader,
    Stats,
    Shutdown,
}

impl EventKind {
    pub const ALL: [EventKind; 6] = [
        EventKind::Member,
        EventKind::Reachability,
        EventKind::Leader,
        EventKind::RoleLeader,
        EventKind::Stats,
        EventKind::Shutdown,
    ];
}

impl ClusterEvent {
    /// Category of this event, or `None` for `CurrentClusterState` which
    /// bypasses subscription filters.
    pub fn kind(&self) -> Option<EventKind> {
        match self {
            ClusterEvent::MemberJoined(_)
            | ClusterEvent::MemberWeaklyUp(_)
            | ClusterEvent::MemberUp(_)
            | ClusterEvent::MemberLeft(_)
            | ClusterEvent::MemberExited(_)
            | ClusterEvent::MemberDowned(_)
            | ClusterEvent::MemberRemoved { .. } => Some(EventKind::Member),
            ClusterEvent::UnreachableMember(_) | ClusterEvent::ReachableMember(_) => {
                Some(EventKind::Reachability)
            }
            ClusterEvent::LeaderChanged(_) => Some(EventKind::Leader),
            ClusterEvent::RoleLeaderChanged { .. } => Some(EventKind::RoleLeader),
            ClusterEvent::CurrentInternalStats(_) => Some(EventKind::Stats),
            ClusterEvent::ClusterShuttingDown => Some(EventKind::Shutdown),
            ClusterEvent::CurrentClusterState(_) => None,
        }
    }

    /// The member a member or reachability event is about.
    pub fn member(&self) -> Option<&Member> {
        match self {
            ClusterEvent::MemberJoined(m)
            | ClusterEvent::MemberWeaklyUp(m)
            | ClusterEvent::MemberUp(m)
            | ClusterEvent::MemberLeft(m)
            | ClusterEvent::MemberExited(m)
            | ClusterEvent::MemberDowned(m)
            | ClusterEvent::UnreachableMember(m)
            | ClusterEvent::ReachableMember(m) => Some(m),
            ClusterEvent::MemberRemoved { member, .. } => Some(member),
            _ => None,
        }
    }
}

impl std::fmt::Display for ClusterEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ClusterEvent::MemberJoined(m) => write!(f, "member joined: {m}"),
            ClusterEvent::MemberWeaklyUp(m) => write!(f, "member weakly up: {m}"),
            ClusterEvent::MemberUp(m) => write!(f, "member up: {m}"),
            ClusterEvent::MemberLeft(m) => write!(f, "member left: {m}"),
            ClusterEvent::MemberExited(m) => write!(f, "member exited: {m}"),
            ClusterEvent::MemberDowned(m) => write!(f, "member downed: {m}"),
            ClusterEvent::MemberRemoved {
                member,
                previous_status,
            } => write!(
                f,
                "member removed: {} (was {previous_status})",
                member.unique_address
            ),
            ClusterEvent::UnreachableMember(m) => write!(f, "member unreachable: {m}"),
            ClusterEvent::ReachableMember(m) => write!(f, "member reachable again: {m}"),
            ClusterEvent::LeaderChanged(Some(l)) => write!(f, "leader is now {l}"),
            ClusterEvent::LeaderChanged(None) => write!(f, "no leader"),
            ClusterEvent::RoleLeaderChanged {
                role,
                leader: Some(l),
            } => write!(f, "leader for role {role} is now {l}"),
            ClusterEvent::RoleLeaderChanged { role, leader: None } => {
                write!(f, "no leader for role {role}")
            }
            ClusterEvent::ClusterShuttingDown => f.write_str("cluster shutting down"),
            ClusterEvent::CurrentClusterState(s) => write!(
                f,
                "cluster state: {} members, {} unreachable",
                s.members.len(),
                s.unreachable.len()
            ),
            ClusterEvent::CurrentInternalStats(s) => write!(
                f,
                "gossip stats: received={} merges={} members={}",
                s.received_gossip_count, s.merge_count, s.member_count
            ),
        }
    }
}

/// A point-in-time view of the cluster.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CurrentClusterState {
    /// Members ordered by unique address.
    pub members: Vec<Member>,
    pub unreachable: Vec<Member>,
    pub seen_by: BTreeSet<UniqueAddress>,
    pub leader: Option<UniqueAddress>,
    pub role_leaders: BTreeMap<String, Option<UniqueAddress>>,
}

impl CurrentClusterState {
    pub fn from_gossip(gossip: &Gossip, policy: ReachabilityPolicy) -> Self {
        let unreachable = gossip.unreachable(policy);
        Self {
            members: gossip.members().cloned().collect(),
            unreachable: gossip
                .members()
                .filter(|m| unreachable.contains(&m.unique_address))
                .cloned()
                .collect(),
            seen_by: gossip.seen().clone(),
            leader: gossip.leader(policy),
            role_leaders: gossip
                .roles()
                .into_iter()
                .map(|role| {
                    let leader = gossip.role_leader(&role, policy);
                    (role, leader)
                })
                .collect(),
        }
    }

    pub fn member(&self, node: &UniqueAddress) -> Option<&Member> {
        self.members.iter().find(|m| m.unique_address == *node)
    }

    pub fn role_leader(&self, role: &str) -> Option<UniqueAddress> {
        self.role_leaders.get(role).copied().flatten()
    }
}

/// Counters describing the gossip traffic a node has handled.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GossipStats {
    pub received_gossip_count: u64,
    pub merge_count: u64,
    pub same_count: u64,
    pub newer_count: u64,
    pub older_count: u64,
    pub member_count: usize,
    pub unreachable_count: usize,
    /// Number of entries in the current vector clock.
    pub version_size: usize,
}

/// Computes the events that lead from `old` to `new`.
///
/// Member events come first, grouped by lifecycle step (joined, weakly
/// up, up, left, exited, downed, removed) and ordered by address within a
/// group. Reachability, leader and role-leader changes follow.
pub fn diff(old: &Gossip, new: &Gossip, policy: ReachabilityPolicy) -> Vec<ClusterEvent> {
    let mut events = diff_members(old, new);
    events.extend(diff_reachability(old, new, policy));

    let old_leader = old.leader(policy);
    let new_leader = new.leader(policy);
    if old_leader != new_leader {
        events.push(ClusterEvent::LeaderChanged(new_leader));
    }

    let roles: BTreeSet<String> = old.roles().union(&new.roles()).cloned().collect();
    for role in roles {
        let before = old.role_leader(&role, policy);
        let after = new.role_leader(&role, policy);
        if before != after {
            events.push(ClusterEvent::RoleLeaderChanged {
                role,
                leader: after,
            });
        }
    }
    events
}

fn diff_members(old: &Gossip, new: &Gossip) -> Vec<ClusterEvent> {
    let mut joined = Vec::new();
    let mut weakly_up = Vec::new();
    let mut up = Vec::new();
    let mut left = Vec::new();
    let mut exited = Vec::new();
    let mut downed = Vec::new();
    let mut removed = Vec::new();

    for member in new.members() {
        let previous = old.member(&member.unique_address).map(|m| m.status);
        if previous == Some(member.status) {
            continue;
        }
        let m = member.clone();
        match member.status {
            MemberStatus::Joining => joined.push(ClusterEvent::MemberJoined(m)),
            MemberStatus::WeaklyUp => weakly_up.push(ClusterEvent::MemberWeaklyUp(m)),
            MemberStatus::Up => up.push(ClusterEvent::MemberUp(m)),
            MemberStatus::Leaving => left.push(ClusterEvent::MemberLeft(m)),
            MemberStatus::Exiting => exited.push(ClusterEvent::MemberExited(m)),
            MemberStatus::Down => downed.push(ClusterEvent::MemberDowned(m)),
            MemberStatus::Removed => removed.push(ClusterEvent::MemberRemoved {
                member: m,
                previous_status: previous.unwrap_or(MemberStatus::Removed),
            }),
        }
    }

    for member in old.members() {
        if !new.has_member(&member.unique_address) {
            removed.push(removed_event(member));
        }
    }

    let mut events = joined;
    events.extend(weakly_up);
    events.extend(up);
    events.extend(left);
    events.extend(exited);
    events.extend(downed);
    events.extend(removed);
    events
}

/// `MemberRemoved` for a member that was dropped from the snapshot.
pub(crate) fn removed_event(member: &Member) -> ClusterEvent {
    ClusterEvent::MemberRemoved {
        member: Member {
            status: MemberStatus::Removed,
            ..member.clone()
        },
        previous_status: member.status,
    }
}

fn diff_reachability(old: &Gossip, new: &Gossip, policy: ReachabilityPolicy) -> Vec<ClusterEvent> {
    let before = old.unreachable(policy);
    let after = new.unreachable(policy);
    let mut events = Vec::new();
    for node in after.difference(&before) {
        if let Some(m) = new.member(node) {
            events.push(ClusterEvent::UnreachableMember(m.clone()));
        }
    }
    for node in before.difference(&after) {
        if let Some(m) = new.member(node) {
            events.push(ClusterEvent::ReachableMember(m.clone()));
        }
    }
    events
}
