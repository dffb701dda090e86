//! Member lifecycle transitions applied to a gossip snapshot.
//!
//! Every function here is pure: it takes the current snapshot and returns
//! the next one, or `None` when the request changes nothing. The daemon
//! decides when to call them and what to do with the result.

use std::collections::BTreeSet;

use tracing::{debug, warn};

use crate::address::UniqueAddress;
use crate::gossip::Gossip;
use crate::member::{Member, MemberStatus, NOT_UP};
use crate::reachability::ReachabilityPolicy;

/// Hook consulted before the leader moves a `Leaving` member to
/// `Exiting`, e.g. to let a singleton hand over first.
pub trait ExitGate: Send + Sync {
    fn ready_to_exit(&self, member: &Member, gossip: &Gossip) -> bool;
}

/// Exit gate that never holds a member back.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysReady;

impl ExitGate for AlwaysReady {
    fn ready_to_exit(&self, _member: &Member, _gossip: &Gossip) -> bool {
        true
    }
}

/// Adds `joiner` as a `Joining` member.
///
/// Older incarnations at the same network address that are still live
/// are marked `Down` in the same version. Joining a tombstoned or already
/// known unique address is a no-op.
pub fn join(
    gossip: &Gossip,
    joiner: UniqueAddress,
    roles: BTreeSet<String>,
    by: UniqueAddress,
    now_ms: u64,
) -> Option<Gossip> {
    if gossip.is_tombstoned(&joiner) {
        debug!(%joiner, "ignoring join from removed incarnation");
        return None;
    }
    if gossip.has_member(&joiner) {
        debug!(%joiner, "join from existing member ignored");
        return None;
    }

    let mut changes = vec![Member::joining(joiner, roles)];
    for old in gossip.members_at(joiner.address) {
        if old.unique_address.uid < joiner.uid && !old.status.is_down_or_removed() {
            debug!(old = %old.unique_address, new = %joiner, "new incarnation replaces old one");
            if let Ok(down) = old.with_status(MemberStatus::Down) {
                changes.push(down);
            }
        }
    }
    Some(gossip.apply(changes, [], by, now_ms))
}

/// Moves `node` to `Leaving`. Only `Joining`, `WeaklyUp` and `Up` members
/// can leave; anything further along is left alone.
pub fn leave(gossip: &Gossip, node: &UniqueAddress, by: UniqueAddress, now_ms: u64) -> Option<Gossip> {
    let member = gossip.member(node)?;
    if !matches!(
        member.status,
        MemberStatus::Joining | MemberStatus::WeaklyUp | MemberStatus::Up
    ) {
        debug!(%node, status = %member.status, "leave ignored");
        return None;
    }
    let leaving = member.with_status(MemberStatus::Leaving).ok()?;
    Some(gossip.apply([leaving], [], by, now_ms))
}

/// Moves `node` to `Down`. A member that is already down is left alone.
pub fn down(gossip: &Gossip, node: &UniqueAddress, by: UniqueAddress, now_ms: u64) -> Option<Gossip> {
    let member = gossip.member(node)?;
    if member.status.is_down_or_removed() {
        debug!(%node, "down ignored, member already down");
        return None;
    }
    let downed = member.with_status(MemberStatus::Down).ok()?;
    Some(gossip.apply([downed], [], by, now_ms))
}

/// Inputs for one leader tick.
#[derive(Debug, Clone, Copy)]
pub struct LeaderContext {
    pub self_node: UniqueAddress,
    pub policy: ReachabilityPolicy,
    /// Joining members are not moved up until at least this many members
    /// are joining or up.
    pub min_nr_of_members: usize,
    /// True when convergence has been missing long enough to move
    /// reachable joining members to `WeaklyUp`.
    pub weakly_up_due: bool,
    pub now_ms: u64,
}

/// Result of a leader tick that changed something.
#[derive(Debug, Clone)]
pub struct LeaderActions {
    pub gossip: Gossip,
    /// Members deleted in this step. They no longer appear in the
    /// snapshot but should still be told about their removal.
    pub removed: Vec<Member>,
}

/// Runs the leader's batch of transitions.
///
/// Returns `None` if this node is not the leader or nothing is eligible.
/// Each member moves at most one step, and the whole batch becomes a
/// single new version.
/// The up number after `n`, or `None` once the range is used up.
/// `NOT_UP` is never handed out.
fn following_up_number(n: u32) -> Option<u32> {
    n.checked_add(1).filter(|next| *next != NOT_UP)
}

pub fn leader_actions(gossip: &Gossip, ctx: &LeaderContext, gate: &dyn ExitGate) -> Option<LeaderActions> {
    if gossip.leader(ctx.policy) != Some(ctx.self_node) {
        return None;
    }

    let unreachable = gossip.unreachable(ctx.policy);
    let mut changed = Vec::new();
    let mut removed = Vec::new();

    if gossip.has_converged(ctx.policy) {
        let enough_members = gossip
            .members()
            .filter(|m| {
                matches!(
                    m.status,
                    MemberStatus::Joining | MemberStatus::WeaklyUp | MemberStatus::Up
                )
            })
            .count()
            >= ctx.min_nr_of_members;
        let mut next_up = gossip.max_up_number().map_or(Some(0), following_up_number);

        for member in gossip.members() {
            let reachable = !unreachable.contains(&member.unique_address);
            match member.status {
                MemberStatus::Joining | MemberStatus::WeaklyUp if reachable && enough_members => {
                    let Some(up_number) = next_up else {
                        warn!(member = %member.unique_address, "up numbers exhausted, not promoting");
                        continue;
                    };
                    if let Ok(up) = member.with_up(up_number) {
                        next_up = following_up_number(up_number);
                        changed.push(up);
                    }
                }
                MemberStatus::Leaving if gate.ready_to_exit(member, gossip) => {
                    if let Ok(exiting) = member.with_status(MemberStatus::Exiting) {
                        changed.push(exiting);
                    }
                }
                MemberStatus::Exiting | MemberStatus::Down => {
                    removed.push(member.clone());
                }
                _ => {}
            }
        }
    } else if ctx.weakly_up_due {
        for member in gossip.members() {
            if member.status == MemberStatus::Joining && !unreachable.contains(&member.unique_address) {
                if let Ok(weakly_up) = member.with_status(MemberStatus::WeaklyUp) {
                    changed.push(weakly_up);
                }
            }
        }
    }

    if changed.is_empty() && removed.is_empty() {
        return None;
    }

    for m in &changed {
        debug!(member = %m.unique_address, status = %m.status, "leader moving member");
    }
    for m in &removed {
        debug!(member = %m.unique_address, "leader removing member");
    }

    let next = gossip.apply(
        changed,
        removed.iter().map(|m| m.unique_address).collect::<Vec<_>>(),
        ctx.self_node,
        ctx.now_ms,
    );
    Some(LeaderActions {
        gossip: next,
        removed,
    })
}
