//! Cluster members and their lifecycle status.

use std::cmp::Reverse;
use std::collections::BTreeSet;

use crate::address::UniqueAddress;
use crate::error::{MembershipError, Result};

/// Sentinel `up_number` for members that have not been moved to `Up` yet.
pub const NOT_UP: u32 = u32::MAX;

/// Lifecycle status of a member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemberStatus {
    Joining,
    WeaklyUp,
    Up,
    Leaving,
    Exiting,
    Down,
    Removed,
}

impl MemberStatus {
    /// All statuses in lifecycle order.
    pub const ALL: [MemberStatus; 7] = [
        MemberStatus::Joining,
        MemberStatus::WeaklyUp,
        MemberStatus::Up,
        MemberStatus::Leaving,
        MemberStatus::Exiting,
        MemberStatus::Down,
        MemberStatus::Removed,
    ];

    /// Merge precedence. When two concurrent versions disagree on a
    /// member, the status with the higher precedence wins.
    pub fn precedence(self) -> u8 {
        match self {
            MemberStatus::Joining => 0,
            MemberStatus::WeaklyUp => 1,
            MemberStatus::Up => 2,
            MemberStatus::Leaving => 3,
            MemberStatus::Exiting => 4,
            MemberStatus::Down => 5,
            MemberStatus::Removed => 6,
        }
    }

    /// Returns true if the lifecycle allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: MemberStatus) -> bool {
        use MemberStatus::*;
        match self {
            Joining => matches!(next, WeaklyUp | Up | Leaving | Down | Removed),
            WeaklyUp => matches!(next, Up | Leaving | Down | Removed),
            Up => matches!(next, Leaving | Down | Removed),
            Leaving => matches!(next, Exiting | Down | Removed),
            Exiting => matches!(next, Removed | Down),
            Down => matches!(next, Removed),
            Removed => false,
        }
    }

    /// Statuses from which a leader may be elected.
    pub fn is_leader_eligible(self) -> bool {
        matches!(self, MemberStatus::Up | MemberStatus::Leaving)
    }

    /// Returns true for `Down` and `Removed`.
    pub fn is_down_or_removed(self) -> bool {
        matches!(self, MemberStatus::Down | MemberStatus::Removed)
    }
}

impl std::fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            MemberStatus::Joining => "joining",
            MemberStatus::WeaklyUp => "weakly-up",
            MemberStatus::Up => "up",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Exiting => "exiting",
            MemberStatus::Down => "down",
            MemberStatus::Removed => "removed",
        };
        f.write_str(s)
    }
}

/// A node's entry in the membership table.
///
/// Members are values: status changes produce a new `Member` rather than
/// mutating in place, which keeps gossip snapshots immutable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Member {
    pub unique_address: UniqueAddress,
    pub status: MemberStatus,
    pub roles: BTreeSet<String>,
    /// Order in which the leader moved this member to `Up`. Lower is older.
    pub up_number: u32,
}

impl Member {
    /// Creates a member in the `Joining` status.
    pub fn joining(unique_address: UniqueAddress, roles: BTreeSet<String>) -> Self {
        Self {
            unique_address,
            status: MemberStatus::Joining,
            roles,
            up_number: NOT_UP,
        }
    }

    /// Returns a copy with a new status, validating the transition.
    ///
    /// Setting the current status again is allowed and returns an
    /// identical copy.
    pub fn with_status(&self, status: MemberStatus) -> Result<Member> {
        if status == self.status {
            return Ok(self.clone());
        }
        if !self.status.can_transition_to(status) {
            return Err(MembershipError::illegal(self.status, status));
        }
        Ok(Member {
            status,
            ..self.clone()
        })
    }

    /// Returns a copy moved to `Up` with the given up number.
    pub fn with_up(&self, up_number: u32) -> Result<Member> {
        let mut up = self.with_status(MemberStatus::Up)?;
        up.up_number = up_number;
        Ok(up)
    }

    /// Returns true if this member was moved to `Up` before `other`.
    ///
    /// Ties (including two members that never reached `Up`) are broken by
    /// address so the relation is a strict total order.
    pub fn is_older_than(&self, other: &Member) -> bool {
        if self.up_number == other.up_number {
            self.unique_address < other.unique_address
        } else {
            self.up_number < other.up_number
        }
    }

    pub fn has_role(&self, role: &str) -> bool {
        self.roles.contains(role)
    }

    /// Picks the winner when two concurrent snapshots disagree about the
    /// same member: higher status precedence, then the older member.
    pub fn highest_priority_of<'a>(a: &'a Member, b: &'a Member) -> &'a Member {
        debug_assert_eq!(a.unique_address, b.unique_address);
        let key = |m: &Member| (m.status.precedence(), Reverse(m.up_number));
        match key(a).cmp(&key(b)) {
            std::cmp::Ordering::Greater => a,
            std::cmp::Ordering::Less => b,
            // identical in all but roles only if one side is corrupt;
            // pick deterministically so merge stays commutative
            std::cmp::Ordering::Equal => {
                if a.roles >= b.roles {
                    a
                } else {
                    b
                }
            }
        }
    }
}

impl std::fmt::Display for Member {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.unique_address, self.status)
    }
}
