//! Synchronous read access to the latest adopted membership state.

use std::sync::{Arc, RwLock};

use crate::address::UniqueAddress;
use crate::events::CurrentClusterState;
use crate::member::{Member, MemberStatus};

#[derive(Debug)]
struct ViewState {
    state: CurrentClusterState,
    terminated: bool,
}

/// Cache of the cluster state as last adopted by the daemon.
///
/// Reads never block on the daemon and never touch the network; they may
/// lag the daemon by one update.
#[derive(Debug, Clone)]
pub struct ReadView {
    self_node: UniqueAddress,
    inner: Arc<RwLock<ViewState>>,
}

impl ReadView {
    pub(crate) fn new(self_node: UniqueAddress) -> Self {
        Self {
            self_node,
            inner: Arc::new(RwLock::new(ViewState {
                state: CurrentClusterState::default(),
                terminated: false,
            })),
        }
    }

    pub(crate) fn update(&self, state: CurrentClusterState) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.state = state;
    }

    pub(crate) fn mark_terminated(&self) {
        let mut guard = self.inner.write().unwrap_or_else(|e| e.into_inner());
        guard.terminated = true;
    }

    fn read<T>(&self, f: impl FnOnce(&ViewState) -> T) -> T {
        let guard = self.inner.read().unwrap_or_else(|e| e.into_inner());
        f(&guard)
    }

    pub fn self_address(&self) -> UniqueAddress {
        self.self_node
    }

    /// Full snapshot.
    pub fn state(&self) -> CurrentClusterState {
        self.read(|v| v.state.clone())
    }

    pub fn members(&self) -> Vec<Member> {
        self.read(|v| v.state.members.clone())
    }

    pub fn self_member(&self) -> Option<Member> {
        self.read(|v| v.state.member(&self.self_node).cloned())
    }

    /// Status of the local member. A node that has not joined yet, or that
    /// was removed, reports `Removed`.
    pub fn self_status(&self) -> MemberStatus {
        self.self_member()
            .map_or(MemberStatus::Removed, |m| m.status)
    }

    /// True when the cluster consists of exactly the local node.
    pub fn is_singleton_cluster(&self) -> bool {
        self.read(|v| {
            v.state.members.len() == 1 && v.state.members[0].unique_address == self.self_node
        })
    }

    pub fn leader(&self) -> Option<UniqueAddress> {
        self.read(|v| v.state.leader)
    }

    pub fn is_leader(&self) -> bool {
        self.leader() == Some(self.self_node)
    }

    pub fn role_leader(&self, role: &str) -> Option<UniqueAddress> {
        self.read(|v| v.state.role_leader(role))
    }

    pub fn unreachable(&self) -> Vec<Member> {
        self.read(|v| v.state.unreachable.clone())
    }

    /// True once the daemon has stopped.
    pub fn is_terminated(&self) -> bool {
        self.read(|v| v.terminated)
    }
}
