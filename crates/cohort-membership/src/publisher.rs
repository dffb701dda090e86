//! Event dispatch to local subscribers and one-shot lifecycle callbacks.
//!
//! The publisher lives inside the daemon task, so subscribe, unsubscribe
//! and publish never race: once `unsubscribe` returns, the subscriber's
//! sender is dropped and nothing else can be queued for it.

use std::collections::{BTreeMap, BTreeSet};
use std::panic::{catch_unwind, AssertUnwindSafe};

use tokio::sync::mpsc;
use tracing::{debug, error};

use crate::events::{diff, ClusterEvent, CurrentClusterState, EventKind};
use crate::gossip::Gossip;
use crate::reachability::ReachabilityPolicy;

/// What a new subscriber receives before live events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitialStateMode {
    /// One `CurrentClusterState`, then live events.
    #[default]
    InitialStateAsSnapshot,
    /// The events that lead from an empty cluster to the current state.
    InitialStateAsEvents,
    /// Live events only.
    NoInitialState,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SubscriberId(u64);

impl std::fmt::Display for SubscriberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "sub-{}", self.0)
    }
}

/// Receiving end of a subscription.
///
/// `recv` returns `None` once the subscription was cancelled or the node
/// shut down and every queued event has been drained.
#[derive(Debug)]
pub struct Subscription {
    id: SubscriberId,
    rx: mpsc::UnboundedReceiver<ClusterEvent>,
}

impl Subscription {
    pub fn id(&self) -> SubscriberId {
        self.id
    }

    pub async fn recv(&mut self) -> Option<ClusterEvent> {
        self.rx.recv().await
    }

    pub fn try_recv(&mut self) -> Option<ClusterEvent> {
        self.rx.try_recv().ok()
    }
}

pub(crate) type Callback = Box<dyn FnOnce() + Send + 'static>;

struct Subscriber {
    tx: mpsc::UnboundedSender<ClusterEvent>,
    kinds: BTreeSet<EventKind>,
}

impl Subscriber {
    fn wants(&self, event: &ClusterEvent) -> bool {
        event.kind().map_or(true, |kind| self.kinds.contains(&kind))
    }
}

#[derive(Default)]
pub(crate) struct Publisher {
    subscribers: BTreeMap<SubscriberId, Subscriber>,
    next_id: u64,
    on_up: Vec<Callback>,
    on_removed: Vec<Callback>,
}

impl Publisher {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers a subscriber. An empty `kinds` set means every kind.
    pub fn subscribe(
        &mut self,
        mode: InitialStateMode,
        kinds: BTreeSet<EventKind>,
        current: &Gossip,
        policy: ReachabilityPolicy,
    ) -> Subscription {
        let kinds = if kinds.is_empty() {
            EventKind::ALL.into_iter().collect()
        } else {
            kinds
        };
        let (tx, rx) = mpsc::unbounded_channel();
        let subscriber = Subscriber { tx, kinds };

        match mode {
            InitialStateMode::InitialStateAsSnapshot => {
                let state = CurrentClusterState::from_gossip(current, policy);
                let _ = subscriber.tx.send(ClusterEvent::CurrentClusterState(state));
            }
            InitialStateMode::InitialStateAsEvents => {
                for event in diff(&Gossip::empty(), current, policy) {
                    if subscriber.wants(&event) {
                        let _ = subscriber.tx.send(event);
                    }
                }
            }
            InitialStateMode::NoInitialState => {}
        }

        let id = SubscriberId(self.next_id);
        self.next_id += 1;
        self.subscribers.insert(id, subscriber);
        debug!(%id, ?mode, "subscriber added");
        Subscription { id, rx }
    }

    /// Cancels a subscription, or just one kind of it. Returns false if
    /// the subscriber was already gone.
    pub fn unsubscribe(&mut self, id: SubscriberId, kind: Option<EventKind>) -> bool {
        match kind {
            None => self.subscribers.remove(&id).is_some(),
            Some(kind) => {
                let Some(sub) = self.subscribers.get_mut(&id) else {
                    return false;
                };
                sub.kinds.remove(&kind);
                if sub.kinds.is_empty() {
                    self.subscribers.remove(&id);
                }
                true
            }
        }
    }

    /// Delivers events in order to every interested subscriber. Subscribers
    /// whose receiver was dropped are forgotten.
    pub fn publish(&mut self, events: &[ClusterEvent]) {
        if events.is_empty() {
            return;
        }
        self.subscribers.retain(|id, sub| {
            for event in events.iter().filter(|e| sub.wants(e)) {
                if sub.tx.send(event.clone()).is_err() {
                    debug!(%id, "subscriber dropped, removing");
                    return false;
                }
            }
            true
        });
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.len()
    }

    /// Registers a callback for when the local member is up. Runs it
    /// right away if that already happened.
    pub fn on_member_up(&mut self, callback: Callback, already_up: bool) {
        if already_up {
            run_callback(callback);
        } else {
            self.on_up.push(callback);
        }
    }

    /// Registers a callback for when the local member is removed or the
    /// daemon stops. Runs it right away if that already happened.
    pub fn on_member_removed(&mut self, callback: Callback, already_removed: bool) {
        if already_removed {
            run_callback(callback);
        } else {
            self.on_removed.push(callback);
        }
    }

    pub fn self_up(&mut self) {
        for callback in self.on_up.drain(..) {
            run_callback(callback);
        }
    }

    /// Runs the removal callbacks. Pending up callbacks can never fire
    /// anymore and are dropped.
    pub fn self_removed(&mut self) {
        self.on_up.clear();
        for callback in self.on_removed.drain(..) {
            run_callback(callback);
        }
    }

    /// Drops every subscriber. Receivers drain what is queued and then
    /// observe the end of the stream.
    pub fn close(&mut self) {
        self.subscribers.clear();
    }
}

fn run_callback(callback: Callback) {
    if catch_unwind(AssertUnwindSafe(callback)).is_err() {
        error!("membership callback panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::address::UniqueAddress;
    use crate::member::Member;
    use std::net::{Ipv4Addr, SocketAddr};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    const POLICY: ReachabilityPolicy = ReachabilityPolicy::AnyObserver;

    fn node(port: u16) -> UniqueAddress {
        UniqueAddress::new(SocketAddr::from((Ipv4Addr::LOCALHOST, port)), 1)
    }

    fn singleton_up() -> Gossip {
        let m = Member::joining(node(1), BTreeSet::new()).with_up(0).unwrap();
        Gossip::empty().apply([m], [], node(1), 0)
    }

    #[test]
    fn snapshot_mode_sends_one_state() {
        let mut p = Publisher::new();
        let mut sub = p.subscribe(
            InitialStateMode::InitialStateAsSnapshot,
            BTreeSet::new(),
            &singleton_up(),
            POLICY,
        );
        match sub.try_recv() {
            Some(ClusterEvent::CurrentClusterState(state)) => {
                assert_eq!(state.members.len(), 1);
            }
            other => panic!("expected snapshot, got {other:?}"),
        }
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn events_mode_replays_member_up_first() {
        let mut p = Publisher::new();
        let mut sub = p.subscribe(
            InitialStateMode::InitialStateAsEvents,
            BTreeSet::new(),
            &singleton_up(),
            POLICY,
        );
        assert!(matches!(sub.try_recv(), Some(ClusterEvent::MemberUp(m)) if m.unique_address == node(1)));
        assert!(matches!(sub.try_recv(), Some(ClusterEvent::LeaderChanged(Some(_)))));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn kind_filter_applies() {
        let mut p = Publisher::new();
        let mut sub = p.subscribe(
            InitialStateMode::NoInitialState,
            BTreeSet::from([EventKind::Leader]),
            &Gossip::empty(),
            POLICY,
        );
        p.publish(&[
            ClusterEvent::ClusterShuttingDown,
            ClusterEvent::LeaderChanged(Some(node(1))),
        ]);
        assert_eq!(sub.try_recv(), Some(ClusterEvent::LeaderChanged(Some(node(1)))));
        assert!(sub.try_recv().is_none());
    }

    #[test]
    fn unsubscribe_stops_delivery_and_is_idempotent() {
        let mut p = Publisher::new();
        let mut sub = p.subscribe(
            InitialStateMode::NoInitialState,
            BTreeSet::new(),
            &Gossip::empty(),
            POLICY,
        );
        assert!(p.unsubscribe(sub.id(), None));
        assert!(!p.unsubscribe(sub.id(), None));
        p.publish(&[ClusterEvent::ClusterShuttingDown]);
        assert!(sub.try_recv().is_none());
        assert_eq!(p.subscriber_count(), 0);
    }

    #[test]
    fn unsubscribe_single_kind() {
        let mut p = Publisher::new();
        let mut sub = p.subscribe(
            InitialStateMode::NoInitialState,
            BTreeSet::from([EventKind::Leader, EventKind::Shutdown]),
            &Gossip::empty(),
            POLICY,
        );
        p.unsubscribe(sub.id(), Some(EventKind::Shutdown));
        p.publish(&[
            ClusterEvent::ClusterShuttingDown,
            ClusterEvent::LeaderChanged(None),
        ]);
        assert_eq!(sub.try_recv(), Some(ClusterEvent::LeaderChanged(None)));
        assert!(sub.try_recv().is_none());
        p.unsubscribe(sub.id(), Some(EventKind::Leader));
        assert_eq!(p.subscriber_count(), 0);
    }

    #[test]
    fn callbacks_fire_once() {
        let mut p = Publisher::new();
        let count = Arc::new(AtomicUsize::new(0));

        let c = count.clone();
        p.on_member_up(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }), false);
        assert_eq!(count.load(Ordering::SeqCst), 0);
        p.self_up();
        p.self_up();
        assert_eq!(count.load(Ordering::SeqCst), 1);

        // already up: runs immediately
        let c = count.clone();
        p.on_member_up(Box::new(move || {
            c.fetch_add(1, Ordering::SeqCst);
        }), true);
        assert_eq!(count.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn removal_drops_pending_up_callbacks() {
        let mut p = Publisher::new();
        let ups = Arc::new(AtomicUsize::new(0));
        let removals = Arc::new(AtomicUsize::new(0));

        let u = ups.clone();
        p.on_member_up(Box::new(move || {
            u.fetch_add(1, Ordering::SeqCst);
        }), false);
        let r = removals.clone();
        p.on_member_removed(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }), false);

        p.self_removed();
        p.self_up();
        assert_eq!(ups.load(Ordering::SeqCst), 0);
        assert_eq!(removals.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn panicking_callback_is_contained() {
        let mut p = Publisher::new();
        p.on_member_removed(Box::new(|| panic!("boom")), true);
    }

    #[tokio::test]
    async fn close_ends_streams_after_queued_events() {
        let mut p = Publisher::new();
        let mut sub = p.subscribe(
            InitialStateMode::NoInitialState,
            BTreeSet::new(),
            &Gossip::empty(),
            POLICY,
        );
        p.publish(&[ClusterEvent::ClusterShuttingDown]);
        p.close();
        assert_eq!(sub.recv().await, Some(ClusterEvent::ClusterShuttingDown));
        assert_eq!(sub.recv().await, None);
    }
}
