//! The cluster daemon and its public handle.
//!
//! One tokio task owns the gossip state. Everything that touches it,
//! whether an API call, an incoming message or a timer tick, is
//! processed in that task one at a time, so merges, leader actions and
//! event publication never interleave.

use std::collections::{BTreeSet, HashMap};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use rand::prelude::IndexedRandom;
use rand::Rng;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, trace, warn};

use crate::address::UniqueAddress;
use crate::config::MembershipConfig;
use crate::error::{MembershipError, Result};
use crate::events::{diff, ClusterEvent, CurrentClusterState, EventKind, GossipStats};
use crate::failure::{AutoDown, DeadlineFailureDetector, FailureDetector};
use crate::gossip::Gossip;
use crate::member::MemberStatus;
use crate::message::ClusterMessage;
use crate::publisher::{Callback, InitialStateMode, Publisher, SubscriberId, Subscription};
use crate::reachability::{ReachabilityPolicy, ReachabilityStatus};
use crate::shutdown::{CoordinatedShutdown, LeaveCompletion, LeaveTracker, Phase, ShutdownReason};
use crate::state_machine::{self, AlwaysReady, ExitGate, LeaderContext};
use crate::transport::{Inbound, Transport};
use crate::vclock::ClockOrdering;
use crate::view::ReadView;

/// Capacity of the daemon's command queue.
const COMMAND_BUFFER: usize = 256;

/// How many gossip rounds a removed member keeps being told about its
/// removal.
const REMOVED_NOTIFY_ROUNDS: u8 = 3;

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

enum ClusterCommand {
    Join(SocketAddr),
    JoinSeedNodes(Vec<SocketAddr>),
    Leave {
        address: SocketAddr,
        reply: oneshot::Sender<LeaveCompletion>,
    },
    Down(SocketAddr),
    Subscribe {
        mode: InitialStateMode,
        kinds: BTreeSet<EventKind>,
        reply: oneshot::Sender<Subscription>,
    },
    Unsubscribe {
        id: SubscriberId,
        kind: Option<EventKind>,
        reply: oneshot::Sender<()>,
    },
    SendCurrentState(mpsc::UnboundedSender<ClusterEvent>),
    OnMemberUp(Callback),
    OnMemberRemoved(Callback),
    ReportReachability {
        observer: SocketAddr,
        subject: SocketAddr,
        status: ReachabilityStatus,
    },
    Deliver(SocketAddr, ClusterMessage),
    ShuttingDown,
    Shutdown(oneshot::Sender<()>),
}

/// Cheap, cloneable handle for talking to a running cluster daemon.
///
/// Every method sends a command into the daemon's queue. Methods fail
/// with [`MembershipError::Terminated`] once the daemon has stopped,
/// except where noted.
#[derive(Clone)]
pub struct ClusterHandle {
    tx: mpsc::Sender<ClusterCommand>,
    view: ReadView,
    shutdown: CoordinatedShutdown,
}

impl std::fmt::Debug for ClusterHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ClusterHandle")
            .field("self_address", &self.view.self_address())
            .finish()
    }
}

impl ClusterHandle {
    pub fn self_address(&self) -> UniqueAddress {
        self.view.self_address()
    }

    pub fn view(&self) -> &ReadView {
        &self.view
    }

    pub fn coordinated_shutdown(&self) -> &CoordinatedShutdown {
        &self.shutdown
    }

    async fn send(&self, cmd: ClusterCommand) -> Result<()> {
        self.tx.send(cmd).await?;
        Ok(())
    }

    /// Joins the cluster that `address` belongs to. Joining the local
    /// address founds a new cluster.
    pub async fn join(&self, address: SocketAddr) -> Result<()> {
        self.send(ClusterCommand::Join(address)).await
    }

    /// Joins through the first seed that answers. If the local node is the
    /// first seed it founds the cluster instead.
    pub async fn join_seed_nodes(&self, seeds: Vec<SocketAddr>) -> Result<()> {
        self.send(ClusterCommand::JoinSeedNodes(seeds)).await
    }

    /// Asks the member at `address` to leave gracefully.
    ///
    /// The returned handle resolves when that member has been removed.
    /// For the local node it also resolves when the daemon stops, and on
    /// a stopped daemon it is already resolved.
    pub async fn leave(&self, address: SocketAddr) -> Result<LeaveCompletion> {
        let (reply, rx) = oneshot::channel();
        match self.send(ClusterCommand::Leave { address, reply }).await {
            Ok(()) => match rx.await {
                Ok(completion) => Ok(completion),
                Err(_) => Ok(LeaveCompletion::completed()),
            },
            Err(MembershipError::Terminated) => Ok(LeaveCompletion::completed()),
            Err(e) => Err(e),
        }
    }

    /// Marks the member at `address` as `Down`.
    pub async fn down(&self, address: SocketAddr) -> Result<()> {
        self.send(ClusterCommand::Down(address)).await
    }

    /// Subscribes to cluster events. An empty `kinds` means every kind.
    pub async fn subscribe(
        &self,
        mode: InitialStateMode,
        kinds: impl IntoIterator<Item = EventKind>,
    ) -> Result<Subscription> {
        let (reply, rx) = oneshot::channel();
        self.send(ClusterCommand::Subscribe {
            mode,
            kinds: kinds.into_iter().collect(),
            reply,
        })
        .await?;
        Ok(rx.await?)
    }

    /// Cancels a subscription, or one kind of it. Once this returns no
    /// further event is queued for the subscriber.
    pub async fn unsubscribe(&self, id: SubscriberId, kind: Option<EventKind>) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        self.send(ClusterCommand::Unsubscribe { id, kind, reply }).await?;
        Ok(rx.await?)
    }

    /// Sends one `CurrentClusterState` to `to`.
    pub async fn send_current_cluster_state(
        &self,
        to: mpsc::UnboundedSender<ClusterEvent>,
    ) -> Result<()> {
        self.send(ClusterCommand::SendCurrentState(to)).await
    }

    /// Runs `callback` once the local member is `Up`, or right away if it
    /// already is.
    pub async fn register_on_member_up(&self, callback: impl FnOnce() + Send + 'static) -> Result<()> {
        self.send(ClusterCommand::OnMemberUp(Box::new(callback))).await
    }

    /// Runs `callback` once the local member is removed or the daemon
    /// stops. On a stopped daemon it runs right away and this returns Ok.
    pub async fn register_on_member_removed(
        &self,
        callback: impl FnOnce() + Send + 'static,
    ) -> Result<()> {
        match self.tx.send(ClusterCommand::OnMemberRemoved(Box::new(callback))).await {
            Ok(()) => Ok(()),
            Err(mpsc::error::SendError(ClusterCommand::OnMemberRemoved(callback))) => {
                callback();
                Ok(())
            }
            Err(_) => Err(MembershipError::Terminated),
        }
    }

    /// Feeds an observation from an external failure detector. Only
    /// observations made by the local node are recorded.
    pub async fn report_reachability(
        &self,
        observer: SocketAddr,
        subject: SocketAddr,
        status: ReachabilityStatus,
    ) -> Result<()> {
        self.send(ClusterCommand::ReportReachability {
            observer,
            subject,
            status,
        })
        .await
    }

    /// Hands a message received by a custom transport to the daemon.
    pub async fn deliver(&self, from: SocketAddr, msg: ClusterMessage) -> Result<()> {
        self.send(ClusterCommand::Deliver(from, msg)).await
    }

    /// Stops the daemon without leaving. Idempotent.
    pub async fn shutdown(&self) -> Result<()> {
        let (reply, rx) = oneshot::channel();
        if self.send(ClusterCommand::Shutdown(reply)).await.is_err() {
            return Ok(());
        }
        let _ = rx.await;
        Ok(())
    }

    async fn notify_shutting_down(&self) {
        let _ = self.send(ClusterCommand::ShuttingDown).await;
    }
}

/// Configures and starts a [`Cluster`].
pub struct ClusterBuilder {
    config: MembershipConfig,
    exit_gate: Arc<dyn ExitGate>,
    failure_detector: Option<Box<dyn FailureDetector>>,
    coordinated_shutdown: Option<CoordinatedShutdown>,
    uid: Option<u64>,
}

impl ClusterBuilder {
    /// Hook consulted before leaving members move to `Exiting`.
    pub fn exit_gate(mut self, gate: Arc<dyn ExitGate>) -> Self {
        self.exit_gate = gate;
        self
    }

    /// Replaces the deadline failure detector. Only used when
    /// `heartbeat-interval` is enabled.
    pub fn failure_detector(mut self, fd: Box<dyn FailureDetector>) -> Self {
        self.failure_detector = Some(fd);
        self
    }

    /// Shares a coordinated shutdown with the host instead of creating one.
    pub fn coordinated_shutdown(mut self, cs: CoordinatedShutdown) -> Self {
        self.coordinated_shutdown = Some(cs);
        self
    }

    /// Uses a fixed incarnation number instead of a fresh one.
    pub fn incarnation(mut self, uid: u64) -> Self {
        self.uid = Some(uid);
        self
    }

    /// Spawns the daemon. Must be called within a tokio runtime.
    pub fn start(self, transport: Arc<dyn Transport>, inbound: Inbound) -> Result<Cluster> {
        self.config.validate()?;
        let config = self.config;

        let address = transport.local_address();
        let self_node = match self.uid {
            Some(uid) => UniqueAddress::new(address, uid),
            None => UniqueAddress::new_incarnation(address),
        };

        let shutdown = self
            .coordinated_shutdown
            .unwrap_or_else(|| CoordinatedShutdown::new(config.leave_timeout));
        let view = ReadView::new(self_node);
        let (tx, rx) = mpsc::channel(COMMAND_BUFFER);
        let handle = ClusterHandle {
            tx,
            view: view.clone(),
            shutdown: shutdown.clone(),
        };
        register_shutdown_tasks(&handle, &shutdown, config.leave_timeout);

        let failure_detector = config.heartbeat_interval.map(|interval| {
            self.failure_detector.unwrap_or_else(|| {
                Box::new(DeadlineFailureDetector::new(
                    interval,
                    config.acceptable_heartbeat_pause,
                ))
            })
        });

        let (auto_down_tx, auto_down_rx) = mpsc::unbounded_channel();
        let daemon = ClusterDaemon {
            self_node,
            transport,
            gossip: Gossip::empty(),
            publisher: Publisher::new(),
            view,
            leaves: HashMap::new(),
            self_leave: LeaveTracker::new(),
            leave_requested: false,
            auto_down: AutoDown::new(config.auto_down_unreachable_after, auto_down_tx),
            failure_detector,
            exit_gate: self.exit_gate,
            shutdown,
            stats: GossipStats::default(),
            join_attempt: None,
            not_converged_since: None,
            heartbeat_seq: 0,
            removed_notify: HashMap::new(),
            removed_as: None,
            shutting_down_published: false,
            stopped: false,
            config,
        };

        info!(node = %self_node, "starting cluster daemon");
        let task = tokio::spawn(daemon.run(rx, inbound, auto_down_rx));
        Ok(Cluster { handle, task })
    }
}

fn register_shutdown_tasks(handle: &ClusterHandle, cs: &CoordinatedShutdown, leave_timeout: Duration) {
    let h = handle.clone();
    cs.add_task(Phase::BeforeClusterShutdown, "cluster-shutting-down", move || async move {
        h.notify_shutting_down().await;
    });

    let h = handle.clone();
    cs.add_task(Phase::ClusterLeave, "leave-cluster", move || async move {
        let address = h.self_address().address;
        if let Ok(completion) = h.leave(address).await {
            if tokio::time::timeout(leave_timeout, completion.wait()).await.is_err() {
                warn!("leave did not complete within {leave_timeout:?}");
            }
        }
    });

    let h = handle.clone();
    cs.add_task(Phase::ClusterShutdown, "stop-cluster-daemon", move || async move {
        let _ = h.shutdown().await;
    });
}

/// A running membership node.
pub struct Cluster {
    handle: ClusterHandle,
    task: JoinHandle<()>,
}

impl Cluster {
    pub fn builder(config: MembershipConfig) -> ClusterBuilder {
        ClusterBuilder {
            config,
            exit_gate: Arc::new(AlwaysReady),
            failure_detector: None,
            coordinated_shutdown: None,
            uid: None,
        }
    }

    /// Starts a node with default collaborators.
    pub fn start(
        config: MembershipConfig,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
    ) -> Result<Cluster> {
        Self::builder(config).start(transport, inbound)
    }

    pub fn handle(&self) -> ClusterHandle {
        self.handle.clone()
    }

    pub fn view(&self) -> &ReadView {
        &self.handle.view
    }

    pub fn self_address(&self) -> UniqueAddress {
        self.handle.self_address()
    }

    pub fn coordinated_shutdown(&self) -> &CoordinatedShutdown {
        &self.handle.shutdown
    }

    /// Waits until the daemon has stopped, for whatever reason.
    pub async fn terminated(self) {
        if let Err(e) = self.task.await {
            warn!("cluster daemon task failed: {e}");
        }
    }

    /// Stops the daemon without leaving and waits for it.
    pub async fn stop(self) {
        let _ = self.handle.shutdown().await;
        self.terminated().await;
    }
}

struct JoinAttempt {
    seeds: Vec<SocketAddr>,
    last_sent: Instant,
}

struct ClusterDaemon {
    config: MembershipConfig,
    self_node: UniqueAddress,
    transport: Arc<dyn Transport>,
    gossip: Gossip,
    publisher: Publisher,
    view: ReadView,
    /// Leave handles for other members, resolved on their removal.
    leaves: HashMap<UniqueAddress, LeaveTracker>,
    self_leave: LeaveTracker,
    leave_requested: bool,
    auto_down: AutoDown,
    failure_detector: Option<Box<dyn FailureDetector>>,
    exit_gate: Arc<dyn ExitGate>,
    shutdown: CoordinatedShutdown,
    stats: GossipStats,
    join_attempt: Option<JoinAttempt>,
    not_converged_since: Option<Instant>,
    heartbeat_seq: u64,
    removed_notify: HashMap<UniqueAddress, u8>,
    /// Status the local member had when it was removed.
    removed_as: Option<MemberStatus>,
    shutting_down_published: bool,
    stopped: bool,
}

async fn tick_opt(interval: &mut Option<Interval>) {
    match interval {
        Some(i) => {
            i.tick().await;
        }
        None => std::future::pending().await,
    }
}

fn periodic(start: Instant, period: Duration) -> Interval {
    let mut i = interval_at(start, period);
    i.set_missed_tick_behavior(MissedTickBehavior::Delay);
    i
}

impl ClusterDaemon {
    async fn run(
        mut self,
        mut commands: mpsc::Receiver<ClusterCommand>,
        mut inbound: Inbound,
        mut auto_down_rx: mpsc::UnboundedReceiver<UniqueAddress>,
    ) {
        let start = Instant::now() + self.config.periodic_tasks_initial_delay;
        let mut gossip_tick = periodic(start, self.config.gossip_interval);
        let mut leader_tick = periodic(start, self.config.leader_actions_interval);
        let mut stats_tick = self.config.publish_stats_interval.map(|d| periodic(start, d));
        let mut heartbeat_tick = self.config.heartbeat_interval.map(|d| periodic(start, d));

        loop {
            tokio::select! {
                cmd = commands.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => self.stop(),
                },

                Some((from, msg)) = inbound.recv() => self.receive(from, msg),

                Some(node) = auto_down_rx.recv() => self.auto_down_fired(node),

                _ = gossip_tick.tick() => self.gossip_tick(),

                _ = leader_tick.tick() => self.leader_tick(),

                _ = tick_opt(&mut stats_tick) => self.publish_stats(),

                _ = tick_opt(&mut heartbeat_tick) => self.heartbeat_tick(),
            }

            if self.removed_as.is_some() {
                self.stop();
            }
            if self.stopped {
                break;
            }
        }
        debug!(node = %self.self_node, "cluster daemon loop exited");
    }

    fn policy(&self) -> ReachabilityPolicy {
        self.config.reachability_policy
    }

    fn is_member(&self) -> bool {
        self.gossip.has_member(&self.self_node)
    }

    fn self_status(&self) -> Option<MemberStatus> {
        self.gossip.member(&self.self_node).map(|m| m.status)
    }

    fn send(&self, to: SocketAddr, msg: ClusterMessage) {
        trace!(%to, "sending {}", msg.name());
        if let Err(e) = self.transport.send(to, msg) {
            debug!(%to, "send failed: {e}");
        }
    }

    // -- commands --

    fn handle_command(&mut self, cmd: ClusterCommand) {
        match cmd {
            ClusterCommand::Join(address) => self.join(vec![address]),
            ClusterCommand::JoinSeedNodes(seeds) => self.join(seeds),
            ClusterCommand::Leave { address, reply } => {
                let completion = self.leave(address);
                let _ = reply.send(completion);
            }
            ClusterCommand::Down(address) => self.down(address),
            ClusterCommand::Subscribe { mode, kinds, reply } => {
                let sub = self
                    .publisher
                    .subscribe(mode, kinds, &self.gossip, self.config.reachability_policy);
                let _ = reply.send(sub);
            }
            ClusterCommand::Unsubscribe { id, kind, reply } => {
                if !self.publisher.unsubscribe(id, kind) {
                    debug!(%id, "unsubscribe for unknown subscriber");
                }
                let _ = reply.send(());
            }
            ClusterCommand::SendCurrentState(to) => {
                let state = CurrentClusterState::from_gossip(&self.gossip, self.policy());
                let _ = to.send(ClusterEvent::CurrentClusterState(state));
            }
            ClusterCommand::OnMemberUp(callback) => {
                let already_up = self.self_status() == Some(MemberStatus::Up);
                self.publisher.on_member_up(callback, already_up);
            }
            ClusterCommand::OnMemberRemoved(callback) => {
                self.publisher.on_member_removed(callback, false);
            }
            ClusterCommand::ReportReachability {
                observer,
                subject,
                status,
            } => {
                if observer != self.self_node.address {
                    debug!(%observer, "ignoring reachability reported for another observer");
                    return;
                }
                let subjects: Vec<UniqueAddress> = self
                    .gossip
                    .members_at(subject)
                    .map(|m| m.unique_address)
                    .collect();
                for subject in subjects {
                    self.record_reachability(subject, status);
                }
            }
            ClusterCommand::Deliver(from, msg) => self.receive(from, msg),
            ClusterCommand::ShuttingDown => self.publish_shutting_down(),
            ClusterCommand::Shutdown(ack) => {
                info!(node = %self.self_node, "cluster daemon shutdown requested");
                self.stop();
                let _ = ack.send(());
            }
        }
    }

    fn join(&mut self, seeds: Vec<SocketAddr>) {
        if self.is_member() {
            debug!(node = %self.self_node, "already a member, join ignored");
            return;
        }
        if seeds.is_empty() {
            debug!("join without seed nodes ignored");
            return;
        }
        let own = self.self_node.address;
        if seeds.first() == Some(&own) {
            info!(node = %self.self_node, "founding new cluster");
            if let Some(next) = state_machine::join(
                &Gossip::empty(),
                self.self_node,
                self.config.roles.clone(),
                self.self_node,
                now_ms(),
            ) {
                self.join_attempt = None;
                self.adopt(next);
            }
            return;
        }

        let seeds: Vec<SocketAddr> = seeds.into_iter().filter(|s| *s != own).collect();
        info!(node = %self.self_node, ?seeds, "joining cluster");
        self.send_join(&seeds);
        self.join_attempt = Some(JoinAttempt {
            seeds,
            last_sent: Instant::now(),
        });
    }

    fn send_join(&self, seeds: &[SocketAddr]) {
        for seed in seeds {
            self.send(
                *seed,
                ClusterMessage::Join {
                    node: self.self_node,
                    roles: self.config.roles.clone(),
                },
            );
        }
    }

    fn leave(&mut self, address: SocketAddr) -> LeaveCompletion {
        let target = self
            .gossip
            .members_at(address)
            .filter(|m| !m.status.is_down_or_removed())
            .map(|m| m.unique_address)
            .max_by_key(|n| n.uid);

        if address == self.self_node.address {
            if !self.is_member() {
                debug!("leave requested before joining, nothing to do");
                self.self_leave.complete();
                return self.self_leave.handle();
            }
            self.leave_requested = true;
            if let Some(next) = state_machine::leave(&self.gossip, &self.self_node, self.self_node, now_ms()) {
                info!(node = %self.self_node, "leaving cluster");
                self.adopt(next);
                self.gossip_to_random_peer();
            }
            return self.self_leave.handle();
        }

        let Some(target) = target else {
            debug!(%address, "leave for non-member, nothing to do");
            return LeaveCompletion::completed();
        };
        if let Some(next) = state_machine::leave(&self.gossip, &target, self.self_node, now_ms()) {
            info!(member = %target, "marking member as leaving");
            self.adopt(next);
            self.gossip_to_random_peer();
        }
        self.leaves
            .entry(target)
            .or_insert_with(LeaveTracker::new)
            .handle()
    }

    fn down(&mut self, address: SocketAddr) {
        let targets: Vec<UniqueAddress> = self
            .gossip
            .members_at(address)
            .map(|m| m.unique_address)
            .collect();
        if targets.is_empty() {
            debug!(%address, "down for non-member ignored");
        }
        for target in targets {
            self.down_member(target);
        }
    }

    fn down_member(&mut self, target: UniqueAddress) {
        if let Some(next) = state_machine::down(&self.gossip, &target, self.self_node, now_ms()) {
            info!(member = %target, "marking member as down");
            self.adopt(next);
            self.gossip_to_random_peer();
        }
    }

    fn record_reachability(&mut self, subject: UniqueAddress, status: ReachabilityStatus) {
        if let Some(r) = self
            .gossip
            .reachability()
            .record(self.self_node, subject, status)
        {
            match status {
                ReachabilityStatus::Unreachable => info!(member = %subject, "marking member unreachable"),
                ReachabilityStatus::Reachable => info!(member = %subject, "marking member reachable"),
            }
            let next = self.gossip.with_reachability(r);
            self.adopt(next);
        }
    }

    fn auto_down_fired(&mut self, node: UniqueAddress) {
        let still_unreachable = self.gossip.unreachable(self.policy()).contains(&node);
        let live = self
            .gossip
            .member(&node)
            .is_some_and(|m| !m.status.is_down_or_removed());
        if still_unreachable && live {
            info!(member = %node, "auto-downing unreachable member");
            self.down_member(node);
        }
    }

    // -- messages --

    fn receive(&mut self, from: SocketAddr, msg: ClusterMessage) {
        let sender = msg.sender();
        if self.gossip.has_member(&sender) {
            if let Some(fd) = self.failure_detector.as_mut() {
                fd.heartbeat(sender, Instant::now());
            }
        }

        match msg {
            ClusterMessage::Join { node, roles } => self.receive_join(from, node, roles),
            ClusterMessage::Welcome { from: contact, gossip } => {
                self.receive_welcome(contact, gossip)
            }
            ClusterMessage::Gossip {
                from: sender,
                to,
                gossip,
                reply,
            } => self.receive_gossip(from, sender, to, gossip, reply),
            ClusterMessage::Heartbeat { from: sender, seq } => {
                if self.is_member() {
                    self.send(
                        from,
                        ClusterMessage::HeartbeatRsp {
                            from: self.self_node,
                            seq,
                        },
                    );
                }
                trace!(%sender, seq, "heartbeat");
            }
            ClusterMessage::HeartbeatRsp { from: sender, seq } => {
                trace!(%sender, seq, "heartbeat response");
            }
        }
    }

    fn receive_join(&mut self, from: SocketAddr, node: UniqueAddress, roles: BTreeSet<String>) {
        if !self.is_member() {
            debug!(%node, "join request while not a member, ignoring");
            return;
        }
        if self.removed_as.is_some() || self.stopped {
            return;
        }
        if let Some(next) =
            state_machine::join(&self.gossip, node, roles, self.self_node, now_ms())
        {
            info!(%node, "member joining");
            self.adopt(next);
        }
        if self.gossip.has_member(&node) {
            self.send(
                from,
                ClusterMessage::Welcome {
                    from: self.self_node,
                    gossip: self.gossip.clone(),
                },
            );
        }
    }

    fn receive_welcome(&mut self, contact: UniqueAddress, gossip: Gossip) {
        if self.is_member() {
            trace!(%contact, "duplicate welcome ignored");
            return;
        }
        if !gossip.has_member(&self.self_node) {
            debug!(%contact, "welcome does not contain this node, ignoring");
            return;
        }
        info!(%contact, "welcomed into cluster");
        let next = self.gossip.merge(&gossip).with_seen(self.self_node);
        self.join_attempt = None;
        self.adopt(next);
        self.send_gossip(contact, false);
    }

    fn receive_gossip(
        &mut self,
        from: SocketAddr,
        sender: UniqueAddress,
        to: UniqueAddress,
        incoming: Gossip,
        reply: bool,
    ) {
        if to != self.self_node {
            trace!(%sender, %to, "gossip for another incarnation ignored");
            return;
        }
        if self.gossip.is_tombstoned(&sender) {
            debug!(%sender, "gossip from removed member, telling it");
            if !reply {
                self.send(from, self.gossip_message(sender, true));
            }
            return;
        }
        let about_us = incoming.has_member(&self.self_node) || incoming.is_tombstoned(&self.self_node);
        if !about_us {
            debug!(%sender, "gossip not concerning this node ignored");
            return;
        }

        self.stats.received_gossip_count += 1;
        match incoming.version().compare(self.gossip.version()) {
            ClockOrdering::Same => self.stats.same_count += 1,
            ClockOrdering::After => self.stats.newer_count += 1,
            ClockOrdering::Before => self.stats.older_count += 1,
            ClockOrdering::Concurrent => self.stats.merge_count += 1,
        }

        let merged = self.gossip.merge(&incoming).with_seen(self.self_node);
        let answer = !reply && merged != incoming;
        self.adopt(merged);

        if answer && self.removed_as.is_none() {
            self.send(from, self.gossip_message(sender, true));
        }
    }

    fn gossip_message(&self, to: UniqueAddress, reply: bool) -> ClusterMessage {
        ClusterMessage::Gossip {
            from: self.self_node,
            to,
            gossip: self.gossip.clone(),
            reply,
        }
    }

    fn send_gossip(&self, to: UniqueAddress, reply: bool) {
        self.send(to.address, self.gossip_message(to, reply));
    }

    // -- state adoption --

    /// Installs a new snapshot and publishes what changed.
    fn adopt(&mut self, next: Gossip) {
        let old = std::mem::replace(&mut self.gossip, next);
        let policy = self.policy();
        let events = diff(&old, &self.gossip, policy);

        for event in &events {
            match event {
                ClusterEvent::UnreachableMember(_) | ClusterEvent::ReachableMember(_) => {
                    debug!("{event}")
                }
                _ => info!("{event}"),
            }
        }
        self.publisher.publish(&events);
        self.view
            .update(CurrentClusterState::from_gossip(&self.gossip, policy));

        let old_status = old.member(&self.self_node).map(|m| m.status);
        let new_status = self.self_status();

        if new_status.is_some() {
            self.join_attempt = None;
        }
        if new_status == Some(MemberStatus::Up) && old_status != Some(MemberStatus::Up) {
            self.publisher.self_up();
        }

        for event in &events {
            if let ClusterEvent::MemberRemoved { member, .. } = event {
                if let Some(tracker) = self.leaves.remove(&member.unique_address) {
                    tracker.complete();
                }
                if let Some(fd) = self.failure_detector.as_mut() {
                    fd.remove(&member.unique_address);
                }
            }
        }

        if let (Some(status), None) = (old_status, new_status) {
            info!(node = %self.self_node, previous = %status, "this node was removed from the cluster");
            self.removed_as = Some(status);
            return;
        }

        if new_status == Some(MemberStatus::Down) && old_status != Some(MemberStatus::Down) {
            warn!(node = %self.self_node, "this node was marked down");
            if self.config.run_coordinated_shutdown_when_down {
                let cs = self.shutdown.clone();
                tokio::spawn(async move { cs.run(ShutdownReason::ClusterDowning).await });
            }
        }

        let unreachable: BTreeSet<UniqueAddress> = self
            .gossip
            .unreachable(policy)
            .into_iter()
            .filter(|n| {
                self.gossip
                    .member(n)
                    .is_some_and(|m| !m.status.is_down_or_removed())
            })
            .collect();
        self.auto_down.update(&unreachable);
    }

    // -- periodic tasks --

    fn gossip_tick(&mut self) {
        if let Some(attempt) = &mut self.join_attempt {
            if let Some(retry) = self.config.retry_unsuccessful_join_after {
                if attempt.last_sent.elapsed() >= retry {
                    warn!(seeds = ?attempt.seeds, "join not acknowledged, retrying");
                    attempt.last_sent = Instant::now();
                    let seeds = attempt.seeds.clone();
                    self.send_join(&seeds);
                }
            }
        }

        let notify: Vec<UniqueAddress> = self.removed_notify.keys().copied().collect();
        for node in notify {
            self.send_gossip(node, false);
            if let Some(rounds) = self.removed_notify.get_mut(&node) {
                *rounds -= 1;
                if *rounds == 0 {
                    self.removed_notify.remove(&node);
                }
            }
        }

        if self.is_member() {
            self.gossip_to_random_peer();
        }
    }

    /// Gossips to one random live peer, preferring peers that have not
    /// seen the current version yet.
    fn gossip_to_random_peer(&self) {
        let peers: Vec<UniqueAddress> = self
            .gossip
            .members()
            .filter(|m| m.unique_address != self.self_node && m.status != MemberStatus::Removed)
            .map(|m| m.unique_address)
            .collect();
        let unseen: Vec<UniqueAddress> = peers
            .iter()
            .copied()
            .filter(|p| !self.gossip.seen_by(p))
            .collect();

        let mut rng = rand::rng();
        let pool = if !unseen.is_empty() && rng.random_bool(0.8) {
            &unseen
        } else {
            &peers
        };
        if let Some(target) = pool.choose(&mut rng) {
            self.send_gossip(*target, false);
        }
    }

    fn leader_tick(&mut self) {
        if !self.is_member() {
            return;
        }
        let policy = self.policy();
        let now = now_ms();

        let cutoff = now.saturating_sub(self.config.prune_gossip_tombstones_after.as_millis() as u64);
        let current = self.gossip.prune_tombstones(cutoff);
        if current.tombstones().len() != self.gossip.tombstones().len() {
            debug!(
                pruned = self.gossip.tombstones().len() - current.tombstones().len(),
                "pruned old tombstones"
            );
            self.gossip = current.clone();
        }

        if current.has_converged(policy) {
            self.not_converged_since = None;
        } else if self.not_converged_since.is_none() {
            self.not_converged_since = Some(Instant::now());
        }
        let weakly_up_due = match (self.config.allow_weakly_up_members, self.not_converged_since) {
            (Some(after), Some(since)) => since.elapsed() >= after,
            _ => false,
        };

        let ctx = LeaderContext {
            self_node: self.self_node,
            policy,
            min_nr_of_members: self.config.min_nr_of_members,
            weakly_up_due,
            now_ms: now,
        };
        let Some(actions) = state_machine::leader_actions(&current, &ctx, self.exit_gate.as_ref()) else {
            return;
        };

        for removed in &actions.removed {
            if removed.unique_address != self.self_node {
                self.removed_notify
                    .insert(removed.unique_address, REMOVED_NOTIFY_ROUNDS);
            }
        }
        self.adopt(actions.gossip);
        if self.removed_as.is_some() {
            return;
        }
        for removed in &actions.removed {
            self.send_gossip(removed.unique_address, false);
        }
        self.gossip_to_random_peer();
    }

    fn heartbeat_tick(&mut self) {
        if !self.is_member() {
            return;
        }
        let now = Instant::now();
        let peers: Vec<UniqueAddress> = self
            .gossip
            .members()
            .filter(|m| m.unique_address != self.self_node && !m.status.is_down_or_removed())
            .map(|m| m.unique_address)
            .collect();

        let Some(fd) = self.failure_detector.as_mut() else {
            return;
        };
        for peer in &peers {
            fd.monitor(*peer, now);
        }
        for monitored in fd.monitored() {
            if !peers.contains(&monitored) {
                fd.remove(&monitored);
            }
        }
        let verdicts: Vec<(UniqueAddress, bool)> = peers
            .iter()
            .map(|p| (*p, fd.is_available(p, now)))
            .collect();

        self.heartbeat_seq += 1;
        for peer in &peers {
            self.send(
                peer.address,
                ClusterMessage::Heartbeat {
                    from: self.self_node,
                    seq: self.heartbeat_seq,
                },
            );
        }

        for (peer, available) in verdicts {
            let status = if available {
                ReachabilityStatus::Reachable
            } else {
                ReachabilityStatus::Unreachable
            };
            self.record_reachability(peer, status);
        }
    }

    fn publish_stats(&mut self) {
        self.stats.member_count = self.gossip.member_count();
        self.stats.unreachable_count = self.gossip.unreachable(self.policy()).len();
        self.stats.version_size = self.gossip.version().len();
        self.publisher
            .publish(&[ClusterEvent::CurrentInternalStats(self.stats)]);
    }

    fn publish_shutting_down(&mut self) {
        if self.shutting_down_published {
            return;
        }
        self.shutting_down_published = true;
        self.publisher.publish(&[ClusterEvent::ClusterShuttingDown]);
    }

    /// Final cleanup. Safe to call more than once.
    fn stop(&mut self) {
        if self.stopped {
            return;
        }
        self.stopped = true;

        match self.removed_as {
            Some(MemberStatus::Down) => {
                if self.config.run_coordinated_shutdown_when_down {
                    let cs = self.shutdown.clone();
                    tokio::spawn(async move { cs.run(ShutdownReason::ClusterDowning).await });
                }
            }
            Some(_) => {
                let cs = self.shutdown.clone();
                tokio::spawn(async move { cs.run(ShutdownReason::ClusterLeaving).await });
            }
            None => {}
        }

        self.publish_shutting_down();
        self.self_leave.complete();
        for (_, tracker) in self.leaves.drain() {
            tracker.complete();
        }
        self.publisher.self_removed();
        self.publisher.close();
        self.auto_down.cancel_all();
        self.view.mark_terminated();
        info!(node = %self.self_node, leave_requested = self.leave_requested, "cluster daemon stopped");
    }
}
