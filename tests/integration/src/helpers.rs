//! Test helpers for running several cluster nodes on an in-process
//! network.

use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use cohort_membership::{
    Cluster, ClusterBuilder, ClusterEvent, LocalNetwork, MemberStatus, MembershipConfig,
    ReadView, Subscription,
};

/// Upper bound for anything a test waits on.
pub const WAIT: Duration = Duration::from_secs(10);

pub fn addr(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::LOCALHOST, port))
}

/// Protocol timings scaled down so multi-node scenarios finish quickly.
pub fn fast_config() -> MembershipConfig {
    MembershipConfig {
        gossip_interval: Duration::from_millis(50),
        leader_actions_interval: Duration::from_millis(50),
        periodic_tasks_initial_delay: Duration::from_millis(10),
        heartbeat_interval: Some(Duration::from_millis(50)),
        acceptable_heartbeat_pause: Duration::from_millis(500),
        retry_unsuccessful_join_after: Some(Duration::from_millis(200)),
        allow_weakly_up_members: None,
        leave_timeout: Duration::from_secs(3),
        ..MembershipConfig::default()
    }
}

/// Starts a node at `port` without joining anything.
pub fn start_node(net: &LocalNetwork, port: u16, config: MembershipConfig) -> Cluster {
    start_with(net, port, Cluster::builder(config))
}

pub fn start_with(net: &LocalNetwork, port: u16, builder: ClusterBuilder) -> Cluster {
    let (transport, inbound) = net.bind(addr(port));
    builder
        .start(Arc::new(transport), inbound)
        .expect("failed to start node")
}

/// Starts one node per port. The first founds the cluster, the rest join
/// it. Returns once every node sees every other one as `Up`.
pub async fn start_cluster(net: &LocalNetwork, ports: &[u16], config: MembershipConfig) -> Vec<Cluster> {
    let nodes: Vec<Cluster> = ports
        .iter()
        .map(|p| start_node(net, *p, config.clone()))
        .collect();

    let seed = addr(ports[0]);
    nodes[0].handle().join(seed).await.unwrap();
    wait_for_status(nodes[0].view(), seed, MemberStatus::Up).await;
    for node in &nodes[1..] {
        node.handle().join(seed).await.unwrap();
    }

    for node in &nodes {
        let view = node.view().clone();
        let expected = ports.len();
        eventually("all members up", move || {
            let members = view.members();
            members.len() == expected && members.iter().all(|m| m.status == MemberStatus::Up)
        })
        .await;
    }
    nodes
}

/// Polls `check` until it holds, panicking after [`WAIT`].
pub async fn eventually(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + WAIT;
    while !check() {
        if tokio::time::Instant::now() >= deadline {
            panic!("timed out waiting for {what}");
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Waits until the member at `address` has `status` in `view`.
pub async fn wait_for_status(view: &ReadView, address: SocketAddr, status: MemberStatus) {
    let view = view.clone();
    eventually(&format!("{address} to be {status}"), move || {
        view.members()
            .iter()
            .any(|m| m.unique_address.address == address && m.status == status)
    })
    .await;
}

/// Receives events until one matches `pred`, returning it. Panics on
/// timeout or when the subscription ends first.
pub async fn expect_event(
    sub: &mut Subscription,
    mut pred: impl FnMut(&ClusterEvent) -> bool,
) -> ClusterEvent {
    let found = tokio::time::timeout(WAIT, async {
        while let Some(event) = sub.recv().await {
            if pred(&event) {
                return Some(event);
            }
        }
        None
    })
    .await;
    match found {
        Ok(Some(event)) => event,
        Ok(None) => panic!("subscription closed before the expected event"),
        Err(_) => panic!("timed out waiting for event"),
    }
}

/// Collects events until `until` matches, including the matching one.
pub async fn collect_until(
    sub: &mut Subscription,
    mut until: impl FnMut(&ClusterEvent) -> bool,
) -> Vec<ClusterEvent> {
    let mut events = Vec::new();
    expect_event(sub, |e| {
        events.push(e.clone());
        until(e)
    })
    .await;
    events
}

/// Runs `fut` with the test timeout.
pub async fn within<T>(what: &str, fut: impl Future<Output = T>) -> T {
    match tokio::time::timeout(WAIT, fut).await {
        Ok(v) => v,
        Err(_) => panic!("timed out waiting for {what}"),
    }
}

/// True when the event concerns the member at `address`.
pub fn about(event: &ClusterEvent, address: SocketAddr) -> bool {
    event
        .member()
        .is_some_and(|m| m.unique_address.address == address)
}
