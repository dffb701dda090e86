//! Failure detection, reachability aggregation and auto-down.

use std::time::Duration;

use cohort_membership::{
    ClusterEvent, EventKind, InitialStateMode, LocalNetwork, MemberStatus, ReachabilityPolicy,
    ReachabilityStatus,
};

use crate::helpers::{
    about, addr, eventually, expect_event, fast_config, start_cluster, start_node, wait_for_status,
};

#[tokio::test]
async fn isolated_member_is_auto_downed_and_removed() {
    let net = LocalNetwork::new();
    let mut config = fast_config();
    config.auto_down_unreachable_after = Some(Duration::from_millis(300));
    let nodes = start_cluster(&net, &[1, 2], config).await;

    let mut events = nodes[0]
        .handle()
        .subscribe(InitialStateMode::NoInitialState, EventKind::ALL)
        .await
        .unwrap();
    net.isolate(addr(2));

    expect_event(&mut events, |e| {
        matches!(e, ClusterEvent::UnreachableMember(_)) && about(e, addr(2))
    })
    .await;
    expect_event(&mut events, |e| {
        matches!(e, ClusterEvent::MemberDowned(_)) && about(e, addr(2))
    })
    .await;
    expect_event(&mut events, |e| {
        matches!(e, ClusterEvent::MemberRemoved { .. }) && about(e, addr(2))
    })
    .await;
    assert!(nodes[0].view().is_singleton_cluster());
}

#[tokio::test]
async fn healed_member_becomes_reachable_again() {
    let net = LocalNetwork::new();
    let nodes = start_cluster(&net, &[1, 2], fast_config()).await;

    let mut events = nodes[0]
        .handle()
        .subscribe(InitialStateMode::NoInitialState, [EventKind::Reachability])
        .await
        .unwrap();
    net.partition(addr(1), addr(2));
    expect_event(&mut events, |e| matches!(e, ClusterEvent::UnreachableMember(_))).await;
    assert_eq!(nodes[0].view().unreachable().len(), 1);

    net.heal_all();
    expect_event(&mut events, |e| matches!(e, ClusterEvent::ReachableMember(_))).await;
    let view = nodes[0].view().clone();
    eventually("no unreachable members", move || view.unreachable().is_empty()).await;

    // without auto-down the member stays in the cluster throughout
    assert_eq!(nodes[0].view().members().len(), 2);
}

async fn single_report(policy: ReachabilityPolicy) -> Vec<cohort_membership::Cluster> {
    let net = LocalNetwork::new();
    let mut config = fast_config();
    config.heartbeat_interval = None;
    config.reachability_policy = policy;
    let nodes = start_cluster(&net, &[1, 2, 3], config).await;

    nodes[0]
        .handle()
        .report_reachability(addr(1), addr(3), ReachabilityStatus::Unreachable)
        .await
        .unwrap();
    nodes
}

#[tokio::test]
async fn any_observer_trusts_a_single_report() {
    let nodes = single_report(ReachabilityPolicy::AnyObserver).await;
    let view = nodes[1].view().clone();
    eventually("report to spread", move || {
        view.unreachable()
            .iter()
            .any(|m| m.unique_address.address == addr(3))
    })
    .await;
}

#[tokio::test]
async fn quorum_needs_a_majority_of_observers() {
    let nodes = single_report(ReachabilityPolicy::Quorum).await;

    // give the single report time to spread; one of two voters is no majority
    tokio::time::sleep(Duration::from_millis(300)).await;
    for node in &nodes {
        assert!(node.view().unreachable().is_empty());
    }

    nodes[1]
        .handle()
        .report_reachability(addr(2), addr(3), ReachabilityStatus::Unreachable)
        .await
        .unwrap();
    for node in &nodes[..2] {
        let view = node.view().clone();
        eventually("majority verdict", move || {
            view.unreachable()
                .iter()
                .any(|m| m.unique_address.address == addr(3))
        })
        .await;
    }
}

#[tokio::test]
async fn reports_on_behalf_of_other_nodes_are_ignored() {
    let net = LocalNetwork::new();
    let mut config = fast_config();
    config.heartbeat_interval = None;
    let nodes = start_cluster(&net, &[1, 2], config).await;

    nodes[0]
        .handle()
        .report_reachability(addr(2), addr(1), ReachabilityStatus::Unreachable)
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert!(nodes[0].view().unreachable().is_empty());
    assert!(nodes[1].view().unreachable().is_empty());
}

#[tokio::test]
async fn unreachable_member_does_not_block_new_joiners() {
    let net = LocalNetwork::new();
    let mut config = fast_config();
    config.heartbeat_interval = None;
    let nodes = start_cluster(&net, &[1, 2], config.clone()).await;

    net.isolate(addr(2));
    nodes[0]
        .handle()
        .report_reachability(addr(1), addr(2), ReachabilityStatus::Unreachable)
        .await
        .unwrap();

    let c = start_node(&net, 3, config);
    c.handle().join(addr(1)).await.unwrap();
    wait_for_status(nodes[0].view(), addr(3), MemberStatus::Up).await;
    wait_for_status(c.view(), addr(3), MemberStatus::Up).await;
}
