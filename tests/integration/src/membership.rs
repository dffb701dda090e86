//! Lifecycle scenarios: founding, joining, leaving, downing and restarts.

use std::collections::BTreeSet;

use cohort_membership::{
    state_machine, Cluster, ClusterEvent, ClusterMessage, EventKind, InitialStateMode, LocalNetwork,
    MemberStatus, ShutdownReason, UniqueAddress,
};
use tokio::sync::oneshot;

use crate::helpers::{
    about, addr, collect_until, eventually, expect_event, fast_config, start_cluster, start_node,
    start_with, wait_for_status, within,
};

#[tokio::test]
async fn first_node_founds_singleton_cluster() {
    let net = LocalNetwork::new();
    let node = start_node(&net, 1, fast_config());
    let handle = node.handle();

    let (up_tx, up_rx) = oneshot::channel();
    handle
        .register_on_member_up(move || {
            let _ = up_tx.send(());
        })
        .await
        .unwrap();

    handle.join(addr(1)).await.unwrap();
    within("member up callback", up_rx).await.unwrap();

    let view = node.view();
    assert_eq!(view.self_status(), MemberStatus::Up);
    assert!(view.is_singleton_cluster());
    assert!(view.is_leader());
    node.stop().await;
}

#[tokio::test]
async fn joining_nodes_agree_on_members_and_leader() {
    let net = LocalNetwork::new();
    let nodes = start_cluster(&net, &[1, 2, 3], fast_config()).await;

    let expected: BTreeSet<UniqueAddress> = nodes.iter().map(|n| n.self_address()).collect();
    for node in &nodes {
        let seen: BTreeSet<UniqueAddress> = node
            .view()
            .members()
            .iter()
            .map(|m| m.unique_address)
            .collect();
        assert_eq!(seen, expected);
        assert_eq!(node.view().leader(), Some(nodes[0].self_address()));
    }

    let up_numbers: BTreeSet<u32> = nodes[2]
        .view()
        .members()
        .iter()
        .map(|m| m.up_number)
        .collect();
    assert_eq!(up_numbers.len(), 3, "every member gets its own up number");

    for node in nodes {
        node.stop().await;
    }
}

/// The leave-related steps recorded for the member at `address`.
fn leave_steps(events: &[ClusterEvent], address: std::net::SocketAddr) -> Vec<&'static str> {
    events
        .iter()
        .filter(|e| about(e, address))
        .filter_map(|e| match e {
            ClusterEvent::MemberLeft(_) => Some("left"),
            ClusterEvent::MemberExited(_) => Some("exited"),
            ClusterEvent::MemberRemoved { .. } => Some("removed"),
            _ => None,
        })
        .collect()
}

#[tokio::test]
async fn leader_leaves_and_remaining_node_takes_over() {
    let net = LocalNetwork::new();
    let mut nodes = start_cluster(&net, &[1, 2], fast_config()).await;
    let b = nodes.pop().unwrap();
    let a = nodes.pop().unwrap();

    let mut on_b = b
        .handle()
        .subscribe(InitialStateMode::NoInitialState, EventKind::ALL)
        .await
        .unwrap();
    let mut on_a = a
        .handle()
        .subscribe(InitialStateMode::NoInitialState, [EventKind::Member])
        .await
        .unwrap();

    let a_handle = a.handle();
    let completion = a_handle.leave(addr(1)).await.unwrap();
    // removal needs at least one gossip round with b
    assert!(!completion.is_completed());
    within("leave completion", completion.clone().wait()).await;

    // the leaver's own removal is published before its completion resolves,
    // so it is already queued here
    let mut on_a_seen = Vec::new();
    while let Some(event) = on_a.try_recv() {
        on_a_seen.push(event);
    }
    assert_eq!(leave_steps(&on_a_seen, addr(1)), ["left", "exited", "removed"]);

    let on_b_seen = collect_until(&mut on_b, |e| {
        matches!(e, ClusterEvent::MemberRemoved { member, .. } if member.unique_address.address == addr(1))
    })
    .await;
    assert_eq!(leave_steps(&on_b_seen, addr(1)), ["left", "exited", "removed"]);

    let again = a_handle.leave(addr(1)).await.unwrap();
    assert!(again.is_completed());

    let b_view = b.view().clone();
    let b_addr = b.self_address();
    eventually("b to lead alone", move || {
        let members = b_view.members();
        members.len() == 1 && members[0].status == MemberStatus::Up && b_view.leader() == Some(b_addr)
    })
    .await;

    let a_view = a.view().clone();
    eventually("a to stop", move || a_view.is_terminated()).await;
    let cs = a.coordinated_shutdown().clone();
    eventually("a to run coordinated shutdown", move || cs.is_finished()).await;
    assert_eq!(
        a.coordinated_shutdown().reason(),
        Some(ShutdownReason::ClusterLeaving)
    );

    within("a terminated", a.terminated()).await;
    b.stop().await;
}

#[tokio::test]
async fn leave_twice_resolves_both_handles() {
    let net = LocalNetwork::new();
    let mut nodes = start_cluster(&net, &[1, 2], fast_config()).await;
    let b = nodes.pop().unwrap();
    let a = nodes.pop().unwrap();

    let first = b.handle().leave(addr(2)).await.unwrap();
    let second = b.handle().leave(addr(2)).await.unwrap();
    within("first leave", first.wait()).await;
    within("second leave", second.wait()).await;

    let handle = b.handle();
    within("b terminated", b.terminated()).await;
    let late = handle.leave(addr(2)).await.unwrap();
    assert!(late.is_completed());

    let a_view = a.view().clone();
    eventually("b removed on a", move || a_view.is_singleton_cluster()).await;
    a.stop().await;
}

#[tokio::test]
async fn leaving_a_node_that_never_joined_resolves_immediately() {
    let net = LocalNetwork::new();
    let node = start_node(&net, 1, fast_config());
    let completion = node.handle().leave(addr(1)).await.unwrap();
    assert!(completion.is_completed());
    let elsewhere = node.handle().leave(addr(7)).await.unwrap();
    assert!(elsewhere.is_completed());
    node.stop().await;
}

#[tokio::test]
async fn downed_member_is_removed_without_leaving() {
    let net = LocalNetwork::new();
    let mut nodes = start_cluster(&net, &[1, 2], fast_config()).await;
    let b = nodes.pop().unwrap();
    let a = nodes.pop().unwrap();

    let mut events = a
        .handle()
        .subscribe(InitialStateMode::NoInitialState, EventKind::ALL)
        .await
        .unwrap();
    a.handle().down(addr(2)).await.unwrap();

    let seen = collect_until(&mut events, |e| {
        matches!(e, ClusterEvent::MemberRemoved { member, .. } if member.unique_address.address == addr(2))
    })
    .await;
    let about_b: Vec<&ClusterEvent> = seen.iter().filter(|e| about(e, addr(2))).collect();
    assert!(matches!(about_b[0], ClusterEvent::MemberDowned(_)));
    assert!(about_b
        .iter()
        .all(|e| !matches!(e, ClusterEvent::MemberLeft(_) | ClusterEvent::MemberExited(_))));
    assert!(matches!(
        about_b.last(),
        Some(ClusterEvent::MemberRemoved {
            previous_status: MemberStatus::Down,
            ..
        })
    ));

    let cs = b.coordinated_shutdown().clone();
    eventually("b to shut down", move || cs.is_finished()).await;
    assert_eq!(
        b.coordinated_shutdown().reason(),
        Some(ShutdownReason::ClusterDowning)
    );
    within("b terminated", b.terminated()).await;
    a.stop().await;
}

#[tokio::test]
async fn restarted_node_replaces_its_old_incarnation() {
    let net = LocalNetwork::new();
    let mut nodes = start_cluster(&net, &[1, 2], fast_config()).await;
    let b = nodes.pop().unwrap();
    let a = nodes.pop().unwrap();
    let old_b = b.self_address();
    b.stop().await;

    let restarted = start_with(
        &net,
        2,
        Cluster::builder(fast_config()).incarnation(old_b.uid + 1),
    );
    let new_b = restarted.self_address();
    restarted.handle().join(addr(1)).await.unwrap();

    let a_view = a.view().clone();
    eventually("new incarnation up, old one gone", move || {
        let members = a_view.members();
        members.len() == 2
            && members
                .iter()
                .any(|m| m.unique_address == new_b && m.status == MemberStatus::Up)
            && members.iter().all(|m| m.unique_address != old_b)
    })
    .await;

    restarted.stop().await;
    a.stop().await;
}

#[tokio::test]
async fn removed_member_is_not_resurrected_by_stale_messages() {
    let net = LocalNetwork::new();
    let mut nodes = start_cluster(&net, &[1, 2], fast_config()).await;
    let b = nodes.pop().unwrap();
    let a = nodes.pop().unwrap();
    let old_b = b.self_address();
    let a_node = a.self_address();

    let completion = b.handle().leave(addr(2)).await.unwrap();
    within("leave completion", completion.wait()).await;
    let a_view = a.view().clone();
    eventually("b removed", move || a_view.is_singleton_cluster()).await;

    // a snapshot from before the removal, as a delayed packet would carry it
    let stale = state_machine::join(
        &cohort_membership::Gossip::empty(),
        a_node,
        BTreeSet::new(),
        a_node,
        0,
    )
    .and_then(|g| state_machine::join(&g, old_b, BTreeSet::new(), old_b, 0))
    .unwrap()
    .with_seen(old_b);

    let handle = a.handle();
    handle
        .deliver(
            addr(2),
            ClusterMessage::Gossip {
                from: old_b,
                to: a_node,
                gossip: stale,
                reply: false,
            },
        )
        .await
        .unwrap();
    handle
        .deliver(
            addr(2),
            ClusterMessage::Join {
                node: old_b,
                roles: BTreeSet::new(),
            },
        )
        .await
        .unwrap();

    tokio::time::sleep(std::time::Duration::from_millis(300)).await;
    assert!(a.view().is_singleton_cluster());
    assert!(a.view().members().iter().all(|m| m.unique_address != old_b));

    within("b terminated", b.terminated()).await;
    a.stop().await;
}

#[tokio::test]
async fn join_is_retried_until_the_seed_answers() {
    let net = LocalNetwork::new();
    let a = start_node(&net, 1, fast_config());
    let b = start_node(&net, 2, fast_config());

    // the seed has not founded its cluster yet, so the first join is ignored
    b.handle().join(addr(1)).await.unwrap();
    tokio::time::sleep(std::time::Duration::from_millis(100)).await;
    a.handle().join(addr(1)).await.unwrap();

    wait_for_status(b.view(), addr(2), MemberStatus::Up).await;
    wait_for_status(a.view(), addr(2), MemberStatus::Up).await;

    let mut events = a
        .handle()
        .subscribe(InitialStateMode::InitialStateAsEvents, EventKind::ALL)
        .await
        .unwrap();
    expect_event(&mut events, |e| {
        matches!(e, ClusterEvent::MemberUp(m) if m.unique_address.address == addr(2))
    })
    .await;

    a.stop().await;
    b.stop().await;
}
