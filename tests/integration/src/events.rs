//! Subscriptions, initial state modes and callback registration.

use std::time::Duration;

use cohort_membership::{
    ClusterEvent, EventKind, InitialStateMode, LocalNetwork, MemberStatus,
};
use tokio::sync::{mpsc, oneshot};

use crate::helpers::{
    about, addr, collect_until, expect_event, fast_config, start_cluster, start_node,
    wait_for_status, within,
};

/// Rank of a member event along the lifecycle.
fn lifecycle_rank(event: &ClusterEvent) -> Option<u8> {
    match event {
        ClusterEvent::MemberJoined(_) => Some(0),
        ClusterEvent::MemberWeaklyUp(_) => Some(1),
        ClusterEvent::MemberUp(_) => Some(2),
        ClusterEvent::MemberLeft(_) => Some(3),
        ClusterEvent::MemberExited(_) => Some(4),
        ClusterEvent::MemberDowned(_) => Some(5),
        ClusterEvent::MemberRemoved { .. } => Some(6),
        _ => None,
    }
}

#[tokio::test]
async fn snapshot_mode_starts_with_current_state() {
    let net = LocalNetwork::new();
    let nodes = start_cluster(&net, &[1], fast_config()).await;

    let mut sub = nodes[0]
        .handle()
        .subscribe(InitialStateMode::InitialStateAsSnapshot, [EventKind::Member])
        .await
        .unwrap();
    match within("snapshot", sub.recv()).await {
        Some(ClusterEvent::CurrentClusterState(state)) => {
            assert_eq!(state.members.len(), 1);
            assert_eq!(state.members[0].status, MemberStatus::Up);
            assert_eq!(state.leader, Some(nodes[0].self_address()));
        }
        other => panic!("expected a snapshot first, got {other:?}"),
    }
}

#[tokio::test]
async fn events_mode_replays_history_as_events() {
    let net = LocalNetwork::new();
    let nodes = start_cluster(&net, &[1, 2], fast_config()).await;

    let mut sub = nodes[1]
        .handle()
        .subscribe(InitialStateMode::InitialStateAsEvents, EventKind::ALL)
        .await
        .unwrap();
    let mut up = Vec::new();
    let mut leader = None;
    while let Some(event) = sub.try_recv() {
        match event {
            ClusterEvent::MemberUp(m) => up.push(m.unique_address),
            ClusterEvent::LeaderChanged(l) => leader = l,
            ClusterEvent::CurrentClusterState(_) => panic!("events mode sends no snapshot"),
            _ => {}
        }
    }
    up.sort();
    assert_eq!(up, [nodes[0].self_address(), nodes[1].self_address()]);
    assert_eq!(leader, Some(nodes[0].self_address()));
}

#[tokio::test]
async fn no_initial_state_only_sees_later_changes() {
    let net = LocalNetwork::new();
    let a = start_node(&net, 1, fast_config());
    a.handle().join(addr(1)).await.unwrap();
    wait_for_status(a.view(), addr(1), MemberStatus::Up).await;

    let mut sub = a
        .handle()
        .subscribe(InitialStateMode::NoInitialState, [EventKind::Member])
        .await
        .unwrap();
    assert!(sub.try_recv().is_none());

    let b = start_node(&net, 2, fast_config());
    b.handle().join(addr(1)).await.unwrap();
    let joined = expect_event(&mut sub, |e| about(e, addr(2))).await;
    assert!(matches!(joined, ClusterEvent::MemberJoined(_)));
}

#[tokio::test]
async fn kind_filter_limits_delivery() {
    let net = LocalNetwork::new();
    let a = start_node(&net, 1, fast_config());
    let mut leaders = a
        .handle()
        .subscribe(InitialStateMode::NoInitialState, [EventKind::Leader])
        .await
        .unwrap();

    a.handle().join(addr(1)).await.unwrap();
    let event = within("leader event", leaders.recv()).await;
    assert_eq!(event, Some(ClusterEvent::LeaderChanged(Some(a.self_address()))));

    wait_for_status(a.view(), addr(1), MemberStatus::Up).await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    while let Some(event) = leaders.try_recv() {
        assert!(matches!(event, ClusterEvent::LeaderChanged(_)), "unexpected {event:?}");
    }
}

#[tokio::test]
async fn current_state_on_request() {
    let net = LocalNetwork::new();
    let nodes = start_cluster(&net, &[1, 2], fast_config()).await;

    let (tx, mut rx) = mpsc::unbounded_channel();
    nodes[0].handle().send_current_cluster_state(tx).await.unwrap();
    match within("current state", rx.recv()).await {
        Some(ClusterEvent::CurrentClusterState(state)) => {
            assert_eq!(state.members.len(), 2);
            assert!(state.unreachable.is_empty());
            assert!(state.seen_by.contains(&nodes[0].self_address()));
        }
        other => panic!("expected current state, got {other:?}"),
    }
}

#[tokio::test]
async fn unsubscribed_receiver_gets_nothing_more() {
    let net = LocalNetwork::new();
    let a = start_node(&net, 1, fast_config());
    let mut sub = a
        .handle()
        .subscribe(InitialStateMode::NoInitialState, EventKind::ALL)
        .await
        .unwrap();
    a.handle().unsubscribe(sub.id(), None).await.unwrap();

    a.handle().join(addr(1)).await.unwrap();
    wait_for_status(a.view(), addr(1), MemberStatus::Up).await;
    assert_eq!(within("closed subscription", sub.recv()).await, None);
}

#[tokio::test]
async fn member_events_follow_the_lifecycle() {
    let net = LocalNetwork::new();
    let a = start_node(&net, 1, fast_config());
    a.handle().join(addr(1)).await.unwrap();
    wait_for_status(a.view(), addr(1), MemberStatus::Up).await;

    let mut sub = a
        .handle()
        .subscribe(InitialStateMode::NoInitialState, [EventKind::Member])
        .await
        .unwrap();

    let b = start_node(&net, 2, fast_config());
    b.handle().join(addr(1)).await.unwrap();
    wait_for_status(a.view(), addr(2), MemberStatus::Up).await;
    b.handle().leave(addr(2)).await.unwrap();

    let events = collect_until(&mut sub, |e| {
        matches!(e, ClusterEvent::MemberRemoved { member, .. } if member.unique_address.address == addr(2))
    })
    .await;
    let ranks: Vec<u8> = events
        .iter()
        .filter(|e| about(e, addr(2)))
        .filter_map(lifecycle_rank)
        .collect();
    assert!(ranks.windows(2).all(|w| w[0] < w[1]), "out of order: {ranks:?}");
    assert_eq!(ranks.first(), Some(&0));
    assert_eq!(ranks.last(), Some(&6));

    within("b terminated", b.terminated()).await;
}

#[tokio::test]
async fn removal_callback_runs_once_daemon_stops() {
    let net = LocalNetwork::new();
    let a = start_node(&net, 1, fast_config());
    let handle = a.handle();

    let (tx, rx) = oneshot::channel();
    handle
        .register_on_member_removed(move || {
            let _ = tx.send(());
        })
        .await
        .unwrap();
    a.stop().await;
    within("removal callback", rx).await.unwrap();

    let (late_tx, late_rx) = oneshot::channel();
    handle
        .register_on_member_removed(move || {
            let _ = late_tx.send(());
        })
        .await
        .unwrap();
    within("late removal callback", late_rx).await.unwrap();
}

#[tokio::test]
async fn stats_are_published_when_enabled() {
    let net = LocalNetwork::new();
    let mut config = fast_config();
    config.publish_stats_interval = Some(Duration::from_millis(50));
    let nodes = start_cluster(&net, &[1, 2], config).await;

    let mut sub = nodes[0]
        .handle()
        .subscribe(InitialStateMode::NoInitialState, [EventKind::Stats])
        .await
        .unwrap();
    let event = expect_event(&mut sub, |e| {
        matches!(e, ClusterEvent::CurrentInternalStats(s) if s.received_gossip_count > 0)
    })
    .await;
    let ClusterEvent::CurrentInternalStats(stats) = event else {
        unreachable!()
    };
    assert_eq!(stats.member_count, 2);
    assert_eq!(stats.unreachable_count, 0);
}

#[tokio::test]
async fn shutting_down_is_announced() {
    let net = LocalNetwork::new();
    let nodes = start_cluster(&net, &[1], fast_config()).await;
    let mut sub = nodes[0]
        .handle()
        .subscribe(InitialStateMode::NoInitialState, [EventKind::Shutdown])
        .await
        .unwrap();

    let cs = nodes[0].coordinated_shutdown().clone();
    tokio::spawn(async move {
        cs.run(cohort_membership::ShutdownReason::ProcessExit).await;
    });
    expect_event(&mut sub, |e| matches!(e, ClusterEvent::ClusterShuttingDown)).await;
}
