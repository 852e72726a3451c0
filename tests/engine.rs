use meetlan_lib::{
    DiscoveryConfig, DiscoveryEngine, DiscoveryError, DiscoveryEvent, EngineState, EventKind,
    NodeIdentity,
};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;
use tokio::sync::mpsc;

fn fast_config(bootstrap_port: u16, comm_port: u16) -> DiscoveryConfig {
    DiscoveryConfig {
        bootstrap_address: Ipv4Addr::new(239, 255, 43, 121),
        bootstrap_port,
        comm_address: Ipv4Addr::new(239, 255, 43, 122),
        comm_port,
        heartbeat_interval_ms: 100,
        node_timeout_ms: 500,
        negotiation_timeout_ms: 200,
        ..Default::default()
    }
}

fn observe(engine: &DiscoveryEngine) -> mpsc::UnboundedReceiver<DiscoveryEvent> {
    let (tx, rx) = mpsc::unbounded_channel();
    engine.set_observer(move |event| {
        let _ = tx.send(event.clone());
    });
    rx
}

async fn next_event(
    rx: &mut mpsc::UnboundedReceiver<DiscoveryEvent>,
    kind: EventKind,
    within: Duration,
) -> Option<DiscoveryEvent> {
    tokio::time::timeout(within, async {
        while let Some(event) = rx.recv().await {
            if event.kind() == kind {
                return Some(event);
            }
        }
        None
    })
    .await
    .ok()
    .flatten()
}

#[test]
fn rejects_invalid_config() {
    let config = DiscoveryConfig {
        heartbeat_interval_ms: 1000,
        node_timeout_ms: 500,
        ..Default::default()
    };
    let result = DiscoveryEngine::new(NodeIdentity::new("a", "A"), config);
    assert!(matches!(result, Err(DiscoveryError::Config(_))));
}

#[test]
fn rejects_empty_node_id() {
    let result = DiscoveryEngine::new(NodeIdentity::new("", "A"), DiscoveryConfig::default());
    assert!(matches!(result, Err(DiscoveryError::Config(_))));
}

#[tokio::test]
async fn stopped_engine_is_empty_and_stop_is_a_no_op() {
    let engine = DiscoveryEngine::new(NodeIdentity::new("a", "A"), DiscoveryConfig::default())
        .unwrap();

    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(engine.members().is_empty());
    assert!(engine.transmit_target().is_none());

    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Stopped);
}

#[tokio::test]
#[ignore = "requires a multicast-capable interface"]
async fn start_is_idempotent_and_stop_clears_members() {
    let engine =
        DiscoveryEngine::new(NodeIdentity::new("a", "A"), fast_config(46110, 46111)).unwrap();

    engine.start().await.unwrap();
    engine.start().await.unwrap();
    assert_eq!(engine.state(), EngineState::Running);

    engine.stop().await;
    assert_eq!(engine.state(), EngineState::Stopped);
    assert!(engine.members().is_empty());

    // Restartable after a stop.
    engine.start().await.unwrap();
    assert!(engine.is_running());
    engine.stop().await;
}

#[tokio::test]
#[ignore = "requires a multicast-capable interface"]
async fn two_nodes_discover_each_other_and_say_goodbye() {
    let a = DiscoveryEngine::new(NodeIdentity::new("a", "A"), fast_config(46120, 46121)).unwrap();
    let b = DiscoveryEngine::new(NodeIdentity::new("b", "B"), fast_config(46120, 46121)).unwrap();
    let mut a_events = observe(&a);

    a.start().await.unwrap();
    b.start().await.unwrap();

    let joined = next_event(&mut a_events, EventKind::Joined, Duration::from_secs(2))
        .await
        .expect("a never saw b join");
    assert_eq!(joined.peer().unwrap().id, "b");
    assert!(a.member("b").is_some());
    assert!(a.members().iter().all(|peer| peer.id != "a"));

    b.stop().await;

    let left = next_event(&mut a_events, EventKind::Left, Duration::from_secs(2))
        .await
        .expect("a never saw b leave");
    assert_eq!(left.peer().unwrap().id, "b");
    assert!(a.member("b").is_none());

    a.stop().await;
}

#[tokio::test]
#[ignore = "requires a multicast-capable interface"]
async fn silent_node_times_out() {
    let config = DiscoveryConfig {
        announce_offline: false,
        ..fast_config(46130, 46131)
    };
    let a = DiscoveryEngine::new(NodeIdentity::new("a", "A"), config.clone()).unwrap();
    let b = DiscoveryEngine::new(NodeIdentity::new("b", "B"), config).unwrap();
    let mut a_events = observe(&a);

    a.start().await.unwrap();
    b.start().await.unwrap();
    next_event(&mut a_events, EventKind::Joined, Duration::from_secs(2))
        .await
        .expect("a never saw b join");

    // No Offline courtesy, so only the reaper can remove b.
    b.stop().await;
    let silent_since = tokio::time::Instant::now();
    let left = next_event(&mut a_events, EventKind::Left, Duration::from_secs(3))
        .await
        .expect("b was never evicted");

    assert!(matches!(
        left,
        DiscoveryEvent::Left {
            reason: meetlan_lib::LeaveReason::Timeout,
            ..
        }
    ));
    assert!(silent_since.elapsed() <= Duration::from_millis(900));

    a.stop().await;
}

#[tokio::test]
#[ignore = "requires a multicast-capable interface"]
async fn late_joiner_adopts_the_established_group() {
    let a = DiscoveryEngine::new(NodeIdentity::new("a", "A"), fast_config(46140, 46141)).unwrap();
    let b_config = DiscoveryConfig {
        comm_address: Ipv4Addr::new(239, 255, 43, 123),
        comm_port: 46142,
        ..fast_config(46140, 46141)
    };
    let b = DiscoveryEngine::new(NodeIdentity::new("b", "B"), b_config).unwrap();
    let mut b_events = observe(&b);

    // Nobody answers a, so it settles on its own group.
    a.start().await.unwrap();
    tokio::time::sleep(Duration::from_millis(400)).await;
    let established = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(239, 255, 43, 122), 46141));
    assert_eq!(a.transmit_target(), Some(established));

    b.start().await.unwrap();
    let negotiated = next_event(&mut b_events, EventKind::Negotiated, Duration::from_secs(2))
        .await
        .expect("b never negotiated");
    assert_eq!(
        negotiated,
        DiscoveryEvent::CommNegotiated {
            peer_id: "a".into(),
            comm: established,
        }
    );
    assert_eq!(b.transmit_target(), Some(established));

    // Both keep seeing each other on the shared group.
    tokio::time::sleep(Duration::from_millis(700)).await;
    assert!(a.member("b").is_some());
    assert!(b.member("a").is_some());

    b.stop().await;
    a.stop().await;
}
