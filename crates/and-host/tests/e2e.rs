//! End-to-end tests for and-host.
//!
//! Runs full hosts against each other over the in-memory transport: opening
//! and joining worlds, peer requests, object sync, leaving and disconnects.

use std::sync::Arc;
use std::time::Duration;

use and_core::protocol::{DECLINE_NOT_FOUND, JOIN_CANCELLED};
use and_core::{IdentityHash, JoinState, MemoryNetwork, MemoryTransport, ObjectId, ObjectInfo};
use and_host::{
    EngineSettings, Host, HostConfig, HostError, PeerRequest, SimplePathResolver, World,
    WorldError, WorldEvent, WorldPeer,
};
use tokio::task::JoinHandle;
use tokio::time::timeout;

const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

/// A running host on the shared memory network.
struct TestNode {
    host: Host,
    resolver: Arc<SimplePathResolver>,
    transport: Arc<MemoryTransport>,
    serving: JoinHandle<Result<(), HostError>>,
}

impl TestNode {
    fn start(net: &MemoryNetwork, name: &str) -> Self {
        let transport = net.transport(name);
        let resolver = Arc::new(SimplePathResolver::new());
        let host = Host::new(fast_config(), transport.clone(), resolver.clone());
        let serving = tokio::spawn({
            let host = host.clone();
            async move { host.serve().await }
        });
        Self {
            host,
            resolver,
            transport,
            serving,
        }
    }

    fn identity(&self) -> IdentityHash {
        self.transport.hash()
    }

    /// Open a world and serve it at `path`.
    async fn open(&self, path: &str) -> World {
        let world = self.host.open_world(path).await.expect("open failed");
        self.resolver.set_mapping(path, world.session_id());
        world
    }

    async fn join(&self, host: &TestNode, path: &str) -> Result<World, HostError> {
        let url = host.host.local_url().with_path(path);
        self.host.join_world(&url, None).await
    }

    async fn stop(self) -> Result<(), HostError> {
        self.host.shutdown();
        timeout(EVENT_TIMEOUT, self.serving)
            .await
            .expect("Host did not stop")
            .expect("Host task panicked")
    }
}

fn fast_config() -> HostConfig {
    HostConfig {
        default_join_timeout_ms: 3000,
        engine: EngineSettings {
            join_retry_interval_ms: 100,
            heartbeat_interval_ms: 50,
            ..EngineSettings::default()
        },
        ..HostConfig::default()
    }
}

/// Wait for the first event matching `pred`, skipping others.
async fn wait_for<F>(world: &mut World, what: &str, pred: F) -> WorldEvent
where
    F: Fn(&WorldEvent) -> bool,
{
    timeout(EVENT_TIMEOUT, async {
        loop {
            match world.next_event().await {
                Some(event) if pred(&event) => return event,
                Some(_) => continue,
                None => panic!("World ended while waiting for {what}"),
            }
        }
    })
    .await
    .unwrap_or_else(|_| panic!("Timed out waiting for {what}"))
}

async fn expect_request(world: &mut World) -> PeerRequest {
    match wait_for(world, "peer request", |e| matches!(e, WorldEvent::PeerRequest(_))).await {
        WorldEvent::PeerRequest(request) => request,
        _ => unreachable!(),
    }
}

async fn expect_ready(world: &mut World, identity: IdentityHash) -> WorldPeer {
    let event = wait_for(world, "peer ready", |e| {
        matches!(e, WorldEvent::PeerReady(p) if *p.identity() == identity)
    })
    .await;
    match event {
        WorldEvent::PeerReady(peer) => peer,
        _ => unreachable!(),
    }
}

async fn expect_leave(world: &mut World, identity: IdentityHash) {
    wait_for(world, "peer leave", |e| {
        matches!(e, WorldEvent::PeerLeave(p) if *p.identity() == identity)
    })
    .await;
}

/// A opens `lobby`, B joins it and A accepts. Returns both worlds and each side's view of the other.
async fn joined_pair(a: &TestNode, b: &TestNode) -> (World, World, WorldPeer, WorldPeer) {
    let mut world_a = a.open("lobby").await;
    let joining = {
        let b_host = b.host.clone();
        let url = a.host.local_url().with_path("lobby");
        tokio::spawn(async move { b_host.join_world(&url, None).await })
    };

    let request = expect_request(&mut world_a).await;
    assert_eq!(*request.identity(), b.identity());
    request.accept().unwrap();

    let mut world_b = joining.await.unwrap().expect("join failed");
    let b_at_a = expect_ready(&mut world_a, b.identity()).await;
    let a_at_b = expect_ready(&mut world_b, a.identity()).await;
    (world_a, world_b, b_at_a, a_at_b)
}

// ==================== Join and objects ====================

#[tokio::test]
async fn test_open_join_accept_and_sync_objects() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");

    let (mut world_a, world_b, _b_at_a, a_at_b) = joined_pair(&a, &b).await;
    assert_eq!(world_b.text(), "lobby");

    let x = ObjectId::generate();
    a_at_b
        .append_objects(vec![ObjectInfo::new(x, "a://1")])
        .unwrap();

    match wait_for(&mut world_a, "object append", |e| {
        matches!(e, WorldEvent::ObjectAppend { .. })
    })
    .await
    {
        WorldEvent::ObjectAppend { peer, objects } => {
            assert_eq!(peer, b.identity());
            assert_eq!(objects, vec![ObjectInfo::new(x, "a://1")]);
        }
        _ => unreachable!(),
    }

    a_at_b.delete_objects(vec![x]).unwrap();
    match wait_for(&mut world_a, "object delete", |e| {
        matches!(e, WorldEvent::ObjectDelete { .. })
    })
    .await
    {
        WorldEvent::ObjectDelete { peer, object_ids } => {
            assert_eq!(peer, b.identity());
            assert_eq!(object_ids, vec![x]);
        }
        _ => unreachable!(),
    }

    assert!(a.stop().await.is_ok());
    assert!(b.stop().await.is_ok());
}

#[tokio::test]
async fn test_delete_of_unknown_object_is_silent() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");
    let (mut world_a, _world_b, _b_at_a, a_at_b) = joined_pair(&a, &b).await;

    a_at_b.delete_objects(vec![ObjectId::generate()]).unwrap();
    let quiet = timeout(Duration::from_millis(300), world_a.next_event()).await;
    assert!(quiet.is_err(), "Unexpected event: {:?}", quiet);

    assert!(a.host.pop_error().is_none());
}

#[tokio::test]
async fn test_join_missing_world_is_declined() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");

    let result = timeout(EVENT_TIMEOUT, b.join(&a, "nowhere"))
        .await
        .expect("join hung");
    match result {
        Err(HostError::JoinFailed { code, .. }) => assert_eq!(code, DECLINE_NOT_FOUND),
        other => panic!("Expected a decline, got {:?}", other),
    }
    assert_eq!(b.host.pending_join_count(), 0);
}

#[tokio::test]
async fn test_decline_reaches_joiner_and_second_answer_is_rejected() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");
    let mut world_a = a.open("lobby").await;

    let joining = {
        let b_host = b.host.clone();
        let url = a.host.local_url().with_path("lobby");
        tokio::spawn(async move { b_host.join_world(&url, None).await })
    };
    let request = expect_request(&mut world_a).await;
    request.decline(451, "invite only").unwrap();
    assert!(matches!(request.accept(), Err(WorldError::AlreadyResolved)));

    match joining.await.unwrap() {
        Err(HostError::JoinFailed { code, message }) => {
            assert_eq!(code, 451);
            assert_eq!(message, "invite only");
        }
        other => panic!("Expected a decline, got {:?}", other),
    }
    assert!(world_a.members().unwrap().is_empty());
}

// ==================== Deadlines ====================

#[tokio::test]
async fn test_join_deadline_cancels_and_late_accept_is_reset() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");
    let mut world_a = a.open("lobby").await;

    let url = a.host.local_url().with_path("lobby");
    let result = b
        .host
        .join_world(&url, Some(Duration::from_millis(200)))
        .await;
    match result {
        Err(HostError::JoinFailed { code, .. }) => assert_eq!(code, JOIN_CANCELLED),
        other => panic!("Expected cancellation, got {:?}", other),
    }
    assert_eq!(b.host.pending_join_count(), 0);
    assert_eq!(b.host.engine().world_count(), 0);

    // A only answers now; B has forgotten the join and resets A's entry.
    let request = expect_request(&mut world_a).await;
    request.accept().unwrap();
    expect_ready(&mut world_a, b.identity()).await;
    expect_leave(&mut world_a, b.identity()).await;
    assert!(world_a.members().unwrap().is_empty());
}

#[tokio::test]
async fn test_slow_accept_within_deadline_joins() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");
    let mut world_a = a.open("lobby").await;

    let joining = {
        let b_host = b.host.clone();
        let url = a.host.local_url().with_path("lobby");
        tokio::spawn(async move { b_host.join_world(&url, Some(Duration::from_secs(3))).await })
    };

    // Longer than five retry intervals, well inside the deadline.
    let request = expect_request(&mut world_a).await;
    tokio::time::sleep(Duration::from_millis(800)).await;
    request.accept().unwrap();

    let mut world_b = joining.await.unwrap().expect("join failed");
    expect_ready(&mut world_a, b.identity()).await;
    expect_ready(&mut world_b, a.identity()).await;
    assert_eq!(b.host.pending_join_count(), 0);
}

// ==================== Opening and leaving ====================

#[tokio::test]
async fn test_concurrent_opens_are_distinct() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");

    let (first, second) = tokio::join!(a.host.open_world("one"), a.host.open_world("two"));
    let (first, second) = (first.unwrap(), second.unwrap());

    assert_ne!(first.session_id(), second.session_id());
    assert_eq!(first.text(), "one");
    assert_eq!(second.text(), "two");
    assert_eq!(a.host.world_count(), 2);
}

#[tokio::test]
async fn test_leave_terminates_world_and_notifies_members() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");
    let (mut world_a, mut world_b, _b_at_a, _a_at_b) = joined_pair(&a, &b).await;

    a.host.leave_world(&world_a).unwrap();
    wait_for(&mut world_a, "terminate", |e| matches!(e, WorldEvent::Terminate)).await;
    assert!(world_a.next_event().await.is_none());
    assert!(!a.host.engine().is_open(world_a.session_id()));

    assert!(matches!(
        a.host.leave_world(&world_a),
        Err(HostError::InvalidArgument(_))
    ));

    expect_leave(&mut world_b, a.identity()).await;
    assert!(world_b.members().unwrap().is_empty());
}

// ==================== Connectivity ====================

#[tokio::test]
async fn test_disconnect_raises_peer_leave_in_every_world() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");
    let (mut lobby_a, _lobby_b, _b_at_a, _a_at_b) = joined_pair(&a, &b).await;

    let mut arena_a = a.open("arena").await;
    let joining = {
        let b_host = b.host.clone();
        let url = a.host.local_url().with_path("arena");
        tokio::spawn(async move { b_host.join_world(&url, None).await })
    };
    expect_request(&mut arena_a).await.accept().unwrap();
    let _arena_b = joining.await.unwrap().unwrap();
    expect_ready(&mut arena_a, b.identity()).await;

    net.disconnect(&a.identity(), &b.identity());

    expect_leave(&mut lobby_a, b.identity()).await;
    expect_leave(&mut arena_a, b.identity()).await;
}

#[tokio::test]
async fn test_third_node_is_introduced_to_existing_member() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");
    let c = TestNode::start(&net, "c");
    let (mut world_a, mut world_b, _b_at_a, _a_at_b) = joined_pair(&a, &b).await;

    let joining = {
        let c_host = c.host.clone();
        let url = a.host.local_url().with_path("lobby");
        tokio::spawn(async move { c_host.join_world(&url, None).await })
    };
    expect_request(&mut world_a).await.accept().unwrap();
    let mut world_c = joining.await.unwrap().expect("join failed");

    // The introducer is ready as soon as the join resolves; B follows via introduction.
    expect_ready(&mut world_c, a.identity()).await;
    expect_ready(&mut world_c, b.identity()).await;
    expect_ready(&mut world_b, c.identity()).await;

    let members = world_c.members().unwrap();
    assert_eq!(members.len(), 2);
    assert!(members.iter().all(|m| m.state == JoinState::Established));
    assert!(
        net.is_trusted(&c.identity(), &b.identity())
            || net.is_trusted(&b.identity(), &c.identity())
    );
}

#[tokio::test]
async fn test_content_channel_between_members() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");
    let _worlds = joined_pair(&a, &b).await;

    let mut at_a = a.host.content_channel(&b.identity()).await.unwrap();
    let mut at_b = timeout(EVENT_TIMEOUT, b.host.accept_content())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(*at_b.peer(), a.identity());

    at_a.send(b"chunk-1".to_vec()).unwrap();
    assert_eq!(at_b.recv().await.unwrap(), b"chunk-1");
    at_b.send(b"ack".to_vec()).unwrap();
    assert_eq!(at_a.recv().await.unwrap(), b"ack");
}

// ==================== Shutdown ====================

#[tokio::test]
async fn test_shutdown_resolves_pending_join() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let b = TestNode::start(&net, "b");
    let _world_a = a.open("lobby").await;

    let joining = {
        let b_host = b.host.clone();
        let url = a.host.local_url().with_path("lobby");
        tokio::spawn(async move { b_host.join_world(&url, Some(Duration::from_secs(30))).await })
    };
    tokio::time::sleep(Duration::from_millis(100)).await;

    let b_host = b.host.clone();
    assert!(b.stop().await.is_ok());

    let result = timeout(EVENT_TIMEOUT, joining).await.unwrap().unwrap();
    assert!(result.is_err());
    assert_eq!(b_host.pending_join_count(), 0);
    assert!(matches!(
        b_host.open_world("later").await,
        Err(HostError::Shutdown)
    ));
}

#[tokio::test]
async fn test_shutdown_ends_world_event_sequences() {
    let net = MemoryNetwork::new();
    let a = TestNode::start(&net, "a");
    let mut world = a.open("lobby").await;

    assert!(a.stop().await.is_ok());
    let end = timeout(EVENT_TIMEOUT, world.next_event()).await.unwrap();
    assert!(end.is_none());
}
