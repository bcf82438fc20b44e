//! Channel tests over the in-memory network

use std::sync::atomic::{AtomicUsize, Ordering};

use pretty_assertions::assert_eq;

use super::*;
use crate::consumer::{async_listener, sync_listener};
use crate::transport::{MemoryNetwork, TransportKind};

fn test_config(domain: &str, node_id: &str) -> ChannelConfig {
    ChannelConfig {
        domain: domain.to_string(),
        node_id: Some(node_id.to_string()),
        broadcast_provider: TransportKind::Memory,
        unicast_provider: TransportKind::Memory,
        start_delay_max: Duration::from_millis(10),
        publish_max_attempts: 1,
        publish_interval_min: Duration::from_millis(10),
        publish_interval_max: Duration::from_millis(20),
        ..Default::default()
    }
}

fn factory(network: &MemoryNetwork) -> TransportFactory {
    TransportFactory::new().with_memory_network(network.clone())
}

async fn started(network: &MemoryNetwork, domain: &str, node_id: &str) -> Arc<Channel> {
    let channel = Channel::new(test_config(domain, node_id), &factory(network)).unwrap();
    channel.start().await.unwrap();
    channel
}

async fn eventually(check: impl Fn() -> bool) -> bool {
    for _ in 0..200 {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}

fn counting(count: &Arc<AtomicUsize>) -> Arc<dyn AsyncListener> {
    let count = count.clone();
    async_listener(move |_event| {
        let count = count.clone();
        async move {
            count.fetch_add(1, Ordering::SeqCst);
        }
    })
}

#[derive(Default)]
struct Discovered(Mutex<Vec<NodeId>>);

impl DiscoveryListener for Discovered {
    fn on_discovered(&self, node_id: &NodeId, _address: &NodeAddress) {
        self.0.lock().push(node_id.clone());
    }
}

#[tokio::test]
async fn test_operations_require_start() {
    let network = MemoryNetwork::new();
    let channel = Channel::new(test_config("test", "a"), &factory(&network)).unwrap();
    let addr = NodeAddress::new("mem:99");

    assert_eq!(channel.state(), ChannelState::Created);
    assert!(channel.self_address().is_none());
    assert!(matches!(
        channel.send(&addr, "ping", Bytes::new(), Duration::from_millis(50)).await,
        Err(ChannelError::NotStarted)
    ));
    assert!(matches!(
        channel.dispatch("greet", Bytes::new()).await,
        Err(ChannelError::NotStarted)
    ));
    assert!(matches!(
        channel.force_resync_of(None).await,
        Err(ChannelError::NotStarted)
    ));

    // close() of a channel that never started does nothing
    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Created);
}

#[tokio::test]
async fn test_invalid_config_is_rejected() {
    let network = MemoryNetwork::new();
    let config = ChannelConfig {
        control_batch_size: 0,
        ..test_config("test", "a")
    };
    assert!(matches!(
        Channel::new(config, &factory(&network)),
        Err(ChannelError::Config(_))
    ));

    let no_network = Channel::new(test_config("test", "a"), &TransportFactory::new());
    assert!(matches!(no_network, Err(ChannelError::Transport(_))));
}

#[tokio::test]
async fn test_start_is_idempotent() {
    let network = MemoryNetwork::new();
    let channel = started(&network, "test", "a").await;
    let address = channel.self_address().unwrap();

    channel.start().await.unwrap();
    assert_eq!(channel.state(), ChannelState::Started);
    assert_eq!(channel.self_address(), Some(address));
    assert_eq!(channel.self_id(), &NodeId::from("a"));

    channel.close().await;
}

#[tokio::test]
async fn test_closed_channel_stays_closed() {
    let network = MemoryNetwork::new();
    let channel = started(&network, "test", "a").await;

    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Closed);
    assert!(matches!(channel.start().await, Err(ChannelError::Closed)));
    assert!(matches!(
        channel.register_async("greet", async_listener(|_event| async {})),
        Err(ChannelError::Consumer(ConsumerError::Stopped))
    ));
    assert!(matches!(
        channel.dispatch("greet", Bytes::new()).await,
        Err(ChannelError::Closed)
    ));

    channel.close().await;
    assert_eq!(channel.state(), ChannelState::Closed);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_two_nodes_discover_each_other() {
    let network = MemoryNetwork::new();
    let a = started(&network, "test", "a").await;
    let found = Arc::new(Discovered::default());
    a.add_discovery_listener(found.clone());

    let b = started(&network, "test", "b").await;

    assert_eq!(a.await_peers(Duration::from_secs(2), 1).await.unwrap(), 1);
    assert_eq!(b.await_peers(Duration::from_secs(2), 1).await.unwrap(), 1);
    assert_eq!(a.nodes()[0].node_id, NodeId::from("b"));
    assert_eq!(b.nodes()[0].address, a.self_address().unwrap());
    assert!(eventually(|| found.0.lock().contains(&NodeId::from("b"))).await);

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_shutdown_removes_peer_without_tombstone() {
    let network = MemoryNetwork::new();
    let a = started(&network, "test", "a").await;
    let b = started(&network, "test", "b").await;
    a.await_peers(Duration::from_secs(2), 1).await.unwrap();

    b.close().await;

    assert!(eventually(|| a.node_count() == 0).await);
    assert!(!a.is_node_dead(&NodeId::from("b")));
    a.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_publish_from_tombstoned_node_is_rejected() {
    let network = MemoryNetwork::new();
    let quiet = |node_id: &str| ChannelConfig {
        gossip_enabled: false,
        ..test_config("test", node_id)
    };
    let transports = factory(&network);
    let a = Channel::new(quiet("a"), &transports).unwrap();
    a.start().await.unwrap();
    let b = Channel::new(quiet("b"), &transports).unwrap();
    b.start().await.unwrap();
    a.await_peers(Duration::from_secs(2), 1).await.unwrap();

    let found = Arc::new(Discovered::default());
    a.add_discovery_listener(found.clone());
    let b_id = NodeId::from("b");
    assert!(a.view().remove_dead_node(&b_id));

    // A late PUBLISH from b, and b's DISCOVER answering a's own PUBLISH,
    // must not bring it back
    b.resync();
    b.force_resync_of(None).await.unwrap();
    tokio::time::sleep(Duration::from_millis(200)).await;

    assert!(a.is_node_dead(&b_id));
    assert_eq!(a.node_count(), 0);
    assert!(found.0.lock().is_empty());

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispatch_is_domain_scoped() {
    let network = MemoryNetwork::new();
    let a = started(&network, "test", "a").await;
    let b = started(&network, "test", "b").await;
    let c = started(&network, "other", "c").await;

    let seen_b = Arc::new(AtomicUsize::new(0));
    let seen_c = Arc::new(AtomicUsize::new(0));
    b.register_async("greet", counting(&seen_b)).unwrap();
    c.register_async("greet", counting(&seen_c)).unwrap();

    a.dispatch("greet", Bytes::from_static(b"hi")).await.unwrap();
    assert!(eventually(|| seen_b.load(Ordering::SeqCst) == 1).await);

    a.dispatch_to_domain("other", "greet", Bytes::new())
        .await
        .unwrap();
    assert!(eventually(|| seen_c.load(Ordering::SeqCst) == 1).await);

    a.dispatch_all_domains("greet", Bytes::new()).await.unwrap();
    assert!(eventually(|| {
        seen_b.load(Ordering::SeqCst) == 2 && seen_c.load(Ordering::SeqCst) == 2
    })
    .await);

    for channel in [a, b, c] {
        channel.close().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_dispatch_to_unknown_address_fails() {
    let network = MemoryNetwork::new();
    let a = started(&network, "test", "a").await;

    let result = a
        .dispatch_to(&NodeAddress::new("mem:404"), "greet", Bytes::new())
        .await;
    assert!(matches!(result, Err(ChannelError::Transport(_))));
    assert_eq!(a.metrics().dispatch_failures.get(), 1);

    a.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_send_to_nodes_skips_unknown_ids() {
    let network = MemoryNetwork::new();
    let a = started(&network, "test", "a").await;
    let b = started(&network, "test", "b").await;
    a.await_peers(Duration::from_secs(2), 1).await.unwrap();

    b.register_sync(
        "ping",
        sync_listener(|_event| async { Some(Bytes::from_static(b"PONG")) }),
    )
    .unwrap();

    let replies = a
        .send_to_nodes(
            &[NodeId::from("b"), NodeId::from("ghost")],
            "ping",
            Bytes::new(),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

    assert_eq!(replies.len(), 1);
    let reply = replies.get(0).unwrap();
    assert!(reply.is_ok());
    assert_eq!(reply.data(), Some(&Bytes::from_static(b"PONG")));

    a.close().await;
    b.close().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_force_resync_honors_targets() {
    let network = MemoryNetwork::new();
    let a = started(&network, "test", "a").await;
    let b = started(&network, "test", "b").await;
    b.await_peers(Duration::from_secs(2), 1).await.unwrap();

    let publishes = Arc::new(AtomicUsize::new(0));
    b.register_async(PUBLISH, counting(&publishes)).unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let baseline = publishes.load(Ordering::SeqCst);

    b.force_resync_of(Some(vec![NodeId::from("someone-else")]))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(publishes.load(Ordering::SeqCst), baseline);

    b.force_resync_of(Some(vec![NodeId::from("a")])).await.unwrap();
    assert!(eventually(|| publishes.load(Ordering::SeqCst) == baseline + 1).await);

    b.force_resync_of(None).await.unwrap();
    assert!(eventually(|| publishes.load(Ordering::SeqCst) == baseline + 2).await);

    a.close().await;
    b.close().await;
}

#[tokio::test]
async fn test_duplicate_sync_listener_is_rejected() {
    let network = MemoryNetwork::new();
    let a = started(&network, "test", "a").await;

    let listener = sync_listener(|_event| async { None });
    a.register_sync("ping", listener.clone()).unwrap();
    assert!(matches!(
        a.register_sync("ping", listener),
        Err(ChannelError::Consumer(ConsumerError::ListenerAlreadyRegistered(_)))
    ));
    // Failure detector traffic owns the control type
    assert!(a
        .register_sync(CONTROL, sync_listener(|_event| async { None }))
        .is_err());

    a.close().await;
}

#[tokio::test]
async fn test_registry_reuses_channels_by_domain() {
    let network = MemoryNetwork::new();
    let transports = factory(&network);
    let registry = Arc::new(ChannelRegistry::new());

    let first = registry
        .get_or_create(test_config("test", "a"), &transports)
        .await
        .unwrap();
    let again = registry
        .get_or_create(test_config("test", "b"), &transports)
        .await
        .unwrap();
    assert!(Arc::ptr_eq(&first, &again));

    let other = registry
        .get_or_create(test_config("other", "c"), &transports)
        .await
        .unwrap();
    assert!(!Arc::ptr_eq(&first, &other));

    let fresh = ChannelConfig {
        reuse_channels: false,
        ..test_config("test", "d")
    };
    let separate = registry.get_or_create(fresh, &transports).await.unwrap();
    assert!(!Arc::ptr_eq(&first, &separate));
    assert_eq!(registry.len(), 3);

    assert!(registry.find(|c| c.domain() == "other").is_some());

    registry.close_all().await;
    assert!(registry.is_empty());
    assert_eq!(first.state(), ChannelState::Closed);
    assert_eq!(other.state(), ChannelState::Closed);
}

#[tokio::test]
async fn test_close_leaves_registry() {
    let network = MemoryNetwork::new();
    let registry = Arc::new(ChannelRegistry::new());
    let channel = registry
        .get_or_create(test_config("test", "a"), &factory(&network))
        .await
        .unwrap();
    assert_eq!(registry.len(), 1);

    channel.close().await;
    assert!(registry.is_empty());
}
