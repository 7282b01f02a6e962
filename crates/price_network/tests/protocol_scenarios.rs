//! End-to-end scenarios over real TCP sockets on localhost.

use std::sync::Arc;
use std::time::Duration;

use price_network::{
    NetworkConfig, NodeEvent, NodeIdentity, PeerRole, PriceFact, PriceNode, ServerDirectory,
    SqliteStore, sync,
};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::broadcast::Receiver;

const WAIT: Duration = Duration::from_secs(5);

struct TestNode {
    node: PriceNode,
    store: Arc<SqliteStore>,
    _dir: tempfile::TempDir,
}

fn test_node(name: &str, configure: impl FnOnce(&mut NetworkConfig)) -> TestNode {
    let dir = tempfile::tempdir().unwrap();
    let mut config = NetworkConfig::default();
    config.node_name = name.into();
    config.bind_host = "127.0.0.1".into();
    config.heartbeat_interval = None;
    configure(&mut config);

    let store = Arc::new(SqliteStore::open_in_memory().unwrap());
    let node = PriceNode::new(
        NodeIdentity::generate(name),
        config,
        store.clone(),
        ServerDirectory::load(dir.path().join("servers.json")),
    );
    TestNode {
        node,
        store,
        _dir: dir,
    }
}

/// Start a server on a free port and return it with its port.
async fn server(name: &str) -> (TestNode, u16) {
    let node = test_node(name, |_| {});
    assert!(node.node.start_server(0).await);
    let port = node.node.local_addr().await.unwrap().port();
    (node, port)
}

/// Wait for the first event matching `pred`.
async fn wait_for(
    events: &mut Receiver<NodeEvent>,
    mut pred: impl FnMut(&NodeEvent) -> bool,
) -> NodeEvent {
    tokio::time::timeout(WAIT, async {
        loop {
            let event = events.recv().await.unwrap();
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("timed out waiting for event")
}

fn is_connected(event: &NodeEvent) -> bool {
    matches!(event, NodeEvent::PeerConnected(_))
}

fn is_disconnected(event: &NodeEvent) -> bool {
    matches!(event, NodeEvent::PeerDisconnected(_))
}

fn fact_in(item: &str, store: &str, state: &str, price: f64) -> PriceFact {
    let mut fact = PriceFact::new(item, store, price);
    fact.store_state = Some(state.into());
    fact
}

// ---------------------------------------------------------------------------
// Connections
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_client_connects_to_server_on_9500() {
    let server = test_node("server", |c| c.listen_port = 9500);
    let mut server_events = server.node.subscribe();
    assert!(server.node.start().await);

    let client = test_node("client", |_| {});
    let mut client_events = client.node.subscribe();
    assert!(client.node.connect("127.0.0.1", 9500).await);

    match wait_for(&mut server_events, is_connected).await {
        NodeEvent::PeerConnected(peer) => {
            assert_eq!(peer.role, PeerRole::Inbound);
            assert!(peer.id.as_str().starts_with("peer_"));
        }
        other => panic!("Expected PeerConnected, got {other:?}"),
    }
    match wait_for(&mut client_events, is_connected).await {
        NodeEvent::PeerConnected(peer) => {
            assert_eq!(peer.role, PeerRole::Outbound);
            assert_eq!(peer.id.as_str(), "127.0.0.1:9500");
        }
        other => panic!("Expected PeerConnected, got {other:?}"),
    }
    assert_eq!(server.node.peer_count().await, 1);
    assert_eq!(client.node.peer_count().await, 1);

    server.node.stop_server().await;
}

#[tokio::test]
async fn test_double_connect_creates_one_peer() {
    let (server, port) = server("server").await;
    let mut server_events = server.node.subscribe();
    let client = test_node("client", |_| {});

    assert!(client.node.connect("127.0.0.1", port).await);
    assert!(client.node.connect("127.0.0.1", port).await);
    wait_for(&mut server_events, is_connected).await;

    assert_eq!(client.node.peer_count().await, 1);
    assert_eq!(server.node.peer_count().await, 1);
    server.node.stop_server().await;
}

#[tokio::test]
async fn test_connect_refused_returns_false() {
    let client = test_node("client", |_| {});
    let mut events = client.node.subscribe();
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    drop(listener);

    assert!(!client.node.connect("127.0.0.1", port).await);
    assert_eq!(client.node.peer_count().await, 0);
    wait_for(&mut events, |e| matches!(e, NodeEvent::Error { .. })).await;
}

#[tokio::test]
async fn test_stop_server_empties_registry() {
    let (server, port) = server("server").await;
    let mut server_events = server.node.subscribe();

    let a = test_node("a", |_| {});
    let b = test_node("b", |_| {});
    let mut a_events = a.node.subscribe();
    assert!(a.node.connect("127.0.0.1", port).await);
    assert!(b.node.connect("127.0.0.1", port).await);
    wait_for(&mut server_events, is_connected).await;
    wait_for(&mut server_events, is_connected).await;
    assert_eq!(server.node.peer_count().await, 2);

    server.node.stop_server().await;
    assert_eq!(server.node.peer_count().await, 0);
    assert!(server.node.peers().await.is_empty());

    // The client sees the socket close.
    match wait_for(&mut a_events, is_disconnected).await {
        NodeEvent::PeerDisconnected(peer) => {
            assert_eq!(peer.state, price_network::PeerState::Disconnected)
        }
        other => panic!("Expected PeerDisconnected, got {other:?}"),
    }
    tokio::time::timeout(WAIT, async {
        while a.node.peer_count().await > 0 {
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .unwrap();
}

#[tokio::test]
async fn test_disconnect_notifies_both_sides() {
    let (server, port) = server("server").await;
    let mut server_events = server.node.subscribe();
    let client = test_node("client", |_| {});
    let mut client_events = client.node.subscribe();

    assert!(client.node.connect("127.0.0.1", port).await);
    wait_for(&mut server_events, is_connected).await;

    client.node.disconnect("127.0.0.1", port).await;
    wait_for(&mut client_events, is_disconnected).await;
    wait_for(&mut server_events, is_disconnected).await;
    assert_eq!(client.node.peer_count().await, 0);
    assert_eq!(server.node.peer_count().await, 0);

    // Unknown peers are ignored.
    client.node.disconnect("127.0.0.1", 1).await;
    server.node.stop_server().await;
}

// ---------------------------------------------------------------------------
// Price sharing & sync
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_price_share_creates_item_and_place() {
    let (server, port) = server("server").await;
    let mut server_events = server.node.subscribe();
    let client = test_node("client", |_| {});
    assert!(client.node.connect("127.0.0.1", port).await);
    wait_for(&mut server_events, is_connected).await;

    let report = client
        .node
        .share_price(PriceFact::new("Milk 2L", "Test Store", 3.20))
        .await
        .unwrap();
    assert_eq!(report.attempted, 1);
    assert_eq!(report.delivered, 1);

    match wait_for(&mut server_events, |e| matches!(e, NodeEvent::PriceReceived { .. })).await {
        NodeEvent::PriceReceived { fact, .. } => {
            assert_eq!(fact.item_name, "Milk 2L");
            assert!((fact.price - 3.20).abs() < f64::EPSILON);
        }
        other => panic!("Expected PriceReceived, got {other:?}"),
    }

    let stats = server.store.with_db(|db| db.stats()).unwrap();
    assert_eq!(stats.items, 1);
    assert_eq!(stats.places, 1);
    assert_eq!(stats.price_records, 1);
    server.node.stop_server().await;
}

#[tokio::test]
async fn test_region_sync_returns_matching_prices() {
    let (server, port) = server("server").await;
    for (item, shop, state, price) in [
        ("Milk 2L", "Coles Chatswood", "NSW", 3.10),
        ("Bread", "Woolworths Bondi", "NSW", 3.60),
        ("Eggs 12pk", "Aldi Ryde", "NSW", 5.20),
        ("Milk 2L", "Coles Richmond", "VIC", 3.20),
        ("Bread", "IGA Fitzroy", "VIC", 4.00),
    ] {
        sync::ingest_fact(server.store.as_ref(), &fact_in(item, shop, state, price)).unwrap();
    }

    let mut server_events = server.node.subscribe();
    let client = test_node("client", |_| {});
    let mut client_events = client.node.subscribe();
    assert!(client.node.connect("127.0.0.1", port).await);
    wait_for(&mut server_events, is_connected).await;

    let report = client.node.request_sync(Some("nsw")).await.unwrap();
    assert_eq!(report.delivered, 1);

    match wait_for(&mut client_events, |e| matches!(e, NodeEvent::SyncCompleted { .. })).await {
        NodeEvent::SyncCompleted {
            received, ingested, ..
        } => {
            assert_eq!(received, 3);
            assert_eq!(ingested, 3);
        }
        other => panic!("Expected SyncCompleted, got {other:?}"),
    }
    let stats = client.store.with_db(|db| db.stats()).unwrap();
    assert_eq!(stats.price_records, 3);
    server.node.stop_server().await;
}

#[tokio::test]
async fn test_point_to_point_sync() {
    let (server, port) = server("server").await;
    sync::ingest_fact(
        server.store.as_ref(),
        &fact_in("Milk 2L", "Coles Chatswood", "NSW", 3.10),
    )
    .unwrap();

    let mut server_events = server.node.subscribe();
    let client = test_node("client", |_| {});
    let mut client_events = client.node.subscribe();
    assert!(client.node.connect("127.0.0.1", port).await);
    wait_for(&mut server_events, is_connected).await;

    let peer = client.node.peers().await[0].id.clone();
    let query = price_network::SyncQuery::recent(Duration::from_secs(3600), None);
    client.node.request_sync_from(&peer, query).await.unwrap();

    match wait_for(&mut client_events, |e| matches!(e, NodeEvent::SyncCompleted { .. })).await {
        NodeEvent::SyncCompleted { from, received, .. } => {
            assert_eq!(from, peer);
            assert_eq!(received, 1);
        }
        other => panic!("Expected SyncCompleted, got {other:?}"),
    }
    server.node.stop_server().await;
}

#[tokio::test]
async fn test_broadcast_reaches_every_peer() {
    let (server, port) = server("server").await;
    let mut server_events = server.node.subscribe();

    let clients: Vec<TestNode> = (0..3).map(|i| test_node(&format!("c{i}"), |_| {})).collect();
    let mut client_events: Vec<_> = clients.iter().map(|c| c.node.subscribe()).collect();
    for client in &clients {
        assert!(client.node.connect("127.0.0.1", port).await);
        wait_for(&mut server_events, is_connected).await;
    }

    let report = server
        .node
        .share_price(PriceFact::new("Bananas 1kg", "Harris Farm", 3.90))
        .await
        .unwrap();
    assert_eq!(report.attempted, 3);
    assert_eq!(report.delivered, 3);
    for events in &mut client_events {
        wait_for(events, |e| matches!(e, NodeEvent::PriceReceived { .. })).await;
    }

    // One client goes away; the rest still get the next broadcast.
    clients[0].node.stop_server().await;
    wait_for(&mut server_events, is_disconnected).await;
    let report = server.node.send_heartbeat().await.unwrap();
    assert_eq!(report.attempted, 2);
    assert_eq!(report.delivered, 2);

    server.node.stop_server().await;
}

// ---------------------------------------------------------------------------
// Framing
// ---------------------------------------------------------------------------

const MILK_FRAME: &str = r#"{"type":"PriceShare","senderId":"raw","timestamp":"2026-01-05T10:00:00Z","payload":"{\"itemName\":\"Milk 2L\",\"storeName\":\"Test Store\",\"price\":3.2}"}"#;

#[tokio::test]
async fn test_malformed_frame_keeps_connection() {
    let (server, port) = server("server").await;
    let mut server_events = server.node.subscribe();

    let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for(&mut server_events, is_connected).await;

    // Garbage, then two frames in one write.
    let payload = format!("this is not json\n{MILK_FRAME}\n{MILK_FRAME}\n");
    raw.write_all(payload.as_bytes()).await.unwrap();

    for _ in 0..2 {
        wait_for(&mut server_events, |e| matches!(e, NodeEvent::PriceReceived { .. })).await;
    }
    assert_eq!(server.node.peer_count().await, 1);
    server.node.stop_server().await;
}

#[tokio::test]
async fn test_frame_split_across_writes() {
    let (server, port) = server("server").await;
    let mut server_events = server.node.subscribe();
    let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for(&mut server_events, is_connected).await;

    let (head, tail) = MILK_FRAME.split_at(40);
    raw.write_all(head.as_bytes()).await.unwrap();
    raw.flush().await.unwrap();
    tokio::time::sleep(Duration::from_millis(50)).await;
    raw.write_all(format!("{tail}\n").as_bytes()).await.unwrap();

    wait_for(&mut server_events, |e| matches!(e, NodeEvent::PriceReceived { .. })).await;
    server.node.stop_server().await;
}

#[tokio::test]
async fn test_legacy_numeric_type_is_accepted() {
    let (server, port) = server("server").await;
    let mut server_events = server.node.subscribe();
    let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for(&mut server_events, is_connected).await;

    let frame = MILK_FRAME.replace(r#""type":"PriceShare""#, r#""type":0"#);
    raw.write_all(format!("{frame}\n").as_bytes()).await.unwrap();

    wait_for(&mut server_events, |e| matches!(e, NodeEvent::PriceReceived { .. })).await;
    server.node.stop_server().await;
}

#[tokio::test]
async fn test_oversized_frame_closes_connection() {
    let server = test_node("server", |c| c.max_frame_len = 64);
    assert!(server.node.start_server(0).await);
    let port = server.node.local_addr().await.unwrap().port();
    let mut server_events = server.node.subscribe();

    let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for(&mut server_events, is_connected).await;
    raw.write_all(format!("{}\n", "x".repeat(500)).as_bytes())
        .await
        .unwrap();

    wait_for(&mut server_events, |e| matches!(e, NodeEvent::Error { .. })).await;
    wait_for(&mut server_events, is_disconnected).await;
    assert_eq!(server.node.peer_count().await, 0);
    server.node.stop_server().await;
}

#[tokio::test]
async fn test_invalid_utf8_frame_keeps_connection() {
    let (server, port) = server("server").await;
    let mut server_events = server.node.subscribe();
    let mut raw = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for(&mut server_events, is_connected).await;

    raw.write_all(b"{\"type\":\"Heartbeat\",\"payload\":\"\xff\xfe\"}\n")
        .await
        .unwrap();
    raw.write_all(format!("{MILK_FRAME}\n").as_bytes())
        .await
        .unwrap();

    wait_for(&mut server_events, |e| {
        assert!(!is_disconnected(e), "peer dropped after invalid UTF-8");
        matches!(e, NodeEvent::PriceReceived { .. })
    })
    .await;
    assert_eq!(server.node.peer_count().await, 1);
    server.node.stop_server().await;
}

// ---------------------------------------------------------------------------
// Slow peers
// ---------------------------------------------------------------------------

#[tokio::test]
async fn test_peer_that_never_reads_is_dropped() {
    let server = test_node("server", |c| c.write_timeout = Duration::from_millis(300));
    assert!(server.node.start_server(0).await);
    let port = server.node.local_addr().await.unwrap().port();
    let mut server_events = server.node.subscribe();

    // Connected, but never reads a byte.
    let _silent = TcpStream::connect(("127.0.0.1", port)).await.unwrap();
    wait_for(&mut server_events, is_connected).await;

    let mut fact = PriceFact::new("Bulk Rice 10kg", "Test Store", 19.0);
    fact.sale_description = Some("r".repeat(256 * 1024));

    let stalled = tokio::time::timeout(Duration::from_secs(30), async {
        for _ in 0..200 {
            let report = server.node.share_price(fact.clone()).await.unwrap();
            if !report.all_delivered() {
                return true;
            }
        }
        false
    })
    .await
    .expect("broadcast blocked on a peer that never reads");
    assert!(stalled);

    wait_for(&mut server_events, is_disconnected).await;
    assert_eq!(server.node.peer_count().await, 0);

    // Well-behaved peers are unaffected.
    let client = test_node("client", |_| {});
    let mut client_events = client.node.subscribe();
    assert!(client.node.connect("127.0.0.1", port).await);
    wait_for(&mut server_events, is_connected).await;
    let report = server
        .node
        .share_price(PriceFact::new("Milk 2L", "Test Store", 3.20))
        .await
        .unwrap();
    assert_eq!(report.delivered, 1);
    wait_for(&mut client_events, |e| matches!(e, NodeEvent::PriceReceived { .. })).await;

    server.node.stop_server().await;
}
