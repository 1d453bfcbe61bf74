//! Integration tests for the Node public API.
//!
//! These tests exercise the accessors and lifecycle methods of a single
//! node, without relying on remote peers.

use std::time::Duration;

use skadnode::{
    DISCOVERY_SERVICE_ID, DispatchError, MessageEnvelope, Node, NodeConfig, NodeError, PeerId,
    RequestContext,
};
use tokio::time::timeout;

const TEST_TIMEOUT: Duration = Duration::from_secs(10);

fn config() -> NodeConfig {
    NodeConfig::local(4, 4)
}

async fn echo(envelope: MessageEnvelope) -> Result<Option<Vec<u8>>, DispatchError> {
    Ok(Some(envelope.payload))
}

#[tokio::test]
async fn node_bind_and_identity() {
    let node = timeout(TEST_TIMEOUT, Node::bind(config()))
        .await
        .expect("bind timed out")
        .expect("bind failed");

    assert_eq!(node.id(), node.identity().id());
    assert_eq!(node.id().to_hex().len(), 64, "peer id should be 64 hex chars");

    let public = node.public_identity();
    assert_eq!(public.id, node.id());
    assert!(public.verify(&node.config().puzzle), "identity should satisfy its own puzzle");

    assert!(node.local_addr().port() > 0, "port should be assigned");
    assert_eq!(node.advertised_addr(), node.local_addr().to_string());
}

#[tokio::test]
async fn advertise_addr_overrides_bound_addr() {
    let config = NodeConfig {
        advertise_addr: Some("203.0.113.9:7000".into()),
        ..config()
    };
    let node = Node::bind(config).await.expect("bind failed");
    assert_eq!(node.advertised_addr(), "203.0.113.9:7000");
}

#[tokio::test]
async fn invalid_config_rejected() {
    let config = NodeConfig {
        bucket_size: 0,
        ..config()
    };
    assert!(matches!(Node::bind(config).await, Err(NodeError::Config(_))));

    let config = NodeConfig {
        bind_addr: "not-an-address".into(),
        ..NodeConfig::local(4, 4)
    };
    assert!(matches!(Node::bind(config).await, Err(NodeError::Transport(_))));
}

#[tokio::test]
async fn fresh_node_knows_no_peers() {
    let node = Node::bind(config()).await.expect("bind failed");
    node.start().expect("start failed");

    assert!(node.peers().await.is_empty());
    assert_eq!(node.pending_requests(), 0);
    assert_eq!(node.connection_state(&PeerId::from_bytes([3; 32])), None);
    node.shutdown().await;
}

#[tokio::test]
async fn services_registered_before_start_only() {
    let node = Node::bind(config()).await.expect("bind failed");

    assert!(matches!(
        node.add_service(DISCOVERY_SERVICE_ID, echo),
        Err(NodeError::Config(_))
    ));
    node.add_service(100, echo).expect("first registration should succeed");
    assert!(matches!(node.add_service(100, echo), Err(NodeError::Config(_))));

    node.start().expect("start failed");
    assert!(matches!(node.add_service(200, echo), Err(NodeError::Config(_))));
    node.shutdown().await;
}

#[tokio::test]
async fn shutdown_is_idempotent_and_final() {
    let node = Node::bind(config()).await.expect("bind failed");
    node.start().expect("start failed");

    node.shutdown().await;
    node.shutdown().await;

    assert!(matches!(node.start(), Err(NodeError::Shutdown)));
    let result = node
        .request(RequestContext::new(), PeerId::from_bytes([1; 32]), 100, vec![])
        .await;
    assert!(matches!(result, Err(NodeError::Shutdown)));
    assert!(matches!(
        node.connect("127.0.0.1:1").await,
        Err(NodeError::Shutdown)
    ));
}

#[tokio::test]
async fn connect_to_closed_port_fails() {
    let config = NodeConfig {
        dial_timeout_ms: 500,
        ..config()
    };
    let node = Node::bind(config).await.expect("bind failed");
    node.start().expect("start failed");

    // Bind then drop a listener to get a port nobody is accepting on.
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap().to_string();
    drop(listener);

    let result = timeout(TEST_TIMEOUT, node.connect(&addr)).await.expect("connect hung");
    assert!(matches!(result, Err(NodeError::Transport(_))));
    node.shutdown().await;
}
