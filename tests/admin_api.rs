//! Admin API served over TCP, exercised through the admin client

use std::sync::Arc;
use std::time::Duration;
use vnetdir::client::AdminClient;
use vnetdir::migration::MigrationKind;
use vnetdir::server::http::create_router;
use vnetdir::transport::MemoryNetwork;
use vnetdir::{Config, DirectoryNode, DomainId, Error, MemoryDomainStore, NodeAddr, NodeHandle};

fn addr(s: &str) -> NodeAddr {
    s.parse().unwrap()
}

async fn serve_node() -> (NodeHandle, AdminClient) {
    let mut config = Config::default();
    config.node.address = "10.0.0.1".to_string();
    config.node.peers = vec!["10.0.0.2".to_string()];

    let net = MemoryNetwork::new();
    let (transport, inbox) = net.register(addr("10.0.0.1"));
    let node = DirectoryNode::new(
        config,
        Arc::new(MemoryDomainStore::new()),
        Arc::new(transport),
    )
    .unwrap();
    let (handle, _tasks) = node.spawn();
    handle.spawn_inbox(inbox);

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let local = listener.local_addr().unwrap();
    let router = create_router(handle.clone());
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let client = AdminClient::new(format!("http://{}", local), Duration::from_secs(5))
        .unwrap()
        .with_attempts(1);
    (handle, client)
}

fn api_status(err: Error) -> u16 {
    match err {
        Error::Api { status, .. } => status,
        other => panic!("expected an API error, got {other:?}"),
    }
}

#[tokio::test]
async fn test_health_and_status() {
    let (handle, client) = serve_node().await;

    let health = client.health().await.unwrap();
    assert_eq!(health["status"], "ok");

    let status = client.status().await.unwrap();
    assert_eq!(status.node, addr("10.0.0.1"));
    assert!(status.local_active);
    assert_eq!(status.migrations, 0);
    assert_eq!(status.active_weight, 0);
    assert!(status.nodes.iter().any(|n| n.addr == addr("10.0.0.2")));

    let metrics = client.metrics().await.unwrap();
    assert!(metrics.contains("vnetdir_ticks_total"));
    handle.shutdown();
}

#[tokio::test]
async fn test_domain_lifecycle() {
    let (handle, client) = serve_node().await;

    client.host_domain(DomainId(5), 2).await.unwrap();
    let domain = client.domain(DomainId(5)).await.unwrap();
    assert_eq!(domain.replication_factor, 2);
    assert_eq!(domain.hosts, vec![addr("10.0.0.1")]);
    assert!(client
        .domains()
        .await
        .unwrap()
        .iter()
        .any(|d| d.domain == DomainId(5)));

    let err = client.host_domain(DomainId(6), 0).await.unwrap_err();
    assert_eq!(api_status(err), 400);

    client.delete_domain(DomainId(5)).await.unwrap();
    let err = client.domain(DomainId(5)).await.unwrap_err();
    assert_eq!(api_status(err), 404);
    let err = client.delete_domain(DomainId(5)).await.unwrap_err();
    assert_eq!(api_status(err), 404);
    handle.shutdown();
}

#[tokio::test]
async fn test_node_administration() {
    let (handle, client) = serve_node().await;

    client.add_node("10.0.0.9").await.unwrap();
    let node = client.node("10.0.0.9").await.unwrap();
    assert_eq!(node.addr, addr("10.0.0.9"));

    client.remove_node("10.0.0.9").await.unwrap();
    let err = client.node("10.0.0.9").await.unwrap_err();
    assert_eq!(api_status(err), 404);

    let err = client.add_node("not-an-address").await.unwrap_err();
    assert_eq!(api_status(err), 400);
    handle.shutdown();
}

#[tokio::test]
async fn test_local_toggles() {
    let (handle, client) = serve_node().await;

    client.set_local_active(false).await.unwrap();
    assert!(!client.status().await.unwrap().local_active);
    client.set_local_active(true).await.unwrap();
    assert!(client.status().await.unwrap().local_active);

    client.set_heavy_load_threshold(80.0).await.unwrap();
    assert_eq!(client.status().await.unwrap().heavy_load_threshold, 80.0);
    let err = client.set_heavy_load_threshold(-1.0).await.unwrap_err();
    assert_eq!(api_status(err), 400);

    client.set_status_change_allow(false).await.unwrap();
    assert!(!client.status().await.unwrap().status_change_allow);
    client.set_status_change_allow(true).await.unwrap();

    client.exchange_mapping().await.unwrap();
    handle.shutdown();
}

#[tokio::test]
async fn test_migration_requests_validated() {
    let (handle, client) = serve_node().await;
    client.host_domain(DomainId(8), 1).await.unwrap();

    let err = client
        .start_migration(DomainId(8), "10.0.0.77", MigrationKind::AddReplica)
        .await
        .unwrap_err();
    assert_eq!(api_status(err), 404);

    let err = client
        .start_migration(DomainId(9), "10.0.0.2", MigrationKind::Move)
        .await
        .unwrap_err();
    assert_eq!(api_status(err), 400);

    assert!(client.migrations().await.unwrap().is_empty());
    handle.shutdown();
}

#[tokio::test]
async fn test_reset_tears_down_cluster_view() {
    let (handle, client) = serve_node().await;
    client.add_node("10.0.0.9").await.unwrap();
    client.host_domain(DomainId(5), 2).await.unwrap();

    client.reset_cluster().await.unwrap();

    let status = client.status().await.unwrap();
    let nodes: Vec<NodeAddr> = status.nodes.iter().map(|n| n.addr).collect();
    assert_eq!(nodes, vec![addr("10.0.0.1")]);
    let err = client.node("10.0.0.9").await.unwrap_err();
    assert_eq!(api_status(err), 404);

    // the local store still serves the domain
    let domain = client.domain(DomainId(5)).await.unwrap();
    assert_eq!(domain.replication_factor, 2);
    assert_eq!(domain.hosts, vec![addr("10.0.0.1")]);
    handle.shutdown();
}
