//! Full nodes with background tasks, wired through the in-process network

use std::sync::Arc;
use std::time::Duration;
use vnetdir::migration::{MigrationKind, ObjectClass, TransferObject};
use vnetdir::transport::MemoryNetwork;
use vnetdir::{Config, DirectoryNode, DomainId, MemoryDomainStore, NodeAddr, NodeHandle};

const ADDRS: [&str; 3] = ["10.0.0.1", "10.0.0.2", "10.0.0.3"];

fn addr(s: &str) -> NodeAddr {
    s.parse().unwrap()
}

struct Running {
    handle: NodeHandle,
    store: Arc<MemoryDomainStore>,
}

fn start_cluster(net: &MemoryNetwork) -> Vec<Running> {
    ADDRS
        .iter()
        .map(|local| {
            let mut config = Config::default();
            config.node.address = local.to_string();
            config.node.peers = ADDRS
                .iter()
                .filter(|a| *a != local)
                .map(|a| a.to_string())
                .collect();

            let store = Arc::new(MemoryDomainStore::new());
            let (transport, inbox) = net.register(addr(local));
            let node = DirectoryNode::new(config, store.clone(), Arc::new(transport)).unwrap();
            let (handle, _tasks) = node.spawn();
            handle.spawn_inbox(inbox);
            Running { handle, store }
        })
        .collect()
}

fn seed(node: &Running, domain: DomainId) {
    for class in ObjectClass::ALL {
        node.store.insert_object(
            domain,
            TransferObject::new(class, format!("{class}-1"), "payload"),
        );
    }
}

#[tokio::test(start_paused = true)]
async fn test_under_replicated_domain_gains_replica() {
    let net = MemoryNetwork::new();
    let nodes = start_cluster(&net);
    let domain = DomainId(42);

    seed(&nodes[0], domain);
    nodes[0]
        .handle
        .with_state(|s, _| s.host_domain(domain, 2))
        .await
        .unwrap();

    let mut replicated = false;
    for _ in 0..60 {
        tokio::time::sleep(Duration::from_secs(1)).await;
        let hosts = nodes[0]
            .handle
            .with_state(|s, _| s.domain_hosts_for(domain))
            .await;
        if hosts.len() == 2 {
            replicated = true;
            break;
        }
    }
    assert!(replicated, "domain never reached two live hosts");

    let copies = nodes[1..]
        .iter()
        .filter(|n| n.store.object_count(domain) == ObjectClass::ALL.len())
        .count();
    assert_eq!(copies, 1);

    for node in &nodes {
        node.handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_admin_move_hands_domain_over() {
    let net = MemoryNetwork::new();
    let nodes = start_cluster(&net);
    let domain = DomainId(7);

    seed(&nodes[1], domain);
    nodes[1]
        .handle
        .with_state(|s, _| s.host_domain(domain, 1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    let id = nodes[1]
        .handle
        .start_migration(domain, addr(ADDRS[2]), MigrationKind::Move)
        .await
        .unwrap();
    assert!(nodes[1]
        .handle
        .with_state(|s, _| s.migrations().iter().any(|m| m.id == id))
        .await);

    tokio::time::sleep(Duration::from_secs(10)).await;

    assert!(nodes[1]
        .handle
        .with_state(|s, _| s.migrations().is_empty())
        .await);
    assert_eq!(nodes[2].store.object_count(domain), ObjectClass::ALL.len());
    assert_eq!(nodes[1].store.object_count(domain), 0);

    let hosts = nodes[0]
        .handle
        .with_state(|s, _| s.domain_hosts_for(domain))
        .await;
    assert_eq!(hosts, vec![addr(ADDRS[2])]);

    for node in &nodes {
        node.handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_live_update_reaches_new_replica() {
    let net = MemoryNetwork::new();
    let nodes = start_cluster(&net);
    let domain = DomainId(3);

    seed(&nodes[0], domain);
    nodes[0]
        .handle
        .with_state(|s, _| s.host_domain(domain, 1))
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_secs(5)).await;

    nodes[0]
        .handle
        .start_migration(domain, addr(ADDRS[1]), MigrationKind::AddReplica)
        .await
        .unwrap();

    let update = TransferObject::new(ObjectClass::Endpoint, "ep-late", "10.9.9.9");
    nodes[0].store.insert_object(domain, update.clone());
    nodes[0]
        .handle
        .register_migration_delta(domain, update.clone())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(10)).await;
    assert_eq!(
        nodes[1].store.object(domain, ObjectClass::Endpoint, "ep-late"),
        Some(update)
    );

    for node in &nodes {
        node.handle.shutdown();
    }
}

#[tokio::test(start_paused = true)]
async fn test_shutdown_stops_background_tasks() {
    let net = MemoryNetwork::new();
    let mut config = Config::default();
    config.node.address = ADDRS[0].to_string();
    let (transport, _inbox) = net.register(addr(ADDRS[0]));
    let node = DirectoryNode::new(
        config,
        Arc::new(MemoryDomainStore::new()),
        Arc::new(transport),
    )
    .unwrap();
    let (handle, tasks) = node.spawn();

    tokio::time::sleep(Duration::from_secs(3)).await;
    handle.shutdown();
    for task in tasks {
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .unwrap()
            .unwrap();
    }
}
