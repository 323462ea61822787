//! Membership, failure detection and leader election across nodes

mod common;

use common::{addr, TestCluster};
use vnetdir::cluster::node::PartitionState;
use vnetdir::common::METRICS;
use vnetdir::migration::{ObjectClass, TransferObject};
use vnetdir::transport::PeerMessage;
use vnetdir::{DomainId, Liveness};

const A: &str = "10.0.0.1";
const B: &str = "10.0.0.2";
const C: &str = "10.0.0.3";

#[test]
fn test_three_leaderless_ticks_elect_lowest_address() {
    let mut cluster = TestCluster::new(&[A, B, C]);

    cluster.advance(2);
    for n in [A, B, C] {
        assert_eq!(cluster.leader_of(n), None);
    }

    cluster.advance(1);
    for n in [A, B, C] {
        assert_eq!(cluster.leader_of(n), Some(addr(A)));
    }
    assert!(cluster.node(A).state.membership().is_leader());
}

#[test]
fn test_election_does_not_depend_on_peer_order() {
    for order in [[A, B, C], [C, A, B], [B, C, A]] {
        let mut cluster = TestCluster::new(&order);
        cluster.advance(3);
        for n in order {
            assert_eq!(cluster.leader_of(n), Some(addr(A)));
        }
    }
}

#[test]
fn test_silent_node_goes_down_through_hint_down() {
    let mut cluster = TestCluster::new(&[A, B, C]);
    cluster.advance(3);
    let last_contact = cluster.elapsed_secs();
    cluster.kill(B);

    let mut seen = vec![(last_contact, Liveness::Up)];
    for _ in 0..40 {
        cluster.step();
        let liveness = cluster
            .node(A)
            .state
            .membership()
            .liveness(addr(B))
            .unwrap();
        if seen.last().map(|(_, l)| *l) != Some(liveness) {
            seen.push((cluster.elapsed_secs(), liveness));
        }
    }

    let states: Vec<Liveness> = seen.iter().map(|(_, l)| *l).collect();
    assert_eq!(states, vec![Liveness::Up, Liveness::HintDown, Liveness::Down]);

    let hint_at = seen[1].0;
    let down_at = seen[2].0;
    assert!(hint_at - last_contact > 10 && hint_at - last_contact <= 11);
    assert!(down_at - hint_at > 15 && down_at - hint_at <= 16);
}

#[test]
fn test_disabled_status_changes_keep_silent_node_up() {
    let mut cluster = TestCluster::new(&[A, B, C]);
    cluster.advance(3);
    cluster.with_node(A, |s, _| s.set_status_change_allow(false));
    cluster.kill(B);

    cluster.advance(30);
    assert_eq!(
        cluster.node(A).state.membership().liveness(addr(B)),
        Some(Liveness::Up)
    );

    cluster.with_node(A, |s, _| s.set_status_change_allow(true));
    cluster.advance(12);
    assert_eq!(
        cluster.node(A).state.membership().liveness(addr(B)),
        Some(Liveness::HintDown)
    );
}

#[test]
fn test_followers_elect_next_node_when_leader_dies() {
    let mut cluster = TestCluster::new(&[A, B, C]);
    cluster.advance(3);
    cluster.kill(A);

    let failed_over = cluster.advance_until(60, |c| {
        c.leader_of(B) == Some(addr(B)) && c.leader_of(C) == Some(addr(B))
    });
    assert!(failed_over);

    assert_eq!(
        cluster.node(B).state.membership().liveness(addr(A)),
        Some(Liveness::Down)
    );
}

#[test]
fn test_inactive_node_is_not_elected() {
    let mut cluster = TestCluster::new(&[A, B, C]);
    cluster.with_node(A, |s, now| s.set_local_active(false, now).unwrap());
    cluster.advance(4);

    assert_eq!(
        cluster.node(B).state.membership().liveness(addr(A)),
        Some(Liveness::Inactive)
    );
    assert_eq!(cluster.leader_of(B), Some(addr(B)));
    assert_eq!(cluster.leader_of(C), Some(addr(B)));

    cluster.with_node(A, |s, now| s.set_local_active(true, now).unwrap());
    cluster.advance(3);
    assert_eq!(cluster.leader_of(B), Some(addr(A)));
}

#[test]
fn test_mapping_exchange_builds_host_index() {
    let mut cluster = TestCluster::new(&[A, B, C]);
    cluster.with_node(B, |s, _| s.host_domain(DomainId(5), 2).unwrap());
    cluster.with_node(C, |s, _| s.host_domain(DomainId(5), 3).unwrap());
    cluster.advance(2);

    let view = cluster.node(A).state.membership();
    assert_eq!(view.domain_hosts(DomainId(5)), vec![addr(B), addr(C)]);
    // highest asserted factor wins
    assert_eq!(view.replication_factor(DomainId(5)), Some(3));
    assert!(view.is_consistent());
}

#[test]
fn test_rejoining_node_asserting_domains_raises_partition_alert() {
    let mut cluster = TestCluster::new(&[A, B, C]);
    cluster.with_node(B, |s, _| s.host_domain(DomainId(7), 1).unwrap());
    cluster
        .node(B)
        .store
        .insert_object(DomainId(7), TransferObject::new(ObjectClass::Vnid, "v", "x"));
    cluster.advance(5);

    cluster.partition(A, B);
    cluster.partition(B, C);
    let down = cluster.advance_until(60, |c| {
        c.node(A).state.membership().liveness(addr(B)) == Some(Liveness::Down)
    });
    assert!(down);

    let alerts = METRICS.partition_alerts.get();
    cluster.log.clear();
    cluster.heal(A, B);
    cluster.heal(B, C);
    cluster.advance(3);

    assert!(METRICS.partition_alerts.get() > alerts);
    assert!(cluster.received(A, |m| matches!(m, PeerMessage::LocalMapping(blob) if blob.node == addr(B))) > 0);

    let view = cluster.node(A).state.membership();
    assert_eq!(view.liveness(addr(B)), Some(Liveness::Up));
    assert_eq!(view.partition_state(addr(B)), Some(PartitionState::Same));
    assert_eq!(view.domain_hosts(DomainId(7)), vec![addr(B)]);

    cluster.advance(3);
    for n in [A, B, C] {
        assert_eq!(cluster.leader_of(n), Some(addr(A)));
    }
}
