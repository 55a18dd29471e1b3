//! End-to-end scenarios over the in-memory network
//!
//! Real engines, real frames, real signatures; only the sockets are fake.

mod common;

use std::time::Duration;

use common::{fast_config, Cluster};
use verikad::Error;

/// Two nodes seeded with each other: a value set on one is retrievable
/// from the other.
#[tokio::test]
async fn two_node_store_and_get() {
    let mut cluster = Cluster::new();
    let n1 = cluster.spawn(fast_config());
    let n2 = cluster.spawn(fast_config());
    n1.join(vec![n2.peer_info()]).await.unwrap();

    let report = n1
        .set("greeting", b"hello".to_vec(), 0, Vec::new())
        .await
        .unwrap();
    assert!(!report.acks.is_empty(), "store should reach the other node");
    assert!(report.nacks.is_empty());

    let found = n2.get("greeting", n1.public_key()).await.unwrap().unwrap();
    assert_eq!(found.value, b"hello");
    assert_eq!(found.name, "greeting");
    assert_eq!(found.public_key, n1.public_key());
}

/// A name nobody published resolves to NotFound, not an error.
#[tokio::test]
async fn missing_value_is_not_found() {
    let mut cluster = Cluster::new();
    let n1 = cluster.spawn(fast_config());
    let n2 = cluster.spawn(fast_config());
    n2.join(vec![n1.peer_info()]).await.unwrap();

    let result = n2.get("never-published", n1.public_key()).await.unwrap();
    assert!(result.is_none());
}

/// Publishing twice under the same name converges on the newer value
/// everywhere, regardless of which node asks.
#[tokio::test]
async fn newer_publication_wins() {
    let cluster = Cluster::full_mesh(4, fast_config()).await;
    let publisher = &cluster.nodes[0];

    publisher
        .set("counter", b"v1".to_vec(), 0, Vec::new())
        .await
        .unwrap();
    // Distinct wall-clock millisecond so the second item supersedes.
    tokio::time::sleep(Duration::from_millis(5)).await;
    publisher
        .set("counter", b"v2".to_vec(), 0, Vec::new())
        .await
        .unwrap();

    for node in &cluster.nodes {
        let found = node
            .get("counter", publisher.public_key())
            .await
            .unwrap()
            .expect("value should be reachable from every node");
        assert_eq!(found.value, b"v2");
    }
}

/// After a successful FIND_VALUE, the closest observed non-holder also
/// ends up with a copy.
#[tokio::test]
async fn lookup_caches_at_closest_non_holder() {
    let mut cluster = Cluster::full_mesh(8, fast_config()).await;
    let publisher = cluster.nodes[0].clone();

    publisher
        .set("popular", b"cached".to_vec(), 0, Vec::new())
        .await
        .unwrap();

    let before: u64 = sum_stored(&cluster).await;
    assert!(before >= 2, "publisher plus replicas should hold the item");

    // A newcomer that only knows one non-holding peer traverses the
    // network; its first hop cannot return the value, so a caching STORE
    // must follow the successful lookup.
    let key = verikad::derive_key(publisher.public_key(), "popular");
    let mut by_distance: Vec<&verikad::Node> = cluster
        .nodes
        .iter()
        .filter(|n| n.id() != publisher.id())
        .collect();
    by_distance.sort_by_key(|n| n.id().distance(&key));
    // Replicas live at the closest k() nodes; seed from the farthest.
    let seed = by_distance.last().unwrap().peer_info();
    let getter = cluster.spawn_with_seeds(fast_config(), vec![seed]);
    tokio::time::sleep(Duration::from_millis(50)).await;

    let found = getter
        .get("popular", publisher.public_key())
        .await
        .unwrap()
        .expect("value should be found");
    assert_eq!(found.value, b"cached");

    // Give the opportunistic STORE time to land.
    tokio::time::sleep(Duration::from_millis(200)).await;
    let after = sum_stored(&cluster).await;
    assert_eq!(
        after,
        before + 1,
        "exactly one new cached copy should appear"
    );
}

/// Values bound to a different publisher key are distinct items.
#[tokio::test]
async fn names_are_scoped_to_publishers() {
    let cluster = Cluster::full_mesh(3, fast_config()).await;
    let a = &cluster.nodes[0];
    let b = &cluster.nodes[1];

    a.set("profile", b"alice".to_vec(), 0, Vec::new())
        .await
        .unwrap();
    b.set("profile", b"bob".to_vec(), 0, Vec::new())
        .await
        .unwrap();

    let reader = &cluster.nodes[2];
    let from_a = reader.get("profile", a.public_key()).await.unwrap().unwrap();
    let from_b = reader.get("profile", b.public_key()).await.unwrap().unwrap();
    assert_eq!(from_a.value, b"alice");
    assert_eq!(from_b.value, b"bob");
}

/// Leaving stops the engine; later calls report it gone.
#[tokio::test]
async fn leave_shuts_the_engine_down() {
    let mut cluster = Cluster::new();
    let n1 = cluster.spawn(fast_config());
    n1.leave().await.unwrap();

    // The command channel may linger briefly; retry until the engine is gone.
    for _ in 0..50 {
        match n1.get_key(verikad::NodeId::hash_of(b"x")).await {
            Err(Error::EngineGone) => return,
            _ => tokio::time::sleep(Duration::from_millis(10)).await,
        }
    }
    panic!("engine still answering after leave");
}

async fn sum_stored(cluster: &Cluster) -> u64 {
    let mut total = 0;
    for node in &cluster.nodes {
        total += node.stats().await.unwrap().stored_items as u64;
    }
    total
}
