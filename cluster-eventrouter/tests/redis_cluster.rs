//! End-to-end tests against a real Redis: registry membership, Redis
//! leases and the Pub/Sub transport together.
//!
//! Run with: REDIS_URL=redis://127.0.0.1:6379 cargo test -- --ignored

use cluster_eventrouter::{
    ClusterConfig, ClusterNode, Event, LeaseConfig, Listener, Member, OwnershipState,
    Subscription,
};
use parking_lot::Mutex;
use serial_test::serial;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;

const WAIT: Duration = Duration::from_secs(10);

fn redis_config() -> ClusterConfig {
    ClusterConfig {
        redis_url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into()),
        key_prefix: format!("test:{}", uuid::Uuid::new_v4()),
        lease: LeaseConfig {
            ttl: Duration::from_millis(1500),
            renew_interval: Duration::from_millis(400),
            safety_margin: Duration::from_millis(500),
            not_ready_grace: Duration::from_millis(500),
        },
        reevaluate_interval: Duration::from_millis(200),
        membership_poll_interval: Duration::from_millis(200),
        interest_refresh_interval: Duration::from_millis(500),
        heartbeat_stale_after: Duration::from_secs(5),
        ..ClusterConfig::default()
    }
}

#[derive(Default)]
struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Listener for Recorder {
    fn on_event(&self, _subscription: &Subscription, event: &Event) {
        self.events.lock().push(event.clone());
    }
}

async fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        sleep(Duration::from_millis(20)).await;
    }
    condition()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
#[ignore = "requires a running Redis"]
async fn test_three_nodes_route_through_owner() {
    let config = redis_config();
    let mut nodes = Vec::new();
    for id in ["a", "b", "c"] {
        let node = ClusterNode::start_redis(&config, Member::new(id, format!("{}:7000", id)))
            .await
            .unwrap();
        nodes.push(node);
    }
    assert!(wait_until(|| nodes.iter().all(|n| n.view().snapshot().len() == 3)).await);

    for node in &nodes {
        node.topic("orders");
    }
    let owner = nodes[0].partitioner().get("orders").unwrap().id;
    let owner_node = nodes.iter().find(|n| n.member().id == owner).unwrap();
    assert!(
        owner_node
            .coordinator()
            .wait_for_state("orders", OwnershipState::Owned, WAIT)
            .await
    );

    let others: Vec<&ClusterNode> = nodes.iter().filter(|n| n.member().id != owner).collect();
    let (origin, subscriber) = (others[0], others[1]);

    let recorder = Arc::new(Recorder::default());
    let _subscription = subscriber.topic("orders").subscribe(recorder.clone());
    let owner_topic = owner_node.topic("orders");
    let subscriber_id = subscriber.member().id.clone();
    assert!(wait_until(|| owner_topic.interested_members().contains(&subscriber_id)).await);

    origin.topic("orders").publish("X");
    assert!(wait_until(|| recorder.events.lock().len() == 1).await);
    let event = recorder.events.lock()[0].clone();
    assert_eq!(event.origin, origin.member().id);
    assert_eq!(event.sequence, 1);

    for node in &nodes {
        node.shutdown().await;
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
#[serial]
#[ignore = "requires a running Redis"]
async fn test_shutdown_hands_ownership_over() {
    let config = redis_config();
    let a = ClusterNode::start_redis(&config, Member::new("a", "a:7000"))
        .await
        .unwrap();
    let b = ClusterNode::start_redis(&config, Member::new("b", "b:7000"))
        .await
        .unwrap();
    assert!(wait_until(|| a.view().snapshot().len() == 2 && b.view().snapshot().len() == 2).await);

    a.topic("orders");
    b.topic("orders");
    let owner = a.partitioner().get("orders").unwrap().id;
    let (leaving, staying) = if owner == "a" { (&a, &b) } else { (&b, &a) };
    assert!(
        leaving
            .coordinator()
            .wait_for_state("orders", OwnershipState::Owned, WAIT)
            .await
    );

    leaving.shutdown().await;
    assert!(
        staying
            .coordinator()
            .wait_for_state("orders", OwnershipState::Owned, WAIT)
            .await,
        "surviving member never took over after graceful shutdown"
    );

    staying.shutdown().await;
}
