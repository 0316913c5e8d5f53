//! Test binary for multiprocess router testing.
//!
//! Joins the cluster through Redis, reports status as JSON lines on stdout
//! and accepts commands on stdin:
//!
//! ```text
//! subscribe <topic>
//! unsubscribe <topic>
//! publish <topic> <payload...>
//! owner <topic>
//! ready | unready
//! status
//! quit
//! ```
//!
//! Logs go to stderr. Run: cargo run -p cluster-eventrouter --bin router_node

use cluster_eventrouter::{
    ClusterConfig, ClusterNode, Event, Listener, Member, MembershipEvent, PublishOutcome,
    Subscription,
};
use serde_json::json;
use std::collections::HashMap;
use std::io::Write;
use std::sync::Arc;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

struct PrintingListener;

impl Listener for PrintingListener {
    fn on_event(&self, subscription: &Subscription, event: &Event) {
        emit(json!({
            "event": "received",
            "subscription": subscription.id(),
            "topic": event.topic,
            "origin": event.origin,
            "sequence": event.sequence,
            "payload": event.payload,
        }));
    }

    fn on_close(&self, subscription: &Subscription) {
        emit(json!({
            "event": "closed",
            "subscription": subscription.id(),
            "topic": subscription.topic(),
        }));
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    init_tracing();

    let config = ClusterConfig::from_env()?;
    let id = std::env::var("NODE_ID")
        .unwrap_or_else(|_| uuid::Uuid::new_v4().simple().to_string()[..8].to_string());
    let address = std::env::var("NODE_ADDRESS").unwrap_or_else(|_| format!("{}:0", id));

    let node = Arc::new(ClusterNode::start_redis(&config, Member::new(id.clone(), address)).await?);
    print_status("ready", &node);

    let mut membership_rx = node.view().subscribe();
    let event_node = node.clone();
    let membership_printer = tokio::spawn(async move {
        while let Ok(event) = membership_rx.recv().await {
            let event_type = match event {
                MembershipEvent::Joined(member) => format!("joined:{}", member.id),
                MembershipEvent::Left(member) => format!("left:{}", member.id),
            };
            print_status(&event_type, &event_node);
        }
    });

    let mut subscriptions: HashMap<String, Vec<Subscription>> = HashMap::new();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();

    while let Some(line) = lines.next_line().await? {
        let parts: Vec<&str> = line.split_whitespace().collect();
        let Some(&command) = parts.first() else {
            continue;
        };

        match (command, parts.get(1)) {
            ("subscribe", Some(topic)) => {
                let subscription = node.topic(topic).subscribe(Arc::new(PrintingListener));
                emit(json!({
                    "event": "subscribed",
                    "topic": topic,
                    "subscription": subscription.id(),
                }));
                subscriptions.entry(topic.to_string()).or_default().push(subscription);
            }
            ("unsubscribe", Some(topic)) => {
                let cancelled = subscriptions.remove(*topic).unwrap_or_default();
                for subscription in &cancelled {
                    subscription.cancel();
                }
                emit(json!({ "event": "unsubscribed", "topic": topic, "count": cancelled.len() }));
            }
            ("publish", Some(topic)) => {
                let payload = parts[2..].join(" ");
                let outcome = match node.topic(topic).publish(payload) {
                    PublishOutcome::Broadcast => json!({ "outcome": "broadcast" }),
                    PublishOutcome::Forwarded { owner } => {
                        json!({ "outcome": "forwarded", "owner": owner })
                    }
                    PublishOutcome::Dropped => json!({ "outcome": "dropped" }),
                };
                emit(json!({ "event": "published", "topic": topic, "result": outcome }));
            }
            ("owner", Some(topic)) => {
                let designated = node.partitioner().get(topic).ok().map(|m| m.id);
                emit(json!({
                    "event": "owner",
                    "topic": topic,
                    "designated": designated,
                    "owned_here": node.coordinator().is_owned(topic),
                }));
            }
            ("ready", _) => {
                node.set_ready(true);
                print_status("ready_set", &node);
            }
            ("unready", _) => {
                node.set_ready(false);
                print_status("unready_set", &node);
            }
            ("status", _) => print_status("status", &node),
            ("quit", _) | ("exit", _) => break,
            _ => emit(json!({ "error": "unknown_command", "command": line })),
        }
    }

    node.shutdown().await;
    membership_printer.abort();
    emit(json!({ "event": "shutdown", "id": id }));
    Ok(())
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let json_logs = std::env::var("LOG_FORMAT").unwrap_or_default() == "json";

    if json_logs {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().json().with_writer(std::io::stderr))
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
            .init();
    }
}

fn print_status(event: &str, node: &ClusterNode) {
    let snapshot = node.view().snapshot();
    let owned: Vec<String> = node
        .coordinator()
        .records()
        .iter()
        .filter(|record| node.coordinator().is_owned(&record.resource))
        .map(|record| record.resource.clone())
        .collect();
    emit(json!({
        "event": event,
        "id": node.member().id,
        "generation": snapshot.generation(),
        "members": snapshot.len(),
        "ready": node.leases().is_ready(),
        "owned": owned,
        "metrics": node.router().metrics(),
    }));
}

fn emit(value: serde_json::Value) {
    let mut stdout = std::io::stdout().lock();
    let _ = writeln!(stdout, "{}", value);
    let _ = stdout.flush();
}
