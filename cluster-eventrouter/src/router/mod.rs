//! Cluster-wide publish/subscribe on top of resource ownership.
//!
//! Every topic has one owner (the member holding the topic's lease). A
//! publish on any other member is forwarded to the owner, which is the
//! single broadcast point: it fans the event out to every member that
//! advertised local subscriptions and delivers to its own subscribers.
//! Events from one origin reach a subscription in publish order; delivery
//! is at most once and events published during an ownership handover may
//! be dropped.

mod links;
mod topic;

pub use topic::{Listener, PublishOutcome, Subscription, Topic};

use crate::config::ClusterConfig;
use crate::metrics::{RouterCounters, RouterMetrics};
use crate::ownership::{OwnershipChange, OwnershipCoordinator};
use crate::transport::{Event, Inbound, RouterMessage, Transport};
use crate::{Member, MembershipEvent};
use dashmap::DashMap;
use links::PeerLinks;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use topic::TopicShared;

type Delivery = (Arc<TopicShared>, Event);

pub(crate) struct RouterCore {
    local: Member,
    coordinator: Arc<OwnershipCoordinator>,
    links: PeerLinks,
    counters: Arc<RouterCounters>,
    topics: DashMap<String, Arc<TopicShared>>,
    deliver_tx: mpsc::UnboundedSender<Delivery>,
    next_subscription_id: AtomicU64,
    shut_down: AtomicBool,
}

impl RouterCore {
    fn topic(self: &Arc<Self>, name: &str) -> Arc<TopicShared> {
        if let Some(topic) = self.topics.get(name) {
            return topic.clone();
        }
        if self.shut_down.load(Ordering::Acquire) {
            return Arc::new(TopicShared::new(name, self.clone(), true));
        }

        let mut created = false;
        let topic = self
            .topics
            .entry(name.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(TopicShared::new(name, self.clone(), false))
            })
            .clone();
        if created {
            self.coordinator.register(name);
            tracing::debug!(topic = name, "Topic created");
        }
        topic
    }

    fn existing_topic(&self, name: &str) -> Option<Arc<TopicShared>> {
        self.topics.get(name).map(|t| t.value().clone())
    }

    fn all_topics(&self) -> Vec<Arc<TopicShared>> {
        self.topics.iter().map(|t| t.value().clone()).collect()
    }

    pub(crate) fn next_subscription_id(&self) -> u64 {
        self.next_subscription_id.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub(crate) fn deliver_local(&self, topic: Arc<TopicShared>, event: Event) {
        if self.deliver_tx.send((topic, event)).is_err() {
            self.counters.dropped();
        }
    }

    fn handle_inbound(self: &Arc<Self>, message: RouterMessage) {
        match message {
            RouterMessage::Forward { event } => {
                let topic = self.topic(&event.topic);
                topic.accept_forward(event);
            }
            RouterMessage::Broadcast { event } => match self.existing_topic(&event.topic) {
                Some(topic) => topic.accept_broadcast(event),
                None => tracing::trace!(topic = %event.topic, "Broadcast for unknown topic"),
            },
            RouterMessage::Subscribe { topic, member } => {
                self.topic(&topic).add_interest(member);
            }
            RouterMessage::Unsubscribe { topic, member } => {
                if let Some(topic) = self.existing_topic(&topic) {
                    topic.remove_interest(&member);
                }
            }
        }
    }

    fn on_membership_event(&self, event: &MembershipEvent) {
        if let MembershipEvent::Left(member) = event {
            self.links.close(&member.id);
        }
        let snapshot = self.coordinator.partitioner().view().snapshot();
        for topic in self.all_topics() {
            topic.prune_interest(&snapshot);
            topic.advertise(false);
        }
    }

    fn on_ownership_change(&self, change: &OwnershipChange) {
        if let Some(topic) = self.existing_topic(&change.resource) {
            topic.advertise(false);
        }
    }

    fn refresh_interest(&self) {
        let snapshot = self.coordinator.partitioner().view().snapshot();
        for topic in self.all_topics() {
            topic.prune_interest(&snapshot);
            topic.advertise(true);
        }
    }
}

/// Entry point for topics on one member.
pub struct EventRouter {
    core: Arc<RouterCore>,
    cancel_token: CancellationToken,
    handles: Mutex<Vec<tokio::task::JoinHandle<()>>>,
}

impl Drop for EventRouter {
    fn drop(&mut self) {
        self.cancel_token.cancel();
        // Topics point back at the core
        self.core.topics.clear();
    }
}

impl EventRouter {
    /// Start routing for the coordinator's local member. `inbound` is the
    /// receiving end of the member's transport. Must be called inside a
    /// Tokio runtime.
    pub fn start(
        coordinator: Arc<OwnershipCoordinator>,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
        config: &ClusterConfig,
    ) -> Self {
        let cancel_token = CancellationToken::new();
        let counters = Arc::new(RouterCounters::default());
        let (deliver_tx, deliver_rx) = mpsc::unbounded_channel();
        let membership_rx = coordinator.partitioner().view().subscribe();
        let ownership_rx = coordinator.subscribe();

        let core = Arc::new(RouterCore {
            local: coordinator.local().clone(),
            links: PeerLinks::new(
                transport,
                config.forward_timeout,
                counters.clone(),
                cancel_token.clone(),
            ),
            coordinator,
            counters,
            topics: DashMap::new(),
            deliver_tx,
            next_subscription_id: AtomicU64::new(0),
            shut_down: AtomicBool::new(false),
        });

        let handles = vec![
            Self::spawn_inbound_task(core.clone(), inbound, cancel_token.clone()),
            Self::spawn_delivery_task(deliver_rx, cancel_token.clone()),
            Self::spawn_maintenance_task(
                core.clone(),
                membership_rx,
                ownership_rx,
                config.interest_refresh_interval,
                cancel_token.clone(),
            ),
        ];

        tracing::info!(member = %core.local, "Event router started");
        Self {
            core,
            cancel_token,
            handles: Mutex::new(handles),
        }
    }

    pub fn local(&self) -> &Member {
        &self.core.local
    }

    pub fn coordinator(&self) -> &Arc<OwnershipCoordinator> {
        &self.core.coordinator
    }

    /// Topic handle for `name`, registering its ownership record on first
    /// use. After [`shutdown`](Self::shutdown) the returned topic is closed.
    pub fn get_topic(&self, name: &str) -> Topic {
        Topic {
            shared: self.core.topic(name),
        }
    }

    pub fn topic_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.core.topics.iter().map(|t| t.key().clone()).collect();
        names.sort();
        names
    }

    /// Tear down one topic: close its subscriptions, revoke interest and
    /// unregister its ownership record. Returns `false` if it did not exist.
    pub async fn remove_topic(&self, name: &str) -> bool {
        let Some((_, topic)) = self.core.topics.remove(name) else {
            return false;
        };
        topic.close_all();
        self.core.coordinator.unregister(name).await;
        tracing::info!(topic = name, "Topic removed");
        true
    }

    /// Tear down every topic and stop background tasks. Idempotent.
    pub async fn shutdown(&self) {
        if self.core.shut_down.swap(true, Ordering::AcqRel) {
            return;
        }
        let names: Vec<String> = self.core.topics.iter().map(|t| t.key().clone()).collect();
        for name in &names {
            if let Some((_, topic)) = self.core.topics.remove(name) {
                topic.close_all();
            }
        }
        for name in &names {
            self.core.coordinator.unregister(name).await;
        }

        self.cancel_token.cancel();
        let handles: Vec<_> = self.handles.lock().drain(..).collect();
        for handle in handles {
            let _ = handle.await;
        }
        tracing::info!(member = %self.core.local, topics = names.len(), "Event router stopped");
    }

    pub fn metrics(&self) -> RouterMetrics {
        self.core.counters.snapshot()
    }

    fn spawn_inbound_task(
        core: Arc<RouterCore>,
        mut inbound: Inbound,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    message = inbound.recv() => match message {
                        Some(message) => core.handle_inbound(message),
                        None => {
                            tracing::warn!("Transport inbound channel closed");
                            break;
                        }
                    },
                }
            }
            tracing::debug!("Inbound task shutting down");
        })
    }

    fn spawn_delivery_task(
        mut deliver_rx: mpsc::UnboundedReceiver<Delivery>,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    delivery = deliver_rx.recv() => match delivery {
                        Some((topic, event)) => topic.deliver(&event),
                        None => break,
                    },
                }
            }
            tracing::debug!("Delivery task shutting down");
        })
    }

    fn spawn_maintenance_task(
        core: Arc<RouterCore>,
        mut membership_rx: broadcast::Receiver<MembershipEvent>,
        mut ownership_rx: broadcast::Receiver<OwnershipChange>,
        refresh_every: Duration,
        cancel_token: CancellationToken,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            let mut refresh_interval = tokio::time::interval(refresh_every);
            refresh_interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                tokio::select! {
                    _ = cancel_token.cancelled() => break,

                    event = membership_rx.recv() => match event {
                        Ok(event) => core.on_membership_event(&event),
                        Err(RecvError::Lagged(_)) => core.refresh_interest(),
                        Err(RecvError::Closed) => break,
                    },

                    change = ownership_rx.recv() => match change {
                        Ok(change) => core.on_ownership_change(&change),
                        Err(RecvError::Lagged(_)) => core.refresh_interest(),
                        Err(RecvError::Closed) => break,
                    },

                    _ = refresh_interval.tick() => core.refresh_interest(),
                }
            }
            tracing::debug!("Router maintenance task shutting down");
        })
    }
}
