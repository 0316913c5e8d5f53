use super::RouterCore;
use crate::transport::{Event, RouterMessage};
use crate::{Member, MembershipSnapshot};
use parking_lot::{Mutex, ReentrantMutex};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

/// Receives events for one subscription.
///
/// Callbacks for a subscription never overlap and never follow its
/// `on_close`. They run on router tasks, so keep them short; a listener
/// may cancel its own subscription from inside a callback.
pub trait Listener: Send + Sync {
    fn on_open(&self, _subscription: &Subscription) {}

    fn on_event(&self, subscription: &Subscription, event: &Event);

    /// Called exactly once, on cancel or topic teardown.
    fn on_close(&self, _subscription: &Subscription) {}
}

/// Result of [`Topic::publish`]. Delivery stays best effort either way.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PublishOutcome {
    /// This member owns the topic and fanned the event out.
    Broadcast,
    /// Queued for the owning member.
    Forwarded { owner: String },
    /// No members, ownership in transition, or the topic is closed.
    Dropped,
}

pub(crate) struct SubscriptionInner {
    id: u64,
    listener: Arc<dyn Listener>,
    // Held across every callback; reentrant so a listener can cancel itself
    gate: ReentrantMutex<()>,
    closed: AtomicBool,
}

impl SubscriptionInner {
    fn deliver(&self, handle: &Subscription, event: &Event) -> bool {
        let _gate = self.gate.lock();
        if self.closed.load(Ordering::Acquire) {
            return false;
        }
        self.listener.on_event(handle, event);
        true
    }

    fn close(&self, handle: &Subscription) -> bool {
        let _gate = self.gate.lock();
        if self.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.listener.on_close(handle);
        true
    }
}

/// Handle binding a [`Listener`] to a topic.
#[derive(Clone)]
pub struct Subscription {
    inner: Arc<SubscriptionInner>,
    topic: Weak<TopicShared>,
    topic_name: Arc<str>,
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.inner.id)
            .field("topic", &self.topic_name)
            .field("closed", &self.is_closed())
            .finish()
    }
}

impl Subscription {
    pub fn id(&self) -> u64 {
        self.inner.id
    }

    pub fn topic(&self) -> &str {
        &self.topic_name
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    /// Stop receiving events. Idempotent.
    ///
    /// Waits for an in-flight `on_event` on another thread to return; no
    /// `on_event` starts after this returns. `on_close` fires once.
    pub fn cancel(&self) {
        if !self.inner.close(self) {
            return;
        }
        if let Some(topic) = self.topic.upgrade() {
            topic.remove_subscription(self.inner.id);
        }
    }
}

/// Named pub/sub channel. Cheap to clone.
#[derive(Clone)]
pub struct Topic {
    pub(crate) shared: Arc<TopicShared>,
}

impl fmt::Debug for Topic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Topic").field("name", &self.shared.name).finish()
    }
}

impl Topic {
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Publish `payload`. Returns as soon as the event is admitted locally;
    /// remote hops happen on background links.
    pub fn publish(&self, payload: impl Into<String>) -> PublishOutcome {
        self.shared.publish(payload.into())
    }

    /// Register `listener`. `on_open` runs before this returns and before
    /// any `on_event`.
    pub fn subscribe(&self, listener: Arc<dyn Listener>) -> Subscription {
        self.shared.subscribe(listener)
    }

    pub fn subscription_count(&self) -> usize {
        self.shared.subscriptions.lock().len()
    }

    /// Remote members this member would fan out to as owner.
    pub fn interested_members(&self) -> Vec<String> {
        self.shared.interest.lock().keys().cloned().collect()
    }

    pub fn is_closed(&self) -> bool {
        self.shared.closed.load(Ordering::Acquire)
    }
}

pub(crate) struct TopicShared {
    pub(crate) name: String,
    name_arc: Arc<str>,
    core: Arc<RouterCore>,
    // Guards the next sequence number and serializes fan-out per topic
    publish_lock: Mutex<u64>,
    subscriptions: Mutex<Vec<Arc<SubscriptionInner>>>,
    // Owner side: remote members with local subscriptions
    interest: Mutex<BTreeMap<String, Member>>,
    // Member side: owner we last advertised interest to
    advertised_to: Mutex<Option<Member>>,
    closed: AtomicBool,
}

impl TopicShared {
    pub(crate) fn new(name: &str, core: Arc<RouterCore>, closed: bool) -> Self {
        Self {
            name: name.to_string(),
            name_arc: Arc::from(name),
            core,
            publish_lock: Mutex::new(0),
            subscriptions: Mutex::new(Vec::new()),
            interest: Mutex::new(BTreeMap::new()),
            advertised_to: Mutex::new(None),
            closed: AtomicBool::new(closed),
        }
    }

    fn handle(self: &Arc<Self>, inner: Arc<SubscriptionInner>) -> Subscription {
        Subscription {
            inner,
            topic: Arc::downgrade(self),
            topic_name: self.name_arc.clone(),
        }
    }

    fn publish(self: &Arc<Self>, payload: String) -> PublishOutcome {
        let core = &self.core;
        core.counters.published();
        if self.closed.load(Ordering::Acquire) {
            core.counters.dropped();
            return PublishOutcome::Dropped;
        }

        let mut next_sequence = self.publish_lock.lock();
        *next_sequence += 1;
        let event = Event {
            topic: self.name.clone(),
            origin: core.local.id.clone(),
            sequence: *next_sequence,
            payload,
        };

        if core.coordinator.is_owned(&self.name) {
            self.fan_out_locked(event);
            return PublishOutcome::Broadcast;
        }

        match core.coordinator.partitioner().get(&self.name) {
            Ok(owner) if owner.id != core.local.id => {
                tracing::trace!(topic = %self.name, owner = %owner.id, sequence = event.sequence, "Forwarding event");
                core.links.send(&owner, RouterMessage::Forward { event });
                core.counters.forwarded();
                PublishOutcome::Forwarded { owner: owner.id }
            }
            Ok(_) => {
                tracing::debug!(topic = %self.name, "Ownership in transition, dropping event");
                core.counters.dropped();
                PublishOutcome::Dropped
            }
            Err(e) => {
                tracing::debug!(topic = %self.name, "{}, dropping event", e);
                core.counters.dropped();
                PublishOutcome::Dropped
            }
        }
    }

    /// Owner side of a forwarded event.
    pub(crate) fn accept_forward(self: &Arc<Self>, event: Event) {
        let _order = self.publish_lock.lock();
        if self.closed.load(Ordering::Acquire) || !self.core.coordinator.is_owned(&self.name) {
            tracing::debug!(
                topic = %self.name,
                origin = %event.origin,
                sequence = event.sequence,
                "Not owner, dropping forwarded event"
            );
            self.core.counters.dropped();
            return;
        }
        self.fan_out_locked(event);
    }

    // Caller holds publish_lock
    fn fan_out_locked(self: &Arc<Self>, event: Event) {
        let core = &self.core;
        let targets: Vec<Member> = self.interest.lock().values().cloned().collect();
        for member in &targets {
            core.links.send(
                member,
                RouterMessage::Broadcast {
                    event: event.clone(),
                },
            );
        }
        core.counters.broadcast();
        tracing::trace!(
            topic = %self.name,
            origin = %event.origin,
            sequence = event.sequence,
            targets = targets.len(),
            "Broadcasting event"
        );
        if !self.subscriptions.lock().is_empty() {
            core.deliver_local(self.clone(), event);
        }
    }

    /// Member side of an owner's broadcast.
    pub(crate) fn accept_broadcast(self: &Arc<Self>, event: Event) {
        if self.subscriptions.lock().is_empty() {
            tracing::trace!(topic = %self.name, "Broadcast without local subscriptions");
            return;
        }
        self.core.deliver_local(self.clone(), event);
    }

    /// Run callbacks for every subscription registered at this point.
    pub(crate) fn deliver(self: &Arc<Self>, event: &Event) {
        let subscriptions: Vec<Arc<SubscriptionInner>> = self.subscriptions.lock().clone();
        let mut delivered = 0;
        for inner in subscriptions {
            let handle = self.handle(inner);
            if handle.inner.deliver(&handle, event) {
                delivered += 1;
            }
        }
        self.core.counters.delivered(delivered);
    }

    fn subscribe(self: &Arc<Self>, listener: Arc<dyn Listener>) -> Subscription {
        let inner = Arc::new(SubscriptionInner {
            id: self.core.next_subscription_id(),
            listener,
            gate: ReentrantMutex::new(()),
            closed: AtomicBool::new(false),
        });
        let handle = self.handle(inner.clone());

        // Hold the gate so no event reaches the listener before on_open
        let gate = inner.gate.lock();
        let registered = {
            let mut subscriptions = self.subscriptions.lock();
            // close_all flips the flag before taking this lock
            if self.closed.load(Ordering::Acquire) {
                false
            } else {
                subscriptions.push(inner.clone());
                if subscriptions.len() == 1 {
                    self.advertise_locked(true);
                }
                true
            }
        };
        inner.listener.on_open(&handle);
        drop(gate);

        if !registered {
            inner.close(&handle);
            return handle;
        }

        tracing::debug!(topic = %self.name, subscription = inner.id, "Subscribed");
        handle
    }

    fn remove_subscription(&self, id: u64) {
        let mut subscriptions = self.subscriptions.lock();
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        if before > 0 && subscriptions.is_empty() {
            self.revoke_locked();
        }
        tracing::debug!(topic = %self.name, subscription = id, "Subscription cancelled");
    }

    /// Tell the designated owner about local interest. Without `force`
    /// nothing is sent if that owner was already told.
    pub(crate) fn advertise(&self, force: bool) {
        let subscriptions = self.subscriptions.lock();
        if subscriptions.is_empty() {
            return;
        }
        self.advertise_locked(force);
    }

    // Caller holds the subscriptions lock
    fn advertise_locked(&self, force: bool) {
        let core = &self.core;
        let Ok(owner) = core.coordinator.partitioner().get(&self.name) else {
            return;
        };
        let mut advertised = self.advertised_to.lock();
        if !force && advertised.as_ref() == Some(&owner) {
            return;
        }
        if owner.id != core.local.id {
            tracing::debug!(topic = %self.name, owner = %owner.id, "Advertising interest");
            core.links.send(
                &owner,
                RouterMessage::Subscribe {
                    topic: self.name.clone(),
                    member: core.local.clone(),
                },
            );
        }
        *advertised = Some(owner);
    }

    // Caller holds the subscriptions lock
    fn revoke_locked(&self) {
        let core = &self.core;
        if let Some(owner) = self.advertised_to.lock().take() {
            if owner.id != core.local.id {
                tracing::debug!(topic = %self.name, owner = %owner.id, "Revoking interest");
                core.links.send(
                    &owner,
                    RouterMessage::Unsubscribe {
                        topic: self.name.clone(),
                        member: core.local.id.clone(),
                    },
                );
            }
        }
    }

    pub(crate) fn add_interest(&self, member: Member) {
        if member.id == self.core.local.id {
            return;
        }
        // Unknown members re-advertise on the next refresh once we see them
        let snapshot = self.core.coordinator.partitioner().view().snapshot();
        if snapshot.get(&member.id) != Some(&member) {
            tracing::debug!(topic = %self.name, member = %member.id, "Ignoring interest from non-member");
            return;
        }
        let mut interest = self.interest.lock();
        if interest.get(&member.id) != Some(&member) {
            tracing::debug!(topic = %self.name, member = %member.id, "Interest registered");
            interest.insert(member.id.clone(), member);
        }
    }

    pub(crate) fn remove_interest(&self, member_id: &str) {
        if self.interest.lock().remove(member_id).is_some() {
            tracing::debug!(topic = %self.name, member = member_id, "Interest revoked");
        }
    }

    /// Drop interest from members no longer in `snapshot`.
    pub(crate) fn prune_interest(&self, snapshot: &MembershipSnapshot) {
        let mut interest = self.interest.lock();
        let before = interest.len();
        interest.retain(|id, member| snapshot.get(id).is_some_and(|m| m == &*member));
        let pruned = before - interest.len();
        if pruned > 0 {
            tracing::debug!(topic = %self.name, pruned, "Pruned interest of departed members");
        }
    }

    /// Terminal teardown: every open subscription gets its `on_close`.
    pub(crate) fn close_all(self: &Arc<Self>) {
        self.closed.store(true, Ordering::Release);
        let subscriptions = {
            let mut subscriptions = self.subscriptions.lock();
            if !subscriptions.is_empty() {
                self.revoke_locked();
            }
            std::mem::take(&mut *subscriptions)
        };
        let count = subscriptions.len();
        for inner in subscriptions {
            let handle = self.handle(inner);
            handle.inner.close(&handle);
        }
        self.interest.lock().clear();
        tracing::debug!(topic = %self.name, closed = count, "Topic torn down");
    }
}
