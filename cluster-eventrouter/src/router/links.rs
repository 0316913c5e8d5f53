use crate::metrics::RouterCounters;
use crate::transport::{RouterMessage, Transport};
use crate::Member;
use dashmap::DashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// One outbound queue and sender task per destination member.
///
/// Messages to the same member are sent in enqueue order; a slow or dead
/// member only delays its own queue. Each send is bounded by the forward
/// timeout and never retried.
pub(crate) struct PeerLinks {
    transport: Arc<dyn Transport>,
    timeout: Duration,
    counters: Arc<RouterCounters>,
    links: DashMap<String, Link>,
    cancel_token: CancellationToken,
}

struct Link {
    member: Member,
    tx: mpsc::UnboundedSender<RouterMessage>,
}

impl PeerLinks {
    pub(crate) fn new(
        transport: Arc<dyn Transport>,
        timeout: Duration,
        counters: Arc<RouterCounters>,
        cancel_token: CancellationToken,
    ) -> Self {
        Self {
            transport,
            timeout,
            counters,
            links: DashMap::new(),
            cancel_token,
        }
    }

    /// Enqueue `message` for `to`. Never blocks.
    pub(crate) fn send(&self, to: &Member, message: RouterMessage) {
        let mut link = self
            .links
            .entry(to.id.clone())
            .or_insert_with(|| self.open(to));
        // Same id at a new address gets a fresh link
        if link.member != *to {
            *link = self.open(to);
        }
        if link.tx.send(message).is_err() {
            self.counters.transport_failure();
            tracing::warn!(to = %to.id, "Peer link closed, message dropped");
        }
    }

    /// Drop the link to `member_id`. Already queued messages are still
    /// attempted.
    pub(crate) fn close(&self, member_id: &str) {
        if self.links.remove(member_id).is_some() {
            tracing::debug!(member = member_id, "Closed peer link");
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.links.len()
    }

    fn open(&self, member: &Member) -> Link {
        let (tx, mut rx) = mpsc::unbounded_channel::<RouterMessage>();
        let transport = self.transport.clone();
        let counters = self.counters.clone();
        let timeout = self.timeout;
        let cancel_token = self.cancel_token.clone();
        let peer = member.clone();

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = cancel_token.cancelled() => break,
                    message = rx.recv() => match message {
                        Some(message) => message,
                        None => break,
                    },
                };
                let kind = message.kind();
                match tokio::time::timeout(timeout, transport.send(&peer, message)).await {
                    Ok(Ok(())) => {}
                    Ok(Err(e)) => {
                        counters.transport_failure();
                        tracing::warn!(to = %peer.id, kind, "Send failed: {}", e);
                    }
                    Err(_) => {
                        counters.transport_failure();
                        tracing::warn!(
                            to = %peer.id,
                            kind,
                            timeout_ms = timeout.as_millis() as u64,
                            "Send timed out"
                        );
                    }
                }
            }
            tracing::trace!(to = %peer.id, "Peer link task exiting");
        });

        Link {
            member: member.clone(),
            tx,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::InMemoryNetwork;

    fn subscribe(topic: &str, member: &Member) -> RouterMessage {
        RouterMessage::Subscribe {
            topic: topic.into(),
            member: member.clone(),
        }
    }

    #[tokio::test]
    async fn test_messages_to_one_peer_keep_order() {
        let network = InMemoryNetwork::new();
        let a = Member::new("a", "a:1");
        let b = Member::new("b", "b:1");
        let (transport, _rx_a) = network.join(&a);
        let (_tb, mut rx_b) = network.join(&b);

        let links = PeerLinks::new(
            transport,
            Duration::from_secs(1),
            Arc::new(RouterCounters::default()),
            CancellationToken::new(),
        );
        for i in 0..50 {
            links.send(&b, subscribe(&format!("t{}", i), &a));
        }
        for i in 0..50 {
            let message = rx_b.recv().await.unwrap();
            assert_eq!(message.topic(), format!("t{}", i));
        }
        assert_eq!(links.len(), 1);
    }

    #[tokio::test]
    async fn test_failed_sends_are_counted() {
        let network = InMemoryNetwork::new();
        let a = Member::new("a", "a:1");
        let (transport, _rx_a) = network.join(&a);
        let counters = Arc::new(RouterCounters::default());

        let links = PeerLinks::new(
            transport,
            Duration::from_secs(1),
            counters.clone(),
            CancellationToken::new(),
        );
        let ghost = Member::new("ghost", "ghost:1");
        links.send(&ghost, subscribe("orders", &a));

        for _ in 0..50 {
            if counters.snapshot().transport_failures == 1 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(counters.snapshot().transport_failures, 1);
    }
}
