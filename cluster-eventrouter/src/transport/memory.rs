use super::{Inbound, RouterMessage, Transport};
use crate::{Error, Member, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::sync::Arc;
use tokio::sync::mpsc;

#[derive(Default)]
struct NetworkInner {
    mailboxes: DashMap<String, mpsc::UnboundedSender<RouterMessage>>,
    disconnected: Mutex<HashSet<String>>,
}

/// In-process network connecting simulated members.
///
/// Messages go through the JSON wire format so simulations exercise the
/// same encoding as real transports. Members can be disconnected to
/// simulate partitions; sends to or from them fail with
/// [`Error::TransportUnavailable`].
#[derive(Clone, Default)]
pub struct InMemoryNetwork {
    inner: Arc<NetworkInner>,
}

impl InMemoryNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Attach `member`, replacing any previous mailbox with the same id.
    pub fn join(&self, member: &Member) -> (Arc<InMemoryTransport>, Inbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        self.inner.mailboxes.insert(member.id.clone(), tx);
        let transport = Arc::new(InMemoryTransport {
            local: member.id.clone(),
            network: self.inner.clone(),
        });
        (transport, rx)
    }

    /// Detach a member. Its inbound receiver sees the channel close.
    pub fn leave(&self, member_id: &str) {
        self.inner.mailboxes.remove(member_id);
    }

    pub fn disconnect(&self, member_id: &str) {
        self.inner.disconnected.lock().insert(member_id.to_string());
    }

    pub fn reconnect(&self, member_id: &str) {
        self.inner.disconnected.lock().remove(member_id);
    }
}

pub struct InMemoryTransport {
    local: String,
    network: Arc<NetworkInner>,
}

#[async_trait]
impl Transport for InMemoryTransport {
    async fn send(&self, to: &Member, message: RouterMessage) -> Result<()> {
        {
            let disconnected = self.network.disconnected.lock();
            if disconnected.contains(&self.local) || disconnected.contains(&to.id) {
                return Err(Error::transport(&to.id, "partitioned"));
            }
        }

        let wire = serde_json::to_string(&message)?;
        let message: RouterMessage = serde_json::from_str(&wire)?;

        let mailbox = self
            .network
            .mailboxes
            .get(&to.id)
            .map(|tx| tx.value().clone())
            .ok_or_else(|| Error::transport(&to.id, "not on network"))?;
        mailbox
            .send(message)
            .map_err(|_| Error::transport(&to.id, "mailbox closed"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn subscribe(topic: &str, member: &Member) -> RouterMessage {
        RouterMessage::Subscribe {
            topic: topic.into(),
            member: member.clone(),
        }
    }

    #[tokio::test]
    async fn test_send_reaches_mailbox() {
        let network = InMemoryNetwork::new();
        let a = Member::new("a", "a:1");
        let b = Member::new("b", "b:1");
        let (transport_a, _rx_a) = network.join(&a);
        let (_transport_b, mut rx_b) = network.join(&b);

        transport_a.send(&b, subscribe("orders", &a)).await.unwrap();
        assert_eq!(rx_b.recv().await.unwrap(), subscribe("orders", &a));
    }

    #[tokio::test]
    async fn test_disconnected_member_unreachable() {
        let network = InMemoryNetwork::new();
        let a = Member::new("a", "a:1");
        let b = Member::new("b", "b:1");
        let (transport_a, _rx_a) = network.join(&a);
        let (_transport_b, _rx_b) = network.join(&b);

        network.disconnect("b");
        assert!(matches!(
            transport_a.send(&b, subscribe("orders", &a)).await,
            Err(Error::TransportUnavailable { .. })
        ));

        network.reconnect("b");
        transport_a.send(&b, subscribe("orders", &a)).await.unwrap();
    }

    #[tokio::test]
    async fn test_unknown_member_unreachable() {
        let network = InMemoryNetwork::new();
        let a = Member::new("a", "a:1");
        let (transport_a, _rx_a) = network.join(&a);

        let ghost = Member::new("ghost", "ghost:1");
        assert!(transport_a.send(&ghost, subscribe("orders", &a)).await.is_err());
    }
}
