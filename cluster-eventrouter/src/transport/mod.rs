//! Member-to-member messaging used by the event router.
//!
//! A [`Transport`] only sends. Each member's inbound messages arrive on the
//! `mpsc` receiver returned when it joins a network, and are handed to the
//! router at start.

mod memory;
mod redis_pubsub;

pub use memory::{InMemoryNetwork, InMemoryTransport};
pub use redis_pubsub::RedisTransport;

use crate::{Member, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

pub type Inbound = mpsc::UnboundedReceiver<RouterMessage>;

/// A published event with its routing metadata.
///
/// `sequence` is scoped to `{topic, origin}` and starts at 1.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    pub topic: String,
    pub origin: String,
    pub sequence: u64,
    pub payload: String,
}

/// Wire envelope between members.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RouterMessage {
    /// Publisher to owner.
    Forward { event: Event },
    /// Owner to an interested member.
    Broadcast { event: Event },
    /// Member to owner: `member` has local subscriptions on `topic`.
    Subscribe { topic: String, member: Member },
    /// Member to owner: last local subscription on `topic` went away.
    Unsubscribe { topic: String, member: String },
}

impl RouterMessage {
    pub fn topic(&self) -> &str {
        match self {
            Self::Forward { event } | Self::Broadcast { event } => &event.topic,
            Self::Subscribe { topic, .. } | Self::Unsubscribe { topic, .. } => topic,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Forward { .. } => "forward",
            Self::Broadcast { .. } => "broadcast",
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
        }
    }
}

#[async_trait]
pub trait Transport: Send + Sync {
    /// Deliver `message` to `to`. Best effort: an error means the message
    /// did not reach the member and will not be retried.
    async fn send(&self, to: &Member, message: RouterMessage) -> Result<()>;
}
