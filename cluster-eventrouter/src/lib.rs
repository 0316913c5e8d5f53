//! Partitioned resource ownership and cluster-wide pub/sub for a fleet of
//! identical members.
//!
//! This crate provides:
//! - Membership views fed by a Redis heartbeat registry or a static list
//! - Consistent hashing with virtual nodes to pick each resource's
//!   designated owner
//! - Renewable leases with fencing tokens (Redis or in-memory backend)
//! - An ownership coordinator that acquires exactly the leases this member
//!   is designated for and releases the rest
//! - An event router where each topic's owner is the single broadcast point
//!
//! # Example
//!
//! ```rust,ignore
//! use cluster_eventrouter::{ClusterConfig, ClusterNode, Member};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = ClusterConfig::from_env()?;
//!     let node = ClusterNode::start_redis(&config, Member::new("node-1", "10.0.0.1:7000")).await?;
//!
//!     let topic = node.topic("orders");
//!     let _subscription = topic.subscribe(my_listener);
//!     topic.publish("order 42 shipped");
//!
//!     // Releases leases and deregisters from the cluster
//!     node.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! # Guarantees
//!
//! - At most one member believes it owns a resource at any instant, given
//!   the lease safety margin exceeds clock drift plus renewal latency
//! - Events from one origin reach each subscription in publish order
//! - Delivery is at most once; events published while ownership moves
//!   between members may be dropped

mod config;
mod error;
pub mod lease;
mod member;
mod membership;
mod metrics;
mod node;
pub mod ownership;
mod partitioner;
mod registry;
mod ring;
pub mod router;
pub mod transport;
mod weight;

pub use config::{ClusterConfig, LeaseBackendKind, LeaseConfig};
pub use error::{Error, Result};
pub use lease::{
    FencingToken, InMemoryLeaseBackend, Lease, LeaseBackend, LeaseEvent, LeaseListener,
    LeaseManager, LeaseStatus, RedisLeaseBackend,
};
pub use member::{Member, MembershipSnapshot};
pub use membership::{
    MemberStatus, MembershipEvent, MembershipFeed, MembershipView, StaticMembershipFeed,
};
pub use metrics::RouterMetrics;
pub use node::ClusterNode;
pub use ownership::{OwnershipChange, OwnershipCoordinator, OwnershipRecord, OwnershipState};
pub use partitioner::Partitioner;
pub use registry::RedisRegistry;
pub use ring::HashRing;
pub use router::{EventRouter, Listener, PublishOutcome, Subscription, Topic};
pub use transport::{
    Event, InMemoryNetwork, InMemoryTransport, RedisTransport, RouterMessage, Transport,
};
pub use weight::{AdjustableWeight, ClusterWeight, FixedWeight, FULL_WEIGHT};
