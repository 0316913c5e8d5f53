use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// The current membership snapshot is empty, so no member can own anything.
    #[error("No members available")]
    NoMembersAvailable,

    /// Transient; retried by the ownership re-evaluation loop.
    #[error("Lease acquisition failed for {name}: {reason}")]
    LeaseAcquisitionFailed { name: String, reason: String },

    /// A forward or broadcast could not reach a member. Delivery to that
    /// member is lost for the affected event.
    #[error("Transport unavailable for member {member}: {reason}")]
    TransportUnavailable { member: String, reason: String },

    /// The owner's lease lapsed while it believed it owned the resource.
    #[error("Ownership lost for {0}")]
    OwnershipLost(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Connection error: {0}")]
    Connection(String),
}

impl Error {
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn connection(msg: impl Into<String>) -> Self {
        Self::Connection(msg.into())
    }

    pub fn transport(member: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::TransportUnavailable {
            member: member.into(),
            reason: reason.into(),
        }
    }

    pub fn lease_failed(name: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::LeaseAcquisitionFailed {
            name: name.into(),
            reason: reason.into(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
