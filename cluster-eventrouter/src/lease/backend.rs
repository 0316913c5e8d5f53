use crate::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Strictly increasing per lease name across successive acquisitions.
///
/// Downstream systems can reject work stamped with a token older than the
/// newest one they have seen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct FencingToken(pub u64);

impl fmt::Display for FencingToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Linearizable coordination store providing TTL-bounded exclusive grants.
#[async_trait]
pub trait LeaseBackend: Send + Sync {
    /// Grant `name` to `holder` for `ttl` if nobody holds it. If `holder`
    /// already holds it the grant is extended and its token returned.
    /// Returns `None` when another holder has it.
    async fn try_acquire(&self, name: &str, holder: &str, ttl: Duration)
        -> Result<Option<FencingToken>>;

    /// Extend the grant if `holder` still has it. `None` means the grant
    /// expired or belongs to someone else.
    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<FencingToken>>;

    /// Delete the grant if `holder` has it. Returns whether anything was
    /// deleted.
    async fn release(&self, name: &str, holder: &str) -> Result<bool>;

    /// Current holder, if any.
    async fn holder(&self, name: &str) -> Result<Option<String>>;
}
