use super::{FencingToken, LeaseBackend};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::time::Duration;
use tokio::time::Instant;

struct Grant {
    holder: String,
    token: FencingToken,
    expires_at: Instant,
}

#[derive(Default)]
struct Inner {
    grants: HashMap<String, Grant>,
    tokens: HashMap<String, u64>,
    unreachable: HashSet<String>,
}

/// In-process coordination store.
///
/// Share one instance (behind an `Arc`) between several simulated members
/// to get real single-holder semantics with TTL expiry. Individual holders
/// can be cut off with [`set_reachable`](Self::set_reachable) to simulate a
/// member losing connectivity to the store.
#[derive(Default)]
pub struct InMemoryLeaseBackend {
    inner: Mutex<Inner>,
}

impl InMemoryLeaseBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, holder: &str, reachable: bool) {
        let mut inner = self.inner.lock();
        if reachable {
            inner.unreachable.remove(holder);
        } else {
            inner.unreachable.insert(holder.to_string());
        }
    }

    fn check_reachable(inner: &Inner, holder: &str) -> Result<()> {
        if inner.unreachable.contains(holder) {
            return Err(Error::connection(format!(
                "lease store unreachable from {holder}"
            )));
        }
        Ok(())
    }

    fn live_grant<'a>(inner: &'a mut Inner, name: &str, now: Instant) -> Option<&'a mut Grant> {
        match inner.grants.get(name) {
            Some(grant) if grant.expires_at <= now => {
                inner.grants.remove(name);
                None
            }
            _ => inner.grants.get_mut(name),
        }
    }
}

#[async_trait]
impl LeaseBackend for InMemoryLeaseBackend {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<FencingToken>> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner, holder)?;
        let now = Instant::now();

        if let Some(grant) = Self::live_grant(&mut inner, name, now) {
            if grant.holder != holder {
                return Ok(None);
            }
            grant.expires_at = now + ttl;
            return Ok(Some(grant.token));
        }

        let counter = inner.tokens.entry(name.to_string()).or_insert(0);
        *counter += 1;
        let token = FencingToken(*counter);
        inner.grants.insert(
            name.to_string(),
            Grant {
                holder: holder.to_string(),
                token,
                expires_at: now + ttl,
            },
        );
        Ok(Some(token))
    }

    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<FencingToken>> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner, holder)?;
        let now = Instant::now();

        match Self::live_grant(&mut inner, name, now) {
            Some(grant) if grant.holder == holder => {
                grant.expires_at = now + ttl;
                Ok(Some(grant.token))
            }
            _ => Ok(None),
        }
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool> {
        let mut inner = self.inner.lock();
        Self::check_reachable(&inner, holder)?;
        let now = Instant::now();

        let held = matches!(Self::live_grant(&mut inner, name, now), Some(grant) if grant.holder == holder);
        if held {
            inner.grants.remove(name);
        }
        Ok(held)
    }

    async fn holder(&self, name: &str) -> Result<Option<String>> {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        Ok(Self::live_grant(&mut inner, name, now).map(|grant| grant.holder.clone()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const TTL: Duration = Duration::from_millis(200);

    #[tokio::test]
    async fn test_single_holder() {
        let backend = InMemoryLeaseBackend::new();
        assert!(backend.try_acquire("orders", "a", TTL).await.unwrap().is_some());
        assert!(backend.try_acquire("orders", "b", TTL).await.unwrap().is_none());
        assert_eq!(backend.holder("orders").await.unwrap().as_deref(), Some("a"));
    }

    #[tokio::test]
    async fn test_reacquire_by_holder_keeps_token() {
        let backend = InMemoryLeaseBackend::new();
        let first = backend.try_acquire("orders", "a", TTL).await.unwrap();
        let second = backend.try_acquire("orders", "a", TTL).await.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test(start_paused = true)]
    async fn test_grant_expires_after_ttl() {
        let backend = InMemoryLeaseBackend::new();
        let first = backend.try_acquire("orders", "a", TTL).await.unwrap().unwrap();

        tokio::time::advance(TTL + Duration::from_millis(1)).await;

        assert!(backend.renew("orders", "a", TTL).await.unwrap().is_none());
        let second = backend.try_acquire("orders", "b", TTL).await.unwrap().unwrap();
        assert!(second > first, "fencing token must increase");
    }

    #[tokio::test]
    async fn test_release_only_by_holder() {
        let backend = InMemoryLeaseBackend::new();
        backend.try_acquire("orders", "a", TTL).await.unwrap();

        assert!(!backend.release("orders", "b").await.unwrap());
        assert!(backend.release("orders", "a").await.unwrap());
        assert!(!backend.release("orders", "a").await.unwrap());
        assert!(backend.holder("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_unreachable_holder_gets_errors() {
        let backend = InMemoryLeaseBackend::new();
        backend.try_acquire("orders", "a", TTL).await.unwrap();
        backend.set_reachable("a", false);

        assert!(matches!(
            backend.renew("orders", "a", TTL).await,
            Err(Error::Connection(_))
        ));

        backend.set_reachable("a", true);
        assert!(backend.renew("orders", "a", TTL).await.unwrap().is_some());
    }
}
