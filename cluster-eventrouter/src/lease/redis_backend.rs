use super::{FencingToken, LeaseBackend};
use crate::Result;
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::{AsyncCommands, Script};
use std::time::Duration;

// Returns the fencing token, or -1 when another holder has the lease.
const ACQUIRE_SCRIPT: &str = r"
local current = redis.call('GET', KEYS[1])
if current == false then
  redis.call('SET', KEYS[1], ARGV[1], 'PX', ARGV[2])
  return redis.call('INCR', KEYS[2])
elseif current == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return tonumber(redis.call('GET', KEYS[2]) or '0')
end
return -1
";

const RENEW_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  redis.call('PEXPIRE', KEYS[1], ARGV[2])
  return tonumber(redis.call('GET', KEYS[2]) or '0')
end
return -1
";

const RELEASE_SCRIPT: &str = r"
if redis.call('GET', KEYS[1]) == ARGV[1] then
  return redis.call('DEL', KEYS[1])
end
return 0
";

/// Leases stored as plain Redis keys with a millisecond TTL.
///
/// `{prefix}:lease:{name}` holds the holder id; `{prefix}:fence:{name}` is
/// a counter bumped on every fresh acquisition. All compare-and-set steps
/// run as Lua scripts so each operation is atomic on the server.
pub struct RedisLeaseBackend {
    conn: MultiplexedConnection,
    prefix: String,
    acquire: Script,
    renew: Script,
    release: Script,
}

impl RedisLeaseBackend {
    pub async fn connect(redis_url: &str, prefix: &str) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        tracing::debug!(prefix, "Connected Redis lease backend");
        Ok(Self::with_connection(conn, prefix))
    }

    pub fn with_connection(conn: MultiplexedConnection, prefix: &str) -> Self {
        Self {
            conn,
            prefix: prefix.to_string(),
            acquire: Script::new(ACQUIRE_SCRIPT),
            renew: Script::new(RENEW_SCRIPT),
            release: Script::new(RELEASE_SCRIPT),
        }
    }

    fn lease_key(&self, name: &str) -> String {
        format!("{}:lease:{}", self.prefix, name)
    }

    fn fence_key(&self, name: &str) -> String {
        format!("{}:fence:{}", self.prefix, name)
    }
}

fn to_token(raw: i64) -> Option<FencingToken> {
    u64::try_from(raw).ok().map(FencingToken)
}

fn ttl_ms(ttl: Duration) -> u64 {
    (ttl.as_millis() as u64).max(1)
}

#[async_trait]
impl LeaseBackend for RedisLeaseBackend {
    async fn try_acquire(
        &self,
        name: &str,
        holder: &str,
        ttl: Duration,
    ) -> Result<Option<FencingToken>> {
        let mut conn = self.conn.clone();
        let raw: i64 = self
            .acquire
            .key(self.lease_key(name))
            .key(self.fence_key(name))
            .arg(holder)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(to_token(raw))
    }

    async fn renew(&self, name: &str, holder: &str, ttl: Duration) -> Result<Option<FencingToken>> {
        let mut conn = self.conn.clone();
        let raw: i64 = self
            .renew
            .key(self.lease_key(name))
            .key(self.fence_key(name))
            .arg(holder)
            .arg(ttl_ms(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(to_token(raw))
    }

    async fn release(&self, name: &str, holder: &str) -> Result<bool> {
        let mut conn = self.conn.clone();
        let deleted: i64 = self
            .release
            .key(self.lease_key(name))
            .arg(holder)
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted > 0)
    }

    async fn holder(&self, name: &str) -> Result<Option<String>> {
        let mut conn = self.conn.clone();
        let holder: Option<String> = conn.get(self.lease_key(name)).await?;
        Ok(holder)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn get_redis_url() -> String {
        std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379".into())
    }

    fn test_prefix() -> String {
        format!("test:{}", uuid::Uuid::new_v4())
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running Redis"]
    async fn test_redis_lease_single_holder() {
        let backend = RedisLeaseBackend::connect(&get_redis_url(), &test_prefix())
            .await
            .unwrap();
        let ttl = Duration::from_secs(5);

        let token = backend.try_acquire("orders", "a", ttl).await.unwrap();
        assert!(token.is_some());
        assert!(backend.try_acquire("orders", "b", ttl).await.unwrap().is_none());
        assert_eq!(backend.try_acquire("orders", "a", ttl).await.unwrap(), token);
        assert_eq!(backend.holder("orders").await.unwrap().as_deref(), Some("a"));

        assert!(!backend.release("orders", "b").await.unwrap());
        assert!(backend.release("orders", "a").await.unwrap());
        assert!(backend.holder("orders").await.unwrap().is_none());
    }

    #[tokio::test]
    #[serial]
    #[ignore = "requires a running Redis"]
    async fn test_redis_lease_expires_and_fences() {
        let backend = RedisLeaseBackend::connect(&get_redis_url(), &test_prefix())
            .await
            .unwrap();
        let ttl = Duration::from_millis(200);

        let first = backend.try_acquire("orders", "a", ttl).await.unwrap().unwrap();
        tokio::time::sleep(Duration::from_millis(300)).await;

        assert!(backend.renew("orders", "a", ttl).await.unwrap().is_none());
        let second = backend.try_acquire("orders", "b", ttl).await.unwrap().unwrap();
        assert!(second > first);
    }
}
