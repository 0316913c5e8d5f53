use crate::membership::MembershipFeed;
use crate::{Member, Result};
use async_trait::async_trait;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Redis-backed member registry.
///
/// Liveness lives in a sorted set `{prefix}:members` scored by the last
/// heartbeat (ms since epoch); addresses live in the hash
/// `{prefix}:addresses`. A member whose heartbeat is older than
/// `stale_after` is no longer reported as live.
pub struct RedisRegistry {
    conn: MultiplexedConnection,
    prefix: String,
    member: Member,
    stale_after: Duration,
}

impl Drop for RedisRegistry {
    fn drop(&mut self) {
        tracing::debug!(
            member = %self.member,
            "RedisRegistry dropped (deregister should be called explicitly)"
        );
    }
}

impl RedisRegistry {
    /// Connect and announce `member` as live.
    pub async fn register(
        redis_url: &str,
        prefix: &str,
        member: Member,
        stale_after: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(redis_url)?;
        let conn = client.get_multiplexed_async_connection().await?;
        let registry = Self {
            conn,
            prefix: prefix.to_string(),
            member,
            stale_after,
        };
        registry.announce().await?;

        tracing::info!(member = %registry.member, "Registered member in Redis");
        Ok(registry)
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub async fn deregister(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zrem(self.members_key(), &self.member.id)
            .ignore()
            .hdel(self.addresses_key(), &self.member.id)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;

        tracing::info!(member = %self.member, "Deregistered member from Redis");
        Ok(())
    }

    /// Members with a heartbeat newer than the stale cutoff and a known
    /// address.
    pub async fn active_members(&self) -> Result<Vec<Member>> {
        let mut conn = self.conn.clone();

        // ZRANGEBYSCORE {prefix}:members <cutoff> +inf
        let ids: Vec<String> = conn
            .zrangebyscore(self.members_key(), self.cutoff_ms(), "+inf")
            .await?;
        if ids.is_empty() {
            return Ok(Vec::new());
        }

        let addresses: Vec<Option<String>> = redis::cmd("HMGET")
            .arg(self.addresses_key())
            .arg(&ids)
            .query_async(&mut conn)
            .await?;

        let members = ids
            .into_iter()
            .zip(addresses)
            .filter_map(|(id, address)| match address {
                Some(address) => Some(Member::new(id, address)),
                None => {
                    tracing::warn!(member = %id, "Live member has no address, skipping");
                    None
                }
            })
            .collect();
        Ok(members)
    }

    async fn announce(&self) -> Result<()> {
        let mut conn = self.conn.clone();
        redis::pipe()
            .atomic()
            .zadd(self.members_key(), &self.member.id, current_timestamp_ms())
            .ignore()
            .hset(self.addresses_key(), &self.member.id, &self.member.address)
            .ignore()
            .query_async::<()>(&mut conn)
            .await?;
        Ok(())
    }

    fn members_key(&self) -> String {
        format!("{}:members", self.prefix)
    }

    fn addresses_key(&self) -> String {
        format!("{}:addresses", self.prefix)
    }

    fn cutoff_ms(&self) -> u64 {
        current_timestamp_ms().saturating_sub(self.stale_after.as_millis() as u64)
    }
}

#[async_trait]
impl MembershipFeed for RedisRegistry {
    async fn fetch(&self) -> Result<Vec<Member>> {
        self.active_members().await
    }

    /// Refreshes the score and rewrites the address, so a member cleaned
    /// up during a long pause comes back on its next heartbeat.
    async fn heartbeat(&self) -> Result<()> {
        self.announce().await
    }

    async fn cleanup_stale(&self) -> Result<u64> {
        let mut conn = self.conn.clone();
        let cutoff = self.cutoff_ms();

        // ZRANGEBYSCORE {prefix}:members -inf (<cutoff>
        let stale: Vec<String> = conn
            .zrangebyscore(self.members_key(), "-inf", format!("({}", cutoff))
            .await?;
        if stale.is_empty() {
            return Ok(0);
        }

        let (removed,): (u64,) = redis::pipe()
            .atomic()
            .zrem(self.members_key(), &stale)
            .hdel(self.addresses_key(), &stale)
            .ignore()
            .query_async(&mut conn)
            .await?;

        if removed > 0 {
            tracing::info!(count = removed, "Cleaned up stale members from Redis");
        }
        Ok(removed)
    }
}

fn current_timestamp_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}
