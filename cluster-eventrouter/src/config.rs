// ABOUTME: Runtime configuration for membership, leasing, ownership and routing
// ABOUTME: Defaults are production values; every knob can be overridden from CLUSTER_* env vars

use crate::{Error, Result};
use std::env;
use std::fmt;
use std::time::Duration;

pub const DEFAULT_KEY_PREFIX: &str = "eventrouter";
pub const DEFAULT_VIRTUAL_NODES: usize = 160;

/// Which coordination backend the lease manager talks to.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum LeaseBackendKind {
    /// Redis `SET NX PX` leases shared by every member of the cluster.
    #[default]
    Redis,

    /// Process-local leases. Only meaningful for a single process or for
    /// simulations that share one backend between several members.
    InMemory,
}

impl LeaseBackendKind {
    /// Parse from the LEASE_BACKEND environment variable.
    ///
    /// Returns `Redis` by default.
    pub fn from_env() -> Self {
        match env::var("LEASE_BACKEND").as_deref() {
            Ok("memory") | Ok("in-memory") | Ok("in_memory") => Self::InMemory,
            _ => Self::Redis,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Redis => "redis",
            Self::InMemory => "in-memory",
        }
    }
}

impl fmt::Display for LeaseBackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Lease timing.
///
/// A held lease is renewed every `renew_interval`. Locally it is only
/// considered held until `ttl - safety_margin` after the last successful
/// renewal *request was sent*, so a member cut off from the backend stops
/// believing it holds the lease before the backend lets anyone else take it.
#[derive(Debug, Clone)]
pub struct LeaseConfig {
    pub ttl: Duration,
    pub renew_interval: Duration,
    pub safety_margin: Duration,
    /// How long a not-ready member keeps renewing its leases before
    /// releasing them.
    pub not_ready_grace: Duration,
}

impl Default for LeaseConfig {
    fn default() -> Self {
        Self {
            ttl: Duration::from_secs(15),
            renew_interval: Duration::from_secs(5),
            safety_margin: Duration::from_secs(3),
            not_ready_grace: Duration::from_secs(30),
        }
    }
}

impl LeaseConfig {
    pub fn validate(&self) -> Result<()> {
        if self.ttl.is_zero() || self.renew_interval.is_zero() {
            return Err(Error::config("lease ttl and renew interval must be non-zero"));
        }
        if self.safety_margin.is_zero() {
            return Err(Error::config("lease safety margin must be non-zero"));
        }
        if self.renew_interval + self.safety_margin >= self.ttl {
            return Err(Error::config(format!(
                "lease renew interval ({:?}) plus safety margin ({:?}) must be shorter than ttl ({:?})",
                self.renew_interval, self.safety_margin, self.ttl
            )));
        }
        Ok(())
    }

    /// How long after a renewal request was sent the lease is trusted locally.
    pub fn local_validity(&self) -> Duration {
        self.ttl.saturating_sub(self.safety_margin)
    }
}

#[derive(Debug, Clone)]
pub struct ClusterConfig {
    pub redis_url: String,
    /// Namespace for every Redis key and channel (also isolates tests).
    pub key_prefix: String,
    pub virtual_nodes: usize,
    pub lease_backend: LeaseBackendKind,
    pub lease: LeaseConfig,
    pub reevaluate_interval: Duration,
    pub acquire_backoff_base: Duration,
    pub acquire_backoff_max: Duration,
    pub forward_timeout: Duration,
    pub interest_refresh_interval: Duration,
    pub membership_poll_interval: Duration,
    pub heartbeat_stale_after: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            redis_url: "redis://127.0.0.1:6379".to_string(),
            key_prefix: DEFAULT_KEY_PREFIX.to_string(),
            virtual_nodes: DEFAULT_VIRTUAL_NODES,
            lease_backend: LeaseBackendKind::default(),
            lease: LeaseConfig::default(),
            reevaluate_interval: Duration::from_secs(5),
            acquire_backoff_base: Duration::from_millis(100),
            acquire_backoff_max: Duration::from_millis(6400),
            forward_timeout: Duration::from_secs(2),
            interest_refresh_interval: Duration::from_secs(30),
            membership_poll_interval: Duration::from_secs(5),
            heartbeat_stale_after: Duration::from_secs(30),
        }
    }
}

impl ClusterConfig {
    /// Build from environment variables, falling back to defaults.
    ///
    /// Durations are given in milliseconds.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if a variable is not a valid number or the
    /// resulting configuration fails [`validate`](Self::validate).
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();
        let lease = LeaseConfig {
            ttl: env_duration_ms("CLUSTER_LEASE_TTL_MS", defaults.lease.ttl)?,
            renew_interval: env_duration_ms(
                "CLUSTER_LEASE_RENEW_INTERVAL_MS",
                defaults.lease.renew_interval,
            )?,
            safety_margin: env_duration_ms(
                "CLUSTER_LEASE_SAFETY_MARGIN_MS",
                defaults.lease.safety_margin,
            )?,
            not_ready_grace: env_duration_ms(
                "CLUSTER_NOT_READY_GRACE_MS",
                defaults.lease.not_ready_grace,
            )?,
        };

        let config = Self {
            redis_url: env::var("REDIS_URL").unwrap_or(defaults.redis_url),
            key_prefix: env::var("CLUSTER_KEY_PREFIX").unwrap_or(defaults.key_prefix),
            virtual_nodes: env_usize("CLUSTER_VIRTUAL_NODES", defaults.virtual_nodes)?,
            lease_backend: LeaseBackendKind::from_env(),
            lease,
            reevaluate_interval: env_duration_ms(
                "CLUSTER_REEVALUATE_INTERVAL_MS",
                defaults.reevaluate_interval,
            )?,
            acquire_backoff_base: env_duration_ms(
                "CLUSTER_ACQUIRE_BACKOFF_BASE_MS",
                defaults.acquire_backoff_base,
            )?,
            acquire_backoff_max: env_duration_ms(
                "CLUSTER_ACQUIRE_BACKOFF_MAX_MS",
                defaults.acquire_backoff_max,
            )?,
            forward_timeout: env_duration_ms("CLUSTER_FORWARD_TIMEOUT_MS", defaults.forward_timeout)?,
            interest_refresh_interval: env_duration_ms(
                "CLUSTER_INTEREST_REFRESH_MS",
                defaults.interest_refresh_interval,
            )?,
            membership_poll_interval: env_duration_ms(
                "CLUSTER_MEMBERSHIP_POLL_MS",
                defaults.membership_poll_interval,
            )?,
            heartbeat_stale_after: env_duration_ms(
                "CLUSTER_HEARTBEAT_STALE_MS",
                defaults.heartbeat_stale_after,
            )?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.virtual_nodes == 0 {
            return Err(Error::config("virtual_nodes must be at least 1"));
        }
        if self.reevaluate_interval.is_zero()
            || self.interest_refresh_interval.is_zero()
            || self.membership_poll_interval.is_zero()
            || self.forward_timeout.is_zero()
        {
            return Err(Error::config("intervals and timeouts must be non-zero"));
        }
        if self.acquire_backoff_base > self.acquire_backoff_max {
            return Err(Error::config("acquire backoff base exceeds max"));
        }
        self.lease.validate()
    }

    /// Backoff before the next acquisition attempt after `failures`
    /// consecutive failures.
    pub fn acquire_backoff(&self, failures: u32) -> Duration {
        let factor = 2u32.saturating_pow(failures.saturating_sub(1).min(16));
        self.acquire_backoff_base
            .saturating_mul(factor)
            .min(self.acquire_backoff_max)
    }
}

fn env_duration_ms(name: &str, default: Duration) -> Result<Duration> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<u64>()
            .map(Duration::from_millis)
            .map_err(|e| Error::config(format!("{name}: {e}"))),
        Err(_) => Ok(default),
    }
}

fn env_usize(name: &str, default: usize) -> Result<usize> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<usize>()
            .map_err(|e| Error::config(format!("{name}: {e}"))),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lease_backend_default() {
        assert_eq!(LeaseBackendKind::default(), LeaseBackendKind::Redis);
    }

    #[test]
    fn test_lease_backend_display() {
        assert_eq!(LeaseBackendKind::Redis.to_string(), "redis");
        assert_eq!(LeaseBackendKind::InMemory.to_string(), "in-memory");
    }

    #[test]
    fn test_default_config_is_valid() {
        ClusterConfig::default().validate().unwrap();
    }

    #[test]
    fn test_renew_at_expiry_is_rejected() {
        let lease = LeaseConfig {
            ttl: Duration::from_secs(10),
            renew_interval: Duration::from_secs(10),
            safety_margin: Duration::from_secs(1),
            not_ready_grace: Duration::from_secs(1),
        };
        assert!(matches!(lease.validate(), Err(Error::Config(_))));
    }

    #[test]
    fn test_zero_virtual_nodes_rejected() {
        let config = ClusterConfig {
            virtual_nodes: 0,
            ..ClusterConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_local_validity_is_shorter_than_ttl() {
        let lease = LeaseConfig::default();
        assert_eq!(lease.local_validity(), Duration::from_secs(12));
    }

    #[test]
    fn test_acquire_backoff_doubles_and_caps() {
        let config = ClusterConfig::default();
        assert_eq!(config.acquire_backoff(1), Duration::from_millis(100));
        assert_eq!(config.acquire_backoff(2), Duration::from_millis(200));
        assert_eq!(config.acquire_backoff(4), Duration::from_millis(800));
        assert_eq!(config.acquire_backoff(20), Duration::from_millis(6400));
    }
}
