use crate::lease::LeaseManager;
use crate::membership::MembershipFeed;
use crate::ownership::OwnershipCoordinator;
use crate::registry::RedisRegistry;
use crate::router::{EventRouter, Topic};
use crate::transport::{Inbound, RedisTransport, Transport};
use crate::weight::{ClusterWeight, FixedWeight};
use crate::{ClusterConfig, Member, MembershipView, Partitioner, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

/// One cluster member with every layer wired together: membership view,
/// partitioner, lease manager, ownership coordinator and event router.
pub struct ClusterNode {
    member: Member,
    view: Arc<MembershipView>,
    leases: Arc<LeaseManager>,
    coordinator: Arc<OwnershipCoordinator>,
    router: EventRouter,
    registry: Option<Arc<RedisRegistry>>,
    cancel_token: CancellationToken,
    sync_handle: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for ClusterNode {
    fn drop(&mut self) {
        self.cancel_token.cancel();
    }
}

impl ClusterNode {
    /// Join the cluster described by `config` through Redis: registers
    /// `member` in the registry, keeps the view in sync with it, and uses
    /// Redis for leases (unless `config.lease_backend` says otherwise) and
    /// for the member-to-member transport.
    ///
    /// # Errors
    ///
    /// Returns an error if the configuration is invalid or Redis is
    /// unreachable.
    pub async fn start_redis(config: &ClusterConfig, member: Member) -> Result<Self> {
        config.validate()?;
        let cancel_token = CancellationToken::new();

        let registry = Arc::new(
            RedisRegistry::register(
                &config.redis_url,
                &config.key_prefix,
                member.clone(),
                config.heartbeat_stale_after,
            )
            .await?,
        );

        // Seed the view so the first ownership pass sees the cluster
        let view = Arc::new(MembershipView::new());
        view.replace(registry.fetch().await?);
        let feed: Arc<dyn MembershipFeed> = registry.clone();
        let sync_handle = view.spawn_sync(feed, config.membership_poll_interval, cancel_token.clone());

        let leases = Arc::new(LeaseManager::from_config(member.id.clone(), config).await?);
        let (transport, inbound) =
            RedisTransport::start(&config.redis_url, &config.key_prefix, &member, cancel_token.clone())
                .await?;

        let mut node = Self::assemble(
            config,
            member,
            view,
            leases,
            Arc::new(FixedWeight::default()),
            transport,
            inbound,
        );
        node.registry = Some(registry);
        node.cancel_token = cancel_token;
        *node.sync_handle.lock() = Some(sync_handle);

        tracing::info!(
            member = %node.member,
            members = node.view.snapshot().len(),
            "Cluster node started"
        );
        Ok(node)
    }

    /// Wire caller-provided parts. The caller keeps `view` up to date.
    /// Must be called inside a Tokio runtime.
    pub fn assemble(
        config: &ClusterConfig,
        member: Member,
        view: Arc<MembershipView>,
        leases: Arc<LeaseManager>,
        weight: Arc<dyn ClusterWeight>,
        transport: Arc<dyn Transport>,
        inbound: Inbound,
    ) -> Self {
        let partitioner = Arc::new(Partitioner::new(view.clone(), config.virtual_nodes));
        let coordinator = Arc::new(OwnershipCoordinator::start(
            member.clone(),
            partitioner,
            leases.clone(),
            weight,
            config,
        ));
        let router = EventRouter::start(coordinator.clone(), transport, inbound, config);

        Self {
            member,
            view,
            leases,
            coordinator,
            router,
            registry: None,
            cancel_token: CancellationToken::new(),
            sync_handle: Mutex::new(None),
        }
    }

    pub fn member(&self) -> &Member {
        &self.member
    }

    pub fn view(&self) -> &Arc<MembershipView> {
        &self.view
    }

    pub fn partitioner(&self) -> &Arc<Partitioner> {
        self.coordinator.partitioner()
    }

    pub fn leases(&self) -> &Arc<LeaseManager> {
        &self.leases
    }

    pub fn coordinator(&self) -> &Arc<OwnershipCoordinator> {
        &self.coordinator
    }

    pub fn router(&self) -> &EventRouter {
        &self.router
    }

    pub fn topic(&self, name: &str) -> Topic {
        self.router.get_topic(name)
    }

    /// Readiness gate for new ownership; see [`LeaseManager::set_ready`].
    pub fn set_ready(&self, ready: bool) {
        self.coordinator.set_ready(ready);
    }

    /// Tear down topics, release every lease, leave the registry and stop
    /// background tasks. Idempotent.
    pub async fn shutdown(&self) {
        self.router.shutdown().await;
        self.coordinator.shutdown().await;

        if let Some(registry) = &self.registry {
            if let Err(e) = registry.deregister().await {
                tracing::warn!(member = %self.member, "Failed to deregister: {}", e);
            }
        }

        self.cancel_token.cancel();
        let handle = self.sync_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        tracing::info!(member = %self.member, "Cluster node stopped");
    }
}
