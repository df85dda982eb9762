//! Enforcement-agent Sync Pipeline
//!
//! Wakes on a fixed interval and pushes every dirty load balancer to the
//! config renderer. A load balancer stays dirty until a render succeeds, so
//! not-ready snapshots and failed renders are retried on the next cycle.

use crate::config::SyncSettings;
use crate::domain::{ConfigRendererRef, InfrastructureProviderRef};
use crate::error::{Error, Result};
use crate::model::{EntityKind, InstanceId, LoadBalancer, PoolStatus, StatusTag, STATUS_TAG_NAME};
use crate::reconcile::{Readiness, SnapshotAssembler, StatusAggregator};
use crate::store::Repositories;
use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Outcome of syncing one load balancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SyncOutcome {
    Rendered,
    NotReady { reason: String },
}

// =============================================================================
// Sync Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct SyncStats {
    pub cycles: AtomicU64,
    pub rendered: AtomicU64,
    pub not_ready: AtomicU64,
    pub failed: AtomicU64,
}

impl SyncStats {
    pub fn snapshot(&self) -> SyncStatsSnapshot {
        SyncStatsSnapshot {
            cycles: self.cycles.load(Ordering::Relaxed),
            rendered: self.rendered.load(Ordering::Relaxed),
            not_ready: self.not_ready.load(Ordering::Relaxed),
            failed: self.failed.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SyncStatsSnapshot {
    pub cycles: u64,
    pub rendered: u64,
    pub not_ready: u64,
    pub failed: u64,
}

// =============================================================================
// LoadBalancer Syncer
// =============================================================================

pub struct LoadBalancerSyncer {
    settings: SyncSettings,
    repos: Repositories,
    infra: InfrastructureProviderRef,
    renderer: ConfigRendererRef,
    /// Incomplete pools are ERROR on this path
    aggregator: StatusAggregator,
    assembler: SnapshotAssembler,
    stats: SyncStats,
}

impl LoadBalancerSyncer {
    pub fn new(
        settings: SyncSettings,
        repos: Repositories,
        infra: InfrastructureProviderRef,
        renderer: ConfigRendererRef,
    ) -> Arc<Self> {
        Arc::new(Self {
            settings,
            aggregator: StatusAggregator::new(repos.clone())
                .with_incomplete_pool_status(PoolStatus::Error),
            assembler: SnapshotAssembler::new(repos.clone()),
            repos,
            infra,
            renderer,
            stats: SyncStats::default(),
        })
    }

    pub fn stats(&self) -> SyncStatsSnapshot {
        self.stats.snapshot()
    }

    /// Run forever at the configured interval
    pub async fn run(self: Arc<Self>) {
        info!(
            "Sync pipeline running every {}s via {} renderer",
            self.settings.interval_secs,
            self.renderer.renderer_name()
        );
        let mut ticker = tokio::time::interval(Duration::from_secs(self.settings.interval_secs.max(1)));
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            ticker.tick().await;
            if let Err(e) = self.sync_pending().await {
                error!("Sync cycle failed: {}", e);
            }
        }
    }

    /// Sync every dirty load balancer; returns how many were rendered
    pub async fn sync_pending(&self) -> Result<usize> {
        self.stats.cycles.fetch_add(1, Ordering::Relaxed);
        let dirty = self
            .repos
            .loadbalancers
            .filter(&|lb: &LoadBalancer| lb.is_dirty())
            .await?;

        let mut rendered = 0;
        for lb in dirty {
            match self.sync_one(&lb).await {
                Ok(SyncOutcome::Rendered) => rendered += 1,
                Ok(SyncOutcome::NotReady { reason }) => {
                    debug!(loadbalancer_id = %lb.loadbalancer_id, "Not ready: {}", reason);
                }
                Err(e) => {
                    self.stats.failed.fetch_add(1, Ordering::Relaxed);
                    warn!(loadbalancer_id = %lb.loadbalancer_id, "Sync failed: {}", e);
                }
            }
        }
        Ok(rendered)
    }

    /// Sync one load balancer to the enforcement agent
    pub async fn sync_one(&self, lb: &LoadBalancer) -> Result<SyncOutcome> {
        if let Some(instance_id) = &lb.instance_id {
            if let Err(e) = self.ensure_status_tag(instance_id).await {
                warn!(
                    loadbalancer_id = %lb.loadbalancer_id,
                    "Could not ensure status tag on {}: {}", instance_id, e
                );
            }
        }

        // Capture the version being rendered before any status writes
        let version = lb.updated_at;

        if let Some(pool) = lb.pool {
            if self.repos.pools.get(pool).await?.is_some() {
                self.aggregator.recompute_pool_status(pool).await?;
            }
        }
        self.aggregator.recompute_loadbalancer_status(lb.id).await?;

        let snapshot = match self.assembler.assemble(lb.id).await? {
            Readiness::Ready(snapshot) => snapshot,
            Readiness::NotReady { reason } => {
                self.stats.not_ready.fetch_add(1, Ordering::Relaxed);
                return Ok(SyncOutcome::NotReady { reason });
            }
        };

        let fields = snapshot.to_handoff_fields(Utc::now())?;
        self.renderer.render(&fields).await?;

        self.repos
            .loadbalancers
            .modify(
                lb.id,
                Box::new(move |l: &mut LoadBalancer| l.enacted_at = Some(version)),
            )
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::LoadBalancer, &lb.loadbalancer_id))?;

        self.stats.rendered.fetch_add(1, Ordering::Relaxed);
        info!(
            loadbalancer_id = %lb.loadbalancer_id,
            "Configuration rendered (vip {}, {} members)",
            snapshot.loadbalancer.vip_address,
            snapshot.members.len()
        );
        Ok(SyncOutcome::Rendered)
    }

    /// Create the default health tag if the instance has none yet
    async fn ensure_status_tag(&self, instance_id: &InstanceId) -> Result<()> {
        let instance = self
            .infra
            .get_instance(instance_id)
            .await?
            .filter(|i| !i.deleted)
            .ok_or_else(|| Error::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })?;

        if self.infra.get_tag(&instance.id, STATUS_TAG_NAME).await?.is_some() {
            return Ok(());
        }
        let tag = StatusTag::initial(Utc::now());
        self.infra
            .put_tag(&instance.id, STATUS_TAG_NAME, tag.to_json()?)
            .await?;
        info!("Created {} tag on instance {}", STATUS_TAG_NAME, instance.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{ConfigRenderer, HandoffFields, InfrastructureProvider};
    use crate::infra::MemoryInfrastructure;
    use crate::model::{BackendState, HealthMonitor, Instance, Listener, Member, Pool, RecordId};
    use crate::reconcile::DryRunRenderer;
    use async_trait::async_trait;

    struct FailingRenderer;

    #[async_trait]
    impl ConfigRenderer for FailingRenderer {
        async fn render(&self, _fields: &HandoffFields) -> Result<()> {
            Err(Error::Validation("template error".into()))
        }

        fn renderer_name(&self) -> &str {
            "failing"
        }
    }

    async fn graph(repos: &Repositories, with_member: bool) -> (RecordId, RecordId) {
        let hm = repos
            .health_monitors
            .insert(HealthMonitor::new("hm-1".into(), "hm", "HTTP", 5, 3, 2))
            .await
            .unwrap();
        let mut pool = Pool::new("pool-1".into(), "pool", "ROUND_ROBIN", "HTTP");
        pool.health_monitor = Some(hm.id);
        let pool = repos.pools.insert(pool).await.unwrap();
        if with_member {
            repos
                .members
                .insert(Member::new("member-1".into(), pool.id, "10.0.1.1", 8080))
                .await
                .unwrap();
        }
        let listener = repos
            .listeners
            .insert(Listener::new("listener-1".into(), "http", "HTTP", 80, 8404))
            .await
            .unwrap();
        let mut lb = LoadBalancer::new("lb-1".into(), "web", "10.0.0.5", "lbaas");
        lb.listener = Some(listener.id);
        lb.pool = Some(pool.id);
        lb.instance_id = Some(InstanceId::from("i-1"));
        let lb = repos.loadbalancers.insert(lb).await.unwrap();
        (lb.id, pool.id)
    }

    async fn infra() -> Arc<MemoryInfrastructure> {
        let infra = MemoryInfrastructure::new();
        infra
            .register_instance(
                Instance::new(InstanceId::from("i-1"), "haproxy", BackendState::Provisioned),
                vec![],
            )
            .await
            .unwrap();
        infra
    }

    #[tokio::test]
    async fn test_dirty_loadbalancer_rendered_once() {
        let repos = Repositories::in_memory();
        let (lb, _) = graph(&repos, true).await;
        let infra = infra().await;
        let renderer = Arc::new(DryRunRenderer::new());
        let syncer = LoadBalancerSyncer::new(
            SyncSettings::default(),
            repos.clone(),
            infra.clone(),
            renderer.clone(),
        );

        assert_eq!(syncer.sync_pending().await.unwrap(), 1);
        assert_eq!(renderer.rendered_count(), 1);

        let stored = repos.loadbalancers.get(lb).await.unwrap().unwrap();
        assert!(!stored.is_dirty());
        assert!(renderer.last().unwrap().contains_key("health_monitor"));

        // Default tag created on the instance
        let raw = infra
            .get_tag(&InstanceId::from("i-1"), STATUS_TAG_NAME)
            .await
            .unwrap()
            .unwrap();
        assert!(StatusTag::parse(&raw).unwrap().unwrap().is_uninitialized());

        // Clean records are not re-rendered
        assert_eq!(syncer.sync_pending().await.unwrap(), 0);
        assert_eq!(renderer.rendered_count(), 1);
    }

    #[tokio::test]
    async fn test_incomplete_pool_marked_error_and_stays_dirty() {
        let repos = Repositories::in_memory();
        let (lb, pool) = graph(&repos, false).await;
        let renderer = Arc::new(DryRunRenderer::new());
        let syncer = LoadBalancerSyncer::new(
            SyncSettings::default(),
            repos.clone(),
            infra().await,
            renderer.clone(),
        );

        assert_eq!(syncer.sync_pending().await.unwrap(), 0);
        assert_eq!(renderer.rendered_count(), 0);
        assert_eq!(syncer.stats().not_ready, 1);

        let stored_pool = repos.pools.get(pool).await.unwrap().unwrap();
        assert_eq!(stored_pool.status, PoolStatus::Error);
        assert!(repos.loadbalancers.get(lb).await.unwrap().unwrap().is_dirty());
    }

    #[tokio::test]
    async fn test_failed_render_keeps_record_dirty() {
        let repos = Repositories::in_memory();
        let (lb, _) = graph(&repos, true).await;
        let syncer = LoadBalancerSyncer::new(
            SyncSettings::default(),
            repos.clone(),
            infra().await,
            Arc::new(FailingRenderer),
        );

        assert_eq!(syncer.sync_pending().await.unwrap(), 0);
        assert_eq!(syncer.stats().failed, 1);
        assert!(repos.loadbalancers.get(lb).await.unwrap().unwrap().is_dirty());
    }

    #[tokio::test]
    async fn test_missing_instance_does_not_block_render() {
        let repos = Repositories::in_memory();
        graph(&repos, true).await;
        let renderer = Arc::new(DryRunRenderer::new());
        let syncer = LoadBalancerSyncer::new(
            SyncSettings::default(),
            repos,
            MemoryInfrastructure::new(),
            renderer.clone(),
        );

        assert_eq!(syncer.sync_pending().await.unwrap(), 1);
    }
}
