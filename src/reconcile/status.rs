//! Status Aggregator
//!
//! Derives Pool and LoadBalancer status bottom-up from child completeness
//! and persists the result. This is the only path that sets these fields.

use crate::error::{Error, Result};
use crate::model::{Entity, EntityKind, LoadBalancer, Member, Pool, PoolStatus, ProvisioningStatus, RecordId};
use crate::store::Repositories;
use tracing::{debug, warn};

/// Recomputes derived status for pools and load balancers
#[derive(Clone)]
pub struct StatusAggregator {
    repos: Repositories,
    /// Status given to a pool without members or a resolvable health monitor
    incomplete_pool_status: PoolStatus,
}

impl StatusAggregator {
    /// Aggregator used on the request path (incomplete pool -> PENDING_CREATE)
    pub fn new(repos: Repositories) -> Self {
        Self {
            repos,
            incomplete_pool_status: PoolStatus::PendingCreate,
        }
    }

    /// Override the status given to incomplete pools
    pub fn with_incomplete_pool_status(mut self, status: PoolStatus) -> Self {
        self.incomplete_pool_status = status;
        self
    }

    pub fn incomplete_pool_status(&self) -> PoolStatus {
        self.incomplete_pool_status
    }

    /// Recompute and persist a pool's status
    pub async fn recompute_pool_status(&self, pool_id: RecordId) -> Result<PoolStatus> {
        let pool = self
            .repos
            .pools
            .get(pool_id)
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::Pool, pool_id))?;

        let member_count = self
            .repos
            .members
            .count(&|m: &Member| m.pool == pool_id)
            .await?;

        let monitor_resolves = match pool.health_monitor {
            Some(hm) => self.repos.health_monitors.get(hm).await?.is_some(),
            None => false,
        };

        let status = if member_count > 0 && monitor_resolves {
            PoolStatus::Active
        } else {
            self.incomplete_pool_status
        };

        self.repos
            .pools
            .modify(pool_id, Box::new(move |p: &mut Pool| p.status = status))
            .await?;

        debug!(
            "Pool {} status {} (members={}, health_monitor={})",
            pool.pool_id, status, member_count, monitor_resolves
        );
        Ok(status)
    }

    /// Recompute and persist a load balancer's provisioning status
    ///
    /// The pool's status is recomputed first so that the chain is evaluated
    /// against fresh data.
    pub async fn recompute_loadbalancer_status(&self, lb_id: RecordId) -> Result<ProvisioningStatus> {
        let lb = self
            .repos
            .loadbalancers
            .get(lb_id)
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::LoadBalancer, lb_id))?;

        let status = match self.find_broken_hop(&lb).await? {
            None => ProvisioningStatus::Active,
            Some((hop, reason)) => {
                warn!(
                    loadbalancer_id = %lb.loadbalancer_id,
                    "LoadBalancer chain broken at {}: {}", hop, reason
                );
                ProvisioningStatus::Error
            }
        };

        self.repos
            .loadbalancers
            .modify(
                lb_id,
                Box::new(move |l: &mut LoadBalancer| l.provisioning_status = status),
            )
            .await?;

        Ok(status)
    }

    /// Recompute every load balancer that points at the given pool
    pub async fn recompute_loadbalancers_for_pool(&self, pool_id: RecordId) -> Result<usize> {
        let lbs = self
            .repos
            .loadbalancers
            .filter(&|l: &LoadBalancer| l.pool == Some(pool_id))
            .await?;
        for lb in &lbs {
            self.recompute_loadbalancer_status(lb.record_id()).await?;
        }
        Ok(lbs.len())
    }

    async fn find_broken_hop(&self, lb: &LoadBalancer) -> Result<Option<(EntityKind, String)>> {
        let listener_resolves = match lb.listener {
            Some(id) => self.repos.listeners.get(id).await?.is_some(),
            None => false,
        };
        if !listener_resolves {
            return Ok(Some((EntityKind::Listener, "listener does not resolve".into())));
        }

        let pool_id = match lb.pool {
            Some(id) if self.repos.pools.get(id).await?.is_some() => id,
            _ => return Ok(Some((EntityKind::Pool, "pool does not resolve".into()))),
        };

        match self.recompute_pool_status(pool_id).await? {
            PoolStatus::Active => Ok(None),
            other => Ok(Some((
                EntityKind::Pool,
                format!("pool status is {}", other),
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{HealthMonitor, Listener, PublicId};

    struct Fixture {
        repos: Repositories,
        lb: RecordId,
        pool: RecordId,
        hm: RecordId,
    }

    async fn fixture(with_member: bool, with_monitor: bool) -> Fixture {
        let repos = Repositories::in_memory();
        let hm = repos
            .health_monitors
            .insert(HealthMonitor::new("hm".into(), "hm", "HTTP", 5, 3, 2))
            .await
            .unwrap();
        let mut pool = Pool::new("pool".into(), "pool", "ROUND_ROBIN", "HTTP");
        if with_monitor {
            pool.health_monitor = Some(hm.id);
        }
        let pool = repos.pools.insert(pool).await.unwrap();
        if with_member {
            repos
                .members
                .insert(Member::new("m1".into(), pool.id, "10.0.1.1", 80))
                .await
                .unwrap();
        }
        let listener = repos
            .listeners
            .insert(Listener::new("l".into(), "l", "HTTP", 80, 8080))
            .await
            .unwrap();
        let mut lb = LoadBalancer::new(PublicId::from("lb"), "lb", "10.0.0.5", "lbaas");
        lb.listener = Some(listener.id);
        lb.pool = Some(pool.id);
        let lb = repos.loadbalancers.insert(lb).await.unwrap();

        Fixture {
            repos,
            lb: lb.id,
            pool: pool.id,
            hm: hm.id,
        }
    }

    #[tokio::test]
    async fn test_pool_active_iff_members_and_monitor() {
        for (members, monitor, expected) in [
            (true, true, PoolStatus::Active),
            (false, true, PoolStatus::PendingCreate),
            (true, false, PoolStatus::PendingCreate),
            (false, false, PoolStatus::PendingCreate),
        ] {
            let f = fixture(members, monitor).await;
            let aggregator = StatusAggregator::new(f.repos.clone());

            let status = aggregator.recompute_pool_status(f.pool).await.unwrap();
            assert_eq!(status, expected);

            let stored = f.repos.pools.get(f.pool).await.unwrap().unwrap();
            assert_eq!(stored.status, expected);
        }
    }

    #[tokio::test]
    async fn test_sync_policy_marks_incomplete_pool_error() {
        let f = fixture(false, true).await;
        let aggregator =
            StatusAggregator::new(f.repos.clone()).with_incomplete_pool_status(PoolStatus::Error);

        assert_eq!(
            aggregator.recompute_pool_status(f.pool).await.unwrap(),
            PoolStatus::Error
        );
    }

    #[tokio::test]
    async fn test_loadbalancer_active_when_chain_complete() {
        let f = fixture(true, true).await;
        let aggregator = StatusAggregator::new(f.repos.clone());

        let status = aggregator.recompute_loadbalancer_status(f.lb).await.unwrap();
        assert_eq!(status, ProvisioningStatus::Active);

        let lb = f.repos.loadbalancers.get(f.lb).await.unwrap().unwrap();
        assert_eq!(lb.provisioning_status, ProvisioningStatus::Active);
    }

    #[tokio::test]
    async fn test_loadbalancer_error_when_monitor_removed() {
        let f = fixture(true, true).await;
        let aggregator = StatusAggregator::new(f.repos.clone());
        aggregator.recompute_loadbalancer_status(f.lb).await.unwrap();

        // Dangling reference, as seen by a concurrent reader
        f.repos.health_monitors.remove(f.hm).await.unwrap();

        let status = aggregator.recompute_loadbalancer_status(f.lb).await.unwrap();
        assert_eq!(status, ProvisioningStatus::Error);
        let pool = f.repos.pools.get(f.pool).await.unwrap().unwrap();
        assert_eq!(pool.status, PoolStatus::PendingCreate);
    }

    #[tokio::test]
    async fn test_loadbalancer_without_listener_is_error() {
        let f = fixture(true, true).await;
        f.repos
            .loadbalancers
            .modify(f.lb, Box::new(|l: &mut LoadBalancer| l.listener = None))
            .await
            .unwrap();

        let aggregator = StatusAggregator::new(f.repos.clone());
        assert_eq!(
            aggregator.recompute_loadbalancer_status(f.lb).await.unwrap(),
            ProvisioningStatus::Error
        );
    }

    #[tokio::test]
    async fn test_unknown_pool_is_not_found() {
        let repos = Repositories::in_memory();
        let aggregator = StatusAggregator::new(repos);
        assert!(aggregator.recompute_pool_status(RecordId(77)).await.is_err());
    }
}
