//! Consistency Checker
//!
//! Read-only audits of the entity graph. These passes never write and are
//! not transactional: under concurrent mutation they may observe a torn
//! intermediate state.

use crate::error::{Error, Result};
use crate::model::{
    EntityKind, HealthMonitor, Listener, LoadBalancer, Member, Pool, PublicId, RecordId,
};
use crate::store::Repositories;
use serde::Serialize;
use std::collections::HashSet;
use tracing::{debug, warn};

/// A broken link found by the checker
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckFailure {
    /// Kind of the hop that failed to resolve
    pub hop: EntityKind,
    /// Public id of the entity whose link is broken
    pub id: PublicId,
    pub reason: String,
}

/// Outcome of a consistency check
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "result", rename_all = "lowercase")]
pub enum CheckOutcome {
    Success,
    Error(CheckFailure),
}

impl CheckOutcome {
    pub fn is_success(&self) -> bool {
        matches!(self, CheckOutcome::Success)
    }

    fn fail(hop: EntityKind, id: &PublicId, reason: impl Into<String>) -> Self {
        let failure = CheckFailure {
            hop,
            id: id.clone(),
            reason: reason.into(),
        };
        warn!("Consistency check failed at {} for {}: {}", failure.hop, failure.id, failure.reason);
        CheckOutcome::Error(failure)
    }
}

/// Walks the entity graph and validates referential completeness
#[derive(Clone)]
pub struct ConsistencyChecker {
    repos: Repositories,
}

impl ConsistencyChecker {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// Walk LoadBalancer -> Listener -> Pool -> Member -> HealthMonitor for one LB
    ///
    /// Returns `ResourceNotFound` if the load balancer itself does not exist.
    pub async fn check_entity(&self, loadbalancer_id: &PublicId) -> Result<CheckOutcome> {
        let lb = self
            .repos
            .loadbalancers
            .find(loadbalancer_id)
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::LoadBalancer, loadbalancer_id))?;

        if !self.resolves_listener(lb.listener).await? {
            return Ok(CheckOutcome::fail(
                EntityKind::Listener,
                &lb.loadbalancer_id,
                "listener does not resolve",
            ));
        }

        let pool = match lb.pool {
            Some(id) => self.repos.pools.get(id).await?,
            None => None,
        };
        let pool = match pool {
            Some(pool) => pool,
            None => {
                return Ok(CheckOutcome::fail(
                    EntityKind::Pool,
                    &lb.loadbalancer_id,
                    "pool does not resolve",
                ))
            }
        };

        if let Some(outcome) = self.check_pool_children(&pool).await? {
            return Ok(outcome);
        }

        debug!("Consistency check passed for {}", lb.loadbalancer_id);
        Ok(CheckOutcome::Success)
    }

    /// Exhaustive audit of all five collections in both directions
    ///
    /// Returns the first broken invariant found.
    pub async fn check_all(&self) -> Result<CheckOutcome> {
        let loadbalancers = self.repos.loadbalancers.list().await?;
        let listeners = self.repos.listeners.list().await?;
        let pools = self.repos.pools.list().await?;
        let members = self.repos.members.list().await?;
        let monitors = self.repos.health_monitors.list().await?;

        let listener_ids: HashSet<RecordId> = listeners.iter().map(|l| l.id).collect();
        let pool_ids: HashSet<RecordId> = pools.iter().map(|p| p.id).collect();
        let monitor_ids: HashSet<RecordId> = monitors.iter().map(|h| h.id).collect();

        // LoadBalancer -> Listener, Pool
        for lb in &loadbalancers {
            if !lb.listener.map_or(false, |id| listener_ids.contains(&id)) {
                return Ok(CheckOutcome::fail(
                    EntityKind::Listener,
                    &lb.loadbalancer_id,
                    "listener does not resolve",
                ));
            }
            if !lb.pool.map_or(false, |id| pool_ids.contains(&id)) {
                return Ok(CheckOutcome::fail(
                    EntityKind::Pool,
                    &lb.loadbalancer_id,
                    "pool does not resolve",
                ));
            }
        }

        // Listener <- LoadBalancer
        if let Some(outcome) = Self::unreferenced(
            &listeners,
            |l: &Listener| (l.id, l.listener_id.clone()),
            |id| loadbalancers.iter().any(|lb: &LoadBalancer| lb.listener == Some(id)),
            EntityKind::Listener,
            "listener is not referenced by any loadbalancer",
        ) {
            return Ok(outcome);
        }

        // Pool <- LoadBalancer, Pool -> Member, HealthMonitor
        if let Some(outcome) = Self::unreferenced(
            &pools,
            |p: &Pool| (p.id, p.pool_id.clone()),
            |id| loadbalancers.iter().any(|lb: &LoadBalancer| lb.pool == Some(id)),
            EntityKind::Pool,
            "pool is not referenced by any loadbalancer",
        ) {
            return Ok(outcome);
        }
        for pool in &pools {
            if !members.iter().any(|m: &Member| m.pool == pool.id) {
                return Ok(CheckOutcome::fail(EntityKind::Member, &pool.pool_id, "pool has no members"));
            }
            if !pool.health_monitor.map_or(false, |id| monitor_ids.contains(&id)) {
                return Ok(CheckOutcome::fail(
                    EntityKind::HealthMonitor,
                    &pool.pool_id,
                    "health monitor does not resolve",
                ));
            }
        }

        // Member -> Pool
        for member in &members {
            if !pool_ids.contains(&member.pool) {
                return Ok(CheckOutcome::fail(
                    EntityKind::Pool,
                    &member.member_id,
                    "owning pool does not resolve",
                ));
            }
        }

        // HealthMonitor <- Pool
        if let Some(outcome) = Self::unreferenced(
            &monitors,
            |h: &HealthMonitor| (h.id, h.health_monitor_id.clone()),
            |id| pools.iter().any(|p: &Pool| p.health_monitor == Some(id)),
            EntityKind::HealthMonitor,
            "health monitor is not referenced by any pool",
        ) {
            return Ok(outcome);
        }

        debug!(
            "Consistency audit passed ({} loadbalancers, {} listeners, {} pools, {} members, {} health monitors)",
            loadbalancers.len(),
            listeners.len(),
            pools.len(),
            members.len(),
            monitors.len()
        );
        Ok(CheckOutcome::Success)
    }

    async fn resolves_listener(&self, listener: Option<RecordId>) -> Result<bool> {
        match listener {
            Some(id) => Ok(self.repos.listeners.get(id).await?.is_some()),
            None => Ok(false),
        }
    }

    async fn check_pool_children(&self, pool: &Pool) -> Result<Option<CheckOutcome>> {
        let pool_id = pool.id;
        if self.repos.members.count(&|m: &Member| m.pool == pool_id).await? == 0 {
            return Ok(Some(CheckOutcome::fail(
                EntityKind::Member,
                &pool.pool_id,
                "pool has no members",
            )));
        }

        let monitor = match pool.health_monitor {
            Some(id) => self.repos.health_monitors.get(id).await?,
            None => None,
        };
        if monitor.is_none() {
            return Ok(Some(CheckOutcome::fail(
                EntityKind::HealthMonitor,
                &pool.pool_id,
                "health monitor does not resolve",
            )));
        }
        Ok(None)
    }

    fn unreferenced<T>(
        records: &[T],
        identity: impl Fn(&T) -> (RecordId, PublicId),
        is_referenced: impl Fn(RecordId) -> bool,
        kind: EntityKind,
        reason: &str,
    ) -> Option<CheckOutcome> {
        records.iter().find_map(|record| {
            let (id, public_id) = identity(record);
            if is_referenced(id) {
                None
            } else {
                Some(CheckOutcome::fail(kind, &public_id, reason))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    async fn complete_graph(repos: &Repositories) -> LoadBalancer {
        let hm = repos
            .health_monitors
            .insert(HealthMonitor::new("hm-1".into(), "hm", "HTTP", 5, 3, 2))
            .await
            .unwrap();
        let mut pool = Pool::new("pool-1".into(), "pool", "ROUND_ROBIN", "HTTP");
        pool.health_monitor = Some(hm.id);
        let pool = repos.pools.insert(pool).await.unwrap();
        repos
            .members
            .insert(Member::new("member-1".into(), pool.id, "10.0.1.1", 80))
            .await
            .unwrap();
        let listener = repos
            .listeners
            .insert(Listener::new("listener-1".into(), "http", "HTTP", 80, 8080))
            .await
            .unwrap();
        let mut lb = LoadBalancer::new("lb-1".into(), "web", "10.0.0.5", "lbaas");
        lb.listener = Some(listener.id);
        lb.pool = Some(pool.id);
        repos.loadbalancers.insert(lb).await.unwrap()
    }

    #[tokio::test]
    async fn test_complete_graph_passes() {
        let repos = Repositories::in_memory();
        let lb = complete_graph(&repos).await;
        let checker = ConsistencyChecker::new(repos);

        assert!(checker.check_entity(&lb.loadbalancer_id).await.unwrap().is_success());
        assert!(checker.check_all().await.unwrap().is_success());
    }

    #[tokio::test]
    async fn test_check_entity_unknown_loadbalancer() {
        let checker = ConsistencyChecker::new(Repositories::in_memory());
        let err = checker.check_entity(&PublicId::from("missing")).await.unwrap_err();
        assert_matches!(err, Error::ResourceNotFound { kind: EntityKind::LoadBalancer, .. });
    }

    #[tokio::test]
    async fn test_check_entity_short_circuits_on_missing_members() {
        let repos = Repositories::in_memory();
        let lb = complete_graph(&repos).await;
        let members = repos.members.list().await.unwrap();
        repos.members.remove(members[0].id).await.unwrap();

        let checker = ConsistencyChecker::new(repos);
        let outcome = checker.check_entity(&lb.loadbalancer_id).await.unwrap();
        assert_matches!(
            outcome,
            CheckOutcome::Error(CheckFailure { hop: EntityKind::Member, ref id, .. }) if id.as_str() == "pool-1"
        );
    }

    #[tokio::test]
    async fn test_check_all_reports_empty_pool() {
        let repos = Repositories::in_memory();
        complete_graph(&repos).await;

        let hm = repos.health_monitors.list().await.unwrap().remove(0);
        let mut orphan = Pool::new("pool-empty".into(), "empty", "ROUND_ROBIN", "HTTP");
        orphan.health_monitor = Some(hm.id);
        let orphan = repos.pools.insert(orphan).await.unwrap();
        // Referenced so the reverse-direction check passes
        let listener = repos.listeners.list().await.unwrap().remove(0);
        let mut lb = LoadBalancer::new("lb-2".into(), "other", "10.0.0.6", "lbaas");
        lb.listener = Some(listener.id);
        lb.pool = Some(orphan.id);
        repos.loadbalancers.insert(lb).await.unwrap();

        let checker = ConsistencyChecker::new(repos);
        let outcome = checker.check_all().await.unwrap();
        assert_eq!(
            outcome,
            CheckOutcome::Error(CheckFailure {
                hop: EntityKind::Member,
                id: PublicId::from("pool-empty"),
                reason: "pool has no members".into(),
            })
        );
    }

    #[tokio::test]
    async fn test_check_all_reports_unreferenced_monitor() {
        let repos = Repositories::in_memory();
        complete_graph(&repos).await;
        repos
            .health_monitors
            .insert(HealthMonitor::new("hm-spare".into(), "spare", "TCP", 5, 3, 2))
            .await
            .unwrap();

        let outcome = ConsistencyChecker::new(repos).check_all().await.unwrap();
        assert_matches!(
            outcome,
            CheckOutcome::Error(CheckFailure { hop: EntityKind::HealthMonitor, ref id, .. }) if id.as_str() == "hm-spare"
        );
    }

    #[test]
    fn test_outcome_serialization() {
        let json = serde_json::to_value(CheckOutcome::Success).unwrap();
        assert_eq!(json, serde_json::json!({"result": "success"}));

        let json = serde_json::to_value(CheckOutcome::Error(CheckFailure {
            hop: EntityKind::Pool,
            id: PublicId::from("lb-1"),
            reason: "pool does not resolve".into(),
        }))
        .unwrap();
        assert_eq!(json["result"], "error");
        assert_eq!(json["hop"], "pool");
    }
}
