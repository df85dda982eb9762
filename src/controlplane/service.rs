//! LBaaS Service
//!
//! Request-facing operations over the entity graph. Every mutation runs in
//! the same order: validate the payload, resolve references by public id,
//! write through the repository, recompute derived pool status where
//! membership or monitoring changed, then hand a resync task to the
//! dispatcher so affected load balancers are re-evaluated off the request
//! path.

use crate::config::ControlPlaneConfig;
use crate::controlplane::fields::{
    check_immutable_id, present, HealthMonitorFields, ListenerFields, LoadBalancerFields,
    MemberFields, PoolFields, RefChange,
};
use crate::controlplane::views::{self, StatusTree};
use crate::domain::{InfrastructureProviderRef, RepositoryRef};
use crate::error::{Error, Result};
use crate::model::{
    BackendState, Entity, EntityKind, HealthMonitor, Instance, InstanceId, Listener, LoadBalancer,
    Member, NetworkPort, Pool, PublicId, RecordId,
};
use crate::reconcile::{CheckOutcome, ConsistencyChecker, ResyncDispatcher, ResyncTask, StatusAggregator};
use crate::store::Repositories;
use chrono::Utc;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};

// =============================================================================
// Lookups
// =============================================================================

/// Fetch an addressed record; a miss is `ResourceNotFound`
async fn lookup<E: Entity>(repo: &RepositoryRef<E>, id: &PublicId) -> Result<E> {
    repo.find(id)
        .await?
        .ok_or_else(|| Error::not_found(E::KIND, id))
}

/// Fetch a referenced record; a miss is `UnresolvedReference`
async fn resolve<E: Entity>(repo: &RepositoryRef<E>, id: &PublicId) -> Result<E> {
    repo.find(id)
        .await?
        .ok_or_else(|| Error::unresolved(E::KIND, id))
}

/// Resolve a reference field into the link change it describes
async fn resolve_link<E: Entity>(
    repo: &RepositoryRef<E>,
    change: RefChange,
) -> Result<Option<Option<RecordId>>> {
    Ok(match change {
        RefChange::Keep => None,
        RefChange::Clear => Some(None),
        RefChange::Set(id) => Some(Some(resolve(repo, &id).await?.record_id())),
    })
}

/// Resolved link changes for a load balancer
#[derive(Debug, Default)]
struct LoadBalancerLinks {
    listener: Option<Option<RecordId>>,
    pool: Option<Option<RecordId>>,
    instance: Option<Option<InstanceId>>,
}

impl LoadBalancerLinks {
    fn apply(&self, lb: &mut LoadBalancer) {
        if let Some(listener) = self.listener {
            lb.listener = listener;
        }
        if let Some(pool) = self.pool {
            lb.pool = pool;
        }
        if let Some(instance) = &self.instance {
            lb.instance_id = instance.clone();
        }
    }
}

// =============================================================================
// Report Types
// =============================================================================

/// Result of a consistency audit for one load balancer plus the whole graph
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CheckReport {
    pub loadbalancer_id: PublicId,
    pub loadbalancer: CheckOutcome,
    pub all: CheckOutcome,
}

/// Payload announcing an infrastructure instance and its ports
#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct InstanceRegistration {
    pub name: String,
    pub backend_state: BackendState,
    #[serde(default)]
    pub ports: Vec<PortRegistration>,
}

#[derive(Debug, Clone, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PortRegistration {
    pub ip: String,
    #[serde(default)]
    pub network: Option<String>,
}

// =============================================================================
// Service
// =============================================================================

/// CRUD and audit operations over the load balancer graph
pub struct LbaasService {
    repos: Repositories,
    infra: InfrastructureProviderRef,
    dispatcher: Arc<ResyncDispatcher>,
    aggregator: StatusAggregator,
    checker: ConsistencyChecker,
    default_owner: String,
    services: Vec<String>,
}

impl LbaasService {
    pub fn new(
        config: &ControlPlaneConfig,
        repos: Repositories,
        infra: InfrastructureProviderRef,
        dispatcher: Arc<ResyncDispatcher>,
    ) -> Arc<Self> {
        Arc::new(Self {
            aggregator: StatusAggregator::new(repos.clone()),
            checker: ConsistencyChecker::new(repos.clone()),
            repos,
            infra,
            dispatcher,
            default_owner: config.default_owner.clone(),
            services: config.services.clone(),
        })
    }

    pub fn repos(&self) -> &Repositories {
        &self.repos
    }

    pub fn infra(&self) -> &InfrastructureProviderRef {
        &self.infra
    }

    pub fn dispatcher(&self) -> &Arc<ResyncDispatcher> {
        &self.dispatcher
    }

    /// Whether an owning service name is known
    pub fn knows_service(&self, name: &str) -> bool {
        self.services.iter().any(|s| s == name)
    }

    /// Owner assigned to load balancers created without one
    pub fn default_owner(&self) -> &str {
        &self.default_owner
    }

    fn check_owner(&self, owner: &str) -> Result<()> {
        if self.knows_service(owner) {
            Ok(())
        } else {
            Err(Error::Validation(format!("unknown owning service '{}'", owner)))
        }
    }

    async fn resolve_instance(&self, change: RefChange) -> Result<Option<Option<InstanceId>>> {
        Ok(match change {
            RefChange::Keep => None,
            RefChange::Clear => Some(None),
            RefChange::Set(id) => {
                let instance_id = InstanceId::from(id.as_str());
                let live = self
                    .infra
                    .get_instance(&instance_id)
                    .await?
                    .filter(|i| !i.deleted);
                if live.is_none() {
                    return Err(Error::InstanceNotFound {
                        instance_id: instance_id.to_string(),
                    });
                }
                Some(Some(instance_id))
            }
        })
    }

    async fn resolve_loadbalancer_links(&self, fields: &LoadBalancerFields) -> Result<LoadBalancerLinks> {
        Ok(LoadBalancerLinks {
            listener: resolve_link(&self.repos.listeners, RefChange::from_field(&fields.listener)).await?,
            pool: resolve_link(&self.repos.pools, RefChange::from_field(&fields.pool)).await?,
            instance: self.resolve_instance(RefChange::from_field(&fields.instance_id)).await?,
        })
    }

    /// Recompute a pool's status and return the fresh record
    async fn refresh_pool(&self, pool_id: RecordId) -> Result<Pool> {
        self.aggregator.recompute_pool_status(pool_id).await?;
        self.repos
            .pools
            .get(pool_id)
            .await?
            .ok_or_else(|| Error::Internal(format!("pool record {} vanished during update", pool_id)))
    }

    // =========================================================================
    // Load Balancers
    // =========================================================================

    pub async fn create_loadbalancer(&self, fields: LoadBalancerFields) -> Result<LoadBalancer> {
        let mut draft = fields.draft(&self.default_owner)?;
        self.check_owner(&draft.owner)?;
        self.resolve_loadbalancer_links(&fields).await?.apply(&mut draft);

        let lb = self.repos.loadbalancers.insert(draft).await?;
        info!("Created load balancer {} ({})", lb.loadbalancer_id, lb.name);
        self.dispatcher
            .dispatch(ResyncTask::LoadBalancerChanged { loadbalancer: lb.id });
        Ok(lb)
    }

    pub async fn get_loadbalancer(&self, id: &PublicId) -> Result<LoadBalancer> {
        lookup(&self.repos.loadbalancers, id).await
    }

    pub async fn list_loadbalancers(&self) -> Result<Vec<LoadBalancer>> {
        self.repos.loadbalancers.list().await
    }

    pub async fn update_loadbalancer(&self, id: &PublicId, fields: LoadBalancerFields) -> Result<LoadBalancer> {
        let current = lookup(&self.repos.loadbalancers, id).await?;
        check_immutable_id(EntityKind::LoadBalancer, &current.loadbalancer_id, &fields.id)?;
        if let Some(owner) = present(&fields.owner) {
            self.check_owner(owner)?;
        }
        let links = self.resolve_loadbalancer_links(&fields).await?;

        let updated = self
            .repos
            .loadbalancers
            .modify(
                current.id,
                Box::new(move |lb: &mut LoadBalancer| {
                    fields.apply(lb);
                    links.apply(lb);
                    lb.touch();
                }),
            )
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::LoadBalancer, id))?;

        debug!("Updated load balancer {}", id);
        self.dispatcher
            .dispatch(ResyncTask::LoadBalancerChanged { loadbalancer: updated.id });
        Ok(updated)
    }

    /// Delete a load balancer and tear down its backing instance
    pub async fn delete_loadbalancer(&self, id: &PublicId) -> Result<()> {
        let lb = lookup(&self.repos.loadbalancers, id).await?;

        if let Some(instance_id) = &lb.instance_id {
            match self.infra.delete_instance(instance_id).await {
                Ok(()) => info!("Deleted instance {} backing load balancer {}", instance_id, id),
                Err(Error::InstanceNotFound { .. }) => {
                    warn!("Instance {} backing load balancer {} already gone", instance_id, id)
                }
                Err(e) => return Err(e),
            }
        }

        self.repos.loadbalancers.remove(lb.id).await?;
        info!("Deleted load balancer {}", id);
        Ok(())
    }

    /// Operational status tree for one load balancer
    pub async fn statuses(&self, id: &PublicId) -> Result<StatusTree> {
        let lb = lookup(&self.repos.loadbalancers, id).await?;
        views::status_tree(&self.repos, &lb).await
    }

    /// Run the single-entity and global consistency audits
    pub async fn check(&self, id: &PublicId) -> Result<CheckReport> {
        let loadbalancer = self.checker.check_entity(id).await?;
        let all = self.checker.check_all().await?;
        Ok(CheckReport {
            loadbalancer_id: id.clone(),
            loadbalancer,
            all,
        })
    }

    // =========================================================================
    // Listeners
    // =========================================================================

    pub async fn create_listener(&self, fields: ListenerFields) -> Result<Listener> {
        let listener = self.repos.listeners.insert(fields.draft()?).await?;
        info!("Created listener {} ({})", listener.listener_id, listener.name);
        self.dispatcher
            .dispatch(ResyncTask::ListenerChanged { listener: listener.id });
        Ok(listener)
    }

    pub async fn get_listener(&self, id: &PublicId) -> Result<Listener> {
        lookup(&self.repos.listeners, id).await
    }

    pub async fn list_listeners(&self) -> Result<Vec<Listener>> {
        self.repos.listeners.list().await
    }

    pub async fn update_listener(&self, id: &PublicId, fields: ListenerFields) -> Result<Listener> {
        let current = lookup(&self.repos.listeners, id).await?;
        check_immutable_id(EntityKind::Listener, &current.listener_id, &fields.id)?;
        fields.validate()?;

        let updated = self
            .repos
            .listeners
            .modify(
                current.id,
                Box::new(move |listener: &mut Listener| {
                    fields.apply(listener);
                    listener.updated_at = Utc::now();
                }),
            )
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::Listener, id))?;

        self.dispatcher
            .dispatch(ResyncTask::ListenerChanged { listener: updated.id });
        Ok(updated)
    }

    pub async fn delete_listener(&self, id: &PublicId) -> Result<()> {
        let listener = lookup(&self.repos.listeners, id).await?;
        let rid = listener.id;

        let users = self
            .repos
            .loadbalancers
            .count(&move |lb: &LoadBalancer| lb.listener == Some(rid))
            .await?;
        if users > 0 {
            return Err(Error::ResourceInUse {
                kind: EntityKind::Listener,
                id: id.to_string(),
                dependent: EntityKind::LoadBalancer,
            });
        }

        self.repos.listeners.remove(rid).await?;
        info!("Deleted listener {}", id);
        self.dispatcher.dispatch(ResyncTask::ListenerChanged { listener: rid });
        Ok(())
    }

    // =========================================================================
    // Pools
    // =========================================================================

    pub async fn create_pool(&self, fields: PoolFields) -> Result<Pool> {
        let mut draft = fields.draft()?;
        if let Some(link) = resolve_link(
            &self.repos.health_monitors,
            RefChange::from_field(&fields.health_monitor),
        )
        .await?
        {
            draft.health_monitor = link;
        }

        let pool = self.repos.pools.insert(draft).await?;
        info!("Created pool {} ({})", pool.pool_id, pool.name);
        let pool = self.refresh_pool(pool.id).await?;
        self.dispatcher.dispatch(ResyncTask::PoolChanged { pool: pool.id });
        Ok(pool)
    }

    pub async fn get_pool(&self, id: &PublicId) -> Result<Pool> {
        lookup(&self.repos.pools, id).await
    }

    pub async fn list_pools(&self) -> Result<Vec<Pool>> {
        self.repos.pools.list().await
    }

    pub async fn update_pool(&self, id: &PublicId, fields: PoolFields) -> Result<Pool> {
        let current = lookup(&self.repos.pools, id).await?;
        check_immutable_id(EntityKind::Pool, &current.pool_id, &fields.id)?;
        let monitor = resolve_link(
            &self.repos.health_monitors,
            RefChange::from_field(&fields.health_monitor),
        )
        .await?;

        self.repos
            .pools
            .modify(
                current.id,
                Box::new(move |pool: &mut Pool| {
                    fields.apply(pool);
                    if let Some(link) = monitor {
                        pool.health_monitor = link;
                    }
                    pool.updated_at = Utc::now();
                }),
            )
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::Pool, id))?;

        let pool = self.refresh_pool(current.id).await?;
        self.dispatcher.dispatch(ResyncTask::PoolChanged { pool: pool.id });
        Ok(pool)
    }

    pub async fn delete_pool(&self, id: &PublicId) -> Result<()> {
        let pool = lookup(&self.repos.pools, id).await?;
        let rid = pool.id;

        let in_use = |dependent| Error::ResourceInUse {
            kind: EntityKind::Pool,
            id: id.to_string(),
            dependent,
        };
        if self
            .repos
            .loadbalancers
            .count(&move |lb: &LoadBalancer| lb.pool == Some(rid))
            .await?
            > 0
        {
            return Err(in_use(EntityKind::LoadBalancer));
        }
        if self
            .repos
            .members
            .count(&move |m: &Member| m.pool == rid)
            .await?
            > 0
        {
            return Err(in_use(EntityKind::Member));
        }

        self.repos.pools.remove(rid).await?;
        info!("Deleted pool {}", id);
        self.dispatcher.dispatch(ResyncTask::PoolChanged { pool: rid });
        Ok(())
    }

    // =========================================================================
    // Members
    // =========================================================================

    /// Fetch a member addressed through its owning pool
    async fn lookup_member(&self, pool_id: &PublicId, member_id: &PublicId) -> Result<(Pool, Member)> {
        let pool = lookup(&self.repos.pools, pool_id).await?;
        let member = lookup(&self.repos.members, member_id).await?;
        if member.pool != pool.id {
            return Err(Error::not_found(EntityKind::Member, member_id));
        }
        Ok((pool, member))
    }

    pub async fn create_member(&self, fields: MemberFields) -> Result<Member> {
        let pool_id = present(&fields.pool).map(PublicId::from).ok_or(Error::MissingField {
            kind: EntityKind::Member,
            field: "pool",
        })?;
        let pool = resolve(&self.repos.pools, &pool_id).await?;

        let member = self.repos.members.insert(fields.draft(&pool)?).await?;
        info!(
            "Added member {} ({}:{}) to pool {}",
            member.member_id, member.address, member.protocol_port, pool.pool_id
        );
        self.refresh_pool(pool.id).await?;
        self.dispatcher.dispatch(ResyncTask::MemberChanged { pool: pool.id });
        Ok(member)
    }

    pub async fn get_member(&self, pool_id: &PublicId, member_id: &PublicId) -> Result<Member> {
        self.lookup_member(pool_id, member_id).await.map(|(_, m)| m)
    }

    pub async fn list_members(&self, pool_id: &PublicId) -> Result<Vec<Member>> {
        let pool = lookup(&self.repos.pools, pool_id).await?;
        let rid = pool.id;
        self.repos.members.filter(&move |m: &Member| m.pool == rid).await
    }

    /// Update a member; setting `pool` moves it and refreshes both pools
    pub async fn update_member(
        &self,
        pool_id: &PublicId,
        member_id: &PublicId,
        fields: MemberFields,
    ) -> Result<Member> {
        let (pool, current) = self.lookup_member(pool_id, member_id).await?;
        check_immutable_id(EntityKind::Member, &current.member_id, &fields.id)?;
        fields.validate()?;

        let target = match RefChange::from_field(&fields.pool) {
            RefChange::Keep => pool.id,
            RefChange::Clear => {
                return Err(Error::Validation("member pool cannot be cleared".into()));
            }
            RefChange::Set(id) => resolve(&self.repos.pools, &id).await?.id,
        };

        let updated = self
            .repos
            .members
            .modify(
                current.id,
                Box::new(move |member: &mut Member| {
                    fields.apply(member);
                    member.pool = target;
                    member.updated_at = Utc::now();
                }),
            )
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::Member, member_id))?;

        self.refresh_pool(pool.id).await?;
        self.dispatcher.dispatch(ResyncTask::MemberChanged { pool: pool.id });
        if target != pool.id {
            info!("Moved member {} to pool record {}", member_id, target);
            self.refresh_pool(target).await?;
            self.dispatcher.dispatch(ResyncTask::MemberChanged { pool: target });
        }
        Ok(updated)
    }

    pub async fn delete_member(&self, pool_id: &PublicId, member_id: &PublicId) -> Result<()> {
        let (pool, member) = self.lookup_member(pool_id, member_id).await?;

        self.repos.members.remove(member.id).await?;
        info!("Removed member {} from pool {}", member_id, pool_id);
        self.refresh_pool(pool.id).await?;
        self.dispatcher.dispatch(ResyncTask::MemberChanged { pool: pool.id });
        Ok(())
    }

    // =========================================================================
    // Health Monitors
    // =========================================================================

    pub async fn create_health_monitor(&self, fields: HealthMonitorFields) -> Result<HealthMonitor> {
        let monitor = self.repos.health_monitors.insert(fields.draft()?).await?;
        info!(
            "Created health monitor {} ({})",
            monitor.health_monitor_id, monitor.name
        );
        self.dispatcher.dispatch(ResyncTask::HealthMonitorChanged {
            health_monitor: monitor.id,
        });
        Ok(monitor)
    }

    pub async fn get_health_monitor(&self, id: &PublicId) -> Result<HealthMonitor> {
        lookup(&self.repos.health_monitors, id).await
    }

    pub async fn list_health_monitors(&self) -> Result<Vec<HealthMonitor>> {
        self.repos.health_monitors.list().await
    }

    pub async fn update_health_monitor(
        &self,
        id: &PublicId,
        fields: HealthMonitorFields,
    ) -> Result<HealthMonitor> {
        let current = lookup(&self.repos.health_monitors, id).await?;
        check_immutable_id(EntityKind::HealthMonitor, &current.health_monitor_id, &fields.id)?;

        let updated = self
            .repos
            .health_monitors
            .modify(
                current.id,
                Box::new(move |monitor: &mut HealthMonitor| {
                    fields.apply(monitor);
                    monitor.updated_at = Utc::now();
                }),
            )
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::HealthMonitor, id))?;

        self.dispatcher.dispatch(ResyncTask::HealthMonitorChanged {
            health_monitor: updated.id,
        });
        Ok(updated)
    }

    pub async fn delete_health_monitor(&self, id: &PublicId) -> Result<()> {
        let monitor = lookup(&self.repos.health_monitors, id).await?;
        let rid = monitor.id;

        let users = self
            .repos
            .pools
            .count(&move |p: &Pool| p.health_monitor == Some(rid))
            .await?;
        if users > 0 {
            return Err(Error::ResourceInUse {
                kind: EntityKind::HealthMonitor,
                id: id.to_string(),
                dependent: EntityKind::Pool,
            });
        }

        self.repos.health_monitors.remove(rid).await?;
        info!("Deleted health monitor {}", id);
        self.dispatcher
            .dispatch(ResyncTask::HealthMonitorChanged { health_monitor: rid });
        Ok(())
    }

    // =========================================================================
    // Instances
    // =========================================================================

    pub async fn list_instances(&self) -> Result<Vec<Instance>> {
        self.infra.list_instances().await
    }

    /// Register or refresh an instance observed by the infrastructure
    pub async fn register_instance(&self, id: &str, registration: InstanceRegistration) -> Result<Instance> {
        if id.trim().is_empty() {
            return Err(Error::Validation("instance id must not be empty".into()));
        }
        let instance_id = InstanceId::from(id);
        let ports = registration
            .ports
            .into_iter()
            .map(|p| NetworkPort {
                instance_id: instance_id.clone(),
                ip: p.ip,
                network: p.network,
            })
            .collect();

        self.infra
            .register_instance(
                Instance::new(instance_id.clone(), registration.name, registration.backend_state),
                ports,
            )
            .await?;
        self.infra
            .get_instance(&instance_id)
            .await?
            .ok_or(Error::InstanceNotFound {
                instance_id: instance_id.to_string(),
            })
    }

    pub async fn put_instance_tag(&self, id: &str, name: &str, value: String) -> Result<()> {
        if name.trim().is_empty() {
            return Err(Error::Validation("tag name must not be empty".into()));
        }
        self.infra.put_tag(&InstanceId::from(id), name, value).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::DispatcherSettings;
    use crate::infra::MemoryInfrastructure;
    use crate::model::{PoolStatus, ProvisioningStatus};
    use assert_matches::assert_matches;

    fn service() -> Arc<LbaasService> {
        let repos = Repositories::in_memory();
        let aggregator = StatusAggregator::new(repos.clone());
        let dispatcher = ResyncDispatcher::new(DispatcherSettings::default(), repos.clone(), aggregator);
        LbaasService::new(
            &ControlPlaneConfig::default(),
            repos,
            MemoryInfrastructure::new(),
            dispatcher,
        )
    }

    fn listener_fields(id: &str) -> ListenerFields {
        ListenerFields {
            id: Some(id.into()),
            name: Some("http".into()),
            protocol: Some("HTTP".into()),
            protocol_port: Some(80),
            stat_port: Some(8404),
            ..Default::default()
        }
    }

    fn monitor_fields(id: &str) -> HealthMonitorFields {
        HealthMonitorFields {
            id: Some(id.into()),
            name: Some("ping".into()),
            monitor_type: Some("PING".into()),
            delay: Some(5),
            max_retries: Some(3),
            timeout: Some(2),
            ..Default::default()
        }
    }

    fn pool_fields(id: &str, monitor: Option<&str>) -> PoolFields {
        PoolFields {
            id: Some(id.into()),
            name: Some("web".into()),
            lb_algorithm: Some("ROUND_ROBIN".into()),
            protocol: Some("HTTP".into()),
            health_monitor: monitor.map(String::from),
            ..Default::default()
        }
    }

    fn member_fields(pool: &str, address: &str) -> MemberFields {
        MemberFields {
            pool: Some(pool.into()),
            address: Some(address.into()),
            protocol_port: Some(8080),
            ..Default::default()
        }
    }

    #[tokio::test]
    async fn test_pool_status_follows_membership() {
        let svc = service();
        svc.create_health_monitor(monitor_fields("hm-1")).await.unwrap();
        let pool = svc.create_pool(pool_fields("pool-1", Some("hm-1"))).await.unwrap();
        assert_eq!(pool.status, PoolStatus::PendingCreate);

        let member = svc.create_member(member_fields("pool-1", "10.0.0.10")).await.unwrap();
        let pool = svc.get_pool(&"pool-1".into()).await.unwrap();
        assert_eq!(pool.status, PoolStatus::Active);

        svc.delete_member(&"pool-1".into(), &member.member_id).await.unwrap();
        let pool = svc.get_pool(&"pool-1".into()).await.unwrap();
        assert_eq!(pool.status, PoolStatus::PendingCreate);
    }

    #[tokio::test]
    async fn test_unresolved_reference() {
        let svc = service();
        let err = svc.create_pool(pool_fields("pool-1", Some("missing"))).await.unwrap_err();
        assert_matches!(
            err,
            Error::UnresolvedReference {
                kind: EntityKind::HealthMonitor,
                ..
            }
        );

        let err = svc.create_member(member_fields("nope", "10.0.0.1")).await.unwrap_err();
        assert_matches!(err, Error::UnresolvedReference { kind: EntityKind::Pool, .. });
        assert!(svc.list_pools().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_loadbalancer_create_defaults() {
        let svc = service();
        let lb = svc
            .create_loadbalancer(LoadBalancerFields {
                name: Some("web".into()),
                vip_address: Some("10.0.0.5".into()),
                ..Default::default()
            })
            .await
            .unwrap();

        assert_eq!(lb.owner, "lbaas");
        assert_eq!(lb.provisioning_status, ProvisioningStatus::PendingCreate);
        assert_eq!(lb.loadbalancer_id.as_str().len(), 36);

        let err = svc
            .create_loadbalancer(LoadBalancerFields {
                name: Some("web".into()),
                vip_address: Some("10.0.0.5".into()),
                owner: Some("billing".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));
    }

    #[tokio::test]
    async fn test_partial_update_preserves_fields() {
        let svc = service();
        svc.create_listener(listener_fields("l-1")).await.unwrap();

        let updated = svc
            .update_listener(
                &"l-1".into(),
                ListenerFields {
                    name: Some("renamed".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();

        assert_eq!(updated.name, "renamed");
        assert_eq!(updated.protocol_port, 80);
        assert_eq!(updated.stat_port, 8404);
    }

    #[tokio::test]
    async fn test_delete_conflicts() {
        let svc = service();
        svc.create_health_monitor(monitor_fields("hm-1")).await.unwrap();
        svc.create_listener(listener_fields("l-1")).await.unwrap();
        svc.create_pool(pool_fields("pool-1", Some("hm-1"))).await.unwrap();
        svc.create_member(member_fields("pool-1", "10.0.0.10")).await.unwrap();
        svc.create_loadbalancer(LoadBalancerFields {
            id: Some("lb-1".into()),
            name: Some("web".into()),
            vip_address: Some("10.0.0.5".into()),
            listener: Some("l-1".into()),
            pool: Some("pool-1".into()),
            ..Default::default()
        })
        .await
        .unwrap();

        assert_matches!(
            svc.delete_health_monitor(&"hm-1".into()).await,
            Err(Error::ResourceInUse { dependent: EntityKind::Pool, .. })
        );
        assert_matches!(
            svc.delete_listener(&"l-1".into()).await,
            Err(Error::ResourceInUse { dependent: EntityKind::LoadBalancer, .. })
        );
        assert_matches!(
            svc.delete_pool(&"pool-1".into()).await,
            Err(Error::ResourceInUse { dependent: EntityKind::LoadBalancer, .. })
        );

        svc.delete_loadbalancer(&"lb-1".into()).await.unwrap();
        assert_matches!(
            svc.delete_pool(&"pool-1".into()).await,
            Err(Error::ResourceInUse { dependent: EntityKind::Member, .. })
        );
        svc.delete_listener(&"l-1".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_successful_deletes_dispatch_resync() {
        let svc = service();
        svc.create_health_monitor(monitor_fields("hm-1")).await.unwrap();
        svc.create_listener(listener_fields("l-1")).await.unwrap();
        svc.create_pool(pool_fields("pool-1", Some("hm-1"))).await.unwrap();

        let before = svc.dispatcher().stats().enqueued;
        svc.delete_listener(&"l-1".into()).await.unwrap();
        svc.delete_pool(&"pool-1".into()).await.unwrap();
        svc.delete_health_monitor(&"hm-1".into()).await.unwrap();
        assert_eq!(svc.dispatcher().stats().enqueued, before + 3);

        // Rejected deletes leave the queue alone
        svc.create_health_monitor(monitor_fields("hm-2")).await.unwrap();
        svc.create_pool(pool_fields("pool-2", Some("hm-2"))).await.unwrap();
        let before = svc.dispatcher().stats().enqueued;
        assert!(svc.delete_health_monitor(&"hm-2".into()).await.is_err());
        assert_eq!(svc.dispatcher().stats().enqueued, before);
    }

    #[tokio::test]
    async fn test_clear_reference_with_empty_string() {
        let svc = service();
        svc.create_listener(listener_fields("l-1")).await.unwrap();
        svc.create_loadbalancer(LoadBalancerFields {
            id: Some("lb-1".into()),
            name: Some("web".into()),
            vip_address: Some("10.0.0.5".into()),
            listener: Some("l-1".into()),
            ..Default::default()
        })
        .await
        .unwrap();

        let lb = svc
            .update_loadbalancer(
                &"lb-1".into(),
                LoadBalancerFields {
                    listener: Some("".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert!(lb.listener.is_none());
        assert_eq!(lb.vip_address, "10.0.0.5");
        svc.delete_listener(&"l-1".into()).await.unwrap();
    }

    #[tokio::test]
    async fn test_member_scoped_by_pool() {
        let svc = service();
        svc.create_pool(pool_fields("pool-a", None)).await.unwrap();
        svc.create_pool(pool_fields("pool-b", None)).await.unwrap();
        let member = svc.create_member(member_fields("pool-a", "10.0.0.1")).await.unwrap();

        assert!(svc.get_member(&"pool-a".into(), &member.member_id).await.is_ok());
        assert_matches!(
            svc.get_member(&"pool-b".into(), &member.member_id).await,
            Err(Error::ResourceNotFound { kind: EntityKind::Member, .. })
        );

        let moved = svc
            .update_member(
                &"pool-a".into(),
                &member.member_id,
                MemberFields {
                    pool: Some("pool-b".into()),
                    weight: Some(5),
                    ..Default::default()
                },
            )
            .await
            .unwrap();
        assert_eq!(moved.weight, 5);
        assert!(svc.list_members(&"pool-a".into()).await.unwrap().is_empty());
        assert_eq!(svc.list_members(&"pool-b".into()).await.unwrap().len(), 1);

        let err = svc
            .update_member(
                &"pool-b".into(),
                &member.member_id,
                MemberFields {
                    pool: Some("".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));
    }

    #[tokio::test]
    async fn test_public_id_is_immutable() {
        let svc = service();
        svc.create_health_monitor(monitor_fields("hm-1")).await.unwrap();
        let err = svc
            .update_health_monitor(
                &"hm-1".into(),
                HealthMonitorFields {
                    id: Some("hm-2".into()),
                    ..Default::default()
                },
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));
    }

    #[tokio::test]
    async fn test_delete_cascades_to_instance() {
        let svc = service();
        svc.register_instance(
            "i-1",
            InstanceRegistration {
                name: "haproxy-1".into(),
                backend_state: BackendState::Provisioned,
                ports: vec![PortRegistration {
                    ip: "10.0.0.9".into(),
                    network: None,
                }],
            },
        )
        .await
        .unwrap();

        svc.create_loadbalancer(LoadBalancerFields {
            id: Some("lb-1".into()),
            name: Some("web".into()),
            vip_address: Some("10.0.0.9".into()),
            instance_id: Some("i-1".into()),
            ..Default::default()
        })
        .await
        .unwrap();

        svc.delete_loadbalancer(&"lb-1".into()).await.unwrap();
        assert!(svc.list_instances().await.unwrap().is_empty());
        assert_matches!(
            svc.get_loadbalancer(&"lb-1".into()).await,
            Err(Error::ResourceNotFound { .. })
        );
    }

    #[tokio::test]
    async fn test_unknown_instance_rejected() {
        let svc = service();
        let err = svc
            .create_loadbalancer(LoadBalancerFields {
                name: Some("web".into()),
                vip_address: Some("10.0.0.9".into()),
                instance_id: Some("i-404".into()),
                ..Default::default()
            })
            .await
            .unwrap_err();
        assert_matches!(err, Error::InstanceNotFound { .. });
    }
}
