//! Response Views
//!
//! Wire shapes returned by the REST API. Links between records are rendered
//! as public ids; internal record ids never leave the process.

use crate::error::Result;
use crate::model::{
    HealthMonitor, Instance, Listener, LoadBalancer, Member, OperatingStatus, Pool, PoolStatus,
    ProvisioningStatus, PublicId, RecordId,
};
use crate::store::Repositories;
use chrono::{DateTime, Utc};
use serde::Serialize;

/// Provider name reported for every load balancer and pool
pub const PROVIDER: &str = "haproxy";

/// `{"id": ...}` link
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IdRef {
    pub id: PublicId,
}

async fn listener_public_id(repos: &Repositories, id: Option<RecordId>) -> Result<Option<PublicId>> {
    Ok(match id {
        Some(id) => repos.listeners.get(id).await?.map(|l| l.listener_id),
        None => None,
    })
}

async fn pool_public_id(repos: &Repositories, id: Option<RecordId>) -> Result<Option<PublicId>> {
    Ok(match id {
        Some(id) => repos.pools.get(id).await?.map(|p| p.pool_id),
        None => None,
    })
}

async fn monitor_public_id(repos: &Repositories, id: Option<RecordId>) -> Result<Option<PublicId>> {
    Ok(match id {
        Some(id) => repos.health_monitors.get(id).await?.map(|h| h.health_monitor_id),
        None => None,
    })
}

fn id_refs(id: Option<PublicId>) -> Vec<IdRef> {
    id.into_iter().map(|id| IdRef { id }).collect()
}

// =============================================================================
// LoadBalancer
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerView {
    pub loadbalancer_id: PublicId,
    pub loadbalancer_name: String,
    pub description: String,
    pub owner: String,
    pub slice_name: Option<String>,
    pub vip_address: String,
    pub vip_subnet_id: Option<String>,
    pub admin_state_up: bool,
    pub operating_status: OperatingStatus,
    pub provisioning_status: ProvisioningStatus,
    pub listeners: Vec<IdRef>,
    pub pools: Vec<IdRef>,
    pub instance_id: Option<String>,
    pub provider: &'static str,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

pub async fn loadbalancer_view(repos: &Repositories, lb: &LoadBalancer) -> Result<LoadBalancerView> {
    Ok(LoadBalancerView {
        loadbalancer_id: lb.loadbalancer_id.clone(),
        loadbalancer_name: lb.name.clone(),
        description: lb.description.clone(),
        owner: lb.owner.clone(),
        slice_name: lb.slice_name.clone(),
        vip_address: lb.vip_address.clone(),
        vip_subnet_id: lb.vip_subnet_id.clone(),
        admin_state_up: lb.admin_state_up,
        operating_status: lb.operating_status,
        provisioning_status: lb.provisioning_status,
        listeners: id_refs(listener_public_id(repos, lb.listener).await?),
        pools: id_refs(pool_public_id(repos, lb.pool).await?),
        instance_id: lb.instance_id.as_ref().map(|i| i.to_string()),
        provider: PROVIDER,
        created_at: lb.created_at,
        updated_at: lb.updated_at,
    })
}

// =============================================================================
// Listener
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct ListenerView {
    pub listener_id: PublicId,
    pub name: String,
    pub description: String,
    pub protocol: String,
    pub protocol_port: u16,
    pub stat_port: u16,
    pub connection_limit: i32,
    pub admin_state_up: bool,
    pub loadbalancers: Vec<IdRef>,
}

pub async fn listener_view(repos: &Repositories, listener: &Listener) -> Result<ListenerView> {
    let rid = listener.id;
    let loadbalancers = repos
        .loadbalancers
        .filter(&move |lb: &LoadBalancer| lb.listener == Some(rid))
        .await?
        .into_iter()
        .map(|lb| IdRef {
            id: lb.loadbalancer_id,
        })
        .collect();

    Ok(ListenerView {
        listener_id: listener.listener_id.clone(),
        name: listener.name.clone(),
        description: listener.description.clone(),
        protocol: listener.protocol.clone(),
        protocol_port: listener.protocol_port,
        stat_port: listener.stat_port,
        connection_limit: listener.connection_limit,
        admin_state_up: listener.admin_state_up,
        loadbalancers,
    })
}

// =============================================================================
// Pool
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatusView {
    pub monitor_id: PublicId,
    pub status: ProvisioningStatus,
    pub status_description: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolView {
    pub pool_id: PublicId,
    pub name: String,
    pub description: String,
    pub lb_algorithm: String,
    pub protocol: String,
    pub admin_state_up: bool,
    pub status: PoolStatus,
    pub members: Vec<PublicId>,
    pub health_monitors: Vec<PublicId>,
    pub health_monitors_status: Vec<MonitorStatusView>,
    pub provider: &'static str,
}

pub async fn pool_view(repos: &Repositories, pool: &Pool) -> Result<PoolView> {
    let rid = pool.id;
    let members = repos
        .members
        .filter(&move |m: &Member| m.pool == rid)
        .await?
        .into_iter()
        .map(|m| m.member_id)
        .collect();
    let monitor = monitor_public_id(repos, pool.health_monitor).await?;
    let health_monitors_status = monitor
        .iter()
        .map(|id| MonitorStatusView {
            monitor_id: id.clone(),
            status: ProvisioningStatus::Active,
            status_description: None,
        })
        .collect();

    Ok(PoolView {
        pool_id: pool.pool_id.clone(),
        name: pool.name.clone(),
        description: pool.description.clone(),
        lb_algorithm: pool.lb_algorithm.clone(),
        protocol: pool.protocol.clone(),
        admin_state_up: pool.admin_state_up,
        status: pool.status,
        members,
        health_monitors: monitor.into_iter().collect(),
        health_monitors_status,
        provider: PROVIDER,
    })
}

// =============================================================================
// Member
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MemberView {
    pub member_id: PublicId,
    pub pool_id: Option<PublicId>,
    pub address: String,
    pub protocol_port: u16,
    pub weight: u32,
    pub admin_state_up: bool,
    pub operating_status: OperatingStatus,
    pub provisioning_status: ProvisioningStatus,
}

pub async fn member_view(repos: &Repositories, member: &Member) -> Result<MemberView> {
    Ok(MemberView {
        member_id: member.member_id.clone(),
        pool_id: pool_public_id(repos, Some(member.pool)).await?,
        address: member.address.clone(),
        protocol_port: member.protocol_port,
        weight: member.weight,
        admin_state_up: member.admin_state_up,
        operating_status: member.operating_status,
        provisioning_status: member.provisioning_status,
    })
}

// =============================================================================
// HealthMonitor
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct MonitoredPoolView {
    pub pool_id: PublicId,
    pub status: PoolStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthMonitorView {
    pub health_monitor_id: PublicId,
    pub name: String,
    #[serde(rename = "type")]
    pub monitor_type: String,
    pub delay: u32,
    pub max_retries: u32,
    pub timeout: u32,
    pub http_method: String,
    pub url_path: String,
    pub expected_codes: String,
    pub admin_state_up: bool,
    pub pools: Vec<MonitoredPoolView>,
}

pub async fn health_monitor_view(repos: &Repositories, monitor: &HealthMonitor) -> Result<HealthMonitorView> {
    let rid = monitor.id;
    let pools = repos
        .pools
        .filter(&move |p: &Pool| p.health_monitor == Some(rid))
        .await?
        .into_iter()
        .map(|p| MonitoredPoolView {
            pool_id: p.pool_id,
            status: p.status,
        })
        .collect();

    Ok(HealthMonitorView {
        health_monitor_id: monitor.health_monitor_id.clone(),
        name: monitor.name.clone(),
        monitor_type: monitor.monitor_type.clone(),
        delay: monitor.delay,
        max_retries: monitor.max_retries,
        timeout: monitor.timeout,
        http_method: monitor.http_method.clone(),
        url_path: monitor.url_path.clone(),
        expected_codes: monitor.expected_codes.clone(),
        admin_state_up: monitor.admin_state_up,
        pools,
    })
}

// =============================================================================
// Instance
// =============================================================================

#[derive(Debug, Clone, Serialize)]
pub struct InstanceView {
    pub instance_id: String,
    pub name: String,
    pub backend_state: crate::model::BackendState,
    pub created_at: DateTime<Utc>,
}

impl From<&Instance> for InstanceView {
    fn from(instance: &Instance) -> Self {
        Self {
            instance_id: instance.id.to_string(),
            name: instance.name.clone(),
            backend_state: instance.backend_state,
            created_at: instance.created_at,
        }
    }
}

// =============================================================================
// Status Tree
// =============================================================================

/// Operational status of a load balancer and everything beneath it
#[derive(Debug, Clone, Serialize)]
pub struct StatusTree {
    pub loadbalancer: LoadBalancerStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct LoadBalancerStatus {
    pub id: PublicId,
    pub name: String,
    pub operating_status: OperatingStatus,
    pub provisioning_status: ProvisioningStatus,
    pub listeners: Vec<ListenerStatus>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ListenerStatus {
    pub id: PublicId,
    pub name: String,
    pub operating_status: OperatingStatus,
    pub provisioning_status: ProvisioningStatus,
    pub pools: Vec<PoolStatusNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PoolStatusNode {
    pub id: PublicId,
    pub name: String,
    pub operating_status: OperatingStatus,
    pub provisioning_status: PoolStatus,
    pub health_monitor: Option<MonitorStatusNode>,
    pub members: Vec<MemberStatusNode>,
}

#[derive(Debug, Clone, Serialize)]
pub struct MonitorStatusNode {
    pub id: PublicId,
    #[serde(rename = "type")]
    pub monitor_type: String,
    pub provisioning_status: ProvisioningStatus,
}

#[derive(Debug, Clone, Serialize)]
pub struct MemberStatusNode {
    pub id: PublicId,
    pub address: String,
    pub protocol_port: u16,
    pub operating_status: OperatingStatus,
    pub provisioning_status: ProvisioningStatus,
}

/// Build the status tree. Missing links produce empty branches.
pub async fn status_tree(repos: &Repositories, lb: &LoadBalancer) -> Result<StatusTree> {
    let mut pools = Vec::new();
    if let Some(pool) = match lb.pool {
        Some(id) => repos.pools.get(id).await?,
        None => None,
    } {
        let monitor = match pool.health_monitor {
            Some(id) => repos.health_monitors.get(id).await?,
            None => None,
        };
        let rid = pool.id;
        let members = repos
            .members
            .filter(&move |m: &Member| m.pool == rid)
            .await?
            .into_iter()
            .map(|m| MemberStatusNode {
                id: m.member_id,
                address: m.address,
                protocol_port: m.protocol_port,
                operating_status: m.operating_status,
                provisioning_status: m.provisioning_status,
            })
            .collect();

        pools.push(PoolStatusNode {
            id: pool.pool_id,
            name: pool.name,
            operating_status: OperatingStatus::Online,
            provisioning_status: pool.status,
            health_monitor: monitor.map(|hm| MonitorStatusNode {
                id: hm.health_monitor_id,
                monitor_type: hm.monitor_type,
                provisioning_status: ProvisioningStatus::Active,
            }),
            members,
        });
    }

    let listeners = match lb.listener {
        Some(id) => repos.listeners.get(id).await?,
        None => None,
    }
    .map(|listener| ListenerStatus {
        id: listener.listener_id,
        name: listener.name,
        operating_status: OperatingStatus::Online,
        provisioning_status: ProvisioningStatus::Active,
        pools,
    })
    .into_iter()
    .collect();

    Ok(StatusTree {
        loadbalancer: LoadBalancerStatus {
            id: lb.loadbalancer_id.clone(),
            name: lb.name.clone(),
            operating_status: lb.operating_status,
            provisioning_status: lb.provisioning_status,
            listeners,
        },
    })
}
