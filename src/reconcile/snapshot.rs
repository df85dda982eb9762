//! Configuration Snapshot
//!
//! Assembles the fully denormalized document handed to the config renderer.
//! Assembly fails closed: anything short of an ACTIVE pool and an ACTIVE
//! load balancer yields [`Readiness::NotReady`].

use crate::domain::HandoffFields;
use crate::error::{Error, Result};
use crate::model::{
    EntityKind, HealthMonitor, InstanceId, Listener, LoadBalancer, Member, PoolStatus,
    ProvisioningStatus, PublicId, RecordId,
};
use crate::store::Repositories;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Timestamp format of the `update_time` hand-off field
pub const UPDATE_TIME_FORMAT: &str = "%Y-%m-%d %H:%M:%S";

// =============================================================================
// Snapshot Sections
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadBalancerSection {
    pub loadbalancer_id: PublicId,
    pub lb_name: String,
    pub vip_address: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListenerSection {
    pub listener_id: PublicId,
    pub listener_name: String,
    pub protocol: String,
    pub protocol_port: u16,
    pub stat_port: u16,
    pub connection_limit: i32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolSection {
    pub pool_id: PublicId,
    pub pool_name: String,
    pub health_monitor_id: PublicId,
    pub lb_algorithm: String,
    pub protocol: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberSection {
    pub member_id: PublicId,
    pub address: String,
    pub protocol_port: u16,
    pub weight: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HealthMonitorSection {
    pub health_monitor_id: PublicId,
    #[serde(rename = "type")]
    pub monitor_type: String,
    pub delay: u32,
    pub max_retries: u32,
    pub timeout: u32,
    pub http_method: String,
    pub url_path: String,
    pub expected_codes: String,
}

/// Wrapper so the members section serializes as `{"members": [...]}`
#[derive(Serialize)]
struct MembersSection<'a> {
    members: &'a [MemberSection],
}

/// Denormalized configuration of one load balancer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConfigSnapshot {
    pub instance_id: Option<InstanceId>,
    pub loadbalancer: LoadBalancerSection,
    pub listener: ListenerSection,
    pub pool: PoolSection,
    pub members: Vec<MemberSection>,
    pub health_monitor: HealthMonitorSection,
}

impl ConfigSnapshot {
    /// Flatten into independently serialized, plain-text sections
    pub fn to_handoff_fields(&self, update_time: DateTime<Utc>) -> Result<HandoffFields> {
        let mut fields = HandoffFields::new();
        if let Some(instance_id) = &self.instance_id {
            fields.insert("instance_id".into(), instance_id.to_string());
        }
        fields.insert(
            "update_time".into(),
            update_time.format(UPDATE_TIME_FORMAT).to_string(),
        );
        fields.insert(
            "loadbalancer".into(),
            serde_json::to_string_pretty(&self.loadbalancer)?,
        );
        fields.insert("listener".into(), serde_json::to_string_pretty(&self.listener)?);
        fields.insert("pool".into(), serde_json::to_string_pretty(&self.pool)?);
        fields.insert(
            "members".into(),
            serde_json::to_string_pretty(&MembersSection {
                members: &self.members,
            })?,
        );
        fields.insert(
            "health_monitor".into(),
            serde_json::to_string_pretty(&self.health_monitor)?,
        );
        Ok(fields)
    }
}

/// Result of snapshot assembly
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Readiness {
    Ready(Box<ConfigSnapshot>),
    NotReady { reason: String },
}

impl Readiness {
    fn not_ready(reason: impl Into<String>) -> Self {
        Readiness::NotReady {
            reason: reason.into(),
        }
    }
}

// =============================================================================
// Snapshot Assembler
// =============================================================================

#[derive(Clone)]
pub struct SnapshotAssembler {
    repos: Repositories,
}

impl SnapshotAssembler {
    pub fn new(repos: Repositories) -> Self {
        Self { repos }
    }

    /// Assemble the snapshot of one load balancer from current store state
    pub async fn assemble(&self, lb_id: RecordId) -> Result<Readiness> {
        let lb = self
            .repos
            .loadbalancers
            .get(lb_id)
            .await?
            .ok_or_else(|| Error::not_found(EntityKind::LoadBalancer, lb_id))?;

        if lb.provisioning_status != ProvisioningStatus::Active {
            return Ok(Readiness::not_ready(format!(
                "loadbalancer status is {}",
                lb.provisioning_status
            )));
        }

        let listener = match lb.listener {
            Some(id) => self.repos.listeners.get(id).await?,
            None => None,
        };
        let listener = match listener {
            Some(listener) => listener,
            None => return Ok(Readiness::not_ready("listener does not resolve")),
        };

        let pool = match lb.pool {
            Some(id) => self.repos.pools.get(id).await?,
            None => None,
        };
        let pool = match pool {
            Some(pool) => pool,
            None => return Ok(Readiness::not_ready("pool does not resolve")),
        };
        if pool.status != PoolStatus::Active {
            return Ok(Readiness::not_ready(format!("pool status is {}", pool.status)));
        }

        let monitor = match pool.health_monitor {
            Some(id) => self.repos.health_monitors.get(id).await?,
            None => None,
        };
        let monitor = match monitor {
            Some(monitor) => monitor,
            None => return Ok(Readiness::not_ready("health monitor does not resolve")),
        };

        let pool_id = pool.id;
        let members = self.repos.members.filter(&|m: &Member| m.pool == pool_id).await?;
        if members.is_empty() {
            return Ok(Readiness::not_ready("pool has no members"));
        }

        Ok(Readiness::Ready(Box::new(ConfigSnapshot {
            instance_id: lb.instance_id.clone(),
            loadbalancer: loadbalancer_section(&lb),
            listener: listener_section(&listener),
            pool: PoolSection {
                pool_id: pool.pool_id.clone(),
                pool_name: pool.name.clone(),
                health_monitor_id: monitor.health_monitor_id.clone(),
                lb_algorithm: pool.lb_algorithm.clone(),
                protocol: pool.protocol.clone(),
            },
            members: members.iter().map(member_section).collect(),
            health_monitor: health_monitor_section(&monitor),
        })))
    }
}

fn loadbalancer_section(lb: &LoadBalancer) -> LoadBalancerSection {
    LoadBalancerSection {
        loadbalancer_id: lb.loadbalancer_id.clone(),
        lb_name: lb.name.clone(),
        vip_address: lb.vip_address.clone(),
    }
}

fn listener_section(listener: &Listener) -> ListenerSection {
    ListenerSection {
        listener_id: listener.listener_id.clone(),
        listener_name: listener.name.clone(),
        protocol: listener.protocol.clone(),
        protocol_port: listener.protocol_port,
        stat_port: listener.stat_port,
        connection_limit: listener.connection_limit,
    }
}

fn member_section(member: &Member) -> MemberSection {
    MemberSection {
        member_id: member.member_id.clone(),
        address: member.address.clone(),
        protocol_port: member.protocol_port,
        weight: member.weight,
    }
}

fn health_monitor_section(monitor: &HealthMonitor) -> HealthMonitorSection {
    HealthMonitorSection {
        health_monitor_id: monitor.health_monitor_id.clone(),
        monitor_type: monitor.monitor_type.clone(),
        delay: monitor.delay,
        max_retries: monitor.max_retries,
        timeout: monitor.timeout,
        http_method: monitor.http_method.clone(),
        url_path: monitor.url_path.clone(),
        expected_codes: monitor.expected_codes.clone(),
    }
}
