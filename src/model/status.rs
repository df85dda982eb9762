//! Status enums shared by the entity graph

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Kinds of entity stored by the control plane
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    LoadBalancer,
    Listener,
    Pool,
    Member,
    HealthMonitor,
}

impl std::fmt::Display for EntityKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityKind::LoadBalancer => write!(f, "loadbalancer"),
            EntityKind::Listener => write!(f, "listener"),
            EntityKind::Pool => write!(f, "pool"),
            EntityKind::Member => write!(f, "member"),
            EntityKind::HealthMonitor => write!(f, "healthmonitor"),
        }
    }
}

/// Lifecycle state of a control-plane record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProvisioningStatus {
    PendingCreate,
    Active,
    PendingUpdate,
    Error,
}

impl std::fmt::Display for ProvisioningStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ProvisioningStatus::PendingCreate => write!(f, "PENDING_CREATE"),
            ProvisioningStatus::Active => write!(f, "ACTIVE"),
            ProvisioningStatus::PendingUpdate => write!(f, "PENDING_UPDATE"),
            ProvisioningStatus::Error => write!(f, "ERROR"),
        }
    }
}

/// Observed runtime health
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OperatingStatus {
    Online,
    Offline,
}

impl std::fmt::Display for OperatingStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            OperatingStatus::Online => write!(f, "ONLINE"),
            OperatingStatus::Offline => write!(f, "OFFLINE"),
        }
    }
}

/// Derived completeness of a pool. Never set by clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum PoolStatus {
    PendingCreate,
    Active,
    Error,
}

impl std::fmt::Display for PoolStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            PoolStatus::PendingCreate => write!(f, "PENDING_CREATE"),
            PoolStatus::Active => write!(f, "ACTIVE"),
            PoolStatus::Error => write!(f, "ERROR"),
        }
    }
}
