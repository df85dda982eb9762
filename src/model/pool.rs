//! Pool and Member records

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{
    Entity, EntityKind, OperatingStatus, PoolStatus, ProvisioningStatus, PublicId, RecordId,
};

/// A named set of backend members balanced under one algorithm
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pool {
    pub id: RecordId,
    pub pool_id: PublicId,
    pub name: String,
    pub description: String,
    pub lb_algorithm: String,
    pub protocol: String,
    pub admin_state_up: bool,
    /// Derived by the status aggregator
    pub status: PoolStatus,
    pub health_monitor: Option<RecordId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Pool {
    pub fn new(
        pool_id: PublicId,
        name: impl Into<String>,
        lb_algorithm: impl Into<String>,
        protocol: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::UNASSIGNED,
            pool_id,
            name: name.into(),
            description: String::new(),
            lb_algorithm: lb_algorithm.into(),
            protocol: protocol.into(),
            admin_state_up: true,
            status: PoolStatus::PendingCreate,
            health_monitor: None,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Pool {
    const KIND: EntityKind = EntityKind::Pool;

    fn record_id(&self) -> RecordId {
        self.id
    }

    fn assign_record_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn public_id(&self) -> &PublicId {
        &self.pool_id
    }
}

/// One backend endpoint inside a pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    pub id: RecordId,
    pub member_id: PublicId,
    /// Owning pool, always set
    pub pool: RecordId,
    pub address: String,
    pub protocol_port: u16,
    pub weight: u32,
    pub admin_state_up: bool,
    pub operating_status: OperatingStatus,
    pub provisioning_status: ProvisioningStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Member {
    pub fn new(member_id: PublicId, pool: RecordId, address: impl Into<String>, protocol_port: u16) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::UNASSIGNED,
            member_id,
            pool,
            address: address.into(),
            protocol_port,
            weight: 1,
            admin_state_up: true,
            operating_status: OperatingStatus::Online,
            provisioning_status: ProvisioningStatus::Active,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Member {
    const KIND: EntityKind = EntityKind::Member;

    fn record_id(&self) -> RecordId {
        self.id
    }

    fn assign_record_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn public_id(&self) -> &PublicId {
        &self.member_id
    }
}
