//! LoadBalancer record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Entity, EntityKind, InstanceId, OperatingStatus, ProvisioningStatus, PublicId, RecordId};

/// A virtual load balancer (VIP) bound to one listener and one pool
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoadBalancer {
    pub id: RecordId,
    pub loadbalancer_id: PublicId,
    pub name: String,
    pub description: String,
    /// Owning service name
    pub owner: String,
    pub slice_name: Option<String>,
    pub vip_address: String,
    pub vip_subnet_id: Option<String>,
    pub admin_state_up: bool,
    pub operating_status: OperatingStatus,
    pub provisioning_status: ProvisioningStatus,
    pub listener: Option<RecordId>,
    pub pool: Option<RecordId>,
    /// Backing compute instance running the proxy
    pub instance_id: Option<InstanceId>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Last `updated_at` the enforcement agent was configured for
    pub enacted_at: Option<DateTime<Utc>>,
}

impl LoadBalancer {
    pub fn new(
        loadbalancer_id: PublicId,
        name: impl Into<String>,
        vip_address: impl Into<String>,
        owner: impl Into<String>,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::UNASSIGNED,
            loadbalancer_id,
            name: name.into(),
            description: String::new(),
            owner: owner.into(),
            slice_name: None,
            vip_address: vip_address.into(),
            vip_subnet_id: None,
            admin_state_up: true,
            operating_status: OperatingStatus::Online,
            provisioning_status: ProvisioningStatus::PendingCreate,
            listener: None,
            pool: None,
            instance_id: None,
            created_at: now,
            updated_at: now,
            enacted_at: None,
        }
    }

    /// Bump the update timestamp so the sync pipeline re-evaluates this record
    pub fn touch(&mut self) {
        let now = Utc::now();
        // Keep the timestamp strictly increasing even on coarse clocks
        self.updated_at = if now > self.updated_at {
            now
        } else {
            self.updated_at + chrono::Duration::microseconds(1)
        };
    }

    /// True when the latest update has not been handed to the enforcement agent
    pub fn is_dirty(&self) -> bool {
        match self.enacted_at {
            Some(enacted) => enacted < self.updated_at,
            None => true,
        }
    }
}

impl Entity for LoadBalancer {
    const KIND: EntityKind = EntityKind::LoadBalancer;

    fn record_id(&self) -> RecordId {
        self.id
    }

    fn assign_record_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn public_id(&self) -> &PublicId {
        &self.loadbalancer_id
    }
}
