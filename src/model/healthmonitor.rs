//! Healthmonitor record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Entity, EntityKind, PublicId, RecordId};

/// Health check policy applied to the members of the pools referencing it
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthMonitor {
    pub id: RecordId,
    pub health_monitor_id: PublicId,
    pub name: String,
    /// PING, TCP, HTTP, HTTPS
    pub monitor_type: String,
    /// Seconds between checks
    pub delay: u32,
    pub max_retries: u32,
    /// Check timeout in seconds
    pub timeout: u32,
    pub http_method: String,
    pub url_path: String,
    pub expected_codes: String,
    pub admin_state_up: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl HealthMonitor {
    pub fn new(
        health_monitor_id: PublicId,
        name: impl Into<String>,
        monitor_type: impl Into<String>,
        delay: u32,
        max_retries: u32,
        timeout: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::UNASSIGNED,
            health_monitor_id,
            name: name.into(),
            monitor_type: monitor_type.into(),
            delay,
            max_retries,
            timeout,
            http_method: "GET".to_string(),
            url_path: "/".to_string(),
            expected_codes: "200".to_string(),
            admin_state_up: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for HealthMonitor {
    const KIND: EntityKind = EntityKind::HealthMonitor;

    fn record_id(&self) -> RecordId {
        self.id
    }

    fn assign_record_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn public_id(&self) -> &PublicId {
        &self.health_monitor_id
    }
}
