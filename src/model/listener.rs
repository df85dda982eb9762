//! Listener record

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::{Entity, EntityKind, PublicId, RecordId};

/// Front-end protocol/port a load balancer accepts traffic on
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Listener {
    pub id: RecordId,
    pub listener_id: PublicId,
    pub name: String,
    pub description: String,
    pub protocol: String,
    pub protocol_port: u16,
    /// HAProxy stats page port
    pub stat_port: u16,
    /// -1 means unlimited
    pub connection_limit: i32,
    pub admin_state_up: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Listener {
    pub fn new(
        listener_id: PublicId,
        name: impl Into<String>,
        protocol: impl Into<String>,
        protocol_port: u16,
        stat_port: u16,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: RecordId::UNASSIGNED,
            listener_id,
            name: name.into(),
            description: String::new(),
            protocol: protocol.into(),
            protocol_port,
            stat_port,
            connection_limit: -1,
            admin_state_up: true,
            created_at: now,
            updated_at: now,
        }
    }
}

impl Entity for Listener {
    const KIND: EntityKind = EntityKind::Listener;

    fn record_id(&self) -> RecordId {
        self.id
    }

    fn assign_record_id(&mut self, id: RecordId) {
        self.id = id;
    }

    fn public_id(&self) -> &PublicId {
        &self.listener_id
    }
}
