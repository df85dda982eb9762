//! Backing Instance Records
//!
//! Observed state of the compute instances that run the proxy: their
//! network ports and the out-of-band status tag written by the
//! enforcement agent.

use chrono::{DateTime, NaiveDateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::InstanceId;
use crate::error::{Error, Result};

/// Name of the tag carrying the container health report
pub const STATUS_TAG_NAME: &str = "chk_container_status";

/// Backend provisioning state reported by the infrastructure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum BackendState {
    /// Instance not yet provisioned
    Pending,
    /// Instance provisioned and reachable
    Provisioned,
    /// Provisioning failed
    Failed,
}

/// A compute instance hosting the proxy
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instance {
    pub id: InstanceId,
    pub name: String,
    pub backend_state: BackendState,
    pub deleted: bool,
    pub created_at: DateTime<Utc>,
}

impl Instance {
    pub fn new(id: InstanceId, name: impl Into<String>, backend_state: BackendState) -> Self {
        Self {
            id,
            name: name.into(),
            backend_state,
            deleted: false,
            created_at: Utc::now(),
        }
    }
}

/// A network port bound to an instance
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct NetworkPort {
    pub instance_id: InstanceId,
    pub ip: String,
    #[serde(default)]
    pub network: Option<String>,
}

/// Health report stored in the instance's status tag
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct StatusTag {
    pub create_date: String,
    pub update_date: String,
    pub command: String,
    pub expected_result: String,
    pub result: String,
}

impl StatusTag {
    pub const DATE_FORMAT: &'static str = "%Y-%m-%d %H:%M:%S";

    /// Result written before the agent reports for the first time
    pub const INITIALIZED: &'static str = "Initialized";

    /// Default tag created for a freshly synced instance
    pub fn initial(now: DateTime<Utc>) -> Self {
        let stamp = now.format(Self::DATE_FORMAT).to_string();
        Self {
            create_date: stamp.clone(),
            update_date: stamp,
            command: "service haproxy status".to_string(),
            expected_result: "haproxy is running.".to_string(),
            result: Self::INITIALIZED.to_string(),
        }
    }

    /// Parse a raw tag value. An empty value is `None` (uninitialized).
    pub fn parse(raw: &str) -> Result<Option<Self>> {
        if raw.trim().is_empty() {
            return Ok(None);
        }
        Ok(Some(serde_json::from_str(raw)?))
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn is_uninitialized(&self) -> bool {
        self.result == Self::INITIALIZED
    }

    pub fn diverges(&self) -> bool {
        self.expected_result != self.result
    }

    /// Time between the tag's creation and its latest update
    pub fn report_gap(&self) -> Result<chrono::Duration> {
        let created = parse_tag_date(&self.create_date)?;
        let updated = parse_tag_date(&self.update_date)?;
        Ok(updated.signed_duration_since(created))
    }
}

fn parse_tag_date(value: &str) -> Result<NaiveDateTime> {
    NaiveDateTime::parse_from_str(value, StatusTag::DATE_FORMAT)
        .map_err(|e| Error::StatusTag(format!("invalid date '{}': {}", value, e)))
}
