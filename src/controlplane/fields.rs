//! Request Field Sets
//!
//! Explicit partial-update payloads. Every recognised field is listed and
//! unknown fields are rejected at deserialization. A field is applied only
//! when present and non-empty; reference fields are public ids, and an
//! empty reference clears the link.

use crate::error::{Error, Result};
use crate::model::{EntityKind, HealthMonitor, Listener, LoadBalancer, Member, Pool, PublicId};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Field Structs
// =============================================================================

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct LoadBalancerFields {
    /// Public id; generated on create when absent
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    /// Owning service name
    pub owner: Option<String>,
    pub slice_name: Option<String>,
    pub vip_address: Option<String>,
    pub vip_subnet_id: Option<String>,
    pub admin_state_up: Option<bool>,
    /// Listener public id, empty to detach
    pub listener: Option<String>,
    /// Pool public id, empty to detach
    pub pool: Option<String>,
    /// Backing instance id, empty to detach
    pub instance_id: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct ListenerFields {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub protocol: Option<String>,
    pub protocol_port: Option<u16>,
    pub stat_port: Option<u16>,
    pub connection_limit: Option<i32>,
    pub admin_state_up: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct PoolFields {
    pub id: Option<String>,
    pub name: Option<String>,
    pub description: Option<String>,
    pub lb_algorithm: Option<String>,
    pub protocol: Option<String>,
    pub admin_state_up: Option<bool>,
    /// Health monitor public id, empty to detach
    pub health_monitor: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct MemberFields {
    pub id: Option<String>,
    /// Owning pool public id; cannot be cleared
    pub pool: Option<String>,
    pub address: Option<String>,
    pub protocol_port: Option<u16>,
    pub weight: Option<u32>,
    pub admin_state_up: Option<bool>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(deny_unknown_fields)]
pub struct HealthMonitorFields {
    pub id: Option<String>,
    pub name: Option<String>,
    #[serde(rename = "type")]
    pub monitor_type: Option<String>,
    pub delay: Option<u32>,
    pub max_retries: Option<u32>,
    pub timeout: Option<u32>,
    pub http_method: Option<String>,
    pub url_path: Option<String>,
    pub expected_codes: Option<String>,
    pub admin_state_up: Option<bool>,
}

// =============================================================================
// Helpers
// =============================================================================

/// The value of a text field if it was supplied and is not blank
pub fn present(value: &Option<String>) -> Option<&str> {
    value.as_deref().filter(|v| !v.trim().is_empty())
}

/// How a reference field changes the stored link
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RefChange {
    Keep,
    Clear,
    Set(PublicId),
}

impl RefChange {
    pub fn from_field(value: &Option<String>) -> Self {
        match value.as_deref() {
            None => RefChange::Keep,
            Some(v) if v.trim().is_empty() => RefChange::Clear,
            Some(v) => RefChange::Set(PublicId::from(v.trim())),
        }
    }
}

fn require_text(kind: EntityKind, field: &'static str, value: &Option<String>) -> Result<String> {
    present(value)
        .map(str::to_string)
        .ok_or(Error::MissingField { kind, field })
}

fn require_port(kind: EntityKind, field: &'static str, value: Option<u16>) -> Result<u16> {
    match value {
        None => Err(Error::MissingField { kind, field }),
        Some(0) => Err(Error::Validation(format!("{} {} must be between 1 and 65535", kind, field))),
        Some(port) => Ok(port),
    }
}

fn check_port(kind: EntityKind, field: &'static str, value: Option<u16>) -> Result<()> {
    if value == Some(0) {
        return Err(Error::Validation(format!("{} {} must be between 1 and 65535", kind, field)));
    }
    Ok(())
}

/// Public id for a new record: supplied or generated
fn public_id_for_create(value: &Option<String>) -> PublicId {
    match present(value) {
        Some(id) => PublicId::from(id.trim()),
        None => PublicId::generate(),
    }
}

/// Reject attempts to change a public id through an update
pub fn check_immutable_id(kind: EntityKind, current: &PublicId, value: &Option<String>) -> Result<()> {
    match present(value) {
        Some(id) if id.trim() != current.as_str() => Err(Error::Validation(format!(
            "{} id is immutable ({} -> {})",
            kind, current, id
        ))),
        _ => Ok(()),
    }
}

fn set_text(target: &mut String, value: &Option<String>) {
    if let Some(v) = present(value) {
        *target = v.to_string();
    }
}

fn set_optional_text(target: &mut Option<String>, value: &Option<String>) {
    if let Some(v) = present(value) {
        *target = Some(v.to_string());
    }
}

fn set_copy<T: Copy>(target: &mut T, value: Option<T>) {
    if let Some(v) = value {
        *target = v;
    }
}

// =============================================================================
// LoadBalancer
// =============================================================================

impl LoadBalancerFields {
    /// Build a draft from a create payload; references are resolved by the caller
    pub fn draft(&self, default_owner: &str) -> Result<LoadBalancer> {
        let kind = EntityKind::LoadBalancer;
        let name = require_text(kind, "name", &self.name)?;
        let vip = require_text(kind, "vip_address", &self.vip_address)?;
        let owner = present(&self.owner).unwrap_or(default_owner).to_string();

        let mut lb = LoadBalancer::new(public_id_for_create(&self.id), name, vip, owner);
        self.apply(&mut lb);
        Ok(lb)
    }

    /// Apply plain fields; reference fields are handled separately
    pub fn apply(&self, lb: &mut LoadBalancer) {
        set_text(&mut lb.name, &self.name);
        set_text(&mut lb.description, &self.description);
        set_text(&mut lb.owner, &self.owner);
        set_optional_text(&mut lb.slice_name, &self.slice_name);
        set_text(&mut lb.vip_address, &self.vip_address);
        set_optional_text(&mut lb.vip_subnet_id, &self.vip_subnet_id);
        set_copy(&mut lb.admin_state_up, self.admin_state_up);
    }
}

// =============================================================================
// Listener
// =============================================================================

impl ListenerFields {
    pub fn draft(&self) -> Result<Listener> {
        let kind = EntityKind::Listener;
        let name = require_text(kind, "name", &self.name)?;
        let protocol = require_text(kind, "protocol", &self.protocol)?;
        let port = require_port(kind, "protocol_port", self.protocol_port)?;
        let stat_port = require_port(kind, "stat_port", self.stat_port)?;

        self.validate()?;
        let mut listener = Listener::new(public_id_for_create(&self.id), name, protocol, port, stat_port);
        self.apply(&mut listener);
        Ok(listener)
    }

    pub fn validate(&self) -> Result<()> {
        check_port(EntityKind::Listener, "protocol_port", self.protocol_port)?;
        check_port(EntityKind::Listener, "stat_port", self.stat_port)
    }

    pub fn apply(&self, listener: &mut Listener) {
        set_text(&mut listener.name, &self.name);
        set_text(&mut listener.description, &self.description);
        set_text(&mut listener.protocol, &self.protocol);
        set_copy(&mut listener.protocol_port, self.protocol_port);
        set_copy(&mut listener.stat_port, self.stat_port);
        set_copy(&mut listener.connection_limit, self.connection_limit);
        set_copy(&mut listener.admin_state_up, self.admin_state_up);
    }
}

// =============================================================================
// Pool
// =============================================================================

impl PoolFields {
    pub fn draft(&self) -> Result<Pool> {
        let kind = EntityKind::Pool;
        let name = require_text(kind, "name", &self.name)?;
        let algorithm = require_text(kind, "lb_algorithm", &self.lb_algorithm)?;
        let protocol = require_text(kind, "protocol", &self.protocol)?;

        let mut pool = Pool::new(public_id_for_create(&self.id), name, algorithm, protocol);
        self.apply(&mut pool);
        Ok(pool)
    }

    pub fn apply(&self, pool: &mut Pool) {
        set_text(&mut pool.name, &self.name);
        set_text(&mut pool.description, &self.description);
        set_text(&mut pool.lb_algorithm, &self.lb_algorithm);
        set_text(&mut pool.protocol, &self.protocol);
        set_copy(&mut pool.admin_state_up, self.admin_state_up);
    }
}

// =============================================================================
// Member
// =============================================================================

impl MemberFields {
    /// Build a draft owned by an already resolved pool
    pub fn draft(&self, pool: &Pool) -> Result<Member> {
        let kind = EntityKind::Member;
        let address = require_text(kind, "address", &self.address)?;
        let port = require_port(kind, "protocol_port", self.protocol_port)?;

        let mut member = Member::new(public_id_for_create(&self.id), pool.id, address, port);
        self.apply(&mut member);
        Ok(member)
    }

    pub fn validate(&self) -> Result<()> {
        check_port(EntityKind::Member, "protocol_port", self.protocol_port)
    }

    pub fn apply(&self, member: &mut Member) {
        set_text(&mut member.address, &self.address);
        set_copy(&mut member.protocol_port, self.protocol_port);
        set_copy(&mut member.weight, self.weight);
        set_copy(&mut member.admin_state_up, self.admin_state_up);
    }
}

// =============================================================================
// HealthMonitor
// =============================================================================

impl HealthMonitorFields {
    pub fn draft(&self) -> Result<HealthMonitor> {
        let kind = EntityKind::HealthMonitor;
        let name = require_text(kind, "name", &self.name)?;
        let monitor_type = require_text(kind, "type", &self.monitor_type)?;
        let delay = self.delay.ok_or(Error::MissingField { kind, field: "delay" })?;
        let retries = self.max_retries.ok_or(Error::MissingField {
            kind,
            field: "max_retries",
        })?;
        let timeout = self.timeout.ok_or(Error::MissingField { kind, field: "timeout" })?;

        let mut monitor = HealthMonitor::new(
            public_id_for_create(&self.id),
            name,
            monitor_type,
            delay,
            retries,
            timeout,
        );
        self.apply(&mut monitor);
        Ok(monitor)
    }

    pub fn apply(&self, monitor: &mut HealthMonitor) {
        set_text(&mut monitor.name, &self.name);
        set_text(&mut monitor.monitor_type, &self.monitor_type);
        set_copy(&mut monitor.delay, self.delay);
        set_copy(&mut monitor.max_retries, self.max_retries);
        set_copy(&mut monitor.timeout, self.timeout);
        set_text(&mut monitor.http_method, &self.http_method);
        set_text(&mut monitor.url_path, &self.url_path);
        set_text(&mut monitor.expected_codes, &self.expected_codes);
        set_copy(&mut monitor.admin_state_up, self.admin_state_up);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_unknown_fields_rejected() {
        let err = serde_json::from_str::<ListenerFields>(r#"{"name": "x", "colour": "red"}"#);
        assert!(err.is_err());

        let ok = serde_json::from_str::<HealthMonitorFields>(r#"{"type": "HTTP", "delay": 5}"#).unwrap();
        assert_eq!(ok.monitor_type.as_deref(), Some("HTTP"));
    }

    #[test]
    fn test_listener_partial_update_keeps_other_fields() {
        let mut listener = Listener::new("l1".into(), "http", "HTTP", 80, 8404);
        listener.connection_limit = 500;

        let fields: ListenerFields = serde_json::from_str(r#"{"name": "x"}"#).unwrap();
        fields.validate().unwrap();
        fields.apply(&mut listener);

        assert_eq!(listener.name, "x");
        assert_eq!(listener.protocol, "HTTP");
        assert_eq!(listener.protocol_port, 80);
        assert_eq!(listener.stat_port, 8404);
        assert_eq!(listener.connection_limit, 500);
    }

    #[test]
    fn test_empty_strings_leave_fields_unchanged() {
        let mut pool = Pool::new("p1".into(), "web", "ROUND_ROBIN", "HTTP");
        let fields = PoolFields {
            name: Some("".into()),
            lb_algorithm: Some("LEAST_CONNECTIONS".into()),
            ..Default::default()
        };
        fields.apply(&mut pool);
        assert_eq!(pool.name, "web");
        assert_eq!(pool.lb_algorithm, "LEAST_CONNECTIONS");
    }

    #[test]
    fn test_required_fields_on_create() {
        let err = ListenerFields {
            name: Some("http".into()),
            protocol: Some("HTTP".into()),
            protocol_port: Some(80),
            ..Default::default()
        }
        .draft()
        .unwrap_err();
        assert_matches!(err, Error::MissingField { field: "stat_port", .. });

        let err = LoadBalancerFields {
            name: Some("web".into()),
            vip_address: Some("  ".into()),
            ..Default::default()
        }
        .draft("lbaas")
        .unwrap_err();
        assert_matches!(err, Error::MissingField { field: "vip_address", .. });

        let err = HealthMonitorFields {
            name: Some("hm".into()),
            monitor_type: Some("PING".into()),
            delay: Some(5),
            timeout: Some(2),
            ..Default::default()
        }
        .draft()
        .unwrap_err();
        assert_matches!(err, Error::MissingField { field: "max_retries", .. });
    }

    #[test]
    fn test_create_generates_or_keeps_public_id() {
        let fields = PoolFields {
            name: Some("web".into()),
            lb_algorithm: Some("ROUND_ROBIN".into()),
            protocol: Some("HTTP".into()),
            ..Default::default()
        };
        let generated = fields.draft().unwrap();
        assert_eq!(generated.pool_id.as_str().len(), 36);

        let supplied = PoolFields {
            id: Some("pool-web".into()),
            ..fields
        }
        .draft()
        .unwrap();
        assert_eq!(supplied.pool_id.as_str(), "pool-web");
    }

    #[test]
    fn test_ref_change() {
        assert_eq!(RefChange::from_field(&None), RefChange::Keep);
        assert_eq!(RefChange::from_field(&Some("".into())), RefChange::Clear);
        assert_eq!(
            RefChange::from_field(&Some("pool-1".into())),
            RefChange::Set(PublicId::from("pool-1"))
        );
    }

    #[test]
    fn test_immutable_id() {
        let current = PublicId::from("lb-1");
        assert!(check_immutable_id(EntityKind::LoadBalancer, &current, &None).is_ok());
        assert!(check_immutable_id(EntityKind::LoadBalancer, &current, &Some("lb-1".into())).is_ok());
        assert_matches!(
            check_immutable_id(EntityKind::LoadBalancer, &current, &Some("lb-2".into())),
            Err(Error::Validation(_))
        );
    }
}
