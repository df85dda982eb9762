//! Control Plane Configuration
//!
//! Every field has a default so a partial YAML file is valid. Command-line
//! arguments are applied on top of the loaded file by the binary.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

// =============================================================================
// Top-level Configuration
// =============================================================================

/// Control plane configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ControlPlaneConfig {
    /// REST API bind address
    pub api_addr: String,
    /// Health server bind address
    pub health_addr: String,
    /// Metrics server bind address
    pub metrics_addr: String,
    /// Owning service assigned to load balancers created without one
    pub default_owner: String,
    /// Known owning services, resolvable by templates
    pub services: Vec<String>,
    pub dispatcher: DispatcherSettings,
    pub drift: DriftSettings,
    pub sync: SyncSettings,
}

impl Default for ControlPlaneConfig {
    fn default() -> Self {
        Self {
            api_addr: "0.0.0.0:9876".to_string(),
            health_addr: "0.0.0.0:8081".to_string(),
            metrics_addr: "0.0.0.0:8080".to_string(),
            default_owner: "lbaas".to_string(),
            services: vec!["lbaas".to_string()],
            dispatcher: DispatcherSettings::default(),
            drift: DriftSettings::default(),
            sync: SyncSettings::default(),
        }
    }
}

impl ControlPlaneConfig {
    /// Load configuration from a YAML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path.as_ref())?;
        let config: Self = serde_yaml::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    /// Check value ranges that serde cannot express
    pub fn validate(&self) -> Result<()> {
        for (name, addr) in [
            ("api_addr", &self.api_addr),
            ("health_addr", &self.health_addr),
            ("metrics_addr", &self.metrics_addr),
        ] {
            addr.parse::<SocketAddr>().map_err(|e| {
                Error::Configuration(format!("Invalid {} '{}': {}", name, addr, e))
            })?;
        }
        if self.dispatcher.workers == 0 {
            return Err(Error::Configuration("dispatcher.workers must be at least 1".into()));
        }
        if self.dispatcher.queue_capacity == 0 {
            return Err(Error::Configuration(
                "dispatcher.queue_capacity must be at least 1".into(),
            ));
        }
        if self.drift.interval_secs == 0 || self.sync.interval_secs == 0 {
            return Err(Error::Configuration("loop intervals must be positive".into()));
        }
        if self.default_owner.trim().is_empty() {
            return Err(Error::Configuration("default_owner must not be empty".into()));
        }
        Ok(())
    }
}

// =============================================================================
// Component Settings
// =============================================================================

/// Resync dispatcher worker pool
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherSettings {
    pub workers: usize,
    pub queue_capacity: usize,
    /// Give up retrying a task after this long
    pub max_retry_elapsed_secs: u64,
}

impl Default for DispatcherSettings {
    fn default() -> Self {
        Self {
            workers: 4,
            queue_capacity: 1024,
            max_retry_elapsed_secs: 10,
        }
    }
}

impl DispatcherSettings {
    pub fn max_retry_elapsed(&self) -> Duration {
        Duration::from_secs(self.max_retry_elapsed_secs)
    }
}

/// Drift detector loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DriftSettings {
    pub interval_secs: u64,
    /// How long a diverging health report is tolerated before ERROR
    pub staleness_threshold_secs: u64,
}

impl Default for DriftSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            staleness_threshold_secs: 30,
        }
    }
}

/// Enforcement-agent sync loop
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncSettings {
    pub interval_secs: u64,
    /// Renderer endpoint; dry-run when unset
    pub renderer_url: Option<String>,
    pub request_timeout_secs: u64,
}

impl Default for SyncSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5,
            renderer_url: None,
            request_timeout_secs: 10,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::io::Write;

    #[test]
    fn test_defaults_are_valid() {
        let config = ControlPlaneConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.dispatcher.workers, 4);
        assert_eq!(config.dispatcher.queue_capacity, 1024);
        assert_eq!(config.drift.staleness_threshold_secs, 30);
        assert!(config.sync.renderer_url.is_none());
    }

    #[test]
    fn test_partial_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "default_owner: edge\ndrift:\n  interval_secs: 2\nsync:\n  renderer_url: http://renderer:8000/render"
        )
        .unwrap();

        let config = ControlPlaneConfig::from_file(file.path()).unwrap();
        assert_eq!(config.default_owner, "edge");
        assert_eq!(config.drift.interval_secs, 2);
        assert_eq!(config.drift.staleness_threshold_secs, 30);
        assert_eq!(
            config.sync.renderer_url.as_deref(),
            Some("http://renderer:8000/render")
        );
        assert_eq!(config.dispatcher.workers, 4);
    }

    #[test]
    fn test_invalid_values_rejected() {
        let mut config = ControlPlaneConfig::default();
        config.dispatcher.workers = 0;
        assert_matches!(config.validate(), Err(Error::Configuration(_)));

        let mut config = ControlPlaneConfig::default();
        config.api_addr = "not-an-address".into();
        assert_matches!(config.validate(), Err(Error::Configuration(_)));
    }

    #[test]
    fn test_missing_file() {
        let err = ControlPlaneConfig::from_file("/nonexistent/lbaas.yaml").unwrap_err();
        assert_matches!(err, Error::Io(_));
    }
}
