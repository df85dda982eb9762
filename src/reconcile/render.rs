//! Config Renderer Adapters
//!
//! The renderer turns a flattened snapshot into the enforcement agent's
//! configuration. `HttpRenderer` posts the field set to an external
//! templating service; `DryRunRenderer` only logs and records it.

use crate::config::SyncSettings;
use crate::domain::{ConfigRenderer, ConfigRendererRef, HandoffFields};
use crate::error::{Error, Result};
use async_trait::async_trait;
use backoff::ExponentialBackoff;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Build the renderer selected by the sync settings
pub fn renderer_from_settings(settings: &SyncSettings) -> Result<ConfigRendererRef> {
    match &settings.renderer_url {
        Some(url) => Ok(Arc::new(HttpRenderer::new(
            url.clone(),
            Duration::from_secs(settings.request_timeout_secs),
        )?)),
        None => Ok(Arc::new(DryRunRenderer::new())),
    }
}

// =============================================================================
// HTTP Renderer
// =============================================================================

/// Posts hand-off fields as JSON to a rendering endpoint
pub struct HttpRenderer {
    client: reqwest::Client,
    endpoint: String,
    max_elapsed: Duration,
}

impl HttpRenderer {
    pub fn new(endpoint: impl Into<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| Error::Configuration(format!("Invalid renderer client: {}", e)))?;
        Ok(Self {
            client,
            endpoint: endpoint.into(),
            max_elapsed: timeout * 3,
        })
    }

    async fn post_once(&self, fields: &HandoffFields) -> Result<()> {
        let response = self.client.post(&self.endpoint).json(fields).send().await?;
        let status = response.status();
        if status.is_server_error() {
            return Err(Error::RendererUnavailable(format!(
                "{} returned {}",
                self.endpoint, status
            )));
        }
        if !status.is_success() {
            return Err(Error::Validation(format!(
                "renderer rejected artifact: {}",
                status
            )));
        }
        Ok(())
    }
}

#[async_trait]
impl ConfigRenderer for HttpRenderer {
    async fn render(&self, fields: &HandoffFields) -> Result<()> {
        let policy = ExponentialBackoff {
            max_elapsed_time: Some(self.max_elapsed),
            ..Default::default()
        };
        backoff::future::retry(policy, move || async move {
            self.post_once(fields).await.map_err(|e| {
                let decision = e.into_backoff();
                if let backoff::Error::Transient { err, .. } = &decision {
                    warn!("Renderer request failed, retrying: {}", err);
                }
                decision
            })
        })
        .await?;

        debug!("Rendered artifact via {}", self.endpoint);
        Ok(())
    }

    fn renderer_name(&self) -> &str {
        "http"
    }
}

// =============================================================================
// Dry-run Renderer
// =============================================================================

/// Logs artifacts instead of rendering them
#[derive(Default)]
pub struct DryRunRenderer {
    rendered: AtomicU64,
    last: Mutex<Option<HandoffFields>>,
}

impl DryRunRenderer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rendered_count(&self) -> u64 {
        self.rendered.load(Ordering::Relaxed)
    }

    /// Most recently rendered field set
    pub fn last(&self) -> Option<HandoffFields> {
        self.last.lock().clone()
    }
}

#[async_trait]
impl ConfigRenderer for DryRunRenderer {
    async fn render(&self, fields: &HandoffFields) -> Result<()> {
        for (key, value) in fields {
            debug!("[dry-run] {} = {}", key, value);
        }
        info!(
            "[dry-run] Rendered configuration for instance {}",
            fields.get("instance_id").map(String::as_str).unwrap_or("-")
        );
        self.rendered.fetch_add(1, Ordering::Relaxed);
        *self.last.lock() = Some(fields.clone());
        Ok(())
    }

    fn renderer_name(&self) -> &str {
        "dry-run"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_dry_run_records_fields() {
        let renderer = DryRunRenderer::new();
        let mut fields = HandoffFields::new();
        fields.insert("instance_id".into(), "i-1".into());

        renderer.render(&fields).await.unwrap();
        assert_eq!(renderer.rendered_count(), 1);
        assert_eq!(renderer.last().unwrap()["instance_id"], "i-1");
    }

    #[test]
    fn test_renderer_selection() {
        let dry = renderer_from_settings(&SyncSettings::default()).unwrap();
        assert_eq!(dry.renderer_name(), "dry-run");

        let settings = SyncSettings {
            renderer_url: Some("http://127.0.0.1:9/render".into()),
            ..Default::default()
        };
        let http = renderer_from_settings(&settings).unwrap();
        assert_eq!(http.renderer_name(), "http");
    }
}
