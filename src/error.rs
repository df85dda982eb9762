//! Error types for the LBaaS control plane
//!
//! Provides structured error types for the entity store, request validation,
//! background reconciliation, the infrastructure port and the config
//! renderer hand-off.

use crate::model::EntityKind;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the control plane
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Entity Store Errors
    // =========================================================================
    #[error("Resource not found: {kind}/{id}")]
    ResourceNotFound { kind: EntityKind, id: String },

    #[error("Resource already exists: {kind}/{id}")]
    ResourceExists { kind: EntityKind, id: String },

    #[error("Referenced {kind} does not exist: {id}")]
    UnresolvedReference { kind: EntityKind, id: String },

    #[error("{kind}/{id} is still referenced by a {dependent}")]
    ResourceInUse {
        kind: EntityKind,
        id: String,
        dependent: EntityKind,
    },

    // =========================================================================
    // Validation Errors
    // =========================================================================
    #[error("Mandatory field missing for {kind}: {field}")]
    MissingField { kind: EntityKind, field: &'static str },

    #[error("Validation failed: {0}")]
    Validation(String),

    // =========================================================================
    // Infrastructure Errors
    // =========================================================================
    #[error("Instance not found: {instance_id}")]
    InstanceNotFound { instance_id: String },

    #[error("Status tag error: {0}")]
    StatusTag(String),

    // =========================================================================
    // Reconciliation Errors
    // =========================================================================
    #[error("Resync queue is full, cannot enqueue task for {kind}/{id}")]
    ResyncQueueFull { kind: EntityKind, id: String },

    #[error("Resync dispatcher is shut down")]
    DispatcherClosed,

    #[error("Config renderer unavailable: {0}")]
    RendererUnavailable(String),

    #[error("Config renderer request failed: {0}")]
    RendererRequest(#[from] reqwest::Error),

    // =========================================================================
    // Template Errors
    // =========================================================================
    #[error("Template error in node '{node}': {reason}")]
    Template { node: String, reason: String },

    // =========================================================================
    // Parse Errors
    // =========================================================================
    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    // =========================================================================
    // IO Errors
    // =========================================================================
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        match self {
            // Transient errors - retry with backoff
            Error::RendererRequest(_) | Error::RendererUnavailable(_) => {
                ErrorAction::RequeueWithBackoff
            }

            // Queue pressure - give the workers time to drain
            Error::ResyncQueueFull { .. } => ErrorAction::RequeueAfter(Duration::from_secs(1)),

            // Caller errors, missing records and agent state the next drift
            // cycle picks up - don't retry automatically
            Error::Configuration(_)
            | Error::Validation(_)
            | Error::MissingField { .. }
            | Error::ResourceNotFound { .. }
            | Error::ResourceExists { .. }
            | Error::UnresolvedReference { .. }
            | Error::ResourceInUse { .. }
            | Error::InstanceNotFound { .. }
            | Error::StatusTag(_)
            | Error::Template { .. }
            | Error::YamlParse(_)
            | Error::JsonParse(_)
            | Error::DispatcherClosed => ErrorAction::NoRequeue,

            // All other errors - retry with backoff
            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Convert into a `backoff` retry decision following [`Error::action`]
    pub fn into_backoff(self) -> backoff::Error<Error> {
        match self.action() {
            ErrorAction::RequeueWithBackoff => backoff::Error::transient(self),
            ErrorAction::RequeueAfter(delay) => backoff::Error::retry_after(self, delay),
            ErrorAction::NoRequeue => backoff::Error::permanent(self),
        }
    }

    /// Errors caused by the request payload itself
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Error::Validation(_)
                | Error::MissingField { .. }
                | Error::Template { .. }
                | Error::YamlParse(_)
                | Error::JsonParse(_)
        )
    }

    pub fn not_found(kind: EntityKind, id: impl std::fmt::Display) -> Self {
        Error::ResourceNotFound {
            kind,
            id: id.to_string(),
        }
    }

    pub fn unresolved(kind: EntityKind, id: impl std::fmt::Display) -> Self {
        Error::UnresolvedReference {
            kind,
            id: id.to_string(),
        }
    }
}

/// Result type alias for the control plane
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_error_actions() {
        let err = Error::ResyncQueueFull {
            kind: EntityKind::Pool,
            id: "pool-1".into(),
        };
        assert_eq!(err.action(), ErrorAction::RequeueAfter(Duration::from_secs(1)));

        let err = Error::Configuration("bad config".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::StatusTag("missing".into());
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Internal("lock poisoned".into());
        assert_eq!(err.action(), ErrorAction::RequeueWithBackoff);
    }

    #[test]
    fn test_backoff_follows_action() {
        let transient = Error::RendererUnavailable("connection refused".into());
        assert_matches!(
            transient.into_backoff(),
            backoff::Error::Transient { retry_after: None, .. }
        );

        let full = Error::ResyncQueueFull {
            kind: EntityKind::Member,
            id: "7".into(),
        };
        assert_matches!(
            full.into_backoff(),
            backoff::Error::Transient { retry_after: Some(delay), .. } if delay == Duration::from_secs(1)
        );

        let in_use = Error::ResourceInUse {
            kind: EntityKind::Pool,
            id: "pool-1".into(),
            dependent: EntityKind::Member,
        };
        assert_matches!(in_use.into_backoff(), backoff::Error::Permanent(Error::ResourceInUse { .. }));
    }

    #[test]
    fn test_validation_classification() {
        let missing = Error::MissingField {
            kind: EntityKind::Listener,
            field: "protocol_port",
        };
        assert!(missing.is_validation());
        assert_eq!(
            missing.to_string(),
            "Mandatory field missing for listener: protocol_port"
        );
        assert!(!Error::not_found(EntityKind::Pool, "p").is_validation());
    }
}
