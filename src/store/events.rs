//! Store Events
//!
//! Events emitted by the entity store so that observers can follow record
//! lifecycle changes without polling.

use crate::model::EntityKind;
use serde::{Deserialize, Serialize};

/// Events emitted by the entity repositories
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoreEvent {
    /// A record was inserted
    Created { kind: EntityKind, id: String },

    /// A record was modified in place
    Updated { kind: EntityKind, id: String },

    /// A record was removed
    Deleted { kind: EntityKind, id: String },
}

impl StoreEvent {
    /// Public id of the affected record
    pub fn id(&self) -> &str {
        match self {
            StoreEvent::Created { id, .. } => id,
            StoreEvent::Updated { id, .. } => id,
            StoreEvent::Deleted { id, .. } => id,
        }
    }

    pub fn kind(&self) -> EntityKind {
        match self {
            StoreEvent::Created { kind, .. }
            | StoreEvent::Updated { kind, .. }
            | StoreEvent::Deleted { kind, .. } => *kind,
        }
    }

    /// Short label used for metrics and logs
    pub fn action(&self) -> &'static str {
        match self {
            StoreEvent::Created { .. } => "created",
            StoreEvent::Updated { .. } => "updated",
            StoreEvent::Deleted { .. } => "deleted",
        }
    }
}
