//! Domain Ports - Core trait definitions for the control plane
//!
//! These traits define the boundaries between the reconciliation engine and
//! external systems: the durable entity store, the infrastructure that runs
//! the proxy instances, and the renderer that turns a configuration snapshot
//! into an enforcement-agent artifact.

use crate::error::Result;
use crate::model::{Entity, Instance, InstanceId, NetworkPort, PublicId, RecordId};
use async_trait::async_trait;
use indexmap::IndexMap;
use std::sync::Arc;

// =============================================================================
// Entity Repository Port
// =============================================================================

/// Atomic single-record mutation applied by [`Repository::modify`]
pub type Mutation<E> = Box<dyn FnOnce(&mut E) + Send>;

/// Port for durable storage of one entity type
///
/// Implementations must make every single-record operation atomic. No
/// multi-record transactions are offered; callers that need cross-record
/// invariants validate before writing.
#[async_trait]
pub trait Repository<E: Entity>: Send + Sync {
    /// Get a record by internal key
    async fn get(&self, id: RecordId) -> Result<Option<E>>;

    /// Get a record by public identifier
    async fn find(&self, public_id: &PublicId) -> Result<Option<E>>;

    /// List all records, ordered by internal key
    async fn list(&self) -> Result<Vec<E>>;

    /// List records matching a predicate, ordered by internal key
    async fn filter(&self, predicate: &(dyn for<'p> Fn(&'p E) -> bool + Send + Sync)) -> Result<Vec<E>>;

    /// Count records matching a predicate
    async fn count(&self, predicate: &(dyn for<'p> Fn(&'p E) -> bool + Send + Sync)) -> Result<usize>;

    /// Insert a new record and assign its internal key
    ///
    /// Fails with `ResourceExists` if the public identifier is taken.
    async fn insert(&self, entity: E) -> Result<E>;

    /// Apply a mutation to one record atomically
    ///
    /// Identity fields are restored after the mutation runs. Returns the
    /// updated record, or `None` if it does not exist.
    async fn modify(&self, id: RecordId, mutation: Mutation<E>) -> Result<Option<E>>;

    /// Hard-delete a record
    async fn remove(&self, id: RecordId) -> Result<Option<E>>;
}

// =============================================================================
// Infrastructure Provider Port
// =============================================================================

/// Port for the infrastructure that hosts the proxy instances
#[async_trait]
pub trait InfrastructureProvider: Send + Sync {
    /// List live (not deleted) instances
    async fn list_instances(&self) -> Result<Vec<Instance>>;

    /// Get an instance, including deleted ones
    async fn get_instance(&self, id: &InstanceId) -> Result<Option<Instance>>;

    /// Network ports bound to an instance
    async fn instance_ports(&self, id: &InstanceId) -> Result<Vec<NetworkPort>>;

    /// Read a tag value attached to an instance
    async fn get_tag(&self, id: &InstanceId, name: &str) -> Result<Option<String>>;

    /// Create or replace a tag value
    async fn put_tag(&self, id: &InstanceId, name: &str, value: String) -> Result<()>;

    /// Record an observed instance and replace its ports
    async fn register_instance(&self, instance: Instance, ports: Vec<NetworkPort>) -> Result<()>;

    /// Mark an instance deleted and remove its ports and tags
    async fn delete_instance(&self, id: &InstanceId) -> Result<()>;

    /// Check provider connectivity
    async fn health_check(&self) -> Result<bool>;
}

// =============================================================================
// Config Renderer Port
// =============================================================================

/// Flattened, independently serialized sections handed to the renderer
pub type HandoffFields = IndexMap<String, String>;

/// Port for the external templating layer that configures the proxy
#[async_trait]
pub trait ConfigRenderer: Send + Sync {
    /// Render and push a configuration artifact
    async fn render(&self, fields: &HandoffFields) -> Result<()>;

    /// Get renderer name
    fn renderer_name(&self) -> &str;
}

// =============================================================================
// Type Aliases for Arc'd Traits
// =============================================================================

pub type RepositoryRef<E> = Arc<dyn Repository<E>>;
pub type InfrastructureProviderRef = Arc<dyn InfrastructureProvider>;
pub type ConfigRendererRef = Arc<dyn ConfigRenderer>;
