//! Entity Model
//!
//! Records for the LoadBalancer → Listener → Pool → Member → Healthmonitor
//! graph, plus the backing instance records observed from infrastructure.

pub mod healthmonitor;
pub mod ids;
pub mod instance;
pub mod listener;
pub mod loadbalancer;
pub mod pool;
pub mod status;

pub use healthmonitor::*;
pub use ids::*;
pub use instance::*;
pub use listener::*;
pub use loadbalancer::*;
pub use pool::*;
pub use status::*;

/// Common behaviour of every stored entity
pub trait Entity: Clone + Send + Sync + 'static {
    /// Entity kind, used in errors and logs
    const KIND: EntityKind;

    /// Internal key, [`RecordId::UNASSIGNED`] until inserted
    fn record_id(&self) -> RecordId;

    /// Called once by the repository on insert
    fn assign_record_id(&mut self, id: RecordId);

    /// Stable public identifier
    fn public_id(&self) -> &PublicId;
}
