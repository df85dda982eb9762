//! Reconciliation Engine
//!
//! Everything that keeps the entity graph consistent and pushes it out:
//!
//! - [`checker`]: read-only referential audits
//! - [`status`]: bottom-up status derivation
//! - [`dispatcher`]: bounded resync queue and worker pool
//! - [`drift`]: background VIP and instance-health correction
//! - [`snapshot`]: fail-closed configuration snapshot assembly
//! - [`sync`]: enforcement-agent hand-off loop
//! - [`render`]: config renderer adapters

pub mod checker;
pub mod dispatcher;
pub mod drift;
pub mod render;
pub mod snapshot;
pub mod status;
pub mod sync;

pub use checker::{CheckFailure, CheckOutcome, ConsistencyChecker};
pub use dispatcher::{DispatcherStatsSnapshot, ResyncDispatcher, ResyncTask};
pub use drift::{derive_instance_status, DriftDetector, DriftReport, DriftStatsSnapshot};
pub use render::{renderer_from_settings, DryRunRenderer, HttpRenderer};
pub use snapshot::{ConfigSnapshot, Readiness, SnapshotAssembler};
pub use status::StatusAggregator;
pub use sync::{LoadBalancerSyncer, SyncOutcome, SyncStatsSnapshot};
