//! LBaaS Control Plane
//!
//! Desired-state management for software load balancers: a graph of
//! load balancers, listeners, pools, members and health monitors, kept
//! consistent across concurrent API mutations and reconciled onto the
//! HAProxy instances that enforce it.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                         REST API / Templates                         │
//! ├──────────────────────────────────────────────────────────────────────┤
//! │                 LbaasService (validate, resolve, write)              │
//! │                                   │                                  │
//! │          ┌────────────────────────┼─────────────────────────┐        │
//! │          ▼                        ▼                         ▼        │
//! │  ┌───────────────┐      ┌───────────────────┐      ┌──────────────┐  │
//! │  │  Repositories │◄─────│ Resync Dispatcher │      │   Checker    │  │
//! │  │ (one per kind)│      │ (queue + workers) │      │ (read-only)  │  │
//! │  └───────┬───────┘      └───────────────────┘      └──────────────┘  │
//! │          │                                                           │
//! │  ┌───────┴──────────┐   ┌──────────────────────┐                     │
//! │  │  Drift Detector  │   │  LoadBalancerSyncer  │──► ConfigRenderer   │
//! │  │ (VIP, health tag)│   │ (snapshot, hand-off) │                     │
//! │  └───────┬──────────┘   └──────────┬───────────┘                     │
//! ├──────────┴─────────────────────────┴─────────────────────────────────┤
//! │                 Infrastructure provider (instances, tags)            │
//! └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controlplane`]: service layer, views, templates and REST API
//! - [`reconcile`]: status aggregation, dispatcher, drift detection, sync
//! - [`store`]: in-memory repositories and store events
//! - [`infra`]: in-memory infrastructure provider
//! - [`domain`]: repository, infrastructure and renderer ports
//! - [`model`]: entity records and status enums
//! - [`config`]: configuration loading
//! - [`error`]: error types and handling

pub mod config;
pub mod controlplane;
pub mod domain;
pub mod error;
pub mod infra;
pub mod model;
pub mod reconcile;
pub mod store;

// Re-export commonly used types
pub use config::{ControlPlaneConfig, DispatcherSettings, DriftSettings, SyncSettings};

pub use controlplane::{
    ApiServer, ApiServerConfig, LbaasService, RestRouter, TemplateApplier, TemplateDocument,
};

pub use domain::ports::{
    ConfigRenderer, HandoffFields, InfrastructureProvider, Repository, RepositoryRef,
};

pub use error::{Error, ErrorAction, Result};

pub use infra::MemoryInfrastructure;

pub use model::{
    EntityKind, HealthMonitor, Listener, LoadBalancer, Member, OperatingStatus, Pool, PoolStatus,
    ProvisioningStatus, PublicId, RecordId,
};

pub use reconcile::{
    ConsistencyChecker, DriftDetector, LoadBalancerSyncer, ResyncDispatcher, StatusAggregator,
};

pub use store::{MemoryRepository, Repositories, StoreEvent};

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
