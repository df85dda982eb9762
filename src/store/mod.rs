//! Entity Store
//!
//! One repository per entity type. The reconciliation engine and the API
//! only ever see the [`Repository`](crate::domain::Repository) trait; the
//! in-memory implementation here backs the service and the tests.

pub mod events;
pub mod memory;

pub use events::StoreEvent;
pub use memory::{MemoryRepository, RepositoryStats, RepositoryStatsSnapshot};

use crate::domain::RepositoryRef;
use crate::model::{HealthMonitor, Listener, LoadBalancer, Member, Pool};
use tokio::sync::broadcast;

/// Capacity of the store event channel
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// The full set of repositories, injected into every component
#[derive(Clone)]
pub struct Repositories {
    pub loadbalancers: RepositoryRef<LoadBalancer>,
    pub listeners: RepositoryRef<Listener>,
    pub pools: RepositoryRef<Pool>,
    pub members: RepositoryRef<Member>,
    pub health_monitors: RepositoryRef<HealthMonitor>,
    event_sender: broadcast::Sender<StoreEvent>,
}

impl Repositories {
    /// Assemble from arbitrary repository implementations
    pub fn new(
        loadbalancers: RepositoryRef<LoadBalancer>,
        listeners: RepositoryRef<Listener>,
        pools: RepositoryRef<Pool>,
        members: RepositoryRef<Member>,
        health_monitors: RepositoryRef<HealthMonitor>,
    ) -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            loadbalancers,
            listeners,
            pools,
            members,
            health_monitors,
            event_sender,
        }
    }

    /// In-memory repositories sharing one event channel
    pub fn in_memory() -> Self {
        let (event_sender, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        Self {
            loadbalancers: MemoryRepository::with_events(event_sender.clone()),
            listeners: MemoryRepository::with_events(event_sender.clone()),
            pools: MemoryRepository::with_events(event_sender.clone()),
            members: MemoryRepository::with_events(event_sender.clone()),
            health_monitors: MemoryRepository::with_events(event_sender.clone()),
            event_sender,
        }
    }

    /// Get a receiver for store lifecycle events
    pub fn subscribe(&self) -> broadcast::Receiver<StoreEvent> {
        self.event_sender.subscribe()
    }
}
