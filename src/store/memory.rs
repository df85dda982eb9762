//! In-Memory Entity Repository
//!
//! DashMap-backed implementation of [`Repository`]. Records are keyed by
//! their internal id; a secondary index maps public ids to record ids.

use crate::domain::{Mutation, Repository};
use crate::error::{Error, Result};
use crate::model::{Entity, PublicId, RecordId};
use crate::store::StoreEvent;
use async_trait::async_trait;
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

// =============================================================================
// Repository Statistics
// =============================================================================

#[derive(Debug, Default)]
pub struct RepositoryStats {
    pub inserts: AtomicU64,
    pub updates: AtomicU64,
    pub removals: AtomicU64,
}

impl RepositoryStats {
    pub fn snapshot(&self) -> RepositoryStatsSnapshot {
        RepositoryStatsSnapshot {
            inserts: self.inserts.load(Ordering::Relaxed),
            updates: self.updates.load(Ordering::Relaxed),
            removals: self.removals.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RepositoryStatsSnapshot {
    pub inserts: u64,
    pub updates: u64,
    pub removals: u64,
}

// =============================================================================
// Memory Repository
// =============================================================================

/// In-memory repository for one entity type
pub struct MemoryRepository<E: Entity> {
    records: DashMap<RecordId, E>,
    /// Public id -> record id
    index: DashMap<PublicId, RecordId>,
    next_id: AtomicU64,
    stats: RepositoryStats,
    event_sender: Option<broadcast::Sender<StoreEvent>>,
}

impl<E: Entity> MemoryRepository<E> {
    /// Create an empty repository
    pub fn new() -> Arc<Self> {
        Arc::new(Self::build(None))
    }

    /// Create an empty repository that publishes lifecycle events
    pub fn with_events(event_sender: broadcast::Sender<StoreEvent>) -> Arc<Self> {
        Arc::new(Self::build(Some(event_sender)))
    }

    fn build(event_sender: Option<broadcast::Sender<StoreEvent>>) -> Self {
        Self {
            records: DashMap::new(),
            index: DashMap::new(),
            next_id: AtomicU64::new(1),
            stats: RepositoryStats::default(),
            event_sender,
        }
    }

    pub fn stats(&self) -> RepositoryStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    fn publish(&self, event: StoreEvent) {
        if let Some(sender) = &self.event_sender {
            // No subscribers is fine
            let _ = sender.send(event);
        }
    }

    fn sorted(&self, mut records: Vec<E>) -> Vec<E> {
        records.sort_by_key(|e| e.record_id());
        records
    }
}

#[async_trait]
impl<E: Entity> Repository<E> for MemoryRepository<E> {
    async fn get(&self, id: RecordId) -> Result<Option<E>> {
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn find(&self, public_id: &PublicId) -> Result<Option<E>> {
        let id = match self.index.get(public_id) {
            Some(id) => *id.value(),
            None => return Ok(None),
        };
        Ok(self.records.get(&id).map(|r| r.value().clone()))
    }

    async fn list(&self) -> Result<Vec<E>> {
        let records = self.records.iter().map(|r| r.value().clone()).collect();
        Ok(self.sorted(records))
    }

    async fn filter(&self, predicate: &(dyn for<'p> Fn(&'p E) -> bool + Send + Sync)) -> Result<Vec<E>> {
        let records = self
            .records
            .iter()
            .filter(|r| predicate(r.value()))
            .map(|r| r.value().clone())
            .collect();
        Ok(self.sorted(records))
    }

    async fn count(&self, predicate: &(dyn for<'p> Fn(&'p E) -> bool + Send + Sync)) -> Result<usize> {
        Ok(self.records.iter().filter(|r| predicate(r.value())).count())
    }

    async fn insert(&self, mut entity: E) -> Result<E> {
        let public_id = entity.public_id().clone();
        if public_id.as_str().is_empty() {
            return Err(Error::MissingField {
                kind: E::KIND,
                field: "id",
            });
        }

        // Holding the index entry serializes inserts of the same public id
        match self.index.entry(public_id.clone()) {
            Entry::Occupied(_) => {
                return Err(Error::ResourceExists {
                    kind: E::KIND,
                    id: public_id.to_string(),
                })
            }
            Entry::Vacant(slot) => {
                let id = RecordId(self.next_id.fetch_add(1, Ordering::Relaxed));
                entity.assign_record_id(id);
                self.records.insert(id, entity.clone());
                slot.insert(id);
            }
        }

        self.stats.inserts.fetch_add(1, Ordering::Relaxed);
        self.publish(StoreEvent::Created {
            kind: E::KIND,
            id: public_id.to_string(),
        });
        Ok(entity)
    }

    async fn modify(&self, id: RecordId, mutation: Mutation<E>) -> Result<Option<E>> {
        let updated = {
            let mut record = match self.records.get_mut(&id) {
                Some(record) => record,
                None => return Ok(None),
            };
            let original = record.value().clone();
            mutation(record.value_mut());
            record.value_mut().assign_record_id(id);

            if record.public_id() != original.public_id() {
                *record.value_mut() = original;
                return Err(Error::Validation(format!(
                    "{} public id is immutable",
                    E::KIND
                )));
            }
            record.value().clone()
        };

        self.stats.updates.fetch_add(1, Ordering::Relaxed);
        self.publish(StoreEvent::Updated {
            kind: E::KIND,
            id: updated.public_id().to_string(),
        });
        Ok(Some(updated))
    }

    async fn remove(&self, id: RecordId) -> Result<Option<E>> {
        let removed = match self.records.remove(&id) {
            Some((_, entity)) => entity,
            None => return Ok(None),
        };
        self.index.remove(removed.public_id());

        self.stats.removals.fetch_add(1, Ordering::Relaxed);
        self.publish(StoreEvent::Deleted {
            kind: E::KIND,
            id: removed.public_id().to_string(),
        });
        Ok(Some(removed))
    }
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::RepositoryRef;
    use crate::model::{EntityKind, Member, Pool};
    use assert_matches::assert_matches;

    fn pool(id: &str) -> Pool {
        Pool::new(PublicId::from(id), id, "ROUND_ROBIN", "HTTP")
    }

    #[tokio::test]
    async fn test_basic_operations() {
        let repo = MemoryRepository::<Pool>::new();

        let inserted = repo.insert(pool("pool-1")).await.unwrap();
        assert!(inserted.id.is_assigned());
        assert_eq!(repo.len(), 1);

        let by_key = repo.get(inserted.id).await.unwrap().unwrap();
        assert_eq!(by_key.pool_id.as_str(), "pool-1");

        let by_public = repo.find(&PublicId::from("pool-1")).await.unwrap().unwrap();
        assert_eq!(by_public.id, inserted.id);

        assert!(repo.find(&PublicId::from("missing")).await.unwrap().is_none());
        assert!(repo.get(RecordId(999)).await.unwrap().is_none());

        let removed = repo.remove(inserted.id).await.unwrap().unwrap();
        assert_eq!(removed.id, inserted.id);
        assert!(repo.is_empty());
        assert!(repo.find(&PublicId::from("pool-1")).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_public_id_rejected() {
        let repo = MemoryRepository::<Pool>::new();
        repo.insert(pool("pool-1")).await.unwrap();

        let err = repo.insert(pool("pool-1")).await.unwrap_err();
        assert_matches!(err, Error::ResourceExists { kind: EntityKind::Pool, .. });
        assert_eq!(repo.len(), 1);
    }

    #[tokio::test]
    async fn test_record_ids_are_increasing() {
        let repo = MemoryRepository::<Pool>::new();
        let a = repo.insert(pool("a")).await.unwrap();
        let b = repo.insert(pool("b")).await.unwrap();
        assert!(b.id > a.id);

        let listed: Vec<_> = repo.list().await.unwrap().into_iter().map(|p| p.id).collect();
        assert_eq!(listed, vec![a.id, b.id]);
    }

    #[tokio::test]
    async fn test_modify_keeps_identity() {
        let repo = MemoryRepository::<Pool>::new();
        let inserted = repo.insert(pool("pool-1")).await.unwrap();

        let updated = repo
            .modify(inserted.id, Box::new(|p: &mut Pool| p.name = "renamed".into()))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(updated.name, "renamed");

        let err = repo
            .modify(
                inserted.id,
                Box::new(|p: &mut Pool| p.pool_id = PublicId::from("other")),
            )
            .await
            .unwrap_err();
        assert_matches!(err, Error::Validation(_));

        let stored = repo.get(inserted.id).await.unwrap().unwrap();
        assert_eq!(stored.pool_id.as_str(), "pool-1");
        assert_eq!(stored.name, "renamed");

        let missing = repo
            .modify(RecordId(42), Box::new(|p: &mut Pool| p.name.clear()))
            .await
            .unwrap();
        assert!(missing.is_none());
    }

    #[tokio::test]
    async fn test_filter_and_count() {
        let repo = MemoryRepository::<Member>::new();
        repo.insert(Member::new("m1".into(), RecordId(1), "10.0.0.1", 80)).await.unwrap();
        repo.insert(Member::new("m2".into(), RecordId(1), "10.0.0.2", 80)).await.unwrap();
        repo.insert(Member::new("m3".into(), RecordId(2), "10.0.0.3", 80)).await.unwrap();

        let in_pool = repo.filter(&|m: &Member| m.pool == RecordId(1)).await.unwrap();
        assert_eq!(in_pool.len(), 2);
        assert_eq!(repo.count(&|m: &Member| m.pool == RecordId(2)).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_predicates_borrowing_locals_through_port() {
        let repo: RepositoryRef<Member> = MemoryRepository::<Member>::new();
        for (id, pool, address) in [("m1", 1, "10.0.0.1"), ("m2", 2, "10.0.0.2"), ("m3", 3, "10.0.0.3")] {
            repo.insert(Member::new(id.into(), RecordId(pool), address, 80)).await.unwrap();
        }

        let pools = vec![RecordId(1), RecordId(3)];
        let address = String::from("10.0.0.2");

        let matched = repo.filter(&|m: &Member| pools.contains(&m.pool)).await.unwrap();
        assert_eq!(matched.len(), 2);
        assert_eq!(repo.count(&|m: &Member| m.address == address).await.unwrap(), 1);
        assert!(repo.filter(&|_: &Member| false).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_events_and_stats() {
        let (tx, mut rx) = broadcast::channel(16);
        let repo = MemoryRepository::<Pool>::with_events(tx);

        let inserted = repo.insert(pool("pool-1")).await.unwrap();
        repo.modify(inserted.id, Box::new(|p: &mut Pool| p.admin_state_up = false))
            .await
            .unwrap();
        repo.remove(inserted.id).await.unwrap();

        assert_matches!(rx.recv().await.unwrap(), StoreEvent::Created { .. });
        assert_matches!(rx.recv().await.unwrap(), StoreEvent::Updated { .. });
        assert_matches!(rx.recv().await.unwrap(), StoreEvent::Deleted { .. });

        let stats = repo.stats();
        assert_eq!(stats.inserts, 1);
        assert_eq!(stats.updates, 1);
        assert_eq!(stats.removals, 1);
    }
}
