//! In-memory snapshot stores applying the same version guards as Postgres.

#![allow(clippy::unwrap_used)] // Test infrastructure uses unwrap for simplicity

use futures::future::BoxFuture;
use quicket_core::snapshot::{
    ApplyOutcome, EventSnapshot, EventSnapshotStore, SnapshotError, UserSnapshot,
    UserSnapshotStore,
};
use quicket_core::types::{EventId, PublicId, UserId};
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, RwLock};

/// Shared map plus failure injection.
#[derive(Debug)]
struct Table<K, V> {
    rows: Arc<RwLock<HashMap<K, V>>>,
    failures: Arc<AtomicUsize>,
}

impl<K, V> Clone for Table<K, V> {
    fn clone(&self) -> Self {
        Self {
            rows: Arc::clone(&self.rows),
            failures: Arc::clone(&self.failures),
        }
    }
}

impl<K, V> Default for Table<K, V> {
    fn default() -> Self {
        Self {
            rows: Arc::new(RwLock::new(HashMap::new())),
            failures: Arc::new(AtomicUsize::new(0)),
        }
    }
}

impl<K: Eq + Hash + Copy, V: Clone> Table<K, V> {
    fn check_failure(&self) -> Result<(), SnapshotError> {
        let injected = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            Err(SnapshotError::Storage("injected write failure".to_string()))
        } else {
            Ok(())
        }
    }

    fn insert(&self, key: K, value: V) -> Result<ApplyOutcome, SnapshotError> {
        self.check_failure()?;
        let mut rows = self.rows.write().unwrap();
        if rows.contains_key(&key) {
            return Ok(ApplyOutcome::Skipped);
        }
        rows.insert(key, value);
        Ok(ApplyOutcome::Applied)
    }

    fn upsert(&self, key: K, value: V, version: impl Fn(&V) -> u64) -> Result<ApplyOutcome, SnapshotError> {
        self.check_failure()?;
        let mut rows = self.rows.write().unwrap();
        match rows.get(&key) {
            Some(stored) if version(stored) > version(&value) => Ok(ApplyOutcome::Skipped),
            _ => {
                rows.insert(key, value);
                Ok(ApplyOutcome::Applied)
            }
        }
    }

    fn delete(&self, key: &K) -> Result<ApplyOutcome, SnapshotError> {
        self.check_failure()?;
        let removed = self.rows.write().unwrap().remove(key);
        Ok(if removed.is_some() {
            ApplyOutcome::Applied
        } else {
            ApplyOutcome::Skipped
        })
    }

    fn find(&self, predicate: impl Fn(&V) -> bool) -> Option<V> {
        self.rows.read().unwrap().values().find(|v| predicate(v)).cloned()
    }

    fn get(&self, key: &K) -> Option<V> {
        self.rows.read().unwrap().get(key).cloned()
    }
}

/// In-memory [`EventSnapshotStore`]. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryEventSnapshots {
    table: Table<EventId, EventSnapshot>,
}

impl InMemoryEventSnapshots {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a storage error.
    pub fn fail_next_writes(&self, n: usize) {
        self.table.failures.store(n, Ordering::SeqCst);
    }

    /// Read by internal id.
    #[must_use]
    pub fn get(&self, id: EventId) -> Option<EventSnapshot> {
        self.table.get(&id)
    }

    /// Number of stored snapshots.
    #[must_use]
    pub fn len(&self) -> usize {
        self.table.rows.read().unwrap().len()
    }

    /// Whether the store is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl EventSnapshotStore for InMemoryEventSnapshots {
    fn insert(&self, snapshot: EventSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move { self.table.insert(snapshot.id, snapshot) })
    }

    fn upsert(&self, snapshot: EventSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move { self.table.upsert(snapshot.id, snapshot, |s| s.version) })
    }

    fn update_seats(
        &self,
        id: EventId,
        available_seats: u64,
        version: u64,
    ) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move {
            self.table.check_failure()?;
            let mut rows = self.table.rows.write().unwrap();
            match rows.get_mut(&id) {
                Some(stored) if stored.version <= version => {
                    stored.available_seats = available_seats;
                    stored.version = version;
                    Ok(ApplyOutcome::Applied)
                }
                _ => Ok(ApplyOutcome::Skipped),
            }
        })
    }

    fn delete(&self, id: EventId) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move { self.table.delete(&id) })
    }

    fn find_by_public_id(
        &self,
        public_id: PublicId,
    ) -> BoxFuture<'_, Result<Option<EventSnapshot>, SnapshotError>> {
        Box::pin(async move { Ok(self.table.find(|s| s.public_id == public_id)) })
    }
}

/// In-memory [`UserSnapshotStore`]. Clones share state.
#[derive(Clone, Debug, Default)]
pub struct InMemoryUserSnapshots {
    table: Table<UserId, UserSnapshot>,
}

impl InMemoryUserSnapshots {
    /// Empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Make the next `n` writes fail with a storage error.
    pub fn fail_next_writes(&self, n: usize) {
        self.table.failures.store(n, Ordering::SeqCst);
    }

    /// Read by internal id.
    #[must_use]
    pub fn get(&self, id: UserId) -> Option<UserSnapshot> {
        self.table.get(&id)
    }
}

impl UserSnapshotStore for InMemoryUserSnapshots {
    fn insert(&self, snapshot: UserSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move { self.table.insert(snapshot.id, snapshot) })
    }

    fn upsert(&self, snapshot: UserSnapshot) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move { self.table.upsert(snapshot.id, snapshot, |s| s.version) })
    }

    fn delete(&self, id: UserId) -> BoxFuture<'_, Result<ApplyOutcome, SnapshotError>> {
        Box::pin(async move { self.table.delete(&id) })
    }

    fn find_by_public_id(
        &self,
        public_id: PublicId,
    ) -> BoxFuture<'_, Result<Option<UserSnapshot>, SnapshotError>> {
        Box::pin(async move { Ok(self.table.find(|s| s.public_id == public_id)) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures;
    use chrono::Utc;
    use quicket_core::types::Money;

    fn event(version: u64, seats: u64) -> EventSnapshot {
        EventSnapshot {
            id: EventId::new(1),
            public_id: PublicId::from_uuid(uuid::Uuid::from_u128(1)),
            title: "RustConf".to_string(),
            start_date: Utc::now(),
            end_date: Utc::now(),
            available_seats: seats,
            ticket_price: Money::from_cents(100),
            version,
        }
    }

    #[tokio::test]
    async fn test_created_only_inserts_when_absent() {
        let store = InMemoryEventSnapshots::new();
        assert_eq!(store.insert(event(1, 10)).await.unwrap(), ApplyOutcome::Applied);
        assert_eq!(store.insert(event(2, 5)).await.unwrap(), ApplyOutcome::Skipped);
        assert_eq!(store.get(EventId::new(1)).unwrap().version, 1);
    }

    #[tokio::test]
    async fn test_stale_seats_update_is_discarded() {
        let store = InMemoryEventSnapshots::new();
        store.insert(event(7, 3)).await.unwrap();

        let outcome = store.update_seats(EventId::new(1), 9, 5).await.unwrap();

        assert_eq!(outcome, ApplyOutcome::Skipped);
        let stored = store.get(EventId::new(1)).unwrap();
        assert_eq!((stored.available_seats, stored.version), (3, 7));
    }

    #[tokio::test]
    async fn test_seats_update_for_absent_snapshot_is_skipped() {
        let store = InMemoryEventSnapshots::new();
        let outcome = store.update_seats(EventId::new(1), 9, 5).await.unwrap();
        assert_eq!(outcome, ApplyOutcome::Skipped);
        assert!(store.is_empty());
    }

    #[tokio::test]
    async fn test_injected_failures_count_down() {
        let store = InMemoryUserSnapshots::new();
        store.fail_next_writes(1);
        assert!(store.insert(fixtures::user(1)).await.is_err());
        assert!(store.insert(fixtures::user(1)).await.is_ok());
    }
}
