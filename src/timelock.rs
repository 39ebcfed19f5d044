//! Time-lock storage
//!
//! A time lock is the persistent half of a deferred grant: a UUID and a
//! cancelled flag. The coordinator inserts one when a time-lock policy
//! starts, a side channel may cancel it while the policy sleeps, and the
//! post-sleep read decides the grant. Cancellation is monotonic — a lock
//! never becomes un-cancelled.
//!
//! The store interface is async so implementations can live out of process;
//! the built-in store is an in-memory map.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use thiserror::Error;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum TimeLockError {
    #[error("unknown time lock {0}")]
    Unknown(Uuid),

    #[error("time lock storage failed: {0}")]
    Storage(String),
}

/// Observable state of one time lock.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeLockState {
    pub cancelled: bool,
}

/// Persistent store for pending time locks. `insert`, `get` and
/// `set_cancelled` are atomic with respect to each other.
#[async_trait]
pub trait TimeLockStore: Send + Sync {
    /// Record a fresh, uncancelled lock.
    async fn insert(&self, id: Uuid) -> Result<(), TimeLockError>;

    /// Current state, or `None` for an unknown id.
    async fn get(&self, id: Uuid) -> Result<Option<TimeLockState>, TimeLockError>;

    /// Mark the lock cancelled. Unknown ids are an error so cancellation
    /// links cannot silently misfire.
    async fn set_cancelled(&self, id: Uuid) -> Result<(), TimeLockError>;
}

struct LockEntry {
    cancelled: bool,
    created_at: Instant,
}

/// Thread-safe in-memory time-lock store.
#[derive(Default)]
pub struct MemoryTimeLockStore {
    locks: RwLock<HashMap<Uuid, LockEntry>>,
}

impl MemoryTimeLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop locks older than `ttl`. A client that disappears mid-lock
    /// leaves its entry behind; periodic cleanup keeps the map bounded.
    pub fn cleanup_expired(&self, ttl: Duration) {
        self.locks
            .write()
            .retain(|_, entry| entry.created_at.elapsed() < ttl);
    }

    pub fn len(&self) -> usize {
        self.locks.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.locks.read().is_empty()
    }
}

#[async_trait]
impl TimeLockStore for MemoryTimeLockStore {
    async fn insert(&self, id: Uuid) -> Result<(), TimeLockError> {
        self.locks.write().insert(
            id,
            LockEntry {
                cancelled: false,
                created_at: Instant::now(),
            },
        );
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<TimeLockState>, TimeLockError> {
        Ok(self.locks.read().get(&id).map(|entry| TimeLockState {
            cancelled: entry.cancelled,
        }))
    }

    async fn set_cancelled(&self, id: Uuid) -> Result<(), TimeLockError> {
        let mut locks = self.locks.write();
        match locks.get_mut(&id) {
            Some(entry) => {
                entry.cancelled = true;
                Ok(())
            }
            None => Err(TimeLockError::Unknown(id)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_insert_and_get() {
        let store = MemoryTimeLockStore::new();
        let id = Uuid::new_v4();
        store.insert(id).await.unwrap();
        assert_eq!(
            store.get(id).await.unwrap(),
            Some(TimeLockState { cancelled: false })
        );
    }

    #[tokio::test]
    async fn test_unknown_id_reads_none() {
        let store = MemoryTimeLockStore::new();
        assert_eq!(store.get(Uuid::new_v4()).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_cancel_is_monotonic() {
        let store = MemoryTimeLockStore::new();
        let id = Uuid::new_v4();
        store.insert(id).await.unwrap();

        store.set_cancelled(id).await.unwrap();
        assert!(store.get(id).await.unwrap().unwrap().cancelled);

        // Cancelling twice keeps the lock cancelled.
        store.set_cancelled(id).await.unwrap();
        assert!(store.get(id).await.unwrap().unwrap().cancelled);
    }

    #[tokio::test]
    async fn test_cancel_unknown_id_is_error() {
        let store = MemoryTimeLockStore::new();
        let err = store.set_cancelled(Uuid::new_v4()).await.unwrap_err();
        assert!(matches!(err, TimeLockError::Unknown(_)));
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let store = MemoryTimeLockStore::new();
        let id = Uuid::new_v4();
        store.insert(id).await.unwrap();
        assert_eq!(store.len(), 1);

        // Everything is younger than an hour.
        store.cleanup_expired(Duration::from_secs(3600));
        assert_eq!(store.len(), 1);

        // A zero TTL clears the map.
        store.cleanup_expired(Duration::from_secs(0));
        assert!(store.is_empty());
    }
}
