//! lock
//!
//! Exclusive per-(collection, key) claims for jobs.
//!
//! # Architecture
//!
//! A lock is a record in the locks collection whose mere existence grants one
//! job exclusive claim over one (collection, key) pair. Creation is a
//! create-only conditional put, so the store itself arbitrates races: the
//! first writer wins and every other acquirer sees a precondition failure.
//!
//! # Invariants
//!
//! - At most one lock record exists per (collection, key) at any instant
//! - Acquisition never blocks or queues; a conflict is reported immediately
//! - Release is a conditional delete against the version held by the owner;
//!   a stale version means someone (usually the curator) already removed the
//!   lock, which is treated as already-released
//!
//! The lock manager performs no timeout math of its own. It exposes
//! enumeration of all lock entries so the curator can compute staleness from
//! their timestamps.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::core::config::Config;
use crate::core::types::JobId;
use crate::store::{PutCondition, Ref, Store, StoreError};

/// Errors from lock operations.
#[derive(Debug, Error)]
pub enum LockError {
    /// The (collection, key) pair is already locked by a different job.
    #[error("{collection}/{key} is locked by job {holder}")]
    CollectionKeyIsLocked {
        /// Collection of the contested record.
        collection: String,
        /// Key of the contested record.
        key: String,
        /// The job currently holding the lock.
        holder: JobId,
    },

    /// A lock record in the store could not be decoded.
    #[error("malformed lock record at {entry_key}: {source}")]
    MalformedRecord {
        /// Entry key of the bad record in the locks collection.
        entry_key: String,
        /// The decode failure.
        #[source]
        source: serde_json::Error,
    },

    /// The store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),
}

/// Key of a lock record within the locks collection.
pub(crate) fn lock_entry_key(collection: &str, key: &str) -> String {
    format!("{}-{}", collection, key)
}

/// The persisted body of a lock record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockRecord {
    /// The job holding the lock.
    pub job_id: JobId,
    /// Acquisition time.
    pub timestamp: DateTime<Utc>,
    /// Collection of the locked record.
    pub collection: String,
    /// Key of the locked record.
    pub key: String,
}

/// An acquired lock: the persisted record plus the version token needed to
/// release it.
#[derive(Debug, Clone)]
pub struct Lock {
    /// The persisted record body.
    pub record: LockRecord,
    /// Version token of the lock record, required for release.
    pub lock_ref: Ref,
}

impl Lock {
    /// The (collection, key) pair this lock covers.
    pub fn covers(&self, collection: &str, key: &str) -> bool {
        self.record.collection == collection && self.record.key == key
    }
}

/// A lock entry as enumerated from the store (curator view).
#[derive(Debug, Clone)]
pub struct LockEntry {
    /// Key of the entry in the locks collection.
    pub entry_key: String,
    /// The persisted record body.
    pub record: LockRecord,
    /// Version token current as of enumeration.
    pub version: Ref,
}

/// Creates, inspects, and releases lock records.
#[derive(Clone)]
pub struct LockManager {
    store: Arc<dyn Store>,
    config: Config,
}

impl LockManager {
    /// Create a lock manager over the given store.
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        Self { store, config }
    }

    /// Attempt to acquire the lock for (collection, key) on behalf of a job.
    ///
    /// Re-acquiring a lock the same job already holds is idempotent and
    /// returns the existing record.
    ///
    /// # Errors
    ///
    /// - [`LockError::CollectionKeyIsLocked`] if another job holds the lock
    /// - [`LockError::Store`] for any backing-store fault
    pub async fn acquire(
        &self,
        job_id: &JobId,
        collection: &str,
        key: &str,
    ) -> Result<Lock, LockError> {
        let entry_key = lock_entry_key(collection, key);
        let mut retried = false;
        loop {
            let record = LockRecord {
                job_id: job_id.clone(),
                timestamp: Utc::now(),
                collection: collection.to_string(),
                key: key.to_string(),
            };
            let body =
                serde_json::to_value(&record).map_err(|source| LockError::MalformedRecord {
                    entry_key: entry_key.clone(),
                    source,
                })?;

            match self
                .store
                .put(
                    &self.config.locks_collection,
                    &entry_key,
                    &body,
                    PutCondition::IfAbsent,
                )
                .await
            {
                Ok(lock_ref) => {
                    debug!(job_id = %job_id, entry_key = %entry_key, "acquired lock");
                    return Ok(Lock { record, lock_ref });
                }
                // A record already exists: held by us (idempotent
                // re-acquire) or by someone else (conflict).
                Err(StoreError::VersionMismatch) => {
                    match self.store.get(&self.config.locks_collection, &entry_key).await {
                        Ok(existing) => {
                            let held: LockRecord = serde_json::from_value(existing.value)
                                .map_err(|source| LockError::MalformedRecord {
                                    entry_key: entry_key.clone(),
                                    source,
                                })?;
                            if &held.job_id == job_id {
                                return Ok(Lock {
                                    record: held,
                                    lock_ref: existing.version,
                                });
                            }
                            return Err(LockError::CollectionKeyIsLocked {
                                collection: held.collection.clone(),
                                key: held.key.clone(),
                                holder: held.job_id,
                            });
                        }
                        // The holder released between our put and get; the
                        // key is free again, so retry the create-only put
                        // once. A second vanish means the key is churning
                        // and the conflict surfaces to the caller.
                        Err(StoreError::NotFound) if !retried => {
                            retried = true;
                            continue;
                        }
                        Err(StoreError::NotFound) => {
                            return Err(StoreError::VersionMismatch.into());
                        }
                        Err(other) => return Err(other.into()),
                    }
                }
                Err(other) => return Err(other.into()),
            }
        }
    }

    /// Release a held lock.
    ///
    /// Absence or a stale version token means the lock was already removed
    /// (released earlier, or reaped by the curator) and is not an error.
    ///
    /// # Errors
    ///
    /// Any backing-store fault other than the benign races above.
    pub async fn release(&self, lock: &Lock) -> Result<(), StoreError> {
        let entry_key = lock_entry_key(&lock.record.collection, &lock.record.key);
        self.release_entry(&entry_key, &lock.lock_ref).await
    }

    /// Release a lock entry by its store key and version.
    ///
    /// Shared by [`LockManager::release`] and the curator's orphan sweep.
    pub async fn release_entry(&self, entry_key: &str, version: &Ref) -> Result<(), StoreError> {
        match self
            .store
            .delete(&self.config.locks_collection, entry_key, version)
            .await
        {
            Ok(()) => {
                debug!(entry_key = %entry_key, "released lock");
                Ok(())
            }
            // Already released or reaped - nothing left to do.
            Err(StoreError::NotFound) | Err(StoreError::VersionMismatch) => {
                debug!(entry_key = %entry_key, "lock already released");
                Ok(())
            }
            Err(other) => Err(other),
        }
    }

    /// Enumerate every lock entry in the locks collection.
    ///
    /// Malformed records are logged and skipped so one bad record cannot
    /// stall the curator's sweep.
    pub async fn list(&self) -> Result<Vec<LockEntry>, LockError> {
        let entries = self.store.list(&self.config.locks_collection).await?;
        let mut parsed = Vec::with_capacity(entries.len());
        for (entry_key, record) in entries {
            match serde_json::from_value::<LockRecord>(record.value) {
                Ok(body) => parsed.push(LockEntry {
                    entry_key,
                    record: body,
                    version: record.version,
                }),
                Err(err) => {
                    warn!(entry_key = %entry_key, error = %err, "skipping malformed lock record");
                }
            }
        }
        Ok(parsed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn manager(store: &MemoryStore) -> LockManager {
        LockManager::new(Arc::new(store.clone()), Config::default())
    }

    #[tokio::test]
    async fn acquire_creates_lock_record() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let job = JobId::generate();

        let lock = locks.acquire(&job, "orders", "o1").await.unwrap();
        assert_eq!(lock.record.job_id, job);
        assert!(lock.covers("orders", "o1"));
        assert_eq!(store.record_count("overlock-locks"), 1);
        assert!(store.value_of("overlock-locks", "orders-o1").is_some());
    }

    #[tokio::test]
    async fn second_job_acquire_fails_with_conflict() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let holder = JobId::generate();
        let contender = JobId::generate();

        locks.acquire(&holder, "orders", "o1").await.unwrap();
        let err = locks.acquire(&contender, "orders", "o1").await.unwrap_err();
        match err {
            LockError::CollectionKeyIsLocked {
                collection,
                key,
                holder: seen,
            } => {
                assert_eq!(collection, "orders");
                assert_eq!(key, "o1");
                assert_eq!(seen, holder);
            }
            other => panic!("expected lock conflict, got {other:?}"),
        }
        // The conflict left the store untouched.
        assert_eq!(store.record_count("overlock-locks"), 1);
    }

    #[tokio::test]
    async fn same_job_reacquire_is_idempotent() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let job = JobId::generate();

        let first = locks.acquire(&job, "orders", "o1").await.unwrap();
        let second = locks.acquire(&job, "orders", "o1").await.unwrap();
        assert_eq!(first.lock_ref, second.lock_ref);
        assert_eq!(store.record_count("overlock-locks"), 1);
    }

    /// Simulate a holder releasing between the create-only put and the
    /// follow-up get: the put is rejected as if a record existed, but the
    /// record is gone by the time we look.
    fn vanishing_holder(store: &MemoryStore) {
        store.fail_on(crate::store::FailOn {
            op: crate::store::OpKind::Put,
            collection: "overlock-locks".to_string(),
            key: Some("orders-o1".to_string()),
            error: StoreError::VersionMismatch,
        });
    }

    #[tokio::test]
    async fn acquire_retries_once_after_the_holder_vanishes() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let job = JobId::generate();

        vanishing_holder(&store);

        let lock = locks.acquire(&job, "orders", "o1").await.unwrap();
        assert_eq!(lock.record.job_id, job);
        assert_eq!(store.record_count("overlock-locks"), 1);
    }

    #[tokio::test]
    async fn acquire_gives_up_when_the_holder_keeps_vanishing() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let job = JobId::generate();

        // Both the first attempt and the retry hit the same interleaving.
        vanishing_holder(&store);
        vanishing_holder(&store);

        let err = locks.acquire(&job, "orders", "o1").await.unwrap_err();
        assert!(matches!(err, LockError::Store(StoreError::VersionMismatch)));
        assert_eq!(store.record_count("overlock-locks"), 0);
    }

    #[tokio::test]
    async fn distinct_keys_do_not_conflict() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let a = JobId::generate();
        let b = JobId::generate();

        locks.acquire(&a, "orders", "o1").await.unwrap();
        locks.acquire(&b, "orders", "o2").await.unwrap();
        locks.acquire(&b, "invoices", "o1").await.unwrap();
        assert_eq!(store.record_count("overlock-locks"), 3);
    }

    #[tokio::test]
    async fn release_removes_the_record() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let job = JobId::generate();

        let lock = locks.acquire(&job, "orders", "o1").await.unwrap();
        locks.release(&lock).await.unwrap();
        assert_eq!(store.record_count("overlock-locks"), 0);
    }

    #[tokio::test]
    async fn release_after_reap_is_not_an_error() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let job = JobId::generate();

        let lock = locks.acquire(&job, "orders", "o1").await.unwrap();

        // Simulate the curator force-releasing the lock out from under us.
        use crate::store::Store;
        let current = store.get("overlock-locks", "orders-o1").await.unwrap();
        store
            .delete("overlock-locks", "orders-o1", &current.version)
            .await
            .unwrap();

        locks.release(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn double_release_is_idempotent() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let job = JobId::generate();

        let lock = locks.acquire(&job, "orders", "o1").await.unwrap();
        locks.release(&lock).await.unwrap();
        locks.release(&lock).await.unwrap();
    }

    #[tokio::test]
    async fn release_surfaces_backend_faults() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let job = JobId::generate();

        let lock = locks.acquire(&job, "orders", "o1").await.unwrap();
        store.fail_on(crate::store::FailOn::delete("overlock-locks", "orders-o1"));

        let err = locks.release(&lock).await.unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
    }

    #[tokio::test]
    async fn list_returns_every_entry_with_versions() {
        let store = MemoryStore::new();
        let locks = manager(&store);
        let job = JobId::generate();

        locks.acquire(&job, "orders", "o1").await.unwrap();
        locks.acquire(&job, "orders", "o2").await.unwrap();

        let entries = locks.list().await.unwrap();
        assert_eq!(entries.len(), 2);
        assert!(entries.iter().all(|e| e.record.job_id == job));
        assert_eq!(entries[0].entry_key, "orders-o1");
        assert_eq!(entries[1].entry_key, "orders-o2");
    }

    #[tokio::test]
    async fn entry_key_joins_collection_and_key() {
        assert_eq!(lock_entry_key("orders", "o1"), "orders-o1");
    }
}
