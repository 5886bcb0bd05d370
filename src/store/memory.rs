//! store::memory
//!
//! In-memory store implementation for deterministic testing.
//!
//! # Design
//!
//! `MemoryStore` implements the [`Store`] trait over per-collection hash maps
//! guarded by a single mutex, with a monotonic counter standing in for the
//! remote store's version tokens. It also supports configuring failure
//! scenarios and records every operation for verification.
//!
//! # Example
//!
//! ```
//! use overlock::store::{MemoryStore, PutCondition, Store, StoreError};
//!
//! # tokio_test::block_on(async {
//! let store = MemoryStore::new();
//!
//! let v1 = store
//!     .put("orders", "o1", &serde_json::json!({"qty": 1}), PutCondition::IfAbsent)
//!     .await
//!     .unwrap();
//!
//! // A second create-only put is rejected.
//! let err = store
//!     .put("orders", "o1", &serde_json::json!({"qty": 2}), PutCondition::IfAbsent)
//!     .await
//!     .unwrap_err();
//! assert_eq!(err, StoreError::VersionMismatch);
//!
//! let record = store.get("orders", "o1").await.unwrap();
//! assert_eq!(record.version, v1);
//! # });
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use super::traits::{PutCondition, Record, Ref, Store, StoreError};

/// In-memory store for testing.
///
/// Thread-safe via internal `Arc<Mutex<...>>` wrapping; clones share state,
/// mirroring many clients talking to one remote store.
#[derive(Debug, Clone, Default)]
pub struct MemoryStore {
    /// Internal state shared across clones.
    inner: Arc<Mutex<MemoryStoreInner>>,
}

/// Internal mutable state.
#[derive(Debug, Default)]
struct MemoryStoreInner {
    /// Records by collection, then key.
    collections: HashMap<String, HashMap<String, Record>>,
    /// Source of version tokens.
    next_version: u64,
    /// Configured failures (checked before touching state).
    failures: Vec<FailOn>,
    /// Recorded operations for verification.
    operations: Vec<StoreOp>,
}

impl MemoryStoreInner {
    fn mint_version(&mut self) -> Ref {
        self.next_version += 1;
        Ref::new(format!("v{:08}", self.next_version))
    }

    /// Pop the first matching configured failure, if any.
    fn take_failure(&mut self, op: &StoreOp) -> Option<StoreError> {
        let index = self.failures.iter().position(|f| f.matches(op))?;
        Some(self.failures.remove(index).error)
    }
}

/// A recorded store operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreOp {
    Get { collection: String, key: String },
    Put { collection: String, key: String },
    Delete { collection: String, key: String },
    List { collection: String },
}

impl StoreOp {
    fn names(&self) -> (&str, Option<&str>) {
        match self {
            StoreOp::Get { collection, key }
            | StoreOp::Put { collection, key }
            | StoreOp::Delete { collection, key } => (collection, Some(key)),
            StoreOp::List { collection } => (collection, None),
        }
    }

    /// Whether this operation mutates store state.
    pub fn is_mutation(&self) -> bool {
        matches!(self, StoreOp::Put { .. } | StoreOp::Delete { .. })
    }
}

/// Kind of operation a configured failure applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    Get,
    Put,
    Delete,
    List,
}

/// Configuration for an operation that should fail.
///
/// Each configured failure fires once, on the first matching operation, then
/// is consumed.
#[derive(Debug, Clone)]
pub struct FailOn {
    /// Which operation kind to fail.
    pub op: OpKind,
    /// Collection the failure applies to.
    pub collection: String,
    /// Key the failure applies to; `None` matches any key.
    pub key: Option<String>,
    /// The error to return.
    pub error: StoreError,
}

impl FailOn {
    /// Fail the next matching put with a backend fault.
    pub fn put(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            op: OpKind::Put,
            collection: collection.into(),
            key: Some(key.into()),
            error: StoreError::Backend("injected put failure".to_string()),
        }
    }

    /// Fail the next matching delete with a backend fault.
    pub fn delete(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            op: OpKind::Delete,
            collection: collection.into(),
            key: Some(key.into()),
            error: StoreError::Backend("injected delete failure".to_string()),
        }
    }

    /// Fail the next matching get with a backend fault.
    pub fn get(collection: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            op: OpKind::Get,
            collection: collection.into(),
            key: Some(key.into()),
            error: StoreError::Backend("injected get failure".to_string()),
        }
    }

    fn matches(&self, op: &StoreOp) -> bool {
        let kind_matches = matches!(
            (self.op, op),
            (OpKind::Get, StoreOp::Get { .. })
                | (OpKind::Put, StoreOp::Put { .. })
                | (OpKind::Delete, StoreOp::Delete { .. })
                | (OpKind::List, StoreOp::List { .. })
        );
        if !kind_matches {
            return false;
        }
        let (collection, key) = op.names();
        collection == self.collection && (self.key.is_none() || self.key.as_deref() == key)
    }
}

impl MemoryStore {
    /// Create a new empty store.
    pub fn new() -> Self {
        Self::default()
    }

    /// Configure a one-shot failure for the next matching operation.
    pub fn fail_on(&self, failure: FailOn) {
        self.inner.lock().unwrap().failures.push(failure);
    }

    /// Remove any configured failures.
    pub fn clear_failures(&self) {
        self.inner.lock().unwrap().failures.clear();
    }

    /// Read a stored value directly, bypassing the trait (test helper).
    pub fn value_of(&self, collection: &str, key: &str) -> Option<Value> {
        let inner = self.inner.lock().unwrap();
        inner
            .collections
            .get(collection)
            .and_then(|records| records.get(key))
            .map(|record| record.value.clone())
    }

    /// Number of records in a collection (test helper).
    pub fn record_count(&self, collection: &str) -> usize {
        let inner = self.inner.lock().unwrap();
        inner
            .collections
            .get(collection)
            .map(|records| records.len())
            .unwrap_or(0)
    }

    /// All operations performed so far (test helper).
    pub fn operations(&self) -> Vec<StoreOp> {
        self.inner.lock().unwrap().operations.clone()
    }

    /// Number of mutating operations performed so far (test helper).
    pub fn mutation_count(&self) -> usize {
        self.inner
            .lock()
            .unwrap()
            .operations
            .iter()
            .filter(|op| op.is_mutation())
            .count()
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn get(&self, collection: &str, key: &str) -> Result<Record, StoreError> {
        let op = StoreOp::Get {
            collection: collection.to_string(),
            key: key.to_string(),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.operations.push(op.clone());
        if let Some(error) = inner.take_failure(&op) {
            return Err(error);
        }
        inner
            .collections
            .get(collection)
            .and_then(|records| records.get(key))
            .cloned()
            .ok_or(StoreError::NotFound)
    }

    async fn put(
        &self,
        collection: &str,
        key: &str,
        value: &Value,
        condition: PutCondition,
    ) -> Result<Ref, StoreError> {
        let op = StoreOp::Put {
            collection: collection.to_string(),
            key: key.to_string(),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.operations.push(op.clone());
        if let Some(error) = inner.take_failure(&op) {
            return Err(error);
        }

        let current = inner
            .collections
            .get(collection)
            .and_then(|records| records.get(key))
            .map(|record| record.version.clone());
        match (&condition, &current) {
            (PutCondition::Any, _) => {}
            (PutCondition::IfAbsent, None) => {}
            (PutCondition::IfAbsent, Some(_)) => return Err(StoreError::VersionMismatch),
            (PutCondition::IfMatch(expected), Some(actual)) if expected == actual => {}
            (PutCondition::IfMatch(_), _) => return Err(StoreError::VersionMismatch),
        }

        let version = inner.mint_version();
        inner
            .collections
            .entry(collection.to_string())
            .or_default()
            .insert(
                key.to_string(),
                Record {
                    value: value.clone(),
                    version: version.clone(),
                },
            );
        Ok(version)
    }

    async fn delete(&self, collection: &str, key: &str, expected: &Ref) -> Result<(), StoreError> {
        let op = StoreOp::Delete {
            collection: collection.to_string(),
            key: key.to_string(),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.operations.push(op.clone());
        if let Some(error) = inner.take_failure(&op) {
            return Err(error);
        }

        let records = inner
            .collections
            .get_mut(collection)
            .ok_or(StoreError::NotFound)?;
        match records.get(key) {
            None => return Err(StoreError::NotFound),
            Some(record) if &record.version != expected => {
                return Err(StoreError::VersionMismatch)
            }
            Some(_) => {}
        }
        records.remove(key);
        Ok(())
    }

    async fn list(&self, collection: &str) -> Result<Vec<(String, Record)>, StoreError> {
        let op = StoreOp::List {
            collection: collection.to_string(),
        };
        let mut inner = self.inner.lock().unwrap();
        inner.operations.push(op.clone());
        if let Some(error) = inner.take_failure(&op) {
            return Err(error);
        }
        let mut entries: Vec<(String, Record)> = inner
            .collections
            .get(collection)
            .map(|records| {
                records
                    .iter()
                    .map(|(key, record)| (key.clone(), record.clone()))
                    .collect()
            })
            .unwrap_or_default();
        // Deterministic order for tests.
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(entries)
    }
}
