//! store::traits
//!
//! Store trait definition for the backing key-value document store.
//!
//! # Design
//!
//! The `Store` trait is async because every store call is network I/O. The
//! trait is object-safe so callers hold an `Arc<dyn Store>` and tests swap in
//! [`crate::store::MemoryStore`].
//!
//! Conditional semantics are the whole contract: every write or delete names
//! the version token ([`Ref`]) it expects, and the store rejects the call
//! with [`StoreError::VersionMismatch`] when the record has moved on. That
//! rejection is the only concurrency-safety mechanism overlock relies on.
//!
//! # Error model
//!
//! Absence and staleness are typed variants, never sentinel values or
//! string-matched messages. Call sites that treat them as benign races do so
//! in a visible `match` branch:
//!
//! ```ignore
//! match store.delete("overlock-locks", "orders-o1", &lock_ref).await {
//!     Ok(()) => {}
//!     // Already released or reaped - nothing left to do.
//!     Err(StoreError::NotFound) | Err(StoreError::VersionMismatch) => {}
//!     Err(other) => return Err(other.into()),
//! }
//! ```

use std::fmt;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// Errors from store operations.
///
/// `NotFound` and `VersionMismatch` are expected outcomes of optimistic
/// concurrency, not faults; only `Backend` represents a genuine failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// The record does not exist.
    #[error("record not found")]
    NotFound,

    /// The supplied version token no longer matches the stored record, or a
    /// create-only put found an existing record.
    #[error("version precondition failed")]
    VersionMismatch,

    /// The store itself failed (network fault, server error, malformed
    /// response). The message is diagnostic only.
    #[error("store backend error: {0}")]
    Backend(String),
}

/// An opaque version token returned by the store on every read and write.
///
/// A `Ref` must accompany every conditional write or delete so the store can
/// detect concurrent modification. Tokens are compared for equality only;
/// their contents carry no meaning to overlock.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Ref(String);

impl Ref {
    /// Wrap a raw token from the store adapter.
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    /// Get the raw token.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Ref {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A stored value together with its current version token.
#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    /// The stored JSON document.
    pub value: Value,
    /// The version token current as of this read.
    pub version: Ref,
}

/// Precondition attached to a put.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutCondition {
    /// Succeed only if the stored version matches.
    IfMatch(Ref),
    /// Succeed only if no record exists (create-only).
    IfAbsent,
    /// Unconditional overwrite.
    Any,
}

/// The backing key-value document store.
///
/// Implementations adapt a concrete store API (HTTP or otherwise) to these
/// four operations and map its precondition-failure signal to
/// [`StoreError::VersionMismatch`] and its absence signal to
/// [`StoreError::NotFound`]. No other translation happens above this seam.
#[async_trait]
pub trait Store: Send + Sync {
    /// Read a record and its current version token.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if no record exists at (collection, key)
    async fn get(&self, collection: &str, key: &str) -> Result<Record, StoreError>;

    /// Write a record subject to `condition`, returning the new version.
    ///
    /// # Errors
    ///
    /// - [`StoreError::VersionMismatch`] if the condition does not hold
    async fn put(
        &self,
        collection: &str,
        key: &str,
        value: &Value,
        condition: PutCondition,
    ) -> Result<Ref, StoreError>;

    /// Delete a record if its version still matches `expected`.
    ///
    /// # Errors
    ///
    /// - [`StoreError::NotFound`] if no record exists
    /// - [`StoreError::VersionMismatch`] if the version has moved on
    async fn delete(&self, collection: &str, key: &str, expected: &Ref) -> Result<(), StoreError>;

    /// Enumerate every record in a collection.
    ///
    /// Used by the curator to sweep jobs and locks. An unknown collection
    /// enumerates as empty rather than erroring.
    async fn list(&self, collection: &str) -> Result<Vec<(String, Record)>, StoreError>;
}
