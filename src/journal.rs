//! journal
//!
//! Before/after value logging and the rollback engine.
//!
//! # Journaling
//!
//! A job appends a [`JournalItem`] immediately after each conditional write
//! it performs, capturing the value read just before the write as
//! `original_value` (`None` if the record did not previously exist). The
//! journal is embedded in the job record, so a crashed job's journal survives
//! in the store for the curator to replay.
//!
//! # Rollback
//!
//! Items are processed in reverse append order (each item addresses a
//! distinct key within one job, so order only matters for determinism). For
//! each item:
//!
//! 1. If `original_value == new_value` there is nothing to undo - skip.
//! 2. Re-read the record. Absent means already rolled back or already
//!    deleted - skip.
//! 3. If the current value differs from the journaled `new_value`, a third
//!    party has modified the record since the job wrote it - skip. Blindly
//!    overwriting would destroy their update ("changed records are not rolled
//!    back").
//! 4. Otherwise conditionally restore `original_value` (or conditionally
//!    delete when the job created the record), matching the version token
//!    from step 2. A version mismatch here means another writer raced in
//!    after the re-read; the precondition already re-validated intent, so the
//!    mismatch is swallowed.
//!
//! Only genuine store faults escape, wrapped so callers can distinguish
//! "rollback had nothing to do" from "rollback itself failed".

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::store::{PutCondition, Store, StoreError};

/// Errors from the rollback engine.
#[derive(Debug, Error)]
pub enum RollbackError {
    /// The store failed while undoing one journal item.
    #[error("rollback store error for {collection}/{key}: {source}")]
    Store {
        /// Collection of the item being undone.
        collection: String,
        /// Key of the item being undone.
        key: String,
        /// The underlying store fault.
        #[source]
        source: StoreError,
    },
}

/// One write performed by a job: the before and after values for a single
/// (collection, key) pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JournalItem {
    /// When the write was journaled.
    pub timestamp: DateTime<Utc>,
    /// Collection of the written record.
    pub collection: String,
    /// Key of the written record.
    pub key: String,
    /// Value before the write; `None` means the write created the record
    /// (rollback deletes it).
    pub original_value: Option<Value>,
    /// Value the job wrote.
    pub new_value: Value,
}

impl JournalItem {
    /// Record a write that just committed.
    pub fn record(
        collection: impl Into<String>,
        key: impl Into<String>,
        original_value: Option<Value>,
        new_value: Value,
    ) -> Self {
        Self {
            timestamp: Utc::now(),
            collection: collection.into(),
            key: key.into(),
            original_value,
            new_value,
        }
    }
}

/// What the rollback engine did, for logging and diagnostics.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RollbackReport {
    /// Items whose original value was restored.
    pub restored: usize,
    /// Items whose created record was deleted.
    pub deleted: usize,
    /// Items skipped (absent, externally modified, raced, or no-op).
    pub skipped: usize,
}

impl RollbackReport {
    /// Total items examined.
    pub fn total(&self) -> usize {
        self.restored + self.deleted + self.skipped
    }
}

/// Undo a journal's writes against the store.
///
/// Safe to run concurrently with other writers: every undo is a conditional
/// write, and a lost race is a skip, never an error.
///
/// # Errors
///
/// [`RollbackError::Store`] if the store faults while undoing an item. Items
/// already processed stay undone; the failing item and the rest are left as
/// they are.
pub async fn roll_back(
    store: &dyn Store,
    journal: &[JournalItem],
) -> Result<RollbackReport, RollbackError> {
    let mut report = RollbackReport::default();
    for item in journal.iter().rev() {
        match roll_back_item(store, item).await? {
            ItemOutcome::Restored => report.restored += 1,
            ItemOutcome::Deleted => report.deleted += 1,
            ItemOutcome::Skipped => report.skipped += 1,
        }
    }
    debug!(
        restored = report.restored,
        deleted = report.deleted,
        skipped = report.skipped,
        "journal rolled back"
    );
    Ok(report)
}

enum ItemOutcome {
    Restored,
    Deleted,
    Skipped,
}

async fn roll_back_item(
    store: &dyn Store,
    item: &JournalItem,
) -> Result<ItemOutcome, RollbackError> {
    let wrap = |source: StoreError| RollbackError::Store {
        collection: item.collection.clone(),
        key: item.key.clone(),
        source,
    };

    // A write that changed nothing needs no undo.
    if item.original_value.as_ref() == Some(&item.new_value) {
        return Ok(ItemOutcome::Skipped);
    }

    let current = match store.get(&item.collection, &item.key).await {
        Ok(record) => record,
        // Already deleted - nothing to undo.
        Err(StoreError::NotFound) => return Ok(ItemOutcome::Skipped),
        Err(other) => return Err(wrap(other)),
    };

    // A third party has modified the record since the job wrote it; their
    // update wins.
    if current.value != item.new_value {
        debug!(
            collection = %item.collection,
            key = %item.key,
            "skipping rollback of externally modified record"
        );
        return Ok(ItemOutcome::Skipped);
    }

    match &item.original_value {
        Some(original) => {
            match store
                .put(
                    &item.collection,
                    &item.key,
                    original,
                    PutCondition::IfMatch(current.version),
                )
                .await
            {
                Ok(_) => Ok(ItemOutcome::Restored),
                // Another writer raced in between the read and the put.
                Err(StoreError::VersionMismatch) => Ok(ItemOutcome::Skipped),
                Err(other) => Err(wrap(other)),
            }
        }
        // No original value: the job created the record, so undo is delete.
        None => match store
            .delete(&item.collection, &item.key, &current.version)
            .await
        {
            Ok(()) => Ok(ItemOutcome::Deleted),
            Err(StoreError::NotFound) | Err(StoreError::VersionMismatch) => {
                Ok(ItemOutcome::Skipped)
            }
            Err(other) => Err(wrap(other)),
        },
    }
}
