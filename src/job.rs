//! job
//!
//! The unit-of-work state machine: lock acquisition, write journaling, and
//! terminal transitions.
//!
//! # State machine
//!
//! ```text
//! begin() -> in-progress -> { completed | rolled-back | failed | timed-out }
//! ```
//!
//! All four right-hand states are terminal and mutually exclusive. Invoking a
//! terminal transition on an already-terminal job fails fast with the
//! matching `JobIs*` error so callers cannot double-apply a transition.
//!
//! # Persistence
//!
//! The job record (status plus the full journal) lives in the jobs
//! collection and is re-persisted after every write, using the version token
//! from the previous persist. That conditional write is how a job discovers
//! it has been claimed by the curator: a version mismatch triggers a re-read,
//! and the observed terminal status (typically timed-out) is raised as the
//! corresponding `JobIs*` error.
//!
//! # Example
//!
//! ```ignore
//! let mut job = Job::begin(store, config).await?;
//! match job.write("orders", "o1", json!({"status": "pending"})).await {
//!     Ok(_) => job.complete().await?,
//!     Err(err) => return Err(job.roll_back_caused_by(err.into()).await.into()),
//! }
//! ```

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tracing::debug;

use crate::core::config::{Config, ConfigError};
use crate::core::types::JobId;
use crate::journal::{self, JournalItem, RollbackError};
use crate::lock::{Lock, LockError, LockManager};
use crate::store::{PutCondition, Ref, Store, StoreError};

/// Errors from job operations.
#[derive(Debug, Error)]
pub enum JobError {
    /// The job already completed; no further transitions are possible.
    #[error("job {job_id} is already completed")]
    JobIsCompleted {
        /// The terminal job.
        job_id: JobId,
    },

    /// The job was already rolled back.
    #[error("job {job_id} is already rolled back")]
    JobIsRolledBack {
        /// The terminal job.
        job_id: JobId,
    },

    /// The job was already marked failed.
    #[error("job {job_id} is already failed")]
    JobIsFailed {
        /// The terminal job.
        job_id: JobId,
    },

    /// The job was timed out (usually by the curator).
    #[error("job {job_id} is timed out")]
    JobIsTimedOut {
        /// The terminal job.
        job_id: JobId,
    },

    /// A write's target (collection, key) is locked by a different job.
    #[error(transparent)]
    Locked(#[from] LockError),

    /// The store failed while finalizing the job or releasing its locks;
    /// locks may remain held pending curator intervention.
    #[error("failed to complete job {job_id}: {source}")]
    FailedToComplete {
        /// The job being finalized.
        job_id: JobId,
        /// The underlying store fault.
        #[source]
        source: StoreError,
    },

    /// Rollback itself failed (distinct from benign precondition-mismatch
    /// skips, which are absorbed).
    #[error("failed to roll back job {job_id}: {source}")]
    FailedToRollBack {
        /// The job being rolled back.
        job_id: JobId,
        /// The underlying rollback fault.
        #[source]
        source: RollbackError,
    },

    /// The job was rolled back because an application-level error occurred;
    /// the original error is preserved.
    #[error("job {job_id} rolled back after application error: {cause}")]
    RollbackCausedByException {
        /// The rolled-back job.
        job_id: JobId,
        /// The application error that triggered the rollback.
        cause: anyhow::Error,
    },

    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// The store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A record could not be encoded or decoded.
    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Lifecycle status of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobStatus {
    /// The job is active and may write.
    InProgress,
    /// The job finished; its writes stand and its journal is discarded.
    Completed,
    /// The job's writes were undone.
    RolledBack,
    /// The job was abandoned with its writes left standing.
    Failed,
    /// The curator reaped the job after it exceeded the max job time.
    TimedOut,
}

impl JobStatus {
    /// Whether this status is terminal (immutable once set).
    pub fn is_terminal(&self) -> bool {
        !matches!(self, JobStatus::InProgress)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::InProgress => "in-progress",
            JobStatus::Completed => "completed",
            JobStatus::RolledBack => "rolled-back",
            JobStatus::Failed => "failed",
            JobStatus::TimedOut => "timed-out",
        };
        write!(f, "{}", s)
    }
}

/// The persisted body of a job record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobRecord {
    /// The job's identifier (also its key in the jobs collection).
    pub job_id: JobId,
    /// Start time; the curator computes staleness from this.
    pub timestamp: DateTime<Utc>,
    /// Current lifecycle status.
    pub status: JobStatus,
    /// Ordered before/after log of every write the job performed.
    pub journal: Vec<JournalItem>,
}

impl JobRecord {
    /// A fresh in-progress record.
    pub fn new(job_id: JobId) -> Self {
        Self {
            job_id,
            timestamp: Utc::now(),
            status: JobStatus::InProgress,
            journal: Vec::new(),
        }
    }
}

/// A unit of work: orchestrates lock acquisition, journaled writes, and a
/// single terminal transition.
pub struct Job {
    store: Arc<dyn Store>,
    config: Config,
    locks: LockManager,
    held: Vec<Lock>,
    record: JobRecord,
    record_ref: Ref,
}

impl std::fmt::Debug for Job {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Job")
            .field("config", &self.config)
            .field("held", &self.held)
            .field("record", &self.record)
            .field("record_ref", &self.record_ref)
            .finish_non_exhaustive()
    }
}

impl Job {
    /// Start a new job: creates its record (status in-progress) in the jobs
    /// collection.
    ///
    /// # Errors
    ///
    /// - [`JobError::Config`] if the config is invalid
    /// - [`JobError::Store`] if the record cannot be created
    pub async fn begin(store: Arc<dyn Store>, config: Config) -> Result<Self, JobError> {
        config.validate()?;
        let record = JobRecord::new(JobId::generate());
        let body = serde_json::to_value(&record)?;
        let record_ref = store
            .put(
                &config.jobs_collection,
                record.job_id.as_str(),
                &body,
                PutCondition::IfAbsent,
            )
            .await?;
        debug!(job_id = %record.job_id, "job started");
        let locks = LockManager::new(store.clone(), config.clone());
        Ok(Self {
            store,
            config,
            locks,
            held: Vec::new(),
            record,
            record_ref,
        })
    }

    /// The job's identifier.
    pub fn job_id(&self) -> &JobId {
        &self.record.job_id
    }

    /// The job's current (locally known) status.
    pub fn status(&self) -> JobStatus {
        self.record.status
    }

    /// The journal accumulated so far.
    pub fn journal(&self) -> &[JournalItem] {
        &self.record.journal
    }

    /// The locks this job currently holds.
    pub fn held_locks(&self) -> &[Lock] {
        &self.held
    }

    /// Write a value to (collection, key) under this job.
    ///
    /// Acquires the lock for the pair first (idempotent if already held); a
    /// conflict propagates without mutating anything. On success the write is
    /// journaled with the value read just beforehand, and the job record is
    /// re-persisted so the journal survives a crash.
    ///
    /// # Errors
    ///
    /// - [`JobError::Locked`] if another job holds the lock
    /// - `JobIs*` if the job is (or has just been discovered to be) terminal
    /// - [`JobError::Store`] for any backing-store fault
    pub async fn write(
        &mut self,
        collection: &str,
        key: &str,
        new_value: Value,
    ) -> Result<Ref, JobError> {
        self.ensure_in_progress()?;

        if !self.held.iter().any(|lock| lock.covers(collection, key)) {
            let lock = self
                .locks
                .acquire(&self.record.job_id, collection, key)
                .await?;
            self.held.push(lock);
        }

        // Read the pre-image for the journal; absence means this write
        // creates the record.
        let (original_value, condition) = match self.store.get(collection, key).await {
            Ok(current) => (Some(current.value), PutCondition::IfMatch(current.version)),
            Err(StoreError::NotFound) => (None, PutCondition::IfAbsent),
            Err(other) => return Err(other.into()),
        };

        let new_ref = self
            .store
            .put(collection, key, &new_value, condition)
            .await?;

        // Journal only writes that actually committed.
        self.record.journal.push(JournalItem::record(
            collection,
            key,
            original_value,
            new_value,
        ));
        self.save_record().await?;
        Ok(new_ref)
    }

    /// Mark the job completed, discard its journal, and release its locks.
    ///
    /// # Errors
    ///
    /// - `JobIs*` if the job is already terminal
    /// - [`JobError::FailedToComplete`] if the store faults while finalizing
    ///   or unlocking (locks may remain held for the curator)
    pub async fn complete(&mut self) -> Result<(), JobError> {
        self.ensure_in_progress()?;
        let job_id = self.record.job_id.clone();
        self.persist_status(JobStatus::Completed, true)
            .await
            .map_err(|e| match e {
                JobError::Store(source) => JobError::FailedToComplete {
                    job_id: job_id.clone(),
                    source,
                },
                other => other,
            })?;
        self.release_all_locks()
            .await
            .map_err(|(_, source)| JobError::FailedToComplete { job_id, source })?;
        debug!(job_id = %self.record.job_id, "job completed");
        Ok(())
    }

    /// Undo every journaled write, release the job's locks, and mark the job
    /// rolled back.
    ///
    /// Records modified by third parties since the job wrote them are left
    /// untouched (see [`crate::journal`]).
    ///
    /// # Errors
    ///
    /// - `JobIs*` if the job is already terminal
    /// - [`JobError::FailedToRollBack`] if the store faults mid-rollback
    pub async fn roll_back(&mut self) -> Result<(), JobError> {
        self.ensure_in_progress()?;
        let job_id = self.record.job_id.clone();

        journal::roll_back(self.store.as_ref(), &self.record.journal)
            .await
            .map_err(|source| JobError::FailedToRollBack {
                job_id: job_id.clone(),
                source,
            })?;

        self.release_all_locks()
            .await
            .map_err(|(lock, source)| JobError::FailedToRollBack {
                job_id: job_id.clone(),
                source: RollbackError::Store {
                    collection: lock.record.collection,
                    key: lock.record.key,
                    source,
                },
            })?;

        self.persist_status(JobStatus::RolledBack, false)
            .await
            .map_err(|e| match e {
                JobError::Store(source) => JobError::FailedToRollBack {
                    job_id: job_id.clone(),
                    source: RollbackError::Store {
                        collection: self.config.jobs_collection.clone(),
                        key: job_id.to_string(),
                        source,
                    },
                },
                other => other,
            })?;
        debug!(job_id = %self.record.job_id, "job rolled back");
        Ok(())
    }

    /// Roll back because an application-level error occurred, preserving the
    /// original error.
    ///
    /// Returns the error the caller should propagate:
    /// [`JobError::RollbackCausedByException`] wrapping `cause` when the
    /// rollback succeeded, or the rollback's own failure.
    pub async fn roll_back_caused_by(&mut self, cause: anyhow::Error) -> JobError {
        match self.roll_back().await {
            Ok(()) => JobError::RollbackCausedByException {
                job_id: self.record.job_id.clone(),
                cause,
            },
            Err(err) => err,
        }
    }

    /// Mark the job failed without rolling back - journaled writes stand -
    /// then release its locks.
    ///
    /// # Errors
    ///
    /// - `JobIs*` if the job is already terminal
    /// - [`JobError::Store`] surfaced directly for store faults
    pub async fn fail(&mut self) -> Result<(), JobError> {
        self.ensure_in_progress()?;
        self.persist_status(JobStatus::Failed, false).await?;
        self.release_all_locks()
            .await
            .map_err(|(_, source)| JobError::Store(source))?;
        debug!(job_id = %self.record.job_id, "job failed");
        Ok(())
    }

    /// Fail fast if the job is already terminal.
    fn ensure_in_progress(&self) -> Result<(), JobError> {
        let job_id = self.record.job_id.clone();
        match self.record.status {
            JobStatus::InProgress => Ok(()),
            JobStatus::Completed => Err(JobError::JobIsCompleted { job_id }),
            JobStatus::RolledBack => Err(JobError::JobIsRolledBack { job_id }),
            JobStatus::Failed => Err(JobError::JobIsFailed { job_id }),
            JobStatus::TimedOut => Err(JobError::JobIsTimedOut { job_id }),
        }
    }

    /// Persist the current record (journal included) with the version token
    /// from the previous persist.
    async fn save_record(&mut self) -> Result<(), JobError> {
        let body = serde_json::to_value(&self.record)?;
        match self
            .store
            .put(
                &self.config.jobs_collection,
                self.record.job_id.as_str(),
                &body,
                PutCondition::IfMatch(self.record_ref.clone()),
            )
            .await
        {
            Ok(new_ref) => {
                self.record_ref = new_ref;
                Ok(())
            }
            // Someone else moved our record - almost certainly the curator
            // claiming the job. Find out what it became.
            Err(StoreError::VersionMismatch) => Err(self.refresh_terminal().await),
            Err(other) => Err(other.into()),
        }
    }

    /// Persist a terminal status transition.
    async fn persist_status(
        &mut self,
        status: JobStatus,
        discard_journal: bool,
    ) -> Result<(), JobError> {
        let mut next = self.record.clone();
        next.status = status;
        if discard_journal {
            next.journal.clear();
        }
        let body = serde_json::to_value(&next)?;
        match self
            .store
            .put(
                &self.config.jobs_collection,
                next.job_id.as_str(),
                &body,
                PutCondition::IfMatch(self.record_ref.clone()),
            )
            .await
        {
            Ok(new_ref) => {
                self.record = next;
                self.record_ref = new_ref;
                Ok(())
            }
            Err(StoreError::VersionMismatch) => Err(self.refresh_terminal().await),
            Err(other) => Err(other.into()),
        }
    }

    /// Re-read the job record after a version mismatch and report the status
    /// someone else moved it to.
    async fn refresh_terminal(&mut self) -> JobError {
        let job_id = self.record.job_id.clone();
        match self
            .store
            .get(&self.config.jobs_collection, job_id.as_str())
            .await
        {
            Ok(current) => match serde_json::from_value::<JobRecord>(current.value) {
                Ok(observed) => {
                    self.record.status = observed.status;
                    self.record_ref = current.version;
                    match observed.status {
                        JobStatus::Completed => JobError::JobIsCompleted { job_id },
                        JobStatus::RolledBack => JobError::JobIsRolledBack { job_id },
                        JobStatus::Failed => JobError::JobIsFailed { job_id },
                        JobStatus::TimedOut => JobError::JobIsTimedOut { job_id },
                        // Rewritten but still in progress: surface the raw
                        // conflict rather than guessing.
                        JobStatus::InProgress => JobError::Store(StoreError::VersionMismatch),
                    }
                }
                Err(err) => JobError::Json(err),
            },
            Err(err) => JobError::Store(err),
        }
    }

    /// Release every held lock, stopping at the first store fault (the
    /// failing lock stays held for the curator).
    async fn release_all_locks(&mut self) -> Result<(), (Lock, StoreError)> {
        while let Some(lock) = self.held.pop() {
            if let Err(source) = self.locks.release(&lock).await {
                let failed = lock.clone();
                self.held.push(lock);
                return Err((failed, source));
            }
        }
        Ok(())
    }
}
