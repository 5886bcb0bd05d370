//! curator
//!
//! The leader-elected background reaper for abandoned jobs and orphaned
//! locks.
//!
//! # Leader election
//!
//! Any number of curator instances may run concurrently, but at most one is
//! ever active. Leadership is a single heartbeat record at a well-known key
//! in the curators collection. Every `heartbeat_interval` a candidate or
//! active instance attempts a conditional write of `{curator_id, now}` that
//! only succeeds when the record is absent, already names this instance, or
//! has a heartbeat older than `heartbeat_timeout`. A version mismatch means
//! another instance won the race; the loser deactivates immediately and
//! waits `inactivity_delay` before trying again, avoiding thundering-herd
//! contention between near-simultaneous candidates.
//!
//! The loop is an explicit state machine over those three tunables:
//!
//! ```text
//! Candidate --heartbeat won--> Active --heartbeat lost--> BackingOff
//!     ^                          |                            |
//!     +-----inactivity delay-----+----------------------------+
//! ```
//!
//! Timers run through `tokio::select!` against a shutdown watch channel, so
//! cancellation is cooperative and there are no busy loops.
//!
//! # Reaping
//!
//! While active, each heartbeat iteration also sweeps (keeping the sweep
//! inside the leadership window):
//!
//! - in-progress jobs older than `max_job_time`: roll back their journal,
//!   release their locks, and conditionally mark them timed-out against the
//!   version read at enumeration - a mismatch means the job raced us and is
//!   skipped;
//! - locks whose owning job is terminal, or missing with the lock itself
//!   older than `max_job_time`: force-release them.
//!
//! Every reaper mutation uses the same conditional-write discipline as the
//! job and rollback paths, so a race between the curator and a still-alive
//! job resolves safely.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::core::config::{Config, ConfigError, ACTIVE_CURATOR_KEY};
use crate::core::types::{CuratorId, JobId};
use crate::job::{JobRecord, JobStatus};
use crate::journal::{self, RollbackError};
use crate::lock::{LockError, LockManager};
use crate::store::{PutCondition, Store, StoreError};

/// Errors from curator operations.
#[derive(Debug, Error)]
pub enum CuratorError {
    /// The configuration is invalid.
    #[error(transparent)]
    Config(#[from] ConfigError),

    /// A reaped job's journal could not be rolled back.
    #[error("reaper rollback failed: {0}")]
    Rollback(#[from] RollbackError),

    /// A lock operation failed during the sweep.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The store failed.
    #[error("store error: {0}")]
    Store(#[from] StoreError),

    /// A record could not be encoded.
    #[error("encoding error: {0}")]
    Json(#[from] serde_json::Error),
}

/// The singleton active-curator record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ActiveCuratorDetails {
    /// The instance currently holding leadership.
    pub curator_id: CuratorId,
    /// Last heartbeat time; leadership expires `heartbeat_timeout` after it.
    pub timestamp: DateTime<Utc>,
}

/// Election loop state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ElectionState {
    /// Attempting to win (or retain) the heartbeat record.
    Candidate,
    /// Holding leadership; refreshing every heartbeat interval.
    Active,
    /// Lost an attempt; waiting out the inactivity delay.
    BackingOff,
}

/// A curator instance.
///
/// Construct one per process and drive it with [`Curator::run`]; clones of
/// the surrounding `Arc` can observe [`Curator::is_active`].
pub struct Curator {
    store: Arc<dyn Store>,
    config: Config,
    curator_id: CuratorId,
    locks: LockManager,
    active: AtomicBool,
}

impl Curator {
    /// Create a curator instance with a fresh random id.
    pub fn new(store: Arc<dyn Store>, config: Config) -> Self {
        let locks = LockManager::new(store.clone(), config.clone());
        Self {
            store,
            config,
            curator_id: CuratorId::generate(),
            locks,
            active: AtomicBool::new(false),
        }
    }

    /// This instance's identifier.
    pub fn curator_id(&self) -> &CuratorId {
        &self.curator_id
    }

    /// Whether this instance currently believes it holds leadership.
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run the election/reap loop until `shutdown` flips to `true`.
    ///
    /// Sweep failures are logged and do not stop the loop; only an invalid
    /// config aborts up front.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<(), CuratorError> {
        self.config.validate()?;
        let mut state = ElectionState::Candidate;
        info!(curator_id = %self.curator_id, "curator started");

        while !*shutdown.borrow() {
            state = match state {
                ElectionState::Candidate | ElectionState::Active => {
                    match self.try_heartbeat().await {
                        Ok(true) => {
                            if state != ElectionState::Active {
                                info!(curator_id = %self.curator_id, "curator became active");
                            }
                            self.active.store(true, Ordering::SeqCst);
                            if let Err(err) = self.sweep().await {
                                warn!(
                                    curator_id = %self.curator_id,
                                    error = %err,
                                    "reaper sweep failed"
                                );
                            }
                            self.pause(self.config.heartbeat_interval(), &mut shutdown)
                                .await;
                            ElectionState::Active
                        }
                        Ok(false) => {
                            if state == ElectionState::Active {
                                info!(curator_id = %self.curator_id, "curator lost leadership");
                            }
                            self.active.store(false, Ordering::SeqCst);
                            ElectionState::BackingOff
                        }
                        Err(err) => {
                            warn!(
                                curator_id = %self.curator_id,
                                error = %err,
                                "heartbeat attempt failed"
                            );
                            self.active.store(false, Ordering::SeqCst);
                            ElectionState::BackingOff
                        }
                    }
                }
                ElectionState::BackingOff => {
                    self.pause(self.config.inactivity_delay(), &mut shutdown)
                        .await;
                    ElectionState::Candidate
                }
            };
        }

        self.active.store(false, Ordering::SeqCst);
        info!(curator_id = %self.curator_id, "curator stopped");
        Ok(())
    }

    /// Sleep cooperatively: wakes early if shutdown is signalled.
    async fn pause(&self, delay: Duration, shutdown: &mut watch::Receiver<bool>) {
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = shutdown.changed() => {}
        }
    }

    /// Attempt to claim or refresh the active-curator record.
    ///
    /// Returns `Ok(true)` when this instance is active for at least one more
    /// heartbeat interval, `Ok(false)` when another instance holds a live
    /// claim (or won a race for it).
    async fn try_heartbeat(&self) -> Result<bool, CuratorError> {
        let details = ActiveCuratorDetails {
            curator_id: self.curator_id.clone(),
            timestamp: Utc::now(),
        };
        let body = serde_json::to_value(&details)?;

        match self
            .store
            .get(&self.config.curators_collection, ACTIVE_CURATOR_KEY)
            .await
        {
            Err(StoreError::NotFound) => {
                match self
                    .store
                    .put(
                        &self.config.curators_collection,
                        ACTIVE_CURATOR_KEY,
                        &body,
                        PutCondition::IfAbsent,
                    )
                    .await
                {
                    Ok(_) => Ok(true),
                    // Another candidate created it first.
                    Err(StoreError::VersionMismatch) => Ok(false),
                    Err(other) => Err(other.into()),
                }
            }
            Ok(current) => {
                let seizable = match serde_json::from_value::<ActiveCuratorDetails>(current.value)
                {
                    Ok(holder) => {
                        holder.curator_id == self.curator_id
                            || age_exceeds(holder.timestamp, self.config.heartbeat_timeout_ms)
                    }
                    // An undecodable record can never expire on its own;
                    // treat it like an expired claim so the cluster is not
                    // wedged behind it.
                    Err(err) => {
                        warn!(error = %err, "seizing malformed active-curator record");
                        true
                    }
                };
                if !seizable {
                    return Ok(false);
                }
                match self
                    .store
                    .put(
                        &self.config.curators_collection,
                        ACTIVE_CURATOR_KEY,
                        &body,
                        PutCondition::IfMatch(current.version),
                    )
                    .await
                {
                    Ok(_) => Ok(true),
                    // Lost the race to another candidate.
                    Err(StoreError::VersionMismatch) => Ok(false),
                    Err(other) => Err(other.into()),
                }
            }
            Err(other) => Err(other.into()),
        }
    }

    /// One reaper pass: expired jobs first, then orphaned locks.
    async fn sweep(&self) -> Result<(), CuratorError> {
        self.reap_expired_jobs().await?;
        self.reap_orphaned_locks().await?;
        Ok(())
    }

    /// Force in-progress jobs older than the max job time into timed-out,
    /// undoing their journaled writes and releasing their locks.
    async fn reap_expired_jobs(&self) -> Result<(), CuratorError> {
        let entries = self.store.list(&self.config.jobs_collection).await?;
        for (key, record) in entries {
            let version = record.version;
            let job: JobRecord = match serde_json::from_value(record.value) {
                Ok(parsed) => parsed,
                Err(err) => {
                    warn!(key = %key, error = %err, "skipping malformed job record");
                    continue;
                }
            };
            if job.status != JobStatus::InProgress
                || !age_exceeds(job.timestamp, self.config.max_job_time_ms)
            {
                continue;
            }

            info!(job_id = %job.job_id, "reaping timed-out job");
            journal::roll_back(self.store.as_ref(), &job.journal).await?;
            self.release_locks_of(&job.job_id).await?;

            let mut next = job.clone();
            next.status = JobStatus::TimedOut;
            match self
                .store
                .put(
                    &self.config.jobs_collection,
                    &key,
                    &serde_json::to_value(&next)?,
                    PutCondition::IfMatch(version),
                )
                .await
            {
                Ok(_) => {}
                // The job moved on since enumeration - it was alive after
                // all, or another actor finished it. Leave it be.
                Err(StoreError::VersionMismatch) => {
                    debug!(job_id = %job.job_id, "job raced the reaper, skipped");
                }
                Err(other) => return Err(other.into()),
            }
        }
        Ok(())
    }

    /// Release every lock held by the given job.
    async fn release_locks_of(&self, job_id: &JobId) -> Result<(), CuratorError> {
        for entry in self.locks.list().await? {
            if &entry.record.job_id == job_id {
                self.locks
                    .release_entry(&entry.entry_key, &entry.version)
                    .await?;
            }
        }
        Ok(())
    }

    /// Release locks abandoned by jobs that are no longer in progress.
    async fn reap_orphaned_locks(&self) -> Result<(), CuratorError> {
        for entry in self.locks.list().await? {
            let owner_status = match self
                .store
                .get(&self.config.jobs_collection, entry.record.job_id.as_str())
                .await
            {
                Ok(record) => match serde_json::from_value::<JobRecord>(record.value) {
                    Ok(job) => Some(job.status),
                    Err(err) => {
                        warn!(
                            job_id = %entry.record.job_id,
                            error = %err,
                            "skipping lock with malformed owning job"
                        );
                        continue;
                    }
                },
                Err(StoreError::NotFound) => None,
                Err(other) => return Err(other.into()),
            };

            let orphaned = match owner_status {
                // A live job's locks are the job reaper's business.
                Some(JobStatus::InProgress) => false,
                // Terminal job left its lock behind (crash between marking
                // and unlocking).
                Some(_) => true,
                // No job record at all: only reap once the lock is old
                // enough that its owner cannot still be mid-begin.
                None => age_exceeds(entry.record.timestamp, self.config.max_job_time_ms),
            };

            if orphaned {
                info!(
                    entry_key = %entry.entry_key,
                    job_id = %entry.record.job_id,
                    "releasing orphaned lock"
                );
                self.locks
                    .release_entry(&entry.entry_key, &entry.version)
                    .await?;
            }
        }
        Ok(())
    }
}

/// Whether `timestamp` is older than `limit_ms` milliseconds.
fn age_exceeds(timestamp: DateTime<Utc>, limit_ms: u64) -> bool {
    Utc::now().signed_duration_since(timestamp) > chrono::Duration::milliseconds(limit_ms as i64)
}
