//! Overlock - client-side transactions for optimistic-concurrency stores
//!
//! Overlock layers multi-key "all-or-nothing" writes, mutual exclusion, and
//! crash recovery on top of a remote key-value document store that offers
//! only per-key conditional read/write/delete via an opaque version token.
//!
//! # Architecture
//!
//! The crate is organized leaf-first:
//!
//! - [`core`] - Identifiers, timestamps, and configuration
//! - [`store`] - The backing-store trait seam and the in-memory test store
//! - [`lock`] - Per-(collection, key) exclusive claims
//! - [`journal`] - Before/after value logging and the rollback engine
//! - [`job`] - The unit-of-work state machine (the primary API surface)
//! - [`curator`] - Leader-elected reaper for abandoned jobs and locks
//!
//! # Correctness Invariants
//!
//! Overlock maintains the following invariants:
//!
//! 1. At most one lock record exists per (collection, key) at any instant
//! 2. Every mutation of coordination state uses the version token from the
//!    most recent read by that actor; stale-version failures are never bypassed
//! 3. Rollback never overwrites a value changed by a third party
//! 4. A terminal job status is immutable once set
//! 5. At most one curator is active per cluster at any instant
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use overlock::core::config::Config;
//! use overlock::job::Job;
//! use overlock::store::MemoryStore;
//!
//! # tokio_test::block_on(async {
//! let store = Arc::new(MemoryStore::new());
//! let config = Config::default();
//!
//! let mut job = Job::begin(store, config).await.unwrap();
//! job.write("orders", "o1", serde_json::json!({"status": "pending"}))
//!     .await
//!     .unwrap();
//! job.complete().await.unwrap();
//! # });
//! ```

pub mod core;
pub mod curator;
pub mod job;
pub mod journal;
pub mod lock;
pub mod store;
