//! store
//!
//! The backing-store seam.
//!
//! Overlock coordinates entirely through a remote key-value document store
//! with per-key optimistic concurrency control. The store itself (and its
//! request/response plumbing) is an external collaborator hidden behind the
//! [`Store`] trait; [`MemoryStore`] is the deterministic in-memory
//! implementation used throughout the test suites.

pub mod memory;
pub mod traits;

pub use memory::{FailOn, MemoryStore, OpKind, StoreOp};
pub use traits::{PutCondition, Record, Ref, Store, StoreError};
