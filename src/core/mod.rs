//! core
//!
//! Leaf types shared by every other module: identifiers, timestamps, and
//! configuration.

pub mod config;
pub mod types;

pub use config::{Config, ConfigError};
pub use types::{CuratorId, JobId};
