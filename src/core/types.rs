//! core::types
//!
//! Strong types for core domain concepts.
//!
//! # Types
//!
//! - [`JobId`] - Opaque identifier for a unit of work
//! - [`CuratorId`] - Opaque identifier for a curator instance
//!
//! Both identifiers are 16-character random tokens drawn from an unambiguous
//! upper-case alphanumeric alphabet, unique with overwhelming probability
//! within a cluster's operational lifetime. They are compared as opaque
//! strings; nothing is ever parsed out of them.

use std::fmt;

use rand::Rng;
use serde::{Deserialize, Serialize};

/// Alphabet for generated tokens. Upper-case letters and digits only, so a
/// token survives case-insensitive transports unchanged.
const TOKEN_ALPHABET: &[u8] = b"ABCDEFGHIJKLMNOPQRSTUVWXYZ0123456789";

/// Length of generated tokens.
const TOKEN_LEN: usize = 16;

/// Generate a random opaque token.
fn generate_token() -> String {
    let mut rng = rand::rng();
    (0..TOKEN_LEN)
        .map(|_| TOKEN_ALPHABET[rng.random_range(0..TOKEN_ALPHABET.len())] as char)
        .collect()
}

/// Opaque identifier for a unit of work.
///
/// A `JobId` names the owning job in lock records and keys the job record in
/// the jobs collection.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(String);

impl JobId {
    /// Generate a new random job id.
    pub fn generate() -> Self {
        Self(generate_token())
    }

    /// Create a job id from an existing string.
    ///
    /// Used when reading records back from the store.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opaque identifier for a curator instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CuratorId(String);

impl CuratorId {
    /// Generate a new random curator id.
    pub fn generate() -> Self {
        Self(generate_token())
    }

    /// Create a curator id from an existing string.
    pub fn from_string(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    /// Get the string representation.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for CuratorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_tokens_have_expected_shape() {
        let token = generate_token();
        assert_eq!(token.len(), TOKEN_LEN);
        assert!(token.bytes().all(|b| TOKEN_ALPHABET.contains(&b)));
    }

    #[test]
    fn generated_ids_differ() {
        // Not a collision-resistance proof, just a sanity check that the
        // generator is not returning a constant.
        let a = JobId::generate();
        let b = JobId::generate();
        assert_ne!(a, b);
    }

    #[test]
    fn job_id_round_trips_through_json() {
        let id = JobId::generate();
        let json = serde_json::to_string(&id).unwrap();
        let back: JobId = serde_json::from_str(&json).unwrap();
        assert_eq!(id, back);
    }

    #[test]
    fn job_id_serializes_as_bare_string() {
        let id = JobId::from_string("A1B2C3D4E5F6G7H8");
        let json = serde_json::to_string(&id).unwrap();
        assert_eq!(json, "\"A1B2C3D4E5F6G7H8\"");
    }

    #[test]
    fn display_matches_as_str() {
        let id = CuratorId::from_string("XYZ");
        assert_eq!(id.to_string(), "XYZ");
        assert_eq!(id.as_str(), "XYZ");
    }
}
