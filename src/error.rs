//! Error types for the rate limiter.
//!
//! Expected branching outcomes (a rejected check, a failed undo) are typed
//! results in [`crate::protocol`], not errors. The types here cover caller
//! mistakes, storage failures, and bulk-import validation.
use std::path::PathBuf;
use thiserror::Error;

/// Validation failures when saving a bucket definition.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DefinitionError {
    /// The bucket id was empty.
    #[error("Invalid bucket definition: Missing ID.")]
    MissingId,
    /// The name was empty after trimming.
    #[error("Invalid bucket definition: Missing or empty name.")]
    EmptyName,
    /// Another bucket id already uses this name (case-insensitive).
    #[error("Invalid bucket definition: A bucket with the name \"{name}\" already exists.")]
    DuplicateName {
        /// Name as submitted.
        name: String,
    },
    /// Capacity below zero.
    #[error("Invalid bucket definition: Maximum tokens must be non-negative.")]
    NegativeCapacity,
    /// Refill rate below zero.
    #[error("Invalid bucket definition: Bucket refill rate must be non-negative.")]
    NegativeRefillRate,
}

/// Invalid runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    /// An interval or TTL was zero.
    #[error("{field} must be > 0 (got {provided})")]
    ZeroDuration {
        /// Offending field.
        field: &'static str,
        /// Value provided by caller.
        provided: u64,
    },
}

/// Crate-level error.
#[derive(Debug, Error)]
pub enum RateLimitError {
    /// A bucket definition failed validation.
    #[error(transparent)]
    Definition(#[from] DefinitionError),
    /// The referenced bucket does not exist.
    #[error("bucket '{id}' not found")]
    BucketNotFound {
        /// Identifier that could not be located.
        id: String,
    },
    /// Reading or writing a snapshot file failed.
    #[error("failed to access {}: {source}", .path.display())]
    Persistence {
        /// File involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// A snapshot could not be encoded or decoded.
    #[error("invalid snapshot data: {0}")]
    Serialization(#[from] serde_json::Error),
    /// The configuration was rejected.
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl RateLimitError {
    /// Check if this error is a definition validation failure.
    pub fn is_definition(&self) -> bool {
        matches!(self, Self::Definition(_))
    }

    /// Check if this error is a missing bucket.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::BucketNotFound { .. })
    }
}

/// Rejections from a bulk usage import.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum BucketDataError {
    /// The target bucket does not exist.
    #[error("No bucket found for bucket ID: {bucket_id}")]
    BucketNotFound {
        /// Requested id.
        bucket_id: String,
    },
    /// The payload was not valid JSON.
    #[error("Invalid JSON provided for bucket ID: {bucket_id} - {message}")]
    InvalidJson {
        /// Requested id.
        bucket_id: String,
        /// Parser message.
        message: String,
    },
    /// The payload was valid JSON but not a key -> entry object.
    #[error("Invalid bucketData provided for bucket ID: {bucket_id} - expected object but got {got}")]
    NotAnObject {
        /// Requested id.
        bucket_id: String,
        /// JSON type that was found instead.
        got: &'static str,
    },
    /// One entry had missing or mistyped fields.
    #[error("Invalid bucketData for {key} - {}", .problems.join(", "))]
    InvalidEntry {
        /// First offending key.
        key: String,
        /// One message per bad field.
        problems: Vec<String>,
    },
}

/// Failure of a request adapter.
///
/// Critical errors abort the triggering pipeline. Non-critical errors report
/// an expected empty result and leave the decision to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum EffectError {
    /// Something the pipeline cannot continue past, such as a missing bucket.
    #[error("{0}")]
    Critical(String),
    /// Nothing matched, or a required key was absent.
    #[error("{0}")]
    NonCritical(String),
}

impl EffectError {
    /// Whether the pipeline must be aborted.
    pub fn is_critical(&self) -> bool {
        matches!(self, Self::Critical(_))
    }
}
