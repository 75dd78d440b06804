//! Request and response types exchanged with the engine and the ledger.

use crate::bucket::{AutoBucketParams, BucketKind};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Sentinel for "no invocation limit" in [`CheckResponse::remaining`].
pub const UNLIMITED: i64 = -1;
/// Sentinel for "tokens will never be available" in [`CheckResponse::next`].
pub const NEVER: f64 = -1.0;

/// Why a check was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    /// Not enough tokens.
    RateLimit,
    /// The key already used its allowed invocations.
    InvocationLimit,
    /// The check itself could not be evaluated.
    Error,
}

impl RejectReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::RateLimit => "rate_limit",
            Self::InvocationLimit => "invocation_limit",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A request to consume (or inspect) tokens for one key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckRequest {
    pub bucket_type: BucketKind,
    pub bucket_id: String,
    /// Capacity for auto-instantiated `simple` buckets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_size: Option<f64>,
    /// Refill rate for auto-instantiated `simple` buckets.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bucket_rate: Option<f64>,
    pub key: String,
    pub token_request: f64,
    /// Report availability without consuming anything.
    #[serde(default)]
    pub inquiry: bool,
    #[serde(default)]
    pub invocation_limit: bool,
    #[serde(default)]
    pub invocation_limit_value: u64,
}

impl CheckRequest {
    /// Request against an admin-managed bucket.
    pub fn advanced(bucket_id: impl Into<String>, key: impl Into<String>, tokens: f64) -> Self {
        Self {
            bucket_type: BucketKind::Advanced,
            bucket_id: bucket_id.into(),
            bucket_size: None,
            bucket_rate: None,
            key: key.into(),
            token_request: tokens,
            inquiry: false,
            invocation_limit: false,
            invocation_limit_value: 0,
        }
    }

    /// Request against an ad hoc bucket, created on first use.
    pub fn simple(
        bucket_id: impl Into<String>,
        key: impl Into<String>,
        tokens: f64,
        size: f64,
        rate: f64,
    ) -> Self {
        Self {
            bucket_type: BucketKind::Simple,
            bucket_size: Some(size),
            bucket_rate: Some(rate),
            ..Self::advanced(bucket_id, key, tokens)
        }
    }

    /// Make this a dry run.
    pub fn inquiry(mut self) -> Self {
        self.inquiry = true;
        self
    }

    /// Cap successful invocations per key.
    pub fn with_invocation_limit(mut self, limit: u64) -> Self {
        self.invocation_limit = true;
        self.invocation_limit_value = limit;
        self
    }

    /// Parameters for auto-instantiation; only `simple` requests carry them.
    pub fn auto_params(&self) -> Option<AutoBucketParams> {
        match self.bucket_type {
            BucketKind::Simple => Some(AutoBucketParams {
                bucket_size: self.bucket_size.unwrap_or(0.0),
                bucket_rate: self.bucket_rate.unwrap_or(0.0),
            }),
            BucketKind::Advanced => None,
        }
    }
}

/// Outcome of a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckResponse {
    pub success: bool,
    /// Seconds until the request could succeed: 0 if it can now, -1 if never.
    pub next: f64,
    /// Invocations left for the key, or -1 when unlimited.
    pub remaining: i64,
    /// The key's invocation count after this check.
    pub invocation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reject_reason: Option<RejectReason>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

impl CheckResponse {
    /// Response for a check against a bucket that no longer exists.
    pub fn fail_open() -> Self {
        Self {
            success: true,
            next: 0.0,
            remaining: UNLIMITED,
            invocation: 0,
            reject_reason: None,
            error_message: None,
        }
    }

    pub fn is_allowed(&self) -> bool {
        self.success
    }
}

/// Why an undo failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UndoFailure {
    /// Unknown, already used, or expired approval.
    InvalidOrExpired,
    /// The approval's bucket was deleted.
    BucketNotFound,
    /// The approval's key no longer has usage state.
    KeyNotFound,
    /// Any other failure.
    Unknown,
}

impl UndoFailure {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::InvalidOrExpired => "invalid_or_expired",
            Self::BucketNotFound => "bucket_not_found",
            Self::KeyNotFound => "key_not_found",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for UndoFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an undo actually gave back.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoDetails {
    /// May be less than consumed when the capacity clamp applies.
    pub tokens_restored: f64,
    pub invocation_decremented: u64,
}

/// Outcome of an undo.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<UndoFailure>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<UndoDetails>,
}

impl UndoResponse {
    pub fn restored(details: UndoDetails) -> Self {
        Self { success: true, reason: None, details: Some(details) }
    }

    pub fn failed(reason: UndoFailure) -> Self {
        Self { success: false, reason: Some(reason), details: None }
    }
}
