//! Approval ledger: single-use, time-boxed receipts for undoing a check.
//!
//! Expiry is evaluated on every read, so an entry older than the TTL is
//! already invisible before [`ApprovalLedger::sweep`] physically removes it.

use crate::clock::Clock;
use crate::config::DEFAULT_APPROVAL_TTL_MS;
use crate::engine::AccountingEngine;
use crate::protocol::{UndoFailure, UndoResponse};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// One recorded consumption that may still be reversed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApprovalEntry {
    pub approval_id: String,
    pub bucket_id: String,
    pub bucket_key: String,
    pub tokens_consumed: f64,
    /// 0 for inquiries, 1 for real consumptions.
    pub invocation_incremented: u64,
    /// Epoch milliseconds at which the approval was recorded.
    pub timestamp: u64,
}

/// Ledger of outstanding approvals.
#[derive(Debug)]
pub struct ApprovalLedger {
    approvals: Mutex<HashMap<String, ApprovalEntry>>,
    engine: Arc<AccountingEngine>,
    clock: Arc<dyn Clock>,
    ttl_ms: u64,
}

impl ApprovalLedger {
    /// Ledger with the default ten-minute TTL.
    pub fn new(engine: Arc<AccountingEngine>, clock: Arc<dyn Clock>) -> Self {
        Self::with_ttl(engine, clock, DEFAULT_APPROVAL_TTL_MS)
    }

    pub fn with_ttl(engine: Arc<AccountingEngine>, clock: Arc<dyn Clock>, ttl_ms: u64) -> Self {
        Self { approvals: Mutex::new(HashMap::new()), engine, clock, ttl_ms }
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<String, ApprovalEntry>> {
        self.approvals.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_expired(&self, entry: &ApprovalEntry, now: u64) -> bool {
        now.saturating_sub(entry.timestamp) >= self.ttl_ms
    }

    /// Store an approval stamped with the current time. An existing entry
    /// under the same id is replaced.
    pub fn record_approval(
        &self,
        approval_id: &str,
        bucket_id: &str,
        bucket_key: &str,
        tokens_consumed: f64,
        invocation_incremented: u64,
    ) {
        let entry = ApprovalEntry {
            approval_id: approval_id.to_string(),
            bucket_id: bucket_id.to_string(),
            bucket_key: bucket_key.to_string(),
            tokens_consumed,
            invocation_incremented,
            timestamp: self.clock.now_millis(),
        };
        self.lock().insert(approval_id.to_string(), entry);
        debug!(
            target: "ratekeeper::ledger",
            approval_id,
            bucket_id,
            bucket_key,
            tokens_consumed,
            invocation_incremented,
            "recorded approval"
        );
    }

    /// Live (unexpired) approval, if any.
    pub fn get_approval(&self, approval_id: &str) -> Option<ApprovalEntry> {
        let now = self.clock.now_millis();
        let approvals = self.lock();
        let entry = approvals.get(approval_id)?;
        if self.is_expired(entry, now) {
            debug!(target: "ratekeeper::ledger", approval_id, age_ms = now.saturating_sub(entry.timestamp), "approval expired");
            return None;
        }
        Some(entry.clone())
    }

    /// Idempotent delete.
    pub fn remove_approval(&self, approval_id: &str) {
        if self.lock().remove(approval_id).is_some() {
            debug!(target: "ratekeeper::ledger", approval_id, "removed approval");
        }
    }

    /// Drop every expired approval. Returns how many were removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let mut approvals = self.lock();
        let before = approvals.len();
        approvals.retain(|_, entry| !self.is_expired(entry, now));
        let removed = before - approvals.len();
        if removed > 0 {
            debug!(target: "ratekeeper::ledger", removed, "swept expired approvals");
        }
        removed
    }

    /// Reverse the consumption recorded under `approval_id`, at most once.
    ///
    /// The ledger lock is held for the whole operation, so two concurrent
    /// undos of the same id cannot both succeed.
    pub fn undo_approval(&self, approval_id: &str) -> UndoResponse {
        debug!(target: "ratekeeper::ledger", approval_id, "undo attempt");
        let now = self.clock.now_millis();
        let mut approvals = self.lock();

        let Some(approval) = approvals.get(approval_id).filter(|e| !self.is_expired(e, now)).cloned()
        else {
            debug!(target: "ratekeeper::ledger", approval_id, reason = "invalid_or_expired", "undo failed");
            return UndoResponse::failed(UndoFailure::InvalidOrExpired);
        };

        let Some(def) = self.engine.registry().get(&approval.bucket_id) else {
            debug!(target: "ratekeeper::ledger", approval_id, bucket_id = %approval.bucket_id, reason = "bucket_not_found", "undo failed");
            return UndoResponse::failed(UndoFailure::BucketNotFound);
        };

        let Some(details) = self.engine.restore(
            &approval.bucket_id,
            &def,
            &approval.bucket_key,
            approval.tokens_consumed,
            approval.invocation_incremented,
        ) else {
            debug!(
                target: "ratekeeper::ledger",
                approval_id,
                bucket_id = %approval.bucket_id,
                bucket_key = %approval.bucket_key,
                reason = "key_not_found",
                "undo failed"
            );
            return UndoResponse::failed(UndoFailure::KeyNotFound);
        };

        approvals.remove(approval_id);
        debug!(
            target: "ratekeeper::ledger",
            approval_id,
            bucket_id = %approval.bucket_id,
            bucket_key = %approval.bucket_key,
            tokens_restored = details.tokens_restored,
            invocation_decremented = details.invocation_decremented,
            "undo successful"
        );
        UndoResponse::restored(details)
    }

    /// Number of stored approvals, expired or not.
    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Forget every approval.
    pub fn shutdown(&self) {
        self.lock().clear();
        debug!(target: "ratekeeper::ledger", "approval ledger shut down");
    }
}
