//! Token-bucket accounting engine.
//!
//! Owns the usage state of every (bucket id, key) pair and implements
//! refill-on-access, consumption, and inquiry checks. Refill is lazy: there is
//! no timer per key, tokens are topped up from elapsed time whenever a key is
//! touched.
//!
//! All read-refill-write sequences run under one mutex, so concurrent checks
//! from independent trigger pipelines never interleave on the same entry.
//! The registry may be read while the usage lock is held, never the other
//! way around.

use crate::bucket::{BucketDefinition, KeySelector, UsageEntry};
use crate::clock::Clock;
use crate::error::{BucketDataError, RateLimitError};
use crate::protocol::{CheckRequest, CheckResponse, RejectReason, UndoDetails, NEVER, UNLIMITED};
use crate::registry::BucketRegistry;
use crate::store::SnapshotStore;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

/// Usage of one bucket: key -> entry.
pub type BucketUsage = BTreeMap<String, UsageEntry>;
/// Usage of every bucket: bucket id -> key -> entry.
pub type UsageSnapshot = BTreeMap<String, BucketUsage>;

/// Per-key usage accounting for all buckets.
#[derive(Debug)]
pub struct AccountingEngine {
    registry: Arc<BucketRegistry>,
    clock: Arc<dyn Clock>,
    start_time: u64,
    usage: Mutex<UsageSnapshot>,
    store: Box<dyn SnapshotStore<UsageSnapshot>>,
}

impl AccountingEngine {
    /// Build the engine and load the persisted usage snapshot.
    ///
    /// Engine start time is taken from `clock` now. Entries for unknown bucket
    /// ids are dropped; buckets without `fill_across_restarts` have their
    /// `last_updated` reset so downtime is not credited.
    pub fn load<S>(registry: Arc<BucketRegistry>, store: S, clock: Arc<dyn Clock>) -> Self
    where
        S: SnapshotStore<UsageSnapshot> + 'static,
    {
        let start_time = clock.now_millis();
        let usage = match store.load() {
            Ok(Some(snapshot)) => apply_restart_policy(&registry, snapshot),
            Ok(None) => {
                if let Err(e) = store.save(&UsageSnapshot::new()) {
                    error!(target: "ratekeeper::engine", error = %e, "failed to create usage snapshot");
                }
                UsageSnapshot::new()
            }
            Err(e) => {
                error!(target: "ratekeeper::engine", error = %e, "failed to load usage snapshot");
                UsageSnapshot::new()
            }
        };
        debug!(target: "ratekeeper::engine", buckets = usage.len(), start_time, "accounting engine initialized");
        Self { registry, clock, start_time, usage: Mutex::new(usage), store: Box::new(store) }
    }

    /// Epoch milliseconds at which the engine was built.
    pub fn start_time(&self) -> u64 {
        self.start_time
    }

    /// The registry this engine resolves buckets through.
    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    fn lock(&self) -> MutexGuard<'_, UsageSnapshot> {
        self.usage.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Refill, then try to consume `token_request` tokens for one key.
    ///
    /// An unresolvable bucket fails open: the request is allowed and the gap
    /// is logged, since the bucket may have been deleted while automations
    /// still reference it.
    pub fn check(&self, request: &CheckRequest) -> CheckResponse {
        let Some(def) = self.registry.resolve(&request.bucket_id, request.auto_params()) else {
            return fail_open(request);
        };

        let now = self.clock.now_millis();
        let mut usage = self.lock();
        // Deleted between resolve and lock: do not resurrect its usage.
        if !usage.contains_key(&request.bucket_id) && self.registry.get(&request.bucket_id).is_none() {
            drop(usage);
            return fail_open(request);
        }
        let entry =
            refilled_entry(&mut usage, &request.bucket_id, &def, &request.key, now, self.start_time);

        if request.token_request > entry.token_count {
            return CheckResponse {
                success: false,
                next: estimate_next_available(&def, entry.token_count, request.token_request),
                remaining: remaining_invocations(request, entry),
                invocation: entry.invocation_count,
                reject_reason: Some(RejectReason::RateLimit),
                error_message: Some(format!(
                    "Insufficient tokens (has {}, needs {})",
                    entry.token_count, request.token_request
                )),
            };
        }

        if request.invocation_limit && entry.invocation_count >= request.invocation_limit_value {
            return CheckResponse {
                success: false,
                next: estimate_next_available(&def, entry.token_count, request.token_request),
                remaining: 0,
                invocation: entry.invocation_count,
                reject_reason: Some(RejectReason::InvocationLimit),
                error_message: Some(format!(
                    "Invocation limit reached (limit={}, current={})",
                    request.invocation_limit_value, entry.invocation_count
                )),
            };
        }

        if !request.inquiry {
            entry.invocation_count += 1;
            entry.token_count -= request.token_request;
        }

        CheckResponse {
            success: true,
            next: estimate_next_available(&def, entry.token_count, request.token_request),
            remaining: remaining_invocations(request, entry),
            invocation: entry.invocation_count,
            reject_reason: None,
            error_message: None,
        }
    }

    /// Refill one key (creating it if needed) and return the stored result.
    pub fn add_tokens(&self, bucket_id: &str, def: &BucketDefinition, key: &str) -> UsageEntry {
        self.update_key(bucket_id, def, key, |_| {})
    }

    /// Refill one key (creating it if needed), then apply `f` atomically.
    pub fn update_key<F>(&self, bucket_id: &str, def: &BucketDefinition, key: &str, f: F) -> UsageEntry
    where
        F: FnOnce(&mut UsageEntry),
    {
        let now = self.clock.now_millis();
        let mut usage = self.lock();
        let entry = refilled_entry(&mut usage, bucket_id, def, key, now, self.start_time);
        f(entry);
        *entry
    }

    /// Give back consumed tokens and invocations for an undo.
    ///
    /// Returns `None` when the key has no usage state. Tokens are clamped to
    /// capacity, so the amount restored may be less than `tokens_consumed`.
    pub fn restore(
        &self,
        bucket_id: &str,
        def: &BucketDefinition,
        key: &str,
        tokens_consumed: f64,
        invocations: u64,
    ) -> Option<UndoDetails> {
        let now = self.clock.now_millis();
        let mut usage = self.lock();
        let entry = usage.get_mut(bucket_id)?.get_mut(key)?;
        let original = entry.token_count;
        entry.token_count = def.capacity.min(entry.token_count + tokens_consumed);
        entry.invocation_count = entry.invocation_count.saturating_sub(invocations);
        entry.last_updated = now;
        Some(UndoDetails {
            tokens_restored: entry.token_count - original,
            invocation_decremented: invocations,
        })
    }

    /// Overwrite one key. Returns `false` (and logs) if the bucket has no
    /// usage state at all.
    pub fn set_key(&self, bucket_id: &str, key: &str, entry: UsageEntry) -> bool {
        let mut usage = self.lock();
        match usage.get_mut(bucket_id) {
            Some(entries) => {
                entries.insert(key.to_string(), entry);
                true
            }
            None => {
                error!(target: "ratekeeper::engine", bucket_id = %bucket_id, key = %key, "attempted to set key for non-existent bucket");
                false
            }
        }
    }

    /// Remove one key. Returns whether it existed.
    pub fn delete_key(&self, bucket_id: &str, key: &str) -> bool {
        self.lock().get_mut(bucket_id).is_some_and(|entries| entries.remove(key).is_some())
    }

    /// Delete a bucket definition together with its usage state.
    ///
    /// The usage lock is held across the registry delete, so a concurrent
    /// check either finishes before the usage is dropped or finds the bucket
    /// gone. Returns the removed definition and how many keys it had.
    pub fn delete_bucket(&self, bucket_id: &str) -> Result<(BucketDefinition, usize), RateLimitError> {
        let mut usage = self.lock();
        let removed = self.registry.delete(bucket_id)?;
        let keys = usage.remove(bucket_id).map_or(0, |entries| entries.len());
        Ok((removed, keys))
    }

    pub fn list_keys(&self, bucket_id: &str) -> Vec<String> {
        self.lock().get(bucket_id).map(|entries| entries.keys().cloned().collect()).unwrap_or_default()
    }

    /// Stored keys of a bucket selected by `selector`.
    pub fn list_keys_matching(&self, bucket_id: &str, selector: &KeySelector) -> Vec<String> {
        self.lock()
            .get(bucket_id)
            .map(|entries| entries.keys().filter(|k| selector.matches(k)).cloned().collect())
            .unwrap_or_default()
    }

    pub fn has_key(&self, bucket_id: &str, key: &str) -> bool {
        self.lock().get(bucket_id).is_some_and(|entries| entries.contains_key(key))
    }

    /// Current entry without refilling it.
    pub fn get_entry(&self, bucket_id: &str, key: &str) -> Option<UsageEntry> {
        self.lock().get(bucket_id).and_then(|entries| entries.get(key).copied())
    }

    /// Copy of every entry in a bucket (empty if none).
    pub fn get_all_bucket_data(&self, bucket_id: &str) -> BucketUsage {
        self.lock().get(bucket_id).cloned().unwrap_or_default()
    }

    /// Refill every key of a bucket and return the result, for display.
    pub fn refresh_bucket(&self, bucket_id: &str) -> Option<BucketUsage> {
        let Some(def) = self.registry.get(bucket_id) else {
            warn!(target: "ratekeeper::engine", bucket_id = %bucket_id, "no bucket found for usage refresh");
            return None;
        };
        let now = self.clock.now_millis();
        let mut usage = self.lock();
        let Some(entries) = usage.get_mut(bucket_id) else {
            return Some(BucketUsage::new());
        };
        for entry in entries.values_mut() {
            *entry = refill(&def, entry, now, self.start_time);
        }
        debug!(target: "ratekeeper::engine", bucket_id = %bucket_id, keys = entries.len(), "refreshed bucket usage");
        Some(entries.clone())
    }

    /// Replace a bucket's usage with a JSON document of key -> entry.
    ///
    /// Every entry is validated before anything is written; the first bad key
    /// rejects the whole document. With `dry_run` nothing is committed, and an
    /// empty `bucket_id` skips the bucket existence check.
    pub fn import_bucket_data(
        &self,
        bucket_id: &str,
        raw: &str,
        dry_run: bool,
    ) -> Result<usize, BucketDataError> {
        if (!bucket_id.is_empty() || !dry_run) && self.registry.get(bucket_id).is_none() {
            warn!(target: "ratekeeper::engine", bucket_id = %bucket_id, "bucket data import for unknown bucket");
            return Err(BucketDataError::BucketNotFound { bucket_id: bucket_id.to_string() });
        }

        let parsed: JsonValue = serde_json::from_str(raw).map_err(|e| {
            warn!(target: "ratekeeper::engine", bucket_id = %bucket_id, error = %e, "bucket data import is not valid JSON");
            BucketDataError::InvalidJson { bucket_id: bucket_id.to_string(), message: e.to_string() }
        })?;
        let fields = match parsed {
            JsonValue::Object(fields) => fields,
            other => {
                return Err(BucketDataError::NotAnObject {
                    bucket_id: bucket_id.to_string(),
                    got: json_type(Some(&other)),
                })
            }
        };

        let mut entries = BucketUsage::new();
        for (key, value) in &fields {
            let entry = parse_entry(value).map_err(|problems| {
                let err = BucketDataError::InvalidEntry { key: key.clone(), problems };
                warn!(target: "ratekeeper::engine", bucket_id = %bucket_id, error = %err, "rejected bucket data import");
                err
            })?;
            entries.insert(key.clone(), entry);
        }

        let count = entries.len();
        if !dry_run {
            self.lock().insert(bucket_id.to_string(), entries);
            debug!(target: "ratekeeper::engine", bucket_id = %bucket_id, keys = count, "imported bucket data");
        }
        Ok(count)
    }

    /// Usage of buckets whose definition asks for persistence.
    pub fn persistent_snapshot(&self) -> UsageSnapshot {
        let definitions = self.registry.list();
        self.lock()
            .iter()
            .filter(|(bucket_id, _)| definitions.get(*bucket_id).is_some_and(|def| def.persist))
            .map(|(bucket_id, entries)| (bucket_id.clone(), entries.clone()))
            .collect()
    }

    /// Write the persistent snapshot to the store.
    pub fn flush(&self) -> Result<(), RateLimitError> {
        let snapshot = self.persistent_snapshot();
        self.store.save(&snapshot)?;
        debug!(target: "ratekeeper::engine", buckets = snapshot.len(), "flushed usage snapshot");
        Ok(())
    }
}

fn fail_open(request: &CheckRequest) -> CheckResponse {
    error!(
        target: "ratekeeper::engine",
        bucket_id = %request.bucket_id,
        key = %request.key,
        tokens = request.token_request,
        inquiry = request.inquiry,
        "bucket not found; allowing request"
    );
    CheckResponse::fail_open()
}

/// Fetch (or create) an entry and bring it up to date.
fn refilled_entry<'a>(
    usage: &'a mut UsageSnapshot,
    bucket_id: &str,
    def: &BucketDefinition,
    key: &str,
    now: u64,
    start_time: u64,
) -> &'a mut UsageEntry {
    let entry = usage
        .entry(bucket_id.to_string())
        .or_default()
        .entry(key.to_string())
        .or_insert_with(|| new_entry(def, now, start_time));
    *entry = refill(def, entry, now, start_time);
    entry
}

fn new_entry(def: &BucketDefinition, now: u64, start_time: u64) -> UsageEntry {
    let initial = def.initial_tokens();
    UsageEntry {
        token_count: initial,
        lifetime_token_count: initial,
        invocation_count: 0,
        last_updated: if def.fill_from_start { start_time } else { now },
    }
}

/// Add tokens earned since `last_updated`, honoring capacity and lifetime cap.
///
/// An unset (`0`) timestamp counts from engine start for `fill_from_start`
/// buckets and from `now` otherwise. `last_updated` always moves to `now`.
pub fn refill(def: &BucketDefinition, entry: &UsageEntry, now: u64, start_time: u64) -> UsageEntry {
    let last = match entry.last_updated {
        0 if def.fill_from_start && start_time != 0 => start_time,
        0 => now,
        ts => ts,
    };
    let elapsed_ms = now.saturating_sub(last);
    let by_time = def.refill_rate * (elapsed_ms as f64 / 1000.0);
    let to_add = match def.lifetime_cap {
        Some(cap) => by_time.min(cap - entry.lifetime_token_count),
        None => by_time,
    };

    let mut next = *entry;
    if to_add > 0.0 {
        next.token_count = def.capacity.min(entry.token_count + to_add);
        next.lifetime_token_count = entry.lifetime_token_count + (next.token_count - entry.token_count);
    }
    next.last_updated = now;
    next
}

/// Seconds until `requested` tokens are available: 0 if they are now, -1 if
/// they never will be (request above capacity, or no refill).
pub fn estimate_next_available(def: &BucketDefinition, available: f64, requested: f64) -> f64 {
    if available >= requested {
        return 0.0;
    }
    if requested > def.capacity || def.refill_rate <= 0.0 {
        return NEVER;
    }
    (requested - available) / def.refill_rate
}

fn remaining_invocations(request: &CheckRequest, entry: &UsageEntry) -> i64 {
    if !request.invocation_limit {
        return UNLIMITED;
    }
    let left = request.invocation_limit_value.saturating_sub(entry.invocation_count);
    i64::try_from(left).unwrap_or(i64::MAX)
}

fn apply_restart_policy(registry: &BucketRegistry, snapshot: UsageSnapshot) -> UsageSnapshot {
    snapshot
        .into_iter()
        .filter_map(|(bucket_id, mut entries)| {
            let def = registry.get(&bucket_id)?;
            if !def.fill_across_restarts {
                for entry in entries.values_mut() {
                    entry.last_updated = 0;
                }
            }
            Some((bucket_id, entries))
        })
        .collect()
}

/// Type name in the vocabulary used by import error messages.
fn json_type(value: Option<&JsonValue>) -> &'static str {
    match value {
        None => "undefined",
        Some(JsonValue::Null) => "null",
        Some(JsonValue::Bool(_)) => "boolean",
        Some(JsonValue::Number(_)) => "number",
        Some(JsonValue::String(_)) => "string",
        Some(JsonValue::Array(_)) => "array",
        Some(JsonValue::Object(_)) => "object",
    }
}

fn parse_entry(value: &JsonValue) -> Result<UsageEntry, Vec<String>> {
    let JsonValue::Object(fields) = value else {
        return Err(vec![format!("entry is not an object (got {})", json_type(Some(value)))]);
    };

    let mut problems = Vec::new();
    let mut number = |name: &str| match fields.get(name) {
        Some(JsonValue::Number(n)) => n.as_f64().unwrap_or_default(),
        other => {
            problems.push(format!("{name} is not a number (got {})", json_type(other)));
            0.0
        }
    };
    let token_count = number("tokenCount");
    let lifetime_token_count = number("lifetimeTokenCount");
    let last_updated = number("lastUpdated");
    let invocation_count = number("invocationCount");

    if !problems.is_empty() {
        return Err(problems);
    }
    Ok(UsageEntry {
        token_count,
        lifetime_token_count,
        // Float-to-int casts saturate; negative counts become 0.
        invocation_count: invocation_count as u64,
        last_updated: last_updated as u64,
    })
}
