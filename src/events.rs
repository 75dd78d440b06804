//! Events published by the rate limiter.
//!
//! [`EventBus`] fans events out to any number of subscribers over a bounded
//! `tokio::sync::broadcast` channel. Publishing never blocks and never fails:
//! with no subscribers the event is dropped, and slow receivers miss the
//! oldest events once the buffer fills.

use crate::bucket::BucketDefinition;
use crate::protocol::RejectReason;
use serde::Serialize;
use serde_json::Value as JsonValue;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::broadcast;

/// Default buffer of the broadcast channel.
pub const DEFAULT_EVENT_CAPACITY: usize = 256;

/// Published when a check rejects a request.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitExceededEvent {
    pub bucket_id: String,
    pub bucket_key: String,
    pub error_message: Option<String>,
    pub inquiry: bool,
    pub invocation: u64,
    pub invocation_limit: bool,
    pub invocation_limit_value: u64,
    pub message_id: String,
    /// Caller-supplied tag copied from the check options.
    pub metadata_key: String,
    pub next: f64,
    pub reject_reason: Option<RejectReason>,
    pub remaining: i64,
    /// Nesting depth of exceeded events; guards against trigger loops.
    pub stack_depth: u32,
    pub tokens: f64,
    pub trigger_type: String,
    pub trigger_username: String,
    pub trigger_metadata: JsonValue,
    pub username: String,
}

/// Published when a check lets a request through.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LimitApprovedEvent {
    /// The caller was exempt (streamer/bot), regardless of `success`.
    pub always_allow: bool,
    /// The check's own verdict.
    pub success: bool,
    pub approval_id: Option<String>,
    pub bucket_id: String,
    pub bucket_key: String,
    pub message_id: String,
    pub trigger_type: String,
    pub trigger_username: String,
    pub trigger_metadata: JsonValue,
    pub username: String,
}

/// Everything the rate limiter announces.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "kebab-case")]
pub enum RateLimitEvent {
    LimitExceeded(LimitExceededEvent),
    Approved(LimitApprovedEvent),
    /// Full definitions map after a registry mutation.
    BucketsChanged { buckets: BTreeMap<String, BucketDefinition> },
    /// The advanced-buckets feature flag changed.
    AdvancedBucketsToggled { enabled: bool },
}

impl RateLimitEvent {
    /// Short name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Self::LimitExceeded(_) => "limit-exceeded",
            Self::Approved(_) => "approved",
            Self::BucketsChanged { .. } => "buckets-changed",
            Self::AdvancedBucketsToggled { .. } => "advanced-buckets-toggled",
        }
    }
}

/// Broadcast hub for [`RateLimitEvent`]s. Clones share one channel.
#[derive(Clone, Debug)]
pub struct EventBus {
    sender: broadcast::Sender<RateLimitEvent>,
    dropped: Arc<AtomicU64>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_EVENT_CAPACITY)
    }
}

impl EventBus {
    /// Bus buffering up to `capacity` events per slow receiver.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity.max(1));
        Self { sender, dropped: Arc::new(AtomicU64::new(0)) }
    }

    /// Receive all future events.
    pub fn subscribe(&self) -> broadcast::Receiver<RateLimitEvent> {
        self.sender.subscribe()
    }

    /// Best-effort publish.
    pub fn publish(&self, event: RateLimitEvent) {
        let name = event.name();
        if self.sender.send(event).is_err() {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            tracing::trace!(target: "ratekeeper::events", event = name, "no subscribers; event dropped");
        } else {
            tracing::debug!(target: "ratekeeper::events", event = name, "event published");
        }
    }

    /// Number of active subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }

    /// Events published while nobody was listening.
    pub fn dropped_count(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
