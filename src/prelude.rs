//! Convenient re-exports for common ratekeeper types.
pub use crate::{
    bucket::{BucketDefinition, BucketKey, BucketKind, KeySelector, UsageEntry},
    clock::{Clock, ManualClock, SystemClock},
    config::RateLimiterConfig,
    effects::{CheckEffect, EffectContext, ModifyEffect, TriggerContext, UndoEffect},
    engine::AccountingEngine,
    error::{EffectError, RateLimitError},
    events::RateLimitEvent,
    layer::{CheckLayer, LayerError},
    ledger::ApprovalLedger,
    protocol::{CheckRequest, CheckResponse, RejectReason, UndoResponse},
    registry::BucketRegistry,
    runtime::RateLimiter,
};
