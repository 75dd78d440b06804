//! Check, approve, and undo through the effect adapters.
mod common;

use common::scenario_bucket;
use ratekeeper::effects::{CheckEffect, CheckKeyType, EffectContext, TriggerContext, UndoEffect};
use ratekeeper::prelude::*;
use ratekeeper::{Definitions, MemoryStore, RateLimitEvent, UndoFailure, UsageSnapshot};
use std::sync::Arc;

fn start(clock: &ManualClock) -> RateLimiter {
    let limiter = RateLimiter::start_with(
        RateLimiterConfig::default(),
        Arc::new(clock.clone()),
        MemoryStore::<Definitions>::new(),
        MemoryStore::<UsageSnapshot>::new(),
    )
    .expect("limiter starts");
    limiter.registry().save("b", scenario_bucket()).expect("valid bucket");
    limiter
}

fn approve(ctx: &EffectContext, tokens: f64) -> String {
    let effect = CheckEffect {
        bucket_id: "b".into(),
        key_type: CheckKeyType::Global,
        tokens,
        record_approval: true,
        ..CheckEffect::default()
    };
    let out = effect.run(&TriggerContext { username: "ann".into(), ..TriggerContext::default() }, ctx).unwrap();
    assert!(out.allowed);
    out.approval_id.expect("approval recorded")
}

#[tokio::test]
async fn undo_restores_exactly_once() {
    let clock = ManualClock::new(common::T0);
    let limiter = start(&clock);
    let ctx = limiter.effects();
    let id = approve(&ctx, 4.0);
    assert_eq!(limiter.engine().get_entry("b", "global").unwrap().token_count, 1.0);

    let first = UndoEffect::new(id.clone()).run(&ctx);
    assert!(first.success);
    let entry = limiter.engine().get_entry("b", "global").unwrap();
    assert_eq!(entry.token_count, 5.0);
    assert_eq!(entry.invocation_count, 0);

    let second = limiter.undo(&id);
    assert_eq!(second, UndoResponse::failed(UndoFailure::InvalidOrExpired));
    limiter.shutdown().await.unwrap();
}

#[tokio::test]
async fn undo_after_refill_is_clamped() {
    let clock = ManualClock::new(common::T0);
    let limiter = start(&clock);
    let ctx = limiter.effects();
    let id = approve(&ctx, 5.0);
    clock.advance(8_000);
    // Refill to 8 before the undo.
    limiter.check(&CheckRequest::advanced("b", "global", 1.0).inquiry());

    let resp = limiter.undo(&id);
    let details = resp.details.unwrap();
    assert_eq!(details.tokens_restored, 2.0);
    assert_eq!(details.invocation_decremented, 1);
    assert_eq!(limiter.engine().get_entry("b", "global").unwrap().token_count, 10.0);
    limiter.shutdown().await.unwrap();
}

#[tokio::test]
async fn approvals_expire_at_the_ten_minute_boundary() {
    let clock = ManualClock::new(common::T0);
    let limiter = start(&clock);
    let ctx = limiter.effects();
    let early = approve(&ctx, 1.0);
    let late = approve(&ctx, 1.0);

    clock.advance(599_999);
    assert!(limiter.ledger().get_approval(&early).is_some());
    assert!(limiter.undo(&early).success);

    clock.advance(1);
    assert!(limiter.ledger().get_approval(&late).is_none());
    assert_eq!(limiter.undo(&late), UndoResponse::failed(UndoFailure::InvalidOrExpired));
    limiter.shutdown().await.unwrap();
}

#[tokio::test]
async fn undo_of_deleted_bucket_reports_reason() {
    let clock = ManualClock::new(common::T0);
    let limiter = start(&clock);
    let mut events = limiter.subscribe();
    let ctx = limiter.effects();
    let id = approve(&ctx, 1.0);
    assert!(matches!(events.recv().await.unwrap(), RateLimitEvent::Approved(_)));

    limiter.admin().delete_bucket("b");
    let out = UndoEffect::new(id).run(&ctx);
    assert!(!out.success);
    assert_eq!(out.reason, "bucket_not_found");
    limiter.shutdown().await.unwrap();
}
