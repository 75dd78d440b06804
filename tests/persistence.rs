//! Snapshot files across restarts.
mod common;

use ratekeeper::prelude::*;
use ratekeeper::{Definitions, JsonFileStore, UsageSnapshot};
use serde_json::Value;
use std::fs;
use std::path::Path;
use std::sync::Arc;

fn start_in(dir: &Path, clock: &ManualClock) -> RateLimiter {
    let config = RateLimiterConfig::in_dir(dir);
    RateLimiter::start_with(
        config.clone(),
        Arc::new(clock.clone()),
        JsonFileStore::<Definitions>::new(config.buckets_path()),
        JsonFileStore::<UsageSnapshot>::new(config.bucket_data_path()),
    )
    .expect("limiter starts")
}

fn read_json(path: impl AsRef<Path>) -> Value {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

#[tokio::test]
async fn start_creates_both_snapshot_files() {
    let dir = tempfile::tempdir().unwrap();
    let limiter = RateLimiter::start(RateLimiterConfig::in_dir(dir.path().join("state"))).unwrap();
    assert_eq!(read_json(dir.path().join("state/buckets.json")), serde_json::json!({}));
    assert_eq!(read_json(dir.path().join("state/persisted-bucket-data.json")), serde_json::json!({}));
    limiter.shutdown().await.unwrap();
}

#[tokio::test]
async fn definitions_use_legacy_field_names() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(common::T0);
    let limiter = start_in(dir.path(), &clock);
    let def = BucketDefinition::advanced("Chat", 10.0, 0.5).with_lifetime_cap(100.0).with_persist(true);
    limiter.registry().save("chat", def).unwrap();
    limiter.check(&CheckRequest::simple("adhoc", "global", 1.0, 3.0, 1.0));

    let raw = fs::read_to_string(dir.path().join("buckets.json")).unwrap();
    assert!(raw.starts_with("{\n  \""), "expected pretty JSON: {raw}");
    let json: Value = serde_json::from_str(&raw).unwrap();
    assert_eq!(json["chat"]["maxTokens"], 10.0);
    assert_eq!(json["chat"]["refillRate"], 0.5);
    assert_eq!(json["chat"]["lifetimeMaxTokens"], true);
    assert_eq!(json["chat"]["persistBucket"], true);
    assert_eq!(json["chat"]["type"], "advanced");
    assert!(json.get("adhoc").is_none());
    limiter.shutdown().await.unwrap();
}

#[tokio::test]
async fn usage_survives_restart_only_for_persistent_buckets() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(common::T0);
    let limiter = start_in(dir.path(), &clock);
    limiter.registry().save("kept", BucketDefinition::advanced("Kept", 10.0, 0.0).with_persist(true)).unwrap();
    limiter.registry().save("lost", BucketDefinition::advanced("Lost", 10.0, 0.0)).unwrap();
    limiter.check(&CheckRequest::advanced("kept", "user:ann", 4.0));
    limiter.check(&CheckRequest::advanced("lost", "user:ann", 4.0));
    limiter.shutdown().await.unwrap();

    let json = read_json(dir.path().join("persisted-bucket-data.json"));
    assert_eq!(json["kept"]["user:ann"]["tokenCount"], 6.0);
    assert_eq!(json["kept"]["user:ann"]["invocationCount"], 1);
    assert!(json.get("lost").is_none());

    let limiter = start_in(dir.path(), &clock);
    assert_eq!(limiter.engine().get_entry("kept", "user:ann").unwrap().token_count, 6.0);
    assert!(limiter.engine().get_entry("lost", "user:ann").is_none());
    limiter.shutdown().await.unwrap();
}

#[tokio::test]
async fn downtime_is_credited_only_with_fill_across_restarts() {
    let dir = tempfile::tempdir().unwrap();
    let clock = ManualClock::new(common::T0);
    let limiter = start_in(dir.path(), &clock);
    let base = BucketDefinition::advanced("Across", 10.0, 1.0).with_persist(true);
    limiter.registry().save("across", base.clone().with_fill_across_restarts(true)).unwrap();
    limiter.registry().save("reset", BucketDefinition { name: "Reset".into(), ..base }).unwrap();
    limiter.check(&CheckRequest::advanced("across", "global", 10.0));
    limiter.check(&CheckRequest::advanced("reset", "global", 10.0));
    limiter.shutdown().await.unwrap();

    clock.advance(30_000);
    let limiter = start_in(dir.path(), &clock);
    assert!(limiter.check(&CheckRequest::advanced("across", "global", 10.0)).success);
    let reset = limiter.check(&CheckRequest::advanced("reset", "global", 1.0));
    assert!(!reset.success);
    assert_eq!(reset.next, 1.0);
    limiter.shutdown().await.unwrap();
}

#[tokio::test]
async fn unreadable_definitions_surface_in_admin_reads() {
    let dir = tempfile::tempdir().unwrap();
    fs::write(dir.path().join("buckets.json"), "{ broken").unwrap();
    let clock = ManualClock::new(common::T0);
    let limiter = start_in(dir.path(), &clock);
    let resp = limiter.admin().get_buckets();
    assert!(resp.buckets.is_empty());
    assert!(resp.error_message.unwrap().starts_with("Failed to load buckets"));
    limiter.shutdown().await.unwrap();
}

#[test]
fn config_loads_from_json_with_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ratekeeper.json");
    fs::write(&path, r#"{ "dataDir": "/var/lib/rk", "flushIntervalMs": 1000 }"#).unwrap();
    let cfg = RateLimiterConfig::from_json_file(&path).unwrap();
    assert_eq!(cfg.flush_interval_ms, 1000);
    assert_eq!(cfg.sweep_interval_ms, 60_000);
    assert_eq!(cfg.bucket_data_path(), Path::new("/var/lib/rk/persisted-bucket-data.json"));
}
