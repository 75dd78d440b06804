//! Composition root: builds the registry, engine, and ledger once and owns the
//! background tasks around them.
//!
//! ```no_run
//! use ratekeeper::{CheckRequest, RateLimiter, RateLimiterConfig};
//!
//! # async fn demo() -> Result<(), ratekeeper::RateLimitError> {
//! let limiter = RateLimiter::start(RateLimiterConfig::in_dir("./data"))?;
//! let response = limiter.check(&CheckRequest::advanced("bucket-id", "global", 1.0));
//! println!("allowed: {}", response.success);
//! limiter.shutdown().await?;
//! # Ok(())
//! # }
//! ```

use crate::admin::BucketAdmin;
use crate::clock::{Clock, SystemClock};
use crate::config::RateLimiterConfig;
use crate::effects::EffectContext;
use crate::engine::{AccountingEngine, UsageSnapshot};
use crate::error::RateLimitError;
use crate::events::{EventBus, RateLimitEvent};
use crate::flags::{FeatureFlags, FlagSet};
use crate::ledger::ApprovalLedger;
use crate::protocol::{CheckRequest, CheckResponse, UndoResponse};
use crate::registry::{BucketRegistry, Definitions};
use crate::scheduler::PeriodicTask;
use crate::store::{JsonFileStore, SnapshotStore};
use std::fs;
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{error, info};

/// A running rate limiter.
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimiterConfig,
    events: EventBus,
    flags: FeatureFlags,
    registry: Arc<BucketRegistry>,
    engine: Arc<AccountingEngine>,
    ledger: Arc<ApprovalLedger>,
    flush_task: PeriodicTask,
    sweep_task: PeriodicTask,
}

impl RateLimiter {
    /// Start with JSON snapshot files under `config.data_dir` and the system
    /// clock. Must be called from within a tokio runtime.
    pub fn start(config: RateLimiterConfig) -> Result<Self, RateLimitError> {
        config.validate()?;
        fs::create_dir_all(&config.data_dir)
            .map_err(|source| RateLimitError::Persistence { path: config.data_dir.clone(), source })?;
        let definitions = JsonFileStore::<Definitions>::new(config.buckets_path());
        let usage = JsonFileStore::<UsageSnapshot>::new(config.bucket_data_path());
        Self::start_with(config, Arc::new(SystemClock), definitions, usage)
    }

    /// Start with explicit stores and clock.
    pub fn start_with<D, U>(
        config: RateLimiterConfig,
        clock: Arc<dyn Clock>,
        definitions: D,
        usage: U,
    ) -> Result<Self, RateLimitError>
    where
        D: SnapshotStore<Definitions> + 'static,
        U: SnapshotStore<UsageSnapshot> + 'static,
    {
        config.validate()?;
        let events = EventBus::default();
        let flags =
            FeatureFlags::new(FlagSet { advanced_buckets: config.advanced_buckets }, events.clone());
        let registry = Arc::new(BucketRegistry::load(definitions, events.clone()));
        let engine = Arc::new(AccountingEngine::load(registry.clone(), usage, clock.clone()));
        let ledger = Arc::new(ApprovalLedger::with_ttl(engine.clone(), clock, config.approval_ttl_ms));

        let flush_engine = engine.clone();
        let flush_task = PeriodicTask::spawn("usage-flush", config.flush_interval(), move || {
            flush_in_background(flush_engine.clone())
        });
        let sweep_ledger = ledger.clone();
        let sweep_task = PeriodicTask::spawn("approval-sweep", config.sweep_interval(), move || {
            sweep_ledger.sweep();
            std::future::ready(())
        });

        info!(
            target: "ratekeeper::runtime",
            data_dir = %config.data_dir.display(),
            flush_interval_ms = config.flush_interval_ms,
            sweep_interval_ms = config.sweep_interval_ms,
            "rate limiter started"
        );
        Ok(Self { config, events, flags, registry, engine, ledger, flush_task, sweep_task })
    }

    pub fn config(&self) -> &RateLimiterConfig {
        &self.config
    }

    pub fn registry(&self) -> &Arc<BucketRegistry> {
        &self.registry
    }

    pub fn engine(&self) -> &Arc<AccountingEngine> {
        &self.engine
    }

    pub fn ledger(&self) -> &Arc<ApprovalLedger> {
        &self.ledger
    }

    pub fn flags(&self) -> &FeatureFlags {
        &self.flags
    }

    pub fn events(&self) -> &EventBus {
        &self.events
    }

    /// Receive every event published from now on.
    pub fn subscribe(&self) -> broadcast::Receiver<RateLimitEvent> {
        self.events.subscribe()
    }

    /// Admin handle over this limiter's state.
    pub fn admin(&self) -> BucketAdmin {
        BucketAdmin::new(self.registry.clone(), self.engine.clone(), self.flags.clone())
    }

    /// Handles for running effects.
    pub fn effects(&self) -> EffectContext {
        EffectContext::new(self.engine.clone(), self.ledger.clone(), self.events.clone())
    }

    pub fn check(&self, request: &CheckRequest) -> CheckResponse {
        self.engine.check(request)
    }

    pub fn undo(&self, approval_id: &str) -> UndoResponse {
        self.ledger.undo_approval(approval_id)
    }

    /// Stop both timers, drop all approvals, and write a final snapshot.
    ///
    /// The final write happens on the calling task once the timers are gone.
    pub async fn shutdown(self) -> Result<(), RateLimitError> {
        let Self { engine, ledger, flush_task, sweep_task, .. } = self;
        flush_task.stop().await;
        sweep_task.stop().await;
        ledger.shutdown();
        engine.flush()?;
        info!(target: "ratekeeper::runtime", "rate limiter shut down");
        Ok(())
    }
}

/// Write the usage snapshot on the blocking pool so file I/O never stalls a
/// runtime worker.
async fn flush_in_background(engine: Arc<AccountingEngine>) {
    match tokio::task::spawn_blocking(move || engine.flush()).await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!(target: "ratekeeper::runtime", error = %e, "failed to save usage snapshot"),
        Err(e) => error!(target: "ratekeeper::runtime", error = %e, "usage flush task failed"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketDefinition;
    use crate::clock::ManualClock;
    use crate::store::MemoryStore;
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;

    fn start(clock: &ManualClock) -> (RateLimiter, MemoryStore<UsageSnapshot>) {
        let usage = MemoryStore::new();
        let limiter = RateLimiter::start_with(
            RateLimiterConfig::default(),
            Arc::new(clock.clone()),
            MemoryStore::<Definitions>::new(),
            usage.clone(),
        )
        .unwrap();
        limiter
            .registry()
            .save("b", BucketDefinition::advanced("Bucket", 10.0, 1.0).with_persist(true))
            .unwrap();
        (limiter, usage)
    }

    #[tokio::test(start_paused = true)]
    async fn flush_runs_on_its_interval() {
        let clock = ManualClock::new(1_000);
        let (limiter, usage) = start(&clock);
        let saves_at_start = usage.save_count();
        limiter.check(&CheckRequest::advanced("b", "global", 3.0));

        tokio::time::sleep(Duration::from_millis(5_100)).await;
        assert_eq!(usage.save_count(), saves_at_start + 1);
        assert_eq!(usage.get().unwrap()["b"]["global"].token_count, 7.0);
        limiter.shutdown().await.unwrap();
    }

    /// Usage store whose writes take a while and report when one is running.
    #[derive(Debug, Default)]
    struct SlowStore {
        saving: AtomicBool,
        saves: AtomicUsize,
    }

    impl SnapshotStore<UsageSnapshot> for Arc<SlowStore> {
        fn load(&self) -> Result<Option<UsageSnapshot>, RateLimitError> {
            Ok(None)
        }

        fn save(&self, _: &UsageSnapshot) -> Result<(), RateLimitError> {
            self.saving.store(true, Ordering::SeqCst);
            std::thread::sleep(Duration::from_millis(200));
            self.saving.store(false, Ordering::SeqCst);
            self.saves.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    #[tokio::test(flavor = "current_thread")]
    async fn periodic_flush_does_not_block_the_runtime() {
        let store = Arc::new(SlowStore::default());
        let config = RateLimiterConfig { flush_interval_ms: 20, ..RateLimiterConfig::default() };
        let limiter = RateLimiter::start_with(
            config,
            Arc::new(SystemClock),
            MemoryStore::<Definitions>::new(),
            store.clone(),
        )
        .unwrap();

        // On a single-threaded runtime this task can only see a save in
        // flight if the write runs somewhere else.
        let seen_mid_save = tokio::time::timeout(Duration::from_secs(5), async {
            while !store.saving.load(Ordering::SeqCst) {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await;
        assert!(seen_mid_save.is_ok());
        limiter.shutdown().await.unwrap();
        assert!(store.saves.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn sweep_expires_approvals() {
        let clock = ManualClock::new(1_000);
        let (limiter, _) = start(&clock);
        limiter.ledger().record_approval("a", "b", "global", 1.0, 1);
        clock.advance(600_000);
        tokio::time::sleep(Duration::from_millis(60_100)).await;
        assert!(limiter.ledger().is_empty());
        limiter.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_clears_approvals_and_flushes() {
        let clock = ManualClock::new(1_000);
        let (limiter, usage) = start(&clock);
        limiter.check(&CheckRequest::advanced("b", "user:ann", 4.0));
        limiter.ledger().record_approval("a", "b", "user:ann", 4.0, 1);
        let ledger = limiter.ledger().clone();

        limiter.shutdown().await.unwrap();
        assert!(ledger.is_empty());
        assert_eq!(usage.get().unwrap()["b"]["user:ann"].token_count, 6.0);
    }

    #[test]
    fn invalid_config_is_rejected_before_start() {
        let cfg = RateLimiterConfig { flush_interval_ms: 0, ..RateLimiterConfig::default() };
        let err = RateLimiter::start_with(
            cfg,
            Arc::new(ManualClock::new(0)),
            MemoryStore::<Definitions>::new(),
            MemoryStore::<UsageSnapshot>::new(),
        )
        .unwrap_err();
        assert!(matches!(err, RateLimitError::Config(_)));
    }
}
