//! Background periodic tasks with deterministic shutdown.
//!
//! Used for the usage snapshot flush and the approval expiry sweep. Each task
//! is one tokio task driven by [`tokio::time::interval`]; missed ticks are
//! skipped rather than bunched up, and [`PeriodicTask::stop`] waits for the
//! loop (including a tick in progress) to exit so nothing fires after
//! teardown.

use std::future::Future;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, warn};

/// A closure run on a fixed period until stopped.
#[derive(Debug)]
pub struct PeriodicTask {
    name: &'static str,
    shutdown: watch::Sender<bool>,
    handle: Option<JoinHandle<()>>,
}

impl PeriodicTask {
    /// Run the future returned by `tick` every `period`, first after one
    /// full period. Ticks never overlap.
    ///
    /// Must be called from within a tokio runtime.
    pub fn spawn<F, Fut>(name: &'static str, period: Duration, mut tick: F) -> Self
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let (shutdown, mut stop_rx) = watch::channel(false);
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately.
            interval.tick().await;
            loop {
                tokio::select! {
                    _ = interval.tick() => tick().await,
                    changed = stop_rx.changed() => {
                        if changed.is_err() || *stop_rx.borrow() {
                            break;
                        }
                    }
                }
            }
            debug!(target: "ratekeeper::scheduler", task = name, "periodic task stopped");
        });
        debug!(target: "ratekeeper::scheduler", task = name, period_ms = period.as_millis() as u64, "periodic task started");
        Self { name, shutdown, handle: Some(handle) }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Whether the loop is still alive.
    pub fn is_running(&self) -> bool {
        self.handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// Signal the loop to exit and wait for it.
    pub async fn stop(mut self) {
        let _ = self.shutdown.send(true);
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                warn!(target: "ratekeeper::scheduler", task = self.name, error = %e, "periodic task ended abnormally");
            }
        }
    }
}

impl Drop for PeriodicTask {
    fn drop(&mut self) {
        let _ = self.shutdown.send(true);
    }
}
