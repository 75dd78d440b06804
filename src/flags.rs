//! Live-updatable feature flags.
//!
//! Reads are lock-free (`ArcSwap`); every change is announced on the
//! [`EventBus`] so UIs can show or hide advanced bucket management.

use crate::events::{EventBus, RateLimitEvent};
use arc_swap::ArcSwap;
use std::sync::Arc;
use tracing::info;

/// Snapshot of all flags.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FlagSet {
    /// Expose durable, admin-managed buckets.
    pub advanced_buckets: bool,
}

/// Shared flag handle. Clones observe the same values.
#[derive(Debug, Clone)]
pub struct FeatureFlags {
    current: Arc<ArcSwap<FlagSet>>,
    events: EventBus,
}

impl FeatureFlags {
    pub fn new(initial: FlagSet, events: EventBus) -> Self {
        Self { current: Arc::new(ArcSwap::from_pointee(initial)), events }
    }

    /// Current values.
    pub fn snapshot(&self) -> FlagSet {
        **self.current.load()
    }

    pub fn advanced_buckets_enabled(&self) -> bool {
        self.current.load().advanced_buckets
    }

    /// Toggle advanced buckets and broadcast the new value.
    pub fn set_advanced_buckets(&self, enabled: bool) {
        self.current.store(Arc::new(FlagSet { advanced_buckets: enabled }));
        info!(target: "ratekeeper::flags", enabled, "advanced buckets feature toggled");
        self.events.publish(RateLimitEvent::AdvancedBucketsToggled { enabled });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn toggling_broadcasts_new_value() {
        let bus = EventBus::new(4);
        let mut rx = bus.subscribe();
        let flags = FeatureFlags::new(FlagSet::default(), bus);
        assert!(!flags.advanced_buckets_enabled());

        let other = flags.clone();
        other.set_advanced_buckets(true);

        assert!(flags.advanced_buckets_enabled());
        assert_eq!(flags.snapshot(), FlagSet { advanced_buckets: true });
        assert_eq!(rx.recv().await.unwrap(), RateLimitEvent::AdvancedBucketsToggled { enabled: true });
    }
}
