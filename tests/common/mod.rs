#![allow(dead_code)]

use ratekeeper::{AccountingEngine, BucketDefinition, BucketRegistry, ManualClock, MemoryStore, UsageSnapshot};
use std::sync::{Arc, Mutex};
use tracing_subscriber::fmt::writer::BoxMakeWriter;
use tracing_subscriber::fmt::MakeWriter;

pub const T0: u64 = 1_700_000_000_000;

/// Engine over an in-memory registry holding `buckets`, driven by a manual clock.
pub fn engine_with(buckets: &[(&str, BucketDefinition)]) -> (Arc<AccountingEngine>, ManualClock) {
    let registry = Arc::new(BucketRegistry::in_memory());
    for (id, def) in buckets {
        registry.save(id, def.clone()).expect("valid bucket");
    }
    let clock = ManualClock::new(T0);
    let engine = AccountingEngine::load(registry, MemoryStore::<UsageSnapshot>::new(), Arc::new(clock.clone()));
    (Arc::new(engine), clock)
}

/// Bucket used by most scenarios: capacity 10, 1 token/s, 5 tokens to start.
pub fn scenario_bucket() -> BucketDefinition {
    BucketDefinition::advanced("Scenario", 10.0, 1.0).with_start_tokens(5.0)
}

#[derive(Clone, Default)]
pub struct SharedWriter(Arc<Mutex<Vec<u8>>>);

impl SharedWriter {
    pub fn contents(&self) -> String {
        String::from_utf8(self.0.lock().unwrap().clone()).unwrap()
    }
}

impl<'a> MakeWriter<'a> for SharedWriter {
    type Writer = SharedGuard;
    fn make_writer(&'a self) -> Self::Writer {
        SharedGuard(self.0.clone())
    }
}

pub struct SharedGuard(Arc<Mutex<Vec<u8>>>);

impl std::io::Write for SharedGuard {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }
    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// Run `f` with a thread-local subscriber and return everything it logged.
pub fn capture_logs<F: FnOnce()>(f: F) -> String {
    let writer = SharedWriter::default();
    let subscriber = tracing_subscriber::fmt()
        .with_writer(BoxMakeWriter::new(writer.clone()))
        .with_max_level(tracing::Level::DEBUG)
        .with_target(true)
        .with_ansi(false)
        .without_time()
        .finish();
    tracing::subscriber::with_default(subscriber, f);
    writer.contents()
}
