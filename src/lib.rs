#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # ratekeeper
//!
//! In-process token-bucket rate limiting for automation hosts: named buckets,
//! per-key usage accounting with lazy refill, and single-use approvals that
//! let a consumption be undone.
//!
//! ## Features
//!
//! - **Bucket registry** with validated, write-through admin CRUD
//! - **Accounting engine** with capacity and lifetime caps, inquiries, and
//!   invocation limits
//! - **Approval ledger** with time-boxed, single-use undo
//! - **Snapshot persistence** to pretty-printed JSON files
//! - **Effect adapters** for check, modify, and undo triggers
//! - **Tower middleware** gating any service on a bucket
//!
//! ## Quick Start
//!
//! ```rust
//! use ratekeeper::{AccountingEngine, BucketDefinition, BucketRegistry, CheckRequest};
//! use ratekeeper::{MemoryStore, SystemClock, UsageSnapshot};
//! use std::sync::Arc;
//!
//! let registry = Arc::new(BucketRegistry::in_memory());
//! registry
//!     .save("chat", BucketDefinition::advanced("Chat", 10.0, 1.0).with_start_tokens(5.0))
//!     .unwrap();
//!
//! let engine = AccountingEngine::load(
//!     registry,
//!     MemoryStore::<UsageSnapshot>::new(),
//!     Arc::new(SystemClock),
//! );
//! let response = engine.check(&CheckRequest::advanced("chat", "user:alice", 2.0));
//! assert!(response.success);
//! assert_eq!(response.remaining, -1);
//! ```

pub mod admin;
pub mod bucket;
pub mod clock;
pub mod config;
pub mod effects;
pub mod engine;
pub mod error;
pub mod events;
pub mod flags;
pub mod layer;
pub mod ledger;
pub mod prelude;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod scheduler;
pub mod store;

// Re-exports
pub use admin::BucketAdmin;
pub use bucket::{AutoBucketParams, BucketDefinition, BucketKey, BucketKind, KeySelector, UsageEntry};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::RateLimiterConfig;
pub use engine::{AccountingEngine, BucketUsage, UsageSnapshot};
pub use error::{BucketDataError, ConfigError, DefinitionError, EffectError, RateLimitError};
pub use events::{EventBus, RateLimitEvent};
pub use flags::{FeatureFlags, FlagSet};
pub use layer::{CheckLayer, CheckService, LayerError};
pub use ledger::{ApprovalEntry, ApprovalLedger};
pub use protocol::{CheckRequest, CheckResponse, RejectReason, UndoDetails, UndoFailure, UndoResponse};
pub use registry::{BucketRegistry, BucketWithId, Definitions};
pub use runtime::RateLimiter;
pub use scheduler::PeriodicTask;
pub use store::{JsonFileStore, MemoryStore, SnapshotStore};
