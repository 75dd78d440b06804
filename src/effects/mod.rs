//! Request adapters invoked by automation triggers.
//!
//! Each effect is a plain serde model (the options an operator configured)
//! with a `run` method that turns one trigger into calls on the engine and
//! the ledger, then shapes the outputs the host exposes as variables.
//!
//! - [`CheckEffect`]: gate an action on a bucket, optionally recording an
//!   approval for a later undo.
//! - [`ModifyEffect`]: adjust or delete usage entries.
//! - [`UndoEffect`]: reverse a recorded approval.

pub mod check;
pub mod modify;
pub mod undo;

pub use check::{CheckEffect, CheckKeyType, CheckOutput, ExecutionControl, TriggerContext};
pub use modify::{FieldOp, ModifyAction, ModifyEffect, ModifyKeyType, ModifyOutput};
pub use undo::{UndoEffect, UndoOutput, EMPTY_APPROVAL_ID};

use crate::engine::AccountingEngine;
use crate::events::EventBus;
use crate::ledger::ApprovalLedger;
use std::sync::Arc;

/// Limit on nested `LimitExceeded` events before they are suppressed.
pub const MAX_EVENT_STACK_DEPTH: u32 = 10;

/// Shared handles every effect runs against.
#[derive(Debug, Clone)]
pub struct EffectContext {
    pub engine: Arc<AccountingEngine>,
    pub ledger: Arc<ApprovalLedger>,
    pub events: EventBus,
}

impl EffectContext {
    pub fn new(engine: Arc<AccountingEngine>, ledger: Arc<ApprovalLedger>, events: EventBus) -> Self {
        Self { engine, ledger, events }
    }
}
