//! Undo adapter: reverse a recorded approval.

use super::EffectContext;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Failure reason reported when no approval id was supplied.
pub const EMPTY_APPROVAL_ID: &str = "empty_approval_id";

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UndoEffect {
    pub approval_id: String,
}

/// Result of an undo; `reason` is empty on success.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UndoOutput {
    pub success: bool,
    pub reason: String,
}

impl UndoEffect {
    pub fn new(approval_id: impl Into<String>) -> Self {
        Self { approval_id: approval_id.into() }
    }

    pub fn run(&self, ctx: &EffectContext) -> UndoOutput {
        let approval_id = self.approval_id.trim();
        if approval_id.is_empty() {
            warn!(target: "ratekeeper::effects", "undo called with empty approval id");
            return UndoOutput { success: false, reason: EMPTY_APPROVAL_ID.to_string() };
        }

        let response = ctx.ledger.undo_approval(approval_id);
        if response.success {
            debug!(target: "ratekeeper::effects", approval_id, "undo effect successful");
            return UndoOutput { success: true, reason: String::new() };
        }
        let reason = response.reason.map_or("unknown", |r| r.as_str());
        debug!(target: "ratekeeper::effects", approval_id, reason, "undo effect failed");
        UndoOutput { success: false, reason: reason.to_string() }
    }
}
