//! Check adapter: gate a triggered action on a bucket.

use super::{EffectContext, MAX_EVENT_STACK_DEPTH};
use crate::bucket::{BucketKey, BucketKind};
use crate::error::EffectError;
use crate::events::{LimitApprovedEvent, LimitExceededEvent, RateLimitEvent};
use crate::protocol::{CheckRequest, CheckResponse, RejectReason};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, warn};
use uuid::Uuid;

/// Which key a check is charged to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CheckKeyType {
    /// The triggering user.
    #[default]
    User,
    Global,
    /// `custom:<key>`.
    Custom,
}

/// Operator-configured options of a check.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CheckEffect {
    pub bucket_id: String,
    pub bucket_type: BucketKind,
    /// Capacity when `bucket_type` is `simple`.
    pub bucket_size: f64,
    /// Refill rate when `bucket_type` is `simple`.
    pub bucket_rate: f64,
    pub key_type: CheckKeyType,
    /// Custom key value, used with [`CheckKeyType::Custom`].
    pub key: String,
    pub tokens: f64,
    pub inquiry: bool,
    pub enforce_streamer: bool,
    pub enforce_bot: bool,
    pub stop_execution: bool,
    pub stop_execution_bubble: bool,
    /// Publish a `LimitExceeded` event on rejection.
    pub trigger_event: bool,
    #[serde(rename = "rateLimitMetadata")]
    pub metadata_key: String,
    pub invocation_limit: bool,
    pub invocation_limit_value: u64,
    /// Record an approval so the consumption can be undone later.
    pub record_approval: bool,
}

impl Default for CheckEffect {
    fn default() -> Self {
        Self {
            bucket_id: String::new(),
            bucket_type: BucketKind::Advanced,
            bucket_size: 0.0,
            bucket_rate: 0.0,
            key_type: CheckKeyType::User,
            key: String::new(),
            tokens: 10.0,
            inquiry: false,
            enforce_streamer: false,
            enforce_bot: false,
            stop_execution: true,
            stop_execution_bubble: false,
            trigger_event: false,
            metadata_key: String::new(),
            invocation_limit: false,
            invocation_limit_value: 0,
            record_approval: false,
        }
    }
}

/// What the host knows about the trigger that fired the effect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TriggerContext {
    pub username: String,
    /// The user is the streamer account.
    pub streamer: bool,
    /// The user is the bot account.
    pub bot: bool,
    /// Depth of nested rate-limit events that led here.
    pub stack_depth: u32,
    pub message_id: String,
    pub trigger_type: String,
    /// Username from the original event, when the trigger relays one.
    pub original_username: Option<String>,
    pub metadata: JsonValue,
}

impl TriggerContext {
    fn trigger_username(&self) -> String {
        self.original_username.clone().unwrap_or_else(|| self.username.clone())
    }
}

/// Whether the host should stop running the remaining effects.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionControl {
    pub stop: bool,
    pub bubble_stop: bool,
}

/// Result of a check, exposed to the host as output variables.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckOutput {
    pub allowed: bool,
    pub next: f64,
    pub remaining: i64,
    pub invocation: u64,
    pub error_message: String,
    pub reject_reason: Option<RejectReason>,
    pub approval_id: Option<String>,
    pub execution: ExecutionControl,
    pub request: CheckRequest,
    pub response: CheckResponse,
}

impl CheckEffect {
    /// Configuration problems that make the effect unusable.
    pub fn validate(&self) -> Vec<String> {
        let mut errors = Vec::new();
        if self.bucket_id.is_empty() {
            errors.push("Bucket is required".to_string());
        }
        if self.key_type == CheckKeyType::Custom && self.key.is_empty() {
            errors.push("Custom Key is required".to_string());
        }
        if self.tokens <= 0.0 || self.tokens.is_nan() {
            errors.push("Tokens must be greater than 0".to_string());
        }
        errors
    }

    fn bucket_key(&self, trigger: &TriggerContext) -> BucketKey {
        match self.key_type {
            CheckKeyType::User => BucketKey::User(trigger.username.clone()),
            CheckKeyType::Global => BucketKey::Global,
            CheckKeyType::Custom => BucketKey::Custom(self.key.clone()),
        }
    }

    fn request(&self, key: String, inquiry: bool) -> CheckRequest {
        let simple = self.bucket_type == BucketKind::Simple;
        CheckRequest {
            bucket_type: self.bucket_type,
            bucket_id: self.bucket_id.clone(),
            bucket_size: simple.then_some(self.bucket_size),
            bucket_rate: simple.then_some(self.bucket_rate),
            key,
            token_request: self.tokens,
            inquiry,
            invocation_limit: self.invocation_limit,
            invocation_limit_value: self.invocation_limit_value,
        }
    }

    /// Run the check for one trigger.
    ///
    /// Exempt streamer/bot users always pass, but their check still runs as
    /// an inquiry so the key's state is refreshed.
    pub fn run(&self, trigger: &TriggerContext, ctx: &EffectContext) -> Result<CheckOutput, EffectError> {
        let problems = self.validate();
        if !problems.is_empty() {
            return Err(EffectError::Critical(problems.join("; ")));
        }

        let key = self.bucket_key(trigger).to_string();
        let always_allow =
            (!self.enforce_streamer && trigger.streamer) || (!self.enforce_bot && trigger.bot);
        if always_allow {
            debug!(
                target: "ratekeeper::effects",
                bucket_id = %self.bucket_id,
                key = %key,
                streamer = trigger.streamer,
                bot = trigger.bot,
                "rate limit ignored for exempt user"
            );
        }

        let request = self.request(key.clone(), always_allow || self.inquiry);
        let response = ctx.engine.check(&request);
        let mut output = CheckOutput {
            allowed: always_allow || response.success,
            next: response.next,
            remaining: response.remaining,
            invocation: response.invocation,
            error_message: response.error_message.clone().unwrap_or_default(),
            reject_reason: response.reject_reason,
            approval_id: None,
            execution: ExecutionControl::default(),
            request,
            response,
        };

        if output.allowed {
            debug!(
                target: "ratekeeper::effects",
                bucket_id = %self.bucket_id,
                key = %key,
                always_allow,
                success = output.response.success,
                next = output.next,
                remaining = output.remaining,
                invocation = output.invocation,
                "rate limit pass"
            );
            let consumed = output.response.success && !output.request.inquiry;
            if self.record_approval && consumed {
                let approval_id = Uuid::new_v4().to_string();
                ctx.ledger.record_approval(&approval_id, &self.bucket_id, &key, self.tokens, 1);
                output.approval_id = Some(approval_id);
            }
            if self.trigger_event || output.approval_id.is_some() {
                ctx.events.publish(RateLimitEvent::Approved(LimitApprovedEvent {
                    always_allow,
                    success: output.response.success,
                    approval_id: output.approval_id.clone(),
                    bucket_id: self.bucket_id.clone(),
                    bucket_key: key,
                    message_id: trigger.message_id.clone(),
                    trigger_type: trigger.trigger_type.clone(),
                    trigger_username: trigger.trigger_username(),
                    trigger_metadata: trigger.metadata.clone(),
                    username: trigger.username.clone(),
                }));
            }
            return Ok(output);
        }

        debug!(
            target: "ratekeeper::effects",
            bucket_id = %self.bucket_id,
            key = %key,
            next = output.next,
            remaining = output.remaining,
            invocation = output.invocation,
            reason = ?output.reject_reason,
            "rate limit fail"
        );
        output.execution = ExecutionControl { stop: self.stop_execution, bubble_stop: self.stop_execution_bubble };

        if self.trigger_event {
            if trigger.stack_depth >= MAX_EVENT_STACK_DEPTH {
                warn!(
                    target: "ratekeeper::effects",
                    bucket_id = %self.bucket_id,
                    key = %key,
                    stack_depth = trigger.stack_depth,
                    "stack depth exceeded for rate limit event"
                );
                return Ok(output);
            }
            ctx.events.publish(RateLimitEvent::LimitExceeded(LimitExceededEvent {
                bucket_id: self.bucket_id.clone(),
                bucket_key: key,
                error_message: output.response.error_message.clone(),
                inquiry: self.inquiry,
                invocation: output.invocation,
                invocation_limit: self.invocation_limit,
                invocation_limit_value: self.invocation_limit_value,
                message_id: trigger.message_id.clone(),
                metadata_key: self.metadata_key.clone(),
                next: output.next,
                reject_reason: output.reject_reason,
                remaining: output.remaining,
                stack_depth: trigger.stack_depth + 1,
                tokens: self.tokens,
                trigger_type: trigger.trigger_type.clone(),
                trigger_username: trigger.trigger_username(),
                trigger_metadata: trigger.metadata.clone(),
                username: trigger.username.clone(),
            }));
        }
        Ok(output)
    }
}
