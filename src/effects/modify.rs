//! Modify adapter: adjust or delete usage entries of a bucket.

use super::EffectContext;
use crate::bucket::{BucketKey, KeySelector, UsageEntry};
use crate::engine::BucketUsage;
use crate::error::EffectError;
use serde::{Deserialize, Serialize};
use std::fmt;
use tracing::{debug, error};

/// Which keys a modification applies to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifyKeyType {
    #[default]
    User,
    /// Every existing `user:` key.
    AllUsers,
    Global,
    Custom,
    /// Every existing key.
    AllKeys,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModifyAction {
    #[default]
    Modify,
    Delete,
}

impl fmt::Display for ModifyAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Modify => "modify",
            Self::Delete => "delete",
        })
    }
}

/// Per-field operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum FieldOp {
    #[default]
    NoChange,
    Add,
    Set,
}

impl FieldOp {
    /// New value of a field currently at `current`.
    pub fn apply(self, current: f64, value: f64) -> f64 {
        match self {
            Self::NoChange => current,
            Self::Add => current + value,
            Self::Set => value,
        }
    }
}

/// Operator-configured options of a modification.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ModifyEffect {
    pub bucket_id: String,
    pub key_type: ModifyKeyType,
    pub user_key: String,
    pub custom_key: String,
    pub action: ModifyAction,
    /// Create a missing single key instead of failing.
    pub create_missing: bool,
    pub current_token_operation: FieldOp,
    pub current_token_value: f64,
    pub lifetime_token_operation: FieldOp,
    pub lifetime_token_value: f64,
    pub invocation_operation: FieldOp,
    pub invocation_value: f64,
    pub last_updated_operation: FieldOp,
    /// Seconds; stored as milliseconds.
    pub last_updated_value: f64,
}

/// Result of a modification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModifyOutput {
    /// At least one key was changed or deleted.
    pub success: bool,
    /// The bucket's usage after the change.
    pub bucket_data: BucketUsage,
}

impl ModifyEffect {
    fn selected_keys(&self, ctx: &EffectContext) -> Result<Vec<String>, EffectError> {
        let bucket_id = &self.bucket_id;
        let single = match self.key_type {
            ModifyKeyType::AllUsers | ModifyKeyType::AllKeys => {
                let (selector, what) = if self.key_type == ModifyKeyType::AllUsers {
                    (KeySelector::AllUsers, "user keys")
                } else {
                    (KeySelector::AllKeys, "keys")
                };
                let keys = ctx.engine.list_keys_matching(bucket_id, &selector);
                if keys.is_empty() {
                    return Err(EffectError::NonCritical(format!(
                        "No {what} to {} found in bucket {bucket_id}.",
                        self.action
                    )));
                }
                return Ok(keys);
            }
            ModifyKeyType::User if self.user_key.is_empty() => {
                return Err(EffectError::NonCritical(
                    "User key is required for 'user' key type.".to_string(),
                ));
            }
            ModifyKeyType::Custom if self.custom_key.is_empty() => {
                return Err(EffectError::NonCritical(
                    "Custom key is required for 'custom' key type.".to_string(),
                ));
            }
            ModifyKeyType::User => BucketKey::User(self.user_key.clone()),
            ModifyKeyType::Custom => BucketKey::Custom(self.custom_key.clone()),
            ModifyKeyType::Global => BucketKey::Global,
        }
        .to_string();

        if !self.create_missing && !ctx.engine.has_key(bucket_id, &single) {
            return Err(EffectError::NonCritical(format!(
                "No keys found to {} in bucket {bucket_id} with key {single}.",
                self.action
            )));
        }
        Ok(vec![single])
    }

    fn apply(&self, entry: &mut UsageEntry) {
        entry.token_count = self.current_token_operation.apply(entry.token_count, self.current_token_value);
        entry.lifetime_token_count =
            self.lifetime_token_operation.apply(entry.lifetime_token_count, self.lifetime_token_value);
        // Float-to-int casts saturate, so negative results floor at 0.
        entry.invocation_count =
            self.invocation_operation.apply(entry.invocation_count as f64, self.invocation_value) as u64;
        entry.last_updated = self
            .last_updated_operation
            .apply(entry.last_updated as f64, 1000.0 * self.last_updated_value) as u64;
    }

    /// Apply the modification.
    ///
    /// Empty selections are [`EffectError::NonCritical`]; modifying keys of a
    /// bucket that does not exist is [`EffectError::Critical`].
    pub fn run(&self, ctx: &EffectContext) -> Result<ModifyOutput, EffectError> {
        let keys = self.selected_keys(ctx)?;

        if self.action == ModifyAction::Delete {
            let deleted = keys.iter().filter(|key| ctx.engine.delete_key(&self.bucket_id, key)).count();
            debug!(target: "ratekeeper::effects", bucket_id = %self.bucket_id, deleted, "deleted bucket keys");
            return Ok(ModifyOutput {
                success: deleted > 0,
                bucket_data: ctx.engine.get_all_bucket_data(&self.bucket_id),
            });
        }

        let Some(def) = ctx.engine.registry().get(&self.bucket_id) else {
            error!(target: "ratekeeper::effects", bucket_id = %self.bucket_id, "bucket not found for modification");
            return Err(EffectError::Critical(format!(
                "Bucket not found for modification (bucketId: {}).",
                self.bucket_id
            )));
        };

        for key in &keys {
            let entry = ctx.engine.update_key(&self.bucket_id, &def, key, |entry| self.apply(entry));
            debug!(
                target: "ratekeeper::effects",
                bucket_id = %self.bucket_id,
                key = %key,
                tokens = entry.token_count,
                lifetime_tokens = entry.lifetime_token_count,
                invocations = entry.invocation_count,
                last_updated = entry.last_updated,
                "modified bucket data"
            );
        }

        Ok(ModifyOutput { success: !keys.is_empty(), bucket_data: ctx.engine.get_all_bucket_data(&self.bucket_id) })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::effects::test_support::{context, T0};
    use crate::protocol::CheckRequest;

    fn seeded() -> EffectContext {
        let (ctx, _) = context();
        for key in ["user:ann", "user:bob", "custom:x"] {
            ctx.engine.check(&CheckRequest::advanced("b", key, 1.0));
        }
        ctx
    }

    #[test]
    fn set_and_add_apply_per_field() {
        let ctx = seeded();
        let eff = ModifyEffect {
            bucket_id: "b".into(),
            key_type: ModifyKeyType::User,
            user_key: "ann".into(),
            current_token_operation: FieldOp::Set,
            current_token_value: 8.0,
            invocation_operation: FieldOp::Add,
            invocation_value: -5.0,
            last_updated_operation: FieldOp::Set,
            last_updated_value: 1_700_000_100.0,
            ..ModifyEffect::default()
        };
        let out = eff.run(&ctx).unwrap();
        assert!(out.success);
        let entry = out.bucket_data["user:ann"];
        assert_eq!(entry.token_count, 8.0);
        assert_eq!(entry.invocation_count, 0);
        assert_eq!(entry.last_updated, T0 + 100_000);
        // Untouched keys keep their state.
        assert_eq!(out.bucket_data["user:bob"].token_count, 4.0);
    }

    #[test]
    fn all_users_skips_other_keys() {
        let ctx = seeded();
        let eff = ModifyEffect {
            bucket_id: "b".into(),
            key_type: ModifyKeyType::AllUsers,
            lifetime_token_operation: FieldOp::Add,
            lifetime_token_value: 10.0,
            ..ModifyEffect::default()
        };
        let out = eff.run(&ctx).unwrap();
        assert_eq!(out.bucket_data["user:ann"].lifetime_token_count, 15.0);
        assert_eq!(out.bucket_data["user:bob"].lifetime_token_count, 15.0);
        assert_eq!(out.bucket_data["custom:x"].lifetime_token_count, 5.0);
    }

    #[test]
    fn missing_key_needs_create_missing() {
        let ctx = seeded();
        let eff = ModifyEffect { bucket_id: "b".into(), key_type: ModifyKeyType::Global, ..ModifyEffect::default() };
        let err = eff.run(&ctx).unwrap_err();
        assert_eq!(err, EffectError::NonCritical("No keys found to modify in bucket b with key global.".into()));

        let create = ModifyEffect { create_missing: true, ..eff };
        let out = create.run(&ctx).unwrap();
        assert_eq!(out.bucket_data["global"].token_count, 5.0);
    }

    #[test]
    fn empty_selections_are_non_critical() {
        let (ctx, _) = context();
        let eff = ModifyEffect { bucket_id: "b".into(), key_type: ModifyKeyType::AllKeys, ..ModifyEffect::default() };
        assert_eq!(
            eff.run(&ctx).unwrap_err(),
            EffectError::NonCritical("No keys to modify found in bucket b.".into())
        );
        let eff = ModifyEffect { bucket_id: "b".into(), key_type: ModifyKeyType::Custom, ..ModifyEffect::default() };
        assert!(!eff.run(&ctx).unwrap_err().is_critical());
    }

    #[test]
    fn modifying_unknown_bucket_is_critical() {
        let (ctx, _) = context();
        let eff = ModifyEffect {
            bucket_id: "gone".into(),
            key_type: ModifyKeyType::Global,
            create_missing: true,
            ..ModifyEffect::default()
        };
        assert!(eff.run(&ctx).unwrap_err().is_critical());
    }

    #[test]
    fn delete_removes_selected_keys() {
        let ctx = seeded();
        let eff = ModifyEffect {
            bucket_id: "b".into(),
            key_type: ModifyKeyType::AllUsers,
            action: ModifyAction::Delete,
            ..ModifyEffect::default()
        };
        let out = eff.run(&ctx).unwrap();
        assert!(out.success);
        assert_eq!(out.bucket_data.keys().collect::<Vec<_>>(), vec!["custom:x"]);
    }

    #[test]
    fn options_use_host_field_names() {
        let eff: ModifyEffect = serde_json::from_value(serde_json::json!({
            "bucketId": "b",
            "keyType": "allkeys",
            "action": "delete",
            "currentTokenOperation": "noChange",
            "invocationOperation": "set",
            "invocationValue": 2
        }))
        .unwrap();
        assert_eq!(eff.key_type, ModifyKeyType::AllKeys);
        assert_eq!(eff.action, ModifyAction::Delete);
        assert_eq!(eff.invocation_operation, FieldOp::Set);
    }
}
