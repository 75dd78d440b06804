//! Bucket configuration and per-key usage state.
//!
//! A [`BucketDefinition`] describes one logical rate limit. Each bucket is
//! partitioned by string keys (see [`BucketKey`]), and every key owns a
//! [`UsageEntry`] holding its current balance and counters.
//!
//! Definitions serialize with the field names used by the on-disk
//! `buckets.json` file (`maxTokens`, `persistBucket`, ...). Numeric fields
//! also accept numeric strings, since admin forms tend to submit them that way.

use serde::de::{self, Deserializer};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Prefix for per-user keys.
pub const USER_KEY_PREFIX: &str = "user:";
/// Prefix for caller-defined keys.
pub const CUSTOM_KEY_PREFIX: &str = "custom:";
/// Key shared by every caller of a bucket.
pub const GLOBAL_KEY: &str = "global";

/// How a bucket came to exist.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BucketKind {
    /// Synthesized on first use from caller-supplied size/rate. Never persisted.
    #[default]
    Simple,
    /// Durable, admin-managed definition.
    Advanced,
}

/// Parameters used to auto-instantiate a `simple` bucket.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AutoBucketParams {
    /// Capacity and starting fill.
    pub bucket_size: f64,
    /// Refill rate in tokens per second.
    pub bucket_rate: f64,
}

/// Configuration of one named rate limit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "RawBucketDefinition", into = "RawBucketDefinition")]
pub struct BucketDefinition {
    /// Display name; unique across buckets (case-insensitive, trimmed).
    pub name: String,
    /// Whether the bucket is synthesized or admin-managed.
    pub kind: BucketKind,
    /// Maximum token balance per key.
    pub capacity: f64,
    /// Tokens added per second.
    pub refill_rate: f64,
    /// Initial fill of a new key, clamped to `capacity`.
    pub start_tokens: f64,
    /// Ceiling on cumulative tokens ever granted to one key.
    pub lifetime_cap: Option<f64>,
    /// Whether usage state survives a restart.
    pub persist: bool,
    /// Measure refill for new keys from engine start rather than first use.
    pub fill_from_start: bool,
    /// Honor persisted `lastUpdated` on load so downtime counts toward refill.
    pub fill_across_restarts: bool,
}

impl BucketDefinition {
    /// An admin-managed bucket that starts full and has no lifetime cap.
    pub fn advanced(name: impl Into<String>, capacity: f64, refill_rate: f64) -> Self {
        Self {
            name: name.into(),
            kind: BucketKind::Advanced,
            capacity,
            refill_rate,
            start_tokens: capacity,
            lifetime_cap: None,
            persist: false,
            fill_from_start: false,
            fill_across_restarts: false,
        }
    }

    /// The ephemeral definition synthesized for an unknown id.
    pub fn simple(id: impl Into<String>, params: AutoBucketParams) -> Self {
        Self {
            name: id.into(),
            kind: BucketKind::Simple,
            capacity: params.bucket_size,
            refill_rate: params.bucket_rate,
            start_tokens: params.bucket_size,
            lifetime_cap: None,
            persist: false,
            fill_from_start: true,
            fill_across_restarts: false,
        }
    }

    /// Override the initial fill.
    pub fn with_start_tokens(mut self, start_tokens: f64) -> Self {
        self.start_tokens = start_tokens;
        self
    }

    /// Cap the cumulative tokens a single key can ever receive. A cap of 0
    /// or less means no cap, matching the persisted form.
    pub fn with_lifetime_cap(mut self, cap: f64) -> Self {
        self.lifetime_cap = (cap > 0.0).then_some(cap);
        self
    }

    /// Toggle persistence of usage state.
    pub fn with_persist(mut self, persist: bool) -> Self {
        self.persist = persist;
        self
    }

    /// Toggle fill-from-start semantics.
    pub fn with_fill_from_start(mut self, fill_from_start: bool) -> Self {
        self.fill_from_start = fill_from_start;
        self
    }

    /// Toggle whether refill catches up across restarts.
    pub fn with_fill_across_restarts(mut self, fill_across_restarts: bool) -> Self {
        self.fill_across_restarts = fill_across_restarts;
        self
    }

    /// Balance given to a key the first time it is seen.
    pub fn initial_tokens(&self) -> f64 {
        self.capacity.min(self.start_tokens)
    }

    /// True for synthesized buckets.
    pub fn is_simple(&self) -> bool {
        self.kind == BucketKind::Simple
    }
}

/// On-disk shape of a definition.
#[derive(Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawBucketDefinition {
    #[serde(default)]
    name: String,
    #[serde(rename = "type", default)]
    kind: BucketKind,
    #[serde(default, deserialize_with = "lenient_f64")]
    start_tokens: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    max_tokens: f64,
    #[serde(default, deserialize_with = "lenient_f64")]
    refill_rate: f64,
    #[serde(default)]
    lifetime_max_tokens: bool,
    #[serde(default, deserialize_with = "lenient_f64")]
    lifetime_max_tokens_value: f64,
    #[serde(default)]
    persist_bucket: bool,
    #[serde(default)]
    fill_from_start: bool,
    #[serde(default)]
    fill_bucket_across_restarts: bool,
}

impl From<RawBucketDefinition> for BucketDefinition {
    fn from(raw: RawBucketDefinition) -> Self {
        // An enabled cap of 0 has always meant "no effective cap".
        let lifetime_cap = (raw.lifetime_max_tokens && raw.lifetime_max_tokens_value > 0.0)
            .then_some(raw.lifetime_max_tokens_value);
        Self {
            name: raw.name,
            kind: raw.kind,
            capacity: raw.max_tokens,
            refill_rate: raw.refill_rate,
            start_tokens: raw.start_tokens,
            lifetime_cap,
            persist: raw.persist_bucket,
            fill_from_start: raw.fill_from_start,
            fill_across_restarts: raw.fill_bucket_across_restarts,
        }
    }
}

impl From<BucketDefinition> for RawBucketDefinition {
    fn from(def: BucketDefinition) -> Self {
        Self {
            name: def.name,
            kind: def.kind,
            start_tokens: def.start_tokens,
            max_tokens: def.capacity,
            refill_rate: def.refill_rate,
            lifetime_max_tokens: def.lifetime_cap.is_some(),
            lifetime_max_tokens_value: def.lifetime_cap.unwrap_or(0.0),
            persist_bucket: def.persist,
            fill_from_start: def.fill_from_start,
            fill_bucket_across_restarts: def.fill_across_restarts,
        }
    }
}

fn lenient_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum NumberOrString {
        Number(f64),
        Text(String),
    }

    match NumberOrString::deserialize(deserializer)? {
        NumberOrString::Number(n) => Ok(n),
        NumberOrString::Text(s) => {
            let trimmed = s.trim();
            if trimmed.is_empty() {
                return Ok(0.0);
            }
            trimmed
                .parse::<f64>()
                .map_err(|_| de::Error::custom(format!("expected a number, got {s:?}")))
        }
    }
}

/// Usage state of one key within one bucket.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UsageEntry {
    /// Current balance.
    pub token_count: f64,
    /// Cumulative tokens granted (initial fill plus refills).
    pub lifetime_token_count: f64,
    /// Successful non-inquiry consumptions.
    pub invocation_count: u64,
    /// Epoch milliseconds of the last refill computation; 0 means unset.
    pub last_updated: u64,
}

/// Typed view of the string key namespace.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketKey {
    /// Shared by every caller.
    Global,
    /// One key per user name.
    User(String),
    /// Caller-defined partition.
    Custom(String),
}

impl BucketKey {
    /// Parse the stored string form. Unprefixed strings other than `global`
    /// are not part of the namespace and yield `None`.
    pub fn parse(raw: &str) -> Option<Self> {
        if raw == GLOBAL_KEY {
            return Some(Self::Global);
        }
        if let Some(user) = raw.strip_prefix(USER_KEY_PREFIX) {
            return Some(Self::User(user.to_string()));
        }
        raw.strip_prefix(CUSTOM_KEY_PREFIX).map(|custom| Self::Custom(custom.to_string()))
    }
}

impl fmt::Display for BucketKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Global => f.write_str(GLOBAL_KEY),
            Self::User(name) => write!(f, "{USER_KEY_PREFIX}{name}"),
            Self::Custom(value) => write!(f, "{CUSTOM_KEY_PREFIX}{value}"),
        }
    }
}

impl From<BucketKey> for String {
    fn from(key: BucketKey) -> Self {
        key.to_string()
    }
}

/// Selection of keys for bulk operations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeySelector {
    /// Exactly one key.
    Key(BucketKey),
    /// Every existing `user:` key.
    AllUsers,
    /// Every existing key.
    AllKeys,
}

impl KeySelector {
    /// Whether an existing stored key falls under this selection.
    pub fn matches(&self, stored: &str) -> bool {
        match self {
            Self::Key(key) => key.to_string() == stored,
            Self::AllUsers => stored.starts_with(USER_KEY_PREFIX),
            Self::AllKeys => true,
        }
    }
}
