//! Admin surface for managing buckets and their usage data.
//!
//! Every call returns a response struct instead of an error; failures are
//! reported through `error_message` so a management UI can show them
//! verbatim.

use crate::bucket::BucketDefinition;
use crate::engine::{AccountingEngine, BucketUsage};
use crate::flags::FeatureFlags;
use crate::registry::{BucketRegistry, BucketWithId, Definitions};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, error, warn};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetBucketResponse {
    pub bucket: Option<BucketWithId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Response of every call that returns the full definitions map.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketsResponse {
    pub buckets: Definitions,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketListResponse {
    pub buckets: Vec<BucketWithId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GetBucketDataResponse {
    pub bucket_data: Option<BucketUsage>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SaveBucketDataResponse {
    pub success: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
}

/// Handle over the registry, the engine, and the feature flags.
#[derive(Debug, Clone)]
pub struct BucketAdmin {
    registry: Arc<BucketRegistry>,
    engine: Arc<AccountingEngine>,
    flags: FeatureFlags,
}

impl BucketAdmin {
    pub fn new(registry: Arc<BucketRegistry>, engine: Arc<AccountingEngine>, flags: FeatureFlags) -> Self {
        Self { registry, engine, flags }
    }

    pub fn get_bucket(&self, bucket_id: &str) -> GetBucketResponse {
        if let Some(err) = self.registry.load_error() {
            return GetBucketResponse { bucket: None, error_message: Some(err.to_string()) };
        }
        let bucket = self
            .registry
            .get(bucket_id)
            .map(|definition| BucketWithId { id: bucket_id.to_string(), definition });
        GetBucketResponse { bucket, error_message: None }
    }

    pub fn get_buckets(&self) -> BucketsResponse {
        match self.registry.load_error() {
            Some(err) => BucketsResponse { buckets: Definitions::new(), error_message: Some(err.to_string()) },
            None => BucketsResponse { buckets: self.registry.list(), error_message: None },
        }
    }

    /// Admin-managed buckets sorted by name.
    pub fn get_buckets_as_array(&self) -> BucketListResponse {
        match self.registry.load_error() {
            Some(err) => BucketListResponse { buckets: Vec::new(), error_message: Some(err.to_string()) },
            None => BucketListResponse { buckets: self.registry.list_advanced(), error_message: None },
        }
    }

    pub fn save_bucket(&self, bucket_id: &str, bucket: BucketDefinition) -> BucketsResponse {
        let error_message = self.registry.save(bucket_id, bucket).err().map(|e| {
            error!(target: "ratekeeper::admin", bucket_id = %bucket_id, error = %e, "error saving bucket");
            e.to_string()
        });
        BucketsResponse { buckets: self.registry.list(), error_message }
    }

    /// Delete a bucket and forget its usage state.
    pub fn delete_bucket(&self, bucket_id: &str) -> BucketsResponse {
        let error_message = match self.engine.delete_bucket(bucket_id) {
            Ok((_, keys)) => {
                debug!(target: "ratekeeper::admin", bucket_id = %bucket_id, keys, "dropped usage of deleted bucket");
                None
            }
            Err(e) => {
                error!(target: "ratekeeper::admin", bucket_id = %bucket_id, error = %e, "error deleting bucket");
                Some(e.to_string())
            }
        };
        BucketsResponse { buckets: self.registry.list(), error_message }
    }

    /// Usage of every key of a bucket, refilled to the current time.
    pub fn get_bucket_data(&self, bucket_id: &str) -> GetBucketDataResponse {
        match self.engine.refresh_bucket(bucket_id) {
            Some(data) => GetBucketDataResponse { bucket_data: Some(data), error_message: None },
            None => {
                warn!(target: "ratekeeper::admin", bucket_id = %bucket_id, "no bucket data found");
                GetBucketDataResponse {
                    bucket_data: None,
                    error_message: Some(format!("No bucket found for bucket ID: {bucket_id}")),
                }
            }
        }
    }

    /// Replace a bucket's usage with raw JSON, or just validate it.
    pub fn save_bucket_data(&self, bucket_id: &str, bucket_data: &str, dry_run: bool) -> SaveBucketDataResponse {
        match self.engine.import_bucket_data(bucket_id, bucket_data, dry_run) {
            Ok(_) => SaveBucketDataResponse { success: true, error_message: None },
            Err(e) => SaveBucketDataResponse { success: false, error_message: Some(e.to_string()) },
        }
    }

    pub fn advanced_buckets_enabled(&self) -> bool {
        self.flags.advanced_buckets_enabled()
    }

    pub fn set_advanced_buckets_enabled(&self, enabled: bool) {
        self.flags.set_advanced_buckets(enabled);
    }
}
