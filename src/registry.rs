//! Registry of named bucket definitions.
//!
//! Owns every [`BucketDefinition`] keyed by bucket id. Admin mutations are
//! validated, written through to the snapshot store synchronously, and
//! announced on the [`EventBus`]. `simple` buckets are synthesized on demand
//! and never written out.

use crate::bucket::{AutoBucketParams, BucketDefinition};
use crate::error::{DefinitionError, RateLimitError};
use crate::events::{EventBus, RateLimitEvent};
use crate::store::{MemoryStore, SnapshotStore};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::sync::{PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, error, info, warn};

/// All definitions keyed by bucket id.
pub type Definitions = BTreeMap<String, BucketDefinition>;

/// A definition together with its id, as listed to selection UIs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BucketWithId {
    pub id: String,
    #[serde(flatten)]
    pub definition: BucketDefinition,
}

/// Bucket registry backed by a [`SnapshotStore`].
#[derive(Debug)]
pub struct BucketRegistry {
    buckets: RwLock<Definitions>,
    store: Box<dyn SnapshotStore<Definitions>>,
    load_error: Option<String>,
    events: EventBus,
}

impl BucketRegistry {
    /// Load definitions from `store`.
    ///
    /// A missing document is created empty. An unreadable one leaves the
    /// registry empty and is remembered in [`BucketRegistry::load_error`] so
    /// admin reads can surface it instead of silently showing no buckets.
    pub fn load<S>(store: S, events: EventBus) -> Self
    where
        S: SnapshotStore<Definitions> + 'static,
    {
        let mut load_error = None;
        let buckets = match store.load() {
            Ok(Some(buckets)) => {
                debug!(target: "ratekeeper::registry", count = buckets.len(), "loaded bucket definitions");
                buckets
            }
            Ok(None) => {
                debug!(target: "ratekeeper::registry", "no bucket definitions found; starting empty");
                if let Err(e) = store.save(&Definitions::new()) {
                    error!(target: "ratekeeper::registry", error = %e, "failed to create bucket definitions file");
                }
                Definitions::new()
            }
            Err(e) => {
                error!(target: "ratekeeper::registry", error = %e, "failed to load bucket definitions");
                load_error = Some(format!("Failed to load buckets: {e}"));
                Definitions::new()
            }
        };
        Self { buckets: RwLock::new(buckets), store: Box::new(store), load_error, events }
    }

    /// Empty registry with in-memory storage.
    pub fn in_memory() -> Self {
        Self::load(MemoryStore::<Definitions>::new(), EventBus::default())
    }

    /// Error from the initial load, if any.
    pub fn load_error(&self) -> Option<&str> {
        self.load_error.as_deref()
    }

    fn read(&self) -> RwLockReadGuard<'_, Definitions> {
        self.buckets.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Definitions> {
        self.buckets.write().unwrap_or_else(PoisonError::into_inner)
    }

    /// Look up a definition without side effects.
    pub fn get(&self, id: &str) -> Option<BucketDefinition> {
        self.read().get(id).cloned()
    }

    /// Look up a definition, synthesizing a `simple` one when `params` are
    /// given and the id is unknown.
    pub fn resolve(&self, id: &str, params: Option<AutoBucketParams>) -> Option<BucketDefinition> {
        if let Some(def) = self.get(id) {
            return Some(def);
        }
        match params {
            Some(params) => {
                let mut map = self.write();
                let def = map.entry(id.to_string()).or_insert_with(|| {
                    debug!(
                        target: "ratekeeper::registry",
                        bucket_id = %id,
                        size = params.bucket_size,
                        rate = params.bucket_rate,
                        "instantiated simple bucket"
                    );
                    BucketDefinition::simple(id, params)
                });
                Some(def.clone())
            }
            None => {
                warn!(target: "ratekeeper::registry", bucket_id = %id, "attempted to get non-existent bucket");
                None
            }
        }
    }

    /// Validate and store a definition, then rewrite the snapshot.
    ///
    /// The live map only changes once the snapshot write succeeded.
    pub fn save(&self, id: &str, mut definition: BucketDefinition) -> Result<(), RateLimitError> {
        let mut map = self.write();
        validate(id, &definition, &map)?;
        definition.name = definition.name.trim().to_string();
        definition.lifetime_cap = definition.lifetime_cap.filter(|cap| *cap > 0.0);
        let name = definition.name.clone();
        let mut candidate = map.clone();
        candidate.insert(id.to_string(), definition);
        self.persist(&candidate)?;
        *map = candidate;
        info!(target: "ratekeeper::registry", bucket_id = %id, name = %name, "updated bucket");
        self.events.publish(RateLimitEvent::BucketsChanged { buckets: map.clone() });
        Ok(())
    }

    /// Remove a definition, then rewrite the snapshot.
    pub fn delete(&self, id: &str) -> Result<BucketDefinition, RateLimitError> {
        let mut map = self.write();
        let mut candidate = map.clone();
        let removed =
            candidate.remove(id).ok_or_else(|| RateLimitError::BucketNotFound { id: id.to_string() })?;
        self.persist(&candidate)?;
        *map = candidate;
        info!(target: "ratekeeper::registry", bucket_id = %id, "deleted bucket");
        self.events.publish(RateLimitEvent::BucketsChanged { buckets: map.clone() });
        Ok(removed)
    }

    /// Every definition, including synthesized ones.
    pub fn list(&self) -> Definitions {
        self.read().clone()
    }

    /// Admin-managed definitions sorted by case-insensitive name.
    pub fn list_advanced(&self) -> Vec<BucketWithId> {
        let mut buckets: Vec<BucketWithId> = self
            .read()
            .iter()
            .filter(|(_, def)| !def.is_simple())
            .map(|(id, def)| BucketWithId { id: id.clone(), definition: def.clone() })
            .collect();
        buckets.sort_by_cached_key(|b| b.definition.name.to_lowercase());
        buckets
    }

    fn persist(&self, map: &Definitions) -> Result<(), RateLimitError> {
        let durable: Definitions =
            map.iter().filter(|(_, def)| !def.is_simple()).map(|(k, v)| (k.clone(), v.clone())).collect();
        self.store.save(&durable)?;
        debug!(target: "ratekeeper::registry", count = durable.len(), "saved bucket definitions");
        Ok(())
    }
}

fn validate(id: &str, def: &BucketDefinition, existing: &Definitions) -> Result<(), DefinitionError> {
    if id.is_empty() {
        return Err(DefinitionError::MissingId);
    }
    let name = def.name.trim();
    if name.is_empty() {
        return Err(DefinitionError::EmptyName);
    }
    let wanted = name.to_lowercase();
    let taken = existing
        .iter()
        .any(|(other_id, other)| other_id != id && other.name.trim().to_lowercase() == wanted);
    if taken {
        return Err(DefinitionError::DuplicateName { name: def.name.clone() });
    }
    if def.capacity < 0.0 || def.capacity.is_nan() {
        return Err(DefinitionError::NegativeCapacity);
    }
    if def.refill_rate < 0.0 || def.refill_rate.is_nan() {
        return Err(DefinitionError::NegativeRefillRate);
    }
    Ok(())
}
