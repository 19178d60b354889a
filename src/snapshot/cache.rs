//! Snapshot cache backends.
//!
//! The snapshot service only needs insert-if-absent and lookup; how entries are
//! evicted is decided by the backend, selected by eviction template name.

use super::Snapshot;
use crate::config::{CacheConfig, EvictionTemplate};
use crate::error::CacheError;
use crate::expiring::ExpiringMap;
use crate::key::ServiceKey;
use crate::sync::lock;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;
use tracing::debug;

/// Key → snapshot store.
pub trait SnapshotCache: Send + Sync {
  /// Looks up a snapshot.
  fn get(&self, key: &ServiceKey) -> Option<Arc<Snapshot>>;

  /// Stores `snapshot` unless a live entry exists. Returns true if it was stored.
  fn put_if_absent(&self, key: ServiceKey, snapshot: Arc<Snapshot>) -> bool;

  /// Drops every entry.
  fn invalidate_all(&self);

  /// Number of entries.
  fn len(&self) -> usize;

  /// Returns true when the cache is empty.
  fn is_empty(&self) -> bool {
    self.len() == 0
  }
}

/// Creates (or returns existing) caches by name and eviction template.
pub trait CacheProvider: Send + Sync {
  /// Returns the cache called `name`, creating it with `template` on first use.
  fn get_or_create(&self, name: &str, template: &str) -> Result<Arc<dyn SnapshotCache>, CacheError>;
}

/// In-memory snapshot cache governed by an [`EvictionTemplate`].
pub struct MemoryCache {
  name: String,
  entries: Mutex<ExpiringMap<ServiceKey, Arc<Snapshot>>>,
}

impl MemoryCache {
  /// Creates an empty cache.
  pub fn new(name: impl Into<String>, template: &EvictionTemplate) -> Self {
    let name = name.into();
    let cache_name = name.clone();
    let mut entries = ExpiringMap::new().with_eviction_callback(
      move |key: &ServiceKey, snapshot: Arc<Snapshot>, cause| {
        debug!(cache = %cache_name, service = %key, rows = snapshot.len(), %cause, "snapshot evicted");
      },
    );
    if let Some(idle) = template.idle() {
      entries = entries.with_idle_timeout(idle);
    }
    if let Some(max_entries) = template.max_entries {
      entries = entries.with_capacity(max_entries);
    }
    Self {
      name,
      entries: Mutex::new(entries),
    }
  }

  /// Cache name.
  pub fn name(&self) -> &str {
    &self.name
  }
}

impl SnapshotCache for MemoryCache {
  fn get(&self, key: &ServiceKey) -> Option<Arc<Snapshot>> {
    lock(&self.entries).get(key, Instant::now()).cloned()
  }

  fn put_if_absent(&self, key: ServiceKey, snapshot: Arc<Snapshot>) -> bool {
    lock(&self.entries).insert_if_absent(key, snapshot, Instant::now())
  }

  fn invalidate_all(&self) {
    lock(&self.entries).clear();
  }

  fn len(&self) -> usize {
    lock(&self.entries).len()
  }
}

/// Provider of [`MemoryCache`]s built from configured templates.
pub struct MemoryCacheProvider {
  templates: HashMap<String, EvictionTemplate>,
  caches: Mutex<HashMap<String, Arc<MemoryCache>>>,
}

impl MemoryCacheProvider {
  /// Creates a provider knowing the given templates.
  pub fn new<I>(templates: I) -> Self
  where
    I: IntoIterator<Item = EvictionTemplate>,
  {
    Self {
      templates: templates
        .into_iter()
        .map(|t| (t.name.clone(), t))
        .collect(),
      caches: Mutex::new(HashMap::new()),
    }
  }

  /// Creates a provider from configuration.
  pub fn from_config(config: &CacheConfig) -> Self {
    Self::new(config.templates.iter().cloned())
  }
}

impl CacheProvider for MemoryCacheProvider {
  fn get_or_create(&self, name: &str, template: &str) -> Result<Arc<dyn SnapshotCache>, CacheError> {
    let template = self
      .templates
      .get(template)
      .ok_or_else(|| CacheError::UnknownTemplate(template.to_string()))?;
    let mut caches = lock(&self.caches);
    let cache = caches
      .entry(name.to_string())
      .or_insert_with(|| Arc::new(MemoryCache::new(name, template)))
      .clone();
    Ok(cache)
  }
}
