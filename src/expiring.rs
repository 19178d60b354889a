//! Expiring map with an eviction callback.
//!
//! Entries expire after being idle (not read or written) for longer than a
//! configured duration, and the map can optionally be bounded in size, evicting the
//! least recently accessed entry first. Expiry is driven by explicit sweeps, so the
//! owner decides when and for how long eviction work runs.
//!
//! Every removal other than [`ExpiringMap::take`] goes through the eviction
//! callback, invoked synchronously and exactly once per removed entry.

use lru::LruCache;
use std::fmt;
use std::hash::Hash;
use std::time::{Duration, Instant};

/// Why an entry left the map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionCause {
  /// The entry was idle longer than the configured timeout.
  Expired,
  /// The map was full and the entry was the least recently used.
  Capacity,
  /// The entry was removed explicitly or the map was cleared.
  Explicit,
}

impl fmt::Display for EvictionCause {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      EvictionCause::Expired => write!(f, "expired"),
      EvictionCause::Capacity => write!(f, "capacity"),
      EvictionCause::Explicit => write!(f, "explicit"),
    }
  }
}

type EvictionCallback<K, V> = Box<dyn Fn(&K, V, EvictionCause) + Send + Sync>;

struct Entry<V> {
  value: V,
  last_access: Instant,
}

/// Map whose entries expire after a period of inactivity.
///
/// Entries are kept in recency order: every read or write moves an entry to the
/// most recently used end, so the least recently used entry is also the one idle
/// the longest.
pub struct ExpiringMap<K, V> {
  entries: LruCache<K, Entry<V>>,
  idle_timeout: Option<Duration>,
  capacity: Option<usize>,
  on_evict: Option<EvictionCallback<K, V>>,
}

impl<K, V> ExpiringMap<K, V>
where
  K: Eq + Hash,
{
  /// Creates an unbounded map whose entries never expire.
  pub fn new() -> Self {
    Self {
      // Capacity is enforced here rather than by the cache, so every capacity
      // eviction reaches the callback.
      entries: LruCache::unbounded(),
      idle_timeout: None,
      capacity: None,
      on_evict: None,
    }
  }

  /// Expires entries idle for longer than `timeout`.
  pub fn with_idle_timeout(mut self, timeout: Duration) -> Self {
    self.idle_timeout = Some(timeout);
    self
  }

  /// Bounds the map to `capacity` entries.
  pub fn with_capacity(mut self, capacity: usize) -> Self {
    self.capacity = Some(capacity);
    self
  }

  /// Sets the callback invoked for every evicted entry.
  pub fn with_eviction_callback<F>(mut self, callback: F) -> Self
  where
    F: Fn(&K, V, EvictionCause) + Send + Sync + 'static,
  {
    self.on_evict = Some(Box::new(callback));
    self
  }

  /// Number of entries, including expired ones not yet swept.
  pub fn len(&self) -> usize {
    self.entries.len()
  }

  /// Returns true when the map holds no entries.
  pub fn is_empty(&self) -> bool {
    self.entries.is_empty()
  }

  /// Returns true if `key` is present, without refreshing it.
  pub fn contains_key(&self, key: &K) -> bool {
    self.entries.contains(key)
  }

  fn is_expired(&self, entry: &Entry<V>, now: Instant) -> bool {
    self
      .idle_timeout
      .is_some_and(|timeout| now.saturating_duration_since(entry.last_access) > timeout)
  }

  /// Reads an entry and refreshes its access time.
  ///
  /// An entry found expired is evicted on the spot and reported as missing.
  pub fn get(&mut self, key: &K, now: Instant) -> Option<&V> {
    let expired = match self.entries.peek(key) {
      Some(entry) => self.is_expired(entry, now),
      None => return None,
    };
    if expired {
      self.evict(key, EvictionCause::Expired);
      return None;
    }
    let entry = self.entries.get_mut(key)?;
    entry.last_access = now;
    Some(&entry.value)
  }

  /// Inserts or replaces an entry. A replaced value is evicted explicitly.
  pub fn insert(&mut self, key: K, value: V, now: Instant) {
    self.evict(&key, EvictionCause::Explicit);
    self.make_room(now);
    self.entries.put(
      key,
      Entry {
        value,
        last_access: now,
      },
    );
  }

  /// Inserts only if no live entry exists for `key`. Returns true if inserted.
  pub fn insert_if_absent(&mut self, key: K, value: V, now: Instant) -> bool {
    if self.get(&key, now).is_some() {
      return false;
    }
    self.insert(key, value, now);
    true
  }

  /// Removes an entry through the eviction callback. Returns true if it existed.
  pub fn remove(&mut self, key: &K) -> bool {
    self.evict(key, EvictionCause::Explicit)
  }

  /// Removes an entry and hands it back without invoking the callback.
  pub fn take(&mut self, key: &K) -> Option<V> {
    self.entries.pop(key).map(|entry| entry.value)
  }

  /// Evicts every entry, least recently used first.
  pub fn clear(&mut self) -> usize {
    let mut count = 0;
    while let Some((key, entry)) = self.entries.pop_lru() {
      self.notify(&key, entry.value, EvictionCause::Explicit);
      count += 1;
    }
    count
  }

  /// Evicts idle entries, spending at most `budget` on it.
  ///
  /// Walks from the least recently used end and stops at the first entry that is
  /// still fresh. Returns the number of evicted entries; whatever the budget did
  /// not reach is left for the next sweep.
  pub fn sweep(&mut self, now: Instant, budget: Duration) -> usize {
    if self.idle_timeout.is_none() {
      return 0;
    }
    let started = Instant::now();
    let mut count = 0;
    while started.elapsed() <= budget {
      let expired = match self.entries.peek_lru() {
        Some((_, entry)) => self.is_expired(entry, now),
        None => false,
      };
      if !expired {
        break;
      }
      if let Some((key, entry)) = self.entries.pop_lru() {
        self.notify(&key, entry.value, EvictionCause::Expired);
        count += 1;
      }
    }
    count
  }

  fn make_room(&mut self, now: Instant) {
    let Some(capacity) = self.capacity else {
      return;
    };
    if self.entries.len() < capacity {
      return;
    }
    self.sweep(now, Duration::MAX);
    while self.entries.len() >= capacity {
      let Some((key, entry)) = self.entries.pop_lru() else {
        break;
      };
      self.notify(&key, entry.value, EvictionCause::Capacity);
    }
  }

  fn evict(&mut self, key: &K, cause: EvictionCause) -> bool {
    match self.entries.pop(key) {
      Some(entry) => {
        self.notify(key, entry.value, cause);
        true
      }
      None => false,
    }
  }

  fn notify(&self, key: &K, value: V, cause: EvictionCause) {
    if let Some(callback) = &self.on_evict {
      callback(key, value, cause);
    }
  }
}

impl<K, V> Default for ExpiringMap<K, V>
where
  K: Eq + Hash,
{
  fn default() -> Self {
    Self::new()
  }
}

impl<K: Eq + Hash, V> fmt::Debug for ExpiringMap<K, V> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExpiringMap")
      .field("len", &self.entries.len())
      .field("idle_timeout", &self.idle_timeout)
      .field("capacity", &self.capacity)
      .finish()
  }
}
