//! # Configuration
//!
//! Operator-tunable settings for the broadcaster, the snapshot service and the
//! in-memory cache backend. Every field has a default, so a partial JSON document
//! (or none at all) yields a usable configuration.
//!
//! ```rust
//! use rowshare::config::RowshareConfig;
//!
//! let config = RowshareConfig::from_json_str(r#"{ "broadcast": { "max_rows": 500 } }"#).unwrap();
//! assert_eq!(config.broadcast.max_rows, 500);
//! assert_eq!(config.broadcast.inactivity_ms, 60_000);
//! ```

use crate::error::ConfigError;
use crate::window::{WindowCeilings, saturating_millis};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Settings of the window broadcaster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BroadcastConfig {
  /// Maximum rows any window may hold.
  pub max_rows: u64,
  /// Maximum age of rows held by any window, in milliseconds.
  pub max_time_ms: u64,
  /// A window not requested for this long is evicted, in milliseconds.
  pub inactivity_ms: u64,
  /// Minimum time between two eviction sweeps, in milliseconds.
  pub sweep_interval_ms: u64,
  /// Time budget of one eviction sweep, in milliseconds.
  pub sweep_budget_ms: u64,
}

impl Default for BroadcastConfig {
  fn default() -> Self {
    Self {
      max_rows: 10_000,
      max_time_ms: 60_000,
      inactivity_ms: 60_000,
      sweep_interval_ms: 1_000,
      sweep_budget_ms: 5,
    }
  }
}

impl BroadcastConfig {
  /// Sets the row ceiling.
  pub fn with_max_rows(mut self, max_rows: u64) -> Self {
    self.max_rows = max_rows;
    self
  }

  /// Sets the time ceiling.
  pub fn with_max_time(mut self, max_time: Duration) -> Self {
    self.max_time_ms = saturating_millis(max_time);
    self
  }

  /// Sets the inactivity timeout.
  pub fn with_inactivity(mut self, inactivity: Duration) -> Self {
    self.inactivity_ms = saturating_millis(inactivity);
    self
  }

  /// Sets the minimum interval between sweeps.
  pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
    self.sweep_interval_ms = saturating_millis(interval);
    self
  }

  /// Sets the sweep time budget.
  pub fn with_sweep_budget(mut self, budget: Duration) -> Self {
    self.sweep_budget_ms = saturating_millis(budget);
    self
  }

  /// Configured window ceilings.
  pub fn ceilings(&self) -> WindowCeilings {
    WindowCeilings::new(self.max_rows, Duration::from_millis(self.max_time_ms))
  }

  /// Inactivity timeout.
  pub fn inactivity(&self) -> Duration {
    Duration::from_millis(self.inactivity_ms)
  }

  /// Minimum interval between sweeps.
  pub fn sweep_interval(&self) -> Duration {
    Duration::from_millis(self.sweep_interval_ms)
  }

  /// Sweep time budget.
  pub fn sweep_budget(&self) -> Duration {
    Duration::from_millis(self.sweep_budget_ms)
  }
}

/// Settings of the snapshot service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
  /// Name of the cache holding snapshots.
  pub cache_name: String,
  /// Eviction template of the snapshot cache. Caching cannot be enabled without one.
  pub eviction_template: Option<String>,
  /// How long one replay offer waits for space, in milliseconds.
  pub offer_timeout_ms: u64,
}

impl Default for SnapshotConfig {
  fn default() -> Self {
    Self {
      cache_name: "service-snapshots".to_string(),
      eviction_template: None,
      offer_timeout_ms: 50,
    }
  }
}

impl SnapshotConfig {
  /// Sets the eviction template.
  pub fn with_eviction_template(mut self, template: impl Into<String>) -> Self {
    self.eviction_template = Some(template.into());
    self
  }

  /// Sets the replay offer timeout.
  pub fn with_offer_timeout(mut self, timeout: Duration) -> Self {
    self.offer_timeout_ms = saturating_millis(timeout);
    self
  }

  /// Replay offer timeout.
  pub fn offer_timeout(&self) -> Duration {
    Duration::from_millis(self.offer_timeout_ms)
  }
}

/// Eviction policy of an in-memory cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EvictionTemplate {
  /// Template name referenced by [`SnapshotConfig::eviction_template`].
  pub name: String,
  /// Maximum number of entries; least recently used entries go first.
  #[serde(default)]
  pub max_entries: Option<usize>,
  /// Entries not read for this long expire, in milliseconds.
  #[serde(default)]
  pub idle_ms: Option<u64>,
}

impl EvictionTemplate {
  /// Creates a template that never evicts.
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      max_entries: None,
      idle_ms: None,
    }
  }

  /// Bounds the number of entries.
  pub fn with_max_entries(mut self, max_entries: usize) -> Self {
    self.max_entries = Some(max_entries);
    self
  }

  /// Expires entries after a period without reads.
  pub fn with_idle(mut self, idle: Duration) -> Self {
    self.idle_ms = Some(saturating_millis(idle));
    self
  }

  /// Idle timeout, if any.
  pub fn idle(&self) -> Option<Duration> {
    self.idle_ms.map(Duration::from_millis)
  }
}

/// Templates available to the in-memory cache backend.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// Named eviction templates.
  pub templates: Vec<EvictionTemplate>,
}

/// Complete configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RowshareConfig {
  /// Window broadcaster settings.
  pub broadcast: BroadcastConfig,
  /// Snapshot service settings.
  pub snapshot: SnapshotConfig,
  /// In-memory cache backend settings.
  pub cache: CacheConfig,
}

impl RowshareConfig {
  /// Parses and validates a JSON document.
  pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
    let config: Self = serde_json::from_str(json)?;
    config.validate()?;
    Ok(config)
  }

  /// Reads, parses and validates a JSON file.
  pub fn from_path(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
    let json = std::fs::read_to_string(path)?;
    Self::from_json_str(&json)
  }

  /// Rejects values the layer cannot work with.
  pub fn validate(&self) -> Result<(), ConfigError> {
    if self.broadcast.max_rows == 0 {
      return Err(ConfigError::Invalid("broadcast.max_rows must be positive".into()));
    }
    if self.broadcast.max_time_ms == 0 {
      return Err(ConfigError::Invalid("broadcast.max_time_ms must be positive".into()));
    }
    if self.snapshot.offer_timeout_ms == 0 {
      return Err(ConfigError::Invalid("snapshot.offer_timeout_ms must be positive".into()));
    }
    let mut names: Vec<&str> = self.cache.templates.iter().map(|t| t.name.as_str()).collect();
    names.sort_unstable();
    if let Some(pair) = names.windows(2).find(|pair| pair[0] == pair[1]) {
      return Err(ConfigError::Invalid(format!(
        "duplicate eviction template: {}",
        pair[0]
      )));
    }
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::io::Write;
  use tempfile::NamedTempFile;

  #[test]
  fn test_defaults_fill_missing_fields() {
    let config = RowshareConfig::from_json_str("{}").unwrap();
    assert_eq!(config, RowshareConfig::default());
    assert_eq!(config.snapshot.cache_name, "service-snapshots");
    assert!(config.snapshot.eviction_template.is_none());
  }

  #[test]
  fn test_parse_templates_and_durations() {
    let json = r#"{
      "broadcast": { "max_rows": 100, "inactivity_ms": 250 },
      "snapshot": { "eviction_template": "small" },
      "cache": { "templates": [ { "name": "small", "max_entries": 8, "idle_ms": 1000 } ] }
    }"#;
    let config = RowshareConfig::from_json_str(json).unwrap();

    assert_eq!(config.broadcast.ceilings().max_rows, 100);
    assert_eq!(config.broadcast.inactivity(), Duration::from_millis(250));
    assert_eq!(config.snapshot.eviction_template.as_deref(), Some("small"));
    assert_eq!(config.cache.templates[0].max_entries, Some(8));
    assert_eq!(config.cache.templates[0].idle(), Some(Duration::from_secs(1)));
  }

  #[test]
  fn test_rejects_zero_ceiling() {
    let err = RowshareConfig::from_json_str(r#"{ "broadcast": { "max_rows": 0 } }"#).unwrap_err();
    assert!(matches!(err, ConfigError::Invalid(_)));
  }

  #[test]
  fn test_rejects_duplicate_templates() {
    let json = r#"{ "cache": { "templates": [ { "name": "a" }, { "name": "a" } ] } }"#;
    assert!(matches!(
      RowshareConfig::from_json_str(json),
      Err(ConfigError::Invalid(_))
    ));
  }

  #[test]
  fn test_huge_durations_saturate() {
    let broadcast = BroadcastConfig::default()
      .with_max_time(Duration::MAX)
      .with_inactivity(Duration::from_secs(u64::MAX));
    assert_eq!(broadcast.max_time_ms, u64::MAX);
    assert_eq!(broadcast.inactivity_ms, u64::MAX);
    assert_eq!(broadcast.ceilings().max_time, Duration::from_millis(u64::MAX));

    let template = EvictionTemplate::new("forever").with_idle(Duration::MAX);
    assert_eq!(template.idle_ms, Some(u64::MAX));
  }

  #[test]
  fn test_from_path() {
    let mut file = NamedTempFile::new().unwrap();
    write!(file, r#"{{ "snapshot": {{ "offer_timeout_ms": 10 }} }}"#).unwrap();
    let config = RowshareConfig::from_path(file.path()).unwrap();
    assert_eq!(config.snapshot.offer_timeout(), Duration::from_millis(10));
  }
}
