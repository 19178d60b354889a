//! Cache keys.
//!
//! Both keys compare by literal text. Two filters that mean the same thing but are
//! written differently produce different keys and will not share cache entries.

use crate::window::{WindowMode, WindowSpec, saturating_millis};
use std::fmt;
use std::sync::Arc;

/// Identifies the output of one service pipeline for one filter.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ServiceKey {
  service: Arc<str>,
  filter: Arc<str>,
}

impl ServiceKey {
  /// Creates a key from a service name and the filter-clause text.
  pub fn new(service: impl Into<Arc<str>>, filter: impl Into<Arc<str>>) -> Self {
    Self {
      service: service.into(),
      filter: filter.into(),
    }
  }

  /// Service name.
  pub fn service(&self) -> &str {
    &self.service
  }

  /// Filter-clause text.
  pub fn filter(&self) -> &str {
    &self.filter
  }
}

impl fmt::Display for ServiceKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{}[{}]", self.service, self.filter)
  }
}

/// Identifies one shared window. Requests that resolve to the same key share a
/// listener.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct WindowKey {
  query: Arc<str>,
  mode: WindowMode,
  size: u64,
  every: u64,
  max_rows: u64,
  max_time_ms: u64,
}

impl WindowKey {
  /// Derives the key from the query text and a resolved window spec.
  pub fn new(query: &str, spec: &WindowSpec) -> Self {
    Self {
      query: Arc::from(query),
      mode: spec.mode(),
      size: spec.size(),
      every: spec.every(),
      max_rows: spec.max_rows(),
      max_time_ms: saturating_millis(spec.max_time()),
    }
  }

  /// Query text.
  pub fn query(&self) -> &str {
    &self.query
  }

  /// Clamped window size.
  pub fn size(&self) -> u64 {
    self.size
  }

  /// Clamped slide increment.
  pub fn every(&self) -> u64 {
    self.every
  }
}

impl fmt::Display for WindowKey {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(
      f,
      "{}|{}|{}|{}|{}|{}",
      self.query, self.mode, self.size, self.every, self.max_rows, self.max_time_ms
    )
  }
}
