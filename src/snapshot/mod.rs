//! # Snapshot Recording and Replay
//!
//! A snapshot is the complete output of one successful service pipeline run. The
//! first query for a [`ServiceKey`](crate::key::ServiceKey) runs the pipeline
//! normally while a recorder collects its rows; later queries with the same key
//! replay the snapshot into their downstream pipeline instead of running the
//! service again.
//!
//! - [`recorder`]: observes a run and resolves to a [`Snapshot`]
//! - [`replay`]: pushes a snapshot into a downstream input with backpressure
//! - [`cache`]: the pluggable key → snapshot store
//! - [`service`]: ties them together behind [`SnapshotService::activate`]

pub mod cache;
pub mod recorder;
pub mod replay;
pub mod service;

#[cfg(test)]
mod service_test;

pub use cache::{CacheProvider, MemoryCache, MemoryCacheProvider, SnapshotCache};
pub use recorder::{Observation, observe};
pub use replay::replay_into;
pub use service::{Activation, RecordOutcome, ReplayHandle, SnapshotService};

use crate::row::Row;
use chrono::{DateTime, Utc};

/// Immutable record of every row a completed run emitted, in emission order.
#[derive(Debug, Clone)]
pub struct Snapshot {
  rows: Vec<Row>,
  recorded_at: DateTime<Utc>,
}

impl Snapshot {
  /// Creates a snapshot stamped with the current time.
  pub fn new(rows: Vec<Row>) -> Self {
    Self {
      rows,
      recorded_at: Utc::now(),
    }
  }

  /// The recorded rows.
  pub fn rows(&self) -> &[Row] {
    &self.rows
  }

  /// Number of rows.
  pub fn len(&self) -> usize {
    self.rows.len()
  }

  /// Returns true if the run emitted nothing.
  pub fn is_empty(&self) -> bool {
    self.rows.is_empty()
  }

  /// When the run completed.
  pub fn recorded_at(&self) -> DateTime<Utc> {
    self.recorded_at
  }
}

/// What a query would get from the cache, without executing anything.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SnapshotPreview {
  /// A snapshot is cached.
  Available {
    /// Number of rows in the snapshot.
    rows: usize,
    /// When the snapshot was recorded.
    recorded_at: DateTime<Utc>,
  },
  /// No snapshot has been recorded yet.
  NotYetAvailable,
}
