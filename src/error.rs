//! # Error Types
//!
//! Errors raised by the result-sharing layer.
//!
//! Only configuration-time failures ([`CacheError`], [`ConfigError`]) are meant to
//! reach whoever enables an optimization. Everything else is reported as a value the
//! query path can log and fall back from:
//!
//! - [`ObserveError`]: a recorded run did not produce a cacheable snapshot
//! - [`ReplayError`]: the downstream consumer disappeared during a replay
//! - [`BroadcastError`]: the shared upstream pipeline could not be started
//! - [`PipelineError`]: failures reported by the pipeline engine itself

use thiserror::Error;

/// Failures reported by the pipeline execution engine.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
  /// The run has no step with the given name.
  #[error("unknown step: {0}")]
  UnknownStep(String),
  /// The pipeline could not be started.
  #[error("pipeline '{pipeline}' failed to start: {reason}")]
  StartFailed {
    /// Pipeline name.
    pipeline: String,
    /// Engine-provided reason.
    reason: String,
  },
}

/// Outcome of observing a pipeline run that did not yield a snapshot.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ObserveError {
  /// The run completed but reported row errors.
  #[error("upstream run finished with {errors} error(s)")]
  Upstream {
    /// Number of errors reported by the run.
    errors: u64,
  },
  /// The run was stopped (or abandoned) before it finished.
  #[error("run was cancelled before completion")]
  Cancelled,
}

impl ObserveError {
  /// Returns true for cancellations, which are expected during normal operation.
  pub fn is_cancelled(&self) -> bool {
    matches!(self, ObserveError::Cancelled)
  }
}

/// Failures while replaying a snapshot into a downstream consumer.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReplayError {
  /// The consumer stopped being alive before the replay completed.
  #[error("downstream consumer went away after {pushed} row(s)")]
  ConsumerGone {
    /// Rows accepted before the consumer went away.
    pushed: u64,
  },
  /// The replay task ended without reporting a result.
  #[error("replay task was dropped")]
  Dropped,
}

/// Configuration-time errors of the snapshot cache.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
  /// Caching was requested but no eviction template is configured.
  #[error("no eviction template configured for snapshot caching")]
  NotConfigured,
  /// The configured eviction template does not exist in the cache backend.
  #[error("unknown eviction template: {0}")]
  UnknownTemplate(String),
}

/// Errors from the window broadcaster.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BroadcastError {
  /// The upstream pipeline could not be started.
  #[error("failed to start upstream pipeline: {0}")]
  Start(#[from] PipelineError),
}

/// Errors loading or validating configuration.
#[derive(Error, Debug)]
pub enum ConfigError {
  /// The configuration file could not be read.
  #[error("io error: {0}")]
  Io(#[from] std::io::Error),
  /// The configuration is not valid JSON for the expected schema.
  #[error("parse error: {0}")]
  Parse(#[from] serde_json::Error),
  /// The configuration parsed but holds unusable values.
  #[error("invalid configuration: {0}")]
  Invalid(String),
}
