//! # Pipeline Engine Interfaces
//!
//! The result-sharing layer sits in front of a pipeline execution engine it does not
//! own. These traits describe the small surface it needs:
//!
//! - [`PipelineRun`]: a run that can be observed (row and completion callbacks)
//! - [`ServicePipeline`]: the long-running upstream pipeline shared by windows
//! - [`GenerationPipeline`] and [`RowInput`]: the downstream pipeline a snapshot is
//!   replayed into
//!
//! [`memory`] provides an in-process implementation of every trait.

pub mod memory;

use crate::error::PipelineError;
use crate::row::Row;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Query parameters copied into a pipeline before it starts.
pub type Parameters = BTreeMap<String, String>;

/// Callback invoked for every row a step emits.
pub type RowCallback = Arc<dyn Fn(Row) + Send + Sync>;

/// Callback invoked once when a run ends.
pub type FinishCallback = Box<dyn FnOnce(RunOutcome) + Send>;

/// How a pipeline run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
  /// The run processed all of its input. `errors` counts rows that failed.
  Completed {
    /// Number of row errors reported by the run.
    errors: u64,
  },
  /// The run was stopped before it finished.
  Stopped,
}

impl fmt::Display for RunOutcome {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunOutcome::Completed { errors } => write!(f, "completed ({} errors)", errors),
      RunOutcome::Stopped => write!(f, "stopped"),
    }
  }
}

/// A pipeline run that can be observed while it executes.
pub trait PipelineRun: Send + Sync {
  /// Name of the pipeline.
  fn name(&self) -> &str;

  /// Registers a callback for every row emitted by `step`.
  fn add_row_listener(&self, step: &str, listener: RowCallback) -> Result<(), PipelineError>;

  /// Registers a callback invoked once when the run ends.
  ///
  /// If the run has already ended the callback is invoked immediately.
  fn add_finish_listener(&self, listener: FinishCallback);

  /// Number of row errors reported so far.
  fn error_count(&self) -> u64;
}

/// The continuously running upstream pipeline shared by window listeners.
pub trait ServicePipeline: Send + Sync {
  /// Name of the service step this pipeline feeds.
  fn name(&self) -> &str;

  /// Copies query parameters into the pipeline. Called before every start.
  fn copy_parameters(&self, parameters: &Parameters);

  /// Starts a run. `on_row` is invoked on the pipeline's own thread for every
  /// output row; `on_finished` once when the run ends. Neither callback may be
  /// invoked before `start` returns.
  fn start(&self, on_row: RowCallback, on_finished: FinishCallback) -> Result<(), PipelineError>;

  /// Requests the current run to stop.
  ///
  /// Must not block: it is called from inside `on_row` on the pipeline's thread.
  /// The run must still invoke its `on_finished` once it has actually ended, and
  /// must not invoke `on_row` after that.
  fn stop(&self);
}

/// Why a row offered to a [`RowInput`] was not accepted. The row is handed back.
#[derive(Debug)]
pub enum OfferError {
  /// No space became available before the timeout.
  Timeout(Row),
  /// The input no longer accepts rows.
  Closed(Row),
}

/// Bounded input of a downstream pipeline.
#[async_trait]
pub trait RowInput: Send + Sync {
  /// Offers a row, waiting at most `timeout` for space.
  async fn offer(&self, row: Row, timeout: Duration) -> Result<(), OfferError>;

  /// Signals that no more rows will be offered.
  fn finish(&self);
}

/// The downstream pipeline that consumes service rows for one query.
pub trait GenerationPipeline: Send + Sync {
  /// Name of the pipeline.
  fn name(&self) -> &str;

  /// Kills any run currently bound to this pipeline's structures.
  fn kill_current_run(&self);

  /// The input rows are pushed into.
  fn input(&self) -> Arc<dyn RowInput>;

  /// Returns false once the consumer has died or been aborted.
  fn is_alive(&self) -> bool;

  /// Returns true once the consumer has finished, e.g. after reaching a row limit.
  fn is_finished(&self) -> bool;
}
