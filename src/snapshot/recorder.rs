//! Recording a run's output as a [`Snapshot`].

use super::Snapshot;
use crate::error::{ObserveError, PipelineError};
use crate::pipeline::{PipelineRun, RunOutcome};
use crate::row::Row;
use crate::sync::lock;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};
use tokio::sync::oneshot;

/// Pending result of [`observe`].
///
/// Resolves exactly once. Dropping it abandons the observation; the run itself is
/// unaffected.
#[derive(Debug)]
pub struct Observation {
  rx: oneshot::Receiver<Result<Snapshot, ObserveError>>,
}

impl Future for Observation {
  type Output = Result<Snapshot, ObserveError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    // A run dropped without reporting completion never finished.
    self
      .rx
      .poll_unpin(cx)
      .map(|result| result.unwrap_or(Err(ObserveError::Cancelled)))
  }
}

/// Collects every row `output_step` emits until the run ends.
///
/// The observation resolves to the snapshot when the run completes without row
/// errors, to [`ObserveError::Upstream`] when it completes with errors and to
/// [`ObserveError::Cancelled`] when it is stopped first.
pub fn observe(run: &dyn PipelineRun, output_step: &str) -> Result<Observation, PipelineError> {
  let rows: Arc<Mutex<Vec<Row>>> = Arc::new(Mutex::new(Vec::new()));

  let sink = rows.clone();
  run.add_row_listener(
    output_step,
    Arc::new(move |row: Row| lock(&sink).push(row)),
  )?;

  let (tx, rx) = oneshot::channel();
  run.add_finish_listener(Box::new(move |outcome| {
    let result = match outcome {
      RunOutcome::Completed { errors: 0 } => Ok(Snapshot::new(std::mem::take(&mut *lock(&rows)))),
      RunOutcome::Completed { errors } => Err(ObserveError::Upstream { errors }),
      RunOutcome::Stopped => Err(ObserveError::Cancelled),
    };
    let _ = tx.send(result);
  }));

  Ok(Observation { rx })
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipeline::memory::MemoryRun;
  use crate::row::RowMeta;
  use serde_json::json;

  fn row(n: i64) -> Row {
    Row::new(Arc::new(RowMeta::new(["n"])), vec![json!(n)])
  }

  #[tokio::test]
  async fn test_observe_collects_rows_in_order() {
    let run = MemoryRun::new("svc", ["filter", "output"]);
    let observation = observe(run.as_ref(), "output").unwrap();

    run.emit("output", row(1));
    run.emit("filter", row(99));
    run.emit("output", row(2));
    run.emit("output", row(3));
    run.complete();

    let snapshot = observation.await.unwrap();
    let values: Vec<i64> = snapshot
      .rows()
      .iter()
      .map(|r| r.values()[0].as_i64().unwrap())
      .collect();
    assert_eq!(values, vec![1, 2, 3]);
  }

  #[tokio::test]
  async fn test_observe_reports_upstream_errors() {
    let run = MemoryRun::new("svc", ["output"]);
    let observation = observe(run.as_ref(), "output").unwrap();

    run.emit("output", row(1));
    run.record_error();
    run.complete();

    assert_eq!(observation.await.unwrap_err(), ObserveError::Upstream { errors: 1 });
  }

  #[tokio::test]
  async fn test_observe_stopped_run_is_cancelled() {
    let run = MemoryRun::new("svc", ["output"]);
    let observation = observe(run.as_ref(), "output").unwrap();

    run.emit("output", row(1));
    run.stop();

    assert!(observation.await.unwrap_err().is_cancelled());
  }

  #[tokio::test]
  async fn test_observe_dropped_run_is_cancelled() {
    let observation = {
      let run = MemoryRun::new("svc", ["output"]);
      observe(run.as_ref(), "output").unwrap()
    };
    assert_eq!(observation.await.unwrap_err(), ObserveError::Cancelled);
  }

  #[test]
  fn test_observe_unknown_step() {
    let run = MemoryRun::new("svc", ["output"]);
    assert!(matches!(
      observe(run.as_ref(), "nope"),
      Err(PipelineError::UnknownStep(_))
    ));
  }
}
