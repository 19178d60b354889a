//! In-process pipeline engine.
//!
//! Small, fully functional implementations of the engine traits, for embedding the
//! result-sharing layer without an external engine and for tests:
//!
//! - [`MemoryRun`]: a run driven by its owner through `emit`/`complete`/`stop`
//! - [`MemoryServicePipeline`]: a thread-backed upstream pipeline fed by a channel
//! - [`MemoryGeneration`]: a downstream pipeline with a bounded input and an
//!   optional row limit

use super::{
  FinishCallback, GenerationPipeline, OfferError, Parameters, PipelineRun, RowCallback, RowInput,
  RunOutcome, ServicePipeline,
};
use crate::error::PipelineError;
use crate::row::Row;
use crate::sync::lock;
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

// ============================================================================
// MemoryRun
// ============================================================================

#[derive(Default)]
struct RunState {
  row_listeners: Vec<(String, RowCallback)>,
  finish_listeners: Vec<FinishCallback>,
  outcome: Option<RunOutcome>,
}

/// A pipeline run driven explicitly by its owner.
pub struct MemoryRun {
  name: String,
  steps: Vec<String>,
  errors: AtomicU64,
  state: Mutex<RunState>,
}

impl MemoryRun {
  /// Creates a run with the given step names.
  pub fn new<I, S>(name: impl Into<String>, steps: I) -> Arc<Self>
  where
    I: IntoIterator<Item = S>,
    S: Into<String>,
  {
    Arc::new(Self {
      name: name.into(),
      steps: steps.into_iter().map(Into::into).collect(),
      errors: AtomicU64::new(0),
      state: Mutex::new(RunState::default()),
    })
  }

  /// Emits a row from `step` to its listeners. Ignored once the run has ended.
  pub fn emit(&self, step: &str, row: Row) {
    let listeners: Vec<RowCallback> = {
      let state = lock(&self.state);
      if state.outcome.is_some() {
        return;
      }
      state
        .row_listeners
        .iter()
        .filter(|(s, _)| s == step)
        .map(|(_, l)| l.clone())
        .collect()
    };
    for listener in listeners {
      listener(row.clone());
    }
  }

  /// Records a row error.
  pub fn record_error(&self) {
    self.errors.fetch_add(1, Ordering::Relaxed);
  }

  /// Ends the run as completed.
  pub fn complete(&self) {
    let errors = self.errors.load(Ordering::Relaxed);
    self.finish(RunOutcome::Completed { errors });
  }

  /// Ends the run as stopped.
  pub fn stop(&self) {
    self.finish(RunOutcome::Stopped);
  }

  /// How the run ended, if it has.
  pub fn outcome(&self) -> Option<RunOutcome> {
    lock(&self.state).outcome
  }

  fn finish(&self, outcome: RunOutcome) {
    let listeners = {
      let mut state = lock(&self.state);
      if state.outcome.is_some() {
        return;
      }
      state.outcome = Some(outcome);
      state.row_listeners.clear();
      std::mem::take(&mut state.finish_listeners)
    };
    debug!(pipeline = %self.name, %outcome, "run finished");
    for listener in listeners {
      listener(outcome);
    }
  }
}

impl PipelineRun for MemoryRun {
  fn name(&self) -> &str {
    &self.name
  }

  fn add_row_listener(&self, step: &str, listener: RowCallback) -> Result<(), PipelineError> {
    if !self.steps.iter().any(|s| s == step) {
      return Err(PipelineError::UnknownStep(step.to_string()));
    }
    lock(&self.state)
      .row_listeners
      .push((step.to_string(), listener));
    Ok(())
  }

  fn add_finish_listener(&self, listener: FinishCallback) {
    let mut state = lock(&self.state);
    let outcome = state.outcome;
    match outcome {
      Some(outcome) => {
        drop(state);
        listener(outcome);
      }
      None => state.finish_listeners.push(listener),
    }
  }

  fn error_count(&self) -> u64 {
    self.errors.load(Ordering::Relaxed)
  }
}

// ============================================================================
// MemoryServicePipeline
// ============================================================================

/// Upstream pipeline that runs on its own thread and emits rows sent to its feed.
///
/// Each [`start`](ServicePipeline::start) spawns a worker thread that forwards fed
/// rows until it is stopped, or until every feeder has been dropped after
/// [`close_feed`](Self::close_feed), which completes the run. A start joins the
/// previous worker first, so only one worker ever reads the feed.
pub struct MemoryServicePipeline {
  name: String,
  feed: Mutex<Option<Sender<Row>>>,
  source: Arc<Mutex<Receiver<Row>>>,
  parameters: Mutex<Parameters>,
  current: Mutex<Option<CancellationToken>>,
  worker: Mutex<Option<JoinHandle<()>>>,
  active: Arc<AtomicUsize>,
  starts: AtomicU64,
  stops: AtomicU64,
  poll_interval: Duration,
}

impl MemoryServicePipeline {
  /// Creates a pipeline for the named service step.
  pub fn new(name: impl Into<String>) -> Self {
    let (tx, rx) = mpsc::channel();
    Self {
      name: name.into(),
      feed: Mutex::new(Some(tx)),
      source: Arc::new(Mutex::new(rx)),
      parameters: Mutex::new(Parameters::new()),
      current: Mutex::new(None),
      worker: Mutex::new(None),
      active: Arc::new(AtomicUsize::new(0)),
      starts: AtomicU64::new(0),
      stops: AtomicU64::new(0),
      poll_interval: Duration::from_millis(5),
    }
  }

  /// Returns a sender feeding rows to the running pipeline.
  ///
  /// Rows fed while no run is active are emitted by the next run.
  pub fn feeder(&self) -> Option<Sender<Row>> {
    lock(&self.feed).clone()
  }

  /// Drops the pipeline's own feeder; the run completes once all feeders are gone.
  pub fn close_feed(&self) {
    lock(&self.feed).take();
  }

  /// Parameters copied by the last start.
  pub fn parameters(&self) -> Parameters {
    lock(&self.parameters).clone()
  }

  /// Returns true while any worker thread is running.
  pub fn is_running(&self) -> bool {
    self.active.load(Ordering::Acquire) > 0
  }

  /// Number of runs started.
  pub fn starts(&self) -> u64 {
    self.starts.load(Ordering::Relaxed)
  }

  /// Number of stop requests that hit a running run.
  pub fn stops(&self) -> u64 {
    self.stops.load(Ordering::Relaxed)
  }
}

impl ServicePipeline for MemoryServicePipeline {
  fn name(&self) -> &str {
    &self.name
  }

  fn copy_parameters(&self, parameters: &Parameters) {
    *lock(&self.parameters) = parameters.clone();
  }

  fn start(&self, on_row: RowCallback, on_finished: FinishCallback) -> Result<(), PipelineError> {
    let token = CancellationToken::new();
    if let Some(previous) = lock(&self.current).replace(token.clone()) {
      previous.cancel();
    }
    let mut worker = lock(&self.worker);
    if let Some(previous) = worker.take() {
      if previous.join().is_err() {
        warn!(pipeline = %self.name, "previous pipeline thread panicked");
      }
    }
    let source = self.source.clone();
    let active = self.active.clone();
    let poll = self.poll_interval;
    active.fetch_add(1, Ordering::AcqRel);

    let spawned = thread::Builder::new()
      .name(format!("pipeline-{}", self.name))
      .spawn(move || {
        let running = scopeguard::guard(active, |a| {
          a.fetch_sub(1, Ordering::AcqRel);
        });
        let outcome = loop {
          if token.is_cancelled() {
            break RunOutcome::Stopped;
          }
          let next = lock(&source).recv_timeout(poll);
          match next {
            Ok(row) => on_row(row),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break RunOutcome::Completed { errors: 0 },
          }
        };
        // Not running any more by the time anyone hears about it.
        drop(running);
        on_finished(outcome);
      });

    match spawned {
      Ok(handle) => {
        *worker = Some(handle);
        self.starts.fetch_add(1, Ordering::Relaxed);
        Ok(())
      }
      Err(e) => {
        self.active.fetch_sub(1, Ordering::AcqRel);
        warn!(pipeline = %self.name, error = %e, "failed to spawn pipeline thread");
        Err(PipelineError::StartFailed {
          pipeline: self.name.clone(),
          reason: e.to_string(),
        })
      }
    }
  }

  fn stop(&self) {
    if let Some(token) = lock(&self.current).take() {
      self.stops.fetch_add(1, Ordering::Relaxed);
      token.cancel();
    }
  }
}

impl Drop for MemoryServicePipeline {
  fn drop(&mut self) {
    if let Some(token) = lock(&self.current).take() {
      token.cancel();
    }
  }
}

// ============================================================================
// MemoryGeneration
// ============================================================================

#[derive(Default)]
struct InputState {
  buffer: VecDeque<Row>,
  received: Vec<Row>,
  finished: bool,
}

/// Bounded input with an optional row limit.
pub struct MemoryInput {
  state: Mutex<InputState>,
  space: Notify,
  capacity: usize,
  limit: Option<usize>,
}

impl MemoryInput {
  fn new(capacity: usize, limit: Option<usize>) -> Self {
    Self {
      state: Mutex::new(InputState::default()),
      space: Notify::new(),
      capacity: capacity.max(1),
      limit,
    }
  }

  /// Takes every buffered row, making room for further offers.
  pub fn drain(&self) -> Vec<Row> {
    let rows: Vec<Row> = lock(&self.state).buffer.drain(..).collect();
    self.space.notify_waiters();
    rows
  }

  /// Every row accepted so far, in order.
  pub fn received(&self) -> Vec<Row> {
    lock(&self.state).received.clone()
  }

  fn is_finished(&self) -> bool {
    lock(&self.state).finished
  }

  fn close(&self) {
    lock(&self.state).finished = true;
    self.space.notify_waiters();
  }
}

#[async_trait]
impl RowInput for MemoryInput {
  async fn offer(&self, row: Row, timeout: Duration) -> Result<(), OfferError> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
      let space = self.space.notified();
      {
        let mut state = lock(&self.state);
        if state.finished {
          return Err(OfferError::Closed(row));
        }
        if state.buffer.len() < self.capacity {
          state.received.push(row.clone());
          state.buffer.push_back(row);
          if self.limit.is_some_and(|limit| state.received.len() >= limit) {
            state.finished = true;
          }
          return Ok(());
        }
      }
      if tokio::time::timeout_at(deadline, space).await.is_err() {
        return Err(OfferError::Timeout(row));
      }
    }
  }

  fn finish(&self) {
    self.close();
  }
}

/// Downstream pipeline backed by a [`MemoryInput`].
pub struct MemoryGeneration {
  name: String,
  input: Arc<MemoryInput>,
  alive: AtomicBool,
  kills: AtomicU64,
}

impl MemoryGeneration {
  /// Creates a generation pipeline whose input buffers up to `capacity` rows.
  pub fn new(name: impl Into<String>, capacity: usize) -> Self {
    Self::build(name, capacity, None)
  }

  /// Creates a generation pipeline that finishes after accepting `limit` rows.
  pub fn with_limit(name: impl Into<String>, capacity: usize, limit: usize) -> Self {
    Self::build(name, capacity, Some(limit))
  }

  fn build(name: impl Into<String>, capacity: usize, limit: Option<usize>) -> Self {
    Self {
      name: name.into(),
      input: Arc::new(MemoryInput::new(capacity, limit)),
      alive: AtomicBool::new(true),
      kills: AtomicU64::new(0),
    }
  }

  /// The concrete input, for draining and inspection.
  pub fn memory_input(&self) -> &Arc<MemoryInput> {
    &self.input
  }

  /// Every row accepted so far.
  pub fn received(&self) -> Vec<Row> {
    self.input.received()
  }

  /// Marks the consumer as dead. Replays stop offering rows once they notice.
  pub fn abort(&self) {
    self.alive.store(false, Ordering::Release);
    self.input.space.notify_waiters();
  }

  /// Number of times a bound run was killed.
  pub fn kills(&self) -> u64 {
    self.kills.load(Ordering::Relaxed)
  }
}

impl GenerationPipeline for MemoryGeneration {
  fn name(&self) -> &str {
    &self.name
  }

  fn kill_current_run(&self) {
    self.kills.fetch_add(1, Ordering::Relaxed);
  }

  fn input(&self) -> Arc<dyn RowInput> {
    self.input.clone()
  }

  fn is_alive(&self) -> bool {
    self.alive.load(Ordering::Acquire)
  }

  fn is_finished(&self) -> bool {
    self.input.is_finished()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::row::RowMeta;
  use serde_json::json;
  use std::time::Instant;

  fn row(n: i64) -> Row {
    Row::new(Arc::new(RowMeta::new(["n"])), vec![json!(n)])
  }

  #[test]
  fn test_memory_run_rejects_unknown_step() {
    let run = MemoryRun::new("svc", ["output"]);
    let err = run
      .add_row_listener("missing", Arc::new(|_row: Row| {}))
      .unwrap_err();
    assert_eq!(err, PipelineError::UnknownStep("missing".to_string()));
  }

  #[test]
  fn test_memory_run_finishes_once() {
    let run = MemoryRun::new("svc", ["output"]);
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = seen.clone();
    run.add_finish_listener(Box::new(move |outcome| sink.lock().unwrap().push(outcome)));

    run.record_error();
    run.complete();
    run.stop();

    assert_eq!(
      *seen.lock().unwrap(),
      vec![RunOutcome::Completed { errors: 1 }]
    );
    assert_eq!(run.error_count(), 1);
    assert_eq!(run.outcome(), Some(RunOutcome::Completed { errors: 1 }));
  }

  #[tokio::test]
  async fn test_memory_input_limit_finishes_consumer() {
    let generation = MemoryGeneration::with_limit("gen", 10, 2);
    let input = generation.input();
    let timeout = Duration::from_millis(10);

    assert!(input.offer(row(1), timeout).await.is_ok());
    assert!(!generation.is_finished());
    assert!(input.offer(row(2), timeout).await.is_ok());
    assert!(generation.is_finished());
    assert!(matches!(
      input.offer(row(3), timeout).await,
      Err(OfferError::Closed(_))
    ));
    assert_eq!(generation.received().len(), 2);
  }

  #[tokio::test]
  async fn test_memory_input_times_out_when_full() {
    let generation = MemoryGeneration::new("gen", 1);
    let input = generation.input();
    let timeout = Duration::from_millis(10);

    input.offer(row(1), timeout).await.unwrap();
    assert!(matches!(
      input.offer(row(2), timeout).await,
      Err(OfferError::Timeout(_))
    ));

    generation.memory_input().drain();
    assert!(input.offer(row(2), timeout).await.is_ok());
  }

  #[test]
  fn test_service_pipeline_forwards_and_stops() {
    let pipeline = MemoryServicePipeline::new("svc");
    let feeder = pipeline.feeder().unwrap();
    let seen = Arc::new(Mutex::new(Vec::new()));
    let finished = Arc::new(Mutex::new(None));

    let sink = seen.clone();
    let done = finished.clone();
    pipeline
      .start(
        Arc::new(move |row: Row| sink.lock().unwrap().push(row)),
        Box::new(move |outcome| *done.lock().unwrap() = Some(outcome)),
      )
      .unwrap();

    feeder.send(row(1)).unwrap();
    feeder.send(row(2)).unwrap();
    let deadline = Instant::now() + Duration::from_secs(2);
    while seen.lock().unwrap().len() < 2 && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(seen.lock().unwrap().len(), 2);

    pipeline.stop();
    while finished.lock().unwrap().is_none() && Instant::now() < deadline {
      thread::sleep(Duration::from_millis(1));
    }
    assert_eq!(*finished.lock().unwrap(), Some(RunOutcome::Stopped));
    assert!(!pipeline.is_running());
    assert_eq!(pipeline.starts(), 1);
    assert_eq!(pipeline.stops(), 1);
  }

  #[test]
  fn test_restart_after_stop_keeps_every_row() {
    let pipeline = MemoryServicePipeline::new("svc");
    let feeder = pipeline.feeder().unwrap();
    let (finished_tx, finished_rx) = mpsc::channel();
    pipeline
      .start(
        Arc::new(|_row: Row| {}),
        Box::new(move |outcome| {
          finished_tx.send(outcome).unwrap();
        }),
      )
      .unwrap();

    pipeline.stop();
    assert_eq!(
      finished_rx.recv_timeout(Duration::from_secs(2)).unwrap(),
      RunOutcome::Stopped
    );
    assert!(!pipeline.is_running());

    let (rows_tx, rows_rx) = mpsc::channel();
    let rows_tx = Mutex::new(rows_tx);
    pipeline
      .start(
        Arc::new(move |row: Row| {
          rows_tx.lock().unwrap().send(row).unwrap();
        }),
        Box::new(|_outcome| {}),
      )
      .unwrap();
    feeder.send(row(1)).unwrap();

    let received = rows_rx.recv_timeout(Duration::from_secs(2)).unwrap();
    assert_eq!(received.values()[0], json!(1));
    assert_eq!(pipeline.starts(), 2);
    pipeline.stop();
  }
}
