//! # Window Broadcaster
//!
//! Serves many concurrent windowed queries from one continuously running upstream
//! pipeline.
//!
//! Each service step gets one [`WindowBroadcaster`]. It owns a lazily created
//! [`RowStream`] that every upstream row is appended to, and a cache of
//! [`WindowListener`]s keyed by [`WindowKey`], so requests resolving to the same
//! window share one listener.
//!
//! The upstream run is demand driven:
//!
//! - the first [`get_window`](WindowBroadcaster::get_window) starts it
//! - listeners nobody asked for within the inactivity timeout are evicted by a
//!   time-boxed sweep on the row path
//! - once no listener is left, the next row stops the run
//!
//! Run state is a three-state machine guarded by one mutex:
//!
//! ```text
//! NotRunning ──get_window──▶ Running ──no listeners / stop_all──▶ Stopping
//!     ▲                         │                                    │
//!     └──────run finished───────┴◀───────────run finished────────────┘
//! ```
//!
//! Only the pipeline's finish callback leaves `Stopping`; requests arriving in the
//! meantime wait for it.
//!
//! Rows are checked and appended under that same mutex, so no row is appended
//! after the run left `Running` and a listener evicted by a sweep never sees
//! another row.

use crate::config::BroadcastConfig;
use crate::error::{BroadcastError, PipelineError};
use crate::expiring::ExpiringMap;
use crate::key::WindowKey;
use crate::listener::WindowListener;
use crate::pipeline::{FinishCallback, Parameters, RowCallback, RunOutcome, ServicePipeline};
use crate::row::Row;
use crate::stream::RowStream;
use crate::sync::{lock, wait_while};
use crate::window::{WindowLimit, WindowMode, WindowSpec};
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Run state of the upstream pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
  /// No run is active.
  NotRunning,
  /// A run is active and its rows are broadcast.
  Running,
  /// A stop was requested; rows are ignored until the run is gone.
  Stopping,
}

impl fmt::Display for RunState {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      RunState::NotRunning => write!(f, "not running"),
      RunState::Running => write!(f, "running"),
      RunState::Stopping => write!(f, "stopping"),
    }
  }
}

/// A windowed query against the broadcaster.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowRequest {
  /// Query text; part of the window's identity.
  pub query: String,
  /// Window unit.
  pub mode: WindowMode,
  /// Requested size, in rows or milliseconds.
  pub size: i64,
  /// Requested slide increment; 0 slides by the full size.
  pub every: i64,
  /// Optional ceiling override in the other unit.
  pub limit: Option<WindowLimit>,
  /// Parameters copied into the upstream pipeline when this request starts it.
  pub parameters: Parameters,
}

impl WindowRequest {
  /// Creates a request sliding by its full size.
  pub fn new(query: impl Into<String>, mode: WindowMode, size: i64) -> Self {
    Self {
      query: query.into(),
      mode,
      size,
      every: 0,
      limit: None,
      parameters: Parameters::new(),
    }
  }

  /// Sets the slide increment.
  pub fn with_every(mut self, every: i64) -> Self {
    self.every = every;
    self
  }

  /// Sets the ceiling override.
  pub fn with_limit(mut self, limit: WindowLimit) -> Self {
    self.limit = Some(limit);
    self
  }

  /// Adds a query parameter.
  pub fn with_parameter(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.parameters.insert(name.into(), value.into());
    self
  }
}

struct Core {
  state: RunState,
  generation: u64,
  stream: Option<Arc<RowStream>>,
  listeners: ExpiringMap<WindowKey, Arc<WindowListener>>,
  last_sweep: Instant,
}

struct Shared {
  step: String,
  pipeline: Arc<dyn ServicePipeline>,
  config: BroadcastConfig,
  core: Mutex<Core>,
  changed: Condvar,
}

/// Shares one upstream pipeline between any number of sliding windows.
///
/// Cloning is cheap; clones drive the same broadcaster.
#[derive(Clone)]
pub struct WindowBroadcaster {
  shared: Arc<Shared>,
}

impl WindowBroadcaster {
  /// Creates a broadcaster for `pipeline`. Nothing runs until the first window is
  /// requested.
  pub fn new(pipeline: Arc<dyn ServicePipeline>, config: BroadcastConfig) -> Self {
    let step = pipeline.name().to_string();
    let evicted_step = step.clone();
    let listeners = ExpiringMap::new()
      .with_idle_timeout(config.inactivity())
      .with_eviction_callback(
        move |key: &WindowKey, listener: Arc<WindowListener>, cause| {
          listener.unsubscribe();
          debug!(step = %evicted_step, window = %key, %cause, "window evicted");
        },
      );
    Self {
      shared: Arc::new(Shared {
        step,
        pipeline,
        config,
        core: Mutex::new(Core {
          state: RunState::NotRunning,
          generation: 0,
          stream: None,
          listeners,
          last_sweep: Instant::now(),
        }),
        changed: Condvar::new(),
      }),
    }
  }

  /// Returns the listener for the requested window, creating it and starting the
  /// upstream pipeline as needed.
  ///
  /// Returns `Ok(None)` when the requested size clamps to zero. When the pipeline
  /// cannot be started the listener created by this call is evicted again and the
  /// caller should fall back to running the query directly.
  pub fn get_window(
    &self,
    request: &WindowRequest,
  ) -> Result<Option<Arc<WindowListener>>, BroadcastError> {
    let shared = &self.shared;
    let Some(spec) = WindowSpec::resolve(
      request.mode,
      request.size,
      request.every,
      request.limit,
      shared.config.ceilings(),
    ) else {
      debug!(step = %shared.step, query = %request.query, size = request.size, "window size resolves to zero");
      return Ok(None);
    };
    let key = WindowKey::new(&request.query, &spec);

    let core = lock(&shared.core);
    let mut core = wait_while(&shared.changed, core, |core| core.state == RunState::Stopping);

    let now = Instant::now();
    let cached = core.listeners.get(&key, now).cloned();
    let (listener, created) = match cached {
      Some(listener) => (listener, false),
      None => {
        let step = &shared.step;
        let stream = core
          .stream
          .get_or_insert_with(|| RowStream::new(step.as_str()))
          .clone();
        let listener = Arc::new(WindowListener::subscribe(&stream, spec));
        core.listeners.insert(key.clone(), listener.clone(), now);
        debug!(step = %shared.step, window = %key, "window created");
        (listener, true)
      }
    };

    if core.state == RunState::NotRunning {
      if let Err(e) = shared.start(&mut core, &request.parameters) {
        if created {
          core.listeners.remove(&key);
        }
        return Err(e.into());
      }
    }
    Ok(Some(listener))
  }

  /// Evicts every listener. Returns how many were evicted.
  ///
  /// The upstream run keeps going until its next row finds no listener.
  pub fn clear_cache(&self) -> usize {
    let evicted = lock(&self.shared.core).listeners.clear();
    debug!(step = %self.shared.step, evicted, "window cache cleared");
    evicted
  }

  /// Stops the upstream pipeline and evicts every listener.
  ///
  /// Blocks until the pipeline reports the run finished, so no run is left once
  /// this returns. Returns true for the call that performed the teardown. Callers
  /// arriving while a stop is in progress wait for it to finish and return false.
  pub fn stop_all(&self) -> bool {
    let shared = &self.shared;
    let mut core = lock(&shared.core);
    match core.state {
      RunState::Stopping => {
        let _core = wait_while(&shared.changed, core, |core| core.state == RunState::Stopping);
        false
      }
      RunState::NotRunning => {
        core.listeners.clear();
        false
      }
      RunState::Running => {
        core.state = RunState::Stopping;
        let evicted = core.listeners.clear();
        drop(core);

        shared.pipeline.stop();

        let core = lock(&shared.core);
        let _core = wait_while(&shared.changed, core, |core| core.state == RunState::Stopping);
        info!(step = %shared.step, evicted, "broadcaster stopped");
        true
      }
    }
  }

  /// Current run state.
  pub fn state(&self) -> RunState {
    lock(&self.shared.core).state
  }

  /// Number of cached listeners, including idle ones not yet swept.
  pub fn listener_count(&self) -> usize {
    lock(&self.shared.core).listeners.len()
  }

  /// Name of the service step this broadcaster serves.
  pub fn step_name(&self) -> &str {
    &self.shared.step
  }
}

impl fmt::Debug for WindowBroadcaster {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let core = lock(&self.shared.core);
    f.debug_struct("WindowBroadcaster")
      .field("step", &self.shared.step)
      .field("state", &core.state)
      .field("generation", &core.generation)
      .field("listeners", &core.listeners.len())
      .finish()
  }
}

impl Shared {
  /// Starts a new run. Called with the core locked and the state `NotRunning`.
  fn start(self: &Arc<Self>, core: &mut Core, parameters: &Parameters) -> Result<(), PipelineError> {
    core.state = RunState::Running;
    core.generation += 1;
    let generation = core.generation;

    self.pipeline.copy_parameters(parameters);

    let weak = Arc::downgrade(self);
    let on_row: RowCallback = Arc::new(move |row: Row| {
      if let Some(shared) = weak.upgrade() {
        shared.forward_row(generation, row);
      }
    });
    let weak = Arc::downgrade(self);
    let on_finished: FinishCallback = Box::new(move |outcome| {
      if let Some(shared) = weak.upgrade() {
        shared.on_finished(generation, outcome);
      }
    });

    match self.pipeline.start(on_row, on_finished) {
      Ok(()) => {
        info!(step = %self.step, generation, "upstream pipeline started");
        Ok(())
      }
      Err(e) => {
        core.state = RunState::NotRunning;
        warn!(step = %self.step, error = %e, "upstream pipeline failed to start");
        Err(e)
      }
    }
  }

  fn forward_row(&self, generation: u64, row: Row) {
    let mut core = lock(&self.core);
    if core.state != RunState::Running || core.generation != generation {
      return;
    }

    let now = Instant::now();
    if now.saturating_duration_since(core.last_sweep) >= self.config.sweep_interval() {
      core.last_sweep = now;
      let evicted = core.listeners.sweep(now, self.config.sweep_budget());
      if evicted > 0 {
        debug!(step = %self.step, evicted, "idle windows swept");
      }
    }

    if !core.listeners.is_empty() {
      if let Some(stream) = &core.stream {
        stream.append(row);
      }
      return;
    }

    // Left in Stopping until the run reports finished.
    core.state = RunState::Stopping;
    drop(core);
    info!(step = %self.step, generation, "no windows left, stopping upstream pipeline");
    self.pipeline.stop();
  }

  fn on_finished(&self, generation: u64, outcome: RunOutcome) {
    let mut core = lock(&self.core);
    if core.generation != generation || core.state == RunState::NotRunning {
      return;
    }
    core.state = RunState::NotRunning;
    drop(core);
    self.changed.notify_all();
    info!(step = %self.step, generation, %outcome, "upstream run finished");
  }
}

impl Drop for Shared {
  fn drop(&mut self) {
    let core = self.core.get_mut().unwrap_or_else(PoisonError::into_inner);
    if core.state != RunState::NotRunning {
      self.pipeline.stop();
    }
  }
}
