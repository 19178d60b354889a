//! The snapshot service: lookup, recording on miss, replay on hit.

use super::cache::{CacheProvider, SnapshotCache};
use super::recorder::observe;
use super::replay::replay_into;
use super::{Snapshot, SnapshotPreview};
use crate::config::SnapshotConfig;
use crate::context::{ExecutionContext, StartupAction, StartupKind};
use crate::error::{CacheError, ObserveError, ReplayError};
use crate::key::ServiceKey;
use futures::FutureExt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// What happened to a recording started on a cache miss.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordOutcome {
  /// The snapshot was stored.
  Cached {
    /// Rows in the stored snapshot.
    rows: usize,
  },
  /// Another recording for the same key was stored first; this one was dropped.
  Discarded,
  /// The run did not produce a snapshot.
  Failed(ObserveError),
}

/// Pending result of a replay scheduled by [`SnapshotService::activate`].
#[derive(Debug)]
pub struct ReplayHandle {
  rx: oneshot::Receiver<Result<u64, ReplayError>>,
}

impl Future for ReplayHandle {
  type Output = Result<u64, ReplayError>;

  fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self
      .rx
      .poll_unpin(cx)
      .map(|result| result.unwrap_or(Err(ReplayError::Dropped)))
  }
}

/// Result of [`SnapshotService::activate`].
#[derive(Debug)]
pub enum Activation {
  /// A snapshot will be replayed; the service pipeline does not run.
  Optimized(ReplayHandle),
  /// The query runs normally. When a recording was started, its handle reports
  /// whether the result ended up in the cache.
  NotOptimized {
    /// Background recording, if one was started.
    recording: Option<JoinHandle<RecordOutcome>>,
  },
}

impl Activation {
  /// Returns true when a replay replaced the service run.
  pub fn is_optimized(&self) -> bool {
    matches!(self, Activation::Optimized(_))
  }

  fn not_optimized() -> Self {
    Activation::NotOptimized { recording: None }
  }
}

/// Records service results once and replays them for later queries.
pub struct SnapshotService {
  cache: Arc<dyn SnapshotCache>,
  offer_timeout: Duration,
}

impl SnapshotService {
  /// Enables snapshot caching.
  ///
  /// Fails when no eviction template is configured or the backend does not know it.
  pub fn new(provider: &dyn CacheProvider, config: &SnapshotConfig) -> Result<Self, CacheError> {
    let template = config
      .eviction_template
      .as_deref()
      .ok_or(CacheError::NotConfigured)?;
    let cache = provider.get_or_create(&config.cache_name, template)?;
    info!(cache = %config.cache_name, template, "snapshot caching enabled");
    Ok(Self::with_cache(cache, config.offer_timeout()))
  }

  /// Uses an existing cache.
  pub fn with_cache(cache: Arc<dyn SnapshotCache>, offer_timeout: Duration) -> Self {
    Self {
      cache,
      offer_timeout,
    }
  }

  /// Looks up the snapshot for `key`.
  pub fn lookup(&self, key: &ServiceKey) -> Option<Arc<Snapshot>> {
    self.cache.get(key)
  }

  /// Reports whether a snapshot exists for `key`, without running anything.
  pub fn preview(&self, key: &ServiceKey) -> SnapshotPreview {
    match self.lookup(key) {
      Some(snapshot) => SnapshotPreview::Available {
        rows: snapshot.len(),
        recorded_at: snapshot.recorded_at(),
      },
      None => SnapshotPreview::NotYetAvailable,
    }
  }

  /// Drops every cached snapshot.
  pub fn invalidate_all(&self) {
    self.cache.invalidate_all();
    info!("snapshot cache invalidated");
  }

  /// Prepares a query's execution.
  ///
  /// On a hit the context's service start is replaced by a replay of the cached
  /// snapshot and [`Activation::Optimized`] is returned. On a miss the service run
  /// is recorded in the background while it executes normally.
  ///
  /// Never fails: anything that prevents optimizing is logged and the query runs
  /// unoptimized. Must be called from within a tokio runtime to optimize.
  pub fn activate(&self, ctx: &mut ExecutionContext) -> Activation {
    let key = ctx.service_key();
    let runtime = match Handle::try_current() {
      Ok(runtime) => runtime,
      Err(e) => {
        warn!(service = %key, error = %e, "no async runtime, running unoptimized");
        return Activation::not_optimized();
      }
    };

    match self.lookup(&key) {
      Some(snapshot) => {
        debug!(service = %key, rows = snapshot.len(), "snapshot hit");
        Activation::Optimized(self.schedule_replay(ctx, snapshot, runtime))
      }
      None => {
        debug!(service = %key, "snapshot miss");
        Activation::NotOptimized {
          recording: self.start_recording(ctx, key, runtime),
        }
      }
    }
  }

  fn schedule_replay(
    &self,
    ctx: &mut ExecutionContext,
    snapshot: Arc<Snapshot>,
    runtime: Handle,
  ) -> ReplayHandle {
    let (tx, rx) = oneshot::channel();
    let generation = ctx.generation.clone();
    let offer_timeout = self.offer_timeout;
    let key = ctx.service_key();

    ctx
      .startup_actions
      .retain(|action| *action.kind() != StartupKind::StartService);
    ctx.startup_actions.push(StartupAction::new(
      StartupKind::ReplaySnapshot,
      move || {
        runtime.spawn(async move {
          let result = replay_into(&snapshot, generation.as_ref(), offer_timeout).await;
          match &result {
            Ok(rows) => debug!(service = %key, rows, "snapshot replayed"),
            Err(e) => warn!(service = %key, error = %e, "snapshot replay aborted"),
          }
          let _ = tx.send(result);
        });
      },
    ));

    ReplayHandle { rx }
  }

  fn start_recording(
    &self,
    ctx: &ExecutionContext,
    key: ServiceKey,
    runtime: Handle,
  ) -> Option<JoinHandle<RecordOutcome>> {
    let Some(run) = ctx.service_run.as_ref() else {
      debug!(service = %key, "no service run to record");
      return None;
    };
    let observation = match observe(run.as_ref(), &ctx.output_step) {
      Ok(observation) => observation,
      Err(e) => {
        warn!(service = %key, error = %e, "cannot record service run");
        return None;
      }
    };

    let cache = self.cache.clone();
    Some(runtime.spawn(async move {
      match observation.await {
        Ok(snapshot) => {
          let rows = snapshot.len();
          if cache.put_if_absent(key.clone(), Arc::new(snapshot)) {
            info!(service = %key, rows, "snapshot cached");
            RecordOutcome::Cached { rows }
          } else {
            debug!(service = %key, "snapshot already cached, discarding");
            RecordOutcome::Discarded
          }
        }
        Err(ObserveError::Cancelled) => {
          debug!(service = %key, "recorded run was cancelled");
          RecordOutcome::Failed(ObserveError::Cancelled)
        }
        Err(e) => {
          warn!(service = %key, error = %e, "recorded run failed, not caching");
          RecordOutcome::Failed(e)
        }
      }
    }))
  }
}
