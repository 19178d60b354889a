//! Window listener: one window's view over a shared [`RowStream`].

use crate::row::{Row, RowBatch};
use crate::stream::{RowStream, Subscription};
use crate::window::{SlidingWindow, WindowSpec};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Instant;

/// Latest batch produced for a window.
#[derive(Default)]
struct Latest {
  batch: RwLock<Option<Arc<RowBatch>>>,
  materialized: AtomicBool,
  batches: AtomicU64,
}

impl Latest {
  fn replace(&self, batch: RowBatch) {
    if !batch.is_empty() {
      self.materialized.store(true, Ordering::Release);
    }
    self.batches.fetch_add(1, Ordering::Relaxed);
    let mut slot = self
      .batch
      .write()
      .unwrap_or_else(std::sync::PoisonError::into_inner);
    *slot = Some(Arc::new(batch));
  }
}

/// A subscription to the shared row stream, aggregated into one window.
///
/// The listener holds only the most recent batch its window produced; older
/// batches are discarded when a new one arrives.
pub struct WindowListener {
  spec: WindowSpec,
  latest: Arc<Latest>,
  subscription: Subscription,
}

impl WindowListener {
  /// Subscribes a new window to `stream`.
  pub fn subscribe(stream: &Arc<RowStream>, spec: WindowSpec) -> Self {
    let latest = Arc::new(Latest::default());
    let mut window = SlidingWindow::new(spec.clone());
    let sink = latest.clone();
    let subscription = stream.subscribe(move |row: &Row, at: Instant| {
      if let Some(batch) = window.push(row.clone(), at) {
        sink.replace(batch);
      }
    });
    Self {
      spec,
      latest,
      subscription,
    }
  }

  /// The resolved window specification.
  pub fn spec(&self) -> &WindowSpec {
    &self.spec
  }

  /// The most recent batch, if the window has produced one.
  pub fn batch(&self) -> Option<Arc<RowBatch>> {
    self
      .latest
      .batch
      .read()
      .unwrap_or_else(std::sync::PoisonError::into_inner)
      .clone()
  }

  /// Returns true once the window has produced a non-empty batch.
  pub fn has_materialized_window(&self) -> bool {
    self.latest.materialized.load(Ordering::Acquire)
  }

  /// Number of batches produced so far.
  pub fn batches_produced(&self) -> u64 {
    self.latest.batches.load(Ordering::Relaxed)
  }

  /// Returns true until [`unsubscribe`](Self::unsubscribe) has been called.
  pub fn is_subscribed(&self) -> bool {
    self.subscription.is_active()
  }

  /// Releases the row stream subscription.
  ///
  /// Safe to call repeatedly; returns true only for the call that released it.
  /// The last produced batch stays readable.
  pub fn unsubscribe(&self) -> bool {
    self.subscription.cancel()
  }
}

impl fmt::Debug for WindowListener {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("WindowListener")
      .field("spec", &self.spec)
      .field("subscribed", &self.is_subscribed())
      .field("batches", &self.batches_produced())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::row::RowMeta;
  use crate::window::{WindowCeilings, WindowMode};
  use serde_json::json;
  use std::time::Duration;

  fn row(n: i64) -> Row {
    Row::new(Arc::new(RowMeta::new(["n"])), vec![json!(n)])
  }

  fn row_spec(size: i64, every: i64) -> WindowSpec {
    WindowSpec::resolve(
      WindowMode::RowBased,
      size,
      every,
      None,
      WindowCeilings::new(1_000, Duration::from_secs(60)),
    )
    .unwrap()
  }

  fn values(batch: &RowBatch) -> Vec<i64> {
    batch
      .rows()
      .iter()
      .map(|r| r.values()[0].as_i64().unwrap())
      .collect()
  }

  #[test]
  fn test_listener_keeps_latest_batch_only() {
    let stream = RowStream::new("step");
    let listener = WindowListener::subscribe(&stream, row_spec(3, 2));
    assert!(!listener.has_materialized_window());
    assert!(listener.batch().is_none());

    for n in 1..=5 {
      stream.append(row(n));
    }

    assert!(listener.has_materialized_window());
    assert_eq!(listener.batches_produced(), 2);
    assert_eq!(values(&listener.batch().unwrap()), vec![2, 3, 4]);
  }

  #[test]
  fn test_unsubscribe_is_idempotent() {
    let stream = RowStream::new("step");
    let listener = WindowListener::subscribe(&stream, row_spec(2, 1));
    stream.append(row(1));

    assert!(listener.unsubscribe());
    assert!(!listener.unsubscribe());
    assert!(!listener.is_subscribed());
    assert_eq!(stream.subscriber_count(), 0);

    stream.append(row(2));
    assert_eq!(values(&listener.batch().unwrap()), vec![1]);
  }
}
