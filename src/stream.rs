//! # Row Stream
//!
//! In-process fan-out channel: one producer appends rows, any number of subscribers
//! observe the same sequence.
//!
//! Delivery is synchronous. [`RowStream::append`] hands the row to every subscriber
//! in registration order while holding the registry lock, so all subscribers see
//! rows in exactly the order they were appended and a subscriber removed by
//! [`Subscription::cancel`] never sees another row once the call returns.
//!
//! Subscribers run on the appending thread and must not block.

use crate::row::Row;
use crate::sync::lock;
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Instant;

/// Receives rows appended to a [`RowStream`].
pub trait Subscriber: Send {
  /// Called once per appended row, in append order.
  fn on_row(&mut self, row: &Row, at: Instant);
}

impl<F> Subscriber for F
where
  F: FnMut(&Row, Instant) + Send,
{
  fn on_row(&mut self, row: &Row, at: Instant) {
    self(row, at)
  }
}

struct Registry {
  next_id: u64,
  subscribers: Vec<(u64, Box<dyn Subscriber>)>,
}

/// Shared row stream for one service step.
pub struct RowStream {
  name: String,
  registry: Mutex<Registry>,
  appended: AtomicU64,
}

impl RowStream {
  /// Creates an empty stream.
  pub fn new(name: impl Into<String>) -> Arc<Self> {
    Arc::new(Self {
      name: name.into(),
      registry: Mutex::new(Registry {
        next_id: 0,
        subscribers: Vec::new(),
      }),
      appended: AtomicU64::new(0),
    })
  }

  /// Stream name (the service step it belongs to).
  pub fn name(&self) -> &str {
    &self.name
  }

  /// Registers a subscriber. It observes every row appended after this call.
  pub fn subscribe<S>(self: &Arc<Self>, subscriber: S) -> Subscription
  where
    S: Subscriber + 'static,
  {
    let mut registry = lock(&self.registry);
    let id = registry.next_id;
    registry.next_id += 1;
    registry.subscribers.push((id, Box::new(subscriber)));
    Subscription {
      id,
      stream: Arc::downgrade(self),
      active: AtomicBool::new(true),
    }
  }

  /// Delivers a row to every subscriber. Returns how many received it.
  pub fn append(&self, row: Row) -> usize {
    let at = Instant::now();
    let mut registry = lock(&self.registry);
    self.appended.fetch_add(1, Ordering::Relaxed);
    for (_, subscriber) in registry.subscribers.iter_mut() {
      subscriber.on_row(&row, at);
    }
    registry.subscribers.len()
  }

  /// Number of live subscriptions.
  pub fn subscriber_count(&self) -> usize {
    lock(&self.registry).subscribers.len()
  }

  /// Total rows appended over the stream's lifetime.
  pub fn appended(&self) -> u64 {
    self.appended.load(Ordering::Relaxed)
  }

  fn remove(&self, id: u64) -> bool {
    let mut registry = lock(&self.registry);
    let before = registry.subscribers.len();
    registry.subscribers.retain(|(sid, _)| *sid != id);
    registry.subscribers.len() != before
  }
}

impl fmt::Debug for RowStream {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("RowStream")
      .field("name", &self.name)
      .field("subscribers", &self.subscriber_count())
      .field("appended", &self.appended())
      .finish()
  }
}

/// Handle to one registration on a [`RowStream`].
///
/// Dropping the handle cancels the registration.
#[derive(Debug)]
pub struct Subscription {
  id: u64,
  stream: Weak<RowStream>,
  active: AtomicBool,
}

impl Subscription {
  /// Removes the subscriber from the stream.
  ///
  /// Returns true only for the call that actually released the registration.
  pub fn cancel(&self) -> bool {
    if !self.active.swap(false, Ordering::AcqRel) {
      return false;
    }
    match self.stream.upgrade() {
      Some(stream) => stream.remove(self.id),
      None => true,
    }
  }

  /// Returns true until the subscription is cancelled.
  pub fn is_active(&self) -> bool {
    self.active.load(Ordering::Acquire)
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.cancel();
  }
}
