//! Window specifications and sliding aggregation over a row stream.
//!
//! A window is a bounded view over the rows of a continuously running pipeline.
//! Windows are bounded either by row count or by time:
//!
//! - **Row based**: the trailing `size` rows, republished every `every` rows
//! - **Time based**: the rows of the trailing `size` milliseconds, republished at
//!   most every `every` milliseconds
//!
//! Every window is additionally bounded by two ceilings, a maximum row count and a
//! maximum age, so a single request can never pin unbounded memory.
//!
//! # Example
//!
//! ```rust
//! use rowshare::window::{WindowCeilings, WindowMode, WindowSpec};
//! use std::time::Duration;
//!
//! let ceilings = WindowCeilings::new(100, Duration::from_secs(60));
//! let spec = WindowSpec::resolve(WindowMode::RowBased, 500, 0, None, ceilings).unwrap();
//! assert_eq!(spec.size(), 100);
//! ```

use crate::row::{Row, RowBatch};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;
use std::time::{Duration, Instant};

/// Unit a window is measured in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WindowMode {
  /// Sizes are row counts.
  RowBased,
  /// Sizes are milliseconds.
  TimeBased,
}

impl fmt::Display for WindowMode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      WindowMode::RowBased => write!(f, "rows"),
      WindowMode::TimeBased => write!(f, "time"),
    }
  }
}

/// Per-request ceiling override.
///
/// A limit only takes effect when it is expressed in the unit the window is *not*
/// measured in: a time limit bounds the age of rows in a row-based window, a row
/// limit bounds the number of rows in a time-based window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WindowLimit {
  /// Maximum number of rows.
  Rows(u64),
  /// Maximum row age.
  Time(Duration),
}

/// Upper bounds applied to every window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WindowCeilings {
  /// Maximum number of rows a window may hold.
  pub max_rows: u64,
  /// Maximum age of a row held by a window.
  pub max_time: Duration,
}

impl WindowCeilings {
  /// Creates ceilings from explicit bounds.
  pub fn new(max_rows: u64, max_time: Duration) -> Self {
    Self { max_rows, max_time }
  }

  /// Applies a cross-unit limit override for a window of the given mode.
  ///
  /// Limits in the window's own unit and zero limits are ignored.
  pub fn with_limit(self, mode: WindowMode, limit: Option<WindowLimit>) -> Self {
    match (mode, limit) {
      (WindowMode::RowBased, Some(WindowLimit::Time(max_time))) if !max_time.is_zero() => Self {
        max_time,
        ..self
      },
      (WindowMode::TimeBased, Some(WindowLimit::Rows(max_rows))) if max_rows > 0 => Self {
        max_rows,
        ..self
      },
      _ => self,
    }
  }

  /// The ceiling for quantities measured in the given mode's unit.
  fn for_mode(&self, mode: WindowMode) -> u64 {
    match mode {
      WindowMode::RowBased => self.max_rows,
      WindowMode::TimeBased => saturating_millis(self.max_time),
    }
  }
}

/// Whole milliseconds in `duration`, saturating at `u64::MAX`.
pub(crate) fn saturating_millis(duration: Duration) -> u64 {
  u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

/// Clamps a requested quantity into `0..=ceiling`, mapping non-positive requests to 0.
fn clamp(requested: i64, ceiling: u64) -> u64 {
  if requested <= 0 {
    0
  } else {
    (requested as u64).min(ceiling)
  }
}

/// A resolved window request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowSpec {
  mode: WindowMode,
  requested_size: i64,
  requested_every: i64,
  size: u64,
  every: u64,
  ceilings: WindowCeilings,
}

impl WindowSpec {
  /// Resolves a request against the configured ceilings.
  ///
  /// Returns `None` when the size clamps to zero; such a request has no window.
  pub fn resolve(
    mode: WindowMode,
    size: i64,
    every: i64,
    limit: Option<WindowLimit>,
    ceilings: WindowCeilings,
  ) -> Option<Self> {
    let ceilings = ceilings.with_limit(mode, limit);
    let ceiling = ceilings.for_mode(mode);
    let resolved_size = clamp(size, ceiling);
    if resolved_size == 0 {
      return None;
    }
    Some(Self {
      mode,
      requested_size: size,
      requested_every: every,
      size: resolved_size,
      every: clamp(every, ceiling),
      ceilings,
    })
  }

  /// Window unit.
  pub fn mode(&self) -> WindowMode {
    self.mode
  }

  /// Size as requested, before clamping.
  pub fn requested_size(&self) -> i64 {
    self.requested_size
  }

  /// Slide increment as requested, before clamping.
  pub fn requested_every(&self) -> i64 {
    self.requested_every
  }

  /// Clamped size (rows or milliseconds).
  pub fn size(&self) -> u64 {
    self.size
  }

  /// Clamped slide increment; 0 when none was requested.
  pub fn every(&self) -> u64 {
    self.every
  }

  /// Slide increment used by the aggregation. Without an explicit increment the
  /// window slides by its full size.
  pub fn effective_every(&self) -> u64 {
    if self.every == 0 { self.size } else { self.every }
  }

  /// Effective row ceiling.
  pub fn max_rows(&self) -> u64 {
    self.ceilings.max_rows
  }

  /// Effective time ceiling.
  pub fn max_time(&self) -> Duration {
    self.ceilings.max_time
  }
}

/// Sliding aggregation for one window.
///
/// Rows are pushed in stream order with their arrival instant. Whenever the slide
/// increment is reached the aggregation returns the window's full current contents.
#[derive(Debug)]
pub(crate) struct SlidingWindow {
  spec: WindowSpec,
  rows: VecDeque<(Instant, Row)>,
  since_publish: u64,
  last_publish: Option<Instant>,
}

impl SlidingWindow {
  pub(crate) fn new(spec: WindowSpec) -> Self {
    Self {
      spec,
      rows: VecDeque::new(),
      since_publish: 0,
      last_publish: None,
    }
  }

  /// Adds a row; returns a batch when the window slides.
  pub(crate) fn push(&mut self, row: Row, at: Instant) -> Option<RowBatch> {
    self.rows.push_back((at, row));
    match self.spec.mode {
      WindowMode::RowBased => {
        self.retain_count(self.spec.size);
        self.retain_age(at, self.spec.max_time());
        self.since_publish += 1;
        if self.since_publish < self.spec.effective_every() {
          return None;
        }
        self.since_publish = 0;
      }
      WindowMode::TimeBased => {
        self.retain_age(at, Duration::from_millis(self.spec.size));
        self.retain_count(self.spec.max_rows());
        let every = Duration::from_millis(self.spec.effective_every());
        if let Some(last) = self.last_publish {
          if at.saturating_duration_since(last) < every {
            return None;
          }
        }
        self.last_publish = Some(at);
      }
    }
    Some(RowBatch::new(
      self.rows.iter().map(|(_, row)| row.clone()).collect(),
    ))
  }

  fn retain_count(&mut self, max: u64) {
    while self.rows.len() as u64 > max {
      self.rows.pop_front();
    }
  }

  fn retain_age(&mut self, now: Instant, max_age: Duration) {
    while let Some((ts, _)) = self.rows.front() {
      if now.saturating_duration_since(*ts) >= max_age {
        self.rows.pop_front();
      } else {
        break;
      }
    }
  }
}
