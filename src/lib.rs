//! # rowshare
//!
//! Result sharing for expensive, long-running pipelines.
//!
//! Many concurrent queries often ask for the output of the same upstream
//! computation. rowshare lets them share it instead of running it once per query:
//!
//! - **Snapshots**: the first query for a service and filter records the complete
//!   output of its run; later queries with the same key replay the recording into
//!   their own downstream pipeline ([`snapshot::SnapshotService`]).
//! - **Windows**: one continuously running pipeline feeds any number of sliding
//!   windows, row-count or time based. The pipeline starts on the first request
//!   and stops once no window is left ([`broadcast::WindowBroadcaster`]).
//!
//! The pipeline engine itself is abstracted behind the traits in [`pipeline`];
//! [`pipeline::memory`] provides an in-process implementation.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use rowshare::broadcast::{WindowBroadcaster, WindowRequest};
//! use rowshare::config::BroadcastConfig;
//! use rowshare::pipeline::memory::MemoryServicePipeline;
//! use rowshare::window::WindowMode;
//! use std::sync::Arc;
//!
//! let pipeline = Arc::new(MemoryServicePipeline::new("orders"));
//! let broadcaster = WindowBroadcaster::new(pipeline.clone(), BroadcastConfig::default());
//!
//! let request = WindowRequest::new("select * from orders", WindowMode::RowBased, 100).with_every(10);
//! let window = broadcaster.get_window(&request)?.expect("size is positive");
//! if let Some(batch) = window.batch() {
//!   println!("{} rows", batch.len());
//! }
//! # Ok::<(), rowshare::error::BroadcastError>(())
//! ```

// Documentation enforcement - treat missing docs as errors
#![deny(missing_docs)]

/// Window broadcaster sharing one upstream run between sliding windows.
pub mod broadcast;
/// Operator configuration loaded from JSON.
pub mod config;
/// Per-query execution context and startup actions.
pub mod context;
/// Error types.
pub mod error;
/// Map with idle expiry, capacity bound and an eviction callback.
pub mod expiring;
/// Snapshot and window cache keys.
pub mod key;
/// Window listeners subscribed to a row stream.
pub mod listener;
/// Pipeline engine interfaces and the in-memory engine.
pub mod pipeline;
/// Rows and row batches.
pub mod row;
/// Snapshot recording, caching and replay.
pub mod snapshot;
/// In-process fan-out of rows to subscribers.
pub mod stream;
/// Window specifications and sliding aggregation.
pub mod window;

mod sync;


pub use broadcast::{RunState, WindowBroadcaster, WindowRequest};
pub use config::RowshareConfig;
pub use error::{BroadcastError, CacheError, ConfigError, ObserveError, PipelineError, ReplayError};
pub use key::{ServiceKey, WindowKey};
pub use listener::WindowListener;
pub use row::{Row, RowBatch, RowMeta};
pub use snapshot::{Activation, Snapshot, SnapshotPreview, SnapshotService};
pub use window::{WindowLimit, WindowMode, WindowSpec};
