//! Replaying a [`Snapshot`] into a downstream pipeline.

use super::Snapshot;
use crate::error::ReplayError;
use crate::pipeline::{GenerationPipeline, OfferError};
use std::time::Duration;
use tracing::{debug, trace};

/// Pushes every snapshot row into `generation`'s input.
///
/// Any run already bound to the generation pipeline is killed first, since the
/// replay takes over its structures. Each row is offered with `offer_timeout`;
/// a timed-out offer is retried for as long as the consumer is alive, so rows are
/// neither buffered without bound nor dropped.
///
/// Returns the number of rows accepted. A consumer that finishes before every row
/// was pushed (for example on reaching a row limit) ends the replay successfully
/// with the partial count.
pub async fn replay_into(
  snapshot: &Snapshot,
  generation: &dyn GenerationPipeline,
  offer_timeout: Duration,
) -> Result<u64, ReplayError> {
  generation.kill_current_run();
  let input = generation.input();
  let mut pushed: u64 = 0;

  for row in snapshot.rows() {
    let mut pending = row.clone();
    loop {
      if generation.is_finished() {
        debug!(pipeline = generation.name(), pushed, "consumer finished before replay completed");
        return Ok(pushed);
      }
      if !generation.is_alive() {
        return Err(ReplayError::ConsumerGone { pushed });
      }
      match input.offer(pending, offer_timeout).await {
        Ok(()) => {
          pushed += 1;
          break;
        }
        Err(OfferError::Timeout(row)) => {
          trace!(pipeline = generation.name(), pushed, "offer timed out, retrying");
          pending = row;
        }
        Err(OfferError::Closed(_)) if generation.is_finished() => {
          debug!(pipeline = generation.name(), pushed, "consumer closed its input");
          return Ok(pushed);
        }
        Err(OfferError::Closed(_)) => return Err(ReplayError::ConsumerGone { pushed }),
      }
    }
  }

  input.finish();
  debug!(pipeline = generation.name(), pushed, "replay complete");
  Ok(pushed)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::pipeline::memory::MemoryGeneration;
  use crate::row::{Row, RowMeta};
  use serde_json::json;
  use std::sync::Arc;

  fn snapshot(n: i64) -> Snapshot {
    let meta = Arc::new(RowMeta::new(["n"]));
    Snapshot::new((1..=n).map(|i| Row::new(meta.clone(), vec![json!(i)])).collect())
  }

  fn values(rows: &[Row]) -> Vec<i64> {
    rows.iter().map(|r| r.values()[0].as_i64().unwrap()).collect()
  }

  #[tokio::test]
  async fn test_replay_pushes_all_rows() {
    let generation = MemoryGeneration::new("gen", 16);
    let count = replay_into(&snapshot(3), &generation, Duration::from_millis(10))
      .await
      .unwrap();

    assert_eq!(count, 3);
    assert_eq!(values(&generation.received()), vec![1, 2, 3]);
    assert!(generation.is_finished());
    assert_eq!(generation.kills(), 1);
  }

  #[tokio::test]
  async fn test_replay_stops_when_consumer_finishes_early() {
    let generation = MemoryGeneration::with_limit("gen", 16, 2);
    let count = replay_into(&snapshot(3), &generation, Duration::from_millis(10))
      .await
      .unwrap();

    assert_eq!(count, 2);
    assert_eq!(values(&generation.received()), vec![1, 2]);
  }

  #[tokio::test]
  async fn test_replay_retries_until_space_frees_up() {
    let generation = Arc::new(MemoryGeneration::new("gen", 1));
    let drainer = generation.clone();
    let drained = tokio::spawn(async move {
      let mut rows = Vec::new();
      while rows.len() < 4 {
        tokio::time::sleep(Duration::from_millis(5)).await;
        rows.extend(drainer.memory_input().drain());
      }
      rows
    });

    let count = replay_into(&snapshot(4), generation.as_ref(), Duration::from_millis(1))
      .await
      .unwrap();

    assert_eq!(count, 4);
    assert_eq!(values(&drained.await.unwrap()), vec![1, 2, 3, 4]);
  }

  #[tokio::test]
  async fn test_replay_aborts_when_consumer_dies() {
    let generation = Arc::new(MemoryGeneration::new("gen", 1));
    let killer = generation.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(20)).await;
      killer.abort();
    });

    let result = replay_into(&snapshot(3), generation.as_ref(), Duration::from_millis(2)).await;
    assert_eq!(result, Err(ReplayError::ConsumerGone { pushed: 1 }));
  }
}
