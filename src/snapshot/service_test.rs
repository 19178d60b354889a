use super::*;
use crate::config::{EvictionTemplate, SnapshotConfig};
use crate::context::{ExecutionContext, StartupAction, StartupKind};
use crate::error::{CacheError, ObserveError};
use crate::key::ServiceKey;
use crate::pipeline::memory::{MemoryGeneration, MemoryRun};
use crate::row::{Row, RowMeta};
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn service() -> SnapshotService {
  let provider = MemoryCacheProvider::new([EvictionTemplate::new("default")]);
  let config = SnapshotConfig::default().with_eviction_template("default");
  SnapshotService::new(&provider, &config).unwrap()
}

fn rows(values: &[i64]) -> Vec<Row> {
  let meta = Arc::new(RowMeta::new(["n"]));
  values
    .iter()
    .map(|v| Row::new(meta.clone(), vec![json!(v)]))
    .collect()
}

fn values(rows: &[Row]) -> Vec<i64> {
  rows.iter().map(|r| r.values()[0].as_i64().unwrap()).collect()
}

fn context(filter: &str, run: Option<Arc<MemoryRun>>) -> (ExecutionContext, Arc<MemoryGeneration>) {
  let generation = Arc::new(MemoryGeneration::new("gen", 64));
  let mut ctx = ExecutionContext::new("orders", filter, generation.clone())
    .with_startup_action(StartupAction::new(StartupKind::StartService, || {}));
  if let Some(run) = run {
    ctx = ctx.with_service_run(run, "output");
  }
  (ctx, generation)
}

async fn record(service: &SnapshotService, filter: &str, values: &[i64]) -> RecordOutcome {
  let run = MemoryRun::new("orders", ["output"]);
  let (mut ctx, _) = context(filter, Some(run.clone()));
  let Activation::NotOptimized { recording: Some(recording) } = service.activate(&mut ctx) else {
    panic!("expected a recording");
  };
  for row in rows(values) {
    run.emit("output", row);
  }
  run.complete();
  recording.await.unwrap()
}

#[tokio::test]
async fn test_miss_records_then_hit_replays() {
  let service = service();
  let key = ServiceKey::new("orders", "region = 'EU'");

  assert_eq!(
    record(&service, "region = 'EU'", &[1, 2, 3]).await,
    RecordOutcome::Cached { rows: 3 }
  );
  assert_eq!(service.lookup(&key).unwrap().len(), 3);

  let (mut ctx, generation) = context("region = 'EU'", None);
  let Activation::Optimized(handle) = service.activate(&mut ctx) else {
    panic!("expected a replay");
  };
  assert!(!ctx.has_startup_action(&StartupKind::StartService));
  assert!(ctx.has_startup_action(&StartupKind::ReplaySnapshot));

  ctx.run_startup_actions();
  assert_eq!(handle.await.unwrap(), 3);
  assert_eq!(values(&generation.received()), vec![1, 2, 3]);
  assert_eq!(generation.kills(), 1);
}

#[tokio::test]
async fn test_failed_run_is_not_cached() {
  let service = service();
  let run = MemoryRun::new("orders", ["output"]);
  let (mut ctx, _) = context("x > 1", Some(run.clone()));
  let Activation::NotOptimized { recording: Some(recording) } = service.activate(&mut ctx) else {
    panic!("expected a recording");
  };

  for row in rows(&[1, 2]) {
    run.emit("output", row);
  }
  run.record_error();
  run.record_error();
  run.complete();

  assert_eq!(
    recording.await.unwrap(),
    RecordOutcome::Failed(ObserveError::Upstream { errors: 2 })
  );
  assert!(service.lookup(&ServiceKey::new("orders", "x > 1")).is_none());

  // The next query runs the service again.
  let (mut ctx, _) = context("x > 1", Some(MemoryRun::new("orders", ["output"])));
  assert!(!service.activate(&mut ctx).is_optimized());
  assert!(ctx.has_startup_action(&StartupKind::StartService));
}

#[tokio::test]
async fn test_stopped_run_is_not_cached() {
  let service = service();
  let run = MemoryRun::new("orders", ["output"]);
  let (mut ctx, _) = context("", Some(run.clone()));
  let Activation::NotOptimized { recording: Some(recording) } = service.activate(&mut ctx) else {
    panic!("expected a recording");
  };

  run.emit("output", rows(&[1]).remove(0));
  run.stop();

  assert_eq!(
    recording.await.unwrap(),
    RecordOutcome::Failed(ObserveError::Cancelled)
  );
  assert!(service.lookup(&ServiceKey::new("orders", "")).is_none());
}

#[tokio::test]
async fn test_replay_is_repeatable() {
  let service = service();
  record(&service, "", &[4, 5, 6, 7]).await;

  for _ in 0..3 {
    let (mut ctx, generation) = context("", None);
    let Activation::Optimized(handle) = service.activate(&mut ctx) else {
      panic!("expected a replay");
    };
    ctx.run_startup_actions();
    assert_eq!(handle.await.unwrap(), 4);
    assert_eq!(values(&generation.received()), vec![4, 5, 6, 7]);
  }
}

#[tokio::test]
async fn test_first_recording_wins() {
  let service = service();
  let first = MemoryRun::new("orders", ["output"]);
  let second = MemoryRun::new("orders", ["output"]);
  let (mut ctx_a, _) = context("f", Some(first.clone()));
  let (mut ctx_b, _) = context("f", Some(second.clone()));

  let Activation::NotOptimized { recording: Some(a) } = service.activate(&mut ctx_a) else {
    panic!("expected a recording");
  };
  let Activation::NotOptimized { recording: Some(b) } = service.activate(&mut ctx_b) else {
    panic!("expected a recording");
  };

  for row in rows(&[1]) {
    first.emit("output", row);
  }
  first.complete();
  assert_eq!(a.await.unwrap(), RecordOutcome::Cached { rows: 1 });

  for row in rows(&[1, 2]) {
    second.emit("output", row);
  }
  second.complete();
  assert_eq!(b.await.unwrap(), RecordOutcome::Discarded);

  assert_eq!(service.lookup(&ServiceKey::new("orders", "f")).unwrap().len(), 1);
}

#[tokio::test]
async fn test_filters_are_separate_entries() {
  let service = service();
  record(&service, "a = 1", &[1]).await;

  assert!(service.lookup(&ServiceKey::new("orders", "a = 1")).is_some());
  assert!(service.lookup(&ServiceKey::new("orders", "a=1")).is_none());
  assert!(service.lookup(&ServiceKey::new("customers", "a = 1")).is_none());
}

#[tokio::test]
async fn test_preview() {
  let service = service();
  let key = ServiceKey::new("orders", "");
  assert_eq!(service.preview(&key), SnapshotPreview::NotYetAvailable);

  record(&service, "", &[1, 2]).await;
  assert!(matches!(
    service.preview(&key),
    SnapshotPreview::Available { rows: 2, .. }
  ));

  service.invalidate_all();
  assert_eq!(service.preview(&key), SnapshotPreview::NotYetAvailable);
}

#[tokio::test]
async fn test_hit_keeps_other_startup_actions() {
  let service = service();
  record(&service, "", &[1]).await;

  let ran = Arc::new(AtomicUsize::new(0));
  let counter = ran.clone();
  let (ctx, _) = context("", None);
  let mut ctx = ctx.with_startup_action(StartupAction::new(
    StartupKind::Other("open-output".to_string()),
    move || {
      counter.fetch_add(1, Ordering::SeqCst);
    },
  ));

  let Activation::Optimized(handle) = service.activate(&mut ctx) else {
    panic!("expected a replay");
  };
  assert_eq!(ctx.run_startup_actions(), 2);
  assert_eq!(ran.load(Ordering::SeqCst), 1);
  assert_eq!(handle.await.unwrap(), 1);
}

#[tokio::test]
async fn test_unknown_output_step_runs_unoptimized() {
  let service = service();
  let run = MemoryRun::new("orders", ["output"]);
  let generation = Arc::new(MemoryGeneration::new("gen", 4));
  let mut ctx = ExecutionContext::new("orders", "", generation).with_service_run(run, "missing");

  assert!(matches!(
    service.activate(&mut ctx),
    Activation::NotOptimized { recording: None }
  ));
}

#[tokio::test]
async fn test_dropped_replay_action_reports_dropped() {
  let service = service();
  record(&service, "", &[1]).await;

  let (mut ctx, _) = context("", None);
  let Activation::Optimized(handle) = service.activate(&mut ctx) else {
    panic!("expected a replay");
  };
  drop(ctx);
  assert_eq!(handle.await, Err(crate::error::ReplayError::Dropped));
}

#[test]
fn test_activate_without_runtime_is_not_optimized() {
  let service = service();
  let (mut ctx, _) = context("", Some(MemoryRun::new("orders", ["output"])));
  assert!(matches!(
    service.activate(&mut ctx),
    Activation::NotOptimized { recording: None }
  ));
  assert!(ctx.has_startup_action(&StartupKind::StartService));
}

#[test]
fn test_new_requires_known_template() {
  let provider = MemoryCacheProvider::new([EvictionTemplate::new("default")]);

  let missing = SnapshotService::new(&provider, &SnapshotConfig::default());
  assert!(matches!(missing, Err(CacheError::NotConfigured)));

  let unknown = SnapshotService::new(
    &provider,
    &SnapshotConfig::default().with_eviction_template("nope"),
  );
  assert!(matches!(unknown, Err(CacheError::UnknownTemplate(name)) if name == "nope"));
}
