//! Per-query execution context.
//!
//! The query layer builds one [`ExecutionContext`] per query before running its
//! pipelines. The snapshot service inspects it and may rewrite its startup actions,
//! for example replacing the default service start with a snapshot replay.

use crate::key::ServiceKey;
use crate::pipeline::{GenerationPipeline, PipelineRun};
use std::fmt;
use std::sync::Arc;

/// What a startup action does.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StartupKind {
  /// Starts the service pipeline run (the default action).
  StartService,
  /// Replays a cached snapshot instead of running the service pipeline.
  ReplaySnapshot,
  /// Any other action registered by the query layer.
  Other(String),
}

/// An action the query layer runs once all pipelines are wired.
pub struct StartupAction {
  kind: StartupKind,
  action: Box<dyn FnOnce() + Send>,
}

impl StartupAction {
  /// Creates an action.
  pub fn new<F>(kind: StartupKind, action: F) -> Self
  where
    F: FnOnce() + Send + 'static,
  {
    Self {
      kind,
      action: Box::new(action),
    }
  }

  /// What the action does.
  pub fn kind(&self) -> &StartupKind {
    &self.kind
  }

  /// Runs the action.
  pub fn run(self) {
    (self.action)()
  }
}

impl fmt::Debug for StartupAction {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("StartupAction")
      .field("kind", &self.kind)
      .finish()
  }
}

/// Everything the result-sharing layer may touch for one query.
pub struct ExecutionContext {
  /// Name of the service being queried.
  pub service_name: String,
  /// Literal filter-clause text pushed down to the service.
  pub filter: String,
  /// The service pipeline run about to execute, when one has been prepared.
  pub service_run: Option<Arc<dyn PipelineRun>>,
  /// Step of the service run whose rows form the result.
  pub output_step: String,
  /// Downstream pipeline consuming the service rows.
  pub generation: Arc<dyn GenerationPipeline>,
  /// Actions run once the query's pipelines are wired, in order.
  pub startup_actions: Vec<StartupAction>,
}

impl ExecutionContext {
  /// Creates a context with no service run and no startup actions.
  pub fn new(
    service_name: impl Into<String>,
    filter: impl Into<String>,
    generation: Arc<dyn GenerationPipeline>,
  ) -> Self {
    Self {
      service_name: service_name.into(),
      filter: filter.into(),
      service_run: None,
      output_step: String::new(),
      generation,
      startup_actions: Vec::new(),
    }
  }

  /// Attaches the service run and the step whose rows form the result.
  pub fn with_service_run(mut self, run: Arc<dyn PipelineRun>, output_step: impl Into<String>) -> Self {
    self.service_run = Some(run);
    self.output_step = output_step.into();
    self
  }

  /// Appends a startup action.
  pub fn with_startup_action(mut self, action: StartupAction) -> Self {
    self.startup_actions.push(action);
    self
  }

  /// The snapshot cache key for this query.
  pub fn service_key(&self) -> ServiceKey {
    ServiceKey::new(self.service_name.as_str(), self.filter.as_str())
  }

  /// Returns true if an action of the given kind is registered.
  pub fn has_startup_action(&self, kind: &StartupKind) -> bool {
    self.startup_actions.iter().any(|a| a.kind() == kind)
  }

  /// Runs and removes every startup action, in order. Returns how many ran.
  pub fn run_startup_actions(&mut self) -> usize {
    let actions = std::mem::take(&mut self.startup_actions);
    let count = actions.len();
    for action in actions {
      action.run();
    }
    count
  }
}

impl fmt::Debug for ExecutionContext {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("ExecutionContext")
      .field("service_name", &self.service_name)
      .field("filter", &self.filter)
      .field("output_step", &self.output_step)
      .field("generation", &self.generation.name())
      .field("startup_actions", &self.startup_actions)
      .finish()
  }
}
