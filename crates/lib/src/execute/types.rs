//! Error, option and result types of build execution.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use thiserror::Error;

use crate::playbook::{PlaybookError, PlaybookOptions, TaskState, TaskSummary};

use super::Cancel;
use super::env::{EnvProvider, HostEnv};
use super::executor::{Executor, ShellExecutor};

#[derive(Debug, Error)]
pub enum ExecuteError {
  #[error(transparent)]
  Playbook(#[from] PlaybookError),

  /// A task's command exited non-zero.
  #[error("task {task}: command failed with exit code {code:?}")]
  CmdFailed { task: String, code: Option<i32> },

  #[error("task {task}: failed to spawn {shell}: {source}")]
  Spawn {
    task: String,
    shell: String,
    #[source]
    source: std::io::Error,
  },

  #[error("io error: {0}")]
  Io(#[from] std::io::Error),

  #[error("build canceled")]
  Canceled,

  #[error("scheduler stalled: no task is ready and none is running")]
  Stalled,

  #[error("worker failed: {0}")]
  Join(String),
}

impl ExecuteError {
  pub fn is_user_error(&self) -> bool {
    match self {
      ExecuteError::Playbook(e) => e.is_user_error(),
      ExecuteError::CmdFailed { .. } => true,
      _ => false,
    }
  }

  pub fn is_canceled(&self) -> bool {
    matches!(self, ExecuteError::Canceled)
  }
}

/// One command invocation for the executor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecRequest {
  /// Task or run name, for log output.
  pub name: String,
  /// Run in order as one script; the first failure stops it.
  pub commands: Vec<String>,
  pub dir: PathBuf,
  /// Complete `KEY=VALUE` environment; nothing is inherited.
  pub env: Vec<String>,
}

/// Options of a build invocation.
#[derive(Debug, Clone)]
pub struct BuildOptions {
  pub max_parallel: usize,
  /// Neither restore nor create artifacts; remove existing targets before running.
  pub no_cache: bool,
  /// Extra `KEY=VALUE` entries for every task.
  pub env: Vec<String>,
  pub cancel: Cancel,
}

impl Default for BuildOptions {
  fn default() -> Self {
    Self {
      max_parallel: std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4),
      no_cache: false,
      env: Vec::new(),
      cancel: Cancel::new(),
    }
  }
}

impl BuildOptions {
  pub fn playbook_options(&self) -> PlaybookOptions {
    PlaybookOptions {
      no_cache: self.no_cache,
      env: self.env.clone(),
    }
  }
}

/// Collaborators that run commands.
#[derive(Clone)]
pub struct BuildContext {
  pub executor: Arc<dyn Executor>,
  pub env: Arc<dyn EnvProvider>,
}

impl BuildContext {
  pub fn new(executor: Arc<dyn Executor>, env: Arc<dyn EnvProvider>) -> Self {
    Self { executor, env }
  }

  /// Shell execution with the host environment.
  pub fn host(shell: Option<String>) -> Self {
    Self::new(Arc::new(ShellExecutor::new(shell)), Arc::new(HostEnv))
  }
}

impl std::fmt::Debug for BuildContext {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("BuildContext").finish_non_exhaustive()
  }
}

/// Outcome of a build.
#[derive(Debug, Serialize)]
pub struct BuildSummary {
  pub root: String,
  pub tasks: Vec<TaskSummary>,
  /// The first error, with the name of the task that produced it.
  #[serde(serialize_with = "serialize_error")]
  pub error: Option<(String, ExecuteError)>,
  pub canceled: bool,
  #[serde(with = "duration_ms")]
  pub duration: Duration,
}

fn serialize_error<S: serde::Serializer>(error: &Option<(String, ExecuteError)>, s: S) -> Result<S::Ok, S::Error> {
  match error {
    Some((task, e)) => s.serialize_some(&(task, e.to_string())),
    None => s.serialize_none(),
  }
}

mod duration_ms {
  use std::time::Duration;

  use serde::Serializer;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }
}

impl BuildSummary {
  pub fn is_success(&self) -> bool {
    self.error.is_none() && !self.canceled
  }

  pub fn count(&self, state: TaskState) -> usize {
    self.tasks.iter().filter(|t| t.state == state).count()
  }

  pub fn task(&self, name: &str) -> Option<&TaskSummary> {
    self.tasks.iter().find(|t| t.name == name)
  }
}
