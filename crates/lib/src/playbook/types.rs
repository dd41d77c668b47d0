use std::path::PathBuf;
use std::time::Duration;

use serde::Serialize;

use crate::target::InvalidFiles;

/// Lifecycle of a task within one playbook.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum TaskState {
  #[default]
  Pending,
  Queued,
  Running,
  Completed,
  NoRebuildRequired,
  Failed,
  Canceled,
}

impl TaskState {
  pub fn is_terminal(self) -> bool {
    matches!(
      self,
      TaskState::Completed | TaskState::NoRebuildRequired | TaskState::Failed | TaskState::Canceled
    )
  }

  /// States that let dependents run.
  pub fn is_success(self) -> bool {
    matches!(self, TaskState::Completed | TaskState::NoRebuildRequired)
  }
}

impl std::fmt::Display for TaskState {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      TaskState::Pending => "pending",
      TaskState::Queued => "queued",
      TaskState::Running => "running",
      TaskState::Completed => "done",
      TaskState::NoRebuildRequired => "cached",
      TaskState::Failed => "failed",
      TaskState::Canceled => "canceled",
    };
    f.write_str(s)
  }
}

/// Why a task was (re)built instead of skipped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebuildCause {
  TaskForcedRebuild,
  DependencyChanged,
  InputNotFoundInBuildInfo,
  TargetInvalid,
  TargetNotInLocalStore,
}

impl std::fmt::Display for RebuildCause {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    let s = match self {
      RebuildCause::TaskForcedRebuild => "forced rebuild",
      RebuildCause::DependencyChanged => "dependency changed",
      RebuildCause::InputNotFoundInBuildInfo => "inputs changed",
      RebuildCause::TargetInvalid => "target invalid",
      RebuildCause::TargetNotInLocalStore => "target not in local store",
    };
    f.write_str(s)
  }
}

/// Result of `Playbook::next`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NextTask {
  /// This task is now `Queued` and must be run by the caller.
  Ready(usize),
  /// Nothing is ready yet; some task is still in flight.
  Wait,
  /// Every task is terminal, or a task failed or was canceled.
  Done,
}

/// Outcome of the rebuild decision for one task.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RebuildCheck {
  /// `None` means the recorded build is still valid.
  pub cause: Option<RebuildCause>,
  /// Target entries that failed verification, if any.
  pub invalid: InvalidFiles,
}

impl RebuildCheck {
  pub fn needed(&self) -> bool {
    self.cause.is_some()
  }

  /// Restoring from an artifact can satisfy this cause without running commands.
  pub fn restorable(&self) -> bool {
    matches!(
      self.cause,
      Some(RebuildCause::InputNotFoundInBuildInfo | RebuildCause::TargetInvalid)
    )
  }
}

#[derive(Debug, Clone, Serialize)]
pub struct TaskSummary {
  pub name: String,
  pub state: TaskState,
  pub cause: Option<RebuildCause>,
  #[serde(with = "duration_ms")]
  pub duration: Duration,
  pub skipped_inputs: Vec<PathBuf>,
  pub error: Option<String>,
}

mod duration_ms {
  use std::time::Duration;

  use serde::Serializer;

  pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
    s.serialize_u64(d.as_millis() as u64)
  }
}
