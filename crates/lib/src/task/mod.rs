//! Tasks: the unit of work of a build.
//!
//! A `Task` is immutable once aggregation finishes. Per-run state (status,
//! memoized input hash, timings) lives in the playbook.

mod hash;
mod inputs;

use std::collections::BTreeMap;
use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::store::StoreError;
use crate::target::{ImageRegistry, Target, TargetError, TargetSpec};
use crate::util::hash::HashError;

pub use hash::InputHash;

#[derive(Debug, Error)]
pub enum TaskError {
  #[error("task {task}: input {pattern:?} does not exist")]
  InputNotFound { task: String, pattern: String },

  #[error("task {task}: invalid input pattern {pattern:?}: {message}")]
  InvalidPattern {
    task: String,
    pattern: String,
    message: String,
  },

  #[error("task {task}: export {name} not found at {path}")]
  ExportNotFound { task: String, name: String, path: PathBuf },

  #[error("failed to walk inputs of {task}: {message}")]
  Walk { task: String, message: String },

  #[error("invalid artifact {id}: {message}")]
  InvalidArtifact { id: String, message: String },

  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Target(#[from] TargetError),
}

impl TaskError {
  pub fn is_user_error(&self) -> bool {
    matches!(
      self,
      TaskError::InputNotFound { .. } | TaskError::InvalidPattern { .. } | TaskError::ExportNotFound { .. }
    )
  }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RebuildPolicy {
  #[default]
  OnChange,
  Always,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Task {
  /// Global, `/`-separated name.
  pub name: String,
  /// Directory commands run in; input patterns and targets are relative to it.
  pub dir: PathBuf,
  pub project: String,
  /// Include patterns; `!`-prefixed entries exclude.
  pub input_patterns: Vec<String>,
  pub commands: Vec<String>,
  pub depends_on: Vec<String>,
  /// `KEY=VALUE` entries.
  pub environment: Vec<String>,
  pub target: Option<TargetSpec>,
  pub rebuild: RebuildPolicy,
  /// Export name to path relative to `dir`.
  pub exports: BTreeMap<String, String>,
  pub dependencies: Vec<String>,
  pub nixpkgs: String,
}

impl Task {
  /// True for tasks with only dependencies, used to group others.
  pub fn is_compound(&self) -> bool {
    self.commands.is_empty() && self.target.is_none() && self.input_patterns.is_empty()
  }

  pub fn has_target(&self) -> bool {
    self.target.as_ref().is_some_and(|t| !t.is_empty())
  }

  /// A fresh target handle bound to this task's dir.
  pub fn target(&self, images: Arc<dyn ImageRegistry>) -> Option<Target> {
    self
      .target
      .as_ref()
      .filter(|t| !t.is_empty())
      .map(|spec| Target::new(self.dir.clone(), spec.clone(), images))
  }

  /// Every export must exist once the task's commands succeeded.
  pub fn verify_exports(&self) -> Result<(), TaskError> {
    for (name, path) in &self.exports {
      let abs = self.dir.join(path);
      if abs.symlink_metadata().is_err() {
        return Err(TaskError::ExportNotFound {
          task: self.name.clone(),
          name: name.clone(),
          path: abs,
        });
      }
    }
    Ok(())
  }

  /// Value of an environment entry, last definition wins.
  pub fn env_value(&self, key: &str) -> Option<&str> {
    self
      .environment
      .iter()
      .rev()
      .find_map(|entry| entry.split_once('=').filter(|(k, _)| *k == key).map(|(_, v)| v))
  }
}
