//! Build info records.
//!
//! A `BuildInfo` describes the on-disk and registry state of a task's target at
//! the time it was built, keyed by the task's input hash. It is what cheap
//! (`verify_shallow`) and full (`verify`) target verification compare against.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Size recorded for directories, which carry no content hash.
pub const DIR_SIZE: i64 = -1;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BuildInfo {
  pub meta: Meta,
  #[serde(default)]
  pub target: TargetInfo,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Meta {
  /// Global task name.
  pub task: String,
  pub input_hash: String,
  /// Project label, used to clean records by project.
  #[serde(default)]
  pub project: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TargetInfo {
  #[serde(default)]
  pub filesystem: FilesystemInfo,
  #[serde(default)]
  pub docker: BTreeMap<String, ImageInfo>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilesystemInfo {
  /// Aggregate hash over every entry in sorted path order.
  pub hash: String,
  /// Entries keyed by `/`-separated path relative to the task dir.
  pub files: BTreeMap<String, FileInfo>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileInfo {
  pub size: i64,
  pub hash: String,
  /// Modification time in unix milliseconds. Zero when not recorded.
  #[serde(default)]
  pub modified: i64,
}

impl FileInfo {
  pub fn dir() -> Self {
    Self {
      size: DIR_SIZE,
      hash: String::new(),
      modified: 0,
    }
  }

  pub fn is_dir(&self) -> bool {
    self.size == DIR_SIZE
  }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageInfo {
  pub hash: String,
}

impl BuildInfo {
  pub fn new(task: &str, project: &str, input_hash: &str, target: TargetInfo) -> Self {
    Self {
      meta: Meta {
        task: task.to_string(),
        input_hash: input_hash.to_string(),
        project: project.to_string(),
      },
      target,
    }
  }
}
