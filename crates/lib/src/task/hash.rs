//! Input hashing.
//!
//! The input hash of a task covers the content of every input file, the task
//! description (commands, environment, targets, ...) and `HASH_VERSION`. Two
//! invocations with identical inputs produce the same hash; any change to the
//! files or the description produces a different one.

use std::path::PathBuf;

use serde::Serialize;
use tracing::{debug, warn};

use crate::consts::{HASH_VERSION, IGNORED_ENV_KEYS};
use crate::target::TargetSpec;
use crate::util::hash::{Hasher, hash_bytes, hash_file};

use super::{Task, TaskError};

/// A computed input hash together with inputs that could not be read.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct InputHash {
  pub hash: String,
  /// Inputs skipped because of missing read permission.
  pub skipped: Vec<PathBuf>,
}

impl std::fmt::Display for InputHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.hash)
  }
}

fn is_ignored_env(entry: &str) -> bool {
  let key = entry.split_once('=').map(|(k, _)| k).unwrap_or(entry);
  IGNORED_ENV_KEYS.iter().any(|ignored| ignored.eq_ignore_ascii_case(key))
}

impl Task {
  /// Canonical description of everything besides input files that affects the output.
  pub fn description(&self) -> String {
    let mut out = String::new();

    out.push_str(&format!("name:{}\n", self.name));
    out.push_str(&format!("project:{}\n", self.project));
    for cmd in &self.commands {
      out.push_str(&format!("cmd:{}\n", cmd));
    }
    out.push_str(&format!("nixpkgs:{}\n", self.nixpkgs));

    let mut env: Vec<&str> = self
      .environment
      .iter()
      .map(String::as_str)
      .filter(|e| !is_ignored_env(e))
      .collect();
    env.sort_unstable();
    for entry in env {
      out.push_str(&format!("env:{}\n", entry));
    }

    match &self.target {
      Some(TargetSpec::Docker(images)) => {
        for image in images {
          out.push_str(&format!("image:{}\n", image));
        }
      }
      Some(TargetSpec::Filesystem(paths)) => {
        for path in paths {
          out.push_str(&format!("path:{}\n", path));
        }
      }
      None => {}
    }

    out
  }

  /// Hash inputs, description and hash version.
  ///
  /// Unreadable inputs (permission denied) are skipped and reported; every
  /// other read error is fatal.
  pub fn compute_input_hash(&self) -> Result<InputHash, TaskError> {
    let inputs = self.collect_inputs()?;

    let mut hasher = Hasher::new();
    let mut skipped = Vec::new();

    for path in inputs {
      match hash_file(&path) {
        Ok(content) => {
          hasher.update(crate::target::rel_string(&self.dir, &path));
          hasher.update([0u8]);
          hasher.update(&content.0);
          hasher.update(b"\n");
        }
        Err(e) if e.is_permission_denied() => {
          warn!(task = %self.name, path = %path.display(), "skipping unreadable input");
          skipped.push(path);
        }
        Err(e) => return Err(e.into()),
      }
    }

    hasher.update(&hash_bytes(self.description().as_bytes()).0);
    hasher.update(HASH_VERSION);

    let hash = hasher.finish().0;
    debug!(task = %self.name, hash = %hash, skipped = skipped.len(), "computed input hash");
    Ok(InputHash { hash, skipped })
  }
}
