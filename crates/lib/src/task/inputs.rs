//! Input file collection.
//!
//! Patterns are relative to the task dir:
//! - `*`, `.` or `./` select every file below the dir
//! - a pattern naming an existing directory selects every file below it
//! - anything else is a glob (`**` crosses directories, `*` does not)
//! - a leading `!` turns the pattern into an exclusion
//!
//! The task's own target paths, excluded directories and the workspace marker
//! never count as inputs.

use std::path::{Path, PathBuf};

use globset::{GlobBuilder, GlobSet, GlobSetBuilder};
use tracing::debug;
use walkdir::WalkDir;

use crate::consts::{EXCLUDED_DIRS, WORKSPACE_MARKER};
use crate::target::TargetSpec;

use super::{Task, TaskError};

fn has_glob_meta(pattern: &str) -> bool {
  pattern.contains(['*', '?', '[', '{'])
}

/// Expand one manifest pattern into the glob(s) matched against relative paths.
fn expand(dir: &Path, pattern: &str) -> Vec<String> {
  let trimmed = pattern.trim().trim_start_matches("./").trim_end_matches('/');
  if trimmed.is_empty() || trimmed == "*" || trimmed == "." {
    return vec!["**".to_string()];
  }
  if !has_glob_meta(trimmed) && dir.join(trimmed).is_dir() {
    return vec![format!("{}/**", trimmed)];
  }
  vec![trimmed.to_string()]
}

fn build_globset(task: &Task, patterns: &[String]) -> Result<GlobSet, TaskError> {
  let mut builder = GlobSetBuilder::new();
  for pattern in patterns {
    let glob = GlobBuilder::new(pattern)
      .literal_separator(true)
      .build()
      .map_err(|e| TaskError::InvalidPattern {
        task: task.name.clone(),
        pattern: pattern.clone(),
        message: e.to_string(),
      })?;
    builder.add(glob);
  }
  builder.build().map_err(|e| TaskError::InvalidPattern {
    task: task.name.clone(),
    pattern: patterns.join(", "),
    message: e.to_string(),
  })
}

impl Task {
  /// Sorted, de-duplicated absolute paths of every file contributing to the input hash.
  pub fn collect_inputs(&self) -> Result<Vec<PathBuf>, TaskError> {
    let mut include = Vec::new();
    let mut ignore = Vec::new();

    for raw in &self.input_patterns {
      let raw = raw.trim();
      if raw.is_empty() {
        continue;
      }
      if let Some(negated) = raw.strip_prefix('!') {
        ignore.extend(expand(&self.dir, negated));
        continue;
      }

      let literal = raw.trim_start_matches("./");
      if !has_glob_meta(literal) && literal != "." && !literal.is_empty() && !self.dir.join(literal).exists() {
        return Err(TaskError::InputNotFound {
          task: self.name.clone(),
          pattern: raw.to_string(),
        });
      }
      include.extend(expand(&self.dir, raw));
    }

    if include.is_empty() {
      return Ok(Vec::new());
    }

    if let Some(TargetSpec::Filesystem(paths)) = &self.target {
      for path in paths {
        let path = path.trim_start_matches("./").trim_end_matches('/');
        ignore.push(path.to_string());
        ignore.push(format!("{}/**", path));
      }
    }

    let include = build_globset(self, &include)?;
    let ignore = build_globset(self, &ignore)?;

    let walker = WalkDir::new(&self.dir).follow_links(false).into_iter().filter_entry(|e| {
      e.depth() == 0
        || !e.file_type().is_dir()
        || e
          .file_name()
          .to_str()
          .map(|name| !EXCLUDED_DIRS.contains(&name))
          .unwrap_or(true)
    });

    let mut inputs = Vec::new();
    for entry in walker {
      let entry = entry.map_err(|e| TaskError::Walk {
        task: self.name.clone(),
        message: e.to_string(),
      })?;

      let is_file = entry.file_type().is_file() || (entry.file_type().is_symlink() && entry.path().is_file());
      if !is_file || entry.file_name() == WORKSPACE_MARKER {
        continue;
      }

      let rel = crate::target::rel_string(&self.dir, entry.path());
      if include.is_match(&rel) && !ignore.is_match(&rel) {
        inputs.push(entry.into_path());
      }
    }

    inputs.sort();
    inputs.dedup();
    debug!(task = %self.name, inputs = inputs.len(), "collected inputs");
    Ok(inputs)
  }
}
