//! Initialize a new bob workspace.
//!
//! `bob init` writes a starter `bob.yaml` and the `.bob.workspace` marker
//! that makes the directory an aggregation root.

mod templates;

use std::fs;
use std::path::PathBuf;

use thiserror::Error;
use tracing::info;

use crate::consts::{BOBFILE_NAME, WORKSPACE_MARKER};

pub use templates::BOBFILE_TEMPLATE;

/// Errors that can occur during initialization.
#[derive(Debug, Error)]
pub enum InitError {
  #[error("file already exists: {}", path.display())]
  PathExists { path: PathBuf },

  #[error("failed to create directory {}: {source}", path.display())]
  CreateDir { path: PathBuf, source: std::io::Error },

  #[error("failed to write file {}: {source}", path.display())]
  WriteFile { path: PathBuf, source: std::io::Error },
}

/// Options for initializing a workspace.
pub struct InitOptions {
  /// Directory to initialize; created if missing.
  pub dir: PathBuf,
}

/// Result of a successful initialization.
#[derive(Debug)]
pub struct InitResult {
  /// Path to the created bob.yaml
  pub bobfile: PathBuf,
  /// Path to the workspace marker (may have existed before)
  pub marker: PathBuf,
}

/// Project name derived from the directory name, restricted to the allowed charset.
fn project_name(dir: &std::path::Path) -> String {
  let name: String = dir
    .file_name()
    .map(|n| n.to_string_lossy().to_string())
    .unwrap_or_default()
    .chars()
    .map(|c| {
      if c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-') {
        c
      } else {
        '-'
      }
    })
    .collect();
  if name.is_empty() { "bob-project".to_string() } else { name }
}

/// Scaffold a workspace in `options.dir`.
///
/// # Errors
///
/// Returns `PathExists` if a bob.yaml is already present.
pub fn init(options: &InitOptions) -> Result<InitResult, InitError> {
  let dir = &options.dir;
  fs::create_dir_all(dir).map_err(|e| InitError::CreateDir {
    path: dir.clone(),
    source: e,
  })?;

  let bobfile = dir.join(BOBFILE_NAME);
  let marker = dir.join(WORKSPACE_MARKER);

  if bobfile.exists() {
    return Err(InitError::PathExists { path: bobfile });
  }

  let content = BOBFILE_TEMPLATE.replace("{project}", &project_name(dir));
  fs::write(&bobfile, content).map_err(|e| InitError::WriteFile {
    path: bobfile.clone(),
    source: e,
  })?;

  if !marker.exists() {
    fs::write(&marker, "").map_err(|e| InitError::WriteFile {
      path: marker.clone(),
      source: e,
    })?;
  }

  info!(dir = %dir.display(), "initialized workspace");
  Ok(InitResult { bobfile, marker })
}
