//! Artifacts: gzip-compressed tar archives of a task's target.
//!
//! # Layout
//!
//! ```text
//! __targets_filesystem/<path>    # target tree relative to the task dir, symlinks kept
//! __targets_docker/<image>.tar   # `docker save` output per image
//! __metadata                     # ArtifactMetadata as JSON, always last
//! ```

mod create;
mod extract;

use std::io::Read;

use flate2::read::GzDecoder;
use serde::{Deserialize, Serialize};

use crate::task::TaskError;

pub use create::create;
pub use extract::extract;

pub const METADATA_ENTRY: &str = "__metadata";
pub const FILESYSTEM_PREFIX: &str = "__targets_filesystem";
pub const DOCKER_PREFIX: &str = "__targets_docker";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetType {
  Filesystem,
  Docker,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ArtifactMetadata {
  pub project: String,
  pub taskname: String,
  pub input_hash: String,
  /// Seconds since the unix epoch.
  pub created_at: u64,
  pub target_type: TargetType,
}

/// File name used for an image inside an artifact.
pub(crate) fn image_file_name(image: &str) -> String {
  let sanitized: String = image
    .chars()
    .map(|c| if c == '/' || c == ':' || c == '@' { '_' } else { c })
    .collect();
  format!("{}.tar", sanitized)
}

fn invalid(message: impl Into<String>) -> TaskError {
  TaskError::InvalidArtifact {
    id: String::new(),
    message: message.into(),
  }
}

/// Read the metadata entry of an artifact stream.
pub fn read_metadata<R: Read>(reader: R) -> Result<ArtifactMetadata, TaskError> {
  let mut archive = tar::Archive::new(GzDecoder::new(reader));
  let entries = archive.entries().map_err(|e| invalid(e.to_string()))?;

  for entry in entries {
    let mut entry = entry.map_err(|e| invalid(e.to_string()))?;
    let is_metadata = entry
      .path()
      .map(|p| p.to_string_lossy() == METADATA_ENTRY)
      .map_err(|e| invalid(e.to_string()))?;
    if !is_metadata {
      continue;
    }

    let mut content = String::new();
    entry.read_to_string(&mut content).map_err(|e| invalid(e.to_string()))?;
    return serde_json::from_str(&content).map_err(|e| invalid(format!("bad metadata: {e}")));
  }

  Err(invalid("missing metadata entry"))
}

/// Names of every entry of an artifact stream, in archive order.
pub fn list_entries<R: Read>(reader: R) -> Result<Vec<String>, TaskError> {
  let mut archive = tar::Archive::new(GzDecoder::new(reader));
  let mut names = Vec::new();
  for entry in archive.entries().map_err(|e| invalid(e.to_string()))? {
    let entry = entry.map_err(|e| invalid(e.to_string()))?;
    let path = entry.path().map_err(|e| invalid(e.to_string()))?;
    names.push(path.to_string_lossy().to_string());
  }
  Ok(names)
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn image_names_are_flattened() {
    assert_eq!(image_file_name("bob/testimage:latest"), "bob_testimage_latest.tar");
    assert_eq!(image_file_name("alpine"), "alpine.tar");
  }

  #[test]
  fn garbage_has_no_metadata() {
    assert!(read_metadata(&b"definitely not gzip"[..]).is_err());
  }
}
