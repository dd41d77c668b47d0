use std::io;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use flate2::Compression;
use flate2::write::GzEncoder;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::store::ArtifactStore;
use crate::target::{Target, TargetSpec};
use crate::task::{Task, TaskError};

use super::{ArtifactMetadata, DOCKER_PREFIX, FILESYSTEM_PREFIX, METADATA_ENTRY, TargetType, image_file_name};

fn io_error(path: &Path, source: io::Error) -> TaskError {
  TaskError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Pack the current state of `target` into a new artifact keyed by `input_hash`.
///
/// Docker images are saved into a temporary directory that is removed on
/// every exit path. A failed pack never leaves a partial artifact behind.
pub fn create(
  store: &dyn ArtifactStore,
  task: &Task,
  target: &mut Target,
  input_hash: &str,
) -> Result<ArtifactMetadata, TaskError> {
  let target_type = if target.spec().is_docker() {
    TargetType::Docker
  } else {
    TargetType::Filesystem
  };

  let staging = TempDir::new().map_err(|e| io_error(&std::env::temp_dir(), e))?;
  let mut images = Vec::new();
  if let TargetSpec::Docker(tags) = target.spec().clone() {
    for image in tags {
      let path = staging.path().join(image_file_name(&image));
      target.images().save(&image, &path)?;
      debug!(image = %image, path = %path.display(), "saved image");
      images.push(path);
    }
  }

  let entries = target.resolve()?.to_vec();

  let writer = store.put(input_hash)?;
  let mut builder = tar::Builder::new(GzEncoder::new(writer, Compression::default()));
  builder.follow_symlinks(false);

  for entry in &entries {
    let name = format!("{}/{}", FILESYSTEM_PREFIX, entry.rel);
    builder
      .append_path_with_name(&entry.path, &name)
      .map_err(|e| io_error(&entry.path, e))?;
  }

  for path in &images {
    let name = format!(
      "{}/{}",
      DOCKER_PREFIX,
      path.file_name().map(|n| n.to_string_lossy().to_string()).unwrap_or_default()
    );
    builder.append_path_with_name(path, &name).map_err(|e| io_error(path, e))?;
  }

  let created_at = SystemTime::now()
    .duration_since(UNIX_EPOCH)
    .map(|d| d.as_secs())
    .unwrap_or_default();
  let metadata = ArtifactMetadata {
    project: task.project.clone(),
    taskname: task.name.clone(),
    input_hash: input_hash.to_string(),
    created_at,
    target_type,
  };
  let json = serde_json::to_vec(&metadata).map_err(|e| TaskError::InvalidArtifact {
    id: input_hash.to_string(),
    message: e.to_string(),
  })?;

  let mut header = tar::Header::new_gnu();
  header.set_size(json.len() as u64);
  header.set_mode(0o644);
  header.set_mtime(created_at);
  header.set_cksum();
  builder
    .append_data(&mut header, METADATA_ENTRY, json.as_slice())
    .map_err(|e| io_error(Path::new(METADATA_ENTRY), e))?;

  let encoder = builder.into_inner().map_err(|e| io_error(Path::new(input_hash), e))?;
  let writer = encoder.finish().map_err(|e| io_error(Path::new(input_hash), e))?;
  writer.finish()?;

  info!(
    task = %task.name,
    hash = %input_hash,
    entries = entries.len(),
    images = images.len(),
    "artifact created"
  );
  Ok(metadata)
}
