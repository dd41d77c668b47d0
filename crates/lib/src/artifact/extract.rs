use std::fs;
use std::io;
use std::path::{Component, Path, PathBuf};

use flate2::read::GzDecoder;
use tempfile::TempDir;
use tracing::{debug, info};

use crate::platform::paths::is_protected;
use crate::store::ArtifactStore;
use crate::target::{InvalidFiles, Target, TargetError};
use crate::task::{Task, TaskError};

use super::{DOCKER_PREFIX, FILESYSTEM_PREFIX, METADATA_ENTRY};

fn io_error(path: &Path, source: io::Error) -> TaskError {
  TaskError::Io {
    path: path.to_path_buf(),
    source,
  }
}

/// Whether an archived entry has to be written back.
///
/// An empty `invalid` set restores everything; otherwise only entries that
/// are missing or whose content changed.
fn should_fetch(invalid: &InvalidFiles, rel: &str) -> bool {
  if invalid.is_empty() {
    return true;
  }
  invalid
    .get(rel)
    .is_some_and(|reasons| reasons.iter().any(|r| r.warrants_fetch()))
}

/// Join an archived relative path below `dir`, rejecting anything that escapes it.
fn safe_join(dir: &Path, rel: &str) -> Result<PathBuf, TaskError> {
  let rel_path = Path::new(rel);
  if rel_path
    .components()
    .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
  {
    return Err(TaskError::Target(TargetError::InvalidPath(rel.to_string())));
  }
  let dest = dir.join(rel_path);
  if is_protected(&dest) {
    return Err(TaskError::Target(TargetError::ProtectedPath(dest)));
  }
  Ok(dest)
}

fn remove_existing(path: &Path) -> Result<(), TaskError> {
  let meta = match path.symlink_metadata() {
    Ok(meta) => meta,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(io_error(path, e)),
  };
  let result = if meta.file_type().is_dir() {
    fs::remove_dir_all(path)
  } else {
    fs::remove_file(path)
  };
  result.map_err(|e| io_error(path, e))
}

/// Restore `target` from the artifact keyed by `input_hash`.
///
/// Returns `Ok(false)` when no such artifact exists. Stale entries are cleaned
/// first; docker images are loaded from temporary files that are always
/// removed afterwards.
pub fn extract(
  store: &dyn ArtifactStore,
  task: &Task,
  target: &mut Target,
  input_hash: &str,
  invalid: &InvalidFiles,
) -> Result<bool, TaskError> {
  let reader = match store.get(input_hash) {
    Ok(reader) => reader,
    Err(e) if e.is_not_found() => {
      debug!(task = %task.name, hash = %input_hash, "no artifact to extract");
      return Ok(false);
    }
    Err(e) => return Err(e.into()),
  };

  target.clean(invalid)?;

  let staging = TempDir::new().map_err(|e| io_error(&std::env::temp_dir(), e))?;
  let mut archive = tar::Archive::new(GzDecoder::new(reader));
  archive.set_preserve_permissions(true);
  archive.set_preserve_mtime(true);
  archive.set_overwrite(true);

  let mut restored = 0usize;
  let mut loaded = 0usize;

  let entries = archive.entries().map_err(|e| io_error(Path::new(input_hash), e))?;
  for entry in entries {
    let mut entry = entry.map_err(|e| io_error(Path::new(input_hash), e))?;
    let name = entry
      .path()
      .map_err(|e| io_error(Path::new(input_hash), e))?
      .to_string_lossy()
      .to_string();

    if name == METADATA_ENTRY {
      continue;
    }

    if let Some(rel) = name.strip_prefix(&format!("{}/", FILESYSTEM_PREFIX)) {
      let rel = rel.trim_end_matches('/');
      if rel.is_empty() || !should_fetch(invalid, rel) {
        continue;
      }

      let dest = safe_join(&task.dir, rel)?;
      if entry.header().entry_type().is_dir() {
        if dest.symlink_metadata().is_ok_and(|m| m.is_dir()) {
          continue;
        }
        remove_existing(&dest)?;
        fs::create_dir_all(&dest).map_err(|e| io_error(&dest, e))?;
      } else {
        if let Some(parent) = dest.parent() {
          fs::create_dir_all(parent).map_err(|e| io_error(parent, e))?;
        }
        remove_existing(&dest)?;
        entry.unpack(&dest).map_err(|e| io_error(&dest, e))?;
      }
      restored += 1;
    } else if let Some(file) = name.strip_prefix(&format!("{}/", DOCKER_PREFIX)) {
      let file = Path::new(file)
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_else(|| "image.tar".into());
      let path = staging.path().join(file);
      entry.unpack(&path).map_err(|e| io_error(&path, e))?;
      target.images().load(&path)?;
      loaded += 1;
    } else {
      debug!(entry = %name, "ignoring unknown artifact entry");
    }
  }

  info!(
    task = %task.name,
    hash = %input_hash,
    restored,
    images = loaded,
    "artifact extracted"
  );
  Ok(true)
}
