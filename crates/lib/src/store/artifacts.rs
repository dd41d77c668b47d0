//! Local artifact blob store.
//!
//! Artifacts are written through a temporary file in the store directory and
//! only become visible under their id once the writer is finished, so a
//! crashed or failed pack never leaves a truncated blob behind.

use std::fs;
use std::io::{self, Read, Write};
use std::path::PathBuf;

use tempfile::NamedTempFile;
use tracing::{debug, warn};

use crate::artifact::read_metadata;
use crate::platform::paths::is_protected;

use super::{StoreError, validate_id};

/// A blob being written to an artifact store.
///
/// Dropping a writer without calling `finish` discards the blob.
pub trait ArtifactWriter: Write + Send {
  fn finish(self: Box<Self>) -> Result<(), StoreError>;
}

/// Content-addressed blob store keyed by input hash.
pub trait ArtifactStore: Send + Sync {
  /// Begin a new artifact. An existing artifact with the same id is replaced on finish.
  fn put(&self, id: &str) -> Result<Box<dyn ArtifactWriter>, StoreError>;

  /// Open an artifact for reading; `StoreError::ArtifactNotFound` if absent.
  fn get(&self, id: &str) -> Result<Box<dyn Read + Send>, StoreError>;

  fn exists(&self, id: &str) -> bool;

  fn list(&self) -> Result<Vec<String>, StoreError>;

  /// Delete every artifact, or only those whose metadata project matches.
  /// Returns the number of deleted artifacts.
  fn clean(&self, project: Option<&str>) -> Result<usize, StoreError>;
}

/// Artifact store backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalArtifactStore {
  base_path: PathBuf,
}

impl LocalArtifactStore {
  pub fn new(base_path: PathBuf) -> Self {
    Self { base_path }
  }

  pub fn base_path(&self) -> &PathBuf {
    &self.base_path
  }

  fn artifact_path(&self, id: &str) -> PathBuf {
    self.base_path.join(id)
  }

  fn ensure_dir(&self) -> Result<(), StoreError> {
    fs::create_dir_all(&self.base_path).map_err(|source| StoreError::CreateDir {
      path: self.base_path.clone(),
      source,
    })
  }

  fn delete(&self, id: &str) -> Result<(), StoreError> {
    let path = self.artifact_path(id);
    match fs::remove_file(&path) {
      Ok(()) => Ok(()),
      Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
      Err(source) => Err(StoreError::Delete { path, source }),
    }
  }

  fn project_of(&self, id: &str) -> Option<String> {
    let reader = self.get(id).ok()?;
    match read_metadata(reader) {
      Ok(meta) => Some(meta.project),
      Err(e) => {
        warn!(artifact = %id, error = %e, "failed to read artifact metadata");
        None
      }
    }
  }
}

struct LocalArtifactWriter {
  file: NamedTempFile,
  dest: PathBuf,
}

impl Write for LocalArtifactWriter {
  fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
    self.file.write(buf)
  }

  fn flush(&mut self) -> io::Result<()> {
    self.file.flush()
  }
}

impl ArtifactWriter for LocalArtifactWriter {
  fn finish(mut self: Box<Self>) -> Result<(), StoreError> {
    self.file.flush().map_err(StoreError::Write)?;
    let this = *self;
    this.file.persist(&this.dest).map_err(|e| StoreError::Write(e.error))?;
    debug!(path = %this.dest.display(), "artifact written");
    Ok(())
  }
}

impl ArtifactStore for LocalArtifactStore {
  fn put(&self, id: &str) -> Result<Box<dyn ArtifactWriter>, StoreError> {
    validate_id(id)?;
    self.ensure_dir()?;

    let file = NamedTempFile::new_in(&self.base_path).map_err(StoreError::Write)?;
    Ok(Box::new(LocalArtifactWriter {
      file,
      dest: self.artifact_path(id),
    }))
  }

  fn get(&self, id: &str) -> Result<Box<dyn Read + Send>, StoreError> {
    validate_id(id)?;
    let file = fs::File::open(self.artifact_path(id)).map_err(|e| {
      if e.kind() == io::ErrorKind::NotFound {
        StoreError::ArtifactNotFound(id.to_string())
      } else {
        StoreError::Read(e)
      }
    })?;
    Ok(Box::new(io::BufReader::new(file)))
  }

  fn exists(&self, id: &str) -> bool {
    validate_id(id).is_ok() && self.artifact_path(id).is_file()
  }

  fn list(&self) -> Result<Vec<String>, StoreError> {
    let entries = match fs::read_dir(&self.base_path) {
      Ok(entries) => entries,
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
      Err(e) => return Err(StoreError::Read(e)),
    };

    let mut ids = Vec::new();
    for entry in entries {
      let entry = entry.map_err(StoreError::Read)?;
      if !entry.file_type().map_err(StoreError::Read)?.is_file() {
        continue;
      }
      let name = entry.file_name().to_string_lossy().to_string();
      // In-flight writes are dot-prefixed temp files.
      if validate_id(&name).is_ok() {
        ids.push(name);
      }
    }

    ids.sort();
    Ok(ids)
  }

  fn clean(&self, project: Option<&str>) -> Result<usize, StoreError> {
    if is_protected(&self.base_path) {
      return Err(StoreError::ProtectedPath(self.base_path.clone()));
    }

    let mut deleted = 0;
    for id in self.list()? {
      if let Some(project) = project
        && self.project_of(&id).as_deref() != Some(project)
      {
        continue;
      }
      self.delete(&id)?;
      debug!(artifact = %id, "deleted artifact");
      deleted += 1;
    }

    Ok(deleted)
  }
}
