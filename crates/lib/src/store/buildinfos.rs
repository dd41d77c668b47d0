//! Build info storage.
//!
//! Each record is a small versioned JSON document named after the input hash
//! it describes. Records are written atomically (temp file, then rename).

use std::fs;
use std::io;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::buildinfo::BuildInfo;
use crate::platform::paths::is_protected;

use super::{StoreError, validate_id};

/// Current on-disk format version. Readers reject anything else.
pub const BUILDINFO_VERSION: u32 = 1;

/// Persistent per-input-hash record store.
pub trait BuildInfoStore: Send + Sync {
  fn put(&self, id: &str, info: &BuildInfo) -> Result<(), StoreError>;

  /// `StoreError::BuildInfoNotFound` if no record exists.
  fn get(&self, id: &str) -> Result<BuildInfo, StoreError>;

  fn exists(&self, id: &str) -> bool;

  fn list(&self) -> Result<Vec<String>, StoreError>;

  /// Delete every record, or only those whose project matches.
  fn clean(&self, project: Option<&str>) -> Result<usize, StoreError>;
}

#[derive(Debug, Serialize, Deserialize)]
struct Record {
  version: u32,
  buildinfo: BuildInfo,
}

/// Build info store backed by a local directory.
#[derive(Debug, Clone)]
pub struct LocalBuildInfoStore {
  base_path: PathBuf,
}

impl LocalBuildInfoStore {
  pub fn new(base_path: PathBuf) -> Self {
    Self { base_path }
  }

  pub fn base_path(&self) -> &PathBuf {
    &self.base_path
  }

  fn record_path(&self, id: &str) -> PathBuf {
    self.base_path.join(id)
  }

  fn ensure_dir(&self) -> Result<(), StoreError> {
    fs::create_dir_all(&self.base_path).map_err(|source| StoreError::CreateDir {
      path: self.base_path.clone(),
      source,
    })
  }
}

impl BuildInfoStore for LocalBuildInfoStore {
  fn put(&self, id: &str, info: &BuildInfo) -> Result<(), StoreError> {
    validate_id(id)?;
    self.ensure_dir()?;

    let path = self.record_path(id);
    let temp_path = self.base_path.join(format!(".{}.tmp", id));

    let record = Record {
      version: BUILDINFO_VERSION,
      buildinfo: info.clone(),
    };
    let content = serde_json::to_vec(&record).map_err(StoreError::Serialize)?;
    fs::write(&temp_path, &content).map_err(StoreError::Write)?;
    fs::rename(&temp_path, &path).map_err(StoreError::Write)?;

    debug!(id = %id, task = %info.meta.task, "build info written");
    Ok(())
  }

  fn get(&self, id: &str) -> Result<BuildInfo, StoreError> {
    validate_id(id)?;
    let content = fs::read(self.record_path(id)).map_err(|e| {
      if e.kind() == io::ErrorKind::NotFound {
        StoreError::BuildInfoNotFound(id.to_string())
      } else {
        StoreError::Read(e)
      }
    })?;

    let record: Record = serde_json::from_slice(&content).map_err(StoreError::Parse)?;
    if record.version != BUILDINFO_VERSION {
      return Err(StoreError::UnsupportedVersion(record.version));
    }

    Ok(record.buildinfo)
  }

  fn exists(&self, id: &str) -> bool {
    validate_id(id).is_ok() && self.record_path(id).is_file()
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
      let name = entry.file_name().to_string_lossy().to_string();
      if entry.file_type().map_err(StoreError::Read)?.is_file() && validate_id(&name).is_ok() {
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
      if let Some(project) = project {
        match self.get(&id) {
          Ok(info) if info.meta.project == project => {}
          _ => continue,
        }
      }

      let path = self.record_path(&id);
      match fs::remove_file(&path) {
        Ok(()) => deleted += 1,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(source) => return Err(StoreError::Delete { path, source }),
      }
    }

    Ok(deleted)
  }
}
