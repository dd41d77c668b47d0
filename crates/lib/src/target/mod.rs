//! Task targets.
//!
//! A target is what a task declares it produces: either a set of filesystem
//! paths relative to the task dir, or a set of docker image tags. This module
//! verifies targets against a recorded `BuildInfo`, computes the target part of
//! a new `BuildInfo`, and cleans stale outputs before a rebuild or restore.

mod docker;
mod filesystem;

use std::collections::BTreeMap;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;

use crate::buildinfo::{BuildInfo, TargetInfo};
use crate::util::hash::HashError;

pub use docker::{DockerCli, ImageRegistry};
pub use filesystem::{EntryKind, TargetEntry};
pub(crate) use filesystem::rel_string;

#[derive(Debug, Error)]
pub enum TargetError {
  #[error("image not found: {0}")]
  ImageNotFound(String),

  #[error("docker {op} failed: {message}")]
  Docker { op: String, message: String },

  #[error("target path not found: {0}")]
  PathNotFound(PathBuf),

  #[error("invalid target path {0:?}: must be relative and must not contain '..'")]
  InvalidPath(String),

  #[error("refusing to remove protected path {0}")]
  ProtectedPath(PathBuf),

  #[error("io error on {path}: {source}")]
  Io {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to walk {path}: {message}")]
  Walk { path: PathBuf, message: String },

  #[error(transparent)]
  Hash(#[from] HashError),
}

impl TargetError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, TargetError::ImageNotFound(_) | TargetError::PathNotFound(_))
  }

  pub(crate) fn io(path: &Path, source: io::Error) -> Self {
    TargetError::Io {
      path: path.to_path_buf(),
      source,
    }
  }
}

/// Declared outputs of a task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TargetSpec {
  /// Paths relative to the task dir.
  Filesystem(Vec<String>),
  /// Image tags in the local registry.
  Docker(Vec<String>),
}

impl TargetSpec {
  pub fn paths(&self) -> &[String] {
    match self {
      TargetSpec::Filesystem(paths) => paths,
      TargetSpec::Docker(_) => &[],
    }
  }

  pub fn images(&self) -> &[String] {
    match self {
      TargetSpec::Docker(images) => images,
      TargetSpec::Filesystem(_) => &[],
    }
  }

  pub fn is_empty(&self) -> bool {
    match self {
      TargetSpec::Filesystem(paths) => paths.is_empty(),
      TargetSpec::Docker(images) => images.is_empty(),
    }
  }

  pub fn is_docker(&self) -> bool {
    matches!(self, TargetSpec::Docker(_))
  }
}

/// Why a target entry failed verification.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum Reason {
  DoesNotExist,
  SizeChanged,
  ModTimeChanged,
  HashChanged,
  CreatedAfterBuild,
  ForcedByNoCache,
}

impl Reason {
  /// Reasons that make a restore overwrite the entry from the artifact.
  pub fn warrants_fetch(self) -> bool {
    matches!(
      self,
      Reason::DoesNotExist | Reason::SizeChanged | Reason::ModTimeChanged | Reason::HashChanged
    )
  }

  /// Reasons that make a clean delete the entry.
  pub fn warrants_clean(self) -> bool {
    matches!(self, Reason::CreatedAfterBuild | Reason::ForcedByNoCache)
  }
}

/// Invalid entries keyed by `/`-separated path (or image tag) with every reason found.
pub type InvalidFiles = BTreeMap<String, Vec<Reason>>;

pub(crate) fn add_reason(invalid: &mut InvalidFiles, key: &str, reason: Reason) {
  let reasons = invalid.entry(key.to_string()).or_default();
  if !reasons.contains(&reason) {
    reasons.push(reason);
  }
}

/// Outcome of a target verification.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Verification {
  pub invalid: InvalidFiles,
}

impl Verification {
  pub fn is_valid(&self) -> bool {
    self.invalid.is_empty()
  }
}

/// Reject absolute paths and `..` segments.
pub fn validate_path(path: &str) -> Result<(), TargetError> {
  let p = Path::new(path);
  if path.is_empty() || p.is_absolute() || path.starts_with('/') || path.starts_with('\\') {
    return Err(TargetError::InvalidPath(path.to_string()));
  }
  if p.components().any(|c| matches!(c, Component::ParentDir | Component::Prefix(_) | Component::RootDir)) {
    return Err(TargetError::InvalidPath(path.to_string()));
  }
  Ok(())
}

/// A task's target bound to its task dir and image registry.
pub struct Target {
  dir: PathBuf,
  spec: TargetSpec,
  images: Arc<dyn ImageRegistry>,
  resolved: Option<Vec<TargetEntry>>,
}

impl std::fmt::Debug for Target {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Target")
      .field("dir", &self.dir)
      .field("spec", &self.spec)
      .finish_non_exhaustive()
  }
}

impl Target {
  pub fn new(dir: PathBuf, spec: TargetSpec, images: Arc<dyn ImageRegistry>) -> Self {
    Self {
      dir,
      spec,
      images,
      resolved: None,
    }
  }

  pub fn spec(&self) -> &TargetSpec {
    &self.spec
  }

  pub fn dir(&self) -> &Path {
    &self.dir
  }

  pub fn images(&self) -> &Arc<dyn ImageRegistry> {
    &self.images
  }

  /// True when every declared path (or image) is present.
  pub fn exists(&self) -> Result<bool, TargetError> {
    match &self.spec {
      TargetSpec::Filesystem(paths) => filesystem::exists(&self.dir, paths),
      TargetSpec::Docker(images) => {
        for image in images {
          if !self.images.exists(image)? {
            return Ok(false);
          }
        }
        Ok(true)
      }
    }
  }

  /// Expand directory targets into their entries. Memoized after the first success.
  pub fn resolve(&mut self) -> Result<&[TargetEntry], TargetError> {
    if self.resolved.is_none() {
      let entries = match &self.spec {
        TargetSpec::Filesystem(paths) => filesystem::resolve(&self.dir, paths)?,
        TargetSpec::Docker(_) => Vec::new(),
      };
      self.resolved = Some(entries);
    }
    Ok(self.resolved.as_deref().unwrap_or_default())
  }

  /// Existence and size check against a recorded build, without rehashing.
  pub fn verify_shallow(&self, info: &BuildInfo) -> Result<Verification, TargetError> {
    let mut invalid = InvalidFiles::new();
    match &self.spec {
      TargetSpec::Filesystem(paths) => {
        filesystem::verify_shallow(&self.dir, paths, &info.target.filesystem, &mut invalid)?;
      }
      TargetSpec::Docker(images) => {
        for image in images {
          if !self.images.exists(image)? {
            add_reason(&mut invalid, image, Reason::DoesNotExist);
          }
        }
      }
    }
    Ok(Verification { invalid })
  }

  /// Shallow checks plus content and image hash comparison.
  pub fn verify(&self, info: &BuildInfo) -> Result<Verification, TargetError> {
    let mut verification = self.verify_shallow(info)?;
    match &self.spec {
      TargetSpec::Filesystem(_) => {
        filesystem::verify_hashes(&self.dir, &info.target.filesystem, &mut verification.invalid)?;
      }
      TargetSpec::Docker(images) => {
        for image in images {
          if verification.invalid.contains_key(image) {
            continue;
          }
          let current = self.images.image_hash(image)?;
          match info.target.docker.get(image) {
            Some(recorded) if recorded.hash == current => {}
            _ => add_reason(&mut verification.invalid, image, Reason::HashChanged),
          }
        }
      }
    }
    Ok(verification)
  }

  /// The target part of a `BuildInfo`, computed from the current state.
  pub fn build_info(&mut self) -> Result<TargetInfo, TargetError> {
    let mut info = TargetInfo::default();
    match self.spec.clone() {
      TargetSpec::Filesystem(_) => {
        let entries = self.resolve()?;
        info.filesystem = filesystem::build_info(entries)?;
      }
      TargetSpec::Docker(images) => {
        for image in images {
          let hash = self.images.image_hash(&image)?;
          info.docker.insert(image, crate::buildinfo::ImageInfo { hash });
        }
      }
    }
    Ok(info)
  }

  /// Remove stale outputs.
  ///
  /// With a non-empty `invalid` set, only entries created after the build or
  /// forced by `--no-cache` are deleted; the rest are overwritten on restore.
  /// With an empty set, every declared path is deleted.
  pub fn clean(&mut self, invalid: &InvalidFiles) -> Result<(), TargetError> {
    let TargetSpec::Filesystem(paths) = &self.spec else {
      return Ok(());
    };

    if invalid.is_empty() {
      for path in paths {
        filesystem::remove(&self.dir, path)?;
      }
    } else {
      for (path, reasons) in invalid {
        if reasons.iter().any(|r| r.warrants_clean()) {
          filesystem::remove(&self.dir, path)?;
        }
      }
    }

    self.resolved = None;
    Ok(())
  }

  /// Mark every existing declared path for removal.
  pub fn forced_by_no_cache(&self) -> Result<InvalidFiles, TargetError> {
    let mut invalid = InvalidFiles::new();
    for path in self.spec.paths() {
      validate_path(path)?;
      if self.dir.join(path).symlink_metadata().is_ok() {
        add_reason(&mut invalid, path, Reason::ForcedByNoCache);
      }
    }
    Ok(invalid)
  }
}
