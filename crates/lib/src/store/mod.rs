//! Persistent stores for bob.
//!
//! Artifacts and build infos are both keyed by a task's input hash.
//!
//! # Layout
//!
//! ```text
//! <cache root>/.bobcache/
//! ├── artifacts/              # Compressed target archives
//! │   └── <input_hash>
//! └── buildinfos/             # BuildInfo records
//!     └── <input_hash>
//! ```

pub mod artifacts;
pub mod buildinfos;

use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::info;

use crate::consts::{ARTIFACTS_DIR, BUILDINFOS_DIR, CACHE_DIR_NAME};
use crate::platform::paths::cache_root;
use crate::target::{DockerCli, ImageRegistry};

pub use artifacts::{ArtifactStore, ArtifactWriter, LocalArtifactStore};
pub use buildinfos::{BUILDINFO_VERSION, BuildInfoStore, LocalBuildInfoStore};

#[derive(Debug, Error)]
pub enum StoreError {
  #[error("artifact not found: {0}")]
  ArtifactNotFound(String),

  #[error("build info not found: {0}")]
  BuildInfoNotFound(String),

  #[error("invalid store id: {0:?}")]
  InvalidId(String),

  #[error("refusing to delete protected path {0}")]
  ProtectedPath(PathBuf),

  #[error("failed to create store directory {path}: {source}")]
  CreateDir {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read store entry: {0}")]
  Read(#[source] io::Error),

  #[error("failed to write store entry: {0}")]
  Write(#[source] io::Error),

  #[error("failed to delete {path}: {source}")]
  Delete {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to parse build info: {0}")]
  Parse(#[source] serde_json::Error),

  #[error("failed to serialize build info: {0}")]
  Serialize(#[source] serde_json::Error),

  #[error("unsupported build info version {0}, expected {BUILDINFO_VERSION}")]
  UnsupportedVersion(u32),
}

impl StoreError {
  pub fn is_not_found(&self) -> bool {
    matches!(self, StoreError::ArtifactNotFound(_) | StoreError::BuildInfoNotFound(_))
  }
}

/// Ids are input hashes; anything that could escape the store directory is rejected.
pub(crate) fn validate_id(id: &str) -> Result<(), StoreError> {
  if id.is_empty() || !id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_') {
    return Err(StoreError::InvalidId(id.to_string()));
  }
  Ok(())
}

/// Everything a build reads and writes outside the workspace.
#[derive(Clone)]
pub struct Stores {
  pub artifacts: Arc<dyn ArtifactStore>,
  pub buildinfos: Arc<dyn BuildInfoStore>,
  pub images: Arc<dyn ImageRegistry>,
}

impl Stores {
  pub fn new(
    artifacts: Arc<dyn ArtifactStore>,
    buildinfos: Arc<dyn BuildInfoStore>,
    images: Arc<dyn ImageRegistry>,
  ) -> Self {
    Self {
      artifacts,
      buildinfos,
      images,
    }
  }

  /// Local stores below `root`, using the docker CLI as image registry.
  pub fn in_dir(root: &Path, images: Arc<dyn ImageRegistry>) -> Self {
    let base = root.join(CACHE_DIR_NAME);
    Self::new(
      Arc::new(LocalArtifactStore::new(base.join(ARTIFACTS_DIR))),
      Arc::new(LocalBuildInfoStore::new(base.join(BUILDINFOS_DIR))),
      images,
    )
  }

  /// Local stores at the default cache root.
  pub fn local() -> Self {
    Self::in_dir(&cache_root(), Arc::new(DockerCli::default()))
  }
}

impl std::fmt::Debug for Stores {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Stores").finish_non_exhaustive()
  }
}

#[derive(Debug, Default, serde::Serialize)]
pub struct CleanStats {
  pub artifacts_deleted: usize,
  pub buildinfos_deleted: usize,
}

impl CleanStats {
  pub fn total_deleted(&self) -> usize {
    self.artifacts_deleted + self.buildinfos_deleted
  }
}

/// Delete artifacts and build infos, optionally only those of one project.
pub fn clean(stores: &Stores, project: Option<&str>) -> Result<CleanStats, StoreError> {
  let stats = CleanStats {
    artifacts_deleted: stores.artifacts.clean(project)?,
    buildinfos_deleted: stores.buildinfos.clean(project)?,
  };

  info!(
    artifacts = stats.artifacts_deleted,
    buildinfos = stats.buildinfos_deleted,
    project = project.unwrap_or("*"),
    "cleaned stores"
  );

  Ok(stats)
}
