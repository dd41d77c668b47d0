//! Test utilities for bob-lib.
//!
//! In-memory stand-ins for the docker registry and the host environment, plus
//! small filesystem helpers shared by unit tests.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};

use crate::execute::EnvProvider;
use crate::store::Stores;
use crate::target::{ImageRegistry, TargetError};
use crate::task::Task;

/// In-memory registry. `save` writes the image name and hash into the tar
/// path; `load` reads them back and registers the image.
#[derive(Default)]
pub struct FakeRegistry {
  pub images: Mutex<BTreeMap<String, String>>,
}

impl FakeRegistry {
  pub fn with_image(name: &str, hash: &str) -> Self {
    let registry = Self::default();
    registry.insert(name, hash);
    registry
  }

  pub fn insert(&self, name: &str, hash: &str) {
    self.images.lock().unwrap().insert(name.to_string(), hash.to_string());
  }

  pub fn remove(&self, name: &str) {
    self.images.lock().unwrap().remove(name);
  }
}

impl ImageRegistry for FakeRegistry {
  fn exists(&self, image: &str) -> Result<bool, TargetError> {
    Ok(self.images.lock().unwrap().contains_key(image))
  }

  fn image_hash(&self, image: &str) -> Result<String, TargetError> {
    self
      .images
      .lock()
      .unwrap()
      .get(image)
      .cloned()
      .ok_or_else(|| TargetError::ImageNotFound(image.to_string()))
  }

  fn save(&self, image: &str, dest: &Path) -> Result<(), TargetError> {
    let hash = self.image_hash(image)?;
    fs::write(dest, format!("{}\n{}", image, hash)).map_err(|e| TargetError::io(dest, e))
  }

  fn load(&self, src: &Path) -> Result<(), TargetError> {
    let content = fs::read_to_string(src).map_err(|e| TargetError::io(src, e))?;
    let (name, hash) = content.split_once('\n').unwrap_or((&content, ""));
    self.insert(name, hash);
    Ok(())
  }
}

/// Environment provider returning a fixed list.
#[derive(Debug, Default, Clone)]
pub struct StaticEnv(pub Vec<String>);

impl EnvProvider for StaticEnv {
  fn environment(&self, _task: &Task) -> Vec<String> {
    self.0.clone()
  }
}

/// Local stores below `root` using the given fake registry.
pub fn temp_stores(root: &Path, registry: Arc<FakeRegistry>) -> Stores {
  Stores::in_dir(root, registry)
}

/// Write `content` to `dir/rel`, creating parent directories.
pub fn write_file(dir: &Path, rel: &str, content: &str) -> PathBuf {
  let path = dir.join(rel);
  if let Some(parent) = path.parent() {
    fs::create_dir_all(parent).unwrap();
  }
  fs::write(&path, content).unwrap();
  path
}

/// A filesystem task rooted at `dir` with the given inputs, commands and targets.
pub fn fs_task(name: &str, dir: &Path, inputs: &[&str], commands: &[&str], targets: &[&str]) -> Task {
  Task {
    name: name.to_string(),
    dir: dir.to_path_buf(),
    project: dir.display().to_string(),
    input_patterns: inputs.iter().map(|s| s.to_string()).collect(),
    commands: commands.iter().map(|s| s.to_string()).collect(),
    target: if targets.is_empty() {
      None
    } else {
      Some(crate::target::TargetSpec::Filesystem(
        targets.iter().map(|s| s.to_string()).collect(),
      ))
    },
    ..Task::default()
  }
}
