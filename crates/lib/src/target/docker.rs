//! Docker image targets.

use std::path::Path;
use std::process::{Command, Output};

use tracing::debug;

use super::TargetError;

/// A local container image registry.
pub trait ImageRegistry: Send + Sync {
  fn exists(&self, image: &str) -> Result<bool, TargetError>;

  /// Content id of an image; `TargetError::ImageNotFound` if absent.
  fn image_hash(&self, image: &str) -> Result<String, TargetError>;

  /// Export an image as a tar stream at `dest`.
  fn save(&self, image: &str, dest: &Path) -> Result<(), TargetError>;

  /// Import a tar stream produced by `save`.
  fn load(&self, src: &Path) -> Result<(), TargetError>;
}

/// Registry backed by the `docker` command line client.
#[derive(Debug, Clone)]
pub struct DockerCli {
  binary: String,
}

impl Default for DockerCli {
  fn default() -> Self {
    Self {
      binary: "docker".to_string(),
    }
  }
}

impl DockerCli {
  pub fn new(binary: impl Into<String>) -> Self {
    Self { binary: binary.into() }
  }

  fn run(&self, op: &str, args: &[&str]) -> Result<Output, TargetError> {
    debug!(binary = %self.binary, ?args, "running docker");
    Command::new(&self.binary)
      .args(args)
      .output()
      .map_err(|e| TargetError::Docker {
        op: op.to_string(),
        message: e.to_string(),
      })
  }

  fn check(op: &str, output: Output) -> Result<Output, TargetError> {
    if output.status.success() {
      return Ok(output);
    }
    Err(TargetError::Docker {
      op: op.to_string(),
      message: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    })
  }
}

impl ImageRegistry for DockerCli {
  fn exists(&self, image: &str) -> Result<bool, TargetError> {
    let output = self.run("inspect", &["image", "inspect", "--format", "{{.Id}}", image])?;
    Ok(output.status.success())
  }

  fn image_hash(&self, image: &str) -> Result<String, TargetError> {
    let output = self.run("inspect", &["image", "inspect", "--format", "{{.Id}}", image])?;
    if !output.status.success() {
      return Err(TargetError::ImageNotFound(image.to_string()));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
  }

  fn save(&self, image: &str, dest: &Path) -> Result<(), TargetError> {
    let dest = dest.to_string_lossy();
    let output = self.run("save", &["save", "-o", &dest, image])?;
    Self::check("save", output)?;
    Ok(())
  }

  fn load(&self, src: &Path) -> Result<(), TargetError> {
    let src = src.to_string_lossy();
    let output = self.run("load", &["load", "-i", &src])?;
    Self::check("load", output)?;
    Ok(())
  }
}
