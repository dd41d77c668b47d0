//! Hashing utilities for input hashes and target verification.
//!
//! This module provides:
//! - `Hasher`: a streaming, order-sensitive SHA-256 accumulator
//! - `ContentHash`: a full 64-character hash for content verification
//! - `hash_file()`: single file hashing
//! - `hash_bytes()`: arbitrary byte hashing

use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// A full 64-character SHA256 hash for content verification.
///
/// # Format
///
/// The hash is a lowercase hexadecimal string (64 characters).
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ContentHash(pub String);

impl std::fmt::Display for ContentHash {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    write!(f, "{}", self.0)
  }
}

/// Error while hashing a file.
#[derive(Debug, thiserror::Error)]
pub enum HashError {
  #[error("failed to open {path}: {source}")]
  Open {
    path: PathBuf,
    #[source]
    source: io::Error,
  },

  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: io::Error,
  },
}

impl HashError {
  /// Returns true if the file could not be opened or read because of missing permissions.
  pub fn is_permission_denied(&self) -> bool {
    match self {
      HashError::Open { source, .. } | HashError::Read { source, .. } => source.kind() == io::ErrorKind::PermissionDenied,
    }
  }

  pub fn path(&self) -> &Path {
    match self {
      HashError::Open { path, .. } | HashError::Read { path, .. } => path,
    }
  }
}

/// Streaming hash over files and byte sources.
///
/// Additions are order-sensitive. Callers that need order independence must
/// sort their sources before adding them.
#[derive(Debug, Clone, Default)]
pub struct Hasher {
  inner: Sha256,
}

impl Hasher {
  pub fn new() -> Self {
    Self::default()
  }

  /// Stream the contents of a file into the hash.
  pub fn add_file(&mut self, path: &Path) -> Result<(), HashError> {
    let file = fs::File::open(path).map_err(|source| HashError::Open {
      path: path.to_path_buf(),
      source,
    })?;

    self.add_bytes(file).map_err(|source| HashError::Read {
      path: path.to_path_buf(),
      source,
    })?;

    Ok(())
  }

  /// Stream everything a reader yields into the hash, returning the byte count.
  pub fn add_bytes<R: Read>(&mut self, mut reader: R) -> io::Result<u64> {
    let mut buffer = [0u8; 8192];
    let mut total = 0u64;

    loop {
      let bytes_read = match reader.read(&mut buffer) {
        Ok(n) => n,
        Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
        Err(e) => return Err(e),
      };
      if bytes_read == 0 {
        break;
      }
      self.inner.update(&buffer[..bytes_read]);
      total += bytes_read as u64;
    }

    Ok(total)
  }

  /// Add an in-memory buffer.
  pub fn update(&mut self, data: impl AsRef<[u8]>) {
    self.inner.update(data.as_ref());
  }

  /// Raw digest bytes.
  pub fn sum(self) -> Vec<u8> {
    self.inner.finalize().to_vec()
  }

  /// Lowercase hex encoding of the digest.
  pub fn finish(self) -> ContentHash {
    ContentHash(hex::encode(self.sum()))
  }
}

/// Hash a file's contents.
///
/// Returns the full 64-character SHA256 hash of the file.
pub fn hash_file(path: &Path) -> Result<ContentHash, HashError> {
  let mut hasher = Hasher::new();
  hasher.add_file(path)?;
  Ok(hasher.finish())
}

/// Hash arbitrary bytes.
///
/// Returns the full 64-character SHA256 hash.
pub fn hash_bytes(data: &[u8]) -> ContentHash {
  let mut hasher = Hasher::new();
  hasher.update(data);
  hasher.finish()
}
