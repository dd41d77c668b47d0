//! Filesystem targets.

use std::collections::BTreeSet;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use tracing::debug;
use walkdir::WalkDir;

use crate::buildinfo::{FileInfo, FilesystemInfo};
use crate::platform::paths::is_protected;
use crate::util::hash::{Hasher, hash_bytes, hash_file};

use super::{InvalidFiles, Reason, TargetError, add_reason, validate_path};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
  File,
  Dir,
  Symlink,
}

/// One resolved entry of a filesystem target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetEntry {
  /// `/`-separated path relative to the task dir.
  pub rel: String,
  pub path: PathBuf,
  pub kind: EntryKind,
}

/// `/`-separated form of `path` relative to `dir`.
pub(crate) fn rel_string(dir: &Path, path: &Path) -> String {
  let rel = path.strip_prefix(dir).unwrap_or(path);
  rel
    .components()
    .map(|c| c.as_os_str().to_string_lossy())
    .collect::<Vec<_>>()
    .join("/")
}

fn clean_rel(path: &str) -> String {
  rel_string(Path::new(""), Path::new(path.trim_start_matches("./")))
}

fn kind_of(meta: &fs::Metadata) -> EntryKind {
  let ft = meta.file_type();
  if ft.is_symlink() {
    EntryKind::Symlink
  } else if ft.is_dir() {
    EntryKind::Dir
  } else {
    EntryKind::File
  }
}

pub(super) fn exists(dir: &Path, paths: &[String]) -> Result<bool, TargetError> {
  for path in paths {
    validate_path(path)?;
    let abs = dir.join(path);
    match abs.symlink_metadata() {
      Ok(_) => {}
      Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
      Err(e) => return Err(TargetError::io(&abs, e)),
    }
  }
  Ok(true)
}

/// Enumerate every entry below the declared paths in sorted order.
///
/// Strict scans fail on missing declared paths; tolerant scans skip them.
fn scan(dir: &Path, paths: &[String], strict: bool) -> Result<Vec<TargetEntry>, TargetError> {
  let mut entries = Vec::new();
  let mut seen = BTreeSet::new();

  for path in paths {
    validate_path(path)?;
    let abs = dir.join(path);
    let meta = match abs.symlink_metadata() {
      Ok(meta) => meta,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        if strict {
          return Err(TargetError::PathNotFound(abs));
        }
        continue;
      }
      Err(e) => return Err(TargetError::io(&abs, e)),
    };

    let rel = clean_rel(path);
    if seen.insert(rel.clone()) {
      entries.push(TargetEntry {
        rel,
        path: abs.clone(),
        kind: kind_of(&meta),
      });
    }

    if kind_of(&meta) != EntryKind::Dir {
      continue;
    }

    for entry in WalkDir::new(&abs).follow_links(false).sort_by_file_name().min_depth(1) {
      let entry = match entry {
        Ok(entry) => entry,
        Err(e) if !strict && e.io_error().is_some_and(|err| err.kind() == io::ErrorKind::NotFound) => continue,
        Err(e) => {
          return Err(TargetError::Walk {
            path: abs.clone(),
            message: e.to_string(),
          });
        }
      };
      let meta = entry.path().symlink_metadata().map_err(|e| TargetError::io(entry.path(), e))?;
      let rel = rel_string(dir, entry.path());
      if seen.insert(rel.clone()) {
        entries.push(TargetEntry {
          rel,
          path: entry.path().to_path_buf(),
          kind: kind_of(&meta),
        });
      }
    }
  }

  entries.sort_by(|a, b| a.rel.cmp(&b.rel));
  Ok(entries)
}

pub(super) fn resolve(dir: &Path, paths: &[String]) -> Result<Vec<TargetEntry>, TargetError> {
  let entries = scan(dir, paths, true)?;
  debug!(dir = %dir.display(), entries = entries.len(), "resolved target");
  Ok(entries)
}

/// Modification time in unix milliseconds, zero when the platform has none.
fn modified_millis(meta: &fs::Metadata) -> i64 {
  meta
    .modified()
    .ok()
    .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
    .map(|d| d.as_millis() as i64)
    .unwrap_or_default()
}

fn link_text(path: &Path) -> Result<String, TargetError> {
  let link = fs::read_link(path).map_err(|e| TargetError::io(path, e))?;
  Ok(link.to_string_lossy().to_string())
}

fn entry_info(entry: &TargetEntry) -> Result<FileInfo, TargetError> {
  match entry.kind {
    EntryKind::Dir => Ok(FileInfo::dir()),
    EntryKind::Symlink => {
      let link = link_text(&entry.path)?;
      Ok(FileInfo {
        size: link.len() as i64,
        hash: hash_bytes(link.as_bytes()).0,
        modified: 0,
      })
    }
    EntryKind::File => {
      let meta = entry.path.metadata().map_err(|e| TargetError::io(&entry.path, e))?;
      Ok(FileInfo {
        size: meta.len() as i64,
        hash: hash_file(&entry.path)?.0,
        modified: modified_millis(&meta),
      })
    }
  }
}

pub(super) fn build_info(entries: &[TargetEntry]) -> Result<FilesystemInfo, TargetError> {
  let mut info = FilesystemInfo::default();
  let mut hasher = Hasher::new();

  for entry in entries {
    let file = entry_info(entry)?;
    hasher.update(&entry.rel);
    hasher.update([0u8]);
    hasher.update(file.size.to_string());
    hasher.update([0u8]);
    hasher.update(&file.hash);
    hasher.update(b"\n");
    info.files.insert(entry.rel.clone(), file);
  }

  info.hash = hasher.finish().0;
  Ok(info)
}

pub(super) fn verify_shallow(
  dir: &Path,
  paths: &[String],
  recorded: &FilesystemInfo,
  invalid: &mut InvalidFiles,
) -> Result<(), TargetError> {
  for (rel, file) in &recorded.files {
    validate_path(rel)?;
    let abs = dir.join(rel);
    let meta = match abs.symlink_metadata() {
      Ok(meta) => meta,
      Err(e) if e.kind() == io::ErrorKind::NotFound => {
        add_reason(invalid, rel, Reason::DoesNotExist);
        continue;
      }
      Err(e) => return Err(TargetError::io(&abs, e)),
    };

    let size_matches = match kind_of(&meta) {
      EntryKind::Dir => file.is_dir(),
      EntryKind::Symlink => !file.is_dir() && link_text(&abs)?.len() as i64 == file.size,
      EntryKind::File => !file.is_dir() && meta.len() as i64 == file.size,
    };
    if !size_matches {
      add_reason(invalid, rel, Reason::SizeChanged);
      continue;
    }
    // Records written before modtimes were tracked carry zero.
    if kind_of(&meta) == EntryKind::File && file.modified != 0 && modified_millis(&meta) != file.modified {
      add_reason(invalid, rel, Reason::ModTimeChanged);
    }
  }

  for entry in scan(dir, paths, false)? {
    if !recorded.files.contains_key(&entry.rel) {
      add_reason(invalid, &entry.rel, Reason::CreatedAfterBuild);
    }
  }

  Ok(())
}

pub(super) fn verify_hashes(dir: &Path, recorded: &FilesystemInfo, invalid: &mut InvalidFiles) -> Result<(), TargetError> {
  for (rel, file) in &recorded.files {
    if file.is_dir() || invalid.contains_key(rel) {
      continue;
    }
    let abs = dir.join(rel);
    let meta = abs.symlink_metadata().map_err(|e| TargetError::io(&abs, e))?;
    let current = entry_info(&TargetEntry {
      rel: rel.clone(),
      path: abs,
      kind: kind_of(&meta),
    })?;
    if current.hash != file.hash {
      add_reason(invalid, rel, Reason::HashChanged);
    }
  }
  Ok(())
}

/// Remove a path below `dir`. Missing paths are not an error.
pub(super) fn remove(dir: &Path, rel: &str) -> Result<(), TargetError> {
  validate_path(rel)?;
  let abs = dir.join(rel);
  if is_protected(&abs) {
    return Err(TargetError::ProtectedPath(abs));
  }

  let meta = match abs.symlink_metadata() {
    Ok(meta) => meta,
    Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(()),
    Err(e) => return Err(TargetError::io(&abs, e)),
  };

  let result = if kind_of(&meta) == EntryKind::Dir {
    fs::remove_dir_all(&abs)
  } else {
    fs::remove_file(&abs)
  };

  match result {
    Ok(()) => {
      debug!(path = %abs.display(), "removed target path");
      Ok(())
    }
    Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
    Err(e) => Err(TargetError::io(&abs, e)),
  }
}
