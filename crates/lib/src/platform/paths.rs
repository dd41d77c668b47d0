use crate::consts::APP_NAME;
use std::path::{Component, Path, PathBuf};

/// Environment variable overriding the cache root.
pub const CACHE_DIR_ENV: &str = "BOB_CACHE_DIR";

/// Returns the user's home directory, if one is configured
#[cfg(windows)]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("USERPROFILE").filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Returns the user's home directory, if one is configured
#[cfg(not(windows))]
pub fn home_dir() -> Option<PathBuf> {
  std::env::var_os("HOME").filter(|v| !v.is_empty()).map(PathBuf::from)
}

/// Returns the root directory under which all persistent stores live.
///
/// Resolution order: `BOB_CACHE_DIR`, `XDG_CACHE_HOME/bob`, `$HOME/.cache/bob`,
/// and finally the system temp directory when no home is configured.
pub fn cache_root() -> PathBuf {
  if let Some(dir) = std::env::var_os(CACHE_DIR_ENV).filter(|v| !v.is_empty()) {
    return PathBuf::from(dir);
  }

  let cache_home = std::env::var_os("XDG_CACHE_HOME")
    .filter(|v| !v.is_empty())
    .map(PathBuf::from)
    .or_else(|| home_dir().map(|home| home.join(".cache")))
    .unwrap_or_else(std::env::temp_dir);
  cache_home.join(APP_NAME)
}

/// Returns true for paths that must never be deleted or overwritten wholesale:
/// the filesystem root and the user's home directory.
pub fn is_protected(path: &Path) -> bool {
  let normalized = normalize(path);
  if normalized.parent().is_none() {
    return true;
  }

  match home_dir() {
    Some(home) => {
      let home = normalize(&home);
      if normalized == home {
        return true;
      }
      match (dunce::canonicalize(&normalized), dunce::canonicalize(&home)) {
        (Ok(a), Ok(b)) => a == b,
        _ => false,
      }
    }
    None => false,
  }
}

/// Lexically normalize a path: drop `.` components and resolve `..` where possible.
pub fn normalize(path: &Path) -> PathBuf {
  let mut out = PathBuf::new();
  for component in path.components() {
    match component {
      Component::CurDir => {}
      Component::ParentDir => {
        if !out.pop() {
          out.push("..");
        }
      }
      other => out.push(other.as_os_str()),
    }
  }
  out
}

#[cfg(test)]
#[cfg(not(windows))]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn cache_dir_override_takes_precedence() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, Some("/custom/bob")),
        ("XDG_CACHE_HOME", Some("/custom/cache")),
        ("HOME", Some("/home/user")),
      ],
      || {
        assert_eq!(cache_root(), PathBuf::from("/custom/bob"));
      },
    );
  }

  #[test]
  #[serial]
  fn xdg_cache_home_takes_precedence_over_home() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, None::<&str>),
        ("XDG_CACHE_HOME", Some("/custom/cache")),
        ("HOME", Some("/home/user")),
      ],
      || {
        assert_eq!(cache_root(), PathBuf::from("/custom/cache").join(APP_NAME));
      },
    );
  }

  #[test]
  #[serial]
  fn falls_back_to_home_cache() {
    temp_env::with_vars(
      [
        (CACHE_DIR_ENV, None::<&str>),
        ("XDG_CACHE_HOME", None::<&str>),
        ("HOME", Some("/home/user")),
      ],
      || {
        assert_eq!(cache_root(), PathBuf::from("/home/user/.cache").join(APP_NAME));
      },
    );
  }

  #[test]
  #[serial]
  fn root_and_home_are_protected() {
    temp_env::with_vars([("HOME", Some("/home/user"))], || {
      assert!(is_protected(Path::new("/")));
      assert!(is_protected(Path::new("/home/user")));
      assert!(is_protected(Path::new("/home/user/")));
      assert!(is_protected(Path::new("/home/user/project/..")));
      assert!(!is_protected(Path::new("/home/user/project")));
    });
  }

  #[test]
  fn normalize_resolves_dots() {
    assert_eq!(normalize(Path::new("/a/./b/../c")), PathBuf::from("/a/c"));
    assert_eq!(normalize(Path::new("a/../../b")), PathBuf::from("../b"));
  }
}
