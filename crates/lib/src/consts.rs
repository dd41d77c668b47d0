/// Name of the application, used for cache paths and the cache root.
pub const APP_NAME: &str = "bob";

/// Manifest file name looked up in every directory of a workspace.
pub const BOBFILE_NAME: &str = "bob.yaml";

/// Marker file identifying the root of a workspace.
pub const WORKSPACE_MARKER: &str = ".bob.workspace";

/// Directory below the cache root holding all persisted stores.
pub const CACHE_DIR_NAME: &str = ".bobcache";

/// Artifact blobs, one file per input hash.
pub const ARTIFACTS_DIR: &str = "artifacts";

/// Build info records, one file per input hash.
pub const BUILDINFOS_DIR: &str = "buildinfos";

/// Bumped whenever the input hash algorithm changes in an incompatible way.
pub const HASH_VERSION: &str = "bob-input-hash-v3";

/// Directory names never walked during manifest discovery or input collection.
pub const EXCLUDED_DIRS: &[&str] = &["node_modules", ".git", CACHE_DIR_NAME];

/// Default task built when `bob build` is invoked without a task name.
pub const DEFAULT_BUILD_TASK: &str = "build";

/// Environment variables that never contribute to a task description.
pub const IGNORED_ENV_KEYS: &[&str] = &["SHLVL", "BUILDCOMMANDPATH"];
