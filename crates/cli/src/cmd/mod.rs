mod build;
mod clean;
mod init;
mod inspect;
mod run;

use std::path::PathBuf;

use anyhow::{Context, Result};
use tracing::debug;

use bob_lib::aggregate::{Aggregate, aggregate, find_root};
use bob_lib::execute::Cancel;

pub use build::cmd_build;
pub use clean::{cmd_clean, cmd_clean_targets};
pub use init::cmd_init;
pub use inspect::{cmd_inspect_artifact, cmd_inspect_artifacts, cmd_inspect_buildinfo, cmd_inspect_env};
pub use run::cmd_run;

/// clap value parser for `--env KEY=VALUE`.
pub fn parse_env(value: &str) -> Result<String, String> {
  match value.split_once('=') {
    Some((key, _)) if !key.is_empty() => Ok(value.to_string()),
    _ => Err(format!("expected KEY=VALUE, got '{}'", value)),
  }
}

fn current_dir() -> Result<PathBuf> {
  let cwd = std::env::current_dir().context("Failed to read current directory")?;
  Ok(dunce::canonicalize(&cwd).unwrap_or(cwd))
}

/// Aggregate the workspace containing the current directory.
fn load_workspace() -> Result<Aggregate> {
  let root = find_root(&current_dir()?);
  debug!(root = %root.display(), "aggregating workspace");
  aggregate(&root).map_err(|e| {
    if e.is_user_error() {
      anyhow::Error::new(e)
    } else {
      anyhow::Error::new(e).context("Failed to load workspace")
    }
  })
}

fn runtime() -> Result<tokio::runtime::Runtime> {
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}

/// Cancel `cancel` on the first Ctrl-C. Must be called inside the runtime.
fn cancel_on_ctrl_c(cancel: &Cancel) {
  let cancel = cancel.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      cancel.cancel();
    }
  });
}
