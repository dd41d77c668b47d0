//! Implementation of the `bob clean` commands.

use anyhow::{Context, Result};
use serde::Serialize;

use bob_lib::playbook::{Playbook, PlaybookOptions};
use bob_lib::platform::paths::cache_root;
use bob_lib::store::{self, Stores};

use crate::output::{OutputFormat, print_json, print_stat, print_success};

use super::load_workspace;

#[derive(Serialize)]
struct CleanedTargets<'a> {
  task: &'a str,
  targets_removed: usize,
}

/// Delete artifacts and build infos, optionally only those of `project`.
pub fn cmd_clean(project: Option<&str>, output: OutputFormat) -> Result<()> {
  let stores = Stores::local();
  let stats = store::clean(&stores, project).context("Failed to clean local cache")?;

  if output.is_json() {
    print_json(&stats)?;
  } else {
    print_success("Cache cleaned");
    print_stat("Cache", &cache_root().display().to_string());
    if let Some(project) = project {
      print_stat("Project", project);
    }
    print_stat("Artifacts removed", &stats.artifacts_deleted.to_string());
    print_stat("Build infos removed", &stats.buildinfos_deleted.to_string());
  }
  Ok(())
}

/// Remove the filesystem targets of `task` and everything it depends on.
pub fn cmd_clean_targets(task: &str, output: OutputFormat) -> Result<()> {
  let aggregate = load_workspace()?;
  let playbook = Playbook::new(&aggregate, task, Stores::local(), &PlaybookOptions::default())?;
  let removed = playbook.clean_targets().context("Failed to remove targets")?;

  if output.is_json() {
    print_json(&CleanedTargets {
      task,
      targets_removed: removed,
    })?;
  } else {
    print_success(&format!("Removed targets of {} task(s)", removed));
  }
  Ok(())
}
