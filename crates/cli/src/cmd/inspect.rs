//! Implementation of the `bob inspect` commands.

use anyhow::{Context, Result};
use serde::Serialize;

use bob_lib::artifact::{ArtifactMetadata, list_entries, read_metadata};
use bob_lib::execute::{HostEnv, task_environment};
use bob_lib::store::Stores;

use crate::output::{OutputFormat, format_timestamp, print_info, print_json, print_stat, print_warning, truncate_hash};

use super::load_workspace;

#[derive(Serialize)]
struct ArtifactListing {
  id: String,
  #[serde(flatten)]
  metadata: ArtifactMetadata,
}

#[derive(Serialize)]
struct ArtifactDetail {
  id: String,
  metadata: ArtifactMetadata,
  entries: Vec<String>,
}

fn print_metadata(metadata: &ArtifactMetadata) {
  print_stat("Project", &metadata.project);
  print_stat("Task", &metadata.taskname);
  print_stat("Input hash", &metadata.input_hash);
  print_stat("Type", &format!("{:?}", metadata.target_type).to_lowercase());
  print_stat("Created", &format_timestamp(metadata.created_at));
}

/// List every artifact in the local store.
pub fn cmd_inspect_artifacts(output: OutputFormat) -> Result<()> {
  let stores = Stores::local();
  let ids = stores.artifacts.list().context("Failed to list artifacts")?;

  let mut listings = Vec::new();
  for id in ids {
    let metadata = stores
      .artifacts
      .get(&id)
      .map_err(anyhow::Error::from)
      .and_then(|reader| read_metadata(reader).map_err(anyhow::Error::from));
    match metadata {
      Ok(metadata) => listings.push(ArtifactListing { id, metadata }),
      Err(e) => print_warning(&format!("{}: unreadable artifact: {}", id, e)),
    }
  }

  if output.is_json() {
    return print_json(&listings);
  }
  if listings.is_empty() {
    print_info("No artifacts");
    return Ok(());
  }
  for listing in &listings {
    println!(
      "{}  {:<30}  {:<10}  {}",
      truncate_hash(&listing.id),
      listing.metadata.taskname,
      format!("{:?}", listing.metadata.target_type).to_lowercase(),
      format_timestamp(listing.metadata.created_at)
    );
  }
  Ok(())
}

/// Print metadata and entries of one artifact.
pub fn cmd_inspect_artifact(id: &str, output: OutputFormat) -> Result<()> {
  let stores = Stores::local();
  let metadata = read_metadata(stores.artifacts.get(id)?).context("Failed to read artifact metadata")?;
  let entries = list_entries(stores.artifacts.get(id)?).context("Failed to read artifact entries")?;

  if output.is_json() {
    return print_json(&ArtifactDetail {
      id: id.to_string(),
      metadata,
      entries,
    });
  }
  println!("{}", id);
  print_metadata(&metadata);
  println!();
  for entry in &entries {
    println!("  {}", entry);
  }
  Ok(())
}

/// Print a build info record as JSON.
pub fn cmd_inspect_buildinfo(id: &str) -> Result<()> {
  let stores = Stores::local();
  let info = stores.buildinfos.get(id)?;
  print_json(&info)
}

/// Print the environment `task` would run with, one entry per line.
pub fn cmd_inspect_env(task: &str, extra: &[String]) -> Result<()> {
  let aggregate = load_workspace()?;
  let task = aggregate.task(task)?;
  let mut env = task_environment(&HostEnv, task);
  env.extend(extra.iter().cloned());
  for entry in env {
    println!("{}", entry);
  }
  Ok(())
}
