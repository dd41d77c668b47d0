//! Implementation of the `bob init` command.
//!
//! This command writes a starter `bob.yaml` and the `.bob.workspace` marker.

use std::path::PathBuf;

use anyhow::{Context, Result};
use owo_colors::OwoColorize;

use bob_lib::init::{InitOptions, init};

use crate::output::symbols;

use super::current_dir;

/// Execute the init command.
///
/// # Errors
///
/// Returns an error if a bob.yaml already exists or files cannot be written.
pub fn cmd_init(path: Option<PathBuf>) -> Result<()> {
  let dir = match path {
    Some(path) => path,
    None => current_dir()?,
  };

  let result = init(&InitOptions { dir }).context("Failed to initialize workspace")?;

  println!(
    "{} {}",
    symbols::SUCCESS.green(),
    "Initialized bob workspace!".green().bold()
  );
  println!();
  println!("  {} Manifest:  {}", symbols::INFO.cyan(), result.bobfile.display());
  println!("  {} Marker:    {}", symbols::INFO.cyan(), result.marker.display());
  println!();
  println!("{}", "Next steps:".bold());
  println!("  1. Edit {} to declare your tasks", result.bobfile.display().to_string().cyan());
  println!("  2. Run: {}", "bob build".cyan());

  Ok(())
}
