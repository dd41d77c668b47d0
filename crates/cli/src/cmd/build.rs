//! Implementation of the `bob build` command.

use anyhow::{Context, Result, bail};

use bob_lib::execute::{BuildContext, BuildOptions, build_task};
use bob_lib::store::Stores;

use crate::BuildArgs;
use crate::output::{OutputFormat, print_json, print_summary};

use super::{cancel_on_ctrl_c, load_workspace, runtime};

pub(crate) fn build_options(args: &BuildArgs) -> BuildOptions {
  let mut options = BuildOptions {
    no_cache: args.no_cache,
    env: args.env.clone(),
    ..BuildOptions::default()
  };
  if let Some(jobs) = args.jobs {
    options.max_parallel = jobs.max(1);
  }
  options
}

/// Execute the build command.
///
/// Builds `task` and its dependency closure, then prints the per-task summary.
/// Fails if any task failed or the build was interrupted.
pub fn cmd_build(task: &str, args: &BuildArgs, output: OutputFormat) -> Result<()> {
  let aggregate = load_workspace()?;
  let options = build_options(args);
  let ctx = BuildContext::host(aggregate.shell.clone());

  let rt = runtime()?;
  let summary = rt.block_on(async {
    cancel_on_ctrl_c(&options.cancel);
    build_task(&aggregate, task, Stores::local(), ctx, &options).await
  });
  let summary = match summary {
    Ok(summary) => summary,
    Err(e) if e.is_user_error() => return Err(e.into()),
    Err(e) => return Err(e).context("Build failed"),
  };

  if output.is_json() {
    print_json(&summary)?;
  } else {
    print_summary(&summary);
  }

  if let Some((name, err)) = &summary.error {
    bail!("task {} failed: {}", name, err);
  }
  if summary.canceled {
    bail!("build canceled");
  }
  Ok(())
}
