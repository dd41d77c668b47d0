//! Implementation of the `bob run` command.

use anyhow::{Context, Result, bail};
use tracing::info;

use bob_lib::execute::{BuildContext, build_task, run};
use bob_lib::store::Stores;

use crate::BuildArgs;
use crate::output::print_summary;

use super::build::build_options;
use super::{cancel_on_ctrl_c, load_workspace, runtime};

/// Execute the run command.
///
/// Builds every build task the run depends on, then starts the run and its
/// dependent runs until the first exits or Ctrl-C is pressed.
pub fn cmd_run(name: &str, args: &BuildArgs) -> Result<()> {
  let aggregate = load_workspace()?;
  let plan = run::plan(&aggregate, name)?;
  let options = build_options(args);
  let ctx = BuildContext::host(aggregate.shell.clone());

  let rt = runtime()?;
  rt.block_on(async {
    cancel_on_ctrl_c(&options.cancel);

    for task in &plan.builds {
      let summary = build_task(&aggregate, task, Stores::local(), ctx.clone(), &options)
        .await
        .with_context(|| format!("Failed to build {}", task))?;
      if !summary.is_success() {
        print_summary(&summary);
        if let Some((failed, err)) = &summary.error {
          bail!("task {} failed: {}", failed, err);
        }
        bail!("build canceled");
      }
    }

    info!(run = %name, runs = plan.runs.len(), "starting runs");
    run::start(plan.runs, ctx, &options.cancel).await?;
    Ok::<(), anyhow::Error>(())
  })
}
