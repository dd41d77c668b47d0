//! Build execution.
//!
//! This module runs a playbook: it decides per task whether to skip, restore
//! from an artifact or execute, drives the worker pool, and starts runs.
//! Commands go through the `Executor` trait; the base environment comes from
//! an `EnvProvider`.

mod cancel;
mod env;
mod executor;
pub mod run;
mod scheduler;
mod types;

use std::sync::Arc;

use tracing::info;

use crate::aggregate::Aggregate;
use crate::playbook::Playbook;
use crate::store::Stores;

pub use cancel::Cancel;
pub use env::{EnvProvider, HostEnv, task_environment};
pub use executor::{Executor, OUTPUT_TARGET, ShellExecutor};
pub use scheduler::build;
pub use types::{BuildContext, BuildOptions, BuildSummary, ExecRequest, ExecuteError};

/// Build `task` and everything it depends on.
pub async fn build_task(
  aggregate: &Aggregate,
  task: &str,
  stores: Stores,
  ctx: BuildContext,
  options: &BuildOptions,
) -> Result<BuildSummary, ExecuteError> {
  let playbook = Playbook::new(aggregate, task, stores, &options.playbook_options())?;
  info!(task = %task, tasks = playbook.len(), "building");
  build(Arc::new(playbook), ctx, options).await
}
