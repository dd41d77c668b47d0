//! `bob run`: start long-running processes after their builds.

use std::collections::BTreeSet;

use tokio::task::JoinSet;
use tracing::{info, warn};

use crate::aggregate::{Aggregate, AggregateError};
use crate::bobfile::{Run, RunKind};
use crate::task::Task;

use super::env::task_environment;
use super::{BuildContext, Cancel, ExecRequest, ExecuteError};

/// What has to happen before `name` can start.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RunPlan {
  /// Build tasks to run first, in declaration order.
  pub builds: Vec<String>,
  /// Runs to start, dependencies before dependents; the requested run is last.
  pub runs: Vec<Run>,
}

/// Resolve the builds and runs `name` depends on.
pub fn plan(aggregate: &Aggregate, name: &str) -> Result<RunPlan, AggregateError> {
  let mut plan = RunPlan::default();
  let mut visited = BTreeSet::new();
  visit(aggregate, name, &mut visited, &mut plan)?;
  Ok(plan)
}

fn visit(aggregate: &Aggregate, name: &str, visited: &mut BTreeSet<String>, plan: &mut RunPlan) -> Result<(), AggregateError> {
  if !visited.insert(name.to_string()) {
    return Ok(());
  }
  let run = aggregate.run(name)?;
  for dep in &run.depends_on {
    if aggregate.build_tasks.contains_key(dep) {
      if !plan.builds.contains(dep) {
        plan.builds.push(dep.clone());
      }
    } else {
      visit(aggregate, dep, visited, plan)?;
    }
  }
  plan.runs.push(run.clone());
  Ok(())
}

fn quote(s: &str) -> String {
  format!("'{}'", s.replace('\'', r"'\''"))
}

/// The shell command that starts a run.
pub fn command(run: &Run) -> String {
  let path = run.dir.join(&run.path);
  match run.kind {
    RunKind::Binary => format!("exec {}", quote(&path.display().to_string())),
    RunKind::Compose => format!("docker compose -f {} up", quote(&path.display().to_string())),
  }
}

async fn start_one(run: Run, ctx: BuildContext, cancel: Cancel) -> Result<(), ExecuteError> {
  let task = Task {
    name: run.name.clone(),
    dir: run.dir.clone(),
    ..Task::default()
  };
  let request = ExecRequest {
    name: run.name.clone(),
    commands: vec![command(&run)],
    dir: run.dir.clone(),
    env: task_environment(ctx.env.as_ref(), &task),
  };
  info!(run = %run.name, "starting");
  ctx.executor.execute(&request, &cancel).await
}

/// Start every run of the plan concurrently. Returns when the first one exits
/// or `cancel` fires; the others are then stopped.
pub async fn start(runs: Vec<Run>, ctx: BuildContext, cancel: &Cancel) -> Result<(), ExecuteError> {
  let local = Cancel::new();
  let mut set = JoinSet::new();
  for run in runs {
    set.spawn(start_one(run, ctx.clone(), local.clone()));
  }

  let first = tokio::select! {
    _ = cancel.cancelled() => None,
    joined = set.join_next() => joined,
  };
  local.cancel();
  while set.join_next().await.is_some() {}

  match first {
    None | Some(Ok(Ok(()))) | Some(Ok(Err(ExecuteError::Canceled))) => Ok(()),
    Some(Ok(Err(e))) => {
      warn!(error = %e, "run exited with error");
      Err(e)
    }
    Some(Err(e)) => Err(ExecuteError::Join(e.to_string())),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::aggregate::from_bobfiles;
  use crate::bobfile::Bobfile;
  use std::path::Path;

  fn aggregate() -> Aggregate {
    let bobfile = Bobfile::parse(
      r#"
build:
  build:
    cmd: go build -o run
    target: run
run:
  db:
    type: compose
    path: docker-compose.yml
  server:
    type: binary
    path: run
    dependsOn: [build, db]
"#,
      Path::new("/work"),
    )
    .unwrap();
    from_bobfiles(Path::new("/work"), vec![bobfile]).unwrap()
  }

  #[test]
  fn plan_orders_builds_and_runs() {
    let plan = plan(&aggregate(), "server").unwrap();
    assert_eq!(plan.builds, vec!["build"]);
    let names: Vec<_> = plan.runs.iter().map(|r| r.name.as_str()).collect();
    assert_eq!(names, vec!["db", "server"]);
  }

  #[test]
  fn unknown_run_is_not_found() {
    assert!(plan(&aggregate(), "nope").unwrap_err().is_not_found());
  }

  #[test]
  fn commands_per_kind() {
    let agg = aggregate();
    assert_eq!(command(agg.run("server").unwrap()), "exec '/work/run'");
    assert_eq!(
      command(agg.run("db").unwrap()),
      "docker compose -f '/work/docker-compose.yml' up"
    );
  }

  #[cfg(unix)]
  #[tokio::test]
  async fn first_exit_stops_the_others() {
    use crate::execute::BuildContext;
    use crate::util::testutil::StaticEnv;
    use std::sync::Arc;
    use std::time::Duration;

    let temp = tempfile::TempDir::new().unwrap();
    let quick = crate::util::testutil::write_file(temp.path(), "quick.sh", "#!/bin/sh\nexit 0\n");
    let slow = crate::util::testutil::write_file(temp.path(), "slow.sh", "#!/bin/sh\nexec sleep 30\n");
    for p in [&quick, &slow] {
      use std::os::unix::fs::PermissionsExt;
      std::fs::set_permissions(p, std::fs::Permissions::from_mode(0o755)).unwrap();
    }
    let run = |name: &str, path: &str| Run {
      name: name.into(),
      dir: temp.path().to_path_buf(),
      kind: RunKind::Binary,
      path: path.into(),
      depends_on: vec![],
    };

    let ctx = BuildContext::new(
      Arc::new(crate::execute::ShellExecutor::default()),
      Arc::new(StaticEnv(vec!["PATH=/usr/bin:/bin".into()])),
    );
    let result = tokio::time::timeout(
      Duration::from_secs(10),
      start(vec![run("slow", "slow.sh"), run("quick", "quick.sh")], ctx, &Cancel::new()),
    )
    .await
    .unwrap();
    assert!(result.is_ok());
  }
}
