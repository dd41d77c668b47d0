//! Aggregate validation.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::DiGraph;
use tracing::warn;

use crate::bobfile::Bobfile;
use crate::task::RebuildPolicy;

use super::{Aggregate, AggregateError};

fn valid_project_name(name: &str) -> bool {
  !name.is_empty()
    && !name.contains("//")
    && name
      .chars()
      .all(|c| c.is_ascii_alphanumeric() || matches!(c, '/' | '_' | '.' | '-' | ':'))
}

/// Per-manifest checks: version string and explicit project name.
pub(super) fn bobfile(bobfile: &Bobfile) -> Result<(), AggregateError> {
  if let Some(version) = bobfile.version.as_deref().filter(|v| !v.trim().is_empty()) {
    let wanted = semver::Version::parse(version.trim_start_matches('v')).map_err(|e| AggregateError::InvalidVersion {
      version: version.to_string(),
      message: e.to_string(),
    })?;
    if let Ok(running) = semver::Version::parse(env!("CARGO_PKG_VERSION"))
      && wanted > running
    {
      warn!(
        bobfile = %bobfile.dir.display(),
        wanted = %wanted,
        running = %running,
        "manifest requires a newer version of bob"
      );
    }
  }

  if bobfile.explicit_project && !valid_project_name(&bobfile.project) {
    return Err(AggregateError::InvalidProjectName(bobfile.project.clone()));
  }

  Ok(())
}

/// Graph checks over the merged aggregate.
pub(super) fn graph(aggregate: &Aggregate) -> Result<(), AggregateError> {
  for (name, task) in &aggregate.build_tasks {
    for dep in &task.depends_on {
      if dep == name {
        return Err(AggregateError::SelfReference(name.clone()));
      }
      if !aggregate.build_tasks.contains_key(dep) {
        return Err(AggregateError::DependencyNotFound {
          task: name.clone(),
          dependency: dep.clone(),
        });
      }
    }
    if task.rebuild == RebuildPolicy::Always && task.has_target() {
      return Err(AggregateError::RebuildAlwaysWithTarget(name.clone()));
    }
  }

  for (name, run) in &aggregate.run_tasks {
    for dep in &run.depends_on {
      if dep == name {
        return Err(AggregateError::SelfReference(name.clone()));
      }
      if !aggregate.build_tasks.contains_key(dep) && !aggregate.run_tasks.contains_key(dep) {
        return Err(AggregateError::DependencyNotFound {
          task: name.clone(),
          dependency: dep.clone(),
        });
      }
    }
  }

  let mut graph = DiGraph::<&str, ()>::new();
  let mut nodes = HashMap::new();
  for name in aggregate.build_tasks.keys().chain(aggregate.run_tasks.keys()) {
    nodes.insert(name.as_str(), graph.add_node(name.as_str()));
  }
  let edges = aggregate
    .build_tasks
    .iter()
    .map(|(name, task)| (name, &task.depends_on))
    .chain(aggregate.run_tasks.iter().map(|(name, run)| (name, &run.depends_on)));
  for (name, deps) in edges {
    for dep in deps {
      if let (Some(&from), Some(&to)) = (nodes.get(dep.as_str()), nodes.get(name.as_str())) {
        graph.add_edge(from, to, ());
      }
    }
  }
  toposort(&graph, None).map_err(|cycle| AggregateError::Cycle(graph[cycle.node_id()].to_string()))?;

  Ok(())
}
