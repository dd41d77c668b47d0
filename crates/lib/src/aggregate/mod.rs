//! Aggregation: merge every manifest below a workspace root into one graph.
//!
//! Tasks of nested manifests are re-scoped to global names (`prefix/name`,
//! where `prefix` is the manifest dir relative to the root), `dependsOn`
//! entries are rewritten the same way, and exports of dependencies become
//! environment variables of their dependents.

mod validate;

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, info};
use walkdir::WalkDir;

use crate::bobfile::{Bobfile, BobfileError, Run};
use crate::consts::{BOBFILE_NAME, EXCLUDED_DIRS, WORKSPACE_MARKER};
use crate::platform::paths::normalize;
use crate::task::Task;

#[derive(Debug, Error)]
pub enum AggregateError {
  #[error(transparent)]
  Bobfile(#[from] BobfileError),

  #[error("failed to discover manifests below {path}: {message}")]
  Discover { path: PathBuf, message: String },

  #[error("could not find a bob.yaml in {0}")]
  CouldNotFindTopLevelBobfile(PathBuf),

  #[error("duplicate task name: {0}")]
  DuplicateTask(String),

  #[error("task not found: {0}")]
  TaskNotFound(String),

  #[error("run not found: {0}")]
  RunNotFound(String),

  #[error("{bobfile}: import {import:?} does not contain a bob.yaml")]
  ImportNotFound { bobfile: PathBuf, import: String },

  #[error("task {task} depends on unknown task {dependency}")]
  DependencyNotFound { task: String, dependency: String },

  #[error("task {0} depends on itself")]
  SelfReference(String),

  #[error("{0}: task names must not be empty")]
  EmptyTaskName(PathBuf),

  #[error("invalid version {version:?}: {message}")]
  InvalidVersion { version: String, message: String },

  #[error("invalid project name {0:?}: allowed characters are [A-Za-z0-9/_.-:] and '//' is not allowed")]
  InvalidProjectName(String),

  #[error("task {0}: rebuild: always cannot be combined with a target")]
  RebuildAlwaysWithTarget(String),

  #[error("dependency cycle detected at task {0}")]
  Cycle(String),
}

impl AggregateError {
  pub fn is_user_error(&self) -> bool {
    match self {
      AggregateError::Bobfile(e) => e.is_user_error(),
      AggregateError::Discover { .. } => false,
      _ => true,
    }
  }

  pub fn is_not_found(&self) -> bool {
    matches!(
      self,
      AggregateError::TaskNotFound(_) | AggregateError::RunNotFound(_) | AggregateError::CouldNotFindTopLevelBobfile(_)
    )
  }
}

/// All tasks reachable below a workspace root, under global names.
#[derive(Debug, Clone, Default)]
pub struct Aggregate {
  pub root: PathBuf,
  pub build_tasks: BTreeMap<String, Task>,
  pub run_tasks: BTreeMap<String, Run>,
  /// Variables of the top-level manifest.
  pub variables: BTreeMap<String, String>,
  pub project: String,
  pub nixpkgs: String,
  pub dependencies: Vec<String>,
  pub version: Option<String>,
  pub shell: Option<String>,
}

/// Walk up from `start` to the nearest directory holding the workspace marker.
/// Falls back to `start` itself.
pub fn find_root(start: &Path) -> PathBuf {
  let mut dir = Some(start);
  while let Some(d) = dir {
    if d.join(WORKSPACE_MARKER).exists() {
      return d.to_path_buf();
    }
    dir = d.parent();
  }
  start.to_path_buf()
}

/// Paths of every manifest below `root`, sorted, skipping excluded dirs.
pub fn discover(root: &Path) -> Result<Vec<PathBuf>, AggregateError> {
  let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|e| {
    e.depth() == 0
      || !e.file_type().is_dir()
      || e
        .file_name()
        .to_str()
        .map(|name| !EXCLUDED_DIRS.contains(&name))
        .unwrap_or(true)
  });

  let mut found = Vec::new();
  for entry in walker {
    let entry = entry.map_err(|e| AggregateError::Discover {
      path: root.to_path_buf(),
      message: e.to_string(),
    })?;
    if entry.file_type().is_file() && entry.file_name() == BOBFILE_NAME {
      found.push(entry.into_path());
    }
  }
  found.sort();
  Ok(found)
}

/// Join a local name onto a manifest prefix. `"."` and `""` are the root scope.
pub fn global_name(prefix: &str, name: &str) -> String {
  let joined = if prefix.is_empty() || prefix == "." {
    name.to_string()
  } else {
    format!("{}/{}", prefix, name)
  };
  normalize_name(&joined)
}

/// Lexically resolve `.` and `..` segments and strip leading/duplicate `/`.
pub fn normalize_name(name: &str) -> String {
  let mut parts: Vec<&str> = Vec::new();
  for part in name.split('/') {
    match part {
      "" | "." => {}
      ".." => {
        if matches!(parts.last(), Some(last) if *last != "..") {
          parts.pop();
        } else {
          parts.push("..");
        }
      }
      other => parts.push(other),
    }
  }
  parts.join("/")
}

fn prefix_of(root: &Path, dir: &Path) -> String {
  match dir.strip_prefix(root) {
    Ok(rel) => rel
      .components()
      .map(|c| c.as_os_str().to_string_lossy().to_string())
      .collect::<Vec<_>>()
      .join("/"),
    Err(_) => dir.display().to_string(),
  }
}

/// Environment variable name of a dependency export.
pub fn export_var(dependency: &str, export: &str) -> String {
  let base: String = dependency
    .chars()
    .map(|c| if matches!(c, '/' | '-' | '.') { '_' } else { c })
    .collect();
  format!("{}_{}", base.to_uppercase(), export.to_uppercase())
}

/// Discover, parse and merge every manifest below `root`.
pub fn aggregate(root: &Path) -> Result<Aggregate, AggregateError> {
  let root = normalize(root);
  let mut bobfiles = Vec::new();
  for path in discover(&root)? {
    bobfiles.push(Bobfile::from_path(&path)?);
  }
  from_bobfiles(&root, bobfiles)
}

/// Merge already parsed manifests. One of them must live in `root`.
pub fn from_bobfiles(root: &Path, bobfiles: Vec<Bobfile>) -> Result<Aggregate, AggregateError> {
  let root = normalize(root);
  let Some(top) = bobfiles.iter().find(|b| normalize(&b.dir) == root) else {
    return Err(AggregateError::CouldNotFindTopLevelBobfile(root));
  };

  let mut aggregate = Aggregate {
    root: root.clone(),
    variables: top.variables.clone(),
    project: top.project.clone(),
    nixpkgs: top.nixpkgs.clone(),
    dependencies: top.dependencies.clone(),
    version: top.version.clone(),
    shell: top.shell.clone(),
    ..Aggregate::default()
  };

  let dirs: BTreeSet<PathBuf> = bobfiles.iter().map(|b| normalize(&b.dir)).collect();
  let mut decorations: Vec<(String, Vec<String>)> = Vec::new();

  for bobfile in &bobfiles {
    validate::bobfile(bobfile)?;

    for import in &bobfile.imports {
      let dir = normalize(&bobfile.dir.join(import));
      if !dirs.contains(&dir) {
        return Err(AggregateError::ImportNotFound {
          bobfile: bobfile.dir.join(BOBFILE_NAME),
          import: import.clone(),
        });
      }
    }

    let prefix = prefix_of(&root, &normalize(&bobfile.dir));
    let variables: Vec<String> = bobfile
      .variables
      .iter()
      .map(|(k, v)| format!("{}={}", k.to_uppercase(), v))
      .collect();

    for (local, task) in &bobfile.tasks {
      if local.trim().is_empty() {
        return Err(AggregateError::EmptyTaskName(bobfile.dir.join(BOBFILE_NAME)));
      }
      let name = global_name(&prefix, local);
      if aggregate.build_tasks.contains_key(&name) {
        return Err(AggregateError::DuplicateTask(name));
      }

      let mut task = task.clone();
      task.name = name.clone();
      task.depends_on = task.depends_on.iter().map(|d| global_name(&prefix, d)).collect();
      task.environment.extend(variables.iter().cloned());
      aggregate.build_tasks.insert(name, task);
    }

    for (local, run) in &bobfile.runs {
      let name = global_name(&prefix, local);
      if aggregate.run_tasks.contains_key(&name) || aggregate.build_tasks.contains_key(&name) {
        return Err(AggregateError::DuplicateTask(name));
      }
      let mut run = run.clone();
      run.name = name.clone();
      run.depends_on = run.depends_on.iter().map(|d| global_name(&prefix, d)).collect();
      aggregate.run_tasks.insert(name, run);
    }

    for (local, deps) in &bobfile.decorations {
      let deps = deps.iter().map(|d| global_name(&prefix, d)).collect();
      decorations.push((global_name(&prefix, local), deps));
    }
  }

  for (name, deps) in decorations {
    let task = aggregate
      .build_tasks
      .get_mut(&name)
      .ok_or_else(|| AggregateError::TaskNotFound(name.clone()))?;
    for dep in deps {
      if !task.depends_on.contains(&dep) {
        task.depends_on.push(dep);
      }
    }
    debug!(task = %name, "applied decoration");
  }

  validate::graph(&aggregate)?;
  aggregate.apply_exports();

  info!(
    root = %aggregate.root.display(),
    tasks = aggregate.build_tasks.len(),
    runs = aggregate.run_tasks.len(),
    "aggregated workspace"
  );
  Ok(aggregate)
}

impl Aggregate {
  pub fn task(&self, name: &str) -> Result<&Task, AggregateError> {
    self
      .build_tasks
      .get(&normalize_name(name))
      .ok_or_else(|| AggregateError::TaskNotFound(name.to_string()))
  }

  pub fn run(&self, name: &str) -> Result<&Run, AggregateError> {
    self
      .run_tasks
      .get(&normalize_name(name))
      .ok_or_else(|| AggregateError::RunNotFound(name.to_string()))
  }

  /// Transitive `dependsOn` closure of `root`, dependencies before dependents.
  pub fn closure(&self, root: &str) -> Result<Vec<String>, AggregateError> {
    let root = self.task(root)?.name.clone();
    let mut order = Vec::new();
    let mut visited = BTreeSet::new();
    self.visit(&root, &mut visited, &mut order)?;
    Ok(order)
  }

  fn visit(&self, name: &str, visited: &mut BTreeSet<String>, order: &mut Vec<String>) -> Result<(), AggregateError> {
    if !visited.insert(name.to_string()) {
      return Ok(());
    }
    let task = self.task(name)?;
    for dep in &task.depends_on {
      self.visit(dep, visited, order)?;
    }
    order.push(name.to_string());
    Ok(())
  }

  /// Inject `DEP_EXPORT=path` entries for every export of every direct dependency.
  fn apply_exports(&mut self) {
    let mut additions: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, task) in &self.build_tasks {
      for dep in &task.depends_on {
        let Some(dep_task) = self.build_tasks.get(dep) else {
          continue;
        };
        for (export, path) in &dep_task.exports {
          let abs = normalize(&dep_task.dir.join(path));
          let value = crate::target::rel_string(&self.root, &abs);
          additions
            .entry(name.clone())
            .or_default()
            .push(format!("{}={}", export_var(dep, export), value));
        }
      }
    }
    for (name, env) in additions {
      if let Some(task) = self.build_tasks.get_mut(&name) {
        task.environment.extend(env);
      }
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::util::testutil::write_file;
  use tempfile::TempDir;

  fn workspace(files: &[(&str, &str)]) -> TempDir {
    let temp = TempDir::new().unwrap();
    write_file(temp.path(), WORKSPACE_MARKER, "");
    for (rel, content) in files {
      write_file(temp.path(), rel, content);
    }
    temp
  }

  fn chain() -> TempDir {
    workspace(&[
      (
        "bob.yaml",
        "build:\n  all:\n    dependsOn: [second/build2]\n    cmd: echo all\n",
      ),
      (
        "second/bob.yaml",
        "build:\n  build2:\n    input: main.go\n    dependsOn: [third/build3]\n    cmd: echo 2\n    target: run\n",
      ),
      (
        "second/third/bob.yaml",
        "build:\n  build3:\n    input: main.go\n    cmd: echo 3\n    target: run\n    export:\n      binary: run\n",
      ),
    ])
  }

  #[test]
  fn global_names_join_prefix() {
    assert_eq!(global_name(".", "build"), "build");
    assert_eq!(global_name("", "build"), "build");
    assert_eq!(global_name("second", "build2"), "second/build2");
    assert_eq!(global_name("/second", "build2"), "second/build2");
    assert_eq!(global_name("second/third", "../build2"), "second/build2");
  }

  #[test]
  fn export_vars_are_sanitized() {
    assert_eq!(export_var("second/third/build-3", "binary"), "SECOND_THIRD_BUILD_3_BINARY");
    assert_eq!(export_var("lib.v2", "out"), "LIB_V2_OUT");
  }

  #[test]
  fn nested_manifests_are_rescoped() {
    let temp = chain();
    let agg = aggregate(temp.path()).unwrap();

    let names: Vec<_> = agg.build_tasks.keys().cloned().collect();
    assert_eq!(names, vec!["all", "second/build2", "second/third/build3"]);
    assert_eq!(agg.task("second/build2").unwrap().depends_on, vec!["second/third/build3"]);
    assert_eq!(
      agg.closure("all").unwrap(),
      vec!["second/third/build3", "second/build2", "all"]
    );
  }

  #[test]
  fn exports_become_environment() {
    let temp = chain();
    let agg = aggregate(temp.path()).unwrap();
    let build2 = agg.task("second/build2").unwrap();
    assert_eq!(
      build2.env_value("SECOND_THIRD_BUILD3_BINARY"),
      Some("second/third/run")
    );
  }

  #[test]
  fn variables_are_uppercased_into_environment() {
    let temp = workspace(&[(
      "bob.yaml",
      "variables:\n  greeting: hello\nbuild:\n  build:\n    cmd: echo $GREETING\n",
    )]);
    let agg = aggregate(temp.path()).unwrap();
    assert_eq!(agg.task("build").unwrap().env_value("GREETING"), Some("hello"));
  }

  #[test]
  fn missing_top_level_manifest() {
    let temp = workspace(&[("sub/bob.yaml", "build:\n  x:\n    cmd: echo\n")]);
    let err = aggregate(temp.path()).unwrap_err();
    assert!(matches!(err, AggregateError::CouldNotFindTopLevelBobfile(_)));
  }

  #[test]
  fn self_reference_is_rejected() {
    let temp = workspace(&[("bob.yaml", "build:\n  x:\n    dependsOn: [x]\n    cmd: echo\n")]);
    let err = aggregate(temp.path()).unwrap_err();
    assert!(matches!(err, AggregateError::SelfReference(_)));
    assert!(err.is_user_error());
  }

  #[test]
  fn unknown_dependency_is_rejected() {
    let temp = workspace(&[("bob.yaml", "build:\n  x:\n    dependsOn: [nope]\n    cmd: echo\n")]);
    assert!(matches!(
      aggregate(temp.path()).unwrap_err(),
      AggregateError::DependencyNotFound { .. }
    ));
  }

  #[test]
  fn cycles_are_rejected() {
    let temp = workspace(&[(
      "bob.yaml",
      "build:\n  a:\n    dependsOn: [b]\n    cmd: echo\n  b:\n    dependsOn: [a]\n    cmd: echo\n",
    )]);
    assert!(matches!(aggregate(temp.path()).unwrap_err(), AggregateError::Cycle(_)));
  }

  #[test]
  fn decorations_extend_depends_on() {
    let temp = workspace(&[
      (
        "bob.yaml",
        "build:\n  lint:\n    cmd: echo lint\n  second/build2:\n    dependsOn: [lint]\n",
      ),
      ("second/bob.yaml", "build:\n  build2:\n    cmd: echo 2\n"),
    ]);
    let agg = aggregate(temp.path()).unwrap();
    assert_eq!(agg.task("second/build2").unwrap().depends_on, vec!["lint"]);
  }

  #[test]
  fn decorating_unknown_task_fails() {
    let temp = workspace(&[("bob.yaml", "build:\n  second/missing:\n    dependsOn: []\n")]);
    assert!(matches!(aggregate(temp.path()).unwrap_err(), AggregateError::TaskNotFound(_)));
  }

  #[test]
  fn imports_must_exist() {
    let temp = workspace(&[("bob.yaml", "imports: [nowhere]\nbuild:\n  x:\n    cmd: echo\n")]);
    assert!(matches!(
      aggregate(temp.path()).unwrap_err(),
      AggregateError::ImportNotFound { .. }
    ));
  }

  #[test]
  fn excluded_dirs_are_not_discovered() {
    let temp = workspace(&[
      ("bob.yaml", "build:\n  x:\n    cmd: echo\n"),
      ("node_modules/pkg/bob.yaml", "build:\n  y:\n    cmd: echo\n"),
    ]);
    let found = discover(temp.path()).unwrap();
    assert_eq!(found.len(), 1);
  }

  #[test]
  fn find_root_walks_up_to_marker() {
    let temp = chain();
    let nested = temp.path().join("second/third");
    assert_eq!(find_root(&nested), temp.path());
  }
}
