//! Manifest (`bob.yaml`) parsing.
//!
//! A `Bobfile` is one manifest with its tasks still under their local names.
//! The aggregator merges every discovered `Bobfile` into a single graph.

mod types;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::consts::BOBFILE_NAME;
use crate::target::{TargetSpec, validate_path};
use crate::task::Task;

pub use types::{BobfileDef, RunDef, RunKind, TargetDef, TaskDef};

#[derive(Debug, Error)]
pub enum BobfileError {
  #[error("failed to read {path}: {source}")]
  Read {
    path: PathBuf,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to parse {path}: {message}")]
  Parse { path: PathBuf, message: String },

  #[error("task {task}: invalid target path {path:?}, paths must be relative and must not contain '..'")]
  InvalidTargetPath { task: String, path: String },

  #[error("task {task}: target declares both path and image")]
  AmbiguousTarget { task: String },

  #[error("{name}: a decoration may only declare dependsOn")]
  InvalidDecoration { name: String },

  #[error("run {name}: path is required")]
  MissingRunPath { name: String },
}

impl BobfileError {
  pub fn is_user_error(&self) -> bool {
    !matches!(self, BobfileError::Read { .. })
  }
}

/// A long-running process started by `bob run`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Run {
  pub name: String,
  pub dir: PathBuf,
  pub kind: RunKind,
  /// Binary or compose file, relative to `dir`.
  pub path: String,
  pub depends_on: Vec<String>,
}

#[derive(Debug, Clone, Default)]
pub struct Bobfile {
  /// Directory containing the manifest.
  pub dir: PathBuf,
  pub version: Option<String>,
  /// Explicit `project:` or the manifest dir.
  pub project: String,
  pub explicit_project: bool,
  pub imports: Vec<String>,
  pub variables: BTreeMap<String, String>,
  /// Tasks keyed by local name.
  pub tasks: BTreeMap<String, Task>,
  /// Local task path to extra `dependsOn` entries.
  pub decorations: BTreeMap<String, Vec<String>>,
  pub runs: BTreeMap<String, Run>,
  pub dependencies: Vec<String>,
  pub shell: Option<String>,
  pub nixpkgs: String,
}

/// Non-empty trimmed lines.
fn lines(value: &str) -> Vec<String> {
  value
    .lines()
    .map(str::trim)
    .filter(|l| !l.is_empty())
    .map(str::to_string)
    .collect()
}

/// Split a `cmd:` block into commands, joining lines that end with `\`.
pub fn split_commands(cmd: &str) -> Vec<String> {
  let mut commands = Vec::new();
  let mut current = String::new();

  for line in cmd.lines() {
    let line = line.trim();
    if line.is_empty() && current.is_empty() {
      continue;
    }
    if let Some(stripped) = line.strip_suffix('\\') {
      current.push_str(stripped.trim_end());
      current.push(' ');
      continue;
    }
    current.push_str(line);
    let command = current.trim().to_string();
    if !command.is_empty() {
      commands.push(command);
    }
    current.clear();
  }

  let rest = current.trim();
  if !rest.is_empty() {
    commands.push(rest.to_string());
  }
  commands
}

fn yaml_scalar(value: &serde_yaml::Value) -> String {
  match value {
    serde_yaml::Value::String(s) => s.clone(),
    serde_yaml::Value::Bool(b) => b.to_string(),
    serde_yaml::Value::Number(n) => n.to_string(),
    serde_yaml::Value::Null => String::new(),
    other => serde_yaml::to_string(other).map(|s| s.trim().to_string()).unwrap_or_default(),
  }
}

fn parse_target(task: &str, def: &TargetDef) -> Result<Option<TargetSpec>, BobfileError> {
  let spec = match def {
    TargetDef::Paths(paths) => TargetSpec::Filesystem(lines(paths)),
    TargetDef::Table {
      path: Some(_),
      image: Some(_),
    } => {
      return Err(BobfileError::AmbiguousTarget { task: task.to_string() });
    }
    TargetDef::Table { path: Some(paths), .. } => TargetSpec::Filesystem(lines(paths)),
    TargetDef::Table { image: Some(images), .. } => TargetSpec::Docker(lines(images)),
    TargetDef::Table { .. } => return Ok(None),
  };

  let spec = match spec {
    TargetSpec::Filesystem(paths) => {
      let mut normalized = Vec::with_capacity(paths.len());
      for path in paths {
        validate_path(&path).map_err(|_| BobfileError::InvalidTargetPath {
          task: task.to_string(),
          path: path.clone(),
        })?;
        let trimmed = path.trim_start_matches("./").trim_end_matches('/').to_string();
        if !trimmed.is_empty() && trimmed != "." {
          normalized.push(trimmed);
        }
      }
      TargetSpec::Filesystem(normalized)
    }
    docker => docker,
  };
  Ok(Some(spec))
}

impl Bobfile {
  /// Read and parse `dir/bob.yaml`.
  pub fn from_dir(dir: &Path) -> Result<Self, BobfileError> {
    Self::from_path(&dir.join(BOBFILE_NAME))
  }

  pub fn from_path(path: &Path) -> Result<Self, BobfileError> {
    let content = std::fs::read_to_string(path).map_err(|source| BobfileError::Read {
      path: path.to_path_buf(),
      source,
    })?;
    let dir = path.parent().unwrap_or(Path::new(".")).to_path_buf();
    Self::parse(&content, &dir).map_err(|e| match e {
      BobfileError::Parse { message, .. } => BobfileError::Parse {
        path: path.to_path_buf(),
        message,
      },
      other => other,
    })
  }

  /// Parse a manifest whose tasks run in `dir`.
  pub fn parse(content: &str, dir: &Path) -> Result<Self, BobfileError> {
    let def: BobfileDef = if content.trim().is_empty() {
      BobfileDef::default()
    } else {
      serde_yaml::from_str(content).map_err(|e| BobfileError::Parse {
        path: dir.join(BOBFILE_NAME),
        message: e.to_string(),
      })?
    };

    let explicit_project = def.project.as_deref().is_some_and(|p| !p.is_empty());
    let project = def
      .project
      .clone()
      .filter(|p| !p.is_empty())
      .unwrap_or_else(|| dir.display().to_string());
    let nixpkgs = def.nixpkgs.clone().unwrap_or_default();

    let mut bobfile = Bobfile {
      dir: dir.to_path_buf(),
      version: def.version.clone(),
      project,
      explicit_project,
      imports: def.imports.clone(),
      variables: def.variables.iter().map(|(k, v)| (k.clone(), yaml_scalar(v))).collect(),
      dependencies: def.dependencies.clone(),
      shell: def.shell.clone(),
      nixpkgs,
      ..Bobfile::default()
    };

    for (name, task_def) in def.build {
      if name.contains('/') {
        if !task_def.is_decoration_only() {
          return Err(BobfileError::InvalidDecoration { name });
        }
        bobfile.decorations.insert(name, task_def.depends_on);
        continue;
      }

      let target = match &task_def.target {
        Some(t) => parse_target(&name, t)?,
        None => None,
      };

      let mut dependencies = bobfile.dependencies.clone();
      dependencies.extend(task_def.dependencies.iter().cloned());

      let task = Task {
        name: name.clone(),
        dir: bobfile.dir.clone(),
        project: bobfile.project.clone(),
        input_patterns: task_def.input.as_deref().map(lines).unwrap_or_default(),
        commands: task_def.cmd.as_deref().map(split_commands).unwrap_or_default(),
        depends_on: task_def.depends_on.clone(),
        environment: Vec::new(),
        target,
        rebuild: task_def.rebuild.unwrap_or_default(),
        exports: task_def.export.clone(),
        dependencies,
        nixpkgs: bobfile.nixpkgs.clone(),
      };
      bobfile.tasks.insert(name, task);
    }

    for (name, run_def) in def.run {
      if run_def.path.trim().is_empty() {
        return Err(BobfileError::MissingRunPath { name });
      }
      bobfile.runs.insert(
        name.clone(),
        Run {
          name,
          dir: bobfile.dir.clone(),
          kind: run_def.kind,
          path: run_def.path.trim().to_string(),
          depends_on: run_def.depends_on,
        },
      );
    }

    debug!(
      dir = %bobfile.dir.display(),
      tasks = bobfile.tasks.len(),
      runs = bobfile.runs.len(),
      decorations = bobfile.decorations.len(),
      "parsed bobfile"
    );
    Ok(bobfile)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::task::RebuildPolicy;

  fn parse(content: &str) -> Result<Bobfile, BobfileError> {
    Bobfile::parse(content, Path::new("/work/app"))
  }

  #[test]
  fn parses_hello_task() {
    let bobfile = parse(
      r#"
build:
  build:
    input: ./main.go
    cmd: go build -o run
    target: run
"#,
    )
    .unwrap();

    let task = &bobfile.tasks["build"];
    assert_eq!(task.input_patterns, vec!["./main.go"]);
    assert_eq!(task.commands, vec!["go build -o run"]);
    assert_eq!(task.target, Some(TargetSpec::Filesystem(vec!["run".into()])));
    assert_eq!(task.rebuild, RebuildPolicy::OnChange);
    assert_eq!(task.project, "/work/app");
    assert!(!bobfile.explicit_project);
  }

  #[test]
  fn joins_continued_command_lines() {
    let commands = split_commands("go build \\\n  -o run\n\necho done\n");
    assert_eq!(commands, vec!["go build -o run", "echo done"]);
  }

  #[test]
  fn target_table_shapes() {
    let bobfile = parse(
      r#"
build:
  image:
    cmd: docker build -t bob/testimage:latest .
    target:
      image: bob/testimage:latest
  files:
    target:
      path: |
        dist/
        ./run
"#,
    )
    .unwrap();

    assert_eq!(
      bobfile.tasks["image"].target,
      Some(TargetSpec::Docker(vec!["bob/testimage:latest".into()]))
    );
    assert_eq!(
      bobfile.tasks["files"].target,
      Some(TargetSpec::Filesystem(vec!["dist".into(), "run".into()]))
    );
  }

  #[test]
  fn path_and_image_is_ambiguous() {
    let err = parse(
      r#"
build:
  build:
    target:
      path: run
      image: foo
"#,
    )
    .unwrap_err();
    assert!(matches!(err, BobfileError::AmbiguousTarget { .. }));
    assert!(err.is_user_error());
  }

  #[test]
  fn parent_dir_target_is_rejected() {
    let err = parse("build:\n  build:\n    target: ../run\n").unwrap_err();
    assert!(matches!(err, BobfileError::InvalidTargetPath { .. }));
  }

  #[test]
  fn decorations_only_carry_depends_on() {
    let bobfile = parse(
      r#"
build:
  second/build2:
    dependsOn: [lint]
"#,
    )
    .unwrap();
    assert_eq!(bobfile.decorations["second/build2"], vec!["lint"]);
    assert!(bobfile.tasks.is_empty());

    let err = parse("build:\n  second/build2:\n    cmd: echo\n").unwrap_err();
    assert!(matches!(err, BobfileError::InvalidDecoration { .. }));
  }

  #[test]
  fn variables_and_dependencies_are_seeded() {
    let bobfile = parse(
      r#"
project: example.com/app
variables:
  greeting: hello
  port: 8080
dependencies: [go_1_21]
nixpkgs: nixos-24.05
build:
  build:
    cmd: echo $GREETING
    dependencies: [git]
    rebuild: always
    export:
      binary: run
"#,
    )
    .unwrap();

    assert!(bobfile.explicit_project);
    assert_eq!(bobfile.variables["port"], "8080");
    let task = &bobfile.tasks["build"];
    assert_eq!(task.dependencies, vec!["go_1_21", "git"]);
    assert_eq!(task.nixpkgs, "nixos-24.05");
    assert_eq!(task.rebuild, RebuildPolicy::Always);
    assert_eq!(task.exports["binary"], "run");
  }

  #[test]
  fn runs_are_parsed() {
    let bobfile = parse(
      r#"
run:
  server:
    type: binary
    path: ./run
    dependsOn: [build]
  stack:
    type: compose
    path: docker-compose.yml
"#,
    )
    .unwrap();
    assert_eq!(bobfile.runs["server"].kind, RunKind::Binary);
    assert_eq!(bobfile.runs["server"].depends_on, vec!["build"]);
    assert_eq!(bobfile.runs["stack"].kind, RunKind::Compose);
  }

  #[test]
  fn empty_document_is_valid() {
    let bobfile = parse("").unwrap();
    assert!(bobfile.tasks.is_empty());
  }

  #[test]
  fn malformed_yaml_is_parse_error() {
    let err = parse("build: [").unwrap_err();
    assert!(matches!(err, BobfileError::Parse { .. }));
  }
}
