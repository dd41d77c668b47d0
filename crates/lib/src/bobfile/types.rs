//! Raw `bob.yaml` document shapes, as deserialized.

use std::collections::BTreeMap;

use serde::Deserialize;

use crate::task::RebuildPolicy;

/// Top-level manifest document.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct BobfileDef {
  pub version: Option<String>,
  pub project: Option<String>,
  #[serde(alias = "import")]
  pub imports: Vec<String>,
  /// Scalars are accepted and stringified.
  pub variables: BTreeMap<String, serde_yaml::Value>,
  pub build: BTreeMap<String, TaskDef>,
  pub run: BTreeMap<String, RunDef>,
  pub dependencies: Vec<String>,
  pub shell: Option<String>,
  pub nixpkgs: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct TaskDef {
  pub input: Option<String>,
  pub cmd: Option<String>,
  pub target: Option<TargetDef>,
  #[serde(rename = "dependsOn", alias = "depends_on")]
  pub depends_on: Vec<String>,
  pub rebuild: Option<RebuildPolicy>,
  #[serde(alias = "exports")]
  pub export: BTreeMap<String, String>,
  pub dependencies: Vec<String>,
  pub description: Option<String>,
}

impl TaskDef {
  /// True when only `dependsOn` (and the ignored `description`) is set.
  pub fn is_decoration_only(&self) -> bool {
    self.input.is_none()
      && self.cmd.is_none()
      && self.target.is_none()
      && self.rebuild.is_none()
      && self.export.is_empty()
      && self.dependencies.is_empty()
  }
}

/// `target:` accepts a bare string of paths or a table.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum TargetDef {
  Paths(String),
  Table {
    #[serde(default)]
    path: Option<String>,
    #[serde(default)]
    image: Option<String>,
  },
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunKind {
  #[default]
  Binary,
  Compose,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct RunDef {
  #[serde(rename = "type")]
  pub kind: RunKind,
  pub path: String,
  #[serde(rename = "dependsOn", alias = "depends_on")]
  pub depends_on: Vec<String>,
}
