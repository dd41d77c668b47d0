//! CLI smoke tests for bob.
//!
//! These tests drive the `bob` binary in a temp workspace with its own cache
//! root and check exit codes and the visible output.

use std::path::Path;

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use serial_test::serial;
use tempfile::TempDir;

/// Temp workspace plus a separate cache root.
struct Env {
  temp: TempDir,
}

impl Env {
  fn new(bobfile: &str) -> Self {
    let temp = TempDir::new().unwrap();
    std::fs::create_dir_all(temp.path().join("work")).unwrap();
    std::fs::write(temp.path().join("work/.bob.workspace"), "").unwrap();
    std::fs::write(temp.path().join("work/bob.yaml"), bobfile).unwrap();
    Self { temp }
  }

  fn work(&self) -> std::path::PathBuf {
    self.temp.path().join("work")
  }

  fn write(&self, rel: &str, content: &str) {
    let path = self.work().join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, content).unwrap();
  }

  fn bob(&self) -> Command {
    bob_in(&self.work(), &self.temp.path().join("cache"))
  }
}

fn bob_in(dir: &Path, cache: &Path) -> Command {
  let mut cmd = cargo_bin_cmd!("bob");
  cmd.current_dir(dir).env("BOB_CACHE_DIR", cache).env_remove("RUST_LOG");
  cmd
}

const HELLO: &str = r#"
build:
  build:
    input: main.txt
    cmd: cp main.txt run
    target: run
"#;

// =============================================================================
// Help & Version
// =============================================================================

#[test]
fn help_flag_works() {
  cargo_bin_cmd!("bob")
    .arg("--help")
    .assert()
    .success()
    .stdout(predicate::str::contains("Usage"));
}

#[test]
fn version_flag_works() {
  cargo_bin_cmd!("bob")
    .arg("--version")
    .assert()
    .success()
    .stdout(predicate::str::contains("bob"));
}

#[test]
fn subcommand_help_works() {
  for cmd in &["build", "run", "clean", "init", "inspect"] {
    cargo_bin_cmd!("bob")
      .arg(cmd)
      .arg("--help")
      .assert()
      .success()
      .stdout(predicate::str::contains("Usage"));
  }
}

// =============================================================================
// init
// =============================================================================

#[test]
#[serial]
fn init_creates_workspace() {
  let temp = TempDir::new().unwrap();
  let dir = temp.path().join("app");

  bob_in(temp.path(), &temp.path().join("cache"))
    .arg("init")
    .arg(&dir)
    .assert()
    .success()
    .stdout(predicate::str::contains("Initialized"));

  assert!(dir.join("bob.yaml").exists());
  assert!(dir.join(".bob.workspace").exists());
}

#[test]
#[serial]
fn init_fails_if_manifest_exists() {
  let env = Env::new(HELLO);

  env
    .bob()
    .arg("init")
    .assert()
    .failure()
    .stderr(predicate::str::contains("already exists"));
}

// =============================================================================
// build
// =============================================================================

#[cfg(unix)]
#[test]
#[serial]
fn build_then_cached() {
  let env = Env::new(HELLO);
  env.write("main.txt", "hello");

  env
    .bob()
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("done"));
  assert_eq!(std::fs::read_to_string(env.work().join("run")).unwrap(), "hello");

  env
    .bob()
    .arg("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("cached"));
}

#[cfg(unix)]
#[test]
#[serial]
fn failing_command_exits_with_one() {
  let env = Env::new(
    r#"
build:
  build:
    cmd: exit 3
"#,
  );

  env
    .bob()
    .arg("build")
    .assert()
    .code(1)
    .stdout(predicate::str::contains("failed"))
    .stderr(predicate::str::contains("task build failed"));
}

#[test]
#[serial]
fn self_reference_is_a_user_error() {
  let env = Env::new(
    r#"
build:
  x:
    dependsOn: [x]
    cmd: touch out
"#,
  );

  env.bob().args(["build", "x"]).assert().code(1);
  assert!(!env.work().join("out").exists());
}

#[test]
#[serial]
fn unknown_task_fails() {
  let env = Env::new(HELLO);
  env.write("main.txt", "hello");

  env
    .bob()
    .args(["build", "nope"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("nope"));
}

#[test]
fn bad_env_flag_is_rejected() {
  let env = Env::new(HELLO);
  env.bob().args(["build", "--env", "NOVALUE"]).assert().failure();
}

#[cfg(unix)]
#[test]
#[serial]
fn env_flag_reaches_commands() {
  let env = Env::new(
    r#"
build:
  build:
    cmd: printf '%s' "$GREETING" > out
    target: out
"#,
  );

  env.bob().args(["build", "--env", "GREETING=hi"]).assert().success();
  assert_eq!(std::fs::read_to_string(env.work().join("out")).unwrap(), "hi");
}

// =============================================================================
// clean / inspect
// =============================================================================

#[cfg(unix)]
#[test]
#[serial]
fn inspect_and_clean_the_cache() {
  let env = Env::new(HELLO);
  env.write("main.txt", "hello");
  env.bob().arg("build").assert().success();

  env
    .bob()
    .args(["inspect", "artifact", "list"])
    .assert()
    .success()
    .stdout(predicate::str::contains("build"));

  env
    .bob()
    .args(["clean"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Artifacts removed: 1"));

  env
    .bob()
    .args(["inspect", "artifact", "list"])
    .assert()
    .success()
    .stdout(predicate::str::contains("No artifacts"));
}

#[cfg(unix)]
#[test]
#[serial]
fn clean_targets_removes_outputs() {
  let env = Env::new(HELLO);
  env.write("main.txt", "hello");
  env.bob().arg("build").assert().success();
  assert!(env.work().join("run").exists());

  env.bob().args(["clean", "targets", "build"]).assert().success();
  assert!(!env.work().join("run").exists());
  assert!(env.work().join("main.txt").exists());
}

#[test]
#[serial]
fn inspect_env_shows_task_entries() {
  let env = Env::new(
    r#"
variables:
  greeting: hi
build:
  build:
    cmd: "true"
"#,
  );

  env
    .bob()
    .args(["inspect", "env", "build", "--env", "EXTRA=1"])
    .assert()
    .success()
    .stdout(predicate::str::contains("GREETING=hi"))
    .stdout(predicate::str::contains("EXTRA=1"));
}

#[test]
#[serial]
fn inspect_missing_buildinfo_fails() {
  let env = Env::new(HELLO);
  env.bob().args(["inspect", "buildinfo", "deadbeef"]).assert().failure();
}
