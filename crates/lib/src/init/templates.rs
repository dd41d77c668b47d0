//! Template content for `bob init`.

/// Starter `bob.yaml`.
pub const BOBFILE_TEMPLATE: &str = r#"# bob.yaml
#
# Tasks under `build` are run with `bob build <name>`. A task only reruns when
# its inputs, commands or environment change.
project: {project}

build:
  build:
    input: "*"
    cmd: echo "hello from bob" > hello.txt
    target: hello.txt
"#;
