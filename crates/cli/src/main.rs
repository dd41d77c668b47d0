mod cmd;
mod output;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use cmd::{cmd_build, cmd_clean, cmd_clean_targets, cmd_init, cmd_inspect_artifacts, cmd_inspect_artifact, cmd_inspect_buildinfo, cmd_inspect_env, cmd_run};
use output::{OutputFormat, print_error};

/// bob - build orchestrator with content-addressed caching
#[derive(Parser)]
#[command(name = "bob")]
#[command(author, version, about, long_about = None)]
struct Cli {
  /// Enable verbose output
  #[arg(short, long, global = true)]
  verbose: bool,

  /// Output format
  #[arg(short, long, global = true, value_enum, default_value_t = OutputFormat::Text)]
  output: OutputFormat,

  #[command(subcommand)]
  command: Commands,
}

/// Flags shared by commands that build.
#[derive(Args, Debug, Clone, Default)]
pub struct BuildArgs {
  /// Neither restore nor store artifacts
  #[arg(long)]
  pub no_cache: bool,

  /// Extra environment entry for every task (repeatable)
  #[arg(long = "env", value_name = "KEY=VALUE", value_parser = cmd::parse_env)]
  pub env: Vec<String>,

  /// Maximum number of tasks running at once
  #[arg(short, long)]
  pub jobs: Option<usize>,
}

#[derive(Subcommand)]
enum Commands {
  /// Build a task and everything it depends on
  Build {
    /// Task to build
    #[arg(default_value = "build")]
    task: String,

    #[command(flatten)]
    args: BuildArgs,
  },

  /// Build the dependencies of a run and start it
  Run {
    /// Run to start
    name: String,

    #[command(flatten)]
    args: BuildArgs,
  },

  /// Delete artifacts and build infos from the local cache
  Clean {
    /// Only delete entries recorded for this project
    #[arg(long)]
    project: Option<String>,

    #[command(subcommand)]
    what: Option<CleanCommand>,
  },

  /// Write a starter bob.yaml and workspace marker
  Init {
    /// Directory to initialize (default: current directory)
    path: Option<PathBuf>,
  },

  /// Look into the local cache and task environments
  Inspect {
    #[command(subcommand)]
    what: InspectCommand,
  },
}

#[derive(Subcommand)]
enum CleanCommand {
  /// Remove the declared filesystem targets of a task and its dependencies
  Targets {
    /// Task whose playbook is cleaned
    task: String,
  },
}

#[derive(Subcommand)]
enum InspectCommand {
  /// Artifacts in the local store
  Artifact {
    #[command(subcommand)]
    what: ArtifactCommand,
  },

  /// Print a build info record
  Buildinfo {
    /// Input hash of the record
    id: String,
  },

  /// Print the environment a task would run with
  Env {
    /// Task name
    task: String,

    /// Extra environment entry (repeatable)
    #[arg(long = "env", value_name = "KEY=VALUE", value_parser = cmd::parse_env)]
    env: Vec<String>,
  },
}

#[derive(Subcommand)]
enum ArtifactCommand {
  /// List artifact ids with their metadata
  List,

  /// Print metadata and entries of one artifact
  Show {
    /// Artifact id (input hash)
    id: String,
  },
}

fn main() {
  let cli = Cli::parse();

  let default_level = if cli.verbose { "debug" } else { "warn,bob::output=info" };
  let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
  tracing_subscriber::fmt()
    .with_env_filter(filter)
    .with_writer(std::io::stderr)
    .without_time()
    .init();

  if let Err(err) = dispatch(cli) {
    print_error(&format!("{err:#}"));
    std::process::exit(1);
  }
}

fn dispatch(cli: Cli) -> Result<()> {
  let output = cli.output;
  match cli.command {
    Commands::Build { task, args } => cmd_build(&task, &args, output),
    Commands::Run { name, args } => cmd_run(&name, &args),
    Commands::Clean { what: Some(CleanCommand::Targets { task }), .. } => cmd_clean_targets(&task, output),
    Commands::Clean { project, what: None } => cmd_clean(project.as_deref(), output),
    Commands::Init { path } => cmd_init(path),
    Commands::Inspect { what } => match what {
      InspectCommand::Artifact { what: ArtifactCommand::List } => cmd_inspect_artifacts(output),
      InspectCommand::Artifact { what: ArtifactCommand::Show { id } } => cmd_inspect_artifact(&id, output),
      InspectCommand::Buildinfo { id } => cmd_inspect_buildinfo(&id),
      InspectCommand::Env { task, env } => cmd_inspect_env(&task, &env),
    },
  }
}
