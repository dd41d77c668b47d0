//! CLI output formatting utilities.
//!
//! Provides consistent formatting for terminal output including colored status
//! messages, the build summary table and duration formatting.

use std::time::{Duration, SystemTime, UNIX_EPOCH};

use anyhow::Context;
use clap::ValueEnum;
use owo_colors::{OwoColorize, Stream};

use bob_lib::execute::BuildSummary;
use bob_lib::playbook::{TaskState, TaskSummary};

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
pub enum OutputFormat {
  #[default]
  Text,
  Json,
}

impl OutputFormat {
  pub fn is_json(self) -> bool {
    matches!(self, OutputFormat::Json)
  }
}

pub mod symbols {
  pub const SUCCESS: &str = "✓";
  pub const ERROR: &str = "✗";
  pub const WARNING: &str = "⚠";
  pub const INFO: &str = "•";
}

pub fn truncate_hash(hash: &str) -> &str {
  let len = hash.len().min(12);
  &hash[..len]
}

pub fn format_duration(duration: Duration) -> String {
  let secs = duration.as_secs();
  let millis = duration.subsec_millis();

  if secs >= 60 {
    let mins = secs / 60;
    let remaining_secs = secs % 60;
    format!("{}m {}s", mins, remaining_secs)
  } else if secs > 0 {
    format!("{}.{:02}s", secs, millis / 10)
  } else {
    format!("{}ms", millis)
  }
}

/// RFC 3339 timestamp for seconds since the unix epoch.
pub fn format_timestamp(secs: u64) -> String {
  let time: SystemTime = UNIX_EPOCH + Duration::from_secs(secs);
  humantime::format_rfc3339_seconds(time).to_string()
}

pub fn print_success(message: &str) {
  println!(
    "{} {}",
    symbols::SUCCESS.if_supports_color(Stream::Stdout, |s| s.green()),
    message
  );
}

pub fn print_error(message: &str) {
  eprintln!(
    "{} {}",
    symbols::ERROR.if_supports_color(Stream::Stderr, |s| s.red()),
    message.if_supports_color(Stream::Stderr, |s| s.red())
  );
}

pub fn print_warning(message: &str) {
  eprintln!(
    "{} {}",
    symbols::WARNING.if_supports_color(Stream::Stderr, |s| s.yellow()),
    message.if_supports_color(Stream::Stderr, |s| s.yellow())
  );
}

pub fn print_info(message: &str) {
  println!(
    "{} {}",
    symbols::INFO.if_supports_color(Stream::Stdout, |s| s.blue()),
    message
  );
}

pub fn print_stat(label: &str, value: &str) {
  println!(
    "  {}: {}",
    label.if_supports_color(Stream::Stdout, |s| s.dimmed()),
    value
  );
}

pub fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
  let json = serde_json::to_string_pretty(value).context("Failed to serialize to JSON")?;
  println!("{}", json);
  Ok(())
}

fn state_label(state: TaskState) -> String {
  let label = format!("{:<8}", state.to_string());
  match state {
    TaskState::Completed => label.if_supports_color(Stream::Stdout, |s| s.green()).to_string(),
    TaskState::NoRebuildRequired => label.if_supports_color(Stream::Stdout, |s| s.blue()).to_string(),
    TaskState::Failed => label.if_supports_color(Stream::Stdout, |s| s.red()).to_string(),
    TaskState::Canceled => label.if_supports_color(Stream::Stdout, |s| s.yellow()).to_string(),
    _ => label.if_supports_color(Stream::Stdout, |s| s.dimmed()).to_string(),
  }
}

fn summary_line(task: &TaskSummary, width: usize) -> String {
  let mut line = format!(
    "  {:<width$}  {}  {:>8}",
    task.name,
    state_label(task.state),
    format_duration(task.duration),
  );
  if let Some(cause) = task.cause {
    line.push_str(&format!("  {}", cause.if_supports_color(Stream::Stdout, |s| s.dimmed())));
  }
  line
}

/// Per-task table followed by a one-line verdict.
pub fn print_summary(summary: &BuildSummary) {
  let width = summary.tasks.iter().map(|t| t.name.len()).max().unwrap_or(0);

  println!();
  for task in &summary.tasks {
    println!("{}", summary_line(task, width));
    for skipped in &task.skipped_inputs {
      print_warning(&format!("{}: skipped unreadable input {}", task.name, skipped.display()));
    }
  }
  println!();

  let built = summary.count(TaskState::Completed);
  let cached = summary.count(TaskState::NoRebuildRequired);
  if summary.is_success() {
    print_success(&format!(
      "{} in {} ({} built, {} cached)",
      summary.root,
      format_duration(summary.duration),
      built,
      cached
    ));
  }
}
