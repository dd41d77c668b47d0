//! Command execution.

use std::process::Stdio;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tracing::{debug, info, warn};

use super::{Cancel, ExecRequest, ExecuteError};

/// Log target of command output lines.
pub const OUTPUT_TARGET: &str = "bob::output";

/// Runs a task's commands.
#[async_trait]
pub trait Executor: Send + Sync {
  /// Run every command of the request; return once they finished, failed, or
  /// `cancel` fired (then `ExecuteError::Canceled`).
  async fn execute(&self, request: &ExecRequest, cancel: &Cancel) -> Result<(), ExecuteError>;
}

/// Runs commands as one `sh -e -c` script with a cleared environment.
#[derive(Debug, Clone, Default)]
pub struct ShellExecutor {
  shell: Option<String>,
}

impl ShellExecutor {
  pub fn new(shell: Option<String>) -> Self {
    Self { shell }
  }
}

/// Shell binary and the arguments that precede the script.
///
/// Unix-style shells run with `-e` so the first failing command stops the
/// script.
fn get_shell(override_shell: Option<&str>) -> (String, Vec<String>) {
  if let Some(shell) = override_shell.filter(|s| !s.trim().is_empty()) {
    let args = if shell.contains("powershell") || shell.contains("pwsh") {
      vec!["-NoProfile".to_string(), "-Command".to_string()]
    } else if shell.contains("cmd") {
      vec!["/C".to_string()]
    } else {
      vec!["-e".to_string(), "-c".to_string()]
    };
    return (shell.to_string(), args);
  }

  #[cfg(unix)]
  {
    ("/bin/sh".to_string(), vec!["-e".to_string(), "-c".to_string()])
  }

  #[cfg(windows)]
  {
    (
      "powershell.exe".to_string(),
      vec![
        "-NoProfile".to_string(),
        "-ExecutionPolicy".to_string(),
        "Bypass".to_string(),
        "-Command".to_string(),
      ],
    )
  }
}

/// Kill the command and everything it started. On unix the child leads its
/// own process group, so the whole group is signalled.
async fn terminate(child: &mut Child, task: &str) {
  #[cfg(unix)]
  {
    use rustix::process::{Pid, Signal, kill_process_group};

    if let Some(pid) = child.id().and_then(|id| Pid::from_raw(id as i32))
      && let Err(e) = kill_process_group(pid, Signal::KILL)
    {
      warn!(task = %task, error = %e, "failed to kill process group");
    }
  }
  if let Err(e) = child.kill().await {
    debug!(task = %task, error = %e, "child already exited");
  }
}

async fn forward<R: AsyncRead + Unpin>(reader: R, task: String, stream: &'static str) {
  let mut lines = BufReader::new(reader).lines();
  while let Ok(Some(line)) = lines.next_line().await {
    info!(target: OUTPUT_TARGET, task = %task, stream, "{}", line);
  }
}

#[async_trait]
impl Executor for ShellExecutor {
  async fn execute(&self, request: &ExecRequest, cancel: &Cancel) -> Result<(), ExecuteError> {
    if request.commands.is_empty() {
      return Ok(());
    }
    if cancel.is_cancelled() {
      return Err(ExecuteError::Canceled);
    }

    let (shell, args) = get_shell(self.shell.as_deref());
    let script = request.commands.join("\n");

    let mut command = Command::new(&shell);
    command
      .args(&args)
      .arg(&script)
      .current_dir(&request.dir)
      .env_clear()
      .stdin(Stdio::null())
      .stdout(Stdio::piped())
      .stderr(Stdio::piped())
      .kill_on_drop(true);
    #[cfg(unix)]
    command.process_group(0);

    for entry in &request.env {
      if let Some((key, value)) = entry.split_once('=')
        && !key.is_empty()
      {
        command.env(key, value);
      }
    }

    debug!(task = %request.name, shell = %shell, dir = %request.dir.display(), "spawning commands");
    let mut child = command.spawn().map_err(|source| ExecuteError::Spawn {
      task: request.name.clone(),
      shell: shell.clone(),
      source,
    })?;

    let stdout = child.stdout.take().map(|out| tokio::spawn(forward(out, request.name.clone(), "stdout")));
    let stderr = child.stderr.take().map(|err| tokio::spawn(forward(err, request.name.clone(), "stderr")));

    let status = tokio::select! {
      status = child.wait() => status?,
      _ = cancel.cancelled() => {
        terminate(&mut child, &request.name).await;
        debug!(task = %request.name, "killed on cancel");
        return Err(ExecuteError::Canceled);
      }
    };

    for handle in [stdout, stderr].into_iter().flatten() {
      let _ = handle.await;
    }

    if !status.success() {
      return Err(ExecuteError::CmdFailed {
        task: request.name.clone(),
        code: status.code(),
      });
    }
    Ok(())
  }
}

#[cfg(all(test, unix))]
mod tests {
  use super::*;
  use std::time::{Duration, Instant};
  use tempfile::TempDir;

  fn request(dir: &TempDir, commands: &[&str], env: &[&str]) -> ExecRequest {
    ExecRequest {
      name: "test".into(),
      commands: commands.iter().map(|s| s.to_string()).collect(),
      dir: dir.path().to_path_buf(),
      env: env.iter().map(|s| s.to_string()).collect(),
    }
  }

  #[tokio::test]
  async fn runs_in_task_dir_with_env() {
    let temp = TempDir::new().unwrap();
    let req = request(&temp, &["echo \"$GREETING\" > out.txt"], &["GREETING=hello"]);
    ShellExecutor::default().execute(&req, &Cancel::new()).await.unwrap();
    assert_eq!(std::fs::read_to_string(temp.path().join("out.txt")).unwrap(), "hello\n");
  }

  #[tokio::test]
  async fn environment_is_not_inherited() {
    let temp = TempDir::new().unwrap();
    let req = request(&temp, &["test -z \"$HOME\""], &[]);
    ShellExecutor::default().execute(&req, &Cancel::new()).await.unwrap();
  }

  #[tokio::test]
  async fn first_failure_stops_the_script() {
    let temp = TempDir::new().unwrap();
    let req = request(&temp, &["exit 3", "touch never"], &[]);
    let err = ShellExecutor::default().execute(&req, &Cancel::new()).await.unwrap_err();
    assert!(matches!(err, ExecuteError::CmdFailed { code: Some(3), .. }));
    assert!(!temp.path().join("never").exists());
  }

  /// True once `pid` has exited (absent or a zombie awaiting its reaper).
  #[cfg(target_os = "linux")]
  fn exited(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
      Err(_) => true,
      Ok(stat) => stat.rsplit(')').next().and_then(|rest| rest.split_whitespace().next()) == Some("Z"),
    }
  }

  #[tokio::test]
  async fn cancel_kills_the_command() {
    let temp = TempDir::new().unwrap();
    let req = request(&temp, &["sleep 30"], &["PATH=/usr/bin:/bin"]);
    let cancel = Cancel::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      trigger.cancel();
    });

    let started = Instant::now();
    let err = ShellExecutor::default().execute(&req, &cancel).await.unwrap_err();
    assert!(err.is_canceled());
    assert!(started.elapsed() < Duration::from_secs(10));
  }

  #[cfg(target_os = "linux")]
  #[tokio::test]
  async fn cancel_kills_processes_started_by_the_script() {
    let temp = TempDir::new().unwrap();
    let req = request(
      &temp,
      &["sleep 31 &", "echo $! > sleeper.pid", "wait"],
      &["PATH=/usr/bin:/bin"],
    );
    let cancel = Cancel::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(300)).await;
      trigger.cancel();
    });

    let err = ShellExecutor::default().execute(&req, &cancel).await.unwrap_err();
    assert!(err.is_canceled());

    let pid = std::fs::read_to_string(temp.path().join("sleeper.pid")).unwrap();
    let pid = pid.trim().to_string();
    let deadline = Instant::now() + Duration::from_secs(5);
    while !exited(&pid) && Instant::now() < deadline {
      tokio::time::sleep(Duration::from_millis(50)).await;
    }
    assert!(exited(&pid), "sleep {} survived cancellation", pid);
  }

  #[test]
  fn shell_arguments() {
    assert_eq!(get_shell(Some("bash")).1, vec!["-e", "-c"]);
    assert_eq!(get_shell(Some("pwsh")).1, vec!["-NoProfile", "-Command"]);
    assert_eq!(get_shell(None).0, "/bin/sh");
  }
}
