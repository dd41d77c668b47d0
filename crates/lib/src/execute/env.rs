use crate::task::Task;

/// Supplies the base environment a task's commands run with. The task's own
/// environment entries are appended after it.
pub trait EnvProvider: Send + Sync {
  fn environment(&self, task: &Task) -> Vec<String>;
}

/// Passes the environment of the bob process through.
#[derive(Debug, Clone, Copy, Default)]
pub struct HostEnv;

impl EnvProvider for HostEnv {
  fn environment(&self, _task: &Task) -> Vec<String> {
    std::env::vars_os()
      .filter_map(|(k, v)| Some(format!("{}={}", k.into_string().ok()?, v.into_string().ok()?)))
      .collect()
  }
}

/// Base environment followed by the task's entries.
pub fn task_environment(provider: &dyn EnvProvider, task: &Task) -> Vec<String> {
  let mut env = provider.environment(task);
  env.extend(task.environment.iter().cloned());
  env
}
