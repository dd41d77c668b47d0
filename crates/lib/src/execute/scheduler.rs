//! Parallel, dependency-ordered execution of a playbook.
//!
//! One dispatcher owns the idle channel. Every worker announces itself there
//! when it is free; the dispatcher asks the playbook for the next ready task
//! and hands it to that worker over the worker's single-slot channel. When
//! nothing is ready the worker id is parked and re-published as soon as the
//! playbook changes state.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::{Notify, mpsc};
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::playbook::{NextTask, Playbook, PlaybookError, RebuildCause};

use super::env::task_environment;
use super::{BuildContext, BuildOptions, BuildSummary, Cancel, ExecRequest, ExecuteError};

/// State shared between the dispatcher and its workers.
#[derive(Default)]
struct Shared {
  shutdown: AtomicBool,
  canceled: AtomicBool,
  in_flight: AtomicUsize,
  first_error: Mutex<Option<(String, ExecuteError)>>,
  wake: Notify,
}

impl Shared {
  fn fail(&self, task: &str, err: ExecuteError) {
    let mut first = self.first_error.lock().unwrap_or_else(PoisonError::into_inner);
    if first.is_none() {
      *first = Some((task.to_string(), err));
    } else {
      debug!(task = %task, error = %err, "suppressing follow-up error");
    }
    drop(first);
    self.shutdown.store(true, Ordering::SeqCst);
    self.wake.notify_one();
  }

  fn take_error(&self) -> Option<(String, ExecuteError)> {
    self.first_error.lock().unwrap_or_else(PoisonError::into_inner).take()
  }
}

/// Run a blocking playbook operation off the async runtime.
async fn blocking<T, F>(playbook: &Arc<Playbook>, f: F) -> Result<T, ExecuteError>
where
  T: Send + 'static,
  F: FnOnce(&Playbook) -> Result<T, PlaybookError> + Send + 'static,
{
  let playbook = playbook.clone();
  tokio::task::spawn_blocking(move || f(&playbook))
    .await
    .map_err(|e| ExecuteError::Join(e.to_string()))?
    .map_err(ExecuteError::from)
}

/// Decide, restore or run, and record one task.
async fn run_task(playbook: &Arc<Playbook>, ctx: &BuildContext, cancel: &Cancel, id: usize) -> Result<(), ExecuteError> {
  if cancel.is_cancelled() {
    return Err(ExecuteError::Canceled);
  }
  playbook.task_started(id)?;
  let task = playbook.status(id)?.task.clone();

  let (hash, check) = blocking(playbook, move |pb| {
    let hash = pb.input_hash(id)?;
    let check = pb.needs_rebuild(id, &hash)?;
    Ok((hash, check))
  })
  .await?;

  if !check.needed() {
    debug!(task = %task.name, hash = %hash, "no rebuild required");
    playbook.task_no_rebuild_required(id)?;
    return Ok(());
  }

  let mut cause = check.cause;
  if check.restorable() && playbook.caching() && task.has_target() {
    let (h, c) = (hash.clone(), check.clone());
    if blocking(playbook, move |pb| pb.restore(id, &h, &c)).await? {
      playbook.task_no_rebuild_required(id)?;
      return Ok(());
    }
    if cause == Some(RebuildCause::TargetInvalid) {
      cause = Some(RebuildCause::TargetNotInLocalStore);
    }
  }
  playbook.set_cause(id, cause)?;
  info!(
    task = %task.name,
    cause = %cause.map(|c| c.to_string()).unwrap_or_default(),
    "building"
  );

  let c = check.clone();
  blocking(playbook, move |pb| pb.clean_before_build(id, &c)).await?;

  if !task.commands.is_empty() {
    let request = ExecRequest {
      name: task.name.clone(),
      commands: task.commands.clone(),
      dir: task.dir.clone(),
      env: task_environment(ctx.env.as_ref(), &task),
    };
    ctx.executor.execute(&request, cancel).await?;
  }

  blocking(playbook, move |pb| pb.task_completed(id, &hash)).await?;
  info!(task = %task.name, "completed");
  Ok(())
}

async fn worker(
  worker_id: usize,
  mut workload: mpsc::Receiver<usize>,
  idle: mpsc::UnboundedSender<usize>,
  playbook: Arc<Playbook>,
  ctx: BuildContext,
  cancel: Cancel,
  shared: Arc<Shared>,
) {
  if idle.send(worker_id).is_err() {
    return;
  }

  while let Some(id) = workload.recv().await {
    let name = playbook
      .status(id)
      .map(|s| s.name().to_string())
      .unwrap_or_default();

    match run_task(&playbook, &ctx, &cancel, id).await {
      Ok(()) => {}
      Err(ExecuteError::Canceled) => {
        if let Err(e) = playbook.task_canceled(id) {
          warn!(task = %name, error = %e, "failed to mark task canceled");
        }
        shared.canceled.store(true, Ordering::SeqCst);
        shared.shutdown.store(true, Ordering::SeqCst);
        shared.wake.notify_one();
      }
      Err(e) => {
        error!(task = %name, error = %e, "task failed");
        if let Err(status_err) = playbook.task_failed(id, &e.to_string()) {
          warn!(task = %name, error = %status_err, "failed to mark task failed");
        }
        shared.fail(&name, e);
      }
    }
    shared.in_flight.fetch_sub(1, Ordering::SeqCst);

    if shared.shutdown.load(Ordering::SeqCst) {
      shared.wake.notify_one();
      break;
    }
    if idle.send(worker_id).is_err() {
      break;
    }
  }
  debug!(worker = worker_id, "worker exiting");
}

/// Execute every task of the playbook with up to `max_parallel` workers.
///
/// Task failures and cancellation are reported in the summary. Only
/// scheduler faults are returned as `Err`.
pub async fn build(playbook: Arc<Playbook>, ctx: BuildContext, options: &BuildOptions) -> Result<BuildSummary, ExecuteError> {
  let workers = options.max_parallel.max(1).min(playbook.len().max(1));
  let cancel = options.cancel.clone();
  let shared = Arc::new(Shared::default());

  info!(root = %playbook.root(), tasks = playbook.len(), workers, "starting build");

  let (idle_tx, mut idle_rx) = mpsc::unbounded_channel::<usize>();
  let mut senders = Vec::with_capacity(workers);
  let mut set = JoinSet::new();
  for worker_id in 0..workers {
    let (tx, rx) = mpsc::channel::<usize>(1);
    senders.push(tx);
    set.spawn(worker(
      worker_id,
      rx,
      idle_tx.clone(),
      playbook.clone(),
      ctx.clone(),
      cancel.clone(),
      shared.clone(),
    ));
  }

  let mut parked: Vec<usize> = Vec::new();
  let mut seen = playbook.generation();

  loop {
    if shared.shutdown.load(Ordering::SeqCst) {
      debug!("dispatcher shutting down");
      break;
    }

    tokio::select! {
      _ = cancel.cancelled() => {
        warn!(root = %playbook.root(), "build canceled");
        shared.canceled.store(true, Ordering::SeqCst);
        break;
      }
      _ = shared.wake.notified() => {}
      received = idle_rx.recv() => {
        let Some(worker_id) = received else { break };
        match playbook.next() {
          NextTask::Ready(id) => {
            shared.in_flight.fetch_add(1, Ordering::SeqCst);
            if senders[worker_id].send(id).await.is_err() {
              shared.in_flight.fetch_sub(1, Ordering::SeqCst);
              shared.fail(playbook.root(), ExecuteError::Join(format!("worker {} is gone", worker_id)));
            }
          }
          NextTask::Wait => {
            parked.push(worker_id);
            if parked.len() == workers && shared.in_flight.load(Ordering::SeqCst) == 0 {
              shared.fail(playbook.root(), ExecuteError::Stalled);
            }
          }
          NextTask::Done => break,
        }
      }
    }

    let generation = playbook.generation();
    if generation != seen {
      seen = generation;
      for worker_id in parked.drain(..) {
        let _ = idle_tx.send(worker_id);
      }
    }
  }

  // closing the workload channels ends every worker loop
  drop(senders);
  drop(idle_tx);
  while let Some(joined) = set.join_next().await {
    if let Err(e) = joined {
      shared.fail(playbook.root(), ExecuteError::Join(e.to_string()));
    }
  }

  let summary = BuildSummary {
    root: playbook.root().to_string(),
    tasks: playbook.summary(),
    error: shared.take_error(),
    canceled: shared.canceled.load(Ordering::SeqCst) || cancel.is_cancelled(),
    duration: playbook.elapsed(),
  };

  info!(
    root = %summary.root,
    success = summary.is_success(),
    duration_ms = summary.duration.as_millis() as u64,
    "build finished"
  );
  Ok(summary)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::aggregate::from_bobfiles;
  use crate::bobfile::Bobfile;
  use crate::execute::Executor;
  use crate::playbook::TaskState;
  use crate::store::Stores;
  use crate::util::testutil::{FakeRegistry, StaticEnv, temp_stores, write_file};
  use async_trait::async_trait;
  use std::time::Duration;
  use tempfile::TempDir;

  /// Records execution order; fails tasks named in `fail`; `slow` tasks wait
  /// for cancellation.
  #[derive(Default)]
  struct Recorder {
    order: Mutex<Vec<String>>,
    fail: Vec<String>,
    slow: Vec<String>,
    running: AtomicUsize,
    peak: AtomicUsize,
  }

  #[async_trait]
  impl Executor for Recorder {
    async fn execute(&self, request: &ExecRequest, cancel: &Cancel) -> Result<(), ExecuteError> {
      let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
      self.peak.fetch_max(now, Ordering::SeqCst);
      tokio::time::sleep(Duration::from_millis(20)).await;
      self.order.lock().unwrap().push(request.name.clone());

      let result = if self.slow.contains(&request.name) {
        cancel.cancelled().await;
        Err(ExecuteError::Canceled)
      } else if self.fail.contains(&request.name) {
        Err(ExecuteError::CmdFailed {
          task: request.name.clone(),
          code: Some(1),
        })
      } else {
        for target in request.env.iter().filter_map(|e| e.strip_prefix("WRITE=")) {
          write_file(&request.dir, target, &request.name);
        }
        Ok(())
      };
      self.running.fetch_sub(1, Ordering::SeqCst);
      result
    }
  }

  struct Fixture {
    _temp: TempDir,
    work: std::path::PathBuf,
    stores: Stores,
  }

  fn fixture() -> Fixture {
    let temp = TempDir::new().unwrap();
    let work = temp.path().join("work");
    write_file(&work, "src.txt", "source");
    let stores = temp_stores(&temp.path().join("cache"), Arc::new(FakeRegistry::default()));
    Fixture {
      _temp: temp,
      work,
      stores,
    }
  }

  const DIAMOND: &str = r#"
build:
  a:
    input: src.txt
    cmd: build a
  b:
    dependsOn: [a]
    cmd: build b
  c:
    dependsOn: [a]
    cmd: build c
  all:
    dependsOn: [b, c]
    cmd: build all
"#;

  async fn run(f: &Fixture, manifest: &str, root: &str, recorder: Arc<Recorder>, options: &BuildOptions) -> BuildSummary {
    let bobfile = Bobfile::parse(manifest, &f.work).unwrap();
    let aggregate = from_bobfiles(&f.work, vec![bobfile]).unwrap();
    let playbook = Playbook::new(&aggregate, root, f.stores.clone(), &options.playbook_options()).unwrap();
    let ctx = BuildContext::new(recorder, Arc::new(StaticEnv::default()));
    build(Arc::new(playbook), ctx, options).await.unwrap()
  }

  fn position(order: &[String], name: &str) -> usize {
    order.iter().position(|n| n == name).unwrap()
  }

  #[tokio::test]
  async fn dependencies_run_first() {
    let f = fixture();
    let recorder = Arc::new(Recorder::default());
    let summary = run(&f, DIAMOND, "all", recorder.clone(), &BuildOptions::default()).await;

    assert!(summary.is_success(), "{:?}", summary.error);
    assert_eq!(summary.count(TaskState::Completed), 4);
    let order = recorder.order.lock().unwrap().clone();
    assert!(position(&order, "a") < position(&order, "b"));
    assert!(position(&order, "a") < position(&order, "c"));
    assert!(position(&order, "b") < position(&order, "all"));
    assert!(position(&order, "c") < position(&order, "all"));
  }

  #[tokio::test]
  async fn max_parallel_bounds_concurrency() {
    let f = fixture();
    let manifest = "build:\n  a:\n    cmd: x\n  b:\n    cmd: x\n  c:\n    cmd: x\n  all:\n    dependsOn: [a, b, c]\n";
    let recorder = Arc::new(Recorder::default());
    let options = BuildOptions {
      max_parallel: 1,
      ..BuildOptions::default()
    };
    let summary = run(&f, manifest, "all", recorder.clone(), &options).await;
    assert!(summary.is_success());
    assert_eq!(recorder.peak.load(Ordering::SeqCst), 1);
  }

  #[tokio::test]
  async fn second_run_is_cached() {
    let f = fixture();
    let first = run(&f, DIAMOND, "all", Arc::new(Recorder::default()), &BuildOptions::default()).await;
    assert_eq!(first.count(TaskState::Completed), 4);

    let recorder = Arc::new(Recorder::default());
    let second = run(&f, DIAMOND, "all", recorder.clone(), &BuildOptions::default()).await;
    assert!(second.is_success());
    assert_eq!(second.count(TaskState::NoRebuildRequired), 4);
    assert!(recorder.order.lock().unwrap().is_empty());
  }

  #[tokio::test]
  async fn changed_leaf_rebuilds_dependents() {
    let f = fixture();
    run(&f, DIAMOND, "all", Arc::new(Recorder::default()), &BuildOptions::default()).await;
    write_file(&f.work, "src.txt", "changed");

    let summary = run(&f, DIAMOND, "all", Arc::new(Recorder::default()), &BuildOptions::default()).await;
    assert_eq!(summary.count(TaskState::Completed), 4);
    assert_eq!(summary.task("a").unwrap().cause, Some(RebuildCause::InputNotFoundInBuildInfo));
    assert_eq!(summary.task("all").unwrap().cause, Some(RebuildCause::DependencyChanged));
  }

  #[tokio::test]
  async fn first_failure_is_reported_and_dependents_stay_pending() {
    let f = fixture();
    let recorder = Arc::new(Recorder {
      fail: vec!["b".into()],
      ..Recorder::default()
    });
    let summary = run(&f, DIAMOND, "all", recorder, &BuildOptions::default()).await;

    assert!(!summary.is_success());
    let (task, err) = summary.error.as_ref().unwrap();
    assert_eq!(task, "b");
    assert!(matches!(err, ExecuteError::CmdFailed { .. }));
    assert_eq!(summary.task("b").unwrap().state, TaskState::Failed);
    assert_eq!(summary.task("all").unwrap().state, TaskState::Pending);
  }

  #[tokio::test]
  async fn cancellation_marks_running_task_canceled() {
    let f = fixture();
    let recorder = Arc::new(Recorder {
      slow: vec!["a".into()],
      ..Recorder::default()
    });
    let options = BuildOptions::default();
    let trigger = options.cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(100)).await;
      trigger.cancel();
    });

    let summary = tokio::time::timeout(
      Duration::from_secs(10),
      run(&f, DIAMOND, "all", recorder, &options),
    )
    .await
    .unwrap();
    assert!(summary.canceled);
    assert!(summary.error.is_none());
    assert_eq!(summary.task("a").unwrap().state, TaskState::Canceled);
  }

  #[tokio::test]
  async fn targets_are_packed_and_restored() {
    let f = fixture();
    let manifest = "build:\n  build:\n    input: src.txt\n    cmd: build\n    target: out.txt\n";
    let options = BuildOptions {
      env: vec!["WRITE=out.txt".into()],
      ..BuildOptions::default()
    };
    let first = run(&f, manifest, "build", Arc::new(Recorder::default()), &options).await;
    assert_eq!(first.task("build").unwrap().state, TaskState::Completed);

    std::fs::remove_file(f.work.join("out.txt")).unwrap();
    let recorder = Arc::new(Recorder::default());
    let second = run(&f, manifest, "build", recorder.clone(), &options).await;
    assert_eq!(second.task("build").unwrap().state, TaskState::NoRebuildRequired);
    assert!(recorder.order.lock().unwrap().is_empty());
    assert_eq!(std::fs::read_to_string(f.work.join("out.txt")).unwrap(), "build");
  }

  const PACKED: &str = "build:\n  build:\n    input: src.txt\n    cmd: build\n    target: out.txt\n";

  fn write_out() -> BuildOptions {
    BuildOptions {
      env: vec!["WRITE=out.txt".into()],
      ..BuildOptions::default()
    }
  }

  #[tokio::test]
  async fn cleaned_stores_are_a_plain_cache_miss() {
    let f = fixture();
    let options = write_out();
    run(&f, PACKED, "build", Arc::new(Recorder::default()), &options).await;
    crate::store::clean(&f.stores, None).unwrap();

    std::fs::remove_file(f.work.join("out.txt")).unwrap();
    let summary = run(&f, PACKED, "build", Arc::new(Recorder::default()), &options).await;
    assert_eq!(summary.task("build").unwrap().state, TaskState::Completed);
    assert_eq!(
      summary.task("build").unwrap().cause,
      Some(RebuildCause::InputNotFoundInBuildInfo)
    );
  }

  #[tokio::test]
  async fn missing_artifact_with_valid_target_rebuilds_and_repacks() {
    let f = fixture();
    let options = write_out();
    let first = run(&f, PACKED, "build", Arc::new(Recorder::default()), &options).await;
    assert!(first.is_success());
    let hash = f.stores.artifacts.list().unwrap();
    assert_eq!(hash.len(), 1);

    f.stores.artifacts.clean(None).unwrap();
    assert!(f.stores.buildinfos.exists(&hash[0]));
    assert!(f.work.join("out.txt").exists());

    let recorder = Arc::new(Recorder::default());
    let summary = run(&f, PACKED, "build", recorder.clone(), &options).await;
    let task = summary.task("build").unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.cause, Some(RebuildCause::TargetNotInLocalStore));
    assert_eq!(*recorder.order.lock().unwrap(), vec!["build".to_string()]);
    assert!(f.stores.artifacts.exists(&hash[0]));
  }

  #[tokio::test]
  async fn invalid_target_without_artifact_is_relabelled() {
    let f = fixture();
    let options = write_out();
    run(&f, PACKED, "build", Arc::new(Recorder::default()), &options).await;
    f.stores.artifacts.clean(None).unwrap();
    std::fs::remove_file(f.work.join("out.txt")).unwrap();

    let summary = run(&f, PACKED, "build", Arc::new(Recorder::default()), &options).await;
    let task = summary.task("build").unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.cause, Some(RebuildCause::TargetNotInLocalStore));
    assert!(f.work.join("out.txt").exists());
  }

  #[tokio::test]
  async fn always_task_rebuilds_on_warm_cache() {
    let f = fixture();
    let manifest = "build:\n  build:\n    input: src.txt\n    cmd: build\n    rebuild: always\n";
    run(&f, manifest, "build", Arc::new(Recorder::default()), &BuildOptions::default()).await;

    let recorder = Arc::new(Recorder::default());
    let summary = run(&f, manifest, "build", recorder.clone(), &BuildOptions::default()).await;
    let task = summary.task("build").unwrap();
    assert_eq!(task.state, TaskState::Completed);
    assert_eq!(task.cause, Some(RebuildCause::TaskForcedRebuild));
    assert_eq!(*recorder.order.lock().unwrap(), vec!["build".to_string()]);
  }
}
