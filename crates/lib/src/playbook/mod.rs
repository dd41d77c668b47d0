//! Playbooks: per-invocation scheduling state for a task and its dependencies.
//!
//! A playbook covers exactly the `dependsOn` closure of its root task. Every
//! task gets a `Status` indexed by a dense id; dependency names are resolved
//! to ids once so `next()` is a plain slice scan. Status fields sit behind
//! their own mutexes, and no lock is held across blocking I/O.

mod types;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use thiserror::Error;
use tracing::{debug, info, warn};

use crate::aggregate::{Aggregate, AggregateError};
use crate::artifact;
use crate::buildinfo::BuildInfo;
use crate::store::{StoreError, Stores};
use crate::target::{Target, TargetError};
use crate::task::{InputHash, RebuildPolicy, Task, TaskError};

pub use types::{NextTask, RebuildCause, RebuildCheck, TaskState, TaskSummary};

#[derive(Debug, Error)]
pub enum PlaybookError {
  #[error(transparent)]
  Aggregate(#[from] AggregateError),

  #[error(transparent)]
  Task(#[from] TaskError),

  #[error(transparent)]
  Store(#[from] StoreError),

  #[error(transparent)]
  Target(#[from] TargetError),

  #[error("no task with id {0} in playbook")]
  InvalidId(usize),
}

impl PlaybookError {
  pub fn is_user_error(&self) -> bool {
    match self {
      PlaybookError::Aggregate(e) => e.is_user_error(),
      PlaybookError::Task(e) => e.is_user_error(),
      _ => false,
    }
  }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
  m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Playbook construction flags.
#[derive(Debug, Clone, Default)]
pub struct PlaybookOptions {
  /// Skip artifact restore and creation.
  pub no_cache: bool,
  /// `KEY=VALUE` entries appended to every task's environment.
  pub env: Vec<String>,
}

/// Per-run state of one task.
#[derive(Debug)]
pub struct Status {
  pub id: usize,
  pub task: Arc<Task>,
  /// Ids of direct dependencies.
  pub deps: Vec<usize>,
  state: Mutex<TaskState>,
  start: Mutex<Option<Instant>>,
  end: Mutex<Option<Instant>>,
  error: Mutex<Option<String>>,
  cause: Mutex<Option<RebuildCause>>,
  input_hash: Mutex<Option<InputHash>>,
}

impl Status {
  fn new(id: usize, task: Arc<Task>, deps: Vec<usize>) -> Self {
    Self {
      id,
      task,
      deps,
      state: Mutex::new(TaskState::Pending),
      start: Mutex::new(None),
      end: Mutex::new(None),
      error: Mutex::new(None),
      cause: Mutex::new(None),
      input_hash: Mutex::new(None),
    }
  }

  pub fn name(&self) -> &str {
    &self.task.name
  }

  pub fn state(&self) -> TaskState {
    *lock(&self.state)
  }

  pub fn error(&self) -> Option<String> {
    lock(&self.error).clone()
  }

  pub fn cause(&self) -> Option<RebuildCause> {
    *lock(&self.cause)
  }

  pub fn input_hash(&self) -> Option<InputHash> {
    lock(&self.input_hash).clone()
  }

  /// Wall-clock time from start to end, zero if the task never started.
  pub fn duration(&self) -> Duration {
    let start = *lock(&self.start);
    let end = *lock(&self.end);
    match (start, end) {
      (Some(s), Some(e)) => e.saturating_duration_since(s),
      (Some(s), None) => s.elapsed(),
      _ => Duration::ZERO,
    }
  }
}

#[derive(Debug)]
pub struct Playbook {
  root: String,
  statuses: Vec<Status>,
  index: HashMap<String, usize>,
  stores: Stores,
  caching: bool,
  done: AtomicBool,
  generation: AtomicU64,
  started: Instant,
}

impl Playbook {
  /// Build the playbook of `root` from the aggregate. Tasks are cloned so
  /// playbook options never leak back into the aggregate.
  pub fn new(aggregate: &Aggregate, root: &str, stores: Stores, options: &PlaybookOptions) -> Result<Self, PlaybookError> {
    let order = aggregate.closure(root)?;
    let index: HashMap<String, usize> = order.iter().enumerate().map(|(i, n)| (n.clone(), i)).collect();

    let mut statuses = Vec::with_capacity(order.len());
    for (id, name) in order.iter().enumerate() {
      let mut task = aggregate.task(name)?.clone();
      task.environment.extend(options.env.iter().cloned());
      let deps = task
        .depends_on
        .iter()
        .map(|d| index.get(d).copied().ok_or_else(|| AggregateError::TaskNotFound(d.clone())))
        .collect::<Result<Vec<_>, _>>()?;
      statuses.push(Status::new(id, Arc::new(task), deps));
    }

    let root = order.last().cloned().unwrap_or_else(|| root.to_string());
    debug!(root = %root, tasks = statuses.len(), caching = !options.no_cache, "created playbook");

    Ok(Self {
      root,
      statuses,
      index,
      stores,
      caching: !options.no_cache,
      done: AtomicBool::new(false),
      generation: AtomicU64::new(0),
      started: Instant::now(),
    })
  }

  pub fn root(&self) -> &str {
    &self.root
  }

  pub fn len(&self) -> usize {
    self.statuses.len()
  }

  pub fn is_empty(&self) -> bool {
    self.statuses.is_empty()
  }

  pub fn caching(&self) -> bool {
    self.caching
  }

  pub fn stores(&self) -> &Stores {
    &self.stores
  }

  pub fn statuses(&self) -> &[Status] {
    &self.statuses
  }

  pub fn status(&self, id: usize) -> Result<&Status, PlaybookError> {
    self.statuses.get(id).ok_or(PlaybookError::InvalidId(id))
  }

  pub fn id_of(&self, name: &str) -> Option<usize> {
    self.index.get(name).copied()
  }

  pub fn is_done(&self) -> bool {
    self.done.load(Ordering::SeqCst)
  }

  /// Bumped on every state transition, so the scheduler can tell whether a
  /// new `next()` might find something.
  pub fn generation(&self) -> u64 {
    self.generation.load(Ordering::SeqCst)
  }

  pub fn elapsed(&self) -> Duration {
    self.started.elapsed()
  }

  fn transition(&self, status: &Status, state: TaskState) {
    *lock(&status.state) = state;
    match state {
      TaskState::Running => *lock(&status.start) = Some(Instant::now()),
      s if s.is_terminal() => {
        let mut end = lock(&status.end);
        if end.is_none() {
          *end = Some(Instant::now());
        }
      }
      _ => {}
    }
    self.generation.fetch_add(1, Ordering::SeqCst);
    debug!(task = %status.task.name, state = %state, "task state changed");
  }

  /// The first pending task whose dependencies all succeeded, now `Queued`.
  pub fn next(&self) -> NextTask {
    if self.is_done() {
      return NextTask::Done;
    }

    let mut all_terminal = true;
    for status in &self.statuses {
      let state = status.state();
      if matches!(state, TaskState::Failed | TaskState::Canceled) {
        self.done.store(true, Ordering::SeqCst);
        return NextTask::Done;
      }
      if !state.is_terminal() {
        all_terminal = false;
      }
    }
    if all_terminal {
      self.done.store(true, Ordering::SeqCst);
      return NextTask::Done;
    }

    for status in &self.statuses {
      if status.state() != TaskState::Pending {
        continue;
      }
      if status.deps.iter().all(|&d| self.statuses[d].state().is_success()) {
        self.transition(status, TaskState::Queued);
        return NextTask::Ready(status.id);
      }
    }
    NextTask::Wait
  }

  /// Memoized input hash. Computed outside any lock; the first stored value wins.
  pub fn input_hash(&self, id: usize) -> Result<InputHash, PlaybookError> {
    let status = self.status(id)?;
    if let Some(hash) = status.input_hash() {
      return Ok(hash);
    }
    let computed = status.task.compute_input_hash()?;
    let mut slot = lock(&status.input_hash);
    Ok(slot.get_or_insert(computed).clone())
  }

  fn target(&self, task: &Task) -> Option<Target> {
    task.target(self.stores.images.clone())
  }

  /// Decide whether the task has to run.
  ///
  /// The recorded build stays valid when a `BuildInfo` exists for the input
  /// hash, no dependency was rebuilt in this run, and the target passes the
  /// shallow check.
  pub fn needs_rebuild(&self, id: usize, hash: &InputHash) -> Result<RebuildCheck, PlaybookError> {
    let status = self.status(id)?;
    let task = &status.task;
    let rebuild = |cause| RebuildCheck {
      cause: Some(cause),
      invalid: Default::default(),
    };

    if task.rebuild == RebuildPolicy::Always {
      return Ok(rebuild(RebuildCause::TaskForcedRebuild));
    }

    if status.deps.iter().any(|&d| self.statuses[d].state() == TaskState::Completed) {
      return Ok(rebuild(RebuildCause::DependencyChanged));
    }

    let info = match self.stores.buildinfos.get(&hash.hash) {
      Ok(info) => info,
      Err(e) if e.is_not_found() => return Ok(rebuild(RebuildCause::InputNotFoundInBuildInfo)),
      Err(StoreError::UnsupportedVersion(version)) => {
        warn!(task = %task.name, version, "ignoring build info with unsupported version");
        return Ok(rebuild(RebuildCause::InputNotFoundInBuildInfo));
      }
      Err(e) => return Err(e.into()),
    };

    if let Some(target) = self.target(task) {
      let verification = target.verify_shallow(&info)?;
      if !verification.is_valid() {
        return Ok(RebuildCheck {
          cause: Some(RebuildCause::TargetInvalid),
          invalid: verification.invalid,
        });
      }
    }

    if self.caching && task.has_target() && !self.stores.artifacts.exists(&hash.hash) {
      return Ok(rebuild(RebuildCause::TargetNotInLocalStore));
    }

    Ok(RebuildCheck::default())
  }

  /// Try to satisfy a cache miss from the artifact store. Returns `false`
  /// when caching is off, the task has no target, or no artifact exists.
  pub fn restore(&self, id: usize, hash: &InputHash, check: &RebuildCheck) -> Result<bool, PlaybookError> {
    let status = self.status(id)?;
    if !self.caching || !check.restorable() {
      return Ok(false);
    }
    let Some(mut target) = self.target(&status.task) else {
      return Ok(false);
    };
    if !self.stores.artifacts.exists(&hash.hash) {
      return Ok(false);
    }

    let invalid = match check.cause {
      Some(RebuildCause::TargetInvalid) => check.invalid.clone(),
      _ => Default::default(),
    };
    if !artifact::extract(self.stores.artifacts.as_ref(), &status.task, &mut target, &hash.hash, &invalid)? {
      return Ok(false);
    }

    // a fresh scan, so the record matches what was unpacked
    let mut target = self.target(&status.task);
    self.record_build_info(&status.task, target.as_mut(), hash)?;
    info!(task = %status.task.name, hash = %hash, "restored target from artifact");
    Ok(true)
  }

  /// Compute and persist the `BuildInfo` of a task's current target state.
  pub fn record_build_info(&self, task: &Task, target: Option<&mut Target>, hash: &InputHash) -> Result<BuildInfo, PlaybookError> {
    let target_info = match target {
      Some(t) => t.build_info()?,
      None => Default::default(),
    };
    let info = BuildInfo::new(&task.name, &task.project, &hash.hash, target_info);
    self.stores.buildinfos.put(&hash.hash, &info)?;
    Ok(info)
  }

  /// Remove stale outputs before the task's commands run.
  pub fn clean_before_build(&self, id: usize, check: &RebuildCheck) -> Result<(), PlaybookError> {
    let status = self.status(id)?;
    let Some(mut target) = self.target(&status.task) else {
      return Ok(());
    };
    let mut invalid = check.invalid.clone();
    if !self.caching {
      for (path, reasons) in target.forced_by_no_cache()? {
        for reason in reasons {
          crate::target::add_reason(&mut invalid, &path, reason);
        }
      }
    }
    target.clean(&invalid)?;
    Ok(())
  }

  /// Remove the declared filesystem targets of every task in the playbook.
  pub fn clean_targets(&self) -> Result<usize, PlaybookError> {
    let mut cleaned = 0;
    for status in &self.statuses {
      if let Some(mut target) = self.target(&status.task)
        && !target.spec().is_docker()
      {
        target.clean(&Default::default())?;
        cleaned += 1;
      }
    }
    Ok(cleaned)
  }

  pub fn set_cause(&self, id: usize, cause: Option<RebuildCause>) -> Result<(), PlaybookError> {
    *lock(&self.status(id)?.cause) = cause;
    Ok(())
  }

  pub fn task_started(&self, id: usize) -> Result<(), PlaybookError> {
    let status = self.status(id)?;
    self.transition(status, TaskState::Running);
    Ok(())
  }

  pub fn task_no_rebuild_required(&self, id: usize) -> Result<(), PlaybookError> {
    let status = self.status(id)?;
    self.transition(status, TaskState::NoRebuildRequired);
    Ok(())
  }

  /// Verify exports, record the build and pack the target, then mark the task done.
  pub fn task_completed(&self, id: usize, hash: &InputHash) -> Result<(), PlaybookError> {
    let status = self.status(id)?;
    let task = &status.task;

    task.verify_exports()?;

    let mut target = self.target(task);
    self.record_build_info(task, target.as_mut(), hash)?;

    if self.caching
      && let Some(target) = target.as_mut()
    {
      artifact::create(self.stores.artifacts.as_ref(), task, target, &hash.hash)?;
    }

    self.transition(status, TaskState::Completed);
    Ok(())
  }

  pub fn task_failed(&self, id: usize, error: &str) -> Result<(), PlaybookError> {
    let status = self.status(id)?;
    *lock(&status.error) = Some(error.to_string());
    warn!(task = %status.task.name, error = %error, "task failed");
    self.transition(status, TaskState::Failed);
    Ok(())
  }

  pub fn task_canceled(&self, id: usize) -> Result<(), PlaybookError> {
    let status = self.status(id)?;
    self.transition(status, TaskState::Canceled);
    Ok(())
  }

  pub fn summary(&self) -> Vec<TaskSummary> {
    self
      .statuses
      .iter()
      .map(|s| TaskSummary {
        name: s.task.name.clone(),
        state: s.state(),
        cause: s.cause(),
        duration: s.duration(),
        skipped_inputs: s.input_hash().map(|h| h.skipped).unwrap_or_default(),
        error: s.error(),
      })
      .collect()
  }
}
