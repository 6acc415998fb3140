//! # Scheduler
//!
//! ## Responsibility
//! Run named periodic background tasks next to the foreground command loop.
//!
//! ## Guarantees
//! - Per task: `Idle -> Due -> Running -> Idle`. A task is due when it never
//!   ran or when `now - last_run >= interval`
//! - `last_run` becomes the invocation time, success or failure, so a
//!   failing task cannot spin
//! - A failing or timed-out task is logged and never stops other tasks or
//!   later ticks
//! - A task that outlives its timeout is left to finish on its own (it is
//!   never aborted mid-mutation) and is not started again until it has
//! - Shutdown is cooperative: the loop exits between ticks and waits for
//!   any task still in flight
//!
//! ## NOT Responsible For
//! - Serializing live writes (see: `lock`); tasks take the mutation lock
//!   themselves through the pipeline

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::RewriteConfig;
use crate::metrics;
use crate::pipeline::{AutoApprove, LockPolicy, PipelineOutcome, RewritePipeline};

// ─── Errors ──────────────────────────────────────────────────────────────

/// Registry construction errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SchedulerError {
    /// Two tasks share a name.
    #[error("task '{0}' is already registered")]
    DuplicateTask(String),

    /// An interval of zero would run the task on every tick.
    #[error("task '{0}' has a zero interval")]
    ZeroInterval(String),
}

/// Why one task run failed.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TaskError {
    /// The task reported a failure.
    #[error("{0}")]
    Failed(String),

    /// The task did not finish in time and was left running.
    #[error("timed out after {0:?}; left running")]
    TimedOut(Duration),

    /// The task panicked.
    #[error("task panicked: {0}")]
    Panicked(String),
}

/// One periodic unit of background work.
#[async_trait]
pub trait TaskAction: Send + Sync {
    /// Unique task name.
    fn name(&self) -> &str;

    /// Run once. `Ok` carries a one-line summary.
    async fn run(&self) -> Result<String, TaskError>;
}

// ─── Status ──────────────────────────────────────────────────────────────

/// Where a task is in its cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskPhase {
    /// Waiting for its interval.
    Idle,
    /// Currently executing.
    Running,
}

/// Observable state of one task.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskStatus {
    /// Task name.
    pub name: String,
    /// Configured interval.
    pub interval: Duration,
    /// Current phase.
    pub phase: TaskPhase,
    /// Wall-clock time of the last invocation.
    pub last_run: Option<DateTime<Utc>>,
    /// Completed invocations.
    pub runs: u64,
    /// Invocations that failed or timed out.
    pub failures: u64,
    /// Message of the most recent failure.
    pub last_error: Option<String>,
    /// Summary of the most recent success.
    pub last_summary: Option<String>,
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let last = self
            .last_run
            .map_or_else(|| "never".to_string(), |t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string());
        write!(
            f,
            "{:<14} every {:>6}s  {:?}  runs={} failures={} last={}",
            self.name,
            self.interval.as_secs(),
            self.phase,
            self.runs,
            self.failures,
            last
        )?;
        if let Some(err) = &self.last_error {
            write!(f, "  last_error={err}")?;
        }
        Ok(())
    }
}

/// Shared, read-anytime view of every task's status.
#[derive(Debug, Clone, Default)]
pub struct SchedulerStatus {
    inner: Arc<Mutex<Vec<TaskStatus>>>,
}

impl SchedulerStatus {
    /// Copy of every task's status, in registration order.
    pub fn snapshot(&self) -> Vec<TaskStatus> {
        self.inner.lock().clone()
    }

    fn update(&self, index: usize, f: impl FnOnce(&mut TaskStatus)) {
        if let Some(status) = self.inner.lock().get_mut(index) {
            f(status);
        }
    }
}

// ─── Scheduler ───────────────────────────────────────────────────────────

struct Entry {
    action: Arc<dyn TaskAction>,
    interval: Duration,
    last_run: Option<Instant>,
    in_flight: Option<JoinHandle<Result<String, TaskError>>>,
}

/// Explicit registry of periodic tasks plus the tick loop.
pub struct Scheduler {
    tasks: Vec<Entry>,
    poll_interval: Duration,
    task_timeout: Duration,
    status: SchedulerStatus,
}

impl fmt::Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("tasks", &self.tasks.iter().map(|t| t.action.name()).collect::<Vec<_>>())
            .field("poll_interval", &self.poll_interval)
            .field("task_timeout", &self.task_timeout)
            .finish()
    }
}

impl Scheduler {
    /// Empty registry.
    pub fn new(poll_interval: Duration, task_timeout: Duration) -> Self {
        Self {
            tasks: Vec::new(),
            poll_interval,
            task_timeout,
            status: SchedulerStatus::default(),
        }
    }

    /// Register `action` to run every `interval`, first on the next tick.
    ///
    /// # Errors
    ///
    /// [`SchedulerError::DuplicateTask`] or [`SchedulerError::ZeroInterval`].
    pub fn register(&mut self, action: Arc<dyn TaskAction>, interval: Duration) -> Result<(), SchedulerError> {
        self.register_with_last_run(action, interval, None)
    }

    /// Register `action` as if it last ran at `last_run`.
    ///
    /// # Errors
    ///
    /// As for [`Scheduler::register`].
    pub fn register_with_last_run(
        &mut self,
        action: Arc<dyn TaskAction>,
        interval: Duration,
        last_run: Option<Instant>,
    ) -> Result<(), SchedulerError> {
        let name = action.name().to_string();
        if interval.is_zero() {
            return Err(SchedulerError::ZeroInterval(name));
        }
        if self.tasks.iter().any(|t| t.action.name() == name) {
            return Err(SchedulerError::DuplicateTask(name));
        }
        self.status.inner.lock().push(TaskStatus {
            name: name.clone(),
            interval,
            phase: TaskPhase::Idle,
            last_run: None,
            runs: 0,
            failures: 0,
            last_error: None,
            last_summary: None,
        });
        self.tasks.push(Entry {
            action,
            interval,
            last_run,
            in_flight: None,
        });
        tracing::debug!(task = %name, interval_secs = interval.as_secs(), "scheduler: task registered");
        Ok(())
    }

    /// Registered task names, in order.
    pub fn task_names(&self) -> Vec<String> {
        self.tasks.iter().map(|t| t.action.name().to_string()).collect()
    }

    /// Handle for reading task status while the loop runs.
    pub fn status(&self) -> SchedulerStatus {
        self.status.clone()
    }

    /// Last invocation time of `name`, on the scheduler clock.
    pub fn last_run(&self, name: &str) -> Option<Instant> {
        self.tasks
            .iter()
            .find(|t| t.action.name() == name)
            .and_then(|t| t.last_run)
    }

    /// Run every task due at `now`; returns how many were started.
    ///
    /// The first task started records `now` as its invocation time; a task
    /// started after others in the same tick records `now` plus the time
    /// those took.
    pub async fn tick(&mut self, now: Instant) -> usize {
        self.tick_until(now, None).await
    }

    async fn tick_until(&mut self, now: Instant, shutdown: Option<&watch::Receiver<bool>>) -> usize {
        let began = Instant::now();
        let mut started = 0;
        for index in 0..self.tasks.len() {
            self.reap(index).await;

            if shutdown.is_some_and(|rx| *rx.borrow()) {
                tracing::info!(started, "scheduler: shutdown requested, tick cut short");
                break;
            }

            let entry = &self.tasks[index];
            if entry.in_flight.is_some() {
                continue;
            }
            let due = entry
                .last_run
                .map_or(true, |last| now.saturating_duration_since(last) >= entry.interval);
            if !due {
                continue;
            }

            let invoked_at = if started == 0 { now } else { now + began.elapsed() };
            started += 1;
            self.run_task(index, invoked_at).await;
        }
        started
    }

    async fn run_task(&mut self, index: usize, now: Instant) {
        let timeout = self.task_timeout;
        let entry = &mut self.tasks[index];
        let name = entry.action.name().to_string();
        entry.last_run = Some(now);
        self.status.update(index, |s| {
            s.phase = TaskPhase::Running;
            s.last_run = Some(Utc::now());
        });
        tracing::info!(task = %name, "scheduler: task started");

        let action = Arc::clone(&entry.action);
        let mut handle = tokio::spawn(async move { action.run().await });
        let result = match tokio::time::timeout(timeout, &mut handle).await {
            Ok(joined) => joined.unwrap_or_else(|e| Err(TaskError::Panicked(e.to_string()))),
            Err(_) => {
                entry.in_flight = Some(handle);
                Err(TaskError::TimedOut(timeout))
            }
        };
        let still_running = entry.in_flight.is_some();
        self.record(index, &name, result, still_running);
    }

    /// Collect a task that outlived its timeout, if it has finished since.
    async fn reap(&mut self, index: usize) {
        let entry = &mut self.tasks[index];
        let finished = entry.in_flight.as_ref().is_some_and(JoinHandle::is_finished);
        if !finished {
            return;
        }
        let Some(handle) = entry.in_flight.take() else {
            return;
        };
        let name = entry.action.name().to_string();
        match handle.await {
            Ok(Ok(summary)) => tracing::info!(task = %name, summary = %summary, "scheduler: late task finished"),
            Ok(Err(e)) => tracing::warn!(task = %name, error = %e, "scheduler: late task failed"),
            Err(e) => tracing::warn!(task = %name, error = %e, "scheduler: late task panicked"),
        }
        self.status.update(index, |s| s.phase = TaskPhase::Idle);
    }

    fn record(&self, index: usize, name: &str, result: Result<String, TaskError>, still_running: bool) {
        metrics::record_task_run(name, result.is_ok());
        match &result {
            Ok(summary) => tracing::info!(task = %name, summary = %summary, "scheduler: task finished"),
            Err(e) => tracing::warn!(task = %name, error = %e, "scheduler: task failed"),
        }
        self.status.update(index, |s| {
            s.runs += 1;
            s.phase = if still_running { TaskPhase::Running } else { TaskPhase::Idle };
            match result {
                Ok(summary) => s.last_summary = Some(summary),
                Err(e) => {
                    s.failures += 1;
                    s.last_error = Some(e.to_string());
                }
            }
        });
    }

    /// Tick every poll interval until `shutdown` becomes `true` or its
    /// sender is dropped.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) {
        tracing::info!(
            tasks = ?self.task_names(),
            poll_secs = self.poll_interval.as_secs_f64(),
            "scheduler: loop started"
        );
        let mut ticker = tokio::time::interval(self.poll_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        loop {
            if *shutdown.borrow() {
                break;
            }
            tokio::select! {
                _ = ticker.tick() => {
                    self.tick_until(Instant::now(), Some(&shutdown)).await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        for entry in &mut self.tasks {
            if let Some(handle) = entry.in_flight.take() {
                let name = entry.action.name();
                tracing::info!(task = %name, "scheduler: waiting for in-flight task");
                match handle.await {
                    Ok(Ok(summary)) => tracing::info!(task = %name, summary = %summary, "scheduler: late task finished"),
                    Ok(Err(e)) => tracing::warn!(task = %name, error = %e, "scheduler: late task failed"),
                    Err(e) => tracing::warn!(task = %name, error = %e, "scheduler: late task panicked"),
                }
            }
        }
        tracing::info!("scheduler: loop stopped");
    }
}

// ─── Built-in tasks ──────────────────────────────────────────────────────

/// Periodic compile-check of the whole live tree.
pub struct SelfCheckTask {
    pipeline: RewritePipeline,
    policy: LockPolicy,
}

impl SelfCheckTask {
    /// Name used in the registry.
    pub const NAME: &'static str = "self_check";

    /// Check through `pipeline`, waiting at most `lock_timeout` for the lock.
    pub fn new(pipeline: RewritePipeline, lock_timeout: Duration) -> Self {
        Self {
            pipeline,
            policy: LockPolicy::new(Self::NAME, lock_timeout),
        }
    }
}

#[async_trait]
impl TaskAction for SelfCheckTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<String, TaskError> {
        let outcome = self
            .pipeline
            .self_check_as(&self.policy)
            .await
            .map_err(|e| TaskError::Failed(e.to_string()))?;
        Ok(outcome.to_string())
    }
}

/// Picks up a queued diff file, validates it and optionally applies it.
///
/// Whatever the verdict, the file is renamed aside with a tag and timestamp
/// (`patch.diff.applied-20261016-120000`) so it is not retried. It stays in
/// place only when the attempt could not be made (lock busy, sandbox down).
pub struct PatchQueueTask {
    pipeline: RewritePipeline,
    policy: LockPolicy,
    patch_file: PathBuf,
    auto_apply: bool,
}

impl PatchQueueTask {
    /// Name used in the registry.
    pub const NAME: &'static str = "patch_queue";

    /// Watch `patch_file`; apply only when `auto_apply`.
    pub fn new(pipeline: RewritePipeline, patch_file: PathBuf, auto_apply: bool, lock_timeout: Duration) -> Self {
        Self {
            pipeline,
            policy: LockPolicy::new(Self::NAME, lock_timeout),
            patch_file,
            auto_apply,
        }
    }

    async fn set_aside(&self, tag: &str) -> Result<PathBuf, TaskError> {
        let aside = aside_path(&self.patch_file, tag, Utc::now());
        tokio::fs::rename(&self.patch_file, &aside)
            .await
            .map_err(|e| TaskError::Failed(format!("cannot move {} aside: {e}", self.patch_file.display())))?;
        Ok(aside)
    }
}

/// `<file>.<tag>-<UTC stamp>` next to `file`.
pub fn aside_path(file: &Path, tag: &str, now: DateTime<Utc>) -> PathBuf {
    let name = file
        .file_name()
        .map_or_else(|| "patch".to_string(), |n| n.to_string_lossy().into_owned());
    file.with_file_name(format!("{name}.{tag}-{}", now.format(crate::swap::STAMP_FORMAT)))
}

#[async_trait]
impl TaskAction for PatchQueueTask {
    fn name(&self) -> &str {
        Self::NAME
    }

    async fn run(&self) -> Result<String, TaskError> {
        let diff = match tokio::fs::read_to_string(&self.patch_file).await {
            Ok(diff) => diff,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok("no queued patch".to_string()),
            Err(e) => return Err(TaskError::Failed(format!("{}: {e}", self.patch_file.display()))),
        };

        if !self.auto_apply {
            let outcome = self
                .pipeline
                .validate_patch(&diff)
                .await
                .map_err(|e| TaskError::Failed(e.to_string()))?;
            let tag = if outcome.is_valid() { "validated" } else { "rejected" };
            let aside = self.set_aside(tag).await?;
            return Ok(format!("{outcome}; moved to {}", aside.display()));
        }

        let outcome = self.pipeline.apply_patch_as(&self.policy, &diff, &AutoApprove).await;
        let tag = match &outcome {
            PipelineOutcome::Applied { .. } | PipelineOutcome::Unchanged => "applied",
            PipelineOutcome::Rejected(_) => "rejected",
            PipelineOutcome::SwapFailure(_) => {
                self.set_aside("failed").await?;
                return Err(TaskError::Failed(outcome.to_string()));
            }
            _ => return Err(TaskError::Failed(outcome.to_string())),
        };
        let aside = self.set_aside(tag).await?;
        Ok(format!("{}; moved to {}", outcome.label(), aside.display()))
    }
}

/// Build the scheduler with every task enabled in `cfg`.
///
/// # Errors
///
/// [`SchedulerError`] from registration.
pub fn build_scheduler(cfg: &RewriteConfig, pipeline: &RewritePipeline) -> Result<Scheduler, SchedulerError> {
    let sc = &cfg.scheduler;
    let lock_timeout = Duration::from_secs(cfg.lock.background_timeout_secs);
    let mut scheduler = Scheduler::new(
        Duration::from_secs(sc.poll_interval_secs),
        Duration::from_secs(sc.task_timeout_secs),
    );
    if sc.self_check.enabled {
        scheduler.register(
            Arc::new(SelfCheckTask::new(pipeline.clone(), lock_timeout)),
            Duration::from_secs(sc.self_check.interval_secs),
        )?;
    }
    if sc.patch_queue.enabled {
        scheduler.register(
            Arc::new(PatchQueueTask::new(
                pipeline.clone(),
                cfg.workspace.resolved_patch_file(),
                sc.patch_queue.auto_apply,
                lock_timeout,
            )),
            Duration::from_secs(sc.patch_queue.interval_secs),
        )?;
    }
    Ok(scheduler)
}
