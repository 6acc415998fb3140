//! Scheduler timing, isolation and the built-in tasks against a live tree.

use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::time::Instant;

use self_rewrite_orchestrator::config::RewriteConfig;
use self_rewrite_orchestrator::proposal::OfflineProposer;
use self_rewrite_orchestrator::scheduler::{build_scheduler, PatchQueueTask, SelfCheckTask, TaskError};
use self_rewrite_orchestrator::{MutationLock, RewritePipeline, Scheduler, TaskAction};

struct Counter {
    name: &'static str,
    calls: Arc<AtomicUsize>,
    result: Result<&'static str, &'static str>,
}

#[async_trait]
impl TaskAction for Counter {
    fn name(&self) -> &str {
        self.name
    }

    async fn run(&self) -> Result<String, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.result
            .map(str::to_string)
            .map_err(|e| TaskError::Failed(e.to_string()))
    }
}

fn counter(name: &'static str, result: Result<&'static str, &'static str>) -> (Arc<Counter>, Arc<AtomicUsize>) {
    let calls = Arc::new(AtomicUsize::new(0));
    (
        Arc::new(Counter {
            name,
            calls: Arc::clone(&calls),
            result,
        }),
        calls,
    )
}

#[tokio::test]
async fn test_hourly_task_runs_once_after_interval_elapses() {
    let mut scheduler = Scheduler::new(Duration::from_secs(10), Duration::from_secs(5));
    let (task, calls) = counter("hourly", Ok("ok"));
    let t = Instant::now();
    scheduler
        .register_with_last_run(task, Duration::from_secs(3600), Some(t))
        .expect("test: register");

    assert_eq!(scheduler.tick(t + Duration::from_secs(3599)).await, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 0);

    let later = t + Duration::from_secs(3601);
    assert_eq!(scheduler.tick(later).await, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(scheduler.last_run("hourly"), Some(later));

    assert_eq!(scheduler.tick(later + Duration::from_secs(1)).await, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_task_is_due_exactly_at_interval() {
    let mut scheduler = Scheduler::new(Duration::from_secs(10), Duration::from_secs(5));
    let (task, calls) = counter("hourly", Ok("ok"));
    let t = Instant::now();
    scheduler
        .register_with_last_run(task, Duration::from_secs(3600), Some(t))
        .expect("test: register");

    assert_eq!(scheduler.tick(t + Duration::from_secs(3600)).await, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn test_failing_task_does_not_block_others() {
    let mut scheduler = Scheduler::new(Duration::from_secs(10), Duration::from_secs(5));
    let (bad, bad_calls) = counter("bad", Err("checker exploded"));
    let (good, good_calls) = counter("good", Ok("fine"));
    scheduler.register(bad, Duration::from_secs(60)).expect("test: register");
    scheduler.register(good, Duration::from_secs(60)).expect("test: register");

    let t = Instant::now();
    assert_eq!(scheduler.tick(t).await, 2);
    // "good" started just after t.
    assert_eq!(scheduler.tick(t + Duration::from_secs(61)).await, 2);
    assert_eq!(bad_calls.load(Ordering::SeqCst), 2);
    assert_eq!(good_calls.load(Ordering::SeqCst), 2);

    let status = scheduler.status().snapshot();
    assert_eq!(status[0].failures, 2);
    assert_eq!(status[0].last_error.as_deref(), Some("checker exploded"));
    assert_eq!(status[1].runs, 2);
}

struct Sleeper {
    calls: Arc<AtomicUsize>,
    nap: Duration,
}

#[async_trait]
impl TaskAction for Sleeper {
    fn name(&self) -> &str {
        "sleeper"
    }

    async fn run(&self) -> Result<String, TaskError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        tokio::time::sleep(self.nap).await;
        Ok("rested".to_string())
    }
}

#[tokio::test]
async fn test_shutdown_during_tick_skips_remaining_tasks() {
    let mut scheduler = Scheduler::new(Duration::from_millis(10), Duration::from_secs(5));
    let sleeper_calls = Arc::new(AtomicUsize::new(0));
    scheduler
        .register(
            Arc::new(Sleeper {
                calls: Arc::clone(&sleeper_calls),
                nap: Duration::from_millis(400),
            }),
            Duration::from_secs(3600),
        )
        .expect("test: register");
    let (after, after_calls) = counter("after", Ok("ok"));
    scheduler.register(after, Duration::from_secs(3600)).expect("test: register");

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(rx));
    tokio::time::sleep(Duration::from_millis(50)).await;
    tx.send(true).expect("test: send shutdown");

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("test: loop stopped in time")
        .expect("test: loop did not panic");
    assert_eq!(sleeper_calls.load(Ordering::SeqCst), 1);
    assert_eq!(after_calls.load(Ordering::SeqCst), 0, "task started after shutdown");
}

#[tokio::test]
async fn test_run_loop_stops_on_shutdown_signal() {
    let mut scheduler = Scheduler::new(Duration::from_millis(10), Duration::from_secs(1));
    let (task, calls) = counter("ticker", Ok("ok"));
    scheduler.register(task, Duration::from_millis(10)).expect("test: register");

    let (tx, rx) = watch::channel(false);
    let handle = tokio::spawn(scheduler.run(rx));
    tokio::time::sleep(Duration::from_millis(80)).await;
    tx.send(true).expect("test: send shutdown");

    tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("test: loop stopped in time")
        .expect("test: loop did not panic");
    assert!(calls.load(Ordering::SeqCst) >= 1);
}

fn live_tree() -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("test: tempdir");
    std::fs::create_dir_all(dir.path().join("src")).expect("test: mkdir");
    std::fs::create_dir_all(dir.path().join("data")).expect("test: mkdir data");
    std::fs::write(dir.path().join("src/lib.rs"), "pub fn one() -> u8 {\n    1\n}\n").expect("test: write");
    dir
}

fn pipeline(root: &Path) -> (RewriteConfig, RewritePipeline) {
    let mut cfg = RewriteConfig::default();
    cfg.workspace.root = root.to_path_buf();
    let pipeline = RewritePipeline::from_config(&cfg, Arc::new(OfflineProposer), MutationLock::new());
    (cfg, pipeline)
}

fn aside_files(dir: &Path, tag: &str) -> Vec<String> {
    std::fs::read_dir(dir)
        .expect("test: read dir")
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .filter(|n| n.starts_with(&format!("patch.diff.{tag}-")))
        .collect()
}

const DOC_PATCH: &str = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,3 +1,4 @@\n+/// Returns one.\n pub fn one() -> u8 {\n     1\n }\n";

#[tokio::test]
async fn test_patch_queue_applies_and_moves_file_aside() {
    let live = live_tree();
    let (_, pipeline) = pipeline(live.path());
    let patch_file = live.path().join("data/patch.diff");
    std::fs::write(&patch_file, DOC_PATCH).expect("test: queue patch");

    let task = PatchQueueTask::new(pipeline, patch_file.clone(), true, Duration::from_secs(1));
    let summary = task.run().await.expect("test: task run");
    assert!(summary.starts_with("applied"), "{summary}");

    assert!(!patch_file.exists());
    assert_eq!(aside_files(&live.path().join("data"), "applied").len(), 1);
    let lib = std::fs::read_to_string(live.path().join("src/lib.rs")).expect("test: read");
    assert!(lib.starts_with("/// Returns one."));
}

#[tokio::test]
async fn test_patch_queue_validate_only_leaves_tree_alone() {
    let live = live_tree();
    let (_, pipeline) = pipeline(live.path());
    let patch_file = live.path().join("data/patch.diff");
    std::fs::write(&patch_file, DOC_PATCH).expect("test: queue patch");

    let task = PatchQueueTask::new(pipeline, patch_file.clone(), false, Duration::from_secs(1));
    task.run().await.expect("test: task run");

    assert_eq!(aside_files(&live.path().join("data"), "validated").len(), 1);
    let lib = std::fs::read_to_string(live.path().join("src/lib.rs")).expect("test: read");
    assert!(!lib.contains("Returns one"));
}

#[tokio::test]
async fn test_patch_queue_keeps_file_when_lock_is_busy() {
    let live = live_tree();
    let (_, pipeline) = pipeline(live.path());
    let patch_file = live.path().join("data/patch.diff");
    std::fs::write(&patch_file, DOC_PATCH).expect("test: queue patch");
    let _held = pipeline
        .lock()
        .acquire("foreground", Duration::from_secs(1))
        .await
        .expect("test: hold lock");

    let task = PatchQueueTask::new(pipeline.clone(), patch_file.clone(), true, Duration::from_millis(50));
    let err = task.run().await.expect_err("test: busy lock fails the run");
    assert!(err.to_string().contains("foreground"), "{err}");
    assert!(patch_file.exists());
}

#[tokio::test]
async fn test_patch_queue_without_file_is_a_quiet_success() {
    let live = live_tree();
    let (cfg, pipeline) = pipeline(live.path());
    let task = PatchQueueTask::new(pipeline, cfg.workspace.resolved_patch_file(), true, Duration::from_secs(1));
    assert_eq!(task.run().await.expect("test: task run"), "no queued patch");
}

#[tokio::test]
async fn test_self_check_task_reports_outcome() {
    let live = live_tree();
    let (_, pipeline) = pipeline(live.path());
    let task = SelfCheckTask::new(pipeline, Duration::from_secs(1));
    let summary = task.run().await.expect("test: task run");
    assert_eq!(summary, "valid");
}

#[tokio::test]
async fn test_build_scheduler_registers_enabled_tasks() {
    let live = live_tree();
    let (mut cfg, pipeline) = pipeline(live.path());
    cfg.scheduler.self_check.enabled = true;
    cfg.scheduler.patch_queue.enabled = false;
    let scheduler = build_scheduler(&cfg, &pipeline).expect("test: build");
    assert_eq!(scheduler.task_names(), vec![SelfCheckTask::NAME.to_string()]);
}
