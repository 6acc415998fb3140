//! Concurrent writers against one live tree share the mutation lock.

use std::sync::Arc;

use self_rewrite_orchestrator::config::RewriteConfig;
use self_rewrite_orchestrator::proposal::ScriptedProposer;
use self_rewrite_orchestrator::{AutoApprove, MutationLock, RewritePipeline};

const LIVE: &str = "pub fn greet() -> &'static str {\n    \"hi\"\n}\n";
const FIRST: &str = "pub fn greet() -> &'static str {\n    \"hello\"\n}\n";
const SECOND: &str = "pub fn greet() -> &'static str {\n    \"howdy\"\n}\n";

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_improves_leave_one_whole_proposal() {
    let live = tempfile::tempdir().expect("test: tempdir");
    std::fs::create_dir_all(live.path().join("src")).expect("test: mkdir");
    std::fs::write(live.path().join("src/lib.rs"), LIVE).expect("test: write");

    let mut cfg = RewriteConfig::default();
    cfg.workspace.root = live.path().to_path_buf();
    let lock = MutationLock::new();
    let a = RewritePipeline::from_config(&cfg, Arc::new(ScriptedProposer::once(FIRST)), lock.clone());
    let b = RewritePipeline::from_config(&cfg, Arc::new(ScriptedProposer::once(SECOND)), lock.clone());

    let (ra, rb) = tokio::join!(
        async { a.improve("greet", "say hello", &AutoApprove).await },
        async { b.improve("greet", "say howdy", &AutoApprove).await },
    );
    assert!(ra.is_applied(), "{ra}");
    assert!(rb.is_applied(), "{rb}");

    let content = std::fs::read_to_string(live.path().join("src/lib.rs")).expect("test: read");
    assert!(content == FIRST || content == SECOND, "interleaved write: {content}");

    // Each swap backed up whatever it replaced: the original and the first winner.
    let backups = a.list_backups(None).await.expect("test: list backups");
    assert_eq!(backups.len(), 2);
    let mut contents: Vec<String> = backups
        .iter()
        .map(|b| std::fs::read_to_string(&b.path).expect("test: read backup"))
        .collect();
    contents.sort();
    assert!(contents.contains(&LIVE.to_string()));
    assert_eq!(lock.holder(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_patch_and_self_check_serialize_on_the_lock() {
    let live = tempfile::tempdir().expect("test: tempdir");
    std::fs::create_dir_all(live.path().join("src")).expect("test: mkdir");
    std::fs::write(live.path().join("src/lib.rs"), LIVE).expect("test: write");

    let mut cfg = RewriteConfig::default();
    cfg.workspace.root = live.path().to_path_buf();
    let pipeline = RewritePipeline::from_config(&cfg, Arc::new(ScriptedProposer::default()), MutationLock::new());
    let diff = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,3 +1,4 @@\n+/// Greeting.\n pub fn greet() -> &'static str {\n     \"hi\"\n }\n";

    let (applied, checked) = tokio::join!(pipeline.apply_patch(diff, &AutoApprove), pipeline.self_check());
    assert!(applied.is_applied(), "{applied}");
    assert!(checked.expect("test: self check").is_valid());
    assert_eq!(pipeline.lock().holder(), None);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_lock_outlives_a_swap_that_overruns_its_timeout() {
    let live = tempfile::tempdir().expect("test: tempdir");
    std::fs::create_dir_all(live.path().join("src")).expect("test: mkdir");
    let padding = format!("// {}\n", "x".repeat(120)).repeat(40_000);
    std::fs::write(live.path().join("src/lib.rs"), format!("{LIVE}{padding}")).expect("test: write");

    let mut cfg = RewriteConfig::default();
    cfg.workspace.root = live.path().to_path_buf();
    cfg.swap.io_timeout_secs = 0;
    let lock = MutationLock::new();
    let pipeline = RewritePipeline::from_config(&cfg, Arc::new(ScriptedProposer::once(FIRST)), lock.clone());

    let outcome = pipeline.improve("greet", "say hello", &AutoApprove).await;
    assert!(outcome.is_applied() || outcome.needs_attention(), "{outcome}");

    // Whoever gets the lock next must see the finished write, never the old file.
    let _next = lock
        .acquire("other", std::time::Duration::from_secs(30))
        .await
        .expect("test: acquire after swap");
    let content = std::fs::read_to_string(live.path().join("src/lib.rs")).expect("test: read");
    assert!(content.starts_with(FIRST), "write still pending after lock release");
    assert!(content.ends_with(&padding));
}
