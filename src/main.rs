//! `self-rewrite`: interactive front end for the self-modification pipeline.
//!
//! ## Usage
//!
//! ```bash
//! # Use ./self-rewrite.toml if present, otherwise defaults
//! self-rewrite
//!
//! # Explicit config and tree, no background tasks
//! self-rewrite --config rewrite.toml --root ../service --no-scheduler
//!
//! # Print the configuration JSON Schema
//! self-rewrite --print-schema
//! ```
//!
//! ## Environment Variables
//!
//! - `LOG_FORMAT=json`: structured JSON logs
//! - `RUST_LOG=info`: log level filter
//! - `OPENAI_API_KEY` / `ANTHROPIC_API_KEY`: collaborator credentials
//! - `SELF_REWRITE_ROOT`, `SELF_REWRITE_BACKUP_DIR`, `SELF_REWRITE_MODEL`:
//!   configuration overrides

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};

use self_rewrite_orchestrator::config::{self, loader, RewriteConfig};
use self_rewrite_orchestrator::proposal::{build_proposer, OfflineProposer, DEFAULT_INSTRUCTION};
use self_rewrite_orchestrator::router::{Capability, CapabilityRegistry};
use self_rewrite_orchestrator::scheduler::{build_scheduler, SchedulerStatus};
use self_rewrite_orchestrator::{
    init_tracing, metrics, ChangeSummary, Confirm, MutationLock, PipelineOutcome, RewriteError, RewritePipeline,
    RewriteProposer,
};

/// Parsed CLI arguments.
struct Args {
    /// Explicit config file.
    config: Option<PathBuf>,
    /// Override for `workspace.root`.
    root: Option<PathBuf>,
    /// Do not start background tasks.
    no_scheduler: bool,
    /// Approve every confirmation prompt.
    assume_yes: bool,
    /// Print the config schema and exit.
    print_schema: bool,
}

/// Parse command-line arguments manually (no external arg parser dependency).
fn parse_args() -> Result<Args, String> {
    let args: Vec<String> = std::env::args().collect();
    let mut parsed = Args {
        config: None,
        root: None,
        no_scheduler: false,
        assume_yes: false,
        print_schema: false,
    };

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--config" | "-c" => {
                i += 1;
                let value = args.get(i).ok_or("--config requires a value")?;
                parsed.config = Some(PathBuf::from(value));
            }
            "--root" | "-r" => {
                i += 1;
                let value = args.get(i).ok_or("--root requires a value")?;
                parsed.root = Some(PathBuf::from(value));
            }
            "--no-scheduler" => parsed.no_scheduler = true,
            "--yes" | "-y" => parsed.assume_yes = true,
            "--print-schema" => parsed.print_schema = true,
            "--help" | "-h" => return Err(usage()),
            other => return Err(format!("unknown argument: {other}\n{}", usage())),
        }
        i += 1;
    }
    Ok(parsed)
}

fn usage() -> String {
    [
        "Usage: self-rewrite [OPTIONS]",
        "",
        "Options:",
        "  --config, -c <FILE>   Config file (default: ./self-rewrite.toml if present)",
        "  --root, -r <DIR>      Live tree to operate on (overrides workspace.root)",
        "  --no-scheduler        Do not run background tasks",
        "  --yes, -y             Apply validated changes without asking",
        "  --print-schema        Print the configuration JSON Schema and exit",
        "  --help, -h            Show this message",
    ]
    .join("\n")
}

fn load_config(args: &Args) -> Result<RewriteConfig, RewriteError> {
    let default_file = Path::new("self-rewrite.toml");
    let mut cfg = match &args.config {
        Some(path) => loader::load_from_file(path)?,
        None if default_file.is_file() => loader::load_from_file(default_file)?,
        None => loader::load_default()?,
    };
    if let Some(root) = &args.root {
        cfg.workspace.root = root.clone();
    }
    if !cfg.workspace.root.is_dir() {
        return Err(RewriteError::Setup(format!(
            "workspace root {} is not a directory",
            cfg.workspace.root.display()
        )));
    }
    Ok(cfg)
}

/// Lines from stdin, read on a dedicated thread and shared by the command
/// loop and confirmation prompts.
#[derive(Clone)]
struct Console {
    lines: Arc<Mutex<mpsc::Receiver<String>>>,
}

impl Console {
    fn spawn() -> Self {
        let (tx, rx) = mpsc::channel(16);
        std::thread::spawn(move || {
            let stdin = std::io::stdin();
            let mut line = String::new();
            loop {
                line.clear();
                match stdin.read_line(&mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        if tx.blocking_send(line.trim_end().to_string()).is_err() {
                            break;
                        }
                    }
                }
            }
        });
        Self {
            lines: Arc::new(Mutex::new(rx)),
        }
    }

    async fn prompt(&self, text: &str) -> Option<String> {
        print!("{text}");
        let _ = std::io::stdout().flush();
        self.lines.lock().await.recv().await
    }
}

/// Shows the diff and asks before every write.
struct ConsoleConfirm {
    console: Console,
    assume_yes: bool,
}

#[async_trait]
impl Confirm for ConsoleConfirm {
    async fn confirm(&self, summary: &ChangeSummary) -> bool {
        println!("\n{} will change {} file(s):", summary.operation, summary.files.len());
        println!("{}", summary.diff);
        if self.assume_yes {
            println!("(--yes) applying");
            return true;
        }
        matches!(
            self.console.prompt("Apply this change? [y/N] ").await.as_deref().map(str::trim),
            Some("y" | "Y" | "yes")
        )
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = match parse_args() {
        Ok(args) => args,
        Err(message) => {
            eprintln!("{message}");
            std::process::exit(2);
        }
    };
    if args.print_schema {
        println!("{}", config::export_schema()?);
        return Ok(());
    }

    let _ = init_tracing();
    metrics::init_metrics()?;

    let cfg = load_config(&args)?;
    let proposer: Arc<dyn RewriteProposer> = match build_proposer(&cfg.proposer) {
        Ok(p) => p,
        Err(e) => {
            tracing::warn!(error = %e, "propose: collaborator unavailable, running offline");
            Arc::new(OfflineProposer)
        }
    };
    let lock = MutationLock::new();
    let pipeline = RewritePipeline::from_config(&cfg, proposer, lock.clone());
    tracing::info!(root = %cfg.workspace.root.display(), "self-rewrite starting");

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let mut scheduler_status = None;
    let mut scheduler_handle = None;
    if cfg.scheduler.enabled && !args.no_scheduler {
        let scheduler = build_scheduler(&cfg, &pipeline).map_err(|e| RewriteError::Setup(e.to_string()))?;
        scheduler_status = Some(scheduler.status());
        scheduler_handle = Some(tokio::spawn(scheduler.run(shutdown_rx)));
    }

    let router = CapabilityRegistry::standard().map_err(|e| RewriteError::Setup(e.to_string()))?;
    let console = Console::spawn();
    let confirm = ConsoleConfirm {
        console: console.clone(),
        assume_yes: args.assume_yes,
    };

    println!("self-rewrite on {} (type 'help')", cfg.workspace.root.display());
    loop {
        let Some(line) = console.prompt("> ").await else {
            break;
        };
        if line.trim().is_empty() {
            continue;
        }
        let Some(route) = router.route(&line) else {
            println!("unknown command; type 'help'");
            continue;
        };
        if route.capability == Capability::Exit {
            break;
        }
        dispatch(&pipeline, &router, &confirm, scheduler_status.as_ref(), &lock, route.capability, &route.args).await;
    }

    println!("stopping scheduler...");
    let _ = shutdown_tx.send(true);
    if let Some(handle) = scheduler_handle {
        let _ = handle.await;
    }
    tracing::info!("self-rewrite stopped");
    Ok(())
}

fn report(outcome: &PipelineOutcome) {
    if outcome.needs_attention() {
        println!("!!! {outcome}");
        println!("!!! the live tree may need manual inspection; see 'backups'");
    } else {
        println!("{outcome}");
    }
}

async fn dispatch(
    pipeline: &RewritePipeline,
    router: &CapabilityRegistry,
    confirm: &ConsoleConfirm,
    scheduler: Option<&SchedulerStatus>,
    lock: &MutationLock,
    capability: Capability,
    args: &str,
) {
    match capability {
        Capability::Reflect => match pipeline.reflect().await {
            Ok(report) => {
                for c in &report.candidates {
                    let doc = if c.doc.is_empty() { "-" } else { c.doc.as_str() };
                    println!("{}({})  {}", c.display_target(), c.args.join(", "), doc);
                }
                for f in &report.failures {
                    println!("skipped {}: {}", f.file.display(), f.error);
                }
                println!("{} candidate(s)", report.candidates.len());
            }
            Err(e) => println!("scan failed: {e}"),
        },
        Capability::Improve => {
            let (target, instruction) = match args.split_once(" : ") {
                Some((t, i)) => (t.trim(), i.trim()),
                None => (args.trim(), DEFAULT_INSTRUCTION),
            };
            if target.is_empty() {
                println!("usage: improve <target> [: instruction]");
                return;
            }
            report(&pipeline.improve(target, instruction, confirm).await);
        }
        Capability::ValidatePatch | Capability::ApplyPatch => {
            let diff = match tokio::fs::read_to_string(args.trim()).await {
                Ok(d) => d,
                Err(e) => {
                    println!("cannot read patch '{}': {e}", args.trim());
                    return;
                }
            };
            if capability == Capability::ValidatePatch {
                match pipeline.validate_patch(&diff).await {
                    Ok(outcome) => println!("{outcome}"),
                    Err(e) => println!("validation could not run: {e}"),
                }
            } else {
                report(&pipeline.apply_patch(&diff, confirm).await);
            }
        }
        Capability::Status => {
            println!("lock: {}", lock.holder().unwrap_or_else(|| "free".to_string()));
            match scheduler {
                Some(status) => status.snapshot().iter().for_each(|t| println!("{t}")),
                None => println!("scheduler: not running"),
            }
            let summary = metrics::get_metrics_summary();
            let mut outcomes: Vec<_> = summary.outcomes.into_iter().collect();
            outcomes.sort();
            for (key, count) in outcomes {
                println!("{key}: {count}");
            }
        }
        Capability::Backups => {
            let filter = Some(args.trim()).filter(|a| !a.is_empty()).map(Path::new);
            match pipeline.list_backups(filter).await {
                Ok(list) if list.is_empty() => println!("no backups"),
                Ok(list) => list.iter().for_each(|b| {
                    println!("{}  {}  {}", b.timestamp, b.target.display(), b.file_name());
                }),
                Err(e) => println!("cannot list backups: {e}"),
            }
        }
        Capability::Rollback => {
            let wanted = args.trim();
            let found = match pipeline.list_backups(None).await {
                Ok(list) => list.into_iter().find(|b| b.file_name() == wanted),
                Err(e) => {
                    println!("cannot list backups: {e}");
                    return;
                }
            };
            match found {
                Some(artifact) => report(&pipeline.rollback(&artifact, confirm).await),
                None => println!("no backup named '{wanted}'; see 'backups'"),
            }
        }
        Capability::Metrics => print!("{}", metrics::gather_metrics()),
        Capability::Help => println!("{}", router.help()),
        Capability::Exit => {}
    }
}
