//! # Stage: Rewrite Configuration
//!
//! ## Responsibility
//! Parse and validate the TOML file that wires the self-modification
//! pipeline together: which tree is live, where backups go, how proposed
//! code is compile-checked, which collaborator proposes rewrites, and which
//! background tasks the scheduler runs.
//!
//! ```text
//! self-rewrite --config self-rewrite.toml
//! ```
//!
//! ## Guarantees
//! - Deterministic: same TOML input always produces the same `RewriteConfig`
//! - Total: every field has a documented default, so an empty file is valid
//! - Validated: semantic constraints are checked before a config is accepted
//! - Schema-exportable: JSON Schema output enables IDE autocomplete
//!
//! ## NOT Responsible For
//! - Building components from the config (that belongs to `main`)
//! - Watching the file for changes (configuration is read once at startup)

pub mod loader;
pub mod validation;

use std::path::PathBuf;
use std::time::Duration;

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// ── Default value functions ──────────────────────────────────────────────

fn default_root() -> PathBuf {
    PathBuf::from(".")
}

fn default_extensions() -> Vec<String> {
    vec!["rs".to_string()]
}

fn default_exclude() -> Vec<String> {
    vec![
        "target".to_string(),
        ".git".to_string(),
        "data".to_string(),
    ]
}

fn default_backup_dir() -> PathBuf {
    PathBuf::from("data/rewrites")
}

fn default_patch_file() -> PathBuf {
    PathBuf::from("data/patch.diff")
}

/// Default compile-check timeout: 60 seconds.
fn default_check_timeout_secs() -> u64 {
    60
}

/// Default captured output cap for command checkers: 64 KiB.
fn default_max_output_bytes() -> usize {
    65_536
}

fn default_denied_env_prefixes() -> Vec<String> {
    vec!["TOKEN".to_string(), "KEY".to_string(), "SECRET".to_string()]
}

fn default_model() -> String {
    "gpt-4o".to_string()
}

/// Default collaborator request timeout: 60 seconds.
fn default_proposer_timeout_secs() -> u64 {
    60
}

fn default_max_tokens() -> u32 {
    2048
}

fn default_temperature() -> f32 {
    0.2
}

fn default_max_attempts() -> usize {
    3
}

fn default_retry_base_ms() -> u64 {
    500
}

fn default_retry_max_ms() -> u64 {
    10_000
}

/// Foreground callers wait up to 5 minutes for the mutation lock.
fn default_foreground_lock_secs() -> u64 {
    300
}

/// Background tasks give up on the mutation lock after 5 seconds.
fn default_background_lock_secs() -> u64 {
    5
}

fn default_io_timeout_secs() -> u64 {
    30
}

/// Scheduler polling period: 10 seconds.
fn default_poll_interval_secs() -> u64 {
    10
}

fn default_task_timeout_secs() -> u64 {
    600
}

/// Self-check runs hourly.
fn default_self_check_interval_secs() -> u64 {
    3600
}

fn default_patch_queue_interval_secs() -> u64 {
    300
}

// ── Top-level config ─────────────────────────────────────────────────────

/// Root configuration for a self-rewrite process.
///
/// # Example
///
/// ```toml
/// [workspace]
/// root = "."
/// backup_dir = "data/rewrites"
///
/// [checker]
/// kind = "rust"
///
/// [proposer]
/// kind = "openai"
/// model = "gpt-4o"
/// ```
///
/// # Panics
///
/// This type never panics during construction or access.
#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct RewriteConfig {
    /// The live tree and where artifacts are written.
    pub workspace: WorkspaceConfig,
    /// How proposed code is compile-checked.
    pub checker: CheckerConfig,
    /// The external collaborator that proposes rewrites.
    pub proposer: ProposerConfig,
    /// Mutation lock acquisition timeouts.
    pub lock: LockConfig,
    /// Backup & swap I/O bounds.
    pub swap: SwapConfig,
    /// Background scheduler and its built-in tasks.
    pub scheduler: SchedulerConfig,
}

// ── Workspace ────────────────────────────────────────────────────────────

/// The live source tree.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct WorkspaceConfig {
    /// Root of the live source tree.
    pub root: PathBuf,
    /// File extensions (without the dot) that count as source files.
    pub extensions: Vec<String>,
    /// Directory names skipped when scanning and when copying into a sandbox.
    pub exclude: Vec<String>,
    /// Directory that receives backup artifacts. Relative paths resolve
    /// against `root`.
    pub backup_dir: PathBuf,
    /// Queued whole-tree patch picked up by the patch-queue task. Relative
    /// paths resolve against `root`.
    pub patch_file: PathBuf,
}

impl Default for WorkspaceConfig {
    fn default() -> Self {
        Self {
            root: default_root(),
            extensions: default_extensions(),
            exclude: default_exclude(),
            backup_dir: default_backup_dir(),
            patch_file: default_patch_file(),
        }
    }
}

impl WorkspaceConfig {
    /// Backup directory resolved against the workspace root.
    pub fn resolved_backup_dir(&self) -> PathBuf {
        resolve_under(&self.root, &self.backup_dir)
    }

    /// Patch queue file resolved against the workspace root.
    pub fn resolved_patch_file(&self) -> PathBuf {
        resolve_under(&self.root, &self.patch_file)
    }
}

fn resolve_under(root: &std::path::Path, path: &std::path::Path) -> PathBuf {
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        root.join(path)
    }
}

// ── Checker ──────────────────────────────────────────────────────────────

/// Which compile-check implementation validates proposals.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CheckerKind {
    /// In-process Rust parse plus intra-crate path resolution.
    Rust,
    /// External command, e.g. `python3 -m py_compile {file}`.
    Command,
}

/// Compile-check configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct CheckerConfig {
    /// Checker implementation.
    pub kind: CheckerKind,
    /// Program for the `command` checker.
    pub program: Option<String>,
    /// Arguments for the `command` checker. `{file}` is replaced with the
    /// path of the file under check; without it the command runs once per
    /// tree in the sandbox root.
    pub args: Vec<String>,
    /// Upper bound on a single compile-check invocation.
    pub timeout_secs: u64,
    /// Captured stdout/stderr are truncated to this many bytes.
    pub max_output_bytes: usize,
    /// Environment variables whose upper-cased name contains any of these
    /// substrings are removed before spawning the checker.
    pub denied_env_prefixes: Vec<String>,
}

impl Default for CheckerConfig {
    fn default() -> Self {
        Self {
            kind: CheckerKind::Rust,
            program: None,
            args: Vec::new(),
            timeout_secs: default_check_timeout_secs(),
            max_output_bytes: default_max_output_bytes(),
            denied_env_prefixes: default_denied_env_prefixes(),
        }
    }
}

impl CheckerConfig {
    /// Compile-check timeout as a [`Duration`].
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Proposer ─────────────────────────────────────────────────────────────

/// Supported rewrite collaborators.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum ProposerKind {
    /// OpenAI-compatible chat completions (OpenAI, vLLM, llama.cpp server).
    #[serde(rename = "openai")]
    OpenAi,
    /// Anthropic messages API.
    Anthropic,
    /// No collaborator: every proposal fails as unavailable.
    Offline,
}

/// Rewrite collaborator configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct ProposerConfig {
    /// Collaborator backend.
    pub kind: ProposerKind,
    /// Full request URL; the backend's public endpoint when unset.
    pub endpoint: Option<String>,
    /// Model identifier passed to the collaborator.
    pub model: String,
    /// Name of the environment variable that holds the API key; the
    /// backend's conventional variable when unset.
    pub api_key_env: Option<String>,
    /// Per-request timeout.
    pub timeout_secs: u64,
    /// Generation limit.
    pub max_tokens: u32,
    /// Sampling temperature (0.0–2.0).
    pub temperature: f32,
    /// Total attempts including the first one.
    pub max_attempts: usize,
    /// Initial retry backoff.
    pub retry_base_ms: u64,
    /// Backoff cap.
    pub retry_max_ms: u64,
}

impl Default for ProposerConfig {
    fn default() -> Self {
        Self {
            kind: ProposerKind::OpenAi,
            endpoint: None,
            model: default_model(),
            api_key_env: None,
            timeout_secs: default_proposer_timeout_secs(),
            max_tokens: default_max_tokens(),
            temperature: default_temperature(),
            max_attempts: default_max_attempts(),
            retry_base_ms: default_retry_base_ms(),
            retry_max_ms: default_retry_max_ms(),
        }
    }
}

impl ProposerConfig {
    /// Request URL for the configured backend.
    pub fn resolved_endpoint(&self) -> String {
        match (&self.endpoint, self.kind) {
            (Some(url), _) => url.clone(),
            (None, ProposerKind::Anthropic) => "https://api.anthropic.com/v1/messages".to_string(),
            (None, _) => "https://api.openai.com/v1/chat/completions".to_string(),
        }
    }

    /// Environment variable holding the API key for the configured backend.
    pub fn resolved_api_key_env(&self) -> String {
        match (&self.api_key_env, self.kind) {
            (Some(var), _) => var.clone(),
            (None, ProposerKind::Anthropic) => "ANTHROPIC_API_KEY".to_string(),
            (None, _) => "OPENAI_API_KEY".to_string(),
        }
    }

    /// Per-request timeout.
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

// ── Lock / swap ──────────────────────────────────────────────────────────

/// Mutation lock acquisition bounds.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct LockConfig {
    /// How long a user-triggered command waits for the lock.
    pub foreground_timeout_secs: u64,
    /// How long a scheduled task waits before giving up for this tick.
    pub background_timeout_secs: u64,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            foreground_timeout_secs: default_foreground_lock_secs(),
            background_timeout_secs: default_background_lock_secs(),
        }
    }
}

/// Backup & swap bounds.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SwapConfig {
    /// Upper bound on the backup-then-overwrite sequence for one apply.
    pub io_timeout_secs: u64,
}

impl Default for SwapConfig {
    fn default() -> Self {
        Self {
            io_timeout_secs: default_io_timeout_secs(),
        }
    }
}

// ── Scheduler ────────────────────────────────────────────────────────────

/// Background scheduler configuration.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Whether the scheduler loop starts with the front end.
    pub enabled: bool,
    /// Fixed polling period between ticks.
    pub poll_interval_secs: u64,
    /// Upper bound on a single task invocation.
    pub task_timeout_secs: u64,
    /// Periodic whole-tree compile-check.
    pub self_check: SelfCheckTaskConfig,
    /// Periodic pickup of the queued patch file.
    pub patch_queue: PatchQueueTaskConfig,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_secs: default_poll_interval_secs(),
            task_timeout_secs: default_task_timeout_secs(),
            self_check: SelfCheckTaskConfig::default(),
            patch_queue: PatchQueueTaskConfig::default(),
        }
    }
}

/// Self-check task settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct SelfCheckTaskConfig {
    /// Whether the task is registered.
    pub enabled: bool,
    /// Seconds between runs.
    pub interval_secs: u64,
}

impl Default for SelfCheckTaskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_self_check_interval_secs(),
        }
    }
}

/// Patch-queue task settings.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema, PartialEq)]
#[serde(default)]
pub struct PatchQueueTaskConfig {
    /// Whether the task is registered.
    pub enabled: bool,
    /// Seconds between runs.
    pub interval_secs: u64,
    /// Apply a queued patch that validates. When false the task only
    /// validates and reports.
    pub auto_apply: bool,
}

impl Default for PatchQueueTaskConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_secs: default_patch_queue_interval_secs(),
            auto_apply: false,
        }
    }
}

/// Export the JSON Schema for [`RewriteConfig`].
///
/// # Errors
///
/// Returns the serializer error if the schema cannot be rendered.
pub fn export_schema() -> Result<String, serde_json::Error> {
    let schema = schemars::schema_for!(RewriteConfig);
    serde_json::to_string_pretty(&schema)
}
