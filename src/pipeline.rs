//! # Rewrite Pipeline
//!
//! ## Responsibility
//! Compose scanner, proposer, sandbox, lock and swapper into the operations
//! the front end and the scheduler call: `reflect`, `improve`,
//! `validate_patch`, `apply_patch`, `self_check`, `list_backups` and
//! `rollback`.
//!
//! ## Guarantees
//! - Validate before mutate: nothing reaches the live tree without a
//!   [`ValidationOutcome::Valid`] for exactly the bytes being written
//! - Every live write happens under the [`MutationLock`], held from
//!   composition through validation, confirmation and swap
//! - Expected rejections are values ([`PipelineOutcome`]), never `Err`
//! - Only [`PipelineOutcome::SwapFailure`] needs operator attention
//!
//! ## NOT Responsible For
//! - Prompting the user (see: [`Confirm`] implementations in the front end)
//! - Scheduling (see: `scheduler`)

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use similar::TextDiff;
use thiserror::Error;

use crate::config::RewriteConfig;
use crate::lock::{LockError, MutationLock};
use crate::metrics;
use crate::proposal::{describe_target, extract_code, RewriteProposal, RewriteProposer};
use crate::sandbox::check::build_checker;
use crate::sandbox::patch::{FileChange, PatchPlan};
use crate::sandbox::{SandboxError, SandboxValidator, ValidationOutcome};
use crate::scanner::{
    extract_candidates, CandidateFunction, CandidateScanner, LineSpan, ScanError, ScanReport, SourceFilter,
};
use crate::swap::{BackupArtifact, BackupStore, LiveSwapper, SwapError, SwapReceipt};

/// Context lines around each change in previews.
const PREVIEW_CONTEXT: usize = 3;

// ─── Outcome ─────────────────────────────────────────────────────────────

/// Tagged result of a mutating pipeline operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineOutcome {
    /// The live tree now holds the validated content.
    Applied {
        /// Files written or removed, relative to the root.
        files: Vec<PathBuf>,
        /// Backup artifacts taken before the writes.
        backups: Vec<PathBuf>,
    },
    /// The proposal equals the live content; nothing was written.
    Unchanged,
    /// Validation passed but confirmation was refused.
    Declined,
    /// The target could not be resolved or read.
    TargetNotFound(String),
    /// The proposal collaborator failed.
    CollaboratorUnavailable(String),
    /// The sandbox rejected the change.
    Rejected(ValidationOutcome),
    /// The mutation lock could not be acquired in time.
    LockUnavailable(String),
    /// The sandbox machinery itself failed; nothing was written.
    SandboxFailure(String),
    /// The backup could not be taken; nothing was written.
    BackupFailure(String),
    /// The overwrite failed after the backup; the live tree may be partial.
    SwapFailure(String),
}

impl PipelineOutcome {
    /// True only when the live tree may be in an unspecified state.
    pub fn needs_attention(&self) -> bool {
        matches!(self, Self::SwapFailure(_))
    }

    /// True for [`PipelineOutcome::Applied`].
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Applied { .. } => "applied",
            Self::Unchanged => "unchanged",
            Self::Declined => "declined",
            Self::TargetNotFound(_) => "target_not_found",
            Self::CollaboratorUnavailable(_) => "collaborator_unavailable",
            Self::Rejected(_) => "rejected",
            Self::LockUnavailable(_) => "lock_unavailable",
            Self::SandboxFailure(_) => "sandbox_failure",
            Self::BackupFailure(_) => "backup_failure",
            Self::SwapFailure(_) => "swap_failure",
        }
    }
}

impl fmt::Display for PipelineOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Applied { files, backups } => {
                write!(f, "applied to {} file(s)", files.len())?;
                for file in files {
                    write!(f, "\n  {}", file.display())?;
                }
                for backup in backups {
                    write!(f, "\n  backup: {}", backup.display())?;
                }
                Ok(())
            }
            Self::Unchanged => write!(f, "unchanged: proposal matches the live content"),
            Self::Declined => write!(f, "declined: nothing was written"),
            Self::TargetNotFound(reason) => write!(f, "target not found: {reason}"),
            Self::CollaboratorUnavailable(reason) => write!(f, "collaborator unavailable: {reason}"),
            Self::Rejected(outcome) => write!(f, "{outcome}"),
            Self::LockUnavailable(reason) => write!(f, "busy: {reason}"),
            Self::SandboxFailure(reason) => write!(f, "sandbox failure: {reason}"),
            Self::BackupFailure(reason) => write!(f, "backup failed, live tree untouched: {reason}"),
            Self::SwapFailure(reason) => write!(f, "SWAP FAILED, live tree needs attention: {reason}"),
        }
    }
}

/// Failures of the non-mutating operations.
#[derive(Debug, Error)]
pub enum PipelineError {
    /// The mutation lock could not be acquired.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The sandbox could not run.
    #[error(transparent)]
    Sandbox(#[from] SandboxError),

    /// The live tree could not be scanned.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// The backup directory could not be read.
    #[error("backup store: {0}")]
    Backups(#[source] std::io::Error),

    /// A blocking worker panicked.
    #[error("worker failed: {0}")]
    Worker(String),
}

// ─── Confirmation ────────────────────────────────────────────────────────

/// What is about to be written, shown before confirmation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSummary {
    /// Operation name (`improve`, `apply_patch`, `rollback`).
    pub operation: String,
    /// Files that will be written or removed.
    pub files: Vec<PathBuf>,
    /// Unified diff of the change.
    pub diff: String,
}

/// Final say before a validated change is written.
///
/// Called while the mutation lock is held.
#[async_trait]
pub trait Confirm: Send + Sync {
    /// `true` to proceed with the write.
    async fn confirm(&self, summary: &ChangeSummary) -> bool;
}

/// Approves everything. For scheduled tasks with `auto_apply` and tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoApprove;

#[async_trait]
impl Confirm for AutoApprove {
    async fn confirm(&self, _summary: &ChangeSummary) -> bool {
        true
    }
}

/// Declines everything. Validation still runs.
#[derive(Debug, Default, Clone, Copy)]
pub struct AutoDecline;

#[async_trait]
impl Confirm for AutoDecline {
    async fn confirm(&self, _summary: &ChangeSummary) -> bool {
        false
    }
}

/// Who is asking for the lock and how long they will wait.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockPolicy {
    /// Holder name recorded on the lock.
    pub holder: String,
    /// Acquisition timeout.
    pub timeout: Duration,
}

impl LockPolicy {
    /// Policy with an explicit holder and timeout.
    pub fn new(holder: impl Into<String>, timeout: Duration) -> Self {
        Self {
            holder: holder.into(),
            timeout,
        }
    }
}

/// Render a unified diff between two versions of `path`.
pub fn render_diff(path: &Path, old: &str, new: &str) -> String {
    let label = path.display().to_string();
    TextDiff::from_lines(old, new)
        .unified_diff()
        .context_radius(PREVIEW_CONTEXT)
        .header(&format!("a/{label}"), &format!("b/{label}"))
        .to_string()
}

// ─── Splicing ────────────────────────────────────────────────────────────

/// How a proposal maps onto the live file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Composition {
    /// The proposal was one function with the target's name and replaced
    /// only that function's lines.
    Spliced(String),
    /// The proposal replaces the whole file.
    WholeFile(String),
}

impl Composition {
    /// The composed file content.
    pub fn content(&self) -> &str {
        match self {
            Self::Spliced(c) | Self::WholeFile(c) => c,
        }
    }
}

/// Compose `proposal` against `live` content for the function at `span`.
///
/// A proposal that parses as exactly one function named `function` replaces
/// lines `span.start..=span.end`, re-indented to the original indentation.
/// Anything else is whole-file content.
pub fn compose(live: &str, function: &str, span: LineSpan, proposal: &str) -> Composition {
    let is_single_fn = syn::parse_file(proposal).is_ok_and(|file| match file.items.as_slice() {
        [syn::Item::Fn(item)] => item.sig.ident == function,
        _ => false,
    });
    if !is_single_fn {
        return Composition::WholeFile(proposal.to_string());
    }

    let lines: Vec<&str> = live.split_inclusive('\n').collect();
    let start = span.start.saturating_sub(1).min(lines.len());
    let end = span.end.min(lines.len()).max(start);
    let indent: String = lines
        .get(start)
        .map(|l| l.chars().take_while(|c| *c == ' ' || *c == '\t').collect())
        .unwrap_or_default();

    let mut out = String::with_capacity(live.len() + proposal.len());
    lines[..start].iter().for_each(|l| out.push_str(l));
    out.push_str(&reindent(proposal, &indent));
    lines[end..].iter().for_each(|l| out.push_str(l));
    Composition::Spliced(out)
}

/// Strip the common indentation of `text` and prefix `indent`; always ends
/// with a newline.
fn reindent(text: &str, indent: &str) -> String {
    let trimmed = text.trim_matches('\n');
    let common = trimmed
        .lines()
        .filter(|l| !l.trim().is_empty())
        .map(|l| l.len() - l.trim_start().len())
        .min()
        .unwrap_or(0);
    let mut out = String::with_capacity(trimmed.len() + indent.len() * 8);
    for line in trimmed.lines() {
        if line.trim().is_empty() {
            out.push('\n');
            continue;
        }
        out.push_str(indent);
        out.push_str(line.get(common..).unwrap_or_else(|| line.trim_start()));
        out.push('\n');
    }
    out
}

// ─── Pipeline ────────────────────────────────────────────────────────────

/// The self-modification pipeline over one live tree.
#[derive(Clone)]
pub struct RewritePipeline {
    scanner: CandidateScanner,
    proposer: Arc<dyn RewriteProposer>,
    validator: SandboxValidator,
    swapper: LiveSwapper,
    lock: MutationLock,
    foreground: LockPolicy,
}

impl fmt::Debug for RewritePipeline {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RewritePipeline")
            .field("root", &self.scanner.root())
            .field("proposer", &self.proposer.name())
            .field("validator", &self.validator)
            .field("foreground", &self.foreground)
            .finish()
    }
}

impl RewritePipeline {
    /// Assemble a pipeline from its parts.
    pub fn new(
        scanner: CandidateScanner,
        proposer: Arc<dyn RewriteProposer>,
        validator: SandboxValidator,
        swapper: LiveSwapper,
        lock: MutationLock,
        foreground: LockPolicy,
    ) -> Self {
        Self {
            scanner,
            proposer,
            validator,
            swapper,
            lock,
            foreground,
        }
    }

    /// Build every component from `cfg`, sharing `lock` with the caller.
    pub fn from_config(cfg: &RewriteConfig, proposer: Arc<dyn RewriteProposer>, lock: MutationLock) -> Self {
        let root = cfg.workspace.root.clone();
        let filter = SourceFilter::new(cfg.workspace.extensions.clone(), cfg.workspace.exclude.clone());
        let validator = SandboxValidator::new(
            root.clone(),
            filter.clone(),
            build_checker(&cfg.checker),
            cfg.checker.timeout(),
        );
        let swapper = LiveSwapper::new(
            root.clone(),
            BackupStore::new(cfg.workspace.resolved_backup_dir()),
            Duration::from_secs(cfg.swap.io_timeout_secs),
        );
        Self::new(
            CandidateScanner::new(root, filter),
            proposer,
            validator,
            swapper,
            lock,
            LockPolicy::new("foreground", Duration::from_secs(cfg.lock.foreground_timeout_secs)),
        )
    }

    /// The shared mutation lock.
    pub fn lock(&self) -> &MutationLock {
        &self.lock
    }

    /// The live tree root.
    pub fn root(&self) -> &Path {
        self.scanner.root()
    }

    /// Read-only scan of the live tree. Takes no lock.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Scan`] only when the root cannot be walked.
    pub async fn reflect(&self) -> Result<ScanReport, PipelineError> {
        let scanner = self.scanner.clone();
        let report = tokio::task::spawn_blocking(move || scanner.scan())
            .await
            .map_err(|e| PipelineError::Worker(e.to_string()))??;
        tracing::info!(
            candidates = report.candidates.len(),
            failures = report.failures.len(),
            "scan: reflect finished"
        );
        Ok(report)
    }

    /// Ask the collaborator to rewrite `target`, validate, confirm, apply.
    pub async fn improve(&self, target: &str, instruction: &str, confirm: &dyn Confirm) -> PipelineOutcome {
        let outcome = self.improve_inner(target, instruction, confirm).await;
        self.finish("improve", outcome)
    }

    async fn improve_inner(&self, target: &str, instruction: &str, confirm: &dyn Confirm) -> PipelineOutcome {
        let report = match self.reflect().await {
            Ok(report) => report,
            Err(e) => return PipelineOutcome::TargetNotFound(e.to_string()),
        };
        let candidate: CandidateFunction = match report.resolve(target) {
            Ok(c) => c.clone(),
            Err(e) => return PipelineOutcome::TargetNotFound(e.to_string()),
        };
        let live_path = self.root().join(&candidate.file);
        let content = match tokio::fs::read_to_string(&live_path).await {
            Ok(c) => c,
            Err(e) => return PipelineOutcome::TargetNotFound(format!("{}: {e}", candidate.file.display())),
        };

        let description = describe_target(&candidate, &content);
        let started = Instant::now();
        let response = match self.proposer.propose(&description, instruction).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(function = %candidate.display_target(), error = %e, "propose: collaborator failed");
                return PipelineOutcome::CollaboratorUnavailable(e.to_string());
            }
        };
        let proposal = RewriteProposal {
            file: candidate.file.clone(),
            function: Some(candidate.qualified_name()),
            instruction: instruction.to_string(),
            text: extract_code(&response),
        };
        tracing::info!(
            function = %candidate.display_target(),
            proposer = self.proposer.name(),
            bytes = proposal.text.len(),
            elapsed_ms = started.elapsed().as_millis() as u64,
            "propose: proposal received"
        );

        let guard = match self.lock.acquire(&self.foreground.holder, self.foreground.timeout).await {
            Ok(g) => g,
            Err(e) => return PipelineOutcome::LockUnavailable(e.to_string()),
        };

        // The file may have changed while the collaborator was thinking.
        let current = match tokio::fs::read_to_string(&live_path).await {
            Ok(c) => c,
            Err(e) => return PipelineOutcome::TargetNotFound(format!("{}: {e}", candidate.file.display())),
        };
        let Some(span) = current_span(&candidate, &current) else {
            return PipelineOutcome::Rejected(ValidationOutcome::RejectedApply(format!(
                "{} is no longer present in {}",
                candidate.qualified_name(),
                candidate.file.display()
            )));
        };

        let composed = compose(&current, &candidate.function, span, &proposal.text);
        let new_content = composed.content();
        if new_content == current {
            return PipelineOutcome::Unchanged;
        }

        let outcome = match self.validate_file(&proposal.file, new_content).await {
            Ok(o) => o,
            Err(e) => return PipelineOutcome::SandboxFailure(e.to_string()),
        };
        if !outcome.is_valid() {
            return PipelineOutcome::Rejected(outcome);
        }

        let summary = ChangeSummary {
            operation: "improve".to_string(),
            files: vec![proposal.file.clone()],
            diff: render_diff(&proposal.file, &current, new_content),
        };
        if !confirm.confirm(&summary).await {
            return PipelineOutcome::Declined;
        }

        swap_outcome(self.swapper.apply(&proposal.file, new_content, guard).await.map(|r| vec![r]))
    }

    /// Whole-tree validation of a diff; never writes.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Sandbox`] when the sandbox cannot run.
    pub async fn validate_patch(&self, diff: &str) -> Result<ValidationOutcome, PipelineError> {
        let started = Instant::now();
        let (outcome, _) = self.validator.validate_patch(diff).await?;
        metrics::record_validation("patch", outcome.label(), started.elapsed());
        Ok(outcome)
    }

    /// Validate and, on confirmation, apply a diff as the foreground user.
    pub async fn apply_patch(&self, diff: &str, confirm: &dyn Confirm) -> PipelineOutcome {
        let policy = self.foreground.clone();
        self.apply_patch_as(&policy, diff, confirm).await
    }

    /// Validate and, on confirmation, apply a diff under `policy`.
    pub async fn apply_patch_as(&self, policy: &LockPolicy, diff: &str, confirm: &dyn Confirm) -> PipelineOutcome {
        let outcome = self.apply_patch_inner(policy, diff, confirm).await;
        self.finish("apply_patch", outcome)
    }

    async fn apply_patch_inner(&self, policy: &LockPolicy, diff: &str, confirm: &dyn Confirm) -> PipelineOutcome {
        let guard = match self.lock.acquire(&policy.holder, policy.timeout).await {
            Ok(g) => g,
            Err(e) => return PipelineOutcome::LockUnavailable(e.to_string()),
        };

        let started = Instant::now();
        let (outcome, patch) = match self.validator.validate_patch(diff).await {
            Ok(v) => v,
            Err(e) => return PipelineOutcome::SandboxFailure(e.to_string()),
        };
        metrics::record_validation("patch", outcome.label(), started.elapsed());
        let Some(patch) = patch.filter(|_| outcome.is_valid()) else {
            return PipelineOutcome::Rejected(outcome);
        };

        // Same plan function as the sandbox, now against the live tree.
        let root = self.root().to_path_buf();
        let plan = match tokio::task::spawn_blocking(move || patch.plan(&root)).await {
            Ok(Ok(plan)) => plan,
            Ok(Err(e)) => return PipelineOutcome::Rejected(ValidationOutcome::RejectedApply(e.to_string())),
            Err(e) => return PipelineOutcome::SandboxFailure(e.to_string()),
        };
        if plan_is_noop(self.root(), &plan).await {
            return PipelineOutcome::Unchanged;
        }

        let summary = ChangeSummary {
            operation: "apply_patch".to_string(),
            files: plan.changes.iter().map(|c| c.path().to_path_buf()).collect(),
            diff: diff.to_string(),
        };
        if !confirm.confirm(&summary).await {
            return PipelineOutcome::Declined;
        }

        swap_outcome(self.swapper.apply_plan(&plan, guard).await)
    }

    /// Compile-check a pristine copy of the live tree under `policy`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Lock`] or [`PipelineError::Sandbox`].
    pub async fn self_check_as(&self, policy: &LockPolicy) -> Result<ValidationOutcome, PipelineError> {
        let _guard = self.lock.acquire(&policy.holder, policy.timeout).await?;
        let started = Instant::now();
        let outcome = self.validator.validate_tree().await?;
        metrics::record_validation("tree", outcome.label(), started.elapsed());
        if outcome.is_valid() {
            tracing::info!(holder = %policy.holder, "validate: live tree is clean");
        } else {
            tracing::warn!(holder = %policy.holder, outcome = %outcome, "validate: live tree fails compile-check");
        }
        Ok(outcome)
    }

    /// Compile-check the live tree as the foreground user.
    ///
    /// # Errors
    ///
    /// As for [`RewritePipeline::self_check_as`].
    pub async fn self_check(&self) -> Result<ValidationOutcome, PipelineError> {
        let policy = self.foreground.clone();
        self.self_check_as(&policy).await
    }

    /// Backup artifacts, oldest first, optionally only those for `target`.
    ///
    /// # Errors
    ///
    /// [`PipelineError::Backups`] if the directory cannot be read.
    pub async fn list_backups(&self, target: Option<&Path>) -> Result<Vec<BackupArtifact>, PipelineError> {
        let store = self.swapper.backups().clone();
        let target = target.map(Path::to_path_buf);
        tokio::task::spawn_blocking(move || match target {
            Some(t) => store.list_for(&t),
            None => store.list(),
        })
        .await
        .map_err(|e| PipelineError::Worker(e.to_string()))?
        .map_err(PipelineError::Backups)
    }

    /// Restore `artifact` through the normal validate, backup, swap path.
    pub async fn rollback(&self, artifact: &BackupArtifact, confirm: &dyn Confirm) -> PipelineOutcome {
        let outcome = self.rollback_inner(artifact, confirm).await;
        self.finish("rollback", outcome)
    }

    async fn rollback_inner(&self, artifact: &BackupArtifact, confirm: &dyn Confirm) -> PipelineOutcome {
        let restored = match tokio::fs::read_to_string(&artifact.path).await {
            Ok(c) => c,
            Err(e) => return PipelineOutcome::TargetNotFound(format!("{}: {e}", artifact.path.display())),
        };
        let guard = match self.lock.acquire(&self.foreground.holder, self.foreground.timeout).await {
            Ok(g) => g,
            Err(e) => return PipelineOutcome::LockUnavailable(e.to_string()),
        };
        let current = match tokio::fs::read_to_string(self.root().join(&artifact.target)).await {
            Ok(c) => c,
            Err(e) => return PipelineOutcome::TargetNotFound(format!("{}: {e}", artifact.target.display())),
        };
        if current == restored {
            return PipelineOutcome::Unchanged;
        }

        let outcome = match self.validate_file(&artifact.target, &restored).await {
            Ok(o) => o,
            Err(e) => return PipelineOutcome::SandboxFailure(e.to_string()),
        };
        if !outcome.is_valid() {
            return PipelineOutcome::Rejected(outcome);
        }

        let summary = ChangeSummary {
            operation: "rollback".to_string(),
            files: vec![artifact.target.clone()],
            diff: render_diff(&artifact.target, &current, &restored),
        };
        if !confirm.confirm(&summary).await {
            return PipelineOutcome::Declined;
        }
        swap_outcome(self.swapper.apply(&artifact.target, &restored, guard).await.map(|r| vec![r]))
    }

    async fn validate_file(&self, target: &Path, content: &str) -> Result<ValidationOutcome, SandboxError> {
        let started = Instant::now();
        let outcome = self.validator.validate_content(target, content).await?;
        metrics::record_validation("file", outcome.label(), started.elapsed());
        Ok(outcome)
    }

    fn finish(&self, operation: &str, outcome: PipelineOutcome) -> PipelineOutcome {
        metrics::record_outcome(operation, outcome.label());
        match &outcome {
            PipelineOutcome::SwapFailure(reason) => {
                tracing::error!(operation, reason = %reason, "swap: live tree left in an unspecified state");
            }
            PipelineOutcome::Rejected(v) => {
                tracing::warn!(operation, outcome = v.label(), "validate: change rejected");
            }
            PipelineOutcome::Applied { files, .. } => {
                tracing::info!(operation, files = files.len(), "pipeline: change applied");
            }
            other => tracing::info!(operation, outcome = other.label(), "pipeline: finished"),
        }
        outcome
    }
}

/// Find the target function again in the current content.
fn current_span(candidate: &CandidateFunction, current: &str) -> Option<LineSpan> {
    let wanted = candidate.qualified_name();
    extract_candidates(&candidate.file, current)
        .ok()?
        .into_iter()
        .filter(|c| c.qualified_name() == wanted)
        .min_by_key(|c| c.span.start.abs_diff(candidate.span.start))
        .map(|c| c.span)
}

async fn plan_is_noop(root: &Path, plan: &PatchPlan) -> bool {
    for change in &plan.changes {
        match change {
            FileChange::Delete { .. } => return false,
            FileChange::Write { path, content } => match tokio::fs::read_to_string(root.join(path)).await {
                Ok(existing) if existing == *content => {}
                _ => return false,
            },
        }
    }
    true
}

fn swap_outcome(result: Result<Vec<SwapReceipt>, SwapError>) -> PipelineOutcome {
    match result {
        Ok(receipts) => PipelineOutcome::Applied {
            files: receipts.iter().map(|r| r.target.clone()).collect(),
            backups: receipts
                .iter()
                .filter_map(|r| r.backup.as_ref().map(|b| b.path.clone()))
                .collect(),
        },
        Err(e) if e.is_degraded() => {
            metrics::record_swap_failure("swap");
            PipelineOutcome::SwapFailure(e.to_string())
        }
        Err(e) => {
            metrics::record_swap_failure("backup");
            PipelineOutcome::BackupFailure(e.to_string())
        }
    }
}
