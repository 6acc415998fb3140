//! # Sandbox Validator
//!
//! Decides whether proposed code is acceptable without touching the live
//! tree.
//!
//! ## Modes
//!
//! - **Single-file**: the proposed content is written to an isolated
//!   temporary file (named like the target) and compile-checked alone.
//!   Whitespace-only content is [`ValidationOutcome::RejectedEmpty`] without
//!   running the checker.
//! - **Whole-tree**: the live tree is copied into a fresh temporary
//!   directory, the diff is applied there, and *every* source file in the
//!   copy is compile-checked, not only the touched ones.
//!
//! A checker timeout is a rejection, not an error: it becomes
//! [`ValidationOutcome::RejectedParse`] with a timeout message.

pub mod check;
pub mod patch;
pub mod tree;

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

use crate::scanner::{ScanError, SourceFilter};
use check::{CheckError, CompileCheck};
use patch::{Patch, PatchPlan};

/// One compile-check finding.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDiagnostic {
    /// File the finding belongs to, relative to the tree root.
    pub file: PathBuf,
    /// 1-based line, when known.
    pub line: Option<usize>,
    /// Checker message.
    pub message: String,
}

impl fmt::Display for FileDiagnostic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.line {
            Some(line) => write!(f, "{}:{}: {}", self.file.display(), line, self.message),
            None => write!(f, "{}: {}", self.file.display(), self.message),
        }
    }
}

/// Tagged result of validating a proposed change.
///
/// Never partially valid: whole-tree validation is all-or-nothing across
/// every file in the tree.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ValidationOutcome {
    /// The change compile-checks cleanly.
    Valid,
    /// One or more files fail the compile-check.
    RejectedParse(Vec<FileDiagnostic>),
    /// The diff does not apply (context mismatch, missing target).
    RejectedApply(String),
    /// The proposed content is empty or whitespace only.
    RejectedEmpty,
}

impl ValidationOutcome {
    /// True only for [`ValidationOutcome::Valid`].
    pub fn is_valid(&self) -> bool {
        matches!(self, Self::Valid)
    }

    /// Short label used in logs and metrics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Valid => "valid",
            Self::RejectedParse(_) => "rejected_parse",
            Self::RejectedApply(_) => "rejected_apply",
            Self::RejectedEmpty => "rejected_empty",
        }
    }
}

impl fmt::Display for ValidationOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Valid => write!(f, "valid"),
            Self::RejectedEmpty => write!(f, "rejected: proposed content is empty"),
            Self::RejectedApply(reason) => write!(f, "rejected: patch does not apply: {reason}"),
            Self::RejectedParse(diagnostics) => {
                write!(f, "rejected: {} compile-check failure(s)", diagnostics.len())?;
                for d in diagnostics {
                    write!(f, "\n  {d}")?;
                }
                Ok(())
            }
        }
    }
}

// ─── Error ───────────────────────────────────────────────────────────────

/// Failures of the sandbox machinery itself (not of the proposed code).
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Filesystem work on the sandbox failed.
    #[error("sandbox {context}: {source}")]
    Io {
        /// What was being done.
        context: String,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The checker could not run.
    #[error(transparent)]
    Check(#[from] CheckError),

    /// The live tree could not be enumerated.
    #[error(transparent)]
    Scan(#[from] ScanError),

    /// Writing the patched files into the sandbox failed.
    #[error("sandbox apply: {0}")]
    Apply(String),
}

impl SandboxError {
    pub(crate) fn io(context: &str, source: std::io::Error) -> Self {
        Self::Io {
            context: context.to_string(),
            source,
        }
    }
}

// ─── Validator ───────────────────────────────────────────────────────────

/// Validates proposed changes against a live tree it never writes.
#[derive(Clone)]
pub struct SandboxValidator {
    root: PathBuf,
    filter: SourceFilter,
    checker: Arc<dyn CompileCheck>,
    check_timeout: Duration,
}

impl fmt::Debug for SandboxValidator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SandboxValidator")
            .field("root", &self.root)
            .field("checker", &self.checker.name())
            .field("check_timeout", &self.check_timeout)
            .finish()
    }
}

impl SandboxValidator {
    /// Create a validator for the tree at `root`.
    pub fn new(
        root: impl Into<PathBuf>,
        filter: SourceFilter,
        checker: Arc<dyn CompileCheck>,
        check_timeout: Duration,
    ) -> Self {
        Self {
            root: root.into(),
            filter,
            checker,
            check_timeout,
        }
    }

    /// The live tree root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Single-file mode: compile-check `content` alone.
    ///
    /// `target` (relative to the root) names the temp file and the
    /// diagnostics; the live file is never read or written.
    ///
    /// # Errors
    ///
    /// [`SandboxError`] when the temp file cannot be written or the checker
    /// cannot run.
    pub async fn validate_content(&self, target: &Path, content: &str) -> Result<ValidationOutcome, SandboxError> {
        if content.trim().is_empty() {
            tracing::warn!(file = %target.display(), "validate: empty proposal rejected");
            return Ok(ValidationOutcome::RejectedEmpty);
        }

        let scratch = tempfile::Builder::new()
            .prefix("self-rewrite-file-")
            .tempdir()
            .map_err(|e| SandboxError::io("create temp dir", e))?;
        let name = target.file_name().map_or_else(|| PathBuf::from("candidate"), PathBuf::from);
        let path = scratch.path().join(&name);
        tokio::fs::write(&path, content)
            .await
            .map_err(|e| SandboxError::io("write candidate", e))?;

        let outcome = match tokio::time::timeout(self.check_timeout, self.checker.check_file(&path)).await {
            Err(_) | Ok(Err(CheckError::Timeout(_))) => timeout_outcome(target, self.check_timeout),
            Ok(Err(e)) => return Err(e.into()),
            Ok(Ok(diagnostics)) if diagnostics.is_empty() => ValidationOutcome::Valid,
            Ok(Ok(diagnostics)) => ValidationOutcome::RejectedParse(
                diagnostics
                    .into_iter()
                    .map(|d| FileDiagnostic {
                        file: target.to_path_buf(),
                        ..d
                    })
                    .collect(),
            ),
        };

        tracing::info!(
            file = %target.display(),
            checker = self.checker.name(),
            outcome = outcome.label(),
            "validate: single-file check finished"
        );
        Ok(outcome)
    }

    /// Whole-tree mode: apply `diff` to a pristine copy and check everything.
    ///
    /// On `Valid` the parsed [`Patch`] is returned so the caller can re-plan
    /// it against the live tree.
    ///
    /// # Errors
    ///
    /// [`SandboxError`] when the copy cannot be made or the checker cannot
    /// run.
    pub async fn validate_patch(&self, diff: &str) -> Result<(ValidationOutcome, Option<Patch>), SandboxError> {
        if diff.trim().is_empty() {
            tracing::warn!("validate: empty patch rejected");
            return Ok((ValidationOutcome::RejectedEmpty, None));
        }
        let patch = match Patch::parse(diff) {
            Ok(patch) => patch,
            Err(e) => {
                tracing::warn!(error = %e, "validate: patch rejected before apply");
                return Ok((ValidationOutcome::RejectedApply(e.to_string()), None));
            }
        };

        let root = self.root.clone();
        let filter = self.filter.clone();
        let planned = patch.clone();
        let prepared = tokio::task::spawn_blocking(move || prepare_patched_copy(&root, &filter, &planned))
            .await
            .map_err(|e| SandboxError::Apply(e.to_string()))??;

        let (sandbox, files) = match prepared {
            Prepared::Rejected(reason) => {
                tracing::warn!(reason = %reason, "validate: patch does not apply");
                return Ok((ValidationOutcome::RejectedApply(reason), None));
            }
            Prepared::Ready { sandbox, files } => (sandbox, files),
        };

        let outcome = self.check_tree(sandbox.path(), &files).await?;
        tracing::info!(
            touched = patch.touched_files().len(),
            checked = files.len(),
            outcome = outcome.label(),
            "validate: whole-tree check finished"
        );
        drop(sandbox);

        if outcome.is_valid() {
            Ok((outcome, Some(patch)))
        } else {
            Ok((outcome, None))
        }
    }

    /// Compile-check a pristine copy of the live tree with no changes.
    ///
    /// # Errors
    ///
    /// As for [`SandboxValidator::validate_patch`].
    pub async fn validate_tree(&self) -> Result<ValidationOutcome, SandboxError> {
        let root = self.root.clone();
        let filter = self.filter.clone();
        let (sandbox, files) = tokio::task::spawn_blocking(move || -> Result<_, SandboxError> {
            let sandbox = tree::copy_tree(&root, &filter)?;
            let (files, _) = filter.collect(sandbox.path())?;
            Ok((sandbox, files))
        })
        .await
        .map_err(|e| SandboxError::Apply(e.to_string()))??;

        let outcome = self.check_tree(sandbox.path(), &files).await?;
        tracing::info!(checked = files.len(), outcome = outcome.label(), "validate: self-check finished");
        Ok(outcome)
    }

    async fn check_tree(&self, sandbox: &Path, files: &[PathBuf]) -> Result<ValidationOutcome, SandboxError> {
        match tokio::time::timeout(self.check_timeout, self.checker.check_tree(sandbox, files)).await {
            Err(_) | Ok(Err(CheckError::Timeout(_))) => Ok(timeout_outcome(Path::new("."), self.check_timeout)),
            Ok(Err(e)) => Err(e.into()),
            Ok(Ok(diagnostics)) if diagnostics.is_empty() => Ok(ValidationOutcome::Valid),
            Ok(Ok(diagnostics)) => Ok(ValidationOutcome::RejectedParse(diagnostics)),
        }
    }
}

enum Prepared {
    Rejected(String),
    Ready {
        sandbox: tempfile::TempDir,
        files: Vec<PathBuf>,
    },
}

fn prepare_patched_copy(root: &Path, filter: &SourceFilter, patch: &Patch) -> Result<Prepared, SandboxError> {
    let sandbox = tree::copy_tree(root, filter)?;
    let plan: PatchPlan = match patch.plan(sandbox.path()) {
        Ok(plan) => plan,
        Err(e) => return Ok(Prepared::Rejected(e.to_string())),
    };
    plan.apply_to(sandbox.path())
        .map_err(|e| SandboxError::Apply(e.to_string()))?;
    let (files, _) = filter.collect(sandbox.path())?;
    Ok(Prepared::Ready { sandbox, files })
}

fn timeout_outcome(file: &Path, timeout: Duration) -> ValidationOutcome {
    ValidationOutcome::RejectedParse(vec![FileDiagnostic {
        file: file.to_path_buf(),
        line: None,
        message: format!("compile-check timed out after {timeout:?}"),
    }])
}
