//! # Rewrite Proposal Port
//!
//! The boundary to the external text generator that proposes replacement
//! code. Everything that crosses this boundary is untrusted: the returned
//! text may be valid code, prose, or garbage, and only the sandbox decides.
//!
//! ## Responsibility
//! - Define the [`RewriteProposer`] trait and its failure taxonomy
//! - Build the prompt context for one [`CandidateFunction`]
//! - Unwrap Markdown code fences from responses
//!
//! ## Guarantees
//! - Timeouts and transport errors surface as [`ProposalError`], never as
//!   empty or placeholder text
//! - Implementations are `Send + Sync` and usable as `Arc<dyn RewriteProposer>`
//!
//! ## NOT Responsible For
//! - Validation of the returned text (that belongs to `sandbox`)

pub mod http;
pub mod retry;

use std::collections::VecDeque;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use thiserror::Error;

use crate::config::{ProposerConfig, ProposerKind};
use crate::scanner::CandidateFunction;

pub use http::{AnthropicProposer, OpenAiProposer};
pub use retry::{RetryPolicy, RetryingProposer};

/// Instruction used by `improve` when the user gives none.
pub const DEFAULT_INSTRUCTION: &str =
    "Improve clarity, safety, or performance if possible, and document the function.";

/// System prompt sent with every request.
pub const SYSTEM_PROMPT: &str = "You rewrite Rust functions inside a running program. \
Respond ONLY with the complete updated function as valid Rust source, including its doc comment. \
Do not add explanations.";

/// Failures of the proposal collaborator.
#[derive(Debug, Error)]
pub enum ProposalError {
    /// The request did not complete within its deadline.
    #[error("collaborator timed out after {0:?}")]
    Timeout(Duration),

    /// Connection, DNS or TLS failure.
    #[error("collaborator transport error: {0}")]
    Transport(String),

    /// The collaborator answered with a non-success status.
    #[error("collaborator returned HTTP {status}: {body}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Response body (possibly truncated).
        body: String,
    },

    /// The response could not be decoded or had no content.
    #[error("malformed collaborator response: {0}")]
    Malformed(String),

    /// No collaborator is configured (missing key, offline mode).
    #[error("collaborator not configured: {0}")]
    NotConfigured(String),
}

impl ProposalError {
    /// True for failures worth another attempt: timeouts, transport
    /// errors, HTTP 429 and 5xx.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Timeout(_) | Self::Transport(_) => true,
            Self::Api { status, .. } => *status == 429 || (500..=599).contains(status),
            Self::Malformed(_) | Self::NotConfigured(_) => false,
        }
    }
}

/// Abstract text-generation collaborator.
///
/// Implementations must be thread-safe (Send + Sync) for use across tasks.
#[async_trait]
pub trait RewriteProposer: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Ask for replacement text for the described target.
    async fn propose(&self, target_description: &str, instruction: &str) -> Result<String, ProposalError>;
}

/// Proposed replacement text for one file, untrusted until validated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RewriteProposal {
    /// Target file, relative to the workspace root.
    pub file: PathBuf,
    /// Target function, when the proposal is meant to replace one function.
    pub function: Option<String>,
    /// What was asked for.
    pub instruction: String,
    /// Proposed text, with code fences already removed.
    pub text: String,
}

/// Describe `candidate` for the collaborator, including its current source.
pub fn describe_target(candidate: &CandidateFunction, file_content: &str) -> String {
    let body: String = file_content
        .lines()
        .skip(candidate.span.start.saturating_sub(1))
        .take((candidate.span.end + 1).saturating_sub(candidate.span.start.max(1)))
        .collect::<Vec<_>>()
        .join("\n");
    let doc = if candidate.doc.is_empty() {
        "(none)"
    } else {
        candidate.doc.as_str()
    };
    format!(
        "File: {}\nFunction: {}\nParameters: {}\nDocumentation: {}\n\nCurrent source:\n```rust\n{}\n```",
        candidate.file.display(),
        candidate.qualified_name(),
        candidate.args.join(", "),
        doc,
        body
    )
}

/// Strip a Markdown code fence if the response contains one.
///
/// The first fenced block wins; an unterminated fence runs to the end of
/// the text. Unfenced text is returned unchanged.
pub fn extract_code(response: &str) -> String {
    let mut lines = response.lines();
    let mut found_open = false;
    for line in lines.by_ref() {
        if line.trim_start().starts_with("```") {
            found_open = true;
            break;
        }
    }
    if !found_open {
        return response.to_string();
    }

    let mut body = Vec::new();
    for line in lines {
        if line.trim_start().starts_with("```") {
            break;
        }
        body.push(line);
    }
    let mut code = body.join("\n");
    code.push('\n');
    code
}

/// Build the configured collaborator, wrapped in the retry policy.
///
/// # Errors
///
/// [`ProposalError::NotConfigured`] when the API key variable is unset.
pub fn build_proposer(cfg: &ProposerConfig) -> Result<Arc<dyn RewriteProposer>, ProposalError> {
    let inner: Arc<dyn RewriteProposer> = match cfg.kind {
        ProposerKind::OpenAi => Arc::new(OpenAiProposer::from_config(cfg)?),
        ProposerKind::Anthropic => Arc::new(AnthropicProposer::from_config(cfg)?),
        ProposerKind::Offline => return Ok(Arc::new(OfflineProposer)),
    };
    if cfg.max_attempts <= 1 {
        return Ok(inner);
    }
    Ok(Arc::new(RetryingProposer::new(inner, RetryPolicy::from_config(cfg))))
}

// ── Offline ──────────────────────────────────────────────────────────────

/// Collaborator used when none is configured: every call fails.
#[derive(Debug, Default, Clone, Copy)]
pub struct OfflineProposer;

#[async_trait]
impl RewriteProposer for OfflineProposer {
    fn name(&self) -> &str {
        "offline"
    }

    async fn propose(&self, _target: &str, _instruction: &str) -> Result<String, ProposalError> {
        Err(ProposalError::NotConfigured("running in offline mode".to_string()))
    }
}

// ── Scripted ─────────────────────────────────────────────────────────────

/// Replays a fixed sequence of responses; records every call.
///
/// Useful for demos and tests that need a deterministic collaborator.
#[derive(Debug, Default)]
pub struct ScriptedProposer {
    script: Mutex<VecDeque<Result<String, ProposalError>>>,
    calls: Mutex<Vec<(String, String)>>,
}

impl ScriptedProposer {
    /// Replay `responses` in order.
    pub fn new(responses: Vec<Result<String, ProposalError>>) -> Self {
        Self {
            script: Mutex::new(responses.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    /// Answer once with `text`, then report exhaustion.
    pub fn once(text: impl Into<String>) -> Self {
        Self::new(vec![Ok(text.into())])
    }

    /// `(target_description, instruction)` for every call so far.
    pub fn calls(&self) -> Vec<(String, String)> {
        self.calls.lock().clone()
    }
}

#[async_trait]
impl RewriteProposer for ScriptedProposer {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn propose(&self, target_description: &str, instruction: &str) -> Result<String, ProposalError> {
        self.calls
            .lock()
            .push((target_description.to_string(), instruction.to_string()));
        self.script
            .lock()
            .pop_front()
            .unwrap_or_else(|| Err(ProposalError::NotConfigured("script exhausted".to_string())))
    }
}
