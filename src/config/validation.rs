//! Configuration validation engine.
//!
//! ## Responsibility
//! Validate semantic constraints on a parsed [`RewriteConfig`] that cannot
//! be expressed through the type system alone (range checks, cross-field
//! invariants such as "the command checker needs a program").
//!
//! ## Guarantees
//! - Every validation rule has at least one test that triggers it
//! - Validation collects *all* errors before returning (no short-circuit)
//! - Error messages include the field path and the invalid value
//!
//! ## NOT Responsible For
//! - Parsing TOML (that belongs to `loader`)
//! - File I/O (that belongs to `loader`)

use super::{CheckerKind, ProposerKind, RewriteConfig};

/// Errors arising from configuration parsing, validation, or I/O.
///
/// # Panics
///
/// This type never panics.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// TOML parsing failed.
    #[error("Parse error in {file}: {source}")]
    Parse {
        /// Path of the file that failed to parse.
        file: String,
        /// Underlying TOML deserialization error.
        #[source]
        source: toml::de::Error,
    },

    /// One or more semantic validation rules failed.
    #[error("Validation failed: {0}")]
    Validation(String),

    /// A specific field has an out-of-range or contradictory value.
    #[error("Field '{field}' has invalid value {value}: {reason}")]
    InvalidField {
        /// Dot-separated field path (e.g., "proposer.retry_base_ms").
        field: String,
        /// String representation of the invalid value.
        value: String,
        /// Human-readable explanation of the constraint.
        reason: String,
    },

    /// File I/O error.
    #[error("IO error reading {file}: {source}")]
    Io {
        /// Path of the file that could not be read.
        file: String,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

fn invalid(field: &str, value: impl ToString, reason: &str) -> ConfigError {
    ConfigError::InvalidField {
        field: field.into(),
        value: value.to_string(),
        reason: reason.into(),
    }
}

/// Validate all semantic constraints on a [`RewriteConfig`].
///
/// Collects every violation before returning so the caller sees the full
/// scope of issues at once.
///
/// # Returns
///
/// - `Ok(())` if all constraints pass.
/// - `Err(Vec<ConfigError>)` with every violation found.
///
/// # Panics
///
/// This function never panics.
pub fn validate(config: &RewriteConfig) -> Result<(), Vec<ConfigError>> {
    let mut errors = Vec::new();

    // ── Workspace ────────────────────────────────────────────────────
    if config.workspace.extensions.is_empty() {
        errors.push(invalid(
            "workspace.extensions",
            "[]",
            "at least one source extension is required",
        ));
    }
    for ext in &config.workspace.extensions {
        if ext.starts_with('.') || ext.trim().is_empty() {
            errors.push(invalid(
                "workspace.extensions",
                ext,
                "extensions are written without a leading dot",
            ));
        }
    }
    if config.workspace.backup_dir.as_os_str().is_empty() {
        errors.push(invalid(
            "workspace.backup_dir",
            "\"\"",
            "backup directory must not be empty",
        ));
    }

    // ── Checker ──────────────────────────────────────────────────────
    if config.checker.timeout_secs == 0 {
        errors.push(invalid("checker.timeout_secs", 0, "must be at least 1 second"));
    }
    if config.checker.max_output_bytes == 0 {
        errors.push(invalid("checker.max_output_bytes", 0, "must be at least 1"));
    }
    if config.checker.kind == CheckerKind::Command {
        let missing = config
            .checker
            .program
            .as_deref()
            .map(|p| p.trim().is_empty())
            .unwrap_or(true);
        if missing {
            errors.push(invalid(
                "checker.program",
                "<unset>",
                "the command checker needs a program",
            ));
        }
    }

    // ── Proposer ─────────────────────────────────────────────────────
    if config.proposer.kind != ProposerKind::Offline {
        if config.proposer.model.trim().is_empty() {
            errors.push(invalid("proposer.model", "\"\"", "model name must not be empty"));
        }
        if config
            .proposer
            .endpoint
            .as_deref()
            .map_or(false, |e| e.trim().is_empty())
        {
            errors.push(invalid("proposer.endpoint", "\"\"", "endpoint must not be empty"));
        }
    }
    if config.proposer.timeout_secs == 0 {
        errors.push(invalid("proposer.timeout_secs", 0, "must be at least 1 second"));
    }
    if config.proposer.max_attempts == 0 {
        errors.push(invalid("proposer.max_attempts", 0, "must be at least 1"));
    }
    if config.proposer.retry_base_ms > config.proposer.retry_max_ms {
        errors.push(invalid(
            "proposer.retry_base_ms",
            config.proposer.retry_base_ms,
            "must be \u{2264} retry_max_ms",
        ));
    }
    if !(0.0..=2.0).contains(&config.proposer.temperature) {
        errors.push(invalid(
            "proposer.temperature",
            config.proposer.temperature,
            "must be between 0.0 and 2.0",
        ));
    }

    // ── Lock / swap ──────────────────────────────────────────────────
    if config.lock.foreground_timeout_secs == 0 {
        errors.push(invalid("lock.foreground_timeout_secs", 0, "must be at least 1 second"));
    }
    if config.lock.background_timeout_secs == 0 {
        errors.push(invalid("lock.background_timeout_secs", 0, "must be at least 1 second"));
    }
    if config.swap.io_timeout_secs == 0 {
        errors.push(invalid("swap.io_timeout_secs", 0, "must be at least 1 second"));
    }

    // ── Scheduler ────────────────────────────────────────────────────
    if config.scheduler.poll_interval_secs == 0 {
        errors.push(invalid("scheduler.poll_interval_secs", 0, "must be at least 1 second"));
    }
    if config.scheduler.task_timeout_secs == 0 {
        errors.push(invalid("scheduler.task_timeout_secs", 0, "must be at least 1 second"));
    }
    if config.scheduler.self_check.enabled && config.scheduler.self_check.interval_secs == 0 {
        errors.push(invalid(
            "scheduler.self_check.interval_secs",
            0,
            "must be at least 1 second when the task is enabled",
        ));
    }
    if config.scheduler.patch_queue.enabled && config.scheduler.patch_queue.interval_secs == 0 {
        errors.push(invalid(
            "scheduler.patch_queue.interval_secs",
            0,
            "must be at least 1 second when the task is enabled",
        ));
    }

    if errors.is_empty() {
        Ok(())
    } else {
        Err(errors)
    }
}
