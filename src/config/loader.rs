//! Configuration file loading.
//!
//! ## Responsibility
//! Read a TOML file from disk, parse it into a [`RewriteConfig`], apply the
//! `SELF_REWRITE_*` environment overrides, and run validation before
//! returning. This is the entry point the front end uses at startup.
//!
//! ## Guarantees
//! - A successfully loaded config is always validated
//! - Environment overrides are applied before validation, never after
//! - I/O errors and parse errors are distinguished in the error type
//! - File path is included in every error message
//!
//! ## NOT Responsible For
//! - Defining the config schema (that belongs to `mod.rs`)
//! - Semantic rules (that belongs to `validation`)

use std::path::{Path, PathBuf};

use super::validation::{self, ConfigError};
use super::RewriteConfig;

/// Overrides `workspace.root`.
pub const ENV_ROOT: &str = "SELF_REWRITE_ROOT";
/// Overrides `workspace.backup_dir`.
pub const ENV_BACKUP_DIR: &str = "SELF_REWRITE_BACKUP_DIR";
/// Overrides `proposer.model`.
pub const ENV_MODEL: &str = "SELF_REWRITE_MODEL";

/// Load a [`RewriteConfig`] from a TOML file.
///
/// Reads the file, parses it as TOML, applies environment overrides and
/// validates all semantic constraints.
///
/// # Returns
///
/// - `Ok(RewriteConfig)` if the file is readable, well-formed, and valid.
/// - `Err(ConfigError::Io)` if the file cannot be read.
/// - `Err(ConfigError::Parse)` if the TOML is malformed.
/// - `Err(ConfigError::Validation)` if semantic constraints are violated.
///
/// # Panics
///
/// This function never panics.
///
/// # Example
///
/// ```rust,ignore
/// use self_rewrite_orchestrator::config::loader::load_from_file;
/// use std::path::Path;
///
/// let config = load_from_file(Path::new("rewrite.toml"))?;
/// println!("workspace root: {}", config.workspace.root.display());
/// ```
pub fn load_from_file(path: &Path) -> Result<RewriteConfig, ConfigError> {
    let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Io {
        file: path.display().to_string(),
        source: e,
    })?;

    load_from_str(&content, &path.display().to_string())
}

/// Load a [`RewriteConfig`] from a TOML string.
///
/// # Arguments
///
/// * `content`: TOML content as a string.
/// * `source_name`: Identifier for the source (used in error messages).
///
/// # Panics
///
/// This function never panics.
pub fn load_from_str(content: &str, source_name: &str) -> Result<RewriteConfig, ConfigError> {
    let config: RewriteConfig = toml::from_str(content).map_err(|e| ConfigError::Parse {
        file: source_name.to_string(),
        source: e,
    })?;

    finish(config, |key| std::env::var(key).ok())
}

/// Build the effective configuration when no file was given: defaults plus
/// environment overrides, validated.
///
/// # Panics
///
/// This function never panics.
pub fn load_default() -> Result<RewriteConfig, ConfigError> {
    finish(RewriteConfig::default(), |key| std::env::var(key).ok())
}

fn finish<F>(mut config: RewriteConfig, lookup: F) -> Result<RewriteConfig, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    apply_env_overrides(&mut config, lookup);

    validation::validate(&config).map_err(|errors| {
        ConfigError::Validation(
            errors
                .iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join("\n"),
        )
    })?;

    Ok(config)
}

/// Apply `SELF_REWRITE_*` overrides using `lookup` to read variables.
///
/// Empty values are ignored so an exported-but-blank variable does not
/// clobber the file setting.
pub fn apply_env_overrides<F>(config: &mut RewriteConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());

    if let Some(root) = get(ENV_ROOT) {
        tracing::debug!(root = %root, "workspace root overridden from environment");
        config.workspace.root = PathBuf::from(root);
    }
    if let Some(dir) = get(ENV_BACKUP_DIR) {
        tracing::debug!(backup_dir = %dir, "backup dir overridden from environment");
        config.workspace.backup_dir = PathBuf::from(dir);
    }
    if let Some(model) = get(ENV_MODEL) {
        tracing::debug!(model = %model, "model overridden from environment");
        config.proposer.model = model;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    const VALID_TOML: &str = r#"
[workspace]
root = "/srv/agent"
extensions = ["rs"]
backup_dir = "data/rewrites"

[checker]
kind = "rust"
timeout_secs = 30

[proposer]
kind = "anthropic"
model = "claude-sonnet"

[scheduler]
poll_interval_secs = 5

[scheduler.patch_queue]
auto_apply = true
"#;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_load_from_str_valid_toml() {
        let config = load_from_str(VALID_TOML, "test.toml").expect("test: load");
        assert_eq!(config.workspace.root, PathBuf::from("/srv/agent"));
        assert_eq!(config.checker.timeout_secs, 30);
        assert_eq!(config.scheduler.poll_interval_secs, 5);
        assert!(config.scheduler.patch_queue.auto_apply);
        assert_eq!(
            config.proposer.kind,
            crate::config::ProposerKind::Anthropic
        );
    }

    #[test]
    fn test_load_from_file_valid_toml_succeeds() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("rewrite.toml");
        let mut f = std::fs::File::create(&path).expect("test: create file");
        f.write_all(VALID_TOML.as_bytes()).expect("test: write");
        drop(f);

        let config = load_from_file(&path).expect("test: load from file");
        assert_eq!(config.workspace.backup_dir, PathBuf::from("data/rewrites"));
    }

    #[test]
    fn test_load_from_file_missing_file_returns_io_error() {
        let result = load_from_file(Path::new("/nonexistent/path/rewrite.toml"));
        assert!(matches!(result, Err(ConfigError::Io { .. })));
    }

    #[test]
    fn test_load_from_file_invalid_toml_returns_parse_error() {
        let dir = tempfile::tempdir().expect("test: create tempdir");
        let path = dir.path().join("bad.toml");
        std::fs::write(&path, "not valid [[[").expect("test: write");

        assert!(matches!(load_from_file(&path), Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_load_from_str_invalid_values_returns_validation_error() {
        let toml_str = r#"
[checker]
kind = "command"

[proposer]
temperature = 5.0
"#;
        let err = load_from_str(toml_str, "invalid.toml").unwrap_err();
        match err {
            ConfigError::Validation(msg) => {
                assert!(msg.contains("checker.program"));
                assert!(msg.contains("proposer.temperature"));
            }
            other => panic!("expected Validation, got {other:?}"),
        }
    }

    #[test]
    fn test_load_from_str_source_name_appears_in_error() {
        let err = load_from_str("invalid [[[", "my-source.toml").unwrap_err();
        assert!(err.to_string().contains("my-source.toml"));
    }

    #[test]
    fn test_unknown_checker_kind_is_parse_error() {
        let result = load_from_str("[checker]\nkind = \"gcc\"\n", "kind.toml");
        assert!(matches!(result, Err(ConfigError::Parse { .. })));
    }

    #[test]
    fn test_env_overrides_replace_file_values() {
        let mut config = load_from_str(VALID_TOML, "test.toml").expect("test: load");
        apply_env_overrides(
            &mut config,
            lookup_from(&[
                (ENV_ROOT, "/tmp/other"),
                (ENV_BACKUP_DIR, "/var/backups/rewrites"),
                (ENV_MODEL, "gpt-4o-mini"),
            ]),
        );
        assert_eq!(config.workspace.root, PathBuf::from("/tmp/other"));
        assert_eq!(
            config.workspace.backup_dir,
            PathBuf::from("/var/backups/rewrites")
        );
        assert_eq!(config.proposer.model, "gpt-4o-mini");
    }

    #[test]
    fn test_blank_env_override_is_ignored() {
        let mut config = RewriteConfig::default();
        apply_env_overrides(&mut config, lookup_from(&[(ENV_MODEL, "   ")]));
        assert_eq!(config.proposer.model, RewriteConfig::default().proposer.model);
    }

    #[test]
    fn test_override_is_validated() {
        // An override cannot smuggle in a value validation would reject.
        let mut base = RewriteConfig::default();
        base.proposer.model = String::new();
        let result = finish(base, lookup_from(&[]));
        assert!(matches!(result, Err(ConfigError::Validation(_))));

        let mut base = RewriteConfig::default();
        base.proposer.model = String::new();
        let fixed = finish(base, lookup_from(&[(ENV_MODEL, "gpt-4o")])).expect("test: valid");
        assert_eq!(fixed.proposer.model, "gpt-4o");
    }
}
