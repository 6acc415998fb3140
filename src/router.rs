//! Command routing.
//!
//! Maps one line of user input to a [`Capability`] plus its argument text.
//! Triggers are data held in an explicitly constructed
//! [`CapabilityRegistry`]; there is no global table. [`CapabilityRegistry::route`]
//! is a pure function of the registry and the input.
//!
//! ## Matching
//!
//! 1. Input is trimmed; triggers match case-insensitively
//! 2. A trigger matches when the input equals it or continues with whitespace
//! 3. The longest matching trigger wins (`apply patch` beats `apply`)
//! 4. The rest of the input, trimmed and with its case kept, is the argument

use thiserror::Error;

/// Everything the front end can do.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Capability {
    /// List rewrite candidates.
    Reflect,
    /// Rewrite one function.
    Improve,
    /// Validate a diff file without applying it.
    ValidatePatch,
    /// Validate and apply a diff file.
    ApplyPatch,
    /// Scheduler and lock status.
    Status,
    /// List backup artifacts.
    Backups,
    /// Restore a backup artifact.
    Rollback,
    /// Prometheus text output.
    Metrics,
    /// Usage.
    Help,
    /// Leave the command loop.
    Exit,
}

/// One registered capability.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CapabilityEntry {
    /// What it routes to.
    pub capability: Capability,
    /// Phrases that select it, lowercase.
    pub triggers: Vec<String>,
    /// Usage line for help output.
    pub usage: String,
    /// One-line description.
    pub summary: String,
}

impl CapabilityEntry {
    /// Capability entry with lowercase-normalised triggers.
    pub fn new(capability: Capability, triggers: &[&str], usage: &str, summary: &str) -> Self {
        Self {
            capability,
            triggers: triggers.iter().map(|t| normalise(t)).collect(),
            usage: usage.to_string(),
            summary: summary.to_string(),
        }
    }
}

/// A routed command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
    /// Selected capability.
    pub capability: Capability,
    /// Remaining input after the trigger.
    pub args: String,
}

/// Registration errors.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum RouterError {
    /// A trigger is already claimed by another capability.
    #[error("trigger '{trigger}' already routes to {existing:?}")]
    DuplicateTrigger {
        /// The trigger.
        trigger: String,
        /// Capability that owns it.
        existing: Capability,
    },

    /// An entry has no usable trigger.
    #[error("{0:?} has no triggers")]
    NoTriggers(Capability),
}

/// Explicit registry of capabilities and their triggers.
#[derive(Debug, Clone, Default)]
pub struct CapabilityRegistry {
    entries: Vec<CapabilityEntry>,
}

fn normalise(text: &str) -> String {
    text.split_whitespace().collect::<Vec<_>>().join(" ").to_lowercase()
}

impl CapabilityRegistry {
    /// Empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a capability.
    ///
    /// # Errors
    ///
    /// [`RouterError::DuplicateTrigger`] or [`RouterError::NoTriggers`].
    pub fn register(&mut self, entry: CapabilityEntry) -> Result<(), RouterError> {
        if entry.triggers.iter().all(|t| t.is_empty()) {
            return Err(RouterError::NoTriggers(entry.capability));
        }
        for trigger in &entry.triggers {
            if let Some(existing) = self.entries.iter().find(|s| s.triggers.contains(trigger)) {
                return Err(RouterError::DuplicateTrigger {
                    trigger: trigger.clone(),
                    existing: existing.capability,
                });
            }
        }
        self.entries.push(entry);
        Ok(())
    }

    /// The command set of the `self-rewrite` front end.
    ///
    /// # Errors
    ///
    /// Never in practice; registration errors are propagated.
    pub fn standard() -> Result<Self, RouterError> {
        let mut r = Self::new();
        r.register(CapabilityEntry::new(
            Capability::Reflect,
            &["reflect", "scan"],
            "reflect",
            "list every rewrite candidate in the live tree",
        ))?;
        r.register(CapabilityEntry::new(
            Capability::Improve,
            &["improve", "rewrite"],
            "improve <target> [: instruction]",
            "rewrite one function (name, Type::name, or path:name)",
        ))?;
        r.register(CapabilityEntry::new(
            Capability::ValidatePatch,
            &["validate patch", "check patch"],
            "validate patch <file>",
            "check a unified diff against a sandbox copy",
        ))?;
        r.register(CapabilityEntry::new(
            Capability::ApplyPatch,
            &["apply patch"],
            "apply patch <file>",
            "validate, confirm and apply a unified diff",
        ))?;
        r.register(CapabilityEntry::new(
            Capability::Status,
            &["status"],
            "status",
            "scheduler tasks, lock holder and outcome counters",
        ))?;
        r.register(CapabilityEntry::new(
            Capability::Backups,
            &["backups", "list backups"],
            "backups [file]",
            "list backup artifacts, oldest first",
        ))?;
        r.register(CapabilityEntry::new(
            Capability::Rollback,
            &["rollback", "restore"],
            "rollback <artifact file name>",
            "validate and restore a backup (the current file is backed up first)",
        ))?;
        r.register(CapabilityEntry::new(
            Capability::Metrics,
            &["metrics"],
            "metrics",
            "print Prometheus metrics",
        ))?;
        r.register(CapabilityEntry::new(Capability::Help, &["help", "?"], "help", "show this list"))?;
        r.register(CapabilityEntry::new(Capability::Exit, &["exit", "quit"], "exit", "stop the scheduler and leave"))?;
        Ok(r)
    }

    /// Route one line of input.
    pub fn route(&self, input: &str) -> Option<Route> {
        let trimmed = input.trim();
        let lowered = normalise(trimmed);
        let mut best: Option<(&CapabilityEntry, &str)> = None;
        for entry in &self.entries {
            for trigger in &entry.triggers {
                let matches = lowered == *trigger
                    || (lowered.starts_with(trigger.as_str())
                        && lowered[trigger.len()..].starts_with(' '));
                if matches && best.map_or(true, |(_, t)| trigger.len() > t.len()) {
                    best = Some((entry, trigger.as_str()));
                }
            }
        }
        let (entry, trigger) = best?;
        Some(Route {
            capability: entry.capability,
            args: skip_words(trimmed, trigger.split(' ').count()).to_string(),
        })
    }

    /// Usage text for every capability.
    pub fn help(&self) -> String {
        let width = self.entries.iter().map(|s| s.usage.len()).max().unwrap_or(0);
        self.entries
            .iter()
            .map(|s| format!("  {:<width$}  {}", s.usage, s.summary))
            .collect::<Vec<_>>()
            .join("\n")
    }
}

/// `text` without its first `n` whitespace-separated words, trimmed.
fn skip_words(text: &str, n: usize) -> &str {
    let mut rest = text.trim_start();
    for _ in 0..n {
        let end = rest.find(char::is_whitespace).unwrap_or(rest.len());
        rest = rest[end..].trim_start();
    }
    rest.trim_end()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> CapabilityRegistry {
        CapabilityRegistry::standard().expect("test: standard registry")
    }

    #[test]
    fn test_route_simple_commands() {
        let r = registry();
        assert_eq!(r.route("reflect").map(|x| x.capability), Some(Capability::Reflect));
        assert_eq!(r.route("  QUIT ").map(|x| x.capability), Some(Capability::Exit));
        assert_eq!(r.route("?").map(|x| x.capability), Some(Capability::Help));
    }

    #[test]
    fn test_route_keeps_argument_case() {
        let route = registry().route("improve src/lib.rs:Parser::Next : add docs").expect("test: routed");
        assert_eq!(route.capability, Capability::Improve);
        assert_eq!(route.args, "src/lib.rs:Parser::Next : add docs");
    }

    #[test]
    fn test_route_prefers_longest_trigger() {
        let route = registry().route("apply   patch data/fix.diff").expect("test: routed");
        assert_eq!(route.capability, Capability::ApplyPatch);
        assert_eq!(route.args, "data/fix.diff");
        let route = registry().route("list backups lib.rs").expect("test: routed");
        assert_eq!(route.capability, Capability::Backups);
        assert_eq!(route.args, "lib.rs");
    }

    #[test]
    fn test_route_requires_word_boundary() {
        assert_eq!(registry().route("reflection"), None);
        assert_eq!(registry().route("apply"), None);
        assert_eq!(registry().route(""), None);
    }

    #[test]
    fn test_register_rejects_duplicate_trigger() {
        let mut r = registry();
        let err = r
            .register(CapabilityEntry::new(Capability::Status, &["Scan"], "scan", "dup"))
            .unwrap_err();
        assert_eq!(
            err,
            RouterError::DuplicateTrigger {
                trigger: "scan".into(),
                existing: Capability::Reflect,
            }
        );
    }

    #[test]
    fn test_help_lists_every_usage() {
        let help = registry().help();
        assert!(help.contains("apply patch <file>"));
        assert!(help.contains("rollback <artifact file name>"));
    }
}
