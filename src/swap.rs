//! # Backup & Swap Executor
//!
//! ## Responsibility
//! Overwrite live files with already-validated content, always snapshotting
//! the previous content first.
//!
//! ## Guarantees
//! - Ordered: read live content, write a backup artifact and `sync_all` it,
//!   and only then replace the live file
//! - Backup failure means no overwrite: the target is byte-for-byte unchanged
//! - Atomic replace: new content goes to a temp file in the same directory,
//!   is synced, then renamed over the target
//! - Append-only history: artifacts are created with `create_new(true)` and
//!   never overwritten; a same-second collision gets a `-N` suffix
//! - Blocking I/O runs via `spawn_blocking`, so cancelling the caller cannot
//!   interrupt a swap halfway
//!
//! ## NOT Responsible For
//! - Validation (see: `sandbox`); the executor does not re-validate
//! - Serialization of writers (see: `lock`)
//!
//! ## Artifact layout
//!
//! `<backup_dir>/<relative parent>/<file name>.<UTC %Y%m%d-%H%M%S>[-N].bak`
//!
//! Mirroring the relative parent keeps `src/a/mod.rs` and `src/b/mod.rs`
//! apart while the name itself stays the base name plus timestamp.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, NaiveDateTime, Utc};
use thiserror::Error;
use walkdir::WalkDir;

use crate::lock::MutationGuard;
use crate::sandbox::patch::{FileChange, PatchPlan};

/// Timestamp format embedded in artifact names.
pub const STAMP_FORMAT: &str = "%Y%m%d-%H%M%S";

const BACKUP_SUFFIX: &str = ".bak";

// ─── Error ───────────────────────────────────────────────────────────────

/// Swap failures.
///
/// [`SwapError::is_degraded`] separates "nothing happened" from "the live
/// tree may be in an unspecified state".
#[derive(Debug, Error)]
pub enum SwapError {
    /// The target does not exist.
    #[error("swap target {0} does not exist")]
    Missing(PathBuf),

    /// The live content could not be read; nothing was written.
    #[error("cannot read {path}: {source}")]
    Read {
        /// Target, relative to the root.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The backup could not be written; the target was not touched.
    #[error("backup of {path} failed: {source}")]
    Backup {
        /// Target whose backup failed.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The overwrite failed after the backup was taken.
    #[error("overwrite of {path} failed after backup {backup:?}: {source}")]
    Swap {
        /// Target being replaced.
        path: PathBuf,
        /// Artifact holding the previous content, if one was taken.
        backup: Option<PathBuf>,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The swap did not report back in time; its effect is unknown.
    #[error("swap of {path} did not finish within {waited:?}")]
    Timeout {
        /// Target being replaced.
        path: PathBuf,
        /// How long we waited.
        waited: Duration,
    },

    /// The blocking worker panicked.
    #[error("swap worker failed: {0}")]
    Worker(String),
}

impl SwapError {
    /// True when the live tree may have been partially modified.
    pub fn is_degraded(&self) -> bool {
        matches!(self, Self::Swap { .. } | Self::Timeout { .. } | Self::Worker(_))
    }
}

// ─── Backup store ────────────────────────────────────────────────────────

/// One immutable backup artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupArtifact {
    /// Original file, relative to the live root.
    pub target: PathBuf,
    /// When the snapshot was taken (UTC, second resolution).
    pub timestamp: NaiveDateTime,
    /// Collision counter within the same second (0 for the first).
    pub sequence: u32,
    /// Absolute path of the artifact.
    pub path: PathBuf,
}

impl BackupArtifact {
    /// Artifact file name.
    pub fn file_name(&self) -> String {
        self.path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default()
    }
}

/// Directory of append-only backup artifacts.
#[derive(Debug, Clone)]
pub struct BackupStore {
    dir: PathBuf,
}

impl BackupStore {
    /// Store rooted at `dir` (created lazily on first write).
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// The backup directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Snapshot `content` of `target` stamped with the current time.
    ///
    /// # Errors
    ///
    /// Any I/O error creating, writing or syncing the artifact.
    pub fn write(&self, target: &Path, content: &[u8]) -> std::io::Result<BackupArtifact> {
        self.write_at(target, content, Utc::now())
    }

    /// Snapshot `content` of `target` stamped with `now`.
    ///
    /// # Errors
    ///
    /// Any I/O error creating, writing or syncing the artifact.
    pub fn write_at(&self, target: &Path, content: &[u8], now: DateTime<Utc>) -> std::io::Result<BackupArtifact> {
        let base = target
            .file_name()
            .ok_or_else(|| std::io::Error::new(std::io::ErrorKind::InvalidInput, "target has no file name"))?
            .to_string_lossy()
            .into_owned();
        let parent = self.dir.join(target.parent().unwrap_or_else(|| Path::new("")));
        std::fs::create_dir_all(&parent)?;

        let stamp = now.format(STAMP_FORMAT).to_string();
        let mut sequence = 0u32;
        loop {
            let name = if sequence == 0 {
                format!("{base}.{stamp}{BACKUP_SUFFIX}")
            } else {
                format!("{base}.{stamp}-{sequence}{BACKUP_SUFFIX}")
            };
            let path = parent.join(name);
            match OpenOptions::new().write(true).create_new(true).open(&path) {
                Ok(mut file) => {
                    file.write_all(content)?;
                    file.sync_all()?;
                    return Ok(BackupArtifact {
                        target: target.to_path_buf(),
                        timestamp: now.naive_utc(),
                        sequence,
                        path,
                    });
                }
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => sequence += 1,
                Err(e) => return Err(e),
            }
        }
    }

    /// Every artifact, oldest first. A missing directory is an empty list.
    ///
    /// # Errors
    ///
    /// I/O errors while walking the directory.
    pub fn list(&self) -> std::io::Result<Vec<BackupArtifact>> {
        if !self.dir.is_dir() {
            return Ok(Vec::new());
        }
        let mut artifacts = Vec::new();
        for entry in WalkDir::new(&self.dir).follow_links(false) {
            let entry = entry.map_err(std::io::Error::from)?;
            if !entry.file_type().is_file() {
                continue;
            }
            let Ok(rel) = entry.path().strip_prefix(&self.dir) else {
                continue;
            };
            if let Some(artifact) = parse_artifact(rel, entry.path()) {
                artifacts.push(artifact);
            }
        }
        artifacts.sort_by(|a, b| {
            (a.timestamp, a.sequence, &a.target).cmp(&(b.timestamp, b.sequence, &b.target))
        });
        Ok(artifacts)
    }

    /// Artifacts whose target is `target` (or whose base name is `target`
    /// when it has a single component), oldest first.
    ///
    /// # Errors
    ///
    /// As for [`BackupStore::list`].
    pub fn list_for(&self, target: &Path) -> std::io::Result<Vec<BackupArtifact>> {
        let bare = target.components().count() == 1;
        Ok(self
            .list()?
            .into_iter()
            .filter(|a| a.target == target || (bare && a.target.file_name() == target.file_name()))
            .collect())
    }

    /// Content of an artifact.
    ///
    /// # Errors
    ///
    /// Any read error.
    pub fn read(&self, artifact: &BackupArtifact) -> std::io::Result<String> {
        std::fs::read_to_string(&artifact.path)
    }
}

/// Recover `(target, timestamp, sequence)` from an artifact's relative path.
fn parse_artifact(rel: &Path, full: &Path) -> Option<BackupArtifact> {
    let name = rel.file_name()?.to_str()?;
    let stem = name.strip_suffix(BACKUP_SUFFIX)?;
    let (base, stamp) = stem.rsplit_once('.')?;
    let (stamp, sequence) = match stamp.split_once('-').and_then(|(_, rest)| rest.split_once('-')) {
        Some((_, seq)) => (&stamp[..stamp.len() - seq.len() - 1], seq.parse().ok()?),
        None => (stamp, 0),
    };
    let timestamp = NaiveDateTime::parse_from_str(stamp, STAMP_FORMAT).ok()?;
    let target = rel.parent().map_or_else(|| PathBuf::from(base), |p| p.join(base));
    Some(BackupArtifact {
        target,
        timestamp,
        sequence,
        path: full.to_path_buf(),
    })
}

// ─── Live swapper ────────────────────────────────────────────────────────

/// Result of one successful file replacement.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwapReceipt {
    /// Replaced file, relative to the root.
    pub target: PathBuf,
    /// Snapshot of the previous content; `None` for newly created files.
    pub backup: Option<BackupArtifact>,
    /// `true` if the file was removed rather than written.
    pub deleted: bool,
}

/// Writes validated content into the live tree.
#[derive(Debug, Clone)]
pub struct LiveSwapper {
    root: PathBuf,
    backups: BackupStore,
    io_timeout: Duration,
}

impl LiveSwapper {
    /// Swapper for the live tree at `root`.
    pub fn new(root: impl Into<PathBuf>, backups: BackupStore, io_timeout: Duration) -> Self {
        Self {
            root: root.into(),
            backups,
            io_timeout,
        }
    }

    /// The backup store in use.
    pub fn backups(&self) -> &BackupStore {
        &self.backups
    }

    /// Back up then atomically overwrite one existing file.
    ///
    /// `guard` is released only once the blocking write has finished, even
    /// when the wait for it times out.
    ///
    /// # Errors
    ///
    /// [`SwapError::Missing`], [`SwapError::Read`] and [`SwapError::Backup`]
    /// leave the target untouched; the rest are degraded.
    pub async fn apply(&self, target: &Path, content: &str, guard: MutationGuard) -> Result<SwapReceipt, SwapError> {
        let root = self.root.clone();
        let backups = self.backups.clone();
        let rel = target.to_path_buf();
        let content = content.to_string();
        let receipt = self
            .run_blocking(target, guard, move || swap_one(&root, &backups, &rel, &content))
            .await?;
        tracing::info!(
            file = %receipt.target.display(),
            backup = ?receipt.backup.as_ref().map(|b| b.path.display().to_string()),
            "swap: live file replaced"
        );
        Ok(receipt)
    }

    /// Back up every existing touched file, then carry out `plan`.
    ///
    /// No live file is written until every backup is durable.
    ///
    /// # Errors
    ///
    /// As for [`LiveSwapper::apply`]. A failure in the write phase is
    /// degraded and names the file it stopped at.
    pub async fn apply_plan(&self, plan: &PatchPlan, guard: MutationGuard) -> Result<Vec<SwapReceipt>, SwapError> {
        let root = self.root.clone();
        let backups = self.backups.clone();
        let plan = plan.clone();
        let first = plan.changes.first().map_or_else(PathBuf::new, |c| c.path().to_path_buf());
        let receipts = self
            .run_blocking(&first, guard, move || swap_plan(&root, &backups, &plan))
            .await?;
        tracing::info!(files = receipts.len(), "swap: patch applied to live tree");
        Ok(receipts)
    }

    async fn run_blocking<T, F>(&self, target: &Path, guard: MutationGuard, work: F) -> Result<T, SwapError>
    where
        T: Send + 'static,
        F: FnOnce() -> Result<T, SwapError> + Send + 'static,
    {
        // The guard lives as long as the write, not as long as our wait.
        let handle = tokio::task::spawn_blocking(move || {
            let result = work();
            drop(guard);
            result
        });
        match tokio::time::timeout(self.io_timeout, handle).await {
            Ok(Ok(result)) => result,
            Ok(Err(e)) => Err(SwapError::Worker(e.to_string())),
            Err(_) => Err(SwapError::Timeout {
                path: target.to_path_buf(),
                waited: self.io_timeout,
            }),
        }
    }
}

fn swap_one(root: &Path, backups: &BackupStore, rel: &Path, content: &str) -> Result<SwapReceipt, SwapError> {
    let full = root.join(rel);
    if !full.is_file() {
        return Err(SwapError::Missing(rel.to_path_buf()));
    }
    let previous = std::fs::read(&full).map_err(|source| SwapError::Read {
        path: rel.to_path_buf(),
        source,
    })?;
    let artifact = backups.write(rel, &previous).map_err(|source| SwapError::Backup {
        path: rel.to_path_buf(),
        source,
    })?;
    tracing::debug!(file = %rel.display(), backup = %artifact.path.display(), "backup: snapshot durable");

    atomic_write(&full, content.as_bytes()).map_err(|source| SwapError::Swap {
        path: rel.to_path_buf(),
        backup: Some(artifact.path.clone()),
        source,
    })?;
    Ok(SwapReceipt {
        target: rel.to_path_buf(),
        backup: Some(artifact),
        deleted: false,
    })
}

fn swap_plan(root: &Path, backups: &BackupStore, plan: &PatchPlan) -> Result<Vec<SwapReceipt>, SwapError> {
    // Phase 1: snapshots.
    let mut snapshots = Vec::with_capacity(plan.changes.len());
    for change in &plan.changes {
        let rel = change.path();
        let full = root.join(rel);
        let artifact = if full.is_file() {
            let previous = std::fs::read(&full).map_err(|source| SwapError::Read {
                path: rel.to_path_buf(),
                source,
            })?;
            Some(backups.write(rel, &previous).map_err(|source| SwapError::Backup {
                path: rel.to_path_buf(),
                source,
            })?)
        } else {
            None
        };
        snapshots.push(artifact);
    }

    // Phase 2: writes.
    let mut receipts = Vec::with_capacity(plan.changes.len());
    for (change, backup) in plan.changes.iter().zip(snapshots) {
        let rel = change.path();
        let full = root.join(rel);
        let failed = |source| SwapError::Swap {
            path: rel.to_path_buf(),
            backup: backup.as_ref().map(|b| b.path.clone()),
            source,
        };
        match change {
            FileChange::Write { content, .. } => {
                if let Some(parent) = full.parent() {
                    std::fs::create_dir_all(parent).map_err(failed)?;
                }
                atomic_write(&full, content.as_bytes()).map_err(failed)?;
            }
            FileChange::Delete { .. } => std::fs::remove_file(&full).map_err(failed)?,
        }
        receipts.push(SwapReceipt {
            target: rel.to_path_buf(),
            deleted: matches!(change, FileChange::Delete { .. }),
            backup,
        });
    }
    Ok(receipts)
}

/// Temp file in the same directory, synced, then renamed over `path`.
fn atomic_write(path: &Path, content: &[u8]) -> std::io::Result<()> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let mut tmp = tempfile::Builder::new().prefix(".self-rewrite-swap-").tempfile_in(dir)?;
    tmp.write_all(content)?;
    tmp.as_file().sync_all()?;
    if let Ok(meta) = std::fs::metadata(path) {
        std::fs::set_permissions(tmp.path(), meta.permissions())?;
    }
    tmp.persist(path).map_err(|e| e.error)?;
    Ok(())
}
