//! Pristine sandbox copies of the live tree.
//!
//! Every validation attempt gets its own freshly created temporary
//! directory; nothing is ever merged into an existing directory, so a
//! sandbox can never inherit state from an earlier attempt. The directory is
//! removed when the returned [`TempDir`] is dropped.

use std::path::Path;

use tempfile::TempDir;
use walkdir::WalkDir;

use super::SandboxError;
use crate::scanner::SourceFilter;

/// Copy every non-excluded regular file under `root` into a new temp dir.
///
/// Symlinks are skipped so a sandbox can never write through to the live
/// tree.
///
/// # Errors
///
/// [`SandboxError::Io`] if the temp dir cannot be created or any file
/// cannot be copied.
pub fn copy_tree(root: &Path, filter: &SourceFilter) -> Result<TempDir, SandboxError> {
    let sandbox = tempfile::Builder::new()
        .prefix("self-rewrite-sandbox-")
        .tempdir()
        .map_err(|e| SandboxError::io("create sandbox", e))?;

    let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|entry| {
        entry
            .path()
            .strip_prefix(root)
            .map_or(true, |rel| !filter.is_excluded(rel))
    });

    let mut copied = 0usize;
    for entry in walker {
        let entry = entry.map_err(|e| SandboxError::Io {
            context: "walk live tree".to_string(),
            source: e.into(),
        })?;
        let Ok(rel) = entry.path().strip_prefix(root) else {
            continue;
        };
        if rel.as_os_str().is_empty() {
            continue;
        }
        let dest = sandbox.path().join(rel);
        let file_type = entry.file_type();
        if file_type.is_dir() {
            std::fs::create_dir_all(&dest).map_err(|e| SandboxError::io(&format!("mkdir {}", rel.display()), e))?;
        } else if file_type.is_file() {
            if let Some(parent) = dest.parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| SandboxError::io(&format!("mkdir {}", parent.display()), e))?;
            }
            std::fs::copy(entry.path(), &dest)
                .map_err(|e| SandboxError::io(&format!("copy {}", rel.display()), e))?;
            copied += 1;
        } else {
            tracing::debug!(path = %rel.display(), "sandbox: skipping non-regular file");
        }
    }

    tracing::debug!(
        live = %root.display(),
        sandbox = %sandbox.path().display(),
        files = copied,
        "sandbox: pristine copy ready"
    );
    Ok(sandbox)
}
