//! Strict unified-diff engine.
//!
//! Parses a unified diff (plain `diff -u` or `git diff` output) and applies
//! it in memory against a tree. Hunks must match the current content exactly
//! at the line numbers they name: no offset search, no fuzz. Planning reads
//! the tree but never writes; a [`PatchPlan`] is only produced when every
//! hunk of every file matches, so applying it cannot half-fail on content.
//!
//! The same plan function runs against the sandbox copy and, after
//! validation, against the live tree, which keeps both applies identical.

use std::collections::BTreeSet;
use std::path::{Component, Path, PathBuf};

use thiserror::Error;

/// Errors from parsing or planning a patch.
#[derive(Debug, Error)]
pub enum PatchError {
    /// The text contains no file sections.
    #[error("patch contains no file changes")]
    Empty,

    /// The text is not a well-formed unified diff.
    #[error("malformed patch at line {line}: {message}")]
    Malformed {
        /// 1-based line in the patch text.
        line: usize,
        /// What was wrong.
        message: String,
    },

    /// A path escapes the tree (absolute or containing `..`).
    #[error("unsafe path in patch: {0}")]
    UnsafePath(String),

    /// The patch modifies or deletes a file that does not exist.
    #[error("{0}: file does not exist")]
    Missing(PathBuf),

    /// The patch creates a file that already exists.
    #[error("{0}: file already exists")]
    AlreadyExists(PathBuf),

    /// A hunk does not match the current content.
    #[error("{file}: hunk #{hunk} does not apply at line {line}: {reason}")]
    ContextMismatch {
        /// File being patched.
        file: PathBuf,
        /// 1-based hunk index within the file.
        hunk: usize,
        /// 1-based line in the original file.
        line: usize,
        /// What did not match.
        reason: String,
    },

    /// Reading or writing a file failed.
    #[error("{path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

// ── Model ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone)]
struct Hunk {
    old_start: usize,
    old_len: usize,
    lines: Vec<HunkLine>,
    old_missing_newline: bool,
    new_missing_newline: bool,
}

impl Hunk {
    fn old_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            HunkLine::Context(s) | HunkLine::Remove(s) => Some(s.as_str()),
            HunkLine::Add(_) => None,
        })
    }

    fn new_lines(&self) -> impl Iterator<Item = &str> {
        self.lines.iter().filter_map(|l| match l {
            HunkLine::Context(s) | HunkLine::Add(s) => Some(s.as_str()),
            HunkLine::Remove(_) => None,
        })
    }
}

#[derive(Debug, Clone)]
struct FilePatch {
    old_path: Option<PathBuf>,
    new_path: Option<PathBuf>,
    hunks: Vec<Hunk>,
}

impl FilePatch {
    fn display_path(&self) -> PathBuf {
        self.new_path
            .clone()
            .or_else(|| self.old_path.clone())
            .unwrap_or_default()
    }
}

/// A parsed unified diff.
#[derive(Debug, Clone)]
pub struct Patch {
    files: Vec<FilePatch>,
}

/// One planned filesystem change, relative to a root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileChange {
    /// Create or overwrite `path` with `content`.
    Write {
        /// Relative path.
        path: PathBuf,
        /// Full new content.
        content: String,
    },
    /// Remove `path`.
    Delete {
        /// Relative path.
        path: PathBuf,
    },
}

impl FileChange {
    /// The relative path this change touches.
    pub fn path(&self) -> &Path {
        match self {
            Self::Write { path, .. } | Self::Delete { path } => path,
        }
    }
}

/// Fully verified set of changes, ready to be written.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PatchPlan {
    /// Changes in patch order.
    pub changes: Vec<FileChange>,
}

// ── Parsing ──────────────────────────────────────────────────────────────

impl Patch {
    /// Parse unified-diff text.
    ///
    /// # Errors
    ///
    /// [`PatchError::Empty`], [`PatchError::Malformed`] or
    /// [`PatchError::UnsafePath`].
    pub fn parse(text: &str) -> Result<Self, PatchError> {
        // Only '\n' ends a line; a '\r' before it is content (CRLF files).
        let lines: Vec<&str> = text.strip_suffix('\n').unwrap_or(text).split('\n').collect();
        let mut files: Vec<FilePatch> = Vec::new();
        let mut i = 0;

        while i < lines.len() {
            let line = lines[i];
            if !line.starts_with("--- ") {
                i += 1;
                continue;
            }
            let old = header_path(&line[4..], i + 1)?;
            let plus = lines.get(i + 1).copied().unwrap_or_default();
            if !plus.starts_with("+++ ") {
                return Err(malformed(i + 2, "expected '+++' after '---'"));
            }
            let new = header_path(&plus[4..], i + 2)?;
            if old.is_none() && new.is_none() {
                return Err(malformed(i + 1, "both sides are /dev/null"));
            }
            i += 2;

            let mut hunks = Vec::new();
            while i < lines.len() && lines[i].starts_with("@@") {
                let (hunk, next) = parse_hunk(&lines, i)?;
                hunks.push(hunk);
                i = next;
            }
            if hunks.is_empty() {
                return Err(malformed(i + 1, "file section without hunks"));
            }
            files.push(FilePatch {
                old_path: old,
                new_path: new,
                hunks,
            });
        }

        if files.is_empty() {
            return Err(PatchError::Empty);
        }

        let mut seen = BTreeSet::new();
        for file in &files {
            let paths: BTreeSet<&PathBuf> = file.old_path.iter().chain(file.new_path.iter()).collect();
            for path in paths {
                if !seen.insert(path.clone()) {
                    return Err(malformed(0, &format!("{} is touched twice", path.display())));
                }
            }
        }

        Ok(Self { files })
    }

    /// Every path the patch reads or writes, deduplicated and sorted.
    pub fn touched_files(&self) -> Vec<PathBuf> {
        let mut set = BTreeSet::new();
        for file in &self.files {
            set.extend(file.old_path.iter().cloned());
            set.extend(file.new_path.iter().cloned());
        }
        set.into_iter().collect()
    }

    /// Apply every hunk in memory against the files under `root`.
    ///
    /// # Errors
    ///
    /// [`PatchError::Missing`], [`PatchError::AlreadyExists`],
    /// [`PatchError::ContextMismatch`] or [`PatchError::Io`]. No file is
    /// written in any case.
    pub fn plan(&self, root: &Path) -> Result<PatchPlan, PatchError> {
        let mut plan = PatchPlan::default();

        for file in &self.files {
            let original = match &file.old_path {
                Some(old) => {
                    let full = root.join(old);
                    if !full.is_file() {
                        return Err(PatchError::Missing(old.clone()));
                    }
                    Some(std::fs::read_to_string(&full).map_err(|source| PatchError::Io {
                        path: old.clone(),
                        source,
                    })?)
                }
                None => {
                    if let Some(new) = &file.new_path {
                        if root.join(new).exists() {
                            return Err(PatchError::AlreadyExists(new.clone()));
                        }
                    }
                    None
                }
            };

            let patched = apply_hunks(&file.display_path(), original.as_deref().unwrap_or(""), &file.hunks)?;

            match (&file.old_path, &file.new_path) {
                (_, None) => {
                    if !patched.is_empty() {
                        return Err(PatchError::ContextMismatch {
                            file: file.display_path(),
                            hunk: file.hunks.len(),
                            line: 1,
                            reason: "deletion leaves content behind".to_string(),
                        });
                    }
                    if let Some(old) = &file.old_path {
                        plan.changes.push(FileChange::Delete { path: old.clone() });
                    }
                }
                (old, Some(new)) => {
                    if let Some(old) = old {
                        if old != new {
                            if root.join(new).exists() {
                                return Err(PatchError::AlreadyExists(new.clone()));
                            }
                            plan.changes.push(FileChange::Delete { path: old.clone() });
                        }
                    }
                    plan.changes.push(FileChange::Write {
                        path: new.clone(),
                        content: patched,
                    });
                }
            }
        }

        Ok(plan)
    }
}

impl PatchPlan {
    /// Write the plan under `root` with plain writes.
    ///
    /// Used for sandbox copies; the live tree goes through the backup and
    /// swap path instead.
    ///
    /// # Errors
    ///
    /// [`PatchError::Io`] on the first failed write.
    pub fn apply_to(&self, root: &Path) -> Result<(), PatchError> {
        for change in &self.changes {
            let full = root.join(change.path());
            let io = |source| PatchError::Io {
                path: change.path().to_path_buf(),
                source,
            };
            match change {
                FileChange::Write { content, .. } => {
                    if let Some(parent) = full.parent() {
                        std::fs::create_dir_all(parent).map_err(io)?;
                    }
                    std::fs::write(&full, content).map_err(io)?;
                }
                FileChange::Delete { .. } => std::fs::remove_file(&full).map_err(io)?,
            }
        }
        Ok(())
    }
}

fn malformed(line: usize, message: &str) -> PatchError {
    PatchError::Malformed {
        line,
        message: message.to_string(),
    }
}

/// Path from a `---`/`+++` header, with timestamps and `a/`/`b/` removed.
fn header_path(raw: &str, line: usize) -> Result<Option<PathBuf>, PatchError> {
    let raw = raw.split('\t').next().unwrap_or_default().trim();
    if raw.is_empty() {
        return Err(malformed(line, "missing path in header"));
    }
    if raw == "/dev/null" {
        return Ok(None);
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    let path = PathBuf::from(stripped);
    let safe = path
        .components()
        .all(|c| matches!(c, Component::Normal(_) | Component::CurDir));
    if !safe || path.as_os_str().is_empty() {
        return Err(PatchError::UnsafePath(raw.to_string()));
    }
    Ok(Some(path))
}

/// `@@ -a,b +c,d @@` → (a, b, c, d); omitted counts are 1.
fn parse_range_header(header: &str, line: usize) -> Result<(usize, usize, usize, usize), PatchError> {
    let inner = header
        .strip_prefix("@@ ")
        .and_then(|rest| rest.split(" @@").next())
        .ok_or_else(|| malformed(line, "bad hunk header"))?;
    let mut parts = inner.split_whitespace();
    let old = parts
        .next()
        .and_then(|p| p.strip_prefix('-'))
        .ok_or_else(|| malformed(line, "bad old range"))?;
    let new = parts
        .next()
        .and_then(|p| p.strip_prefix('+'))
        .ok_or_else(|| malformed(line, "bad new range"))?;

    let range = |s: &str| -> Result<(usize, usize), PatchError> {
        let (start, len) = match s.split_once(',') {
            Some((a, b)) => (a, b),
            None => (s, "1"),
        };
        let start = start.parse().map_err(|_| malformed(line, "bad range number"))?;
        let len = len.parse().map_err(|_| malformed(line, "bad range number"))?;
        Ok((start, len))
    };
    let (a, b) = range(old)?;
    let (c, d) = range(new)?;
    Ok((a, b, c, d))
}

fn parse_hunk(lines: &[&str], at: usize) -> Result<(Hunk, usize), PatchError> {
    let (old_start, old_len, _new_start, new_len) = parse_range_header(lines[at], at + 1)?;
    let mut hunk = Hunk {
        old_start,
        old_len,
        lines: Vec::new(),
        old_missing_newline: false,
        new_missing_newline: false,
    };

    let mut old_seen = 0;
    let mut new_seen = 0;
    let mut i = at + 1;
    while old_seen < old_len || new_seen < new_len {
        let Some(line) = lines.get(i) else {
            return Err(malformed(i + 1, "hunk ends early"));
        };
        let parsed = match line.chars().next() {
            Some(' ') => HunkLine::Context(line[1..].to_string()),
            // Some tools strip the single space from blank context lines.
            None => HunkLine::Context(String::new()),
            Some('\r') if *line == "\r" => HunkLine::Context("\r".to_string()),
            Some('-') => HunkLine::Remove(line[1..].to_string()),
            Some('+') => HunkLine::Add(line[1..].to_string()),
            Some('\\') => {
                mark_missing_newline(&mut hunk);
                i += 1;
                continue;
            }
            Some(_) => return Err(malformed(i + 1, "unexpected line inside hunk")),
        };
        match &parsed {
            HunkLine::Context(_) => {
                old_seen += 1;
                new_seen += 1;
            }
            HunkLine::Remove(_) => old_seen += 1,
            HunkLine::Add(_) => new_seen += 1,
        }
        if old_seen > old_len || new_seen > new_len {
            return Err(malformed(i + 1, "hunk longer than its header says"));
        }
        hunk.lines.push(parsed);
        i += 1;
    }

    // A trailing "\ No newline at end of file" belongs to the last line.
    if lines.get(i).map_or(false, |l| l.starts_with('\\')) {
        mark_missing_newline(&mut hunk);
        i += 1;
    }

    Ok((hunk, i))
}

fn mark_missing_newline(hunk: &mut Hunk) {
    match hunk.lines.last() {
        Some(HunkLine::Remove(_)) => hunk.old_missing_newline = true,
        Some(HunkLine::Add(_)) => hunk.new_missing_newline = true,
        Some(HunkLine::Context(_)) => {
            hunk.old_missing_newline = true;
            hunk.new_missing_newline = true;
        }
        None => {}
    }
}

// ── Applying ─────────────────────────────────────────────────────────────

fn split_lines(content: &str) -> (Vec<String>, bool) {
    if content.is_empty() {
        return (Vec::new(), true);
    }
    let ends_with_newline = content.ends_with('\n');
    let body = content.strip_suffix('\n').unwrap_or(content);
    (body.split('\n').map(str::to_string).collect(), ends_with_newline)
}

fn apply_hunks(file: &Path, original: &str, hunks: &[Hunk]) -> Result<String, PatchError> {
    let (lines, mut ends_with_newline) = split_lines(original);
    let original_ends_with_newline = ends_with_newline;
    let mut out: Vec<String> = Vec::with_capacity(lines.len());
    let mut cursor = 0usize;

    for (index, hunk) in hunks.iter().enumerate() {
        let mismatch = |line: usize, reason: String| PatchError::ContextMismatch {
            file: file.to_path_buf(),
            hunk: index + 1,
            line,
            reason,
        };

        // A zero-length old range names the line *after which* to insert.
        let position = if hunk.old_len == 0 {
            hunk.old_start
        } else {
            hunk.old_start.saturating_sub(1)
        };
        if position < cursor {
            return Err(mismatch(hunk.old_start, "overlaps the previous hunk".to_string()));
        }
        if position + hunk.old_len > lines.len() {
            return Err(mismatch(hunk.old_start, "range past end of file".to_string()));
        }

        out.extend(lines[cursor..position].iter().cloned());
        for (offset, expected) in hunk.old_lines().enumerate() {
            let actual = &lines[position + offset];
            if actual != expected {
                return Err(mismatch(
                    position + offset + 1,
                    format!("expected {expected:?}, found {actual:?}"),
                ));
            }
        }

        let reaches_end = position + hunk.old_len == lines.len();
        if hunk.old_len > 0 && reaches_end && hunk.old_missing_newline == original_ends_with_newline {
            return Err(mismatch(
                lines.len(),
                "end-of-file newline does not match".to_string(),
            ));
        }
        if hunk.old_missing_newline && !reaches_end {
            return Err(mismatch(hunk.old_start, "no-newline marker before end of file".to_string()));
        }

        out.extend(hunk.new_lines().map(str::to_string));
        cursor = position + hunk.old_len;
        if reaches_end {
            ends_with_newline = !hunk.new_missing_newline;
        }
    }

    out.extend(lines[cursor..].iter().cloned());

    if out.is_empty() {
        return Ok(String::new());
    }
    let mut text = out.join("\n");
    if ends_with_newline {
        text.push('\n');
    }
    Ok(text)
}
