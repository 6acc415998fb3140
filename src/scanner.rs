//! # Candidate Scanner
//!
//! Walks the live source tree and extracts function-level metadata that the
//! rest of the pipeline uses as rewrite targets.
//!
//! ## Responsibility
//! - Enumerate source files under a root in a deterministic order
//! - Parse each Rust file with `syn` and record every function that has a
//!   body (free functions, inherent/trait impl methods, default trait methods)
//! - Isolate per-file failures: a malformed file yields a [`ScanFailure`]
//!   and the walk continues
//!
//! ## Guarantees
//! - Read-only: never writes to the tree
//! - Ordering is file path order, then declaration order within a file
//! - Candidates are snapshots; any write to the file invalidates them
//!
//! ## NOT Responsible For
//! - Deciding what to rewrite (that belongs to the caller)
//! - Locking (reads never take the mutation lock)

use std::path::{Path, PathBuf};

use quote::ToTokens;
use serde::Serialize;
use syn::spanned::Spanned;
use syn::visit::{self, Visit};
use thiserror::Error;
use walkdir::WalkDir;

/// Maximum number of characters of leading documentation kept per candidate.
pub const DOC_LIMIT: usize = 100;

// ── Errors ───────────────────────────────────────────────────────────────

/// Errors raised while scanning.
#[derive(Debug, Error)]
pub enum ScanError {
    /// The root (or a directory under it) could not be walked.
    #[error("cannot walk {root}: {message}")]
    Walk {
        /// Directory being walked.
        root: PathBuf,
        /// Underlying walkdir message.
        message: String,
    },

    /// A source file could not be read.
    #[error("cannot read {path}: {source}")]
    Read {
        /// File that failed.
        path: PathBuf,
        /// Underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// A source file is not valid Rust.
    #[error("{path}:{line}:{column}: {message}")]
    Parse {
        /// File that failed.
        path: PathBuf,
        /// 1-based line of the first error.
        line: usize,
        /// 1-based column of the first error.
        column: usize,
        /// Parser message.
        message: String,
    },
}

/// Errors raised when a user-supplied target does not map to one candidate.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ResolveError {
    /// No candidate matches.
    #[error("no function matches '{0}'")]
    NotFound(String),

    /// More than one candidate matches; the caller must qualify the target.
    #[error("'{target}' is ambiguous, candidates: {}", matches.join(", "))]
    Ambiguous {
        /// The target as given.
        target: String,
        /// Qualified names of every match.
        matches: Vec<String>,
    },
}

// ── Records ──────────────────────────────────────────────────────────────

/// 1-based inclusive line range of an item, including its attributes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LineSpan {
    /// First line (attributes and doc comments included).
    pub start: usize,
    /// Last line (closing brace).
    pub end: usize,
}

/// A scan-time description of one rewrite target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CandidateFunction {
    /// Path relative to the scanned root.
    pub file: PathBuf,
    /// Function name.
    pub function: String,
    /// Parameter names in declaration order; a receiver is reported as `self`.
    pub args: Vec<String>,
    /// Leading documentation, truncated to [`DOC_LIMIT`] characters with
    /// newlines flattened to spaces. Empty when undocumented.
    pub doc: String,
    /// Enclosing `impl` type or trait name, if any.
    pub owner: Option<String>,
    /// Where the item sits in the file at scan time.
    pub span: LineSpan,
}

impl CandidateFunction {
    /// `Owner::name` for methods, `name` otherwise.
    pub fn qualified_name(&self) -> String {
        match &self.owner {
            Some(owner) => format!("{owner}::{}", self.function),
            None => self.function.clone(),
        }
    }

    /// `file:Owner::name`, unique within a scan.
    pub fn display_target(&self) -> String {
        format!("{}:{}", self.file.display(), self.qualified_name())
    }
}

/// A file that could not contribute candidates.
#[derive(Debug)]
pub struct ScanFailure {
    /// Path relative to the scanned root.
    pub file: PathBuf,
    /// Why the file was skipped.
    pub error: ScanError,
}

/// Result of one scan: every candidate found plus every per-file failure.
#[derive(Debug, Default)]
pub struct ScanReport {
    /// Candidates in file path order, then declaration order.
    pub candidates: Vec<CandidateFunction>,
    /// Files that failed to read or parse.
    pub failures: Vec<ScanFailure>,
}

impl ScanReport {
    /// Candidates declared in `file` (relative path).
    pub fn in_file<'a>(&'a self, file: &'a Path) -> impl Iterator<Item = &'a CandidateFunction> + 'a {
        self.candidates.iter().filter(move |c| c.file == file)
    }

    /// Resolve a target string to exactly one candidate.
    ///
    /// Accepted forms: `name`, `Owner::name`, `path:name` and
    /// `path:Owner::name`, where `path` matches the trailing components of
    /// the candidate's relative file path.
    ///
    /// # Errors
    ///
    /// [`ResolveError::NotFound`] or [`ResolveError::Ambiguous`].
    pub fn resolve(&self, target: &str) -> Result<&CandidateFunction, ResolveError> {
        let target = target.trim();
        let (file, name) = split_target(target);
        let (owner, function) = match name.rsplit_once("::") {
            Some((owner, function)) => (Some(owner), function),
            None => (None, name),
        };

        let matches: Vec<&CandidateFunction> = self
            .candidates
            .iter()
            .filter(|c| c.function == function)
            .filter(|c| owner.map_or(true, |o| c.owner.as_deref() == Some(o)))
            .filter(|c| file.map_or(true, |f| c.file.ends_with(f)))
            .collect();

        match matches.as_slice() {
            [] => Err(ResolveError::NotFound(target.to_string())),
            [one] => Ok(*one),
            many => Err(ResolveError::Ambiguous {
                target: target.to_string(),
                matches: many.iter().map(|c| c.display_target()).collect(),
            }),
        }
    }
}

fn split_target(target: &str) -> (Option<&str>, &str) {
    // A single ':' separates the file; '::' belongs to the name.
    let bytes = target.as_bytes();
    for (i, b) in bytes.iter().enumerate() {
        if *b != b':' {
            continue;
        }
        let prev_colon = i > 0 && bytes[i - 1] == b':';
        let next_colon = bytes.get(i + 1) == Some(&b':');
        if !prev_colon && !next_colon {
            return (Some(&target[..i]), &target[i + 1..]);
        }
    }
    (None, target)
}

// ── File selection ───────────────────────────────────────────────────────

/// Which files under a root count as source files.
#[derive(Debug, Clone)]
pub struct SourceFilter {
    extensions: Vec<String>,
    exclude: Vec<String>,
}

impl SourceFilter {
    /// Build a filter from extensions (without dots) and excluded names.
    pub fn new(extensions: Vec<String>, exclude: Vec<String>) -> Self {
        Self { extensions, exclude }
    }

    /// True if any component of `relative` is an excluded name.
    pub fn is_excluded(&self, relative: &Path) -> bool {
        relative
            .components()
            .any(|c| self.exclude.iter().any(|e| c.as_os_str() == e.as_str()))
    }

    /// True if the extension of `path` is a source extension.
    pub fn is_source(&self, path: &Path) -> bool {
        path.extension()
            .and_then(|e| e.to_str())
            .map_or(false, |ext| self.extensions.iter().any(|x| x == ext))
    }

    /// Every source file under `root`, relative to it, sorted by path.
    ///
    /// Entries that cannot be walked are returned in the second vector so
    /// callers can decide whether they matter.
    ///
    /// # Errors
    ///
    /// [`ScanError::Walk`] if `root` itself is not a readable directory.
    pub fn collect(&self, root: &Path) -> Result<(Vec<PathBuf>, Vec<ScanError>), ScanError> {
        if !root.is_dir() {
            return Err(ScanError::Walk {
                root: root.to_path_buf(),
                message: "not a directory".to_string(),
            });
        }

        let mut files = Vec::new();
        let mut problems = Vec::new();
        let walker = WalkDir::new(root).follow_links(false).into_iter().filter_entry(|entry| {
            entry
                .path()
                .strip_prefix(root)
                .map_or(true, |rel| !self.is_excluded(rel))
        });

        for entry in walker {
            let entry = match entry {
                Ok(entry) => entry,
                Err(e) => {
                    problems.push(ScanError::Walk {
                        root: e.path().map_or_else(|| root.to_path_buf(), Path::to_path_buf),
                        message: e.to_string(),
                    });
                    continue;
                }
            };
            if !entry.file_type().is_file() || !self.is_source(entry.path()) {
                continue;
            }
            if let Ok(rel) = entry.path().strip_prefix(root) {
                files.push(rel.to_path_buf());
            }
        }

        files.sort();
        Ok((files, problems))
    }
}

// ── Scanner ──────────────────────────────────────────────────────────────

/// Read-only walker producing [`CandidateFunction`] records.
#[derive(Debug, Clone)]
pub struct CandidateScanner {
    root: PathBuf,
    filter: SourceFilter,
}

impl CandidateScanner {
    /// Create a scanner over `root`.
    pub fn new(root: impl Into<PathBuf>, filter: SourceFilter) -> Self {
        Self {
            root: root.into(),
            filter,
        }
    }

    /// The scanned root.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Scan the whole tree.
    ///
    /// Only `.rs` files are parsed for candidates; other configured
    /// extensions are compile-checked elsewhere but carry no function
    /// metadata.
    ///
    /// # Errors
    ///
    /// Only when the root itself cannot be walked. Per-file problems are
    /// reported in [`ScanReport::failures`].
    pub fn scan(&self) -> Result<ScanReport, ScanError> {
        let (files, problems) = self.filter.collect(&self.root)?;
        let mut report = ScanReport::default();

        for problem in problems {
            let file = match &problem {
                ScanError::Walk { root, .. } => root.strip_prefix(&self.root).unwrap_or(root).to_path_buf(),
                _ => PathBuf::new(),
            };
            report.failures.push(ScanFailure { file, error: problem });
        }

        for rel in files {
            if rel.extension().and_then(|e| e.to_str()) != Some("rs") {
                continue;
            }
            match self.scan_file(&rel) {
                Ok(mut found) => report.candidates.append(&mut found),
                Err(error) => {
                    tracing::warn!(file = %rel.display(), error = %error, "scan: file skipped");
                    report.failures.push(ScanFailure { file: rel, error });
                }
            }
        }

        tracing::debug!(
            root = %self.root.display(),
            candidates = report.candidates.len(),
            failures = report.failures.len(),
            "scan complete"
        );
        Ok(report)
    }

    /// Scan one file given relative to the root.
    ///
    /// # Errors
    ///
    /// [`ScanError::Read`] or [`ScanError::Parse`].
    pub fn scan_file(&self, relative: &Path) -> Result<Vec<CandidateFunction>, ScanError> {
        let path = self.root.join(relative);
        let content = std::fs::read_to_string(&path).map_err(|source| ScanError::Read {
            path: relative.to_path_buf(),
            source,
        })?;
        extract_candidates(relative, &content)
    }
}

/// Extract candidates from Rust source text.
///
/// # Errors
///
/// [`ScanError::Parse`] if the text is not a valid Rust file.
pub fn extract_candidates(relative: &Path, content: &str) -> Result<Vec<CandidateFunction>, ScanError> {
    let file = syn::parse_file(content).map_err(|e| {
        let start = e.span().start();
        ScanError::Parse {
            path: relative.to_path_buf(),
            line: start.line,
            column: start.column + 1,
            message: e.to_string(),
        }
    })?;

    let mut visitor = FunctionVisitor {
        file: relative,
        owner: None,
        found: Vec::new(),
    };
    visitor.visit_file(&file);
    Ok(visitor.found)
}

struct FunctionVisitor<'a> {
    file: &'a Path,
    owner: Option<String>,
    found: Vec<CandidateFunction>,
}

impl FunctionVisitor<'_> {
    fn record(&mut self, attrs: &[syn::Attribute], sig: &syn::Signature, span: proc_macro2::Span) {
        self.found.push(CandidateFunction {
            file: self.file.to_path_buf(),
            function: sig.ident.to_string(),
            args: sig.inputs.iter().map(arg_name).collect(),
            doc: leading_doc(attrs),
            owner: self.owner.clone(),
            span: LineSpan {
                start: span.start().line,
                end: span.end().line,
            },
        });
    }
}

impl<'ast> Visit<'ast> for FunctionVisitor<'_> {
    // Function bodies are not descended into: nested fns are not targets.
    fn visit_item_fn(&mut self, item: &'ast syn::ItemFn) {
        self.record(&item.attrs, &item.sig, item.span());
    }

    fn visit_impl_item_fn(&mut self, item: &'ast syn::ImplItemFn) {
        self.record(&item.attrs, &item.sig, item.span());
    }

    fn visit_trait_item_fn(&mut self, item: &'ast syn::TraitItemFn) {
        if item.default.is_some() {
            self.record(&item.attrs, &item.sig, item.span());
        }
    }

    fn visit_item_impl(&mut self, item: &'ast syn::ItemImpl) {
        let previous = self.owner.replace(type_name(&item.self_ty));
        visit::visit_item_impl(self, item);
        self.owner = previous;
    }

    fn visit_item_trait(&mut self, item: &'ast syn::ItemTrait) {
        let previous = self.owner.replace(item.ident.to_string());
        visit::visit_item_trait(self, item);
        self.owner = previous;
    }
}

fn type_name(ty: &syn::Type) -> String {
    match ty {
        syn::Type::Path(p) => p
            .path
            .segments
            .last()
            .map(|s| s.ident.to_string())
            .unwrap_or_else(|| ty.to_token_stream().to_string()),
        syn::Type::Reference(r) => type_name(&r.elem),
        other => other.to_token_stream().to_string(),
    }
}

fn arg_name(arg: &syn::FnArg) -> String {
    match arg {
        syn::FnArg::Receiver(_) => "self".to_string(),
        syn::FnArg::Typed(typed) => match typed.pat.as_ref() {
            syn::Pat::Ident(ident) => ident.ident.to_string(),
            other => other.to_token_stream().to_string(),
        },
    }
}

/// Concatenated `///` / `#[doc]` text, truncated to [`DOC_LIMIT`] chars,
/// newlines flattened.
pub(crate) fn leading_doc(attrs: &[syn::Attribute]) -> String {
    let lines: Vec<String> = attrs
        .iter()
        .filter(|a| a.path().is_ident("doc"))
        .filter_map(|a| match &a.meta {
            syn::Meta::NameValue(nv) => match &nv.value {
                syn::Expr::Lit(syn::ExprLit {
                    lit: syn::Lit::Str(s),
                    ..
                }) => Some(s.value().trim().to_string()),
                _ => None,
            },
            _ => None,
        })
        .collect();

    let joined = lines.join("\n");
    let trimmed = joined.trim();
    trimmed.chars().take(DOC_LIMIT).collect::<String>().replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn filter() -> SourceFilter {
        SourceFilter::new(vec!["rs".into()], vec!["target".into(), ".git".into()])
    }

    fn write(root: &Path, rel: &str, content: &str) {
        let path = root.join(rel);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).expect("test: mkdir");
        }
        std::fs::write(path, content).expect("test: write");
    }

    #[test]
    fn test_extract_undocumented_free_function() {
        let found = extract_candidates(Path::new("math.rs"), "fn add(a: i32, b: i32) -> i32 { a + b }\n")
            .expect("test: parse");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].function, "add");
        assert_eq!(found[0].args, vec!["a", "b"]);
        assert_eq!(found[0].doc, "");
        assert_eq!(found[0].owner, None);
        assert_eq!(found[0].span, LineSpan { start: 1, end: 1 });
    }

    #[test]
    fn test_extract_methods_receivers_and_owner() {
        let src = r#"
struct Counter { n: u32 }

impl Counter {
    /// Bump the counter.
    pub fn bump(&mut self, by: u32) { self.n += by; }
}

trait Named {
    fn name(&self) -> String { String::new() }
    fn required(&self);
}
"#;
        let found = extract_candidates(Path::new("c.rs"), src).expect("test: parse");
        let names: Vec<String> = found.iter().map(|c| c.qualified_name()).collect();
        assert_eq!(names, vec!["Counter::bump", "Named::name"]);
        assert_eq!(found[0].args, vec!["self", "by"]);
        assert_eq!(found[0].doc, "Bump the counter.");
        assert_eq!(found[0].span, LineSpan { start: 5, end: 6 });
    }

    #[test]
    fn test_nested_functions_are_not_candidates() {
        let src = "fn outer() { fn inner() {} inner(); }\n";
        let found = extract_candidates(Path::new("n.rs"), src).expect("test: parse");
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].function, "outer");
    }

    #[test]
    fn test_doc_is_truncated_and_flattened() {
        let long = "x".repeat(150);
        let src = format!("/// first line\n/// {long}\nfn f() {{}}\n");
        let found = extract_candidates(Path::new("d.rs"), &src).expect("test: parse");
        let doc = &found[0].doc;
        assert_eq!(doc.chars().count(), DOC_LIMIT);
        assert!(doc.starts_with("first line x"));
        assert!(!doc.contains('\n'));
    }

    #[test]
    fn test_parse_error_reports_location() {
        let err = extract_candidates(Path::new("bad.rs"), "fn broken( {\n").unwrap_err();
        match err {
            ScanError::Parse { path, line, .. } => {
                assert_eq!(path, PathBuf::from("bad.rs"));
                assert!(line >= 1);
            }
            other => panic!("expected Parse, got {other:?}"),
        }
    }

    #[test]
    fn test_scan_isolates_malformed_file() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        write(dir.path(), "src/a.rs", "fn one() {}\nfn two() {}\n");
        write(dir.path(), "src/b.rs", "this is not rust {{{");
        write(dir.path(), "src/c.rs", "fn three(x: u8) {}\n");

        let report = CandidateScanner::new(dir.path(), filter()).scan().expect("test: scan");
        let names: Vec<&str> = report.candidates.iter().map(|c| c.function.as_str()).collect();
        assert_eq!(names, vec!["one", "two", "three"]);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].file, PathBuf::from("src/b.rs"));
    }

    #[test]
    fn test_scan_order_is_path_then_declaration() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        write(dir.path(), "z.rs", "fn z1() {}\n");
        write(dir.path(), "a/m.rs", "fn m2() {}\nfn m1() {}\n");
        write(dir.path(), "b.rs", "fn b1() {}\n");

        let report = CandidateScanner::new(dir.path(), filter()).scan().expect("test: scan");
        let names: Vec<&str> = report.candidates.iter().map(|c| c.function.as_str()).collect();
        assert_eq!(names, vec!["m2", "m1", "b1", "z1"]);
    }

    #[test]
    fn test_scan_skips_excluded_dirs_and_other_extensions() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        write(dir.path(), "target/debug/gen.rs", "fn generated() {}\n");
        write(dir.path(), "notes.txt", "fn not_code() {}\n");
        write(dir.path(), "lib.rs", "fn real() {}\n");

        let report = CandidateScanner::new(dir.path(), filter()).scan().expect("test: scan");
        assert_eq!(report.candidates.len(), 1);
        assert_eq!(report.candidates[0].function, "real");
    }

    #[test]
    fn test_scan_missing_root_is_error() {
        let result = CandidateScanner::new("/definitely/not/here", filter()).scan();
        assert!(matches!(result, Err(ScanError::Walk { .. })));
    }

    #[test]
    fn test_resolve_forms() {
        let dir = tempfile::tempdir().expect("test: tempdir");
        write(dir.path(), "src/a.rs", "fn run() {}\nstruct S;\nimpl S { fn go(&self) {} }\n");
        write(dir.path(), "src/b.rs", "fn run() {}\nfn solo() {}\n");
        let report = CandidateScanner::new(dir.path(), filter()).scan().expect("test: scan");

        assert_eq!(report.resolve("solo").expect("test: solo").function, "solo");
        assert_eq!(report.resolve("S::go").expect("test: S::go").owner.as_deref(), Some("S"));
        let run = report.resolve("b.rs:run").expect("test: b.rs:run");
        assert_eq!(run.file, PathBuf::from("src/b.rs"));
        assert!(report.resolve("src/a.rs:S::go").is_ok());

        assert!(matches!(report.resolve("run"), Err(ResolveError::Ambiguous { .. })));
        assert_eq!(
            report.resolve("missing"),
            Err(ResolveError::NotFound("missing".to_string()))
        );
    }

    #[test]
    fn test_split_target_keeps_path_separator_and_double_colon_apart() {
        assert_eq!(split_target("a.rs:f"), (Some("a.rs"), "f"));
        assert_eq!(split_target("T::f"), (None, "T::f"));
        assert_eq!(split_target("x/y.rs:T::f"), (Some("x/y.rs"), "T::f"));
    }
}
