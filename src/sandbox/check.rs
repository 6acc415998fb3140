//! Compile-checkers.
//!
//! A compile-check is a syntax/structural validity pass over source text; it
//! never runs or tests the code. Two implementations:
//!
//! - [`RustStructureCheck`]: in-process. Parses every file with `syn` and
//!   resolves `crate::`, `self::` and `super::` paths against the items the
//!   tree actually defines, so removing a definition in one file is reported
//!   against every other file that still references it.
//! - [`CommandCheck`]: runs an external program (`python3 -m py_compile
//!   {file}`, `cargo check`, ...) with a timeout, a scrubbed environment and
//!   bounded output.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use quote::ToTokens;
use syn::spanned::Spanned;
use syn::visit::{self, Visit};
use thiserror::Error;

use super::FileDiagnostic;
use crate::config::{CheckerConfig, CheckerKind};

/// Placeholder replaced by the file path in command arguments.
pub const FILE_PLACEHOLDER: &str = "{file}";

/// Failures of the checker itself, as opposed to findings about the code.
#[derive(Debug, Error)]
pub enum CheckError {
    /// The checker program could not be started.
    #[error("failed to spawn checker '{program}': {message}")]
    Spawn {
        /// Program that failed.
        program: String,
        /// OS error text.
        message: String,
    },

    /// The check did not finish in time.
    #[error("compile-check timed out after {0:?}")]
    Timeout(Duration),

    /// A file could not be read.
    #[error("cannot read {path}: {source}")]
    Io {
        /// File involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: std::io::Error,
    },

    /// The blocking worker panicked or was cancelled.
    #[error("checker worker failed: {0}")]
    Worker(String),
}

/// A compile-check strategy.
///
/// Both methods return the list of findings; an empty list means the input
/// is valid. `Err` is reserved for failures of the checker itself.
#[async_trait]
pub trait CompileCheck: Send + Sync {
    /// Short name for logs.
    fn name(&self) -> &str;

    /// Check one standalone file.
    async fn check_file(&self, path: &Path) -> Result<Vec<FileDiagnostic>, CheckError>;

    /// Check every file in `files` (relative to `root`) as one tree.
    async fn check_tree(&self, root: &Path, files: &[PathBuf]) -> Result<Vec<FileDiagnostic>, CheckError>;
}

/// Build the configured checker.
pub fn build_checker(cfg: &CheckerConfig) -> std::sync::Arc<dyn CompileCheck> {
    match (cfg.kind, cfg.program.as_deref()) {
        (CheckerKind::Command, Some(program)) => std::sync::Arc::new(CommandCheck::from_config(program, cfg)),
        _ => std::sync::Arc::new(RustStructureCheck),
    }
}

// ============================================================================
// Rust structural check
// ============================================================================

/// In-process structural check for Rust trees.
#[derive(Debug, Default, Clone, Copy)]
pub struct RustStructureCheck;

#[async_trait]
impl CompileCheck for RustStructureCheck {
    fn name(&self) -> &str {
        "rust-structure"
    }

    async fn check_file(&self, path: &Path) -> Result<Vec<FileDiagnostic>, CheckError> {
        let path = path.to_path_buf();
        tokio::task::spawn_blocking(move || {
            let content = std::fs::read_to_string(&path).map_err(|source| CheckError::Io {
                path: path.clone(),
                source,
            })?;
            let label = path.file_name().map(PathBuf::from).unwrap_or_else(|| path.clone());
            Ok(match syn::parse_file(&content) {
                Ok(_) => Vec::new(),
                Err(e) => vec![syntax_diagnostic(&label, &e)],
            })
        })
        .await
        .map_err(|e| CheckError::Worker(e.to_string()))?
    }

    async fn check_tree(&self, root: &Path, files: &[PathBuf]) -> Result<Vec<FileDiagnostic>, CheckError> {
        let root = root.to_path_buf();
        let files = files.to_vec();
        tokio::task::spawn_blocking(move || check_rust_tree(&root, &files))
            .await
            .map_err(|e| CheckError::Worker(e.to_string()))?
    }
}

fn syntax_diagnostic(file: &Path, e: &syn::Error) -> FileDiagnostic {
    let start = e.span().start();
    FileDiagnostic {
        file: file.to_path_buf(),
        line: Some(start.line),
        message: format!("syntax error at {}:{}: {e}", start.line, start.column + 1),
    }
}

/// Module path within a crate, e.g. `["net", "codec"]`.
type ModPath = Vec<String>;

#[derive(Debug, Default)]
struct ModuleInfo {
    items: BTreeSet<String>,
    /// Glob imports or item macros may define names we cannot see.
    open: bool,
}

/// `(crate source dir, module path)` → what the module defines.
#[derive(Debug, Default)]
struct ModuleTable {
    modules: HashMap<(PathBuf, ModPath), ModuleInfo>,
}

impl ModuleTable {
    fn entry(&mut self, krate: &Path, module: &ModPath) -> &mut ModuleInfo {
        self.modules.entry((krate.to_path_buf(), module.clone())).or_default()
    }

    fn get(&self, krate: &Path, module: &ModPath) -> Option<&ModuleInfo> {
        self.modules.get(&(krate.to_path_buf(), module.clone()))
    }
}

/// Where a file sits: its crate source dir and module path.
#[derive(Debug, Clone)]
struct FileModule {
    krate: PathBuf,
    module: ModPath,
}

/// Locate `relative` inside a crate `src/` directory.
///
/// Binaries under `src/bin/` and files outside any `src/` are not resolved.
fn file_module(relative: &Path) -> Option<FileModule> {
    let components: Vec<String> = relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy().into_owned())
        .collect();
    let src_index = components.iter().rposition(|c| c == "src")?;
    let krate: PathBuf = components[..=src_index].iter().collect();
    let rest = &components[src_index + 1..];
    let (file, dirs) = rest.split_last()?;
    if dirs.first().map(String::as_str) == Some("bin") {
        return None;
    }
    let stem = file.strip_suffix(".rs")?;

    let mut module: ModPath = dirs.to_vec();
    match (dirs.is_empty(), stem) {
        (true, "lib") | (true, "main") => {}
        (_, "mod") => {}
        _ => module.push(stem.to_string()),
    }
    Some(FileModule { krate, module })
}

fn check_rust_tree(root: &Path, files: &[PathBuf]) -> Result<Vec<FileDiagnostic>, CheckError> {
    let mut parsed: BTreeMap<PathBuf, syn::File> = BTreeMap::new();
    let mut diagnostics = Vec::new();

    for rel in files.iter().filter(|f| f.extension().and_then(|e| e.to_str()) == Some("rs")) {
        let content = std::fs::read_to_string(root.join(rel)).map_err(|source| CheckError::Io {
            path: rel.clone(),
            source,
        })?;
        match syn::parse_file(&content) {
            Ok(ast) => {
                parsed.insert(rel.clone(), ast);
            }
            Err(e) => diagnostics.push(syntax_diagnostic(rel, &e)),
        }
    }

    // Pass 1: what each module defines.
    let mut table = ModuleTable::default();
    for (rel, ast) in &parsed {
        if let Some(fm) = file_module(rel) {
            // Every module up to this one exists, and each parent defines the child.
            for depth in 0..fm.module.len() {
                let parent: ModPath = fm.module[..depth].to_vec();
                let child = fm.module[depth].clone();
                table.entry(&fm.krate, &parent).items.insert(child);
            }
            collect_items(&mut table, &fm.krate, &fm.module, &ast.items);
        }
    }

    // Pass 2: unresolved paths and dangling `mod x;`.
    for (rel, ast) in &parsed {
        let mut found: BTreeSet<(usize, String)> = BTreeSet::new();
        if let Some(fm) = file_module(rel) {
            let mut resolver = PathResolver {
                table: &table,
                krate: &fm.krate,
                module: fm.module.clone(),
                found: &mut found,
            };
            resolver.visit_file(ast);
        }
        found.extend(dangling_modules(root, rel, &ast.items));
        for (line, message) in found {
            diagnostics.push(FileDiagnostic {
                file: rel.clone(),
                line: Some(line),
                message,
            });
        }
    }

    diagnostics.sort_by(|a, b| a.file.cmp(&b.file).then(a.line.cmp(&b.line)));
    Ok(diagnostics)
}

fn collect_items(table: &mut ModuleTable, krate: &Path, module: &ModPath, items: &[syn::Item]) {
    for item in items {
        let name = match item {
            syn::Item::Fn(i) => Some(i.sig.ident.to_string()),
            syn::Item::Struct(i) => Some(i.ident.to_string()),
            syn::Item::Enum(i) => Some(i.ident.to_string()),
            syn::Item::Union(i) => Some(i.ident.to_string()),
            syn::Item::Trait(i) => Some(i.ident.to_string()),
            syn::Item::TraitAlias(i) => Some(i.ident.to_string()),
            syn::Item::Type(i) => Some(i.ident.to_string()),
            syn::Item::Const(i) => Some(i.ident.to_string()),
            syn::Item::Static(i) => Some(i.ident.to_string()),
            syn::Item::ExternCrate(i) => Some(
                i.rename
                    .as_ref()
                    .map_or_else(|| i.ident.to_string(), |(_, r)| r.to_string()),
            ),
            syn::Item::Mod(i) => {
                let mut child = module.clone();
                child.push(i.ident.to_string());
                table.entry(krate, &child);
                if let Some((_, inner)) = &i.content {
                    collect_items(table, krate, &child, inner);
                }
                Some(i.ident.to_string())
            }
            syn::Item::Macro(i) => match &i.ident {
                // macro_rules! name: visible by path at the crate root when exported.
                Some(ident) => {
                    table.entry(krate, &Vec::new()).items.insert(ident.to_string());
                    Some(ident.to_string())
                }
                None => {
                    table.entry(krate, module).open = true;
                    None
                }
            },
            syn::Item::Use(u) => {
                let mut names = Vec::new();
                let mut glob = false;
                use_tree_names(&u.tree, &mut names, &mut glob);
                let info = table.entry(krate, module);
                info.items.extend(names);
                info.open |= glob;
                None
            }
            syn::Item::ForeignMod(f) => {
                let info = table.entry(krate, module);
                for fi in &f.items {
                    match fi {
                        syn::ForeignItem::Fn(x) => {
                            info.items.insert(x.sig.ident.to_string());
                        }
                        syn::ForeignItem::Static(x) => {
                            info.items.insert(x.ident.to_string());
                        }
                        syn::ForeignItem::Type(x) => {
                            info.items.insert(x.ident.to_string());
                        }
                        _ => info.open = true,
                    }
                }
                None
            }
            _ => None,
        };
        let info = table.entry(krate, module);
        if let Some(name) = name {
            info.items.insert(name);
        }
    }
}

/// Names a `use` tree brings into scope.
fn use_tree_names(tree: &syn::UseTree, out: &mut Vec<String>, glob: &mut bool) {
    match tree {
        syn::UseTree::Path(p) => use_tree_names(&p.tree, out, glob),
        syn::UseTree::Name(n) => {
            if n.ident != "self" {
                out.push(n.ident.to_string());
            }
        }
        syn::UseTree::Rename(r) => out.push(r.rename.to_string()),
        syn::UseTree::Glob(_) => *glob = true,
        syn::UseTree::Group(g) => {
            for t in &g.items {
                use_tree_names(t, out, glob);
            }
        }
    }
}

/// `mod x;` declarations whose file is missing, as `(line, message)`.
fn dangling_modules(root: &Path, rel: &Path, items: &[syn::Item]) -> Vec<(usize, String)> {
    let Some(dir) = rel.parent() else {
        return Vec::new();
    };
    let stem = rel.file_stem().and_then(|s| s.to_str()).unwrap_or_default();
    let owns_dir = matches!(stem, "mod" | "lib" | "main");
    let base = if owns_dir { dir.to_path_buf() } else { dir.join(stem) };

    let mut out = Vec::new();
    for item in items {
        let syn::Item::Mod(m) = item else { continue };
        if m.content.is_some() {
            continue;
        }
        let has_override = m
            .attrs
            .iter()
            .any(|a| a.path().is_ident("path") || a.path().is_ident("cfg"));
        if has_override {
            continue;
        }
        let name = m.ident.to_string();
        let flat = base.join(format!("{name}.rs"));
        let nested = base.join(&name).join("mod.rs");
        if !root.join(&flat).is_file() && !root.join(&nested).is_file() {
            out.push((
                m.span().start().line,
                format!(
                    "module `{name}` is declared but neither {} nor {} exists",
                    flat.display(),
                    nested.display()
                ),
            ));
        }
    }
    out
}

struct PathResolver<'a> {
    table: &'a ModuleTable,
    krate: &'a Path,
    module: ModPath,
    found: &'a mut BTreeSet<(usize, String)>,
}

enum Resolution {
    Ok,
    Missing { name: String, scope: String },
}

impl PathResolver<'_> {
    /// Resolve a `crate::`, `self::` or `super::` path against the table.
    ///
    /// Anything that cannot be decided (other roots, unknown or open
    /// modules, paths above the crate root) resolves.
    fn resolve(&self, segments: &[String]) -> Resolution {
        let Some((first, rest)) = segments.split_first() else {
            return Resolution::Ok;
        };
        let mut current: ModPath = match first.as_str() {
            "crate" => Vec::new(),
            "self" => self.module.clone(),
            "super" => {
                let mut m = self.module.clone();
                if m.pop().is_none() {
                    return Resolution::Ok;
                }
                m
            }
            _ => return Resolution::Ok,
        };

        let mut rest = rest;
        while let Some(seg) = rest.first() {
            if seg != "super" {
                break;
            }
            if current.pop().is_none() {
                return Resolution::Ok;
            }
            rest = &rest[1..];
        }

        for seg in rest {
            let Some(info) = self.table.get(self.krate, &current) else {
                return Resolution::Ok;
            };
            let mut child = current.clone();
            child.push(seg.clone());
            if self.table.get(self.krate, &child).is_some() {
                current = child;
                continue;
            }
            // First non-module item ends the walk: enum variants, associated items.
            if info.open || info.items.contains(seg) {
                return Resolution::Ok;
            }
            return Resolution::Missing {
                name: seg.clone(),
                scope: if current.is_empty() {
                    "crate".to_string()
                } else {
                    format!("crate::{}", current.join("::"))
                },
            };
        }
        Resolution::Ok
    }

    fn report(&mut self, line: usize, shown: &str, resolution: Resolution) {
        if let Resolution::Missing { name, scope } = resolution {
            self.found
                .insert((line, format!("unresolved path `{shown}`: no `{name}` in `{scope}`")));
        }
    }

    fn check_use_tree(&mut self, prefix: &mut Vec<String>, tree: &syn::UseTree, line: usize) {
        match tree {
            syn::UseTree::Path(p) => {
                prefix.push(p.ident.to_string());
                self.check_use_tree(prefix, &p.tree, line);
                prefix.pop();
            }
            syn::UseTree::Name(n) => {
                if n.ident == "self" {
                    let res = self.resolve(prefix);
                    self.report(line, &prefix.join("::"), res);
                } else {
                    prefix.push(n.ident.to_string());
                    let res = self.resolve(prefix);
                    self.report(line, &prefix.join("::"), res);
                    prefix.pop();
                }
            }
            syn::UseTree::Rename(r) => {
                prefix.push(r.ident.to_string());
                let res = self.resolve(prefix);
                self.report(line, &prefix.join("::"), res);
                prefix.pop();
            }
            syn::UseTree::Glob(_) => {
                let res = self.resolve(prefix);
                self.report(line, &format!("{}::*", prefix.join("::")), res);
            }
            syn::UseTree::Group(g) => {
                for t in &g.items {
                    self.check_use_tree(prefix, t, line);
                }
            }
        }
    }
}

impl<'ast> Visit<'ast> for PathResolver<'_> {
    fn visit_item_mod(&mut self, item: &'ast syn::ItemMod) {
        if item.content.is_some() {
            self.module.push(item.ident.to_string());
            visit::visit_item_mod(self, item);
            self.module.pop();
        }
    }

    fn visit_item_use(&mut self, item: &'ast syn::ItemUse) {
        let line = item.span().start().line;
        let mut prefix = Vec::new();
        if item.leading_colon.is_none() {
            self.check_use_tree(&mut prefix, &item.tree, line);
        }
    }

    fn visit_path(&mut self, path: &'ast syn::Path) {
        if path.segments.len() >= 2 && path.leading_colon.is_none() {
            let segments: Vec<String> = path.segments.iter().map(|s| s.ident.to_string()).collect();
            if matches!(segments[0].as_str(), "crate" | "self" | "super") {
                let shown = path.to_token_stream().to_string().replace(' ', "");
                let res = self.resolve(&segments);
                self.report(path.span().start().line, &shown, res);
            }
        }
        visit::visit_path(self, path);
    }
}

// ============================================================================
// External command check
// ============================================================================

/// Runs an external compile-check program.
///
/// With a `{file}` placeholder in the arguments the program runs once per
/// file; otherwise it runs once over the whole tree (working directory =
/// tree root) and output lines that start with a known relative path are
/// attributed to that file.
#[derive(Debug, Clone)]
pub struct CommandCheck {
    program: String,
    args: Vec<String>,
    timeout: Duration,
    max_output_bytes: usize,
    denied_env_prefixes: Vec<String>,
}

/// Captured result of one checker run.
#[derive(Debug, Clone)]
pub struct CommandExecution {
    /// Exit status was zero.
    pub success: bool,
    /// Exit code when the process exited normally.
    pub exit_code: Option<i32>,
    /// Stdout, truncated.
    pub stdout: String,
    /// Stderr, truncated.
    pub stderr: String,
    /// Wall time.
    pub duration_ms: u64,
}

impl CommandExecution {
    fn combined(&self) -> String {
        match (self.stdout.trim().is_empty(), self.stderr.trim().is_empty()) {
            (_, true) => self.stdout.trim().to_string(),
            (true, false) => self.stderr.trim().to_string(),
            (false, false) => format!("{}\n{}", self.stdout.trim(), self.stderr.trim()),
        }
    }
}

impl CommandCheck {
    /// Create a checker running `program args...`.
    pub fn new(program: impl Into<String>, args: Vec<String>) -> Self {
        Self {
            program: program.into(),
            args,
            timeout: Duration::from_secs(60),
            max_output_bytes: 64 * 1024,
            denied_env_prefixes: vec!["TOKEN".into(), "KEY".into(), "SECRET".into()],
        }
    }

    fn from_config(program: &str, cfg: &CheckerConfig) -> Self {
        Self {
            program: program.to_string(),
            args: cfg.args.clone(),
            timeout: cfg.timeout(),
            max_output_bytes: cfg.max_output_bytes,
            denied_env_prefixes: cfg.denied_env_prefixes.clone(),
        }
    }

    /// Set the per-run timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn per_file(&self) -> bool {
        self.args.iter().any(|a| a.contains(FILE_PLACEHOLDER))
    }

    fn args_for(&self, file: &Path) -> Vec<String> {
        let file = file.to_string_lossy();
        if self.per_file() {
            self.args.iter().map(|a| a.replace(FILE_PLACEHOLDER, &file)).collect()
        } else {
            let mut args = self.args.clone();
            args.push(file.into_owned());
            args
        }
    }

    /// Run the program once in `workdir`.
    ///
    /// # Errors
    ///
    /// [`CheckError::Spawn`] or [`CheckError::Timeout`]. The child is killed
    /// when the timeout fires.
    pub async fn execute(&self, workdir: &Path, args: &[String]) -> Result<CommandExecution, CheckError> {
        let started = Instant::now();
        let mut command = tokio::process::Command::new(&self.program);
        command.kill_on_drop(true);
        command.args(args);
        command.current_dir(workdir);
        command.stdin(std::process::Stdio::null());
        command.stdout(std::process::Stdio::piped());
        command.stderr(std::process::Stdio::piped());
        for (key, _) in std::env::vars_os() {
            let upper = key.to_string_lossy().to_ascii_uppercase();
            if self.denied_env_prefixes.iter().any(|p| upper.contains(p.as_str())) {
                command.env_remove(&key);
            }
        }

        let output = tokio::time::timeout(self.timeout, command.output())
            .await
            .map_err(|_| CheckError::Timeout(self.timeout))?
            .map_err(|e| CheckError::Spawn {
                program: self.program.clone(),
                message: e.to_string(),
            })?;

        Ok(CommandExecution {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: truncate_to_limit(&output.stdout, self.max_output_bytes),
            stderr: truncate_to_limit(&output.stderr, self.max_output_bytes),
            duration_ms: started.elapsed().as_millis() as u64,
        })
    }
}

#[async_trait]
impl CompileCheck for CommandCheck {
    fn name(&self) -> &str {
        &self.program
    }

    async fn check_file(&self, path: &Path) -> Result<Vec<FileDiagnostic>, CheckError> {
        let workdir = path.parent().unwrap_or_else(|| Path::new("."));
        let run = self.execute(workdir, &self.args_for(path)).await?;
        if run.success {
            return Ok(Vec::new());
        }
        let label = path.file_name().map(PathBuf::from).unwrap_or_else(|| path.to_path_buf());
        Ok(vec![FileDiagnostic {
            file: label,
            line: None,
            message: failure_message(&run),
        }])
    }

    async fn check_tree(&self, root: &Path, files: &[PathBuf]) -> Result<Vec<FileDiagnostic>, CheckError> {
        if self.per_file() {
            let mut diagnostics = Vec::new();
            for rel in files {
                let run = self.execute(root, &self.args_for(rel)).await?;
                if !run.success {
                    diagnostics.push(FileDiagnostic {
                        file: rel.clone(),
                        line: None,
                        message: failure_message(&run),
                    });
                }
            }
            return Ok(diagnostics);
        }

        let run = self.execute(root, &self.args).await?;
        if run.success {
            return Ok(Vec::new());
        }
        Ok(attribute_output(&run, files))
    }
}

fn failure_message(run: &CommandExecution) -> String {
    let output = run.combined();
    if output.is_empty() {
        format!("checker exited with {:?}", run.exit_code)
    } else {
        output
    }
}

/// Split tree-wide output into per-file diagnostics by `path:line[:col]`.
fn attribute_output(run: &CommandExecution, files: &[PathBuf]) -> Vec<FileDiagnostic> {
    let mut known: Vec<(String, &PathBuf)> = files.iter().map(|f| (f.to_string_lossy().into_owned(), f)).collect();
    // Longest first so `pkg/a.py` wins over `a.py`.
    known.sort_by(|a, b| b.0.len().cmp(&a.0.len()));
    let mut per_file: BTreeMap<PathBuf, (Option<usize>, Vec<String>)> = BTreeMap::new();

    for line in run.combined().lines() {
        for (text, path) in &known {
            let Some(after) = path_reference(line, text) else {
                continue;
            };
            let number: String = after.chars().take_while(char::is_ascii_digit).collect();
            let entry = per_file.entry((*path).clone()).or_insert((None, Vec::new()));
            if entry.0.is_none() {
                entry.0 = number.parse().ok();
            }
            entry.1.push(line.trim().to_string());
            break;
        }
    }

    if per_file.is_empty() {
        return vec![FileDiagnostic {
            file: PathBuf::from("."),
            line: None,
            message: failure_message(run),
        }];
    }

    per_file
        .into_iter()
        .map(|(file, (line, lines))| FileDiagnostic {
            file,
            line,
            message: lines.join("\n"),
        })
        .collect()
}

/// Text after `path:` when `line` names `path` as a whole path (or as the
/// tail of an absolute one).
fn path_reference<'a>(line: &'a str, path: &str) -> Option<&'a str> {
    line.match_indices(path).find_map(|(at, _)| {
        let bounded = line[..at]
            .chars()
            .next_back()
            .map_or(true, |c| c.is_whitespace() || matches!(c, '/' | '"' | '\'' | '(' | '[' | '>'));
        if !bounded {
            return None;
        }
        line[at + path.len()..].strip_prefix(':')
    })
}

fn truncate_to_limit(bytes: &[u8], limit: usize) -> String {
    if bytes.len() <= limit {
        return String::from_utf8_lossy(bytes).into_owned();
    }
    let mut text = String::from_utf8_lossy(&bytes[..limit]).into_owned();
    text.push_str("\n[output truncated]");
    text
}
