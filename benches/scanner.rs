//! Scanner and sandbox benchmarks: candidate extraction and whole-tree
//! compile-check over a synthetic crate.

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::runtime::Runtime;

use self_rewrite_orchestrator::sandbox::check::RustStructureCheck;
use self_rewrite_orchestrator::scanner::{extract_candidates, SourceFilter};
use self_rewrite_orchestrator::{CandidateScanner, SandboxValidator};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn module_source(functions: usize) -> String {
    let mut src = String::from("pub struct Widget { n: u32 }\n\nimpl Widget {\n");
    for i in 0..functions {
        src.push_str(&format!(
            "    /// Bumps by {i}.\n    pub fn bump_{i}(&mut self, by: u32) -> u32 {{\n        self.n += by + {i};\n        self.n\n    }}\n\n"
        ));
    }
    src.push_str("}\n");
    for i in 0..functions {
        src.push_str(&format!("\npub fn free_{i}(x: u32) -> u32 {{\n    x.wrapping_mul({i})\n}}\n"));
    }
    src
}

fn synthetic_tree(modules: usize, functions: usize) -> tempfile::TempDir {
    let dir = tempfile::tempdir().expect("tempdir");
    std::fs::create_dir_all(dir.path().join("src")).expect("mkdir");
    let mut lib = String::new();
    for m in 0..modules {
        lib.push_str(&format!("pub mod m{m};\n"));
        std::fs::write(dir.path().join(format!("src/m{m}.rs")), module_source(functions)).expect("write module");
    }
    std::fs::write(dir.path().join("src/lib.rs"), lib).expect("write lib");
    dir
}

fn filter() -> SourceFilter {
    SourceFilter::new(vec!["rs".into()], vec!["target".into()])
}

// ---------------------------------------------------------------------------
// Bench: candidate extraction from one file
// ---------------------------------------------------------------------------

fn bench_extract_candidates(c: &mut Criterion) {
    let mut group = c.benchmark_group("extract_candidates");
    for functions in [10usize, 100] {
        let src = module_source(functions);
        group.bench_with_input(BenchmarkId::from_parameter(functions), &src, |b, src| {
            b.iter(|| extract_candidates(Path::new("src/m.rs"), black_box(src)).expect("parse"));
        });
    }
    group.finish();
}

// ---------------------------------------------------------------------------
// Bench: full scan of a synthetic tree
// ---------------------------------------------------------------------------

fn bench_scan_tree(c: &mut Criterion) {
    let tree = synthetic_tree(20, 25);
    let scanner = CandidateScanner::new(tree.path(), filter());
    c.bench_function("scan_20_modules", |b| {
        b.iter(|| black_box(scanner.scan().expect("scan")));
    });
}

// ---------------------------------------------------------------------------
// Bench: whole-tree sandbox validation
// ---------------------------------------------------------------------------

fn bench_validate_tree(c: &mut Criterion) {
    let rt = Runtime::new().expect("runtime");
    let tree = synthetic_tree(20, 25);
    let validator = SandboxValidator::new(
        tree.path(),
        filter(),
        Arc::new(RustStructureCheck),
        Duration::from_secs(60),
    );
    c.bench_function("validate_tree_20_modules", |b| {
        b.to_async(&rt)
            .iter(|| async { black_box(validator.validate_tree().await.expect("validate")) });
    });
}

criterion_group!(benches, bench_extract_candidates, bench_scan_tree, bench_validate_tree);
criterion_main!(benches);
