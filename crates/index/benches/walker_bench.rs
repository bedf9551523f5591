//! Benchmarks for file discovery.
//!
//! Run with: cargo bench -p index --bench walker_bench

use std::hint::black_box;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use tempfile::TempDir;

use index::walker::FileWalker;

/// Lay out a synthetic tree with `files` source files plus excluded noise.
fn build_tree(files: usize) -> TempDir {
  let temp = TempDir::new().unwrap();

  for i in 0..files {
    let path = temp.path().join(format!("src/module_{:02}/file_{i}.rs", i % 16));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, format!("pub fn item_{i}() -> usize {{ {i} }}\n")).unwrap();
  }

  // Noise the exclusion list has to reject
  for i in 0..(files / 4) {
    let path = temp.path().join(format!("node_modules/pkg_{i}/index.js"));
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, "module.exports = 1;\n").unwrap();
  }
  std::fs::create_dir_all(temp.path().join(".git")).unwrap();
  std::fs::write(temp.path().join(".git/config"), "[core]\n").unwrap();

  temp
}

fn bench_walk(c: &mut Criterion) {
  let mut group = c.benchmark_group("walk_tree");
  group.sample_size(20);

  for files in [100usize, 1_000] {
    let tree = build_tree(files);
    let walker = FileWalker::new(tree.path(), &[], 1024 * 1024).unwrap();
    group.bench_with_input(BenchmarkId::from_parameter(files), &walker, |b, walker| {
      b.iter(|| {
        let found: Vec<_> = walker.walk().collect();
        black_box(found)
      });
    });
  }
  group.finish();
}

fn bench_extra_patterns(c: &mut Criterion) {
  let tree = build_tree(500);
  let patterns: Vec<String> = vec!["**/*.snap".into(), "generated/**".into(), "*.log".into()];

  let mut group = c.benchmark_group("walk_with_patterns");
  group.sample_size(20);
  group.bench_function("builtin_only", |b| {
    let walker = FileWalker::new(tree.path(), &[], 1024 * 1024).unwrap();
    b.iter(|| black_box(walker.walk().count()));
  });
  group.bench_function("builtin_plus_extra", |b| {
    let walker = FileWalker::new(tree.path(), &patterns, 1024 * 1024).unwrap();
    b.iter(|| black_box(walker.walk().count()));
  });
  group.finish();
}

criterion_group!(benches, bench_walk, bench_extra_patterns);
criterion_main!(benches);
