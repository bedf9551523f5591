//! End-to-end engine scenarios over a mock provider.

mod common;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use common::{MockBehavior, MockProvider, PhaseSpy, default_engine, engine_with, write_file};
use index::memory::UsageProbe;
use index::progress::IndexPhase;
use index::{IndexError, IndexOptions};
use store::RepositoryStore;
use ziri_core::config::Config;
use ziri_core::repository::RepositoryId;

fn options() -> IndexOptions {
  IndexOptions::default()
}

/// Small-repo full index: text files processed, binary skipped, excluded
/// directories invisible.
#[tokio::test]
async fn full_index_small_repo() {
  let store_dir = tempfile::TempDir::new().unwrap();
  let repo = tempfile::TempDir::new().unwrap();

  write_file(repo.path(), "README.md", "# sample\n".repeat(25).as_bytes());
  write_file(repo.path(), "src/index.js", b"export function main() { return 42; }\n");
  write_file(repo.path(), "src/utils.js", b"export const helper = () => 1;\n");
  // NUL byte in the sniff window marks this binary
  write_file(repo.path(), "src/blob.dat", b"BLOB\x00\x01\x02 definitely not text");
  // Dependency directory is excluded before reading
  write_file(repo.path(), "node_modules/x/index.js", b"module.exports = 1;\n");

  let (engine, provider) = default_engine(store_dir.path());
  let report = engine
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.processed, 3, "three text files indexed");
  assert_eq!(report.skipped, 1, "binary file skipped, excluded file not reported");
  assert_eq!(report.failed, 0);
  assert_eq!(report.deleted, 0);
  assert!(!report.cancelled);
  assert!(report.chunks_embedded >= 3, "at least one chunk per text file");
  assert!(provider.texts_embedded.load(std::sync::atomic::Ordering::SeqCst) >= 3);

  let id = RepositoryId::from_path(repo.path());
  let hashes = engine.store().read_hashes(&id).unwrap();
  assert_eq!(hashes.len(), 3);
  assert!(hashes.contains_key("src/index.js"));
  assert!(!hashes.contains_key("node_modules/x/index.js"));
  assert!(!hashes.contains_key("src/blob.dat"));

  // One vector per chunk, addressable by chunk id
  let chunks = engine.store().list_chunks_for_path(&id, "src/index.js").unwrap();
  assert!(!chunks.is_empty());
  for chunk in &chunks {
    let vector = engine.store().read_vector(&id, &chunk.chunk_id).unwrap().unwrap();
    assert_eq!(vector.vector.len(), 8);
  }
}

/// Re-indexing an unchanged repository touches nothing.
#[tokio::test]
async fn reindex_unchanged_is_noop() {
  let store_dir = tempfile::TempDir::new().unwrap();
  let repo = tempfile::TempDir::new().unwrap();
  write_file(repo.path(), "a.md", b"alpha document with some length to it\n");
  write_file(repo.path(), "b.md", b"beta document, also with some length\n");

  let (engine, provider) = default_engine(store_dir.path());
  let first = engine
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();
  assert_eq!(first.processed, 2);

  let id = RepositoryId::from_path(repo.path());
  let chunk_ids_before: Vec<String> = engine
    .store()
    .list_chunks_for_path(&id, "a.md")
    .unwrap()
    .into_iter()
    .map(|c| c.chunk_id)
    .collect();
  let calls_before = provider.calls.load(std::sync::atomic::Ordering::SeqCst);

  let second = engine
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(second.processed, 0, "no files re-embedded");
  assert_eq!(second.deleted, 0);
  assert_eq!(
    provider.calls.load(std::sync::atomic::Ordering::SeqCst),
    calls_before,
    "no provider calls on a no-change run"
  );

  let chunk_ids_after: Vec<String> = engine
    .store()
    .list_chunks_for_path(&id, "a.md")
    .unwrap()
    .into_iter()
    .map(|c| c.chunk_id)
    .collect();
  assert_eq!(chunk_ids_before, chunk_ids_after, "chunk ids stable across runs");
}

/// Incremental update: modify, add, delete.
#[tokio::test]
async fn incremental_update() {
  let store_dir = tempfile::TempDir::new().unwrap();
  let repo = tempfile::TempDir::new().unwrap();
  write_file(repo.path(), "README.md", b"# readme\nwith a couple of lines\n");
  write_file(repo.path(), "src/index.js", b"export function main() { return 1; }\n");
  write_file(repo.path(), "src/utils.js", b"export const helper = () => 1;\n");

  let (engine, _) = default_engine(store_dir.path());
  engine
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  let id = RepositoryId::from_path(repo.path());
  let readme_ids: Vec<String> = engine
    .store()
    .list_chunks_for_path(&id, "README.md")
    .unwrap()
    .into_iter()
    .map(|c| c.chunk_id)
    .collect();

  // Mutate the tree: one modified, one added, one deleted
  write_file(repo.path(), "src/index.js", b"export function main() { return 2; } // changed\n");
  write_file(repo.path(), "src/new.js", b"export const fresh = true;\n");
  std::fs::remove_file(repo.path().join("src/utils.js")).unwrap();

  let report = engine
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.processed, 2, "modified + added");
  assert_eq!(report.deleted, 1);
  assert_eq!(report.failed, 0);

  let hashes = engine.store().read_hashes(&id).unwrap();
  assert!(!hashes.contains_key("src/utils.js"), "deleted file dropped from hashes");
  assert!(hashes.contains_key("src/new.js"));

  assert!(
    engine.store().list_chunks_for_path(&id, "src/utils.js").unwrap().is_empty(),
    "deleted file has no remaining chunks"
  );
  assert!(!engine.store().list_chunks_for_path(&id, "src/new.js").unwrap().is_empty());

  let readme_ids_after: Vec<String> = engine
    .store()
    .list_chunks_for_path(&id, "README.md")
    .unwrap()
    .into_iter()
    .map(|c| c.chunk_id)
    .collect();
  assert_eq!(readme_ids, readme_ids_after, "unchanged file keeps its chunk ids");
}

/// Rate-limit storm: every 2nd call 429s; retries absorb it all.
#[tokio::test]
async fn rate_limit_storm_retries_to_success() {
  let store_dir = tempfile::TempDir::new().unwrap();
  let repo = tempfile::TempDir::new().unwrap();
  for i in 0..12 {
    write_file(
      repo.path(),
      &format!("src/file_{i}.rs"),
      format!("pub fn handler_{i}() -> usize {{ {i} }}\n").as_bytes(),
    );
  }

  // Small batches force several provider calls so the storm actually hits
  let mut config = Config::default();
  config.performance.batch_size = 10;

  let provider = Arc::new(MockProvider::new("mock", 8, MockBehavior::RateLimitEveryNth(2)));
  let (engine, provider) = engine_with(provider, store_dir.path(), config);

  let report = engine
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.failed, 0, "rate limits must be absorbed by retries");
  assert_eq!(report.processed, 12);
  assert!(report.retries > 0, "report surfaces the retries");
  assert!(provider.calls.load(std::sync::atomic::Ordering::SeqCst) > 1);
}

/// Authentication failure is fatal and surfaces to the caller.
#[tokio::test]
async fn auth_failure_is_fatal() {
  let store_dir = tempfile::TempDir::new().unwrap();
  let repo = tempfile::TempDir::new().unwrap();
  write_file(repo.path(), "a.rs", b"pub fn alpha() {}\n");

  let provider = Arc::new(MockProvider::new("mock", 8, MockBehavior::AuthFail));
  let (engine, _) = engine_with(provider, store_dir.path(), Config::default());

  let result = engine
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await;

  assert!(matches!(result, Err(IndexError::Provider { .. })));

  // The failed run must not have recorded the file as indexed
  let id = RepositoryId::from_path(repo.path());
  let hashes = engine.store().read_hashes(&id).unwrap();
  assert!(!hashes.contains_key("a.rs"));
}

/// Provider switch with a dimension change re-embeds everything and only
/// then updates the recorded dimensions.
#[tokio::test]
async fn dimension_change_reembeds_all() {
  let store_dir = tempfile::TempDir::new().unwrap();
  let repo = tempfile::TempDir::new().unwrap();
  write_file(repo.path(), "a.md", b"first document with enough text\n");
  write_file(repo.path(), "b.md", b"second document with enough text\n");

  let provider_a = Arc::new(MockProvider::new("mock", 8, MockBehavior::Ok));
  let (engine_a, _) = engine_with(provider_a, store_dir.path(), Config::default());
  engine_a
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  let id = RepositoryId::from_path(repo.path());
  let record = engine_a.store().read_metadata(&id).unwrap();
  assert_eq!(record.embedding_dimensions, 8);
  let hashes_before = engine_a.store().read_hashes(&id).unwrap();

  // Same store, new provider with different dimensionality
  let provider_b = Arc::new(MockProvider::new("mock", 16, MockBehavior::Ok));
  let (engine_b, provider_b) = engine_with(provider_b, store_dir.path(), Config::default());
  let report = engine_b
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  assert_eq!(report.processed, 2, "all files re-embedded despite unchanged hashes");

  let record = engine_b.store().read_metadata(&id).unwrap();
  assert_eq!(record.embedding_dimensions, 16, "dimensions updated after completion");

  let hashes_after = engine_b.store().read_hashes(&id).unwrap();
  assert_eq!(hashes_before, hashes_after, "hashes untouched by a re-embed");

  for chunk in engine_b.store().list_chunks_for_path(&id, "a.md").unwrap() {
    let vector = engine_b.store().read_vector(&id, &chunk.chunk_id).unwrap().unwrap();
    assert_eq!(vector.vector.len(), 16, "stored vectors carry the new dimensionality");
  }
  assert!(provider_b.texts_embedded.load(std::sync::atomic::Ordering::SeqCst) >= 2);
}

/// Cancellation checkpoints progress; the next run completes the rest.
#[tokio::test]
async fn cancellation_then_resume_completes() {
  let store_dir = tempfile::TempDir::new().unwrap();
  let repo = tempfile::TempDir::new().unwrap();
  let total_files = 30usize;
  for i in 0..total_files {
    write_file(
      repo.path(),
      &format!("src/mod_{i:02}.rs"),
      format!("pub fn f_{i}() -> usize {{ {i} }}\n").as_bytes(),
    );
  }

  // Slow provider + small batches + single in-flight batch: the run takes
  // several batches, so a prompt cancel lands mid-flight
  let mut config = Config::default();
  config.performance.batch_size = 10;
  config.performance.concurrency = 1;

  let provider = Arc::new(MockProvider::new("mock", 8, MockBehavior::Delay(Duration::from_millis(150))));
  let (engine, _) = engine_with(provider, store_dir.path(), config.clone());

  let cancel = CancellationToken::new();
  {
    let cancel = cancel.clone();
    tokio::spawn(async move {
      tokio::time::sleep(Duration::from_millis(200)).await;
      cancel.cancel();
    });
  }

  let report = engine.index_repository(repo.path(), &options(), cancel).await.unwrap();
  assert!(report.cancelled, "report marked cancelled");
  assert!(report.processed < total_files, "cancelled before completing everything");

  let id = RepositoryId::from_path(repo.path());
  let checkpoint = engine
    .store()
    .latest_checkpoint(&id, store::OperationType::Indexing)
    .unwrap();
  let checkpoint = checkpoint.expect("a checkpoint must exist after cancellation");
  assert_eq!(checkpoint.processed_files.len(), report.processed);

  // Second run with a fast provider finishes the remainder
  let provider = Arc::new(MockProvider::new("mock", 8, MockBehavior::Ok));
  let (engine, _) = engine_with(provider, store_dir.path(), config);
  let second = engine
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  assert!(!second.cancelled);
  assert_eq!(
    report.processed + second.processed,
    total_files,
    "the two runs together cover the repository exactly once"
  );

  let hashes = engine.store().read_hashes(&id).unwrap();
  assert_eq!(hashes.len(), total_files, "every file tracked after resume");

  // Successful completion clears checkpoints
  assert!(
    engine
      .store()
      .latest_checkpoint(&id, store::OperationType::Indexing)
      .unwrap()
      .is_none()
  );
}

/// Memory pressure: chunk production pauses when usage crosses the
/// critical threshold, the sink observes the pause, and the run still
/// completes once pressure clears, surfacing the pause in the report.
#[tokio::test]
async fn memory_pressure_pauses_then_completes() {
  use std::sync::atomic::{AtomicUsize, Ordering};

  let store_dir = tempfile::TempDir::new().unwrap();
  let repo = tempfile::TempDir::new().unwrap();
  let total_files = 20usize;
  for i in 0..total_files {
    write_file(
      repo.path(),
      &format!("src/part_{i:02}.rs"),
      format!("pub fn part_{i}() -> usize {{ {i} }}\n").as_bytes(),
    );
  }

  // Scripted probe against the default 512 MiB limit: the monitor's
  // first sample reads above critical (85% = ~435 MiB), every later
  // sample is back under warning (70% = ~358 MiB). The first sample
  // lands before any file is chunked, so producers block on the gate
  // until the next sample clears it.
  let samples = Arc::new(AtomicUsize::new(0));
  let probe: UsageProbe = {
    let samples = samples.clone();
    Arc::new(move || {
      if samples.fetch_add(1, Ordering::SeqCst) == 0 {
        600 * 1024 * 1024
      } else {
        100 * 1024 * 1024
      }
    })
  };

  let spy = Arc::new(PhaseSpy::default());
  let provider = Arc::new(MockProvider::new("mock", 8, MockBehavior::Ok));
  let (engine, _) = engine_with(provider, store_dir.path(), Config::default());
  let engine = engine.with_sink(spy.clone()).with_memory_probe(probe);

  let report = engine
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  // The pipeline still completes
  assert!(!report.cancelled);
  assert_eq!(report.processed, total_files);
  assert_eq!(report.failed, 0);

  // The pause is surfaced in the completion report...
  assert!(report.memory_pauses >= 1, "report must surface the memory pause");
  assert!(
    report.recommendations().iter().any(|a| a.contains("memory_limit_mb")),
    "pause should produce a memory recommendation"
  );

  // ...and the sink observed the phase transition
  let phases = spy.phases();
  assert!(
    phases.contains(&IndexPhase::Paused),
    "sink must observe a paused phase, saw {phases:?}"
  );
  assert!(samples.load(Ordering::SeqCst) >= 2, "monitor sampled past the pause");
}

/// The store's validate() stays clean after a normal run.
#[tokio::test]
async fn store_validates_after_index() {
  let store_dir = tempfile::TempDir::new().unwrap();
  let repo = tempfile::TempDir::new().unwrap();
  write_file(repo.path(), "a.rs", b"pub fn alpha() -> u8 { 1 }\n");

  let (engine, _) = default_engine(store_dir.path());
  engine
    .index_repository(repo.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  let id = RepositoryId::from_path(repo.path());
  let report = engine.store().validate(&id);
  assert!(report.is_valid(), "errors: {:?}", report.errors);
  assert!(report.warnings.is_empty(), "warnings: {:?}", report.warnings);

  let record = engine.store().read_metadata(&id).unwrap();
  assert!(record.last_indexed.is_some());
  assert_eq!(record.total_chunks, engine.store().chunk_count(&id).unwrap());
}

/// Deleting the repository removes its directory and nothing else.
#[tokio::test]
async fn delete_repository_is_isolated() {
  let store_dir = tempfile::TempDir::new().unwrap();
  let repo_a = tempfile::TempDir::new().unwrap();
  let repo_b = tempfile::TempDir::new().unwrap();
  write_file(repo_a.path(), "a.rs", b"pub fn a() {}\n");
  write_file(repo_b.path(), "b.rs", b"pub fn b() {}\n");

  let (engine, _) = default_engine(store_dir.path());
  engine
    .index_repository(repo_a.path(), &options(), CancellationToken::new())
    .await
    .unwrap();
  engine
    .index_repository(repo_b.path(), &options(), CancellationToken::new())
    .await
    .unwrap();

  let id_a = RepositoryId::from_path(repo_a.path());
  let id_b = RepositoryId::from_path(repo_b.path());

  engine.store().delete_repository(&id_a).unwrap();

  let store = RepositoryStore::new(store_dir.path());
  assert!(store.read_metadata(&id_a).is_err());
  assert!(store.read_metadata(&id_b).is_ok(), "other repositories untouched");
  assert!(!store.read_hashes(&id_b).unwrap().is_empty());
}
