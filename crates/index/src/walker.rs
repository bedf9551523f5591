//! File discovery.
//!
//! Streams candidate files from a repository root in deterministic
//! pre-order (entries sorted by file name), applying exclusion globs and a
//! size cap. The walker never reads file contents; text/binary sniffing
//! belongs to the reader.
//!
//! The built-in exclusion list is user-observable behavior ("files I
//! expected to be indexed were not"), so additions here are deliberate.

use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::{debug, trace};
use walkdir::WalkDir;

/// Always-excluded patterns: VCS directories, build outputs, dependency
/// directories, lock files, archives, images, media, OS metadata.
pub const DEFAULT_EXCLUDES: &[&str] = &[
  // VCS
  ".git",
  ".hg",
  ".svn",
  // dependency directories
  "node_modules",
  "vendor",
  "bower_components",
  ".venv",
  "venv",
  "__pycache__",
  // build outputs
  "target",
  "dist",
  "build",
  "out",
  ".next",
  ".nuxt",
  "coverage",
  // editor/tool state
  ".idea",
  ".vscode",
  ".cache",
  // lock files
  "*.lock",
  "package-lock.json",
  "yarn.lock",
  "pnpm-lock.yaml",
  // archives
  "*.zip",
  "*.tar",
  "*.gz",
  "*.tgz",
  "*.bz2",
  "*.xz",
  "*.rar",
  "*.7z",
  "*.jar",
  // images
  "*.png",
  "*.jpg",
  "*.jpeg",
  "*.gif",
  "*.bmp",
  "*.ico",
  "*.webp",
  "*.svg",
  // media
  "*.mp3",
  "*.mp4",
  "*.avi",
  "*.mov",
  "*.mkv",
  "*.wav",
  "*.flac",
  "*.pdf",
  // compiled artifacts
  "*.pyc",
  "*.class",
  "*.o",
  "*.a",
  "*.so",
  "*.dylib",
  "*.dll",
  "*.exe",
  "*.wasm",
  "*.min.js",
  "*.map",
  // OS metadata
  ".DS_Store",
  "Thumbs.db",
];

/// One candidate file emitted by the walker.
#[derive(Debug, Clone)]
pub struct FileInfo {
  pub absolute_path: PathBuf,
  /// Forward-slashed path relative to the walk root.
  pub relative_path: String,
  pub size: u64,
  /// Modification time as unix seconds; 0 when unavailable.
  pub last_modified: i64,
  pub extension: Option<String>,
}

#[derive(Debug)]
pub struct FileWalker {
  root: PathBuf,
  matcher: GlobSet,
  max_file_size: u64,
}

impl FileWalker {
  /// Build a walker over `root`. `extra_patterns` are appended to the
  /// built-in exclusion list; `**` spans path segments, `*` stops at
  /// separators, `?` matches one character, and a pattern without a
  /// separator is anchored at any position.
  pub fn new(root: &Path, extra_patterns: &[String], max_file_size: u64) -> Result<Self, globset::Error> {
    let mut builder = GlobSetBuilder::new();
    for pattern in DEFAULT_EXCLUDES.iter().copied() {
      add_pattern(&mut builder, pattern)?;
    }
    for pattern in extra_patterns {
      add_pattern(&mut builder, pattern)?;
    }

    Ok(Self {
      root: root.to_path_buf(),
      matcher: builder.build()?,
      max_file_size,
    })
  }

  /// Lazy stream of candidate files. Unreadable directories are skipped,
  /// not fatal. Order is deterministic for identical inputs.
  pub fn walk(&self) -> impl Iterator<Item = FileInfo> + '_ {
    WalkDir::new(&self.root)
      .follow_links(false)
      .sort_by_file_name()
      .into_iter()
      .filter_entry(move |entry| {
        // Never filter the root itself
        if entry.depth() == 0 {
          return true;
        }
        let relative = relative_of(&self.root, entry.path());
        let keep = !self.matcher.is_match(relative.as_str());
        if !keep {
          trace!(path = relative, "excluded by pattern");
        }
        keep
      })
      .filter_map(|entry| entry.ok())
      .filter(|entry| entry.file_type().is_file())
      .filter_map(move |entry| {
        let metadata = entry.metadata().ok()?;
        if metadata.len() > self.max_file_size {
          trace!(path = %entry.path().display(), size = metadata.len(), "excluded by size cap");
          return None;
        }

        let relative_path = relative_of(&self.root, entry.path());
        let last_modified = metadata
          .modified()
          .ok()
          .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
          .map(|d| d.as_secs() as i64)
          .unwrap_or(0);
        let extension = entry
          .path()
          .extension()
          .map(|e| e.to_string_lossy().to_string());

        Some(FileInfo {
          absolute_path: entry.path().to_path_buf(),
          relative_path,
          size: metadata.len(),
          last_modified,
          extension,
        })
      })
  }

  /// Collect the full candidate list, logging the total.
  pub fn collect_files(&self) -> Vec<FileInfo> {
    let files: Vec<FileInfo> = self.walk().collect();
    debug!(root = %self.root.display(), count = files.len(), "file discovery complete");
    files
  }
}

/// Compile one exclusion pattern. Patterns without a path separator match
/// at any depth, both as a leaf and as a directory subtree.
fn add_pattern(builder: &mut GlobSetBuilder, pattern: &str) -> Result<(), globset::Error> {
  if pattern.contains('/') {
    builder.add(Glob::new(pattern)?);
    builder.add(Glob::new(&format!("{pattern}/**"))?);
  } else {
    builder.add(Glob::new(&format!("**/{pattern}"))?);
    builder.add(Glob::new(&format!("**/{pattern}/**"))?);
  }
  Ok(())
}

fn relative_of(root: &Path, path: &Path) -> String {
  path
    .strip_prefix(root)
    .unwrap_or(path)
    .to_string_lossy()
    .replace(std::path::MAIN_SEPARATOR, "/")
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  fn touch(root: &Path, rel: &str, bytes: &[u8]) {
    let path = root.join(rel);
    std::fs::create_dir_all(path.parent().unwrap()).unwrap();
    std::fs::write(path, bytes).unwrap();
  }

  fn rel_paths(walker: &FileWalker) -> Vec<String> {
    walker.walk().map(|f| f.relative_path).collect()
  }

  #[test]
  fn test_emits_relative_forward_slashed_paths() {
    let temp = TempDir::new().unwrap();
    touch(temp.path(), "src/lib.rs", b"pub fn x() {}");
    touch(temp.path(), "README.md", b"# readme");

    let walker = FileWalker::new(temp.path(), &[], 1024 * 1024).unwrap();
    let paths = rel_paths(&walker);

    assert!(paths.contains(&"src/lib.rs".to_string()));
    assert!(paths.contains(&"README.md".to_string()));
  }

  #[test]
  fn test_builtin_excludes_apply() {
    let temp = TempDir::new().unwrap();
    touch(temp.path(), "src/main.rs", b"fn main() {}");
    touch(temp.path(), "node_modules/x/index.js", b"module.exports = 1");
    touch(temp.path(), ".git/config", b"[core]");
    touch(temp.path(), "logo.png", b"\x89PNG");
    touch(temp.path(), "Cargo.lock", b"# lock");

    let walker = FileWalker::new(temp.path(), &[], 1024 * 1024).unwrap();
    let paths = rel_paths(&walker);

    assert_eq!(paths, vec!["src/main.rs".to_string()]);
  }

  #[test]
  fn test_caller_patterns_appended() {
    let temp = TempDir::new().unwrap();
    touch(temp.path(), "src/main.rs", b"fn main() {}");
    touch(temp.path(), "generated/api.rs", b"// generated");
    touch(temp.path(), "notes.txt", b"notes");

    let walker = FileWalker::new(temp.path(), &["generated/**".to_string(), "*.txt".to_string()], 1024 * 1024).unwrap();
    let paths = rel_paths(&walker);

    assert_eq!(paths, vec!["src/main.rs".to_string()]);
  }

  #[test]
  fn test_pattern_without_separator_matches_any_depth() {
    let temp = TempDir::new().unwrap();
    touch(temp.path(), "a/deep/path/scratch.tmp", b"x");
    touch(temp.path(), "scratch.tmp", b"x");
    touch(temp.path(), "kept.rs", b"x");

    let walker = FileWalker::new(temp.path(), &["*.tmp".to_string()], 1024 * 1024).unwrap();
    let paths = rel_paths(&walker);

    assert_eq!(paths, vec!["kept.rs".to_string()]);
  }

  #[test]
  fn test_size_cap() {
    let temp = TempDir::new().unwrap();
    touch(temp.path(), "small.rs", b"ok");
    touch(temp.path(), "big.rs", &vec![b'x'; 2048]);

    let walker = FileWalker::new(temp.path(), &[], 1024).unwrap();
    let paths = rel_paths(&walker);

    assert_eq!(paths, vec!["small.rs".to_string()]);
  }

  #[test]
  fn test_deterministic_order() {
    let temp = TempDir::new().unwrap();
    touch(temp.path(), "b.rs", b"b");
    touch(temp.path(), "a.rs", b"a");
    touch(temp.path(), "src/z.rs", b"z");
    touch(temp.path(), "src/y.rs", b"y");

    let walker = FileWalker::new(temp.path(), &[], 1024 * 1024).unwrap();
    let first = rel_paths(&walker);
    let second = rel_paths(&walker);

    assert_eq!(first, second, "order must be deterministic for identical inputs");
  }

  #[test]
  fn test_file_info_fields() {
    let temp = TempDir::new().unwrap();
    touch(temp.path(), "src/lib.rs", b"pub fn x() {}");

    let walker = FileWalker::new(temp.path(), &[], 1024 * 1024).unwrap();
    let info = walker.walk().next().unwrap();

    assert_eq!(info.relative_path, "src/lib.rs");
    assert_eq!(info.size, 13);
    assert!(info.last_modified > 0);
    assert_eq!(info.extension.as_deref(), Some("rs"));
    assert!(info.absolute_path.is_absolute());
  }
}
