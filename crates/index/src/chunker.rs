//! Character-budget chunker.
//!
//! Splits a text file into overlapping chunks near a target size,
//! preferring to cut at line breaks, then at whitespace, and only then at
//! the raw budget. Chunk ids are a deterministic function of the file
//! path, chunk index and content prefix, so unchanged files produce the
//! same ids run after run.
//!
//! The id digest is a cache key, not a security primitive; it stays MD5
//! for compatibility with existing on-disk stores.

use std::path::Path;

use store::ChunkDescriptor;
use ziri_core::config::RepoConfig;
use ziri_core::estimate_tokens;
use ziri_core::repository::RepositoryId;

/// Chunking geometry.
#[derive(Debug, Clone)]
pub struct ChunkerConfig {
  /// Target chunk size in bytes of UTF-8 text.
  pub target_chars: usize,
  /// Hard upper bound per chunk.
  pub max_chars: usize,
  /// Files at or below this size become one chunk.
  pub min_chars: usize,
  /// Overlap between consecutive chunks as a fraction of the target.
  pub overlap_ratio: f64,
  /// Prefer splitting just after a line break.
  pub respect_line_breaks: bool,
  /// Fall back to splitting just after whitespace.
  pub respect_word_boundaries: bool,
}

impl Default for ChunkerConfig {
  fn default() -> Self {
    Self {
      target_chars: 2000,
      max_chars: 4000,
      min_chars: 120,
      overlap_ratio: 0.15,
      respect_line_breaks: true,
      respect_word_boundaries: true,
    }
  }
}

impl From<&RepoConfig> for ChunkerConfig {
  fn from(config: &RepoConfig) -> Self {
    Self {
      target_chars: config.chunk_target_chars,
      max_chars: config.chunk_max_chars,
      min_chars: config.chunk_min_chars,
      overlap_ratio: config.chunk_overlap_ratio,
      respect_line_breaks: true,
      respect_word_boundaries: true,
    }
  }
}

/// Deterministic chunk id: `chunk_` + first 12 hex digits of
/// MD5(`absolute_path:chunk_index:content[..100 chars]`).
///
/// Collisions within one repository are a programming error for the
/// caller to surface, never silently coalesced here.
pub fn chunk_id(absolute_path: &Path, chunk_index: usize, content: &str) -> String {
  let prefix: String = content.chars().take(100).collect();
  let digest = md5::compute(format!("{}:{}:{}", absolute_path.display(), chunk_index, prefix));
  let hex = format!("{digest:x}");
  format!("chunk_{}", &hex[..12])
}

#[derive(Debug, Clone)]
pub struct Chunker {
  config: ChunkerConfig,
}

impl Default for Chunker {
  fn default() -> Self {
    Self::new(ChunkerConfig::default())
  }
}

impl Chunker {
  pub fn new(config: ChunkerConfig) -> Self {
    Self { config }
  }

  /// Split `content` into chunk descriptors. Empty (all-whitespace) files
  /// produce no chunks.
  pub fn chunk(
    &self,
    content: &str,
    absolute_path: &Path,
    relative_path: &str,
    repository_id: &RepositoryId,
  ) -> Vec<ChunkDescriptor> {
    if content.trim().is_empty() {
      return Vec::new();
    }

    let len = content.len();
    if len <= self.config.min_chars {
      let trimmed = content.trim();
      return vec![self.descriptor(
        trimmed,
        0,
        1,
        1 + count_newlines(trimmed),
        absolute_path,
        relative_path,
        repository_id,
      )];
    }

    let target = self.config.target_chars.min(self.config.max_chars).max(1);
    let overlap = (target as f64 * self.config.overlap_ratio).floor() as usize;

    let mut chunks = Vec::new();
    let mut cursor = 0usize;

    loop {
      let target_end = floor_char_boundary(content, (cursor + target).min(len));
      let actual_end = if target_end >= len {
        len
      } else {
        self.split_point(content, cursor, target_end)
      };

      let raw = &content[cursor..actual_end];
      let trimmed = raw.trim();
      if !trimmed.is_empty() {
        let start_line = count_newlines(&content[..cursor]) + 1;
        let end_line = start_line + count_newlines(trimmed);
        chunks.push(self.descriptor(
          trimmed,
          chunks.len(),
          start_line,
          end_line,
          absolute_path,
          relative_path,
          repository_id,
        ));
      }

      if actual_end >= len {
        break;
      }

      let candidate = actual_end.saturating_sub(overlap).max(cursor + 1);
      let next_cursor = self.overlap_start(content, candidate, actual_end);
      // Guard: a step that does not advance the cursor would loop forever
      if next_cursor <= cursor {
        break;
      }
      cursor = next_cursor;
    }

    chunks
  }

  /// Best split at or before `target_end`: a line break inside the local
  /// window wins, then any whitespace, else the raw budget.
  fn split_point(&self, content: &str, start: usize, target_end: usize) -> usize {
    let span = &content[start..target_end];
    let window = ((target_end - start) / 4).max(1);
    let search_from = floor_char_boundary(span, span.len().saturating_sub(window));
    let tail = &span[search_from..];

    if self.config.respect_line_breaks
      && let Some(after) = last_boundary_after(tail, |c| c == '\n')
    {
      let split = start + search_from + after;
      if split > start {
        return split;
      }
    }

    if self.config.respect_word_boundaries
      && let Some(after) = last_boundary_after(tail, char::is_whitespace)
    {
      let split = start + search_from + after;
      if split > start {
        return split;
      }
    }

    target_end
  }

  /// Start of the next chunk given the overlap candidate position: nudge
  /// forward to just past the next whitespace so the overlap begins on a
  /// word boundary.
  fn overlap_start(&self, content: &str, candidate: usize, actual_end: usize) -> usize {
    let candidate = ceil_char_boundary(content, candidate.min(actual_end));
    if !self.config.respect_word_boundaries || candidate >= actual_end {
      return candidate;
    }

    let span = &content[candidate..actual_end];
    match span.char_indices().find(|&(_, c)| c.is_whitespace()) {
      Some((i, c)) if candidate + i + c.len_utf8() < actual_end => candidate + i + c.len_utf8(),
      _ => candidate,
    }
  }

  #[allow(clippy::too_many_arguments)]
  fn descriptor(
    &self,
    content: &str,
    chunk_index: usize,
    start_line: u32,
    end_line: u32,
    absolute_path: &Path,
    relative_path: &str,
    repository_id: &RepositoryId,
  ) -> ChunkDescriptor {
    let size_chars = content.chars().count();
    ChunkDescriptor {
      chunk_id: chunk_id(absolute_path, chunk_index, content),
      repository_id: repository_id.clone(),
      file_path: absolute_path.to_path_buf(),
      relative_path: relative_path.to_string(),
      start_line,
      end_line,
      size_chars,
      estimated_tokens: estimate_tokens(size_chars),
      content: content.to_string(),
      language: None,
      symbol_kind: None,
    }
  }
}

fn count_newlines(s: &str) -> u32 {
  s.bytes().filter(|&b| b == b'\n').count() as u32
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
  i = i.min(s.len());
  while i > 0 && !s.is_char_boundary(i) {
    i -= 1;
  }
  i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
  i = i.min(s.len());
  while i < s.len() && !s.is_char_boundary(i) {
    i += 1;
  }
  i
}

/// Byte offset just past the last matching char in `span`.
fn last_boundary_after(span: &str, pred: impl Fn(char) -> bool) -> Option<usize> {
  span
    .char_indices()
    .rev()
    .find(|&(_, c)| pred(c))
    .map(|(i, c)| i + c.len_utf8())
}
