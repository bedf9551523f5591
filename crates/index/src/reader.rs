//! Content reading with binary sniffing.
//!
//! The first 512 bytes decide text vs binary: any NUL byte, or fewer than
//! 70% printable-ASCII-or-common-whitespace bytes, marks the file binary
//! and it is skipped silently. Text is decoded as UTF-8 with lossy
//! substitution. Files above the stream threshold are read in chunks
//! rather than in one allocation.

use std::path::Path;

use tokio::io::AsyncReadExt;
use tracing::trace;

/// Files larger than this are read incrementally.
pub const STREAM_THRESHOLD: u64 = 64 * 1024;

const SNIFF_LEN: usize = 512;
const PRINTABLE_RATIO: f64 = 0.70;
const READ_CHUNK: usize = 64 * 1024;

/// Outcome of reading one file.
#[derive(Debug)]
pub enum FileContent {
  Text(String),
  /// Sniffed as binary; an expected condition, not an error.
  Binary,
}

/// Heuristic text check over the sniff window.
pub fn looks_like_text(bytes: &[u8]) -> bool {
  if bytes.is_empty() {
    return true;
  }
  if bytes.contains(&0) {
    return false;
  }

  let printable = bytes
    .iter()
    .filter(|&&b| (0x20..0x7f).contains(&b) || b == b'\n' || b == b'\r' || b == b'\t')
    .count();

  (printable as f64) / (bytes.len() as f64) >= PRINTABLE_RATIO
}

/// Read a file as text, sniffing the first bytes for binary content.
///
/// The caller has already applied the size cap; `expected_size` only
/// selects between whole-file and streamed reads.
pub async fn read_text(path: &Path, expected_size: u64) -> std::io::Result<FileContent> {
  let mut file = tokio::fs::File::open(path).await?;

  let mut sniff = vec![0u8; SNIFF_LEN];
  let mut filled = 0;
  while filled < sniff.len() {
    let n = file.read(&mut sniff[filled..]).await?;
    if n == 0 {
      break;
    }
    filled += n;
  }
  sniff.truncate(filled);

  if !looks_like_text(&sniff) {
    trace!(path = %path.display(), "binary content, skipping");
    return Ok(FileContent::Binary);
  }

  let mut bytes = sniff;
  if expected_size <= STREAM_THRESHOLD {
    file.read_to_end(&mut bytes).await?;
  } else {
    let mut chunk = vec![0u8; READ_CHUNK];
    loop {
      let n = file.read(&mut chunk).await?;
      if n == 0 {
        break;
      }
      bytes.extend_from_slice(&chunk[..n]);
    }
  }

  Ok(FileContent::Text(String::from_utf8_lossy(&bytes).into_owned()))
}

#[cfg(test)]
mod tests {
  use super::*;
  use tempfile::TempDir;

  #[test]
  fn test_empty_is_text() {
    assert!(looks_like_text(b""));
  }

  #[test]
  fn test_plain_ascii_is_text() {
    assert!(looks_like_text(b"fn main() {\n    println!(\"hi\");\n}\n"));
  }

  #[test]
  fn test_null_byte_is_binary() {
    assert!(!looks_like_text(b"ok so far\x00but not now"));
  }

  #[test]
  fn test_mostly_unprintable_is_binary() {
    let bytes: Vec<u8> = (0..100).map(|i| if i < 20 { b'a' } else { 0x01 }).collect();
    assert!(!looks_like_text(&bytes));
  }

  #[test]
  fn test_ratio_boundary() {
    // Exactly 70% printable passes
    let mut bytes = vec![b'a'; 70];
    bytes.extend(std::iter::repeat_n(0x01u8, 30));
    assert!(looks_like_text(&bytes));

    // Just below fails
    let mut bytes = vec![b'a'; 69];
    bytes.extend(std::iter::repeat_n(0x01u8, 31));
    assert!(!looks_like_text(&bytes));
  }

  #[tokio::test]
  async fn test_read_text_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("a.rs");
    std::fs::write(&path, "fn main() {}\n").unwrap();

    match read_text(&path, 13).await.unwrap() {
      FileContent::Text(content) => assert_eq!(content, "fn main() {}\n"),
      FileContent::Binary => panic!("expected text"),
    }
  }

  #[tokio::test]
  async fn test_read_binary_file() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("a.png");
    std::fs::write(&path, b"\x89PNG\x00\x01\x02binary").unwrap();

    assert!(matches!(read_text(&path, 13).await.unwrap(), FileContent::Binary));
  }

  #[tokio::test]
  async fn test_read_large_file_streams_fully() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("big.txt");
    let content = "line of text\n".repeat(10_000); // ~130 KiB, past the threshold
    std::fs::write(&path, &content).unwrap();

    match read_text(&path, content.len() as u64).await.unwrap() {
      FileContent::Text(read) => assert_eq!(read.len(), content.len()),
      FileContent::Binary => panic!("expected text"),
    }
  }

  #[tokio::test]
  async fn test_invalid_utf8_is_substituted() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("weird.txt");
    let mut bytes = b"almost utf8 ".to_vec();
    bytes.push(0xFF);
    bytes.extend_from_slice(b" and more text to stay mostly printable ascii content here");
    std::fs::write(&path, &bytes).unwrap();

    match read_text(&path, bytes.len() as u64).await.unwrap() {
      FileContent::Text(content) => assert!(content.contains('\u{FFFD}')),
      FileContent::Binary => panic!("expected text"),
    }
  }

  #[tokio::test]
  async fn test_missing_file_is_io_error() {
    let temp = TempDir::new().unwrap();
    let path = temp.path().join("ghost.txt");
    assert!(read_text(&path, 0).await.is_err());
  }
}
