//! On-disk repository store.
//!
//! Every indexed repository owns one isolated directory under the base
//! directory (default `~/.ziri`):
//!
//! ```text
//! repositories/<repositoryId>/
//!   metadata.json       repository record
//!   file_hashes.json    relative path -> { hash, size, last_modified }
//!   config.json         effective per-repo configuration
//!   vectors/            one vector record per chunk id
//!   chunks/             chunk descriptors grouped per source path
//!   checkpoints/        numbered checkpoint files
//!   project_summary.md  written by an external collaborator
//! ```
//!
//! Nothing outside this directory is written during indexing; indexing one
//! repository never mutates another's data. All metadata writes go through
//! write-temp + atomic rename so concurrent readers never observe a half
//! written file.

mod checkpoint;
mod chunks;
mod error;
mod hashes;
mod store;

pub use checkpoint::{Checkpoint, CheckpointManager, OperationType};
pub use chunks::{ChunkDescriptor, VectorRecord};
pub use error::{Result, StoreError};
pub use hashes::{FileHashEntry, FileHashMap, HashSnapshot};
pub use store::{RepositoryStore, ValidationReport, default_base_dir};
