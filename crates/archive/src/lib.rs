//! Store-only container codec for capture sets.
//!
//! A container is a ZIP-compatible archive whose entries are stored without
//! compression. Both directions stream file contents through fixed 64 KiB
//! buffers, so no file is ever held in memory as a whole.

pub mod crc;
pub mod format;
pub mod reader;
pub mod writer;

use std::fmt;
use thiserror::Error;

pub use crc::{crc32, Crc32};
pub use reader::read_archive;
pub use writer::write_archive;

/// Size of the read and write buffers used while streaming entry data.
pub const CHUNK_SIZE: usize = 64 * 1024;

#[derive(Error, Debug)]
pub enum ArchiveError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("malformed container: {0}")]
    Format(String),
    #[error("container limit exceeded: {0}")]
    TooLarge(String),
}

pub type Result<T> = std::result::Result<T, ArchiveError>;

/// One file stored inside a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Entry {
    pub name: String,
    pub uncompressed_size: u64,
    pub crc32: u32,
    pub local_header_offset: u32,
}

/// Why an entry was left out of an extraction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SkipReason {
    EmptyName,
    /// The name would land outside the destination directory.
    UnsafeName,
    /// Directory entries and nested paths; containers are flat.
    NotAFile,
    Unsupported(String),
    HeaderMismatch(String),
    Truncated,
    ChecksumMismatch { expected: u32, actual: u32 },
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::EmptyName => write!(f, "empty entry name"),
            SkipReason::UnsafeName => write!(f, "entry name escapes the destination"),
            SkipReason::NotAFile => write!(f, "not a flat file entry"),
            SkipReason::Unsupported(what) => write!(f, "unsupported: {}", what),
            SkipReason::HeaderMismatch(what) => write!(f, "local header mismatch: {}", what),
            SkipReason::Truncated => write!(f, "entry data is truncated"),
            SkipReason::ChecksumMismatch { expected, actual } => write!(
                f,
                "checksum mismatch: expected {:08x}, got {:08x}",
                expected, actual
            ),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SkippedEntry {
    pub name: String,
    pub reason: SkipReason,
}

/// Outcome of [`read_archive`]: what landed on disk and what did not.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReadReport {
    pub extracted: Vec<Entry>,
    pub skipped: Vec<SkippedEntry>,
}

impl ReadReport {
    pub fn summary(&self) -> String {
        format!(
            "{} extracted, {} skipped",
            self.extracted.len(),
            self.skipped.len()
        )
    }
}
