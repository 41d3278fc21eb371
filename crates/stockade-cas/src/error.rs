//! Error types for cache operations.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

use crate::digest::Digest;

/// Errors that can occur during cache operations
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("blob not found: {0}")]
    NotFound(Digest),

    #[error("invalid digest: {0}")]
    InvalidDigest(String),

    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    #[error("digest mismatch: expected {expected}, got {actual}")]
    DigestMismatch { expected: Digest, actual: Digest },

    #[error("incomplete blob {key}: committed {committed}, expected {expected}")]
    IncompleteBlob {
        key: String,
        committed: i64,
        expected: i64,
    },

    #[error("entry size {size} exceeds limit {limit}")]
    EntryLimit { size: i64, limit: i64 },

    #[error("{}: {} put failures for {digest}", path.display(), causes.len())]
    PutDirectory {
        path: PathBuf,
        digest: Digest,
        causes: Vec<CacheError>,
    },

    #[error("cannot reserve {requested} bytes: no entries are awaiting expiration")]
    Exhausted { requested: i64 },

    #[error("unknown directories-index backend: {0}")]
    UnknownIndexBackend(String),

    #[error("directories index error: {0}")]
    Index(#[from] rusqlite::Error),
}

pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// True when the underlying cause is a missing file.
    pub fn is_not_found(&self) -> bool {
        match self {
            CacheError::NotFound(_) => true,
            CacheError::Io(e) => e.kind() == io::ErrorKind::NotFound,
            _ => false,
        }
    }
}
