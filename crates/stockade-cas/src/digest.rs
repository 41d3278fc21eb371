//! Content-addressed digest type and hashing helpers.
//!
//! A digest is the pair (SHA-256 hash in lowercase hex, size in bytes).
//! Equality is structural; the size participates because the wire
//! protocol transmits both and a mismatch is a distinct failure from a
//! hash mismatch.

use sha2::{Digest as Sha2Digest, Sha256};
use std::fmt;
use std::io::{self, Write};

use crate::error::{CacheError, Result};
use crate::proto;

/// SHA256 hash of the empty byte sequence.
const EMPTY_HASH: &str = "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855";

/// A content-addressed digest (SHA256 hash + size)
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    /// SHA256 hash in lowercase hex format
    pub hash: String,

    /// Size of the content in bytes
    pub size_bytes: i64,
}

impl Digest {
    /// Create a new digest from hash and size.
    ///
    /// The hash must be 64 lowercase hex characters.
    pub fn new(hash: impl Into<String>, size_bytes: i64) -> Result<Self> {
        let hash = hash.into();
        if hash.len() != 64
            || !hash
                .chars()
                .all(|c| c.is_ascii_digit() || ('a'..='f').contains(&c))
        {
            return Err(CacheError::InvalidDigest(hash));
        }
        Ok(Self { hash, size_bytes })
    }

    /// Compute the digest of a byte sequence.
    pub fn of_bytes(bytes: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        Self {
            hash: format!("{:x}", hasher.finalize()),
            size_bytes: bytes.len() as i64,
        }
    }

    /// Compute the digest of an encodable message (canonical proto bytes).
    pub fn of_message(message: &impl prost::Message) -> Self {
        Self::of_bytes(&message.encode_to_vec())
    }

    /// The canonical empty digest.
    pub fn empty() -> Self {
        Self {
            hash: EMPTY_HASH.to_string(),
            size_bytes: 0,
        }
    }

    /// True for the canonical empty blob.
    pub fn is_empty(&self) -> bool {
        self.size_bytes == 0
    }

    pub fn to_proto(&self) -> proto::Digest {
        proto::Digest {
            hash: self.hash.clone(),
            size_bytes: self.size_bytes,
        }
    }

    pub fn from_proto(digest: &proto::Digest) -> Result<Self> {
        Self::new(digest.hash.clone(), digest.size_bytes)
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.hash, self.size_bytes)
    }
}

/// An immutable blob paired with its digest.
#[derive(Debug, Clone)]
pub struct Blob {
    pub digest: Digest,
    pub data: Vec<u8>,
}

impl Blob {
    pub fn new(data: Vec<u8>) -> Self {
        Self {
            digest: Digest::of_bytes(&data),
            data,
        }
    }
}

/// Writer adapter folding every written byte into a running SHA256.
///
/// The hash covers all bytes handed to `write`, independent of what the
/// inner writer does with them (see `SkipWriter`).
pub struct HashingWriter<W> {
    inner: W,
    hasher: Sha256,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
        }
    }

    pub fn get_ref(&self) -> &W {
        &self.inner
    }

    /// Finish hashing, returning the lowercase hex digest and the inner
    /// writer.
    pub fn finish(self) -> (String, W) {
        (format!("{:x}", self.hasher.finalize()), self.inner)
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_of_bytes() {
        let digest = Digest::of_bytes(b"hello world");
        assert_eq!(digest.size_bytes, 11);
        assert_eq!(
            digest.hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn test_new_rejects_bad_hashes() {
        assert!(Digest::new("a".repeat(64), 10).is_ok());
        assert!(Digest::new("a".repeat(32), 10).is_err());
        assert!(Digest::new(format!("{}g", "a".repeat(63)), 10).is_err());
        // uppercase hex is not canonical
        assert!(Digest::new("A".repeat(64), 10).is_err());
    }

    #[test]
    fn test_empty_digest() {
        let empty = Digest::empty();
        assert!(empty.is_empty());
        assert_eq!(empty, Digest::of_bytes(b""));
    }

    #[test]
    fn test_display() {
        let digest = Digest::of_bytes(b"hello");
        assert_eq!(format!("{digest}"), format!("{}/5", digest.hash));
    }

    #[test]
    fn test_hashing_writer_matches_of_bytes() {
        let mut out = HashingWriter::new(Vec::new());
        out.write_all(b"some ").unwrap();
        out.write_all(b"content").unwrap();
        let (hash, inner) = out.finish();
        assert_eq!(inner, b"some content");
        assert_eq!(hash, Digest::of_bytes(b"some content").hash);
    }
}
