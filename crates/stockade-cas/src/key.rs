//! Blob-key naming.
//!
//! Every blob file under the cache root is named `{hash}_{size}` with an
//! `_exec` suffix for the executable variant; materialized trees live in
//! `{hash}_{size}_dir` directories. The key doubles as the storage-map
//! key, so parsing must be exact: a file whose name does not round-trip
//! is not cache content.

use crate::digest::Digest;
use crate::error::{CacheError, Result};

/// The key for a blob entry with the given executable variant.
pub fn blob_key(digest: &Digest, executable: bool) -> String {
    if executable {
        format!("{}_{}_exec", digest.hash, digest.size_bytes)
    } else {
        format!("{}_{}", digest.hash, digest.size_bytes)
    }
}

/// The directory name holding a materialized tree for the given digest.
pub fn directory_name(digest: &Digest) -> String {
    format!("{}_{}_dir", digest.hash, digest.size_bytes)
}

/// Recover the digest from a blob key, ignoring the executable suffix.
pub fn key_to_digest(key: &str) -> Result<Digest> {
    let mut components = key.split('_');
    let hash = components
        .next()
        .ok_or_else(|| CacheError::InvalidKey(key.to_string()))?;
    let size = components
        .next()
        .and_then(|s| s.parse::<i64>().ok())
        .ok_or_else(|| CacheError::InvalidKey(key.to_string()))?;
    Digest::new(hash, size)
}

/// A parsed blob file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntryKey {
    pub key: String,
    pub size: i64,
    pub executable: bool,
    pub digest: Digest,
}

/// Parse a root dirent name into a blob key.
///
/// Returns `None` for anything that is not a well-formed blob file name,
/// including directory names (`_dir` suffix) and index sidecar files.
pub fn parse_file_entry_key(file_name: &str) -> Option<FileEntryKey> {
    let components: Vec<&str> = file_name.split('_').collect();
    if components.len() < 2 || components.len() > 3 {
        return None;
    }

    let size: i64 = components[1].parse().ok()?;
    let executable = match components.get(2) {
        None => false,
        Some(&"exec") => true,
        Some(_) => return None,
    };

    let digest = Digest::new(components[0], size).ok()?;
    Some(FileEntryKey {
        key: blob_key(&digest, executable),
        size,
        executable,
        digest,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn digest() -> Digest {
        Digest::of_bytes(b"key naming")
    }

    #[test]
    fn test_blob_key_variants() {
        let d = digest();
        assert_eq!(blob_key(&d, false), format!("{}_10", d.hash));
        assert_eq!(blob_key(&d, true), format!("{}_10_exec", d.hash));
        assert_eq!(directory_name(&d), format!("{}_10_dir", d.hash));
    }

    #[test]
    fn test_parse_roundtrip() {
        let d = digest();
        for executable in [false, true] {
            let key = blob_key(&d, executable);
            let parsed = parse_file_entry_key(&key).unwrap();
            assert_eq!(parsed.key, key);
            assert_eq!(parsed.size, 10);
            assert_eq!(parsed.executable, executable);
            assert_eq!(parsed.digest, d);
        }
    }

    #[test]
    fn test_parse_rejects_non_entries() {
        let d = digest();
        // directory names are not blob entries
        assert!(parse_file_entry_key(&directory_name(&d)).is_none());
        // index sidecar files have one component too many
        assert!(parse_file_entry_key(&format!("{}_10_dir_entries", d.hash)).is_none());
        assert!(parse_file_entry_key("directories.sqlite").is_none());
        assert!(parse_file_entry_key(&format!("{}_notasize", d.hash)).is_none());
        assert!(parse_file_entry_key("short_3").is_none());
    }

    #[test]
    fn test_key_to_digest() {
        let d = digest();
        assert_eq!(key_to_digest(&blob_key(&d, false)).unwrap(), d);
        assert_eq!(key_to_digest(&blob_key(&d, true)).unwrap(), d);
        assert!(key_to_digest("garbage").is_err());
    }
}
