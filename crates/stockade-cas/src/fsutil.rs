//! Filesystem helpers for the cache root.
//!
//! Blob files are read-only once installed (write bits cleared for
//! everyone, executable bit matching the key variant) and materialized
//! trees are made fully read-only after population. Removal therefore
//! has to restore owner-write on directories before deleting.

use std::ffi::OsString;
use std::fs::{self, Metadata, Permissions};
use std::io;
use std::os::unix::fs::{MetadataExt, PermissionsExt};
use std::path::Path;

use walkdir::WalkDir;

const READ_ONLY: u32 = 0o444;
const READ_ONLY_EXEC: u32 = 0o555;

/// Identity of a file independent of its name: (device, inode). Hard
/// links to the same blob share a `FileKey`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileKey {
    pub dev: u64,
    pub ino: u64,
}

impl FileKey {
    pub fn of(metadata: &Metadata) -> Self {
        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }
}

/// Clear write bits, setting the executable bits iff requested.
pub fn set_read_only_perms(path: &Path, executable: bool) -> io::Result<()> {
    let mode = if executable { READ_ONLY_EXEC } else { READ_ONLY };
    fs::set_permissions(path, Permissions::from_mode(mode))
}

/// True when the file is executable by its owner and not writable.
pub fn is_read_only_executable(metadata: &Metadata) -> bool {
    let mode = metadata.permissions().mode();
    mode & 0o100 != 0 && mode & 0o222 == 0
}

/// Recursively clear write bits on a tree, directories included.
pub fn disable_all_write_access(root: &Path) -> io::Result<()> {
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::other)?;
        let metadata = entry.metadata().map_err(io::Error::other)?;
        let mode = metadata.permissions().mode() & !0o222;
        fs::set_permissions(entry.path(), Permissions::from_mode(mode))?;
    }
    Ok(())
}

/// Remove a tree that may have had its write bits cleared.
///
/// Restores owner-write on every directory first so unlinking the
/// children succeeds, then removes the whole tree.
pub fn remove_tree(root: &Path) -> io::Result<()> {
    if !root.exists() {
        return Ok(());
    }
    for entry in WalkDir::new(root) {
        let entry = entry.map_err(io::Error::other)?;
        if entry.file_type().is_dir() {
            let metadata = entry.metadata().map_err(io::Error::other)?;
            let mode = metadata.permissions().mode() | 0o200;
            fs::set_permissions(entry.path(), Permissions::from_mode(mode))?;
        }
    }
    fs::remove_dir_all(root)
}

/// Directory entries with metadata, sorted by name.
pub fn list_dirent_sorted(path: &Path) -> io::Result<Vec<(OsString, Metadata)>> {
    let mut dirents = Vec::new();
    for entry in fs::read_dir(path)? {
        let entry = entry?;
        let metadata = entry.metadata()?;
        dirents.push((entry.file_name(), metadata));
    }
    dirents.sort_by(|a, b| a.0.cmp(&b.0));
    Ok(dirents)
}
