//! Secondary index relating blob entries to the directory trees that
//! hard-link them.
//!
//! Forward mapping: directory digest → ordered list of blob keys.
//! Inverse mapping: blob key → set of directory digests. Evicting a
//! blob consults the inverse mapping to find every tree that must be
//! expired with it.
//!
//! Three interchangeable backends: a pure in-memory multimap (the
//! reference), one that persists the forward mapping as a sidecar file
//! per directory, and a sqlite database rebuilt on every start. For any
//! sequence of operations the three observe the same multimap state:
//! `put` replaces the forward mapping but only ever adds inverse
//! pairs, and `remove` retracts exactly the pairs named by the current
//! forward mapping, so re-putting a directory with a different entry
//! list strands the old pairs until `remove_entry` claims them — on
//! every backend alike.

use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, ErrorKind};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use prost::Message;
use rusqlite::{params, Connection};
use tracing::debug;

use crate::digest::Digest;
use crate::error::{CacheError, Result};
use crate::proto;

/// Default sqlite index filename under the cache root.
pub const DEFAULT_DIRECTORIES_INDEX_NAME: &str = "directories.sqlite";
/// Selector for a purely in-memory sqlite database.
pub const DIRECTORIES_INDEX_NAME_MEMORY: &str = ":memory:";

pub trait DirectoriesIndex: Send + Sync {
    fn start(&self) -> Result<()>;
    fn close(&self);

    /// Insert the forward mapping and its inverse pairs.
    fn put(&self, directory: &Digest, entries: &[String]) -> Result<()>;

    /// The forward mapping, ordered as inserted; empty if absent.
    fn directory_entries(&self, directory: &Digest) -> Result<Vec<String>>;

    /// Remove the forward mapping and retract its inverse pairs.
    fn remove(&self, directory: &Digest) -> Result<()>;

    /// Remove every inverse pair for this entry, returning the
    /// directories that referenced it. The caller expires each.
    fn remove_entry(&self, entry: &str) -> Result<HashSet<Digest>>;
}

fn digest_to_blob(digest: &Digest) -> Vec<u8> {
    digest.to_proto().encode_to_vec()
}

fn digest_from_blob(blob: &[u8]) -> Result<Digest> {
    let message = proto::Digest::decode(blob)
        .map_err(|e| CacheError::InvalidDigest(format!("undecodable digest blob: {e}")))?;
    Digest::from_proto(&message)
}

// ============================================================================
// In-memory multimap
// ============================================================================

/// Reference implementation; memory usage is combinatorial in
/// (entries × directories).
#[derive(Default)]
pub struct MemoryDirectoriesIndex {
    state: Mutex<MemoryIndexState>,
}

#[derive(Default)]
struct MemoryIndexState {
    entry_directories: HashMap<String, HashSet<Digest>>,
    directories: HashMap<Digest, Vec<String>>,
}

impl MemoryDirectoriesIndex {
    pub fn new() -> Self {
        Self::default()
    }
}

impl DirectoriesIndex for MemoryDirectoriesIndex {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn put(&self, directory: &Digest, entries: &[String]) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        state.directories.insert(directory.clone(), entries.to_vec());
        for entry in entries {
            state
                .entry_directories
                .entry(entry.clone())
                .or_default()
                .insert(directory.clone());
        }
        Ok(())
    }

    fn directory_entries(&self, directory: &Digest) -> Result<Vec<String>> {
        let state = self.state.lock().unwrap();
        Ok(state.directories.get(directory).cloned().unwrap_or_default())
    }

    fn remove(&self, directory: &Digest) -> Result<()> {
        let mut state = self.state.lock().unwrap();
        let Some(entries) = state.directories.remove(directory) else {
            return Ok(());
        };
        for entry in entries {
            // safe for multiple removal
            if let Some(directories) = state.entry_directories.get_mut(&entry) {
                directories.remove(directory);
                if directories.is_empty() {
                    state.entry_directories.remove(&entry);
                }
            }
        }
        Ok(())
    }

    fn remove_entry(&self, entry: &str) -> Result<HashSet<Digest>> {
        let mut state = self.state.lock().unwrap();
        Ok(state.entry_directories.remove(entry).unwrap_or_default())
    }
}

// ============================================================================
// Per-directory sidecar files
// ============================================================================

/// Forward mapping as one `{hash}_{size}_dir_entries` file per
/// directory under the cache root, one blob key per line; inverse
/// mapping in memory.
pub struct FileDirectoriesIndex {
    root: PathBuf,
    entry_directories: Mutex<HashMap<String, HashSet<Digest>>>,
}

impl FileDirectoriesIndex {
    pub fn new(root: PathBuf) -> Self {
        Self {
            root,
            entry_directories: Mutex::new(HashMap::new()),
        }
    }

    /// Sidecar path for a directory's forward mapping.
    pub fn path(&self, directory: &Digest) -> PathBuf {
        self.root.join(format!(
            "{}_{}_dir_entries",
            directory.hash, directory.size_bytes
        ))
    }

    fn read_entries(&self, directory: &Digest) -> io::Result<Vec<String>> {
        match fs::read_to_string(self.path(directory)) {
            Ok(contents) => Ok(contents
                .lines()
                .filter(|line| !line.is_empty())
                .map(str::to_string)
                .collect()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e),
        }
    }
}

impl DirectoriesIndex for FileDirectoriesIndex {
    fn start(&self) -> Result<()> {
        Ok(())
    }

    fn close(&self) {}

    fn put(&self, directory: &Digest, entries: &[String]) -> Result<()> {
        let mut contents = entries.join("\n");
        if !contents.is_empty() {
            contents.push('\n');
        }
        fs::write(self.path(directory), contents)?;

        let mut inverse = self.entry_directories.lock().unwrap();
        for entry in entries {
            inverse
                .entry(entry.clone())
                .or_default()
                .insert(directory.clone());
        }
        Ok(())
    }

    fn directory_entries(&self, directory: &Digest) -> Result<Vec<String>> {
        Ok(self.read_entries(directory)?)
    }

    fn remove(&self, directory: &Digest) -> Result<()> {
        let entries = self.read_entries(directory)?;
        match fs::remove_file(self.path(directory)) {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        let mut inverse = self.entry_directories.lock().unwrap();
        for entry in entries {
            if let Some(directories) = inverse.get_mut(&entry) {
                directories.remove(directory);
                if directories.is_empty() {
                    inverse.remove(&entry);
                }
            }
        }
        Ok(())
    }

    fn remove_entry(&self, entry: &str) -> Result<HashSet<Digest>> {
        let mut inverse = self.entry_directories.lock().unwrap();
        Ok(inverse.remove(entry).unwrap_or_default())
    }
}

// ============================================================================
// Sqlite
// ============================================================================

/// Sqlite-backed index. The database is ephemeral: any existing file is
/// deleted at construction and the schema is rebuilt on `start`, since
/// the startup rescan recomputes every mapping anyway.
pub struct SqliteDirectoriesIndex {
    db_path: Option<PathBuf>,
    conn: Mutex<Option<Connection>>,
}

impl SqliteDirectoriesIndex {
    pub fn new(root: &Path, db_name: &str) -> Result<Self> {
        let db_path = if db_name == DIRECTORIES_INDEX_NAME_MEMORY {
            None
        } else {
            let path = root.join(db_name);
            match fs::remove_file(&path) {
                Ok(()) => debug!(path = %path.display(), "removed stale directories index"),
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
            Some(path)
        };
        Ok(Self {
            db_path,
            conn: Mutex::new(None),
        })
    }

    /// Open the database and create the schema on first use. The scan
    /// phase repopulates the index before `start` formally runs, so
    /// opening is demand-driven.
    fn with_conn<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let mut guard = self.conn.lock().unwrap();
        if guard.is_none() {
            let conn = match &self.db_path {
                Some(path) => Connection::open(path)?,
                None => Connection::open_in_memory()?,
            };
            conn.execute_batch(
                r#"
                CREATE TABLE IF NOT EXISTS entries (
                    path TEXT NOT NULL,
                    directory BLOB NOT NULL
                );
                CREATE INDEX IF NOT EXISTS path_index ON entries (path);
                CREATE TABLE IF NOT EXISTS directories (
                    directory BLOB PRIMARY KEY,
                    entries TEXT NOT NULL
                );
                "#,
            )?;
            *guard = Some(conn);
        }
        f(guard.as_ref().unwrap())
    }
}

impl DirectoriesIndex for SqliteDirectoriesIndex {
    fn start(&self) -> Result<()> {
        self.with_conn(|_| Ok(()))
    }

    fn close(&self) {
        self.conn.lock().unwrap().take();
    }

    fn put(&self, directory: &Digest, entries: &[String]) -> Result<()> {
        self.with_conn(|conn| {
            let blob = digest_to_blob(directory);
            // inverse pairs are additive, like the memory backend;
            // only remove/remove_entry retract them
            {
                let mut insert =
                    conn.prepare_cached("INSERT INTO entries (path, directory) VALUES (?1, ?2)")?;
                for entry in entries {
                    insert.execute(params![entry, blob])?;
                }
            }
            conn.execute(
                "INSERT OR REPLACE INTO directories (directory, entries) VALUES (?1, ?2)",
                params![blob, entries.join("\n")],
            )?;
            Ok(())
        })
    }

    fn directory_entries(&self, directory: &Digest) -> Result<Vec<String>> {
        self.with_conn(|conn| {
            let blob = digest_to_blob(directory);
            let mut select =
                conn.prepare_cached("SELECT entries FROM directories WHERE directory = ?1")?;
            let mut rows = select.query(params![blob])?;
            match rows.next()? {
                Some(row) => {
                    let joined: String = row.get(0)?;
                    Ok(joined
                        .split('\n')
                        .filter(|line| !line.is_empty())
                        .map(str::to_string)
                        .collect())
                }
                None => Ok(Vec::new()),
            }
        })
    }

    fn remove(&self, directory: &Digest) -> Result<()> {
        self.with_conn(|conn| {
            let blob = digest_to_blob(directory);
            // retract exactly the pairs named by the current forward
            // mapping, like the reference backend
            let entries: Option<String> = {
                let mut select =
                    conn.prepare_cached("SELECT entries FROM directories WHERE directory = ?1")?;
                let mut rows = select.query(params![blob])?;
                match rows.next()? {
                    Some(row) => Some(row.get(0)?),
                    None => None,
                }
            };
            if let Some(joined) = entries {
                let mut delete = conn
                    .prepare_cached("DELETE FROM entries WHERE path = ?1 AND directory = ?2")?;
                for entry in joined.split('\n').filter(|line| !line.is_empty()) {
                    delete.execute(params![entry, blob])?;
                }
            }
            conn.execute(
                "DELETE FROM directories WHERE directory = ?1",
                params![blob],
            )?;
            Ok(())
        })
    }

    fn remove_entry(&self, entry: &str) -> Result<HashSet<Digest>> {
        self.with_conn(|conn| {
            let mut delete =
                conn.prepare_cached("DELETE FROM entries WHERE path = ?1 RETURNING directory")?;
            let mut directories = HashSet::new();
            let mut rows = delete.query(params![entry])?;
            while let Some(row) = rows.next()? {
                let blob: Vec<u8> = row.get(0)?;
                directories.insert(digest_from_blob(&blob)?);
            }
            Ok(directories)
        })
    }
}
