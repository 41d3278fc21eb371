//! # stockade-cas
//!
//! Content-addressable blob cache for a remote-execution worker.
//!
//! Blobs are immutable files under a single root, named by their digest
//! (`{hash}_{size}`, with an `_exec` variant carrying the executable
//! bit), and installed via hard links so partial writes are never
//! visible. Action input trees are materialized as `{hash}_{size}_dir`
//! directories of hard links into the blob files and made fully
//! read-only.
//!
//! A total size budget is enforced by reference-counted LRU eviction:
//! entries with live references are pinned, everything else sits on an
//! LRU list and is evicted least-recently-used first, cascading to any
//! materialized tree that linked the evicted blob. An optional delegate
//! cache serves read-through misses and receives write-through copies
//! of evicted blobs.
//!
//! ## Layout under the root
//!
//! ```text
//! root/
//! ├── {hash}_{size}            # blob, read-only
//! ├── {hash}_{size}_exec       # blob, read-only + executable
//! ├── {hash}_{size}.{uuid}     # in-flight write, invisible to readers
//! ├── {hash}_{size}_dir/…      # materialized tree, fully read-only
//! └── directories.sqlite       # entry/directory index (one backend)
//! ```

pub mod digest;
pub mod error;
pub mod index;
pub mod proto;

mod entry;
mod fsutil;
mod key;
mod lock_map;
mod read_through;
mod startup;
mod write;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{self, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::{mpsc, Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use rayon::prelude::*;
use tracing::{debug, error, info};
use uuid::Uuid;

pub use crate::digest::{Blob, Digest, HashingWriter};
pub use crate::error::{CacheError, Result};
pub use crate::fsutil::FileKey;
pub use crate::index::{
    DirectoriesIndex, FileDirectoriesIndex, MemoryDirectoriesIndex, SqliteDirectoriesIndex,
    DEFAULT_DIRECTORIES_INDEX_NAME, DIRECTORIES_INDEX_NAME_MEMORY,
};
pub use crate::key::{blob_key, directory_name, key_to_digest, parse_file_entry_key, FileEntryKey};
pub use crate::read_through::ReadThroughInput;
pub use crate::startup::{CacheLoadResults, CacheScanResults, StartupCacheResults};
pub use crate::write::{BlobWriter, Write, WriteFence};

use crate::entry::{EntryArena, EntryId, EXISTS_WINDOW};
use crate::fsutil::{disable_all_write_access, remove_tree, set_read_only_perms};
use crate::lock_map::LockMap;
use crate::write::{ActiveWrite, WriteKey};

/// Idle writes are reclaimed (and their side files deleted) after this.
const WRITE_IDLE_TTL: Duration = Duration::from_secs(60 * 60);
/// Minimum spacing between write-registry sweeps.
const WRITE_PRUNE_INTERVAL: Duration = Duration::from_secs(60);

/// The shared storage interface: the facade implements it, and an
/// optional delegate with the same shape backs misses (read-through)
/// and receives evictions (write-through).
pub trait ContentAddressableStorage: Send + Sync {
    fn contains(&self, digest: &Digest) -> bool;
    fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>>;
    fn new_input(&self, digest: &Digest, offset: i64) -> Result<Box<dyn Read + Send>>;
    fn ingest(&self, digest: &Digest, source: &mut dyn Read) -> Result<()>;
}

pub type PutHook = Box<dyn Fn(&Digest) + Send + Sync>;
pub type PutAllHook = Box<dyn Fn(&[Digest]) + Send + Sync>;

/// Which directories-index backend to instantiate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBackend {
    Memory,
    File,
    Sqlite,
}

/// Construction parameters for a [`FileCache`].
pub struct CacheOptions {
    pub root: PathBuf,
    pub max_size_in_bytes: i64,
    pub max_entry_size_in_bytes: i64,
    pub index_backend: IndexBackend,
    pub index_db_name: String,
    pub expire_threads: usize,
    pub access_threads: usize,
    pub on_put: Option<PutHook>,
    pub on_put_all: Option<PutAllHook>,
    pub on_expire: Option<PutAllHook>,
    pub delegate: Option<Arc<dyn ContentAddressableStorage>>,
}

impl CacheOptions {
    pub fn new(root: PathBuf, max_size_in_bytes: i64, max_entry_size_in_bytes: i64) -> Self {
        Self {
            root,
            max_size_in_bytes,
            max_entry_size_in_bytes,
            index_backend: IndexBackend::Sqlite,
            index_db_name: DEFAULT_DIRECTORIES_INDEX_NAME.to_string(),
            expire_threads: 2,
            access_threads: 1,
            on_put: None,
            on_put_all: None,
            on_expire: None,
            delegate: None,
        }
    }
}

/// A materialized directory registered with the cache.
pub(crate) struct DirectoryEntry {
    pub(crate) directory: proto::Directory,
    pub(crate) exists_deadline: Instant,
}

/// Everything guarded by the cache monitor.
pub(crate) struct CacheState {
    pub(crate) storage: HashMap<String, EntryId>,
    pub(crate) lru: EntryArena,
    pub(crate) directories: HashMap<Digest, DirectoryEntry>,
    pub(crate) size_in_bytes: i64,
    pub(crate) unreferenced_count: i64,
    pub(crate) removed_count: u64,
    pub(crate) removed_size: i64,
}

impl CacheState {
    fn new() -> Self {
        Self {
            storage: HashMap::new(),
            lru: EntryArena::new(),
            directories: HashMap::new(),
            size_in_bytes: 0,
            unreferenced_count: 0,
            removed_count: 0,
            removed_size: 0,
        }
    }
}

pub(crate) struct WriteRecord {
    pub(crate) fence: Arc<WriteFence>,
    pub(crate) last_access: Instant,
}

pub(crate) struct CacheInner {
    pub(crate) root: PathBuf,
    pub(crate) max_size_in_bytes: i64,
    pub(crate) max_entry_size_in_bytes: i64,
    pub(crate) index_db_name: String,
    pub(crate) state: Mutex<CacheState>,
    pub(crate) space_freed: Condvar,
    pub(crate) directories_index: Box<dyn DirectoriesIndex>,
    pub(crate) locks: LockMap,
    pub(crate) writes: DashMap<WriteKey, WriteRecord>,
    pub(crate) write_fences: DashMap<Digest, Arc<WriteFence>>,
    pub(crate) last_write_prune: Mutex<Instant>,
    pub(crate) delegate: Option<Arc<dyn ContentAddressableStorage>>,
    pub(crate) on_put: PutHook,
    pub(crate) on_put_all: PutAllHook,
    pub(crate) on_expire: PutAllHook,
    pub(crate) expire_pool: rayon::ThreadPool,
    pub(crate) access_pool: rayon::ThreadPool,
}

/// The content-addressable file cache. Cheap to clone; all clones share
/// one state.
#[derive(Clone)]
pub struct FileCache {
    pub(crate) inner: Arc<CacheInner>,
}

enum ReserveOutcome {
    /// The key was already present; a reference was taken.
    Referenced,
    /// Space was reserved; any evictions needed are in flight.
    Reserved {
        expirations: Vec<mpsc::Receiver<Option<Digest>>>,
    },
}

impl FileCache {
    pub fn new(options: CacheOptions) -> Result<Self> {
        let directories_index: Box<dyn DirectoriesIndex> = match options.index_backend {
            IndexBackend::Memory => Box::new(MemoryDirectoriesIndex::new()),
            IndexBackend::File => Box::new(FileDirectoriesIndex::new(options.root.clone())),
            IndexBackend::Sqlite => Box::new(SqliteDirectoriesIndex::new(
                &options.root,
                &options.index_db_name,
            )?),
        };
        let expire_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.expire_threads.max(1))
            .thread_name(|i| format!("cache-expire-{i}"))
            .build()
            .map_err(io::Error::other)?;
        let access_pool = rayon::ThreadPoolBuilder::new()
            .num_threads(options.access_threads.max(1))
            .thread_name(|i| format!("cache-access-{i}"))
            .build()
            .map_err(io::Error::other)?;

        Ok(Self {
            inner: Arc::new(CacheInner {
                root: options.root,
                max_size_in_bytes: options.max_size_in_bytes,
                max_entry_size_in_bytes: options.max_entry_size_in_bytes,
                index_db_name: options.index_db_name,
                state: Mutex::new(CacheState::new()),
                space_freed: Condvar::new(),
                directories_index,
                locks: LockMap::new(),
                writes: DashMap::new(),
                write_fences: DashMap::new(),
                last_write_prune: Mutex::new(Instant::now()),
                delegate: options.delegate,
                on_put: options.on_put.unwrap_or_else(|| Box::new(|_| {})),
                on_put_all: options.on_put_all.unwrap_or_else(|| Box::new(|_| {})),
                on_expire: options.on_expire.unwrap_or_else(|| Box::new(|_| {})),
                expire_pool,
                access_pool,
            }),
        })
    }

    /// Build a cache from the worker's `[cache]` configuration section.
    pub fn from_config(config: &stockade_config::CacheConfig) -> Result<Self> {
        let index_backend = match config.index_backend.as_str() {
            "memory" => IndexBackend::Memory,
            "file" => IndexBackend::File,
            "sqlite" => IndexBackend::Sqlite,
            other => return Err(CacheError::UnknownIndexBackend(other.to_string())),
        };
        let mut options = CacheOptions::new(
            config.root.clone(),
            config.max_size_bytes,
            config.max_entry_size_bytes,
        );
        options.index_backend = index_backend;
        options.index_db_name = config.index_db_name.clone();
        Self::new(options)
    }

    pub fn root(&self) -> &Path {
        &self.inner.root
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.inner.root.join(name)
    }

    pub fn directory_path(&self, digest: &Digest) -> PathBuf {
        self.path(&directory_name(digest))
    }

    /// The ordered blob keys a materialized directory links.
    pub fn directory_entries(&self, digest: &Digest) -> Result<Vec<String>> {
        self.inner.directories_index.directory_entries(digest)
    }

    pub fn max_entry_size(&self) -> i64 {
        self.inner.max_entry_size_in_bytes
    }

    // ========================================================================
    // Observability
    // ========================================================================

    /// Total bytes of live entries (including in-flight reservations).
    pub fn size(&self) -> i64 {
        self.inner.state.lock().unwrap().size_in_bytes
    }

    pub fn entry_count(&self) -> usize {
        self.inner.state.lock().unwrap().storage.len()
    }

    pub fn unreferenced_entry_count(&self) -> i64 {
        self.inner.state.lock().unwrap().unreferenced_count
    }

    pub fn directory_storage_count(&self) -> usize {
        self.inner.state.lock().unwrap().directories.len()
    }

    /// Entries evicted since the last call; drains the counter.
    pub fn evicted_count(&self) -> u64 {
        let mut state = self.inner.state.lock().unwrap();
        std::mem::take(&mut state.removed_count)
    }

    /// Bytes evicted since the last call; drains the counter.
    pub fn evicted_size(&self) -> i64 {
        let mut state = self.inner.state.lock().unwrap();
        std::mem::take(&mut state.removed_size)
    }

    // ========================================================================
    // Presence
    // ========================================================================

    pub(crate) fn contains_local(&self, digest: &Digest) -> Option<String> {
        let state = self.inner.state.lock().unwrap();
        for executable in [false, true] {
            let key = blob_key(digest, executable);
            if state.storage.contains_key(&key) {
                return Some(key);
            }
        }
        None
    }

    /// True if the blob is present locally (either variant) or in the
    /// delegate. A local hit refreshes the entry's LRU position.
    pub fn contains(&self, digest: &Digest) -> bool {
        if let Some(key) = self.contains_local(digest) {
            self.accessed(vec![key]);
            return true;
        }
        match &self.inner.delegate {
            Some(delegate) => delegate.contains(digest),
            None => false,
        }
    }

    /// The subset of `digests` present nowhere. Found entries have
    /// their access recorded; the remainder is forwarded to the
    /// delegate when one is configured.
    pub fn find_missing_blobs(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        let mut found = Vec::new();
        let mut missing = Vec::new();
        for digest in digests {
            match self.contains_local(digest) {
                Some(key) => found.push(key),
                None => missing.push(digest.clone()),
            }
        }
        if !found.is_empty() {
            self.accessed(found);
        }
        if missing.is_empty() {
            return Ok(missing);
        }
        match &self.inner.delegate {
            Some(delegate) => delegate.find_missing(&missing),
            None => Ok(missing),
        }
    }

    /// Record LRU touches off the caller's thread.
    fn accessed(&self, keys: Vec<String>) {
        let cache = self.clone();
        self.inner.access_pool.spawn(move || {
            let mut state = cache.inner.state.lock().unwrap();
            let state_ref = &mut *state;
            for key in &keys {
                if let Some(&id) = state_ref.storage.get(key.as_str()) {
                    state_ref.lru.record_access(id);
                }
            }
        });
    }

    // ========================================================================
    // Read path
    // ========================================================================

    /// Open a stream over the blob. Local content is served directly; a
    /// miss with a delegate becomes a read-through that populates the
    /// cache as it streams, unless the blob exceeds the entry limit, in
    /// which case the delegate's stream is surfaced as-is.
    pub fn new_input(&self, digest: &Digest, offset: i64) -> Result<Box<dyn Read + Send>> {
        match self.new_local_input(digest, offset) {
            Ok(input) => return Ok(input),
            Err(e) if e.is_not_found() && self.inner.delegate.is_some() => {}
            Err(e) => return Err(e),
        }
        if digest.size_bytes == 0 {
            return Ok(Box::new(io::empty()));
        }
        if digest.size_bytes > self.inner.max_entry_size_in_bytes {
            return self.delegate_input(digest, offset);
        }
        let write = self.get_write(digest, Uuid::new_v4())?;
        Ok(Box::new(ReadThroughInput::new(
            self.clone(),
            digest.clone(),
            offset,
            &write,
        )?))
    }

    /// Read the whole blob; `None` when it is nowhere to be found.
    pub fn get(&self, digest: &Digest) -> Result<Option<Blob>> {
        match self.new_input(digest, 0) {
            Ok(mut input) => {
                let mut data = Vec::new();
                input.read_to_end(&mut data)?;
                Ok(Some(Blob {
                    digest: digest.clone(),
                    data,
                }))
            }
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn new_local_input(&self, digest: &Digest, offset: i64) -> Result<Box<dyn Read + Send>> {
        debug!("getting input stream for {digest}");
        for executable in [false, true] {
            let key = blob_key(digest, executable);
            loop {
                let id = {
                    let state = self.inner.state.lock().unwrap();
                    state.storage.get(&key).copied()
                };
                let Some(id) = id else { break };
                match File::open(self.path(&key)) {
                    Ok(mut file) => {
                        if offset > 0 {
                            file.seek(SeekFrom::Start(offset as u64))?;
                        }
                        self.accessed(vec![key]);
                        return Ok(Box::new(file));
                    }
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {
                        // the file vanished out from under the entry;
                        // heal the map and retry
                        let removed = {
                            let mut state = self.inner.state.lock().unwrap();
                            let state_ref = &mut *state;
                            if state_ref.storage.get(&key) == Some(&id) {
                                let dirs = self.remove_entry_locked(state_ref, &key, id);
                                self.spawn_directory_removals(dirs);
                                true
                            } else {
                                false
                            }
                        };
                        if removed && executable {
                            (self.inner.on_expire)(std::slice::from_ref(digest));
                        }
                    }
                    Err(e) => return Err(e.into()),
                }
            }
        }
        Err(CacheError::NotFound(digest.clone()))
    }

    pub(crate) fn delegate_input(
        &self,
        digest: &Digest,
        offset: i64,
    ) -> Result<Box<dyn Read + Send>> {
        match &self.inner.delegate {
            Some(delegate) => delegate.new_input(digest, offset),
            None => Err(CacheError::NotFound(digest.clone())),
        }
    }

    /// Local content if present, else straight from the delegate.
    pub(crate) fn transparent_input(
        &self,
        digest: &Digest,
        offset: i64,
    ) -> Result<Box<dyn Read + Send>> {
        match self.new_local_input(digest, offset) {
            Ok(input) => Ok(input),
            Err(e) if e.is_not_found() => self.delegate_input(digest, offset),
            Err(e) => Err(e),
        }
    }

    // ========================================================================
    // Write path
    // ========================================================================

    /// Ingest a blob as a non-executable entry. Idempotent on
    /// collision; ingestion failures are logged, not surfaced.
    pub fn put(&self, blob: Blob) {
        if blob.digest.size_bytes == 0 {
            return;
        }
        let key = blob_key(&blob.digest, false);
        debug!("put: {key}");
        let result = (|| -> Result<()> {
            match self.put_impl(&key, Uuid::new_v4(), blob.digest.size_bytes, false, true)? {
                Some(mut writer) => {
                    if let Err(e) = io::Write::write_all(&mut writer, &blob.data) {
                        let _ = writer.cancel();
                        return Err(e.into());
                    }
                    writer.commit()
                }
                None => {
                    self.decrement_reference_by_key(&key);
                    Ok(())
                }
            }
        })();
        if let Err(e) = result {
            error!("error putting {}: {e}", blob.digest);
        }
    }

    /// A resumable write handle for the digest. The zero-size blob gets
    /// a trivially-complete handle; oversize blobs fail fast.
    pub fn get_write(&self, digest: &Digest, id: Uuid) -> Result<Write> {
        if digest.size_bytes == 0 {
            return Ok(Write::completed(self.clone(), digest.clone(), id));
        }
        if digest.size_bytes > self.inner.max_entry_size_in_bytes {
            return Err(CacheError::EntryLimit {
                size: digest.size_bytes,
                limit: self.inner.max_entry_size_in_bytes,
            });
        }
        self.prune_writes();
        let fence = self.write_fence(digest);
        let write_key = WriteKey {
            digest: digest.clone(),
            id,
        };
        self.inner
            .writes
            .entry(write_key)
            .and_modify(|record| record.last_access = Instant::now())
            .or_insert_with(|| WriteRecord {
                fence: fence.clone(),
                last_access: Instant::now(),
            });
        Ok(Write::new(self.clone(), digest.clone(), id, fence))
    }

    /// Fetch the blob from the backing source into the cache, taking a
    /// reference, and return the installed path. Used by directory
    /// materialization; the empty blob never takes this path.
    pub fn put_file(&self, digest: &Digest, executable: bool) -> Result<PathBuf> {
        assert!(digest.size_bytes > 0, "file entries may not be empty");
        let key = blob_key(digest, executable);
        match self.put_impl(&key, Uuid::new_v4(), digest.size_bytes, executable, false)? {
            None => Ok(self.path(&key)),
            Some(mut writer) => {
                debug!("downloading {digest}");
                let mut source = match self.external_input(digest) {
                    Ok(source) => source,
                    Err(e) => {
                        let _ = writer.cancel();
                        return Err(e);
                    }
                };
                if let Err(e) = io::copy(&mut source, &mut writer) {
                    error!("error downloading {digest}: {e}");
                    let _ = writer.cancel();
                    return Err(e.into());
                }
                writer.commit()?;
                Ok(self.path(&key))
            }
        }
    }

    fn external_input(&self, digest: &Digest) -> Result<Box<dyn Read + Send>> {
        self.delegate_input(digest, 0)
    }

    pub(crate) fn open_write_stream(&self, digest: &Digest, id: Uuid) -> Result<BlobWriter> {
        let key = blob_key(digest, false);
        debug!("get_write: {key}");
        match self.put_impl(&key, id, digest.size_bytes, false, true)? {
            Some(writer) => Ok(writer),
            None => {
                // already present; the caller's bytes go nowhere
                self.decrement_reference_by_key(&key);
                Ok(BlobWriter::discard())
            }
        }
    }

    /// Reserve space (evicting as needed) and open the side-file
    /// stream. `None` means the key was present and a reference was
    /// taken instead.
    fn put_impl(
        &self,
        key: &str,
        write_id: Uuid,
        size: i64,
        executable: bool,
        release_on_commit: bool,
    ) -> Result<Option<BlobWriter>> {
        if size > self.inner.max_entry_size_in_bytes {
            return Err(CacheError::EntryLimit {
                size,
                limit: self.inner.max_entry_size_in_bytes,
            });
        }
        let expirations = match self.reserve(key, size)? {
            ReserveOutcome::Referenced => return Ok(None),
            ReserveOutcome::Reserved { expirations } => expirations,
        };

        // settle evictions so the report reaches the hook before the
        // caller proceeds
        let mut expired = Vec::new();
        for expiration in expirations {
            match expiration.recv() {
                Ok(Some(digest)) => expired.push(digest),
                Ok(None) => {}
                Err(_) => error!("eviction task terminated abnormally"),
            }
        }
        if !expired.is_empty() {
            (self.inner.on_expire)(&expired);
        }

        debug!("entry {key} is missing, populating");
        match ActiveWrite::create(
            self.clone(),
            key.to_string(),
            size,
            executable,
            write_id,
            release_on_commit,
        ) {
            Ok(active) => Ok(Some(BlobWriter::active(active))),
            Err(e) => {
                self.discharge_and_notify(size);
                Err(e)
            }
        }
    }

    fn reserve(&self, key: &str, size: i64) -> Result<ReserveOutcome> {
        let inner = &*self.inner;
        let mut guard = inner.state.lock().unwrap();
        if self.reference_if_exists_locked(&mut guard, key)? {
            return Ok(ReserveOutcome::Referenced);
        }
        guard.size_in_bytes += size;
        let mut expirations = Vec::new();
        while guard.size_in_bytes > inner.max_size_in_bytes {
            match guard.lru.lru_head() {
                Some(head) => {
                    let expiration = self.evict_locked(&mut guard, head);
                    expirations.push(expiration);
                }
                None => {
                    if guard.storage.is_empty() {
                        guard.size_in_bytes -= size;
                        return Err(CacheError::Exhausted { requested: size });
                    }
                    info!(
                        over_budget = guard.size_in_bytes - inner.max_size_in_bytes,
                        keys = guard.storage.len(),
                        "unreferenced list is empty, waiting for a release"
                    );
                    guard = inner.space_freed.wait(guard).unwrap();
                }
            }
        }
        Ok(ReserveOutcome::Reserved { expirations })
    }

    // ========================================================================
    // Entry bookkeeping (monitor-guarded helpers)
    // ========================================================================

    /// Install a fresh entry (one reference) unless the key is taken.
    pub(crate) fn try_insert_entry(&self, key: &str, size: i64) -> bool {
        let mut state = self.inner.state.lock().unwrap();
        let state_ref = &mut *state;
        if state_ref.storage.contains_key(key) {
            return false;
        }
        let id = state_ref.lru.insert(key.to_string(), size);
        state_ref.storage.insert(key.to_string(), id);
        true
    }

    pub(crate) fn reference_if_exists(&self, key: &str) -> Result<bool> {
        let mut state = self.inner.state.lock().unwrap();
        self.reference_if_exists_locked(&mut state, key)
    }

    fn reference_if_exists_locked(&self, state: &mut CacheState, key: &str) -> Result<bool> {
        let Some(&id) = state.storage.get(key) else {
            return Ok(false);
        };
        let exists = {
            let now = Instant::now();
            let path = self.path(key);
            let entry = state.lru.get_mut(id).expect("storage maps to a live entry");
            if entry.exists_deadline > now {
                true
            } else if path.exists() {
                entry.exists_deadline = now + EXISTS_WINDOW;
                true
            } else {
                false
            }
        };
        if !exists {
            let dirs = self.remove_entry_locked(state, key, id);
            self.spawn_directory_removals(dirs);
            return Ok(false);
        }
        if state.lru.increment_reference(id) {
            state.unreferenced_count -= 1;
        }
        Ok(true)
    }

    pub(crate) fn decrement_reference_by_key(&self, key: &str) {
        let keys = [key.to_string()];
        let mut state = self.inner.state.lock().unwrap();
        let freed = self.decrement_keys_locked(&mut state, &keys);
        if freed > 0 {
            state.unreferenced_count += freed;
            self.inner.space_freed.notify_all();
        }
    }

    /// Atomically release references for an action's inputs, waking
    /// anyone waiting on freed space.
    pub fn decrement_references(
        &self,
        input_files: &[String],
        input_directories: &[Digest],
    ) -> Result<()> {
        let mut state = self.inner.state.lock().unwrap();
        let mut freed = self.decrement_keys_locked(&mut state, input_files);
        for directory in input_directories {
            assert!(
                state.directories.contains_key(directory),
                "input directory {directory} is not in directory storage"
            );
            let entries = self.inner.directories_index.directory_entries(directory)?;
            freed += self.decrement_keys_locked(&mut state, &entries);
        }
        if freed > 0 {
            state.unreferenced_count += freed;
            self.inner.space_freed.notify_all();
        }
        Ok(())
    }

    fn decrement_keys_locked(&self, state: &mut CacheState, keys: &[String]) -> i64 {
        let mut freed = 0;
        for key in keys {
            let Some(&id) = state.storage.get(key.as_str()) else {
                panic!("{key} has been removed with references");
            };
            if state.lru.decrement_reference(id) {
                freed += 1;
            }
        }
        freed
    }

    pub(crate) fn discharge_and_notify(&self, size: i64) {
        let mut state = self.inner.state.lock().unwrap();
        state.size_in_bytes -= size;
        state.removed_count += 1;
        state.removed_size += size;
        self.inner.space_freed.notify_all();
    }

    /// Drop an entry from the map and LRU, retract it from the index,
    /// expire every directory that referenced it, and discharge its
    /// size. Returns the directory trees to remove from disk.
    fn remove_entry_locked(&self, state: &mut CacheState, key: &str, id: EntryId) -> Vec<PathBuf> {
        state.storage.remove(key);
        if state.lru.is_linked(id) {
            state.lru.unlink(id);
            state.unreferenced_count -= 1;
        } else if state.lru.get(id).map(|e| e.ref_count > 0).unwrap_or(false) {
            error!("removed referenced entry {key}");
        }
        let containing = match self.inner.directories_index.remove_entry(key) {
            Ok(containing) => containing,
            Err(e) => {
                error!("error removing entry {key} from directories index: {e}");
                Default::default()
            }
        };
        let mut dirs = Vec::new();
        for directory in containing {
            if state.directories.remove(&directory).is_none() {
                error!("expired directory {directory} was not in directory storage");
            }
            dirs.push(self.directory_path(&directory));
        }
        let entry = state.lru.remove(id);
        state.size_in_bytes -= entry.size;
        state.removed_count += 1;
        state.removed_size += entry.size;
        self.inner.space_freed.notify_all();
        dirs
    }

    fn spawn_directory_removals(&self, dirs: Vec<PathBuf>) {
        if dirs.is_empty() {
            return;
        }
        self.inner.expire_pool.spawn(move || {
            for dir in dirs {
                if let Err(e) = remove_tree(&dir) {
                    error!("error removing expired directory {}: {e}", dir.display());
                }
            }
        });
    }

    // ========================================================================
    // Eviction
    // ========================================================================

    /// Evict the least-recently-used entry. Directory-tree and blob
    /// file removal run on the expire pool; the receiver yields the
    /// evicted digest, or `None` when the other executable variant
    /// still holds the content.
    fn evict_locked(
        &self,
        state: &mut CacheState,
        head: EntryId,
    ) -> mpsc::Receiver<Option<Digest>> {
        let (key, _size) = {
            let entry = state.lru.get(head).expect("lru head resolves");
            assert!(
                entry.ref_count == 0,
                "reference-count lru ordering has not been maintained: {} has {} references",
                entry.key,
                entry.ref_count
            );
            (entry.key.clone(), entry.size)
        };

        // write-through to the delegate, best effort
        if let Some(delegate) = &self.inner.delegate {
            match parse_file_entry_key(&key) {
                None => error!("error parsing expired key {key}"),
                Some(entry_key) => match File::open(self.path(&key)) {
                    Ok(mut input) => {
                        if let Err(e) = delegate.ingest(&entry_key.digest, &mut input) {
                            error!("error delegating expired entry {key}: {e}");
                        }
                    }
                    Err(e) => error!("error delegating expired entry {key}: {e}"),
                },
            }
        }

        let dirs = self.remove_entry_locked(state, &key, head);
        let entry_key = parse_file_entry_key(&key);
        let other_variant = entry_key
            .as_ref()
            .map(|k| blob_key(&k.digest, !k.executable));
        let blob_path = self.path(&key);
        let (sender, receiver) = mpsc::sync_channel(1);
        let cache = self.clone();
        self.inner.expire_pool.spawn(move || {
            for dir in dirs {
                if let Err(e) = remove_tree(&dir) {
                    error!("error removing expired directory {}: {e}", dir.display());
                }
            }
            match fs::remove_file(&blob_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {
                    error!(
                        "expired key {} did not exist to delete",
                        blob_path.display()
                    );
                }
                Err(e) => error!("error deleting expired key {}: {e}", blob_path.display()),
            }
            let report = match (entry_key, other_variant) {
                (Some(entry_key), Some(other)) => {
                    let state = cache.inner.state.lock().unwrap();
                    if state.storage.contains_key(&other) {
                        None
                    } else {
                        Some(entry_key.digest)
                    }
                }
                _ => None,
            };
            let _ = sender.send(report);
        });
        receiver
    }

    // ========================================================================
    // Directory materialization
    // ========================================================================

    /// Materialize the tree rooted at `digest`, hard-linking existing
    /// blobs and fetching the rest. Serialized per directory; on any
    /// failure every side effect is rolled back.
    pub fn put_directory(
        &self,
        digest: &Digest,
        directories: &HashMap<Digest, proto::Directory>,
    ) -> Result<PathBuf> {
        let path = self.directory_path(digest);
        debug!("locking directory {}", path.display());
        let lock = self.inner.locks.acquire(&path);
        let guard = lock.lock().unwrap();
        debug!("locked directory {}", path.display());
        let result = self.put_directory_locked(&path, digest, directories);
        drop(guard);
        self.inner.locks.release(&path);
        result
    }

    fn put_directory_locked(
        &self,
        path: &Path,
        digest: &Digest,
        directories: &HashMap<Digest, proto::Directory>,
    ) -> Result<PathBuf> {
        // reuse a registered materialization when it is fully intact
        {
            let mut state = self.inner.state.lock().unwrap();
            let state_ref = &mut *state;
            if state_ref.directories.contains_key(digest) {
                let entries = self.inner.directories_index.directory_entries(digest)?;
                let mut acquired: Vec<String> = Vec::new();
                let mut complete = true;
                for input in &entries {
                    let Some(&id) = state_ref.storage.get(input.as_str()) else {
                        error!(
                            "directory {digest} exists, but input {input} does not; purging and fetching"
                        );
                        complete = false;
                        break;
                    };
                    if state_ref.lru.increment_reference(id) {
                        state_ref.unreferenced_count -= 1;
                    }
                    acquired.push(input.clone());
                }
                if complete {
                    debug!("found existing entry for {}", path.display());
                    let entry = state_ref.directories.get_mut(digest).unwrap();
                    if Self::directory_entry_exists(path, entry, directories) {
                        return Ok(path.to_path_buf());
                    }
                    error!(
                        "directory {} is not intact on disk; purging and fetching",
                        path.display()
                    );
                }
                let freed = self.decrement_keys_locked(state_ref, &acquired);
                if freed > 0 {
                    state_ref.unreferenced_count += freed;
                    self.inner.space_freed.notify_all();
                }
                state_ref.directories.remove(digest);
                debug!("expiring existing entry for {}", path.display());
            }
        }
        self.inner.directories_index.remove(digest)?;

        // lay the skeleton and fetch every file node
        let mut jobs = Vec::new();
        if let Err(e) = self.fetch_directory_layout(path, digest, directories, &mut jobs) {
            let _ = remove_tree(path);
            return Err(e);
        }
        debug!("fetching {} files for {}", jobs.len(), path.display());
        let results: Vec<Result<Option<String>>> =
            jobs.par_iter().map(|job| self.run_put_job(job)).collect();

        let mut inputs = Vec::new();
        let mut causes = Vec::new();
        for result in results {
            match result {
                Ok(Some(key)) => inputs.push(key),
                Ok(None) => {}
                Err(e) => causes.push(e),
            }
        }
        if !causes.is_empty() {
            self.rollback_directory(path, digest, &inputs);
            return Err(CacheError::PutDirectory {
                path: path.to_path_buf(),
                digest: digest.clone(),
                causes,
            });
        }

        if let Err(e) = disable_all_write_access(path) {
            error!("error while disabling write permissions on {}", path.display());
            self.rollback_directory(path, digest, &inputs);
            return Err(e.into());
        }
        if let Err(e) = self.inner.directories_index.put(digest, &inputs) {
            error!("error while indexing {}", path.display());
            self.rollback_directory(path, digest, &inputs);
            return Err(e);
        }

        debug!("directory fetch complete, inserting {}", path.display());
        let directory = directories.get(digest).cloned().unwrap_or_default();
        let mut state = self.inner.state.lock().unwrap();
        state.directories.insert(
            digest.clone(),
            DirectoryEntry {
                directory,
                exists_deadline: Instant::now() + EXISTS_WINDOW,
            },
        );
        Ok(path.to_path_buf())
    }

    fn directory_entry_exists(
        path: &Path,
        entry: &mut DirectoryEntry,
        directories: &HashMap<Digest, proto::Directory>,
    ) -> bool {
        if entry.exists_deadline > Instant::now() {
            return true;
        }
        if Self::directory_exists(path, &entry.directory, directories) {
            entry.exists_deadline = Instant::now() + EXISTS_WINDOW;
            return true;
        }
        false
    }

    fn directory_exists(
        path: &Path,
        directory: &proto::Directory,
        directories: &HashMap<Digest, proto::Directory>,
    ) -> bool {
        if !path.exists() {
            error!("directory path {} does not exist", path.display());
            return false;
        }
        for file in &directory.files {
            let file_path = path.join(&file.name);
            if !file_path.exists() {
                error!("directory file entry {} does not exist", file_path.display());
                return false;
            }
        }
        for node in &directory.directories {
            let Some(node_digest) = node
                .digest
                .as_ref()
                .and_then(|d| Digest::from_proto(d).ok())
            else {
                return false;
            };
            let Some(child) = directories.get(&node_digest) else {
                return false;
            };
            if !Self::directory_exists(&path.join(&node.name), child, directories) {
                return false;
            }
        }
        true
    }

    fn fetch_directory_layout(
        &self,
        path: &Path,
        digest: &Digest,
        directories: &HashMap<Digest, proto::Directory>,
        jobs: &mut Vec<FileJob>,
    ) -> Result<()> {
        if path.exists() {
            if path.is_dir() {
                debug!("removing existing directory {} for fetch", path.display());
                remove_tree(path)?;
            } else {
                fs::remove_file(path)?;
            }
        }
        let empty = proto::Directory::default();
        let directory = if digest.size_bytes == 0 {
            &empty
        } else {
            directories.get(digest).ok_or_else(|| {
                io::Error::other(format!(
                    "directory not found for {}({digest})",
                    path.display()
                ))
            })?
        };
        fs::create_dir(path)?;
        for file in &directory.files {
            let node_digest = file
                .digest
                .as_ref()
                .ok_or_else(|| io::Error::other(format!("file node {} has no digest", file.name)))
                .and_then(|d| Digest::from_proto(d).map_err(io::Error::other))?;
            jobs.push(FileJob {
                target: path.join(&file.name),
                digest: node_digest,
                executable: file.is_executable,
            });
        }
        for node in &directory.directories {
            let node_digest = node
                .digest
                .as_ref()
                .ok_or_else(|| {
                    io::Error::other(format!("directory node {} has no digest", node.name))
                })
                .and_then(|d| Digest::from_proto(d).map_err(io::Error::other))?;
            self.fetch_directory_layout(&path.join(&node.name), &node_digest, directories, jobs)?;
        }
        Ok(())
    }

    fn run_put_job(&self, job: &FileJob) -> Result<Option<String>> {
        if job.digest.size_bytes == 0 {
            File::create(&job.target)?;
            set_read_only_perms(&job.target, job.executable)?;
            return Ok(None);
        }
        let key = blob_key(&job.digest, job.executable);
        let cache_path = self.put_file(&job.digest, job.executable)?;
        if let Err(e) = fs::hard_link(&cache_path, &job.target) {
            // give back the reference the fetch took
            self.decrement_reference_by_key(&key);
            return Err(e.into());
        }
        Ok(Some(key))
    }

    /// Undo a failed materialization: deindex, release acquired
    /// references, and remove the partial tree unconditionally.
    fn rollback_directory(&self, path: &Path, digest: &Digest, inputs: &[String]) {
        if let Err(e) = self.inner.directories_index.remove(digest) {
            error!("error removing {digest} from directories index: {e}");
        }
        if !inputs.is_empty() {
            let mut state = self.inner.state.lock().unwrap();
            let freed = self.decrement_keys_locked(&mut state, inputs);
            if freed > 0 {
                state.unreferenced_count += freed;
                self.inner.space_freed.notify_all();
            }
        }
        debug!("removing directory to roll back {}", path.display());
        if let Err(e) = remove_tree(path) {
            error!(
                "error during directory removal after fetch failure of {}: {e}",
                path.display()
            );
        }
    }

    // ========================================================================
    // Write completion plumbing
    // ========================================================================

    fn write_fence(&self, digest: &Digest) -> Arc<WriteFence> {
        let entry = self
            .inner
            .write_fences
            .entry(digest.clone())
            .or_insert_with(|| {
                let fence = Arc::new(WriteFence::new());
                if self.contains_local(digest).is_some() {
                    fence.complete(digest.size_bytes);
                }
                fence
            });
        entry.value().clone()
    }

    /// Publish a completed write. Returns true for the winning writer.
    pub(crate) fn complete_write(&self, digest: &Digest) -> bool {
        (self.inner.on_put)(digest);
        self.write_fence(digest).complete(digest.size_bytes)
    }

    pub(crate) fn invalidate_write(&self, digest: &Digest) {
        self.inner.write_fences.remove(digest);
    }

    /// Reclaim idle writes and their side files.
    fn prune_writes(&self) {
        {
            let mut last = self.inner.last_write_prune.lock().unwrap();
            if last.elapsed() < WRITE_PRUNE_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        let mut stale = Vec::new();
        for record in self.inner.writes.iter() {
            if record.value().last_access.elapsed() > WRITE_IDLE_TTL {
                stale.push(record.key().clone());
            }
        }
        for write_key in stale {
            if self.inner.writes.remove(&write_key).is_some() {
                let side_file = self.path(&format!(
                    "{}.{}",
                    blob_key(&write_key.digest, false),
                    write_key.id
                ));
                match fs::remove_file(&side_file) {
                    Ok(()) => debug!("reclaimed idle write {}", side_file.display()),
                    Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                    Err(e) => error!("could not reclaim {}: {e}", side_file.display()),
                }
            }
        }
    }
}

struct FileJob {
    target: PathBuf,
    digest: Digest,
    executable: bool,
}

impl ContentAddressableStorage for FileCache {
    fn contains(&self, digest: &Digest) -> bool {
        FileCache::contains(self, digest)
    }

    fn find_missing(&self, digests: &[Digest]) -> Result<Vec<Digest>> {
        self.find_missing_blobs(digests)
    }

    fn new_input(&self, digest: &Digest, offset: i64) -> Result<Box<dyn Read + Send>> {
        FileCache::new_input(self, digest, offset)
    }

    fn ingest(&self, digest: &Digest, source: &mut dyn Read) -> Result<()> {
        if digest.size_bytes == 0 {
            return Ok(());
        }
        let key = blob_key(digest, false);
        match self.put_impl(&key, Uuid::new_v4(), digest.size_bytes, false, true)? {
            Some(mut writer) => {
                if let Err(e) = io::copy(source, &mut writer) {
                    let _ = writer.cancel();
                    return Err(e.into());
                }
                writer.commit()
            }
            None => {
                self.decrement_reference_by_key(&key);
                Ok(())
            }
        }
    }
}
