//! Blob write path.
//!
//! Bytes land in a side file named `{key}.{write_id}` and are hashed as
//! they arrive. `commit` verifies the declared size and digest, clears
//! the write bits, and installs the blob by hard-linking the side file
//! to its key name, so partial content is never visible under a key. A
//! writer that loses the install race attaches a reference to the
//! winner's entry instead.
//!
//! `Write` is the resumable handle: reopening a key whose side file
//! survived a broken stream replays the committed bytes through the
//! hasher without rewriting them, then appends.

use std::fs::{self, File, OpenOptions};
use std::io::{self, ErrorKind, Write as IoWrite};
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tracing::{debug, error};
use uuid::Uuid;

use crate::digest::{Digest, HashingWriter};
use crate::error::{CacheError, Result};
use crate::key::{blob_key, key_to_digest};
use crate::fsutil::set_read_only_perms;
use crate::FileCache;

/// How long a loser of the install race waits for the winner's entry.
const RACE_WAIT: Duration = Duration::from_millis(10);
const RACE_ATTEMPTS: u32 = 10;

/// Registry key: one resumable write per (digest, write id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub(crate) struct WriteKey {
    pub digest: Digest,
    pub id: Uuid,
}

/// One-shot completion signal for a digest's write, shared by every
/// writer and read-through stream interested in it.
#[derive(Debug, Default)]
pub struct WriteFence {
    committed: Mutex<Option<i64>>,
}

impl WriteFence {
    pub fn new() -> Self {
        Self::default()
    }

    /// Mark the write complete. Returns true for the first caller only.
    pub fn complete(&self, size: i64) -> bool {
        let mut committed = self.committed.lock().unwrap();
        if committed.is_some() {
            return false;
        }
        *committed = Some(size);
        true
    }

    pub fn is_complete(&self) -> bool {
        self.committed.lock().unwrap().is_some()
    }
}

/// Resumable write handle for a single blob.
pub struct Write {
    cache: FileCache,
    digest: Digest,
    id: Uuid,
    fence: Arc<WriteFence>,
}

impl std::fmt::Debug for Write {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Write")
            .field("digest", &self.digest)
            .field("id", &self.id)
            .finish()
    }
}

impl Write {
    pub(crate) fn new(cache: FileCache, digest: Digest, id: Uuid, fence: Arc<WriteFence>) -> Self {
        Self {
            cache,
            digest,
            id,
            fence,
        }
    }

    /// A handle that is already complete; used for the empty blob,
    /// which never materializes a file.
    pub(crate) fn completed(cache: FileCache, digest: Digest, id: Uuid) -> Self {
        let fence = Arc::new(WriteFence::new());
        fence.complete(digest.size_bytes);
        Self::new(cache, digest, id, fence)
    }

    pub fn digest(&self) -> &Digest {
        &self.digest
    }

    fn side_file(&self) -> PathBuf {
        self.cache
            .path(&format!("{}.{}", blob_key(&self.digest, false), self.id))
    }

    /// Bytes already on disk for this write, resumable on reopen.
    pub fn committed_size(&self) -> i64 {
        if self.is_complete() {
            return self.digest.size_bytes;
        }
        fs::metadata(self.side_file())
            .map(|m| m.len() as i64)
            .unwrap_or(0)
    }

    pub fn is_complete(&self) -> bool {
        self.fence.is_complete() || self.cache.contains_local(&self.digest).is_some()
    }

    pub fn fence(&self) -> Arc<WriteFence> {
        self.fence.clone()
    }

    /// Open the byte stream, resuming from any committed prefix. When
    /// the blob is already present the returned stream discards its
    /// input and commits trivially.
    pub fn open(&self) -> Result<BlobWriter> {
        if self.digest.size_bytes == 0 {
            return Ok(BlobWriter::discard());
        }
        self.cache.open_write_stream(&self.digest, self.id)
    }

    /// Throw away any partial side file.
    pub fn reset(&self) {
        match fs::remove_file(self.side_file()) {
            Ok(()) => debug!("reset write {}:{}", self.digest, self.id),
            Err(e) if e.kind() == ErrorKind::NotFound => {}
            Err(e) => error!("could not reset write {}:{}: {e}", self.digest, self.id),
        }
    }
}

/// Suppresses the first `skip` bytes handed to it, forwarding the rest.
/// Used to replay a committed prefix through the hasher without
/// rewriting it.
pub(crate) struct SkipWriter<W> {
    inner: W,
    skip: i64,
}

impl<W: IoWrite> SkipWriter<W> {
    pub fn new(inner: W, skip: i64) -> Self {
        Self { inner, skip }
    }

    pub fn is_skipped(&self) -> bool {
        self.skip == 0
    }
}

impl<W: IoWrite> IoWrite for SkipWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let skipped = self.skip.min(buf.len() as i64) as usize;
        self.skip -= skipped as i64;
        if skipped < buf.len() {
            self.inner.write_all(&buf[skipped..])?;
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Write stream for one blob. `commit` verifies and installs; `cancel`
/// deletes the side file; dropping without either keeps the side file
/// for a later resume but releases the space reservation.
pub struct BlobWriter {
    inner: Option<ActiveWrite>,
}

impl BlobWriter {
    pub(crate) fn active(inner: ActiveWrite) -> Self {
        Self { inner: Some(inner) }
    }

    /// A sink for writers whose blob is already installed.
    pub(crate) fn discard() -> Self {
        Self { inner: None }
    }

    pub fn is_discard(&self) -> bool {
        self.inner.is_none()
    }

    pub fn written(&self) -> i64 {
        self.inner.as_ref().map(|w| w.written).unwrap_or(0)
    }

    /// Verify size and digest, then install the blob under its key.
    pub fn commit(self) -> Result<()> {
        match self.inner {
            Some(active) => active.commit(),
            None => Ok(()),
        }
    }

    /// Abandon the write and delete the side file.
    pub fn cancel(self) -> Result<()> {
        match self.inner {
            Some(active) => active.cancel(),
            None => Ok(()),
        }
    }
}

impl IoWrite for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.inner.as_mut() {
            Some(active) => active.write(buf),
            None => Ok(buf.len()),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.inner.as_mut() {
            Some(active) => active.flush(),
            None => Ok(()),
        }
    }
}

/// The live state of a reserved, in-flight blob write.
pub(crate) struct ActiveWrite {
    cache: FileCache,
    key: String,
    size: i64,
    executable: bool,
    release_on_commit: bool,
    write_path: PathBuf,
    out: Option<HashingWriter<SkipWriter<File>>>,
    written: i64,
    finished: bool,
}

impl ActiveWrite {
    /// Open the side file, replaying any committed prefix through the
    /// hasher. The caller has already reserved `size` bytes.
    pub(crate) fn create(
        cache: FileCache,
        key: String,
        size: i64,
        executable: bool,
        write_id: Uuid,
        release_on_commit: bool,
    ) -> Result<Self> {
        let write_path = cache.path(&format!("{key}.{write_id}"));
        let (out, committed) = if write_path.exists() {
            let committed = fs::metadata(&write_path)?.len() as i64;
            let append = OpenOptions::new().append(true).open(&write_path)?;
            let mut out = HashingWriter::new(SkipWriter::new(append, committed));
            let mut replay = File::open(&write_path)?;
            let replayed = io::copy(&mut replay, &mut out)? as i64;
            if replayed != committed || !out.get_ref().is_skipped() {
                return Err(io::Error::other(format!(
                    "partial write {} changed during replay",
                    write_path.display()
                ))
                .into());
            }
            debug!("resuming write {key} from {committed} bytes");
            (out, committed)
        } else {
            let file = OpenOptions::new()
                .write(true)
                .create(true)
                .open(&write_path)?;
            (HashingWriter::new(SkipWriter::new(file, 0)), 0)
        };
        Ok(Self {
            cache,
            key,
            size,
            executable,
            release_on_commit,
            write_path,
            out: Some(out),
            written: committed,
            finished: false,
        })
    }

    /// Tear down, releasing the reservation. Deletes the side file
    /// unless it should survive for a resume.
    fn abort(&mut self, delete_side_file: bool) {
        self.finished = true;
        self.out.take();
        if delete_side_file {
            if let Err(e) = fs::remove_file(&self.write_path) {
                if e.kind() != ErrorKind::NotFound {
                    error!("could not remove {}: {e}", self.write_path.display());
                }
            }
        }
        self.cache.discharge_and_notify(self.size);
    }

    fn commit(mut self) -> Result<()> {
        let mut out = self.out.take().expect("write already terminated");
        out.flush()?;
        let (hash, _file) = out.finish();

        let expected = key_to_digest(&self.key)?;
        if self.written > self.size {
            let actual = Digest {
                hash,
                size_bytes: self.written,
            };
            self.abort(true);
            return Err(CacheError::DigestMismatch { expected, actual });
        }
        if self.written < self.size {
            let committed = self.written;
            self.abort(true);
            return Err(CacheError::IncompleteBlob {
                key: self.key.clone(),
                committed,
                expected: self.size,
            });
        }
        if hash != expected.hash {
            let actual = Digest {
                hash,
                size_bytes: self.written,
            };
            self.abort(true);
            return Err(CacheError::DigestMismatch { expected, actual });
        }

        if let Err(e) = set_read_only_perms(&self.write_path, self.executable) {
            self.abort(false);
            return Err(e.into());
        }

        // install under the key; first hard link wins
        let target = self.cache.path(&self.key);
        let inserted = match fs::hard_link(&self.write_path, &target) {
            Ok(()) => self.cache.try_insert_entry(&self.key, self.size),
            Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                debug!("file already exists for {}", self.key);
                false
            }
            Err(e) => {
                self.abort(true);
                return Err(e.into());
            }
        };

        if let Err(e) = fs::remove_file(&self.write_path) {
            error!("could not remove {}: {e}", self.write_path.display());
        }
        self.finished = true;
        if !inserted {
            self.cache.discharge_and_notify(self.size);
        }

        if inserted {
            debug!("won the race to insert {}", self.key);
            if self.cache.complete_write(&expected) {
                self.cache.invalidate_write(&expected);
            }
        } else {
            debug!("lost the race to insert {}", self.key);
            let mut attempts = RACE_ATTEMPTS;
            loop {
                if self.cache.reference_if_exists(&self.key)? {
                    break;
                }
                if attempts == 0 {
                    return Err(io::Error::other(format!(
                        "existing entry did not appear for {}",
                        self.key
                    ))
                    .into());
                }
                attempts -= 1;
                std::thread::sleep(RACE_WAIT);
            }
        }

        if self.release_on_commit {
            self.cache.decrement_reference_by_key(&self.key);
        }
        Ok(())
    }

    fn cancel(mut self) -> Result<()> {
        self.abort(true);
        Ok(())
    }
}

impl IoWrite for ActiveWrite {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let out = self
            .out
            .as_mut()
            .ok_or_else(|| io::Error::other("write already terminated"))?;
        let n = out.write(buf)?;
        self.written += n as i64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.out.as_mut() {
            Some(out) => out.flush(),
            None => Ok(()),
        }
    }
}

impl Drop for ActiveWrite {
    fn drop(&mut self) {
        if !self.finished {
            // keep the side file for a later resume
            self.abort(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_skip_writer_suppresses_prefix() {
        let mut out = SkipWriter::new(Vec::new(), 4);
        assert_eq!(out.write(b"ab").unwrap(), 2);
        assert!(!out.is_skipped());
        assert_eq!(out.write(b"cdef").unwrap(), 4);
        assert!(out.is_skipped());
        out.write_all(b"gh").unwrap();
        assert_eq!(out.inner, b"efgh");
    }

    #[test]
    fn test_write_fence_single_completion() {
        let fence = WriteFence::new();
        assert!(!fence.is_complete());
        assert!(fence.complete(5));
        assert!(!fence.complete(5));
        assert!(fence.is_complete());
    }
}
