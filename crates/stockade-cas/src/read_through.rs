//! Read-through streaming from the delegate.
//!
//! On a local miss with a delegate configured, the caller's stream is
//! fed from the delegate while the same bytes are copied into a local
//! write, so one remote read populates the cache. The stream is a
//! one-shot state machine: it starts on the delegate and switches to
//! the local file once the write completes, whether this stream's own
//! writer finished it or a concurrent writer won the install race.

use std::io::{self, ErrorKind, Read, Write as IoWrite};
use std::sync::Arc;

use crate::digest::Digest;
use crate::write::{BlobWriter, Write, WriteFence};
use crate::FileCache;

const SKIP_CHUNK: usize = 8192;

enum Source {
    /// Serving from the delegate while teeing into the local write.
    Delegate {
        input: Box<dyn Read + Send>,
        out: Option<BlobWriter>,
        /// source bytes to consume before the caller's first byte
        skip: i64,
        /// source bytes not yet consumed
        remaining: i64,
        /// the caller's position in the blob
        local_offset: i64,
    },
    /// Serving from the installed local file.
    Local { input: Box<dyn Read + Send> },
    /// All bytes delivered and the local write committed.
    Finished,
}

pub struct ReadThroughInput {
    cache: FileCache,
    digest: Digest,
    fence: Arc<WriteFence>,
    source: Source,
}

impl ReadThroughInput {
    pub(crate) fn new(
        cache: FileCache,
        digest: Digest,
        offset: i64,
        write: &Write,
    ) -> crate::error::Result<Self> {
        let input = cache.delegate_input(&digest, 0)?;
        let out = write.open()?;
        Ok(Self {
            cache,
            fence: write.fence(),
            source: Source::Delegate {
                input,
                out: Some(out),
                skip: offset,
                remaining: digest.size_bytes,
                local_offset: offset,
            },
            digest,
        })
    }

    /// A concurrent writer completed the blob: abandon our copy and
    /// continue from the local file at the caller's position.
    fn switch_to_local(&mut self) -> io::Result<()> {
        let source = std::mem::replace(&mut self.source, Source::Finished);
        if let Source::Delegate {
            input,
            out,
            local_offset,
            ..
        } = source
        {
            drop(input);
            if let Some(writer) = out {
                let _ = writer.cancel();
            }
            let input = self
                .cache
                .transparent_input(&self.digest, local_offset)
                .map_err(io::Error::other)?;
            self.source = Source::Local { input };
        } else {
            self.source = source;
        }
        Ok(())
    }
}

impl Read for ReadThroughInput {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if let Source::Delegate { .. } = self.source {
            if self.fence.is_complete() {
                self.switch_to_local()?;
            }
        }

        let mut committed = false;
        let result = match &mut self.source {
            Source::Finished => Ok(0),
            Source::Local { input } => input.read(buf),
            Source::Delegate {
                input,
                out,
                skip,
                remaining,
                local_offset,
            } => {
                // consume up to the caller's offset, still teeing the
                // bytes into the local write
                let mut chunk = [0u8; SKIP_CHUNK];
                while *skip > 0 {
                    let want = (*skip).min(chunk.len() as i64) as usize;
                    let n = input.read(&mut chunk[..want])?;
                    if n == 0 {
                        return Err(premature_eof());
                    }
                    if let Some(writer) = out.as_mut() {
                        writer.write_all(&chunk[..n])?;
                    }
                    *skip -= n as i64;
                    *remaining -= n as i64;
                }

                let n = input.read(buf)?;
                if n > 0 {
                    if let Some(writer) = out.as_mut() {
                        writer.write_all(&buf[..n])?;
                    }
                    *remaining -= n as i64;
                    *local_offset += n as i64;
                    Ok(n)
                } else if *remaining != 0 {
                    Err(premature_eof())
                } else {
                    Ok(0)
                }
            }
        };

        if let Source::Delegate { out, remaining, .. } = &mut self.source {
            if *remaining == 0 {
                if let Some(writer) = out.take() {
                    writer.commit().map_err(io::Error::other)?;
                }
                committed = true;
            }
        }
        if committed {
            self.source = Source::Finished;
        }
        result
    }
}

impl Drop for ReadThroughInput {
    fn drop(&mut self) {
        if let Source::Delegate { out, .. } = &mut self.source {
            if let Some(writer) = out.take() {
                // abandoned mid-stream; throw the partial copy away
                let _ = writer.cancel();
            }
        }
    }
}

fn premature_eof() -> io::Error {
    io::Error::new(ErrorKind::UnexpectedEof, "premature EOF from delegate")
}
