//! Engine-independent commit and cleanup rules.

use std::fmt;
use std::io::{self, Read, Write};

use btrdiff_config::{log_store_debug, log_store_warn};

use crate::{Result, StoreError};

/// An engine's in-progress blob.
pub trait PendingBlob: Write + Send {
    /// Flush, make the blob durable, and return its id.
    fn finalize(&mut self) -> Result<String>;

    /// Delete whatever this blob has put on disk, committed or not.
    fn remove(&mut self) -> Result<()>;
}

enum WriterState {
    Open,
    Committed { id: String, remove_on_error: bool },
    Removed,
}

/// Scoped writer for one blob. See the crate docs for the lifecycle.
pub struct BlobWriter {
    pending: Box<dyn PendingBlob>,
    state: WriterState,
}

impl fmt::Debug for BlobWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobWriter")
            .field("id", &self.id())
            .finish_non_exhaustive()
    }
}

impl BlobWriter {
    pub fn new(pending: Box<dyn PendingBlob>) -> Self {
        Self {
            pending,
            state: WriterState::Open,
        }
    }

    /// Append bytes. Fails once the blob is committed.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        match self.state {
            WriterState::Open => Ok(self.pending.write_all(data)?),
            _ => Err(StoreError::AlreadyCommitted),
        }
    }

    /// Seal the blob and return its id. With `remove_on_error`, a later
    /// failure of the enclosing scope still removes it.
    pub fn commit(&mut self, remove_on_error: bool) -> Result<String> {
        if !matches!(self.state, WriterState::Open) {
            return Err(StoreError::AlreadyCommitted);
        }
        match self.pending.finalize() {
            Ok(id) => {
                log_store_debug!(
                    "blob committed",
                    id = id.as_str(),
                    remove_on_error = remove_on_error
                );
                self.state = WriterState::Committed {
                    id: id.clone(),
                    remove_on_error,
                };
                Ok(id)
            }
            Err(e) => {
                self.discard();
                Err(e)
            }
        }
    }

    /// Id of the committed blob.
    pub fn id(&self) -> Option<&str> {
        match &self.state {
            WriterState::Committed { id, .. } => Some(id),
            _ => None,
        }
    }

    fn discard(&mut self) {
        if let Err(e) = self.pending.remove() {
            log_store_warn!("failed to remove blob", error = tracing::field::display(&e));
        }
        self.state = WriterState::Removed;
    }

    /// The enclosing scope failed.
    fn fail(&mut self) {
        match self.state {
            WriterState::Open
            | WriterState::Committed {
                remove_on_error: true,
                ..
            } => self.discard(),
            _ => {}
        }
    }
}

impl Write for BlobWriter {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self.state {
            WriterState::Open => self.pending.write(buf),
            _ => Err(io::Error::other(StoreError::AlreadyCommitted)),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self.state {
            WriterState::Open => self.pending.flush(),
            _ => Ok(()),
        }
    }
}

impl Drop for BlobWriter {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.fail();
            return;
        }
        if matches!(self.state, WriterState::Open) {
            log_store_debug!("discarding uncommitted blob");
            self.discard();
        }
    }
}

pub(crate) fn scoped<T, E, F>(mut writer: BlobWriter, f: F) -> std::result::Result<T, E>
where
    F: FnOnce(&mut BlobWriter) -> std::result::Result<T, E>,
{
    let result = f(&mut writer);
    if result.is_err() {
        writer.fail();
    }
    result
}

/// Reader for a stored blob.
pub struct BlobReader {
    inner: Box<dyn Read + Send>,
}

impl fmt::Debug for BlobReader {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BlobReader").finish_non_exhaustive()
    }
}

impl BlobReader {
    pub fn new(inner: Box<dyn Read + Send>) -> Self {
        Self { inner }
    }

    /// Up to `size` bytes, or everything left when `size` is `None`.
    /// An empty result means end of blob.
    pub fn read(&mut self, size: Option<usize>) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        match size {
            None => {
                self.inner.read_to_end(&mut out)?;
            }
            Some(n) => {
                (&mut self.inner).take(n as u64).read_to_end(&mut out)?;
            }
        }
        Ok(out)
    }
}

impl Read for BlobReader {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        self.inner.read(buf)
    }
}
