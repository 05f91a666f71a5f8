//! # btrdiff-store
//!
//! Blob storage for artifacts produced from send-streams.
//!
//! Every engine hands out a [`BlobWriter`]; bytes written to it become a
//! blob only when [`BlobWriter::commit`] returns its id. Anything else
//! removes the partial blob:
//!
//! ```text
//! open_writer ──write──▶ commit(remove_on_error) ──▶ id
//!      │                        │
//!      └─ dropped uncommitted   └─ remove_on_error and the enclosing
//!         = removed                with_writer fails or panics = removed
//! ```
//!
//! ## Engines
//!
//! - `filesystem`: random ids, `aaa/bbb/ccc/rest` fan-out, read-only files
//! - `cas`: BLAKE3 ids, `blake3/ab/cd/<hash>` layout, verified on read

mod cas;
mod filesystem;
mod registry;
mod writer;

pub use cas::CasStorage;
pub use filesystem::FilesystemStorage;
pub use registry::{EngineCtor, StorageRegistry, StorageSpec};
pub use writer::{BlobReader, BlobWriter, PendingBlob};

use std::io;

use thiserror::Error;

/// Errors that can occur during storage operations
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Blob not found: {id}")]
    NotFound { id: String },

    #[error("Invalid blob id for {engine} storage: {id:?}")]
    InvalidId { engine: &'static str, id: String },

    #[error("Hash mismatch: expected {expected}, got {actual}")]
    HashMismatch { expected: String, actual: String },

    #[error("Blob was already committed")]
    AlreadyCommitted,

    #[error("Unknown storage engine: {name}")]
    UnknownEngine { name: String },

    #[error("Invalid storage config: {0}")]
    Config(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StoreError>;

/// A named blob store.
pub trait Storage: Send + Sync + std::fmt::Debug {
    /// Registry name of the engine.
    fn name(&self) -> &'static str;

    /// Start a new blob.
    fn open_writer(&self) -> Result<BlobWriter>;

    fn open_reader(&self, id: &str) -> Result<BlobReader>;

    fn remove(&self, id: &str) -> Result<()>;
}

/// Run `f` with a fresh writer from `storage`. If `f` fails or panics after
/// committing with `remove_on_error`, the blob is removed again.
pub fn with_writer<T, E, F>(storage: &dyn Storage, f: F) -> std::result::Result<T, E>
where
    E: From<StoreError>,
    F: FnOnce(&mut BlobWriter) -> std::result::Result<T, E>,
{
    writer::scoped(storage.open_writer()?, f)
}

/// Convenience: store `data` as one committed blob.
pub fn put(storage: &dyn Storage, data: &[u8]) -> Result<String> {
    with_writer(storage, |w| {
        w.write(data)?;
        w.commit(true)
    })
}

/// Convenience: read a whole blob.
pub fn get(storage: &dyn Storage, id: &str) -> Result<Vec<u8>> {
    storage.open_reader(id)?.read(None)
}
