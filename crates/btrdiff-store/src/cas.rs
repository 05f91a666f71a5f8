//! Content-addressed blobs keyed by BLAKE3.
//!
//! ## Directory Layout
//!
//! ```text
//! <root>/
//! ├── tmp/
//! │   └── <uuid>.tmp            # blobs still being written
//! └── blake3/
//!     └── ab/
//!         └── cd/
//!             └── abcd1234...   # full 64-digit hash
//! ```
//!
//! Identical content commits to the same id. Removing an id removes the
//! content for every writer that produced it, but a failed scope only
//! removes a blob its own writer created.

use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

use btrdiff_config::log_store_debug;
use tracing::instrument;
use uuid::Uuid;

use crate::writer::{BlobReader, BlobWriter, PendingBlob};
use crate::{Result, Storage, StoreError};

/// BLAKE3 hash type (32 bytes)
pub type Blake3Hash = [u8; 32];

#[derive(Debug, Clone)]
pub struct CasStorage {
    root: PathBuf,
}

impl CasStorage {
    pub const NAME: &'static str = "cas";

    /// Open a store at `root`, creating it if needed.
    pub fn new<P: AsRef<Path>>(root: P) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(root.join("tmp"))?;
        fs::create_dir_all(root.join("blake3"))?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    #[inline]
    pub fn compute_hash(data: &[u8]) -> Blake3Hash {
        *blake3::hash(data).as_bytes()
    }

    pub fn exists(&self, id: &str) -> bool {
        self.parse_id(id)
            .map(|hash| self.blob_path(&hash).exists())
            .unwrap_or(false)
    }

    fn parse_id(&self, id: &str) -> Result<Blake3Hash> {
        let mut hash = [0u8; 32];
        let lowercase = !id.bytes().any(|b| b.is_ascii_uppercase());
        match hex::decode_to_slice(id, &mut hash) {
            Ok(()) if lowercase => Ok(hash),
            _ => Err(StoreError::InvalidId {
                engine: Self::NAME,
                id: id.to_string(),
            }),
        }
    }

    fn blob_path(&self, hash: &Blake3Hash) -> PathBuf {
        let hex = hex::encode(hash);
        self.root
            .join("blake3")
            .join(&hex[..2])
            .join(&hex[2..4])
            .join(&hex)
    }
}

struct PendingCas {
    store: CasStorage,
    temp_path: PathBuf,
    file: Option<File>,
    hasher: blake3::Hasher,
    /// Hash of the committed content, and whether this writer created the
    /// blob file rather than finding it already stored.
    committed: Option<(Blake3Hash, bool)>,
}

impl Write for PendingCas {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let file = self
            .file
            .as_mut()
            .ok_or_else(|| io::Error::other("blob is sealed"))?;
        let n = file.write(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl PendingBlob for PendingCas {
    fn finalize(&mut self) -> Result<String> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        let hash = *self.hasher.finalize().as_bytes();
        let path = self.store.blob_path(&hash);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        set_readonly(&self.temp_path)?;
        // A hard link never replaces an existing blob, so exactly one writer
        // owns each stored file.
        let created = match fs::hard_link(&self.temp_path, &path) {
            Ok(()) => true,
            Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                log_store_debug!("deduplicated blob", id = hex::encode(hash).as_str());
                false
            }
            Err(e) => return Err(e.into()),
        };
        fs::remove_file(&self.temp_path)?;

        self.committed = Some((hash, created));
        Ok(hex::encode(hash))
    }

    fn remove(&mut self) -> Result<()> {
        self.file = None;
        let path = match self.committed {
            Some((hash, true)) => self.store.blob_path(&hash),
            Some((_, false)) => return Ok(()),
            None => self.temp_path.clone(),
        };
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

#[cfg(unix)]
fn set_readonly(path: &Path) -> io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_mode(0o444);
    fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_readonly(path: &Path) -> io::Result<()> {
    let mut perms = fs::metadata(path)?.permissions();
    perms.set_readonly(true);
    fs::set_permissions(path, perms)
}

impl Storage for CasStorage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[instrument(skip(self), level = "debug")]
    fn open_writer(&self) -> Result<BlobWriter> {
        let temp_path = self
            .root
            .join("tmp")
            .join(format!("{}.tmp", Uuid::new_v4().simple()));
        let file = File::create(&temp_path)?;
        Ok(BlobWriter::new(Box::new(PendingCas {
            store: self.clone(),
            temp_path,
            file: Some(file),
            hasher: blake3::Hasher::new(),
            committed: None,
        })))
    }

    /// Reads the whole blob and verifies its hash before handing it out.
    #[instrument(skip(self), level = "debug")]
    fn open_reader(&self, id: &str) -> Result<BlobReader> {
        let hash = self.parse_id(id)?;
        let path = self.blob_path(&hash);
        let mut file = match File::open(&path) {
            Ok(file) => file,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(e) => return Err(e.into()),
        };
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let actual = Self::compute_hash(&data);
        if actual != hash {
            return Err(StoreError::HashMismatch {
                expected: id.to_string(),
                actual: hex::encode(actual),
            });
        }
        Ok(BlobReader::new(Box::new(io::Cursor::new(data))))
    }

    fn remove(&self, id: &str) -> Result<()> {
        let path = self.blob_path(&self.parse_id(id)?);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                Err(StoreError::NotFound { id: id.to_string() })
            }
            Err(e) => Err(e.into()),
        }
    }
}
