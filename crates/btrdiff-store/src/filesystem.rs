//! Blobs as read-only files under random ids.
//!
//! ## Directory Layout
//!
//! ```text
//! <base_dir>/
//! └── 3f2/
//!     └── a91/
//!         └── 0c4/
//!             └── 7e1d...   # remaining 23 hex digits of the id
//! ```
//!
//! Four levels with at most 4096 entries per directory.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use btrdiff_config::log_store_debug;
use tracing::instrument;
use uuid::Uuid;

use crate::writer::{BlobReader, BlobWriter, PendingBlob};
use crate::{Result, Storage, StoreError};

const ID_LEN: usize = 32;

#[derive(Debug, Clone)]
pub struct FilesystemStorage {
    base_dir: PathBuf,
}

impl FilesystemStorage {
    pub const NAME: &'static str = "filesystem";

    pub fn new<P: AsRef<Path>>(base_dir: P) -> Result<Self> {
        let base_dir = base_dir.as_ref().to_path_buf();
        fs::create_dir_all(&base_dir)?;
        Ok(Self { base_dir })
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    fn path_for_id(&self, id: &str) -> Result<PathBuf> {
        let valid = id.len() == ID_LEN
            && id
                .bytes()
                .all(|b| b.is_ascii_digit() || (b'a'..=b'f').contains(&b));
        if !valid {
            return Err(StoreError::InvalidId {
                engine: Self::NAME,
                id: id.to_string(),
            });
        }
        Ok(self
            .base_dir
            .join(&id[..3])
            .join(&id[3..6])
            .join(&id[6..9])
            .join(&id[9..]))
    }
}

struct PendingFile {
    id: String,
    path: PathBuf,
    file: Option<File>,
}

impl Write for PendingFile {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match &mut self.file {
            Some(file) => file.write(buf),
            None => Err(io::Error::other("blob is sealed")),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match &mut self.file {
            Some(file) => file.flush(),
            None => Ok(()),
        }
    }
}

impl PendingBlob for PendingFile {
    fn finalize(&mut self) -> Result<String> {
        if let Some(file) = self.file.take() {
            file.sync_all()?;
        }
        Ok(self.id.clone())
    }

    fn remove(&mut self) -> Result<()> {
        self.file = None;
        match fs::remove_file(&self.path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

fn create_read_only(path: &Path) -> io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).create_new(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o444);
    }
    options.open(path)
}

impl Storage for FilesystemStorage {
    fn name(&self) -> &'static str {
        Self::NAME
    }

    #[instrument(skip(self), level = "debug")]
    fn open_writer(&self) -> Result<BlobWriter> {
        let id = Uuid::new_v4().simple().to_string();
        let path = self.path_for_id(&id)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = create_read_only(&path)?;
        log_store_debug!("blob opened", id = id.as_str());
        Ok(BlobWriter::new(Box::new(PendingFile {
            id,
            path,
            file: Some(file),
        })))
    }

    #[instrument(skip(self), level = "debug")]
    fn open_reader(&self, id: &str) -> Result<BlobReader> {
        let path = self.path_for_id(id)?;
        match File::open(&path) {
            Ok(file) => Ok(BlobReader::new(Box::new(file))),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                id: id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn remove(&self, id: &str) -> Result<()> {
        let path = self.path_for_id(id)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Err(StoreError::NotFound {
                id: id.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }
}
