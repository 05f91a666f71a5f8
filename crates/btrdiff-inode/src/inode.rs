//! The [`IncompleteInode`] and the per-variant command rules.

use std::collections::BTreeMap;
use std::sync::Arc;

use btrdiff_stream::{Command, DeviceNumber, Timespec};
use tracing::trace;

use crate::extents::{CloneOrigin, EncodedExtent, FileExtents};
use crate::{
    InodeError, Result, MODE_PERMISSION_BITS, S_IFBLK, S_IFCHR, S_IFDIR, S_IFIFO, S_IFLNK, S_IFMT,
    S_IFREG, S_IFSOCK,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeOwner {
    pub uid: u64,
    pub gid: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InodeUtimes {
    pub ctime: Timespec,
    pub mtime: Timespec,
    pub atime: Timespec,
}

/// Variant payload; the variant fixes the file type for the inode's life.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InodeKind {
    File(FileExtents),
    Dir,
    Fifo,
    Socket,
    Symlink { dest: Vec<u8> },
    Device { file_type: u32, dev: DeviceNumber },
}

impl InodeKind {
    /// `S_IFMT` bits of this variant.
    pub fn file_type(&self) -> u32 {
        match self {
            Self::File(_) => S_IFREG,
            Self::Dir => S_IFDIR,
            Self::Fifo => S_IFIFO,
            Self::Socket => S_IFSOCK,
            Self::Symlink { .. } => S_IFLNK,
            Self::Device { file_type, .. } => *file_type,
        }
    }

    /// Name used in digests and error messages.
    pub fn name(&self) -> &'static str {
        match self {
            Self::File(_) => "File",
            Self::Dir => "Dir",
            Self::Fifo => "FIFO",
            Self::Socket => "Sock",
            Self::Symlink { .. } => "Symlink",
            Self::Device { file_type, .. } if *file_type == S_IFBLK => "Block",
            Self::Device { .. } => "Char",
        }
    }
}

/// One filesystem object under reconstruction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncompleteInode {
    xattrs: BTreeMap<Vec<u8>, Vec<u8>>,
    owner: Option<InodeOwner>,
    mode: Option<u32>,
    utimes: Option<InodeUtimes>,
    fileattr: Option<u64>,
    kind: InodeKind,
}

impl IncompleteInode {
    pub fn new(kind: InodeKind) -> Self {
        Self {
            xattrs: BTreeMap::new(),
            owner: None,
            mode: None,
            utimes: None,
            fileattr: None,
            kind,
        }
    }

    /// Build the inode a creation command describes.
    pub fn from_command(command: &Command) -> Result<Self> {
        let kind = match command {
            Command::Mkfile { .. } => InodeKind::File(FileExtents::new()),
            Command::Mkdir { .. } => InodeKind::Dir,
            Command::Mkfifo { .. } => InodeKind::Fifo,
            Command::Mksock { .. } => InodeKind::Socket,
            Command::Symlink { dest, .. } => InodeKind::Symlink { dest: dest.clone() },
            Command::Mknod { mode, dev, .. } => {
                let file_type = mode & S_IFMT;
                if file_type != S_IFBLK && file_type != S_IFCHR {
                    return Err(InodeError::UnexpectedDeviceMode(*mode));
                }
                let mut inode = Self::new(InodeKind::Device {
                    file_type,
                    dev: *dev,
                });
                inode.mode = Some(mode & MODE_PERMISSION_BITS);
                return Ok(inode);
            }
            other => return Err(InodeError::NotACreation(other.kind())),
        };
        Ok(Self::new(kind))
    }

    pub fn kind(&self) -> &InodeKind {
        &self.kind
    }

    pub fn file_type(&self) -> u32 {
        self.kind.file_type()
    }

    pub fn xattrs(&self) -> &BTreeMap<Vec<u8>, Vec<u8>> {
        &self.xattrs
    }

    pub fn owner(&self) -> Option<InodeOwner> {
        self.owner
    }

    /// Permission bits only; the file type lives in [`Self::kind`].
    pub fn mode(&self) -> Option<u32> {
        self.mode
    }

    pub fn utimes(&self) -> Option<InodeUtimes> {
        self.utimes
    }

    pub fn fileattr(&self) -> Option<u64> {
        self.fileattr
    }

    pub fn is_dir(&self) -> bool {
        matches!(self.kind, InodeKind::Dir)
    }

    pub fn extents(&self) -> Option<&FileExtents> {
        match &self.kind {
            InodeKind::File(extents) => Some(extents),
            _ => None,
        }
    }

    /// File content, when the inode is a file and every byte is known.
    pub fn content(&self) -> Option<Vec<u8>> {
        self.extents().and_then(FileExtents::content)
    }

    fn inapplicable(&self, command: &Command) -> InodeError {
        InodeError::Inapplicable {
            command: command.kind(),
            variant: self.kind.name(),
        }
    }

    fn file_extents_mut(&mut self, command: &Command) -> Result<&mut FileExtents> {
        match &mut self.kind {
            InodeKind::File(extents) => Ok(extents),
            other => Err(InodeError::Inapplicable {
                command: command.kind(),
                variant: other.name(),
            }),
        }
    }

    /// Apply one command naming this inode. On error the inode is unchanged.
    pub fn apply(&mut self, command: &Command) -> Result<()> {
        trace!(command = %command.kind(), variant = self.kind.name(), "apply");
        match command {
            Command::Chmod { mode, .. } => {
                if matches!(self.kind, InodeKind::Symlink { .. }) {
                    return Err(InodeError::ChmodSymlink);
                }
                let file_type = mode & S_IFMT;
                if file_type != 0 && file_type != self.file_type() {
                    return Err(InodeError::IllegalChmod {
                        mode: *mode,
                        file_type: self.file_type(),
                        variant: self.kind.name(),
                    });
                }
                self.mode = Some(mode & MODE_PERMISSION_BITS);
            }
            Command::Chown { uid, gid, .. } => {
                self.owner = Some(InodeOwner {
                    uid: *uid,
                    gid: *gid,
                });
            }
            Command::Utimes {
                atime,
                mtime,
                ctime,
                ..
            } => {
                self.utimes = Some(InodeUtimes {
                    ctime: *ctime,
                    mtime: *mtime,
                    atime: *atime,
                });
            }
            Command::SetXattr { name, data, .. } => {
                self.xattrs.insert(name.clone(), data.clone());
            }
            Command::RemoveXattr { name, .. } => {
                if self.xattrs.remove(name).is_none() {
                    return Err(InodeError::NoSuchXattr { name: name.clone() });
                }
            }
            Command::Fileattr { attr, .. } => {
                self.fileattr = Some(*attr);
            }
            Command::Truncate { size, .. } => {
                self.file_extents_mut(command)?.truncate(*size);
            }
            Command::Write { offset, data, .. } => {
                self.file_extents_mut(command)?
                    .write(*offset, Arc::clone(data))?;
            }
            Command::UpdateExtent { offset, len, .. } => {
                self.file_extents_mut(command)?.update_extent(*offset, *len)?;
            }
            Command::Fallocate {
                mode, offset, len, ..
            } => {
                self.file_extents_mut(command)?
                    .fallocate(*mode, *offset, *len)?;
            }
            Command::EncodedWrite {
                offset,
                unencoded_file_len,
                unencoded_len,
                unencoded_offset,
                compression,
                encryption,
                data,
                ..
            } => {
                let extent = EncodedExtent {
                    data: Arc::clone(data),
                    unencoded_len: *unencoded_len,
                    unencoded_offset: *unencoded_offset,
                    compression: *compression,
                    encryption: *encryption,
                };
                self.file_extents_mut(command)?
                    .encoded_write(*offset, *unencoded_file_len, extent)?;
            }
            Command::Clone { .. } => {
                return Err(InodeError::CloneNeedsSource {
                    variant: self.kind.name(),
                });
            }
            Command::Subvol { .. }
            | Command::Snapshot { .. }
            | Command::Mkfile { .. }
            | Command::Mkdir { .. }
            | Command::Mknod { .. }
            | Command::Mkfifo { .. }
            | Command::Mksock { .. }
            | Command::Symlink { .. }
            | Command::Rename { .. }
            | Command::Link { .. }
            | Command::Unlink { .. }
            | Command::Rmdir { .. }
            | Command::End => return Err(self.inapplicable(command)),
        }
        Ok(())
    }

    /// Make `[offset, offset + len)` a copy of `source`'s range starting at
    /// `origin.offset`. Only files can be clone targets.
    pub fn apply_clone(
        &mut self,
        offset: u64,
        len: u64,
        source: &FileExtents,
        origin: CloneOrigin,
    ) -> Result<()> {
        let variant = self.kind.name();
        let InodeKind::File(extents) = &mut self.kind else {
            return Err(InodeError::Inapplicable {
                command: btrdiff_stream::CommandKind::Clone,
                variant,
            });
        };
        let pieces = source.slice(origin.offset, len);
        extents.clone_range(offset, len, pieces, &origin)
    }
}
