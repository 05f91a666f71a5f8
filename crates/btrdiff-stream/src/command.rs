//! Typed, immutable send-stream commands.

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

/// A `(seconds, nanoseconds)` timestamp as carried by `utimes`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Timespec {
    pub sec: i64,
    pub nsec: u32,
}

impl Timespec {
    pub const fn new(sec: i64, nsec: u32) -> Self {
        Self { sec, nsec }
    }
}

impl fmt::Display for Timespec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:09}", self.sec, self.nsec)
    }
}

/// Device number in the kernel's `new_encode_dev` packing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct DeviceNumber(pub u64);

impl DeviceNumber {
    pub fn from_parts(major: u32, minor: u32) -> Self {
        let (major, minor) = (u64::from(major), u64::from(minor));
        Self((minor & 0xff) | ((major & 0xfff) << 8) | ((minor & !0xff) << 12))
    }

    pub fn major(self) -> u32 {
        ((self.0 & 0xf_ff00) >> 8) as u32
    }

    pub fn minor(self) -> u32 {
        ((self.0 & 0xff) | ((self.0 >> 12) & 0xfff_ff00)) as u32
    }
}

impl fmt::LowerHex for DeviceNumber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Fieldless tag for each [`Command`] variant.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CommandKind {
    Subvol,
    Snapshot,
    Mkfile,
    Mkdir,
    Mknod,
    Mkfifo,
    Mksock,
    Symlink,
    Rename,
    Link,
    Unlink,
    Rmdir,
    Write,
    Clone,
    UpdateExtent,
    SetXattr,
    RemoveXattr,
    Truncate,
    Chmod,
    Chown,
    Utimes,
    Fallocate,
    Fileattr,
    EncodedWrite,
    End,
}

impl CommandKind {
    pub fn name(self) -> &'static str {
        match self {
            Self::Subvol => "subvol",
            Self::Snapshot => "snapshot",
            Self::Mkfile => "mkfile",
            Self::Mkdir => "mkdir",
            Self::Mknod => "mknod",
            Self::Mkfifo => "mkfifo",
            Self::Mksock => "mksock",
            Self::Symlink => "symlink",
            Self::Rename => "rename",
            Self::Link => "link",
            Self::Unlink => "unlink",
            Self::Rmdir => "rmdir",
            Self::Write => "write",
            Self::Clone => "clone",
            Self::UpdateExtent => "update_extent",
            Self::SetXattr => "set_xattr",
            Self::RemoveXattr => "remove_xattr",
            Self::Truncate => "truncate",
            Self::Chmod => "chmod",
            Self::Chown => "chown",
            Self::Utimes => "utimes",
            Self::Fallocate => "fallocate",
            Self::Fileattr => "fileattr",
            Self::EncodedWrite => "encoded_write",
            Self::End => "end",
        }
    }
}

impl fmt::Display for CommandKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// One decoded send-stream command.
///
/// Paths are raw bytes relative to the subvolume root. Write payloads are
/// reference-counted so the inode model can keep them without copying.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Subvol {
        path: Vec<u8>,
        uuid: Uuid,
        ctransid: u64,
    },
    Snapshot {
        path: Vec<u8>,
        uuid: Uuid,
        ctransid: u64,
        parent_uuid: Uuid,
        parent_ctransid: u64,
    },
    Mkfile {
        path: Vec<u8>,
    },
    Mkdir {
        path: Vec<u8>,
    },
    Mknod {
        path: Vec<u8>,
        mode: u32,
        dev: DeviceNumber,
    },
    Mkfifo {
        path: Vec<u8>,
    },
    Mksock {
        path: Vec<u8>,
    },
    Symlink {
        path: Vec<u8>,
        dest: Vec<u8>,
    },
    Rename {
        from: Vec<u8>,
        to: Vec<u8>,
    },
    /// Binds `dest` to the inode currently reachable at `path`.
    Link {
        path: Vec<u8>,
        dest: Vec<u8>,
    },
    Unlink {
        path: Vec<u8>,
    },
    Rmdir {
        path: Vec<u8>,
    },
    Write {
        path: Vec<u8>,
        offset: u64,
        data: Arc<[u8]>,
    },
    Clone {
        path: Vec<u8>,
        offset: u64,
        len: u64,
        from_uuid: Uuid,
        from_ctransid: u64,
        from_path: Vec<u8>,
        from_offset: u64,
    },
    /// A written range whose bytes are not carried (`send --no-data`).
    UpdateExtent {
        path: Vec<u8>,
        offset: u64,
        len: u64,
    },
    SetXattr {
        path: Vec<u8>,
        name: Vec<u8>,
        data: Vec<u8>,
    },
    RemoveXattr {
        path: Vec<u8>,
        name: Vec<u8>,
    },
    Truncate {
        path: Vec<u8>,
        size: u64,
    },
    Chmod {
        path: Vec<u8>,
        mode: u32,
    },
    Chown {
        path: Vec<u8>,
        uid: u64,
        gid: u64,
    },
    Utimes {
        path: Vec<u8>,
        atime: Timespec,
        mtime: Timespec,
        ctime: Timespec,
    },
    Fallocate {
        path: Vec<u8>,
        mode: u32,
        offset: u64,
        len: u64,
    },
    Fileattr {
        path: Vec<u8>,
        attr: u64,
    },
    EncodedWrite {
        path: Vec<u8>,
        offset: u64,
        unencoded_file_len: u64,
        unencoded_len: u64,
        unencoded_offset: u64,
        compression: u32,
        encryption: u32,
        data: Arc<[u8]>,
    },
    End,
}

impl Command {
    pub fn kind(&self) -> CommandKind {
        match self {
            Self::Subvol { .. } => CommandKind::Subvol,
            Self::Snapshot { .. } => CommandKind::Snapshot,
            Self::Mkfile { .. } => CommandKind::Mkfile,
            Self::Mkdir { .. } => CommandKind::Mkdir,
            Self::Mknod { .. } => CommandKind::Mknod,
            Self::Mkfifo { .. } => CommandKind::Mkfifo,
            Self::Mksock { .. } => CommandKind::Mksock,
            Self::Symlink { .. } => CommandKind::Symlink,
            Self::Rename { .. } => CommandKind::Rename,
            Self::Link { .. } => CommandKind::Link,
            Self::Unlink { .. } => CommandKind::Unlink,
            Self::Rmdir { .. } => CommandKind::Rmdir,
            Self::Write { .. } => CommandKind::Write,
            Self::Clone { .. } => CommandKind::Clone,
            Self::UpdateExtent { .. } => CommandKind::UpdateExtent,
            Self::SetXattr { .. } => CommandKind::SetXattr,
            Self::RemoveXattr { .. } => CommandKind::RemoveXattr,
            Self::Truncate { .. } => CommandKind::Truncate,
            Self::Chmod { .. } => CommandKind::Chmod,
            Self::Chown { .. } => CommandKind::Chown,
            Self::Utimes { .. } => CommandKind::Utimes,
            Self::Fallocate { .. } => CommandKind::Fallocate,
            Self::Fileattr { .. } => CommandKind::Fileattr,
            Self::EncodedWrite { .. } => CommandKind::EncodedWrite,
            Self::End => CommandKind::End,
        }
    }

    /// The path this command acts on, if any (`from` for renames).
    pub fn path(&self) -> Option<&[u8]> {
        match self {
            Self::Subvol { path, .. }
            | Self::Snapshot { path, .. }
            | Self::Mkfile { path }
            | Self::Mkdir { path }
            | Self::Mknod { path, .. }
            | Self::Mkfifo { path }
            | Self::Mksock { path }
            | Self::Symlink { path, .. }
            | Self::Link { path, .. }
            | Self::Unlink { path }
            | Self::Rmdir { path }
            | Self::Write { path, .. }
            | Self::Clone { path, .. }
            | Self::UpdateExtent { path, .. }
            | Self::SetXattr { path, .. }
            | Self::RemoveXattr { path, .. }
            | Self::Truncate { path, .. }
            | Self::Chmod { path, .. }
            | Self::Chown { path, .. }
            | Self::Utimes { path, .. }
            | Self::Fallocate { path, .. }
            | Self::Fileattr { path, .. }
            | Self::EncodedWrite { path, .. } => Some(path),
            Self::Rename { from, .. } => Some(from),
            Self::End => None,
        }
    }

    /// True for the commands that create a new inode.
    pub fn is_creation(&self) -> bool {
        matches!(
            self.kind(),
            CommandKind::Mkfile
                | CommandKind::Mkdir
                | CommandKind::Mknod
                | CommandKind::Mkfifo
                | CommandKind::Mksock
                | CommandKind::Symlink
        )
    }
}

/// Escaped rendering of a raw path or value, without surrounding quotes.
pub struct Escaped<'a>(pub &'a [u8]);

impl fmt::Display for Escaped<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in self.0 {
            match b {
                b' ' => f.write_str("\\ ")?,
                _ => write!(f, "{}", std::ascii::escape_default(*b))?,
            }
        }
        Ok(())
    }
}

/// One line per command, close to `btrfs receive --dump`.
impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:<16}", self.kind().name())?;
        match self {
            Self::Subvol {
                path,
                uuid,
                ctransid,
            } => write!(f, "{} uuid={} transid={}", Escaped(path), uuid, ctransid),
            Self::Snapshot {
                path,
                uuid,
                ctransid,
                parent_uuid,
                parent_ctransid,
            } => write!(
                f,
                "{} uuid={} transid={} parent_uuid={} parent_transid={}",
                Escaped(path),
                uuid,
                ctransid,
                parent_uuid,
                parent_ctransid
            ),
            Self::Mkfile { path }
            | Self::Mkdir { path }
            | Self::Mkfifo { path }
            | Self::Mksock { path }
            | Self::Unlink { path }
            | Self::Rmdir { path } => write!(f, "{}", Escaped(path)),
            Self::Mknod { path, mode, dev } => {
                write!(f, "{} mode={:o} dev={:#x}", Escaped(path), mode, dev)
            }
            Self::Symlink { path, dest } => {
                write!(f, "{} dest={}", Escaped(path), Escaped(dest))
            }
            Self::Rename { from, to } => write!(f, "{} dest={}", Escaped(from), Escaped(to)),
            Self::Link { path, dest } => write!(f, "{} dest={}", Escaped(path), Escaped(dest)),
            Self::Write { path, offset, data } => write!(
                f,
                "{} offset={} len={}",
                Escaped(path),
                offset,
                data.len()
            ),
            Self::Clone {
                path,
                offset,
                len,
                from_uuid,
                from_ctransid,
                from_path,
                from_offset,
            } => write!(
                f,
                "{} offset={} len={} from={} clone_uuid={} clone_transid={} clone_offset={}",
                Escaped(path),
                offset,
                len,
                Escaped(from_path),
                from_uuid,
                from_ctransid,
                from_offset
            ),
            Self::UpdateExtent { path, offset, len } => {
                write!(f, "{} offset={} len={}", Escaped(path), offset, len)
            }
            Self::SetXattr { path, name, data } => write!(
                f,
                "{} name={} data={} len={}",
                Escaped(path),
                Escaped(name),
                Escaped(data),
                data.len()
            ),
            Self::RemoveXattr { path, name } => {
                write!(f, "{} name={}", Escaped(path), Escaped(name))
            }
            Self::Truncate { path, size } => write!(f, "{} size={}", Escaped(path), size),
            Self::Chmod { path, mode } => write!(f, "{} mode={:o}", Escaped(path), mode),
            Self::Chown { path, uid, gid } => {
                write!(f, "{} gid={} uid={}", Escaped(path), gid, uid)
            }
            Self::Utimes {
                path,
                atime,
                mtime,
                ctime,
            } => write!(
                f,
                "{} atime={} mtime={} ctime={}",
                Escaped(path),
                atime,
                mtime,
                ctime
            ),
            Self::Fallocate {
                path,
                mode,
                offset,
                len,
            } => write!(
                f,
                "{} mode={} offset={} len={}",
                Escaped(path),
                mode,
                offset,
                len
            ),
            Self::Fileattr { path, attr } => write!(f, "{} fileattr={:#x}", Escaped(path), attr),
            Self::EncodedWrite {
                path,
                offset,
                unencoded_file_len,
                unencoded_len,
                unencoded_offset,
                compression,
                encryption,
                data,
            } => write!(
                f,
                "{} offset={} len={} unencoded_file_len={} unencoded_len={} \
                 unencoded_offset={} compression={} encryption={}",
                Escaped(path),
                offset,
                data.len(),
                unencoded_file_len,
                unencoded_len,
                unencoded_offset,
                compression,
                encryption
            ),
            Self::End => Ok(()),
        }
    }
}
