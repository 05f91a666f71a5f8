//! # btrdiff-inode
//!
//! In-memory filesystem objects assembled from send-stream commands.
//!
//! An [`IncompleteInode`] starts life from a creation command and accumulates
//! attributes as later commands name it. Attributes the stream never sets
//! stay `None`, which is what makes the inode "incomplete".
//!
//! Every inode renders a deterministic digest through `Display`, e.g.
//! `(File o10:20 m4733 h10d15)`, used to compare reconstructed trees.

pub mod digest;
pub mod extents;
pub mod inode;

pub use extents::{CloneOrigin, EncodedExtent, FileExtents, Segment, SegmentSource};
pub use inode::{IncompleteInode, InodeKind, InodeOwner, InodeUtimes};

use btrdiff_stream::CommandKind;
use thiserror::Error;

pub const S_IFMT: u32 = 0o170000;
pub const S_IFSOCK: u32 = 0o140000;
pub const S_IFLNK: u32 = 0o120000;
pub const S_IFREG: u32 = 0o100000;
pub const S_IFBLK: u32 = 0o060000;
pub const S_IFDIR: u32 = 0o040000;
pub const S_IFCHR: u32 = 0o020000;
pub const S_IFIFO: u32 = 0o010000;

/// Permission, setuid/setgid and sticky bits.
pub const MODE_PERMISSION_BITS: u32 = 0o7777;

/// A command that is illegal for one inode in its current state.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InodeError {
    #[error("chmod {mode:o} cannot change file type of {variant} inode ({file_type:o})")]
    IllegalChmod {
        mode: u32,
        file_type: u32,
        variant: &'static str,
    },

    #[error("cannot chmod symlink")]
    ChmodSymlink,

    #[error("no such xattr: {}", .name.escape_ascii())]
    NoSuchXattr { name: Vec<u8> },

    #[error("cannot apply {command} to {variant}")]
    Inapplicable {
        command: CommandKind,
        variant: &'static str,
    },

    #[error("{0} does not create an inode")]
    NotACreation(CommandKind),

    #[error("unexpected device mode {0:o}")]
    UnexpectedDeviceMode(u32),

    #[error("clone onto {variant} needs a resolved source extent map")]
    CloneNeedsSource { variant: &'static str },

    #[error("extent at offset {offset} with length {len} overflows the file size")]
    ExtentOverflow { offset: u64, len: u64 },
}

pub type Result<T> = std::result::Result<T, InodeError>;
