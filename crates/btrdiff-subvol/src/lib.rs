//! # btrdiff-subvol
//!
//! Rebuilds subvolume trees by replaying send-stream commands.
//!
//! ## Layers
//!
//! - [`forest`]: path to inode bindings for one subvolume, copy-on-write
//! - [`subvolume`]: the per-stream state machine and the finished subvolume
//! - [`set`]: finished subvolumes by UUID, snapshot and clone resolution
//! - [`replay`]: drives decoders into a set, wrapping errors with context
//! - [`provides`]: path claims derived from a reconstructed tree
//!
//! A snapshot shares its parent's inodes through `Arc` until it first
//! mutates one, so parents are never touched and replays of independent
//! children can run on separate threads against a shared `&SubvolumeSet`.

pub mod forest;
pub mod provides;
pub mod replay;
pub mod set;
pub mod subvolume;

pub use forest::{Forest, InodeId};
pub use provides::{normalize_path, ClaimError, Provides, Requirement};
pub use replay::{replay_commands, replay_stream, replay_streams, ReplayError, ReplayFailure, ReplayOptions};
pub use set::SubvolumeSet;
pub use subvolume::{Subvolume, SubvolumeMutator};

use btrdiff_inode::InodeError;
use btrdiff_stream::CommandKind;
use thiserror::Error;
use uuid::Uuid;

/// A command that is illegal against the tree built so far.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ReconstructionError {
    #[error("path does not exist: {}", .path.escape_ascii())]
    NoSuchPath { path: Vec<u8> },

    #[error("path already exists: {}", .path.escape_ascii())]
    PathExists { path: Vec<u8> },

    #[error("Missing ancestor for {}", .path.escape_ascii())]
    MissingAncestor { path: Vec<u8> },

    #[error("parent of {} is not a directory", .path.escape_ascii())]
    NotADirectory { path: Vec<u8> },

    #[error("rename of {} to {} makes path its own subdirectory", .from.escape_ascii(), .to.escape_ascii())]
    RenameIntoSelf { from: Vec<u8>, to: Vec<u8> },

    #[error("source of rename {} does not exist", .path.escape_ascii())]
    RenameSourceMissing { path: Vec<u8> },

    #[error("rename to {} cannot overwrite a directory with a non-directory", .to.escape_ascii())]
    OverwriteDirWithNonDir { to: Vec<u8> },

    #[error("rename to {} cannot overwrite a non-directory, since a directory may only overwrite an empty directory", .to.escape_ascii())]
    OverwriteNonDirWithDir { to: Vec<u8> },

    #[error("cannot remove {}, since it has children", .path.escape_ascii())]
    DirectoryNotEmpty { path: Vec<u8> },

    #[error("Destination of link {} already exists", .path.escape_ascii())]
    LinkDestinationExists { path: Vec<u8> },

    #[error("link source does not exist: {}", .path.escape_ascii())]
    LinkSourceMissing { path: Vec<u8> },

    #[error("Cannot link a directory: {}", .path.escape_ascii())]
    LinkDirectory { path: Vec<u8> },

    #[error("Cannot unlink a directory: {}", .path.escape_ascii())]
    UnlinkDirectory { path: Vec<u8> },

    #[error("Can only rmdir a directory: {}", .path.escape_ascii())]
    RmdirNonDirectory { path: Vec<u8> },

    #[error("cannot remove or replace the subvolume root")]
    RootImmutable,

    #[error("Unknown from_uuid {uuid} for clone")]
    UnknownCloneSource { uuid: Uuid },

    #[error("clone source {} is not a regular file", .path.escape_ascii())]
    CloneSourceNotFile { path: Vec<u8> },

    #[error("{0} must specify subvolume")]
    MustSpecifySubvolume(CommandKind),

    #[error("{0} inside a subvolume that is already being replayed")]
    NestedSubvolume(CommandKind),

    #[error("unknown parent subvolume {uuid}")]
    UnknownParent { uuid: Uuid },

    #[error("subvolume {uuid} is already in use: {existing}")]
    DuplicateSubvolume { uuid: Uuid, existing: String },

    #[error("{0} after the end command")]
    AlreadyEnded(CommandKind),

    #[error("commands ran out before the end command")]
    MissingEnd,

    #[error("no commands to replay")]
    EmptyStream,

    #[error("{}: {source}", .path.escape_ascii())]
    Inode {
        path: Vec<u8>,
        #[source]
        source: InodeError,
    },
}

pub type Result<T> = std::result::Result<T, ReconstructionError>;
