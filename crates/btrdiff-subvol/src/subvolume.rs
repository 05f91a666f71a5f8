//! Per-stream reconstruction and the finished [`Subvolume`].

use std::collections::BTreeMap;

use btrdiff_config::log_replay_debug;
use btrdiff_inode::{CloneOrigin, IncompleteInode};
use btrdiff_stream::Command;
use tracing::trace;
use uuid::Uuid;

use crate::forest::Forest;
use crate::set::SubvolumeSet;
use crate::{ReconstructionError, Result};

/// A subvolume rebuilt from one send-stream. Read-only once finished.
#[derive(Debug, Clone)]
pub struct Subvolume {
    name: Vec<u8>,
    uuid: Uuid,
    ctransid: u64,
    parent: Option<(Uuid, u64)>,
    forest: Forest,
}

impl Subvolume {
    pub(crate) fn new(
        name: Vec<u8>,
        uuid: Uuid,
        ctransid: u64,
        parent: Option<(Uuid, u64)>,
        forest: Forest,
    ) -> Self {
        Self {
            name,
            uuid,
            ctransid,
            parent,
            forest,
        }
    }

    /// Name from the `subvol`/`snapshot` command.
    pub fn name(&self) -> &[u8] {
        &self.name
    }

    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn ctransid(&self) -> u64 {
        self.ctransid
    }

    /// UUID and ctransid of the snapshot parent.
    pub fn parent(&self) -> Option<(Uuid, u64)> {
        self.parent
    }

    pub fn forest(&self) -> &Forest {
        &self.forest
    }

    pub fn inode_at(&self, path: &[u8]) -> Option<&IncompleteInode> {
        self.forest.get(path)
    }

    /// Every bound path with its inode digest. Hardlinked paths repeat the
    /// same digest.
    pub fn listing(&self) -> BTreeMap<Vec<u8>, String> {
        self.forest
            .iter()
            .filter_map(|(path, id)| {
                self.forest
                    .inode(id)
                    .map(|inode| (path.to_vec(), inode.to_string()))
            })
            .collect()
    }
}

/// Applies the commands of one stream to a subvolume under construction.
#[derive(Debug)]
pub struct SubvolumeMutator {
    subvolume: Subvolume,
    ended: bool,
}

impl SubvolumeMutator {
    pub(crate) fn new(subvolume: Subvolume) -> Self {
        Self {
            subvolume,
            ended: false,
        }
    }

    /// The state built so far.
    pub fn subvolume(&self) -> &Subvolume {
        &self.subvolume
    }

    pub fn is_ended(&self) -> bool {
        self.ended
    }

    /// Apply one command. `set` resolves clone sources in other subvolumes.
    ///
    /// A failed command leaves the tree as it was.
    pub fn apply(&mut self, command: &Command, set: &SubvolumeSet) -> Result<()> {
        if self.ended {
            return Err(ReconstructionError::AlreadyEnded(command.kind()));
        }
        trace!(command = %command.kind(), "reconstruct");
        let forest = &mut self.subvolume.forest;
        match command {
            Command::Subvol { .. } | Command::Snapshot { .. } => {
                return Err(ReconstructionError::NestedSubvolume(command.kind()));
            }
            Command::End => {
                self.ended = true;
                log_replay_debug!(
                    "subvolume complete",
                    uuid = tracing::field::display(self.subvolume.uuid),
                    paths = forest.len(),
                    inodes = forest.inode_count()
                );
            }
            Command::Mkfile { path }
            | Command::Mkdir { path }
            | Command::Mknod { path, .. }
            | Command::Mkfifo { path }
            | Command::Mksock { path }
            | Command::Symlink { path, .. } => {
                let inode = IncompleteInode::from_command(command).map_err(|source| {
                    ReconstructionError::Inode {
                        path: path.clone(),
                        source,
                    }
                })?;
                forest.create(path, inode)?;
            }
            Command::Rename { from, to } => forest.rename(from, to)?,
            Command::Link { path, dest } => forest.link(path, dest)?,
            Command::Unlink { path } => forest.unlink(path)?,
            Command::Rmdir { path } => forest.rmdir(path)?,
            Command::Clone {
                path,
                offset,
                len,
                from_uuid,
                from_path,
                from_offset,
                ..
            } => {
                let origin = CloneOrigin {
                    subvolume: *from_uuid,
                    path: from_path.clone(),
                    offset: *from_offset,
                };
                self.apply_clone(path, *offset, *len, origin, set)?;
            }
            Command::Write { path, .. }
            | Command::UpdateExtent { path, .. }
            | Command::SetXattr { path, .. }
            | Command::RemoveXattr { path, .. }
            | Command::Truncate { path, .. }
            | Command::Chmod { path, .. }
            | Command::Chown { path, .. }
            | Command::Utimes { path, .. }
            | Command::Fallocate { path, .. }
            | Command::Fileattr { path, .. }
            | Command::EncodedWrite { path, .. } => {
                forest
                    .inode_mut(path)?
                    .apply(command)
                    .map_err(|source| ReconstructionError::Inode {
                        path: path.clone(),
                        source,
                    })?;
            }
        }
        Ok(())
    }

    fn apply_clone(
        &mut self,
        path: &[u8],
        offset: u64,
        len: u64,
        origin: CloneOrigin,
        set: &SubvolumeSet,
    ) -> Result<()> {
        let source_forest = if origin.subvolume == self.subvolume.uuid {
            &self.subvolume.forest
        } else {
            set.get(origin.subvolume)
                .ok_or(ReconstructionError::UnknownCloneSource {
                    uuid: origin.subvolume,
                })?
                .forest()
        };
        // Holding an Arc keeps the source readable while the target is
        // borrowed mutably, including when both are the same inode.
        let source = source_forest
            .shared(&origin.path)
            .ok_or_else(|| ReconstructionError::NoSuchPath {
                path: origin.path.clone(),
            })?;
        let extents = source
            .extents()
            .ok_or_else(|| ReconstructionError::CloneSourceNotFile {
                path: origin.path.clone(),
            })?;
        self.subvolume
            .forest
            .inode_mut(path)?
            .apply_clone(offset, len, extents, origin)
            .map_err(|source| ReconstructionError::Inode {
                path: path.to_vec(),
                source,
            })
    }

    /// The finished subvolume; only valid after `end`.
    pub fn finish(self) -> Result<Subvolume> {
        if !self.ended {
            return Err(ReconstructionError::MissingEnd);
        }
        Ok(self.subvolume)
    }
}
