//! Finished subvolumes keyed by UUID.

use std::collections::BTreeMap;

use btrdiff_config::{log_replay_debug, log_replay_info};
use btrdiff_stream::Command;
use tracing::field::display;
use uuid::Uuid;

use crate::forest::Forest;
use crate::subvolume::{Subvolume, SubvolumeMutator};
use crate::{ReconstructionError, Result};

/// Every subvolume replayed so far. Snapshots and clones resolve their
/// sources here.
#[derive(Debug, Default, Clone)]
pub struct SubvolumeSet {
    subvolumes: BTreeMap<Uuid, Subvolume>,
}

impl SubvolumeSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.subvolumes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subvolumes.is_empty()
    }

    pub fn get(&self, uuid: Uuid) -> Option<&Subvolume> {
        self.subvolumes.get(&uuid)
    }

    /// Subvolumes in UUID order.
    pub fn iter(&self) -> impl Iterator<Item = &Subvolume> + '_ {
        self.subvolumes.values()
    }

    fn check_unused(&self, uuid: Uuid) -> Result<()> {
        if self.subvolumes.contains_key(&uuid) {
            return Err(ReconstructionError::DuplicateSubvolume {
                uuid,
                existing: self.display_name(uuid).unwrap_or_default(),
            });
        }
        Ok(())
    }

    /// Start replaying a stream whose first command is `subvol` or
    /// `snapshot`. Snapshots start from a copy-on-write view of the parent.
    pub fn begin(&self, command: &Command) -> Result<SubvolumeMutator> {
        let subvolume = match command {
            Command::Subvol {
                path,
                uuid,
                ctransid,
            } => {
                self.check_unused(*uuid)?;
                log_replay_debug!(
                    "begin subvolume",
                    uuid = display(uuid),
                    name = display(path.escape_ascii())
                );
                Subvolume::new(path.clone(), *uuid, *ctransid, None, Forest::new())
            }
            Command::Snapshot {
                path,
                uuid,
                ctransid,
                parent_uuid,
                parent_ctransid,
            } => {
                self.check_unused(*uuid)?;
                let parent = self
                    .get(*parent_uuid)
                    .ok_or(ReconstructionError::UnknownParent { uuid: *parent_uuid })?;
                log_replay_debug!(
                    "begin snapshot",
                    uuid = display(uuid),
                    parent_uuid = display(parent_uuid),
                    name = display(path.escape_ascii())
                );
                Subvolume::new(
                    path.clone(),
                    *uuid,
                    *ctransid,
                    Some((*parent_uuid, *parent_ctransid)),
                    parent.forest().clone(),
                )
            }
            other => return Err(ReconstructionError::MustSpecifySubvolume(other.kind())),
        };
        Ok(SubvolumeMutator::new(subvolume))
    }

    /// Add a finished subvolume.
    pub fn insert(&mut self, subvolume: Subvolume) -> Result<()> {
        self.check_unused(subvolume.uuid())?;
        let uuid = subvolume.uuid();
        self.subvolumes.insert(uuid, subvolume);
        log_replay_info!(
            "subvolume added",
            uuid = display(uuid),
            name = display(self.display_name(uuid).unwrap_or_default())
        );
        Ok(())
    }

    /// The shortest of `name`, `name@<hex prefix of uuid>` that no other
    /// subvolume in the set shares.
    pub fn display_name(&self, uuid: Uuid) -> Option<String> {
        let subvolume = self.get(uuid)?;
        let name = String::from_utf8_lossy(subvolume.name()).into_owned();
        let hex = uuid.simple().to_string();
        let same_name: Vec<String> = self
            .iter()
            .filter(|other| other.name() == subvolume.name())
            .map(|other| other.uuid().simple().to_string())
            .collect();
        for len in 0..=hex.len() {
            let prefix = &hex[..len];
            let sharing = same_name.iter().filter(|h| h.starts_with(prefix)).count();
            if sharing < 2 {
                return Some(if len == 0 {
                    name
                } else {
                    format!("{name}@{prefix}")
                });
            }
        }
        Some(format!("{name}@{hex}-ERROR"))
    }
}
