//! Path bindings for one subvolume.
//!
//! Paths map to [`InodeId`]s and ids map to shared inodes. Cloning a
//! [`Forest`] copies only the maps; inodes stay behind `Arc` until
//! [`Forest::inode_mut`] makes a private copy.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::fmt;
use std::sync::Arc;

use btrdiff_inode::{IncompleteInode, InodeKind};
use tracing::trace;

use crate::{ReconstructionError, Result};

/// The subvolume root.
pub const ROOT: &[u8] = b".";

/// Identity of an inode within one forest and the snapshots cloned from it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InodeId(u64);

impl InodeId {
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for InodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// `""` and `"."` both name the root.
pub fn canonical(path: &[u8]) -> &[u8] {
    if path.is_empty() {
        ROOT
    } else {
        path
    }
}

fn parent_of(path: &[u8]) -> Option<&[u8]> {
    if path == ROOT {
        return None;
    }
    match path.iter().rposition(|&b| b == b'/') {
        Some(pos) => Some(canonical(&path[..pos])),
        None => Some(ROOT),
    }
}

fn is_inside(path: &[u8], dir: &[u8]) -> bool {
    if dir == ROOT {
        return path != ROOT;
    }
    path.len() > dir.len() && path.starts_with(dir) && path[dir.len()] == b'/'
}

fn join(prefix: &[u8], rest: &[u8]) -> Vec<u8> {
    let mut out = prefix.to_vec();
    out.extend_from_slice(rest);
    out
}

#[derive(Debug, Clone)]
pub struct Forest {
    paths: BTreeMap<Vec<u8>, InodeId>,
    names: HashMap<InodeId, BTreeSet<Vec<u8>>>,
    inodes: HashMap<InodeId, Arc<IncompleteInode>>,
    next_id: u64,
}

impl Default for Forest {
    fn default() -> Self {
        Self::new()
    }
}

impl Forest {
    /// A forest holding only the root directory.
    pub fn new() -> Self {
        let root = InodeId(0);
        let mut forest = Self {
            paths: BTreeMap::new(),
            names: HashMap::new(),
            inodes: HashMap::new(),
            next_id: 1,
        };
        forest
            .inodes
            .insert(root, Arc::new(IncompleteInode::new(InodeKind::Dir)));
        forest.bind(ROOT.to_vec(), root);
        forest
    }

    /// Number of bound paths, the root included.
    pub fn len(&self) -> usize {
        self.paths.len()
    }

    pub fn is_empty(&self) -> bool {
        self.paths.is_empty()
    }

    /// Number of distinct inodes.
    pub fn inode_count(&self) -> usize {
        self.inodes.len()
    }

    pub fn id_of(&self, path: &[u8]) -> Option<InodeId> {
        self.paths.get(canonical(path)).copied()
    }

    pub fn get(&self, path: &[u8]) -> Option<&IncompleteInode> {
        self.id_of(path).and_then(|id| self.inode(id))
    }

    pub fn inode(&self, id: InodeId) -> Option<&IncompleteInode> {
        self.inodes.get(&id).map(Arc::as_ref)
    }

    /// Shared handle to the inode at `path`.
    pub fn shared(&self, path: &[u8]) -> Option<Arc<IncompleteInode>> {
        self.id_of(path)
            .and_then(|id| self.inodes.get(&id))
            .map(Arc::clone)
    }

    /// Every path bound to `id`, sorted.
    pub fn paths_of(&self, id: InodeId) -> impl Iterator<Item = &[u8]> + '_ {
        self.names
            .get(&id)
            .into_iter()
            .flat_map(|names| names.iter().map(Vec::as_slice))
    }

    /// Bound paths in byte order with their ids.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], InodeId)> + '_ {
        self.paths.iter().map(|(path, id)| (path.as_slice(), *id))
    }

    /// True when both forests hold the same `Arc` for `path`.
    pub fn shares_inode_with(&self, other: &Forest, path: &[u8]) -> bool {
        match (self.shared(path), other.shared(path)) {
            (Some(a), Some(b)) => Arc::ptr_eq(&a, &b),
            _ => false,
        }
    }

    /// Mutable access to the inode at `path`, copying it first if it is
    /// still shared with another forest.
    pub fn inode_mut(&mut self, path: &[u8]) -> Result<&mut IncompleteInode> {
        let id = self.id_of(path).ok_or_else(|| ReconstructionError::NoSuchPath {
            path: path.to_vec(),
        })?;
        let inode = self
            .inodes
            .get_mut(&id)
            .ok_or_else(|| ReconstructionError::NoSuchPath {
                path: path.to_vec(),
            })?;
        Ok(Arc::make_mut(inode))
    }

    fn is_dir(&self, path: &[u8]) -> bool {
        self.get(path).is_some_and(IncompleteInode::is_dir)
    }

    /// Paths strictly below `dir`, in byte order.
    pub fn descendants(&self, dir: &[u8]) -> Vec<Vec<u8>> {
        let dir = canonical(dir);
        if dir == ROOT {
            return self
                .paths
                .keys()
                .filter(|p| p.as_slice() != ROOT)
                .cloned()
                .collect();
        }
        let prefix = join(dir, b"/");
        self.paths
            .range(prefix.clone()..)
            .take_while(|(p, _)| p.starts_with(&prefix))
            .map(|(p, _)| p.clone())
            .collect()
    }

    pub fn has_children(&self, dir: &[u8]) -> bool {
        let dir = canonical(dir);
        if dir == ROOT {
            return self.paths.len() > 1;
        }
        let prefix = join(dir, b"/");
        self.paths
            .range(prefix.clone()..)
            .next()
            .is_some_and(|(p, _)| p.starts_with(&prefix))
    }

    fn check_new_path(&self, path: &[u8]) -> Result<()> {
        if self.paths.contains_key(path) {
            return Err(ReconstructionError::PathExists {
                path: path.to_vec(),
            });
        }
        self.check_parent(path)
    }

    fn check_parent(&self, path: &[u8]) -> Result<()> {
        let Some(parent) = parent_of(path) else {
            return Err(ReconstructionError::RootImmutable);
        };
        match self.get(parent) {
            None => Err(ReconstructionError::MissingAncestor {
                path: path.to_vec(),
            }),
            Some(inode) if !inode.is_dir() => Err(ReconstructionError::NotADirectory {
                path: path.to_vec(),
            }),
            Some(_) => Ok(()),
        }
    }

    fn bind(&mut self, path: Vec<u8>, id: InodeId) {
        self.names.entry(id).or_default().insert(path.clone());
        self.paths.insert(path, id);
    }

    /// Drop one name; the inode goes with its last name.
    fn unbind(&mut self, path: &[u8]) -> Option<InodeId> {
        let id = self.paths.remove(path)?;
        let orphaned = match self.names.get_mut(&id) {
            Some(names) => {
                names.remove(path);
                names.is_empty()
            }
            None => true,
        };
        if orphaned {
            self.names.remove(&id);
            self.inodes.remove(&id);
            trace!(%id, "inode dropped with its last name");
        }
        Some(id)
    }

    /// Bind a fresh inode at an unbound `path` whose parent is a directory.
    pub fn create(&mut self, path: &[u8], inode: IncompleteInode) -> Result<InodeId> {
        let path = canonical(path);
        self.check_new_path(path)?;
        let id = InodeId(self.next_id);
        self.next_id += 1;
        self.inodes.insert(id, Arc::new(inode));
        self.bind(path.to_vec(), id);
        Ok(id)
    }

    /// Bind `dest` to the inode at `path`. Directories cannot be linked.
    pub fn link(&mut self, path: &[u8], dest: &[u8]) -> Result<()> {
        let (path, dest) = (canonical(path), canonical(dest));
        if self.paths.contains_key(dest) {
            return Err(ReconstructionError::LinkDestinationExists {
                path: dest.to_vec(),
            });
        }
        let id = self
            .id_of(path)
            .ok_or_else(|| ReconstructionError::LinkSourceMissing {
                path: path.to_vec(),
            })?;
        if self.is_dir(path) {
            return Err(ReconstructionError::LinkDirectory {
                path: path.to_vec(),
            });
        }
        self.check_parent(dest)?;
        self.bind(dest.to_vec(), id);
        Ok(())
    }

    /// rename(2): move `from` and everything below it to `to`.
    pub fn rename(&mut self, from: &[u8], to: &[u8]) -> Result<()> {
        let (from, to) = (canonical(from), canonical(to));
        if from == ROOT || to == ROOT {
            return Err(ReconstructionError::RootImmutable);
        }
        if is_inside(to, from) {
            return Err(ReconstructionError::RenameIntoSelf {
                from: from.to_vec(),
                to: to.to_vec(),
            });
        }
        let Some(src) = self.id_of(from) else {
            return Err(ReconstructionError::RenameSourceMissing {
                path: from.to_vec(),
            });
        };
        self.check_parent(to)?;
        let src_is_dir = self.is_dir(from);
        if let Some(dst) = self.id_of(to) {
            if dst == src {
                return Ok(());
            }
            match (src_is_dir, self.is_dir(to)) {
                (true, false) => {
                    return Err(ReconstructionError::OverwriteNonDirWithDir { to: to.to_vec() })
                }
                (false, true) => {
                    return Err(ReconstructionError::OverwriteDirWithNonDir { to: to.to_vec() })
                }
                (true, true) if self.has_children(to) => {
                    return Err(ReconstructionError::DirectoryNotEmpty { path: to.to_vec() })
                }
                _ => {}
            }
            self.unbind(to);
        }

        let mut moved = vec![from.to_vec()];
        if src_is_dir {
            moved.extend(self.descendants(from));
        }
        for old in moved {
            if let Some(id) = self.paths.remove(&old) {
                if let Some(names) = self.names.get_mut(&id) {
                    names.remove(&old);
                }
                self.bind(join(to, &old[from.len()..]), id);
            }
        }
        Ok(())
    }

    pub fn unlink(&mut self, path: &[u8]) -> Result<()> {
        let path = canonical(path);
        if path == ROOT {
            return Err(ReconstructionError::RootImmutable);
        }
        match self.get(path) {
            None => Err(ReconstructionError::NoSuchPath {
                path: path.to_vec(),
            }),
            Some(inode) if inode.is_dir() => Err(ReconstructionError::UnlinkDirectory {
                path: path.to_vec(),
            }),
            Some(_) => {
                self.unbind(path);
                Ok(())
            }
        }
    }

    pub fn rmdir(&mut self, path: &[u8]) -> Result<()> {
        let path = canonical(path);
        if path == ROOT {
            return Err(ReconstructionError::RootImmutable);
        }
        match self.get(path) {
            None => Err(ReconstructionError::NoSuchPath {
                path: path.to_vec(),
            }),
            Some(inode) if !inode.is_dir() => Err(ReconstructionError::RmdirNonDirectory {
                path: path.to_vec(),
            }),
            Some(_) if self.has_children(path) => Err(ReconstructionError::DirectoryNotEmpty {
                path: path.to_vec(),
            }),
            Some(_) => {
                self.unbind(path);
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use btrdiff_stream::Command;

    use super::*;

    fn dir() -> IncompleteInode {
        IncompleteInode::new(InodeKind::Dir)
    }

    fn fifo() -> IncompleteInode {
        IncompleteInode::new(InodeKind::Fifo)
    }

    fn paths(forest: &Forest) -> Vec<String> {
        forest
            .iter()
            .map(|(p, _)| String::from_utf8_lossy(p).into_owned())
            .collect()
    }

    #[test]
    fn test_root_is_a_directory() {
        let forest = Forest::new();
        assert!(forest.get(b".").unwrap().is_dir());
        assert_eq!(forest.id_of(b""), forest.id_of(b"."));
        assert_eq!(forest.len(), 1);
    }

    #[test]
    fn test_create_requires_directory_parent() {
        let mut forest = Forest::new();
        assert_eq!(
            forest.create(b"a/b", dir()).unwrap_err(),
            ReconstructionError::MissingAncestor {
                path: b"a/b".to_vec()
            }
        );
        forest.create(b"f", fifo()).unwrap();
        assert_eq!(
            forest.create(b"f/x", dir()).unwrap_err(),
            ReconstructionError::NotADirectory {
                path: b"f/x".to_vec()
            }
        );
        assert_eq!(
            forest.create(b"f", dir()).unwrap_err(),
            ReconstructionError::PathExists { path: b"f".to_vec() }
        );
    }

    #[test]
    fn test_rename_moves_descendants() {
        let mut forest = Forest::new();
        forest.create(b"a", dir()).unwrap();
        forest.create(b"a/b", dir()).unwrap();
        forest.create(b"a/b/c", fifo()).unwrap();
        forest.create(b"ab", fifo()).unwrap();
        forest.rename(b"a", b"z").unwrap();
        assert_eq!(paths(&forest), [".", "ab", "z", "z/b", "z/b/c"]);
    }

    #[test]
    fn test_rename_rules() {
        let mut forest = Forest::new();
        forest.create(b"d", dir()).unwrap();
        forest.create(b"d/x", fifo()).unwrap();
        forest.create(b"e", dir()).unwrap();
        forest.create(b"f", fifo()).unwrap();

        assert!(matches!(
            forest.rename(b"d", b"d/sub"),
            Err(ReconstructionError::RenameIntoSelf { .. })
        ));
        assert!(matches!(
            forest.rename(b"nope", b"q"),
            Err(ReconstructionError::RenameSourceMissing { .. })
        ));
        assert!(matches!(
            forest.rename(b"f", b"e"),
            Err(ReconstructionError::OverwriteDirWithNonDir { .. })
        ));
        assert!(matches!(
            forest.rename(b"e", b"f"),
            Err(ReconstructionError::OverwriteNonDirWithDir { .. })
        ));
        assert!(matches!(
            forest.rename(b"e", b"d"),
            Err(ReconstructionError::DirectoryNotEmpty { .. })
        ));

        // A directory may replace an empty one.
        forest.rename(b"d", b"e").unwrap();
        assert_eq!(paths(&forest), [".", "e", "e/x", "f"]);
        // A file may replace a file; the replaced inode disappears.
        let before = forest.inode_count();
        forest.rename(b"f", b"e/x").unwrap();
        assert_eq!(paths(&forest), [".", "e", "e/x"]);
        assert_eq!(forest.inode_count(), before - 1);
    }

    #[test]
    fn test_rename_between_aliases_is_a_noop() {
        let mut forest = Forest::new();
        forest.create(b"a", fifo()).unwrap();
        forest.link(b"a", b"b").unwrap();
        forest.rename(b"a", b"b").unwrap();
        assert_eq!(paths(&forest), [".", "a", "b"]);
    }

    #[test]
    fn test_link_and_unlink() {
        let mut forest = Forest::new();
        forest.create(b"d", dir()).unwrap();
        let id = forest.create(b"a", fifo()).unwrap();
        assert!(matches!(
            forest.link(b"d", b"x"),
            Err(ReconstructionError::LinkDirectory { .. })
        ));
        assert!(matches!(
            forest.link(b"nope", b"x"),
            Err(ReconstructionError::LinkSourceMissing { .. })
        ));
        assert!(matches!(
            forest.link(b"a", b"d"),
            Err(ReconstructionError::LinkDestinationExists { .. })
        ));
        forest.link(b"a", b"d/b").unwrap();
        assert_eq!(
            forest.paths_of(id).collect::<Vec<_>>(),
            [b"a".as_slice(), b"d/b".as_slice()]
        );

        forest.unlink(b"a").unwrap();
        assert!(forest.inode(id).is_some());
        forest.unlink(b"d/b").unwrap();
        assert!(forest.inode(id).is_none());
        assert!(matches!(
            forest.unlink(b"d"),
            Err(ReconstructionError::UnlinkDirectory { .. })
        ));
    }

    #[test]
    fn test_rmdir_rules() {
        let mut forest = Forest::new();
        forest.create(b"d", dir()).unwrap();
        forest.create(b"d/f", fifo()).unwrap();
        assert!(matches!(
            forest.rmdir(b"d"),
            Err(ReconstructionError::DirectoryNotEmpty { .. })
        ));
        assert!(matches!(
            forest.rmdir(b"d/f"),
            Err(ReconstructionError::RmdirNonDirectory { .. })
        ));
        assert_eq!(forest.rmdir(b"."), Err(ReconstructionError::RootImmutable));
        forest.unlink(b"d/f").unwrap();
        forest.rmdir(b"d").unwrap();
        assert_eq!(paths(&forest), ["."]);
    }

    #[test]
    fn test_clone_shares_until_mutated() {
        let mut parent = Forest::new();
        parent.create(b"a", fifo()).unwrap();
        parent.link(b"a", b"b").unwrap();
        let mut child = parent.clone();
        assert!(child.shares_inode_with(&parent, b"a"));

        child
            .inode_mut(b"a")
            .unwrap()
            .apply(&Command::Chown {
                path: b"a".to_vec(),
                uid: 7,
                gid: 8,
            })
            .unwrap();
        assert!(!child.shares_inode_with(&parent, b"a"));
        assert_eq!(child.get(b"b").unwrap().owner(), child.get(b"a").unwrap().owner());
        assert_eq!(parent.get(b"a").unwrap().owner(), None);
    }
}
