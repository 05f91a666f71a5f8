//! Path claims a reconstructed subvolume makes to image build steps.

use thiserror::Error;

use crate::forest::ROOT;
use crate::subvolume::Subvolume;

/// Absolute, `.`/`..`-free form of `path`. `..` at the root stays at the
/// root.
pub fn normalize_path(path: &[u8]) -> Vec<u8> {
    let mut parts: Vec<&[u8]> = Vec::new();
    for part in path.split(|&b| b == b'/') {
        match part {
            b"" | b"." => {}
            b".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    if parts.is_empty() {
        return b"/".to_vec();
    }
    let mut out = Vec::with_capacity(path.len() + 1);
    for part in parts {
        out.push(b'/');
        out.extend_from_slice(part);
    }
    out
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ClaimError {
    #[error("claim for {} cannot answer a requirement on {}", .provided.escape_ascii(), .required.escape_ascii())]
    PathMismatch { provided: Vec<u8>, required: Vec<u8> },
}

/// Something a subvolume makes available at a path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Provides {
    Directory(Vec<u8>),
    File(Vec<u8>),
}

/// Something a build step needs at a path.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Requirement {
    Directory(Vec<u8>),
}

impl Provides {
    pub fn directory(path: &[u8]) -> Self {
        Self::Directory(normalize_path(path))
    }

    pub fn file(path: &[u8]) -> Self {
        Self::File(normalize_path(path))
    }

    pub fn path(&self) -> &[u8] {
        match self {
            Self::Directory(path) | Self::File(path) => path,
        }
    }

    /// Whether this claim satisfies `requirement`. Both must name the same
    /// path; asking about another path is a caller error.
    pub fn matches(&self, requirement: &Requirement) -> Result<bool, ClaimError> {
        if self.path() != requirement.path() {
            return Err(ClaimError::PathMismatch {
                provided: self.path().to_vec(),
                required: requirement.path().to_vec(),
            });
        }
        Ok(match (self, requirement) {
            (Self::Directory(_), Requirement::Directory(_)) => true,
            (Self::File(_), Requirement::Directory(_)) => false,
        })
    }
}

impl Requirement {
    pub fn directory(path: &[u8]) -> Self {
        Self::Directory(normalize_path(path))
    }

    pub fn path(&self) -> &[u8] {
        match self {
            Self::Directory(path) => path,
        }
    }
}

impl Subvolume {
    /// One claim per bound path, in path order. The root provides `/`.
    pub fn provides(&self) -> Vec<Provides> {
        let mut claims: Vec<Provides> = self
            .forest()
            .iter()
            .filter_map(|(path, id)| {
                let inode = self.forest().inode(id)?;
                let path = if path == ROOT { b"/".as_slice() } else { path };
                Some(if inode.is_dir() {
                    Provides::directory(path)
                } else {
                    Provides::file(path)
                })
            })
            .collect();
        claims.sort_by(|a, b| a.path().cmp(b.path()));
        claims
    }
}

#[cfg(test)]
mod tests {
    use btrdiff_stream::Command;
    use uuid::Uuid;

    use super::*;
    use crate::set::SubvolumeSet;

    #[test]
    fn test_normalize_path() {
        assert_eq!(normalize_path(b"a//."), b"/a");
        assert_eq!(normalize_path(b"/b/c//../d"), b"/b/d");
        assert_eq!(normalize_path(b"///x/./y/"), b"/x/y");
        assert_eq!(normalize_path(b"."), b"/");
        assert_eq!(normalize_path(b"/../a"), b"/a");
    }

    #[test]
    fn test_directory_claims() {
        let required = Requirement::directory(b"a/b");
        assert!(Provides::directory(b"/a//b/").matches(&required).unwrap());
        assert!(!Provides::file(b"a/b").matches(&required).unwrap());
        assert_eq!(
            Provides::directory(b"a").matches(&required),
            Err(ClaimError::PathMismatch {
                provided: b"/a".to_vec(),
                required: b"/a/b".to_vec(),
            })
        );
    }

    #[test]
    fn test_subvolume_provides() {
        let set = SubvolumeSet::new();
        let mut m = set
            .begin(&Command::Subvol {
                path: b"v".to_vec(),
                uuid: Uuid::from_u128(1),
                ctransid: 1,
            })
            .unwrap();
        for command in [
            Command::Mkdir { path: b"etc".to_vec() },
            Command::Mkfile {
                path: b"etc/passwd".to_vec(),
            },
            Command::Symlink {
                path: b"link".to_vec(),
                dest: b"etc".to_vec(),
            },
            Command::End,
        ] {
            m.apply(&command, &set).unwrap();
        }
        let subvol = m.finish().unwrap();
        assert_eq!(
            subvol.provides(),
            [
                Provides::Directory(b"/".to_vec()),
                Provides::Directory(b"/etc".to_vec()),
                Provides::File(b"/etc/passwd".to_vec()),
                Provides::File(b"/link".to_vec()),
            ]
        );
    }
}
