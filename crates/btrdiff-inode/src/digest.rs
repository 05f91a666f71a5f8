//! Deterministic one-line digests of inode state.
//!
//! ```text
//! (File o10:20 m4733 t70/01/01.00:00:01.9+0.9-1.1 h10d15h15d5)
//!  |    |      |     |                             |
//!  |    owner  mode  ctime, mtime-ctime, atime-mtime  hole/data runs
//!  type
//! ```
//!
//! Times are truncated to milliseconds. The digest only reads current state,
//! so any two command histories that reach the same state render the same.

use std::fmt;

use btrdiff_stream::Timespec;
use chrono::{DateTime, Utc};

use crate::inode::{IncompleteInode, InodeKind, InodeOwner, InodeUtimes};

const NSEC_PER_SEC: i128 = 1_000_000_000;
const NSEC_PER_MSEC: u32 = 1_000_000;

/// `a - b` as `(sec, nsec)` with `nsec` always in `[0, 1e9)`.
///
/// Seconds are widened so the difference of any two timestamps fits.
pub(crate) fn time_delta(a: Timespec, b: Timespec) -> (i128, u32) {
    let total = (i128::from(a.sec) - i128::from(b.sec)) * NSEC_PER_SEC
        + (i128::from(a.nsec) - i128::from(b.nsec));
    (
        total.div_euclid(NSEC_PER_SEC),
        total.rem_euclid(NSEC_PER_SEC) as u32,
    )
}

/// Append `.mmm` with trailing zeros (and a bare dot) trimmed.
fn with_millis(mut out: String, nsec: u32) -> String {
    out.push_str(&format!(".{:03}", nsec / NSEC_PER_MSEC));
    let trimmed = out.trim_end_matches('0').trim_end_matches('.').len();
    out.truncate(trimmed);
    out
}

pub(crate) fn repr_time_delta(sec: i128, nsec: u32) -> String {
    if sec < 0 {
        let (mut sec, mut nsec) = (-sec, nsec);
        if nsec > 0 {
            sec -= 1;
            nsec = NSEC_PER_SEC as u32 - nsec;
        }
        with_millis(format!("-{sec}"), nsec)
    } else {
        with_millis(format!("+{sec}"), nsec)
    }
}

pub(crate) fn repr_time(t: Timespec) -> String {
    let date = match DateTime::<Utc>::from_timestamp(t.sec, 0) {
        Some(dt) => dt.format("%y/%m/%d.%H:%M:%S").to_string(),
        None => t.sec.to_string(),
    };
    with_millis(date, t.nsec)
}

impl fmt::Display for InodeOwner {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.uid, self.gid)
    }
}

impl fmt::Display for InodeUtimes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let (c2m_sec, c2m_nsec) = time_delta(self.mtime, self.ctime);
        let (m2a_sec, m2a_nsec) = time_delta(self.atime, self.mtime);
        write!(
            f,
            "{}{}{}",
            repr_time(self.ctime),
            repr_time_delta(c2m_sec, c2m_nsec),
            repr_time_delta(m2a_sec, m2a_nsec)
        )
    }
}

impl fmt::Display for IncompleteInode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}", self.kind().name())?;
        if let Some(owner) = self.owner() {
            write!(f, " o{owner}")?;
        }
        if let Some(mode) = self.mode() {
            write!(f, " m{mode:o}")?;
        }
        if let Some(utimes) = self.utimes() {
            write!(f, " t{utimes}")?;
        }
        match self.kind() {
            InodeKind::File(extents) if !extents.is_empty() => {
                f.write_str(" ")?;
                for (data, len) in extents.runs() {
                    write!(f, "{}{}", if data { 'd' } else { 'h' }, len)?;
                }
            }
            InodeKind::Symlink { dest } => write!(f, " {}", dest.escape_ascii())?,
            InodeKind::Device { dev, .. } => write!(f, " {dev:x}")?,
            _ => {}
        }
        if let Some(attr) = self.fileattr() {
            write!(f, " a{attr:x}")?;
        }
        for (name, value) in self.xattrs() {
            write!(f, " x{}={}", name.escape_ascii(), value.escape_ascii())?;
        }
        f.write_str(")")
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use btrdiff_stream::{Command, DeviceNumber};

    use super::*;

    const T: u32 = 100_000_000;

    fn ts(sec: i64, nsec: u32) -> Timespec {
        Timespec::new(sec, nsec)
    }

    #[test]
    fn test_time_delta() {
        assert_eq!(time_delta(ts(0, 0), ts(0, 1)), (-1, 999_999_999));
        assert_eq!(time_delta(ts(0, 1), ts(0, 0)), (0, 1));
        assert_eq!(time_delta(ts(3, 0), ts(6, 1)), (-4, 999_999_999));
        assert_eq!(time_delta(ts(5, 4), ts(2, 2)), (3, 2));
    }

    #[test]
    fn test_repr_time_delta() {
        assert_eq!(repr_time_delta(-3, 0), "-3");
        assert_eq!(repr_time_delta(-4, 999_999_999), "-3");
        assert_eq!(repr_time_delta(-4, 999_000_000), "-3.001");
        assert_eq!(repr_time_delta(3, 0), "+3");
        assert_eq!(repr_time_delta(3, 1), "+3");
        assert_eq!(repr_time_delta(3, 1_000_000), "+3.001");
    }

    #[test]
    fn test_extreme_time_deltas() {
        assert_eq!(
            time_delta(ts(1, 0), ts(i64::MIN, 0)),
            (i128::from(i64::MAX) + 2, 0)
        );
        assert_eq!(
            time_delta(ts(i64::MIN, 0), ts(i64::MAX, 1)),
            (-(1i128 << 64), 999_999_999)
        );

        let utimes = InodeUtimes {
            ctime: ts(i64::MIN, 0),
            mtime: ts(1, 0),
            atime: ts(i64::MIN, 500_000_000),
        };
        let digest = utimes.to_string();
        assert!(
            digest.ends_with("+9223372036854775809-9223372036854775808.5"),
            "{digest}"
        );

        let utimes = InodeUtimes {
            ctime: ts(i64::MAX, 999_999_999),
            mtime: ts(i64::MIN, 0),
            atime: ts(i64::MAX, 0),
        };
        assert!(utimes
            .to_string()
            .ends_with("-18446744073709551615.999+18446744073709551615"));
    }

    #[test]
    fn test_repr_time() {
        assert_eq!(repr_time(ts(12345678, 910111213)), "70/05/23.21:21:18.91");
    }

    #[test]
    fn test_repr_utimes() {
        let utimes = InodeUtimes {
            ctime: ts(12345678, 1_000_000),
            mtime: ts(12345678 + 7230, 11_000_000),
            atime: ts(12345678 + 7230 - 3611, 411_000_000),
        };
        assert_eq!(utimes.to_string(), "70/05/23.21:21:18.001+7230.01-3610.6");
    }

    #[test]
    fn test_full_file_digest() {
        let path = || b"a".to_vec();
        let mut ino = IncompleteInode::from_command(&Command::Mkfile { path: path() }).unwrap();
        assert_eq!(ino.to_string(), "(File)");
        for cmd in [
            Command::Truncate {
                path: path(),
                size: 17,
            },
            Command::Write {
                path: path(),
                offset: 10,
                data: Arc::from(vec![b'x'; 15]),
            },
            Command::UpdateExtent {
                path: path(),
                offset: 40,
                len: 5,
            },
            Command::Chmod {
                path: path(),
                mode: 0o4733,
            },
            Command::Chown {
                path: path(),
                uid: 10,
                gid: 20,
            },
            Command::Utimes {
                path: path(),
                ctime: ts(1, 9 * T),
                mtime: ts(2, 8 * T),
                atime: ts(1, 7 * T),
            },
        ] {
            ino.apply(&cmd).unwrap();
        }
        assert_eq!(
            ino.to_string(),
            "(File o10:20 m4733 t70/01/01.00:00:01.9+0.9-1.1 h10d15h15d5)"
        );
    }

    #[test]
    fn test_simple_digests() {
        let digest = |cmd: Command| IncompleteInode::from_command(&cmd).unwrap().to_string();
        assert_eq!(digest(Command::Mkdir { path: b"a".to_vec() }), "(Dir)");
        assert_eq!(digest(Command::Mkfifo { path: b"a".to_vec() }), "(FIFO)");
        assert_eq!(digest(Command::Mksock { path: b"a".to_vec() }), "(Sock)");
        assert_eq!(
            digest(Command::Mknod {
                path: b"chr".to_vec(),
                mode: 0o20711,
                dev: DeviceNumber(0x123),
            }),
            "(Char m711 123)"
        );
        assert_eq!(
            digest(Command::Mknod {
                path: b"blk".to_vec(),
                mode: 0o60544,
                dev: DeviceNumber(0x345),
            }),
            "(Block m544 345)"
        );
    }

    #[test]
    fn test_symlink_and_xattr_digest() {
        let mut ino = IncompleteInode::from_command(&Command::Symlink {
            path: b"l".to_vec(),
            dest: b"cat".to_vec(),
        })
        .unwrap();
        ino.apply(&Command::Chown {
            path: b"l".to_vec(),
            uid: 1,
            gid: 2,
        })
        .unwrap();
        assert_eq!(ino.to_string(), "(Symlink o1:2 cat)");

        ino.apply(&Command::SetXattr {
            path: b"l".to_vec(),
            name: b"user.b".to_vec(),
            data: b"two words\n".to_vec(),
        })
        .unwrap();
        ino.apply(&Command::SetXattr {
            path: b"l".to_vec(),
            name: b"user.a".to_vec(),
            data: b"1".to_vec(),
        })
        .unwrap();
        ino.apply(&Command::Fileattr {
            path: b"l".to_vec(),
            attr: 0x10,
        })
        .unwrap();
        assert_eq!(
            ino.to_string(),
            "(Symlink o1:2 cat a10 xuser.a=1 xuser.b=two words\\n)"
        );
    }

    #[test]
    fn test_digest_is_history_independent() {
        let path = || b"f".to_vec();
        let write = |offset, s: &str| Command::Write {
            path: path(),
            offset,
            data: Arc::from(s.as_bytes()),
        };
        let chown = Command::Chown {
            path: path(),
            uid: 0,
            gid: 0,
        };
        let mut one = IncompleteInode::from_command(&Command::Mkfile { path: path() }).unwrap();
        for cmd in [write(0, "abcdef"), chown.clone(), write(8, "gh")] {
            one.apply(&cmd).unwrap();
        }
        let mut two = IncompleteInode::from_command(&Command::Mkfile { path: path() }).unwrap();
        for cmd in [write(8, "gh"), write(0, "abc"), write(3, "def"), chown] {
            two.apply(&cmd).unwrap();
        }
        assert_eq!(one.to_string(), "(File o0:0 d6h2d2)");
        assert_eq!(one.to_string(), two.to_string());
    }
}
