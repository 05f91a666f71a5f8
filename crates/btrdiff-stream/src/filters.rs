//! Iterator adapters that make decoded streams reproducible for comparison.
//!
//! All adapters take fallible items so they can sit directly on top of a
//! [`crate::StreamDecoder`]; errors pass through untouched.

use std::collections::HashMap;

use crate::command::{Command, Timespec};

/// Name of the xattr holding SELinux security labels.
pub const SELINUX_XATTR: &[u8] = b"security.selinux";

/// Drop `set_xattr` items for `name` when `discard(path, value)` is true.
pub fn drop_xattrs<I, E, F>(
    items: I,
    name: impl Into<Vec<u8>>,
    mut discard: F,
) -> impl Iterator<Item = Result<Command, E>>
where
    I: IntoIterator<Item = Result<Command, E>>,
    F: FnMut(&[u8], &[u8]) -> bool,
{
    let name = name.into();
    items.into_iter().filter(move |item| match item {
        Ok(Command::SetXattr {
            path,
            name: xattr,
            data,
        }) if *xattr == name => !discard(path.as_slice(), data.as_slice()),
        _ => true,
    })
}

/// Drop SELinux labels whose value is in `values`, or all of them when
/// `values` is empty.
pub fn drop_selinux_xattrs<I, E>(
    items: I,
    values: Vec<Vec<u8>>,
) -> impl Iterator<Item = Result<Command, E>>
where
    I: IntoIterator<Item = Result<Command, E>>,
{
    drop_xattrs(items, SELINUX_XATTR, move |_path, value| {
        values.is_empty() || values.iter().any(|v| v.as_slice() == value)
    })
}

/// Replace every `utimes` timestamp inside `[start, end]` with `start`.
///
/// Build-time timestamps vary from run to run; collapsing the build window
/// makes digests of two builds comparable.
pub fn normalize_utimes<I, E>(
    items: I,
    start: Timespec,
    end: Timespec,
) -> impl Iterator<Item = Result<Command, E>>
where
    I: IntoIterator<Item = Result<Command, E>>,
{
    let clamp = move |t: Timespec| if start <= t && t <= end { start } else { t };
    items.into_iter().map(move |item| match item {
        Ok(Command::Utimes {
            path,
            atime,
            mtime,
            ctime,
        }) => Ok(Command::Utimes {
            path,
            atime: clamp(atime),
            mtime: clamp(mtime),
            ctime: clamp(ctime),
        }),
        other => other,
    })
}

/// Count how often each value is set for the xattr `name`.
///
/// Useful for picking the default SELinux label to drop.
pub fn xattr_value_frequency<'a, I>(items: I, name: &[u8]) -> HashMap<Vec<u8>, usize>
where
    I: IntoIterator<Item = &'a Command>,
{
    let mut counts = HashMap::new();
    for item in items {
        if let Command::SetXattr {
            name: xattr, data, ..
        } = item
        {
            if xattr.as_slice() == name {
                *counts.entry(data.clone()).or_insert(0) += 1;
            }
        }
    }
    counts
}
