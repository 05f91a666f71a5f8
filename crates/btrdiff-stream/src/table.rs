//! Command and attribute codes, and the pure record-to-[`Command`] decoder.
//!
//! Everything here is static data plus stateless functions. The decoder in
//! [`crate::decoder`] handles framing and checksums, then hands each record's
//! attribute list to [`decode_command`].

use std::fmt;
use std::sync::Arc;

use uuid::Uuid;

use crate::command::{Command, DeviceNumber, Timespec};
use crate::wire::{read_le_u32, read_le_u64};
use crate::ProtocolError;

macro_rules! wire_codes {
    (
        $(#[$meta:meta])*
        pub enum $name:ident { $($variant:ident = $code:literal => $label:literal),+ $(,)? }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        #[repr(u16)]
        pub enum $name {
            $($variant = $code),+
        }

        impl $name {
            pub const ALL: &'static [$name] = &[$($name::$variant),+];

            pub fn code(self) -> u16 {
                self as u16
            }

            pub fn name(self) -> &'static str {
                match self {
                    $($name::$variant => $label),+
                }
            }
        }

        impl TryFrom<u16> for $name {
            type Error = u16;

            fn try_from(code: u16) -> Result<Self, u16> {
                match code {
                    $($code => Ok($name::$variant),)+
                    other => Err(other),
                }
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(self.name())
            }
        }
    };
}

wire_codes! {
    /// `btrfs_send_cmd` codes.
    pub enum CommandType {
        Subvol = 1 => "subvol",
        Snapshot = 2 => "snapshot",
        Mkfile = 3 => "mkfile",
        Mkdir = 4 => "mkdir",
        Mknod = 5 => "mknod",
        Mkfifo = 6 => "mkfifo",
        Mksock = 7 => "mksock",
        Symlink = 8 => "symlink",
        Rename = 9 => "rename",
        Link = 10 => "link",
        Unlink = 11 => "unlink",
        Rmdir = 12 => "rmdir",
        SetXattr = 13 => "set_xattr",
        RemoveXattr = 14 => "remove_xattr",
        Write = 15 => "write",
        Clone = 16 => "clone",
        Truncate = 17 => "truncate",
        Chmod = 18 => "chmod",
        Chown = 19 => "chown",
        Utimes = 20 => "utimes",
        End = 21 => "end",
        UpdateExtent = 22 => "update_extent",
        Fallocate = 23 => "fallocate",
        Fileattr = 24 => "fileattr",
        EncodedWrite = 25 => "encoded_write",
        EnableVerity = 26 => "enable_verity",
    }
}

wire_codes! {
    /// `btrfs_send_attr` codes.
    pub enum AttributeType {
        Uuid = 1 => "uuid",
        Ctransid = 2 => "ctransid",
        Ino = 3 => "ino",
        Size = 4 => "size",
        Mode = 5 => "mode",
        Uid = 6 => "uid",
        Gid = 7 => "gid",
        Rdev = 8 => "rdev",
        Ctime = 9 => "ctime",
        Mtime = 10 => "mtime",
        Atime = 11 => "atime",
        Otime = 12 => "otime",
        XattrName = 13 => "xattr_name",
        XattrData = 14 => "xattr_data",
        Path = 15 => "path",
        PathTo = 16 => "path_to",
        PathLink = 17 => "path_link",
        FileOffset = 18 => "file_offset",
        Data = 19 => "data",
        CloneUuid = 20 => "clone_uuid",
        CloneCtransid = 21 => "clone_ctransid",
        ClonePath = 22 => "clone_path",
        CloneOffset = 23 => "clone_offset",
        CloneLen = 24 => "clone_len",
        FallocateMode = 25 => "fallocate_mode",
        Fileattr = 26 => "fileattr",
        UnencodedFileLen = 27 => "unencoded_file_len",
        UnencodedLen = 28 => "unencoded_len",
        UnencodedOffset = 29 => "unencoded_offset",
        Compression = 30 => "compression",
        Encryption = 31 => "encryption",
    }
}

impl CommandType {
    /// Stream version that introduced this command.
    pub fn min_version(self) -> u32 {
        match self {
            Self::Fallocate | Self::Fileattr | Self::EncodedWrite => 2,
            Self::EnableVerity => 3,
            _ => 1,
        }
    }
}

/// Highest stream version this crate decodes.
pub const MAX_SUPPORTED_VERSION: u32 = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Presence {
    Required,
    Optional,
}

use AttributeType as A;
use Presence::{Optional, Required};

/// Attributes a command may carry, and which of them it must carry.
fn attribute_specs(cmd: CommandType) -> &'static [(AttributeType, Presence)] {
    match cmd {
        CommandType::Subvol => &[
            (A::Path, Required),
            (A::Uuid, Required),
            (A::Ctransid, Required),
        ],
        CommandType::Snapshot => &[
            (A::Path, Required),
            (A::Uuid, Required),
            (A::Ctransid, Required),
            (A::CloneUuid, Required),
            (A::CloneCtransid, Required),
        ],
        CommandType::Mkfile | CommandType::Mkdir | CommandType::Mkfifo | CommandType::Mksock => {
            &[(A::Path, Required), (A::Ino, Optional)]
        }
        CommandType::Mknod => &[
            (A::Path, Required),
            (A::Ino, Optional),
            (A::Mode, Required),
            (A::Rdev, Required),
        ],
        CommandType::Symlink => &[
            (A::Path, Required),
            (A::Ino, Optional),
            (A::PathLink, Required),
        ],
        CommandType::Rename => &[(A::Path, Required), (A::PathTo, Required)],
        CommandType::Link => &[(A::Path, Required), (A::PathLink, Required)],
        CommandType::Unlink | CommandType::Rmdir => &[(A::Path, Required)],
        CommandType::SetXattr => &[
            (A::Path, Required),
            (A::XattrName, Required),
            (A::XattrData, Required),
        ],
        CommandType::RemoveXattr => &[(A::Path, Required), (A::XattrName, Required)],
        CommandType::Write => &[
            (A::Path, Required),
            (A::FileOffset, Required),
            (A::Data, Required),
        ],
        CommandType::Clone => &[
            (A::Path, Required),
            (A::FileOffset, Required),
            (A::CloneLen, Required),
            (A::CloneUuid, Required),
            (A::CloneCtransid, Required),
            (A::ClonePath, Required),
            (A::CloneOffset, Required),
        ],
        CommandType::Truncate => &[(A::Path, Required), (A::Size, Required)],
        CommandType::Chmod => &[(A::Path, Required), (A::Mode, Required)],
        CommandType::Chown => &[(A::Path, Required), (A::Uid, Required), (A::Gid, Required)],
        CommandType::Utimes => &[
            (A::Path, Required),
            (A::Atime, Required),
            (A::Mtime, Required),
            (A::Ctime, Required),
            (A::Otime, Optional),
        ],
        CommandType::End => &[],
        CommandType::UpdateExtent => &[
            (A::Path, Required),
            (A::FileOffset, Required),
            (A::Size, Required),
        ],
        CommandType::Fallocate => &[
            (A::Path, Required),
            (A::FallocateMode, Required),
            (A::FileOffset, Required),
            (A::Size, Required),
        ],
        CommandType::Fileattr => &[(A::Path, Required), (A::Fileattr, Required)],
        CommandType::EncodedWrite => &[
            (A::Path, Required),
            (A::FileOffset, Required),
            (A::UnencodedFileLen, Required),
            (A::UnencodedLen, Required),
            (A::UnencodedOffset, Required),
            (A::Compression, Required),
            (A::Encryption, Optional),
            (A::Data, Required),
        ],
        CommandType::EnableVerity => &[(A::Path, Required)],
    }
}

/// Which attributes `cmd` may carry, for callers that encode records.
pub fn allowed_attributes(cmd: CommandType) -> impl Iterator<Item = AttributeType> {
    attribute_specs(cmd).iter().map(|(attr, _)| *attr)
}

const ATTR_SLOTS: usize = 32;

/// Attribute values of one record, validated against the command's attribute table.
struct Attrs<'a> {
    cmd: CommandType,
    slots: [Option<&'a [u8]>; ATTR_SLOTS],
}

impl<'a> Attrs<'a> {
    fn collect(cmd: CommandType, raw: &[(u16, &'a [u8])]) -> Result<Self, ProtocolError> {
        let specs = attribute_specs(cmd);
        let mut slots = [None; ATTR_SLOTS];
        for &(code, value) in raw {
            let attr = AttributeType::try_from(code)
                .map_err(|code| ProtocolError::UnknownAttribute { command: cmd, code })?;
            if !specs.iter().any(|(a, _)| *a == attr) {
                return Err(ProtocolError::UnexpectedAttribute { command: cmd, attr });
            }
            let slot = &mut slots[usize::from(attr.code())];
            if slot.is_some() {
                return Err(ProtocolError::DuplicateAttribute { command: cmd, attr });
            }
            *slot = Some(value);
        }
        for &(attr, presence) in specs {
            if presence == Required && slots[usize::from(attr.code())].is_none() {
                return Err(ProtocolError::MissingAttribute { command: cmd, attr });
            }
        }
        Ok(Self { cmd, slots })
    }

    fn get(&self, attr: AttributeType) -> Option<&'a [u8]> {
        self.slots[usize::from(attr.code())]
    }

    fn bytes(&self, attr: AttributeType) -> Result<&'a [u8], ProtocolError> {
        self.get(attr).ok_or(ProtocolError::MissingAttribute {
            command: self.cmd,
            attr,
        })
    }

    fn fixed(&self, attr: AttributeType, width: usize) -> Result<&'a [u8], ProtocolError> {
        let value = self.bytes(attr)?;
        if value.len() != width {
            return Err(ProtocolError::BadAttributeLength {
                command: self.cmd,
                attr,
                expected: width,
                actual: value.len(),
            });
        }
        Ok(value)
    }

    fn path(&self, attr: AttributeType) -> Result<Vec<u8>, ProtocolError> {
        self.bytes(attr).map(<[u8]>::to_vec)
    }

    fn u64(&self, attr: AttributeType) -> Result<u64, ProtocolError> {
        read_le_u64(self.fixed(attr, 8)?, 0, attr.name())
    }

    fn u32(&self, attr: AttributeType) -> Result<u32, ProtocolError> {
        read_le_u32(self.fixed(attr, 4)?, 0, attr.name())
    }

    fn opt_u32(&self, attr: AttributeType) -> Result<u32, ProtocolError> {
        match self.get(attr) {
            Some(_) => self.u32(attr),
            None => Ok(0),
        }
    }

    /// A u64 on the wire that must fit a u32 field.
    fn narrow_u32(&self, attr: AttributeType) -> Result<u32, ProtocolError> {
        let value = self.u64(attr)?;
        u32::try_from(value).map_err(|_| ProtocolError::ValueOutOfRange {
            command: self.cmd,
            attr,
            value,
        })
    }

    fn timespec(&self, attr: AttributeType) -> Result<Timespec, ProtocolError> {
        let raw = self.fixed(attr, 12)?;
        let sec = read_le_u64(raw, 0, attr.name())? as i64;
        let nsec = read_le_u32(raw, 8, attr.name())?;
        if nsec >= 1_000_000_000 {
            return Err(ProtocolError::ValueOutOfRange {
                command: self.cmd,
                attr,
                value: u64::from(nsec),
            });
        }
        Ok(Timespec { sec, nsec })
    }

    fn uuid(&self, attr: AttributeType) -> Result<Uuid, ProtocolError> {
        let raw = self.fixed(attr, 16)?;
        let mut bytes = [0u8; 16];
        bytes.copy_from_slice(raw);
        Ok(Uuid::from_bytes(bytes))
    }

    fn data(&self) -> Result<Arc<[u8]>, ProtocolError> {
        self.bytes(A::Data).map(Arc::from)
    }
}

/// Decode one record's attribute list into a typed [`Command`].
///
/// `attrs` holds `(attribute code, raw value)` pairs in wire order.
pub fn decode_command(
    version: u32,
    code: u16,
    attrs: &[(u16, &[u8])],
) -> Result<Command, ProtocolError> {
    let cmd = CommandType::try_from(code).map_err(ProtocolError::UnknownCommand)?;
    if cmd.min_version() > version {
        return Err(ProtocolError::UnsupportedCommand {
            command: cmd,
            required: cmd.min_version(),
            version,
        });
    }
    let a = Attrs::collect(cmd, attrs)?;

    let command = match cmd {
        CommandType::Subvol => Command::Subvol {
            path: a.path(A::Path)?,
            uuid: a.uuid(A::Uuid)?,
            ctransid: a.u64(A::Ctransid)?,
        },
        CommandType::Snapshot => Command::Snapshot {
            path: a.path(A::Path)?,
            uuid: a.uuid(A::Uuid)?,
            ctransid: a.u64(A::Ctransid)?,
            parent_uuid: a.uuid(A::CloneUuid)?,
            parent_ctransid: a.u64(A::CloneCtransid)?,
        },
        CommandType::Mkfile => Command::Mkfile {
            path: a.path(A::Path)?,
        },
        CommandType::Mkdir => Command::Mkdir {
            path: a.path(A::Path)?,
        },
        CommandType::Mkfifo => Command::Mkfifo {
            path: a.path(A::Path)?,
        },
        CommandType::Mksock => Command::Mksock {
            path: a.path(A::Path)?,
        },
        CommandType::Mknod => Command::Mknod {
            path: a.path(A::Path)?,
            mode: a.narrow_u32(A::Mode)?,
            dev: DeviceNumber(a.u64(A::Rdev)?),
        },
        CommandType::Symlink => Command::Symlink {
            path: a.path(A::Path)?,
            dest: a.path(A::PathLink)?,
        },
        CommandType::Rename => Command::Rename {
            from: a.path(A::Path)?,
            to: a.path(A::PathTo)?,
        },
        // On the wire PATH is the new name and PATH_LINK the existing one.
        CommandType::Link => Command::Link {
            path: a.path(A::PathLink)?,
            dest: a.path(A::Path)?,
        },
        CommandType::Unlink => Command::Unlink {
            path: a.path(A::Path)?,
        },
        CommandType::Rmdir => Command::Rmdir {
            path: a.path(A::Path)?,
        },
        CommandType::SetXattr => Command::SetXattr {
            path: a.path(A::Path)?,
            name: a.path(A::XattrName)?,
            data: a.path(A::XattrData)?,
        },
        CommandType::RemoveXattr => Command::RemoveXattr {
            path: a.path(A::Path)?,
            name: a.path(A::XattrName)?,
        },
        CommandType::Write => Command::Write {
            path: a.path(A::Path)?,
            offset: a.u64(A::FileOffset)?,
            data: a.data()?,
        },
        CommandType::Clone => Command::Clone {
            path: a.path(A::Path)?,
            offset: a.u64(A::FileOffset)?,
            len: a.u64(A::CloneLen)?,
            from_uuid: a.uuid(A::CloneUuid)?,
            from_ctransid: a.u64(A::CloneCtransid)?,
            from_path: a.path(A::ClonePath)?,
            from_offset: a.u64(A::CloneOffset)?,
        },
        CommandType::Truncate => Command::Truncate {
            path: a.path(A::Path)?,
            size: a.u64(A::Size)?,
        },
        CommandType::Chmod => Command::Chmod {
            path: a.path(A::Path)?,
            mode: a.narrow_u32(A::Mode)?,
        },
        CommandType::Chown => Command::Chown {
            path: a.path(A::Path)?,
            uid: a.u64(A::Uid)?,
            gid: a.u64(A::Gid)?,
        },
        CommandType::Utimes => Command::Utimes {
            path: a.path(A::Path)?,
            atime: a.timespec(A::Atime)?,
            mtime: a.timespec(A::Mtime)?,
            ctime: a.timespec(A::Ctime)?,
        },
        CommandType::End => Command::End,
        CommandType::UpdateExtent => Command::UpdateExtent {
            path: a.path(A::Path)?,
            offset: a.u64(A::FileOffset)?,
            len: a.u64(A::Size)?,
        },
        CommandType::Fallocate => Command::Fallocate {
            path: a.path(A::Path)?,
            mode: a.u32(A::FallocateMode)?,
            offset: a.u64(A::FileOffset)?,
            len: a.u64(A::Size)?,
        },
        CommandType::Fileattr => Command::Fileattr {
            path: a.path(A::Path)?,
            attr: a.u64(A::Fileattr)?,
        },
        CommandType::EncodedWrite => Command::EncodedWrite {
            path: a.path(A::Path)?,
            offset: a.u64(A::FileOffset)?,
            unencoded_file_len: a.u64(A::UnencodedFileLen)?,
            unencoded_len: a.u64(A::UnencodedLen)?,
            unencoded_offset: a.u64(A::UnencodedOffset)?,
            compression: a.u32(A::Compression)?,
            encryption: a.opt_u32(A::Encryption)?,
            data: a.data()?,
        },
        // Gated by `min_version` above; no supported stream reaches here.
        CommandType::EnableVerity => {
            return Err(ProtocolError::UnsupportedCommand {
                command: cmd,
                required: cmd.min_version(),
                version,
            })
        }
    };
    Ok(command)
}
