//! Fixture encoder producing bit-exact send-stream bytes.
//!
//! Only built for tests and under the `testing` feature, so that downstream
//! crates can replay realistic streams without shipping golden binaries.

use crate::command::{Command, Timespec};
use crate::decoder::SEND_STREAM_MAGIC;
use crate::table::{AttributeType as A, CommandType};
use crate::wire::{command_crc, CMD_HEADER_LEN};

/// Builds a send-stream in memory, one record at a time.
#[derive(Debug, Clone)]
pub struct StreamBuilder {
    version: u32,
    bytes: Vec<u8>,
}

impl StreamBuilder {
    pub fn new(version: u32) -> Self {
        let mut bytes = SEND_STREAM_MAGIC.to_vec();
        bytes.extend_from_slice(&version.to_le_bytes());
        Self { version, bytes }
    }

    /// Append a record with arbitrary attributes, bypassing validation.
    pub fn raw(mut self, code: u16, attrs: &[(u16, &[u8])]) -> Self {
        let mut payload = Vec::new();
        for (attr, value) in attrs {
            payload.extend_from_slice(&attr.to_le_bytes());
            payload.extend_from_slice(&(value.len() as u16).to_le_bytes());
            payload.extend_from_slice(value);
        }
        self.push_record(code, &payload);
        self
    }

    /// Append the encoding of `command`.
    pub fn command(mut self, command: &Command) -> Self {
        let (cmd, payload) = encode(self.version, command);
        self.push_record(cmd.code(), &payload);
        self
    }

    pub fn commands<'a>(self, commands: impl IntoIterator<Item = &'a Command>) -> Self {
        commands.into_iter().fold(self, |b, c| b.command(c))
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }

    fn push_record(&mut self, code: u16, payload: &[u8]) {
        let mut header = [0u8; CMD_HEADER_LEN];
        header[0..4].copy_from_slice(&(payload.len() as u32).to_le_bytes());
        header[4..6].copy_from_slice(&code.to_le_bytes());
        let crc = command_crc(&header, payload);
        header[6..10].copy_from_slice(&crc.to_le_bytes());
        self.bytes.extend_from_slice(&header);
        self.bytes.extend_from_slice(payload);
    }
}

struct Payload {
    version: u32,
    bytes: Vec<u8>,
}

impl Payload {
    fn put(&mut self, attr: A, value: &[u8]) -> &mut Self {
        self.bytes.extend_from_slice(&attr.code().to_le_bytes());
        if !(self.version >= 2 && attr == A::Data) {
            self.bytes
                .extend_from_slice(&(value.len() as u16).to_le_bytes());
        }
        self.bytes.extend_from_slice(value);
        self
    }

    fn u64(&mut self, attr: A, value: u64) -> &mut Self {
        self.put(attr, &value.to_le_bytes())
    }

    fn u32(&mut self, attr: A, value: u32) -> &mut Self {
        self.put(attr, &value.to_le_bytes())
    }

    fn time(&mut self, attr: A, ts: Timespec) -> &mut Self {
        let mut raw = ts.sec.to_le_bytes().to_vec();
        raw.extend_from_slice(&ts.nsec.to_le_bytes());
        self.put(attr, &raw)
    }
}

fn encode(version: u32, command: &Command) -> (CommandType, Vec<u8>) {
    let mut p = Payload {
        version,
        bytes: Vec::new(),
    };
    let cmd = match command {
        Command::Subvol {
            path,
            uuid,
            ctransid,
        } => {
            p.put(A::Path, path)
                .put(A::Uuid, uuid.as_bytes())
                .u64(A::Ctransid, *ctransid);
            CommandType::Subvol
        }
        Command::Snapshot {
            path,
            uuid,
            ctransid,
            parent_uuid,
            parent_ctransid,
        } => {
            p.put(A::Path, path)
                .put(A::Uuid, uuid.as_bytes())
                .u64(A::Ctransid, *ctransid)
                .put(A::CloneUuid, parent_uuid.as_bytes())
                .u64(A::CloneCtransid, *parent_ctransid);
            CommandType::Snapshot
        }
        Command::Mkfile { path } => {
            p.put(A::Path, path);
            CommandType::Mkfile
        }
        Command::Mkdir { path } => {
            p.put(A::Path, path);
            CommandType::Mkdir
        }
        Command::Mkfifo { path } => {
            p.put(A::Path, path);
            CommandType::Mkfifo
        }
        Command::Mksock { path } => {
            p.put(A::Path, path);
            CommandType::Mksock
        }
        Command::Mknod { path, mode, dev } => {
            p.put(A::Path, path)
                .u64(A::Mode, u64::from(*mode))
                .u64(A::Rdev, dev.0);
            CommandType::Mknod
        }
        Command::Symlink { path, dest } => {
            p.put(A::Path, path).put(A::PathLink, dest);
            CommandType::Symlink
        }
        Command::Rename { from, to } => {
            p.put(A::Path, from).put(A::PathTo, to);
            CommandType::Rename
        }
        Command::Link { path, dest } => {
            p.put(A::Path, dest).put(A::PathLink, path);
            CommandType::Link
        }
        Command::Unlink { path } => {
            p.put(A::Path, path);
            CommandType::Unlink
        }
        Command::Rmdir { path } => {
            p.put(A::Path, path);
            CommandType::Rmdir
        }
        Command::Write { path, offset, data } => {
            p.put(A::Path, path)
                .u64(A::FileOffset, *offset)
                .put(A::Data, data);
            CommandType::Write
        }
        Command::Clone {
            path,
            offset,
            len,
            from_uuid,
            from_ctransid,
            from_path,
            from_offset,
        } => {
            p.put(A::Path, path)
                .u64(A::FileOffset, *offset)
                .u64(A::CloneLen, *len)
                .put(A::CloneUuid, from_uuid.as_bytes())
                .u64(A::CloneCtransid, *from_ctransid)
                .put(A::ClonePath, from_path)
                .u64(A::CloneOffset, *from_offset);
            CommandType::Clone
        }
        Command::UpdateExtent { path, offset, len } => {
            p.put(A::Path, path)
                .u64(A::FileOffset, *offset)
                .u64(A::Size, *len);
            CommandType::UpdateExtent
        }
        Command::SetXattr { path, name, data } => {
            p.put(A::Path, path)
                .put(A::XattrName, name)
                .put(A::XattrData, data);
            CommandType::SetXattr
        }
        Command::RemoveXattr { path, name } => {
            p.put(A::Path, path).put(A::XattrName, name);
            CommandType::RemoveXattr
        }
        Command::Truncate { path, size } => {
            p.put(A::Path, path).u64(A::Size, *size);
            CommandType::Truncate
        }
        Command::Chmod { path, mode } => {
            p.put(A::Path, path).u64(A::Mode, u64::from(*mode));
            CommandType::Chmod
        }
        Command::Chown { path, uid, gid } => {
            p.put(A::Path, path).u64(A::Uid, *uid).u64(A::Gid, *gid);
            CommandType::Chown
        }
        Command::Utimes {
            path,
            atime,
            mtime,
            ctime,
        } => {
            p.put(A::Path, path)
                .time(A::Atime, *atime)
                .time(A::Mtime, *mtime)
                .time(A::Ctime, *ctime);
            CommandType::Utimes
        }
        Command::Fallocate {
            path,
            mode,
            offset,
            len,
        } => {
            p.put(A::Path, path)
                .u32(A::FallocateMode, *mode)
                .u64(A::FileOffset, *offset)
                .u64(A::Size, *len);
            CommandType::Fallocate
        }
        Command::Fileattr { path, attr } => {
            p.put(A::Path, path).u64(A::Fileattr, *attr);
            CommandType::Fileattr
        }
        Command::EncodedWrite {
            path,
            offset,
            unencoded_file_len,
            unencoded_len,
            unencoded_offset,
            compression,
            encryption,
            data,
        } => {
            p.put(A::Path, path)
                .u64(A::FileOffset, *offset)
                .u64(A::UnencodedFileLen, *unencoded_file_len)
                .u64(A::UnencodedLen, *unencoded_len)
                .u64(A::UnencodedOffset, *unencoded_offset)
                .u32(A::Compression, *compression)
                .u32(A::Encryption, *encryption)
                .put(A::Data, data);
            CommandType::EncodedWrite
        }
        Command::End => CommandType::End,
    };
    (cmd, p.bytes)
}
