//! Framing, checksum verification and the lazy command iterator.

use std::io::Read;

use tracing::{debug, instrument, trace};

use crate::command::Command;
use crate::table::{decode_command, AttributeType, MAX_SUPPORTED_VERSION};
use crate::wire::{command_crc, read_full, read_le_u16, read_le_u32, CMD_HEADER_LEN};
use crate::{ProtocolError, Result};

/// Magic bytes at the start of every send-stream, NUL included.
pub const SEND_STREAM_MAGIC: &[u8; 13] = b"btrfs-stream\0";

/// Largest record payload accepted unless configured otherwise.
///
/// The kernel never emits records above 64 KiB for v1 and a few MiB for v2
/// encoded writes; anything larger is treated as corruption.
pub const DEFAULT_MAX_COMMAND_LEN: u32 = 16 * 1024 * 1024;

const STREAM_HEADER_LEN: usize = SEND_STREAM_MAGIC.len() + 4;
const TLV_HEADER_LEN: usize = 4;

/// Lazily decodes commands from a send-stream byte source.
///
/// The decoder yields `End` exactly once and then `None`. After an error it
/// also yields `None`, since framing cannot be recovered. Bytes after the
/// `End` record are left unread in the underlying reader.
pub struct StreamDecoder<R> {
    reader: R,
    version: u32,
    position: u64,
    max_command_len: u32,
    done: bool,
}

impl<R: Read> StreamDecoder<R> {
    /// Read and validate the stream header.
    #[instrument(skip(reader), level = "debug")]
    pub fn new(mut reader: R) -> Result<Self> {
        let mut header = [0u8; STREAM_HEADER_LEN];
        let got = read_full(&mut reader, &mut header)?;
        let magic = &header[..SEND_STREAM_MAGIC.len()];
        if got < SEND_STREAM_MAGIC.len() || magic != SEND_STREAM_MAGIC {
            return Err(ProtocolError::BadMagic {
                found: header[..got.min(SEND_STREAM_MAGIC.len())].to_vec(),
            }
            .into());
        }
        if got < STREAM_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                what: "stream header",
                needed: STREAM_HEADER_LEN,
                actual: got,
            }
            .into());
        }
        let version = read_le_u32(&header, SEND_STREAM_MAGIC.len(), "stream version")?;
        if version == 0 || version > MAX_SUPPORTED_VERSION {
            return Err(ProtocolError::UnsupportedVersion(version).into());
        }
        debug!(component = "DECODE", version, "send-stream header accepted");
        Ok(Self {
            reader,
            version,
            position: 0,
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
            done: false,
        })
    }

    /// Reject records whose payload exceeds `limit` bytes.
    pub fn with_max_command_len(mut self, limit: u32) -> Self {
        self.max_command_len = limit;
        self
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Index of the next command to be yielded.
    pub fn position(&self) -> u64 {
        self.position
    }

    /// True once `End` has been yielded or an error has ended decoding.
    pub fn is_finished(&self) -> bool {
        self.done
    }

    /// Give back the reader, positioned just past the last consumed record.
    pub fn into_inner(self) -> R {
        self.reader
    }

    fn read_command(&mut self) -> Result<Command> {
        let mut header = [0u8; CMD_HEADER_LEN];
        let got = read_full(&mut self.reader, &mut header)?;
        if got == 0 {
            return Err(ProtocolError::MissingEnd.into());
        }
        if got < CMD_HEADER_LEN {
            return Err(ProtocolError::Truncated {
                what: "command header",
                needed: CMD_HEADER_LEN,
                actual: got,
            }
            .into());
        }
        let len = read_le_u32(&header, 0, "command length")?;
        let code = read_le_u16(&header, 4, "command type")?;
        let expected = read_le_u32(&header, 6, "command crc")?;
        if len > self.max_command_len {
            return Err(ProtocolError::OversizedCommand {
                len,
                limit: self.max_command_len,
            }
            .into());
        }

        let mut payload = vec![0u8; len as usize];
        let got = read_full(&mut self.reader, &mut payload)?;
        if got < payload.len() {
            return Err(ProtocolError::Truncated {
                what: "command payload",
                needed: payload.len(),
                actual: got,
            }
            .into());
        }

        let actual = command_crc(&header, &payload);
        if actual != expected {
            return Err(ProtocolError::ChecksumMismatch {
                command: code,
                expected,
                actual,
            }
            .into());
        }

        let attrs = split_attributes(self.version, &payload)?;
        trace!(code, len, attrs = attrs.len(), "record");
        Ok(decode_command(self.version, code, &attrs)?)
    }
}

/// Split a record payload into `(type, value)` pairs.
///
/// From version 2 on, `DATA` carries no length and extends to the end of the
/// payload, so it must be the last attribute.
fn split_attributes(
    version: u32,
    payload: &[u8],
) -> std::result::Result<Vec<(u16, &[u8])>, ProtocolError> {
    let mut attrs = Vec::new();
    let mut offset = 0;
    while offset < payload.len() {
        let code = read_le_u16(payload, offset, "attribute header")?;
        if version >= 2 && code == AttributeType::Data.code() {
            attrs.push((code, &payload[offset + 2..]));
            break;
        }
        let len = usize::from(read_le_u16(payload, offset + 2, "attribute header")?);
        let start = offset + TLV_HEADER_LEN;
        let value = crate::wire::ensure_slice(payload, start, len, "attribute")?;
        attrs.push((code, value));
        offset = start + len;
    }
    Ok(attrs)
}

impl<R: Read> Iterator for StreamDecoder<R> {
    type Item = Result<Command>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.read_command() {
            Ok(command) => {
                self.position += 1;
                if matches!(command, Command::End) {
                    debug!(
                        component = "DECODE",
                        commands = self.position,
                        "end of send-stream"
                    );
                    self.done = true;
                }
                Some(Ok(command))
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}

impl<R: Read> std::iter::FusedIterator for StreamDecoder<R> {}

impl<R> std::fmt::Debug for StreamDecoder<R> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamDecoder")
            .field("version", &self.version)
            .field("position", &self.position)
            .field("done", &self.done)
            .finish_non_exhaustive()
    }
}
