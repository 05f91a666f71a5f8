//! # btrdiff-stream
//!
//! Decoder for the binary stream emitted by `btrfs send`.
//!
//! A send-stream is a linear log of filesystem mutations. This crate turns the
//! raw bytes into a lazy sequence of typed [`Command`] values:
//!
//! ```text
//! +---------------------------+
//! | "btrfs-stream\0" | le32 v |   stream header (17 bytes)
//! +---------------------------+
//! | le32 len | le16 cmd | crc |   command header (10 bytes)
//! | [le16 type|le16 len|data]*|   attribute TLVs (`len` bytes)
//! +---------------------------+
//! | ...                       |
//! | END command               |
//! +---------------------------+
//! ```
//!
//! ## Modules
//!
//! - [`table`]: command/attribute codes and the pure decode function
//! - [`decoder`]: framing, checksums, the lazy [`StreamDecoder`]
//! - [`command`]: the immutable [`Command`] item model
//! - [`filters`]: iterator adapters used to normalize decoded items

pub mod command;
pub mod decoder;
pub mod filters;
pub mod table;
mod wire;

#[cfg(any(test, feature = "testing"))]
pub mod testing;

pub use command::{Command, CommandKind, DeviceNumber, Timespec};
pub use decoder::{StreamDecoder, DEFAULT_MAX_COMMAND_LEN, SEND_STREAM_MAGIC};
pub use table::{decode_command, AttributeType, CommandType};

use std::io;

use thiserror::Error;

/// Malformed or unrecognized bytes in a send-stream.
///
/// Every variant is fatal to the stream: once framing cannot be trusted there
/// is no way to resynchronize on the next command.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("bad stream magic: {found:?}")]
    BadMagic { found: Vec<u8> },

    #[error("unsupported stream version {0}")]
    UnsupportedVersion(u32),

    #[error("truncated {what}: needed {needed} bytes, got {actual}")]
    Truncated {
        what: &'static str,
        needed: usize,
        actual: usize,
    },

    #[error("stream ended before the end command")]
    MissingEnd,

    #[error("checksum mismatch in command type {command}: header has {expected:#010x}, computed {actual:#010x}")]
    ChecksumMismatch {
        command: u16,
        expected: u32,
        actual: u32,
    },

    #[error("command payload of {len} bytes exceeds the limit of {limit}")]
    OversizedCommand { len: u32, limit: u32 },

    #[error("unknown command type {0}")]
    UnknownCommand(u16),

    #[error("{command} requires stream version {required}, stream is version {version}")]
    UnsupportedCommand {
        command: CommandType,
        required: u32,
        version: u32,
    },

    #[error("unknown attribute type {code} in {command}")]
    UnknownAttribute { command: CommandType, code: u16 },

    #[error("attribute {attr} is not valid for {command}")]
    UnexpectedAttribute {
        command: CommandType,
        attr: AttributeType,
    },

    #[error("attribute {attr} appears more than once in {command}")]
    DuplicateAttribute {
        command: CommandType,
        attr: AttributeType,
    },

    #[error("{command} is missing required attribute {attr}")]
    MissingAttribute {
        command: CommandType,
        attr: AttributeType,
    },

    #[error("attribute {attr} of {command} has length {actual}, expected {expected}")]
    BadAttributeLength {
        command: CommandType,
        attr: AttributeType,
        expected: usize,
        actual: usize,
    },

    #[error("attribute {attr} of {command} is out of range: {value}")]
    ValueOutOfRange {
        command: CommandType,
        attr: AttributeType,
        value: u64,
    },
}

/// Errors produced while pulling commands out of a byte source.
#[derive(Error, Debug)]
pub enum StreamError {
    #[error("I/O error while reading send-stream: {0}")]
    Io(#[from] io::Error),

    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
}

pub type Result<T> = std::result::Result<T, StreamError>;
