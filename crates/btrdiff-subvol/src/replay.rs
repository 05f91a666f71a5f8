//! Drive decoded streams into a [`SubvolumeSet`].

use std::io::{BufRead, Read};

use btrdiff_stream::filters::{drop_selinux_xattrs, normalize_utimes};
use btrdiff_stream::{
    Command, CommandKind, StreamDecoder, StreamError, Timespec, DEFAULT_MAX_COMMAND_LEN,
};
use btrdiff_config::log_replay_info;
use thiserror::Error;
use tracing::instrument;
use uuid::Uuid;

use crate::set::SubvolumeSet;
use crate::subvolume::Subvolume;
use crate::ReconstructionError;

#[derive(Error, Debug)]
pub enum ReplayFailure {
    #[error(transparent)]
    Stream(#[from] StreamError),

    #[error(transparent)]
    Reconstruction(#[from] ReconstructionError),
}

/// A replay failure with the position of the offending command.
#[derive(Error, Debug)]
#[error("command {index}{}: {source}", describe(.kind, .path))]
pub struct ReplayError {
    /// Zero-based index of the command within its stream.
    pub index: usize,
    pub kind: Option<CommandKind>,
    pub path: Option<Vec<u8>>,
    #[source]
    pub source: ReplayFailure,
}

fn describe(kind: &Option<CommandKind>, path: &Option<Vec<u8>>) -> String {
    match (kind, path) {
        (Some(kind), Some(path)) => format!(" ({kind} {})", path.escape_ascii()),
        (Some(kind), None) => format!(" ({kind})"),
        _ => String::new(),
    }
}

impl ReplayError {
    fn new(index: usize, command: Option<&Command>, source: impl Into<ReplayFailure>) -> Self {
        Self {
            index,
            kind: command.map(Command::kind),
            path: command.and_then(Command::path).map(<[u8]>::to_vec),
            source: source.into(),
        }
    }

    pub fn reconstruction(&self) -> Option<&ReconstructionError> {
        match &self.source {
            ReplayFailure::Reconstruction(e) => Some(e),
            ReplayFailure::Stream(_) => None,
        }
    }
}

/// Knobs applied while replaying raw bytes.
#[derive(Debug, Clone)]
pub struct ReplayOptions {
    pub max_command_len: u32,
    /// Drop `security.selinux` labels with these values (all when empty).
    pub drop_selinux: Option<Vec<Vec<u8>>>,
    /// Collapse `utimes` inside this window to its start.
    pub normalize_utimes: Option<(Timespec, Timespec)>,
}

impl Default for ReplayOptions {
    fn default() -> Self {
        Self {
            max_command_len: DEFAULT_MAX_COMMAND_LEN,
            drop_selinux: None,
            normalize_utimes: None,
        }
    }
}

/// Reconstruct one subvolume from `items`, the first of which must begin
/// it. The set is only read, so independent replays may share it.
pub fn replay_commands<I, E>(set: &SubvolumeSet, items: I) -> Result<Subvolume, ReplayError>
where
    I: IntoIterator<Item = Result<Command, E>>,
    E: Into<ReplayFailure>,
{
    let mut items = items.into_iter().enumerate();
    let Some((index, first)) = items.next() else {
        return Err(ReplayError::new(0, None, ReconstructionError::EmptyStream));
    };
    let first = first.map_err(|e| ReplayError::new(index, None, e))?;
    let mut mutator = set
        .begin(&first)
        .map_err(|e| ReplayError::new(index, Some(&first), e))?;

    let mut count = 1;
    for (index, item) in items {
        let command = item.map_err(|e| ReplayError::new(index, None, e))?;
        mutator
            .apply(&command, set)
            .map_err(|e| ReplayError::new(index, Some(&command), e))?;
        count = index + 1;
    }
    mutator
        .finish()
        .map_err(|e| ReplayError::new(count, None, e))
}

fn filtered<'a, I>(
    items: I,
    options: &ReplayOptions,
) -> Box<dyn Iterator<Item = Result<Command, StreamError>> + 'a>
where
    I: Iterator<Item = Result<Command, StreamError>> + 'a,
{
    let mut items: Box<dyn Iterator<Item = Result<Command, StreamError>> + 'a> = Box::new(items);
    if let Some(values) = &options.drop_selinux {
        items = Box::new(drop_selinux_xattrs(items, values.clone()));
    }
    if let Some((start, end)) = options.normalize_utimes {
        items = Box::new(normalize_utimes(items, start, end));
    }
    items
}

/// Replay one decoded stream and add the result to `set`.
///
/// `options.max_command_len` replaces whatever limit `decoder` carried.
#[instrument(skip_all, level = "debug")]
pub fn replay_stream<R: Read>(
    set: &mut SubvolumeSet,
    decoder: StreamDecoder<R>,
    options: &ReplayOptions,
) -> Result<Uuid, ReplayError> {
    let decoder = decoder.with_max_command_len(options.max_command_len);
    let subvolume = replay_commands(set, filtered(decoder, options))?;
    let uuid = subvolume.uuid();
    set.insert(subvolume)
        .map_err(|e| ReplayError::new(0, None, e))?;
    Ok(uuid)
}

/// Replay back-to-back streams from `reader` until it is exhausted.
///
/// Returns the UUIDs in stream order.
pub fn replay_streams<R: BufRead>(
    set: &mut SubvolumeSet,
    mut reader: R,
    options: &ReplayOptions,
) -> Result<Vec<Uuid>, ReplayError> {
    let mut uuids = Vec::new();
    loop {
        let at_eof = reader
            .fill_buf()
            .map(<[u8]>::is_empty)
            .map_err(|e| ReplayError::new(0, None, StreamError::Io(e)))?;
        if at_eof {
            break;
        }
        let decoder = StreamDecoder::new(&mut reader).map_err(|e| ReplayError::new(0, None, e))?;
        uuids.push(replay_stream(set, decoder, options)?);
    }
    log_replay_info!(
        "replay finished",
        streams = uuids.len(),
        subvolumes = set.len()
    );
    Ok(uuids)
}
