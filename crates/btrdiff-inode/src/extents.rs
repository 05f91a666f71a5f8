//! Sparse extent map of a regular file.
//!
//! A [`FileExtents`] is a logical length plus an ordered list of
//! non-overlapping [`Segment`]s. Any byte not covered by a segment is a hole.
//! Segments never copy written bytes: splitting or cloning a literal segment
//! only bumps the reference count of its `Arc<[u8]>`.

use std::sync::Arc;

use uuid::Uuid;

use crate::{InodeError, Result};

/// fallocate(2) mode flags used by send-stream v2.
pub const FALLOC_FL_KEEP_SIZE: u32 = 0x01;
pub const FALLOC_FL_PUNCH_HOLE: u32 = 0x02;
pub const FALLOC_FL_ZERO_RANGE: u32 = 0x10;

/// Largest file [`FileExtents::content`] will materialize.
pub const MAX_CONTENT_LEN: u64 = 1 << 30;

/// Where a cloned range was copied from.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CloneOrigin {
    pub subvolume: Uuid,
    pub path: Vec<u8>,
    pub offset: u64,
}

/// Payload of a v2 `encoded_write`, shared by every segment cut from it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncodedExtent {
    pub data: Arc<[u8]>,
    pub unencoded_len: u64,
    pub unencoded_offset: u64,
    pub compression: u32,
    pub encryption: u32,
}

impl EncodedExtent {
    /// Neither compressed nor encrypted: `data` is the file content.
    pub fn is_plain(&self) -> bool {
        self.compression == 0 && self.encryption == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SegmentSource {
    /// Reads as zeros. Only appears in tilings, never stored.
    Hole,
    /// Bytes from a `write`, starting `start` bytes into `bytes`.
    Literal { bytes: Arc<[u8]>, start: usize },
    /// Written data whose bytes the stream did not carry.
    Unwritten,
    /// A window into an encoded extent, `skip` bytes past its first file byte.
    Encoded { extent: Arc<EncodedExtent>, skip: u64 },
}

impl SegmentSource {
    pub fn is_hole(&self) -> bool {
        matches!(self, Self::Hole)
    }

    fn advanced(&self, n: u64) -> Self {
        match self {
            Self::Literal { bytes, start } => Self::Literal {
                bytes: Arc::clone(bytes),
                start: start.saturating_add(usize::try_from(n).unwrap_or(usize::MAX)),
            },
            Self::Encoded { extent, skip } => Self::Encoded {
                extent: Arc::clone(extent),
                skip: skip + n,
            },
            Self::Hole => Self::Hole,
            Self::Unwritten => Self::Unwritten,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    pub offset: u64,
    pub len: u64,
    pub source: SegmentSource,
    pub origin: Option<CloneOrigin>,
}

impl Segment {
    fn hole(offset: u64, len: u64) -> Self {
        Self {
            offset,
            len,
            source: SegmentSource::Hole,
            origin: None,
        }
    }

    pub fn end(&self) -> u64 {
        self.offset + self.len
    }

    /// The part of this segment before `at`.
    fn head(&self, at: u64) -> Self {
        Self {
            offset: self.offset,
            len: at - self.offset,
            source: self.source.clone(),
            origin: self.origin.clone(),
        }
    }

    /// The part of this segment from `at` on.
    fn tail(&self, at: u64) -> Self {
        let skip = at - self.offset;
        Self {
            offset: at,
            len: self.end() - at,
            source: self.source.advanced(skip),
            origin: self.origin.as_ref().map(|o| CloneOrigin {
                subvolume: o.subvolume,
                path: o.path.clone(),
                offset: o.offset + skip,
            }),
        }
    }

    /// Bytes of this segment, if the stream carried them.
    pub fn bytes(&self) -> Option<&[u8]> {
        let len = usize::try_from(self.len).ok()?;
        match &self.source {
            SegmentSource::Literal { bytes, start } => bytes.get(*start..start.checked_add(len)?),
            SegmentSource::Encoded { extent, skip } if extent.is_plain() => {
                let from = usize::try_from(extent.unencoded_offset.checked_add(*skip)?).ok()?;
                extent.data.get(from..from.checked_add(len)?)
            }
            _ => None,
        }
    }
}

fn checked_end(offset: u64, len: u64) -> Result<u64> {
    offset
        .checked_add(len)
        .ok_or(InodeError::ExtentOverflow { offset, len })
}

#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct FileExtents {
    len: u64,
    segments: Vec<Segment>,
}

impl FileExtents {
    pub fn new() -> Self {
        Self::default()
    }

    /// Logical file size.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Stored data segments in offset order; holes are the gaps.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Drop every byte in `[start, end)`, splitting segments that straddle it.
    fn punch(&mut self, start: u64, end: u64) {
        if start >= end {
            return;
        }
        let old = std::mem::take(&mut self.segments);
        let mut kept = Vec::with_capacity(old.len() + 1);
        for seg in old {
            if seg.end() <= start || seg.offset >= end {
                kept.push(seg);
                continue;
            }
            if seg.offset < start {
                kept.push(seg.head(start));
            }
            if seg.end() > end {
                kept.push(seg.tail(end));
            }
        }
        self.segments = kept;
    }

    /// Overwrite the segment's range with it and grow the file to cover it.
    fn place(&mut self, seg: Segment) {
        let end = seg.end();
        self.punch(seg.offset, end);
        if !seg.source.is_hole() && seg.len > 0 {
            let at = self.segments.partition_point(|s| s.offset < seg.offset);
            self.segments.insert(at, seg);
        }
        self.len = self.len.max(end);
    }

    pub fn write(&mut self, offset: u64, data: Arc<[u8]>) -> Result<()> {
        let len = data.len() as u64;
        checked_end(offset, len)?;
        if len == 0 {
            return Ok(());
        }
        self.place(Segment {
            offset,
            len,
            source: SegmentSource::Literal {
                bytes: data,
                start: 0,
            },
            origin: None,
        });
        Ok(())
    }

    /// Record `[offset, offset + len)` as written without its bytes.
    pub fn update_extent(&mut self, offset: u64, len: u64) -> Result<()> {
        checked_end(offset, len)?;
        if len > 0 {
            self.place(Segment {
                offset,
                len,
                source: SegmentSource::Unwritten,
                origin: None,
            });
        }
        Ok(())
    }

    /// Place `file_len` bytes of an encoded extent at `offset`.
    pub fn encoded_write(&mut self, offset: u64, file_len: u64, extent: EncodedExtent) -> Result<()> {
        checked_end(offset, file_len)?;
        if file_len > 0 {
            self.place(Segment {
                offset,
                len: file_len,
                source: SegmentSource::Encoded {
                    extent: Arc::new(extent),
                    skip: 0,
                },
                origin: None,
            });
        }
        Ok(())
    }

    /// Set the logical size, clipping data past it or growing with a hole.
    pub fn truncate(&mut self, size: u64) {
        self.punch(size, u64::MAX);
        self.len = size;
    }

    pub fn fallocate(&mut self, mode: u32, offset: u64, len: u64) -> Result<()> {
        let end = checked_end(offset, len)?;
        if mode & (FALLOC_FL_PUNCH_HOLE | FALLOC_FL_ZERO_RANGE) != 0 {
            self.punch(offset, end.min(self.len));
        }
        if mode & (FALLOC_FL_KEEP_SIZE | FALLOC_FL_PUNCH_HOLE) == 0 {
            self.len = self.len.max(end);
        }
        Ok(())
    }

    /// Tile `[offset, offset + len)` with segments whose offsets are relative
    /// to `offset`. Gaps and bytes past the end of file come back as holes.
    pub fn slice(&self, offset: u64, len: u64) -> Vec<Segment> {
        let end = offset.saturating_add(len);
        let mut out = Vec::new();
        let mut cursor = offset;
        for seg in &self.segments {
            if seg.end() <= offset {
                continue;
            }
            if seg.offset >= end {
                break;
            }
            let start = seg.offset.max(offset);
            let stop = seg.end().min(end);
            if start > cursor {
                out.push(Segment::hole(cursor - offset, start - cursor));
            }
            let mut piece = if start > seg.offset {
                seg.tail(start)
            } else {
                seg.clone()
            };
            piece.offset = start - offset;
            piece.len = stop - start;
            out.push(piece);
            cursor = stop;
        }
        if cursor < end {
            out.push(Segment::hole(cursor - offset, end - cursor));
        }
        out
    }

    /// The whole file as holes and data, in order.
    pub fn tiles(&self) -> Vec<Segment> {
        self.slice(0, self.len)
    }

    /// Replace `[offset, offset + len)` with `pieces` taken from a source
    /// file's [`FileExtents::slice`]. Each data piece is tagged with where it
    /// came from.
    pub fn clone_range(
        &mut self,
        offset: u64,
        len: u64,
        pieces: Vec<Segment>,
        origin: &CloneOrigin,
    ) -> Result<()> {
        let end = checked_end(offset, len)?;
        self.punch(offset, end);
        for mut piece in pieces {
            if piece.source.is_hole() || piece.offset >= len {
                continue;
            }
            piece.len = piece.len.min(len - piece.offset);
            piece.origin = Some(CloneOrigin {
                subvolume: origin.subvolume,
                path: origin.path.clone(),
                offset: origin.offset + piece.offset,
            });
            piece.offset += offset;
            self.place(piece);
        }
        self.len = self.len.max(end);
        Ok(())
    }

    /// Alternating hole/data run lengths, adjacent runs of a kind merged.
    /// `true` marks data.
    pub fn runs(&self) -> Vec<(bool, u64)> {
        let mut runs: Vec<(bool, u64)> = Vec::new();
        for tile in self.tiles() {
            let data = !tile.source.is_hole();
            match runs.last_mut() {
                Some((kind, len)) if *kind == data => *len += tile.len,
                _ => runs.push((data, tile.len)),
            }
        }
        runs
    }

    /// Full file content, when every data segment carries its bytes and the
    /// file is at most [`MAX_CONTENT_LEN`] long.
    pub fn content(&self) -> Option<Vec<u8>> {
        if self.len > MAX_CONTENT_LEN {
            return None;
        }
        let tiles = self.tiles();
        if tiles.iter().any(|t| !t.source.is_hole() && t.bytes().is_none()) {
            return None;
        }
        let mut out = Vec::with_capacity(usize::try_from(self.len).ok()?);
        for tile in tiles {
            if tile.source.is_hole() {
                out.resize(out.len() + usize::try_from(tile.len).ok()?, 0);
            } else {
                out.extend_from_slice(tile.bytes()?);
            }
        }
        Some(out)
    }

    /// Ranges that were cloned, with their origins.
    pub fn clone_origins(&self) -> impl Iterator<Item = (u64, u64, &CloneOrigin)> {
        self.segments
            .iter()
            .filter_map(|s| s.origin.as_ref().map(|o| (s.offset, s.len, o)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn data(s: &str) -> Arc<[u8]> {
        Arc::from(s.as_bytes())
    }

    fn origin() -> CloneOrigin {
        CloneOrigin {
            subvolume: Uuid::nil(),
            path: b"src".to_vec(),
            offset: 0,
        }
    }

    #[test]
    fn test_truncate_then_write() {
        let mut ext = FileExtents::new();
        ext.truncate(17);
        assert_eq!(ext.runs(), vec![(false, 17)]);
        ext.write(10, data("xxxxxxxxxxxxxxx")).unwrap();
        assert_eq!(ext.runs(), vec![(false, 10), (true, 15)]);
        assert_eq!(ext.len(), 25);
    }

    #[test]
    fn test_write_then_truncate_clips() {
        let mut ext = FileExtents::new();
        ext.write(10, data("xxxxxxxxxxxxxxx")).unwrap();
        ext.truncate(17);
        assert_eq!(ext.runs(), vec![(false, 10), (true, 7)]);
        let content = ext.content().unwrap();
        assert_eq!(content.len(), 17);
        assert_eq!(&content[10..], b"xxxxxxx");
    }

    #[test]
    fn test_overwrite_splits_without_copying() {
        let mut ext = FileExtents::new();
        let first = data("aaaaaaaaaa");
        ext.write(0, Arc::clone(&first)).unwrap();
        ext.write(3, data("BB")).unwrap();
        assert_eq!(ext.segments().len(), 3);
        assert_eq!(ext.content().unwrap(), b"aaaBBaaaaa");
        // The original buffer is referenced by both halves.
        assert_eq!(Arc::strong_count(&first), 3);
    }

    #[test]
    fn test_update_extent_has_no_content() {
        let mut ext = FileExtents::new();
        ext.write(0, data("abc")).unwrap();
        ext.update_extent(5, 2).unwrap();
        assert_eq!(ext.runs(), vec![(true, 3), (false, 2), (true, 2)]);
        assert_eq!(ext.content(), None);
    }

    #[test]
    fn test_huge_sparse_file_is_not_materialized() {
        let mut ext = FileExtents::new();
        ext.truncate(1 << 50);
        ext.write((1 << 50) - 3, data("end")).unwrap();
        assert_eq!(ext.runs(), vec![(false, (1 << 50) - 3), (true, 3)]);
        assert_eq!(ext.content(), None);

        ext.truncate(MAX_CONTENT_LEN + 1);
        assert_eq!(ext.content(), None);
        ext.truncate(8);
        assert_eq!(ext.content().unwrap(), vec![0; 8]);
    }

    #[test]
    fn test_advancing_past_a_literal_reads_nothing() {
        let source = SegmentSource::Literal {
            bytes: data("abc"),
            start: 1,
        };
        let moved = source.advanced(u64::MAX);
        assert_eq!(
            moved,
            SegmentSource::Literal {
                bytes: data("abc"),
                start: usize::MAX,
            }
        );
        let tile = Segment {
            offset: 0,
            len: 1,
            source: moved,
            origin: None,
        };
        assert_eq!(tile.bytes(), None);
    }

    #[test]
    fn test_slice_reads_past_eof_as_hole() {
        let mut ext = FileExtents::new();
        ext.write(0, data("abc")).unwrap();
        let pieces = ext.slice(1, 5);
        assert_eq!(pieces.len(), 2);
        assert_eq!((pieces[0].offset, pieces[0].len), (0, 2));
        assert_eq!(pieces[0].bytes(), Some(&b"bc"[..]));
        assert_eq!((pieces[1].offset, pieces[1].len), (2, 3));
        assert!(pieces[1].source.is_hole());
    }

    #[test]
    fn test_clone_range_copies_layout() {
        let mut src = FileExtents::new();
        src.write(0, data("bbb")).unwrap();
        src.write(10, data("aaaaaaaaaa")).unwrap();

        let mut dst = FileExtents::new();
        dst.clone_range(0, 10, src.slice(5, 10), &CloneOrigin { offset: 5, ..origin() })
            .unwrap();
        assert_eq!(dst.runs(), vec![(false, 5), (true, 5)]);
        let (at, len, from) = dst.clone_origins().next().unwrap();
        assert_eq!((at, len, from.offset), (5, 5, 10));
        assert_eq!(dst.content().unwrap(), b"\0\0\0\0\0aaaaa");
    }

    #[test]
    fn test_clone_hole_punches_target() {
        let mut dst = FileExtents::new();
        dst.write(0, data("zzzzzz")).unwrap();
        let empty = FileExtents::new();
        dst.clone_range(1, 3, empty.slice(0, 3), &origin()).unwrap();
        assert_eq!(dst.runs(), vec![(true, 1), (false, 3), (true, 2)]);
    }

    #[test]
    fn test_fallocate_modes() {
        let mut ext = FileExtents::new();
        ext.write(0, data("0123456789")).unwrap();
        ext.fallocate(FALLOC_FL_PUNCH_HOLE | FALLOC_FL_KEEP_SIZE, 2, 3).unwrap();
        assert_eq!(ext.runs(), vec![(true, 2), (false, 3), (true, 5)]);
        ext.fallocate(FALLOC_FL_KEEP_SIZE, 0, 100).unwrap();
        assert_eq!(ext.len(), 10);
        ext.fallocate(0, 0, 16).unwrap();
        assert_eq!(ext.len(), 16);
        assert_eq!(ext.runs().last(), Some(&(false, 6)));
    }

    #[test]
    fn test_plain_encoded_write_is_readable() {
        let mut ext = FileExtents::new();
        let extent = EncodedExtent {
            data: data("..hello.."),
            unencoded_len: 9,
            unencoded_offset: 2,
            compression: 0,
            encryption: 0,
        };
        ext.encoded_write(4, 5, extent.clone()).unwrap();
        assert_eq!(&ext.content().unwrap()[4..], b"hello");

        let mut zstd = FileExtents::new();
        zstd.encoded_write(0, 5, EncodedExtent {
            compression: 2,
            ..extent
        })
        .unwrap();
        assert_eq!(zstd.runs(), vec![(true, 5)]);
        assert_eq!(zstd.content(), None);
    }

    #[test]
    fn test_overflow_rejected() {
        let mut ext = FileExtents::new();
        assert_eq!(
            ext.update_extent(u64::MAX, 2),
            Err(InodeError::ExtentOverflow {
                offset: u64::MAX,
                len: 2
            })
        );
    }
}
