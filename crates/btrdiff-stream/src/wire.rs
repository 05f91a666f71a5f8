//! Little-endian field access and the send-stream checksum.

use std::io::{self, Read};

use crate::ProtocolError;

/// Size of the per-command header: le32 len, le16 cmd, le32 crc.
pub(crate) const CMD_HEADER_LEN: usize = 10;
/// Byte range of the crc field inside the command header.
pub(crate) const CMD_HEADER_CRC: std::ops::Range<usize> = 6..10;

#[inline]
pub(crate) fn ensure_slice<'a>(
    data: &'a [u8],
    offset: usize,
    len: usize,
    what: &'static str,
) -> Result<&'a [u8], ProtocolError> {
    let end = offset.checked_add(len).ok_or(ProtocolError::Truncated {
        what,
        needed: len,
        actual: 0,
    })?;
    if end > data.len() {
        return Err(ProtocolError::Truncated {
            what,
            needed: len,
            actual: data.len().saturating_sub(offset),
        });
    }
    Ok(&data[offset..end])
}

#[inline]
pub(crate) fn read_le_u16(data: &[u8], offset: usize, what: &'static str) -> Result<u16, ProtocolError> {
    let bytes = ensure_slice(data, offset, 2, what)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub(crate) fn read_le_u32(data: &[u8], offset: usize, what: &'static str) -> Result<u32, ProtocolError> {
    let bytes = ensure_slice(data, offset, 4, what)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub(crate) fn read_le_u64(data: &[u8], offset: usize, what: &'static str) -> Result<u64, ProtocolError> {
    let bytes = ensure_slice(data, offset, 8, what)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

/// Fill `buf` from `reader`, stopping early only at end-of-file.
///
/// Returns how many bytes were read, so callers can tell a clean EOF (0)
/// from a truncated record.
pub(crate) fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}

/// Checksum of one command as the kernel computes it.
///
/// CRC-32C over the header (crc field zeroed) followed by the payload, with
/// the register seeded to 0 and no final inversion. The `crc32c` crate works
/// in the inverted convention, hence the complements around each call.
pub(crate) fn command_crc(header: &[u8; CMD_HEADER_LEN], payload: &[u8]) -> u32 {
    let mut zeroed = *header;
    zeroed[CMD_HEADER_CRC].fill(0);
    let crc = crc32c::crc32c_append(u32::MAX, &zeroed);
    !crc32c::crc32c_append(crc, payload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ensure_slice_reports_shortfall() {
        let data = [1u8, 2, 3];
        assert_eq!(ensure_slice(&data, 1, 2, "x").unwrap(), &[2, 3]);
        assert_eq!(
            ensure_slice(&data, 2, 4, "attribute"),
            Err(ProtocolError::Truncated {
                what: "attribute",
                needed: 4,
                actual: 1
            })
        );
    }

    #[test]
    fn test_le_readers() {
        let data = [0x34, 0x12, 0x78, 0x56, 0x00, 0x00, 0x00, 0x00, 0xff];
        assert_eq!(read_le_u16(&data, 0, "x").unwrap(), 0x1234);
        assert_eq!(read_le_u32(&data, 0, "x").unwrap(), 0x5678_1234);
        assert_eq!(read_le_u64(&data, 0, "x").unwrap(), 0x5678_1234);
        assert!(read_le_u64(&data, 2, "x").is_err());
    }

    #[test]
    fn test_read_full_stops_at_eof() {
        let mut src: &[u8] = b"abc";
        let mut buf = [0u8; 8];
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 3);
        assert_eq!(&buf[..3], b"abc");
        assert_eq!(read_full(&mut src, &mut buf).unwrap(), 0);
    }

    #[test]
    fn test_crc_ignores_stored_crc_field() {
        let mut header = [0u8; CMD_HEADER_LEN];
        header[4] = 21;
        let clean = command_crc(&header, b"");
        header[CMD_HEADER_CRC].copy_from_slice(&0xdead_beefu32.to_le_bytes());
        assert_eq!(command_crc(&header, b""), clean);
    }

    #[test]
    fn test_crc_matches_unreflected_zero_seed() {
        // The zero-seeded, non-inverted register over all-zero input stays 0.
        assert_eq!(command_crc(&[0u8; CMD_HEADER_LEN], &[0u8; 7]), 0);
    }
}
