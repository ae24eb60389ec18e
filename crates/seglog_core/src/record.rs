//! Record framing.
//!
//! Every record in a segment is laid out as:
//!
//! ```text
//! | length (4) | crc32 (4) | payload (length) | length (4) |
//! ```
//!
//! The trailing length lets readers walk the log backwards. A leading
//! length of zero marks the end of written data.

use crate::error::{CoreError, CoreResult};
use bytes::{BufMut, BytesMut};

/// Bytes before the payload (length + checksum).
pub const HEADER_SIZE: usize = 8;

/// Bytes after the payload (trailing length).
pub const TRAILER_SIZE: usize = 4;

/// Total framing bytes per record.
pub const OVERHEAD: usize = HEADER_SIZE + TRAILER_SIZE;

/// CRC32 of a payload.
#[must_use]
pub fn checksum(payload: &[u8]) -> u32 {
    crc32fast::hash(payload)
}

/// Finishes a frame whose payload was written after `HEADER_SIZE`
/// placeholder bytes: patches length and checksum, appends the trailer.
pub(crate) fn seal(frame: &mut BytesMut) -> CoreResult<()> {
    let payload_len = frame.len().saturating_sub(HEADER_SIZE);
    if payload_len == 0 {
        return Err(CoreError::invalid_argument("cannot store empty record"));
    }
    let len = u32::try_from(payload_len)
        .map_err(|_| CoreError::invalid_argument(format!("record of {payload_len} bytes is too large")))?;
    let crc = checksum(&frame[HEADER_SIZE..]);
    frame[0..4].copy_from_slice(&len.to_le_bytes());
    frame[4..8].copy_from_slice(&crc.to_le_bytes());
    frame.put_u32_le(len);
    Ok(())
}

/// Frames `payload` into `dst`.
#[cfg(test)]
pub(crate) fn encode(payload: &[u8], dst: &mut BytesMut) -> CoreResult<()> {
    let mut frame = BytesMut::with_capacity(payload.len() + OVERHEAD);
    frame.put_bytes(0, HEADER_SIZE);
    frame.put_slice(payload);
    seal(&mut frame)?;
    dst.put_slice(&frame);
    Ok(())
}

pub(crate) fn read_u32(bytes: &[u8], at: usize) -> u32 {
    let mut raw = [0u8; 4];
    raw.copy_from_slice(&bytes[at..at + 4]);
    u32::from_le_bytes(raw)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_layout() {
        let mut dst = BytesMut::new();
        encode(b"abc", &mut dst).unwrap();

        assert_eq!(dst.len(), 3 + OVERHEAD);
        assert_eq!(read_u32(&dst, 0), 3);
        assert_eq!(read_u32(&dst, 4), checksum(b"abc"));
        assert_eq!(&dst[8..11], b"abc");
        assert_eq!(read_u32(&dst, 11), 3);
    }

    #[test]
    fn empty_record_rejected() {
        let mut dst = BytesMut::new();
        let result = encode(b"", &mut dst);
        assert!(matches!(result, Err(CoreError::InvalidArgument { .. })));
    }
}
