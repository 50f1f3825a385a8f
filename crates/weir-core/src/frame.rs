//! Record frame codec.
//!
//! A frame is the on-storage encoding of one record:
//!
//! ```text
//! [length: 4 bytes LE][offset: 8 bytes LE][payload: length bytes][crc32c: 4 bytes LE]
//! ```
//!
//! The checksum covers the header and payload, so a mutation of any byte of
//! the frame body is detected. Decoding always reads the fixed header first
//! and checks the declared payload length against the bytes actually
//! available, which keeps "not enough bytes yet" (a normal condition while
//! tailing, or at a crash tail) structurally distinct from "checksum
//! mismatch" (corruption).

use bytes::Bytes;

/// Size of the fixed frame header (length + offset).
pub const FRAME_HEADER_SIZE: usize = 12;

/// Size of the checksum trailer.
pub const FRAME_TRAILER_SIZE: usize = 4;

/// Fixed per-record overhead: header plus trailer.
pub const FRAME_OVERHEAD: usize = FRAME_HEADER_SIZE + FRAME_TRAILER_SIZE;

/// A decoded record: an opaque payload and its assigned offset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Record {
    /// Globally monotonic sequence offset assigned at append time.
    pub offset: u64,
    /// Producer-supplied payload. May be empty.
    pub payload: Bytes,
}

/// Result of decoding one frame from a byte region.
#[derive(Debug)]
pub enum FrameOutcome {
    /// A complete, checksum-valid frame.
    Complete {
        /// The decoded record.
        record: Record,
        /// Total encoded size of the frame, header and trailer included.
        frame_len: usize,
    },
    /// Not enough bytes for a whole frame.
    ///
    /// Normal at the live tail of an active segment and at the crash tail
    /// of the last segment.
    Incomplete,
    /// Enough bytes were present but the checksum did not match.
    Corrupt {
        /// Checksum stored in the frame trailer.
        stored: u32,
        /// Checksum computed over the frame body.
        computed: u32,
    },
}

/// Total encoded size of a frame carrying `payload_len` payload bytes.
#[must_use]
pub fn encoded_frame_len(payload_len: usize) -> usize {
    FRAME_OVERHEAD + payload_len
}

/// Appends the frame encoding of `(offset, payload)` to `buf`.
///
/// Deterministic: the same record always produces the same bytes.
pub fn encode_frame(buf: &mut Vec<u8>, offset: u64, payload: &[u8]) {
    let body_start = buf.len();
    buf.reserve(encoded_frame_len(payload.len()));
    #[allow(clippy::cast_possible_truncation)] // payload length is validated against segment capacity (< u32::MAX)
    let len = payload.len() as u32;
    buf.extend_from_slice(&len.to_le_bytes());
    buf.extend_from_slice(&offset.to_le_bytes());
    buf.extend_from_slice(payload);
    let crc = crc32c::crc32c(&buf[body_start..]);
    buf.extend_from_slice(&crc.to_le_bytes());
}

/// Decodes one frame from the start of `buf`.
///
/// `buf` must span exactly the readable bytes of the region: the decoder
/// treats its end as the end of written data.
#[must_use]
pub fn decode_frame(buf: &[u8]) -> FrameOutcome {
    if buf.len() < FRAME_HEADER_SIZE {
        return FrameOutcome::Incomplete;
    }

    let len = u32::from_le_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
    let Some(frame_len) = len.checked_add(FRAME_OVERHEAD) else {
        return FrameOutcome::Incomplete;
    };
    if buf.len() < frame_len {
        return FrameOutcome::Incomplete;
    }

    let body = &buf[..FRAME_HEADER_SIZE + len];
    let trailer = &buf[FRAME_HEADER_SIZE + len..frame_len];
    let stored = u32::from_le_bytes([trailer[0], trailer[1], trailer[2], trailer[3]]);
    let computed = crc32c::crc32c(body);
    if stored != computed {
        return FrameOutcome::Corrupt { stored, computed };
    }

    let offset = u64::from_le_bytes([
        buf[4], buf[5], buf[6], buf[7], buf[8], buf[9], buf[10], buf[11],
    ]);
    FrameOutcome::Complete {
        record: Record {
            offset,
            payload: Bytes::copy_from_slice(&body[FRAME_HEADER_SIZE..]),
        },
        frame_len,
    }
}
