//! Capacity-bounded, append-only segment files.
//!
//! A segment is one file: a fixed 64-byte header followed by a contiguous
//! run of frames with no padding. Exactly one segment is *active* (accepts
//! reservations) at any time; all others are *sealed* and read-only.
//!
//! ## Reservation protocol
//!
//! All reservation state lives in a single packed `AtomicU64`:
//!
//! ```text
//! [sealed: 1 bit][record count: 31 bits][byte cursor: 32 bits]
//! ```
//!
//! `try_reserve` advances the cursor and the count in one compare-exchange,
//! so a record's byte range and its index within the segment are allocated
//! in the same atomic step. This is the only synchronization point on the
//! write path: reservers then copy their frames into disjoint ranges with
//! positional writes and no lock. `seal` is a `fetch_or` of the sealed bit,
//! which preserves the final cursor and count in the same word.
//!
//! The 32-bit cursor bounds a segment's data area to 4 GiB − 1; the 31-bit
//! count cannot overflow first because a frame is at least 16 bytes.

use std::cmp::Reverse;
use std::collections::BinaryHeap;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::SystemTime;

use parking_lot::Mutex;

use crate::error::{WalError, WalResult};

/// Magic bytes at the start of every segment file (`WEIR`).
pub const SEGMENT_MAGIC: [u8; 4] = *b"WEIR";

/// On-disk format version.
pub const SEGMENT_FORMAT_VERSION: u32 = 1;

/// Size of the fixed segment file header.
pub const SEGMENT_HEADER_SIZE: u64 = 64;

/// Largest data area addressable by the 32-bit reservation cursor.
pub const MAX_SEGMENT_CAPACITY: u64 = u32::MAX as u64;

const SEALED_BIT: u64 = 1 << 63;
const COUNT_SHIFT: u32 = 32;
const COUNT_MASK: u64 = 0x7FFF_FFFF;

/// Extension used for segment files.
pub const SEGMENT_FILE_EXT: &str = "wal";

/// File name for segment `id`: zero-padded so lexicographic order is id order.
#[must_use]
pub fn segment_file_name(id: u64) -> String {
    format!("{id:019}.{SEGMENT_FILE_EXT}")
}

/// Parses a segment id back out of a file name produced by
/// [`segment_file_name`]. Returns `None` for unrelated files.
#[must_use]
pub fn parse_segment_file_name(name: &str) -> Option<u64> {
    let stem = name.strip_suffix(&format!(".{SEGMENT_FILE_EXT}"))?;
    if stem.len() != 19 || !stem.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    stem.parse().ok()
}

fn pack(count: u64, cursor: u64) -> u64 {
    debug_assert!(count <= COUNT_MASK);
    debug_assert!(cursor <= u64::from(u32::MAX));
    (count << COUNT_SHIFT) | cursor
}

fn unpack(state: u64) -> (bool, u64, u64) {
    (
        state & SEALED_BIT != 0,
        (state >> COUNT_SHIFT) & COUNT_MASK,
        state & u64::from(u32::MAX),
    )
}

/// Fixed header at the start of every segment file.
///
/// The sealed fields are zero while the segment is active and are written
/// in place (then synced) by `seal`, giving recovery an authoritative end
/// of data for sealed segments without rescanning their frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentHeader {
    /// Ordinal of this segment, strictly increasing across the log.
    pub id: u64,
    /// Global offset of the first record in this segment.
    pub base_offset: u64,
    /// Capacity of the data area in bytes (file size minus header).
    pub capacity: u64,
    /// True once the segment has been sealed.
    pub sealed: bool,
    /// Number of records at seal time; zero while active.
    pub sealed_count: u64,
    /// Byte cursor at seal time; zero while active.
    pub sealed_cursor: u64,
}

impl SegmentHeader {
    /// Encodes the header into its fixed 64-byte layout.
    #[must_use]
    pub fn encode(&self) -> [u8; SEGMENT_HEADER_SIZE as usize] {
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        buf[0..4].copy_from_slice(&SEGMENT_MAGIC);
        buf[4..8].copy_from_slice(&SEGMENT_FORMAT_VERSION.to_le_bytes());
        buf[8..16].copy_from_slice(&self.id.to_le_bytes());
        buf[16..24].copy_from_slice(&self.base_offset.to_le_bytes());
        buf[24..32].copy_from_slice(&self.capacity.to_le_bytes());
        buf[32..36].copy_from_slice(&u32::from(self.sealed).to_le_bytes());
        buf[40..48].copy_from_slice(&self.sealed_count.to_le_bytes());
        buf[48..56].copy_from_slice(&self.sealed_cursor.to_le_bytes());
        buf
    }

    /// Decodes a header read from `path`.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::InvalidSegment`] on a magic or version mismatch.
    pub fn decode(path: &Path, buf: &[u8; SEGMENT_HEADER_SIZE as usize]) -> WalResult<Self> {
        if buf[0..4] != SEGMENT_MAGIC {
            return Err(WalError::InvalidSegment {
                path: path.to_path_buf(),
                reason: "bad magic".to_string(),
            });
        }
        let version = u32::from_le_bytes([buf[4], buf[5], buf[6], buf[7]]);
        if version != SEGMENT_FORMAT_VERSION {
            return Err(WalError::InvalidSegment {
                path: path.to_path_buf(),
                reason: format!("unsupported format version {version}"),
            });
        }
        let u64_at = |i: usize| {
            u64::from_le_bytes([
                buf[i],
                buf[i + 1],
                buf[i + 2],
                buf[i + 3],
                buf[i + 4],
                buf[i + 5],
                buf[i + 6],
                buf[i + 7],
            ])
        };
        Ok(Self {
            id: u64_at(8),
            base_offset: u64_at(16),
            capacity: u64_at(24),
            sealed: u32::from_le_bytes([buf[32], buf[33], buf[34], buf[35]]) != 0,
            sealed_count: u64_at(40),
            sealed_cursor: u64_at(48),
        })
    }
}

/// A byte range and record index handed to one producer.
///
/// Once granted, a reservation is never revoked: the caller must write the
/// frame into the range even if it no longer cares about the acknowledgment,
/// otherwise the offset sequence would carry a permanent hole.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Reservation {
    /// Record index within the segment; the global offset is
    /// `base_offset + index`.
    pub index: u64,
    /// Byte position of the frame within the segment data area.
    pub position: u64,
    /// Reserved length in bytes.
    pub len: u64,
}

/// Tracks which reserved byte ranges have been fully written.
///
/// Reservations are granted in byte order but producers finish their copies
/// in any order; the tracker advances a contiguous frontier over completed
/// ranges. Bytes below the frontier contain only whole frames, which is what
/// makes them safe to expose to readers and to the durability watermark.
#[derive(Debug, Default)]
struct CompletionTracker {
    /// All bytes below this position belong to fully written frames.
    frontier: u64,
    /// Number of records wholly below the frontier.
    records: u64,
    /// Completed ranges starting above the frontier, by start position.
    pending: BinaryHeap<Reverse<(u64, u64)>>,
}

impl CompletionTracker {
    fn mark(&mut self, start: u64, end: u64) {
        self.pending.push(Reverse((start, end)));
        while let Some(&Reverse((s, e))) = self.pending.peek() {
            if s != self.frontier {
                break;
            }
            self.pending.pop();
            self.frontier = e;
            self.records += 1;
        }
    }
}

/// State of a segment's completed-write frontier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Frontier {
    /// Bytes of the data area covered by whole frames.
    pub bytes: u64,
    /// Records wholly below `bytes`.
    pub records: u64,
}

/// A capacity-bounded append target backed by one file.
pub struct Segment {
    id: u64,
    base_offset: u64,
    capacity: u64,
    path: PathBuf,
    file: File,
    state: AtomicU64,
    completion: Mutex<CompletionTracker>,
    /// Open replayers currently reading this segment.
    pins: AtomicU64,
    /// Data-area bytes known to be on stable storage; maintained by the
    /// durability controller.
    synced: AtomicU64,
    /// Set at seal time; recovered from file mtime for reopened segments.
    sealed_at: Mutex<Option<SystemTime>>,
}

impl Segment {
    /// Creates a fresh active segment file.
    ///
    /// The header is written and synced before the segment is returned, so
    /// a crash right after rollover cannot leave a headerless file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file already exists or IO fails.
    pub fn create(dir: &Path, id: u64, base_offset: u64, capacity: u64) -> WalResult<Self> {
        let path = dir.join(segment_file_name(id));
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)?;

        let header = SegmentHeader {
            id,
            base_offset,
            capacity,
            sealed: false,
            sealed_count: 0,
            sealed_cursor: 0,
        };
        write_all_at(&file, &header.encode(), 0)?;
        file.sync_data()?;

        Ok(Self {
            id,
            base_offset,
            capacity,
            path,
            file,
            state: AtomicU64::new(pack(0, 0)),
            completion: Mutex::new(CompletionTracker::default()),
            pins: AtomicU64::new(0),
            synced: AtomicU64::new(0),
            sealed_at: Mutex::new(None),
        })
    }

    /// Reads and decodes the header of a segment file.
    ///
    /// # Errors
    ///
    /// Returns an error if the file is shorter than a header or the header
    /// fails validation.
    pub fn read_header(path: &Path) -> WalResult<SegmentHeader> {
        let file = File::open(path)?;
        let mut buf = [0u8; SEGMENT_HEADER_SIZE as usize];
        match read_exact_at(&file, &mut buf, 0) {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => {
                return Err(WalError::InvalidSegment {
                    path: path.to_path_buf(),
                    reason: "file shorter than a segment header".to_string(),
                });
            }
            Err(e) => return Err(e.into()),
        }
        SegmentHeader::decode(path, &buf)
    }

    /// Opens an existing segment file with recovered reservation state.
    ///
    /// `count` and `cursor` come from the sealed header fields or, for the
    /// unsealed last segment, from the recovery scan. The completion
    /// frontier starts at the recovered cursor: every surviving frame below
    /// it was validated by the caller.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be opened.
    pub fn open(path: &Path, header: &SegmentHeader, count: u64, cursor: u64, sealed: bool) -> WalResult<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let sealed_at = if sealed {
            file.metadata()?.modified().ok()
        } else {
            None
        };

        let mut state = pack(count, cursor);
        if sealed {
            state |= SEALED_BIT;
        }

        Ok(Self {
            id: header.id,
            base_offset: header.base_offset,
            capacity: header.capacity,
            path: path.to_path_buf(),
            file,
            state: AtomicU64::new(state),
            completion: Mutex::new(CompletionTracker {
                frontier: cursor,
                records: count,
                pending: BinaryHeap::new(),
            }),
            pins: AtomicU64::new(0),
            // Bytes that survived recovery are on stable storage already.
            synced: AtomicU64::new(cursor),
            sealed_at: Mutex::new(sealed_at),
        })
    }

    /// Segment ordinal.
    #[must_use]
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Global offset of the first record in this segment.
    #[must_use]
    pub fn base_offset(&self) -> u64 {
        self.base_offset
    }

    /// Capacity of the data area in bytes.
    #[must_use]
    pub fn capacity(&self) -> u64 {
        self.capacity
    }

    /// Path of the backing file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True once the segment stopped accepting reservations.
    #[must_use]
    pub fn is_sealed(&self) -> bool {
        self.state.load(Ordering::Acquire) & SEALED_BIT != 0
    }

    /// Number of records reserved so far.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        unpack(self.state.load(Ordering::Acquire)).1
    }

    /// Byte cursor: next free position in the data area.
    #[must_use]
    pub fn cursor(&self) -> u64 {
        unpack(self.state.load(Ordering::Acquire)).2
    }

    /// Global offset one past the last record reserved in this segment.
    #[must_use]
    pub fn end_offset(&self) -> u64 {
        self.base_offset + self.record_count()
    }

    /// When the segment was sealed, if known.
    #[must_use]
    pub fn sealed_at(&self) -> Option<SystemTime> {
        *self.sealed_at.lock()
    }

    /// Atomically reserves `frame_len` bytes and one record index.
    ///
    /// Returns `None` if the segment is sealed or the remaining capacity is
    /// insufficient; state is not mutated in that case and the caller rolls
    /// over to a new segment.
    pub fn try_reserve(&self, frame_len: u64) -> Option<Reservation> {
        let mut state = self.state.load(Ordering::Acquire);
        loop {
            let (sealed, count, cursor) = unpack(state);
            if sealed || cursor + frame_len > self.capacity {
                return None;
            }
            let next = pack(count + 1, cursor + frame_len);
            match self.state.compare_exchange_weak(
                state,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => {
                    return Some(Reservation {
                        index: count,
                        position: cursor,
                        len: frame_len,
                    })
                }
                Err(current) => state = current,
            }
        }
    }

    /// Writes frame bytes into a reserved range.
    ///
    /// Safe to call from many threads at once: reserved ranges never
    /// overlap, and positional writes share the file handle without a seek.
    ///
    /// # Errors
    ///
    /// Returns an error if the write fails.
    pub fn write_frame(&self, reservation: Reservation, frame: &[u8]) -> std::io::Result<()> {
        debug_assert_eq!(frame.len() as u64, reservation.len);
        write_all_at(&self.file, frame, SEGMENT_HEADER_SIZE + reservation.position)
    }

    /// Marks a reserved range as fully written, advancing the visible
    /// frontier once all earlier ranges have completed too.
    pub fn mark_complete(&self, reservation: Reservation) {
        self.completion
            .lock()
            .mark(reservation.position, reservation.position + reservation.len);
    }

    /// Current completed-write frontier.
    #[must_use]
    pub fn frontier(&self) -> Frontier {
        let tracker = self.completion.lock();
        Frontier {
            bytes: tracker.frontier,
            records: tracker.records,
        }
    }

    /// True once every reserved range has been fully written.
    #[must_use]
    pub fn is_quiescent(&self) -> bool {
        self.frontier().bytes == self.cursor()
    }

    /// Seals the segment: no further reservations are granted.
    ///
    /// Idempotent. The first call persists the final count and cursor into
    /// the header and syncs it; later calls are no-ops. Writes into ranges
    /// reserved before the seal may still be in flight: the seal closes
    /// the offset space, not the file.
    ///
    /// # Errors
    ///
    /// Returns an error if the header rewrite fails.
    pub fn seal(&self) -> WalResult<Frontier> {
        let prior = self.state.fetch_or(SEALED_BIT, Ordering::AcqRel);
        let (was_sealed, count, cursor) = unpack(prior);
        if !was_sealed {
            let header = SegmentHeader {
                id: self.id,
                base_offset: self.base_offset,
                capacity: self.capacity,
                sealed: true,
                sealed_count: count,
                sealed_cursor: cursor,
            };
            write_all_at(&self.file, &header.encode(), 0)?;
            self.file.sync_data()?;
            *self.sealed_at.lock() = Some(SystemTime::now());
        }
        Ok(Frontier {
            bytes: cursor,
            records: count,
        })
    }

    /// Forces written bytes to stable storage.
    ///
    /// # Errors
    ///
    /// Returns an error if the sync fails; no durability acknowledgment may
    /// be derived from a failed call.
    pub fn sync(&self) -> std::io::Result<()> {
        self.file.sync_data()
    }

    /// Reads from the data area at `position` into `buf`.
    ///
    /// Returns the number of bytes read, which is shorter than `buf` only
    /// at end of file.
    ///
    /// # Errors
    ///
    /// Returns an error if the read fails.
    pub fn read_at(&self, position: u64, buf: &mut [u8]) -> std::io::Result<usize> {
        read_full_at(&self.file, buf, SEGMENT_HEADER_SIZE + position)
    }

    /// Data-area bytes known to be on stable storage.
    #[must_use]
    pub fn synced_bytes(&self) -> u64 {
        self.synced.load(Ordering::Acquire)
    }

    /// Records a successful sync covering the data area up to `bytes`.
    pub fn note_synced(&self, bytes: u64) {
        self.synced.fetch_max(bytes, Ordering::AcqRel);
    }

    /// Registers an open replayer on this segment.
    pub fn pin(&self) {
        self.pins.fetch_add(1, Ordering::AcqRel);
    }

    /// Releases a replayer registration.
    pub fn unpin(&self) {
        let prior = self.pins.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prior > 0);
    }

    /// True while any open replayer still needs this segment.
    #[must_use]
    pub fn is_pinned(&self) -> bool {
        self.pins.load(Ordering::Acquire) > 0
    }

    /// Size of the backing file implied by the cursor.
    #[must_use]
    pub fn file_len(&self) -> u64 {
        SEGMENT_HEADER_SIZE + self.cursor()
    }
}

impl std::fmt::Debug for Segment {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Segment")
            .field("id", &self.id)
            .field("base_offset", &self.base_offset)
            .field("capacity", &self.capacity)
            .field("sealed", &self.is_sealed())
            .field("record_count", &self.record_count())
            .field("cursor", &self.cursor())
            .finish_non_exhaustive()
    }
}

#[cfg(unix)]
fn write_all_at(file: &File, buf: &[u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.write_all_at(buf, offset)
}

#[cfg(windows)]
fn write_all_at(file: &File, mut buf: &[u8], mut offset: u64) -> std::io::Result<()> {
    use std::os::windows::fs::FileExt;
    while !buf.is_empty() {
        let n = file.seek_write(buf, offset)?;
        if n == 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::WriteZero,
                "failed to write whole frame",
            ));
        }
        buf = &buf[n..];
        offset += n as u64;
    }
    Ok(())
}

#[cfg(unix)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    use std::os::unix::fs::FileExt;
    file.read_exact_at(buf, offset)
}

#[cfg(windows)]
fn read_exact_at(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<()> {
    let n = read_full_at(file, buf, offset)?;
    if n < buf.len() {
        return Err(std::io::ErrorKind::UnexpectedEof.into());
    }
    Ok(())
}

/// Reads as many bytes as are available at `offset`, stopping early only at
/// end of file.
fn read_full_at(file: &File, buf: &mut [u8], mut offset: u64) -> std::io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = read_at_impl(file, &mut buf[filled..], offset)?;
        if n == 0 {
            break;
        }
        filled += n;
        offset += n as u64;
    }
    Ok(filled)
}

#[cfg(unix)]
fn read_at_impl(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::unix::fs::FileExt;
    file.read_at(buf, offset)
}

#[cfg(windows)]
fn read_at_impl(file: &File, buf: &mut [u8], offset: u64) -> std::io::Result<usize> {
    use std::os::windows::fs::FileExt;
    file.seek_read(buf, offset)
}
