//! Sequential read path: bounded replay and live tailing.
//!
//! Replayers walk segments through the frame codec and yield records in
//! strictly increasing offset order. They are read-only and never block
//! producers; the segment containing the start offset is located by base
//! offset, so resuming does not re-read prior segments.

use std::sync::Arc;

use crate::durability::WaitOutcome;
use crate::error::{WalError, WalResult};
use crate::frame::{decode_frame, FrameOutcome, Record, FRAME_HEADER_SIZE, FRAME_OVERHEAD};
use crate::log::Shared;
use crate::segment::Segment;

/// Bytes read from a segment per refill.
const SCAN_CHUNK: usize = 64 * 1024;

/// Keeps a segment alive for a reading replayer.
///
/// Retention never reclaims a pinned segment; the pin is released on drop.
pub(crate) struct PinnedSegment {
    segment: Arc<Segment>,
}

impl PinnedSegment {
    pub(crate) fn new(segment: Arc<Segment>) -> Self {
        segment.pin();
        Self { segment }
    }

    pub(crate) fn get(&self) -> &Arc<Segment> {
        &self.segment
    }
}

impl Drop for PinnedSegment {
    fn drop(&mut self) {
        self.segment.unpin();
    }
}

/// Result of scanning one frame out of a segment region.
#[derive(Debug)]
pub(crate) enum ScanOutcome {
    /// A complete, checksum-valid frame.
    Frame(Record),
    /// Reached the end of the scanned region.
    End,
    /// Partial frame: the region ends inside a header or payload.
    Torn {
        /// Description of what was missing.
        reason: String,
    },
    /// Checksum mismatch on a fully present frame.
    Corrupt {
        /// Checksum stored in the frame trailer.
        stored: u32,
        /// Checksum computed over the frame body.
        computed: u32,
    },
}

/// Buffered sequential frame reader over one segment's data area.
///
/// Scans `[position, limit)`. The caller chooses the limit (the completed
/// frontier for live reads, the raw file length for recovery scans) and
/// may extend it as more data becomes readable.
pub(crate) struct FrameScanner {
    segment: Arc<Segment>,
    position: u64,
    limit: u64,
    buf: Vec<u8>,
    buf_pos: u64,
}

impl FrameScanner {
    pub(crate) fn new(segment: Arc<Segment>, position: u64, limit: u64) -> Self {
        Self {
            segment,
            position,
            limit,
            buf: Vec::new(),
            buf_pos: 0,
        }
    }

    /// Current scan position within the data area.
    pub(crate) fn position(&self) -> u64 {
        self.position
    }

    /// Extends the readable region; never shrinks it.
    pub(crate) fn extend_limit(&mut self, limit: u64) {
        debug_assert!(limit >= self.limit);
        self.limit = limit;
    }

    pub(crate) fn limit(&self) -> u64 {
        self.limit
    }

    /// Returns up to `need` buffered bytes starting at the scan position,
    /// refilling from the file as required. Shorter than `need` only if the
    /// file itself ends early.
    fn ensure(&mut self, need: u64) -> std::io::Result<&[u8]> {
        let buffered_end = self.buf_pos + self.buf.len() as u64;
        if self.position < self.buf_pos || self.position + need > buffered_end {
            #[allow(clippy::cast_possible_truncation)] // bounded below by the region size; frames fit in memory
            let want = need.max(SCAN_CHUNK as u64).min(self.limit - self.position) as usize;
            self.buf.resize(want, 0);
            let n = self.segment.read_at(self.position, &mut self.buf)?;
            self.buf.truncate(n);
            self.buf_pos = self.position;
        }
        #[allow(clippy::cast_possible_truncation)] // position - buf_pos < buf.len() <= usize
        let start = (self.position - self.buf_pos) as usize;
        Ok(&self.buf[start..])
    }

    /// Scans the next frame.
    ///
    /// Does not advance past a torn or corrupt frame: the position stays at
    /// its start so recovery can truncate there.
    pub(crate) fn next(&mut self) -> std::io::Result<ScanOutcome> {
        let remaining = self.limit.saturating_sub(self.position);
        if remaining == 0 {
            return Ok(ScanOutcome::End);
        }
        if remaining < FRAME_HEADER_SIZE as u64 {
            return Ok(ScanOutcome::Torn {
                reason: format!(
                    "incomplete header: only {remaining} bytes remaining, need {FRAME_HEADER_SIZE}"
                ),
            });
        }

        let header = self.ensure(FRAME_HEADER_SIZE as u64)?;
        if header.len() < FRAME_HEADER_SIZE {
            return Ok(ScanOutcome::Torn {
                reason: "file ends inside a frame header".to_string(),
            });
        }
        let len = u64::from(u32::from_le_bytes([header[0], header[1], header[2], header[3]]));
        let frame_len = len + FRAME_OVERHEAD as u64;
        if frame_len > remaining {
            return Ok(ScanOutcome::Torn {
                reason: format!(
                    "incomplete data: frame of {frame_len} bytes, only {remaining} remaining"
                ),
            });
        }

        let frame = self.ensure(frame_len)?;
        if (frame.len() as u64) < frame_len {
            return Ok(ScanOutcome::Torn {
                reason: "file ends inside a frame body".to_string(),
            });
        }
        #[allow(clippy::cast_possible_truncation)] // frame_len <= buffered length
        match decode_frame(&frame[..frame_len as usize]) {
            FrameOutcome::Complete { record, .. } => {
                self.position += frame_len;
                Ok(ScanOutcome::Frame(record))
            }
            FrameOutcome::Corrupt { stored, computed } => {
                Ok(ScanOutcome::Corrupt { stored, computed })
            }
            // Length was validated against the region above.
            FrameOutcome::Incomplete => Ok(ScanOutcome::Torn {
                reason: "frame shorter than its declared length".to_string(),
            }),
        }
    }
}

/// Scanner state over one pinned segment.
struct SegmentScan {
    pinned: PinnedSegment,
    scanner: FrameScanner,
    /// Offset of the frame at the scanner position.
    scan_offset: u64,
}

impl SegmentScan {
    fn segment(&self) -> &Arc<Segment> {
        self.pinned.get()
    }
}

enum ReplayMode {
    /// Yield records below this offset, then end.
    UpTo(u64),
    /// Follow the durable watermark until the log closes.
    Tail,
}

/// Iterator over records in ascending offset order.
///
/// Created by `Wal::replay` (bounded at the durable end as of creation) or
/// `Wal::tail` (live-updating; its `next` blocks until more records become
/// durable or the log closes). Errors are terminal: after yielding an
/// `Err`, the iterator ends.
pub struct Replay {
    shared: Arc<Shared>,
    next_offset: u64,
    mode: ReplayMode,
    current: Option<SegmentScan>,
    finished: bool,
}

impl Replay {
    pub(crate) fn bounded(shared: Arc<Shared>, from: u64) -> Self {
        let up_to = shared.durability.durable_next();
        Self::new(shared, from, ReplayMode::UpTo(up_to))
    }

    pub(crate) fn bounded_to(shared: Arc<Shared>, from: u64, to: u64) -> Self {
        let up_to = shared.durability.durable_next().min(to);
        Self::new(shared, from, ReplayMode::UpTo(up_to))
    }

    pub(crate) fn tailing(shared: Arc<Shared>, from: u64) -> Self {
        Self::new(shared, from, ReplayMode::Tail)
    }

    fn new(shared: Arc<Shared>, from: u64, mode: ReplayMode) -> Self {
        // Reclaimed history cannot be replayed; start at the first offset
        // still retained.
        let first = shared.first_offset();
        let next_offset = from.max(first);
        if next_offset > from {
            tracing::debug!(
                requested = from,
                starting = next_offset,
                "replay start advanced past reclaimed segments"
            );
        }
        Self {
            shared,
            next_offset,
            mode,
            current: None,
            finished: false,
        }
    }

    /// Offset the next yielded record will have.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.next_offset
    }

    /// Positions `current` at the segment containing `next_offset`.
    ///
    /// Returns false if no such segment is readable yet (live tail during a
    /// rollover window).
    fn position_at_segment(&mut self) -> bool {
        if let Some(scan) = &self.current {
            let segment = scan.segment();
            let in_range = self.next_offset >= segment.base_offset()
                && (!segment.is_sealed() || self.next_offset < segment.end_offset());
            if in_range {
                return true;
            }
            self.current = None;
        }

        let Some(pinned) = self.shared.pin_segment_for(self.next_offset) else {
            return false;
        };
        let segment = Arc::clone(pinned.get());
        if segment.base_offset() > self.next_offset {
            // The requested range was reclaimed while iterating; resume at
            // the earliest segment still retained.
            tracing::debug!(
                requested = self.next_offset,
                starting = segment.base_offset(),
                "replay position advanced past reclaimed segments"
            );
            self.next_offset = segment.base_offset();
        }
        let frontier = segment.frontier();
        self.current = Some(SegmentScan {
            pinned,
            scanner: FrameScanner::new(Arc::clone(&segment), 0, frontier.bytes),
            scan_offset: segment.base_offset(),
        });
        true
    }

    /// Decodes and discards frames until the scanner stands at
    /// `next_offset`, or the readable region ends first.
    fn skip_to_start(&mut self) -> WalResult<()> {
        let Some(scan) = &mut self.current else {
            return Ok(());
        };
        while scan.scan_offset < self.next_offset {
            match scan.scanner.next()? {
                ScanOutcome::Frame(_) => scan.scan_offset += 1,
                ScanOutcome::End | ScanOutcome::Torn { .. } => return Ok(()),
                ScanOutcome::Corrupt { stored, computed } => {
                    return Err(integrity_error(scan.segment(), scan.scan_offset, stored, computed));
                }
            }
        }
        Ok(())
    }

    fn scan_next(&mut self) -> WalResult<Option<Record>> {
        loop {
            let visible_end = match self.mode {
                ReplayMode::UpTo(end) => end,
                ReplayMode::Tail => self.shared.durability.durable_next(),
            };
            if self.next_offset >= visible_end {
                match self.mode {
                    ReplayMode::UpTo(_) => return Ok(None),
                    ReplayMode::Tail => match self.shared.durability.wait_past(self.next_offset) {
                        WaitOutcome::Durable(_) => continue,
                        WaitOutcome::Closed => return Ok(None),
                    },
                }
            }

            if !self.position_at_segment() {
                // Durable data not yet published through the chain; only
                // possible in a brief rollover window.
                std::thread::yield_now();
                continue;
            }
            self.skip_to_start()?;

            let Some(scan) = self.current.as_mut() else {
                continue;
            };
            if scan.scan_offset < self.next_offset {
                // The readable region ended before the requested offset;
                // wait for the frontier to move and rescan.
                let frontier = scan.segment().frontier();
                if frontier.bytes > scan.scanner.limit() {
                    scan.scanner.extend_limit(frontier.bytes);
                    continue;
                }
                std::thread::yield_now();
                continue;
            }

            let segment = Arc::clone(scan.segment());
            match scan.scanner.next()? {
                ScanOutcome::Frame(record) => {
                    if record.offset != self.next_offset {
                        return Err(WalError::IntegrityViolation {
                            offset: self.next_offset,
                            segment_id: segment.id(),
                            reason: format!(
                                "frame carries offset {}, expected {}",
                                record.offset, self.next_offset
                            ),
                        });
                    }
                    scan.scan_offset += 1;
                    self.next_offset += 1;
                    return Ok(Some(record));
                }
                ScanOutcome::End | ScanOutcome::Torn { .. } => {
                    if segment.is_sealed() && self.next_offset >= segment.end_offset() {
                        // Exhausted this segment; move to its successor.
                        self.current = None;
                        continue;
                    }
                    let frontier = segment.frontier();
                    if frontier.bytes > scan.scanner.limit() {
                        scan.scanner.extend_limit(frontier.bytes);
                        continue;
                    }
                    if segment.is_sealed() {
                        // Durable records must be scannable; a sealed
                        // segment ending early is inconsistent.
                        return Err(WalError::IntegrityViolation {
                            offset: self.next_offset,
                            segment_id: segment.id(),
                            reason: "sealed segment ends before its recorded count".to_string(),
                        });
                    }
                    std::thread::yield_now();
                    continue;
                }
                ScanOutcome::Corrupt { stored, computed } => {
                    return Err(integrity_error(&segment, self.next_offset, stored, computed));
                }
            }
        }
    }
}

fn integrity_error(segment: &Segment, offset: u64, stored: u32, computed: u32) -> WalError {
    WalError::IntegrityViolation {
        offset,
        segment_id: segment.id(),
        reason: format!("checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"),
    }
}

impl Iterator for Replay {
    type Item = WalResult<Record>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.finished {
            return None;
        }
        match self.scan_next() {
            Ok(Some(record)) => Some(Ok(record)),
            Ok(None) => {
                self.finished = true;
                None
            }
            Err(e) => {
                self.finished = true;
                Some(Err(e))
            }
        }
    }
}

impl std::fmt::Debug for Replay {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Replay")
            .field("next_offset", &self.next_offset)
            .field("tailing", &matches!(self.mode, ReplayMode::Tail))
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::encode_frame;
    use tempfile::TempDir;

    fn segment_with_frames(payloads: &[&[u8]]) -> (Arc<Segment>, TempDir) {
        let temp_dir = TempDir::new().unwrap();
        let segment = Arc::new(Segment::create(temp_dir.path(), 0, 0, 1 << 20).unwrap());
        for (i, payload) in payloads.iter().enumerate() {
            let mut buf = Vec::new();
            encode_frame(&mut buf, i as u64, payload);
            let r = segment.try_reserve(buf.len() as u64).unwrap();
            segment.write_frame(r, &buf).unwrap();
            segment.mark_complete(r);
        }
        (segment, temp_dir)
    }

    #[test]
    fn test_scanner_reads_all_frames() {
        let (segment, _temp_dir) = segment_with_frames(&[b"a", b"bb", b"", b"dddd"]);
        let limit = segment.frontier().bytes;
        let mut scanner = FrameScanner::new(Arc::clone(&segment), 0, limit);

        let mut records = Vec::new();
        loop {
            match scanner.next().unwrap() {
                ScanOutcome::Frame(record) => records.push(record),
                ScanOutcome::End => break,
                other => panic!("unexpected outcome {other:?}"),
            }
        }
        assert_eq!(records.len(), 4);
        assert_eq!(records[0].payload.as_ref(), b"a");
        assert_eq!(records[2].payload.as_ref(), b"");
        assert_eq!(records[3].offset, 3);
        assert_eq!(scanner.position(), limit);
    }

    #[test]
    fn test_scanner_reports_torn_header() {
        let (segment, _temp_dir) = segment_with_frames(&[b"abc"]);
        let limit = segment.frontier().bytes;
        // Pretend the region ends 2 bytes past the last whole frame.
        let mut scanner = FrameScanner::new(Arc::clone(&segment), 0, limit + 2);

        assert!(matches!(scanner.next().unwrap(), ScanOutcome::Frame(_)));
        let before = scanner.position();
        match scanner.next().unwrap() {
            ScanOutcome::Torn { reason } => assert!(reason.contains("incomplete header")),
            other => panic!("expected Torn, got {other:?}"),
        }
        assert_eq!(scanner.position(), before, "torn frame must not advance");
    }

    #[test]
    fn test_scanner_reports_torn_body() {
        let (segment, _temp_dir) = segment_with_frames(&[b"abcdefgh"]);
        let limit = segment.frontier().bytes;
        // Cut inside the payload: header fits, body does not.
        let mut scanner = FrameScanner::new(Arc::clone(&segment), 0, limit - 3);
        match scanner.next().unwrap() {
            ScanOutcome::Torn { reason } => assert!(reason.contains("incomplete data")),
            other => panic!("expected Torn, got {other:?}"),
        }
    }

    #[test]
    fn test_scanner_reports_corruption() {
        let (segment, _temp_dir) = segment_with_frames(&[b"abc", b"def"]);
        let limit = segment.frontier().bytes;

        // Flip one payload byte of the first frame on disk.
        let r = crate::segment::Reservation {
            index: 0,
            position: FRAME_HEADER_SIZE as u64,
            len: 1,
        };
        segment.write_frame(r, b"X").unwrap();

        let mut scanner = FrameScanner::new(Arc::clone(&segment), 0, limit);
        match scanner.next().unwrap() {
            ScanOutcome::Corrupt { stored, computed } => assert_ne!(stored, computed),
            other => panic!("expected Corrupt, got {other:?}"),
        }
    }

    #[test]
    fn test_scanner_extend_limit() {
        let (segment, _temp_dir) = segment_with_frames(&[b"one", b"two"]);
        let limit = segment.frontier().bytes;
        let first_len = (FRAME_OVERHEAD + 3) as u64;

        let mut scanner = FrameScanner::new(Arc::clone(&segment), 0, first_len);
        assert!(matches!(scanner.next().unwrap(), ScanOutcome::Frame(_)));
        assert!(matches!(scanner.next().unwrap(), ScanOutcome::End));

        scanner.extend_limit(limit);
        match scanner.next().unwrap() {
            ScanOutcome::Frame(record) => assert_eq!(record.payload.as_ref(), b"two"),
            other => panic!("expected Frame, got {other:?}"),
        }
    }

    #[test]
    fn test_pin_guard_releases_on_drop() {
        let (segment, _temp_dir) = segment_with_frames(&[b"x"]);
        {
            let _pin = PinnedSegment::new(Arc::clone(&segment));
            assert!(segment.is_pinned());
        }
        assert!(!segment.is_pinned());
    }
}
