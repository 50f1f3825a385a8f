//! Crash-safe opening of a log directory.
//!
//! Recovery discovers segment files by name, validates the chain of base
//! offsets, trusts the sealed header fields of sealed segments, and scans
//! only the last segment frame by frame. A torn or corrupt frame at the
//! scan point of the last segment is the crash tail: the file is truncated
//! there, the event is logged, and appending resumes at the offset after
//! the last complete record. The same condition in any earlier segment
//! aborts recovery with an integrity violation.

use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use fs2::FileExt;
use tracing::{debug, info, warn};

use crate::config::WalConfig;
use crate::error::{WalError, WalResult};
use crate::replay::{FrameScanner, ScanOutcome};
use crate::segment::{
    parse_segment_file_name, Segment, SegmentHeader, SEGMENT_HEADER_SIZE,
};

/// Name of the advisory lock file guarding a log directory.
pub const LOCK_FILE_NAME: &str = "weir.lock";

/// State assembled by opening a log directory.
pub(crate) struct RecoveredLog {
    /// Sealed segments in ascending offset order.
    pub(crate) sealed: Vec<Arc<Segment>>,
    /// Freshly created active segment.
    pub(crate) active: Arc<Segment>,
    /// Held for the lifetime of the log to keep the directory lock.
    pub(crate) lock_file: File,
}

impl RecoveredLog {
    /// Offset the next append will receive.
    pub(crate) fn next_offset(&self) -> u64 {
        self.active.base_offset()
    }
}

/// Opens `config.dir`, recovering whatever log state it holds.
pub(crate) fn open_dir(config: &WalConfig) -> WalResult<RecoveredLog> {
    std::fs::create_dir_all(&config.dir)?;
    let lock_file = acquire_lock(&config.dir)?;

    let mut files = list_segment_files(&config.dir)?;
    files.sort_by_key(|(id, _)| *id);

    let mut sealed: Vec<Arc<Segment>> = Vec::with_capacity(files.len());
    let mut next_offset = 0u64;
    let mut next_id = 0u64;

    let last_index = files.len().checked_sub(1);
    for (i, (id, path)) in files.iter().enumerate() {
        let is_last = Some(i) == last_index;
        let header = match Segment::read_header(path) {
            Ok(h) => h,
            Err(e @ WalError::InvalidSegment { .. }) if is_last => {
                // A segment publishes its header with a sync before any
                // append can reach it, so an invalid header on the last
                // file means it never held records.
                warn!(path = %path.display(), error = %e, "removing last segment with invalid header");
                std::fs::remove_file(path)?;
                sync_dir(&config.dir)?;
                break;
            }
            Err(e) => return Err(e),
        };
        if header.id != *id {
            return Err(WalError::InvalidSegment {
                path: path.clone(),
                reason: format!("header id {} does not match file name id {id}", header.id),
            });
        }
        if i > 0 && (*id != next_id || header.base_offset != next_offset) {
            return Err(WalError::IntegrityViolation {
                offset: next_offset,
                segment_id: *id,
                reason: format!(
                    "segment chain broken: expected id {next_id} at base offset {next_offset}, \
                     found id {id} at base offset {}",
                    header.base_offset
                ),
            });
        }
        if i == 0 {
            next_offset = header.base_offset;
        }

        let segment = if header.sealed {
            Arc::new(Segment::open(
                path,
                &header,
                header.sealed_count,
                header.sealed_cursor,
                true,
            )?)
        } else if is_last {
            recover_tail_segment(&config.dir, path, &header)?
        } else {
            return Err(WalError::IntegrityViolation {
                offset: header.base_offset,
                segment_id: header.id,
                reason: "unsealed segment has a successor".to_string(),
            });
        };

        next_offset = segment.end_offset();
        next_id = segment.id() + 1;
        sealed.push(segment);
    }

    let capacity = config.segment_data_capacity();
    let active = Arc::new(Segment::create(&config.dir, next_id, next_offset, capacity)?);
    sync_dir(&config.dir)?;

    info!(
        dir = %config.dir.display(),
        segments = sealed.len() + 1,
        next_offset,
        "opened log"
    );

    Ok(RecoveredLog {
        sealed,
        active,
        lock_file,
    })
}

/// Scans the unsealed last segment, truncates any crash tail, and returns
/// it sealed at its last complete record.
fn recover_tail_segment(
    dir: &Path,
    path: &Path,
    header: &SegmentHeader,
) -> WalResult<Arc<Segment>> {
    let file_len = std::fs::metadata(path)?.len();
    let data_len = file_len.saturating_sub(SEGMENT_HEADER_SIZE);

    let probe = Arc::new(Segment::open(path, header, 0, 0, false)?);
    let mut scanner = FrameScanner::new(Arc::clone(&probe), 0, data_len);
    let mut count = 0u64;

    let truncate_reason = loop {
        match scanner.next()? {
            ScanOutcome::Frame(record) => {
                let expected = header.base_offset + count;
                if record.offset != expected {
                    return Err(WalError::IntegrityViolation {
                        offset: expected,
                        segment_id: header.id,
                        reason: format!(
                            "frame carries offset {}, expected {expected}",
                            record.offset
                        ),
                    });
                }
                count += 1;
            }
            ScanOutcome::End => break None,
            ScanOutcome::Torn { reason } => break Some(reason),
            ScanOutcome::Corrupt { stored, computed } => {
                break Some(format!(
                    "checksum mismatch: stored {stored:#010x}, computed {computed:#010x}"
                ));
            }
        }
    };

    let cursor = scanner.position();
    drop(scanner);
    drop(probe);

    if let Some(reason) = truncate_reason {
        warn!(
            segment_id = header.id,
            offset = header.base_offset + count,
            discarded_bytes = data_len - cursor,
            reason = %reason,
            "crash tail truncated"
        );
        let file = OpenOptions::new().write(true).open(path)?;
        file.set_len(SEGMENT_HEADER_SIZE + cursor)?;
        file.sync_data()?;
        sync_dir(dir)?;
    } else {
        debug!(segment_id = header.id, records = count, "tail segment scanned clean");
    }

    // Seal in place: recovery never resumes appending into an inherited
    // segment, it opens a fresh one after it.
    let segment = Segment::open(path, header, count, cursor, false)?;
    segment.seal()?;
    Ok(Arc::new(segment))
}

fn list_segment_files(dir: &Path) -> WalResult<Vec<(u64, PathBuf)>> {
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        let name = entry.file_name();
        if let Some(id) = name.to_str().and_then(parse_segment_file_name) {
            files.push((id, entry.path()));
        }
    }
    Ok(files)
}

fn acquire_lock(dir: &Path) -> WalResult<File> {
    let path = dir.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .write(true)
        .open(&path)?;
    file.try_lock_exclusive().map_err(|_| WalError::Locked {
        path: dir.to_path_buf(),
    })?;
    Ok(file)
}

/// Syncs directory metadata so created, truncated, and deleted segment
/// files survive a crash.
#[cfg(unix)]
pub(crate) fn sync_dir(dir: &Path) -> std::io::Result<()> {
    File::open(dir)?.sync_all()
}

#[cfg(not(unix))]
pub(crate) fn sync_dir(_dir: &Path) -> std::io::Result<()> {
    // Windows has no directory handle sync; metadata updates are handled
    // by the filesystem.
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn config(dir: &Path) -> WalConfig {
        WalConfig::new(dir).with_segment_capacity(64 * 1024)
    }

    #[test]
    fn test_fresh_directory_starts_at_zero() {
        let temp_dir = TempDir::new().unwrap();
        let recovered = open_dir(&config(temp_dir.path())).unwrap();

        assert!(recovered.sealed.is_empty());
        assert_eq!(recovered.next_offset(), 0);
        assert_eq!(recovered.active.id(), 0);
        assert!(temp_dir.path().join(LOCK_FILE_NAME).exists());
    }

    #[test]
    fn test_directory_lock_is_exclusive() {
        let temp_dir = TempDir::new().unwrap();
        let first = open_dir(&config(temp_dir.path())).unwrap();

        assert!(matches!(
            open_dir(&config(temp_dir.path())),
            Err(WalError::Locked { .. })
        ));
        drop(first);
    }

    #[test]
    fn test_unrelated_files_are_ignored() {
        let temp_dir = TempDir::new().unwrap();
        std::fs::write(temp_dir.path().join("notes.txt"), b"not a segment").unwrap();

        let recovered = open_dir(&config(temp_dir.path())).unwrap();
        assert!(recovered.sealed.is_empty());
        assert_eq!(recovered.active.id(), 0);
    }

    #[test]
    fn test_last_segment_with_garbage_header_is_removed() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(crate::segment::segment_file_name(0));
        std::fs::write(&path, b"short").unwrap();

        let recovered = open_dir(&config(temp_dir.path())).unwrap();
        assert!(recovered.sealed.is_empty());
        assert_eq!(recovered.active.id(), 0);
    }

    #[test]
    fn test_reopen_seals_previous_active() {
        let temp_dir = TempDir::new().unwrap();
        {
            let recovered = open_dir(&config(temp_dir.path())).unwrap();
            // Write one record through the segment directly.
            let mut buf = Vec::new();
            crate::frame::encode_frame(&mut buf, 0, b"payload");
            let r = recovered.active.try_reserve(buf.len() as u64).unwrap();
            recovered.active.write_frame(r, &buf).unwrap();
            recovered.active.mark_complete(r);
            recovered.active.sync().unwrap();
        }

        let recovered = open_dir(&config(temp_dir.path())).unwrap();
        assert_eq!(recovered.sealed.len(), 1);
        assert!(recovered.sealed[0].is_sealed());
        assert_eq!(recovered.sealed[0].record_count(), 1);
        assert_eq!(recovered.next_offset(), 1);
        assert_eq!(recovered.active.id(), 1);
    }

    #[test]
    fn test_crash_tail_is_truncated() {
        let temp_dir = TempDir::new().unwrap();
        let seg_path;
        {
            let recovered = open_dir(&config(temp_dir.path())).unwrap();
            let mut buf = Vec::new();
            crate::frame::encode_frame(&mut buf, 0, b"whole");
            let r = recovered.active.try_reserve(buf.len() as u64).unwrap();
            recovered.active.write_frame(r, &buf).unwrap();
            recovered.active.mark_complete(r);
            recovered.active.sync().unwrap();
            seg_path = recovered.active.path().to_path_buf();
        }

        // Simulate a torn write: half a frame at the end of the file.
        {
            use std::io::Write;
            let mut file = OpenOptions::new().append(true).open(&seg_path).unwrap();
            file.write_all(&[0xFF, 0xFF, 0xFF]).unwrap();
            file.sync_all().unwrap();
        }
        let dirty_len = std::fs::metadata(&seg_path).unwrap().len();

        let recovered = open_dir(&config(temp_dir.path())).unwrap();
        assert_eq!(recovered.next_offset(), 1, "torn frame must be discarded");

        let clean_len = std::fs::metadata(&seg_path).unwrap().len();
        assert!(clean_len < dirty_len);
    }

    #[test]
    fn test_chain_gap_is_fatal() {
        let temp_dir = TempDir::new().unwrap();
        let cfg = config(temp_dir.path());
        // Each open seals the previous segment and creates the next, so
        // three opens leave sealed segments 0 and 1 plus unsealed 2.
        for _ in 0..3 {
            drop(open_dir(&cfg).unwrap());
        }
        std::fs::remove_file(temp_dir.path().join(crate::segment::segment_file_name(1)))
            .unwrap();

        assert!(matches!(
            open_dir(&cfg),
            Err(WalError::IntegrityViolation { .. })
        ));
    }
}
