//! The log facade: concurrent appends, rollover, and the admin surface.
//!
//! ## Write path
//!
//! ```text
//! append ──► reserve (one CAS on the active segment)
//!        ──► encode frame ──► positional write, no lock
//!        ──► mark complete ──► durability policy ──► offset
//! ```
//!
//! The only contended step is the reservation. When the active segment
//! cannot fit a frame, the appender enters the roller: a mutex serializes
//! rollover, the losing racers re-check the active segment and retry their
//! reservation. Rollover is a storage-layout event only; the offset space
//! is untouched by it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use parking_lot::{Condvar, Mutex, RwLock};
use tracing::{debug, warn};

use crate::config::WalConfig;
use crate::durability::DurabilityController;
use crate::error::{WalError, WalResult};
use crate::frame::{encode_frame, encoded_frame_len};
use crate::recovery;
use crate::replay::{PinnedSegment, Replay};
use crate::retention;
use crate::segment::{Reservation, Segment};

/// Ordered set of segments: a sealed prefix plus the one active segment.
pub(crate) struct Chain {
    /// Sealed segments in ascending offset order.
    pub(crate) sealed: Vec<Arc<Segment>>,
    /// The segment currently accepting reservations.
    pub(crate) active: Arc<Segment>,
}

impl Chain {
    fn snapshot(&self) -> Vec<Arc<Segment>> {
        let mut all = Vec::with_capacity(self.sealed.len() + 1);
        all.extend(self.sealed.iter().cloned());
        all.push(Arc::clone(&self.active));
        all
    }

    fn first_offset(&self) -> u64 {
        self.sealed
            .first()
            .map_or(self.active.base_offset(), |s| s.base_offset())
    }
}

/// State shared between the facade, replayers, and the flusher thread.
pub(crate) struct Shared {
    pub(crate) config: WalConfig,
    pub(crate) chain: RwLock<Chain>,
    /// Serializes rollover so two segments can never be active at once.
    roll_lock: Mutex<()>,
    pub(crate) durability: DurabilityController,
    /// Lowest offset still required by a consumer; `NO_CHECKPOINT` until
    /// `truncate_before` supplies one.
    lowest_required: AtomicU64,
    closed: AtomicBool,
    /// Flusher shutdown flag and its wakeup, under one mutex.
    flusher_stop: Mutex<bool>,
    flusher_wakeup: Condvar,
    /// Held open to keep the directory's advisory lock.
    _lock_file: std::fs::File,
}

impl Shared {
    pub(crate) fn chain_snapshot(&self) -> Vec<Arc<Segment>> {
        self.chain.read().snapshot()
    }

    pub(crate) fn first_offset(&self) -> u64 {
        self.chain.read().first_offset()
    }

    pub(crate) fn lowest_required(&self) -> u64 {
        self.lowest_required.load(Ordering::Acquire)
    }

    /// Pins the segment containing `offset`, or the earliest one after it
    /// if that range was reclaimed. The pin is taken under the chain lock,
    /// so retention either sees it or never handed out this segment.
    pub(crate) fn pin_segment_for(&self, offset: u64) -> Option<PinnedSegment> {
        let chain = self.chain.read();
        if offset >= chain.active.base_offset() {
            return Some(PinnedSegment::new(Arc::clone(&chain.active)));
        }
        chain
            .sealed
            .iter()
            .find(|s| offset < s.end_offset())
            .map(|s| PinnedSegment::new(Arc::clone(s)))
            .or_else(|| Some(PinnedSegment::new(Arc::clone(&chain.active))))
    }
}

/// A durable, sequentially-ordered record log.
///
/// Accepts variable-length records from concurrent producers, assigns each
/// a gap-free monotonic offset, persists them with CRC32C integrity
/// protection across capacity-bounded segment files, and replays them in
/// exact write order.
///
/// All methods take `&self`; the handle is `Send + Sync` and appends scale
/// across threads: allocation contends on a single atomic advance.
pub struct Wal {
    shared: Arc<Shared>,
    flusher: Option<thread::JoinHandle<()>>,
}

impl Wal {
    /// Opens (and if necessary recovers) the log in `config.dir`.
    ///
    /// A fresh directory starts at offset 0. Reopening an existing log
    /// seals the previous active segment, truncates any crash tail, and
    /// resumes the offset sequence after the last complete record.
    ///
    /// # Errors
    ///
    /// Returns an error on invalid configuration, a held directory lock, a
    /// broken segment chain, or IO failure.
    pub fn open(config: WalConfig) -> WalResult<Self> {
        config.validate()?;
        let recovered = recovery::open_dir(&config)?;
        let durable_next = recovered.next_offset();

        let durability = DurabilityController::new(config.durability.clone(), durable_next);
        let shared = Arc::new(Shared {
            chain: RwLock::new(Chain {
                sealed: recovered.sealed,
                active: recovered.active,
            }),
            roll_lock: Mutex::new(()),
            durability,
            lowest_required: AtomicU64::new(retention::NO_CHECKPOINT),
            closed: AtomicBool::new(false),
            flusher_stop: Mutex::new(false),
            flusher_wakeup: Condvar::new(),
            _lock_file: recovered.lock_file,
            config,
        });

        let flusher = match shared.config.durability.flush_interval() {
            Some(interval) => Some(spawn_flusher(Arc::clone(&shared), interval)?),
            None => None,
        };

        Ok(Self { shared, flusher })
    }

    /// Appends a record, returning its assigned offset.
    ///
    /// Blocks until the configured durability policy acknowledges the
    /// record, except under `Periodic`, which returns as soon as the
    /// frame is written; use [`wait_durable`](Self::wait_durable) or
    /// [`append_await_durable`](Self::append_await_durable) to wait.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::CapacityExceeded`] for a payload no segment can
    /// hold (never retried), or [`WalError::Io`] on write/flush failure.
    pub fn append(&self, payload: &[u8]) -> WalResult<u64> {
        let offset = self.append_inner(payload)?;
        if self.shared.durability.policy().acknowledges_durable() {
            self.shared.durability.wait_durable(offset)?;
        }
        Ok(offset)
    }

    /// Appends a record and blocks until it is durable regardless of the
    /// configured policy.
    ///
    /// # Errors
    ///
    /// Same as [`append`](Self::append).
    pub fn append_await_durable(&self, payload: &[u8]) -> WalResult<u64> {
        let offset = self.append_inner(payload)?;
        self.shared.durability.wait_durable(offset)?;
        Ok(offset)
    }

    fn append_inner(&self, payload: &[u8]) -> WalResult<u64> {
        if self.shared.closed.load(Ordering::Acquire) {
            return Err(WalError::Closed);
        }
        let max_payload = self.shared.config.max_payload_len();
        if payload.len() > max_payload {
            return Err(WalError::CapacityExceeded {
                payload_len: payload.len(),
                max_payload,
            });
        }

        let frame_len = encoded_frame_len(payload.len()) as u64;
        let (segment, reservation) = self.reserve(frame_len)?;
        let offset = segment.base_offset() + reservation.index;

        let mut buf = Vec::with_capacity(encoded_frame_len(payload.len()));
        encode_frame(&mut buf, offset, payload);

        if let Err(e) = segment.write_frame(reservation, &buf) {
            // The reserved range now holds unknown bytes; the completion
            // frontier stalls there and the watermark can never pass it.
            self.shared.durability.poison(&e);
            return Err(e.into());
        }
        segment.mark_complete(reservation);

        if self.shared.durability.note_append() {
            let snapshot = self.shared.chain_snapshot();
            self.shared.durability.flush_for(offset, &snapshot)?;
        }
        Ok(offset)
    }

    /// Reserves space in the active segment, rolling over as needed.
    fn reserve(&self, frame_len: u64) -> WalResult<(Arc<Segment>, Reservation)> {
        loop {
            let active = Arc::clone(&self.shared.chain.read().active);
            if let Some(reservation) = active.try_reserve(frame_len) {
                return Ok((active, reservation));
            }
            self.roll_from(&active)?;
        }
    }

    /// Seals `full` and activates its successor. Exactly one caller wins a
    /// given rollover; losers observe the changed active segment and simply
    /// retry their reservation.
    fn roll_from(&self, full: &Arc<Segment>) -> WalResult<()> {
        let shared = &self.shared;
        let _guard = shared.roll_lock.lock();

        let current = Arc::clone(&shared.chain.read().active);
        if current.id() != full.id() {
            // Lost the rollover race; the new active segment is in place.
            return Ok(());
        }

        let end = current.seal()?;
        let next = Segment::create(
            &shared.config.dir,
            current.id() + 1,
            current.base_offset() + end.records,
            shared.config.segment_data_capacity(),
        )?;
        recovery::sync_dir(&shared.config.dir)?;

        {
            let mut chain = shared.chain.write();
            chain.sealed.push(Arc::clone(&current));
            chain.active = Arc::new(next);
        }
        debug!(
            sealed_id = current.id(),
            sealed_records = end.records,
            next_base_offset = current.base_offset() + end.records,
            "rolled over to new segment"
        );

        if let Err(e) = retention::run(shared, false) {
            warn!(error = %e, "retention pass after rollover failed");
        }
        Ok(())
    }

    /// Forces a rollover: seals the active segment and opens a new one.
    ///
    /// # Errors
    ///
    /// Returns an error if sealing or creating the successor fails.
    pub fn seal(&self) -> WalResult<()> {
        let active = Arc::clone(&self.shared.chain.read().active);
        self.roll_from(&active)
    }

    /// Forces completed writes to stable storage now.
    ///
    /// Returns the durable watermark: one past the highest durable offset.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Io`] if the sync fails.
    pub fn flush(&self) -> WalResult<u64> {
        let snapshot = self.shared.chain_snapshot();
        self.shared.durability.flush(&snapshot)
    }

    /// Blocks until `offset` is durable under the active policy.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Io`] if a flush failed, or [`WalError::Closed`]
    /// if the log closed first.
    pub fn wait_durable(&self, offset: u64) -> WalResult<()> {
        self.shared.durability.wait_durable(offset)
    }

    /// Registers `offset` as the lowest offset any consumer still needs
    /// and immediately reclaims sealed segments wholly below it.
    ///
    /// The checkpoint is monotonic: a lower value than a previous call is
    /// ignored.
    ///
    /// Returns the number of segments reclaimed.
    ///
    /// # Errors
    ///
    /// Returns an error if directory metadata cannot be synced after
    /// deletion.
    pub fn truncate_before(&self, offset: u64) -> WalResult<usize> {
        self.shared
            .lowest_required
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                if current == retention::NO_CHECKPOINT || offset > current {
                    Some(offset)
                } else {
                    None
                }
            })
            .ok();
        retention::run(&self.shared, true)
    }

    /// Replays records in `[from, durable end)` in ascending offset order.
    #[must_use]
    pub fn replay(&self, from: u64) -> Replay {
        Replay::bounded(Arc::clone(&self.shared), from)
    }

    /// Replays records in `[from, to)`, still bounded at the durable end.
    #[must_use]
    pub fn replay_range(&self, from: u64, to: u64) -> Replay {
        Replay::bounded_to(Arc::clone(&self.shared), from, to)
    }

    /// Live-updating replay: follows the durable watermark, blocking for
    /// more records until the log is closed.
    #[must_use]
    pub fn tail(&self, from: u64) -> Replay {
        Replay::tailing(Arc::clone(&self.shared), from)
    }

    /// Offset the next appended record will receive.
    #[must_use]
    pub fn next_offset(&self) -> u64 {
        self.shared.chain.read().active.end_offset()
    }

    /// One past the highest durable offset.
    #[must_use]
    pub fn durable_next(&self) -> u64 {
        self.shared.durability.durable_next()
    }

    /// Lowest offset still retained in the log.
    #[must_use]
    pub fn first_offset(&self) -> u64 {
        self.shared.first_offset()
    }

    /// Number of records currently retained in the log.
    #[must_use]
    pub fn record_count(&self) -> u64 {
        let chain = self.shared.chain.read();
        chain.active.end_offset() - chain.first_offset()
    }

    /// Number of segments currently on disk, the active one included.
    #[must_use]
    pub fn segment_count(&self) -> usize {
        self.shared.chain.read().sealed.len() + 1
    }

    /// The configuration this log was opened with.
    #[must_use]
    pub fn config(&self) -> &WalConfig {
        &self.shared.config
    }

    /// Seals the active segment, flushes, and releases the directory.
    ///
    /// Dropping the handle does the same, logging instead of returning
    /// any error.
    ///
    /// # Errors
    ///
    /// Returns an error if the final seal or flush fails.
    pub fn close(mut self) -> WalResult<()> {
        self.close_inner()
    }

    fn close_inner(&mut self) -> WalResult<()> {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return Ok(());
        }

        {
            let mut stop = self.shared.flusher_stop.lock();
            *stop = true;
            self.shared.flusher_wakeup.notify_all();
        }
        if let Some(handle) = self.flusher.take() {
            let _ = handle.join();
        }

        let active = Arc::clone(&self.shared.chain.read().active);
        let seal_result = active.seal();
        let flush_result = self.shared.durability.flush(&self.shared.chain_snapshot());
        self.shared.durability.close();

        seal_result?;
        flush_result?;
        Ok(())
    }
}

impl Drop for Wal {
    fn drop(&mut self) {
        if let Err(e) = self.close_inner() {
            warn!(error = %e, "error while closing log");
        }
    }
}

impl std::fmt::Debug for Wal {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Wal")
            .field("dir", &self.shared.config.dir)
            .field("next_offset", &self.next_offset())
            .field("durable_next", &self.durable_next())
            .field("segments", &self.segment_count())
            .finish_non_exhaustive()
    }
}

fn spawn_flusher(shared: Arc<Shared>, interval: Duration) -> std::io::Result<thread::JoinHandle<()>> {
    thread::Builder::new()
        .name("weir-flusher".to_string())
        .spawn(move || {
            let mut stop = shared.flusher_stop.lock();
            loop {
                if *stop {
                    break;
                }
                let _ = shared.flusher_wakeup.wait_for(&mut stop, interval);
                if *stop {
                    break;
                }
                drop(stop);

                let snapshot = shared.chain_snapshot();
                if let Err(e) = shared.durability.flush(&snapshot) {
                    warn!(error = %e, "background flush failed");
                }
                if let Err(e) = retention::run(&shared, false) {
                    warn!(error = %e, "background retention pass failed");
                }

                stop = shared.flusher_stop.lock();
            }
        })
}
