//! Durability control: when an append is acknowledged as durable.
//!
//! The controller owns the durable watermark (the highest offset guaranteed
//! to survive a crash) and the policy that decides when to advance it.
//! Flushes are serialized; concurrent appenders that need the same flush
//! piggyback on whichever one reaches the flush lock first (group commit),
//! the rest wait on the watermark condvar.
//!
//! A failed sync poisons the controller: once `fsync` has failed, the state
//! of the page cache is unknown, so no later acknowledgment can be trusted.
//! Every subsequent flush and wait surfaces the latched error.

use std::io;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::config::DurabilityPolicy;
use crate::error::{WalError, WalResult};
use crate::segment::Segment;

/// Outcome of waiting for the watermark to move past an offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    /// The watermark advanced; all offsets below the value are durable.
    Durable(u64),
    /// The log closed before the offset became durable.
    Closed,
}

#[derive(Default)]
struct WatermarkState {
    /// Latched error from a failed sync, kept as (kind, message) because
    /// `io::Error` is not clonable.
    failed: Option<(io::ErrorKind, String)>,
    closed: bool,
}

/// Decides when buffered bytes are forced to stable storage and unblocks
/// waiting producers accordingly.
pub struct DurabilityController {
    policy: DurabilityPolicy,
    /// All offsets strictly below this are durable.
    durable_next: AtomicU64,
    /// Appends since the last flush, for `Batched` thresholds.
    appends_since_flush: AtomicU64,
    state: Mutex<WatermarkState>,
    watermark_moved: Condvar,
    /// Serializes flushes; holds nothing, exists for the critical section.
    flush_lock: Mutex<()>,
}

impl DurabilityController {
    /// Creates a controller with the durable watermark at `durable_next`
    /// (all recovered offsets are durable by definition).
    #[must_use]
    pub fn new(policy: DurabilityPolicy, durable_next: u64) -> Self {
        Self {
            policy,
            durable_next: AtomicU64::new(durable_next),
            appends_since_flush: AtomicU64::new(0),
            state: Mutex::new(WatermarkState::default()),
            watermark_moved: Condvar::new(),
            flush_lock: Mutex::new(()),
        }
    }

    /// The configured policy.
    #[must_use]
    pub fn policy(&self) -> &DurabilityPolicy {
        &self.policy
    }

    /// One past the highest durable offset.
    #[must_use]
    pub fn durable_next(&self) -> u64 {
        self.durable_next.load(Ordering::Acquire)
    }

    /// Notes one completed append; returns true if the caller should flush
    /// inline under the configured policy.
    pub fn note_append(&self) -> bool {
        match self.policy {
            DurabilityPolicy::EveryWrite => true,
            DurabilityPolicy::Batched { appends, .. } => {
                self.appends_since_flush.fetch_add(1, Ordering::AcqRel) + 1 >= appends
            }
            DurabilityPolicy::Periodic { .. } => false,
        }
    }

    /// Flushes if `offset` is not yet durable; skips entirely when a
    /// concurrent flush already covered it.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Io`] if a sync fails or has failed before.
    pub fn flush_for(&self, offset: u64, segments: &[Arc<Segment>]) -> WalResult<()> {
        if self.durable_next() > offset {
            return Ok(());
        }
        self.flush(segments).map(|_| ())
    }

    /// Forces completed writes to stable storage and advances the durable
    /// watermark over them.
    ///
    /// Returns the new watermark: one past the highest durable offset.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Io`] if a sync fails or has failed before; no
    /// acknowledgment is ever derived from a failed sync.
    pub fn flush(&self, segments: &[Arc<Segment>]) -> WalResult<u64> {
        let _guard = self.flush_lock.lock();
        self.check_latched()?;

        // Capture every frontier before syncing: only bytes completed
        // before the sync may count toward the watermark it publishes.
        let frontiers: Vec<_> = segments.iter().map(|s| s.frontier()).collect();

        for (segment, frontier) in segments.iter().zip(&frontiers) {
            if frontier.bytes > segment.synced_bytes() {
                if let Err(e) = segment.sync() {
                    self.latch_failure(&e);
                    return Err(WalError::Io(e));
                }
                segment.note_synced(frontier.bytes);
            }
        }

        let mut durable_next = self.durable_next();
        for (segment, frontier) in segments.iter().zip(&frontiers) {
            let covered = segment.base_offset() + frontier.records;
            durable_next = durable_next.max(covered);
            // A gap in this segment caps the contiguous watermark; later
            // segments only hold higher offsets.
            if !(segment.is_sealed() && frontier.records == segment.record_count()) {
                break;
            }
        }

        self.appends_since_flush.store(0, Ordering::Release);
        {
            let _state = self.state.lock();
            self.durable_next.fetch_max(durable_next, Ordering::AcqRel);
            self.watermark_moved.notify_all();
        }
        Ok(self.durable_next())
    }

    /// Blocks until `offset` is durable.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::Io`] if a sync failed, or [`WalError::Closed`]
    /// if the log closed before the offset became durable.
    pub fn wait_durable(&self, offset: u64) -> WalResult<()> {
        if self.durable_next() > offset {
            return Ok(());
        }
        let mut state = self.state.lock();
        loop {
            if let Some((kind, msg)) = &state.failed {
                return Err(WalError::Io(io::Error::new(*kind, msg.clone())));
            }
            if self.durable_next() > offset {
                return Ok(());
            }
            if state.closed {
                return Err(WalError::Closed);
            }
            self.watermark_moved.wait(&mut state);
        }
    }

    /// Blocks until the watermark moves past `offset` or the log closes.
    ///
    /// Used by tailing replayers, which treat close as end of stream rather
    /// than an error.
    pub fn wait_past(&self, offset: u64) -> WaitOutcome {
        let durable = self.durable_next();
        if durable > offset {
            return WaitOutcome::Durable(durable);
        }
        let mut state = self.state.lock();
        loop {
            let durable = self.durable_next();
            if durable > offset {
                return WaitOutcome::Durable(durable);
            }
            if state.closed || state.failed.is_some() {
                return WaitOutcome::Closed;
            }
            self.watermark_moved.wait(&mut state);
        }
    }

    /// Latches a write failure so waiters fail fast instead of waiting on
    /// a watermark that can no longer advance past the failed range.
    pub(crate) fn poison(&self, e: &io::Error) {
        self.latch_failure(e);
    }

    /// Marks the log closed and wakes every waiter.
    pub fn close(&self) {
        let mut state = self.state.lock();
        state.closed = true;
        self.watermark_moved.notify_all();
    }

    /// True once [`close`](Self::close) has been called.
    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    fn latch_failure(&self, e: &io::Error) {
        let mut state = self.state.lock();
        if state.failed.is_none() {
            tracing::warn!(error = %e, "sync failed; log poisoned, no further durability acknowledgments");
            state.failed = Some((e.kind(), e.to_string()));
        }
        self.watermark_moved.notify_all();
    }

    fn check_latched(&self) -> WalResult<()> {
        let state = self.state.lock();
        if let Some((kind, msg)) = &state.failed {
            return Err(WalError::Io(io::Error::new(*kind, msg.clone())));
        }
        Ok(())
    }
}

impl std::fmt::Debug for DurabilityController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DurabilityController")
            .field("policy", &self.policy)
            .field("durable_next", &self.durable_next())
            .finish_non_exhaustive()
    }
}
