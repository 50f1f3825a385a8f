//! Configuration for a log instance.

use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{WalError, WalResult};
use crate::frame::FRAME_OVERHEAD;
use crate::segment::{SEGMENT_HEADER_SIZE, MAX_SEGMENT_CAPACITY};

/// When an append is acknowledged as durable.
///
/// A closed set of variants selected at configuration time; each implements
/// the same "when is offset O durable" predicate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DurabilityPolicy {
    /// Flush after each append before acknowledging.
    ///
    /// Strongest guarantee, highest latency.
    EveryWrite,
    /// Flush after every `appends` appends or when `interval` elapses,
    /// whichever comes first.
    Batched {
        /// Appends accumulated before an inline flush.
        appends: u64,
        /// Time budget before the background flusher steps in.
        interval: Duration,
    },
    /// Background flush on a fixed interval, independent of append rate.
    ///
    /// Appends return immediately with a not-yet-durable acknowledgment;
    /// callers may wait explicitly via `Wal::wait_durable`.
    Periodic {
        /// Flush interval.
        interval: Duration,
    },
}

impl DurabilityPolicy {
    /// Returns true if appends must block until their offset is durable.
    #[must_use]
    pub fn acknowledges_durable(&self) -> bool {
        !matches!(self, DurabilityPolicy::Periodic { .. })
    }

    /// Returns the background flush interval for this policy, if any.
    #[must_use]
    pub fn flush_interval(&self) -> Option<Duration> {
        match self {
            DurabilityPolicy::EveryWrite => None,
            DurabilityPolicy::Batched { interval, .. }
            | DurabilityPolicy::Periodic { interval } => Some(*interval),
        }
    }
}

impl Default for DurabilityPolicy {
    fn default() -> Self {
        DurabilityPolicy::Batched {
            appends: 64,
            interval: Duration::from_millis(5),
        }
    }
}

/// Limits on how much sealed history is kept before reclamation.
///
/// Both limits are advisory upper bounds; a segment is only ever reclaimed
/// once its whole offset range falls below the externally supplied
/// checkpoint (see `Wal::truncate_before`).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RetentionPolicy {
    /// Reclaim oldest sealed segments once total log size exceeds this.
    pub max_total_bytes: Option<u64>,
    /// Reclaim sealed segments older than this.
    pub max_age: Option<Duration>,
}

impl RetentionPolicy {
    /// Keeps every sealed segment until explicitly truncated.
    #[must_use]
    pub fn keep_all() -> Self {
        Self::default()
    }
}

/// Configuration for a [`crate::Wal`] instance.
#[derive(Debug, Clone)]
pub struct WalConfig {
    /// Directory holding segment files and the lock file.
    pub dir: PathBuf,
    /// Capacity of each segment file in bytes, including its header.
    pub segment_capacity_bytes: u64,
    /// Durability policy applied to appends.
    pub durability: DurabilityPolicy,
    /// Retention limits for sealed segments.
    pub retention: RetentionPolicy,
}

impl WalConfig {
    /// Default segment capacity (64 MiB).
    pub const DEFAULT_SEGMENT_CAPACITY: u64 = 64 * 1024 * 1024;

    /// Creates a configuration rooted at `dir` with defaults.
    #[must_use]
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            segment_capacity_bytes: Self::DEFAULT_SEGMENT_CAPACITY,
            durability: DurabilityPolicy::default(),
            retention: RetentionPolicy::default(),
        }
    }

    /// Sets the per-segment capacity in bytes.
    #[must_use]
    pub fn with_segment_capacity(mut self, bytes: u64) -> Self {
        self.segment_capacity_bytes = bytes;
        self
    }

    /// Sets the durability policy.
    #[must_use]
    pub fn with_durability(mut self, policy: DurabilityPolicy) -> Self {
        self.durability = policy;
        self
    }

    /// Sets the retention policy.
    #[must_use]
    pub fn with_retention(mut self, retention: RetentionPolicy) -> Self {
        self.retention = retention;
        self
    }

    /// Bytes available for frames in one segment under this configuration.
    #[must_use]
    pub fn segment_data_capacity(&self) -> u64 {
        self.segment_capacity_bytes.saturating_sub(SEGMENT_HEADER_SIZE)
    }

    /// Largest payload a single segment can hold.
    #[must_use]
    pub fn max_payload_len(&self) -> usize {
        usize::try_from(self.segment_data_capacity().saturating_sub(FRAME_OVERHEAD as u64))
            .unwrap_or(usize::MAX)
    }

    /// Validates the configuration.
    ///
    /// # Errors
    ///
    /// Returns [`WalError::InvalidConfig`] if the segment capacity cannot
    /// hold at least one empty frame, exceeds the addressable maximum, or a
    /// policy parameter is degenerate.
    pub fn validate(&self) -> WalResult<()> {
        if self.segment_capacity_bytes < SEGMENT_HEADER_SIZE + FRAME_OVERHEAD as u64 {
            return Err(WalError::InvalidConfig(format!(
                "segment_capacity_bytes {} cannot hold a segment header and one frame",
                self.segment_capacity_bytes
            )));
        }
        if self.segment_data_capacity() > MAX_SEGMENT_CAPACITY {
            return Err(WalError::InvalidConfig(format!(
                "segment_capacity_bytes {} exceeds the {MAX_SEGMENT_CAPACITY}-byte segment limit",
                self.segment_capacity_bytes
            )));
        }
        if let DurabilityPolicy::Batched { appends, .. } = self.durability {
            if appends == 0 {
                return Err(WalError::InvalidConfig(
                    "Batched durability requires at least one append per batch".to_string(),
                ));
            }
        }
        Ok(())
    }
}
