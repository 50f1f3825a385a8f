//! Reclamation of sealed segments that are no longer needed.
//!
//! Reclamation only ever removes a prefix of the sealed chain; anything
//! else would tear a hole in the offset space. A segment is eligible once
//! it is sealed, unpinned by every open replayer, and wholly below the
//! lowest offset any consumer still requires. Eligibility is evaluated
//! under the chain write lock, the same lock rollover uses to publish a new
//! active segment, so reclamation can never race a seal; anything
//! ambiguous is kept.

use std::time::SystemTime;

use tracing::{info, warn};

use crate::error::WalResult;
use crate::log::Shared;

/// Sentinel for "no consumer has registered a required offset yet".
pub(crate) const NO_CHECKPOINT: u64 = u64::MAX;

/// Runs one reclamation pass.
///
/// With `force` (admin `truncate_before`), every eligible segment is
/// reclaimed. Otherwise only the configured `max_age` / `max_total_bytes`
/// limits trigger reclamation, oldest first.
///
/// Returns the number of segments reclaimed.
pub(crate) fn run(shared: &Shared, force: bool) -> WalResult<usize> {
    let policy = &shared.config.retention;
    if !force && policy.max_total_bytes.is_none() && policy.max_age.is_none() {
        return Ok(0);
    }

    let lowest_required = shared.lowest_required();
    let now = SystemTime::now();

    let mut chain = shared.chain.write();
    let mut total_bytes: u64 = chain.sealed.iter().map(|s| s.file_len()).sum::<u64>()
        + chain.active.file_len();

    let mut reclaimed = 0usize;
    let mut freed_below = 0u64;
    for segment in &chain.sealed {
        let eligible = segment.is_sealed()
            && !segment.is_pinned()
            && segment.end_offset() <= lowest_required;
        if !eligible {
            break;
        }

        let over_age = policy.max_age.is_some_and(|max| {
            segment
                .sealed_at()
                .and_then(|t| now.duration_since(t).ok())
                .is_some_and(|age| age > max)
        });
        let over_bytes = policy
            .max_total_bytes
            .is_some_and(|max| total_bytes > max);
        if !(force || over_age || over_bytes) {
            break;
        }

        // Delete before unlinking from the chain so the in-memory chain
        // never references a file that might still be resurrected; stop at
        // the first failure to preserve the prefix property.
        if let Err(e) = std::fs::remove_file(segment.path()) {
            warn!(
                segment_id = segment.id(),
                path = %segment.path().display(),
                error = %e,
                "failed to reclaim segment"
            );
            break;
        }
        total_bytes -= segment.file_len();
        freed_below = segment.end_offset();
        reclaimed += 1;
    }
    chain.sealed.drain(..reclaimed);
    drop(chain);

    if reclaimed > 0 {
        crate::recovery::sync_dir(&shared.config.dir)?;
        info!(
            reclaimed,
            freed_below, "reclaimed sealed segments below required offset"
        );
    }
    Ok(reclaimed)
}
