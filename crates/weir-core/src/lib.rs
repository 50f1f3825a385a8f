//! # Weir Core
//!
//! Segmented write-ahead log engine: the durability backbone for systems
//! that must survive crashes without losing acknowledged writes.
//!
//! ## Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          Write path                            │
//! │                                                                │
//! │  producer A ─┐                                                 │
//! │  producer B ─┼─► reserve ──► write frame ──► mark ──► durable  │
//! │  producer C ─┘   (1 CAS)     (disjoint,      complete  wait    │
//! │                              positional)                       │
//! │                       │                                        │
//! │                       ▼ segment full                           │
//! │                  ┌─────────┐    seal + create next             │
//! │                  │ roller  │───────────────────────► segments  │
//! │                  └─────────┘                         on disk   │
//! │                                                                │
//! │  replayer ──► locate segment by base offset ──► scan frames    │
//! │  retention ──► reclaim sealed prefix below checkpoint          │
//! └────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core invariants
//!
//! - Offsets are gap-free and monotonic: N appends yield exactly the
//!   offsets `{base, …, base + N − 1}`, under any interleaving.
//! - Segments are contiguous in offset space: each segment's last offset
//!   plus one is its successor's base offset.
//! - A record is acknowledged durable only after its frame, and every
//!   frame before it, is fully written and synced.
//! - Replay yields records in exact offset order and fails loudly on any
//!   integrity violation outside the crash tail.
//!
//! ## Example
//!
//! ```rust,no_run
//! use weir_core::{Wal, WalConfig};
//!
//! # fn main() -> weir_core::WalResult<()> {
//! let wal = Wal::open(WalConfig::new(std::path::Path::new("/data/wal")))?;
//!
//! let offset = wal.append(b"state change")?;
//! assert_eq!(offset, 0);
//!
//! for record in wal.replay(0) {
//!     let record = record?;
//!     println!("{}: {} bytes", record.offset, record.payload.len());
//! }
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

/// Configuration: segment sizing, durability policy, retention limits.
pub mod config;

/// Error types for log operations.
pub mod error;

/// Record frame codec: length-prefixed, checksummed on-storage encoding.
pub mod frame;

/// The log facade: appending, rollover, and the admin surface.
pub mod log;

/// Sequential read path: bounded replay and live tailing.
pub mod replay;

/// Capacity-bounded, append-only segment files.
pub mod segment;

mod durability;
mod recovery;
mod retention;

// Re-export the primary API surface.
pub use config::{DurabilityPolicy, RetentionPolicy, WalConfig};
pub use error::{WalError, WalResult};
pub use frame::Record;
pub use log::Wal;
pub use replay::Replay;
