//! # Weir
//!
//! An embedded segmented write-ahead log.
//!
//! Weir accepts opaque records from concurrent producers, assigns each a
//! gap-free monotonic offset, persists them with CRC32C integrity
//! protection across capacity-bounded segment files, and replays them in
//! exact write order after a crash. It is the durability backbone for
//! higher-level systems (databases, state machines, message logs) that
//! must not lose acknowledged writes.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use weir::{DurabilityPolicy, Wal, WalConfig};
//!
//! # fn main() -> weir::WalResult<()> {
//! let config = WalConfig::new(std::path::Path::new("/data/wal"))
//!     .with_durability(DurabilityPolicy::EveryWrite);
//! let wal = Wal::open(config)?;
//!
//! // Concurrent producers share the handle by reference.
//! let offset = wal.append(b"first record")?;
//! assert_eq!(offset, 0);
//!
//! // Recovery or tailing: records come back in exact write order.
//! for record in wal.replay(0) {
//!     let record = record?;
//!     println!("{}: {:?}", record.offset, record.payload);
//! }
//!
//! // Tell retention what consumers no longer need.
//! wal.truncate_before(offset)?;
//! wal.close()?;
//! # Ok(())
//! # }
//! ```

#![deny(missing_docs)]
#![warn(clippy::all)]

// Re-export the engine's public surface.
pub use weir_core::*;

/// Commonly used types, importable in one line.
pub mod prelude {
    pub use weir_core::{
        DurabilityPolicy, Record, Replay, RetentionPolicy, Wal, WalConfig, WalError, WalResult,
    };
}
