#![forbid(unsafe_code)]
//! On-disk record codecs for the blockfile cache.
//!
//! Pure parsing crate: no I/O. Every record parses from a byte slice into a
//! typed structure and serializes back into the exact little-endian layout,
//! so directories written by other implementations of the format stay
//! readable.

pub mod block;
pub mod entry;
pub mod index;
pub mod stats;

pub use block::BlockFileHeader;
pub use entry::{EntryStore, RankingsNode};
pub use index::{IndexHeader, LruData, Operation};
pub use stats::{OnDiskStats, DATA_SIZES_LEN, NUM_COUNTERS, STATS_RECORD_SIZE};

use dc_error::DcError;
use dc_types::{CacheAddr, ParseError};

/// A record read from a live file failed to parse.
#[must_use]
pub fn corruption(addr: CacheAddr, err: &ParseError) -> DcError {
    DcError::Corruption {
        addr: addr.value(),
        detail: err.to_string(),
    }
}

/// A file header failed to parse while opening the cache.
#[must_use]
pub fn format_error(file: &str, err: &ParseError) -> DcError {
    DcError::Format(format!("{file}: {err}"))
}
