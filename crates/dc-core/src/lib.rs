#![forbid(unsafe_code)]
//! Blockfile disk cache backend.
//!
//! A cache directory holds an `index` file of hash buckets, four block
//! files of fixed-size records (`data_0` .. `data_3`, chained to more when
//! they fill up) and one `f_xxxxxx` file per stream too large for a block.
//! Entries hang off the index in per-bucket chains and sit on ranking lists
//! that drive eviction.
//!
//! All of it is owned by one cache thread. [`DiskCache`] and [`Entry`]
//! queue work there and hand back [`Pending`] completions, which are
//! futures and can also be waited on from plain threads.

mod backend;
mod buffer;
mod config;
mod engine;
mod entry;
mod handle;
mod inflight;
mod stats;

pub use backend::BackendState;
pub use config::{BackendConfig, BackendFlags, EvictionKind};
pub use handle::{DiskCache, Entry, Enumeration};
pub use inflight::Pending;
pub use stats::Counter;

pub use dc_block::{DirStorage, MemStorage, Storage};
pub use dc_error::{CheckError, DcError, Result};
pub use dc_types::{CacheAddr, DEFAULT_CACHE_SIZE, NUM_STREAMS};
