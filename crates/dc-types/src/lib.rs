#![forbid(unsafe_code)]

mod addr;
mod hash;

pub use addr::{CacheAddr, FileType};
pub use hash::super_fast_hash;

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use thiserror::Error;

// ── File format constants ───────────────────────────────────────────────────

pub const INDEX_MAGIC: u32 = 0xC103_CAC3;
pub const BLOCK_MAGIC: u32 = 0xC104_CAC3;
/// Format 2.0: single eviction list.
pub const CURRENT_VERSION: u32 = 0x0002_0000;
/// Format 2.1: tiered eviction lists in use.
pub const VERSION_2_1: u32 = 0x0002_0001;

pub const INDEX_FILE_NAME: &str = "index";
pub const INDEX_HEADER_SIZE: usize = 368;
/// Default number of index buckets.
pub const BASE_TABLE_LEN: u32 = 0x1_0000;
/// Storage handled comfortably by a [`BASE_TABLE_LEN`] table.
pub const STORAGE_PER_BASE_TABLE: i64 = 240 * 1000 * 1000;

pub const BLOCK_HEADER_SIZE: usize = 8192;
/// Bytes in the block file header before the allocation bitmap.
pub const BLOCK_HEADER_FIELDS: usize = 80;
/// Blocks addressable by one block file.
pub const MAX_BLOCKS: u32 = ((BLOCK_HEADER_SIZE - BLOCK_HEADER_FIELDS) * 8) as u32;
/// Largest record, in blocks.
pub const MAX_NUM_BLOCKS: u32 = 4;
/// Blocks added each time a block file grows.
pub const NUM_EXTRA_BLOCKS: u32 = 1024;
pub const FIRST_ADDITIONAL_BLOCK_FILE: u32 = 4;
pub const MAX_BLOCK_FILE: u32 = 255;

/// Largest stream kept in block files; bigger streams use external files.
pub const MAX_BLOCK_SIZE: i32 = 4096 * 4;
pub const NUM_STREAMS: usize = 4;

pub const ENTRY_STORE_SIZE: usize = 256;
pub const RANKINGS_NODE_SIZE: usize = 36;
/// Key bytes available in the first entry block.
pub const INLINE_KEY_LEN: usize = 160;
/// Longest key kept inside the entry blocks (4 blocks, NUL terminated).
pub const MAX_INTERNAL_KEY_LENGTH: i32 = (4 * ENTRY_STORE_SIZE - (ENTRY_STORE_SIZE - INLINE_KEY_LEN) - 1) as i32;

pub const STATS_SIGNATURE: u32 = 0xF014_27E0;

pub const DEFAULT_CACHE_SIZE: i32 = 80 * 1024 * 1024;

/// Number of ranking lists stored in the index header.
pub const LIST_COUNT: usize = 5;

/// Microseconds between 1601-01-01 and 1970-01-01.
const WINDOWS_EPOCH_DELTA_MICROS: u64 = 11_644_473_600_000_000;

// ── Newtypes ────────────────────────────────────────────────────────────────

/// Timestamp stored on disk: microseconds since 1601-01-01 UTC.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct CacheTime(pub u64);

impl CacheTime {
    pub const NULL: Self = Self(0);

    #[must_use]
    pub fn now() -> Self {
        Self::from_system_time(SystemTime::now())
    }

    #[must_use]
    pub fn from_system_time(time: SystemTime) -> Self {
        let since_unix = time.duration_since(UNIX_EPOCH).unwrap_or(Duration::ZERO);
        let micros = u64::try_from(since_unix.as_micros()).unwrap_or(u64::MAX);
        Self(micros.saturating_add(WINDOWS_EPOCH_DELTA_MICROS))
    }

    #[must_use]
    pub fn to_system_time(self) -> SystemTime {
        let micros = self.0.saturating_sub(WINDOWS_EPOCH_DELTA_MICROS);
        UNIX_EPOCH + Duration::from_micros(micros)
    }

    #[must_use]
    pub fn is_null(self) -> bool {
        self.0 == 0
    }

    /// Whole hours elapsed from `self` to `later` (0 if `later` is earlier).
    #[must_use]
    pub fn hours_until(self, later: Self) -> u64 {
        later.0.saturating_sub(self.0) / 3_600_000_000
    }

    #[must_use]
    pub fn saturating_add(self, duration: Duration) -> Self {
        let micros = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        Self(self.0.saturating_add(micros))
    }
}

impl fmt::Display for CacheTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Lifecycle state stored in the entry header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EntryState {
    Normal,
    /// Data freed by eviction; the header is kept on the deleted list.
    Evicted,
    Doomed,
}

impl EntryState {
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::Normal),
            1 => Some(Self::Evicted),
            2 => Some(Self::Doomed),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> i32 {
        match self {
            Self::Normal => 0,
            Self::Evicted => 1,
            Self::Doomed => 2,
        }
    }
}

/// Ranking list identifier (slot in `LruData`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum List {
    NoUse,
    LowUse,
    HighUse,
    Reserved,
    Deleted,
}

impl List {
    pub const ALL: [Self; LIST_COUNT] = [
        Self::NoUse,
        Self::LowUse,
        Self::HighUse,
        Self::Reserved,
        Self::Deleted,
    ];

    /// Lists that hold live entries and are walked by enumeration.
    pub const LIVE: [Self; 3] = [Self::NoUse, Self::LowUse, Self::HighUse];

    #[must_use]
    pub fn index(self) -> usize {
        match self {
            Self::NoUse => 0,
            Self::LowUse => 1,
            Self::HighUse => 2,
            Self::Reserved => 3,
            Self::Deleted => 4,
        }
    }

    #[must_use]
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::NoUse => "no_use",
            Self::LowUse => "low_use",
            Self::HighUse => "high_use",
            Self::Reserved => "reserved",
            Self::Deleted => "deleted",
        }
    }
}

impl fmt::Display for List {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// ── Parse helpers ───────────────────────────────────────────────────────────

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParseError {
    #[error("insufficient data: need {needed} bytes at offset {offset}, got {actual}")]
    InsufficientData {
        needed: usize,
        offset: usize,
        actual: usize,
    },
    #[error("invalid magic: expected {expected:#x}, got {actual:#x}")]
    InvalidMagic { expected: u64, actual: u64 },
    #[error("invalid field: {field} ({reason})")]
    InvalidField {
        field: &'static str,
        reason: &'static str,
    },
    #[error("integer conversion failed: {field}")]
    IntegerConversion { field: &'static str },
}

#[inline]
pub fn ensure_slice(data: &[u8], offset: usize, len: usize) -> Result<&[u8], ParseError> {
    let Some(end) = offset.checked_add(len) else {
        return Err(ParseError::InvalidField {
            field: "offset",
            reason: "overflow",
        });
    };

    if end > data.len() {
        return Err(ParseError::InsufficientData {
            needed: len,
            offset,
            actual: data.len().saturating_sub(offset),
        });
    }

    Ok(&data[offset..end])
}

#[inline]
pub fn read_le_u16(data: &[u8], offset: usize) -> Result<u16, ParseError> {
    let bytes = ensure_slice(data, offset, 2)?;
    Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
}

#[inline]
pub fn read_le_i16(data: &[u8], offset: usize) -> Result<i16, ParseError> {
    read_le_u16(data, offset).map(|v| v as i16)
}

#[inline]
pub fn read_le_u32(data: &[u8], offset: usize) -> Result<u32, ParseError> {
    let bytes = ensure_slice(data, offset, 4)?;
    Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
}

#[inline]
pub fn read_le_i32(data: &[u8], offset: usize) -> Result<i32, ParseError> {
    read_le_u32(data, offset).map(|v| v as i32)
}

#[inline]
pub fn read_le_u64(data: &[u8], offset: usize) -> Result<u64, ParseError> {
    let bytes = ensure_slice(data, offset, 8)?;
    Ok(u64::from_le_bytes([
        bytes[0], bytes[1], bytes[2], bytes[3], bytes[4], bytes[5], bytes[6], bytes[7],
    ]))
}

#[inline]
pub fn read_le_i64(data: &[u8], offset: usize) -> Result<i64, ParseError> {
    read_le_u64(data, offset).map(|v| v as i64)
}

/// Write helpers panic on short buffers; callers size their buffers from the
/// record constants above.
#[inline]
pub fn write_le_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_i32(buf: &mut [u8], offset: usize, value: i32) {
    write_le_u32(buf, offset, value as u32);
}

#[inline]
pub fn write_le_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

#[inline]
pub fn write_le_i64(buf: &mut [u8], offset: usize, value: i64) {
    write_le_u64(buf, offset, value as u64);
}

// ── Sizing policy ───────────────────────────────────────────────────────────

/// Cache size to use when the caller leaves it unset, given the free space
/// on the cache's volume.
#[must_use]
pub fn preferred_cache_size(available: i64) -> i32 {
    let default = i64::from(DEFAULT_CACHE_SIZE);
    // 80% of the space when there is not enough for the default size.
    if available < default * 10 / 8 {
        return clamp_i32(available * 8 / 10);
    }
    // The default size while it uses between 80% and 10% of the space.
    if available < default * 10 {
        return DEFAULT_CACHE_SIZE;
    }
    // 10% of the space until that reaches 2.5 times the default.
    if available < default * 25 {
        return clamp_i32(available / 10);
    }
    if available < default * 250 {
        return clamp_i32(default * 5 / 2);
    }
    clamp_i32(available / 100)
}

/// Index table length appropriate for a cache of `storage_size` bytes.
#[must_use]
pub fn desired_index_table_len(storage_size: i32) -> u32 {
    let size = i64::from(storage_size);
    for factor in [1_i64, 2, 4, 8] {
        if size <= STORAGE_PER_BASE_TABLE * factor {
            return BASE_TABLE_LEN * factor as u32;
        }
    }
    BASE_TABLE_LEN * 16
}

/// Largest cache size a table of `table_len` buckets is meant to serve.
#[must_use]
pub fn max_storage_size_for_table(table_len: u32) -> i32 {
    let per_bucket = STORAGE_PER_BASE_TABLE / i64::from(BASE_TABLE_LEN);
    clamp_i32(i64::from(table_len) * per_bucket)
}

/// Number of 256-byte blocks an entry header needs to hold a key inline.
#[must_use]
pub fn num_blocks_for_entry(key_len: usize) -> u32 {
    let Ok(len) = i32::try_from(key_len) else {
        return 1;
    };
    if key_len < INLINE_KEY_LEN || len > MAX_INTERNAL_KEY_LENGTH {
        return 1;
    }
    ((key_len - INLINE_KEY_LEN) / ENTRY_STORE_SIZE + 2) as u32
}

fn clamp_i32(value: i64) -> i32 {
    i32::try_from(value.clamp(0, i64::from(i32::MAX))).unwrap_or(i32::MAX)
}
