//! Persisted statistics block.
//!
//! ```text
//!      0     4  signature (0xF01427E0)
//!      4     4  size      (bytes of this record)
//!      8   112  data_sizes[28]  (histogram of entry sizes)
//!    120   176  counters[22]
//! ```
//!
//! The record lives in two consecutive 256-byte blocks addressed by
//! `IndexHeader::stats`.

use dc_types::{
    read_le_i32, read_le_i64, read_le_u32, write_le_i32, write_le_i64, write_le_u32, ParseError,
    STATS_SIGNATURE,
};

pub const DATA_SIZES_LEN: usize = 28;
pub const NUM_COUNTERS: usize = 22;
pub const STATS_RECORD_SIZE: usize = 8 + 4 * DATA_SIZES_LEN + 8 * NUM_COUNTERS;

const COUNTERS_OFFSET: usize = 8 + 4 * DATA_SIZES_LEN;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OnDiskStats {
    pub data_sizes: [i32; DATA_SIZES_LEN],
    pub counters: [i64; NUM_COUNTERS],
}

impl Default for OnDiskStats {
    fn default() -> Self {
        Self {
            data_sizes: [0; DATA_SIZES_LEN],
            counters: [0; NUM_COUNTERS],
        }
    }
}

impl OnDiskStats {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        let signature = read_le_u32(data, 0)?;
        if signature != STATS_SIGNATURE {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(STATS_SIGNATURE),
                actual: u64::from(signature),
            });
        }
        let size = read_le_i32(data, 4)?;
        if usize::try_from(size).ok() != Some(STATS_RECORD_SIZE) {
            return Err(ParseError::InvalidField {
                field: "size",
                reason: "unexpected stats record size",
            });
        }
        let mut stats = Self::default();
        for i in 0..DATA_SIZES_LEN {
            stats.data_sizes[i] = read_le_i32(data, 8 + 4 * i)?;
        }
        for i in 0..NUM_COUNTERS {
            stats.counters[i] = read_le_i64(data, COUNTERS_OFFSET + 8 * i)?;
        }
        Ok(stats)
    }

    /// Serialize into `len` bytes (the allocated record size).
    #[must_use]
    pub fn to_bytes(&self, len: usize) -> Vec<u8> {
        let mut buf = vec![0_u8; len.max(STATS_RECORD_SIZE)];
        write_le_u32(&mut buf, 0, STATS_SIGNATURE);
        write_le_i32(&mut buf, 4, STATS_RECORD_SIZE as i32);
        for (i, value) in self.data_sizes.iter().enumerate() {
            write_le_i32(&mut buf, 8 + 4 * i, *value);
        }
        for (i, value) in self.counters.iter().enumerate() {
            write_le_i64(&mut buf, COUNTERS_OFFSET + 8 * i, *value);
        }
        buf
    }
}
