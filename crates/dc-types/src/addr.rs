//! 32-bit cache address encoding.
//!
//! ```text
//!  31  30..28   27..26    25..24      23..16        15..0
//! +---+-------+--------+----------+-------------+-------------+
//! | I | type  | rsvd   | blocks-1 | file number | start block |   block files
//! +---+-------+--------+----------+-------------+-------------+
//! | I | type=0|          external file number (28 bits)       |   external files
//! +---+-------+-----------------------------------------------+
//! ```
//!
//! `I` is the initialized bit; an address with `I == 0` must be exactly 0.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::MAX_BLOCK_SIZE;

const INITIALIZED_MASK: u32 = 0x8000_0000;
const FILE_TYPE_MASK: u32 = 0x7000_0000;
const FILE_TYPE_OFFSET: u32 = 28;
const RESERVED_BITS_MASK: u32 = 0x0C00_0000;
const NUM_BLOCKS_MASK: u32 = 0x0300_0000;
const NUM_BLOCKS_OFFSET: u32 = 24;
const FILE_SELECTOR_MASK: u32 = 0x00FF_0000;
const FILE_SELECTOR_OFFSET: u32 = 16;
const START_BLOCK_MASK: u32 = 0x0000_FFFF;
const FILE_NAME_MASK: u32 = 0x0FFF_FFFF;

/// Kind of file (and record size) an address points into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FileType {
    External,
    Rankings,
    Block256,
    Block1K,
    Block4K,
    BlockFiles,
    BlockEntries,
    BlockEvicted,
}

impl FileType {
    #[must_use]
    pub fn from_bits(bits: u32) -> Self {
        match bits & 0x7 {
            0 => Self::External,
            1 => Self::Rankings,
            2 => Self::Block256,
            3 => Self::Block1K,
            4 => Self::Block4K,
            5 => Self::BlockFiles,
            6 => Self::BlockEntries,
            _ => Self::BlockEvicted,
        }
    }

    #[must_use]
    pub fn bits(self) -> u32 {
        match self {
            Self::External => 0,
            Self::Rankings => 1,
            Self::Block256 => 2,
            Self::Block1K => 3,
            Self::Block4K => 4,
            Self::BlockFiles => 5,
            Self::BlockEntries => 6,
            Self::BlockEvicted => 7,
        }
    }

    /// Record size of one block of this type (0 for external files).
    #[must_use]
    pub fn block_size(self) -> u32 {
        match self {
            Self::External => 0,
            Self::Rankings => 36,
            Self::Block256 => 256,
            Self::Block1K => 1024,
            Self::Block4K => 4096,
            Self::BlockFiles => 8,
            Self::BlockEntries => 104,
            Self::BlockEvicted => 48,
        }
    }

    /// Storage class for a stream (or long key) of `size` bytes.
    #[must_use]
    pub fn required_for_size(size: i32) -> Self {
        if size < 1024 {
            Self::Block256
        } else if size < 4096 {
            Self::Block1K
        } else if size <= MAX_BLOCK_SIZE {
            Self::Block4K
        } else {
            Self::External
        }
    }

    /// Index of the first block file holding this type (`data_N`).
    #[must_use]
    pub fn base_file(self) -> Option<u32> {
        match self {
            Self::Rankings => Some(0),
            Self::Block256 => Some(1),
            Self::Block1K => Some(2),
            Self::Block4K => Some(3),
            _ => None,
        }
    }

    /// Types this backend allocates in block files.
    pub const ALLOCATABLE: [Self; 4] = [Self::Rankings, Self::Block256, Self::Block1K, Self::Block4K];
}

/// Encoded address of a record (or external file) inside the cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
pub struct CacheAddr(pub u32);

impl CacheAddr {
    pub const NULL: Self = Self(0);

    /// Address of `num_blocks` records starting at `start_block` in
    /// `data_<file_number>`.
    #[must_use]
    pub fn for_block(file_type: FileType, num_blocks: u32, file_number: u32, start_block: u32) -> Self {
        debug_assert!((1..=4).contains(&num_blocks));
        debug_assert!(file_number <= 0xFF);
        Self(
            INITIALIZED_MASK
                | (file_type.bits() << FILE_TYPE_OFFSET)
                | (((num_blocks - 1) << NUM_BLOCKS_OFFSET) & NUM_BLOCKS_MASK)
                | ((file_number << FILE_SELECTOR_OFFSET) & FILE_SELECTOR_MASK)
                | (start_block & START_BLOCK_MASK),
        )
    }

    /// Address of the external file `f_<file_number>`.
    #[must_use]
    pub fn for_external(file_number: u32) -> Self {
        Self(INITIALIZED_MASK | (file_number & FILE_NAME_MASK))
    }

    #[must_use]
    pub fn value(self) -> u32 {
        self.0
    }

    #[must_use]
    pub fn is_initialized(self) -> bool {
        self.0 & INITIALIZED_MASK != 0
    }

    #[must_use]
    pub fn file_type(self) -> FileType {
        FileType::from_bits((self.0 & FILE_TYPE_MASK) >> FILE_TYPE_OFFSET)
    }

    #[must_use]
    pub fn is_separate_file(self) -> bool {
        self.file_type() == FileType::External
    }

    #[must_use]
    pub fn is_block_file(self) -> bool {
        !self.is_separate_file()
    }

    /// Block file number (`data_N`) or external file number.
    #[must_use]
    pub fn file_number(self) -> u32 {
        if self.is_separate_file() {
            self.0 & FILE_NAME_MASK
        } else {
            (self.0 & FILE_SELECTOR_MASK) >> FILE_SELECTOR_OFFSET
        }
    }

    #[must_use]
    pub fn start_block(self) -> u32 {
        debug_assert!(self.is_block_file());
        self.0 & START_BLOCK_MASK
    }

    #[must_use]
    pub fn num_blocks(self) -> u32 {
        debug_assert!(self.is_block_file());
        ((self.0 & NUM_BLOCKS_MASK) >> NUM_BLOCKS_OFFSET) + 1
    }

    #[must_use]
    pub fn block_size(self) -> u32 {
        self.file_type().block_size()
    }

    /// Byte offset of this record inside its block file.
    #[must_use]
    pub fn file_offset(self) -> u64 {
        crate::BLOCK_HEADER_SIZE as u64 + u64::from(self.start_block()) * u64::from(self.block_size())
    }

    /// Total bytes covered by this record.
    #[must_use]
    pub fn record_len(self) -> usize {
        (self.num_blocks() * self.block_size()) as usize
    }

    /// Structural validity of the raw bits.
    #[must_use]
    pub fn sanity_check(self) -> bool {
        if !self.is_initialized() {
            return self.0 == 0;
        }
        if self.file_type() > FileType::Block4K {
            return false;
        }
        if self.is_separate_file() {
            return true;
        }
        self.0 & RESERVED_BITS_MASK == 0
    }

    /// Valid address of an entry header.
    #[must_use]
    pub fn sanity_check_for_entry(self) -> bool {
        self.sanity_check() && self.is_initialized() && self.file_type() == FileType::Block256
    }

    /// Valid address of a rankings node.
    #[must_use]
    pub fn sanity_check_for_rankings(self) -> bool {
        self.sanity_check()
            && self.is_initialized()
            && self.file_type() == FileType::Rankings
            && self.num_blocks() == 1
    }
}

impl fmt::Display for CacheAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn block_address_fields() {
        let addr = CacheAddr::for_block(FileType::Block1K, 3, 7, 0x1234);
        assert!(addr.is_initialized());
        assert!(addr.is_block_file());
        assert_eq!(addr.file_type(), FileType::Block1K);
        assert_eq!(addr.num_blocks(), 3);
        assert_eq!(addr.file_number(), 7);
        assert_eq!(addr.start_block(), 0x1234);
        assert_eq!(addr.value(), 0xB207_1234);
        assert_eq!(addr.record_len(), 3 * 1024);
        assert_eq!(addr.file_offset(), 8192 + 0x1234 * 1024);
        assert!(addr.sanity_check());
    }

    #[test]
    fn external_address_fields() {
        let addr = CacheAddr::for_external(0x0ab_cdef);
        assert!(addr.is_separate_file());
        assert_eq!(addr.file_number(), 0x0ab_cdef);
        assert_eq!(addr.value(), 0x80ab_cdef);
        assert!(addr.sanity_check());
        assert!(!addr.sanity_check_for_entry());
    }

    #[test]
    fn sanity_rules() {
        assert!(CacheAddr::NULL.sanity_check());
        // Uninitialized but with stray bits.
        assert!(!CacheAddr(0x0000_0001).sanity_check());
        // Reserved bits set on a block address.
        assert!(!CacheAddr(0xA400_0000).sanity_check());
        // File types this backend never produces.
        assert!(!CacheAddr(0xD000_0000).sanity_check());
        let node = CacheAddr::for_block(FileType::Rankings, 1, 0, 5);
        assert!(node.sanity_check_for_rankings());
        assert!(!node.sanity_check_for_entry());
        let wide = CacheAddr::for_block(FileType::Rankings, 2, 0, 5);
        assert!(!wide.sanity_check_for_rankings());
        let entry = CacheAddr::for_block(FileType::Block256, 4, 1, 8);
        assert!(entry.sanity_check_for_entry());
    }

    #[test]
    fn required_file_type_boundaries() {
        assert_eq!(FileType::required_for_size(0), FileType::Block256);
        assert_eq!(FileType::required_for_size(1023), FileType::Block256);
        assert_eq!(FileType::required_for_size(1024), FileType::Block1K);
        assert_eq!(FileType::required_for_size(4095), FileType::Block1K);
        assert_eq!(FileType::required_for_size(4096), FileType::Block4K);
        assert_eq!(FileType::required_for_size(16_384), FileType::Block4K);
        assert_eq!(FileType::required_for_size(16_385), FileType::External);
    }

    proptest! {
        #[test]
        fn block_fields_survive_encoding(
            type_bits in 1_u32..=4,
            blocks in 1_u32..=4,
            file in 0_u32..=255,
            start in 0_u32..=0xFFFF,
        ) {
            let file_type = FileType::from_bits(type_bits);
            let addr = CacheAddr::for_block(file_type, blocks, file, start);
            prop_assert!(addr.sanity_check());
            prop_assert_eq!(addr.file_type(), file_type);
            prop_assert_eq!(addr.num_blocks(), blocks);
            prop_assert_eq!(addr.file_number(), file);
            prop_assert_eq!(addr.start_block(), start);
        }
    }
}
