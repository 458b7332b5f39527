//! Index file header.
//!
//! ```text
//! offset  size  field
//! ------  ----  -----------------------------------------
//!      0     4  magic (0xC103CAC3)
//!      4     4  version
//!      8     4  num_entries
//!     12     4  num_bytes
//!     16     4  last_file      (last external file number)
//!     20     4  this_id        (run id)
//!     24     4  stats          (CacheAddr of the stats block)
//!     28     4  table_len
//!     32     4  crash
//!     36     4  experiment
//!     40     8  create_time
//!     48   208  padding
//!    256   112  LruData
//!    368        table of table_len u32 addresses
//! ```

use dc_types::{
    read_le_i32, read_le_u32, read_le_u64, write_le_i32, write_le_u32, write_le_u64, CacheAddr,
    CacheTime, List, ParseError, CURRENT_VERSION, INDEX_HEADER_SIZE, INDEX_MAGIC, LIST_COUNT,
    VERSION_2_1,
};
use serde::{Deserialize, Serialize};

const LRU_OFFSET: usize = 256;

/// In-flight rankings operation recorded for crash recovery.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Operation {
    None,
    Insert,
    Remove,
}

impl Operation {
    #[must_use]
    pub fn from_raw(raw: i32) -> Option<Self> {
        match raw {
            0 => Some(Self::None),
            1 => Some(Self::Insert),
            2 => Some(Self::Remove),
            _ => None,
        }
    }

    #[must_use]
    pub fn to_raw(self) -> i32 {
        match self {
            Self::None => 0,
            Self::Insert => 1,
            Self::Remove => 2,
        }
    }
}

/// Heads, tails and sizes of the ranking lists, plus the transaction slot.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LruData {
    pub filled: i32,
    pub sizes: [i32; LIST_COUNT],
    pub heads: [CacheAddr; LIST_COUNT],
    pub tails: [CacheAddr; LIST_COUNT],
    pub transaction: CacheAddr,
    pub operation: i32,
    pub operation_list: i32,
}

impl Default for LruData {
    fn default() -> Self {
        Self {
            filled: 0,
            sizes: [0; LIST_COUNT],
            heads: [CacheAddr::NULL; LIST_COUNT],
            tails: [CacheAddr::NULL; LIST_COUNT],
            transaction: CacheAddr::NULL,
            operation: 0,
            operation_list: 0,
        }
    }
}

impl LruData {
    pub fn parse(data: &[u8], base: usize) -> Result<Self, ParseError> {
        let mut lru = Self {
            filled: read_le_i32(data, base + 8)?,
            ..Self::default()
        };
        for i in 0..LIST_COUNT {
            lru.sizes[i] = read_le_i32(data, base + 12 + 4 * i)?;
            lru.heads[i] = CacheAddr(read_le_u32(data, base + 32 + 4 * i)?);
            lru.tails[i] = CacheAddr(read_le_u32(data, base + 52 + 4 * i)?);
        }
        lru.transaction = CacheAddr(read_le_u32(data, base + 72)?);
        lru.operation = read_le_i32(data, base + 76)?;
        lru.operation_list = read_le_i32(data, base + 80)?;
        Ok(lru)
    }

    pub fn write(&self, buf: &mut [u8], base: usize) {
        write_le_i32(buf, base + 8, self.filled);
        for i in 0..LIST_COUNT {
            write_le_i32(buf, base + 12 + 4 * i, self.sizes[i]);
            write_le_u32(buf, base + 32 + 4 * i, self.heads[i].value());
            write_le_u32(buf, base + 52 + 4 * i, self.tails[i].value());
        }
        write_le_u32(buf, base + 72, self.transaction.value());
        write_le_i32(buf, base + 76, self.operation);
        write_le_i32(buf, base + 80, self.operation_list);
    }

    #[must_use]
    pub fn head(&self, list: List) -> CacheAddr {
        self.heads[list.index()]
    }

    #[must_use]
    pub fn tail(&self, list: List) -> CacheAddr {
        self.tails[list.index()]
    }

    #[must_use]
    pub fn size(&self, list: List) -> i32 {
        self.sizes[list.index()]
    }

    #[must_use]
    pub fn pending_operation(&self) -> Option<(Operation, CacheAddr, i32)> {
        if !self.transaction.is_initialized() {
            return None;
        }
        let op = Operation::from_raw(self.operation).unwrap_or(Operation::None);
        Some((op, self.transaction, self.operation_list))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexHeader {
    pub magic: u32,
    pub version: u32,
    pub num_entries: i32,
    pub num_bytes: i32,
    pub last_file: i32,
    pub this_id: i32,
    pub stats: CacheAddr,
    pub table_len: i32,
    pub crash: i32,
    pub experiment: i32,
    pub create_time: CacheTime,
    pub lru: LruData,
}

impl IndexHeader {
    /// Header for a brand new cache.
    #[must_use]
    pub fn new(table_len: u32, tiered: bool) -> Self {
        Self {
            magic: INDEX_MAGIC,
            version: if tiered { VERSION_2_1 } else { CURRENT_VERSION },
            num_entries: 0,
            num_bytes: 0,
            last_file: 0,
            this_id: 1,
            stats: CacheAddr::NULL,
            table_len: i32::try_from(table_len).unwrap_or(i32::MAX),
            crash: 0,
            experiment: 0,
            create_time: CacheTime::now(),
            lru: LruData::default(),
        }
    }

    /// Parse and validate the fixed header fields.
    ///
    /// Table length and file size are validated by the index table, which
    /// knows the file length.
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < INDEX_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: INDEX_HEADER_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        let magic = read_le_u32(data, 0)?;
        if magic != INDEX_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(INDEX_MAGIC),
                actual: u64::from(magic),
            });
        }

        let version = read_le_u32(data, 4)?;
        if version != CURRENT_VERSION && version != VERSION_2_1 {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported index version",
            });
        }

        let header = Self {
            magic,
            version,
            num_entries: read_le_i32(data, 8)?,
            num_bytes: read_le_i32(data, 12)?,
            last_file: read_le_i32(data, 16)?,
            this_id: read_le_i32(data, 20)?,
            stats: CacheAddr(read_le_u32(data, 24)?),
            table_len: read_le_i32(data, 28)?,
            crash: read_le_i32(data, 32)?,
            experiment: read_le_i32(data, 36)?,
            create_time: CacheTime(read_le_u64(data, 40)?),
            lru: LruData::parse(data, LRU_OFFSET)?,
        };

        if header.num_entries < 0 {
            return Err(ParseError::InvalidField {
                field: "num_entries",
                reason: "negative",
            });
        }
        if header.num_bytes < 0 {
            return Err(ParseError::InvalidField {
                field: "num_bytes",
                reason: "negative",
            });
        }
        if header.lru.sizes.iter().any(|s| *s < 0) {
            return Err(ParseError::InvalidField {
                field: "lru.sizes",
                reason: "negative",
            });
        }
        Ok(header)
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; INDEX_HEADER_SIZE];
        write_le_u32(&mut buf, 0, self.magic);
        write_le_u32(&mut buf, 4, self.version);
        write_le_i32(&mut buf, 8, self.num_entries);
        write_le_i32(&mut buf, 12, self.num_bytes);
        write_le_i32(&mut buf, 16, self.last_file);
        write_le_i32(&mut buf, 20, self.this_id);
        write_le_u32(&mut buf, 24, self.stats.value());
        write_le_i32(&mut buf, 28, self.table_len);
        write_le_i32(&mut buf, 32, self.crash);
        write_le_i32(&mut buf, 36, self.experiment);
        write_le_u64(&mut buf, 40, self.create_time.0);
        self.lru.write(&mut buf, LRU_OFFSET);
        buf
    }

    #[must_use]
    pub fn is_tiered(&self) -> bool {
        self.version == VERSION_2_1
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_round_trips_through_bytes() {
        let mut header = IndexHeader::new(0x1_0000, true);
        header.num_entries = 12;
        header.num_bytes = 4096;
        header.this_id = 7;
        header.lru.sizes[List::Deleted.index()] = 3;
        header.lru.heads[0] = CacheAddr(0x9000_0001);
        header.lru.tails[0] = CacheAddr(0x9000_0002);
        header.lru.transaction = CacheAddr(0x9000_0003);
        header.lru.operation = Operation::Remove.to_raw();
        header.lru.operation_list = 2;

        let bytes = header.to_bytes();
        assert_eq!(bytes.len(), INDEX_HEADER_SIZE);
        let parsed = IndexHeader::parse(&bytes).expect("parse");
        assert_eq!(parsed, header);
        assert!(parsed.is_tiered());
        assert_eq!(
            parsed.lru.pending_operation(),
            Some((Operation::Remove, CacheAddr(0x9000_0003), 2))
        );
    }

    #[test]
    fn field_offsets_match_layout() {
        let mut header = IndexHeader::new(0x2_0000, false);
        header.table_len = 0x2_0000;
        header.lru.heads[4] = CacheAddr(0x9000_00AA);
        let bytes = header.to_bytes();
        assert_eq!(&bytes[0..4], &INDEX_MAGIC.to_le_bytes());
        assert_eq!(&bytes[28..32], &0x2_0000_i32.to_le_bytes());
        // heads[4] lives at 256 + 32 + 16.
        assert_eq!(&bytes[304..308], &0x9000_00AA_u32.to_le_bytes());
    }

    #[test]
    fn rejects_bad_magic_and_version() {
        let mut bytes = IndexHeader::new(0x1_0000, false).to_bytes();
        bytes[0] ^= 0xFF;
        assert!(matches!(
            IndexHeader::parse(&bytes),
            Err(ParseError::InvalidMagic { .. })
        ));

        let mut bytes = IndexHeader::new(0x1_0000, false).to_bytes();
        write_le_u32(&mut bytes, 4, 0x0003_0000);
        assert!(matches!(
            IndexHeader::parse(&bytes),
            Err(ParseError::InvalidField { field: "version", .. })
        ));
    }

    #[test]
    fn rejects_negative_counters_and_short_input() {
        let mut bytes = IndexHeader::new(0x1_0000, false).to_bytes();
        write_le_i32(&mut bytes, 12, -1);
        assert!(IndexHeader::parse(&bytes).is_err());
        assert!(IndexHeader::parse(&bytes[..100]).is_err());
    }
}
