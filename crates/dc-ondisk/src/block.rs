//! Block file header.
//!
//! ```text
//! offset  size  field
//! ------  ----  ----------------------------------------------
//!      0     4  magic (0xC104CAC3)
//!      4     4  version
//!      8     2  this_file
//!     10     2  next_file
//!     12     4  entry_size
//!     16     4  num_entries
//!     20     4  max_entries
//!     24    16  empty[4]    (nibbles with a free run of i+1 blocks)
//!     40    16  hints[4]    (last word used for each run length)
//!     56     4  updating
//!     60    20  user[5]
//!     80  8112  allocation map, one bit per block
//! ```

use dc_types::{
    read_le_i16, read_le_i32, read_le_u32, write_le_i32, write_le_u16, write_le_u32, FileType,
    ParseError, BLOCK_HEADER_FIELDS, BLOCK_HEADER_SIZE, BLOCK_MAGIC, CURRENT_VERSION, MAX_BLOCKS,
};

/// Words in the allocation map.
pub const MAP_WORDS: usize = (BLOCK_HEADER_SIZE - BLOCK_HEADER_FIELDS) / 4;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockFileHeader {
    pub magic: u32,
    pub version: u32,
    pub this_file: i16,
    pub next_file: i16,
    pub entry_size: i32,
    pub num_entries: i32,
    pub max_entries: i32,
    pub empty: [i32; 4],
    pub hints: [i32; 4],
    pub updating: i32,
    pub user: [i32; 5],
    pub allocation_map: Vec<u32>,
}

impl BlockFileHeader {
    /// Header of an empty, zero-capacity file.
    #[must_use]
    pub fn new(file_number: i16, file_type: FileType) -> Self {
        Self {
            magic: BLOCK_MAGIC,
            version: CURRENT_VERSION,
            this_file: file_number,
            next_file: 0,
            entry_size: i32::try_from(file_type.block_size()).unwrap_or(0),
            num_entries: 0,
            max_entries: 0,
            empty: [0; 4],
            hints: [0; 4],
            updating: 0,
            user: [0; 5],
            allocation_map: vec![0; MAP_WORDS],
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < BLOCK_HEADER_SIZE {
            return Err(ParseError::InsufficientData {
                needed: BLOCK_HEADER_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }

        let magic = read_le_u32(data, 0)?;
        if magic != BLOCK_MAGIC {
            return Err(ParseError::InvalidMagic {
                expected: u64::from(BLOCK_MAGIC),
                actual: u64::from(magic),
            });
        }
        let version = read_le_u32(data, 4)?;
        if version != CURRENT_VERSION {
            return Err(ParseError::InvalidField {
                field: "version",
                reason: "unsupported block file version",
            });
        }

        let mut header = Self {
            magic,
            version,
            this_file: read_le_i16(data, 8)?,
            next_file: read_le_i16(data, 10)?,
            entry_size: read_le_i32(data, 12)?,
            num_entries: read_le_i32(data, 16)?,
            max_entries: read_le_i32(data, 20)?,
            empty: [0; 4],
            hints: [0; 4],
            updating: read_le_i32(data, 56)?,
            user: [0; 5],
            allocation_map: Vec::with_capacity(MAP_WORDS),
        };
        for i in 0..4 {
            header.empty[i] = read_le_i32(data, 24 + 4 * i)?;
            header.hints[i] = read_le_i32(data, 40 + 4 * i)?;
        }
        for i in 0..5 {
            header.user[i] = read_le_i32(data, 60 + 4 * i)?;
        }
        for word in 0..MAP_WORDS {
            header
                .allocation_map
                .push(read_le_u32(data, BLOCK_HEADER_FIELDS + 4 * word)?);
        }

        let valid_size = FileType::ALLOCATABLE
            .iter()
            .any(|t| i32::try_from(t.block_size()).ok() == Some(header.entry_size));
        if !valid_size {
            return Err(ParseError::InvalidField {
                field: "entry_size",
                reason: "not a known record size",
            });
        }
        let max_blocks = i32::try_from(MAX_BLOCKS).unwrap_or(i32::MAX);
        if header.max_entries < 0 || header.max_entries > max_blocks || header.max_entries % 32 != 0 {
            return Err(ParseError::InvalidField {
                field: "max_entries",
                reason: "out of range",
            });
        }
        if header.num_entries < 0 || header.num_entries > header.max_entries {
            return Err(ParseError::InvalidField {
                field: "num_entries",
                reason: "out of range",
            });
        }
        if header.this_file < 0 || header.next_file < 0 {
            return Err(ParseError::InvalidField {
                field: "file number",
                reason: "negative",
            });
        }
        Ok(header)
    }

    /// The fixed fields ahead of the allocation map.
    #[must_use]
    pub fn fields_to_bytes(&self) -> [u8; BLOCK_HEADER_FIELDS] {
        let mut buf = [0_u8; BLOCK_HEADER_FIELDS];
        write_le_u32(&mut buf, 0, self.magic);
        write_le_u32(&mut buf, 4, self.version);
        write_le_u16(&mut buf, 8, self.this_file as u16);
        write_le_u16(&mut buf, 10, self.next_file as u16);
        write_le_i32(&mut buf, 12, self.entry_size);
        write_le_i32(&mut buf, 16, self.num_entries);
        write_le_i32(&mut buf, 20, self.max_entries);
        for i in 0..4 {
            write_le_i32(&mut buf, 24 + 4 * i, self.empty[i]);
            write_le_i32(&mut buf, 40 + 4 * i, self.hints[i]);
        }
        write_le_i32(&mut buf, 56, self.updating);
        for i in 0..5 {
            write_le_i32(&mut buf, 60 + 4 * i, self.user[i]);
        }
        buf
    }

    /// File offset of allocation map word `word`.
    #[must_use]
    pub fn map_word_offset(word: usize) -> u64 {
        (BLOCK_HEADER_FIELDS + 4 * word) as u64
    }

    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![0_u8; BLOCK_HEADER_SIZE];
        buf[..BLOCK_HEADER_FIELDS].copy_from_slice(&self.fields_to_bytes());
        for (word, value) in self.allocation_map.iter().enumerate() {
            write_le_u32(&mut buf, BLOCK_HEADER_FIELDS + 4 * word, *value);
        }
        buf
    }

    /// Record type stored in this file.
    #[must_use]
    pub fn file_type(&self) -> FileType {
        FileType::ALLOCATABLE
            .iter()
            .copied()
            .find(|t| i32::try_from(t.block_size()).ok() == Some(self.entry_size))
            .unwrap_or(FileType::Block256)
    }

    /// Byte length the file must have to hold `max_entries` records.
    #[must_use]
    pub fn expected_file_len(&self) -> u64 {
        BLOCK_HEADER_SIZE as u64 + u64::from(self.max_entries.max(0) as u32) * u64::from(self.entry_size.max(0) as u32)
    }
}
