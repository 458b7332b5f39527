//! Entry header and rankings node records.
//!
//! ```text
//! EntryStore (1..=4 blocks of 256 bytes)
//! offset  size  field
//!      0     4  hash            (key hash)
//!      4     4  next            (next entry in the bucket chain)
//!      8     4  rankings_node
//!     12     4  reuse_count
//!     16     4  refetch_count
//!     20     4  state
//!     24     8  creation_time
//!     32     4  key_len
//!     36     4  long_key        (address of an out-of-line key)
//!     40    16  data_size[4]
//!     56    16  data_addr[4]
//!     72     4  flags
//!     76    16  padding
//!     92     4  self_hash       (hash of bytes 0..92)
//!     96   160  key             (continues into the extra blocks)
//!
//! RankingsNode (36 bytes)
//!      0     8  last_used
//!      8     8  last_modified
//!     16     4  next
//!     20     4  prev
//!     24     4  contents        (entry address)
//!     28     4  dirty           (run id of the last open, 0 when closed)
//!     32     4  self_hash       (hash of bytes 0..32)
//! ```

use dc_types::{
    read_le_i32, read_le_u32, read_le_u64, super_fast_hash, write_le_i32, write_le_u32,
    write_le_u64, CacheAddr, CacheTime, EntryState, ParseError, ENTRY_STORE_SIZE, NUM_STREAMS,
    RANKINGS_NODE_SIZE,
};

const ENTRY_HASHED_LEN: usize = 92;
const ENTRY_KEY_OFFSET: usize = 96;
const NODE_HASHED_LEN: usize = 32;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryStore {
    pub hash: u32,
    pub next: CacheAddr,
    pub rankings_node: CacheAddr,
    pub reuse_count: i32,
    pub refetch_count: i32,
    pub state: i32,
    pub creation_time: CacheTime,
    pub key_len: i32,
    pub long_key: CacheAddr,
    pub data_size: [i32; NUM_STREAMS],
    pub data_addr: [CacheAddr; NUM_STREAMS],
    pub flags: u32,
    pub self_hash: u32,
    /// Inline key area: everything after the fixed fields.
    pub key_area: Vec<u8>,
}

impl EntryStore {
    /// Blank header spanning `num_blocks` blocks.
    #[must_use]
    pub fn new(num_blocks: u32) -> Self {
        let total = ENTRY_STORE_SIZE * num_blocks.clamp(1, 4) as usize;
        Self {
            hash: 0,
            next: CacheAddr::NULL,
            rankings_node: CacheAddr::NULL,
            reuse_count: 0,
            refetch_count: 0,
            state: EntryState::Normal.to_raw(),
            creation_time: CacheTime::NULL,
            key_len: 0,
            long_key: CacheAddr::NULL,
            data_size: [0; NUM_STREAMS],
            data_addr: [CacheAddr::NULL; NUM_STREAMS],
            flags: 0,
            self_hash: 0,
            key_area: vec![0; total - ENTRY_KEY_OFFSET],
        }
    }

    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        if data.len() < ENTRY_STORE_SIZE || data.len() % ENTRY_STORE_SIZE != 0 {
            return Err(ParseError::InsufficientData {
                needed: ENTRY_STORE_SIZE,
                offset: 0,
                actual: data.len(),
            });
        }
        let mut entry = Self {
            hash: read_le_u32(data, 0)?,
            next: CacheAddr(read_le_u32(data, 4)?),
            rankings_node: CacheAddr(read_le_u32(data, 8)?),
            reuse_count: read_le_i32(data, 12)?,
            refetch_count: read_le_i32(data, 16)?,
            state: read_le_i32(data, 20)?,
            creation_time: CacheTime(read_le_u64(data, 24)?),
            key_len: read_le_i32(data, 32)?,
            long_key: CacheAddr(read_le_u32(data, 36)?),
            data_size: [0; NUM_STREAMS],
            data_addr: [CacheAddr::NULL; NUM_STREAMS],
            flags: read_le_u32(data, 72)?,
            self_hash: read_le_u32(data, ENTRY_HASHED_LEN)?,
            key_area: data[ENTRY_KEY_OFFSET..].to_vec(),
        };
        for i in 0..NUM_STREAMS {
            entry.data_size[i] = read_le_i32(data, 40 + 4 * i)?;
            entry.data_addr[i] = CacheAddr(read_le_u32(data, 56 + 4 * i)?);
        }
        Ok(entry)
    }

    fn fixed_fields(&self) -> [u8; ENTRY_KEY_OFFSET] {
        let mut buf = [0_u8; ENTRY_KEY_OFFSET];
        write_le_u32(&mut buf, 0, self.hash);
        write_le_u32(&mut buf, 4, self.next.value());
        write_le_u32(&mut buf, 8, self.rankings_node.value());
        write_le_i32(&mut buf, 12, self.reuse_count);
        write_le_i32(&mut buf, 16, self.refetch_count);
        write_le_i32(&mut buf, 20, self.state);
        write_le_u64(&mut buf, 24, self.creation_time.0);
        write_le_i32(&mut buf, 32, self.key_len);
        write_le_u32(&mut buf, 36, self.long_key.value());
        for i in 0..NUM_STREAMS {
            write_le_i32(&mut buf, 40 + 4 * i, self.data_size[i]);
            write_le_u32(&mut buf, 56 + 4 * i, self.data_addr[i].value());
        }
        write_le_u32(&mut buf, 72, self.flags);
        buf
    }

    /// Hash of the fixed fields as they would be written now.
    #[must_use]
    pub fn compute_self_hash(&self) -> u32 {
        super_fast_hash(&self.fixed_fields()[..ENTRY_HASHED_LEN])
    }

    /// Stored hash matches the fields. Zero is accepted for records written
    /// before the hash existed.
    #[must_use]
    pub fn self_hash_ok(&self) -> bool {
        self.self_hash == 0 || self.self_hash == self.compute_self_hash()
    }

    /// Serialize with a freshly computed self hash.
    #[must_use]
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(ENTRY_KEY_OFFSET + self.key_area.len());
        let mut fixed = self.fixed_fields();
        let hash = super_fast_hash(&fixed[..ENTRY_HASHED_LEN]);
        write_le_u32(&mut fixed, ENTRY_HASHED_LEN, hash);
        buf.extend_from_slice(&fixed);
        buf.extend_from_slice(&self.key_area);
        buf
    }

    #[must_use]
    pub fn num_blocks(&self) -> u32 {
        ((ENTRY_KEY_OFFSET + self.key_area.len()) / ENTRY_STORE_SIZE) as u32
    }

    #[must_use]
    pub fn state(&self) -> Option<EntryState> {
        EntryState::from_raw(self.state)
    }

    /// Key bytes stored inline, when the key fits in the header blocks.
    #[must_use]
    pub fn inline_key(&self) -> Option<&[u8]> {
        if self.long_key.is_initialized() {
            return None;
        }
        let len = usize::try_from(self.key_len).ok()?;
        self.key_area.get(..len)
    }

    /// Store `key` inline followed by a NUL. Returns false if it does not fit.
    pub fn set_inline_key(&mut self, key: &[u8]) -> bool {
        if key.len() >= self.key_area.len() {
            return false;
        }
        self.key_area.fill(0);
        self.key_area[..key.len()].copy_from_slice(key);
        self.key_len = i32::try_from(key.len()).unwrap_or(i32::MAX);
        self.long_key = CacheAddr::NULL;
        true
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RankingsNode {
    pub last_used: CacheTime,
    pub last_modified: CacheTime,
    pub next: CacheAddr,
    pub prev: CacheAddr,
    pub contents: CacheAddr,
    pub dirty: i32,
    pub self_hash: u32,
}

impl RankingsNode {
    pub fn parse(data: &[u8]) -> Result<Self, ParseError> {
        Ok(Self {
            last_used: CacheTime(read_le_u64(data, 0)?),
            last_modified: CacheTime(read_le_u64(data, 8)?),
            next: CacheAddr(read_le_u32(data, 16)?),
            prev: CacheAddr(read_le_u32(data, 20)?),
            contents: CacheAddr(read_le_u32(data, 24)?),
            dirty: read_le_i32(data, 28)?,
            self_hash: read_le_u32(data, NODE_HASHED_LEN)?,
        })
    }

    fn hashed_fields(&self) -> [u8; NODE_HASHED_LEN] {
        let mut buf = [0_u8; NODE_HASHED_LEN];
        write_le_u64(&mut buf, 0, self.last_used.0);
        write_le_u64(&mut buf, 8, self.last_modified.0);
        write_le_u32(&mut buf, 16, self.next.value());
        write_le_u32(&mut buf, 20, self.prev.value());
        write_le_u32(&mut buf, 24, self.contents.value());
        write_le_i32(&mut buf, 28, self.dirty);
        buf
    }

    #[must_use]
    pub fn compute_self_hash(&self) -> u32 {
        super_fast_hash(&self.hashed_fields())
    }

    #[must_use]
    pub fn self_hash_ok(&self) -> bool {
        self.self_hash == 0 || self.self_hash == self.compute_self_hash()
    }

    /// Serialize with a freshly computed self hash.
    #[must_use]
    pub fn to_bytes(&self) -> [u8; RANKINGS_NODE_SIZE] {
        let mut buf = [0_u8; RANKINGS_NODE_SIZE];
        let fields = self.hashed_fields();
        buf[..NODE_HASHED_LEN].copy_from_slice(&fields);
        write_le_u32(&mut buf, NODE_HASHED_LEN, super_fast_hash(&fields));
        buf
    }

    /// Node holds no entry (freshly allocated or zeroed).
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.next.value() == 0 && self.prev.value() == 0 && self.contents.value() == 0
    }
}
