#![forbid(unsafe_code)]
//! The `index` file: header plus the hash table of bucket heads.
//!
//! Each bucket holds the address of the first entry whose key hash masks to
//! it; the rest of the bucket is a chain through `EntryStore::next`, which
//! the backend walks and edits. This crate owns only the table itself. The
//! table lives in memory and every bucket update is written through, so the
//! file on disk is current at all times except for header counters, which
//! are flushed at the end of each operation.

use dc_block::{ByteFile, Storage};
use dc_error::{DcError, Result};
use dc_ondisk::{format_error, IndexHeader};
use dc_types::{
    read_le_u32, CacheAddr, List, BASE_TABLE_LEN, CURRENT_VERSION, INDEX_FILE_NAME,
    INDEX_HEADER_SIZE, VERSION_2_1,
};
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Byte length of an index file with `table_len` buckets.
#[must_use]
pub fn index_file_len(table_len: u32) -> u64 {
    INDEX_HEADER_SIZE as u64 + u64::from(table_len) * 4
}

#[derive(Debug)]
pub struct IndexFile {
    file: Arc<dyn ByteFile>,
    header: IndexHeader,
    table: Vec<CacheAddr>,
    mask: u32,
}

impl IndexFile {
    /// Create a new, empty index, replacing any existing file.
    pub fn create(storage: &dyn Storage, table_len: u32, tiered: bool) -> Result<Self> {
        if table_len == 0 || !table_len.is_power_of_two() {
            return Err(DcError::InvalidArgument(format!(
                "index table length {table_len} is not a power of two"
            )));
        }
        let header = IndexHeader::new(table_len, tiered);
        let file = storage.create(INDEX_FILE_NAME)?;
        file.set_len(index_file_len(table_len))?;
        file.write_all_at(0, &header.to_bytes())?;
        info!(target: "dc::index", table_len, tiered, "index_created");
        Ok(Self {
            file,
            header,
            table: vec![CacheAddr::NULL; table_len as usize],
            mask: table_len - 1,
        })
    }

    /// Open and validate an existing index.
    ///
    /// A format 2.0 index opened for the tiered policy is upgraded in place:
    /// every entry starts on the no-use list. A 2.1 index is rejected by the
    /// classic policy.
    pub fn open(storage: &dyn Storage, tiered: bool) -> Result<Self> {
        let file = storage.open(INDEX_FILE_NAME)?;
        let len = file.len_bytes()?;
        if len < INDEX_HEADER_SIZE as u64 {
            return Err(DcError::Format("index: file too short".to_owned()));
        }
        let mut raw = vec![0_u8; INDEX_HEADER_SIZE];
        file.read_exact_at(0, &mut raw)?;
        let mut header = IndexHeader::parse(&raw).map_err(|err| format_error(INDEX_FILE_NAME, &err))?;

        if header.version == VERSION_2_1 && !tiered {
            return Err(DcError::Format("index: tiered lists not supported by this policy".to_owned()));
        }
        let table_len = u32::try_from(header.table_len)
            .map_err(|_| DcError::Format("index: negative table length".to_owned()))?;
        if table_len == 0 || table_len % BASE_TABLE_LEN != 0 || !table_len.is_power_of_two() {
            return Err(DcError::Format(format!("index: invalid table length {table_len}")));
        }
        if len < index_file_len(table_len) {
            return Err(DcError::Format("index: table truncated".to_owned()));
        }

        if tiered && header.version == CURRENT_VERSION {
            header.version = VERSION_2_1;
            header.lru.sizes[List::NoUse.index()] = header.num_entries;
            warn!(target: "dc::index", "index_upgraded_to_tiered_lists");
        }

        let mut bytes = vec![0_u8; table_len as usize * 4];
        file.read_exact_at(INDEX_HEADER_SIZE as u64, &mut bytes)?;
        let mut table = Vec::with_capacity(table_len as usize);
        for i in 0..table_len as usize {
            let raw = read_le_u32(&bytes, i * 4).map_err(|err| format_error(INDEX_FILE_NAME, &err))?;
            table.push(CacheAddr(raw));
        }

        debug!(
            target: "dc::index",
            table_len,
            num_entries = header.num_entries,
            num_bytes = header.num_bytes,
            "index_opened"
        );
        Ok(Self {
            file,
            header,
            table,
            mask: table_len - 1,
        })
    }

    #[must_use]
    pub fn header(&self) -> &IndexHeader {
        &self.header
    }

    pub fn header_mut(&mut self) -> &mut IndexHeader {
        &mut self.header
    }

    #[must_use]
    pub fn table_len(&self) -> u32 {
        self.table.len() as u32
    }

    #[must_use]
    pub fn mask(&self) -> u32 {
        self.mask
    }

    /// Use a smaller mask than the table provides. Used by tests to force
    /// long bucket chains.
    pub fn set_mask(&mut self, mask: u32) -> Result<()> {
        if mask >= self.table_len() || !(mask + 1).is_power_of_two() {
            return Err(DcError::InvalidArgument(format!("invalid index mask {mask:#x}")));
        }
        self.mask = mask;
        Ok(())
    }

    #[must_use]
    pub fn bucket_for(&self, hash: u32) -> usize {
        (hash & self.mask) as usize
    }

    #[must_use]
    pub fn bucket(&self, bucket: usize) -> CacheAddr {
        self.table.get(bucket).copied().unwrap_or(CacheAddr::NULL)
    }

    /// Head of the chain `hash` falls into.
    #[must_use]
    pub fn lookup(&self, hash: u32) -> CacheAddr {
        self.bucket(self.bucket_for(hash))
    }

    pub fn set_bucket(&mut self, bucket: usize, addr: CacheAddr) -> Result<()> {
        let Some(slot) = self.table.get_mut(bucket) else {
            return Err(DcError::InvalidArgument(format!("bucket {bucket} out of range")));
        };
        *slot = addr;
        let offset = INDEX_HEADER_SIZE as u64 + bucket as u64 * 4;
        self.file.write_all_at(offset, &addr.value().to_le_bytes())
    }

    /// Buckets in use (up to the active mask).
    pub fn occupied(&self) -> impl Iterator<Item = (usize, CacheAddr)> + '_ {
        self.table[..=self.mask as usize]
            .iter()
            .enumerate()
            .filter(|(_, addr)| addr.is_initialized())
            .map(|(i, addr)| (i, *addr))
    }

    /// Replace the table with an empty one of `table_len` buckets. The
    /// caller relinks every entry afterwards.
    pub fn rebuild_table(&mut self, table_len: u32) -> Result<()> {
        if table_len == 0 || !table_len.is_power_of_two() {
            return Err(DcError::InvalidArgument(format!(
                "index table length {table_len} is not a power of two"
            )));
        }
        self.file.set_len(INDEX_HEADER_SIZE as u64)?;
        self.file.set_len(index_file_len(table_len))?;
        self.table = vec![CacheAddr::NULL; table_len as usize];
        self.mask = table_len - 1;
        self.header.table_len = table_len as i32;
        self.flush_header()?;
        info!(target: "dc::index", table_len, "index_table_rebuilt");
        Ok(())
    }

    pub fn flush_header(&self) -> Result<()> {
        self.file.write_all_at(0, &self.header.to_bytes())
    }

    /// Write the header and sync the file.
    pub fn flush(&self) -> Result<()> {
        self.flush_header()?;
        self.file.sync()
    }
}
