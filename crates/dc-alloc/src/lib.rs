#![forbid(unsafe_code)]
//! Block file allocation.
//!
//! Records of 36, 256, 1024 and 4096 bytes live in the `data_N` block
//! files. Each record type has a base file (`data_0` to `data_3`); when a
//! base file reaches [`MAX_BLOCKS`] blocks, further files (numbered 4 to
//! 255) are chained behind it through `next_file`.
//!
//! ## Layering
//!
//! 1. **bitmap**: nibble arithmetic on a single header's allocation map.
//! 2. **BlockFiles**: picks a file for a new record, grows and chains
//!    files, and writes header changes straight to disk.
//!
//! Header writes follow the `updating` protocol: the field is set before
//! the map changes and cleared afterwards, so a file whose header was
//! interrupted has its counters rebuilt on the next open.

pub mod bitmap;

use dc_block::{block_file_name, ByteFile, Storage};
use dc_error::{DcError, Result};
use dc_ondisk::{format_error, BlockFileHeader};
use dc_types::{
    CacheAddr, FileType, BLOCK_HEADER_SIZE, FIRST_ADDITIONAL_BLOCK_FILE,
    MAX_BLOCKS, MAX_BLOCK_FILE, MAX_NUM_BLOCKS, NUM_EXTRA_BLOCKS,
};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};

/// Largest record (4 blocks of 4 KiB).
const ZERO_BUFFER_LEN: usize = 4 * 4096;

#[derive(Debug)]
struct BlockFile {
    file: Arc<dyn ByteFile>,
    header: BlockFileHeader,
}

impl BlockFile {
    fn write_fields(&self) -> Result<()> {
        self.file.write_all_at(0, &self.header.fields_to_bytes())
    }

    fn write_map_word(&self, word: usize) -> Result<()> {
        let value = self.header.allocation_map[word];
        self.file
            .write_all_at(BlockFileHeader::map_word_offset(word), &value.to_le_bytes())
    }

    fn write_all(&self) -> Result<()> {
        self.file.write_all_at(0, &self.header.to_bytes())
    }
}

/// Per-file usage, as reported by stats and the CLI.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BlockFileStats {
    pub file_number: u32,
    pub file_type: FileType,
    pub next_file: u32,
    pub max_entries: i32,
    pub num_entries: i32,
    pub empty: [i32; 4],
}

/// The set of open block files.
#[derive(Debug)]
pub struct BlockFiles {
    storage: Arc<dyn Storage>,
    files: Vec<Option<BlockFile>>,
    /// Bumped every time a record address is freed, so holders of an
    /// address can tell a reused slot from the record they saw.
    generations: HashMap<u32, u32>,
    zero: Vec<u8>,
}

impl BlockFiles {
    /// Open the four base files, creating fresh ones first when `create`.
    pub fn open(storage: Arc<dyn Storage>, create: bool) -> Result<Self> {
        let mut files = Self {
            storage,
            files: (0..=MAX_BLOCK_FILE).map(|_| None).collect(),
            generations: HashMap::new(),
            zero: vec![0; ZERO_BUFFER_LEN],
        };
        for file_type in FileType::ALLOCATABLE {
            let Some(index) = file_type.base_file() else {
                continue;
            };
            if create {
                files.create_file(index, file_type, true)?;
            }
            files.open_file(index)?;
        }
        info!(target: "dc::alloc", create, "block_files_ready");
        Ok(files)
    }

    fn create_file(&mut self, index: u32, file_type: FileType, force: bool) -> Result<bool> {
        let name = block_file_name(index);
        if !force && self.storage.exists(&name) {
            return Ok(false);
        }
        let header = BlockFileHeader::new(index as i16, file_type);
        let file = self.storage.create(&name)?;
        file.write_all_at(0, &header.to_bytes())?;
        debug!(target: "dc::alloc", file = index, ?file_type, "block_file_created");
        Ok(true)
    }

    fn open_file(&mut self, index: u32) -> Result<()> {
        let name = block_file_name(index);
        let file = self.storage.open(&name)?;
        let len = file.len_bytes()?;
        if len < BLOCK_HEADER_SIZE as u64 {
            return Err(DcError::Format(format!("{name}: file too short")));
        }
        let mut raw = vec![0_u8; BLOCK_HEADER_SIZE];
        file.read_exact_at(0, &mut raw)?;
        let mut header = BlockFileHeader::parse(&raw).map_err(|err| format_error(&name, &err))?;
        if header.this_file as u32 != index {
            return Err(DcError::Format(format!("{name}: header names file {}", header.this_file)));
        }
        if let Some(base) = header.file_type().base_file() {
            if index < FIRST_ADDITIONAL_BLOCK_FILE && base != index {
                return Err(DcError::Format(format!("{name}: unexpected record size")));
            }
        }

        if len < header.expected_file_len() {
            return Err(DcError::Format(format!("{name}: shorter than its header claims")));
        }

        let needs_fix = header.updating != 0 || !bitmap::validate_counters(&header);
        if needs_fix {
            warn!(target: "dc::alloc", file = index, updating = header.updating, "block_file_header_rebuilt");
            Self::fix_header(&mut header, len)?;
        }
        let block = BlockFile { file, header };
        if needs_fix {
            block.write_fields()?;
        }
        self.files[index as usize] = Some(block);
        Ok(())
    }

    fn fix_header(header: &mut BlockFileHeader, file_len: u64) -> Result<()> {
        let entry_size = u64::from(header.entry_size.max(1) as u32);
        let expected = header.expected_file_len();
        if file_len != expected {
            let max_len = BLOCK_HEADER_SIZE as u64 + u64::from(MAX_BLOCKS) * entry_size;
            if file_len < expected || header.empty[3] != 0 || file_len > max_len {
                return Err(DcError::Format("block file size is inconsistent".to_owned()));
            }
            let blocks = (file_len - BLOCK_HEADER_SIZE as u64) / entry_size;
            header.max_entries = (blocks / 32 * 32) as i32;
        }
        bitmap::fix_allocation_counters(header);
        let empty = bitmap::empty_blocks(header);
        if empty + header.num_entries > header.max_entries {
            header.num_entries = header.max_entries - empty;
        }
        if !bitmap::validate_counters(header) {
            return Err(DcError::Format("block file counters are inconsistent".to_owned()));
        }
        header.updating = 0;
        Ok(())
    }

    fn file_for(&mut self, index: u32) -> Result<&mut BlockFile> {
        let slot = index as usize;
        if slot >= self.files.len() {
            return Err(DcError::InvalidArgument(format!("block file {index} out of range")));
        }
        if self.files[slot].is_none() {
            self.open_file(index)?;
        }
        self.files[slot].as_mut().ok_or(DcError::NotInitialized)
    }

    /// Allocate a record of `block_count` blocks of `file_type`.
    pub fn create_block(&mut self, file_type: FileType, block_count: u32) -> Result<CacheAddr> {
        if !FileType::ALLOCATABLE.contains(&file_type) || block_count == 0 || block_count > MAX_NUM_BLOCKS {
            return Err(DcError::InvalidArgument(format!(
                "cannot allocate {block_count} blocks of {file_type:?}"
            )));
        }
        let index = self.file_for_new_block(file_type, block_count)?;
        let block = self.file_for(index)?;

        let Some(target) = bitmap::pick_target_size(&block.header, block_count) else {
            return Err(DcError::NoSpace);
        };
        block.header.updating = 1;
        block.write_fields()?;
        let Some(start) = bitmap::create_map_block(&mut block.header, target, block_count) else {
            error!(target: "dc::alloc", file = index, target, block_count, "create_map_block_failed");
            block.header.updating = 0;
            block.write_fields()?;
            return Err(DcError::NoSpace);
        };
        block.write_map_word((start / 32) as usize)?;
        block.header.updating = 0;
        block.write_fields()?;
        Ok(CacheAddr::for_block(file_type, block_count, index, start))
    }

    fn file_for_new_block(&mut self, file_type: FileType, block_count: u32) -> Result<u32> {
        let mut index = file_type
            .base_file()
            .ok_or_else(|| DcError::InvalidArgument(format!("{file_type:?} has no block file")))?;
        loop {
            let header = &self.file_for(index)?.header;
            if !bitmap::needs_to_grow(header, block_count) {
                return Ok(index);
            }
            if header.max_entries as u32 >= MAX_BLOCKS {
                index = self.next_file(index, file_type)?;
                continue;
            }
            self.grow_file(index)?;
            return Ok(index);
        }
    }

    fn grow_file(&mut self, index: u32) -> Result<()> {
        let block = self.file_for(index)?;
        // MAX_BLOCKS is not a multiple of the growth step; the last step is short.
        let new_size = (block.header.max_entries + NUM_EXTRA_BLOCKS as i32).min(MAX_BLOCKS as i32);
        let added = new_size - block.header.max_entries;
        let new_len = BLOCK_HEADER_SIZE as u64 + u64::from(new_size as u32) * u64::from(block.header.entry_size as u32);
        block.file.set_len(new_len)?;
        block.header.updating = 1;
        block.write_fields()?;
        block.header.empty[3] += added / 4;
        block.header.max_entries = new_size;
        block.header.updating = 0;
        block.write_fields()?;
        debug!(target: "dc::alloc", file = index, max_entries = new_size, "block_file_grown");
        Ok(())
    }

    fn next_file(&mut self, index: u32, file_type: FileType) -> Result<u32> {
        let next = self.file_for(index)?.header.next_file;
        if next != 0 {
            return Ok(next as u32);
        }
        let mut created = None;
        for candidate in FIRST_ADDITIONAL_BLOCK_FILE..=MAX_BLOCK_FILE {
            if self.files[candidate as usize].is_some() {
                continue;
            }
            if self.create_file(candidate, file_type, false)? {
                created = Some(candidate);
                break;
            }
        }
        let Some(new_file) = created else {
            warn!(target: "dc::alloc", ?file_type, "out_of_block_files");
            return Err(DcError::NoSpace);
        };
        let block = self.file_for(index)?;
        block.header.next_file = new_file as i16;
        block.write_fields()?;
        info!(target: "dc::alloc", from = index, to = new_file, "block_file_chained");
        Ok(new_file)
    }

    /// Free a record. With `deep`, its bytes are zeroed first.
    pub fn delete_block(&mut self, addr: CacheAddr, deep: bool) -> Result<()> {
        if !addr.is_initialized() || addr.is_separate_file() {
            return Ok(());
        }
        let index = addr.file_number();
        let file = Arc::clone(&self.file_for(index)?.file);
        if deep {
            let len = addr.record_len().min(self.zero.len());
            file.write_all_at(addr.file_offset(), &self.zero[..len])?;
        }

        let block = self.file_for(index)?;
        block.header.updating = 1;
        block.write_fields()?;
        bitmap::delete_map_block(&mut block.header, addr.start_block(), addr.num_blocks());
        block.write_map_word((addr.start_block() / 32) as usize)?;
        block.header.updating = 0;
        block.write_fields()?;
        let now_empty = block.header.num_entries == 0;
        let file_type = block.header.file_type();

        *self.generations.entry(addr.value()).or_insert(0) += 1;

        if now_empty {
            self.remove_empty_files(file_type)?;
        }
        Ok(())
    }

    /// Unlink and delete empty files chained behind the base file of
    /// `file_type`.
    fn remove_empty_files(&mut self, file_type: FileType) -> Result<()> {
        let Some(mut prev) = file_type.base_file() else {
            return Ok(());
        };
        loop {
            let next = self.file_for(prev)?.header.next_file;
            if next == 0 {
                return Ok(());
            }
            let next = next as u32;
            let (empty, after) = {
                let header = &self.file_for(next)?.header;
                (header.num_entries == 0, header.next_file)
            };
            if !empty {
                prev = next;
                continue;
            }
            let block = self.file_for(prev)?;
            block.header.next_file = after;
            block.write_fields()?;
            self.files[next as usize] = None;
            self.storage.remove(&block_file_name(next))?;
            debug!(target: "dc::alloc", file = next, "empty_block_file_removed");
        }
    }

    /// The address names an allocated record.
    #[must_use]
    pub fn is_valid(&mut self, addr: CacheAddr) -> bool {
        if !addr.sanity_check() || !addr.is_initialized() || addr.is_separate_file() {
            return false;
        }
        let Ok(block) = self.file_for(addr.file_number()) else {
            return false;
        };
        if block.header.file_type() != addr.file_type() {
            return false;
        }
        bitmap::used_map_block(&block.header, addr.start_block(), addr.num_blocks())
    }

    /// Times the record slot at `addr` has been freed.
    #[must_use]
    pub fn generation(&self, addr: CacheAddr) -> u32 {
        self.generations.get(&addr.value()).copied().unwrap_or(0)
    }

    /// Read `buf.len()` bytes at `offset` within the record at `addr`.
    pub fn read(&mut self, addr: CacheAddr, offset: usize, buf: &mut [u8]) -> Result<()> {
        let block = self.checked_range(addr, offset, buf.len())?;
        block.file.read_exact_at(addr.file_offset() + offset as u64, buf)
    }

    /// Write `data` at `offset` within the record at `addr`.
    pub fn write(&mut self, addr: CacheAddr, offset: usize, data: &[u8]) -> Result<()> {
        let block = self.checked_range(addr, offset, data.len())?;
        block.file.write_all_at(addr.file_offset() + offset as u64, data)
    }

    /// Whole record at `addr`.
    pub fn read_record(&mut self, addr: CacheAddr) -> Result<Vec<u8>> {
        let mut buf = vec![0_u8; addr.record_len()];
        self.read(addr, 0, &mut buf)?;
        Ok(buf)
    }

    fn checked_range(&mut self, addr: CacheAddr, offset: usize, len: usize) -> Result<&mut BlockFile> {
        if !addr.is_initialized() || addr.is_separate_file() || !addr.sanity_check() {
            return Err(DcError::InvalidArgument(format!("{addr} is not a block address")));
        }
        if offset.checked_add(len).map_or(true, |end| end > addr.record_len()) {
            return Err(DcError::InvalidArgument(format!(
                "{len} bytes at {offset} overflow record {addr}"
            )));
        }
        let block = self.file_for(addr.file_number())?;
        if addr.start_block() + addr.num_blocks() > block.header.max_entries as u32 {
            return Err(DcError::Corruption {
                addr: addr.value(),
                detail: "record beyond end of block file".to_owned(),
            });
        }
        Ok(block)
    }

    /// Rewrite every header and sync the files.
    pub fn flush(&mut self) -> Result<()> {
        for block in self.files.iter().flatten() {
            block.write_all()?;
            block.file.sync()?;
        }
        Ok(())
    }

    /// Records allocated across the whole chain of `file_type` files.
    pub fn allocated_records(&mut self, file_type: FileType) -> Result<u64> {
        let Some(mut index) = file_type.base_file() else {
            return Ok(0);
        };
        let mut total = 0_u64;
        for _ in 0..=MAX_BLOCK_FILE {
            let header = &self.file_for(index)?.header;
            total += u64::try_from(header.num_entries).unwrap_or(0);
            if header.next_file == 0 {
                return Ok(total);
            }
            index = header.next_file as u32;
        }
        Err(DcError::Format(format!("{file_type:?} file chain loops")))
    }

    /// Usage of every open file, base files first.
    #[must_use]
    pub fn stats(&self) -> Vec<BlockFileStats> {
        self.files
            .iter()
            .enumerate()
            .filter_map(|(i, block)| {
                block.as_ref().map(|b| BlockFileStats {
                    file_number: i as u32,
                    file_type: b.header.file_type(),
                    next_file: b.header.next_file as u32,
                    max_entries: b.header.max_entries,
                    num_entries: b.header.num_entries,
                    empty: b.header.empty,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_block::MemStorage;
    use dc_types::write_le_i32;

    fn fresh() -> (MemStorage, BlockFiles) {
        let storage = MemStorage::new();
        let files = BlockFiles::open(Arc::new(storage.clone()), true).expect("open");
        (storage, files)
    }

    #[test]
    fn base_files_start_empty_and_grow_on_demand() {
        let (storage, mut files) = fresh();
        for name in ["data_0", "data_1", "data_2", "data_3"] {
            assert_eq!(storage.contents(name).map(|c| c.len()), Some(BLOCK_HEADER_SIZE));
        }
        let addr = files.create_block(FileType::Block256, 2).expect("alloc");
        assert_eq!(addr.file_type(), FileType::Block256);
        assert_eq!(addr.file_number(), 1);
        assert_eq!(addr.num_blocks(), 2);
        assert!(files.is_valid(addr));
        let len = storage.contents("data_1").map(|c| c.len()).unwrap_or(0);
        assert_eq!(len, BLOCK_HEADER_SIZE + 1024 * 256);
    }

    #[test]
    fn records_read_back_and_deep_delete_zeroes() {
        let (_storage, mut files) = fresh();
        let addr = files.create_block(FileType::Rankings, 1).expect("alloc");
        files.write(addr, 0, &[7_u8; 36]).expect("write");
        assert_eq!(files.read_record(addr).expect("read"), vec![7_u8; 36]);
        assert!(files.write(addr, 30, &[0_u8; 10]).is_err());

        let gen = files.generation(addr);
        files.delete_block(addr, true).expect("delete");
        assert!(!files.is_valid(addr));
        assert_eq!(files.generation(addr), gen + 1);
        assert_eq!(files.read_record(addr).expect("read"), vec![0_u8; 36]);
    }

    #[test]
    fn invalid_addresses_are_rejected() {
        let (_storage, mut files) = fresh();
        assert!(!files.is_valid(CacheAddr::NULL));
        assert!(!files.is_valid(CacheAddr::for_external(3)));
        let never = CacheAddr::for_block(FileType::Block1K, 1, 2, 0);
        assert!(!files.is_valid(never));
        let addr = files.create_block(FileType::Block1K, 1).expect("alloc");
        let wrong_type = CacheAddr::for_block(FileType::Block4K, 1, 2, addr.start_block());
        assert!(!files.is_valid(wrong_type));
        assert!(files.create_block(FileType::External, 1).is_err());
        assert!(files.create_block(FileType::Block256, 5).is_err());
    }

    #[test]
    fn headers_survive_reopen() {
        let (storage, mut files) = fresh();
        let a = files.create_block(FileType::Block4K, 4).expect("alloc");
        let b = files.create_block(FileType::Block4K, 1).expect("alloc");
        drop(files);

        let mut files = BlockFiles::open(Arc::new(storage), false).expect("reopen");
        assert!(files.is_valid(a));
        assert!(files.is_valid(b));
        let stats = files.stats();
        let data3 = stats.iter().find(|s| s.file_number == 3).expect("data_3");
        assert_eq!(data3.num_entries, 2);
        assert_eq!(data3.max_entries, 1024);
    }

    #[test]
    fn interrupted_update_rebuilds_counters() {
        let (storage, mut files) = fresh();
        let a = files.create_block(FileType::Block256, 1).expect("alloc");
        drop(files);

        let mut raw = [0_u8; 8];
        write_le_i32(&mut raw, 0, 1);
        assert!(storage.poke("data_1", 56, &raw[..4]));
        // Wreck a counter as a crash in the middle of an update would.
        write_le_i32(&mut raw, 4, 9999);
        assert!(storage.poke("data_1", 24, &raw[4..8]));

        let mut files = BlockFiles::open(Arc::new(storage), false).expect("reopen");
        assert!(files.is_valid(a));
        let stats = files.stats();
        let data1 = stats.iter().find(|s| s.file_number == 1).expect("data_1");
        assert_eq!(data1.empty, [0, 0, 1, 255]);
    }

    #[test]
    fn truncated_file_is_rejected() {
        let (storage, mut files) = fresh();
        files.create_block(FileType::Block1K, 1).expect("alloc");
        drop(files);
        let file = storage.open("data_2").expect("open");
        file.set_len(BLOCK_HEADER_SIZE as u64 + 100).expect("truncate");
        assert!(BlockFiles::open(Arc::new(storage), false).is_err());
    }

    #[test]
    fn full_base_file_chains_additional_files() {
        let (storage, mut files) = fresh();
        let per_file = MAX_BLOCKS / 4;
        let mut first = Vec::new();
        for _ in 0..per_file {
            first.push(files.create_block(FileType::Rankings, 4).expect("alloc"));
        }
        assert!(first.iter().all(|a| a.file_number() == 0));
        let overflow = files.create_block(FileType::Rankings, 4).expect("alloc");
        assert_eq!(overflow.file_number(), FIRST_ADDITIONAL_BLOCK_FILE);
        assert!(storage.exists("data_4"));
        let stats = files.stats();
        let data0 = stats.iter().find(|s| s.file_number == 0).expect("data_0");
        assert_eq!(data0.next_file, FIRST_ADDITIONAL_BLOCK_FILE);

        // Emptying the additional file removes it from the chain.
        files.delete_block(overflow, false).expect("delete");
        assert!(!storage.exists("data_4"));
        let stats = files.stats();
        let data0 = stats.iter().find(|s| s.file_number == 0).expect("data_0");
        assert_eq!(data0.next_file, 0);
        assert!(files.is_valid(first[0]));
    }

    #[test]
    fn single_blocks_fill_the_base_file_exactly() {
        let (storage, mut files) = fresh();
        for i in 0..MAX_BLOCKS + 10 {
            let addr = files.create_block(FileType::Rankings, 1).expect("alloc");
            let expected = if i < MAX_BLOCKS { 0 } else { FIRST_ADDITIONAL_BLOCK_FILE };
            assert_eq!(addr.file_number(), expected, "allocation {i}");
        }
        let stats = files.stats();
        let data0 = stats.iter().find(|s| s.file_number == 0).expect("data_0");
        assert_eq!(data0.max_entries, MAX_BLOCKS as i32);
        assert_eq!(data0.num_entries, MAX_BLOCKS as i32);
        assert_eq!(data0.empty, [0, 0, 0, 0]);
        assert_eq!(data0.next_file, FIRST_ADDITIONAL_BLOCK_FILE);
        let len = storage.contents("data_0").map_or(0, |c| c.len());
        assert_eq!(len, BLOCK_HEADER_SIZE + MAX_BLOCKS as usize * 36);
    }

    #[test]
    fn full_file_reopens_after_an_interrupted_update() {
        let (storage, mut files) = fresh();
        let mut records = Vec::new();
        for _ in 0..MAX_BLOCKS / 4 {
            records.push(files.create_block(FileType::Rankings, 4).expect("alloc"));
        }
        files.delete_block(records[7], false).expect("delete");
        drop(files);

        let mut raw = [0_u8; 4];
        write_le_i32(&mut raw, 0, 1);
        assert!(storage.poke("data_0", 56, &raw));

        let mut files = BlockFiles::open(Arc::new(storage), false).expect("reopen");
        let stats = files.stats();
        let data0 = stats.iter().find(|s| s.file_number == 0).expect("data_0");
        assert_eq!(data0.max_entries, MAX_BLOCKS as i32);
        assert_eq!(data0.num_entries, (MAX_BLOCKS / 4) as i32 - 1);
        assert_eq!(data0.empty, [0, 0, 0, 1]);
        assert!(files.is_valid(records[0]));
        assert!(!files.is_valid(records[7]));

        // The freed run is reused before any file is chained.
        let again = files.create_block(FileType::Rankings, 4).expect("alloc");
        assert_eq!(again, records[7]);
        let overflow = files.create_block(FileType::Rankings, 4).expect("alloc");
        assert_eq!(overflow.file_number(), FIRST_ADDITIONAL_BLOCK_FILE);
    }
}
