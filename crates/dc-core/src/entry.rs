//! Open entries and their data streams.
//!
//! An [`EntryImpl`] is the in-memory side of an entry header: the parsed
//! record, reference count and per-stream write buffers. Headers are written
//! back whenever a field changes, so the record on disk never lags behind
//! anything but buffered stream bytes.
//!
//! Stream I/O runs on a [`Streams`] view that borrows the pieces of the
//! backend it touches. Small streams live in block files, larger ones in
//! external `f_` files; writes go through a [`UserBuffer`] while the data
//! fits one, and the size change is reported to the index only when the
//! buffer reaches storage.

use crate::buffer::{BufferBudget, UserBuffer};
use crate::stats::Stats;
use dc_alloc::BlockFiles;
use dc_block::{external_file_name, Storage};
use dc_error::{DcError, Result};
use dc_index::IndexFile;
use dc_ondisk::EntryStore;
use dc_types::{
    super_fast_hash, CacheAddr, FileType, MAX_BLOCK_SIZE, MAX_INTERNAL_KEY_LENGTH, NUM_STREAMS,
};
use tracing::{debug, trace, warn};

/// Highest external file number an address can carry.
const MAX_EXTERNAL_FILE: u32 = 0x0FFF_FFFF;
/// Names probed before giving up on a free external file slot.
const MAX_EXTERNAL_PROBES: u32 = 1024;

const BLOCK_LIMIT: usize = MAX_BLOCK_SIZE as usize;

fn to_i32(value: usize) -> i32 {
    i32::try_from(value).unwrap_or(i32::MAX)
}

fn stream_len(store: &EntryStore, index: usize) -> usize {
    usize::try_from(store.data_size[index]).unwrap_or(0)
}

/// One entry loaded from disk, shared by every handle that has it open.
#[derive(Debug)]
pub(crate) struct EntryImpl {
    pub addr: CacheAddr,
    pub store: EntryStore,
    pub key: String,
    pub refs: u32,
    pub doomed: bool,
    /// Left over from a run that did not close it cleanly, or found broken.
    pub dirty: bool,
    /// This run marked the rankings node as in use.
    pub stamped: bool,
    /// The rankings node does not belong to this entry any more; list
    /// operations and the final delete leave it alone.
    pub leave_rankings_behind: bool,
    pub buffers: [Option<UserBuffer>; NUM_STREAMS],
    /// Size changes not yet added to the index byte count.
    pub unreported: [i32; NUM_STREAMS],
}

impl EntryImpl {
    pub fn new(addr: CacheAddr, store: EntryStore, key: String) -> Self {
        Self {
            addr,
            store,
            key,
            refs: 1,
            doomed: false,
            dirty: false,
            stamped: false,
            leave_rankings_behind: false,
            buffers: Default::default(),
            unreported: [0; NUM_STREAMS],
        }
    }

    #[must_use]
    pub fn rankings(&self) -> CacheAddr {
        self.store.rankings_node
    }

    #[must_use]
    pub fn data_size(&self, index: usize) -> i32 {
        self.store.data_size[index]
    }

    fn update_size(&mut self, index: usize, new_size: usize) {
        let new_size = to_i32(new_size);
        let old_size = self.store.data_size[index];
        if old_size == new_size {
            return;
        }
        self.unreported[index] = self.unreported[index].saturating_add(new_size - old_size);
        self.store.data_size[index] = new_size;
    }

    fn has_pending_data(&self) -> bool {
        self.buffers.iter().any(Option::is_some) || self.unreported.iter().any(|size| *size != 0)
    }
}

/// Structural checks on a header read from `addr`, before trusting any of
/// its addresses.
#[must_use]
pub(crate) fn entry_sanity_check(store: &EntryStore, addr: CacheAddr) -> bool {
    let rankings = store.rankings_node;
    if !rankings.sanity_check_for_rankings() || store.key_len <= 0 {
        return false;
    }
    if store.reuse_count < 0 || store.refetch_count < 0 || store.state().is_none() {
        return false;
    }
    if store.next.is_initialized() && (!store.next.sanity_check_for_entry() || store.next == addr) {
        return false;
    }
    if !store.long_key.sanity_check() || !store.self_hash_ok() {
        return false;
    }
    let long = store.key_len > MAX_INTERNAL_KEY_LENGTH;
    if long != store.long_key.is_initialized() {
        return false;
    }
    if long && (store.key_len < MAX_BLOCK_SIZE) != store.long_key.is_block_file() {
        return false;
    }
    let key_len = usize::try_from(store.key_len).unwrap_or(usize::MAX);
    addr.num_blocks() == dc_types::num_blocks_for_entry(key_len) && store.num_blocks() == addr.num_blocks()
}

/// Checks on the contents of a header that passed [`entry_sanity_check`]:
/// key terminator and hash, and stream sizes against their addresses.
#[must_use]
pub(crate) fn data_sanity_check(store: &EntryStore, key: Option<&str>) -> bool {
    if !store.long_key.is_initialized() {
        let terminator = usize::try_from(store.key_len)
            .ok()
            .and_then(|len| store.key_area.get(len));
        if terminator != Some(&0) {
            return false;
        }
    }
    let Some(key) = key else {
        return false;
    };
    if store.hash != super_fast_hash(key.as_bytes()) {
        return false;
    }
    (0..NUM_STREAMS).all(|index| stream_sanity(store, index))
}

fn stream_sanity(store: &EntryStore, index: usize) -> bool {
    let size = store.data_size[index];
    let addr = store.data_addr[index];
    if size < 0 || !addr.sanity_check() {
        return false;
    }
    if size == 0 {
        return !addr.is_initialized();
    }
    if !addr.is_initialized() {
        return true;
    }
    if size <= MAX_BLOCK_SIZE {
        addr.is_block_file()
    } else {
        addr.is_separate_file()
    }
}

/// Drop stream addresses that cannot be trusted so deleting the entry
/// does not free someone else's storage.
pub(crate) fn fix_for_delete(store: &mut EntryStore) {
    for index in 0..NUM_STREAMS {
        if !stream_sanity(store, index) {
            store.data_addr[index] = CacheAddr::NULL;
            store.data_size[index] = store.data_size[index].max(0);
        }
    }
    if !store.long_key.is_initialized() {
        if let Some(byte) = usize::try_from(store.key_len)
            .ok()
            .and_then(|len| store.key_area.get_mut(len))
        {
            *byte = 0;
        }
    }
}

/// The parts of the backend stream I/O works on.
pub(crate) struct Streams<'a> {
    pub files: &'a mut BlockFiles,
    pub index: &'a mut IndexFile,
    pub storage: &'a dyn Storage,
    pub stats: &'a mut Stats,
    pub budget: &'a mut BufferBudget,
    pub max_file_size: i32,
    pub disabled: bool,
}

impl Streams<'_> {
    pub fn store_entry(&mut self, entry: &EntryImpl) -> Result<()> {
        self.files.write(entry.addr, 0, &entry.store.to_bytes())
    }

    /// Account a stream moving from `old` to `new` bytes on storage.
    pub fn modify_storage_size(&mut self, old: i32, new: i32) {
        if self.disabled || old == new {
            return;
        }
        let header = self.index.header_mut();
        header.num_bytes = header.num_bytes.saturating_add(new - old).max(0);
        self.stats.modify_storage_stats(old, new);
    }

    /// Storage for `size` bytes: a block record up to 16 KiB, an external
    /// file past that.
    pub fn create_storage(&mut self, size: usize) -> Result<CacheAddr> {
        let file_type = FileType::required_for_size(to_i32(size));
        if file_type != FileType::External {
            let block_size = file_type.block_size() as usize;
            let blocks = size.div_ceil(block_size).max(1);
            return self.files.create_block(file_type, blocks as u32);
        }
        if to_i32(size) > self.max_file_size {
            return Err(DcError::TooBig {
                requested: size as i64,
                limit: i64::from(self.max_file_size),
            });
        }
        self.create_external_file()
    }

    fn create_external_file(&mut self) -> Result<CacheAddr> {
        let header = self.index.header_mut();
        let mut number = u32::try_from(header.last_file).unwrap_or(0).wrapping_add(1);
        for _ in 0..MAX_EXTERNAL_PROBES {
            if number == 0 || number > MAX_EXTERNAL_FILE {
                number = 1;
            }
            let name = external_file_name(number);
            if self.storage.exists(&name) {
                number += 1;
                continue;
            }
            self.storage.create(&name)?;
            header.last_file = number as i32;
            trace!(target: "dc::backend", file = %name, "external_file_created");
            return Ok(CacheAddr::for_external(number));
        }
        Err(DcError::NoSpace)
    }

    /// Free the storage behind a stream or long key.
    pub fn delete_data(&mut self, addr: CacheAddr) -> Result<()> {
        if !addr.is_initialized() {
            return Ok(());
        }
        if addr.is_separate_file() {
            let name = external_file_name(addr.file_number());
            if let Err(err) = self.storage.remove(&name) {
                warn!(target: "dc::backend", file = %name, error = %err, "external_file_delete_failed");
            }
            return Ok(());
        }
        self.files.delete_block(addr, true)
    }

    fn read_raw(&mut self, addr: CacheAddr, offset: usize, buf: &mut [u8]) -> Result<()> {
        if addr.is_separate_file() {
            let file = self.storage.open(&external_file_name(addr.file_number()))?;
            return file.read_exact_at(offset as u64, buf);
        }
        self.files.read(addr, offset, buf)
    }

    fn write_raw(&mut self, addr: CacheAddr, offset: usize, data: &[u8]) -> Result<()> {
        if addr.is_separate_file() {
            let file = self.storage.open(&external_file_name(addr.file_number()))?;
            return file.write_all_at(offset as u64, data);
        }
        self.files.write(addr, offset, data)
    }

    fn set_external_len(&mut self, addr: CacheAddr, len: usize) -> Result<()> {
        let file = self.storage.open(&external_file_name(addr.file_number()))?;
        file.set_len(len as u64)
    }

    /// Read the key of `store`, inline or from its own storage.
    pub fn read_key(&mut self, store: &EntryStore) -> Result<String> {
        let bytes = match store.inline_key() {
            Some(bytes) => bytes.to_vec(),
            None => {
                let len = usize::try_from(store.key_len)
                    .map_err(|_| DcError::InvalidArgument("negative key length".to_owned()))?;
                let mut buf = vec![0_u8; len];
                self.read_raw(store.long_key, 0, &mut buf)?;
                buf
            }
        };
        String::from_utf8(bytes).map_err(|_| DcError::Corruption {
            addr: store.long_key.value(),
            detail: "key is not valid UTF-8".to_owned(),
        })
    }

    /// Store `key` for a new entry: inline when it fits, otherwise in a
    /// record or file of its own followed by a NUL.
    pub fn store_key(&mut self, store: &mut EntryStore, key: &str) -> Result<()> {
        store.hash = super_fast_hash(key.as_bytes());
        if store.set_inline_key(key.as_bytes()) {
            return Ok(());
        }
        let mut bytes = Vec::with_capacity(key.len() + 1);
        bytes.extend_from_slice(key.as_bytes());
        bytes.push(0);
        let addr = self.create_storage(bytes.len())?;
        let written = if addr.is_separate_file() {
            self.set_external_len(addr, bytes.len())
                .and_then(|()| self.write_raw(addr, 0, &bytes))
        } else {
            self.write_raw(addr, 0, &bytes)
        };
        if let Err(err) = written {
            let _ = self.delete_data(addr);
            return Err(err);
        }
        store.key_area.fill(0);
        store.key_len = to_i32(key.len());
        store.long_key = addr;
        Ok(())
    }

    /// Read up to `len` bytes of stream `index` at `offset`. Reads past the
    /// end are short.
    pub fn read_data(&mut self, entry: &mut EntryImpl, index: usize, offset: usize, len: usize) -> Result<Vec<u8>> {
        let entry_size = stream_len(&entry.store, index);
        if offset >= entry_size || len == 0 {
            return Ok(Vec::new());
        }
        let mut len = len.min(entry_size - offset);
        let addr = entry.store.data_addr[index];
        let eof = if addr.is_initialized() { entry_size } else { 0 };
        if let Some(buffer) = &entry.buffers[index] {
            if buffer.pre_read(eof, offset, &mut len) {
                let mut out = vec![0_u8; len];
                let produced = buffer.read(offset, &mut out);
                // The rest of the range lies past the buffer, on disk.
                let on_disk = eof.saturating_sub(offset + produced).min(len - produced);
                if on_disk > 0 {
                    self.read_raw(addr, offset + produced, &mut out[produced..produced + on_disk])?;
                }
                out.truncate(produced + on_disk);
                return Ok(out);
            }
        }
        if !addr.is_initialized() {
            return Err(DcError::Corruption {
                addr: entry.addr.value(),
                detail: format!("stream {index} has {entry_size} bytes but no storage"),
            });
        }
        let mut out = vec![0_u8; len];
        self.read_raw(addr, offset, &mut out)?;
        Ok(out)
    }

    /// Write `data` to stream `index` at `offset`, optionally cutting the
    /// stream at the end of the write.
    pub fn write_data(
        &mut self,
        entry: &mut EntryImpl,
        index: usize,
        offset: usize,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        let limit = usize::try_from(self.max_file_size).unwrap_or(0);
        let end = offset.saturating_add(data.len());
        if end > limit {
            return Err(DcError::TooBig {
                requested: end as i64,
                limit: limit as i64,
            });
        }
        let entry_size = stream_len(&entry.store, index);
        let extending = entry_size < end;
        let truncate = truncate && entry_size > end;

        self.prepare_target(entry, index, offset, data.len(), truncate)?;
        if extending || truncate {
            entry.update_size(index, end);
        }

        if let Some(buffer) = entry.buffers[index].as_mut() {
            buffer.write(offset, data);
            self.store_entry(entry)?;
            return Ok(data.len());
        }
        if end == 0 {
            self.store_entry(entry)?;
            return Ok(0);
        }

        let addr = entry.store.data_addr[index];
        if !addr.is_initialized() {
            return Err(DcError::Corruption {
                addr: entry.addr.value(),
                detail: format!("stream {index} lost its storage"),
            });
        }
        if addr.is_separate_file() && (truncate || (extending && data.is_empty())) {
            self.set_external_len(addr, end)?;
        }
        if !data.is_empty() {
            self.write_raw(addr, offset, data)?;
        }
        self.store_entry(entry)?;
        Ok(data.len())
    }

    fn prepare_target(
        &mut self,
        entry: &mut EntryImpl,
        index: usize,
        offset: usize,
        len: usize,
        truncate: bool,
    ) -> Result<()> {
        if truncate {
            return self.handle_truncation(entry, index, offset, len);
        }
        if offset == 0 && len == 0 {
            return Ok(());
        }
        let addr = entry.store.data_addr[index];
        if addr.is_initialized() {
            if addr.is_block_file() {
                self.move_to_local_buffer(entry, index)?;
            }
            if entry.buffers[index].is_none() && offset < BLOCK_LIMIT {
                self.copy_to_local_buffer(entry, index)?;
            }
        }
        if entry.buffers[index].is_none() {
            entry.buffers[index] = Some(UserBuffer::default());
        }
        self.prepare_buffer(entry, index, offset, len)
    }

    /// Cut the stream at `offset + len` before a truncating write.
    fn handle_truncation(&mut self, entry: &mut EntryImpl, index: usize, offset: usize, len: usize) -> Result<()> {
        let addr = entry.store.data_addr[index];
        let current = entry.store.data_size[index];
        let new_size = offset + len;

        if new_size == 0 {
            self.modify_storage_size(current - entry.unreported[index], 0);
            entry.store.data_addr[index] = CacheAddr::NULL;
            entry.store.data_size[index] = 0;
            entry.unreported[index] = 0;
            self.store_entry(entry)?;
            self.delete_data(addr)?;
            if let Some(buffer) = entry.buffers[index].take() {
                buffer.release(self.budget);
            }
            return Ok(());
        }

        if let Some(buffer) = entry.buffers[index].as_mut() {
            if !addr.is_initialized() {
                if new_size > buffer.start() {
                    buffer.truncate(new_size);
                    return Ok(());
                }
                buffer.reset(self.budget);
                return self.prepare_buffer(entry, index, offset, len);
            }
            if offset > buffer.start() {
                buffer.truncate(new_size);
            }
            entry.update_size(index, new_size);
            self.flush(entry, index, 0)?;
            if let Some(buffer) = entry.buffers[index].take() {
                buffer.release(self.budget);
            }
        }

        if new_size > BLOCK_LIMIT {
            // Large streams are cut directly on disk.
            return Ok(());
        }
        self.import_separate_file(entry, index, new_size)
    }

    /// Bring a stream that will fit a block back into memory.
    fn import_separate_file(&mut self, entry: &mut EntryImpl, index: usize, new_size: usize) -> Result<()> {
        if stream_len(&entry.store, index) > new_size {
            entry.update_size(index, new_size);
        }
        self.move_to_local_buffer(entry, index)
    }

    /// Load the first 16 KiB of a stream into a fresh buffer, keeping its
    /// storage.
    fn copy_to_local_buffer(&mut self, entry: &mut EntryImpl, index: usize) -> Result<()> {
        let addr = entry.store.data_addr[index];
        let len = stream_len(&entry.store, index).min(BLOCK_LIMIT);
        let mut buffer = UserBuffer::default();
        buffer.write(len, &[]);
        if len > 0 {
            if let Err(err) = self.read_raw(addr, 0, buffer.data_mut()) {
                buffer.release(self.budget);
                return Err(err);
            }
        }
        entry.buffers[index] = Some(buffer);
        Ok(())
    }

    /// Load a small stream into memory and free its storage.
    fn move_to_local_buffer(&mut self, entry: &mut EntryImpl, index: usize) -> Result<()> {
        self.copy_to_local_buffer(entry, index)?;
        let addr = entry.store.data_addr[index];
        entry.store.data_addr[index] = CacheAddr::NULL;
        self.store_entry(entry)?;
        self.delete_data(addr)?;

        let len = entry.store.data_size[index];
        self.modify_storage_size(len - entry.unreported[index], 0);
        entry.unreported[index] = len;
        Ok(())
    }

    /// Make room for `len` bytes at `offset` in the stream's buffer,
    /// flushing or dropping the buffer when the write cannot go there.
    fn prepare_buffer(&mut self, entry: &mut EntryImpl, index: usize, offset: usize, len: usize) -> Result<()> {
        let data_size = stream_len(&entry.store, index);
        let Some(buffer) = entry.buffers[index].as_ref() else {
            return Ok(());
        };
        if (buffer.end() > 0 && offset > buffer.end()) || offset > data_size {
            let addr = entry.store.data_addr[index];
            if addr.is_initialized() && addr.is_separate_file() {
                // The gap would have to be buffered too; write straight to
                // the file instead.
                self.flush(entry, index, 0)?;
                if let Some(buffer) = entry.buffers[index].take() {
                    buffer.release(self.budget);
                }
                return Ok(());
            }
        }

        let fits = entry.buffers[index]
            .as_mut()
            .is_some_and(|buffer| buffer.pre_write(offset, len, self.budget));
        if fits {
            return Ok(());
        }
        self.flush(entry, index, offset + len)?;
        let keep = entry.buffers[index]
            .as_mut()
            .is_some_and(|buffer| offset <= buffer.end() && buffer.pre_write(offset, len, self.budget));
        if !keep {
            if let Some(buffer) = entry.buffers[index].take() {
                buffer.release(self.budget);
            }
        }
        Ok(())
    }

    /// Write the stream's buffer to storage, creating the storage first if
    /// the stream has none. `min_len` is the size the storage must hold.
    fn flush(&mut self, entry: &mut EntryImpl, index: usize, min_len: usize) -> Result<()> {
        let size = stream_len(&entry.store, index).max(min_len);
        if size > 0 && !entry.store.data_addr[index].is_initialized() {
            self.create_data_block(entry, index, size)?;
        }
        if entry.store.data_size[index] == 0 {
            return Ok(());
        }
        let addr = entry.store.data_addr[index];
        let Some(buffer) = entry.buffers[index].as_mut() else {
            return Ok(());
        };
        if buffer.size() == 0 && buffer.start() == 0 {
            return Ok(());
        }
        let file_offset = if addr.is_block_file() { 0 } else { buffer.start() };
        if addr.is_block_file() {
            self.files.write(addr, file_offset, buffer.data())?;
        } else {
            let file = self.storage.open(&external_file_name(addr.file_number()))?;
            file.write_all_at(file_offset as u64, buffer.data())?;
        }
        buffer.reset(self.budget);
        Ok(())
    }

    fn create_data_block(&mut self, entry: &mut EntryImpl, index: usize, size: usize) -> Result<()> {
        let addr = self.create_storage(size)?;
        entry.store.data_addr[index] = addr;
        trace!(target: "dc::backend", entry = %entry.addr, index, %addr, size, "stream_storage_created");
        self.store_entry(entry)
    }

    /// Flush every buffer and report pending size changes. Returns false if
    /// some buffered data could not be written.
    pub fn close_streams(&mut self, entry: &mut EntryImpl) -> bool {
        if !entry.has_pending_data() {
            return true;
        }
        let mut ok = true;
        for index in 0..NUM_STREAMS {
            if entry.buffers[index].is_some() {
                if let Err(err) = self.flush(entry, index, 0) {
                    warn!(target: "dc::backend", entry = %entry.addr, index, error = %err, "stream_flush_failed");
                    ok = false;
                }
                if let Some(buffer) = entry.buffers[index].take() {
                    buffer.release(self.budget);
                }
            }
            let unreported = entry.unreported[index];
            if unreported != 0 {
                let size = entry.store.data_size[index];
                self.modify_storage_size(size - unreported, size);
                entry.unreported[index] = 0;
            }
        }
        if let Err(err) = self.store_entry(entry) {
            warn!(target: "dc::backend", entry = %entry.addr, error = %err, "entry_store_failed");
            ok = false;
        }
        ok
    }

    /// Free the data streams of `entry` and, with `everything`, its long
    /// key. The header and rankings node are the caller's.
    pub fn delete_entry_data(&mut self, entry: &mut EntryImpl, everything: bool) -> Result<()> {
        for index in 0..NUM_STREAMS {
            let addr = entry.store.data_addr[index];
            if addr.is_initialized() {
                let size = entry.store.data_size[index];
                self.modify_storage_size(size - entry.unreported[index], 0);
            }
            entry.store.data_addr[index] = CacheAddr::NULL;
            entry.store.data_size[index] = 0;
            entry.unreported[index] = 0;
            if let Some(buffer) = entry.buffers[index].take() {
                buffer.release(self.budget);
            }
            if addr.is_initialized() {
                self.store_entry(entry)?;
                self.delete_data(addr)?;
            }
        }
        if everything {
            let long_key = entry.store.long_key;
            if long_key.is_initialized() {
                self.delete_data(long_key)?;
            }
            self.modify_storage_size(entry.store.key_len, 0);
        }
        debug!(target: "dc::backend", entry = %entry.addr, everything, "entry_data_deleted");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::buffer::MAX_BUFFER_SIZE;
    use dc_block::MemStorage;
    use dc_types::num_blocks_for_entry;
    use std::sync::Arc;

    struct Fixture {
        storage: MemStorage,
        files: BlockFiles,
        index: IndexFile,
        stats: Stats,
        budget: BufferBudget,
    }

    impl Fixture {
        fn new() -> Self {
            let storage = MemStorage::new();
            let index = IndexFile::create(&storage, dc_types::BASE_TABLE_LEN, true).expect("index");
            let files = BlockFiles::open(Arc::new(storage.clone()), true).expect("files");
            Self {
                storage,
                files,
                index,
                stats: Stats::default(),
                budget: BufferBudget::new(8 * MAX_BUFFER_SIZE, true),
            }
        }

        fn streams(&mut self) -> Streams<'_> {
            Streams {
                files: &mut self.files,
                index: &mut self.index,
                storage: &self.storage,
                stats: &mut self.stats,
                budget: &mut self.budget,
                max_file_size: 10 * 1024 * 1024,
                disabled: false,
            }
        }

        fn entry(&mut self, key: &str) -> EntryImpl {
            let blocks = num_blocks_for_entry(key.len());
            let addr = self.files.create_block(FileType::Block256, blocks).expect("entry block");
            let node = self.files.create_block(FileType::Rankings, 1).expect("node block");
            let mut store = EntryStore::new(blocks);
            store.rankings_node = node;
            let mut streams = self.streams();
            streams.store_key(&mut store, key).expect("key");
            let entry = EntryImpl::new(addr, store, key.to_owned());
            streams.store_entry(&entry).expect("store");
            entry
        }

        fn num_bytes(&self) -> i32 {
            self.index.header().num_bytes
        }
    }

    fn read_all(streams: &mut Streams<'_>, entry: &mut EntryImpl, index: usize) -> Vec<u8> {
        let len = stream_len(&entry.store, index);
        streams.read_data(entry, index, 0, len).expect("read")
    }

    #[test]
    fn small_stream_is_buffered_until_close() {
        let mut fx = Fixture::new();
        let mut entry = fx.entry("small");
        let mut streams = fx.streams();
        assert_eq!(streams.write_data(&mut entry, 0, 0, b"hello", false).expect("write"), 5);
        assert!(!entry.store.data_addr[0].is_initialized());
        assert_eq!(read_all(&mut streams, &mut entry, 0), b"hello");

        assert!(streams.close_streams(&mut entry));
        let addr = entry.store.data_addr[0];
        assert!(addr.is_block_file());
        assert_eq!(addr.file_type(), FileType::Block256);
        assert_eq!(read_all(&mut streams, &mut entry, 0), b"hello");
        assert_eq!(fx.num_bytes(), 5);
    }

    #[test]
    fn large_stream_goes_to_an_external_file() {
        let mut fx = Fixture::new();
        let mut entry = fx.entry("large");
        let data = vec![0x5A_u8; 100 * 1024];
        let mut streams = fx.streams();
        streams.write_data(&mut entry, 1, 0, &data, false).expect("write");
        assert!(streams.close_streams(&mut entry));
        let addr = entry.store.data_addr[1];
        assert!(addr.is_separate_file());
        assert_eq!(read_all(&mut streams, &mut entry, 1), data);
        assert!(fx.storage.exists(&external_file_name(addr.file_number())));
        assert_eq!(fx.num_bytes(), 100 * 1024);
    }

    #[test]
    fn rewriting_a_block_stream_moves_it_back_to_memory() {
        let mut fx = Fixture::new();
        let mut entry = fx.entry("rewrite");
        let mut streams = fx.streams();
        streams.write_data(&mut entry, 0, 0, b"0123456789", false).expect("write");
        assert!(streams.close_streams(&mut entry));
        let first = entry.store.data_addr[0];

        streams.write_data(&mut entry, 0, 4, b"xy", false).expect("overwrite");
        assert!(!entry.store.data_addr[0].is_initialized());
        assert!(!streams.files.is_valid(first));
        assert!(streams.close_streams(&mut entry));
        assert_eq!(read_all(&mut streams, &mut entry, 0), b"0123xy6789");
        assert_eq!(fx.num_bytes(), 10);
    }

    #[test]
    fn truncating_write_shrinks_the_stream() {
        let mut fx = Fixture::new();
        let mut entry = fx.entry("truncate");
        let mut streams = fx.streams();
        streams.write_data(&mut entry, 0, 0, &[1; 3000], false).expect("write");
        assert!(streams.close_streams(&mut entry));
        streams.write_data(&mut entry, 0, 100, b"end", true).expect("truncate");
        assert_eq!(entry.data_size(0), 103);
        assert!(streams.close_streams(&mut entry));
        let data = read_all(&mut streams, &mut entry, 0);
        assert_eq!(data.len(), 103);
        assert_eq!(&data[100..], b"end");
        assert_eq!(fx.num_bytes(), 103);
    }

    #[test]
    fn truncating_to_zero_frees_storage() {
        let mut fx = Fixture::new();
        let mut entry = fx.entry("empty");
        let mut streams = fx.streams();
        streams.write_data(&mut entry, 2, 0, &[9; 500], false).expect("write");
        assert!(streams.close_streams(&mut entry));
        let addr = entry.store.data_addr[2];
        streams.write_data(&mut entry, 2, 0, &[], true).expect("truncate");
        assert_eq!(entry.data_size(2), 0);
        assert!(!entry.store.data_addr[2].is_initialized());
        assert!(!streams.files.is_valid(addr));
        assert_eq!(fx.num_bytes(), 0);
    }

    #[test]
    fn sparse_write_reads_back_zeros() {
        let mut fx = Fixture::new();
        let mut entry = fx.entry("sparse");
        let mut streams = fx.streams();
        streams.write_data(&mut entry, 0, 1000, b"tail", false).expect("write");
        assert_eq!(entry.data_size(0), 1004);
        let data = read_all(&mut streams, &mut entry, 0);
        assert!(data[..1000].iter().all(|b| *b == 0));
        assert_eq!(&data[1000..], b"tail");
    }

    #[test]
    fn reads_past_the_end_are_short() {
        let mut fx = Fixture::new();
        let mut entry = fx.entry("short");
        let mut streams = fx.streams();
        streams.write_data(&mut entry, 0, 0, b"abc", false).expect("write");
        assert_eq!(streams.read_data(&mut entry, 0, 1, 100).expect("read"), b"bc");
        assert!(streams.read_data(&mut entry, 0, 3, 10).expect("read").is_empty());
    }

    #[test]
    fn writes_over_the_file_limit_are_refused() {
        let mut fx = Fixture::new();
        let mut entry = fx.entry("big");
        let mut streams = fx.streams();
        streams.max_file_size = 1000;
        assert!(matches!(
            streams.write_data(&mut entry, 0, 990, &[0; 20], false),
            Err(DcError::TooBig { .. })
        ));
    }

    #[test]
    fn long_keys_get_their_own_storage() {
        let mut fx = Fixture::new();
        let key = "k".repeat(2000);
        let mut entry = fx.entry(&key);
        assert!(entry.store.long_key.is_block_file());
        let mut streams = fx.streams();
        assert_eq!(streams.read_key(&entry.store).expect("key"), key);
        assert!(data_sanity_check(&entry.store, Some(&key)));
        assert!(entry_sanity_check(&entry.store, entry.addr));
        streams.delete_entry_data(&mut entry, true).expect("delete");
        assert!(!streams.files.is_valid(entry.store.long_key));
    }

    #[test]
    fn sanity_checks_reject_damaged_headers() {
        let mut fx = Fixture::new();
        let entry = fx.entry("damaged");
        assert!(entry_sanity_check(&entry.store, entry.addr));
        assert!(data_sanity_check(&entry.store, Some("damaged")));
        assert!(!data_sanity_check(&entry.store, Some("other")));

        let mut store = entry.store.clone();
        store.data_size[0] = 100;
        store.data_addr[0] = CacheAddr::for_external(7);
        assert!(!data_sanity_check(&store, Some("damaged")));
        fix_for_delete(&mut store);
        assert!(!store.data_addr[0].is_initialized());

        let mut store = entry.store.clone();
        store.next = entry.addr;
        assert!(!entry_sanity_check(&store, entry.addr));
    }
}
