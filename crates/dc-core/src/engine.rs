//! One generation of the cache files and everything loaded from them.
//!
//! The engine owns the index, the block files, the rankings cursors and
//! the arena of open entries. It knows nothing about threads or restarts:
//! the backend wraps it, classifies its errors and throws it away when the
//! files have to be recreated.

use crate::buffer::BufferBudget;
use crate::config::{BackendConfig, BackendFlags};
use crate::entry::{data_sanity_check, entry_sanity_check, fix_for_delete, EntryImpl, Streams};
use crate::stats::{Counter, Stats};
use dc_alloc::BlockFiles;
use dc_block::Storage;
use dc_error::{CheckError, DcError, Result};
use dc_index::IndexFile;
use dc_ondisk::{corruption, EntryStore, IndexHeader, RankingsNode};
use dc_rankings::{
    ClassicEviction, EntryInfo, EvictionHost, EvictionPolicy, EvictionState, IterId, Lists,
    PostedTask, Rankings, TieredEviction,
};
use dc_types::{
    desired_index_table_len, max_storage_size_for_table, num_blocks_for_entry,
    preferred_cache_size, super_fast_hash, CacheAddr, CacheTime, EntryState, FileType, List,
    DEFAULT_CACHE_SIZE, INDEX_FILE_NAME, NUM_STREAMS,
};
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};
use tracing::{debug, error, info, warn};

/// Timer ticks before a close that did not grow the cache may trim.
const TRIM_DELAY_TICKS: u32 = 10;
/// Timer ticks between stats writes.
const STATS_STORE_TICKS: i64 = 10;
const MAX_SIZE_LIMIT: i64 = i32::MAX as i64 - i32::MAX as i64 / 10 - 1;

fn not_open(addr: CacheAddr) -> DcError {
    DcError::InvalidArgument(format!("entry {addr} is not open"))
}

fn check_stream(index: usize) -> Result<()> {
    if index >= NUM_STREAMS {
        return Err(DcError::InvalidArgument(format!("stream index {index} out of range")));
    }
    Ok(())
}

fn clamp_i32(value: i64) -> i32 {
    i32::try_from(value.clamp(0, i64::from(i32::MAX))).unwrap_or(i32::MAX)
}

/// Cache size to use when none was configured.
fn automatic_max_size(available: Option<i64>, existing: Option<(u32, i32)>) -> i64 {
    let Some(mut available) = available.filter(|space| *space >= 0) else {
        return i64::from(DEFAULT_CACHE_SIZE);
    };
    if let Some((_, num_bytes)) = existing {
        available += i64::from(num_bytes);
    }
    let mut size = i64::from(preferred_cache_size(available)).min(i64::from(DEFAULT_CACHE_SIZE) * 4);
    if let Some((table_len, _)) = existing {
        size = size.min(i64::from(max_storage_size_for_table(table_len)));
    }
    size
}

fn check_header(header: &IndexHeader, max_size: i64) -> Result<()> {
    if header.num_entries < 0 {
        return Err(DcError::Format("index: negative entry count".to_owned()));
    }
    let num_bytes = i64::from(header.num_bytes);
    let slack = i64::from(DEFAULT_CACHE_SIZE);
    if num_bytes < 0 || (max_size < i64::from(i32::MAX) - slack && num_bytes > max_size + slack) {
        return Err(DcError::Format(format!("index: byte count {num_bytes} out of range")));
    }
    Ok(())
}

/// Where a bucket chain walk ended.
enum ChainMatch {
    /// The entry with the key, with a reference taken.
    Found(CacheAddr),
    /// The entry linking to the target; `None` when it heads the bucket.
    Parent(Option<CacheAddr>),
    Missing,
}

#[derive(Clone, Copy)]
enum Target<'k> {
    Key(&'k str),
    Entry(CacheAddr),
}

/// Counters that survive a restart of the files.
#[derive(Debug, Clone, Copy, Default)]
pub(crate) struct PreservedCounters([i64; 4]);

const PRESERVED: [Counter; 4] = [
    Counter::FatalError,
    Counter::DoomCache,
    Counter::DoomRecent,
    Counter::LastReport,
];

pub(crate) struct Engine {
    storage: Arc<dyn Storage>,
    index: IndexFile,
    files: BlockFiles,
    rankings: Rankings,
    policy: Arc<dyn EvictionPolicy>,
    eviction: EvictionState,
    entries: HashMap<CacheAddr, EntryImpl>,
    stats: Stats,
    budget: BufferBudget,
    max_size: i64,
    flags: BackendFlags,
    pending_io: Arc<AtomicUsize>,
    num_refs: u32,
    max_refs: u32,
    entry_count: i64,
    byte_count: i64,
    user_load: bool,
    up_ticks: u32,
    disabled: bool,
    tasks: Vec<(Instant, PostedTask)>,
}

impl Engine {
    /// Open the files under `storage`, creating an empty cache when there is
    /// no index yet.
    pub fn open(config: &BackendConfig, storage: Arc<dyn Storage>, pending_io: Arc<AtomicUsize>) -> Result<Self> {
        let tiered = config.is_tiered();
        let explicit = config.max_size > 0;
        let created = !storage.exists(INDEX_FILE_NAME);

        let mut max_size = if explicit {
            config.max_size.min(MAX_SIZE_LIMIT)
        } else {
            automatic_max_size(config.available_space, None)
        };
        let mut index = if created {
            IndexFile::create(&*storage, desired_index_table_len(clamp_i32(max_size)), tiered)?
        } else {
            IndexFile::open(&*storage, tiered)?
        };
        if !created && !explicit {
            let existing = (index.table_len(), index.header().num_bytes);
            max_size = automatic_max_size(config.available_space, Some(existing));
        }
        check_header(index.header(), max_size)?;
        if config.mask != 0 {
            index.set_mask(config.mask)?;
        }

        let header = index.header_mut();
        if header.create_time.is_null() {
            header.create_time = CacheTime::now();
        }
        if !config.flags.upgrade_mode {
            header.this_id = header.this_id.wrapping_add(1);
            if header.this_id == 0 {
                header.this_id = 1;
            }
            if header.crash != 0 {
                warn!(target: "dc::backend", this_id = header.this_id, "previous_run_crashed");
            }
            header.crash = 1;
        }
        index.flush_header()?;

        let mut files = BlockFiles::open(Arc::clone(&storage), created)?;
        let stats = Stats::load(&mut files, index.header_mut())?;
        index.flush_header()?;

        let policy: Arc<dyn EvictionPolicy> = if tiered {
            Arc::new(TieredEviction)
        } else {
            Arc::new(ClassicEviction)
        };
        let mut engine = Self {
            storage,
            index,
            files,
            rankings: Rankings::new(tiered),
            policy,
            eviction: EvictionState::default(),
            entries: HashMap::new(),
            stats,
            budget: BufferBudget::for_cache_size(max_size, !config.flags.no_buffering),
            max_size,
            flags: config.flags,
            pending_io,
            num_refs: 0,
            max_refs: 0,
            entry_count: 0,
            byte_count: 0,
            user_load: false,
            up_ticks: 0,
            disabled: false,
            tasks: Vec::new(),
        };

        if let Some(node) = engine.lists().complete_transaction()? {
            engine.recovered_entry(node)?;
        }
        let desired = desired_index_table_len(clamp_i32(max_size));
        if explicit && config.mask == 0 && desired > engine.index.table_len() && !config.flags.upgrade_mode {
            engine.rehash(desired)?;
        }
        if i64::from(engine.index.header().num_bytes) > max_size && !config.flags.upgrade_mode {
            engine.post(PostedTask::Trim, Duration::ZERO);
        }

        let header = engine.index.header();
        info!(
            target: "dc::backend",
            created,
            policy = engine.policy.name(),
            max_size,
            table_len = engine.index.table_len(),
            num_entries = header.num_entries,
            num_bytes = header.num_bytes,
            this_id = header.this_id,
            "cache_opened"
        );
        Ok(engine)
    }

    /// Make sure the entry behind a node whose insert was just completed is
    /// reachable from the index.
    fn recovered_entry(&mut self, node: CacheAddr) -> Result<()> {
        let contents = self.lists().load(node)?.contents;
        if self.new_entry(contents).is_err() {
            warn!(target: "dc::backend", %node, "recovered_entry_unreadable");
            return Ok(());
        }
        let hash = self.entry(contents)?.store.hash;
        let bucket = self.index.bucket_for(hash);
        let linked = self.index.bucket(bucket).is_initialized();
        self.release(contents)?;
        if !linked {
            self.index.set_bucket(bucket, contents)?;
            info!(target: "dc::index", entry = %contents, bucket, "recovered_entry_linked");
        }
        Ok(())
    }

    /// Relink every entry into a table of `table_len` buckets.
    fn rehash(&mut self, table_len: u32) -> Result<()> {
        let heads: Vec<CacheAddr> = self.index.occupied().map(|(_, addr)| addr).collect();
        let mut seen = HashSet::new();
        let mut found = Vec::new();
        for head in heads {
            let mut current = head;
            while current.is_initialized() && seen.insert(current) {
                let Ok(raw) = self.files.read_record(current) else {
                    break;
                };
                let Ok(store) = EntryStore::parse(&raw) else {
                    break;
                };
                if !entry_sanity_check(&store, current) {
                    warn!(target: "dc::index", entry = %current, "rehash_dropped_chain_tail");
                    break;
                }
                let next = store.next;
                found.push((current, store));
                current = next;
            }
        }

        let old_len = self.index.table_len();
        self.index.rebuild_table(table_len)?;
        for (addr, mut store) in found {
            let bucket = self.index.bucket_for(store.hash);
            store.next = self.index.bucket(bucket);
            self.files.write(addr, 0, &store.to_bytes())?;
            self.index.set_bucket(bucket, addr)?;
        }
        self.index.flush()?;
        info!(target: "dc::index", old_len, table_len, "index_rehashed");
        Ok(())
    }

    fn streams(&mut self) -> Streams<'_> {
        let max_file_size = self.max_file_size();
        Streams {
            files: &mut self.files,
            index: &mut self.index,
            storage: &*self.storage,
            stats: &mut self.stats,
            budget: &mut self.budget,
            max_file_size,
            disabled: self.disabled,
        }
    }

    /// An open entry together with the stream view, borrowed disjointly.
    fn stream_parts(&mut self, addr: CacheAddr) -> Result<(&mut EntryImpl, Streams<'_>)> {
        let max_file_size = self.max_file_size();
        let entry = self.entries.get_mut(&addr).ok_or_else(|| not_open(addr))?;
        let streams = Streams {
            files: &mut self.files,
            index: &mut self.index,
            storage: &*self.storage,
            stats: &mut self.stats,
            budget: &mut self.budget,
            max_file_size,
            disabled: self.disabled,
        };
        Ok((entry, streams))
    }

    fn entry(&self, addr: CacheAddr) -> Result<&EntryImpl> {
        self.entries.get(&addr).ok_or_else(|| not_open(addr))
    }

    fn entry_mut(&mut self, addr: CacheAddr) -> Result<&mut EntryImpl> {
        self.entries.get_mut(&addr).ok_or_else(|| not_open(addr))
    }

    fn info_of(entry: &EntryImpl) -> EntryInfo {
        EntryInfo {
            addr: entry.addr,
            rankings: entry.rankings(),
            state: entry.store.state().unwrap_or(EntryState::Normal),
            reuse_count: entry.store.reuse_count,
            refetch_count: entry.store.refetch_count,
            leave_rankings_behind: entry.leave_rankings_behind,
        }
    }

    fn entry_info(&self, addr: CacheAddr) -> Result<EntryInfo> {
        self.entry(addr).map(Self::info_of)
    }

    fn this_id(&self) -> i32 {
        self.index.header().this_id
    }

    pub fn max_size(&self) -> i64 {
        self.max_size
    }

    pub fn set_max_size(&mut self, max_size: i64) {
        self.max_size = max_size.min(MAX_SIZE_LIMIT);
    }

    /// Largest stream an entry may hold.
    pub fn max_file_size(&self) -> i32 {
        clamp_i32(self.max_size / 8)
    }

    pub fn num_refs(&self) -> u32 {
        self.num_refs
    }

    pub fn entry_count(&self) -> i32 {
        self.index.header().num_entries
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    pub fn pending_io(&self) -> usize {
        self.pending_io.load(Ordering::Relaxed)
    }

    fn add_ref(&mut self) {
        self.num_refs += 1;
        self.max_refs = self.max_refs.max(self.num_refs);
    }

    fn increase_num_entries(&mut self) {
        let header = self.index.header_mut();
        header.num_entries = header.num_entries.saturating_add(1);
    }

    fn decrease_num_entries(&mut self) {
        let header = self.index.header_mut();
        header.num_entries -= 1;
        if header.num_entries < 0 {
            error!(target: "dc::backend", "entry_count_underflow");
            header.num_entries = 0;
        }
    }

    fn check_enabled(&self) -> Result<()> {
        if self.disabled {
            return Err(DcError::Disabled);
        }
        Ok(())
    }

    // ── Loading and releasing entries ───────────────────────────────────

    /// Take a reference on the entry at `addr`, loading and validating it
    /// if nobody has it open. A loaded entry may come back `dirty`: usable
    /// only to be removed.
    fn new_entry(&mut self, addr: CacheAddr) -> std::result::Result<(), CheckError> {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.refs += 1;
            self.add_ref();
            return Ok(());
        }
        if !addr.sanity_check_for_entry() || !self.files.is_valid(addr) {
            warn!(target: "dc::backend", %addr, "invalid_entry_address");
            return Err(CheckError::InvalidAddress);
        }
        let raw = self.files.read_record(addr).map_err(|_| CheckError::ReadFailure)?;
        let mut store = EntryStore::parse(&raw).map_err(|_| CheckError::InvalidEntry)?;
        if !entry_sanity_check(&store, addr) {
            warn!(target: "dc::backend", %addr, "entry_header_rejected");
            return Err(CheckError::InvalidEntry);
        }

        let node_addr = store.rankings_node;
        let this_id = self.this_id();
        let node = self.lists().load(node_addr).map_err(|_| CheckError::ReadFailure)?;
        let mut dirty = false;
        let mut leave_rankings_behind = false;
        let foreign = node.contents.is_initialized() && node.contents != addr;
        if foreign || !self.lists().sanity_check(node_addr, &node, false) {
            // The node cannot be trusted; never touch it through this entry.
            dirty = true;
            leave_rankings_behind = true;
            if !foreign {
                self.lists()
                    .set_contents(node_addr, CacheAddr::NULL)
                    .map_err(|_| CheckError::ReadFailure)?;
            }
        } else if !Lists::data_sanity_check(&node, false) {
            dirty = true;
            self.lists()
                .set_contents(node_addr, addr)
                .map_err(|_| CheckError::ReadFailure)?;
        }

        let key = self.streams().read_key(&store).ok();
        if !data_sanity_check(&store, key.as_deref()) {
            warn!(target: "dc::backend", %addr, "entry_data_rejected");
            dirty = true;
            fix_for_delete(&mut store);
            self.files
                .write(addr, 0, &store.to_bytes())
                .map_err(|_| CheckError::ReadFailure)?;
        }
        if node.dirty != 0 && node.dirty != this_id {
            dirty = true;
        }
        if dirty {
            debug!(target: "dc::backend", %addr, node_dirty = node.dirty, this_id, "entry_is_dirty");
        }

        let mut entry = EntryImpl::new(addr, store, key.unwrap_or_default());
        entry.dirty = dirty;
        entry.leave_rankings_behind = leave_rankings_behind;
        self.entries.insert(addr, entry);
        self.add_ref();
        Ok(())
    }

    /// Mark the entry's rankings node as in use by this run, so eviction
    /// skips it and a crash leaves it recognisably dirty.
    fn touch(&mut self, addr: CacheAddr) -> Result<()> {
        let entry = self.entry(addr)?;
        if entry.stamped || entry.leave_rankings_behind {
            return Ok(());
        }
        let node_addr = entry.rankings();
        let this_id = self.this_id();
        let mut lists = self.lists();
        let mut node = lists.load(node_addr)?;
        if node.dirty == 0 {
            node.dirty = this_id;
            lists.store(node_addr, &node)?;
        }
        self.entry_mut(addr)?.stamped = true;
        Ok(())
    }

    /// Drop one reference; the last one closes or destroys the entry.
    fn release(&mut self, addr: CacheAddr) -> Result<()> {
        let Some(entry) = self.entries.get_mut(&addr) else {
            return Ok(());
        };
        entry.refs = entry.refs.saturating_sub(1);
        self.num_refs = self.num_refs.saturating_sub(1);
        if entry.refs > 0 {
            return Ok(());
        }
        let Some(entry) = self.entries.remove(&addr) else {
            return Ok(());
        };
        if entry.doomed {
            self.destroy_doomed(entry)
        } else {
            self.close_clean(entry)
        }
    }

    fn close_clean(&mut self, mut entry: EntryImpl) -> Result<()> {
        let flushed = self.streams().close_streams(&mut entry);
        if entry.leave_rankings_behind || (flushed && !entry.stamped) {
            return Ok(());
        }
        let this_id = self.this_id();
        let node_addr = entry.rankings();
        let mut lists = self.lists();
        let mut node = lists.load(node_addr)?;
        node.dirty = if flushed {
            0
        } else if this_id == 1 {
            -1
        } else {
            this_id - 1
        };
        lists.store(node_addr, &node)
    }

    fn destroy_doomed(&mut self, mut entry: EntryImpl) -> Result<()> {
        let info = Self::info_of(&entry);
        self.streams().delete_entry_data(&mut entry, true)?;
        if self.policy.is_tiered() {
            let policy = Arc::clone(&self.policy);
            policy.on_destroy(self, &info)?;
            self.decrease_num_entries();
        }
        self.files.delete_block(entry.addr, true)?;
        if !entry.leave_rankings_behind {
            self.files.delete_block(entry.rankings(), true)?;
        }
        debug!(target: "dc::backend", entry = %entry.addr, "entry_destroyed");
        Ok(())
    }

    // ── Bucket chains ───────────────────────────────────────────────────

    /// Walk the chain `hash` falls into, repairing it as it goes: a loop
    /// or an unreadable entry cuts the chain there, and dirty entries are
    /// unlinked and destroyed.
    fn match_entry(&mut self, hash: u32, target: Target<'_>) -> Result<ChainMatch> {
        let bucket = self.index.bucket_for(hash);
        'restart: loop {
            let mut parent: Option<CacheAddr> = None;
            let mut current = self.index.bucket(bucket);
            let mut visited = HashSet::new();
            while current.is_initialized() {
                if self.disabled {
                    return Ok(ChainMatch::Missing);
                }
                if !visited.insert(current) {
                    warn!(target: "dc::index", bucket, entry = %current, "hash_chain_loop");
                    self.set_link(bucket, parent, CacheAddr::NULL)?;
                    return Ok(ChainMatch::Missing);
                }
                if let Err(code) = self.new_entry(current) {
                    warn!(target: "dc::index", bucket, entry = %current, error = code.as_str(), "hash_chain_cut");
                    self.set_link(bucket, parent, CacheAddr::NULL)?;
                    continue 'restart;
                }

                let entry = self.entry(current)?;
                let next = entry.store.next;
                if entry.dirty || self.index.bucket_for(entry.store.hash) != bucket {
                    self.set_link(bucket, parent, next)?;
                    self.destroy_invalid_entry(current)?;
                    continue 'restart;
                }
                let hit = match target {
                    Target::Key(key) => entry.store.hash == hash && entry.key == key,
                    Target::Entry(addr) => current == addr,
                };
                if hit {
                    return match target {
                        Target::Key(_) => Ok(ChainMatch::Found(current)),
                        Target::Entry(_) => {
                            self.release(current)?;
                            Ok(ChainMatch::Parent(parent))
                        }
                    };
                }
                self.release(current)?;
                parent = Some(current);
                current = next;
            }
            return Ok(ChainMatch::Missing);
        }
    }

    /// Point `parent` (or the bucket when there is none) at `child`.
    fn set_link(&mut self, bucket: usize, parent: Option<CacheAddr>, child: CacheAddr) -> Result<()> {
        match parent {
            Some(parent) => self.set_next(parent, child),
            None => self.index.set_bucket(bucket, child),
        }
    }

    fn set_next(&mut self, addr: CacheAddr, next: CacheAddr) -> Result<()> {
        if let Some(entry) = self.entries.get_mut(&addr) {
            entry.store.next = next;
            let bytes = entry.store.to_bytes();
            return self.files.write(addr, 0, &bytes);
        }
        let raw = self.files.read_record(addr)?;
        let mut store = EntryStore::parse(&raw).map_err(|err| corruption(addr, &err))?;
        store.next = next;
        self.files.write(addr, 0, &store.to_bytes())
    }

    /// Doom an entry found broken in a chain. The caller already unlinked it.
    fn destroy_invalid_entry(&mut self, addr: CacheAddr) -> Result<()> {
        warn!(target: "dc::backend", entry = %addr, "destroying_invalid_entry");
        let entry = self.entry(addr)?;
        if !entry.leave_rankings_behind {
            let node_addr = entry.rankings();
            let this_id = self.this_id();
            let mut lists = self.lists();
            let mut node = lists.load(node_addr)?;
            node.dirty = this_id;
            lists.store(node_addr, &node)?;
        }
        let mut info = self.entry_info(addr)?;
        let policy = Arc::clone(&self.policy);
        policy.on_doom(self, &mut info)?;
        self.entry_mut(addr)?.doomed = true;
        if !policy.is_tiered() {
            self.decrease_num_entries();
        }
        self.stats.on_event(Counter::InvalidEntry);
        self.release(addr)
    }

    /// Unlink an open entry from its chain and list and mark it doomed.
    /// Its storage goes when the last reference is dropped.
    fn internal_doom(&mut self, addr: CacheAddr) -> Result<()> {
        let hash = self.entry(addr)?.store.hash;
        let parent = self.match_entry(hash, Target::Entry(addr))?;
        if !self.entry(addr)?.doomed {
            self.touch(addr)?;
            let mut info = self.entry_info(addr)?;
            let policy = Arc::clone(&self.policy);
            policy.on_doom(self, &mut info)?;
            self.entry_mut(addr)?.doomed = true;
            if !policy.is_tiered() {
                self.decrease_num_entries();
            }
            self.stats.on_event(Counter::DoomEntry);
            debug!(target: "dc::backend", entry = %addr, "entry_doomed");
        }
        if let ChainMatch::Parent(parent) = parent {
            let child = self.entry(addr)?.store.next;
            let bucket = self.index.bucket_for(hash);
            self.set_link(bucket, parent, child)?;
        }
        Ok(())
    }

    /// Doom an entry the caller holds a reference on.
    pub fn doom_open_entry(&mut self, addr: CacheAddr) -> Result<()> {
        if self.entry(addr)?.doomed {
            return Ok(());
        }
        self.internal_doom(addr)
    }

    // ── Public entry operations ─────────────────────────────────────────

    pub fn open_entry(&mut self, key: &str) -> Result<CacheAddr> {
        self.check_enabled()?;
        let hash = super_fast_hash(key.as_bytes());
        let ChainMatch::Found(addr) = self.match_entry(hash, Target::Key(key))? else {
            self.stats.on_event(Counter::OpenMiss);
            return Err(DcError::NotFound(key.to_owned()));
        };
        if self.entry(addr)?.store.state() != Some(EntryState::Normal) {
            self.release(addr)?;
            self.stats.on_event(Counter::OpenMiss);
            return Err(DcError::NotFound(key.to_owned()));
        }
        if let Err(err) = self.open_found(addr) {
            let _ = self.release(addr);
            return Err(err);
        }
        debug!(target: "dc::backend", entry = %addr, "entry_opened");
        Ok(addr)
    }

    fn open_found(&mut self, addr: CacheAddr) -> Result<()> {
        self.touch(addr)?;
        let mut info = self.entry_info(addr)?;
        let policy = Arc::clone(&self.policy);
        policy.on_open(self, &mut info)?;
        policy.update_rank(self, &info, false)?;
        self.entry_count += 1;
        self.stats.on_event(Counter::OpenHit);
        Ok(())
    }

    pub fn create_entry(&mut self, key: &str) -> Result<CacheAddr> {
        self.check_enabled()?;
        if key.is_empty() {
            return Err(DcError::InvalidArgument("empty key".to_owned()));
        }
        let hash = super_fast_hash(key.as_bytes());
        if self.index.lookup(hash).is_initialized() {
            if let ChainMatch::Found(addr) = self.match_entry(hash, Target::Key(key))? {
                match self.entry(addr)?.store.state() {
                    Some(EntryState::Normal) => {
                        self.release(addr)?;
                        self.stats.on_event(Counter::CreateMiss);
                        return Err(DcError::Exists(key.to_owned()));
                    }
                    Some(EntryState::Evicted) if self.policy.is_tiered() => {
                        if let Err(err) = self.resurrect(addr) {
                            let _ = self.release(addr);
                            return Err(err);
                        }
                        return Ok(addr);
                    }
                    _ => {
                        // A leftover that cannot come back; replace it.
                        let doomed = self.internal_doom(addr);
                        self.release(addr)?;
                        doomed?;
                    }
                }
            }
        }
        self.create_fresh(key, hash)
    }

    fn resurrect(&mut self, addr: CacheAddr) -> Result<()> {
        self.touch(addr)?;
        let mut info = self.entry_info(addr)?;
        let policy = Arc::clone(&self.policy);
        policy.on_create(self, &mut info)?;
        self.entry_count += 1;
        self.stats.on_event(Counter::ResurrectHit);
        debug!(target: "dc::backend", entry = %addr, "entry_resurrected");
        Ok(())
    }

    fn create_fresh(&mut self, key: &str, hash: u32) -> Result<CacheAddr> {
        let num_blocks = num_blocks_for_entry(key.len());
        let addr = match self.files.create_block(FileType::Block256, num_blocks) {
            Ok(addr) => addr,
            Err(err) => {
                self.stats.on_event(Counter::CreateError);
                return Err(err);
            }
        };
        let node_addr = match self.files.create_block(FileType::Rankings, 1) {
            Ok(node) => node,
            Err(err) => {
                let _ = self.files.delete_block(addr, false);
                self.stats.on_event(Counter::CreateError);
                return Err(err);
            }
        };
        let mut store = EntryStore::new(num_blocks);
        store.rankings_node = node_addr;
        store.creation_time = CacheTime::now();
        if let Err(err) = self.streams().store_key(&mut store, key) {
            let _ = self.files.delete_block(addr, false);
            let _ = self.files.delete_block(node_addr, false);
            self.stats.on_event(Counter::CreateError);
            return Err(err);
        }

        let bucket = self.index.bucket_for(hash);
        store.next = self.index.bucket(bucket);
        let node = RankingsNode {
            contents: addr,
            dirty: self.this_id(),
            ..RankingsNode::default()
        };
        self.lists().store(node_addr, &node)?;
        self.files.write(addr, 0, &store.to_bytes())?;
        self.increase_num_entries();
        self.index.set_bucket(bucket, addr)?;

        let mut entry = EntryImpl::new(addr, store, key.to_owned());
        entry.stamped = true;
        self.entries.insert(addr, entry);
        self.add_ref();

        let mut info = self.entry_info(addr)?;
        let policy = Arc::clone(&self.policy);
        if let Err(err) = policy.on_create(self, &mut info) {
            let _ = self.release(addr);
            return Err(err);
        }
        self.streams().modify_storage_size(0, i32::try_from(key.len()).unwrap_or(i32::MAX));
        self.entry_count += 1;
        self.stats.on_event(Counter::CreateHit);
        debug!(target: "dc::backend", entry = %addr, bucket, "entry_created");
        Ok(addr)
    }

    pub fn doom_entry(&mut self, key: &str) -> Result<()> {
        self.check_enabled()?;
        let hash = super_fast_hash(key.as_bytes());
        let ChainMatch::Found(addr) = self.match_entry(hash, Target::Key(key))? else {
            return Err(DcError::NotFound(key.to_owned()));
        };
        if self.entry(addr)?.store.state() != Some(EntryState::Normal) {
            self.release(addr)?;
            return Err(DcError::NotFound(key.to_owned()));
        }
        let doomed = self.doom_open_entry(addr);
        let released = self.release(addr);
        doomed.and(released)
    }

    /// Drop the reference an entry handle held.
    pub fn close_entry(&mut self, addr: CacheAddr) -> Result<()> {
        let before = self.index.header().num_bytes;
        self.release(addr)?;
        // Flushing buffered streams reports their size only now.
        let grew = self.index.header().num_bytes > before;
        self.maybe_trim(grew)
    }

    /// Close every open entry regardless of references. Used when the
    /// handles are gone but their closes never arrived.
    fn close_all(&mut self) {
        let open: Vec<CacheAddr> = self.entries.keys().copied().collect();
        for addr in open {
            if let Some(entry) = self.entries.get_mut(&addr) {
                self.num_refs = self.num_refs.saturating_sub(entry.refs.saturating_sub(1));
                entry.refs = 1;
            }
            if let Err(err) = self.release(addr) {
                warn!(target: "dc::backend", entry = %addr, error = %err, "entry_close_failed");
            }
        }
    }

    pub fn read_data(&mut self, addr: CacheAddr, index: usize, offset: usize, len: usize) -> Result<Vec<u8>> {
        check_stream(index)?;
        let result = {
            let (entry, mut streams) = self.stream_parts(addr)?;
            streams.read_data(entry, index, offset, len)
        };
        match result {
            Ok(data) => {
                self.stats.on_event(Counter::ReadData);
                self.byte_count = self.byte_count.saturating_add(data.len() as i64);
                self.update_rank(addr, false)?;
                Ok(data)
            }
            Err(err) => {
                warn!(target: "dc::backend", entry = %addr, index, error = %err, "stream_read_failed");
                if let Err(doom) = self.doom_open_entry(addr) {
                    warn!(target: "dc::backend", entry = %addr, error = %doom, "doom_after_read_failure_failed");
                }
                Err(err)
            }
        }
    }

    pub fn write_data(
        &mut self,
        addr: CacheAddr,
        index: usize,
        offset: usize,
        data: &[u8],
        truncate: bool,
    ) -> Result<usize> {
        check_stream(index)?;
        let result = {
            let (entry, mut streams) = self.stream_parts(addr)?;
            streams.write_data(entry, index, offset, data, truncate)
        };
        let written = match result {
            Ok(written) => written,
            Err(DcError::TooBig { requested, limit }) => {
                self.stats.modify_storage_stats(0, clamp_i32(requested));
                return Err(DcError::TooBig { requested, limit });
            }
            Err(err) => return Err(err),
        };
        self.stats.on_event(Counter::WriteData);
        self.byte_count = self.byte_count.saturating_add(written as i64);
        self.update_rank(addr, true)?;
        self.maybe_trim(true)?;
        Ok(written)
    }

    pub fn data_size(&self, addr: CacheAddr, index: usize) -> Result<i32> {
        check_stream(index)?;
        Ok(self.entry(addr)?.data_size(index))
    }

    /// Last-used and last-modified times of an open entry.
    pub fn entry_times(&mut self, addr: CacheAddr) -> Result<(SystemTime, SystemTime)> {
        let (used, modified) = self.node_times(addr)?;
        Ok((used.to_system_time(), modified.to_system_time()))
    }

    fn node_times(&mut self, addr: CacheAddr) -> Result<(CacheTime, CacheTime)> {
        let entry = self.entry(addr)?;
        if entry.leave_rankings_behind {
            let created = entry.store.creation_time;
            return Ok((created, created));
        }
        let node_addr = entry.rankings();
        let node = self.lists().load(node_addr)?;
        Ok((node.last_used, node.last_modified))
    }

    fn update_rank(&mut self, addr: CacheAddr, modified: bool) -> Result<()> {
        let entry = self.entry(addr)?;
        if entry.doomed {
            // Off the lists; keep the times current for the handle.
            if entry.leave_rankings_behind {
                return Ok(());
            }
            let node_addr = entry.rankings();
            let mut lists = self.lists();
            let mut node = lists.load(node_addr)?;
            let now = CacheTime::now();
            node.last_used = now;
            if modified {
                node.last_modified = now;
            }
            return lists.store(node_addr, &node);
        }
        let info = Self::info_of(entry);
        let policy = Arc::clone(&self.policy);
        policy.update_rank(self, &info, modified)
    }

    pub fn on_external_cache_hit(&mut self, key: &str) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        let hash = super_fast_hash(key.as_bytes());
        if let ChainMatch::Found(addr) = self.match_entry(hash, Target::Key(key))? {
            let ranked = if self.entry(addr)?.store.state() == Some(EntryState::Normal) {
                self.update_rank(addr, false)
            } else {
                Ok(())
            };
            self.release(addr)?;
            ranked?;
        }
        Ok(())
    }

    // ── Enumeration ─────────────────────────────────────────────────────

    /// Next entry of the enumeration in `slot`, starting one if the slot is
    /// empty. The entry comes back with a reference taken.
    pub fn open_next_entry(&mut self, slot: &mut Option<IterId>, forward: bool) -> Result<Option<(CacheAddr, String)>> {
        self.check_enabled()?;
        let id = match *slot {
            Some(id) => {
                self.rankings.set_direction(id, forward);
                id
            }
            None => {
                let id = self.rankings.new_iterator(forward);
                *slot = Some(id);
                id
            }
        };
        let Some(addr) = self.next_enumerated(id)? else {
            return Ok(None);
        };
        let key = self.entry(addr)?.key.clone();
        Ok(Some((addr, key)))
    }

    pub fn end_enumeration(&mut self, id: IterId) {
        self.rankings.end_iterator(id);
    }

    fn next_enumerated(&mut self, id: IterId) -> Result<Option<CacheAddr>> {
        let Some(forward) = self.rankings.is_forward(id) else {
            return Ok(None);
        };
        let lists: &[List] = if self.policy.is_tiered() {
            &List::LIVE
        } else {
            &[List::NoUse]
        };
        let attempts = self.files.allocated_records(FileType::Rankings)? + 1;
        for _ in 0..attempts {
            let mut best: Option<(List, CacheAddr, u64)> = None;
            for &list in lists {
                let Some((node_addr, node)) = self.lists().peek(id, list)? else {
                    continue;
                };
                let used = node.last_used.0;
                let better = best.map_or(true, |(_, _, time)| if forward { used > time } else { used < time });
                if better {
                    best = Some((list, node_addr, used));
                }
            }
            let Some((list, node, _)) = best else {
                return Ok(None);
            };
            // A node that cannot be handed out was taken off its list, so
            // peeking again moves on.
            if let Some(addr) = self.enumerated(node, list)? {
                self.lists().advance(id, list, node);
                return Ok(Some(addr));
            }
        }
        Ok(None)
    }

    /// Open the entry behind a list node, cleaning up the node when the
    /// entry is unusable.
    fn enumerated(&mut self, node: CacheAddr, list: List) -> Result<Option<CacheAddr>> {
        let contents = self.lists().load(node)?.contents;
        if let Err(code) = self.new_entry(contents) {
            warn!(target: "dc::backend", %node, error = code.as_str(), "listed_entry_unreadable");
            self.lists().remove(node, list)?;
            if code == CheckError::InvalidAddress {
                self.files.delete_block(node, true)?;
            }
            return Ok(None);
        }
        let entry = self.entry(contents)?;
        if entry.rankings() != node {
            warn!(target: "dc::backend", %node, entry = %contents, "rankings_node_mismatch");
            self.release(contents)?;
            self.lists().remove(node, list)?;
            self.files.delete_block(node, true)?;
            return Ok(None);
        }
        if entry.dirty {
            let doomed = self.internal_doom(contents);
            self.release(contents)?;
            doomed?;
            return Ok(None);
        }
        if let Err(err) = self.touch(contents) {
            let _ = self.release(contents);
            return Err(err);
        }
        Ok(Some(contents))
    }

    /// Doom every entry last used in `[start, end)`.
    pub fn doom_entries_between(&mut self, start: SystemTime, end: SystemTime) -> Result<()> {
        self.check_enabled()?;
        self.doom_times(CacheTime::from_system_time(start), CacheTime::from_system_time(end))
    }

    pub fn doom_entries_since(&mut self, start: SystemTime) -> Result<()> {
        self.check_enabled()?;
        self.stats.on_event(Counter::DoomRecent);
        self.doom_times(CacheTime::from_system_time(start), CacheTime(u64::MAX))
    }

    fn doom_times(&mut self, start: CacheTime, end: CacheTime) -> Result<()> {
        let id = self.rankings.new_iterator(true);
        let result = self.doom_range(id, start, end);
        self.rankings.end_iterator(id);
        result
    }

    fn doom_range(&mut self, id: IterId, start: CacheTime, end: CacheTime) -> Result<()> {
        // Newest first: stop at the first entry older than the range.
        while let Some(addr) = self.next_enumerated(id)? {
            let used = match self.node_times(addr) {
                Ok((used, _)) => used,
                Err(err) => {
                    let _ = self.release(addr);
                    return Err(err);
                }
            };
            let doomed = if used >= start && used < end {
                self.doom_open_entry(addr)
            } else {
                Ok(())
            };
            self.release(addr)?;
            doomed?;
            if used < start {
                break;
            }
        }
        Ok(())
    }

    /// Doom everything while entries are still referenced. With nothing
    /// open the backend recreates the files instead.
    pub fn doom_all_in_place(&mut self) -> Result<()> {
        let policy = Arc::clone(&self.policy);
        policy.trim_cache(self, true)
    }

    pub fn count_doom_cache(&mut self) {
        self.stats.on_event(Counter::DoomCache);
    }

    // ── Eviction, timer and posted work ─────────────────────────────────

    /// Trim when over the limit. Growth trims at once; otherwise the
    /// backend waits out its warm-up ticks first.
    fn maybe_trim(&mut self, grew: bool) -> Result<()> {
        let over = i64::from(self.index.header().num_bytes) > self.max_size;
        let warmed_up = self.up_ticks > TRIM_DELAY_TICKS || self.flags.no_random;
        if over && !self.flags.upgrade_mode && (grew || warmed_up) {
            let policy = Arc::clone(&self.policy);
            policy.trim_cache(self, false)?;
        }
        Ok(())
    }

    pub fn trim_for_test(&mut self, empty: bool) -> Result<()> {
        self.eviction.test_mode = true;
        let policy = Arc::clone(&self.policy);
        policy.trim_cache(self, empty)
    }

    pub fn trim_deleted_for_test(&mut self, empty: bool) -> Result<()> {
        self.eviction.test_mode = true;
        let policy = Arc::clone(&self.policy);
        policy.trim_deleted(self, empty)
    }

    /// When the earliest posted task is due.
    pub fn next_task_deadline(&self) -> Option<Instant> {
        self.tasks.iter().map(|(due, _)| *due).min()
    }

    /// Run every posted task that is due at `now`.
    pub fn run_due_tasks(&mut self, now: Instant) -> Result<()> {
        let (due, later): (Vec<_>, Vec<_>) = self.tasks.drain(..).partition(|(at, _)| *at <= now);
        self.tasks = later;
        for (_, task) in due {
            if self.disabled {
                break;
            }
            let policy = Arc::clone(&self.policy);
            match task {
                PostedTask::Trim => policy.trim_cache(self, false)?,
                PostedTask::TrimDeleted => policy.trim_deleted(self, false)?,
                PostedTask::DelayedTrim => policy.delayed_trim(self)?,
            }
        }
        Ok(())
    }

    pub fn on_stats_timer(&mut self) {
        if self.disabled {
            return;
        }
        self.stats.on_event(Counter::Timer);
        let time = self.stats.counter(Counter::Timer);
        let current = self.stats.counter(Counter::OpenEntries);
        let refs = i64::from(self.num_refs);
        // A sampled average of open entries that does not sink to zero.
        if refs != 0 && current != refs {
            let mut diff = (refs - current) / 50;
            if diff == 0 {
                diff = if refs > current { 1 } else { -1 };
            }
            self.stats.set_counter(Counter::OpenEntries, current + diff);
            self.stats.set_counter(Counter::MaxEntries, i64::from(self.max_refs));
        }
        self.user_load = self.entry_count > 300 || self.byte_count > 7 * 1024 * 1024;
        self.entry_count = 0;
        self.byte_count = 0;
        self.up_ticks += 1;
        if time % STATS_STORE_TICKS == 0 {
            self.stats.store(&mut self.files);
        }
    }

    // ── Checks, stats and lifecycle ─────────────────────────────────────

    /// Verify lists, counters and every chained entry. Returns the number
    /// of dirty entries found.
    pub fn self_check(&mut self) -> std::result::Result<u32, CheckError> {
        let listed = self.lists().self_check()?;
        let num_entries = self.index.header().num_entries;
        if listed != num_entries {
            error!(target: "dc::backend", listed, num_entries, "list_count_mismatch");
            return Err(CheckError::NumEntriesMismatch);
        }
        self.check_all_entries()
    }

    fn check_all_entries(&mut self) -> std::result::Result<u32, CheckError> {
        let heads: Vec<(usize, CacheAddr)> = self.index.occupied().collect();
        let mut dirty = 0_u32;
        let mut valid = 0_u32;
        for (bucket, head) in heads {
            let mut current = head;
            let mut visited = HashSet::new();
            while current.is_initialized() {
                if !visited.insert(current) {
                    error!(target: "dc::backend", bucket, entry = %current, "hash_chain_loop");
                    return Err(CheckError::InvalidLinks);
                }
                self.new_entry(current)?;
                let verdict = self.check_entry(current, bucket);
                let next = self.entries.get(&current).map_or(CacheAddr::NULL, |entry| entry.store.next);
                self.release(current).map_err(|_| CheckError::ReadFailure)?;
                match verdict {
                    Some(true) => dirty += 1,
                    Some(false) => valid += 1,
                    None => {
                        error!(target: "dc::backend", bucket, entry = %current, "entry_check_failed");
                        return Err(CheckError::InvalidEntry);
                    }
                }
                current = next;
            }
        }
        let num_entries = self.index.header().num_entries;
        if i64::from(valid + dirty) != i64::from(num_entries) {
            error!(target: "dc::backend", valid, dirty, num_entries, "entry_count_mismatch");
            return Err(CheckError::NumEntriesMismatch);
        }
        Ok(dirty)
    }

    /// `Some(dirty)` for a usable entry, `None` for a broken one.
    fn check_entry(&mut self, addr: CacheAddr, bucket: usize) -> Option<bool> {
        let entry = self.entries.get(&addr)?;
        if entry.dirty {
            return Some(true);
        }
        let node_addr = entry.rankings();
        let blocks: Vec<CacheAddr> = entry
            .store
            .data_addr
            .iter()
            .copied()
            .filter(|data| data.is_initialized() && data.is_block_file())
            .collect();
        if self.index.bucket_for(entry.store.hash) != bucket {
            return None;
        }
        let ok = self.files.is_valid(addr)
            && self.files.is_valid(node_addr)
            && blocks.into_iter().all(|data| self.files.is_valid(data))
            && self.lists().load(node_addr).is_ok_and(|node| node.self_hash_ok());
        ok.then_some(false)
    }

    pub fn get_stats(&self) -> Vec<(String, String)> {
        let header = self.index.header();
        let mut items = vec![
            ("Entries".to_owned(), header.num_entries.to_string()),
            ("Pending IO".to_owned(), self.pending_io().to_string()),
            ("Max size".to_owned(), self.max_size.to_string()),
            ("Current size".to_owned(), header.num_bytes.to_string()),
            ("Cache type".to_owned(), "Blockfile Cache".to_owned()),
        ];
        items.extend(self.stats.items());
        items
    }

    pub fn counter(&self, counter: Counter) -> i64 {
        self.stats.counter(counter)
    }

    pub fn preserved_counters(&self) -> PreservedCounters {
        PreservedCounters(PRESERVED.map(|counter| self.stats.counter(counter)))
    }

    pub fn restore_counters(&mut self, saved: PreservedCounters) {
        for (counter, value) in PRESERVED.into_iter().zip(saved.0) {
            self.stats.set_counter(counter, value);
        }
    }

    /// Stop using these files: they are rejected the next time they are
    /// opened, and every operation fails until the backend restarts.
    pub fn mark_critical(&mut self, code: CheckError) {
        error!(target: "dc::backend", code = code.code(), error = code.as_str(), "critical_error");
        self.stats.on_event(Counter::FatalError);
        self.index.header_mut().table_len = 1;
        if let Err(err) = self.index.flush_header() {
            warn!(target: "dc::backend", error = %err, "index_header_flush_failed");
        }
        self.disabled = true;
        self.tasks.clear();
    }

    /// Write everything back and clear the crash flag.
    pub fn shutdown(mut self) -> Result<()> {
        self.close_all();
        self.stats.store(&mut self.files);
        if !self.flags.upgrade_mode && !self.disabled {
            self.index.header_mut().crash = 0;
        }
        self.index.flush()?;
        self.files.flush()?;
        info!(target: "dc::backend", num_entries = self.entry_count(), "cache_closed");
        Ok(())
    }

    /// Abandon the files before they are deleted.
    pub fn discard(mut self) {
        self.close_all();
        debug!(target: "dc::backend", "cache_files_discarded");
    }
}

impl EvictionHost for Engine {
    fn lists(&mut self) -> Lists<'_> {
        self.rankings.lists(&mut self.files, &mut self.index)
    }

    fn header(&mut self) -> &mut IndexHeader {
        self.index.header_mut()
    }

    fn eviction_state(&mut self) -> &mut EvictionState {
        &mut self.eviction
    }

    fn max_size(&self) -> i64 {
        self.max_size
    }

    fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn is_loaded(&self) -> bool {
        !self.flags.no_load_protection && (self.pending_io() > 5 || self.user_load)
    }

    fn enumerated_entry(&mut self, node: CacheAddr, list: List) -> Result<Option<EntryInfo>> {
        match self.enumerated(node, list)? {
            Some(addr) => self.entry_info(addr).map(Some),
            None => Ok(None),
        }
    }

    fn release_entry(&mut self, entry: CacheAddr) -> Result<()> {
        self.release(entry)
    }

    fn doom_entry(&mut self, entry: CacheAddr) -> Result<()> {
        self.doom_open_entry(entry)
    }

    fn delete_entry_data(&mut self, entry: CacheAddr) -> Result<()> {
        let (entry, mut streams) = self.stream_parts(entry)?;
        streams.delete_entry_data(entry, false)
    }

    fn store_entry_info(&mut self, info: &EntryInfo) -> Result<()> {
        let entry = self.entry_mut(info.addr)?;
        entry.store.state = info.state.to_raw();
        entry.store.reuse_count = info.reuse_count;
        entry.store.refetch_count = info.refetch_count;
        let bytes = entry.store.to_bytes();
        self.files.write(info.addr, 0, &bytes)
    }

    fn on_trim_entry(&mut self) {
        self.stats.on_event(Counter::TrimEntry);
    }

    fn post(&mut self, task: PostedTask, delay: Duration) {
        self.tasks.push((Instant::now() + delay, task));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::EvictionKind;
    use dc_block::MemStorage;

    fn config(eviction: EvictionKind) -> BackendConfig {
        BackendConfig {
            max_size: 4 * 1024 * 1024,
            eviction,
            flags: BackendFlags {
                no_random: true,
                ..BackendFlags::default()
            },
            ..BackendConfig::default()
        }
    }

    fn open(storage: &MemStorage, eviction: EvictionKind) -> Engine {
        Engine::open(&config(eviction), Arc::new(storage.clone()), Arc::default()).expect("open")
    }

    #[test]
    fn create_open_and_reopen_after_shutdown() {
        let storage = MemStorage::new();
        let mut engine = open(&storage, EvictionKind::Tiered);
        let addr = engine.create_entry("alpha").expect("create");
        engine.write_data(addr, 0, 0, b"payload", false).expect("write");
        engine.close_entry(addr).expect("close");
        assert!(matches!(engine.create_entry("alpha"), Err(DcError::Exists(_))));
        engine.shutdown().expect("shutdown");

        let mut engine = open(&storage, EvictionKind::Tiered);
        let again = engine.open_entry("alpha").expect("open");
        assert_eq!(again, addr);
        assert_eq!(engine.read_data(again, 0, 0, 100).expect("read"), b"payload");
        engine.close_entry(again).expect("close");
        assert_eq!(engine.self_check(), Ok(0));
    }

    #[test]
    fn doomed_entry_is_freed_on_last_close() {
        let storage = MemStorage::new();
        let mut engine = open(&storage, EvictionKind::Classic);
        let addr = engine.create_entry("gone").expect("create");
        engine.doom_entry("gone").expect("doom");
        assert!(matches!(engine.open_entry("gone"), Err(DcError::NotFound(_))));
        assert!(engine.files.is_valid(addr));
        engine.close_entry(addr).expect("close");
        assert!(!engine.files.is_valid(addr));
        assert_eq!(engine.entry_count(), 0);
        assert_eq!(engine.self_check(), Ok(0));
    }

    #[test]
    fn colliding_keys_share_a_chain() {
        let storage = MemStorage::new();
        let mut cfg = config(EvictionKind::Tiered);
        cfg.mask = 0x1;
        let mut engine = Engine::open(&cfg, Arc::new(storage.clone()), Arc::default()).expect("open");
        let keys: Vec<String> = (0..12).map(|i| format!("key-{i}")).collect();
        for key in &keys {
            let addr = engine.create_entry(key).expect("create");
            engine.close_entry(addr).expect("close");
        }
        engine.doom_entry("key-5").expect("doom middle");
        for key in &keys {
            let opened = engine.open_entry(key);
            if key == "key-5" {
                assert!(opened.is_err());
            } else {
                engine.close_entry(opened.expect("open")).expect("close");
            }
        }
        assert_eq!(engine.self_check(), Ok(0));
    }

    #[test]
    fn tiered_eviction_keeps_headers_for_resurrection() {
        let storage = MemStorage::new();
        let mut engine = open(&storage, EvictionKind::Tiered);
        let addr = engine.create_entry("victim").expect("create");
        engine.write_data(addr, 1, 0, &[7; 2000], false).expect("write");
        engine.close_entry(addr).expect("close");

        engine.trim_for_test(false).expect("trim");
        assert!(matches!(engine.open_entry("victim"), Err(DcError::NotFound(_))));
        assert_eq!(engine.entry_count(), 1);

        let back = engine.create_entry("victim").expect("resurrect");
        assert_eq!(back, addr);
        assert_eq!(engine.data_size(back, 1).expect("size"), 0);
        assert_eq!(engine.counter(Counter::ResurrectHit), 1);
        engine.close_entry(back).expect("close");
    }

    #[test]
    fn enumeration_visits_every_entry_once() {
        let storage = MemStorage::new();
        let mut engine = open(&storage, EvictionKind::Tiered);
        for i in 0..5 {
            let addr = engine.create_entry(&format!("e{i}")).expect("create");
            engine.close_entry(addr).expect("close");
        }
        let reopened = engine.open_entry("e1").expect("open");
        engine.close_entry(reopened).expect("close");

        let mut slot = None;
        let mut seen = Vec::new();
        while let Some((addr, key)) = engine.open_next_entry(&mut slot, true).expect("next") {
            seen.push(key);
            engine.close_entry(addr).expect("close");
        }
        seen.sort();
        assert_eq!(seen, ["e0", "e1", "e2", "e3", "e4"]);
    }

    #[test]
    fn critical_error_poisons_the_index() {
        let storage = MemStorage::new();
        let mut engine = open(&storage, EvictionKind::Tiered);
        engine.mark_critical(CheckError::InvalidLinks);
        assert!(matches!(engine.create_entry("x"), Err(DcError::Disabled)));
        engine.shutdown().expect("shutdown");
        assert!(matches!(
            Engine::open(&config(EvictionKind::Tiered), Arc::new(storage.clone()), Arc::default()),
            Err(DcError::Format(_))
        ));
    }

    #[test]
    fn automatic_size_follows_free_space() {
        assert_eq!(automatic_max_size(None, None), i64::from(DEFAULT_CACHE_SIZE));
        let small = automatic_max_size(Some(10 * 1024 * 1024), None);
        assert_eq!(small, 8 * 1024 * 1024);
        let huge = automatic_max_size(Some(i64::MAX / 4), None);
        assert_eq!(huge, i64::from(DEFAULT_CACHE_SIZE) * 4);
    }
}
