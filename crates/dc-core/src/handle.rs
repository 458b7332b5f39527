//! Caller-facing handles.
//!
//! [`DiskCache`] is cheap to clone and every clone talks to the same cache
//! thread. An [`Entry`] keeps its entry open until it is dropped; it does
//! not keep the cache alive, so an entry outliving every `DiskCache` only
//! fails its operations with [`DcError::Shutdown`].

use crate::backend::{Backend, BackendState, EntryId, EnumSlot};
use crate::config::BackendConfig;
use crate::inflight::{Dispatcher, Pending};
use dc_block::Storage;
use dc_error::{DcError, Result};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::AtomicUsize;
use std::sync::{Arc, Weak};
use std::time::SystemTime;
use tracing::{debug, warn};

struct Inner {
    dispatcher: Dispatcher,
}

impl Inner {
    fn submit<T, F>(self: &Arc<Self>, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Backend, &Weak<Inner>) -> Result<T> + Send + 'static,
    {
        let weak = Arc::downgrade(self);
        self.dispatcher.submit(move |backend| op(backend, &weak))
    }
}

/// Handle to a blockfile cache.
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<Inner>,
}

impl fmt::Debug for DiskCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskCache")
            .field("dispatcher", &self.inner.dispatcher)
            .finish()
    }
}

impl DiskCache {
    /// Start a cache over the directory in `config.path`. Nothing touches
    /// the disk until [`DiskCache::init`].
    pub fn new(config: BackendConfig) -> Result<Self> {
        Self::start(config, None)
    }

    /// Start a cache over `storage` instead of a directory.
    pub fn with_storage(config: BackendConfig, storage: Arc<dyn Storage>) -> Result<Self> {
        Self::start(config, Some(storage))
    }

    fn start(config: BackendConfig, storage: Option<Arc<dyn Storage>>) -> Result<Self> {
        let pending = Arc::new(AtomicUsize::new(0));
        let interval = config.stats_interval();
        let backend = Backend::new(config, storage, Arc::clone(&pending));
        let dispatcher = Dispatcher::spawn(backend, pending, interval)?;
        Ok(Self {
            inner: Arc::new(Inner { dispatcher }),
        })
    }

    pub fn init(&self) -> Pending<()> {
        self.inner.dispatcher.submit(Backend::init)
    }

    /// Size limit in bytes, before init. 0 picks one from the free space.
    pub fn set_max_size(&self, max_size: i64) -> Pending<()> {
        self.inner.dispatcher.submit(move |backend| backend.set_max_size(max_size))
    }

    pub fn state(&self) -> Pending<BackendState> {
        self.inner.dispatcher.submit(|backend| Ok(backend.state()))
    }

    pub fn open_entry(&self, key: &str) -> Pending<Entry> {
        let key = key.to_owned();
        self.inner.submit(move |backend, weak| {
            let id = backend.open_entry(&key)?;
            Ok(Entry::new(weak.clone(), id, key))
        })
    }

    /// Create an entry. Fails with [`DcError::Exists`] when the key is
    /// already in use.
    pub fn create_entry(&self, key: &str) -> Pending<Entry> {
        let key = key.to_owned();
        self.inner.submit(move |backend, weak| {
            let id = backend.create_entry(&key)?;
            Ok(Entry::new(weak.clone(), id, key))
        })
    }

    /// Remove an entry. Open handles keep working until they close.
    pub fn doom_entry(&self, key: &str) -> Pending<()> {
        let key = key.to_owned();
        self.inner.dispatcher.submit(move |backend| backend.doom_entry(&key))
    }

    pub fn doom_all_entries(&self) -> Pending<()> {
        self.inner.dispatcher.submit(Backend::doom_all_entries)
    }

    /// Doom the entries last used in `[start, end)`.
    pub fn doom_entries_between(&self, start: SystemTime, end: SystemTime) -> Pending<()> {
        self.inner
            .dispatcher
            .submit(move |backend| backend.doom_entries_between(start, end))
    }

    pub fn doom_entries_since(&self, start: SystemTime) -> Pending<()> {
        self.inner.dispatcher.submit(move |backend| backend.doom_entries_since(start))
    }

    /// Start an enumeration of the live entries.
    pub fn enumerate(&self) -> Enumeration {
        Enumeration {
            cache: Arc::downgrade(&self.inner),
            slot: Arc::new(Mutex::new(None)),
        }
    }

    /// Next entry, most recently used first.
    pub fn open_next_entry(&self, it: &mut Enumeration) -> Pending<Option<Entry>> {
        self.step(it, true)
    }

    /// Next entry, least recently used first.
    pub fn open_prev_entry(&self, it: &mut Enumeration) -> Pending<Option<Entry>> {
        self.step(it, false)
    }

    fn step(&self, it: &mut Enumeration, forward: bool) -> Pending<Option<Entry>> {
        let slot = Arc::clone(&it.slot);
        self.inner.submit(move |backend, weak| {
            let next = backend.open_next_entry(&mut slot.lock(), forward)?;
            Ok(next.map(|(id, key)| Entry::new(weak.clone(), id, key)))
        })
    }

    /// Release an enumeration's cursors now rather than when it drops.
    pub fn end_enumeration(&self, it: Enumeration) {
        drop(it);
    }

    /// Record a use of `key` served from somewhere else.
    pub fn on_external_cache_hit(&self, key: &str) {
        let key = key.to_owned();
        self.inner.dispatcher.post(move |backend| {
            match backend.on_external_cache_hit(&key) {
                Ok(()) | Err(DcError::NotFound(_)) => {}
                Err(err) => debug!(target: "dc::backend", error = %err, "external_hit_failed"),
            }
        });
    }

    pub fn get_stats(&self) -> Pending<Vec<(String, String)>> {
        self.inner.dispatcher.submit(Backend::get_stats)
    }

    pub fn entry_count(&self) -> Pending<i32> {
        self.inner.dispatcher.submit(Backend::entry_count)
    }

    pub fn max_file_size(&self) -> Pending<i32> {
        self.inner.dispatcher.submit(Backend::max_file_size)
    }

    /// Check every list and chain. Resolves to the number of dirty entries.
    pub fn self_check(&self) -> Pending<u32> {
        self.inner.dispatcher.submit(Backend::self_check)
    }

    pub fn trim_for_test(&self, empty: bool) -> Pending<()> {
        self.inner.dispatcher.submit(move |backend| backend.trim_for_test(empty))
    }

    pub fn trim_deleted_list_for_test(&self, empty: bool) -> Pending<()> {
        self.inner
            .dispatcher
            .submit(move |backend| backend.trim_deleted_list_for_test(empty))
    }

    /// Resolves once every job queued before it has run.
    pub fn flush_queue_for_test(&self) -> Pending<()> {
        self.inner.dispatcher.submit(|_| Ok(()))
    }

    pub fn run_stats_timer_for_test(&self) -> Pending<()> {
        self.inner.dispatcher.submit(|backend| {
            backend.on_stats_timer();
            Ok(())
        })
    }
}

/// An open cache entry with four data streams.
pub struct Entry {
    cache: Weak<Inner>,
    id: EntryId,
    key: String,
}

impl fmt::Debug for Entry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entry")
            .field("key", &self.key)
            .field("addr", &self.id.addr)
            .finish_non_exhaustive()
    }
}

impl Entry {
    fn new(cache: Weak<Inner>, id: EntryId, key: String) -> Self {
        Self { cache, id, key }
    }

    #[must_use]
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Raw cache address of the entry record.
    #[must_use]
    pub fn address(&self) -> u32 {
        self.id.addr.value()
    }

    fn submit<T, F>(&self, op: F) -> Pending<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Backend, EntryId) -> Result<T> + Send + 'static,
    {
        let Some(cache) = self.cache.upgrade() else {
            return Pending::failed(DcError::Shutdown);
        };
        let id = self.id;
        cache.dispatcher.submit(move |backend| op(backend, id))
    }

    /// Read up to `len` bytes of stream `index` from `offset`. Short at the
    /// end of the stream.
    pub fn read_data(&self, index: usize, offset: usize, len: usize) -> Pending<Vec<u8>> {
        self.submit(move |backend, id| backend.read_data(id, index, offset, len))
    }

    /// Write `data` to stream `index` at `offset`; with `truncate` the
    /// stream ends after it.
    pub fn write_data(&self, index: usize, offset: usize, data: &[u8], truncate: bool) -> Pending<usize> {
        let data = data.to_vec();
        self.submit(move |backend, id| backend.write_data(id, index, offset, &data, truncate))
    }

    pub fn data_size(&self, index: usize) -> Pending<i32> {
        self.submit(move |backend, id| backend.data_size(id, index))
    }

    pub fn last_used(&self) -> Pending<SystemTime> {
        self.submit(|backend, id| backend.entry_times(id).map(|(used, _)| used))
    }

    pub fn last_modified(&self) -> Pending<SystemTime> {
        self.submit(|backend, id| backend.entry_times(id).map(|(_, modified)| modified))
    }

    /// Remove the entry; this handle keeps working until it is dropped.
    pub fn doom(&self) -> Pending<()> {
        self.submit(Backend::doom_open_entry)
    }

    /// Close the entry. Same as dropping it.
    pub fn close(self) {
        drop(self);
    }
}

impl Drop for Entry {
    fn drop(&mut self) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let id = self.id;
        cache.dispatcher.post(move |backend| {
            if let Err(err) = backend.close_entry(id) {
                warn!(target: "dc::backend", entry = %id.addr, error = %err, "entry_close_failed");
            }
        });
    }
}

/// Position of an enumeration. Dropping it releases its cursors.
pub struct Enumeration {
    cache: Weak<Inner>,
    slot: Arc<Mutex<EnumSlot>>,
}

impl fmt::Debug for Enumeration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enumeration").finish_non_exhaustive()
    }
}

impl Drop for Enumeration {
    fn drop(&mut self) {
        let Some(cache) = self.cache.upgrade() else {
            return;
        };
        let slot = Arc::clone(&self.slot);
        cache.dispatcher.post(move |backend| backend.end_enumeration(slot.lock().take()));
    }
}
