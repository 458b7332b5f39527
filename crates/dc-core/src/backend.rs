//! Backend lifecycle: init, error classification, critical errors and
//! restarts.
//!
//! Everything here runs on the cache thread. The [`Engine`] does the work;
//! the backend decides what an error means for the cache as a whole and
//! replaces the engine when the files have to be recreated.

use crate::config::BackendConfig;
use crate::engine::Engine;
use dc_block::{is_cache_file_name, DirStorage, Storage};
use dc_error::{CheckError, DcError, Result};
use dc_rankings::IterId;
use dc_types::CacheAddr;
use serde::Serialize;
use std::sync::atomic::AtomicUsize;
use std::sync::Arc;
use std::time::{Instant, SystemTime};
use tracing::{error, info, warn};

/// Where the backend is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendState {
    Uninitialized,
    Initializing,
    Ready,
    /// A critical error stopped the backend; it restarts once no entry is
    /// referenced.
    Disabled,
    Restarting,
}

/// An open entry, tied to the generation of files it was opened from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct EntryId {
    pub epoch: u64,
    pub addr: CacheAddr,
}

/// Enumeration position: the files generation and the rankings iterator.
pub(crate) type EnumSlot = Option<(u64, IterId)>;

pub(crate) struct Backend {
    config: BackendConfig,
    storage: Option<Arc<dyn Storage>>,
    state: BackendState,
    engine: Option<Engine>,
    epoch: u64,
    io_errors: u32,
    pending_io: Arc<AtomicUsize>,
}

/// Self-check code reported for an error that disables the backend.
fn critical_code(err: &DcError) -> Option<CheckError> {
    match err {
        DcError::Check(code) => Some(*code),
        DcError::Corruption { .. } => Some(CheckError::ReadFailure),
        DcError::Format(_) => Some(CheckError::InitFailed),
        _ => None,
    }
}

fn delete_cache_files(storage: &dyn Storage) -> Result<()> {
    for name in storage.list()? {
        if is_cache_file_name(&name) {
            storage.remove(&name)?;
        }
    }
    Ok(())
}

impl Backend {
    pub fn new(config: BackendConfig, storage: Option<Arc<dyn Storage>>, pending_io: Arc<AtomicUsize>) -> Self {
        Self {
            config,
            storage,
            state: BackendState::Uninitialized,
            engine: None,
            epoch: 0,
            io_errors: 0,
            pending_io,
        }
    }

    pub fn state(&self) -> BackendState {
        self.state
    }

    /// Size limit for the cache; only before init. 0 sizes it from the
    /// free space on the volume.
    pub fn set_max_size(&mut self, max_size: i64) -> Result<()> {
        if max_size < 0 {
            return Err(DcError::InvalidArgument(format!("negative cache size {max_size}")));
        }
        if self.state != BackendState::Uninitialized {
            return Err(DcError::InvalidArgument("cache size must be set before init".to_owned()));
        }
        self.config.max_size = max_size;
        Ok(())
    }

    fn storage(&mut self) -> Result<Arc<dyn Storage>> {
        if let Some(storage) = &self.storage {
            return Ok(Arc::clone(storage));
        }
        let storage: Arc<dyn Storage> = Arc::new(DirStorage::open(&self.config.path)?);
        self.storage = Some(Arc::clone(&storage));
        Ok(storage)
    }

    /// Open the cache files, recreating them once when they cannot be
    /// used.
    pub fn init(&mut self) -> Result<()> {
        match self.state {
            BackendState::Uninitialized => {}
            BackendState::Ready => return Ok(()),
            state => {
                return Err(DcError::InvalidArgument(format!("init called in state {state:?}")));
            }
        }
        self.state = BackendState::Initializing;
        let storage = match self.storage() {
            Ok(storage) => storage,
            Err(err) => {
                self.state = BackendState::Uninitialized;
                return Err(err);
            }
        };
        match Engine::open(&self.config, Arc::clone(&storage), Arc::clone(&self.pending_io)) {
            Ok(engine) => {
                self.engine = Some(engine);
                self.state = BackendState::Ready;
                Ok(())
            }
            Err(err) if err.is_storage_failure() || self.config.flags.upgrade_mode => {
                error!(target: "dc::backend", error = %err, "cache_init_failed");
                self.state = BackendState::Uninitialized;
                Err(err)
            }
            Err(err) => {
                warn!(target: "dc::backend", error = %err, "cache_unusable_recreating");
                self.restart(true)
            }
        }
    }

    /// Throw away the files and start over with an empty cache. Counters
    /// worth keeping across restarts are carried over.
    fn restart(&mut self, failure: bool) -> Result<()> {
        self.state = BackendState::Restarting;
        let saved = self.engine.take().map(|engine| {
            let counters = engine.preserved_counters();
            engine.discard();
            counters
        });
        let storage = self.storage()?;
        if let Err(err) = delete_cache_files(&*storage) {
            error!(target: "dc::backend", error = %err, "cache_files_not_deleted");
            self.state = BackendState::Disabled;
            return Err(err);
        }
        self.epoch += 1;
        self.io_errors = 0;
        if failure && self.config.flags.unit_test_mode {
            info!(target: "dc::backend", epoch = self.epoch, "restart_suppressed_in_unit_test_mode");
            self.state = BackendState::Disabled;
            return Ok(());
        }
        match Engine::open(&self.config, storage, Arc::clone(&self.pending_io)) {
            Ok(mut engine) => {
                if let Some(counters) = saved {
                    engine.restore_counters(counters);
                }
                self.engine = Some(engine);
                self.state = BackendState::Ready;
                info!(target: "dc::backend", epoch = self.epoch, failure, "cache_restarted");
                Ok(())
            }
            Err(err) => {
                error!(target: "dc::backend", error = %err, "cache_restart_failed");
                self.state = BackendState::Disabled;
                Err(err)
            }
        }
    }

    fn ready_engine(&mut self) -> Result<&mut Engine> {
        match self.state {
            BackendState::Uninitialized | BackendState::Initializing => return Err(DcError::NotInitialized),
            BackendState::Disabled | BackendState::Restarting => return Err(DcError::Disabled),
            BackendState::Ready => {}
        }
        self.engine.as_mut().ok_or(DcError::Disabled)
    }

    fn check_epoch(&self, id: EntryId) -> Result<()> {
        if id.epoch != self.epoch {
            return Err(DcError::InvalidArgument(format!(
                "entry {} belongs to files that were recreated",
                id.addr
            )));
        }
        Ok(())
    }

    /// Run `op` on a ready engine and classify its outcome.
    fn run<T>(&mut self, op: impl FnOnce(&mut Engine) -> Result<T>) -> Result<T> {
        let result = op(self.ready_engine()?);
        match &result {
            Ok(_) => self.io_errors = 0,
            Err(err) => self.classify(err),
        }
        self.restart_if_idle();
        result
    }

    fn classify(&mut self, err: &DcError) {
        if let Some(code) = critical_code(err) {
            self.critical_error(code);
            return;
        }
        if matches!(err, DcError::Io(_) | DcError::NoSpace) {
            self.io_errors += 1;
            warn!(target: "dc::backend", error = %err, count = self.io_errors, "storage_error");
            if self.io_errors >= self.config.max_io_errors {
                self.critical_error(CheckError::StorageError);
            }
        }
    }

    fn critical_error(&mut self, code: CheckError) {
        if let Some(engine) = self.engine.as_mut() {
            if !engine.is_disabled() {
                engine.mark_critical(code);
            }
        }
        self.state = BackendState::Disabled;
    }

    /// A disabled backend recreates its files once nothing is open.
    fn restart_if_idle(&mut self) {
        let idle = self
            .engine
            .as_ref()
            .is_some_and(|engine| engine.is_disabled() && engine.num_refs() == 0);
        if idle {
            if let Err(err) = self.restart(true) {
                error!(target: "dc::backend", error = %err, "deferred_restart_failed");
            }
        }
    }

    fn entry_id(&self, addr: CacheAddr) -> EntryId {
        EntryId {
            epoch: self.epoch,
            addr,
        }
    }

    // ── Cache operations ────────────────────────────────────────────────

    pub fn open_entry(&mut self, key: &str) -> Result<EntryId> {
        let addr = self.run(|engine| engine.open_entry(key))?;
        Ok(self.entry_id(addr))
    }

    pub fn create_entry(&mut self, key: &str) -> Result<EntryId> {
        let addr = self.run(|engine| engine.create_entry(key))?;
        Ok(self.entry_id(addr))
    }

    pub fn doom_entry(&mut self, key: &str) -> Result<()> {
        self.run(|engine| engine.doom_entry(key))
    }

    /// Doom every entry. With nothing open the files are simply recreated.
    pub fn doom_all_entries(&mut self) -> Result<()> {
        let engine = self.ready_engine()?;
        engine.count_doom_cache();
        if engine.num_refs() == 0 {
            info!(target: "dc::backend", "dooming_all_entries_by_restart");
            return self.restart(false);
        }
        self.run(Engine::doom_all_in_place)
    }

    pub fn doom_entries_between(&mut self, start: SystemTime, end: SystemTime) -> Result<()> {
        self.run(|engine| engine.doom_entries_between(start, end))
    }

    /// Doom entries used at or after `start`; from the beginning of time
    /// that is everything.
    pub fn doom_entries_since(&mut self, start: SystemTime) -> Result<()> {
        if start <= SystemTime::UNIX_EPOCH {
            return self.doom_all_entries();
        }
        self.run(|engine| engine.doom_entries_since(start))
    }

    /// Next entry of an enumeration. An enumeration started before the
    /// files were recreated is over.
    pub fn open_next_entry(&mut self, slot: &mut EnumSlot, forward: bool) -> Result<Option<(EntryId, String)>> {
        let epoch = self.epoch;
        let mut iter = match *slot {
            Some((started, _)) if started != epoch => return Ok(None),
            Some((_, id)) => Some(id),
            None => None,
        };
        let next = self.run(|engine| engine.open_next_entry(&mut iter, forward));
        if let Some(id) = iter {
            *slot = Some((epoch, id));
        }
        Ok(next?.map(|(addr, key)| (self.entry_id(addr), key)))
    }

    pub fn end_enumeration(&mut self, slot: EnumSlot) {
        let Some((epoch, id)) = slot else {
            return;
        };
        if epoch != self.epoch {
            return;
        }
        if let Some(engine) = self.engine.as_mut() {
            engine.end_enumeration(id);
        }
    }

    pub fn on_external_cache_hit(&mut self, key: &str) -> Result<()> {
        self.run(|engine| engine.on_external_cache_hit(key))
    }

    pub fn get_stats(&mut self) -> Result<Vec<(String, String)>> {
        Ok(self.ready_engine()?.get_stats())
    }

    pub fn entry_count(&mut self) -> Result<i32> {
        Ok(self.ready_engine()?.entry_count())
    }

    pub fn max_file_size(&mut self) -> Result<i32> {
        Ok(self.ready_engine()?.max_file_size())
    }

    pub fn self_check(&mut self) -> Result<u32> {
        self.ready_engine()?.self_check().map_err(DcError::Check)
    }

    // ── Entry operations ────────────────────────────────────────────────

    fn run_entry<T>(&mut self, id: EntryId, op: impl FnOnce(&mut Engine, CacheAddr) -> Result<T>) -> Result<T> {
        self.check_epoch(id)?;
        self.run(|engine| op(engine, id.addr))
    }

    pub fn read_data(&mut self, id: EntryId, index: usize, offset: usize, len: usize) -> Result<Vec<u8>> {
        self.run_entry(id, |engine, addr| engine.read_data(addr, index, offset, len))
    }

    pub fn write_data(&mut self, id: EntryId, index: usize, offset: usize, data: &[u8], truncate: bool) -> Result<usize> {
        self.run_entry(id, |engine, addr| engine.write_data(addr, index, offset, data, truncate))
    }

    pub fn data_size(&mut self, id: EntryId, index: usize) -> Result<i32> {
        self.run_entry(id, |engine, addr| engine.data_size(addr, index))
    }

    pub fn entry_times(&mut self, id: EntryId) -> Result<(SystemTime, SystemTime)> {
        self.run_entry(id, |engine, addr| engine.entry_times(addr))
    }

    pub fn doom_open_entry(&mut self, id: EntryId) -> Result<()> {
        self.run_entry(id, |engine, addr| engine.doom_open_entry(addr))
    }

    /// Drop a handle's reference. Works on a disabled backend so it can
    /// drain; a handle from recreated files has nothing left to close.
    pub fn close_entry(&mut self, id: EntryId) -> Result<()> {
        if id.epoch != self.epoch {
            return Ok(());
        }
        let Some(engine) = self.engine.as_mut() else {
            return Ok(());
        };
        let result = engine.close_entry(id.addr);
        if let Err(err) = &result {
            self.classify(err);
        }
        self.restart_if_idle();
        result
    }

    // ── Timer, posted work and test hooks ───────────────────────────────

    pub fn next_task_deadline(&self) -> Option<Instant> {
        self.engine.as_ref().and_then(Engine::next_task_deadline)
    }

    pub fn run_due_tasks(&mut self, now: Instant) {
        if self.state != BackendState::Ready {
            return;
        }
        if let Err(err) = self.run(|engine| engine.run_due_tasks(now)) {
            warn!(target: "dc::backend", error = %err, "posted_task_failed");
        }
    }

    pub fn on_stats_timer(&mut self) {
        if let Some(engine) = self.engine.as_mut() {
            engine.on_stats_timer();
        }
    }

    pub fn trim_for_test(&mut self, empty: bool) -> Result<()> {
        self.run(|engine| engine.trim_for_test(empty))
    }

    pub fn trim_deleted_list_for_test(&mut self, empty: bool) -> Result<()> {
        self.run(|engine| engine.trim_deleted_for_test(empty))
    }

    /// Flush everything and release the files. Called once the queue has
    /// drained.
    pub fn shutdown(&mut self) {
        let Some(engine) = self.engine.take() else {
            return;
        };
        if let Err(err) = engine.shutdown() {
            error!(target: "dc::backend", error = %err, "cache_shutdown_failed");
        }
        self.state = BackendState::Uninitialized;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::BackendFlags;
    use dc_block::MemStorage;
    use dc_types::INDEX_FILE_NAME;

    fn backend(storage: &MemStorage, flags: BackendFlags) -> Backend {
        let config = BackendConfig {
            max_size: 2 * 1024 * 1024,
            flags,
            ..BackendConfig::default()
        };
        Backend::new(config, Some(Arc::new(storage.clone())), Arc::default())
    }

    #[test]
    fn operations_before_init_are_refused() {
        let storage = MemStorage::new();
        let mut backend = backend(&storage, BackendFlags::default());
        assert!(matches!(backend.create_entry("k"), Err(DcError::NotInitialized)));
        backend.set_max_size(1 << 20).expect("size before init");
        backend.init().expect("init");
        assert!(backend.set_max_size(1 << 21).is_err());
        assert_eq!(backend.state(), BackendState::Ready);
    }

    #[test]
    fn bad_magic_recreates_the_cache() {
        let storage = MemStorage::new();
        let mut first = backend(&storage, BackendFlags::default());
        first.init().expect("init");
        let id = first.create_entry("old").expect("create");
        first.close_entry(id).expect("close");
        first.shutdown();
        assert!(storage.poke(INDEX_FILE_NAME, 0, &[0xFF; 4]));

        let mut second = backend(&storage, BackendFlags::default());
        second.init().expect("init recovers");
        assert_eq!(second.state(), BackendState::Ready);
        assert_eq!(second.entry_count().expect("count"), 0);
        assert!(matches!(second.open_entry("old"), Err(DcError::NotFound(_))));
        assert_eq!(second.self_check().expect("check"), 0);
    }

    #[test]
    fn upgrade_mode_reports_instead_of_recreating() {
        let storage = MemStorage::new();
        let mut first = backend(&storage, BackendFlags::default());
        first.init().expect("init");
        first.shutdown();
        assert!(storage.poke(INDEX_FILE_NAME, 0, &[0xFF; 4]));
        let flags = BackendFlags {
            upgrade_mode: true,
            ..BackendFlags::default()
        };
        let mut tool = backend(&storage, flags);
        assert!(tool.init().is_err());
        assert_eq!(tool.state(), BackendState::Uninitialized);
    }

    #[test]
    fn repeated_io_errors_disable_the_backend() {
        let storage = MemStorage::new();
        let mut backend = backend(&storage, BackendFlags::default());
        backend.init().expect("init");
        storage.fail_writes(true);
        for i in 0..5 {
            assert!(backend.create_entry(&format!("k{i}")).is_err());
        }
        // The restart that follows cannot write new files either.
        assert_eq!(backend.state(), BackendState::Disabled);
        storage.fail_writes(false);
        assert!(matches!(backend.create_entry("later"), Err(DcError::Disabled)));
    }

    #[test]
    fn critical_error_with_nothing_open_restarts() {
        let storage = MemStorage::new();
        let mut backend = backend(&storage, BackendFlags::default());
        backend.init().expect("init");
        let id = backend.create_entry("lost").expect("create");
        backend.close_entry(id).expect("close");
        backend.critical_error(CheckError::InvalidLinks);
        assert_eq!(backend.state(), BackendState::Disabled);
        backend.restart_if_idle();

        assert_eq!(backend.state(), BackendState::Ready);
        assert!(matches!(backend.open_entry("lost"), Err(DcError::NotFound(_))));
        let stats = backend.get_stats().expect("stats");
        let fatal = stats.iter().find(|(name, _)| name == "Fatal error").expect("counter");
        assert_eq!(fatal.1, "0x1");
    }

    #[test]
    fn unit_test_mode_stays_disabled_after_a_critical_error() {
        let storage = MemStorage::new();
        let flags = BackendFlags {
            unit_test_mode: true,
            ..BackendFlags::default()
        };
        let mut backend = backend(&storage, flags);
        backend.init().expect("init");
        let id = backend.create_entry("held").expect("create");
        backend.critical_error(CheckError::InvalidLinks);
        assert!(matches!(backend.open_entry("held"), Err(DcError::Disabled)));
        backend.close_entry(id).expect("close drains");
        assert_eq!(backend.state(), BackendState::Disabled);
        assert!(matches!(backend.create_entry("again"), Err(DcError::Disabled)));
    }

    #[test]
    fn stale_handles_after_restart() {
        let storage = MemStorage::new();
        let mut backend = backend(&storage, BackendFlags::default());
        backend.init().expect("init");
        let id = backend.create_entry("x").expect("create");
        backend.close_entry(id).expect("close");
        backend.doom_all_entries().expect("doom all");
        assert!(matches!(backend.read_data(id, 0, 0, 1), Err(DcError::InvalidArgument(_))));
        backend.close_entry(id).expect("stale close is a no-op");
        let stats = backend.get_stats().expect("stats");
        let doom = stats.iter().find(|(name, _)| name == "Doom cache").expect("counter");
        assert_eq!(doom.1, "0x1");
    }
}
