//! Eviction policies.
//!
//! A policy decides which list an entry belongs on and which entries to
//! drop when the cache grows past its limit. It owns no cache state: every
//! call receives the backend as an [`EvictionHost`], and the little state a
//! policy needs between calls lives in the host's [`EvictionState`].
//!
//! Trimming runs in passes of at most [`MAX_EVICTIONS_PER_PASS`] entries or
//! [`MAX_PASS_TIME`]; the remainder is re-posted to the cache thread so
//! callers are not starved.

use crate::Lists;
use dc_error::{DcError, Result};
use dc_ondisk::{IndexHeader, RankingsNode};
use dc_types::{CacheAddr, CacheTime, EntryState, List};
use std::fmt;
use std::time::{Duration, Instant};
use tracing::{debug, info, trace};

/// Reuse count at which an entry moves to the high-use list.
pub const HIGH_USE_THRESHOLD: i32 = 10;
/// Hours an entry on the no-use list should survive; doubled per list.
pub const TARGET_TIME_HOURS: u64 = 24 * 7;
pub const MAX_DELAYED_TRIMS: u32 = 60;
pub const MAX_EVICTIONS_PER_PASS: u32 = 20;
pub const MAX_PASS_TIME: Duration = Duration::from_millis(20);
pub const DELAYED_TRIM_INTERVAL: Duration = Duration::from_secs(1);
const CLEAN_UP_MARGIN: i64 = 1024 * 1024;

/// Size a trim pass brings the cache down to.
#[must_use]
pub fn low_water_mark(max_size: i64) -> i64 {
    max_size - CLEAN_UP_MARGIN.min(max_size / 10)
}

fn clean_up_margin(max_size: i64) -> i64 {
    CLEAN_UP_MARGIN.min(max_size / 10)
}

/// Far enough over the limit that trimming cannot wait for a quiet moment.
fn falling_behind(num_bytes: i64, max_size: i64) -> bool {
    num_bytes > low_water_mark(max_size) - clean_up_margin(max_size) * 20
}

/// Work a policy hands back to the cache thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PostedTask {
    /// Continue trimming the live lists.
    Trim,
    /// Continue trimming the deleted list.
    TrimDeleted,
    /// Re-check whether a deferred trim can run now.
    DelayedTrim,
}

/// Policy bookkeeping kept by the host between calls.
#[derive(Debug, Clone, Default)]
pub struct EvictionState {
    pub trimming: bool,
    pub delay_trim: bool,
    pub trim_delays: u32,
    pub first_trim_done: bool,
    /// Trim one entry per pass regardless of size.
    pub test_mode: bool,
}

/// The fields of an entry header a policy reads and updates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EntryInfo {
    pub addr: CacheAddr,
    pub rankings: CacheAddr,
    pub state: EntryState,
    pub reuse_count: i32,
    pub refetch_count: i32,
    /// The rankings node was found broken and no longer points at this
    /// entry; list operations skip it.
    pub leave_rankings_behind: bool,
}

/// What a policy needs from the backend.
pub trait EvictionHost {
    fn lists(&mut self) -> Lists<'_>;

    fn header(&mut self) -> &mut IndexHeader;

    fn eviction_state(&mut self) -> &mut EvictionState;

    /// Configured size limit in bytes.
    fn max_size(&self) -> i64;

    fn is_disabled(&self) -> bool;

    fn is_loaded(&self) -> bool;

    /// Open (or share) the entry that owns the rankings node `node`, taking
    /// a reference. `None` when the entry cannot be loaded.
    fn enumerated_entry(&mut self, node: CacheAddr, list: List) -> Result<Option<EntryInfo>>;

    /// Drop a reference taken by [`EvictionHost::enumerated_entry`].
    fn release_entry(&mut self, entry: CacheAddr) -> Result<()>;

    fn doom_entry(&mut self, entry: CacheAddr) -> Result<()>;

    /// Free the entry's data streams, keeping its header and key.
    fn delete_entry_data(&mut self, entry: CacheAddr) -> Result<()>;

    /// Persist state and counters from `info` into the entry header.
    fn store_entry_info(&mut self, info: &EntryInfo) -> Result<()>;

    fn on_trim_entry(&mut self);

    fn post(&mut self, task: PostedTask, delay: Duration);
}

/// Strategy for list placement and trimming.
pub trait EvictionPolicy: Send + Sync + fmt::Debug {
    fn name(&self) -> &'static str;

    /// Whether entries are counted per list and victims keep their header.
    fn is_tiered(&self) -> bool;

    fn list_for_entry(&self, entry: &EntryInfo) -> List;

    /// One trimming pass. Runs with the `trimming` flag held.
    fn trim_pass(&self, host: &mut dyn EvictionHost, empty: bool) -> Result<()>;

    fn trim_deleted(&self, _host: &mut dyn EvictionHost, _empty: bool) -> Result<()> {
        Ok(())
    }

    fn on_open(&self, _host: &mut dyn EvictionHost, _entry: &mut EntryInfo) -> Result<()> {
        Ok(())
    }

    fn on_create(&self, host: &mut dyn EvictionHost, entry: &mut EntryInfo) -> Result<()>;

    fn on_doom(&self, host: &mut dyn EvictionHost, entry: &mut EntryInfo) -> Result<()>;

    fn on_destroy(&self, _host: &mut dyn EvictionHost, _entry: &EntryInfo) -> Result<()> {
        Ok(())
    }

    fn update_rank(&self, host: &mut dyn EvictionHost, entry: &EntryInfo, modified: bool) -> Result<()> {
        if entry.leave_rankings_behind {
            return Ok(());
        }
        let list = self.list_for_entry(entry);
        host.lists().update_rank(entry.rankings, modified, list)
    }

    /// Trim the cache down to its low-water mark, or empty it completely.
    /// Without `empty`, trimming is deferred while the cache is busy.
    fn trim_cache(&self, host: &mut dyn EvictionHost, empty: bool) -> Result<()> {
        if host.is_disabled() || host.eviction_state().trimming {
            return Ok(());
        }
        if !empty && !should_trim(host) {
            post_delayed_trim(host);
            return Ok(());
        }
        debug!(target: "dc::eviction", policy = self.name(), empty, "trim_start");
        host.eviction_state().trimming = true;
        let result = self.trim_pass(host, empty);
        host.eviction_state().trimming = false;
        debug!(target: "dc::eviction", policy = self.name(), "trim_end");
        result
    }

    /// Timer callback of a deferred trim.
    fn delayed_trim(&self, host: &mut dyn EvictionHost) -> Result<()> {
        host.eviction_state().delay_trim = false;
        if host.eviction_state().trim_delays < MAX_DELAYED_TRIMS && host.is_loaded() {
            post_delayed_trim(host);
            return Ok(());
        }
        self.trim_cache(host, false)
    }

    /// Evict the entry behind `node`. Returns whether an entry was found.
    fn evict_entry(&self, host: &mut dyn EvictionHost, node: CacheAddr, empty: bool, list: List) -> Result<bool> {
        let Some(mut entry) = host.enumerated_entry(node, list)? else {
            debug!(target: "dc::eviction", %node, "evict_entry_not_loaded");
            return Ok(false);
        };
        report_first_trim(host);
        trace!(target: "dc::eviction", entry = %entry.addr, %list, empty, "evict_entry");
        let result = if empty || !self.is_tiered() {
            host.doom_entry(entry.addr)
        } else {
            keep_as_evicted(self, host, &mut entry)
        };
        if result.is_ok() && !empty {
            host.on_trim_entry();
        }
        let released = host.release_entry(entry.addr);
        result.and(released).map(|()| true)
    }
}

/// Free the data of a tiered victim and park its header on the deleted list.
fn keep_as_evicted<P: EvictionPolicy + ?Sized>(
    policy: &P,
    host: &mut dyn EvictionHost,
    entry: &mut EntryInfo,
) -> Result<()> {
    host.delete_entry_data(entry.addr)?;
    if !entry.leave_rankings_behind {
        let from = policy.list_for_entry(entry);
        host.lists().remove(entry.rankings, from)?;
    }
    entry.state = EntryState::Evicted;
    host.store_entry_info(entry)?;
    if entry.leave_rankings_behind {
        return Ok(());
    }
    host.lists().insert(entry.rankings, true, List::Deleted)
}

fn should_trim(host: &mut dyn EvictionHost) -> bool {
    let num_bytes = i64::from(host.header().num_bytes);
    let max_size = host.max_size();
    let loaded = host.is_loaded();
    let state = host.eviction_state();
    if !falling_behind(num_bytes, max_size) && state.trim_delays < MAX_DELAYED_TRIMS && loaded {
        return false;
    }
    state.trim_delays = 0;
    true
}

fn post_delayed_trim(host: &mut dyn EvictionHost) {
    let state = host.eviction_state();
    if state.delay_trim {
        return;
    }
    state.delay_trim = true;
    state.trim_delays += 1;
    host.post(PostedTask::DelayedTrim, DELAYED_TRIM_INTERVAL);
}

fn report_first_trim(host: &mut dyn EvictionHost) {
    let state = host.eviction_state();
    if state.first_trim_done {
        return;
    }
    state.first_trim_done = true;
    let header = host.header();
    if header.lru.filled != 0 {
        return;
    }
    header.lru.filled = 1;
    if header.create_time.is_null() {
        header.create_time = CacheTime::now();
    }
    info!(target: "dc::eviction", "cache_filled_first_eviction");
}

fn budget_spent(evicted: u32, start: Instant) -> bool {
    evicted > MAX_EVICTIONS_PER_PASS || start.elapsed() > MAX_PASS_TIME
}

/// Scan `list` from the tail evicting entries not open in this run until
/// the cache fits under `target` bytes. Returns whether the pass stopped
/// early and re-posted itself.
fn trim_list<P: EvictionPolicy + ?Sized>(
    policy: &P,
    host: &mut dyn EvictionHost,
    list: List,
    first: Option<CacheAddr>,
    empty: bool,
    evicted: &mut u32,
    start: Instant,
) -> Result<bool> {
    let target = if empty { 0 } else { low_water_mark(host.max_size()) };
    let test_mode = host.eviction_state().test_mode;
    let current_id = host.header().this_id;
    let mut next = first;
    while let Some(addr) = next {
        if i64::from(host.header().num_bytes) <= target && !test_mode {
            break;
        }
        // The scan position may have been unlinked by the previous eviction.
        let Some(node) = host.lists().linked_node(addr)? else {
            break;
        };
        next = host.lists().get_prev(Some(addr), list)?.map(|(prev, _)| prev);

        if node.dirty != current_id || empty {
            if policy.evict_entry(host, addr, empty, list)? && !(test_mode && !policy.is_tiered()) {
                *evicted += 1;
            }
            if !empty && test_mode {
                break;
            }
        }
        if !empty && budget_spent(*evicted, start) {
            host.post(PostedTask::Trim, Duration::ZERO);
            return Ok(true);
        }
    }
    Ok(false)
}

/// Single list ordered by recency; victims are doomed outright.
#[derive(Debug, Clone, Copy, Default)]
pub struct ClassicEviction;

impl EvictionPolicy for ClassicEviction {
    fn name(&self) -> &'static str {
        "classic"
    }

    fn is_tiered(&self) -> bool {
        false
    }

    fn list_for_entry(&self, _entry: &EntryInfo) -> List {
        List::NoUse
    }

    fn trim_pass(&self, host: &mut dyn EvictionHost, empty: bool) -> Result<()> {
        let start = Instant::now();
        let mut evicted = 0;
        let first = host.lists().get_prev(None, List::NoUse)?.map(|(addr, _)| addr);
        trim_list(self, host, List::NoUse, first, empty, &mut evicted, start)?;
        debug!(target: "dc::eviction", evicted, "classic_trim_pass");
        Ok(())
    }

    fn on_create(&self, host: &mut dyn EvictionHost, entry: &mut EntryInfo) -> Result<()> {
        host.lists().insert(entry.rankings, true, List::NoUse)
    }

    fn on_doom(&self, host: &mut dyn EvictionHost, entry: &mut EntryInfo) -> Result<()> {
        if entry.leave_rankings_behind {
            return Ok(());
        }
        host.lists().remove(entry.rankings, List::NoUse)
    }
}

/// Reuse-aware lists. Entries start on the no-use list, move up as they are
/// reopened, and evicted entries keep their header on the deleted list so a
/// refetch can be recognised.
#[derive(Debug, Clone, Copy, Default)]
pub struct TieredEviction;

impl TieredEviction {
    fn node_is_old_enough(node: Option<&RankingsNode>, list_index: usize) -> bool {
        let Some(node) = node else {
            return false;
        };
        let multiplier = 1_u64 << list_index;
        node.last_used.hours_until(CacheTime::now()) > TARGET_TIME_HOURS * multiplier
    }

    fn select_list_by_length(host: &mut dyn EvictionHost, tails: &[Option<(CacheAddr, RankingsNode)>; 3]) -> usize {
        let header = host.header();
        let sizes = header.lru.sizes;
        let data_entries = header.num_entries - sizes[List::Deleted.index()];
        if sizes[0] > data_entries / 3 {
            return 0;
        }
        let mut list = if sizes[1] > data_entries / 3 { 1 } else { 2 };
        // Frequently used entries still get at least the base target time.
        if !Self::node_is_old_enough(tails[list].as_ref().map(|(_, node)| node), 0)
            && sizes[0] > data_entries / 10
        {
            list = 0;
        }
        list
    }

    fn should_trim_deleted(host: &mut dyn EvictionHost) -> bool {
        let test_mode = host.eviction_state().test_mode;
        let header = host.header();
        let table_len = i64::from(header.table_len.max(1));
        let num_entries = i64::from(header.num_entries);
        let index_load = num_entries * 100 / table_len;
        // A lightly loaded index lets the deleted list grow to twice the
        // size of each live list.
        let max_length = if index_load < 25 {
            num_entries * 2 / 5
        } else {
            num_entries / 4
        };
        !test_mode && i64::from(header.lru.size(List::Deleted)) > max_length
    }

    /// Destroy the entry behind a deleted-list node. Returns whether it was
    /// not already doomed.
    fn remove_deleted_node(host: &mut dyn EvictionHost, node: CacheAddr) -> Result<bool> {
        let Some(mut entry) = host.enumerated_entry(node, List::Deleted)? else {
            debug!(target: "dc::eviction", %node, "deleted_node_not_loaded");
            return Ok(false);
        };
        let was_doomed = entry.state == EntryState::Doomed;
        entry.state = EntryState::Doomed;
        let result = host
            .store_entry_info(&entry)
            .and_then(|()| host.doom_entry(entry.addr));
        let released = host.release_entry(entry.addr);
        result.and(released).map(|()| !was_doomed)
    }
}

impl EvictionPolicy for TieredEviction {
    fn name(&self) -> &'static str {
        "tiered"
    }

    fn is_tiered(&self) -> bool {
        true
    }

    fn list_for_entry(&self, entry: &EntryInfo) -> List {
        if entry.reuse_count == 0 {
            List::NoUse
        } else if entry.reuse_count < HIGH_USE_THRESHOLD {
            List::LowUse
        } else {
            List::HighUse
        }
    }

    fn trim_pass(&self, host: &mut dyn EvictionHost, empty: bool) -> Result<()> {
        let start = Instant::now();
        let mut tails: [Option<(CacheAddr, RankingsNode)>; 3] = [None; 3];
        let mut chosen = None;
        for (i, list) in List::LIVE.into_iter().enumerate() {
            tails[i] = host.lists().get_prev(None, list)?;
            if chosen.is_none() && !empty && Self::node_is_old_enough(tails[i].as_ref().map(|(_, n)| n), i) {
                chosen = Some(i);
            }
        }
        let first_list = if empty {
            0
        } else {
            chosen.unwrap_or_else(|| Self::select_list_by_length(host, &tails))
        };

        let mut evicted = 0;
        for i in first_list..List::LIVE.len() {
            let list = List::LIVE[i];
            let first = tails[i].map(|(addr, _)| addr);
            if trim_list(self, host, list, first, empty, &mut evicted, start)? {
                break;
            }
            if !empty {
                break;
            }
        }
        debug!(target: "dc::eviction", evicted, first_list, "tiered_trim_pass");

        if empty {
            self.trim_deleted(host, true)?;
        } else if Self::should_trim_deleted(host) {
            host.post(PostedTask::TrimDeleted, Duration::ZERO);
        }
        Ok(())
    }

    fn trim_deleted(&self, host: &mut dyn EvictionHost, empty: bool) -> Result<()> {
        if host.is_disabled() {
            return Ok(());
        }
        let start = Instant::now();
        let test_mode = host.eviction_state().test_mode;
        let mut removed = 0_u32;
        let mut next = host.lists().get_prev(None, List::Deleted)?.map(|(addr, _)| addr);
        while let Some(addr) = next {
            if !empty && (removed >= MAX_EVICTIONS_PER_PASS || start.elapsed() >= MAX_PASS_TIME) {
                break;
            }
            if host.lists().linked_node(addr)?.is_none() {
                break;
            }
            next = host.lists().get_prev(Some(addr), List::Deleted)?.map(|(prev, _)| prev);
            if Self::remove_deleted_node(host, addr)? {
                removed += 1;
            }
            if test_mode {
                break;
            }
        }
        debug!(target: "dc::eviction", removed, empty, "deleted_list_trimmed");
        if removed > 0 && !empty && Self::should_trim_deleted(host) {
            host.post(PostedTask::TrimDeleted, Duration::ZERO);
        }
        Ok(())
    }

    fn on_open(&self, host: &mut dyn EvictionHost, entry: &mut EntryInfo) -> Result<()> {
        if entry.state != EntryState::Normal || entry.reuse_count == i32::MAX {
            return Ok(());
        }
        entry.reuse_count += 1;
        let moved = match entry.reuse_count {
            1 => Some((List::NoUse, List::LowUse)),
            HIGH_USE_THRESHOLD => Some((List::LowUse, List::HighUse)),
            _ => None,
        };
        host.store_entry_info(entry)?;
        if let Some((from, to)) = moved {
            if !entry.leave_rankings_behind {
                trace!(target: "dc::eviction", entry = %entry.addr, %from, %to, "entry_promoted");
                host.lists().remove(entry.rankings, from)?;
                host.lists().insert(entry.rankings, false, to)?;
            }
        }
        Ok(())
    }

    fn on_create(&self, host: &mut dyn EvictionHost, entry: &mut EntryInfo) -> Result<()> {
        match entry.state {
            EntryState::Normal => {}
            EntryState::Evicted => {
                entry.refetch_count = entry.refetch_count.saturating_add(1);
                if entry.refetch_count > HIGH_USE_THRESHOLD && entry.reuse_count < HIGH_USE_THRESHOLD {
                    entry.reuse_count = HIGH_USE_THRESHOLD;
                } else {
                    entry.reuse_count = entry.reuse_count.saturating_add(1);
                }
                entry.state = EntryState::Normal;
                host.store_entry_info(entry)?;
                host.lists().remove(entry.rankings, List::Deleted)?;
                debug!(
                    target: "dc::eviction",
                    entry = %entry.addr,
                    reuse = entry.reuse_count,
                    refetch = entry.refetch_count,
                    "entry_resurrected"
                );
            }
            EntryState::Doomed => {
                return Err(DcError::InvalidArgument(format!(
                    "entry {} is doomed and cannot be recreated",
                    entry.addr
                )));
            }
        }
        let list = self.list_for_entry(entry);
        host.lists().insert(entry.rankings, true, list)
    }

    fn on_doom(&self, host: &mut dyn EvictionHost, entry: &mut EntryInfo) -> Result<()> {
        if entry.state != EntryState::Normal {
            return Ok(());
        }
        if entry.leave_rankings_behind {
            entry.state = EntryState::Doomed;
            return host.store_entry_info(entry);
        }
        let from = self.list_for_entry(entry);
        host.lists().remove(entry.rankings, from)?;
        entry.state = EntryState::Doomed;
        host.store_entry_info(entry)?;
        host.lists().insert(entry.rankings, true, List::Deleted)
    }

    fn on_destroy(&self, host: &mut dyn EvictionHost, entry: &EntryInfo) -> Result<()> {
        if entry.leave_rankings_behind {
            return Ok(());
        }
        host.lists().remove(entry.rankings, List::Deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(reuse_count: i32) -> EntryInfo {
        EntryInfo {
            addr: CacheAddr(0xA001_0000),
            rankings: CacheAddr(0x9000_0000),
            state: EntryState::Normal,
            reuse_count,
            refetch_count: 0,
            leave_rankings_behind: false,
        }
    }

    #[test]
    fn low_water_leaves_a_margin() {
        assert_eq!(low_water_mark(80 * 1024 * 1024), 79 * 1024 * 1024);
        assert_eq!(low_water_mark(1000), 900);
        assert_eq!(low_water_mark(0), 0);
        assert!(falling_behind(1, 1000));
        assert!(!falling_behind(1024 * 1024, 80 * 1024 * 1024));
        assert!(falling_behind(79 * 1024 * 1024, 80 * 1024 * 1024));
    }

    #[test]
    fn list_placement_follows_reuse() {
        assert_eq!(ClassicEviction.list_for_entry(&info(50)), List::NoUse);
        assert_eq!(TieredEviction.list_for_entry(&info(0)), List::NoUse);
        assert_eq!(TieredEviction.list_for_entry(&info(1)), List::LowUse);
        assert_eq!(TieredEviction.list_for_entry(&info(HIGH_USE_THRESHOLD - 1)), List::LowUse);
        assert_eq!(TieredEviction.list_for_entry(&info(HIGH_USE_THRESHOLD)), List::HighUse);
    }

    #[test]
    fn age_target_doubles_per_list() {
        let hour = Duration::from_secs(3600);
        let now = CacheTime::now();
        let aged = |hours: u64| RankingsNode {
            last_used: CacheTime(now.0.saturating_sub(hours * hour.as_micros() as u64)),
            ..RankingsNode::default()
        };
        let week = TARGET_TIME_HOURS;
        assert!(!TieredEviction::node_is_old_enough(None, 0));
        assert!(!TieredEviction::node_is_old_enough(Some(&aged(week - 1)), 0));
        assert!(TieredEviction::node_is_old_enough(Some(&aged(week + 2)), 0));
        assert!(!TieredEviction::node_is_old_enough(Some(&aged(week + 2)), 1));
        assert!(TieredEviction::node_is_old_enough(Some(&aged(4 * week + 2)), 2));
    }
}
