//! Usage counters and the entry-size histogram.
//!
//! The record is kept in memory and written back to its two `BLOCK_256`
//! blocks every few timer ticks and at shutdown. A lost update only costs
//! statistics, so write failures are logged and otherwise ignored.

use dc_alloc::BlockFiles;
use dc_error::{DcError, Result};
use dc_ondisk::{corruption, IndexHeader, OnDiskStats, DATA_SIZES_LEN, NUM_COUNTERS};
use dc_types::{CacheAddr, FileType};
use tracing::{debug, warn};

/// Bytes reserved for the record: two 256-byte blocks.
const STORAGE_SIZE: usize = 512;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Counter {
    OpenMiss,
    OpenHit,
    CreateMiss,
    CreateHit,
    ResurrectHit,
    CreateError,
    TrimEntry,
    DoomEntry,
    DoomCache,
    InvalidEntry,
    OpenEntries,
    MaxEntries,
    Timer,
    ReadData,
    WriteData,
    OpenRankings,
    GetRankings,
    FatalError,
    LastReport,
    LastReportTimer,
    DoomRecent,
    Unused,
}

impl Counter {
    pub const ALL: [Self; NUM_COUNTERS] = [
        Self::OpenMiss,
        Self::OpenHit,
        Self::CreateMiss,
        Self::CreateHit,
        Self::ResurrectHit,
        Self::CreateError,
        Self::TrimEntry,
        Self::DoomEntry,
        Self::DoomCache,
        Self::InvalidEntry,
        Self::OpenEntries,
        Self::MaxEntries,
        Self::Timer,
        Self::ReadData,
        Self::WriteData,
        Self::OpenRankings,
        Self::GetRankings,
        Self::FatalError,
        Self::LastReport,
        Self::LastReportTimer,
        Self::DoomRecent,
        Self::Unused,
    ];

    fn slot(self) -> usize {
        self as usize
    }

    /// Label used in `get_stats` output.
    #[must_use]
    pub fn label(self) -> &'static str {
        match self {
            Self::OpenMiss => "Open miss",
            Self::OpenHit => "Open hit",
            Self::CreateMiss => "Create miss",
            Self::CreateHit => "Create hit",
            Self::ResurrectHit => "Resurrect hit",
            Self::CreateError => "Create error",
            Self::TrimEntry => "Trim entry",
            Self::DoomEntry => "Doom entry",
            Self::DoomCache => "Doom cache",
            Self::InvalidEntry => "Invalid entry",
            Self::OpenEntries => "Open entries",
            Self::MaxEntries => "Max entries",
            Self::Timer => "Timer",
            Self::ReadData => "Read data",
            Self::WriteData => "Write data",
            Self::OpenRankings => "Open rankings",
            Self::GetRankings => "Get rankings",
            Self::FatalError => "Fatal error",
            Self::LastReport => "Last report",
            Self::LastReportTimer => "Last report timer",
            Self::DoomRecent => "Doom recent entries",
            Self::Unused => "unused",
        }
    }
}

/// Histogram bucket for a stream of `size` bytes: linear steps of 2 KiB up
/// to 20 KiB, 4 KiB steps up to 40 KiB, then one bucket per power of two.
#[must_use]
pub fn size_bucket(size: i32) -> usize {
    if size < 1024 {
        return 0;
    }
    if size < 20 * 1024 {
        return (size / 2048 + 1) as usize;
    }
    if size < 40 * 1024 {
        return ((size - 20 * 1024) / 4096 + 11) as usize;
    }
    let log2 = 31 - size.leading_zeros() as usize;
    (log2 + 1).min(DATA_SIZES_LEN - 1)
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    record: OnDiskStats,
    addr: CacheAddr,
}

impl Stats {
    /// Load the record named by the index header, allocating it on first
    /// use. A record that fails validation is an error unless it is all
    /// zeros (never written), in which case counting starts over.
    pub fn load(files: &mut BlockFiles, header: &mut IndexHeader) -> Result<Self> {
        let blocks = STORAGE_SIZE as u32 / FileType::Block256.block_size();
        if !header.stats.is_initialized() {
            let addr = files.create_block(FileType::Block256, blocks)?;
            header.stats = addr;
            debug!(target: "dc::backend", %addr, "stats_block_created");
            return Ok(Self {
                record: OnDiskStats::default(),
                addr,
            });
        }

        let addr = header.stats;
        if !addr.is_block_file() || addr.file_type() != FileType::Block256 {
            return Err(DcError::Format(format!("stats: invalid address {addr}")));
        }
        let raw = files.read_record(addr)?;
        let record = match OnDiskStats::parse(&raw) {
            Ok(record) => record,
            Err(_) if raw.iter().all(|byte| *byte == 0) => OnDiskStats::default(),
            Err(err) => return Err(corruption(addr, &err)),
        };
        let mut stats = Self { record, addr };
        stats.set_counter(Counter::Unused, 0);
        Ok(stats)
    }

    /// Write the record back. Failures are logged and dropped.
    pub fn store(&self, files: &mut BlockFiles) {
        if !self.addr.is_initialized() {
            return;
        }
        let bytes = self.record.to_bytes(STORAGE_SIZE);
        if let Err(err) = files.write(self.addr, 0, &bytes) {
            warn!(target: "dc::backend", addr = %self.addr, error = %err, "stats_store_failed");
        }
    }

    pub fn on_event(&mut self, counter: Counter) {
        let slot = &mut self.record.counters[counter.slot()];
        *slot = slot.saturating_add(1);
    }

    #[must_use]
    pub fn counter(&self, counter: Counter) -> i64 {
        self.record.counters[counter.slot()]
    }

    pub fn set_counter(&mut self, counter: Counter, value: i64) {
        self.record.counters[counter.slot()] = value;
    }

    /// Move one stream from the bucket of `old_size` to that of `new_size`.
    /// A zero size is not counted.
    pub fn modify_storage_stats(&mut self, old_size: i32, new_size: i32) {
        if new_size != 0 {
            self.record.data_sizes[size_bucket(new_size)] += 1;
        }
        if old_size != 0 {
            self.record.data_sizes[size_bucket(old_size)] -= 1;
        }
    }

    /// Histogram entries followed by every counter, as printable pairs.
    #[must_use]
    pub fn items(&self) -> Vec<(String, String)> {
        let mut items = Vec::with_capacity(DATA_SIZES_LEN + NUM_COUNTERS);
        for (i, count) in self.record.data_sizes.iter().enumerate() {
            items.push((format!("Size{i:02}"), format!("0x{:08x}", *count as u32)));
        }
        for counter in Counter::ALL {
            items.push((counter.label().to_owned(), format!("0x{:x}", self.counter(counter))));
        }
        items
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dc_block::MemStorage;
    use dc_types::BASE_TABLE_LEN;
    use std::sync::Arc;

    #[test]
    fn buckets_follow_the_size_scale() {
        assert_eq!(size_bucket(0), 0);
        assert_eq!(size_bucket(1023), 0);
        assert_eq!(size_bucket(1024), 1);
        assert_eq!(size_bucket(2048), 2);
        assert_eq!(size_bucket(20 * 1024 - 1), 10);
        assert_eq!(size_bucket(20 * 1024), 11);
        assert_eq!(size_bucket(40 * 1024 - 1), 15);
        assert_eq!(size_bucket(40 * 1024), 16);
        assert_eq!(size_bucket(64 * 1024 * 1024), 27);
        assert_eq!(size_bucket(i32::MAX), DATA_SIZES_LEN - 1);
    }

    #[test]
    fn histogram_moves_between_buckets() {
        let mut stats = Stats::default();
        stats.modify_storage_stats(0, 100);
        stats.modify_storage_stats(100, 3000);
        assert_eq!(stats.record.data_sizes[0], 0);
        assert_eq!(stats.record.data_sizes[2], 1);
        stats.modify_storage_stats(3000, 0);
        assert!(stats.record.data_sizes.iter().all(|count| *count == 0));
    }

    #[test]
    fn record_is_allocated_then_reloaded() {
        let storage = MemStorage::new();
        let mut files = BlockFiles::open(Arc::new(storage.clone()), true).expect("files");
        let mut header = IndexHeader::new(BASE_TABLE_LEN, true);

        let mut stats = Stats::load(&mut files, &mut header).expect("create");
        assert!(header.stats.is_initialized());
        assert_eq!(header.stats.num_blocks(), 2);
        stats.on_event(Counter::OpenHit);
        stats.on_event(Counter::OpenHit);
        stats.set_counter(Counter::Unused, 9);
        stats.modify_storage_stats(0, 5000);
        stats.store(&mut files);

        let reloaded = Stats::load(&mut files, &mut header).expect("reload");
        assert_eq!(reloaded.counter(Counter::OpenHit), 2);
        assert_eq!(reloaded.counter(Counter::Unused), 0);
        assert_eq!(reloaded.record.data_sizes[size_bucket(5000)], 1);
    }

    #[test]
    fn garbage_record_is_rejected() {
        let storage = MemStorage::new();
        let mut files = BlockFiles::open(Arc::new(storage.clone()), true).expect("files");
        let mut header = IndexHeader::new(BASE_TABLE_LEN, false);
        let stats = Stats::load(&mut files, &mut header).expect("create");
        files.write(stats.addr, 0, &[0xAB; 16]).expect("scribble");
        assert!(Stats::load(&mut files, &mut header).is_err());
    }

    #[test]
    fn items_list_histogram_then_counters() {
        let mut stats = Stats::default();
        stats.on_event(Counter::DoomEntry);
        let items = stats.items();
        assert_eq!(items.len(), DATA_SIZES_LEN + NUM_COUNTERS);
        assert_eq!(items[0], ("Size00".to_owned(), "0x00000000".to_owned()));
        let doom = items
            .iter()
            .find(|(name, _)| name == "Doom entry")
            .expect("doom counter");
        assert_eq!(doom.1, "0x1");
    }
}
