#![forbid(unsafe_code)]

use dc_core::{
    BackendConfig, BackendFlags, BackendState, DcError, DiskCache, Entry, EvictionKind, MemStorage,
};
use std::collections::BTreeSet;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

const MIB: i64 = 1024 * 1024;

fn config(dir: &Path, max_size: i64, eviction: EvictionKind) -> BackendConfig {
    BackendConfig {
        max_size,
        eviction,
        flags: BackendFlags {
            no_random: true,
            ..BackendFlags::default()
        },
        ..BackendConfig::at(dir)
    }
}

async fn open_dir(dir: &Path, max_size: i64, eviction: EvictionKind) -> DiskCache {
    let cache = DiskCache::new(config(dir, max_size, eviction)).expect("start");
    cache.init().await.expect("init");
    cache
}

fn stat(items: &[(String, String)], name: &str) -> String {
    items
        .iter()
        .find(|(item, _)| item == name)
        .map(|(_, value)| value.clone())
        .unwrap_or_else(|| panic!("missing stat {name}"))
}

async fn write_entry(cache: &DiskCache, key: &str, stream: usize, data: &[u8]) -> Entry {
    let entry = cache.create_entry(key).await.expect("create");
    entry.write_data(stream, 0, data, true).await.expect("write");
    entry
}

#[tokio::test]
async fn create_write_close_and_reopen() {
    let dir = tempfile::tempdir().expect("tempdir");
    let address;
    {
        let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;
        let entry = write_entry(&cache, "http://example.com/a", 0, b"header bytes").await;
        entry.write_data(1, 0, &vec![0x5A; 40_000], true).await.expect("big write");
        address = entry.address();
        drop(entry);
        cache.flush_queue_for_test().await.expect("flush");
    }

    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;
    let entry = cache.open_entry("http://example.com/a").await.expect("open");
    assert_eq!(entry.address(), address);
    assert_eq!(entry.read_data(0, 0, 1024).await.expect("read"), b"header bytes");
    assert_eq!(entry.data_size(1).await.expect("size"), 40_000);
    let body = entry.read_data(1, 39_990, 100).await.expect("tail");
    assert_eq!(body, vec![0x5A; 10]);
    drop(entry);
    assert_eq!(cache.self_check().await.expect("check"), 0);
}

#[tokio::test]
async fn doomed_key_is_gone_and_recreated_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;

    let entry = write_entry(&cache, "a", 0, b"0123456789").await;
    cache.doom_entry("a").await.expect("doom");
    assert!(matches!(cache.open_entry("a").await, Err(DcError::NotFound(_))));
    // The doomed handle still reads its data.
    assert_eq!(entry.read_data(0, 0, 10).await.expect("read"), b"0123456789");

    let fresh = cache.create_entry("a").await.expect("recreate");
    assert_eq!(fresh.data_size(0).await.expect("size"), 0);
    assert_ne!(fresh.address(), entry.address());
    drop(entry);
    drop(fresh);
    assert_eq!(cache.entry_count().await.expect("count"), 1);
    assert_eq!(cache.self_check().await.expect("check"), 0);
}

#[tokio::test]
async fn concurrent_dooms_mutate_once() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Classic).await;
    drop(cache.create_entry("shared").await.expect("create"));

    let first = cache.doom_entry("shared");
    let second = cache.clone().doom_entry("shared");
    let (first, second) = tokio::join!(first, second);
    assert!(first.is_ok());
    assert!(matches!(second, Err(DcError::NotFound(_))));

    let stats = cache.get_stats().await.expect("stats");
    assert_eq!(stat(&stats, "Doom entry"), "0x1");
    assert_eq!(stat(&stats, "Entries"), "0");
}

#[tokio::test]
async fn trimming_keeps_the_cache_under_its_limit() {
    let dir = tempfile::tempdir().expect("tempdir");
    let max_size = MIB;
    let cache = open_dir(dir.path(), max_size, EvictionKind::Classic).await;
    let payload = vec![7_u8; 50 * 1024];
    for i in 0..40 {
        drop(write_entry(&cache, &format!("k{i:02}"), 1, &payload).await);
    }
    cache.flush_queue_for_test().await.expect("flush");

    let stats = cache.get_stats().await.expect("stats");
    let current: i64 = stat(&stats, "Current size").parse().expect("number");
    assert!(current <= max_size, "cache holds {current} bytes");
    assert_ne!(stat(&stats, "Trim entry"), "0x0");

    // Least recently used entries went first.
    assert!(matches!(cache.open_entry("k00").await, Err(DcError::NotFound(_))));
    let newest = cache.open_entry("k39").await.expect("newest survives");
    assert_eq!(newest.data_size(1).await.expect("size"), 50 * 1024);
    drop(newest);
    assert_eq!(cache.self_check().await.expect("check"), 0);
}

#[tokio::test]
async fn default_flags_trim_without_a_warm_up() {
    let dir = tempfile::tempdir().expect("tempdir");
    let max_size = MIB;
    let config = BackendConfig {
        max_size,
        eviction: EvictionKind::Classic,
        ..BackendConfig::at(dir.path())
    };
    let cache = DiskCache::new(config).expect("start");
    cache.init().await.expect("init");
    let payload = vec![3_u8; 50 * 1024];
    for i in 0..40 {
        drop(write_entry(&cache, &format!("d{i:02}"), 1, &payload).await);
    }
    cache.flush_queue_for_test().await.expect("flush");

    let stats = cache.get_stats().await.expect("stats");
    let current: i64 = stat(&stats, "Current size").parse().expect("number");
    assert!(current <= max_size, "cache holds {current} bytes");
    assert!(matches!(cache.open_entry("d00").await, Err(DcError::NotFound(_))));
    assert!(cache.open_entry("d39").await.is_ok());
}

#[tokio::test]
async fn streams_over_the_file_limit_are_refused() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_dir(dir.path(), 8 * MIB, EvictionKind::Tiered).await;
    assert_eq!(cache.max_file_size().await.expect("limit"), MIB as i32);
    let entry = cache.create_entry("big").await.expect("create");
    let result = entry.write_data(1, MIB as usize, b"x", false).await;
    assert!(matches!(result, Err(DcError::TooBig { .. })));
    assert_eq!(entry.data_size(1).await.expect("size"), 0);
}

#[tokio::test]
async fn corrupted_index_magic_starts_over_empty() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;
        for i in 0..5 {
            drop(write_entry(&cache, &format!("e{i}"), 0, b"data").await);
        }
        cache.flush_queue_for_test().await.expect("flush");
    }
    let index = dir.path().join("index");
    let mut bytes = std::fs::read(&index).expect("read index");
    bytes[..4].copy_from_slice(&[0, 0, 0, 0]);
    std::fs::write(&index, bytes).expect("write index");

    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;
    assert_eq!(cache.state().await.expect("state"), BackendState::Ready);
    assert_eq!(cache.entry_count().await.expect("count"), 0);
    assert!(matches!(cache.open_entry("e0").await, Err(DcError::NotFound(_))));
    assert_eq!(cache.self_check().await.expect("check"), 0);
    drop(cache.create_entry("after").await.expect("usable"));
    assert_eq!(cache.entry_count().await.expect("count"), 1);
}

#[tokio::test]
async fn entries_open_at_a_crash_are_dropped_on_restart() {
    let storage = MemStorage::new();
    let config = BackendConfig {
        max_size: 10 * MIB,
        ..BackendConfig::default()
    };
    let cache = DiskCache::with_storage(config.clone(), Arc::new(storage.clone())).expect("start");
    cache.init().await.expect("init");
    drop(write_entry(&cache, "closed", 0, b"safe").await);
    let open = write_entry(&cache, "open", 0, b"in flight").await;
    cache.flush_queue_for_test().await.expect("flush");
    let crashed = storage.snapshot();

    let recovered = DiskCache::with_storage(config, Arc::new(crashed)).expect("start");
    recovered.init().await.expect("init after crash");
    let entry = recovered.open_entry("closed").await.expect("closed entry survives");
    assert_eq!(entry.read_data(0, 0, 100).await.expect("read"), b"safe");
    drop(entry);
    assert!(matches!(recovered.open_entry("open").await, Err(DcError::NotFound(_))));
    assert_eq!(recovered.entry_count().await.expect("count"), 1);
    assert_eq!(recovered.self_check().await.expect("check"), 0);
    let stats = recovered.get_stats().await.expect("stats");
    assert_eq!(stat(&stats, "Invalid entry"), "0x1");
    drop(open);
}

#[tokio::test]
async fn chains_stay_in_their_buckets() {
    let dir = tempfile::tempdir().expect("tempdir");
    let mut config = config(dir.path(), 10 * MIB, EvictionKind::Tiered);
    config.mask = 0x3;
    let cache = DiskCache::new(config).expect("start");
    cache.init().await.expect("init");

    let keys: Vec<String> = (0..64).map(|i| format!("https://host/{i}")).collect();
    for key in &keys {
        drop(cache.create_entry(key).await.expect("create"));
    }
    for key in keys.iter().step_by(3) {
        cache.doom_entry(key).await.expect("doom");
    }
    assert_eq!(cache.self_check().await.expect("check"), 0);
    for (i, key) in keys.iter().enumerate() {
        let opened = cache.open_entry(key).await;
        assert_eq!(opened.is_ok(), i % 3 != 0, "{key}");
    }
}

#[tokio::test]
async fn enumeration_skips_entries_doomed_midway() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;
    for i in 0..10 {
        drop(cache.create_entry(&format!("k{i}")).await.expect("create"));
    }

    let mut it = cache.enumerate();
    let first = cache.open_next_entry(&mut it).await.expect("next").expect("entry");
    assert_eq!(first.key(), "k9");
    cache.doom_entry("k5").await.expect("doom");
    cache.doom_entry("k6").await.expect("doom");

    let mut seen = vec![first.key().to_owned()];
    while let Some(entry) = cache.open_next_entry(&mut it).await.expect("next") {
        seen.push(entry.key().to_owned());
    }
    let unique: BTreeSet<_> = seen.iter().cloned().collect();
    assert_eq!(unique.len(), seen.len());
    let expected: BTreeSet<String> = (0..10)
        .filter(|i| *i != 5 && *i != 6)
        .map(|i| format!("k{i}"))
        .collect();
    assert_eq!(unique, expected);
}

#[tokio::test]
async fn backward_enumeration_starts_with_the_oldest() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Classic).await;
    for key in ["old", "middle", "new"] {
        drop(cache.create_entry(key).await.expect("create"));
    }
    let mut it = cache.enumerate();
    let mut keys = Vec::new();
    while let Some(entry) = cache.open_prev_entry(&mut it).await.expect("prev") {
        keys.push(entry.key().to_owned());
    }
    assert_eq!(keys, ["old", "middle", "new"]);
}

#[tokio::test]
async fn external_hits_refresh_recency() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;
    drop(cache.create_entry("a").await.expect("create"));
    drop(cache.create_entry("b").await.expect("create"));
    cache.on_external_cache_hit("a");
    cache.on_external_cache_hit("missing");

    let mut it = cache.enumerate();
    let first = cache.open_next_entry(&mut it).await.expect("next").expect("entry");
    assert_eq!(first.key(), "a");
}

#[tokio::test]
async fn external_hits_on_missing_keys_leave_the_cache_usable() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Classic).await;
    for i in 0..20 {
        cache.on_external_cache_hit(&format!("nowhere-{i}"));
    }
    assert_eq!(cache.entry_count().await.expect("count"), 0);
    drop(write_entry(&cache, "kept", 0, b"payload").await);
    cache.on_external_cache_hit("kept");
    cache.on_external_cache_hit("nowhere-else");
    let entry = cache.open_entry("kept").await.expect("open");
    assert_eq!(entry.data_size(0).await.expect("size"), 7);
    assert_eq!(cache.entry_count().await.expect("count"), 1);
}

#[tokio::test]
async fn dooming_recent_entries_keeps_older_ones() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;
    drop(cache.create_entry("before").await.expect("create"));
    tokio::time::sleep(Duration::from_millis(20)).await;
    let cutoff = SystemTime::now();
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(cache.create_entry("after-1").await.expect("create"));
    drop(cache.create_entry("after-2").await.expect("create"));

    cache.doom_entries_since(cutoff).await.expect("doom since");
    assert!(cache.open_entry("before").await.is_ok());
    assert!(matches!(cache.open_entry("after-1").await, Err(DcError::NotFound(_))));
    assert!(matches!(cache.open_entry("after-2").await, Err(DcError::NotFound(_))));
    let stats = cache.get_stats().await.expect("stats");
    assert_eq!(stat(&stats, "Doom recent entries"), "0x1");
}

#[tokio::test]
async fn doom_all_with_nothing_open_recreates_the_files() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;
    for i in 0..3 {
        drop(write_entry(&cache, &format!("x{i}"), 1, &[1; 30_000]).await);
    }
    cache.doom_all_entries().await.expect("doom all");
    assert_eq!(cache.entry_count().await.expect("count"), 0);
    let stats = cache.get_stats().await.expect("stats");
    assert_eq!(stat(&stats, "Doom cache"), "0x1");
    assert_eq!(stat(&stats, "Current size"), "0");
    assert!(!dir.path().join("f_000001").exists());
}

#[tokio::test]
async fn doom_all_with_open_entries_dooms_in_place() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Classic).await;
    let held = write_entry(&cache, "held", 0, b"keep reading").await;
    drop(cache.create_entry("idle").await.expect("create"));

    cache.doom_all_entries().await.expect("doom all");
    assert!(matches!(cache.open_entry("idle").await, Err(DcError::NotFound(_))));
    assert!(matches!(cache.open_entry("held").await, Err(DcError::NotFound(_))));
    assert_eq!(held.read_data(0, 0, 64).await.expect("read"), b"keep reading");
    drop(held);
    cache.flush_queue_for_test().await.expect("flush");
    assert_eq!(cache.entry_count().await.expect("count"), 0);
}

#[tokio::test]
async fn stats_timer_persists_counters() {
    let dir = tempfile::tempdir().expect("tempdir");
    {
        let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;
        drop(cache.create_entry("counted").await.expect("create"));
        for _ in 0..3 {
            cache.run_stats_timer_for_test().await.expect("tick");
        }
    }
    let cache = open_dir(dir.path(), 10 * MIB, EvictionKind::Tiered).await;
    let stats = cache.get_stats().await.expect("stats");
    assert_eq!(stat(&stats, "Create hit"), "0x1");
    assert_eq!(stat(&stats, "Timer"), "0x3");
    assert_eq!(stat(&stats, "Cache type"), "Blockfile Cache");
}

#[test]
fn blocking_callers_can_wait() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = DiskCache::new(config(dir.path(), 10 * MIB, EvictionKind::Tiered)).expect("start");
    assert!(matches!(cache.create_entry("early").wait(), Err(DcError::NotInitialized)));
    cache.init().wait().expect("init");
    let entry = cache.create_entry("sync").wait().expect("create");
    assert_eq!(entry.write_data(2, 0, b"abc", true).wait().expect("write"), 3);
    assert_eq!(entry.read_data(2, 1, 10).wait().expect("read"), b"bc");
}

#[test]
fn entries_outliving_the_cache_report_shutdown() {
    let dir = tempfile::tempdir().expect("tempdir");
    let cache = DiskCache::new(config(dir.path(), 10 * MIB, EvictionKind::Tiered)).expect("start");
    cache.init().wait().expect("init");
    let entry = cache.create_entry("orphan").wait().expect("create");
    drop(cache);
    assert!(matches!(entry.read_data(0, 0, 1).wait(), Err(DcError::Shutdown)));
}
