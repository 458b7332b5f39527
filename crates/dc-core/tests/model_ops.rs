#![forbid(unsafe_code)]

use dc_core::{BackendConfig, BackendFlags, DcError, DiskCache, EvictionKind, MemStorage};
use proptest::prelude::*;
use std::collections::BTreeMap;
use std::sync::Arc;

#[derive(Debug, Clone)]
enum Op {
    Create(u8, Vec<u8>),
    Open(u8),
    Doom(u8),
    Append(u8, Vec<u8>),
}

fn op() -> impl Strategy<Value = Op> {
    let key = 0_u8..12;
    let data = prop::collection::vec(any::<u8>(), 0..3000);
    prop_oneof![
        (key.clone(), data.clone()).prop_map(|(k, d)| Op::Create(k, d)),
        key.clone().prop_map(Op::Open),
        key.clone().prop_map(Op::Doom),
        (key, data).prop_map(|(k, d)| Op::Append(k, d)),
    ]
}

fn key(k: u8) -> String {
    format!("https://model.test/{k}")
}

fn cache(eviction: EvictionKind) -> DiskCache {
    let config = BackendConfig {
        max_size: 64 * 1024 * 1024,
        mask: 0x7,
        eviction,
        flags: BackendFlags {
            no_random: true,
            ..BackendFlags::default()
        },
        ..BackendConfig::default()
    };
    let cache = DiskCache::with_storage(config, Arc::new(MemStorage::new())).expect("start");
    cache.init().wait().expect("init");
    cache
}

fn run_ops(eviction: EvictionKind, ops: &[Op]) -> Result<(), TestCaseError> {
    let cache = cache(eviction);
    let mut model: BTreeMap<u8, Vec<u8>> = BTreeMap::new();

    for op in ops {
        match op {
            Op::Create(k, data) => match cache.create_entry(&key(*k)).wait() {
                Ok(entry) => {
                    prop_assert!(!model.contains_key(k));
                    entry.write_data(1, 0, data, true).wait().expect("write");
                    model.insert(*k, data.clone());
                }
                Err(DcError::Exists(_)) => prop_assert!(model.contains_key(k)),
                Err(err) => return Err(TestCaseError::fail(format!("create: {err}"))),
            },
            Op::Open(k) => match cache.open_entry(&key(*k)).wait() {
                Ok(entry) => {
                    let expected = model.get(k).expect("opened a key the model lacks");
                    let size = entry.data_size(1).wait().expect("size");
                    prop_assert_eq!(size as usize, expected.len());
                    let data = entry.read_data(1, 0, expected.len() + 10).wait().expect("read");
                    prop_assert_eq!(&data, expected);
                }
                Err(DcError::NotFound(_)) => prop_assert!(!model.contains_key(k)),
                Err(err) => return Err(TestCaseError::fail(format!("open: {err}"))),
            },
            Op::Doom(k) => match cache.doom_entry(&key(*k)).wait() {
                Ok(()) => prop_assert!(model.remove(k).is_some()),
                Err(DcError::NotFound(_)) => prop_assert!(!model.contains_key(k)),
                Err(err) => return Err(TestCaseError::fail(format!("doom: {err}"))),
            },
            Op::Append(k, data) => {
                let Some(current) = model.get_mut(k) else {
                    continue;
                };
                let entry = cache.open_entry(&key(*k)).wait().expect("open for append");
                entry.write_data(1, current.len(), data, false).wait().expect("append");
                current.extend_from_slice(data);
            }
        }
    }

    prop_assert_eq!(cache.entry_count().wait().expect("count") as usize, model.len());
    prop_assert_eq!(cache.self_check().wait().expect("self check"), 0);
    Ok(())
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(24))]

    #[test]
    fn tiered_cache_matches_a_map(ops in prop::collection::vec(op(), 1..60)) {
        run_ops(EvictionKind::Tiered, &ops)?;
    }

    #[test]
    fn classic_cache_matches_a_map(ops in prop::collection::vec(op(), 1..60)) {
        run_ops(EvictionKind::Classic, &ops)?;
    }
}
