//! Benchmark: nibble allocation map.
//!
//! Measures allocation from a fragmented map (hint-driven scan) and the
//! full counter rebuild run when a header is found mid-update.

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use dc_alloc::bitmap::{
    create_map_block, delete_map_block, fix_allocation_counters, pick_target_size,
};
use dc_ondisk::BlockFileHeader;
use dc_types::{FileType, MAX_BLOCKS};

/// Full-size map with every other nibble holding a 2-block record.
fn fragmented_header() -> BlockFileHeader {
    let mut header = BlockFileHeader::new(1, FileType::Block256);
    header.max_entries = MAX_BLOCKS as i32;
    header.empty[3] = header.max_entries / 4;
    let mut held = Vec::new();
    while let Some(target) = pick_target_size(&header, 2) {
        match create_map_block(&mut header, target, 2) {
            Some(index) => held.push(index),
            None => break,
        }
    }
    for index in held.iter().step_by(2) {
        delete_map_block(&mut header, *index, 2);
    }
    header
}

fn bench_create_delete(c: &mut Criterion) {
    let header = fragmented_header();
    let mut group = c.benchmark_group("alloc_map");

    group.bench_function("create_then_delete_1", |b| {
        let mut header = header.clone();
        b.iter(|| {
            let target = pick_target_size(&header, 1).unwrap_or(4);
            if let Some(index) = create_map_block(&mut header, target, 1) {
                delete_map_block(&mut header, black_box(index), 1);
            }
        });
    });

    group.bench_function("create_then_delete_4", |b| {
        let mut header = header.clone();
        b.iter(|| {
            if let Some(index) = create_map_block(&mut header, 4, 4) {
                delete_map_block(&mut header, black_box(index), 4);
            }
        });
    });

    group.finish();
}

fn bench_fix_counters(c: &mut Criterion) {
    let header = fragmented_header();
    c.bench_function("fix_allocation_counters", |b| {
        b.iter(|| {
            let mut copy = header.clone();
            fix_allocation_counters(black_box(&mut copy));
            black_box(copy.empty)
        });
    });
}

criterion_group!(benches, bench_create_delete, bench_fix_counters);
criterion_main!(benches);
