//! Allocation map of a block file.
//!
//! The map is read as a sequence of 4-bit nibbles. A record of 1 to 4
//! blocks never crosses a nibble boundary. The "type" of a nibble is the
//! number of free blocks at its top, and a new record takes the lowest of
//! those free blocks. `empty[n - 1]` in the header counts nibbles of type
//! `n`, which lets the allocator pick a file and a run length without
//! scanning the map.

use dc_ondisk::BlockFileHeader;
use dc_types::MAX_NUM_BLOCKS;

/// Free blocks at the high end of each nibble value.
const NIBBLE_TYPES: [u32; 16] = [4, 3, 2, 2, 1, 1, 1, 1, 0, 0, 0, 0, 0, 0, 0, 0];

/// Number of free blocks at the top of `nibble` (only the low 4 bits count).
#[inline]
#[must_use]
pub fn nibble_type(nibble: u32) -> u32 {
    NIBBLE_TYPES[(nibble & 0xF) as usize]
}

fn map_words(header: &BlockFileHeader) -> usize {
    (header.max_entries.max(0) as usize / 32).min(header.allocation_map.len())
}

fn nibble_at(header: &BlockFileHeader, index: u32) -> u32 {
    let word = header.allocation_map[(index / 32) as usize];
    (word >> ((index % 32) / 4 * 4)) & 0xF
}

/// Allocate `size` blocks from a nibble of type `target`.
///
/// Returns the index of the first block, or `None` when no nibble of that
/// type exists (the counters were wrong; they are rebuilt before
/// returning).
pub fn create_map_block(header: &mut BlockFileHeader, target: u32, size: u32) -> Option<u32> {
    if target == 0 || target > MAX_NUM_BLOCKS || size == 0 || size > target {
        return None;
    }
    let words = map_words(header);
    if words == 0 {
        return None;
    }

    let mut current = usize::try_from(header.hints[(target - 1) as usize]).unwrap_or(0);
    for _ in 0..words {
        if current >= words {
            current = 0;
        }
        let mut map_block = header.allocation_map[current];
        for j in 0..8_u32 {
            if nibble_type(map_block) == target {
                let index_offset = j * 4 + 4 - target;
                let to_add = ((1_u32 << size) - 1) << index_offset;
                header.num_entries += 1;
                header.allocation_map[current] |= to_add;
                header.hints[(target - 1) as usize] = current as i32;
                header.empty[(target - 1) as usize] -= 1;
                if target != size {
                    header.empty[(target - size - 1) as usize] += 1;
                }
                return Some(current as u32 * 32 + index_offset);
            }
            map_block >>= 4;
        }
        current += 1;
    }

    fix_allocation_counters(header);
    None
}

/// Release `size` blocks starting at `index`.
pub fn delete_map_block(header: &mut BlockFileHeader, index: u32, size: u32) {
    if size == 0 || size > MAX_NUM_BLOCKS || index % 4 + size > 4 {
        return;
    }
    let word = (index / 32) as usize;
    if word >= header.allocation_map.len() {
        return;
    }

    let nibble = nibble_at(header, index);
    let bits_at_end = 4 - size - index % 4;
    let end_mask = (0xF_u32 << (4 - bits_at_end)) & 0xF;
    let update_counters = nibble & end_mask == 0;
    let run = ((1_u32 << size) - 1) << (index % 4);
    let new_type = nibble_type(nibble & !run);

    header.allocation_map[word] &= !(run << ((index % 32) / 4 * 4));

    if update_counters {
        if bits_at_end != 0 {
            header.empty[(bits_at_end - 1) as usize] -= 1;
        }
        header.empty[(new_type - 1) as usize] += 1;
    }
    header.num_entries -= 1;
}

/// All `size` blocks starting at `index` are allocated.
#[must_use]
pub fn used_map_block(header: &BlockFileHeader, index: u32, size: u32) -> bool {
    if size == 0 || size > MAX_NUM_BLOCKS || index % 4 + size > 4 {
        return false;
    }
    if index >= header.max_entries.max(0) as u32 {
        return false;
    }
    let run = ((1_u32 << size) - 1) << (index % 4);
    nibble_at(header, index) & run == run
}

/// Rebuild `empty` and reset `hints` from the map.
pub fn fix_allocation_counters(header: &mut BlockFileHeader) {
    header.empty = [0; 4];
    header.hints = [0; 4];
    for word in 0..map_words(header) {
        let mut map_block = header.allocation_map[word];
        for _ in 0..8 {
            let kind = nibble_type(map_block);
            if kind != 0 {
                header.empty[(kind - 1) as usize] += 1;
            }
            map_block >>= 4;
        }
    }
}

/// Free blocks the counters describe.
#[must_use]
pub fn empty_blocks(header: &BlockFileHeader) -> i32 {
    header
        .empty
        .iter()
        .enumerate()
        .map(|(i, count)| count * (i as i32 + 1))
        .sum()
}

/// Counters are plausible for the file's capacity.
#[must_use]
pub fn validate_counters(header: &BlockFileHeader) -> bool {
    if header.max_entries < 0 || header.max_entries % 32 != 0 {
        return false;
    }
    if header.empty.iter().any(|c| *c < 0) {
        return false;
    }
    let empty = empty_blocks(header);
    header.num_entries >= 0 && empty + header.num_entries <= header.max_entries
}

/// Header needs a larger (or another) file before a run of `block_count`
/// blocks can be allocated.
#[must_use]
pub fn needs_to_grow(header: &BlockFileHeader, block_count: u32) -> bool {
    let mut have_space = false;
    for (i, count) in header.empty.iter().enumerate() {
        if i + 1 >= block_count as usize && *count > 0 {
            have_space = true;
        }
    }
    // An almost full file with a successor is left alone for a while, which
    // keeps room for bigger runs when it is used again.
    if header.next_file != 0 && empty_blocks(header) < (dc_types::MAX_BLOCKS / 10) as i32 {
        return true;
    }
    !have_space
}

/// Smallest run length with a free nibble that fits `block_count` blocks.
#[must_use]
pub fn pick_target_size(header: &BlockFileHeader, block_count: u32) -> Option<u32> {
    (block_count..=MAX_NUM_BLOCKS).find(|size| header.empty[(*size - 1) as usize] > 0)
}
