//! Key hash used for index buckets and record self-checks.
//!
//! Paul Hsieh's SuperFastHash. The exact bit pattern matters: the hash of
//! every key is stored in its entry header and the hash of every header is
//! stored next to it, so existing cache directories only validate with this
//! function. Trailing bytes are sign-extended, as in the reference code.

#[inline]
fn get16(data: &[u8], at: usize) -> u32 {
    u32::from(u16::from_le_bytes([data[at], data[at + 1]]))
}

#[inline]
fn signed_byte(byte: u8) -> u32 {
    i32::from(byte as i8) as u32
}

#[must_use]
pub fn super_fast_hash(data: &[u8]) -> u32 {
    if data.is_empty() {
        return 0;
    }
    let Ok(len) = u32::try_from(data.len()) else {
        return 0;
    };
    let mut hash = len;
    let rem = data.len() & 3;
    let mut at = 0;

    for _ in 0..data.len() / 4 {
        hash = hash.wrapping_add(get16(data, at));
        let tmp = (get16(data, at + 2) << 11) ^ hash;
        hash = (hash << 16) ^ tmp;
        at += 4;
        hash = hash.wrapping_add(hash >> 11);
    }

    match rem {
        3 => {
            hash = hash.wrapping_add(get16(data, at));
            hash ^= hash << 16;
            hash ^= signed_byte(data[at + 2]) << 18;
            hash = hash.wrapping_add(hash >> 11);
        }
        2 => {
            hash = hash.wrapping_add(get16(data, at));
            hash ^= hash << 11;
            hash = hash.wrapping_add(hash >> 17);
        }
        1 => {
            hash = hash.wrapping_add(signed_byte(data[at]));
            hash ^= hash << 10;
            hash = hash.wrapping_add(hash >> 1);
        }
        _ => {}
    }

    // Final avalanche.
    hash ^= hash << 3;
    hash = hash.wrapping_add(hash >> 5);
    hash ^= hash << 4;
    hash = hash.wrapping_add(hash >> 17);
    hash ^= hash << 25;
    hash = hash.wrapping_add(hash >> 6);
    hash
}
