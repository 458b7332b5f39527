//! In-memory write buffers for entry streams.
//!
//! A buffer covers one contiguous range of a stream. Writes into the first
//! 16 KiB keep the buffer anchored at offset 0, which is what lets a small
//! stream live entirely in memory until the entry closes and then land in
//! a block file in one write. Past that, a buffer may start anywhere and
//! grows up to [`MAX_BUFFER_SIZE`] while the backend-wide budget allows.

use dc_types::MAX_BLOCK_SIZE;

/// Largest buffer kept for one stream.
pub const MAX_BUFFER_SIZE: usize = 1024 * 1024;

/// Memory every buffer gets without asking.
const BASE_CAPACITY: usize = MAX_BLOCK_SIZE as usize;

/// Backend-wide accounting of buffer memory above the base capacity.
#[derive(Debug, Clone)]
pub struct BufferBudget {
    used: usize,
    limit: usize,
    enabled: bool,
}

impl BufferBudget {
    #[must_use]
    pub fn new(limit: usize, enabled: bool) -> Self {
        Self {
            used: 0,
            limit,
            enabled,
        }
    }

    /// Budget for a cache of `max_size` bytes: a tenth of it, at most 30 MiB.
    #[must_use]
    pub fn for_cache_size(max_size: i64, enabled: bool) -> Self {
        const CAP: i64 = 30 * 1024 * 1024;
        let limit = (max_size / 10).clamp(0, CAP);
        Self::new(usize::try_from(limit).unwrap_or(0), enabled)
    }

    /// Reserve the growth of one buffer from `current` to `new` bytes.
    pub fn is_alloc_allowed(&mut self, current: usize, new: usize) -> bool {
        if !self.enabled {
            return false;
        }
        let to_add = new.saturating_sub(current);
        if self.used + to_add > self.limit {
            return false;
        }
        self.used += to_add;
        true
    }

    pub fn buffer_deleted(&mut self, size: usize) {
        self.used = self.used.saturating_sub(size);
    }

    #[must_use]
    pub fn used(&self) -> usize {
        self.used
    }
}

#[derive(Debug)]
pub struct UserBuffer {
    offset: usize,
    data: Vec<u8>,
    capacity: usize,
    grow_allowed: bool,
}

impl Default for UserBuffer {
    fn default() -> Self {
        Self {
            offset: 0,
            data: Vec::with_capacity(BASE_CAPACITY),
            capacity: BASE_CAPACITY,
            grow_allowed: true,
        }
    }
}

impl UserBuffer {
    #[must_use]
    pub fn data(&self) -> &[u8] {
        &self.data
    }

    /// Mutable view of the buffered bytes, used to fill it from disk.
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    #[must_use]
    pub fn size(&self) -> usize {
        self.data.len()
    }

    #[must_use]
    pub fn start(&self) -> usize {
        self.offset
    }

    #[must_use]
    pub fn end(&self) -> usize {
        self.offset + self.data.len()
    }

    /// Whether `len` bytes at `offset` can be taken by this buffer,
    /// growing it if needed.
    pub fn pre_write(&mut self, offset: usize, len: usize, budget: &mut BufferBudget) -> bool {
        if offset < self.offset {
            return false;
        }
        if offset + len <= self.capacity {
            return true;
        }
        // A buffer that starts past the first 16 KiB only needs room for
        // this write.
        if self.data.is_empty() && offset > BASE_CAPACITY {
            return self.grow(len, MAX_BUFFER_SIZE, budget);
        }
        let required = offset - self.offset + len;
        self.grow(required, MAX_BUFFER_SIZE * 6 / 5, budget)
    }

    /// Drop everything past stream offset `offset`.
    pub fn truncate(&mut self, offset: usize) {
        let Some(len) = offset.checked_sub(self.offset) else {
            return;
        };
        if self.data.len() >= len {
            self.data.truncate(len);
        }
    }

    /// Copy `buf` to stream offset `offset`, zero filling any gap. The
    /// caller checked the write with [`UserBuffer::pre_write`].
    pub fn write(&mut self, offset: usize, buf: &[u8]) {
        if self.data.is_empty() && offset > BASE_CAPACITY {
            self.offset = offset;
        }
        let Some(start) = offset.checked_sub(self.offset) else {
            return;
        };
        if start > self.data.len() {
            self.data.resize(start, 0);
        }
        let overlap = (self.data.len() - start).min(buf.len());
        self.data[start..start + overlap].copy_from_slice(&buf[..overlap]);
        self.data.extend_from_slice(&buf[overlap..]);
    }

    /// Whether a read of `len` bytes at `offset` can be served from the
    /// buffer, given that the stream has `eof` bytes on disk. When it must
    /// go to disk instead, `len` may be shortened so the disk read stops
    /// where the buffer begins.
    pub fn pre_read(&self, eof: usize, offset: usize, len: &mut usize) -> bool {
        if offset < self.offset {
            if offset >= eof {
                return true;
            }
            *len = (*len).min(self.offset - offset).min(eof - offset);
            return false;
        }
        if self.data.is_empty() {
            return false;
        }
        offset - self.offset < self.data.len()
    }

    /// Serve a read accepted by [`UserBuffer::pre_read`]. Bytes before the
    /// buffer start read as zeros. Returns the number of bytes produced.
    pub fn read(&self, offset: usize, out: &mut [u8]) -> usize {
        let mut offset = offset;
        let mut clean = 0;
        if offset < self.offset {
            clean = (self.offset - offset).min(out.len());
            out[..clean].fill(0);
            if clean == out.len() {
                return clean;
            }
            offset = self.offset;
        }
        let start = offset - self.offset;
        let available = self.data.len().saturating_sub(start);
        let len = (out.len() - clean).min(available);
        out[clean..clean + len].copy_from_slice(&self.data[start..start + len]);
        clean + len
    }

    /// Empty the buffer for reuse, giving back memory a refused grow left
    /// accounted.
    pub fn reset(&mut self, budget: &mut BufferBudget) {
        if !self.grow_allowed {
            budget.buffer_deleted(self.capacity - BASE_CAPACITY);
            self.grow_allowed = true;
            self.capacity = BASE_CAPACITY;
            self.data = Vec::with_capacity(BASE_CAPACITY);
        }
        self.offset = 0;
        self.data.clear();
    }

    /// Return this buffer's memory to the budget.
    pub fn release(self, budget: &mut BufferBudget) {
        budget.buffer_deleted(self.capacity - BASE_CAPACITY);
    }

    fn grow(&mut self, required: usize, limit: usize, budget: &mut BufferBudget) -> bool {
        let current = self.capacity;
        if required <= current {
            return true;
        }
        if required > limit {
            return false;
        }
        let to_add = (required - current).max(BASE_CAPACITY * 4).max(current);
        let target = (current + to_add).min(limit);
        self.grow_allowed = budget.is_alloc_allowed(current, target);
        if !self.grow_allowed {
            return false;
        }
        self.data.reserve(target.saturating_sub(self.data.len()));
        self.capacity = target;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn budget() -> BufferBudget {
        BufferBudget::new(8 * MAX_BUFFER_SIZE, true)
    }

    #[test]
    fn small_writes_anchor_at_zero() {
        let mut budget = budget();
        let mut buffer = UserBuffer::default();
        assert!(buffer.pre_write(100, 10, &mut budget));
        buffer.write(100, &[7; 10]);
        assert_eq!(buffer.start(), 0);
        assert_eq!(buffer.size(), 110);
        assert!(buffer.data()[..100].iter().all(|b| *b == 0));

        let mut out = [0_u8; 20];
        assert!(buffer.pre_read(0, 95, &mut 20));
        assert_eq!(buffer.read(95, &mut out), 15);
        assert_eq!(&out[5..15], &[7; 10]);
    }

    #[test]
    fn far_write_starts_a_floating_buffer() {
        let mut budget = budget();
        let mut buffer = UserBuffer::default();
        let offset = 100 * 1024;
        assert!(buffer.pre_write(offset, 10, &mut budget));
        buffer.write(offset, b"0123456789");
        assert_eq!(buffer.start(), offset);
        assert_eq!(buffer.end(), offset + 10);
        assert!(!buffer.pre_write(offset - 1, 1, &mut budget));

        // Before the buffer and past the on-disk data reads as zeros.
        let mut len = 8;
        assert!(buffer.pre_read(0, offset - 4, &mut len));
        let mut out = [1_u8; 8];
        assert_eq!(buffer.read(offset - 4, &mut out), 8);
        assert_eq!(&out, b"\0\0\0\00123");

        // With data on disk the read is clipped to stop at the buffer.
        let mut len = 100;
        assert!(!buffer.pre_read(offset, offset - 50, &mut len));
        assert_eq!(len, 50);
    }

    #[test]
    fn growth_is_charged_and_refunded() {
        let mut budget = budget();
        let mut buffer = UserBuffer::default();
        assert!(buffer.pre_write(0, 20 * 1024, &mut budget));
        assert_eq!(budget.used(), 4 * BASE_CAPACITY);
        buffer.write(0, &vec![1; 20 * 1024]);
        buffer.release(&mut budget);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn disabled_budget_keeps_the_base_capacity() {
        let mut budget = BufferBudget::new(MAX_BUFFER_SIZE, false);
        let mut buffer = UserBuffer::default();
        assert!(buffer.pre_write(0, BASE_CAPACITY, &mut budget));
        assert!(!buffer.pre_write(0, BASE_CAPACITY + 1, &mut budget));
        buffer.reset(&mut budget);
        assert_eq!(budget.used(), 0);
    }

    #[test]
    fn oversized_writes_are_refused() {
        let mut budget = budget();
        let mut buffer = UserBuffer::default();
        assert!(!buffer.pre_write(0, 2 * MAX_BUFFER_SIZE, &mut budget));
        assert!(buffer.pre_write(BASE_CAPACITY + 1, MAX_BUFFER_SIZE, &mut budget));
        assert!(!buffer.pre_write(BASE_CAPACITY + 1, MAX_BUFFER_SIZE + 1, &mut budget));
    }

    #[test]
    fn truncate_and_overwrite() {
        let mut budget = budget();
        let mut buffer = UserBuffer::default();
        assert!(buffer.pre_write(0, 10, &mut budget));
        buffer.write(0, b"abcdefghij");
        buffer.write(8, b"XYZ");
        assert_eq!(buffer.data(), b"abcdefghXYZ");
        buffer.truncate(4);
        assert_eq!(buffer.data(), b"abcd");
        buffer.reset(&mut budget);
        assert_eq!(buffer.size(), 0);
        assert_eq!(buffer.start(), 0);
    }
}
