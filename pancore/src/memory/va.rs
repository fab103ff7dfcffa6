use crate::hw::align_up;
use std::collections::BTreeMap;

const SZ_4K: u64 = 0x1000;
const SZ_2M: u64 = 0x20_0000;

/// Alignment of auto-assigned addresses: large buffers get 2 MiB alignment so that the GPU MMU
/// can use large pages.
pub(crate) fn auto_va_alignment(size: u64) -> u64 {
    if size >= SZ_2M {
        SZ_2M
    } else {
        SZ_4K
    }
}

/// First-fit allocator over a range of GPU virtual addresses.
#[derive(Debug)]
pub(crate) struct VaHeap {
    start: u64,
    end: u64,
    /// Free ranges as `start -> size`, never adjacent to each other.
    free: BTreeMap<u64, u64>,
}

impl VaHeap {
    pub(crate) fn new(start: u64, end: u64) -> VaHeap {
        let mut free = BTreeMap::new();
        if end > start {
            free.insert(start, end - start);
        }
        VaHeap { start, end, free }
    }

    pub(crate) fn range(&self) -> (u64, u64) {
        (self.start, self.end)
    }

    pub(crate) fn alloc(&mut self, size: u64, align: u64) -> Option<u64> {
        let (block_start, block_size, va) = self.free.iter().find_map(|(&start, &len)| {
            let va = align_up(start, align);
            if va.checked_add(size)? <= start + len {
                Some((start, len, va))
            } else {
                None
            }
        })?;

        self.free.remove(&block_start);
        if va > block_start {
            self.free.insert(block_start, va - block_start);
        }
        let block_end = block_start + block_size;
        if va + size < block_end {
            self.free.insert(va + size, block_end - (va + size));
        }
        Some(va)
    }

    /// Takes `[va, va + size)` out of the heap. Fails if any part of it is not free.
    pub(crate) fn reserve(&mut self, va: u64, size: u64) -> bool {
        let end = match va.checked_add(size) {
            Some(end) => end,
            None => return false,
        };
        let (block_start, block_size) = match self.free.range(..=va).next_back() {
            Some((&start, &len)) if start + len >= end => (start, len),
            _ => return false,
        };
        self.free.remove(&block_start);
        if va > block_start {
            self.free.insert(block_start, va - block_start);
        }
        let block_end = block_start + block_size;
        if end < block_end {
            self.free.insert(end, block_end - end);
        }
        true
    }

    pub(crate) fn free(&mut self, va: u64, size: u64) {
        debug_assert!(va >= self.start && va + size <= self.end);
        let mut start = va;
        let mut len = size;

        if let Some((&prev_start, &prev_len)) = self.free.range(..va).next_back() {
            debug_assert!(prev_start + prev_len <= va, "double free of {:#x}", va);
            if prev_start + prev_len == va {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(va + size)) {
            self.free.remove(&(va + size));
            len += next_len;
        }
        self.free.insert(start, len);
    }

    #[cfg(test)]
    pub(crate) fn free_ranges(&self) -> Vec<(u64, u64)> {
        self.free.iter().map(|(&a, &b)| (a, b)).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocations_stay_inside_the_range() {
        let mut heap = VaHeap::new(0x200_0000, 0x300_0000);
        let a = heap.alloc(0x1000, SZ_4K).unwrap();
        assert_eq!(a, 0x200_0000);
        let b = heap.alloc(SZ_2M, SZ_2M).unwrap();
        assert_eq!(b % SZ_2M, 0);
        assert!(b >= a + 0x1000);
        assert!(heap.alloc(0x100_0000, SZ_4K).is_none());
    }

    #[test]
    fn freed_ranges_coalesce() {
        let mut heap = VaHeap::new(0x10000, 0x20000);
        let a = heap.alloc(0x1000, SZ_4K).unwrap();
        let b = heap.alloc(0x1000, SZ_4K).unwrap();
        let c = heap.alloc(0x1000, SZ_4K).unwrap();
        heap.free(a, 0x1000);
        heap.free(c, 0x1000);
        heap.free(b, 0x1000);
        assert_eq!(heap.free_ranges(), vec![(0x10000, 0x10000)]);
    }

    #[test]
    fn exhaustion() {
        let mut heap = VaHeap::new(0x10000, 0x12000);
        assert!(heap.alloc(0x2000, SZ_4K).is_some());
        assert!(heap.alloc(0x1000, SZ_4K).is_none());
    }

    #[test]
    fn reserved_ranges_are_not_handed_out() {
        let mut heap = VaHeap::new(0x10000, 0x20000);
        assert!(heap.reserve(0x11000, 0x1000));
        assert!(!heap.reserve(0x11800, 0x1000));
        assert!(!heap.reserve(0x1f000, 0x2000));
        assert_eq!(heap.alloc(0x2000, SZ_4K), Some(0x12000));
        heap.free(0x11000, 0x1000);
        assert_eq!(heap.alloc(0x1000, SZ_4K), Some(0x10000));
        assert_eq!(heap.alloc(0x1000, SZ_4K), Some(0x11000));
    }
}
