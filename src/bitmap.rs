use crate::globals::*;
use crate::mmap::Mmap;
use crate::InitError;
use std::sync::atomic::{AtomicU64, Ordering};

const BITS_PER_WORD: usize = 64;

/// Side bitmap with one bit per heap word, kept in two planes: a bit for the
/// first word of every marked object and a bit for its last word. The pair
/// gives object sizes without touching the heap, which is what the compaction
/// phase needs while objects are being overwritten.
pub struct MarkBitmap {
    #[allow(dead_code)]
    mmap: Mmap,
    beg_bits: *mut AtomicU64,
    end_bits: *mut AtomicU64,
    heap_start: Address,
    heap_end: Address,
    bitmap_words: usize,
}

unsafe impl Send for MarkBitmap {}
unsafe impl Sync for MarkBitmap {}

impl MarkBitmap {
    pub fn new(heap_start: Address, heap_end: Address) -> Result<Self, InitError> {
        debug_assert!(is_aligned(heap_start, WORD_SIZE));
        debug_assert!(heap_end >= heap_start);
        let covered_words = (heap_end - heap_start) >> LOG_WORD_SIZE;
        let bitmap_words = (covered_words + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let bytes = 2 * bitmap_words * core::mem::size_of::<u64>();
        let mmap = Mmap::new(bytes.max(WORD_SIZE)).ok_or(InitError::Reserve {
            what: "mark bitmap",
            words: bytes >> LOG_WORD_SIZE,
        })?;
        let beg_bits = mmap.start() as *mut AtomicU64;
        let end_bits = unsafe { beg_bits.add(bitmap_words) };
        Ok(Self {
            mmap,
            beg_bits,
            end_bits,
            heap_start,
            heap_end,
            bitmap_words,
        })
    }

    #[inline]
    pub fn heap_start(&self) -> Address {
        self.heap_start
    }

    #[inline]
    pub fn heap_end(&self) -> Address {
        self.heap_end
    }

    #[inline]
    fn bit_index(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.heap_start && addr <= self.heap_end);
        (addr - self.heap_start) >> LOG_WORD_SIZE
    }

    #[inline]
    fn bit_to_addr(&self, bit: usize) -> Address {
        self.heap_start + (bit << LOG_WORD_SIZE)
    }

    #[inline]
    fn beg_word(&self, i: usize) -> &AtomicU64 {
        debug_assert!(i < self.bitmap_words);
        unsafe { &*self.beg_bits.add(i) }
    }

    #[inline]
    fn end_word(&self, i: usize) -> &AtomicU64 {
        debug_assert!(i < self.bitmap_words);
        unsafe { &*self.end_bits.add(i) }
    }

    /// Mark the object at `addr` of `size` words. Returns false if some other
    /// thread already marked it.
    #[inline]
    pub fn par_mark(&self, addr: Address, size: usize) -> bool {
        debug_assert!(size >= 1);
        let beg_bit = self.bit_index(addr);
        let mask = 1u64 << (beg_bit % BITS_PER_WORD);
        let old = self.beg_word(beg_bit / BITS_PER_WORD).fetch_or(mask, Ordering::Relaxed);
        if old & mask != 0 {
            return false;
        }
        let end_bit = beg_bit + size - 1;
        self.end_word(end_bit / BITS_PER_WORD)
            .fetch_or(1u64 << (end_bit % BITS_PER_WORD), Ordering::Relaxed);
        true
    }

    #[inline]
    pub fn is_marked(&self, addr: Address) -> bool {
        let bit = self.bit_index(addr);
        self.beg_word(bit / BITS_PER_WORD).load(Ordering::Relaxed) & (1u64 << (bit % BITS_PER_WORD))
            != 0
    }

    /// True if `addr` is the last word of a marked object.
    #[inline]
    pub fn is_obj_end(&self, addr: Address) -> bool {
        let bit = self.bit_index(addr);
        self.end_word(bit / BITS_PER_WORD).load(Ordering::Relaxed) & (1u64 << (bit % BITS_PER_WORD))
            != 0
    }

    fn find_bit(&self, plane: &dyn Fn(usize) -> u64, beg: Address, end: Address) -> Address {
        if beg >= end {
            return end;
        }
        let beg_bit = self.bit_index(beg);
        let end_bit = self.bit_index(end);
        let mut word_idx = beg_bit / BITS_PER_WORD;
        let last_word = (end_bit + BITS_PER_WORD - 1) / BITS_PER_WORD;
        let mut w = plane(word_idx) & (!0u64 << (beg_bit % BITS_PER_WORD));
        loop {
            if w != 0 {
                let bit = word_idx * BITS_PER_WORD + w.trailing_zeros() as usize;
                if bit < end_bit {
                    return self.bit_to_addr(bit);
                }
                return end;
            }
            word_idx += 1;
            if word_idx >= last_word {
                return end;
            }
            w = plane(word_idx);
        }
    }

    /// Address of the first marked object at or after `beg`; `end` if none.
    pub fn find_obj_beg(&self, beg: Address, end: Address) -> Address {
        self.find_bit(&|i| self.beg_word(i).load(Ordering::Relaxed), beg, end)
    }

    /// Address of the first object-end word at or after `beg`; `end` if none.
    pub fn find_obj_end(&self, beg: Address, end: Address) -> Address {
        self.find_bit(&|i| self.end_word(i).load(Ordering::Relaxed), beg, end)
    }

    /// Size in words of the marked object at `addr`, from the end-bit plane.
    pub fn obj_size(&self, addr: Address) -> usize {
        debug_assert!(self.is_marked(addr));
        let end = self.find_obj_end(addr, self.heap_end);
        debug_assert!(end < self.heap_end);
        ((end - addr) >> LOG_WORD_SIZE) + 1
    }

    /// Sum of the full sizes of marked objects beginning in `[beg, end)`.
    pub fn live_words_in_range(&self, beg: Address, end: Address) -> usize {
        let mut live = 0;
        let mut addr = self.find_obj_beg(beg, end);
        while addr < end {
            live += self.obj_size(addr);
            addr = self.find_obj_beg(addr + WORD_SIZE, end);
        }
        live
    }

    /// Clear both planes over `[beg, end)`. Not thread safe.
    pub fn clear_range(&self, beg: Address, end: Address) {
        if beg >= end {
            return;
        }
        let beg_bit = self.bit_index(beg);
        let end_bit = self.bit_index(end);
        let first_word = beg_bit / BITS_PER_WORD;
        let last_word = (end_bit - 1) / BITS_PER_WORD;
        let head_mask = !(!0u64 << (beg_bit % BITS_PER_WORD));
        let tail_bits = end_bit - last_word * BITS_PER_WORD;
        let tail_mask = if tail_bits == BITS_PER_WORD {
            0
        } else {
            !0u64 << tail_bits
        };
        for plane in [&self.beg_bits, &self.end_bits] {
            for i in first_word..=last_word {
                let keep = if i == first_word && i == last_word {
                    head_mask | tail_mask
                } else if i == first_word {
                    head_mask
                } else if i == last_word {
                    tail_mask
                } else {
                    0
                };
                let w = unsafe { &*plane.add(i) };
                w.store(w.load(Ordering::Relaxed) & keep, Ordering::Relaxed);
            }
        }
    }

    /// Debug check that `[beg, end)` carries no mark bits.
    pub fn is_range_clear(&self, beg: Address, end: Address) -> bool {
        self.find_obj_beg(beg, end) == end && self.find_obj_end(beg, end) == end
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_for(words: usize) -> MarkBitmap {
        // Fake heap range; the bitmap never dereferences heap addresses.
        let start = 0x10_0000_0000usize;
        MarkBitmap::new(start, start + words * WORD_SIZE).unwrap()
    }

    #[test]
    fn mark_and_size() {
        let bm = bitmap_for(1024);
        let a = bm.heap_start() + 8 * WORD_SIZE;
        assert!(bm.par_mark(a, 5));
        assert!(!bm.par_mark(a, 5));
        assert!(bm.is_marked(a));
        assert_eq!(bm.obj_size(a), 5);
        assert!(bm.is_obj_end(a + 4 * WORD_SIZE));
    }

    #[test]
    fn find_across_word_boundaries() {
        let bm = bitmap_for(1024);
        let a = bm.heap_start() + 63 * WORD_SIZE;
        let b = bm.heap_start() + 200 * WORD_SIZE;
        bm.par_mark(a, 1);
        bm.par_mark(b, 3);
        assert_eq!(bm.find_obj_beg(bm.heap_start(), bm.heap_end()), a);
        assert_eq!(bm.find_obj_beg(a + WORD_SIZE, bm.heap_end()), b);
        assert_eq!(
            bm.find_obj_beg(b + WORD_SIZE, bm.heap_end()),
            bm.heap_end()
        );
    }

    #[test]
    fn live_words() {
        let bm = bitmap_for(1024);
        let a = bm.heap_start();
        bm.par_mark(a, 10);
        bm.par_mark(a + 16 * WORD_SIZE, 6);
        bm.par_mark(a + 100 * WORD_SIZE, 1);
        let end = a + 100 * WORD_SIZE;
        assert_eq!(bm.live_words_in_range(a, end), 16);
        assert_eq!(bm.live_words_in_range(a, bm.heap_end()), 17);
    }

    #[test]
    fn clear_range_is_exact() {
        let bm = bitmap_for(1024);
        let a = bm.heap_start();
        bm.par_mark(a + 10 * WORD_SIZE, 2);
        bm.par_mark(a + 70 * WORD_SIZE, 2);
        bm.clear_range(a + 10 * WORD_SIZE, a + 70 * WORD_SIZE);
        assert!(!bm.is_marked(a + 10 * WORD_SIZE));
        assert!(bm.is_marked(a + 70 * WORD_SIZE));
        assert_eq!(bm.obj_size(a + 70 * WORD_SIZE), 2);
    }
}
