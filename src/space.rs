use crate::globals::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// The four spaces the collector compacts, in compaction order: everything
/// slides towards `Old`, then into `Eden`, `From`, `To` on overflow.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Debug)]
#[repr(usize)]
pub enum SpaceId {
    Old = 0,
    Eden = 1,
    From = 2,
    To = 3,
}

pub const SPACE_COUNT: usize = 4;

impl SpaceId {
    pub const ALL: [SpaceId; SPACE_COUNT] = [SpaceId::Old, SpaceId::Eden, SpaceId::From, SpaceId::To];

    #[inline]
    pub fn from_index(i: usize) -> SpaceId {
        Self::ALL[i]
    }

    #[inline]
    pub fn index(self) -> usize {
        self as usize
    }
}

/// A contiguous space with a lock-free bump pointer. `bottom` and `end` are
/// region aligned; `top` moves between them.
pub struct MutableSpace {
    bottom: Address,
    end: Address,
    top: AtomicUsize,
}

impl MutableSpace {
    pub fn new(bottom: Address, end: Address) -> Self {
        debug_assert!(is_aligned(bottom, REGION_SIZE_BYTES));
        debug_assert!(is_aligned(end, REGION_SIZE_BYTES));
        Self {
            bottom,
            end,
            top: AtomicUsize::new(bottom),
        }
    }

    #[inline]
    pub fn bottom(&self) -> Address {
        self.bottom
    }

    #[inline]
    pub fn end(&self) -> Address {
        self.end
    }

    #[inline]
    pub fn top(&self) -> Address {
        self.top.load(Ordering::Relaxed)
    }

    pub fn set_top(&self, top: Address) {
        debug_assert!(top >= self.bottom && top <= self.end);
        self.top.store(top, Ordering::Relaxed);
    }

    #[inline]
    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.end
    }

    #[inline]
    pub fn capacity_in_words(&self) -> usize {
        (self.end - self.bottom) >> LOG_WORD_SIZE
    }

    #[inline]
    pub fn used_in_words(&self) -> usize {
        (self.top() - self.bottom) >> LOG_WORD_SIZE
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.top() == self.bottom
    }

    /// Bump-allocate `words`, racing against other mutators.
    pub fn allocate(&self, words: usize) -> Option<Address> {
        let bytes = words << LOG_WORD_SIZE;
        let mut old = self.top.load(Ordering::Relaxed);
        loop {
            if old + bytes > self.end {
                return None;
            }
            match self.top.compare_exchange_weak(
                old,
                old + bytes,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => return Some(old),
                Err(cur) => old = cur,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bump_allocation() {
        let space = MutableSpace::new(0, 4 * REGION_SIZE_BYTES);
        assert!(space.is_empty());
        let a = space.allocate(8).unwrap();
        let b = space.allocate(8).unwrap();
        assert_eq!(b - a, 8 * WORD_SIZE);
        assert_eq!(space.used_in_words(), 16);
        assert!(space.allocate(space.capacity_in_words()).is_none());
    }
}
