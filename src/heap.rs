use crate::globals::*;
use crate::header;
use crate::mmap::Mmap;
use crate::space::{MutableSpace, SpaceId, SPACE_COUNT};
use crate::InitError;
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicUsize, Ordering};

/// Four-space heap carved out of one reservation: old, eden and the two
/// survivor halves, laid out contiguously and region aligned.
///
/// Roots are slot tables: each slot holds an object address or 0. Strong
/// roots keep their referent alive; weak roots are cleared when the referent
/// dies and adjusted when it moves.
pub struct ParallelHeap {
    #[allow(dead_code)]
    mmap: Mmap,
    spaces: [MutableSpace; SPACE_COUNT],
    roots: Mutex<Vec<AtomicUsize>>,
    weak_roots: Mutex<Vec<AtomicUsize>>,
}

impl ParallelHeap {
    /// Reserve and carve the heap. All sizes are in words and must be region
    /// multiples.
    pub fn new(
        old_words: usize,
        eden_words: usize,
        survivor_words: usize,
    ) -> Result<Self, InitError> {
        assert!(is_aligned(old_words, REGION_SIZE));
        assert!(is_aligned(eden_words, REGION_SIZE));
        assert!(is_aligned(survivor_words, REGION_SIZE));
        let total_words = old_words + eden_words + 2 * survivor_words;
        let total_bytes = total_words << LOG_WORD_SIZE;
        let mmap = Mmap::new(total_bytes + REGION_SIZE_BYTES).ok_or(InitError::Reserve {
            what: "heap",
            words: total_words,
        })?;
        let base = mmap.aligned() as Address;

        let old_beg = base;
        let eden_beg = old_beg + (old_words << LOG_WORD_SIZE);
        let from_beg = eden_beg + (eden_words << LOG_WORD_SIZE);
        let to_beg = from_beg + (survivor_words << LOG_WORD_SIZE);
        let to_end = to_beg + (survivor_words << LOG_WORD_SIZE);

        Ok(Self {
            mmap,
            spaces: [
                MutableSpace::new(old_beg, eden_beg),
                MutableSpace::new(eden_beg, from_beg),
                MutableSpace::new(from_beg, to_beg),
                MutableSpace::new(to_beg, to_end),
            ],
            roots: Mutex::new(Vec::new()),
            weak_roots: Mutex::new(Vec::new()),
        })
    }

    #[inline]
    pub fn space(&self, id: SpaceId) -> &MutableSpace {
        &self.spaces[id.index()]
    }

    /// Lowest address covered by any space. The survivor spaces may sit in
    /// either index order after a flip, so both bounds scan all spaces.
    pub fn bottom(&self) -> Address {
        self.spaces.iter().map(MutableSpace::bottom).min().unwrap_or(0)
    }

    /// One past the highest address covered by any space.
    pub fn end(&self) -> Address {
        self.spaces.iter().map(MutableSpace::end).max().unwrap_or(0)
    }

    pub fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom() && addr < self.end()
    }

    /// Bump-allocate an object with `ref_len` zeroed reference slots.
    pub fn allocate_object(
        &self,
        id: SpaceId,
        size_words: usize,
        ref_len: usize,
    ) -> Option<Address> {
        let addr = self.space(id).allocate(size_words)?;
        header::write_object(addr, size_words, ref_len);
        Some(addr)
    }

    /// Register a strong root slot; returns its index.
    pub fn add_root(&self, addr: Address) -> usize {
        let mut roots = self.roots.lock();
        roots.push(AtomicUsize::new(addr));
        roots.len() - 1
    }

    pub fn root(&self, index: usize) -> Address {
        self.roots.lock()[index].load(Ordering::Relaxed)
    }

    pub fn set_root(&self, index: usize, addr: Address) {
        self.roots.lock()[index].store(addr, Ordering::Relaxed);
    }

    /// Register a weak root slot; returns its index.
    pub fn add_weak_root(&self, addr: Address) -> usize {
        let mut roots = self.weak_roots.lock();
        roots.push(AtomicUsize::new(addr));
        roots.len() - 1
    }

    pub fn weak_root(&self, index: usize) -> Address {
        self.weak_roots.lock()[index].load(Ordering::Relaxed)
    }

    pub(crate) fn lock_roots(&self) -> MutexGuard<'_, Vec<AtomicUsize>> {
        self.roots.lock()
    }

    pub(crate) fn lock_weak_roots(&self) -> MutexGuard<'_, Vec<AtomicUsize>> {
        self.weak_roots.lock()
    }

    /// Model the scavenger's from/to flip. The collector re-reads space
    /// geometry at the start of every cycle, so a flip between cycles is safe.
    pub fn swap_survivor_spaces(&mut self) {
        self.spaces.swap(SpaceId::From.index(), SpaceId::To.index());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeapObjectHeader;

    #[test]
    fn layout_is_contiguous_and_aligned() {
        let heap = ParallelHeap::new(4 * REGION_SIZE, 2 * REGION_SIZE, REGION_SIZE).unwrap();
        let old = heap.space(SpaceId::Old);
        let eden = heap.space(SpaceId::Eden);
        let from = heap.space(SpaceId::From);
        let to = heap.space(SpaceId::To);
        assert!(is_aligned(old.bottom(), REGION_SIZE_BYTES));
        assert_eq!(old.end(), eden.bottom());
        assert_eq!(eden.end(), from.bottom());
        assert_eq!(from.end(), to.bottom());
        assert_eq!(heap.end() - heap.bottom(), 8 * REGION_SIZE_BYTES);
    }

    #[test]
    fn object_allocation_and_roots() {
        let heap = ParallelHeap::new(REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
        let a = heap.allocate_object(SpaceId::Eden, 4, 1).unwrap();
        let b = heap.allocate_object(SpaceId::Eden, 4, 0).unwrap();
        HeapObjectHeader::from_address(a).set_ref_slot(0, b);
        let r = heap.add_root(a);
        assert_eq!(heap.root(r), a);
        assert_eq!(HeapObjectHeader::from_address(a).ref_slot(0), b);
    }

    #[test]
    fn survivor_swap() {
        let mut heap = ParallelHeap::new(REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
        let from = heap.space(SpaceId::From).bottom();
        let to = heap.space(SpaceId::To).bottom();
        heap.swap_survivor_spaces();
        assert_eq!(heap.space(SpaceId::From).bottom(), to);
        assert_eq!(heap.space(SpaceId::To).bottom(), from);
    }
}
