use crate::bitmap::MarkBitmap;
use crate::globals::*;
use crate::mmap::Mmap;
use crate::InitError;
use atomic::Atomic;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};

/// Claim/complete lifecycle of a destination region within one cycle. A
/// region is claimable once its destination count reaches zero.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum RegionPhase {
    Unclaimed = 0,
    Claimed = 1,
    Completed = 2,
}

/// Shadow protocol states. A region that cannot be claimed yet may be filled
/// into a scratch (shadow) region instead and copied back once it drains.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
#[repr(u8)]
pub enum ShadowState {
    /// Neither the normal nor the shadow path has touched the region.
    Unused = 0,
    /// Stolen by a worker that will fill it through a shadow region.
    Shadow = 1,
    /// Its shadow copy is complete but has not been copied back.
    FilledShadow = 2,
    /// Shadow contents have been (or are being) copied back.
    CopiedShadow = 3,
    /// Filled in place, no shadow involved.
    Normal = 4,
}

/// Per-region summary record. All fields are written during the summary phase
/// on one thread and then read or CAS-stepped by the compaction gang, so each
/// field is individually atomic; none of them needs to be read consistently
/// with another.
///
/// An all-zero record is a cleared record; `clear_range` relies on that.
#[repr(C)]
pub struct RegionData {
    /// First (byte) address the region's live data is copied to.
    destination: AtomicUsize,
    /// Region supplying the first live word copied to this region.
    source_region: AtomicUsize,
    /// Start of the object that spills onto this region, if any.
    partial_obj_addr: AtomicUsize,
    /// Words of that spilled object that land in this region.
    partial_obj_size: AtomicUsize,
    /// Words of objects that start in this region.
    live_obj_size: AtomicUsize,
    /// Number of destination regions this region's data lands in, not
    /// counting itself. Zero means the region may be claimed and filled.
    destination_count: AtomicU32,
    phase: Atomic<RegionPhase>,
    shadow_state: Atomic<ShadowState>,
    /// Index of the shadow region filled on this region's behalf.
    shadow_region: AtomicUsize,
    /// Object whose tail could not be copied when the region was filled; its
    /// interior pointers are updated after the gang finishes.
    deferred_obj_addr: AtomicUsize,
    blocks_filled: AtomicBool,
}

impl RegionData {
    #[inline]
    pub fn destination(&self) -> Address {
        self.destination.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_destination(&self, addr: Address) {
        self.destination.store(addr, Ordering::Relaxed);
    }

    #[inline]
    pub fn source_region(&self) -> usize {
        self.source_region.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_source_region(&self, region: usize) {
        self.source_region.store(region, Ordering::Relaxed);
    }

    #[inline]
    pub fn partial_obj_addr(&self) -> Address {
        self.partial_obj_addr.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_partial_obj_addr(&self, addr: Address) {
        self.partial_obj_addr.store(addr, Ordering::Relaxed);
    }

    /// Words in this region from an object that starts in an earlier region.
    #[inline]
    pub fn partial_obj_size(&self) -> usize {
        self.partial_obj_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_partial_obj_size(&self, words: usize) {
        self.partial_obj_size.store(words, Ordering::Relaxed);
    }

    /// Words in this region from objects that start in it.
    #[inline]
    pub fn live_obj_size(&self) -> usize {
        self.live_obj_size.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_live_obj_size(&self, words: usize) {
        self.live_obj_size.store(words, Ordering::Relaxed);
    }

    #[inline]
    pub fn add_live_obj(&self, words: usize) {
        self.live_obj_size.fetch_add(words, Ordering::Relaxed);
    }

    /// Total live words that must be copied out of this region.
    #[inline]
    pub fn data_size(&self) -> usize {
        self.partial_obj_size() + self.live_obj_size()
    }

    #[inline]
    pub fn destination_count(&self) -> u32 {
        self.destination_count.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_destination_count(&self, count: u32) {
        self.destination_count.store(count, Ordering::Relaxed);
    }

    pub fn decrement_destination_count(&self) {
        let old = self.destination_count.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(old >= 1);
    }

    #[inline]
    pub fn blocks_filled(&self) -> bool {
        self.blocks_filled.load(Ordering::Acquire)
    }

    #[inline]
    pub fn set_blocks_filled(&self) {
        self.blocks_filled.store(true, Ordering::Release);
    }

    #[inline]
    pub fn deferred_obj_addr(&self) -> Address {
        self.deferred_obj_addr.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_deferred_obj_addr(&self, addr: Address) {
        self.deferred_obj_addr.store(addr, Ordering::Relaxed);
    }

    /// A region can be claimed and filled once nothing more will be copied
    /// out of it.
    #[inline]
    pub fn available(&self) -> bool {
        self.destination_count() == 0 && self.phase.load(Ordering::Acquire) == RegionPhase::Unclaimed
    }

    /// Claim the region for filling. At most one claimer succeeds.
    pub fn claim(&self) -> bool {
        self.phase
            .compare_exchange(
                RegionPhase::Unclaimed,
                RegionPhase::Claimed,
                Ordering::AcqRel,
                Ordering::Relaxed,
            )
            .is_ok()
    }

    /// `available()` check plus `claim()`, the seeding-time fast path.
    pub fn try_claim(&self) -> bool {
        self.available() && self.claim()
    }

    #[inline]
    pub fn claimed(&self) -> bool {
        self.phase.load(Ordering::Acquire) == RegionPhase::Claimed
    }

    #[inline]
    pub fn completed(&self) -> bool {
        self.phase.load(Ordering::Acquire) == RegionPhase::Completed
    }

    pub fn set_completed(&self) {
        debug_assert!(self.claimed());
        self.phase.store(RegionPhase::Completed, Ordering::Release);
    }

    #[inline]
    pub fn shadow_state(&self) -> ShadowState {
        self.shadow_state.load(Ordering::Acquire)
    }

    fn shadow_transition(&self, from: ShadowState, to: ShadowState) -> bool {
        self.shadow_state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Relaxed)
            .is_ok()
    }

    /// The region will be filled in place.
    pub fn mark_normal(&self) -> bool {
        self.shadow_transition(ShadowState::Unused, ShadowState::Normal)
    }

    /// The region will be filled through a shadow region.
    pub fn mark_shadow(&self) -> bool {
        self.shadow_transition(ShadowState::Unused, ShadowState::Shadow)
    }

    pub fn mark_filled(&self) {
        let ok = self.shadow_transition(ShadowState::Shadow, ShadowState::FilledShadow);
        debug_assert!(ok);
    }

    /// Whoever wins this transition copies the shadow contents back.
    pub fn mark_copied(&self) -> bool {
        self.shadow_transition(ShadowState::FilledShadow, ShadowState::CopiedShadow)
    }

    /// The shadow steal lost the race with a normal claim; fall back.
    pub fn shadow_to_normal(&self) {
        let ok = self.shadow_transition(ShadowState::Shadow, ShadowState::Normal);
        debug_assert!(ok);
    }

    #[inline]
    pub fn shadow_region(&self) -> usize {
        self.shadow_region.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_shadow_region(&self, region: usize) {
        self.shadow_region.store(region, Ordering::Relaxed);
    }
}

/// One word per 128-word block: the number of live words in the enclosing
/// region that are copied before the first object beginning in this block.
#[repr(C)]
pub struct BlockData {
    offset: AtomicUsize,
}

impl BlockData {
    #[inline]
    pub fn offset(&self) -> usize {
        self.offset.load(Ordering::Relaxed)
    }

    #[inline]
    pub fn set_offset(&self, words: usize) {
        self.offset.store(words, Ordering::Relaxed);
    }
}

/// Bookkeeping for a source space that is split over two destination spaces.
/// At most one split per space per cycle; written single-threaded during the
/// summary phase, read-only afterwards.
#[derive(Clone, Copy, Debug, Default)]
pub struct SplitInfo {
    src_region_idx: usize,
    partial_obj_size: usize,
    destination: Address,
    destination_count: u32,
    dest_region_addr: Address,
    first_src_addr: Address,
}

impl SplitInfo {
    pub fn clear(&mut self) {
        *self = SplitInfo::default();
        debug_assert!(!self.is_valid());
    }

    #[inline]
    pub fn is_valid(&self) -> bool {
        self.src_region_idx != 0
    }

    /// True if `region_idx` is the split region.
    #[inline]
    pub fn is_split(&self, region_idx: usize) -> bool {
        self.is_valid() && self.src_region_idx == region_idx
    }

    #[inline]
    pub fn src_region_idx(&self) -> usize {
        self.src_region_idx
    }

    /// Size of the partial object carried over the split, in words.
    #[inline]
    pub fn partial_obj_size(&self) -> usize {
        self.partial_obj_size
    }

    /// Where the carried partial object is copied.
    #[inline]
    pub fn destination(&self) -> Address {
        self.destination
    }

    pub fn destination_count(&self) -> u32 {
        self.destination_count
    }

    /// Destination region whose first word comes from the split region.
    #[inline]
    pub fn dest_region_addr(&self) -> Address {
        self.dest_region_addr
    }

    /// The split-region word that becomes the first word copied to
    /// `dest_region_addr`.
    #[inline]
    pub fn first_src_addr(&self) -> Address {
        self.first_src_addr
    }

    pub fn record(
        &mut self,
        sd: &SummaryData,
        src_region_idx: usize,
        partial_obj_size: usize,
        destination: Address,
    ) {
        assert!(src_region_idx != 0);
        assert!(partial_obj_size != 0);
        assert!(destination != 0);

        self.src_region_idx = src_region_idx;
        self.partial_obj_size = partial_obj_size;
        self.destination = destination;

        debug_assert_eq!(self.dest_region_addr, 0);
        debug_assert_eq!(self.first_src_addr, 0);

        // Number of destination regions the partial object lands in.
        let last_word = destination + (partial_obj_size << LOG_WORD_SIZE) - WORD_SIZE;
        let beg_region_addr = sd.region_align_down(destination);
        let end_region_addr = sd.region_align_down(last_word);

        if beg_region_addr == end_region_addr {
            self.destination_count = 1;
            if end_region_addr == destination {
                // The destination falls on a region boundary, thus the first
                // word of the partial object is the first word copied to the
                // destination region.
                self.dest_region_addr = end_region_addr;
                self.first_src_addr = sd.region_to_addr(src_region_idx);
            }
        } else {
            // The partial object crosses a destination region boundary, so a
            // word somewhere within it is the first word copied to the second
            // destination region.
            self.destination_count = 2;
            self.dest_region_addr = end_region_addr;
            let ofs = end_region_addr - destination;
            debug_assert!(ofs >> LOG_WORD_SIZE < self.partial_obj_size);
            self.first_src_addr = sd.region_to_addr(src_region_idx) + ofs;
        }
    }
}

/// Result of summarizing one source range into one destination range.
#[derive(Clone, Copy, Debug)]
pub enum Summarize {
    /// Everything fit; `target_next` is the first free destination word.
    Fit { target_next: Address },
    /// The source overflowed the destination. Summarization stopped at the
    /// recorded split; `source_next` resumes the source, `target_next` is the
    /// first free word past the data already committed to the destination.
    Split {
        source_next: Address,
        target_next: Address,
    },
}

/// The per-region and per-block side tables plus every address/index
/// conversion in the crate. Indices and offsets do not leak raw shift
/// arithmetic to other modules.
pub struct SummaryData {
    #[allow(dead_code)]
    mmap: Mmap,
    region_data: *mut RegionData,
    block_data: *mut BlockData,
    region_start: Address,
    region_end: Address,
    region_count: usize,
    block_count: usize,
}

unsafe impl Send for SummaryData {}
unsafe impl Sync for SummaryData {}

const LOG_REGION_BYTES: usize = LOG_REGION_SIZE + LOG_WORD_SIZE;
const LOG_BLOCK_BYTES: usize = LOG_BLOCK_SIZE + LOG_WORD_SIZE;

impl SummaryData {
    pub fn new(covered_beg: Address, covered_end: Address) -> Result<Self, InitError> {
        assert!(is_aligned(covered_beg, REGION_SIZE_BYTES));
        assert!(is_aligned(covered_end, REGION_SIZE_BYTES));
        let region_count = (covered_end - covered_beg) >> LOG_REGION_BYTES;
        let block_count = region_count << LOG_BLOCKS_PER_REGION;
        let region_bytes = region_count * core::mem::size_of::<RegionData>();
        let block_bytes = block_count * core::mem::size_of::<BlockData>();
        let mmap = Mmap::new((region_bytes + block_bytes).max(WORD_SIZE)).ok_or(
            InitError::Reserve {
                what: "summary data",
                words: (region_bytes + block_bytes) >> LOG_WORD_SIZE,
            },
        )?;
        let region_data = mmap.start() as *mut RegionData;
        let block_data = unsafe { mmap.start().add(region_bytes) as *mut BlockData };
        Ok(Self {
            mmap,
            region_data,
            block_data,
            region_start: covered_beg,
            region_end: covered_end,
            region_count,
            block_count,
        })
    }

    #[inline]
    pub fn region_count(&self) -> usize {
        self.region_count
    }

    #[inline]
    pub fn region(&self, idx: usize) -> &RegionData {
        debug_assert!(idx < self.region_count);
        unsafe { &*self.region_data.add(idx) }
    }

    #[inline]
    pub fn block(&self, idx: usize) -> &BlockData {
        debug_assert!(idx < self.block_count);
        unsafe { &*self.block_data.add(idx) }
    }

    #[inline]
    pub fn addr_to_region_idx(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.region_start && addr <= self.region_end);
        (addr - self.region_start) >> LOG_REGION_BYTES
    }

    #[inline]
    pub fn region_to_addr(&self, idx: usize) -> Address {
        self.region_start + (idx << LOG_REGION_BYTES)
    }

    #[inline]
    pub fn region_containing(&self, addr: Address) -> &RegionData {
        self.region(self.addr_to_region_idx(addr))
    }

    #[inline]
    pub fn region_align_down(&self, addr: Address) -> Address {
        round_down(addr, REGION_SIZE_BYTES)
    }

    #[inline]
    pub fn region_align_up(&self, addr: Address) -> Address {
        round_up(addr, REGION_SIZE_BYTES)
    }

    #[inline]
    pub fn is_region_aligned(&self, addr: Address) -> bool {
        is_aligned(addr, REGION_SIZE_BYTES)
    }

    /// Word offset of `addr` within its region.
    #[inline]
    pub fn region_offset(&self, addr: Address) -> usize {
        (addr & (REGION_SIZE_BYTES - 1)) >> LOG_WORD_SIZE
    }

    #[inline]
    pub fn addr_to_block_idx(&self, addr: Address) -> usize {
        debug_assert!(addr >= self.region_start && addr < self.region_end);
        (addr - self.region_start) >> LOG_BLOCK_BYTES
    }

    #[inline]
    pub fn block_align_down(&self, addr: Address) -> Address {
        round_down(addr, 1 << LOG_BLOCK_BYTES)
    }

    /// Zero the records for regions `[beg_region, end_region)` and their
    /// blocks. Not thread safe.
    pub fn clear_range(&self, beg_region: usize, end_region: usize) {
        assert!(beg_region <= self.region_count);
        assert!(end_region <= self.region_count);
        if beg_region >= end_region {
            return;
        }
        let region_cnt = end_region - beg_region;
        unsafe {
            core::ptr::write_bytes(self.region_data.add(beg_region), 0, region_cnt);
            core::ptr::write_bytes(
                self.block_data.add(beg_region << LOG_BLOCKS_PER_REGION),
                0,
                region_cnt << LOG_BLOCKS_PER_REGION,
            );
        }
    }

    /// Debug check that a region range carries no stale summary data.
    pub fn is_range_clear(&self, beg_region: usize, end_region: usize) -> bool {
        (beg_region..end_region).all(|i| {
            let r = self.region(i);
            r.data_size() == 0
                && r.destination() == 0
                && r.destination_count() == 0
                && !r.claimed()
                && !r.completed()
                && r.shadow_state() == ShadowState::Unused
        })
    }

    /// Credit a marked object at `addr` of `len` words to the regions it
    /// covers. Safe to call from multiple markers concurrently; at most one
    /// object can span any given region boundary.
    pub fn add_obj(&self, addr: Address, len: usize) {
        let beg_region = self.addr_to_region_idx(addr);
        let end_region = self.addr_to_region_idx(addr + (len << LOG_WORD_SIZE) - WORD_SIZE);

        if beg_region == end_region {
            // All in one region.
            self.region(beg_region).add_live_obj(len);
            return;
        }

        // First region.
        let beg_ofs = self.region_offset(addr);
        self.region(beg_region).add_live_obj(REGION_SIZE - beg_ofs);

        // Middle regions, completely spanned by this object.
        for region in beg_region + 1..end_region {
            self.region(region).set_partial_obj_size(REGION_SIZE);
            self.region(region).set_partial_obj_addr(addr);
        }

        // Last region.
        let end_ofs = self.region_offset(addr + (len << LOG_WORD_SIZE) - WORD_SIZE);
        self.region(end_region).set_partial_obj_size(end_ofs + 1);
        self.region(end_region).set_partial_obj_addr(addr);
    }

    /// End of the object spilling onto `region_idx`, found by walking
    /// successor regions while they are fully covered by it.
    pub fn partial_obj_end(&self, region_idx: usize) -> Address {
        let last = self.region_count - 1;
        let mut result = self.region_to_addr(region_idx);
        let mut cur = region_idx;
        if cur < last {
            loop {
                let partial = self.region(cur).partial_obj_size();
                result += partial << LOG_WORD_SIZE;
                cur += 1;
                if partial != REGION_SIZE || cur >= last {
                    break;
                }
            }
        }
        result
    }

    /// Pin the regions in `[beg, end)`: they compact into themselves and
    /// their live size is topped up so each reads as completely full, which
    /// keeps the full-region fast path of `calc_new_pointer` exact.
    pub fn summarize_dense_prefix(&self, beg: Address, end: Address) {
        assert!(self.is_region_aligned(beg));
        assert!(self.is_region_aligned(end));

        let mut cur_region = self.addr_to_region_idx(beg);
        let end_region = self.addr_to_region_idx(end);
        let mut addr = beg;
        while cur_region < end_region {
            let r = self.region(cur_region);
            r.set_destination(addr);
            r.set_destination_count(0);
            r.set_source_region(cur_region);

            // Update live_obj_size so the region appears completely full.
            r.set_live_obj_size(REGION_SIZE - r.partial_obj_size());

            cur_region += 1;
            addr += REGION_SIZE_BYTES;
        }
    }

    // Find the point at which the source space can be split and, if
    // necessary, record it.
    //
    // If the overflowing region has no partial object the split is at its
    // start (an "easy" split, no bookkeeping). Otherwise the split lands in
    // the region where the overflowing object starts: just past that region's
    // own partial object if it has one (a "hard" split that must be
    // recorded), at its start if not.
    fn summarize_split_space(
        &self,
        src_region: usize,
        split_info: &mut SplitInfo,
        destination: Address,
        target_end: Address,
    ) -> (Address, Address) {
        debug_assert!(destination <= target_end);
        debug_assert!(
            destination + (self.region(src_region).data_size() << LOG_WORD_SIZE) > target_end
        );
        debug_assert!(self.is_region_aligned(target_end));

        let mut split_region = src_region;
        let mut split_destination = destination;
        let mut partial_obj_size = self.region(src_region).partial_obj_size();

        if destination + (partial_obj_size << LOG_WORD_SIZE) > target_end {
            // The split point is just after the partial object (if any) in
            // the region containing the start of the overflowing object.
            let overflow_obj = self.region(src_region).partial_obj_addr();
            split_region = self.addr_to_region_idx(overflow_obj);

            // Clear the source_region field of all destination regions whose
            // first word came from data after the split point (a non-zero
            // source_region implies a region must be filled).
            let sr = self.region(split_region);
            let beg_idx = self.addr_to_region_idx(
                self.region_align_up(sr.destination() + (sr.partial_obj_size() << LOG_WORD_SIZE)),
            );
            let end_idx = self.addr_to_region_idx(target_end);

            log::trace!("split: clearing source_region in [{}, {})", beg_idx, end_idx);
            for idx in beg_idx..end_idx {
                self.region(idx).set_source_region(0);
            }

            split_destination = sr.destination();
            partial_obj_size = sr.partial_obj_size();
        }

        // The split is recorded only if a partial object extends onto the
        // split region.
        if partial_obj_size != 0 {
            self.region(split_region).set_partial_obj_size(0);
            split_info.record(self, split_region, partial_obj_size, split_destination);
        }

        let target_next = split_destination + (partial_obj_size << LOG_WORD_SIZE);
        let source_next = self.region_to_addr(split_region) + (partial_obj_size << LOG_WORD_SIZE);

        log::trace!(
            "{} split: src_next={:#x} split_region={} partial={} dst={:#x} target_next={:#x}",
            if partial_obj_size == 0 { "easy" } else { "hard" },
            source_next,
            split_region,
            partial_obj_size,
            split_destination,
            target_next
        );

        (source_next, target_next)
    }

    /// Assign destinations to the live data of every source region in
    /// `[source_beg, source_end)`, packing it from `target_beg` and never
    /// past `target_end`. Sets each source region's destination count and the
    /// destination regions' source-region links.
    pub fn summarize(
        &self,
        split_info: &mut SplitInfo,
        source_beg: Address,
        source_end: Address,
        target_beg: Address,
        target_end: Address,
    ) -> Summarize {
        log::trace!(
            "summarize: src=[{:#x}, {:#x}) tgt=[{:#x}, {:#x})",
            source_beg,
            source_end,
            target_beg,
            target_end
        );
        let mut cur_region = self.addr_to_region_idx(source_beg);
        let end_region = self.addr_to_region_idx(self.region_align_up(source_end));

        let mut dest_addr = target_beg;
        while cur_region < end_region {
            // The destination must be set even if the region has no data.
            self.region(cur_region).set_destination(dest_addr);

            let words = self.region(cur_region).data_size();
            if words > 0 {
                // If cur_region does not fit entirely into the target space,
                // find a point at which the source space can be split so that
                // part is copied to the target space and the rest elsewhere.
                if dest_addr + (words << LOG_WORD_SIZE) > target_end {
                    let (source_next, target_next) =
                        self.summarize_split_space(cur_region, split_info, dest_addr, target_end);
                    return Summarize::Split {
                        source_next,
                        target_next,
                    };
                }

                // The destination_count calculation is subtle: a region whose
                // data compacts into itself does not count itself, keeping
                // the invariant that a zero count means the region is
                // available to be claimed and filled.
                let mut destination_count = 0u32;
                if split_info.is_split(cur_region) {
                    // The partial object carried over the split goes to one
                    // destination space, the remaining data to another.
                    destination_count = split_info.destination_count();
                    if destination_count == 2 {
                        let dest_idx = self.addr_to_region_idx(split_info.dest_region_addr());
                        self.region(dest_idx).set_source_region(cur_region);
                    }
                }

                let last_addr = dest_addr + (words << LOG_WORD_SIZE) - WORD_SIZE;
                let dest_region_1 = self.addr_to_region_idx(dest_addr);
                let dest_region_2 = self.addr_to_region_idx(last_addr);

                destination_count += if cur_region == dest_region_2 { 0 } else { 1 };
                if dest_region_1 != dest_region_2 {
                    destination_count += 1;
                    // Data from cur_region is copied to the start of
                    // dest_region_2.
                    self.region(dest_region_2).set_source_region(cur_region);
                } else if self.is_region_aligned(dest_addr) {
                    self.region(dest_region_1).set_source_region(cur_region);
                }

                self.region(cur_region).set_destination_count(destination_count);
                dest_addr += words << LOG_WORD_SIZE;
            }

            cur_region += 1;
        }

        Summarize::Fit {
            target_next: dest_addr,
        }
    }

    /// Forwarding address of the marked object at `addr`.
    pub fn calc_new_pointer(&self, bitmap: &MarkBitmap, addr: Address) -> Address {
        debug_assert!(addr != 0);
        debug_assert!(bitmap.is_marked(addr));

        let region_idx = self.addr_to_region_idx(addr);
        let region_ptr = self.region(region_idx);
        let result = region_ptr.destination();

        // If the entire region is live nothing in it moves relative to the
        // region, so the offset within the region is preserved. This is what
        // makes dense-prefix lookups cheap.
        if region_ptr.data_size() == REGION_SIZE {
            return result + (self.region_offset(addr) << LOG_WORD_SIZE);
        }

        // Otherwise the new location is destination + block offset + the live
        // words in the block that precede addr. Filling the block table is
        // unsynchronized; concurrent fills write identical values.
        if !region_ptr.blocks_filled() {
            self.fill_blocks(bitmap, region_idx);
            region_ptr.set_blocks_filled();
        }

        let search_start = self.block_align_down(addr);
        let block_offset = self.block(self.addr_to_block_idx(addr)).offset();
        let live = bitmap.live_words_in_range(search_start, addr);
        result + ((block_offset + live) << LOG_WORD_SIZE)
    }

    /// Populate the block table for one region: each block's offset is the
    /// live words copied out of the region before the first object beginning
    /// in that block.
    pub fn fill_blocks(&self, bitmap: &MarkBitmap, region_idx: usize) {
        let region_addr = self.region_to_addr(region_idx);
        let first_block = region_idx << LOG_BLOCKS_PER_REGION;
        let mut live = self.region(region_idx).partial_obj_size();

        for b in 0..BLOCKS_PER_REGION {
            self.block(first_block + b).set_offset(live);
            let blk_beg = region_addr + (b << LOG_BLOCK_BYTES);
            let blk_end = blk_beg + (1 << LOG_BLOCK_BYTES);
            let mut obj = bitmap.find_obj_beg(blk_beg, blk_end);
            while obj < blk_end {
                live += bitmap.obj_size(obj);
                obj = bitmap.find_obj_beg(obj + WORD_SIZE, blk_end);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: Address = 0x40_0000_0000;

    fn summary(regions: usize) -> SummaryData {
        SummaryData::new(BASE, BASE + regions * REGION_SIZE_BYTES).unwrap()
    }

    fn words(n: usize) -> usize {
        n << LOG_WORD_SIZE
    }

    #[test]
    fn conversions() {
        let sd = summary(4);
        assert_eq!(sd.addr_to_region_idx(BASE), 0);
        assert_eq!(sd.addr_to_region_idx(BASE + REGION_SIZE_BYTES), 1);
        assert_eq!(sd.region_to_addr(2), BASE + 2 * REGION_SIZE_BYTES);
        assert_eq!(sd.region_offset(BASE + words(5)), 5);
        assert_eq!(sd.addr_to_block_idx(BASE + words(BLOCK_SIZE)), 1);
        assert!(sd.is_region_aligned(BASE));
        assert!(!sd.is_region_aligned(BASE + WORD_SIZE));
    }

    #[test]
    fn add_obj_single_region() {
        let sd = summary(4);
        sd.add_obj(BASE + words(10), 20);
        assert_eq!(sd.region(0).live_obj_size(), 20);
        assert_eq!(sd.region(0).partial_obj_size(), 0);
        assert_eq!(sd.region(0).data_size(), 20);
    }

    #[test]
    fn add_obj_spanning_regions() {
        let sd = summary(4);
        // Starts 10 words before the end of region 0, spans all of region 1
        // and 7 words of region 2.
        let addr = BASE + words(REGION_SIZE - 10);
        let len = 10 + REGION_SIZE + 7;
        sd.add_obj(addr, len);
        assert_eq!(sd.region(0).live_obj_size(), 10);
        assert_eq!(sd.region(1).partial_obj_size(), REGION_SIZE);
        assert_eq!(sd.region(1).partial_obj_addr(), addr);
        assert_eq!(sd.region(2).partial_obj_size(), 7);
        assert_eq!(sd.region(2).partial_obj_addr(), addr);
        assert_eq!(sd.partial_obj_end(1), BASE + 2 * REGION_SIZE_BYTES + words(7));
    }

    #[test]
    fn summarize_into_self_fits() {
        let sd = summary(4);
        // Region 0 half full, region 1 a quarter full.
        sd.add_obj(BASE, REGION_SIZE / 2);
        sd.add_obj(BASE + REGION_SIZE_BYTES, REGION_SIZE / 4);
        let mut split = SplitInfo::default();
        let end = BASE + 2 * REGION_SIZE_BYTES;
        match sd.summarize(&mut split, BASE, end, BASE, BASE + 4 * REGION_SIZE_BYTES) {
            Summarize::Fit { target_next } => {
                assert_eq!(target_next, BASE + words(REGION_SIZE / 2 + REGION_SIZE / 4));
            }
            other => panic!("unexpected {:?}", other),
        }
        // Region 0 compacts into itself: no destinations besides itself.
        assert_eq!(sd.region(0).destination(), BASE);
        assert_eq!(sd.region(0).destination_count(), 0);
        // Region 1's data lands inside region 0.
        assert_eq!(sd.region(1).destination(), BASE + words(REGION_SIZE / 2));
        assert_eq!(sd.region(1).destination_count(), 1);
        // Region 0 supplies region 0's first word.
        assert_eq!(sd.region(0).source_region(), 0);
        assert!(!split.is_valid());
    }

    #[test]
    fn summarize_overflow_easy_split() {
        let sd = summary(8);
        // Source: regions 4 and 5, fully live. The object spanning the 4/5
        // boundary starts in a region with no partial object of its own, so
        // the split falls at that region's start and nothing is recorded.
        let src = BASE + 4 * REGION_SIZE_BYTES;
        sd.add_obj(src, REGION_SIZE + 16);
        sd.add_obj(src + words(REGION_SIZE + 16), REGION_SIZE - 16);
        let mut split = SplitInfo::default();
        let res = sd.summarize(
            &mut split,
            src,
            src + 2 * REGION_SIZE_BYTES,
            BASE,
            BASE + REGION_SIZE_BYTES,
        );
        match res {
            Summarize::Split {
                source_next,
                target_next,
            } => {
                assert!(!split.is_valid());
                assert_eq!(source_next, sd.region_to_addr(4));
                assert_eq!(target_next, BASE);
                // The destination region no longer expects data from the
                // source that moved past the split.
                assert_eq!(sd.region(0).source_region(), 0);
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn summarize_overflow_hard_split() {
        let sd = summary(8);
        // Source: regions 4..7, fully live, destination exactly two regions.
        // X spans the 4/5 boundary, Y starts in region 5 just past X's tail
        // and spans the 5/6 boundary; region 6 overflows the target, and the
        // overflow object Y starts in a region that carries X's tail, so the
        // split lands just past that tail and must be recorded.
        let src = BASE + 4 * REGION_SIZE_BYTES;
        sd.add_obj(src, REGION_SIZE + 10); // X
        sd.add_obj(src + words(REGION_SIZE + 10), REGION_SIZE); // Y
        sd.add_obj(src + words(2 * REGION_SIZE + 10), REGION_SIZE - 10); // Z
        let target_end = BASE + 2 * REGION_SIZE_BYTES;
        let mut split = SplitInfo::default();
        let res = sd.summarize(&mut split, src, src + 3 * REGION_SIZE_BYTES, BASE, target_end);
        match res {
            Summarize::Split {
                source_next,
                target_next,
            } => {
                assert!(split.is_valid());
                assert_eq!(split.src_region_idx(), 5);
                assert_eq!(split.partial_obj_size(), 10);
                assert_eq!(split.destination(), BASE + REGION_SIZE_BYTES);
                // X's tail is carried into the target; the source resumes
                // right after it.
                assert_eq!(source_next, sd.region_to_addr(5) + words(10));
                assert_eq!(target_next, BASE + REGION_SIZE_BYTES + words(10));
                // The split region's partial object now belongs to the split
                // record, not the region.
                assert_eq!(sd.region(5).partial_obj_size(), 0);
                // One destination region, boundary-aligned: its first word is
                // the first word of the carried partial object.
                assert_eq!(split.destination_count(), 1);
                assert_eq!(split.dest_region_addr(), BASE + REGION_SIZE_BYTES);
                assert_eq!(split.first_src_addr(), sd.region_to_addr(5));
            }
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn dense_prefix_regions_read_as_full() {
        let sd = summary(4);
        sd.add_obj(BASE, REGION_SIZE / 2);
        sd.summarize_dense_prefix(BASE, BASE + REGION_SIZE_BYTES);
        let r = sd.region(0);
        assert_eq!(r.destination(), BASE);
        assert_eq!(r.destination_count(), 0);
        assert_eq!(r.source_region(), 0);
        assert_eq!(r.data_size(), REGION_SIZE);
        assert!(r.available());
    }

    #[test]
    fn claim_and_complete_protocol() {
        let sd = summary(1);
        let r = sd.region(0);
        r.set_destination_count(1);
        assert!(!r.available());
        r.decrement_destination_count();
        assert!(r.available());
        assert!(r.claim());
        assert!(!r.claim());
        assert!(r.claimed());
        r.set_completed();
        assert!(r.completed());
    }

    #[test]
    fn shadow_state_machine() {
        let sd = summary(2);
        let r = sd.region(0);
        assert!(r.mark_shadow());
        assert!(!r.mark_normal());
        r.mark_filled();
        assert_eq!(r.shadow_state(), ShadowState::FilledShadow);
        assert!(r.mark_copied());
        assert!(!r.mark_copied());

        let n = sd.region(1);
        assert!(n.mark_normal());
        assert!(!n.mark_shadow());
    }

    #[test]
    fn clear_range_resets_records() {
        let sd = summary(4);
        sd.add_obj(BASE, 100);
        sd.region(0).set_destination(BASE);
        sd.region(0).set_destination_count(3);
        assert!(sd.region(0).claim());
        sd.clear_range(0, 2);
        assert!(sd.is_range_clear(0, 4));
    }
}
