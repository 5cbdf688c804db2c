use crate::bitmap::MarkBitmap;
use crate::globals::*;
use crate::header::{self, HeapObjectHeader};
use crate::parallel_compact::SpaceInfo;
use crate::space::SPACE_COUNT;
use crate::summary::{RegionData, ShadowState, SummaryData};
use crate::terminator::Terminator;
use crossbeam::deque::{Steal, Stealer, Worker};
use crossbeam::queue::SegQueue;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Everything a compaction worker needs to share: read-only once the gang
/// starts, except for the atomics inside the tables and the shadow pool.
pub(crate) struct CompactCtx<'a> {
    pub bitmap: &'a MarkBitmap,
    pub summary: &'a SummaryData,
    pub spaces: &'a [SpaceInfo; SPACE_COUNT],
    pub shadow_pool: &'a SegQueue<usize>,
    pub nworkers: usize,
}

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
enum FillStatus {
    /// The source range was consumed and the destination still has room.
    Complete,
    /// An object starts in the source range but does not end in it.
    Incomplete,
    /// The destination region is full.
    Full,
    /// The next object does not fit in the destination region.
    WouldOverflow,
}

enum FillTarget {
    InPlace,
    Shadow(usize),
}

/// Fills one destination region by copying live words from source regions,
/// updating interior pointers of each moved object as it lands. `destination`
/// tracks the planned address; with a shadow target the bytes actually go to
/// the shadow region at a fixed offset.
struct RegionFiller<'a, 'b> {
    ctx: &'a CompactCtx<'b>,
    source: Address,
    destination: Address,
    offset: isize,
    words_remaining: usize,
    target: FillTarget,
}

/// The words a filler will place in the destination region: a full region,
/// except for the last destination region of a space, which only receives
/// data up to the space's new top.
fn calculate_words_remaining(ctx: &CompactCtx, region_idx: usize) -> usize {
    let dest_addr = ctx.summary.region_to_addr(region_idx);
    let new_top = ctx.spaces[space_id_of(ctx, dest_addr)].new_top();
    debug_assert!(new_top >= dest_addr);
    ((new_top - dest_addr) >> LOG_WORD_SIZE).min(REGION_SIZE)
}

impl<'a, 'b> RegionFiller<'a, 'b> {
    fn new_in_place(ctx: &'a CompactCtx<'b>, region_idx: usize) -> Self {
        Self {
            ctx,
            source: 0,
            destination: ctx.summary.region_to_addr(region_idx),
            offset: 0,
            words_remaining: calculate_words_remaining(ctx, region_idx),
            target: FillTarget::InPlace,
        }
    }

    fn new_shadow(ctx: &'a CompactCtx<'b>, region_idx: usize, shadow_idx: usize) -> Self {
        let dest = ctx.summary.region_to_addr(region_idx);
        let shadow = ctx.summary.region_to_addr(shadow_idx);
        Self {
            ctx,
            source: 0,
            destination: dest,
            offset: shadow as isize - dest as isize,
            words_remaining: calculate_words_remaining(ctx, region_idx),
            target: FillTarget::Shadow(shadow_idx),
        }
    }

    #[inline]
    fn source(&self) -> Address {
        self.source
    }

    #[inline]
    fn set_source(&mut self, addr: Address) {
        self.source = addr;
    }

    #[inline]
    fn destination(&self) -> Address {
        self.destination
    }

    /// Where the bytes are actually written.
    #[inline]
    fn copy_destination(&self) -> Address {
        (self.destination as isize + self.offset) as Address
    }

    #[inline]
    fn words_remaining(&self) -> usize {
        self.words_remaining
    }

    #[inline]
    fn is_full(&self) -> bool {
        self.words_remaining == 0
    }

    fn update_state(&mut self, words: usize) {
        debug_assert!(words <= self.words_remaining);
        self.source += words << LOG_WORD_SIZE;
        self.destination += words << LOG_WORD_SIZE;
        self.words_remaining -= words;
    }

    fn copy_words(&self, words: usize) {
        unsafe {
            // Same-space slides overlap; the destination is always below the
            // source, so an overlap-safe copy suffices.
            core::ptr::copy(
                self.source as *const usize,
                self.copy_destination() as *mut usize,
                words,
            );
        }
    }

    /// Copy whatever fits and declare the region full.
    fn copy_until_full(&mut self) -> FillStatus {
        if self.source != self.copy_destination() {
            self.copy_words(self.words_remaining);
        }
        let words = self.words_remaining;
        self.update_state(words);
        debug_assert!(self.is_full());
        FillStatus::Full
    }

    /// Copy the tail of an object whose head lies before the current source,
    /// or as much of it as fits.
    fn copy_partial_obj(&mut self) {
        let bitmap = self.ctx.bitmap;
        let mut words = self.words_remaining;

        let range_end = (self.source + (words << LOG_WORD_SIZE)).min(bitmap.heap_end());
        let end_addr = bitmap.find_obj_end(self.source, range_end);
        if end_addr < range_end {
            words = ((end_addr - self.source) >> LOG_WORD_SIZE) + 1;
        }

        // Without this test the pointer updates to a partial object crossing
        // the dense prefix boundary could be overwritten.
        if self.source != self.copy_destination() {
            self.copy_words(words);
        }
        self.update_state(words);
    }

    /// Move one whole object and update its interior pointers.
    fn do_addr(&mut self, addr: Address, words: usize) -> FillStatus {
        debug_assert_eq!(self.ctx.bitmap.obj_size(addr), words);

        self.source = addr;
        debug_assert_eq!(
            self.ctx.summary.calc_new_pointer(self.ctx.bitmap, addr),
            self.destination
        );

        if words > self.words_remaining {
            return FillStatus::WouldOverflow;
        }

        if self.copy_destination() != self.source {
            self.copy_words(words);
        }

        update_contents(self.ctx, self.copy_destination());
        self.update_state(words);

        if self.is_full() {
            FillStatus::Full
        } else {
            FillStatus::Incomplete
        }
    }

    fn complete_region(&self, region_idx: usize, region_ptr: &RegionData) {
        match self.target {
            FillTarget::InPlace => {
                debug_assert_eq!(region_ptr.shadow_state(), ShadowState::Normal);
                region_ptr.set_completed();
            }
            FillTarget::Shadow(shadow_idx) => {
                debug_assert_eq!(region_ptr.shadow_state(), ShadowState::Shadow);
                region_ptr.set_shadow_region(shadow_idx);
                // Publish the filled shadow, then copy it back if the heap
                // region is already claimable; otherwise the thread that
                // drops the destination count to zero copies it back (see
                // decrement_destination_counts).
                region_ptr.mark_filled();
                if ((region_ptr.available() && region_ptr.claim()) || region_ptr.claimed())
                    && region_ptr.mark_copied()
                {
                    region_ptr.set_completed();
                    copy_back(self.ctx.summary, shadow_idx, region_idx);
                    self.ctx.shadow_pool.push(shadow_idx);
                }
            }
        }
    }
}

/// Update the reference slots of the object at `addr` to their referents'
/// new locations.
pub(crate) fn update_contents(ctx: &CompactCtx, addr: Address) {
    let h = HeapObjectHeader::from_address(addr);
    for i in 0..h.ref_len() {
        let target = h.ref_slot(i);
        if target != 0 {
            h.set_ref_slot(i, ctx.summary.calc_new_pointer(ctx.bitmap, target));
        }
    }
}

/// Index of the space containing `addr`.
pub(crate) fn space_id_of(ctx: &CompactCtx, addr: Address) -> usize {
    for id in 0..SPACE_COUNT {
        if ctx.spaces[id].contains(addr) {
            return id;
        }
    }
    unreachable!("no space contains {:#x}", addr);
}

/// Skip over `count` live words starting from `beg` and return the address of
/// the next live word. Unless marked, the word at `beg` is assumed dead;
/// callers must ensure `beg` is not in the middle of an object and that
/// `[beg, end)` holds enough live words.
pub(crate) fn skip_live_words(
    bitmap: &MarkBitmap,
    beg: Address,
    end: Address,
    count: usize,
) -> Address {
    debug_assert!(count > 0);

    let mut words_to_skip = count;
    let mut cur_beg = beg;
    loop {
        cur_beg = bitmap.find_obj_beg(cur_beg, end);
        let cur_end = bitmap.find_obj_end(cur_beg, end);
        let obj_words = ((cur_end - cur_beg) >> LOG_WORD_SIZE) + 1;
        if obj_words > words_to_skip {
            return cur_beg + (words_to_skip << LOG_WORD_SIZE);
        }
        words_to_skip -= obj_words;
        cur_beg = cur_end + WORD_SIZE;
        if words_to_skip == 0 {
            break;
        }
    }

    // Skipping the desired number of words landed just past the end of an
    // object; find the start of the next one.
    cur_beg = bitmap.find_obj_beg(cur_beg, end);
    debug_assert!(cur_beg < end, "not enough live words to skip");
    cur_beg
}

/// The first source word to copy to the destination region starting at
/// `dest_addr` (which is region aligned).
pub(crate) fn first_src_addr(
    ctx: &CompactCtx,
    dest_addr: Address,
    src_space_id: usize,
    src_region_idx: usize,
) -> Address {
    let sd = ctx.summary;
    let bitmap = ctx.bitmap;
    debug_assert!(sd.is_region_aligned(dest_addr));

    let split_info = ctx.spaces[src_space_id].split_info();
    if split_info.dest_region_addr() == dest_addr {
        // The partial object ending at the split point contains the first
        // word to be copied to dest_addr.
        return split_info.first_src_addr();
    }

    let src_region_ptr = sd.region(src_region_idx);
    let partial_obj_size = src_region_ptr.partial_obj_size();
    let src_region_destination = src_region_ptr.destination();

    debug_assert!(dest_addr >= src_region_destination);
    debug_assert!(src_region_ptr.data_size() > 0);

    let src_region_beg = sd.region_to_addr(src_region_idx);
    let src_region_end = src_region_beg + REGION_SIZE_BYTES;

    let mut addr = src_region_beg;
    if dest_addr == src_region_destination {
        // Return the first live word in the source region.
        if partial_obj_size == 0 {
            addr = bitmap.find_obj_beg(addr, src_region_end);
            debug_assert!(addr < src_region_end, "no objects start in src region");
        }
        return addr;
    }

    // Must skip some live data.
    let mut words_to_skip = (dest_addr - src_region_destination) >> LOG_WORD_SIZE;
    debug_assert!(src_region_ptr.data_size() > words_to_skip);

    if partial_obj_size >= words_to_skip {
        // All the live words to skip are part of the partial object.
        addr += words_to_skip << LOG_WORD_SIZE;
        if partial_obj_size == words_to_skip {
            // Find the first live word past the partial object.
            addr = bitmap.find_obj_beg(addr, src_region_end);
            debug_assert!(addr < src_region_end);
        }
        return addr;
    }

    // Skip over the partial object (if any).
    if partial_obj_size != 0 {
        words_to_skip -= partial_obj_size;
        addr += partial_obj_size << LOG_WORD_SIZE;
    }

    // Skip over live words due to objects that start in the region.
    let addr = skip_live_words(bitmap, addr, src_region_end, words_to_skip);
    debug_assert!(addr < src_region_end);
    addr
}

fn copy_back(sd: &SummaryData, shadow_idx: usize, region_idx: usize) {
    unsafe {
        core::ptr::copy_nonoverlapping(
            sd.region_to_addr(shadow_idx) as *const usize,
            sd.region_to_addr(region_idx) as *mut usize,
            REGION_SIZE,
        );
    }
}

/// The source regions `[beg_region, region containing end_addr)` have been
/// drained into the current destination; drop their destination counts and
/// pick up any region that becomes fillable.
pub(crate) fn decrement_destination_counts(
    ctx: &CompactCtx,
    worker: &Worker<usize>,
    src_space_id: usize,
    beg_region: usize,
    end_addr: Address,
) {
    let sd = ctx.summary;

    debug_assert!({
        let src_space = &ctx.spaces[src_space_id];
        let beg_addr = sd.region_to_addr(beg_region);
        (src_space.contains(beg_addr) || beg_addr == src_space.end())
            && (src_space.contains(end_addr) || end_addr == src_space.end())
    });

    let end_region = sd.addr_to_region_idx(sd.region_align_up(end_addr));

    // Regions up to new_top() are enqueued if they become available.
    let new_top = ctx.spaces[src_space_id].new_top();
    let enqueue_end = sd.addr_to_region_idx(sd.region_align_up(new_top));

    for cur in beg_region..end_region {
        let region_ptr = sd.region(cur);
        debug_assert!(region_ptr.data_size() > 0, "region must have live data");
        region_ptr.decrement_destination_count();
        if cur < enqueue_end && region_ptr.available() && region_ptr.claim() {
            if region_ptr.mark_normal() {
                worker.push(cur);
            } else if region_ptr.mark_copied() {
                // The shadow copy for this region is complete; copy it back
                // and recycle the shadow region.
                copy_back(sd, region_ptr.shadow_region(), cur);
                ctx.shadow_pool.push(region_ptr.shadow_region());
                region_ptr.set_completed();
            }
        }
    }
}

/// Advance to the next non-empty source region past `end_addr`, switching
/// source spaces when the current one is exhausted.
fn next_src_region(
    ctx: &CompactCtx,
    filler: &mut RegionFiller,
    src_space_id: &mut usize,
    src_space_top: &mut Address,
    end_addr: Address,
) -> usize {
    let sd = ctx.summary;

    // Skip empty regions (if any) up to the top of the space.
    let mut src_region_idx = sd.addr_to_region_idx(sd.region_align_up(end_addr));
    let top_region = sd.addr_to_region_idx(sd.region_align_up(*src_space_top));
    while src_region_idx < top_region && sd.region(src_region_idx).data_size() == 0 {
        src_region_idx += 1;
    }

    if src_region_idx < top_region {
        // The next source region is in the current space.
        let src_region_addr = sd.region_to_addr(src_region_idx);
        if src_region_addr > filler.source() {
            filler.set_source(src_region_addr);
        }
        return src_region_idx;
    }

    // Switch to a new source space and find the first non-empty region.
    let destination = filler.destination();
    for space_id in *src_space_id + 1..SPACE_COUNT {
        let space = &ctx.spaces[space_id];
        let bottom = space.bottom();
        let bottom_cp = sd.region_containing(bottom);

        // Only spaces that do not compact into themselves can supply data.
        if bottom_cp.destination() != bottom {
            let bottom_region = sd.addr_to_region_idx(bottom);
            let top_region = sd.addr_to_region_idx(sd.region_align_up(space.top()));

            for src_cp in bottom_region..top_region {
                if sd.region(src_cp).live_obj_size() > 0 {
                    debug_assert_eq!(
                        sd.region(src_cp).destination(),
                        destination,
                        "first live obj in the space must match the destination"
                    );
                    debug_assert_eq!(
                        sd.region(src_cp).partial_obj_size(),
                        0,
                        "a space cannot begin with a partial obj"
                    );

                    *src_space_id = space_id;
                    *src_space_top = space.top();
                    filler.set_source(sd.region_to_addr(src_cp));
                    return src_cp;
                } else {
                    debug_assert_eq!(sd.region(src_cp).data_size(), 0);
                }
            }
        }
    }

    unreachable!("no source region was found");
}

/// Walk the marked objects in `[beg, end)`, moving each through the filler.
/// Returns `Incomplete` with the filler's source set when an object starts in
/// the range but does not end in it.
fn iterate_live(filler: &mut RegionFiller, beg: Address, end: Address) -> FillStatus {
    let bitmap = filler.ctx.bitmap;
    let mut addr = bitmap.find_obj_beg(beg, end);
    while addr < end {
        let obj_end = bitmap.find_obj_end(addr, end);
        if obj_end >= end {
            filler.set_source(addr);
            return FillStatus::Incomplete;
        }
        let words = ((obj_end - addr) >> LOG_WORD_SIZE) + 1;
        match filler.do_addr(addr, words) {
            FillStatus::Incomplete => addr = bitmap.find_obj_beg(obj_end + WORD_SIZE, end),
            status => return status,
        }
    }
    FillStatus::Complete
}

fn fill_region(
    ctx: &CompactCtx,
    worker: &Worker<usize>,
    filler: &mut RegionFiller,
    region_idx: usize,
) {
    let sd = ctx.summary;
    let bitmap = ctx.bitmap;
    let region_ptr = sd.region(region_idx);

    // Get the source region and related info.
    let mut src_region_idx = region_ptr.source_region();
    let mut src_space_id = space_id_of(ctx, sd.region_to_addr(src_region_idx));
    let mut src_space_top = ctx.spaces[src_space_id].top();
    let dest_addr = sd.region_to_addr(region_idx);

    filler.set_source(first_src_addr(ctx, dest_addr, src_space_id, src_region_idx));

    // The destination count is not decremented when a region is copied to
    // itself.
    if src_region_idx == region_idx {
        src_region_idx += 1;
    }

    if !bitmap.is_marked(filler.source()) {
        // The first source word is in the middle of an object; copy the
        // remainder of the object or as much as will fit. The pointer updates
        // were deferred and are noted when the object head is processed.
        let old_src_addr = filler.source();
        filler.copy_partial_obj();
        if filler.is_full() {
            decrement_destination_counts(ctx, worker, src_space_id, src_region_idx, filler.source());
            region_ptr.set_deferred_obj_addr(0);
            filler.complete_region(region_idx, region_ptr);
            return;
        }

        let end_addr = sd.region_align_down(filler.source());
        if sd.region_align_down(old_src_addr) != end_addr {
            // The partial object was copied from more than one source region.
            decrement_destination_counts(ctx, worker, src_space_id, src_region_idx, end_addr);
            src_region_idx =
                next_src_region(ctx, filler, &mut src_space_id, &mut src_space_top, end_addr);
        }
    }

    loop {
        let cur_addr = filler.source();
        let end_addr = sd.region_align_up(cur_addr + WORD_SIZE).min(src_space_top);
        let mut status = iterate_live(filler, cur_addr, end_addr);

        if status == FillStatus::Incomplete {
            // The last object that starts in the source region does not end
            // in it.
            debug_assert!(filler.source() < end_addr);
            let obj_beg = filler.source();
            let range_end =
                (obj_beg + (filler.words_remaining() << LOG_WORD_SIZE)).min(src_space_top);
            let obj_end = bitmap.find_obj_end(obj_beg, range_end);
            if obj_end < range_end {
                // The end was found; the entire object will fit.
                let words = ((obj_end - obj_beg) >> LOG_WORD_SIZE) + 1;
                status = filler.do_addr(obj_beg, words);
                debug_assert_ne!(status, FillStatus::WouldOverflow);
            } else {
                // The end was not found; the object will not fit.
                debug_assert!(range_end < src_space_top, "obj cannot cross space boundary");
                status = FillStatus::WouldOverflow;
            }
        }

        if status == FillStatus::WouldOverflow {
            // The last object did not fit. Note that interior pointer updates
            // were deferred, then copy enough of the object to fill the
            // region.
            region_ptr.set_deferred_obj_addr(filler.destination());
            let status = filler.copy_until_full();
            debug_assert_eq!(status, FillStatus::Full);

            decrement_destination_counts(ctx, worker, src_space_id, src_region_idx, filler.source());
            filler.complete_region(region_idx, region_ptr);
            return;
        }

        if status == FillStatus::Full {
            decrement_destination_counts(ctx, worker, src_space_id, src_region_idx, filler.source());
            region_ptr.set_deferred_obj_addr(0);
            filler.complete_region(region_idx, region_ptr);
            return;
        }

        decrement_destination_counts(ctx, worker, src_space_id, src_region_idx, end_addr);
        src_region_idx =
            next_src_region(ctx, filler, &mut src_space_id, &mut src_space_top, end_addr);
    }
}

pub(crate) fn fill_and_update_region(ctx: &CompactCtx, worker: &Worker<usize>, region_idx: usize) {
    let mut filler = RegionFiller::new_in_place(ctx, region_idx);
    fill_region(ctx, worker, &mut filler, region_idx);
}

/// Acquire a scratch region from the pool, or give up if the heap region
/// becomes claimable while waiting (the claimer was a
/// `decrement_destination_counts` call, so the region can be filled in
/// place).
fn pop_shadow_region_mt_safe(ctx: &CompactCtx, region_ptr: &RegionData) -> Option<usize> {
    loop {
        if let Some(shadow) = ctx.shadow_pool.pop() {
            return Some(shadow);
        }
        if region_ptr.claimed() {
            return None;
        }
        std::thread::yield_now();
    }
}

pub(crate) fn fill_and_update_shadow_region(
    ctx: &CompactCtx,
    worker: &Worker<usize>,
    region_idx: usize,
) {
    let region_ptr = ctx.summary.region(region_idx);
    match pop_shadow_region_mt_safe(ctx, region_ptr) {
        None => {
            // The heap region became available; fill it in place.
            region_ptr.shadow_to_normal();
            fill_and_update_region(ctx, worker, region_idx);
        }
        Some(shadow_region) => {
            let mut filler = RegionFiller::new_shadow(ctx, region_idx, shadow_region);
            fill_region(ctx, worker, &mut filler, region_idx);
        }
    }
}

/// Seed the shadow region pool with every empty region: all of the to-space
/// plus everything between top and end of the other spaces.
pub(crate) fn initialize_shadow_regions(ctx: &CompactCtx) {
    let sd = ctx.summary;
    for space in ctx.spaces.iter() {
        let beg_region =
            sd.addr_to_region_idx(sd.region_align_up(space.new_top().max(space.top())));
        let end_region = sd.addr_to_region_idx(sd.region_align_down(space.end()));
        for cur in beg_region..end_region {
            ctx.shadow_pool.push(cur);
        }
    }
}

/// Find all regions that can be filled immediately and distribute them to the
/// worker deques in round-robin fashion. The iteration is in reverse order so
/// regions are removed in ascending order.
pub(crate) fn prepare_region_draining_tasks(ctx: &CompactCtx, workers: &[Worker<usize>]) {
    let sd = ctx.summary;
    let mut worker_id = 0;

    for id in (0..SPACE_COUNT).rev() {
        let space_info = &ctx.spaces[id];
        let beg_region = sd.addr_to_region_idx(space_info.dense_prefix());
        let end_region = sd.addr_to_region_idx(sd.region_align_up(space_info.new_top()));

        for cur in (beg_region..end_region).rev() {
            if sd.region(cur).try_claim() {
                let marked = sd.region(cur).mark_normal();
                debug_assert!(marked);
                workers[worker_id].push(cur);
                log::trace!("fillable region {} seeded to worker {}", cur, worker_id);
                worker_id = (worker_id + 1) % workers.len();
            }
        }
    }
}

/// Chunks of dense-prefix regions whose interior pointers need updating,
/// claimed by the gang through a shared counter.
pub(crate) struct DensePrefixTasks {
    tasks: Vec<(usize, usize, usize)>,
    counter: AtomicUsize,
}

const DENSE_PREFIX_OVER_PARTITIONING: usize = 4;

impl DensePrefixTasks {
    pub(crate) fn try_claim(&self) -> Option<(usize, usize, usize)> {
        let claimed = self.counter.fetch_add(1, Ordering::Relaxed);
        self.tasks.get(claimed).copied()
    }
}

/// Partition the dense prefix of each space into roughly `4 * workers` chunks
/// so that gap-opening work elsewhere overlaps with prefix updates.
pub(crate) fn enqueue_dense_prefix_tasks(ctx: &CompactCtx) -> DensePrefixTasks {
    let sd = ctx.summary;
    let mut tasks = Vec::new();

    for space_id in 0..SPACE_COUNT {
        let space_info = &ctx.spaces[space_id];
        let dense_prefix_end = space_info.dense_prefix();
        if dense_prefix_end == space_info.bottom() {
            // There is no dense prefix for this space.
            continue;
        }

        let region_index_end_dense_prefix = sd.addr_to_region_idx(dense_prefix_end);
        debug_assert!(
            dense_prefix_end == space_info.end()
                || sd.region(region_index_end_dense_prefix).available()
                || sd.region(region_index_end_dense_prefix).claimed(),
            "the region after the dense prefix should always be ready to fill"
        );

        let mut region_index_start = sd.addr_to_region_idx(space_info.bottom());
        let total = region_index_end_dense_prefix - region_index_start;
        if total == 0 {
            continue;
        }

        let tasks_for_dense_prefix =
            if total <= ctx.nworkers * DENSE_PREFIX_OVER_PARTITIONING {
                ctx.nworkers
            } else {
                ctx.nworkers * DENSE_PREFIX_OVER_PARTITIONING
            };
        let regions_per_thread = (total / tasks_for_dense_prefix).max(1);

        for _ in 0..tasks_for_dense_prefix {
            if region_index_start >= region_index_end_dense_prefix {
                break;
            }
            let region_index_end =
                (region_index_start + regions_per_thread).min(region_index_end_dense_prefix);
            tasks.push((space_id, region_index_start, region_index_end));
            region_index_start = region_index_end;
        }
        // Any part of the dense prefix that did not fit evenly.
        if region_index_start < region_index_end_dense_prefix {
            tasks.push((space_id, region_index_start, region_index_end_dense_prefix));
        }
    }

    DensePrefixTasks {
        tasks,
        counter: AtomicUsize::new(0),
    }
}

/// True if dead space continues from the previous region over the boundary at
/// `addr` (the start of `region_idx`).
pub(crate) fn dead_space_crosses_boundary(
    ctx: &CompactCtx,
    region_idx: usize,
    addr: Address,
) -> bool {
    let region_ptr = ctx.summary.region(region_idx);
    region_ptr.partial_obj_size() == 0
        && !ctx.bitmap.is_marked(addr)
        && !ctx.bitmap.is_obj_end(addr - WORD_SIZE)
}

/// Update interior pointers in the dense-prefix regions `[beg_region,
/// end_region)` (nothing there moves) and overwrite dead gaps with filler
/// objects so the prefix stays walkable.
pub(crate) fn update_and_deadwood_in_dense_prefix(
    ctx: &CompactCtx,
    space_id: usize,
    beg_region: usize,
    end_region: usize,
) {
    let sd = ctx.summary;
    let bitmap = ctx.bitmap;
    let space_info = &ctx.spaces[space_id];

    let mut beg_addr = sd.region_to_addr(beg_region);
    let end_addr = sd.region_to_addr(end_region);
    debug_assert!(beg_region <= end_region);
    debug_assert!(end_addr <= space_info.dense_prefix());

    for claim_region in beg_region..end_region {
        let claimed = sd.region(claim_region).claim();
        debug_assert!(claimed);
    }

    if beg_addr != space_info.bottom() {
        // Find the first live object or block of dead space that starts in
        // this range of regions. A partial object crossing onto the region is
        // skipped (its head's chunk handles the deferred update); dead space
        // crossing onto the region is skipped too (the prior chunk fills it).
        let cp = sd.region(beg_region);
        if cp.partial_obj_size() != 0 {
            beg_addr = sd.partial_obj_end(beg_region);
        } else if dead_space_crosses_boundary(ctx, beg_region, beg_addr) {
            beg_addr = bitmap.find_obj_beg(beg_addr, end_addr);
        }
    }

    if beg_addr < end_addr {
        let dense_prefix_end = space_info.dense_prefix();
        let mut addr = beg_addr;
        while addr < end_addr {
            let obj = bitmap.find_obj_beg(addr, end_addr);
            if obj > addr {
                // Dead space starting in this chunk runs to the next live
                // object, even past end_addr (but never past the prefix end).
                let gap_end = if obj < end_addr {
                    obj
                } else {
                    bitmap.find_obj_beg(addr, dense_prefix_end)
                };
                header::fill_with_dead_object(addr, (gap_end - addr) >> LOG_WORD_SIZE);
            }
            if obj >= end_addr {
                break;
            }
            update_contents(ctx, obj);
            addr = obj + (bitmap.obj_size(obj) << LOG_WORD_SIZE);
        }
    }

    // Mark the regions as filled.
    for cur in beg_region..end_region {
        sd.region(cur).set_completed();
    }
}

/// Walk candidate regions of the old space looking for an unavailable one to
/// fill through a shadow region; workers stride by gang size so they do not
/// contend.
pub(crate) fn steal_unavailable_region(
    ctx: &CompactCtx,
    next_shadow_region: &mut usize,
) -> Option<usize> {
    let sd = ctx.summary;
    let old_new_top = sd.addr_to_region_idx(ctx.spaces[0].new_top());

    while *next_shadow_region < old_new_top {
        if sd.region(*next_shadow_region).mark_shadow() {
            return Some(*next_shadow_region);
        }
        *next_shadow_region += ctx.nworkers;
    }

    None
}

/// One compaction worker: drains its seeded deque, then alternates between
/// stealing fillable regions from peers and stealing unavailable regions to
/// fill through shadow regions, until the gang terminates.
pub(crate) struct Compactor<'a> {
    pub task_id: usize,
    pub worker: Worker<usize>,
    pub stealers: &'a [Stealer<usize>],
    pub terminator: &'a Terminator,
    pub ctx: &'a CompactCtx<'a>,
    pub next_shadow_region: usize,
}

impl<'a> Compactor<'a> {
    fn steal(&self) -> Option<usize> {
        if self.stealers.len() == 1 {
            return None;
        }

        for i in 1..self.stealers.len() {
            let stealer = &self.stealers[(self.task_id + i) % self.stealers.len()];
            loop {
                match stealer.steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(region) => return Some(region),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn drain_region_stack(&self) {
        while let Some(region_idx) = self.worker.pop() {
            fill_and_update_region(self.ctx, &self.worker, region_idx);
        }
    }

    pub(crate) fn run(&mut self, dense_tasks: &DensePrefixTasks) {
        while let Some((space_id, beg, end)) = dense_tasks.try_claim() {
            update_and_deadwood_in_dense_prefix(self.ctx, space_id, beg, end);
        }

        // Drain the deque preloaded with regions that are ready to fill.
        self.drain_region_stack();

        loop {
            if let Some(region_idx) = self.steal() {
                fill_and_update_region(self.ctx, &self.worker, region_idx);
                self.drain_region_stack();
            } else if let Some(region_idx) =
                steal_unavailable_region(self.ctx, &mut self.next_shadow_region)
            {
                // Fill an unavailable region with the help of a shadow region.
                fill_and_update_shadow_region(self.ctx, &self.worker, region_idx);
                self.drain_region_stack();
            } else if self.terminator.try_terminate() {
                break;
            }
        }
    }
}

/// Single-threaded sweep after the gang: update interior pointers of objects
/// whose copy was cut by a region boundary.
pub(crate) fn update_deferred_objects(ctx: &CompactCtx, space_id: usize) {
    let sd = ctx.summary;
    let space_info = &ctx.spaces[space_id];
    debug_assert!(space_info.dense_prefix() >= space_info.bottom());

    let beg_region = sd.addr_to_region_idx(space_info.dense_prefix());
    let end_region = sd.addr_to_region_idx(sd.region_align_up(space_info.new_top()));
    for cur_region in beg_region..end_region {
        let addr = sd.region(cur_region).deferred_obj_addr();
        if addr != 0 {
            update_contents(ctx, addr);
        }
    }
}

/// Debug check: every region below new_top is filled, every region between
/// new_top and top has been emptied.
pub(crate) fn verify_complete(ctx: &CompactCtx, space_id: usize) {
    let sd = ctx.summary;
    let si = &ctx.spaces[space_id];
    let beg_region = sd.addr_to_region_idx(si.bottom());
    let new_top_region = sd.addr_to_region_idx(sd.region_align_up(si.new_top()));
    let old_top_region = sd.addr_to_region_idx(sd.region_align_up(si.top()));

    for cur_region in beg_region..new_top_region {
        let c = sd.region(cur_region);
        if !c.completed() {
            log::warn!(
                "region {} not filled: destination_count={}",
                cur_region,
                c.destination_count()
            );
        }
        debug_assert!(c.completed());
    }

    for cur_region in new_top_region..old_top_region {
        let c = sd.region(cur_region);
        if !c.available() {
            log::warn!(
                "region {} not empty: destination_count={}",
                cur_region,
                c.destination_count()
            );
        }
        debug_assert!(c.available());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn bitmap_for(words: usize) -> MarkBitmap {
        let start = 0x20_0000_0000usize;
        MarkBitmap::new(start, start + words * WORD_SIZE).unwrap()
    }

    #[test]
    fn skip_live_words_within_and_past_objects() {
        let bm = bitmap_for(256);
        let base = bm.heap_start();
        bm.par_mark(base + 4 * WORD_SIZE, 4); // words 4..8
        bm.par_mark(base + 16 * WORD_SIZE, 2); // words 16..18

        // Lands inside the first object.
        assert_eq!(
            skip_live_words(&bm, base, bm.heap_end(), 2),
            base + 6 * WORD_SIZE
        );
        // Consumes the first object exactly; next live word starts the
        // second object.
        assert_eq!(
            skip_live_words(&bm, base, bm.heap_end(), 4),
            base + 16 * WORD_SIZE
        );
        // Spans into the second object.
        assert_eq!(
            skip_live_words(&bm, base, bm.heap_end(), 5),
            base + 17 * WORD_SIZE
        );
    }

    #[test]
    fn dense_prefix_task_claiming() {
        let tasks = DensePrefixTasks {
            tasks: vec![(0, 0, 2), (0, 2, 4), (1, 0, 1)],
            counter: AtomicUsize::new(0),
        };
        let mut seen = Vec::new();
        while let Some(t) = tasks.try_claim() {
            seen.push(t);
        }
        assert_eq!(seen, vec![(0, 0, 2), (0, 2, 4), (1, 0, 1)]);
        assert!(tasks.try_claim().is_none());
    }
}
