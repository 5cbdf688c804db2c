use crate::bitmap::MarkBitmap;
use crate::compact::{self, CompactCtx, Compactor};
use crate::globals::*;
use crate::header;
use crate::heap::ParallelHeap;
use crate::marking;
use crate::space::{SpaceId, SPACE_COUNT};
use crate::summary::{SplitInfo, Summarize, SummaryData};
use crate::terminator::Terminator;
use crate::InitError;
use crossbeam::deque::Worker;
use crossbeam::queue::SegQueue;
use scoped_threadpool::Pool;
use std::sync::atomic::Ordering;

/// Collector tuning. The dead-wood parameters are percentages feeding the
/// normal-distribution limiter that decides how much dead space may be left
/// uncompacted in the dense prefix.
#[derive(Clone, Copy, Debug)]
pub struct Config {
    /// Gang size for the marking and compaction phases.
    pub workers: usize,
    /// Mean of the dead-wood limiter distribution, in percent of capacity.
    pub dead_wood_mean_percent: usize,
    /// Standard deviation of the limiter distribution, in percent.
    pub dead_wood_std_dev_percent: usize,
    /// Dead wood allowed when the space is completely full, in percent.
    pub min_dead_percent: usize,
    /// Full collections between forced maximum compactions.
    pub max_compaction_interval: usize,
    /// The n-th full collection always compacts maximally, so short-lived
    /// startup garbage is squeezed out early.
    pub first_max_compaction_count: usize,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 4,
            dead_wood_mean_percent: 50,
            dead_wood_std_dev_percent: 80,
            min_dead_percent: 5,
            max_compaction_interval: 20,
            first_max_compaction_count: 4,
        }
    }
}

/// Per-cycle snapshot of one space plus the results of the summary phase for
/// it. Geometry is re-read from the heap at the start of every cycle, so
/// survivor flips between cycles are harmless.
#[derive(Clone, Copy, Default)]
pub(crate) struct SpaceInfo {
    bottom: Address,
    top: Address,
    end: Address,
    /// Top after the current collection; bounds the compacted data.
    new_top: Address,
    /// Everything below this is left in place (dead wood included).
    dense_prefix: Address,
    split_info: SplitInfo,
}

impl SpaceInfo {
    #[inline]
    pub(crate) fn bottom(&self) -> Address {
        self.bottom
    }

    #[inline]
    pub(crate) fn top(&self) -> Address {
        self.top
    }

    #[inline]
    pub(crate) fn end(&self) -> Address {
        self.end
    }

    #[inline]
    pub(crate) fn new_top(&self) -> Address {
        self.new_top
    }

    #[inline]
    pub(crate) fn dense_prefix(&self) -> Address {
        self.dense_prefix
    }

    #[inline]
    pub(crate) fn split_info(&self) -> SplitInfo {
        self.split_info
    }

    #[inline]
    pub(crate) fn contains(&self, addr: Address) -> bool {
        addr >= self.bottom && addr < self.end
    }
}

/// The mark-compact collector: marking, summary, root adjustment and the
/// parallel region-filling compaction, with all side tables owned here.
pub struct ParallelCompact {
    config: Config,
    bitmap: MarkBitmap,
    summary: SummaryData,
    spaces: [SpaceInfo; SPACE_COUNT],
    pool: Pool,
    total_invocations: usize,
    maximum_compaction_gc_num: usize,
    dwl_mean: f64,
    dwl_std_dev: f64,
    dwl_first_term: f64,
    dwl_adjustment: f64,
}

impl ParallelCompact {
    pub fn new(heap: &ParallelHeap, config: Config) -> Result<Self, InitError> {
        assert!(config.workers >= 1);
        let bitmap = MarkBitmap::new(heap.bottom(), heap.end())?;
        let summary = SummaryData::new(heap.bottom(), heap.end())?;

        let dwl_mean = config.dead_wood_mean_percent.min(100) as f64 / 100.0;
        let dwl_std_dev = config.dead_wood_std_dev_percent.min(100) as f64 / 100.0;
        let dwl_first_term = 1.0 / ((2.0 * std::f64::consts::PI).sqrt() * dwl_std_dev);

        let mut collector = Self {
            config,
            bitmap,
            summary,
            spaces: [SpaceInfo::default(); SPACE_COUNT],
            pool: Pool::new(config.workers as u32),
            total_invocations: 0,
            maximum_compaction_gc_num: 0,
            dwl_mean,
            dwl_std_dev,
            dwl_first_term,
            dwl_adjustment: 0.0,
        };
        collector.dwl_adjustment = collector.normal_distribution(1.0);
        Ok(collector)
    }

    pub fn total_invocations(&self) -> usize {
        self.total_invocations
    }

    /// Run one full collection.
    pub fn invoke(&mut self, heap: &ParallelHeap, maximum_heap_compaction: bool) {
        self.pre_compact(heap);
        log::info!(
            "full gc {} begin (maximum={})",
            self.total_invocations,
            maximum_heap_compaction
        );

        self.marking_phase(heap);
        self.summary_phase(maximum_heap_compaction);
        self.adjust_roots(heap);
        self.compaction_phase();
        self.post_compact(heap);

        log::info!("full gc {} end", self.total_invocations);
    }

    fn normal_distribution(&self, density: f64) -> f64 {
        debug_assert!((0.0..=1.0).contains(&density));
        let d = density - self.dwl_mean;
        self.dwl_first_term * (-(d * d) / (2.0 * self.dwl_std_dev * self.dwl_std_dev)).exp()
    }

    /// Fraction of the space that may be left as dead wood, as a function of
    /// its live density. Adjusted so the result is `min_percent` when the
    /// density is 1.
    fn dead_wood_limiter(&self, density: f64, min_percent: usize) -> f64 {
        let raw_limit = self.normal_distribution(density);
        let min = min_percent as f64 / 100.0;
        (raw_limit - self.dwl_adjustment + min).max(0.0)
    }

    /// Snapshot space geometry and reset the per-cycle summary state. The
    /// tables were cleared by the previous cycle's `post_compact`.
    fn pre_compact(&mut self, heap: &ParallelHeap) {
        self.total_invocations += 1;

        for (i, id) in SpaceId::ALL.iter().enumerate() {
            let space = heap.space(*id);
            self.spaces[i] = SpaceInfo {
                bottom: space.bottom(),
                top: space.top(),
                end: space.end(),
                new_top: space.bottom(),
                dense_prefix: space.bottom(),
                split_info: SplitInfo::default(),
            };
            debug_assert!(self.bitmap.is_range_clear(space.bottom(), space.top()));
        }
        debug_assert!(self
            .summary
            .is_range_clear(0, self.summary.region_count()));
    }

    /// Mark everything reachable from the strong roots, then clear weak root
    /// slots whose referent did not survive.
    fn marking_phase(&mut self, heap: &ParallelHeap) {
        let roots = heap.lock_roots();
        marking::mark_from_roots(&mut self.pool, &self.bitmap, &self.summary, &roots);
        drop(roots);

        let weak_roots = heap.lock_weak_roots();
        let mut cleared = 0usize;
        for slot in weak_roots.iter() {
            let addr = slot.load(Ordering::Relaxed);
            if addr != 0 && !self.bitmap.is_marked(addr) {
                slot.store(0, Ordering::Relaxed);
                cleared += 1;
            }
        }
        log::debug!("marking done, {} weak roots cleared", cleared);
    }

    /// First (full) region in `[beg, end)` with dead space to its left, found
    /// by binary search; regions left of it are necessarily dense prefix.
    fn first_dead_space_region(&self, beg: usize, end: usize) -> usize {
        let sd = &self.summary;
        let mut left = beg;
        let mut right = if end > beg { end - 1 } else { left };

        while left < right {
            let middle = left + (right - left) / 2;
            let middle_ptr = sd.region(middle);
            let dest = middle_ptr.destination();
            let addr = sd.region_to_addr(middle);
            debug_assert!(dest <= addr, "must move left");

            if middle > left && dest < addr {
                right = middle - 1;
            } else if middle < right && middle_ptr.data_size() == REGION_SIZE {
                left = middle + 1;
            } else {
                return middle;
            }
        }
        left
    }

    /// Region in `[beg, end)` with approximately `dead_words` of dead space
    /// to its left, found by binary search.
    fn dead_wood_limit_region(&self, beg: usize, end: usize, dead_words: usize) -> usize {
        let sd = &self.summary;
        let mut left = beg;
        let mut right = if end > beg { end - 1 } else { left };

        while left < right {
            let middle = left + (right - left) / 2;
            let middle_ptr = sd.region(middle);
            let dest = middle_ptr.destination();
            let addr = sd.region_to_addr(middle);
            debug_assert!(dest <= addr, "must move left");

            let dead_to_left = (addr - dest) >> LOG_WORD_SIZE;
            if middle > left && dead_to_left > dead_words {
                right = middle - 1;
            } else if middle < right && dead_to_left < dead_words {
                left = middle + 1;
            } else {
                return middle;
            }
        }
        left
    }

    /// Ratio of the space reclaimed to the work needed to reclaim it, if the
    /// dense prefix were to end at `region_idx`. Valid after the quick
    /// summarization of each space into itself.
    fn reclaimed_ratio(
        &self,
        region_idx: usize,
        bottom: Address,
        top: Address,
        new_top: Address,
    ) -> f64 {
        let sd = &self.summary;
        let destination = sd.region(region_idx).destination();
        debug_assert!(top >= new_top);
        debug_assert!(new_top >= destination);

        let dense_prefix_live = (destination - bottom) >> LOG_WORD_SIZE;
        let compacted_region_live = (new_top - destination) >> LOG_WORD_SIZE;
        let compacted_region_used = (top - sd.region_to_addr(region_idx)) >> LOG_WORD_SIZE;
        let reclaimable = compacted_region_used - compacted_region_live;

        // The 1.25 penalizes work in the compacted part relative to prefix
        // pointer updates, since moving data costs more than updating it.
        let divisor = dense_prefix_live as f64 + 1.25 * compacted_region_live as f64;
        reclaimable as f64 / divisor
    }

    /// End of the dense prefix, always on a region boundary. Full regions on
    /// the left are skipped, the dead-wood limit bounds the candidates, and
    /// the candidate with the best reclaimed ratio wins.
    fn compute_dense_prefix(&mut self, id: usize, maximum_compaction: bool) -> Address {
        let si = self.spaces[id];
        let sd = &self.summary;

        let beg_region = sd.addr_to_region_idx(si.bottom);
        let top_region = sd.addr_to_region_idx(sd.region_align_up(si.top));
        let new_top_region = sd.addr_to_region_idx(sd.region_align_up(si.new_top));

        // Skip full regions at the beginning of the space, they are
        // necessarily part of the dense prefix.
        let full_region = self.first_dead_space_region(beg_region, new_top_region);

        // The gc number is saved whenever a maximum compaction is done and
        // used to determine when the maximum compaction interval has expired,
        // which avoids successive max compactions for different reasons.
        let gcs_since_max = self.total_invocations - self.maximum_compaction_gc_num;
        let interval_ended = gcs_since_max > self.config.max_compaction_interval
            || self.total_invocations == self.config.first_max_compaction_count;
        if maximum_compaction || full_region == top_region || interval_ended {
            self.maximum_compaction_gc_num = self.total_invocations;
            return self.summary.region_to_addr(full_region);
        }

        let space_live = (si.new_top - si.bottom) >> LOG_WORD_SIZE;
        let space_used = (si.top - si.bottom) >> LOG_WORD_SIZE;
        let space_capacity = (si.end - si.bottom) >> LOG_WORD_SIZE;

        let density = space_live as f64 / space_capacity as f64;
        let limiter = self.dead_wood_limiter(density, self.config.min_dead_percent);
        let dead_wood_max = space_used - space_live;
        let dead_wood_limit =
            ((space_capacity as f64 * limiter) as usize).min(dead_wood_max);
        log::debug!(
            "density={:.4} limiter={:.4} dead_wood_max={} dead_wood_limit={}",
            density,
            limiter,
            dead_wood_max,
            dead_wood_limit
        );

        // Locate the region with the desired amount of dead space to the
        // left, then pick the best candidate below it.
        let limit_region =
            self.dead_wood_limit_region(full_region, top_region, dead_wood_limit);

        let mut best_ratio = 0.0;
        let mut best_region = full_region;
        for cp in full_region..limit_region {
            let ratio = self.reclaimed_ratio(cp, si.bottom, si.top, si.new_top);
            if ratio > best_ratio {
                best_region = cp;
                best_ratio = ratio;
            }
        }

        self.summary.region_to_addr(best_region)
    }

    /// If dead space crosses the dense prefix boundary, overwrite the word
    /// before the boundary with a filler object and mark it live, so no
    /// too-small dead fragment is left against the boundary.
    fn fill_dense_prefix_end(&self, id: usize) {
        let dense_prefix_end = self.spaces[id].dense_prefix;
        debug_assert!(dense_prefix_end != self.spaces[id].bottom);

        let region_ptr = self.summary.region_containing(dense_prefix_end);
        let crosses = region_ptr.partial_obj_size() == 0
            && !self.bitmap.is_marked(dense_prefix_end)
            && !self.bitmap.is_obj_end(dense_prefix_end - WORD_SIZE);
        if crosses {
            let obj_beg = dense_prefix_end - (header::MIN_OBJECT_WORDS << LOG_WORD_SIZE);
            header::fill_with_dead_object(obj_beg, header::MIN_OBJECT_WORDS);
            self.bitmap.par_mark(obj_beg, header::MIN_OBJECT_WORDS);
            self.summary.add_obj(obj_beg, header::MIN_OBJECT_WORDS);
        }
    }

    /// Summarize each space into itself to learn how much is live; the
    /// per-space results seed the dense prefix decisions.
    fn summarize_spaces_quick(&mut self) {
        let summary = &self.summary;
        for si in self.spaces.iter_mut() {
            match summary.summarize(&mut si.split_info, si.bottom, si.top, si.bottom, si.end) {
                Summarize::Fit { target_next } => si.new_top = target_next,
                Summarize::Split { .. } => unreachable!("a space must fit into itself"),
            }
            si.dense_prefix = si.bottom;
        }
    }

    fn summarize_space(&mut self, id: usize, maximum_compaction: bool) {
        debug_assert_eq!(self.spaces[id].dense_prefix, self.spaces[id].bottom);
        if self.spaces[id].new_top == self.spaces[id].bottom {
            return;
        }

        let dense_prefix_end = self.compute_dense_prefix(id, maximum_compaction);
        self.spaces[id].dense_prefix = dense_prefix_end;

        // Recompute the summary data taking the dense prefix into account. If
        // every last word is reclaimed the existing summary data, which
        // compacts everything, is already right.
        if !maximum_compaction && dense_prefix_end != self.spaces[id].bottom {
            self.fill_dense_prefix_end(id);

            let summary = &self.summary;
            let si = &mut self.spaces[id];
            summary.summarize_dense_prefix(si.bottom, dense_prefix_end);
            match summary.summarize(
                &mut si.split_info,
                dense_prefix_end,
                si.top,
                dense_prefix_end,
                si.end,
            ) {
                Summarize::Fit { target_next } => si.new_top = target_next,
                Summarize::Split { .. } => {
                    unreachable!("the compacted part must fit into its own space")
                }
            }
        }

        log::debug!(
            "space {}: dense_prefix={:#x} new_top={:#x}",
            id,
            self.spaces[id].dense_prefix,
            self.spaces[id].new_top
        );
    }

    /// Decide where everything goes: old space first, then the young spaces
    /// chained into old space until it runs out, the overflowing space
    /// compacting the remainder into itself and becoming the next target.
    fn summary_phase(&mut self, mut maximum_compaction: bool) {
        self.summarize_spaces_quick();

        // The live data that would land in old space, assuming it fits.
        let total_live: usize = self
            .spaces
            .iter()
            .map(|si| (si.new_top - si.bottom) >> LOG_WORD_SIZE)
            .sum();
        let old_capacity = (self.spaces[0].end - self.spaces[0].bottom) >> LOG_WORD_SIZE;
        if total_live > old_capacity {
            log::debug!(
                "projected live {} exceeds old capacity {}, forcing maximum compaction",
                total_live,
                old_capacity
            );
            maximum_compaction = true;
        }

        self.summarize_space(0, maximum_compaction);

        let summary = &self.summary;
        let spaces = &mut self.spaces;
        let mut dst_space_id = 0;
        let mut dst_space_end = spaces[0].end;
        for id in 1..SPACE_COUNT {
            let live = (spaces[id].new_top - spaces[id].bottom) >> LOG_WORD_SIZE;
            let available = (dst_space_end - spaces[dst_space_id].new_top) >> LOG_WORD_SIZE;
            let (src_bottom, src_top) = (spaces[id].bottom, spaces[id].top);

            if live > 0 && live <= available {
                // All the live data fits into the current target.
                let target_beg = spaces[dst_space_id].new_top;
                match summary.summarize(
                    &mut spaces[id].split_info,
                    src_bottom,
                    src_top,
                    target_beg,
                    dst_space_end,
                ) {
                    Summarize::Fit { target_next } => {
                        spaces[dst_space_id].new_top = target_next;
                        spaces[id].new_top = src_bottom;
                    }
                    Summarize::Split { .. } => unreachable!("live data was measured to fit"),
                }
            } else if live > 0 {
                // Fit part of the space into the target; the remainder is
                // compacted into the space itself, which becomes the new
                // target.
                let target_beg = spaces[dst_space_id].new_top;
                match summary.summarize(
                    &mut spaces[id].split_info,
                    src_bottom,
                    src_top,
                    target_beg,
                    dst_space_end,
                ) {
                    Summarize::Split {
                        source_next,
                        target_next,
                    } => {
                        spaces[dst_space_id].new_top = target_next;

                        dst_space_id = id;
                        dst_space_end = spaces[id].end;
                        match summary.summarize(
                            &mut spaces[id].split_info,
                            source_next,
                            src_top,
                            src_bottom,
                            dst_space_end,
                        ) {
                            Summarize::Fit { target_next } => {
                                debug_assert!(target_next <= src_top, "usage should not grow");
                                spaces[id].new_top = target_next;
                            }
                            Summarize::Split { .. } => {
                                unreachable!("a space must fit when compacted into itself")
                            }
                        }
                    }
                    Summarize::Fit { .. } => unreachable!("live data was measured to overflow"),
                }
            }
        }
    }

    /// Point every root slot at its referent's post-compaction address.
    /// Strong and surviving weak roots alike; dead weak referents were
    /// cleared during marking.
    fn adjust_roots(&self, heap: &ParallelHeap) {
        let roots = heap.lock_roots();
        let weak_roots = heap.lock_weak_roots();
        for slot in roots.iter().chain(weak_roots.iter()) {
            let addr = slot.load(Ordering::Relaxed);
            if addr != 0 {
                slot.store(
                    self.summary.calc_new_pointer(&self.bitmap, addr),
                    Ordering::Relaxed,
                );
            }
        }
    }

    /// Move everything: seed the region deques, partition the dense prefix
    /// updates, run the gang, then fix up objects whose copy was cut by a
    /// region boundary.
    fn compaction_phase(&mut self) {
        let nworkers = self.config.workers;
        let shadow_pool = SegQueue::new();
        let ctx = CompactCtx {
            bitmap: &self.bitmap,
            summary: &self.summary,
            spaces: &self.spaces,
            shadow_pool: &shadow_pool,
            nworkers,
        };

        compact::initialize_shadow_regions(&ctx);

        let mut workers = Vec::with_capacity(nworkers);
        let mut stealers = Vec::with_capacity(nworkers);
        for _ in 0..nworkers {
            let w = Worker::new_lifo();
            stealers.push(w.stealer());
            workers.push(w);
        }
        compact::prepare_region_draining_tasks(&ctx, &workers);
        let dense_tasks = compact::enqueue_dense_prefix_tasks(&ctx);

        let terminator = Terminator::new(nworkers);
        let old_dense_prefix_region = self.summary.addr_to_region_idx(self.spaces[0].dense_prefix);

        self.pool.scoped(|scoped| {
            for (task_id, worker) in workers.into_iter().enumerate() {
                let ctx = &ctx;
                let stealers = &stealers;
                let terminator = &terminator;
                let dense_tasks = &dense_tasks;
                scoped.execute(move || {
                    let mut compactor = Compactor {
                        task_id,
                        worker,
                        stealers,
                        terminator,
                        ctx,
                        next_shadow_region: old_dense_prefix_region + task_id,
                    };
                    compactor.run(dense_tasks);
                });
            }
        });

        for id in 0..SPACE_COUNT {
            compact::verify_complete(&ctx, id);
        }
        for id in 0..SPACE_COUNT {
            compact::update_deferred_objects(&ctx, id);
        }
    }

    fn clear_data_covering_space(&mut self, id: usize) {
        let si = &mut self.spaces[id];
        // Nothing is marked above top; the summary data covers everything
        // written this cycle, which reaches to the larger of top and new_top.
        let max_top = si.top.max(si.new_top);
        self.bitmap.clear_range(si.bottom, si.top);
        let beg_region = self.summary.addr_to_region_idx(si.bottom);
        let end_region = self
            .summary
            .addr_to_region_idx(self.summary.region_align_up(max_top));
        self.summary.clear_range(beg_region, end_region);
        si.split_info.clear();
    }

    /// Reset the side tables and publish the new tops to the heap.
    fn post_compact(&mut self, heap: &ParallelHeap) {
        for (i, id) in SpaceId::ALL.iter().enumerate() {
            self.clear_data_covering_space(i);
            heap.space(*id).set_top(self.spaces[i].new_top);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::header::HeapObjectHeader;

    #[test]
    fn dead_wood_limiter_is_min_at_full_density() {
        let heap = ParallelHeap::new(REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
        let pc = ParallelCompact::new(&heap, Config::default()).unwrap();
        let limit = pc.dead_wood_limiter(1.0, 5);
        assert!((limit - 0.05).abs() < 1e-12);
    }

    #[test]
    fn dead_wood_limiter_is_symmetric_around_the_mean() {
        let heap = ParallelHeap::new(REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
        let pc = ParallelCompact::new(&heap, Config::default()).unwrap();
        let lo = pc.dead_wood_limiter(0.3, 1);
        let hi = pc.dead_wood_limiter(0.7, 1);
        assert!((lo - hi).abs() < 1e-12);
        assert!(lo > pc.dead_wood_limiter(0.1, 1));
    }

    #[test]
    fn maximum_compaction_slides_everything_left() {
        let heap = ParallelHeap::new(2 * REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
        let mut pc = ParallelCompact::new(
            &heap,
            Config {
                workers: 2,
                ..Config::default()
            },
        )
        .unwrap();

        let a = heap.allocate_object(SpaceId::Old, 8, 0).unwrap();
        let _dead = heap.allocate_object(SpaceId::Old, 100, 0).unwrap();
        let c = heap.allocate_object(SpaceId::Old, 6, 1).unwrap();
        HeapObjectHeader::from_address(c).set_ref_slot(0, a);
        let ra = heap.add_root(a);
        let rc = heap.add_root(c);

        pc.invoke(&heap, true);

        let bottom = heap.space(SpaceId::Old).bottom();
        assert_eq!(heap.root(ra), bottom);
        assert_eq!(heap.root(rc), bottom + 8 * WORD_SIZE);
        assert_eq!(heap.space(SpaceId::Old).top(), bottom + 14 * WORD_SIZE);
        // The survivor of the slide still points at the moved object.
        assert_eq!(
            HeapObjectHeader::from_address(heap.root(rc)).ref_slot(0),
            bottom
        );
    }

    #[test]
    fn weak_roots_are_cleared_and_adjusted() {
        let heap = ParallelHeap::new(REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
        let mut pc = ParallelCompact::new(
            &heap,
            Config {
                workers: 2,
                ..Config::default()
            },
        )
        .unwrap();

        let _gap = heap.allocate_object(SpaceId::Old, 20, 0).unwrap();
        let live = heap.allocate_object(SpaceId::Old, 4, 0).unwrap();
        let dead = heap.allocate_object(SpaceId::Old, 4, 0).unwrap();
        heap.add_root(live);
        let w_live = heap.add_weak_root(live);
        let w_dead = heap.add_weak_root(dead);

        pc.invoke(&heap, true);

        assert_eq!(heap.weak_root(w_dead), 0);
        assert_eq!(heap.weak_root(w_live), heap.space(SpaceId::Old).bottom());
    }
}
