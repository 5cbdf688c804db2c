use crate::bitmap::MarkBitmap;
use crate::globals::*;
use crate::header::{self, HeapObjectHeader};
use crate::summary::SummaryData;
use crate::terminator::Terminator;
use crossbeam::deque::{Injector, Steal, Stealer, Worker};
use scoped_threadpool::Pool;
use std::sync::atomic::AtomicUsize;

/// Number of root slots handed to a worker at a time.
const ROOT_CHUNK: usize = 64;

/// Mark all objects reachable from `roots`, tallying the live words of each
/// marked object into the summary tables as a side effect. Root slots hold an
/// object address or 0.
pub(crate) fn mark_from_roots(
    pool: &mut Pool,
    bitmap: &MarkBitmap,
    summary: &SummaryData,
    roots: &[AtomicUsize],
) {
    let n_threads = pool.thread_count() as usize;
    let mut workers = Vec::with_capacity(n_threads);
    let mut stealers = Vec::with_capacity(n_threads);
    for _ in 0..n_threads {
        let w = Worker::new_lifo();
        stealers.push(w.stealer());
        workers.push(w);
    }

    let injector = Injector::new();
    let mut beg = 0;
    while beg < roots.len() {
        let end = (beg + ROOT_CHUNK).min(roots.len());
        injector.push((beg, end));
        beg = end;
    }

    let terminator = Terminator::new(n_threads);
    pool.scoped(|scoped| {
        for (task_id, worker) in workers.into_iter().enumerate() {
            let injector = &injector;
            let stealers = &stealers;
            let terminator = &terminator;
            scoped.execute(move || {
                let marker = Marker {
                    task_id,
                    worker,
                    injector,
                    stealers,
                    terminator,
                    bitmap,
                    summary,
                    roots,
                };
                marker.run();
            });
        }
    });
}

struct Marker<'a> {
    task_id: usize,
    worker: Worker<Address>,
    injector: &'a Injector<(usize, usize)>,
    stealers: &'a [Stealer<Address>],
    terminator: &'a Terminator,
    bitmap: &'a MarkBitmap,
    summary: &'a SummaryData,
    roots: &'a [AtomicUsize],
}

impl<'a> Marker<'a> {
    /// Mark `addr` and queue it for tracing; exactly one of the racing
    /// markers wins and accounts the object's size.
    fn mark_and_push(&self, addr: Address) {
        let size = header::obj_size(addr);
        if self.bitmap.par_mark(addr, size) {
            self.summary.add_obj(addr, size);
            self.worker.push(addr);
        }
    }

    fn follow(&self, addr: Address) {
        let h = HeapObjectHeader::from_address(addr);
        for i in 0..h.ref_len() {
            let target = h.ref_slot(i);
            if target != 0 {
                self.mark_and_push(target);
            }
        }
    }

    fn pop(&self) -> Option<Address> {
        self.worker.pop().or_else(|| self.steal())
    }

    fn steal(&self) -> Option<Address> {
        if self.stealers.len() == 1 {
            return None;
        }

        for i in 1..self.stealers.len() {
            let stealer = &self.stealers[(self.task_id + i) % self.stealers.len()];
            loop {
                match stealer.steal_batch_and_pop(&self.worker) {
                    Steal::Empty => break,
                    Steal::Success(address) => return Some(address),
                    Steal::Retry => continue,
                }
            }
        }

        None
    }

    fn run(&self) {
        // Claim root chunks until the shared queue drains.
        loop {
            match self.injector.steal() {
                Steal::Success((beg, end)) => {
                    for slot in &self.roots[beg..end] {
                        let addr = slot.load(std::sync::atomic::Ordering::Relaxed);
                        if addr != 0 {
                            self.mark_and_push(addr);
                        }
                    }
                }
                Steal::Empty => break,
                Steal::Retry => continue,
            }
        }

        // Transitive closure with stealing.
        loop {
            if let Some(addr) = self.pop() {
                self.follow(addr);
            } else if self.terminator.try_terminate() {
                break;
            }
        }
    }
}
