//! A parallel mark-compact ("mark-summarize-compact") garbage collector.
//!
//! The heap is divided into fixed-size regions. A full collection runs four
//! phases: parallel marking from the roots, a serial summary phase that picks
//! a dense prefix per space and assigns each region's live data a destination,
//! root adjustment, and a parallel compaction phase in which workers claim
//! destination regions and fill them from their source regions, using shadow
//! regions to break region dependency stalls.
//!
//! [`ParallelHeap`] owns the spaces and root tables; [`ParallelCompact`] owns
//! the mark bitmap and summary tables and drives collections.

pub mod bitmap;
mod compact;
pub mod globals;
pub mod header;
pub mod heap;
mod marking;
pub mod mmap;
pub mod parallel_compact;
pub mod space;
pub mod summary;
pub mod terminator;

use thiserror::Error;

/// Errors from setting up the heap or the collector's side tables.
#[derive(Debug, Error)]
pub enum InitError {
    #[error("failed to reserve memory for {what} ({words} words)")]
    Reserve { what: &'static str, words: usize },
}

pub use heap::ParallelHeap;
pub use parallel_compact::{Config, ParallelCompact};
pub use space::SpaceId;
