/// A heap address. Always word aligned; arithmetic on it is in bytes.
pub type Address = usize;

pub const LOG_WORD_SIZE: usize = 3;
/// Heap word size in bytes. The crate measures object and region sizes in
/// words, addresses in bytes.
pub const WORD_SIZE: usize = 1 << LOG_WORD_SIZE;

pub const LOG_REGION_SIZE: usize = 16;
/// Summary region size in words (2^16 words = 512 KiB).
pub const REGION_SIZE: usize = 1 << LOG_REGION_SIZE;
pub const REGION_SIZE_BYTES: usize = REGION_SIZE << LOG_WORD_SIZE;

pub const LOG_BLOCK_SIZE: usize = 7;
/// Block size in words (2^7 words = 1 KiB). Blocks subdivide regions for
/// forwarding-address queries.
pub const BLOCK_SIZE: usize = 1 << LOG_BLOCK_SIZE;

pub const LOG_BLOCKS_PER_REGION: usize = LOG_REGION_SIZE - LOG_BLOCK_SIZE;
pub const BLOCKS_PER_REGION: usize = 1 << LOG_BLOCKS_PER_REGION;

#[inline(always)]
pub const fn round_down(x: usize, n: usize) -> usize {
    x & !(n - 1)
}

#[inline(always)]
pub const fn round_up(x: usize, n: usize) -> usize {
    round_down(x + n - 1, n)
}

#[inline(always)]
pub const fn is_aligned(x: usize, n: usize) -> bool {
    x & (n - 1) == 0
}
