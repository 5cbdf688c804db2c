use crate::globals::*;
use modular_bitfield::prelude::*;
use std::mem::size_of;

// HeapObjectHeader is one word prepended to every object.
//
// +-----------------+------+------------------------------------------+
// | name            | bits |                                          |
// +-----------------+------+------------------------------------------+
// | size            |   32 | Object size in words, header included.   |
// +-----------------+------+------------------------------------------+
// | ref len         |   31 | Number of reference slots following the  |
// |                 |      | header. Each slot holds a heap address   |
// |                 |      | or 0.                                    |
// | filler          |    1 | Dead-space filler, has no references.    |
// +-----------------+------+------------------------------------------+
//
// Payload words (if any) follow the reference slots and are opaque to the
// collector.
#[bitfield(bits = 64)]
#[derive(Clone, Copy)]
pub struct EncodedWord {
    pub size_words: B32,
    pub ref_len: B31,
    pub filler: bool,
}

#[repr(C)]
pub struct HeapObjectHeader {
    encoded: EncodedWord,
}

pub const HEADER_WORDS: usize = size_of::<HeapObjectHeader>() / WORD_SIZE;
/// Smallest object (and filler) the heap can park in a gap: a bare header.
pub const MIN_OBJECT_WORDS: usize = HEADER_WORDS;

impl HeapObjectHeader {
    #[inline(always)]
    pub fn from_address<'a>(addr: Address) -> &'a Self {
        unsafe { &*(addr as *const Self) }
    }

    #[inline(always)]
    pub fn size_words(&self) -> usize {
        self.encoded.size_words() as usize
    }

    #[inline(always)]
    pub fn ref_len(&self) -> usize {
        self.encoded.ref_len() as usize
    }

    #[inline(always)]
    pub fn is_filler(&self) -> bool {
        self.encoded.filler()
    }

    #[inline(always)]
    pub fn address(&self) -> Address {
        self as *const Self as Address
    }

    /// Address of the i-th reference slot.
    #[inline(always)]
    pub fn ref_slot_addr(&self, i: usize) -> Address {
        debug_assert!(i < self.ref_len());
        self.address() + (HEADER_WORDS + i) * WORD_SIZE
    }

    #[inline(always)]
    pub fn ref_slot(&self, i: usize) -> Address {
        unsafe { (self.ref_slot_addr(i) as *const Address).read() }
    }

    #[inline(always)]
    pub fn set_ref_slot(&self, i: usize, value: Address) {
        unsafe { (self.ref_slot_addr(i) as *mut Address).write(value) }
    }

    /// The i-th payload word, counted after the reference slots.
    #[inline(always)]
    pub fn payload_word(&self, i: usize) -> usize {
        debug_assert!(HEADER_WORDS + self.ref_len() + i < self.size_words());
        unsafe {
            ((self.address() + (HEADER_WORDS + self.ref_len() + i) * WORD_SIZE) as *const usize)
                .read()
        }
    }

    #[inline(always)]
    pub fn set_payload_word(&self, i: usize, value: usize) {
        debug_assert!(HEADER_WORDS + self.ref_len() + i < self.size_words());
        unsafe {
            ((self.address() + (HEADER_WORDS + self.ref_len() + i) * WORD_SIZE) as *mut usize)
                .write(value)
        }
    }
}

/// Object size in words read from the header at `addr`.
#[inline(always)]
pub fn obj_size(addr: Address) -> usize {
    HeapObjectHeader::from_address(addr).size_words()
}

/// Write an object header at `addr` and zero its reference slots.
pub fn write_object(addr: Address, size_words: usize, ref_len: usize) {
    debug_assert!(is_aligned(addr, WORD_SIZE));
    debug_assert!(size_words >= HEADER_WORDS + ref_len);
    unsafe {
        let encoded = EncodedWord::new()
            .with_size_words(size_words as u32)
            .with_ref_len(ref_len as u32)
            .with_filler(false);
        (addr as *mut EncodedWord).write(encoded);
        core::ptr::write_bytes((addr + HEADER_WORDS * WORD_SIZE) as *mut usize, 0, ref_len);
    }
}

/// Overwrite `[addr, addr + words)` with a single filler object so the range
/// stays parseable by an object walk.
pub fn fill_with_dead_object(addr: Address, words: usize) {
    debug_assert!(words >= MIN_OBJECT_WORDS);
    unsafe {
        let encoded = EncodedWord::new()
            .with_size_words(words as u32)
            .with_ref_len(0)
            .with_filler(true);
        (addr as *mut EncodedWord).write(encoded);
    }
}
