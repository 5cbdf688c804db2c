use vega::globals::*;
use vega::header::{self, HeapObjectHeader};
use vega::{Config, ParallelCompact, ParallelHeap, SpaceId};

fn collector(heap: &ParallelHeap, workers: usize) -> ParallelCompact {
    let _ = env_logger::builder().is_test(true).try_init();
    ParallelCompact::new(
        heap,
        Config {
            workers,
            ..Config::default()
        },
    )
    .unwrap()
}

/// Allocate an object and stamp its first and last payload words with a tag,
/// so a later `check` can prove the object moved intact.
fn alloc(heap: &ParallelHeap, id: SpaceId, words: usize, ref_len: usize, tag: usize) -> Address {
    let addr = heap.allocate_object(id, words, ref_len).unwrap();
    let h = HeapObjectHeader::from_address(addr);
    let payload = words - header::HEADER_WORDS - ref_len;
    if payload > 0 {
        h.set_payload_word(0, tag);
        h.set_payload_word(payload - 1, tag ^ 0x5a5a);
    }
    addr
}

fn check(addr: Address, words: usize, ref_len: usize, tag: usize) {
    let h = HeapObjectHeader::from_address(addr);
    assert_eq!(h.size_words(), words);
    assert_eq!(h.ref_len(), ref_len);
    let payload = words - header::HEADER_WORDS - ref_len;
    if payload > 0 {
        assert_eq!(h.payload_word(0), tag);
        assert_eq!(h.payload_word(payload - 1), tag ^ 0x5a5a);
    }
}

fn set_ref(obj: Address, i: usize, target: Address) {
    HeapObjectHeader::from_address(obj).set_ref_slot(i, target);
}

fn get_ref(obj: Address, i: usize) -> Address {
    HeapObjectHeader::from_address(obj).ref_slot(i)
}

#[test]
fn graph_survives_compaction() {
    let heap = ParallelHeap::new(2 * REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
    let mut pc = collector(&heap, 2);

    let a = alloc(&heap, SpaceId::Old, 16, 2, 0xa);
    let _dead = alloc(&heap, SpaceId::Old, 500, 0, 0);
    let b = alloc(&heap, SpaceId::Old, 32, 1, 0xb);
    let e = alloc(&heap, SpaceId::Eden, 12, 1, 0xe);
    set_ref(a, 0, b);
    set_ref(a, 1, e);
    set_ref(b, 0, a); // cycle
    set_ref(e, 0, b);
    let ra = heap.add_root(a);
    let we = heap.add_weak_root(e);

    pc.invoke(&heap, true);

    let bottom = heap.space(SpaceId::Old).bottom();
    let a2 = heap.root(ra);
    assert_eq!(a2, bottom);
    check(a2, 16, 2, 0xa);

    let b2 = get_ref(a2, 0);
    assert_eq!(b2, bottom + 16 * WORD_SIZE);
    check(b2, 32, 1, 0xb);
    assert_eq!(get_ref(b2, 0), a2);

    // Eden's live data was appended to the old space and eden emptied.
    let e2 = get_ref(a2, 1);
    assert_eq!(e2, bottom + 48 * WORD_SIZE);
    check(e2, 12, 1, 0xe);
    assert_eq!(get_ref(e2, 0), b2);
    assert_eq!(heap.weak_root(we), e2);
    assert!(heap.space(SpaceId::Eden).is_empty());
    assert_eq!(heap.space(SpaceId::Old).top(), bottom + 60 * WORD_SIZE);
}

#[test]
fn spanning_object_moves_intact() {
    let heap = ParallelHeap::new(4 * REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
    let mut pc = collector(&heap, 2);

    let big_words = REGION_SIZE + 1500;
    let _dead = alloc(&heap, SpaceId::Old, 1000, 0, 0);
    let big = alloc(&heap, SpaceId::Old, big_words, 1, 0xb16);
    let tail = alloc(&heap, SpaceId::Old, 8, 0, 0xf00);
    set_ref(big, 0, tail);
    let rbig = heap.add_root(big);

    pc.invoke(&heap, true);

    let bottom = heap.space(SpaceId::Old).bottom();
    let big2 = heap.root(rbig);
    assert_eq!(big2, bottom);
    check(big2, big_words, 1, 0xb16);

    // The pointer inside the deferred object was fixed up after the gang.
    let tail2 = get_ref(big2, 0);
    assert_eq!(tail2, bottom + big_words * WORD_SIZE);
    check(tail2, 8, 0, 0xf00);
    assert_eq!(
        heap.space(SpaceId::Old).top(),
        bottom + (big_words + 8) * WORD_SIZE
    );
}

#[test]
fn young_space_overflow_compacts_into_itself() {
    let heap = ParallelHeap::new(REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
    let mut pc = collector(&heap, 2);

    // Old space is nearly full, so eden's live data cannot all fit.
    let old_obj = alloc(&heap, SpaceId::Old, 60000, 0, 0x01d);
    let _egap = alloc(&heap, SpaceId::Eden, 2000, 0, 0);
    let e1 = alloc(&heap, SpaceId::Eden, 5000, 0, 0xe1);
    let e2 = alloc(&heap, SpaceId::Eden, 4000, 0, 0xe2);
    let rold = heap.add_root(old_obj);
    let r1 = heap.add_root(e1);
    let r2 = heap.add_root(e2);

    pc.invoke(&heap, false);

    let old_bottom = heap.space(SpaceId::Old).bottom();
    let eden_bottom = heap.space(SpaceId::Eden).bottom();

    check(heap.root(rold), 60000, 0, 0x01d);
    assert_eq!(heap.root(rold), old_bottom);
    assert_eq!(heap.space(SpaceId::Old).top(), old_bottom + 60000 * WORD_SIZE);

    // Eden overflowed the old space and compacted into itself instead.
    assert_eq!(heap.root(r1), eden_bottom);
    assert_eq!(heap.root(r2), eden_bottom + 5000 * WORD_SIZE);
    check(heap.root(r1), 5000, 0, 0xe1);
    check(heap.root(r2), 4000, 0, 0xe2);
    assert_eq!(
        heap.space(SpaceId::Eden).top(),
        eden_bottom + 9000 * WORD_SIZE
    );
}

#[test]
fn dense_prefix_objects_stay_in_place() {
    let heap = ParallelHeap::new(4 * REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
    let mut pc = collector(&heap, 2);

    // Region 0 completely live: it must end up inside the dense prefix on a
    // non-maximum collection.
    let mut prefix_objs = Vec::new();
    for i in 0..64 {
        let ref_len = if i == 0 { 1 } else { 0 };
        let obj = alloc(&heap, SpaceId::Old, 1024, ref_len, 0x100 + i);
        prefix_objs.push(heap.add_root(obj));
    }
    // Region 1: a live object at the region start, a large dead gap, then a
    // live object that must slide left over the gap.
    let near = alloc(&heap, SpaceId::Old, 512, 0, 0xaaa);
    let _dead = alloc(&heap, SpaceId::Old, 40000, 0, 0);
    let far = alloc(&heap, SpaceId::Old, 512, 0, 0xbbb);
    let rnear = heap.add_root(near);
    let rfar = heap.add_root(far);
    set_ref(heap.root(prefix_objs[0]), 0, far);

    pc.invoke(&heap, false);

    let bottom = heap.space(SpaceId::Old).bottom();

    // Nothing below the dense prefix moved.
    for (i, root) in prefix_objs.iter().enumerate() {
        assert_eq!(heap.root(*root), bottom + i * 1024 * WORD_SIZE);
    }
    check(heap.root(prefix_objs[5]), 1024, 0, 0x105);

    // The gap above the prefix was squeezed out and the prefix object's
    // pointer updated in place.
    let region1 = bottom + REGION_SIZE * WORD_SIZE;
    assert_eq!(heap.root(rnear), region1);
    assert_eq!(heap.root(rfar), region1 + 512 * WORD_SIZE);
    check(heap.root(rfar), 512, 0, 0xbbb);
    assert_eq!(get_ref(heap.root(prefix_objs[0]), 0), heap.root(rfar));
    assert_eq!(
        heap.space(SpaceId::Old).top(),
        region1 + 1024 * WORD_SIZE
    );
}

#[test]
fn cascading_regions_compact_with_gang() {
    let heap = ParallelHeap::new(8 * REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
    let mut pc = collector(&heap, 4);

    // Six regions of [40000 live | 25536 dead]: every destination region
    // depends on its successors, forcing shadow-region steals.
    const LIVE: usize = 40000;
    let mut roots = Vec::new();
    for i in 0..6 {
        let obj = alloc(&heap, SpaceId::Old, LIVE, 0, 0xc0de + i);
        roots.push(heap.add_root(obj));
        let _dead = alloc(&heap, SpaceId::Old, REGION_SIZE - LIVE, 0, 0);
    }

    pc.invoke(&heap, true);

    let bottom = heap.space(SpaceId::Old).bottom();
    for (i, root) in roots.iter().enumerate() {
        let addr = heap.root(*root);
        assert_eq!(addr, bottom + i * LIVE * WORD_SIZE);
        check(addr, LIVE, 0, 0xc0de + i);
    }
    assert_eq!(
        heap.space(SpaceId::Old).top(),
        bottom + 6 * LIVE * WORD_SIZE
    );
}

#[test]
fn repeated_cycles_reuse_clean_tables() {
    let heap = ParallelHeap::new(2 * REGION_SIZE, REGION_SIZE, REGION_SIZE).unwrap();
    let mut pc = collector(&heap, 2);

    let a = alloc(&heap, SpaceId::Old, 16, 0, 0x1);
    let _dead = alloc(&heap, SpaceId::Old, 100, 0, 0);
    let b = alloc(&heap, SpaceId::Old, 16, 1, 0x2);
    set_ref(b, 0, a);
    let ra = heap.add_root(a);
    let rb = heap.add_root(b);

    pc.invoke(&heap, true);
    let bottom = heap.space(SpaceId::Old).bottom();
    assert_eq!(heap.root(ra), bottom);
    assert_eq!(heap.root(rb), bottom + 16 * WORD_SIZE);

    // Mutate between cycles: new allocation plus a dropped root.
    let c = alloc(&heap, SpaceId::Eden, 12, 0, 0x3);
    let rc = heap.add_root(c);
    pc.invoke(&heap, true);
    assert_eq!(heap.root(rc), bottom + 32 * WORD_SIZE);

    heap.set_root(rb, 0);
    pc.invoke(&heap, true);

    assert_eq!(heap.root(ra), bottom);
    check(heap.root(ra), 16, 0, 0x1);
    assert_eq!(heap.root(rc), bottom + 16 * WORD_SIZE);
    check(heap.root(rc), 12, 0, 0x3);
    assert_eq!(heap.space(SpaceId::Old).top(), bottom + 28 * WORD_SIZE);
    assert_eq!(pc.total_invocations(), 3);
}
