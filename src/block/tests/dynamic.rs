use std::collections::{BTreeSet, HashMap};

use proptest::collection::vec;
use proptest::prelude::any;
use proptest::{prop_assert, proptest};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::block::{BlockError, DynamicBlockBuffer, PersistentBlockBuffer};
use crate::test::MemoryBuffer;

fn collect_ids<B: PersistentBlockBuffer>(blocks: &B) -> Vec<u64> {
    blocks
        .iterate_block_ids()
        .collect::<Result<Vec<_>, _>>()
        .expect("iteration should not fail")
}

fn open_fresh() -> DynamicBlockBuffer<MemoryBuffer> {
    DynamicBlockBuffer::open(MemoryBuffer::new()).expect("open should not fail")
}

/// No two free blocks of the same size class may be buddies.
fn assert_buddy_invariant(blocks: &DynamicBlockBuffer<MemoryBuffer>) {
    let free: BTreeSet<(u64, u32)> = blocks.free_blocks().into_iter().collect();
    for &(address, class) in &free {
        let buddy = address ^ (1u64 << class);
        assert!(
            !free.contains(&(buddy, class)),
            "free buddies at {address} and {buddy}, class {class}"
        );
    }
}

#[test]
fn first_allocation_is_offset_zero() {
    let mut blocks = open_fresh();
    assert_eq!(blocks.allocate(23).expect("allocate"), 0);
}

#[test]
fn payload_capacity_excludes_the_header_byte() {
    let mut blocks = open_fresh();
    let id = blocks.allocate(7).expect("allocate");
    // 2^3 = 8 bytes including the header.
    assert_eq!(blocks.block_capacity(id).expect("capacity"), 7);

    blocks.put(id, 0, b"seven!!").expect("put");
    let mut payload = [0u8; 7];
    blocks.get(id, 0, &mut payload).expect("get");
    assert_eq!(&payload, b"seven!!");

    assert!(matches!(
        blocks.put(id, 4, b"long"),
        Err(BlockError::OutOfBlockBounds { .. })
    ));
}

#[test]
fn growth_stays_within_the_power_of_two_budget() {
    let mut blocks = open_fresh();
    let mut ids = Vec::new();
    for size in [7u64, 17, 260, 1025] {
        ids.push(blocks.allocate(size).expect("allocate"));
    }
    // Classes 3 + 5 + 9 + 11 sum to 2600 bytes; one 4 KiB page holds them.
    assert_eq!(blocks.capacity().expect("capacity"), 4096);
    let unique: BTreeSet<_> = ids.iter().copied().collect();
    assert_eq!(unique.len(), ids.len());

    for id in ids {
        blocks.deallocate(id).expect("deallocate");
    }
    // Everything coalesces back into a single block covering the file.
    assert_buddy_invariant(&blocks);
    assert_eq!(blocks.free_blocks(), vec![(0, 12)]);
    assert_eq!(blocks.allocate(4095).expect("allocate"), 0);
    assert_eq!(blocks.capacity().expect("capacity"), 4096);
}

#[test]
fn blocks_are_aligned_to_their_size() {
    let mut blocks = open_fresh();
    let mut rng = StdRng::seed_from_u64(11);
    for _ in 0..300 {
        let size = rng.gen_range(0..2000);
        let id = blocks.allocate(size).expect("allocate");
        let class = 64 - size.leading_zeros();
        assert_eq!(id % (1u64 << class), 0, "block {id} misaligned");
    }
}

#[test]
fn random_churn_preserves_the_buddy_invariant() {
    let mut rng = StdRng::seed_from_u64(4242);
    let mut blocks = open_fresh();
    let mut live: HashMap<u64, u64> = HashMap::new();

    for round in 0..3000 {
        if live.is_empty() || rng.gen_bool(0.55) {
            let size = rng.gen_range(0..500);
            let id = blocks.allocate(size).expect("allocate");
            assert!(
                live.insert(id, size).is_none(),
                "allocate returned a live id: {id}"
            );
        } else {
            let victim = *live
                .keys()
                .nth(rng.gen_range(0..live.len()))
                .expect("non-empty");
            blocks.deallocate(victim).expect("deallocate");
            live.remove(&victim);
        }
        if round % 250 == 0 {
            assert_buddy_invariant(&blocks);
        }
    }

    assert_buddy_invariant(&blocks);
    let ids = collect_ids(&blocks);
    let mut expected: Vec<u64> = live.keys().copied().collect();
    expected.sort_unstable();
    assert_eq!(ids, expected);

    // Payloads still hold at least the requested size.
    for (&id, &size) in &live {
        assert!(blocks.block_capacity(id).expect("capacity") >= size);
    }
}

#[test]
fn free_map_is_rebuilt_on_reopen() {
    let mut blocks = open_fresh();
    let mut rng = StdRng::seed_from_u64(77);
    let mut live = BTreeSet::new();
    for _ in 0..200 {
        live.insert(blocks.allocate(rng.gen_range(0..300)).expect("allocate"));
    }
    let victims: Vec<u64> = live.iter().copied().filter(|_| rng.gen::<bool>()).collect();
    for victim in victims {
        blocks.deallocate(victim).expect("deallocate");
        live.remove(&victim);
    }
    let expected: Vec<u64> = live.iter().copied().collect();

    let raw = blocks.into_inner().into_bytes();
    let reopened =
        DynamicBlockBuffer::open(MemoryBuffer::from_bytes(raw)).expect("reopen should not fail");
    assert_eq!(collect_ids(&reopened), expected);
    assert_buddy_invariant(&reopened);
}

#[test]
fn a_zeroed_region_heals_into_large_free_blocks() {
    // A crash can leave freshly grown space as raw zeros: every byte then
    // scans as a one-byte free block, and leftward coalescing folds the
    // whole region back together.
    let blocks =
        DynamicBlockBuffer::open(MemoryBuffer::from_bytes(vec![0u8; 4096]))
            .expect("open should not fail");
    assert_eq!(blocks.free_blocks(), vec![(0, 12)]);

    let mut blocks = blocks;
    assert_eq!(blocks.allocate(100).expect("allocate"), 0);
    assert_eq!(blocks.capacity().expect("capacity"), 4096);
}

#[test]
fn a_file_truncated_mid_grow_is_extended_to_a_block_boundary() {
    let mut blocks = open_fresh();
    blocks.allocate(1000).expect("allocate");
    let mut raw = blocks.into_inner().into_bytes();
    // Chop the file mid-block, as an interrupted grow would.
    raw.truncate(1500);

    let reopened =
        DynamicBlockBuffer::open(MemoryBuffer::from_bytes(raw)).expect("reopen should not fail");
    let capacity = reopened.capacity().expect("capacity");
    // The scan pushed capacity back out to cover the partial block.
    assert!(capacity >= 2048, "capacity {capacity} still mid-block");
    assert_eq!(collect_ids(&reopened), vec![0]);
}

#[test]
#[should_panic(expected = "already deallocated")]
fn double_deallocate_panics() {
    let mut blocks = open_fresh();
    let id = blocks.allocate(10).expect("allocate");
    blocks.deallocate(id).expect("deallocate");
    let _ = blocks.deallocate(id);
}

#[test]
fn unallocated_blocks_are_not_readable() {
    let mut blocks = open_fresh();
    let id = blocks.allocate(40).expect("allocate");
    blocks.deallocate(id).expect("deallocate");
    let mut scratch = [0u8; 4];
    assert!(matches!(
        blocks.get(id, 0, &mut scratch),
        Err(BlockError::NotAllocated { .. })
    ));
    assert!(matches!(
        blocks.block_capacity(id),
        Err(BlockError::NotAllocated { .. })
    ));
}

#[test]
fn oversized_requests_are_rejected() {
    let mut blocks = open_fresh();
    assert!(matches!(
        blocks.allocate(u64::MAX),
        Err(BlockError::BlockTooLarge { .. })
    ));
}

proptest! {
    /// §8.8 as a shrinkable property: whatever the interleaving of
    /// allocations and deallocations, no two free blocks of the same size
    /// class are ever left as buddies.
    #[test]
    fn buddy_invariant_holds_for_arbitrary_churn(
        steps in vec((any::<bool>(), 0u64..4096), 1..200)
    ) {
        let mut blocks = open_fresh();
        let mut live: Vec<u64> = Vec::new();

        for (allocate, value) in steps {
            if allocate || live.is_empty() {
                live.push(blocks.allocate(value).expect("allocate"));
            } else {
                let victim = live.swap_remove(value as usize % live.len());
                blocks.deallocate(victim).expect("deallocate");
            }
        }

        let free: BTreeSet<(u64, u32)> = blocks.free_blocks().into_iter().collect();
        for &(address, class) in &free {
            let buddy = address ^ (1u64 << class);
            prop_assert!(
                !free.contains(&(buddy, class)),
                "free buddies at {} and {}, class {}",
                address,
                buddy,
                class
            );
        }
    }
}
