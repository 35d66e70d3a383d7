mod common;

use common::{FIRST_FREE, check, fill, memory, small_heap};
use kernel_alloc::heap::{HeapConfig, HeapError};
use kernel_alloc::pfn::PageType;
use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};

const MIB: u64 = 1 << 20;

fn fully_mapped() -> HeapConfig {
    HeapConfig {
        max_size: MIB,
        initial_size: MIB,
        growth_step: 64 << 10,
    }
}

fn free_blocks(
    memory: &kernel_alloc::KernelMemory<'static, common::TestMapper>,
    order: u8,
) -> Vec<VirtualAddress> {
    let buddy = memory.heap().buddy();
    buddy.free_blocks(memory.table(), order).collect()
}

#[test]
fn init_maps_the_initial_size() {
    let memory = memory(FIRST_FREE + 1024, small_heap());
    let stats = memory.heap_stats();
    assert_eq!(stats.mapped_bytes, 64 << 10);
    assert_eq!(stats.free_bytes, 64 << 10);
    assert!(stats.base.is_aligned_to(MIB));
    assert_eq!(memory.table().count_by_type(PageType::Heap), 16);
    assert_eq!(memory.mapper().mapped_pages(), 16);
}

#[test]
fn one_mebibyte_heap_scenario() {
    let orders: [[usize; 3]; 6] =
        [[0, 1, 2], [0, 2, 1], [1, 0, 2], [1, 2, 0], [2, 0, 1], [2, 1, 0]];
    for order in orders {
        let mut memory = memory(FIRST_FREE + 512, fully_mapped());
        let base = memory.heap_stats().base;

        let blocks = [
            memory.allocate_pages(1).unwrap(),
            memory.allocate_pages(2).unwrap(),
            memory.allocate_pages(1).unwrap(),
        ];
        assert_eq!(blocks, [base, base + 0x2000, base + 0x1000]);
        assert_eq!(memory.usable_size(blocks[1]), Some(2 * PAGE_SIZE));

        for i in order {
            memory.free(blocks[i]);
        }
        assert_eq!(free_blocks(&memory, 8), vec![base]);
        assert_eq!(memory.heap_stats().free_bytes, MIB);
    }
}

#[test]
fn large_allocations_use_buddy_blocks() {
    let mut memory = memory(FIRST_FREE + 1024, fully_mapped());
    let a = memory.allocate(65 << 10).unwrap();
    assert_eq!(memory.usable_size(a), Some(128 << 10));
    assert!(a.is_aligned_to(128 << 10));
    let before = memory.heap_stats().free_bytes;
    memory.free(a);
    assert_eq!(memory.heap_stats().free_bytes, before + (128 << 10));
}

#[test]
fn growth_maps_an_aligned_block() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    let base = memory.heap_stats().base;

    // 256 KiB needs an aligned block above the 64 KiB already mapped
    let big = memory.allocate_pages(64).unwrap();
    assert!(big.is_aligned_to(256 << 10));
    assert!(big >= base && big < base + (512 << 10));
    assert_eq!(memory.heap_stats().mapped_bytes, 512 << 10);
    assert_eq!(memory.table().count_by_type(PageType::Heap), 128);

    memory.free(big);
    assert_eq!(memory.heap_stats().free_bytes, 512 << 10);
}

#[test]
fn growth_takes_at_least_one_step() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    let first = memory.allocate_pages(16).unwrap();
    assert_eq!(memory.heap_stats().mapped_bytes, 64 << 10);
    let second = memory.allocate_pages(1).unwrap();
    assert_eq!(memory.heap_stats().mapped_bytes, 128 << 10);
    assert_ne!(first, second);
}

#[test]
fn requests_above_the_ceiling_fail() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    assert_eq!(
        memory.allocate(2 * MIB),
        Err(HeapError::TooLarge { size: 2 * MIB })
    );
    assert_eq!(memory.allocate(0), Err(HeapError::ZeroSize));
    assert_eq!(memory.allocate_pages(0), Err(HeapError::ZeroSize));
    assert_eq!(memory.heap_stats().mapped_bytes, 64 << 10);
}

#[test]
fn huge_page_counts_are_too_large() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    assert_eq!(
        memory.allocate_pages(u64::MAX),
        Err(HeapError::TooLarge { size: u64::MAX })
    );
    assert_eq!(
        memory.allocate_pages((1 << 63) + 1),
        Err(HeapError::TooLarge { size: u64::MAX })
    );
    assert_eq!(
        memory.allocate(u64::MAX),
        Err(HeapError::TooLarge { size: u64::MAX })
    );
    assert_eq!(memory.heap_stats().mapped_bytes, 64 << 10);
}

#[test]
fn aligned_allocations() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    let a = memory.allocate_aligned(8, 4096).unwrap();
    assert!(a.is_aligned_to(4096));
    let b = memory.allocate_aligned(100, 64 << 10).unwrap();
    assert!(b.is_aligned_to(64 << 10));
    let c = memory.allocate_aligned(24, 16).unwrap();
    assert!(c.is_aligned_to(16));
    assert_eq!(
        memory.allocate_aligned(8, 3),
        Err(HeapError::InvalidAlignment(3))
    );

    memory.free(a);
    memory.free(b);
    memory.free(c);
    assert_eq!(memory.heap_stats().live_objects, 0);
}

#[test]
fn reallocate_moves_and_keeps_contents() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    let a = memory.allocate(24).unwrap();
    fill(a, 24, 7);

    // still fits the 32-byte class
    assert_eq!(memory.reallocate(a, 30), Ok(a));

    let b = memory.reallocate(a, 200).unwrap();
    assert_ne!(a, b);
    assert_eq!(memory.usable_size(b), Some(256));
    assert!(check(b, 24, 7));

    let c = memory.reallocate(b, 20 << 10).unwrap();
    assert_eq!(memory.usable_size(c), Some(32 << 10));
    assert!(check(c, 24, 7));
    memory.free(c);
    assert_eq!(memory.heap_stats().live_objects, 0);
}

#[test]
fn failed_reallocate_keeps_the_original() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    let a = memory.allocate(100).unwrap();
    fill(a, 100, 3);
    assert_eq!(
        memory.reallocate(a, 4 * MIB),
        Err(HeapError::TooLarge { size: 4 * MIB })
    );
    assert_eq!(memory.usable_size(a), Some(128));
    assert!(check(a, 100, 3));
    memory.free(a);
}

#[test]
fn usable_size_of_foreign_addresses() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    let a = memory.allocate(64).unwrap();
    assert_eq!(memory.usable_size(a), Some(64));
    assert_eq!(memory.usable_size(a + 8), None);
    assert_eq!(memory.usable_size(VirtualAddress::new(0x1000)), None);
}

#[test]
#[should_panic(expected = "kernel heap exhausted")]
fn hitting_the_ceiling_is_fatal() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    let _low = memory.allocate_pages(128).unwrap();
    let _high = memory.allocate_pages(128).unwrap();
    assert_eq!(memory.heap_stats().mapped_bytes, MIB);
    let _ = memory.allocate_pages(1);
}

#[test]
#[should_panic(expected = "out of physical memory")]
fn running_out_of_frames_while_growing_is_fatal() {
    // 16 frames for the initial heap and 16 to spare
    let mut memory = memory(FIRST_FREE + 32, small_heap());
    let _ = memory.allocate_pages(32);
}

#[test]
#[should_panic(expected = "double free")]
fn double_free_of_a_block_is_fatal() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    let a = memory.allocate_pages(2).unwrap();
    let _keep = memory.allocate_pages(2).unwrap();
    memory.free(a);
    memory.free(a);
}

#[test]
#[should_panic(expected = "outside the heap")]
fn freeing_a_foreign_address_is_fatal() {
    let mut memory = memory(FIRST_FREE + 1024, small_heap());
    memory.free(VirtualAddress::new(0x1000));
}
