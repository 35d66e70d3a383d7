mod common;

use common::{FIRST_FREE, TestMapper, memory, small_heap};
use core::alloc::{GlobalAlloc, Layout};
use kernel_alloc::LockedHeap;
use kernel_memory_addresses::VirtualAddress;

#[test]
fn uninitialized_heap_returns_null() {
    let heap = LockedHeap::<TestMapper>::empty();
    assert!(!heap.is_initialized());
    let layout = Layout::from_size_align(64, 8).unwrap();
    assert!(unsafe { heap.alloc(layout) }.is_null());
}

#[test]
fn alloc_realloc_dealloc() {
    let heap = LockedHeap::empty();
    assert!(heap.init(memory(FIRST_FREE + 1024, small_heap())).is_none());

    let layout = Layout::from_size_align(100, 8).unwrap();
    let p = unsafe { heap.alloc(layout) };
    assert!(!p.is_null());
    assert!(p.cast::<u64>().is_aligned());
    unsafe { p.write_bytes(0x5A, 100) };

    let q = unsafe { heap.realloc(p, layout, 5000) };
    assert!(!q.is_null());
    assert!((0..100).all(|i| unsafe { q.add(i).read() } == 0x5A));
    assert_eq!(heap.with(|m| m.heap_stats().live_objects), Some(1));

    unsafe { heap.dealloc(q, Layout::from_size_align(5000, 8).unwrap()) };
    assert_eq!(heap.with(|m| m.heap_stats().live_objects), Some(0));
}

#[test]
fn zeroed_and_over_aligned_allocations() {
    let heap = LockedHeap::empty();
    heap.init(memory(FIRST_FREE + 1024, small_heap()));

    let layout = Layout::from_size_align(3000, 4096).unwrap();
    let p = unsafe { heap.alloc_zeroed(layout) };
    assert!(!p.is_null());
    assert_eq!(p as usize % 4096, 0);
    assert!((0..3000).all(|i| unsafe { p.add(i).read() } == 0));
    unsafe { heap.dealloc(p, layout) };
}

#[test]
fn failures_return_null() {
    let heap = LockedHeap::empty();
    heap.init(memory(FIRST_FREE + 1024, small_heap()));

    let huge = Layout::from_size_align(4 << 20, 8).unwrap();
    assert!(unsafe { heap.alloc(huge) }.is_null());

    let layout = Layout::from_size_align(16, 8).unwrap();
    let p = unsafe { heap.alloc(layout) };
    assert!(unsafe { heap.realloc(p, layout, 4 << 20) }.is_null());
    // the original allocation survives a failed realloc
    let va = VirtualAddress::from_ptr(p);
    assert_eq!(heap.with(|m| m.usable_size(va)), Some(Some(16)));
    unsafe { heap.dealloc(p, layout) };
}

#[test]
fn vec_through_the_global_interface() {
    let heap = LockedHeap::empty();
    heap.init(memory(FIRST_FREE + 1024, small_heap()));

    let layout = Layout::array::<u32>(1000).unwrap();
    let p = unsafe { heap.alloc(layout) }.cast::<u32>();
    for i in 0..1000 {
        unsafe { p.add(i).write(i as u32 * 3) };
    }
    let sum: u64 = (0..1000).map(|i| u64::from(unsafe { p.add(i).read() })).sum();
    assert_eq!(sum, 3 * 999 * 1000 / 2);
    unsafe { heap.dealloc(p.cast(), layout) };
    assert_eq!(heap.with(|m| m.heap_stats().slabs), Some(0));
}
