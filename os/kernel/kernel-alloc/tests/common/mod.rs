//! Host fixture: heap and vmap windows carved out of leaked host memory, a
//! page mapper that only records mappings, and a descriptor table whose
//! frames from [`FIRST_FREE`] upward are free.

#![allow(dead_code)]

use kernel_alloc::heap::HeapConfig;
use kernel_alloc::manager::{KernelMemory, MemoryConfig, Window};
use kernel_alloc::paging::{MapError, MapFlags, PageMapper};
use kernel_alloc::pfn::{PageDescriptor, PageDescriptorTable, PageFlags, PageType};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Pfn, VirtualAddress};
use std::alloc::Layout;
use std::collections::BTreeMap;

/// Frames below this stay reserved.
pub const FIRST_FREE: u64 = 256;

/// Pages in the vmap window of [`memory`].
pub const VMAP_PAGES: u64 = 64;

/// Host memory that stays valid for the rest of the test run.
pub fn host_window(size: u64, align: u64) -> Window {
    let layout = Layout::from_size_align(size as usize, align as usize).unwrap();
    let ptr = unsafe { std::alloc::alloc_zeroed(layout) };
    assert!(!ptr.is_null(), "host allocation of {size:#x} bytes failed");
    let start = ptr as u64;
    Window::new(start, start + size)
}

/// Records mappings; the memory behind a virtual address is whatever host
/// memory is there, physical addresses are never dereferenced.
#[derive(Default)]
pub struct TestMapper {
    pages: BTreeMap<u64, (u64, MapFlags)>,
    /// Successful `map` calls left before every further call fails.
    pub fail_after: Option<usize>,
}

impl TestMapper {
    pub fn failing_after(calls: usize) -> Self {
        Self {
            pages: BTreeMap::new(),
            fail_after: Some(calls),
        }
    }

    pub fn flags(&self, va: VirtualAddress) -> Option<MapFlags> {
        let page = va.page_base().as_u64();
        self.pages.get(&page).map(|&(_, flags)| flags)
    }

    pub fn mapped_pages(&self) -> usize {
        self.pages.len()
    }
}

unsafe impl PageMapper for TestMapper {
    fn map(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: u64,
        flags: MapFlags,
    ) -> Result<(), MapError> {
        if !va.is_page_aligned() || !pa.is_page_aligned() {
            return Err(MapError::Unaligned);
        }
        if let Some(left) = self.fail_after.as_mut() {
            if *left == 0 {
                return Err(MapError::OutOfMemory);
            }
            *left -= 1;
        }
        let mut targets = (0..count).map(|i| va.add_pages(i));
        if let Some(taken) = targets.find(|v| self.pages.contains_key(&v.as_u64())) {
            return Err(MapError::AlreadyMapped(taken));
        }
        for i in 0..count {
            let offset = i * PAGE_SIZE;
            let (page, frame) = (va.as_u64() + offset, pa.as_u64() + offset);
            self.pages.insert(page, (frame, flags));
        }
        Ok(())
    }

    fn unmap(&mut self, va: VirtualAddress, count: u64) {
        for i in 0..count {
            self.pages.remove(&(va.as_u64() + i * PAGE_SIZE));
        }
    }

    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress> {
        self.pages
            .get(&va.page_base().as_u64())
            .map(|&(pa, _)| PhysicalAddress::new(pa + va.page_offset()))
    }
}

/// A table of `frames` descriptors, free from [`FIRST_FREE`] on.
pub fn table(frames: u64) -> PageDescriptorTable<'static> {
    let entries = Box::leak(vec![PageDescriptor::default(); frames as usize].into_boxed_slice());
    let mut table = PageDescriptorTable::new(entries);
    table.mark_range(
        Pfn::new(FIRST_FREE),
        Pfn::new(frames),
        PageType::Unused,
        0,
        PageFlags::empty(),
    );
    table
}

/// 1 MiB ceiling, 64 KiB mapped up front, growing 64 KiB at a time.
pub fn small_heap() -> HeapConfig {
    HeapConfig {
        max_size: 1 << 20,
        initial_size: 64 << 10,
        growth_step: 64 << 10,
    }
}

pub fn config(heap: HeapConfig) -> MemoryConfig {
    MemoryConfig {
        heap,
        heap_window: host_window(heap.max_size, heap.max_size),
        vmap_window: host_window(VMAP_PAGES * PAGE_SIZE, PAGE_SIZE),
    }
}

/// A memory manager over `frames` frames with the given heap sizing.
pub fn memory(frames: u64, heap: HeapConfig) -> KernelMemory<'static, TestMapper> {
    KernelMemory::new(table(frames), TestMapper::default(), config(heap)).expect("memory init")
}

pub fn fill(va: VirtualAddress, len: u64, seed: u8) {
    for i in 0..len {
        let byte = seed.wrapping_add(i as u8);
        unsafe { va.as_mut_ptr::<u8>().add(i as usize).write(byte) };
    }
}

pub fn check(va: VirtualAddress, len: u64, seed: u8) -> bool {
    (0..len).all(|i| {
        let byte = unsafe { va.as_mut_ptr::<u8>().add(i as usize).read() };
        byte == seed.wrapping_add(i as u8)
    })
}
