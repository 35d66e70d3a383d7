//! # Global Allocator
//!
//! [`LockedHeap`] puts a [`KernelMemory`] behind a spin lock and implements
//! [`GlobalAlloc`] on top of it, so a kernel can install it with
//! `#[global_allocator]`:
//!
//! ```ignore
//! #[global_allocator]
//! static HEAP: LockedHeap<KernelPageMapper> = LockedHeap::empty();
//!
//! HEAP.init(unsafe { KernelMemory::bootstrap(&boot, arena, mapper, MemoryConfig::default())? });
//! ```
//!
//! The lock does not mask interrupts. Code that may allocate from interrupt
//! context must disable interrupts around its own allocations.

use crate::manager::KernelMemory;
use crate::paging::PageMapper;
use core::alloc::{GlobalAlloc, Layout};
use core::ptr;
use kernel_memory_addresses::VirtualAddress;
use log::warn;
use spin::{Mutex, MutexGuard};

/// A lockable, initially empty slot for the kernel's memory manager.
pub struct LockedHeap<M> {
    inner: Mutex<Option<KernelMemory<'static, M>>>,
}

impl<M> Default for LockedHeap<M> {
    fn default() -> Self {
        Self::empty()
    }
}

impl<M> LockedHeap<M> {
    /// An uninitialized heap; every allocation fails until [`init`](Self::init).
    #[must_use]
    pub const fn empty() -> Self {
        Self {
            inner: Mutex::new(None),
        }
    }

    /// Install `memory`, returning the previously installed one.
    pub fn init(&self, memory: KernelMemory<'static, M>) -> Option<KernelMemory<'static, M>> {
        self.inner.lock().replace(memory)
    }

    /// Whether a memory manager is installed.
    #[must_use]
    pub fn is_initialized(&self) -> bool {
        self.inner.lock().is_some()
    }

    /// Lock the slot for direct access.
    pub fn lock(&self) -> MutexGuard<'_, Option<KernelMemory<'static, M>>> {
        self.inner.lock()
    }

    /// Run `f` on the installed manager under the lock.
    pub fn with<R>(&self, f: impl FnOnce(&mut KernelMemory<'static, M>) -> R) -> Option<R> {
        self.inner.lock().as_mut().map(f)
    }
}

unsafe impl<M: PageMapper> GlobalAlloc for LockedHeap<M> {
    unsafe fn alloc(&self, layout: Layout) -> *mut u8 {
        self.with(|memory| memory.allocate_aligned(layout.size() as u64, layout.align() as u64))
            .and_then(|result| {
                result
                    .inspect_err(|e| warn!("global alloc of {layout:?} failed: {e}"))
                    .ok()
            })
            .map_or(ptr::null_mut(), VirtualAddress::as_mut_ptr)
    }

    unsafe fn dealloc(&self, ptr: *mut u8, _layout: Layout) {
        if ptr.is_null() {
            return;
        }
        self.with(|memory| memory.free(VirtualAddress::from_ptr(ptr)));
    }

    unsafe fn realloc(&self, ptr: *mut u8, layout: Layout, new_size: usize) -> *mut u8 {
        let va = VirtualAddress::from_ptr(ptr);
        self.with(|memory| memory.reallocate_aligned(va, new_size as u64, layout.align() as u64))
            .and_then(Result::ok)
            .map_or(ptr::null_mut(), VirtualAddress::as_mut_ptr)
    }
}
