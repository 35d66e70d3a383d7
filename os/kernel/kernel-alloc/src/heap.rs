//! # Kernel Heap
//!
//! The heap lives in a virtual window of `max_size` bytes reserved from the
//! region tracker. Only a prefix of the window is backed by frames; the heap
//! grows upward from its base when an allocation cannot be served.
//!
//! ```text
//!   base                         top                         base + max_size
//!   ├──────── mapped ─────────────┼──────── reserved, unmapped ─────────┤
//!   │ buddy blocks / slabs        │ ← grows in growth_step increments  │
//! ```
//!
//! Requests of up to 64 KiB go to the [`slab`] size classes; larger ones are
//! served as whole [`buddy`] blocks. The window base is aligned to
//! `max_size`, so every buddy block is aligned to its own size and every
//! general slab object to its class size. Aligned allocation relies on that.
//!
//! Running out of frames, hitting the ceiling or failing to map while growing
//! are fatal: a kernel that cannot extend its heap has nowhere to go.

pub mod buddy;
pub mod slab;

use crate::frame_alloc::{FrameAllocator, FrameRun};
use crate::paging::{MapFlags, PageMapper};
use crate::pfn::{HeapPage, PageDescriptorTable, PageType};
use crate::vregion::{RegionError, RegionKind, RegionTree};
use buddy::{BuddyAllocator, block_bytes, order_for_pages};
use kernel_info::memory::{
    HEAP_DEFAULT_GROWTH_STEP, HEAP_DEFAULT_INITIAL_SIZE, HEAP_DEFAULT_MAX_SIZE, HEAP_MAX_BLOCK,
};
use kernel_memory_addresses::{PAGE_SIZE, Pfn, VirtualAddress, align_up, pages_for};
use log::{debug, error, trace, warn};
use slab::{CacheId, CacheStats, SlabAllocator, SlabOccupancy, class_for};

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum HeapError {
    #[error("zero-sized allocation")]
    ZeroSize,
    #[error("allocation of {size} bytes exceeds the heap ceiling")]
    TooLarge { size: u64 },
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u64),
    #[error("invalid heap configuration: {0}")]
    InvalidConfig(&'static str),
    #[error("no free slot for another slab cache")]
    CacheTableFull,
    #[error("unknown slab cache")]
    UnknownCache,
    #[error("slab cache still has {live} live object(s)")]
    CacheBusy { live: u64 },
    #[error("cannot reserve the heap window: {0}")]
    Region(#[from] RegionError),
}

/// Sizing of the heap window.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapConfig {
    /// Size of the reserved window; a power of two. Also the alignment of
    /// the window base.
    pub max_size: u64,
    /// Bytes mapped at initialization.
    pub initial_size: u64,
    /// Minimum number of bytes mapped per growth.
    pub growth_step: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            max_size: HEAP_DEFAULT_MAX_SIZE,
            initial_size: HEAP_DEFAULT_INITIAL_SIZE,
            growth_step: HEAP_DEFAULT_GROWTH_STEP,
        }
    }
}

impl HeapConfig {
    /// # Errors
    /// [`HeapError::InvalidConfig`] naming the first violated constraint.
    pub const fn validate(&self) -> Result<(), HeapError> {
        if !self.max_size.is_power_of_two() || self.max_size < PAGE_SIZE {
            return Err(HeapError::InvalidConfig(
                "max_size must be a power of two of at least one page",
            ));
        }
        if self.max_size > HEAP_MAX_BLOCK {
            return Err(HeapError::InvalidConfig("max_size exceeds the largest buddy block"));
        }
        if self.initial_size > self.max_size {
            return Err(HeapError::InvalidConfig("initial_size exceeds max_size"));
        }
        if !self.initial_size.is_multiple_of(PAGE_SIZE) {
            return Err(HeapError::InvalidConfig("initial_size must be page aligned"));
        }
        if self.growth_step == 0 || !self.growth_step.is_multiple_of(PAGE_SIZE) {
            return Err(HeapError::InvalidConfig(
                "growth_step must be a non-zero multiple of the page size",
            ));
        }
        Ok(())
    }
}

/// A snapshot of the heap's counters.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct HeapStats {
    pub base: VirtualAddress,
    /// Bytes of the window backed by frames.
    pub mapped_bytes: u64,
    pub max_size: u64,
    /// Bytes sitting on buddy free lists.
    pub free_bytes: u64,
    pub slabs: u64,
    pub live_objects: u64,
}

/// What the heap needs from its owner to grow and to find descriptors.
pub struct Backing<'a, 't, M> {
    pub table: &'a mut PageDescriptorTable<'t>,
    pub frames: &'a mut FrameAllocator,
    pub mapper: &'a mut M,
}

/// Buddy blocks and slab caches over a growable window.
#[derive(Debug)]
pub struct Heap {
    base: VirtualAddress,
    top: VirtualAddress,
    config: HeapConfig,
    buddy: BuddyAllocator,
    slabs: SlabAllocator,
}

impl Heap {
    /// Reserve the heap window inside `[window_start, window_end_inclusive]`
    /// and map its first `initial_size` bytes.
    ///
    /// # Errors
    /// An invalid `config`, or no suitably aligned gap for the window.
    ///
    /// # Panics
    /// If the initial mapping runs out of frames or fails to map.
    pub fn init<M: PageMapper, const N: usize>(
        config: HeapConfig,
        window_start: VirtualAddress,
        window_end_inclusive: VirtualAddress,
        regions: &mut RegionTree<N>,
        b: &mut Backing<'_, '_, M>,
    ) -> Result<Self, HeapError> {
        config.validate()?;
        let base = regions.reserve_within(
            config.max_size,
            config.max_size,
            window_start,
            window_end_inclusive,
            RegionKind::Heap,
            "kernel heap",
        )?;

        let mut heap = Self {
            base,
            top: base,
            config,
            buddy: BuddyAllocator::new(base, config.max_size),
            slabs: SlabAllocator::new(),
        };
        if config.initial_size > 0 {
            heap.map_range(b, base + config.initial_size);
        }
        debug!(
            "heap: window {base}..{} with {:#x} bytes mapped",
            base + config.max_size,
            config.initial_size
        );
        Ok(heap)
    }

    #[must_use]
    pub const fn base(&self) -> VirtualAddress {
        self.base
    }

    /// End of the mapped part of the window.
    #[must_use]
    pub const fn top(&self) -> VirtualAddress {
        self.top
    }

    #[must_use]
    pub const fn config(&self) -> &HeapConfig {
        &self.config
    }

    /// Whether `va` lies in the mapped part of the window.
    #[must_use]
    pub fn contains(&self, va: VirtualAddress) -> bool {
        self.base <= va && va < self.top
    }

    /// Allocate `size` bytes: a slab object up to 64 KiB, a buddy block
    /// above.
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`], or [`HeapError::TooLarge`] beyond the window.
    ///
    /// # Panics
    /// If the heap has to grow and cannot.
    pub fn allocate<M: PageMapper>(
        &mut self,
        b: &mut Backing<'_, '_, M>,
        size: u64,
    ) -> Result<VirtualAddress, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        match class_for(size) {
            Some(class) => self.cache_alloc(b, class),
            None => self.allocate_block(b, pages_for(size), size),
        }
    }

    /// Allocate `size` bytes aligned to `align`.
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate), plus
    /// [`HeapError::InvalidAlignment`] for a non-power-of-two `align`.
    ///
    /// # Panics
    /// If the heap has to grow and cannot.
    pub fn allocate_aligned<M: PageMapper>(
        &mut self,
        b: &mut Backing<'_, '_, M>,
        size: u64,
        align: u64,
    ) -> Result<VirtualAddress, HeapError> {
        if !align.is_power_of_two() {
            return Err(HeapError::InvalidAlignment(align));
        }
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        // classes and blocks are aligned to their own size
        self.allocate(b, size.max(align))
    }

    /// Allocate `count` pages as one buddy block.
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`] or [`HeapError::TooLarge`].
    ///
    /// # Panics
    /// If the heap has to grow and cannot.
    pub fn allocate_pages<M: PageMapper>(
        &mut self,
        b: &mut Backing<'_, '_, M>,
        count: u64,
    ) -> Result<VirtualAddress, HeapError> {
        if count == 0 {
            return Err(HeapError::ZeroSize);
        }
        self.allocate_block(b, count, count.saturating_mul(PAGE_SIZE))
    }

    /// Resize the allocation at `va`, see
    /// [`reallocate_aligned`](Self::reallocate_aligned).
    ///
    /// # Errors
    /// As [`allocate`](Self::allocate).
    ///
    /// # Panics
    /// If `va` is not a live heap allocation.
    pub fn reallocate<M: PageMapper>(
        &mut self,
        b: &mut Backing<'_, '_, M>,
        va: VirtualAddress,
        new_size: u64,
    ) -> Result<VirtualAddress, HeapError> {
        self.reallocate_aligned(b, va, new_size, 1)
    }

    /// Resize the allocation at `va` to `new_size` bytes aligned to `align`.
    /// Returns `va` itself when it already fits; otherwise moves the contents
    /// to a new allocation and frees the old one. On error the original
    /// allocation is untouched.
    ///
    /// # Errors
    /// As [`allocate_aligned`](Self::allocate_aligned).
    ///
    /// # Panics
    /// If `va` is not a live heap allocation.
    #[allow(clippy::cast_possible_truncation)]
    pub fn reallocate_aligned<M: PageMapper>(
        &mut self,
        b: &mut Backing<'_, '_, M>,
        va: VirtualAddress,
        new_size: u64,
        align: u64,
    ) -> Result<VirtualAddress, HeapError> {
        let Some(capacity) = self.usable_size(b.table, &*b.mapper, va) else {
            panic!("reallocate of {va}, which is not a live heap allocation");
        };
        if new_size != 0 && new_size <= capacity && va.is_aligned_to(align) {
            return Ok(va);
        }

        let new = self.allocate_aligned(b, new_size, align)?;
        let bytes = capacity.min(new_size);
        // SAFETY: both ranges are live, mapped heap allocations of at least
        // `bytes` bytes, and distinct allocations never overlap.
        unsafe {
            core::ptr::copy_nonoverlapping(
                va.as_mut_ptr::<u8>(),
                new.as_mut_ptr::<u8>(),
                bytes as usize,
            );
        }
        self.free(b, va);
        trace!("heap: moved {va} to {new} ({bytes} bytes)");
        Ok(new)
    }

    /// Return the allocation at `va` to the slab or buddy layer it came from.
    ///
    /// # Panics
    /// If `va` is outside the heap, or not an allocated object or block.
    pub fn free<M: PageMapper>(&mut self, b: &mut Backing<'_, '_, M>, va: VirtualAddress) {
        assert!(self.contains(va), "free of {va}, which is outside the heap");
        let mapper = &*b.mapper;
        let pfn = frame_of(mapper, va.page_base());
        let page = b.table.get(pfn).heap_page().copied();
        match page {
            Some(HeapPage::Slab(_) | HeapPage::SlabTail { .. }) => {
                self.slabs.free(b.table, mapper, &mut self.buddy, va, None);
            }
            Some(HeapPage::Buddy(_)) => self.buddy.free(b.table, mapper, va),
            _ => panic!("free of {va}, which is not a heap allocation"),
        }
    }

    /// Bytes usable at `va`: the object size of a slab object or the size of
    /// a buddy block. `None` for anything else.
    #[must_use]
    pub fn usable_size<M: PageMapper>(
        &self,
        table: &PageDescriptorTable<'_>,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<u64> {
        if !self.contains(va) {
            return None;
        }
        let pfn = mapper.translate(va.page_base())?.pfn();
        match table.get(pfn).heap_page()? {
            HeapPage::Slab(_) | HeapPage::SlabTail { .. } => {
                self.slabs.usable_size(table, mapper, va)
            }
            HeapPage::Buddy(_) => self.buddy.block_size(table, mapper, va),
            _ => None,
        }
    }

    /// Register a custom slab cache.
    ///
    /// # Errors
    /// See [`SlabAllocator::create_cache`].
    pub fn create_cache(&mut self, name: &'static str, size: u64) -> Result<CacheId, HeapError> {
        self.slabs.create_cache(name, size)
    }

    /// Allocate one object from cache `id`.
    ///
    /// # Errors
    /// [`HeapError::UnknownCache`].
    ///
    /// # Panics
    /// If the heap has to grow and cannot.
    pub fn cache_alloc<M: PageMapper>(
        &mut self,
        b: &mut Backing<'_, '_, M>,
        id: CacheId,
    ) -> Result<VirtualAddress, HeapError> {
        if let Some(va) = self.slab_alloc(b, id)? {
            return Ok(va);
        }
        let bytes = self.slabs.slab_bytes(id)?;
        self.grow(b, bytes);
        match self.slab_alloc(b, id)? {
            Some(va) => Ok(va),
            None => exhausted(bytes),
        }
    }

    /// Return an object to cache `id`.
    ///
    /// # Panics
    /// If `va` is not an object of cache `id`.
    pub fn cache_free<M: PageMapper>(
        &mut self,
        b: &mut Backing<'_, '_, M>,
        id: CacheId,
        va: VirtualAddress,
    ) {
        assert!(
            self.contains(va),
            "cache free of {va}, which is outside the heap"
        );
        let buddy = &mut self.buddy;
        self.slabs.free(b.table, &*b.mapper, buddy, va, Some(id));
    }

    /// Remove an empty custom cache.
    ///
    /// # Errors
    /// See [`SlabAllocator::destroy_cache`].
    pub fn destroy_cache(&mut self, id: CacheId) -> Result<(), HeapError> {
        self.slabs.destroy_cache(id)
    }

    /// # Errors
    /// [`HeapError::UnknownCache`].
    pub fn cache_stats(&self, id: CacheId) -> Result<CacheStats, HeapError> {
        self.slabs.stats(id)
    }

    /// Occupancy of the slab holding `va`.
    #[must_use]
    pub fn slab_occupancy<M: PageMapper>(
        &self,
        table: &PageDescriptorTable<'_>,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<SlabOccupancy> {
        if !self.contains(va) {
            return None;
        }
        self.slabs.occupancy(table, mapper, va)
    }

    #[must_use]
    pub fn stats(&self) -> HeapStats {
        HeapStats {
            base: self.base,
            mapped_bytes: self.top - self.base,
            max_size: self.config.max_size,
            free_bytes: self.buddy.free_bytes(),
            slabs: self.slabs.slab_count(),
            live_objects: self.slabs.live_objects(),
        }
    }

    /// The buddy layer, for inspection.
    #[must_use]
    pub const fn buddy(&self) -> &BuddyAllocator {
        &self.buddy
    }

    fn slab_alloc<M: PageMapper>(
        &mut self,
        b: &mut Backing<'_, '_, M>,
        id: CacheId,
    ) -> Result<Option<VirtualAddress>, HeapError> {
        let buddy = &mut self.buddy;
        self.slabs.allocate(id, b.table, &*b.mapper, buddy)
    }

    fn allocate_block<M: PageMapper>(
        &mut self,
        b: &mut Backing<'_, '_, M>,
        pages: u64,
        size: u64,
    ) -> Result<VirtualAddress, HeapError> {
        let order = order_for_pages(pages)
            .filter(|&order| order <= self.buddy.top_order())
            .filter(|&order| block_bytes(order) <= self.config.max_size);
        let Some(order) = order else {
            warn!("heap: refusing {size}-byte allocation above the ceiling");
            return Err(HeapError::TooLarge { size });
        };
        if let Some(va) = self.buddy.allocate(b.table, &*b.mapper, order) {
            return Ok(va);
        }
        self.grow(b, block_bytes(order));
        match self.buddy.allocate(b.table, &*b.mapper, order) {
            Some(va) => Ok(va),
            None => exhausted(block_bytes(order)),
        }
    }

    /// Map enough of the window that an aligned `block`-byte block fits above
    /// the current top, and at least `growth_step` bytes.
    fn grow<M: PageMapper>(&mut self, b: &mut Backing<'_, '_, M>, block: u64) {
        let used = self.top - self.base;
        let wanted = align_up(used, block) + block;
        let step = used + self.config.growth_step;
        let target = wanted.max(step).min(self.config.max_size);
        if target < wanted {
            error!(
                "heap: {block:#x}-byte block above the {:#x}-byte ceiling ({used:#x} mapped)",
                self.config.max_size
            );
            panic!("kernel heap exhausted");
        }
        debug!("heap: growing from {used:#x} to {target:#x} bytes");
        self.map_range(b, self.base + target);
    }

    /// Back `[top, end)` with frames, then hand it to the buddy allocator.
    fn map_range<M: PageMapper>(&mut self, b: &mut Backing<'_, '_, M>, end: VirtualAddress) {
        let start = self.top;
        let mut va = start;
        while va < end {
            let remaining = (end - va) / PAGE_SIZE;
            let run = take_frames(b, remaining);
            let pa = run.start.address();
            let mapped = b.mapper.map(va, pa, run.count, MapFlags::KERNEL_DATA);
            if let Err(e) = mapped {
                error!("heap: mapping {} frame(s) at {va} failed: {e}", run.count);
                panic!("kernel heap growth failed: {e}");
            }
            trace!("heap: frames {}..{} mapped at {va}", run.start, run.end());
            va = va.add_pages(run.count);
        }
        self.top = end;
        self.buddy.add_range(b.table, &*b.mapper, start, end);
    }
}

/// The longest run of up to `wanted` frames, halving the request on short
/// runs.
fn take_frames<M>(b: &mut Backing<'_, '_, M>, wanted: u64) -> FrameRun {
    let mut count = wanted;
    loop {
        let run = b.frames.allocate(b.table, count, PageType::Heap);
        if !run.is_empty() {
            return run;
        }
        if count == 1 {
            error!("heap: out of physical frames ({wanted} page(s) still unmapped)");
            panic!("out of physical memory while growing the kernel heap");
        }
        warn!(
            "heap: no run of {count} frame(s), retrying with {}",
            count / 2
        );
        count /= 2;
    }
}

fn exhausted(bytes: u64) -> ! {
    error!("heap: no {bytes:#x}-byte block after growing");
    panic!("kernel heap exhausted");
}

/// The frame backing heap address `va`.
///
/// # Panics
/// If `va` is unmapped; heap addresses always are.
pub(crate) fn frame_of<M: PageMapper + ?Sized>(mapper: &M, va: VirtualAddress) -> Pfn {
    match mapper.translate(va) {
        Some(pa) => pa.pfn(),
        None => panic!("heap address {va} is not mapped"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        assert_eq!(HeapConfig::default().validate(), Ok(()));
    }

    #[test]
    fn config_validation() {
        let ok = HeapConfig {
            max_size: 1 << 20,
            initial_size: 0,
            growth_step: PAGE_SIZE,
        };
        assert_eq!(ok.validate(), Ok(()));

        let max = |max_size| HeapConfig { max_size, ..ok };
        let initial = |initial_size| HeapConfig { initial_size, ..ok };
        let step = |growth_step| HeapConfig { growth_step, ..ok };
        let bad = [
            max(3 << 20),
            max(1024),
            max(HEAP_MAX_BLOCK << 1),
            initial(2 << 20),
            initial(100),
            step(0),
            step(10),
        ];
        for config in bad {
            assert!(
                matches!(config.validate(), Err(HeapError::InvalidConfig(_))),
                "{config:?}"
            );
        }
    }
}
