//! # Kernel Memory Manager
//!
//! [`KernelMemory`] ties the layers together: it owns the page descriptor
//! table, the frame allocator, the virtual region tracker, the heap and the
//! page mapper, and exposes one surface over all of them.
//!
//! ```text
//!            KernelMemory
//!   ┌──────────┬──────────┬──────────────┐
//!   │   Heap   │  vmap    │ frame surface│
//!   │ slab/bud │ anon/mmio│              │
//!   └────┬─────┴────┬─────┴──────┬───────┘
//!        │  RegionTree (virtual)  │
//!        └──────────┬─────────────┘
//!         FrameAllocator + PageDescriptorTable (physical)
//! ```
//!
//! There are no globals; a kernel keeps one instance behind
//! [`LockedHeap`](crate::global::LockedHeap), tests build as many as they
//! like.

use crate::bootstrap::{ArenaError, BootstrapArena};
use crate::frame_alloc::{FrameAllocator, FrameRun};
use crate::heap::slab::{CacheId, CacheStats, SlabOccupancy};
use crate::heap::{Backing, Heap, HeapConfig, HeapError, HeapStats};
use crate::paging::{MapError, MapFlags, PageMapper};
use crate::pfn::{PageDescriptorTable, PageType};
use crate::vregion::{Region, RegionError, RegionKind, RegionTree};
use kernel_info::boot::BootMemoryMap;
use kernel_info::memory::{HEAP_WINDOW_END, HEAP_WINDOW_START, VMAP_WINDOW_END, VMAP_WINDOW_START};
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, Pfn, VirtualAddress};
use log::{debug, info, warn};

/// A half-open `[start, end)` range of kernel virtual addresses.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct Window {
    pub start: VirtualAddress,
    pub end: VirtualAddress,
}

impl Window {
    #[must_use]
    pub const fn new(start: u64, end: u64) -> Self {
        Self {
            start: VirtualAddress::new(start),
            end: VirtualAddress::new(end),
        }
    }

    /// The last address inside the window.
    #[must_use]
    pub const fn last(&self) -> VirtualAddress {
        VirtualAddress::new(self.end.as_u64() - 1)
    }

    const fn is_valid(&self) -> bool {
        self.start.as_u64() < self.end.as_u64()
            && self.start.is_page_aligned()
            && self.end.is_page_aligned()
    }
}

/// Layout and sizing of a [`KernelMemory`].
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct MemoryConfig {
    pub heap: HeapConfig,
    /// Where the heap window is reserved.
    pub heap_window: Window,
    /// Where anonymous and device mappings go.
    pub vmap_window: Window,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            heap: HeapConfig::default(),
            heap_window: Window::new(HEAP_WINDOW_START, HEAP_WINDOW_END),
            vmap_window: Window::new(VMAP_WINDOW_START, VMAP_WINDOW_END),
        }
    }
}

impl MemoryConfig {
    /// # Errors
    /// [`HeapError::InvalidConfig`] for a bad heap configuration or an
    /// empty or unaligned window.
    pub const fn validate(&self) -> Result<(), HeapError> {
        if !self.heap_window.is_valid() {
            return Err(HeapError::InvalidConfig(
                "heap window must be a non-empty page-aligned range",
            ));
        }
        if !self.vmap_window.is_valid() {
            return Err(HeapError::InvalidConfig(
                "vmap window must be a non-empty page-aligned range",
            ));
        }
        self.heap.validate()
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum VmapError {
    #[error("mapping of zero pages")]
    ZeroPages,
    #[error("no virtual range available: {0}")]
    Region(#[from] RegionError),
    #[error("out of physical frames")]
    OutOfFrames,
    #[error("page mapping failed: {0}")]
    Map(#[from] MapError),
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum InitError {
    #[error("heap initialization failed: {0}")]
    Heap(#[from] HeapError),
    #[error("bootstrap arena failed: {0}")]
    Arena(#[from] ArenaError),
    #[error("region bookkeeping failed: {0}")]
    Region(#[from] RegionError),
}

/// The kernel's physical and virtual memory state.
pub struct KernelMemory<'t, M> {
    table: PageDescriptorTable<'t>,
    frames: FrameAllocator,
    regions: RegionTree,
    heap: Heap,
    mapper: M,
    vmap: Window,
}

impl<'t, M: PageMapper> KernelMemory<'t, M> {
    /// Build the frame allocator from an already classified descriptor
    /// table and initialize the heap.
    ///
    /// # Errors
    /// An invalid `config` or a heap window that cannot be reserved.
    ///
    /// # Panics
    /// If mapping the initial heap runs out of frames.
    pub fn new(
        mut table: PageDescriptorTable<'t>,
        mut mapper: M,
        config: MemoryConfig,
    ) -> Result<Self, InitError> {
        config.validate()?;
        let mut frames = FrameAllocator::build(&mut table);
        let lower = config.heap_window.start.min(config.vmap_window.start);
        let upper = config.heap_window.last().max(config.vmap_window.last());
        let mut regions = RegionTree::new(lower, upper);

        let heap = Heap::init(
            config.heap,
            config.heap_window.start,
            config.heap_window.last(),
            &mut regions,
            &mut Backing {
                table: &mut table,
                frames: &mut frames,
                mapper: &mut mapper,
            },
        )?;

        info!(
            "memory: {} free frame(s), heap at {} ({:#x} bytes mapped)",
            frames.free_frames(),
            heap.base(),
            heap.stats().mapped_bytes
        );
        Ok(Self {
            table,
            frames,
            regions,
            heap,
            mapper,
            vmap: config.vmap_window,
        })
    }

    /// Bring up memory management from the boot memory map: carve the
    /// descriptor table out of `arena`, classify every frame, retire the
    /// arena and continue as [`new`](Self::new).
    ///
    /// # Errors
    /// Arena exhaustion, an invalid `config`, or a heap window that cannot
    /// be reserved.
    ///
    /// # Safety
    /// As [`PageDescriptorTable::bootstrap`]: the arena window must be unused
    /// and stay mapped for `'t`.
    pub unsafe fn bootstrap<B: BootMemoryMap + ?Sized>(
        boot: &B,
        mut arena: BootstrapArena,
        mut mapper: M,
        config: MemoryConfig,
    ) -> Result<Self, InitError> {
        // SAFETY: forwarded to the caller.
        let table = unsafe { PageDescriptorTable::bootstrap(boot, &mut arena, &mut mapper)? };
        let summary = arena.finish();

        let mut this = Self::new(table, mapper, config)?;
        if summary.mapped_end > summary.start {
            this.regions.insert(
                summary.start,
                summary.mapped_end,
                RegionKind::PageFrameMetadata,
                "page descriptors",
            )?;
        }
        debug!(
            "memory: descriptor table uses {} consumed range(s) at {}..{}",
            summary.consumed().len(),
            summary.start,
            summary.mapped_end
        );
        Ok(this)
    }

    fn parts(&mut self) -> (&mut Heap, Backing<'_, 't, M>) {
        (
            &mut self.heap,
            Backing {
                table: &mut self.table,
                frames: &mut self.frames,
                mapper: &mut self.mapper,
            },
        )
    }

    /// # Errors
    /// See [`Heap::allocate`].
    pub fn allocate(&mut self, size: u64) -> Result<VirtualAddress, HeapError> {
        let (heap, mut b) = self.parts();
        heap.allocate(&mut b, size)
    }

    /// # Errors
    /// See [`Heap::allocate_aligned`].
    pub fn allocate_aligned(&mut self, size: u64, align: u64) -> Result<VirtualAddress, HeapError> {
        let (heap, mut b) = self.parts();
        heap.allocate_aligned(&mut b, size, align)
    }

    /// # Errors
    /// See [`Heap::allocate_pages`].
    pub fn allocate_pages(&mut self, count: u64) -> Result<VirtualAddress, HeapError> {
        let (heap, mut b) = self.parts();
        heap.allocate_pages(&mut b, count)
    }

    /// # Errors
    /// See [`Heap::reallocate`].
    pub fn reallocate(
        &mut self,
        va: VirtualAddress,
        new_size: u64,
    ) -> Result<VirtualAddress, HeapError> {
        let (heap, mut b) = self.parts();
        heap.reallocate(&mut b, va, new_size)
    }

    /// # Errors
    /// See [`Heap::reallocate_aligned`].
    pub fn reallocate_aligned(
        &mut self,
        va: VirtualAddress,
        new_size: u64,
        align: u64,
    ) -> Result<VirtualAddress, HeapError> {
        let (heap, mut b) = self.parts();
        heap.reallocate_aligned(&mut b, va, new_size, align)
    }

    /// # Panics
    /// See [`Heap::free`].
    pub fn free(&mut self, va: VirtualAddress) {
        let (heap, mut b) = self.parts();
        heap.free(&mut b, va);
    }

    /// # Errors
    /// See [`Heap::create_cache`].
    pub fn create_cache(&mut self, name: &'static str, size: u64) -> Result<CacheId, HeapError> {
        self.heap.create_cache(name, size)
    }

    /// # Errors
    /// See [`Heap::cache_alloc`].
    pub fn cache_alloc(&mut self, id: CacheId) -> Result<VirtualAddress, HeapError> {
        let (heap, mut b) = self.parts();
        heap.cache_alloc(&mut b, id)
    }

    /// # Panics
    /// See [`Heap::cache_free`].
    pub fn cache_free(&mut self, id: CacheId, va: VirtualAddress) {
        let (heap, mut b) = self.parts();
        heap.cache_free(&mut b, id, va);
    }

    /// # Errors
    /// See [`Heap::destroy_cache`].
    pub fn destroy_cache(&mut self, id: CacheId) -> Result<(), HeapError> {
        self.heap.destroy_cache(id)
    }

    #[must_use]
    pub fn usable_size(&self, va: VirtualAddress) -> Option<u64> {
        self.heap.usable_size(&self.table, &self.mapper, va)
    }

    #[must_use]
    pub fn heap_stats(&self) -> HeapStats {
        self.heap.stats()
    }

    /// # Errors
    /// [`HeapError::UnknownCache`].
    pub fn cache_stats(&self, id: CacheId) -> Result<CacheStats, HeapError> {
        self.heap.cache_stats(id)
    }

    #[must_use]
    pub fn slab_occupancy(&self, va: VirtualAddress) -> Option<SlabOccupancy> {
        self.heap.slab_occupancy(&self.table, &self.mapper, va)
    }

    /// Allocate `count` contiguous frames as `ty`; an empty run when no free
    /// run is long enough.
    ///
    /// # Panics
    /// If `ty` is [`PageType::Unused`] or [`PageType::Heap`].
    pub fn allocate_frames(&mut self, count: u64, ty: PageType) -> FrameRun {
        assert_ne!(
            ty,
            PageType::Heap,
            "heap frames are only allocated by the heap"
        );
        let run = self.frames.allocate(&mut self.table, count, ty);
        if run.is_empty() && count > 0 {
            warn!("memory: no run of {count} free frame(s)");
        }
        run
    }

    /// Return frames obtained from [`allocate_frames`](Self::allocate_frames).
    ///
    /// # Panics
    /// On a double free, or if any frame belongs to the heap or the
    /// descriptor table.
    pub fn free_frames(&mut self, start: Pfn, count: u64) {
        for i in 0..count {
            let ty = self.table.get(start + i).page_type();
            assert!(
                !matches!(ty, PageType::Heap | PageType::PageFrameMetadata),
                "freeing frame {} owned by {ty:?}",
                start + i
            );
        }
        self.frames.free(&mut self.table, start, count);
    }

    /// Reserve `pages` pages in the vmap window, back them with fresh zeroed
    /// frames and map them.
    ///
    /// # Errors
    /// No virtual range, no frames, or a mapping failure. Nothing stays
    /// reserved or allocated on error.
    pub fn map_anonymous(
        &mut self,
        pages: u64,
        name: &'static str,
    ) -> Result<VirtualAddress, VmapError> {
        let va = self.reserve_vmap(pages, RegionKind::Anonymous, name)?;

        let mut mapped = 0;
        while mapped < pages {
            let result = self.back_pages(va.add_pages(mapped), pages - mapped);
            match result {
                Ok(count) => mapped += count,
                Err(e) => {
                    self.drop_anonymous(va, mapped);
                    self.regions.release(va);
                    warn!("memory: anonymous mapping \"{name}\" of {pages} page(s) failed: {e}");
                    return Err(e);
                }
            }
        }

        // SAFETY: the `pages` pages at `va` were just mapped writable and
        // belong to nobody else yet.
        unsafe { core::ptr::write_bytes(va.as_mut_ptr::<u8>(), 0, to_usize(pages * PAGE_SIZE)) };
        debug!("memory: mapped {pages} anonymous page(s) at {va} (\"{name}\")");
        Ok(va)
    }

    /// Map the device range of `pages` pages containing `phys` uncached into
    /// the vmap window. Returns the virtual address of `phys` itself.
    ///
    /// # Errors
    /// No virtual range or a mapping failure.
    pub fn map_mmio(
        &mut self,
        phys: PhysicalAddress,
        pages: u64,
        name: &'static str,
    ) -> Result<VirtualAddress, VmapError> {
        let va = self.reserve_vmap(pages, RegionKind::Mmio, name)?;
        let frame = phys.page_base();
        if let Err(e) = self.mapper.map(va, frame, pages, MapFlags::DEVICE) {
            self.regions.release(va);
            return Err(e.into());
        }
        debug!(
            "memory: mapped device {} ({pages} page(s)) at {va} (\"{name}\")",
            phys.page_base()
        );
        Ok(va + (phys - phys.page_base()))
    }

    /// Tear down the anonymous or device mapping containing `addr`. Frames of
    /// anonymous mappings lose a reference and are freed once unreferenced.
    ///
    /// # Panics
    /// If `addr` is not inside an anonymous or device mapping.
    pub fn unmap(&mut self, addr: VirtualAddress) -> Region {
        let Some(region) = self.regions.find(addr) else {
            panic!("unmap of {addr}, which is not mapped");
        };
        assert!(
            matches!(
                region.kind,
                RegionKind::Anonymous | RegionKind::Mmio | RegionKind::Driver
            ),
            "unmap of {addr} inside a {:?} region",
            region.kind
        );
        let region = self.regions.release(addr);
        if region.kind == RegionKind::Anonymous {
            self.drop_anonymous(region.from, region.pages());
        } else {
            self.mapper.unmap(region.from, region.pages());
        }
        debug!(
            "memory: unmapped {}..{} (\"{}\")",
            region.from,
            region.to,
            region.name
        );
        region
    }

    fn reserve_vmap(
        &mut self,
        pages: u64,
        kind: RegionKind,
        name: &'static str,
    ) -> Result<VirtualAddress, VmapError> {
        if pages == 0 {
            return Err(VmapError::ZeroPages);
        }
        let Some(size) = pages.checked_mul(PAGE_SIZE) else {
            return Err(RegionError::NoGap { size: u64::MAX }.into());
        };
        let (start, last) = (self.vmap.start, self.vmap.last());
        Ok(self.regions.reserve_within(size, PAGE_SIZE, start, last, kind, name)?)
    }

    /// Map one run of up to `wanted` fresh frames at `va`; returns how many.
    fn back_pages(&mut self, va: VirtualAddress, wanted: u64) -> Result<u64, VmapError> {
        let mut count = wanted;
        let run = loop {
            let table = &mut self.table;
            let run = self.frames.allocate(table, count, PageType::Anonymous);
            if !run.is_empty() {
                break run;
            }
            if count == 1 {
                return Err(VmapError::OutOfFrames);
            }
            count /= 2;
        };
        let pa = run.start.address();
        if let Err(e) = self.mapper.map(va, pa, run.count, MapFlags::KERNEL_DATA) {
            self.frames.free(&mut self.table, run.start, run.count);
            return Err(e.into());
        }
        Ok(run.count)
    }

    /// Unmap `pages` anonymous pages at `va`, dropping a frame reference per
    /// page.
    fn drop_anonymous(&mut self, va: VirtualAddress, pages: u64) {
        for page in 0..pages {
            let va = va.add_pages(page);
            let frame = self.mapper.translate(va).map(PhysicalAddress::pfn);
            self.mapper.unmap(va, 1);
            if let Some(pfn) = frame
                && self.table.unref_page(pfn)
            {
                self.frames.free(&mut self.table, pfn, 1);
            }
        }
    }

    #[must_use]
    pub const fn table(&self) -> &PageDescriptorTable<'t> {
        &self.table
    }

    #[must_use]
    pub const fn frames(&self) -> &FrameAllocator {
        &self.frames
    }

    #[must_use]
    pub const fn regions(&self) -> &RegionTree {
        &self.regions
    }

    #[must_use]
    pub const fn heap(&self) -> &Heap {
        &self.heap
    }

    #[must_use]
    pub const fn mapper(&self) -> &M {
        &self.mapper
    }
}

#[allow(clippy::cast_possible_truncation)]
const fn to_usize(bytes: u64) -> usize {
    bytes as usize
}
