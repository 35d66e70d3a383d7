//! # Page Descriptor Table
//!
//! One [`PageDescriptor`] per physical frame, indexed by [`Pfn`]. Every layer
//! above keeps its bookkeeping in here: the frame allocator threads free runs
//! through the descriptors, the buddy allocator its free lists, the slab
//! allocator its partial-slab lists.
//!
//! The descriptor's payload is a tagged enum ([`PageState`]); the tag *is* the
//! page type, so a descriptor can never be read through the wrong
//! interpretation. Typed accessors return `None` for any other variant.

use crate::bootstrap::{ArenaError, BootstrapArena};
use crate::paging::PageMapper;
use core::mem::{align_of, size_of};
use kernel_info::boot::BootMemoryMap;
use kernel_info::memory::LOW_MEMORY_LIMIT;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalRange, Pfn, VirtualAddress};
use log::debug;

/// Fieldless tag of a [`PageState`], used wherever a caller names a type
/// without supplying a payload.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum PageType {
    Unused,
    Reserved,
    KernelImage,
    PageTable,
    PageFrameMetadata,
    Heap,
    Mmio,
    Driver,
    Anonymous,
}

bitflags::bitflags! {
    /// Per-frame attribute bits.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct PageFlags: u16 {
        /// The virtual block this frame heads is on a buddy free list.
        const VIRTUALLY_FREE  = 1 << 0;
        /// The frame backs the buddy-managed heap.
        const IS_BUDDY        = 1 << 1;
        /// First frame of a heap block: a buddy block head or a slab head.
        const IS_HEAD         = 1 << 2;
        /// Mapped for user mode; absent means kernel only.
        const USER            = 1 << 3;
        const READ_ONLY       = 1 << 4;
        const NO_EXEC         = 1 << 5;
        const IDENTITY_MAPPED = 1 << 6;
    }
}

/// Free-run bookkeeping of an [`PageState::Unused`] frame.
///
/// Only the first and the last frame of a run carry a count; the list links
/// live in the first frame only. A run of one frame is a single `Head`.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum FreeRun {
    /// Interior frame of a run, or a frame not yet threaded into any run.
    #[default]
    None,
    Head {
        count: u64,
        prev: Option<Pfn>,
        next: Option<Pfn>,
    },
    Tail {
        count: u64,
    },
}

/// Head of a buddy block, free or allocated.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct BuddyBlock {
    pub vaddr: VirtualAddress,
    pub order: u8,
    pub prev: Option<Pfn>,
    pub next: Option<Pfn>,
}

/// Metadata of a slab block, stored in the descriptor of its first page.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlabPage {
    pub cache: u8,
    pub vaddr: VirtualAddress,
    pub obj_size: u32,
    pub obj_count: u32,
    pub used_count: u32,
    /// Index of the first free object, [`SLAB_END`] if full.
    pub free_head: u32,
    pub prev: Option<Pfn>,
    pub next: Option<Pfn>,
    pub num_pages: u32,
}

/// End marker of a slab's intrusive free list.
pub const SLAB_END: u32 = u32::MAX;

/// Role of a heap-backing frame.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum HeapPage {
    /// Mapped into the heap window but not yet handed to the buddy allocator.
    #[default]
    Unassigned,
    Buddy(BuddyBlock),
    BuddyTail,
    Slab(SlabPage),
    SlabTail {
        head: Pfn,
    },
}

/// Type tag plus type-specific payload of a frame.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub enum PageState {
    Unused(FreeRun),
    #[default]
    Reserved,
    KernelImage,
    PageTable,
    PageFrameMetadata,
    Heap(HeapPage),
    Mmio,
    Driver,
    Anonymous,
}

impl PageState {
    /// The state a freshly classified frame of type `ty` starts in.
    #[must_use]
    pub const fn from_type(ty: PageType) -> Self {
        match ty {
            PageType::Unused => Self::Unused(FreeRun::None),
            PageType::Reserved => Self::Reserved,
            PageType::KernelImage => Self::KernelImage,
            PageType::PageTable => Self::PageTable,
            PageType::PageFrameMetadata => Self::PageFrameMetadata,
            PageType::Heap => Self::Heap(HeapPage::Unassigned),
            PageType::Mmio => Self::Mmio,
            PageType::Driver => Self::Driver,
            PageType::Anonymous => Self::Anonymous,
        }
    }

    #[must_use]
    pub const fn page_type(&self) -> PageType {
        match self {
            Self::Unused(_) => PageType::Unused,
            Self::Reserved => PageType::Reserved,
            Self::KernelImage => PageType::KernelImage,
            Self::PageTable => PageType::PageTable,
            Self::PageFrameMetadata => PageType::PageFrameMetadata,
            Self::Heap(_) => PageType::Heap,
            Self::Mmio => PageType::Mmio,
            Self::Driver => PageType::Driver,
            Self::Anonymous => PageType::Anonymous,
        }
    }
}

/// Descriptor of one physical frame.
#[derive(Copy, Clone, Debug, Default, Eq, PartialEq)]
pub struct PageDescriptor {
    pub state: PageState,
    pub ref_count: u32,
    pub flags: PageFlags,
}

impl PageDescriptor {
    #[must_use]
    pub const fn new(ty: PageType, ref_count: u32, flags: PageFlags) -> Self {
        Self {
            state: PageState::from_type(ty),
            ref_count,
            flags,
        }
    }

    #[must_use]
    pub const fn page_type(&self) -> PageType {
        self.state.page_type()
    }

    #[must_use]
    pub const fn is_unused(&self) -> bool {
        matches!(self.state, PageState::Unused(_))
    }

    #[must_use]
    pub const fn free_run(&self) -> Option<&FreeRun> {
        match &self.state {
            PageState::Unused(run) => Some(run),
            _ => None,
        }
    }

    pub const fn free_run_mut(&mut self) -> Option<&mut FreeRun> {
        match &mut self.state {
            PageState::Unused(run) => Some(run),
            _ => None,
        }
    }

    #[must_use]
    pub const fn heap_page(&self) -> Option<&HeapPage> {
        match &self.state {
            PageState::Heap(page) => Some(page),
            _ => None,
        }
    }

    #[must_use]
    pub const fn buddy(&self) -> Option<&BuddyBlock> {
        match &self.state {
            PageState::Heap(HeapPage::Buddy(block)) => Some(block),
            _ => None,
        }
    }

    pub const fn buddy_mut(&mut self) -> Option<&mut BuddyBlock> {
        match &mut self.state {
            PageState::Heap(HeapPage::Buddy(block)) => Some(block),
            _ => None,
        }
    }

    #[must_use]
    pub const fn slab(&self) -> Option<&SlabPage> {
        match &self.state {
            PageState::Heap(HeapPage::Slab(slab)) => Some(slab),
            _ => None,
        }
    }

    pub const fn slab_mut(&mut self) -> Option<&mut SlabPage> {
        match &mut self.state {
            PageState::Heap(HeapPage::Slab(slab)) => Some(slab),
            _ => None,
        }
    }

    /// The slab head a trailing slab page points back to.
    #[must_use]
    pub const fn slab_head(&self) -> Option<Pfn> {
        match self.state {
            PageState::Heap(HeapPage::SlabTail { head }) => Some(head),
            _ => None,
        }
    }

    /// Whether this frame heads a buddy block that sits on a free list.
    #[must_use]
    pub const fn is_free_buddy(&self) -> bool {
        self.buddy().is_some() && self.flags.contains(PageFlags::VIRTUALLY_FREE)
    }
}

/// The PFN-indexed descriptor array.
pub struct PageDescriptorTable<'t> {
    entries: &'t mut [PageDescriptor],
}

impl<'t> PageDescriptorTable<'t> {
    /// Wrap `entries`, resetting every descriptor to [`PageState::Reserved`].
    pub fn new(entries: &'t mut [PageDescriptor]) -> Self {
        entries.fill(PageDescriptor::default());
        Self { entries }
    }

    /// Allocate the table from the bootstrap arena and classify every frame
    /// from the boot memory map.
    ///
    /// Classification order: all frames Reserved, free regions Unused,
    /// reserved regions Reserved, then the kernel image, the arena's own
    /// backing frames and the boot page tables.
    ///
    /// # Errors
    /// Any [`ArenaError`] raised while carving the table out of the arena.
    ///
    /// # Safety
    /// The arena window must be memory nothing else references; `mapper`
    /// must make mapped pages accessible. The returned table borrows that
    /// window for `'t`, which the caller must keep mapped.
    pub unsafe fn bootstrap<B, M>(
        boot: &B,
        arena: &mut BootstrapArena,
        mapper: &mut M,
    ) -> Result<Self, ArenaError>
    where
        B: BootMemoryMap + ?Sized,
        M: PageMapper,
    {
        let frames = boot.max_physical_address().page_align_up().pfn().index();
        let bytes = (frames * size_of::<PageDescriptor>()) as u64;
        let base = arena.alloc(bytes, align_of::<PageDescriptor>() as u64, boot, mapper)?;

        // SAFETY: the arena handed out `bytes` freshly mapped bytes at `base`
        // with descriptor alignment; we initialize every slot before reading.
        let entries = unsafe {
            let ptr = base.as_ptr().cast::<PageDescriptor>();
            for i in 0..frames {
                ptr.add(i).write(PageDescriptor::default());
            }
            core::slice::from_raw_parts_mut(ptr, frames)
        };

        let mut table = Self { entries };
        table.classify(boot);
        for range in arena.consumed() {
            table.mark_physical(*range, PageType::PageFrameMetadata);
        }

        debug!(
            "page descriptor table: {} frames ({:#x} bytes), {} unused, {} bytes of metadata",
            table.len(),
            table.covered_bytes(),
            table.count_by_type(PageType::Unused),
            bytes
        );
        Ok(table)
    }

    fn classify<B: BootMemoryMap + ?Sized>(&mut self, boot: &B) {
        if boot.has_memory_map() {
            boot.for_each_free_region(&mut |r| self.mark_usable(r));
        } else {
            let all = PhysicalRange::new(
                PhysicalAddress::new(LOW_MEMORY_LIMIT),
                boot.max_physical_address(),
            );
            self.mark_usable(all);
        }
        boot.for_each_reserved_region(&mut |r| self.mark_physical(r, PageType::Reserved));
        self.mark_physical(boot.kernel_image(), PageType::KernelImage);
        boot.for_each_page_table_frame(&mut |pa| {
            let pfn = pa.pfn();
            self.mark_range(pfn, pfn.next(), PageType::PageTable, 1, PageFlags::empty());
        });
    }

    /// Free regions only count whole frames.
    fn mark_usable(&mut self, range: PhysicalRange) {
        let start = Pfn::containing(range.start().page_align_up());
        let end = Pfn::containing(range.end());
        if start < end {
            self.mark_range(start, end, PageType::Unused, 0, PageFlags::empty());
        }
    }

    /// Claimed regions cover every frame they touch.
    fn mark_physical(&mut self, range: PhysicalRange, ty: PageType) {
        if !range.is_empty() {
            self.mark_range(
                range.first_pfn(),
                range.end_pfn(),
                ty,
                1,
                PageFlags::empty(),
            );
        }
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One past the last PFN covered by the table.
    #[must_use]
    pub const fn end_pfn(&self) -> Pfn {
        Pfn::new(self.entries.len() as u64)
    }

    #[must_use]
    pub const fn contains(&self, pfn: Pfn) -> bool {
        pfn.index() < self.entries.len()
    }

    /// # Panics
    /// If `pfn` lies outside the table.
    #[must_use]
    pub fn get(&self, pfn: Pfn) -> &PageDescriptor {
        assert!(
            self.contains(pfn),
            "PFN {pfn} outside descriptor table ({} frames)",
            self.len()
        );
        &self.entries[pfn.index()]
    }

    /// # Panics
    /// If `pfn` lies outside the table.
    pub fn get_mut(&mut self, pfn: Pfn) -> &mut PageDescriptor {
        assert!(
            self.contains(pfn),
            "PFN {pfn} outside descriptor table ({} frames)",
            self.len()
        );
        &mut self.entries[pfn.index()]
    }

    /// Bulk-set every descriptor in `[start, end)` to `ty` with the given
    /// reference count and flags. The range is clamped to the table; a range
    /// entirely outside it is a no-op.
    pub fn mark_range(
        &mut self,
        start: Pfn,
        end: Pfn,
        ty: PageType,
        ref_count: u32,
        flags: PageFlags,
    ) {
        let end = end.index().min(self.entries.len());
        let start = start.index();
        if start >= end {
            return;
        }
        let desc = PageDescriptor::new(ty, ref_count, flags);
        self.entries[start..end].fill(desc);
    }

    /// Take one more reference on `pfn`.
    ///
    /// # Panics
    /// If `pfn` lies outside the table or the count would overflow.
    pub fn ref_page(&mut self, pfn: Pfn) {
        let desc = self.get_mut(pfn);
        desc.ref_count = desc
            .ref_count
            .checked_add(1)
            .unwrap_or_else(|| panic!("reference count overflow on {pfn}"));
    }

    /// Drop one reference on `pfn`; returns `true` once no references remain
    /// and the frame may be freed.
    ///
    /// # Panics
    /// If `pfn` lies outside the table or has no references.
    pub fn unref_page(&mut self, pfn: Pfn) -> bool {
        let desc = self.get_mut(pfn);
        assert!(desc.ref_count > 0, "unref of {pfn} with zero references");
        desc.ref_count -= 1;
        desc.ref_count == 0
    }

    /// Number of frames currently of type `ty`.
    #[must_use]
    pub fn count_by_type(&self, ty: PageType) -> usize {
        self.entries.iter().filter(|d| d.page_type() == ty).count()
    }

    /// All descriptors with their PFNs.
    pub fn iter(&self) -> impl Iterator<Item = (Pfn, &PageDescriptor)> {
        self.entries
            .iter()
            .enumerate()
            .map(|(i, d)| (Pfn::new(i as u64), d))
    }

    /// Bytes of physical memory described by the table.
    #[must_use]
    pub const fn covered_bytes(&self) -> u64 {
        self.entries.len() as u64 * PAGE_SIZE
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(frames: usize) -> PageDescriptorTable<'static> {
        PageDescriptorTable::new(Box::leak(
            vec![PageDescriptor::default(); frames].into_boxed_slice(),
        ))
    }

    #[test]
    fn starts_reserved() {
        let t = table(16);
        assert_eq!(t.count_by_type(PageType::Reserved), 16);
        assert_eq!(t.get(Pfn::new(3)).ref_count, 0);
        assert_eq!(t.covered_bytes(), 16 * PAGE_SIZE);
    }

    #[test]
    fn mark_range_clamps_to_table() {
        let mut t = table(16);
        t.mark_range(
            Pfn::new(12),
            Pfn::new(40),
            PageType::Unused,
            0,
            PageFlags::empty(),
        );
        assert_eq!(t.count_by_type(PageType::Unused), 4);

        t.mark_range(
            Pfn::new(100),
            Pfn::new(200),
            PageType::Mmio,
            1,
            PageFlags::empty(),
        );
        assert_eq!(t.count_by_type(PageType::Mmio), 0);
    }

    #[test]
    fn mark_range_sets_flags_and_count() {
        let mut t = table(8);
        t.mark_range(
            Pfn::new(2),
            Pfn::new(4),
            PageType::Driver,
            2,
            PageFlags::NO_EXEC,
        );
        let d = t.get(Pfn::new(3));
        assert_eq!(d.page_type(), PageType::Driver);
        assert_eq!(d.ref_count, 2);
        assert!(d.flags.contains(PageFlags::NO_EXEC));
        assert_eq!(t.get(Pfn::new(4)).page_type(), PageType::Reserved);
    }

    #[test]
    fn reference_counting() {
        let mut t = table(4);
        t.mark_range(
            Pfn::new(1),
            Pfn::new(2),
            PageType::Anonymous,
            1,
            PageFlags::empty(),
        );
        t.ref_page(Pfn::new(1));
        assert!(!t.unref_page(Pfn::new(1)));
        assert!(t.unref_page(Pfn::new(1)));
    }

    #[test]
    #[should_panic(expected = "zero references")]
    fn unref_below_zero_is_fatal() {
        let mut t = table(4);
        t.unref_page(Pfn::new(0));
    }

    #[test]
    #[should_panic(expected = "outside descriptor table")]
    fn out_of_bounds_pfn_is_fatal() {
        let t = table(4);
        let _ = t.get(Pfn::new(4));
    }

    #[test]
    fn typed_accessors_reject_other_variants() {
        let mut d = PageDescriptor::new(PageType::Unused, 0, PageFlags::empty());
        assert!(d.free_run().is_some());
        assert!(d.buddy().is_none());
        assert!(d.slab().is_none());
        assert!(d.slab_head().is_none());

        d.state = PageState::Heap(HeapPage::SlabTail { head: Pfn::new(9) });
        assert_eq!(d.slab_head(), Some(Pfn::new(9)));
        assert!(d.free_run().is_none());
        assert_eq!(d.page_type(), PageType::Heap);
    }
}
