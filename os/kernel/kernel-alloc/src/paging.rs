//! # Paging Primitive Contract
//!
//! The memory manager never touches page tables itself. Whoever owns the
//! active address space (the kernel's VMM on hardware, a recording stub in
//! tests) implements [`PageMapper`] and hands it in.

use kernel_memory_addresses::{PhysicalAddress, VirtualAddress};

bitflags::bitflags! {
    /// Attributes requested for a new mapping.
    ///
    /// Presence is implied; the implementation translates these into its
    /// page table entry bits.
    #[derive(Copy, Clone, Debug, Default, Eq, PartialEq, Hash)]
    pub struct MapFlags: u32 {
        const WRITABLE   = 1 << 0;
        const NO_EXECUTE = 1 << 1;
        const GLOBAL     = 1 << 2;
        /// Uncached, for device memory.
        const NO_CACHE   = 1 << 3;
        const USER       = 1 << 4;
    }
}

impl MapFlags {
    /// Read/write kernel data, never executable.
    pub const KERNEL_DATA: Self = Self::WRITABLE.union(Self::NO_EXECUTE).union(Self::GLOBAL);

    /// Uncached read/write device registers.
    pub const DEVICE: Self = Self::KERNEL_DATA.union(Self::NO_CACHE);
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum MapError {
    #[error("out of memory for page table structures")]
    OutOfMemory,
    #[error("virtual address {0} is already mapped")]
    AlreadyMapped(VirtualAddress),
    #[error("address is not page aligned")]
    Unaligned,
}

/// Maps, unmaps and translates 4 KiB pages in the kernel address space.
///
/// # Safety
/// After `map(va, pa, count, _)` returns `Ok`, the `count` pages starting at
/// `va` must be readable and writable through ordinary pointers and back the
/// frames starting at `pa`, until the matching `unmap`. `translate` must
/// report exactly the current mappings.
pub unsafe trait PageMapper {
    /// Map `count` consecutive pages at `va` onto the physically contiguous
    /// frames starting at `pa`.
    ///
    /// # Errors
    /// Unaligned input, a page that is already mapped, or no memory left for
    /// intermediate page tables. A failed call leaves no partial mapping.
    fn map(
        &mut self,
        va: VirtualAddress,
        pa: PhysicalAddress,
        count: u64,
        flags: MapFlags,
    ) -> Result<(), MapError>;

    /// Remove `count` page mappings starting at `va`. Unmapped pages in the
    /// range are skipped.
    fn unmap(&mut self, va: VirtualAddress, count: u64);

    /// Physical address `va` currently maps to, including the page offset.
    fn translate(&self, va: VirtualAddress) -> Option<PhysicalAddress>;
}
