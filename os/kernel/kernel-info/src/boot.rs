//! # Boot Memory Information
//!
//! The contract between whatever discovered physical memory (UEFI memory
//! map, multiboot tables, a test fixture) and the memory manager that consumes
//! it exactly once during initialization.

use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};

/// Read-only view of the physical memory layout reported by the boot
/// environment.
///
/// Regions need not be page aligned or sorted; consumers widen or clamp them
/// as needed. Reserved regions take precedence over free regions where they
/// overlap.
pub trait BootMemoryMap {
    /// Whether the boot environment reported a memory map at all.
    ///
    /// When it did not, consumers treat everything between
    /// [`LOW_MEMORY_LIMIT`](crate::memory::LOW_MEMORY_LIMIT) and
    /// [`max_physical_address`](Self::max_physical_address) as free, except for
    /// the kernel image.
    fn has_memory_map(&self) -> bool;

    /// One past the highest physical address backed by RAM.
    fn max_physical_address(&self) -> PhysicalAddress;

    /// Physical range occupied by the loaded kernel image.
    fn kernel_image(&self) -> PhysicalRange;

    /// Invoke `f` for every region usable as general-purpose RAM.
    fn for_each_free_region(&self, f: &mut dyn FnMut(PhysicalRange));

    /// Invoke `f` for every region that must never be handed out.
    fn for_each_reserved_region(&self, f: &mut dyn FnMut(PhysicalRange));

    /// Invoke `f` for the base of every frame holding a live page-table
    /// structure (PML4, PDPT, PD, PT) built before the allocator existed.
    fn for_each_page_table_frame(&self, f: &mut dyn FnMut(PhysicalAddress));
}

/// A [`BootMemoryMap`] over borrowed slices.
///
/// Early boot code translates the firmware's memory map into this shape on
/// the stack; the memory manager only ever sees the trait.
#[derive(Clone, Copy, Debug)]
pub struct BootRegions<'a> {
    /// One past the highest RAM address.
    pub max_physical: PhysicalAddress,
    /// Where the kernel image was loaded.
    pub kernel_image: PhysicalRange,
    /// Usable RAM; empty means "no memory map reported".
    pub free: &'a [PhysicalRange],
    /// Firmware, ACPI and other reserved ranges.
    pub reserved: &'a [PhysicalRange],
    /// Frames holding the boot page tables.
    pub page_tables: &'a [PhysicalAddress],
}

impl BootMemoryMap for BootRegions<'_> {
    fn has_memory_map(&self) -> bool {
        !self.free.is_empty()
    }

    fn max_physical_address(&self) -> PhysicalAddress {
        self.max_physical
    }

    fn kernel_image(&self) -> PhysicalRange {
        self.kernel_image
    }

    fn for_each_free_region(&self, f: &mut dyn FnMut(PhysicalRange)) {
        self.free.iter().copied().for_each(f);
    }

    fn for_each_reserved_region(&self, f: &mut dyn FnMut(PhysicalRange)) {
        self.reserved.iter().copied().for_each(f);
    }

    fn for_each_page_table_frame(&self, f: &mut dyn FnMut(PhysicalAddress)) {
        self.page_tables.iter().copied().for_each(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn boot_regions_iterate_slices() {
        let free = [
            PhysicalRange::new(
                PhysicalAddress::new(0x10_0000),
                PhysicalAddress::new(0x80_0000),
            ),
            PhysicalRange::new(
                PhysicalAddress::new(0x100_0000),
                PhysicalAddress::new(0x200_0000),
            ),
        ];
        let tables = [PhysicalAddress::new(0x9000)];
        let map = BootRegions {
            max_physical: PhysicalAddress::new(0x200_0000),
            kernel_image: PhysicalRange::new(
                PhysicalAddress::new(0x10_0000),
                PhysicalAddress::new(0x20_0000),
            ),
            free: &free,
            reserved: &[],
            page_tables: &tables,
        };

        assert!(map.has_memory_map());
        let mut total = 0;
        map.for_each_free_region(&mut |r| total += r.len());
        assert_eq!(total, 0x70_0000 + 0x100_0000);

        let mut seen = 0;
        map.for_each_page_table_frame(&mut |pa| {
            assert_eq!(pa.as_u64(), 0x9000);
            seen += 1;
        });
        assert_eq!(seen, 1);
    }

    #[test]
    fn empty_free_list_means_no_map() {
        let map = BootRegions {
            max_physical: PhysicalAddress::new(0x100_0000),
            kernel_image: PhysicalRange::default(),
            free: &[],
            reserved: &[],
            page_tables: &[],
        };
        assert!(!map.has_memory_map());
    }
}
