//! # Physical and Virtual Memory Address Types
//!
//! Strongly typed wrappers for the raw addresses, frame numbers and frame
//! ranges that the kernel's memory management code passes around.
//!
//! ## Overview
//!
//! | Type | Meaning |
//! |------|---------|
//! | [`PhysicalAddress`] | A byte address in physical memory (RAM or MMIO). |
//! | [`VirtualAddress`] | A byte address in the kernel's (page-table translated) address space. |
//! | [`Pfn`] | A page frame number: the index of a physical [`PAGE_SIZE`] frame. |
//! | [`PhysicalRange`] | A half-open `[start, end)` range of physical memory. |
//!
//! The allocator works on a single base granularity of 4 KiB. Every
//! frame-granular API speaks in [`Pfn`]s, every byte-granular API in addresses,
//! and conversions between the two are explicit.
//!
//! ## Typical Usage
//!
//! ```rust
//! # use kernel_memory_addresses::*;
//! let pa = PhysicalAddress::new(0x0010_2042);
//! let pfn = Pfn::containing(pa);
//! assert_eq!(pfn.as_u64(), 0x102);
//! assert_eq!(pfn.address().as_u64(), 0x0010_2000);
//!
//! let range = PhysicalRange::new(PhysicalAddress::new(0x1000), PhysicalAddress::new(0x5000));
//! assert_eq!(range.pages(), 4);
//! assert!(!range.contains(pa));
//! ```
//!
//! ## Design Notes
//!
//! - The types are `#[repr(transparent)]` and implement `Copy`, `Eq`, `Ord`
//!   and `Hash`.
//! - All alignment helpers are `const fn`.
//! - Physical and virtual addresses never convert into each other implicitly;
//!   only a page mapper can relate them.

#![cfg_attr(not(any(test, doctest)), no_std)]
#![allow(clippy::inline_always)]

mod pfn;
mod physical_address;
mod physical_range;
mod virtual_address;

pub use pfn::Pfn;
pub use physical_address::PhysicalAddress;
pub use physical_range::PhysicalRange;
pub use virtual_address::VirtualAddress;

/// Size of a base page / physical frame in bytes.
pub const PAGE_SIZE: u64 = 4096;

/// `log2(PAGE_SIZE)`.
pub const PAGE_SHIFT: u32 = 12;

const _: () = assert!(1 << PAGE_SHIFT == PAGE_SIZE);

/// Round `value` up to the next multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_up(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    (value + (align - 1)) & !(align - 1)
}

/// Round `value` down to a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn align_down(value: u64, align: u64) -> u64 {
    debug_assert!(align.is_power_of_two());
    value & !(align - 1)
}

/// Whether `value` is a multiple of `align` (a power of two).
#[inline]
#[must_use]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

/// Number of pages needed to hold `bytes`.
#[inline]
#[must_use]
pub const fn pages_for(bytes: u64) -> u64 {
    bytes.div_ceil(PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(align_up(0x12345, PAGE_SIZE), 0x13000);
        assert_eq!(align_up(0x13000, PAGE_SIZE), 0x13000);
        assert_eq!(align_down(0x12345, PAGE_SIZE), 0x12000);
        assert!(is_aligned(0x4000, PAGE_SIZE));
        assert!(!is_aligned(0x4010, PAGE_SIZE));
        assert!(is_aligned(0x20_0000, 0x20_0000));
    }

    #[test]
    fn page_counts() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(1), 1);
        assert_eq!(pages_for(PAGE_SIZE), 1);
        assert_eq!(pages_for(PAGE_SIZE + 1), 2);
    }

    #[test]
    fn pfn_roundtrip() {
        let pa = PhysicalAddress::new(0x0000_0010_2000_0042);
        let pfn = Pfn::containing(pa);
        assert_eq!(pfn.address().as_u64(), 0x0000_0010_2000_0000);
        assert_eq!(pfn.next().as_u64(), pfn.as_u64() + 1);
        assert_eq!(pfn + 3, Pfn::new(pfn.as_u64() + 3));
    }

    #[test]
    fn virtual_page_math() {
        let va = VirtualAddress::new(0xFFFF_FFFF_8000_1234);
        assert_eq!(va.page_base().as_u64(), 0xFFFF_FFFF_8000_1000);
        assert_eq!(va.page_offset(), 0x234);
        assert!(!va.is_page_aligned());
        assert_eq!(va.page_base().add_pages(2).as_u64(), 0xFFFF_FFFF_8000_3000);
        assert_eq!(
            VirtualAddress::new(0x5000) - VirtualAddress::new(0x1000),
            0x4000
        );
    }

    #[test]
    fn ranges() {
        let r = PhysicalRange::new(PhysicalAddress::new(0x1800), PhysicalAddress::new(0x4800));
        assert_eq!(r.page_aligned().start().as_u64(), 0x1000);
        assert_eq!(r.page_aligned().end().as_u64(), 0x5000);
        assert_eq!(r.first_pfn(), Pfn::new(1));
        assert_eq!(r.end_pfn(), Pfn::new(5));
        assert!(r.contains(PhysicalAddress::new(0x1800)));
        assert!(!r.contains(PhysicalAddress::new(0x4800)));
        let at = PhysicalAddress::new(0x2000);
        assert!(PhysicalRange::new(at, at).is_empty());
    }
}
