//! # Virtual Region Tracker
//!
//! Bookkeeping for which parts of the kernel's virtual address space are
//! taken: the heap window, the descriptor table, anonymous and device
//! mappings. Regions are half-open `[from, to)` intervals kept in a
//! red-black tree, so gap searches walk the address space in order.
//!
//! ```rust
//! use kernel_alloc::vregion::{RegionKind, RegionTree};
//! use kernel_memory_addresses::VirtualAddress;
//!
//! let mut tree = RegionTree::<16>::new(
//!     VirtualAddress::new(0x1_0000),
//!     VirtualAddress::new(0x10_FFFF),
//! );
//! let a = tree.reserve(0x4000, RegionKind::Anonymous, "scratch").unwrap();
//! let b = tree.reserve(0x1000, RegionKind::Mmio, "uart").unwrap();
//! assert_eq!(b, a + 0x4000);
//!
//! assert_eq!(tree.release(a).name, "scratch");
//! let (low, high) = (VirtualAddress::new(0x1_0000), VirtualAddress::new(0x10_FFFF));
//! assert_eq!(tree.find_gap(0x2000, low, high), Some(a));
//! ```

mod rbtree;

use kernel_memory_addresses::{PAGE_SIZE, VirtualAddress};
use log::trace;
use rbtree::RbTree;

/// Default number of regions a [`RegionTree`] can hold.
pub const DEFAULT_REGION_CAPACITY: usize = 256;

/// What a reserved region is used for.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum RegionKind {
    KernelImage,
    Heap,
    PageFrameMetadata,
    Anonymous,
    Mmio,
    Driver,
}

/// A reserved `[from, to)` range of virtual addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct Region {
    pub from: VirtualAddress,
    pub to: VirtualAddress,
    pub kind: RegionKind,
    pub name: &'static str,
}

impl Region {
    #[must_use]
    pub fn len(&self) -> u64 {
        self.to - self.from
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.to <= self.from
    }

    #[must_use]
    pub fn pages(&self) -> u64 {
        self.len() / PAGE_SIZE
    }

    #[must_use]
    pub fn contains(&self, addr: VirtualAddress) -> bool {
        self.from <= addr && addr < self.to
    }
}

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum RegionError {
    #[error("no free gap of {size:#x} bytes in the requested range")]
    NoGap { size: u64 },
    #[error("region {from}..{to} overlaps an existing reservation")]
    Overlap {
        from: VirtualAddress,
        to: VirtualAddress,
    },
    #[error("region tree is full")]
    TreeFull,
    #[error("invalid region bounds")]
    InvalidRange,
}

/// Reservations inside `[lower, upper]`, at most `N` of them.
pub struct RegionTree<const N: usize = DEFAULT_REGION_CAPACITY> {
    lower: VirtualAddress,
    upper: VirtualAddress,
    tree: RbTree<N>,
}

impl<const N: usize> RegionTree<N> {
    /// A tracker for the inclusive address range `[lower, upper]`.
    #[must_use]
    pub const fn new(lower: VirtualAddress, upper_inclusive: VirtualAddress) -> Self {
        Self {
            lower,
            upper: upper_inclusive,
            tree: RbTree::new(),
        }
    }

    #[must_use]
    pub const fn lower(&self) -> VirtualAddress {
        self.lower
    }

    #[must_use]
    pub const fn upper(&self) -> VirtualAddress {
        self.upper
    }

    #[must_use]
    pub const fn len(&self) -> usize {
        self.tree.len()
    }

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.tree.len() == 0
    }

    /// Lowest address `a` in `[min, max_inclusive]` such that `[a, a + size)`
    /// is unreserved and ends at or before `max_inclusive + 1`.
    ///
    /// # Panics
    /// If `size` is zero.
    #[must_use]
    pub fn find_gap(
        &self,
        size: u64,
        min: VirtualAddress,
        max_inclusive: VirtualAddress,
    ) -> Option<VirtualAddress> {
        self.find_gap_aligned(size, 1, min, max_inclusive)
    }

    /// Like [`find_gap`](Self::find_gap), with the start aligned to `align`
    /// (a power of two).
    ///
    /// # Panics
    /// If `size` is zero or `align` is not a power of two.
    #[must_use]
    pub fn find_gap_aligned(
        &self,
        size: u64,
        align: u64,
        min: VirtualAddress,
        max_inclusive: VirtualAddress,
    ) -> Option<VirtualAddress> {
        assert!(size > 0, "gap search for zero bytes");
        assert!(
            align.is_power_of_two(),
            "gap alignment {align:#x} is not a power of two"
        );

        let fits_below = |start: u64, limit_inclusive: u64| {
            start
                .checked_add(size - 1)
                .is_some_and(|last| last <= limit_inclusive)
        };

        let mut cursor = checked_align_up(min.as_u64(), align)?;
        let mut node = self.tree.first_ending_above(min);
        while let Some(id) = node {
            let region = self.tree.region(id);
            if region.from > VirtualAddress::new(cursor)
                && fits_below(cursor, region.from.as_u64() - 1)
                && fits_below(cursor, max_inclusive.as_u64())
            {
                return Some(VirtualAddress::new(cursor));
            }
            if region.from > max_inclusive {
                return None;
            }
            cursor = checked_align_up(cursor.max(region.to.as_u64()), align)?;
            node = self.tree.successor(id);
        }

        fits_below(cursor, max_inclusive.as_u64()).then_some(VirtualAddress::new(cursor))
    }

    /// Reserve `size` bytes (a multiple of the page size) anywhere in the
    /// tracker's bounds.
    ///
    /// # Errors
    /// [`RegionError::NoGap`] when nothing fits, [`RegionError::TreeFull`]
    /// when the node arena is exhausted.
    ///
    /// # Panics
    /// If `size` is zero or not page aligned.
    pub fn reserve(
        &mut self,
        size: u64,
        kind: RegionKind,
        name: &'static str,
    ) -> Result<VirtualAddress, RegionError> {
        self.reserve_within(size, PAGE_SIZE, self.lower, self.upper, kind, name)
    }

    /// Reserve `size` bytes aligned to `align` inside `[min, max_inclusive]`.
    ///
    /// # Errors
    /// [`RegionError::NoGap`] when nothing fits, [`RegionError::TreeFull`]
    /// when the node arena is exhausted.
    ///
    /// # Panics
    /// If `size` is zero or not page aligned, or `align` is not a power of
    /// two.
    pub fn reserve_within(
        &mut self,
        size: u64,
        align: u64,
        min: VirtualAddress,
        max_inclusive: VirtualAddress,
        kind: RegionKind,
        name: &'static str,
    ) -> Result<VirtualAddress, RegionError> {
        assert!(
            size.is_multiple_of(PAGE_SIZE),
            "region size {size:#x} is not page aligned"
        );
        let min = min.max(self.lower);
        let max_inclusive = max_inclusive.min(self.upper);
        let from = self
            .find_gap_aligned(size, align.max(PAGE_SIZE), min, max_inclusive)
            .ok_or(RegionError::NoGap { size })?;
        self.insert(from, from + size, kind, name)?;
        Ok(from)
    }

    /// Record a fixed reservation `[from, to)`.
    ///
    /// # Errors
    /// [`RegionError::Overlap`] if any part is already reserved,
    /// [`RegionError::InvalidRange`] for an empty range,
    /// [`RegionError::TreeFull`] when the node arena is exhausted.
    pub fn insert(
        &mut self,
        from: VirtualAddress,
        to: VirtualAddress,
        kind: RegionKind,
        name: &'static str,
    ) -> Result<(), RegionError> {
        if to <= from {
            return Err(RegionError::InvalidRange);
        }
        self.tree.insert(Region {
            from,
            to,
            kind,
            name,
        })?;
        trace!("reserved {from}..{to} ({kind:?} \"{name}\")");
        Ok(())
    }

    /// Remove the region containing `addr` and return it.
    ///
    /// # Panics
    /// If no region contains `addr`.
    pub fn release(&mut self, addr: VirtualAddress) -> Region {
        let Some(id) = self.tree.find(addr) else {
            panic!("releasing unreserved virtual address {addr}");
        };
        let region = self.tree.remove(id);
        trace!(
            "released {}..{} (\"{}\")",
            region.from,
            region.to,
            region.name
        );
        region
    }

    /// The region containing `addr`, if any.
    #[must_use]
    pub fn find(&self, addr: VirtualAddress) -> Option<Region> {
        self.tree.find(addr).map(|id| *self.tree.region(id))
    }

    /// All regions in ascending address order.
    pub fn iter(&self) -> impl Iterator<Item = Region> + '_ {
        let mut cursor = self.tree.first();
        core::iter::from_fn(move || {
            let id = cursor?;
            cursor = self.tree.successor(id);
            Some(*self.tree.region(id))
        })
    }
}

const fn checked_align_up(value: u64, align: u64) -> Option<u64> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LOW: u64 = 0x10_0000;
    const HIGH: u64 = 0x20_0000 - 1;

    fn tracker() -> RegionTree<64> {
        RegionTree::new(VirtualAddress::new(LOW), VirtualAddress::new(HIGH))
    }

    fn va(v: u64) -> VirtualAddress {
        VirtualAddress::new(v)
    }

    fn place(t: &mut RegionTree<64>, from: u64, to: u64, kind: RegionKind, name: &'static str) {
        t.insert(va(from), va(to), kind, name).unwrap();
    }

    /// Reference answer: try every aligned start.
    fn brute_force(
        tree: &RegionTree<64>,
        size: u64,
        align: u64,
        min: u64,
        max: u64,
    ) -> Option<u64> {
        let mut a = min.next_multiple_of(align);
        while a + size - 1 <= max {
            let free = tree
                .iter()
                .all(|r| a + size <= r.from.as_u64() || a >= r.to.as_u64());
            if free {
                return Some(a);
            }
            a += align;
        }
        None
    }

    #[test]
    fn reserve_packs_from_the_bottom() {
        let mut t = tracker();
        let a = t.reserve(0x3000, RegionKind::Anonymous, "a").unwrap();
        let b = t.reserve(0x1000, RegionKind::Anonymous, "b").unwrap();
        assert_eq!(a, va(LOW));
        assert_eq!(b, va(LOW + 0x3000));

        t.release(a);
        let c = t.reserve(0x2000, RegionKind::Mmio, "c").unwrap();
        assert_eq!(c, va(LOW));
        let d = t.reserve(0x2000, RegionKind::Mmio, "d").unwrap();
        assert_eq!(d, va(LOW + 0x4000));
    }

    #[test]
    fn aligned_reservation() {
        let mut t = tracker();
        place(&mut t, LOW, LOW + 0x1000, RegionKind::KernelImage, "img");
        let (low, high) = (va(LOW), va(HIGH));
        let h = t.reserve_within(0x1_0000, 0x1_0000, low, high, RegionKind::Heap, "heap");
        assert_eq!(h, Ok(va(LOW + 0x1_0000)));
    }

    #[test]
    fn fixed_insert_rejects_overlap() {
        let mut t = tracker();
        place(&mut t, LOW + 0x4000, LOW + 0x8000, RegionKind::Driver, "x");
        let err = t.insert(va(LOW + 0x7000), va(LOW + 0x9000), RegionKind::Driver, "y");
        assert!(matches!(err, Err(RegionError::Overlap { .. })));
        assert_eq!(t.len(), 1);
    }

    #[test]
    fn find_and_iter() {
        let mut t = tracker();
        place(&mut t, LOW + 0x8000, LOW + 0x9000, RegionKind::Mmio, "late");
        place(&mut t, LOW, LOW + 0x2000, RegionKind::Heap, "early");
        assert_eq!(t.find(va(LOW + 0x1FFF)).map(|r| r.name), Some("early"));
        assert!(t.find(va(LOW + 0x2000)).is_none());
        let names: Vec<_> = t.iter().map(|r| r.name).collect();
        assert_eq!(names, ["early", "late"]);
    }

    #[test]
    fn exhaustion_reports_no_gap() {
        let mut t = tracker();
        assert_eq!(
            t.reserve(0x20_0000, RegionKind::Heap, "too big"),
            Err(RegionError::NoGap { size: 0x20_0000 })
        );
        t.reserve(0x10_0000, RegionKind::Heap, "all").unwrap();
        assert!(t.find_gap(0x1000, va(LOW), va(HIGH)).is_none());
    }

    #[test]
    #[should_panic(expected = "releasing unreserved")]
    fn releasing_unreserved_address_is_fatal() {
        let mut t = tracker();
        t.release(va(LOW));
    }

    #[test]
    fn gap_search_matches_brute_force() {
        let mut t = tracker();
        // a fragmented layout with page-granular holes of varying size
        let mut at = LOW;
        for (i, len) in [3u64, 1, 4, 1, 5, 9, 2, 6, 5, 3].iter().enumerate() {
            let len = len * 0x1000;
            if i % 2 == 0 {
                place(&mut t, at, at + len, RegionKind::Anonymous, "r");
            }
            at += len;
        }
        let tail = at + 0x3000;
        place(&mut t, tail, tail + 0x1000, RegionKind::Anonymous, "tail");

        let windows = [
            (LOW, HIGH),
            (LOW + 0x2000, LOW + 0x1_FFFF),
            (LOW + 0x5000, LOW + 0xFFFF),
        ];
        for size in [0x1000, 0x2000, 0x3000, 0x5000, 0x8000] {
            for align in [0x1000, 0x2000, 0x4000] {
                for (min, max) in windows {
                    let got = t
                        .find_gap_aligned(size, align, va(min), va(max))
                        .map(VirtualAddress::as_u64);
                    assert_eq!(
                        got,
                        brute_force(&t, size, align, min, max),
                        "size={size:#x} align={align:#x} min={min:#x}"
                    );
                }
            }
        }
    }
}
