use crate::{PAGE_SIZE, Pfn, PhysicalAddress};
use core::fmt;

/// A half-open range `[start, end)` of physical memory.
///
/// Boot memory maps report byte ranges that are not necessarily page aligned;
/// [`page_aligned`](Self::page_aligned) widens them outward and
/// [`first_pfn`](Self::first_pfn)/[`end_pfn`](Self::end_pfn) give the frame
/// bounds.
#[derive(Copy, Clone, Default, Eq, PartialEq, Hash)]
pub struct PhysicalRange {
    start: PhysicalAddress,
    end: PhysicalAddress,
}

impl PhysicalRange {
    #[inline]
    #[must_use]
    pub const fn new(start: PhysicalAddress, end: PhysicalAddress) -> Self {
        Self { start, end }
    }

    /// The range covering `count` frames starting at `first`.
    #[inline]
    #[must_use]
    pub const fn from_frames(first: Pfn, count: u64) -> Self {
        Self {
            start: first.address(),
            end: PhysicalAddress::new(first.address().as_u64() + count * PAGE_SIZE),
        }
    }

    #[inline]
    #[must_use]
    pub const fn start(&self) -> PhysicalAddress {
        self.start
    }

    #[inline]
    #[must_use]
    pub const fn end(&self) -> PhysicalAddress {
        self.end
    }

    #[inline]
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.end.as_u64().saturating_sub(self.start.as_u64())
    }

    #[inline]
    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.len() == 0
    }

    #[inline]
    #[must_use]
    pub const fn contains(&self, pa: PhysicalAddress) -> bool {
        pa.as_u64() >= self.start.as_u64() && pa.as_u64() < self.end.as_u64()
    }

    /// Whether the two ranges share at least one byte.
    #[inline]
    #[must_use]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.start.as_u64() < other.end.as_u64() && other.start.as_u64() < self.end.as_u64()
    }

    /// Widen outward to page boundaries.
    #[inline]
    #[must_use]
    pub const fn page_aligned(&self) -> Self {
        Self {
            start: self.start.page_base(),
            end: self.end.page_align_up(),
        }
    }

    /// First frame touched by the range.
    #[inline]
    #[must_use]
    pub const fn first_pfn(&self) -> Pfn {
        Pfn::containing(self.start)
    }

    /// One past the last frame touched by the range.
    #[inline]
    #[must_use]
    pub const fn end_pfn(&self) -> Pfn {
        Pfn::containing(self.end.page_align_up())
    }

    /// Number of frames touched by the range.
    #[inline]
    #[must_use]
    pub const fn pages(&self) -> u64 {
        let (first, end) = (self.first_pfn().as_u64(), self.end_pfn().as_u64());
        end.saturating_sub(first)
    }
}

impl fmt::Debug for PhysicalRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}..{})", self.start, self.end)
    }
}
