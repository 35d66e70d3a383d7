//! # Physical Frame Allocator
//!
//! Free physical memory is kept as *runs*: maximal stretches of
//! [`PageType::Unused`] frames. A run's first descriptor holds its length and
//! the list links, its last descriptor repeats the length so a neighbor being
//! freed can find the run's head in O(1).
//!
//! ```text
//!   PFN:   10     11     12     13          20
//!        ┌──────┬──────┬──────┬──────┐    ┌──────┐
//!        │Head 4│  ·   │  ·   │Tail 4│ →  │Head 1│ → None
//!        └──────┴──────┴──────┴──────┘    └──────┘
//! ```
//!
//! Allocation is first-fit and carves from the *tail* of a run, so the head
//! (and with it the list position) stays put unless the run is consumed
//! whole. Freeing merges with the run ending just below and the run starting
//! just above.

use crate::pfn::{FreeRun, PageDescriptorTable, PageFlags, PageState, PageType};
use kernel_memory_addresses::Pfn;
use log::trace;

/// A contiguous stretch of frames handed out by [`FrameAllocator::allocate`].
///
/// `count == 0` means no single free run could satisfy the request.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FrameRun {
    pub start: Pfn,
    pub count: u64,
}

impl FrameRun {
    pub const EMPTY: Self = Self {
        start: Pfn::new(0),
        count: 0,
    };

    #[must_use]
    pub const fn is_empty(&self) -> bool {
        self.count == 0
    }

    /// One past the last frame of the run.
    #[must_use]
    pub const fn end(&self) -> Pfn {
        Pfn::new(self.start.as_u64() + self.count)
    }
}

/// Run-length free list over the page descriptor table.
#[derive(Debug, Default)]
pub struct FrameAllocator {
    head: Option<Pfn>,
    free_frames: u64,
}

impl FrameAllocator {
    /// An allocator owning no frames.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            head: None,
            free_frames: 0,
        }
    }

    /// Thread every maximal run of unused frames in `table` into the list,
    /// in ascending PFN order.
    pub fn build(table: &mut PageDescriptorTable<'_>) -> Self {
        let mut this = Self::new();
        let mut last: Option<Pfn> = None;
        let end = table.end_pfn();
        let mut pfn = Pfn::new(0);

        while pfn < end {
            if !table.get(pfn).is_unused() {
                pfn = pfn.next();
                continue;
            }

            let start = pfn;
            while pfn < end && table.get(pfn).is_unused() {
                *run_of(table, pfn) = FreeRun::None;
                pfn = pfn.next();
            }
            let count = pfn - start;

            write_run(table, start, count, last, None);
            match last {
                Some(prev) => set_next(table, prev, Some(start)),
                None => this.head = Some(start),
            }
            last = Some(start);
            this.free_frames += count;
        }

        trace!("frame allocator built: {} free frames", this.free_frames);
        this
    }

    #[must_use]
    pub const fn free_frames(&self) -> u64 {
        self.free_frames
    }

    /// Allocate `count` physically contiguous frames of type `ty`, each with
    /// a reference count of one.
    ///
    /// Returns an empty run when no free run is long enough; callers that can
    /// live with less retry with a smaller count.
    ///
    /// # Panics
    /// If `ty` is [`PageType::Unused`].
    pub fn allocate(
        &mut self,
        table: &mut PageDescriptorTable<'_>,
        count: u64,
        ty: PageType,
    ) -> FrameRun {
        assert_ne!(ty, PageType::Unused, "cannot allocate frames as unused");
        if count == 0 {
            return FrameRun::EMPTY;
        }

        let mut cursor = self.head;
        while let Some(head) = cursor {
            let (run_count, _, next) = head_of(table, head);
            if run_count >= count {
                let remaining = run_count - count;
                let start = head + remaining;
                if remaining == 0 {
                    self.unlink(table, head);
                } else {
                    let (_, prev, next) = head_of(table, head);
                    write_run(table, head, remaining, prev, next);
                }

                table.mark_range(start, start + count, ty, 1, PageFlags::empty());
                self.free_frames -= count;
                trace!("allocated {count} frame(s) at {start} as {ty:?}");
                return FrameRun { start, count };
            }
            cursor = next;
        }

        FrameRun::EMPTY
    }

    /// Return `count` frames starting at `start` to the free pool, merging
    /// with adjacent free runs.
    ///
    /// # Panics
    /// If any frame in the range is already unused (double free) or lies
    /// outside the table.
    pub fn free(&mut self, table: &mut PageDescriptorTable<'_>, start: Pfn, count: u64) {
        if count == 0 {
            return;
        }
        let end = start + count;
        assert!(
            end <= table.end_pfn(),
            "freeing frames {start}..{end} outside descriptor table"
        );

        let mut pfn = start;
        while pfn < end {
            assert!(!table.get(pfn).is_unused(), "double free of frame {pfn}");
            pfn = pfn.next();
        }
        table.mark_range(start, end, PageType::Unused, 0, PageFlags::empty());

        let left = start.prev().and_then(|p| run_head_ending_at(table, p));
        let right = (end < table.end_pfn() && table.get(end).is_unused()).then_some(end);

        match (left, right) {
            (None, None) => {
                let old = self.head;
                write_run(table, start, count, None, old);
                if let Some(old) = old {
                    set_prev(table, old, Some(start));
                }
                self.head = Some(start);
            }
            (Some(l), None) => {
                let (lcount, prev, next) = head_of(table, l);
                write_run(table, l, lcount + count, prev, next);
            }
            (None, Some(r)) => {
                let (rcount, prev, next) = head_of(table, r);
                *run_of(table, r) = FreeRun::None;
                write_run(table, start, count + rcount, prev, next);
                match prev {
                    Some(p) => set_next(table, p, Some(start)),
                    None => self.head = Some(start),
                }
                if let Some(n) = next {
                    set_prev(table, n, Some(start));
                }
            }
            (Some(l), Some(r)) => {
                let (rcount, _, _) = head_of(table, r);
                self.unlink(table, r);
                *run_of(table, r) = FreeRun::None;
                let (lcount, prev, next) = head_of(table, l);
                write_run(table, l, lcount + count + rcount, prev, next);
            }
        }

        self.free_frames += count;
        trace!("freed {count} frame(s) at {start}");
    }

    /// The free runs in list order.
    pub fn runs<'a, 't>(&self, table: &'a PageDescriptorTable<'t>) -> Runs<'a, 't> {
        Runs {
            table: self.head.map(|h| (table, h)),
        }
    }

    /// Length of the longest free run.
    #[must_use]
    pub fn largest_run(&self, table: &PageDescriptorTable<'_>) -> u64 {
        self.runs(table).map(|r| r.count).max().unwrap_or(0)
    }

    fn unlink(&mut self, table: &mut PageDescriptorTable<'_>, head: Pfn) {
        let (_, prev, next) = head_of(table, head);
        match prev {
            Some(p) => set_next(table, p, next),
            None => self.head = next,
        }
        if let Some(n) = next {
            set_prev(table, n, prev);
        }
    }
}

/// Iterator over the free runs of a [`FrameAllocator`].
pub struct Runs<'a, 't> {
    table: Option<(&'a PageDescriptorTable<'t>, Pfn)>,
}

impl Iterator for Runs<'_, '_> {
    type Item = FrameRun;

    fn next(&mut self) -> Option<Self::Item> {
        let (table, head) = self.table?;
        let (count, _, next) = head_of(table, head);
        self.table = next.map(|n| (table, n));
        Some(FrameRun { start: head, count })
    }
}

fn run_of<'a>(table: &'a mut PageDescriptorTable<'_>, pfn: Pfn) -> &'a mut FreeRun {
    let Some(run) = table.get_mut(pfn).free_run_mut() else {
        panic!("frame {pfn} on the free list is not unused");
    };
    run
}

fn head_of(table: &PageDescriptorTable<'_>, pfn: Pfn) -> (u64, Option<Pfn>, Option<Pfn>) {
    match table.get(pfn).state {
        PageState::Unused(FreeRun::Head { count, prev, next }) => (count, prev, next),
        ref other => panic!("frame {pfn} is not the head of a free run: {other:?}"),
    }
}

/// Write the head (and, for runs longer than one frame, the tail) of a run.
fn write_run(
    table: &mut PageDescriptorTable<'_>,
    head: Pfn,
    count: u64,
    prev: Option<Pfn>,
    next: Option<Pfn>,
) {
    *run_of(table, head) = FreeRun::Head { count, prev, next };
    if count > 1 {
        *run_of(table, head + (count - 1)) = FreeRun::Tail { count };
    }
}

/// Head of the free run whose last frame is `last`, if `last` is unused.
fn run_head_ending_at(table: &PageDescriptorTable<'_>, last: Pfn) -> Option<Pfn> {
    match table.get(last).free_run()? {
        FreeRun::Tail { count } => Some(Pfn::new(last.as_u64() + 1 - count)),
        FreeRun::Head { count: 1, .. } => Some(last),
        other => panic!("frame {last} ends a free run but reads {other:?}"),
    }
}

fn set_next(table: &mut PageDescriptorTable<'_>, pfn: Pfn, value: Option<Pfn>) {
    if let FreeRun::Head { next, .. } = run_of(table, pfn) {
        *next = value;
    }
}

fn set_prev(table: &mut PageDescriptorTable<'_>, pfn: Pfn, value: Option<Pfn>) {
    if let FreeRun::Head { prev, .. } = run_of(table, pfn) {
        *prev = value;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pfn::PageDescriptor;

    fn table(frames: usize, free: core::ops::Range<u64>) -> PageDescriptorTable<'static> {
        let mut t = PageDescriptorTable::new(Box::leak(
            vec![PageDescriptor::default(); frames].into_boxed_slice(),
        ));
        t.mark_range(
            Pfn::new(free.start),
            Pfn::new(free.end),
            PageType::Unused,
            0,
            PageFlags::empty(),
        );
        t
    }

    fn runs(alloc: &FrameAllocator, t: &PageDescriptorTable<'_>) -> Vec<(u64, u64)> {
        let mut v: Vec<_> = alloc.runs(t).map(|r| (r.start.as_u64(), r.count)).collect();
        v.sort_unstable();
        v
    }

    #[test]
    fn build_threads_maximal_runs() {
        let mut t = table(64, 8..32);
        t.mark_range(
            Pfn::new(16),
            Pfn::new(18),
            PageType::Reserved,
            1,
            PageFlags::empty(),
        );
        t.mark_range(
            Pfn::new(40),
            Pfn::new(41),
            PageType::Unused,
            0,
            PageFlags::empty(),
        );
        let a = FrameAllocator::build(&mut t);

        assert_eq!(runs(&a, &t), vec![(8, 8), (18, 14), (40, 1)]);
        assert_eq!(a.free_frames(), 23);
        assert_eq!(a.largest_run(&t), 14);
    }

    #[test]
    fn allocates_from_run_tail() {
        let mut t = table(32, 4..20);
        let mut a = FrameAllocator::build(&mut t);

        let r = a.allocate(&mut t, 3, PageType::Driver);
        assert_eq!((r.start, r.count), (Pfn::new(17), 3));
        assert_eq!(r.end(), Pfn::new(20));
        assert_eq!(t.get(Pfn::new(17)).page_type(), PageType::Driver);
        assert_eq!(t.get(Pfn::new(19)).ref_count, 1);
        assert_eq!(runs(&a, &t), vec![(4, 13)]);
        assert_eq!(
            t.get(Pfn::new(16)).free_run(),
            Some(&FreeRun::Tail { count: 13 })
        );
    }

    #[test]
    fn exact_fit_unlinks_run() {
        let mut t = table(32, 4..8);
        t.mark_range(
            Pfn::new(10),
            Pfn::new(20),
            PageType::Unused,
            0,
            PageFlags::empty(),
        );
        let mut a = FrameAllocator::build(&mut t);

        let r = a.allocate(&mut t, 4, PageType::Anonymous);
        assert_eq!(r.start, Pfn::new(4));
        assert_eq!(runs(&a, &t), vec![(10, 10)]);
    }

    #[test]
    fn short_count_when_no_run_fits() {
        let mut t = table(32, 4..8);
        let mut a = FrameAllocator::build(&mut t);
        let r = a.allocate(&mut t, 5, PageType::Heap);
        assert!(r.is_empty());
        assert_eq!(a.free_frames(), 4);
    }

    #[test]
    fn free_merges_all_four_ways() {
        let mut t = table(64, 0..64);
        let mut a = FrameAllocator::build(&mut t);
        let all = a.allocate(&mut t, 64, PageType::Driver);
        assert_eq!(all.count, 64);
        assert!(a.runs(&t).next().is_none());

        // none
        a.free(&mut t, Pfn::new(10), 2);
        assert_eq!(runs(&a, &t), vec![(10, 2)]);
        // left
        a.free(&mut t, Pfn::new(12), 3);
        assert_eq!(runs(&a, &t), vec![(10, 5)]);
        // right
        a.free(&mut t, Pfn::new(8), 2);
        assert_eq!(runs(&a, &t), vec![(8, 7)]);
        // isolated, then both
        a.free(&mut t, Pfn::new(20), 1);
        a.free(&mut t, Pfn::new(16), 3);
        assert_eq!(runs(&a, &t), vec![(8, 7), (16, 3), (20, 1)]);
        a.free(&mut t, Pfn::new(19), 1);
        a.free(&mut t, Pfn::new(15), 1);
        assert_eq!(runs(&a, &t), vec![(8, 13)]);
        assert_eq!(a.free_frames(), 13);
    }

    #[test]
    fn returning_every_frame_coalesces_completely() {
        let mut t = table(128, 0..128);
        let mut a = FrameAllocator::build(&mut t);

        let mut taken = Vec::new();
        for n in [1, 5, 3, 7, 2, 9, 4, 1, 6] {
            taken.push(a.allocate(&mut t, n, PageType::Anonymous));
        }
        // interleave: odd indices first, then even
        let (odd, even) = (taken.iter().skip(1).step_by(2), taken.iter().step_by(2));
        for r in odd.chain(even) {
            a.free(&mut t, r.start, r.count);
        }

        assert_eq!(runs(&a, &t), vec![(0, 128)]);
        assert_eq!(a.free_frames(), 128);
    }

    #[test]
    #[should_panic(expected = "double free")]
    fn double_free_is_fatal() {
        let mut t = table(16, 0..16);
        let mut a = FrameAllocator::build(&mut t);
        let r = a.allocate(&mut t, 2, PageType::Driver);
        a.free(&mut t, r.start, 2);
        a.free(&mut t, r.start, 1);
    }
}
