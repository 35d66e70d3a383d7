//! # Buddy Allocator
//!
//! Page-granular power-of-two blocks inside the heap window. A block of order
//! `k` spans `PAGE_SIZE << k` bytes and starts at a heap offset that is a
//! multiple of its size; its *buddy* is the equally sized neighbor it was split
//! from, found by flipping bit `k + 12` of the offset.
//!
//! ```text
//!  order 2 │               16 KiB               │
//!  order 1 │      8 KiB       │      8 KiB      │
//!  order 0 │  4 KiB  │  4 KiB │  4 KiB │  4 KiB │
//!          0x0000    0x1000   0x2000   0x3000
//! ```
//!
//! Free lists are threaded through the page descriptor of each block's first
//! page; the remaining pages of a block are tagged as buddy tails. Because the
//! heap's pages need not be physically contiguous, descriptors are always
//! found by translating the block's virtual address.

use super::frame_of;
use crate::paging::PageMapper;
use crate::pfn::{BuddyBlock, HeapPage, PageDescriptorTable, PageFlags, PageState};
use kernel_memory_addresses::{PAGE_SIZE, Pfn, VirtualAddress};
use log::trace;

/// Largest supported order: blocks of `PAGE_SIZE << 19` = 2 GiB.
pub const MAX_ORDER: u8 = 19;

const ORDERS: usize = MAX_ORDER as usize + 1;

/// Heap offset of the buddy of the order-`order` block at `offset`.
#[must_use]
pub const fn buddy_address(offset: u64, order: u8) -> u64 {
    offset ^ (PAGE_SIZE << order)
}

/// Bytes in a block of `order`.
#[must_use]
pub const fn block_bytes(order: u8) -> u64 {
    PAGE_SIZE << order
}

/// Pages in a block of `order`.
#[must_use]
pub const fn block_pages(order: u8) -> u64 {
    1 << order
}

/// Smallest order whose block holds `pages` pages, `None` past `2^63` pages.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn order_for_pages(pages: u64) -> Option<u8> {
    if pages <= 1 {
        return Some(0);
    }
    match pages.checked_next_power_of_two() {
        Some(rounded) => Some(rounded.trailing_zeros() as u8),
        None => None,
    }
}

/// Free lists of the heap's buddy blocks.
#[derive(Debug)]
pub struct BuddyAllocator {
    base: VirtualAddress,
    top_order: u8,
    free: [Option<Pfn>; ORDERS],
    managed_pages: u64,
    free_pages: u64,
}

impl BuddyAllocator {
    /// Blocks live in `[base, base + ceiling)`; `base` must be aligned to
    /// `ceiling`, a power of two of at least one page.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn new(base: VirtualAddress, ceiling: u64) -> Self {
        let pages_log2 = (ceiling / PAGE_SIZE).trailing_zeros() as u8;
        let top_order = if pages_log2 < MAX_ORDER { pages_log2 } else { MAX_ORDER };
        Self {
            base,
            top_order,
            free: [None; ORDERS],
            managed_pages: 0,
            free_pages: 0,
        }
    }

    #[must_use]
    pub const fn top_order(&self) -> u8 {
        self.top_order
    }

    /// Bytes of heap handed to the allocator so far.
    #[must_use]
    pub const fn managed_bytes(&self) -> u64 {
        self.managed_pages * PAGE_SIZE
    }

    /// Bytes currently sitting on free lists.
    #[must_use]
    pub const fn free_bytes(&self) -> u64 {
        self.free_pages * PAGE_SIZE
    }

    /// Take a block of exactly `order`, splitting a larger one if needed.
    /// Returns `None` when no block of `order` or above is free.
    pub fn allocate<M: PageMapper>(
        &mut self,
        table: &mut PageDescriptorTable<'_>,
        mapper: &M,
        order: u8,
    ) -> Option<VirtualAddress> {
        if order > self.top_order {
            return None;
        }
        let found = (order..=self.top_order).find(|&o| self.free[usize::from(o)].is_some())?;
        let head = self.free[usize::from(found)]?;
        self.unlink(table, head, found);
        let va = block_of(table, head).vaddr;

        let mut split = found;
        while split > order {
            split -= 1;
            let right = va + block_bytes(split);
            let right_pfn = frame_of(mapper, right);
            write_head(table, right_pfn, right, split);
            self.push(table, right_pfn, split);
        }

        write_head(table, head, va, order);
        self.free_pages -= block_pages(order);
        trace!("buddy: order {order} block at {va} (split from {found})");
        Some(va)
    }

    /// Return the block headed at `va` and merge it with free buddies.
    ///
    /// # Panics
    /// If `va` is unaligned, outside the heap, not the head of a block, or
    /// already free.
    pub fn free<M: PageMapper>(
        &mut self,
        table: &mut PageDescriptorTable<'_>,
        mapper: &M,
        va: VirtualAddress,
    ) {
        assert!(va.is_page_aligned(), "buddy free of unaligned address {va}");
        assert!(va >= self.base, "buddy free of {va} below the heap");
        let pfn = frame_of(mapper, va);
        let desc = table.get(pfn);
        let Some(block) = desc.buddy() else {
            panic!("buddy free of {va}, which is not the head of a block");
        };
        assert_eq!(
            block.vaddr,
            va,
            "buddy free of {va}, which is not the head of a block"
        );
        assert!(
            !desc.flags.contains(PageFlags::VIRTUALLY_FREE),
            "double free of buddy block at {va}"
        );

        let order = block.order;
        self.free_pages += block_pages(order);
        trace!("buddy: free order {order} block at {va}");
        self.release(table, mapper, pfn, va, order);
    }

    /// Hand the freshly mapped pages `[start, end)` to the allocator as the
    /// largest aligned blocks that fit, merging with free neighbors.
    ///
    /// # Panics
    /// If the range is unaligned or any page in it is unmapped.
    pub fn add_range<M: PageMapper>(
        &mut self,
        table: &mut PageDescriptorTable<'_>,
        mapper: &M,
        start: VirtualAddress,
        end: VirtualAddress,
    ) {
        assert!(
            start.is_page_aligned() && end.is_page_aligned(),
            "unaligned buddy range {start}..{end}"
        );

        let mut va = start;
        while va < end {
            let offset = va - self.base;
            let mut order = self.top_order;
            while order > 0
                && (!offset.is_multiple_of(block_bytes(order)) || va + block_bytes(order) > end)
            {
                order -= 1;
            }

            let head = tag_block(table, mapper, va, order);
            self.managed_pages += block_pages(order);
            self.free_pages += block_pages(order);
            self.release(table, mapper, head, va, order);
            va += block_bytes(order);
        }
    }

    /// Take back a block whose pages were repurposed (as a slab) and free it.
    ///
    /// # Panics
    /// If any page of the block is unmapped.
    pub fn reclaim<M: PageMapper>(
        &mut self,
        table: &mut PageDescriptorTable<'_>,
        mapper: &M,
        va: VirtualAddress,
        order: u8,
    ) {
        tag_block(table, mapper, va, order);
        self.free(table, mapper, va);
    }

    /// Size of the allocated block headed at `va`.
    #[must_use]
    pub fn block_size<M: PageMapper>(
        &self,
        table: &PageDescriptorTable<'_>,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<u64> {
        let desc = table.get(mapper.translate(va)?.pfn());
        let block = desc.buddy()?;
        (block.vaddr == va && !desc.is_free_buddy()).then(|| block_bytes(block.order))
    }

    /// Addresses of the free blocks of `order`, in list order.
    pub fn free_blocks<'a>(
        &self,
        table: &'a PageDescriptorTable<'_>,
        order: u8,
    ) -> impl Iterator<Item = VirtualAddress> + 'a {
        let mut cursor = self.free.get(usize::from(order)).copied().flatten();
        core::iter::from_fn(move || {
            let block = block_of(table, cursor?);
            cursor = block.next;
            Some(block.vaddr)
        })
    }

    /// Merge upward from the block at `va` while its buddy is free and of the
    /// same order, then push the result.
    fn release<M: PageMapper>(
        &mut self,
        table: &mut PageDescriptorTable<'_>,
        mapper: &M,
        mut pfn: Pfn,
        mut va: VirtualAddress,
        mut order: u8,
    ) {
        while order < self.top_order {
            let buddy_va = self.base + buddy_address(va - self.base, order);
            let Some(buddy_pa) = mapper.translate(buddy_va) else {
                break;
            };
            let buddy_pfn = buddy_pa.pfn();
            if !table.contains(buddy_pfn) {
                break;
            }
            let desc = table.get(buddy_pfn);
            match desc.buddy() {
                Some(b) if desc.is_free_buddy() && b.order == order && b.vaddr == buddy_va => {}
                _ => break,
            }

            self.unlink(table, buddy_pfn, order);
            let (low_pfn, low_va, high_pfn) = if buddy_va < va {
                (buddy_pfn, buddy_va, pfn)
            } else {
                (pfn, va, buddy_pfn)
            };
            let high = table.get_mut(high_pfn);
            high.state = PageState::Heap(HeapPage::BuddyTail);
            high.flags = PageFlags::IS_BUDDY;

            pfn = low_pfn;
            va = low_va;
            order += 1;
        }

        write_head(table, pfn, va, order);
        self.push(table, pfn, order);
    }

    fn push(&mut self, table: &mut PageDescriptorTable<'_>, pfn: Pfn, order: u8) {
        let slot = usize::from(order);
        let old = self.free[slot];
        {
            let desc = table.get_mut(pfn);
            desc.flags.insert(PageFlags::VIRTUALLY_FREE);
            let block = block_of_mut(table, pfn);
            block.prev = None;
            block.next = old;
        }
        if let Some(old) = old {
            block_of_mut(table, old).prev = Some(pfn);
        }
        self.free[slot] = Some(pfn);
    }

    fn unlink(&mut self, table: &mut PageDescriptorTable<'_>, pfn: Pfn, order: u8) {
        let BuddyBlock { prev, next, .. } = *block_of(table, pfn);
        match prev {
            Some(p) => block_of_mut(table, p).next = next,
            None => self.free[usize::from(order)] = next,
        }
        if let Some(n) = next {
            block_of_mut(table, n).prev = prev;
        }
        table.get_mut(pfn).flags.remove(PageFlags::VIRTUALLY_FREE);
    }
}

/// Turn `pfn` into the (allocated, unlinked) head of an order-`order` block.
fn write_head(table: &mut PageDescriptorTable<'_>, pfn: Pfn, vaddr: VirtualAddress, order: u8) {
    let desc = table.get_mut(pfn);
    desc.state = PageState::Heap(HeapPage::Buddy(BuddyBlock {
        vaddr,
        order,
        prev: None,
        next: None,
    }));
    desc.flags = PageFlags::IS_BUDDY | PageFlags::IS_HEAD;
}

/// Tag the pages of `[va, va + block_bytes(order))` as one allocated block;
/// returns the head frame.
fn tag_block<M: PageMapper>(
    table: &mut PageDescriptorTable<'_>,
    mapper: &M,
    va: VirtualAddress,
    order: u8,
) -> Pfn {
    for page in 1..block_pages(order) {
        let tail = table.get_mut(frame_of(mapper, va.add_pages(page)));
        tail.state = PageState::Heap(HeapPage::BuddyTail);
        tail.flags = PageFlags::IS_BUDDY;
    }
    let head = frame_of(mapper, va);
    write_head(table, head, va, order);
    head
}

fn block_of<'a>(table: &'a PageDescriptorTable<'_>, pfn: Pfn) -> &'a BuddyBlock {
    let Some(block) = table.get(pfn).buddy() else {
        panic!("frame {pfn} on a buddy free list is not a block head");
    };
    block
}

fn block_of_mut<'a>(table: &'a mut PageDescriptorTable<'_>, pfn: Pfn) -> &'a mut BuddyBlock {
    let Some(block) = table.get_mut(pfn).buddy_mut() else {
        panic!("frame {pfn} on a buddy free list is not a block head");
    };
    block
}
