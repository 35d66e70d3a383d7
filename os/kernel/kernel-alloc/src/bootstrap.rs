//! # Bootstrap Arena
//!
//! Before the page descriptor table exists there is nothing that knows which
//! frames are free, so the table cannot come from the frame allocator. The
//! [`BootstrapArena`] bridges that gap: a bump allocator over a reserved
//! virtual window that takes frames straight from the boot memory map and maps
//! them on demand.
//!
//! Every frame it consumes is recorded so that the descriptor table can mark
//! them as [`PageFrameMetadata`](crate::pfn::PageType::PageFrameMetadata)
//! once it exists. The arena is only ever used during initialization;
//! [`finish`](BootstrapArena::finish) consumes it.

use crate::paging::{MapError, MapFlags, PageMapper};
use core::ptr::NonNull;
use kernel_info::boot::BootMemoryMap;
use kernel_info::memory::LOW_MEMORY_LIMIT;
use kernel_memory_addresses::{PAGE_SIZE, PhysicalAddress, PhysicalRange, VirtualAddress, align_up};
use log::{debug, trace};

/// Consumed frame ranges the arena can track. Adjacent frames merge into one
/// range, so this only runs out on badly fragmented memory maps.
pub const MAX_CONSUMED_RANGES: usize = 32;

#[derive(Debug, Copy, Clone, Eq, PartialEq, thiserror::Error)]
pub enum ArenaError {
    #[error("bootstrap window exhausted ({requested} bytes requested, {available} available)")]
    WindowExhausted { requested: u64, available: u64 },
    #[error("no free physical frame left for the bootstrap arena")]
    OutOfFrames,
    #[error("too many discontiguous frame ranges consumed")]
    TooManyRanges,
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(u64),
    #[error("failed to map bootstrap page: {0}")]
    Map(#[from] MapError),
}

/// Early bump allocator over a fixed virtual window.
#[derive(Debug)]
pub struct BootstrapArena {
    start: VirtualAddress,
    end: VirtualAddress,
    cursor: VirtualAddress,
    mapped_end: VirtualAddress,
    next_frame: PhysicalAddress,
    consumed: [PhysicalRange; MAX_CONSUMED_RANGES],
    consumed_len: usize,
}

/// What the arena used, handed back by [`BootstrapArena::finish`].
#[derive(Debug, Copy, Clone)]
pub struct BootstrapSummary {
    consumed: [PhysicalRange; MAX_CONSUMED_RANGES],
    consumed_len: usize,
    /// Start of the arena window.
    pub start: VirtualAddress,
    /// End of the mapped part of the window.
    pub mapped_end: VirtualAddress,
}

impl BootstrapSummary {
    /// Physical frame ranges backing the arena.
    #[must_use]
    pub fn consumed(&self) -> &[PhysicalRange] {
        &self.consumed[..self.consumed_len]
    }
}

impl BootstrapArena {
    /// An arena over the page-aligned window `[start, end)`.
    #[must_use]
    pub const fn new(start: VirtualAddress, end: VirtualAddress) -> Self {
        let empty = PhysicalRange::new(PhysicalAddress::zero(), PhysicalAddress::zero());
        Self {
            start,
            end,
            cursor: start,
            mapped_end: start,
            next_frame: PhysicalAddress::new(LOW_MEMORY_LIMIT),
            consumed: [empty; MAX_CONSUMED_RANGES],
            consumed_len: 0,
        }
    }

    /// Bump-allocate `size` bytes aligned to `align`, mapping fresh frames
    /// behind the cursor as needed. The memory is not zeroed.
    ///
    /// # Errors
    /// The window is too small, the memory map has no suitable frame left, a
    /// mapping failed or the consumed-range table overflowed. The cursor is
    /// left unchanged on failure; frames mapped before the failure stay
    /// recorded.
    pub fn alloc<B, M>(
        &mut self,
        size: u64,
        align: u64,
        boot: &B,
        mapper: &mut M,
    ) -> Result<NonNull<u8>, ArenaError>
    where
        B: BootMemoryMap + ?Sized,
        M: PageMapper,
    {
        if !align.is_power_of_two() {
            return Err(ArenaError::InvalidAlignment(align));
        }

        let start = align_up(self.cursor.as_u64(), align);
        let available = self.end.as_u64().saturating_sub(start);
        if size > available {
            return Err(ArenaError::WindowExhausted {
                requested: size,
                available,
            });
        }
        let end = VirtualAddress::new(start + size);

        while self.mapped_end < end {
            let frame = self.take_frame(boot)?;
            mapper.map(self.mapped_end, frame, 1, MapFlags::KERNEL_DATA)?;
            self.mapped_end = self.mapped_end.add_pages(1);
        }

        self.cursor = end;
        trace!("bootstrap arena: {size} bytes at {start:#x}");
        let va = VirtualAddress::new(start);
        NonNull::new(va.as_mut_ptr()).ok_or(ArenaError::WindowExhausted {
            requested: size,
            available,
        })
    }

    /// Frames taken so far.
    #[must_use]
    pub fn consumed(&self) -> &[PhysicalRange] {
        &self.consumed[..self.consumed_len]
    }

    /// Bytes handed out so far.
    #[must_use]
    pub fn used_bytes(&self) -> u64 {
        self.cursor - self.start
    }

    /// Retire the arena.
    #[must_use]
    pub fn finish(self) -> BootstrapSummary {
        debug!(
            "bootstrap arena retired: {} bytes used, {} frame range(s)",
            self.used_bytes(),
            self.consumed_len
        );
        BootstrapSummary {
            consumed: self.consumed,
            consumed_len: self.consumed_len,
            start: self.start,
            mapped_end: self.mapped_end,
        }
    }

    /// The lowest free frame at or above `next_frame` that is not below
    /// 1 MiB, part of the kernel image, reserved, or a boot page table.
    fn take_frame<B: BootMemoryMap + ?Sized>(
        &mut self,
        boot: &B,
    ) -> Result<PhysicalAddress, ArenaError> {
        loop {
            let Some(candidate) = self.lowest_free_at_or_above(boot) else {
                return Err(ArenaError::OutOfFrames);
            };
            if let Some(skip_to) = Self::excluded(boot, candidate) {
                self.next_frame = skip_to.page_align_up();
                continue;
            }

            self.record(candidate)?;
            self.next_frame = candidate + PAGE_SIZE;
            return Ok(candidate);
        }
    }

    fn lowest_free_at_or_above<B: BootMemoryMap + ?Sized>(
        &self,
        boot: &B,
    ) -> Option<PhysicalAddress> {
        let floor = self.next_frame.as_u64().max(LOW_MEMORY_LIMIT);
        let mut best: Option<u64> = None;
        let mut consider = |r: PhysicalRange| {
            let start = r.start().page_align_up().as_u64().max(floor);
            let end = r.end().page_base().as_u64();
            if start < end && best.is_none_or(|b| start < b) {
                best = Some(start);
            }
        };

        if boot.has_memory_map() {
            boot.for_each_free_region(&mut consider);
        } else {
            consider(PhysicalRange::new(
                PhysicalAddress::new(LOW_MEMORY_LIMIT),
                boot.max_physical_address(),
            ));
        }
        best.map(PhysicalAddress::new)
    }

    /// Where to resume the search if `frame` must not be used.
    fn excluded<B: BootMemoryMap + ?Sized>(
        boot: &B,
        frame: PhysicalAddress,
    ) -> Option<PhysicalAddress> {
        let page = PhysicalRange::new(frame, frame + PAGE_SIZE);
        let image = boot.kernel_image();
        if image.overlaps(&page) {
            return Some(image.end());
        }

        let mut skip_to: Option<PhysicalAddress> = None;
        boot.for_each_reserved_region(&mut |r| {
            if r.overlaps(&page) {
                skip_to = skip_to.max(Some(r.end()));
            }
        });
        boot.for_each_page_table_frame(&mut |pa| {
            if pa.page_base() == frame {
                skip_to = skip_to.max(Some(frame + PAGE_SIZE));
            }
        });
        skip_to
    }

    fn record(&mut self, frame: PhysicalAddress) -> Result<(), ArenaError> {
        if let Some(last) = self.consumed[..self.consumed_len].last_mut()
            && last.end() == frame
        {
            *last = PhysicalRange::new(last.start(), frame + PAGE_SIZE);
            return Ok(());
        }
        if self.consumed_len == MAX_CONSUMED_RANGES {
            return Err(ArenaError::TooManyRanges);
        }
        self.consumed[self.consumed_len] = PhysicalRange::new(frame, frame + PAGE_SIZE);
        self.consumed_len += 1;
        Ok(())
    }
}
