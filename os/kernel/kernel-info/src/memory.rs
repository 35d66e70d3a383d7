//! # Memory Layout
//!
//! Virtual windows and default sizes used by the kernel memory manager.
//!
//! ```text
//! PFN_DATABASE_BASE  ┌──────────────────────────────┐ 0xffff_c000_0000_0000
//!                    │ page descriptor table        │ (bootstrap arena)
//! PFN_DATABASE_END   ├──────────────────────────────┤
//!                    │            ...               │
//! HEAP_WINDOW_START  ├──────────────────────────────┤ 0xffff_d000_0000_0000
//!                    │ kernel heap (buddy + slab)   │
//! HEAP_WINDOW_END    ├──────────────────────────────┤
//!                    │            ...               │
//! VMAP_WINDOW_START  ├──────────────────────────────┤ 0xffff_e000_0000_0000
//!                    │ anonymous / MMIO mappings    │
//! VMAP_WINDOW_END    └──────────────────────────────┘
//! ```

/// Physical memory below this address is never handed out by the bootstrap
/// arena (BIOS data, legacy DMA buffers, real-mode trampolines).
pub const LOW_MEMORY_LIMIT: u64 = 0x0010_0000; // 1 MiB

/// Start of the virtual window the bootstrap arena carves the page
/// descriptor table out of.
pub const PFN_DATABASE_BASE: u64 = 0xffff_c000_0000_0000;

/// End (exclusive) of the bootstrap arena window.
pub const PFN_DATABASE_END: u64 = PFN_DATABASE_BASE + 0x40_0000_0000; // 256 GiB

/// Start of the virtual window the kernel heap is reserved in.
pub const HEAP_WINDOW_START: u64 = 0xffff_d000_0000_0000;

/// End (exclusive) of the kernel heap window.
pub const HEAP_WINDOW_END: u64 = HEAP_WINDOW_START + 0x100_0000_0000; // 1 TiB

/// Start of the window used for anonymous and device mappings.
pub const VMAP_WINDOW_START: u64 = 0xffff_e000_0000_0000;

/// End (exclusive) of the vmap window.
pub const VMAP_WINDOW_END: u64 = VMAP_WINDOW_START + 0x100_0000_0000; // 1 TiB

/// Largest block the heap's buddy allocator manages (`PAGE_SIZE << 19`).
pub const HEAP_MAX_BLOCK: u64 = 1 << 31;

/// Default virtual ceiling of the kernel heap.
pub const HEAP_DEFAULT_MAX_SIZE: u64 = 1 << 30; // 1 GiB

/// Bytes mapped when the heap is initialized.
pub const HEAP_DEFAULT_INITIAL_SIZE: u64 = 4 << 20; // 4 MiB

/// Minimum number of bytes mapped by a single heap growth.
pub const HEAP_DEFAULT_GROWTH_STEP: u64 = 1 << 20; // 1 MiB

const _: () = {
    assert!(PFN_DATABASE_END > PFN_DATABASE_BASE);
    assert!(HEAP_WINDOW_START >= PFN_DATABASE_END);
    assert!(VMAP_WINDOW_START >= HEAP_WINDOW_END);
    assert!(HEAP_DEFAULT_MAX_SIZE.is_power_of_two());
    assert!(HEAP_DEFAULT_MAX_SIZE <= HEAP_MAX_BLOCK);
    assert!(HEAP_DEFAULT_INITIAL_SIZE <= HEAP_DEFAULT_MAX_SIZE);
    assert!(HEAP_WINDOW_START.is_multiple_of(HEAP_DEFAULT_MAX_SIZE));
    assert!(HEAP_DEFAULT_GROWTH_STEP.is_multiple_of(4096));
};
