//! # Kernel Memory Layout and Boot Interface
//!
//! This crate holds the compile-time virtual memory layout used by the
//! kernel's memory manager and the contract through which boot code reports
//! physical memory to it.
//!
//! ## Architecture
//!
//! ### Memory Layout ([`memory`])
//! Fixed virtual windows and default sizes:
//! * **Bootstrap arena window**: where the page descriptor table lives
//! * **Heap window**: where the buddy/slab heap reserves and grows
//! * **Vmap window**: anonymous and device mappings
//! * **Low memory limit**: physical memory below 1 MiB is left alone
//!
//! ### Boot Information ([`boot`])
//! The [`BootMemoryMap`](boot::BootMemoryMap) trait abstracts over the
//! firmware memory map. Its consumer walks it once during initialization:
//! free regions, then reserved regions, then the kernel image and the boot page
//! tables.
//!
//! ```text
//! Physical Memory Layout:
//! 0x0000_0000 ┌─────────────────────────────────┐
//!             │     Low Memory (< 1MiB)         │
//!             │  (BIOS, VGA, DMA buffers)       │
//! 0x0010_0000 ├─────────────────────────────────┤ LOW_MEMORY_LIMIT
//!             │       Kernel Image              │
//!             ├─────────────────────────────────┤
//!             │    Available RAM                │
//!             │  (Managed by the frame allocator)│
//!             └─────────────────────────────────┘
//! ```
//!
//! ## Usage
//!
//! ```rust
//! use kernel_info::boot::{BootMemoryMap, BootRegions};
//! use kernel_info::memory::LOW_MEMORY_LIMIT;
//! use kernel_memory_addresses::{PhysicalAddress, PhysicalRange};
//!
//! let free = [PhysicalRange::new(
//!     PhysicalAddress::new(LOW_MEMORY_LIMIT),
//!     PhysicalAddress::new(0x400_0000),
//! )];
//! let map = BootRegions {
//!     max_physical: PhysicalAddress::new(0x400_0000),
//!     kernel_image: PhysicalRange::new(
//!         PhysicalAddress::new(LOW_MEMORY_LIMIT),
//!         PhysicalAddress::new(0x20_0000),
//!     ),
//!     free: &free,
//!     reserved: &[],
//!     page_tables: &[],
//! };
//! assert!(map.has_memory_map());
//! ```

#![cfg_attr(not(any(test, doctest)), no_std)]
#![deny(unsafe_code)]

pub mod boot;
pub mod memory;
