//! # Kernel Memory Allocation
//!
//! Physical page management and the kernel heap, from the first frame taken
//! out of the boot memory map up to `#[global_allocator]`.
//!
//! ## Architecture Overview
//!
//! ```text
//! ┌─────────────────────────────────────────────────────┐
//! │          Memory Manager (KernelMemory)              │
//! │    • heap, frame and mapping surface                │
//! │    • optional GlobalAlloc wrapper (LockedHeap)      │
//! └──────────┬───────────────────────────┬──────────────┘
//!            │                           │
//! ┌──────────▼─────────────┐  ┌──────────▼──────────────┐
//! │      Kernel Heap       │  │   Virtual Regions       │
//! │  • slab size classes   │  │  • red-black interval   │
//! │  • buddy blocks        │  │    tree, gap search     │
//! │  • on-demand growth    │  │                         │
//! └──────────┬─────────────┘  └─────────────────────────┘
//!            │
//! ┌──────────▼──────────────────────────────────────────┐
//! │      Frame Allocator + Page Descriptor Table        │
//! │    • one descriptor per physical frame              │
//! │    • free runs threaded through descriptors         │
//! └─────────────────────────────────────────────────────┘
//! ```
//!
//! ## Core Components
//!
//! ### Page Descriptors ([`pfn`])
//!
//! Every physical frame has a [`PageDescriptor`](pfn::PageDescriptor): a
//! type tag with a type-specific payload, a reference count and flags. The
//! free lists of the frame allocator and of both heap layers are linked by
//! PFN through these descriptors; no list needs memory of its own.
//!
//! ### Bootstrap ([`bootstrap`])
//!
//! The descriptor table is itself allocated before anything else can
//! allocate. A bump arena takes frames directly from the boot memory map and
//! maps them into a reserved window; the frames it used are then marked as
//! metadata.
//!
//! ### Frame Allocator ([`frame_alloc`])
//!
//! First-fit over runs of free frames, carving allocations from the end of a
//! run and merging freed frames with both neighbors.
//!
//! ### Heap ([`heap`])
//!
//! Requests up to 64 KiB are served by slab caches, larger ones by a buddy
//! allocator. Both live inside one virtual window that is mapped on demand.
//!
//! ### Virtual Regions ([`vregion`])
//!
//! Tracks which parts of the kernel address space are reserved, and finds
//! free gaps for new reservations.
//!
//! ### Paging ([`paging`])
//!
//! The crate never touches page tables; it calls a
//! [`PageMapper`](paging::PageMapper) supplied by the kernel.
//!
//! ## Usage
//!
//! ```rust,ignore
//! use kernel_alloc::bootstrap::BootstrapArena;
//! use kernel_alloc::manager::{KernelMemory, MemoryConfig};
//! use kernel_info::memory::{PFN_DATABASE_BASE, PFN_DATABASE_END};
//! use kernel_memory_addresses::VirtualAddress;
//!
//! let arena = BootstrapArena::new(
//!     VirtualAddress::new(PFN_DATABASE_BASE),
//!     VirtualAddress::new(PFN_DATABASE_END),
//! );
//! let config = MemoryConfig::default();
//! let mut memory = unsafe { KernelMemory::bootstrap(&boot, arena, mapper, config)? };
//!
//! let buf = memory.allocate(200)?;
//! memory.free(buf);
//! ```
//!
//! ## Concurrency
//!
//! Nothing in this crate locks except [`LockedHeap`](global::LockedHeap).
//! Callers that allocate from interrupt context mask interrupts themselves.

#![cfg_attr(not(any(test, doctest)), no_std)]

pub mod bootstrap;
pub mod frame_alloc;
pub mod global;
pub mod heap;
pub mod manager;
pub mod paging;
pub mod pfn;
pub mod vregion;

pub use global::LockedHeap;
pub use heap::{HeapConfig, HeapError};
pub use manager::{KernelMemory, MemoryConfig};
pub use paging::{MapError, MapFlags, PageMapper};
