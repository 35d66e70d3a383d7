//! # Slab Allocator
//!
//! Small allocations are served from *slabs*: buddy blocks cut into
//! equally sized objects. Each cache (one per size class, plus any custom
//! caches) keeps a list of its partially used slabs; full slabs drop off the
//! list and empty slabs go straight back to the buddy allocator.
//!
//! Free objects form an intrusive singly linked list: the first four bytes of
//! a free object hold the index of the next free object in the same slab, or
//! [`SLAB_END`]. The slab's metadata lives in the page descriptor of its first
//! page; the other pages point back to it.
//!
//! ```text
//!   slab block (1 page, 64-byte objects)
//!   ┌────┬────┬────┬────┬─────┬────┐
//!   │ 3  │used│used│ 5  │ ... │END │   free_head = 0
//!   └────┴────┴────┴────┴─────┴────┘
//!    0    1    2    3          63
//! ```

use super::HeapError;
use super::buddy::{BuddyAllocator, block_bytes};
use super::frame_of;
use crate::paging::PageMapper;
use crate::pfn::{HeapPage, PageDescriptorTable, PageFlags, PageState, SLAB_END, SlabPage};
use kernel_memory_addresses::{PAGE_SIZE, Pfn, VirtualAddress, align_up};
use log::{debug, trace};

/// Smallest general size class.
pub const SMALLEST_CLASS: u64 = 16;

/// Largest general size class; bigger requests go to the buddy allocator.
pub const LARGEST_CLASS: u64 = 64 * 1024;

/// Number of general size classes (16 B to 64 KiB).
pub const GENERAL_CLASSES: usize = 13;

/// Number of caller-created caches that can exist at once.
pub const MAX_CUSTOM_CACHES: usize = 16;

/// A new slab holds at least this many objects, unless capped by
/// [`MAX_SLAB_PAGES`].
pub const MIN_OBJECTS_PER_SLAB: u64 = 32;

/// Upper bound on the size of a single slab.
pub const MAX_SLAB_PAGES: u64 = 64;

const CACHE_SLOTS: usize = GENERAL_CLASSES + MAX_CUSTOM_CACHES;

const CLASS_NAMES: [&str; GENERAL_CLASSES] = [
    "kmalloc-16",
    "kmalloc-32",
    "kmalloc-64",
    "kmalloc-128",
    "kmalloc-256",
    "kmalloc-512",
    "kmalloc-1024",
    "kmalloc-2048",
    "kmalloc-4096",
    "kmalloc-8192",
    "kmalloc-16384",
    "kmalloc-32768",
    "kmalloc-65536",
];

const _: () = assert!(SMALLEST_CLASS << (GENERAL_CLASSES - 1) == LARGEST_CLASS);

/// Handle of a slab cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub struct CacheId(u8);

impl CacheId {
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }

    /// Whether this is one of the built-in size classes.
    #[must_use]
    pub const fn is_general(self) -> bool {
        self.index() < GENERAL_CLASSES
    }
}

/// The general size class serving `size` bytes.
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn class_for(size: u64) -> Option<CacheId> {
    if size == 0 || size > LARGEST_CLASS {
        return None;
    }
    let rounded = if size < SMALLEST_CLASS { SMALLEST_CLASS } else { size.next_power_of_two() };
    Some(CacheId((rounded.trailing_zeros() - SMALLEST_CLASS.trailing_zeros()) as u8))
}

/// Buddy order of a new slab for objects of `obj_size` bytes: the smallest
/// power-of-two page count holding [`MIN_OBJECTS_PER_SLAB`] objects, capped at
/// [`MAX_SLAB_PAGES`].
#[must_use]
#[allow(clippy::cast_possible_truncation)]
pub const fn slab_order(obj_size: u64) -> u8 {
    let pages = (obj_size * MIN_OBJECTS_PER_SLAB).div_ceil(PAGE_SIZE);
    let pages = if pages > MAX_SLAB_PAGES { MAX_SLAB_PAGES } else { pages };
    pages.next_power_of_two().trailing_zeros() as u8
}

#[derive(Copy, Clone, Debug)]
struct SlabCache {
    name: &'static str,
    obj_size: u64,
    partial: Option<Pfn>,
    slabs: u64,
    live: u64,
}

impl SlabCache {
    const fn new(name: &'static str, obj_size: u64) -> Self {
        Self {
            name,
            obj_size,
            partial: None,
            slabs: 0,
            live: 0,
        }
    }
}

/// Counters of one cache.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct CacheStats {
    pub name: &'static str,
    pub obj_size: u64,
    pub slabs: u64,
    pub live_objects: u64,
}

/// Object accounting of a single slab.
#[derive(Copy, Clone, Debug, Eq, PartialEq)]
pub struct SlabOccupancy {
    pub used: u32,
    pub free: u32,
    pub capacity: u32,
}

/// The general size classes and custom caches.
#[derive(Debug)]
pub struct SlabAllocator {
    caches: [Option<SlabCache>; CACHE_SLOTS],
}

impl Default for SlabAllocator {
    fn default() -> Self {
        Self::new()
    }
}

impl SlabAllocator {
    #[must_use]
    pub const fn new() -> Self {
        let mut caches = [None; CACHE_SLOTS];
        let mut i = 0;
        while i < GENERAL_CLASSES {
            caches[i] = Some(SlabCache::new(CLASS_NAMES[i], SMALLEST_CLASS << i));
            i += 1;
        }
        Self { caches }
    }

    /// Register a cache for objects of `size` bytes, rounded up to a multiple
    /// of 16.
    ///
    /// # Errors
    /// [`HeapError::ZeroSize`], [`HeapError::TooLarge`] above
    /// [`LARGEST_CLASS`], or [`HeapError::CacheTableFull`].
    #[allow(clippy::cast_possible_truncation)]
    pub fn create_cache(&mut self, name: &'static str, size: u64) -> Result<CacheId, HeapError> {
        if size == 0 {
            return Err(HeapError::ZeroSize);
        }
        if size > LARGEST_CLASS {
            return Err(HeapError::TooLarge { size });
        }
        let obj_size = align_up(size, SMALLEST_CLASS);
        let slot = (GENERAL_CLASSES..CACHE_SLOTS)
            .find(|&i| self.caches[i].is_none())
            .ok_or(HeapError::CacheTableFull)?;
        self.caches[slot] = Some(SlabCache::new(name, obj_size));
        debug!("slab: created cache \"{name}\" with {obj_size}-byte objects");
        Ok(CacheId(slot as u8))
    }

    /// Remove an empty custom cache.
    ///
    /// # Errors
    /// [`HeapError::UnknownCache`] for general classes and unknown ids,
    /// [`HeapError::CacheBusy`] while objects are still allocated.
    pub fn destroy_cache(&mut self, id: CacheId) -> Result<(), HeapError> {
        if id.is_general() {
            return Err(HeapError::UnknownCache);
        }
        let cache = self.cache(id)?;
        if cache.live > 0 {
            return Err(HeapError::CacheBusy { live: cache.live });
        }
        debug_assert_eq!(cache.slabs, 0, "empty cache still owns slabs");
        debug!("slab: destroyed cache \"{}\"", cache.name);
        self.caches[id.index()] = None;
        Ok(())
    }

    /// Object size of cache `id`.
    ///
    /// # Errors
    /// [`HeapError::UnknownCache`].
    pub fn obj_size(&self, id: CacheId) -> Result<u64, HeapError> {
        Ok(self.cache(id)?.obj_size)
    }

    /// Bytes of buddy memory a new slab of cache `id` needs.
    ///
    /// # Errors
    /// [`HeapError::UnknownCache`].
    pub fn slab_bytes(&self, id: CacheId) -> Result<u64, HeapError> {
        Ok(block_bytes(slab_order(self.obj_size(id)?)))
    }

    /// # Errors
    /// [`HeapError::UnknownCache`].
    pub fn stats(&self, id: CacheId) -> Result<CacheStats, HeapError> {
        let c = self.cache(id)?;
        Ok(CacheStats {
            name: c.name,
            obj_size: c.obj_size,
            slabs: c.slabs,
            live_objects: c.live,
        })
    }

    /// Slabs currently owned by all caches.
    #[must_use]
    pub fn slab_count(&self) -> u64 {
        self.caches.iter().flatten().map(|c| c.slabs).sum()
    }

    /// Live objects across all caches.
    #[must_use]
    pub fn live_objects(&self) -> u64 {
        self.caches.iter().flatten().map(|c| c.live).sum()
    }

    /// Hand out one object of cache `id`. `Ok(None)` means a new slab was
    /// needed and the buddy allocator had no block for it.
    ///
    /// # Errors
    /// [`HeapError::UnknownCache`].
    pub fn allocate<M: PageMapper>(
        &mut self,
        id: CacheId,
        table: &mut PageDescriptorTable<'_>,
        mapper: &M,
        buddy: &mut BuddyAllocator,
    ) -> Result<Option<VirtualAddress>, HeapError> {
        let head = match self.cache(id)?.partial {
            Some(head) => head,
            None => match self.new_slab(id, table, mapper, buddy)? {
                Some(head) => head,
                None => return Ok(None),
            },
        };

        let slab = slab_of_mut(table, head);
        debug_assert_ne!(slab.free_head, SLAB_END, "full slab on the partial list");
        let obj = object_address(slab, slab.free_head);
        slab.free_head = read_link(obj);
        slab.used_count += 1;
        let full = slab.used_count == slab.obj_count;

        if full {
            self.unlink(table, id, head);
        }
        self.cache_mut(id)?.live += 1;
        trace!("slab: {obj} from {}", self.cache(id)?.name);
        Ok(Some(obj))
    }

    /// Return the object at `va`. With `expected`, the object must belong to
    /// that cache.
    ///
    /// # Panics
    /// If `va` is not an object boundary inside a slab, belongs to another
    /// cache than `expected`, or is already free.
    pub fn free<M: PageMapper>(
        &mut self,
        table: &mut PageDescriptorTable<'_>,
        mapper: &M,
        buddy: &mut BuddyAllocator,
        va: VirtualAddress,
        expected: Option<CacheId>,
    ) {
        let Some(head) = slab_head_of(table, mapper, va) else {
            panic!("slab free of {va}, which is not inside a slab");
        };
        let slab = *slab_of(table, head);
        let id = CacheId(slab.cache);
        if let Some(expected) = expected {
            assert_eq!(id, expected, "object at {va} freed to the wrong cache");
        }
        let Some(index) = object_index(&slab, va) else {
            panic!("slab free of {va}, which is not an object boundary");
        };
        assert!(
            slab.used_count > 0 && !FreeList::new(&slab).any(|i| i == index),
            "double free of slab object at {va}"
        );

        let was_full = slab.used_count == slab.obj_count;
        write_link(va, slab.free_head);
        let slab = slab_of_mut(table, head);
        slab.free_head = index;
        slab.used_count -= 1;
        let now_empty = slab.used_count == 0;
        let snapshot = *slab;

        if let Some(cache) = self.caches[id.index()].as_mut() {
            cache.live -= 1;
        }
        trace!("slab: freed {va}");

        match (was_full, now_empty) {
            (was_full, true) => {
                if !was_full {
                    self.unlink(table, id, head);
                }
                self.release_slab(table, mapper, buddy, &snapshot);
            }
            (true, false) => self.push(table, id, head),
            (false, false) => {}
        }
    }

    /// Object size of the live object at `va`, if `va` is an object boundary
    /// inside a slab.
    #[must_use]
    pub fn usable_size<M: PageMapper>(
        &self,
        table: &PageDescriptorTable<'_>,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<u64> {
        let slab = slab_of(table, slab_head_of(table, mapper, va)?);
        object_index(slab, va).map(|_| u64::from(slab.obj_size))
    }

    /// Walk the free list of the slab containing `va`.
    #[must_use]
    pub fn occupancy<M: PageMapper>(
        &self,
        table: &PageDescriptorTable<'_>,
        mapper: &M,
        va: VirtualAddress,
    ) -> Option<SlabOccupancy> {
        let slab = slab_of(table, slab_head_of(table, mapper, va)?);
        let free = u32::try_from(FreeList::new(slab).count()).unwrap_or(u32::MAX);
        Some(SlabOccupancy {
            used: slab.used_count,
            free,
            capacity: slab.obj_count,
        })
    }

    #[allow(clippy::cast_possible_truncation)]
    fn new_slab<M: PageMapper>(
        &mut self,
        id: CacheId,
        table: &mut PageDescriptorTable<'_>,
        mapper: &M,
        buddy: &mut BuddyAllocator,
    ) -> Result<Option<Pfn>, HeapError> {
        let obj_size = self.cache(id)?.obj_size;
        let order = slab_order(obj_size);
        let Some(va) = buddy.allocate(table, mapper, order) else {
            return Ok(None);
        };

        let bytes = block_bytes(order);
        let num_pages = (bytes / PAGE_SIZE) as u32;
        let obj_count = (bytes / obj_size) as u32;
        for i in 0..obj_count {
            let next = if i + 1 < obj_count { i + 1 } else { SLAB_END };
            write_link(va + u64::from(i) * obj_size, next);
        }

        let head = frame_of(mapper, va);
        for page in 1..u64::from(num_pages) {
            let tail = table.get_mut(frame_of(mapper, va.add_pages(page)));
            tail.state = PageState::Heap(HeapPage::SlabTail { head });
            tail.flags = PageFlags::empty();
        }
        let desc = table.get_mut(head);
        desc.state = PageState::Heap(HeapPage::Slab(SlabPage {
            cache: id.0,
            vaddr: va,
            obj_size: obj_size as u32,
            obj_count,
            used_count: 0,
            free_head: 0,
            prev: None,
            next: None,
            num_pages,
        }));
        desc.flags = PageFlags::IS_HEAD;

        self.push(table, id, head);
        self.cache_mut(id)?.slabs += 1;
        debug!(
            "slab: new {num_pages}-page slab for \"{}\" at {va} ({obj_count} objects)",
            self.cache(id)?.name
        );
        Ok(Some(head))
    }

    fn release_slab<M: PageMapper>(
        &mut self,
        table: &mut PageDescriptorTable<'_>,
        mapper: &M,
        buddy: &mut BuddyAllocator,
        slab: &SlabPage,
    ) {
        if let Some(cache) = self.caches[usize::from(slab.cache)].as_mut() {
            cache.slabs -= 1;
        }
        trace!("slab: releasing empty slab at {}", slab.vaddr);
        // slabs are whole buddy blocks, so `num_pages` is a power of two
        #[allow(clippy::cast_possible_truncation)]
        let order = slab.num_pages.trailing_zeros() as u8;
        buddy.reclaim(table, mapper, slab.vaddr, order);
    }

    fn push(&mut self, table: &mut PageDescriptorTable<'_>, id: CacheId, head: Pfn) {
        let Some(cache) = self.caches[id.index()].as_mut() else {
            panic!("slab list operation on destroyed cache {id:?}");
        };
        let old = cache.partial;
        let slab = slab_of_mut(table, head);
        slab.prev = None;
        slab.next = old;
        if let Some(old) = old {
            slab_of_mut(table, old).prev = Some(head);
        }
        cache.partial = Some(head);
    }

    fn unlink(&mut self, table: &mut PageDescriptorTable<'_>, id: CacheId, head: Pfn) {
        let Some(cache) = self.caches[id.index()].as_mut() else {
            panic!("slab list operation on destroyed cache {id:?}");
        };
        let SlabPage { prev, next, .. } = *slab_of(table, head);
        match prev {
            Some(p) => slab_of_mut(table, p).next = next,
            None => cache.partial = next,
        }
        if let Some(n) = next {
            slab_of_mut(table, n).prev = prev;
        }
        let slab = slab_of_mut(table, head);
        slab.prev = None;
        slab.next = None;
    }

    fn cache(&self, id: CacheId) -> Result<&SlabCache, HeapError> {
        self.caches
            .get(id.index())
            .and_then(Option::as_ref)
            .ok_or(HeapError::UnknownCache)
    }

    fn cache_mut(&mut self, id: CacheId) -> Result<&mut SlabCache, HeapError> {
        self.caches
            .get_mut(id.index())
            .and_then(Option::as_mut)
            .ok_or(HeapError::UnknownCache)
    }
}

/// Iterator over the free object indices of a slab.
struct FreeList {
    base: VirtualAddress,
    size: u64,
    cursor: u32,
    remaining: u32,
}

impl FreeList {
    fn new(slab: &SlabPage) -> Self {
        Self {
            base: slab.vaddr,
            size: u64::from(slab.obj_size),
            cursor: slab.free_head,
            remaining: slab.obj_count,
        }
    }
}

impl Iterator for FreeList {
    type Item = u32;

    fn next(&mut self) -> Option<u32> {
        if self.cursor == SLAB_END {
            return None;
        }
        assert!(
            self.remaining > 0,
            "slab free list at {} is cyclic",
            self.base
        );
        self.remaining -= 1;
        let index = self.cursor;
        self.cursor = read_link(self.base + u64::from(index) * self.size);
        Some(index)
    }
}

fn slab_head_of<M: PageMapper>(
    table: &PageDescriptorTable<'_>,
    mapper: &M,
    va: VirtualAddress,
) -> Option<Pfn> {
    let page = mapper.translate(va.page_base())?.pfn();
    let desc = table.get(page);
    if desc.slab().is_some() {
        Some(page)
    } else {
        desc.slab_head()
    }
}

fn slab_of<'a>(table: &'a PageDescriptorTable<'_>, head: Pfn) -> &'a SlabPage {
    let Some(slab) = table.get(head).slab() else {
        panic!("frame {head} is not a slab head");
    };
    slab
}

fn slab_of_mut<'a>(table: &'a mut PageDescriptorTable<'_>, head: Pfn) -> &'a mut SlabPage {
    let Some(slab) = table.get_mut(head).slab_mut() else {
        panic!("frame {head} is not a slab head");
    };
    slab
}

fn object_address(slab: &SlabPage, index: u32) -> VirtualAddress {
    slab.vaddr + u64::from(index) * u64::from(slab.obj_size)
}

#[allow(clippy::cast_possible_truncation)]
fn object_index(slab: &SlabPage, va: VirtualAddress) -> Option<u32> {
    let offset = va.as_u64().checked_sub(slab.vaddr.as_u64())?;
    let size = u64::from(slab.obj_size);
    let index = offset / size;
    (offset.is_multiple_of(size) && index < u64::from(slab.obj_count)).then_some(index as u32)
}

fn read_link(obj: VirtualAddress) -> u32 {
    // SAFETY: `obj` is an object inside a slab block, which the heap mapped
    // through its `PageMapper` and which stays mapped while the slab exists.
    unsafe { obj.as_mut_ptr::<u32>().read() }
}

fn write_link(obj: VirtualAddress, next: u32) {
    // SAFETY: as in `read_link`; objects are at least 16 bytes and 16-byte
    // aligned, so the link fits.
    unsafe { obj.as_mut_ptr::<u32>().write(next) }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_classes() {
        assert_eq!(class_for(0), None);
        assert_eq!(class_for(1), Some(CacheId(0)));
        assert_eq!(class_for(16), Some(CacheId(0)));
        assert_eq!(class_for(17), Some(CacheId(1)));
        assert_eq!(class_for(64), Some(CacheId(2)));
        assert_eq!(class_for(4097), Some(CacheId(9)));
        assert_eq!(class_for(LARGEST_CLASS), Some(CacheId(12)));
        assert_eq!(class_for(LARGEST_CLASS + 1), None);
    }

    #[test]
    fn general_caches_match_their_class() {
        let slabs = SlabAllocator::new();
        for i in 0..GENERAL_CLASSES {
            let id = CacheId(u8::try_from(i).unwrap());
            let size = slabs.obj_size(id).unwrap();
            assert_eq!(class_for(size), Some(id));
            assert_eq!(slabs.stats(id).unwrap().name, CLASS_NAMES[i]);
        }
        assert_eq!(
            slabs.obj_size(CacheId(GENERAL_CLASSES as u8)),
            Err(HeapError::UnknownCache)
        );
    }

    #[test]
    fn slab_sizing() {
        // 64-byte objects: one page already holds 64 of them
        assert_eq!(slab_order(64), 0);
        assert_eq!(slab_order(128), 0);
        assert_eq!(slab_order(256), 1);
        assert_eq!(slab_order(4096), 5);
        // capped at 64 pages
        assert_eq!(slab_order(LARGEST_CLASS), 6);
    }

    #[test]
    fn custom_cache_lifecycle() {
        let mut slabs = SlabAllocator::new();
        let id = slabs.create_cache("inode", 100).unwrap();
        assert!(!id.is_general());
        assert_eq!(slabs.obj_size(id), Ok(112));
        assert_eq!(slabs.destroy_cache(id), Ok(()));
        assert_eq!(slabs.obj_size(id), Err(HeapError::UnknownCache));
        assert_eq!(
            slabs.destroy_cache(CacheId(0)),
            Err(HeapError::UnknownCache)
        );
    }

    #[test]
    fn cache_table_fills_up() {
        let mut slabs = SlabAllocator::new();
        for _ in 0..MAX_CUSTOM_CACHES {
            slabs.create_cache("c", 24).unwrap();
        }
        assert_eq!(slabs.create_cache("c", 24), Err(HeapError::CacheTableFull));
        assert_eq!(slabs.create_cache("z", 0), Err(HeapError::ZeroSize));
        let size = LARGEST_CLASS + 1;
        assert_eq!(
            slabs.create_cache("z", size),
            Err(HeapError::TooLarge { size })
        );
    }
}
