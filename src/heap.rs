//! The allocation engine. A [`Heap`] owns every region, the free index and
//! the guarded allocations, and is always used behind the allocator's lock.

use std::{
    cmp,
    ptr::NonNull,
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, error, trace};

use crate::{
    block::{self, BLOCK_HEADER_SIZE, BlockNode, MIN_PAYLOAD, State},
    config::Config,
    error::{AllocError, Result},
    freelist::{FreeIndex, aligned_offset},
    guard::GuardedAllocations,
    kernel,
    list::List,
    region::{REGION_HEADER_SIZE, Region, RegionNode},
    utils::{MIN_ALIGN, align, checked_align, is_aligned},
};

/// Snapshot of the heap's bookkeeping, computed by walking every header.
///
/// `allocated_bytes + free_bytes + overhead_bytes == mapped_bytes` always
/// holds: every mapped byte is either payload or metadata.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeapStats {
    /// Regions carved into blocks.
    pub regions: usize,
    /// Allocations living in a guarded mapping of their own.
    pub guarded: usize,
    /// Bytes obtained from the operating system.
    pub mapped_bytes: usize,
    pub allocated_blocks: usize,
    /// Payload bytes of allocated blocks, cached ones included.
    pub allocated_bytes: usize,
    pub free_blocks: usize,
    pub free_bytes: usize,
    /// Region and block headers, guard pages and guarded slack.
    pub overhead_bytes: usize,
    /// Blocks parked in thread caches. They count as allocated.
    pub cached_blocks: usize,
    pub cached_bytes: usize,
}

/// Ids start at 1, 0 means "no heap".
static NEXT_HEAP_ID: AtomicUsize = AtomicUsize::new(1);

pub(crate) struct Heap {
    /// Stamped on every region, so pointers of other heaps are told apart.
    id: usize,
    /// Linked list of allocator memory [`Region`]
    regions: List<Region>,
    /// Free blocks of every region, by size class.
    free: FreeIndex,
    guarded: GuardedAllocations,
    config: Config,
}

/// Raw pointers in the heap only reach memory the heap owns, and the heap is
/// only touched under the allocator's lock.
unsafe impl Send for Heap {}

/// Payload size actually reserved for a request of `size` bytes.
pub(crate) fn request_size(size: usize) -> Result<usize> {
    checked_align(size, MIN_ALIGN)
        .map(|size| cmp::max(size, MIN_PAYLOAD))
        .ok_or(AllocError::OutOfMemory { size })
}

#[inline]
fn region_of<'a>(node: BlockNode) -> &'a mut Region {
    // SAFETY: every block header points at the live region containing it.
    unsafe { &mut (*node.as_ref().data.region.as_ptr()).data }
}

impl Heap {
    pub fn new(config: Config) -> Self {
        Self {
            id: NEXT_HEAP_ID.fetch_add(1, Ordering::Relaxed),
            regions: List::new(),
            free: FreeIndex::new(),
            guarded: GuardedAllocations::new(config.guard_location),
            config,
        }
    }

    #[inline]
    pub fn id(&self) -> usize {
        self.id
    }

    /// Smallest payload worth splitting off a block.
    fn min_split(&self) -> usize {
        cmp::max(MIN_PAYLOAD, align(self.config.split_threshold, MIN_ALIGN))
    }

    /// Allocates `size` (non zero) bytes at `alignment`, which must already
    /// be validated and at least [`MIN_ALIGN`]. Maps a new region if no free
    /// block fits.
    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        if self.config.guard_pages() {
            return self.guarded.allocate(size, alignment);
        }

        let needed = request_size(size)?;

        let block = match self.free.find_fit(needed, alignment) {
            Some(block) => block,
            None => self.allocate_new_region(needed, alignment)?,
        };

        self.carve(block, needed, alignment)
    }

    /// Like [`Heap::allocate`] but never maps memory: `None` means no free
    /// block fits right now.
    pub fn allocate_from_index(&mut self, size: usize, alignment: usize) -> Result<Option<NonNull<u8>>> {
        if self.config.guard_pages() {
            return self.guarded.allocate(size, alignment).map(Some);
        }

        let needed = request_size(size)?;

        if self.free.is_empty() {
            return Ok(None);
        }

        self.free
            .find_fit(needed, alignment)
            .map(|block| self.carve(block, needed, alignment))
            .transpose()
    }

    /// This function maps a new region and returns its single free block.
    ///
    /// If we don't have any free block we can use, we know for sure there
    /// is no way we can allocate the requested size in our current regions.
    /// The region is at least `region_size` bytes; bigger requests get a
    /// region sized for them, with room for an alignment padding block.
    fn allocate_new_region(&mut self, needed: usize, alignment: usize) -> Result<BlockNode> {
        let padding = if alignment > MIN_ALIGN {
            alignment + BLOCK_HEADER_SIZE + MIN_PAYLOAD
        } else {
            0
        };

        let bytes = [REGION_HEADER_SIZE, BLOCK_HEADER_SIZE, padding]
            .into_iter()
            .try_fold(needed, usize::checked_add)
            .ok_or(AllocError::OutOfMemory { size: needed })?;

        let mapping = kernel::acquire(cmp::max(bytes, self.config.region_size))?;

        unsafe {
            let (_, block) = Region::install(&mut self.regions, mapping, self.id);
            self.free.insert(block);

            debug!(
                "new region of {} bytes at {:p}, {} regions",
                mapping.len,
                mapping.base,
                self.regions.len()
            );

            Ok(block)
        }
    }

    /// Takes `block` out of the free index and shapes it into an allocation
    /// of `needed` bytes at `alignment`: a misaligned front and an oversized
    /// tail go back to the index as free blocks of their own.
    fn carve(&mut self, block: BlockNode, needed: usize, alignment: usize) -> Result<NonNull<u8>> {
        let offset = aligned_offset(block, needed, alignment).ok_or(AllocError::Corrupted {
            addr: block.as_ptr() as usize,
            reason: "free block handed out for a request it cannot hold",
        })?;

        let region = region_of(block);
        let min_split = self.min_split();

        unsafe {
            self.free.remove(block);

            let mut block = block;

            if offset > 0 {
                let front = block;
                block = region.split_front(front, offset);
                self.free.insert(front);
            }

            if let Some(rest) = region.split(block, needed, min_split) {
                self.free.insert(rest);
            }

            block.as_ref().data.set_state(State::Allocated);
        }

        Ok(block::payload(block))
    }

    /// Gives the block at `ptr` back to the heap.
    ///
    /// **SAFETY**: `ptr - BLOCK_HEADER_SIZE` must be readable, see
    /// [`block::from_payload`].
    pub unsafe fn release(&mut self, ptr: NonNull<u8>) -> Result<()> {
        if self.config.guard_pages() {
            return self.guarded.release(ptr);
        }

        let node = unsafe { block::from_payload(ptr, self.id)? };
        self.release_block(node)
    }

    /// Marks the block as free, merges it with its free neighbours and
    /// either reinserts the result or unmaps the region if nothing in it is
    /// in use anymore.
    fn release_block(&mut self, mut node: BlockNode) -> Result<()> {
        let region = region_of(node);

        unsafe { node.as_ref().data.set_state(State::Free) };

        region.merge_with_next(node, &mut self.free);
        region.merge_with_prev(&mut node, &mut self.free);

        if self.config.reclaim_empty_regions && region.is_unused() && self.regions.len() > 1 {
            let region_node: RegionNode = unsafe { node.as_ref().data.region };
            let mapping = Region::mapping(region_node);

            unsafe {
                self.regions.remove(region_node);
                return kernel::release(mapping);
            }
        }

        unsafe { self.free.insert(node) };

        Ok(())
    }

    /// Resizes the block at `ptr` without moving it, if possible: shrinking
    /// always works, growing works if the next block is free and big enough.
    /// Returns `None` when the caller has to move the allocation.
    ///
    /// **SAFETY**: same as [`Heap::release`].
    pub unsafe fn resize_in_place(
        &mut self,
        ptr: NonNull<u8>,
        new_size: usize,
        alignment: usize,
    ) -> Result<Option<NonNull<u8>>> {
        if self.config.guard_pages() {
            // Validate, but guarded allocations always move.
            self.guarded.usable_size(ptr)?;
            return Ok(None);
        }

        let node = unsafe { block::from_payload(ptr, self.id)? };
        let needed = request_size(new_size)?;

        if !is_aligned(ptr.as_ptr() as usize, alignment) {
            return Ok(None);
        }

        let region = region_of(node);
        let current = unsafe { node.as_ref().data.size };

        if current < needed {
            let next_free = unsafe {
                node.as_ref()
                    .next
                    .filter(|next| next.as_ref().data.is_free())
                    .map(|next| next.as_ref().data.size)
            };

            match next_free {
                Some(next) if current + BLOCK_HEADER_SIZE + next >= needed => {
                    region.merge_with_next(node, &mut self.free);
                }
                _ => return Ok(None),
            }
        }

        let min_split = self.min_split();

        if let Some(rest) = region.split(node, needed, min_split) {
            // The remainder may have a free block right after it.
            region.merge_with_next(rest, &mut self.free);
            unsafe { self.free.insert(rest) };
        }

        unsafe { node.as_ref().data.set_state(State::Allocated) };

        trace!("resized {:p} in place to {new_size} bytes", ptr);

        Ok(Some(ptr))
    }

    /// Payload capacity of the live allocation at `ptr`.
    ///
    /// **SAFETY**: same as [`Heap::release`].
    pub unsafe fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        if self.config.guard_pages() {
            return self.guarded.usable_size(ptr);
        }

        let node = unsafe { block::from_payload(ptr, self.id)? };
        Ok(unsafe { node.as_ref().data.size })
    }

    /// Unmaps everything. Keeps going after a failure and reports the first
    /// one.
    pub fn release_all(&mut self) -> Result<()> {
        let mut outcome = self.guarded.release_all();

        self.free.clear();

        while let Some(region) = self.regions.pop_front() {
            let released = unsafe { kernel::release(Region::mapping(region)) };
            outcome = outcome.and(released);
        }

        outcome
    }

    pub fn stats(&self) -> HeapStats {
        let mut stats = HeapStats {
            regions: self.regions.len(),
            guarded: self.guarded.len(),
            ..HeapStats::default()
        };

        for region in &self.regions {
            stats.mapped_bytes += region.size;
            stats.overhead_bytes += REGION_HEADER_SIZE;

            for block in &region.blocks {
                stats.overhead_bytes += BLOCK_HEADER_SIZE;

                if block.is_free() {
                    stats.free_blocks += 1;
                    stats.free_bytes += block.size;
                } else {
                    stats.allocated_blocks += 1;
                    stats.allocated_bytes += block.size;
                }
            }
        }

        for (mapped, usable) in self.guarded.footprint() {
            stats.mapped_bytes += mapped;
            stats.allocated_blocks += 1;
            stats.allocated_bytes += usable;
            stats.overhead_bytes += mapped - usable;
        }

        stats
    }

    /// Walks every region and verifies the structural invariants:
    ///
    /// - region and block check words are intact,
    /// - blocks tile their region exactly, in address order,
    /// - no two neighbouring blocks are free,
    /// - the free index holds exactly the free blocks,
    /// - exactly `cached_blocks` blocks are parked in thread caches.
    pub fn check(&self, cached_blocks: usize) -> Result<()> {
        let corrupted = |addr: usize, reason| Err(AllocError::Corrupted { addr, reason });
        let mut free_blocks = 0;
        let mut cached = 0;

        for region_node in self.regions.nodes() {
            let base = region_node.as_ptr() as usize;

            if !Region::is_intact(region_node) {
                return corrupted(base, "region check word");
            }

            let region = unsafe { &region_node.as_ref().data };

            if region.owner != self.id {
                return corrupted(base, "region of another heap");
            }
            let mut expected = base + REGION_HEADER_SIZE;
            let mut prev_free = false;

            for node in region.blocks.nodes() {
                let addr = node.as_ptr() as usize;
                let block = unsafe { &node.as_ref().data };

                if !unsafe { block::is_intact(node) } || block.region != region_node {
                    return corrupted(addr, "block check word");
                }
                if addr != expected {
                    return corrupted(addr, "gap or overlap between blocks");
                }
                if block.size < MIN_PAYLOAD || block.size % MIN_ALIGN != 0 {
                    return corrupted(addr, "block size");
                }
                if block.is_free() && prev_free {
                    return corrupted(addr, "two adjacent free blocks");
                }

                prev_free = block.is_free();
                free_blocks += block.is_free() as usize;
                cached += (block.state() == State::Cached) as usize;
                expected = unsafe { block::end(node) };
            }

            if expected - (base + REGION_HEADER_SIZE) != region.capacity() {
                return corrupted(base, "blocks do not cover the region");
            }
        }

        if free_blocks != self.free.len() {
            return corrupted(0, "free index out of sync with the regions");
        }

        if cached != cached_blocks {
            return corrupted(0, "thread caches out of sync with the regions");
        }

        for node in self.free.blocks() {
            if !unsafe { block::is_intact(node) } || !unsafe { node.as_ref().data.is_free() } {
                return corrupted(node.as_ptr() as usize, "allocated block in the free index");
            }
        }

        Ok(())
    }

    pub fn regions(&self) -> usize {
        self.regions.len()
    }
}

impl Drop for Heap {
    fn drop(&mut self) {
        if let Err(err) = self.release_all() {
            error!("heap teardown failed: {err}");
        }
    }
}
