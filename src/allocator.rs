use std::{
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use log::{debug, trace, warn};
use parking_lot::Mutex;

use crate::{
    block::{self, State},
    cache::{self, CACHE_SHARDS, MAX_CACHED_SIZE, ThreadCache},
    config::Config,
    error::{AllocError, ErrorKind, Result},
    heap::{self, Heap, HeapStats},
    utils::MIN_ALIGN,
};

/// Largest `max_alignment` a [`Config`] may ask for.
pub const MAX_SUPPORTED_ALIGNMENT: usize = 64 * 1024;

/// General purpose allocator over anonymous page mappings.
///
/// All the engine state sits behind a single lock, so every method can be
/// called from any thread. With [`Config::per_thread_cache`] small blocks
/// released by a thread are kept in a sharded cache and handed back to
/// threads of the same shard without touching the engine lock.
///
/// An allocator starts uninitialized. Call [`Allocator::init`] before using
/// it and [`Allocator::teardown`] to give all memory back, after which it
/// can be initialized again.
///
/// ```rust
/// use segalloc::{Allocator, Config};
///
/// static ALLOCATOR: Allocator = Allocator::new(Config::test());
///
/// ALLOCATOR.init().unwrap();
///
/// let ptr = ALLOCATOR.allocate(64).unwrap();
/// unsafe {
///     ptr.as_ptr().write_bytes(0xAB, 64);
///     ALLOCATOR.release(ptr.as_ptr()).unwrap();
/// }
///
/// ALLOCATOR.teardown().unwrap();
/// ```
pub struct Allocator {
    heap: Mutex<Option<Heap>>,
    caches: [Mutex<ThreadCache>; CACHE_SHARDS],
    /// Id of the current heap, 0 while uninitialized. Lets the cache path
    /// validate pointers without taking the heap lock.
    owner: AtomicUsize,
    config: Config,
}

/// Non-null, never dereferenceable pointer returned for zero sized
/// requests. Its address is the alignment itself, which always falls inside
/// the first pages of the address space that are never mapped.
#[inline]
fn sentinel(alignment: usize) -> NonNull<u8> {
    NonNull::new(ptr::without_provenance_mut(alignment)).unwrap_or(NonNull::dangling())
}

/// Logs detected programming errors. Running out of memory or bad
/// arguments are for the caller to handle.
fn report(err: &AllocError) {
    if err.kind() == ErrorKind::ProgrammingError {
        warn!("{err}");
    }
}

impl Allocator {
    pub const fn new(config: Config) -> Self {
        Self {
            heap: parking_lot::const_mutex(None),
            caches: [const { parking_lot::const_mutex(ThreadCache::new()) }; CACHE_SHARDS],
            owner: AtomicUsize::new(0),
            config,
        }
    }

    pub const fn config(&self) -> &Config {
        &self.config
    }

    pub fn is_initialized(&self) -> bool {
        self.owner.load(Ordering::Acquire) != 0
    }

    /// Prepares an empty heap. No memory is mapped until the first
    /// allocation.
    pub fn init(&self) -> Result<()> {
        let mut heap = self.heap.lock();

        if heap.is_some() {
            return Err(AllocError::AlreadyInitialized);
        }

        self.validate_config()?;

        let fresh = Heap::new(self.config);
        self.owner.store(fresh.id(), Ordering::Release);
        *heap = Some(fresh);

        debug!("allocator initialized with {:?}", self.config);

        Ok(())
    }

    fn validate_config(&self) -> Result<()> {
        let max = self.config.max_alignment;

        if !max.is_power_of_two() || max < MIN_ALIGN {
            return Err(AllocError::BadAlignment(max));
        }

        if max > MAX_SUPPORTED_ALIGNMENT {
            return Err(AllocError::AlignmentTooLarge {
                align: max,
                max: MAX_SUPPORTED_ALIGNMENT,
            });
        }

        Ok(())
    }

    /// Unmaps every region and guarded allocation. Every pointer handed out
    /// so far becomes dangling.
    pub fn teardown(&self) -> Result<()> {
        if !self.is_initialized() {
            return Err(AllocError::NotInitialized);
        }

        // Shards are always locked before the heap. They stay locked until
        // the heap is gone so no release can refill them in between.
        let mut shards: Vec<_> = self.caches.iter().map(Mutex::lock).collect();
        shards.iter_mut().for_each(|cache| cache.clear());

        let mut heap = {
            let mut slot = self.heap.lock();
            let heap = slot.take().ok_or(AllocError::NotInitialized)?;
            self.owner.store(0, Ordering::Release);
            heap
        };

        drop(shards);

        debug!("tearing down allocator, {} regions", heap.regions());

        heap.release_all()
    }

    fn ensure_live(&self) -> Result<usize> {
        match self.owner.load(Ordering::Acquire) {
            0 => Err(AllocError::NotInitialized),
            owner => Ok(owner),
        }
    }

    fn with_heap<T>(&self, f: impl FnOnce(&mut Heap) -> Result<T>) -> Result<T> {
        let mut heap = self.heap.lock();
        let heap = heap.as_mut().ok_or(AllocError::NotInitialized)?;

        f(heap)
    }

    /// Validates `alignment` and raises it to [`MIN_ALIGN`].
    fn effective_alignment(&self, alignment: usize) -> Result<usize> {
        if !alignment.is_power_of_two() {
            return Err(AllocError::BadAlignment(alignment));
        }

        if alignment > self.config.max_alignment {
            return Err(AllocError::AlignmentTooLarge {
                align: alignment,
                max: self.config.max_alignment,
            });
        }

        Ok(alignment.max(MIN_ALIGN))
    }

    fn is_sentinel(&self, ptr: NonNull<u8>) -> bool {
        let addr = ptr.as_ptr() as usize;
        addr.is_power_of_two() && (MIN_ALIGN..=self.config.max_alignment).contains(&addr)
    }

    fn cache_limit(&self) -> usize {
        self.config.cache_max_size.min(MAX_CACHED_SIZE)
    }

    fn uses_cache(&self) -> bool {
        self.config.per_thread_cache && !self.config.guard_pages()
    }

    /// Allocates `size` bytes aligned to [`MIN_ALIGN`].
    pub fn allocate(&self, size: usize) -> Result<NonNull<u8>> {
        self.allocate_aligned(size, MIN_ALIGN)
    }

    /// Allocates `size` bytes aligned to `alignment`, which must be a power
    /// of two no bigger than [`Config::max_alignment`]. Zero sized requests
    /// get a sentinel pointer that must not be dereferenced.
    pub fn allocate_aligned(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        trace!("allocate {size} bytes aligned to {alignment}");

        let alignment = self.effective_alignment(alignment)?;

        if size == 0 {
            self.ensure_live()?;
            return Ok(sentinel(alignment));
        }

        if self.uses_cache() {
            return self.allocate_cached(size, alignment);
        }

        self.with_heap(|heap| heap.allocate(size, alignment))
    }

    /// Shard first, then free blocks already in the heap, then whatever all
    /// shards hold. Only then the heap maps new memory.
    fn allocate_cached(&self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        self.ensure_live()?;

        let needed = heap::request_size(size)?;

        if alignment == MIN_ALIGN && needed <= self.cache_limit() {
            if let Some(ptr) = self.caches[cache::shard_index()].lock().pop(needed) {
                unsafe { block::uncache(ptr) };
                return Ok(ptr);
            }
        }

        if let Some(ptr) = self.with_heap(|heap| heap.allocate_from_index(size, alignment))? {
            return Ok(ptr);
        }

        self.drain_caches()?;

        self.with_heap(|heap| heap.allocate(size, alignment))
    }

    /// Gives every cached block back to the heap.
    fn drain_caches(&self) -> Result<()> {
        for (shard, cache) in self.caches.iter().enumerate() {
            let mut cache = cache.lock();

            if cache.len() == 0 {
                continue;
            }

            let mut failure = None;

            let drained = self.with_heap(|heap| {
                Ok(cache.drain(|ptr| {
                    unsafe { block::uncache(ptr) };

                    if let Err(err) = unsafe { heap.release(ptr) } {
                        failure.get_or_insert(err);
                    }
                }))
            })?;

            debug!("drained {drained} cached blocks from shard {shard}");

            if let Some(err) = failure {
                return Err(err);
            }
        }

        Ok(())
    }

    /// Gives the allocation at `ptr` back. Null and zero sized sentinels are
    /// ignored. Double frees and pointers this allocator never handed out
    /// are reported as errors instead of corrupting the heap.
    ///
    /// **SAFETY**: `ptr` must be null, a sentinel, or a pointer returned by
    /// this allocator since it was last initialized. Foreign pointers are
    /// detected by reading the bytes in front of them, so those bytes must
    /// at least be readable.
    pub unsafe fn release(&self, ptr: *mut u8) -> Result<()> {
        trace!("release {ptr:p}");

        let Some(ptr) = NonNull::new(ptr).filter(|ptr| !self.is_sentinel(*ptr)) else {
            return Ok(());
        };

        let owner = self.ensure_live()?;

        let released = if self.uses_cache() {
            unsafe { self.release_cached(ptr, owner) }
        } else {
            self.with_heap(|heap| unsafe { heap.release(ptr) })
        };

        released.inspect_err(report)
    }

    /// Parks a small block in the caller's shard.
    ///
    /// Claiming the block for the cache is a compare-exchange on its
    /// header, done under the shard lock: of two releases of the same
    /// pointer, from any shards, exactly one succeeds.
    unsafe fn release_cached(&self, ptr: NonNull<u8>, owner: usize) -> Result<()> {
        let mut cache = self.caches[cache::shard_index()].lock();

        let node = unsafe { block::from_payload(ptr, owner)? };
        let header = unsafe { &node.as_ref().data };

        if header.size > self.cache_limit() {
            drop(cache);
            return self.with_heap(|heap| unsafe { heap.release(ptr) });
        }

        if !header.transition(State::Allocated, State::Cached) {
            return Err(AllocError::DoubleFree(ptr.as_ptr() as usize));
        }

        let size = header.size;

        if cache.push(size, ptr) {
            return Ok(());
        }

        let mut failure = None;

        let spilled = self.with_heap(|heap| {
            Ok(cache.spill(size, |cached| {
                unsafe { block::uncache(cached) };

                if let Err(err) = unsafe { heap.release(cached) } {
                    failure.get_or_insert(err);
                }
            }))
        })?;

        debug!("spilled {spilled} cached blocks of {size} bytes");

        let pushed = cache.push(size, ptr);
        debug_assert!(pushed);

        failure.map_or(Ok(()), Err)
    }

    /// Resizes the allocation at `ptr` keeping [`MIN_ALIGN`] alignment. See
    /// [`Allocator::resize_aligned`].
    ///
    /// **SAFETY**: same as [`Allocator::release`].
    pub unsafe fn resize(&self, ptr: *mut u8, new_size: usize) -> Result<NonNull<u8>> {
        unsafe { self.resize_aligned(ptr, new_size, MIN_ALIGN) }
    }

    /// Resizes the allocation at `ptr` to `new_size` bytes.
    ///
    /// Null or a sentinel behaves like an allocation and a `new_size` of
    /// zero like a release that returns a sentinel. Otherwise the block is
    /// shrunk or grown in place when possible. If not, the first
    /// `min(old size, new_size)` bytes move to a new allocation and the old
    /// one is released. On error `ptr` stays valid.
    ///
    /// **SAFETY**: same as [`Allocator::release`].
    pub unsafe fn resize_aligned(&self, ptr: *mut u8, new_size: usize, alignment: usize) -> Result<NonNull<u8>> {
        trace!("resize {ptr:p} to {new_size} bytes aligned to {alignment}");

        let alignment = self.effective_alignment(alignment)?;

        let Some(old) = NonNull::new(ptr).filter(|ptr| !self.is_sentinel(*ptr)) else {
            return self.allocate_aligned(new_size, alignment);
        };

        if new_size == 0 {
            unsafe { self.release(old.as_ptr())? };
            return Ok(sentinel(alignment));
        }

        let in_place = self
            .with_heap(|heap| unsafe { heap.resize_in_place(old, new_size, alignment) })
            .inspect_err(report)?;

        if let Some(ptr) = in_place {
            return Ok(ptr);
        }

        let old_size = unsafe { self.usable_size(old.as_ptr())? };
        let new = self.allocate_aligned(new_size, alignment)?;

        unsafe {
            ptr::copy_nonoverlapping(old.as_ptr(), new.as_ptr(), old_size.min(new_size));
            self.release(old.as_ptr())?;
        }

        Ok(new)
    }

    /// Allocates zeroed memory for `count` elements of `size` bytes.
    pub fn zero_allocate(&self, count: usize, size: usize) -> Result<NonNull<u8>> {
        trace!("zero allocate {count} x {size} bytes");

        let total = count
            .checked_mul(size)
            .ok_or(AllocError::SizeOverflow { count, size })?;

        let ptr = self.allocate(total)?;

        if total > 0 {
            unsafe { ptr.as_ptr().write_bytes(0, total) };
        }

        Ok(ptr)
    }

    /// Bytes that can actually be used at `ptr`, at least what was asked
    /// for. Zero for null and sentinels.
    ///
    /// **SAFETY**: same as [`Allocator::release`].
    pub unsafe fn usable_size(&self, ptr: *mut u8) -> Result<usize> {
        let Some(ptr) = NonNull::new(ptr).filter(|ptr| !self.is_sentinel(*ptr)) else {
            return Ok(0);
        };

        self.with_heap(|heap| unsafe { heap.usable_size(ptr) })
            .inspect_err(report)
    }

    pub fn stats(&self) -> Result<HeapStats> {
        let (cached_blocks, cached_bytes) = self
            .caches
            .iter()
            .map(|cache| {
                let cache = cache.lock();
                (cache.len(), cache.bytes())
            })
            .fold((0, 0), |(blocks, bytes), (len, size)| (blocks + len, bytes + size));

        let stats = self.with_heap(|heap| Ok(heap.stats()))?;

        Ok(HeapStats {
            cached_blocks,
            cached_bytes,
            ..stats
        })
    }

    /// Walks every header and reports the first broken invariant. Every
    /// shard stays locked meanwhile, so cached blocks can be accounted for.
    pub fn check(&self) -> Result<()> {
        let shards: Vec<_> = self.caches.iter().map(Mutex::lock).collect();
        let cached = shards.iter().map(|cache| cache.len()).sum();

        self.with_heap(|heap| heap.check(cached)).inspect_err(report)
    }

    /// `malloc(3)` flavoured [`Allocator::allocate`]: null on failure.
    pub fn malloc(&self, size: usize) -> *mut u8 {
        self.allocate(size).map_or_else(
            |err| {
                debug!("malloc({size}) failed: {err}");
                ptr::null_mut()
            },
            NonNull::as_ptr,
        )
    }

    /// `free(3)` flavoured [`Allocator::release`]: errors are only logged.
    ///
    /// **SAFETY**: same as [`Allocator::release`].
    pub unsafe fn free(&self, ptr: *mut u8) {
        if let Err(err) = unsafe { self.release(ptr) } {
            debug!("free({ptr:p}) failed: {err}");
        }
    }

    /// `realloc(3)` flavoured [`Allocator::resize`]: null on failure, in
    /// which case `ptr` is left untouched.
    ///
    /// **SAFETY**: same as [`Allocator::release`].
    pub unsafe fn realloc(&self, ptr: *mut u8, size: usize) -> *mut u8 {
        unsafe { self.resize(ptr, size) }.map_or_else(
            |err| {
                debug!("realloc({ptr:p}, {size}) failed: {err}");
                ptr::null_mut()
            },
            NonNull::as_ptr,
        )
    }

    /// `calloc(3)` flavoured [`Allocator::zero_allocate`]: null on failure.
    pub fn calloc(&self, count: usize, size: usize) -> *mut u8 {
        self.zero_allocate(count, size).map_or_else(
            |err| {
                debug!("calloc({count}, {size}) failed: {err}");
                ptr::null_mut()
            },
            NonNull::as_ptr,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::GuardLocation;
    use pretty_assertions::assert_eq;

    fn allocator(config: Config) -> Allocator {
        let allocator = Allocator::new(config);
        allocator.init().unwrap();
        allocator
    }

    #[test]
    fn lifecycle() {
        let allocator = Allocator::new(Config::test());

        assert_eq!(allocator.allocate(8), Err(AllocError::NotInitialized));
        assert_eq!(allocator.teardown(), Err(AllocError::NotInitialized));

        allocator.init().unwrap();
        assert_eq!(allocator.init(), Err(AllocError::AlreadyInitialized));

        allocator.allocate(8).unwrap();
        allocator.teardown().unwrap();
        assert_eq!(allocator.allocate(8), Err(AllocError::NotInitialized));

        // Teardown goes back to square one.
        allocator.init().unwrap();
        assert_eq!(allocator.stats().unwrap().mapped_bytes, 0);
        allocator.teardown().unwrap();
    }

    #[test]
    fn bad_configs_are_rejected_on_init() {
        let odd = Allocator::new(Config::test().with_max_alignment(3000));
        assert_eq!(odd.init(), Err(AllocError::BadAlignment(3000)));

        let huge = Allocator::new(Config::test().with_max_alignment(1 << 20));
        assert_eq!(
            huge.init(),
            Err(AllocError::AlignmentTooLarge {
                align: 1 << 20,
                max: MAX_SUPPORTED_ALIGNMENT
            })
        );
        assert!(!huge.is_initialized());
    }

    #[test]
    fn alignment_is_validated() {
        let allocator = allocator(Config::test());

        assert_eq!(allocator.allocate_aligned(8, 24), Err(AllocError::BadAlignment(24)));
        assert_eq!(allocator.allocate_aligned(8, 0), Err(AllocError::BadAlignment(0)));
        assert_eq!(
            allocator.allocate_aligned(8, 8192),
            Err(AllocError::AlignmentTooLarge { align: 8192, max: 4096 })
        );

        // Small alignments are raised.
        let ptr = allocator.allocate_aligned(3, 1).unwrap();
        assert_eq!(ptr.as_ptr() as usize % MIN_ALIGN, 0);
    }

    #[test]
    fn zero_sized_requests_get_a_sentinel() {
        let allocator = allocator(Config::test());

        let ptr = allocator.allocate(0).unwrap();
        assert_eq!(ptr.as_ptr() as usize, MIN_ALIGN);

        let aligned = allocator.allocate_aligned(0, 256).unwrap();
        assert_eq!(aligned.as_ptr() as usize, 256);

        unsafe {
            allocator.release(ptr.as_ptr()).unwrap();
            allocator.release(ptr::null_mut()).unwrap();
            assert_eq!(allocator.usable_size(aligned.as_ptr()).unwrap(), 0);
        }

        assert_eq!(allocator.stats().unwrap().mapped_bytes, 0);
    }

    #[test]
    fn resize_moves_when_it_must() {
        let allocator = allocator(Config::test());

        unsafe {
            let a = allocator.allocate(32).unwrap();
            let _b = allocator.allocate(32).unwrap();

            a.as_ptr().copy_from_nonoverlapping(b"0123456789abcdef0123456789abcdef".as_ptr(), 32);

            let moved = allocator.resize(a.as_ptr(), 4096).unwrap();
            assert_ne!(moved, a);
            assert_eq!(
                std::slice::from_raw_parts(moved.as_ptr(), 32),
                b"0123456789abcdef0123456789abcdef"
            );

            // The old block is free again.
            assert_eq!(
                allocator.release(a.as_ptr()),
                Err(AllocError::DoubleFree(a.as_ptr() as usize))
            );

            let sentinel = allocator.resize(moved.as_ptr(), 0).unwrap();
            assert_eq!(sentinel.as_ptr() as usize, MIN_ALIGN);

            let fresh = allocator.resize(sentinel.as_ptr(), 10).unwrap();
            assert!(allocator.usable_size(fresh.as_ptr()).unwrap() >= 10);
        }

        allocator.check().unwrap();
    }

    #[test]
    fn zero_allocate_clears_recycled_memory() {
        let allocator = allocator(Config::test());

        unsafe {
            let dirty = allocator.allocate(256).unwrap();
            dirty.as_ptr().write_bytes(0xFF, 256);
            allocator.release(dirty.as_ptr()).unwrap();
        }

        let clean = allocator.zero_allocate(16, 16).unwrap();
        let bytes = unsafe { std::slice::from_raw_parts(clean.as_ptr(), 256) };
        assert!(bytes.iter().all(|&b| b == 0));

        assert_eq!(
            allocator.zero_allocate(usize::MAX, 2),
            Err(AllocError::SizeOverflow { count: usize::MAX, size: 2 })
        );
    }

    #[test]
    fn c_wrappers_map_errors_to_null() {
        let allocator = allocator(Config::test());

        assert!(allocator.malloc(usize::MAX).is_null());
        assert!(allocator.calloc(usize::MAX, usize::MAX).is_null());

        unsafe {
            let ptr = allocator.malloc(40);
            assert!(!ptr.is_null());

            assert!(allocator.realloc(ptr, usize::MAX).is_null());
            // Still valid after a failed realloc.
            ptr.write_bytes(1, 40);

            allocator.free(ptr);
            allocator.free(ptr);
            allocator.free(ptr::null_mut());
        }

        allocator.check().unwrap();
    }

    #[test]
    fn cached_blocks_are_reused_and_counted() {
        let allocator = allocator(Config::bench());

        unsafe {
            let a = allocator.allocate(48).unwrap();
            allocator.release(a.as_ptr()).unwrap();

            let stats = allocator.stats().unwrap();
            assert_eq!(stats.cached_blocks, 1);
            assert_eq!(stats.cached_bytes, 48);
            assert_eq!(stats.allocated_blocks, 1);

            assert_eq!(
                allocator.release(a.as_ptr()),
                Err(AllocError::DoubleFree(a.as_ptr() as usize))
            );

            // Same thread, same shard, same block.
            let b = allocator.allocate(40).unwrap();
            assert_eq!(a, b);
            allocator.release(b.as_ptr()).unwrap();
        }

        allocator.check().unwrap();
    }

    #[test]
    fn cached_blocks_cannot_be_resized_or_queried() {
        let allocator = allocator(Config::bench());

        unsafe {
            let a = allocator.allocate(64).unwrap();
            let addr = a.as_ptr() as usize;
            allocator.release(a.as_ptr()).unwrap();

            assert_eq!(allocator.resize(a.as_ptr(), 32), Err(AllocError::DoubleFree(addr)));
            assert_eq!(allocator.usable_size(a.as_ptr()), Err(AllocError::DoubleFree(addr)));

            // The block is still whole and still cached.
            let b = allocator.allocate(64).unwrap();
            assert_eq!(a, b);
            assert_eq!(allocator.usable_size(b.as_ptr()).unwrap(), 64);
            allocator.release(b.as_ptr()).unwrap();
        }

        assert_eq!(allocator.stats().unwrap().cached_blocks, 1);
        allocator.check().unwrap();
    }

    #[test]
    fn check_counts_cached_headers() {
        let allocator = allocator(Config::bench());
        let a = allocator.allocate(64).unwrap();

        unsafe { allocator.release(a.as_ptr()).unwrap() };
        allocator.check().unwrap();

        // The magazine still holds `a` but its header claims it is live.
        unsafe { block::uncache(a) };
        assert!(matches!(allocator.check(), Err(AllocError::Corrupted { .. })));
    }

    #[test]
    fn full_magazines_spill_to_the_heap() {
        let allocator = allocator(Config::bench());

        let ptrs: Vec<_> = (0..cache::MAGAZINE_CAPACITY + 1)
            .map(|_| allocator.allocate(64).unwrap())
            .collect();

        unsafe {
            for ptr in &ptrs {
                allocator.release(ptr.as_ptr()).unwrap();
            }
        }

        let stats = allocator.stats().unwrap();
        assert_eq!(stats.cached_blocks, cache::MAGAZINE_CAPACITY / 2 + 1);
        assert!(stats.free_blocks >= 1);
        allocator.check().unwrap();
    }

    #[test]
    fn caches_are_drained_before_mapping() {
        let allocator = allocator(Config::bench().with_region_size(4096));

        let ptrs: Vec<_> = (0..cache::MAGAZINE_CAPACITY)
            .map(|_| allocator.allocate(128).unwrap())
            .collect();

        unsafe {
            for ptr in &ptrs {
                allocator.release(ptr.as_ptr()).unwrap();
            }
        }

        let stats = allocator.stats().unwrap();
        assert_eq!(stats.regions, 1);
        assert_eq!(stats.cached_blocks, cache::MAGAZINE_CAPACITY);

        // Only the cached blocks merged with the free tail can hold this.
        let big = allocator.allocate(stats.free_bytes + 64).unwrap();

        let stats = allocator.stats().unwrap();
        assert_eq!(stats.regions, 1);
        assert_eq!(stats.cached_blocks, 0);
        assert_eq!(big, ptrs[0]);

        unsafe { allocator.release(big.as_ptr()).unwrap() };
        allocator.check().unwrap();
    }

    #[test]
    fn guarded_allocator_keeps_cache_out() {
        let allocator = allocator(Config::bench().with_guard_location(GuardLocation::After));

        unsafe {
            let ptr = allocator.allocate(100).unwrap();
            allocator.release(ptr.as_ptr()).unwrap();
        }

        let stats = allocator.stats().unwrap();
        assert_eq!(stats.cached_blocks, 0);
        assert_eq!(stats.mapped_bytes, 0);
    }
}
