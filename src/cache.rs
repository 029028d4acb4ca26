//! Sharded caches of recently released small blocks.
//!
//! Threads are spread over [`CACHE_SHARDS`] shards, each one behind its own
//! lock, so threads mostly avoid contending on the heap lock for small
//! allocations. A shard keeps one magazine (a small fixed stack of payload
//! pointers) per payload size. Cached blocks are still allocated as far as
//! the regions are concerned, their headers say they are cached.

use std::{
    cell::Cell,
    ptr::{self, NonNull},
    sync::atomic::{AtomicUsize, Ordering},
};

use crate::utils::MIN_ALIGN;

pub(crate) const CACHE_SHARDS: usize = 8;

pub(crate) const MAGAZINE_CAPACITY: usize = 16;

/// One magazine per multiple of [`MIN_ALIGN`].
const CACHE_CLASSES: usize = 64;

/// Largest payload any cache can hold, regardless of configuration.
pub(crate) const MAX_CACHED_SIZE: usize = (CACHE_CLASSES - 1) * MIN_ALIGN;

#[derive(Clone, Copy)]
struct Magazine {
    slots: [*mut u8; MAGAZINE_CAPACITY],
    len: usize,
}

impl Magazine {
    const EMPTY: Self = Self {
        slots: [ptr::null_mut(); MAGAZINE_CAPACITY],
        len: 0,
    };

    fn cached(&self) -> &[*mut u8] {
        &self.slots[..self.len]
    }
}

pub(crate) struct ThreadCache {
    magazines: [Magazine; CACHE_CLASSES],
    len: usize,
    bytes: usize,
}

// Cached pointers are payloads owned by the allocator, the shard lock
// serialises every access to them.
unsafe impl Send for ThreadCache {}

#[inline]
fn class_of(size: usize) -> usize {
    debug_assert!(size % MIN_ALIGN == 0 && size <= MAX_CACHED_SIZE);
    size / MIN_ALIGN
}

impl ThreadCache {
    pub const fn new() -> Self {
        Self {
            magazines: [Magazine::EMPTY; CACHE_CLASSES],
            len: 0,
            bytes: 0,
        }
    }

    /// Number of cached blocks.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    /// Payload bytes held by cached blocks.
    #[inline]
    pub fn bytes(&self) -> usize {
        self.bytes
    }

    /// Takes a cached block whose payload is exactly `size` bytes.
    pub fn pop(&mut self, size: usize) -> Option<NonNull<u8>> {
        let magazine = &mut self.magazines[class_of(size)];

        if magazine.len == 0 {
            return None;
        }

        magazine.len -= 1;
        self.len -= 1;
        self.bytes -= size;

        NonNull::new(magazine.slots[magazine.len])
    }

    /// Caches `ptr`, a block of `size` payload bytes. Returns `false` if the
    /// magazine is full.
    pub fn push(&mut self, size: usize, ptr: NonNull<u8>) -> bool {
        let magazine = &mut self.magazines[class_of(size)];

        if magazine.len == MAGAZINE_CAPACITY {
            return false;
        }

        magazine.slots[magazine.len] = ptr.as_ptr();
        magazine.len += 1;
        self.len += 1;
        self.bytes += size;

        true
    }

    /// Hands the older half of the `size` magazine to `release`.
    pub fn spill(&mut self, size: usize, mut release: impl FnMut(NonNull<u8>)) -> usize {
        let magazine = &mut self.magazines[class_of(size)];
        let spilled = magazine.len / 2;

        for &ptr in &magazine.slots[..spilled] {
            if let Some(ptr) = NonNull::new(ptr) {
                release(ptr);
            }
        }

        magazine.slots.copy_within(spilled..magazine.len, 0);
        magazine.len -= spilled;
        self.len -= spilled;
        self.bytes -= spilled * size;

        spilled
    }

    /// Hands every cached block to `release` and empties the cache.
    pub fn drain(&mut self, mut release: impl FnMut(NonNull<u8>)) -> usize {
        let drained = self.len;

        for magazine in &mut self.magazines {
            magazine.cached().iter().filter_map(|&ptr| NonNull::new(ptr)).for_each(&mut release);
            magazine.len = 0;
        }

        self.len = 0;
        self.bytes = 0;

        drained
    }

    /// Forgets every cached block without releasing it. Only valid when the
    /// memory behind them is going away anyway.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}

static NEXT_SLOT: AtomicUsize = AtomicUsize::new(0);

thread_local! {
    static SLOT: Cell<Option<usize>> = const { Cell::new(None) };
}

/// Shard of the calling thread. Threads get consecutive slots on first use.
/// Threads whose thread locals are already gone all share shard 0.
pub(crate) fn shard_index() -> usize {
    SLOT.try_with(|slot| {
        let index = slot.get().unwrap_or_else(|| {
            let index = NEXT_SLOT.fetch_add(1, Ordering::Relaxed);
            slot.set(Some(index));
            index
        });

        index % CACHE_SHARDS
    })
    .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fake(n: usize) -> NonNull<u8> {
        NonNull::new((0x1000 + n * MIN_ALIGN) as *mut u8).unwrap()
    }

    #[test]
    fn lifo_per_size() {
        let mut cache = ThreadCache::new();

        assert!(cache.push(32, fake(1)));
        assert!(cache.push(32, fake(2)));
        assert!(cache.push(64, fake(3)));

        assert_eq!(cache.len(), 3);
        assert_eq!(cache.bytes(), 128);

        assert_eq!(cache.pop(32), Some(fake(2)));
        assert_eq!(cache.pop(32), Some(fake(1)));
        assert_eq!(cache.pop(32), None);
        assert_eq!(cache.pop(48), None);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn full_magazine_spills_oldest_half() {
        let mut cache = ThreadCache::new();

        for n in 0..MAGAZINE_CAPACITY {
            assert!(cache.push(16, fake(n)));
        }
        assert!(!cache.push(16, fake(99)));

        let mut released = Vec::new();
        let spilled = cache.spill(16, |ptr| released.push(ptr));

        assert_eq!(spilled, MAGAZINE_CAPACITY / 2);
        assert_eq!(released, (0..MAGAZINE_CAPACITY / 2).map(fake).collect::<Vec<_>>());
        assert_eq!(cache.len(), MAGAZINE_CAPACITY / 2);

        // Newest blocks stay and come out first.
        assert_eq!(cache.pop(16), Some(fake(MAGAZINE_CAPACITY - 1)));
        assert!(cache.push(16, fake(99)));
    }

    #[test]
    fn drain_empties_every_magazine() {
        let mut cache = ThreadCache::new();
        cache.push(16, fake(1));
        cache.push(MAX_CACHED_SIZE, fake(2));

        let mut released = 0;
        assert_eq!(cache.drain(|_| released += 1), 2);
        assert_eq!(released, 2);
        assert_eq!(cache.len(), 0);
        assert_eq!(cache.bytes(), 0);
    }

    #[test]
    fn shard_is_stable_per_thread() {
        let shard = shard_index();
        assert_eq!(shard, shard_index());
        assert!(shard < CACHE_SHARDS);

        let other = std::thread::spawn(shard_index).join().unwrap();
        assert!(other < CACHE_SHARDS);
    }
}
