//! Tunables of an [`Allocator`](crate::Allocator).
//!
//! Everything is `const` so configured allocators can live in `static`s.

use crate::utils::MIN_ALIGN;

/// Where guard pages go around each allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardLocation {
    None,
    /// Underflows fault.
    Before,
    /// Overflows fault. The payload ends exactly at the guard page.
    After,
    /// Overflows fault exactly, underflows fault past the page rounded
    /// start of the payload.
    Both,
}

impl GuardLocation {
    #[inline]
    pub const fn before(self) -> bool {
        matches!(self, Self::Before | Self::Both)
    }

    #[inline]
    pub const fn after(self) -> bool {
        matches!(self, Self::After | Self::Both)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Config {
    /// Minimum number of bytes requested from the OS per region. Bigger
    /// requests get a region of their own sized to fit.
    pub region_size: usize,
    /// A free block is only split if the remainder payload is at least this
    /// big. Smaller remainders stay attached to the allocation.
    pub split_threshold: usize,
    /// Largest alignment `allocate` accepts.
    pub max_alignment: usize,
    /// Guard page placement. Anything but [`GuardLocation::None`] gives
    /// every allocation a mapping of its own.
    pub guard_location: GuardLocation,
    /// Keep recently freed small blocks in sharded per-thread magazines.
    pub per_thread_cache: bool,
    /// Largest payload the thread cache keeps.
    pub cache_max_size: usize,
    /// Unmap regions that become entirely free, except the last one.
    pub reclaim_empty_regions: bool,
}

impl Config {
    /// Conservative configuration used by the test descriptor.
    pub const fn test() -> Self {
        Self {
            region_size: 64 * 1024,
            split_threshold: 32,
            max_alignment: 4096,
            guard_location: GuardLocation::None,
            per_thread_cache: false,
            cache_max_size: 512,
            reclaim_empty_regions: true,
        }
    }

    /// Throughput oriented configuration used by the bench descriptor.
    pub const fn bench() -> Self {
        Self {
            region_size: 1024 * 1024,
            split_threshold: 64,
            per_thread_cache: true,
            reclaim_empty_regions: false,
            ..Self::test()
        }
    }

    /// Every allocation surrounded by guard pages.
    pub const fn hardened() -> Self {
        Self {
            guard_location: GuardLocation::Both,
            ..Self::test()
        }
    }

    pub const fn with_region_size(mut self, region_size: usize) -> Self {
        self.region_size = region_size;
        self
    }

    pub const fn with_split_threshold(mut self, split_threshold: usize) -> Self {
        self.split_threshold = split_threshold;
        self
    }

    pub const fn with_max_alignment(mut self, max_alignment: usize) -> Self {
        self.max_alignment = max_alignment;
        self
    }

    pub const fn with_guard_location(mut self, guard_location: GuardLocation) -> Self {
        self.guard_location = guard_location;
        self
    }

    pub const fn with_thread_cache(mut self, enabled: bool) -> Self {
        self.per_thread_cache = enabled;
        self
    }

    pub const fn with_cache_max_size(mut self, cache_max_size: usize) -> Self {
        self.cache_max_size = cache_max_size;
        self
    }

    pub const fn with_reclaim(mut self, reclaim: bool) -> Self {
        self.reclaim_empty_regions = reclaim;
        self
    }

    #[inline]
    pub const fn guard_pages(&self) -> bool {
        !matches!(self.guard_location, GuardLocation::None)
    }

    /// Alignment every payload gets without asking.
    #[inline]
    pub const fn min_alignment(&self) -> usize {
        MIN_ALIGN
    }
}

impl Default for Config {
    fn default() -> Self {
        Self::test()
    }
}
