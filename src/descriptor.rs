//! Function table describing an allocator instance, so benchmarks and test
//! harnesses can drive different engines through the same interface.

use crate::{
    allocator::Allocator,
    config::{Config, GuardLocation},
    error::Result,
};

/// Capabilities advertised by a [`Descriptor`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Features {
    pub thread_safe: bool,
    pub per_thread_cache: bool,
    pub huge_page_support: bool,
    pub guard_pages: bool,
    pub guard_location: GuardLocation,
    pub min_alignment: usize,
    pub max_alignment: usize,
}

impl Features {
    pub const fn of(config: &Config) -> Self {
        Self {
            thread_safe: true,
            per_thread_cache: config.per_thread_cache && !config.guard_pages(),
            huge_page_support: false,
            guard_pages: config.guard_pages(),
            guard_location: config.guard_location,
            min_alignment: config.min_alignment(),
            max_alignment: config.max_alignment,
        }
    }
}

pub struct Descriptor {
    pub malloc: fn(usize) -> *mut u8,
    pub free: unsafe fn(*mut u8),
    pub realloc: unsafe fn(*mut u8, usize) -> *mut u8,
    pub calloc: fn(usize, usize) -> *mut u8,
    pub init: fn() -> Result<()>,
    pub teardown: fn() -> Result<()>,
    pub name: &'static str,
    pub author: &'static str,
    pub version: &'static str,
    pub description: &'static str,
    /// Where memory comes from.
    pub memory_backend: &'static str,
    pub features: Features,
    /// The instance behind the function table, for what the table does not
    /// cover (stats, checks, aligned requests).
    pub allocator: &'static Allocator,
}

const TEST_CONFIG: Config = Config::test();
const BENCH_CONFIG: Config = Config::bench();

static TEST_ALLOCATOR: Allocator = Allocator::new(TEST_CONFIG);
static BENCH_ALLOCATOR: Allocator = Allocator::new(BENCH_CONFIG);

/// Builds a [`Descriptor`] whose function pointers forward to a static
/// [`Allocator`].
macro_rules! descriptor {
    ($allocator:ident, $config:ident, $name:literal, $description:literal) => {{
        fn malloc(size: usize) -> *mut u8 {
            $allocator.malloc(size)
        }

        unsafe fn free(ptr: *mut u8) {
            unsafe { $allocator.free(ptr) }
        }

        unsafe fn realloc(ptr: *mut u8, size: usize) -> *mut u8 {
            unsafe { $allocator.realloc(ptr, size) }
        }

        fn calloc(count: usize, size: usize) -> *mut u8 {
            $allocator.calloc(count, size)
        }

        fn init() -> Result<()> {
            $allocator.init()
        }

        fn teardown() -> Result<()> {
            $allocator.teardown()
        }

        Descriptor {
            malloc,
            free,
            realloc,
            calloc,
            init,
            teardown,
            name: $name,
            author: "segalloc developers",
            version: env!("CARGO_PKG_VERSION"),
            description: $description,
            memory_backend: "mmap",
            features: Features::of(&$config),
            allocator: &$allocator,
        }
    }};
}

static TEST_DESCRIPTOR: Descriptor = descriptor!(
    TEST_ALLOCATOR,
    TEST_CONFIG,
    "segalloc-test",
    "Segregated free lists with eager coalescing, no thread cache"
);

static BENCH_DESCRIPTOR: Descriptor = descriptor!(
    BENCH_ALLOCATOR,
    BENCH_CONFIG,
    "segalloc-bench",
    "Segregated free lists with sharded thread caches"
);

/// Conservatively configured instance: no thread cache, empty regions are
/// unmapped.
pub fn get_test_allocator() -> &'static Descriptor {
    &TEST_DESCRIPTOR
}

/// Throughput oriented instance: thread cache on, regions are kept.
pub fn get_bench_allocator() -> &'static Descriptor {
    &BENCH_DESCRIPTOR
}
