use std::collections::HashMap;

use proptest::prelude::*;
use segalloc::{Allocator, Config, HeapStats};

#[derive(Debug, Clone)]
enum Op {
    Allocate { size: usize, align_shift: u32 },
    Release { pick: usize },
    Resize { pick: usize, size: usize },
    ZeroAllocate { count: usize, size: usize },
}

fn op() -> impl Strategy<Value = Op> {
    prop_oneof![
        4 => (0usize..3000, 0u32..10).prop_map(|(size, align_shift)| Op::Allocate { size, align_shift }),
        3 => any::<usize>().prop_map(|pick| Op::Release { pick }),
        2 => (any::<usize>(), 0usize..5000).prop_map(|(pick, size)| Op::Resize { pick, size }),
        1 => (0usize..64, 0usize..64).prop_map(|(count, size)| Op::ZeroAllocate { count, size }),
    ]
}

fn config() -> impl Strategy<Value = Config> {
    prop_oneof![
        Just(Config::test()),
        Just(Config::bench()),
        Just(Config::test().with_region_size(4096).with_split_threshold(0)),
        Just(Config::bench().with_region_size(8192).with_reclaim(true)),
    ]
}

fn accounted(stats: &HeapStats) -> bool {
    stats.allocated_bytes + stats.free_bytes + stats.overhead_bytes == stats.mapped_bytes
}

/// Every live allocation is filled with its own tag, which must survive
/// whatever happens to the other allocations.
struct Model {
    live: Vec<(*mut u8, usize, u8)>,
    next_tag: u8,
}

impl Model {
    fn tag(&mut self) -> u8 {
        self.next_tag = self.next_tag.wrapping_add(1).max(1);
        self.next_tag
    }

    fn verify(&self) {
        for &(ptr, size, tag) in &self.live {
            let bytes = unsafe { std::slice::from_raw_parts(ptr, size) };
            assert!(bytes.iter().all(|&b| b == tag));
        }
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn heap_stays_consistent(config in config(), ops in proptest::collection::vec(op(), 1..200)) {
        let allocator = Allocator::new(config);
        allocator.init().unwrap();

        let mut model = Model { live: Vec::new(), next_tag: 0 };

        for op in ops {
            match op {
                Op::Allocate { size, align_shift } => {
                    let alignment = 1 << align_shift;
                    let ptr = allocator.allocate_aligned(size, alignment).unwrap();
                    prop_assert_eq!(ptr.as_ptr() as usize % alignment, 0);

                    if size > 0 {
                        let tag = model.tag();
                        unsafe { ptr.as_ptr().write_bytes(tag, size) };
                        model.live.push((ptr.as_ptr(), size, tag));
                    }
                }
                Op::Release { pick } if !model.live.is_empty() => {
                    let (ptr, _, _) = model.live.swap_remove(pick % model.live.len());
                    unsafe { allocator.release(ptr).unwrap() };
                }
                Op::Resize { pick, size } if !model.live.is_empty() => {
                    let index = pick % model.live.len();
                    let (ptr, old, tag) = model.live[index];
                    let new = unsafe { allocator.resize(ptr, size).unwrap() };

                    // Only the common prefix is preserved.
                    let kept = old.min(size);
                    let bytes = unsafe { std::slice::from_raw_parts(new.as_ptr(), kept) };
                    prop_assert!(bytes.iter().all(|&b| b == tag));

                    if size == 0 {
                        model.live.swap_remove(index);
                    } else {
                        unsafe { new.as_ptr().write_bytes(tag, size) };
                        model.live[index] = (new.as_ptr(), size, tag);
                    }
                }
                Op::ZeroAllocate { count, size } => {
                    let ptr = allocator.zero_allocate(count, size).unwrap();
                    let total = count * size;
                    let bytes = unsafe { std::slice::from_raw_parts(ptr.as_ptr(), total) };
                    prop_assert!(bytes.iter().all(|&b| b == 0));

                    if total > 0 {
                        let tag = model.tag();
                        unsafe { ptr.as_ptr().write_bytes(tag, total) };
                        model.live.push((ptr.as_ptr(), total, tag));
                    }
                }
                _ => {}
            }

            allocator.check().unwrap();
            let stats = allocator.stats().unwrap();
            prop_assert!(accounted(&stats), "{:?}", stats);
            prop_assert!(stats.allocated_blocks >= model.live.len());
        }

        model.verify();

        for (ptr, _, _) in model.live.drain(..) {
            unsafe { allocator.release(ptr).unwrap() };
        }

        let stats = allocator.stats().unwrap();
        prop_assert_eq!(stats.allocated_blocks, stats.cached_blocks);
        allocator.teardown().unwrap();
    }

    #[test]
    fn usable_size_covers_request(sizes in proptest::collection::vec(1usize..10_000, 1..50)) {
        let allocator = Allocator::new(Config::test());
        allocator.init().unwrap();

        let mut seen = HashMap::new();

        for size in sizes {
            let ptr = allocator.allocate(size).unwrap();
            let usable = unsafe { allocator.usable_size(ptr.as_ptr()).unwrap() };

            prop_assert!(usable >= size);
            prop_assert_eq!(usable % segalloc::MIN_ALIGN, 0);
            prop_assert!(seen.insert(ptr.as_ptr() as usize, usable).is_none());
        }

        // No two live allocations overlap.
        let mut ranges: Vec<_> = seen.into_iter().collect();
        ranges.sort_unstable();
        for pair in ranges.windows(2) {
            prop_assert!(pair[0].0 + pair[0].1 <= pair[1].0);
        }

        allocator.teardown().unwrap();
    }
}
