//! Several threads allocating and releasing through one shared allocator,
//! with and without the thread cache.

use std::thread;

use segalloc::{Allocator, Config};

static PLAIN: Allocator = Allocator::new(Config::test());
static CACHED: Allocator = Allocator::new(Config::bench());

fn churn(allocator: &'static Allocator, name: &str) -> segalloc::Result<()> {
    allocator.init()?;

    let workers: Vec<_> = (0..4)
        .map(|id| {
            thread::spawn(move || {
                let mut live = Vec::new();

                for round in 0..10_000usize {
                    let size = 16 + (round * 7 + id * 13) % 400;
                    let ptr = allocator.malloc(size);
                    assert!(!ptr.is_null());
                    unsafe { ptr.write_bytes(id as u8, size) };
                    live.push(ptr);

                    if live.len() > 64 {
                        unsafe { allocator.free(live.swap_remove(round % live.len())) };
                    }
                }

                for ptr in live {
                    unsafe { allocator.free(ptr) };
                }
            })
        })
        .collect();

    for worker in workers {
        worker.join().expect("worker panicked");
    }

    allocator.check()?;
    let stats = allocator.stats()?;
    println!(
        "{name}: {} regions, {} bytes mapped, {} blocks still cached",
        stats.regions, stats.mapped_bytes, stats.cached_blocks
    );

    allocator.teardown()
}

fn main() -> segalloc::Result<()> {
    env_logger::init();

    churn(&PLAIN, "plain")?;
    churn(&CACHED, "cached")
}
