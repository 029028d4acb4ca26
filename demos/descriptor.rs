//! Drives both static instances through their descriptor function tables,
//! the way an external benchmark harness would.

use segalloc::{Descriptor, get_bench_allocator, get_test_allocator};

fn exercise(descriptor: &Descriptor) -> segalloc::Result<()> {
    println!(
        "{} {} by {} ({}): {}",
        descriptor.name, descriptor.version, descriptor.author, descriptor.memory_backend, descriptor.description
    );
    println!("{:#?}", descriptor.features);

    (descriptor.init)()?;

    unsafe {
        let words = (descriptor.calloc)(32, 8).cast::<u64>();
        assert!(!words.is_null());

        for i in 0..32 {
            *words.add(i) = i as u64 * 3;
        }

        let words = (descriptor.realloc)(words.cast(), 32 * 8 * 4).cast::<u64>();
        println!("sum after realloc: {}", (0..32).map(|i| *words.add(i)).sum::<u64>());

        let zero = (descriptor.malloc)(0);
        (descriptor.free)(zero);
        (descriptor.free)(words.cast());
    }

    println!("{:#?}", descriptor.allocator.stats()?);

    (descriptor.teardown)()
}

fn main() -> segalloc::Result<()> {
    env_logger::init();

    exercise(get_test_allocator())?;
    exercise(get_bench_allocator())
}
