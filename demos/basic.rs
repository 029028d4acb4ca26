//! Walks through the allocator primitives and prints what happens to the
//! heap. Run with `RUST_LOG=debug` to see regions being mapped.

use segalloc::{Allocator, Config};

fn log_alloc(label: &str, addr: *mut u8, size: usize) {
    println!("{label}: requested {size} bytes, received {addr:?}");
}

fn main() -> segalloc::Result<()> {
    env_logger::init();

    let allocator = Allocator::new(Config::test());
    allocator.init()?;

    unsafe {
        let a = allocator.allocate(8)?;
        log_alloc("a", a.as_ptr(), 8);

        let b = allocator.allocate(64)?;
        log_alloc("b", b.as_ptr(), 64);

        let c = allocator.allocate_aligned(100, 1024)?;
        log_alloc("c", c.as_ptr(), 100);

        println!("{:#?}", allocator.stats()?);

        // a and b are neighbours, releasing both leaves one free block.
        allocator.release(a.as_ptr())?;
        allocator.release(b.as_ptr())?;

        let merged = allocator.allocate(96)?;
        log_alloc("merged", merged.as_ptr(), 96);
        println!("reused a's address: {}", merged == a);

        let grown = allocator.resize(merged.as_ptr(), 4096)?;
        log_alloc("grown", grown.as_ptr(), 4096);

        if let Err(err) = allocator.release(b.as_ptr()) {
            println!("releasing b twice: {err}");
        }

        allocator.release(grown.as_ptr())?;
        allocator.release(c.as_ptr())?;
    }

    allocator.check()?;
    println!("{:#?}", allocator.stats()?);

    allocator.teardown()
}
