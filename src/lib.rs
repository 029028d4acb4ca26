//! General purpose memory allocator engine built on anonymous page
//! mappings.
//!
//! Memory is requested from the operating system in regions. Each region is
//! partitioned into blocks whose headers live right in front of their
//! payloads, in the managed memory itself:
//!
//! ```text
//! +--------+--------+---------+--------+---------+--------+------------+
//! | Region | Header | Payload | Header | Payload | Header |  Payload   |
//! +--------+--------+---------+--------+---------+--------+------------+
//! ```
//!
//! Free blocks are indexed by power of two size classes, handed out first
//! fit within the smallest class that can hold a request, split when they
//! are too big and merged with their free neighbours as soon as they are
//! released.
//!
//! The entry point is [`Allocator`], configured through a [`Config`]. The
//! [`descriptor`] module exposes two ready made static instances behind a
//! `malloc`/`free`/`realloc`/`calloc` function table.
//!
//! ```rust
//! use segalloc::{Allocator, Config};
//!
//! let allocator = Allocator::new(Config::test());
//! allocator.init().unwrap();
//!
//! let ptr = allocator.zero_allocate(4, 8).unwrap();
//! unsafe {
//!     let grown = allocator.resize(ptr.as_ptr(), 1024).unwrap();
//!     allocator.release(grown.as_ptr()).unwrap();
//! }
//!
//! allocator.check().unwrap();
//! allocator.teardown().unwrap();
//! ```
//!
//! The engine logs through the [`log`] facade. It is not meant to back the
//! process global allocator while a logger that allocates is installed.

mod allocator;
mod block;
mod cache;
mod config;
pub mod descriptor;
mod error;
mod freelist;
mod guard;
mod heap;
mod kernel;
mod list;
mod region;
mod utils;

pub use allocator::{Allocator, MAX_SUPPORTED_ALIGNMENT};
pub use config::{Config, GuardLocation};
pub use descriptor::{Descriptor, Features, get_bench_allocator, get_test_allocator};
pub use error::{AllocError, ErrorKind, Result};
pub use heap::HeapStats;
pub use kernel::page_size;
pub use utils::MIN_ALIGN;
