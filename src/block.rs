use std::{
    mem,
    ptr::NonNull,
    sync::atomic::{AtomicU8, Ordering},
};

use crate::{
    error::{AllocError, Result},
    list::Node,
    region::Region,
    utils::{MIN_ALIGN, align, is_aligned},
};

/// Header size of a block. We need to add the overhead introduced by our
/// [`Node`] structure since we always use our `Block` as a node of the
/// region's block list. Padded so payloads stay [`MIN_ALIGN`] aligned.
pub(crate) const BLOCK_HEADER_SIZE: usize = align(mem::size_of::<Node<Block>>(), MIN_ALIGN);

/// Free blocks store their free list node inside their own payload, so no
/// payload can ever be smaller than that node.
pub(crate) const MIN_PAYLOAD: usize = align(mem::size_of::<Node<BlockNode>>(), MIN_ALIGN);

const BLOCK_MAGIC: usize = 0xB10C_5EA1;

/// Written over the check word of a header that disappeared into a
/// neighbour. Lets us tell a stale pointer apart from a foreign one.
const RETIRED_MAGIC: usize = 0xDEAD_B10C;

/// Pointer to the header of a block, which is always a [`Node<Block>`].
pub(crate) type BlockNode = NonNull<Node<Block>>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub(crate) enum State {
    Free,
    Allocated,
    /// Released by its owner and parked in a thread cache. Still allocated
    /// as far as the regions are concerned.
    Cached,
}

impl State {
    const fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Self::Free,
            1 => Self::Allocated,
            _ => Self::Cached,
        }
    }
}

/// This is the structure of a block. The fields of the block are its metadata,
/// content is placed right after this header.
///
/// The following diagram represents this structure ignoring that the block
/// will be wrapped inside a [`Node`] whose links point to the physical
/// neighbours of the block inside its region.
///
/// ```text
/// +---------------------+ <------+
/// |     prev / next     |        |
/// +---------------------+        |
/// |        size         |        |
/// +---------------------+        | -> Header (BLOCK_HEADER_SIZE)
/// |   state  |  check   |        |
/// +---------------------+        |
/// |       region        |        |
/// +---------------------+ <------+ <- pointer returned to the user
/// |       Content       |        |
/// |         ...         |        | -> Addressable content (size bytes)
/// |         ...         |        |
/// +---------------------+ <------+ <- header of the next block
/// ```
///
/// The header is always exactly [`BLOCK_HEADER_SIZE`] bytes before the
/// payload. Alignment padding never hides between them: it becomes a free
/// block of its own (see [`Region::split_front`]).
pub(crate) struct Block {
    /// Size of the payload in bytes. Always a multiple of [`MIN_ALIGN`].
    pub size: usize,
    /// Atomic because thread caches move blocks between [`State::Allocated`]
    /// and [`State::Cached`] without the heap lock.
    state: AtomicU8,
    /// `BLOCK_MAGIC ^ header address`, see [`from_payload`].
    check: usize,
    /// Region which the block belongs to
    pub region: NonNull<Node<Region>>,
}

impl Block {
    pub fn new(size: usize, state: State, region: NonNull<Node<Region>>, at: NonNull<u8>) -> Self {
        Self {
            size,
            state: AtomicU8::new(state as u8),
            check: BLOCK_MAGIC ^ at.as_ptr() as usize,
            region,
        }
    }

    #[inline]
    pub fn state(&self) -> State {
        State::from_raw(self.state.load(Ordering::Acquire))
    }

    #[inline]
    pub fn set_state(&self, state: State) {
        self.state.store(state as u8, Ordering::Release);
    }

    /// Moves the block from `from` to `to`. Fails if its state is not
    /// `from`, which includes losing a race against another thread.
    #[inline]
    pub fn transition(&self, from: State, to: State) -> bool {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    #[inline]
    pub fn is_free(&self) -> bool {
        self.state() == State::Free
    }
}

/// Address of the first payload byte of `node`.
#[inline]
pub(crate) fn payload(node: BlockNode) -> NonNull<u8> {
    // SAFETY: every header is followed by its payload inside the same region.
    unsafe { node.cast::<u8>().add(BLOCK_HEADER_SIZE) }
}

/// Address of the header that would precede `payload`.
#[inline]
pub(crate) fn header_at(payload: usize) -> NonNull<u8> {
    // SAFETY: only called with payload addresses inside a region, which are
    // always preceded by a header.
    unsafe { NonNull::new_unchecked((payload - BLOCK_HEADER_SIZE) as *mut u8) }
}

/// One past the last payload byte of `node`.
#[inline]
pub(crate) unsafe fn end(node: BlockNode) -> usize {
    unsafe { payload(node).as_ptr() as usize + node.as_ref().data.size }
}

/// Marks the header of a block that was merged into a neighbour.
pub(crate) unsafe fn retire(mut node: BlockNode) {
    unsafe {
        node.as_mut().data.check = RETIRED_MAGIC ^ node.as_ptr() as usize;
    }
}

/// Finds and validates the header of the allocated block whose payload
/// starts at `ptr`.
///
/// Reading the header of a pointer we never handed out is inherently a
/// guess. The check word, the owning region's check word, its owner id
/// (`owner`, the heap asking) and the region bounds make a false positive
/// practically impossible. Pointers whose
/// header falls into unmapped memory cannot be detected without faulting.
///
/// **SAFETY**: `ptr - BLOCK_HEADER_SIZE` must be readable.
pub(crate) unsafe fn from_payload(ptr: NonNull<u8>, owner: usize) -> Result<BlockNode> {
    let addr = ptr.as_ptr() as usize;

    if !is_aligned(addr, MIN_ALIGN) || addr < BLOCK_HEADER_SIZE {
        return Err(AllocError::ForeignPointer(addr));
    }

    let node = header_at(addr).cast::<Node<Block>>();
    let block = unsafe { &node.as_ref().data };

    if block.check == RETIRED_MAGIC ^ node.as_ptr() as usize {
        return Err(AllocError::DoubleFree(addr));
    }

    if block.check != BLOCK_MAGIC ^ node.as_ptr() as usize {
        return Err(AllocError::ForeignPointer(addr));
    }

    if !unsafe { Region::owns(block.region, node, owner) } {
        return Err(AllocError::ForeignPointer(addr));
    }

    match block.state() {
        State::Allocated => Ok(node),
        State::Free | State::Cached => Err(AllocError::DoubleFree(addr)),
    }
}

/// Hands a block taken out of a thread cache back to its owner, or to the
/// heap.
///
/// **SAFETY**: `ptr` must be the payload of a block in [`State::Cached`].
pub(crate) unsafe fn uncache(ptr: NonNull<u8>) {
    let node = header_at(ptr.as_ptr() as usize).cast::<Node<Block>>();
    let uncached = unsafe { node.as_ref().data.transition(State::Cached, State::Allocated) };
    debug_assert!(uncached, "cached block at {ptr:p} was not in the cached state");
}

/// Verifies the check word of a header reached through the metadata
/// itself (list walks) rather than through a user pointer.
pub(crate) unsafe fn is_intact(node: BlockNode) -> bool {
    unsafe { node.as_ref().data.check == BLOCK_MAGIC ^ node.as_ptr() as usize }
}
