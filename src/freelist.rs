use crate::{
    block::{BLOCK_HEADER_SIZE, BlockNode, MIN_PAYLOAD, State, payload},
    list::{List, Node},
    utils::{align, is_aligned},
};

/// One class per bit of `usize`: class `c` holds blocks whose payload size
/// lies in `[2^c, 2^(c + 1))`.
pub(crate) const NUM_CLASSES: usize = usize::BITS as usize;

/// Segregated free lists used to keep track of free [`Block`](crate::block::Block)s.
///
/// Every class is a [`List`] of pointers to the actual block headers. As in
/// any free list allocator, we don't need to store anything for free blocks
/// except the list links, so those links live inside the payload of the
/// free block itself:
///
/// ```text
/// +------------------------+ <--------+
/// |       Node<Block>      |          |
/// |        - size          |          |-------> Block Header
/// |        - state: Free   |          |
/// +------------------------+ <--------+
/// |  Node<NonNull<Block>>  |  <- link in classes[class_of(size)]
/// +------------------------+
/// |      Free Payload      |
/// |        (unused)        |
/// +------------------------+
/// ```
///
/// Because the link always sits at the start of the payload, removing a
/// block is O(1): no need to search the class for it.
///
/// `non_empty` has bit `c` set whenever class `c` holds at least one block,
/// so skipping empty classes costs a `trailing_zeros`.
pub(crate) struct FreeIndex {
    classes: [List<BlockNode>; NUM_CLASSES],
    non_empty: usize,
    len: usize,
}

/// Size class of a payload of `size` bytes (`floor(log2(size))`).
#[inline]
pub(crate) const fn class_of(size: usize) -> usize {
    debug_assert!(size > 0);
    (usize::BITS - 1 - size.leading_zeros()) as usize
}

/// Offset from the natural payload of `node` to the first payload address
/// aligned to `alignment` that still leaves room for `size` bytes, or `None`
/// if the block is too small.
///
/// A misaligned payload can only be moved forward far enough to leave a
/// complete free block (header plus [`MIN_PAYLOAD`]) in front of it, which
/// is what keeps headers exactly in front of payloads.
pub(crate) fn aligned_offset(node: BlockNode, size: usize, alignment: usize) -> Option<usize> {
    let natural = payload(node).as_ptr() as usize;
    let available = unsafe { node.as_ref().data.size };

    let offset = if is_aligned(natural, alignment) {
        0
    } else {
        align(natural + BLOCK_HEADER_SIZE + MIN_PAYLOAD, alignment) - natural
    };

    (offset.checked_add(size)? <= available).then_some(offset)
}

impl FreeIndex {
    pub const fn new() -> Self {
        Self {
            classes: [const { List::new() }; NUM_CLASSES],
            non_empty: 0,
            len: 0,
        }
    }

    /// Number of free blocks in the index.
    #[inline]
    pub fn len(&self) -> usize {
        self.len
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Marks `block` as free and links it into the class of its size.
    ///
    /// **SAFETY**: `block` must be a valid header that is not in the index
    /// and whose payload is at least [`MIN_PAYLOAD`] bytes.
    pub unsafe fn insert(&mut self, block: BlockNode) {
        unsafe {
            let size = block.as_ref().data.size;
            debug_assert!(size >= MIN_PAYLOAD);

            block.as_ref().data.set_state(State::Free);

            let class = class_of(size);
            self.classes[class].append(block, payload(block));
            self.non_empty |= 1 << class;
        }

        self.len += 1;
    }

    /// Unlinks `block` from the index. The size of the block must not have
    /// changed since it was inserted, otherwise we would look for it in the
    /// wrong class.
    ///
    /// **SAFETY**: `block` must currently be in the index.
    pub unsafe fn remove(&mut self, block: BlockNode) {
        let class = class_of(unsafe { block.as_ref().data.size });
        let link = payload(block).cast::<Node<BlockNode>>();

        unsafe {
            debug_assert!(link.as_ref().data == block);
            self.classes[class].remove(link);
        }

        if self.classes[class].is_empty() {
            self.non_empty &= !(1 << class);
        }

        self.len -= 1;
    }

    /// Returns the first block that can hold `size` bytes at `alignment`,
    /// starting from the smallest class that may contain one.
    ///
    /// The class of `size` itself is scanned entirely since its blocks may
    /// or may not be large enough. In bigger classes every block is large
    /// enough for requests at the minimum alignment, so the first entry of
    /// the first non-empty class wins; only over-aligned requests may have
    /// to keep scanning.
    pub fn find_fit(&self, size: usize, alignment: usize) -> Option<BlockNode> {
        let first = class_of(size);
        let mut candidates = self.non_empty & (usize::MAX << first);

        while candidates != 0 {
            let class = candidates.trailing_zeros() as usize;

            for &block in &self.classes[class] {
                if aligned_offset(block, size, alignment).is_some() {
                    return Some(block);
                }
            }

            candidates &= candidates - 1;
        }

        None
    }

    /// Every free block, class by class.
    pub fn blocks(&self) -> impl Iterator<Item = BlockNode> + '_ {
        self.classes.iter().flat_map(|class| class.iter().copied())
    }

    /// Forgets every block. Used when the memory backing them goes away.
    pub fn clear(&mut self) {
        *self = Self::new();
    }
}
