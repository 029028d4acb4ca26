use std::{mem, ptr::NonNull};

use crate::{
    block::{self, BLOCK_HEADER_SIZE, Block, BlockNode, State},
    freelist::FreeIndex,
    kernel::Mapping,
    list::{List, Node},
    utils::{MIN_ALIGN, align},
};

/// This is the overhead size introduced by the [`Region`] header in bytes.
/// The header is represented as a [`Node`]. See [`List`] for more detail.
pub(crate) const REGION_HEADER_SIZE: usize = align(mem::size_of::<Node<Region>>(), MIN_ALIGN);

const REGION_MAGIC: usize = 0x5E6A_4E10;

/// This struct contains the memory region specific metadata. However,
/// as every other header, this is usually represented as a [`Node<Region>`]
/// so that would be the complete region data.
///
/// The page source gives us memory regions aligned to the page size. But
/// we cannot use a full region each time the user allocates memory since
/// we would be wasting a lot of space. Also, we cannot assume regions are
/// adjacent.
///
/// Therefore, we use a linked list of [`Region`] which inside of them
/// have a linked list of [`Block`] ordered by address.
///
/// ```text
/// +-----------------------------------------------+      +-----------------------------------------------+
/// |        | +-------+    +-------+    +-------+  |      |        | +-------+    +-------+    +-------+  |
/// | Region | | Block | -> | Block | -> | Block |  | ---> | Region | | Block | -> | Block | -> | Block |  |
/// |        | +-------+    +-------+    +-------+  |      |        | +-------+    +-------+    +-------+  |
/// +-----------------------------------------------+      +-----------------------------------------------+
/// ```
///
/// The blocks of a region partition it exactly: the first header sits right
/// after the region header and every following header starts where the
/// previous payload ends.
pub(crate) struct Region {
    /// Length of the whole mapping, region header included.
    pub size: usize,
    check: usize,
    /// Id of the heap the region belongs to.
    pub owner: usize,
    /// List of blocks in the region, ordered by address.
    pub blocks: List<Block>,
}

pub(crate) type RegionNode = NonNull<Node<Region>>;

impl Region {
    /// Writes a region header at the start of `mapping`, links it into
    /// `regions` and carves the rest of the mapping into a single block.
    /// The block is left out of the free index, the caller decides.
    ///
    /// **SAFETY**: `mapping` must be a fresh mapping owned by the caller.
    pub unsafe fn install(regions: &mut List<Region>, mapping: Mapping, owner: usize) -> (RegionNode, BlockNode) {
        unsafe {
            let mut region = regions.append(
                Region {
                    size: mapping.len,
                    check: REGION_MAGIC ^ mapping.base.as_ptr() as usize,
                    owner,
                    blocks: List::new(),
                },
                mapping.base,
            );

            // First Node<Block> right after Node<Region>
            let block_addr = mapping.base.add(REGION_HEADER_SIZE);
            let block_size = mapping.len - REGION_HEADER_SIZE - BLOCK_HEADER_SIZE;

            let block = region.as_mut().data.blocks.append(
                Block::new(block_size, State::Free, region, block_addr),
                block_addr,
            );

            (region, block)
        }
    }

    /// The mapping this region lives in.
    pub fn mapping(node: RegionNode) -> Mapping {
        Mapping {
            base: node.cast(),
            len: unsafe { node.as_ref().data.size },
        }
    }

    /// Bytes available for block headers and payloads.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.size - REGION_HEADER_SIZE
    }

    /// A region is unused when a single free block spans all of it.
    pub fn is_unused(&self) -> bool {
        self.blocks.len() == 1 && self.blocks.iter().all(Block::is_free)
    }

    /// Whether `region` looks like a live region header of heap `owner` and
    /// `block` lies inside it.
    ///
    /// Only the immutable fields of the header are read, the block list may
    /// be changing under the heap lock while the thread cache asks.
    ///
    /// **SAFETY**: `region` must be readable, which holds whenever it was
    /// read from a header whose check word matched.
    pub unsafe fn owns(region: RegionNode, block: BlockNode, owner: usize) -> bool {
        let base = region.as_ptr() as usize;

        let (check, size, id) = unsafe {
            let data = &raw const (*region.as_ptr()).data;
            (
                (&raw const (*data).check).read(),
                (&raw const (*data).size).read(),
                (&raw const (*data).owner).read(),
            )
        };

        if check != REGION_MAGIC ^ base || id != owner {
            return false;
        }

        let addr = block.as_ptr() as usize;

        addr >= base + REGION_HEADER_SIZE && addr + BLOCK_HEADER_SIZE <= base + size
    }

    pub fn is_intact(node: RegionNode) -> bool {
        unsafe { node.as_ref().data.check == REGION_MAGIC ^ node.as_ptr() as usize }
    }

    /// Tries to merge the given block `node` with the previous one
    /// on the list. This can be performed if that previous block is free.
    /// On success `node` points to the merged block.
    pub(crate) fn merge_with_prev(&mut self, node: &mut BlockNode, free: &mut FreeIndex) {
        unsafe {
            // If the previous block is free, we can merge it with this one.
            if let Some(mut prev_node) = node.as_ref().prev {
                if prev_node.as_ref().data.is_free() {
                    // The previous block leaves the index before its size
                    // changes, otherwise it would be looked up in the wrong class.
                    free.remove(prev_node);

                    // We need to cover the header and the actual content of the block
                    prev_node.as_mut().data.size += BLOCK_HEADER_SIZE + node.as_ref().data.size;

                    self.blocks.remove(*node);
                    block::retire(*node);

                    // The current block is now its previous one
                    *node = prev_node;
                }
            }
        }
    }

    /// Tries to merge the given block `node` with the next one on the
    /// list. This can be performed if that next block is free. The state of
    /// `node` itself is not looked at, so this also grows allocated blocks.
    pub(crate) fn merge_with_next(&mut self, mut node: BlockNode, free: &mut FreeIndex) -> bool {
        unsafe {
            if let Some(next_node) = node.as_ref().next {
                let next_size = next_node.as_ref().data.size;

                if next_node.as_ref().data.is_free() {
                    free.remove(next_node);

                    node.as_mut().data.size += BLOCK_HEADER_SIZE + next_size;

                    self.blocks.remove(next_node);
                    block::retire(next_node);

                    return true;
                }
            }
        }

        false
    }

    /// Cuts `node` down to `size` bytes if what is left can still form a
    /// block with at least `min_payload` bytes. Returns that remainder,
    /// tagged free but not yet in the free index.
    pub(crate) fn split(&mut self, mut node: BlockNode, size: usize, min_payload: usize) -> Option<BlockNode> {
        unsafe {
            let Block { size: current, region, .. } = node.as_ref().data;

            if current < size + BLOCK_HEADER_SIZE + min_payload {
                return None;
            }

            let at = block::payload(node).add(size);
            let remainder = Block::new(current - size - BLOCK_HEADER_SIZE, State::Free, region, at);

            node.as_mut().data.size = size;

            Some(self.blocks.insert_after(node, remainder, at))
        }
    }

    /// Splits the first `offset` payload bytes of `node` off as their own
    /// block so that the returned block's payload starts `offset` bytes
    /// later. `node` keeps its header and shrinks to `offset -
    /// BLOCK_HEADER_SIZE` bytes. Used to satisfy over-aligned requests.
    pub(crate) fn split_front(&mut self, mut node: BlockNode, offset: usize) -> BlockNode {
        debug_assert!(offset >= BLOCK_HEADER_SIZE + block::MIN_PAYLOAD);

        unsafe {
            let Block { size, region, .. } = node.as_ref().data;
            let state = node.as_ref().data.state();

            let at = block::payload(node).add(offset - BLOCK_HEADER_SIZE);
            let back = Block::new(size - offset, state, region, at);

            node.as_mut().data.size = offset - BLOCK_HEADER_SIZE;

            self.blocks.insert_after(node, back, at)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{block::MIN_PAYLOAD, kernel};

    fn region_of(block: BlockNode) -> &'static mut Region {
        unsafe {
            let mut region = block.as_ref().data.region;
            &mut region.as_mut().data
        }
    }

    fn sizes(region: &Region) -> Vec<usize> {
        region.blocks.iter().map(|b| b.size).collect()
    }

    fn partition_holds(region: &Region) -> bool {
        let covered: usize = region.blocks.iter().map(|b| BLOCK_HEADER_SIZE + b.size).sum();
        covered == region.capacity()
    }

    #[test]
    fn install_carves_one_block() {
        let mut regions = List::new();
        let mapping = kernel::acquire(1).unwrap();
        let (region, block) = unsafe { Region::install(&mut regions, mapping, 1) };

        unsafe {
            assert_eq!(block.as_ptr() as usize, mapping.base.as_ptr() as usize + REGION_HEADER_SIZE);
            assert!(region.as_ref().data.is_unused());
            assert!(partition_holds(&region.as_ref().data));
            assert!(Region::owns(region, block, 1));
            assert!(!Region::owns(region, block, 2));
            assert!(Region::is_intact(region));

            regions.remove(region);
            kernel::release(mapping).unwrap();
        }
    }

    #[test]
    fn split_then_merge_restores_single_block() {
        let mut regions = List::new();
        let mut free = FreeIndex::new();
        let mapping = kernel::acquire(1).unwrap();
        let (_, block) = unsafe { Region::install(&mut regions, mapping, 1) };
        let region = region_of(block);
        let whole = unsafe { block.as_ref().data.size };

        let tail = region.split(block, 128, MIN_PAYLOAD).unwrap();
        assert_eq!(sizes(region), vec![128, whole - 128 - BLOCK_HEADER_SIZE]);
        assert!(partition_holds(region));
        assert_eq!(unsafe { block::end(block) }, tail.as_ptr() as usize);

        // The tail is free but outside the index, add it before merging.
        unsafe { free.insert(tail) };
        assert!(region.merge_with_next(block, &mut free));
        assert!(free.is_empty());
        assert_eq!(sizes(region), vec![whole]);

        unsafe { kernel::release(mapping).unwrap() };
    }

    #[test]
    fn split_refuses_micro_remainders() {
        let mut regions = List::new();
        let mapping = kernel::acquire(1).unwrap();
        let (_, block) = unsafe { Region::install(&mut regions, mapping, 1) };
        let region = region_of(block);
        let whole = unsafe { block.as_ref().data.size };

        assert!(region.split(block, whole - BLOCK_HEADER_SIZE - MIN_PAYLOAD + 16, MIN_PAYLOAD).is_none());
        assert_eq!(sizes(region), vec![whole]);

        unsafe { kernel::release(mapping).unwrap() };
    }

    #[test]
    fn merge_with_prev_absorbs_into_predecessor() {
        let mut regions = List::new();
        let mut free = FreeIndex::new();
        let mapping = kernel::acquire(1).unwrap();
        let (_, first) = unsafe { Region::install(&mut regions, mapping, 1) };
        let region = region_of(first);

        let second = region.split(first, 64, MIN_PAYLOAD).unwrap();
        let _third = region.split(second, 64, MIN_PAYLOAD).unwrap();

        unsafe {
            free.insert(first);

            let mut node = second;
            node.as_ref().data.set_state(State::Free);
            region.merge_with_prev(&mut node, &mut free);

            assert_eq!(node, first);
            assert_eq!(node.as_ref().data.size, 64 + BLOCK_HEADER_SIZE + 64);
            assert!(free.is_empty());
            assert!(block::from_payload(block::payload(second), 1).is_err());
        }

        assert!(partition_holds(region));
        unsafe { kernel::release(mapping).unwrap() };
    }

    #[test]
    fn split_front_keeps_headers_in_front_of_payloads() {
        let mut regions = List::new();
        let mapping = kernel::acquire(1).unwrap();
        let (_, block) = unsafe { Region::install(&mut regions, mapping, 1) };
        let region = region_of(block);

        let offset = BLOCK_HEADER_SIZE + MIN_PAYLOAD + 32;
        let back = region.split_front(block, offset);

        assert_eq!(
            block::payload(back).as_ptr() as usize,
            block::payload(block).as_ptr() as usize + offset
        );
        assert_eq!(unsafe { block.as_ref().data.size }, MIN_PAYLOAD + 32);
        assert!(partition_holds(region));

        unsafe { kernel::release(mapping).unwrap() };
    }
}
