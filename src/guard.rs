use std::{mem, ptr::NonNull};

use log::debug;

use crate::{
    config::GuardLocation,
    error::{AllocError, Result},
    kernel::{self, Mapping},
    list::{List, Node},
    utils::{align_down, checked_align},
};

/// Metadata of an allocation living in a mapping of its own, surrounded by
/// inaccessible pages:
///
/// ```text
/// +-----------+-------------+-----------------------------+-------------+
/// | meta page | guard page? |         data pages          | guard page? |
/// +-----------+-------------+-----------------------------+-------------+
///  Node<Guarded>              ^ payload (Before)
///                                     payload (After / Both) ^---------^
/// ```
///
/// The header never shares a page with the payload, so no out of bounds
/// write next to the payload can reach it.
pub(crate) struct Guarded {
    mapping_len: usize,
    payload: NonNull<u8>,
    /// Bytes from `payload` up to the end of the data pages.
    usable: usize,
}

pub(crate) struct GuardedAllocations {
    location: GuardLocation,
    live: List<Guarded>,
}

impl GuardedAllocations {
    pub const fn new(location: GuardLocation) -> Self {
        Self {
            location,
            live: List::new(),
        }
    }

    pub fn allocate(&mut self, size: usize, alignment: usize) -> Result<NonNull<u8>> {
        let page = kernel::page_size();

        // The payload is placed relative to page boundaries, larger
        // alignments cannot be honoured.
        if alignment > page {
            return Err(AllocError::AlignmentTooLarge { align: alignment, max: page });
        }

        debug_assert!(mem::size_of::<Node<Guarded>>() <= page);

        let data_len = checked_align(size, page).ok_or(AllocError::OutOfMemory { size })?;
        let before = if self.location.before() { page } else { 0 };
        let after = if self.location.after() { page } else { 0 };

        let total = [page, before, after]
            .into_iter()
            .try_fold(data_len, usize::checked_add)
            .ok_or(AllocError::OutOfMemory { size })?;

        let mapping = kernel::acquire(total)?;
        let base = mapping.base;

        unsafe {
            let data = base.add(page + before);

            if let Err(err) = self.protect(data, data_len, before, after) {
                kernel::release(mapping)?;
                return Err(err);
            }

            let payload = match self.location {
                GuardLocation::After | GuardLocation::Both => {
                    let end = data.as_ptr() as usize + data_len;
                    data.add(align_down(end - size, alignment) - data.as_ptr() as usize)
                }
                _ => data,
            };

            let usable = data.as_ptr() as usize + data_len - payload.as_ptr() as usize;

            self.live.append(
                Guarded {
                    mapping_len: mapping.len,
                    payload,
                    usable,
                },
                base,
            );

            debug!("guarded allocation of {size} bytes at {:p}", payload);

            Ok(payload)
        }
    }

    unsafe fn protect(&self, data: NonNull<u8>, data_len: usize, before: usize, after: usize) -> Result<()> {
        unsafe {
            if before > 0 {
                kernel::protect_none(data.sub(before), before)?;
            }
            if after > 0 {
                kernel::protect_none(data.add(data_len), after)?;
            }
        }

        Ok(())
    }

    /// Finds the live allocation whose payload is `ptr`.
    ///
    /// Unlike heap blocks, the list of live allocations is searched instead
    /// of trusting memory in front of the pointer, which could be a guard
    /// page.
    fn lookup(&self, ptr: NonNull<u8>) -> Result<NonNull<Node<Guarded>>> {
        self.live
            .nodes()
            .find(|node| unsafe { node.as_ref().data.payload } == ptr)
            .ok_or(AllocError::ForeignPointer(ptr.as_ptr() as usize))
    }

    pub fn usable_size(&self, ptr: NonNull<u8>) -> Result<usize> {
        let node = self.lookup(ptr)?;
        Ok(unsafe { node.as_ref().data.usable })
    }

    pub fn release(&mut self, ptr: NonNull<u8>) -> Result<()> {
        let node = self.lookup(ptr)?;

        unsafe {
            let mapping = Self::mapping(node);
            self.live.remove(node);
            kernel::release(mapping)
        }
    }

    /// Unmaps every live allocation. Keeps going after a failure and
    /// reports the first one.
    pub fn release_all(&mut self) -> Result<()> {
        let mut outcome = Ok(());

        while let Some(node) = self.live.pop_front() {
            let released = unsafe { kernel::release(Self::mapping(node)) };
            outcome = outcome.and(released);
        }

        outcome
    }

    fn mapping(node: NonNull<Node<Guarded>>) -> Mapping {
        Mapping {
            base: node.cast(),
            len: unsafe { node.as_ref().data.mapping_len },
        }
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    /// `(mapped bytes, usable bytes)` of every live allocation.
    pub fn footprint(&self) -> impl Iterator<Item = (usize, usize)> + '_ {
        self.live.iter().map(|guarded| (guarded.mapping_len, guarded.usable))
    }
}

/// Smallest mapping a guarded allocation of `size` bytes takes, used by
/// the tests to reason about layout.
#[cfg(test)]
fn mapping_len(location: GuardLocation, size: usize) -> usize {
    let page = kernel::page_size();
    let guards = (location.before() as usize + location.after() as usize) * page;
    page + guards + crate::utils::align(size, page)
}
