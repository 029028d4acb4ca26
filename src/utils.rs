//! Address and size arithmetic shared by every layer of the allocator.
//! None of these helpers touch memory, they only compute offsets.

/// Minimum alignment of every payload handed out by the heap. Block and
/// region headers are padded to a multiple of this value, so as long as
/// every block size is a multiple of it too, every payload is aligned.
pub const MIN_ALIGN: usize = 16;

/// It aligns `to_be_aligned` up to the next multiple of `alignment`.
///
/// This is used to align region sizes to a multiple of the page size and
/// payload sizes to a multiple of [`MIN_ALIGN`]. `alignment` must be a
/// power of two and the result must not overflow, see [`checked_align`]
/// for untrusted input.
#[inline]
pub const fn align(to_be_aligned: usize, alignment: usize) -> usize {
    (to_be_aligned + alignment - 1) & !(alignment - 1)
}

/// Same as [`align`] but returns `None` instead of wrapping around.
#[inline]
pub const fn checked_align(to_be_aligned: usize, alignment: usize) -> Option<usize> {
    match to_be_aligned.checked_add(alignment - 1) {
        Some(sum) => Some(sum & !(alignment - 1)),
        None => None,
    }
}

/// Rounds `addr` down to a multiple of `alignment`.
#[inline]
pub const fn align_down(addr: usize, alignment: usize) -> usize {
    addr & !(alignment - 1)
}

#[inline]
pub const fn is_aligned(addr: usize, alignment: usize) -> bool {
    addr & (alignment - 1) == 0
}
