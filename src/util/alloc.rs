//! Utilities to support suballocation of device memory regions.

/// Returns the smallest value greater or equal to `offset` that satisfies `alignment`.
///
/// `alignment` must be a power of two. An alignment of 0 is treated as 1.
pub const fn next_aligned(offset: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return offset;
    }
    let mask = alignment - 1;
    (offset + mask) & !mask
}
