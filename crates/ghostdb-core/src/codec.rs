//! Helpers shared by the rkyv-encoded types.

use rkyv::util::AlignedVec;

/// Copy stored bytes into a buffer rkyv can validate in place.
///
/// sled hands out values at arbitrary offsets, while archived types need
/// their natural alignment.
pub(crate) fn aligned(bytes: &[u8]) -> AlignedVec<16> {
    let mut buffer = AlignedVec::<16>::with_capacity(bytes.len());
    buffer.extend_from_slice(bytes);
    buffer
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aligned_copy() {
        let storage = vec![0u8; 40];
        let unaligned = &storage[3..35];
        let buffer = aligned(unaligned);
        assert_eq!(buffer.as_slice(), unaligned);
        assert_eq!(buffer.as_ptr() as usize % 16, 0);
    }
}
