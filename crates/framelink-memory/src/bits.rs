//! Bit-level helpers for packing sub-byte register fields.
//!
//! The variable layer addresses hardware fields by `(lsb, width)` in bits;
//! these helpers move such fields between byte buffers. Byte-aligned spans
//! take a memcpy fast path, everything else goes bit by bit. All three are
//! pure: no locks, no state.

use crate::error::MemoryError;

fn check_span(len_bytes: usize, lsb: usize, width: usize) -> Result<(), MemoryError> {
    if lsb + width > len_bytes * 8 { Err(MemoryError::Size) } else { Ok(()) }
}

/// Copy `width` bits from `src` starting at `src_lsb` into `dst` at
/// `dst_lsb`.
pub fn copy_bits(
    dst: &mut [u8],
    dst_lsb: usize,
    src: &[u8],
    src_lsb: usize,
    width: usize,
) -> Result<(), MemoryError> {
    check_span(dst.len(), dst_lsb, width)?;
    check_span(src.len(), src_lsb, width)?;

    let mut src_byte = src_lsb / 8;
    let mut src_bit = src_lsb % 8;
    let mut dst_byte = dst_lsb / 8;
    let mut dst_bit = dst_lsb % 8;
    let mut remaining = width;

    while remaining != 0 {
        let bytes = remaining / 8;
        if src_bit == 0 && dst_bit == 0 && bytes > 0 {
            dst[dst_byte..dst_byte + bytes].copy_from_slice(&src[src_byte..src_byte + bytes]);
            src_byte += bytes;
            dst_byte += bytes;
            remaining -= bytes * 8;
        } else {
            let bit = (src[src_byte] >> src_bit) & 0x1;
            dst[dst_byte] &= !(1 << dst_bit);
            dst[dst_byte] |= bit << dst_bit;
            src_bit += 1;
            src_byte += src_bit / 8;
            src_bit %= 8;
            dst_bit += 1;
            dst_byte += dst_bit / 8;
            dst_bit %= 8;
            remaining -= 1;
        }
    }
    Ok(())
}

/// Set `width` bits of `dst` starting at `lsb`.
pub fn set_bits(dst: &mut [u8], lsb: usize, width: usize) -> Result<(), MemoryError> {
    check_span(dst.len(), lsb, width)?;

    let mut byte = lsb / 8;
    let mut bit = lsb % 8;
    let mut remaining = width;

    while remaining != 0 {
        let bytes = remaining / 8;
        if bit == 0 && bytes > 0 {
            for slot in &mut dst[byte..byte + bytes] {
                *slot = 0xFF;
            }
            byte += bytes;
            remaining -= bytes * 8;
        } else {
            dst[byte] |= 1 << bit;
            bit += 1;
            byte += bit / 8;
            bit %= 8;
            remaining -= 1;
        }
    }
    Ok(())
}

/// True when any of the `width` bits of `src` starting at `lsb` is set.
pub fn any_bits(src: &[u8], lsb: usize, width: usize) -> Result<bool, MemoryError> {
    check_span(src.len(), lsb, width)?;

    let mut byte = lsb / 8;
    let mut bit = lsb % 8;
    let mut remaining = width;

    while remaining != 0 {
        if bit == 0 && remaining >= 8 {
            if src[byte] != 0 {
                return Ok(true);
            }
            byte += 1;
            remaining -= 8;
        } else {
            if src[byte] & (1 << bit) != 0 {
                return Ok(true);
            }
            bit += 1;
            byte += bit / 8;
            bit %= 8;
            remaining -= 1;
        }
    }
    Ok(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn aligned_copy_is_byte_exact() {
        let src = [0xDE, 0xAD, 0xBE, 0xEF];
        let mut dst = [0u8; 4];
        copy_bits(&mut dst, 0, &src, 0, 32).unwrap();
        assert_eq!(dst, src);
    }

    #[test]
    fn unaligned_field_extraction() {
        // A 3-bit field at bit 5 of 0b1110_0000.
        let src = [0b1110_0000u8];
        let mut dst = [0u8; 1];
        copy_bits(&mut dst, 0, &src, 5, 3).unwrap();
        assert_eq!(dst[0], 0b0000_0111);
    }

    #[test]
    fn copy_preserves_surrounding_bits() {
        let src = [0b0000_0101u8];
        let mut dst = [0b1111_0000u8];
        copy_bits(&mut dst, 1, &src, 0, 3).unwrap();
        assert_eq!(dst[0], 0b1111_1010);
    }

    #[test]
    fn set_and_test_ranges() {
        let mut buf = [0u8; 3];
        set_bits(&mut buf, 5, 9).unwrap();
        assert_eq!(buf, [0b1110_0000, 0b0011_1111, 0]);

        assert!(any_bits(&buf, 5, 1).unwrap());
        assert!(any_bits(&buf, 0, 24).unwrap());
        assert!(!any_bits(&buf, 0, 5).unwrap());
        assert!(!any_bits(&buf, 14, 10).unwrap());
    }

    #[test]
    fn out_of_range_spans_fail() {
        let mut buf = [0u8; 2];
        assert_eq!(set_bits(&mut buf, 10, 7), Err(MemoryError::Size));
        assert_eq!(any_bits(&buf, 16, 1), Err(MemoryError::Size));
        assert_eq!(copy_bits(&mut buf, 0, &[0u8], 4, 5), Err(MemoryError::Size));
    }

    proptest! {
        #[test]
        fn copy_matches_reference_model(
            src in prop::collection::vec(any::<u8>(), 1..6),
            dst_seed in prop::collection::vec(any::<u8>(), 1..6),
            src_lsb in 0usize..16,
            dst_lsb in 0usize..16,
            width in 1usize..24,
        ) {
            prop_assume!(src_lsb + width <= src.len() * 8);
            prop_assume!(dst_lsb + width <= dst_seed.len() * 8);

            let mut dst = dst_seed.clone();
            copy_bits(&mut dst, dst_lsb, &src, src_lsb, width).unwrap();

            let bit_of = |buf: &[u8], idx: usize| (buf[idx / 8] >> (idx % 8)) & 1;
            for k in 0..dst.len() * 8 {
                let expect = if k >= dst_lsb && k < dst_lsb + width {
                    bit_of(&src, src_lsb + (k - dst_lsb))
                } else {
                    bit_of(&dst_seed, k)
                };
                prop_assert_eq!(bit_of(&dst, k), expect);
            }
        }
    }
}
