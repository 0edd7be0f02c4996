//! Variable-length integers.
//!
//! Traced strings are written to the data stream with a length prefix in
//! this encoding. It is a self-delimiting big-endian scheme: the count of
//! leading one-bits in the first byte is the number of additional bytes,
//! so a decoder never needs lookahead. Nine size classes cover the full
//! unsigned 64-bit range:
//!
//! ```text
//!   class minimum       bytes   leading byte   value bits
//!                 0       1      0???????          7
//!              0x80       2      10??????         14
//!            0x4080       3      110?????         21
//!          0x204080       4      1110????         28
//!        0x10204080       5      11110???         35
//!      0x0810204080       6      111110??         42
//!    0x040810204080       7      1111110?         49
//!  0x02040810204080       8      11111110         56
//! 0x0102040810204080      9      11111111         64
//! ```
//!
//! Classes 2 through 8 store the value minus the class minimum, which is
//! what makes every class's full bit range usable and the encoding
//! minimal. Class 9 stores the raw 64-bit value in the trailing eight
//! bytes.

use crate::{DifError, DifResult};

/// Maximum number of bytes an encoded integer can occupy.
pub const MAX_BYTES: usize = 9;

/// Inclusive lower bound of each size class, indexed by class - 1.
const CLASS_MIN: [u64; 9] = [
    0,
    0x80,
    0x4080,
    0x0020_4080,
    0x1020_4080,
    0x08_1020_4080,
    0x0408_1020_4080,
    0x0002_0408_1020_4080,
    0x0102_0408_1020_4080,
];

/// Inclusive upper bound of each size class, indexed by class - 1.
const CLASS_MAX: [u64; 9] = [
    0x7f,
    0x407f,
    0x0020_407f,
    0x1020_407f,
    0x08_1020_407f,
    0x0408_1020_407f,
    0x0002_0408_1020_407f,
    0x0102_0408_1020_407f,
    u64::MAX,
];

/// Leading byte prefix of each size class, indexed by class - 1.
const CLASS_PREFIX: [u8; 9] = [0x00, 0x80, 0xc0, 0xe0, 0xf0, 0xf8, 0xfc, 0xfe, 0xff];

/// The number of bytes `encode` will use for `val`.
pub fn size(val: u64) -> usize {
    // CLASS_MAX is sorted, so the first class that can hold the value is
    // the minimal one.
    CLASS_MAX.iter().position(|&max| val <= max).unwrap() + 1
}

/// Encode `val` into `buf`, returning the number of bytes written.
///
/// `buf` must be at least [`size`]`(val)` bytes; nine bytes always
/// suffice.
pub fn encode(val: u64, buf: &mut [u8]) -> usize {
    let nbytes = size(val);
    match nbytes {
        1 => buf[0] = val as u8,
        9 => {
            buf[0] = 0xff;
            buf[1..9].copy_from_slice(&val.to_be_bytes());
        }
        n => {
            let excess = val - CLASS_MIN[n - 1];
            buf[0] = CLASS_PREFIX[n - 1] | (excess >> (8 * (n - 1))) as u8;
            for (i, b) in buf[1..n].iter_mut().enumerate() {
                *b = (excess >> (8 * (n - 2 - i))) as u8;
            }
        }
    }
    nbytes
}

/// Encode `val` into a fresh buffer.
pub fn encode_to_vec(val: u64) -> Vec<u8> {
    let mut buf = [0; MAX_BYTES];
    let n = encode(val, &mut buf);
    buf[..n].to_vec()
}

/// The total encoded length implied by a leading byte.
pub fn len_from_first_byte(first: u8) -> usize {
    first.leading_ones() as usize + 1
}

/// Decode one integer from the front of `buf`, returning the value and
/// the number of bytes consumed.
pub fn decode(buf: &[u8]) -> DifResult<(u64, usize)> {
    let first = *buf.first().ok_or(DifError::BadVarint)?;
    let nbytes = len_from_first_byte(first);
    if buf.len() < nbytes {
        return Err(DifError::BadVarint);
    }
    let val = match nbytes {
        1 => u64::from(first),
        9 => {
            let mut raw = [0; 8];
            raw.copy_from_slice(&buf[1..9]);
            u64::from_be_bytes(raw)
        }
        n => {
            let extra = n - 1;
            let mask = (0xffu32 >> extra >> 1) as u8;
            let mut excess = u64::from(first & mask);
            for &b in &buf[1..n] {
                excess = (excess << 8) | u64::from(b);
            }
            excess + CLASS_MIN[n - 1]
        }
    };
    Ok((val, nbytes))
}

/// Skip one encoded integer, returning the rest of `buf`.
pub fn skip(buf: &[u8]) -> DifResult<&[u8]> {
    let first = *buf.first().ok_or(DifError::BadVarint)?;
    let nbytes = len_from_first_byte(first);
    buf.get(nbytes..).ok_or(DifError::BadVarint)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn roundtrip(val: u64) -> (u64, usize) {
        let mut buf = [0; MAX_BYTES];
        let n = encode(val, &mut buf);
        let (back, m) = decode(&buf[..n]).unwrap();
        assert_eq!(n, m);
        (back, n)
    }

    #[test]
    fn known_vectors() {
        assert_eq!(encode_to_vec(0), [0x00]);
        assert_eq!(encode_to_vec(127), [0x7f]);
        assert_eq!(encode_to_vec(128), [0x80, 0x00]);
        assert_eq!(encode_to_vec(16511), [0xbf, 0xff]);
        assert_eq!(encode_to_vec(16512), [0xc0, 0x00, 0x00]);
        assert_eq!(encode_to_vec(u64::MAX), [0xff; 9]);
    }

    #[test]
    fn class_boundaries() {
        for class in 0..9 {
            let lo = CLASS_MIN[class];
            let hi = CLASS_MAX[class];
            for val in [lo, hi] {
                let (back, n) = roundtrip(val);
                assert_eq!(back, val, "value {val:#x}");
                assert_eq!(n, class + 1, "value {val:#x}");
            }
        }
    }

    #[test]
    fn skip_steps_over_one_value() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&encode_to_vec(300));
        buf.extend_from_slice(&encode_to_vec(7));
        let rest = skip(&buf).unwrap();
        assert_eq!(decode(rest).unwrap(), (7, 1));
    }

    #[test]
    fn truncated_input_is_an_error() {
        assert!(decode(&[]).is_err());
        assert!(decode(&[0x80]).is_err());
        assert!(decode(&[0xff, 0, 0]).is_err());
        assert!(skip(&[0xc0, 0]).is_err());
    }

    proptest! {
        #[test]
        fn roundtrip_is_identity(val: u64) {
            let (back, _) = roundtrip(val);
            prop_assert_eq!(back, val);
        }

        #[test]
        fn encoding_is_minimal(val: u64) {
            // A shorter class must not be able to represent the value.
            let n = size(val);
            if n > 1 {
                prop_assert!(val > CLASS_MAX[n - 2]);
            }
        }
    }
}
