//! Low-level encoding helpers shared by the part format.
//!
//! ## Conventions
//!
//! ```text
//! uvarint          LEB128, at most 10 bytes
//! bytes            [len: uvarint][data: len bytes]
//! u32 / u64        fixed width, big-endian
//! ```
//!
//! Big-endian fixed-width integers keep the byte order of every persisted
//! structure identical on all platforms.

pub mod compress;

pub use compress::{compress, compress_level_for_items, decompress};

use crate::error::{Error, Result};
use bytes::BufMut;

/// Maximum encoded length of a u64 varint.
pub const MAX_VARINT_LEN: usize = 10;

/// Appends `v` as an unsigned LEB128 varint.
pub fn put_uvarint(dst: &mut Vec<u8>, mut v: u64) {
    while v >= 0x80 {
        dst.push((v as u8) | 0x80);
        v >>= 7;
    }
    dst.push(v as u8);
}

/// Decodes an unsigned varint from the head of `src`.
///
/// Returns the value and the number of bytes consumed.
pub fn get_uvarint(src: &[u8]) -> Result<(u64, usize)> {
    let mut v: u64 = 0;
    let mut shift = 0u32;
    for (i, &b) in src.iter().enumerate() {
        if i == MAX_VARINT_LEN {
            return Err(Error::corruption("varint overflows 64 bits"));
        }
        if b < 0x80 {
            if i == MAX_VARINT_LEN - 1 && b > 1 {
                return Err(Error::corruption("varint overflows 64 bits"));
            }
            return Ok((v | (u64::from(b) << shift), i + 1));
        }
        v |= u64::from(b & 0x7f) << shift;
        shift += 7;
    }
    Err(Error::corruption("unexpected end of varint"))
}

/// Appends a length-prefixed byte string.
pub fn put_bytes(dst: &mut Vec<u8>, b: &[u8]) {
    put_uvarint(dst, b.len() as u64);
    dst.extend_from_slice(b);
}

/// Splits a length-prefixed byte string off the head of `src`.
///
/// Returns `(value, tail)`.
pub fn get_bytes(src: &[u8]) -> Result<(&[u8], &[u8])> {
    let (n, consumed) = get_uvarint(src)?;
    let src = &src[consumed..];
    if (src.len() as u64) < n {
        return Err(Error::corruption(format!(
            "cannot read {} bytes of data; only {} bytes left",
            n,
            src.len()
        )));
    }
    let n = n as usize;
    Ok((&src[..n], &src[n..]))
}

/// Appends a big-endian u32.
pub fn put_u32(dst: &mut Vec<u8>, v: u32) {
    dst.put_u32(v);
}

/// Appends a big-endian u64.
pub fn put_u64(dst: &mut Vec<u8>, v: u64) {
    dst.put_u64(v);
}

/// Reads a big-endian u32 from the head of `src`, returning the tail.
pub fn get_u32(src: &[u8]) -> Result<(u32, &[u8])> {
    if src.len() < 4 {
        return Err(Error::corruption(format!(
            "cannot read u32 from {} bytes",
            src.len()
        )));
    }
    let (head, tail) = src.split_at(4);
    let mut buf = [0u8; 4];
    buf.copy_from_slice(head);
    Ok((u32::from_be_bytes(buf), tail))
}

/// Reads a big-endian u64 from the head of `src`, returning the tail.
pub fn get_u64(src: &[u8]) -> Result<(u64, &[u8])> {
    if src.len() < 8 {
        return Err(Error::corruption(format!(
            "cannot read u64 from {} bytes",
            src.len()
        )));
    }
    let (head, tail) = src.split_at(8);
    let mut buf = [0u8; 8];
    buf.copy_from_slice(head);
    Ok((u64::from_be_bytes(buf), tail))
}

/// Appends every value of `values` as a varint.
pub fn put_uvarints(dst: &mut Vec<u8>, values: &[u64]) {
    for &v in values {
        put_uvarint(dst, v);
    }
}

/// Fills `dst` with varints decoded from `src` and returns the tail.
pub fn get_uvarints<'a>(dst: &mut [u64], mut src: &'a [u8]) -> Result<&'a [u8]> {
    for (i, slot) in dst.iter_mut().enumerate() {
        let (v, n) = get_uvarint(src).map_err(|e| {
            Error::corruption(format!("cannot read varint #{}: {}", i, e))
        })?;
        *slot = v;
        src = &src[n..];
    }
    Ok(src)
}

/// Length of the longest common prefix of `a` and `b`.
pub fn common_prefix_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_uvarint_boundaries() {
        for v in [0u64, 1, 127, 128, 16383, 16384, u32::MAX as u64, u64::MAX] {
            let mut buf = Vec::new();
            put_uvarint(&mut buf, v);
            let (got, n) = get_uvarint(&buf).unwrap();
            assert_eq!(got, v);
            assert_eq!(n, buf.len());
        }
    }

    #[test]
    fn test_uvarint_truncated() {
        assert!(get_uvarint(&[]).is_err());
        assert!(get_uvarint(&[0x80, 0x80]).is_err());
    }

    #[test]
    fn test_uvarint_overflow() {
        let buf = [0xff; 11];
        assert!(get_uvarint(&buf).is_err());
    }

    #[test]
    fn test_bytes_prefix() {
        let mut buf = Vec::new();
        put_bytes(&mut buf, b"hello");
        put_bytes(&mut buf, b"");
        buf.push(7);

        let (a, tail) = get_bytes(&buf).unwrap();
        assert_eq!(a, b"hello");
        let (b, tail) = get_bytes(tail).unwrap();
        assert!(b.is_empty());
        assert_eq!(tail, &[7]);
    }

    #[test]
    fn test_bytes_too_short() {
        let mut buf = Vec::new();
        put_uvarint(&mut buf, 10);
        buf.extend_from_slice(b"abc");
        assert!(get_bytes(&buf).is_err());
    }

    #[test]
    fn test_fixed_width_is_big_endian() {
        let mut buf = Vec::new();
        put_u32(&mut buf, 0x01020304);
        put_u64(&mut buf, 0x0102030405060708);
        assert_eq!(&buf[..4], &[1, 2, 3, 4]);

        let (a, tail) = get_u32(&buf).unwrap();
        let (b, tail) = get_u64(tail).unwrap();
        assert_eq!(a, 0x01020304);
        assert_eq!(b, 0x0102030405060708);
        assert!(tail.is_empty());
        assert!(get_u64(&buf[..5]).is_err());
    }

    #[test]
    fn test_uvarints() {
        let values = [3u64, 0, 1 << 40, 99];
        let mut buf = Vec::new();
        put_uvarints(&mut buf, &values);
        let mut out = [0u64; 4];
        let tail = get_uvarints(&mut out, &buf).unwrap();
        assert!(tail.is_empty());
        assert_eq!(out, values);

        let mut too_many = [0u64; 5];
        assert!(get_uvarints(&mut too_many, &buf).is_err());
    }

    #[test]
    fn test_common_prefix_len() {
        assert_eq!(common_prefix_len(b"abcd", b"abxy"), 2);
        assert_eq!(common_prefix_len(b"abc", b"abc"), 3);
        assert_eq!(common_prefix_len(b"", b"abc"), 0);
        assert_eq!(common_prefix_len(b"ab", b"abc"), 2);
    }
}
