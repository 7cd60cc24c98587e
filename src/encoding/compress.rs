//! Codec-agnostic compression of part regions.

use crate::config::CompressionType;
use crate::error::{Error, Result};

/// Compresses `data` with the given codec.
///
/// `level` is only meaningful for zstd; negative levels trade ratio for speed.
pub fn compress(codec: CompressionType, level: i32, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| Error::compression(format!("snappy compression failed: {}", e))),
        CompressionType::Zstd => zstd::encode_all(data, level)
            .map_err(|e| Error::compression(format!("zstd compression failed: {}", e))),
    }
}

/// Decompresses `data` previously produced by [`compress`] with the same codec.
pub fn decompress(codec: CompressionType, data: &[u8]) -> Result<Vec<u8>> {
    match codec {
        CompressionType::None => Ok(data.to_vec()),
        #[cfg(feature = "snappy")]
        CompressionType::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| Error::compression(format!("snappy decompression failed: {}", e))),
        CompressionType::Zstd => zstd::decode_all(data)
            .map_err(|e| Error::compression(format!("zstd decompression failed: {}", e))),
    }
}

/// Picks the zstd level for a merge output holding `items` items.
///
/// Small outputs are short-lived and get merged again soon, so they use cheap
/// levels. Large outputs live long and are worth the extra CPU.
pub fn compress_level_for_items(items: u64) -> i32 {
    match items {
        n if n <= 1 << 16 => -5,
        n if n <= 1 << 17 => -4,
        n if n <= 1 << 18 => -3,
        n if n <= 1 << 19 => -2,
        n if n <= 1 << 20 => -1,
        n if n <= 1 << 22 => 1,
        n if n <= 1 << 25 => 2,
        _ => 3,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Vec<u8> {
        (0..4096u32).flat_map(|i| format!("item-{:06}", i % 97).into_bytes()).collect()
    }

    #[test]
    fn test_zstd_levels() {
        let data = sample();
        for level in [-5, -1, 1, 3] {
            let packed = compress(CompressionType::Zstd, level, &data).unwrap();
            assert!(packed.len() < data.len());
            assert_eq!(decompress(CompressionType::Zstd, &packed).unwrap(), data);
        }
    }

    #[test]
    fn test_zstd_empty() {
        let packed = compress(CompressionType::Zstd, 1, &[]).unwrap();
        assert!(decompress(CompressionType::Zstd, &packed).unwrap().is_empty());
    }

    #[cfg(feature = "snappy")]
    #[test]
    fn test_snappy() {
        let data = sample();
        let packed = compress(CompressionType::Snappy, 0, &data).unwrap();
        assert_eq!(decompress(CompressionType::Snappy, &packed).unwrap(), data);
    }

    #[test]
    fn test_none_is_identity() {
        let data = sample();
        assert_eq!(compress(CompressionType::None, 0, &data).unwrap(), data);
    }

    #[test]
    fn test_garbage_input() {
        assert!(decompress(CompressionType::Zstd, b"definitely not zstd").is_err());
    }

    #[test]
    fn test_compress_level_for_items() {
        assert_eq!(compress_level_for_items(0), -5);
        assert_eq!(compress_level_for_items(1 << 16), -5);
        assert_eq!(compress_level_for_items((1 << 16) + 1), -4);
        assert_eq!(compress_level_for_items(1 << 20), -1);
        assert_eq!(compress_level_for_items(1 << 21), 1);
        assert_eq!(compress_level_for_items(1 << 25), 2);
        assert_eq!(compress_level_for_items(u64::MAX), 3);
    }
}
