//! Best-effort payload compression.
//!
//! LZ4 output uses the block format with the uncompressed size prepended as a
//! 4-byte little-endian integer. Compression only sticks when it makes the
//! payload strictly smaller.

use crate::error::ProtocolError;
use crate::frame::CompressionMode;
use crate::pool::{BufferPool, PooledBuf};

/// Payloads below this size are sent uncompressed by default (1 KiB).
pub const DEFAULT_COMPRESSION_THRESHOLD: usize = 1024;

const SIZE_PREFIX: usize = 4;

/// Compresses `data` into a pooled buffer if `mode` is enabled, `data` is at
/// least `threshold` bytes, and the result is strictly smaller.
///
/// Returns `None` when the payload should be sent as-is. Pool pressure never
/// fails the caller; it only costs the compression.
pub fn maybe_compress(
    data: &[u8],
    mode: CompressionMode,
    threshold: usize,
    pool: &BufferPool,
) -> Option<PooledBuf> {
    if mode == CompressionMode::None || data.len() < threshold || data.len() <= SIZE_PREFIX {
        return None;
    }

    match mode {
        CompressionMode::None => None,
        CompressionMode::Lz4 => {
            // compress_into needs room for the worst case up front.
            let bound = SIZE_PREFIX + lz4_flex::block::get_maximum_output_size(data.len());
            if bound <= pool.config().max_buffer_len {
                lz4_into_pool(data, bound, pool)
            } else {
                lz4_via_heap(data, pool)
            }
        }
    }
}

fn lz4_into_pool(data: &[u8], bound: usize, pool: &BufferPool) -> Option<PooledBuf> {
    let mut out = match pool.rent(bound) {
        Ok(out) => out,
        Err(e) => {
            tracing::debug!("lz4 compression skipped: {}", e);
            return None;
        }
    };
    out[..SIZE_PREFIX].copy_from_slice(&(data.len() as u32).to_le_bytes());
    let written = match lz4_flex::block::compress_into(data, &mut out[SIZE_PREFIX..]) {
        Ok(n) => n,
        Err(e) => {
            tracing::debug!("lz4 compression skipped: {}", e);
            return None;
        }
    };

    let total = SIZE_PREFIX + written;
    if total >= data.len() {
        tracing::trace!(
            "compression not beneficial ({} -> {} bytes)",
            data.len(),
            total
        );
        return None;
    }
    out.truncate(total);
    Some(out)
}

/// Scratch for payloads whose worst case exceeds the pool's largest buffer.
/// Only the (smaller) result is rented.
fn lz4_via_heap(data: &[u8], pool: &BufferPool) -> Option<PooledBuf> {
    let block = lz4_flex::block::compress(data);
    let total = SIZE_PREFIX + block.len();
    if total >= data.len() {
        tracing::trace!(
            "compression not beneficial ({} -> {} bytes)",
            data.len(),
            total
        );
        return None;
    }

    let mut out = match pool.rent(total) {
        Ok(out) => out,
        Err(e) => {
            tracing::debug!("lz4 compression skipped: {}", e);
            return None;
        }
    };
    out[..SIZE_PREFIX].copy_from_slice(&(data.len() as u32).to_le_bytes());
    out[SIZE_PREFIX..].copy_from_slice(&block);
    Some(out)
}

/// Returns the uncompressed size declared by a compressed payload.
pub fn declared_len(mode: CompressionMode, data: &[u8]) -> Result<usize, ProtocolError> {
    match mode {
        CompressionMode::None => Ok(data.len()),
        CompressionMode::Lz4 => {
            if data.len() < SIZE_PREFIX {
                return Err(ProtocolError::DecompressionFailed);
            }
            Ok(u32::from_le_bytes([data[0], data[1], data[2], data[3]]) as usize)
        }
    }
}

/// Decompresses `data` into a pooled buffer, refusing output larger than
/// `max_len` and output whose size differs from the declared one.
pub fn decompress(
    mode: CompressionMode,
    data: &[u8],
    max_len: usize,
    pool: &BufferPool,
) -> Result<PooledBuf, ProtocolError> {
    let declared = declared_len(mode, data)?;
    if declared > max_len {
        return Err(ProtocolError::MessageTooLarge {
            size: declared,
            max: max_len,
        });
    }

    let mut out = pool.rent(declared)?;
    match mode {
        CompressionMode::None => out.copy_from_slice(data),
        CompressionMode::Lz4 => {
            let actual = lz4_flex::block::decompress_into(&data[SIZE_PREFIX..], &mut out)
                .map_err(|e| {
                    tracing::debug!("lz4 decompression failed: {}", e);
                    ProtocolError::DecompressionFailed
                })?;
            if actual != declared {
                return Err(ProtocolError::DecompressionLengthMismatch { declared, actual });
            }
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pool::PoolConfig;

    #[test]
    fn test_lz4_roundtrip() {
        let pool = BufferPool::default();
        let data = b"abcdefgh".repeat(512);

        let compressed = maybe_compress(&data, CompressionMode::Lz4, 64, &pool)
            .expect("repetitive data should compress");
        assert!(compressed.len() < data.len());
        assert_eq!(declared_len(CompressionMode::Lz4, &compressed).unwrap(), data.len());

        let restored = decompress(CompressionMode::Lz4, &compressed, 1 << 20, &pool).unwrap();
        assert_eq!(&restored[..], &data[..]);
    }

    #[test]
    fn test_below_threshold_not_compressed() {
        let pool = BufferPool::default();
        let data = vec![0u8; 100];
        assert!(maybe_compress(&data, CompressionMode::Lz4, 101, &pool).is_none());
        assert!(maybe_compress(&data, CompressionMode::None, 0, &pool).is_none());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_incompressible_data_left_alone() {
        let pool = BufferPool::default();
        let mut state = 0x1234_5678u32;
        let data: Vec<u8> = (0..2048)
            .map(|_| {
                state ^= state << 13;
                state ^= state >> 17;
                state ^= state << 5;
                state as u8
            })
            .collect();

        assert!(maybe_compress(&data, CompressionMode::Lz4, 0, &pool).is_none());
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_declared_size_limit() {
        let pool = BufferPool::default();
        let mut bogus = (1u32 << 30).to_le_bytes().to_vec();
        bogus.extend_from_slice(&[0x10, 0x41]);

        assert!(matches!(
            decompress(CompressionMode::Lz4, &bogus, 1 << 20, &pool),
            Err(ProtocolError::MessageTooLarge { .. })
        ));
    }

    #[test]
    fn test_declared_size_mismatch() {
        let pool = BufferPool::default();
        let data = b"abcdefgh".repeat(64);
        let mut compressed = maybe_compress(&data, CompressionMode::Lz4, 0, &pool)
            .unwrap()
            .into_vec();

        // Claim more bytes than the block expands to.
        compressed[..4].copy_from_slice(&((data.len() + 10) as u32).to_le_bytes());
        let err = decompress(CompressionMode::Lz4, &compressed, 1 << 20, &pool).unwrap_err();
        assert!(matches!(
            err,
            ProtocolError::DecompressionLengthMismatch { .. } | ProtocolError::DecompressionFailed
        ));
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_pool_limits_fall_back_to_plain() {
        let data = b"abcdefgh".repeat(512);

        // No buffers left: send uncompressed instead of failing.
        let pool = BufferPool::new(PoolConfig::default().with_max_outstanding(1));
        let held = pool.rent(8).unwrap();
        assert!(maybe_compress(&data, CompressionMode::Lz4, 0, &pool).is_none());
        drop(held);
        assert!(maybe_compress(&data, CompressionMode::Lz4, 0, &pool).is_some());
    }

    #[test]
    fn test_worst_case_above_pool_limit_still_compresses() {
        // The largest allowed payload: its lz4 worst case exceeds the pool cap.
        let pool = BufferPool::new(PoolConfig::default().with_max_buffer_len(4096));
        let data = vec![0x5Au8; 4096];

        let compressed = maybe_compress(&data, CompressionMode::Lz4, 0, &pool)
            .expect("repetitive data should compress");
        assert!(compressed.len() < data.len());
        let restored = decompress(CompressionMode::Lz4, &compressed, 4096, &pool).unwrap();
        assert_eq!(&restored[..], &data[..]);
        drop(compressed);
        drop(restored);
        assert_eq!(pool.stats().outstanding, 0);
    }

    #[test]
    fn test_short_input_rejected() {
        let pool = BufferPool::default();
        assert!(matches!(
            decompress(CompressionMode::Lz4, &[1, 2], 1024, &pool),
            Err(ProtocolError::DecompressionFailed)
        ));
    }
}
