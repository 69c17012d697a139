//! Compression algorithms for stored message blobs
//!
//! Each algorithm maps to a one-byte marker in the stored-blob framing.
//! Markers are part of the storage format and must never be renumbered.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzipLevel;
use serde::Deserialize;
use std::fmt;
use std::io::{Read, Write};

/// Zstd compression level used for stored blobs.
const ZSTD_LEVEL: i32 = 3;

/// Compression applied to a stored message payload.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompressionAlgorithm {
    /// Store the payload as-is
    None,
    /// Gzip (flate2), best ratio, slowest
    Gzip,
    /// LZ4 block format, fastest
    Lz4,
    /// Snappy raw format, balanced
    #[default]
    Snappy,
    /// Zstandard, good ratio at moderate cost
    Zstd,
}

impl CompressionAlgorithm {
    /// Wire marker stored in the blob header.
    pub const fn marker(&self) -> u8 {
        match self {
            Self::None => 0,
            Self::Gzip => 1,
            Self::Lz4 => 2,
            Self::Snappy => 3,
            Self::Zstd => 4,
        }
    }

    /// Resolve a wire marker back to an algorithm.
    pub fn from_marker(marker: u8) -> Option<Self> {
        match marker {
            0 => Some(Self::None),
            1 => Some(Self::Gzip),
            2 => Some(Self::Lz4),
            3 => Some(Self::Snappy),
            4 => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Parse from a configuration string.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "none" | "off" => Some(Self::None),
            "gzip" | "gz" => Some(Self::Gzip),
            "lz4" => Some(Self::Lz4),
            "snappy" => Some(Self::Snappy),
            "zstd" | "zstandard" => Some(Self::Zstd),
            _ => None,
        }
    }

    /// Stable label for metrics and logs.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::None => "none",
            Self::Gzip => "gzip",
            Self::Lz4 => "lz4",
            Self::Snappy => "snappy",
            Self::Zstd => "zstd",
        }
    }
}

impl fmt::Display for CompressionAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Compress a payload with the given algorithm.
pub(crate) fn compress(
    algorithm: CompressionAlgorithm,
    data: &[u8],
) -> std::result::Result<Vec<u8>, String> {
    match algorithm {
        CompressionAlgorithm::None => Ok(data.to_vec()),
        CompressionAlgorithm::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), GzipLevel::default());
            encoder
                .write_all(data)
                .map_err(|e| format!("gzip write failed: {}", e))?;
            encoder
                .finish()
                .map_err(|e| format!("gzip finish failed: {}", e))
        }
        CompressionAlgorithm::Lz4 => Ok(lz4_flex::block::compress(data)),
        CompressionAlgorithm::Snappy => snap::raw::Encoder::new()
            .compress_vec(data)
            .map_err(|e| format!("snappy compression failed: {}", e)),
        CompressionAlgorithm::Zstd => {
            zstd::bulk::compress(data, ZSTD_LEVEL).map_err(|e| format!("zstd compression failed: {}", e))
        }
    }
}

/// Decompress a payload, verifying it matches the expected length from the
/// blob header.
pub(crate) fn decompress(
    algorithm: CompressionAlgorithm,
    data: &[u8],
    uncompressed_len: usize,
) -> std::result::Result<Vec<u8>, String> {
    let out = match algorithm {
        CompressionAlgorithm::None => data.to_vec(),
        CompressionAlgorithm::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::with_capacity(uncompressed_len);
            decoder
                .read_to_end(&mut out)
                .map_err(|e| format!("gzip decompression failed: {}", e))?;
            out
        }
        CompressionAlgorithm::Lz4 => lz4_flex::block::decompress(data, uncompressed_len)
            .map_err(|e| format!("lz4 decompression failed: {}", e))?,
        CompressionAlgorithm::Snappy => snap::raw::Decoder::new()
            .decompress_vec(data)
            .map_err(|e| format!("snappy decompression failed: {}", e))?,
        CompressionAlgorithm::Zstd => zstd::bulk::decompress(data, uncompressed_len)
            .map_err(|e| format!("zstd decompression failed: {}", e))?,
    };

    if out.len() != uncompressed_len {
        return Err(format!(
            "decompressed length {} does not match header length {}",
            out.len(),
            uncompressed_len
        ));
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_payload() -> Vec<u8> {
        // Repetitive JSON compresses well under every algorithm
        let mut data = Vec::new();
        for i in 0..64 {
            data.extend_from_slice(format!("{{\"seq\":{},\"status\":\"pending\"}}", i).as_bytes());
        }
        data
    }

    #[test]
    fn test_round_trip_all_algorithms() {
        let data = sample_payload();
        for algorithm in [
            CompressionAlgorithm::None,
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Snappy,
            CompressionAlgorithm::Zstd,
        ] {
            let compressed = compress(algorithm, &data).unwrap();
            let restored = decompress(algorithm, &compressed, data.len()).unwrap();
            assert_eq!(restored, data, "round trip failed for {}", algorithm);
        }
    }

    #[test]
    fn test_compression_shrinks_repetitive_data() {
        let data = sample_payload();
        for algorithm in [
            CompressionAlgorithm::Gzip,
            CompressionAlgorithm::Lz4,
            CompressionAlgorithm::Snappy,
            CompressionAlgorithm::Zstd,
        ] {
            let compressed = compress(algorithm, &data).unwrap();
            assert!(
                compressed.len() < data.len(),
                "{} did not shrink {} bytes",
                algorithm,
                data.len()
            );
        }
    }

    #[test]
    fn test_length_mismatch_rejected() {
        let data = sample_payload();
        let compressed = compress(CompressionAlgorithm::Snappy, &data).unwrap();
        let err = decompress(CompressionAlgorithm::Snappy, &compressed, data.len() + 1);
        assert!(err.is_err());
    }

    #[test]
    fn test_corrupt_input_rejected() {
        let garbage = [0xFFu8; 32];
        assert!(decompress(CompressionAlgorithm::Gzip, &garbage, 100).is_err());
        assert!(decompress(CompressionAlgorithm::Snappy, &garbage, 100).is_err());
        assert!(decompress(CompressionAlgorithm::Zstd, &garbage, 100).is_err());
    }

    #[test]
    fn test_markers_are_stable() {
        assert_eq!(CompressionAlgorithm::None.marker(), 0);
        assert_eq!(CompressionAlgorithm::Gzip.marker(), 1);
        assert_eq!(CompressionAlgorithm::Lz4.marker(), 2);
        assert_eq!(CompressionAlgorithm::Snappy.marker(), 3);
        assert_eq!(CompressionAlgorithm::Zstd.marker(), 4);

        for marker in 0..=4u8 {
            let algorithm = CompressionAlgorithm::from_marker(marker).unwrap();
            assert_eq!(algorithm.marker(), marker);
        }
        assert!(CompressionAlgorithm::from_marker(5).is_none());
    }

    #[test]
    fn test_parse() {
        assert_eq!(
            CompressionAlgorithm::parse("snappy"),
            Some(CompressionAlgorithm::Snappy)
        );
        assert_eq!(
            CompressionAlgorithm::parse("GZIP"),
            Some(CompressionAlgorithm::Gzip)
        );
        assert_eq!(
            CompressionAlgorithm::parse("zstandard"),
            Some(CompressionAlgorithm::Zstd)
        );
        assert_eq!(
            CompressionAlgorithm::parse("off"),
            Some(CompressionAlgorithm::None)
        );
        assert_eq!(CompressionAlgorithm::parse("brotli"), None);
    }
}
