//! Payload compression
//!
//! Zstd for bulk payloads, LZ4 for small latency-sensitive ones. The envelope
//! codec picks the algorithm per payload and records it on the wire.

use crate::StateError;

/// Compression algorithm selection
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "clap", derive(clap::ValueEnum))]
pub enum CompressionAlgorithm {
    /// Zstandard (better ratio, slightly slower)
    #[cfg_attr(feature = "clap", value(name = "zstd"))]
    Zstd,
    /// LZ4 (faster, lower ratio)
    #[cfg_attr(feature = "clap", value(name = "lz4"))]
    Lz4,
}

/// Compressor wrapper over the supported algorithms.
#[derive(Debug, Clone)]
pub struct Compressor {
    algorithm: CompressionAlgorithm,
    level: i32,
}

impl Compressor {
    pub fn new(algorithm: CompressionAlgorithm) -> Self {
        let level = match algorithm {
            CompressionAlgorithm::Zstd => zstd::DEFAULT_COMPRESSION_LEVEL,
            CompressionAlgorithm::Lz4 => 0,
        };
        Self { algorithm, level }
    }

    /// Override the compression level (zstd only).
    pub fn with_level(mut self, level: i32) -> Self {
        self.level = level;
        self
    }

    pub fn algorithm(&self) -> CompressionAlgorithm {
        self.algorithm
    }

    pub fn compress(&self, data: &[u8]) -> Result<Vec<u8>, StateError> {
        match self.algorithm {
            CompressionAlgorithm::Zstd => zstd::stream::encode_all(data, self.level)
                .map_err(|e| StateError::Compression(format!("zstd encode failed: {e}"))),
            CompressionAlgorithm::Lz4 => Ok(lz4_flex::compress_prepend_size(data)),
        }
    }

    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>, StateError> {
        match self.algorithm {
            CompressionAlgorithm::Zstd => zstd::stream::decode_all(data)
                .map_err(|e| StateError::Compression(format!("zstd decode failed: {e}"))),
            CompressionAlgorithm::Lz4 => lz4_flex::decompress_size_prepended(data)
                .map_err(|e| StateError::Compression(format!("lz4 decode failed: {e}"))),
        }
    }
}
