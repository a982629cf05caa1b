//! Compression pools for wire payloads.
//!
//! This module provides the [`CompressionPool`] trait for per-message
//! compression and the two built-in implementations:
//! - [`IdentityPool`]: No compression (passthrough)
//! - [`GzipPool`]: Gzip compression via flate2
//!
//! Pools are looked up by name: the name corresponds to the value used in
//! `content-encoding`-style headers.

use std::io;
use std::io::{Read, Write};
use std::sync::Arc;

use bytes::Bytes;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression as GzipLevel;

/// Conforming types compress and decompress payloads using a specific
/// algorithm.
///
/// A pool is identified by a lowercase wire name. The client advertises the
/// names of all registered pools and uses the pool whose name matches the
/// encoding named in response metadata to decompress inbound payloads.
pub trait CompressionPool: Send + Sync + 'static {
    /// The encoding name used in headers (e.g., "gzip").
    fn name(&self) -> &'static str;

    /// Compress an outbound payload.
    fn compress(&self, data: &[u8]) -> io::Result<Bytes>;

    /// Decompress an inbound payload.
    fn decompress(&self, data: &[u8]) -> io::Result<Bytes>;
}

/// A reference-counted pool for type-erased storage.
#[derive(Clone)]
pub struct BoxedPool(Arc<dyn CompressionPool>);

impl BoxedPool {
    /// Create a new boxed pool.
    pub fn new<P: CompressionPool>(pool: P) -> Self {
        BoxedPool(Arc::new(pool))
    }

    /// Get the encoding name for headers.
    pub fn name(&self) -> &'static str {
        self.0.name()
    }

    /// Compress an outbound payload.
    pub fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        self.0.compress(data)
    }

    /// Decompress an inbound payload.
    pub fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        self.0.decompress(data)
    }
}

impl std::fmt::Debug for BoxedPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_tuple("BoxedPool").field(&self.name()).finish()
    }
}

/// Identity pool (no compression).
///
/// Passes data through unchanged.
#[derive(Debug, Clone, Copy, Default)]
pub struct IdentityPool;

impl CompressionPool for IdentityPool {
    fn name(&self) -> &'static str {
        "identity"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        Ok(Bytes::copy_from_slice(data))
    }
}

/// Gzip pool using flate2.
#[derive(Debug, Clone, Copy)]
pub struct GzipPool {
    /// Compression level (0-9). Default is 6.
    pub level: u32,
}

impl Default for GzipPool {
    fn default() -> Self {
        Self { level: 6 }
    }
}

impl GzipPool {
    /// Create a new GzipPool with the specified compression level.
    ///
    /// Level ranges from 0 (no compression) to 9 (best compression).
    pub fn with_level(level: u32) -> Self {
        Self {
            level: level.min(9),
        }
    }
}

impl CompressionPool for GzipPool {
    fn name(&self) -> &'static str {
        "gzip"
    }

    fn compress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut encoder = GzEncoder::new(Vec::new(), GzipLevel::new(self.level));
        encoder.write_all(data)?;
        Ok(Bytes::from(encoder.finish()?))
    }

    fn decompress(&self, data: &[u8]) -> io::Result<Bytes> {
        let mut decoder = GzDecoder::new(data);
        let mut decompressed = Vec::new();
        decoder.read_to_end(&mut decompressed)?;
        Ok(Bytes::from(decompressed))
    }
}
