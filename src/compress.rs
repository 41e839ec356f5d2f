//! Payload compressors keyed by the wire compress tag.

use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::Arc;

use flate2::Compression;
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;

use crate::protocol::{CompressType, ProtocolError};

/// A payload (de)compressor.
pub trait Compressor: Send + Sync {
    /// Compress a payload.
    fn zip(&self, data: &[u8]) -> std::io::Result<Vec<u8>>;
    /// Decompress a payload.
    fn unzip(&self, data: &[u8]) -> std::io::Result<Vec<u8>>;
}

/// Gzip compressor backed by flate2.
#[derive(Debug, Default)]
pub struct GzipCompressor;

impl Compressor for GzipCompressor {
    fn zip(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(data)?;
        encoder.finish()
    }

    fn unzip(&self, data: &[u8]) -> std::io::Result<Vec<u8>> {
        let mut out = Vec::with_capacity(data.len() * 2);
        GzDecoder::new(data).read_to_end(&mut out)?;
        Ok(out)
    }
}

/// Compress-tag to compressor table, constructor-injected into clients.
///
/// The `None` tag is implicit and always passes bytes through.
#[derive(Clone)]
pub struct CompressorRegistry {
    compressors: HashMap<CompressType, Arc<dyn Compressor>>,
}

impl CompressorRegistry {
    /// Registry with the stock gzip compressor.
    #[must_use]
    pub fn new() -> Self {
        let mut compressors: HashMap<CompressType, Arc<dyn Compressor>> = HashMap::new();
        compressors.insert(CompressType::Gzip, Arc::new(GzipCompressor));
        Self { compressors }
    }

    /// Register or replace the compressor for a tag.
    pub fn register(&mut self, ct: CompressType, compressor: Arc<dyn Compressor>) {
        self.compressors.insert(ct, compressor);
    }

    /// Compress `data` with the algorithm registered for `ct`.
    pub fn zip(&self, ct: CompressType, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match ct {
            CompressType::None => Ok(data.to_vec()),
            _ => {
                let compressor = self.compressors.get(&ct).ok_or(
                    ProtocolError::UnsupportedCompressor { tag: ct.as_u8() },
                )?;
                Ok(compressor.zip(data)?)
            }
        }
    }

    /// Decompress payload bytes declared by the header tag `ct`.
    pub fn unzip(&self, ct: CompressType, data: &[u8]) -> Result<Vec<u8>, ProtocolError> {
        match ct {
            CompressType::None => Ok(data.to_vec()),
            _ => {
                let compressor = self.compressors.get(&ct).ok_or(
                    ProtocolError::UnsupportedCompressor { tag: ct.as_u8() },
                )?;
                Ok(compressor.unzip(data)?)
            }
        }
    }
}

impl Default for CompressorRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for CompressorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressorRegistry")
            .field("tags", &self.compressors.keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_roundtrip() {
        let registry = CompressorRegistry::new();
        let data = b"the quick brown fox jumps over the lazy dog".repeat(64);

        let zipped = registry.zip(CompressType::Gzip, &data).unwrap();
        assert!(zipped.len() < data.len());
        let unzipped = registry.unzip(CompressType::Gzip, &zipped).unwrap();
        assert_eq!(unzipped, data);
    }

    #[test]
    fn test_none_passes_through() {
        let registry = CompressorRegistry::new();
        let data = b"plain".to_vec();
        assert_eq!(registry.zip(CompressType::None, &data).unwrap(), data);
        assert_eq!(registry.unzip(CompressType::None, &data).unwrap(), data);
    }

    #[test]
    fn test_corrupt_gzip_fails() {
        let registry = CompressorRegistry::new();
        assert!(registry.unzip(CompressType::Gzip, b"not gzip").is_err());
    }
}
