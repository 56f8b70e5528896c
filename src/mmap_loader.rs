//! Memory-mapped weight file loader.

use crate::config::MmapStrategy;
use crate::error::{EngineError, Result};
use memmap2::{Mmap, MmapOptions};
use std::fs::File;
use tracing::{info, warn};

pub const MAGIC: u32 = 0x5147_5231; // "QOR1"
pub const HEADER_SIZE: usize = 64;

/// The fixed 64-byte header at the front of a `.qor` model file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelHeader {
    pub magic: u32,
    pub version: u32,
    pub vocab_size: u32,
    pub dim: u32,
    pub hidden_dim: u32,
    pub n_layers: u32,
    pub n_heads: u32,
    pub n_kv_heads: u32,
    pub max_seq_len: u32,
    pub rope_freq_base: f32,
}

impl ModelHeader {
    fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_SIZE {
            return Err(EngineError::FileTooSmall);
        }
        let read_u32 = |off: usize| -> u32 {
            u32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
        };
        let read_f32 = |off: usize| -> f32 {
            f32::from_le_bytes(bytes[off..off + 4].try_into().unwrap())
        };
        let header = ModelHeader {
            magic: read_u32(0),
            version: read_u32(4),
            vocab_size: read_u32(8),
            dim: read_u32(12),
            hidden_dim: read_u32(16),
            n_layers: read_u32(20),
            n_heads: read_u32(24),
            n_kv_heads: read_u32(28),
            max_seq_len: read_u32(32),
            rope_freq_base: read_f32(36),
        };
        if header.magic != MAGIC {
            return Err(EngineError::InvalidMagic);
        }
        Ok(header)
    }
}

/// The immutable, memory-mapped backing of a loaded model file.
pub struct MappedWeights {
    mmap: Mmap,
    header: ModelHeader,
}

impl MappedWeights {
    pub fn open(path: &str, strategy: MmapStrategy) -> Result<Self> {
        let file = File::open(path)?;
        let metadata = file.metadata().map_err(|_| EngineError::FileStat)?;
        if (metadata.len() as usize) < HEADER_SIZE {
            return Err(EngineError::FileTooSmall);
        }

        let mmap = unsafe {
            MmapOptions::new()
                .map(&file)
                .map_err(|e| EngineError::MmapFailed(e.to_string()))?
        };

        #[cfg(unix)]
        if let Err(e) = mmap.advise(memmap2::Advice::Sequential) {
            warn!(error = %e, "madvise(SEQUENTIAL) failed, continuing without the hint");
        }

        let header = ModelHeader::parse(&mmap)?;

        if strategy == MmapStrategy::Eager {
            let mut touched: u64 = 0;
            for chunk in mmap.chunks(4096) {
                touched = touched.wrapping_add(chunk[0] as u64);
            }
            info!(bytes = mmap.len(), checksum = touched, "prefaulted model pages eagerly");
        }

        info!(
            path,
            vocab_size = header.vocab_size,
            dim = header.dim,
            n_layers = header.n_layers,
            "mapped model weights"
        );

        Ok(Self { mmap, header })
    }

    pub fn header(&self) -> &ModelHeader {
        &self.header
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.mmap
    }

    pub fn len(&self) -> usize {
        self.mmap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mmap.is_empty()
    }

    /// Base address of the mapped region, used by the tensor view
    /// constructor to validate that a computed pointer lies within bounds.
    pub fn base_ptr(&self) -> *const u8 {
        self.mmap.as_ptr()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_header(buf: &mut Vec<u8>, h: &ModelHeader) {
        buf.extend_from_slice(&h.magic.to_le_bytes());
        buf.extend_from_slice(&h.version.to_le_bytes());
        buf.extend_from_slice(&h.vocab_size.to_le_bytes());
        buf.extend_from_slice(&h.dim.to_le_bytes());
        buf.extend_from_slice(&h.hidden_dim.to_le_bytes());
        buf.extend_from_slice(&h.n_layers.to_le_bytes());
        buf.extend_from_slice(&h.n_heads.to_le_bytes());
        buf.extend_from_slice(&h.n_kv_heads.to_le_bytes());
        buf.extend_from_slice(&h.max_seq_len.to_le_bytes());
        buf.extend_from_slice(&h.rope_freq_base.to_le_bytes());
        buf.resize(HEADER_SIZE, 0);
    }

    #[test]
    fn rejects_truncated_file() {
        let dir = std::env::temp_dir();
        let path = dir.join("qor_test_truncated.qor");
        std::fs::write(&path, [0u8; 10]).unwrap();
        let res = MappedWeights::open(path.to_str().unwrap(), MmapStrategy::Lazy);
        assert!(matches!(res, Err(EngineError::FileTooSmall)));
        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_bad_magic() {
        let dir = std::env::temp_dir();
        let path = dir.join("qor_test_badmagic.qor");
        let mut buf = Vec::new();
        write_header(
            &mut buf,
            &ModelHeader {
                magic: 0xDEAD_BEEF,
                version: 1,
                vocab_size: 128,
                dim: 64,
                hidden_dim: 128,
                n_layers: 1,
                n_heads: 2,
                n_kv_heads: 2,
                max_seq_len: 16,
                rope_freq_base: 10000.0,
            },
        );
        let mut f = File::create(&path).unwrap();
        f.write_all(&buf).unwrap();
        let res = MappedWeights::open(path.to_str().unwrap(), MmapStrategy::Lazy);
        assert!(matches!(res, Err(EngineError::InvalidMagic)));
        let _ = std::fs::remove_file(&path);
    }
}
