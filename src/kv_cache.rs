//! Long-lived per-layer key/value cache.
//!
//! One contiguous `f32` buffer indexed `[layer, kv, position, head,
//! channel]` (§3). Append-only: the forward executor writes position `p`
//! exactly once per layer and never evicts. `channel` is the innermost
//! axis, so a (layer, kv, position, head) row is always a contiguous
//! `head_dim`-length slice — the accessors below hand out exactly that
//! slice rather than a strided view.

use crate::error::{EngineError, Result};
use crate::graph::ModelConfig;
use tracing::info;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Kv {
    Key = 0,
    Value = 1,
}

pub struct KvCache {
    buffer: Vec<f32>,
    n_layers: u32,
    n_kv_heads: u32,
    head_dim: u32,
    max_seq_len: u32,
}

impl KvCache {
    /// Allocate a zero-initialized cache sized for `config`.
    pub fn new(config: &ModelConfig) -> Self {
        let elems = (config.n_layers as usize)
            * 2
            * (config.max_seq_len as usize)
            * (config.n_kv_heads as usize)
            * (config.head_dim as usize);
        info!(
            n_layers = config.n_layers,
            max_seq_len = config.max_seq_len,
            n_kv_heads = config.n_kv_heads,
            head_dim = config.head_dim,
            bytes = elems * 4,
            "allocated kv cache"
        );
        Self {
            buffer: vec![0.0f32; elems],
            n_layers: config.n_layers,
            n_kv_heads: config.n_kv_heads,
            head_dim: config.head_dim,
            max_seq_len: config.max_seq_len,
        }
    }

    #[inline]
    fn row_start(&self, layer: u32, kv: Kv, position: u32, head: u32) -> Result<usize> {
        if layer >= self.n_layers {
            return Err(EngineError::InvalidArg("kv cache: layer out of range".to_string()));
        }
        if position >= self.max_seq_len {
            return Err(EngineError::InvalidArg("kv cache: position out of range".to_string()));
        }
        if head >= self.n_kv_heads {
            return Err(EngineError::InvalidArg("kv cache: head out of range".to_string()));
        }
        let layer = layer as usize;
        let kv = kv as usize;
        let position = position as usize;
        let head = head as usize;
        let head_dim = self.head_dim as usize;
        let n_kv_heads = self.n_kv_heads as usize;
        let max_seq_len = self.max_seq_len as usize;

        let idx = (((layer * 2 + kv) * max_seq_len + position) * n_kv_heads + head) * head_dim;
        Ok(idx)
    }

    /// Write one (layer, position, kv_head)'s key or value row. `values`
    /// must be exactly `head_dim` long.
    pub fn write_row(&mut self, layer: u32, kv: Kv, position: u32, head: u32, values: &[f32]) -> Result<()> {
        let head_dim = self.head_dim as usize;
        if values.len() != head_dim {
            return Err(EngineError::InvalidSize(
                "kv cache: row write length must equal head_dim".to_string(),
            ));
        }
        let start = self.row_start(layer, kv, position, head)?;
        self.buffer[start..start + head_dim].copy_from_slice(values);
        Ok(())
    }

    /// Borrow one (layer, position, kv_head)'s key or value row.
    pub fn row(&self, layer: u32, kv: Kv, position: u32, head: u32) -> Result<&[f32]> {
        let head_dim = self.head_dim as usize;
        let start = self.row_start(layer, kv, position, head)?;
        Ok(&self.buffer[start..start + head_dim])
    }

    pub fn head_dim(&self) -> u32 {
        self.head_dim
    }

    pub fn max_seq_len(&self) -> u32 {
        self.max_seq_len
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> ModelConfig {
        ModelConfig {
            vocab_size: 128,
            dim: 64,
            hidden_dim: 128,
            n_layers: 2,
            n_heads: 4,
            n_kv_heads: 2,
            max_seq_len: 16,
            rope_freq_base: 10000.0,
            head_dim: 16,
            kv_dim: 32,
        }
    }

    #[test]
    fn write_then_read_is_visible() {
        let config = test_config();
        let mut cache = KvCache::new(&config);
        let values: Vec<f32> = (0..16).map(|i| i as f32).collect();
        cache.write_row(0, Kv::Key, 3, 1, &values).unwrap();
        let read = cache.row(0, Kv::Key, 3, 1).unwrap();
        assert_eq!(read, values.as_slice());
    }

    #[test]
    fn writes_to_distinct_slots_do_not_alias() {
        let config = test_config();
        let mut cache = KvCache::new(&config);
        cache.write_row(0, Kv::Key, 0, 0, &[1.0; 16]).unwrap();
        cache.write_row(0, Kv::Value, 0, 0, &[2.0; 16]).unwrap();
        cache.write_row(1, Kv::Key, 0, 0, &[3.0; 16]).unwrap();
        assert_eq!(cache.row(0, Kv::Key, 0, 0).unwrap(), &[1.0; 16]);
        assert_eq!(cache.row(0, Kv::Value, 0, 0).unwrap(), &[2.0; 16]);
        assert_eq!(cache.row(1, Kv::Key, 0, 0).unwrap(), &[3.0; 16]);
    }

    #[test]
    fn out_of_range_position_is_rejected() {
        let config = test_config();
        let mut cache = KvCache::new(&config);
        assert!(cache.write_row(0, Kv::Key, 99, 0, &[0.0; 16]).is_err());
    }
}
