//! Graph builder: walks the mmapped weight region in the fixed on-disk
//! order and produces a [`TensorView`] for every weight of every layer.
//!
//! The builder never leaves a partially constructed graph visible to the
//! caller: any validation failure aborts the walk and returns an error
//! before [`Model`] is handed back.

use crate::arena::align_up;
use crate::error::{EngineError, Result};
use crate::mmap_loader::{MappedWeights, ModelHeader, HEADER_SIZE};
use crate::tensor::{calculate_f32_size, calculate_q4_0_size, create_tensor_view, DType, TensorView};
use tracing::info;

/// Model configuration derived from the header, with the derived
/// quantities (`head_dim`, `kv_dim`) the rest of the engine needs.
#[derive(Debug, Clone, Copy)]
pub struct ModelConfig {
    pub vocab_size: u32,
    pub dim: u32,
    pub hidden_dim: u32,
    pub n_layers: u32,
    pub n_heads: u32,
    pub n_kv_heads: u32,
    pub max_seq_len: u32,
    pub rope_freq_base: f32,
    pub head_dim: u32,
    pub kv_dim: u32,
}

impl ModelConfig {
    fn from_header(header: &ModelHeader) -> Result<Self> {
        if header.dim == 0 || header.hidden_dim == 0 || header.vocab_size == 0 {
            return Err(EngineError::InvalidConfig("dim/hidden_dim/vocab_size must be nonzero".to_string()));
        }
        if header.dim % 32 != 0 {
            return Err(EngineError::InvalidConfig("dim must be a multiple of 32".to_string()));
        }
        if header.hidden_dim % 32 != 0 {
            return Err(EngineError::InvalidConfig("hidden_dim must be a multiple of 32".to_string()));
        }
        if header.n_heads == 0 {
            return Err(EngineError::InvalidConfig("n_heads must be nonzero".to_string()));
        }
        if header.dim % header.n_heads != 0 {
            return Err(EngineError::InvalidConfig("dim must be divisible by n_heads".to_string()));
        }
        if header.n_kv_heads == 0 {
            return Err(EngineError::InvalidConfig("n_kv_heads must be nonzero".to_string()));
        }
        if header.n_heads % header.n_kv_heads != 0 {
            return Err(EngineError::InvalidConfig(
                "n_kv_heads must divide n_heads for grouped-query attention".to_string(),
            ));
        }
        if header.n_layers == 0 {
            return Err(EngineError::InvalidConfig("n_layers must be nonzero".to_string()));
        }
        if header.max_seq_len == 0 {
            return Err(EngineError::InvalidConfig("max_seq_len must be nonzero".to_string()));
        }

        let head_dim = header.dim / header.n_heads;
        let kv_dim = header.n_kv_heads * head_dim;
        Ok(Self {
            vocab_size: header.vocab_size,
            dim: header.dim,
            hidden_dim: header.hidden_dim,
            n_layers: header.n_layers,
            n_heads: header.n_heads,
            n_kv_heads: header.n_kv_heads,
            max_seq_len: header.max_seq_len,
            rope_freq_base: header.rope_freq_base,
            head_dim,
            kv_dim,
        })
    }
}

/// Every weight of one transformer block.
pub struct LayerWeights<'a> {
    pub attn_norm: TensorView<'a>,
    pub wq: TensorView<'a>,
    pub wk: TensorView<'a>,
    pub wv: TensorView<'a>,
    pub wo: TensorView<'a>,
    pub ffn_norm: TensorView<'a>,
    pub w_gate: TensorView<'a>,
    pub w_up: TensorView<'a>,
    pub w_down: TensorView<'a>,
}

/// The fully built weight graph: every tensor view borrows the mmapped
/// region backing `weights`.
pub struct Model<'a> {
    pub config: ModelConfig,
    pub token_embd: TensorView<'a>,
    pub output_norm: TensorView<'a>,
    pub output: TensorView<'a>,
    pub layers: Vec<LayerWeights<'a>>,
}

/// Cursor walking the mmap region in the fixed §4.F order, placing one
/// tensor view per call and padding each payload to a 64-byte boundary.
struct Cursor<'a> {
    base: *const u8,
    len: usize,
    offset: usize,
    _marker: std::marker::PhantomData<&'a u8>,
}

impl<'a> Cursor<'a> {
    fn place(&mut self, dtype: DType, ne: [u32; 4], name: &'static str) -> Result<TensorView<'a>> {
        let size = match dtype {
            DType::F32 => calculate_f32_size(ne)?,
            DType::Q4_0 => calculate_q4_0_size(ne)?,
        } as usize;

        if self.offset.checked_add(size).ok_or(EngineError::Overflow)? > self.len {
            return Err(EngineError::InvalidConfig(format!(
                "tensor '{name}' extends past end of model file"
            )));
        }

        let ptr = unsafe { self.base.add(self.offset) };
        let view = unsafe { create_tensor_view(ptr, self.base, self.len, dtype, ne, name)? };

        self.offset = self
            .offset
            .checked_add(align_up(size))
            .ok_or(EngineError::Overflow)?;
        Ok(view)
    }
}

/// Walk `weights` in the canonical on-disk order and build a view for
/// every tensor of every layer. Returns an error (and no partial graph)
/// on the first inconsistency between the header's declared shapes and
/// the file's actual size.
pub fn build_graph(weights: &MappedWeights) -> Result<Model<'_>> {
    let header = weights.header();
    let config = ModelConfig::from_header(header)?;

    let mut cursor = Cursor {
        base: weights.base_ptr(),
        len: weights.len(),
        offset: HEADER_SIZE,
        _marker: std::marker::PhantomData,
    };

    let token_embd = cursor.place(DType::F32, [config.vocab_size, config.dim, 1, 1], "token_embd.weight")?;
    let output_norm = cursor.place(DType::F32, [config.dim, 1, 1, 1], "output_norm.weight")?;
    let output = cursor.place(DType::F32, [config.vocab_size, config.dim, 1, 1], "output.weight")?;

    let mut layers = Vec::with_capacity(config.n_layers as usize);
    for _ in 0..config.n_layers {
        // GEMV computes `out[M] = W[M,N] . x[N]`, i.e. ne[0] is the
        // *output* width and ne[1] the *input* width. Only wq/wo are
        // square; every projection that changes width must declare its
        // output dimension first.
        let attn_norm = cursor.place(DType::F32, [config.dim, 1, 1, 1], "attn_norm.weight")?;
        let wq = cursor.place(DType::Q4_0, [config.dim, config.dim, 1, 1], "wq.weight")?;
        let wk = cursor.place(DType::Q4_0, [config.kv_dim, config.dim, 1, 1], "wk.weight")?;
        let wv = cursor.place(DType::Q4_0, [config.kv_dim, config.dim, 1, 1], "wv.weight")?;
        let wo = cursor.place(DType::Q4_0, [config.dim, config.dim, 1, 1], "wo.weight")?;
        let ffn_norm = cursor.place(DType::F32, [config.dim, 1, 1, 1], "ffn_norm.weight")?;
        let w_gate = cursor.place(DType::Q4_0, [config.hidden_dim, config.dim, 1, 1], "w_gate.weight")?;
        let w_up = cursor.place(DType::Q4_0, [config.hidden_dim, config.dim, 1, 1], "w_up.weight")?;
        let w_down = cursor.place(DType::Q4_0, [config.dim, config.hidden_dim, 1, 1], "w_down.weight")?;

        layers.push(LayerWeights {
            attn_norm,
            wq,
            wk,
            wv,
            wo,
            ffn_norm,
            w_gate,
            w_up,
            w_down,
        });
    }

    info!(
        n_layers = config.n_layers,
        dim = config.dim,
        hidden_dim = config.hidden_dim,
        vocab_size = config.vocab_size,
        bytes_consumed = cursor.offset,
        "built model graph"
    );

    Ok(Model {
        config,
        token_embd,
        output_norm,
        output,
        layers,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MmapStrategy;
    use crate::tensor::Q4_0_BLOCK_BYTES;
    use std::io::Write;

    fn q4_0_row_bytes(cols: u32) -> usize {
        (cols as usize / 32) * Q4_0_BLOCK_BYTES
    }

    /// Build a minimal, valid synthetic `.qor` file in a temp path and
    /// return its path, matching the S6 forward-smoke configuration.
    fn write_synthetic_model(path: &std::path::Path, dim: u32, hidden_dim: u32, vocab: u32, n_layers: u32) {
        let n_heads = 4u32;
        let n_kv_heads = 2u32;
        let kv_dim = n_kv_heads * (dim / n_heads);

        let mut buf = Vec::new();
        buf.extend_from_slice(&0x5147_5231u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&vocab.to_le_bytes());
        buf.extend_from_slice(&dim.to_le_bytes());
        buf.extend_from_slice(&hidden_dim.to_le_bytes());
        buf.extend_from_slice(&n_layers.to_le_bytes());
        buf.extend_from_slice(&n_heads.to_le_bytes());
        buf.extend_from_slice(&n_kv_heads.to_le_bytes());
        buf.extend_from_slice(&16u32.to_le_bytes());
        buf.extend_from_slice(&10000.0f32.to_le_bytes());
        buf.resize(HEADER_SIZE, 0);

        let pad = |buf: &mut Vec<u8>| {
            let rem = buf.len() % 64;
            if rem != 0 {
                buf.resize(buf.len() + (64 - rem), 0);
            }
        };

        let mut push_f32 = |buf: &mut Vec<u8>, count: usize| {
            buf.resize(buf.len() + count * 4, 0);
            pad(buf);
        };
        let mut push_q4_0 = |buf: &mut Vec<u8>, rows: u32, cols: u32| {
            buf.resize(buf.len() + rows as usize * q4_0_row_bytes(cols), 0);
            pad(buf);
        };

        push_f32(&mut buf, (vocab * dim) as usize);
        push_f32(&mut buf, dim as usize);
        push_f32(&mut buf, (vocab * dim) as usize);

        for _ in 0..n_layers {
            push_f32(&mut buf, dim as usize);
            push_q4_0(&mut buf, dim, dim);
            push_q4_0(&mut buf, dim, kv_dim);
            push_q4_0(&mut buf, dim, kv_dim);
            push_q4_0(&mut buf, dim, dim);
            push_f32(&mut buf, dim as usize);
            push_q4_0(&mut buf, dim, hidden_dim);
            push_q4_0(&mut buf, dim, hidden_dim);
            push_q4_0(&mut buf, hidden_dim, dim);
        }

        std::fs::write(path, &buf).unwrap();
    }

    #[test]
    fn builds_layers_matching_header_config() {
        let dir = std::env::temp_dir();
        let path = dir.join("qor_test_graph.qor");
        write_synthetic_model(&path, 64, 128, 128, 2);

        let weights = MappedWeights::open(path.to_str().unwrap(), MmapStrategy::Lazy).unwrap();
        let model = build_graph(&weights).unwrap();

        assert_eq!(model.config.n_layers, 2);
        assert_eq!(model.layers.len(), 2);
        assert_eq!(model.config.head_dim, 16);
        assert_eq!(model.config.kv_dim, 32);
        assert_eq!(model.token_embd.rows(), 128);
        assert_eq!(model.layers[0].wq.rows(), 64);

        let _ = std::fs::remove_file(&path);
    }

    #[test]
    fn rejects_truncated_weight_region() {
        let dir = std::env::temp_dir();
        let path = dir.join("qor_test_graph_truncated.qor");
        write_synthetic_model(&path, 64, 128, 128, 2);
        let full = std::fs::read(&path).unwrap();
        std::fs::write(&path, &full[..full.len() - 256]).unwrap();

        let weights = MappedWeights::open(path.to_str().unwrap(), MmapStrategy::Lazy).unwrap();
        assert!(build_graph(&weights).is_err());

        let _ = std::fs::remove_file(&path);
    }
}
