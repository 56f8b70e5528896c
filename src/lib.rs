//! qor-engine: a CPU inference runtime for Llama-3-family decoder-only
//! transformers, evaluated over memory-mapped Q4_0/F32 weights with
//! hand-tuned SIMD kernels and a persistent key/value cache.
//!
//! The crate is organized bottom-up, matching how a forward pass
//! actually consumes these pieces:
//!
//! - [`arena`] — the 64-byte aligned bump allocator backing every
//!   per-call scratch buffer.
//! - [`mmap_loader`] — opens and validates the `.qor` weight file.
//! - [`tensor`] — zero-copy strided views into that mmapped region.
//! - [`quant`] — Q4_0 block dequantization, scalar and AVX2.
//! - [`kernels`] — GEMV/GEMM/elementwise/RMSNorm/RoPE/SiLU/softmax/mask.
//! - [`graph`] — walks the mmap and builds a [`graph::Model`].
//! - [`kv_cache`] — the long-lived per-layer key/value store.
//! - [`forward`] — the per-token forward pass tying the above together.
//! - [`engine`] — the session facade: `load_model -> build_graph ->
//!   alloc_kv_cache -> forward* -> free_model`.
//!
//! Tokenization, sampling, and the CLI driver are external collaborators
//! and deliberately out of scope for this crate.

pub mod arena;
pub mod config;
pub mod engine;
pub mod error;
pub mod forward;
pub mod graph;
pub mod kernels;
pub mod kv_cache;
pub mod mmap_loader;
pub mod quant;
pub mod tensor;

pub use config::{EngineConfig, MmapStrategy, SimdDispatch};
pub use engine::{Engine, EngineState};
pub use error::{EngineError, Result};
pub use graph::{LayerWeights, Model, ModelConfig};
pub use kernels::Dispatch;
pub use kv_cache::{Kv, KvCache};
pub use mmap_loader::{MappedWeights, ModelHeader, MAGIC};
pub use tensor::{DType, TensorView};
