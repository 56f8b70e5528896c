//! Engine facade: owns one session's lifecycle end to end —
//! `load_model -> build_graph -> alloc_kv_cache -> forward* -> free_model`
//! — and nothing else. Every resource the session needs (the mmap, the
//! weight graph, the scratch arena, the KV cache, the resolved kernel
//! dispatch) lives inside this struct; there is no process-global model
//! or allocator state anywhere in the crate.

use crate::arena::Arena;
use crate::config::{EngineConfig, MmapStrategy};
use crate::error::{EngineError, Result};
use crate::forward;
use crate::graph::{self, Model};
use crate::kernels::Dispatch;
use crate::kv_cache::KvCache;
use crate::mmap_loader::MappedWeights;
use tracing::{debug, info, warn};

/// Lifecycle states a session moves through. `Running` is observed only
/// for the duration of one `forward` call; the public API never returns
/// control to the caller while in that state. `Poisoned` is terminal for
/// the KV cache in place — §7/§9 do not guarantee a safe rollback of the
/// append-only position counter after a partial write, so a poisoned
/// session requires a fresh `alloc_kv_cache` (or a fresh `Engine`) before
/// any further `forward` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Uninitialized,
    Loaded,
    GraphBuilt,
    KvAllocated,
    Ready,
    Running,
    Poisoned,
    Freed,
}

/// One inference session: a loaded model, its arena, and its KV cache.
///
/// `model` borrows from `weights` for as long as the engine lives. Rust
/// has no first-class way to express "a struct field borrows a sibling
/// field", so the borrow is erased to `'static` and re-tied to `weights`'
/// true lifetime by hand; see the safety note on [`Engine::build_graph`].
pub struct Engine {
    state: EngineState,
    config: EngineConfig,
    dispatch: Dispatch,
    // Declared before `weights` so `Drop` tears `model` down first — it
    // must never observe `weights` already freed.
    model: Option<Model<'static>>,
    weights: Option<Box<MappedWeights>>,
    arena: Option<Arena>,
    kv_cache: Option<KvCache>,
}

impl Engine {
    /// Construct an unloaded engine with the given configuration.
    pub fn new(config: EngineConfig) -> Self {
        let dispatch = Dispatch::detect(config.simd_dispatch);
        info!(?dispatch, "resolved kernel dispatch for new engine");
        Self {
            state: EngineState::Uninitialized,
            config,
            dispatch,
            model: None,
            weights: None,
            arena: None,
            kv_cache: None,
        }
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    fn require_state(&self, expected: EngineState, op: &str) -> Result<()> {
        if self.state != expected {
            return Err(EngineError::InvalidArg(format!(
                "{op} requires engine state {expected:?}, but engine is {:?}",
                self.state
            )));
        }
        Ok(())
    }

    /// Memory-map `path` and validate its header. Transitions
    /// `Uninitialized -> Loaded`.
    pub fn load_model(&mut self, path: &str) -> Result<()> {
        self.require_state(EngineState::Uninitialized, "load_model")?;
        let strategy = self.config.mmap_strategy;
        if strategy == MmapStrategy::Lazy {
            debug!(path, "loading model lazily, pages fault in on demand");
        }
        let weights = MappedWeights::open(path, strategy)?;
        self.weights = Some(Box::new(weights));
        self.state = EngineState::Loaded;
        Ok(())
    }

    /// Walk the mmapped region and build a tensor view for every weight.
    /// Transitions `Loaded -> GraphBuilt`.
    pub fn build_graph(&mut self) -> Result<()> {
        self.require_state(EngineState::Loaded, "build_graph")?;
        let weights_ref: &MappedWeights = self
            .weights
            .as_ref()
            .expect("Loaded state implies weights is populated")
            .as_ref();
        let model = graph::build_graph(weights_ref)?;

        // SAFETY: `model` borrows from `*weights_ref`, which lives inside
        // a `Box` owned by `self.weights` and is never moved or dropped
        // while `self.model` is `Some` (the box is heap-stable, and
        // `model`'s field order guarantees it is dropped before
        // `weights` on every exit path, including `free_model`). Erasing
        // the borrow to `'static` here and re-deriving the true lifetime
        // from `self.weights`'s ownership is the standard encoding for
        // this self-referential shape in safe-looking Rust.
        let model: Model<'static> = unsafe { std::mem::transmute(model) };

        self.arena = Some(Arena::new(self.config.arena_scratch_bytes));
        if let Some(arena) = self.arena.as_mut() {
            // No view records are bump-placed in this realization (see
            // DESIGN.md); the base offset is frozen at zero so every
            // `forward` call resets to an empty scratch region.
            arena.set_base();
        }

        self.model = Some(model);
        self.state = EngineState::GraphBuilt;
        Ok(())
    }

    /// Allocate the long-lived KV cache sized for the built graph.
    /// Transitions `GraphBuilt -> KvAllocated -> Ready`.
    pub fn alloc_kv_cache(&mut self) -> Result<()> {
        self.require_state(EngineState::GraphBuilt, "alloc_kv_cache")?;
        let model = self.model.as_ref().expect("GraphBuilt implies model is populated");
        self.kv_cache = Some(KvCache::new(&model.config));
        self.state = EngineState::Ready;
        Ok(())
    }

    /// Evaluate `tokens` starting at `base_position`, writing the final
    /// position's logits into `out_logits`. Requires `Ready`; leaves the
    /// engine `Ready` again on success or `Poisoned` on any kernel error,
    /// per the session-poisoning contract in §7/§9.
    pub fn forward(&mut self, tokens: &[u32], base_position: u32, out_logits: &mut [f32]) -> Result<()> {
        self.require_state(EngineState::Ready, "forward")?;
        self.state = EngineState::Running;
        debug!(tokens = tokens.len(), base_position, "forward call starting");

        let model = self.model.as_ref().expect("Ready implies model is populated");
        let arena = self.arena.as_mut().expect("Ready implies arena is populated");
        let kv_cache = self.kv_cache.as_mut().expect("Ready implies kv_cache is populated");

        let result = forward::forward(
            model,
            arena,
            kv_cache,
            self.dispatch,
            &self.config,
            tokens,
            base_position,
            out_logits,
        );

        match result {
            Ok(()) => {
                self.state = EngineState::Ready;
                Ok(())
            }
            Err(e) => {
                warn!(error = %e, "forward call failed, marking session poisoned");
                self.state = EngineState::Poisoned;
                Err(e)
            }
        }
    }

    /// Release the arena, KV cache, and mmap. Valid from any state except
    /// `Running` (which the public API never observes) or already `Freed`.
    pub fn free_model(&mut self) {
        if matches!(self.state, EngineState::Freed) {
            return;
        }
        self.model = None;
        self.kv_cache = None;
        self.arena = None;
        self.weights = None;
        self.state = EngineState::Freed;
        info!("released model, arena, and kv cache");
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn is_poisoned(&self) -> bool {
        self.state == EngineState::Poisoned
    }
}
