//! Engine configuration with TOML support.
//!
//! Mirrors the host application's configuration layer, scoped down to the
//! knobs this engine itself understands: mmap strategy, scratch arena
//! sizing, and the numeric constants the kernels are parameterized by.

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Whether the weight file's pages are faulted in eagerly at load time or
/// left to be faulted in on first touch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum MmapStrategy {
    /// Touch every page during `load_model` so the first `forward` call
    /// does not pay page-fault latency.
    Eager,
    /// Let the OS fault pages in on demand.
    #[default]
    Lazy,
}

/// Forces kernel dispatch to the portable scalar path, bypassing runtime
/// AVX2/FMA feature detection. Used by tests that check kernels against
/// their own reference implementation, and as an escape hatch on hosts
/// where the detected feature set misbehaves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SimdDispatch {
    #[default]
    Auto,
    ForceScalar,
}

/// Complete engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// How the weight file's pages are brought into memory.
    pub mmap_strategy: MmapStrategy,
    /// Bytes reserved for the per-step scratch arena, beyond the base
    /// region holding tensor view records.
    pub arena_scratch_bytes: usize,
    /// Value written into masked-out causal attention score entries.
    pub causal_mask_value: f32,
    /// RMSNorm epsilon. The on-disk format does not carry this value;
    /// the reference implementation hardcodes `1e-6`.
    pub rms_norm_eps: f32,
    /// Kernel dispatch override, see [`SimdDispatch`].
    pub simd_dispatch: SimdDispatch,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            mmap_strategy: MmapStrategy::default(),
            arena_scratch_bytes: 64 * 1024 * 1024,
            causal_mask_value: -1.0e9,
            rms_norm_eps: 1e-6,
            simd_dispatch: SimdDispatch::default(),
        }
    }
}

impl EngineConfig {
    /// Load configuration from a TOML file.
    pub fn from_file(path: &str) -> Result<Self, String> {
        let contents = std::fs::read_to_string(path)
            .map_err(|e| format!("failed to read config file: {e}"))?;
        toml::from_str(&contents).map_err(|e| format!("failed to parse config: {e}"))
    }

    /// Load from `QOR_CONFIG` if set, falling back to defaults, then apply
    /// environment overrides.
    pub fn load() -> Self {
        let mut config = if let Ok(path) = std::env::var("QOR_CONFIG") {
            match Self::from_file(&path) {
                Ok(cfg) => {
                    info!(path = %path, "loaded engine config from file");
                    cfg
                }
                Err(e) => {
                    warn!(error = %e, "failed to load engine config, using defaults");
                    Self::default()
                }
            }
        } else {
            Self::default()
        };
        config.apply_env_overrides();
        config
    }

    /// Apply environment variable overrides on top of an existing config.
    pub fn apply_env_overrides(&mut self) {
        if let Ok(v) = std::env::var("QOR_ARENA_SCRATCH_BYTES") {
            if let Ok(n) = v.parse() {
                self.arena_scratch_bytes = n;
            }
        }
        if let Ok(v) = std::env::var("QOR_MMAP_STRATEGY") {
            match v.as_str() {
                "eager" => self.mmap_strategy = MmapStrategy::Eager,
                "lazy" => self.mmap_strategy = MmapStrategy::Lazy,
                other => warn!(value = %other, "unrecognized QOR_MMAP_STRATEGY, ignoring"),
            }
        }
        if let Ok(v) = std::env::var("QOR_FORCE_SCALAR") {
            if v == "1" || v.eq_ignore_ascii_case("true") {
                self.simd_dispatch = SimdDispatch::ForceScalar;
            }
        }
    }

    /// Validate cross-field constraints, returning all violations found.
    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();
        if self.arena_scratch_bytes < 64 {
            errors.push("arena_scratch_bytes must be at least 64 bytes".to_string());
        }
        if self.arena_scratch_bytes % 64 != 0 {
            errors.push("arena_scratch_bytes must be a multiple of 64".to_string());
        }
        if !self.rms_norm_eps.is_finite() || self.rms_norm_eps <= 0.0 {
            errors.push("rms_norm_eps must be a finite positive number".to_string());
        }
        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }

    pub fn with_arena_scratch_bytes(mut self, bytes: usize) -> Self {
        self.arena_scratch_bytes = bytes;
        self
    }

    pub fn with_mmap_strategy(mut self, strategy: MmapStrategy) -> Self {
        self.mmap_strategy = strategy;
        self
    }

    pub fn with_causal_mask_value(mut self, value: f32) -> Self {
        self.causal_mask_value = value;
        self
    }

    pub fn with_force_scalar(mut self) -> Self {
        self.simd_dispatch = SimdDispatch::ForceScalar;
        self
    }

    pub fn to_toml(&self) -> Result<String, String> {
        toml::to_string_pretty(self).map_err(|e| format!("failed to serialize config: {e}"))
    }

    /// Advisory session count for a host process: §5 gives each session
    /// its own arena and KV cache and runs it single-threaded, so a host
    /// that wants to saturate the machine typically runs one session per
    /// physical core. The engine itself spawns no threads and never
    /// consults this value internally.
    pub fn recommended_session_count() -> usize {
        num_cpus::get_physical().max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.mmap_strategy, MmapStrategy::Lazy);
        assert!(cfg.validate().is_ok());
    }

    #[test]
    fn test_config_validation() {
        let cfg = EngineConfig::default().with_arena_scratch_bytes(10);
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn recommended_session_count_is_at_least_one() {
        assert!(EngineConfig::recommended_session_count() >= 1);
    }

    #[test]
    fn test_toml_roundtrip() {
        let cfg = EngineConfig::default().with_causal_mask_value(-1e30);
        let toml_str = cfg.to_toml().unwrap();
        let parsed: EngineConfig = toml::from_str(&toml_str).unwrap();
        assert_eq!(parsed.causal_mask_value, -1e30);
    }
}
