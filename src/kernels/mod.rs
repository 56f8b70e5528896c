//! SIMD kernel library: GEMV(Q4*F32), GEMM(F32*F32), elementwise ops,
//! RMSNorm, RoPE, SiLU, softmax, and causal masking.
//!
//! Every kernel is implemented twice: an `x86_64` AVX2+FMA path selected
//! once at [`Dispatch::detect`] time, and a portable scalar path used both
//! as the non-x86_64 fallback and as the reference the AVX2 path is
//! tolerance-tested against.

pub mod elementwise;
pub mod gemm;
pub mod gemv;
pub mod mask;
pub mod rmsnorm;
pub mod rope;
pub mod silu;
pub mod softmax;

mod scalar_math;

use crate::config::SimdDispatch;

/// Which kernel implementation a given [`crate::engine::Engine`] will use,
/// resolved once and reused for every call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatch {
    Avx2,
    Scalar,
}

impl Dispatch {
    pub fn detect(override_: SimdDispatch) -> Self {
        if override_ == SimdDispatch::ForceScalar {
            return Dispatch::Scalar;
        }
        #[cfg(target_arch = "x86_64")]
        {
            if is_x86_feature_detected!("avx2") && is_x86_feature_detected!("fma") {
                return Dispatch::Avx2;
            }
        }
        Dispatch::Scalar
    }
}

pub(crate) fn is_aligned(ptr: *const u8, align: usize) -> bool {
    (ptr as usize) % align == 0
}

pub(crate) const SIMD_ALIGN: usize = 32;
