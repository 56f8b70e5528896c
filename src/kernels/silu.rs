//! SiLU: `f(x) = x * sigmoid(x)`.

use super::scalar_math::exp_approx;
use super::{is_aligned, Dispatch, SIMD_ALIGN};
use crate::error::{EngineError, Result};

pub fn silu_f32(dispatch: Dispatch, x: &[f32], out: &mut [f32]) -> Result<()> {
    let n = x.len();
    if out.len() != n {
        return Err(EngineError::InvalidSize("silu: length mismatch".to_string()));
    }
    if n == 0 {
        return Err(EngineError::InvalidSize("silu: N must be nonzero".to_string()));
    }

    if n < 8 {
        for i in 0..n {
            out[i] = x[i] / (1.0 + (-x[i]).exp());
        }
        return Ok(());
    }

    if !is_aligned(x.as_ptr() as *const u8, SIMD_ALIGN) || !is_aligned(out.as_ptr() as *const u8, SIMD_ALIGN) {
        return Err(EngineError::Misaligned);
    }

    match dispatch {
        #[cfg(target_arch = "x86_64")]
        Dispatch::Avx2 => unsafe { silu_f32_avx2(x, out, n) },
        _ => silu_f32_scalar_vectorizable(x, out, n),
    }
    Ok(())
}

fn silu_f32_scalar_vectorizable(x: &[f32], out: &mut [f32], n: usize) {
    for i in 0..n {
        let sigmoid = 1.0 / (1.0 + exp_approx(-x[i]));
        out[i] = x[i] * sigmoid;
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn silu_f32_avx2(x: &[f32], out: &mut [f32], n: usize) {
    use std::arch::x86_64::*;

    let one = _mm256_set1_ps(1.0);
    let vec_count = n / 8;
    for i in 0..vec_count {
        let off = i * 8;
        let x_vec = _mm256_load_ps(x.as_ptr().add(off));
        let neg_x = _mm256_xor_ps(x_vec, _mm256_set1_ps(-0.0));
        let exp_neg_x = exp_approx_avx(neg_x);
        let one_plus_exp = _mm256_add_ps(one, exp_neg_x);
        let sigmoid = _mm256_div_ps(one, one_plus_exp);
        let result = _mm256_mul_ps(x_vec, sigmoid);
        _mm256_store_ps(out.as_mut_ptr().add(off), result);
    }
    for i in (vec_count * 8)..n {
        let sigmoid = 1.0 / (1.0 + exp_approx(-x[i]));
        out[i] = x[i] * sigmoid;
    }
}

#[cfg(target_arch = "x86_64")]
pub(super) unsafe fn exp_approx_avx(x: std::arch::x86_64::__m256) -> std::arch::x86_64::__m256 {
    use std::arch::x86_64::*;
    let very_neg = _mm256_cmp_ps(x, _mm256_set1_ps(-10.0), _CMP_LT_OQ);
    let very_pos = _mm256_cmp_ps(x, _mm256_set1_ps(10.0), _CMP_GT_OQ);
    let xc = _mm256_max_ps(_mm256_min_ps(x, _mm256_set1_ps(5.0)), _mm256_set1_ps(-5.0));

    let c0 = _mm256_set1_ps(1.0);
    let c1 = _mm256_set1_ps(1.0);
    let c2 = _mm256_set1_ps(0.5);
    let c3 = _mm256_set1_ps(0.166_666_67);
    let c4 = _mm256_set1_ps(0.041_666_67);
    let c5 = _mm256_set1_ps(0.008_333_33);

    let mut result = c5;
    result = _mm256_fmadd_ps(result, xc, c4);
    result = _mm256_fmadd_ps(result, xc, c3);
    result = _mm256_fmadd_ps(result, xc, c2);
    result = _mm256_fmadd_ps(result, xc, c1);
    result = _mm256_fmadd_ps(result, xc, c0);
    result = _mm256_max_ps(result, _mm256_setzero_ps());

    let result = _mm256_blendv_ps(result, _mm256_setzero_ps(), very_neg);
    _mm256_blendv_ps(result, _mm256_set1_ps(22026.0), very_pos)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn silu_zero_is_zero() {
        let x = vec![0.0f32; 8];
        let mut out = vec![1.0f32; 8];
        silu_f32_scalar_vectorizable(&x, &mut out, 8);
        for v in out {
            assert!(v.abs() < 1e-3);
        }
    }

    #[test]
    fn small_n_uses_scalar_fallback() {
        let x = vec![1.0f32, -1.0, 2.0];
        let mut out = vec![0.0f32; 3];
        assert!(super::silu_f32(Dispatch::Scalar, &x, &mut out).is_ok());
    }
}
