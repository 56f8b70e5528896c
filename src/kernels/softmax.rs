//! Stable softmax: subtract max, exponentiate, normalize.

use super::scalar_math::exp_approx;
#[cfg(target_arch = "x86_64")]
use super::silu::exp_approx_avx;
use super::{is_aligned, Dispatch, SIMD_ALIGN};
use crate::error::{EngineError, Result};

pub fn softmax_f32(dispatch: Dispatch, x: &[f32], out: &mut [f32]) -> Result<()> {
    let n = x.len();
    if out.len() != n {
        return Err(EngineError::InvalidSize("softmax: length mismatch".to_string()));
    }
    if n == 0 {
        return Err(EngineError::InvalidSize("softmax: N must be nonzero".to_string()));
    }

    if n < 8 {
        let max = x.iter().cloned().fold(f32::NEG_INFINITY, f32::max);
        let mut sum = 0.0f32;
        for i in 0..n {
            out[i] = (x[i] - max).exp();
            sum += out[i];
        }
        for v in out.iter_mut().take(n) {
            *v /= sum;
        }
        return Ok(());
    }

    if !is_aligned(x.as_ptr() as *const u8, SIMD_ALIGN) || !is_aligned(out.as_ptr() as *const u8, SIMD_ALIGN) {
        return Err(EngineError::Misaligned);
    }

    match dispatch {
        #[cfg(target_arch = "x86_64")]
        Dispatch::Avx2 => unsafe { softmax_f32_avx2(x, out, n) },
        _ => softmax_f32_scalar_vectorizable(x, out, n),
    }
    Ok(())
}

fn softmax_f32_scalar_vectorizable(x: &[f32], out: &mut [f32], n: usize) {
    let max = x[..n].iter().cloned().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for i in 0..n {
        let v = exp_approx(x[i] - max);
        out[i] = v;
        sum += v;
    }
    for v in out.iter_mut().take(n) {
        *v /= sum;
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn softmax_f32_avx2(x: &[f32], out: &mut [f32], n: usize) {
    use super::super::kernels::scalar_math::exp_approx as exp_scalar;
    use std::arch::x86_64::*;

    let vec_count = n / 8;

    let mut max_vec = _mm256_set1_ps(f32::NEG_INFINITY);
    for i in 0..vec_count {
        let xv = _mm256_load_ps(x.as_ptr().add(i * 8));
        max_vec = _mm256_max_ps(max_vec, xv);
    }
    let mut max_val = horizontal_max(max_vec);
    for i in (vec_count * 8)..n {
        max_val = max_val.max(x[i]);
    }

    let max_bcast = _mm256_set1_ps(max_val);
    let mut sum_vec = _mm256_setzero_ps();
    for i in 0..vec_count {
        let off = i * 8;
        let xv = _mm256_load_ps(x.as_ptr().add(off));
        let shifted = _mm256_sub_ps(xv, max_bcast);
        let e = exp_approx_avx(shifted);
        _mm256_store_ps(out.as_mut_ptr().add(off), e);
        sum_vec = _mm256_add_ps(sum_vec, e);
    }
    let mut sum_val = horizontal_sum(sum_vec);
    for i in (vec_count * 8)..n {
        let e = exp_scalar(x[i] - max_val);
        out[i] = e;
        sum_val += e;
    }

    let sum_bcast = _mm256_set1_ps(sum_val);
    for i in 0..vec_count {
        let off = i * 8;
        let v = _mm256_load_ps(out.as_ptr().add(off));
        _mm256_store_ps(out.as_mut_ptr().add(off), _mm256_div_ps(v, sum_bcast));
    }
    for i in (vec_count * 8)..n {
        out[i] /= sum_val;
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn horizontal_sum(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;
    let lo = _mm256_extractf128_ps(v, 0);
    let hi = _mm256_extractf128_ps(v, 1);
    let sum128 = _mm_add_ps(lo, hi);
    let shuf = _mm_movehdup_ps(sum128);
    let sums = _mm_add_ps(sum128, shuf);
    let shuf2 = _mm_movehl_ps(shuf, sums);
    _mm_cvtss_f32(_mm_add_ss(sums, shuf2))
}

#[cfg(target_arch = "x86_64")]
unsafe fn horizontal_max(v: std::arch::x86_64::__m256) -> f32 {
    use std::arch::x86_64::*;
    let lo = _mm256_extractf128_ps(v, 0);
    let hi = _mm256_extractf128_ps(v, 1);
    let max128 = _mm_max_ps(lo, hi);
    let shuf = _mm_movehdup_ps(max128);
    let maxs = _mm_max_ps(max128, shuf);
    let shuf2 = _mm_movehl_ps(shuf, maxs);
    _mm_cvtss_f32(_mm_max_ss(maxs, shuf2))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn s4_uniform_input_is_uniform_softmax() {
        let x = vec![0.0f32; 8];
        let mut out = vec![0.0f32; 8];
        softmax_f32_scalar_vectorizable(&x, &mut out, 8);
        for v in out {
            assert!((v - 0.125).abs() < 1e-3);
        }
    }

    #[test]
    fn softmax_sums_to_one() {
        let x = vec![1.0f32, 2.0, -3.0, 0.5, 4.0, -1.0, 0.0, 2.5];
        let mut out = vec![0.0f32; 8];
        softmax_f32_scalar_vectorizable(&x, &mut out, 8);
        let sum: f32 = out.iter().sum();
        assert!((sum - 1.0).abs() < 1e-3);
    }
}
