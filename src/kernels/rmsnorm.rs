//! RMSNorm: `y = x * rsqrt(mean(x^2) + eps) * weight`.

use super::{is_aligned, Dispatch, SIMD_ALIGN};
use crate::error::{EngineError, Result};

fn validate(x: &[f32], weight: &[f32], out: &[f32]) -> Result<u32> {
    let n = x.len();
    if weight.len() != n || out.len() != n {
        return Err(EngineError::InvalidSize("rmsnorm: length mismatch".to_string()));
    }
    if n == 0 || n % 8 != 0 {
        return Err(EngineError::InvalidSize("rmsnorm: N must be a nonzero multiple of 8".to_string()));
    }
    if !is_aligned(x.as_ptr() as *const u8, SIMD_ALIGN)
        || !is_aligned(weight.as_ptr() as *const u8, SIMD_ALIGN)
        || !is_aligned(out.as_ptr() as *const u8, SIMD_ALIGN)
    {
        return Err(EngineError::Misaligned);
    }
    Ok(n as u32)
}

pub fn rmsnorm_f32(
    dispatch: Dispatch,
    x: &[f32],
    weight: &[f32],
    out: &mut [f32],
    eps: f32,
) -> Result<()> {
    let n = validate(x, weight, out)?;
    match dispatch {
        #[cfg(target_arch = "x86_64")]
        Dispatch::Avx2 => unsafe { rmsnorm_f32_avx2(x, weight, out, n, eps) },
        _ => rmsnorm_f32_scalar(x, weight, out, n, eps),
    }
    Ok(())
}

pub fn rmsnorm_f32_scalar(x: &[f32], weight: &[f32], out: &mut [f32], n: u32, eps: f32) {
    let n = n as usize;
    let sum_sq: f32 = x[..n].iter().map(|v| v * v).sum();
    let mean_sq = sum_sq / n as f32;
    let rsqrt = 1.0 / (mean_sq + eps).sqrt();
    for i in 0..n {
        out[i] = x[i] * rsqrt * weight[i];
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn rmsnorm_f32_avx2(x: &[f32], weight: &[f32], out: &mut [f32], n: u32, eps: f32) {
    use std::arch::x86_64::*;
    let n = n as usize;
    let vec_count = n / 8;

    let mut sum_sq = _mm256_setzero_ps();
    for i in 0..vec_count {
        let xv = _mm256_load_ps(x.as_ptr().add(i * 8));
        sum_sq = _mm256_add_ps(sum_sq, _mm256_mul_ps(xv, xv));
    }
    let lo = _mm256_extractf128_ps(sum_sq, 0);
    let hi = _mm256_extractf128_ps(sum_sq, 1);
    let sum128 = _mm_add_ps(lo, hi);
    let shuf = _mm_movehdup_ps(sum128);
    let sums = _mm_add_ps(sum128, shuf);
    let shuf2 = _mm_movehl_ps(shuf, sums);
    let sum_val = _mm_cvtss_f32(_mm_add_ss(sums, shuf2));

    let mean_sq = sum_val / n as f32;
    let mean_eps = _mm256_set1_ps(mean_sq + eps);
    let rsqrt_approx = _mm256_rsqrt_ps(mean_eps);
    let three = _mm256_set1_ps(3.0);
    let half = _mm256_set1_ps(0.5);
    let r_sq = _mm256_mul_ps(rsqrt_approx, rsqrt_approx);
    let x_r_sq = _mm256_mul_ps(mean_eps, r_sq);
    let three_minus = _mm256_sub_ps(three, x_r_sq);
    let rsqrt_refined = _mm256_mul_ps(_mm256_mul_ps(rsqrt_approx, three_minus), half);
    let rsqrt_val = _mm_cvtss_f32(_mm256_extractf128_ps(rsqrt_refined, 0));
    let rsqrt_vec = _mm256_set1_ps(rsqrt_val);

    for i in 0..vec_count {
        let xv = _mm256_load_ps(x.as_ptr().add(i * 8));
        let wv = _mm256_load_ps(weight.as_ptr().add(i * 8));
        let normalized = _mm256_mul_ps(xv, rsqrt_vec);
        let result = _mm256_mul_ps(normalized, wv);
        _mm256_store_ps(out.as_mut_ptr().add(i * 8), result);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn constant_vector_normalizes_to_weight() {
        let x = vec![2.0f32; 8];
        let weight = vec![1.0f32; 8];
        let mut out = vec![0.0f32; 8];
        rmsnorm_f32_scalar(&x, &weight, &mut out, 8, 1e-6);
        for v in out {
            assert!((v - 1.0).abs() < 1e-3);
        }
    }
}
