//! GEMV against a Q4_0-quantized weight matrix: `out = W . x`.

use super::{is_aligned, Dispatch, SIMD_ALIGN};
use crate::error::{EngineError, Result};
use crate::quant::dequantize_block_scalar;
use crate::tensor::{DType, TensorView, Q4_0_BLOCK_BYTES, Q4_0_BLOCK_ELEMS};

fn validate(weights: &TensorView, x: &[f32], out: &[f32]) -> Result<(u32, u32)> {
    if weights.dtype != DType::Q4_0 {
        return Err(EngineError::InvalidDtype);
    }
    if !is_aligned(x.as_ptr() as *const u8, SIMD_ALIGN) {
        return Err(EngineError::Misaligned);
    }
    if !is_aligned(out.as_ptr() as *const u8, SIMD_ALIGN) {
        return Err(EngineError::Misaligned);
    }
    if std::ptr::eq(x.as_ptr(), out.as_ptr()) {
        return Err(EngineError::Aliasing);
    }
    let m = weights.rows();
    let n = weights.cols();
    if m == 0 {
        return Err(EngineError::InvalidSize("GEMV: M must be nonzero".to_string()));
    }
    if n == 0 || n % Q4_0_BLOCK_ELEMS as u32 != 0 {
        return Err(EngineError::InvalidSize(
            "GEMV: N must be a nonzero multiple of 32".to_string(),
        ));
    }
    if x.len() < n as usize {
        return Err(EngineError::InvalidSize("GEMV: x shorter than N".to_string()));
    }
    if out.len() < m as usize {
        return Err(EngineError::InvalidSize("GEMV: out shorter than M".to_string()));
    }
    let blocks_per_row = (n / Q4_0_BLOCK_ELEMS as u32) as u64;
    if blocks_per_row != 0 && (m as u64) > u32::MAX as u64 / blocks_per_row {
        return Err(EngineError::Overflow);
    }
    Ok((m, n))
}

/// Dispatch to the fastest available kernel for this process.
pub fn gemv_q4_f32(dispatch: Dispatch, weights: &TensorView, x: &[f32], out: &mut [f32]) -> Result<()> {
    validate(weights, x, out)?;
    match dispatch {
        #[cfg(target_arch = "x86_64")]
        Dispatch::Avx2 => unsafe { gemv_q4_f32_avx2(weights, x, out) },
        _ => gemv_q4_f32_scalar(weights, x, out),
    }
}

/// Scalar reference implementation; also the tolerance baseline for the
/// AVX2 kernel.
pub fn gemv_q4_f32_scalar(weights: &TensorView, x: &[f32], out: &mut [f32]) -> Result<()> {
    let n = weights.cols();
    let m = weights.rows();
    let blocks_per_row = (n / Q4_0_BLOCK_ELEMS as u32) as usize;
    let mut block_vals = [0.0f32; Q4_0_BLOCK_ELEMS];
    for row in 0..m {
        let row_ptr = weights.q4_0_row_ptr(row)?;
        let mut acc = 0.0f32;
        for b in 0..blocks_per_row {
            let block = unsafe {
                std::slice::from_raw_parts(row_ptr.add(b * Q4_0_BLOCK_BYTES), Q4_0_BLOCK_BYTES)
            };
            dequantize_block_scalar(block, &mut block_vals);
            let base = b * Q4_0_BLOCK_ELEMS;
            for k in 0..Q4_0_BLOCK_ELEMS {
                acc += block_vals[k] * x[base + k];
            }
        }
        out[row as usize] = acc;
    }
    Ok(())
}

#[cfg(target_arch = "x86_64")]
unsafe fn gemv_q4_f32_avx2(weights: &TensorView, x: &[f32], out: &mut [f32]) -> Result<()> {
    use crate::quant::avx2::dequantize_block_avx2_fma;
    use std::arch::x86_64::*;

    let n = weights.cols();
    let m = weights.rows();
    let blocks_per_row = (n / Q4_0_BLOCK_ELEMS as u32) as usize;
    let groups = blocks_per_row / 4;
    let low_mask = _mm_set1_epi8(0x0F);

    for row in 0..m {
        let row_ptr = weights.q4_0_row_ptr(row)?;
        let mut acc0 = _mm256_setzero_ps();
        let mut acc1 = _mm256_setzero_ps();
        let mut acc2 = _mm256_setzero_ps();
        let mut acc3 = _mm256_setzero_ps();

        let mut b = 0usize;

        // Dequantization happens straight into the FMA accumulator —
        // never through an intermediate stack buffer — so the kernel
        // never depends on anything but `x`'s own 32-byte alignment.
        for _ in 0..groups {
            let block0 = row_ptr.add(b * Q4_0_BLOCK_BYTES);
            let block1 = row_ptr.add((b + 1) * Q4_0_BLOCK_BYTES);
            let block2 = row_ptr.add((b + 2) * Q4_0_BLOCK_BYTES);
            let block3 = row_ptr.add((b + 3) * Q4_0_BLOCK_BYTES);
            let x0 = x.as_ptr().add(b * Q4_0_BLOCK_ELEMS);
            let x1 = x.as_ptr().add((b + 1) * Q4_0_BLOCK_ELEMS);
            let x2 = x.as_ptr().add((b + 2) * Q4_0_BLOCK_ELEMS);
            let x3 = x.as_ptr().add((b + 3) * Q4_0_BLOCK_ELEMS);
            acc0 = dequantize_block_avx2_fma(block0, x0, acc0, low_mask);
            acc1 = dequantize_block_avx2_fma(block1, x1, acc1, low_mask);
            acc2 = dequantize_block_avx2_fma(block2, x2, acc2, low_mask);
            acc3 = dequantize_block_avx2_fma(block3, x3, acc3, low_mask);
            b += 4;
        }

        let remaining = blocks_per_row - b;
        if remaining > 0 {
            let block = row_ptr.add(b * Q4_0_BLOCK_BYTES);
            let xp = x.as_ptr().add(b * Q4_0_BLOCK_ELEMS);
            acc0 = dequantize_block_avx2_fma(block, xp, acc0, low_mask);
        }
        if remaining > 1 {
            let block = row_ptr.add((b + 1) * Q4_0_BLOCK_BYTES);
            let xp = x.as_ptr().add((b + 1) * Q4_0_BLOCK_ELEMS);
            acc1 = dequantize_block_avx2_fma(block, xp, acc1, low_mask);
        }
        if remaining > 2 {
            let block = row_ptr.add((b + 2) * Q4_0_BLOCK_BYTES);
            let xp = x.as_ptr().add((b + 2) * Q4_0_BLOCK_ELEMS);
            acc2 = dequantize_block_avx2_fma(block, xp, acc2, low_mask);
        }

        let sum01 = _mm256_add_ps(acc0, acc1);
        let sum23 = _mm256_add_ps(acc2, acc3);
        let sum = _mm256_add_ps(sum01, sum23);
        let lo = _mm256_extractf128_ps(sum, 0);
        let hi = _mm256_extractf128_ps(sum, 1);
        let sum128 = _mm_add_ps(lo, hi);
        let shuf = _mm_movehdup_ps(sum128);
        let sums = _mm_add_ps(sum128, shuf);
        let shuf2 = _mm_movehl_ps(shuf, sums);
        let total = _mm_cvtss_f32(_mm_add_ss(sums, shuf2));
        out[row as usize] = total;
    }
    Ok(())
}
