//! Q4_0 block dequantization.
//!
//! One block packs 32 elements into 20 bytes: a leading `f32` scale
//! followed by 16 bytes of nibbles, low nibble first. Dequantization is
//! `(nibble - 8) * scale`; nibble value 8 is the zero point.

use crate::tensor::{Q4_0_BLOCK_BYTES, Q4_0_BLOCK_ELEMS};

/// Dequantize one 20-byte Q4_0 block into 32 f32 values, scalar reference
/// implementation. Used as the tolerance baseline for the SIMD kernel and
/// as the fallback on non-x86_64 targets.
#[inline]
pub fn dequantize_block_scalar(block: &[u8], out: &mut [f32]) {
    debug_assert!(block.len() >= Q4_0_BLOCK_BYTES);
    debug_assert!(out.len() >= Q4_0_BLOCK_ELEMS);
    let scale = f32::from_le_bytes(block[0..4].try_into().unwrap());
    let nibbles = &block[4..20];
    for j in 0..16 {
        let byte = nibbles[j];
        let lo = (byte & 0x0F) as i32;
        let hi = (byte >> 4) as i32;
        out[2 * j] = (lo - 8) as f32 * scale;
        out[2 * j + 1] = (hi - 8) as f32 * scale;
    }
}

#[cfg(target_arch = "x86_64")]
pub mod avx2 {
    use super::*;
    use std::arch::x86_64::*;

    /// Dequantize one Q4_0 block with AVX2, writing 32 contiguous,
    /// 32-byte aligned f32 values.
    ///
    /// # Safety
    /// Caller must have verified `is_x86_feature_detected!("avx2")` and
    /// `is_x86_feature_detected!("fma")`, that `block` has at least 20
    /// readable bytes, and that `out` points at 32 writable, 32-byte
    /// aligned f32 slots.
    #[target_feature(enable = "avx2,fma")]
    #[inline]
    pub unsafe fn dequantize_block_avx2(block: *const u8, out: *mut f32) {
        let scale = *(block as *const f32);
        let scale_vec = _mm256_broadcast_ss(&scale);
        let offset_vec = _mm256_mul_ps(_mm256_set1_ps(-8.0), scale_vec);

        let raw = _mm_loadu_si128(block.add(4) as *const __m128i);
        let low_mask = _mm_set1_epi8(0x0F);
        let lo_nibbles = _mm_and_si128(raw, low_mask);
        let hi_nibbles = _mm_and_si128(_mm_srli_epi16(raw, 4), low_mask);

        // Interleave so element order 0..31 is restored: even indices
        // from the low nibbles, odd indices from the high nibbles.
        let interleaved_lo = _mm_unpacklo_epi8(lo_nibbles, hi_nibbles);
        let interleaved_hi = _mm_unpackhi_epi8(lo_nibbles, hi_nibbles);

        // Each 128-bit group holds 16 bytes in restored element order;
        // widen the low and high 8-byte halves separately through
        // epu8->epi32->ps, then FMA against the shared scale/offset.
        let groups = [interleaved_lo, interleaved_hi];
        for (g, group) in groups.iter().enumerate() {
            for half in 0..2 {
                let half_bytes = if half == 0 {
                    *group
                } else {
                    _mm_srli_si128(*group, 8)
                };
                let q_i32 = _mm256_cvtepu8_epi32(half_bytes);
                let q_f32 = _mm256_cvtepi32_ps(q_i32);
                let result = _mm256_fmadd_ps(q_f32, scale_vec, offset_vec);
                _mm256_store_ps(out.add(g * 16 + half * 8), result);
            }
        }
    }

    /// Dequantize one Q4_0 block straight into registers and fold it
    /// into a running GEMV dot-product accumulator, with no memory
    /// round-trip for the dequantized weights. `input_ptr` must point at
    /// 32 readable, 32-byte aligned f32 values.
    ///
    /// # Safety
    /// Same preconditions as [`dequantize_block_avx2`] for `block`, plus
    /// `input_ptr` must point at 32 readable, 32-byte aligned f32 lanes.
    #[target_feature(enable = "avx2,fma")]
    #[inline(always)]
    pub unsafe fn dequantize_block_avx2_fma(
        block: *const u8,
        input_ptr: *const f32,
        acc: __m256,
        low_mask: __m128i,
    ) -> __m256 {
        let scale = *(block as *const f32);
        let scale_vec = _mm256_broadcast_ss(&scale);
        let offset_vec = _mm256_mul_ps(_mm256_set1_ps(-8.0), scale_vec);

        let raw = _mm_loadu_si128(block.add(4) as *const __m128i);
        let lo_nibbles = _mm_and_si128(raw, low_mask);
        let hi_nibbles = _mm_and_si128(_mm_srli_epi16(raw, 4), low_mask);

        // v0_15 holds elements 0..15 in restored order, v16_31 holds 16..31.
        let v0_15 = _mm_unpacklo_epi8(lo_nibbles, hi_nibbles);
        let v16_31 = _mm_unpackhi_epi8(lo_nibbles, hi_nibbles);

        let mut acc = acc;

        let w = _mm256_fmadd_ps(_mm256_cvtepi32_ps(_mm256_cvtepu8_epi32(v0_15)), scale_vec, offset_vec);
        acc = _mm256_fmadd_ps(w, _mm256_load_ps(input_ptr), acc);

        let v8_15 = _mm_srli_si128(v0_15, 8);
        let w = _mm256_fmadd_ps(_mm256_cvtepi32_ps(_mm256_cvtepu8_epi32(v8_15)), scale_vec, offset_vec);
        acc = _mm256_fmadd_ps(w, _mm256_load_ps(input_ptr.add(8)), acc);

        let w = _mm256_fmadd_ps(_mm256_cvtepi32_ps(_mm256_cvtepu8_epi32(v16_31)), scale_vec, offset_vec);
        acc = _mm256_fmadd_ps(w, _mm256_load_ps(input_ptr.add(16)), acc);

        let v24_31 = _mm_srli_si128(v16_31, 8);
        let w = _mm256_fmadd_ps(_mm256_cvtepi32_ps(_mm256_cvtepu8_epi32(v24_31)), scale_vec, offset_vec);
        acc = _mm256_fmadd_ps(w, _mm256_load_ps(input_ptr.add(24)), acc);

        acc
    }
}
