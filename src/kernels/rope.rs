//! Rotary position embedding over consecutive channel pairs.
//!
//! The cos/sin table uses a **duplicated layout**: lanes `2i` and `2i+1`
//! both hold the value for pair `i`, so one aligned load supplies both
//! lanes of the rotation. [`build_rope_table`] is the producer side of
//! this contract; the kernels below are the consumer.

use super::{is_aligned, Dispatch, SIMD_ALIGN};
use crate::error::{EngineError, Result};

/// Fill `cos_tab`/`sin_tab` (each length `head_dim`) with the duplicated
/// per-pair angle table for one absolute position.
pub fn build_rope_table(
    head_dim: usize,
    position: u32,
    rope_freq_base: f32,
    cos_tab: &mut [f32],
    sin_tab: &mut [f32],
) {
    debug_assert_eq!(head_dim % 2, 0);
    let pairs = head_dim / 2;
    for i in 0..pairs {
        let theta = rope_freq_base.powf(-2.0 * i as f32 / head_dim as f32);
        let angle = position as f32 * theta;
        let (s, c) = angle.sin_cos();
        cos_tab[2 * i] = c;
        cos_tab[2 * i + 1] = c;
        sin_tab[2 * i] = s;
        sin_tab[2 * i + 1] = s;
    }
}

fn validate(x: &[f32], cos_tab: &[f32], sin_tab: &[f32]) -> Result<u32> {
    let n = x.len();
    if cos_tab.len() != n || sin_tab.len() != n {
        return Err(EngineError::InvalidSize("rope: table length mismatch".to_string()));
    }
    if n == 0 || n % 8 != 0 || n % 2 != 0 {
        return Err(EngineError::InvalidSize("rope: N must be a multiple of 8".to_string()));
    }
    if !is_aligned(x.as_ptr() as *const u8, SIMD_ALIGN)
        || !is_aligned(cos_tab.as_ptr() as *const u8, SIMD_ALIGN)
        || !is_aligned(sin_tab.as_ptr() as *const u8, SIMD_ALIGN)
    {
        return Err(EngineError::Misaligned);
    }
    #[cfg(debug_assertions)]
    for i in 0..(n / 2) {
        debug_assert!(
            (cos_tab[2 * i] - cos_tab[2 * i + 1]).abs() < 1e-12,
            "rope cos table is not duplicated per pair"
        );
    }
    Ok(n as u32)
}

/// Rotate `x` in place using the duplicated cos/sin table.
pub fn rope_f32(dispatch: Dispatch, x: &mut [f32], cos_tab: &[f32], sin_tab: &[f32]) -> Result<()> {
    let n = validate(x, cos_tab, sin_tab)?;
    match dispatch {
        #[cfg(target_arch = "x86_64")]
        Dispatch::Avx2 => unsafe { rope_f32_avx2(x, cos_tab, sin_tab, n) },
        _ => rope_f32_scalar(x, cos_tab, sin_tab, n),
    }
    Ok(())
}

pub fn rope_f32_scalar(x: &mut [f32], cos_tab: &[f32], sin_tab: &[f32], n: u32) {
    let n = n as usize;
    for i in 0..(n / 2) {
        let x0 = x[2 * i];
        let x1 = x[2 * i + 1];
        let c = cos_tab[2 * i];
        let s = sin_tab[2 * i];
        x[2 * i] = x0 * c - x1 * s;
        x[2 * i + 1] = x1 * c + x0 * s;
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn rope_f32_avx2(x: &mut [f32], cos_tab: &[f32], sin_tab: &[f32], n: u32) {
    use std::arch::x86_64::*;
    let n = n as usize;
    let groups = n / 8; // 4 pairs per 8-wide group
    for g in 0..groups {
        let off = g * 8;
        let src = _mm256_load_ps(x.as_ptr().add(off));
        let cos_vec = _mm256_load_ps(cos_tab.as_ptr().add(off));
        let sin_vec = _mm256_load_ps(sin_tab.as_ptr().add(off));
        let src_swap = _mm256_permute_ps(src, 0xB1);
        let term1 = _mm256_mul_ps(src, cos_vec);
        let term2 = _mm256_mul_ps(src_swap, sin_vec);
        let result = _mm256_addsub_ps(term1, term2);
        _mm256_store_ps(x.as_mut_ptr().add(off), result);
    }
    for i in (groups * 4)..(n / 2) {
        let x0 = x[2 * i];
        let x1 = x[2 * i + 1];
        let c = cos_tab[2 * i];
        let s = sin_tab[2 * i];
        x[2 * i] = x0 * c - x1 * s;
        x[2 * i + 1] = x1 * c + x0 * s;
    }
}
