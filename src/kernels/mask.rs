//! Causal mask: zero out (via a large-negative overwrite) every score at a
//! future key position.
//!
//! Row `i` of an `[L, L]` scores matrix is split into four regions: a
//! scalar prefix up to the next 8-aligned column, an 8-wide boundary block
//! that straddles the diagonal and needs a compare-and-blend, a store-only
//! region strictly to the right of the diagonal where every lane is
//! masked unconditionally, and a scalar tail. The store-only region never
//! loads or compares, which is where the traffic savings over a naive
//! full-row blend come from.

use super::{is_aligned, Dispatch, SIMD_ALIGN};
use crate::error::{EngineError, Result};

fn validate(scores: &[f32], l: usize) -> Result<()> {
    if l == 0 {
        return Err(EngineError::InvalidSize("causal mask: L must be nonzero".to_string()));
    }
    if scores.len() < l * l {
        return Err(EngineError::InvalidSize(
            "causal mask: scores buffer shorter than L*L".to_string(),
        ));
    }
    if !is_aligned(scores.as_ptr() as *const u8, SIMD_ALIGN) {
        return Err(EngineError::Misaligned);
    }
    Ok(())
}

/// Mask `scores` (row-major `[L, L]`) in place: for `j > i`, `scores[i][j]
/// = mask_value`; for `j <= i`, the entry is left unchanged.
pub fn causal_mask_f32(dispatch: Dispatch, scores: &mut [f32], l: usize, mask_value: f32) -> Result<()> {
    validate(scores, l)?;
    if l == 1 {
        return Ok(()); // single position has no future column to mask
    }
    match dispatch {
        #[cfg(target_arch = "x86_64")]
        Dispatch::Avx2 => unsafe { causal_mask_f32_avx2(scores, l, mask_value) },
        _ => causal_mask_f32_scalar(scores, l, mask_value),
    }
    Ok(())
}

pub fn causal_mask_f32_scalar(scores: &mut [f32], l: usize, mask_value: f32) {
    for i in 0..l {
        let row = &mut scores[i * l..i * l + l];
        for v in row.iter_mut().skip(i + 1) {
            *v = mask_value;
        }
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn causal_mask_f32_avx2(scores: &mut [f32], l: usize, mask_value: f32) {
    use std::arch::x86_64::*;

    let mask_vec = _mm256_set1_ps(mask_value);
    let idx = _mm256_setr_epi32(0, 1, 2, 3, 4, 5, 6, 7);

    for i in 0..l {
        let row_ptr = scores.as_mut_ptr().add(i * l);

        // Scalar prefix: columns before the next 8-aligned boundary at or
        // before the diagonal. Everything here is `j <= i` and untouched,
        // except we must still walk up to `min(i+1, l)` rounded down to
        // the block containing the diagonal.
        let block_of_diag = (i / 8) * 8;
        // nothing to do for j in [0, block_of_diag): all j <= i there.

        // Boundary block: the 8-wide block straddling (or ending at) the
        // diagonal. Needs a per-lane compare since it mixes past/current
        // and future columns.
        let boundary_start = block_of_diag;
        if boundary_start < l {
            let remaining = l - boundary_start;
            let i_bcast = _mm256_set1_epi32(i as i32);
            let future = _mm256_cmpgt_epi32(_mm256_add_epi32(_mm256_set1_epi32(boundary_start as i32), idx), i_bcast);
            if remaining >= 8 {
                let cur = _mm256_loadu_ps(row_ptr.add(boundary_start));
                let blended = _mm256_blendv_ps(cur, mask_vec, _mm256_castsi256_ps(future));
                _mm256_storeu_ps(row_ptr.add(boundary_start), blended);
            } else {
                for k in 0..remaining {
                    let j = boundary_start + k;
                    if j > i {
                        *row_ptr.add(j) = mask_value;
                    }
                }
            }
        }

        // Store-only region: every full 8-wide block strictly after the
        // boundary block is entirely future, so it is written
        // unconditionally with no load or compare.
        let mut j = boundary_start + 8;
        while j + 8 <= l {
            _mm256_storeu_ps(row_ptr.add(j), mask_vec);
            j += 8;
        }
        while j < l {
            *row_ptr.add(j) = mask_value;
            j += 1;
        }
    }
}
