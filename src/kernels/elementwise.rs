//! Elementwise add/mul over contiguous 1-D f32 buffers.

use super::{is_aligned, Dispatch, SIMD_ALIGN};
use crate::error::{EngineError, Result};

fn validate(a: &[f32], b: &[f32], out: &[f32]) -> Result<usize> {
    let n = a.len();
    if b.len() != n || out.len() != n {
        return Err(EngineError::InvalidSize("elementwise op: length mismatch".to_string()));
    }
    if !is_aligned(a.as_ptr() as *const u8, SIMD_ALIGN)
        || !is_aligned(b.as_ptr() as *const u8, SIMD_ALIGN)
        || !is_aligned(out.as_ptr() as *const u8, SIMD_ALIGN)
    {
        return Err(EngineError::Misaligned);
    }
    Ok(n)
}

pub fn add_f32(dispatch: Dispatch, a: &[f32], b: &[f32], out: &mut [f32]) -> Result<()> {
    let n = validate(a, b, out)?;
    match dispatch {
        #[cfg(target_arch = "x86_64")]
        Dispatch::Avx2 => unsafe { add_f32_avx2(a, b, out, n) },
        _ => add_f32_scalar(a, b, out, n),
    }
    Ok(())
}

pub fn mul_f32(dispatch: Dispatch, a: &[f32], b: &[f32], out: &mut [f32]) -> Result<()> {
    let n = validate(a, b, out)?;
    match dispatch {
        #[cfg(target_arch = "x86_64")]
        Dispatch::Avx2 => unsafe { mul_f32_avx2(a, b, out, n) },
        _ => mul_f32_scalar(a, b, out, n),
    }
    Ok(())
}

fn add_f32_scalar(a: &[f32], b: &[f32], out: &mut [f32], n: usize) {
    for i in 0..n {
        out[i] = a[i] + b[i];
    }
}

fn mul_f32_scalar(a: &[f32], b: &[f32], out: &mut [f32], n: usize) {
    for i in 0..n {
        out[i] = a[i] * b[i];
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn add_f32_avx2(a: &[f32], b: &[f32], out: &mut [f32], n: usize) {
    use std::arch::x86_64::*;
    let vec_count = n / 32;
    for i in 0..vec_count {
        for lane in 0..4 {
            let off = i * 32 + lane * 8;
            let av = _mm256_load_ps(a.as_ptr().add(off));
            let bv = _mm256_load_ps(b.as_ptr().add(off));
            _mm256_store_ps(out.as_mut_ptr().add(off), _mm256_add_ps(av, bv));
        }
    }
    for i in (vec_count * 32)..n {
        out[i] = a[i] + b[i];
    }
}

#[cfg(target_arch = "x86_64")]
unsafe fn mul_f32_avx2(a: &[f32], b: &[f32], out: &mut [f32], n: usize) {
    use std::arch::x86_64::*;
    let vec_count = n / 32;
    for i in 0..vec_count {
        for lane in 0..4 {
            let off = i * 32 + lane * 8;
            let av = _mm256_load_ps(a.as_ptr().add(off));
            let bv = _mm256_load_ps(b.as_ptr().add(off));
            _mm256_store_ps(out.as_mut_ptr().add(off), _mm256_mul_ps(av, bv));
        }
    }
    for i in (vec_count * 32)..n {
        out[i] = a[i] * b[i];
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_matches_expected() {
        let a = vec![1.0f32; 3];
        let b = vec![2.0f32; 3];
        let mut out = vec![0.0f32; 3];
        add_f32_scalar(&a, &b, &mut out, 3);
        assert_eq!(out, vec![3.0, 3.0, 3.0]);
    }

    #[test]
    fn in_place_alias_matches_non_aliased() {
        let a = vec![1.0f32, 2.0, 3.0];
        let b = vec![10.0f32, 20.0, 30.0];
        let mut out = a.clone();
        add_f32_scalar(&out.clone(), &b, &mut out, 3);
        assert_eq!(out, vec![11.0, 22.0, 33.0]);
    }
}
