//! Zero-copy strided tensor views.
//!
//! A [`TensorView`] never owns storage. It borrows a subrange of either
//! the mmapped weight region or the arena's scratch buffer, and its
//! lifetime is tied to that backing region by the borrow checker rather
//! than documented as a caller obligation.

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DType {
    F32,
    Q4_0,
}

impl DType {
    pub fn element_size(self) -> usize {
        match self {
            DType::F32 => 4,
            DType::Q4_0 => 0, // block-quantized; no per-element size
        }
    }
}

pub const Q4_0_BLOCK_ELEMS: usize = 32;
pub const Q4_0_BLOCK_BYTES: usize = 20; // 4 byte scale + 16 bytes of nibbles

/// A strided, typed view into a borrowed byte region.
///
/// `ne[0]` is the outermost (slowest-varying) logical dimension, matching
/// row-major layout. For `Q4_0` tensors only `nb[0]` (the row stride) is
/// meaningful; `nb[1..3]` carry the block size for bookkeeping but are
/// never read by kernels — see the stride-rule note on the quantized
/// format in [`crate::quant`].
pub struct TensorView<'a> {
    pub dtype: DType,
    pub ne: [u32; 4],
    pub nb: [u32; 4],
    pub name: &'static str,
    ptr: *const u8,
    _marker: std::marker::PhantomData<&'a u8>,
}

unsafe impl<'a> Send for TensorView<'a> {}
unsafe impl<'a> Sync for TensorView<'a> {}

fn checked_mul(a: u64, b: u64) -> Result<u64> {
    a.checked_mul(b).ok_or(EngineError::Overflow)
}

/// Compute the total byte size of an F32 tensor with the given extents.
pub fn calculate_f32_size(ne: [u32; 4]) -> Result<u64> {
    let mut total: u64 = 4;
    for dim in ne {
        total = checked_mul(total, dim.max(1) as u64)?;
    }
    Ok(total)
}

/// Compute the total byte size of a Q4_0 tensor. `ne[1]` (the row length,
/// i.e. the inner/contiguous dimension) must be a multiple of 32.
pub fn calculate_q4_0_size(ne: [u32; 4]) -> Result<u64> {
    if ne[1] % Q4_0_BLOCK_ELEMS as u32 != 0 {
        return Err(EngineError::InvalidSize(
            "Q4_0 tensor inner dimension must be a multiple of 32".to_string(),
        ));
    }
    let blocks_per_row = (ne[1] / Q4_0_BLOCK_ELEMS as u32) as u64;
    let rows = ne[0].max(1) as u64;
    let row_bytes = checked_mul(blocks_per_row, Q4_0_BLOCK_BYTES as u64)?;
    checked_mul(rows, row_bytes)
}

/// Construct a tensor view at `ptr`, validating that the declared byte
/// range lies within `[region_start, region_start + region_len)`.
///
/// # Safety
/// `ptr` must point into the region described by `region_start`/`region_len`.
pub unsafe fn create_tensor_view<'a>(
    ptr: *const u8,
    region_start: *const u8,
    region_len: usize,
    dtype: DType,
    ne: [u32; 4],
    name: &'static str,
) -> Result<TensorView<'a>> {
    if ptr.is_null() || region_start.is_null() {
        return Err(EngineError::NullPointer);
    }

    let size = match dtype {
        DType::F32 => calculate_f32_size(ne)?,
        DType::Q4_0 => calculate_q4_0_size(ne)?,
    };

    let region_start_addr = region_start as usize;
    let region_end_addr = region_start_addr
        .checked_add(region_len)
        .ok_or(EngineError::Overflow)?;
    let ptr_addr = ptr as usize;
    if ptr_addr < region_start_addr || ptr_addr > region_end_addr {
        return Err(EngineError::InvalidSize(
            "tensor data pointer lies outside its backing region".to_string(),
        ));
    }
    let tensor_end = ptr_addr
        .checked_add(size as usize)
        .ok_or(EngineError::Overflow)?;
    if tensor_end > region_end_addr {
        return Err(EngineError::InvalidSize(
            "tensor byte range exceeds its backing region".to_string(),
        ));
    }

    let nb = match dtype {
        DType::F32 => {
            let nb3 = 4u32;
            let nb2 = ne[3].max(1) * nb3;
            let nb1 = ne[2].max(1) * nb2;
            let nb0 = ne[1].max(1) * nb1;
            [nb0, nb1, nb2, nb3]
        }
        DType::Q4_0 => {
            let blocks_per_row = ne[1] / Q4_0_BLOCK_ELEMS as u32;
            let nb0 = blocks_per_row * Q4_0_BLOCK_BYTES as u32;
            // nb[1..3] are unused by kernels for Q4_0; store the block
            // size so debugging tools can at least see something sane.
            [nb0, Q4_0_BLOCK_BYTES as u32, Q4_0_BLOCK_BYTES as u32, Q4_0_BLOCK_BYTES as u32]
        }
    };

    Ok(TensorView {
        dtype,
        ne,
        nb,
        name,
        ptr,
        _marker: std::marker::PhantomData,
    })
}

impl<'a> TensorView<'a> {
    pub fn rows(&self) -> u32 {
        self.ne[0]
    }

    pub fn cols(&self) -> u32 {
        self.ne[1]
    }

    pub fn as_f32_slice(&self) -> Result<&'a [f32]> {
        if self.dtype != DType::F32 {
            return Err(EngineError::InvalidDtype);
        }
        let len = (self.ne[0].max(1) as usize) * (self.ne[1].max(1) as usize)
            * (self.ne[2].max(1) as usize)
            * (self.ne[3].max(1) as usize);
        if (self.ptr as usize) % 4 != 0 {
            return Err(EngineError::Misaligned);
        }
        Ok(unsafe { std::slice::from_raw_parts(self.ptr as *const f32, len) })
    }

    /// Raw byte pointer to the start of row `row` for a Q4_0 tensor.
    pub fn q4_0_row_ptr(&self, row: u32) -> Result<*const u8> {
        if self.dtype != DType::Q4_0 {
            return Err(EngineError::InvalidDtype);
        }
        if row >= self.ne[0] {
            return Err(EngineError::InvalidArg("row index out of bounds".to_string()));
        }
        Ok(unsafe { self.ptr.add((row as usize) * (self.nb[0] as usize)) })
    }

    pub fn raw_ptr(&self) -> *const u8 {
        self.ptr
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn f32_strides_match_row_major_rules() {
        let backing = vec![0u8; 4096];
        let view = unsafe {
            create_tensor_view(
                backing.as_ptr(),
                backing.as_ptr(),
                backing.len(),
                DType::F32,
                [8, 16, 1, 1],
                "test",
            )
            .unwrap()
        };
        assert_eq!(view.nb[3], 4);
        assert_eq!(view.nb[2], 4);
        assert_eq!(view.nb[1], 4);
        assert_eq!(view.nb[0], 16 * 4);
    }

    #[test]
    fn q4_0_rejects_non_multiple_of_32() {
        let backing = vec![0u8; 4096];
        let res = unsafe {
            create_tensor_view(
                backing.as_ptr(),
                backing.as_ptr(),
                backing.len(),
                DType::Q4_0,
                [4, 33, 1, 1],
                "bad",
            )
        };
        assert!(res.is_err());
    }

    #[test]
    fn out_of_bounds_tensor_is_rejected() {
        let backing = vec![0u8; 64];
        let res = unsafe {
            create_tensor_view(
                backing.as_ptr(),
                backing.as_ptr(),
                backing.len(),
                DType::F32,
                [100, 100, 1, 1],
                "too_big",
            )
        };
        assert!(res.is_err());
    }
}
