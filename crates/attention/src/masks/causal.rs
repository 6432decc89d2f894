//! Causal masks for incremental decoding.
//!
//! A decode call carrying `seq_len` new tokens on top of `start_pos` cached
//! positions produces a `[seq_len, start_pos + seq_len]` mask. The left block
//! of width `start_pos` is all zero since every new token may see the whole
//! cache; the right `seq_len` block is a strict upper triangle of the dtype
//! minimum.

use candle_core::{DType, Device, Tensor};

use crate::core::AttentionError;

/// Scalar tensor holding the most negative finite value of `dtype`.
pub fn dtype_min(dtype: DType, device: &Device) -> Result<Tensor, AttentionError> {
    let value = match dtype {
        DType::F32 => Tensor::new(f32::MIN, device)?,
        DType::F64 => Tensor::new(f64::MIN, device)?,
        DType::F16 => Tensor::new(half::f16::MIN, device)?,
        DType::BF16 => Tensor::new(half::bf16::MIN, device)?,
        other => {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{other:?} (masks require a float dtype)"),
            })
        }
    };
    Ok(value)
}

/// Build the additive causal mask for `seq_len` queries at offset `start_pos`.
///
/// Entry `(i, j)` is zero iff `j <= start_pos + i`.
pub fn build_causal_mask(
    start_pos: usize,
    seq_len: usize,
    dtype: DType,
    device: &Device,
) -> Result<Tensor, AttentionError> {
    if seq_len == 0 {
        return Err(AttentionError::shape("causal mask requires seq_len > 0"));
    }
    let k_len = start_pos + seq_len;
    let min = dtype_min(dtype, device)?;

    let keep: Vec<u8> = (0..seq_len)
        .flat_map(|i| (0..k_len).map(move |j| u8::from(j <= start_pos + i)))
        .collect();
    let keep = Tensor::from_vec(keep, (seq_len, k_len), device)?;
    let zeros = Tensor::zeros((seq_len, k_len), dtype, device)?;
    let masked = min.broadcast_as((seq_len, k_len))?.contiguous()?;

    Ok(keep.where_cond(&zeros, &masked)?)
}
