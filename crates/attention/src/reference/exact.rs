//! Reference attention kernel.
//!
//! The exact path mirrors the semantics described by the
//! [`Attention`](crate::core::Attention) trait: scaled dot products, an
//! additive mask, a softmax over the key axis and a weighted sum of values.
//! Half precision inputs are promoted to the compute dtype of the activation
//! precision policy for both matmuls, the softmax runs in the reduction dtype
//! and the output is cast back to the input dtype.

use std::sync::OnceLock;

use candle_core::{DType, Tensor, D};
use candle_nn::ops::{softmax, softmax_last_dim};
use layers::PrecisionPolicy;

use crate::core::{Attention, AttentionError};

/// Numerically stable, portable attention kernel.
#[derive(Debug, Default)]
pub struct ExactAttention {
    first_call: OnceLock<()>,
}

impl ExactAttention {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Attention for ExactAttention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError> {
        let device = q.device();
        if !device.same_device(k.device()) || !device.same_device(v.device()) {
            return Err(AttentionError::shape("q, k, v must reside on the same device"));
        }

        let dtype = q.dtype();
        if dtype != k.dtype() || dtype != v.dtype() {
            return Err(AttentionError::shape(format!(
                "q, k, v must share one dtype, got {:?}/{:?}/{:?}",
                dtype,
                k.dtype(),
                v.dtype()
            )));
        }
        if !layers::dtypes::is_float(dtype) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }

        let (batch, heads, q_len, head_dim) = q.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "q must have shape [batch, heads, seq_len, head_dim], got {:?}",
                q.dims()
            ))
        })?;
        let (kb, kh, k_len, kd) = k.dims4().map_err(|_| {
            AttentionError::shape(format!(
                "k must have shape [batch, heads, seq_len, head_dim], got {:?}",
                k.dims()
            ))
        })?;
        if kb != batch || kh != heads || kd != head_dim || k_len < q_len {
            return Err(AttentionError::shape(format!(
                "k shape mismatch: expected [{batch}, {heads}, >={q_len}, {head_dim}] got {:?}",
                k.dims()
            )));
        }
        if v.dims() != k.dims() {
            return Err(AttentionError::shape(format!(
                "v shape mismatch: expected {:?} got {:?}",
                k.dims(),
                v.dims()
            )));
        }

        if self.first_call.set(()).is_ok() {
            log::info!(
                "attention::reference init dtype={:?} heads={} head_dim={}",
                dtype,
                heads,
                head_dim
            );
        }

        let policy = PrecisionPolicy::from_activation_dtype(dtype);
        let merged = batch * heads;
        let q_view = policy.cast_for_matmul(&q.contiguous()?)?;
        let q_view = q_view.reshape((merged, q_len, head_dim))?;
        let k_view = policy.cast_for_matmul(&k.contiguous()?)?;
        let k_view = k_view.reshape((merged, k_len, head_dim))?;
        let v_view = policy.cast_for_matmul(&v.contiguous()?)?;
        let v_view = v_view.reshape((merged, k_len, head_dim))?;

        let scale = 1.0 / (head_dim as f64).sqrt();
        let scores = q_view.matmul(&k_view.t()?)?.affine(scale, 0.0)?;
        let mut scores = scores.reshape((batch, heads, q_len, k_len))?;

        if let Some(mask) = mask {
            if !device.same_device(mask.device()) {
                return Err(AttentionError::shape(
                    "mask must reside on the same device as q",
                ));
            }
            if mask.dims() != [q_len, k_len] {
                return Err(AttentionError::shape(format!(
                    "mask shape mismatch: expected [{q_len}, {k_len}] got {:?}",
                    mask.dims()
                )));
            }
            if mask.dtype() != dtype {
                return Err(AttentionError::UnsupportedDType {
                    requested: format!("mask dtype {:?} for {dtype:?} scores", mask.dtype()),
                });
            }
            scores = scores.broadcast_add(&policy.cast_for_matmul(mask)?)?;
        }

        let scores = policy.cast_for_reduction(&scores)?;
        let probs = match scores.dtype() {
            DType::F64 => softmax(&scores, D::Minus1)?,
            _ => softmax_last_dim(&scores)?,
        };
        let probs = policy
            .cast_for_matmul(&probs)?
            .reshape((merged, q_len, k_len))?;

        let output = probs.matmul(&v_view)?;
        let output = policy.cast_to_storage(&output)?;
        Ok(output.reshape((batch, heads, q_len, head_dim))?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::masks::build_causal_mask;
    use candle_core::{Device, Result as CandleResult};

    fn build_inputs(device: &Device) -> CandleResult<(Tensor, Tensor, Tensor)> {
        let data: Vec<f32> = (0..64).map(|i| (i as f32) * 0.01).collect();
        let q = Tensor::from_vec(data.clone(), (1, 2, 4, 8), device)?;
        let reversed: Vec<f32> = data.iter().rev().copied().collect();
        let k = Tensor::from_vec(reversed, (1, 2, 4, 8), device)?;
        let v = Tensor::from_vec(data, (1, 2, 4, 8), device)?;
        Ok((q, k, v))
    }

    fn naive_attention(
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> CandleResult<Tensor> {
        let (batch, heads, q_len, head_dim) = q.dims4()?;
        let (_, _, k_len, _) = k.dims4()?;
        let mut output = vec![0f32; batch * heads * q_len * head_dim];

        let q_vec = q.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let k_vec = k.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let v_vec = v.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
        let mask_vec = match mask {
            Some(m) => Some(m.to_dtype(DType::F32)?.flatten_all()?.to_vec1::<f32>()?),
            None => None,
        };
        let scale = 1.0 / (head_dim as f32).sqrt();

        for bh in 0..batch * heads {
            for q_idx in 0..q_len {
                let mut row = vec![0f32; k_len];
                let mut max_val = f32::NEG_INFINITY;
                for (k_idx, slot) in row.iter_mut().enumerate() {
                    let mut dot = 0f32;
                    for d in 0..head_dim {
                        dot += q_vec[(bh * q_len + q_idx) * head_dim + d]
                            * k_vec[(bh * k_len + k_idx) * head_dim + d];
                    }
                    dot *= scale;
                    if let Some(mask_vec) = &mask_vec {
                        dot += mask_vec[q_idx * k_len + k_idx];
                    }
                    *slot = dot;
                    max_val = max_val.max(dot);
                }
                let mut denom = 0f32;
                for val in row.iter_mut() {
                    *val = (*val - max_val).exp();
                    denom += *val;
                }
                for d in 0..head_dim {
                    let mut acc = 0f32;
                    for (k_idx, weight) in row.iter().enumerate() {
                        acc += weight / denom * v_vec[(bh * k_len + k_idx) * head_dim + d];
                    }
                    output[(bh * q_len + q_idx) * head_dim + d] = acc;
                }
            }
        }

        Tensor::from_vec(output, (batch, heads, q_len, head_dim), q.device())
    }

    fn max_diff(a: &Tensor, b: &Tensor) -> CandleResult<f32> {
        a.to_dtype(DType::F32)?
            .sub(&b.to_dtype(DType::F32)?)?
            .abs()?
            .max_all()?
            .to_vec0::<f32>()
    }

    #[test]
    fn exact_attention_matches_naive() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let mask = build_causal_mask(0, 4, DType::F32, &device).unwrap();
        let output = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask))
            .unwrap();
        let expected = naive_attention(&q, &k, &v, Some(&mask))?;
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn prefix_keys_are_visible_to_every_query() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::randn(0f32, 1.0, (1, 2, 2, 8), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &device)?;
        let v = Tensor::randn(0f32, 1.0, (1, 2, 5, 8), &device)?;
        let mask = build_causal_mask(3, 2, DType::F32, &device).unwrap();
        let output = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask))
            .unwrap();
        let expected = naive_attention(&q, &k, &v, Some(&mask))?;
        assert_eq!(output.dims(), &[1, 2, 2, 8]);
        assert!(max_diff(&output, &expected)? < 1e-4);
        Ok(())
    }

    #[test]
    fn mismatched_shapes_error() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 5, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let err = ExactAttention::new().attend(&q, &k, &v, None).unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn mask_shape_validation() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let k = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let v = Tensor::zeros((1, 2, 4, 8), DType::F32, &device).unwrap();
        let mask = Tensor::zeros((3, 4), DType::F32, &device).unwrap();
        let err = ExactAttention::new()
            .attend(&q, &k, &v, Some(&mask))
            .unwrap_err();
        assert!(matches!(err, AttentionError::InvalidShape { .. }));
    }

    #[test]
    fn integer_inputs_are_rejected() {
        let device = Device::Cpu;
        let q = Tensor::zeros((1, 1, 2, 2), DType::U32, &device).unwrap();
        let err = ExactAttention::new().attend(&q, &q, &q, None).unwrap_err();
        assert!(matches!(err, AttentionError::UnsupportedDType { .. }));
    }

    #[test]
    fn dtype_matrix() -> CandleResult<()> {
        let device = Device::Cpu;
        let (q, k, v) = build_inputs(&device)?;
        let reference = {
            let mask = build_causal_mask(0, 4, DType::F32, &device).unwrap();
            ExactAttention::new()
                .attend(&q, &k, &v, Some(&mask))
                .unwrap()
        };
        for dtype in [DType::F64, DType::BF16, DType::F16] {
            let mask = build_causal_mask(0, 4, dtype, &device).unwrap();
            let out = ExactAttention::new()
                .attend(
                    &q.to_dtype(dtype)?,
                    &k.to_dtype(dtype)?,
                    &v.to_dtype(dtype)?,
                    Some(&mask),
                )
                .unwrap();
            assert_eq!(out.dtype(), dtype);
            let max = max_diff(&out, &reference)?;
            assert!(max < 5e-2, "dtype {:?} diverged by {max}", dtype);
        }
        Ok(())
    }

    #[test]
    fn numerical_stability() -> CandleResult<()> {
        let device = Device::Cpu;
        let q = Tensor::full(10_000.0f32, (1, 1, 4, 4), &device)?;
        let k = Tensor::full(-10_000.0f32, (1, 1, 4, 4), &device)?;
        let v = Tensor::ones((1, 1, 4, 4), DType::F32, &device)?;
        let out = ExactAttention::new()
            .attend(&q, &k, &v, None)
            .unwrap()
            .flatten_all()?
            .to_vec1::<f32>()?;
        assert!(out.iter().all(|value| value.is_finite()));
        Ok(())
    }
}
