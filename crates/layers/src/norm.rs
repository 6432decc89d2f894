//! RMS normalisation as used by Llama-style decoder blocks.
//!
//! Inputs may have any rank; normalisation happens along the last axis while
//! preserving the original layout. The mean-square statistic is promoted to
//! [`PrecisionPolicy::reduction`] before the normalised activations are cast
//! back to the input dtype.
//!
//! The learned scale is held in `f32` regardless of the activation dtype and
//! is cast to the activation dtype just before the final multiply. An `f16`
//! activation stream therefore stays `f16` end to end.

use candle_core::{DType, Result, Tensor, D};

use crate::{checks, dtypes::PrecisionPolicy};

/// Configuration shared by RMS normalisation layers.
#[derive(Debug, Clone, PartialEq)]
pub struct NormConfig {
    /// Size of the hidden dimension being normalised.
    pub hidden_size: usize,
    /// Numeric stabiliser added to the mean square.
    pub epsilon: f64,
}

impl NormConfig {
    /// Creates a configuration using the Llama default epsilon.
    pub fn new(hidden_size: usize) -> Self {
        Self {
            hidden_size,
            epsilon: 1e-5,
        }
    }

    pub fn with_epsilon(mut self, epsilon: f64) -> Self {
        self.epsilon = epsilon;
        self
    }
}

/// Root mean square norm with a learned per-channel scale.
#[derive(Debug, Clone)]
pub struct RmsNorm {
    config: NormConfig,
    weight: Tensor,
}

impl RmsNorm {
    /// Constructs a RMSNorm; the scale is converted to `f32` for storage.
    pub fn new(weight: Tensor, config: NormConfig) -> Result<Self> {
        checks::expect_shape("norm.weight", &weight, &[config.hidden_size])?;
        checks::expect_dtype_in(
            "norm.weight",
            &weight,
            &[DType::F16, DType::BF16, DType::F32, DType::F64],
        )?;
        let weight = weight.to_dtype(DType::F32)?;
        Ok(Self { config, weight })
    }

    pub fn config(&self) -> &NormConfig {
        &self.config
    }

    /// The stored scale, always `f32`.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }

    /// Applies `x * rsqrt(mean(x^2) + eps) * weight` along the last axis.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("norm.input", hidden, self.config.hidden_size)?;
        let policy = PrecisionPolicy::from_activation_dtype(hidden.dtype());

        let compute = policy.cast_for_reduction(hidden)?;
        let mean_sq = compute.sqr()?.mean_keepdim(D::Minus1)?;
        let denom = (mean_sq + self.config.epsilon)?.sqrt()?;
        let normalized = policy.cast_to_storage(&compute.broadcast_div(&denom)?)?;

        let weight = self.weight.to_dtype(normalized.dtype())?;
        normalized.broadcast_mul(&weight)
    }
}
