//! Integration with the rotary kernels from the embedding crate.
//!
//! The adapter holds the configured [`RotaryKernel`] and applies it to query
//! and key projections laid out as `[batch, seq_len, heads, head_dim]`. Values
//! are never rotated.

use std::sync::Arc;

use candle_core::{Result, Tensor};
use embedding::positional::rope::{RopeKernel, RotaryKernel};

/// Adapter that bridges attention with the positional embedding crate.
#[derive(Debug, Clone)]
pub struct RopeAdapter {
    kernel: Arc<dyn RotaryKernel>,
}

impl RopeAdapter {
    pub fn new(kernel: Arc<dyn RotaryKernel>) -> Self {
        Self { kernel }
    }

    pub fn from_kind(kind: RopeKernel) -> Self {
        Self::new(kind.build())
    }

    pub fn kernel_name(&self) -> &'static str {
        self.kernel.name()
    }

    /// Rotate `q` and `k` by the `[seq_len, head_dim/2, 2]` slice `freqs`.
    pub fn apply(&self, q: &Tensor, k: &Tensor, freqs: &Tensor) -> Result<(Tensor, Tensor)> {
        let q_rot = self.kernel.apply(q, freqs)?;
        let k_rot = self.kernel.apply(k, freqs)?;
        Ok((q_rot, k_rot))
    }
}

impl Default for RopeAdapter {
    fn default() -> Self {
        Self::from_kind(RopeKernel::default())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::{DType, Device};
    use embedding::positional::rope::compute_table;

    fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
        a.sub(b)?.abs()?.max_all()?.to_dtype(DType::F32)?.to_vec0::<f32>()
    }

    #[test]
    fn adapters_agree_across_kernels() -> Result<()> {
        let device = Device::Cpu;
        let freqs = compute_table(8, 8, 10_000.0, &device)?.narrow(0, 4, 3)?;
        let q = Tensor::randn(0f32, 1.0, (1, 3, 4, 8), &device)?;
        let k = Tensor::randn(0f32, 1.0, (1, 3, 2, 8), &device)?;

        let reference = RopeAdapter::from_kind(RopeKernel::Reference);
        let fused = RopeAdapter::from_kind(RopeKernel::Fused);
        assert_eq!(reference.kernel_name(), "reference");

        let (rq, rk) = reference.apply(&q, &k, &freqs)?;
        let (fq, fk) = fused.apply(&q, &k, &freqs)?;
        assert_eq!(rk.dims(), &[1, 3, 2, 8]);
        assert!(max_diff(&rq, &fq)? < 1e-5);
        assert!(max_diff(&rk, &fk)? < 1e-5);
        Ok(())
    }
}
