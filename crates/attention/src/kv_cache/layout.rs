//! Layout definitions for key/value caches.

use candle_core::{DType, Device, Tensor};

use crate::core::AttentionError;

/// Declarative description of the trailing cache axes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheLayout {
    /// Number of decoder layers sharing the cache tensor.
    pub n_layers: usize,
    /// Batch size (the decoder runs a single sequence).
    pub batch: usize,
    /// Number of key/value heads stored per layer.
    pub n_kv_heads: usize,
    /// Dimensionality of each head.
    pub head_dim: usize,
}

impl CacheLayout {
    pub fn new(n_layers: usize, batch: usize, n_kv_heads: usize, head_dim: usize) -> Self {
        Self {
            n_layers,
            batch,
            n_kv_heads,
            head_dim,
        }
    }

    /// Full cache shape for `cache_len` positions.
    pub fn shape(&self, cache_len: usize) -> [usize; 5] {
        [
            cache_len,
            self.n_layers,
            self.batch,
            self.n_kv_heads,
            self.head_dim,
        ]
    }

    /// A zero-length cache.
    pub fn empty(&self, dtype: DType, device: &Device) -> candle_core::Result<Tensor> {
        Tensor::zeros(self.shape(0).to_vec(), dtype, device)
    }

    /// Check `cache` follows this layout and return its length.
    pub fn validate(&self, name: &str, cache: &Tensor) -> Result<usize, AttentionError> {
        match cache.dims() {
            [len, rest @ ..] if rest == &self.shape(0)[1..] => Ok(*len),
            dims => Err(AttentionError::shape(format!(
                "{name}: expected (cache_len, {}, {}, {}, {}), got {:?}",
                self.n_layers, self.batch, self.n_kv_heads, self.head_dim, dims
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn validate_reports_offending_shape() -> candle_core::Result<()> {
        let layout = CacheLayout::new(2, 1, 4, 8);
        let good = Tensor::zeros((5, 2, 1, 4, 8), DType::F32, &Device::Cpu)?;
        assert_eq!(layout.validate("k_cache", &good).unwrap(), 5);

        let bad = Tensor::zeros((5, 2, 1, 2, 8), DType::F32, &Device::Cpu)?;
        let err = layout.validate("k_cache", &bad).unwrap_err();
        assert!(err.to_string().contains("k_cache"));
        assert!(err.to_string().contains("[5, 2, 1, 2, 8]"));
        Ok(())
    }
}
