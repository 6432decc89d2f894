//! Greedy next-token selection on top of [`Transformer`].

use candle_core::{DType, Tensor, D};

use crate::errors::Result;
use crate::model::{KvCache, Transformer};

/// One greedy decode step: run the model and take the argmax of the last
/// position's logits.
#[derive(Debug)]
pub struct DecodeStep {
    model: Transformer,
}

impl DecodeStep {
    pub fn new(model: Transformer) -> Self {
        Self { model }
    }

    pub fn model(&self) -> &Transformer {
        &self.model
    }

    /// Returns the next token as an `I64 [1, 1]` tensor and the extended
    /// caches.
    pub fn build(
        &self,
        tokens: &Tensor,
        k_cache: &Tensor,
        v_cache: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let (logits, k_cache, v_cache) = self.model.forward(tokens, k_cache, v_cache)?;
        let seq_len = logits.dim(1)?;
        let last = logits.narrow(1, seq_len - 1, 1)?.squeeze(1)?;
        let next = last.argmax_keepdim(D::Minus1)?.to_dtype(DType::I64)?;

        if log::log_enabled!(log::Level::Debug) {
            let token = next.flatten_all()?.to_vec1::<i64>()?;
            log::debug!(
                "decode start_pos={} seq_len={} next={:?}",
                k_cache.dim(0)? - seq_len,
                seq_len,
                token
            );
        }
        Ok((next, k_cache, v_cache))
    }

    /// Same as [`DecodeStep::build`] with the caches carried as a [`KvCache`].
    pub fn step(&self, tokens: &Tensor, cache: KvCache) -> Result<(Tensor, KvCache)> {
        let (keys, values) = cache.into_parts();
        let (next, keys, values) = self.build(tokens, &keys, &values)?;
        Ok((next, KvCache::new(keys, values)))
    }
}
