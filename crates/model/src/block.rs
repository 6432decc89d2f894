use attention::{CausalSelfAttention, RopeAdapter};
use candle_core::{DType, Tensor};
use layers::{FeedForward, FeedForwardConfig, Linear, NormConfig, RmsNorm};

use crate::config::HyperParams;
use crate::errors::{ModelError, Result};
use crate::weights::{WeightName, WeightSource};

/// Pre-norm decoder layer: attention then SwiGLU, each behind a residual.
#[derive(Debug)]
pub struct TransformerBlock {
    attention_norm: RmsNorm,
    attention: CausalSelfAttention,
    ffn_norm: RmsNorm,
    feed_forward: FeedForward,
}

impl TransformerBlock {
    pub fn new(
        attention_norm: RmsNorm,
        attention: CausalSelfAttention,
        ffn_norm: RmsNorm,
        feed_forward: FeedForward,
    ) -> Self {
        Self {
            attention_norm,
            attention,
            ffn_norm,
            feed_forward,
        }
    }

    /// Build layer `layer` from `source`, checking every weight's geometry.
    pub fn load(
        layer: usize,
        params: &HyperParams,
        source: &dyn WeightSource,
        dtype: DType,
        rope: RopeAdapter,
    ) -> Result<Self> {
        let at = Some(layer);
        let attn = params.attention_config();
        let projection = |name: WeightName, rows: usize, cols: usize| -> Result<Linear> {
            let weight = source.get(name, at, dtype)?;
            let context = format!("blk.{layer}.{name}");
            Linear::with_shape(&context, weight, rows, cols)
                .map_err(|e| ModelError::Config(e.to_string()))
        };
        let norm = |name: WeightName| -> Result<RmsNorm> {
            let weight = source.get(name, at, DType::F32)?;
            RmsNorm::new(
                weight,
                NormConfig::new(params.dims).with_epsilon(params.norm_eps),
            )
            .map_err(|e| ModelError::Config(format!("blk.{layer}.{name}: {e}")))
        };

        let attention = CausalSelfAttention::new(
            attn.clone(),
            projection(WeightName::AttnQ, params.dims, attn.q_dim())?,
            projection(WeightName::AttnK, params.dims, attn.kv_dim())?,
            projection(WeightName::AttnV, params.dims, attn.kv_dim())?,
            projection(WeightName::AttnOutput, attn.q_dim(), params.dims)?,
            rope,
        )?;
        let feed_forward = FeedForward::new(
            FeedForwardConfig::new(params.dims, params.ffn_dim),
            projection(WeightName::FfnGate, params.dims, params.ffn_dim)?,
            projection(WeightName::FfnUp, params.dims, params.ffn_dim)?,
            projection(WeightName::FfnDown, params.ffn_dim, params.dims)?,
        )
        .map_err(|e| ModelError::Config(e.to_string()))?;

        Ok(Self::new(
            norm(WeightName::AttnNorm)?,
            attention,
            norm(WeightName::FfnNorm)?,
            feed_forward,
        ))
    }

    pub fn attention(&self) -> &CausalSelfAttention {
        &self.attention
    }

    /// `h = x + attn(norm(x))`, `out = h + ffn(norm(h))`.
    ///
    /// Returns the block output together with this layer's new keys/values in
    /// cache layout.
    pub fn forward(
        &self,
        input: &Tensor,
        start_pos: usize,
        freqs: &Tensor,
        k_cache: &Tensor,
        v_cache: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor)> {
        let normed = self.attention_norm.forward(input)?;
        let (attended, new_k, new_v) = self
            .attention
            .forward(&normed, start_pos, freqs, k_cache, v_cache)?;
        let hidden = (input + attended)?;

        let normed = self.ffn_norm.forward(&hidden)?;
        let output = (&hidden + self.feed_forward.forward(&normed)?)?;
        Ok((output, new_k, new_v))
    }
}
