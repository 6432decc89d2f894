//! Causal self-attention with rotary embeddings and an incremental cache.

use candle_core::{DType, Tensor};
use layers::{dtypes, Linear};

use crate::core::{Attention, AttentionConfig, AttentionError};
use crate::gqa::repeat_kv;
use crate::interop::RopeAdapter;
use crate::kv_cache;
use crate::masks::build_causal_mask;
use crate::reference::ExactAttention;

/// One attention layer of the decoder.
///
/// Projection weights are `(in, out)`: `wq` is `(hidden, n_heads*head_dim)`,
/// `wk`/`wv` are `(hidden, n_kv_heads*head_dim)` and `wo` is
/// `(n_heads*head_dim, hidden)`.
#[derive(Debug)]
pub struct CausalSelfAttention {
    config: AttentionConfig,
    wq: Linear,
    wk: Linear,
    wv: Linear,
    wo: Linear,
    rope: RopeAdapter,
    kernel: ExactAttention,
}

impl CausalSelfAttention {
    pub fn new(
        config: AttentionConfig,
        wq: Linear,
        wk: Linear,
        wv: Linear,
        wo: Linear,
        rope: RopeAdapter,
    ) -> Result<Self, AttentionError> {
        config.validate()?;
        let hidden = config.hidden_dim;
        for (name, linear, expected) in [
            ("attn_q", &wq, (hidden, config.q_dim())),
            ("attn_k", &wk, (hidden, config.kv_dim())),
            ("attn_v", &wv, (hidden, config.kv_dim())),
            ("attn_output", &wo, (config.q_dim(), hidden)),
        ] {
            let actual = (linear.input_dim(), linear.output_dim());
            if actual != expected {
                return Err(AttentionError::Config(format!(
                    "{name} weight expected {:?}, got {:?}",
                    expected, actual
                )));
            }
        }

        let dtype = wq.weight().dtype();
        if [&wk, &wv, &wo].iter().any(|w| w.weight().dtype() != dtype) {
            return Err(AttentionError::Config(
                "attention projections must share one dtype".to_string(),
            ));
        }

        Ok(Self {
            config,
            wq,
            wk,
            wv,
            wo,
            rope,
            kernel: ExactAttention::new(),
        })
    }

    pub fn config(&self) -> &AttentionConfig {
        &self.config
    }

    pub fn dtype(&self) -> DType {
        self.wq.weight().dtype()
    }

    pub fn rope_kernel_name(&self) -> &'static str {
        self.rope.kernel_name()
    }

    /// Attend `input` over the cached positions plus itself.
    ///
    /// * `input`: `(batch, seq_len, hidden)` in the weight dtype.
    /// * `freqs`: RoPE rows for `[start_pos, start_pos + seq_len)`.
    /// * `k_cache`, `v_cache`: this layer's slice `(start_pos, batch,
    ///   n_kv_heads, head_dim)`.
    ///
    /// Returns the projected output `(batch, seq_len, hidden)` and the new
    /// keys/values in cache layout `(seq_len, batch, n_kv_heads, head_dim)`.
    pub fn forward(
        &self,
        input: &Tensor,
        start_pos: usize,
        freqs: &Tensor,
        k_cache: &Tensor,
        v_cache: &Tensor,
    ) -> Result<(Tensor, Tensor, Tensor), AttentionError> {
        let cfg = &self.config;
        let (batch, seq_len, hidden) = input.dims3().map_err(|_| {
            AttentionError::shape(format!(
                "attention input must be (batch, seq_len, hidden), got {:?}",
                input.dims()
            ))
        })?;
        if hidden != cfg.hidden_dim || seq_len == 0 {
            return Err(AttentionError::shape(format!(
                "attention input expected (batch, seq_len > 0, {}), got {:?}",
                cfg.hidden_dim,
                input.dims()
            )));
        }
        let dtype = input.dtype();
        if !dtypes::is_float(dtype) {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{dtype:?}"),
            });
        }
        self.check_cache_slice("k_cache", k_cache, start_pos, batch, dtype)?;
        self.check_cache_slice("v_cache", v_cache, start_pos, batch, dtype)?;

        let xq = self
            .wq
            .forward(input)?
            .reshape((batch, seq_len, cfg.n_heads, cfg.head_dim))?;
        let xk = self
            .wk
            .forward(input)?
            .reshape((batch, seq_len, cfg.n_kv_heads, cfg.head_dim))?;
        let xv = self
            .wv
            .forward(input)?
            .reshape((batch, seq_len, cfg.n_kv_heads, cfg.head_dim))?;

        let (xq, xk) = self.rope.apply(&xq, &xk, freqs)?;

        let new_k = kv_cache::to_cache_rows(&xk)?;
        let new_v = kv_cache::to_cache_rows(&xv)?;

        let keys = kv_cache::extend_with(k_cache, &xk)?;
        let values = kv_cache::extend_with(v_cache, &xv)?;
        let keys = repeat_kv(&keys, cfg.n_rep())?;
        let values = repeat_kv(&values, cfg.n_rep())?;

        let q = xq.transpose(1, 2)?.contiguous()?;
        let k = keys.transpose(1, 2)?.contiguous()?;
        let v = values.transpose(1, 2)?.contiguous()?;

        let mask = build_causal_mask(start_pos, seq_len, dtype, input.device())?;
        let attended = self.kernel.attend(&q, &k, &v, Some(&mask))?;

        let merged = attended
            .transpose(1, 2)?
            .reshape((batch, seq_len, cfg.q_dim()))?;
        let output = self.wo.forward(&merged)?;

        log::debug!(
            "attention start_pos={} seq_len={} kv_len={}",
            start_pos,
            seq_len,
            start_pos + seq_len
        );

        Ok((output, new_k, new_v))
    }

    fn check_cache_slice(
        &self,
        name: &str,
        slice: &Tensor,
        start_pos: usize,
        batch: usize,
        dtype: DType,
    ) -> Result<(), AttentionError> {
        let expected = [start_pos, batch, self.config.n_kv_heads, self.config.head_dim];
        if slice.dims() != expected {
            return Err(AttentionError::shape(format!(
                "{name} slice expected {:?}, got {:?}",
                expected,
                slice.dims()
            )));
        }
        if slice.dtype() != dtype {
            return Err(AttentionError::UnsupportedDType {
                requested: format!("{name} dtype {:?} for {dtype:?} activations", slice.dtype()),
            });
        }
        Ok(())
    }
}
