//! Core traits and types shared across attention implementations.
//!
//! Kernels are expected to operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`. The output tensor mirrors the query
//! layout and dtype.

pub mod config;
pub mod errors;

use candle_core::Tensor;

pub use config::AttentionConfig;
pub use errors::AttentionError;

/// Unified interface for scaled dot-product attention kernels.
///
/// * `q` is `[batch, n_heads, q_len, head_dim]`; `k` and `v` are
///   `[batch, n_heads, k_len, head_dim]` with `k_len >= q_len`.
/// * Masks, when present, are additive and shaped `[q_len, k_len]`, broadcast
///   over batch and heads.
/// * The returned tensor mirrors the layout and dtype of `q`.
pub trait Attention {
    fn attend(
        &self,
        q: &Tensor,
        k: &Tensor,
        v: &Tensor,
        mask: Option<&Tensor>,
    ) -> Result<Tensor, AttentionError>;
}
