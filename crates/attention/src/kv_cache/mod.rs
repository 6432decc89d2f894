//! Helpers for the decoder key/value cache layout.
//!
//! A cache tensor is laid out as `(cache_len, n_layers, batch, n_kv_heads,
//! head_dim)`. Each layer reads its own slice along axis 1 and contributes the
//! projections for the new positions; the decoder stacks those per-layer
//! updates and appends them along the time axis. Every helper returns a new
//! tensor and leaves its inputs untouched.

pub mod layout;

pub use layout::CacheLayout;

use candle_core::Tensor;

use crate::core::AttentionError;

/// Slice one layer out of a cache: `(cache_len, batch, n_kv_heads, head_dim)`.
pub fn layer_slice(cache: &Tensor, layer: usize) -> Result<Tensor, AttentionError> {
    Ok(cache.narrow(1, layer, 1)?.squeeze(1)?)
}

/// Convert `(batch, seq, n_kv_heads, head_dim)` projections to cache rows
/// `(seq, batch, n_kv_heads, head_dim)`.
pub fn to_cache_rows(projected: &Tensor) -> Result<Tensor, AttentionError> {
    Ok(projected.transpose(0, 1)?.contiguous()?)
}

/// Extend a layer slice with fresh projections along the sequence axis,
/// returning `(batch, cache_len + seq, n_kv_heads, head_dim)`.
pub fn extend_with(slice: &Tensor, projected: &Tensor) -> Result<Tensor, AttentionError> {
    if slice.dim(0)? == 0 {
        return Ok(projected.clone());
    }
    let past = slice.transpose(0, 1)?;
    Ok(Tensor::cat(&[&past, projected], 1)?)
}

/// Stack per-layer cache rows in layer order into
/// `(seq, n_layers, batch, n_kv_heads, head_dim)`.
pub fn stack_layers(rows: &[Tensor]) -> Result<Tensor, AttentionError> {
    if rows.is_empty() {
        return Err(AttentionError::shape("cannot stack an empty set of layer updates"));
    }
    Ok(Tensor::stack(rows, 1)?)
}

/// Append stacked updates to a cache along the time axis.
pub fn append(cache: &Tensor, update: &Tensor) -> Result<Tensor, AttentionError> {
    if cache.dim(0)? == 0 {
        return Ok(update.clone());
    }
    Ok(Tensor::cat(&[cache, update], 0)?)
}
