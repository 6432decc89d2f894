//! Causal self-attention for the Llama decoder.
//!
//! Attention kernels operate on tensors with layout
//! `[batch, n_heads, seq_len, head_dim]`; the self-attention module projects
//! `(batch, seq, hidden)` activations into that layout, rotates queries and
//! keys, extends the per-layer key/value cache slice with the new positions
//! and applies an additive causal mask before the softmax.
//!
//! Key/value caches use the decoder layout
//! `(cache_len, n_layers, batch, n_kv_heads, head_dim)`; the [`kv_cache`]
//! module holds the helpers for slicing one layer out of it and for appending
//! fresh projections. Caches are never mutated in place: every helper returns
//! a new tensor.
//!
//! Grouped-query attention is supported: when `n_kv_heads < n_heads`, each
//! key/value head is repeated `n_heads / n_kv_heads` times before the dot
//! product.

pub mod core;
pub mod gqa;
pub mod interop;
pub mod kv_cache;
pub mod masks;
pub mod reference;
pub mod self_attention;

pub use crate::core::{Attention, AttentionConfig, AttentionError};
pub use gqa::repeat_kv;
pub use interop::RopeAdapter;
pub use kv_cache::CacheLayout;
pub use masks::build_causal_mask;
pub use self_attention::CausalSelfAttention;
