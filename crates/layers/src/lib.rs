//! Building blocks for transformer layers.
//!
//! This crate hosts the projection, normalisation and gated feed-forward
//! components used by Llama-style decoder blocks, assembled from Candle
//! primitives. Everything here is stateless apart from read-only weights.

pub mod checks;
pub mod dtypes;
pub mod linear;
pub mod mlp;
pub mod norm;

pub use dtypes::PrecisionPolicy;
pub use linear::Linear;
pub use mlp::{FeedForward, FeedForwardConfig};
pub use norm::{NormConfig, RmsNorm};
