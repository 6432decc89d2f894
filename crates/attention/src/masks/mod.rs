//! Additive attention masks.
//!
//! Masks are shaped `[q_len, k_len]` in the activation dtype. Entries are `0`
//! where attention is permitted and the most negative finite value of the
//! dtype otherwise, so adding them to scores before the softmax drives the
//! masked probabilities to zero without branching inside the kernel.

pub mod causal;

pub use causal::{build_causal_mask, dtype_min};
