//! Embedding crate
//!
//! Token lookup tables and rotary positional embeddings. The positional module
//! owns the RoPE frequency table and the interchangeable rotation kernels.

pub mod positional;
pub mod token;

pub use positional::*;
pub use token::*;
