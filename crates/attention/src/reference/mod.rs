//! Portable, exact implementations of scaled dot-product attention.
//!
//! These paths favour clarity over absolute performance.

pub mod exact;

pub use exact::ExactAttention;
