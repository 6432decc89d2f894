//! Positional encodings.

pub mod rope;

pub use rope::{
    compute_table, invert_rotation, FusedRotary, ReferenceRotary, RopeConfig, RopeKernel,
    RopeTable, RotaryKernel,
};
