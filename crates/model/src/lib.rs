//! Llama decoder assembled from the layers, embedding and attention crates.
//!
//! [`Transformer`] folds a token sequence through every block in order while
//! threading the key/value cache; [`DecodeStep`] turns the last position's
//! logits into the next token. Weights arrive through a [`WeightSource`].

pub mod block;
pub mod config;
pub mod decode;
pub mod errors;
pub mod model;
pub mod weights;

pub use block::TransformerBlock;
pub use config::{HyperParams, RuntimeConfig};
pub use decode::DecodeStep;
pub use errors::ModelError;
pub use model::{KvCache, Transformer};
pub use weights::{GgufWeights, TensorMapWeights, WeightName, WeightSource};
