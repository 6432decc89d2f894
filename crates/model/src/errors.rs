//! Error type surfaced by model construction and decoding.

use attention::AttentionError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ModelError {
    /// Hyperparameters, dtypes or weights that cannot form a valid model.
    #[error("invalid model configuration: {0}")]
    Config(String),
    /// Inputs or caches whose shapes disagree with the model.
    #[error("shape mismatch: {0}")]
    Shape(String),
    #[error(
        "sequence overflow: start_pos {start_pos} + seq_len {seq_len} exceeds max_seq_len {max_seq_len}"
    )]
    SequenceOverflow {
        start_pos: usize,
        seq_len: usize,
        max_seq_len: usize,
    },
    #[error("missing weight {name}{}", layer_suffix(.layer))]
    MissingWeight { name: String, layer: Option<usize> },
    #[error(transparent)]
    Attention(#[from] AttentionError),
    #[error(transparent)]
    Candle(#[from] candle_core::Error),
    #[error(transparent)]
    Io(#[from] std::io::Error),
    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

fn layer_suffix(layer: &Option<usize>) -> String {
    layer.map(|l| format!(" for layer {l}")).unwrap_or_default()
}

pub type Result<T> = std::result::Result<T, ModelError>;
