//! SwiGLU feed-forward block.
//!
//! The MLP operates on hidden states shaped `(batch, seq, hidden)` and returns
//! the same layout: `(silu(x @ w1) * (x @ w3)) @ w2`, where `w1` is the gate
//! projection, `w3` the up projection and `w2` the down projection.

use candle_core::{bail, Result, Tensor};

use crate::linear::Linear;

/// Geometry of a gated feed-forward network.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedForwardConfig {
    /// Model hidden size.
    pub hidden_size: usize,
    /// Width of the gated activation space.
    pub intermediate_size: usize,
}

impl FeedForwardConfig {
    pub fn new(hidden_size: usize, intermediate_size: usize) -> Self {
        Self {
            hidden_size,
            intermediate_size,
        }
    }
}

/// SwiGLU MLP with bias-free projections.
#[derive(Debug, Clone)]
pub struct FeedForward {
    config: FeedForwardConfig,
    gate: Linear,
    up: Linear,
    down: Linear,
}

impl FeedForward {
    /// Assembles the block, checking each projection against `config`.
    pub fn new(config: FeedForwardConfig, gate: Linear, up: Linear, down: Linear) -> Result<Self> {
        let (hidden, inter) = (config.hidden_size, config.intermediate_size);
        for (name, proj, want) in [
            ("ffn_gate", &gate, (hidden, inter)),
            ("ffn_up", &up, (hidden, inter)),
            ("ffn_down", &down, (inter, hidden)),
        ] {
            let got = (proj.input_dim(), proj.output_dim());
            if got != want {
                bail!("{name}: expected projection {:?}, got {:?}", want, got);
            }
        }
        Ok(Self {
            config,
            gate,
            up,
            down,
        })
    }

    pub fn config(&self) -> &FeedForwardConfig {
        &self.config
    }

    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        let gated = self.gate.forward(hidden)?.silu()?;
        let up = self.up.forward(hidden)?;
        self.down.forward(&(gated * up)?)
    }
}
