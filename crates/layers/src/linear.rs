//! Bias-free projection used for every dense weight in the decoder.
//!
//! Weights are stored pre-transposed as `(input_dim, output_dim)` so the
//! forward pass is a plain right-multiplication `hidden @ weight`. Inputs may
//! carry any number of leading axes; they are flattened to rows for the matmul
//! and restored afterwards, so `(batch, seq, in)` maps to `(batch, seq, out)`.
//! Half precision inputs are multiplied in the policy's compute dtype and the
//! result is cast back, so the output always carries the input dtype.

use candle_core::{bail, Result, Tensor};

use crate::{checks, dtypes, PrecisionPolicy};

/// Dense projection `hidden @ weight` without bias.
#[derive(Debug, Clone)]
pub struct Linear {
    weight: Tensor,
    input_dim: usize,
    output_dim: usize,
}

impl Linear {
    /// Wraps a `(input_dim, output_dim)` weight.
    pub fn new(weight: Tensor) -> Result<Self> {
        let (input_dim, output_dim) = match weight.dims() {
            [i, o] => (*i, *o),
            dims => bail!("linear weight must be rank 2 (in, out), got {:?}", dims),
        };
        dtypes::ensure_float("linear.weight", weight.dtype())?;
        Ok(Self {
            weight,
            input_dim,
            output_dim,
        })
    }

    /// Wraps a weight after checking it matches the expected geometry.
    pub fn with_shape(
        context: &str,
        weight: Tensor,
        input_dim: usize,
        output_dim: usize,
    ) -> Result<Self> {
        checks::expect_shape(context, &weight, &[input_dim, output_dim])?;
        Self::new(weight)
    }

    pub fn input_dim(&self) -> usize {
        self.input_dim
    }

    pub fn output_dim(&self) -> usize {
        self.output_dim
    }

    /// Returns a clone of the underlying weight tensor.
    pub fn weight(&self) -> Tensor {
        self.weight.clone()
    }

    /// Applies the projection over the trailing axis of `hidden`.
    pub fn forward(&self, hidden: &Tensor) -> Result<Tensor> {
        checks::expect_last_dim("linear.input", hidden, self.input_dim)?;
        checks::expect_same_dtype("linear", hidden, &self.weight)?;

        let dims = hidden.dims();
        let rows = hidden.elem_count() / self.input_dim;
        let policy = PrecisionPolicy::from_activation_dtype(hidden.dtype());
        let flat = policy.cast_for_matmul(&hidden.reshape((rows, self.input_dim))?)?;
        let projected = flat.matmul(&policy.cast_for_matmul(&self.weight)?)?;

        let mut out_dims = dims[..dims.len() - 1].to_vec();
        out_dims.push(self.output_dim);
        policy.cast_to_storage(&projected)?.reshape(out_dims)
    }
}
