//! Token embedding lookup.

use candle_core::{bail, DType, Error, Result, Tensor};
use layers::dtypes;

/// Embedding table shaped `(vocab_size, hidden_dim)`.
#[derive(Debug, Clone)]
pub struct TokenEmbedding {
    weight: Tensor,
    vocab_size: usize,
    hidden_dim: usize,
}

impl TokenEmbedding {
    /// Wraps a pre-loaded `(vocab_size, hidden_dim)` table.
    pub fn new(weight: Tensor) -> Result<Self> {
        let (vocab_size, hidden_dim) = match weight.dims() {
            [v, h] => (*v, *h),
            dims => bail!("token embedding expects (vocab, hidden), got {:?}", dims),
        };
        if vocab_size == 0 {
            bail!("token embedding requires vocab_size > 0");
        }
        if hidden_dim == 0 {
            bail!("token embedding requires hidden_dim > 0");
        }
        dtypes::ensure_float("token_embd", weight.dtype())?;
        Ok(Self {
            weight,
            vocab_size,
            hidden_dim,
        })
    }

    pub fn vocab_size(&self) -> usize {
        self.vocab_size
    }

    pub fn hidden_dim(&self) -> usize {
        self.hidden_dim
    }

    pub fn dtype(&self) -> DType {
        self.weight.dtype()
    }

    /// Looks up embeddings for the provided token ids.
    ///
    /// Inputs must be shaped `(batch, seq)` with an integer dtype. Outputs follow
    /// the `(batch, seq, hidden)` layout in the table's dtype.
    pub fn forward(&self, token_ids: &Tensor) -> Result<Tensor> {
        self.validate_token_ids(token_ids)?;
        let dims = token_ids.dims();

        let ids = token_ids.to_dtype(DType::I64)?;
        let flat = ids.flatten_all()?;
        self.ensure_id_range(&flat)?;

        let gathered = self.weight.index_select(&flat, 0)?;
        let mut output_dims = dims.to_vec();
        output_dims.push(self.hidden_dim);
        gathered.reshape(output_dims)
    }

    fn validate_token_ids(&self, token_ids: &Tensor) -> Result<()> {
        match token_ids.dims() {
            [batch, seq] => {
                if *batch == 0 || *seq == 0 {
                    return Err(Error::Msg(
                        "token_ids must have non-zero batch and seq dimensions".into(),
                    ));
                }
            }
            dims => {
                return Err(Error::Msg(format!(
                    "token_ids must be shaped [batch, seq], got {:?}",
                    dims
                )))
            }
        }

        if !token_ids.dtype().is_int() {
            Err(Error::Msg(format!(
                "token_ids expected integer dtype but received {:?}",
                token_ids.dtype()
            )))
        } else {
            Ok(())
        }
    }

    fn ensure_id_range(&self, flat_ids: &Tensor) -> Result<()> {
        let min_id = flat_ids.min_all()?.to_scalar::<i64>()?;
        if min_id < 0 {
            bail!("encountered negative token id {}", min_id);
        }
        let max_id = flat_ids.max_all()?.to_scalar::<i64>()?;
        let vocab = self.vocab_size as i64;
        if max_id >= vocab {
            bail!("token id {} exceeds vocab size {}", max_id, vocab);
        }
        Ok(())
    }
}
