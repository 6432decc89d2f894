//! Grouped-query attention support.

use candle_core::{Result, Tensor};

/// Repeat every key/value head `n_rep` times along the head axis.
///
/// `x` is `[batch, seq_len, n_kv_heads, head_dim]`; the result is
/// `[batch, seq_len, n_kv_heads * n_rep, head_dim]` where the copies of one
/// kv head are adjacent, so query head `h` reads kv head `h / n_rep`.
pub fn repeat_kv(x: &Tensor, n_rep: usize) -> Result<Tensor> {
    if n_rep == 1 {
        return Ok(x.clone());
    }
    let (batch, seq_len, n_kv_heads, head_dim) = x.dims4()?;
    x.unsqueeze(3)?
        .broadcast_as((batch, seq_len, n_kv_heads, n_rep, head_dim))?
        .reshape((batch, seq_len, n_kv_heads * n_rep, head_dim))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn copies_of_a_head_are_adjacent() -> Result<()> {
        let x = Tensor::arange(0f32, 12.0, &Device::Cpu)?.reshape((1, 2, 3, 2))?;
        let repeated = repeat_kv(&x, 2)?;
        assert_eq!(repeated.dims(), &[1, 2, 6, 2]);

        let first_pos = repeated.narrow(1, 0, 1)?.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(
            first_pos,
            vec![0.0, 1.0, 0.0, 1.0, 2.0, 3.0, 2.0, 3.0, 4.0, 5.0, 4.0, 5.0]
        );
        Ok(())
    }

    #[test]
    fn single_repetition_is_identity() -> Result<()> {
        let x = Tensor::arange(0f32, 8.0, &Device::Cpu)?.reshape((1, 1, 2, 4))?;
        let repeated = repeat_kv(&x, 1)?;
        assert_eq!(
            repeated.flatten_all()?.to_vec1::<f32>()?,
            x.flatten_all()?.to_vec1::<f32>()?
        );
        Ok(())
    }
}
