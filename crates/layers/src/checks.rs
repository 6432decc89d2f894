//! Lightweight validation helpers shared across layer components.
//!
//! These routines provide concise shape and dtype assertions that can be wired
//! into constructors or forward paths. They return `candle_core::Result<()>`
//! so call sites can propagate errors without panicking.

use candle_core::{DType, Error, Result, Tensor};

/// Ensures a tensor matches the expected dimensions exactly.
pub fn expect_shape(context: &str, tensor: &Tensor, expected: &[usize]) -> Result<()> {
    let actual = tensor.dims();
    if actual == expected {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected shape {:?}, got {:?}",
            expected, actual
        )))
    }
}

/// Validates a `(.., hidden)` layout where only the trailing axis is known.
pub fn expect_last_dim(context: &str, tensor: &Tensor, hidden: usize) -> Result<()> {
    match tensor.dims().last() {
        Some(&last) if last == hidden => Ok(()),
        _ => Err(Error::Msg(format!(
            "{context}: expected trailing dimension {}, got {:?}",
            hidden,
            tensor.dims()
        ))),
    }
}

/// Checks the tensor dtype is one of the allowed values.
pub fn expect_dtype_in(context: &str, tensor: &Tensor, allowed: &[DType]) -> Result<()> {
    let dtype = tensor.dtype();
    if allowed.contains(&dtype) {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: expected dtype in {:?}, got {:?}",
            allowed, dtype
        )))
    }
}

/// Checks two tensors share a dtype before they meet in a matmul or add.
pub fn expect_same_dtype(context: &str, lhs: &Tensor, rhs: &Tensor) -> Result<()> {
    if lhs.dtype() == rhs.dtype() {
        Ok(())
    } else {
        Err(Error::Msg(format!(
            "{context}: dtype mismatch {:?} vs {:?}",
            lhs.dtype(),
            rhs.dtype()
        )))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn shape_errors_name_the_context() -> Result<()> {
        let t = Tensor::zeros((2, 3), DType::F32, &Device::Cpu)?;
        expect_shape("w", &t, &[2, 3])?;
        let err = expect_shape("attn_q", &t, &[3, 2]).unwrap_err();
        assert!(err.to_string().contains("attn_q"));
        assert!(expect_last_dim("x", &t, 3).is_ok());
        assert!(expect_last_dim("x", &t, 2).is_err());
        Ok(())
    }

    #[test]
    fn dtype_checks() -> Result<()> {
        let a = Tensor::zeros(4, DType::F32, &Device::Cpu)?;
        let b = Tensor::zeros(4, DType::F16, &Device::Cpu)?;
        assert!(expect_dtype_in("a", &a, &[DType::F32]).is_ok());
        assert!(expect_dtype_in("b", &b, &[DType::F32]).is_err());
        assert!(expect_same_dtype("ab", &a, &b).is_err());
        Ok(())
    }
}
