//! Precision and dtype policy utilities used throughout the layers crate.
//!
//! Activations flow through the decoder in the model dtype (`f16`, `bf16`,
//! `f32` or `f64`). Statistics such as the RMS of a hidden state are promoted
//! to at least `f32` before reducing and cast back afterwards, so a reduced
//! precision stream is never silently upcast for the rest of the block.

use candle_core::{bail, DType, Result, Tensor};

/// Floating point dtypes the decoder can run in.
pub const FLOAT_DTYPES: [DType; 4] = [DType::F16, DType::BF16, DType::F32, DType::F64];

/// Returns `true` for dtypes the decoder accepts as activation/weight types.
pub fn is_float(dtype: DType) -> bool {
    FLOAT_DTYPES.contains(&dtype)
}

/// Rejects integer and unsigned dtypes at construction time.
pub fn ensure_float(context: &str, dtype: DType) -> Result<()> {
    if !is_float(dtype) {
        bail!("{context}: dtype {dtype:?} is not a floating point type");
    }
    Ok(())
}

/// Describes how tensors should be cast around matmuls and reductions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PrecisionPolicy {
    storage: DType,
    compute: DType,
    reduction: DType,
}

impl PrecisionPolicy {
    /// Constructs a new policy from explicit dtype selections.
    pub fn new(storage: DType, compute: DType, reduction: DType) -> Self {
        Self {
            storage,
            compute,
            reduction,
        }
    }

    /// Builds a policy from the dtype activations are carried in.
    ///
    /// Half precision streams run their matmuls in `f32` since not every
    /// backend ships half precision gemm kernels (the CPU rejects `bf16`).
    pub fn from_activation_dtype(storage: DType) -> Self {
        let compute = match storage {
            DType::F16 | DType::BF16 => DType::F32,
            other => other,
        };
        let reduction = match storage {
            DType::F64 => DType::F64,
            _ => DType::F32,
        };
        Self::new(storage, compute, reduction)
    }

    /// Returns the dtype activations are stored in.
    pub fn storage(&self) -> DType {
        self.storage
    }

    /// Returns the dtype used for matmuls.
    pub fn compute(&self) -> DType {
        self.compute
    }

    /// Returns the dtype used for reductions such as RMS statistics.
    pub fn reduction(&self) -> DType {
        self.reduction
    }

    /// Casts a tensor to the compute dtype for matmul readiness.
    pub fn cast_for_matmul(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.compute)
    }

    /// Casts a tensor to the reduction dtype for statistics.
    pub fn cast_for_reduction(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.reduction)
    }

    /// Casts a tensor back to the storage dtype (or leaves it unchanged).
    pub fn cast_to_storage(&self, tensor: &Tensor) -> Result<Tensor> {
        cast_tensor(tensor, self.storage)
    }
}

fn cast_tensor(tensor: &Tensor, dtype: DType) -> Result<Tensor> {
    if tensor.dtype() == dtype {
        Ok(tensor.clone())
    } else {
        tensor.to_dtype(dtype)
    }
}
