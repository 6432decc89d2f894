use candle_core::{DType, Device, Result, Tensor};
use embedding::positional::rope::{
    compute_table, invert_rotation, FusedRotary, ReferenceRotary, RopeConfig, RopeKernel,
    RopeTable, RotaryKernel,
};

fn max_diff(a: &Tensor, b: &Tensor) -> Result<f32> {
    a.to_dtype(DType::F32)?
        .sub(&b.to_dtype(DType::F32)?)?
        .abs()?
        .max_all()?
        .to_vec0::<f32>()
}

#[test]
fn rotation_then_inverse_restores_input() -> Result<()> {
    let device = Device::Cpu;
    for &head_dim in &[2usize, 4, 8, 64] {
        for &(start, seq_len) in &[(0usize, 1usize), (0, 7), (11, 5)] {
            let table = RopeTable::new(RopeConfig::new(head_dim, 10_000.0, 32), &device)?;
            let freqs = table.slice(start, seq_len)?;
            let inverse = invert_rotation(&freqs)?;
            let x = Tensor::randn(0f32, 1.0, (1, seq_len, 3, head_dim), &device)?;

            for kernel in [RopeKernel::Reference, RopeKernel::Fused] {
                let kernel = kernel.build();
                let rotated = kernel.apply(&x, &freqs)?;
                let restored = kernel.apply(&rotated, &inverse)?;
                let diff = max_diff(&x, &restored)?;
                assert!(
                    diff < 1e-5,
                    "{} kernel head_dim={head_dim} start={start} seq={seq_len} diff={diff}",
                    kernel.name()
                );
            }
        }
    }
    Ok(())
}

#[test]
fn rotation_preserves_pair_norms() -> Result<()> {
    let device = Device::Cpu;
    let freqs = compute_table(6, 8, 10_000.0, &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 6, 2, 8), &device)?;
    let rotated = ReferenceRotary.apply(&x, &freqs)?;

    let pair_norms = |t: &Tensor| -> Result<Tensor> { t.reshape((1, 6, 2, 4, 2))?.sqr()?.sum(4) };
    assert!(max_diff(&pair_norms(&x)?, &pair_norms(&rotated)?)? < 1e-4);
    Ok(())
}

#[test]
fn reduced_precision_inputs_keep_their_dtype() -> Result<()> {
    let device = Device::Cpu;
    let table = RopeTable::new(RopeConfig::new(8, 10_000.0, 16), &device)?;
    let freqs = table.slice(2, 4)?;
    let x32 = Tensor::randn(0f32, 1.0, (1, 4, 2, 8), &device)?;
    let reference = ReferenceRotary.apply(&x32, &freqs)?;

    for dtype in [DType::F16, DType::BF16] {
        let x = x32.to_dtype(dtype)?;
        for kernel in [&ReferenceRotary as &dyn RotaryKernel, &FusedRotary] {
            let out = kernel.apply(&x, &freqs)?;
            assert_eq!(out.dtype(), dtype);
            assert!(max_diff(&out, &reference)? < 5e-2);
        }
    }
    Ok(())
}

#[test]
fn position_zero_is_identity() -> Result<()> {
    let device = Device::Cpu;
    let freqs = compute_table(1, 4, 10_000.0, &device)?;
    let x = Tensor::randn(0f32, 1.0, (1, 1, 1, 4), &device)?;
    assert_eq!(max_diff(&ReferenceRotary.apply(&x, &freqs)?, &x)?, 0.0);
    Ok(())
}
