//! Matrix multiply: `addmm` and `mm` on 2-D tensors.

use crate::catalog::names;
use crate::dispatch::{dispatch, Binding, Grid};
use crate::ensure_contract;
use crate::error::Result;
use crate::ops::{expect_rank, expect_shape};
use crate::params::{dim, make_uniform_buffer, AddmmConstants};
use crate::pipeline::WorkGroupSize;
use crate::tensor::VulkanTensor;

/// `(M, K, N)` for `m1: [M, K]` and `m2: [K, N]`.
pub fn matmul_dims(op: &str, m1: &[usize], m2: &[usize]) -> Result<(usize, usize, usize)> {
    expect_rank(op, "m1", m1, 2)?;
    expect_rank(op, "m2", m2, 2)?;
    ensure_contract!(
        m1[1] == m2[0],
        "{}: m1 {:?} and m2 {:?} have mismatched inner dims",
        op,
        m1,
        m2
    );
    Ok((m1[0], m1[1], m2[1]))
}

fn constants(m: usize, k: usize, n: usize, beta: f32, alpha: f32) -> Result<AddmmConstants> {
    Ok(AddmmConstants {
        output_width: dim(n)?,
        output_height: dim(m)?,
        channel_blocks: 1,
        channels: 1,
        beta,
        alpha,
        k: dim(k)?,
    })
}

/// `output = beta * t + alpha * (m1 @ m2)`, or `m1 @ m2` when `t` is absent.
pub fn addmm(
    output: &mut VulkanTensor<'_>,
    m1: &VulkanTensor<'_>,
    m2: &VulkanTensor<'_>,
    t: Option<&VulkanTensor<'_>>,
    beta: f32,
    alpha: f32,
) -> Result<()> {
    let Some(t) = t else {
        return mm(output, m1, m2);
    };

    const OP: &str = "addmm";
    let (m, k, n) = matmul_dims(OP, m1.shape(), m2.shape())?;
    expect_shape(OP, "output", output.shape(), &[m, n])?;
    expect_shape(OP, "t", t.shape(), &[m, n])?;

    let ctx = output.context();
    let constants = make_uniform_buffer(ctx, &constants(m, k, n, beta, alpha)?)?;

    dispatch(
        ctx,
        names::ADDMM,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(m1.image_for_read()?),
            Binding::InputImage(m2.image_for_read()?),
            Binding::InputImage(t.image_for_read()?),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SPATIAL,
        Grid::cover(n, m, 1),
    )?;
    output.mark_image_written();
    Ok(())
}

/// `output = m1 @ m2`
pub fn mm(output: &mut VulkanTensor<'_>, m1: &VulkanTensor<'_>, m2: &VulkanTensor<'_>) -> Result<()> {
    const OP: &str = "mm";
    let (m, k, n) = matmul_dims(OP, m1.shape(), m2.shape())?;
    expect_shape(OP, "output", output.shape(), &[m, n])?;

    let ctx = output.context();
    let constants = make_uniform_buffer(ctx, &constants(m, k, n, 0.0, 1.0)?)?;

    dispatch(
        ctx,
        names::MM,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(m1.image_for_read()?),
            Binding::InputImage(m2.image_for_read()?),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SPATIAL,
        Grid::cover(n, m, 1),
    )?;
    output.mark_image_written();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_matmul_dims() {
        assert_eq!(matmul_dims("mm", &[2, 3], &[3, 5]).unwrap(), (2, 3, 5));

        let err = matmul_dims("mm", &[2, 3], &[4, 5]).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(err.to_string().contains("mismatched inner dims"));

        assert!(matmul_dims("addmm", &[1, 2, 3], &[3, 5]).is_err());
    }

    #[test]
    fn test_constant_block() {
        let block = constants(4, 7, 9, 0.5, 2.0).unwrap();
        assert_eq!((block.output_width, block.output_height), (9, 4));
        assert_eq!((block.channel_blocks, block.channels), (1, 1));
        assert_eq!((block.beta, block.alpha, block.k), (0.5, 2.0, 7));
    }
}
