//! Elementwise operators: add, add/mul by scalar, clamp.

use crate::catalog::names;
use crate::dispatch::{dispatch, Binding, Grid};
use crate::ensure_contract;
use crate::error::Result;
use crate::layout::{fold_whc, pad_to_4d, up_div, MAX_DIM};
use crate::ops::expect_shape;
use crate::params::{
    clamp_bounds, dim, make_uniform_buffer, AddConstants, ClampConstants, ScalarConstants,
};
use crate::pipeline::WorkGroupSize;
use crate::tensor::VulkanTensor;

/// `(W, H, C)` shared by all three `add` operands.
///
/// Each shape is left-padded to 4 dims; the padded shapes must be identical.
/// Size-1 dims do not broadcast.
pub fn add_operand_dims(
    output: &[usize],
    input0: &[usize],
    input1: &[usize],
) -> Result<(usize, usize, usize)> {
    for (name, shape) in [("output", output), ("input0", input0), ("input1", input1)] {
        ensure_contract!(
            shape.len() <= MAX_DIM,
            "add is implemented for dim <= {}, {} has dim {}",
            MAX_DIM,
            name,
            shape.len()
        );
    }

    let os4 = pad_to_4d(output)?;
    let i0s4 = pad_to_4d(input0)?;
    let i1s4 = pad_to_4d(input1)?;
    ensure_contract!(
        os4 == i0s4 && i0s4 == i1s4,
        "add expects the same dimensions for all operands, got {:?}, {:?}, {:?}",
        output,
        input0,
        input1
    );

    let [n, c, h, w] = os4;
    Ok((w, h, n * c))
}

/// `output = input0 + alpha * input1`
pub fn add(
    output: &mut VulkanTensor<'_>,
    input0: &VulkanTensor<'_>,
    input1: &VulkanTensor<'_>,
    alpha: f32,
) -> Result<()> {
    let (w, h, c) = add_operand_dims(output.shape(), input0.shape(), input1.shape())?;

    let ctx = output.context();
    let constants = make_uniform_buffer(
        ctx,
        &AddConstants {
            width: dim(w)?,
            height: dim(h)?,
            channels: dim(c)?,
            alpha,
        },
    )?;

    dispatch(
        ctx,
        names::ADD,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(input0.image_for_read()?),
            Binding::InputImage(input1.image_for_read()?),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SPATIAL,
        Grid::cover(w, h, c),
    )?;
    output.mark_image_written();
    Ok(())
}

fn scalar_op(
    shader: &str,
    output: &mut VulkanTensor<'_>,
    input: &VulkanTensor<'_>,
    scalar: f32,
) -> Result<()> {
    expect_shape(shader, "output", output.shape(), input.shape())?;
    let (w, h, c) = fold_whc(input.shape())?;

    let ctx = output.context();
    let constants = make_uniform_buffer(
        ctx,
        &ScalarConstants {
            input_size: [dim(w)?, dim(h)?, dim(c)?, 0],
            scalar,
        },
    )?;

    dispatch(
        ctx,
        shader,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(input.image_for_read()?),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SPATIAL,
        Grid::cover(w, h, c),
    )?;
    output.mark_image_written();
    Ok(())
}

/// `output = input + s`
pub fn add_scalar(output: &mut VulkanTensor<'_>, input: &VulkanTensor<'_>, s: f32) -> Result<()> {
    scalar_op(names::ADD_SCALAR, output, input, s)
}

/// `output = input * s`
pub fn mul_scalar(output: &mut VulkanTensor<'_>, input: &VulkanTensor<'_>, s: f32) -> Result<()> {
    scalar_op(names::MUL_SCALAR, output, input, s)
}

/// `output = min(max(input, min), max)`; absent bounds are unbounded.
pub fn clamp(
    output: &mut VulkanTensor<'_>,
    input: &VulkanTensor<'_>,
    min: Option<f32>,
    max: Option<f32>,
) -> Result<()> {
    const OP: &str = "clamp";
    expect_shape(OP, "output", output.shape(), input.shape())?;
    let (w, h, c) = fold_whc(output.shape())?;
    let (min, max) = clamp_bounds(min, max);
    ensure_contract!(
        min.partial_cmp(&max) != Some(std::cmp::Ordering::Greater),
        "{}: min {} greater than max {}",
        OP,
        min,
        max
    );

    let ctx = output.context();
    let constants = make_uniform_buffer(
        ctx,
        &ClampConstants {
            width: dim(w)?,
            height: dim(h)?,
            channel_blocks: dim(up_div(c, 4))?,
            channels: dim(c)?,
            min,
            max,
        },
    )?;

    dispatch(
        ctx,
        names::CLAMP,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(input.image_for_read()?),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SPATIAL,
        Grid::cover(w, h, c),
    )?;
    output.mark_image_written();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_add_dims_after_left_padding() {
        assert_eq!(add_operand_dims(&[2, 3], &[2, 3], &[2, 3]).unwrap(), (3, 2, 1));
        assert_eq!(
            add_operand_dims(&[1, 2, 3], &[2, 3], &[1, 1, 2, 3]).unwrap(),
            (3, 2, 1)
        );
        assert_eq!(
            add_operand_dims(&[2, 4, 5, 6], &[2, 4, 5, 6], &[2, 4, 5, 6]).unwrap(),
            (6, 5, 8)
        );
    }

    #[test]
    fn test_add_rejects_broadcasting() {
        let err = add_operand_dims(&[2, 3], &[2, 3], &[1, 3]).unwrap_err();
        assert!(err.is_contract_violation());
        assert!(err.to_string().contains("same dimensions"));
    }

    #[test]
    fn test_add_rejects_rank_above_four() {
        let err = add_operand_dims(&[1, 1, 1, 1, 2], &[2], &[2]).unwrap_err();
        assert!(err.to_string().contains("dim <= 4"));
    }
}
