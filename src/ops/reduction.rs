//! Global spatial mean.

use crate::catalog::names;
use crate::dispatch::{dispatch, Binding, Grid};
use crate::error::Result;
use crate::layout::up_div;
use crate::ops::{expect_rank, expect_shape};
use crate::params::{dim, make_uniform_buffer, MeanConstants};
use crate::pipeline::WorkGroupSize;
use crate::tensor::VulkanTensor;

/// Mean over `H x W` of an `[N, C, H, W]` input into an `[N, C]` output.
///
/// One invocation reduces one texel column (four channels) of the input.
pub fn mean(output: &mut VulkanTensor<'_>, input: &VulkanTensor<'_>) -> Result<()> {
    const OP: &str = "mean";
    expect_rank(OP, "input", input.shape(), 4)?;
    let (n, c, h, w) = (input.shape()[0], input.shape()[1], input.shape()[2], input.shape()[3]);
    expect_shape(OP, "output", output.shape(), &[n, c])?;

    let ctx = output.context();
    let constants = make_uniform_buffer(
        ctx,
        &MeanConstants {
            width: dim(w)?,
            height: dim(h)?,
            channels: dim(c)?,
            batch: dim(n)?,
        },
    )?;

    dispatch(
        ctx,
        names::MEAN,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(input.image_for_read()?),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SINGLE,
        Grid::cover(1, 1, up_div(n * c, 4)),
    )?;
    output.mark_image_written();
    Ok(())
}
