//! Spatial resampling: nearest upsample, adaptive average pool, max pool.
//!
//! All three take `[N, C, H, W]` tensors and dispatch one invocation per
//! output texel over `(OW, OH, N*C)` with 8x8x1 work groups.

use crate::catalog::names;
use crate::dispatch::{dispatch, Binding, Grid};
use crate::ensure_contract;
use crate::error::Result;
use crate::ops::{expect_rank, expect_shape};
use crate::params::{
    dim, make_uniform_buffer, AdaptivePoolConstants, MaxPoolConstants, UpsampleConstants,
};
use crate::pipeline::WorkGroupSize;
use crate::tensor::VulkanTensor;

/// Kernel geometry for max pooling. Pairs are `[height, width]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Pool2dParams {
    pub kernel: [usize; 2],
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
}

impl Pool2dParams {
    pub fn new(kernel: [usize; 2], stride: [usize; 2], padding: [usize; 2], dilation: [usize; 2]) -> Self {
        Self {
            kernel,
            stride,
            padding,
            dilation,
        }
    }

    /// `[OH, OW]` for an `[H, W]` input.
    pub fn output_size(&self, input: [usize; 2]) -> Result<[usize; 2]> {
        Ok([
            pooled_extent(input[0], self.kernel[0], self.stride[0], self.padding[0], self.dilation[0])?,
            pooled_extent(input[1], self.kernel[1], self.stride[1], self.padding[1], self.dilation[1])?,
        ])
    }
}

/// `floor((input + 2*padding - dilation*(kernel-1) - 1) / stride) + 1`
pub fn pooled_extent(
    input: usize,
    kernel: usize,
    stride: usize,
    padding: usize,
    dilation: usize,
) -> Result<usize> {
    ensure_contract!(
        kernel > 0 && stride > 0 && dilation > 0,
        "kernel ({}), stride ({}) and dilation ({}) must be positive",
        kernel,
        stride,
        dilation
    );
    let span = dilation * (kernel - 1) + 1;
    let padded = input + 2 * padding;
    ensure_contract!(
        padded >= span,
        "kernel span {} exceeds padded input {}",
        span,
        padded
    );
    Ok((padded - span) / stride + 1)
}

/// Scale passed to the nearest-upsample shader: source index = floor(dst * scale).
pub fn nearest_scale(input: usize, output: usize) -> f32 {
    if output == 0 {
        return 0.0;
    }
    input as f32 / output as f32
}

fn nc_hw(op: &str, shape: &[usize]) -> Result<([usize; 2], [usize; 2])> {
    expect_rank(op, "input", shape, 4)?;
    Ok(([shape[0], shape[1]], [shape[2], shape[3]]))
}

/// Nearest-neighbour upsample of `input` into `output`.
///
/// `scale_h` / `scale_w` map output to source coordinates (see [`nearest_scale`]).
pub fn upsample_nearest2d(
    output: &mut VulkanTensor<'_>,
    input: &VulkanTensor<'_>,
    scale_h: f32,
    scale_w: f32,
) -> Result<()> {
    const OP: &str = "upsample_nearest2d";
    let ([n, c], [ih, iw]) = nc_hw(OP, input.shape())?;
    expect_rank(OP, "output", output.shape(), 4)?;
    let (oh, ow) = (output.shape()[2], output.shape()[3]);
    expect_shape(OP, "output", output.shape(), &[n, c, oh, ow])?;

    let ctx = output.context();
    let constants = make_uniform_buffer(
        ctx,
        &UpsampleConstants {
            input_width: dim(iw)?,
            input_height: dim(ih)?,
            output_width: dim(ow)?,
            output_height: dim(oh)?,
            scale_x: scale_w,
            scale_y: scale_h,
        },
    )?;

    dispatch(
        ctx,
        names::UPSAMPLE_NEAREST_2D,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(input.image_for_read()?),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SPATIAL,
        Grid::cover(ow, oh, n * c),
    )?;
    output.mark_image_written();
    Ok(())
}

/// Adaptive average pool to `output`'s spatial size.
pub fn adaptive_avg_pool2d(output: &mut VulkanTensor<'_>, input: &VulkanTensor<'_>) -> Result<()> {
    const OP: &str = "adaptive_avg_pool2d";
    let ([n, c], [ih, iw]) = nc_hw(OP, input.shape())?;
    expect_rank(OP, "output", output.shape(), 4)?;
    let (oh, ow) = (output.shape()[2], output.shape()[3]);
    expect_shape(OP, "output", output.shape(), &[n, c, oh, ow])?;
    ensure_contract!(oh > 0 && ow > 0, "{}: empty output size {}x{}", OP, oh, ow);

    let ctx = output.context();
    let constants = make_uniform_buffer(
        ctx,
        &AdaptivePoolConstants {
            input_width: dim(iw)?,
            input_height: dim(ih)?,
            output_width: dim(ow)?,
            output_height: dim(oh)?,
        },
    )?;

    dispatch(
        ctx,
        names::ADAPTIVE_AVG_POOL_2D,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(input.image_for_read()?),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SPATIAL,
        Grid::cover(ow, oh, n * c),
    )?;
    output.mark_image_written();
    Ok(())
}

/// Max pool with kernel, stride, padding and dilation; padding reads as -inf.
pub fn max_pool2d(
    output: &mut VulkanTensor<'_>,
    input: &VulkanTensor<'_>,
    params: &Pool2dParams,
) -> Result<()> {
    const OP: &str = "max_pool2d";
    let ([n, c], [ih, iw]) = nc_hw(OP, input.shape())?;
    let [oh, ow] = params.output_size([ih, iw])?;
    expect_shape(OP, "output", output.shape(), &[n, c, oh, ow])?;

    let channels = dim(n * c)?;
    let ctx = output.context();
    let constants = make_uniform_buffer(
        ctx,
        &MaxPoolConstants {
            input_size: [dim(iw)?, dim(ih)?, channels, 0],
            output_size: [dim(ow)?, dim(oh)?, channels, 0],
            kernel: [dim(params.kernel[1])?, dim(params.kernel[0])?],
            stride: [dim(params.stride[1])?, dim(params.stride[0])?],
            padding: [dim(params.padding[1])?, dim(params.padding[0])?],
            dilation: [dim(params.dilation[1])?, dim(params.dilation[0])?],
        },
    )?;

    dispatch(
        ctx,
        names::MAX_POOL_2D,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(input.image_for_read()?),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SPATIAL,
        Grid::cover(ow, oh, n * c),
    )?;
    output.mark_image_written();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pooled_extent() {
        // 2x2 stride 2
        assert_eq!(pooled_extent(8, 2, 2, 0, 1).unwrap(), 4);
        assert_eq!(pooled_extent(7, 2, 2, 0, 1).unwrap(), 3);
        // 3x3 stride 1 pad 1 keeps size
        assert_eq!(pooled_extent(5, 3, 1, 1, 1).unwrap(), 5);
        // dilation 2 widens the window to 5
        assert_eq!(pooled_extent(9, 3, 1, 0, 2).unwrap(), 5);
    }

    #[test]
    fn test_pooled_extent_rejects_bad_geometry() {
        assert!(pooled_extent(2, 3, 1, 0, 1).unwrap_err().is_contract_violation());
        assert!(pooled_extent(8, 2, 0, 0, 1).unwrap_err().is_contract_violation());
        assert!(pooled_extent(8, 0, 1, 0, 1).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_pool_params_output_size() {
        let params = Pool2dParams::new([3, 2], [2, 2], [1, 0], [1, 1]);
        assert_eq!(params.output_size([6, 6]).unwrap(), [3, 3]);
    }

    #[test]
    fn test_nearest_scale() {
        assert_eq!(nearest_scale(4, 8), 0.5);
        assert_eq!(nearest_scale(3, 3), 1.0);
        assert_eq!(nearest_scale(3, 0), 0.0);
    }

    #[test]
    fn test_nc_hw_requires_4d() {
        assert_eq!(nc_hw("op", &[1, 2, 3, 4]).unwrap(), ([1, 2], [3, 4]));
        assert!(nc_hw("op", &[2, 3, 4]).is_err());
    }
}
