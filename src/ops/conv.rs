//! 2-D convolution
//!
//! Two shader paths exist: depthwise (`G == C`, weights read as a plain
//! `[OC, KH, KW]` tensor image) and ungrouped (`G == 1`, weights prepacked
//! into an O4C4HW-i4o4 image). Any other group count is rejected.
//! Both shaders apply a fused clamp to `[output_min, output_max]`.

use std::ops::Deref;

use crate::buffer::{self, GpuBuffer};
use crate::catalog::names;
use crate::context::VulkanContext;
use crate::dispatch::{dispatch, Binding, Grid};
use crate::ensure_contract;
use crate::error::{Result, VulkanErrorKind};
use crate::image::GpuImage;
use crate::layout::{align_up4, up_div};
use crate::ops::pool::pooled_extent;
use crate::ops::{expect_rank, expect_shape};
use crate::params::{clamp_bounds, dim, make_uniform_buffer, Conv2dConstants};
use crate::pipeline::WorkGroupSize;
use crate::repack::{self, KernelDims};
use crate::tensor::VulkanTensor;

// =============================================================================
// PARAMETERS
// =============================================================================

/// Which shader path a convolution takes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvKind {
    /// `G == 1`
    Plain,
    /// `G == C`, one filter per input channel
    Depthwise,
}

/// Derived convolution geometry. Pairs are `[y, x]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Conv2dParams {
    pub n: usize,
    pub c: usize,
    pub h: usize,
    pub w: usize,
    pub oc: usize,
    pub kh: usize,
    pub kw: usize,
    pub oh: usize,
    pub ow: usize,
    pub groups: usize,
    pub stride: [usize; 2],
    pub padding: [usize; 2],
    pub dilation: [usize; 2],
}

impl Conv2dParams {
    /// Derive parameters from an `[N, C, H, W]` input and an
    /// `[OC, C/G, KH, KW]` weight shape.
    pub fn new(
        input: &[usize],
        weight: &[usize],
        stride: [usize; 2],
        padding: [usize; 2],
        dilation: [usize; 2],
        groups: usize,
    ) -> Result<Self> {
        const OP: &str = "conv2d";
        expect_rank(OP, "input", input, 4)?;
        expect_rank(OP, "weight", weight, 4)?;
        ensure_contract!(groups > 0, "{}: groups must be positive", OP);

        let (n, c, h, w) = (input[0], input[1], input[2], input[3]);
        let (oc, ic_per_group, kh, kw) = (weight[0], weight[1], weight[2], weight[3]);
        ensure_contract!(
            ic_per_group * groups == c,
            "{}: weight {:?} with {} groups does not match {} input channels",
            OP,
            weight,
            groups,
            c
        );
        ensure_contract!(
            oc % groups == 0,
            "{}: {} output channels not divisible by {} groups",
            OP,
            oc,
            groups
        );

        let oh = pooled_extent(h, kh, stride[0], padding[0], dilation[0])?;
        let ow = pooled_extent(w, kw, stride[1], padding[1], dilation[1])?;

        Ok(Self {
            n,
            c,
            h,
            w,
            oc,
            kh,
            kw,
            oh,
            ow,
            groups,
            stride,
            padding,
            dilation,
        })
    }

    pub fn c_4(&self) -> usize {
        up_div(self.c, 4)
    }

    pub fn oc_4(&self) -> usize {
        up_div(self.oc, 4)
    }

    pub fn output_shape(&self) -> [usize; 4] {
        [self.n, self.oc, self.oh, self.ow]
    }

    pub fn kernel_dims(&self) -> KernelDims {
        KernelDims::new(self.oc, self.c, self.kh, self.kw)
    }

    /// Shape of the depthwise weight tensor.
    pub fn depthwise_weight_shape(&self) -> [usize; 3] {
        [self.oc, self.kh, self.kw]
    }

    /// Classify the group count.
    ///
    /// # Errors
    ///
    /// `ContractViolation` for any `G > 1` other than depthwise (`G == C == OC`):
    /// only ungrouped and depthwise convolution are supported.
    pub fn kind(&self) -> Result<ConvKind> {
        if self.groups == 1 {
            return Ok(ConvKind::Plain);
        }
        ensure_contract!(
            self.groups == self.c && self.oc == self.c,
            "conv2d supports only no-group and depthwise convolution (groups={}, channels={}, output channels={})",
            self.groups,
            self.c,
            self.oc
        );
        Ok(ConvKind::Depthwise)
    }

    /// Accepts `[OC, KH, KW]` or `[OC, 1, KH, KW]`.
    fn check_depthwise_weight(&self, shape: &[usize]) -> Result<()> {
        let [oc, kh, kw] = self.depthwise_weight_shape();
        ensure_contract!(
            shape == [oc, kh, kw] || shape == [oc, 1, kh, kw],
            "conv2d_depthwise: weight {:?} does not match [{}, {}, {}]",
            shape,
            oc,
            kh,
            kw
        );
        Ok(())
    }

    /// Constant block for `kind`; the depthwise shader takes 0 in the last size lane.
    pub fn constants(
        &self,
        kind: ConvKind,
        output_min: Option<f32>,
        output_max: Option<f32>,
    ) -> Result<Conv2dConstants> {
        let (output_min, output_max) = clamp_bounds(output_min, output_max);
        let (oc_lane, c_lane) = match kind {
            ConvKind::Plain => (dim(self.oc)?, dim(self.c)?),
            ConvKind::Depthwise => (0, 0),
        };
        Ok(Conv2dConstants {
            padding: [dim(self.padding[1])?, dim(self.padding[0])?],
            kernel: [dim(self.kw)?, dim(self.kh)?],
            stride: [dim(self.stride[1])?, dim(self.stride[0])?],
            dilation: [dim(self.dilation[1])?, dim(self.dilation[0])?],
            output_size: [dim(self.ow)?, dim(self.oh)?, dim(self.oc_4())?, oc_lane],
            input_size: [dim(self.w)?, dim(self.h)?, dim(self.c_4())?, c_lane],
            output_min,
            output_max,
        })
    }

    /// Work groups for the ungrouped shader: each invocation covers four
    /// output columns.
    pub fn nogroup_groups(&self, work_group: WorkGroupSize) -> [u32; 3] {
        [
            up_div(self.ow, 4 * work_group.x as usize) as u32,
            up_div(self.oh, work_group.y as usize) as u32,
            up_div(self.oc_4(), work_group.z as usize) as u32,
        ]
    }

    fn check_tensors(&self, output: &VulkanTensor<'_>, input: &VulkanTensor<'_>) -> Result<()> {
        expect_shape("conv2d", "input", input.shape(), &[self.n, self.c, self.h, self.w])?;
        expect_shape("conv2d", "output", output.shape(), &self.output_shape())
    }
}

// =============================================================================
// BIAS
// =============================================================================

/// Optional per-output-channel bias.
#[derive(Clone, Copy)]
pub enum Bias<'r, 'a> {
    /// Zero bias
    None,
    /// `OC` floats uploaded for this call
    Host(&'r [f32]),
    /// A device tensor with `OC` elements
    Tensor(&'r VulkanTensor<'a>),
}

/// A bias buffer either owned by the call or borrowed from a tensor.
pub(crate) enum BiasBuffer<'r, 'a> {
    Owned(GpuBuffer<'a>),
    Borrowed(&'r GpuBuffer<'a>),
}

impl<'a> Deref for BiasBuffer<'_, 'a> {
    type Target = GpuBuffer<'a>;

    fn deref(&self) -> &GpuBuffer<'a> {
        match self {
            BiasBuffer::Owned(buffer) => buffer,
            BiasBuffer::Borrowed(buffer) => buffer,
        }
    }
}

/// Zero-padded bias buffer of `align_up4(oc)` floats, filled from `data` if given.
fn padded_bias<'a>(ctx: &'a VulkanContext, data: Option<&[f32]>, oc: usize) -> Result<GpuBuffer<'a>> {
    if let Some(data) = data {
        ensure_contract!(
            data.len() == oc,
            "bias has {} elements, expected {}",
            data.len(),
            oc
        );
    }
    let buffer =
        GpuBuffer::storage_aligned(ctx, (align_up4(oc) * std::mem::size_of::<f32>()) as u64)?;
    buffer.set_zeros()?;
    if let Some(data) = data {
        buffer.copy_from_host(data)?;
    }
    Ok(buffer)
}

/// Bias buffer holding at least `align_up4(oc)` floats.
pub(crate) fn bias_buffer<'r, 'a>(
    ctx: &'a VulkanContext,
    bias: Bias<'r, 'a>,
    oc: usize,
) -> Result<BiasBuffer<'r, 'a>> {
    match bias {
        Bias::None => Ok(BiasBuffer::Owned(padded_bias(ctx, None, oc)?)),
        Bias::Host(data) => Ok(BiasBuffer::Owned(padded_bias(ctx, Some(data), oc)?)),
        Bias::Tensor(tensor) => {
            ensure_contract!(
                tensor.numel() == oc,
                "bias tensor {:?} does not have {} elements",
                tensor.shape(),
                oc
            );
            let source = tensor.buffer_for_read()?;
            if source.size() >= (align_up4(oc) * std::mem::size_of::<f32>()) as u64 {
                return Ok(BiasBuffer::Borrowed(source));
            }
            // Pad so the shader can read whole channel blocks.
            let buffer = padded_bias(ctx, None, oc)?;
            buffer::copy_buffer_to_buffer(ctx, source, &buffer, tensor.size_bytes(), 0, 0)?;
            Ok(BiasBuffer::Owned(buffer))
        }
    }
}

// =============================================================================
// SHADER PATHS
// =============================================================================

/// Depthwise convolution (`G == C`) with weights in a `[OC, KH, KW]` tensor.
#[allow(clippy::too_many_arguments)]
pub fn conv2d_depthwise(
    output: &mut VulkanTensor<'_>,
    input: &VulkanTensor<'_>,
    weight: &VulkanTensor<'_>,
    bias: &GpuBuffer<'_>,
    params: &Conv2dParams,
    output_min: Option<f32>,
    output_max: Option<f32>,
) -> Result<()> {
    ensure_contract!(
        params.kind()? == ConvKind::Depthwise,
        "conv2d_depthwise requires groups == channels (groups={}, channels={})",
        params.groups,
        params.c
    );
    params.check_tensors(output, input)?;
    params.check_depthwise_weight(weight.shape())?;

    let ctx = output.context();
    let constants = make_uniform_buffer(
        ctx,
        &params.constants(ConvKind::Depthwise, output_min, output_max)?,
    )?;

    dispatch(
        ctx,
        names::CONV2D_DEPTHWISE_CLAMP,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(input.image_for_read()?),
            Binding::InputImage(weight.image_for_read()?),
            Binding::InputBuffer(bias),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SPATIAL,
        Grid::cover(params.ow, params.oh, params.oc_4()),
    )?;
    output.mark_image_written();
    Ok(())
}

/// Ungrouped convolution (`G == 1`) with a prepacked weight image.
///
/// # Errors
///
/// `ResourceSize` if `kernel_image` is not the prepacked extent for `params`.
#[allow(clippy::too_many_arguments)]
pub fn conv2d_nogroup(
    output: &mut VulkanTensor<'_>,
    input: &VulkanTensor<'_>,
    kernel_image: &GpuImage<'_>,
    bias: &GpuBuffer<'_>,
    params: &Conv2dParams,
    output_min: Option<f32>,
    output_max: Option<f32>,
) -> Result<()> {
    ensure_contract!(
        params.groups == 1,
        "prepacked kernel image is for non-group conv2d only (groups={})",
        params.groups
    );
    params.check_tensors(output, input)?;

    let expected = params.kernel_dims().image_extent()?;
    if kernel_image.extent() != expected {
        return Err(VulkanErrorKind::ResourceSize(format!(
            "kernel image is {}, expected {}",
            kernel_image.extent(),
            expected
        )));
    }

    let ctx = output.context();
    let constants = make_uniform_buffer(
        ctx,
        &params.constants(ConvKind::Plain, output_min, output_max)?,
    )?;

    let work_group = ctx.fit_work_group(WorkGroupSize::new(1, 1, params.oc_4() as u32));
    dispatch(
        ctx,
        names::CONV2D_NOGROUP_CLAMP,
        &[
            Binding::OutputImage(output.image()?),
            Binding::InputImage(input.image_for_read()?),
            Binding::InputImage(kernel_image),
            Binding::InputBuffer(bias),
            Binding::Uniform(&constants),
        ],
        work_group,
        Grid::Groups(params.nogroup_groups(work_group)),
    )?;
    output.mark_image_written();
    Ok(())
}

// =============================================================================
// ENTRY POINTS
// =============================================================================

/// Convolution with weights already on the device.
///
/// For depthwise parameters `weight` is a `[OC, KH, KW]` tensor; otherwise
/// it must hold a prepacked kernel image (see [`repack::conv2d_prepack_weights`]).
#[allow(clippy::too_many_arguments)]
pub fn conv2d<'a>(
    output: &mut VulkanTensor<'a>,
    input: &VulkanTensor<'_>,
    weight: &VulkanTensor<'_>,
    bias: Bias<'_, 'a>,
    params: &Conv2dParams,
    output_min: Option<f32>,
    output_max: Option<f32>,
) -> Result<()> {
    let kind = params.kind()?;
    let ctx = output.context();
    match kind {
        ConvKind::Depthwise => {
            let bias = bias_buffer(ctx, bias, params.oc)?;
            conv2d_depthwise(output, input, weight, &bias, params, output_min, output_max)
        }
        ConvKind::Plain => {
            ensure_contract!(
                weight.has_image(),
                "conv2d: weight tensor {:?} has not been prepacked",
                weight.shape()
            );
            let kernel_image = weight.image_with_extent(params.kernel_dims().image_extent()?)?;
            let bias = bias_buffer(ctx, bias, params.oc)?;
            conv2d_nogroup(output, input, kernel_image, &bias, params, output_min, output_max)
        }
    }
}

/// Convolution with dense host weights, packed for this call only.
///
/// `weights` is `[OC, C/G, KH, KW]` row-major.
#[allow(clippy::too_many_arguments)]
pub fn conv2d_with_host_weights<'a>(
    output: &mut VulkanTensor<'a>,
    input: &VulkanTensor<'_>,
    weights: &[f32],
    bias: Bias<'_, 'a>,
    params: &Conv2dParams,
    output_min: Option<f32>,
    output_max: Option<f32>,
) -> Result<()> {
    let kind = params.kind()?;
    let ctx = output.context();
    match kind {
        ConvKind::Depthwise => {
            let weight = VulkanTensor::from_host(ctx, &params.depthwise_weight_shape(), weights)?;
            let bias = bias_buffer(ctx, bias, params.oc)?;
            conv2d_depthwise(output, input, &weight, &bias, params, output_min, output_max)
        }
        ConvKind::Plain => {
            let kernel_image =
                repack::conv2d_prepack_weights_image(ctx, weights, params.kernel_dims())?;
            let bias = bias_buffer(ctx, bias, params.oc)?;
            conv2d_nogroup(output, input, &kernel_image, &bias, params, output_min, output_max)
        }
    }
}

/// Weights and bias prepared once and reused across calls.
pub struct Conv2dPrepacked<'a> {
    params: Conv2dParams,
    kind: ConvKind,
    weights: PackedWeights<'a>,
    bias: GpuBuffer<'a>,
}

enum PackedWeights<'a> {
    Depthwise(VulkanTensor<'a>),
    Plain(GpuImage<'a>),
}

impl<'a> Conv2dPrepacked<'a> {
    /// Upload `weights` (`[OC, C/G, KH, KW]` row-major) and `bias`.
    pub fn new(
        ctx: &'a VulkanContext,
        params: Conv2dParams,
        weights: &[f32],
        bias: Option<&[f32]>,
    ) -> Result<Self> {
        let kind = params.kind()?;
        let packed = match kind {
            ConvKind::Depthwise => PackedWeights::Depthwise(VulkanTensor::from_host(
                ctx,
                &params.depthwise_weight_shape(),
                weights,
            )?),
            ConvKind::Plain => PackedWeights::Plain(repack::conv2d_prepack_weights_image(
                ctx,
                weights,
                params.kernel_dims(),
            )?),
        };

        let bias = padded_bias(ctx, bias, params.oc)?;

        log::debug!("Conv2d prepacked ({:?}, {:?})", kind, params.kernel_dims());

        Ok(Self {
            params,
            kind,
            weights: packed,
            bias,
        })
    }

    pub fn params(&self) -> &Conv2dParams {
        &self.params
    }

    pub fn kind(&self) -> ConvKind {
        self.kind
    }

    /// Run the convolution on `input` into `output`.
    pub fn run(
        &self,
        output: &mut VulkanTensor<'_>,
        input: &VulkanTensor<'_>,
        output_min: Option<f32>,
        output_max: Option<f32>,
    ) -> Result<()> {
        match &self.weights {
            PackedWeights::Depthwise(weight) => conv2d_depthwise(
                output,
                input,
                weight,
                &self.bias,
                &self.params,
                output_min,
                output_max,
            ),
            PackedWeights::Plain(image) => conv2d_nogroup(
                output,
                input,
                image,
                &self.bias,
                &self.params,
                output_min,
                output_max,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn params(c: usize, weight: [usize; 4], groups: usize) -> Result<Conv2dParams> {
        Conv2dParams::new(&[1, c, 8, 8], &weight, [1, 1], [1, 1], [1, 1], groups)
    }

    #[test]
    fn test_output_size() {
        let p = Conv2dParams::new(&[2, 3, 7, 9], &[8, 3, 3, 3], [2, 1], [1, 0], [1, 1], 1).unwrap();
        assert_eq!(p.output_shape(), [2, 8, 4, 7]);
        assert_eq!(p.c_4(), 1);
        assert_eq!(p.oc_4(), 2);

        let p = Conv2dParams::new(&[1, 4, 10, 10], &[4, 4, 3, 3], [1, 1], [0, 0], [2, 2], 1).unwrap();
        assert_eq!(p.output_shape(), [1, 4, 6, 6]);
    }

    #[test]
    fn test_group_classification() {
        assert_eq!(params(6, [4, 6, 3, 3], 1).unwrap().kind().unwrap(), ConvKind::Plain);
        assert_eq!(params(6, [6, 1, 3, 3], 6).unwrap().kind().unwrap(), ConvKind::Depthwise);

        let grouped = params(6, [6, 2, 3, 3], 3).unwrap();
        let err = grouped.kind().unwrap_err();
        assert!(err.is_contract_violation());
        assert!(err.to_string().contains("only no-group and depthwise"));

        // groups == channels but more output channels than inputs
        let widened = Conv2dParams::new(&[1, 2, 4, 4], &[4, 1, 3, 3], [1, 1], [1, 1], [1, 1], 2).unwrap();
        let err = widened.kind().unwrap_err();
        assert!(err.is_contract_violation());
        assert!(err.to_string().contains("output channels=4"));
    }

    #[test]
    fn test_depthwise_weight_shape_is_exact() {
        let dw = Conv2dParams::new(&[1, 3, 8, 8], &[3, 1, 2, 4], [1, 1], [0, 0], [1, 1], 3).unwrap();
        assert!(dw.check_depthwise_weight(&[3, 2, 4]).is_ok());
        assert!(dw.check_depthwise_weight(&[3, 1, 2, 4]).is_ok());
        // same element count, transposed kernel
        assert!(dw.check_depthwise_weight(&[3, 4, 2]).unwrap_err().is_contract_violation());
        assert!(dw.check_depthwise_weight(&[24]).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_weight_shape_must_match_groups() {
        assert!(params(6, [4, 3, 3, 3], 1).unwrap_err().is_contract_violation());
        assert!(params(6, [5, 2, 3, 3], 3).unwrap_err().is_contract_violation());
        assert!(Conv2dParams::new(&[1, 3, 2, 2], &[1, 3, 5, 5], [1, 1], [0, 0], [1, 1], 1)
            .unwrap_err()
            .is_contract_violation());
    }

    #[test]
    fn test_constants_layout() {
        let p = Conv2dParams::new(&[1, 6, 9, 8], &[10, 6, 3, 1], [2, 1], [1, 0], [1, 1], 1).unwrap();
        let plain = p.constants(ConvKind::Plain, Some(0.0), Some(6.0)).unwrap();
        assert_eq!(plain.padding, [0, 1]);
        assert_eq!(plain.kernel, [1, 3]);
        assert_eq!(plain.stride, [1, 2]);
        assert_eq!(plain.output_size, [8, 5, 3, 10]);
        assert_eq!(plain.input_size, [8, 9, 2, 6]);
        assert_eq!((plain.output_min, plain.output_max), (0.0, 6.0));

        let dw = params(6, [6, 1, 3, 3], 6).unwrap();
        let block = dw.constants(ConvKind::Depthwise, None, None).unwrap();
        assert_eq!(block.output_size[3], 0);
        assert_eq!(block.input_size[3], 0);
        assert_eq!(block.output_min, f32::NEG_INFINITY);
        assert_eq!(block.output_max, f32::INFINITY);
    }

    #[test]
    fn test_nogroup_grid_covers_four_columns_per_invocation() {
        let p = Conv2dParams::new(&[1, 4, 9, 17], &[12, 4, 1, 1], [1, 1], [0, 0], [1, 1], 1).unwrap();
        assert_eq!(p.nogroup_groups(WorkGroupSize::new(1, 1, 3)), [5, 9, 1]);
        assert_eq!(p.nogroup_groups(WorkGroupSize::new(2, 1, 2)), [3, 9, 2]);
    }
}
