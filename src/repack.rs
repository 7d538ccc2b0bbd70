//! Convolution weight repacking
//!
//! Dense `[OC, C, KH, KW]` weights are rearranged on the host into
//! 16-float blocks (O4C4HW-i4o4): block `(o4, c4, ky, kx)` holds the 4x4
//! output/input channel tile at lane `4 * (ic % 4) + (oc % 4)`. The packed
//! buffer is then scattered into a weight image by the `KO4C4HW_to_image`
//! shader.

use crate::buffer::GpuBuffer;
use crate::catalog::names;
use crate::context::VulkanContext;
use crate::dispatch::{dispatch, Binding, Grid};
use crate::ensure_contract;
use crate::error::{Result, VulkanErrorKind};
use crate::image::GpuImage;
use crate::layout::{align_up4, up_div, ImageExtent};
use crate::params::{dim, make_uniform_buffer, RepackConstants};
use crate::pipeline::WorkGroupSize;
use crate::tensor::VulkanTensor;

/// Dense convolution kernel dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelDims {
    pub output_channels: usize,
    pub input_channels: usize,
    pub height: usize,
    pub width: usize,
}

impl KernelDims {
    pub fn new(output_channels: usize, input_channels: usize, height: usize, width: usize) -> Self {
        Self {
            output_channels,
            input_channels,
            height,
            width,
        }
    }

    pub fn numel(&self) -> usize {
        self.output_channels * self.input_channels * self.height * self.width
    }

    /// Float count of the packed buffer.
    pub fn packed_numel(&self) -> usize {
        align_up4(self.output_channels) * align_up4(self.input_channels) * self.height * self.width
    }

    /// Offset of weight `(oc, ic, ky, kx)` in the packed buffer.
    pub fn packed_index(&self, oc: usize, ic: usize, ky: usize, kx: usize) -> usize {
        let kernel_area = self.height * self.width;
        let c_4 = up_div(self.input_channels, 4);
        (oc / 4) * (kernel_area * c_4 * 16)
            + (ic / 4) * (kernel_area * 16)
            + ky * (self.width * 16)
            + kx * 16
            + 4 * (ic % 4)
            + (oc % 4)
    }

    /// Extent of the weight image the upload shader writes.
    pub fn image_extent(&self) -> Result<ImageExtent> {
        ImageExtent::new(
            align_up4(self.input_channels),
            up_div(self.output_channels, 4),
            self.height * self.width,
        )
    }
}

fn check_len(what: &str, len: usize, expected: usize, dims: &KernelDims) -> Result<()> {
    ensure_contract!(
        len == expected,
        "{} has {} floats, expected {} for kernel {:?}",
        what,
        len,
        expected,
        dims
    );
    Ok(())
}

/// Pack dense row-major weights into O4C4HW-i4o4 order. Padding lanes are zero.
pub fn repack_o4c4hw_i4o4(weights: &[f32], dims: KernelDims) -> Result<Vec<f32>> {
    check_len("weights", weights.len(), dims.numel(), &dims)?;

    let mut packed = vec![0.0f32; dims.packed_numel()];
    let mut src = weights.iter();
    for oc in 0..dims.output_channels {
        for ic in 0..dims.input_channels {
            for ky in 0..dims.height {
                for kx in 0..dims.width {
                    if let Some(&w) = src.next() {
                        packed[dims.packed_index(oc, ic, ky, kx)] = w;
                    }
                }
            }
        }
    }
    Ok(packed)
}

/// Inverse of [`repack_o4c4hw_i4o4`].
pub fn unpack_o4c4hw_i4o4(packed: &[f32], dims: KernelDims) -> Result<Vec<f32>> {
    check_len("packed weights", packed.len(), dims.packed_numel(), &dims)?;

    let mut weights = Vec::with_capacity(dims.numel());
    for oc in 0..dims.output_channels {
        for ic in 0..dims.input_channels {
            for ky in 0..dims.height {
                for kx in 0..dims.width {
                    weights.push(packed[dims.packed_index(oc, ic, ky, kx)]);
                }
            }
        }
    }
    Ok(weights)
}

/// Pack `weights` and upload them into `image`.
///
/// # Errors
///
/// Returns `ResourceSize` if `image` does not have [`KernelDims::image_extent`].
pub fn conv2d_prepack_weights_to_image(
    ctx: &VulkanContext,
    image: &GpuImage<'_>,
    weights: &[f32],
    dims: KernelDims,
) -> Result<()> {
    let expected = dims.image_extent()?;
    if image.extent() != expected {
        return Err(VulkanErrorKind::ResourceSize(format!(
            "weight image is {}, kernel {:?} needs {}",
            image.extent(),
            dims,
            expected
        )));
    }

    let packed = repack_o4c4hw_i4o4(weights, dims)?;
    let kernel_buffer =
        GpuBuffer::storage(ctx, (packed.len() * std::mem::size_of::<f32>()) as u64)?;
    kernel_buffer.copy_from_host(&packed)?;

    let c_4 = up_div(dims.input_channels, 4);
    let oc_4 = up_div(dims.output_channels, 4);
    let kernel_area = dims.height * dims.width;
    let constants = make_uniform_buffer(
        ctx,
        &RepackConstants {
            kernel_area: dim(kernel_area)?,
            channel_blocks: dim(c_4)?,
        },
    )?;

    log::debug!("Prepacking conv2d weights {:?} into {}", dims, expected);

    dispatch(
        ctx,
        names::KERNEL_O4C4HW_TO_IMAGE,
        &[
            Binding::OutputImage(image),
            Binding::InputBuffer(&kernel_buffer),
            Binding::Uniform(&constants),
        ],
        WorkGroupSize::SINGLE,
        Grid::cover(c_4, oc_4, kernel_area),
    )
}

/// Allocate a weight image and upload packed `weights` into it.
pub fn conv2d_prepack_weights_image<'a>(
    ctx: &'a VulkanContext,
    weights: &[f32],
    dims: KernelDims,
) -> Result<GpuImage<'a>> {
    let image = GpuImage::new(ctx, dims.image_extent()?)?;
    conv2d_prepack_weights_to_image(ctx, &image, weights, dims)?;
    Ok(image)
}

/// Pack `weights` into `output`'s image, which then holds the prepacked kernel.
pub fn conv2d_prepack_weights(
    output: &VulkanTensor<'_>,
    weights: &[f32],
    dims: KernelDims,
) -> Result<()> {
    let image = output.image_with_extent(dims.image_extent()?)?;
    conv2d_prepack_weights_to_image(output.context(), image, weights, dims)?;
    output.mark_image_written();
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn ramp(n: usize) -> Vec<f32> {
        (0..n).map(|i| i as f32 + 1.0).collect()
    }

    #[test]
    fn test_round_trip_reproduces_dense_weights() {
        for dims in [
            KernelDims::new(1, 1, 1, 1),
            KernelDims::new(4, 4, 3, 3),
            KernelDims::new(5, 3, 3, 2),
            KernelDims::new(7, 9, 1, 5),
        ] {
            let weights = ramp(dims.numel());
            let packed = repack_o4c4hw_i4o4(&weights, dims).unwrap();
            assert_eq!(packed.len(), dims.packed_numel());
            assert_eq!(unpack_o4c4hw_i4o4(&packed, dims).unwrap(), weights);
        }
    }

    #[test]
    fn test_padding_lanes_are_zero() {
        let dims = KernelDims::new(5, 3, 2, 2);
        let weights = ramp(dims.numel());
        let packed = repack_o4c4hw_i4o4(&weights, dims).unwrap();

        let nonzero = packed.iter().filter(|&&v| v != 0.0).count();
        assert_eq!(nonzero, dims.numel());
        assert_eq!(packed.len(), 8 * 4 * 2 * 2);
    }

    #[test]
    fn test_placement_follows_block_layout() {
        // OC=5, C=3, 1x1: weight (oc=4, ic=2) lands in block o4=1, lane 4*2+0.
        let dims = KernelDims::new(5, 3, 1, 1);
        let mut weights = vec![0.0; dims.numel()];
        weights[4 * 3 + 2] = 9.0;
        let packed = repack_o4c4hw_i4o4(&weights, dims).unwrap();
        assert_eq!(dims.packed_index(4, 2, 0, 0), 24);
        assert_eq!(packed[24], 9.0);

        // 3x3 kernel: ky/kx stride through 16-float blocks.
        let dims = KernelDims::new(4, 4, 3, 3);
        assert_eq!(dims.packed_index(0, 0, 0, 1), 16);
        assert_eq!(dims.packed_index(0, 0, 1, 0), 48);
        assert_eq!(dims.packed_index(1, 0, 0, 0), 1);
        assert_eq!(dims.packed_index(0, 1, 0, 0), 4);
    }

    #[test]
    fn test_wrong_length_is_contract_violation() {
        let dims = KernelDims::new(2, 2, 3, 3);
        assert!(repack_o4c4hw_i4o4(&[0.0; 5], dims)
            .unwrap_err()
            .is_contract_violation());
        assert!(unpack_o4c4hw_i4o4(&[0.0; 5], dims)
            .unwrap_err()
            .is_contract_violation());
    }

    #[test]
    fn test_weight_image_extent() {
        assert_eq!(
            KernelDims::new(8, 3, 3, 3).image_extent().unwrap(),
            ImageExtent { width: 4, height: 2, depth: 9 }
        );
        assert_eq!(
            KernelDims::new(5, 9, 1, 1).image_extent().unwrap(),
            ImageExtent { width: 12, height: 2, depth: 1 }
        );
    }
}
