//! Operator constant blocks
//!
//! One `#[repr(C)]` struct per operator family. Field order and widths are
//! the binding contract with the shader's uniform block; do not reorder.
//! Blocks are uploaded once per dispatch as a uniform buffer.

use bytemuck::{Pod, Zeroable};

use crate::buffer::GpuBuffer;
use crate::context::VulkanContext;
use crate::error::{Result, VulkanErrorKind};

// =============================================================================
// CONSTANT BLOCKS
// =============================================================================

/// `upsampleNearest2d`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UpsampleConstants {
    pub input_width: i32,
    pub input_height: i32,
    pub output_width: i32,
    pub output_height: i32,
    pub scale_x: f32,
    pub scale_y: f32,
}

/// `adaptive_avg_pool2d`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct AdaptivePoolConstants {
    pub input_width: i32,
    pub input_height: i32,
    pub output_width: i32,
    pub output_height: i32,
}

/// `max_pool2d`. Sizes are `{W, H, C, 0}`, pairs are `{x, y}`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MaxPoolConstants {
    pub input_size: [i32; 4],
    pub output_size: [i32; 4],
    pub kernel: [i32; 2],
    pub stride: [i32; 2],
    pub padding: [i32; 2],
    pub dilation: [i32; 2],
}

/// `add` (tensor + alpha * tensor)
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AddConstants {
    pub width: i32,
    pub height: i32,
    pub channels: i32,
    pub alpha: f32,
}

/// `add_scalar` / `mul_scalar`. `input_size` is `{W, H, C, 0}`.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ScalarConstants {
    pub input_size: [i32; 4],
    pub scalar: f32,
}

/// `conv2d_dw_clamp` / `conv2d_nogroup_clamp`.
///
/// Sizes are `{W, H, C_4, C}`; the depthwise shader expects the last lane
/// to be 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Conv2dConstants {
    pub padding: [i32; 2],
    pub kernel: [i32; 2],
    pub stride: [i32; 2],
    pub dilation: [i32; 2],
    pub output_size: [i32; 4],
    pub input_size: [i32; 4],
    pub output_min: f32,
    pub output_max: f32,
}

/// `clamp`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct ClampConstants {
    pub width: i32,
    pub height: i32,
    pub channel_blocks: i32,
    pub channels: i32,
    pub min: f32,
    pub max: f32,
}

/// `addmm` / `mm`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct AddmmConstants {
    pub output_width: i32,
    pub output_height: i32,
    pub channel_blocks: i32,
    pub channels: i32,
    pub beta: f32,
    pub alpha: f32,
    pub k: i32,
}

/// `mean`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct MeanConstants {
    pub width: i32,
    pub height: i32,
    pub channels: i32,
    pub batch: i32,
}

/// `KO4C4HW_to_image`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct RepackConstants {
    pub kernel_area: i32,
    pub channel_blocks: i32,
}

/// `nchw_to_image` / `image_to_nchw`
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Pod, Zeroable)]
pub struct ImageNchwConstants {
    pub width: i32,
    pub height: i32,
    pub channels: i32,
    pub channel_blocks: i32,
}

// =============================================================================
// HELPERS
// =============================================================================

/// Converts a host dimension to the shader's `int32`.
///
/// # Errors
///
/// Returns `ResourceSize` if `value` does not fit.
#[inline]
pub fn dim(value: usize) -> Result<i32> {
    i32::try_from(value).map_err(|_| {
        VulkanErrorKind::ResourceSize(format!("dimension {} exceeds the shader's int32 range", value))
    })
}

/// `(min, max)` with absent bounds replaced by -inf / +inf.
pub fn clamp_bounds(min: Option<f32>, max: Option<f32>) -> (f32, f32) {
    (
        min.unwrap_or(f32::NEG_INFINITY),
        max.unwrap_or(f32::INFINITY),
    )
}

/// Upload `block` into a fresh uniform buffer.
pub fn make_uniform_buffer<'a, T: Pod>(ctx: &'a VulkanContext, block: &T) -> Result<GpuBuffer<'a>> {
    let buffer = GpuBuffer::uniform(ctx, std::mem::size_of::<T>() as u64)?;
    buffer.copy_from_host(std::slice::from_ref(block))?;
    Ok(buffer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::mem::{offset_of, size_of};

    #[test]
    fn test_constant_block_sizes() {
        assert_eq!(size_of::<UpsampleConstants>(), 24);
        assert_eq!(size_of::<AdaptivePoolConstants>(), 16);
        assert_eq!(size_of::<MaxPoolConstants>(), 64);
        assert_eq!(size_of::<AddConstants>(), 16);
        assert_eq!(size_of::<ScalarConstants>(), 20);
        assert_eq!(size_of::<Conv2dConstants>(), 72);
        assert_eq!(size_of::<ClampConstants>(), 24);
        assert_eq!(size_of::<AddmmConstants>(), 28);
        assert_eq!(size_of::<MeanConstants>(), 16);
        assert_eq!(size_of::<RepackConstants>(), 8);
        assert_eq!(size_of::<ImageNchwConstants>(), 16);
    }

    #[test]
    fn test_conv2d_field_offsets() {
        assert_eq!(offset_of!(Conv2dConstants, padding), 0);
        assert_eq!(offset_of!(Conv2dConstants, kernel), 8);
        assert_eq!(offset_of!(Conv2dConstants, stride), 16);
        assert_eq!(offset_of!(Conv2dConstants, dilation), 24);
        assert_eq!(offset_of!(Conv2dConstants, output_size), 32);
        assert_eq!(offset_of!(Conv2dConstants, input_size), 48);
        assert_eq!(offset_of!(Conv2dConstants, output_min), 64);
        assert_eq!(offset_of!(Conv2dConstants, output_max), 68);
    }

    #[test]
    fn test_max_pool_and_addmm_offsets() {
        assert_eq!(offset_of!(MaxPoolConstants, output_size), 16);
        assert_eq!(offset_of!(MaxPoolConstants, kernel), 32);
        assert_eq!(offset_of!(MaxPoolConstants, dilation), 56);
        assert_eq!(offset_of!(AddmmConstants, beta), 16);
        assert_eq!(offset_of!(AddmmConstants, k), 24);
        assert_eq!(offset_of!(ScalarConstants, scalar), 16);
    }

    #[test]
    fn test_bytes_are_little_endian_fields() {
        let block = AddConstants {
            width: 3,
            height: 2,
            channels: 5,
            alpha: 0.5,
        };
        let bytes = bytemuck::bytes_of(&block);
        assert_eq!(&bytes[0..4], &3i32.to_ne_bytes());
        assert_eq!(&bytes[8..12], &5i32.to_ne_bytes());
        assert_eq!(&bytes[12..16], &0.5f32.to_ne_bytes());
    }

    #[test]
    fn test_clamp_bounds_default_to_infinity() {
        assert_eq!(clamp_bounds(None, None), (f32::NEG_INFINITY, f32::INFINITY));
        assert_eq!(clamp_bounds(Some(0.0), Some(6.0)), (0.0, 6.0));
        assert_eq!(clamp_bounds(None, Some(1.0)), (f32::NEG_INFINITY, 1.0));
    }

    #[test]
    fn test_dim_rejects_values_past_int32() {
        assert_eq!(dim(0).unwrap(), 0);
        assert_eq!(dim(i32::MAX as usize).unwrap(), i32::MAX);
        let err = dim(i32::MAX as usize + 1).unwrap_err();
        assert!(matches!(err, VulkanErrorKind::ResourceSize(_)));
    }
}
