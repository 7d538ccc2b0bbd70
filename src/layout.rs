//! Channel-packed ("C4") layout arithmetic.
//!
//! Tensors are left-padded to `[N, C, H, W]`; the leading two dims fold into
//! a channel count that is packed four per texel along image depth.

use crate::ensure_contract;
use crate::error::{Result, VulkanErrorKind};

/// Maximum tensor rank the image layout (and the shaders) support.
pub const MAX_DIM: usize = 4;

#[inline]
pub fn up_div(x: usize, d: usize) -> usize {
    x.div_ceil(d)
}

#[inline]
pub fn align_up4(x: usize) -> usize {
    up_div(x, 4) * 4
}

#[inline]
pub fn round_up(x: u64, alignment: u64) -> u64 {
    if alignment <= 1 {
        return x;
    }
    x.div_ceil(alignment) * alignment
}

/// Left-pads `shape` with ones to exactly four dims.
pub fn pad_to_4d(shape: &[usize]) -> Result<[usize; 4]> {
    ensure_contract!(
        shape.len() <= MAX_DIM,
        "tensors are implemented for dim <= {}, got dim {}",
        MAX_DIM,
        shape.len()
    );
    let mut padded = [1usize; 4];
    padded[MAX_DIM - shape.len()..].copy_from_slice(shape);
    Ok(padded)
}

/// `(W, H, C)` with every dim before the last two folded into `C`.
pub fn fold_whc(shape: &[usize]) -> Result<(usize, usize, usize)> {
    let [n, c, h, w] = pad_to_4d(shape)?;
    Ok((w, h, n * c))
}

/// 3-D extent of an image in texels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ImageExtent {
    pub width: u32,
    pub height: u32,
    pub depth: u32,
}

impl ImageExtent {
    /// Zero-sized axes become 1; Vulkan rejects empty images.
    ///
    /// # Errors
    ///
    /// Returns `ResourceSize` if an axis does not fit in `u32`.
    pub fn new(width: usize, height: usize, depth: usize) -> Result<Self> {
        Ok(Self {
            width: texels(width)?,
            height: texels(height)?,
            depth: texels(depth)?,
        })
    }

    /// Extent of the image holding a tensor of `shape`.
    pub fn for_tensor(shape: &[usize]) -> Result<Self> {
        let (w, h, c) = fold_whc(shape)?;
        Self::new(w, h, up_div(c, 4))
    }

    pub fn texel_count(&self) -> usize {
        self.width as usize * self.height as usize * self.depth as usize
    }
}

fn texels(len: usize) -> Result<u32> {
    u32::try_from(len.max(1))
        .map_err(|_| VulkanErrorKind::ResourceSize(format!("image axis of {} texels exceeds u32", len)))
}

impl std::fmt::Display for ImageExtent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.width, self.height, self.depth)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_up_div_and_align() {
        assert_eq!(up_div(0, 4), 0);
        assert_eq!(up_div(1, 4), 1);
        assert_eq!(up_div(8, 4), 2);
        assert_eq!(up_div(9, 4), 3);
        assert_eq!(align_up4(5), 8);
        assert_eq!(align_up4(12), 12);
        assert_eq!(round_up(20, 16), 32);
        assert_eq!(round_up(32, 16), 32);
        assert_eq!(round_up(7, 0), 7);
    }

    #[test]
    fn test_pad_to_4d() {
        assert_eq!(pad_to_4d(&[]).unwrap(), [1, 1, 1, 1]);
        assert_eq!(pad_to_4d(&[5]).unwrap(), [1, 1, 1, 5]);
        assert_eq!(pad_to_4d(&[3, 5]).unwrap(), [1, 1, 3, 5]);
        assert_eq!(pad_to_4d(&[2, 3, 4, 5]).unwrap(), [2, 3, 4, 5]);
        assert!(pad_to_4d(&[1, 2, 3, 4, 5]).unwrap_err().is_contract_violation());
    }

    #[test]
    fn test_image_extent_packs_channels() {
        assert_eq!(
            ImageExtent::for_tensor(&[1, 3, 8, 6]).unwrap(),
            ImageExtent { width: 6, height: 8, depth: 1 }
        );
        assert_eq!(
            ImageExtent::for_tensor(&[2, 3, 8, 6]).unwrap(),
            ImageExtent { width: 6, height: 8, depth: 2 }
        );
        assert_eq!(
            ImageExtent::for_tensor(&[4, 7]).unwrap(),
            ImageExtent { width: 7, height: 4, depth: 1 }
        );
        // depth * 4 >= channels
        let extent = ImageExtent::for_tensor(&[9, 2, 2]).unwrap();
        assert!(extent.depth as usize * 4 >= 9);
    }

    #[test]
    fn test_zero_sized_extent_clamps() {
        let extent = ImageExtent::for_tensor(&[0, 4]).unwrap();
        assert_eq!(extent, ImageExtent { width: 4, height: 1, depth: 1 });
        assert_eq!(extent.texel_count(), 4);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_extent_past_u32_is_rejected() {
        assert!(ImageExtent::new(u32::MAX as usize, 1, 1).is_ok());
        let err = ImageExtent::new(1, u32::MAX as usize + 1, 1).unwrap_err();
        assert!(matches!(err, VulkanErrorKind::ResourceSize(_)));
    }
}
