//! Tensor handle
//!
//! A [`VulkanTensor`] owns up to two representations of the same data: a
//! linear NCHW buffer and a channel-packed image. Both are realised lazily and
//! at most once. An authority flag records which one holds the latest data;
//! reading the other one first converts on the device.

use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::OnceLock;

use crate::buffer::GpuBuffer;
use crate::catalog::names;
use crate::context::VulkanContext;
use crate::dispatch::{dispatch, Binding, Grid};
use crate::ensure_contract;
use crate::error::{Result, VulkanErrorKind};
use crate::image::GpuImage;
use crate::layout::{fold_whc, up_div, ImageExtent};
use crate::params::{dim, make_uniform_buffer, ImageNchwConstants};
use crate::pipeline::WorkGroupSize;

/// Which representation holds the latest data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Authority {
    Buffer = 0,
    Image = 1,
    Synchronized = 2,
}

/// One of the two representations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Storage {
    Buffer,
    Image,
}

impl Authority {
    fn from_u8(raw: u8) -> Self {
        match raw {
            1 => Authority::Image,
            2 => Authority::Synchronized,
            _ => Authority::Buffer,
        }
    }

    /// Authority after a write to `storage`.
    pub fn written(storage: Storage) -> Self {
        match storage {
            Storage::Buffer => Authority::Buffer,
            Storage::Image => Authority::Image,
        }
    }

    /// True when reading `storage` must first convert from the other one.
    pub fn is_stale(self, storage: Storage) -> bool {
        matches!(
            (self, storage),
            (Authority::Image, Storage::Buffer) | (Authority::Buffer, Storage::Image)
        )
    }
}

/// Fails with `ResourceSize` unless `actual` is the NCHW image extent of `shape`.
///
/// Images realised through [`VulkanTensor::image_with_extent`] hold packed
/// weights and never pass this check.
pub fn check_nchw_extent(shape: &[usize], actual: ImageExtent) -> Result<()> {
    let expected = ImageExtent::for_tensor(shape)?;
    if actual != expected {
        return Err(VulkanErrorKind::ResourceSize(format!(
            "tensor {:?} holds a {} image, not its NCHW layout {}",
            shape, actual, expected
        )));
    }
    Ok(())
}

pub struct VulkanTensor<'a> {
    ctx: &'a VulkanContext,
    shape: Vec<usize>,
    buffer: OnceLock<GpuBuffer<'a>>,
    image: OnceLock<GpuImage<'a>>,
    authority: AtomicU8,
}

impl<'a> VulkanTensor<'a> {
    /// A tensor of `shape` with no storage yet. Reads before any write see zeros.
    pub fn new(ctx: &'a VulkanContext, shape: &[usize]) -> Self {
        Self {
            ctx,
            shape: shape.to_vec(),
            buffer: OnceLock::new(),
            image: OnceLock::new(),
            authority: AtomicU8::new(Authority::Buffer as u8),
        }
    }

    /// A tensor of `shape` holding `data` (NCHW order).
    pub fn from_host(ctx: &'a VulkanContext, shape: &[usize], data: &[f32]) -> Result<Self> {
        let tensor = Self::new(ctx, shape);
        tensor.set_data_from_host(data)?;
        Ok(tensor)
    }

    pub fn context(&self) -> &'a VulkanContext {
        self.ctx
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn dim(&self) -> usize {
        self.shape.len()
    }

    pub fn numel(&self) -> usize {
        self.shape.iter().product()
    }

    pub fn size_bytes(&self) -> u64 {
        (self.numel() * std::mem::size_of::<f32>()) as u64
    }

    pub fn authority(&self) -> Authority {
        Authority::from_u8(self.authority.load(Ordering::Acquire))
    }

    pub fn has_buffer(&self) -> bool {
        self.buffer.get().is_some()
    }

    pub fn has_image(&self) -> bool {
        self.image.get().is_some()
    }

    /// Replace the contents with `data` (NCHW order). The buffer becomes authoritative.
    ///
    /// # Errors
    ///
    /// Returns `ContractViolation` if `data.len() != numel`.
    pub fn set_data_from_host(&self, data: &[f32]) -> Result<()> {
        ensure_contract!(
            data.len() == self.numel(),
            "host data has {} elements, tensor {:?} has {}",
            data.len(),
            self.shape,
            self.numel()
        );
        self.buffer()?.copy_from_host(data)?;
        self.mark_buffer_written();
        Ok(())
    }

    /// Download the contents in NCHW order, converting from the image first if needed.
    pub fn to_host(&self) -> Result<Vec<f32>> {
        self.buffer_for_read()?.copy_to_host::<f32>(self.numel())
    }

    /// The buffer, realised (zero-filled) on first use. No synchronisation.
    pub fn buffer(&self) -> Result<&GpuBuffer<'a>> {
        if let Some(buffer) = self.buffer.get() {
            return Ok(buffer);
        }
        let buffer = GpuBuffer::storage(self.ctx, self.size_bytes())?;
        buffer.set_zeros()?;
        log::trace!("Tensor {:?}: buffer realised ({} bytes)", self.shape, buffer.size());
        let _ = self.buffer.set(buffer);
        self.buffer
            .get()
            .ok_or_else(|| VulkanErrorKind::AllocationFailed("tensor buffer".to_string()))
    }

    /// The image, realised on first use with the tensor's own extent. No synchronisation.
    ///
    /// # Errors
    ///
    /// Returns `ResourceSize` if the image exists with another extent
    /// (prepacked weights).
    pub fn image(&self) -> Result<&GpuImage<'a>> {
        if let Some(image) = self.image.get() {
            check_nchw_extent(&self.shape, image.extent())?;
            return Ok(image);
        }
        self.realise_image(ImageExtent::for_tensor(&self.shape)?)
    }

    /// The image with an explicit extent (prepacked weights).
    ///
    /// # Errors
    ///
    /// Returns `ResourceSize` if the image already exists with another extent.
    pub fn image_with_extent(&self, extent: ImageExtent) -> Result<&GpuImage<'a>> {
        if let Some(image) = self.image.get() {
            if image.extent() != extent {
                return Err(VulkanErrorKind::ResourceSize(format!(
                    "tensor image is {}, requested {}",
                    image.extent(),
                    extent
                )));
            }
            return Ok(image);
        }
        self.realise_image(extent)
    }

    /// The buffer with current data, converting from the image if it is authoritative.
    pub fn buffer_for_read(&self) -> Result<&GpuBuffer<'a>> {
        if self.authority().is_stale(Storage::Buffer) {
            self.sync_image_to_buffer()?;
        }
        self.buffer()
    }

    /// The image with current data, converting from the buffer if it is authoritative.
    pub fn image_for_read(&self) -> Result<&GpuImage<'a>> {
        if self.authority().is_stale(Storage::Image) {
            self.sync_buffer_to_image()?;
        }
        self.image()
    }

    /// Record that a shader wrote the image.
    pub fn mark_image_written(&self) {
        self.set_authority(Authority::written(Storage::Image));
    }

    /// Record that the buffer was written (host upload or device copy).
    pub fn mark_buffer_written(&self) {
        self.set_authority(Authority::written(Storage::Buffer));
    }

    /// Convert buffer -> image with the `nchw_to_image` shader.
    pub fn sync_buffer_to_image(&self) -> Result<()> {
        let image = self.image()?;
        let extent = image.extent();
        let buffer = self.buffer()?;

        let constants = make_uniform_buffer(self.ctx, &self.nchw_constants()?)?;
        log::trace!("Tensor {:?}: buffer -> image", self.shape);
        dispatch(
            self.ctx,
            names::NCHW_TO_IMAGE,
            &[
                Binding::OutputImage(image),
                Binding::InputBuffer(buffer),
                Binding::Uniform(&constants),
            ],
            WorkGroupSize::SPATIAL,
            Grid::Cover([extent.width, extent.height, extent.depth]),
        )?;
        self.set_authority(Authority::Synchronized);
        Ok(())
    }

    /// Convert image -> buffer with the `image_to_nchw` shader.
    pub fn sync_image_to_buffer(&self) -> Result<()> {
        let image = self.image()?;
        let extent = image.extent();
        let buffer = self.buffer()?;

        let constants = make_uniform_buffer(self.ctx, &self.nchw_constants()?)?;
        log::trace!("Tensor {:?}: image -> buffer", self.shape);
        dispatch(
            self.ctx,
            names::IMAGE_TO_NCHW,
            &[
                Binding::OutputBuffer(buffer),
                Binding::InputImage(image),
                Binding::Uniform(&constants),
            ],
            WorkGroupSize::SPATIAL,
            Grid::Cover([extent.width, extent.height, extent.depth]),
        )?;
        self.set_authority(Authority::Synchronized);
        Ok(())
    }

    fn realise_image(&self, extent: ImageExtent) -> Result<&GpuImage<'a>> {
        let image = GpuImage::new(self.ctx, extent)?;
        log::trace!("Tensor {:?}: image realised ({})", self.shape, extent);
        let _ = self.image.set(image);
        self.image
            .get()
            .ok_or_else(|| VulkanErrorKind::AllocationFailed("tensor image".to_string()))
    }

    fn nchw_constants(&self) -> Result<ImageNchwConstants> {
        let (w, h, c) = fold_whc(&self.shape)?;
        Ok(ImageNchwConstants {
            width: dim(w)?,
            height: dim(h)?,
            channels: dim(c)?,
            channel_blocks: dim(up_div(c, 4))?,
        })
    }

    fn set_authority(&self, authority: Authority) {
        self.authority.store(authority as u8, Ordering::Release);
    }
}

impl std::fmt::Debug for VulkanTensor<'_> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VulkanTensor")
            .field("shape", &self.shape)
            .field("authority", &self.authority())
            .field("has_buffer", &self.has_buffer())
            .field("has_image", &self.has_image())
            .finish()
    }
}
