//! Device-resident images
//!
//! 3-D `RGBA32F` images in the channel-packed layout described in
//! [`crate::layout`]. Operators write them as storage images and read them
//! through a nearest-filtering sampler.

use std::sync::atomic::{AtomicI32, Ordering};

use ash::{vk, Device};

use crate::context::VulkanContext;
use crate::error::{Result, VulkanErrorKind};
pub use crate::layout::ImageExtent;

pub const IMAGE_FORMAT: vk::Format = vk::Format::R32G32B32A32_SFLOAT;

/// Stage and access masks for one layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub src_stage: vk::PipelineStageFlags,
    pub src_access: vk::AccessFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub dst_access: vk::AccessFlags,
}

/// Masks for moving an image from `old` to `new`, covering whatever the
/// previous layout implies was last done to it.
pub fn transition(old: vk::ImageLayout, new: vk::ImageLayout) -> Transition {
    let (src_stage, src_access) = match old {
        vk::ImageLayout::UNDEFINED => {
            (vk::PipelineStageFlags::TOP_OF_PIPE, vk::AccessFlags::empty())
        }
        vk::ImageLayout::GENERAL => (
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::SHADER_READ,
        ),
        vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL => {
            (vk::PipelineStageFlags::COMPUTE_SHADER, vk::AccessFlags::SHADER_READ)
        }
        _ => (
            vk::PipelineStageFlags::ALL_COMMANDS,
            vk::AccessFlags::MEMORY_WRITE | vk::AccessFlags::MEMORY_READ,
        ),
    };

    let dst_access = match new {
        vk::ImageLayout::GENERAL => vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::SHADER_READ,
        _ => vk::AccessFlags::SHADER_READ,
    };

    Transition {
        src_stage,
        src_access,
        dst_stage: vk::PipelineStageFlags::COMPUTE_SHADER,
        dst_access,
    }
}

/// Layout an image is in once the recorded barriers have executed.
///
/// Advanced while barriers are recorded; reset to `UNDEFINED` when the
/// submission carrying them fails, so the next barrier does not assume a
/// transition that never ran.
#[derive(Debug)]
pub struct LayoutTracker(AtomicI32);

impl LayoutTracker {
    pub fn new() -> Self {
        Self(AtomicI32::new(vk::ImageLayout::UNDEFINED.as_raw()))
    }

    pub fn current(&self) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Moves to `new`, returning the layout the barrier transitions from.
    pub fn advance(&self, new: vk::ImageLayout) -> vk::ImageLayout {
        vk::ImageLayout::from_raw(self.0.swap(new.as_raw(), Ordering::AcqRel))
    }

    pub fn reset(&self) {
        self.0.store(vk::ImageLayout::UNDEFINED.as_raw(), Ordering::Release);
    }
}

impl Default for LayoutTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// 3-D storage/sampled image with its view and sampler.
pub struct GpuImage<'a> {
    ctx: &'a VulkanContext,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
    sampler: vk::Sampler,
    extent: ImageExtent,
    layout: LayoutTracker,
}

impl<'a> GpuImage<'a> {
    /// Allocate a device-local image of `extent` texels.
    ///
    /// # Errors
    ///
    /// Returns `VulkanErrorKind::AllocationFailed` on image, memory, view or
    /// sampler creation failure; partially created objects are destroyed.
    pub fn new(ctx: &'a VulkanContext, extent: ImageExtent) -> Result<Self> {
        let device = ctx.device();

        let image_info = vk::ImageCreateInfo::default()
            .image_type(vk::ImageType::TYPE_3D)
            .format(IMAGE_FORMAT)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: extent.depth,
            })
            .mip_levels(1)
            .array_layers(1)
            .samples(vk::SampleCountFlags::TYPE_1)
            .tiling(vk::ImageTiling::OPTIMAL)
            .usage(vk::ImageUsageFlags::STORAGE | vk::ImageUsageFlags::SAMPLED)
            .sharing_mode(vk::SharingMode::EXCLUSIVE)
            .initial_layout(vk::ImageLayout::UNDEFINED);

        let image = unsafe { device.create_image(&image_info, None) }
            .map_err(|e| VulkanErrorKind::allocation("vkCreateImage", e))?;

        // Owns whatever has been created so far; disarmed on success.
        let mut partial = PartialImage {
            device,
            image,
            memory: vk::DeviceMemory::null(),
            view: vk::ImageView::null(),
        };

        let requirements = unsafe { device.get_image_memory_requirements(image) };
        let memory_type_index = ctx
            .find_memory_type(
                requirements.memory_type_bits,
                vk::MemoryPropertyFlags::DEVICE_LOCAL,
            )
            .or_else(|| {
                ctx.find_memory_type(requirements.memory_type_bits, vk::MemoryPropertyFlags::empty())
            })
            .ok_or_else(|| {
                VulkanErrorKind::AllocationFailed("no memory type for image".to_string())
            })?;

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);
        partial.memory = unsafe { device.allocate_memory(&alloc_info, None) }
            .map_err(|e| VulkanErrorKind::allocation("vkAllocateMemory", e))?;

        unsafe { device.bind_image_memory(image, partial.memory, 0) }
            .map_err(|e| VulkanErrorKind::allocation("vkBindImageMemory", e))?;

        let view_info = vk::ImageViewCreateInfo::default()
            .image(image)
            .view_type(vk::ImageViewType::TYPE_3D)
            .format(IMAGE_FORMAT)
            .subresource_range(color_subresource_range());
        partial.view = unsafe { device.create_image_view(&view_info, None) }
            .map_err(|e| VulkanErrorKind::allocation("vkCreateImageView", e))?;

        let sampler_info = vk::SamplerCreateInfo::default()
            .mag_filter(vk::Filter::NEAREST)
            .min_filter(vk::Filter::NEAREST)
            .mipmap_mode(vk::SamplerMipmapMode::NEAREST)
            .address_mode_u(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_v(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .address_mode_w(vk::SamplerAddressMode::CLAMP_TO_EDGE)
            .border_color(vk::BorderColor::FLOAT_TRANSPARENT_BLACK)
            .unnormalized_coordinates(false);
        let sampler = unsafe { device.create_sampler(&sampler_info, None) }
            .map_err(|e| VulkanErrorKind::allocation("vkCreateSampler", e))?;

        let (memory, view) = partial.disarm();

        log::trace!("GpuImage created: {}", extent);

        Ok(Self {
            ctx,
            image,
            memory,
            view,
            sampler,
            extent,
            layout: LayoutTracker::new(),
        })
    }

    pub fn handle(&self) -> vk::Image {
        self.image
    }

    pub fn extent(&self) -> ImageExtent {
        self.extent
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout.current()
    }

    /// Forget the tracked layout after a failed submission.
    pub(crate) fn reset_layout(&self) {
        log::debug!("GpuImage {}: layout reset after failed submission", self.extent);
        self.layout.reset();
    }

    /// Descriptor for binding as an output (storage) image.
    pub fn storage_descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .image_view(self.view)
            .image_layout(vk::ImageLayout::GENERAL)
    }

    /// Descriptor for binding as a sampled input image.
    pub fn sampled_descriptor_info(&self) -> vk::DescriptorImageInfo {
        vk::DescriptorImageInfo::default()
            .sampler(self.sampler)
            .image_view(self.view)
            .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
    }

    /// Transition to `GENERAL` for shader writes.
    pub fn barrier_to_general(&self, device: &Device, cmd: vk::CommandBuffer) {
        self.record_transition(device, cmd, vk::ImageLayout::GENERAL);
    }

    /// Transition to `SHADER_READ_ONLY_OPTIMAL` for sampled reads.
    pub fn barrier_to_shader_read(&self, device: &Device, cmd: vk::CommandBuffer) {
        self.record_transition(device, cmd, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
    }

    // Always records a barrier, even when the layout is unchanged, so that
    // writes from an earlier submission are made visible.
    fn record_transition(&self, device: &Device, cmd: vk::CommandBuffer, new: vk::ImageLayout) {
        let old = self.layout.advance(new);
        let masks = transition(old, new);

        let barrier = vk::ImageMemoryBarrier::default()
            .old_layout(old)
            .new_layout(new)
            .src_access_mask(masks.src_access)
            .dst_access_mask(masks.dst_access)
            .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
            .image(self.image)
            .subresource_range(color_subresource_range());

        unsafe {
            device.cmd_pipeline_barrier(
                cmd,
                masks.src_stage,
                masks.dst_stage,
                vk::DependencyFlags::empty(),
                &[],
                &[],
                std::slice::from_ref(&barrier),
            );
        }
    }
}

impl Drop for GpuImage<'_> {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_sampler(self.sampler, None);
            device.destroy_image_view(self.view, None);
            device.destroy_image(self.image, None);
            device.free_memory(self.memory, None);
        }
    }
}

fn color_subresource_range() -> vk::ImageSubresourceRange {
    vk::ImageSubresourceRange::default()
        .aspect_mask(vk::ImageAspectFlags::COLOR)
        .base_mip_level(0)
        .level_count(1)
        .base_array_layer(0)
        .layer_count(1)
}

struct PartialImage<'d> {
    device: &'d Device,
    image: vk::Image,
    memory: vk::DeviceMemory,
    view: vk::ImageView,
}

impl PartialImage<'_> {
    fn disarm(mut self) -> (vk::DeviceMemory, vk::ImageView) {
        let out = (self.memory, self.view);
        self.image = vk::Image::null();
        self.memory = vk::DeviceMemory::null();
        self.view = vk::ImageView::null();
        out
    }
}

impl Drop for PartialImage<'_> {
    fn drop(&mut self) {
        unsafe {
            if self.view != vk::ImageView::null() {
                self.device.destroy_image_view(self.view, None);
            }
            if self.image != vk::Image::null() {
                self.device.destroy_image(self.image, None);
            }
            if self.memory != vk::DeviceMemory::null() {
                self.device.free_memory(self.memory, None);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_tracker_advances_and_resets() {
        let tracker = LayoutTracker::new();
        assert_eq!(tracker.advance(vk::ImageLayout::GENERAL), vk::ImageLayout::UNDEFINED);
        assert_eq!(
            tracker.advance(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL),
            vk::ImageLayout::GENERAL
        );

        // submission failed: the next barrier starts from UNDEFINED again
        tracker.reset();
        assert_eq!(tracker.current(), vk::ImageLayout::UNDEFINED);
        assert_eq!(tracker.advance(vk::ImageLayout::GENERAL), vk::ImageLayout::UNDEFINED);
    }

    #[test]
    fn test_first_write_waits_on_nothing() {
        let t = transition(vk::ImageLayout::UNDEFINED, vk::ImageLayout::GENERAL);
        assert_eq!(t.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert!(t.src_access.is_empty());
        assert!(t.dst_access.contains(vk::AccessFlags::SHADER_WRITE));
    }

    #[test]
    fn test_read_after_write_waits_on_shader_write() {
        let t = transition(vk::ImageLayout::GENERAL, vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL);
        assert_eq!(t.src_stage, vk::PipelineStageFlags::COMPUTE_SHADER);
        assert!(t.src_access.contains(vk::AccessFlags::SHADER_WRITE));
        assert_eq!(t.dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn test_write_after_read_waits_on_shader_read() {
        let t = transition(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL, vk::ImageLayout::GENERAL);
        assert_eq!(t.src_access, vk::AccessFlags::SHADER_READ);
        assert!(t.dst_access.contains(vk::AccessFlags::SHADER_WRITE));
    }

    #[test]
    fn test_same_layout_still_synchronizes_writes() {
        let t = transition(vk::ImageLayout::GENERAL, vk::ImageLayout::GENERAL);
        assert!(t.src_access.contains(vk::AccessFlags::SHADER_WRITE));
        assert!(t.dst_access.contains(vk::AccessFlags::SHADER_WRITE));
    }
}
