//! Device-resident buffers
//!
//! Linear, host-mappable device memory used for tensor data in NCHW order,
//! bias vectors, packed weights and constant blocks.

use ash::{vk, Device};
use bytemuck::Pod;
use parking_lot::{Mutex, MutexGuard};

use crate::context::VulkanContext;
use crate::error::{Result, VulkanErrorKind};
use crate::layout::round_up;

// =============================================================================
// GPU BUFFER
// =============================================================================

/// Host-visible buffer with its backing memory.
pub struct GpuBuffer<'a> {
    ctx: &'a VulkanContext,
    buffer: vk::Buffer,
    memory: vk::DeviceMemory,
    size: u64,
    coherent: bool,
    // One mapping at a time per allocation.
    map_lock: Mutex<()>,
}

impl<'a> GpuBuffer<'a> {
    /// Create a buffer of `size` bytes (zero-sized requests allocate 4 bytes).
    ///
    /// # Errors
    ///
    /// Returns `VulkanErrorKind::AllocationFailed` if no host-visible memory
    /// type fits or the allocation is rejected.
    pub fn new(ctx: &'a VulkanContext, size: u64, usage: vk::BufferUsageFlags) -> Result<Self> {
        let device = ctx.device();
        let alloc_size = size.max(4);

        let buffer_info = vk::BufferCreateInfo::default()
            .size(alloc_size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.create_buffer(&buffer_info, None) }
            .map_err(|e| VulkanErrorKind::allocation("vkCreateBuffer", e))?;

        let requirements = unsafe { device.get_buffer_memory_requirements(buffer) };

        let coherent_flags =
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        let (memory_type_index, coherent) =
            match ctx.find_memory_type(requirements.memory_type_bits, coherent_flags) {
                Some(index) => (Some(index), true),
                None => (
                    ctx.find_memory_type(
                        requirements.memory_type_bits,
                        vk::MemoryPropertyFlags::HOST_VISIBLE,
                    ),
                    false,
                ),
            };
        let Some(memory_type_index) = memory_type_index else {
            unsafe { device.destroy_buffer(buffer, None) };
            return Err(VulkanErrorKind::AllocationFailed(
                "no host-visible memory type for buffer".to_string(),
            ));
        };

        let alloc_info = vk::MemoryAllocateInfo::default()
            .allocation_size(requirements.size)
            .memory_type_index(memory_type_index);

        let memory = match unsafe { device.allocate_memory(&alloc_info, None) } {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.destroy_buffer(buffer, None) };
                return Err(VulkanErrorKind::allocation("vkAllocateMemory", e));
            }
        };

        if let Err(e) = unsafe { device.bind_buffer_memory(buffer, memory, 0) } {
            unsafe {
                device.destroy_buffer(buffer, None);
                device.free_memory(memory, None);
            }
            return Err(VulkanErrorKind::allocation("vkBindBufferMemory", e));
        }

        log::trace!(
            "GpuBuffer created: {} bytes (usage={:?}, coherent={})",
            alloc_size,
            usage,
            coherent
        );

        Ok(Self {
            ctx,
            buffer,
            memory,
            size: alloc_size,
            coherent,
            map_lock: Mutex::new(()),
        })
    }

    /// Storage buffer usable as a shader operand and as a copy source/target.
    pub fn storage(ctx: &'a VulkanContext, size: u64) -> Result<Self> {
        Self::new(
            ctx,
            size,
            vk::BufferUsageFlags::STORAGE_BUFFER
                | vk::BufferUsageFlags::TRANSFER_SRC
                | vk::BufferUsageFlags::TRANSFER_DST,
        )
    }

    /// Storage buffer rounded up to the device's storage offset alignment.
    pub fn storage_aligned(ctx: &'a VulkanContext, size: u64) -> Result<Self> {
        let aligned = round_up(size, ctx.limits().min_storage_buffer_offset_alignment);
        Self::storage(ctx, aligned)
    }

    /// Uniform buffer for a constant block, rounded up to the uniform offset alignment.
    pub fn uniform(ctx: &'a VulkanContext, size: u64) -> Result<Self> {
        let aligned = round_up(size, ctx.limits().min_uniform_buffer_offset_alignment);
        Self::new(ctx, aligned, vk::BufferUsageFlags::UNIFORM_BUFFER)
    }

    pub fn handle(&self) -> vk::Buffer {
        self.buffer
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn context(&self) -> &'a VulkanContext {
        self.ctx
    }

    pub fn descriptor_info(&self) -> vk::DescriptorBufferInfo {
        vk::DescriptorBufferInfo::default()
            .buffer(self.buffer)
            .offset(0)
            .range(self.size)
    }

    /// Map the whole allocation. Non-coherent memory is invalidated first.
    pub fn map(&self) -> Result<MappedMemory<'_>> {
        let guard = self.map_lock.lock();
        let device = self.ctx.device();

        let ptr = unsafe {
            device.map_memory(self.memory, 0, vk::WHOLE_SIZE, vk::MemoryMapFlags::empty())
        }
        .map_err(|e| VulkanErrorKind::allocation("vkMapMemory", e))?;

        let mapped = MappedMemory {
            device,
            memory: self.memory,
            ptr: ptr.cast::<u8>(),
            len: self.size as usize,
            coherent: self.coherent,
            _guard: guard,
        };
        mapped.invalidate()?;
        Ok(mapped)
    }

    /// Upload `data` to the start of the buffer.
    ///
    /// # Errors
    ///
    /// Returns `VulkanErrorKind::ResourceSize` if `data` is larger than the buffer.
    pub fn copy_from_host<T: Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        if bytes.len() as u64 > self.size {
            return Err(VulkanErrorKind::ResourceSize(format!(
                "host data of {} bytes exceeds buffer size {}",
                bytes.len(),
                self.size
            )));
        }

        let mut mapped = self.map()?;
        mapped.as_mut_slice()[..bytes.len()].copy_from_slice(bytes);
        mapped.flush_write_to_device()
    }

    /// Download the first `count` elements of type `T`.
    pub fn copy_to_host<T: Pod>(&self, count: usize) -> Result<Vec<T>> {
        let byte_len = count * std::mem::size_of::<T>();
        if byte_len as u64 > self.size {
            return Err(VulkanErrorKind::ResourceSize(format!(
                "requested {} bytes from buffer of size {}",
                byte_len, self.size
            )));
        }

        let mut out = vec![T::zeroed(); count];
        let mapped = self.map()?;
        bytemuck::cast_slice_mut::<T, u8>(&mut out).copy_from_slice(&mapped.as_slice()[..byte_len]);
        Ok(out)
    }

    /// Fill the whole buffer with zero bytes.
    pub fn set_zeros(&self) -> Result<()> {
        let mut mapped = self.map()?;
        mapped.as_mut_slice().fill(0);
        mapped.flush_write_to_device()
    }
}

impl Drop for GpuBuffer<'_> {
    fn drop(&mut self) {
        let device = self.ctx.device();
        unsafe {
            device.destroy_buffer(self.buffer, None);
            device.free_memory(self.memory, None);
        }
    }
}

// =============================================================================
// MAPPED MEMORY
// =============================================================================

/// A host mapping of a [`GpuBuffer`]; unmapped on drop.
pub struct MappedMemory<'b> {
    device: &'b Device,
    memory: vk::DeviceMemory,
    ptr: *mut u8,
    len: usize,
    coherent: bool,
    _guard: MutexGuard<'b, ()>,
}

impl MappedMemory<'_> {
    pub fn as_slice(&self) -> &[u8] {
        unsafe { std::slice::from_raw_parts(self.ptr, self.len) }
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        unsafe { std::slice::from_raw_parts_mut(self.ptr, self.len) }
    }

    /// Make host writes visible to the device. No-op on coherent memory.
    pub fn flush_write_to_device(&self) -> Result<()> {
        if self.coherent {
            return Ok(());
        }
        let range = self.whole_range();
        unsafe { self.device.flush_mapped_memory_ranges(std::slice::from_ref(&range)) }
            .map_err(|e| VulkanErrorKind::allocation("vkFlushMappedMemoryRanges", e))
    }

    fn invalidate(&self) -> Result<()> {
        if self.coherent {
            return Ok(());
        }
        let range = self.whole_range();
        unsafe {
            self.device
                .invalidate_mapped_memory_ranges(std::slice::from_ref(&range))
        }
        .map_err(|e| VulkanErrorKind::allocation("vkInvalidateMappedMemoryRanges", e))
    }

    fn whole_range(&self) -> vk::MappedMemoryRange<'static> {
        vk::MappedMemoryRange::default()
            .memory(self.memory)
            .offset(0)
            .size(vk::WHOLE_SIZE)
    }
}

impl Drop for MappedMemory<'_> {
    fn drop(&mut self) {
        unsafe { self.device.unmap_memory(self.memory) };
    }
}

// =============================================================================
// BUFFER COPIES
// =============================================================================

/// Record a global memory barrier.
pub(crate) fn record_memory_barrier(
    device: &Device,
    cmd: vk::CommandBuffer,
    src_stage: vk::PipelineStageFlags,
    src_access: vk::AccessFlags,
    dst_stage: vk::PipelineStageFlags,
    dst_access: vk::AccessFlags,
) {
    let barrier = vk::MemoryBarrier::default()
        .src_access_mask(src_access)
        .dst_access_mask(dst_access);

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            src_stage,
            dst_stage,
            vk::DependencyFlags::empty(),
            std::slice::from_ref(&barrier),
            &[],
            &[],
        );
    }
}

/// Check that `[offset, offset + size)` lies inside a buffer of `buffer_size` bytes.
pub fn check_copy_range(what: &str, buffer_size: u64, offset: u64, size: u64) -> Result<()> {
    let end = offset.checked_add(size);
    match end {
        Some(end) if end <= buffer_size => Ok(()),
        _ => Err(VulkanErrorKind::ResourceSize(format!(
            "{} range [{}, {}+{}) exceeds buffer size {}",
            what, offset, offset, size, buffer_size
        ))),
    }
}

/// One copy region, recorded without barriers.
pub(crate) fn record_buffer_copy(
    device: &Device,
    cmd: vk::CommandBuffer,
    src: &GpuBuffer<'_>,
    dst: &GpuBuffer<'_>,
    size: u64,
    src_offset: u64,
    dst_offset: u64,
) {
    let region = vk::BufferCopy::default()
        .src_offset(src_offset)
        .dst_offset(dst_offset)
        .size(size);
    unsafe { device.cmd_copy_buffer(cmd, src.handle(), dst.handle(), std::slice::from_ref(&region)) };
}

/// Barrier making host, shader and transfer writes visible to a following copy.
pub(crate) fn record_pre_copy_barrier(device: &Device, cmd: vk::CommandBuffer) {
    record_memory_barrier(
        device,
        cmd,
        vk::PipelineStageFlags::HOST
            | vk::PipelineStageFlags::COMPUTE_SHADER
            | vk::PipelineStageFlags::TRANSFER,
        vk::AccessFlags::HOST_WRITE | vk::AccessFlags::SHADER_WRITE | vk::AccessFlags::TRANSFER_WRITE,
        vk::PipelineStageFlags::TRANSFER,
        vk::AccessFlags::TRANSFER_READ | vk::AccessFlags::TRANSFER_WRITE,
    );
}

/// Barrier making copy results visible to the host and to later shaders.
pub(crate) fn record_post_copy_barrier(device: &Device, cmd: vk::CommandBuffer) {
    record_memory_barrier(
        device,
        cmd,
        vk::PipelineStageFlags::TRANSFER,
        vk::AccessFlags::TRANSFER_WRITE,
        vk::PipelineStageFlags::HOST | vk::PipelineStageFlags::COMPUTE_SHADER,
        vk::AccessFlags::HOST_READ | vk::AccessFlags::SHADER_READ,
    );
}

/// Copy `size` bytes from `src` at `src_offset` to `dst` at `dst_offset` on
/// the device and wait for completion.
///
/// # Errors
///
/// Returns `VulkanErrorKind::ResourceSize` if either range is out of bounds.
pub fn copy_buffer_to_buffer(
    ctx: &VulkanContext,
    src: &GpuBuffer<'_>,
    dst: &GpuBuffer<'_>,
    size: u64,
    src_offset: u64,
    dst_offset: u64,
) -> Result<()> {
    check_copy_range("source", src.size(), src_offset, size)?;
    check_copy_range("destination", dst.size(), dst_offset, size)?;
    if size == 0 {
        return Ok(());
    }

    log::trace!(
        "copy_buffer_to_buffer: {} bytes ({} -> {})",
        size,
        src_offset,
        dst_offset
    );

    ctx.submit_and_wait(|device, cmd| {
        record_pre_copy_barrier(device, cmd);
        record_buffer_copy(device, cmd, src, dst, size, src_offset, dst_offset);
        record_post_copy_barrier(device, cmd);
        Ok(())
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_copy_range_checks() {
        assert!(check_copy_range("source", 64, 0, 64).is_ok());
        assert!(check_copy_range("source", 64, 32, 32).is_ok());
        assert!(check_copy_range("source", 64, 0, 0).is_ok());

        let err = check_copy_range("destination", 64, 48, 32).unwrap_err();
        assert!(matches!(err, VulkanErrorKind::ResourceSize(_)));
        assert!(err.to_string().contains("destination"));

        assert!(check_copy_range("source", 64, u64::MAX, 2).is_err());
    }
}
