//! Generic compute dispatch
//!
//! Every shader-backed operator reduces to: build its constant block, pick a
//! work-group shape and grid, then call [`dispatch`] with its resources in
//! binding order. `dispatch` validates the order, fetches the cached
//! pipeline, binds a per-call descriptor set, records barriers and the
//! dispatch, submits and waits.

use ash::{vk, Device};

use crate::buffer::{record_memory_barrier, GpuBuffer};
use crate::context::VulkanContext;
use crate::ensure_contract;
use crate::error::{Result, VulkanErrorKind};
use crate::image::GpuImage;
use crate::pipeline::{DescriptorKind, WorkGroupSize};

/// One resource at one binding index.
#[derive(Clone, Copy)]
pub enum Binding<'r, 'a> {
    /// Storage image the shader writes
    OutputImage(&'r GpuImage<'a>),
    /// Storage buffer the shader writes
    OutputBuffer(&'r GpuBuffer<'a>),
    /// Sampled input image
    InputImage(&'r GpuImage<'a>),
    /// Storage buffer the shader reads (packed weights, bias)
    InputBuffer(&'r GpuBuffer<'a>),
    /// Constant block
    Uniform(&'r GpuBuffer<'a>),
}

/// Position class of a binding in the descriptor order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BindingRole {
    Output,
    Input,
    Constants,
}

impl Binding<'_, '_> {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            Binding::OutputImage(_) => DescriptorKind::StorageImage,
            Binding::InputImage(_) => DescriptorKind::SampledImage,
            Binding::OutputBuffer(_) | Binding::InputBuffer(_) => DescriptorKind::StorageBuffer,
            Binding::Uniform(_) => DescriptorKind::UniformBuffer,
        }
    }

    pub fn role(&self) -> BindingRole {
        match self {
            Binding::OutputImage(_) | Binding::OutputBuffer(_) => BindingRole::Output,
            Binding::InputImage(_) | Binding::InputBuffer(_) => BindingRole::Input,
            Binding::Uniform(_) => BindingRole::Constants,
        }
    }
}

/// Checks the binding contract: output at 0, then inputs, constants last.
pub fn validate_binding_order(roles: &[BindingRole]) -> Result<()> {
    ensure_contract!(!roles.is_empty(), "dispatch without bindings");
    ensure_contract!(
        roles[0] == BindingRole::Output,
        "binding 0 must be the output, got {:?}",
        roles[0]
    );
    ensure_contract!(
        roles.last() == Some(&BindingRole::Constants),
        "the constant block must be bound last"
    );
    for (index, role) in roles.iter().enumerate().skip(1).take(roles.len().saturating_sub(2)) {
        ensure_contract!(
            *role == BindingRole::Input,
            "binding {} must be an input, got {:?}",
            index,
            role
        );
    }
    Ok(())
}

/// How many work groups to launch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Grid {
    /// Enough groups to give one invocation per element of this extent.
    Cover([u32; 3]),
    /// Exactly these group counts.
    Groups([u32; 3]),
}

impl Grid {
    pub fn groups(&self, work_group: WorkGroupSize) -> [u32; 3] {
        match *self {
            Grid::Cover(extent) => work_group.groups_to_cover(extent),
            Grid::Groups(groups) => groups,
        }
    }

    /// Cover `(x, y, z)` given as host sizes, saturating at `u32::MAX`.
    pub fn cover(x: usize, y: usize, z: usize) -> Self {
        let axis = |len: usize| u32::try_from(len).unwrap_or(u32::MAX);
        Grid::Cover([axis(x), axis(y), axis(z)])
    }
}

// =============================================================================
// DESCRIPTOR SCOPE
// =============================================================================

/// Descriptor pool and the one set allocated from it for a single call.
///
/// Destroying the pool frees the set; this happens on drop, so early returns
/// cannot leak it.
struct DescriptorScope<'d> {
    device: &'d Device,
    pool: vk::DescriptorPool,
    set: vk::DescriptorSet,
}

impl<'d> DescriptorScope<'d> {
    fn new(
        device: &'d Device,
        set_layout: vk::DescriptorSetLayout,
        signature: &[DescriptorKind],
    ) -> Result<Self> {
        let pool_sizes = pool_sizes(signature);
        let pool_info = vk::DescriptorPoolCreateInfo::default()
            .max_sets(1)
            .pool_sizes(&pool_sizes);

        let pool = unsafe { device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| VulkanErrorKind::descriptor("vkCreateDescriptorPool", e))?;

        let mut scope = Self {
            device,
            pool,
            set: vk::DescriptorSet::null(),
        };

        let alloc_info = vk::DescriptorSetAllocateInfo::default()
            .descriptor_pool(pool)
            .set_layouts(std::slice::from_ref(&set_layout));

        scope.set = unsafe { device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| VulkanErrorKind::descriptor("vkAllocateDescriptorSets", e))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                VulkanErrorKind::DescriptorFailed("no descriptor set allocated".to_string())
            })?;

        Ok(scope)
    }

    fn write(&self, bindings: &[Binding<'_, '_>]) {
        enum Info {
            Image([vk::DescriptorImageInfo; 1]),
            Buffer([vk::DescriptorBufferInfo; 1]),
        }

        let infos: Vec<Info> = bindings
            .iter()
            .map(|binding| match binding {
                Binding::OutputImage(image) => Info::Image([image.storage_descriptor_info()]),
                Binding::InputImage(image) => Info::Image([image.sampled_descriptor_info()]),
                Binding::OutputBuffer(buffer)
                | Binding::InputBuffer(buffer)
                | Binding::Uniform(buffer) => Info::Buffer([buffer.descriptor_info()]),
            })
            .collect();

        let writes: Vec<vk::WriteDescriptorSet> = bindings
            .iter()
            .zip(&infos)
            .enumerate()
            .map(|(index, (binding, info))| {
                let write = vk::WriteDescriptorSet::default()
                    .dst_set(self.set)
                    .dst_binding(index as u32)
                    .descriptor_type(binding.kind().vk_type());
                match info {
                    Info::Image(image_info) => write.image_info(image_info),
                    Info::Buffer(buffer_info) => write.buffer_info(buffer_info),
                }
            })
            .collect();

        unsafe { self.device.update_descriptor_sets(&writes, &[]) };
    }
}

impl Drop for DescriptorScope<'_> {
    fn drop(&mut self) {
        unsafe { self.device.destroy_descriptor_pool(self.pool, None) };
    }
}

fn pool_sizes(signature: &[DescriptorKind]) -> Vec<vk::DescriptorPoolSize> {
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();
    for kind in signature {
        let ty = kind.vk_type();
        match sizes.iter_mut().find(|size| size.ty == ty) {
            Some(size) => size.descriptor_count += 1,
            None => sizes.push(vk::DescriptorPoolSize {
                ty,
                descriptor_count: 1,
            }),
        }
    }
    sizes
}

// =============================================================================
// DISPATCH
// =============================================================================

/// Bind `bindings` to `shader`, dispatch `grid` and block until done.
///
/// # Arguments
///
/// * `shader` - catalog name of the operator shader
/// * `bindings` - output first, then inputs in argument order, then the constant block
/// * `work_group` - requested local size; shrunk to device limits
/// * `grid` - element extent to cover, or explicit group counts
///
/// # Errors
///
/// Returns `ContractViolation` for a malformed binding order, and the
/// pipeline, descriptor or submission errors of the underlying calls.
pub fn dispatch(
    ctx: &VulkanContext,
    shader: &str,
    bindings: &[Binding<'_, '_>],
    work_group: WorkGroupSize,
    grid: Grid,
) -> Result<()> {
    let roles: Vec<BindingRole> = bindings.iter().map(Binding::role).collect();
    validate_binding_order(&roles)?;

    let signature: Vec<DescriptorKind> = bindings.iter().map(Binding::kind).collect();
    let pipeline = ctx.pipeline(shader, &signature, work_group)?;
    let groups = grid.groups(pipeline.key.work_group);

    let scope = DescriptorScope::new(ctx.device(), pipeline.set_layout, &signature)?;
    scope.write(bindings);

    log::trace!(
        "dispatch {}: groups={:?} work_group={}",
        shader,
        groups,
        pipeline.key.work_group
    );

    let writes_buffer = bindings
        .iter()
        .any(|binding| matches!(binding, Binding::OutputBuffer(_)));

    let submitted = ctx.submit_and_wait(|device, cmd| {
        for binding in bindings {
            match binding {
                Binding::OutputImage(image) => image.barrier_to_general(device, cmd),
                Binding::InputImage(image) => image.barrier_to_shader_read(device, cmd),
                _ => {}
            }
        }

        // Host uploads and earlier transfer/shader writes to any bound buffer.
        record_memory_barrier(
            device,
            cmd,
            vk::PipelineStageFlags::HOST
                | vk::PipelineStageFlags::TRANSFER
                | vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::HOST_WRITE
                | vk::AccessFlags::TRANSFER_WRITE
                | vk::AccessFlags::SHADER_WRITE,
            vk::PipelineStageFlags::COMPUTE_SHADER,
            vk::AccessFlags::SHADER_READ
                | vk::AccessFlags::SHADER_WRITE
                | vk::AccessFlags::UNIFORM_READ,
        );

        unsafe {
            device.cmd_bind_pipeline(cmd, vk::PipelineBindPoint::COMPUTE, pipeline.pipeline);
            device.cmd_bind_descriptor_sets(
                cmd,
                vk::PipelineBindPoint::COMPUTE,
                pipeline.layout,
                0,
                std::slice::from_ref(&scope.set),
                &[],
            );
        }

        if groups.iter().any(|&g| g == 0) {
            log::trace!("dispatch {}: empty grid, nothing to do", shader);
        } else {
            unsafe { device.cmd_dispatch(cmd, groups[0], groups[1], groups[2]) };
        }

        if writes_buffer {
            record_memory_barrier(
                device,
                cmd,
                vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::SHADER_WRITE,
                vk::PipelineStageFlags::HOST
                    | vk::PipelineStageFlags::TRANSFER
                    | vk::PipelineStageFlags::COMPUTE_SHADER,
                vk::AccessFlags::HOST_READ
                    | vk::AccessFlags::TRANSFER_READ
                    | vk::AccessFlags::SHADER_READ,
            );
        }
        Ok(())
    });

    if submitted.is_err() {
        for binding in bindings {
            if let Binding::OutputImage(image) | Binding::InputImage(image) = binding {
                image.reset_layout();
            }
        }
    }
    submitted
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use BindingRole::*;

    #[test]
    fn test_valid_binding_orders() {
        assert!(validate_binding_order(&[Output, Input, Constants]).is_ok());
        assert!(validate_binding_order(&[Output, Input, Input, Input, Constants]).is_ok());
        assert!(validate_binding_order(&[Output, Constants]).is_ok());
    }

    #[test]
    fn test_invalid_binding_orders() {
        for roles in [
            &[][..],
            &[Input, Output, Constants][..],
            &[Output, Constants, Input][..],
            &[Output, Input][..],
            &[Output, Output, Constants][..],
            &[Output, Input, Constants, Constants][..],
        ] {
            let err = validate_binding_order(roles).unwrap_err();
            assert!(err.is_contract_violation(), "{:?} accepted", roles);
        }
    }

    #[test]
    fn test_pool_sizes_count_each_type() {
        let sizes = pool_sizes(&[
            DescriptorKind::StorageImage,
            DescriptorKind::SampledImage,
            DescriptorKind::SampledImage,
            DescriptorKind::StorageBuffer,
            DescriptorKind::UniformBuffer,
        ]);
        let counts: Vec<(vk::DescriptorType, u32)> =
            sizes.iter().map(|s| (s.ty, s.descriptor_count)).collect();
        assert_eq!(
            counts,
            vec![
                (vk::DescriptorType::STORAGE_IMAGE, 1),
                (vk::DescriptorType::COMBINED_IMAGE_SAMPLER, 2),
                (vk::DescriptorType::STORAGE_BUFFER, 1),
                (vk::DescriptorType::UNIFORM_BUFFER, 1),
            ]
        );
    }

    #[test]
    fn test_grid_groups() {
        let wg = WorkGroupSize::SPATIAL;
        assert_eq!(Grid::cover(17, 8, 3).groups(wg), [3, 1, 3]);
        assert_eq!(Grid::Groups([2, 3, 4]).groups(wg), [2, 3, 4]);
    }

    #[test]
    #[cfg(target_pointer_width = "64")]
    fn test_grid_cover_saturates() {
        assert_eq!(
            Grid::cover(u32::MAX as usize + 5, 1, 2),
            Grid::Cover([u32::MAX, 1, 2])
        );
    }
}
