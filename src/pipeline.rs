//! Compute pipeline management
//!
//! A compute pipeline is built for one (shader, descriptor signature,
//! work-group shape) triple and owns the descriptor-set layout and pipeline
//! layout derived from that signature.

use ash::{vk, Device};

use crate::error::VulkanErrorKind;
use crate::shader::ShaderModule;

/// Resource kind at one binding index of an operator's descriptor set.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DescriptorKind {
    /// Output image written with imageStore
    StorageImage,
    /// Input image read through a sampler
    SampledImage,
    /// Linear buffer, read or written
    StorageBuffer,
    /// Constant block
    UniformBuffer,
}

impl DescriptorKind {
    pub fn vk_type(self) -> vk::DescriptorType {
        match self {
            DescriptorKind::StorageImage => vk::DescriptorType::STORAGE_IMAGE,
            DescriptorKind::SampledImage => vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
            DescriptorKind::StorageBuffer => vk::DescriptorType::STORAGE_BUFFER,
            DescriptorKind::UniformBuffer => vk::DescriptorType::UNIFORM_BUFFER,
        }
    }
}

/// Local work-group size, passed to shaders as specialization constants 1..3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct WorkGroupSize {
    pub x: u32,
    pub y: u32,
    pub z: u32,
}

impl WorkGroupSize {
    pub const fn new(x: u32, y: u32, z: u32) -> Self {
        Self { x, y, z }
    }

    /// 8x8x1, the shape used by spatial kernels.
    pub const SPATIAL: WorkGroupSize = WorkGroupSize::new(8, 8, 1);

    /// 1x1x1, one invocation per group.
    pub const SINGLE: WorkGroupSize = WorkGroupSize::new(1, 1, 1);

    pub fn invocations(&self) -> u32 {
        self.x * self.y * self.z
    }

    /// Shrinks each axis to fit the device's per-axis and total invocation limits.
    pub fn clamped(self, max_size: [u32; 3], max_invocations: u32) -> Self {
        let x = self.x.clamp(1, max_size[0].max(1));
        let y = self.y.clamp(1, max_size[1].max(1));
        let z_budget = (max_invocations / (x * y)).max(1);
        let z = self.z.clamp(1, max_size[2].max(1).min(z_budget));
        Self { x, y, z }
    }

    /// Number of groups needed so every element of `extent` is covered.
    pub fn groups_to_cover(&self, extent: [u32; 3]) -> [u32; 3] {
        [
            extent[0].div_ceil(self.x.max(1)),
            extent[1].div_ceil(self.y.max(1)),
            extent[2].div_ceil(self.z.max(1)),
        ]
    }

    fn specialization_data(&self) -> [u8; 12] {
        let mut data = [0u8; 12];
        data[0..4].copy_from_slice(&self.x.to_ne_bytes());
        data[4..8].copy_from_slice(&self.y.to_ne_bytes());
        data[8..12].copy_from_slice(&self.z.to_ne_bytes());
        data
    }
}

impl std::fmt::Display for WorkGroupSize {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}x{}x{}", self.x, self.y, self.z)
    }
}

/// Pipeline cache key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PipelineKey {
    pub shader: String,
    pub signature: Vec<DescriptorKind>,
    pub work_group: WorkGroupSize,
}

/// Compute pipeline together with its layouts.
pub struct ComputePipeline {
    pub pipeline: vk::Pipeline,
    pub layout: vk::PipelineLayout,
    pub set_layout: vk::DescriptorSetLayout,
    pub key: PipelineKey,
}

impl ComputePipeline {
    /// Build the set layout, pipeline layout and pipeline for `key`.
    pub fn create(
        device: &Device,
        shader: &ShaderModule,
        key: PipelineKey,
    ) -> Result<Self, VulkanErrorKind> {
        let set_layout = create_set_layout(device, &key.signature)?;

        let layout = unsafe {
            device.create_pipeline_layout(
                &vk::PipelineLayoutCreateInfo::default()
                    .set_layouts(std::slice::from_ref(&set_layout)),
                None,
            )
        }
        .map_err(|e| {
            unsafe { device.destroy_descriptor_set_layout(set_layout, None) };
            VulkanErrorKind::PipelineCreationFailed(format!(
                "Failed to create pipeline layout: {:?}",
                e
            ))
        })?;

        let map_entries = [
            vk::SpecializationMapEntry::default().constant_id(1).offset(0).size(4),
            vk::SpecializationMapEntry::default().constant_id(2).offset(4).size(4),
            vk::SpecializationMapEntry::default().constant_id(3).offset(8).size(4),
        ];
        let spec_data = key.work_group.specialization_data();
        let specialization = vk::SpecializationInfo::default()
            .map_entries(&map_entries)
            .data(&spec_data);

        let entry_name = std::ffi::CString::new(shader.entry_point.as_str()).map_err(|_| {
            VulkanErrorKind::PipelineCreationFailed(format!(
                "entry point '{}' contains a NUL byte",
                shader.entry_point
            ))
        })?;

        let stage = vk::PipelineShaderStageCreateInfo::default()
            .stage(vk::ShaderStageFlags::COMPUTE)
            .module(shader.handle)
            .name(&entry_name)
            .specialization_info(&specialization);

        let create_info = vk::ComputePipelineCreateInfo::default()
            .stage(stage)
            .layout(layout);

        let pipeline = unsafe {
            device.create_compute_pipelines(
                vk::PipelineCache::null(),
                std::slice::from_ref(&create_info),
                None,
            )
        }
        .map_err(|(_, e)| {
            VulkanErrorKind::PipelineCreationFailed(format!(
                "Failed to create compute pipeline '{}': {:?}",
                key.shader, e
            ))
        })
        .and_then(|pipelines| {
            pipelines.into_iter().next().ok_or_else(|| {
                VulkanErrorKind::PipelineCreationFailed(
                    "Pipeline creation returned empty result".to_string(),
                )
            })
        });

        let pipeline = match pipeline {
            Ok(pipeline) => pipeline,
            Err(e) => {
                unsafe {
                    device.destroy_pipeline_layout(layout, None);
                    device.destroy_descriptor_set_layout(set_layout, None);
                }
                return Err(e);
            }
        };

        log::debug!(
            "Compute pipeline created: {} (bindings={}, work_group={})",
            key.shader,
            key.signature.len(),
            key.work_group
        );

        Ok(Self {
            pipeline,
            layout,
            set_layout,
            key,
        })
    }

    /// Destroy the pipeline and its layouts.
    pub fn destroy(&self, device: &Device) {
        log::debug!("Destroying compute pipeline {}", self.key.shader);
        unsafe {
            device.destroy_pipeline(self.pipeline, None);
            device.destroy_pipeline_layout(self.layout, None);
            device.destroy_descriptor_set_layout(self.set_layout, None);
        }
    }
}

fn create_set_layout(
    device: &Device,
    signature: &[DescriptorKind],
) -> Result<vk::DescriptorSetLayout, VulkanErrorKind> {
    let bindings: Vec<vk::DescriptorSetLayoutBinding> = signature
        .iter()
        .enumerate()
        .map(|(i, kind)| {
            vk::DescriptorSetLayoutBinding::default()
                .binding(i as u32)
                .descriptor_type(kind.vk_type())
                .descriptor_count(1)
                .stage_flags(vk::ShaderStageFlags::COMPUTE)
        })
        .collect();

    unsafe {
        device.create_descriptor_set_layout(
            &vk::DescriptorSetLayoutCreateInfo::default().bindings(&bindings),
            None,
        )
    }
    .map_err(|e| VulkanErrorKind::descriptor("vkCreateDescriptorSetLayout", e))
}
