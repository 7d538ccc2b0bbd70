//! Vulkan context management
//!
//! Handles instance, device and compute-queue initialization, owns the shader
//! catalog, and provides the blocking submit-and-wait primitive every operator
//! goes through.

use std::sync::Arc;

use ash::{vk, Device, Entry, Instance};
use parking_lot::Mutex;

use crate::catalog::ShaderCatalog;
use crate::config::EngineConfig;
use crate::error::{Result, VulkanErrorKind};
use crate::pipeline::{ComputePipeline, DescriptorKind, WorkGroupSize};

/// Device limits the dispatch layer depends on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceLimits {
    pub min_storage_buffer_offset_alignment: u64,
    pub min_uniform_buffer_offset_alignment: u64,
    pub max_compute_work_group_size: [u32; 3],
    pub max_compute_work_group_invocations: u32,
}

impl DeviceLimits {
    fn from_properties(limits: &vk::PhysicalDeviceLimits) -> Self {
        Self {
            min_storage_buffer_offset_alignment: limits.min_storage_buffer_offset_alignment,
            min_uniform_buffer_offset_alignment: limits.min_uniform_buffer_offset_alignment,
            max_compute_work_group_size: limits.max_compute_work_group_size,
            max_compute_work_group_invocations: limits.max_compute_work_group_invocations,
        }
    }
}

/// Manages the Vulkan instance, device, compute queue and shader catalog.
///
/// Buffers, images and tensors borrow the context, so they are always
/// destroyed before it.
pub struct VulkanContext {
    /// GPU device name (e.g., "NVIDIA GeForce RTX 5060")
    pub device_name: String,

    /// Vulkan API version (e.g., "1.3.280")
    pub api_version: String,

    // Keeps the loader alive for the lifetime of the instance.
    #[allow(dead_code)]
    entry: Entry,
    instance: Instance,
    physical_device: vk::PhysicalDevice,
    device: Device,
    queue: vk::Queue,
    queue_family: u32,
    memory_properties: vk::PhysicalDeviceMemoryProperties,
    limits: DeviceLimits,
    command_pool: vk::CommandPool,

    // Serializes queue submission and command pool use.
    submission: Mutex<()>,

    catalog: ShaderCatalog,

    cleaned_up: bool,
}

impl VulkanContext {
    /// Create a new Vulkan context.
    ///
    /// # Arguments
    ///
    /// * `config` - device index, validation layers and shader directory
    ///
    /// # Errors
    ///
    /// * `EntryLoadFailed` - the Vulkan loader is not installed
    /// * `NoSuitableDevice` - no GPU at `config.device_index`
    /// * `InitializationFailed` - instance, device or command pool creation failed
    /// * `Manifest` / `Io` - the shader manifest could not be read
    pub fn new(config: &EngineConfig) -> Result<Self> {
        log::info!(
            "Initializing VulkanContext (device_index={}, validation={}, shaders={})",
            config.device_index,
            config.enable_validation,
            config.shader_dir.display()
        );

        let catalog = ShaderCatalog::new(&config.shader_dir)?;

        let entry = unsafe { Entry::load() }
            .map_err(|e| VulkanErrorKind::EntryLoadFailed(e.to_string()))?;

        let instance = Self::create_instance(&entry, config.enable_validation)?;

        let selected = Self::select_physical_device(&instance, config.device_index)
            .and_then(|(physical_device, device_name, api_version)| {
                let (device, queue, queue_family) =
                    Self::create_logical_device(&instance, physical_device)?;
                Ok((physical_device, device_name, api_version, device, queue, queue_family))
            });
        let (physical_device, device_name, api_version, device, queue, queue_family) =
            match selected {
                Ok(selected) => selected,
                Err(e) => {
                    unsafe { instance.destroy_instance(None) };
                    return Err(e);
                }
            };

        let pool_info = vk::CommandPoolCreateInfo::default()
            .queue_family_index(queue_family)
            .flags(
                vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER
                    | vk::CommandPoolCreateFlags::TRANSIENT,
            );
        let command_pool = match unsafe { device.create_command_pool(&pool_info, None) } {
            Ok(pool) => pool,
            Err(e) => {
                unsafe {
                    device.destroy_device(None);
                    instance.destroy_instance(None);
                }
                return Err(VulkanErrorKind::InitializationFailed(format!(
                    "vkCreateCommandPool failed: {:?}",
                    e
                )));
            }
        };

        let memory_properties =
            unsafe { instance.get_physical_device_memory_properties(physical_device) };
        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let limits = DeviceLimits::from_properties(&properties.limits);

        log::info!(
            "VulkanContext initialized: {} (Vulkan {})",
            device_name,
            api_version
        );
        log::debug!("Device limits: {:?}", limits);

        Ok(Self {
            device_name,
            api_version,
            entry,
            instance,
            physical_device,
            device,
            queue,
            queue_family,
            memory_properties,
            limits,
            command_pool,
            submission: Mutex::new(()),
            catalog,
            cleaned_up: false,
        })
    }

    pub fn device(&self) -> &Device {
        &self.device
    }

    pub fn physical_device(&self) -> vk::PhysicalDevice {
        self.physical_device
    }

    pub fn queue_family_index(&self) -> u32 {
        self.queue_family
    }

    pub fn limits(&self) -> &DeviceLimits {
        &self.limits
    }

    pub fn memory_properties(&self) -> &vk::PhysicalDeviceMemoryProperties {
        &self.memory_properties
    }

    pub fn catalog(&self) -> &ShaderCatalog {
        &self.catalog
    }

    /// Sizes of all memory heaps in bytes.
    pub fn memory_heap_sizes(&self) -> Vec<u64> {
        self.memory_properties.memory_heaps[..self.memory_properties.memory_heap_count as usize]
            .iter()
            .map(|h| h.size)
            .collect()
    }

    /// First memory type allowed by `type_filter` that has all of `properties`.
    pub fn find_memory_type(
        &self,
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    ) -> Option<u32> {
        find_memory_type(&self.memory_properties, type_filter, properties)
    }

    /// `work_group` shrunk to fit this device.
    pub fn fit_work_group(&self, work_group: WorkGroupSize) -> WorkGroupSize {
        work_group.clamped(
            self.limits.max_compute_work_group_size,
            self.limits.max_compute_work_group_invocations,
        )
    }

    /// Cached pipeline for `shader` with this descriptor signature and work-group shape.
    pub fn pipeline(
        &self,
        shader: &str,
        signature: &[DescriptorKind],
        work_group: WorkGroupSize,
    ) -> Result<Arc<ComputePipeline>> {
        self.catalog
            .pipeline(&self.device, shader, signature, self.fit_work_group(work_group))
    }

    /// Record one command buffer with `record`, submit it and block until the
    /// device signals completion.
    ///
    /// The command buffer and fence are released on every path.
    pub fn submit_and_wait<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&Device, vk::CommandBuffer) -> Result<()>,
    {
        let _queue = self.submission.lock();

        let alloc_info = vk::CommandBufferAllocateInfo::default()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);
        let command_buffer = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| VulkanErrorKind::submission("vkAllocateCommandBuffers", e))?
            .into_iter()
            .next()
            .ok_or_else(|| {
                VulkanErrorKind::SubmissionFailed("no command buffer allocated".to_string())
            })?;

        let mut scope = SubmitScope {
            device: &self.device,
            command_pool: self.command_pool,
            command_buffer,
            fence: vk::Fence::null(),
        };

        scope.fence = unsafe {
            self.device
                .create_fence(&vk::FenceCreateInfo::default(), None)
        }
        .map_err(|e| VulkanErrorKind::submission("vkCreateFence", e))?;

        let begin_info = vk::CommandBufferBeginInfo::default()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { self.device.begin_command_buffer(command_buffer, &begin_info) }
            .map_err(|e| VulkanErrorKind::submission("vkBeginCommandBuffer", e))?;

        record(&self.device, command_buffer)?;

        unsafe { self.device.end_command_buffer(command_buffer) }
            .map_err(|e| VulkanErrorKind::submission("vkEndCommandBuffer", e))?;

        let submit_info =
            vk::SubmitInfo::default().command_buffers(std::slice::from_ref(&command_buffer));
        unsafe {
            self.device
                .queue_submit(self.queue, std::slice::from_ref(&submit_info), scope.fence)
        }
        .map_err(|e| VulkanErrorKind::submission("vkQueueSubmit", e))?;

        unsafe {
            self.device
                .wait_for_fences(std::slice::from_ref(&scope.fence), true, u64::MAX)
        }
        .map_err(|e| VulkanErrorKind::submission("vkWaitForFences", e))?;

        log::trace!("Submission complete");
        Ok(())
    }

    /// Clean up Vulkan resources.
    ///
    /// Waits for the device, destroys cached pipelines and shader modules,
    /// the command pool, the logical device and the instance. Runs from
    /// `Drop` if not called explicitly.
    pub fn cleanup(&mut self) {
        if self.cleaned_up {
            log::warn!("VulkanContext::cleanup() called twice");
            return;
        }

        log::info!("Cleaning up VulkanContext");

        unsafe {
            if let Err(e) = self.device.device_wait_idle() {
                log::warn!("vkDeviceWaitIdle failed during cleanup: {:?}", e);
            }
        }

        self.catalog.clear(&self.device);

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);
            self.instance.destroy_instance(None);
        }

        self.cleaned_up = true;
        log::info!("VulkanContext cleanup complete");
    }
}

// Private implementation methods
impl VulkanContext {
    /// Create Vulkan instance with optional validation layers.
    fn create_instance(entry: &Entry, enable_validation: bool) -> Result<Instance> {
        let app_info = vk::ApplicationInfo::default()
            .application_name(c"HLX Vulkan Ops")
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(c"HLX")
            .engine_version(vk::make_api_version(0, 1, 0, 0))
            .api_version(vk::API_VERSION_1_2);

        let layer_ptrs: Vec<*const std::ffi::c_char> = if enable_validation {
            log::info!("Enabling Vulkan validation layers");
            vec![c"VK_LAYER_KHRONOS_validation".as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::default()
            .application_info(&app_info)
            .enabled_layer_names(&layer_ptrs);

        let instance = unsafe { entry.create_instance(&create_info, None) }.map_err(|e| {
            VulkanErrorKind::InitializationFailed(format!("vkCreateInstance failed: {:?}", e))
        })?;

        log::debug!("Vulkan instance created");
        Ok(instance)
    }

    /// Select a physical device (GPU) by index.
    fn select_physical_device(
        instance: &Instance,
        device_index: usize,
    ) -> Result<(vk::PhysicalDevice, String, String)> {
        let devices = unsafe { instance.enumerate_physical_devices() }.map_err(|e| {
            VulkanErrorKind::InitializationFailed(format!(
                "enumerate_physical_devices failed: {:?}",
                e
            ))
        })?;

        if devices.is_empty() {
            return Err(VulkanErrorKind::NoSuitableDevice);
        }

        log::info!("Found {} Vulkan device(s)", devices.len());
        for (i, &dev) in devices.iter().enumerate() {
            let props = unsafe { instance.get_physical_device_properties(dev) };
            log::debug!("  Device {}: {}", i, device_name(&props));
        }

        let device = devices
            .get(device_index)
            .copied()
            .ok_or(VulkanErrorKind::NoSuitableDevice)?;

        let props = unsafe { instance.get_physical_device_properties(device) };
        let name = device_name(&props);
        let api_version = format!(
            "{}.{}.{}",
            vk::api_version_major(props.api_version),
            vk::api_version_minor(props.api_version),
            vk::api_version_patch(props.api_version)
        );

        log::info!("Selected device {}: {} (API {})", device_index, name, api_version);

        Ok((device, name, api_version))
    }

    /// Create logical device with one compute queue.
    fn create_logical_device(
        instance: &Instance,
        physical_device: vk::PhysicalDevice,
    ) -> Result<(Device, vk::Queue, u32)> {
        let queue_families =
            unsafe { instance.get_physical_device_queue_family_properties(physical_device) };

        let compute_family = queue_families
            .iter()
            .position(|props| props.queue_flags.contains(vk::QueueFlags::COMPUTE))
            .map(|i| i as u32)
            .ok_or_else(|| {
                VulkanErrorKind::InitializationFailed("No compute queue family found".to_string())
            })?;

        log::debug!("Using queue family {} for compute", compute_family);

        let queue_priorities = [1.0f32];
        let queue_create_info = vk::DeviceQueueCreateInfo::default()
            .queue_family_index(compute_family)
            .queue_priorities(&queue_priorities);

        let device_create_info = vk::DeviceCreateInfo::default()
            .queue_create_infos(std::slice::from_ref(&queue_create_info));

        let device = unsafe { instance.create_device(physical_device, &device_create_info, None) }
            .map_err(|e| {
                VulkanErrorKind::InitializationFailed(format!("vkCreateDevice failed: {:?}", e))
            })?;

        let queue = unsafe { device.get_device_queue(compute_family, 0) };

        log::debug!("Logical device and compute queue created");

        Ok((device, queue, compute_family))
    }
}

impl Drop for VulkanContext {
    fn drop(&mut self) {
        if !self.cleaned_up {
            log::debug!("VulkanContext dropped without explicit cleanup(), cleaning up");
            self.cleanup();
        }
    }
}

/// Frees the per-submission command buffer and fence.
struct SubmitScope<'a> {
    device: &'a Device,
    command_pool: vk::CommandPool,
    command_buffer: vk::CommandBuffer,
    fence: vk::Fence,
}

impl Drop for SubmitScope<'_> {
    fn drop(&mut self) {
        unsafe {
            if self.fence != vk::Fence::null() {
                self.device.destroy_fence(self.fence, None);
            }
            self.device
                .free_command_buffers(self.command_pool, std::slice::from_ref(&self.command_buffer));
        }
    }
}

fn device_name(props: &vk::PhysicalDeviceProperties) -> String {
    let bytes: Vec<u8> = props
        .device_name
        .iter()
        .take_while(|&&c| c != 0)
        .map(|&c| c as u8)
        .collect();
    String::from_utf8_lossy(&bytes).into_owned()
}

pub(crate) fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Option<u32> {
    (0..memory_properties.memory_type_count).find(|&i| {
        (type_filter & (1 << i)) != 0
            && memory_properties.memory_types[i as usize]
                .property_flags
                .contains(properties)
    })
}
