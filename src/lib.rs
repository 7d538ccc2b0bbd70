//! HLX Vulkan operator runtime
//!
//! Executes dense tensor operators (convolution, pooling, elementwise
//! arithmetic, matrix multiply, concat/reshape, mean) as compute-shader
//! dispatches. Tensors live in a linear buffer and/or a channel-packed
//! RGBA32F 3-D image; every operator call binds its resources, records
//! barriers, dispatches and blocks until the device is done.
//!
//! # Example
//!
//! ```no_run
//! use hlx_vkops::{ops, EngineConfig, VulkanContext, VulkanTensor};
//!
//! let ctx = VulkanContext::new(&EngineConfig::from_env())?;
//! let a = VulkanTensor::from_host(&ctx, &[1, 4, 2, 2], &[1.0; 16])?;
//! let b = VulkanTensor::from_host(&ctx, &[1, 4, 2, 2], &[2.0; 16])?;
//! let mut out = VulkanTensor::new(&ctx, &[1, 4, 2, 2]);
//! ops::add(&mut out, &a, &b, 1.0)?;
//! assert_eq!(out.to_host()?, vec![3.0; 16]);
//! # Ok::<(), hlx_vkops::VulkanErrorKind>(())
//! ```

pub mod error;

pub mod buffer;
pub mod catalog;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod image;
pub mod layout;
pub mod ops;
pub mod params;
pub mod pipeline;
pub mod reference;
pub mod repack;
pub mod shader;
pub mod tensor;
pub mod validation;

pub use buffer::GpuBuffer;
pub use catalog::ShaderCatalog;
pub use config::EngineConfig;
pub use context::VulkanContext;
pub use error::{Result, VulkanErrorKind};
pub use image::GpuImage;
pub use layout::ImageExtent;
pub use pipeline::WorkGroupSize;
pub use repack::KernelDims;
pub use tensor::{Authority, Storage, VulkanTensor};
