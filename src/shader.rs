//! Shader module management
//!
//! Wraps VkShaderModule with the content address of its SPIR-V.

use ash::{vk, Device};
use sha2::{Digest, Sha256};

use crate::error::VulkanErrorKind;
use crate::validation;

/// Wrapper around VkShaderModule with associated metadata.
pub struct ShaderModule {
    /// The Vulkan shader module handle
    pub handle: vk::ShaderModule,

    /// Entry point name (usually "main")
    pub entry_point: String,

    /// SHA-256 of the SPIR-V bytes (lowercase hex)
    pub content_id: String,

    /// Size of the original SPIR-V binary in bytes
    pub spirv_size: usize,
}

impl ShaderModule {
    /// Create a new ShaderModule from SPIR-V bytes.
    ///
    /// The bytes must contain a `GLCompute` entry point named `entry_point`.
    ///
    /// # Errors
    ///
    /// Returns `VulkanErrorKind::InvalidSpirv` if the SPIR-V is malformed.
    /// Returns `VulkanErrorKind::ShaderCreationFailed` if Vulkan rejects the shader.
    pub fn new(
        device: &Device,
        spirv_bytes: &[u8],
        entry_point: String,
    ) -> Result<Self, VulkanErrorKind> {
        validation::validate_compute_spirv(spirv_bytes, &entry_point)
            .map_err(VulkanErrorKind::InvalidSpirv)?;

        let code = validation::to_words(spirv_bytes);
        let create_info = vk::ShaderModuleCreateInfo::default().code(&code);

        let handle = unsafe { device.create_shader_module(&create_info, None) }
            .map_err(|e| VulkanErrorKind::ShaderCreationFailed(format!("{:?}", e)))?;

        let content_id = content_id(spirv_bytes);
        log::debug!(
            "Created ShaderModule {} (entry_point={}, spirv_size={})",
            &content_id[..16],
            entry_point,
            spirv_bytes.len()
        );

        Ok(Self {
            handle,
            entry_point,
            content_id,
            spirv_size: spirv_bytes.len(),
        })
    }

    /// Destroy the shader module.
    ///
    /// Must be called before dropping the Device.
    pub fn destroy(self, device: &Device) {
        log::debug!("Destroying ShaderModule {}", &self.content_id[..16]);
        unsafe {
            device.destroy_shader_module(self.handle, None);
        }
    }
}

/// Content address of a SPIR-V binary: lowercase hex SHA-256.
pub fn content_id(spirv_bytes: &[u8]) -> String {
    let digest = Sha256::digest(spirv_bytes);
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_content_id_is_stable_and_distinct() {
        let a = content_id(b"\x03\x02\x23\x07abcd");
        let b = content_id(b"\x03\x02\x23\x07abcd");
        let c = content_id(b"\x03\x02\x23\x07abce");
        assert_eq!(a, b);
        assert_ne!(a, c);
        assert_eq!(a.len(), 64);
        assert!(a.chars().all(|ch| ch.is_ascii_hexdigit()));
    }

    #[test]
    fn test_content_id_of_empty_input() {
        assert_eq!(
            content_id(&[]),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }
}
