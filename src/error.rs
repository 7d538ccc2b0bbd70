//! Error types for the Vulkan operator runtime.
//!
//! Contract violations are detected before any device work is recorded and
//! surface as `ContractViolation` / `ResourceSize`. Callers treat them as
//! fatal: the runtime never retries or degrades.

use ash::vk;

#[derive(Debug, thiserror::Error)]
pub enum VulkanErrorKind {
    #[error("failed to load Vulkan entry points: {0}")]
    EntryLoadFailed(String),

    #[error("Vulkan initialization failed: {0}")]
    InitializationFailed(String),

    #[error("no suitable Vulkan device found")]
    NoSuitableDevice,

    #[error("invalid SPIR-V: {0}")]
    InvalidSpirv(String),

    #[error("shader module creation failed: {0}")]
    ShaderCreationFailed(String),

    #[error("shader '{0}' not found in catalog")]
    ShaderNotFound(String),

    #[error("shader manifest error: {0}")]
    Manifest(String),

    #[error("compute pipeline creation failed: {0}")]
    PipelineCreationFailed(String),

    #[error("device memory allocation failed: {0}")]
    AllocationFailed(String),

    #[error("descriptor set setup failed: {0}")]
    DescriptorFailed(String),

    #[error("command submission failed: {0}")]
    SubmissionFailed(String),

    #[error("contract violation: {0}")]
    ContractViolation(String),

    #[error("resource size mismatch: {0}")]
    ResourceSize(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, VulkanErrorKind>;

impl VulkanErrorKind {
    /// Wraps a raw `vk::Result` with the name of the failing call.
    pub(crate) fn submission(call: &str, result: vk::Result) -> Self {
        VulkanErrorKind::SubmissionFailed(format!("{} failed: {:?}", call, result))
    }

    pub(crate) fn allocation(call: &str, result: vk::Result) -> Self {
        VulkanErrorKind::AllocationFailed(format!("{} failed: {:?}", call, result))
    }

    pub(crate) fn descriptor(call: &str, result: vk::Result) -> Self {
        VulkanErrorKind::DescriptorFailed(format!("{} failed: {:?}", call, result))
    }

    pub fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            VulkanErrorKind::ContractViolation(_) | VulkanErrorKind::ResourceSize(_)
        )
    }
}

/// Returns `ContractViolation` from the enclosing function when `cond` is false.
#[macro_export]
macro_rules! ensure_contract {
    ($cond:expr, $($arg:tt)+) => {
        if !$cond {
            return Err($crate::error::VulkanErrorKind::ContractViolation(format!($($arg)+)));
        }
    };
}

#[cfg(test)]
mod tests {
    use super::*;

    fn checked(value: usize) -> Result<usize> {
        ensure_contract!(value <= 4, "dim {} exceeds 4", value);
        Ok(value)
    }

    #[test]
    fn test_ensure_contract_passes_and_fails() {
        assert_eq!(checked(3).unwrap(), 3);
        let err = checked(5).unwrap_err();
        assert!(err.is_contract_violation());
        assert_eq!(err.to_string(), "contract violation: dim 5 exceeds 4");
    }

    #[test]
    fn test_device_errors_are_not_contract_violations() {
        let err = VulkanErrorKind::submission("vkQueueSubmit", vk::Result::ERROR_DEVICE_LOST);
        assert!(!err.is_contract_violation());
        assert!(err.to_string().contains("ERROR_DEVICE_LOST"));
    }
}
