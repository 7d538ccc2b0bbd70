//! Runtime configuration.

use std::path::PathBuf;

/// Environment variable selecting the GPU index.
pub const ENV_DEVICE: &str = "HLX_VKOPS_DEVICE";
/// Environment variable enabling validation layers ("1"/"true"/"on").
pub const ENV_VALIDATION: &str = "HLX_VKOPS_VALIDATION";
/// Environment variable pointing at the compiled shader directory.
pub const ENV_SHADER_DIR: &str = "HLX_VKOPS_SHADER_DIR";

/// Default location of compiled `.spv` operator shaders.
pub const DEFAULT_SHADER_DIR: &str = "shaders";

/// Settings used to create a [`crate::VulkanContext`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    /// GPU index (0 = first available)
    pub device_index: usize,
    /// Enable `VK_LAYER_KHRONOS_validation`
    pub enable_validation: bool,
    /// Directory holding `<shader>.spv` files and an optional `manifest.json`
    pub shader_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            device_index: 0,
            enable_validation: cfg!(feature = "validation"),
            shader_dir: PathBuf::from(DEFAULT_SHADER_DIR),
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `HLX_VKOPS_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`EngineConfig::from_env`] but reads variables through `lookup`.
    ///
    /// Unparseable values are ignored with a warning.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(raw) = lookup(ENV_DEVICE) {
            match raw.trim().parse::<usize>() {
                Ok(index) => config.device_index = index,
                Err(_) => log::warn!("Ignoring {}={:?}: not a device index", ENV_DEVICE, raw),
            }
        }

        if let Some(raw) = lookup(ENV_VALIDATION) {
            match parse_flag(&raw) {
                Some(flag) => config.enable_validation = flag,
                None => log::warn!("Ignoring {}={:?}: not a boolean", ENV_VALIDATION, raw),
            }
        }

        if let Some(dir) = lookup(ENV_SHADER_DIR) {
            if !dir.trim().is_empty() {
                config.shader_dir = PathBuf::from(dir);
            }
        }

        config
    }

    pub fn with_shader_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.shader_dir = dir.into();
        self
    }

    pub fn with_device_index(mut self, index: usize) -> Self {
        self.device_index = index;
        self
    }

    pub fn with_validation(mut self, enable: bool) -> Self {
        self.enable_validation = enable;
        self
    }
}

fn parse_flag(raw: &str) -> Option<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "on" | "yes" => Some(true),
        "0" | "false" | "off" | "no" => Some(false),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use std::collections::HashMap;

    fn lookup_from(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn test_defaults_without_env() {
        let config = EngineConfig::from_lookup(lookup_from(&[]));
        assert_eq!(config, EngineConfig::default());
        assert_eq!(config.shader_dir, PathBuf::from("shaders"));
    }

    #[test]
    fn test_env_overrides() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            (ENV_DEVICE, "2"),
            (ENV_VALIDATION, "on"),
            (ENV_SHADER_DIR, "/opt/hlx/spv"),
        ]));
        assert_eq!(config.device_index, 2);
        assert!(config.enable_validation);
        assert_eq!(config.shader_dir, PathBuf::from("/opt/hlx/spv"));
    }

    #[test]
    fn test_bad_values_keep_defaults() {
        let config = EngineConfig::from_lookup(lookup_from(&[
            (ENV_DEVICE, "gpu0"),
            (ENV_VALIDATION, "maybe"),
            (ENV_SHADER_DIR, "  "),
        ]));
        assert_eq!(config, EngineConfig::default());
    }
}
