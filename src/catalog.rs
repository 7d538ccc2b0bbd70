//! Shader catalog
//!
//! Resolves operator shader names to SPIR-V, keeps one shader module per
//! distinct binary (content-addressed), and caches compute pipelines per
//! (name, descriptor signature, work-group shape).

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use ash::Device;
use parking_lot::{Mutex, RwLock};

use crate::error::{Result, VulkanErrorKind};
use crate::pipeline::{ComputePipeline, DescriptorKind, PipelineKey, WorkGroupSize};
use crate::shader::{self, ShaderModule};

/// Operator shader names. These are cache keys and file stems; keep them stable.
pub mod names {
    pub const UPSAMPLE_NEAREST_2D: &str = "upsampleNearest2d";
    pub const ADAPTIVE_AVG_POOL_2D: &str = "adaptive_avg_pool2d";
    pub const MAX_POOL_2D: &str = "max_pool2d";
    pub const ADD: &str = "add";
    pub const ADD_SCALAR: &str = "add_scalar";
    pub const MUL_SCALAR: &str = "mul_scalar";
    pub const CONV2D_DEPTHWISE_CLAMP: &str = "conv2d_dw_clamp";
    pub const CONV2D_NOGROUP_CLAMP: &str = "conv2d_nogroup_clamp";
    pub const KERNEL_O4C4HW_TO_IMAGE: &str = "KO4C4HW_to_image";
    pub const CLAMP: &str = "clamp";
    pub const ADDMM: &str = "addmm";
    pub const MM: &str = "mm";
    pub const MEAN: &str = "mean";
    pub const NCHW_TO_IMAGE: &str = "nchw_to_image";
    pub const IMAGE_TO_NCHW: &str = "image_to_nchw";

    pub const ALL: &[&str] = &[
        UPSAMPLE_NEAREST_2D,
        ADAPTIVE_AVG_POOL_2D,
        MAX_POOL_2D,
        ADD,
        ADD_SCALAR,
        MUL_SCALAR,
        CONV2D_DEPTHWISE_CLAMP,
        CONV2D_NOGROUP_CLAMP,
        KERNEL_O4C4HW_TO_IMAGE,
        CLAMP,
        ADDMM,
        MM,
        MEAN,
        NCHW_TO_IMAGE,
        IMAGE_TO_NCHW,
    ];
}

pub const MANIFEST_FILE: &str = "manifest.json";
pub const DEFAULT_ENTRY_POINT: &str = "main";

/// Where to find one shader's SPIR-V.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub file: PathBuf,
    pub entry_point: String,
}

#[derive(Default)]
struct ModuleCache {
    /// shader name -> content id
    by_name: HashMap<String, String>,
    /// content id -> module
    by_content: HashMap<String, ShaderModule>,
}

pub struct ShaderCatalog {
    shader_dir: PathBuf,
    manifest: HashMap<String, ManifestEntry>,
    registered: RwLock<HashMap<String, (Vec<u8>, String)>>,
    modules: Mutex<ModuleCache>,
    pipelines: RwLock<HashMap<PipelineKey, Arc<ComputePipeline>>>,
}

impl ShaderCatalog {
    /// Create a catalog over `shader_dir`, reading `manifest.json` if present.
    pub fn new(shader_dir: impl Into<PathBuf>) -> Result<Self> {
        let shader_dir = shader_dir.into();
        let manifest_path = shader_dir.join(MANIFEST_FILE);
        let manifest = if manifest_path.is_file() {
            let text = std::fs::read_to_string(&manifest_path)?;
            let manifest = parse_manifest(&text)?;
            log::info!(
                "Loaded shader manifest {} ({} entries)",
                manifest_path.display(),
                manifest.len()
            );
            manifest
        } else {
            HashMap::new()
        };

        Ok(Self {
            shader_dir,
            manifest,
            registered: RwLock::new(HashMap::new()),
            modules: Mutex::new(ModuleCache::default()),
            pipelines: RwLock::new(HashMap::new()),
        })
    }

    pub fn shader_dir(&self) -> &Path {
        &self.shader_dir
    }

    /// Register in-memory SPIR-V under `name`, taking precedence over files.
    ///
    /// Only affects pipelines not yet built for `name`.
    pub fn register(&self, name: &str, spirv: Vec<u8>, entry_point: &str) {
        log::debug!("Registering shader {} ({} bytes)", name, spirv.len());
        self.registered
            .write()
            .insert(name.to_string(), (spirv, entry_point.to_string()));
    }

    /// True if SPIR-V for `name` can be resolved without touching the device.
    pub fn contains(&self, name: &str) -> bool {
        self.registered.read().contains_key(name) || self.source_path(name).0.is_file()
    }

    /// Get (or build on first use) the pipeline for this key.
    pub fn pipeline(
        &self,
        device: &Device,
        name: &str,
        signature: &[DescriptorKind],
        work_group: WorkGroupSize,
    ) -> Result<Arc<ComputePipeline>> {
        let key = PipelineKey {
            shader: name.to_string(),
            signature: signature.to_vec(),
            work_group,
        };

        if let Some(found) = self.pipelines.read().get(&key) {
            log::trace!("Pipeline cache HIT: {} ({})", name, work_group);
            return Ok(Arc::clone(found));
        }

        let mut pipelines = self.pipelines.write();
        // Another thread may have built it between the read and write locks.
        if let Some(found) = pipelines.get(&key) {
            return Ok(Arc::clone(found));
        }

        log::debug!("Pipeline cache MISS: {} ({}), building", name, work_group);
        let mut modules = self.modules.lock();
        let content_id = self.load_module(device, &mut modules, name)?;
        let module = modules
            .by_content
            .get(&content_id)
            .ok_or_else(|| VulkanErrorKind::ShaderNotFound(name.to_string()))?;

        let pipeline = Arc::new(ComputePipeline::create(device, module, key.clone())?);
        pipelines.insert(key, Arc::clone(&pipeline));
        Ok(pipeline)
    }

    pub fn pipeline_count(&self) -> usize {
        self.pipelines.read().len()
    }

    pub fn module_count(&self) -> usize {
        self.modules.lock().by_content.len()
    }

    /// Destroy every cached pipeline and shader module.
    pub fn clear(&self, device: &Device) {
        let mut pipelines = self.pipelines.write();
        log::info!("Clearing pipeline cache ({} entries)", pipelines.len());
        for (_, pipeline) in pipelines.drain() {
            pipeline.destroy(device);
        }

        let mut modules = self.modules.lock();
        modules.by_name.clear();
        for (_, module) in modules.by_content.drain() {
            module.destroy(device);
        }
    }

    fn load_module(&self, device: &Device, modules: &mut ModuleCache, name: &str) -> Result<String> {
        if let Some(id) = modules.by_name.get(name) {
            return Ok(id.clone());
        }

        let (bytes, entry_point) = self.read_source(name)?;
        let id = shader::content_id(&bytes);

        if !modules.by_content.contains_key(&id) {
            let module = ShaderModule::new(device, &bytes, entry_point)?;
            modules.by_content.insert(id.clone(), module);
        } else {
            log::debug!("Shader {} shares module {}", name, &id[..16]);
        }

        modules.by_name.insert(name.to_string(), id.clone());
        Ok(id)
    }

    fn read_source(&self, name: &str) -> Result<(Vec<u8>, String)> {
        if let Some((bytes, entry)) = self.registered.read().get(name) {
            return Ok((bytes.clone(), entry.clone()));
        }

        let (path, entry_point) = self.source_path(name);
        if !path.is_file() {
            return Err(VulkanErrorKind::ShaderNotFound(format!(
                "{} (looked for {})",
                name,
                path.display()
            )));
        }
        let bytes = std::fs::read(&path)?;
        log::debug!("Read shader {} from {} ({} bytes)", name, path.display(), bytes.len());
        Ok((bytes, entry_point))
    }

    fn source_path(&self, name: &str) -> (PathBuf, String) {
        match self.manifest.get(name) {
            Some(entry) => (self.shader_dir.join(&entry.file), entry.entry_point.clone()),
            None => (
                self.shader_dir.join(format!("{}.spv", name)),
                DEFAULT_ENTRY_POINT.to_string(),
            ),
        }
    }
}

/// Parse `{"shaders": {"<name>": "file.spv" | {"file": ..., "entry_point": ...}}}`.
pub fn parse_manifest(text: &str) -> Result<HashMap<String, ManifestEntry>> {
    let root: serde_json::Value =
        serde_json::from_str(text).map_err(|e| VulkanErrorKind::Manifest(e.to_string()))?;

    let shaders = root
        .get("shaders")
        .and_then(|v| v.as_object())
        .ok_or_else(|| VulkanErrorKind::Manifest("missing \"shaders\" object".to_string()))?;

    let mut entries = HashMap::with_capacity(shaders.len());
    for (name, value) in shaders {
        let entry = match value {
            serde_json::Value::String(file) => ManifestEntry {
                file: PathBuf::from(file),
                entry_point: DEFAULT_ENTRY_POINT.to_string(),
            },
            serde_json::Value::Object(fields) => {
                let file = fields.get("file").and_then(|v| v.as_str()).ok_or_else(|| {
                    VulkanErrorKind::Manifest(format!("shader '{}' has no \"file\"", name))
                })?;
                let entry_point = fields
                    .get("entry_point")
                    .and_then(|v| v.as_str())
                    .unwrap_or(DEFAULT_ENTRY_POINT);
                ManifestEntry {
                    file: PathBuf::from(file),
                    entry_point: entry_point.to_string(),
                }
            }
            other => {
                return Err(VulkanErrorKind::Manifest(format!(
                    "shader '{}': expected string or object, got {}",
                    name, other
                )))
            }
        };
        entries.insert(name.clone(), entry);
    }

    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_manifest_forms() {
        let manifest = parse_manifest(
            r#"{"shaders": {
                "add": "elementwise/add.spv",
                "mean": {"file": "reduce/mean.spv", "entry_point": "reduce_main"},
                "clamp": {"file": "clamp.spv"}
            }}"#,
        )
        .unwrap();

        assert_eq!(manifest.len(), 3);
        assert_eq!(
            manifest["add"],
            ManifestEntry {
                file: PathBuf::from("elementwise/add.spv"),
                entry_point: "main".to_string(),
            }
        );
        assert_eq!(manifest["mean"].entry_point, "reduce_main");
        assert_eq!(manifest["clamp"].entry_point, "main");
    }

    #[test]
    fn test_parse_manifest_errors() {
        assert!(matches!(parse_manifest("not json"), Err(VulkanErrorKind::Manifest(_))));
        assert!(matches!(parse_manifest(r#"{"other": {}}"#), Err(VulkanErrorKind::Manifest(_))));
        assert!(matches!(
            parse_manifest(r#"{"shaders": {"add": {"entry_point": "main"}}}"#),
            Err(VulkanErrorKind::Manifest(_))
        ));
        assert!(matches!(
            parse_manifest(r#"{"shaders": {"add": 7}}"#),
            Err(VulkanErrorKind::Manifest(_))
        ));
    }

    #[test]
    fn test_source_resolution() {
        let dir = std::env::temp_dir().join(format!("hlx_vkops_catalog_{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        std::fs::write(
            dir.join(MANIFEST_FILE),
            r#"{"shaders": {"mm": {"file": "matmul.spv", "entry_point": "mm_main"}}}"#,
        )
        .unwrap();

        let spirv = crate::validation::tests::module_with_entry_point(5, "main");
        std::fs::write(dir.join("add.spv"), &spirv).unwrap();

        let catalog = ShaderCatalog::new(&dir).unwrap();
        assert!(catalog.contains("add"));
        assert!(!catalog.contains("mm"));
        assert_eq!(catalog.source_path("mm"), (dir.join("matmul.spv"), "mm_main".to_string()));

        let (bytes, entry) = catalog.read_source("add").unwrap();
        assert_eq!(bytes, spirv);
        assert_eq!(entry, "main");

        assert!(matches!(
            catalog.read_source("mean"),
            Err(VulkanErrorKind::ShaderNotFound(_))
        ));

        catalog.register("mean", spirv.clone(), "main");
        assert!(catalog.contains("mean"));
        assert_eq!(catalog.read_source("mean").unwrap().0, spirv);

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_names_are_unique() {
        let mut all = names::ALL.to_vec();
        all.sort_unstable();
        all.dedup();
        assert_eq!(all.len(), names::ALL.len());
    }
}
