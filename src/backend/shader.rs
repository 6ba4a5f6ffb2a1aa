// Shader module loading and management
//
// Vulkan consumes SPIR-V. build.rs runs glslc over shaders/*.{vert,frag};
// this module turns the resulting blobs into shader modules.

use anyhow::{Context, Result};
use ash::vk;
use std::ffi::CStr;
use std::io::Cursor;
use std::path::Path;
use std::sync::Arc;

use super::error::RhiError;
use super::VulkanDevice;

pub const ENTRY_POINT: &CStr = c"main";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShaderKind {
    Vertex,
    Fragment,
}

impl ShaderKind {
    pub fn stage_flags(self) -> vk::ShaderStageFlags {
        match self {
            ShaderKind::Vertex => vk::ShaderStageFlags::VERTEX,
            ShaderKind::Fragment => vk::ShaderStageFlags::FRAGMENT,
        }
    }

    /// File extension glslc infers the stage from.
    pub fn extension(self) -> &'static str {
        match self {
            ShaderKind::Vertex => "vert",
            ShaderKind::Fragment => "frag",
        }
    }
}

/// A compiled shader module tagged with its stage.
pub struct ShaderModule {
    pub module: vk::ShaderModule,
    pub kind: ShaderKind,
    device: Arc<VulkanDevice>,
}

impl ShaderModule {
    /// Create a module from SPIR-V bytes of any alignment.
    pub fn from_spirv(device: &Arc<VulkanDevice>, kind: ShaderKind, bytes: &[u8]) -> Result<Self> {
        let code = decode_spirv(bytes)?;
        let create_info = vk::ShaderModuleCreateInfo::builder().code(&code);

        let module = unsafe { device.device.create_shader_module(&create_info, None) }
            .map_err(|e| RhiError::vulkan("vkCreateShaderModule", e))
            .with_context(|| format!("Failed to create {:?} shader module", kind))?;

        Ok(Self {
            module,
            kind,
            device: device.clone(),
        })
    }

    /// Load `<dir>/<name>.<vert|frag>.spv`.
    pub fn load(device: &Arc<VulkanDevice>, dir: &Path, name: &str, kind: ShaderKind) -> Result<Self> {
        let path = dir.join(format!("{}.{}.spv", name, kind.extension()));
        let bytes = std::fs::read(&path).with_context(|| {
            format!(
                "Failed to read shader {:?}. Compile it with: glslc {} -o {}",
                path,
                path.with_extension("").display(),
                path.display()
            )
        })?;

        log::debug!("Loaded {:?} shader from {:?} ({} bytes)", kind, path, bytes.len());
        Self::from_spirv(device, kind, &bytes)
    }

    pub fn stage_info(&self) -> vk::PipelineShaderStageCreateInfo {
        vk::PipelineShaderStageCreateInfo::builder()
            .stage(self.kind.stage_flags())
            .module(self.module)
            .name(ENTRY_POINT)
            .build()
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_shader_module(self.module, None) };
    }
}

/// Re-align SPIR-V bytes into 32-bit words.
pub fn decode_spirv(bytes: &[u8]) -> Result<Vec<u32>> {
    ash::util::read_spv(&mut Cursor::new(bytes)).context("Invalid SPIR-V blob")
}
