// Typed fatal errors
//
// Most call sites return anyhow::Result with context attached. The variants
// here are the setup failures a caller may want to tell apart, so they are
// carried inside anyhow::Error and recovered with downcast_ref.

use ash::vk;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RhiError {
    #[error("No GPU satisfies the required features, extensions and queue families")]
    NoSuitableDevice,

    #[error("No memory type matches filter {type_filter:#b} with properties {properties:?}")]
    NoSuitableMemoryType {
        type_filter: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("Unsupported layout transition: {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("None of the candidate depth formats support depth-stencil attachment")]
    NoSupportedDepthFormat,

    #[error("Refusing to upload an empty resource")]
    EmptyUpload,

    #[error("No known texel size for upload format {0:?}")]
    UnsupportedUploadFormat(vk::Format),

    #[error("The surface reported no usable formats")]
    SurfaceFormatUnavailable,

    #[error("The selected queue family cannot present to the surface")]
    PresentationUnsupported,

    #[error("{call} failed: {result}")]
    Vulkan {
        call: &'static str,
        result: vk::Result,
    },
}

impl RhiError {
    pub fn vulkan(call: &'static str, result: vk::Result) -> Self {
        Self::Vulkan { call, result }
    }
}
