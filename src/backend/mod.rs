// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper holds an Arc<VulkanDevice>,
// so the device outlives anything created from it.

pub mod buffer;
pub mod command;
pub mod descriptor;
pub mod device;
pub mod error;
pub mod image;
pub mod pipeline;
pub mod shader;
pub mod surface;
pub mod swapchain;
pub mod sync;
pub mod transfer;

pub use buffer::GpuBuffer;
pub use command::CommandPool;
pub use descriptor::{DescriptorPool, DescriptorSetLayout};
pub use device::VulkanDevice;
pub use error::RhiError;
pub use image::GpuImage;
pub use pipeline::{GraphicsPipeline, RenderPass, VertexLayout};
pub use shader::{ShaderKind, ShaderModule};
pub use surface::PresentationWindow;
pub use swapchain::{AcquireOutcome, PresentOutcome, RecreateOutcome, Swapchain};
pub use sync::FrameSlot;
pub use transfer::Transfer;
