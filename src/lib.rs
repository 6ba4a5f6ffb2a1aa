// Vulkan render hardware interface
//
// backend: device, swapchain, transfer, pipeline and sync wrappers over ash
// renderer: frame loop state machine, scene data and the concrete renderer

pub mod backend;
pub mod config;
pub mod renderer;

pub use backend::{RhiError, VulkanDevice};
pub use config::Config;
pub use renderer::frame::{FrameLoop, FrameOutcome, FrameTimeline};
pub use renderer::{RenderBackend, VulkanRenderer};
