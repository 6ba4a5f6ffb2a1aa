// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen, plus
// everything sized to it: per-image views, the shared depth buffer and the
// per-image framebuffers. All of it is torn down and rebuilt together.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::error::RhiError;
use super::image::{create_image_view, GpuImage};
use super::pipeline::{create_framebuffers, RenderPass};
use super::surface::SurfaceSupport;
use super::transfer::Transfer;
use super::VulkanDevice;

/// Prefer 8-bit BGRA sRGB with the sRGB non-linear color space, else the first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .copied()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB
                && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first().copied())
}

/// The preferred mode if offered, then MAILBOX, then FIFO (always supported).
pub fn choose_present_mode(
    present_modes: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    [preferred, vk::PresentModeKHR::MAILBOX]
        .into_iter()
        .find(|mode| present_modes.contains(mode))
        .unwrap_or(vk::PresentModeKHR::FIFO)
}

/// The surface's fixed extent, or the window size clamped into range when the
/// surface reports the `u32::MAX` "size is up to you" sentinel.
pub fn choose_extent(
    capabilities: &vk::SurfaceCapabilitiesKHR,
    window_extent: vk::Extent2D,
) -> vk::Extent2D {
    if capabilities.current_extent.width != u32::MAX {
        capabilities.current_extent
    } else {
        vk::Extent2D {
            width: window_extent.width.clamp(
                capabilities.min_image_extent.width,
                capabilities.max_image_extent.width,
            ),
            height: window_extent.height.clamp(
                capabilities.min_image_extent.height,
                capabilities.max_image_extent.height,
            ),
        }
    }
}

/// One more than the minimum, capped by the maximum when there is one (non-zero).
pub fn choose_image_count(capabilities: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let mut image_count = capabilities.min_image_count.saturating_add(1);
    if capabilities.max_image_count > 0 {
        image_count = image_count.min(capabilities.max_image_count);
    }
    image_count
}

pub fn choose_composite_alpha(
    capabilities: &vk::SurfaceCapabilitiesKHR,
) -> vk::CompositeAlphaFlagsKHR {
    [
        vk::CompositeAlphaFlagsKHR::OPAQUE,
        vk::CompositeAlphaFlagsKHR::PRE_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::POST_MULTIPLIED,
        vk::CompositeAlphaFlagsKHR::INHERIT,
    ]
    .into_iter()
    .find(|&mode| capabilities.supported_composite_alpha.contains(mode))
    .unwrap_or(vk::CompositeAlphaFlagsKHR::OPAQUE)
}

/// Everything decided before the swapchain object is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub surface_format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub composite_alpha: vk::CompositeAlphaFlagsKHR,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

pub fn plan_swapchain(
    support: &SurfaceSupport,
    window_extent: vk::Extent2D,
    preferred_present_mode: vk::PresentModeKHR,
) -> Result<SwapchainPlan, RhiError> {
    let surface_format =
        choose_surface_format(&support.formats).ok_or(RhiError::SurfaceFormatUnavailable)?;

    Ok(SwapchainPlan {
        surface_format,
        present_mode: choose_present_mode(&support.present_modes, preferred_present_mode),
        extent: choose_extent(&support.capabilities, window_extent),
        image_count: choose_image_count(&support.capabilities),
        composite_alpha: choose_composite_alpha(&support.capabilities),
        pre_transform: support.capabilities.current_transform,
    })
}

/// Result of asking the swapchain for an image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquireOutcome {
    /// Usable image; `suboptimal` images are rendered then the chain is rebuilt.
    Acquired { image_index: u32, suboptimal: bool },
    OutOfDate,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PresentOutcome {
    Presented,
    Suboptimal,
    OutOfDate,
}

impl PresentOutcome {
    pub fn needs_rebuild(self) -> bool {
        !matches!(self, PresentOutcome::Presented)
    }
}

/// Result of asking for a rebuild.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecreateOutcome {
    Rebuilt,
    /// The window has a zero dimension; nothing was touched.
    Deferred,
}

pub fn is_zero_extent(extent: vk::Extent2D) -> bool {
    extent.width == 0 || extent.height == 0
}

pub struct Swapchain {
    pub swapchain: vk::SwapchainKHR,
    pub swapchain_loader: ash::extensions::khr::Swapchain,
    pub images: Vec<vk::Image>,
    pub image_views: Vec<vk::ImageView>,
    pub depth: Option<GpuImage>,
    pub framebuffers: Vec<vk::Framebuffer>,
    pub format: vk::Format,
    pub depth_format: vk::Format,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    preferred_present_mode: vk::PresentModeKHR,
    device: Arc<VulkanDevice>,
}

impl Swapchain {
    /// Build the swapchain, its views and depth buffer. Framebuffers follow
    /// with `create_framebuffers` once a render pass for `format` exists.
    pub fn new(
        device: Arc<VulkanDevice>,
        window_extent: vk::Extent2D,
        preferred_present_mode: vk::PresentModeKHR,
        depth_format: vk::Format,
        transfer: &Transfer,
    ) -> Result<Self> {
        let swapchain_loader =
            ash::extensions::khr::Swapchain::new(&device.instance, &device.device);

        let mut swapchain = Self {
            swapchain: vk::SwapchainKHR::null(),
            swapchain_loader,
            images: Vec::new(),
            image_views: Vec::new(),
            depth: None,
            framebuffers: Vec::new(),
            format: vk::Format::UNDEFINED,
            depth_format,
            present_mode: vk::PresentModeKHR::FIFO,
            extent: vk::Extent2D::default(),
            preferred_present_mode,
            device,
        };

        swapchain.create_resources(window_extent, transfer)?;
        Ok(swapchain)
    }

    fn create_resources(&mut self, window_extent: vk::Extent2D, transfer: &Transfer) -> Result<()> {
        let surface = self.device.surface()?;
        let support = surface.query_support(self.device.physical_device)?;
        let plan = plan_swapchain(&support, window_extent, self.preferred_present_mode)?;

        log::info!(
            "Creating swapchain: {}x{}, {} images, {:?}, {:?}",
            plan.extent.width,
            plan.extent.height,
            plan.image_count,
            plan.surface_format.format,
            plan.present_mode
        );

        let queue_families = [
            self.device.graphics_queue_family,
            self.device.present_queue_family,
        ];
        let (sharing_mode, family_indices): (_, &[u32]) =
            if queue_families[0] != queue_families[1] {
                (vk::SharingMode::CONCURRENT, &queue_families[..])
            } else {
                (vk::SharingMode::EXCLUSIVE, &[][..])
            };

        let create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface.handle)
            .min_image_count(plan.image_count)
            .image_format(plan.surface_format.format)
            .image_color_space(plan.surface_format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(vk::ImageUsageFlags::COLOR_ATTACHMENT)
            .image_sharing_mode(sharing_mode)
            .queue_family_indices(family_indices)
            .pre_transform(plan.pre_transform)
            .composite_alpha(plan.composite_alpha)
            .present_mode(plan.present_mode)
            .clipped(true);

        self.swapchain = unsafe { self.swapchain_loader.create_swapchain(&create_info, None) }
            .map_err(|e| RhiError::vulkan("vkCreateSwapchainKHR", e))
            .context("Failed to create swapchain")?;

        self.format = plan.surface_format.format;
        self.present_mode = plan.present_mode;
        self.extent = plan.extent;

        self.images = unsafe { self.swapchain_loader.get_swapchain_images(self.swapchain) }
            .context("Failed to get swapchain images")?;

        log::info!(
            "Created swapchain with {} images ({:?}, {:?})",
            self.images.len(),
            plan.surface_format.format,
            plan.surface_format.color_space
        );

        for &image in &self.images {
            let view =
                create_image_view(&self.device, image, self.format, vk::ImageAspectFlags::COLOR)?;
            self.image_views.push(view);
        }

        let mut depth = GpuImage::depth_attachment(&self.device, self.extent, self.depth_format)
            .context("Failed to create depth buffer")?;
        transfer.transition_layout(
            &mut depth,
            vk::ImageLayout::UNDEFINED,
            vk::ImageLayout::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
        )?;
        self.depth = Some(depth);

        Ok(())
    }

    /// One framebuffer per swapchain image, sharing the depth attachment.
    pub fn create_framebuffers(&mut self, render_pass: &RenderPass) -> Result<()> {
        self.destroy_framebuffers();

        let depth_view = self
            .depth
            .as_ref()
            .map(|d| d.view)
            .context("Swapchain has no depth buffer")?;

        self.framebuffers = create_framebuffers(
            &self.device,
            &self.image_views,
            depth_view,
            render_pass.render_pass,
            self.extent,
        )?;
        Ok(())
    }

    /// Tear everything down and rebuild against the current window size.
    ///
    /// Returns `Deferred` without touching anything while the window is
    /// minimized. Must not run while a frame is being recorded; the device is
    /// idled first so nothing in flight references the old images.
    pub fn recreate(
        &mut self,
        window_extent: vk::Extent2D,
        transfer: &Transfer,
    ) -> Result<RecreateOutcome> {
        if is_zero_extent(window_extent) {
            log::debug!("Window is minimized, deferring swapchain recreation");
            return Ok(RecreateOutcome::Deferred);
        }

        self.device.wait_idle()?;
        self.destroy_resources();
        self.create_resources(window_extent, transfer)?;

        Ok(RecreateOutcome::Rebuilt)
    }

    /// Acquire the next image, signaling `semaphore` when it is ready.
    pub fn acquire_next_image(
        &self,
        timeout: u64,
        semaphore: vk::Semaphore,
    ) -> Result<AcquireOutcome> {
        let result = unsafe {
            self.swapchain_loader.acquire_next_image(
                self.swapchain,
                timeout,
                semaphore,
                vk::Fence::null(),
            )
        };

        match result {
            Ok((image_index, suboptimal)) => Ok(AcquireOutcome::Acquired {
                image_index,
                suboptimal,
            }),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(AcquireOutcome::OutOfDate),
            Err(e) => {
                log::error!("vkAcquireNextImageKHR failed: {:?}", e);
                Err(RhiError::vulkan("vkAcquireNextImageKHR", e).into())
            }
        }
    }

    /// Present rendered image to screen.
    pub fn present(
        &self,
        queue: vk::Queue,
        image_index: u32,
        wait_semaphores: &[vk::Semaphore],
    ) -> Result<PresentOutcome> {
        let swapchains = [self.swapchain];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        let result = unsafe { self.swapchain_loader.queue_present(queue, &present_info) };

        match result {
            Ok(false) => Ok(PresentOutcome::Presented),
            Ok(true) => Ok(PresentOutcome::Suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(PresentOutcome::OutOfDate),
            Err(e) => {
                log::error!("vkQueuePresentKHR failed: {:?}", e);
                Err(RhiError::vulkan("vkQueuePresentKHR", e).into())
            }
        }
    }

    fn destroy_framebuffers(&mut self) {
        for framebuffer in self.framebuffers.drain(..) {
            unsafe { self.device.device.destroy_framebuffer(framebuffer, None) };
        }
    }

    /// Idempotent: every handle is cleared as it is destroyed.
    fn destroy_resources(&mut self) {
        self.destroy_framebuffers();
        self.depth = None;

        unsafe {
            for view in self.image_views.drain(..) {
                self.device.device.destroy_image_view(view, None);
            }
            if self.swapchain != vk::SwapchainKHR::null() {
                self.swapchain_loader.destroy_swapchain(self.swapchain, None);
                self.swapchain = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.destroy_resources();
    }
}
