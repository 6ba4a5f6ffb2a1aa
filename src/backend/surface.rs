// Surface - the boundary with the windowing layer
//
// The window owns the OS handle; we only need its raw handles to build a
// VkSurfaceKHR and its framebuffer size to size the swapchain.

use anyhow::{Context, Result};
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle, RawDisplayHandle};
use std::os::raw::c_char;

/// What the renderer needs from a window.
pub trait PresentationWindow: HasRawDisplayHandle + HasRawWindowHandle {
    /// Current framebuffer size in pixels. Zero in either dimension means minimized.
    fn framebuffer_extent(&self) -> vk::Extent2D;
}

impl PresentationWindow for winit::window::Window {
    fn framebuffer_extent(&self) -> vk::Extent2D {
        let size = self.inner_size();
        vk::Extent2D {
            width: size.width,
            height: size.height,
        }
    }
}

/// Surface properties for one physical device, queried together.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    /// A swapchain can only be built when both lists are non-empty.
    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Platform surface bound to an instance.
///
/// Owned by `VulkanDevice`, which destroys it after the logical device and
/// before the instance.
pub struct Surface {
    pub loader: ash::extensions::khr::Surface,
    pub handle: vk::SurfaceKHR,
}

impl Surface {
    /// Instance extensions the platform needs to create a surface for this display.
    pub fn required_instance_extensions(
        display: RawDisplayHandle,
    ) -> Result<&'static [*const c_char]> {
        ash_window::enumerate_required_extensions(display)
            .context("Failed to enumerate surface instance extensions")
    }

    pub fn new(
        entry: &Entry,
        instance: &ash::Instance,
        window: &dyn PresentationWindow,
    ) -> Result<Self> {
        let handle = unsafe {
            ash_window::create_surface(
                entry,
                instance,
                window.raw_display_handle(),
                window.raw_window_handle(),
                None,
            )
        }
        .context("Failed to create window surface")?;

        let loader = ash::extensions::khr::Surface::new(entry, instance);

        log::debug!("Created window surface");
        Ok(Self { loader, handle })
    }

    pub fn supports_present(
        &self,
        physical_device: vk::PhysicalDevice,
        queue_family: u32,
    ) -> bool {
        unsafe {
            self.loader.get_physical_device_surface_support(
                physical_device,
                queue_family,
                self.handle,
            )
        }
        .unwrap_or(false)
    }

    pub fn query_support(&self, physical_device: vk::PhysicalDevice) -> Result<SurfaceSupport> {
        unsafe {
            let capabilities = self
                .loader
                .get_physical_device_surface_capabilities(physical_device, self.handle)
                .context("Failed to query surface capabilities")?;
            let formats = self
                .loader
                .get_physical_device_surface_formats(physical_device, self.handle)
                .context("Failed to query surface formats")?;
            let present_modes = self
                .loader
                .get_physical_device_surface_present_modes(physical_device, self.handle)
                .context("Failed to query surface present modes")?;

            Ok(SurfaceSupport {
                capabilities,
                formats,
                present_modes,
            })
        }
    }

    /// # Safety
    /// No swapchain created from this surface may still exist.
    pub(crate) unsafe fn destroy(&mut self) {
        if self.handle != vk::SurfaceKHR::null() {
            self.loader.destroy_surface(self.handle, None);
            self.handle = vk::SurfaceKHR::null();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn support_requires_formats_and_present_modes() {
        let mut support = SurfaceSupport {
            capabilities: vk::SurfaceCapabilitiesKHR::default(),
            formats: vec![vk::SurfaceFormatKHR::default()],
            present_modes: Vec::new(),
        };
        assert!(!support.is_adequate());

        support.present_modes.push(vk::PresentModeKHR::FIFO);
        assert!(support.is_adequate());

        support.formats.clear();
        assert!(!support.is_adequate());
    }
}
