// Image utilities for sampled textures and the depth buffer
//
// A GpuImage owns image + memory + view (+ sampler for textures). Its current
// layout is tracked on the CPU side; only the transfer layer changes it.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::allocate_memory;
use super::error::RhiError;
use super::VulkanDevice;

/// Depth formats in order of preference.
pub const DEPTH_FORMAT_CANDIDATES: [vk::Format; 3] = [
    vk::Format::D32_SFLOAT,
    vk::Format::D32_SFLOAT_S8_UINT,
    vk::Format::D24_UNORM_S8_UINT,
];

pub fn has_stencil_component(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D32_SFLOAT_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::S8_UINT
    )
}

pub fn is_depth_format(format: vk::Format) -> bool {
    matches!(
        format,
        vk::Format::D16_UNORM
            | vk::Format::X8_D24_UNORM_PACK32
            | vk::Format::D32_SFLOAT
            | vk::Format::D16_UNORM_S8_UINT
            | vk::Format::D24_UNORM_S8_UINT
            | vk::Format::D32_SFLOAT_S8_UINT
    )
}

/// Aspect bits a view or barrier over the whole image must name.
pub fn aspect_mask_for(format: vk::Format) -> vk::ImageAspectFlags {
    if is_depth_format(format) {
        let mut aspect = vk::ImageAspectFlags::DEPTH;
        if has_stencil_component(format) {
            aspect |= vk::ImageAspectFlags::STENCIL;
        }
        aspect
    } else {
        vk::ImageAspectFlags::COLOR
    }
}

/// First candidate whose optimal-tiling features include `features`.
pub fn select_supported_format(
    candidates: &[vk::Format],
    features: vk::FormatFeatureFlags,
    mut format_properties: impl FnMut(vk::Format) -> vk::FormatProperties,
) -> Option<vk::Format> {
    candidates
        .iter()
        .copied()
        .find(|&format| format_properties(format).optimal_tiling_features.contains(features))
}

pub fn find_depth_format(device: &VulkanDevice) -> Result<vk::Format> {
    select_supported_format(
        &DEPTH_FORMAT_CANDIDATES,
        vk::FormatFeatureFlags::DEPTH_STENCIL_ATTACHMENT,
        |format| unsafe {
            device
                .instance
                .get_physical_device_format_properties(device.physical_device, format)
        },
    )
    .ok_or_else(|| RhiError::NoSupportedDepthFormat.into())
}

/// Image + memory + view (+ optional sampler).
pub struct GpuImage {
    pub image: vk::Image,
    pub memory: vk::DeviceMemory,
    pub view: vk::ImageView,
    pub sampler: Option<vk::Sampler>,
    pub format: vk::Format,
    pub extent: vk::Extent2D,
    pub(crate) layout: vk::ImageLayout,
    device: Arc<VulkanDevice>,
}

impl GpuImage {
    /// Create a 2D, single-mip, optimal-tiling image in UNDEFINED layout with its view.
    pub fn new(
        device: &Arc<VulkanDevice>,
        extent: vk::Extent2D,
        format: vk::Format,
        usage: vk::ImageUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        let image_info = vk::ImageCreateInfo::builder()
            .image_type(vk::ImageType::TYPE_2D)
            .extent(vk::Extent3D {
                width: extent.width,
                height: extent.height,
                depth: 1,
            })
            .mip_levels(1)
            .array_layers(1)
            .format(format)
            .tiling(vk::ImageTiling::OPTIMAL)
            .initial_layout(vk::ImageLayout::UNDEFINED)
            .usage(usage)
            .samples(vk::SampleCountFlags::TYPE_1)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let image = unsafe { device.device.create_image(&image_info, None) }
            .map_err(|e| RhiError::vulkan("vkCreateImage", e))
            .context("Failed to create image")?;

        let requirements = unsafe { device.device.get_image_memory_requirements(image) };

        let memory = match allocate_memory(device, requirements, memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_image(image, None) };
                return Err(e);
            }
        };

        let view = unsafe { device.device.bind_image_memory(image, memory, 0) }
            .context("Failed to bind image memory")
            .and_then(|()| create_image_view(device, image, format, aspect_mask_for(format)));

        let view = match view {
            Ok(view) => view,
            Err(e) => {
                unsafe {
                    device.device.destroy_image(image, None);
                    device.device.free_memory(memory, None);
                }
                return Err(e);
            }
        };

        Ok(Self {
            image,
            memory,
            view,
            sampler: None,
            format,
            extent,
            layout: vk::ImageLayout::UNDEFINED,
            device: device.clone(),
        })
    }

    /// Device-local depth attachment sized to the swapchain.
    pub fn depth_attachment(
        device: &Arc<VulkanDevice>,
        extent: vk::Extent2D,
        format: vk::Format,
    ) -> Result<Self> {
        Self::new(
            device,
            extent,
            format,
            vk::ImageUsageFlags::DEPTH_STENCIL_ATTACHMENT,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
    }

    /// Attach a linear, repeating, anisotropic sampler.
    pub fn attach_sampler(&mut self) -> Result<()> {
        if self.sampler.is_none() {
            self.sampler = Some(create_sampler(&self.device)?);
        }
        Ok(())
    }

    pub fn layout(&self) -> vk::ImageLayout {
        self.layout
    }
}

impl Drop for GpuImage {
    fn drop(&mut self) {
        unsafe {
            if let Some(sampler) = self.sampler.take() {
                self.device.device.destroy_sampler(sampler, None);
            }
            self.device.device.destroy_image_view(self.view, None);
            self.device.device.destroy_image(self.image, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

pub fn create_image_view(
    device: &VulkanDevice,
    image: vk::Image,
    format: vk::Format,
    aspect_mask: vk::ImageAspectFlags,
) -> Result<vk::ImageView> {
    let view_info = vk::ImageViewCreateInfo::builder()
        .image(image)
        .view_type(vk::ImageViewType::TYPE_2D)
        .format(format)
        .components(vk::ComponentMapping {
            r: vk::ComponentSwizzle::IDENTITY,
            g: vk::ComponentSwizzle::IDENTITY,
            b: vk::ComponentSwizzle::IDENTITY,
            a: vk::ComponentSwizzle::IDENTITY,
        })
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        });

    unsafe { device.device.create_image_view(&view_info, None) }
        .map_err(|e| RhiError::vulkan("vkCreateImageView", e))
        .context("Failed to create image view")
}

fn create_sampler(device: &VulkanDevice) -> Result<vk::Sampler> {
    let max_anisotropy = device.properties.limits.max_sampler_anisotropy;

    let sampler_info = vk::SamplerCreateInfo::builder()
        .mag_filter(vk::Filter::LINEAR)
        .min_filter(vk::Filter::LINEAR)
        .address_mode_u(vk::SamplerAddressMode::REPEAT)
        .address_mode_v(vk::SamplerAddressMode::REPEAT)
        .address_mode_w(vk::SamplerAddressMode::REPEAT)
        .anisotropy_enable(true)
        .max_anisotropy(max_anisotropy)
        .border_color(vk::BorderColor::INT_OPAQUE_BLACK)
        .unnormalized_coordinates(false)
        .compare_enable(false)
        .compare_op(vk::CompareOp::ALWAYS)
        .mipmap_mode(vk::SamplerMipmapMode::LINEAR)
        .mip_lod_bias(0.0)
        .min_lod(0.0)
        .max_lod(0.0);

    unsafe { device.device.create_sampler(&sampler_info, None) }
        .map_err(|e| RhiError::vulkan("vkCreateSampler", e))
        .context("Failed to create texture sampler")
}
