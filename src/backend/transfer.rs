// Transfer layer - staged uploads into device-local memory
//
// Every upload follows the same protocol:
// 1. host-visible staging buffer sized to the data
// 2. map, copy, unmap
// 3. device-local destination with TRANSFER_DST added to its usage
// 4. one-shot command buffer recording the copy (and image barriers)
// 5. submit on the transfer queue and wait for the queue to go idle
// 6. staging buffer dropped
//
// Uploads block, so they belong to load time, never to the frame loop.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::command::CommandPool;
use super::error::RhiError;
use super::image::{aspect_mask_for, GpuImage};
use super::VulkanDevice;

/// Access masks, stages and aspect for one layout transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransitionBarrier {
    pub src_access: vk::AccessFlags,
    pub dst_access: vk::AccessFlags,
    pub src_stage: vk::PipelineStageFlags,
    pub dst_stage: vk::PipelineStageFlags,
    pub aspect_mask: vk::ImageAspectFlags,
}

/// The closed table of layout transitions the renderer performs.
///
/// Anything outside it is `RhiError::UnsupportedTransition`.
pub fn transition_barrier(
    old: vk::ImageLayout,
    new: vk::ImageLayout,
    format: vk::Format,
) -> Result<TransitionBarrier, RhiError> {
    use vk::ImageLayout as L;

    let barrier = match (old, new) {
        (L::UNDEFINED, L::TRANSFER_DST_OPTIMAL) => TransitionBarrier {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::TRANSFER_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::TRANSFER,
            aspect_mask: vk::ImageAspectFlags::COLOR,
        },
        (L::TRANSFER_DST_OPTIMAL, L::SHADER_READ_ONLY_OPTIMAL) => TransitionBarrier {
            src_access: vk::AccessFlags::TRANSFER_WRITE,
            dst_access: vk::AccessFlags::SHADER_READ,
            src_stage: vk::PipelineStageFlags::TRANSFER,
            dst_stage: vk::PipelineStageFlags::FRAGMENT_SHADER,
            aspect_mask: vk::ImageAspectFlags::COLOR,
        },
        (L::UNDEFINED, L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL) => TransitionBarrier {
            src_access: vk::AccessFlags::empty(),
            dst_access: vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_READ
                | vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE,
            src_stage: vk::PipelineStageFlags::TOP_OF_PIPE,
            dst_stage: vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS,
            aspect_mask: aspect_mask_for(format) | vk::ImageAspectFlags::DEPTH,
        },
        _ => {
            log::error!("Unsupported layout transition: {:?} -> {:?}", old, new);
            return Err(RhiError::UnsupportedTransition { old, new });
        }
    };

    Ok(barrier)
}

/// Record the barrier for `old -> new` over the whole image.
pub fn record_transition(
    device: &ash::Device,
    cmd: vk::CommandBuffer,
    image: vk::Image,
    format: vk::Format,
    old: vk::ImageLayout,
    new: vk::ImageLayout,
) -> Result<()> {
    let masks = transition_barrier(old, new, format)?;

    let barrier = vk::ImageMemoryBarrier::builder()
        .src_access_mask(masks.src_access)
        .dst_access_mask(masks.dst_access)
        .old_layout(old)
        .new_layout(new)
        .src_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .dst_queue_family_index(vk::QUEUE_FAMILY_IGNORED)
        .image(image)
        .subresource_range(vk::ImageSubresourceRange {
            aspect_mask: masks.aspect_mask,
            base_mip_level: 0,
            level_count: 1,
            base_array_layer: 0,
            layer_count: 1,
        })
        .build();

    unsafe {
        device.cmd_pipeline_barrier(
            cmd,
            masks.src_stage,
            masks.dst_stage,
            vk::DependencyFlags::empty(),
            &[],
            &[],
            &[barrier],
        );
    }

    Ok(())
}

/// Bytes per texel for the uncompressed color formats uploads accept.
pub fn bytes_per_pixel(format: vk::Format) -> Option<usize> {
    match format {
        vk::Format::R8G8B8A8_SRGB
        | vk::Format::R8G8B8A8_UNORM
        | vk::Format::B8G8R8A8_SRGB
        | vk::Format::B8G8R8A8_UNORM => Some(4),
        vk::Format::R8_UNORM => Some(1),
        _ => None,
    }
}

/// Size of a tightly packed `width x height` upload in `format`.
pub fn image_byte_size(width: u32, height: u32, format: vk::Format) -> Result<usize, RhiError> {
    let bpp = bytes_per_pixel(format).ok_or(RhiError::UnsupportedUploadFormat(format))?;
    Ok(width as usize * height as usize * bpp)
}

pub struct Transfer {
    pool: CommandPool,
    queue: vk::Queue,
    device: Arc<VulkanDevice>,
}

impl Transfer {
    pub fn new(device: &Arc<VulkanDevice>) -> Result<Self> {
        let pool = CommandPool::transient(device, device.transfer_queue_family)?;

        Ok(Self {
            pool,
            queue: device.transfer_queue,
            device: device.clone(),
        })
    }

    /// Record with `record`, submit, and block until the queue is idle.
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let cmd = self.pool.allocate(1)?[0];
        let result = self.record_and_wait(cmd, record);
        self.pool.free(&[cmd]);
        result
    }

    fn record_and_wait<F>(&self, cmd: vk::CommandBuffer, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer) -> Result<()>,
    {
        let device = &self.device.device;

        let begin_info = vk::CommandBufferBeginInfo::builder()
            .flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        unsafe { device.begin_command_buffer(cmd, &begin_info) }
            .context("Failed to begin one-shot command buffer")?;

        record(device, cmd)?;

        unsafe { device.end_command_buffer(cmd) }
            .context("Failed to end one-shot command buffer")?;

        let command_buffers = [cmd];
        let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);

        unsafe {
            device
                .queue_submit(self.queue, &[submit_info.build()], vk::Fence::null())
                .map_err(|e| RhiError::vulkan("vkQueueSubmit", e))
                .context("Failed to submit one-shot commands")?;
            device
                .queue_wait_idle(self.queue)
                .map_err(|e| RhiError::vulkan("vkQueueWaitIdle", e))
                .context("Failed waiting for transfer queue")?;
        }

        Ok(())
    }

    /// Copy `data` into a new device-local buffer with `usage` (+ TRANSFER_DST).
    pub fn upload_buffer(&self, usage: vk::BufferUsageFlags, data: &[u8]) -> Result<GpuBuffer> {
        if data.is_empty() {
            return Err(RhiError::EmptyUpload.into());
        }
        let size = data.len() as vk::DeviceSize;

        let staging = GpuBuffer::staging(&self.device, size)
            .context("Failed to allocate staging buffer")?;
        staging.fill(data)?;

        let destination = GpuBuffer::new(
            &self.device,
            size,
            usage | vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .context("Failed to allocate device-local buffer")?;

        self.one_shot(|device, cmd| {
            let region = vk::BufferCopy::builder().size(size).build();
            unsafe { device.cmd_copy_buffer(cmd, staging.buffer, destination.buffer, &[region]) };
            Ok(())
        })?;

        drop(staging);
        log::debug!("Uploaded {} bytes to device-local buffer", size);
        Ok(destination)
    }

    pub fn upload_slice<T: bytemuck::Pod>(
        &self,
        usage: vk::BufferUsageFlags,
        data: &[T],
    ) -> Result<GpuBuffer> {
        self.upload_buffer(usage, bytemuck::cast_slice(data))
    }

    /// Upload tightly packed pixels into a sampled, device-local image.
    ///
    /// The image ends in SHADER_READ_ONLY_OPTIMAL with a sampler attached.
    pub fn upload_image(
        &self,
        width: u32,
        height: u32,
        format: vk::Format,
        pixels: &[u8],
    ) -> Result<GpuImage> {
        if pixels.is_empty() || width == 0 || height == 0 {
            return Err(RhiError::EmptyUpload.into());
        }
        let expected = image_byte_size(width, height, format)?;
        anyhow::ensure!(
            pixels.len() == expected,
            "Pixel data is {} bytes, expected {} for {}x{} {:?}",
            pixels.len(),
            expected,
            width,
            height,
            format
        );

        let staging = GpuBuffer::staging(&self.device, pixels.len() as vk::DeviceSize)
            .context("Failed to allocate staging buffer")?;
        staging.fill(pixels)?;

        let extent = vk::Extent2D { width, height };
        let mut image = GpuImage::new(
            &self.device,
            extent,
            format,
            vk::ImageUsageFlags::TRANSFER_DST | vk::ImageUsageFlags::SAMPLED,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        )
        .context("Failed to allocate device-local image")?;

        self.one_shot(|device, cmd| {
            record_transition(
                device,
                cmd,
                image.image,
                format,
                vk::ImageLayout::UNDEFINED,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
            )?;

            let region = vk::BufferImageCopy::builder()
                .buffer_offset(0)
                .buffer_row_length(0)
                .buffer_image_height(0)
                .image_subresource(vk::ImageSubresourceLayers {
                    aspect_mask: vk::ImageAspectFlags::COLOR,
                    mip_level: 0,
                    base_array_layer: 0,
                    layer_count: 1,
                })
                .image_offset(vk::Offset3D { x: 0, y: 0, z: 0 })
                .image_extent(vk::Extent3D {
                    width,
                    height,
                    depth: 1,
                })
                .build();

            unsafe {
                device.cmd_copy_buffer_to_image(
                    cmd,
                    staging.buffer,
                    image.image,
                    vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                    &[region],
                );
            }

            record_transition(
                device,
                cmd,
                image.image,
                format,
                vk::ImageLayout::TRANSFER_DST_OPTIMAL,
                vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            )
        })?;

        image.layout = vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL;
        image.attach_sampler()?;

        drop(staging);
        log::debug!(
            "Uploaded {}x{} {:?} image ({} bytes)",
            width,
            height,
            format,
            pixels.len()
        );
        Ok(image)
    }

    /// Transition `image` from `old` to `new` in its own submission.
    ///
    /// `old` must be the layout the image is currently in.
    pub fn transition_layout(
        &self,
        image: &mut GpuImage,
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    ) -> Result<()> {
        anyhow::ensure!(
            image.layout == old,
            "Image is in {:?}, not {:?}",
            image.layout,
            old
        );

        // Validate before touching the queue
        transition_barrier(old, new, image.format)?;

        let (handle, format) = (image.image, image.format);
        self.one_shot(|device, cmd| record_transition(device, cmd, handle, format, old, new))?;

        image.layout = new;
        Ok(())
    }

    /// Copy a buffer back into host memory. The source needs TRANSFER_SRC usage.
    pub fn read_back_buffer(&self, source: &GpuBuffer) -> Result<Vec<u8>> {
        let readback = GpuBuffer::new(
            &self.device,
            source.size,
            vk::BufferUsageFlags::TRANSFER_DST,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
        .context("Failed to allocate readback buffer")?;

        self.one_shot(|device, cmd| {
            let region = vk::BufferCopy::builder().size(source.size).build();
            unsafe { device.cmd_copy_buffer(cmd, source.buffer, readback.buffer, &[region]) };
            Ok(())
        })?;

        readback.read()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vk::ImageLayout as L;

    #[test]
    fn upload_transitions_are_in_the_table() {
        let to_dst =
            transition_barrier(L::UNDEFINED, L::TRANSFER_DST_OPTIMAL, vk::Format::R8G8B8A8_SRGB)
                .unwrap();
        assert_eq!(to_dst.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(to_dst.dst_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(to_dst.src_access, vk::AccessFlags::empty());
        assert_eq!(to_dst.dst_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_dst.aspect_mask, vk::ImageAspectFlags::COLOR);

        let to_read = transition_barrier(
            L::TRANSFER_DST_OPTIMAL,
            L::SHADER_READ_ONLY_OPTIMAL,
            vk::Format::R8G8B8A8_SRGB,
        )
        .unwrap();
        assert_eq!(to_read.src_stage, vk::PipelineStageFlags::TRANSFER);
        assert_eq!(to_read.dst_stage, vk::PipelineStageFlags::FRAGMENT_SHADER);
        assert_eq!(to_read.src_access, vk::AccessFlags::TRANSFER_WRITE);
        assert_eq!(to_read.dst_access, vk::AccessFlags::SHADER_READ);
    }

    #[test]
    fn depth_transition_adds_stencil_only_when_format_has_it() {
        let depth = transition_barrier(
            L::UNDEFINED,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::Format::D32_SFLOAT,
        )
        .unwrap();
        assert_eq!(depth.src_stage, vk::PipelineStageFlags::TOP_OF_PIPE);
        assert_eq!(depth.dst_stage, vk::PipelineStageFlags::EARLY_FRAGMENT_TESTS);
        assert!(depth
            .dst_access
            .contains(vk::AccessFlags::DEPTH_STENCIL_ATTACHMENT_WRITE));
        assert_eq!(depth.aspect_mask, vk::ImageAspectFlags::DEPTH);

        let depth_stencil = transition_barrier(
            L::UNDEFINED,
            L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL,
            vk::Format::D24_UNORM_S8_UINT,
        )
        .unwrap();
        assert_eq!(
            depth_stencil.aspect_mask,
            vk::ImageAspectFlags::DEPTH | vk::ImageAspectFlags::STENCIL
        );
    }

    #[test]
    fn transitions_outside_the_table_are_rejected() {
        let unsupported = [
            (L::SHADER_READ_ONLY_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
            (L::UNDEFINED, L::SHADER_READ_ONLY_OPTIMAL),
            (L::TRANSFER_DST_OPTIMAL, L::UNDEFINED),
            (L::UNDEFINED, L::PRESENT_SRC_KHR),
            (L::DEPTH_STENCIL_ATTACHMENT_OPTIMAL, L::UNDEFINED),
            (L::TRANSFER_DST_OPTIMAL, L::TRANSFER_DST_OPTIMAL),
        ];

        for (old, new) in unsupported {
            let err = transition_barrier(old, new, vk::Format::R8G8B8A8_SRGB).unwrap_err();
            assert!(
                matches!(err, RhiError::UnsupportedTransition { old: o, new: n } if o == old && n == new),
                "{:?} -> {:?} should be unsupported",
                old,
                new
            );
        }
    }

    #[test]
    fn rgba8_is_four_bytes_per_pixel() {
        assert_eq!(bytes_per_pixel(vk::Format::R8G8B8A8_SRGB), Some(4));
        assert_eq!(bytes_per_pixel(vk::Format::B8G8R8A8_UNORM), Some(4));
        assert_eq!(bytes_per_pixel(vk::Format::BC1_RGB_UNORM_BLOCK), None);
    }

    #[test]
    fn image_size_needs_a_known_format() {
        assert_eq!(
            image_byte_size(256, 256, vk::Format::R8G8B8A8_SRGB).unwrap(),
            256 * 256 * 4
        );
        assert_eq!(image_byte_size(16, 8, vk::Format::R8_UNORM).unwrap(), 128);

        let err = image_byte_size(4, 4, vk::Format::BC1_RGB_UNORM_BLOCK).unwrap_err();
        assert!(matches!(
            err,
            RhiError::UnsupportedUploadFormat(vk::Format::BC1_RGB_UNORM_BLOCK)
        ));
    }
}
