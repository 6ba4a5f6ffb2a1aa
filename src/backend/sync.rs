// Synchronization primitives
//
// One FrameSlot per frame in flight. The fence bounds CPU run-ahead, the
// semaphores order acquire -> render -> present on the GPU.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::command::CommandPool;
use super::error::RhiError;
use super::VulkanDevice;

/// Per-slot command buffer and sync objects. Never touched by another slot.
pub struct FrameSlot {
    pub command_buffer: vk::CommandBuffer,
    pub image_available: vk::Semaphore,
    pub render_finished: vk::Semaphore,
    pub in_flight_fence: vk::Fence,
    device: Arc<VulkanDevice>,
}

impl FrameSlot {
    pub fn new(device: &Arc<VulkanDevice>, command_buffer: vk::CommandBuffer) -> Result<Self> {
        let semaphore_info = vk::SemaphoreCreateInfo::builder();
        let fence_info = vk::FenceCreateInfo::builder().flags(vk::FenceCreateFlags::SIGNALED); // Start signaled

        unsafe {
            let image_available = device
                .device
                .create_semaphore(&semaphore_info, None)
                .context("Failed to create image-available semaphore")?;
            let render_finished = match device.device.create_semaphore(&semaphore_info, None) {
                Ok(semaphore) => semaphore,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    return Err(RhiError::vulkan("vkCreateSemaphore", e).into());
                }
            };
            let in_flight_fence = match device.device.create_fence(&fence_info, None) {
                Ok(fence) => fence,
                Err(e) => {
                    device.device.destroy_semaphore(image_available, None);
                    device.device.destroy_semaphore(render_finished, None);
                    return Err(RhiError::vulkan("vkCreateFence", e).into());
                }
            };

            Ok(Self {
                command_buffer,
                image_available,
                render_finished,
                in_flight_fence,
                device: device.clone(),
            })
        }
    }

    /// Allocate `count` slots with command buffers from `pool`.
    pub fn create_slots(
        device: &Arc<VulkanDevice>,
        pool: &CommandPool,
        count: usize,
    ) -> Result<Vec<Self>> {
        let command_buffers = pool.allocate(count as u32)?;
        command_buffers
            .into_iter()
            .map(|cmd| Self::new(device, cmd))
            .collect()
    }

    /// Block until the previous submission using this slot has finished.
    pub fn wait(&self) -> Result<()> {
        unsafe {
            self.device
                .device
                .wait_for_fences(&[self.in_flight_fence], true, u64::MAX)
        }
        .map_err(|e| RhiError::vulkan("vkWaitForFences", e))
        .context("Failed waiting for in-flight fence")
    }

    /// Unsignal the fence; only call when a submission that signals it follows.
    pub fn reset(&self) -> Result<()> {
        unsafe { self.device.device.reset_fences(&[self.in_flight_fence]) }
            .map_err(|e| RhiError::vulkan("vkResetFences", e))
            .context("Failed to reset in-flight fence")
    }
}

impl Drop for FrameSlot {
    fn drop(&mut self) {
        // The command buffer belongs to the pool
        unsafe {
            self.device.device.destroy_semaphore(self.image_available, None);
            self.device.device.destroy_semaphore(self.render_finished, None);
            self.device.device.destroy_fence(self.in_flight_fence, None);
        }
    }
}
