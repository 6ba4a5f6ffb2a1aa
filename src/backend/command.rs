// Command pool ownership
//
// Destroying the pool frees every command buffer allocated from it.

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::error::RhiError;
use super::VulkanDevice;

pub struct CommandPool {
    pub pool: vk::CommandPool,
    pub queue_family: u32,
    device: Arc<VulkanDevice>,
}

impl CommandPool {
    pub fn new(
        device: &Arc<VulkanDevice>,
        queue_family: u32,
        flags: vk::CommandPoolCreateFlags,
    ) -> Result<Self> {
        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(queue_family)
            .flags(flags);

        let pool = unsafe { device.device.create_command_pool(&pool_info, None) }
            .map_err(|e| RhiError::vulkan("vkCreateCommandPool", e))
            .context("Failed to create command pool")?;

        Ok(Self {
            pool,
            queue_family,
            device: device.clone(),
        })
    }

    /// Pool for per-frame command buffers that are reset and re-recorded individually.
    pub fn resettable(device: &Arc<VulkanDevice>, queue_family: u32) -> Result<Self> {
        Self::new(
            device,
            queue_family,
            vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER,
        )
    }

    /// Pool for short-lived one-shot command buffers.
    pub fn transient(device: &Arc<VulkanDevice>, queue_family: u32) -> Result<Self> {
        Self::new(device, queue_family, vk::CommandPoolCreateFlags::TRANSIENT)
    }

    pub fn allocate(&self, count: u32) -> Result<Vec<vk::CommandBuffer>> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        unsafe { self.device.device.allocate_command_buffers(&alloc_info) }
            .map_err(|e| RhiError::vulkan("vkAllocateCommandBuffers", e))
            .context("Failed to allocate command buffers")
    }

    pub fn free(&self, command_buffers: &[vk::CommandBuffer]) {
        if !command_buffers.is_empty() {
            unsafe {
                self.device
                    .device
                    .free_command_buffers(self.pool, command_buffers)
            };
        }
    }
}

impl Drop for CommandPool {
    fn drop(&mut self) {
        unsafe { self.device.device.destroy_command_pool(self.pool, None) };
    }
}
