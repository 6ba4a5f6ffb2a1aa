// Descriptor set layout, pool and per-frame sets
//
// The shader interface is fixed: binding 0 is the frame's uniform buffer
// (vertex stage), binding 1 the shared texture + sampler (fragment stage).

use anyhow::{Context, Result};
use ash::vk;
use std::sync::Arc;

use super::buffer::GpuBuffer;
use super::error::RhiError;
use super::image::GpuImage;
use super::VulkanDevice;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DescriptorBinding {
    pub binding: u32,
    pub descriptor_type: vk::DescriptorType,
    pub stages: vk::ShaderStageFlags,
}

pub const UNIFORM_BINDING: u32 = 0;
pub const TEXTURE_BINDING: u32 = 1;

pub const FRAME_BINDINGS: [DescriptorBinding; 2] = [
    DescriptorBinding {
        binding: UNIFORM_BINDING,
        descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
        stages: vk::ShaderStageFlags::VERTEX,
    },
    DescriptorBinding {
        binding: TEXTURE_BINDING,
        descriptor_type: vk::DescriptorType::COMBINED_IMAGE_SAMPLER,
        stages: vk::ShaderStageFlags::FRAGMENT,
    },
];

pub struct DescriptorSetLayout {
    pub layout: vk::DescriptorSetLayout,
    device: Arc<VulkanDevice>,
}

impl DescriptorSetLayout {
    pub fn new(device: &Arc<VulkanDevice>, bindings: &[DescriptorBinding]) -> Result<Self> {
        let vk_bindings: Vec<_> = bindings
            .iter()
            .map(|b| {
                vk::DescriptorSetLayoutBinding::builder()
                    .binding(b.binding)
                    .descriptor_type(b.descriptor_type)
                    .descriptor_count(1)
                    .stage_flags(b.stages)
                    .build()
            })
            .collect();

        let layout_info = vk::DescriptorSetLayoutCreateInfo::builder().bindings(&vk_bindings);

        let layout = unsafe { device.device.create_descriptor_set_layout(&layout_info, None) }
            .map_err(|e| RhiError::vulkan("vkCreateDescriptorSetLayout", e))
            .context("Failed to create descriptor set layout")?;

        Ok(Self {
            layout,
            device: device.clone(),
        })
    }
}

impl Drop for DescriptorSetLayout {
    fn drop(&mut self) {
        unsafe {
            self.device
                .device
                .destroy_descriptor_set_layout(self.layout, None)
        };
    }
}

/// Pool sizes for `frame_slots * sets_per_slot` sets, one entry per descriptor type.
pub fn pool_sizes(
    bindings: &[DescriptorBinding],
    frame_slots: u32,
    sets_per_slot: u32,
) -> Vec<vk::DescriptorPoolSize> {
    let set_count = frame_slots * sets_per_slot;
    let mut sizes: Vec<vk::DescriptorPoolSize> = Vec::new();

    for binding in bindings {
        match sizes.iter_mut().find(|s| s.ty == binding.descriptor_type) {
            Some(size) => size.descriptor_count += set_count,
            None => sizes.push(vk::DescriptorPoolSize {
                ty: binding.descriptor_type,
                descriptor_count: set_count,
            }),
        }
    }

    sizes
}

pub struct DescriptorPool {
    pub pool: vk::DescriptorPool,
    device: Arc<VulkanDevice>,
}

impl DescriptorPool {
    pub fn new(
        device: &Arc<VulkanDevice>,
        bindings: &[DescriptorBinding],
        frame_slots: u32,
        sets_per_slot: u32,
    ) -> Result<Self> {
        let sizes = pool_sizes(bindings, frame_slots, sets_per_slot);

        let pool_info = vk::DescriptorPoolCreateInfo::builder()
            .pool_sizes(&sizes)
            .max_sets(frame_slots * sets_per_slot);

        let pool = unsafe { device.device.create_descriptor_pool(&pool_info, None) }
            .map_err(|e| RhiError::vulkan("vkCreateDescriptorPool", e))
            .context("Failed to create descriptor pool")?;

        Ok(Self {
            pool,
            device: device.clone(),
        })
    }

    /// Allocate `count` sets; set `i` points at `uniform_buffers[i]` and, when
    /// given, the shared sampled image.
    pub fn allocate_sets(
        &self,
        layout: &DescriptorSetLayout,
        count: usize,
        uniform_buffers: &[&GpuBuffer],
        image: Option<&GpuImage>,
    ) -> Result<Vec<vk::DescriptorSet>> {
        anyhow::ensure!(
            uniform_buffers.len() == count,
            "Need one uniform buffer per descriptor set ({} sets, {} buffers)",
            count,
            uniform_buffers.len()
        );

        let layouts = vec![layout.layout; count];
        let alloc_info = vk::DescriptorSetAllocateInfo::builder()
            .descriptor_pool(self.pool)
            .set_layouts(&layouts);

        let sets = unsafe { self.device.device.allocate_descriptor_sets(&alloc_info) }
            .map_err(|e| RhiError::vulkan("vkAllocateDescriptorSets", e))
            .context("Failed to allocate descriptor sets")?;

        let buffer_infos: Vec<_> = uniform_buffers
            .iter()
            .map(|buffer| {
                vk::DescriptorBufferInfo::builder()
                    .buffer(buffer.buffer)
                    .offset(0)
                    .range(buffer.size)
                    .build()
            })
            .collect();

        let image_info = match image {
            Some(image) => Some(
                vk::DescriptorImageInfo::builder()
                    .image_layout(vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL)
                    .image_view(image.view)
                    .sampler(image.sampler.context("Sampled image has no sampler")?)
                    .build(),
            ),
            None => None,
        };

        let mut writes = Vec::with_capacity(count * 2);
        for (set, buffer_info) in sets.iter().zip(&buffer_infos) {
            writes.push(
                vk::WriteDescriptorSet::builder()
                    .dst_set(*set)
                    .dst_binding(UNIFORM_BINDING)
                    .dst_array_element(0)
                    .descriptor_type(vk::DescriptorType::UNIFORM_BUFFER)
                    .buffer_info(std::slice::from_ref(buffer_info))
                    .build(),
            );

            if let Some(image_info) = image_info.as_ref() {
                writes.push(
                    vk::WriteDescriptorSet::builder()
                        .dst_set(*set)
                        .dst_binding(TEXTURE_BINDING)
                        .dst_array_element(0)
                        .descriptor_type(vk::DescriptorType::COMBINED_IMAGE_SAMPLER)
                        .image_info(std::slice::from_ref(image_info))
                        .build(),
                );
            }
        }

        unsafe { self.device.device.update_descriptor_sets(&writes, &[]) };

        log::debug!("Allocated {} descriptor sets", sets.len());
        Ok(sets)
    }
}

impl Drop for DescriptorPool {
    fn drop(&mut self) {
        // Sets are freed with the pool
        unsafe { self.device.device.destroy_descriptor_pool(self.pool, None) };
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frame_bindings_are_uniform_then_sampler() {
        assert_eq!(FRAME_BINDINGS[0].binding, 0);
        assert_eq!(FRAME_BINDINGS[0].descriptor_type, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(FRAME_BINDINGS[0].stages, vk::ShaderStageFlags::VERTEX);

        assert_eq!(FRAME_BINDINGS[1].binding, 1);
        assert_eq!(
            FRAME_BINDINGS[1].descriptor_type,
            vk::DescriptorType::COMBINED_IMAGE_SAMPLER
        );
        assert_eq!(FRAME_BINDINGS[1].stages, vk::ShaderStageFlags::FRAGMENT);
    }

    #[test]
    fn pool_is_sized_for_every_slot() {
        let sizes = pool_sizes(&FRAME_BINDINGS, 2, 1);
        assert_eq!(sizes.len(), 2);
        assert!(sizes
            .iter()
            .all(|s| s.descriptor_count == 2));
    }

    #[test]
    fn repeated_descriptor_types_are_merged() {
        let bindings = [
            FRAME_BINDINGS[0],
            DescriptorBinding {
                binding: 2,
                descriptor_type: vk::DescriptorType::UNIFORM_BUFFER,
                stages: vk::ShaderStageFlags::FRAGMENT,
            },
        ];

        let sizes = pool_sizes(&bindings, 3, 2);
        assert_eq!(sizes.len(), 1);
        assert_eq!(sizes[0].ty, vk::DescriptorType::UNIFORM_BUFFER);
        assert_eq!(sizes[0].descriptor_count, 12);
    }
}
