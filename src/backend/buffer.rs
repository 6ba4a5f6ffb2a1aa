// Buffer utilities for vertex, index, uniform and staging buffers
//
// A GpuBuffer owns a buffer object and its dedicated memory allocation and
// releases both on drop. Uniform buffers stay mapped for their whole life.

use anyhow::{Context, Result};
use ash::vk;
use std::ptr::NonNull;
use std::sync::Arc;

use super::error::RhiError;
use super::VulkanDevice;

/// First memory type whose bit is set in `type_filter` and whose flags are a
/// superset of `properties`.
pub fn find_memory_type(
    memory_properties: &vk::PhysicalDeviceMemoryProperties,
    type_filter: u32,
    properties: vk::MemoryPropertyFlags,
) -> Result<u32> {
    let count = memory_properties
        .memory_type_count
        .min(vk::MAX_MEMORY_TYPES as u32);

    for i in 0..count {
        let has_type = (type_filter & (1 << i)) != 0;
        let has_properties = memory_properties.memory_types[i as usize]
            .property_flags
            .contains(properties);

        if has_type && has_properties {
            return Ok(i);
        }
    }

    log::error!(
        "No memory type for filter {:#b} with {:?}",
        type_filter,
        properties
    );
    Err(RhiError::NoSuitableMemoryType {
        type_filter,
        properties,
    }
    .into())
}

/// Allocate and bind dedicated memory for a resource with the given requirements.
pub(crate) fn allocate_memory(
    device: &VulkanDevice,
    requirements: vk::MemoryRequirements,
    properties: vk::MemoryPropertyFlags,
) -> Result<vk::DeviceMemory> {
    let memory_type_index = find_memory_type(
        &device.memory_properties,
        requirements.memory_type_bits,
        properties,
    )?;

    let alloc_info = vk::MemoryAllocateInfo::builder()
        .allocation_size(requirements.size)
        .memory_type_index(memory_type_index);

    unsafe { device.device.allocate_memory(&alloc_info, None) }
        .map_err(|e| RhiError::vulkan("vkAllocateMemory", e))
        .context("Failed to allocate device memory")
}

/// Buffer object + backing memory + size.
pub struct GpuBuffer {
    pub buffer: vk::Buffer,
    pub memory: vk::DeviceMemory,
    pub size: vk::DeviceSize,
    mapped: Option<NonNull<u8>>,
    device: Arc<VulkanDevice>,
}

impl GpuBuffer {
    /// Create a buffer with specified usage and memory properties
    pub fn new(
        device: &Arc<VulkanDevice>,
        size: vk::DeviceSize,
        usage: vk::BufferUsageFlags,
        memory_properties: vk::MemoryPropertyFlags,
    ) -> Result<Self> {
        if size == 0 {
            return Err(RhiError::EmptyUpload.into());
        }

        let buffer_info = vk::BufferCreateInfo::builder()
            .size(size)
            .usage(usage)
            .sharing_mode(vk::SharingMode::EXCLUSIVE);

        let buffer = unsafe { device.device.create_buffer(&buffer_info, None) }
            .map_err(|e| RhiError::vulkan("vkCreateBuffer", e))
            .context("Failed to create buffer")?;

        let requirements = unsafe { device.device.get_buffer_memory_requirements(buffer) };

        let memory = match allocate_memory(device, requirements, memory_properties) {
            Ok(memory) => memory,
            Err(e) => {
                unsafe { device.device.destroy_buffer(buffer, None) };
                return Err(e);
            }
        };

        let bound = unsafe { device.device.bind_buffer_memory(buffer, memory, 0) };
        if let Err(e) = bound {
            unsafe {
                device.device.destroy_buffer(buffer, None);
                device.device.free_memory(memory, None);
            }
            return Err(RhiError::vulkan("vkBindBufferMemory", e))
                .context("Failed to bind buffer memory");
        }

        Ok(Self {
            buffer,
            memory,
            size,
            mapped: None,
            device: device.clone(),
        })
    }

    /// Host-visible, coherent staging buffer usable as a copy source.
    pub fn staging(device: &Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Self> {
        Self::new(
            device,
            size,
            vk::BufferUsageFlags::TRANSFER_SRC,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )
    }

    /// Uniform buffer that is mapped once and written every frame.
    pub fn uniform(device: &Arc<VulkanDevice>, size: vk::DeviceSize) -> Result<Self> {
        let mut buffer = Self::new(
            device,
            size,
            vk::BufferUsageFlags::UNIFORM_BUFFER,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
        )?;
        buffer.map_persistent()?;
        Ok(buffer)
    }

    /// Keep the whole allocation mapped until the buffer is dropped.
    pub fn map_persistent(&mut self) -> Result<()> {
        if self.mapped.is_some() {
            return Ok(());
        }

        let ptr = unsafe {
            self.device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
        }
        .context("Failed to map buffer memory")?;

        self.mapped = NonNull::new(ptr.cast::<u8>());
        Ok(())
    }

    pub fn is_mapped(&self) -> bool {
        self.mapped.is_some()
    }

    /// Write into the persistent mapping.
    pub fn write<T: bytemuck::Pod>(&self, data: &[T]) -> Result<()> {
        let bytes: &[u8] = bytemuck::cast_slice(data);
        let ptr = self.mapped.context("Buffer is not persistently mapped")?;
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "Write of {} bytes exceeds buffer size {}",
            bytes.len(),
            self.size
        );

        unsafe {
            ptr.as_ptr()
                .copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
        }
        Ok(())
    }

    /// Map, copy and unmap in one go. For buffers that are not kept mapped.
    pub fn fill(&self, bytes: &[u8]) -> Result<()> {
        if self.mapped.is_some() {
            return self.write(bytes);
        }
        anyhow::ensure!(
            bytes.len() as vk::DeviceSize <= self.size,
            "Fill of {} bytes exceeds buffer size {}",
            bytes.len(),
            self.size
        );

        unsafe {
            let ptr = self
                .device
                .device
                .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                .context("Failed to map buffer memory")? as *mut u8;

            ptr.copy_from_nonoverlapping(bytes.as_ptr(), bytes.len());
            self.device.device.unmap_memory(self.memory);
        }
        Ok(())
    }

    /// Copy the buffer contents out through a temporary mapping.
    pub fn read(&self) -> Result<Vec<u8>> {
        let mut out = vec![0u8; self.size as usize];

        unsafe {
            match self.mapped {
                Some(ptr) => out.as_mut_ptr().copy_from_nonoverlapping(ptr.as_ptr(), out.len()),
                None => {
                    let ptr = self
                        .device
                        .device
                        .map_memory(self.memory, 0, self.size, vk::MemoryMapFlags::empty())
                        .context("Failed to map buffer memory")?
                        as *const u8;
                    out.as_mut_ptr().copy_from_nonoverlapping(ptr, out.len());
                    self.device.device.unmap_memory(self.memory);
                }
            }
        }
        Ok(out)
    }
}

impl Drop for GpuBuffer {
    fn drop(&mut self) {
        unsafe {
            if self.mapped.take().is_some() {
                self.device.device.unmap_memory(self.memory);
            }
            self.device.device.destroy_buffer(self.buffer, None);
            self.device.device.free_memory(self.memory, None);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn memory_properties(flags: &[vk::MemoryPropertyFlags]) -> vk::PhysicalDeviceMemoryProperties {
        let mut props = vk::PhysicalDeviceMemoryProperties {
            memory_type_count: flags.len() as u32,
            ..Default::default()
        };
        for (slot, &flag) in props.memory_types.iter_mut().zip(flags) {
            slot.property_flags = flag;
        }
        props
    }

    #[test]
    fn picks_first_matching_type() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT,
            vk::MemoryPropertyFlags::HOST_VISIBLE
                | vk::MemoryPropertyFlags::HOST_COHERENT
                | vk::MemoryPropertyFlags::HOST_CACHED,
        ]);

        let host = vk::MemoryPropertyFlags::HOST_VISIBLE | vk::MemoryPropertyFlags::HOST_COHERENT;
        assert_eq!(find_memory_type(&props, 0b111, host).unwrap(), 1);
        assert_eq!(
            find_memory_type(&props, 0b111, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            0
        );
    }

    #[test]
    fn respects_type_filter_bits() {
        let props = memory_properties(&[
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
            vk::MemoryPropertyFlags::DEVICE_LOCAL,
        ]);

        assert_eq!(
            find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).unwrap(),
            1
        );
    }

    #[test]
    fn superset_of_requested_flags_is_accepted() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL
            | vk::MemoryPropertyFlags::HOST_VISIBLE
            | vk::MemoryPropertyFlags::HOST_COHERENT]);

        assert_eq!(
            find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE).unwrap(),
            0
        );
    }

    #[test]
    fn no_match_is_a_typed_error() {
        let props = memory_properties(&[vk::MemoryPropertyFlags::DEVICE_LOCAL]);

        let err = find_memory_type(&props, 0b1, vk::MemoryPropertyFlags::HOST_VISIBLE)
            .unwrap_err();
        assert!(matches!(
            err.downcast_ref::<RhiError>(),
            Some(RhiError::NoSuitableMemoryType { type_filter: 0b1, .. })
        ));

        // Matching flags but excluded by the filter
        assert!(find_memory_type(&props, 0b10, vk::MemoryPropertyFlags::DEVICE_LOCAL).is_err());
    }
}
