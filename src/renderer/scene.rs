// Scene data: vertex format, per-frame uniforms, GPU meshes

use anyhow::{Context, Result};
use ash::vk;
use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec3};
use std::mem::{offset_of, size_of};

use super::assets::MeshData;
use crate::backend::{GpuBuffer, Transfer, VertexLayout};

#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct Vertex {
    pub position: [f32; 3],
    pub color: [f32; 3],
    pub tex_coord: [f32; 2],
}

impl Vertex {
    pub const fn new(position: [f32; 3], color: [f32; 3], tex_coord: [f32; 2]) -> Self {
        Self {
            position,
            color,
            tex_coord,
        }
    }

    /// Binding 0, per-vertex; locations 0..=2 match scene.vert.
    pub fn layout() -> VertexLayout {
        let binding = vk::VertexInputBindingDescription::builder()
            .binding(0)
            .stride(size_of::<Vertex>() as u32)
            .input_rate(vk::VertexInputRate::VERTEX)
            .build();

        let attribute = |location: u32, format: vk::Format, offset: usize| {
            vk::VertexInputAttributeDescription::builder()
                .binding(0)
                .location(location)
                .format(format)
                .offset(offset as u32)
                .build()
        };

        VertexLayout {
            bindings: vec![binding],
            attributes: vec![
                attribute(0, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, position)),
                attribute(1, vk::Format::R32G32B32_SFLOAT, offset_of!(Vertex, color)),
                attribute(2, vk::Format::R32G32_SFLOAT, offset_of!(Vertex, tex_coord)),
            ],
        }
    }
}

/// Set 0, binding 0. Rewritten every frame through the slot's mapped buffer.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct UniformBufferObject {
    pub model: Mat4,
    pub view: Mat4,
    pub proj: Mat4,
}

impl UniformBufferObject {
    /// Spinning model seen from (2, 2, 2), Z up.
    pub fn for_frame(elapsed_secs: f32, aspect: f32, fov_degrees: f32) -> Self {
        let aspect = if aspect.is_finite() && aspect > 0.0 { aspect } else { 1.0 };

        let model = Mat4::from_rotation_z(elapsed_secs * 90f32.to_radians());
        let view = Mat4::look_at_rh(Vec3::splat(2.0), Vec3::ZERO, Vec3::Z);
        let mut proj = Mat4::perspective_rh(fov_degrees.to_radians(), aspect, 0.1, 10.0);
        // Vulkan clip space has Y pointing down
        proj.y_axis.y *= -1.0;

        Self { model, view, proj }
    }
}

/// Vertex-stage push constant carrying each mesh's placement.
#[repr(C)]
#[derive(Debug, Clone, Copy, PartialEq, Pod, Zeroable)]
pub struct MeshPushConstants {
    pub transform: Mat4,
}

/// Where a mesh sits and whether it is drawn.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshInstance {
    pub name: String,
    pub transform: Mat4,
    pub visible: bool,
}

impl MeshInstance {
    pub fn new(name: &str, transform: Mat4) -> Self {
        Self {
            name: name.to_string(),
            transform,
            visible: true,
        }
    }

    /// Flip visibility, returning the new state.
    pub fn toggle(&mut self) -> bool {
        self.visible = !self.visible;
        self.visible
    }

    pub fn push_constants(&self) -> MeshPushConstants {
        MeshPushConstants {
            transform: self.transform,
        }
    }
}

pub struct Mesh {
    pub instance: MeshInstance,
    pub vertex_buffer: GpuBuffer,
    pub index_buffer: GpuBuffer,
    pub index_count: u32,
}

impl Mesh {
    pub fn upload(transfer: &Transfer, name: &str, data: &MeshData, transform: Mat4) -> Result<Self> {
        data.validate()
            .with_context(|| format!("Invalid mesh '{}'", name))?;

        let vertex_buffer = transfer
            .upload_slice(vk::BufferUsageFlags::VERTEX_BUFFER, &data.vertices)
            .with_context(|| format!("Failed to upload vertices for '{}'", name))?;
        let index_buffer = transfer
            .upload_slice(vk::BufferUsageFlags::INDEX_BUFFER, &data.indices)
            .with_context(|| format!("Failed to upload indices for '{}'", name))?;

        log::info!(
            "Uploaded mesh '{}': {} vertices, {} indices",
            name,
            data.vertices.len(),
            data.indices.len()
        );

        Ok(Self {
            instance: MeshInstance::new(name, transform),
            vertex_buffer,
            index_buffer,
            index_count: data.indices.len() as u32,
        })
    }
}

/// Spread `count` meshes along X, one unit and a half apart, centred on the origin.
pub fn mesh_placements(count: usize) -> Vec<Mat4> {
    let spacing = 1.5;
    let start = -(count.saturating_sub(1) as f32) * spacing / 2.0;
    (0..count)
        .map(|i| Mat4::from_translation(Vec3::new(start + i as f32 * spacing, 0.0, 0.0)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn vertex_layout_matches_struct() {
        assert_eq!(size_of::<Vertex>(), 32);

        let layout = Vertex::layout();
        assert_eq!(layout.bindings.len(), 1);
        assert_eq!(layout.bindings[0].stride, 32);
        assert_eq!(layout.bindings[0].input_rate, vk::VertexInputRate::VERTEX);

        let offsets: Vec<_> = layout.attributes.iter().map(|a| a.offset).collect();
        let locations: Vec<_> = layout.attributes.iter().map(|a| a.location).collect();
        let formats: Vec<_> = layout.attributes.iter().map(|a| a.format).collect();
        assert_eq!(offsets, vec![0, 12, 24]);
        assert_eq!(locations, vec![0, 1, 2]);
        assert_eq!(
            formats,
            vec![
                vk::Format::R32G32B32_SFLOAT,
                vk::Format::R32G32B32_SFLOAT,
                vk::Format::R32G32_SFLOAT
            ]
        );
    }

    #[test]
    fn uniform_block_is_three_matrices() {
        assert_eq!(size_of::<UniformBufferObject>(), 192);
        assert_eq!(size_of::<MeshPushConstants>(), 64);
        assert_eq!(
            bytemuck::bytes_of(&UniformBufferObject::for_frame(0.0, 1.0, 45.0)).len(),
            192
        );
    }

    #[test]
    fn projection_is_flipped_for_vulkan() {
        let ubo = UniformBufferObject::for_frame(0.0, 800.0 / 600.0, 45.0);
        assert!(ubo.proj.y_axis.y < 0.0);
        assert_eq!(ubo.model, Mat4::IDENTITY);
    }

    #[test]
    fn degenerate_aspect_is_replaced() {
        let ubo = UniformBufferObject::for_frame(1.0, 0.0, 45.0);
        assert!(ubo.proj.is_finite());
        let ubo = UniformBufferObject::for_frame(1.0, f32::NAN, 45.0);
        assert!(ubo.proj.is_finite());
    }

    #[test]
    fn toggling_hides_then_shows_an_instance() {
        let transform = Mat4::from_translation(Vec3::new(1.5, 0.0, 0.0));
        let mut instance = MeshInstance::new("cube", transform);
        assert!(instance.visible);

        assert!(!instance.toggle());
        assert!(!instance.visible);
        assert!(instance.toggle());

        assert_eq!(instance.name, "cube");
        assert_eq!(instance.push_constants().transform, transform);
    }

    #[test]
    fn placements_are_centred() {
        assert_eq!(mesh_placements(1), vec![Mat4::IDENTITY]);

        let placements = mesh_placements(3);
        let xs: Vec<f32> = placements.iter().map(|m| m.w_axis.x).collect();
        assert_eq!(xs, vec![-1.5, 0.0, 1.5]);
        assert!(mesh_placements(0).is_empty());
    }
}
