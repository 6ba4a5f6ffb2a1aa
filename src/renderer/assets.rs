// Asset boundary
//
// CPU-side meshes and textures, handed to the transfer layer unchanged.
// Meshes are built-in primitives; textures come from the `image` crate, with a
// procedural checkerboard when no file is configured or it fails to load.

use anyhow::{Context, Result};
use glam::Vec3;
use std::path::Path;

use super::scene::Vertex;

/// Flat vertex list plus a triangle-list index buffer into it.
#[derive(Debug, Clone, PartialEq)]
pub struct MeshData {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
}

impl MeshData {
    pub fn triangle() -> Self {
        Self {
            vertices: vec![
                Vertex::new([-0.5, -0.5, 0.0], [1.0, 0.0, 0.0], [0.0, 0.0]),
                Vertex::new([0.5, -0.5, 0.0], [0.0, 1.0, 0.0], [1.0, 0.0]),
                Vertex::new([0.0, 0.5, 0.0], [0.0, 0.0, 1.0], [0.5, 1.0]),
            ],
            indices: vec![0, 1, 2],
        }
    }

    pub fn quad() -> Self {
        Self {
            vertices: vec![
                Vertex::new([-0.5, -0.5, 0.0], [1.0, 0.0, 0.0], [1.0, 0.0]),
                Vertex::new([0.5, -0.5, 0.0], [0.0, 1.0, 0.0], [0.0, 0.0]),
                Vertex::new([0.5, 0.5, 0.0], [0.0, 0.0, 1.0], [0.0, 1.0]),
                Vertex::new([-0.5, 0.5, 0.0], [1.0, 1.0, 1.0], [1.0, 1.0]),
            ],
            indices: vec![0, 1, 2, 2, 3, 0],
        }
    }

    /// Unit cube centred on the origin, four vertices per face so each face
    /// gets its own colour and full texture.
    pub fn cube() -> Self {
        // (normal, u, v) with u x v == normal, so faces wind CCW seen from outside
        let faces = [
            (Vec3::X, Vec3::Y, Vec3::Z, [1.0, 0.3, 0.3]),
            (Vec3::NEG_X, Vec3::Z, Vec3::Y, [0.3, 1.0, 1.0]),
            (Vec3::Y, Vec3::Z, Vec3::X, [0.3, 1.0, 0.3]),
            (Vec3::NEG_Y, Vec3::X, Vec3::Z, [1.0, 0.3, 1.0]),
            (Vec3::Z, Vec3::X, Vec3::Y, [0.3, 0.3, 1.0]),
            (Vec3::NEG_Z, Vec3::Y, Vec3::X, [1.0, 1.0, 0.3]),
        ];
        let corners = [(-1.0, -1.0, [0.0, 0.0]), (1.0, -1.0, [1.0, 0.0]), (1.0, 1.0, [1.0, 1.0]), (-1.0, 1.0, [0.0, 1.0])];

        let mut vertices = Vec::with_capacity(24);
        let mut indices = Vec::with_capacity(36);

        for (normal, u, v, color) in faces {
            let base = vertices.len() as u32;
            for (su, sv, tex_coord) in corners {
                let position = (normal + u * su + v * sv) * 0.5;
                vertices.push(Vertex::new(position.to_array(), color, tex_coord));
            }
            indices.extend_from_slice(&[base, base + 1, base + 2, base + 2, base + 3, base]);
        }

        Self { vertices, indices }
    }

    /// Look up a built-in primitive by its config name.
    pub fn builtin(name: &str) -> Option<Self> {
        match name.to_ascii_lowercase().as_str() {
            "triangle" => Some(Self::triangle()),
            "quad" => Some(Self::quad()),
            "cube" => Some(Self::cube()),
            _ => None,
        }
    }

    /// Every index must point at an existing vertex and form whole triangles.
    pub fn validate(&self) -> Result<()> {
        anyhow::ensure!(!self.vertices.is_empty(), "Mesh has no vertices");
        anyhow::ensure!(
            !self.indices.is_empty() && self.indices.len() % 3 == 0,
            "Mesh index count {} is not a whole number of triangles",
            self.indices.len()
        );
        if let Some(&bad) = self.indices.iter().find(|&&i| i as usize >= self.vertices.len()) {
            anyhow::bail!(
                "Index {} out of range for {} vertices",
                bad,
                self.vertices.len()
            );
        }
        Ok(())
    }
}

/// Tightly packed RGBA8 pixels.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TextureData {
    pub width: u32,
    pub height: u32,
    pub pixels: Vec<u8>,
}

impl TextureData {
    pub fn load(path: &Path) -> Result<Self> {
        let img = image::open(path)
            .with_context(|| format!("Failed to open texture {:?}", path))?
            .to_rgba8();
        let (width, height) = img.dimensions();

        log::info!("Loaded texture {:?}: {}x{}", path, width, height);
        Ok(Self {
            width,
            height,
            pixels: img.into_raw(),
        })
    }

    /// Two-tone checkerboard, `size` x `size` with `cell`-pixel squares.
    pub fn checkerboard(size: u32, cell: u32) -> Self {
        let cell = cell.max(1);
        let light = [0xe0, 0xe0, 0xe0, 0xff];
        let dark = [0x40, 0x40, 0x40, 0xff];

        let mut pixels = Vec::with_capacity((size * size * 4) as usize);
        for y in 0..size {
            for x in 0..size {
                let texel = if (x / cell + y / cell) % 2 == 0 { light } else { dark };
                pixels.extend_from_slice(&texel);
            }
        }

        Self {
            width: size,
            height: size,
            pixels,
        }
    }

    /// The configured texture, or the 256x256 checkerboard.
    pub fn load_or_default(path: Option<&Path>) -> Self {
        match path.map(Self::load) {
            Some(Ok(texture)) => texture,
            Some(Err(e)) => {
                log::warn!("{:#}. Using checkerboard texture.", e);
                Self::checkerboard(256, 32)
            }
            None => Self::checkerboard(256, 32),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(v: &Vertex) -> Vec3 {
        Vec3::from_array(v.position)
    }

    #[test]
    fn builtin_meshes_are_valid() {
        for name in ["triangle", "quad", "cube", "Cube"] {
            let mesh = MeshData::builtin(name).unwrap();
            mesh.validate().unwrap();
        }
        assert!(MeshData::builtin("teapot").is_none());
    }

    #[test]
    fn triangle_has_three_vertices() {
        let mesh = MeshData::triangle();
        assert_eq!(mesh.vertices.len(), 3);
        assert_eq!(mesh.indices, vec![0, 1, 2]);
    }

    #[test]
    fn cube_faces_wind_outward() {
        let mesh = MeshData::cube();
        assert_eq!(mesh.vertices.len(), 24);
        assert_eq!(mesh.indices.len(), 36);

        for tri in mesh.indices.chunks(3) {
            let a = position(&mesh.vertices[tri[0] as usize]);
            let b = position(&mesh.vertices[tri[1] as usize]);
            let c = position(&mesh.vertices[tri[2] as usize]);
            let normal = (b - a).cross(c - a);
            let centroid = (a + b + c) / 3.0;
            assert!(normal.dot(centroid) > 0.0, "triangle {:?} faces inward", tri);
        }

        for v in &mesh.vertices {
            assert!(v.position.iter().all(|c| c.abs() == 0.5));
        }
    }

    #[test]
    fn validate_rejects_bad_indices() {
        let mut mesh = MeshData::triangle();
        mesh.indices = vec![0, 1, 3];
        assert!(mesh.validate().is_err());

        mesh.indices = vec![0, 1];
        assert!(mesh.validate().is_err());
    }

    #[test]
    fn checkerboard_alternates_cells() {
        let texture = TextureData::checkerboard(256, 32);
        assert_eq!(texture.width, 256);
        assert_eq!(texture.height, 256);
        assert_eq!(texture.pixels.len(), 256 * 256 * 4);

        let texel = |x: usize, y: usize| {
            let i = (y * 256 + x) * 4;
            &texture.pixels[i..i + 4]
        };
        assert_eq!(texel(0, 0), texel(31, 31));
        assert_ne!(texel(0, 0), texel(32, 0));
        assert_eq!(texel(0, 0), texel(32, 32));
        assert!(texture.pixels.chunks(4).all(|p| p[3] == 0xff));
    }

    #[test]
    fn missing_texture_falls_back_to_checkerboard() {
        let path = Path::new("definitely/not/here.png");
        assert!(TextureData::load(path).is_err());
        assert_eq!(
            TextureData::load_or_default(Some(path)),
            TextureData::checkerboard(256, 32)
        );
        assert_eq!(TextureData::load_or_default(None).width, 256);
    }

    #[test]
    fn loads_png_as_rgba8() {
        let path = std::env::temp_dir().join(format!("rhi-renderer-{}.png", std::process::id()));
        let img = image::RgbImage::from_pixel(3, 2, image::Rgb([10, 20, 30]));
        img.save(&path).unwrap();

        let texture = TextureData::load(&path).unwrap();
        std::fs::remove_file(&path).ok();

        assert_eq!((texture.width, texture.height), (3, 2));
        assert_eq!(texture.pixels.len(), 3 * 2 * 4);
        assert_eq!(&texture.pixels[..4], &[10, 20, 30, 255]);
    }
}
