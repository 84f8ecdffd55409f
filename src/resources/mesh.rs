//! Mesh data structures and generation

use std::collections::HashSet;
use std::sync::Arc;

use glam::{Vec2, Vec3, Vec4};

use crate::backend::{
    BufferDescriptor, GeometryRef, GraphicsBackend, PrimitiveTopology, Vertex,
};
use crate::error::ResourceError;
use crate::pipeline::bounds::Aabb;

/// A mesh with vertex and index data
#[derive(Debug, Clone)]
pub struct Mesh {
    pub vertices: Vec<Vertex>,
    pub indices: Vec<u32>,
    pub topology: PrimitiveTopology,
    pub name: String,
}

impl Mesh {
    pub fn new(name: &str) -> Self {
        Self {
            vertices: Vec::new(),
            indices: Vec::new(),
            topology: PrimitiveTopology::TriangleList,
            name: name.to_string(),
        }
    }

    pub fn vertex_count(&self) -> usize {
        self.vertices.len()
    }

    pub fn index_count(&self) -> usize {
        self.indices.len()
    }

    pub fn triangle_count(&self) -> usize {
        match self.topology {
            PrimitiveTopology::TriangleList => self.indices.len() / 3,
            _ => 0,
        }
    }

    /// Get vertex data as bytes
    pub fn vertex_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.vertices)
    }

    /// Get index data as bytes
    pub fn index_bytes(&self) -> &[u8] {
        bytemuck::cast_slice(&self.indices)
    }

    /// Object-space bounds of every vertex.
    pub fn local_aabb(&self) -> Aabb {
        Aabb::from_points(self.vertices.iter().map(|v| v.position))
    }

    /// Triangle corner positions, skipping out-of-range indices.
    pub fn triangles(&self) -> impl Iterator<Item = [Vec3; 3]> + '_ {
        let tris = if self.topology == PrimitiveTopology::TriangleList {
            self.indices.chunks_exact(3)
        } else {
            self.indices[..0].chunks_exact(3)
        };
        tris.filter_map(|tri| {
            let a = self.vertices.get(tri[0] as usize)?.position;
            let b = self.vertices.get(tri[1] as usize)?.position;
            let c = self.vertices.get(tri[2] as usize)?.position;
            Some([a, b, c])
        })
    }

    /// Line-list indices with every triangle edge once.
    pub fn wireframe_indices(&self) -> Vec<u32> {
        let mut seen = HashSet::new();
        let mut lines = Vec::new();
        for tri in self.indices.chunks_exact(3) {
            for (a, b) in [(tri[0], tri[1]), (tri[1], tri[2]), (tri[2], tri[0])] {
                if seen.insert((a.min(b), a.max(b))) {
                    lines.extend_from_slice(&[a, b]);
                }
            }
        }
        lines
    }

    /// Create a unit cube centered at origin
    pub fn cube() -> Self {
        let mut mesh = Mesh::new("cube");

        let faces = [
            (Vec3::Z, Vec3::X, Vec3::Y),
            (-Vec3::Z, -Vec3::X, Vec3::Y),
            (Vec3::X, -Vec3::Z, Vec3::Y),
            (-Vec3::X, Vec3::Z, Vec3::Y),
            (Vec3::Y, Vec3::X, -Vec3::Z),
            (-Vec3::Y, Vec3::X, Vec3::Z),
        ];

        for (normal, right, up) in faces {
            let base = mesh.vertices.len() as u32;
            let corners = [
                (-0.5, -0.5, Vec2::new(0.0, 1.0)),
                (0.5, -0.5, Vec2::new(1.0, 1.0)),
                (0.5, 0.5, Vec2::new(1.0, 0.0)),
                (-0.5, 0.5, Vec2::new(0.0, 0.0)),
            ];
            for (u, v, uv) in corners {
                mesh.vertices.push(Vertex {
                    position: normal * 0.5 + right * u + up * v,
                    normal,
                    uv,
                    tangent: right.extend(1.0),
                });
            }
            mesh.indices
                .extend_from_slice(&[base, base + 1, base + 2, base, base + 2, base + 3]);
        }

        mesh
    }

    /// Create a UV sphere of diameter 1
    pub fn sphere(segments: u32, rings: u32) -> Self {
        let mut mesh = Mesh::new("sphere");
        let segments = segments.max(3);
        let rings = rings.max(2);

        let segment_angle = 2.0 * std::f32::consts::PI / segments as f32;
        let ring_angle = std::f32::consts::PI / rings as f32;

        for ring in 0..=rings {
            let phi = ring as f32 * ring_angle;
            let y = phi.cos();
            let ring_radius = phi.sin();

            for segment in 0..=segments {
                let theta = segment as f32 * segment_angle;
                let x = ring_radius * theta.cos();
                let z = ring_radius * theta.sin();

                mesh.vertices.push(Vertex {
                    position: Vec3::new(x, y, z) * 0.5,
                    normal: Vec3::new(x, y, z).normalize_or_zero(),
                    uv: Vec2::new(segment as f32 / segments as f32, ring as f32 / rings as f32),
                    tangent: Vec4::new(-theta.sin(), 0.0, theta.cos(), 1.0),
                });
            }
        }

        // Counter-clockwise seen from outside.
        for ring in 0..rings {
            for segment in 0..segments {
                let current = ring * (segments + 1) + segment;
                let next = current + segments + 1;
                mesh.indices.extend_from_slice(&[
                    current,
                    current + 1,
                    next,
                    current + 1,
                    next + 1,
                    next,
                ]);
            }
        }

        mesh
    }

    /// Create a plane on the XZ axis facing +Y
    pub fn plane(width: f32, depth: f32, subdivisions: u32) -> Self {
        let mut mesh = Mesh::new("plane");
        let subdivisions = subdivisions.max(1);

        let half_width = width / 2.0;
        let half_depth = depth / 2.0;
        let step_x = width / subdivisions as f32;
        let step_z = depth / subdivisions as f32;

        for z in 0..=subdivisions {
            for x in 0..=subdivisions {
                mesh.vertices.push(Vertex::new(
                    Vec3::new(-half_width + x as f32 * step_x, 0.0, -half_depth + z as f32 * step_z),
                    Vec3::Y,
                    Vec2::new(x as f32 / subdivisions as f32, z as f32 / subdivisions as f32),
                ));
            }
        }

        for z in 0..subdivisions {
            for x in 0..subdivisions {
                let current = z * (subdivisions + 1) + x;
                let next = current + subdivisions + 1;
                mesh.indices.extend_from_slice(&[
                    current,
                    next,
                    current + 1,
                    current + 1,
                    next,
                    next + 1,
                ]);
            }
        }

        mesh
    }

    /// Unit quad in the XY plane facing +Z, centered at the origin.
    pub fn quad() -> Self {
        let mut mesh = Mesh::new("quad");
        for (x, y, u, v) in [
            (-0.5, -0.5, 0.0, 1.0),
            (0.5, -0.5, 1.0, 1.0),
            (0.5, 0.5, 1.0, 0.0),
            (-0.5, 0.5, 0.0, 0.0),
        ] {
            mesh.vertices
                .push(Vertex::new(Vec3::new(x, y, 0.0), Vec3::Z, Vec2::new(u, v)));
        }
        mesh.indices.extend_from_slice(&[0, 1, 2, 0, 2, 3]);
        mesh
    }
}

/// A mesh living on the backend.
#[derive(Debug, Clone)]
pub struct GpuMesh {
    pub geometry: GeometryRef,
    /// Line-list edges for wireframe rendering.
    pub wireframe: Option<GeometryRef>,
    pub local_aabb: Aabb,
    pub cpu: Arc<Mesh>,
}

impl GpuMesh {
    pub fn upload<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        mesh: Mesh,
        build_wireframe: bool,
    ) -> Result<Self, ResourceError> {
        let vertex_buffer = backend.create_buffer_init(
            &BufferDescriptor::vertex(&format!("{} vertices", mesh.name)),
            mesh.vertex_bytes(),
        )?;
        let index_buffer = if mesh.indices.is_empty() {
            None
        } else {
            Some(backend.create_buffer_init(
                &BufferDescriptor::index(&format!("{} indices", mesh.name)),
                mesh.index_bytes(),
            )?)
        };
        let geometry = GeometryRef {
            vertex_buffer,
            vertex_count: mesh.vertex_count() as u32,
            index_buffer,
            index_count: mesh.index_count() as u32,
            topology: mesh.topology,
            range: None,
        };

        let wireframe = if build_wireframe && mesh.triangle_count() > 0 {
            let lines = mesh.wireframe_indices();
            let buffer = backend.create_buffer_init(
                &BufferDescriptor::index(&format!("{} edges", mesh.name)),
                bytemuck::cast_slice(&lines),
            )?;
            Some(GeometryRef {
                index_buffer: Some(buffer),
                index_count: lines.len() as u32,
                topology: PrimitiveTopology::LineList,
                ..geometry
            })
        } else {
            None
        };

        log::debug!(
            "Uploaded mesh '{}' ({} vertices, {} indices)",
            mesh.name,
            mesh.vertex_count(),
            mesh.index_count()
        );
        Ok(Self {
            geometry,
            wireframe,
            local_aabb: mesh.local_aabb(),
            cpu: Arc::new(mesh),
        })
    }

    pub fn destroy<B: GraphicsBackend + ?Sized>(&self, backend: &mut B) {
        backend.destroy_buffer(self.geometry.vertex_buffer);
        if let Some(index) = self.geometry.index_buffer {
            backend.destroy_buffer(index);
        }
        if let Some(index) = self.wireframe.and_then(|w| w.index_buffer) {
            backend.destroy_buffer(index);
        }
    }
}
