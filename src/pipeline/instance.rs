//! Render instances: one drawable submission per frame.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;

use glam::{Mat4, Vec2, Vec3};

use crate::backend::{BlendState, CullMode, FrontFace, GeometryRef, PipelineState};
use crate::pipeline::bounds::{Aabb, BoundingSphere};
use crate::pipeline::inputs::ShaderInputs;
use crate::resources::{Material, Mesh};
use crate::scene::{normal_matrix, NodeId};

static NEXT_INSTANCE_ID: AtomicU32 = AtomicU32::new(1);

/// Stable identity of an instance across frames.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct InstanceId(pub u32);

impl InstanceId {
    pub fn next() -> Self {
        InstanceId(NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Per-draw switches.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderFlags {
    pub cull_backface: bool,
    pub winding_reversed: bool,
    pub depth_test: bool,
    pub depth_write: bool,
    pub alpha_test: bool,
    pub blend_enabled: bool,
    pub cast_shadows: bool,
    pub receive_shadows: bool,
    pub ignore_lights: bool,
    pub ignore_frustum_culling: bool,
    pub render_as_screen_space_2d: bool,
    /// Treat the world matrix as clip space.
    pub ignore_view_projection: bool,
    pub ignore_clipping_plane: bool,
    pub raycastable: bool,
    /// The owner positions the instance itself; the collector's update
    /// pass leaves its world matrix alone.
    pub skip_auto_transform_update: bool,
}

impl Default for RenderFlags {
    fn default() -> Self {
        Self {
            cull_backface: true,
            winding_reversed: false,
            depth_test: true,
            depth_write: true,
            alpha_test: false,
            blend_enabled: false,
            cast_shadows: true,
            receive_shadows: true,
            ignore_lights: false,
            ignore_frustum_culling: false,
            render_as_screen_space_2d: false,
            ignore_view_projection: false,
            ignore_clipping_plane: false,
            raycastable: true,
            skip_auto_transform_update: false,
        }
    }
}

/// Low-detail geometry used beyond `distance` from the camera.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Lod {
    pub geometry: GeometryRef,
    pub distance: f32,
}

#[derive(Debug, Clone)]
pub struct RenderInstance {
    pub id: InstanceId,
    pub node: Option<NodeId>,
    pub geometry: GeometryRef,
    pub wireframe: Option<GeometryRef>,
    pub lod: Option<Lod>,
    /// CPU copy of the geometry for ray tests.
    pub mesh: Option<Arc<Mesh>>,
    pub material: Arc<Material>,
    pub flags: RenderFlags,
    pub inputs: ShaderInputs,
    /// Higher renders earlier within its bucket.
    pub priority: i32,
    /// Size in pixels of a screen-space instance.
    pub screen_size: Vec2,
    world: Mat4,
    normal_matrix: Mat4,
    center: Vec3,
    local_aabb: Aabb,
    world_aabb: Aabb,
    /// Distance to the camera being rendered.
    pub camera_distance: f32,
    /// Result of the last frustum test.
    pub in_camera: bool,
}

impl RenderInstance {
    pub fn new(id: InstanceId, geometry: GeometryRef, local_aabb: Aabb, material: Arc<Material>) -> Self {
        Self {
            id,
            node: None,
            geometry,
            wireframe: None,
            lod: None,
            mesh: None,
            material,
            flags: RenderFlags::default(),
            inputs: ShaderInputs::default(),
            priority: 0,
            screen_size: Vec2::splat(32.0),
            world: Mat4::IDENTITY,
            normal_matrix: Mat4::IDENTITY,
            center: local_aabb.center(),
            local_aabb,
            world_aabb: local_aabb,
            camera_distance: 0.0,
            in_camera: true,
        }
    }

    pub fn with_world_matrix(mut self, world: Mat4) -> Self {
        self.set_world_matrix(world);
        self
    }

    pub fn with_flags(mut self, flags: RenderFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn world_matrix(&self) -> Mat4 {
        self.world
    }

    pub fn normal_matrix(&self) -> Mat4 {
        self.normal_matrix
    }

    /// World-space center of the bounds.
    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn local_aabb(&self) -> Aabb {
        self.local_aabb
    }

    pub fn world_aabb(&self) -> Aabb {
        self.world_aabb
    }

    pub fn bounding_sphere(&self) -> BoundingSphere {
        self.world_aabb.bounding_sphere()
    }

    /// Set the world matrix and re-derive everything that depends on it.
    pub fn set_world_matrix(&mut self, world: Mat4) {
        self.world = world;
        self.normal_matrix = normal_matrix(&world);
        self.world_aabb = self.local_aabb.transform(&world);
        self.center = self.world_aabb.center();
    }

    pub fn set_local_aabb(&mut self, local_aabb: Aabb) {
        self.local_aabb = local_aabb;
        self.set_world_matrix(self.world);
    }

    pub fn update_camera_distance(&mut self, eye: Vec3) {
        self.camera_distance = self.center.distance(eye);
    }

    pub fn is_opaque(&self) -> bool {
        !self.flags.blend_enabled
    }

    /// Geometry to draw at the current camera distance.
    pub fn geometry_for_distance(&self) -> &GeometryRef {
        match &self.lod {
            Some(lod) if self.camera_distance > lod.distance => &lod.geometry,
            _ => &self.geometry,
        }
    }

    /// Pipeline state of a first pass: `baseline` with the flags applied.
    pub fn pipeline_state(&self, baseline: &PipelineState) -> PipelineState {
        let flags = &self.flags;
        PipelineState {
            cull_mode: if flags.cull_backface && !self.material.two_sided {
                CullMode::Back
            } else {
                CullMode::None
            },
            front_face: if flags.winding_reversed {
                FrontFace::Cw
            } else {
                FrontFace::Ccw
            },
            depth_test: flags.depth_test,
            depth_write: flags.depth_write,
            depth_compare: baseline.depth_compare,
            blend: if flags.blend_enabled {
                Some(self.material.blend.state().unwrap_or_else(BlendState::alpha_blending))
            } else {
                None
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferHandle, PrimitiveTopology};

    fn geometry() -> GeometryRef {
        GeometryRef {
            vertex_buffer: BufferHandle(1),
            vertex_count: 3,
            index_buffer: None,
            index_count: 0,
            topology: PrimitiveTopology::TriangleList,
            range: None,
        }
    }

    #[test]
    fn world_matrix_rederives_bounds_and_center() {
        let aabb = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        let mut instance =
            RenderInstance::new(InstanceId::next(), geometry(), aabb, Arc::new(Material::default()));
        instance.set_world_matrix(Mat4::from_translation(Vec3::new(0.0, 0.0, -10.0)));
        assert_eq!(instance.center(), Vec3::new(0.0, 0.0, -10.0));
        assert_eq!(instance.world_aabb().min.z, -10.5);
        instance.update_camera_distance(Vec3::ZERO);
        assert_eq!(instance.camera_distance, 10.0);
    }

    #[test]
    fn lod_kicks_in_beyond_distance() {
        let aabb = Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5));
        let mut instance =
            RenderInstance::new(InstanceId::next(), geometry(), aabb, Arc::new(Material::default()));
        let low = GeometryRef {
            vertex_buffer: BufferHandle(9),
            ..geometry()
        };
        instance.lod = Some(Lod {
            geometry: low,
            distance: 20.0,
        });
        instance.camera_distance = 10.0;
        assert_eq!(instance.geometry_for_distance().vertex_buffer, BufferHandle(1));
        instance.camera_distance = 30.0;
        assert_eq!(instance.geometry_for_distance().vertex_buffer, BufferHandle(9));
    }

    #[test]
    fn flags_drive_pipeline_state() {
        let aabb = Aabb::default();
        let mut instance =
            RenderInstance::new(InstanceId::next(), geometry(), aabb, Arc::new(Material::default()));
        instance.flags.cull_backface = false;
        instance.flags.winding_reversed = true;
        instance.flags.blend_enabled = true;
        let state = instance.pipeline_state(&PipelineState::baseline());
        assert_eq!(state.cull_mode, CullMode::None);
        assert_eq!(state.front_face, FrontFace::Cw);
        assert_eq!(state.blend, Some(BlendState::alpha_blending()));
    }
}
