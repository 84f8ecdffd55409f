//! Built-in node components.

use glam::{Mat4, Vec2, Vec3};

use crate::pipeline::bounds::{Aabb, BoundingSphere, Ray};
use crate::pipeline::inputs::ShaderInputs;
use crate::pipeline::instance::{InstanceId, Lod, RenderFlags, RenderInstance};
use crate::resources::{MaterialId, MeshId};
use crate::scene::{Camera, CollectContext, Collectable, Light, NodeId};

/// Draws a mesh with a material at the node's transform.
#[derive(Debug, Clone)]
pub struct MeshRenderer {
    id: InstanceId,
    pub mesh: MeshId,
    pub material: MaterialId,
    /// Lower-detail mesh and the camera distance it takes over at.
    pub lod: Option<(MeshId, f32)>,
    pub flags: RenderFlags,
    pub inputs: ShaderInputs,
    pub priority: i32,
    pub screen_size: Vec2,
    /// Sub-range `(start, count)` of the mesh to draw.
    pub range: Option<(u32, u32)>,
}

impl MeshRenderer {
    pub fn new(mesh: MeshId, material: MaterialId) -> Self {
        Self {
            id: InstanceId::next(),
            mesh,
            material,
            lod: None,
            flags: RenderFlags::default(),
            inputs: ShaderInputs::default(),
            priority: 0,
            screen_size: Vec2::splat(32.0),
            range: None,
        }
    }

    /// Identity of the instance this component produces every frame.
    pub fn instance_id(&self) -> InstanceId {
        self.id
    }

    pub fn with_flags(mut self, flags: RenderFlags) -> Self {
        self.flags = flags;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_lod(mut self, mesh: MeshId, distance: f32) -> Self {
        self.lod = Some((mesh, distance));
        self
    }

    pub fn with_inputs(mut self, inputs: ShaderInputs) -> Self {
        self.inputs = inputs;
        self
    }

    /// Draw as a screen-space sprite of `size` pixels.
    pub fn screen_space(mut self, size: Vec2) -> Self {
        self.flags.render_as_screen_space_2d = true;
        self.screen_size = size;
        self
    }
}

impl Collectable for MeshRenderer {
    fn collect_instances(&mut self, ctx: &CollectContext<'_>, out: &mut Vec<RenderInstance>) {
        let Some(mesh) = ctx.resources.get_mesh(self.mesh) else {
            log::trace!("Mesh {:?} not ready, skipping instance", self.mesh);
            return;
        };
        let Some(material) = ctx.resources.get_material(self.material) else {
            log::trace!("Material {:?} not ready, skipping instance", self.material);
            return;
        };

        let mut flags = self.flags;
        flags.blend_enabled |= material.is_transparent();
        flags.alpha_test |= material.alpha_test.is_some();
        flags.ignore_lights |= material.ignore_lights;

        let mut geometry = mesh.geometry;
        geometry.range = self.range;

        let mut instance = RenderInstance::new(self.id, geometry, mesh.local_aabb, material)
            .with_flags(flags)
            .with_priority(self.priority);
        instance.node = Some(ctx.node);
        instance.wireframe = mesh.wireframe;
        instance.mesh = Some(mesh.cpu.clone());
        instance.inputs = self.inputs.clone();
        instance.screen_size = self.screen_size;
        instance.lod = self.lod.and_then(|(lod_mesh, distance)| {
            ctx.resources.get_mesh(lod_mesh).map(|m| Lod {
                geometry: m.geometry,
                distance,
            })
        });
        instance.set_world_matrix(ctx.world);
        out.push(instance);
    }
}

/// Light attached to a node; its position and target follow the node.
#[derive(Debug, Clone)]
pub struct LightComponent {
    pub light: Light,
}

impl LightComponent {
    pub fn new(light: Light) -> Self {
        Self { light }
    }
}

impl Collectable for LightComponent {
    fn collect_lights(&mut self, ctx: &CollectContext<'_>, out: &mut Vec<Light>) {
        if !self.light.enabled {
            return;
        }
        let mut light = self.light.to_world(&ctx.world);
        light.node = Some(ctx.node);
        out.push(light);
    }
}

/// Camera attached to a node.
///
/// `eye`, `center` and `up` are in node space. The wrapped camera keeps its
/// cached matrices between frames as long as the node does not move.
#[derive(Debug, Clone)]
pub struct CameraComponent {
    pub camera: Camera,
    eye: Vec3,
    center: Vec3,
    up: Vec3,
}

impl CameraComponent {
    pub fn new(camera: Camera) -> Self {
        Self {
            eye: camera.eye(),
            center: camera.center(),
            up: camera.up(),
            camera,
        }
    }

    pub fn set_local_view(&mut self, eye: Vec3, center: Vec3, up: Vec3) {
        self.eye = eye;
        self.center = center;
        self.up = up;
    }
}

impl Collectable for CameraComponent {
    fn collect_cameras(&mut self, ctx: &CollectContext<'_>, out: &mut Vec<Camera>) {
        if !self.camera.enabled {
            return;
        }
        let up = ctx.world.transform_vector3(self.up).try_normalize().unwrap_or(Vec3::Y);
        self.camera.look_at(
            ctx.world.transform_point3(self.eye),
            ctx.world.transform_point3(self.center),
            up,
        );
        self.camera.node = Some(ctx.node);
        // warm the cache so clones start clean
        self.camera.matrices();
        out.push(self.camera.clone());
    }
}

/// Shape of a collider in node space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ColliderShape {
    Box { half_extents: Vec3 },
    Sphere { radius: f32 },
}

/// A collected collider in world space.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Collider {
    pub node: NodeId,
    pub shape: WorldShape,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum WorldShape {
    Box(Aabb),
    Sphere(BoundingSphere),
}

impl Collider {
    /// Hit distance along `ray`.
    pub fn intersect(&self, ray: &Ray) -> Option<f32> {
        match &self.shape {
            WorldShape::Box(aabb) => ray.intersect_aabb(aabb),
            WorldShape::Sphere(sphere) => ray.intersect_sphere(sphere),
        }
    }
}

/// Invisible volume used by collider ray queries.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColliderComponent {
    pub shape: ColliderShape,
}

impl ColliderComponent {
    pub fn cuboid(half_extents: Vec3) -> Self {
        Self {
            shape: ColliderShape::Box { half_extents },
        }
    }

    pub fn sphere(radius: f32) -> Self {
        Self {
            shape: ColliderShape::Sphere { radius },
        }
    }

    fn world_shape(&self, world: &Mat4) -> WorldShape {
        match self.shape {
            ColliderShape::Box { half_extents } => {
                WorldShape::Box(Aabb::from_center_half_extents(Vec3::ZERO, half_extents).transform(world))
            }
            ColliderShape::Sphere { radius } => {
                let (scale, _, translation) = world.to_scale_rotation_translation();
                WorldShape::Sphere(BoundingSphere::new(translation, radius * scale.abs().max_element()))
            }
        }
    }
}

impl Collectable for ColliderComponent {
    fn collect_colliders(&mut self, ctx: &CollectContext<'_>, out: &mut Vec<Collider>) {
        out.push(Collider {
            node: ctx.node,
            shape: self.world_shape(&ctx.world),
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use crate::resources::{Material, Mesh, ResourceStore};
    use crate::scene::Scene;

    fn context<'a>(store: &'a ResourceStore, world: Mat4) -> CollectContext<'a> {
        let mut scene = Scene::new();
        CollectContext {
            node: scene.add_node("n", None),
            world,
            resources: store,
        }
    }

    #[test]
    fn mesh_renderer_skips_until_loaded() {
        let mut store = ResourceStore::new();
        let mesh = store.reserve_mesh();
        let material = store.add_material(Material::default());
        let mut renderer = MeshRenderer::new(mesh, material);
        let mut out = Vec::new();
        renderer.collect_instances(&context(&store, Mat4::IDENTITY), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn mesh_renderer_keeps_instance_id_and_picks_up_blending() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut store = ResourceStore::new();
        let mesh = store.add_mesh(&mut backend, Mesh::cube()).unwrap();
        let material = store.add_material(Material::default().with_opacity(0.5));
        let mut renderer = MeshRenderer::new(mesh, material);
        let world = Mat4::from_translation(Vec3::new(3.0, 0.0, 0.0));
        let mut out = Vec::new();
        renderer.collect_instances(&context(&store, world), &mut out);
        renderer.collect_instances(&context(&store, world), &mut out);
        assert_eq!(out.len(), 2);
        assert_eq!(out[0].id, out[1].id);
        assert!(out[0].flags.blend_enabled);
        assert_eq!(out[0].center(), Vec3::new(3.0, 0.0, 0.0));
    }

    #[test]
    fn disabled_light_is_not_collected() {
        let store = ResourceStore::new();
        let mut light = Light::omni(Vec3::ZERO, Vec3::ONE);
        light.enabled = false;
        let mut component = LightComponent::new(light);
        let mut out = Vec::new();
        component.collect_lights(&context(&store, Mat4::IDENTITY), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn collider_follows_node_scale() {
        let store = ResourceStore::new();
        let world = Mat4::from_scale_rotation_translation(
            Vec3::splat(2.0),
            glam::Quat::IDENTITY,
            Vec3::new(0.0, 0.0, -5.0),
        );
        let mut component = ColliderComponent::sphere(1.0);
        let mut out = Vec::new();
        component.collect_colliders(&context(&store, world), &mut out);
        let ray = Ray::new(Vec3::ZERO, Vec3::NEG_Z);
        let t = out[0].intersect(&ray).unwrap();
        assert!((t - 3.0).abs() < 1e-4);
    }
}
