//! Light types for the scene

use std::sync::atomic::{AtomicU64, Ordering};

use glam::{Mat4, Vec3};

use crate::pipeline::bounds::BoundingSphere;
use crate::resources::TextureId;
use crate::scene::{Camera, NodeId};

static NEXT_LIGHT_ID: AtomicU64 = AtomicU64::new(1);

/// Stable identity of a light, used to key its shadow map.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LightId(pub u64);

impl LightId {
    pub fn next() -> Self {
        LightId(NEXT_LIGHT_ID.fetch_add(1, Ordering::Relaxed))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LightKind {
    Omni,
    Spot,
    Directional,
}

/// Look direction and up vector of each cube face, in layer order.
pub const CUBE_FACES: [(Vec3, Vec3); 6] = [
    (Vec3::X, Vec3::NEG_Y),
    (Vec3::NEG_X, Vec3::NEG_Y),
    (Vec3::Y, Vec3::Z),
    (Vec3::NEG_Y, Vec3::NEG_Z),
    (Vec3::Z, Vec3::NEG_Y),
    (Vec3::NEG_Z, Vec3::NEG_Y),
];

/// A light source.
///
/// Positions are in the owning node's space until the light is collected;
/// collected lights are in world space.
#[derive(Debug, Clone)]
pub struct Light {
    pub id: LightId,
    pub kind: LightKind,
    pub position: Vec3,
    pub target: Vec3,
    pub up: Vec3,
    pub color: Vec3,
    pub intensity: f32,
    pub near: f32,
    pub far: f32,
    pub use_attenuation: bool,
    pub attenuation_start: f32,
    pub attenuation_end: f32,
    /// Full-intensity cone half-angle, radians.
    pub angle_inner: f32,
    /// Cut-off cone half-angle, radians.
    pub angle_outer: f32,
    /// Height of the orthographic shadow volume of a directional light.
    pub frustum_size: f32,
    pub use_diffuse: bool,
    pub use_specular: bool,
    pub cast_shadows: bool,
    pub shadow_bias: f32,
    pub shadow_resolution: u32,
    pub hard_shadows: bool,
    pub projective_texture: Option<TextureId>,
    pub enabled: bool,
    pub node: Option<NodeId>,
}

impl Light {
    fn with_kind(kind: LightKind) -> Self {
        Self {
            id: LightId::next(),
            kind,
            position: Vec3::ZERO,
            target: Vec3::NEG_Z,
            up: Vec3::Y,
            color: Vec3::ONE,
            intensity: 1.0,
            near: 0.1,
            far: 100.0,
            use_attenuation: false,
            attenuation_start: 0.0,
            attenuation_end: 10.0,
            angle_inner: 0.3,
            angle_outer: 0.5,
            frustum_size: 20.0,
            use_diffuse: true,
            use_specular: true,
            cast_shadows: false,
            shadow_bias: 0.005,
            shadow_resolution: 512,
            hard_shadows: false,
            projective_texture: None,
            enabled: true,
            node: None,
        }
    }

    /// Point light radiating in every direction.
    pub fn omni(position: Vec3, color: Vec3) -> Self {
        Self {
            position,
            color,
            use_attenuation: true,
            ..Self::with_kind(LightKind::Omni)
        }
    }

    /// Cone light from `position` towards `target`.
    pub fn spot(position: Vec3, target: Vec3, color: Vec3) -> Self {
        Self {
            position,
            target,
            color,
            ..Self::with_kind(LightKind::Spot)
        }
    }

    /// Parallel light shining from `position` towards `target`.
    pub fn directional(position: Vec3, target: Vec3, color: Vec3) -> Self {
        Self {
            position,
            target,
            color,
            ..Self::with_kind(LightKind::Directional)
        }
    }

    pub fn with_intensity(mut self, intensity: f32) -> Self {
        self.intensity = intensity;
        self
    }

    pub fn with_attenuation(mut self, start: f32, end: f32) -> Self {
        self.use_attenuation = true;
        self.attenuation_start = start;
        self.attenuation_end = end;
        self
    }

    pub fn without_attenuation(mut self) -> Self {
        self.use_attenuation = false;
        self
    }

    pub fn with_cone(mut self, inner_degrees: f32, outer_degrees: f32) -> Self {
        self.angle_inner = inner_degrees.to_radians();
        self.angle_outer = outer_degrees.to_radians();
        self
    }

    pub fn with_shadows(mut self, resolution: u32) -> Self {
        self.cast_shadows = true;
        self.shadow_resolution = resolution;
        self
    }

    pub fn with_hard_shadows(mut self, hard: bool) -> Self {
        self.hard_shadows = hard;
        self
    }

    pub fn with_specular(mut self, enabled: bool) -> Self {
        self.use_specular = enabled;
        self
    }

    pub fn with_projective_texture(mut self, texture: TextureId) -> Self {
        self.projective_texture = Some(texture);
        self
    }

    /// Brightest color channel scaled by intensity.
    pub fn computed_intensity(&self) -> f32 {
        self.color.max_element() * self.intensity
    }

    /// Unit direction the light points in.
    pub fn front(&self) -> Vec3 {
        (self.target - self.position).try_normalize().unwrap_or(Vec3::NEG_Z)
    }

    /// Far plane of the shadow cameras.
    pub fn shadow_far(&self) -> f32 {
        if !self.use_attenuation {
            return self.far;
        }
        let end = self.attenuation_end.max(self.near * 2.0);
        match self.kind {
            LightKind::Omni => end * std::f32::consts::SQRT_2,
            _ => end,
        }
    }

    /// Volume the light reaches, or `None` when it has no falloff.
    pub fn bounding_sphere(&self) -> Option<BoundingSphere> {
        if !self.use_attenuation || self.kind == LightKind::Directional {
            return None;
        }
        Some(BoundingSphere::new(self.position, self.attenuation_end))
    }

    /// Whether the light can reach anything inside `sphere`.
    pub fn overlaps(&self, sphere: &BoundingSphere) -> bool {
        match self.bounding_sphere() {
            Some(reach) => reach.intersects(sphere),
            None => true,
        }
    }

    /// Move the light into world space using its node's matrix.
    pub fn to_world(&self, world: &Mat4) -> Light {
        let mut light = self.clone();
        light.position = world.transform_point3(self.position);
        light.target = world.transform_point3(self.target);
        light.up = world.transform_vector3(self.up).try_normalize().unwrap_or(Vec3::Y);
        light
    }

    fn stable_up(&self) -> Vec3 {
        let front = self.front();
        if front.cross(self.up).length_squared() < 1e-6 {
            if front.y.abs() > 0.9 {
                Vec3::Z
            } else {
                Vec3::Y
            }
        } else {
            self.up
        }
    }

    /// Camera looking along the light, for directional and spot lights.
    pub fn camera(&self) -> Camera {
        let target = self.position + self.front();
        let camera = match self.kind {
            LightKind::Directional => {
                Camera::orthographic(self.position, target, self.frustum_size, self.near, self.shadow_far())
            }
            LightKind::Spot | LightKind::Omni => {
                let fov = (self.angle_outer * 2.0).to_degrees().clamp(1.0, 170.0);
                Camera::perspective(self.position, target, fov, self.near, self.shadow_far())
            }
        };
        camera.with_up(self.stable_up())
    }

    /// One 90 degree camera per cube face, in layer order.
    ///
    /// The projection flips y so each face lands in the cube layout
    /// samplers expect.
    pub fn cube_cameras(&self) -> [Camera; 6] {
        let projection = Mat4::from_scale(Vec3::new(1.0, -1.0, 1.0))
            * Mat4::perspective_rh(std::f32::consts::FRAC_PI_2, 1.0, self.near, self.shadow_far());
        CUBE_FACES.map(|(dir, up)| {
            let mut camera = Camera::new(self.position, self.position + dir).with_up(up);
            camera.set_near_far(self.near, self.shadow_far());
            camera.set_explicit_matrices(Some((
                Mat4::look_at_rh(self.position, self.position + dir, up),
                projection,
            )));
            camera
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shadow_far_follows_attenuation() {
        let omni = Light::omni(Vec3::ZERO, Vec3::ONE).with_attenuation(1.0, 10.0);
        assert!((omni.shadow_far() - 10.0 * std::f32::consts::SQRT_2).abs() < 1e-4);
        let spot = Light::spot(Vec3::ZERO, Vec3::NEG_Y, Vec3::ONE).with_attenuation(1.0, 8.0);
        assert_eq!(spot.shadow_far(), 8.0);
        let dir = Light::directional(Vec3::Y, Vec3::ZERO, Vec3::ONE);
        assert_eq!(dir.shadow_far(), dir.far);
    }

    #[test]
    fn lights_without_falloff_reach_everything() {
        let dir = Light::directional(Vec3::Y, Vec3::ZERO, Vec3::ONE);
        assert!(dir.overlaps(&BoundingSphere::new(Vec3::splat(1.0e6), 1.0)));
        let omni = Light::omni(Vec3::ZERO, Vec3::ONE).with_attenuation(0.0, 5.0);
        assert!(omni.overlaps(&BoundingSphere::new(Vec3::new(5.5, 0.0, 0.0), 1.0)));
        assert!(!omni.overlaps(&BoundingSphere::new(Vec3::new(20.0, 0.0, 0.0), 1.0)));
    }

    #[test]
    fn computed_intensity_uses_brightest_channel() {
        let light = Light::omni(Vec3::ZERO, Vec3::new(0.2, 0.8, 0.4)).with_intensity(2.0);
        assert!((light.computed_intensity() - 1.6).abs() < 1e-6);
    }

    #[test]
    fn cube_face_camera_projects_its_axis_to_the_center() {
        let light = Light::omni(Vec3::new(1.0, 2.0, 3.0), Vec3::ONE).with_attenuation(0.0, 10.0);
        for (mut camera, (dir, _)) in light.cube_cameras().into_iter().zip(CUBE_FACES) {
            let p = camera.view_projection().project_point3(light.position + dir * 2.0);
            assert!(p.x.abs() < 1e-4 && p.y.abs() < 1e-4);
        }
    }

    #[test]
    fn straight_down_camera_gets_a_usable_up() {
        let light = Light::directional(Vec3::new(0.0, 10.0, 0.0), Vec3::ZERO, Vec3::ONE);
        let mut camera = light.camera();
        assert!(camera.view_projection().is_finite());
    }
}
