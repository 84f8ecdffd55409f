//! Visibility & sort stage
//!
//! Frustum planes are extracted from the view-projection matrix with the
//! Gribb-Hartmann row combination. Each plane is `Vec4(nx, ny, nz, d)` with
//! `dot(n, p) + d >= 0` inside.

use glam::{Mat4, Vec3, Vec4};

use crate::config::RenderOptions;
use crate::pipeline::bounds::Aabb;
use crate::pipeline::instance::RenderInstance;

/// Result of testing a box against a frustum.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Containment {
    Outside,
    Intersecting,
    Inside,
}

/// Six clip planes: left, right, bottom, top, near, far.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Frustum {
    planes: [Vec4; 6],
}

impl Frustum {
    /// Planes of a `[0, 1]` depth range view-projection matrix.
    pub fn from_view_projection(vp: &Mat4) -> Self {
        let r0 = vp.row(0);
        let r1 = vp.row(1);
        let r2 = vp.row(2);
        let r3 = vp.row(3);

        let mut planes = [r3 + r0, r3 - r0, r3 + r1, r3 - r1, r2, r3 - r2];
        for p in &mut planes {
            let len = p.truncate().length();
            if len > 1e-6 {
                *p /= len;
            }
        }
        Self { planes }
    }

    pub fn planes(&self) -> &[Vec4; 6] {
        &self.planes
    }

    /// Classify a box. Invalid boxes are reported as intersecting so they
    /// are never culled.
    pub fn test_aabb(&self, aabb: &Aabb) -> Containment {
        if !aabb.is_valid() {
            return Containment::Intersecting;
        }
        let mut result = Containment::Inside;
        for plane in &self.planes {
            let normal = plane.truncate();
            let positive = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.max, aabb.min);
            let negative = Vec3::select(normal.cmpge(Vec3::ZERO), aabb.min, aabb.max);
            if normal.dot(positive) + plane.w < 0.0 {
                return Containment::Outside;
            }
            if normal.dot(negative) + plane.w < 0.0 {
                result = Containment::Intersecting;
            }
        }
        result
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        self.planes.iter().all(|plane| plane.truncate().dot(p) + plane.w >= 0.0)
    }
}

/// Counts from one [`VisibilityStage::process`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VisibilityStats {
    pub visible: usize,
    pub culled: usize,
}

/// Culls and orders instances for one camera.
///
/// The bucket vectors are scratch space reused between calls and cleared at
/// the start of every call.
#[derive(Debug, Default)]
pub struct VisibilityStage {
    opaque: Vec<usize>,
    transparent: Vec<usize>,
}

impl VisibilityStage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Write the submission order of `instances` into `out` as indices.
    ///
    /// Updates each instance's `camera_distance` and `in_camera`.
    pub fn process(
        &mut self,
        instances: &mut [RenderInstance],
        view_projection: &Mat4,
        eye: Vec3,
        options: &RenderOptions,
        out: &mut Vec<usize>,
    ) -> VisibilityStats {
        self.opaque.clear();
        self.transparent.clear();
        out.clear();

        let frustum = Frustum::from_view_projection(view_projection);
        let mut stats = VisibilityStats::default();

        for (index, instance) in instances.iter_mut().enumerate() {
            instance.update_camera_distance(eye);
            let skip_test = !options.frustum_culling_enabled
                || instance.flags.ignore_frustum_culling
                || instance.flags.ignore_view_projection;
            instance.in_camera =
                skip_test || frustum.test_aabb(&instance.world_aabb()) != Containment::Outside;
            if !instance.in_camera {
                stats.culled += 1;
                continue;
            }
            stats.visible += 1;
            if instance.is_opaque() {
                self.opaque.push(index);
            } else {
                self.transparent.push(index);
            }
        }

        if options.sort_by_distance {
            let distance = |i: &usize| instances[*i].camera_distance;
            self.opaque
                .sort_by(|a, b| distance(a).total_cmp(&distance(b)));
            self.transparent
                .sort_by(|a, b| distance(b).total_cmp(&distance(a)));
        }

        out.extend_from_slice(&self.opaque);
        out.extend_from_slice(&self.transparent);

        if options.sort_by_priority {
            out.sort_by(|a, b| instances[*b].priority.cmp(&instances[*a].priority));
        }

        log::trace!(
            "Visibility: {} visible ({} transparent), {} culled",
            stats.visible,
            self.transparent.len(),
            stats.culled
        );
        stats
    }
}
