//! Camera system
//!
//! Derived matrices are cached in an explicit [`Derived`] slot. Every setter
//! that changes an input marks the slot dirty; [`Camera::matrices`] is the
//! only reader and recomputes when dirty, so matrices are never stale and
//! never recomputed without cause.

use glam::{Mat4, Vec3, Vec4};

use crate::backend::Viewport;
use crate::pipeline::bounds::Ray;
use crate::pipeline::visibility::Frustum;
use crate::scene::NodeId;

/// Camera projection type
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Projection {
    /// Vertical field of view in radians.
    Perspective { fov_y: f32, aspect: f32 },
    /// Symmetric box `size` units high.
    Orthographic { size: f32, aspect: f32 },
    /// Explicit box with an identity view matrix, for screen-space work.
    Ortho2D {
        left: f32,
        right: f32,
        bottom: f32,
        top: f32,
    },
}

impl Default for Projection {
    fn default() -> Self {
        Projection::Perspective {
            fov_y: std::f32::consts::FRAC_PI_4,
            aspect: 1.0,
        }
    }
}

impl Projection {
    pub fn perspective(fov_y_degrees: f32, aspect: f32) -> Self {
        Projection::Perspective {
            fov_y: fov_y_degrees.to_radians(),
            aspect,
        }
    }

    pub fn orthographic(size: f32, aspect: f32) -> Self {
        Projection::Orthographic { size, aspect }
    }

    pub fn matrix(&self, near: f32, far: f32) -> Mat4 {
        match *self {
            Projection::Perspective { fov_y, aspect } => {
                Mat4::perspective_rh(fov_y, aspect, near, far)
            }
            Projection::Orthographic { size, aspect } => {
                let half_h = size / 2.0;
                let half_w = half_h * aspect;
                Mat4::orthographic_rh(-half_w, half_w, -half_h, half_h, near, far)
            }
            Projection::Ortho2D {
                left,
                right,
                bottom,
                top,
            } => Mat4::orthographic_rh(left, right, bottom, top, near, far),
        }
    }
}

/// Matrices derived from a camera's inputs.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CameraMatrices {
    pub view: Mat4,
    pub projection: Mat4,
    pub view_projection: Mat4,
}

/// A cached value that is either up to date or needs recomputing.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Derived<T> {
    Dirty,
    Clean(T),
}

impl<T> Derived<T> {
    pub fn invalidate(&mut self) {
        *self = Derived::Dirty;
    }

    pub fn is_dirty(&self) -> bool {
        matches!(self, Derived::Dirty)
    }
}

/// Which buffers a camera clears before drawing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ClearFlags {
    pub color: bool,
    pub depth: bool,
}

impl Default for ClearFlags {
    fn default() -> Self {
        Self {
            color: true,
            depth: true,
        }
    }
}

/// Camera for viewing the scene
#[derive(Debug, Clone)]
pub struct Camera {
    eye: Vec3,
    center: Vec3,
    up: Vec3,
    projection: Projection,
    near: f32,
    far: f32,
    explicit: Option<(Mat4, Mat4)>,
    matrices: Derived<CameraMatrices>,
    /// Normalized `(x, y, width, height)` of the render target, origin top-left.
    pub viewport: Vec4,
    pub clear: ClearFlags,
    /// Overrides the scene background when set.
    pub background: Option<Vec4>,
    /// Higher priorities render first.
    pub priority: i32,
    pub enabled: bool,
    /// Node the camera was collected from.
    pub node: Option<NodeId>,
}

impl Default for Camera {
    fn default() -> Self {
        Self {
            eye: Vec3::new(0.0, 0.0, 5.0),
            center: Vec3::ZERO,
            up: Vec3::Y,
            projection: Projection::default(),
            near: 0.1,
            far: 1000.0,
            explicit: None,
            matrices: Derived::Dirty,
            viewport: Vec4::new(0.0, 0.0, 1.0, 1.0),
            clear: ClearFlags::default(),
            background: None,
            priority: 0,
            enabled: true,
            node: None,
        }
    }
}

impl Camera {
    pub fn new(eye: Vec3, center: Vec3) -> Self {
        Self {
            eye,
            center,
            ..Default::default()
        }
    }

    /// Perspective camera looking from `eye` at `center`.
    pub fn perspective(eye: Vec3, center: Vec3, fov_y_degrees: f32, near: f32, far: f32) -> Self {
        Self {
            eye,
            center,
            projection: Projection::perspective(fov_y_degrees, 1.0),
            near,
            far,
            ..Default::default()
        }
    }

    /// Orthographic camera `size` units high.
    pub fn orthographic(eye: Vec3, center: Vec3, size: f32, near: f32, far: f32) -> Self {
        Self {
            eye,
            center,
            projection: Projection::orthographic(size, 1.0),
            near,
            far,
            ..Default::default()
        }
    }

    /// Camera with an identity view and an explicit 2D box.
    pub fn ortho_2d(left: f32, right: f32, bottom: f32, top: f32) -> Self {
        Self {
            eye: Vec3::ZERO,
            center: -Vec3::Z,
            projection: Projection::Ortho2D {
                left,
                right,
                bottom,
                top,
            },
            near: -1.0,
            far: 1.0,
            ..Default::default()
        }
    }

    pub fn with_viewport(mut self, viewport: Vec4) -> Self {
        self.viewport = viewport;
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_up(mut self, up: Vec3) -> Self {
        self.set_up(up);
        self
    }

    pub fn eye(&self) -> Vec3 {
        self.eye
    }

    pub fn center(&self) -> Vec3 {
        self.center
    }

    pub fn up(&self) -> Vec3 {
        self.up
    }

    pub fn near(&self) -> f32 {
        self.near
    }

    pub fn far(&self) -> f32 {
        self.far
    }

    pub fn projection(&self) -> Projection {
        self.projection
    }

    pub fn set_eye(&mut self, eye: Vec3) {
        if self.eye != eye {
            self.eye = eye;
            self.matrices.invalidate();
        }
    }

    pub fn set_center(&mut self, center: Vec3) {
        if self.center != center {
            self.center = center;
            self.matrices.invalidate();
        }
    }

    pub fn set_up(&mut self, up: Vec3) {
        if self.up != up {
            self.up = up;
            self.matrices.invalidate();
        }
    }

    pub fn look_at(&mut self, eye: Vec3, center: Vec3, up: Vec3) {
        self.set_eye(eye);
        self.set_center(center);
        self.set_up(up);
    }

    pub fn set_projection(&mut self, projection: Projection) {
        if self.projection != projection {
            self.projection = projection;
            self.matrices.invalidate();
        }
    }

    pub fn set_near_far(&mut self, near: f32, far: f32) {
        if self.near != near || self.far != far {
            self.near = near;
            self.far = far;
            self.matrices.invalidate();
        }
    }

    /// Update aspect ratio for perspective and orthographic projections
    pub fn set_aspect(&mut self, aspect: f32) {
        let projection = match self.projection {
            Projection::Perspective { fov_y, .. } => Projection::Perspective { fov_y, aspect },
            Projection::Orthographic { size, .. } => Projection::Orthographic { size, aspect },
            other => other,
        };
        self.set_projection(projection);
    }

    /// Bypass eye/center/up and the projection with explicit matrices.
    pub fn set_explicit_matrices(&mut self, matrices: Option<(Mat4, Mat4)>) {
        if self.explicit != matrices {
            self.explicit = matrices;
            self.matrices.invalidate();
        }
    }

    pub fn is_dirty(&self) -> bool {
        self.matrices.is_dirty()
    }

    /// Compute the matrices from the current inputs, ignoring the cache.
    pub fn compute_matrices(&self) -> CameraMatrices {
        let (view, projection) = match self.explicit {
            Some(explicit) => explicit,
            None => {
                let view = match self.projection {
                    Projection::Ortho2D { .. } => Mat4::IDENTITY,
                    _ => Mat4::look_at_rh(self.eye, self.center, self.up),
                };
                (view, self.projection.matrix(self.near, self.far))
            }
        };
        CameraMatrices {
            view,
            projection,
            view_projection: projection * view,
        }
    }

    /// Current matrices, recomputed first if any input changed.
    pub fn matrices(&mut self) -> CameraMatrices {
        if let Derived::Clean(matrices) = self.matrices {
            return matrices;
        }
        let matrices = self.compute_matrices();
        self.matrices = Derived::Clean(matrices);
        matrices
    }

    pub fn view_projection(&mut self) -> Mat4 {
        self.matrices().view_projection
    }

    /// World position of the viewer.
    pub fn position(&self) -> Vec3 {
        match self.explicit {
            Some((view, _)) => view.inverse().w_axis.truncate(),
            None => self.eye,
        }
    }

    /// Get the forward direction
    pub fn forward(&self) -> Vec3 {
        (self.center - self.eye).normalize_or_zero()
    }

    pub fn frustum(&mut self) -> Frustum {
        Frustum::from_view_projection(&self.view_projection())
    }

    /// Project a world point to target pixels (origin top-left) and depth.
    /// `None` for points behind the camera.
    pub fn project(&mut self, world: Vec3, viewport: Viewport) -> Option<Vec3> {
        let clip = self.view_projection() * world.extend(1.0);
        if clip.w <= 0.0 {
            return None;
        }
        let ndc = clip.truncate() / clip.w;
        Some(Vec3::new(
            viewport.x as f32 + (ndc.x * 0.5 + 0.5) * viewport.width as f32,
            viewport.y as f32 + (0.5 - ndc.y * 0.5) * viewport.height as f32,
            ndc.z,
        ))
    }

    /// Ray from the eye through a pixel of `viewport`.
    pub fn screen_ray(&mut self, x: f32, y: f32, viewport: Viewport) -> Ray {
        let inverse = self.view_projection().inverse();
        let ndc_x = (x - viewport.x as f32) / viewport.width.max(1) as f32 * 2.0 - 1.0;
        let ndc_y = 1.0 - (y - viewport.y as f32) / viewport.height.max(1) as f32 * 2.0;
        let near = inverse.project_point3(Vec3::new(ndc_x, ndc_y, 0.0));
        let far = inverse.project_point3(Vec3::new(ndc_x, ndc_y, 1.0));
        Ray::new(near, far - near)
    }
}
