//! Renderer configuration

use glam::Vec4;

/// Construction-time settings of a [`Renderer`](crate::Renderer)
#[derive(Debug, Clone)]
pub struct RendererConfig {
    /// Re-run full scene collection every N frames; 1 collects every frame.
    pub collect_interval: u32,
    /// Most lights applied to one instance per frame
    pub max_lights_per_instance: usize,
    /// Lights at or below this computed intensity do not render shadows
    pub shadow_epsilon: f32,
    /// Clear color when neither the camera nor the scene sets one
    pub default_background: Vec4,
    /// Picking target size as a multiple of the camera viewport
    pub picking_resolution_scale: u32,
    /// Build line-list edge buffers for uploaded meshes
    pub build_wireframe_indices: bool,
    /// Deepest allowed nesting of render-to-texture calls
    pub nested_render_limit: usize,
}

impl Default for RendererConfig {
    fn default() -> Self {
        Self {
            collect_interval: 1,
            max_lights_per_instance: 8,
            shadow_epsilon: 0.0001,
            default_background: Vec4::new(0.0, 0.0, 0.0, 1.0),
            picking_resolution_scale: 1,
            build_wireframe_indices: true,
            nested_render_limit: 4,
        }
    }
}

impl RendererConfig {
    pub fn with_collect_interval(mut self, frames: u32) -> Self {
        self.collect_interval = frames.max(1);
        self
    }

    pub fn with_max_lights_per_instance(mut self, max: usize) -> Self {
        self.max_lights_per_instance = max;
        self
    }

    pub fn with_default_background(mut self, color: Vec4) -> Self {
        self.default_background = color;
        self
    }

    pub fn with_picking_resolution_scale(mut self, scale: u32) -> Self {
        self.picking_resolution_scale = scale.max(1);
        self
    }

    pub fn with_wireframe_indices(mut self, build: bool) -> Self {
        self.build_wireframe_indices = build;
        self
    }

    pub fn with_nested_render_limit(mut self, limit: usize) -> Self {
        self.nested_render_limit = limit;
        self
    }
}

/// Per-call render switches
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RenderOptions {
    pub force_wireframe: bool,
    pub shadows_disabled: bool,
    pub lights_disabled: bool,
    pub low_quality_shader_variant: bool,
    pub frustum_culling_enabled: bool,
    pub sort_by_distance: bool,
    pub sort_by_priority: bool,
    pub update_shadowmaps: bool,
    /// Render every enabled camera, not just the highest-priority one.
    pub render_all_cameras: bool,
    /// World-space plane `(normal, d)`; fragments with `dot(p, normal) < d` are dropped.
    pub clipping_plane: Option<Vec4>,
}

impl Default for RenderOptions {
    fn default() -> Self {
        Self {
            force_wireframe: false,
            shadows_disabled: false,
            lights_disabled: false,
            low_quality_shader_variant: false,
            frustum_culling_enabled: true,
            sort_by_distance: true,
            sort_by_priority: true,
            update_shadowmaps: true,
            render_all_cameras: true,
            clipping_plane: None,
        }
    }
}

impl RenderOptions {
    pub fn with_clipping_plane(mut self, plane: Vec4) -> Self {
        self.clipping_plane = Some(plane);
        self
    }

    /// Whether any shadow work happens this call.
    pub fn shadows_active(&self) -> bool {
        !self.shadows_disabled && !self.lights_disabled
    }
}
