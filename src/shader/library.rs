//! Built-in shader sources.
//!
//! Program sources are single GLSL files with `#ifdef VERTEX` /
//! `#ifdef FRAGMENT` sections. Include modules live under `lib/`.

/// Engine uniform blocks and material samplers.
pub const COMMON_GLSL: &str = include_str!("../../shaders/lib/common.glsl");
/// Single-light shading terms.
pub const LIGHTING_GLSL: &str = include_str!("../../shaders/lib/lighting.glsl");
/// Shadow map lookups.
pub const SHADOWS_GLSL: &str = include_str!("../../shaders/lib/shadows.glsl");

pub const PHONG_GLSL: &str = include_str!("../../shaders/phong.glsl");
pub const FLAT_GLSL: &str = include_str!("../../shaders/flat.glsl");
pub const FALLBACK_GLSL: &str = include_str!("../../shaders/fallback.glsl");
pub const PICKING_GLSL: &str = include_str!("../../shaders/picking.glsl");
pub const SHADOW_GLSL: &str = include_str!("../../shaders/shadow.glsl");
pub const SCREEN_QUAD_GLSL: &str = include_str!("../../shaders/screen_quad.glsl");

/// Name of the program substituted for permutations that fail to compile.
pub const FALLBACK_SHADER: &str = "fallback";
/// Program used for shadow map passes.
pub const SHADOW_SHADER: &str = "shadow";
/// Program used for picking passes.
pub const PICKING_SHADER: &str = "picking";
/// Program used for screen-space quads.
pub const SCREEN_QUAD_SHADER: &str = "screen_quad";

/// A named collection of program sources and include modules.
pub struct ShaderLibrary {
    programs: Vec<(&'static str, &'static str)>,
    modules: Vec<(&'static str, &'static str)>,
}

impl ShaderLibrary {
    /// The engine's built-in programs and modules.
    pub fn standard() -> Self {
        Self {
            programs: vec![
                ("phong", PHONG_GLSL),
                ("flat", FLAT_GLSL),
                (FALLBACK_SHADER, FALLBACK_GLSL),
                (PICKING_SHADER, PICKING_GLSL),
                (SHADOW_SHADER, SHADOW_GLSL),
                (SCREEN_QUAD_SHADER, SCREEN_QUAD_GLSL),
            ],
            modules: vec![
                ("lib/common.glsl", COMMON_GLSL),
                ("lib/lighting.glsl", LIGHTING_GLSL),
                ("lib/shadows.glsl", SHADOWS_GLSL),
            ],
        }
    }

    pub fn programs(&self) -> &[(&'static str, &'static str)] {
        &self.programs
    }

    pub fn modules(&self) -> &[(&'static str, &'static str)] {
        &self.modules
    }
}
