//! Shader inputs contributed by one scope (scene, node, material, instance or light).
//!
//! Scopes are merged per draw with the closest one winning:
//! instance > material > node > scene. Uniform and sampler maps are passed
//! to the backend as ordered layers instead of being copied into one map;
//! macros are merged into a scratch [`MacroSet`] that is reset before every
//! use.

use glam::Vec4;

use crate::backend::{InputName, SamplerMap, TextureHandle, UniformMap, UniformValue};
use crate::shader::{MacroSet, ShaderMacro};

/// Uniform and sampler names understood by the built-in programs.
pub mod names {
    pub const MODEL: &str = "u_model";
    pub const NORMAL_MATRIX: &str = "u_normal_matrix";
    pub const VIEW_PROJECTION: &str = "u_viewprojection";
    pub const MVP: &str = "u_mvp";
    pub const CAMERA_POSITION: &str = "u_camera_position";
    pub const AMBIENT_LIGHT: &str = "u_ambient_light";
    pub const CLIPPING_PLANE: &str = "u_clipping_plane";

    pub const MATERIAL_COLOR: &str = "u_material_color";
    pub const SPECULAR: &str = "u_specular";
    pub const EMISSIVE: &str = "u_emissive";
    pub const ALPHA_CUTOFF: &str = "u_alpha_cutoff";

    pub const LIGHT_MATRIX: &str = "u_light_matrix";
    pub const LIGHT_POSITION: &str = "u_light_position";
    pub const LIGHT_FRONT: &str = "u_light_front";
    pub const LIGHT_COLOR: &str = "u_light_color";
    pub const LIGHT_ATTENUATION: &str = "u_light_att";
    pub const LIGHT_ANGLE: &str = "u_light_angle";
    pub const SHADOW_PARAMS: &str = "u_shadow_params";

    pub const PICKING_COLOR: &str = "u_color";

    pub const COLOR_TEXTURE: &str = "u_color_texture";
    pub const SHADOW_MAP: &str = "u_shadowmap";
    pub const SHADOW_MAP_CUBE: &str = "u_shadowmap_cube";
    pub const LIGHT_TEXTURE: &str = "u_light_texture";
}

/// Macros, uniforms and samplers of one scope.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ShaderInputs {
    pub macros: MacroSet,
    pub uniforms: UniformMap,
    pub samplers: SamplerMap,
}

impl ShaderInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_macro(mut self, name: impl Into<ShaderMacro>) -> Self {
        self.macros.set_flag(name);
        self
    }

    pub fn with_uniform(mut self, name: impl Into<InputName>, value: impl Into<UniformValue>) -> Self {
        self.uniforms.insert(name.into(), value.into());
        self
    }

    pub fn set_uniform(&mut self, name: impl Into<InputName>, value: impl Into<UniformValue>) {
        self.uniforms.insert(name.into(), value.into());
    }

    pub fn set_sampler(&mut self, name: impl Into<InputName>, texture: TextureHandle) {
        self.samplers.insert(name.into(), texture);
    }

    pub fn is_empty(&self) -> bool {
        self.macros.is_empty() && self.uniforms.is_empty() && self.samplers.is_empty()
    }

    /// Empty every map, keeping their allocations where the map type allows.
    pub fn reset(&mut self) {
        self.macros.clear();
        self.uniforms.clear();
        self.samplers.clear();
    }

    /// Copy `other` on top of `self`; keys of `other` win.
    pub fn merge_from(&mut self, other: &ShaderInputs) {
        self.macros.merge_from(&other.macros);
        for (name, value) in &other.uniforms {
            self.uniforms.insert(name.clone(), *value);
        }
        for (name, texture) in &other.samplers {
            self.samplers.insert(name.clone(), *texture);
        }
    }

    pub fn uniform_vec4(&self, name: &str) -> Option<Vec4> {
        self.uniforms.get(name).and_then(UniformValue::as_vec4)
    }
}
