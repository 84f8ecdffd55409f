//! Material definitions

use std::collections::BTreeMap;

use glam::{Vec3, Vec4};

use crate::backend::{BlendState, InputName, UniformValue};
use crate::pipeline::inputs::{names, ShaderInputs};
use crate::resources::{ResourceManager, TextureId};
use crate::shader::ShaderMacro;

/// How a material combines with what is already on screen.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BlendMode {
    #[default]
    Opaque,
    Alpha,
    Additive,
}

impl BlendMode {
    pub fn state(&self) -> Option<BlendState> {
        match self {
            BlendMode::Opaque => None,
            BlendMode::Alpha => Some(BlendState::alpha_blending()),
            BlendMode::Additive => Some(BlendState::additive()),
        }
    }
}

/// Surface description shared by any number of instances.
#[derive(Debug, Clone)]
pub struct Material {
    pub name: String,
    /// Base shader program name.
    pub shader: String,
    pub color: Vec4,
    /// Multiplies `color.w`; zero hides every instance using the material.
    pub opacity: f32,
    pub specular: Vec3,
    pub glossiness: f32,
    pub emissive: Vec3,
    /// Sampler name to texture.
    pub textures: BTreeMap<InputName, TextureId>,
    pub blend: BlendMode,
    /// Discard fragments with alpha below this value.
    pub alpha_test: Option<f32>,
    /// Run the alpha test in the shadow pass too.
    pub alpha_tested_shadows: bool,
    pub two_sided: bool,
    pub ignore_lights: bool,
    pub use_diffuse: bool,
    pub use_specular: bool,
    /// Extra material-scope macros, uniforms and samplers.
    pub inputs: ShaderInputs,
}

impl Default for Material {
    fn default() -> Self {
        Self {
            name: "default".to_string(),
            shader: "phong".to_string(),
            color: Vec4::ONE,
            opacity: 1.0,
            specular: Vec3::splat(0.5),
            glossiness: 32.0,
            emissive: Vec3::ZERO,
            textures: BTreeMap::new(),
            blend: BlendMode::Opaque,
            alpha_test: None,
            alpha_tested_shadows: false,
            two_sided: false,
            ignore_lights: false,
            use_diffuse: true,
            use_specular: true,
            inputs: ShaderInputs::default(),
        }
    }
}

impl Material {
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            ..Default::default()
        }
    }

    /// Unlit material drawn with the `flat` program.
    pub fn flat(color: Vec4) -> Self {
        Self {
            name: "flat".to_string(),
            shader: "flat".to_string(),
            color,
            ignore_lights: true,
            ..Default::default()
        }
    }

    pub fn with_shader(mut self, shader: &str) -> Self {
        self.shader = shader.to_string();
        self
    }

    pub fn with_color(mut self, color: Vec4) -> Self {
        self.color = color;
        self
    }

    pub fn with_opacity(mut self, opacity: f32) -> Self {
        self.opacity = opacity;
        self
    }

    pub fn with_specular(mut self, specular: Vec3, glossiness: f32) -> Self {
        self.specular = specular;
        self.glossiness = glossiness;
        self
    }

    pub fn with_emissive(mut self, emissive: Vec3) -> Self {
        self.emissive = emissive;
        self
    }

    pub fn with_texture(mut self, sampler: &'static str, texture: TextureId) -> Self {
        self.textures.insert(InputName::Borrowed(sampler), texture);
        self
    }

    pub fn with_blend(mut self, blend: BlendMode) -> Self {
        self.blend = blend;
        self
    }

    pub fn with_alpha_test(mut self, cutoff: f32, in_shadows: bool) -> Self {
        self.alpha_test = Some(cutoff);
        self.alpha_tested_shadows = in_shadows;
        self
    }

    pub fn with_ignore_lights(mut self, ignore: bool) -> Self {
        self.ignore_lights = ignore;
        self
    }

    /// Blended materials and partially opaque ones go to the transparent
    /// bucket.
    pub fn is_transparent(&self) -> bool {
        self.blend != BlendMode::Opaque || self.opacity < 1.0
    }

    /// A fully transparent material draws nothing.
    pub fn is_invisible(&self) -> bool {
        self.opacity <= 0.0
    }

    /// Color with opacity folded into alpha.
    pub fn effective_color(&self) -> Vec4 {
        let mut color = self.color;
        color.w *= self.opacity;
        color
    }

    /// Write the material scope into `out`, which is reset first.
    ///
    /// Textures that are not loaded yet are left unbound and their macro
    /// is not set, so the surface falls back to the flat material color.
    pub fn write_inputs(&self, resources: &dyn ResourceManager, out: &mut ShaderInputs) {
        out.reset();
        out.merge_from(&self.inputs);
        out.set_uniform(names::MATERIAL_COLOR, self.effective_color());
        out.set_uniform(names::SPECULAR, self.specular.extend(self.glossiness));
        out.set_uniform(names::EMISSIVE, self.emissive.extend(0.0));
        if let Some(cutoff) = self.alpha_test {
            out.set_uniform(names::ALPHA_CUTOFF, UniformValue::Float(cutoff));
            out.macros.set_flag(ShaderMacro::AlphaTest);
        }
        for (sampler, texture) in &self.textures {
            match resources.get_texture(*texture) {
                Some(handle) => {
                    out.samplers.insert(sampler.clone(), handle);
                    if sampler == names::COLOR_TEXTURE {
                        out.macros.set_flag(ShaderMacro::ColorTexture);
                    }
                }
                None => log::trace!("Texture {:?} for '{}' not ready", texture, self.name),
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::ResourceStore;

    #[test]
    fn opacity_folds_into_alpha() {
        let material = Material::new("glass")
            .with_color(Vec4::new(1.0, 1.0, 1.0, 0.5))
            .with_opacity(0.5);
        assert_eq!(material.effective_color().w, 0.25);
        assert!(!material.is_invisible());
        assert!(material.with_opacity(0.0).is_invisible());
    }

    #[test]
    fn partial_opacity_is_transparent() {
        assert!(!Material::default().is_transparent());
        assert!(Material::default().with_opacity(0.5).is_transparent());
        assert!(Material::default().with_blend(BlendMode::Additive).is_transparent());
    }

    #[test]
    fn missing_texture_leaves_sampler_unbound() {
        let store = ResourceStore::new();
        let material = Material::new("textured").with_texture(names::COLOR_TEXTURE, TextureId(42));
        let mut inputs = ShaderInputs::default();
        material.write_inputs(&store, &mut inputs);
        assert!(inputs.samplers.is_empty());
        assert!(!inputs.macros.contains(&ShaderMacro::ColorTexture));
        assert!(inputs.uniforms.contains_key(names::MATERIAL_COLOR));
    }

    #[test]
    fn alpha_test_sets_cutoff_and_macro() {
        let store = ResourceStore::new();
        let material = Material::new("leaves").with_alpha_test(0.3, true);
        let mut inputs = ShaderInputs::default();
        material.write_inputs(&store, &mut inputs);
        assert!(inputs.macros.contains(&ShaderMacro::AlphaTest));
        assert_eq!(
            inputs.uniforms.get(names::ALPHA_CUTOFF),
            Some(&UniformValue::Float(0.3))
        );
    }
}
