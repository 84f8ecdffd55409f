//! Light pass controller
//!
//! Lights are applied one draw per (instance, light) pair. The first pass
//! of an instance uses the instance's own pipeline state; every later pass
//! adds onto it with additive blending, a less-or-equal depth test and depth
//! writes off. Ambient and emissive terms are only applied by the first pass.
//!
//! [`reference_fragment`] evaluates the `phong` program on the CPU for the
//! headless backend, using the same terms as `shaders/phong.glsl`.

use glam::{Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};

use crate::backend::{
    default_fragment, BlendState, CompareFunction, FragmentInput, FragmentShader, PipelineState,
    SamplerMap, UniformMap, UniformValue,
};
use crate::config::RenderOptions;
use crate::pipeline::inputs::names;
use crate::pipeline::instance::RenderInstance;
use crate::pipeline::shadows::ShadowMaps;
use crate::resources::{Material, ResourceManager};
use crate::scene::{Light, LightKind};
use crate::shader::{MacroSet, ShaderMacro};

/// Per-light data computed once per frame.
#[derive(Debug, Clone)]
pub struct PreparedLight {
    pub light: Light,
    /// View-projection of the light camera; identity for omni lights.
    pub view_projection: Mat4,
    pub uniforms: UniformMap,
    pub samplers: SamplerMap,
    shadow: Option<ShadowBinding>,
    projective: bool,
}

#[derive(Debug, Clone, Copy)]
struct ShadowBinding {
    cube: bool,
    hard: bool,
}

impl PreparedLight {
    pub fn has_shadow_map(&self) -> bool {
        self.shadow.is_some()
    }
}

/// Per-frame light bookkeeping for the main passes.
#[derive(Debug, Default)]
pub struct LightPassController {
    prepared: Vec<PreparedLight>,
    max_lights: usize,
    lights_disabled: bool,
}

impl LightPassController {
    pub fn new(max_lights: usize) -> Self {
        Self {
            prepared: Vec::new(),
            max_lights,
            lights_disabled: false,
        }
    }

    pub fn prepared(&self) -> &[PreparedLight] {
        &self.prepared
    }

    /// Build the per-light uniforms and bindings for this frame.
    ///
    /// Shadow maps must already be rendered; a light only samples its map
    /// when the map is ready.
    pub fn prepare(
        &mut self,
        lights: &[Light],
        shadows: &ShadowMaps,
        resources: &dyn ResourceManager,
        options: &RenderOptions,
    ) {
        self.prepared.clear();
        self.lights_disabled = options.lights_disabled;
        if options.lights_disabled {
            return;
        }

        for light in lights.iter().filter(|l| l.enabled) {
            let front = light.front();
            let ready_map = shadows
                .shadow_map(light.id)
                .filter(|_| options.shadows_active());
            // A map frozen by `update_shadowmaps = false` is sampled with the
            // matrix it was rendered with.
            let view_projection = match (light.kind, ready_map) {
                (LightKind::Omni, _) => Mat4::IDENTITY,
                (_, Some(map)) => map.view_projection,
                _ => light.camera().view_projection(),
            };

            let mut uniforms = UniformMap::new();
            uniforms.insert(names::LIGHT_POSITION.into(), light.position.extend(1.0).into());
            uniforms.insert(names::LIGHT_FRONT.into(), front.extend(0.0).into());
            uniforms.insert(
                names::LIGHT_COLOR.into(),
                (light.color * light.intensity).extend(1.0).into(),
            );
            uniforms.insert(
                names::LIGHT_ATTENUATION.into(),
                Vec4::new(light.attenuation_start, light.attenuation_end, 0.0, 0.0).into(),
            );
            uniforms.insert(
                names::LIGHT_ANGLE.into(),
                Vec4::new(light.angle_inner.cos(), light.angle_outer.cos(), 0.0, 0.0).into(),
            );

            let mut samplers = SamplerMap::new();
            let shadow = ready_map.map(|map| {
                let sampler = if map.cube {
                    names::SHADOW_MAP_CUBE
                } else {
                    names::SHADOW_MAP
                };
                samplers.insert(sampler.into(), map.color);
                uniforms.insert(names::SHADOW_PARAMS.into(), map.params().into());
                ShadowBinding {
                    cube: map.cube,
                    hard: light.hard_shadows,
                }
            });

            let projective = match light.projective_texture {
                Some(id) if light.kind != LightKind::Omni => match resources.get_texture(id) {
                    Some(texture) => {
                        samplers.insert(names::LIGHT_TEXTURE.into(), texture);
                        true
                    }
                    None => false,
                },
                _ => false,
            };

            self.prepared.push(PreparedLight {
                light: light.clone(),
                view_projection,
                uniforms,
                samplers,
                shadow,
                projective,
            });
        }
        log::trace!("Prepared {} lights", self.prepared.len());
    }

    /// Indices of the prepared lights that reach `instance`, capped at the
    /// configured maximum.
    ///
    /// Empty when the instance ignores lights or lighting is disabled; the
    /// caller then issues a single ambient-only pass.
    pub fn lights_for_instance(&self, instance: &RenderInstance, out: &mut Vec<usize>) {
        out.clear();
        if self.lights_disabled || instance.flags.ignore_lights || instance.material.ignore_lights {
            return;
        }
        let sphere = instance.bounding_sphere();
        out.extend(
            self.prepared
                .iter()
                .enumerate()
                .filter(|(_, p)| p.light.overlaps(&sphere))
                .map(|(i, _)| i)
                .take(self.max_lights),
        );
    }

    /// Light macros for one pass. `light` is an index from
    /// [`lights_for_instance`](Self::lights_for_instance).
    pub fn get_macros(&self, instance: &RenderInstance, light: usize, out: &mut MacroSet) {
        let Some(prepared) = self.prepared.get(light) else {
            return;
        };
        let l = &prepared.light;
        let material: &Material = &instance.material;
        out.set_flag(match l.kind {
            LightKind::Omni => ShaderMacro::LightOmni,
            LightKind::Spot => ShaderMacro::LightSpot,
            LightKind::Directional => ShaderMacro::LightDirectional,
        });
        if l.use_diffuse && material.use_diffuse {
            out.set_flag(ShaderMacro::UseDiffuse);
        }
        if l.use_specular && material.use_specular {
            out.set_flag(ShaderMacro::UseSpecular);
        }
        if l.use_attenuation && l.kind != LightKind::Directional {
            out.set_flag(ShaderMacro::UseAttenuation);
        }
        if let Some(shadow) = prepared.shadow.filter(|_| instance.flags.receive_shadows) {
            out.set_flag(ShaderMacro::UseShadowMap);
            if shadow.cube {
                out.set_flag(ShaderMacro::ShadowCube);
            }
            if shadow.hard {
                out.set_flag(ShaderMacro::HardShadows);
            }
        }
        if prepared.projective {
            out.set_flag(ShaderMacro::UseProjectiveTexture);
        }
    }

    /// Per-frame uniforms and samplers of a light, plus the light-space
    /// matrix of `instance` written into `per_draw`.
    pub fn get_uniforms<'a>(
        &'a self,
        instance: &RenderInstance,
        light: usize,
        per_draw: &mut UniformMap,
    ) -> Option<(&'a UniformMap, &'a SamplerMap)> {
        let prepared = self.prepared.get(light)?;
        per_draw.insert(
            names::LIGHT_MATRIX.into(),
            (prepared.view_projection * instance.world_matrix()).into(),
        );
        Some((&prepared.uniforms, &prepared.samplers))
    }

    /// Pipeline state of pass `pass` given the state of the first pass.
    pub fn pass_state(pass: usize, first: &PipelineState) -> PipelineState {
        if pass == 0 {
            return *first;
        }
        PipelineState {
            blend: Some(BlendState::additive()),
            depth_compare: CompareFunction::LessEqual,
            depth_write: false,
            ..*first
        }
    }
}

/// Surface values one light is evaluated against.
#[derive(Debug, Clone, Copy)]
pub struct SurfaceSample {
    pub position: Vec3,
    pub normal: Vec3,
    pub base_color: Vec4,
    /// Specular color in rgb, glossiness in a.
    pub specular: Vec4,
    pub eye: Vec3,
}

/// Diffuse plus specular term of one light, before color and falloff.
pub fn phong_terms(surface: &SurfaceSample, l: Vec3, diffuse: bool, specular: bool) -> Vec3 {
    let n = surface.normal.normalize_or_zero();
    let v = (surface.eye - surface.position).normalize_or_zero();
    let ndotl = n.dot(l).max(0.0);
    let mut lit = Vec3::ZERO;
    if diffuse {
        lit += surface.base_color.xyz() * ndotl;
    }
    if specular && ndotl >= 0.0001 {
        let r = reflect(-l, n);
        lit += surface.specular.xyz() * r.dot(v).max(0.0).powf(surface.specular.w.max(1.0));
    }
    lit
}

/// Linear falloff between `start` and `end`.
pub fn attenuation(distance: f32, start: f32, end: f32) -> f32 {
    ((end - distance) / (end - start).max(0.0001)).clamp(0.0, 1.0)
}

/// Cone falloff from the cosines of the inner and outer half-angles.
pub fn spot_factor(cos_angle: f32, cos_inner: f32, cos_outer: f32) -> f32 {
    smoothstep(cos_outer, cos_inner, cos_angle)
}

/// Unshadowed contribution of `light` at `surface`.
pub fn light_contribution(surface: &SurfaceSample, light: &Light, material: &Material) -> Vec3 {
    let l = match light.kind {
        LightKind::Directional => -light.front(),
        _ => (light.position - surface.position).normalize_or_zero(),
    };
    let lit = phong_terms(
        surface,
        l,
        light.use_diffuse && material.use_diffuse,
        light.use_specular && material.use_specular,
    );
    let mut factor = 1.0;
    if light.use_attenuation && light.kind != LightKind::Directional {
        factor *= attenuation(
            light.position.distance(surface.position),
            light.attenuation_start,
            light.attenuation_end,
        );
    }
    if light.kind == LightKind::Spot {
        factor *= spot_factor((-l).dot(light.front()), light.angle_inner.cos(), light.angle_outer.cos());
    }
    lit * light.color * light.intensity * factor
}

fn reflect(i: Vec3, n: Vec3) -> Vec3 {
    i - 2.0 * n.dot(i) * n
}

fn smoothstep(edge0: f32, edge1: f32, x: f32) -> f32 {
    let t = ((x - edge0) / (edge1 - edge0)).clamp(0.0, 1.0);
    t * t * (3.0 - 2.0 * t)
}

/// Fragment function for the headless backend that shades `phong`
/// permutations like the GLSL program does. Other programs go through the
/// built-in fragment function.
pub fn reference_fragment() -> FragmentShader {
    Box::new(|input: &FragmentInput<'_>| {
        if input.program.starts_with("phong") {
            shade_phong(input)
        } else {
            default_fragment(input)
        }
    })
}

fn vec4_uniform(input: &FragmentInput<'_>, name: &str) -> Vec4 {
    input
        .uniform(name)
        .and_then(UniformValue::as_vec4)
        .unwrap_or(Vec4::ZERO)
}

fn shade_phong(input: &FragmentInput<'_>) -> Option<Vec4> {
    let label = input.program;
    let has = |name: &str| {
        label
            .find('[')
            .map(|start| label[start + 1..].trim_end_matches(']').split(',').any(|m| m == name))
            .unwrap_or(false)
    };

    let mut base = input
        .uniform(names::MATERIAL_COLOR)
        .and_then(UniformValue::as_vec4)
        .unwrap_or(Vec4::ONE);
    if has("COLOR_TEXTURE") {
        if let Some(texel) = input.sample(names::COLOR_TEXTURE, input.uv) {
            base *= texel;
        }
    }
    if has("ALPHA_TEST") {
        let cutoff = input
            .uniform(names::ALPHA_CUTOFF)
            .and_then(UniformValue::as_float)
            .unwrap_or(0.0);
        if base.w < cutoff {
            return None;
        }
    }
    let world = input.world_position;
    if has("USE_CLIPPING_PLANE") {
        let plane = vec4_uniform(input, names::CLIPPING_PLANE);
        if world.dot(plane.xyz()) < plane.w {
            return None;
        }
    }

    let mut color = vec4_uniform(input, names::AMBIENT_LIGHT).xyz() * base.xyz()
        + vec4_uniform(input, names::EMISSIVE).xyz();

    let directional = has("LIGHT_DIRECTIONAL");
    if directional || has("LIGHT_OMNI") || has("LIGHT_SPOT") {
        let light_position = vec4_uniform(input, names::LIGHT_POSITION).xyz();
        let front = vec4_uniform(input, names::LIGHT_FRONT).xyz().normalize_or_zero();
        let l = if directional {
            -front
        } else {
            (light_position - world).normalize_or_zero()
        };
        let normal = if input.front_facing {
            input.normal
        } else {
            -input.normal
        };
        let surface = SurfaceSample {
            position: world,
            normal,
            base_color: base,
            specular: vec4_uniform(input, names::SPECULAR),
            eye: vec4_uniform(input, names::CAMERA_POSITION).xyz(),
        };
        let mut lit = phong_terms(&surface, l, has("USE_DIFFUSE"), has("USE_SPECULAR"));

        if has("USE_PROJECTIVE_TEXTURE") {
            if let Some(coord) = light_space(input) {
                let uv = Vec2::new(coord.x * 0.5 + 0.5, 0.5 - coord.y * 0.5);
                if let Some(texel) = input.sample(names::LIGHT_TEXTURE, uv) {
                    lit *= texel.xyz();
                }
            }
        }

        let mut factor = 1.0;
        if has("USE_ATTENUATION") {
            let att = vec4_uniform(input, names::LIGHT_ATTENUATION);
            factor *= attenuation(light_position.distance(world), att.x, att.y);
        }
        if has("LIGHT_SPOT") {
            let angle = vec4_uniform(input, names::LIGHT_ANGLE);
            factor *= spot_factor((-l).dot(front), angle.x, angle.y);
        }
        if has("USE_SHADOW_MAP") {
            factor *= shadow_factor(input, light_position, has("SHADOW_CUBE"), has("HARD_SHADOWS"));
        }
        color += lit * vec4_uniform(input, names::LIGHT_COLOR).xyz() * factor;
    }

    Some(color.extend(base.w))
}

/// Normalized device coordinates of the fragment as seen by the light.
fn light_space(input: &FragmentInput<'_>) -> Option<Vec3> {
    let light_matrix = input.uniform(names::LIGHT_MATRIX)?.as_mat4()?;
    let model = input
        .uniform(names::MODEL)
        .and_then(UniformValue::as_mat4)
        .unwrap_or(Mat4::IDENTITY);
    let local = model.inverse().transform_point3(input.world_position);
    let clip = light_matrix * local.extend(1.0);
    (clip.w.abs() > f32::EPSILON).then(|| clip.xyz() / clip.w)
}

fn shadow_factor(input: &FragmentInput<'_>, light_position: Vec3, cube: bool, hard: bool) -> f32 {
    let params = vec4_uniform(input, names::SHADOW_PARAMS);
    let lit = |stored: Option<Vec4>, current: f32| match stored {
        Some(texel) if texel.x < current - params.x => 0.0,
        _ => 1.0,
    };
    if cube {
        let d = input.world_position - light_position;
        let current = (d.length() - params.y) / (params.z - params.y).max(f32::EPSILON);
        return lit(input.sample_cube(names::SHADOW_MAP_CUBE, d), current);
    }
    let Some(coord) = light_space(input) else {
        return 1.0;
    };
    let uv = Vec2::new(coord.x * 0.5 + 0.5, 0.5 - coord.y * 0.5);
    if uv.cmplt(Vec2::ZERO).any() || uv.cmpgt(Vec2::ONE).any() {
        return 1.0;
    }
    if hard {
        return lit(input.sample(names::SHADOW_MAP, uv), coord.z);
    }
    let texel = 1.0 / params.w.max(1.0);
    let mut sum = 0.0;
    for x in -1..=1 {
        for y in -1..=1 {
            let offset = Vec2::new(x as f32, y as f32) * texel;
            sum += lit(input.sample(names::SHADOW_MAP, uv + offset), coord.z);
        }
    }
    sum / 9.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{BufferHandle, GeometryRef, PrimitiveTopology};
    use crate::pipeline::bounds::Aabb;
    use crate::pipeline::instance::InstanceId;
    use std::sync::Arc;

    fn instance_at(position: Vec3) -> RenderInstance {
        let geometry = GeometryRef {
            vertex_buffer: BufferHandle(1),
            vertex_count: 3,
            index_buffer: None,
            index_count: 0,
            topology: PrimitiveTopology::TriangleList,
            range: None,
        };
        RenderInstance::new(
            InstanceId::next(),
            geometry,
            Aabb::new(Vec3::splat(-0.5), Vec3::splat(0.5)),
            Arc::new(Material::default()),
        )
        .with_world_matrix(Mat4::from_translation(position))
    }

    fn prepared(lights: &[Light], options: &RenderOptions) -> LightPassController {
        let mut controller = LightPassController::new(8);
        controller.prepare(
            lights,
            &ShadowMaps::new(0.0001),
            &crate::resources::ResourceStore::new(),
            options,
        );
        controller
    }

    #[test]
    fn distant_lights_are_skipped() {
        let near = Light::omni(Vec3::new(1.0, 0.0, 0.0), Vec3::ONE).with_attenuation(0.0, 3.0);
        let far = Light::omni(Vec3::new(50.0, 0.0, 0.0), Vec3::ONE).with_attenuation(0.0, 3.0);
        let sun = Light::directional(Vec3::Y, Vec3::ZERO, Vec3::ONE);
        let controller = prepared(&[near, far, sun], &RenderOptions::default());
        let mut out = Vec::new();
        controller.lights_for_instance(&instance_at(Vec3::ZERO), &mut out);
        assert_eq!(out, vec![0, 2]);
    }

    #[test]
    fn ignoring_instances_and_disabled_lighting_get_no_lights() {
        let sun = Light::directional(Vec3::Y, Vec3::ZERO, Vec3::ONE);
        let controller = prepared(&[sun.clone()], &RenderOptions::default());
        let mut instance = instance_at(Vec3::ZERO);
        instance.flags.ignore_lights = true;
        let mut out = Vec::new();
        controller.lights_for_instance(&instance, &mut out);
        assert!(out.is_empty());

        let options = RenderOptions {
            lights_disabled: true,
            ..RenderOptions::default()
        };
        let controller = prepared(&[sun], &options);
        controller.lights_for_instance(&instance_at(Vec3::ZERO), &mut out);
        assert!(out.is_empty());
    }

    #[test]
    fn light_count_is_capped() {
        let lights: Vec<Light> = (0..5)
            .map(|_| Light::directional(Vec3::Y, Vec3::ZERO, Vec3::ONE))
            .collect();
        let mut controller = LightPassController::new(2);
        controller.prepare(
            &lights,
            &ShadowMaps::new(0.0001),
            &crate::resources::ResourceStore::new(),
            &RenderOptions::default(),
        );
        let mut out = Vec::new();
        controller.lights_for_instance(&instance_at(Vec3::ZERO), &mut out);
        assert_eq!(out.len(), 2);
    }

    #[test]
    fn macros_follow_light_and_shadow_availability() {
        let spot = Light::spot(Vec3::Y, Vec3::ZERO, Vec3::ONE)
            .with_attenuation(0.0, 10.0)
            .with_specular(false)
            .with_shadows(64);
        let controller = prepared(&[spot], &RenderOptions::default());
        let mut macros = MacroSet::new();
        controller.get_macros(&instance_at(Vec3::ZERO), 0, &mut macros);
        assert!(macros.contains(&ShaderMacro::LightSpot));
        assert!(macros.contains(&ShaderMacro::UseDiffuse));
        assert!(macros.contains(&ShaderMacro::UseAttenuation));
        assert!(!macros.contains(&ShaderMacro::UseSpecular));
        // the map was never rendered, so it is not sampled
        assert!(!macros.contains(&ShaderMacro::UseShadowMap));
    }

    #[test]
    fn light_matrix_includes_instance_transform() {
        let sun = Light::directional(Vec3::new(0.0, 10.0, 0.0), Vec3::ZERO, Vec3::ONE);
        let controller = prepared(&[sun], &RenderOptions::default());
        let instance = instance_at(Vec3::new(2.0, 0.0, 0.0));
        let mut per_draw = UniformMap::new();
        let (uniforms, _) = controller.get_uniforms(&instance, 0, &mut per_draw).unwrap();
        assert!(uniforms.contains_key(names::LIGHT_COLOR));
        let matrix = per_draw.get(names::LIGHT_MATRIX).and_then(UniformValue::as_mat4).unwrap();
        let expected = controller.prepared()[0].view_projection * instance.world_matrix();
        assert_eq!(matrix, expected);
    }

    #[test]
    fn later_passes_add_without_writing_depth() {
        let first = PipelineState::baseline();
        assert_eq!(LightPassController::pass_state(0, &first), first);
        let second = LightPassController::pass_state(1, &first);
        assert_eq!(second.blend, Some(BlendState::additive()));
        assert_eq!(second.depth_compare, CompareFunction::LessEqual);
        assert!(!second.depth_write);
        assert_eq!(second.cull_mode, first.cull_mode);
    }

    #[test]
    fn spot_cone_fades_between_angles() {
        let inner = 0.2f32;
        let outer = 0.4f32;
        assert_eq!(spot_factor(1.0, inner.cos(), outer.cos()), 1.0);
        assert_eq!(spot_factor(0.5f32.cos(), inner.cos(), outer.cos()), 0.0);
        let mid = spot_factor(0.3f32.cos(), inner.cos(), outer.cos());
        assert!(mid > 0.0 && mid < 1.0);
    }
}
