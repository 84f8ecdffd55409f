//! Lighting and shadow integration tests.
//!
//! Pixel expectations are computed with [`light_contribution`], the CPU
//! counterpart of the phong program.

mod common;

use rstest::rstest;

use common::{assert_color_near, TestContext};
use forward_renderer::pipeline::lighting::{light_contribution, SurfaceSample};
use forward_renderer::prelude::*;
use forward_renderer::scene::NodeId;

/// 33x33 view straight down onto a 4x4 floor, the floor center on pixel (16, 16).
fn floor_context(material: Material) -> TestContext {
    let mut ctx = TestContext::new(33, 33);
    let floor = ctx.add_mesh(Mesh::plane(4.0, 4.0, 1));
    let material = ctx.add_material(material);
    ctx.scene
        .spawn("floor", Transform::default(), MeshRenderer::new(floor, material));
    ctx.add_camera_with(Camera::new(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO).with_up(Vec3::Z));
    ctx
}

fn grey_diffuse() -> Material {
    let mut material = Material::default().with_color(Vec4::new(0.5, 0.5, 0.5, 1.0));
    material.use_specular = false;
    material
}

fn floor_center(material: &Material) -> SurfaceSample {
    SurfaceSample {
        position: Vec3::ZERO,
        normal: Vec3::Y,
        base_color: material.effective_color(),
        specular: material.specular.extend(material.glossiness),
        eye: Vec3::new(0.0, 5.0, 0.0),
    }
}

// ============================================================================
// Accumulation Tests
// ============================================================================

/// Two lights on a multipass material: ambient once, plus each light.
#[test]
fn test_two_lights_accumulate() {
    let material = grey_diffuse();
    let mut ctx = floor_context(material.clone());
    let lights = [
        Light::omni(Vec3::new(-1.0, 3.0, 0.0), Vec3::ONE).with_intensity(0.3),
        Light::omni(Vec3::new(1.0, 3.0, 0.0), Vec3::ONE).with_intensity(0.3),
    ];
    for light in &lights {
        ctx.add_light(light.clone());
    }

    let stats = ctx.render(&RenderOptions::default());
    assert_eq!(stats.main_draws, 2);

    let draws = ctx.draws_of("phong");
    assert_eq!(draws.len(), 2);
    assert!(draws[0].state.blend.is_none());
    assert!(draws[1].state.blend.is_some());
    assert!(!draws[1].state.depth_write);

    let surface = floor_center(&material);
    let ambient = ctx.scene.settings.ambient_light * surface.base_color.truncate();
    let expected = lights
        .iter()
        .fold(ambient, |sum, light| sum + light_contribution(&surface, light, &material));
    assert_color_near(ctx.pixel(16, 16), expected.extend(1.0), 0.01);
}

#[test]
fn test_single_pass_program_draws_once() {
    let mut ctx = floor_context(Material::flat(Vec4::new(0.2, 0.4, 0.6, 1.0)));
    ctx.add_light(Light::omni(Vec3::new(-1.0, 3.0, 0.0), Vec3::ONE));
    ctx.add_light(Light::omni(Vec3::new(1.0, 3.0, 0.0), Vec3::ONE));

    let stats = ctx.render(&RenderOptions::default());
    assert_eq!(stats.main_draws, 1);
    assert_color_near(ctx.pixel(16, 16), Vec4::new(0.2, 0.4, 0.6, 1.0), 1e-4);
}

#[test]
fn test_no_lights_gives_ambient_pass() {
    let material = grey_diffuse();
    let mut ctx = floor_context(material.clone());

    let stats = ctx.render(&RenderOptions::default());
    assert_eq!(stats.main_draws, 1);
    let label = &ctx.draws_of("phong")[0].label;
    assert!(!label.contains("LIGHT_"));

    let expected = ctx.scene.settings.ambient_light * 0.5;
    assert_color_near(ctx.pixel(16, 16), expected.extend(1.0), 0.01);
}

#[rstest]
#[case::lights_disabled(true, false)]
#[case::material_ignores_lights(false, true)]
fn test_lights_skipped(#[case] disabled: bool, #[case] material_ignores: bool) {
    let mut ctx = floor_context(grey_diffuse().with_ignore_lights(material_ignores));
    ctx.add_light(Light::omni(Vec3::new(0.0, 3.0, 0.0), Vec3::ONE));
    ctx.add_light(Light::omni(Vec3::new(1.0, 3.0, 0.0), Vec3::ONE));

    let options = RenderOptions {
        lights_disabled: disabled,
        ..RenderOptions::default()
    };
    let stats = ctx.render(&options);
    assert_eq!(stats.main_draws, 1);
}

#[test]
fn test_light_cap_per_instance() {
    let config = RendererConfig::default().with_max_lights_per_instance(2);
    let mut ctx = TestContext::with_config(16, 16, config);
    let material = ctx.add_material(grey_diffuse());
    ctx.add_cube("cube", Vec3::ZERO, material);
    ctx.add_camera(Vec3::new(0.0, 0.0, 5.0), Vec3::ZERO);
    for x in [-2.0, 0.0, 2.0, 4.0] {
        ctx.add_light(Light::omni(Vec3::new(x, 3.0, 3.0), Vec3::ONE));
    }

    assert_eq!(ctx.render(&RenderOptions::default()).main_draws, 2);
}

#[test]
fn test_attenuated_light_out_of_reach() {
    let mut ctx = floor_context(grey_diffuse());
    ctx.add_light(Light::omni(Vec3::new(50.0, 3.0, 0.0), Vec3::ONE).with_attenuation(1.0, 5.0));

    let stats = ctx.render(&RenderOptions::default());
    assert_eq!(stats.main_draws, 1);
    assert!(!ctx.draws_of("phong")[0].label.contains("LIGHT_OMNI"));
}

#[rstest]
#[case::omni(Light::omni(Vec3::new(0.0, 3.0, 0.0), Vec3::ONE), "LIGHT_OMNI")]
#[case::spot(Light::spot(Vec3::new(0.0, 3.0, 0.0), Vec3::ZERO, Vec3::ONE), "LIGHT_SPOT")]
#[case::directional(
    Light::directional(Vec3::new(0.0, 3.0, 0.0), Vec3::ZERO, Vec3::ONE),
    "LIGHT_DIRECTIONAL"
)]
fn test_light_kind_macro(#[case] light: Light, #[case] name: &str) {
    let material = grey_diffuse();
    let mut ctx = floor_context(material.clone());
    ctx.add_light(light.clone());
    ctx.render(&RenderOptions::default());

    let label = &ctx.draws_of("phong")[0].label;
    assert!(label.contains(name), "{} lacks {}", label, name);
    assert!(label.contains("USE_DIFFUSE"));
    assert!(!label.contains("USE_SPECULAR"));

    let surface = floor_center(&material);
    let expected = ctx.scene.settings.ambient_light * 0.5 + light_contribution(&surface, &light, &material);
    assert_color_near(ctx.pixel(16, 16), expected.extend(1.0), 0.02);
}

#[test]
fn test_emissive_added_once() {
    let material = grey_diffuse().with_emissive(Vec3::new(0.2, 0.0, 0.0));
    let mut ctx = floor_context(material.clone());
    ctx.scene.settings.ambient_light = Vec3::ZERO;
    let lights = [
        Light::omni(Vec3::new(-1.0, 3.0, 0.0), Vec3::ONE).with_intensity(0.2),
        Light::omni(Vec3::new(1.0, 3.0, 0.0), Vec3::ONE).with_intensity(0.2),
    ];
    for light in &lights {
        ctx.add_light(light.clone());
    }
    ctx.render(&RenderOptions::default());

    let surface = floor_center(&material);
    let expected = lights.iter().fold(Vec3::new(0.2, 0.0, 0.0), |sum, light| {
        sum + light_contribution(&surface, light, &material)
    });
    assert_color_near(ctx.pixel(16, 16), expected.extend(1.0), 0.01);
}

// ============================================================================
// Shadow Tests
// ============================================================================

/// A cube at the origin lit by `light`; returns the light's node.
fn shadow_scene(light: Light) -> (TestContext, NodeId) {
    let mut ctx = TestContext::new(32, 32);
    let material = ctx.add_material(Material::default());
    ctx.add_cube("caster", Vec3::ZERO, material);
    ctx.add_camera(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO);
    let light = ctx.add_light(light);
    (ctx, light)
}

#[rstest]
#[case::spot(Light::spot(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::ONE).with_shadows(64), false, 1)]
#[case::directional(Light::directional(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::ONE).with_shadows(64), false, 1)]
#[case::omni(Light::omni(Vec3::new(0.0, 3.0, 0.0), Vec3::ONE).with_shadows(32), true, 6)]
fn test_shadow_map_per_light_kind(#[case] light: Light, #[case] cube: bool, #[case] faces: u32) {
    let (mut ctx, light_node) = shadow_scene(light);
    let stats = ctx.render(&RenderOptions::default());

    let id = ctx.scene.component::<LightComponent>(light_node).unwrap().light.id;
    let map = ctx.renderer.shadow_maps().shadow_map(id).unwrap();
    assert_eq!(map.cube, cube);
    assert!(map.is_ready());

    // An omni light sees the caster below it from the -Y face only.
    assert!(stats.shadow_draws >= 1 && stats.shadow_draws <= faces);
    let label = &ctx.draws_of("phong")[0].label;
    assert!(label.contains("USE_SHADOW_MAP"));
    assert_eq!(label.contains("SHADOW_CUBE"), cube);
}

#[test]
fn test_shadows_disabled_skips_maps() {
    let (mut ctx, _) = shadow_scene(
        Light::spot(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::ONE).with_shadows(64),
    );
    let options = RenderOptions {
        shadows_disabled: true,
        ..RenderOptions::default()
    };
    let stats = ctx.render(&options);
    assert_eq!(stats.shadow_draws, 0);
    assert!(!ctx.draws_of("phong")[0].label.contains("USE_SHADOW_MAP"));
}

#[test]
fn test_turning_shadows_off_releases_map() {
    let (mut ctx, light_node) = shadow_scene(
        Light::spot(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::ONE).with_shadows(64),
    );
    ctx.render(&RenderOptions::default());
    assert_eq!(ctx.renderer.shadow_maps().len(), 1);

    ctx.scene
        .component_mut::<LightComponent>(light_node)
        .unwrap()
        .light
        .cast_shadows = false;
    ctx.render(&RenderOptions::default());
    assert!(ctx.renderer.shadow_maps().is_empty());
    assert_eq!(ctx.draws_of("shadow").len(), 0);
}

#[test]
fn test_frozen_shadow_maps_are_not_redrawn() {
    let (mut ctx, _) = shadow_scene(
        Light::spot(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::ONE).with_shadows(64),
    );
    assert_eq!(ctx.render(&RenderOptions::default()).shadow_draws, 1);

    let frozen = RenderOptions {
        update_shadowmaps: false,
        ..RenderOptions::default()
    };
    let stats = ctx.render(&frozen);
    assert_eq!(stats.shadow_draws, 0);
    assert!(ctx.draws_of("phong")[0].label.contains("USE_SHADOW_MAP"));
}

/// A frozen map is sampled with the light matrix it was rendered with, even
/// after the light moves.
#[test]
fn test_frozen_shadow_map_keeps_its_matrix() {
    let (mut ctx, light_node) = shadow_scene(
        Light::spot(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::ONE).with_shadows(64),
    );
    ctx.render(&RenderOptions::default());

    let light = &mut ctx.scene.component_mut::<LightComponent>(light_node).unwrap().light;
    light.position.x = 4.0;
    let moved = light.clone();
    let frozen = RenderOptions {
        update_shadowmaps: false,
        ..RenderOptions::default()
    };
    ctx.render(&frozen);

    let map = ctx.renderer.shadow_maps().shadow_map(moved.id).unwrap();
    let sampled = ctx.renderer.light_controller().prepared()[0].view_projection;
    assert_eq!(sampled, map.view_projection);
    assert_ne!(sampled, moved.camera().view_projection());

    ctx.render(&RenderOptions::default());
    let map = ctx.renderer.shadow_maps().shadow_map(moved.id).unwrap();
    assert_eq!(map.view_projection, moved.camera().view_projection());
}

#[test]
fn test_non_caster_is_not_drawn_into_map() {
    let mut ctx = TestContext::new(32, 32);
    let material = ctx.add_material(Material::default());
    let cube = ctx.cube;
    let flags = RenderFlags {
        cast_shadows: false,
        ..RenderFlags::default()
    };
    ctx.scene.spawn(
        "no shadow",
        Transform::default(),
        MeshRenderer::new(cube, material).with_flags(flags),
    );
    ctx.add_camera(Vec3::new(0.0, 2.0, 6.0), Vec3::ZERO);
    ctx.add_light(Light::spot(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::ONE).with_shadows(64));

    let stats = ctx.render(&RenderOptions::default());
    assert_eq!(stats.shadow_draws, 0);
    assert_eq!(stats.main_draws, 1);
}

/// A floor next to a caster is darker in the caster's shadow than in the open.
#[test]
fn test_caster_darkens_floor() {
    let mut ctx = TestContext::new(33, 33);
    let floor = ctx.add_mesh(Mesh::plane(8.0, 8.0, 1));
    let material = ctx.add_material(grey_diffuse());
    ctx.scene
        .spawn("floor", Transform::default(), MeshRenderer::new(floor, material));
    ctx.add_cube("caster", Vec3::new(0.0, 1.5, 0.0), material);
    let camera = Camera::new(Vec3::new(0.0, 10.0, 0.0), Vec3::ZERO).with_up(Vec3::Z);
    ctx.add_camera_with(camera.clone());
    ctx.add_light(
        Light::directional(Vec3::new(5.0, 10.0, 0.0), Vec3::ZERO, Vec3::ONE)
            .with_shadows(128)
            .with_hard_shadows(true),
    );
    ctx.render(&RenderOptions::default());

    // The light leans towards -X, so the cube shadows the floor around
    // x = -1.2 where the cube itself does not cover it.
    let mut camera = camera;
    camera.set_aspect(1.0);
    let viewport = Viewport::full((33, 33));
    let at = |camera: &mut Camera, world: Vec3| {
        let p = camera.project(world, viewport).unwrap();
        (p.x as u32, p.y as u32)
    };
    let (sx, sy) = at(&mut camera, Vec3::new(-1.2, 0.0, 0.0));
    let (ox, oy) = at(&mut camera, Vec3::new(2.5, 0.0, 0.0));
    let shadowed = ctx.pixel(sx, sy);
    let open = ctx.pixel(ox, oy);
    assert!(
        open.x > shadowed.x + 0.2,
        "open {:?} vs shadowed {:?}",
        open,
        shadowed
    );
}
