//! Offscreen rendering example.
//!
//! Renders a small lit scene with shadows and writes the frame to a PNG.
//!
//! # Usage
//!
//! ```bash
//! # CPU rasterizer
//! cargo run --example offscreen -- headless frame.png
//!
//! # GPU backend
//! cargo run --example offscreen --features wgpu-backend -- wgpu frame.png
//! ```

use std::env;
use std::error::Error;

use forward_renderer::pipeline::{names, reference_fragment};
use forward_renderer::prelude::*;

const WIDTH: u32 = 640;
const HEIGHT: u32 = 480;

/// Floor, two cubes and a sphere under a shadowed spot light and a blue fill light.
fn build_scene<B: GraphicsBackend>(
    backend: &mut B,
    store: &mut ResourceStore,
) -> Result<Scene, Box<dyn Error>> {
    let floor = store.add_mesh(backend, Mesh::plane(12.0, 12.0, 4))?;
    let cube = store.add_mesh(backend, Mesh::cube())?;
    let sphere = store.add_mesh(backend, Mesh::sphere(32, 16))?;
    let checker = store.add_texture(
        backend,
        &TextureData::checkerboard(64, [200, 200, 200, 255], [90, 90, 90, 255]),
    )?;

    let ground = store.add_material(Material::new("ground").with_texture(names::COLOR_TEXTURE, checker));
    let red = store.add_material(
        Material::new("red")
            .with_color(Vec4::new(0.8, 0.15, 0.1, 1.0))
            .with_specular(Vec3::splat(0.6), 48.0),
    );
    let glass = store.add_material(
        Material::new("glass")
            .with_color(Vec4::new(0.3, 0.6, 1.0, 1.0))
            .with_opacity(0.5)
            .with_blend(BlendMode::Alpha),
    );

    let mut scene = Scene::new();
    scene.settings.background = Some(Vec4::new(0.05, 0.06, 0.09, 1.0));
    scene.settings.ambient_light = Vec3::splat(0.15);

    scene.spawn("floor", Transform::default(), MeshRenderer::new(floor, ground));
    scene.spawn(
        "red cube",
        Transform::from_position(Vec3::new(-1.2, 0.5, 0.0))
            .with_rotation(Quat::from_rotation_y(0.6)),
        MeshRenderer::new(cube, red),
    );
    scene.spawn(
        "tall cube",
        Transform::from_position_scale(Vec3::new(1.5, 1.0, -1.0), Vec3::new(0.8, 2.0, 0.8)),
        MeshRenderer::new(cube, red),
    );
    scene.spawn(
        "glass sphere",
        Transform::from_position(Vec3::new(0.3, 0.6, 1.4)),
        MeshRenderer::new(sphere, glass),
    );

    scene.spawn(
        "key light",
        Transform::default(),
        LightComponent::new(
            Light::spot(Vec3::new(3.0, 6.0, 4.0), Vec3::ZERO, Vec3::new(1.0, 0.95, 0.85))
                .with_cone(25.0, 40.0)
                .with_attenuation(2.0, 20.0)
                .with_shadows(1024),
        ),
    );
    scene.spawn(
        "fill light",
        Transform::default(),
        LightComponent::new(
            Light::omni(Vec3::new(-4.0, 3.0, -2.0), Vec3::new(0.3, 0.4, 0.8)).with_intensity(0.5),
        ),
    );
    scene.spawn(
        "camera",
        Transform::default(),
        CameraComponent::new(Camera::new(Vec3::new(4.0, 4.0, 7.0), Vec3::new(0.0, 0.5, 0.0))),
    );
    Ok(scene)
}

fn render_with<B: GraphicsBackend>(mut backend: B) -> Result<Renderer<B>, Box<dyn Error>> {
    let config = RendererConfig::default();
    let mut store = ResourceStore::new().with_wireframe_indices(config.build_wireframe_indices);
    let mut scene = build_scene(&mut backend, &mut store)?;
    let mut renderer = Renderer::new(backend, config);
    let stats = renderer.render(&mut scene, &store, &RenderOptions::default())?;
    log::info!(
        "Rendered {} instances with {} draws and {} shadow draws ({} programs compiled)",
        stats.rendered,
        stats.main_draws,
        stats.shadow_draws,
        renderer.cache_stats().compiled
    );
    Ok(renderer)
}

fn main() -> Result<(), Box<dyn Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let mut args = env::args().skip(1);
    let backend = args.next().unwrap_or_else(|| "headless".to_string());
    let output = args.next().unwrap_or_else(|| "offscreen.png".to_string());

    let image = match backend.as_str() {
        "headless" => {
            let backend = HeadlessBackend::new(WIDTH, HEIGHT).with_fragment_shader(reference_fragment());
            render_with(backend)?.backend().capture_surface()
        }
        #[cfg(feature = "wgpu-backend")]
        "wgpu" => {
            let backend = forward_renderer::WgpuBackend::new(WIDTH, HEIGHT)?;
            render_with(backend)?.backend_mut().capture_surface()?
        }
        other => return Err(format!("Unknown backend '{}'", other).into()),
    };

    image.save(&output)?;
    log::info!("Wrote {}", output);
    Ok(())
}
