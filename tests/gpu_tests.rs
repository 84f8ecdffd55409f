//! Backend integration tests.
//!
//! The same scenes are rendered through every available backend and read
//! back pixel by pixel. The headless backend runs with GLSL validation on,
//! so these tests also cover the standard shader library.
//!
//! ```bash
//! cargo test --test gpu_tests
//! cargo test --test gpu_tests --features wgpu-backend
//! ```

mod common;

use rstest::rstest;

use common::{init_logging, Backend};
use forward_renderer::backend::ClearRequest;
use forward_renderer::prelude::*;

/// Red cube in the middle of a blue 32x32 frame.
fn render_cube<B: GraphicsBackend>(backend: B) -> RenderResult<Renderer<B>> {
    let mut renderer = Renderer::new(
        backend,
        RendererConfig::default().with_default_background(Vec4::new(0.0, 0.0, 1.0, 1.0)),
    );
    let mut store = ResourceStore::new();
    let cube = store.add_mesh(renderer.backend_mut(), Mesh::cube())?;
    let material = store.add_material(Material::flat(Vec4::new(1.0, 0.0, 0.0, 1.0)));

    let mut scene = Scene::new();
    scene.spawn("cube", Transform::default(), MeshRenderer::new(cube, material));
    scene.spawn(
        "camera",
        Transform::default(),
        CameraComponent::new(Camera::new(Vec3::new(0.0, 0.0, 3.0), Vec3::ZERO)),
    );
    scene.spawn(
        "light",
        Transform::default(),
        LightComponent::new(Light::omni(Vec3::new(0.0, 2.0, 2.0), Vec3::ONE)),
    );
    renderer.render(&mut scene, &store, &RenderOptions::default())?;
    Ok(renderer)
}

fn with_backend<F>(backend: Backend, test: F)
where
    F: FnOnce(&mut dyn FnMut(u32, u32) -> [u8; 4], FrameStats),
{
    init_logging();
    if !backend.is_available() {
        eprintln!("Backend {:?} not available, skipping", backend);
        return;
    }
    match backend {
        Backend::Headless => {
            let mut renderer = render_cube(HeadlessBackend::new(32, 32)).expect("Render failed");
            let stats = renderer.last_stats();
            test(&mut |x, y| renderer.backend_mut().read_pixel(x, y).unwrap(), stats);
        }
        Backend::WebGpu => run_wgpu(test),
    }
}

#[cfg(feature = "wgpu-backend")]
fn run_wgpu<F>(test: F)
where
    F: FnOnce(&mut dyn FnMut(u32, u32) -> [u8; 4], FrameStats),
{
    let backend = match forward_renderer::WgpuBackend::new(32, 32) {
        Ok(backend) => backend,
        Err(err) => {
            eprintln!("No wgpu adapter ({}), skipping", err);
            return;
        }
    };
    let mut renderer = render_cube(backend).expect("Render failed");
    let stats = renderer.last_stats();
    test(&mut |x, y| renderer.backend_mut().read_pixel(x, y).unwrap(), stats);
}

#[cfg(not(feature = "wgpu-backend"))]
fn run_wgpu<F>(_test: F)
where
    F: FnOnce(&mut dyn FnMut(u32, u32) -> [u8; 4], FrameStats),
{
}

fn assert_pixel(actual: [u8; 4], expected: [u8; 4]) {
    let close = actual
        .iter()
        .zip(expected.iter())
        .all(|(a, e)| (*a as i16 - *e as i16).abs() <= 2);
    assert!(close, "Pixel mismatch: got {:?}, expected {:?}", actual, expected);
}

// ============================================================================
// Render Tests
// ============================================================================

#[rstest]
#[case::headless(Backend::Headless)]
#[case::webgpu(Backend::WebGpu)]
fn test_flat_cube(#[case] backend: Backend) {
    with_backend(backend, |pixel, stats| {
        assert_eq!(stats.rendered, 1);
        assert_eq!(stats.main_draws, 1);
        assert_pixel(pixel(16, 16), [255, 0, 0, 255]);
        assert_pixel(pixel(1, 1), [0, 0, 255, 255]);
    });
}

#[test]
fn test_standard_programs_compile() {
    init_logging();
    let mut renderer = render_cube(HeadlessBackend::new(32, 32)).expect("Render failed");
    assert_eq!(renderer.cache_stats().failures, 0);

    let mut store = ResourceStore::new();
    let cube = store
        .add_mesh(renderer.backend_mut(), Mesh::cube())
        .unwrap();
    let material = store.add_material(Material::default());
    let mut scene = Scene::new();
    scene.spawn("cube", Transform::default(), MeshRenderer::new(cube, material));
    scene.spawn(
        "camera",
        Transform::default(),
        CameraComponent::new(Camera::new(Vec3::new(0.0, 1.0, 4.0), Vec3::ZERO)),
    );
    for light in [
        Light::omni(Vec3::new(0.0, 3.0, 0.0), Vec3::ONE).with_shadows(16),
        Light::spot(Vec3::new(2.0, 3.0, 0.0), Vec3::ZERO, Vec3::ONE)
            .with_attenuation(1.0, 10.0)
            .with_shadows(16),
        Light::directional(Vec3::new(0.0, 5.0, 5.0), Vec3::ZERO, Vec3::ONE).with_hard_shadows(true),
    ] {
        scene.spawn("light", Transform::default(), LightComponent::new(light));
    }
    let options = RenderOptions::default()
        .with_clipping_plane(Vec4::new(0.0, 1.0, 0.0, -5.0));
    let stats = renderer.render(&mut scene, &store, &options).unwrap();
    assert_eq!(stats.main_draws, 3);
    assert!(stats.shadow_draws > 0);
    assert_eq!(renderer.cache_stats().failures, 0);

    let mut camera = Camera::new(Vec3::new(0.0, 0.0, 4.0), Vec3::ZERO);
    let picked = renderer
        .pick_instance_at(&mut scene, &store, &mut camera, 16, 16)
        .unwrap();
    assert!(picked.is_some());
    assert_eq!(renderer.cache_stats().failures, 0);
}

#[rstest]
#[case::headless(Backend::Headless)]
#[case::webgpu(Backend::WebGpu)]
fn test_scissored_clear(#[case] backend: Backend) {
    with_backend(backend, |pixel, _| {
        // The frame clear covers the whole surface.
        assert_pixel(pixel(31, 31), [0, 0, 255, 255]);
    });

    if backend == Backend::Headless {
        let mut backend = HeadlessBackend::new(8, 8);
        backend.set_scissor(Some(Viewport::new(0, 0, 4, 8)));
        backend
            .clear(&ClearRequest {
                color: Some(Vec4::ONE),
                depth: Some(1.0),
            })
            .unwrap();
        assert_pixel(backend.read_pixel(1, 1).unwrap(), [255, 255, 255, 255]);
        assert_pixel(backend.read_pixel(6, 1).unwrap(), [0, 0, 0, 0]);
    }
}
