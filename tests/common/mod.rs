//! Common utilities for renderer integration tests.
//!
//! Scenes are rendered with the headless backend and the reference phong
//! fragment function, so tests can inspect both the draw log and pixels.

#![allow(dead_code)]

use forward_renderer::backend::DrawRecord;
use forward_renderer::pipeline::reference_fragment;
use forward_renderer::prelude::*;
use forward_renderer::resources::{MaterialId, MeshId};
use forward_renderer::scene::NodeId;

/// Install the test logger once; later calls are no-ops.
pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

// ============================================================================
// Backend Enumeration
// ============================================================================

/// Backends the renderer can be tested against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Backend {
    /// CPU rasterizer, always available.
    Headless,
    /// wgpu on whatever adapter the machine offers.
    WebGpu,
}

impl Backend {
    /// Check if this backend is compiled in.
    pub fn is_available(&self) -> bool {
        match self {
            Backend::Headless => true,
            #[cfg(feature = "wgpu-backend")]
            Backend::WebGpu => true,
            #[cfg(not(feature = "wgpu-backend"))]
            Backend::WebGpu => false,
        }
    }
}

// ============================================================================
// Test Context
// ============================================================================

/// Renderer, resources and scene of one test.
pub struct TestContext {
    pub renderer: Renderer<HeadlessBackend>,
    pub store: ResourceStore,
    pub scene: Scene,
    pub cube: MeshId,
}

impl TestContext {
    /// A `width` x `height` headless renderer with an empty scene and a cube mesh.
    ///
    /// GLSL parsing is off; shader validity is covered by its own tests.
    pub fn new(width: u32, height: u32) -> Self {
        Self::with_config(width, height, RendererConfig::default())
    }

    pub fn with_config(width: u32, height: u32, config: RendererConfig) -> Self {
        init_logging();
        let backend = HeadlessBackend::new(width, height)
            .with_glsl_validation(false)
            .with_fragment_shader(reference_fragment());
        let mut renderer = Renderer::new(backend, config);
        let mut store = renderer.create_resource_store();
        let cube = store
            .add_mesh(renderer.backend_mut(), Mesh::cube())
            .expect("Failed to upload cube");
        Self {
            renderer,
            store,
            scene: Scene::new(),
            cube,
        }
    }

    pub fn add_mesh(&mut self, mesh: Mesh) -> MeshId {
        self.store
            .add_mesh(self.renderer.backend_mut(), mesh)
            .expect("Failed to upload mesh")
    }

    pub fn add_material(&mut self, material: Material) -> MaterialId {
        self.store.add_material(material)
    }

    /// Unit cube at `position` drawn with `material`.
    pub fn add_cube(&mut self, name: &str, position: Vec3, material: MaterialId) -> NodeId {
        let cube = self.cube;
        self.scene.spawn(
            name,
            Transform::from_position(position),
            MeshRenderer::new(cube, material),
        )
    }

    pub fn add_camera(&mut self, eye: Vec3, center: Vec3) -> NodeId {
        self.add_camera_with(Camera::new(eye, center))
    }

    pub fn add_camera_with(&mut self, camera: Camera) -> NodeId {
        self.scene
            .spawn("camera", Transform::default(), CameraComponent::new(camera))
    }

    pub fn add_light(&mut self, light: Light) -> NodeId {
        self.scene
            .spawn("light", Transform::default(), LightComponent::new(light))
    }

    pub fn render(&mut self, options: &RenderOptions) -> FrameStats {
        self.renderer.backend_mut().clear_draw_log();
        self.renderer
            .render(&mut self.scene, &self.store, options)
            .expect("Render failed")
    }

    pub fn draws(&self) -> &[DrawRecord] {
        self.renderer.backend().draw_log()
    }

    /// Draws whose program label starts with `prefix`.
    pub fn draws_of(&self, prefix: &str) -> Vec<&DrawRecord> {
        self.draws()
            .iter()
            .filter(|d| d.label.starts_with(prefix))
            .collect()
    }

    pub fn pixel(&self, x: u32, y: u32) -> Vec4 {
        self.renderer
            .backend()
            .surface_pixel(x, y)
            .expect("Pixel outside the surface")
    }
}

/// Check a pixel against an expected color with a per-channel tolerance.
pub fn assert_color_near(actual: Vec4, expected: Vec4, tolerance: f32) {
    let diff = (actual - expected).abs().max_element();
    assert!(
        diff <= tolerance,
        "Pixel mismatch: got {:?}, expected {:?} (tolerance {})",
        actual,
        expected,
        tolerance
    );
}
