//! Forward Renderer - A retained-mode forward rendering pipeline
//!
//! The renderer draws a scene graph through a [`GraphicsBackend`]:
//! - **headless**: CPU rasterizer used for tests and offscreen tooling
//! - **wgpu** (feature `wgpu-backend`): GPU backend validating programs with naga
//!
//! # Features
//! - Shader permutations compiled on demand from macro sets, with a fallback program
//! - Multipass forward lighting, one additive pass per light
//! - Shadow maps for spot, directional and omni (cube) lights
//! - Frustum culling, opaque-then-transparent ordering, LOD and wireframe
//! - Render to texture, GPU picking and CPU ray queries
//!
//! ```no_run
//! use forward_renderer::prelude::*;
//!
//! let mut backend = HeadlessBackend::new(320, 240);
//! let mut store = ResourceStore::new();
//! let cube = store.add_mesh(&mut backend, Mesh::cube()).unwrap();
//! let material = store.add_material(Material::default());
//!
//! let mut scene = Scene::new();
//! scene.spawn("cube", Transform::default(), MeshRenderer::new(cube, material));
//! scene.spawn(
//!     "camera",
//!     Transform::default(),
//!     CameraComponent::new(Camera::new(Vec3::new(0.0, 2.0, 5.0), Vec3::ZERO)),
//! );
//!
//! let mut renderer = Renderer::new(backend, RendererConfig::default());
//! let stats = renderer
//!     .render(&mut scene, &store, &RenderOptions::default())
//!     .unwrap();
//! assert_eq!(stats.rendered, 1);
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod pipeline;
pub mod renderer;
pub mod resources;
pub mod scene;
pub mod shader;

pub use backend::{GraphicsBackend, HeadlessBackend};
pub use config::{RenderOptions, RendererConfig};
pub use error::{RenderError, RenderResult, ResourceError, ShaderError};
pub use renderer::{ColliderHit, FrameContext, FrameStats, RaycastHit, Renderer};

#[cfg(feature = "wgpu-backend")]
pub use backend::wgpu_backend::WgpuBackend;

/// Commonly used types.
pub mod prelude {
    pub use crate::backend::{
        GraphicsBackend, HeadlessBackend, RenderTarget, TextureDescriptor, TextureFormat, Viewport,
    };
    pub use crate::config::{RenderOptions, RendererConfig};
    pub use crate::error::{RenderError, RenderResult};
    pub use crate::pipeline::{RenderFlags, ShaderInputs};
    pub use crate::renderer::{FrameStats, Renderer};
    pub use crate::resources::{BlendMode, Material, Mesh, ResourceManager, ResourceStore, TextureData};
    pub use crate::scene::{
        Camera, CameraComponent, ColliderComponent, Light, LightComponent, MeshRenderer, Scene,
        Transform,
    };
    pub use crate::shader::{MacroSet, ShaderMacro};
    pub use glam::{Mat4, Quat, Vec2, Vec3, Vec4};
}
