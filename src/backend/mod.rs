//! Backend abstraction layer
//!
//! Provides the [`GraphicsBackend`] trait and the types both backends share.
//! The headless software rasterizer is always available; the wgpu backend is
//! behind the `wgpu-backend` feature.

pub mod headless;
pub mod traits;
pub mod types;

#[cfg(feature = "wgpu-backend")]
pub mod wgpu_backend;

pub use headless::{cube_face_uv, default_fragment, DrawRecord, FragmentInput, FragmentShader, HeadlessBackend};
pub use traits::*;
pub use types::*;

#[cfg(feature = "wgpu-backend")]
pub use wgpu_backend::WgpuBackend;
