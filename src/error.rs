//! Error types.

use thiserror::Error;

pub use crate::backend::BackendError;

/// Failures while preparing shader source for compilation.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ShaderError {
    #[error("Unknown shader: {0}")]
    UnknownShader(String),
    #[error("Include not found: \"{0}\"")]
    IncludeNotFound(String),
    #[error("Compilation failed: {0}")]
    CompilationFailed(String),
}

/// Errors surfaced by the renderer.
///
/// Per-instance problems (missing resources, bad permutations, absent
/// buffers) never show up here; they are recovered inside the frame.
#[derive(Error, Debug)]
pub enum RenderError {
    #[error(transparent)]
    Backend(#[from] BackendError),
    #[error("Fallback shader failed to compile: {0}")]
    FallbackShaderFailed(ShaderError),
    #[error("Nested render depth exceeded ({0})")]
    NestedRenderOverflow(usize),
    #[error("Invalid render target: {0}")]
    InvalidRenderTarget(String),
    #[error(transparent)]
    Resource(#[from] ResourceError),
}

pub type RenderResult<T> = Result<T, RenderError>;

/// Failures while loading resource data.
#[derive(Error, Debug)]
pub enum ResourceError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
    #[error("Image decode error: {0}")]
    ImageDecode(#[from] image::ImageError),
    #[error("Invalid texture data: {0}")]
    InvalidData(String),
    #[error(transparent)]
    Backend(#[from] BackendError),
}
