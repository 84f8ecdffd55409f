//! Core backend abstraction traits
//!
//! The renderer is written against [`GraphicsBackend`]; the headless software
//! rasterizer and the wgpu backend both implement it.

use crate::backend::types::*;
use thiserror::Error;

/// Backend error type
#[derive(Error, Debug)]
pub enum BackendError {
    #[error("Failed to initialize backend: {0}")]
    InitializationFailed(String),
    #[error("Failed to create device: {0}")]
    DeviceCreationFailed(String),
    #[error("Failed to create buffer: {0}")]
    BufferCreationFailed(String),
    #[error("Failed to create texture: {0}")]
    TextureCreationFailed(String),
    #[error("Failed to create pipeline: {0}")]
    PipelineCreationFailed(String),
    #[error("Failed to create shader: {0}")]
    ShaderCreationFailed(String),
    #[error("Readback failed: {0}")]
    ReadbackFailed(String),
    #[error("Invalid handle: {0}")]
    InvalidHandle(String),
    #[error("Device lost")]
    DeviceLost,
}

pub type BackendResult<T> = Result<T, BackendError>;

/// Handle to a GPU buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct BufferHandle(pub(crate) u64);

/// Handle to a GPU texture
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureHandle(pub(crate) u64);

/// Handle to a compiled shader program
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ProgramHandle(pub(crate) u64);

/// Source of one program: both stages as complete GLSL.
#[derive(Debug, Clone)]
pub struct ProgramDescriptor {
    pub label: String,
    pub vertex_source: String,
    pub fragment_source: String,
}

/// Trait for graphics backends
///
/// All methods are called from the render thread. Draws are ordered exactly
/// as they are issued.
pub trait GraphicsBackend {
    /// Get the backend name
    fn name(&self) -> &'static str;

    /// Size of the main surface
    fn surface_size(&self) -> (u32, u32);

    /// Resize the main surface
    fn resize(&mut self, width: u32, height: u32) -> BackendResult<()>;

    /// Begin a new frame
    fn begin_frame(&mut self) -> BackendResult<()>;

    /// End the current frame and submit pending work
    fn end_frame(&mut self) -> BackendResult<()>;

    /// Create a buffer filled with `data`
    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle>;

    /// Destroy a buffer
    fn destroy_buffer(&mut self, buffer: BufferHandle);

    /// Create a texture
    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle>;

    /// Upload RGBA8 texel data into one layer of a texture
    fn write_texture(&mut self, texture: TextureHandle, layer: u32, data: &[u8]) -> BackendResult<()>;

    /// Destroy a texture
    fn destroy_texture(&mut self, texture: TextureHandle);

    /// Size of a live texture
    fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)>;

    /// Compile a program from GLSL stages
    fn compile_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle>;

    /// Destroy a program
    fn destroy_program(&mut self, program: ProgramHandle);

    /// Bind the target subsequent clears and draws write to
    fn set_render_target(&mut self, target: RenderTarget) -> BackendResult<()>;

    /// Currently bound target
    fn render_target(&self) -> RenderTarget;

    /// Size of the currently bound target
    fn target_size(&self) -> (u32, u32);

    /// Set the viewport rectangle
    fn set_viewport(&mut self, viewport: Viewport);

    /// Current viewport rectangle
    fn viewport(&self) -> Viewport;

    /// Restrict clears and draws to a rectangle, or lift the restriction
    fn set_scissor(&mut self, scissor: Option<Viewport>);

    /// Current scissor rectangle
    fn scissor(&self) -> Option<Viewport>;

    /// Clear the bound target inside the scissor rectangle
    fn clear(&mut self, request: &ClearRequest) -> BackendResult<()>;

    /// Apply fixed-function state for subsequent draws
    fn apply_state(&mut self, state: &PipelineState);

    /// Currently applied fixed-function state
    fn state(&self) -> PipelineState;

    /// Issue one draw
    fn draw(&mut self, call: &DrawCall<'_>) -> BackendResult<()>;

    /// Read one RGBA8 pixel of the bound target, origin top-left
    fn read_pixel(&mut self, x: u32, y: u32) -> BackendResult<[u8; 4]>;
}
