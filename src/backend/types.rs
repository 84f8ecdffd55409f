//! Common types shared between backends

use std::borrow::Cow;
use std::collections::BTreeMap;

use bytemuck::{Pod, Zeroable};
use glam::{Mat4, Vec2, Vec3, Vec4};

use crate::backend::traits::{BufferHandle, ProgramHandle, TextureHandle};

/// Texture format enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TextureFormat {
    Rgba8Unorm,
    Rgba8UnormSrgb,
    Rgba16Float,
    Rgba32Float,
    Depth32Float,
}

impl TextureFormat {
    pub fn is_depth(&self) -> bool {
        matches!(self, TextureFormat::Depth32Float)
    }

    pub fn bytes_per_pixel(&self) -> u32 {
        match self {
            TextureFormat::Rgba8Unorm
            | TextureFormat::Rgba8UnormSrgb
            | TextureFormat::Depth32Float => 4,
            TextureFormat::Rgba16Float => 8,
            TextureFormat::Rgba32Float => 16,
        }
    }
}

/// Texture usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureUsage(u32);

impl TextureUsage {
    pub const COPY_SRC: Self = Self(1 << 0);
    pub const COPY_DST: Self = Self(1 << 1);
    pub const TEXTURE_BINDING: Self = Self(1 << 2);
    pub const RENDER_ATTACHMENT: Self = Self(1 << 4);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for TextureUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Buffer usage flags
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BufferUsage(u32);

impl BufferUsage {
    pub const COPY_DST: Self = Self(1 << 3);
    pub const INDEX: Self = Self(1 << 4);
    pub const VERTEX: Self = Self(1 << 5);
    pub const UNIFORM: Self = Self(1 << 6);

    pub fn contains(&self, other: Self) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl std::ops::BitOr for BufferUsage {
    type Output = Self;
    fn bitor(self, rhs: Self) -> Self::Output {
        Self(self.0 | rhs.0)
    }
}

/// Texture descriptor
///
/// `layers` is 6 for cube maps.
#[derive(Debug, Clone)]
pub struct TextureDescriptor {
    pub label: Option<String>,
    pub width: u32,
    pub height: u32,
    pub layers: u32,
    pub format: TextureFormat,
    pub usage: TextureUsage,
}

impl Default for TextureDescriptor {
    fn default() -> Self {
        Self {
            label: None,
            width: 1,
            height: 1,
            layers: 1,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        }
    }
}

impl TextureDescriptor {
    /// Descriptor for an offscreen color or depth attachment.
    pub fn render_target(label: &str, width: u32, height: u32, format: TextureFormat) -> Self {
        Self {
            label: Some(label.to_string()),
            width,
            height,
            layers: 1,
            format,
            usage: TextureUsage::RENDER_ATTACHMENT
                | TextureUsage::TEXTURE_BINDING
                | TextureUsage::COPY_SRC,
        }
    }

    pub fn with_layers(mut self, layers: u32) -> Self {
        self.layers = layers;
        self
    }

    pub fn is_cube(&self) -> bool {
        self.layers == 6
    }
}

/// Buffer descriptor
#[derive(Debug, Clone)]
pub struct BufferDescriptor {
    pub label: Option<String>,
    pub usage: BufferUsage,
}

impl BufferDescriptor {
    pub fn vertex(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            usage: BufferUsage::VERTEX | BufferUsage::COPY_DST,
        }
    }

    pub fn index(label: &str) -> Self {
        Self {
            label: Some(label.to_string()),
            usage: BufferUsage::INDEX | BufferUsage::COPY_DST,
        }
    }
}

/// Standard vertex with position, normal, UV, and tangent
#[repr(C)]
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
pub struct Vertex {
    pub position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub tangent: Vec4,
}

impl Vertex {
    /// Size of one vertex in bytes.
    pub const STRIDE: u64 = std::mem::size_of::<Self>() as u64;

    pub fn new(position: Vec3, normal: Vec3, uv: Vec2) -> Self {
        Self {
            position,
            normal,
            uv,
            tangent: Vec4::new(1.0, 0.0, 0.0, 1.0),
        }
    }
}

/// Primitive topology
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PrimitiveTopology {
    PointList,
    LineList,
    TriangleList,
}

/// Front face winding
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FrontFace {
    Ccw,
    Cw,
}

/// Cull mode
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CullMode {
    None,
    Front,
    Back,
}

/// Compare function for depth tests
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareFunction {
    Never,
    Less,
    Equal,
    LessEqual,
    Greater,
    NotEqual,
    GreaterEqual,
    Always,
}

impl CompareFunction {
    pub fn passes(&self, incoming: f32, stored: f32) -> bool {
        match self {
            CompareFunction::Never => false,
            CompareFunction::Less => incoming < stored,
            CompareFunction::Equal => incoming == stored,
            CompareFunction::LessEqual => incoming <= stored,
            CompareFunction::Greater => incoming > stored,
            CompareFunction::NotEqual => incoming != stored,
            CompareFunction::GreaterEqual => incoming >= stored,
            CompareFunction::Always => true,
        }
    }
}

/// Blend factor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendFactor {
    Zero,
    One,
    Src,
    OneMinusSrc,
    SrcAlpha,
    OneMinusSrcAlpha,
    Dst,
    OneMinusDst,
    DstAlpha,
    OneMinusDstAlpha,
}

impl BlendFactor {
    fn weight(&self, src: Vec4, dst: Vec4) -> Vec4 {
        match self {
            BlendFactor::Zero => Vec4::ZERO,
            BlendFactor::One => Vec4::ONE,
            BlendFactor::Src => src,
            BlendFactor::OneMinusSrc => Vec4::ONE - src,
            BlendFactor::SrcAlpha => Vec4::splat(src.w),
            BlendFactor::OneMinusSrcAlpha => Vec4::splat(1.0 - src.w),
            BlendFactor::Dst => dst,
            BlendFactor::OneMinusDst => Vec4::ONE - dst,
            BlendFactor::DstAlpha => Vec4::splat(dst.w),
            BlendFactor::OneMinusDstAlpha => Vec4::splat(1.0 - dst.w),
        }
    }
}

/// Blend operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BlendOperation {
    Add,
    Subtract,
    ReverseSubtract,
    Min,
    Max,
}

/// Blend component state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendComponent {
    pub src_factor: BlendFactor,
    pub dst_factor: BlendFactor,
    pub operation: BlendOperation,
}

impl Default for BlendComponent {
    fn default() -> Self {
        Self {
            src_factor: BlendFactor::One,
            dst_factor: BlendFactor::Zero,
            operation: BlendOperation::Add,
        }
    }
}

impl BlendComponent {
    fn combine(&self, src: Vec4, dst: Vec4) -> Vec4 {
        let s = src * self.src_factor.weight(src, dst);
        let d = dst * self.dst_factor.weight(src, dst);
        match self.operation {
            BlendOperation::Add => s + d,
            BlendOperation::Subtract => s - d,
            BlendOperation::ReverseSubtract => d - s,
            BlendOperation::Min => src.min(dst),
            BlendOperation::Max => src.max(dst),
        }
    }
}

/// Blend state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlendState {
    pub color: BlendComponent,
    pub alpha: BlendComponent,
}

impl BlendState {
    pub fn alpha_blending() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::SrcAlpha,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::OneMinusSrcAlpha,
                operation: BlendOperation::Add,
            },
        }
    }

    /// `src + dst`, used to accumulate light passes.
    pub fn additive() -> Self {
        Self {
            color: BlendComponent {
                src_factor: BlendFactor::One,
                dst_factor: BlendFactor::One,
                operation: BlendOperation::Add,
            },
            alpha: BlendComponent {
                src_factor: BlendFactor::Zero,
                dst_factor: BlendFactor::One,
                operation: BlendOperation::Add,
            },
        }
    }

    /// Blend a source color over a destination color on the CPU.
    pub fn apply(&self, src: Vec4, dst: Vec4) -> Vec4 {
        let color = self.color.combine(src, dst);
        let alpha = self.alpha.combine(src, dst);
        color.truncate().extend(alpha.w)
    }
}

/// Fixed-function state applied before a draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PipelineState {
    pub cull_mode: CullMode,
    pub front_face: FrontFace,
    pub depth_test: bool,
    pub depth_write: bool,
    pub depth_compare: CompareFunction,
    pub blend: Option<BlendState>,
}

impl Default for PipelineState {
    fn default() -> Self {
        Self::baseline()
    }
}

impl PipelineState {
    /// Known state every submission starts and ends from: back-face culling,
    /// CCW front faces, depth test and write on, blending off.
    pub const fn baseline() -> Self {
        Self {
            cull_mode: CullMode::Back,
            front_face: FrontFace::Ccw,
            depth_test: true,
            depth_write: true,
            depth_compare: CompareFunction::Less,
            blend: None,
        }
    }
}

/// Rectangle in target pixels, origin at the top-left corner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Viewport {
    pub x: u32,
    pub y: u32,
    pub width: u32,
    pub height: u32,
}

impl Viewport {
    pub fn new(x: u32, y: u32, width: u32, height: u32) -> Self {
        Self { x, y, width, height }
    }

    pub fn full(size: (u32, u32)) -> Self {
        Self::new(0, 0, size.0, size.1)
    }

    /// Convert a normalized `(x, y, w, h)` rectangle into pixels of a target.
    pub fn from_normalized(normalized: Vec4, target: (u32, u32)) -> Self {
        let (tw, th) = (target.0 as f32, target.1 as f32);
        let x = (normalized.x * tw).round().clamp(0.0, tw) as u32;
        let y = (normalized.y * th).round().clamp(0.0, th) as u32;
        let width = (normalized.z * tw).round().clamp(0.0, tw - x as f32) as u32;
        let height = (normalized.w * th).round().clamp(0.0, th - y as f32) as u32;
        Self { x, y, width, height }
    }

    pub fn contains(&self, x: u32, y: u32) -> bool {
        x >= self.x && y >= self.y && x < self.x + self.width && y < self.y + self.height
    }

    pub fn intersect(&self, other: &Viewport) -> Viewport {
        let x0 = self.x.max(other.x);
        let y0 = self.y.max(other.y);
        let x1 = (self.x + self.width).min(other.x + other.width);
        let y1 = (self.y + self.height).min(other.y + other.height);
        Viewport::new(x0, y0, x1.saturating_sub(x0), y1.saturating_sub(y0))
    }

    pub fn aspect(&self) -> f32 {
        if self.height == 0 {
            1.0
        } else {
            self.width as f32 / self.height as f32
        }
    }
}

/// Where draws land.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum RenderTarget {
    /// The backend's main color + depth surface.
    #[default]
    Screen,
    /// An offscreen texture layer, optionally with a depth attachment.
    Texture {
        color: TextureHandle,
        depth: Option<TextureHandle>,
        layer: u32,
    },
}

/// Which attachments a clear touches. The clear is limited to the current scissor.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClearRequest {
    pub color: Option<Vec4>,
    pub depth: Option<f32>,
}

/// A typed uniform value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum UniformValue {
    Float(f32),
    Int(i32),
    Vec2(Vec2),
    Vec3(Vec3),
    Vec4(Vec4),
    Mat4(Mat4),
}

impl UniformValue {
    pub fn as_vec4(&self) -> Option<Vec4> {
        match self {
            UniformValue::Vec4(v) => Some(*v),
            UniformValue::Vec3(v) => Some(v.extend(1.0)),
            _ => None,
        }
    }

    pub fn as_mat4(&self) -> Option<Mat4> {
        match self {
            UniformValue::Mat4(m) => Some(*m),
            _ => None,
        }
    }

    pub fn as_float(&self) -> Option<f32> {
        match self {
            UniformValue::Float(v) => Some(*v),
            UniformValue::Int(v) => Some(*v as f32),
            _ => None,
        }
    }

    /// Write the value with std140 rules into `out` at `offset`.
    pub fn write_std140(&self, out: &mut [u8], offset: usize) {
        let bytes: &[u8] = match self {
            UniformValue::Float(v) => bytemuck::bytes_of(v),
            UniformValue::Int(v) => bytemuck::bytes_of(v),
            UniformValue::Vec2(v) => bytemuck::bytes_of(v),
            UniformValue::Vec3(v) => bytemuck::bytes_of(v),
            UniformValue::Vec4(v) => bytemuck::bytes_of(v),
            UniformValue::Mat4(v) => bytemuck::bytes_of(v),
        };
        if let Some(dst) = out.get_mut(offset..offset + bytes.len()) {
            dst.copy_from_slice(bytes);
        }
    }
}

impl From<f32> for UniformValue {
    fn from(v: f32) -> Self {
        UniformValue::Float(v)
    }
}

impl From<i32> for UniformValue {
    fn from(v: i32) -> Self {
        UniformValue::Int(v)
    }
}

impl From<Vec2> for UniformValue {
    fn from(v: Vec2) -> Self {
        UniformValue::Vec2(v)
    }
}

impl From<Vec3> for UniformValue {
    fn from(v: Vec3) -> Self {
        UniformValue::Vec3(v)
    }
}

impl From<Vec4> for UniformValue {
    fn from(v: Vec4) -> Self {
        UniformValue::Vec4(v)
    }
}

impl From<Mat4> for UniformValue {
    fn from(v: Mat4) -> Self {
        UniformValue::Mat4(v)
    }
}

/// Uniform or sampler name. Built-in names are borrowed, custom ones owned.
pub type InputName = Cow<'static, str>;

/// Named uniform values.
pub type UniformMap = BTreeMap<InputName, UniformValue>;

/// Named texture bindings.
pub type SamplerMap = BTreeMap<InputName, TextureHandle>;

/// Vertex and index buffers plus the range to draw.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct GeometryRef {
    pub vertex_buffer: BufferHandle,
    pub vertex_count: u32,
    pub index_buffer: Option<BufferHandle>,
    pub index_count: u32,
    pub topology: PrimitiveTopology,
    /// `(start, count)` in indices (or vertices when not indexed).
    pub range: Option<(u32, u32)>,
}

impl GeometryRef {
    /// The element range actually submitted.
    pub fn draw_range(&self) -> (u32, u32) {
        let total = if self.index_buffer.is_some() {
            self.index_count
        } else {
            self.vertex_count
        };
        match self.range {
            Some((start, count)) => {
                let start = start.min(total);
                (start, count.min(total - start))
            }
            None => (0, total),
        }
    }
}

/// Everything a backend needs for one draw.
///
/// Uniform and sampler maps are layered; a name found in a later layer
/// hides the same name in earlier ones.
#[derive(Debug, Clone, Copy)]
pub struct DrawCall<'a> {
    pub program: ProgramHandle,
    pub geometry: &'a GeometryRef,
    pub uniforms: &'a [&'a UniformMap],
    pub samplers: &'a [&'a SamplerMap],
}

impl<'a> DrawCall<'a> {
    pub fn uniform(&self, name: &str) -> Option<&'a UniformValue> {
        self.uniforms.iter().rev().find_map(|layer| layer.get(name))
    }

    pub fn sampler(&self, name: &str) -> Option<TextureHandle> {
        self.samplers
            .iter()
            .rev()
            .find_map(|layer| layer.get(name).copied())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn additive_blend_sums_color() {
        let blend = BlendState::additive();
        let out = blend.apply(Vec4::new(0.2, 0.1, 0.0, 1.0), Vec4::new(0.3, 0.3, 0.3, 1.0));
        assert!((out - Vec4::new(0.5, 0.4, 0.3, 1.0)).abs().max_element() < 1e-6);
    }

    #[test]
    fn alpha_blend_mixes() {
        let blend = BlendState::alpha_blending();
        let out = blend.apply(Vec4::new(1.0, 0.0, 0.0, 0.5), Vec4::new(0.0, 0.0, 1.0, 1.0));
        assert!((out.x - 0.5).abs() < 1e-6);
        assert!((out.z - 0.5).abs() < 1e-6);
    }

    #[test]
    fn normalized_viewport_maps_to_pixels() {
        let vp = Viewport::from_normalized(Vec4::new(0.5, 0.0, 0.5, 1.0), (200, 100));
        assert_eq!(vp, Viewport::new(100, 0, 100, 100));
    }

    #[test]
    fn draw_range_is_clamped() {
        let geometry = GeometryRef {
            vertex_buffer: BufferHandle(1),
            vertex_count: 4,
            index_buffer: Some(BufferHandle(2)),
            index_count: 6,
            topology: PrimitiveTopology::TriangleList,
            range: Some((3, 10)),
        };
        assert_eq!(geometry.draw_range(), (3, 3));
    }

    #[test]
    fn later_uniform_layer_wins() {
        let mut base = UniformMap::new();
        base.insert("u_color".into(), UniformValue::Float(1.0));
        let mut top = UniformMap::new();
        top.insert("u_color".into(), UniformValue::Float(2.0));
        let geometry = GeometryRef {
            vertex_buffer: BufferHandle(1),
            vertex_count: 3,
            index_buffer: None,
            index_count: 0,
            topology: PrimitiveTopology::TriangleList,
            range: None,
        };
        let layers = [&base, &top];
        let call = DrawCall {
            program: ProgramHandle(1),
            geometry: &geometry,
            uniforms: &layers,
            samplers: &[],
        };
        assert_eq!(call.uniform("u_color"), Some(&UniformValue::Float(2.0)));
    }
}
