//! wgpu backend implementation
//!
//! Renders offscreen: the main surface is a color + depth texture pair that
//! can be read back. GLSL programs are parsed and validated with naga,
//! translated to WGSL and handed to wgpu; the naga module also provides the
//! uniform block layouts and texture bindings used to build bind groups.
//!
//! Every draw and clear is recorded into its own render pass and submitted
//! right away, so draw order is exactly issue order.

use std::borrow::Cow;
use std::collections::HashMap;

use wgpu::util::DeviceExt;

use crate::backend::traits::*;
use crate::backend::types::*;

const SURFACE_FORMAT: TextureFormat = TextureFormat::Rgba8Unorm;
const DEPTH_FORMAT: TextureFormat = TextureFormat::Depth32Float;

const CLEAR_SHADER: &str = r#"
struct ClearParams {
    color: vec4<f32>,
    depth: vec4<f32>,
};

@group(0) @binding(0) var<uniform> params: ClearParams;

@vertex
fn vs_main(@builtin(vertex_index) index: u32) -> @builtin(position) vec4<f32> {
    let uv = vec2<f32>(f32((index << 1u) & 2u), f32(index & 2u));
    return vec4<f32>(uv * 2.0 - 1.0, params.depth.x, 1.0);
}

@fragment
fn fs_main() -> @location(0) vec4<f32> {
    return params.color;
}
"#;

struct TextureEntry {
    texture: wgpu::Texture,
    /// One single-layer view per layer, used as attachments.
    layer_views: Vec<wgpu::TextureView>,
    /// 2D or cube view used for sampling.
    sample_view: wgpu::TextureView,
    desc: TextureDescriptor,
}

/// Reflected uniform block member.
struct UniformMember {
    name: String,
    offset: usize,
}

enum BindingKind {
    Uniform { size: usize, members: Vec<UniformMember> },
    Texture { name: String, cube: bool },
    Sampler,
}

struct Binding {
    group: u32,
    binding: u32,
    kind: BindingKind,
}

struct ProgramEntry {
    label: String,
    vertex: wgpu::ShaderModule,
    fragment: wgpu::ShaderModule,
    bindings: Vec<Binding>,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct PipelineKey {
    program: u64,
    color: TextureFormat,
    depth: Option<TextureFormat>,
    topology: PrimitiveTopology,
    state: PipelineState,
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
struct ClearKey {
    color: TextureFormat,
    depth: Option<TextureFormat>,
    write_color: bool,
    write_depth: bool,
}

/// Attachments of the bound target.
struct Attachments {
    color: u64,
    color_layer: u32,
    depth: Option<u64>,
    color_format: TextureFormat,
    depth_format: Option<TextureFormat>,
    size: (u32, u32),
}

/// wgpu backend implementation
pub struct WgpuBackend {
    #[allow(dead_code)]
    instance: wgpu::Instance,
    #[allow(dead_code)]
    adapter: wgpu::Adapter,
    device: wgpu::Device,
    queue: wgpu::Queue,

    buffers: HashMap<u64, wgpu::Buffer>,
    textures: HashMap<u64, TextureEntry>,
    programs: HashMap<u64, ProgramEntry>,
    pipelines: HashMap<PipelineKey, wgpu::RenderPipeline>,
    clear_pipelines: HashMap<ClearKey, wgpu::RenderPipeline>,
    clear_module: wgpu::ShaderModule,
    sampler: wgpu::Sampler,
    white_2d: u64,
    white_cube: u64,
    surface_color: u64,
    surface_depth: u64,
    next_id: u64,

    target: RenderTarget,
    viewport: Viewport,
    scissor: Option<Viewport>,
    state: PipelineState,
}

impl WgpuBackend {
    fn convert_texture_format(format: TextureFormat) -> wgpu::TextureFormat {
        match format {
            TextureFormat::Rgba8Unorm => wgpu::TextureFormat::Rgba8Unorm,
            TextureFormat::Rgba8UnormSrgb => wgpu::TextureFormat::Rgba8UnormSrgb,
            TextureFormat::Rgba16Float => wgpu::TextureFormat::Rgba16Float,
            TextureFormat::Rgba32Float => wgpu::TextureFormat::Rgba32Float,
            TextureFormat::Depth32Float => wgpu::TextureFormat::Depth32Float,
        }
    }

    fn convert_buffer_usage(usage: BufferUsage) -> wgpu::BufferUsages {
        let mut result = wgpu::BufferUsages::empty();
        if usage.contains(BufferUsage::COPY_DST) {
            result |= wgpu::BufferUsages::COPY_DST;
        }
        if usage.contains(BufferUsage::INDEX) {
            result |= wgpu::BufferUsages::INDEX;
        }
        if usage.contains(BufferUsage::VERTEX) {
            result |= wgpu::BufferUsages::VERTEX;
        }
        if usage.contains(BufferUsage::UNIFORM) {
            result |= wgpu::BufferUsages::UNIFORM;
        }
        result
    }

    fn convert_texture_usage(usage: TextureUsage) -> wgpu::TextureUsages {
        let mut result = wgpu::TextureUsages::empty();
        if usage.contains(TextureUsage::COPY_SRC) {
            result |= wgpu::TextureUsages::COPY_SRC;
        }
        if usage.contains(TextureUsage::COPY_DST) {
            result |= wgpu::TextureUsages::COPY_DST;
        }
        if usage.contains(TextureUsage::TEXTURE_BINDING) {
            result |= wgpu::TextureUsages::TEXTURE_BINDING;
        }
        if usage.contains(TextureUsage::RENDER_ATTACHMENT) {
            result |= wgpu::TextureUsages::RENDER_ATTACHMENT;
        }
        result
    }

    fn convert_compare_function(func: CompareFunction) -> wgpu::CompareFunction {
        match func {
            CompareFunction::Never => wgpu::CompareFunction::Never,
            CompareFunction::Less => wgpu::CompareFunction::Less,
            CompareFunction::Equal => wgpu::CompareFunction::Equal,
            CompareFunction::LessEqual => wgpu::CompareFunction::LessEqual,
            CompareFunction::Greater => wgpu::CompareFunction::Greater,
            CompareFunction::NotEqual => wgpu::CompareFunction::NotEqual,
            CompareFunction::GreaterEqual => wgpu::CompareFunction::GreaterEqual,
            CompareFunction::Always => wgpu::CompareFunction::Always,
        }
    }

    fn convert_blend_factor(factor: BlendFactor) -> wgpu::BlendFactor {
        match factor {
            BlendFactor::Zero => wgpu::BlendFactor::Zero,
            BlendFactor::One => wgpu::BlendFactor::One,
            BlendFactor::Src => wgpu::BlendFactor::Src,
            BlendFactor::OneMinusSrc => wgpu::BlendFactor::OneMinusSrc,
            BlendFactor::SrcAlpha => wgpu::BlendFactor::SrcAlpha,
            BlendFactor::OneMinusSrcAlpha => wgpu::BlendFactor::OneMinusSrcAlpha,
            BlendFactor::Dst => wgpu::BlendFactor::Dst,
            BlendFactor::OneMinusDst => wgpu::BlendFactor::OneMinusDst,
            BlendFactor::DstAlpha => wgpu::BlendFactor::DstAlpha,
            BlendFactor::OneMinusDstAlpha => wgpu::BlendFactor::OneMinusDstAlpha,
        }
    }

    fn convert_blend_operation(op: BlendOperation) -> wgpu::BlendOperation {
        match op {
            BlendOperation::Add => wgpu::BlendOperation::Add,
            BlendOperation::Subtract => wgpu::BlendOperation::Subtract,
            BlendOperation::ReverseSubtract => wgpu::BlendOperation::ReverseSubtract,
            BlendOperation::Min => wgpu::BlendOperation::Min,
            BlendOperation::Max => wgpu::BlendOperation::Max,
        }
    }

    fn convert_blend_component(component: &BlendComponent) -> wgpu::BlendComponent {
        wgpu::BlendComponent {
            src_factor: Self::convert_blend_factor(component.src_factor),
            dst_factor: Self::convert_blend_factor(component.dst_factor),
            operation: Self::convert_blend_operation(component.operation),
        }
    }

    fn convert_topology(topology: PrimitiveTopology) -> wgpu::PrimitiveTopology {
        match topology {
            PrimitiveTopology::PointList => wgpu::PrimitiveTopology::PointList,
            PrimitiveTopology::LineList => wgpu::PrimitiveTopology::LineList,
            PrimitiveTopology::TriangleList => wgpu::PrimitiveTopology::TriangleList,
        }
    }

    /// Create a backend with a `width` x `height` offscreen surface.
    pub fn new(width: u32, height: u32) -> BackendResult<Self> {
        pollster::block_on(Self::new_async(width, height))
    }

    pub async fn new_async(width: u32, height: u32) -> BackendResult<Self> {
        let instance = wgpu::Instance::new(wgpu::InstanceDescriptor {
            backends: wgpu::Backends::all(),
            ..Default::default()
        });

        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| BackendError::InitializationFailed("No suitable adapter found".into()))?;

        let adapter_info = adapter.get_info();
        log::info!(
            "Selected GPU: {} ({:?} backend)",
            adapter_info.name,
            adapter_info.backend
        );

        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("Renderer Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: wgpu::Limits::default(),
                },
                None,
            )
            .await
            .map_err(|e| BackendError::DeviceCreationFailed(e.to_string()))?;

        let clear_module = device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some("clear"),
            source: wgpu::ShaderSource::Wgsl(CLEAR_SHADER.into()),
        });
        let sampler = device.create_sampler(&wgpu::SamplerDescriptor {
            label: Some("default sampler"),
            address_mode_u: wgpu::AddressMode::ClampToEdge,
            address_mode_v: wgpu::AddressMode::ClampToEdge,
            address_mode_w: wgpu::AddressMode::ClampToEdge,
            mag_filter: wgpu::FilterMode::Linear,
            min_filter: wgpu::FilterMode::Linear,
            ..Default::default()
        });

        let mut backend = Self {
            instance,
            adapter,
            device,
            queue,
            buffers: HashMap::new(),
            textures: HashMap::new(),
            programs: HashMap::new(),
            pipelines: HashMap::new(),
            clear_pipelines: HashMap::new(),
            clear_module,
            sampler,
            white_2d: 0,
            white_cube: 0,
            surface_color: 0,
            surface_depth: 0,
            next_id: 1,
            target: RenderTarget::Screen,
            viewport: Viewport::full((width, height)),
            scissor: None,
            state: PipelineState::baseline(),
        };

        backend.white_2d = backend.create_white(1)?;
        backend.white_cube = backend.create_white(6)?;
        backend.create_surface(width, height)?;
        Ok(backend)
    }

    pub fn device(&self) -> &wgpu::Device {
        &self.device
    }

    pub fn queue(&self) -> &wgpu::Queue {
        &self.queue
    }

    /// Copy the main surface into an 8-bit image.
    pub fn capture_surface(&mut self) -> BackendResult<image::RgbaImage> {
        let (width, height) = self.surface_size();
        let pixels = self.read_region(self.surface_color, 0, 0, 0, width, height)?;
        image::RgbaImage::from_raw(width, height, pixels)
            .ok_or_else(|| BackendError::ReadbackFailed("Surface size mismatch".into()))
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn create_white(&mut self, layers: u32) -> BackendResult<u64> {
        let handle = self.create_texture(&TextureDescriptor {
            label: Some("white".into()),
            layers,
            ..Default::default()
        })?;
        for layer in 0..layers {
            self.write_texture(handle, layer, &[255; 4])?;
        }
        Ok(handle.0)
    }

    fn create_surface(&mut self, width: u32, height: u32) -> BackendResult<()> {
        let color = self.create_texture(&TextureDescriptor::render_target(
            "surface",
            width,
            height,
            SURFACE_FORMAT,
        ))?;
        let depth = self.create_texture(&TextureDescriptor::render_target(
            "surface depth",
            width,
            height,
            DEPTH_FORMAT,
        ))?;
        self.surface_color = color.0;
        self.surface_depth = depth.0;
        Ok(())
    }

    fn attachments(&self) -> BackendResult<Attachments> {
        let (color, depth, layer) = match self.target {
            RenderTarget::Screen => (self.surface_color, Some(self.surface_depth), 0),
            RenderTarget::Texture { color, depth, layer } => (color.0, depth.map(|d| d.0), layer),
        };
        let entry = self
            .textures
            .get(&color)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {}", color)))?;
        let depth_format = match depth {
            Some(depth) => Some(
                self.textures
                    .get(&depth)
                    .map(|d| d.desc.format)
                    .ok_or_else(|| BackendError::InvalidHandle(format!("texture {}", depth)))?,
            ),
            None => None,
        };
        Ok(Attachments {
            color,
            color_layer: layer.min(entry.desc.layers.saturating_sub(1)),
            depth,
            color_format: entry.desc.format,
            depth_format,
            size: (entry.desc.width, entry.desc.height),
        })
    }

    /// Parse, validate and translate one GLSL stage.
    fn translate_stage(
        label: &str,
        source: &str,
        stage: naga::ShaderStage,
        bindings: &mut Vec<Binding>,
    ) -> BackendResult<String> {
        let options = naga::front::glsl::Options::from(stage);
        let mut frontend = naga::front::glsl::Frontend::default();
        let module = frontend.parse(&options, source).map_err(|errors| {
            BackendError::ShaderCreationFailed(format!("{} ({:?} stage): {}", label, stage, errors))
        })?;

        let info = naga::valid::Validator::new(
            naga::valid::ValidationFlags::all(),
            naga::valid::Capabilities::all(),
        )
        .validate(&module)
        .map_err(|e| BackendError::ShaderCreationFailed(format!("{} ({:?} stage): {}", label, stage, e)))?;

        let entry = info.get_entry_point(0);
        for (handle, global) in module.global_variables.iter() {
            let Some(binding) = &global.binding else {
                continue;
            };
            if entry[handle].is_empty()
                || bindings
                    .iter()
                    .any(|b| b.group == binding.group && b.binding == binding.binding)
            {
                continue;
            }
            let kind = match &module.types[global.ty].inner {
                naga::TypeInner::Struct { members, span } => BindingKind::Uniform {
                    size: *span as usize,
                    members: members
                        .iter()
                        .filter_map(|m| {
                            Some(UniformMember {
                                name: m.name.clone()?,
                                offset: m.offset as usize,
                            })
                        })
                        .collect(),
                },
                naga::TypeInner::Image { dim, .. } => BindingKind::Texture {
                    name: global.name.clone().unwrap_or_default(),
                    cube: *dim == naga::ImageDimension::Cube,
                },
                naga::TypeInner::Sampler { .. } => BindingKind::Sampler,
                _ => continue,
            };
            bindings.push(Binding {
                group: binding.group,
                binding: binding.binding,
                kind,
            });
        }

        naga::back::wgsl::write_string(&module, &info, naga::back::wgsl::WriterFlags::empty())
            .map_err(|e| BackendError::ShaderCreationFailed(format!("{}: {}", label, e)))
    }

    fn ensure_pipeline(&mut self, key: PipelineKey) -> BackendResult<()> {
        if !self.pipelines.contains_key(&key) {
            let program = self
                .programs
                .get(&key.program)
                .ok_or_else(|| BackendError::InvalidHandle(format!("program {}", key.program)))?;
            let state = &key.state;

            let attributes = [
                wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x3,
                    offset: 0,
                    shader_location: 0,
                },
                wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x3,
                    offset: 12,
                    shader_location: 1,
                },
                wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x2,
                    offset: 24,
                    shader_location: 2,
                },
                wgpu::VertexAttribute {
                    format: wgpu::VertexFormat::Float32x4,
                    offset: 32,
                    shader_location: 3,
                },
            ];
            let vertex_buffers = [wgpu::VertexBufferLayout {
                array_stride: Vertex::STRIDE,
                step_mode: wgpu::VertexStepMode::Vertex,
                attributes: &attributes,
            }];

            let color_targets = [Some(wgpu::ColorTargetState {
                format: Self::convert_texture_format(key.color),
                blend: state.blend.as_ref().map(|b| wgpu::BlendState {
                    color: Self::convert_blend_component(&b.color),
                    alpha: Self::convert_blend_component(&b.alpha),
                }),
                write_mask: wgpu::ColorWrites::ALL,
            })];

            let primitive = wgpu::PrimitiveState {
                topology: Self::convert_topology(key.topology),
                strip_index_format: None,
                front_face: match state.front_face {
                    FrontFace::Ccw => wgpu::FrontFace::Ccw,
                    FrontFace::Cw => wgpu::FrontFace::Cw,
                },
                cull_mode: match state.cull_mode {
                    CullMode::None => None,
                    CullMode::Front => Some(wgpu::Face::Front),
                    CullMode::Back => Some(wgpu::Face::Back),
                },
                ..Default::default()
            };

            let depth_stencil = key.depth.map(|format| wgpu::DepthStencilState {
                format: Self::convert_texture_format(format),
                depth_write_enabled: state.depth_test && state.depth_write,
                depth_compare: if state.depth_test {
                    Self::convert_compare_function(state.depth_compare)
                } else {
                    wgpu::CompareFunction::Always
                },
                stencil: wgpu::StencilState::default(),
                bias: wgpu::DepthBiasState::default(),
            });

            let pipeline = self.device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some(program.label.as_str()),
                layout: None,
                vertex: wgpu::VertexState {
                    module: &program.vertex,
                    entry_point: "main",
                    buffers: &vertex_buffers,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module: &program.fragment,
                    entry_point: "main",
                    targets: &color_targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive,
                depth_stencil,
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            });
            log::debug!("Created pipeline for '{}'", program.label);
            self.pipelines.insert(key, pipeline);
        }
        Ok(())
    }

    fn ensure_clear_pipeline(&mut self, key: ClearKey) {
        let device = &self.device;
        let module = &self.clear_module;
        self.clear_pipelines.entry(key).or_insert_with(|| {
            let targets = [Some(wgpu::ColorTargetState {
                format: Self::convert_texture_format(key.color),
                blend: None,
                write_mask: if key.write_color {
                    wgpu::ColorWrites::ALL
                } else {
                    wgpu::ColorWrites::empty()
                },
            })];
            device.create_render_pipeline(&wgpu::RenderPipelineDescriptor {
                label: Some("clear"),
                layout: None,
                vertex: wgpu::VertexState {
                    module,
                    entry_point: "vs_main",
                    buffers: &[],
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                },
                fragment: Some(wgpu::FragmentState {
                    module,
                    entry_point: "fs_main",
                    targets: &targets,
                    compilation_options: wgpu::PipelineCompilationOptions::default(),
                }),
                primitive: wgpu::PrimitiveState::default(),
                depth_stencil: key.depth.map(|format| wgpu::DepthStencilState {
                    format: Self::convert_texture_format(format),
                    depth_write_enabled: key.write_depth,
                    depth_compare: wgpu::CompareFunction::Always,
                    stencil: wgpu::StencilState::default(),
                    bias: wgpu::DepthBiasState::default(),
                }),
                multisample: wgpu::MultisampleState::default(),
                multiview: None,
            })
        });
    }

    /// Begin a render pass over the bound target that keeps its contents.
    fn begin_pass<'e>(
        &'e self,
        encoder: &'e mut wgpu::CommandEncoder,
        attachments: &Attachments,
        viewport: Viewport,
        scissor: Viewport,
    ) -> BackendResult<wgpu::RenderPass<'e>> {
        let color = self
            .textures
            .get(&attachments.color)
            .and_then(|t| t.layer_views.get(attachments.color_layer as usize))
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {}", attachments.color)))?;
        let depth = attachments
            .depth
            .and_then(|d| self.textures.get(&d))
            .and_then(|t| t.layer_views.first());

        let mut pass = encoder.begin_render_pass(&wgpu::RenderPassDescriptor {
            label: None,
            color_attachments: &[Some(wgpu::RenderPassColorAttachment {
                view: color,
                resolve_target: None,
                ops: wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                },
            })],
            depth_stencil_attachment: depth.map(|view| wgpu::RenderPassDepthStencilAttachment {
                view,
                depth_ops: Some(wgpu::Operations {
                    load: wgpu::LoadOp::Load,
                    store: wgpu::StoreOp::Store,
                }),
                stencil_ops: None,
            }),
            timestamp_writes: None,
            occlusion_query_set: None,
        });
        pass.set_viewport(
            viewport.x as f32,
            viewport.y as f32,
            viewport.width as f32,
            viewport.height as f32,
            0.0,
            1.0,
        );
        pass.set_scissor_rect(scissor.x, scissor.y, scissor.width, scissor.height);
        Ok(pass)
    }

    /// Scissor clamped to the bound target, `None` when nothing is left.
    fn effective_scissor(&self, size: (u32, u32)) -> Option<Viewport> {
        let full = Viewport::full(size);
        let rect = self.scissor.map(|s| s.intersect(&full)).unwrap_or(full);
        (rect.width > 0 && rect.height > 0).then_some(rect)
    }

    fn uniform_buffer(&self, label: &str, size: usize, members: &[UniformMember], call: &DrawCall<'_>) -> wgpu::Buffer {
        let mut data = vec![0u8; size.max(16)];
        for member in members {
            if let Some(value) = call.uniform(&member.name) {
                value.write_std140(&mut data, member.offset);
            }
        }
        self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some(label),
            contents: &data,
            usage: wgpu::BufferUsages::UNIFORM,
        })
    }

    fn read_region(
        &mut self,
        texture: u64,
        layer: u32,
        x: u32,
        y: u32,
        width: u32,
        height: u32,
    ) -> BackendResult<Vec<u8>> {
        let entry = self
            .textures
            .get(&texture)
            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {}", texture)))?;
        if !matches!(
            entry.desc.format,
            TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb
        ) {
            return Err(BackendError::ReadbackFailed(format!(
                "{:?} targets cannot be read back",
                entry.desc.format
            )));
        }
        let unpadded = width * 4;
        let padded = unpadded.div_ceil(wgpu::COPY_BYTES_PER_ROW_ALIGNMENT) * wgpu::COPY_BYTES_PER_ROW_ALIGNMENT;
        let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
            label: Some("readback"),
            size: (padded * height) as u64,
            usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
            mapped_at_creation: false,
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("readback") });
        encoder.copy_texture_to_buffer(
            wgpu::ImageCopyTexture {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x, y, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            wgpu::ImageCopyBuffer {
                buffer: &staging,
                layout: wgpu::ImageDataLayout {
                    offset: 0,
                    bytes_per_row: Some(padded),
                    rows_per_image: Some(height),
                },
            },
            wgpu::Extent3d {
                width,
                height,
                depth_or_array_layers: 1,
            },
        );
        self.queue.submit(Some(encoder.finish()));

        let slice = staging.slice(..);
        let (sender, receiver) = std::sync::mpsc::channel();
        slice.map_async(wgpu::MapMode::Read, move |result| {
            let _ = sender.send(result);
        });
        self.device.poll(wgpu::Maintain::Wait);
        receiver
            .recv()
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?
            .map_err(|e| BackendError::ReadbackFailed(e.to_string()))?;

        let mapped = slice.get_mapped_range();
        let mut pixels = Vec::with_capacity((unpadded * height) as usize);
        for row in mapped.chunks(padded as usize).take(height as usize) {
            pixels.extend_from_slice(&row[..unpadded as usize]);
        }
        drop(mapped);
        staging.unmap();
        Ok(pixels)
    }
}

impl GraphicsBackend for WgpuBackend {
    fn name(&self) -> &'static str {
        "wgpu"
    }

    fn surface_size(&self) -> (u32, u32) {
        self.textures
            .get(&self.surface_color)
            .map(|t| (t.desc.width, t.desc.height))
            .unwrap_or((0, 0))
    }

    fn resize(&mut self, width: u32, height: u32) -> BackendResult<()> {
        if (width, height) == self.surface_size() {
            return Ok(());
        }
        self.destroy_texture(TextureHandle(self.surface_color));
        self.destroy_texture(TextureHandle(self.surface_depth));
        self.create_surface(width.max(1), height.max(1))?;
        log::debug!("Resized surface to {}x{}", width, height);
        Ok(())
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        self.target = RenderTarget::Screen;
        self.viewport = Viewport::full(self.surface_size());
        self.scissor = None;
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        self.device.poll(wgpu::Maintain::Poll);
        Ok(())
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: desc.label.as_deref(),
            contents: data,
            usage: Self::convert_buffer_usage(desc.usage),
        });
        let id = self.alloc_id();
        self.buffers.insert(id, buffer);
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        if let Some(buffer) = self.buffers.remove(&buffer.0) {
            buffer.destroy();
        }
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "Invalid texture size {}x{}x{}",
                desc.width, desc.height, desc.layers
            )));
        }
        let texture = self.device.create_texture(&wgpu::TextureDescriptor {
            label: desc.label.as_deref(),
            size: wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: desc.layers,
            },
            mip_level_count: 1,
            sample_count: 1,
            dimension: wgpu::TextureDimension::D2,
            format: Self::convert_texture_format(desc.format),
            usage: Self::convert_texture_usage(desc.usage),
            view_formats: &[],
        });

        let layer_views = (0..desc.layers)
            .map(|layer| {
                texture.create_view(&wgpu::TextureViewDescriptor {
                    dimension: Some(wgpu::TextureViewDimension::D2),
                    base_array_layer: layer,
                    array_layer_count: Some(1),
                    ..Default::default()
                })
            })
            .collect();
        let sample_view = texture.create_view(&wgpu::TextureViewDescriptor {
            dimension: Some(if desc.is_cube() {
                wgpu::TextureViewDimension::Cube
            } else {
                wgpu::TextureViewDimension::D2
            }),
            array_layer_count: Some(if desc.is_cube() { 6 } else { 1 }),
            ..Default::default()
        });

        let id = self.alloc_id();
        self.textures.insert(
            id,
            TextureEntry {
                texture,
                layer_views,
                sample_view,
                desc: desc.clone(),
            },
        );
        Ok(TextureHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, layer: u32, data: &[u8]) -> BackendResult<()> {
        let entry = self
            .textures
            .get(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", texture)))?;
        let desc = &entry.desc;
        let expected = (desc.width * desc.height * 4) as usize;
        if layer >= desc.layers || data.len() != expected {
            return Err(BackendError::InvalidHandle(format!(
                "write of {} bytes into layer {} of {:?}",
                data.len(),
                layer,
                texture
            )));
        }
        self.queue.write_texture(
            wgpu::ImageCopyTexture {
                texture: &entry.texture,
                mip_level: 0,
                origin: wgpu::Origin3d { x: 0, y: 0, z: layer },
                aspect: wgpu::TextureAspect::All,
            },
            data,
            wgpu::ImageDataLayout {
                offset: 0,
                bytes_per_row: Some(desc.width * 4),
                rows_per_image: Some(desc.height),
            },
            wgpu::Extent3d {
                width: desc.width,
                height: desc.height,
                depth_or_array_layers: 1,
            },
        );
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        if let Some(entry) = self.textures.remove(&texture.0) {
            entry.texture.destroy();
        }
    }

    fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)> {
        self.textures
            .get(&texture.0)
            .map(|t| (t.desc.width, t.desc.height))
    }

    fn compile_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        let mut bindings = Vec::new();
        let vertex_wgsl =
            Self::translate_stage(&desc.label, &desc.vertex_source, naga::ShaderStage::Vertex, &mut bindings)?;
        let fragment_wgsl = Self::translate_stage(
            &desc.label,
            &desc.fragment_source,
            naga::ShaderStage::Fragment,
            &mut bindings,
        )?;

        let vertex = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(desc.label.as_str()),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(vertex_wgsl)),
        });
        let fragment = self.device.create_shader_module(wgpu::ShaderModuleDescriptor {
            label: Some(desc.label.as_str()),
            source: wgpu::ShaderSource::Wgsl(Cow::Owned(fragment_wgsl)),
        });

        let id = self.alloc_id();
        self.programs.insert(
            id,
            ProgramEntry {
                label: desc.label.clone(),
                vertex,
                fragment,
                bindings,
            },
        );
        log::debug!("Compiled program '{}'", desc.label);
        Ok(ProgramHandle(id))
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program.0);
        self.pipelines.retain(|key, _| key.program != program.0);
    }

    fn set_render_target(&mut self, target: RenderTarget) -> BackendResult<()> {
        if let RenderTarget::Texture { color, depth, layer } = target {
            let entry = self
                .textures
                .get(&color.0)
                .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", color)))?;
            if entry.desc.format.is_depth() || layer >= entry.desc.layers {
                return Err(BackendError::InvalidHandle(format!(
                    "{:?} layer {} is not a color target",
                    color, layer
                )));
            }
            if let Some(depth) = depth {
                if !self.textures.get(&depth.0).is_some_and(|d| d.desc.format.is_depth()) {
                    return Err(BackendError::InvalidHandle(format!("{:?} is not a depth target", depth)));
                }
            }
        }
        self.target = target;
        Ok(())
    }

    fn render_target(&self) -> RenderTarget {
        self.target
    }

    fn target_size(&self) -> (u32, u32) {
        self.attachments().map(|a| a.size).unwrap_or((0, 0))
    }

    fn set_viewport(&mut self, viewport: Viewport) {
        self.viewport = viewport;
    }

    fn viewport(&self) -> Viewport {
        self.viewport
    }

    fn set_scissor(&mut self, scissor: Option<Viewport>) {
        self.scissor = scissor;
    }

    fn scissor(&self) -> Option<Viewport> {
        self.scissor
    }

    fn clear(&mut self, request: &ClearRequest) -> BackendResult<()> {
        let attachments = self.attachments()?;
        let Some(scissor) = self.effective_scissor(attachments.size) else {
            return Ok(());
        };
        let key = ClearKey {
            color: attachments.color_format,
            depth: attachments.depth_format,
            write_color: request.color.is_some(),
            write_depth: request.depth.is_some() && attachments.depth.is_some(),
        };
        if !key.write_color && !key.write_depth {
            return Ok(());
        }

        let color = request.color.unwrap_or(glam::Vec4::ZERO);
        let depth = request.depth.unwrap_or(1.0);
        let params: [f32; 8] = [color.x, color.y, color.z, color.w, depth, 0.0, 0.0, 0.0];
        let buffer = self.device.create_buffer_init(&wgpu::util::BufferInitDescriptor {
            label: Some("clear params"),
            contents: bytemuck::cast_slice(&params),
            usage: wgpu::BufferUsages::UNIFORM,
        });
        self.ensure_clear_pipeline(key);
        let pipeline = self
            .clear_pipelines
            .get(&key)
            .ok_or_else(|| BackendError::PipelineCreationFailed("clear".into()))?;
        let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
            label: Some("clear"),
            layout: &pipeline.get_bind_group_layout(0),
            entries: &[wgpu::BindGroupEntry {
                binding: 0,
                resource: buffer.as_entire_binding(),
            }],
        });

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some("clear") });
        {
            let mut pass = self.begin_pass(&mut encoder, &attachments, scissor, scissor)?;
            pass.set_pipeline(pipeline);
            pass.set_bind_group(0, &bind_group, &[]);
            pass.draw(0..3, 0..1);
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn apply_state(&mut self, state: &PipelineState) {
        self.state = *state;
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> BackendResult<()> {
        let attachments = self.attachments()?;
        let Some(scissor) = self.effective_scissor(attachments.size) else {
            return Ok(());
        };
        let geometry = *call.geometry;
        let (start, count) = geometry.draw_range();
        if count == 0 {
            return Ok(());
        }

        let key = PipelineKey {
            program: call.program.0,
            color: attachments.color_format,
            depth: attachments.depth_format,
            topology: geometry.topology,
            state: self.state,
        };
        self.ensure_pipeline(key)?;
        let pipeline = self
            .pipelines
            .get(&key)
            .ok_or_else(|| BackendError::PipelineCreationFailed(format!("{:?}", call.program)))?;
        let program = self
            .programs
            .get(&call.program.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", call.program)))?;

        // Uniform buffers first so the bind group entries can borrow them.
        let buffers: HashMap<(u32, u32), wgpu::Buffer> = program
            .bindings
            .iter()
            .filter_map(|b| match &b.kind {
                BindingKind::Uniform { size, members } => Some((
                    (b.group, b.binding),
                    self.uniform_buffer(&program.label, *size, members, call),
                )),
                _ => None,
            })
            .collect();

        let max_group = program.bindings.iter().map(|b| b.group + 1).max().unwrap_or(0);
        let mut bind_groups = Vec::with_capacity(max_group as usize);
        for group in 0..max_group {
            let mut entries = Vec::new();
            for binding in program.bindings.iter().filter(|b| b.group == group) {
                let resource = match &binding.kind {
                    BindingKind::Uniform { .. } => match buffers.get(&(binding.group, binding.binding)) {
                        Some(buffer) => buffer.as_entire_binding(),
                        None => continue,
                    },
                    BindingKind::Texture { name, cube } => {
                        let fallback = if *cube { self.white_cube } else { self.white_2d };
                        let view = call
                            .sampler(name)
                            .and_then(|t| self.textures.get(&t.0))
                            .filter(|t| t.desc.is_cube() == *cube && !t.desc.format.is_depth())
                            .or_else(|| self.textures.get(&fallback))
                            .map(|t| &t.sample_view)
                            .ok_or_else(|| BackendError::InvalidHandle(format!("texture {}", name)))?;
                        wgpu::BindingResource::TextureView(view)
                    }
                    BindingKind::Sampler => wgpu::BindingResource::Sampler(&self.sampler),
                };
                entries.push(wgpu::BindGroupEntry {
                    binding: binding.binding,
                    resource,
                });
            }
            bind_groups.push(self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                label: Some(program.label.as_str()),
                layout: &pipeline.get_bind_group_layout(group),
                entries: &entries,
            }));
        }

        let vertex_buffer = self
            .buffers
            .get(&geometry.vertex_buffer.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", geometry.vertex_buffer)))?;
        let index_buffer = match geometry.index_buffer {
            Some(handle) => Some(
                self.buffers
                    .get(&handle.0)
                    .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", handle)))?,
            ),
            None => None,
        };

        let mut encoder = self
            .device
            .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(program.label.as_str()) });
        {
            let mut pass = self.begin_pass(&mut encoder, &attachments, self.viewport, scissor)?;
            pass.set_pipeline(pipeline);
            for (index, group) in bind_groups.iter().enumerate() {
                pass.set_bind_group(index as u32, group, &[]);
            }
            pass.set_vertex_buffer(0, vertex_buffer.slice(..));
            match index_buffer {
                Some(indices) => {
                    pass.set_index_buffer(indices.slice(..), wgpu::IndexFormat::Uint32);
                    pass.draw_indexed(start..start + count, 0, 0..1);
                }
                None => pass.draw(start..start + count, 0..1),
            }
        }
        self.queue.submit(Some(encoder.finish()));
        Ok(())
    }

    fn read_pixel(&mut self, x: u32, y: u32) -> BackendResult<[u8; 4]> {
        let attachments = self.attachments()?;
        if x >= attachments.size.0 || y >= attachments.size.1 {
            return Err(BackendError::ReadbackFailed(format!("Pixel ({}, {}) is outside the target", x, y)));
        }
        let pixel = self.read_region(attachments.color, attachments.color_layer, x, y, 1, 1)?;
        let mut out = [0u8; 4];
        out.copy_from_slice(&pixel[..4]);
        Ok(out)
    }
}
