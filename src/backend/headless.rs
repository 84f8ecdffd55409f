//! Headless software backend
//!
//! Rasterizes triangles, lines and points on the CPU into float color and
//! depth planes. It honours viewport, scissor, face culling, depth test and
//! write, depth compare and blending exactly like a GPU would for the
//! fixed-function part of the pipeline. Programs are parsed with naga so
//! GLSL errors surface at compile time; fragment shading is done by a Rust
//! function, either the built-in one or one supplied by the caller.

use std::collections::HashMap;

use glam::{Mat4, Vec2, Vec3, Vec4, Vec4Swizzles};

use crate::backend::traits::*;
use crate::backend::types::*;

/// Per-fragment data handed to the fragment function.
pub struct FragmentInput<'a> {
    /// Window position of the pixel center
    pub frag_coord: Vec2,
    /// Depth in [0, 1]
    pub depth: f32,
    pub world_position: Vec3,
    pub normal: Vec3,
    pub uv: Vec2,
    pub front_facing: bool,
    /// Label of the program being executed
    pub program: &'a str,
    pub call: &'a DrawCall<'a>,
    textures: &'a HashMap<u64, HeadlessTexture>,
}

impl<'a> FragmentInput<'a> {
    pub fn uniform(&self, name: &str) -> Option<&'a UniformValue> {
        self.call.uniform(name)
    }

    /// Nearest-texel sample of a bound sampler, layer 0.
    pub fn sample(&self, name: &str, uv: Vec2) -> Option<Vec4> {
        let handle = self.call.sampler(name)?;
        self.textures.get(&handle.0)?.sample(0, uv)
    }

    /// Sample a six-layer texture as a cube map along `direction`.
    ///
    /// Layers are ordered +X, -X, +Y, -Y, +Z, -Z with the first row of each
    /// face at the top.
    pub fn sample_cube(&self, name: &str, direction: Vec3) -> Option<Vec4> {
        let handle = self.call.sampler(name)?;
        let (layer, uv) = cube_face_uv(direction)?;
        self.textures.get(&handle.0)?.sample(layer, uv)
    }
}

/// Face index and face coordinates of a cube map direction.
pub fn cube_face_uv(d: Vec3) -> Option<(usize, Vec2)> {
    let a = d.abs();
    let (layer, sc, tc, ma) = if a.x >= a.y && a.x >= a.z {
        if d.x >= 0.0 {
            (0, -d.z, -d.y, a.x)
        } else {
            (1, d.z, -d.y, a.x)
        }
    } else if a.y >= a.z {
        if d.y >= 0.0 {
            (2, d.x, d.z, a.y)
        } else {
            (3, d.x, -d.z, a.y)
        }
    } else if d.z >= 0.0 {
        (4, d.x, -d.y, a.z)
    } else {
        (5, -d.x, -d.y, a.z)
    };
    if ma <= 0.0 {
        return None;
    }
    Some((layer, Vec2::new((sc / ma + 1.0) * 0.5, (tc / ma + 1.0) * 0.5)))
}

/// Fragment function: returns the color to write, or `None` to discard.
pub type FragmentShader = Box<dyn Fn(&FragmentInput<'_>) -> Option<Vec4> + Send + Sync>;

/// One entry of the draw log.
#[derive(Debug, Clone)]
pub struct DrawRecord {
    pub program: ProgramHandle,
    pub label: String,
    pub target: RenderTarget,
    pub state: PipelineState,
    pub viewport: Viewport,
    pub fragments: u32,
}

enum BufferData {
    Vertices(Vec<Vertex>),
    Indices(Vec<u32>),
    Raw(Vec<u8>),
}

struct HeadlessTexture {
    width: u32,
    height: u32,
    format: TextureFormat,
    /// One plane per layer; depth formats keep depth in `x`.
    layers: Vec<Vec<Vec4>>,
}

impl HeadlessTexture {
    fn sample(&self, layer: usize, uv: Vec2) -> Option<Vec4> {
        let plane = self.layers.get(layer)?;
        if plane.is_empty() {
            return None;
        }
        let x = (uv.x.clamp(0.0, 1.0) * self.width as f32) as u32;
        let y = (uv.y.clamp(0.0, 1.0) * self.height as f32) as u32;
        let x = x.min(self.width - 1);
        let y = y.min(self.height - 1);
        plane.get((y * self.width + x) as usize).copied()
    }
}

struct Surface {
    width: u32,
    height: u32,
    color: Vec<Vec4>,
    depth: Vec<f32>,
}

impl Surface {
    fn new(width: u32, height: u32) -> Self {
        let len = (width * height) as usize;
        Self {
            width,
            height,
            color: vec![Vec4::ZERO; len],
            depth: vec![1.0; len],
        }
    }
}

/// Color and depth planes of the bound target, taken out for the duration of a draw.
struct TargetPlanes {
    width: u32,
    height: u32,
    color: Vec<Vec4>,
    depth: Option<Vec<f32>>,
    unorm: bool,
}

#[derive(Clone, Copy)]
struct ClipVertex {
    clip: Vec4,
    world: Vec3,
    normal: Vec3,
    uv: Vec2,
}

impl ClipVertex {
    fn lerp(&self, other: &ClipVertex, t: f32) -> ClipVertex {
        ClipVertex {
            clip: self.clip.lerp(other.clip, t),
            world: self.world.lerp(other.world, t),
            normal: self.normal.lerp(other.normal, t),
            uv: self.uv.lerp(other.uv, t),
        }
    }
}

#[derive(Clone, Copy)]
struct WindowVertex {
    pos: Vec2,
    z: f32,
    inv_w: f32,
    vertex: ClipVertex,
}

/// CPU implementation of [`GraphicsBackend`].
pub struct HeadlessBackend {
    next_id: u64,
    surface: Surface,
    buffers: HashMap<u64, BufferData>,
    textures: HashMap<u64, HeadlessTexture>,
    programs: HashMap<u64, String>,
    target: RenderTarget,
    viewport: Viewport,
    scissor: Option<Viewport>,
    state: PipelineState,
    fragment: Option<FragmentShader>,
    validate_glsl: bool,
    draw_log: Vec<DrawRecord>,
    programs_compiled: u32,
    clears: u32,
}

impl HeadlessBackend {
    pub fn new(width: u32, height: u32) -> Self {
        log::info!("Creating headless backend {}x{}", width, height);
        Self {
            next_id: 1,
            surface: Surface::new(width, height),
            buffers: HashMap::new(),
            textures: HashMap::new(),
            programs: HashMap::new(),
            target: RenderTarget::Screen,
            viewport: Viewport::full((width, height)),
            scissor: None,
            state: PipelineState::baseline(),
            fragment: None,
            validate_glsl: true,
            draw_log: Vec::new(),
            programs_compiled: 0,
            clears: 0,
        }
    }

    /// Replace the built-in fragment function.
    pub fn with_fragment_shader(mut self, shader: FragmentShader) -> Self {
        self.fragment = Some(shader);
        self
    }

    pub fn set_fragment_shader(&mut self, shader: Option<FragmentShader>) {
        self.fragment = shader;
    }

    /// Skip naga parsing of program sources.
    pub fn with_glsl_validation(mut self, validate: bool) -> Self {
        self.validate_glsl = validate;
        self
    }

    pub fn draw_log(&self) -> &[DrawRecord] {
        &self.draw_log
    }

    pub fn clear_draw_log(&mut self) {
        self.draw_log.clear();
    }

    pub fn live_textures(&self) -> usize {
        self.textures.len()
    }

    pub fn live_buffers(&self) -> usize {
        self.buffers.len()
    }

    pub fn live_programs(&self) -> usize {
        self.programs.len()
    }

    /// Number of successful `compile_program` calls over the backend's lifetime.
    pub fn programs_compiled(&self) -> u32 {
        self.programs_compiled
    }

    /// Size in bytes of a live buffer.
    pub fn buffer_size(&self, buffer: BufferHandle) -> Option<usize> {
        self.buffers.get(&buffer.0).map(|data| match data {
            BufferData::Vertices(v) => v.len() * Vertex::STRIDE as usize,
            BufferData::Indices(i) => i.len() * 4,
            BufferData::Raw(bytes) => bytes.len(),
        })
    }

    pub fn clear_count(&self) -> u32 {
        self.clears
    }

    pub fn program_label(&self, program: ProgramHandle) -> Option<&str> {
        self.programs.get(&program.0).map(String::as_str)
    }

    /// Float color of a pixel on the main surface.
    pub fn surface_pixel(&self, x: u32, y: u32) -> Option<Vec4> {
        if x >= self.surface.width || y >= self.surface.height {
            return None;
        }
        self.surface
            .color
            .get((y * self.surface.width + x) as usize)
            .copied()
    }

    /// Depth of a pixel on the main surface.
    pub fn surface_depth(&self, x: u32, y: u32) -> Option<f32> {
        if x >= self.surface.width || y >= self.surface.height {
            return None;
        }
        self.surface
            .depth
            .get((y * self.surface.width + x) as usize)
            .copied()
    }

    /// Float value of a texel of a texture layer.
    pub fn texel(&self, texture: TextureHandle, layer: u32, x: u32, y: u32) -> Option<Vec4> {
        let tex = self.textures.get(&texture.0)?;
        if x >= tex.width || y >= tex.height {
            return None;
        }
        tex.layers
            .get(layer as usize)?
            .get((y * tex.width + x) as usize)
            .copied()
    }

    /// Copy the main surface into an 8-bit image.
    pub fn capture_surface(&self) -> image::RgbaImage {
        image::RgbaImage::from_fn(self.surface.width, self.surface.height, |x, y| {
            let c = self.surface.color[(y * self.surface.width + x) as usize];
            image::Rgba(quantize(c))
        })
    }

    fn alloc_id(&mut self) -> u64 {
        let id = self.next_id;
        self.next_id += 1;
        id
    }

    fn parse_stage(&self, label: &str, source: &str, stage: naga::ShaderStage) -> BackendResult<()> {
        if !self.validate_glsl {
            return Ok(());
        }
        let options = naga::front::glsl::Options::from(stage);
        let mut frontend = naga::front::glsl::Frontend::default();
        frontend.parse(&options, source).map(|_| ()).map_err(|errors| {
            BackendError::ShaderCreationFailed(format!(
                "{} ({:?} stage): {}",
                label, stage, errors
            ))
        })
    }

    fn take_target(&mut self) -> BackendResult<TargetPlanes> {
        match self.target {
            RenderTarget::Screen => Ok(TargetPlanes {
                width: self.surface.width,
                height: self.surface.height,
                color: std::mem::take(&mut self.surface.color),
                depth: Some(std::mem::take(&mut self.surface.depth)),
                unorm: true,
            }),
            RenderTarget::Texture { color, depth, layer } => {
                let tex = self
                    .textures
                    .get_mut(&color.0)
                    .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", color)))?;
                let (width, height) = (tex.width, tex.height);
                let unorm = matches!(
                    tex.format,
                    TextureFormat::Rgba8Unorm | TextureFormat::Rgba8UnormSrgb
                );
                let color_plane = tex
                    .layers
                    .get_mut(layer as usize)
                    .map(std::mem::take)
                    .ok_or_else(|| BackendError::InvalidHandle(format!("layer {}", layer)))?;
                let depth_plane = match depth {
                    Some(depth) => self
                        .textures
                        .get(&depth.0)
                        .and_then(|tex| tex.layers.get(layer as usize).or_else(|| tex.layers.first()))
                        .map(|plane| plane.iter().map(|d| d.x).collect::<Vec<f32>>()),
                    None => None,
                };
                Ok(TargetPlanes {
                    width,
                    height,
                    color: color_plane,
                    depth: depth_plane,
                    unorm,
                })
            }
        }
    }

    fn restore_target(&mut self, planes: TargetPlanes) {
        match self.target {
            RenderTarget::Screen => {
                self.surface.color = planes.color;
                if let Some(depth) = planes.depth {
                    self.surface.depth = depth;
                }
            }
            RenderTarget::Texture { color, depth, layer } => {
                if let Some(plane) = self
                    .textures
                    .get_mut(&color.0)
                    .and_then(|tex| tex.layers.get_mut(layer as usize))
                {
                    *plane = planes.color;
                }
                if let (Some(depth), Some(values)) = (depth, planes.depth) {
                    if let Some(tex) = self.textures.get_mut(&depth.0) {
                        let index = if (layer as usize) < tex.layers.len() { layer as usize } else { 0 };
                        if let Some(plane) = tex.layers.get_mut(index) {
                            for (texel, value) in plane.iter_mut().zip(values) {
                                texel.x = value;
                            }
                        }
                    }
                }
            }
        }
    }

    /// Rectangle fragments may be written to.
    fn clip_rect(&self, size: (u32, u32)) -> Viewport {
        let mut rect = Viewport::full(size).intersect(&self.viewport);
        if let Some(scissor) = self.scissor {
            rect = rect.intersect(&scissor);
        }
        rect
    }

    fn transform_vertices(&self, call: &DrawCall<'_>, vertices: &[Vertex]) -> Vec<ClipVertex> {
        let model = call
            .uniform("u_model")
            .and_then(UniformValue::as_mat4)
            .unwrap_or(Mat4::IDENTITY);
        let normal_matrix = call
            .uniform("u_normal_matrix")
            .and_then(UniformValue::as_mat4)
            .unwrap_or(model);
        let mvp = call
            .uniform("u_mvp")
            .and_then(UniformValue::as_mat4)
            .or_else(|| {
                call.uniform("u_viewprojection")
                    .and_then(UniformValue::as_mat4)
                    .map(|vp| vp * model)
            })
            .unwrap_or(model);

        vertices
            .iter()
            .map(|v| ClipVertex {
                clip: mvp * v.position.extend(1.0),
                world: (model * v.position.extend(1.0)).xyz(),
                normal: (normal_matrix * v.normal.extend(0.0)).xyz(),
                uv: v.uv,
            })
            .collect()
    }

    fn to_window(&self, v: &ClipVertex) -> WindowVertex {
        let inv_w = 1.0 / v.clip.w;
        let ndc = v.clip.xyz() * inv_w;
        let vp = self.viewport;
        WindowVertex {
            pos: Vec2::new(
                vp.x as f32 + (ndc.x * 0.5 + 0.5) * vp.width as f32,
                vp.y as f32 + (0.5 - ndc.y * 0.5) * vp.height as f32,
            ),
            z: ndc.z,
            inv_w,
            vertex: *v,
        }
    }

    fn shade(
        &self,
        call: &DrawCall<'_>,
        label: &str,
        frag_coord: Vec2,
        depth: f32,
        vertex: &ClipVertex,
        front_facing: bool,
    ) -> Option<Vec4> {
        let input = FragmentInput {
            frag_coord,
            depth,
            world_position: vertex.world,
            normal: vertex.normal.normalize_or_zero(),
            uv: vertex.uv,
            front_facing,
            program: label,
            call,
            textures: &self.textures,
        };
        match &self.fragment {
            Some(shader) => shader(&input),
            None => default_fragment(&input),
        }
    }

    /// Depth test, blend and write one fragment. Returns whether it was written.
    #[allow(clippy::too_many_arguments)]
    fn write_fragment(
        &self,
        planes: &mut TargetPlanes,
        call: &DrawCall<'_>,
        label: &str,
        x: u32,
        y: u32,
        z: f32,
        vertex: &ClipVertex,
        front_facing: bool,
    ) -> bool {
        if !(0.0..=1.0).contains(&z) {
            return false;
        }
        let index = (y * planes.width + x) as usize;
        if self.state.depth_test {
            if let Some(depth) = planes.depth.as_ref() {
                if !self.state.depth_compare.passes(z, depth[index]) {
                    return false;
                }
            }
        }
        let frag_coord = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
        let Some(src) = self.shade(call, label, frag_coord, z, vertex, front_facing) else {
            return false;
        };
        let dst = planes.color[index];
        let mut out = match self.state.blend {
            Some(blend) => blend.apply(src, dst),
            None => src,
        };
        if planes.unorm {
            out = out.clamp(Vec4::ZERO, Vec4::ONE);
        }
        planes.color[index] = out;
        if self.state.depth_test && self.state.depth_write {
            if let Some(depth) = planes.depth.as_mut() {
                depth[index] = z;
            }
        }
        true
    }

    fn raster_triangle(
        &self,
        planes: &mut TargetPlanes,
        call: &DrawCall<'_>,
        label: &str,
        tri: [ClipVertex; 3],
    ) -> u32 {
        let mut written = 0;
        for clipped in clip_near(&tri) {
            let w = clipped.map(|v| self.to_window(&v));
            let area = edge(w[0].pos, w[1].pos, w[2].pos);
            if area.abs() < f32::EPSILON {
                continue;
            }
            // Window space has y pointing down, which flips the NDC winding.
            let front_facing = match self.state.front_face {
                FrontFace::Ccw => area < 0.0,
                FrontFace::Cw => area > 0.0,
            };
            match self.state.cull_mode {
                CullMode::Back if !front_facing => continue,
                CullMode::Front if front_facing => continue,
                _ => {}
            }

            // Reorder to positive orientation so inside means every edge >= 0.
            let w = if area < 0.0 { [w[0], w[2], w[1]] } else { w };

            let rect = self.clip_rect((planes.width, planes.height));
            if rect.width == 0 || rect.height == 0 {
                continue;
            }
            let min = w[0].pos.min(w[1].pos).min(w[2].pos);
            let max = w[0].pos.max(w[1].pos).max(w[2].pos);
            let x0 = (min.x.floor().max(rect.x as f32)) as u32;
            let y0 = (min.y.floor().max(rect.y as f32)) as u32;
            let x1 = (max.x.ceil().min((rect.x + rect.width) as f32)) as u32;
            let y1 = (max.y.ceil().min((rect.y + rect.height) as f32)) as u32;
            let edges = [(1, 2), (2, 0), (0, 1)];

            for y in y0..y1 {
                for x in x0..x1 {
                    let p = Vec2::new(x as f32 + 0.5, y as f32 + 0.5);
                    let mut e = [0.0f32; 3];
                    let mut covered = true;
                    for (i, (a, b)) in edges.iter().enumerate() {
                        e[i] = canonical_edge(w[*a].pos, w[*b].pos, p);
                        if e[i] < 0.0 || (e[i] == 0.0 && !owns_edge(w[*a].pos, w[*b].pos)) {
                            covered = false;
                            break;
                        }
                    }
                    let sum = e[0] + e[1] + e[2];
                    if !covered || sum <= 0.0 {
                        continue;
                    }
                    let b = [e[0] / sum, e[1] / sum, e[2] / sum];
                    let z = b[0] * w[0].z + b[1] * w[1].z + b[2] * w[2].z;
                    let vertex = perspective_interpolate(&w, b);
                    if self.write_fragment(planes, call, label, x, y, z, &vertex, front_facing) {
                        written += 1;
                    }
                }
            }
        }
        written
    }

    fn raster_line(
        &self,
        planes: &mut TargetPlanes,
        call: &DrawCall<'_>,
        label: &str,
        a: ClipVertex,
        b: ClipVertex,
    ) -> u32 {
        if a.clip.w <= 0.0 || b.clip.w <= 0.0 {
            return 0;
        }
        let (wa, wb) = (self.to_window(&a), self.to_window(&b));
        let rect = self.clip_rect((planes.width, planes.height));
        let Some((t0, t1)) = clip_segment(wa.pos, wb.pos, &rect) else {
            return 0;
        };
        // Step only across the part of the segment inside the target.
        let span = (wb.pos - wa.pos) * (t1 - t0);
        let steps = span.abs().max_element().ceil().max(1.0) as u32;
        let mut written = 0;
        for i in 0..=steps {
            let t = t0 + (t1 - t0) * (i as f32 / steps as f32);
            let p = wa.pos.lerp(wb.pos, t);
            if p.x < 0.0 || p.y < 0.0 {
                continue;
            }
            let (x, y) = (p.x as u32, p.y as u32);
            if !rect.contains(x, y) {
                continue;
            }
            let z = wa.z + (wb.z - wa.z) * t;
            let vertex = a.lerp(&b, t);
            if self.write_fragment(planes, call, label, x, y, z, &vertex, true) {
                written += 1;
            }
        }
        written
    }

    fn raster_point(
        &self,
        planes: &mut TargetPlanes,
        call: &DrawCall<'_>,
        label: &str,
        v: ClipVertex,
    ) -> u32 {
        if v.clip.w <= 0.0 {
            return 0;
        }
        let w = self.to_window(&v);
        let rect = self.clip_rect((planes.width, planes.height));
        if w.pos.x < 0.0 || w.pos.y < 0.0 {
            return 0;
        }
        let (x, y) = (w.pos.x as u32, w.pos.y as u32);
        if !rect.contains(x, y) {
            return 0;
        }
        u32::from(self.write_fragment(planes, call, label, x, y, w.z, &v, true))
    }
}

/// Liang-Barsky clip of a window-space segment against `rect`. Returns the
/// parameter range of the visible part.
fn clip_segment(a: Vec2, b: Vec2, rect: &Viewport) -> Option<(f32, f32)> {
    let d = b - a;
    let min = Vec2::new(rect.x as f32, rect.y as f32);
    let max = min + Vec2::new(rect.width as f32, rect.height as f32);
    let (mut t0, mut t1) = (0.0_f32, 1.0_f32);
    for (p, q) in [
        (-d.x, a.x - min.x),
        (d.x, max.x - a.x),
        (-d.y, a.y - min.y),
        (d.y, max.y - a.y),
    ] {
        if p == 0.0 {
            if q < 0.0 {
                return None;
            }
        } else if p < 0.0 {
            t0 = t0.max(q / p);
        } else {
            t1 = t1.min(q / p);
        }
    }
    (t0 <= t1).then_some((t0, t1))
}

impl GraphicsBackend for HeadlessBackend {
    fn name(&self) -> &'static str {
        "headless"
    }

    fn surface_size(&self) -> (u32, u32) {
        (self.surface.width, self.surface.height)
    }

    fn resize(&mut self, width: u32, height: u32) -> BackendResult<()> {
        log::debug!("Resizing headless surface to {}x{}", width, height);
        self.surface = Surface::new(width, height);
        Ok(())
    }

    fn begin_frame(&mut self) -> BackendResult<()> {
        self.target = RenderTarget::Screen;
        self.viewport = Viewport::full(self.surface_size());
        self.scissor = None;
        Ok(())
    }

    fn end_frame(&mut self) -> BackendResult<()> {
        Ok(())
    }

    fn create_buffer_init(&mut self, desc: &BufferDescriptor, data: &[u8]) -> BackendResult<BufferHandle> {
        let contents = if desc.usage.contains(BufferUsage::VERTEX) {
            if data.len() % Vertex::STRIDE as usize != 0 {
                return Err(BackendError::BufferCreationFailed(format!(
                    "{:?}: {} bytes is not a whole number of vertices",
                    desc.label, data.len()
                )));
            }
            BufferData::Vertices(
                data.chunks_exact(Vertex::STRIDE as usize)
                    .map(bytemuck::pod_read_unaligned::<Vertex>)
                    .collect(),
            )
        } else if desc.usage.contains(BufferUsage::INDEX) {
            BufferData::Indices(
                data.chunks_exact(4)
                    .map(bytemuck::pod_read_unaligned::<u32>)
                    .collect(),
            )
        } else {
            BufferData::Raw(data.to_vec())
        };
        let id = self.alloc_id();
        log::trace!("Created buffer {} ({:?}, {} bytes)", id, desc.label, data.len());
        self.buffers.insert(id, contents);
        Ok(BufferHandle(id))
    }

    fn destroy_buffer(&mut self, buffer: BufferHandle) {
        log::trace!("Destroying buffer {}", buffer.0);
        self.buffers.remove(&buffer.0);
    }

    fn create_texture(&mut self, desc: &TextureDescriptor) -> BackendResult<TextureHandle> {
        if desc.width == 0 || desc.height == 0 || desc.layers == 0 {
            return Err(BackendError::TextureCreationFailed(format!(
                "{:?}: zero-sized texture",
                desc.label
            )));
        }
        let len = (desc.width * desc.height) as usize;
        let fill = if desc.format.is_depth() {
            Vec4::ONE
        } else {
            Vec4::ZERO
        };
        let id = self.alloc_id();
        log::trace!(
            "Created texture {} ({:?}, {}x{}x{}, {:?})",
            id, desc.label, desc.width, desc.height, desc.layers, desc.format
        );
        self.textures.insert(
            id,
            HeadlessTexture {
                width: desc.width,
                height: desc.height,
                format: desc.format,
                layers: vec![vec![fill; len]; desc.layers as usize],
            },
        );
        Ok(TextureHandle(id))
    }

    fn write_texture(&mut self, texture: TextureHandle, layer: u32, data: &[u8]) -> BackendResult<()> {
        let tex = self
            .textures
            .get_mut(&texture.0)
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", texture)))?;
        let plane = tex
            .layers
            .get_mut(layer as usize)
            .ok_or_else(|| BackendError::InvalidHandle(format!("layer {}", layer)))?;
        for (texel, rgba) in plane.iter_mut().zip(data.chunks_exact(4)) {
            *texel = Vec4::new(
                rgba[0] as f32 / 255.0,
                rgba[1] as f32 / 255.0,
                rgba[2] as f32 / 255.0,
                rgba[3] as f32 / 255.0,
            );
        }
        Ok(())
    }

    fn destroy_texture(&mut self, texture: TextureHandle) {
        log::trace!("Destroying texture {}", texture.0);
        self.textures.remove(&texture.0);
    }

    fn texture_size(&self, texture: TextureHandle) -> Option<(u32, u32)> {
        self.textures.get(&texture.0).map(|t| (t.width, t.height))
    }

    fn compile_program(&mut self, desc: &ProgramDescriptor) -> BackendResult<ProgramHandle> {
        self.parse_stage(&desc.label, &desc.vertex_source, naga::ShaderStage::Vertex)?;
        self.parse_stage(&desc.label, &desc.fragment_source, naga::ShaderStage::Fragment)?;
        let id = self.alloc_id();
        log::debug!("Compiled program {} ({})", id, desc.label);
        self.programs.insert(id, desc.label.clone());
        self.programs_compiled += 1;
        Ok(ProgramHandle(id))
    }

    fn destroy_program(&mut self, program: ProgramHandle) {
        self.programs.remove(&program.0);
    }

    fn set_render_target(&mut self, target: RenderTarget) -> BackendResult<()> {
        if let RenderTarget::Texture { color, depth, layer } = target {
            let tex = self
                .textures
                .get(&color.0)
                .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", color)))?;
            if layer as usize >= tex.layers.len() {
                return Err(BackendError::InvalidHandle(format!(
                    "layer {} of {:?}",
                    layer, color
                )));
            }
            if let Some(depth) = depth {
                let depth_tex = self
                    .textures
                    .get(&depth.0)
                    .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", depth)))?;
                if !depth_tex.format.is_depth() || (depth_tex.width, depth_tex.height) != (tex.width, tex.height) {
                    return Err(BackendError::InvalidHandle(format!(
                        "{:?} is not a matching depth attachment",
                        depth
                    )));
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
        match self.target {
            RenderTarget::Screen => self.surface_size(),
            RenderTarget::Texture { color, .. } => {
                self.texture_size(color).unwrap_or((0, 0))
            }
        }
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
        let mut planes = self.take_target()?;
        let mut rect = Viewport::full((planes.width, planes.height));
        if let Some(scissor) = self.scissor {
            rect = rect.intersect(&scissor);
        }
        for y in rect.y..rect.y + rect.height {
            for x in rect.x..rect.x + rect.width {
                let index = (y * planes.width + x) as usize;
                if let Some(color) = request.color {
                    planes.color[index] = color;
                }
                if let (Some(value), Some(depth)) = (request.depth, planes.depth.as_mut()) {
                    depth[index] = value;
                }
            }
        }
        self.restore_target(planes);
        self.clears += 1;
        Ok(())
    }

    fn apply_state(&mut self, state: &PipelineState) {
        self.state = *state;
    }

    fn state(&self) -> PipelineState {
        self.state
    }

    fn draw(&mut self, call: &DrawCall<'_>) -> BackendResult<()> {
        let label = self
            .programs
            .get(&call.program.0)
            .cloned()
            .ok_or_else(|| BackendError::InvalidHandle(format!("{:?}", call.program)))?;
        let geometry = call.geometry;
        let vertices = match self.buffers.get(&geometry.vertex_buffer.0) {
            Some(BufferData::Vertices(v)) => v,
            _ => {
                return Err(BackendError::InvalidHandle(format!(
                    "{:?} is not a vertex buffer",
                    geometry.vertex_buffer
                )))
            }
        };
        let transformed = self.transform_vertices(call, vertices);
        let (start, count) = geometry.draw_range();
        let elements: Vec<u32> = match geometry.index_buffer {
            Some(index_buffer) => match self.buffers.get(&index_buffer.0) {
                Some(BufferData::Indices(indices)) => indices
                    .iter()
                    .skip(start as usize)
                    .take(count as usize)
                    .copied()
                    .collect(),
                _ => {
                    return Err(BackendError::InvalidHandle(format!(
                        "{:?} is not an index buffer",
                        index_buffer
                    )))
                }
            },
            None => (start..start + count).collect(),
        };
        let fetch = |i: u32| transformed.get(i as usize).copied();

        let mut planes = self.take_target()?;
        let mut fragments = 0;
        match geometry.topology {
            PrimitiveTopology::TriangleList => {
                for tri in elements.chunks_exact(3) {
                    if let (Some(a), Some(b), Some(c)) = (fetch(tri[0]), fetch(tri[1]), fetch(tri[2])) {
                        fragments += self.raster_triangle(&mut planes, call, &label, [a, b, c]);
                    }
                }
            }
            PrimitiveTopology::LineList => {
                for line in elements.chunks_exact(2) {
                    if let (Some(a), Some(b)) = (fetch(line[0]), fetch(line[1])) {
                        fragments += self.raster_line(&mut planes, call, &label, a, b);
                    }
                }
            }
            PrimitiveTopology::PointList => {
                for &i in &elements {
                    if let Some(v) = fetch(i) {
                        fragments += self.raster_point(&mut planes, call, &label, v);
                    }
                }
            }
        }
        self.restore_target(planes);

        log::trace!("Draw {} wrote {} fragments", label, fragments);
        self.draw_log.push(DrawRecord {
            program: call.program,
            label,
            target: self.target,
            state: self.state,
            viewport: self.viewport,
            fragments,
        });
        Ok(())
    }

    fn read_pixel(&mut self, x: u32, y: u32) -> BackendResult<[u8; 4]> {
        let (width, height) = self.target_size();
        if x >= width || y >= height {
            return Err(BackendError::ReadbackFailed(format!(
                "pixel ({}, {}) outside {}x{} target",
                x, y, width, height
            )));
        }
        let color = match self.target {
            RenderTarget::Screen => self.surface_pixel(x, y),
            RenderTarget::Texture { color, layer, .. } => self.texel(color, layer, x, y),
        };
        color
            .map(quantize)
            .ok_or_else(|| BackendError::ReadbackFailed(format!("pixel ({}, {})", x, y)))
    }
}

/// Built-in fragment function, keyed on the program label.
///
/// `shadow*` programs write their depth (linear light distance for cube
/// faces). Programs with a `u_color` uniform write it unchanged. Anything
/// else writes the material color modulated by `u_color_texture` and
/// honours `u_alpha_cutoff`.
pub fn default_fragment(input: &FragmentInput<'_>) -> Option<Vec4> {
    if input.program.starts_with("shadow") {
        let depth = if input.program.contains("SHADOW_CUBE") {
            let light = input
                .uniform("u_light_position")
                .and_then(UniformValue::as_vec4)
                .unwrap_or(Vec4::ZERO);
            let params = input
                .uniform("u_shadow_params")
                .and_then(UniformValue::as_vec4)
                .unwrap_or(Vec4::new(0.0, 0.0, 1.0, 1.0));
            let range = (params.z - params.y).max(f32::EPSILON);
            (input.world_position.distance(light.xyz()) - params.y) / range
        } else {
            input.depth
        };
        return Some(Vec4::new(depth, depth, depth, 1.0));
    }
    if let Some(color) = input.uniform("u_color").and_then(UniformValue::as_vec4) {
        return Some(color);
    }
    let mut color = input
        .uniform("u_material_color")
        .and_then(UniformValue::as_vec4)
        .unwrap_or(Vec4::ONE);
    if let Some(texel) = input.sample("u_color_texture", input.uv) {
        color *= texel;
    }
    if let Some(cutoff) = input.uniform("u_alpha_cutoff").and_then(UniformValue::as_float) {
        if color.w < cutoff {
            return None;
        }
    }
    Some(color)
}

fn quantize(color: Vec4) -> [u8; 4] {
    let c = color.clamp(Vec4::ZERO, Vec4::ONE) * 255.0;
    [
        c.x.round() as u8,
        c.y.round() as u8,
        c.z.round() as u8,
        c.w.round() as u8,
    ]
}

fn edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    (b.x - a.x) * (p.y - a.y) - (b.y - a.y) * (p.x - a.x)
}

/// Edge function evaluated in a fixed vertex order, so the two triangles
/// sharing an edge get exactly opposite values.
fn canonical_edge(a: Vec2, b: Vec2, p: Vec2) -> f32 {
    if (a.x, a.y) <= (b.x, b.y) {
        edge(a, b, p)
    } else {
        -edge(b, a, p)
    }
}

/// Tie-break for pixel centers exactly on an edge: exactly one of the two
/// directions of an edge owns it.
fn owns_edge(a: Vec2, b: Vec2) -> bool {
    let d = b - a;
    d.y < 0.0 || (d.y == 0.0 && d.x > 0.0)
}

fn perspective_interpolate(w: &[WindowVertex; 3], b: [f32; 3]) -> ClipVertex {
    let inv_w = b[0] * w[0].inv_w + b[1] * w[1].inv_w + b[2] * w[2].inv_w;
    let weight = |i: usize| b[i] * w[i].inv_w / inv_w;
    let (k0, k1, k2) = (weight(0), weight(1), weight(2));
    let (v0, v1, v2) = (&w[0].vertex, &w[1].vertex, &w[2].vertex);
    ClipVertex {
        clip: v0.clip * k0 + v1.clip * k1 + v2.clip * k2,
        world: v0.world * k0 + v1.world * k1 + v2.world * k2,
        normal: v0.normal * k0 + v1.normal * k1 + v2.normal * k2,
        uv: v0.uv * k0 + v1.uv * k1 + v2.uv * k2,
    }
}

/// Clip a triangle against the `z >= 0` plane of clip space. Returns a fan
/// of zero, one or two triangles.
fn clip_near(tri: &[ClipVertex; 3]) -> Vec<[ClipVertex; 3]> {
    let inside = |v: &ClipVertex| v.clip.z >= 0.0 && v.clip.w > 0.0;
    if tri.iter().all(inside) {
        return vec![*tri];
    }
    let mut polygon: Vec<ClipVertex> = Vec::with_capacity(4);
    for i in 0..3 {
        let current = tri[i];
        let next = tri[(i + 1) % 3];
        let current_in = inside(&current);
        let next_in = inside(&next);
        if current_in {
            polygon.push(current);
        }
        if current_in != next_in {
            let t = current.clip.z / (current.clip.z - next.clip.z);
            let mut v = current.lerp(&next, t.clamp(0.0, 1.0));
            v.clip.z = v.clip.z.max(0.0);
            if v.clip.w > 0.0 {
                polygon.push(v);
            }
        }
    }
    (1..polygon.len().saturating_sub(1))
        .map(|i| [polygon[0], polygon[i], polygon[i + 1]])
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::traits::BufferHandle;

    fn quad_backend() -> (HeadlessBackend, GeometryRef) {
        let mut backend = HeadlessBackend::new(8, 8).with_glsl_validation(false);
        let vertices = [
            Vertex::new(Vec3::new(-1.0, -1.0, 0.5), Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::new(1.0, -1.0, 0.5), Vec3::Z, Vec2::X),
            Vertex::new(Vec3::new(1.0, 1.0, 0.5), Vec3::Z, Vec2::ONE),
            Vertex::new(Vec3::new(-1.0, 1.0, 0.5), Vec3::Z, Vec2::Y),
        ];
        let indices: [u32; 6] = [0, 1, 2, 0, 2, 3];
        let vb = backend
            .create_buffer_init(&BufferDescriptor::vertex("quad"), bytemuck::cast_slice(&vertices))
            .unwrap();
        let ib = backend
            .create_buffer_init(&BufferDescriptor::index("quad"), bytemuck::cast_slice(&indices))
            .unwrap();
        let geometry = GeometryRef {
            vertex_buffer: vb,
            vertex_count: 4,
            index_buffer: Some(ib),
            index_count: 6,
            topology: PrimitiveTopology::TriangleList,
            range: None,
        };
        (backend, geometry)
    }

    fn program(backend: &mut HeadlessBackend) -> ProgramHandle {
        backend
            .compile_program(&ProgramDescriptor {
                label: "test".into(),
                vertex_source: String::new(),
                fragment_source: String::new(),
            })
            .unwrap()
    }

    fn color_uniforms(color: Vec4) -> UniformMap {
        let mut map = UniformMap::new();
        map.insert("u_color".into(), UniformValue::Vec4(color));
        map
    }

    #[test]
    fn fullscreen_quad_covers_surface() {
        let (mut backend, geometry) = quad_backend();
        let program = program(&mut backend);
        let uniforms = color_uniforms(Vec4::new(1.0, 0.0, 0.0, 1.0));
        let layers = [&uniforms];
        backend
            .draw(&DrawCall { program, geometry: &geometry, uniforms: &layers, samplers: &[] })
            .unwrap();
        assert_eq!(backend.read_pixel(0, 0).unwrap(), [255, 0, 0, 255]);
        assert_eq!(backend.read_pixel(7, 7).unwrap(), [255, 0, 0, 255]);
        assert_eq!(backend.draw_log()[0].fragments, 64);
    }

    #[test]
    fn back_faces_are_culled() {
        let (mut backend, mut geometry) = quad_backend();
        let reversed: [u32; 6] = [0, 2, 1, 0, 3, 2];
        geometry.index_buffer = Some(
            backend
                .create_buffer_init(&BufferDescriptor::index("reversed"), bytemuck::cast_slice(&reversed))
                .unwrap(),
        );
        let program = program(&mut backend);
        let uniforms = color_uniforms(Vec4::ONE);
        let layers = [&uniforms];
        backend
            .draw(&DrawCall { program, geometry: &geometry, uniforms: &layers, samplers: &[] })
            .unwrap();
        assert_eq!(backend.draw_log()[0].fragments, 0);

        backend.apply_state(&PipelineState { cull_mode: CullMode::None, ..PipelineState::baseline() });
        backend
            .draw(&DrawCall { program, geometry: &geometry, uniforms: &layers, samplers: &[] })
            .unwrap();
        assert_eq!(backend.draw_log()[1].fragments, 64);
    }

    #[test]
    fn scissored_clear_stays_inside() {
        let (mut backend, _) = quad_backend();
        backend.set_scissor(Some(Viewport::new(0, 0, 4, 8)));
        backend
            .clear(&ClearRequest { color: Some(Vec4::ONE), depth: Some(1.0) })
            .unwrap();
        assert_eq!(backend.read_pixel(3, 3).unwrap(), [255, 255, 255, 255]);
        assert_eq!(backend.read_pixel(4, 3).unwrap(), [0, 0, 0, 0]);
    }

    #[test]
    fn less_equal_allows_second_pass() {
        let (mut backend, geometry) = quad_backend();
        let program = program(&mut backend);
        let first = color_uniforms(Vec4::new(0.25, 0.0, 0.0, 1.0));
        let layers = [&first];
        backend
            .draw(&DrawCall { program, geometry: &geometry, uniforms: &layers, samplers: &[] })
            .unwrap();

        backend.apply_state(&PipelineState {
            depth_write: false,
            depth_compare: CompareFunction::LessEqual,
            blend: Some(BlendState::additive()),
            ..PipelineState::baseline()
        });
        let second = color_uniforms(Vec4::new(0.5, 0.0, 0.0, 1.0));
        let layers = [&second];
        backend
            .draw(&DrawCall { program, geometry: &geometry, uniforms: &layers, samplers: &[] })
            .unwrap();
        let pixel = backend.surface_pixel(4, 4).unwrap();
        assert!((pixel.x - 0.75).abs() < 1e-6);
    }

    #[test]
    fn far_line_is_clipped_to_target() {
        let mut backend = HeadlessBackend::new(8, 8).with_glsl_validation(false);
        let vertices = [
            Vertex::new(Vec3::new(-1.0, 0.0, 0.5), Vec3::Z, Vec2::ZERO),
            Vertex::new(Vec3::new(1.0e9, 0.0, 0.5), Vec3::Z, Vec2::X),
        ];
        let vb = backend
            .create_buffer_init(&BufferDescriptor::vertex("line"), bytemuck::cast_slice(&vertices))
            .unwrap();
        let geometry = GeometryRef {
            vertex_buffer: vb,
            vertex_count: 2,
            index_buffer: None,
            index_count: 0,
            topology: PrimitiveTopology::LineList,
            range: None,
        };
        let program = program(&mut backend);
        let uniforms = color_uniforms(Vec4::ONE);
        let layers = [&uniforms];
        backend
            .draw(&DrawCall { program, geometry: &geometry, uniforms: &layers, samplers: &[] })
            .unwrap();

        let fragments = backend.draw_log()[0].fragments;
        assert!((1..=8).contains(&fragments), "wrote {fragments} fragments");
        assert_eq!(backend.read_pixel(0, 4).unwrap(), [255, 255, 255, 255]);
        assert_eq!(backend.read_pixel(7, 4).unwrap(), [255, 255, 255, 255]);
    }

    #[test]
    fn clip_segment_rejects_outside_lines() {
        let rect = Viewport::new(0, 0, 8, 8);
        assert_eq!(clip_segment(Vec2::new(-4.0, 2.0), Vec2::new(-1.0, 6.0), &rect), None);
        let (t0, t1) = clip_segment(Vec2::new(-8.0, 4.0), Vec2::new(16.0, 4.0), &rect).unwrap();
        assert!((t0 - 1.0 / 3.0).abs() < 1e-6);
        assert!((t1 - 2.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn invalid_glsl_fails_to_compile() {
        let mut backend = HeadlessBackend::new(4, 4);
        let result = backend.compile_program(&ProgramDescriptor {
            label: "broken".into(),
            vertex_source: "#version 450\nvoid main() { this is not glsl }".into(),
            fragment_source: "#version 450\nvoid main() {}".into(),
        });
        assert!(matches!(result, Err(BackendError::ShaderCreationFailed(_))));
    }

    #[test]
    fn missing_buffer_is_an_error() {
        let mut backend = HeadlessBackend::new(4, 4).with_glsl_validation(false);
        let program = program(&mut backend);
        let geometry = GeometryRef {
            vertex_buffer: BufferHandle(999),
            vertex_count: 3,
            index_buffer: None,
            index_count: 0,
            topology: PrimitiveTopology::TriangleList,
            range: None,
        };
        let result = backend.draw(&DrawCall { program, geometry: &geometry, uniforms: &[], samplers: &[] });
        assert!(result.is_err());
    }
}
