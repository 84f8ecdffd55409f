//! Frame renderer
//!
//! [`Renderer`] owns the backend and every pipeline stage. A call to
//! [`Renderer::render`] collects the scene, renders shadow maps, prepares
//! lights and then renders each camera:
//!
//! 1. bind the camera viewport and clear it (scissored)
//! 2. cull and sort the instances
//! 3. submit each instance, one draw per light for multipass programs
//!
//! Pipeline state is reset to [`PipelineState::baseline`] before and after
//! every instance loop.

use std::collections::HashSet;

use glam::{Mat4, Vec3, Vec4};

use crate::backend::{
    ClearRequest, CullMode, DrawCall, GeometryRef, GraphicsBackend, PipelineState, RenderTarget,
    SamplerMap, TextureDescriptor, TextureFormat, TextureHandle, UniformMap, UniformValue, Viewport,
};
use crate::config::{RenderOptions, RendererConfig};
use crate::error::{RenderError, RenderResult};
use crate::pipeline::bounds::Ray;
use crate::pipeline::collector::SceneDataCollector;
use crate::pipeline::inputs::{names, ShaderInputs};
use crate::pipeline::instance::{InstanceId, RenderInstance};
use crate::pipeline::lighting::LightPassController;
use crate::pipeline::picking::{decode_index, encode_index, MAX_PICKABLE};
use crate::pipeline::shadows::ShadowMaps;
use crate::pipeline::visibility::{Containment, Frustum, VisibilityStage};
use crate::resources::{GpuMesh, Mesh, ResourceManager, ResourceStore};
use crate::scene::{Camera, Light, LightKind, NodeId, Scene};
use crate::shader::library::{PICKING_SHADER, SCREEN_QUAD_SHADER, SHADOW_SHADER};
use crate::shader::{CacheStats, MacroSet, ShaderCache, ShaderComposer, ShaderMacro};

/// Counters of one [`Renderer::render`] call.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FrameStats {
    pub cameras: usize,
    pub instances_collected: usize,
    pub visible: usize,
    pub culled: usize,
    /// Instances that issued at least one main-pass draw.
    pub rendered: usize,
    pub main_draws: u32,
    pub shadow_draws: u32,
    pub picking_draws: u32,
    pub shader_misses: u64,
}

/// Data shared by every camera of one frame.
pub struct FrameContext<'a> {
    pub scene: &'a Scene,
    pub resources: &'a dyn ResourceManager,
    pub options: &'a RenderOptions,
}

/// One hit of [`Renderer::raycast`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RaycastHit {
    pub instance: InstanceId,
    pub node: Option<NodeId>,
    pub point: Vec3,
    pub distance: f32,
}

/// One hit of [`Renderer::raycast_colliders`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColliderHit {
    pub node: NodeId,
    pub point: Vec3,
    pub distance: f32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
enum Warning {
    MissingWireframe,
}

/// Buffers reused by every draw. Each one is cleared by its user before use.
#[derive(Default)]
struct Scratch {
    order: Vec<usize>,
    visible_any: Vec<bool>,
    light_indices: Vec<usize>,
    macros: MacroSet,
    pass_macros: MacroSet,
    material: ShaderInputs,
    frame: UniformMap,
    per_draw: UniformMap,
}

#[derive(Clone, Copy)]
struct PickingTarget {
    color: TextureHandle,
    depth: TextureHandle,
    size: (u32, u32),
}

/// Per-camera values fixed for the whole instance loop.
struct CameraPass<'a> {
    frame: &'a FrameContext<'a>,
    view_projection: Mat4,
    viewport: Viewport,
}

/// Forward renderer over a [`GraphicsBackend`].
pub struct Renderer<B: GraphicsBackend> {
    backend: B,
    config: RendererConfig,
    cache: ShaderCache,
    collector: SceneDataCollector,
    visibility: VisibilityStage,
    lights: LightPassController,
    shadows: ShadowMaps,
    scratch: Scratch,
    warned: HashSet<(InstanceId, Warning)>,
    submission_order: Vec<InstanceId>,
    picking: Option<PickingTarget>,
    screen_quad: Option<GpuMesh>,
    nested_depth: usize,
    stats: FrameStats,
}

impl<B: GraphicsBackend> Renderer<B> {
    pub fn new(backend: B, config: RendererConfig) -> Self {
        Self::with_composer(backend, config, ShaderComposer::with_standard_library())
    }

    /// Renderer compiling programs from `composer`.
    pub fn with_composer(backend: B, config: RendererConfig, composer: ShaderComposer) -> Self {
        log::info!("Creating renderer on {} backend", backend.name());
        Self {
            cache: ShaderCache::new(composer),
            collector: SceneDataCollector::new(config.collect_interval),
            visibility: VisibilityStage::new(),
            lights: LightPassController::new(config.max_lights_per_instance),
            shadows: ShadowMaps::new(config.shadow_epsilon),
            scratch: Scratch::default(),
            warned: HashSet::new(),
            submission_order: Vec::new(),
            picking: None,
            screen_quad: None,
            nested_depth: 0,
            stats: FrameStats::default(),
            backend,
            config,
        }
    }

    pub fn backend(&self) -> &B {
        &self.backend
    }

    pub fn backend_mut(&mut self) -> &mut B {
        &mut self.backend
    }

    pub fn config(&self) -> &RendererConfig {
        &self.config
    }

    /// Empty resource store following this renderer's upload settings.
    pub fn create_resource_store(&self) -> ResourceStore {
        ResourceStore::new().with_wireframe_indices(self.config.build_wireframe_indices)
    }

    pub fn shader_cache(&self) -> &ShaderCache {
        &self.cache
    }

    pub fn cache_stats(&self) -> CacheStats {
        self.cache.stats()
    }

    /// Shared source registry; edit it and call
    /// [`reload_shaders`](Self::reload_shaders) to pick up the changes.
    pub fn composer(&self) -> &ShaderComposer {
        self.cache.composer()
    }

    pub fn collector(&self) -> &SceneDataCollector {
        &self.collector
    }

    pub fn shadow_maps(&self) -> &ShadowMaps {
        &self.shadows
    }

    pub fn light_controller(&self) -> &LightPassController {
        &self.lights
    }

    /// Instance order of the last main pass.
    pub fn submission_order(&self) -> &[InstanceId] {
        &self.submission_order
    }

    pub fn last_stats(&self) -> FrameStats {
        self.stats
    }

    /// Drop every compiled program so the next frame recompiles from the
    /// current sources.
    pub fn reload_shaders(&mut self) {
        log::info!("Reloading shaders");
        self.cache.clear(&mut self.backend);
    }

    /// Release every backend object the renderer owns.
    pub fn release(&mut self) {
        self.shadows.release_all(&mut self.backend);
        self.cache.clear(&mut self.backend);
        if let Some(target) = self.picking.take() {
            self.backend.destroy_texture(target.color);
            self.backend.destroy_texture(target.depth);
        }
        if let Some(quad) = self.screen_quad.take() {
            quad.destroy(&mut self.backend);
        }
    }

    /// Render every enabled camera of `scene`, or only the one with the
    /// highest priority when `render_all_cameras` is off.
    ///
    /// A scene without cameras renders nothing and is not an error.
    pub fn render(
        &mut self,
        scene: &mut Scene,
        resources: &dyn ResourceManager,
        options: &RenderOptions,
    ) -> RenderResult<FrameStats> {
        self.stats = FrameStats::default();
        let misses = self.cache.stats().misses;
        if self.cache.is_stale() {
            log::debug!("Shader sources changed since the last reload, cached programs are kept");
        }

        self.collector.collect(scene, resources);
        self.stats.instances_collected = self.collector.instances.len();

        let mut cameras: Vec<Camera> = self
            .collector
            .cameras
            .iter()
            .filter(|c| c.enabled)
            .cloned()
            .collect();
        cameras.sort_by_key(|c| std::cmp::Reverse(c.priority));
        if !options.render_all_cameras {
            cameras.truncate(1);
        }
        if cameras.is_empty() {
            log::debug!("No camera available, skipping frame");
            return Ok(self.stats);
        }

        self.backend.begin_frame()?;
        let result = self.render_cameras(scene, resources, options, &mut cameras);
        let ended = self.backend.end_frame();
        result?;
        ended?;

        self.stats.shader_misses = self.cache.stats().misses - misses;
        log::debug!(
            "Frame: {} cameras, {} visible, {} culled, {} draws, {} shadow draws",
            self.stats.cameras,
            self.stats.visible,
            self.stats.culled,
            self.stats.main_draws,
            self.stats.shadow_draws
        );
        Ok(self.stats)
    }

    fn render_cameras(
        &mut self,
        scene: &Scene,
        resources: &dyn ResourceManager,
        options: &RenderOptions,
        cameras: &mut [Camera],
    ) -> RenderResult<()> {
        let size = self.backend.target_size();
        for camera in cameras.iter_mut() {
            let viewport = Viewport::from_normalized(camera.viewport, size);
            if viewport.width > 0 && viewport.height > 0 {
                camera.set_aspect(viewport.aspect());
            }
        }
        self.prepare_lights(resources, options, cameras)?;
        let frame = FrameContext {
            scene,
            resources,
            options,
        };
        for camera in cameras.iter_mut() {
            self.render_frame(camera, &frame)?;
            self.stats.cameras += 1;
        }
        Ok(())
    }

    /// Render shadow maps and build the per-light data for this frame.
    fn prepare_lights(
        &mut self,
        resources: &dyn ResourceManager,
        options: &RenderOptions,
        cameras: &mut [Camera],
    ) -> RenderResult<()> {
        if options.shadows_active() {
            self.shadows
                .update_state(&mut self.backend, &self.collector.lights, options.update_shadowmaps)?;
            self.mark_visible_in_any_camera(cameras, options);

            let visible = std::mem::take(&mut self.scratch.visible_any);
            let mut result = Ok(());
            for light in &self.collector.lights {
                let instances = &self.collector.instances;
                let mut submission = Submission {
                    cache: &mut self.cache,
                    scratch: &mut self.scratch,
                    warned: &mut self.warned,
                    stats: &mut self.stats,
                };
                let rendered = self.shadows.render(&mut self.backend, light, |backend, camera| {
                    submission.draw_shadow_casters(backend, instances, &visible, light, camera, resources)
                });
                if let Err(err) = rendered {
                    result = Err(err);
                    break;
                }
            }
            self.scratch.visible_any = visible;
            result?;
        }
        self.lights
            .prepare(&self.collector.lights, &self.shadows, resources, options);
        Ok(())
    }

    fn mark_visible_in_any_camera(&mut self, cameras: &mut [Camera], options: &RenderOptions) {
        let frusta: Vec<Frustum> = cameras.iter_mut().map(|c| c.frustum()).collect();
        let visible = &mut self.scratch.visible_any;
        visible.clear();
        visible.extend(self.collector.instances.iter().map(|instance| {
            !options.frustum_culling_enabled
                || instance.flags.ignore_frustum_culling
                || instance.flags.ignore_view_projection
                || frusta
                    .iter()
                    .any(|f| f.test_aabb(&instance.world_aabb()) != Containment::Outside)
        }));
    }

    /// Render one camera into the bound target with the collected
    /// instances and the prepared lights.
    pub fn render_frame(&mut self, camera: &mut Camera, frame: &FrameContext<'_>) -> RenderResult<()> {
        let viewport = Viewport::from_normalized(camera.viewport, self.backend.target_size());
        if viewport.width == 0 || viewport.height == 0 {
            log::debug!("Camera viewport is empty, skipping");
            return Ok(());
        }
        camera.set_aspect(viewport.aspect());
        let view_projection = camera.view_projection();
        let eye = camera.position();
        let needs_quad = self
            .collector
            .instances
            .iter()
            .any(|i| i.flags.render_as_screen_space_2d);
        if needs_quad && self.screen_quad.is_none() {
            self.screen_quad = Some(GpuMesh::upload(&mut self.backend, Mesh::quad(), false)?);
        }

        let saved_scissor = self.backend.scissor();
        self.backend.set_viewport(viewport);
        self.backend.set_scissor(Some(viewport));
        if camera.clear.color || camera.clear.depth {
            let background = camera
                .background
                .or(frame.scene.settings.background)
                .unwrap_or(self.config.default_background);
            self.backend.clear(&ClearRequest {
                color: camera.clear.color.then_some(background),
                depth: camera.clear.depth.then_some(1.0),
            })?;
        }

        let mut order = std::mem::take(&mut self.scratch.order);
        let visibility = self.visibility.process(
            &mut self.collector.instances,
            &view_projection,
            eye,
            frame.options,
            &mut order,
        );
        self.stats.visible += visibility.visible;
        self.stats.culled += visibility.culled;
        self.submission_order.clear();
        self.submission_order
            .extend(order.iter().map(|i| self.collector.instances[*i].id));

        let frame_uniforms = &mut self.scratch.frame;
        frame_uniforms.clear();
        frame_uniforms.insert(names::VIEW_PROJECTION.into(), view_projection.into());
        frame_uniforms.insert(names::CAMERA_POSITION.into(), eye.extend(1.0).into());
        frame_uniforms.insert(
            names::AMBIENT_LIGHT.into(),
            frame.scene.settings.ambient_light.extend(1.0).into(),
        );
        if let Some(plane) = frame.options.clipping_plane {
            frame_uniforms.insert(names::CLIPPING_PLANE.into(), plane.into());
        }

        let pass = CameraPass {
            frame,
            view_projection,
            viewport,
        };
        let baseline = PipelineState::baseline();
        self.backend.apply_state(&baseline);
        let mut result = Ok(());
        for index in &order {
            let instance = &self.collector.instances[*index];
            let mut submission = Submission {
                cache: &mut self.cache,
                scratch: &mut self.scratch,
                warned: &mut self.warned,
                stats: &mut self.stats,
            };
            let drawn = if instance.flags.render_as_screen_space_2d {
                match &self.screen_quad {
                    Some(quad) => {
                        submission.draw_screen_space(&mut self.backend, instance, camera, &quad.geometry, &pass)
                    }
                    None => Ok(0),
                }
            } else {
                submission.draw_lit(&mut self.backend, instance, &self.lights, &pass)
            };
            match drawn {
                Ok(0) => {}
                Ok(draws) => {
                    self.stats.rendered += 1;
                    self.stats.main_draws += draws;
                }
                Err(err) => {
                    result = Err(err);
                    break;
                }
            }
        }
        self.backend.apply_state(&baseline);
        self.backend.set_scissor(saved_scissor);
        self.scratch.order = order;
        result
    }

    /// Render `camera` into a texture, restoring the caller's target,
    /// viewport, scissor and pipeline state afterwards.
    pub fn render_to_texture(
        &mut self,
        scene: &mut Scene,
        resources: &dyn ResourceManager,
        camera: &mut Camera,
        color: TextureHandle,
        depth: Option<TextureHandle>,
        options: &RenderOptions,
    ) -> RenderResult<()> {
        if self.nested_depth >= self.config.nested_render_limit {
            return Err(RenderError::NestedRenderOverflow(self.nested_depth));
        }
        if self.backend.texture_size(color).is_none() {
            return Err(RenderError::InvalidRenderTarget(format!("{:?} is not a live texture", color)));
        }

        self.nested_depth += 1;
        let saved_target = self.backend.render_target();
        let saved_viewport = self.backend.viewport();
        let saved_scissor = self.backend.scissor();
        let saved_state = self.backend.state();

        let result = self.render_into(scene, resources, camera, color, depth, options);

        let restored = self.backend.set_render_target(saved_target);
        self.backend.set_viewport(saved_viewport);
        self.backend.set_scissor(saved_scissor);
        self.backend.apply_state(&saved_state);
        self.nested_depth -= 1;
        result?;
        restored?;
        Ok(())
    }

    fn render_into(
        &mut self,
        scene: &mut Scene,
        resources: &dyn ResourceManager,
        camera: &mut Camera,
        color: TextureHandle,
        depth: Option<TextureHandle>,
        options: &RenderOptions,
    ) -> RenderResult<()> {
        self.backend.set_render_target(RenderTarget::Texture {
            color,
            depth,
            layer: 0,
        })?;
        self.collector.collect(scene, resources);
        let scene: &Scene = scene;
        self.prepare_lights(resources, options, std::slice::from_mut(camera))?;
        let frame = FrameContext {
            scene,
            resources,
            options,
        };
        self.render_frame(camera, &frame)
    }

    /// Instance under pixel `(x, y)` of the screen, seen through `camera`.
    pub fn pick_instance_at(
        &mut self,
        scene: &mut Scene,
        resources: &dyn ResourceManager,
        camera: &mut Camera,
        x: u32,
        y: u32,
    ) -> RenderResult<Option<InstanceId>> {
        self.collector.collect(scene, resources);
        let scale = self.config.picking_resolution_scale.max(1);
        let (width, height) = self.backend.surface_size();
        let size = (width * scale, height * scale);
        let target = self.picking_target(size)?;

        let saved_target = self.backend.render_target();
        let saved_viewport = self.backend.viewport();
        let saved_scissor = self.backend.scissor();
        let saved_state = self.backend.state();

        let result = self.draw_picking(camera, &target, x * scale, y * scale);

        let restored = self.backend.set_render_target(saved_target);
        self.backend.set_viewport(saved_viewport);
        self.backend.set_scissor(saved_scissor);
        self.backend.apply_state(&saved_state);
        let index = result?;
        restored?;
        Ok(index.and_then(|i| self.collector.instances.get(i)).map(|i| i.id))
    }

    fn picking_target(&mut self, size: (u32, u32)) -> RenderResult<PickingTarget> {
        if let Some(target) = &self.picking {
            if target.size == size {
                return Ok(*target);
            }
        }
        if let Some(old) = self.picking.take() {
            self.backend.destroy_texture(old.color);
            self.backend.destroy_texture(old.depth);
        }
        let color = self.backend.create_texture(&TextureDescriptor::render_target(
            "picking",
            size.0,
            size.1,
            TextureFormat::Rgba8Unorm,
        ))?;
        let depth = self.backend.create_texture(&TextureDescriptor::render_target(
            "picking depth",
            size.0,
            size.1,
            TextureFormat::Depth32Float,
        ))?;
        let target = PickingTarget { color, depth, size };
        self.picking = Some(target);
        Ok(target)
    }

    fn draw_picking(
        &mut self,
        camera: &mut Camera,
        target: &PickingTarget,
        x: u32,
        y: u32,
    ) -> RenderResult<Option<usize>> {
        self.backend.set_render_target(RenderTarget::Texture {
            color: target.color,
            depth: Some(target.depth),
            layer: 0,
        })?;
        let viewport = Viewport::from_normalized(camera.viewport, target.size);
        if !viewport.contains(x, y) {
            return Ok(None);
        }
        camera.set_aspect(viewport.aspect());
        let view_projection = camera.view_projection();
        self.backend.set_viewport(viewport);
        self.backend.set_scissor(Some(viewport));
        self.backend.clear(&ClearRequest {
            color: Some(Vec4::ZERO),
            depth: Some(1.0),
        })?;

        let mut order = std::mem::take(&mut self.scratch.order);
        let options = RenderOptions::default();
        self.visibility.process(
            &mut self.collector.instances,
            &view_projection,
            camera.position(),
            &options,
            &mut order,
        );
        let mut submission = Submission {
            cache: &mut self.cache,
            scratch: &mut self.scratch,
            warned: &mut self.warned,
            stats: &mut self.stats,
        };
        let drawn = submission.draw_picking(
            &mut self.backend,
            &self.collector.instances,
            &order,
            &view_projection,
        );
        self.scratch.order = order;
        let draws = drawn?;
        self.stats.picking_draws += draws;
        self.backend.apply_state(&PipelineState::baseline());

        let pixel = self.backend.read_pixel(x, y)?;
        Ok(decode_index(pixel))
    }

    /// Instances hit by a ray, nearest first.
    ///
    /// Instances with CPU geometry are tested per triangle; the rest by
    /// their world bounds.
    pub fn raycast(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Vec<RaycastHit> {
        let ray = Ray::new(origin, direction);
        let mut hits: Vec<RaycastHit> = self
            .collector
            .instances
            .iter()
            .filter(|i| i.flags.raycastable && !i.flags.render_as_screen_space_2d)
            .filter_map(|instance| {
                let bound_hit = ray.intersect_aabb(&instance.world_aabb())?;
                let distance = match &instance.mesh {
                    Some(mesh) if mesh.triangle_count() > 0 => {
                        let local = ray.transformed(&instance.world_matrix().inverse());
                        mesh.triangles()
                            .filter_map(|[a, b, c]| local.intersect_triangle(a, b, c))
                            .min_by(f32::total_cmp)?
                    }
                    _ => bound_hit,
                };
                (distance <= max_distance).then(|| RaycastHit {
                    instance: instance.id,
                    node: instance.node,
                    point: ray.at(distance),
                    distance,
                })
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits
    }

    /// Colliders hit by a ray, nearest first.
    pub fn raycast_colliders(&self, origin: Vec3, direction: Vec3, max_distance: f32) -> Vec<ColliderHit> {
        let ray = Ray::new(origin, direction);
        let mut hits: Vec<ColliderHit> = self
            .collector
            .colliders
            .iter()
            .filter_map(|collider| {
                let distance = collider.intersect(&ray)?;
                (distance <= max_distance).then(|| ColliderHit {
                    node: collider.node,
                    point: ray.at(distance),
                    distance,
                })
            })
            .collect();
        hits.sort_by(|a, b| a.distance.total_cmp(&b.distance));
        hits
    }
}

/// Mutable renderer state borrowed for one stretch of draws.
struct Submission<'r> {
    cache: &'r mut ShaderCache,
    scratch: &'r mut Scratch,
    warned: &'r mut HashSet<(InstanceId, Warning)>,
    stats: &'r mut FrameStats,
}

impl<'r> Submission<'r> {
    /// Merge scene, node, material and instance macros, closest scope last.
    fn merge_macros(&mut self, instance: &RenderInstance, scene: &Scene, node_inputs: Option<&ShaderInputs>) {
        let macros = &mut self.scratch.macros;
        macros.clear();
        macros.merge_from(&scene.settings.inputs.macros);
        if let Some(node) = node_inputs {
            macros.merge_from(&node.macros);
        }
        macros.merge_from(&self.scratch.material.macros);
        macros.merge_from(&instance.inputs.macros);
    }

    fn geometry<'i>(&mut self, instance: &'i RenderInstance, options: &RenderOptions) -> &'i GeometryRef {
        if !options.force_wireframe {
            return instance.geometry_for_distance();
        }
        match &instance.wireframe {
            Some(wireframe) => wireframe,
            None => {
                if self.warned.insert((instance.id, Warning::MissingWireframe)) {
                    log::warn!(
                        "Instance {:?} has no wireframe buffer, drawing it filled",
                        instance.id
                    );
                }
                instance.geometry_for_distance()
            }
        }
    }

    /// Main-pass draws of one instance: an ambient-only pass when no light
    /// applies, otherwise one pass per light until a single-pass program
    /// stops the loop.
    fn draw_lit<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        instance: &RenderInstance,
        lights: &LightPassController,
        pass: &CameraPass<'_>,
    ) -> RenderResult<u32> {
        let frame = pass.frame;
        let material = &instance.material;
        if material.is_invisible() {
            log::trace!("Skipping invisible instance {:?}", instance.id);
            return Ok(0);
        }

        let node_inputs = instance
            .node
            .and_then(|n| frame.scene.node(n))
            .map(|n| &n.inputs);
        material.write_inputs(frame.resources, &mut self.scratch.material);
        self.merge_macros(instance, frame.scene, node_inputs);
        if frame.options.clipping_plane.is_some() && !instance.flags.ignore_clipping_plane {
            self.scratch.macros.set_flag(ShaderMacro::UseClippingPlane);
        }
        if frame.options.low_quality_shader_variant {
            self.scratch.macros.set_flag(ShaderMacro::LowQuality);
        }

        let geometry = *self.geometry(instance, frame.options);
        let world = instance.world_matrix();
        let mvp = if instance.flags.ignore_view_projection {
            world
        } else {
            pass.view_projection * world
        };
        let first_state = instance.pipeline_state(&PipelineState::baseline());

        let mut light_indices = std::mem::take(&mut self.scratch.light_indices);
        lights.lights_for_instance(instance, &mut light_indices);
        let passes = light_indices.len().max(1);

        let empty_uniforms = UniformMap::new();
        let empty_samplers = SamplerMap::new();
        let mut draws = 0;
        let mut result = Ok(());
        for pass_index in 0..passes {
            let light = light_indices.get(pass_index).copied();
            self.scratch.pass_macros.clear();
            self.scratch.pass_macros.merge_from(&self.scratch.macros);
            if let Some(light) = light {
                lights.get_macros(instance, light, &mut self.scratch.pass_macros);
            }

            let resolved = match self
                .cache
                .resolve(backend, &material.shader, &self.scratch.pass_macros)
            {
                Ok(resolved) => resolved,
                Err(err) => {
                    result = Err(err);
                    break;
                }
            };
            if pass_index > 0 && !resolved.multipass {
                break;
            }

            let per_draw = &mut self.scratch.per_draw;
            per_draw.clear();
            per_draw.insert(names::MODEL.into(), world.into());
            per_draw.insert(names::NORMAL_MATRIX.into(), instance.normal_matrix().into());
            per_draw.insert(names::MVP.into(), mvp.into());
            if pass_index > 0 {
                per_draw.insert(names::AMBIENT_LIGHT.into(), Vec4::ZERO.into());
                per_draw.insert(names::EMISSIVE.into(), Vec4::ZERO.into());
            }
            let (light_uniforms, light_samplers) = light
                .and_then(|l| lights.get_uniforms(instance, l, per_draw))
                .unwrap_or((&empty_uniforms, &empty_samplers));

            let scene_inputs = &frame.scene.settings.inputs;
            let node_uniforms = node_inputs.map(|n| &n.uniforms).unwrap_or(&empty_uniforms);
            let node_samplers = node_inputs.map(|n| &n.samplers).unwrap_or(&empty_samplers);
            let uniforms = [
                &self.scratch.frame,
                &scene_inputs.uniforms,
                node_uniforms,
                &self.scratch.material.uniforms,
                &instance.inputs.uniforms,
                light_uniforms,
                &self.scratch.per_draw,
            ];
            let samplers = [
                &scene_inputs.samplers,
                node_samplers,
                &self.scratch.material.samplers,
                &instance.inputs.samplers,
                light_samplers,
            ];

            backend.apply_state(&LightPassController::pass_state(pass_index, &first_state));
            let drawn = backend.draw(&DrawCall {
                program: resolved.program,
                geometry: &geometry,
                uniforms: &uniforms,
                samplers: &samplers,
            });
            if let Err(err) = drawn {
                result = Err(err.into());
                break;
            }
            draws += 1;
            if !resolved.multipass {
                break;
            }
        }
        self.scratch.light_indices = light_indices;
        result.map(|_| draws)
    }

    /// Unlit quad at the instance's projected center, `screen_size` pixels
    /// large, drawn with its own orthographic projection.
    fn draw_screen_space<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        instance: &RenderInstance,
        camera: &mut Camera,
        quad: &GeometryRef,
        pass: &CameraPass<'_>,
    ) -> RenderResult<u32> {
        let frame = pass.frame;
        if instance.material.is_invisible() {
            return Ok(0);
        }
        let Some(screen) = camera.project(instance.center(), pass.viewport) else {
            return Ok(0);
        };
        let viewport = pass.viewport;
        let projection = Mat4::orthographic_rh(
            viewport.x as f32,
            (viewport.x + viewport.width) as f32,
            (viewport.y + viewport.height) as f32,
            viewport.y as f32,
            0.0,
            1.0,
        );
        let model = Mat4::from_translation(Vec3::new(screen.x, screen.y, -screen.z.clamp(0.0, 1.0)))
            * Mat4::from_scale(instance.screen_size.extend(1.0));

        instance.material.write_inputs(frame.resources, &mut self.scratch.material);
        let macros = &mut self.scratch.pass_macros;
        macros.clear();
        macros.merge_from(&self.scratch.material.macros);
        macros.merge_from(&instance.inputs.macros);
        let resolved = self.cache.resolve(backend, SCREEN_QUAD_SHADER, macros)?;

        let per_draw = &mut self.scratch.per_draw;
        per_draw.clear();
        per_draw.insert(names::MODEL.into(), model.into());
        per_draw.insert(names::MVP.into(), (projection * model).into());

        let state = PipelineState {
            cull_mode: CullMode::None,
            ..instance.pipeline_state(&PipelineState::baseline())
        };
        backend.apply_state(&state);
        backend.draw(&DrawCall {
            program: resolved.program,
            geometry: quad,
            uniforms: &[
                &self.scratch.material.uniforms,
                &instance.inputs.uniforms,
                &self.scratch.per_draw,
            ],
            samplers: &[&self.scratch.material.samplers, &instance.inputs.samplers],
        })?;
        Ok(1)
    }

    /// Shadow casters seen by one face camera of `light`.
    ///
    /// Casters are instances visible to some scene camera with
    /// `cast_shadows` set. Faces are drawn without culling since the cube
    /// face projections flip winding.
    fn draw_shadow_casters<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        instances: &[RenderInstance],
        visible: &[bool],
        light: &Light,
        camera: &mut Camera,
        resources: &dyn ResourceManager,
    ) -> RenderResult<u32> {
        let view_projection = camera.view_projection();
        let frustum = Frustum::from_view_projection(&view_projection);
        let cube = light.kind == LightKind::Omni;

        let frame = &mut self.scratch.frame;
        frame.clear();
        frame.insert(names::LIGHT_POSITION.into(), light.position.extend(1.0).into());
        frame.insert(
            names::SHADOW_PARAMS.into(),
            Vec4::new(
                light.shadow_bias,
                light.near,
                light.shadow_far(),
                light.shadow_resolution as f32,
            )
            .into(),
        );

        let state = PipelineState {
            cull_mode: CullMode::None,
            ..PipelineState::baseline()
        };
        backend.apply_state(&state);

        let mut draws = 0;
        for (index, instance) in instances.iter().enumerate() {
            let flags = &instance.flags;
            if !flags.cast_shadows
                || !visible.get(index).copied().unwrap_or(false)
                || flags.render_as_screen_space_2d
                || flags.ignore_view_projection
                || instance.material.is_invisible()
                || frustum.test_aabb(&instance.world_aabb()) == Containment::Outside
            {
                continue;
            }

            let material = &instance.material;
            let macros = &mut self.scratch.pass_macros;
            macros.clear();
            self.scratch.material.reset();
            if cube {
                macros.set_flag(ShaderMacro::ShadowCube);
            }
            if material.alpha_tested_shadows && material.alpha_test.is_some() {
                material.write_inputs(resources, &mut self.scratch.material);
                macros.set_flag(ShaderMacro::AlphaTest);
            }
            let resolved = self.cache.resolve(backend, SHADOW_SHADER, macros)?;

            let world = instance.world_matrix();
            let per_draw = &mut self.scratch.per_draw;
            per_draw.clear();
            per_draw.insert(names::MODEL.into(), world.into());
            per_draw.insert(names::MVP.into(), (view_projection * world).into());

            backend.draw(&DrawCall {
                program: resolved.program,
                geometry: instance.geometry_for_distance(),
                uniforms: &[
                    &self.scratch.frame,
                    &self.scratch.material.uniforms,
                    &self.scratch.per_draw,
                ],
                samplers: &[&self.scratch.material.samplers],
            })?;
            draws += 1;
        }
        backend.apply_state(&PipelineState::baseline());
        self.stats.shadow_draws += draws;
        Ok(draws)
    }

    /// Every instance in `order` with its index encoded as a flat color.
    fn draw_picking<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        instances: &[RenderInstance],
        order: &[usize],
        view_projection: &Mat4,
    ) -> RenderResult<u32> {
        let program = self.cache.resolve(backend, PICKING_SHADER, &MacroSet::new())?.program;
        let mut draws = 0;
        for &index in order {
            let instance = &instances[index];
            if index > MAX_PICKABLE
                || instance.material.is_invisible()
                || instance.flags.render_as_screen_space_2d
            {
                continue;
            }
            let world = instance.world_matrix();
            let mvp = if instance.flags.ignore_view_projection {
                world
            } else {
                *view_projection * world
            };
            let per_draw = &mut self.scratch.per_draw;
            per_draw.clear();
            per_draw.insert(names::MODEL.into(), world.into());
            per_draw.insert(names::MVP.into(), mvp.into());
            per_draw.insert(
                names::PICKING_COLOR.into(),
                UniformValue::Vec4(encode_index(index)),
            );

            let state = PipelineState {
                blend: None,
                ..instance.pipeline_state(&PipelineState::baseline())
            };
            backend.apply_state(&state);
            backend.draw(&DrawCall {
                program,
                geometry: instance.geometry_for_distance(),
                uniforms: &[&self.scratch.per_draw],
                samplers: &[],
            })?;
            draws += 1;
        }
        Ok(draws)
    }
}
