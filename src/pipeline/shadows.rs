//! Shadow maps
//!
//! Each shadow-casting light owns one map, keyed by [`LightId`]. The map
//! moves through `NotNeeded -> Needed -> Rendering -> Ready` every frame it
//! is updated. Spot and directional lights render one layer; omni lights
//! render six, one per cube face. Depth is stored in the red channel of a
//! float color target, with a matching depth attachment for the depth test.

use std::collections::HashMap;

use glam::{Mat4, Vec4};

use crate::backend::{
    ClearRequest, GraphicsBackend, RenderTarget, TextureDescriptor, TextureFormat, TextureHandle,
    Viewport,
};
use crate::error::RenderResult;
use crate::scene::{Camera, Light, LightId, LightKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ShadowState {
    NotNeeded,
    Needed,
    Rendering,
    Ready,
}

#[derive(Debug, Clone)]
pub struct ShadowMap {
    pub state: ShadowState,
    pub color: TextureHandle,
    pub depth: TextureHandle,
    pub cube: bool,
    pub resolution: u32,
    /// Light view-projection of the last render; identity for cube maps.
    pub view_projection: Mat4,
    /// Sampling parameters of the last render.
    pub bias: f32,
    pub near: f32,
    pub far: f32,
}

impl ShadowMap {
    pub fn is_ready(&self) -> bool {
        self.state == ShadowState::Ready
    }

    /// `(bias, near, far, resolution)`, the layout of `u_shadow_params`.
    pub fn params(&self) -> Vec4 {
        Vec4::new(self.bias, self.near, self.far, self.resolution as f32)
    }
}

fn needs_map(light: &Light, epsilon: f32) -> bool {
    light.enabled && light.cast_shadows && light.computed_intensity() > epsilon
}

/// Shadow maps of every light that currently needs one.
#[derive(Debug, Default)]
pub struct ShadowMaps {
    maps: HashMap<LightId, ShadowMap>,
    epsilon: f32,
}

impl ShadowMaps {
    pub fn new(epsilon: f32) -> Self {
        Self {
            maps: HashMap::new(),
            epsilon,
        }
    }

    /// Whether `light` should have a shadow map at all.
    pub fn is_needed(&self, light: &Light) -> bool {
        needs_map(light, self.epsilon)
    }

    pub fn state(&self, light: LightId) -> ShadowState {
        self.maps
            .get(&light)
            .map(|m| m.state)
            .unwrap_or(ShadowState::NotNeeded)
    }

    pub fn get(&self, light: LightId) -> Option<&ShadowMap> {
        self.maps.get(&light)
    }

    /// The map of `light` if it is ready to be sampled.
    pub fn shadow_map(&self, light: LightId) -> Option<&ShadowMap> {
        self.maps.get(&light).filter(|m| m.is_ready())
    }

    pub fn len(&self) -> usize {
        self.maps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.maps.is_empty()
    }

    /// Allocate, flag or release maps for this frame's lights.
    ///
    /// Maps of lights that no longer need one, or that are gone, are
    /// released. With `update` set every needed map is flagged for
    /// rendering; otherwise only maps that were never rendered are.
    pub fn update_state<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        lights: &[Light],
        update: bool,
    ) -> RenderResult<()> {
        let epsilon = self.epsilon;
        let stale: Vec<LightId> = self
            .maps
            .keys()
            .filter(|id| !lights.iter().any(|l| l.id == **id && needs_map(l, epsilon)))
            .copied()
            .collect();
        for id in stale {
            self.release(backend, id);
        }

        for light in lights.iter().filter(|l| needs_map(l, epsilon)) {
            let cube = light.kind == LightKind::Omni;
            let resolution = light.shadow_resolution.max(1);
            let reusable = self
                .maps
                .get(&light.id)
                .is_some_and(|m| m.cube == cube && m.resolution == resolution);
            if !reusable {
                self.release(backend, light.id);
                let map = Self::allocate(backend, light, cube, resolution)?;
                self.maps.insert(light.id, map);
            }
            if let Some(map) = self.maps.get_mut(&light.id) {
                if update || map.state != ShadowState::Ready {
                    map.state = ShadowState::Needed;
                }
            }
        }
        Ok(())
    }

    fn allocate<B: GraphicsBackend + ?Sized>(
        backend: &mut B,
        light: &Light,
        cube: bool,
        resolution: u32,
    ) -> RenderResult<ShadowMap> {
        let layers = if cube { 6 } else { 1 };
        let color = backend.create_texture(
            &TextureDescriptor::render_target(
                &format!("shadow map {}", light.id.0),
                resolution,
                resolution,
                TextureFormat::Rgba16Float,
            )
            .with_layers(layers),
        )?;
        let depth = match backend.create_texture(&TextureDescriptor::render_target(
            &format!("shadow depth {}", light.id.0),
            resolution,
            resolution,
            TextureFormat::Depth32Float,
        )) {
            Ok(depth) => depth,
            Err(err) => {
                backend.destroy_texture(color);
                return Err(err.into());
            }
        };
        log::debug!(
            "Allocated {}x{} {} shadow map for light {}",
            resolution,
            resolution,
            if cube { "cube" } else { "2D" },
            light.id.0
        );
        Ok(ShadowMap {
            state: ShadowState::NotNeeded,
            color,
            depth,
            cube,
            resolution,
            view_projection: Mat4::IDENTITY,
            bias: light.shadow_bias,
            near: light.near,
            far: light.shadow_far(),
        })
    }

    pub fn release<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B, light: LightId) {
        if let Some(map) = self.maps.remove(&light) {
            backend.destroy_texture(map.color);
            backend.destroy_texture(map.depth);
            log::debug!("Released shadow map of light {}", light.0);
        }
    }

    pub fn release_all<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) {
        let ids: Vec<LightId> = self.maps.keys().copied().collect();
        for id in ids {
            self.release(backend, id);
        }
    }

    /// Render the map of `light` if it is flagged as needed.
    ///
    /// `submit` draws the casters for one face camera into the bound target
    /// and returns the number of draw calls. The caller's target, viewport
    /// and scissor are restored afterwards, also on failure.
    pub fn render<B, F>(&mut self, backend: &mut B, light: &Light, mut submit: F) -> RenderResult<u32>
    where
        B: GraphicsBackend + ?Sized,
        F: FnMut(&mut B, &mut Camera) -> RenderResult<u32>,
    {
        let Some(map) = self.maps.get_mut(&light.id) else {
            return Ok(0);
        };
        if map.state != ShadowState::Needed {
            return Ok(0);
        }
        map.state = ShadowState::Rendering;

        let mut cameras = if map.cube {
            light.cube_cameras().to_vec()
        } else {
            vec![light.camera()]
        };

        let saved_target = backend.render_target();
        let saved_viewport = backend.viewport();
        let saved_scissor = backend.scissor();

        let result = Self::draw_faces(backend, map, &mut cameras, &mut submit);

        let restored = backend.set_render_target(saved_target);
        backend.set_viewport(saved_viewport);
        backend.set_scissor(saved_scissor);

        match result {
            Ok(draws) => {
                map.view_projection = if map.cube {
                    Mat4::IDENTITY
                } else {
                    cameras[0].view_projection()
                };
                map.bias = light.shadow_bias;
                map.near = light.near;
                map.far = light.shadow_far();
                map.state = ShadowState::Ready;
                restored?;
                Ok(draws)
            }
            Err(err) => {
                map.state = ShadowState::Needed;
                Err(err)
            }
        }
    }

    fn draw_faces<B, F>(
        backend: &mut B,
        map: &ShadowMap,
        cameras: &mut [Camera],
        submit: &mut F,
    ) -> RenderResult<u32>
    where
        B: GraphicsBackend + ?Sized,
        F: FnMut(&mut B, &mut Camera) -> RenderResult<u32>,
    {
        let mut draws = 0;
        for (layer, camera) in cameras.iter_mut().enumerate() {
            backend.set_render_target(RenderTarget::Texture {
                color: map.color,
                depth: Some(map.depth),
                layer: layer as u32,
            })?;
            backend.set_viewport(Viewport::full((map.resolution, map.resolution)));
            backend.set_scissor(None);
            backend.clear(&ClearRequest {
                color: Some(Vec4::ONE),
                depth: Some(1.0),
            })?;
            draws += submit(backend, camera)?;
        }
        Ok(draws)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;
    use glam::Vec3;

    fn caster() -> Light {
        Light::spot(Vec3::new(0.0, 5.0, 0.0), Vec3::ZERO, Vec3::ONE).with_shadows(64)
    }

    #[test]
    fn light_without_shadows_never_allocates() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut maps = ShadowMaps::new(0.0001);
        let light = Light::spot(Vec3::Y, Vec3::ZERO, Vec3::ONE);
        maps.update_state(&mut backend, &[light.clone()], true).unwrap();
        assert!(maps.is_empty());
        assert_eq!(maps.state(light.id), ShadowState::NotNeeded);
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn toggling_cast_shadows_releases_the_map() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut maps = ShadowMaps::new(0.0001);
        let mut light = caster();
        maps.update_state(&mut backend, &[light.clone()], true).unwrap();
        assert_eq!(maps.state(light.id), ShadowState::Needed);
        assert_eq!(backend.live_textures(), 2);

        light.cast_shadows = false;
        maps.update_state(&mut backend, &[light.clone()], true).unwrap();
        assert_eq!(maps.state(light.id), ShadowState::NotNeeded);
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn dim_light_does_not_need_a_map() {
        let maps = ShadowMaps::new(0.0001);
        let light = caster().with_intensity(0.0);
        assert!(!maps.is_needed(&light));
    }

    #[test]
    fn omni_renders_six_faces_and_becomes_ready() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut maps = ShadowMaps::new(0.0001);
        let light = Light::omni(Vec3::ZERO, Vec3::ONE).with_shadows(16);
        maps.update_state(&mut backend, &[light.clone()], true).unwrap();
        let mut faces = 0;
        maps.render(&mut backend, &light, |_, _| {
            faces += 1;
            Ok(1)
        })
        .unwrap();
        assert_eq!(faces, 6);
        let map = maps.shadow_map(light.id).unwrap();
        assert!(map.cube);
        assert_eq!(backend.render_target(), RenderTarget::Screen);
    }

    #[test]
    fn ready_map_is_kept_without_updates() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut maps = ShadowMaps::new(0.0001);
        let light = caster();
        maps.update_state(&mut backend, &[light.clone()], true).unwrap();
        maps.render(&mut backend, &light, |_, _| Ok(1)).unwrap();
        maps.update_state(&mut backend, &[light.clone()], false).unwrap();
        assert_eq!(maps.state(light.id), ShadowState::Ready);
        let draws = maps.render(&mut backend, &light, |_, _| Ok(1)).unwrap();
        assert_eq!(draws, 0);
    }

    #[test]
    fn frozen_map_keeps_render_time_parameters() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut maps = ShadowMaps::new(0.0001);
        let mut light = caster();
        maps.update_state(&mut backend, &[light.clone()], true).unwrap();
        maps.render(&mut backend, &light, |_, _| Ok(1)).unwrap();
        let rendered_with = light.camera().view_projection();

        light.position.x = 4.0;
        light.shadow_bias = 0.5;
        maps.update_state(&mut backend, &[light.clone()], false).unwrap();
        let map = maps.shadow_map(light.id).unwrap();
        assert_eq!(map.view_projection, rendered_with);
        assert_eq!(map.bias, 0.005);

        maps.update_state(&mut backend, &[light.clone()], true).unwrap();
        maps.render(&mut backend, &light, |_, _| Ok(1)).unwrap();
        let map = maps.shadow_map(light.id).unwrap();
        assert_eq!(map.view_projection, light.camera().view_projection());
        assert_eq!(map.bias, 0.5);
    }
}
