//! Scene data collector
//!
//! Walks the scene and gathers what the frame needs: render instances,
//! lights, cameras and colliders. A full collection runs every
//! `collect_interval` frames and whenever the scene's node or component set
//! changes. The frames in between keep last pass's instances and only
//! refresh their world matrices; lights, cameras and colliders are cheap and
//! gathered every frame so they follow their nodes.

use crate::pipeline::instance::RenderInstance;
use crate::resources::ResourceManager;
use crate::scene::{Camera, CollectContext, Collider, Light, Scene};

/// What [`SceneDataCollector::collect`] did this frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CollectOutcome {
    /// Everything was gathered from the components.
    Collected,
    /// Last frame's data was kept and transforms refreshed.
    Updated,
}

#[derive(Default)]
pub struct SceneDataCollector {
    pub instances: Vec<RenderInstance>,
    pub lights: Vec<Light>,
    pub cameras: Vec<Camera>,
    pub colliders: Vec<Collider>,
    interval: u32,
    frames_since_collect: u32,
    scene_version: Option<u64>,
}

impl SceneDataCollector {
    pub fn new(interval: u32) -> Self {
        Self {
            interval: interval.max(1),
            ..Default::default()
        }
    }

    /// Force a full collection on the next call.
    pub fn invalidate(&mut self) {
        self.scene_version = None;
    }

    pub fn collect(&mut self, scene: &mut Scene, resources: &dyn ResourceManager) -> CollectOutcome {
        scene.update_transforms();

        let due = self.frames_since_collect + 1 >= self.interval;
        if due || self.scene_version != Some(scene.version()) {
            self.gather(scene, resources, true);
            self.frames_since_collect = 0;
            self.scene_version = Some(scene.version());
            return CollectOutcome::Collected;
        }

        self.frames_since_collect += 1;
        self.gather(scene, resources, false);
        for instance in &mut self.instances {
            if instance.flags.skip_auto_transform_update {
                continue;
            }
            if let Some(world) = instance.node.and_then(|n| scene.world_matrix(n)) {
                instance.set_world_matrix(world);
            }
        }
        CollectOutcome::Updated
    }

    fn gather(&mut self, scene: &mut Scene, resources: &dyn ResourceManager, with_instances: bool) {
        if with_instances {
            self.instances.clear();
        }
        self.lights.clear();
        self.cameras.clear();
        self.colliders.clear();

        for node in scene.visible_nodes() {
            let (instances, lights, cameras, colliders) = (
                &mut self.instances,
                &mut self.lights,
                &mut self.cameras,
                &mut self.colliders,
            );
            scene.visit_components(node, |world, component| {
                let ctx = CollectContext {
                    node,
                    world,
                    resources,
                };
                if with_instances {
                    component.collect_instances(&ctx, instances);
                }
                component.collect_lights(&ctx, lights);
                component.collect_cameras(&ctx, cameras);
                component.collect_colliders(&ctx, colliders);
            });
        }

        log::trace!(
            "Gathered {} instances, {} lights, {} cameras, {} colliders",
            self.instances.len(),
            self.lights.len(),
            self.cameras.len(),
            self.colliders.len()
        );
    }
}
