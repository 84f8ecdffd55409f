//! Scene management
//!
//! Nodes live in an arena owned by [`Scene`] and refer to each other by
//! [`NodeId`]. Each node carries a local [`Transform`], node-scope shader
//! inputs and any number of [`Collectable`] components; the collector asks
//! those components for instances, lights, cameras and colliders.

mod camera;
mod components;
mod light;
mod transform;

pub use camera::*;
pub use components::*;
pub use light::*;
pub use transform::*;

use std::any::Any;

use glam::{Mat4, Vec3, Vec4};

use crate::pipeline::inputs::ShaderInputs;
use crate::pipeline::instance::RenderInstance;
use crate::resources::ResourceManager;

/// Index of a node in its scene's arena plus a generation guarding reuse.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NodeId {
    index: u32,
    generation: u32,
}

/// What a component sees while being collected.
pub struct CollectContext<'a> {
    pub node: NodeId,
    pub world: Mat4,
    pub resources: &'a dyn ResourceManager,
}

/// Blanket `Any` access for components.
pub trait AsAny: Any {
    fn as_any(&self) -> &dyn Any;
    fn as_any_mut(&mut self) -> &mut dyn Any;
}

impl<T: Any> AsAny for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

/// A node component that contributes to rendering.
///
/// Every method appends to `out` and defaults to contributing nothing.
pub trait Collectable: AsAny {
    fn collect_instances(&mut self, _ctx: &CollectContext<'_>, _out: &mut Vec<RenderInstance>) {}

    fn collect_lights(&mut self, _ctx: &CollectContext<'_>, _out: &mut Vec<Light>) {}

    fn collect_cameras(&mut self, _ctx: &CollectContext<'_>, _out: &mut Vec<Camera>) {}

    fn collect_colliders(&mut self, _ctx: &CollectContext<'_>, _out: &mut Vec<Collider>) {}
}

pub struct SceneNode {
    pub name: String,
    pub transform: Transform,
    /// Hidden nodes and their subtrees are not collected.
    pub visible: bool,
    /// Node-scope shader inputs.
    pub inputs: ShaderInputs,
    parent: Option<NodeId>,
    children: Vec<NodeId>,
    world: Mat4,
    components: Vec<Box<dyn Collectable>>,
}

impl SceneNode {
    pub fn parent(&self) -> Option<NodeId> {
        self.parent
    }

    pub fn children(&self) -> &[NodeId] {
        &self.children
    }

    /// World matrix as of the last [`Scene::update_transforms`].
    pub fn world_matrix(&self) -> Mat4 {
        self.world
    }

    pub fn component_count(&self) -> usize {
        self.components.len()
    }
}

/// Scene-wide settings, the outermost input scope.
#[derive(Debug, Clone)]
pub struct SceneSettings {
    pub background: Option<Vec4>,
    pub ambient_light: Vec3,
    pub inputs: ShaderInputs,
}

impl Default for SceneSettings {
    fn default() -> Self {
        Self {
            background: None,
            ambient_light: Vec3::splat(0.1),
            inputs: ShaderInputs::default(),
        }
    }
}

/// Arena of nodes.
#[derive(Default)]
pub struct Scene {
    nodes: Vec<Option<SceneNode>>,
    generations: Vec<u32>,
    free: Vec<u32>,
    roots: Vec<NodeId>,
    version: u64,
    pub settings: SceneSettings,
}

impl Scene {
    pub fn new() -> Self {
        Self::default()
    }

    /// Counter bumped whenever the set of nodes or components changes.
    pub fn version(&self) -> u64 {
        self.version
    }

    pub fn node_count(&self) -> usize {
        self.nodes.iter().filter(|n| n.is_some()).count()
    }

    pub fn add_node(&mut self, name: &str, parent: Option<NodeId>) -> NodeId {
        let parent = parent.filter(|p| self.node(*p).is_some());
        let node = SceneNode {
            name: name.to_string(),
            transform: Transform::default(),
            visible: true,
            inputs: ShaderInputs::default(),
            parent,
            children: Vec::new(),
            world: Mat4::IDENTITY,
            components: Vec::new(),
        };
        let id = match self.free.pop() {
            Some(index) => {
                self.nodes[index as usize] = Some(node);
                NodeId {
                    index,
                    generation: self.generations[index as usize],
                }
            }
            None => {
                self.nodes.push(Some(node));
                self.generations.push(0);
                NodeId {
                    index: (self.nodes.len() - 1) as u32,
                    generation: 0,
                }
            }
        };
        match parent.and_then(|p| self.node_mut(p)) {
            Some(parent) => parent.children.push(id),
            None => self.roots.push(id),
        }
        self.version += 1;
        id
    }

    /// Add a node with a transform and one component.
    pub fn spawn(
        &mut self,
        name: &str,
        transform: Transform,
        component: impl Collectable,
    ) -> NodeId {
        let id = self.add_node(name, None);
        if let Some(node) = self.node_mut(id) {
            node.transform = transform;
        }
        self.add_component(id, component);
        id
    }

    /// Remove a node, its subtree and their components.
    pub fn remove_node(&mut self, id: NodeId) -> bool {
        let Some(node) = self.take(id) else {
            return false;
        };
        match node.parent.and_then(|p| self.node_mut(p)) {
            Some(parent) => parent.children.retain(|c| *c != id),
            None => self.roots.retain(|r| *r != id),
        }
        let mut pending = node.children;
        while let Some(child) = pending.pop() {
            if let Some(removed) = self.take(child) {
                pending.extend(removed.children);
            }
        }
        self.version += 1;
        true
    }

    fn take(&mut self, id: NodeId) -> Option<SceneNode> {
        self.node(id)?;
        let node = self.nodes.get_mut(id.index as usize)?.take()?;
        self.generations[id.index as usize] += 1;
        self.free.push(id.index);
        Some(node)
    }

    pub fn node(&self, id: NodeId) -> Option<&SceneNode> {
        if self.generations.get(id.index as usize) != Some(&id.generation) {
            return None;
        }
        self.nodes.get(id.index as usize)?.as_ref()
    }

    pub fn node_mut(&mut self, id: NodeId) -> Option<&mut SceneNode> {
        if self.generations.get(id.index as usize) != Some(&id.generation) {
            return None;
        }
        self.nodes.get_mut(id.index as usize)?.as_mut()
    }

    pub fn add_component(&mut self, id: NodeId, component: impl Collectable) -> bool {
        let Some(node) = self.node_mut(id) else {
            return false;
        };
        node.components.push(Box::new(component));
        self.version += 1;
        true
    }

    /// Remove every component of type `T` from a node.
    pub fn remove_components<T: Collectable>(&mut self, id: NodeId) -> usize {
        let Some(node) = self.node_mut(id) else {
            return 0;
        };
        let before = node.components.len();
        node.components.retain(|c| !(**c).as_any().is::<T>());
        let removed = before - node.components.len();
        if removed > 0 {
            self.version += 1;
        }
        removed
    }

    /// First component of type `T` on a node.
    ///
    /// Edits through this reference are picked up at the next full
    /// collection.
    pub fn component_mut<T: Collectable>(&mut self, id: NodeId) -> Option<&mut T> {
        self.node_mut(id)?
            .components
            .iter_mut()
            .find_map(|c| (**c).as_any_mut().downcast_mut::<T>())
    }

    pub fn component<T: Collectable>(&self, id: NodeId) -> Option<&T> {
        self.node(id)?
            .components
            .iter()
            .find_map(|c| (**c).as_any().downcast_ref::<T>())
    }

    pub fn set_transform(&mut self, id: NodeId, transform: Transform) {
        if let Some(node) = self.node_mut(id) {
            node.transform = transform;
        }
    }

    pub fn set_visible(&mut self, id: NodeId, visible: bool) {
        if let Some(node) = self.node_mut(id) {
            if node.visible != visible {
                node.visible = visible;
                self.version += 1;
            }
        }
    }

    /// Recompute every world matrix, parents before children.
    pub fn update_transforms(&mut self) {
        let mut stack: Vec<(NodeId, Mat4)> =
            self.roots.iter().rev().map(|r| (*r, Mat4::IDENTITY)).collect();
        while let Some((id, parent_world)) = stack.pop() {
            let Some(node) = self.node_mut(id) else {
                continue;
            };
            node.world = parent_world * node.transform.matrix();
            let world = node.world;
            stack.extend(node.children.iter().rev().map(|c| (*c, world)));
        }
    }

    pub fn world_matrix(&self, id: NodeId) -> Option<Mat4> {
        self.node(id).map(|n| n.world)
    }

    /// Visible nodes in depth-first order, skipping hidden subtrees.
    pub fn visible_nodes(&self) -> Vec<NodeId> {
        let mut order = Vec::with_capacity(self.nodes.len());
        let mut stack: Vec<NodeId> = self.roots.iter().rev().copied().collect();
        while let Some(id) = stack.pop() {
            let Some(node) = self.node(id) else {
                continue;
            };
            if !node.visible {
                continue;
            }
            order.push(id);
            stack.extend(node.children.iter().rev());
        }
        order
    }

    /// Run every component of a node against `f`.
    pub(crate) fn visit_components(
        &mut self,
        id: NodeId,
        mut f: impl FnMut(Mat4, &mut dyn Collectable),
    ) {
        if let Some(node) = self.node_mut(id) {
            let world = node.world;
            for component in &mut node.components {
                f(world, component.as_mut());
            }
        }
    }
}
