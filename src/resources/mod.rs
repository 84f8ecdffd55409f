//! Resource management
//!
//! The renderer only ever asks for resources through [`ResourceManager`],
//! which never blocks: `None` means "not ready yet" and the caller skips or
//! substitutes. [`ResourceStore`] is the in-memory implementation used by
//! the demo and the tests.

mod material;
mod mesh;
mod texture;

pub use material::*;
pub use mesh::*;
pub use texture::*;

use std::collections::HashMap;
use std::sync::Arc;

use crate::backend::{GraphicsBackend, TextureHandle};
use crate::error::ResourceError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MeshId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TextureId(pub u32);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct MaterialId(pub u32);

/// Non-blocking resource lookups.
pub trait ResourceManager {
    fn get_texture(&self, id: TextureId) -> Option<TextureHandle>;
    fn get_mesh(&self, id: MeshId) -> Option<&GpuMesh>;
    fn get_material(&self, id: MaterialId) -> Option<Arc<Material>>;
}

/// Resources kept in memory, keyed by sequential ids.
///
/// Ids can be reserved before their data exists, which models an
/// asynchronous load still in flight.
#[derive(Default)]
pub struct ResourceStore {
    next_id: u32,
    meshes: HashMap<MeshId, GpuMesh>,
    textures: HashMap<TextureId, TextureHandle>,
    materials: HashMap<MaterialId, Arc<Material>>,
    build_wireframe: bool,
}

impl ResourceStore {
    pub fn new() -> Self {
        Self {
            build_wireframe: true,
            ..Default::default()
        }
    }

    /// Whether uploaded meshes get a line-list edge buffer.
    pub fn with_wireframe_indices(mut self, build: bool) -> Self {
        self.build_wireframe = build;
        self
    }

    fn alloc(&mut self) -> u32 {
        self.next_id += 1;
        self.next_id
    }

    pub fn reserve_mesh(&mut self) -> MeshId {
        MeshId(self.alloc())
    }

    pub fn reserve_texture(&mut self) -> TextureId {
        TextureId(self.alloc())
    }

    pub fn reserve_material(&mut self) -> MaterialId {
        MaterialId(self.alloc())
    }

    pub fn add_mesh<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        mesh: Mesh,
    ) -> Result<MeshId, ResourceError> {
        let id = self.reserve_mesh();
        self.load_mesh(backend, id, mesh)?;
        Ok(id)
    }

    /// Upload mesh data for an id, replacing what was there.
    pub fn load_mesh<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        id: MeshId,
        mesh: Mesh,
    ) -> Result<(), ResourceError> {
        let gpu = GpuMesh::upload(backend, mesh, self.build_wireframe)?;
        if let Some(old) = self.meshes.insert(id, gpu) {
            old.destroy(backend);
        }
        Ok(())
    }

    pub fn add_texture<B: GraphicsBackend + ?Sized>(
        &mut self,
        backend: &mut B,
        data: &TextureData,
    ) -> Result<TextureId, ResourceError> {
        let id = self.reserve_texture();
        let handle = data.upload(backend)?;
        self.textures.insert(id, handle);
        Ok(id)
    }

    pub fn add_material(&mut self, material: Material) -> MaterialId {
        let id = self.reserve_material();
        self.materials.insert(id, Arc::new(material));
        id
    }

    pub fn set_material(&mut self, id: MaterialId, material: Material) {
        self.materials.insert(id, Arc::new(material));
    }

    /// Destroy every backend object owned by the store.
    pub fn release<B: GraphicsBackend + ?Sized>(&mut self, backend: &mut B) {
        for (_, mesh) in self.meshes.drain() {
            mesh.destroy(backend);
        }
        for (_, texture) in self.textures.drain() {
            backend.destroy_texture(texture);
        }
        self.materials.clear();
    }
}

impl ResourceManager for ResourceStore {
    fn get_texture(&self, id: TextureId) -> Option<TextureHandle> {
        self.textures.get(&id).copied()
    }

    fn get_mesh(&self, id: MeshId) -> Option<&GpuMesh> {
        self.meshes.get(&id)
    }

    fn get_material(&self, id: MaterialId) -> Option<Arc<Material>> {
        self.materials.get(&id).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::HeadlessBackend;

    #[test]
    fn reserved_mesh_is_not_ready() {
        let mut store = ResourceStore::new();
        let id = store.reserve_mesh();
        assert!(store.get_mesh(id).is_none());
    }

    #[test]
    fn release_destroys_backend_objects() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut store = ResourceStore::new();
        store.add_mesh(&mut backend, Mesh::cube()).unwrap();
        store.add_texture(&mut backend, &TextureData::white()).unwrap();
        // vertices, indices, edges
        assert_eq!(backend.live_buffers(), 3);
        assert_eq!(backend.live_textures(), 1);
        store.release(&mut backend);
        assert_eq!(backend.live_buffers(), 0);
        assert_eq!(backend.live_textures(), 0);
    }

    #[test]
    fn wireframe_buffer_can_be_skipped() {
        let mut backend = HeadlessBackend::new(4, 4);
        let mut store = ResourceStore::new().with_wireframe_indices(false);
        let id = store.add_mesh(&mut backend, Mesh::cube()).unwrap();
        assert!(store.get_mesh(id).unwrap().wireframe.is_none());
    }
}
