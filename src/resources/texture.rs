//! CPU-side texture data
//!
//! A [`TextureData`] holds one RGBA8 plane per layer: one for 2D textures,
//! six for cube maps in +X, -X, +Y, -Y, +Z, -Z order.

use std::path::Path;

use image::RgbaImage;

use crate::backend::{GraphicsBackend, TextureDescriptor, TextureFormat, TextureHandle, TextureUsage};
use crate::error::ResourceError;

#[derive(Debug, Clone)]
pub struct TextureData {
    pub name: String,
    pub width: u32,
    pub height: u32,
    pub layers: Vec<Vec<u8>>,
}

impl TextureData {
    /// Decode an image file (PNG, JPEG, ...).
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ResourceError> {
        let path = path.as_ref();
        let bytes = std::fs::read(path)?;
        let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("texture");
        Self::from_bytes(&bytes, name)
    }

    /// Decode an encoded image held in memory.
    pub fn from_bytes(bytes: &[u8], name: &str) -> Result<Self, ResourceError> {
        let decoded = image::load_from_memory(bytes)?;
        Ok(Self::from_rgba(decoded.to_rgba8(), name))
    }

    /// Wrap an RGBA image, such as a captured render target.
    pub fn from_rgba(image: RgbaImage, name: &str) -> Self {
        Self {
            name: name.to_string(),
            width: image.width(),
            height: image.height(),
            layers: vec![image.into_raw()],
        }
    }

    /// 1x1 texture of one color.
    pub fn solid(color: [u8; 4], name: &str) -> Self {
        Self {
            name: name.to_string(),
            width: 1,
            height: 1,
            layers: vec![color.to_vec()],
        }
    }

    pub fn white() -> Self {
        Self::solid([255; 4], "white")
    }

    /// `size` x `size` checkerboard with 8 pixel cells.
    pub fn checkerboard(size: u32, even: [u8; 4], odd: [u8; 4]) -> Self {
        let image = RgbaImage::from_fn(size, size, |x, y| {
            image::Rgba(if (x / 8 + y / 8) % 2 == 0 { even } else { odd })
        });
        Self::from_rgba(image, "checkerboard")
    }

    /// Cube map from six square faces of equal size.
    pub fn cube(name: &str, faces: [TextureData; 6]) -> Result<Self, ResourceError> {
        let size = faces[0].width;
        let mut layers = Vec::with_capacity(6);
        for face in faces {
            if face.width != size || face.height != size || face.layers.len() != 1 {
                return Err(ResourceError::InvalidData(format!(
                    "cube face '{}' is {}x{} with {} layers, expected {}x{} with 1",
                    face.name,
                    face.width,
                    face.height,
                    face.layers.len(),
                    size,
                    size
                )));
            }
            layers.extend(face.layers);
        }
        Ok(Self {
            name: name.to_string(),
            width: size,
            height: size,
            layers,
        })
    }

    pub fn is_cube(&self) -> bool {
        self.layers.len() == 6
    }

    /// Create the texture on the backend and upload every layer.
    pub fn upload<B: GraphicsBackend + ?Sized>(&self, backend: &mut B) -> Result<TextureHandle, ResourceError> {
        let expected = (self.width * self.height * 4) as usize;
        if let Some(bad) = self.layers.iter().position(|l| l.len() != expected) {
            return Err(ResourceError::InvalidData(format!(
                "layer {} of '{}' has {} bytes, expected {}",
                bad,
                self.name,
                self.layers[bad].len(),
                expected
            )));
        }
        let handle = backend.create_texture(&TextureDescriptor {
            label: Some(self.name.clone()),
            width: self.width,
            height: self.height,
            layers: self.layers.len() as u32,
            format: TextureFormat::Rgba8Unorm,
            usage: TextureUsage::TEXTURE_BINDING | TextureUsage::COPY_DST,
        })?;
        for (layer, data) in self.layers.iter().enumerate() {
            if let Err(err) = backend.write_texture(handle, layer as u32, data) {
                backend.destroy_texture(handle);
                return Err(err.into());
            }
        }
        Ok(handle)
    }
}
