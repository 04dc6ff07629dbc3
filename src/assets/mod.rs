// Asset collaborators
//
// Mesh import and image decoding sit behind small traits so passes only see
// decoded data. `AssetLoader` pairs each with a cache.

pub mod cache;
pub mod image;
pub mod mesh;

use std::path::{Path, PathBuf};
use std::sync::Arc;

pub use cache::AssetCache;
pub use image::{DecodedImage, RgbaDecoder};
pub use mesh::{MeshData, ObjImporter, Vertex};

use crate::error::{RendererError, Result};

pub trait MeshImporter {
    fn import(&self, path: &Path) -> Result<Vec<MeshData>>;
}

/// Returns `None` when the file cannot be decoded.
pub trait ImageDecoder {
    fn decode(&self, path: &Path) -> Option<DecodedImage>;
}

pub struct AssetLoader {
    importer: Box<dyn MeshImporter>,
    decoder: Box<dyn ImageDecoder>,
    meshes: AssetCache<Vec<MeshData>>,
    images: AssetCache<DecodedImage>,
}

impl AssetLoader {
    pub fn new(importer: Box<dyn MeshImporter>, decoder: Box<dyn ImageDecoder>) -> Self {
        Self {
            importer,
            decoder,
            meshes: AssetCache::new(),
            images: AssetCache::new(),
        }
    }

    pub fn meshes(&mut self, path: &Path) -> Result<Arc<Vec<MeshData>>> {
        let importer = &self.importer;
        self.meshes.get_or_load(path, |p| importer.import(p))
    }

    /// A decoder returning nothing is turned into an error here, before any
    /// GPU upload is attempted.
    pub fn image(&mut self, path: &Path) -> Result<Arc<DecodedImage>> {
        let decoder = &self.decoder;
        self.images.get_or_load(path, |p| {
            decoder.decode(p).ok_or_else(|| RendererError::Asset {
                path: PathBuf::from(p),
                reason: "image decoder returned no pixels".into(),
            })
        })
    }
}

impl Default for AssetLoader {
    fn default() -> Self {
        Self::new(Box::new(ObjImporter), Box::new(RgbaDecoder))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;
    use std::rc::Rc;

    struct CountingDecoder(Rc<Cell<u32>>);

    impl ImageDecoder for CountingDecoder {
        fn decode(&self, path: &Path) -> Option<DecodedImage> {
            self.0.set(self.0.get() + 1);
            (path.extension()? == "png").then(|| DecodedImage::solid_color([1, 2, 3, 4]))
        }
    }

    #[test]
    fn null_decode_becomes_asset_error() {
        let calls = Rc::new(Cell::new(0));
        let mut loader = AssetLoader::new(Box::new(ObjImporter), Box::new(CountingDecoder(calls.clone())));

        let err = loader.image(Path::new("broken.tga")).unwrap_err();
        assert!(matches!(err, RendererError::Asset { .. }));

        loader.image(Path::new("ok.png")).unwrap();
        loader.image(Path::new("./ok.png")).unwrap();
        assert_eq!(calls.get(), 2);
    }
}
