// Path-keyed asset cache
//
// Each asset is loaded once per normalised path and shared through `Arc`.
// Failed loads are not cached, so a later request retries.

use std::collections::HashMap;
use std::path::{Component, Path, PathBuf};
use std::sync::Arc;

use crate::error::Result;

/// Lexical normalisation: drops `.`, folds `name/..`. Does not touch the
/// filesystem, so symlinks are not resolved.
pub fn normalize_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                let can_pop = matches!(out.components().next_back(), Some(Component::Normal(_)));
                if can_pop {
                    out.pop();
                } else if !out.has_root() {
                    out.push("..");
                }
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}

pub struct AssetCache<T> {
    entries: HashMap<PathBuf, Arc<T>>,
}

impl<T> AssetCache<T> {
    pub fn new() -> Self {
        Self {
            entries: HashMap::new(),
        }
    }

    /// Return the cached asset for `path`, loading it with `load` on a miss.
    pub fn get_or_load<F>(&mut self, path: &Path, load: F) -> Result<Arc<T>>
    where
        F: FnOnce(&Path) -> Result<T>,
    {
        let key = normalize_path(path);
        if let Some(asset) = self.entries.get(&key) {
            log::debug!("Asset cache hit: {:?}", key);
            return Ok(asset.clone());
        }

        let asset = Arc::new(load(&key)?);
        self.entries.insert(key, asset.clone());
        Ok(asset)
    }

    pub fn get(&self, path: &Path) -> Option<Arc<T>> {
        self.entries.get(&normalize_path(path)).cloned()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl<T> Default for AssetCache<T> {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::RendererError;
    use std::cell::Cell;

    #[test]
    fn normalizes_dots() {
        assert_eq!(normalize_path(Path::new("models/./cube.obj")), Path::new("models/cube.obj"));
        assert_eq!(normalize_path(Path::new("models/sub/../cube.obj")), Path::new("models/cube.obj"));
        assert_eq!(normalize_path(Path::new("../assets/a.png")), Path::new("../assets/a.png"));
        assert_eq!(normalize_path(Path::new("/a/../../b")), Path::new("/b"));
    }

    #[test]
    fn equivalent_paths_share_one_load() {
        let loads = Cell::new(0);
        let mut cache = AssetCache::new();
        let load = |p: &Path| {
            loads.set(loads.get() + 1);
            Ok(p.to_string_lossy().into_owned())
        };

        let a = cache.get_or_load(Path::new("tex/./wood.png"), load).unwrap();
        let b = cache.get_or_load(Path::new("tex/x/../wood.png"), load).unwrap();

        assert_eq!(loads.get(), 1);
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(*a, "tex/wood.png");
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn failed_loads_are_retried() {
        let mut cache: AssetCache<u32> = AssetCache::new();
        let fail = |p: &Path| {
            Err(RendererError::Asset {
                path: p.to_path_buf(),
                reason: "nope".into(),
            })
        };

        assert!(cache.get_or_load(Path::new("a.png"), fail).is_err());
        assert!(cache.is_empty());
        assert_eq!(*cache.get_or_load(Path::new("a.png"), |_| Ok(7)).unwrap(), 7);
        assert_eq!(cache.get(Path::new("./a.png")).as_deref(), Some(&7));
    }
}
