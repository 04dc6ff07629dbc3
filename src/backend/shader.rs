// Shader module loading and management
//
// Vulkan uses SPIR-V bytecode for shaders. Blobs are read from disk at
// pipeline build time; a missing or malformed blob fails that build.

use ash::vk;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use super::DeviceContext;
use crate::error::{RendererError, Result, VkResultExt};

/// Read a SPIR-V file into aligned words.
pub fn load_shader_blob(path: &Path) -> Result<Vec<u32>> {
    let bytes = std::fs::read(path).map_err(|source| RendererError::ShaderBlob {
        path: path.to_path_buf(),
        source,
    })?;

    // read_spv checks length and magic, and handles alignment for us
    ash::util::read_spv(&mut Cursor::new(bytes)).map_err(|_| RendererError::InvalidShader(path.to_path_buf()))
}

pub struct ShaderModule {
    module: vk::ShaderModule,
    ctx: Arc<DeviceContext>,
}

impl ShaderModule {
    pub fn new(ctx: &Arc<DeviceContext>, code: &[u32]) -> Result<Self> {
        let create_info = vk::ShaderModuleCreateInfo::builder().code(code);
        let module = unsafe { ctx.device.create_shader_module(&create_info, None) }.stage("create shader module")?;
        Ok(Self {
            module,
            ctx: ctx.clone(),
        })
    }

    pub fn from_file(ctx: &Arc<DeviceContext>, path: &Path) -> Result<Self> {
        let code = load_shader_blob(path)?;
        log::debug!("Loaded shader {:?} ({} words)", path, code.len());
        Self::new(ctx, &code)
    }

    pub fn handle(&self) -> vk::ShaderModule {
        self.module
    }
}

impl Drop for ShaderModule {
    fn drop(&mut self) {
        unsafe { self.ctx.device.destroy_shader_module(self.module, None) };
    }
}

/// Where compiled shaders live, `<dir>/<name>.spv`.
#[derive(Debug, Clone)]
pub struct ShaderDir(PathBuf);

impl ShaderDir {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self(dir.into())
    }

    pub fn path(&self, name: &str) -> PathBuf {
        self.0.join(format!("{}.spv", name))
    }

    pub fn load(&self, ctx: &Arc<DeviceContext>, name: &str) -> Result<ShaderModule> {
        ShaderModule::from_file(ctx, &self.path(name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SPIRV_MAGIC: u32 = 0x0723_0203;

    fn temp_file(name: &str, bytes: &[u8]) -> PathBuf {
        let path = std::env::temp_dir().join(format!("deferred-vk-{}-{}", std::process::id(), name));
        std::fs::write(&path, bytes).unwrap();
        path
    }

    #[test]
    fn missing_blob_names_the_path() {
        let path = Path::new("definitely/not/here.spv");
        let err = load_shader_blob(path).unwrap_err();
        assert!(matches!(err, RendererError::ShaderBlob { ref path, .. } if path.ends_with("here.spv")));
    }

    #[test]
    fn reads_words_from_valid_header() {
        let mut bytes = Vec::new();
        for word in [SPIRV_MAGIC, 0x0001_0000, 0, 1, 0] {
            bytes.extend_from_slice(&word.to_le_bytes());
        }
        let path = temp_file("valid.spv", &bytes);
        let words = load_shader_blob(&path).unwrap();
        std::fs::remove_file(&path).ok();
        assert_eq!(words.len(), 5);
        assert_eq!(words[0], SPIRV_MAGIC);
    }

    #[test]
    fn truncated_blob_is_invalid() {
        let path = temp_file("truncated.spv", &[0x03, 0x02, 0x23]);
        let err = load_shader_blob(&path).unwrap_err();
        std::fs::remove_file(&path).ok();
        assert!(matches!(err, RendererError::InvalidShader(_)));
    }

    #[test]
    fn shader_dir_appends_extension() {
        let dir = ShaderDir::new("shaders");
        assert_eq!(dir.path("gbuffer.vert"), Path::new("shaders/gbuffer.vert.spv"));
    }
}
