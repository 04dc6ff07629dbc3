// Renderer errors
//
// Every failure the backend can produce, tagged with the class that decides
// how the frame loop reacts to it.

use ash::vk;
use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, RendererError>;

/// How the caller is expected to react to an error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Broken environment or failed object creation. Abort.
    Initialization,
    /// Swapchain no longer matches the surface. Rebuild and carry on.
    TransientPresentation,
    /// The caller asked for something the backend never supports.
    ContractViolation,
    /// Out of memory or no usable memory type.
    ResourceExhaustion,
}

#[derive(Debug, Error)]
pub enum RendererError {
    #[error("failed to load the Vulkan library: {0}")]
    Loading(#[from] ash::LoadingError),

    #[error("{stage} failed: {result}")]
    Vulkan { stage: &'static str, result: vk::Result },

    #[error("{stage} ran out of memory: {result}")]
    OutOfMemory { stage: &'static str, result: vk::Result },

    #[error("no physical device satisfies the renderer requirements")]
    NoSuitableDevice,

    #[error("requested validation layer {0} is not available")]
    MissingValidationLayer(String),

    #[error("window surface unavailable: {0}")]
    Surface(String),

    #[error("swapchain is out of date")]
    SwapchainOutOfDate,

    #[error("unsupported image layout transition {old:?} -> {new:?}")]
    UnsupportedTransition {
        old: vk::ImageLayout,
        new: vk::ImageLayout,
    },

    #[error("no memory type matches bits {type_bits:#b} with {properties:?}")]
    NoMatchingMemoryType {
        type_bits: u32,
        properties: vk::MemoryPropertyFlags,
    },

    #[error("failed to read shader blob {path:?}: {source}")]
    ShaderBlob {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("shader blob {0:?} is not valid SPIR-V")]
    InvalidShader(PathBuf),

    #[error("asset {path:?} could not be loaded: {reason}")]
    Asset { path: PathBuf, reason: String },

    #[error("fence wait timed out during {0}")]
    Timeout(&'static str),

    #[error("framebuffer expects {expected} attachments, got {actual}")]
    FramebufferMismatch { expected: usize, actual: usize },

    #[error("write of {len} bytes exceeds buffer capacity {capacity}")]
    BufferOverflow { len: u64, capacity: u64 },

    #[error("render targets were released and not rebuilt")]
    ResourcesReleased,
}

impl RendererError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::SwapchainOutOfDate => ErrorClass::TransientPresentation,
            Self::UnsupportedTransition { .. }
            | Self::FramebufferMismatch { .. }
            | Self::BufferOverflow { .. }
            | Self::ResourcesReleased => ErrorClass::ContractViolation,
            Self::OutOfMemory { .. } | Self::NoMatchingMemoryType { .. } => ErrorClass::ResourceExhaustion,
            _ => ErrorClass::Initialization,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.class() == ErrorClass::TransientPresentation
    }

    /// Wrap a raw Vulkan result with the stage that produced it.
    pub fn vulkan(stage: &'static str, result: vk::Result) -> Self {
        match result {
            vk::Result::ERROR_OUT_OF_HOST_MEMORY | vk::Result::ERROR_OUT_OF_DEVICE_MEMORY => {
                Self::OutOfMemory { stage, result }
            }
            vk::Result::ERROR_OUT_OF_DATE_KHR => Self::SwapchainOutOfDate,
            vk::Result::TIMEOUT => Self::Timeout(stage),
            _ => Self::Vulkan { stage, result },
        }
    }
}

/// Attach a stage name to ash results, `.stage("create buffer")?`.
pub trait VkResultExt<T> {
    fn stage(self, stage: &'static str) -> Result<T>;
}

impl<T> VkResultExt<T> for std::result::Result<T, vk::Result> {
    fn stage(self, stage: &'static str) -> Result<T> {
        self.map_err(|result| RendererError::vulkan(stage, result))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_failures_are_resource_exhaustion() {
        let err: Result<()> = Err(vk::Result::ERROR_OUT_OF_DEVICE_MEMORY).stage("allocate image memory");
        let err = err.unwrap_err();
        assert_eq!(err.class(), ErrorClass::ResourceExhaustion);
        assert!(err.to_string().contains("allocate image memory"));
    }

    #[test]
    fn out_of_date_is_the_only_transient_error() {
        assert!(RendererError::vulkan("acquire", vk::Result::ERROR_OUT_OF_DATE_KHR).is_transient());
        assert!(!RendererError::vulkan("acquire", vk::Result::ERROR_DEVICE_LOST).is_transient());
        assert!(!RendererError::NoSuitableDevice.is_transient());
    }

    #[test]
    fn bad_transition_is_a_contract_violation() {
        let err = RendererError::UnsupportedTransition {
            old: vk::ImageLayout::SHADER_READ_ONLY_OPTIMAL,
            new: vk::ImageLayout::UNDEFINED,
        };
        assert_eq!(err.class(), ErrorClass::ContractViolation);
    }

    #[test]
    fn fence_timeout_keeps_the_stage() {
        let err = RendererError::vulkan("wait for frame fence", vk::Result::TIMEOUT);
        assert!(matches!(err, RendererError::Timeout("wait for frame fence")));
        assert_eq!(err.class(), ErrorClass::Initialization);
    }
}
