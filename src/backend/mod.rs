// Backend module - Vulkan abstraction layer
//
// Thin RAII wrappers around ash. Every wrapper keeps an `Arc<DeviceContext>`
// so the device outlives everything created from it.

pub mod buffer;
pub mod descriptor;
pub mod device;
pub mod frame;
pub mod image;
pub mod memory;
pub mod pipeline;
pub mod shader;
pub mod swapchain;
pub mod sync;

pub use device::DeviceContext;
pub use swapchain::Swapchain;
