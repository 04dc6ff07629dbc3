// Device Context - Core GPU interface
//
// Responsibilities:
// - Instance creation with validation layers
// - Surface creation for the window (optional, headless contexts skip it)
// - Physical device selection (complete queues, swapchain support, anisotropy)
// - Logical device + graphics/present queues
// - Command pool and the one-shot command buffer protocol

use ash::extensions::{ext::DebugUtils, khr};
use ash::{vk, Entry};
use raw_window_handle::{HasRawDisplayHandle, HasRawWindowHandle};
use std::ffi::{CStr, CString};
use std::sync::Arc;

use super::swapchain::SurfaceSupport;
use crate::error::{RendererError, Result, VkResultExt};

const VALIDATION_LAYER: &CStr = c"VK_LAYER_KHRONOS_validation";

/// Required Vulkan device features for our renderer
const REQUIRED_DEVICE_FEATURES: vk::PhysicalDeviceFeatures = vk::PhysicalDeviceFeatures {
    sampler_anisotropy: vk::TRUE,
    ..unsafe { std::mem::zeroed() }
};

/// Graphics and present queue family indices. Both must be resolved before
/// any queue is touched.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct QueueFamilyIndices {
    pub graphics: Option<u32>,
    pub present: Option<u32>,
}

impl QueueFamilyIndices {
    /// Resolve families from their properties. A family that can do both is
    /// preferred so the common case needs no ownership sharing.
    pub fn find(
        families: &[vk::QueueFamilyProperties],
        supports_present: impl Fn(u32) -> bool,
    ) -> Self {
        let graphics = |props: &vk::QueueFamilyProperties| {
            props.queue_count > 0 && props.queue_flags.contains(vk::QueueFlags::GRAPHICS)
        };

        let both = families
            .iter()
            .enumerate()
            .find(|&(i, props)| graphics(props) && supports_present(i as u32))
            .map(|(i, _)| i as u32);

        if let Some(index) = both {
            return Self {
                graphics: Some(index),
                present: Some(index),
            };
        }

        Self {
            graphics: families.iter().position(graphics).map(|i| i as u32),
            present: (0..families.len() as u32).find(|&i| supports_present(i)),
        }
    }

    pub fn is_complete(&self) -> bool {
        self.graphics.is_some() && self.present.is_some()
    }

    /// Unique family indices, graphics first.
    pub fn unique(&self) -> Vec<u32> {
        let mut families: Vec<u32> = self.graphics.into_iter().chain(self.present).collect();
        families.dedup();
        families
    }
}

struct Surface {
    loader: khr::Surface,
    handle: vk::SurfaceKHR,
}

/// Vulkan device wrapper with automatic cleanup.
///
/// Shared through `Arc`: every GPU resource keeps a handle so it is always
/// destroyed before the device itself.
pub struct DeviceContext {
    pub instance: ash::Instance,
    pub physical_device: vk::PhysicalDevice,
    pub device: ash::Device,

    pub graphics_queue: vk::Queue,
    pub present_queue: vk::Queue,
    pub graphics_family: u32,
    pub present_family: u32,

    pub properties: vk::PhysicalDeviceProperties,
    pub memory_properties: vk::PhysicalDeviceMemoryProperties,

    command_pool: vk::CommandPool,
    surface: Option<Surface>,
    debug_utils: Option<(DebugUtils, vk::DebugUtilsMessengerEXT)>,
    _entry: Entry,
}

impl DeviceContext {
    /// Create a device able to present to `window`.
    pub fn new<W>(app_name: &str, enable_validation: bool, window: &W) -> Result<Arc<Self>>
    where
        W: HasRawDisplayHandle + HasRawWindowHandle,
    {
        let display = window.raw_display_handle();
        let entry = unsafe { Entry::load() }?;

        let surface_extensions = ash_window::enumerate_required_extensions(display)
            .stage("enumerate surface extensions")?
            .to_vec();
        let instance = Self::create_instance(&entry, app_name, enable_validation, surface_extensions)?;

        let handle = match unsafe {
            ash_window::create_surface(&entry, &instance, display, window.raw_window_handle(), None)
        } {
            Ok(handle) => handle,
            Err(e) => {
                unsafe { instance.destroy_instance(None) };
                return Err(RendererError::Surface(e.to_string()));
            }
        };
        let surface = Surface {
            loader: khr::Surface::new(&entry, &instance),
            handle,
        };

        Self::finish(entry, instance, enable_validation, Some(surface))
    }

    /// Create a device without a surface, used for offscreen work and tests.
    /// The present queue aliases the graphics queue.
    pub fn headless(app_name: &str, enable_validation: bool) -> Result<Arc<Self>> {
        let entry = unsafe { Entry::load() }?;
        let instance = Self::create_instance(&entry, app_name, enable_validation, Vec::new())?;
        Self::finish(entry, instance, enable_validation, None)
    }

    fn finish(
        entry: Entry,
        instance: ash::Instance,
        enable_validation: bool,
        surface: Option<Surface>,
    ) -> Result<Arc<Self>> {
        // Locals drop in reverse order, so armed teardowns run device first
        // and instance last when any step below returns early.
        let instance_teardown = Teardown::new({
            let instance = instance.clone();
            move || unsafe { instance.destroy_instance(None) }
        });
        let surface_teardown = surface.as_ref().map(|s| {
            let (loader, handle) = (s.loader.clone(), s.handle);
            Teardown::new(move || unsafe { loader.destroy_surface(handle, None) })
        });

        let debug_utils = if enable_validation {
            Some(Self::setup_debug_messenger(&entry, &instance)?)
        } else {
            None
        };
        let debug_teardown = debug_utils.as_ref().map(|(utils, messenger)| {
            let (utils, messenger) = (utils.clone(), *messenger);
            Teardown::new(move || unsafe { utils.destroy_debug_utils_messenger(messenger, None) })
        });

        let (physical_device, families) = Self::pick_physical_device(&instance, surface.as_ref())?;
        // pick_physical_device only returns complete families
        let graphics_family = families.graphics.ok_or(RendererError::NoSuitableDevice)?;
        let present_family = families.present.ok_or(RendererError::NoSuitableDevice)?;

        let device = Self::create_logical_device(&instance, physical_device, &families, surface.is_some())?;
        let device_teardown = Teardown::new({
            let device = device.clone();
            move || unsafe { device.destroy_device(None) }
        });
        let graphics_queue = unsafe { device.get_device_queue(graphics_family, 0) };
        let present_queue = unsafe { device.get_device_queue(present_family, 0) };

        let properties = unsafe { instance.get_physical_device_properties(physical_device) };
        let memory_properties = unsafe { instance.get_physical_device_memory_properties(physical_device) };

        log::info!(
            "Selected GPU: {}",
            unsafe { CStr::from_ptr(properties.device_name.as_ptr()) }.to_string_lossy()
        );
        log::info!(
            "API Version: {}.{}.{}",
            vk::api_version_major(properties.api_version),
            vk::api_version_minor(properties.api_version),
            vk::api_version_patch(properties.api_version)
        );
        log::info!("Queue families: graphics={} present={}", graphics_family, present_family);

        let pool_info = vk::CommandPoolCreateInfo::builder()
            .queue_family_index(graphics_family)
            .flags(vk::CommandPoolCreateFlags::RESET_COMMAND_BUFFER);
        let command_pool = unsafe { device.create_command_pool(&pool_info, None) }.stage("create command pool")?;

        // Ownership moves to the context, whose Drop destroys everything
        device_teardown.disarm();
        if let Some(teardown) = debug_teardown {
            teardown.disarm();
        }
        if let Some(teardown) = surface_teardown {
            teardown.disarm();
        }
        instance_teardown.disarm();

        Ok(Arc::new(Self {
            instance,
            physical_device,
            device,
            graphics_queue,
            present_queue,
            graphics_family,
            present_family,
            properties,
            memory_properties,
            command_pool,
            surface,
            debug_utils,
            _entry: entry,
        }))
    }

    fn create_instance(
        entry: &Entry,
        app_name: &str,
        enable_validation: bool,
        mut extensions: Vec<*const std::ffi::c_char>,
    ) -> Result<ash::Instance> {
        let app_name_cstr = CString::new(app_name).unwrap_or_default();
        let engine_name = c"deferred-vk";

        let app_info = vk::ApplicationInfo::builder()
            .application_name(&app_name_cstr)
            .application_version(vk::make_api_version(0, 0, 1, 0))
            .engine_name(engine_name)
            .engine_version(vk::make_api_version(0, 0, 1, 0))
            .api_version(vk::API_VERSION_1_2);

        let layer_names = if enable_validation {
            Self::check_validation_layer(entry)?;
            extensions.push(DebugUtils::name().as_ptr());
            vec![VALIDATION_LAYER.as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::InstanceCreateInfo::builder()
            .application_info(&app_info)
            .enabled_extension_names(&extensions)
            .enabled_layer_names(&layer_names);

        unsafe { entry.create_instance(&create_info, None) }.stage("create instance")
    }

    fn check_validation_layer(entry: &Entry) -> Result<()> {
        let layers = entry
            .enumerate_instance_layer_properties()
            .stage("enumerate instance layers")?;

        let found = layers
            .iter()
            .any(|layer| unsafe { CStr::from_ptr(layer.layer_name.as_ptr()) } == VALIDATION_LAYER);

        if found {
            Ok(())
        } else {
            Err(RendererError::MissingValidationLayer(
                VALIDATION_LAYER.to_string_lossy().into_owned(),
            ))
        }
    }

    fn setup_debug_messenger(
        entry: &Entry,
        instance: &ash::Instance,
    ) -> Result<(DebugUtils, vk::DebugUtilsMessengerEXT)> {
        let debug_utils = DebugUtils::new(entry, instance);

        let create_info = vk::DebugUtilsMessengerCreateInfoEXT::builder()
            .message_severity(
                vk::DebugUtilsMessageSeverityFlagsEXT::WARNING
                    | vk::DebugUtilsMessageSeverityFlagsEXT::ERROR,
            )
            .message_type(
                vk::DebugUtilsMessageTypeFlagsEXT::GENERAL
                    | vk::DebugUtilsMessageTypeFlagsEXT::VALIDATION
                    | vk::DebugUtilsMessageTypeFlagsEXT::PERFORMANCE,
            )
            .pfn_user_callback(Some(debug_callback));

        let messenger = unsafe { debug_utils.create_debug_utils_messenger(&create_info, None) }
            .stage("create debug messenger")?;

        Ok((debug_utils, messenger))
    }

    fn pick_physical_device(
        instance: &ash::Instance,
        surface: Option<&Surface>,
    ) -> Result<(vk::PhysicalDevice, QueueFamilyIndices)> {
        let devices = unsafe { instance.enumerate_physical_devices() }.stage("enumerate physical devices")?;

        let mut best = None;
        let mut best_score = 0;

        for device in devices {
            let Some(families) = Self::check_device(instance, device, surface)? else {
                continue;
            };

            let props = unsafe { instance.get_physical_device_properties(device) };
            let score = match props.device_type {
                vk::PhysicalDeviceType::DISCRETE_GPU => 1000,
                vk::PhysicalDeviceType::INTEGRATED_GPU => 100,
                _ => 1,
            };

            if score > best_score {
                best_score = score;
                best = Some((device, families));
            }
        }

        best.ok_or(RendererError::NoSuitableDevice)
    }

    /// Returns the resolved queue families when `device` meets every requirement.
    fn check_device(
        instance: &ash::Instance,
        device: vk::PhysicalDevice,
        surface: Option<&Surface>,
    ) -> Result<Option<QueueFamilyIndices>> {
        let features = unsafe { instance.get_physical_device_features(device) };
        if features.sampler_anisotropy != vk::TRUE {
            return Ok(None);
        }

        let queue_families = unsafe { instance.get_physical_device_queue_family_properties(device) };
        let families = match surface {
            Some(surface) => QueueFamilyIndices::find(&queue_families, |i| unsafe {
                surface
                    .loader
                    .get_physical_device_surface_support(device, i, surface.handle)
                    .unwrap_or(false)
            }),
            // Without a surface any graphics family can "present"
            None => QueueFamilyIndices::find(&queue_families, |i| {
                queue_families[i as usize].queue_flags.contains(vk::QueueFlags::GRAPHICS)
            }),
        };
        if !families.is_complete() {
            return Ok(None);
        }

        let Some(surface) = surface else {
            return Ok(Some(families));
        };

        let extensions = unsafe { instance.enumerate_device_extension_properties(device) }
            .stage("enumerate device extensions")?;
        let has_swapchain = extensions
            .iter()
            .any(|ext| unsafe { CStr::from_ptr(ext.extension_name.as_ptr()) } == khr::Swapchain::name());
        if !has_swapchain {
            return Ok(None);
        }

        let support = SurfaceSupport::query(&surface.loader, device, surface.handle)?;
        Ok(support.is_adequate().then_some(families))
    }

    fn create_logical_device(
        instance: &ash::Instance,
        physical_device: vk::PhysicalDevice,
        families: &QueueFamilyIndices,
        presenting: bool,
    ) -> Result<ash::Device> {
        let queue_priorities = [1.0];
        let queue_create_infos: Vec<_> = families
            .unique()
            .into_iter()
            .map(|family| {
                vk::DeviceQueueCreateInfo::builder()
                    .queue_family_index(family)
                    .queue_priorities(&queue_priorities)
                    .build()
            })
            .collect();

        let extensions = if presenting {
            vec![khr::Swapchain::name().as_ptr()]
        } else {
            vec![]
        };

        let create_info = vk::DeviceCreateInfo::builder()
            .queue_create_infos(&queue_create_infos)
            .enabled_extension_names(&extensions)
            .enabled_features(&REQUIRED_DEVICE_FEATURES);

        unsafe { instance.create_device(physical_device, &create_info, None) }.stage("create logical device")
    }

    /// Surface loader and handle, `None` for headless contexts.
    pub fn surface(&self) -> Option<(&khr::Surface, vk::SurfaceKHR)> {
        self.surface.as_ref().map(|s| (&s.loader, s.handle))
    }

    pub fn max_sampler_anisotropy(&self) -> f32 {
        self.properties.limits.max_sampler_anisotropy
    }

    /// Allocate primary command buffers that return to the pool on drop.
    pub fn allocate_primary(self: &Arc<Self>, count: u32) -> Result<CommandBuffers> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(count);

        let buffers = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .stage("allocate command buffers")?;

        Ok(CommandBuffers {
            ctx: self.clone(),
            buffers,
        })
    }

    /// Start a single-use command buffer for setup-time work.
    pub fn begin_one_shot(&self) -> Result<vk::CommandBuffer> {
        let alloc_info = vk::CommandBufferAllocateInfo::builder()
            .command_pool(self.command_pool)
            .level(vk::CommandBufferLevel::PRIMARY)
            .command_buffer_count(1);

        let cmd = unsafe { self.device.allocate_command_buffers(&alloc_info) }
            .stage("allocate one-shot command buffer")?[0];

        let begin_info =
            vk::CommandBufferBeginInfo::builder().flags(vk::CommandBufferUsageFlags::ONE_TIME_SUBMIT);
        if let Err(e) = unsafe { self.device.begin_command_buffer(cmd, &begin_info) } {
            unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
            return Err(RendererError::vulkan("begin one-shot command buffer", e));
        }

        Ok(cmd)
    }

    /// Submit `cmd` to the graphics queue and block until the queue is idle.
    /// The command buffer is freed whether or not submission succeeds.
    pub fn end_one_shot(&self, cmd: vk::CommandBuffer) -> Result<()> {
        let submit = || -> Result<()> {
            unsafe {
                self.device.end_command_buffer(cmd).stage("end one-shot command buffer")?;

                let command_buffers = [cmd];
                let submit_info = vk::SubmitInfo::builder().command_buffers(&command_buffers);
                self.device
                    .queue_submit(self.graphics_queue, &[submit_info.build()], vk::Fence::null())
                    .stage("submit one-shot command buffer")?;
                self.device
                    .queue_wait_idle(self.graphics_queue)
                    .stage("wait for one-shot command buffer")
            }
        };

        let result = submit();
        unsafe { self.device.free_command_buffers(self.command_pool, &[cmd]) };
        result
    }

    /// Record with `record` and run synchronously.
    pub fn one_shot<F>(&self, record: F) -> Result<()>
    where
        F: FnOnce(&ash::Device, vk::CommandBuffer),
    {
        let cmd = self.begin_one_shot()?;
        record(&self.device, cmd);
        self.end_one_shot(cmd)
    }

    /// Wait for device to be idle (e.g., before cleanup)
    pub fn wait_idle(&self) -> Result<()> {
        unsafe { self.device.device_wait_idle() }.stage("wait for device idle")
    }
}

impl Drop for DeviceContext {
    fn drop(&mut self) {
        log::info!("Destroying Vulkan device...");

        let _ = self.wait_idle();

        unsafe {
            self.device.destroy_command_pool(self.command_pool, None);
            self.device.destroy_device(None);

            if let Some(surface) = self.surface.take() {
                surface.loader.destroy_surface(surface.handle, None);
            }

            if let Some((debug_utils, messenger)) = self.debug_utils.take() {
                debug_utils.destroy_debug_utils_messenger(messenger, None);
            }

            self.instance.destroy_instance(None);
        }
    }
}

/// Destroys a partially built object on drop unless `disarm` was called.
struct Teardown<F: FnOnce()> {
    destroy: Option<F>,
}

impl<F: FnOnce()> Teardown<F> {
    fn new(destroy: F) -> Self {
        Self { destroy: Some(destroy) }
    }

    fn disarm(mut self) {
        self.destroy = None;
    }
}

impl<F: FnOnce()> Drop for Teardown<F> {
    fn drop(&mut self) {
        if let Some(destroy) = self.destroy.take() {
            destroy();
        }
    }
}

/// Primary command buffers owned by the device's pool.
pub struct CommandBuffers {
    ctx: Arc<DeviceContext>,
    buffers: Vec<vk::CommandBuffer>,
}

impl CommandBuffers {
    pub fn get(&self, index: usize) -> Option<vk::CommandBuffer> {
        self.buffers.get(index).copied()
    }

    pub fn as_slice(&self) -> &[vk::CommandBuffer] {
        &self.buffers
    }

    pub fn len(&self) -> usize {
        self.buffers.len()
    }
}

impl Drop for CommandBuffers {
    fn drop(&mut self) {
        if !self.buffers.is_empty() {
            unsafe {
                self.ctx
                    .device
                    .free_command_buffers(self.ctx.command_pool, &self.buffers)
            };
        }
    }
}

// Debug callback for validation layers
unsafe extern "system" fn debug_callback(
    message_severity: vk::DebugUtilsMessageSeverityFlagsEXT,
    _message_type: vk::DebugUtilsMessageTypeFlagsEXT,
    p_callback_data: *const vk::DebugUtilsMessengerCallbackDataEXT,
    _p_user_data: *mut std::ffi::c_void,
) -> vk::Bool32 {
    let message = CStr::from_ptr((*p_callback_data).p_message);

    match message_severity {
        vk::DebugUtilsMessageSeverityFlagsEXT::ERROR => {
            log::error!("[Vulkan] {}", message.to_string_lossy());
        }
        vk::DebugUtilsMessageSeverityFlagsEXT::WARNING => {
            log::warn!("[Vulkan] {}", message.to_string_lossy());
        }
        _ => {
            log::debug!("[Vulkan] {}", message.to_string_lossy());
        }
    }

    vk::FALSE
}

#[cfg(test)]
mod tests {
    use super::*;

    fn family(flags: vk::QueueFlags) -> vk::QueueFamilyProperties {
        vk::QueueFamilyProperties {
            queue_flags: flags,
            queue_count: 1,
            ..Default::default()
        }
    }

    #[test]
    fn prefers_family_that_does_both() {
        let families = [
            family(vk::QueueFlags::GRAPHICS),
            family(vk::QueueFlags::TRANSFER),
            family(vk::QueueFlags::GRAPHICS | vk::QueueFlags::COMPUTE),
        ];
        let indices = QueueFamilyIndices::find(&families, |i| i != 0);
        assert_eq!(indices.graphics, Some(2));
        assert_eq!(indices.present, Some(2));
        assert_eq!(indices.unique(), vec![2]);
    }

    #[test]
    fn split_families_resolve_separately() {
        let families = [family(vk::QueueFlags::GRAPHICS), family(vk::QueueFlags::TRANSFER)];
        let indices = QueueFamilyIndices::find(&families, |i| i == 1);
        assert!(indices.is_complete());
        assert_eq!(indices.graphics, Some(0));
        assert_eq!(indices.present, Some(1));
        assert_eq!(indices.unique(), vec![0, 1]);
    }

    #[test]
    fn missing_present_is_incomplete() {
        let families = [family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::find(&families, |_| false);
        assert_eq!(indices.graphics, Some(0));
        assert!(!indices.is_complete());
    }

    #[test]
    fn empty_family_is_ignored() {
        let mut empty = family(vk::QueueFlags::GRAPHICS);
        empty.queue_count = 0;
        let families = [empty, family(vk::QueueFlags::GRAPHICS)];
        let indices = QueueFamilyIndices::find(&families, |_| true);
        assert_eq!(indices.graphics, Some(1));
    }

    #[test]
    fn failed_init_tears_down_in_reverse_order() {
        use std::cell::RefCell;

        let destroyed = RefCell::new(Vec::new());
        let build = |fail_at_device: bool| -> Result<()> {
            let _instance = Teardown::new(|| destroyed.borrow_mut().push("instance"));
            let _surface = Teardown::new(|| destroyed.borrow_mut().push("surface"));
            if fail_at_device {
                return Err(RendererError::NoSuitableDevice);
            }
            let device = Teardown::new(|| destroyed.borrow_mut().push("device"));
            device.disarm();
            Ok(())
        };

        assert!(build(true).is_err());
        assert_eq!(*destroyed.borrow(), vec!["surface", "instance"]);
    }

    #[test]
    fn disarmed_teardown_leaves_objects_alive() {
        use std::cell::Cell;

        let runs = Cell::new(0);
        Teardown::new(|| runs.set(runs.get() + 1)).disarm();
        assert_eq!(runs.get(), 0);
        drop(Teardown::new(|| runs.set(runs.get() + 1)));
        assert_eq!(runs.get(), 1);
    }

    #[test]
    #[ignore = "requires a Vulkan device"]
    fn one_shot_runs_to_completion() {
        let ctx = DeviceContext::headless("one-shot-test", false).unwrap();
        ctx.one_shot(|_, _| {}).unwrap();
        let buffers = ctx.allocate_primary(3).unwrap();
        assert_eq!(buffers.len(), 3);
    }
}
