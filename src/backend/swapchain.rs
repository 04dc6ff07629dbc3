// Swapchain - Window presentation
//
// Manages the chain of images we render to and present to the screen.
// Negotiation is split into pure functions so the choices can be tested
// without a surface. Teardown is always views first, then the handle.

use ash::extensions::khr;
use ash::vk;
use std::sync::Arc;

use super::image::create_image_view;
use super::DeviceContext;
use crate::error::{RendererError, Result, VkResultExt};

/// What the surface offers to a given physical device.
#[derive(Debug, Clone)]
pub struct SurfaceSupport {
    pub capabilities: vk::SurfaceCapabilitiesKHR,
    pub formats: Vec<vk::SurfaceFormatKHR>,
    pub present_modes: Vec<vk::PresentModeKHR>,
}

impl SurfaceSupport {
    pub fn query(
        loader: &khr::Surface,
        physical_device: vk::PhysicalDevice,
        surface: vk::SurfaceKHR,
    ) -> Result<Self> {
        unsafe {
            Ok(Self {
                capabilities: loader
                    .get_physical_device_surface_capabilities(physical_device, surface)
                    .stage("query surface capabilities")?,
                formats: loader
                    .get_physical_device_surface_formats(physical_device, surface)
                    .stage("query surface formats")?,
                present_modes: loader
                    .get_physical_device_surface_present_modes(physical_device, surface)
                    .stage("query surface present modes")?,
            })
        }
    }

    pub fn is_adequate(&self) -> bool {
        !self.formats.is_empty() && !self.present_modes.is_empty()
    }
}

/// Prefer 8-bit BGRA sRGB, otherwise whatever the surface lists first.
pub fn choose_surface_format(formats: &[vk::SurfaceFormatKHR]) -> Option<vk::SurfaceFormatKHR> {
    formats
        .iter()
        .find(|f| {
            f.format == vk::Format::B8G8R8A8_SRGB && f.color_space == vk::ColorSpaceKHR::SRGB_NONLINEAR
        })
        .or_else(|| formats.first())
        .copied()
}

/// Use `preferred` if offered, FIFO otherwise (always supported).
pub fn choose_present_mode(
    available: &[vk::PresentModeKHR],
    preferred: vk::PresentModeKHR,
) -> vk::PresentModeKHR {
    if available.contains(&preferred) {
        preferred
    } else {
        vk::PresentModeKHR::FIFO
    }
}

/// The surface extent when it is defined, else the window size clamped to
/// the surface bounds.
pub fn choose_extent(caps: &vk::SurfaceCapabilitiesKHR, window: vk::Extent2D) -> vk::Extent2D {
    if caps.current_extent.width != u32::MAX {
        return caps.current_extent;
    }

    vk::Extent2D {
        width: window
            .width
            .clamp(caps.min_image_extent.width, caps.max_image_extent.width),
        height: window
            .height
            .clamp(caps.min_image_extent.height, caps.max_image_extent.height),
    }
}

/// One more than the minimum, capped by the maximum (0 means unbounded).
pub fn choose_image_count(caps: &vk::SurfaceCapabilitiesKHR) -> u32 {
    let count = caps.min_image_count + 1;
    if caps.max_image_count > 0 {
        count.min(caps.max_image_count)
    } else {
        count
    }
}

/// Color attachment always, transfer destination when the surface allows it
/// (the clear-only pass needs it).
pub fn choose_usage(caps: &vk::SurfaceCapabilitiesKHR) -> vk::ImageUsageFlags {
    if caps
        .supported_usage_flags
        .contains(vk::ImageUsageFlags::TRANSFER_DST)
    {
        vk::ImageUsageFlags::COLOR_ATTACHMENT | vk::ImageUsageFlags::TRANSFER_DST
    } else {
        log::warn!("Surface does not support TRANSFER_DST, clear-only pass will not work");
        vk::ImageUsageFlags::COLOR_ATTACHMENT
    }
}

/// Fully negotiated swapchain parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SwapchainPlan {
    pub format: vk::SurfaceFormatKHR,
    pub present_mode: vk::PresentModeKHR,
    pub extent: vk::Extent2D,
    pub image_count: u32,
    pub usage: vk::ImageUsageFlags,
    pub pre_transform: vk::SurfaceTransformFlagsKHR,
}

impl SwapchainPlan {
    pub fn negotiate(
        support: &SurfaceSupport,
        window: vk::Extent2D,
        preferred_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let format = choose_surface_format(&support.formats)
            .ok_or_else(|| RendererError::Surface("surface reports no formats".into()))?;
        let caps = &support.capabilities;

        Ok(Self {
            format,
            present_mode: choose_present_mode(&support.present_modes, preferred_mode),
            extent: choose_extent(caps, window),
            image_count: choose_image_count(caps),
            usage: choose_usage(caps),
            pre_transform: caps.current_transform,
        })
    }
}

/// An acquired swapchain image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AcquiredImage {
    pub index: u32,
    pub suboptimal: bool,
}

pub struct Swapchain {
    loader: khr::Swapchain,
    handle: vk::SwapchainKHR,
    images: Vec<vk::Image>,
    views: Vec<vk::ImageView>,
    format: vk::Format,
    extent: vk::Extent2D,
    preferred_mode: vk::PresentModeKHR,
    generation: u64,
    ctx: Arc<DeviceContext>,
}

impl Swapchain {
    pub fn new(
        ctx: Arc<DeviceContext>,
        window: vk::Extent2D,
        preferred_mode: vk::PresentModeKHR,
    ) -> Result<Self> {
        let loader = khr::Swapchain::new(&ctx.instance, &ctx.device);
        let mut swapchain = Self {
            loader,
            handle: vk::SwapchainKHR::null(),
            images: Vec::new(),
            views: Vec::new(),
            format: vk::Format::UNDEFINED,
            extent: vk::Extent2D::default(),
            preferred_mode,
            generation: 0,
            ctx,
        };
        swapchain.build(window)?;
        Ok(swapchain)
    }

    fn build(&mut self, window: vk::Extent2D) -> Result<()> {
        let (surface_loader, surface) = self
            .ctx
            .surface()
            .ok_or_else(|| RendererError::Surface("device context was created headless".into()))?;

        // Window size may have changed since the last build
        let support = SurfaceSupport::query(surface_loader, self.ctx.physical_device, surface)?;
        let plan = SwapchainPlan::negotiate(&support, window, self.preferred_mode)?;

        log::info!(
            "Creating swapchain: {}x{} {:?} {:?} ({} images requested)",
            plan.extent.width,
            plan.extent.height,
            plan.format.format,
            plan.present_mode,
            plan.image_count
        );

        let queue_families = [self.ctx.graphics_family, self.ctx.present_family];
        let mut create_info = vk::SwapchainCreateInfoKHR::builder()
            .surface(surface)
            .min_image_count(plan.image_count)
            .image_format(plan.format.format)
            .image_color_space(plan.format.color_space)
            .image_extent(plan.extent)
            .image_array_layers(1)
            .image_usage(plan.usage)
            .pre_transform(plan.pre_transform)
            .composite_alpha(vk::CompositeAlphaFlagsKHR::OPAQUE)
            .present_mode(plan.present_mode)
            .clipped(true);

        create_info = if self.ctx.graphics_family != self.ctx.present_family {
            create_info
                .image_sharing_mode(vk::SharingMode::CONCURRENT)
                .queue_family_indices(&queue_families)
        } else {
            create_info.image_sharing_mode(vk::SharingMode::EXCLUSIVE)
        };

        self.handle = unsafe { self.loader.create_swapchain(&create_info, None) }.stage("create swapchain")?;
        self.images = unsafe { self.loader.get_swapchain_images(self.handle) }.stage("get swapchain images")?;
        self.format = plan.format.format;
        self.extent = plan.extent;

        // Pushed one at a time so a failure still leaves `release` a complete list
        for &image in &self.images {
            let view = create_image_view(&self.ctx, image, self.format, vk::ImageAspectFlags::COLOR)?;
            self.views.push(view);
        }

        log::info!("Created swapchain with {} images", self.images.len());
        Ok(())
    }

    /// Destroy the views, then the swapchain handle. The caller guarantees no
    /// submission still references the images.
    fn release(&mut self) {
        unsafe {
            for view in self.views.drain(..) {
                self.ctx.device.destroy_image_view(view, None);
            }
            if self.handle != vk::SwapchainKHR::null() {
                self.loader.destroy_swapchain(self.handle, None);
                self.handle = vk::SwapchainKHR::null();
            }
        }
        self.images.clear();
    }

    /// Rebuild for a new window size: device idle, release, re-query, create.
    pub fn recreate(&mut self, window: vk::Extent2D) -> Result<()> {
        self.ctx.wait_idle()?;
        self.release();
        self.build(window)?;
        self.generation += 1;
        Ok(())
    }

    /// Acquire next image for rendering. `ERROR_OUT_OF_DATE_KHR` comes back as
    /// [`RendererError::SwapchainOutOfDate`].
    pub fn acquire_next_image(&self, semaphore: vk::Semaphore) -> Result<AcquiredImage> {
        let (index, suboptimal) = unsafe {
            self.loader
                .acquire_next_image(self.handle, u64::MAX, semaphore, vk::Fence::null())
        }
        .stage("acquire next image")?;

        Ok(AcquiredImage { index, suboptimal })
    }

    /// Present on the present queue. Returns true when the swapchain should be
    /// rebuilt before the next frame.
    pub fn present(&self, image_index: u32, wait_semaphore: vk::Semaphore) -> Result<bool> {
        let wait_semaphores = [wait_semaphore];
        let swapchains = [self.handle];
        let image_indices = [image_index];

        let present_info = vk::PresentInfoKHR::builder()
            .wait_semaphores(&wait_semaphores)
            .swapchains(&swapchains)
            .image_indices(&image_indices);

        match unsafe { self.loader.queue_present(self.ctx.present_queue, &present_info) } {
            Ok(suboptimal) => Ok(suboptimal),
            Err(vk::Result::ERROR_OUT_OF_DATE_KHR) => Ok(true),
            Err(e) => Err(RendererError::vulkan("present", e)),
        }
    }

    pub fn images(&self) -> &[vk::Image] {
        &self.images
    }

    pub fn views(&self) -> &[vk::ImageView] {
        &self.views
    }

    pub fn image_count(&self) -> usize {
        self.images.len()
    }

    pub fn format(&self) -> vk::Format {
        self.format
    }

    pub fn extent(&self) -> vk::Extent2D {
        self.extent
    }

    /// Number of rebuilds since creation.
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

impl Drop for Swapchain {
    fn drop(&mut self) {
        self.release();
    }
}
