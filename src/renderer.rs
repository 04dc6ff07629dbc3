// Renderer - ties the swapchain, frame engine and active pass together
//
// Resize handling: a resize only sets a flag. The rebuild happens at the top
// of the next frame, or right after a frame reports the swapchain stale.

use ash::vk;
use std::sync::Arc;

use crate::assets::AssetLoader;
use crate::backend::frame::{FrameEngine, FrameOutcome};
use crate::backend::{DeviceContext, Swapchain};
use crate::error::Result;
use crate::passes::{FramePass, Pass, PassKind, PassSettings};

pub struct RendererSettings {
    pub pass: PassKind,
    pub present_mode: vk::PresentModeKHR,
    pub frames_in_flight: usize,
    pub pass_settings: PassSettings,
}

/// What to do at the top of a frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameAction {
    /// The window has no area; draw nothing and keep any pending resize.
    Skip,
    Draw { rebuild_first: bool },
}

pub fn next_action(window_extent: vk::Extent2D, resize_requested: bool) -> FrameAction {
    if window_extent.width == 0 || window_extent.height == 0 {
        FrameAction::Skip
    } else {
        FrameAction::Draw {
            rebuild_first: resize_requested,
        }
    }
}

/// Result of one frame attempt as the caller sees it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameReport {
    pub presented: bool,
    /// Rebuild the swapchain before the next frame.
    pub rebuild: bool,
}

impl FrameReport {
    /// Transient presentation errors become a skipped frame plus a rebuild;
    /// anything else is passed through.
    pub fn from_draw(result: Result<FrameOutcome>) -> Result<Self> {
        match result {
            Ok(outcome) => Ok(Self {
                presented: outcome != FrameOutcome::SwapchainStale,
                rebuild: outcome.needs_recreate(),
            }),
            Err(e) if e.is_transient() => {
                log::warn!("Transient presentation error: {}", e);
                Ok(Self {
                    presented: false,
                    rebuild: true,
                })
            }
            Err(e) => Err(e),
        }
    }
}

/// The pieces a swapchain rebuild touches, in the order `rebuild` runs them.
pub trait RebuildSteps {
    fn wait_idle(&mut self) -> Result<()>;
    fn free_pass_resources(&mut self);
    /// Returns the new image count.
    fn recreate_swapchain(&mut self, window_extent: vk::Extent2D) -> Result<usize>;
    fn reset_images(&mut self, image_count: usize);
    fn recreate_pass_resources(&mut self) -> Result<()>;
}

/// Device idle, release pass resources, rebuild swapchain, reset per-image
/// tracking, rebuild pass.
pub fn rebuild<S: RebuildSteps>(steps: &mut S, window_extent: vk::Extent2D) -> Result<()> {
    steps.wait_idle()?;
    steps.free_pass_resources();
    let image_count = steps.recreate_swapchain(window_extent)?;
    steps.reset_images(image_count);
    steps.recreate_pass_resources()
}

/// Field order is drop order: the pass releases its swapchain-sized objects
/// before the swapchain goes away.
pub struct Renderer {
    pass: Pass,
    frames: FrameEngine,
    swapchain: Swapchain,
    resize_requested: bool,
    ctx: Arc<DeviceContext>,
}

impl Renderer {
    pub fn new(
        ctx: &Arc<DeviceContext>,
        window_extent: vk::Extent2D,
        settings: &RendererSettings,
        assets: &mut AssetLoader,
    ) -> Result<Self> {
        let swapchain = Swapchain::new(ctx.clone(), window_extent, settings.present_mode)?;
        let frames = FrameEngine::new(ctx, settings.frames_in_flight, swapchain.image_count())?;
        let pass = Pass::new(settings.pass, ctx, &swapchain, &settings.pass_settings, assets)?;

        Ok(Self {
            pass,
            frames,
            swapchain,
            resize_requested: false,
            ctx: ctx.clone(),
        })
    }

    pub fn request_resize(&mut self) {
        self.resize_requested = true;
    }

    pub fn swapchain(&self) -> &Swapchain {
        &self.swapchain
    }

    /// Draws one frame. Returns `false` when nothing was presented, either
    /// because the window has no area or because the swapchain had to be
    /// rebuilt first.
    pub fn render_frame(&mut self, window_extent: vk::Extent2D) -> Result<bool> {
        match next_action(window_extent, self.resize_requested) {
            FrameAction::Skip => return Ok(false),
            FrameAction::Draw { rebuild_first: true } => self.recreate(window_extent)?,
            FrameAction::Draw { rebuild_first: false } => {}
        }

        let report = FrameReport::from_draw(self.frames.draw_frame(&self.swapchain, &mut self.pass))?;
        if report.rebuild {
            log::debug!("Frame reported {:?}, scheduling swapchain rebuild", report);
            self.resize_requested = true;
        }
        Ok(report.presented)
    }

    pub fn recreate(&mut self, window_extent: vk::Extent2D) -> Result<()> {
        rebuild(self, window_extent)?;
        self.resize_requested = false;
        log::info!(
            "Swapchain generation {} ready at {}x{}",
            self.swapchain.generation(),
            self.swapchain.extent().width,
            self.swapchain.extent().height
        );
        Ok(())
    }
}

impl RebuildSteps for Renderer {
    fn wait_idle(&mut self) -> Result<()> {
        self.ctx.wait_idle()
    }

    fn free_pass_resources(&mut self) {
        self.pass.free_resources();
    }

    fn recreate_swapchain(&mut self, window_extent: vk::Extent2D) -> Result<usize> {
        self.swapchain.recreate(window_extent)?;
        Ok(self.swapchain.image_count())
    }

    fn reset_images(&mut self, image_count: usize) {
        self.frames.on_swapchain_recreated(image_count);
    }

    fn recreate_pass_resources(&mut self) -> Result<()> {
        self.pass.recreate_resources(&self.swapchain)
    }
}

impl Drop for Renderer {
    fn drop(&mut self) {
        if let Err(e) = self.ctx.wait_idle() {
            log::error!("wait_idle failed during renderer shutdown: {}", e);
        }
    }
}
