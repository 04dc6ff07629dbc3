// Frame loop - acquire, submit, present
//
// FRAME TIMELINE (slot i = frame index mod F):
// ┌──────────────────────────────────────────────────────────────────────┐
// │  wait fence[i] ─> acquire ─> wait image owner ─> update ─> submit   │
// │                     │                                      │        │
// │               (out of date:                          present ─> i+1 │
// │                return stale)                                        │
// └──────────────────────────────────────────────────────────────────────┘

use ash::vk;
use std::sync::Arc;
use std::time::Instant;

use super::swapchain::Swapchain;
use super::sync::{FrameRing, FrameSync};
use super::DeviceContext;
use crate::error::{RendererError, Result, VkResultExt};
use crate::passes::FramePass;

/// Time values handed to passes each frame, in milliseconds.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FrameTimes {
    pub elapsed_ms: f32,
    pub delta_ms: f32,
}

#[derive(Debug, Clone, Copy)]
pub struct FrameClock {
    start: Instant,
    last: Instant,
}

impl FrameClock {
    pub fn new() -> Self {
        Self::starting_at(Instant::now())
    }

    pub fn starting_at(start: Instant) -> Self {
        Self { start, last: start }
    }

    pub fn tick(&mut self) -> FrameTimes {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> FrameTimes {
        let times = FrameTimes {
            elapsed_ms: now.saturating_duration_since(self.start).as_secs_f32() * 1000.0,
            delta_ms: now.saturating_duration_since(self.last).as_secs_f32() * 1000.0,
        };
        self.last = now;
        times
    }
}

impl Default for FrameClock {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameOutcome {
    Presented,
    /// Presented, but the swapchain should be rebuilt before the next frame.
    Suboptimal,
    /// Nothing was submitted; the swapchain must be rebuilt first.
    SwapchainStale,
}

impl FrameOutcome {
    pub fn needs_recreate(self) -> bool {
        !matches!(self, Self::Presented)
    }
}

/// Owns the sync objects of every ring slot and drives one frame at a time.
pub struct FrameEngine {
    sync: Vec<FrameSync>,
    ring: FrameRing,
    clock: FrameClock,
    ctx: Arc<DeviceContext>,
}

impl FrameEngine {
    pub fn new(ctx: &Arc<DeviceContext>, frames_in_flight: usize, image_count: usize) -> Result<Self> {
        let ring = FrameRing::new(frames_in_flight.max(1), image_count);
        let sync = (0..ring.frames())
            .map(|_| FrameSync::new(ctx))
            .collect::<Result<Vec<_>>>()?;

        log::info!("Frame engine: {} frames in flight, {} swapchain images", ring.frames(), image_count);

        Ok(Self {
            sync,
            ring,
            clock: FrameClock::new(),
            ctx: ctx.clone(),
        })
    }

    /// Run the frame protocol once for `pass`.
    pub fn draw_frame<P: FramePass>(&mut self, swapchain: &Swapchain, pass: &mut P) -> Result<FrameOutcome> {
        let slot = self.ring.current();
        let sync = &self.sync[slot];

        // The slot's command buffer and uniforms are free once its fence signals
        sync.wait()?;

        let acquired = match swapchain.acquire_next_image(sync.image_available) {
            Ok(acquired) => acquired,
            Err(RendererError::SwapchainOutOfDate) => return Ok(FrameOutcome::SwapchainStale),
            Err(e) => return Err(e),
        };

        if let Some(owner) = self.ring.claim_image(acquired.index as usize) {
            self.sync[owner].wait()?;
        }

        // Uniform slots follow the image index, not the ring slot
        let times = self.clock.tick();
        pass.update_frame(acquired.index, &times)?;
        let cmd = pass.command_buffer(acquired.index)?;

        sync.reset()?;

        let wait_semaphores = [sync.image_available];
        let wait_stages = [pass.wait_stage()];
        let signal_semaphores = [sync.render_finished];
        let command_buffers = [cmd];

        let submit_info = vk::SubmitInfo::builder()
            .wait_semaphores(&wait_semaphores)
            .wait_dst_stage_mask(&wait_stages)
            .command_buffers(&command_buffers)
            .signal_semaphores(&signal_semaphores);

        unsafe {
            self.ctx
                .device
                .queue_submit(self.ctx.graphics_queue, &[submit_info.build()], sync.in_flight_fence)
        }
        .stage("submit frame")?;

        let present_stale = swapchain.present(acquired.index, sync.render_finished)?;

        self.ring.advance();

        Ok(if acquired.suboptimal || present_stale {
            FrameOutcome::Suboptimal
        } else {
            FrameOutcome::Presented
        })
    }

    /// Drop image associations after the swapchain was rebuilt.
    pub fn on_swapchain_recreated(&mut self, image_count: usize) {
        self.ring.reset_images(image_count);
    }
}
