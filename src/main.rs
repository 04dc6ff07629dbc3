// =============================================================================
// DEFERRED VULKAN RENDERER
// =============================================================================
//
// ARCHITECTURE OVERVIEW:
// ┌─────────────────────────────────────────────────────────────────┐
// │  winit App (window, input, FPS title)                           │
// │    └── Renderer (resize flag, rebuild protocol)                 │
// │          ├── Swapchain                                          │
// │          ├── FrameEngine (fences, semaphores, frame ring)       │
// │          └── Pass: clear | screen quad | deferred G-buffer      │
// │                └── DeviceContext (device, queues, command pool) │
// └─────────────────────────────────────────────────────────────────┘
//
// FRAME FLOW:
// 1. Rebuild the swapchain if a resize was requested
// 2. Wait for the ring slot's fence, acquire an image
// 3. Write per-frame uniforms, submit the pre-recorded command buffer
// 4. Present, advance the ring
//
// =============================================================================

mod assets;
mod backend;
mod config;
mod error;
mod passes;
mod renderer;

use anyhow::{Context, Result};
use ash::vk;
use backend::DeviceContext;
use config::Config;
use renderer::Renderer;
use std::fs::OpenOptions;
use std::io::Write;
use std::sync::Arc;
use std::time::Instant;
use winit::{
    application::ApplicationHandler,
    event::WindowEvent,
    event_loop::{ActiveEventLoop, ControlFlow, EventLoop},
    window::{Fullscreen, Window, WindowAttributes},
};

// =============================================================================
// ENTRY POINT
// =============================================================================

fn main() -> Result<()> {
    init_logging();
    let config = Config::load();
    if config.debug.log_to_file {
        open_log_file(&config.debug.log_file);
    }

    log::info!("Starting deferred renderer");
    log::info!(
        "Window: {}x{} ({})",
        config.window.width,
        config.window.height,
        if config.window.fullscreen { "fullscreen" } else { "windowed" }
    );
    log::info!("Pass: {:?}, present mode: {}", config.graphics.pass, config.graphics.present_mode);

    let event_loop = EventLoop::new()?;
    let mut app = App::new(config);
    event_loop.run_app(&mut app)?;

    match app.fatal.take() {
        Some(e) => {
            log::error!("Renderer stopped: {:?}", e);
            Err(e)
        }
        None => Ok(()),
    }
}

/// Initialize logging before anything else so config problems are reported
fn init_logging() {
    use env_logger::Builder;
    use log::LevelFilter;

    let mut builder = Builder::new();
    builder.filter_level(LevelFilter::Info);
    builder.parse_default_env();
    builder.init();
}

/// Start a fresh log file for validation errors
fn open_log_file(path: &str) {
    match OpenOptions::new().create(true).write(true).truncate(true).open(path) {
        Ok(mut file) => {
            let _ = writeln!(file, "=== Deferred Renderer Log ===");
            let _ = writeln!(file, "Started: {:?}", std::time::SystemTime::now());
            let _ = writeln!(file);
        }
        Err(e) => log::warn!("Could not open log file {}: {}", path, e),
    }
}

fn extent_of(window: &Window) -> vk::Extent2D {
    let size = window.inner_size();
    vk::Extent2D {
        width: size.width,
        height: size.height,
    }
}

// =============================================================================
// APPLICATION STATE
// =============================================================================

/// Field order matters for Drop: the renderer goes before the device
/// context, and both before the window that owns the surface.
struct App {
    config: Config,

    renderer: Option<Renderer>,
    device: Option<Arc<DeviceContext>>,
    window: Option<Arc<Window>>,
    is_fullscreen: bool,
    is_minimized: bool,

    /// First unrecoverable error; returned from `main` after the loop exits
    fatal: Option<anyhow::Error>,

    fps: FpsCounter,
}

impl App {
    fn new(config: Config) -> Self {
        let is_fullscreen = config.window.fullscreen;
        Self {
            config,
            renderer: None,
            device: None,
            window: None,
            is_fullscreen,
            is_minimized: false,
            fatal: None,
            fps: FpsCounter::new(Instant::now()),
        }
    }

    // =========================================================================
    // INITIALIZATION
    // =========================================================================

    fn init_vulkan(&mut self, window: &Window) -> Result<()> {
        log::info!("Initializing Vulkan...");

        let enable_validation = cfg!(debug_assertions) && self.config.debug.validation_layers;
        let device = DeviceContext::new(&self.config.window.title, enable_validation, window)
            .context("Failed to create device context")?;

        let mut assets = assets::AssetLoader::default();
        let renderer = Renderer::new(
            &device,
            extent_of(window),
            &self.config.renderer_settings(),
            &mut assets,
        )
        .context("Failed to build renderer")?;

        self.renderer = Some(renderer);
        self.device = Some(device);

        log::info!("Vulkan initialized successfully!");
        Ok(())
    }

    fn fail(&mut self, event_loop: &ActiveEventLoop, error: anyhow::Error) {
        log::error!("{:?}", error);
        if self.fatal.is_none() {
            self.fatal = Some(error);
        }
        event_loop.exit();
    }

    fn render_frame(&mut self) -> Result<bool> {
        let (Some(renderer), Some(window)) = (self.renderer.as_mut(), self.window.as_ref()) else {
            return Ok(false);
        };
        Ok(renderer.render_frame(extent_of(window))?)
    }

    // =========================================================================
    // FULLSCREEN TOGGLE
    // =========================================================================

    fn toggle_fullscreen(&mut self) {
        if let Some(ref window) = self.window {
            self.is_fullscreen = !self.is_fullscreen;

            if self.is_fullscreen {
                window.set_fullscreen(Some(Fullscreen::Borderless(None)));
                log::info!("Entered fullscreen mode");
            } else {
                window.set_fullscreen(None);
                log::info!("Exited fullscreen mode");
            }

            if let Some(renderer) = self.renderer.as_mut() {
                renderer.request_resize();
            }
        }
    }

    // =========================================================================
    // FPS TRACKING
    // =========================================================================

    fn update_fps(&mut self) {
        if !self.config.debug.show_fps {
            return;
        }
        let Some(sample) = self.fps.frame_presented(Instant::now()) else {
            return;
        };

        if let (Some(window), Some(renderer)) = (self.window.as_ref(), self.renderer.as_ref()) {
            let extent = renderer.swapchain().extent();
            window.set_title(&format!(
                "{} - {:.0} FPS ({:.2}ms) [{:?}, {}x{}, {}]",
                self.config.window.title,
                sample.fps,
                sample.frame_ms,
                self.config.graphics.pass,
                extent.width,
                extent.height,
                if self.is_fullscreen { "fullscreen" } else { "windowed" }
            ));
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct FpsSample {
    fps: f32,
    frame_ms: f32,
}

/// Averages presented frames over one-second windows.
struct FpsCounter {
    frames: u32,
    window_start: Instant,
    last_frame: Instant,
}

impl FpsCounter {
    fn new(now: Instant) -> Self {
        Self {
            frames: 0,
            window_start: now,
            last_frame: now,
        }
    }

    /// Returns a sample once per second, `None` in between.
    fn frame_presented(&mut self, now: Instant) -> Option<FpsSample> {
        let frame_ms = now.duration_since(self.last_frame).as_secs_f32() * 1000.0;
        self.last_frame = now;
        self.frames += 1;

        let window = now.duration_since(self.window_start).as_secs_f32();
        if window < 1.0 {
            return None;
        }
        let sample = FpsSample {
            fps: self.frames as f32 / window,
            frame_ms,
        };
        self.frames = 0;
        self.window_start = now;
        Some(sample)
    }
}

// =============================================================================
// EVENT HANDLING
// =============================================================================

impl ApplicationHandler for App {
    fn resumed(&mut self, event_loop: &ActiveEventLoop) {
        if self.window.is_some() {
            return;
        }

        let mut window_attributes = WindowAttributes::default()
            .with_title(&self.config.window.title)
            .with_inner_size(winit::dpi::PhysicalSize::new(
                self.config.window.width,
                self.config.window.height,
            ));

        if self.config.window.fullscreen {
            window_attributes = window_attributes.with_fullscreen(Some(Fullscreen::Borderless(None)));
        }

        let window = match event_loop.create_window(window_attributes) {
            Ok(w) => Arc::new(w),
            Err(e) => {
                self.fail(event_loop, anyhow::anyhow!("Failed to create window: {}", e));
                return;
            }
        };

        if let Err(e) = self.init_vulkan(&window) {
            self.fail(event_loop, e);
            return;
        }

        window.request_redraw();
        self.window = Some(window);
    }

    fn window_event(
        &mut self,
        event_loop: &ActiveEventLoop,
        _id: winit::window::WindowId,
        event: WindowEvent,
    ) {
        match event {
            WindowEvent::CloseRequested => {
                log::info!("Close requested, shutting down...");
                if let Some(ref device) = self.device {
                    if let Err(e) = device.wait_idle() {
                        log::warn!("wait_idle on close failed: {}", e);
                    }
                }
                event_loop.exit();
            }

            WindowEvent::Resized(size) => {
                log::debug!("Window resized to {}x{}", size.width, size.height);

                if size.width == 0 || size.height == 0 {
                    // Nothing to draw into; sleep until a real size arrives
                    self.is_minimized = true;
                    event_loop.set_control_flow(ControlFlow::Wait);
                } else {
                    self.is_minimized = false;
                    event_loop.set_control_flow(ControlFlow::Poll);
                    if let Some(renderer) = self.renderer.as_mut() {
                        renderer.request_resize();
                    }
                    if let Some(ref window) = self.window {
                        window.request_redraw();
                    }
                }
            }

            WindowEvent::RedrawRequested => {
                if self.is_minimized {
                    return;
                }
                match self.render_frame() {
                    Ok(true) => self.update_fps(),
                    Ok(false) => {}
                    Err(e) => self.fail(event_loop, e.context("Frame failed")),
                }
            }

            WindowEvent::KeyboardInput { event, .. } => {
                use winit::keyboard::{KeyCode, PhysicalKey};

                if event.state.is_pressed() {
                    if let PhysicalKey::Code(key) = event.physical_key {
                        match key {
                            KeyCode::Escape => {
                                log::info!("ESC pressed, exiting...");
                                event_loop.exit();
                            }
                            KeyCode::F11 => self.toggle_fullscreen(),
                            _ => {}
                        }
                    }
                }
            }

            _ => {}
        }
    }

    fn about_to_wait(&mut self, _event_loop: &ActiveEventLoop) {
        if self.is_minimized {
            return;
        }
        if let Some(ref window) = self.window {
            window.request_redraw();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn fps_sampled_once_per_second() {
        let start = Instant::now();
        let mut counter = FpsCounter::new(start);

        for i in 1..60 {
            assert!(counter.frame_presented(start + Duration::from_millis(i * 16)).is_none());
        }
        let sample = counter
            .frame_presented(start + Duration::from_millis(1000))
            .unwrap();
        assert!((sample.fps - 60.0).abs() < 0.01);
        assert!((sample.frame_ms - 56.0).abs() < 0.01);

        assert!(counter.frame_presented(start + Duration::from_millis(1016)).is_none());
    }

    #[test]
    fn log_file_is_truncated_with_header() {
        let path = std::env::temp_dir().join(format!("deferred-vk-log-{}.log", std::process::id()));
        std::fs::write(&path, "stale output from an earlier run\n").unwrap();

        open_log_file(path.to_str().unwrap());

        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("=== Deferred Renderer Log ==="));
        assert!(!content.contains("stale output"));
        std::fs::remove_file(&path).unwrap();
    }
}
