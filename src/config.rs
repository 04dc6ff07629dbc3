// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every table is optional. A missing file means defaults; a broken file logs
// a warning and also falls back to defaults.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::backend::shader::ShaderDir;
use crate::backend::sync::FRAMES_IN_FLIGHT;
use crate::passes::{PassKind, PassSettings};
use crate::renderer::RendererSettings;

/// Root configuration structure
#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub assets: AssetsConfig,
    pub debug: DebugConfig,
}

/// Window settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub fullscreen: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "Deferred Renderer".to_string(),
            width: 1280,
            height: 720,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct GraphicsConfig {
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub frames_in_flight: usize,
    pub pass: PassKind,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            frames_in_flight: FRAMES_IN_FLIGHT,
            pass: PassKind::Deferred,
        }
    }
}

/// Where shader blobs, the model and the screen-quad texture live
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct AssetsConfig {
    pub shader_dir: PathBuf,
    pub model: Option<PathBuf>,
    pub texture: Option<PathBuf>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            shader_dir: PathBuf::from("shaders"),
            model: None,
            texture: None,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct DebugConfig {
    pub validation_layers: bool,
    pub log_to_file: bool,
    pub log_file: String,
    pub show_fps: bool,
}

impl Default for DebugConfig {
    fn default() -> Self {
        Self {
            validation_layers: true,
            log_to_file: false,
            log_file: "deferred_vk.log".to_string(),
            show_fps: true,
        }
    }
}

impl Config {
    /// Load `config.toml`, falling back to defaults. Call after the logger
    /// is up so a broken file is reported.
    pub fn load() -> Self {
        Self::load_or_default("config.toml")
    }

    pub fn load_or_default<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();
        Self::load_from_path(path).unwrap_or_else(|e| {
            log::warn!("Failed to load {:?}: {:#}. Using defaults.", path, e);
            Config::default()
        })
    }

    /// Load configuration from a specific path
    pub fn load_from_path<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        if !path.exists() {
            log::info!("Config file not found at {:?}, using defaults", path);
            return Ok(Config::default());
        }

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;

        let config = Self::parse(&content)
            .with_context(|| format!("Failed to parse config file: {:?}", path))?;

        log::info!("Loaded configuration from {:?}", path);
        log::debug!("Config: {:?}", config);

        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let config: Config = toml::from_str(content)?;
        anyhow::ensure!(
            config.graphics.frames_in_flight >= 1,
            "graphics.frames_in_flight must be at least 1"
        );
        Ok(config)
    }

    /// Preferred present mode. Whether the surface offers it is decided at
    /// swapchain creation.
    pub fn present_mode(&self) -> vk::PresentModeKHR {
        match self.graphics.present_mode.to_lowercase().as_str() {
            "immediate" => vk::PresentModeKHR::IMMEDIATE,
            "mailbox" => vk::PresentModeKHR::MAILBOX,
            "fifo" => vk::PresentModeKHR::FIFO,
            "fifo_relaxed" => vk::PresentModeKHR::FIFO_RELAXED,
            _ => {
                log::warn!(
                    "Unknown present mode '{}', defaulting to MAILBOX",
                    self.graphics.present_mode
                );
                vk::PresentModeKHR::MAILBOX
            }
        }
    }

    pub fn renderer_settings(&self) -> RendererSettings {
        RendererSettings {
            pass: self.graphics.pass,
            present_mode: self.present_mode(),
            frames_in_flight: self.graphics.frames_in_flight,
            pass_settings: PassSettings {
                clear_color: self.graphics.clear_color,
                shaders: ShaderDir::new(self.assets.shader_dir.clone()),
                texture: self.assets.texture.clone(),
                model: self.assets.model.clone(),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config.window.width, 1280);
        assert_eq!(config.window.height, 720);
        assert_eq!(config.graphics.frames_in_flight, FRAMES_IN_FLIGHT);
        assert_eq!(config.graphics.pass, PassKind::Deferred);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.assets.shader_dir, PathBuf::from("shaders"));
        assert!(config.assets.model.is_none());
    }

    #[test]
    fn partial_tables_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [graphics]
            present_mode = "FIFO"
            pass = "screen_quad"

            [assets]
            texture = "textures/brick.png"
            "#,
        )
        .unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.graphics.pass, PassKind::ScreenQuad);
        assert_eq!(config.graphics.clear_color, [0.0, 0.0, 0.0, 1.0]);
        assert_eq!(config.assets.texture, Some(PathBuf::from("textures/brick.png")));
        assert_eq!(config.window.title, "Deferred Renderer");
    }

    #[test]
    fn unknown_present_mode_falls_back_to_mailbox() {
        let config = Config::parse("[graphics]\npresent_mode = \"vsync-ish\"").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
    }

    #[test]
    fn zero_frames_in_flight_is_rejected() {
        assert!(Config::parse("[graphics]\nframes_in_flight = 0").is_err());
    }

    #[test]
    fn missing_file_is_not_an_error() {
        let config = Config::load_from_path("definitely/not/here.toml").unwrap();
        assert_eq!(config.graphics.frames_in_flight, FRAMES_IN_FLIGHT);
    }

    #[test]
    fn default_ring_depth_matches_frame_engine() {
        assert_eq!(GraphicsConfig::default().frames_in_flight, FRAMES_IN_FLIGHT);
        assert_eq!(Config::default().renderer_settings().frames_in_flight, FRAMES_IN_FLIGHT);
    }

    #[test]
    fn broken_file_is_reported_then_defaulted() {
        let path = std::env::temp_dir().join(format!("deferred-vk-broken-{}.toml", std::process::id()));
        std::fs::write(&path, "[graphics\npass = ").unwrap();

        let err = Config::load_from_path(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("Failed to parse config file"));

        let config = Config::load_or_default(&path);
        assert_eq!(config.graphics.pass, PassKind::Deferred);
        assert_eq!(config.window.width, 1280);

        std::fs::remove_file(&path).unwrap();
    }

    #[test]
    fn renderer_settings_carry_asset_paths() {
        let config = Config::parse("[assets]\nshader_dir = \"out/spv\"\nmodel = \"models/cube.obj\"").unwrap();
        let settings = config.renderer_settings();
        assert_eq!(settings.pass_settings.shaders.path("gbuffer.vert"), PathBuf::from("out/spv/gbuffer.vert.spv"));
        assert_eq!(settings.pass_settings.model, Some(PathBuf::from("models/cube.obj")));
        assert_eq!(settings.frames_in_flight, FRAMES_IN_FLIGHT);
    }
}
