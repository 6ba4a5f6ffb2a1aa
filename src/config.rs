// =============================================================================
// CONFIGURATION - Load settings from config.toml
// =============================================================================
//
// Every section is optional; missing keys take the defaults below, and a
// missing or malformed file falls back to defaults entirely.

use anyhow::{Context, Result};
use ash::vk;
use serde::Deserialize;
use std::path::{Path, PathBuf};

/// Root configuration structure
#[derive(Debug, Deserialize, Default, PartialEq)]
#[serde(default)]
pub struct Config {
    pub window: WindowConfig,
    pub graphics: GraphicsConfig,
    pub debug: DebugConfig,
    pub assets: AssetsConfig,
}

/// Window settings
#[derive(Debug, Deserialize, PartialEq)]
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
            title: "RHI Renderer".to_string(),
            width: 800,
            height: 600,
            fullscreen: false,
        }
    }
}

/// Graphics settings
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct GraphicsConfig {
    /// Preferred present mode; falls back to mailbox, then FIFO.
    pub present_mode: String,
    pub clear_color: [f32; 4],
    pub max_frames_in_flight: usize,
    /// Vertical field of view in degrees
    pub field_of_view: f32,
}

impl Default for GraphicsConfig {
    fn default() -> Self {
        Self {
            present_mode: "mailbox".to_string(),
            clear_color: [0.0, 0.0, 0.0, 1.0],
            max_frames_in_flight: 2,
            field_of_view: 45.0,
        }
    }
}

/// Debug settings
#[derive(Debug, Deserialize, PartialEq)]
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
            validation_layers: cfg!(debug_assertions),
            log_to_file: false,
            log_file: "rhi_renderer.log".to_string(),
            show_fps: true,
        }
    }
}

/// Asset locations
#[derive(Debug, Deserialize, PartialEq)]
#[serde(default)]
pub struct AssetsConfig {
    /// Directory holding the compiled `.spv` shaders
    pub shader_dir: PathBuf,
    /// RGBA texture; a checkerboard is used when unset or unreadable
    pub texture: Option<PathBuf>,
    /// Built-in meshes to draw: "triangle", "quad", "cube"
    pub meshes: Vec<String>,
}

impl Default for AssetsConfig {
    fn default() -> Self {
        Self {
            shader_dir: PathBuf::from("shaders"),
            texture: None,
            meshes: vec!["quad".to_string()],
        }
    }
}

impl Config {
    /// Load configuration from file, falling back to defaults if not found
    pub fn load() -> Self {
        Self::load_from_path("config.toml").unwrap_or_else(|e| {
            log::warn!("Failed to load config.toml: {:#}. Using defaults.", e);
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
        Ok(toml::from_str(content)?)
    }

    /// Get present mode as Vulkan enum
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

    /// Frame slot count, never zero.
    pub fn frames_in_flight(&self) -> usize {
        self.graphics.max_frames_in_flight.max(1)
    }

    /// Validation is opt-in and only honoured in debug builds.
    pub fn validation_enabled(&self) -> bool {
        cfg!(debug_assertions) && self.debug.validation_layers
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_file_gives_defaults() {
        let config = Config::parse("").unwrap();
        assert_eq!(config, Config::default());
        assert_eq!(config.window.width, 800);
        assert_eq!(config.window.height, 600);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);
        assert_eq!(config.frames_in_flight(), 2);
        assert_eq!(config.assets.meshes, vec!["quad".to_string()]);
        assert!(config.assets.texture.is_none());
    }

    #[test]
    fn partial_sections_keep_other_defaults() {
        let config = Config::parse(
            r#"
            [window]
            title = "Demo"

            [graphics]
            present_mode = "FIFO"
            max_frames_in_flight = 3

            [assets]
            texture = "textures/brick.png"
            meshes = ["cube", "triangle"]
            "#,
        )
        .unwrap();

        assert_eq!(config.window.title, "Demo");
        assert_eq!(config.window.width, 800);
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO);
        assert_eq!(config.frames_in_flight(), 3);
        assert_eq!(config.graphics.field_of_view, 45.0);
        assert_eq!(
            config.assets.texture.as_deref(),
            Some(Path::new("textures/brick.png"))
        );
        assert_eq!(config.assets.meshes, vec!["cube", "triangle"]);
        assert_eq!(config.assets.shader_dir, PathBuf::from("shaders"));
    }

    #[test]
    fn zero_frames_in_flight_is_clamped() {
        let config = Config::parse("[graphics]\nmax_frames_in_flight = 0\n").unwrap();
        assert_eq!(config.frames_in_flight(), 1);
    }

    #[test]
    fn unknown_present_mode_falls_back_to_mailbox() {
        let config = Config::parse("[graphics]\npresent_mode = \"vsync-ish\"\n").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::MAILBOX);

        let config = Config::parse("[graphics]\npresent_mode = \"fifo_relaxed\"\n").unwrap();
        assert_eq!(config.present_mode(), vk::PresentModeKHR::FIFO_RELAXED);
    }

    #[test]
    fn malformed_file_is_an_error() {
        assert!(Config::parse("[window\nwidth = 5").is_err());
        assert!(Config::parse("[window]\nwidth = \"wide\"").is_err());
    }

    #[test]
    fn missing_file_gives_defaults() {
        let config = Config::load_from_path("no/such/config.toml").unwrap();
        assert_eq!(config, Config::default());
    }
}
