use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub window: WindowConfig,
    pub render: RenderConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WindowConfig {
    pub title: String,
    pub width: u32,
    pub height: u32,
    pub vsync: bool,
}

impl Default for WindowConfig {
    fn default() -> Self {
        Self {
            title: "firstlight".to_string(),
            width: 800,
            height: 600,
            vsync: true,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RenderConfig {
    pub shader_path: String,
    pub clear_color: [f32; 4],
}

impl Default for RenderConfig {
    fn default() -> Self {
        Self {
            shader_path: "assets/shaders/basic.shader".to_string(),
            clear_color: [0.2, 0.3, 0.3, 1.0],
        }
    }
}

/// Loads the config from `path`, materializing the defaults there on
/// first run. Fields missing from the file keep their default values.
pub fn load_or_create(path: impl AsRef<Path>) -> Result<AppConfig> {
    let path = path.as_ref();

    if !path.exists() {
        let config = AppConfig::default();
        let toml_content = toml::to_string_pretty(&config)?;
        std::fs::write(path, toml_content).context("Failed to write default config")?;
        return Ok(config);
    }

    let content = std::fs::read_to_string(path).context("Failed to read config file")?;
    toml::from_str(&content).context("Failed to parse config file")
}
