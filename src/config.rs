use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::app_dirs::AppDirs;

pub const DEFAULT_IMAGE: &str = "CircleStart.png";
pub const DEFAULT_PROMPT: &str = "Create a simple mutation of shape in the image with minimal design. Use solid colors and clean lines. The image should be very simple and minimal.";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct Config {
    /// Explicit backend base address; wins over origin inference
    pub api_base: Option<String>,
    /// Where the client considers itself served from (`None` = local disk)
    pub origin: Option<String>,
    /// Length of one "time unit" used by countdowns, delays and polling
    pub time_unit_ms: u64,
    pub request_timeout_secs: u64,
    pub default_image: String,
    pub default_prompt: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            api_base: None,
            origin: None,
            time_unit_ms: 1000,
            request_timeout_secs: 120,
            default_image: DEFAULT_IMAGE.to_string(),
            default_prompt: DEFAULT_PROMPT.to_string(),
        }
    }
}

impl Config {
    pub fn time_unit(&self) -> Duration {
        Duration::from_millis(self.time_unit_ms.max(1))
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

pub trait ConfigStore {
    fn load(&self) -> Config;
    fn save(&self, cfg: &Config) -> std::io::Result<()>;
}

#[derive(Debug, Clone)]
pub struct FileConfigStore {
    path: PathBuf,
}

impl FileConfigStore {
    #[allow(clippy::new_without_default)]
    pub fn new() -> Self {
        let path = AppDirs::config_path().unwrap_or_else(|| PathBuf::from("evolv_config.json"));
        Self { path }
    }

    pub fn with_path<P: AsRef<Path>>(p: P) -> Self {
        Self {
            path: p.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Default for FileConfigStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigStore for FileConfigStore {
    fn load(&self) -> Config {
        match fs::read(&self.path) {
            Ok(bytes) => match serde_json::from_slice::<Config>(&bytes) {
                Ok(cfg) => cfg,
                Err(err) => {
                    tracing::warn!(path = %self.path.display(), %err, "ignoring unreadable config");
                    Config::default()
                }
            },
            Err(_) => Config::default(),
        }
    }

    fn save(&self, cfg: &Config) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let data = serde_json::to_vec_pretty(cfg)?;
        fs::write(&self.path, data)
    }
}
