use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Error, Result};

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub model: ModelConfig,
    #[serde(default)]
    pub camera: CameraConfig,
    #[serde(default)]
    pub link: LinkConfig,
    #[serde(default)]
    pub capture: CaptureConfig,
    #[serde(default)]
    pub ensemble: EnsembleConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ModelConfig {
    /// RTen model file. Without one only the geometric detector runs.
    pub path: Option<PathBuf>,
    /// Per-image confidence floor
    pub confidence_threshold: f32,
    /// NMS overlap used inside a single image
    pub iou_threshold: f32,
    pub input_size: u32,
    pub inference_timeout_ms: u64,
    pub class_labels: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CameraConfig {
    pub esp32cam_ip: String,
    pub capture_delay_ms: u64,
    pub flash_delay_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    pub port: String,
    pub baud_rate: u32,
    pub timeout_ms: u64,
    /// Wait after opening the port while the controller resets
    pub settle_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CaptureConfig {
    pub num_images: usize,
    pub save_images: bool,
    pub images_dir: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct EnsembleConfig {
    /// Cross-image IoU needed to join a cluster
    pub iou_threshold: f32,
    /// Minimum cluster size for a fused detection
    pub min_agreement: usize,
    pub boost_per_member: f32,
    pub boost_cap: f32,
    /// Fused confidence needed to report a detection
    pub ensemble_threshold: f32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DatabaseConfig {
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter when RUST_LOG is unset
    pub level: String,
    pub file: Option<PathBuf>,
}

impl Default for ModelConfig {
    fn default() -> Self {
        Self {
            path: None,
            confidence_threshold: 0.6,
            iou_threshold: 0.4,
            input_size: 640,
            inference_timeout_ms: 5_000,
            class_labels: ["round_pill", "oval_pill", "capsule", "tablet"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl Default for CameraConfig {
    fn default() -> Self {
        Self {
            esp32cam_ip: "192.168.1.100".to_string(),
            capture_delay_ms: 300,
            flash_delay_ms: 100,
        }
    }
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            port: "/dev/ttyUSB0".to_string(),
            baud_rate: 115_200,
            timeout_ms: 2_000,
            settle_ms: 2_000,
        }
    }
}

impl Default for CaptureConfig {
    fn default() -> Self {
        Self {
            num_images: 3,
            save_images: false,
            images_dir: PathBuf::from("captured_images"),
        }
    }
}

impl Default for EnsembleConfig {
    fn default() -> Self {
        Self {
            iou_threshold: 0.3,
            min_agreement: 2,
            boost_per_member: 0.05,
            boost_cap: 0.2,
            ensemble_threshold: 0.7,
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("data/pill_dispenser.db"),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "pillvision=info".to_string(),
            file: None,
        }
    }
}

impl CameraConfig {
    pub fn capture_delay(&self) -> Duration {
        Duration::from_millis(self.capture_delay_ms)
    }

    pub fn flash_delay(&self) -> Duration {
        Duration::from_millis(self.flash_delay_ms)
    }
}

impl Config {
    /// Load from a TOML file. A missing file yields the defaults, an
    /// unreadable or malformed one is a configuration failure.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let Some(path) = path else {
            return Ok(Self::default());
        };
        if !path.exists() {
            tracing::warn!(path = %path.display(), "Config file not found, using defaults");
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path).map_err(|e| {
            Error::Configuration(format!("cannot read {}: {}", path.display(), e))
        })?;
        Self::from_toml(&content)
    }

    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| Error::Configuration(e.to_string()))
    }
}
