//! Error taxonomy for the detection service

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A single image could not be acquired
    #[error("Acquisition failed: {0}")]
    Acquisition(String),

    /// No image of the batch could be acquired
    #[error("All {requested} captures failed")]
    AllCapturesFailed { requested: usize },

    /// The primary detector failed or ran over its time budget
    #[error("Detector error: {0}")]
    Detector(String),

    /// Trigger/result channel is down
    #[error("Link unavailable: {0}")]
    LinkUnavailable(String),

    /// Model file, camera or serial endpoint missing, or unusable config
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Image error: {0}")]
    Image(#[from] image::ImageError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Serial error: {0}")]
    Serial(#[from] serialport::Error),

    #[error("Serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Time format error: {0}")]
    TimeFormat(#[from] time::error::Format),
}
