pub mod capture;
pub mod config;
pub mod detection;
pub mod ensemble;
pub mod error;
pub mod history;
pub mod link;
pub mod models;
pub mod service;
pub mod session;

pub use capture::{CaptureOrchestrator, Esp32Cam, FileSource, ImageSource};
pub use config::Config;
pub use detection::{Detect, DetectionAdapter, Detector};
pub use ensemble::EnsembleAggregator;
pub use error::{Error, Result};
pub use history::{HistorySink, SqliteHistory};
pub use link::{ResultDispatcher, ResultLink, TriggerListener};
pub use models::{BoundingBox, FusedDetection, RawDetection, Session, SessionOutcome, TriggerSource};
pub use session::{SessionPipeline, SessionState};
