mod fixtures;
pub use fixtures::*;

// Re-export commonly used types from pillvision for tests
pub use pillvision::capture::{CaptureOrchestrator, ImageSource};
pub use pillvision::detection::{Detect, DetectionAdapter, Detector};
pub use pillvision::ensemble::EnsembleAggregator;
pub use pillvision::history::{HistorySink, SqliteHistory};
pub use pillvision::link::{ResultDispatcher, ResultLink, TriggerListener};
pub use pillvision::models::{BoundingBox, FusedDetection, RawDetection, Session, SessionOutcome, TriggerSource};
pub use pillvision::session::{SessionPipeline, SessionState};
