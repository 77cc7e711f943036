pub mod preprocessing;
pub mod contours;
pub mod circles;
pub mod model;

use image::DynamicImage;
use std::sync::Arc;
use std::sync::mpsc::{self, RecvTimeoutError};
use std::time::Duration;
use tracing::{debug, info, warn};

use crate::config::ModelConfig;
use crate::error::{Error, Result};
use crate::models::RawDetection;

pub use circles::CircleDetector;
pub use model::ModelDetector;

/// Anything that can find pills in a single image
pub trait Detect: Send + Sync {
    fn detect(&self, img: &DynamicImage) -> Result<Vec<RawDetection>>;

    /// Human-readable name for logs
    fn name(&self) -> &str;
}

/// Detector chosen at startup. The primary is shared with the worker thread
/// that runs it under the time budget.
pub enum Detector {
    Primary(Arc<dyn Detect>),
    Fallback(CircleDetector),
}

impl Detector {
    pub fn is_primary(&self) -> bool {
        matches!(self, Detector::Primary(_))
    }
}

/// Single entry point for per-image detection.
///
/// Never fails: if the primary detector errors or runs past its budget the
/// geometric fallback answers for that image instead. Degenerate boxes and
/// detections under the confidence floor are dropped.
pub struct DetectionAdapter {
    detector: Detector,
    fallback: CircleDetector,
    confidence_floor: f32,
    inference_budget: Duration,
}

impl DetectionAdapter {
    pub fn new(detector: Detector, confidence_floor: f32) -> Self {
        Self {
            detector,
            fallback: CircleDetector::new(),
            confidence_floor,
            inference_budget: Duration::from_secs(5),
        }
    }

    /// Build from config: the model when one is configured, otherwise the
    /// fallback. A configured model that cannot be loaded is an error.
    pub fn from_config(config: &ModelConfig) -> Result<Self> {
        let detector = match &config.path {
            Some(path) => Detector::Primary(Arc::new(ModelDetector::load(path, config)?)),
            None => {
                warn!("No detection model configured, using fallback detection");
                Detector::Fallback(CircleDetector::new())
            }
        };
        Ok(Self::new(detector, config.confidence_threshold)
            .with_inference_budget(Duration::from_millis(config.inference_timeout_ms)))
    }

    pub fn with_inference_budget(mut self, budget: Duration) -> Self {
        self.inference_budget = budget;
        self
    }

    pub fn with_fallback(mut self, fallback: CircleDetector) -> Self {
        self.fallback = fallback;
        self
    }

    pub fn uses_primary(&self) -> bool {
        self.detector.is_primary()
    }

    /// Detect pills in one image, tagging results with `image_index`
    pub fn detect(&self, img: &DynamicImage, image_index: usize) -> Vec<RawDetection> {
        let raw = match &self.detector {
            Detector::Primary(primary) => match self.run_primary(primary, img) {
                Ok(detections) => detections,
                Err(e) => {
                    warn!(image = image_index, error = %e, "Primary detector failed, using fallback");
                    self.run_fallback(img)
                }
            },
            Detector::Fallback(fallback) => fallback.detect(img).unwrap_or_else(|e| {
                warn!(image = image_index, error = %e, "Fallback detection failed");
                Vec::new()
            }),
        };

        let total = raw.len();
        let detections: Vec<RawDetection> = raw
            .into_iter()
            .filter(|d| d.bbox.is_valid() && d.confidence >= self.confidence_floor)
            .map(|d| RawDetection {
                source_image_index: image_index,
                ..d
            })
            .collect();

        debug!(
            image = image_index,
            kept = detections.len(),
            dropped = total - detections.len(),
            "Image detection complete"
        );
        detections
    }

    /// Run the primary on its own thread and stop waiting once the budget is
    /// spent. A late worker finishes in the background and its answer is dropped.
    fn run_primary(&self, primary: &Arc<dyn Detect>, img: &DynamicImage) -> Result<Vec<RawDetection>> {
        let (tx, rx) = mpsc::sync_channel(1);
        let worker = Arc::clone(primary);
        let image = img.clone();
        std::thread::Builder::new()
            .name("primary-detector".to_string())
            .spawn(move || {
                // The receiver is gone when the budget ran out
                let _ = tx.send(worker.detect(&image));
            })?;

        match rx.recv_timeout(self.inference_budget) {
            Ok(result) => result,
            Err(RecvTimeoutError::Timeout) => Err(Error::Detector(format!(
                "{} exceeded its {:?} budget",
                primary.name(),
                self.inference_budget
            ))),
            Err(RecvTimeoutError::Disconnected) => {
                Err(Error::Detector(format!("{} worker panicked", primary.name())))
            }
        }
    }

    fn run_fallback(&self, img: &DynamicImage) -> Vec<RawDetection> {
        match self.fallback.detect(img) {
            Ok(detections) => {
                info!(count = detections.len(), "Fallback detection used");
                detections
            }
            Err(e) => {
                warn!(error = %e, "Fallback detection failed");
                Vec::new()
            }
        }
    }
}
