use image::DynamicImage;
use serde::{Serialize, Serializer};
use std::time::Duration;
use time::OffsetDateTime;

/// Axis-aligned box in pixel coordinates of the captured image
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BoundingBox {
    pub x1: i32,
    pub y1: i32,
    pub x2: i32,
    pub y2: i32,
}

impl BoundingBox {
    pub fn new(x1: i32, y1: i32, x2: i32, y2: i32) -> Self {
        Self { x1, y1, x2, y2 }
    }

    /// A box is usable only when it has positive width and height
    pub fn is_valid(&self) -> bool {
        self.x1 < self.x2 && self.y1 < self.y2
    }

    pub fn area(&self) -> i64 {
        (self.x2 - self.x1) as i64 * (self.y2 - self.y1) as i64
    }

    /// Intersection over union, 0.0 when the boxes do not overlap
    pub fn iou(&self, other: &BoundingBox) -> f32 {
        let xi1 = self.x1.max(other.x1);
        let yi1 = self.y1.max(other.y1);
        let xi2 = self.x2.min(other.x2);
        let yi2 = self.y2.min(other.y2);

        if xi2 <= xi1 || yi2 <= yi1 {
            return 0.0;
        }

        let intersection = (xi2 - xi1) as i64 * (yi2 - yi1) as i64;
        let union = self.area() + other.area() - intersection;

        if union > 0 {
            intersection as f32 / union as f32
        } else {
            0.0
        }
    }
}

impl Serialize for BoundingBox {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        [self.x1, self.y1, self.x2, self.y2].serialize(serializer)
    }
}

/// One detection produced by a detector on a single image
#[derive(Debug, Clone, PartialEq)]
pub struct RawDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u32,
    pub class_label: String,
    pub source_image_index: usize,
}

/// Reconciled detection built from several per-image sightings
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FusedDetection {
    pub bbox: BoundingBox,
    pub confidence: f32,
    pub class_id: u32,
    #[serde(rename = "class_name")]
    pub class_label: String,
    #[serde(rename = "detection_count")]
    pub support_count: usize,
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
}

/// Images captured for one event
#[derive(Debug, Clone, Default)]
pub struct CaptureBatch {
    pub images: Vec<DynamicImage>,
    /// One flag per attempted capture, in attempt order
    pub attempts: Vec<bool>,
}

impl CaptureBatch {
    pub fn requested(&self) -> usize {
        self.attempts.len()
    }

    pub fn len(&self) -> usize {
        self.images.len()
    }

    pub fn is_empty(&self) -> bool {
        self.images.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TriggerSource {
    /// Trigger line received from the dispenser controller
    Esp32,
    /// Started from the command line
    Manual,
}

impl TriggerSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerSource::Esp32 => "esp32",
            TriggerSource::Manual => "manual",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionOutcome {
    Success,
    NoDetections,
    CaptureFailed,
    LinkFailed,
}

impl SessionOutcome {
    /// Outcome implied by what the session captured and found
    pub fn from_results(images_captured: usize, final_detections: &[FusedDetection]) -> Self {
        if images_captured == 0 {
            SessionOutcome::CaptureFailed
        } else if final_detections.is_empty() {
            SessionOutcome::NoDetections
        } else {
            SessionOutcome::Success
        }
    }
}

/// One full trigger-to-report cycle
#[derive(Debug, Clone)]
pub struct Session {
    pub session_id: String,
    pub created_at: OffsetDateTime,
    pub trigger_source: TriggerSource,
    pub images_captured: usize,
    pub final_detections: Vec<FusedDetection>,
    pub processing_duration: Duration,
    pub outcome: SessionOutcome,
}

impl Session {
    pub fn record(&self) -> SessionRecord {
        SessionRecord {
            session_id: self.session_id.clone(),
            timestamp: self.created_at,
            trigger_source: self.trigger_source.as_str().to_string(),
            images_captured: self.images_captured as i64,
            detections_count: self.final_detections.len() as i64,
            processing_time: self.processing_duration.as_secs_f64(),
            success: !self.final_detections.is_empty(),
        }
    }
}

/// Row persisted per session in the history store
#[derive(Debug, Clone, PartialEq)]
pub struct SessionRecord {
    pub session_id: String,
    pub timestamp: OffsetDateTime,
    pub trigger_source: String,
    pub images_captured: i64,
    pub detections_count: i64,
    pub processing_time: f64,
    pub success: bool,
}

/// Connected edge region found by the geometric detector
#[derive(Debug, Clone)]
pub struct Contour {
    pub min_x: u32,
    pub min_y: u32,
    pub max_x: u32,
    pub max_y: u32,
    pub pixel_count: u32,
}

impl Contour {
    pub fn width(&self) -> u32 {
        self.max_x - self.min_x + 1
    }

    pub fn height(&self) -> u32 {
        self.max_y - self.min_y + 1
    }

    pub fn perimeter(&self) -> f32 {
        // Approximate perimeter from bounding box
        2.0 * (self.width() as f32 + self.height() as f32)
    }

    pub fn circularity(&self) -> f32 {
        let perimeter = self.perimeter();
        let area = (self.width() * self.height()) as f32;

        if area == 0.0 {
            return 0.0;
        }

        // Circularity = perimeter² / (4π × area)
        (perimeter * perimeter) / (4.0 * std::f32::consts::PI * area)
    }

    pub fn aspect_ratio(&self) -> f32 {
        let w = self.width() as f32;
        let h = self.height() as f32;
        if h == 0.0 {
            return 0.0;
        }
        w / h
    }

    pub fn is_circular(&self, threshold: f32) -> bool {
        let circ = self.circularity();
        (0.7..=threshold).contains(&circ)
    }

    pub fn radius(&self) -> f32 {
        let w = self.width() as f32;
        let h = self.height() as f32;
        (w + h) / 4.0
    }

    pub fn is_reasonable_size(&self, min_radius: f32, max_radius: f32) -> bool {
        let r = self.radius();
        r >= min_radius && r <= max_radius
    }

    pub fn center(&self) -> (u32, u32) {
        ((self.min_x + self.max_x) / 2, (self.min_y + self.max_y) / 2)
    }
}
