use image::DynamicImage;
use crate::detection::{Detect, contours, preprocessing};
use crate::error::Result;
use crate::models::{BoundingBox, Contour, RawDetection};

pub const ROUND_PILL_CLASS_ID: u32 = 0;
pub const ROUND_PILL_LABEL: &str = "round_pill";

/// Filter contours to find circular shapes
pub fn filter_circles(
    contours: &[Contour],
    min_radius: f32,
    max_radius: f32,
    circularity_threshold: f32,
) -> Vec<Contour> {
    contours
        .iter()
        .filter(|c| {
            let aspect = c.aspect_ratio();
            c.is_circular(circularity_threshold) &&
            c.is_reasonable_size(min_radius, max_radius) &&
            (0.7..=1.4).contains(&aspect)  // Roughly square bounding box
        })
        .cloned()
        .collect()
}

/// Geometric detector used when no model is available or the model fails.
/// Every round outline becomes a `round_pill` at a fixed confidence.
#[derive(Debug, Clone)]
pub struct CircleDetector {
    pub blur_sigma: f32,
    pub canny_low: f32,
    pub canny_high: f32,
    pub min_contour_pixels: u32,
    pub min_radius: f32,
    pub max_radius: f32,
    pub circularity_threshold: f32,
    pub confidence: f32,
}

impl CircleDetector {
    pub fn new() -> Self {
        Self {
            blur_sigma: 2.0,
            canny_low: 50.0,
            canny_high: 100.0,
            min_contour_pixels: 10,
            min_radius: 10.0,
            max_radius: 100.0,
            circularity_threshold: 2.0,
            confidence: 0.8,
        }
    }

    /// Circular contours found in the image
    pub fn find_circles(&self, img: &DynamicImage) -> Vec<Contour> {
        let gray = preprocessing::to_grayscale(img);
        let blurred = preprocessing::apply_blur(&gray, self.blur_sigma);
        let edges = preprocessing::detect_edges(&blurred, self.canny_low, self.canny_high);
        let all_contours = contours::find_contours(&edges, self.min_contour_pixels);

        filter_circles(
            &all_contours,
            self.min_radius,
            self.max_radius,
            self.circularity_threshold,
        )
    }
}

impl Default for CircleDetector {
    fn default() -> Self {
        Self::new()
    }
}

impl Detect for CircleDetector {
    fn detect(&self, img: &DynamicImage) -> Result<Vec<RawDetection>> {
        let detections = self
            .find_circles(img)
            .iter()
            .map(|circle| {
                let (cx, cy) = circle.center();
                let (cx, cy) = (cx as i32, cy as i32);
                let r = circle.radius().round() as i32;
                RawDetection {
                    bbox: BoundingBox::new(cx - r, cy - r, cx + r, cy + r),
                    confidence: self.confidence,
                    class_id: ROUND_PILL_CLASS_ID,
                    class_label: ROUND_PILL_LABEL.to_string(),
                    source_image_index: 0,
                }
            })
            .collect();
        Ok(detections)
    }

    fn name(&self) -> &str {
        "circle fallback"
    }
}
