use image::DynamicImage;
use rten::Model;
use rten_tensor::NdTensor;
use rten_tensor::prelude::*;
use std::path::Path;
use tracing::info;

use crate::config::ModelConfig;
use crate::detection::{Detect, preprocessing};
use crate::error::{Error, Result};
use crate::models::{BoundingBox, RawDetection};

/// YOLOv8-style detector exported to the RTen format.
///
/// Expects a single `[1, 3, S, S]` RGB input in `0..1` and a
/// `[1, 4 + classes, anchors]` output of centre-size boxes and class scores.
pub struct ModelDetector {
    model: Model,
    input_size: u32,
    score_threshold: f32,
    nms_threshold: f32,
    class_labels: Vec<String>,
}

impl ModelDetector {
    /// Load the model named in the config; a missing file is a configuration failure
    pub fn load(path: &Path, config: &ModelConfig) -> Result<Self> {
        if !path.exists() {
            return Err(Error::Configuration(format!(
                "model file not found: {}",
                path.display()
            )));
        }
        let model = Model::load_file(path)
            .map_err(|e| Error::Configuration(format!("cannot load {}: {}", path.display(), e)))?;

        info!(
            model = %path.display(),
            classes = ?config.class_labels,
            "Loaded detection model"
        );

        Ok(Self {
            model,
            input_size: config.input_size,
            score_threshold: config.confidence_threshold,
            nms_threshold: config.iou_threshold,
            class_labels: config.class_labels.clone(),
        })
    }

    fn label(&self, class_id: u32) -> String {
        self.class_labels
            .get(class_id as usize)
            .cloned()
            .unwrap_or_else(|| "unknown".to_string())
    }

    fn input_tensor(&self, img: &DynamicImage) -> (NdTensor<f32, 4>, preprocessing::Letterbox) {
        let (canvas, letterbox) = preprocessing::letterbox(img, self.input_size);
        let size = self.input_size as usize;

        let mut data = vec![0.0f32; 3 * size * size];
        for (x, y, pixel) in canvas.enumerate_pixels() {
            let offset = y as usize * size + x as usize;
            for c in 0..3 {
                data[c * size * size + offset] = pixel[c] as f32 / 255.0;
            }
        }

        (NdTensor::from_data([1, 3, size, size], data), letterbox)
    }
}

impl Detect for ModelDetector {
    fn detect(&self, img: &DynamicImage) -> Result<Vec<RawDetection>> {
        let (input, letterbox) = self.input_tensor(img);

        let output = self
            .model
            .run_one(input.view().into(), None)
            .map_err(|e| Error::Detector(format!("inference failed: {}", e)))?;
        let output: NdTensor<f32, 3> = output
            .try_into()
            .map_err(|e| Error::Detector(format!("unexpected model output: {:?}", e)))?;

        let [_, features, anchors] = output.shape();
        if features < 5 {
            return Err(Error::Detector(format!(
                "model output has {} features, expected at least 5",
                features
            )));
        }

        let mut candidates = Vec::new();
        for a in 0..anchors {
            let (class_id, score) = (4..features)
                .map(|f| (f - 4, output[[0, f, a]]))
                .fold((0usize, f32::NEG_INFINITY), |best, cur| {
                    if cur.1 > best.1 { cur } else { best }
                });

            if !score.is_finite() || score < self.score_threshold {
                continue;
            }

            let (cx, cy, w, h) = (
                output[[0, 0, a]],
                output[[0, 1, a]],
                output[[0, 2, a]],
                output[[0, 3, a]],
            );
            if !(cx.is_finite() && cy.is_finite() && w > 0.0 && h > 0.0) {
                continue;
            }

            let (x1, y1) = letterbox.unmap(cx - w / 2.0, cy - h / 2.0);
            let (x2, y2) = letterbox.unmap(cx + w / 2.0, cy + h / 2.0);
            let max_x = img.width() as f32;
            let max_y = img.height() as f32;

            candidates.push(RawDetection {
                bbox: BoundingBox::new(
                    x1.clamp(0.0, max_x) as i32,
                    y1.clamp(0.0, max_y) as i32,
                    x2.clamp(0.0, max_x) as i32,
                    y2.clamp(0.0, max_y) as i32,
                ),
                confidence: score.clamp(0.0, 1.0),
                class_id: class_id as u32,
                class_label: self.label(class_id as u32),
                source_image_index: 0,
            });
        }

        Ok(non_max_suppression(candidates, self.nms_threshold))
    }

    fn name(&self) -> &str {
        "model"
    }
}

/// Per-class greedy NMS, highest score first
pub fn non_max_suppression(mut detections: Vec<RawDetection>, iou_threshold: f32) -> Vec<RawDetection> {
    detections.sort_by(|a, b| b.confidence.total_cmp(&a.confidence));

    let mut kept: Vec<RawDetection> = Vec::with_capacity(detections.len());
    for detection in detections {
        let overlaps = kept.iter().any(|k| {
            k.class_id == detection.class_id && k.bbox.iou(&detection.bbox) > iou_threshold
        });
        if !overlaps {
            kept.push(detection);
        }
    }
    kept
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(bbox: (i32, i32, i32, i32), confidence: f32, class_id: u32) -> RawDetection {
        RawDetection {
            bbox: BoundingBox::new(bbox.0, bbox.1, bbox.2, bbox.3),
            confidence,
            class_id,
            class_label: "pill".to_string(),
            source_image_index: 0,
        }
    }

    #[test]
    fn test_nms_keeps_strongest_overlap() {
        let kept = non_max_suppression(
            vec![
                raw((0, 0, 40, 40), 0.7, 0),
                raw((2, 2, 42, 42), 0.9, 0),
                raw((100, 100, 140, 140), 0.8, 0),
            ],
            0.4,
        );
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].bbox.x1, 100);
    }

    #[test]
    fn test_nms_is_per_class() {
        let kept = non_max_suppression(
            vec![raw((0, 0, 40, 40), 0.7, 0), raw((0, 0, 40, 40), 0.9, 1)],
            0.4,
        );
        assert_eq!(kept.len(), 2);
    }

    #[test]
    fn test_missing_model_is_configuration_error() {
        let config = ModelConfig::default();
        let result = ModelDetector::load(Path::new("/nonexistent/pill_detector.rten"), &config);
        assert!(matches!(result, Err(Error::Configuration(_))));
    }
}
