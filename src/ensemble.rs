//! Cross-image reconciliation of per-image detections.
//!
//! Detections of the same event are grouped with a greedy, seed-based scan:
//! the first unassigned detection opens a cluster and claims every later
//! unassigned detection of the same class whose IoU with the seed exceeds the
//! threshold. Ownership is first-come and never revisited, so results depend
//! on input order. Clusters seen in too few images are dropped as noise, the
//! rest are averaged and their confidence boosted by how often they were seen.

use time::OffsetDateTime;
use tracing::debug;

use crate::config::EnsembleConfig;
use crate::models::{BoundingBox, FusedDetection, RawDetection};

/// Intersection over union of two boxes
pub fn iou(a: &BoundingBox, b: &BoundingBox) -> f32 {
    a.iou(b)
}

#[derive(Debug, Clone)]
pub struct EnsembleAggregator {
    pub iou_threshold: f32,
    pub min_agreement: usize,
    pub boost_per_member: f32,
    pub boost_cap: f32,
    pub ensemble_threshold: f32,
}

impl EnsembleAggregator {
    pub fn new() -> Self {
        Self::from_config(&EnsembleConfig::default())
    }

    pub fn from_config(config: &EnsembleConfig) -> Self {
        Self {
            iou_threshold: config.iou_threshold,
            min_agreement: config.min_agreement,
            boost_per_member: config.boost_per_member,
            boost_cap: config.boost_cap,
            ensemble_threshold: config.ensemble_threshold,
        }
    }

    pub fn with_ensemble_threshold(mut self, threshold: f32) -> Self {
        self.ensemble_threshold = threshold;
        self
    }

    /// Fuse the detections of every captured image into the final list
    pub fn aggregate(&self, detections_per_image: &[Vec<RawDetection>]) -> Vec<FusedDetection> {
        let flat: Vec<&RawDetection> = detections_per_image.iter().flatten().collect();
        if flat.is_empty() {
            return Vec::new();
        }

        let clusters = self.cluster(&flat);
        let timestamp = OffsetDateTime::now_utc();

        let mut fused = Vec::new();
        for cluster in clusters {
            if cluster.len() < self.min_agreement {
                debug!(
                    class = %cluster[0].class_label,
                    members = cluster.len(),
                    "Cluster below agreement threshold"
                );
                continue;
            }

            let detection = self.fuse(&cluster, timestamp);
            if detection.confidence >= self.ensemble_threshold {
                fused.push(detection);
            } else {
                debug!(
                    class = %detection.class_label,
                    confidence = detection.confidence,
                    "Fused detection below ensemble threshold"
                );
            }
        }

        fused
    }

    fn cluster<'a>(&self, detections: &[&'a RawDetection]) -> Vec<Vec<&'a RawDetection>> {
        let mut assigned = vec![false; detections.len()];
        let mut clusters = Vec::new();

        for (i, seed) in detections.iter().enumerate() {
            if assigned[i] {
                continue;
            }
            assigned[i] = true;
            let mut cluster = vec![*seed];

            for (j, other) in detections.iter().enumerate() {
                if assigned[j] {
                    continue;
                }
                if seed.class_id == other.class_id
                    && iou(&seed.bbox, &other.bbox) > self.iou_threshold
                {
                    cluster.push(*other);
                    assigned[j] = true;
                }
            }

            clusters.push(cluster);
        }

        clusters
    }

    fn fuse(&self, cluster: &[&RawDetection], timestamp: OffsetDateTime) -> FusedDetection {
        let n = cluster.len();
        let mean = |f: fn(&BoundingBox) -> i32| -> i32 {
            let sum: f64 = cluster.iter().map(|d| f(&d.bbox) as f64).sum();
            (sum / n as f64) as i32
        };
        let bbox = BoundingBox::new(mean(|b| b.x1), mean(|b| b.y1), mean(|b| b.x2), mean(|b| b.y2));

        let mean_confidence = cluster.iter().map(|d| d.confidence).sum::<f32>() / n as f32;
        let boost = self.boost_cap.min(n as f32 * self.boost_per_member);
        let confidence = (mean_confidence + boost).clamp(0.0, 1.0);

        FusedDetection {
            bbox,
            confidence,
            class_id: cluster[0].class_id,
            class_label: cluster[0].class_label.clone(),
            support_count: n,
            timestamp,
        }
    }
}

impl Default for EnsembleAggregator {
    fn default() -> Self {
        Self::new()
    }
}
