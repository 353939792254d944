use std::cmp::Ordering;

use crate::message::FrameDetection;

pub const DEFAULT_CONFIDENCE_THRESHOLD: f32 = 0.5;
pub const DEFAULT_OVERLAP_THRESHOLD: f32 = 0.1;

/// Non-maximum suppression parameters.
///
/// Tightly packed targets want a much lower overlap threshold (0.01) than
/// sparse scenes (0.1); neither is correct for every deployment.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct NmsConfig {
    /// Detections below this confidence are discarded outright.
    pub confidence_threshold: f32,
    /// IoU above which the lower-confidence box of a pair is suppressed.
    pub overlap_threshold: f32,
}

impl Default for NmsConfig {
    fn default() -> Self {
        Self {
            confidence_threshold: DEFAULT_CONFIDENCE_THRESHOLD,
            overlap_threshold: DEFAULT_OVERLAP_THRESHOLD,
        }
    }
}

/// Greedy NMS over frame-space detections: indices of the survivors, ascending.
///
/// Candidates below the confidence threshold are dropped, the rest are visited
/// by confidence, highest first, and overlap is measured on absolute pixel
/// boxes of a `frame_width` x `frame_height` frame. Running this on its own
/// output removes nothing further.
pub fn survivors(
    detections: &[FrameDetection],
    config: &NmsConfig,
    frame_width: u32,
    frame_height: u32,
) -> Vec<usize> {
    let mut by_confidence: Vec<usize> = (0..detections.len())
        .filter(|&i| detections[i].confidence >= config.confidence_threshold)
        .collect();
    by_confidence.sort_by(|&a, &b| {
        detections[b]
            .confidence
            .partial_cmp(&detections[a].confidence)
            .unwrap_or(Ordering::Equal)
    });

    let boxes: Vec<_> = detections
        .iter()
        .map(|det| det.pixel_box(frame_width, frame_height))
        .collect();

    let mut kept: Vec<usize> = Vec::with_capacity(by_confidence.len());
    for i in by_confidence {
        let duplicate = kept
            .iter()
            .any(|&k| iou(boxes[k], boxes[i]) > config.overlap_threshold as f64);
        if !duplicate {
            kept.push(i);
        }
    }
    kept.sort_unstable();
    kept
}

/// Intersection over union of two `(x, y, w, h)` pixel boxes.
fn iou(a: (f64, f64, f64, f64), b: (f64, f64, f64, f64)) -> f64 {
    let ix = ((a.0 + a.2).min(b.0 + b.2) - a.0.max(b.0)).max(0.0);
    let iy = ((a.1 + a.3).min(b.1 + b.3) - a.1.max(b.1)).max(0.0);
    let inter = ix * iy;
    let union = a.2 * a.3 + b.2 * b.3 - inter;
    if union <= 0.0 {
        return 0.0;
    }
    inter / union
}

#[cfg(test)]
mod tests {
    use super::*;

    fn suppress(
        dets: Vec<FrameDetection>,
        config: &NmsConfig,
        width: u32,
        height: u32,
    ) -> Vec<FrameDetection> {
        survivors(&dets, config, width, height)
            .into_iter()
            .map(|i| dets[i].clone())
            .collect()
    }

    fn det(xmin: f32, ymin: f32, xmax: f32, ymax: f32, confidence: f32) -> FrameDetection {
        FrameDetection {
            xmin,
            ymin,
            xmax,
            ymax,
            confidence,
            label: None,
            frame_sequence_number: 1,
            tile_index: 0,
        }
    }

    #[test]
    fn iou_of_identical_and_disjoint_boxes() {
        assert!((iou((0.0, 0.0, 10.0, 10.0), (0.0, 0.0, 10.0, 10.0)) - 1.0).abs() < 1e-9);
        assert_eq!(iou((0.0, 0.0, 10.0, 10.0), (20.0, 20.0, 5.0, 5.0)), 0.0);
        assert_eq!(iou((0.0, 0.0, 0.0, 0.0), (0.0, 0.0, 0.0, 0.0)), 0.0);
    }

    #[test]
    fn keeps_highest_confidence_of_overlapping_pair() {
        let dets = vec![
            det(0.10, 0.10, 0.30, 0.30, 0.7),
            det(0.11, 0.11, 0.31, 0.31, 0.9),
            det(0.60, 0.60, 0.80, 0.80, 0.8),
        ];
        let kept = suppress(dets, &NmsConfig::default(), 1000, 1000);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].confidence, 0.9);
        assert_eq!(kept[1].confidence, 0.8);
    }

    #[test]
    fn survivors_keep_input_order() {
        let dets = vec![
            det(0.0, 0.0, 0.1, 0.1, 0.6),
            det(0.5, 0.5, 0.6, 0.6, 0.9),
            det(0.8, 0.0, 0.9, 0.1, 0.7),
        ];
        let kept = suppress(dets, &NmsConfig::default(), 1000, 1000);
        let order: Vec<f32> = kept.iter().map(|d| d.confidence).collect();
        assert_eq!(order, vec![0.6, 0.9, 0.7]);
    }

    #[test]
    fn drops_low_confidence_detections() {
        let dets = vec![det(0.1, 0.1, 0.2, 0.2, 0.3), det(0.5, 0.5, 0.6, 0.6, 0.6)];
        let kept = suppress(dets, &NmsConfig::default(), 640, 480);
        assert_eq!(kept.len(), 1);
        assert_eq!(kept[0].confidence, 0.6);
    }

    #[test]
    fn tighter_threshold_suppresses_slight_overlap() {
        // boxes touching by a sliver: IoU ~= 0.05
        let dets = vec![det(0.0, 0.0, 0.2, 0.2, 0.9), det(0.19, 0.0, 0.39, 0.2, 0.8)];
        let loose = NmsConfig::default();
        let tight = NmsConfig {
            overlap_threshold: 0.01,
            ..NmsConfig::default()
        };
        assert_eq!(suppress(dets.clone(), &loose, 1000, 1000).len(), 2);
        assert_eq!(suppress(dets, &tight, 1000, 1000).len(), 1);
    }

    #[test]
    fn survivor_indices_point_into_input() {
        let dets = vec![
            det(0.10, 0.10, 0.30, 0.30, 0.7),
            det(0.50, 0.50, 0.60, 0.60, 0.2),
            det(0.11, 0.11, 0.31, 0.31, 0.9),
        ];
        assert_eq!(survivors(&dets, &NmsConfig::default(), 1000, 1000), vec![2]);
    }

    #[test]
    fn suppression_is_idempotent() {
        let dets = vec![
            det(0.10, 0.10, 0.30, 0.30, 0.95),
            det(0.12, 0.12, 0.32, 0.32, 0.90),
            det(0.25, 0.25, 0.45, 0.45, 0.85),
            det(0.40, 0.40, 0.60, 0.60, 0.80),
            det(0.70, 0.10, 0.90, 0.30, 0.75),
            det(0.71, 0.11, 0.91, 0.31, 0.40),
        ];
        let config = NmsConfig::default();
        let once = suppress(dets, &config, 1280, 720);
        let twice = suppress(once.clone(), &config, 1280, 720);
        assert_eq!(once, twice);
    }
}
