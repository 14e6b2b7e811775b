// crates/veilcast-filter/src/models/yunet.rs
//
// YuNet face detector over an ort session.
//
// The adapter expects the post-processed YuNet export whose single output is
// a dynamic [N, 15] tensor, one row per candidate:
//   [x, y, w, h, lm0x, lm0y, ... lm4x, lm4y, score]
// (pixel coordinates relative to the input size; the five landmarks are
// right eye, left eye, nose tip, right/left mouth corner). Score filtering,
// top-k truncation, and NMS run here.

use std::path::Path;

use ndarray::ArrayD;
use ort::session::Session;
use ort::value::Value;

use veilcast_core::blur::BgrImage;
use veilcast_core::config::FaceConfig;
use veilcast_core::detect::{Detector, FaceBox};
use veilcast_core::error::{FilterError, Result};

const ROW_LEN: usize = 15;

pub struct YuNetDetector {
    session:    Session,
    config:     FaceConfig,
    input_size: (u32, u32),
}

impl YuNetDetector {
    pub fn new(model_path: &Path, config: FaceConfig) -> Result<Self> {
        let session = Session::builder()
            .map_err(|e| FilterError::Detect(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| FilterError::Detect(e.to_string()))?;
        Ok(Self { session, config, input_size: (0, 0) })
    }
}

impl Detector for YuNetDetector {
    fn set_input_size(&mut self, width: u32, height: u32) {
        if self.input_size != (width, height) {
            tracing::debug!(width, height, "detector input size updated");
            self.input_size = (width, height);
        }
    }

    fn detect(&mut self, image: &BgrImage) -> Result<Vec<FaceBox>> {
        let (w, h) = (image.width as usize, image.height as usize);

        // HWC bytes → planar CHW f32, BGR channel order, raw 0..255 values.
        let mut chw = vec![0f32; 3 * w * h];
        for (i, px) in image.data.chunks_exact(3).enumerate() {
            chw[i] = px[0] as f32;
            chw[w * h + i] = px[1] as f32;
            chw[2 * w * h + i] = px[2] as f32;
        }
        let input = ArrayD::from_shape_vec(vec![1, 3, h, w], chw)
            .map_err(|e| FilterError::Detect(e.to_string()))?;
        let input = Value::from_array(input).map_err(|e| FilterError::Detect(e.to_string()))?;

        let outputs = self
            .session
            .run([(&input).into()])
            .map_err(|e| FilterError::Detect(e.to_string()))?;

        let (shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| FilterError::Detect(e.to_string()))?;
        let cols = shape.as_ref().last().copied().unwrap_or(0) as usize;
        if cols != ROW_LEN {
            return Err(FilterError::Detect(format!(
                "unexpected detector output width {cols}, want {ROW_LEN}"
            )));
        }

        let mut faces: Vec<FaceBox> = data
            .chunks_exact(ROW_LEN)
            .filter(|row| row[14] >= self.config.score_threshold)
            .map(|row| FaceBox {
                x: row[0],
                y: row[1],
                w: row[2],
                h: row[3],
                score: row[14],
                landmarks: [
                    [row[4], row[5]],
                    [row[6], row[7]],
                    [row[8], row[9]],
                    [row[10], row[11]],
                    [row[12], row[13]],
                ],
            })
            .collect();

        faces.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(std::cmp::Ordering::Equal));
        faces.truncate(self.config.top_k);
        Ok(nms(faces, self.config.nms_threshold))
    }
}

/// Greedy non-maximum suppression over score-sorted boxes.
fn nms(sorted: Vec<FaceBox>, iou_threshold: f32) -> Vec<FaceBox> {
    let mut kept: Vec<FaceBox> = Vec::new();
    for candidate in sorted {
        if kept.iter().all(|k| iou(k, &candidate) <= iou_threshold) {
            kept.push(candidate);
        }
    }
    kept
}

fn iou(a: &FaceBox, b: &FaceBox) -> f32 {
    let x1 = a.x.max(b.x);
    let y1 = a.y.max(b.y);
    let x2 = (a.x + a.w).min(b.x + b.w);
    let y2 = (a.y + a.h).min(b.y + b.h);
    let overlap = (x2 - x1).max(0.0) * (y2 - y1).max(0.0);
    let union = a.w * a.h + b.w * b.h - overlap;
    if union <= 0.0 {
        0.0
    } else {
        overlap / union
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32, score: f32) -> FaceBox {
        FaceBox { x, y, w, h, score, landmarks: [[0.0; 2]; 5] }
    }

    #[test]
    fn iou_of_identical_boxes_is_one() {
        let a = face(10.0, 10.0, 20.0, 20.0, 0.9);
        assert!((iou(&a, &a) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn iou_of_disjoint_boxes_is_zero() {
        let a = face(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = face(100.0, 100.0, 10.0, 10.0, 0.9);
        assert_eq!(iou(&a, &b), 0.0);
    }

    #[test]
    fn iou_half_overlap() {
        let a = face(0.0, 0.0, 10.0, 10.0, 0.9);
        let b = face(5.0, 0.0, 10.0, 10.0, 0.9);
        // overlap 50, union 150
        assert!((iou(&a, &b) - 1.0 / 3.0).abs() < 1e-6);
    }

    #[test]
    fn nms_suppresses_heavy_overlap_keeps_distinct() {
        let boxes = vec![
            face(10.0, 10.0, 20.0, 20.0, 0.95),
            face(11.0, 11.0, 20.0, 20.0, 0.90), // near-duplicate of the first
            face(60.0, 60.0, 20.0, 20.0, 0.80), // separate face
        ];
        let kept = nms(boxes, 0.3);
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].score, 0.95);
        assert_eq!(kept[1].score, 0.80);
    }

    #[test]
    fn nms_empty_input() {
        assert!(nms(Vec::new(), 0.3).is_empty());
    }
}
