// crates/veilcast-core/src/detect.rs
//
// Face detection interface plus the rectangle math shared by the mask stage,
// consent capture, and the consent manager.

use crate::blur::BgrImage;
use crate::error::Result;

/// One detected face in pixel coordinates, with the five YuNet landmarks
/// (eyes, nose tip, mouth corners) used by the recognizer's alignment step.
#[derive(Debug, Clone, PartialEq)]
pub struct FaceBox {
    pub x:         f32,
    pub y:         f32,
    pub w:         f32,
    pub h:         f32,
    pub score:     f32,
    pub landmarks: [[f32; 2]; 5],
}

impl FaceBox {
    pub fn area(&self) -> f32 {
        self.w * self.h
    }
}

/// Axis-aligned integer rectangle, inclusive of `x1,y1`, exclusive of `x2,y2`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Rect {
    pub x1: u32,
    pub y1: u32,
    pub x2: u32,
    pub y2: u32,
}

impl Rect {
    pub fn width(&self) -> u32 {
        self.x2.saturating_sub(self.x1)
    }

    pub fn height(&self) -> u32 {
        self.y2.saturating_sub(self.y1)
    }

    pub fn is_empty(&self) -> bool {
        self.width() == 0 || self.height() == 0
    }
}

/// Expand a detection by `padding_ratio` of its short side and clip to
/// `[0, w-1] x [0, h-1]`.
pub fn padded_rect(face: &FaceBox, width: u32, height: u32, padding_ratio: f32) -> Rect {
    let padding = (face.w.min(face.h) * padding_ratio).floor();
    let x1 = (face.x - padding).max(0.0) as u32;
    let y1 = (face.y - padding).max(0.0) as u32;
    let x2 = (face.x + face.w + padding).min(width.saturating_sub(1) as f32) as u32;
    let y2 = (face.y + face.h + padding).min(height.saturating_sub(1) as f32) as u32;
    Rect { x1, y1, x2: x2.max(x1), y2: y2.max(y1) }
}

/// Face detector over a BGR image. Implementations are not required to be
/// thread-safe; each owner holds its own instance.
pub trait Detector: Send {
    /// Inform the detector of the frame dimensions. Called only when the
    /// dimensions change; implementations may rebuild internal buffers.
    fn set_input_size(&mut self, width: u32, height: u32);

    /// Detect faces, already filtered by the detector's own score threshold
    /// and NMS. Confidence filtering against `min_confidence` stays with the
    /// caller.
    fn detect(&mut self, image: &BgrImage) -> Result<Vec<FaceBox>>;
}

/// The detection with the largest area, if any.
pub fn largest_face(faces: &[FaceBox]) -> Option<&FaceBox> {
    faces
        .iter()
        .max_by(|a, b| a.area().partial_cmp(&b.area()).unwrap_or(std::cmp::Ordering::Equal))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn face(x: f32, y: f32, w: f32, h: f32) -> FaceBox {
        FaceBox { x, y, w, h, score: 0.9, landmarks: [[0.0; 2]; 5] }
    }

    #[test]
    fn padding_is_a_tenth_of_the_short_side() {
        let rect = padded_rect(&face(100.0, 100.0, 50.0, 80.0), 640, 480, 0.1);
        // floor(min(50, 80) * 0.1) = 5
        assert_eq!(rect, Rect { x1: 95, y1: 95, x2: 155, y2: 185 });
    }

    #[test]
    fn rect_clips_to_frame_bounds() {
        let rect = padded_rect(&face(-10.0, -10.0, 60.0, 60.0), 640, 480, 0.1);
        assert_eq!((rect.x1, rect.y1), (0, 0));

        let rect = padded_rect(&face(600.0, 440.0, 60.0, 60.0), 640, 480, 0.1);
        assert_eq!((rect.x2, rect.y2), (639, 479));
    }

    #[test]
    fn degenerate_face_yields_empty_rect_not_panic() {
        let rect = padded_rect(&face(700.0, 500.0, 10.0, 10.0), 640, 480, 0.1);
        assert!(rect.is_empty() || rect.width() <= 1);
    }

    #[test]
    fn largest_face_picks_max_area() {
        let faces = vec![face(0.0, 0.0, 10.0, 10.0), face(0.0, 0.0, 30.0, 20.0), face(0.0, 0.0, 5.0, 100.0)];
        let largest = largest_face(&faces).unwrap();
        assert_eq!((largest.w, largest.h), (30.0, 20.0));
    }

    #[test]
    fn largest_face_empty_input() {
        assert!(largest_face(&[]).is_none());
    }
}
