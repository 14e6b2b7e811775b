// crates/veilcast-filter/src/models/sface.rs
//
// SFace feature extractor over an ort session.
//
// align_crop maps the detection's five landmarks onto the canonical 112×112
// face template with a least-squares similarity transform, then the warped
// crop goes through the network as a raw-valued BGR CHW tensor and comes
// back as a 128-dimensional feature vector.

use std::path::Path;

use ndarray::ArrayD;
use ort::session::Session;
use ort::value::Value;

use veilcast_core::blur::BgrImage;
use veilcast_core::detect::FaceBox;
use veilcast_core::error::{FilterError, Result};
use veilcast_core::recognize::Recognizer;

const CROP: usize = 112;

/// Canonical landmark positions in the 112×112 aligned crop
/// (right eye, left eye, nose tip, right mouth corner, left mouth corner).
const TEMPLATE: [[f32; 2]; 5] = [
    [38.2946, 51.6963],
    [73.5318, 51.5014],
    [56.0252, 71.7366],
    [41.5493, 92.3655],
    [70.7299, 92.2041],
];

pub struct SFaceRecognizer {
    session: Session,
}

impl SFaceRecognizer {
    pub fn new(model_path: &Path) -> Result<Self> {
        let session = Session::builder()
            .map_err(|e| FilterError::Recognize(e.to_string()))?
            .commit_from_file(model_path)
            .map_err(|e| FilterError::Recognize(e.to_string()))?;
        Ok(Self { session })
    }
}

impl Recognizer for SFaceRecognizer {
    fn extract_feature(&mut self, image: &BgrImage, face: &FaceBox) -> Result<Vec<f32>> {
        let transform = Similarity::estimate(&face.landmarks, &TEMPLATE)
            .ok_or_else(|| FilterError::Recognize("degenerate landmark geometry".into()))?;
        let aligned = warp_crop(image, &transform);

        // Raw 0..255 BGR values in CHW order, matching the model's training
        // preprocessing.
        let mut chw = vec![0f32; 3 * CROP * CROP];
        for (i, px) in aligned.chunks_exact(3).enumerate() {
            chw[i] = px[0] as f32;
            chw[CROP * CROP + i] = px[1] as f32;
            chw[2 * CROP * CROP + i] = px[2] as f32;
        }
        let input = ArrayD::from_shape_vec(vec![1, 3, CROP, CROP], chw)
            .map_err(|e| FilterError::Recognize(e.to_string()))?;
        let input = Value::from_array(input).map_err(|e| FilterError::Recognize(e.to_string()))?;

        let outputs = self
            .session
            .run([(&input).into()])
            .map_err(|e| FilterError::Recognize(e.to_string()))?;
        let (_shape, data) = outputs[0]
            .try_extract_tensor::<f32>()
            .map_err(|e| FilterError::Recognize(e.to_string()))?;

        if data.is_empty() {
            return Err(FilterError::Recognize("empty feature output".into()));
        }
        Ok(data.to_vec())
    }
}

/// 2-D similarity transform `dst = [a -b; b a] * src + [tx, ty]`.
struct Similarity {
    a:  f32,
    b:  f32,
    tx: f32,
    ty: f32,
}

impl Similarity {
    /// Least-squares fit mapping `src` points onto `dst` points. None when
    /// the source points are (near-)coincident.
    fn estimate(src: &[[f32; 2]; 5], dst: &[[f32; 2]; 5]) -> Option<Similarity> {
        let n = src.len() as f32;
        let (mut sx, mut sy, mut su, mut sv) = (0f32, 0f32, 0f32, 0f32);
        let (mut sxx_syy, mut sxu_syv, mut sxv_syu) = (0f32, 0f32, 0f32);

        for (s, d) in src.iter().zip(dst) {
            let (x, y) = (s[0], s[1]);
            let (u, v) = (d[0], d[1]);
            sx += x;
            sy += y;
            su += u;
            sv += v;
            sxx_syy += x * x + y * y;
            sxu_syv += x * u + y * v;
            sxv_syu += x * v - y * u;
        }

        let denom = sxx_syy - (sx * sx + sy * sy) / n;
        if denom.abs() < 1e-6 {
            return None;
        }
        let a = (sxu_syv - (sx * su + sy * sv) / n) / denom;
        let b = (sxv_syu - (sx * sv - sy * su) / n) / denom;
        let tx = (su - a * sx + b * sy) / n;
        let ty = (sv - b * sx - a * sy) / n;
        Some(Similarity { a, b, tx, ty })
    }

    /// Inverse mapping: aligned-crop coordinates → source coordinates.
    fn invert_point(&self, u: f32, v: f32) -> (f32, f32) {
        let scale_sq = self.a * self.a + self.b * self.b;
        let du = u - self.tx;
        let dv = v - self.ty;
        ((self.a * du + self.b * dv) / scale_sq, (self.a * dv - self.b * du) / scale_sq)
    }
}

/// Bilinear warp of the source image into the 112×112 aligned crop
/// (packed BGR bytes). Samples outside the frame clamp to the edge.
fn warp_crop(image: &BgrImage, transform: &Similarity) -> Vec<u8> {
    let mut out = vec![0u8; CROP * CROP * 3];
    let (w, h) = (image.width as usize, image.height as usize);
    let row_bytes = image.row_bytes();

    for v in 0..CROP {
        for u in 0..CROP {
            let (sx, sy) = transform.invert_point(u as f32, v as f32);
            let sx = sx.clamp(0.0, (w - 1) as f32);
            let sy = sy.clamp(0.0, (h - 1) as f32);

            let x0 = sx.floor() as usize;
            let y0 = sy.floor() as usize;
            let x1 = (x0 + 1).min(w - 1);
            let y1 = (y0 + 1).min(h - 1);
            let fx = sx - x0 as f32;
            let fy = sy - y0 as f32;

            let dst = (v * CROP + u) * 3;
            for c in 0..3 {
                let p00 = image.data[y0 * row_bytes + x0 * 3 + c] as f32;
                let p01 = image.data[y0 * row_bytes + x1 * 3 + c] as f32;
                let p10 = image.data[y1 * row_bytes + x0 * 3 + c] as f32;
                let p11 = image.data[y1 * row_bytes + x1 * 3 + c] as f32;
                let top = p00 + (p01 - p00) * fx;
                let bottom = p10 + (p11 - p10) * fx;
                out[dst + c] = (top + (bottom - top) * fy).round().clamp(0.0, 255.0) as u8;
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_when_landmarks_match_template() {
        let t = Similarity::estimate(&TEMPLATE, &TEMPLATE).unwrap();
        assert!((t.a - 1.0).abs() < 1e-4, "a = {}", t.a);
        assert!(t.b.abs() < 1e-4, "b = {}", t.b);
        assert!(t.tx.abs() < 1e-3 && t.ty.abs() < 1e-3);
    }

    #[test]
    fn pure_translation_is_recovered() {
        let mut shifted = TEMPLATE;
        for p in &mut shifted {
            p[0] += 10.0;
            p[1] -= 4.0;
        }
        // Map shifted landmarks back onto the template.
        let t = Similarity::estimate(&shifted, &TEMPLATE).unwrap();
        let (x, y) = (shifted[2][0], shifted[2][1]);
        let u = t.a * x - t.b * y + t.tx;
        let v = t.b * x + t.a * y + t.ty;
        assert!((u - TEMPLATE[2][0]).abs() < 1e-3);
        assert!((v - TEMPLATE[2][1]).abs() < 1e-3);
    }

    #[test]
    fn uniform_scale_is_recovered() {
        let mut scaled = TEMPLATE;
        for p in &mut scaled {
            p[0] *= 2.0;
            p[1] *= 2.0;
        }
        let t = Similarity::estimate(&scaled, &TEMPLATE).unwrap();
        let scale = (t.a * t.a + t.b * t.b).sqrt();
        assert!((scale - 0.5).abs() < 1e-4, "scale = {scale}");
    }

    #[test]
    fn coincident_points_are_rejected() {
        let degenerate = [[5.0f32, 5.0]; 5];
        assert!(Similarity::estimate(&degenerate, &TEMPLATE).is_none());
    }

    #[test]
    fn invert_round_trips() {
        let mut rotated = TEMPLATE;
        for p in &mut rotated {
            // Rotate ~10° and translate.
            let (x, y) = (p[0], p[1]);
            p[0] = 0.985 * x - 0.174 * y + 7.0;
            p[1] = 0.174 * x + 0.985 * y - 3.0;
        }
        let t = Similarity::estimate(&rotated, &TEMPLATE).unwrap();
        for p in &rotated {
            let u = t.a * p[0] - t.b * p[1] + t.tx;
            let v = t.b * p[0] + t.a * p[1] + t.ty;
            let (x, y) = t.invert_point(u, v);
            assert!((x - p[0]).abs() < 1e-2 && (y - p[1]).abs() < 1e-2);
        }
    }

    #[test]
    fn warp_of_flat_image_is_flat() {
        let image = BgrImage::new(vec![200; 200 * 200 * 3], 200, 200);
        let t = Similarity::estimate(&TEMPLATE, &TEMPLATE).unwrap();
        let crop = warp_crop(&image, &t);
        assert!(crop.iter().all(|&v| v == 200));
    }
}
