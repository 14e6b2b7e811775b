// crates/veilcast-core/src/recognize.rs
//
// Face recognition interface and the similarity scoring used by the consent
// match rule. Scores follow the SFace model's conventions as the source
// system applied them: a face matches a known feature when
// cosine < COSINE_THRESHOLD or l2 < L2_THRESHOLD.

use crate::blur::BgrImage;
use crate::detect::FaceBox;
use crate::error::Result;

/// Face feature extractor. Owned by exactly one component at a time (the
/// consent manager, or the video worker's gate); never shared.
pub trait Recognizer: Send {
    /// Align-crop the face out of `image` using the detection's landmarks and
    /// produce its feature vector.
    fn extract_feature(&mut self, image: &BgrImage, face: &FaceBox) -> Result<Vec<f32>>;
}

/// Cosine similarity between two feature vectors.
pub fn cosine_score(a: &[f32], b: &[f32]) -> f32 {
    let dot: f32 = a.iter().zip(b).map(|(x, y)| x * y).sum();
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return 0.0;
    }
    dot / (na * nb)
}

/// L2 distance between the unit-normalized feature vectors.
pub fn l2_score(a: &[f32], b: &[f32]) -> f32 {
    let na: f32 = a.iter().map(|x| x * x).sum::<f32>().sqrt();
    let nb: f32 = b.iter().map(|x| x * x).sum::<f32>().sqrt();
    if na == 0.0 || nb == 0.0 {
        return f32::MAX;
    }
    a.iter()
        .zip(b)
        .map(|(x, y)| {
            let d = x / na - y / nb;
            d * d
        })
        .sum::<f32>()
        .sqrt()
}

/// The consent match rule over a pair of scores.
pub fn scores_match(cosine: f32, l2: f32, cosine_threshold: f32, l2_threshold: f32) -> bool {
    cosine < cosine_threshold || l2 < l2_threshold
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cosine_of_identical_vectors_is_one() {
        let v = vec![0.5, -1.0, 2.0, 0.25];
        assert!((cosine_score(&v, &v) - 1.0).abs() < 1e-6);
    }

    #[test]
    fn cosine_of_orthogonal_vectors_is_zero() {
        assert!(cosine_score(&[1.0, 0.0], &[0.0, 1.0]).abs() < 1e-6);
    }

    #[test]
    fn l2_of_identical_vectors_is_zero() {
        let v = vec![3.0, 4.0];
        assert!(l2_score(&v, &v) < 1e-6);
        // Scale-invariant: normalization happens inside.
        let w = vec![6.0, 8.0];
        assert!(l2_score(&v, &w) < 1e-6);
    }

    #[test]
    fn l2_of_opposite_unit_vectors_is_two() {
        assert!((l2_score(&[1.0, 0.0], &[-1.0, 0.0]) - 2.0).abs() < 1e-6);
    }

    #[test]
    fn zero_vector_never_matches() {
        let zero = vec![0.0; 4];
        let v = vec![1.0, 0.0, 0.0, 0.0];
        assert_eq!(l2_score(&zero, &v), f32::MAX);
        assert!(!scores_match(cosine_score(&zero, &v), l2_score(&zero, &v), 0.363, 1.128));
    }
}
