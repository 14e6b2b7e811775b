// crates/veilcast-filter/src/mask.rs
//
// The per-frame masking stage: detect faces (with a wall-clock result
// cache), consult the consent gate, blur what isn't consented.
//
// The cache stores padded rectangles AND the gate verdicts, so recognition
// runs once per detection pass, not once per frame. Cache keying is
// wall-clock age only, a deliberate copy of the source system's behavior;
// a content-keyed cache would also catch scene cuts inside the window.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::{debug, info};

use veilcast_core::blur::{blur_region, BgrImage};
use veilcast_core::config::FaceConfig;
use veilcast_core::consent::ConsentDatabase;
use veilcast_core::detect::{padded_rect, Detector, FaceBox, Rect};
use veilcast_core::error::Result;
use veilcast_core::recognize::Recognizer;

/// How often cache statistics are logged.
const STATS_INTERVAL: Duration = Duration::from_secs(30);

/// Recognition gate: matches detections against the consent database.
pub struct RecognitionGate {
    pub recognizer: Box<dyn Recognizer>,
    pub database:   Arc<ConsentDatabase>,
}

impl RecognitionGate {
    /// The matched name, or None (blur). Extraction failures count as no
    /// consent; failing open would leak a face.
    fn consent_for(&mut self, image: &BgrImage, face: &FaceBox, config: &FaceConfig) -> Option<String> {
        match self.recognizer.extract_feature(image, face) {
            Ok(feature) => self
                .database
                .match_feature(&feature, config.cosine_threshold, config.l2_threshold)
                .map(|m| m.name),
            Err(e) => {
                debug!(error = %e, "feature extraction failed, face stays blurred");
                None
            }
        }
    }
}

struct CachedFace {
    rect:    Rect,
    consent: Option<String>,
}

pub struct FaceMask {
    detector:   Box<dyn Detector>,
    gate:       Option<RecognitionGate>,
    config:     FaceConfig,
    input_size: Option<(u32, u32)>,
    cached:     Option<Vec<CachedFace>>,
    cached_at:  Instant,
    hits:       u64,
    misses:     u64,
    last_stats: Instant,
}

impl FaceMask {
    pub fn new(detector: Box<dyn Detector>, gate: Option<RecognitionGate>, config: FaceConfig) -> Self {
        Self {
            detector,
            gate,
            config,
            input_size: None,
            cached: None,
            cached_at: Instant::now(),
            hits: 0,
            misses: 0,
            last_stats: Instant::now(),
        }
    }

    /// Detect-and-blur in place. Returns the number of faces detected (the
    /// cached rectangle count); with the gate enabled, consented faces count
    /// but are not blurred.
    pub fn process(&mut self, image: &mut BgrImage) -> Result<usize> {
        let size = (image.width, image.height);
        if self.input_size != Some(size) {
            self.detector.set_input_size(image.width, image.height);
            self.input_size = Some(size);
            // Rectangles from the old geometry would land on wrong pixels.
            self.cached = None;
        }

        let cache_age = self.cached_at.elapsed();
        let expired = cache_age > Duration::from_millis(self.config.cache_duration_ms);

        if self.cached.is_none() || expired {
            self.misses += 1;
            let faces = self.detector.detect(image)?;
            let mut cached = Vec::new();
            for face in faces {
                if face.score < self.config.min_confidence {
                    continue;
                }
                let rect = padded_rect(&face, image.width, image.height, self.config.padding_ratio);
                let consent = if self.config.gate_enabled {
                    self.gate
                        .as_mut()
                        .and_then(|gate| gate.consent_for(image, &face, &self.config))
                } else {
                    None
                };
                cached.push(CachedFace { rect, consent });
            }
            self.cached = Some(cached);
            self.cached_at = Instant::now();
        } else {
            self.hits += 1;
        }

        self.maybe_log_stats();

        let faces = self.cached.as_ref().expect("cache filled above");
        for face in faces {
            if face.consent.is_none() {
                blur_region(image, face.rect, self.config.blur_kernel);
            }
        }
        Ok(faces.len())
    }

    /// Direct detection pass for consent capture; bypasses the cache.
    pub fn detect_faces(&mut self, image: &BgrImage) -> Result<Vec<FaceBox>> {
        let size = (image.width, image.height);
        if self.input_size != Some(size) {
            self.detector.set_input_size(image.width, image.height);
            self.input_size = Some(size);
            self.cached = None;
        }
        self.detector.detect(image)
    }

    fn maybe_log_stats(&mut self) {
        if self.last_stats.elapsed() < STATS_INTERVAL {
            return;
        }
        let total = self.hits + self.misses;
        if total > 0 {
            let hit_rate = self.hits as f64 / total as f64 * 100.0;
            info!(
                hits = self.hits,
                misses = self.misses,
                "face detection cache stats: {hit_rate:.1}% hit rate"
            );
        }
        self.last_stats = Instant::now();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilcast_core::error::FilterError;

    /// Detector returning a fixed face list and counting calls.
    struct FakeDetector {
        faces: Vec<FaceBox>,
        calls: Arc<std::sync::atomic::AtomicUsize>,
    }

    impl Detector for FakeDetector {
        fn set_input_size(&mut self, _width: u32, _height: u32) {}

        fn detect(&mut self, _image: &BgrImage) -> Result<Vec<FaceBox>> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            Ok(self.faces.clone())
        }
    }

    /// Recognizer returning a fixed feature.
    struct FakeRecognizer {
        feature: Vec<f32>,
    }

    impl Recognizer for FakeRecognizer {
        fn extract_feature(&mut self, _image: &BgrImage, _face: &FaceBox) -> Result<Vec<f32>> {
            if self.feature.is_empty() {
                return Err(FilterError::Recognize("no feature".into()));
            }
            Ok(self.feature.clone())
        }
    }

    fn face_at(x: f32, y: f32, score: f32) -> FaceBox {
        FaceBox { x, y, w: 20.0, h: 20.0, score, landmarks: [[0.0; 2]; 5] }
    }

    fn gray_image() -> BgrImage {
        BgrImage::new(vec![128; 64 * 64 * 3], 64, 64)
    }

    fn mask_with(
        faces: Vec<FaceBox>,
        gate: Option<RecognitionGate>,
        config: FaceConfig,
    ) -> (FaceMask, Arc<std::sync::atomic::AtomicUsize>) {
        let calls = Arc::new(std::sync::atomic::AtomicUsize::new(0));
        let detector = FakeDetector { faces, calls: Arc::clone(&calls) };
        (FaceMask::new(Box::new(detector), gate, config), calls)
    }

    #[test]
    fn fresh_cache_skips_detection() {
        let config = FaceConfig { cache_duration_ms: 60_000, ..Default::default() };
        let (mut mask, calls) = mask_with(vec![face_at(10.0, 10.0, 0.9)], None, config);
        let mut image = gray_image();
        assert_eq!(mask.process(&mut image).unwrap(), 1);
        assert_eq!(mask.process(&mut image).unwrap(), 1);
        assert_eq!(mask.process(&mut image).unwrap(), 1);
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 1, "two cache hits");
    }

    #[test]
    fn zero_cache_duration_detects_every_frame() {
        let config = FaceConfig { cache_duration_ms: 0, ..Default::default() };
        let (mut mask, calls) = mask_with(vec![face_at(10.0, 10.0, 0.9)], None, config);
        let mut image = gray_image();
        mask.process(&mut image).unwrap();
        std::thread::sleep(Duration::from_millis(2));
        mask.process(&mut image).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[test]
    fn dimension_change_invalidates_cache() {
        let config = FaceConfig { cache_duration_ms: 60_000, ..Default::default() };
        let (mut mask, calls) = mask_with(vec![face_at(10.0, 10.0, 0.9)], None, config);
        let mut image = gray_image();
        mask.process(&mut image).unwrap();
        let mut bigger = BgrImage::new(vec![128; 128 * 128 * 3], 128, 128);
        mask.process(&mut bigger).unwrap();
        assert_eq!(calls.load(std::sync::atomic::Ordering::SeqCst), 2, "resize forces re-detect");
    }

    #[test]
    fn low_confidence_faces_are_ignored() {
        let config = FaceConfig { cache_duration_ms: 60_000, min_confidence: 0.5, ..Default::default() };
        let (mut mask, _calls) =
            mask_with(vec![face_at(10.0, 10.0, 0.4), face_at(30.0, 30.0, 0.9)], None, config);
        let mut image = gray_image();
        assert_eq!(mask.process(&mut image).unwrap(), 1);
    }

    #[test]
    fn zero_faces_leaves_pixels_untouched() {
        let config = FaceConfig { cache_duration_ms: 60_000, ..Default::default() };
        let (mut mask, _calls) = mask_with(vec![], None, config);
        let mut image = gray_image();
        let original = image.clone();
        assert_eq!(mask.process(&mut image).unwrap(), 0);
        assert_eq!(image, original);
    }

    #[test]
    fn unconsented_face_is_blurred() {
        let config = FaceConfig { cache_duration_ms: 60_000, ..Default::default() };
        let (mut mask, _calls) = mask_with(vec![face_at(20.0, 20.0, 0.9)], None, config);
        // Checker pattern inside the face so the blur visibly changes pixels.
        let mut image = gray_image();
        for y in 20..40usize {
            for x in 20..40usize {
                let i = (y * 64 + x) * 3;
                let v = if (x + y) % 2 == 0 { 255 } else { 0 };
                image.data[i..i + 3].copy_from_slice(&[v, v, v]);
            }
        }
        let before = image.clone();
        mask.process(&mut image).unwrap();
        assert_ne!(image, before, "face region must change");
    }

    #[test]
    fn consented_face_is_not_blurred() {
        let database = Arc::new(ConsentDatabase::new());
        database.insert(veilcast_core::consent::ConsentRecord {
            path: "/c/20250101120000_alice.jpg".into(),
            name: "alice".into(),
            feature: vec![1.0, 0.0],
            captured_at: chrono::NaiveDate::from_ymd_opt(2025, 1, 1)
                .unwrap()
                .and_hms_opt(12, 0, 0)
                .unwrap(),
        });
        let gate = RecognitionGate {
            recognizer: Box::new(FakeRecognizer { feature: vec![1.0, 0.0] }),
            database,
        };
        let config = FaceConfig { cache_duration_ms: 60_000, gate_enabled: true, ..Default::default() };
        let (mut mask, _calls) = mask_with(vec![face_at(20.0, 20.0, 0.9)], Some(gate), config);

        let mut image = gray_image();
        let before = image.clone();
        assert_eq!(mask.process(&mut image).unwrap(), 1, "face still counted");
        assert_eq!(image, before, "matched face passes through unblurred");
    }

    #[test]
    fn extraction_failure_blurs_face() {
        let gate = RecognitionGate {
            recognizer: Box::new(FakeRecognizer { feature: vec![] }),
            database: Arc::new(ConsentDatabase::new()),
        };
        let config = FaceConfig { cache_duration_ms: 60_000, gate_enabled: true, ..Default::default() };
        let (mut mask, _calls) = mask_with(vec![face_at(20.0, 20.0, 0.9)], Some(gate), config);

        let mut image = gray_image();
        for y in 20..40usize {
            for x in 20..40usize {
                let i = (y * 64 + x) * 3;
                let v = if (x + y) % 2 == 0 { 255 } else { 0 };
                image.data[i..i + 3].copy_from_slice(&[v, v, v]);
            }
        }
        let before = image.clone();
        mask.process(&mut image).unwrap();
        assert_ne!(image, before, "no feature → no consent → blurred");
    }
}
