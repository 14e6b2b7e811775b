// crates/veilcast-filter/src/consent/manager.rs
//
// Consent manager: owns its own detector + recognizer pair and is the only
// writer of the recognition database. Startup enumerates the directory;
// afterwards watcher events drive adds and removals. Every per-file failure
// (unreadable image, no face, extraction error) is a warn-and-skip, never a
// worker error.

use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, RecvTimeoutError};
use tracing::{info, warn};

use veilcast_core::blur::BgrImage;
use veilcast_core::config::ConsentConfig;
use veilcast_core::consent::{ConsentDatabase, ConsentFilename, ConsentRecord, CONSENT_EXTENSION};
use veilcast_core::detect::{largest_face, Detector};
use veilcast_core::error::{FilterError, Result};
use veilcast_core::recognize::Recognizer;

use super::watcher::WatchEvent;
use crate::workers::WorkerHandles;

pub const NAME: &str = "consent";

pub struct ConsentManager {
    database:   Arc<ConsentDatabase>,
    detector:   Box<dyn Detector>,
    recognizer: Box<dyn Recognizer>,
    config:     ConsentConfig,
}

impl ConsentManager {
    pub fn new(
        database: Arc<ConsentDatabase>,
        detector: Box<dyn Detector>,
        recognizer: Box<dyn Recognizer>,
        config: ConsentConfig,
    ) -> Self {
        Self { database, detector, recognizer, config }
    }

    /// Create the directory if needed and load every `.jpg` already there.
    pub fn load_existing(&mut self) {
        if !self.config.directory.exists() {
            if let Err(e) = std::fs::create_dir_all(&self.config.directory) {
                warn!(
                    dir = %self.config.directory.display(),
                    error = %e,
                    "could not create consent directory"
                );
                return;
            }
            info!(dir = %self.config.directory.display(), "created consent directory");
            return;
        }

        let mut files: Vec<_> = match std::fs::read_dir(&self.config.directory) {
            Ok(entries) => entries
                .flatten()
                .map(|entry| entry.path())
                .filter(|path| path.extension().and_then(|e| e.to_str()) == Some(CONSENT_EXTENSION))
                .collect(),
            Err(e) => {
                warn!(error = %e, "could not read consent directory");
                return;
            }
        };
        files.sort();

        info!(count = files.len(), "loading existing consent files");
        for path in &files {
            if let Err(e) = self.process_file(path) {
                warn!(file = %path.display(), error = %e, "consent file skipped");
            }
        }
        info!(
            records = self.database.len(),
            people = self.database.consented_names().len(),
            "consent database loaded"
        );
    }

    pub fn handle_event(&mut self, event: WatchEvent) {
        match event {
            WatchEvent::Added(path) => {
                match self.process_file(&path) {
                    Ok(name) => info!(name = %name, file = %path.display(), "consent added"),
                    Err(e) => warn!(file = %path.display(), error = %e, "consent file skipped"),
                }
            }
            WatchEvent::Removed(path) => {
                let names_before: HashSet<String> = self.database.consented_names();
                if let Some(name) = self.database.remove_by_path(&path) {
                    if names_before.contains(&name) && !self.database.is_name_consented(&name) {
                        info!(name = %name, "consent revoked");
                    }
                }
            }
        }
    }

    /// Load → detect largest face → extract feature → insert (path-keyed
    /// replace happens inside the database). Returns the record's name.
    fn process_file(&mut self, path: &Path) -> Result<String> {
        let filename = path
            .file_name()
            .and_then(|f| f.to_str())
            .ok_or_else(|| consent_error(path, "unreadable filename"))?;
        let parsed = ConsentFilename::parse(filename)
            .ok_or_else(|| consent_error(path, "invalid consent filename format"))?;

        let image = load_bgr(path)?;
        self.detector.set_input_size(image.width, image.height);
        let faces = self.detector.detect(&image)?;
        let face = largest_face(&faces)
            .ok_or_else(|| consent_error(path, "no face detected in consent image"))?
            .clone();
        let feature = self.recognizer.extract_feature(&image, &face)?;

        self.database.insert(ConsentRecord {
            path: path.to_path_buf(),
            name: parsed.name.clone(),
            feature,
            captured_at: parsed.captured_at,
        });
        Ok(parsed.name)
    }
}

fn consent_error(path: &Path, reason: &str) -> FilterError {
    FilterError::ConsentLoad { path: path.to_path_buf(), reason: reason.to_string() }
}

fn load_bgr(path: &Path) -> Result<BgrImage> {
    let rgb = image::open(path)
        .map_err(|e| consent_error(path, &format!("image load failed: {e}")))?
        .to_rgb8();
    let (width, height) = (rgb.width(), rgb.height());
    let data: Vec<u8> = rgb
        .into_raw()
        .chunks_exact(3)
        .flat_map(|px| [px[2], px[1], px[0]])
        .collect();
    Ok(BgrImage::new(data, width, height))
}

// ── Worker loop ───────────────────────────────────────────────────────────────

pub struct ConsentContext {
    pub handles: WorkerHandles,
    pub manager: ConsentManager,
    pub events:  Receiver<WatchEvent>,
}

pub fn run(mut ctx: ConsentContext) -> anyhow::Result<()> {
    ctx.manager.load_existing();

    while !ctx.handles.shutdown.is_set() {
        ctx.handles.registry.heartbeat(NAME);
        match ctx.events.recv_timeout(Duration::from_millis(250)) {
            Ok(event) => ctx.manager.handle_event(event),
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    info!("consent manager done");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use veilcast_core::detect::FaceBox;

    /// Detector that "finds" one face filling most of the image, or nothing.
    struct FakeDetector {
        find: bool,
    }

    impl Detector for FakeDetector {
        fn set_input_size(&mut self, _w: u32, _h: u32) {}

        fn detect(&mut self, image: &BgrImage) -> Result<Vec<FaceBox>> {
            if self.find {
                Ok(vec![FaceBox {
                    x: 1.0,
                    y: 1.0,
                    w: image.width as f32 - 2.0,
                    h: image.height as f32 - 2.0,
                    score: 0.95,
                    landmarks: [[0.0; 2]; 5],
                }])
            } else {
                Ok(Vec::new())
            }
        }
    }

    /// Recognizer producing a constant feature.
    struct FakeRecognizer;

    impl Recognizer for FakeRecognizer {
        fn extract_feature(&mut self, _image: &BgrImage, _face: &FaceBox) -> Result<Vec<f32>> {
            Ok(vec![0.25, 0.5, 0.25])
        }
    }

    fn write_jpeg(path: &Path) {
        let rgb = vec![120u8; 16 * 16 * 3];
        let file = std::fs::File::create(path).unwrap();
        let mut writer = std::io::BufWriter::new(file);
        image::codecs::jpeg::JpegEncoder::new_with_quality(&mut writer, 90)
            .encode(&rgb, 16, 16, image::ExtendedColorType::Rgb8)
            .unwrap();
    }

    fn manager(dir: &Path, find_faces: bool) -> (ConsentManager, Arc<ConsentDatabase>) {
        let database = Arc::new(ConsentDatabase::new());
        let config = ConsentConfig { directory: dir.to_path_buf(), ..Default::default() };
        let manager = ConsentManager::new(
            Arc::clone(&database),
            Box::new(FakeDetector { find: find_faces }),
            Box::new(FakeRecognizer),
            config,
        );
        (manager, database)
    }

    #[test]
    fn startup_loads_existing_files() {
        let dir = tempfile::tempdir().unwrap();
        write_jpeg(&dir.path().join("20250101120000_alice.jpg"));
        write_jpeg(&dir.path().join("20250101120001_bob.jpg"));

        let (mut manager, database) = manager(dir.path(), true);
        manager.load_existing();

        assert_eq!(database.len(), 2);
        assert!(database.is_name_consented("alice"));
        assert!(database.is_name_consented("bob"));
    }

    #[test]
    fn startup_creates_missing_directory() {
        let parent = tempfile::tempdir().unwrap();
        let dir = parent.path().join("captures");
        let (mut manager, database) = manager(&dir, true);
        manager.load_existing();
        assert!(dir.is_dir());
        assert!(database.is_empty());
    }

    #[test]
    fn faceless_image_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_jpeg(&dir.path().join("20250101120000_alice.jpg"));

        let (mut manager, database) = manager(dir.path(), false);
        manager.load_existing();
        assert!(database.is_empty(), "no face → no record");
    }

    #[test]
    fn misnamed_file_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        write_jpeg(&dir.path().join("selfie.jpg"));

        let (mut manager, database) = manager(dir.path(), true);
        manager.load_existing();
        assert!(database.is_empty());
    }

    #[test]
    fn add_and_remove_events_update_database() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, database) = manager(dir.path(), true);
        manager.load_existing();

        let path = dir.path().join("20250101120000_alice.jpg");
        write_jpeg(&path);
        manager.handle_event(WatchEvent::Added(path.clone()));
        assert_eq!(database.len(), 1);
        assert!(database.is_name_consented("alice"));

        manager.handle_event(WatchEvent::Removed(path));
        assert!(database.is_empty());
        assert!(!database.is_name_consented("alice"));
    }

    #[test]
    fn re_add_replaces_by_path() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, database) = manager(dir.path(), true);

        let path = dir.path().join("20250101120000_alice.jpg");
        write_jpeg(&path);
        manager.handle_event(WatchEvent::Added(path.clone()));
        manager.handle_event(WatchEvent::Added(path));
        assert_eq!(database.len(), 1, "same path replaces, not duplicates");
    }

    #[test]
    fn removal_event_for_unknown_path_is_harmless() {
        let dir = tempfile::tempdir().unwrap();
        let (mut manager, database) = manager(dir.path(), true);
        manager.handle_event(WatchEvent::Removed(dir.path().join("missing.jpg")));
        assert!(database.is_empty());
    }
}
