// crates/veilcast-filter/src/consent/capture.rs
//
// Consent capture: crop the largest detected head out of the current frame
// and write it into the consent directory, where the watcher picks it up
// and the manager computes its feature.

use std::path::PathBuf;
use std::sync::Mutex;

use anyhow::{anyhow, Context, Result};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;
use tracing::info;

use veilcast_core::blur::BgrImage;
use veilcast_core::config::ConsentConfig;
use veilcast_core::consent::ConsentFilename;
use veilcast_core::detect::{largest_face, padded_rect, FaceBox};

/// Operator request for a capture from the next frame.
#[derive(Debug, Clone)]
pub struct CaptureRequest {
    pub name: Option<String>,
}

/// Latest-wins request slot, polled by the video worker once per frame.
#[derive(Default)]
pub struct CaptureSlot(Mutex<Option<CaptureRequest>>);

impl CaptureSlot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a capture; an unserviced older request is overwritten.
    pub fn request(&self, request: CaptureRequest) {
        *self.0.lock().unwrap() = Some(request);
    }

    pub fn take(&self) -> Option<CaptureRequest> {
        self.0.lock().unwrap().take()
    }
}

/// Crop the largest face (10% padding, clipped) out of `image` and write it
/// as `<timestamp>_<safe_name|unknown>.jpg`. Returns the path and the face
/// the crop came from.
pub fn save_head_image(
    image: &BgrImage,
    faces: &[FaceBox],
    name: Option<&str>,
    config: &ConsentConfig,
    padding_ratio: f32,
) -> Result<(PathBuf, FaceBox)> {
    let face = largest_face(faces)
        .ok_or_else(|| anyhow!("no faces detected in consent frame, skipping capture"))?
        .clone();

    let rect = padded_rect(&face, image.width, image.height, padding_ratio);
    if rect.is_empty() {
        return Err(anyhow!("face rectangle degenerate after clipping"));
    }
    let head = image.crop(rect);

    let name = name
        .map(veilcast_core::consent::sanitize_name)
        .filter(|n| !n.is_empty())
        .unwrap_or_else(|| "unknown".to_string());
    let filename = ConsentFilename::new(chrono::Local::now().naive_local(), &name);

    std::fs::create_dir_all(&config.directory)
        .with_context(|| format!("create consent dir {}", config.directory.display()))?;
    let path = config.directory.join(filename.format());

    // JPEG wants RGB; the frame is BGR.
    let rgb: Vec<u8> = head
        .data
        .chunks_exact(3)
        .flat_map(|bgr| [bgr[2], bgr[1], bgr[0]])
        .collect();

    let file = std::fs::File::create(&path)
        .with_context(|| format!("create {}", path.display()))?;
    let mut writer = std::io::BufWriter::new(file);
    JpegEncoder::new_with_quality(&mut writer, config.jpeg_quality)
        .encode(&rgb, head.width, head.height, ExtendedColorType::Rgb8)
        .context("encode consent JPEG")?;

    info!(
        path = %path.display(),
        face_w = face.w,
        face_h = face.h,
        "consent head image saved"
    );
    Ok((path, face))
}
