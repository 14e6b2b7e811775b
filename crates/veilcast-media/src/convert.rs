// crates/veilcast-media/src/convert.rs
//
// Pixel-format conversion between decoded frames and packed BGR buffers.
// Scalers are cached and rebuilt only when the source geometry changes, so
// a mid-stream resolution switch costs one rebuild rather than a crash.

use anyhow::{anyhow, Result};

use ffmpeg_the_third as ffmpeg;
use ffmpeg::format::Pixel;
use ffmpeg::software::scaling::{context::Context as SwsContext, flag::Flags};

use veilcast_core::blur::BgrImage;

/// Decoded frame (any pixel format) → packed BGR24.
pub struct FrameToBgr {
    scaler: Option<SwsContext>,
    /// (width, height, format) the cached scaler was built for.
    geometry: Option<(u32, u32, Pixel)>,
}

impl FrameToBgr {
    pub fn new() -> Self {
        Self { scaler: None, geometry: None }
    }

    pub fn convert(&mut self, frame: &ffmpeg::frame::Video) -> Result<BgrImage> {
        let geometry = (frame.width(), frame.height(), frame.format());
        if self.geometry != Some(geometry) {
            self.scaler = Some(SwsContext::get(
                frame.format(), frame.width(), frame.height(),
                Pixel::BGR24,   frame.width(), frame.height(),
                Flags::BILINEAR,
            )?);
            self.geometry = Some(geometry);
        }
        let scaler = self.scaler.as_mut().expect("scaler built above");

        let mut bgr = ffmpeg::frame::Video::empty();
        scaler.run(frame, &mut bgr)?;

        // Destripe: copy only visible pixels, not stride padding.
        let (w, h) = (frame.width() as usize, frame.height() as usize);
        let stride = bgr.stride(0);
        let raw    = bgr.data(0);
        let row_bytes = w * 3;
        let data: Vec<u8> = (0..h)
            .flat_map(|row| &raw[row * stride..row * stride + row_bytes])
            .copied()
            .collect();

        Ok(BgrImage::new(data, frame.width(), frame.height()))
    }
}

impl Default for FrameToBgr {
    fn default() -> Self {
        Self::new()
    }
}

/// Packed BGR24 → YUV420P frame for the H.264 encoder.
pub struct BgrToYuv {
    scaler:   Option<SwsContext>,
    geometry: Option<(u32, u32)>,
}

impl BgrToYuv {
    pub fn new() -> Self {
        Self { scaler: None, geometry: None }
    }

    pub fn convert(&mut self, image: &BgrImage, pts: Option<i64>) -> Result<ffmpeg::frame::Video> {
        if image.width < 2 || image.height < 2 {
            return Err(anyhow!("frame too small: {}x{}", image.width, image.height));
        }
        let geometry = (image.width, image.height);
        if self.geometry != Some(geometry) {
            self.scaler = Some(SwsContext::get(
                Pixel::BGR24,   image.width, image.height,
                Pixel::YUV420P, image.width, image.height,
                Flags::BILINEAR,
            )?);
            self.geometry = Some(geometry);
        }
        let scaler = self.scaler.as_mut().expect("scaler built above");

        // Wrap the packed buffer in a BGR24 frame, honoring the frame's
        // stride (libav pads rows for alignment).
        let mut bgr = ffmpeg::frame::Video::new(Pixel::BGR24, image.width, image.height);
        let stride = bgr.stride(0);
        let row_bytes = image.row_bytes();
        {
            let dst = bgr.data_mut(0);
            for row in 0..image.height as usize {
                dst[row * stride..row * stride + row_bytes]
                    .copy_from_slice(&image.data[row * row_bytes..(row + 1) * row_bytes]);
            }
        }

        let mut yuv = ffmpeg::frame::Video::empty();
        scaler.run(&bgr, &mut yuv)?;
        yuv.set_pts(pts);
        Ok(yuv)
    }
}

impl Default for BgrToYuv {
    fn default() -> Self {
        Self::new()
    }
}
