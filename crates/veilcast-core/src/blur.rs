// crates/veilcast-core/src/blur.rs
//
// BGR pixel buffer plus the in-place region Gaussian blur applied to face
// rectangles. The blur is separable (horizontal then vertical pass) with the
// kernel sigma derived from kernel size the same way OpenCV does for
// GaussianBlur(ksize, sigma=0), so outputs line up with the source system.

use rayon::prelude::*;

use crate::detect::Rect;

/// Packed BGR24 image: rows are exactly `width * 3` bytes, no stride padding.
#[derive(Debug, Clone, PartialEq)]
pub struct BgrImage {
    pub data:   Vec<u8>,
    pub width:  u32,
    pub height: u32,
}

impl BgrImage {
    pub fn new(data: Vec<u8>, width: u32, height: u32) -> Self {
        debug_assert_eq!(data.len(), width as usize * height as usize * 3);
        Self { data, width, height }
    }

    pub fn black(width: u32, height: u32) -> Self {
        Self { data: vec![0; width as usize * height as usize * 3], width, height }
    }

    pub fn row_bytes(&self) -> usize {
        self.width as usize * 3
    }

    /// Copy out the pixels of `rect` as a standalone image. Used by consent
    /// capture for the head crop.
    pub fn crop(&self, rect: Rect) -> BgrImage {
        let w = rect.width() as usize;
        let h = rect.height() as usize;
        let mut data = Vec::with_capacity(w * h * 3);
        let row_bytes = self.row_bytes();
        for row in rect.y1 as usize..rect.y1 as usize + h {
            let start = row * row_bytes + rect.x1 as usize * 3;
            data.extend_from_slice(&self.data[start..start + w * 3]);
        }
        BgrImage::new(data, rect.width(), rect.height())
    }
}

/// 1-D Gaussian kernel of `size` taps with OpenCV's sigma-from-ksize rule:
/// sigma = 0.3 * ((size - 1) * 0.5 - 1) + 0.8.
fn gaussian_kernel(size: usize) -> Vec<f32> {
    debug_assert!(size % 2 == 1, "kernel size must be odd");
    let sigma = 0.3 * ((size as f32 - 1.0) * 0.5 - 1.0) + 0.8;
    let center = (size / 2) as f32;
    let mut kernel: Vec<f32> = (0..size)
        .map(|i| {
            let d = i as f32 - center;
            (-d * d / (2.0 * sigma * sigma)).exp()
        })
        .collect();
    let sum: f32 = kernel.iter().sum();
    for v in &mut kernel {
        *v /= sum;
    }
    kernel
}

/// Reflect-101 border index: -1 maps to 1, `len` maps to `len - 2`. The
/// mirror does not repeat the edge sample, matching cv2.GaussianBlur's
/// default border mode.
fn reflect_101(idx: isize, len: usize) -> usize {
    let n = len as isize;
    if n <= 1 {
        return 0;
    }
    let period = 2 * (n - 1);
    let mut i = idx % period;
    if i < 0 {
        i += period;
    }
    if i >= n {
        i = period - i;
    }
    i as usize
}

/// Gaussian-blur `rect` of `image` in place with a `kernel_size` square
/// kernel. Pixels outside the rectangle are untouched. Samples beyond the
/// rectangle edge mirror back into the ROI (reflect-101), so the result is
/// the same as blurring an extracted ROI with cv2's default border and
/// writing it back.
pub fn blur_region(image: &mut BgrImage, rect: Rect, kernel_size: u32) {
    if rect.is_empty() {
        return;
    }
    let kernel = gaussian_kernel(kernel_size as usize | 1);
    let radius = kernel.len() / 2;

    let rw = rect.width() as usize;
    let rh = rect.height() as usize;
    let row_bytes = image.row_bytes();
    let x0 = rect.x1 as usize;
    let y0 = rect.y1 as usize;

    // Copy the ROI out once; both passes then work on packed buffers.
    let mut roi = vec![0f32; rw * rh * 3];
    for row in 0..rh {
        let src = (y0 + row) * row_bytes + x0 * 3;
        for (dst, &byte) in roi[row * rw * 3..(row + 1) * rw * 3]
            .iter_mut()
            .zip(&image.data[src..src + rw * 3])
        {
            *dst = byte as f32;
        }
    }

    // Horizontal pass, rows in parallel.
    let mut mid = vec![0f32; rw * rh * 3];
    mid.par_chunks_mut(rw * 3).enumerate().for_each(|(row, out_row)| {
        let in_row = &roi[row * rw * 3..(row + 1) * rw * 3];
        for x in 0..rw {
            let mut acc = [0f32; 3];
            for (k, &weight) in kernel.iter().enumerate() {
                let sx = reflect_101(x as isize + k as isize - radius as isize, rw);
                for c in 0..3 {
                    acc[c] += weight * in_row[sx * 3 + c];
                }
            }
            out_row[x * 3..x * 3 + 3].copy_from_slice(&acc);
        }
    });

    // Vertical pass, rows in parallel (reads whole columns from `mid`).
    let mut out = vec![0f32; rw * rh * 3];
    out.par_chunks_mut(rw * 3).enumerate().for_each(|(y, out_row)| {
        for x in 0..rw {
            let mut acc = [0f32; 3];
            for (k, &weight) in kernel.iter().enumerate() {
                let sy = reflect_101(y as isize + k as isize - radius as isize, rh);
                for c in 0..3 {
                    acc[c] += weight * mid[sy * rw * 3 + x * 3 + c];
                }
            }
            out_row[x * 3..x * 3 + 3].copy_from_slice(&acc);
        }
    });

    // Write the blurred ROI back.
    for row in 0..rh {
        let dst = (y0 + row) * row_bytes + x0 * 3;
        for (byte, &v) in image.data[dst..dst + rw * 3]
            .iter_mut()
            .zip(&out[row * rw * 3..(row + 1) * rw * 3])
        {
            *byte = v.round().clamp(0.0, 255.0) as u8;
        }
    }
}
