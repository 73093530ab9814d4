//! Brightness/contrast tweaks and the conversion to 1-bit printer images.
//!
//! Factors follow the usual enhancer convention: 1.0 leaves the image alone,
//! values above 1.0 strengthen the effect and values below weaken it.

use std::io::Cursor;

use image::imageops::{self, BiLevel, FilterType};
use image::{DynamicImage, GrayImage, ImageFormat, Luma, Pixel, RgbImage};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Adjust {
    /// Stretch the darkest and lightest greys to full black and white.
    Auto,
    Manual { brightness: f32, contrast: f32 },
}

#[derive(Debug, thiserror::Error)]
pub enum EnhanceError {
    #[error("failed to decode image: {0}")]
    Decode(#[source] image::ImageError),
    #[error("failed to encode image: {0}")]
    Encode(#[source] image::ImageError),
}

pub fn adjust_brightness(img: &RgbImage, factor: f32) -> RgbImage {
    let mut out = img.clone();
    for px in out.pixels_mut() {
        px.apply(|c| scale(c as f32 * factor));
    }
    out
}

pub fn adjust_contrast(img: &GrayImage, factor: f32) -> GrayImage {
    let mean = mean_level(img);
    let mut out = img.clone();
    for px in out.pixels_mut() {
        px.apply(|c| scale(mean + (c as f32 - mean) * factor));
    }
    out
}

/// Map the darkest level to 0 and the lightest to 255.
pub fn autocontrast(img: &GrayImage) -> GrayImage {
    let (lo, hi) = img
        .pixels()
        .fold((u8::MAX, u8::MIN), |(lo, hi), p| (lo.min(p.0[0]), hi.max(p.0[0])));
    if hi <= lo {
        return img.clone();
    }
    let span = (hi - lo) as f32;
    let mut out = img.clone();
    for px in out.pixels_mut() {
        px.apply(|c| scale((c.saturating_sub(lo)) as f32 * 255.0 / span));
    }
    out
}

/// Greyscale, adjust, scale to `width` dots and dither to black and white.
///
/// The result only holds 0 (black) and 255 (white).
pub fn prepare_for_print(img: &DynamicImage, adjust: Adjust, width: u32) -> GrayImage {
    let gray = match adjust {
        Adjust::Auto => autocontrast(&img.to_luma8()),
        Adjust::Manual {
            brightness,
            contrast,
        } => {
            let bright = adjust_brightness(&img.to_rgb8(), brightness);
            adjust_contrast(&DynamicImage::ImageRgb8(bright).to_luma8(), contrast)
        }
    };

    let (w, h) = gray.dimensions();
    let height = ((h as u64 * width as u64) / w.max(1) as u64).max(1) as u32;
    let mut resized = imageops::resize(&gray, width, height, FilterType::Triangle);
    imageops::dither(&mut resized, &BiLevel);
    resized
}

/// Decode a JPEG, brighten it and encode the result as a new JPEG.
pub fn brighten_jpeg(data: &[u8], factor: f32) -> Result<Vec<u8>, EnhanceError> {
    let img = image::load_from_memory(data)
        .map_err(EnhanceError::Decode)?
        .to_rgb8();
    let mut out = Cursor::new(Vec::with_capacity(data.len()));
    adjust_brightness(&img, factor)
        .write_to(&mut out, ImageFormat::Jpeg)
        .map_err(EnhanceError::Encode)?;
    Ok(out.into_inner())
}

fn mean_level(img: &GrayImage) -> f32 {
    let n = img.pixels().len();
    if n == 0 {
        return 0.0;
    }
    let sum: u64 = img.pixels().map(|Luma([c])| *c as u64).sum();
    sum as f32 / n as f32
}

fn scale(v: f32) -> u8 {
    v.round().clamp(0.0, 255.0) as u8
}
