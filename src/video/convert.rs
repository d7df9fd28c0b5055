//! Pixel format conversion
//!
//! Everything between the capture device and the encoder works on RGB24. The
//! device delivers YUYV or MJPEG, the H264 encoder wants planar I420.

use image::imageops::{self, FilterType};
use image::{ImageFormat, RgbImage};

use crate::error::{AppError, Result};
use crate::video::format::{PixelFormat, Resolution};

/// Decode one captured buffer into RGB24
///
/// Returns the pixels and the resolution actually found in the buffer, which
/// for MJPEG may differ from what the device was asked for.
pub fn to_rgb24(data: &[u8], format: PixelFormat, resolution: Resolution) -> Result<(Vec<u8>, Resolution)> {
    match format {
        PixelFormat::Mjpeg => mjpeg_to_rgb24(data),
        PixelFormat::Yuyv => Ok((yuyv_to_rgb24(data, resolution)?, resolution)),
        PixelFormat::Rgb24 => {
            let expected = resolution.pixels() as usize * 3;
            if data.len() < expected {
                return Err(AppError::VideoError(format!(
                    "RGB24 buffer too small: {} < {}",
                    data.len(),
                    expected
                )));
            }
            Ok((data[..expected].to_vec(), resolution))
        }
    }
}

/// Decode an MJPEG frame
pub fn mjpeg_to_rgb24(data: &[u8]) -> Result<(Vec<u8>, Resolution)> {
    let image = image::load_from_memory_with_format(data, ImageFormat::Jpeg)
        .map_err(|e| AppError::VideoError(format!("MJPEG decode failed: {}", e)))?
        .to_rgb8();
    let resolution = Resolution::new(image.width(), image.height());
    Ok((image.into_raw(), resolution))
}

/// Convert packed YUYV 4:2:2 to RGB24 (BT.601, limited range)
pub fn yuyv_to_rgb24(data: &[u8], resolution: Resolution) -> Result<Vec<u8>> {
    let pixels = resolution.pixels() as usize;
    if data.len() < pixels * 2 {
        return Err(AppError::VideoError(format!(
            "YUYV buffer too small for {}: {} bytes",
            resolution,
            data.len()
        )));
    }

    let mut rgb = Vec::with_capacity(pixels * 3);
    for chunk in data[..pixels * 2].chunks_exact(4) {
        let u = chunk[1] as i32 - 128;
        let v = chunk[3] as i32 - 128;
        for y in [chunk[0], chunk[2]] {
            let c = (y as i32 - 16).max(0) * 298;
            rgb.push(clamp_u8((c + 409 * v + 128) >> 8));
            rgb.push(clamp_u8((c - 100 * u - 208 * v + 128) >> 8));
            rgb.push(clamp_u8((c + 516 * u + 128) >> 8));
        }
    }
    Ok(rgb)
}

/// Convert RGB24 to planar I420 (BT.601)
///
/// Chroma is averaged over each 2x2 block. Width and height must be even.
pub fn rgb24_to_i420(rgb: &[u8], resolution: Resolution) -> Result<Vec<u8>> {
    let w = resolution.width as usize;
    let h = resolution.height as usize;
    if w % 2 != 0 || h % 2 != 0 {
        return Err(AppError::VideoError(format!(
            "I420 needs even dimensions, got {}",
            resolution
        )));
    }
    if rgb.len() < w * h * 3 {
        return Err(AppError::VideoError(format!(
            "RGB24 buffer too small for {}: {} bytes",
            resolution,
            rgb.len()
        )));
    }

    let y_size = w * h;
    let c_size = (w / 2) * (h / 2);
    let mut out = vec![0u8; y_size + 2 * c_size];
    let (y_plane, chroma) = out.split_at_mut(y_size);
    let (u_plane, v_plane) = chroma.split_at_mut(c_size);

    for row in 0..h {
        for col in 0..w {
            let i = (row * w + col) * 3;
            let (r, g, b) = (rgb[i] as i32, rgb[i + 1] as i32, rgb[i + 2] as i32);
            y_plane[row * w + col] = clamp_u8(((66 * r + 129 * g + 25 * b + 128) >> 8) + 16);
        }
    }

    for row in 0..h / 2 {
        for col in 0..w / 2 {
            let (mut r, mut g, mut b) = (0i32, 0i32, 0i32);
            for (dy, dx) in [(0, 0), (0, 1), (1, 0), (1, 1)] {
                let i = ((row * 2 + dy) * w + col * 2 + dx) * 3;
                r += rgb[i] as i32;
                g += rgb[i + 1] as i32;
                b += rgb[i + 2] as i32;
            }
            let (r, g, b) = (r / 4, g / 4, b / 4);
            let c = row * (w / 2) + col;
            u_plane[c] = clamp_u8(((-38 * r - 74 * g + 112 * b + 128) >> 8) + 128);
            v_plane[c] = clamp_u8(((112 * r - 94 * g - 18 * b + 128) >> 8) + 128);
        }
    }

    Ok(out)
}

/// Scale an RGB24 image
pub fn resize_rgb24(rgb: &[u8], from: Resolution, to: Resolution) -> Result<Vec<u8>> {
    if from == to {
        return Ok(rgb.to_vec());
    }
    let expected = from.pixels() as usize * 3;
    let source = RgbImage::from_raw(from.width, from.height, rgb[..expected.min(rgb.len())].to_vec())
        .ok_or_else(|| {
            AppError::VideoError(format!(
                "RGB24 buffer does not match {}: {} bytes",
                from,
                rgb.len()
            ))
        })?;
    Ok(imageops::resize(&source, to.width, to.height, FilterType::Triangle).into_raw())
}

#[inline]
fn clamp_u8(value: i32) -> u8 {
    value.clamp(0, 255) as u8
}
