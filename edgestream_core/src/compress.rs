//! Frame compression for delivery to clients.
//!
//! Capture buffers hold packed YUYV 4:2:2, two bytes per pixel.

use crate::capture::Resolution;
use crate::configuration::{CompressionConfiguration, FrameEncoding};
use image::codecs::jpeg::JpegEncoder;
use image::ExtendedColorType;

pub const YUYV_BYTES_PER_PIXEL: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum CompressError {
    #[error("Frame of {actual} bytes is too small for {resolution} YUYV ({expected} bytes)")]
    FrameSize {
        resolution: Resolution,
        expected: usize,
        actual: usize,
    },
    #[error("YUYV frames need an even width, got {0}")]
    OddWidth(u32),
    #[error("JPEG encoding failed: {0}")]
    Encode(#[from] image::ImageError),
}

pub trait FrameCompressor {
    fn compress(&mut self, frame: &[u8], resolution: Resolution) -> Result<Vec<u8>, CompressError>;
}

pub fn compressor(config: &CompressionConfiguration) -> Box<dyn FrameCompressor> {
    match config.encoding {
        FrameEncoding::Jpeg => Box::new(JpegCompressor::new(config.quality)),
        FrameEncoding::Raw => Box::new(RawCompressor),
    }
}

fn check_frame(frame: &[u8], resolution: Resolution) -> Result<usize, CompressError> {
    if resolution.width % 2 != 0 {
        return Err(CompressError::OddWidth(resolution.width));
    }
    let expected = resolution.width as usize * resolution.height as usize * YUYV_BYTES_PER_PIXEL;
    if frame.len() < expected {
        return Err(CompressError::FrameSize {
            resolution,
            expected,
            actual: frame.len(),
        });
    }
    Ok(expected)
}

fn clamp(v: i32) -> u8 {
    v.clamp(0, 255) as u8
}

/// BT.601 limited-range conversion into `rgb`, three bytes per pixel.
pub fn yuyv_to_rgb(yuyv: &[u8], rgb: &mut Vec<u8>) {
    rgb.clear();
    rgb.reserve(yuyv.len() / 2 * 3);
    for px in yuyv.chunks_exact(4) {
        let d = px[1] as i32 - 128;
        let e = px[3] as i32 - 128;
        for y in [px[0], px[2]] {
            let c = 298 * (y as i32 - 16);
            rgb.push(clamp((c + 409 * e + 128) >> 8));
            rgb.push(clamp((c - 100 * d - 208 * e + 128) >> 8));
            rgb.push(clamp((c + 516 * d + 128) >> 8));
        }
    }
}

pub struct JpegCompressor {
    quality: u8,
    rgb: Vec<u8>,
}

impl JpegCompressor {
    pub fn new(quality: u8) -> Self {
        Self {
            quality: quality.clamp(1, 100),
            rgb: Vec::new(),
        }
    }
}

impl FrameCompressor for JpegCompressor {
    fn compress(&mut self, frame: &[u8], resolution: Resolution) -> Result<Vec<u8>, CompressError> {
        let len = check_frame(frame, resolution)?;
        yuyv_to_rgb(&frame[..len], &mut self.rgb);
        let mut out = Vec::with_capacity(len / 4);
        JpegEncoder::new_with_quality(&mut out, self.quality).encode(
            &self.rgb,
            resolution.width,
            resolution.height,
            ExtendedColorType::Rgb8,
        )?;
        Ok(out)
    }
}

/// Ships the YUYV bytes untouched.
pub struct RawCompressor;

impl FrameCompressor for RawCompressor {
    fn compress(&mut self, frame: &[u8], resolution: Resolution) -> Result<Vec<u8>, CompressError> {
        let len = check_frame(frame, resolution)?;
        Ok(frame[..len].to_vec())
    }
}
