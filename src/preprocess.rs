use image::{DynamicImage, GenericImageView, GrayAlphaImage, GrayImage, RgbImage, RgbaImage};
use ndarray::prelude::*;
use nshare::AsNdarray3;

use crate::errors::{Result, SegError};

/// ImageNet channel statistics the segmentation backbones were trained with.
pub const MEAN: [f32; 3] = [0.485, 0.456, 0.406];
pub const STD: [f32; 3] = [0.229, 0.224, 0.225];

/// Converts a bitmap into a normalized `[1, 3, H, W]` tensor.
///
/// Alpha is dropped and grayscale is replicated across the three channels.
/// The image is used at its native resolution.
pub fn prepare(image: &DynamicImage) -> Result<Array4<f32>> {
    let (width, height) = image.dimensions();
    if width == 0 || height == 0 {
        return Err(SegError::invalid_image(format!(
            "image must be at least 1x1, got {width}x{height}"
        )));
    }

    let rgb = image.to_rgb8();
    let mut tensor = rgb.as_ndarray3().mapv(|v| f32::from(v) / 255.0);
    for ((mut channel, mean), std) in tensor.outer_iter_mut().zip(MEAN).zip(STD) {
        channel.mapv_inplace(|v| (v - mean) / std);
    }

    Ok(tensor
        .as_standard_layout()
        .into_owned()
        .insert_axis(Axis(0)))
}

/// Wraps a raw interleaved 8-bit pixel buffer handed over by a viewer.
///
/// Supported channel counts are 1 (gray), 2 (gray + alpha), 3 (RGB) and
/// 4 (RGBA).
pub fn bitmap_from_raw(
    width: u32,
    height: u32,
    channels: u8,
    pixels: Vec<u8>,
) -> Result<DynamicImage> {
    if width == 0 || height == 0 {
        return Err(SegError::invalid_image(format!(
            "image must be at least 1x1, got {width}x{height}"
        )));
    }
    if !(1..=4).contains(&channels) {
        return Err(SegError::invalid_image(format!(
            "unsupported channel count: {channels}"
        )));
    }

    let expected = width as usize * height as usize * channels as usize;
    if pixels.len() != expected {
        return Err(SegError::invalid_image(format!(
            "pixel buffer holds {} bytes, expected {expected} for {width}x{height}x{channels}",
            pixels.len()
        )));
    }

    let image = match channels {
        1 => GrayImage::from_raw(width, height, pixels).map(DynamicImage::ImageLuma8),
        2 => GrayAlphaImage::from_raw(width, height, pixels).map(DynamicImage::ImageLumaA8),
        3 => RgbImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgb8),
        _ => RgbaImage::from_raw(width, height, pixels).map(DynamicImage::ImageRgba8),
    };
    image.ok_or_else(|| SegError::invalid_image("pixel buffer does not match dimensions"))
}
