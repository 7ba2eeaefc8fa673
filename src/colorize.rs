use image::{DynamicImage, GrayImage, Luma, Rgba, RgbaImage};
use imageproc::map::map_colors2;

use crate::catalog::Palette;
use crate::errors::{Result, SegError};
use crate::postprocess::LabelGrid;

/// Paints every pixel with its class color.
///
/// Ids the palette does not cover are painted with the palette background.
pub fn colorize(grid: &LabelGrid, palette: &Palette) -> RgbaImage {
    let ids = grid.as_array();
    RgbaImage::from_fn(grid.width(), grid.height(), |x, y| {
        palette.color(ids[[y as usize, x as usize]])
    })
}

/// Single-channel image whose pixel values are the class ids themselves.
pub fn to_raw_label_bitmap(grid: &LabelGrid) -> GrayImage {
    let ids = grid.as_array();
    GrayImage::from_fn(grid.width(), grid.height(), |x, y| {
        let id = ids[[y as usize, x as usize]];
        Luma([u8::try_from(id).unwrap_or(u8::MAX)])
    })
}

/// Alpha-blends `overlay` over `base`; `opacity` scales the overlay alpha.
pub fn composite(base: &DynamicImage, overlay: &RgbaImage, opacity: f32) -> Result<RgbaImage> {
    let base = base.to_rgba8();
    if base.dimensions() != overlay.dimensions() {
        return Err(SegError::invalid_image(format!(
            "overlay is {:?} but base image is {:?}",
            overlay.dimensions(),
            base.dimensions()
        )));
    }

    let opacity = opacity.clamp(0.0, 1.0);
    Ok(map_colors2(&base, overlay, |under, over| {
        blend(under, over, opacity)
    }))
}

fn blend(under: Rgba<u8>, over: Rgba<u8>, opacity: f32) -> Rgba<u8> {
    let alpha = f32::from(over[3]) / 255.0 * opacity;
    let mix = |u: u8, o: u8| (f32::from(o) * alpha + f32::from(u) * (1.0 - alpha)).round() as u8;
    Rgba([
        mix(under[0], over[0]),
        mix(under[1], over[1]),
        mix(under[2], over[2]),
        under[3],
    ])
}
