use image::GrayImage;
use ndarray::prelude::*;
use ndarray::Zip;

use crate::errors::{Result, SegError};

/// Per-pixel winning class ids, indexed `[y, x]`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LabelGrid {
    ids: Array2<u32>,
}

impl LabelGrid {
    pub fn new(ids: Array2<u32>) -> Self {
        Self { ids }
    }

    pub fn width(&self) -> u32 {
        self.ids.ncols() as u32
    }

    pub fn height(&self) -> u32 {
        self.ids.nrows() as u32
    }

    pub fn dimensions(&self) -> (u32, u32) {
        (self.width(), self.height())
    }

    pub fn get(&self, x: u32, y: u32) -> Option<u32> {
        self.ids.get((y as usize, x as usize)).copied()
    }

    pub fn as_array(&self) -> ArrayView2<'_, u32> {
        self.ids.view()
    }

    /// Pixel count per class id; ids `>= classes` are not counted.
    pub fn class_counts(&self, classes: usize) -> Vec<usize> {
        let mut counts = vec![0; classes];
        for &id in &self.ids {
            if let Some(count) = counts.get_mut(id as usize) {
                *count += 1;
            }
        }
        counts
    }

    /// Reads back a grid written by [`crate::colorize::to_raw_label_bitmap`].
    pub fn from_raw_label_bitmap(raw: &GrayImage) -> Self {
        let (width, height) = raw.dimensions();
        let ids = Array2::from_shape_fn((height as usize, width as usize), |(y, x)| {
            raw.get_pixel(x as u32, y as u32).0[0] as u32
        });
        Self { ids }
    }
}

/// Reduces a `[1, C, H, W]` score tensor to a `[H, W]` grid of arg-max class ids.
///
/// Ties go to the lowest class index. NaN compares above every number, so the
/// first NaN in a lane wins, as in torch's `argmax`.
pub fn reduce(output: Array4<f32>, classes: usize) -> Result<LabelGrid> {
    let shape = output.shape().to_vec();
    if shape[0] != 1 || shape[1] != classes || classes == 0 {
        return Err(SegError::InvalidOutput {
            expected: format!("[1, {classes}, H, W]"),
            actual: shape,
        });
    }

    let scores = output.index_axis_move(Axis(0), 0);
    let mut ids = Array2::<u32>::zeros((scores.dim().1, scores.dim().2));

    Zip::from(&mut ids)
        .and(scores.lanes(Axis(0)))
        .par_for_each(|id, lane| *id = argmax(lane));

    Ok(LabelGrid { ids })
}

fn argmax(lane: ArrayView1<f32>) -> u32 {
    let mut best = 0;
    let mut best_score = f32::NEG_INFINITY;
    for (class_id, &score) in lane.iter().enumerate() {
        if score.is_nan() {
            return class_id as u32;
        }
        if score > best_score {
            best = class_id;
            best_score = score;
        }
    }
    best as u32
}
