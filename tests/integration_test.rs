use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Barrier};
use std::thread;
use std::time::Duration;

use image::{DynamicImage, Luma, Rgb, RgbImage, Rgba};
use ndarray::{Array4, ArrayView4};
use tempfile::TempDir;

use cyto_seg::catalog::TRANSPARENT;
use cyto_seg::mocks::MockLoader;
use cyto_seg::{
    bitmap_from_raw, colorize, prepare, reduce, to_raw_label_bitmap, ClassCatalog, Device,
    HandleState, LabelGrid, ModelHandle, ModelLoader, ModelLocator, Palette, Predictor, SegError,
    SegmentationModel, Segmenter, WarmUpOutcome,
};

// Engine stand-in that always returns the same score tensor.
struct FixedOutputLoader {
    output: Array4<f32>,
    runs: Arc<AtomicUsize>,
}

struct FixedOutputModel {
    output: Array4<f32>,
    runs: Arc<AtomicUsize>,
}

struct FixedOutputPredictor<'a> {
    model: &'a FixedOutputModel,
}

impl ModelLoader for FixedOutputLoader {
    type Model = FixedOutputModel;

    fn load(&self, _locator: &ModelLocator, _device: Device) -> cyto_seg::Result<FixedOutputModel> {
        Ok(FixedOutputModel {
            output: self.output.clone(),
            runs: Arc::clone(&self.runs),
        })
    }
}

impl SegmentationModel for FixedOutputModel {
    type Predictor<'a> = FixedOutputPredictor<'a>;

    fn predictor(&self) -> cyto_seg::Result<FixedOutputPredictor<'_>> {
        Ok(FixedOutputPredictor { model: self })
    }
}

impl Predictor for FixedOutputPredictor<'_> {
    fn predict(&mut self, input: ArrayView4<f32>) -> cyto_seg::Result<Array4<f32>> {
        assert_eq!(input.shape()[1], 3);
        self.model.runs.fetch_add(1, Ordering::SeqCst);
        Ok(self.model.output.clone())
    }
}

fn locator() -> ModelLocator {
    ModelLocator::File("voc.onnx".into())
}

fn fixed_segmenter(output: Array4<f32>) -> (Segmenter<FixedOutputLoader>, Arc<AtomicUsize>) {
    let runs = Arc::new(AtomicUsize::new(0));
    let loader = FixedOutputLoader {
        output,
        runs: Arc::clone(&runs),
    };
    let handle = Arc::new(ModelHandle::new(loader, locator(), Device::Cpu));
    (Segmenter::with_defaults(handle), runs)
}

#[test]
fn test_all_background_image() -> cyto_seg::Result<()> {
    let mut output = Array4::<f32>::zeros((1, 21, 4, 4));
    output
        .slice_mut(ndarray::s![0, 0, .., ..])
        .fill(0.9);
    let (segmenter, runs) = fixed_segmenter(output);

    let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));
    let result = segmenter.segment(&image)?;

    assert!(result.labels.as_array().iter().all(|&id| id == 0));
    assert!(result.overlay.pixels().all(|p| *p == TRANSPARENT));
    assert!(result.raw.pixels().all(|p| *p == Luma([0])));
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    Ok(())
}

#[test]
fn test_single_hot_pixel() -> cyto_seg::Result<()> {
    let mut output = Array4::<f32>::zeros((1, 21, 4, 4));
    output
        .slice_mut(ndarray::s![0, 0, .., ..])
        .fill(0.5);
    output[[0, 7, 0, 0]] = 0.8;
    let (segmenter, _) = fixed_segmenter(output);

    let image = DynamicImage::ImageRgb8(RgbImage::from_pixel(4, 4, Rgb([40, 80, 120])));
    let result = segmenter.segment(&image)?;

    assert_eq!(result.labels.get(0, 0), Some(7));
    assert_eq!(result.labels.get(1, 0), Some(0));
    assert_eq!(
        result.overlay.get_pixel(0, 0),
        &segmenter.palette().color(7)
    );
    assert_eq!(result.raw.get_pixel(0, 0), &Luma([7]));
    assert_eq!(segmenter.catalog().detected(&result.labels), vec!["car"]);
    Ok(())
}

#[test]
fn test_output_size_mismatch_fails() {
    let (segmenter, _) = fixed_segmenter(Array4::<f32>::zeros((1, 21, 2, 2)));
    let image = DynamicImage::ImageRgb8(RgbImage::new(4, 4));

    let err = segmenter.segment(&image).unwrap_err();
    assert!(matches!(err, SegError::InvalidOutput { .. }));
}

#[test]
fn test_concurrent_ensure_ready_loads_once() {
    let handle = Arc::new(ModelHandle::new(
        MockLoader::new(21).with_delay(Duration::from_millis(50)),
        locator(),
        Device::Cpu,
    ));
    let callers = 16;
    let barrier = Arc::new(Barrier::new(callers));

    let threads: Vec<_> = (0..callers)
        .map(|_| {
            let handle = Arc::clone(&handle);
            let barrier = Arc::clone(&barrier);
            thread::spawn(move || {
                barrier.wait();
                handle.ensure_ready().map(|_| handle.state())
            })
        })
        .collect();

    for thread in threads {
        assert_eq!(thread.join().unwrap().unwrap(), HandleState::Ready);
    }
    assert_eq!(handle.loader().loads(), 1);
    assert_eq!(handle.load_attempts(), 1);
}

#[test]
fn test_concurrent_segment_calls() {
    let handle = Arc::new(ModelHandle::new(
        MockLoader::new(21)
            .with_delay(Duration::from_millis(20))
            .with_hotspot(1, 1, 12),
        locator(),
        Device::Cpu,
    ));
    let segmenter = Arc::new(Segmenter::with_defaults(handle));

    let threads: Vec<_> = (0..8u32)
        .map(|i| {
            let segmenter = Arc::clone(&segmenter);
            thread::spawn(move || {
                let image = DynamicImage::ImageRgb8(RgbImage::new(3 + i, 2 + i));
                segmenter.segment(&image)
            })
        })
        .collect();

    for (i, thread) in threads.into_iter().enumerate() {
        let result = thread.join().unwrap().unwrap();
        assert_eq!(result.overlay.dimensions(), (3 + i as u32, 2 + i as u32));
        assert_eq!(result.labels.get(1, 1), Some(12));
    }
    assert_eq!(segmenter.handle().load_attempts(), 1);
}

#[test]
fn test_warm_up_then_segment() -> cyto_seg::Result<()> {
    let handle = Arc::new(ModelHandle::new(
        MockLoader::new(21).with_delay(Duration::from_millis(30)),
        locator(),
        Device::Cpu,
    ));
    let segmenter = Segmenter::with_defaults(Arc::clone(&handle));

    assert_eq!(segmenter.warm_up().wait(), WarmUpOutcome::Ready);
    segmenter.segment(&DynamicImage::ImageRgb8(RgbImage::new(2, 2)))?;
    assert_eq!(handle.load_attempts(), 1);
    Ok(())
}

#[test]
fn test_cancelled_warm_up_leaves_handle_usable() -> cyto_seg::Result<()> {
    let handle = Arc::new(ModelHandle::new(MockLoader::new(21), locator(), Device::Cpu));
    let warm_up = handle.warm_up();
    warm_up.cancel();

    let outcome = warm_up.wait();
    assert!(matches!(
        outcome,
        WarmUpOutcome::Cancelled | WarmUpOutcome::Ready
    ));
    handle.ensure_ready()?;
    assert_eq!(handle.state(), HandleState::Ready);
    assert_eq!(handle.load_attempts(), 1);
    Ok(())
}

#[test]
fn test_stage_functions_compose() -> cyto_seg::Result<()> {
    let image = bitmap_from_raw(3, 2, 1, vec![0, 64, 128, 192, 255, 32])?;
    let tensor = prepare(&image)?;
    assert_eq!(tensor.shape(), &[1, 3, 2, 3]);

    let mut scores = Array4::<f32>::zeros((1, 21, 2, 3));
    scores[[0, 20, 1, 2]] = 1.0;
    let grid = reduce(scores, 21)?;

    let overlay = colorize(&grid, &Palette::neon(21));
    assert_eq!(overlay.get_pixel(2, 1), &Rgba([255, 0, 255, 255]));
    assert_eq!(overlay.get_pixel(0, 0), &TRANSPARENT);
    Ok(())
}

#[test]
fn test_raw_label_file_round_trip() -> cyto_seg::Result<()> {
    let temp_dir = TempDir::new()?;
    let path = temp_dir.path().join("labels.png");
    let grid = LabelGrid::new(ndarray::Array2::from_shape_fn((5, 7), |(y, x)| {
        ((x + y * 7) % 21) as u32
    }));

    to_raw_label_bitmap(&grid).save(&path)?;
    let read_back = image::open(&path)?.to_luma8();
    assert_eq!(LabelGrid::from_raw_label_bitmap(&read_back), grid);
    Ok(())
}

#[test]
fn test_custom_catalog_with_short_palette() -> cyto_seg::Result<()> {
    let catalog = ClassCatalog::new(["background", "nucleus", "membrane"]).unwrap();
    let palette = Palette::new(vec![TRANSPARENT, Rgba([0, 255, 0, 255])]).unwrap();
    let handle = Arc::new(ModelHandle::new(
        MockLoader::new(3).with_hotspot(0, 0, 2).with_hotspot(1, 0, 1),
        locator(),
        Device::Cpu,
    ));
    let segmenter = Segmenter::new(handle, catalog, palette);

    let result = segmenter.segment(&DynamicImage::ImageRgb8(RgbImage::new(2, 1)))?;
    assert_eq!(result.labels.get(0, 0), Some(2));
    assert_eq!(result.overlay.get_pixel(0, 0), &TRANSPARENT);
    assert_eq!(result.overlay.get_pixel(1, 0), &Rgba([0, 255, 0, 255]));
    Ok(())
}
