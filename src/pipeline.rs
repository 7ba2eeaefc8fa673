use std::sync::Arc;
use std::time::Instant;

use image::{DynamicImage, GenericImageView, GrayImage, RgbaImage};
use tracing::{debug, info, warn};

use crate::catalog::{ClassCatalog, Palette};
use crate::colorize::{colorize, to_raw_label_bitmap};
use crate::errors::{Result, SegError};
use crate::handle::{ModelHandle, WarmUp};
use crate::postprocess::{reduce, LabelGrid};
use crate::preprocess::prepare;
use crate::traits::ModelLoader;

/// Everything one segmentation call produces.
#[derive(Debug, Clone)]
pub struct Segmentation {
    pub labels: LabelGrid,
    pub overlay: RgbaImage,
    pub raw: GrayImage,
}

/// Runs bitmaps through preprocessing, the model, arg-max and colorization.
///
/// Cheap to share between threads; every call is independent.
pub struct Segmenter<L: ModelLoader> {
    handle: Arc<ModelHandle<L>>,
    catalog: ClassCatalog,
    palette: Palette,
}

impl<L: ModelLoader> Segmenter<L> {
    pub fn new(handle: Arc<ModelHandle<L>>, catalog: ClassCatalog, palette: Palette) -> Self {
        if !palette.covers(&catalog) {
            warn!(
                classes = catalog.len(),
                colors = palette.len(),
                "palette is shorter than the class catalog, uncovered classes render as background"
            );
        }
        Self {
            handle,
            catalog,
            palette,
        }
    }

    /// VOC classes painted with the standard palette.
    pub fn with_defaults(handle: Arc<ModelHandle<L>>) -> Self {
        Self::new(handle, ClassCatalog::voc(), Palette::standard())
    }

    pub fn handle(&self) -> &Arc<ModelHandle<L>> {
        &self.handle
    }

    pub fn catalog(&self) -> &ClassCatalog {
        &self.catalog
    }

    pub fn palette(&self) -> &Palette {
        &self.palette
    }

    /// Starts loading the model in the background.
    pub fn warm_up(&self) -> WarmUp {
        self.handle.warm_up()
    }

    pub fn segment(&self, image: &DynamicImage) -> Result<Segmentation> {
        let started = Instant::now();
        let labels = self.label(image)?;
        let overlay = colorize(&labels, &self.palette);
        let raw = to_raw_label_bitmap(&labels);
        debug!(elapsed = ?started.elapsed(), "segmentation finished");

        Ok(Segmentation {
            labels,
            overlay,
            raw,
        })
    }

    pub fn segment_overlay(&self, image: &DynamicImage) -> Result<RgbaImage> {
        let labels = self.label(image)?;
        Ok(colorize(&labels, &self.palette))
    }

    /// Produces the class-id grid for `image`.
    pub fn label(&self, image: &DynamicImage) -> Result<LabelGrid> {
        let tensor = prepare(image)?;
        self.handle.ensure_ready()?;
        let output = self.handle.infer(tensor.view())?;
        let labels = reduce(output, self.catalog.len())?;

        let (width, height) = image.dimensions();
        if labels.dimensions() != (width, height) {
            return Err(SegError::InvalidOutput {
                expected: format!("[1, {}, {height}, {width}]", self.catalog.len()),
                actual: vec![
                    1,
                    self.catalog.len(),
                    labels.height() as usize,
                    labels.width() as usize,
                ],
            });
        }

        info!(detected = ?self.catalog.detected(&labels), "segmentation classes");
        Ok(labels)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::TRANSPARENT;
    use crate::handle::HandleState;
    use crate::mocks::MockLoader;
    use crate::traits::{Device, ModelLocator};
    use image::RgbImage;

    fn segmenter(loader: MockLoader) -> Segmenter<MockLoader> {
        let handle = Arc::new(ModelHandle::new(
            loader,
            ModelLocator::File("mock.onnx".into()),
            Device::Cpu,
        ));
        Segmenter::with_defaults(handle)
    }

    fn black(width: u32, height: u32) -> DynamicImage {
        DynamicImage::ImageRgb8(RgbImage::new(width, height))
    }

    #[test]
    fn test_segment_loads_lazily() -> Result<()> {
        let segmenter = segmenter(MockLoader::new(21));
        assert_eq!(segmenter.handle().state(), HandleState::Unloaded);

        segmenter.segment(&black(3, 2))?;
        segmenter.segment(&black(3, 2))?;
        assert_eq!(segmenter.handle().state(), HandleState::Ready);
        assert_eq!(segmenter.handle().load_attempts(), 1);
        Ok(())
    }

    #[test]
    fn test_segment_outputs_match_input_size() -> Result<()> {
        let segmenter = segmenter(MockLoader::new(21).with_hotspot(2, 1, 15));
        let result = segmenter.segment(&black(5, 3))?;

        assert_eq!(result.overlay.dimensions(), (5, 3));
        assert_eq!(result.raw.dimensions(), (5, 3));
        assert_eq!(result.labels.get(2, 1), Some(15));
        assert_eq!(result.overlay.get_pixel(2, 1), &segmenter.palette().color(15));
        assert_eq!(result.overlay.get_pixel(0, 0), &TRANSPARENT);
        Ok(())
    }

    #[test]
    fn test_segment_overlay_matches_segment() -> Result<()> {
        let segmenter = segmenter(MockLoader::new(21).with_hotspot(0, 0, 3));
        let image = black(4, 4);
        assert_eq!(
            segmenter.segment_overlay(&image)?,
            segmenter.segment(&image)?.overlay
        );
        Ok(())
    }

    #[test]
    fn test_invalid_image_skips_model() {
        let segmenter = segmenter(MockLoader::new(21));
        let err = segmenter.segment(&black(0, 0)).unwrap_err();

        assert!(matches!(err, SegError::InvalidImage { .. }));
        assert_eq!(segmenter.handle().load_attempts(), 0);
    }

    #[test]
    fn test_wrong_class_count_fails_whole_call() {
        let segmenter = segmenter(MockLoader::new(21).with_output_classes(5));
        let err = segmenter.segment(&black(2, 2)).unwrap_err();
        assert!(matches!(err, SegError::InvalidOutput { .. }));
    }

    #[test]
    fn test_load_failure_propagates() {
        let segmenter = segmenter(MockLoader::new(21).failing(1));
        let err = segmenter.segment(&black(2, 2)).unwrap_err();
        assert!(matches!(err, SegError::ModelLoad { .. }));
    }

    #[test]
    fn test_inference_failure_propagates() {
        let segmenter = segmenter(MockLoader::new(21).failing_inference());
        let err = segmenter.segment(&black(2, 2)).unwrap_err();
        assert!(matches!(err, SegError::Inference { .. }));
    }
}
